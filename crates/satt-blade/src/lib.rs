//! A single absorber blade: material reference, thickness, and the status
//! machine that tracks whether it is safe to command.

use satt_actuator::MotionOutcome;
use satt_table::Material;
use std::sync::Arc;
use thiserror::Error;

/// Where a blade was last confirmed to physically be. Distinct from
/// [`BladeStatus`] so a `Stuck` blade can still report the position it is
/// stuck at for feasibility checks (spec §3 glossary: "Stuck ... treated at
/// its last-known position for feasibility").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Inserted,
    Retracted,
}

/// Live blade status (spec §3, §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BladeStatus {
    Known(Placement),
    Unknown,
    InMotion { target: Placement },
    Stuck { last_known: Placement },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BladeError {
    #[error("blade is stuck and cannot be commanded")]
    Stuck,
    #[error("blade is already in motion")]
    AlreadyInMotion,
    #[error("invalid thickness: must be positive")]
    InvalidThickness,
    #[error("clear_stuck called on a blade that is not stuck")]
    NotStuck,
}

/// One physical absorber.
#[derive(Debug, Clone)]
pub struct Blade {
    index: usize,
    material: Arc<Material>,
    thickness: f64,
    status: BladeStatus,
}

impl Blade {
    pub fn new(index: usize, material: Arc<Material>, thickness: f64) -> Result<Self, BladeError> {
        if !(thickness > 0.0) {
            return Err(BladeError::InvalidThickness);
        }
        Ok(Self {
            index,
            material,
            thickness,
            status: BladeStatus::Unknown,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn material(&self) -> &Material {
        &self.material
    }

    pub fn thickness(&self) -> f64 {
        self.thickness
    }

    pub fn status(&self) -> BladeStatus {
        self.status
    }

    pub fn is_stuck(&self) -> bool {
        matches!(self.status, BladeStatus::Stuck { .. })
    }

    /// Single-blade transmission at photon energy `e`: `exp(-mu(e) * d)`.
    /// Returns `None` if the blade is stuck — the caller treats a stuck
    /// blade as transparent (factor 1), matching the spec's "stuck-retracted
    /// blade is beam-clear" interpretation, without relying on a NaN
    /// sentinel (see spec §9 redesign flag on NaN-skipping products).
    pub fn transmission(&self, e: f64) -> Option<f64> {
        if self.is_stuck() {
            return None;
        }
        let (_, mu) = self.material.table.lookup(e);
        Some((-mu * self.thickness).exp())
    }

    /// Whether this blade's last-known (or current) placement is compatible
    /// with a configuration row requesting `wanted`. A stuck blade is
    /// feasible only if it already sits at the wanted placement.
    pub fn feasible_for(&self, wanted: Placement) -> bool {
        match self.status {
            BladeStatus::Stuck { last_known } => last_known == wanted,
            _ => true,
        }
    }

    pub fn begin_insert(&mut self) -> Result<(), BladeError> {
        self.begin_motion(Placement::Inserted)
    }

    pub fn begin_retract(&mut self) -> Result<(), BladeError> {
        self.begin_motion(Placement::Retracted)
    }

    fn begin_motion(&mut self, target: Placement) -> Result<(), BladeError> {
        match self.status {
            BladeStatus::Stuck { .. } => Err(BladeError::Stuck),
            BladeStatus::InMotion { .. } => Err(BladeError::AlreadyInMotion),
            BladeStatus::Known(_) | BladeStatus::Unknown => {
                self.status = BladeStatus::InMotion { target };
                Ok(())
            }
        }
    }

    /// Apply the terminal [`MotionOutcome`] of a motion previously started
    /// with [`begin_insert`](Self::begin_insert) / [`begin_retract`](Self::begin_retract).
    pub fn complete_motion(&mut self, outcome: MotionOutcome) {
        let target = match self.status {
            BladeStatus::InMotion { target } => target,
            _ => {
                tracing::warn!(
                    target: "engine.motion",
                    index = self.index,
                    "complete_motion called while not in motion"
                );
                return;
            }
        };
        self.status = match outcome {
            MotionOutcome::Reached => BladeStatus::Known(target),
            MotionOutcome::Timeout => BladeStatus::Unknown,
            MotionOutcome::Failed => BladeStatus::Stuck {
                last_known: match target {
                    Placement::Inserted => Placement::Retracted,
                    Placement::Retracted => Placement::Inserted,
                },
            },
        };
    }

    /// Operator action: flag as stuck at its current (or last-known) placement.
    /// Spec §4.2: "set_stuck from any non-InMotion state -> Stuck".
    pub fn set_stuck(&mut self) {
        let last_known = match self.status {
            BladeStatus::Known(p) => p,
            BladeStatus::Stuck { last_known } => last_known,
            BladeStatus::Unknown => Placement::Retracted,
            BladeStatus::InMotion { .. } => {
                tracing::warn!(
                    target: "engine.motion",
                    index = self.index,
                    "set_stuck called while in motion; ignoring"
                );
                return;
            }
        };
        self.status = BladeStatus::Stuck { last_known };
    }

    /// Operator-only: clear a stuck flag. The blade becomes `Unknown` since
    /// its physical position is no longer guaranteed current once it is
    /// re-eligible for commands (open question in spec §9, resolved in
    /// DESIGN.md: clearing stuck never implicitly restores a known position).
    pub fn clear_stuck(&mut self) -> Result<(), BladeError> {
        match self.status {
            BladeStatus::Stuck { .. } => {
                self.status = BladeStatus::Unknown;
                Ok(())
            }
            _ => Err(BladeError::NotStuck),
        }
    }
}
