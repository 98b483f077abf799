//! `Stack`: the reactive loop owner that ties the physics lookup layer, the
//! configuration search, and the actuation state machine together (spec §4.4,
//! §5, §9 "a commit is a small state machine (Idle -> Inserting -> Retracting
//! -> Publishing -> Idle) owned by the loop").

use satt_actuator::{BladeActuator, MotionOutcome};
use satt_blade::{Blade, BladeError, BladeStatus, Placement};
use satt_configset::{BladeConstraint, Bracket, BracketError, ConfigurationSet, RowPattern, bracket_search};
use satt_control::ControlSurface;
use satt_events::Event;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Blade(#[from] BladeError),
    #[error(transparent)]
    Control(#[from] satt_control::ControlError),
    #[error("system is locked")]
    Locked,
    #[error("no feasible configuration for the current stuck-blade constraints")]
    InfeasibleTarget,
    #[error("motion failed or timed out during commit")]
    MotionFailed,
    #[error("run rising edge dropped: commit already in progress")]
    StaleRun,
}

impl From<BracketError> for EngineError {
    fn from(_: BracketError) -> Self {
        EngineError::InfeasibleTarget
    }
}

/// The commit state machine named in spec §9. Idle between commits;
/// Publishing briefly covers the final T_actual/T_3omega recompute before
/// returning to Idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommitState {
    Idle,
    Inserting,
    Retracting,
    Publishing,
}

/// The core engine: N blades, the enumerated configuration table, the
/// control surface they publish through, and the actuator they drive.
pub struct Stack<A: BladeActuator> {
    blades: Vec<Blade>,
    configset: ConfigurationSet,
    control: ControlSurface,
    actuator: Arc<A>,
    motion_timeout: Duration,
    run_clear_retries: u32,
    commit_state: CommitState,
}

impl<A: BladeActuator> Stack<A> {
    pub fn new(
        blades: Vec<Blade>,
        configset: ConfigurationSet,
        control: ControlSurface,
        actuator: Arc<A>,
        motion_timeout: Duration,
        run_clear_retries: u32,
    ) -> Self {
        Self {
            blades,
            configset,
            control,
            actuator,
            motion_timeout,
            run_clear_retries,
            commit_state: CommitState::Idle,
        }
    }

    pub fn control(&self) -> &ControlSurface {
        &self.control
    }

    pub fn blades(&self) -> &[Blade] {
        &self.blades
    }

    fn blade_transmissions(&self, e: f64) -> Vec<Option<f64>> {
        self.blades.iter().map(|b| b.transmission(e)).collect()
    }

    fn blade_constraints(&self) -> Vec<BladeConstraint> {
        self.blades
            .iter()
            .map(|b| match b.status() {
                BladeStatus::Stuck { last_known } => BladeConstraint::Fixed {
                    inserted: last_known == Placement::Inserted,
                },
                _ => BladeConstraint::Free,
            })
            .collect()
    }

    /// The pattern currently physically realized, from each blade's last
    /// confirmed (`Known`) placement.
    fn actual_row(&self) -> RowPattern {
        let mut bits = 0u32;
        for (i, blade) in self.blades.iter().enumerate() {
            if matches!(blade.status(), BladeStatus::Known(Placement::Inserted)) {
                bits |= 1 << i;
            }
        }
        RowPattern::from_bits(bits)
    }

    /// Recompute and publish T_low / T_high against the live E and T_desired
    /// (spec §4.4.2, §4.4.4).
    pub fn recompute_bracket(&mut self) -> Result<Bracket, EngineError> {
        let e = self.control.ev();
        let t_hat = self.blade_transmissions(e);
        let constraints = self.blade_constraints();
        let bracket = bracket_search(&self.configset, &t_hat, &constraints, self.control.t_desired())?;

        self.control.set_boundary_clamped(bracket.is_boundary_clamped());
        if let Some((_, t_low)) = bracket.low {
            self.control.set_t_low(t_low)?;
        }
        if let Some((_, t_high)) = bracket.high {
            self.control.set_t_high(t_high)?;
        }
        Ok(bracket)
    }

    /// Recompute and publish T_actual and T_3omega for the currently
    /// realized pattern (spec §4.4.5).
    fn publish_actual_and_harmonic(&mut self) -> Result<(), EngineError> {
        let e = self.control.ev();
        let row = self.actual_row();
        let n = self.blades.len();

        let t_hat = self.blade_transmissions(e);
        self.control.set_t_actual(row.transmission(n, &t_hat))?;

        let t_hat_3omega = self.blade_transmissions(3.0 * e);
        self.control.set_t_3omega(row.transmission(n, &t_hat_3omega))?;
        Ok(())
    }

    /// `eV` changed: republish T_actual/T_3omega at the new energy, then
    /// recompute the bracket (spec §4.4.4).
    pub fn handle_energy_changed(&mut self, e: f64) -> Result<(), EngineError> {
        self.control.set_ev(e);
        self.publish_actual_and_harmonic()?;
        self.recompute_bracket()?;
        Ok(())
    }

    /// `T_des` changed: recompute and republish the bracket only.
    pub fn handle_target_changed(&mut self, t_des: f64) -> Result<(), EngineError> {
        self.control.set_t_desired(t_des)?;
        self.recompute_bracket()?;
        Ok(())
    }

    pub fn handle_set_mode_changed(&mut self, mode: satt_control::SetMode) {
        self.control.set_set_mode(mode);
    }

    pub fn handle_lock_changed(&mut self, locked: bool) {
        self.control.set_locked(locked);
    }

    /// Operator stuck/unstuck action (spec §9 "must not be revocable
    /// implicitly by a successful motion; require an operator clear
    /// action").
    pub fn handle_stuck_changed(&mut self, index: usize, stuck: bool) -> Result<(), EngineError> {
        if stuck {
            self.blades[index].set_stuck();
        } else {
            self.blades[index].clear_stuck()?;
        }
        self.control.set_is_stuck(index, self.blades[index].is_stuck())?;
        Ok(())
    }

    /// Best-effort clear of the `run` signal (spec §9: "retries run->0 on
    /// publish failure up to 3x... log-only best-effort"). This in-process
    /// control surface cannot itself fail a write, so the retry loop exists
    /// to preserve that intent rather than to recover a real failure mode.
    fn clear_run_best_effort(&mut self) {
        for attempt in 0..=self.run_clear_retries {
            self.control.set_run(false);
            if !self.control.run() {
                return;
            }
            tracing::warn!(target: "engine.commit", attempt, "run signal did not clear, retrying");
        }
        tracing::error!(target: "engine.commit", "failed to clear run signal after retries");
    }

    /// Dispatch the commit procedure on a `run` rising edge (spec §4.4.3).
    /// A second rising edge received while a commit is already in flight is
    /// dropped as `StaleRun` (spec §5).
    pub async fn handle_run_edge(&mut self) -> Result<(), EngineError> {
        if self.commit_state != CommitState::Idle {
            tracing::warn!(target: "engine.commit", "stale run edge dropped");
            return Err(EngineError::StaleRun);
        }
        if self.control.locked() {
            tracing::info!(target: "engine.commit", "commit skipped: system locked");
            self.clear_run_best_effort();
            return Err(EngineError::Locked);
        }

        self.control.set_running(true);
        let result = self.run_commit().await;
        self.commit_state = CommitState::Idle;
        self.control.set_running(false);
        self.clear_run_best_effort();

        match &result {
            Ok(()) => tracing::info!(target: "engine.commit", "commit completed"),
            Err(err) => tracing::warn!(target: "engine.commit", error = %err, "commit aborted"),
        }
        result
    }

    async fn run_commit(&mut self) -> Result<(), EngineError> {
        let bracket = self.recompute_bracket()?;
        let chosen = match self.control.set_mode() {
            satt_control::SetMode::Low => bracket.low.or(bracket.high),
            satt_control::SetMode::High => bracket.high.or(bracket.low),
        };
        let (row, _t) = chosen.ok_or(EngineError::InfeasibleTarget)?;

        let n = self.blades.len();
        let to_insert: Vec<usize> = (0..n)
            .filter(|&i| {
                row.is_inserted(i)
                    && !matches!(self.blades[i].status(), BladeStatus::Known(Placement::Inserted))
                    && !self.blades[i].is_stuck()
            })
            .collect();
        let to_retract: Vec<usize> = (0..n)
            .filter(|&i| {
                !row.is_inserted(i)
                    && !matches!(self.blades[i].status(), BladeStatus::Known(Placement::Retracted))
                    && !self.blades[i].is_stuck()
            })
            .collect();

        self.commit_state = CommitState::Inserting;
        if let Err(err) = self.run_phase(&to_insert, Placement::Inserted).await {
            self.control.set_partial_insert(true);
            return Err(err);
        }

        self.commit_state = CommitState::Retracting;
        self.run_phase(&to_retract, Placement::Retracted).await?;

        self.commit_state = CommitState::Publishing;
        self.publish_actual_and_harmonic()?;
        Ok(())
    }

    /// Issue every command in `indices` toward `target` concurrently, then
    /// wait for all to settle (spec §4.4.3 steps 5/7: batch issue, batch
    /// wait, insert-before-retract).
    async fn run_phase(&mut self, indices: &[usize], target: Placement) -> Result<(), EngineError> {
        for &i in indices {
            match target {
                Placement::Inserted => self.blades[i].begin_insert()?,
                Placement::Retracted => self.blades[i].begin_retract()?,
            }
        }

        let handles: Vec<_> = indices
            .iter()
            .map(|&i| {
                let handle = match target {
                    Placement::Inserted => self.actuator.insert(i),
                    Placement::Retracted => self.actuator.retract(i),
                };
                (i, handle)
            })
            .collect();

        let mut all_reached = true;
        for (i, handle) in handles {
            let outcome = handle.wait(Some(self.motion_timeout)).await;
            self.blades[i].complete_motion(outcome);
            self.control.set_is_stuck(i, self.blades[i].is_stuck())?;
            if outcome != MotionOutcome::Reached {
                all_reached = false;
                tracing::warn!(target: "engine.motion", index = i, ?outcome, "motion did not reach target");
            }
        }

        if all_reached {
            Ok(())
        } else {
            Err(EngineError::MotionFailed)
        }
    }

    /// Drive the reactive loop until the channel closes or a `Shutdown`
    /// event arrives. `MotionSettled` is named in spec §9's event
    /// vocabulary but is not dispatched here: motion completion is awaited
    /// directly inside the commit (the sole suspension point, per spec §5),
    /// which is sufficient under the single-threaded ownership model. See
    /// the design notes for the tradeoff this implies.
    pub async fn run(mut self, mut rx: mpsc::Receiver<Event>) {
        while let Some(event) = rx.recv().await {
            match event {
                Event::EnergyChanged(e) => {
                    if let Err(err) = self.handle_energy_changed(e) {
                        tracing::warn!(target: "engine.bracket", error = %err, "energy refresh failed");
                    }
                }
                Event::TargetChanged(t) => {
                    if let Err(err) = self.handle_target_changed(t) {
                        tracing::warn!(target: "engine.bracket", error = %err, "target refresh failed");
                    }
                }
                Event::SetModeChanged(mode) => {
                    self.handle_set_mode_changed(match mode {
                        satt_events::SetMode::Low => satt_control::SetMode::Low,
                        satt_events::SetMode::High => satt_control::SetMode::High,
                    });
                }
                Event::RunEdge => {
                    if let Err(err) = self.handle_run_edge().await {
                        tracing::info!(target: "engine.commit", error = %err, "run edge not committed");
                    }
                }
                Event::MotionSettled { .. } => {}
                Event::StuckChanged { index, stuck } => {
                    if let Err(err) = self.handle_stuck_changed(index, stuck) {
                        tracing::warn!(target: "engine.commit", error = %err, index, "stuck change rejected");
                    }
                }
                Event::LockChanged(locked) => self.handle_lock_changed(locked),
                Event::Shutdown => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use satt_actuator::ProcessModel;
    use satt_control::FilterRecord;
    use satt_table::{AbsorptionRow, AbsorptionTable, Material};

    fn material() -> Arc<Material> {
        let rows = (0..=1000)
            .map(|i| AbsorptionRow {
                e: 1000.0 + i as f64,
                f2: 0.0,
                mu: 1.0,
            })
            .collect();
        let table = AbsorptionTable::from_rows(rows).unwrap();
        Arc::new(Material::new("Test", 0, 1.0, 1.0, table))
    }

    fn three_blade_stack() -> Stack<ProcessModel> {
        let mat = material();
        let blades = vec![
            Blade::new(0, mat.clone(), 0.1).unwrap(),
            Blade::new(1, mat.clone(), 0.2).unwrap(),
            Blade::new(2, mat.clone(), 0.4).unwrap(),
        ];
        let configset = ConfigurationSet::enumerate(3).unwrap();
        let filters = vec![
            FilterRecord::new("Test", 0.1).unwrap(),
            FilterRecord::new("Test", 0.2).unwrap(),
            FilterRecord::new("Test", 0.4).unwrap(),
        ];
        let mut control = ControlSurface::new(filters, vec!["Test".into()]);
        control.set_ev(1500.0);
        let actuator = Arc::new(ProcessModel::new());
        Stack::new(
            blades,
            configset,
            control,
            actuator,
            Duration::from_millis(200),
            3,
        )
    }

    #[test]
    fn bracket_matches_spec_scenario_3() {
        let mut stack = three_blade_stack();
        stack.control.set_t_desired(0.5).unwrap();
        let bracket = stack.recompute_bracket().unwrap();
        let (_, t_high) = bracket.high.unwrap();
        let (_, t_low) = bracket.low.unwrap();
        assert!((t_high - 0.5488).abs() < 1e-3);
        assert!((t_low - 0.4966).abs() < 1e-3);
        assert_eq!(stack.control().t_high(), t_high);
        assert_eq!(stack.control().t_low(), t_low);
    }

    #[tokio::test]
    async fn commit_set_mode_low_inserts_all_three() {
        let mut stack = three_blade_stack();
        stack.control.set_t_desired(0.5).unwrap();
        stack.handle_run_edge().await.unwrap();
        for blade in stack.blades() {
            assert_eq!(blade.status(), BladeStatus::Known(Placement::Inserted));
        }
        assert!(!stack.control().running());
        assert!((stack.control().t_actual() - 0.4966).abs() < 1e-3);
    }

    #[tokio::test]
    async fn commit_set_mode_high_retracts_blade_one() {
        let mut stack = three_blade_stack();
        stack.control.set_t_desired(0.5).unwrap();
        stack.handle_set_mode_changed(satt_control::SetMode::High);
        stack.handle_run_edge().await.unwrap();
        assert_eq!(stack.blades()[0].status(), BladeStatus::Known(Placement::Retracted));
        assert_eq!(stack.blades()[1].status(), BladeStatus::Known(Placement::Inserted));
        assert_eq!(stack.blades()[2].status(), BladeStatus::Known(Placement::Inserted));
    }

    #[tokio::test]
    async fn locked_prevents_commit() {
        let mut stack = three_blade_stack();
        stack.control.set_t_desired(0.5).unwrap();
        stack.handle_lock_changed(true);
        let err = stack.handle_run_edge().await.unwrap_err();
        assert!(matches!(err, EngineError::Locked));
        assert!(!stack.control().running());
        for blade in stack.blades() {
            assert_eq!(blade.status(), BladeStatus::Unknown);
        }
    }

    #[tokio::test]
    async fn stale_run_dropped_while_commit_in_progress() {
        let mut stack = three_blade_stack();
        stack.commit_state = CommitState::Inserting;
        let err = stack.handle_run_edge().await.unwrap_err();
        assert!(matches!(err, EngineError::StaleRun));
    }

    #[test]
    fn stuck_blade_masks_infeasible_rows_scenario_5() {
        let mut stack = three_blade_stack();
        stack.control.set_t_desired(0.5).unwrap();
        stack.handle_stuck_changed(1, true).unwrap();
        let bracket = stack.recompute_bracket().unwrap();
        let (row_low, _) = bracket.low.unwrap();
        let (row_high, _) = bracket.high.unwrap();
        assert!(!row_low.is_inserted(1));
        assert!(!row_high.is_inserted(1));
    }
}
