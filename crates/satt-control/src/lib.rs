//! The named-variable control surface an external transport layer would
//! bridge to real process variables (spec §1 "the control-system transport
//! itself is out of scope"; §3 "ControlSurface state"). This crate models
//! only the typed record and its validation, grounded in
//! `caproto/db/system.py`'s `SystemGroup` and `caproto/db/filters.py`'s
//! `FilterGroup` putter validation.

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ControlError {
    #[error("transmission must be between 0 and 1, got {0}")]
    InvalidTransmission(f64),
    #[error("thickness must be positive, got {0}")]
    InvalidThickness(f64),
    #[error("material {0:?} is not in the catalog")]
    InvalidMaterial(String),
    #[error("blade index {0} out of range")]
    BadBladeIndex(usize),
}

fn validate_transmission(value: f64) -> Result<(), ControlError> {
    if !(0.0..=1.0).contains(&value) {
        return Err(ControlError::InvalidTransmission(value));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetMode {
    Low,
    High,
}

/// Per-blade metadata mirrored on the control surface (`FilterGroup`):
/// material, thickness, and the operator-visible stuck flag.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterRecord {
    pub material: String,
    pub thickness: f64,
    pub is_stuck: bool,
}

impl FilterRecord {
    pub fn new(material: impl Into<String>, thickness: f64) -> Result<Self, ControlError> {
        let material = material.into();
        if thickness <= 0.0 {
            return Err(ControlError::InvalidThickness(thickness));
        }
        Ok(Self {
            material,
            thickness,
            is_stuck: false,
        })
    }
}

/// The `SystemGroup`-equivalent set of system-spanning named variables, plus
/// the per-blade `FilterGroup` records, all in one in-process model.
#[derive(Debug, Clone)]
pub struct ControlSurface {
    ev: f64,
    t_actual: f64,
    t_high: f64,
    t_low: f64,
    t_desired: f64,
    t_3omega: f64,
    run: bool,
    running: bool,
    mirror_in: bool,
    locked: bool,
    set_mode: SetMode,
    /// Set when a bracket boundary clamped to the attainable extremum instead
    /// of genuinely bracketing `t_desired` (spec §4.4.2).
    boundary_clamped: bool,
    /// Set when a commit aborted after a partial insert phase (spec §4.4.3
    /// step 6).
    partial_insert: bool,
    filters: Vec<FilterRecord>,
    known_materials: Vec<String>,
}

impl ControlSurface {
    pub fn new(filters: Vec<FilterRecord>, known_materials: Vec<String>) -> Self {
        Self {
            ev: 0.0,
            t_actual: 0.0,
            t_high: 0.0,
            t_low: 0.0,
            t_desired: 0.0,
            t_3omega: 0.0,
            run: false,
            running: false,
            mirror_in: false,
            locked: false,
            set_mode: SetMode::Low,
            boundary_clamped: false,
            partial_insert: false,
            filters,
            known_materials,
        }
    }

    pub fn ev(&self) -> f64 {
        self.ev
    }

    pub fn set_ev(&mut self, value: f64) {
        self.ev = value;
    }

    pub fn boundary_clamped(&self) -> bool {
        self.boundary_clamped
    }

    pub fn set_boundary_clamped(&mut self, value: bool) {
        self.boundary_clamped = value;
    }

    pub fn partial_insert(&self) -> bool {
        self.partial_insert
    }

    pub fn set_partial_insert(&mut self, value: bool) {
        self.partial_insert = value;
    }

    pub fn blade_count(&self) -> usize {
        self.filters.len()
    }

    pub fn filter(&self, index: usize) -> Result<&FilterRecord, ControlError> {
        self.filters.get(index).ok_or(ControlError::BadBladeIndex(index))
    }

    pub fn t_actual(&self) -> f64 {
        self.t_actual
    }

    pub fn t_high(&self) -> f64 {
        self.t_high
    }

    pub fn t_low(&self) -> f64 {
        self.t_low
    }

    pub fn t_desired(&self) -> f64 {
        self.t_desired
    }

    pub fn t_3omega(&self) -> f64 {
        self.t_3omega
    }

    pub fn run(&self) -> bool {
        self.run
    }

    pub fn running(&self) -> bool {
        self.running
    }

    pub fn mirror_in(&self) -> bool {
        self.mirror_in
    }

    pub fn locked(&self) -> bool {
        self.locked
    }

    pub fn set_mode(&self) -> SetMode {
        self.set_mode
    }

    /// Write `t_desired`. Returns whether the value actually changed, so the
    /// caller (the engine's reactive loop) can decide whether to emit a
    /// retrigger event for a no-op write.
    pub fn set_t_desired(&mut self, value: f64) -> Result<bool, ControlError> {
        validate_transmission(value)?;
        let changed = self.t_desired != value;
        self.t_desired = value;
        Ok(changed)
    }

    pub fn set_t_actual(&mut self, value: f64) -> Result<(), ControlError> {
        validate_transmission(value)?;
        self.t_actual = value;
        Ok(())
    }

    pub fn set_t_high(&mut self, value: f64) -> Result<(), ControlError> {
        validate_transmission(value)?;
        self.t_high = value;
        Ok(())
    }

    pub fn set_t_low(&mut self, value: f64) -> Result<(), ControlError> {
        validate_transmission(value)?;
        self.t_low = value;
        Ok(())
    }

    pub fn set_t_3omega(&mut self, value: f64) -> Result<(), ControlError> {
        validate_transmission(value)?;
        self.t_3omega = value;
        Ok(())
    }

    /// Write `run`. A rising edge (false -> true) is what the engine reacts
    /// to (spec §5 "run rising edge"); a falling or repeated write is not.
    pub fn set_run(&mut self, value: bool) -> bool {
        let rising_edge = value && !self.run;
        self.run = value;
        rising_edge
    }

    pub fn set_running(&mut self, value: bool) {
        self.running = value;
    }

    pub fn set_mirror_in(&mut self, value: bool) {
        self.mirror_in = value;
    }

    pub fn set_locked(&mut self, value: bool) -> bool {
        let changed = self.locked != value;
        self.locked = value;
        changed
    }

    pub fn set_set_mode(&mut self, mode: SetMode) -> bool {
        let changed = self.set_mode != mode;
        self.set_mode = mode;
        changed
    }

    pub fn set_material(&mut self, index: usize, material: impl Into<String>) -> Result<(), ControlError> {
        let material = material.into();
        if !self.known_materials.iter().any(|m| m == &material) {
            return Err(ControlError::InvalidMaterial(material));
        }
        let record = self
            .filters
            .get_mut(index)
            .ok_or(ControlError::BadBladeIndex(index))?;
        record.material = material;
        Ok(())
    }

    pub fn set_thickness(&mut self, index: usize, thickness: f64) -> Result<(), ControlError> {
        if thickness <= 0.0 {
            return Err(ControlError::InvalidThickness(thickness));
        }
        let record = self
            .filters
            .get_mut(index)
            .ok_or(ControlError::BadBladeIndex(index))?;
        record.thickness = thickness;
        Ok(())
    }

    pub fn set_is_stuck(&mut self, index: usize, stuck: bool) -> Result<bool, ControlError> {
        let record = self
            .filters
            .get_mut(index)
            .ok_or(ControlError::BadBladeIndex(index))?;
        let changed = record.is_stuck != stuck;
        record.is_stuck = stuck;
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn surface() -> ControlSurface {
        let filters = vec![
            FilterRecord::new("Si", 0.1).unwrap(),
            FilterRecord::new("C", 0.2).unwrap(),
        ];
        ControlSurface::new(filters, vec!["Si".into(), "C".into()])
    }

    #[test]
    fn rejects_out_of_range_transmission() {
        let mut cs = surface();
        let err = cs.set_t_desired(1.5).unwrap_err();
        assert_eq!(err, ControlError::InvalidTransmission(1.5));
        let err = cs.set_t_desired(-0.1).unwrap_err();
        assert_eq!(err, ControlError::InvalidTransmission(-0.1));
    }

    #[test]
    fn set_t_desired_reports_change() {
        let mut cs = surface();
        assert!(cs.set_t_desired(0.5).unwrap());
        assert!(!cs.set_t_desired(0.5).unwrap());
    }

    #[test]
    fn run_edge_detected_only_on_rising_transition() {
        let mut cs = surface();
        assert!(cs.set_run(true));
        assert!(!cs.set_run(true));
        assert!(!cs.set_run(false));
        assert!(cs.set_run(true));
    }

    #[test]
    fn rejects_unknown_material() {
        let mut cs = surface();
        let err = cs.set_material(0, "Au").unwrap_err();
        assert_eq!(err, ControlError::InvalidMaterial("Au".into()));
    }

    #[test]
    fn rejects_non_positive_thickness() {
        let mut cs = surface();
        let err = cs.set_thickness(0, 0.0).unwrap_err();
        assert_eq!(err, ControlError::InvalidThickness(0.0));
    }

    #[test]
    fn bad_blade_index_reported() {
        let mut cs = surface();
        assert_eq!(
            cs.set_thickness(5, 0.1).unwrap_err(),
            ControlError::BadBladeIndex(5)
        );
    }

    #[test]
    fn is_stuck_reports_change() {
        let mut cs = surface();
        assert!(cs.set_is_stuck(0, true).unwrap());
        assert!(!cs.set_is_stuck(0, true).unwrap());
    }
}
