//! The enumeration of all 2^N on/off blade patterns, and bracket search over
//! the transmissions they produce.
//!
//! Spec §9 redesign flag: the source represents a retracted blade as a NaN
//! cell and reduces each row with a NaN-skipping product. That is a clean
//! dynamic-language convention but an awkward fit for a statically typed
//! target, so [`RowPattern`] is a plain bitset (bit i set == blade i
//! inserted) and [`RowPattern::transmission`] multiplies only the set bits —
//! equivalent semantics, no sentinel floats.

use thiserror::Error;

/// Maximum blade count this crate supports. The spec bounds N <= 20 (§1) so
/// a pattern fits in a `u32`.
pub const MAX_BLADES: usize = 20;

/// One on/off pattern across all blades: bit `i` set means blade `i` is
/// requested inserted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RowPattern(u32);

impl RowPattern {
    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn is_inserted(self, blade: usize) -> bool {
        (self.0 >> blade) & 1 == 1
    }

    /// `nanprod(C[r] . T_hat)` restated without NaN: multiply the
    /// single-blade transmissions of every inserted, non-skipped blade.
    /// `transmissions[i] == None` means blade `i` is stuck and contributes a
    /// transparent factor of 1 regardless of what this row requests for it
    /// (the physically-correct "stuck-retracted is beam-clear" reading the
    /// spec fixes in §9).
    pub fn transmission(self, n: usize, transmissions: &[Option<f64>]) -> f64 {
        let mut t = 1.0;
        for i in 0..n {
            if self.is_inserted(i)
                && let Some(t_i) = transmissions[i]
            {
                t *= t_i;
            }
        }
        t
    }
}

/// Per-blade actuation constraint used to mask infeasible rows out of the
/// search (spec §4.4.2). A stuck blade fixes its bit; everything else is
/// free to be requested either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BladeConstraint {
    Free,
    /// The blade is stuck and must be requested at `inserted`.
    Fixed { inserted: bool },
}

impl RowPattern {
    /// Whether this row is compatible with every blade's constraint.
    pub fn feasible(self, n: usize, constraints: &[BladeConstraint]) -> bool {
        (0..n).all(|i| match constraints[i] {
            BladeConstraint::Free => true,
            BladeConstraint::Fixed { inserted } => self.is_inserted(i) == inserted,
        })
    }
}

/// The full 2^N x N enumeration.
#[derive(Debug, Clone)]
pub struct ConfigurationSet {
    n: usize,
    rows: Vec<RowPattern>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigSetError {
    #[error("blade count {0} exceeds the supported maximum of {MAX_BLADES}")]
    TooManyBlades(usize),
    #[error("row {index} has {actual} columns, expected {expected}")]
    RowWidthMismatch {
        index: usize,
        expected: usize,
        actual: usize,
    },
}

impl ConfigurationSet {
    /// Build the full Cartesian-product enumeration in-process (spec §3
    /// "lazy-built at first reactive call").
    pub fn enumerate(n: usize) -> Result<Self, ConfigSetError> {
        if n > MAX_BLADES {
            return Err(ConfigSetError::TooManyBlades(n));
        }
        let total = 1u32 << n;
        let rows = (0..total).map(RowPattern::from_bits).collect();
        Ok(Self { n, rows })
    }

    /// Build from externally persisted `{1.0, NaN}` cells (spec §6
    /// "Persisted state": a `2^N x N` matrix of {1.0, NaN}), the alternate
    /// load path for environments that pre-generate the enumeration file
    /// the way `original_source/configurations.py` does.
    pub fn from_nan_cells(n: usize, cells: &[Vec<f64>]) -> Result<Self, ConfigSetError> {
        if n > MAX_BLADES {
            return Err(ConfigSetError::TooManyBlades(n));
        }
        let mut rows = Vec::with_capacity(cells.len());
        for (index, row) in cells.iter().enumerate() {
            if row.len() != n {
                return Err(ConfigSetError::RowWidthMismatch {
                    index,
                    expected: n,
                    actual: row.len(),
                });
            }
            let mut bits = 0u32;
            for (i, cell) in row.iter().enumerate() {
                if !cell.is_nan() {
                    bits |= 1 << i;
                }
            }
            rows.push(RowPattern::from_bits(bits));
        }
        Ok(Self { n, rows })
    }

    pub fn blade_count(&self) -> usize {
        self.n
    }

    pub fn rows(&self) -> &[RowPattern] {
        &self.rows
    }
}

/// Result of [`bracket_search`].
#[derive(Debug, Clone, Copy)]
pub struct Bracket {
    pub low: Option<(RowPattern, f64)>,
    pub high: Option<(RowPattern, f64)>,
}

impl Bracket {
    /// True when neither side reached the attainable extremum instead of
    /// genuinely bracketing `t_des` (spec §4.4.2 "a boundary flag SHOULD be
    /// published").
    pub fn is_boundary_clamped(&self) -> bool {
        self.low.is_none() || self.high.is_none()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BracketError {
    #[error("no feasible configuration exists given the current stuck-blade constraints")]
    InfeasibleTarget,
}

/// Find the two feasible rows whose transmissions most tightly bracket
/// `t_des` (spec §4.4.2, steps 1-8).
pub fn bracket_search(
    set: &ConfigurationSet,
    transmissions: &[Option<f64>],
    constraints: &[BladeConstraint],
    t_des: f64,
) -> Result<Bracket, BracketError> {
    let n = set.blade_count();
    let mut sorted: Vec<(f64, RowPattern)> = set
        .rows()
        .iter()
        .filter(|row| row.feasible(n, constraints))
        .map(|&row| (row.transmission(n, transmissions), row))
        .collect();

    if sorted.is_empty() {
        return Err(BracketError::InfeasibleTarget);
    }

    sorted.sort_by(|a, b| {
        a.0.total_cmp(&b.0)
            .then_with(|| a.1.bits().cmp(&b.1.bits()))
    });

    let idx_le = sorted.partition_point(|(t, _)| *t <= t_des);

    let bracket = if idx_le == 0 {
        let (t, row) = sorted[0];
        Bracket {
            low: None,
            high: Some((row, t)),
        }
    } else if idx_le == sorted.len() {
        let (t, row) = sorted[sorted.len() - 1];
        Bracket {
            low: Some((row, t)),
            high: None,
        }
    } else {
        let (t_low, row_low) = sorted[idx_le - 1];
        if t_low == t_des {
            Bracket {
                low: Some((row_low, t_low)),
                high: Some((row_low, t_low)),
            }
        } else {
            let (t_high, row_high) = sorted[idx_le];
            Bracket {
                low: Some((row_low, t_low)),
                high: Some((row_high, t_high)),
            }
        }
    };
    Ok(bracket)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enumerate_has_2_pow_n_rows_and_one_all_retracted() {
        let set = ConfigurationSet::enumerate(3).unwrap();
        assert_eq!(set.rows().len(), 8);
        assert!(set.rows().iter().any(|r| r.bits() == 0));
    }

    #[test]
    fn transmission_skips_stuck_blade_as_transparent() {
        let set = ConfigurationSet::enumerate(1).unwrap();
        let row = set.rows().iter().find(|r| r.is_inserted(0)).unwrap();
        let t = row.transmission(1, &[None]);
        assert_eq!(t, 1.0);
    }

    #[test]
    fn too_many_blades_rejected() {
        let err = ConfigurationSet::enumerate(21).unwrap_err();
        assert_eq!(err, ConfigSetError::TooManyBlades(21));
    }

    fn three_blade_fixture() -> (ConfigurationSet, Vec<Option<f64>>) {
        // d = [0.1, 0.2, 0.4], mu = 1.0/m, matching the spec's concrete scenario 3.
        let set = ConfigurationSet::enumerate(3).unwrap();
        let transmissions = vec![
            Some((-0.1f64).exp()),
            Some((-0.2f64).exp()),
            Some((-0.4f64).exp()),
        ];
        (set, transmissions)
    }

    #[test]
    fn bracket_search_matches_spec_scenario_3() {
        let (set, transmissions) = three_blade_fixture();
        let constraints = vec![BladeConstraint::Free; 3];
        let bracket = bracket_search(&set, &transmissions, &constraints, 0.5).unwrap();
        let (row_high, t_high) = bracket.high.unwrap();
        let (row_low, t_low) = bracket.low.unwrap();
        assert!((t_high - 0.5488).abs() < 1e-3, "T_high={t_high}");
        assert!((t_low - 0.4966).abs() < 1e-3, "T_low={t_low}");
        assert!(row_high.is_inserted(1) && row_high.is_inserted(2) && !row_high.is_inserted(0));
        assert!(row_low.is_inserted(0) && row_low.is_inserted(1) && row_low.is_inserted(2));
    }

    #[test]
    fn bracket_search_masks_infeasible_rows() {
        let (set, transmissions) = three_blade_fixture();
        // blade 1 stuck retracted: any row requesting it inserted is infeasible.
        let constraints = vec![
            BladeConstraint::Free,
            BladeConstraint::Fixed { inserted: false },
            BladeConstraint::Free,
        ];
        let bracket = bracket_search(&set, &transmissions, &constraints, 0.5).unwrap();
        let (row_low, _) = bracket.low.unwrap();
        let (row_high, _) = bracket.high.unwrap();
        assert!(!row_low.is_inserted(1));
        assert!(!row_high.is_inserted(1));
    }

    #[test]
    fn bracket_search_clamps_below_attainable_minimum() {
        let (set, transmissions) = three_blade_fixture();
        let constraints = vec![BladeConstraint::Free; 3];
        let bracket = bracket_search(&set, &transmissions, &constraints, 0.0).unwrap();
        assert!(bracket.low.is_none());
        assert!(bracket.is_boundary_clamped());
    }

    #[test]
    fn bracket_search_clamps_above_attainable_maximum() {
        let (set, transmissions) = three_blade_fixture();
        let constraints = vec![BladeConstraint::Free; 3];
        let bracket = bracket_search(&set, &transmissions, &constraints, 1.0).unwrap();
        assert!(bracket.high.is_none());
        assert!(bracket.is_boundary_clamped());
    }

    #[test]
    fn bracket_search_exact_match_sets_low_equal_high() {
        let set = ConfigurationSet::enumerate(1).unwrap();
        let transmissions = vec![Some(0.5)];
        let constraints = vec![BladeConstraint::Free];
        let bracket = bracket_search(&set, &transmissions, &constraints, 0.5).unwrap();
        assert_eq!(bracket.low.unwrap().1, bracket.high.unwrap().1);
    }

    #[test]
    fn all_rows_infeasible_reports_error() {
        let set = ConfigurationSet::enumerate(1).unwrap();
        let transmissions = vec![Some(0.5)];
        // No constraint value can simultaneously be Fixed at two different bits for n=1,
        // so construct infeasibility for n=2 instead: impossible pair of fixed opposite values.
        let set2 = ConfigurationSet::enumerate(2).unwrap();
        let transmissions2 = vec![Some(0.5), Some(0.5)];
        // Fix blade 0 inserted and blade 1 retracted -> exactly one row satisfies this,
        // so instead force an impossible combination isn't directly expressible via
        // per-blade Fixed constraints (they're always independently satisfiable by some
        // row), so we verify the empty-enumeration path instead.
        let empty = ConfigurationSet { n: 1, rows: vec![] };
        let err = bracket_search(&empty, &transmissions, &constraints_free(1), 0.5).unwrap_err();
        assert_eq!(err, BracketError::InfeasibleTarget);
        let _ = (set, set2, transmissions2);
    }

    fn constraints_free(n: usize) -> Vec<BladeConstraint> {
        vec![BladeConstraint::Free; n]
    }
}
