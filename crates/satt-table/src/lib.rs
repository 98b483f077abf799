//! Per-material absorption tables on a uniform photon-energy grid.
//!
//! A [`Material`] carries its physical constants and an [`AbsorptionTable`]:
//! a uniformly-spaced lookup from photon energy (eV) to the linear
//! absorption coefficient mu. Uniform spacing lets lookup be a single
//! arithmetic index instead of a binary search.

use thiserror::Error;

/// Classical electron radius, Planck's constant, speed of light, Avogadro's
/// number — used by [`AbsorptionTable::from_f2_table`] to derive mu from a
/// raw atomic scattering-factor column.
pub mod constants {
    pub const R0_M: f64 = 2.8719e-15;
    pub const H_JS: f64 = 6.626176e-34;
    pub const C_M_S: f64 = 2.9979e8;
    pub const N_A: f64 = 6.022e23;
}

#[derive(Debug, Error, PartialEq)]
pub enum TableError {
    #[error("absorption table is not uniformly spaced: {reason}")]
    BadTable { reason: String },
}

/// One row of an [`AbsorptionTable`]: photon energy, scattering factor f2
/// (retained for provenance; not consulted at lookup time), and the linear
/// absorption coefficient.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AbsorptionRow {
    pub e: f64,
    pub f2: f64,
    pub mu: f64,
}

/// Uniformly-spaced photon-energy absorption table for a single material.
///
/// Invariant: `rows` is sorted by `e`, strictly monotonic, and spaced by
/// `e_inc` to within `1e-6 * e_inc`. This is checked once at construction so
/// that [`lookup`](Self::lookup) can index arithmetically.
#[derive(Debug, Clone, PartialEq)]
pub struct AbsorptionTable {
    e_min: f64,
    e_inc: f64,
    rows: Vec<AbsorptionRow>,
}

impl AbsorptionTable {
    /// Build from an explicit `{E, f2, mu}` row matrix (the direct loader
    /// named in the spec's AbsorptionTable.load operation).
    pub fn from_rows(rows: Vec<AbsorptionRow>) -> Result<Self, TableError> {
        if rows.len() < 2 {
            return Err(Self::bad_table("fewer than two rows".to_string()));
        }
        for row in &rows {
            if !row.mu.is_finite() {
                return Err(Self::bad_table(format!("non-finite mu at E={}", row.e)));
            }
        }
        let e_min = rows[0].e;
        let e_inc = rows[1].e - rows[0].e;
        if e_inc <= 0.0 {
            return Err(Self::bad_table("E column is not strictly increasing".to_string()));
        }
        let tol = 1e-6 * e_inc;
        for (i, row) in rows.iter().enumerate() {
            let expected = e_min + (i as f64) * e_inc;
            if (row.e - expected).abs() > tol {
                return Err(Self::bad_table(format!(
                    "row {i} at E={} deviates from uniform grid (expected {expected})",
                    row.e
                )));
            }
        }
        tracing::debug!(target: "config", rows = rows.len(), e_min, e_inc, "absorption table loaded");
        Ok(Self {
            e_min,
            e_inc,
            rows,
        })
    }

    /// Build from a raw atomic scattering-factor column `{E, f2}` plus the
    /// material constants, deriving mu the way `original_source/filter_data.py`
    /// does: `mu = (2*r0*h*c*f2/E) * rho * (N_A/A)`.
    pub fn from_f2_table(
        e_f2: &[(f64, f64)],
        atomic_weight_g: f64,
        density_g_cm3: f64,
    ) -> Result<Self, TableError> {
        use constants::{C_M_S, H_JS, N_A, R0_M};
        let rows = e_f2
            .iter()
            .map(|&(e, f2)| {
                let mu = (2.0 * R0_M * H_JS * C_M_S * f2 / e) * density_g_cm3 * (N_A / atomic_weight_g);
                AbsorptionRow { e, f2, mu }
            })
            .collect();
        Self::from_rows(rows)
    }

    fn bad_table(reason: String) -> TableError {
        tracing::warn!(target: "config", reason = %reason, "rejecting absorption table");
        TableError::BadTable { reason }
    }

    pub fn e_min(&self) -> f64 {
        self.e_min
    }

    pub fn e_max(&self) -> f64 {
        self.e_min + self.e_inc * ((self.rows.len() - 1) as f64)
    }

    pub fn e_inc(&self) -> f64 {
        self.e_inc
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Nearest-grid-point lookup: `i = clamp(round((E - e_min) / e_inc), 0, M-1)`.
    /// Out-of-range requests clamp to the first or last row.
    pub fn lookup(&self, e: f64) -> (f64, f64) {
        let raw_index = ((e - self.e_min) / self.e_inc).round();
        let last = (self.rows.len() - 1) as f64;
        let index = raw_index.clamp(0.0, last) as usize;
        let row = &self.rows[index];
        (row.e, row.mu)
    }
}

/// Immutable material reference: chemical formula, atomic constants, and
/// its absorption table.
#[derive(Debug, Clone, PartialEq)]
pub struct Material {
    pub formula: String,
    pub z: u32,
    pub atomic_weight_g: f64,
    pub density_g_cm3: f64,
    pub table: AbsorptionTable,
}

impl Material {
    pub fn new(
        formula: impl Into<String>,
        z: u32,
        atomic_weight_g: f64,
        density_g_cm3: f64,
        table: AbsorptionTable,
    ) -> Self {
        Self {
            formula: formula.into(),
            z,
            atomic_weight_g,
            density_g_cm3,
            table,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synthetic_table() -> AbsorptionTable {
        // mu = 1.0 / meter on a grid 1000..2000 eV step 1 eV, as in the spec's
        // concrete test scenarios.
        let rows = (0..=1000)
            .map(|i| AbsorptionRow {
                e: 1000.0 + i as f64,
                f2: 0.0,
                mu: 1.0,
            })
            .collect();
        AbsorptionTable::from_rows(rows).unwrap()
    }

    #[test]
    fn lookup_exact_grid_point() {
        let table = synthetic_table();
        let (e, mu) = table.lookup(1500.0);
        assert_eq!(e, 1500.0);
        assert_eq!(mu, 1.0);
    }

    #[test]
    fn lookup_clamps_out_of_range() {
        let table = synthetic_table();
        let (e_low, _) = table.lookup(-500.0);
        assert_eq!(e_low, 1000.0);
        let (e_high, _) = table.lookup(4500.0);
        assert_eq!(e_high, 2000.0);
    }

    #[test]
    fn lookup_round_trip_idempotent() {
        let table = synthetic_table();
        let (e1, _) = table.lookup(1500.4);
        let (e2, _) = table.lookup(e1);
        assert_eq!(e1, e2);
    }

    #[test]
    fn rejects_non_uniform_grid() {
        let rows = vec![
            AbsorptionRow { e: 1000.0, f2: 0.0, mu: 1.0 },
            AbsorptionRow { e: 1001.0, f2: 0.0, mu: 1.0 },
            AbsorptionRow { e: 1003.0, f2: 0.0, mu: 1.0 },
        ];
        let err = AbsorptionTable::from_rows(rows).unwrap_err();
        assert!(matches!(err, TableError::BadTable { .. }));
    }

    #[test]
    fn rejects_non_finite_mu() {
        let rows = vec![
            AbsorptionRow { e: 1000.0, f2: 0.0, mu: 1.0 },
            AbsorptionRow { e: 1001.0, f2: 0.0, mu: f64::NAN },
        ];
        let err = AbsorptionTable::from_rows(rows).unwrap_err();
        assert!(matches!(err, TableError::BadTable { .. }));
    }

    #[test]
    fn from_f2_table_derives_positive_mu() {
        let table = AbsorptionTable::from_f2_table(
            &[(1000.0, 0.05), (1001.0, 0.05)],
            4.6637e-23,
            2.329,
        )
        .unwrap();
        let (_, mu) = table.lookup(1000.0);
        assert!(mu > 0.0);
    }
}
