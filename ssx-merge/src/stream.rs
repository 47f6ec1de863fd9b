//! External interfaces (§6): the narrow surface a caller implements to feed indexed crystals in,
//! and the types used to read merged reflections back out.

use crate::cell::Cell;
use crate::error::{Error, Result};
use crate::partiality::{self, BeamGeometry};
use crate::reflection::{Crystal, Observation};
use crate::symmetry::{Centering, PointGroup};
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

/// A caller-supplied unit cell: real-space edge lengths and angles, plus centering.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UnitCell {
    /// Edge length `a`, in metres.
    pub a: f64,
    /// Edge length `b`, in metres.
    pub b: f64,
    /// Edge length `c`, in metres.
    pub c: f64,
    /// Angle `α` between `b` and `c`, in radians.
    pub alpha: f64,
    /// Angle `β` between `a` and `c`, in radians.
    pub beta: f64,
    /// Angle `γ` between `a` and `b`, in radians.
    pub gamma: f64,
    /// Lattice centering.
    pub centering: Centering,
}

impl UnitCell {
    /// Builds a unit cell, checking that lengths are positive and angles lie in `(0, π)`.
    ///
    /// # Errors
    /// Returns [`Error::BadInput`] otherwise.
    pub fn new(a: f64, b: f64, c: f64, alpha: f64, beta: f64, gamma: f64, centering: Centering) -> Result<Self> {
        if !(a > 0.0 && b > 0.0 && c > 0.0) {
            return Err(Error::BadInput(format!("non-positive cell edge ({a}, {b}, {c})")));
        }
        for (name, angle) in [("alpha", alpha), ("beta", beta), ("gamma", gamma)] {
            if !(angle > 0.0 && angle < std::f64::consts::PI) {
                return Err(Error::BadInput(format!("angle {name} = {angle} outside (0, π)")));
            }
        }
        Ok(Self {
            a,
            b,
            c,
            alpha,
            beta,
            gamma,
            centering,
        })
    }

    /// Converts this direct cell into the reciprocal basis vectors `a*`, `b*`, `c*` used
    /// throughout the rest of the crate (standard crystallographic convention, no factor of `2π`).
    #[must_use]
    pub fn reciprocal_basis(&self) -> Cell {
        let a_vec = Vector3::new(self.a, 0.0, 0.0);
        let b_vec = Vector3::new(self.b * self.gamma.cos(), self.b * self.gamma.sin(), 0.0);
        let cx = self.c * self.beta.cos();
        let cy = self.c * (self.alpha.cos() - self.beta.cos() * self.gamma.cos()) / self.gamma.sin();
        let cz_sq = 1.0 - self.alpha.cos().powi(2) - self.beta.cos().powi(2) - self.gamma.cos().powi(2)
            + 2.0 * self.alpha.cos() * self.beta.cos() * self.gamma.cos();
        let cz = self.c * cz_sq.max(0.0).sqrt() / self.gamma.sin();
        let c_vec = Vector3::new(cx, cy, cz);

        let volume = a_vec.dot(&b_vec.cross(&c_vec));
        Cell::new(
            b_vec.cross(&c_vec) / volume,
            c_vec.cross(&a_vec) / volume,
            a_vec.cross(&b_vec) / volume,
        )
    }
}

/// One raw, unfolded, unscaled observation as read from an input stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawObservation {
    /// Miller index `h`, in the caller's original indexing (not yet folded into the ASU).
    pub h: i32,
    /// Miller index `k`.
    pub k: i32,
    /// Miller index `l`.
    pub l: i32,
    /// Measured intensity.
    pub intensity: f64,
    /// Estimated standard deviation of `intensity`.
    pub sigma: f64,
}

/// One raw crystal record as read from an input stream.
#[derive(Debug, Clone, PartialEq)]
pub struct RawCrystal {
    /// This crystal's indexed unit cell.
    pub cell: UnitCell,
    /// Beam wavelength, in metres.
    pub lambda: f64,
    /// Beam divergence (full angle), in radians.
    pub div: f64,
    /// Beam bandwidth `Δλ/λ`, dimensionless.
    pub bw: f64,
    /// Initial profile radius estimate, in inverse metres.
    pub initial_r: f64,
    /// This crystal's unfolded observations.
    pub observations: Vec<RawObservation>,
}

/// A caller-supplied source of indexed crystal snapshots. Implementations own however the stream
/// is actually framed (a CrystFEL-style text stream, an HDF5 store, a network socket); this crate
/// only ever asks for the next record.
pub trait StreamReader {
    /// Reads the next crystal record, or `Ok(None)` at end of stream.
    ///
    /// # Errors
    /// Returns an error only for input that makes the whole stream unreadable (a truncated or
    /// structurally corrupt record). A crystal whose geometry is present but has no usable
    /// observations should come back as `Ok(Some(..))` with an empty `observations` list, not an
    /// error — it will simply fail to scale for lack of data (§7).
    fn next_crystal(&mut self) -> Result<Option<RawCrystal>>;
}

/// Converts one stream record into the internal [`Crystal`] representation: builds the reciprocal
/// cell, folds every observation's indices into `point_group`'s asymmetric unit, and predicts each
/// folded reflection's partiality and Lorentz factor. Individual malformed observations (the
/// origin, or a non-positive sigma) are dropped silently rather than rejecting the whole crystal.
#[must_use]
pub fn build_crystal(raw: &RawCrystal, point_group: &PointGroup) -> Crystal {
    let cell = raw.cell.reciprocal_basis();
    let beam = BeamGeometry {
        lambda: raw.lambda,
        div: raw.div,
        bw: raw.bw,
        r: raw.initial_r,
    };

    let mut observations = Vec::with_capacity(raw.observations.len());
    for ro in &raw.observations {
        if (ro.h, ro.k, ro.l) == (0, 0, 0) || !(ro.sigma > 0.0) {
            continue;
        }
        let (h, k, l) = point_group.to_asu((ro.h, ro.k, ro.l));
        let pred = partiality::predict(&cell, &beam, h, k, l);
        if let Ok(obs) = Observation::new(
            (h, k, l),
            ro.intensity,
            ro.sigma,
            pred.p,
            pred.l,
            cell.resolution(h, k, l),
            pred.clamp_low,
            pred.clamp_high,
        ) {
            observations.push(obs);
        }
    }
    Crystal::new(cell, beam, observations)
}

/// One row of the final merged reflection list, in the asymmetric unit (§3, §6).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MergedReflection {
    /// Miller index `h` (asymmetric unit).
    pub h: i32,
    /// Miller index `k`.
    pub k: i32,
    /// Miller index `l`.
    pub l: i32,
    /// Merged full intensity.
    pub i_full: f64,
    /// Estimated standard deviation of `i_full`.
    pub sigma_full: f64,
    /// Number of observations contributing.
    pub redundancy: u32,
    /// True if `redundancy` fell below the configured minimum; present in the output but not
    /// usable as a reference value.
    pub suppressed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cubic_cell_has_orthogonal_reciprocal_basis() {
        let cell = UnitCell::new(
            1e-9,
            1e-9,
            1e-9,
            std::f64::consts::FRAC_PI_2,
            std::f64::consts::FRAC_PI_2,
            std::f64::consts::FRAC_PI_2,
            Centering::P,
        )
        .unwrap();
        let reciprocal = cell.reciprocal_basis();
        assert!(reciprocal.astar.dot(&reciprocal.bstar).abs() < 1e-3);
        assert!((reciprocal.astar.norm() - 1e9).abs() / 1e9 < 1e-6);
    }

    #[test]
    fn rejects_degenerate_cell() {
        assert!(UnitCell::new(0.0, 1.0, 1.0, 1.0, 1.0, 1.0, Centering::P).is_err());
        assert!(UnitCell::new(1.0, 1.0, 1.0, 0.0, 1.0, 1.0, Centering::P).is_err());
    }

    #[test]
    fn build_crystal_drops_malformed_observations_and_folds_indices() {
        let cell = UnitCell::new(
            1e-9,
            1e-9,
            1e-9,
            std::f64::consts::FRAC_PI_2,
            std::f64::consts::FRAC_PI_2,
            std::f64::consts::FRAC_PI_2,
            Centering::P,
        )
        .unwrap();
        let raw = RawCrystal {
            cell,
            lambda: 1e-10,
            div: 1e-3,
            bw: 1e-2,
            initial_r: 1e7,
            observations: vec![
                RawObservation {
                    h: 0,
                    k: 0,
                    l: 0,
                    intensity: 100.0,
                    sigma: 1.0,
                },
                RawObservation {
                    h: 1,
                    k: 0,
                    l: 0,
                    intensity: 100.0,
                    sigma: -1.0,
                },
                RawObservation {
                    h: -1,
                    k: 0,
                    l: 0,
                    intensity: 100.0,
                    sigma: 5.0,
                },
            ],
        };
        let pg = PointGroup::parse("mmm").unwrap();
        let crystal = build_crystal(&raw, &pg);
        assert_eq!(crystal.observations.len(), 1);
        assert_eq!(crystal.observations[0].hkl, pg.to_asu((-1, 0, 0)));
    }
}
