//! Partiality prediction: which reflections intersect the Ewald sphere during a still exposure,
//! and what fraction of each was captured (§4.4).
//!
//! The excitation error is modelled as a function of the reciprocal vector `g = h·a* + k·b* + l·c*`
//! relative to an Ewald sphere of radius `1/λ` centred on the beam axis. Finite divergence and
//! bandwidth widen a single sphere into a pair of limiting spheres; `r1`/`r2` are the excitation
//! errors against those two limits, matching `spec.md` §4.3's "start and end of the sweep".

use crate::cell::{p_cubic, q_from_excitation, Cell};
use nalgebra::Vector3;

/// Per-crystal beam and profile parameters that do not vary per-reflection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BeamGeometry {
    /// Wavelength, in metres.
    pub lambda: f64,
    /// Beam divergence, in radians (full angle).
    pub div: f64,
    /// Beam bandwidth `Δλ/λ` (fractional, dimensionless).
    pub bw: f64,
    /// Reflection profile radius, in inverse metres.
    pub r: f64,
}

/// A predicted reflection: geometric quantities derived purely from crystal + beam geometry, with
/// no reference to a measured intensity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Predicted {
    /// Excitation error against the entry limiting sphere.
    pub r1: f64,
    /// Excitation error against the exit limiting sphere.
    pub r2: f64,
    /// `q` at the entry limit, clamped into `[0, 1]`.
    pub q1: f64,
    /// `q` at the exit limit, clamped into `[0, 1]`.
    pub q2: f64,
    /// Partiality, the average of the two endpoint partialities.
    pub p: f64,
    /// Lorentz factor.
    pub l: f64,
    /// True if the reflection had already fully entered before the exposure began (`q1` needed
    /// clamping).
    pub clamp_low: bool,
    /// True if the reflection had not yet started to enter by the time the exposure ended (`q2`
    /// needed clamping).
    pub clamp_high: bool,
}

/// Computes the transverse (to the beam, `z`) displacement of `g` scaled by `sin(div/2)`, and its
/// partial derivatives with respect to `g`'s components and `div`. Returns `(delta, d_dgx, d_dgy,
/// d_ddiv)`; the displacement has no `gz` dependence.
fn divergence_term(g: Vector3<f64>, div: f64) -> (f64, f64, f64, f64) {
    let t = (g.x * g.x + g.y * g.y).sqrt();
    let s = (div / 2.0).sin();
    let c = (div / 2.0).cos();
    if t < 1e-300 {
        return (0.0, 0.0, 0.0, 0.0);
    }
    (t * s, (g.x / t) * s, (g.y / t) * s, t * c * 0.5)
}

/// Computes `r0 = |g - center| - 1/λ`, the nominal (zero-divergence, zero-bandwidth) excitation
/// error, and its gradient with respect to `g`.
fn nominal_excitation(g: Vector3<f64>, lambda: f64) -> (f64, Vector3<f64>) {
    let radius = 1.0 / lambda;
    // beam along -z: sphere centre at (0, 0, -1/λ)
    let rel = Vector3::new(g.x, g.y, g.z + radius);
    let d = rel.norm().max(1e-300);
    let r0 = d - radius;
    (r0, rel / d)
}

/// Evaluates the excitation errors, partiality and clamp flags of one reflection.
#[must_use]
pub fn predict(cell: &Cell, beam: &BeamGeometry, h: i32, k: i32, l: i32) -> Predicted {
    let g = cell.reciprocal(h, k, l);
    let (r0, _grad_r0) = nominal_excitation(g, beam.lambda);
    let (delta_div, ..) = divergence_term(g, beam.div);
    let delta_bw = (g.z + 1.0 / beam.lambda) * (beam.bw / 2.0);
    let delta = delta_div + delta_bw;

    let r1 = r0 - delta;
    let r2 = r0 + delta;
    let (q1, clamp_low) = q_from_excitation(r1, beam.r);
    let (q2, clamp_high) = q_from_excitation(r2, beam.r);
    let p = 0.5 * (p_cubic(q1) + p_cubic(q2));

    let s = cell.resolution(h, k, l);
    let l_factor = lorentz_factor(s, beam.lambda);

    Predicted {
        r1,
        r2,
        q1,
        q2,
        p,
        l: l_factor,
        clamp_low,
        clamp_high,
    }
}

/// Lorentz factor `1 / sin(2θ)` from Bragg's law `sin θ = λs`, clamped away from the singularity at
/// `θ = 0` or `θ = π/2`.
#[must_use]
pub fn lorentz_factor(s: f64, lambda: f64) -> f64 {
    let sin_theta = (lambda * s).clamp(-1.0, 1.0);
    let theta = sin_theta.asin();
    let sin_2theta = (2.0 * theta).sin();
    if sin_2theta.abs() < 1e-6 {
        1e6
    } else {
        1.0 / sin_2theta.abs()
    }
}

/// Enumerates every `(h, k, l)` (excluding the origin) whose resolution is within `resolution_cutoff`
/// (inverse metres), bounding the search range from the reciprocal basis vector norms — the same
/// bounded-loop idiom used for powder-pattern `hkl` enumeration.
#[must_use]
pub fn enumerate_within_resolution(cell: &Cell, resolution_cutoff: f64) -> Vec<(i32, i32, i32)> {
    let max_index = |v: Vector3<f64>| -> i32 {
        let norm = v.norm();
        if norm < 1e-300 {
            0
        } else {
            ((2.0 * resolution_cutoff) / norm).ceil().max(0.0) as i32
        }
    };
    let hmax = max_index(cell.astar);
    let kmax = max_index(cell.bstar);
    let lmax = max_index(cell.cstar);

    let mut out = Vec::new();
    for h in -hmax..=hmax {
        for k in -kmax..=kmax {
            for l in -lmax..=lmax {
                if h == 0 && k == 0 && l == 0 {
                    continue;
                }
                if cell.resolution(h, k, l) <= resolution_cutoff {
                    out.push((h, k, l));
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cubic_cell(astar: f64) -> Cell {
        Cell::new(
            Vector3::new(astar, 0.0, 0.0),
            Vector3::new(0.0, astar, 0.0),
            Vector3::new(0.0, 0.0, astar),
        )
    }

    #[test]
    fn predict_stays_in_bounds() {
        let cell = cubic_cell(2e9);
        let beam = BeamGeometry {
            lambda: 1e-10,
            div: 1e-3,
            bw: 1e-2,
            r: 1e7,
        };
        let pred = predict(&cell, &beam, 1, 0, 0);
        assert!((0.0..=1.0).contains(&pred.p));
        assert!(pred.l.is_finite());
    }

    #[test]
    fn enumerate_excludes_origin_and_respects_cutoff() {
        let cell = cubic_cell(1e9);
        let hkls = enumerate_within_resolution(&cell, 2.5e9);
        assert!(!hkls.contains(&(0, 0, 0)));
        for (h, k, l) in hkls {
            assert!(cell.resolution(h, k, l) <= 2.5e9 + 1e-6);
        }
    }
}
