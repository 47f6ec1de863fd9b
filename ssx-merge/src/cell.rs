//! Direct/reciprocal cell geometry and the partiality profile function (§4.3).

use nalgebra::Vector3;

/// A crystal's reciprocal-lattice basis, the geometric core of every predicted-reflection
/// calculation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Cell {
    /// `a*` reciprocal basis vector, in inverse metres.
    pub astar: Vector3<f64>,
    /// `b*` reciprocal basis vector, in inverse metres.
    pub bstar: Vector3<f64>,
    /// `c*` reciprocal basis vector, in inverse metres.
    pub cstar: Vector3<f64>,
}

impl Cell {
    /// Builds a cell from its three reciprocal basis vectors.
    #[must_use]
    pub const fn new(astar: Vector3<f64>, bstar: Vector3<f64>, cstar: Vector3<f64>) -> Self {
        Self {
            astar,
            bstar,
            cstar,
        }
    }

    /// The reciprocal-space vector `g = h·a* + k·b* + l·c*` for Miller indices `(h, k, l)`.
    #[must_use]
    pub fn reciprocal(&self, h: i32, k: i32, l: i32) -> Vector3<f64> {
        self.astar * f64::from(h) + self.bstar * f64::from(k) + self.cstar * f64::from(l)
    }

    /// Resolution `s = 1/d = |g| / 2`... actually `s = |g|` under the convention that `g` already
    /// equals `1/d` in magnitude (see `spec.md` §4.3: "resolution(h,k,l) → s = ½|reciprocal|" uses a
    /// convention where the reciprocal vector is `2/d` in magnitude; we follow that literally).
    #[must_use]
    pub fn resolution(&self, h: i32, k: i32, l: i32) -> f64 {
        0.5 * self.reciprocal(h, k, l).norm()
    }

    /// Direct-space unit cell volume implied by this reciprocal basis: `V = 1 / (a* · (b* × c*))`.
    #[must_use]
    pub fn reciprocal_volume(&self) -> f64 {
        self.astar.dot(&self.bstar.cross(&self.cstar))
    }
}

/// Evaluates the partiality cubic `p(q) = 3q² − 2q³` for `q` already clamped into `[0, 1]`.
#[must_use]
pub fn p_cubic(q: f64) -> f64 {
    let q = q.clamp(0.0, 1.0);
    q * q * (3.0 - 2.0 * q)
}

/// The derivative `dp/dq = 6(q − q²)`, for `q` already clamped into `[0, 1]`.
#[must_use]
pub fn dp_dq(q: f64) -> f64 {
    let q = q.clamp(0.0, 1.0);
    6.0 * (q - q * q)
}

/// Converts an excitation error and profile radius into the clamped `q` used by [`p_cubic`],
/// reporting whether clamping was needed (the reflection had already fully entered, `q_raw > 1`,
/// or had not yet started to enter, `q_raw < 0`).
#[must_use]
pub fn q_from_excitation(r_excit: f64, r: f64) -> (f64, bool) {
    let q_raw = (r_excit + r) / (2.0 * r);
    (q_raw.clamp(0.0, 1.0), !(0.0..=1.0).contains(&q_raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::approx_eq;

    #[test]
    fn partiality_boundary_values() {
        assert!(approx_eq!(f64, p_cubic(0.0), 0.0, epsilon = 1e-12));
        assert!(approx_eq!(f64, p_cubic(1.0), 1.0, epsilon = 1e-12));
    }

    #[test]
    fn partiality_monotonic_on_unit_interval() {
        let mut prev = p_cubic(0.0);
        let mut q = 0.0;
        while q <= 1.0 {
            let cur = p_cubic(q);
            assert!(cur >= prev - 1e-12);
            prev = cur;
            q += 0.01;
        }
    }

    #[test]
    fn partiality_derivative_vanishes_at_ends() {
        assert!(dp_dq(0.0).abs() < 1e-12);
        assert!(dp_dq(1.0).abs() < 1e-12);
    }

    #[test]
    fn resolution_scales_with_reciprocal_vector() {
        let cell = Cell::new(
            Vector3::new(1e9, 0.0, 0.0),
            Vector3::new(0.0, 1e9, 0.0),
            Vector3::new(0.0, 0.0, 1e9),
        );
        let s = cell.resolution(1, 0, 0);
        assert!(approx_eq!(f64, s, 0.5e9, epsilon = 1.0));
    }
}
