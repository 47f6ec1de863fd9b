//! Per-crystal scale factor `G` and temperature factor `B` by weighted linear regression (§4.5).

use crate::config::Config;
use crate::reflection::{Crystal, RejectReason, ReflectionTable};

/// Runs the weighted Wilson-style fit for one crystal, mutating `crystal.g`/`crystal.b` on
/// success or `crystal.flag` on failure. Crystals already excluded (`flag != Ok`) are left
/// untouched, per §4.5 ("skipped if user_flag ≠ 0").
///
/// The fit is `y = ln(I_obs / (L · I_full)) = −c0 − 2·B·s²` against `x = s²`, weighted by
/// `w = (I_obs/σ)²` (the inverse-variance weight implied by first-order error propagation through
/// the logarithm). Only observations with `p ≥ min_partiality_scale` and `|I_obs| ≥ 5σ` and a
/// reference entry contribute.
pub fn scale_crystal(crystal: &mut Crystal, reference: &ReflectionTable, config: &Config) {
    if !crystal.flag.is_ok() {
        return;
    }

    let (mut sw, mut swx, mut swy, mut swxx, mut swxy) = (0.0, 0.0, 0.0, 0.0, 0.0);
    let mut n_fit = 0usize;

    for obs in &crystal.observations {
        if obs.p < config.min_partiality_scale {
            continue;
        }
        if obs.i_obs.abs() < 5.0 * obs.sigma {
            continue;
        }
        let Some(entry) = reference.find(obs.hkl) else {
            // reference lookup miss: expected, skip silently (§7).
            continue;
        };
        let i_full = entry.read().unwrap().i_full;
        if !(i_full > 0.0) {
            continue;
        }
        let y = (obs.i_obs / (obs.l * i_full)).ln();
        if !y.is_finite() {
            continue;
        }
        let x = obs.s * obs.s;
        let w = (obs.i_obs / obs.sigma).powi(2);

        sw += w;
        swx += w * x;
        swy += w * y;
        swxx += w * x * x;
        swxy += w * x * y;
        n_fit += 1;
    }

    if n_fit < 2 {
        tracing::debug!(n_fit, "crystal has too few observations to scale");
        crystal.flag = RejectReason::RejectedByScaling;
        return;
    }

    let denom = sw.mul_add(swxx, -(swx * swx));
    if denom.abs() < 1e-300 {
        crystal.flag = RejectReason::RejectedByScaling;
        return;
    }

    let c1 = sw.mul_add(swxy, -(swx * swy)) / denom;
    let c0 = swxx.mul_add(swy, -(swx * swxy)) / denom;

    let g = (-c0).exp();
    let b = -c1 / 2.0;

    let bounds = &config.scale_bounds;
    if !g.is_finite() || !b.is_finite() || !(g > 0.0 && g <= bounds.max_g) || b.abs() > bounds.max_abs_b {
        tracing::warn!(g, b, "crystal scale factors out of bounds, rejecting for this macrocycle");
        crystal.flag = RejectReason::RejectedByScaling;
        return;
    }

    crystal.g = g;
    crystal.b = b;
}
