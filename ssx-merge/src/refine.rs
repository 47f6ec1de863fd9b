//! Gauss–Newton post-refinement of a crystal's geometric parameters (§4.6).

use crate::cell::{dp_dq, q_from_excitation};
use crate::config::Config;
use crate::partiality::{self, Predicted};
use crate::reflection::{Crystal, RejectReason, ReflectionTable};
use nalgebra::{SMatrix, SVector, Vector3};

/// The twelve scalar parameters a crystal's geometry is refined over (§4.6). `Bw` is the one
/// parameter excluded from refinement — kept here only so indices stay stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Param {
    /// `a*_x`
    Asx = 0,
    /// `a*_y`
    Asy = 1,
    /// `a*_z`
    Asz = 2,
    /// `b*_x`
    Bsx = 3,
    /// `b*_y`
    Bsy = 4,
    /// `b*_z`
    Bsz = 5,
    /// `c*_x`
    Csx = 6,
    /// `c*_y`
    Csy = 7,
    /// `c*_z`
    Csz = 8,
    /// Beam divergence.
    Div = 9,
    /// Profile radius.
    R = 10,
    /// Beam bandwidth — excluded from refinement.
    Bw = 11,
}

/// Number of parameter slots (§4.6: "12 scalars").
pub const N_PARAMS: usize = 12;
const EXCLUDED: usize = Param::Bw as usize;

fn params_of(crystal: &Crystal) -> SVector<f64, N_PARAMS> {
    let c = &crystal.cell;
    let b = &crystal.beam;
    SVector::from_column_slice(&[
        c.astar.x, c.astar.y, c.astar.z, c.bstar.x, c.bstar.y, c.bstar.z, c.cstar.x, c.cstar.y,
        c.cstar.z, b.div, b.r, b.bw,
    ])
}

fn apply_params(crystal: &mut Crystal, p: &SVector<f64, N_PARAMS>) {
    crystal.cell.astar = Vector3::new(p[0], p[1], p[2]);
    crystal.cell.bstar = Vector3::new(p[3], p[4], p[5]);
    crystal.cell.cstar = Vector3::new(p[6], p[7], p[8]);
    crystal.beam.div = p[9];
    crystal.beam.r = p[10];
    crystal.beam.bw = p[11];
}

/// Characteristic magnitude of each parameter, used to reparameterise the normal-equation solve
/// into dimensionless shifts (§9: "row-scale M or reparameterise to dimensionless shifts").
fn param_scale(crystal: &Crystal) -> SVector<f64, N_PARAMS> {
    let a_scale = crystal.cell.astar.norm().max(1e-6);
    let b_scale = crystal.cell.bstar.norm().max(1e-6);
    let c_scale = crystal.cell.cstar.norm().max(1e-6);
    let div_scale = crystal.beam.div.abs().max(1e-9);
    let r_scale = crystal.beam.r.abs().max(1e-6);
    SVector::from_column_slice(&[
        a_scale, a_scale, a_scale, b_scale, b_scale, b_scale, c_scale, c_scale, c_scale,
        div_scale, r_scale, 1.0,
    ])
}

/// The gradient `∂p/∂θ_k` for every parameter `k`, for one reflection's predicted partiality.
/// Implements §4.6 step 2: the excitation-error derivative w.r.t. each cell component and `DIV`
/// (via `sin(div/2)`/`cos(div/2)`), the extra term for `R` from `q`'s direct dependence on the
/// profile radius, and the clamp-dropping rule.
fn partiality_gradient(
    h: i32,
    k: i32,
    l: i32,
    lambda: f64,
    div: f64,
    bw: f64,
    r: f64,
    g: Vector3<f64>,
    pred: &Predicted,
) -> SVector<f64, N_PARAMS> {
    let radius = 1.0 / lambda;
    let rel = Vector3::new(g.x, g.y, g.z + radius);
    let d = rel.norm().max(1e-300);
    let dr0 = rel / d;

    let t = (g.x * g.x + g.y * g.y).sqrt();
    let (dt_dgx, dt_dgy) = if t > 1e-300 {
        (g.x / t, g.y / t)
    } else {
        (0.0, 0.0)
    };
    let s = (div / 2.0).sin();
    let c = (div / 2.0).cos();

    // d(delta_div)/d{gx,gy,gz,div}
    let ddiv_dgx = dt_dgx * s;
    let ddiv_dgy = dt_dgy * s;
    let ddiv_ddiv = t * c * 0.5;

    // d(delta_bw)/dgz; bw itself is the excluded parameter, so its own partial is never needed.
    let dbw_dgz = bw / 2.0;

    let dr1_dg = Vector3::new(dr0.x - ddiv_dgx, dr0.y - ddiv_dgy, dr0.z - dbw_dgz);
    let dr2_dg = Vector3::new(dr0.x + ddiv_dgx, dr0.y + ddiv_dgy, dr0.z + dbw_dgz);
    let dr1_ddiv = -ddiv_ddiv;
    let dr2_ddiv = ddiv_ddiv;

    let (_, clamp1) = q_from_excitation(pred.r1, r);
    let (_, clamp2) = q_from_excitation(pred.r2, r);
    let dpdq1 = if clamp1 { 0.0 } else { dp_dq(pred.q1) };
    let dpdq2 = if clamp2 { 0.0 } else { dp_dq(pred.q2) };

    let half_inv_r = 1.0 / (2.0 * r);
    let dq1_dr_direct = -pred.r1 / (2.0 * r * r);
    let dq2_dr_direct = -pred.r2 / (2.0 * r * r);

    let (hf, kf, lf) = (f64::from(h), f64::from(k), f64::from(l));
    let mut out = SVector::<f64, N_PARAMS>::zeros();

    // cell components: g_x depends on ASX,BSX,CSX; g_y on ASY,BSY,CSY; g_z on ASZ,BSZ,CSZ.
    let cell_coeffs = [hf, kf, lf];
    for (block, coeff) in cell_coeffs.iter().enumerate() {
        let base = block * 3;
        // dq_i/dθ = dr_i/dg_component * dg_component/dθ * (1/2r)
        let dp1 = dpdq1 * dr1_dg.x * coeff * half_inv_r;
        let dp2 = dpdq2 * dr2_dg.x * coeff * half_inv_r;
        out[base] = 0.5 * (dp1 + dp2); // ASX/BSX/CSX (x-component row)
        let dp1 = dpdq1 * dr1_dg.y * coeff * half_inv_r;
        let dp2 = dpdq2 * dr2_dg.y * coeff * half_inv_r;
        out[base + 1] = 0.5 * (dp1 + dp2); // ASY/BSY/CSY
        let dp1 = dpdq1 * dr1_dg.z * coeff * half_inv_r;
        let dp2 = dpdq2 * dr2_dg.z * coeff * half_inv_r;
        out[base + 2] = 0.5 * (dp1 + dp2); // ASZ/BSZ/CSZ
    }

    out[Param::Div as usize] = 0.5 * (dpdq1 * dr1_ddiv * half_inv_r + dpdq2 * dr2_ddiv * half_inv_r);
    out[Param::R as usize] = 0.5 * (dpdq1 * dq1_dr_direct + dpdq2 * dq2_dr_direct);
    out[Param::Bw as usize] = 0.0; // excluded

    out
}

/// Outcome of running post-refinement on one crystal.
#[derive(Debug, Clone, Default)]
pub struct RefineOutcome {
    /// Number of Gauss–Newton iterations actually run.
    pub iterations: u32,
    /// Whether the max-shift convergence criterion was met.
    pub converged: bool,
    /// Per-iteration mean squared residual `δI`, in the order run (for monitoring convergence).
    pub residual_variance: Vec<f64>,
}

/// Runs up to `config.max_pr_cycles` Gauss–Newton iterations on `crystal`'s geometry (§4.6).
/// Crystals with `flag != Ok` are skipped. On solver failure or a non-finite shift, the crystal's
/// parameters are reverted to their pre-iteration values and it is flagged `RejectedByScaling` for
/// this macrocycle.
pub fn refine_crystal(crystal: &mut Crystal, reference: &ReflectionTable, config: &Config) -> RefineOutcome {
    let mut outcome = RefineOutcome::default();
    if !crystal.flag.is_ok() {
        return outcome;
    }

    for _ in 0..config.max_pr_cycles {
        let saved = params_of(crystal);
        let mut m = SMatrix::<f64, N_PARAMS, N_PARAMS>::zeros();
        let mut v = SVector::<f64, N_PARAMS>::zeros();
        let mut n_terms = 0usize;
        let mut residual_sq_sum = 0.0;

        for obs in &crystal.observations {
            let Some(entry) = reference.find(obs.hkl) else {
                continue;
            };
            let i_full = entry.read().unwrap().i_full;
            if !(i_full > 0.0) {
                continue;
            }
            let (h, k, l) = obs.hkl;
            let pred = partiality::predict(&crystal.cell, &crystal.beam, h, k, l);
            let i_pred = pred.p * crystal.g * i_full;
            let delta_i = obs.i_obs - i_pred;
            residual_sq_sum += delta_i * delta_i;
            n_terms += 1;

            let g_hkl = crystal.cell.reciprocal(h, k, l);
            let grad = partiality_gradient(
                h,
                k,
                l,
                crystal.beam.lambda,
                crystal.beam.div,
                crystal.beam.bw,
                crystal.beam.r,
                g_hkl,
                &pred,
            ) * crystal.g;

            for a in 0..N_PARAMS {
                v[a] += delta_i * i_full * grad[a];
                for b in 0..N_PARAMS {
                    m[(a, b)] += grad[a] * grad[b] * i_full * i_full;
                }
            }
        }

        if n_terms == 0 {
            tracing::debug!("post-refinement found no matching reference entries");
            crystal.flag = RejectReason::RejectedByScaling;
            apply_params(crystal, &saved);
            return outcome;
        }
        outcome.residual_variance.push(residual_sq_sum / n_terms as f64);

        // the excluded parameter's row/col are identically zero (its gradient is always zero);
        // pin it so the system stays non-singular and its shift is exactly zero.
        m[(EXCLUDED, EXCLUDED)] = 1.0;
        v[EXCLUDED] = 0.0;

        let scale = param_scale(crystal);
        let mut m_scaled = m;
        let mut v_scaled = v;
        for a in 0..N_PARAMS {
            v_scaled[a] *= scale[a];
            for b in 0..N_PARAMS {
                m_scaled[(a, b)] *= scale[a] * scale[b];
            }
        }

        let qr = m_scaled.qr();
        let Some(y) = qr.solve(&v_scaled) else {
            tracing::warn!("post-refinement normal-equation solve failed, reverting crystal");
            crystal.flag = RejectReason::RejectedByScaling;
            apply_params(crystal, &saved);
            return outcome;
        };

        if !y.iter().all(|x| x.is_finite()) {
            tracing::warn!("post-refinement produced a non-finite shift, reverting crystal");
            crystal.flag = RejectReason::RejectedByScaling;
            apply_params(crystal, &saved);
            return outcome;
        }

        let max_shift = y.iter().fold(0.0_f64, |acc, x| acc.max(x.abs()));

        let mut dx = SVector::<f64, N_PARAMS>::zeros();
        for a in 0..N_PARAMS {
            dx[a] = y[a] * scale[a];
        }
        dx[EXCLUDED] = 0.0;

        let updated = saved + dx;
        apply_params(crystal, &updated);
        outcome.iterations += 1;

        if max_shift < config.pr_shift_convergence {
            outcome.converged = true;
            break;
        }
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::Cell;
    use crate::partiality::BeamGeometry;
    use crate::reflection::Observation;

    fn reference_with(entries: &[((i32, i32, i32), f64)]) -> ReflectionTable {
        let table = ReflectionTable::new();
        for (key, i_full) in entries {
            table.add(*key).write().unwrap().i_full = *i_full;
        }
        table
    }

    fn noise_free_crystal(cell: Cell, beam: BeamGeometry, reference: &ReflectionTable, hkls: &[(i32, i32, i32)]) -> Crystal {
        let mut observations = Vec::new();
        for &(h, k, l) in hkls {
            let i_full = reference.find((h, k, l)).unwrap().read().unwrap().i_full;
            let pred = partiality::predict(&cell, &beam, h, k, l);
            if pred.p < 1e-6 {
                continue;
            }
            let i_obs = pred.p * i_full; // G = 1
            observations.push(
                Observation::new((h, k, l), i_obs, i_obs.abs().max(1.0) / 50.0, pred.p, pred.l, cell.resolution(h, k, l), pred.clamp_low, pred.clamp_high)
                    .unwrap(),
            );
        }
        Crystal::new(cell, beam, observations)
    }

    #[test]
    fn scenario_6_small_perturbation_converges() {
        let true_cell = Cell::new(
            Vector3::new(1e9, 0.0, 0.0),
            Vector3::new(0.0, 1.05e9, 0.0),
            Vector3::new(0.0, 0.0, 1.1e9),
        );
        let beam = BeamGeometry {
            lambda: 1e-10,
            div: 1e-3,
            bw: 1e-2,
            r: 2e7,
        };
        let hkls: Vec<(i32, i32, i32)> = (1..6)
            .flat_map(|h| (1..6).map(move |k| (h, k, 1)))
            .collect();

        let reference = reference_with(
            &hkls
                .iter()
                .map(|&hkl| (hkl, 500.0 + 10.0 * f64::from(hkl.0 + hkl.1)))
                .collect::<Vec<_>>(),
        );

        // perturb the crystal's a* by 0.5% before refinement; observations are generated against
        // the *true* cell, so refinement should recover it.
        let mut perturbed_cell = true_cell;
        perturbed_cell.astar *= 1.005;
        let mut crystal = noise_free_crystal(true_cell, beam, &reference, &hkls);
        crystal.cell = perturbed_cell;

        let outcome = refine_crystal(&mut crystal, &reference, &Config::default());

        assert!(outcome.iterations > 0);
        assert!(outcome.converged, "expected convergence within max_pr_cycles, outcome={outcome:?}");
        assert!(outcome.iterations <= 10);

        // residual variance should not increase beyond a small numerical tolerance between
        // consecutive iterations.
        for pair in outcome.residual_variance.windows(2) {
            assert!(pair[1] <= pair[0] * 1.05 + 1e-12, "residual grew: {:?}", outcome.residual_variance);
        }
        let first = *outcome.residual_variance.first().unwrap();
        let last = *outcome.residual_variance.last().unwrap();
        assert!(last <= first, "refinement did not reduce residual variance overall");
    }
}
