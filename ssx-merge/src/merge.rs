//! Merging scaled partial observations into the reference reflection table (§4.7, component C7).
//!
//! Runs as two parallel passes over the crystal list separated by a cheap sequential reduce. Each
//! crystal accumulates into entries concurrently because every entry's own `RwLock` already
//! serialises the handful of crystals that happen to share a reflection, and nothing needs to see
//! another crystal's contribution mid-pass — this avoids a lock-upgrade protocol entirely.

use crate::config::Config;
use crate::reflection::{Crystal, ReflectionTable};
use rayon::prelude::*;

/// Runs one macrocycle's merge: accumulates every participating crystal's scaled observations into
/// `reference`, overwriting `i_full`, `sigma_full`, `redundancy` and `suppressed` on every entry
/// touched this cycle.
pub fn merge_macrocycle(crystals: &[Crystal], reference: &ReflectionTable, config: &Config) {
    reference.reset_merge_accumulators();

    crystals
        .par_iter()
        .filter(|crystal| crystal.flag.participates())
        .for_each(|crystal| accumulate_numerator_denominator(crystal, reference, config));

    reference.finalize_i_full();
    reference.zero_residual_accumulator();

    crystals
        .par_iter()
        .filter(|crystal| crystal.flag.participates())
        .for_each(|crystal| accumulate_residuals(crystal, reference, config));

    reference.finalize_sigma_and_suppression(config.min_redundancy);
}

fn accumulate_numerator_denominator(crystal: &Crystal, reference: &ReflectionTable, config: &Config) {
    for obs in &crystal.observations {
        if obs.p < config.min_partiality_merge {
            continue;
        }
        let Some(entry) = reference.find(obs.hkl) else {
            continue;
        };
        let i_scaled = obs.scaled_intensity(crystal.g, crystal.b);
        if !i_scaled.is_finite() {
            continue;
        }
        let mut guard = entry.write().unwrap();
        guard.temp1 += i_scaled;
        guard.temp2 += 1.0;
        guard.redundancy += 1;
    }
}

fn accumulate_residuals(crystal: &Crystal, reference: &ReflectionTable, config: &Config) {
    for obs in &crystal.observations {
        if obs.p < config.min_partiality_merge {
            continue;
        }
        let Some(entry) = reference.find(obs.hkl) else {
            continue;
        };
        let i_full = entry.read().unwrap().i_full;
        if !(i_full > 0.0) {
            continue;
        }
        let i_scaled = obs.scaled_intensity(crystal.g, crystal.b);
        let resid = i_scaled - i_full;
        entry.write().unwrap().temp1 += resid * resid;
    }
}
