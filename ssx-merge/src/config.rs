//! Run-wide configuration (§6).

use serde::{Deserialize, Serialize};

/// Bounds applied to a crystal's scale factor `G` and temperature factor `B` after scaling.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct ScaleBounds {
    /// Upper bound on `G`; `G` must also be strictly positive.
    pub max_g: f64,
    /// Upper bound on `|B|`, in m².
    pub max_abs_b: f64,
}

impl Default for ScaleBounds {
    fn default() -> Self {
        Self {
            max_g: 10.0,
            max_abs_b: 40e-20,
        }
    }
}

/// Every tunable named in §6.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Config {
    /// Reflections with partiality below this are excluded from scaling. Default 0.05.
    pub min_partiality_scale: f64,
    /// Reflections with partiality below this are excluded from merging. Default 0.05.
    pub min_partiality_merge: f64,
    /// Inner scale-convergence cycle limit. Default 10.
    pub max_scale_cycles: u32,
    /// Inner post-refinement cycle limit. Default 10.
    pub max_pr_cycles: u32,
    /// Outer macrocycle limit. Default 3.
    pub max_macrocycles: u32,
    /// Mean `|ΔG|` threshold below which scaling is considered converged. Default 0.01.
    pub scale_convergence: f64,
    /// Max parameter shift threshold below which post-refinement is considered converged.
    /// Default 0.01.
    pub pr_shift_convergence: f64,
    /// Reference entries with redundancy below this are marked suppressed. Default 2.
    pub min_redundancy: u32,
    /// Bounds on `G` and `B` used for outlier rejection after scaling.
    pub scale_bounds: ScaleBounds,
    /// If true, skip scaling entirely and merge with `G = 1`, `B = 0` for every crystal.
    pub no_scale: bool,
    /// Number of worker threads. Defaults to the number of logical CPUs.
    pub workers: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            min_partiality_scale: 0.05,
            min_partiality_merge: 0.05,
            max_scale_cycles: 10,
            max_pr_cycles: 10,
            max_macrocycles: 3,
            scale_convergence: 0.01,
            pr_shift_convergence: 0.01,
            min_redundancy: 2,
            scale_bounds: ScaleBounds::default(),
            no_scale: false,
            workers: std::thread::available_parallelism()
                .map(std::num::NonZeroUsize::get)
                .unwrap_or(1),
        }
    }
}

impl Config {
    /// Overrides a handful of settings from `SSX_*` environment variables, for the cases where
    /// recompiling to change a thread count or macrocycle budget is inconvenient.
    ///
    /// Recognised variables: `SSX_WORKERS`, `SSX_MAX_MACROCYCLES`, `SSX_NO_SCALE`.
    #[must_use]
    pub fn from_env(mut self) -> Self {
        if let Ok(v) = std::env::var("SSX_WORKERS") {
            if let Ok(n) = v.parse() {
                self.workers = n;
            }
        }
        if let Ok(v) = std::env::var("SSX_MAX_MACROCYCLES") {
            if let Ok(n) = v.parse() {
                self.max_macrocycles = n;
            }
        }
        if let Ok(v) = std::env::var("SSX_NO_SCALE") {
            self.no_scale = matches!(v.as_str(), "1" | "true" | "yes");
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = Config::default();
        assert!((cfg.min_partiality_scale - 0.05).abs() < 1e-12);
        assert!((cfg.min_partiality_merge - 0.05).abs() < 1e-12);
        assert_eq!(cfg.max_macrocycles, 3);
        assert_eq!(cfg.min_redundancy, 2);
        assert!(!cfg.no_scale);
        assert!(cfg.workers >= 1);
    }
}
