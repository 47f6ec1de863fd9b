//! The data model (§3) and the concurrent reflection table (§4.1, component C1).

use crate::cell::Cell;
use crate::error::{Error, Result};
use crate::partiality::BeamGeometry;
use rustc_hash::FxHashMap;
use std::sync::{Arc, RwLock};

/// A reflection key: Miller indices already folded into the asymmetric unit.
pub type Key = (i32, i32, i32);

/// One observation of a reflection on one crystal (§3).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    /// Indices in the asymmetric unit.
    pub hkl: Key,
    /// Measured intensity.
    pub i_obs: f64,
    /// Estimated standard deviation of `i_obs`. Always strictly positive.
    pub sigma: f64,
    /// Partiality, in `[0, 1]`.
    pub p: f64,
    /// Lorentz factor.
    pub l: f64,
    /// Resolution `s = 1/d`, in inverse metres.
    pub s: f64,
    /// Whether the reflection had already entered the Ewald sphere before the exposure began.
    pub clamp_low: bool,
    /// Whether the reflection had not finished entering by the time the exposure ended.
    pub clamp_high: bool,
    /// Scratch field used during merging (accumulates `(I_scaled − I_full)²` for ESD estimation).
    pub temp1: f64,
    /// Scratch field used during merging (reserved for future accumulators).
    pub temp2: f64,
    /// Redundancy counter, updated once this observation has contributed to a merge.
    pub redundancy: u32,
}

impl Observation {
    /// Builds an observation, checking the invariants from `spec.md` §3.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BadInput`] if `hkl == (0, 0, 0)`, `sigma <= 0`, or `p` is outside
    /// `[0, 1]`.
    pub fn new(hkl: Key, i_obs: f64, sigma: f64, p: f64, l: f64, s: f64, clamp_low: bool, clamp_high: bool) -> Result<Self> {
        if hkl == (0, 0, 0) {
            return Err(Error::BadInput("observation at (0,0,0)".into()));
        }
        if !(sigma > 0.0) {
            return Err(Error::BadInput(format!("non-positive sigma {sigma}")));
        }
        if !(0.0..=1.0).contains(&p) {
            return Err(Error::BadInput(format!("partiality {p} outside [0,1]")));
        }
        Ok(Self {
            hkl,
            i_obs,
            sigma,
            p,
            l,
            s,
            clamp_low,
            clamp_high,
            temp1: 0.0,
            temp2: 0.0,
            redundancy: 0,
        })
    }

    /// The scaling correction applied to this observation: `I_obs · G · exp(2Bs²) / (p · L)`
    /// (§4.5).
    #[must_use]
    pub fn scaled_intensity(&self, g: f64, b: f64) -> f64 {
        self.i_obs * g * (2.0 * b * self.s * self.s).exp() / (self.p * self.l)
    }
}

/// Why a crystal is currently excluded from scaling/merging, if at all (§9 design note: the flag is
/// multi-state; only `RejectedByScaling` is cleared automatically between macrocycles).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RejectReason {
    /// Not rejected.
    #[default]
    Ok,
    /// Rejected this macrocycle by the scaler's outlier rule or insufficient observations. Cleared
    /// before the next macrocycle's scaling pass.
    RejectedByScaling,
    /// Rejected permanently (a non-finite solve, or a caller-supplied permanent flag). Never
    /// cleared automatically.
    RejectedPermanently,
}

impl RejectReason {
    /// True unless this crystal is fully excluded (`RejectedPermanently`); `RejectedByScaling`
    /// crystals are still reconsidered next macrocycle, per §7's recovery policy.
    #[must_use]
    pub const fn participates(self) -> bool {
        !matches!(self, Self::RejectedPermanently)
    }

    /// True only for `Ok`: whether this crystal is used in the current macrocycle's scale/refine/
    /// merge passes.
    #[must_use]
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }
}

/// One indexed snapshot (§3).
#[derive(Debug, Clone)]
pub struct Crystal {
    /// Reciprocal-lattice basis and orientation.
    pub cell: Cell,
    /// Beam and profile parameters (wavelength, divergence, bandwidth, profile radius).
    pub beam: BeamGeometry,
    /// Per-crystal scale factor, initially 1.0.
    pub g: f64,
    /// Per-crystal temperature factor, initially 0.0.
    pub b: f64,
    /// This crystal's predicted/measured reflections.
    pub observations: Vec<Observation>,
    /// Current rejection state.
    pub flag: RejectReason,
}

impl Crystal {
    /// Builds a freshly-indexed crystal with `G = 1`, `B = 0`, and no rejection.
    #[must_use]
    pub fn new(cell: Cell, beam: BeamGeometry, observations: Vec<Observation>) -> Self {
        Self {
            cell,
            beam,
            g: 1.0,
            b: 0.0,
            observations,
            flag: RejectReason::Ok,
        }
    }
}

/// The current best estimate of a reflection's full intensity (§3).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ReferenceEntry {
    /// Current best merged intensity.
    pub i_full: f64,
    /// Number of observations contributing.
    pub redundancy: u32,
    /// Merge-numerator accumulator, zeroed at the start of each merge.
    pub temp1: f64,
    /// Merge-denominator accumulator, zeroed at the start of each merge.
    pub temp2: f64,
    /// Estimated standard deviation after merging.
    pub sigma_full: f64,
    /// True if `redundancy` fell below `min_redundancy` and this entry should be reported but
    /// excluded from use as a reference.
    pub suppressed: bool,
}

/// A handle to one reflection-table entry. Mutating it requires taking the `RwLock`; Rust's RAII
/// guards stand in for the explicit `lock`/`unlock` pair of `spec.md` §4.1 — there is no separate
/// unlock call, the guard releases the lock on drop.
pub type EntryHandle = Arc<RwLock<ReferenceEntry>>;

/// The shared reference reflection table (component C1).
///
/// `find` only ever takes a shared read lock on the outer map. `add` first tries the same path and,
/// on a miss, takes the outer map's write lock and re-checks before inserting (the double-checked
/// insertion protocol `spec.md` §4.1 calls for, avoiding a distinct lock-upgrade primitive).
#[derive(Debug, Default)]
pub struct ReflectionTable {
    map: RwLock<FxHashMap<Key, EntryHandle>>,
}

impl ReflectionTable {
    /// An empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            map: RwLock::new(FxHashMap::default()),
        }
    }

    /// Looks up `key` under a shared read lock. Returns `None` if absent.
    #[must_use]
    pub fn find(&self, key: Key) -> Option<EntryHandle> {
        self.map.read().unwrap().get(&key).cloned()
    }

    /// Returns the entry for `key`, creating it (with a default, zeroed entry) if absent.
    pub fn add(&self, key: Key) -> EntryHandle {
        if let Some(existing) = self.find(key) {
            return existing;
        }
        let mut guard = self.map.write().unwrap();
        guard
            .entry(key)
            .or_insert_with(|| Arc::new(RwLock::new(ReferenceEntry::default())))
            .clone()
    }

    /// Number of entries currently in the table.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.read().unwrap().len()
    }

    /// True if the table has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A snapshot of every `(key, entry)` pair. Only meaningful when no writer is concurrently
    /// inserting or mutating entries, i.e. outside a merge phase.
    #[must_use]
    pub fn iter_snapshot(&self) -> Vec<(Key, ReferenceEntry)> {
        self.map
            .read()
            .unwrap()
            .iter()
            .map(|(k, v)| (*k, *v.read().unwrap()))
            .collect()
    }

    /// Cloned handles to every current entry, for the merger's sequential reduction passes
    /// (component C7). Cheap: cloning an `Arc` bumps a refcount, not the entry itself.
    fn handles(&self) -> Vec<EntryHandle> {
        self.map.read().unwrap().values().cloned().collect()
    }

    /// Zeroes every entry's merge accumulators ahead of a new macrocycle's merge pass.
    pub fn reset_merge_accumulators(&self) {
        for handle in self.handles() {
            let mut entry = handle.write().unwrap();
            entry.temp1 = 0.0;
            entry.temp2 = 0.0;
            entry.redundancy = 0;
        }
    }

    /// Sequential reduce step ending the merge's numerator/denominator accumulation pass:
    /// `i_full = temp1 / temp2` for every entry that received contributions this cycle.
    pub fn finalize_i_full(&self) {
        for handle in self.handles() {
            let mut entry = handle.write().unwrap();
            if entry.temp2 > 0.0 {
                entry.i_full = entry.temp1 / entry.temp2;
            }
        }
    }

    /// Zeroes `temp1` ahead of the merge's second, residual-accumulation pass. `temp2` and
    /// `redundancy` are left untouched; they were already finalised by [`Self::finalize_i_full`].
    pub fn zero_residual_accumulator(&self) {
        for handle in self.handles() {
            handle.write().unwrap().temp1 = 0.0;
        }
    }

    /// Sequential reduce step ending the merge's residual-accumulation pass: `sigma_full =
    /// sqrt(temp1) / n` and the suppression flag for entries below `min_redundancy` (§4.7).
    pub fn finalize_sigma_and_suppression(&self, min_redundancy: u32) {
        for handle in self.handles() {
            let mut entry = handle.write().unwrap();
            entry.sigma_full = if entry.redundancy > 0 {
                entry.temp1.sqrt() / f64::from(entry.redundancy)
            } else {
                0.0
            };
            entry.suppressed = entry.redundancy < min_redundancy;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_is_idempotent_and_find_sees_it() {
        let table = ReflectionTable::new();
        assert!(table.find((1, 0, 0)).is_none());
        let h1 = table.add((1, 0, 0));
        let h2 = table.add((1, 0, 0));
        assert!(Arc::ptr_eq(&h1, &h2));
        assert!(table.find((1, 0, 0)).is_some());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn observation_rejects_invalid_invariants() {
        assert!(Observation::new((0, 0, 0), 1.0, 1.0, 1.0, 1.0, 1.0, false, false).is_err());
        assert!(Observation::new((1, 0, 0), 1.0, 0.0, 1.0, 1.0, 1.0, false, false).is_err());
        assert!(Observation::new((1, 0, 0), 1.0, 1.0, 1.5, 1.0, 1.0, false, false).is_err());
    }

    #[test]
    fn reject_reason_participation() {
        assert!(RejectReason::Ok.participates());
        assert!(RejectReason::RejectedByScaling.participates());
        assert!(!RejectReason::RejectedPermanently.participates());
    }
}
