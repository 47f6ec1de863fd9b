#![warn(clippy::all, clippy::cargo, clippy::nursery, clippy::pedantic)]
#![warn(missing_docs)]

//! Scaling, post-refinement and merging of serial-crystallography snapshots.
//!
//! A stream of indexed diffraction "still" exposures is scaled onto a shared reference via
//! weighted linear regression, each crystal's geometry is post-refined against that reference by
//! Gauss–Newton least squares, and the resulting partial observations are merged into a final
//! reflection list with estimated standard deviations. Scale, refine and merge repeat as a
//! macrocycle until the mean scale-factor change converges or a cycle budget runs out.

pub mod cell;
pub mod config;
pub mod error;
pub mod merge;
pub mod orchestrator;
pub mod partiality;
pub mod rational;
pub mod refine;
pub mod reflection;
pub mod scaler;
pub mod stream;
pub mod symmetry;

pub use config::Config;
pub use error::{Error, Result};
pub use orchestrator::{run, CancelToken, RunSummary};
pub use reflection::{Crystal, Observation, ReflectionTable};
pub use stream::{build_crystal, MergedReflection, RawCrystal, RawObservation, StreamReader, UnitCell};
pub use symmetry::{Centering, PointGroup};
