//! Pipeline orchestration for Errata.
//!
//! Ties data preparation, single-error analysis, and the recursive taxonomy
//! build into one cached end-to-end run (`errata run`). The three top-level
//! stages are wrapped by the CSV stage cache, so a rerun with an unchanged
//! experiment id replays persisted tables instead of calling the oracle.

pub mod cache;
pub mod pipeline;
pub mod prepare;
pub mod progress;
pub mod single_error;

pub use cache::StageCache;
pub use pipeline::{Errata, RunOptions, RunOutcome};
pub use prepare::prepare_data;
pub use progress::{Progress, SilentProgress};
pub use single_error::analyze_single_errors;
