//! Releasing a distribution.
//!
//! - [`pipeline`]: the staged coordinator and its error type
//! - [`state`]: persisted progress and validated transitions
//! - [`lock`]: per-distribution mutual exclusion
//! - [`assemble`], [`signing`], [`tagging`]: the stage capabilities

pub mod assemble;
pub mod lock;
pub mod pipeline;
pub mod signing;
pub mod state;
pub mod tagging;

pub use assemble::{AssembleError, Assembler, GraphAssembler};
pub use lock::{LockError, LockMetadata, ReleaseLock};
pub use pipeline::{ReleaseError, ReleasePipeline};
pub use signing::{GpgSigner, SignError, Signer, SigningError, SigningPolicy};
pub use state::{ReleaseArtifacts, ReleaseState, ReleaseStatus, Stage, StateError};
pub use tagging::{GitRepository, SourceControl, TagError, TagOutcome};
