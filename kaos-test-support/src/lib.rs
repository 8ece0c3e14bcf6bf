//! Test helpers for kaos-rank: fault injection, duplicate delivery and
//! ranking verification.

pub mod chaos;
pub mod loss;
pub mod processors;
pub mod verify;

pub use chaos::{ChaosStore, FaultPlan};
pub use loss::{DuplicatePattern, DuplicatingChannel};
pub use processors::RecordingProcessor;
pub use verify::{RankModel, RankVerifier, Violation};
