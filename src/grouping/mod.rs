//! Batch submission: orchestration of classifier calls and the commit of
//! their results into the taxonomy and the keyword table.

pub mod engine;
pub mod errors;
pub mod factory;
pub mod orchestrator;

pub use engine::{BatchResult, BatchStatus, Engine, KeywordOutcome, Outcome, SubmitRequest};
pub use errors::GroupingError;
pub use factory::{EngineFactory, EnginePaths};
pub use orchestrator::{CancelToken, Progress};
