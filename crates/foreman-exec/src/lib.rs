//! Execution control: the per-issue state machine, the dispatch loop, and
//! the post-execution results pipeline.

pub mod approval;
pub mod dispatch;
pub mod processor;
pub mod state;

pub use approval::{Approval, ApprovalGate, AutoApprove};
pub use dispatch::Dispatcher;
pub use processor::{INCOMPLETE_MARKER, ProcessingResult, ResultsProcessor};
pub use state::{REPEATED_FAILURE_WINDOW, ReleaseOutcome, StateDriver};
