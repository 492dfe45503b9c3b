//! Well-known issue labels the executor reads and writes.

/// The dispatcher must never claim this issue automatically.
pub const NO_AUTO_CLAIM: &str = "no-auto-claim";
/// Mission epic waiting for the external QA workers to run its gates.
pub const NEEDS_QUALITY_GATES: &str = "needs-quality-gates";
/// Changes rejected by the approval gate; a human must look.
pub const NEEDS_REVIEW: &str = "needs-review";
/// Incomplete-work retries exhausted; escalated to a human.
pub const NEEDS_HUMAN_REVIEW: &str = "needs-human-review";
/// Issue created from a blocker in an agent report.
pub const DISCOVERED_SUPERVISOR: &str = "discovered:supervisor";
/// Conflict-resolution task created by the startup sandbox rebase.
pub const REBASE_CONFLICT: &str = "rebase-conflict";
/// Task filed by bootstrap mode to establish a baseline test suite.
pub const BASELINE_TESTS: &str = "baseline-tests";
