//! Agent supervision: spawning, stream parsing, circuit breakers, and
//! per-agent cancellation.

pub mod breaker;
pub mod intervention;
pub mod protocol;
pub mod spawn;
pub mod supervisor;
pub mod watchdog;

pub use breaker::{
    CircuitBreaker, MAX_FILE_READS, MAX_SAME_FILE_READS, MAX_SAME_TOOL_CALLS, MAX_TOTAL_TOOL_CALLS,
};
pub use intervention::InterventionController;
pub use protocol::{EventContext, convert_json_to_events, normalize_tool_name};
pub use spawn::check_agent_installed;
pub use supervisor::{AgentResult, AgentRunConfig, AgentSupervisor};
pub use watchdog::Watchdog;
