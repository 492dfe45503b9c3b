//! Mission, epic, and report machinery: discovery-graph walks, convergence
//! and explosion checks, the structured-report handler, and sandbox
//! lifecycle (including the startup rebase pass).

pub mod convergence;
pub mod handler;
pub mod rebase;
pub mod sandbox;

pub use convergence::{
    EXPLOSION_THRESHOLD, auto_close_epics, check_mission_explosion, has_mission_converged,
    mission_discoveries, mission_root,
};
pub use handler::{HandledReport, ReportHandler};
pub use rebase::rebase_active_sandboxes;
pub use sandbox::SandboxManager;
