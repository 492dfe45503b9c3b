use crate::types::ExecState;

#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("Issue '{0}' not found")]
    IssueNotFound(String),

    #[error("Mission '{0}' not found")]
    MissionNotFound(String),

    #[error("Issue '{issue}' already claimed by executor '{holder}'")]
    AlreadyClaimed { issue: String, holder: String },

    #[error("Issue '{0}' has no live execution claim")]
    NotClaimed(String),

    #[error("Invalid execution transition {from} -> {to}")]
    InvalidTransition { from: ExecState, to: ExecState },

    #[error("Discovery cycle detected at issue '{0}'")]
    DiscoveryCycle(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid agent report: {0}")]
    ReportInvalid(String),

    #[error("Agent process failed to spawn: {0}")]
    AgentSpawn(String),
}
