//! Human-approval gate contract.
//!
//! Consulted only when a sandbox exists and quality gates passed. The real
//! implementation asks a human (or an approval queue); [`AutoApprove`] is
//! the pass-through used when no approval flow is configured.

use anyhow::Result;
use async_trait::async_trait;

use foreman_core::types::{Issue, Sandbox};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Approval {
    Approved,
    Rejected { reason: String },
}

#[async_trait]
pub trait ApprovalGate: Send + Sync {
    async fn decide(&self, issue: &Issue, sandbox: &Sandbox) -> Result<Approval>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AutoApprove;

#[async_trait]
impl ApprovalGate for AutoApprove {
    async fn decide(&self, _issue: &Issue, _sandbox: &Sandbox) -> Result<Approval> {
        Ok(Approval::Approved)
    }
}
