//! Intervention controller: per-agent cancel handles.
//!
//! Shutdown cancels the root token, which flows into every registered
//! agent; a circuit-breaker trip cancels exactly one.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

pub struct InterventionController {
    root: CancellationToken,
    agents: Mutex<HashMap<String, CancellationToken>>,
}

impl InterventionController {
    pub fn new(root: CancellationToken) -> Self {
        Self {
            root,
            agents: Mutex::new(HashMap::new()),
        }
    }

    /// Register an agent and get its cancel handle, a child of the root.
    pub fn register(&self, agent_id: &str) -> CancellationToken {
        let token = self.root.child_token();
        self.lock().insert(agent_id.to_string(), token.clone());
        token
    }

    pub fn cancel(&self, agent_id: &str) {
        if let Some(token) = self.lock().get(agent_id) {
            token.cancel();
        }
    }

    pub fn deregister(&self, agent_id: &str) {
        self.lock().remove(agent_id);
    }

    pub fn in_flight(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.agents.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_cancel_reaches_registered_agents() {
        let root = CancellationToken::new();
        let controller = InterventionController::new(root.clone());
        let token = controller.register("agent-1");
        assert!(!token.is_cancelled());
        root.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_targeted_cancel_leaves_others_running() {
        let controller = InterventionController::new(CancellationToken::new());
        let a = controller.register("agent-a");
        let b = controller.register("agent-b");
        controller.cancel("agent-a");
        assert!(a.is_cancelled());
        assert!(!b.is_cancelled());
    }

    #[test]
    fn test_deregister_drops_handle() {
        let controller = InterventionController::new(CancellationToken::new());
        controller.register("agent-a");
        assert_eq!(controller.in_flight(), 1);
        controller.deregister("agent-a");
        assert_eq!(controller.in_flight(), 0);
    }
}
