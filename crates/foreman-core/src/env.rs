//! Debug environment flags consumed by the executor.

/// Verbose stream-to-event conversion diagnostics.
pub const DEBUG_EVENTS: &str = "VC_DEBUG_EVENTS";
/// Log outgoing AI prompts.
pub const DEBUG_PROMPTS: &str = "VC_DEBUG_PROMPTS";
/// Disable AI-side loop diagnosis; circuit breakers remain the sole safeguard.
pub const DISABLE_AI_LOOP_DETECTION: &str = "VC_DISABLE_AI_LOOP_DETECTION";

/// True when the variable is set to a truthy value ("1", "true", "yes").
pub fn flag(name: &str) -> bool {
    matches!(
        std::env::var(name).ok().as_deref().map(str::trim),
        Some("1") | Some("true") | Some("yes")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_unset_is_false() {
        assert!(!flag("FOREMAN_TEST_FLAG_THAT_IS_NEVER_SET"));
    }
}
