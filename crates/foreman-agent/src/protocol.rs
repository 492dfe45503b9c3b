//! Streaming JSON protocol: one stdout line in, one event out per tool use.
//!
//! The agent emits line-delimited JSON. `system` and `result` frames are
//! skipped, `assistant` frames carry tool_use items inside `message.content`,
//! and a flat `tool_use` frame is the legacy shape with `name`/`input` at
//! the top level. Malformed lines and unknown frame types are skipped
//! silently; `VC_DEBUG_EVENTS` logs them.

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use foreman_core::env;
use foreman_core::event::{AgentEvent, EventData, EventKind, Severity, ToolUseData};

use crate::breaker::CircuitBreaker;

/// Identifiers stamped onto every event from one agent run.
#[derive(Clone, Debug)]
pub struct EventContext {
    pub issue_id: String,
    pub executor_id: String,
    pub agent_id: String,
}

#[derive(Deserialize)]
struct StreamLine {
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    message: Option<AssistantMessage>,
    // Flat legacy tool_use fields.
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    input: Option<Value>,
}

#[derive(Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Vec<ContentItem>,
}

#[derive(Deserialize)]
struct ContentItem {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    input: Option<Value>,
}

/// Canonical tool name, or None for internal tools that never produce
/// events. Idempotent: canonical names map to themselves.
pub fn normalize_tool_name(raw: &str) -> Option<String> {
    let lower = raw.to_ascii_lowercase();
    if lower.starts_with("todo_write") || lower.starts_with("mcp__") {
        return None;
    }
    let canonical = match lower.as_str() {
        "read" => "read",
        "edit" | "edit_file" => "edit",
        "write" | "create_file" => "write",
        "bash" => "bash",
        "glob" => "glob",
        "grep" => "grep",
        "task" => "task",
        _ => return Some(lower),
    };
    Some(canonical.to_string())
}

/// Pull the interesting input fields for a normalized tool.
fn extract_tool_data(tool: &str, input: Option<&Value>) -> ToolUseData {
    let mut data = ToolUseData {
        tool: tool.to_string(),
        ..Default::default()
    };
    let Some(input) = input else {
        return data;
    };
    let field = |key: &str| input.get(key).and_then(Value::as_str).map(str::to_string);

    match tool {
        "read" | "edit" | "write" => data.target_file = field("path"),
        "bash" => data.command = field("cmd"),
        "glob" => {
            if let Some(pattern) = field("pattern") {
                data.description = Some(format!("search: {pattern}"));
            }
        }
        "grep" => {
            data.target_file = field("path");
            data.description = match (field("path"), field("pattern")) {
                (Some(path), _) => Some(format!("grep {path}")),
                (None, Some(pattern)) => Some(format!("search: {pattern}")),
                (None, None) => None,
            };
        }
        "task" => data.description = field("description"),
        _ => {}
    }
    data
}

fn event_message(data: &ToolUseData) -> String {
    if let Some(target) = &data.target_file {
        format!("{} {target}", data.tool)
    } else if let Some(command) = &data.command {
        format!("{}: {command}", data.tool)
    } else if let Some(description) = &data.description {
        format!("{}: {description}", data.tool)
    } else {
        data.tool.clone()
    }
}

/// Convert one stdout line into `agent_tool_use` events.
///
/// Each tool_use item that is neither internal nor refused by the circuit
/// breaker becomes exactly one event, in content order — a line carrying
/// several tool_use items (parallel tool calls) yields several events, all
/// stamped with the same source line. Non-tool frames, malformed lines,
/// and refused calls yield none.
pub fn convert_json_to_events(
    line: &str,
    source_line: u64,
    breaker: &CircuitBreaker,
    ctx: &EventContext,
) -> Vec<AgentEvent> {
    let parsed: StreamLine = match serde_json::from_str(line) {
        Ok(parsed) => parsed,
        Err(e) => {
            if env::flag(env::DEBUG_EVENTS) {
                debug!(source_line, error = %e, "skipping malformed stream line");
            }
            return Vec::new();
        }
    };

    match parsed.kind.as_deref() {
        Some("system") | Some("result") => Vec::new(),
        Some("assistant") => {
            let Some(message) = parsed.message else {
                return Vec::new();
            };
            message
                .content
                .iter()
                .filter(|item| item.kind == "tool_use")
                .filter_map(|item| {
                    let name = item.name.as_deref()?;
                    tool_use_event(name, item.input.as_ref(), source_line, breaker, ctx)
                })
                .collect()
        }
        Some("tool_use") => parsed
            .name
            .as_deref()
            .and_then(|name| tool_use_event(name, parsed.input.as_ref(), source_line, breaker, ctx))
            .into_iter()
            .collect(),
        other => {
            if env::flag(env::DEBUG_EVENTS) {
                debug!(source_line, frame = ?other, "skipping unknown frame type");
            }
            Vec::new()
        }
    }
}

fn tool_use_event(
    raw_name: &str,
    input: Option<&Value>,
    source_line: u64,
    breaker: &CircuitBreaker,
    ctx: &EventContext,
) -> Option<AgentEvent> {
    let tool = normalize_tool_name(raw_name)?;
    let data = extract_tool_data(&tool, input);
    if !breaker.record(&tool, data.target_file.as_deref()) {
        if env::flag(env::DEBUG_EVENTS) {
            debug!(source_line, tool, "circuit breaker refused tool call");
        }
        return None;
    }
    Some(
        AgentEvent::new(
            ctx.issue_id.clone(),
            ctx.executor_id.clone(),
            EventKind::AgentToolUse,
            Severity::Info,
            event_message(&data),
        )
        .with_agent(ctx.agent_id.clone())
        .with_source_line(source_line)
        .with_data(EventData::ToolUse(data)),
    )
}
