//! Structured agent reports.
//!
//! Agents end a run by printing a JSON report describing how the work
//! concluded. Three extraction strategies are tried in order: explicit
//! markers, a fenced code block, then a last-JSON-object scan over the tail
//! of the output. The first strategy producing a report that parses and
//! validates wins.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::types::{IssueKind, Priority};

const REPORT_BEGIN: &str = "=== AGENT REPORT ===";
const REPORT_END: &str = "=== END AGENT REPORT ===";
/// Strategy (c) only scans this many trailing bytes.
const TAIL_SCAN_BYTES: usize = 10 * 1024;

/// Epic definition carried by a decomposition report.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpicSpec {
    pub title: String,
    pub description: String,
}

/// Child issue definition carried by a decomposition report.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildSpec {
    pub title: String,
    pub description: String,
    #[serde(rename = "type")]
    pub kind: IssueKind,
    pub priority: Priority,
}

/// End-of-run report, tagged by status.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum AgentReport {
    Completed {
        summary: String,
    },
    Blocked {
        #[serde(default)]
        summary: String,
        #[serde(default)]
        blockers: Vec<String>,
    },
    Partial {
        #[serde(default)]
        summary: String,
        #[serde(default)]
        remaining: Vec<String>,
        #[serde(default)]
        completed: Vec<String>,
    },
    Decomposed {
        #[serde(default)]
        summary: String,
        reasoning: String,
        epic: EpicSpec,
        children: Vec<ChildSpec>,
    },
}

impl AgentReport {
    pub fn status(&self) -> &'static str {
        match self {
            Self::Completed { .. } => "completed",
            Self::Blocked { .. } => "blocked",
            Self::Partial { .. } => "partial",
            Self::Decomposed { .. } => "decomposed",
        }
    }

    pub fn summary(&self) -> &str {
        match self {
            Self::Completed { summary }
            | Self::Blocked { summary, .. }
            | Self::Partial { summary, .. }
            | Self::Decomposed { summary, .. } => summary,
        }
    }

    /// Enforce the per-status required fields.
    pub fn validate(&self) -> Result<(), AppError> {
        match self {
            Self::Completed { summary } => {
                if summary.trim().is_empty() {
                    return Err(AppError::ReportInvalid(
                        "completed report requires a summary".into(),
                    ));
                }
            }
            Self::Blocked { blockers, .. } => {
                if blockers.is_empty() || blockers.iter().all(|b| b.trim().is_empty()) {
                    return Err(AppError::ReportInvalid(
                        "blocked report requires at least one blocker".into(),
                    ));
                }
            }
            Self::Partial { remaining, .. } => {
                if remaining.is_empty() || remaining.iter().all(|r| r.trim().is_empty()) {
                    return Err(AppError::ReportInvalid(
                        "partial report requires remaining work items".into(),
                    ));
                }
            }
            Self::Decomposed {
                reasoning,
                epic,
                children,
                ..
            } => {
                if reasoning.trim().is_empty() {
                    return Err(AppError::ReportInvalid(
                        "decomposed report requires reasoning".into(),
                    ));
                }
                if epic.title.trim().is_empty() {
                    return Err(AppError::ReportInvalid(
                        "decomposed report requires an epic title".into(),
                    ));
                }
                if children.is_empty() {
                    return Err(AppError::ReportInvalid(
                        "decomposed report requires at least one child".into(),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Extract a validated report from agent output, or None.
pub fn extract_report(output: &str) -> Option<AgentReport> {
    extract_between_markers(output)
        .or_else(|| extract_fenced(output))
        .or_else(|| extract_tail_json(output))
}

/// Parse + validate one candidate. Rejects anything without a `status` field
/// before attempting the typed parse.
fn parse_candidate(text: &str) -> Option<AgentReport> {
    let value: serde_json::Value = serde_json::from_str(text.trim()).ok()?;
    value.get("status")?;
    let report: AgentReport = serde_json::from_value(value).ok()?;
    report.validate().ok()?;
    Some(report)
}

/// Strategy (a): literal begin/end markers.
fn extract_between_markers(output: &str) -> Option<AgentReport> {
    let start = output.rfind(REPORT_BEGIN)? + REPORT_BEGIN.len();
    let rest = &output[start..];
    let end = rest.find(REPORT_END).map(|i| &rest[..i]).unwrap_or(rest);
    parse_candidate(end)
}

/// Strategy (b): fenced block labeled `agent-report` or `json`.
fn extract_fenced(output: &str) -> Option<AgentReport> {
    static FENCE: OnceLock<Regex> = OnceLock::new();
    let re = FENCE.get_or_init(|| {
        Regex::new(r"(?s)```(?:agent-report|json)[ \t]*\n(.*?)```").expect("fence regex")
    });
    re.captures_iter(output)
        .find_map(|caps| parse_candidate(caps.get(1)?.as_str()))
}

/// Strategy (c): last balanced JSON object within the final 10 KiB.
/// Brace balancing ignores string contents, which is acceptable for a
/// last-resort heuristic; candidates that fail to parse are skipped.
fn extract_tail_json(output: &str) -> Option<AgentReport> {
    let tail = tail_slice(output, TAIL_SCAN_BYTES);
    let bytes = tail.as_bytes();
    let mut end = bytes.len();
    while let Some(close) = bytes[..end].iter().rposition(|&b| b == b'}') {
        if let Some(open) = matching_open_brace(bytes, close) {
            if let Some(report) = parse_candidate(&tail[open..=close]) {
                return Some(report);
            }
        }
        end = close;
    }
    None
}

fn matching_open_brace(bytes: &[u8], close: usize) -> Option<usize> {
    let mut depth = 0usize;
    for i in (0..=close).rev() {
        match bytes[i] {
            b'}' => depth += 1,
            b'{' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Last `max_bytes` of `text`, snapped forward to a char boundary.
fn tail_slice(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut start = text.len() - max_bytes;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}
