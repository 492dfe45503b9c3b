//! Circuit breakers: bounded tool usage per agent run.
//!
//! The trip flag is an atomic boolean because the stdout-parsing path sets
//! it and the monitor task polls it at high frequency; the richer reason
//! string and the counter maps are touched less often and live behind one
//! mutex. Counters are never reset mid-run.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// Reads of one path allowed before the breaker trips.
pub const MAX_SAME_FILE_READS: u32 = 20;
/// Reads across all paths allowed before the breaker trips.
pub const MAX_FILE_READS: u32 = 100;
/// Calls per normalized tool (read excluded; it has its own caps).
pub const MAX_SAME_TOOL_CALLS: u32 = 100;
/// Global hard backstop across every tool.
pub const MAX_TOTAL_TOOL_CALLS: u32 = 1000;

#[derive(Default)]
struct Counters {
    total_reads: u32,
    file_reads: HashMap<String, u32>,
    tool_calls: HashMap<String, u32>,
    total_calls: u32,
    loop_reason: Option<String>,
}

#[derive(Default)]
pub struct CircuitBreaker {
    loop_detected: AtomicBool,
    inner: Mutex<Counters>,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock-free check used by the monitor task.
    pub fn tripped(&self) -> bool {
        self.loop_detected.load(Ordering::Acquire)
    }

    pub fn loop_reason(&self) -> Option<String> {
        self.lock().loop_reason.clone()
    }

    /// Record one normalized tool call. Returns false when the breaker is
    /// already tripped or this call trips it; tripped calls must not
    /// produce events.
    pub fn record(&self, tool: &str, target: Option<&str>) -> bool {
        if self.tripped() {
            return false;
        }
        let mut counters = self.lock();

        counters.total_calls += 1;
        if counters.total_calls > MAX_TOTAL_TOOL_CALLS {
            let reason = format!(
                "{} total tool calls exceed limit {MAX_TOTAL_TOOL_CALLS}",
                counters.total_calls
            );
            return self.trip(&mut counters, reason);
        }

        if tool == "read" {
            counters.total_reads += 1;
            if counters.total_reads > MAX_FILE_READS {
                let reason = format!(
                    "{} file reads exceed limit {MAX_FILE_READS}",
                    counters.total_reads
                );
                return self.trip(&mut counters, reason);
            }
            if let Some(path) = target {
                let count = counters.file_reads.entry(path.to_string()).or_insert(0);
                *count += 1;
                if *count > MAX_SAME_FILE_READS {
                    let count = *count;
                    let reason = format!(
                        "read '{path}' {count} times, limit {MAX_SAME_FILE_READS}"
                    );
                    return self.trip(&mut counters, reason);
                }
            }
        } else {
            let count = counters.tool_calls.entry(tool.to_string()).or_insert(0);
            *count += 1;
            if *count > MAX_SAME_TOOL_CALLS {
                let count = *count;
                let reason =
                    format!("called '{tool}' {count} times, limit {MAX_SAME_TOOL_CALLS}");
                return self.trip(&mut counters, reason);
            }
        }
        true
    }

    fn trip(&self, counters: &mut Counters, reason: String) -> bool {
        if counters.loop_reason.is_none() {
            counters.loop_reason = Some(reason);
        }
        self.loop_detected.store(true, Ordering::Release);
        false
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Counters> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
