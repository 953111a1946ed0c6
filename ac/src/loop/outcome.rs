//! Terminal statuses, run metrics and the execution report

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::entropy::EntropyAnalysis;
use crate::llm::{TokenUsage, Turn};
use crate::tools::ToolInvocation;

/// Why a run failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Two consecutive empty model responses
    ContextPoisoned,
    /// Text without a tool call under the require-tool-call policy
    Hallucination,
    /// A tool result carried a critical keyword
    CriticalToolFailure,
    /// Hard iteration limit reached
    IterationLimit,
    /// Model errors exhausted their retries
    ModelUnavailable,
    /// The agent called `system_report_failure`
    ReportedByAgent,
}

impl FailureKind {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::ContextPoisoned => "context poisoned",
            Self::Hallucination => "hallucination",
            Self::CriticalToolFailure => "critical tool failure",
            Self::IterationLimit => "iteration limit",
            Self::ModelUnavailable => "model unavailable",
            Self::ReportedByAgent => "reported by agent",
        }
    }
}

/// Why a run was interrupted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptKind {
    /// Identical call batches repeated
    LoopDetected,
    /// A tool kept failing with the same error
    ReplanNeeded,
    /// The agent asked for strategic intervention
    StrategicRequest,
    /// The cancellation token fired
    Cancelled,
}

impl InterruptKind {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::LoopDetected => "loop detected",
            Self::ReplanNeeded => "replan needed",
            Self::StrategicRequest => "strategic request",
            Self::Cancelled => "cancelled",
        }
    }
}

/// How a run ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TerminalStatus {
    /// DONE_SUCCESS
    Success { answer: String },
    /// DONE_FAILURE
    Failure { kind: FailureKind, detail: String },
    /// INTERRUPTED; the caller should replan
    Interrupted { kind: InterruptKind, detail: String },
}

impl TerminalStatus {
    pub fn failure(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self::Failure {
            kind,
            detail: detail.into(),
        }
    }

    pub fn interrupted(kind: InterruptKind, detail: impl Into<String>) -> Self {
        Self::Interrupted {
            kind,
            detail: detail.into(),
        }
    }

    /// Short status label
    pub fn label(&self) -> &'static str {
        match self {
            Self::Success { .. } => "success",
            Self::Failure { .. } => "failure",
            Self::Interrupted { .. } => "interrupted",
        }
    }

    /// Reason tag, e.g. `context poisoned` or `loop detected`
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Success { .. } => "done",
            Self::Failure { kind, .. } => kind.tag(),
            Self::Interrupted { kind, .. } => kind.tag(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Answer on success, diagnostic detail otherwise
    pub fn detail(&self) -> &str {
        match self {
            Self::Success { answer } => answer,
            Self::Failure { detail, .. } | Self::Interrupted { detail, .. } => detail,
        }
    }
}

impl fmt::Display for TerminalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success { .. } => write!(f, "DONE_SUCCESS"),
            Self::Failure { kind, .. } => write!(f, "FAILURE ({})", kind.tag()),
            Self::Interrupted { kind, .. } => write!(f, "INTERRUPTED ({})", kind.tag()),
        }
    }
}

/// Per-run execution statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    pub exec_id: String,

    /// Iterations started (rate-limit waits are not counted)
    pub iterations: u32,

    /// Model calls made, retries included
    pub api_calls: u32,

    pub tokens_input: u64,
    pub tokens_output: u64,
    pub tokens_cached: u64,

    /// Tool call counts by tool name
    pub tool_calls: HashMap<String, u32>,

    /// Iteration timings (duration in ms)
    pub iteration_times_ms: Vec<u64>,

    /// Start time (Unix ms)
    pub started_at: i64,

    /// End time (Unix ms, 0 if still running)
    pub ended_at: i64,

    pub success: bool,
}

impl ExecutionMetrics {
    pub fn new(exec_id: impl Into<String>) -> Self {
        let exec_id = exec_id.into();
        debug!(%exec_id, "ExecutionMetrics::new: called");
        Self {
            exec_id,
            started_at: durablestore::now_ms(),
            ..Default::default()
        }
    }

    pub fn record_iteration(&mut self, duration: Duration) {
        debug!(exec_id = %self.exec_id, duration_ms = duration.as_millis() as u64, "ExecutionMetrics::record_iteration: called");
        self.iteration_times_ms.push(duration.as_millis() as u64);
    }

    pub fn record_api_call(&mut self, usage: &TokenUsage) {
        debug!(exec_id = %self.exec_id, input = usage.input_tokens, output = usage.output_tokens, "ExecutionMetrics::record_api_call: called");
        self.api_calls += 1;
        self.tokens_input += usage.input_tokens;
        self.tokens_output += usage.output_tokens;
        self.tokens_cached += usage.cache_hit_tokens;
    }

    pub fn record_tool_call(&mut self, tool_name: &str) {
        *self.tool_calls.entry(tool_name.to_string()).or_default() += 1;
    }

    pub fn mark_complete(&mut self, success: bool) {
        debug!(exec_id = %self.exec_id, success, "ExecutionMetrics::mark_complete: called");
        self.ended_at = durablestore::now_ms();
        self.success = success;
    }

    /// Distinct tool names used, sorted
    pub fn tools_used(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tool_calls.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn total_tool_calls(&self) -> u32 {
        self.tool_calls.values().sum()
    }

    pub fn total_duration_ms(&self) -> i64 {
        if self.ended_at > 0 {
            self.ended_at - self.started_at
        } else {
            durablestore::now_ms() - self.started_at
        }
    }
}

/// Everything a run returns
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub status: TerminalStatus,

    /// Turns appended during this run, in order
    pub transcript: Vec<Turn>,

    /// Tool calls executed, in issue order
    pub invocations: Vec<ToolInvocation>,

    pub metrics: ExecutionMetrics,

    /// Latest stagnation advisory
    pub entropy: EntropyAnalysis,
}

impl ExecutionReport {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_tags() {
        let poisoned = TerminalStatus::failure(FailureKind::ContextPoisoned, "two empty responses");
        assert_eq!(poisoned.tag(), "context poisoned");
        assert_eq!(poisoned.label(), "failure");
        assert_eq!(poisoned.to_string(), "FAILURE (context poisoned)");

        let looped = TerminalStatus::interrupted(InterruptKind::LoopDetected, "x");
        assert_eq!(looped.tag(), "loop detected");
        assert_eq!(looped.to_string(), "INTERRUPTED (loop detected)");

        let done = TerminalStatus::Success {
            answer: "ok".to_string(),
        };
        assert!(done.is_success());
        assert_eq!(done.detail(), "ok");
    }

    #[test]
    fn test_status_serializes_tagged() {
        let status = TerminalStatus::interrupted(InterruptKind::ReplanNeeded, "shell failing");
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["status"], "interrupted");
        assert_eq!(json["kind"], "replan_needed");
    }

    #[test]
    fn test_metrics_accumulate() {
        let mut metrics = ExecutionMetrics::new("exec-1");
        metrics.record_api_call(&TokenUsage {
            input_tokens: 100,
            output_tokens: 20,
            cache_hit_tokens: 80,
        });
        metrics.record_tool_call("shell");
        metrics.record_tool_call("shell");
        metrics.record_tool_call("read_file");
        metrics.record_iteration(Duration::from_millis(12));
        metrics.mark_complete(true);

        assert_eq!(metrics.api_calls, 1);
        assert_eq!(metrics.tokens_cached, 80);
        assert_eq!(metrics.total_tool_calls(), 3);
        assert_eq!(metrics.tools_used(), vec!["read_file", "shell"]);
        assert!(metrics.success);
        assert!(metrics.total_duration_ms() >= 0);
    }
}
