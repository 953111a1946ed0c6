//! Timed, cancellable tool dispatch
//!
//! Every call runs under a hard timeout and the run's cancellation token. Both
//! outcomes are turned into an error result string, so a stuck or cancelled tool
//! flows through the same failure classification as any other error.

use std::time::{Duration, Instant};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::llm::ToolCall;

use super::ToolRegistry;

/// Default hard timeout per tool call
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(60);

/// A completed tool call; never mutated after creation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub id: String,
    pub name: String,
    pub args: Value,
    pub result: String,
    pub is_error: bool,

    /// Completion time (Unix milliseconds)
    pub timestamp: i64,
    pub duration_ms: u64,
}

impl ToolInvocation {
    /// Record a finished call
    pub fn record(call: &ToolCall, outcome: &DispatchOutcome, duration: Duration, is_error: bool) -> Self {
        Self {
            id: call.id.clone(),
            name: call.name.clone(),
            args: call.args(),
            result: outcome.text().to_string(),
            is_error,
            timestamp: durablestore::now_ms(),
            duration_ms: duration.as_millis() as u64,
        }
    }
}

/// Raw dispatch outcome before classification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Completed(String),
    TimedOut(String),
    Cancelled(String),
}

impl DispatchOutcome {
    /// Result text handed to the model
    pub fn text(&self) -> &str {
        match self {
            DispatchOutcome::Completed(text) | DispatchOutcome::TimedOut(text) | DispatchOutcome::Cancelled(text) => {
                text
            }
        }
    }
}

/// Runs tool calls against a registry with a timeout and a cancellation token
#[derive(Debug, Clone)]
pub struct ToolDispatcher {
    timeout: Duration,
    cancel: CancellationToken,
}

impl ToolDispatcher {
    pub fn new(timeout: Duration, cancel: CancellationToken) -> Self {
        debug!(timeout_ms = timeout.as_millis() as u64, "ToolDispatcher::new: called");
        Self { timeout, cancel }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run one call
    pub async fn dispatch(&self, registry: &dyn ToolRegistry, call: &ToolCall) -> (DispatchOutcome, Duration) {
        debug!(tool = %call.name, id = %call.id, "ToolDispatcher::dispatch: called");
        let started = Instant::now();
        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                warn!(tool = %call.name, "Tool call cancelled");
                DispatchOutcome::Cancelled(format!(
                    "Error: Cancelled! The tool '{}' was cancelled before it finished. No result is available.",
                    call.name
                ))
            }
            result = tokio::time::timeout(self.timeout, registry.execute(&call.name, call.args())) => match result {
                Ok(text) => DispatchOutcome::Completed(text),
                Err(_) => {
                    warn!(tool = %call.name, timeout_secs = self.timeout.as_secs(), "Tool call timed out");
                    DispatchOutcome::TimedOut(format!(
                        "Error: Timeout! The tool '{}' was forcibly terminated because it ran for over {:?}. \
                         Do not run blocking or endless operations in tools; start long-running work in the background.",
                        call.name,
                        self.timeout
                    ))
                }
            },
        };
        (outcome, started.elapsed())
    }

    /// Run a batch of calls, returning outcomes in call order
    ///
    /// With `parallel` the calls run concurrently; ordering of the output is
    /// always the order of `calls`.
    pub async fn dispatch_batch(
        &self,
        registry: &dyn ToolRegistry,
        calls: &[ToolCall],
        parallel: bool,
    ) -> Vec<(DispatchOutcome, Duration)> {
        debug!(count = calls.len(), parallel, "ToolDispatcher::dispatch_batch: called");
        if parallel {
            join_all(calls.iter().map(|call| self.dispatch(registry, call))).await
        } else {
            let mut outcomes = Vec::with_capacity(calls.len());
            for call in calls {
                outcomes.push(self.dispatch(registry, call).await);
            }
            outcomes
        }
    }
}

impl Default for ToolDispatcher {
    fn default() -> Self {
        Self::new(DEFAULT_TOOL_TIMEOUT, CancellationToken::new())
    }
}
