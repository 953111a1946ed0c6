//! LoopGuard - circuit-breaker policy for one execution run
//!
//! Every counter lives in [`LoopGuardState`], owned by exactly one guard, so
//! concurrent runs never share state and tests can build a fresh guard per
//! scenario.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::ExecutionLimits;
use crate::tools::find_critical_keyword;

/// Error reports kept per tool
pub const MAX_ERROR_HISTORY: usize = 5;

/// Outcome of a guard check
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Nothing to report
    Clear,
    /// Suspicious; inject a hint and continue
    Advisory,
    /// Terminal; stop the run
    Trip,
}

impl Severity {
    pub fn is_trip(&self) -> bool {
        matches!(self, Severity::Trip)
    }
}

/// Mutable guard state, threaded through every iteration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoopGuardState {
    /// Signature of the previous call batch
    pub last_signature: Option<String>,

    /// Consecutive batches carrying `last_signature`, the first one included
    pub repeat_count: u32,

    /// Batches that repeated their predecessor
    pub loop_warnings: u32,

    /// Consecutive identical error fingerprints per tool
    pub error_streaks: HashMap<String, Vec<String>>,

    /// Recent error reports per tool, oldest first, for diagnostics
    pub error_history: BTreeMap<String, Vec<String>>,

    /// Consecutive empty model responses
    pub empty_streak: u32,
}

/// Circuit-breaker policy
#[derive(Debug, Clone)]
pub struct LoopGuard {
    repeat_trip: u32,
    error_trip: u32,
    critical_keywords: Vec<String>,
    state: LoopGuardState,
}

impl LoopGuard {
    pub fn new(repeat_trip: u32, error_trip: u32, critical_keywords: Vec<String>) -> Self {
        debug!(repeat_trip, error_trip, "LoopGuard::new: called");
        Self {
            repeat_trip: repeat_trip.max(1),
            error_trip: error_trip.max(1),
            critical_keywords,
            state: LoopGuardState::default(),
        }
    }

    pub fn from_limits(limits: &ExecutionLimits) -> Self {
        Self::new(limits.repeat_trip, limits.error_trip, limits.critical_keywords.clone())
    }

    pub fn state(&self) -> &LoopGuardState {
        &self.state
    }

    /// Forget all counters
    pub fn reset(&mut self) {
        debug!("LoopGuard::reset: called");
        self.state = LoopGuardState::default();
    }

    /// Track the signature of the current call batch
    ///
    /// Trips when the same signature has been seen in `repeat_trip` consecutive
    /// batches; any repeat below that is advisory.
    pub fn check_repeated_call(&mut self, signature: &str) -> Severity {
        let repeated = self.state.last_signature.as_deref() == Some(signature);
        if repeated {
            self.state.repeat_count += 1;
            self.state.loop_warnings += 1;
        } else {
            self.state.repeat_count = 1;
            self.state.last_signature = Some(signature.to_string());
        }
        debug!(
            repeat_count = self.state.repeat_count,
            repeated, "LoopGuard::check_repeated_call: called"
        );

        if self.state.repeat_count >= self.repeat_trip {
            warn!(repeat_count = self.state.repeat_count, "Loop detected: identical tool calls");
            Severity::Trip
        } else if repeated {
            Severity::Advisory
        } else {
            Severity::Clear
        }
    }

    /// Track an error fingerprint for `tool`
    ///
    /// A fingerprint that differs from the tool's previous one restarts the streak.
    pub fn check_tool_error(&mut self, tool: &str, fingerprint: &str, report: &str) -> Severity {
        let streak = self.state.error_streaks.entry(tool.to_string()).or_default();
        if streak.last().is_some_and(|last| last != fingerprint) {
            info!(%tool, "New error for tool, resetting failure streak");
            streak.clear();
        }
        streak.push(fingerprint.to_string());
        let count = streak.len() as u32;
        let history = self.state.error_history.entry(tool.to_string()).or_default();
        if history.len() == MAX_ERROR_HISTORY {
            history.remove(0);
        }
        history.push(report.to_string());
        debug!(%tool, count, "LoopGuard::check_tool_error: called");

        if count >= self.error_trip {
            warn!(%tool, count, "Tool failed with identical errors");
            Severity::Trip
        } else if count > 1 {
            Severity::Advisory
        } else {
            Severity::Clear
        }
    }

    /// A successful result ends the tool's error streak
    pub fn record_tool_success(&mut self, tool: &str) {
        if let Some(streak) = self.state.error_streaks.get_mut(tool) {
            debug!(%tool, "LoopGuard::record_tool_success: clearing streak");
            streak.clear();
        }
    }

    /// Unrecoverable keyword contained in a result, if any
    pub fn check_critical_keyword<'a>(&'a self, result_text: &str) -> Option<&'a str> {
        let found = find_critical_keyword(result_text, &self.critical_keywords);
        if let Some(keyword) = found {
            warn!(%keyword, "Critical keyword in tool result");
        }
        found
    }

    /// Track an empty model response
    ///
    /// The first is advisory (retry with a corrective note), a second
    /// consecutive one trips.
    pub fn check_empty_response(&mut self) -> Severity {
        self.state.empty_streak += 1;
        debug!(empty_streak = self.state.empty_streak, "LoopGuard::check_empty_response: called");
        if self.state.empty_streak >= 2 {
            warn!("Consecutive empty responses, context poisoned");
            Severity::Trip
        } else {
            Severity::Advisory
        }
    }

    /// A non-empty response ends the empty streak
    pub fn record_response(&mut self) {
        self.state.empty_streak = 0;
    }
}

impl Default for LoopGuard {
    fn default() -> Self {
        Self::from_limits(&ExecutionLimits::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_repeated_call_trips_on_fifth_identical_batch() {
        let mut guard = LoopGuard::default();
        assert_eq!(guard.check_repeated_call("sig"), Severity::Clear);
        for _ in 0..3 {
            assert_eq!(guard.check_repeated_call("sig"), Severity::Advisory);
        }
        assert_eq!(guard.check_repeated_call("sig"), Severity::Trip);
        assert_eq!(guard.state().loop_warnings, 4);
    }

    #[test]
    fn test_different_signature_resets_repeat_count() {
        let mut guard = LoopGuard::default();
        for _ in 0..4 {
            guard.check_repeated_call("a");
        }
        assert_eq!(guard.check_repeated_call("b"), Severity::Clear);
        assert_eq!(guard.state().repeat_count, 1);
    }

    #[test]
    fn test_identical_errors_trip_on_third() {
        let mut guard = LoopGuard::default();
        assert_eq!(guard.check_tool_error("shell", "fp1", "r"), Severity::Clear);
        assert_eq!(guard.check_tool_error("shell", "fp1", "r"), Severity::Advisory);
        assert_eq!(guard.check_tool_error("shell", "fp1", "r"), Severity::Trip);
    }

    #[test]
    fn test_novel_error_resets_streak() {
        let mut guard = LoopGuard::default();
        guard.check_tool_error("shell", "fp1", "r1");
        guard.check_tool_error("shell", "fp1", "r1");
        assert_eq!(guard.check_tool_error("shell", "fp2", "r2"), Severity::Clear);
        assert_eq!(guard.state().error_history["shell"], vec!["r1", "r1", "r2"]);
    }

    #[test]
    fn test_error_history_is_bounded() {
        let mut guard = LoopGuard::default();
        for i in 0..MAX_ERROR_HISTORY + 3 {
            guard.check_tool_error("shell", &format!("fp{}", i), &format!("r{}", i));
        }
        let history = &guard.state().error_history["shell"];
        assert_eq!(history.len(), MAX_ERROR_HISTORY);
        assert_eq!(history.first().map(String::as_str), Some("r3"));
        assert_eq!(history.last().map(String::as_str), Some("r7"));
    }

    #[test]
    fn test_streaks_are_per_tool_and_success_resets() {
        let mut guard = LoopGuard::default();
        guard.check_tool_error("a", "fp", "r");
        guard.check_tool_error("b", "fp", "r");
        guard.check_tool_error("a", "fp", "r");
        guard.record_tool_success("a");
        assert_eq!(guard.check_tool_error("a", "fp", "r"), Severity::Clear);
        assert_eq!(guard.check_tool_error("b", "fp", "r"), Severity::Advisory);
    }

    #[test]
    fn test_empty_response_escalates() {
        let mut guard = LoopGuard::default();
        assert_eq!(guard.check_empty_response(), Severity::Advisory);
        assert_eq!(guard.check_empty_response(), Severity::Trip);

        guard.reset();
        assert_eq!(guard.check_empty_response(), Severity::Advisory);
        guard.record_response();
        assert_eq!(guard.check_empty_response(), Severity::Advisory);
    }

    #[test]
    fn test_critical_keyword() {
        let guard = LoopGuard::default();
        assert_eq!(
            guard.check_critical_keyword("Error: OPENAI_API_KEY not set, api_key missing"),
            Some("api_key")
        );
        assert_eq!(guard.check_critical_keyword("wrote 3 files"), None);
    }

    proptest! {
        #[test]
        fn prop_identical_batches_trip_within_repeat_limit(extra in 0usize..20, sig in "[a-f0-9]{8}") {
            let mut guard = LoopGuard::default();
            let mut tripped_at = None;
            for i in 1..=(5 + extra) {
                if guard.check_repeated_call(&sig).is_trip() {
                    tripped_at = Some(i);
                    break;
                }
            }
            prop_assert_eq!(tripped_at, Some(5));
        }

        #[test]
        fn prop_third_fingerprint_decides(first in "[a-z]{4}", third in "[a-z]{4}") {
            let mut guard = LoopGuard::default();
            guard.check_tool_error("tool", &first, "r");
            guard.check_tool_error("tool", &first, "r");
            let severity = guard.check_tool_error("tool", &third, "r");
            if third == first {
                prop_assert_eq!(severity, Severity::Trip);
            } else {
                prop_assert!(!severity.is_trip());
            }
        }
    }
}
