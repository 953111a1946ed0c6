//! Diagnostic report synthesized when a run exhausts its hard limit

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::guard::LoopGuardState;

/// Aggregated failure history of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticReport {
    pub reason: String,
    pub iterations: u32,

    /// Recent compressed error reports per tool, oldest first
    pub tool_failures: BTreeMap<String, Vec<String>>,

    /// Batches that repeated their predecessor
    pub loop_warnings: u32,
}

impl DiagnosticReport {
    pub fn from_guard(reason: impl Into<String>, iterations: u32, state: &LoopGuardState) -> Self {
        Self {
            reason: reason.into(),
            iterations,
            tool_failures: state.error_history.clone(),
            loop_warnings: state.loop_warnings,
        }
    }
}

impl fmt::Display for DiagnosticReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "[SYSTEM_DIAGNOSTIC_REPORT]")?;
        writeln!(f, "Reason: {}", self.reason)?;
        writeln!(f, "Iterations: {}", self.iterations)?;
        writeln!(f, "Loop warnings: {}", self.loop_warnings)?;
        if self.tool_failures.is_empty() {
            write!(f, "Tool failures: none")
        } else {
            write!(f, "Tool failures:")?;
            for (tool, reports) in &self.tool_failures {
                write!(f, "\n- {} ({} recent):", tool, reports.len())?;
                for (n, report) in reports.iter().enumerate() {
                    write!(f, "\n  #{} {}", n + 1, report.replace('\n', "\n    "))?;
                }
            }
            Ok(())
        }
    }
}
