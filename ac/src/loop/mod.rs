//! Execution loop
//!
//! [`ExecutionLoop`] turns one instruction into a bounded sequence of model
//! calls and tool invocations. [`LoopGuard`] holds the circuit-breaker state
//! for a single run, and the run ends in an [`ExecutionReport`] carrying a
//! typed [`TerminalStatus`].

mod engine;
mod guard;
mod outcome;
mod report;

pub use engine::{ExecutionLoop, REPORT_FAILURE_TOOL, TASK_COMPLETE_TOOL};
pub use guard::{LoopGuard, LoopGuardState, Severity};
pub use outcome::{ExecutionMetrics, ExecutionReport, FailureKind, InterruptKind, TerminalStatus};
pub use report::DiagnosticReport;
