//! AgentCore - execution core for tool-using agents
//!
//! AgentCore drives a single instruction through a bounded ReAct loop: the
//! model is called, the tools it asks for are executed, and the results are
//! fed back until the run reaches a typed terminal status. Runs are guarded
//! against the usual failure modes of autonomous agents.
//!
//! # Core Concepts
//!
//! - **Bounded Runs**: A soft limit triggers diagnostic hints, a hard limit ends the run
//! - **Circuit Breakers**: Repeated calls, repeated errors and empty replies trip the [`r#loop::LoopGuard`]
//! - **Stagnation Detection**: [`entropy::EntropyMonitor`] spots sliding-window repetition
//! - **Cache-Stable Prompts**: [`context::ContextAssembler`] keeps the prompt prefix byte-stable
//! - **Durable Planning**: [`mission::MissionTree`] and [`mission::DecisionLog`] persist objectives and choices
//!
//! # Modules
//!
//! - [`r#loop`] - Execution loop, guard and terminal status
//! - [`context`] - Prompt assembly and history compression
//! - [`mission`] - Mission tree and decision log
//! - [`entropy`] - Stagnation detection
//! - [`events`] - Observability sink and event bus
//! - [`llm`] - Model client trait and wire types
//! - [`tools`] - Tool registry, dispatch and result classification
//! - [`config`] - Configuration types and loading

pub mod config;
pub mod context;
pub mod entropy;
pub mod events;
pub mod llm;
pub mod logging;
pub mod mission;
pub mod tools;

// Note: 'loop' is a reserved keyword, so we use r#loop
#[path = "loop/mod.rs"]
pub mod r#loop;

// Re-export commonly used types
pub use config::{Config, ContextConfig, EntropyConfig, ExecutionLimits, ResponsePolicy};
pub use context::{CompressedBlock, CompressionEngine, ContextAssembler, ModelSummarizer, Summarizer};
pub use entropy::{EntropyAnalysis, EntropyMonitor, EntropyStatus};
pub use events::{EventBus, EventEmitter, ExecutionEvent, ObservabilitySink};
pub use llm::{ChatRequest, ChatResponse, ModelClient, ModelError, ToolCall, Turn};
pub use mission::{DecisionLog, DecisionOutcome, DecisionRecord, Mission, MissionError, MissionStatus, MissionTree};
pub use r#loop::{
    ExecutionLoop, ExecutionMetrics, ExecutionReport, FailureKind, InterruptKind, LoopGuard, TerminalStatus,
};
pub use tools::{Tool, ToolRegistry, ToolResult, ToolSet};
