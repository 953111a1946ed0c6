//! Tool invocation layer
//!
//! Tools themselves are external collaborators. This module defines how they
//! are registered, invoked under a timeout, and how their results are classified.

pub mod classify;
mod dispatch;
mod registry;
mod traits;

pub use classify::{CompressedError, compress_error, detect_error, find_critical_keyword};
pub use dispatch::{DEFAULT_TOOL_TIMEOUT, DispatchOutcome, ToolDispatcher, ToolInvocation};
pub use registry::ToolSet;
pub use traits::{Tool, ToolRegistry, ToolResult};
