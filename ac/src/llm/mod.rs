//! Model collaborator interface
//!
//! The model backend itself lives outside this crate; this module defines the
//! request/response types it speaks, the [`ModelClient`] trait, and the wire
//! normalization of tool calls.

pub mod client;
mod error;
mod types;
pub mod wire;

pub use client::ModelClient;
pub use error::ModelError;
pub use types::{ChatRequest, ChatResponse, Role, StreamChunk, TokenUsage, ToolCall, ToolDefinition, Turn};
pub use wire::{FunctionCall, RawToolCall, batch_signature, normalize_tool_calls};
