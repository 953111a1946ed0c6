//! Tool-call wire formats and normalization
//!
//! Providers deliver tool calls either nested under a `function` object with
//! string-encoded arguments, or flat with `arguments`/`input`/`args` given as an
//! object. Both are converted here into [`ToolCall`]; nothing past this module
//! looks at the wire shape again.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

use super::types::ToolCall;

/// Tool call exactly as a provider sent it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawToolCall {
    /// `{"id", "type": "function", "function": {"name", "arguments"}}`
    Function {
        #[serde(default)]
        id: Option<String>,
        function: FunctionCall,
    },
    /// `{"id", "name", "arguments" | "input" | "args"}`
    Flat {
        #[serde(default)]
        id: Option<String>,
        name: String,
        #[serde(default, alias = "input", alias = "args")]
        arguments: Value,
    },
}

/// Nested `function` object of the function-style wire format
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

impl RawToolCall {
    /// Flat call with structured arguments
    pub fn flat(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        RawToolCall::Flat {
            id: Some(id.into()),
            name: name.into(),
            arguments,
        }
    }

    /// Function-style call with string-encoded arguments
    pub fn function(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        RawToolCall::Function {
            id: Some(id.into()),
            function: FunctionCall {
                name: name.into(),
                arguments: Value::String(arguments.into()),
            },
        }
    }
}

/// Convert a batch of wire calls into canonical calls
///
/// Calls without an id get `call_{iteration}_{index}`.
pub fn normalize_tool_calls(raw: &[RawToolCall], iteration: u32) -> Vec<ToolCall> {
    debug!(count = raw.len(), iteration, "normalize_tool_calls: called");
    raw.iter()
        .enumerate()
        .map(|(idx, call)| {
            let (id, name, arguments) = match call {
                RawToolCall::Function { id, function } => (id, &function.name, &function.arguments),
                RawToolCall::Flat { id, name, arguments } => (id, name, arguments),
            };
            let id = id
                .as_deref()
                .filter(|id| !id.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| format!("call_{}_{}", iteration, idx));
            ToolCall {
                id,
                name: name.clone(),
                args_json: canonical_args(arguments),
            }
        })
        .collect()
}

/// Canonical JSON text for arguments
///
/// String-encoded arguments are parsed first; unparseable strings are kept verbatim.
pub fn canonical_args(arguments: &Value) -> String {
    match arguments {
        Value::Null => "{}".to_string(),
        Value::String(text) => match serde_json::from_str::<Value>(text) {
            Ok(parsed) => canonicalize(parsed).to_string(),
            Err(_) => {
                debug!("canonical_args: arguments are not JSON, keeping raw text");
                text.clone()
            }
        },
        other => canonicalize(other.clone()).to_string(),
    }
}

fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<String, Value> = map.into_iter().map(|(k, v)| (k, canonicalize(v))).collect();
            Value::Object(sorted.into_iter().collect())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

/// Signature of a whole call batch: sha256 over `name:args` fragments joined by `|`
pub fn batch_signature(calls: &[ToolCall]) -> String {
    let joined = calls
        .iter()
        .map(ToolCall::signature_fragment)
        .collect::<Vec<_>>()
        .join("|");
    hex::encode(Sha256::digest(joined.as_bytes()))
}
