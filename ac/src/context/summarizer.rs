//! Summarizer collaborator used by compression

use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::llm::{ChatRequest, ModelClient, Role, Turn};

use super::CompressionError;

static JSON_OBJECT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)\{.*\}").unwrap());

const SUMMARIZER_PROMPT: &str = "You compress agent transcripts. Reply with one JSON object and nothing else:\n\
{\"summary\": \"what happened\", \"diff\": \"what changed in the environment\", \
\"anchors\": {\"name\": \"exact value\"}}\n\
Anchors are stable facts (paths, identifiers, numbers, ports) copied verbatim. \
Keep every anchor listed under KNOWN ANCHORS unchanged.";

/// Summarizer output
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSummary {
    #[serde(default)]
    pub summary: String,

    #[serde(default)]
    pub diff: String,

    #[serde(default)]
    pub anchors: BTreeMap<String, String>,
}

/// Turns a run of raw turns into `{summary, diff, anchors}`
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// `known_anchors` are the anchors already carried by the session
    async fn summarize(
        &self,
        turns: &[Turn],
        known_anchors: &BTreeMap<String, String>,
    ) -> Result<BlockSummary, CompressionError>;
}

/// Summarizer backed by a [`ModelClient`]
pub struct ModelSummarizer {
    client: Arc<dyn ModelClient>,
}

impl ModelSummarizer {
    pub fn new(client: Arc<dyn ModelClient>) -> Self {
        Self { client }
    }

    fn render_transcript(turns: &[Turn], known_anchors: &BTreeMap<String, String>) -> String {
        let mut out = String::new();
        if !known_anchors.is_empty() {
            out.push_str("KNOWN ANCHORS:\n");
            for (key, value) in known_anchors {
                out.push_str(&format!("- {}: {}\n", key, value));
            }
            out.push('\n');
        }
        out.push_str("TRANSCRIPT:\n");
        for turn in turns {
            let role = match turn.role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
                Role::Tool => "tool",
            };
            out.push_str(&format!("[{}] {}\n", role, turn.content));
            for call in &turn.tool_calls {
                out.push_str(&format!("  -> {}({})\n", call.name, call.args_json));
            }
        }
        out
    }
}

/// Extract `{summary, diff, anchors}` from model text
///
/// Falls back to the raw text as the summary when no JSON object parses.
pub fn parse_summary(text: &str) -> BlockSummary {
    let parsed = JSON_OBJECT
        .find(text)
        .and_then(|m| serde_json::from_str::<Value>(m.as_str()).ok())
        .filter(Value::is_object);

    let Some(value) = parsed else {
        warn!("Summarizer reply was not JSON, keeping raw text");
        return BlockSummary {
            summary: text.trim().to_string(),
            ..Default::default()
        };
    };

    let field = |name: &str| match value.get(name) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    };
    let anchors = value
        .get("anchors")
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .map(|(k, v)| {
                    let v = match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    (k.clone(), v)
                })
                .collect()
        })
        .unwrap_or_default();

    BlockSummary {
        summary: field("summary"),
        diff: field("diff"),
        anchors,
    }
}

#[async_trait]
impl Summarizer for ModelSummarizer {
    async fn summarize(
        &self,
        turns: &[Turn],
        known_anchors: &BTreeMap<String, String>,
    ) -> Result<BlockSummary, CompressionError> {
        debug!(turn_count = turns.len(), "ModelSummarizer::summarize: called");
        let request = ChatRequest {
            messages: vec![
                Turn::system(SUMMARIZER_PROMPT),
                Turn::user(Self::render_transcript(turns, known_anchors)),
            ],
            tools: vec![],
        };
        let response = self
            .client
            .chat(request)
            .await
            .map_err(|e| CompressionError::Summarizer(e.to_string()))?;
        let text = response
            .trimmed_content()
            .ok_or_else(|| CompressionError::Summarizer("empty summarizer response".to_string()))?;
        Ok(parse_summary(text))
    }
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Summarizer with a fixed reply
    pub struct StaticSummarizer {
        reply: Result<BlockSummary, String>,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl StaticSummarizer {
        pub fn new(anchors: &[(&str, &str)]) -> Self {
            Self {
                reply: Ok(BlockSummary {
                    summary: "did things".to_string(),
                    diff: "files changed".to_string(),
                    anchors: anchors.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
                }),
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
            }
        }

        pub fn failing() -> Self {
            Self {
                reply: Err("summarizer offline".to_string()),
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
            }
        }

        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Summarizer for StaticSummarizer {
        async fn summarize(
            &self,
            _turns: &[Turn],
            _known_anchors: &BTreeMap<String, String>,
        ) -> Result<BlockSummary, CompressionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.reply.clone().map_err(CompressionError::Summarizer)
        }
    }
}
