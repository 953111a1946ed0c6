//! CompressionEngine - turns a drained run of tail turns into a persisted block

use std::collections::BTreeMap;
use std::sync::Arc;

use durablestore::{Store, StoreError};
use thiserror::Error;
use tracing::{debug, info};

use crate::llm::Turn;

use super::block::{CompressedBlock, NewBlock, load_blocks};
use super::summarizer::Summarizer;

/// Compression failures; the assembler restores the drained turns on any of them
#[derive(Debug, Error)]
pub enum CompressionError {
    #[error("Summarizer failed: {0}")]
    Summarizer(String),

    #[error("Failed to encode turns: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Summarizes and persists blocks for one session
#[derive(Clone)]
pub struct CompressionEngine {
    summarizer: Arc<dyn Summarizer>,
    store: Option<Arc<Store>>,
    session_id: String,
}

impl CompressionEngine {
    pub fn new(summarizer: Arc<dyn Summarizer>, session_id: impl Into<String>) -> Self {
        let session_id = session_id.into();
        debug!(%session_id, "CompressionEngine::new: called");
        Self {
            summarizer,
            store: None,
            session_id,
        }
    }

    /// Persist blocks keyed by session id
    pub fn with_store(mut self, store: Arc<Store>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Blocks persisted for this session, oldest first
    pub fn load(&self) -> Result<Vec<CompressedBlock>, CompressionError> {
        match &self.store {
            Some(store) => Ok(load_blocks(store, &self.session_id)?),
            None => Ok(Vec::new()),
        }
    }

    /// Summarize `turns` into block `seq`
    ///
    /// `carried` anchors are overlaid verbatim on whatever the summarizer
    /// returned, so no known anchor is ever dropped or rewritten.
    pub async fn compress(
        &self,
        turns: &[Turn],
        seq: u64,
        start_index: usize,
        carried: &BTreeMap<String, String>,
    ) -> Result<CompressedBlock, CompressionError> {
        debug!(session_id = %self.session_id, seq, turn_count = turns.len(), "CompressionEngine::compress: called");
        let summary = self.summarizer.summarize(turns, carried).await?;

        let mut anchors = summary.anchors;
        anchors.extend(carried.iter().map(|(k, v)| (k.clone(), v.clone())));

        let block = NewBlock {
            session_id: &self.session_id,
            seq,
            start_index,
            turns,
            summary: summary.summary,
            diff: summary.diff,
            anchors,
        }
        .build()?;

        if let Some(store) = &self.store {
            store.create(block.clone())?;
        }
        info!(session_id = %self.session_id, seq, anchors = block.anchors.len(), "Compressed block persisted");
        Ok(block)
    }
}
