//! CompressedBlock - one immutable summary of a run of raw turns

use std::collections::{BTreeMap, HashMap};

use durablestore::{Filter, IndexValue, Record, Store, StoreError, now_ms};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::llm::Turn;

/// Summary of `2 × block_size` raw turns
///
/// Never edited after creation; the assembler only ever appends new blocks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressedBlock {
    /// `{session_id}:{seq:06}`
    pub id: String,
    pub session_id: String,

    /// Monotonic within the session, starting at 1
    pub seq: u64,

    /// Absolute index of the first replaced turn
    pub start_index: usize,

    /// Absolute index of the last replaced turn (inclusive)
    pub end_index: usize,

    pub summary: String,
    pub diff: String,
    pub anchors: BTreeMap<String, String>,

    /// sha256 of the replaced turns' JSON
    pub raw_hash: String,

    pub created_at: i64,
    pub updated_at: i64,
}

impl CompressedBlock {
    pub fn block_id(session_id: &str, seq: u64) -> String {
        format!("{}:{:06}", session_id, seq)
    }

    /// Number of raw turns this block replaces
    pub fn turn_count(&self) -> usize {
        self.end_index + 1 - self.start_index
    }

    /// System turn text for the prompt
    pub fn render(&self) -> String {
        let anchors = serde_json::to_string(&self.anchors).unwrap_or_else(|_| "{}".to_string());
        format!(
            "--- Block {} (turns {}-{}) ---\nSummary: {}\nDiff: {}\nAnchors: {}",
            self.seq, self.start_index, self.end_index, self.summary, self.diff, anchors
        )
    }

    /// Whether `turns` are the ones this block replaced
    pub fn verify(&self, turns: &[Turn]) -> bool {
        hash_turns(turns).is_ok_and(|hash| hash == self.raw_hash)
    }
}

/// Integrity hash of a run of turns
pub fn hash_turns(turns: &[Turn]) -> Result<String, serde_json::Error> {
    let bytes = serde_json::to_vec(turns)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

impl Record for CompressedBlock {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "compressed_blocks"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("session_id".to_string(), IndexValue::String(self.session_id.clone()));
        fields.insert("seq".to_string(), IndexValue::Int(self.seq as i64));
        fields
    }
}

/// Persisted blocks of a session, oldest first
pub fn load_blocks(store: &Store, session_id: &str) -> Result<Vec<CompressedBlock>, StoreError> {
    debug!(%session_id, "load_blocks: called");
    let mut blocks: Vec<CompressedBlock> = store.list(&[Filter::eq("session_id", session_id)])?;
    blocks.sort_by_key(|b| b.seq);
    Ok(blocks)
}

/// Builder input for a new block
pub(crate) struct NewBlock<'a> {
    pub session_id: &'a str,
    pub seq: u64,
    pub start_index: usize,
    pub turns: &'a [Turn],
    pub summary: String,
    pub diff: String,
    pub anchors: BTreeMap<String, String>,
}

impl NewBlock<'_> {
    pub fn build(self) -> Result<CompressedBlock, serde_json::Error> {
        let now = now_ms();
        Ok(CompressedBlock {
            id: CompressedBlock::block_id(self.session_id, self.seq),
            session_id: self.session_id.to_string(),
            seq: self.seq,
            start_index: self.start_index,
            end_index: self.start_index + self.turns.len().saturating_sub(1),
            summary: self.summary,
            diff: self.diff,
            anchors: self.anchors,
            raw_hash: hash_turns(self.turns)?,
            created_at: now,
            updated_at: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(session: &str, seq: u64, turns: &[Turn]) -> CompressedBlock {
        NewBlock {
            session_id: session,
            seq,
            start_index: (seq as usize - 1) * turns.len(),
            turns,
            summary: format!("summary {}", seq),
            diff: "none".to_string(),
            anchors: BTreeMap::from([("path".to_string(), "/etc/hosts".to_string())]),
        }
        .build()
        .unwrap()
    }

    #[test]
    fn test_block_indices_and_hash() {
        let turns = vec![Turn::user("a"), Turn::assistant("b", vec![])];
        let b = block("s1", 1, &turns);
        assert_eq!(b.id, "s1:000001");
        assert_eq!((b.start_index, b.end_index), (0, 1));
        assert_eq!(b.turn_count(), 2);
        assert!(b.verify(&turns));
        assert!(!b.verify(&turns[..1]));
    }

    #[test]
    fn test_render_is_deterministic() {
        let turns = vec![Turn::user("a")];
        let b = block("s1", 3, &turns);
        assert_eq!(b.render(), b.clone().render());
        assert!(b.render().starts_with("--- Block 3 (turns 2-2) ---"));
        assert!(b.render().contains(r#"Anchors: {"path":"/etc/hosts"}"#));
    }

    #[test]
    fn test_load_blocks_filters_by_session_in_seq_order() {
        let store = Store::open_in_memory().unwrap();
        let turns = vec![Turn::user("a")];
        store.create(block("s1", 2, &turns)).unwrap();
        store.create(block("s1", 1, &turns)).unwrap();
        store.create(block("other", 1, &turns)).unwrap();

        let loaded = load_blocks(&store, "s1").unwrap();
        let seqs: Vec<u64> = loaded.iter().map(|b| b.seq).collect();
        assert_eq!(seqs, vec![1, 2]);
    }
}
