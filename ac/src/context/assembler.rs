//! ContextAssembler - three-tier prompt construction
//!
//! Messages are laid out as an immutable identity prefix, the append-only list
//! of compressed blocks, the instruction, and finally the volatile tail of raw
//! turns. Nothing before the tail is ever edited, so successive prompts share a
//! byte-stable prefix.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ContextConfig;
use crate::llm::{Role, Turn};

use super::block::CompressedBlock;
use super::compression::{CompressionEngine, CompressionError};

#[derive(Default)]
struct ContextState {
    blocks: Vec<CompressedBlock>,

    /// Turns handed to a running compression, oldest first
    in_flight: Vec<Turn>,
    tail: Vec<Turn>,

    /// Absolute index of the first turn not yet covered by a block
    next_index: usize,
    pinned_anchors: BTreeMap<String, String>,
    pending: Option<JoinHandle<()>>,
}

impl ContextState {
    fn carried_anchors(&self) -> BTreeMap<String, String> {
        let mut anchors = self.blocks.last().map(|b| b.anchors.clone()).unwrap_or_default();
        anchors.extend(self.pinned_anchors.iter().map(|(k, v)| (k.clone(), v.clone())));
        anchors
    }

    fn next_seq(&self) -> u64 {
        self.blocks.last().map(|b| b.seq + 1).unwrap_or(1)
    }

    fn compressing(&self) -> bool {
        !self.in_flight.is_empty()
    }
}

/// Builds the ordered message list for each model call
#[derive(Clone)]
pub struct ContextAssembler {
    identity_prompt: String,
    block_size: usize,
    engine: Option<CompressionEngine>,
    state: Arc<Mutex<ContextState>>,
}

impl ContextAssembler {
    /// Assembler without compression; the tail grows unbounded
    pub fn new(config: &ContextConfig) -> Self {
        debug!(block_size = config.block_size, "ContextAssembler::new: called");
        Self {
            identity_prompt: config.identity_prompt.clone(),
            block_size: config.block_size.max(1),
            engine: None,
            state: Arc::new(Mutex::new(ContextState::default())),
        }
    }

    /// Assembler with compression, resuming the engine's persisted blocks
    pub fn open(config: &ContextConfig, engine: CompressionEngine) -> Result<Self, CompressionError> {
        debug!(session_id = %engine.session_id(), "ContextAssembler::open: called");
        let blocks = engine.load()?;
        let mut assembler = Self::new(config);
        {
            let mut state = assembler.lock();
            state.next_index = blocks.last().map(|b| b.end_index + 1).unwrap_or(0);
            if !blocks.is_empty() {
                info!(session_id = %engine.session_id(), blocks = blocks.len(), "Resumed compressed history");
            }
            state.blocks = blocks;
        }
        if config.compression_enabled {
            assembler.engine = Some(engine);
        }
        Ok(assembler)
    }

    fn lock(&self) -> MutexGuard<'_, ContextState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Ordered messages for the next model call
    ///
    /// Pure: two calls with no intervening [`Self::add_turn`] or completed
    /// compression return identical output.
    pub fn build(&self, instruction: &str) -> Vec<Turn> {
        let state = self.lock();
        let mut messages = Vec::with_capacity(2 + state.blocks.len() + state.in_flight.len() + state.tail.len());
        messages.push(Turn::system(self.identity_prompt.clone()));
        messages.extend(state.blocks.iter().map(|b| Turn::system(b.render())));
        messages.push(Turn::user(format!("INSTRUCTION TO EXECUTE:\n{}", instruction)));
        messages.extend(sanitize(state.in_flight.iter().chain(state.tail.iter())));
        messages
    }

    /// Append a turn to the tail, compressing when it reaches `2 × block_size`
    pub fn add_turn(&self, turn: Turn) {
        let mut state = self.lock();
        state.tail.push(turn);
        self.maybe_compress(&mut state);
    }

    /// Pin a fact every future block must carry verbatim
    pub fn pin_anchor(&self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        debug!(%key, "ContextAssembler::pin_anchor: called");
        self.lock().pinned_anchors.insert(key, value.into());
    }

    /// Compressed blocks so far, oldest first
    pub fn blocks(&self) -> Vec<CompressedBlock> {
        self.lock().blocks.clone()
    }

    pub fn block_count(&self) -> usize {
        self.lock().blocks.len()
    }

    pub fn tail_len(&self) -> usize {
        self.lock().tail.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.lock().in_flight.len()
    }

    /// Anchors the next block will carry
    pub fn anchors(&self) -> BTreeMap<String, String> {
        self.lock().carried_anchors()
    }

    /// Wait for a running compression, if any
    pub async fn wait_for_compression(&self) {
        let pending = self.lock().pending.take();
        if let Some(handle) = pending
            && let Err(e) = handle.await
        {
            warn!(error = %e, "Compression task aborted");
        }
    }

    /// Start a compression if the tail is full and none is running
    fn maybe_compress(&self, state: &mut ContextState) {
        let threshold = self.block_size * 2;
        let Some(engine) = &self.engine else {
            return;
        };
        if state.tail.len() < threshold {
            return;
        }
        if state.compressing() {
            debug!(tail = state.tail.len(), "maybe_compress: compression running, deferring");
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("maybe_compress: no async runtime, deferring");
            return;
        };

        let drained: Vec<Turn> = state.tail.drain(..threshold).collect();
        state.in_flight = drained.clone();
        let seq = state.next_seq();
        let start_index = state.next_index;
        let carried = state.carried_anchors();
        debug!(seq, start_index, "maybe_compress: spawning compression");

        let engine = engine.clone();
        let shared = Arc::clone(&self.state);
        state.pending = Some(runtime.spawn(async move {
            let result = engine.compress(&drained, seq, start_index, &carried).await;
            let mut state = shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            let restored = std::mem::take(&mut state.in_flight);
            match result {
                Ok(block) => {
                    state.next_index = block.end_index + 1;
                    state.blocks.push(block);
                }
                Err(e) => {
                    warn!(error = %e, turns = restored.len(), "Compression failed, restoring turns to tail");
                    let tail = std::mem::take(&mut state.tail);
                    state.tail = restored.into_iter().chain(tail).collect();
                }
            }
        }));
    }
}

/// Render tool turns whose call is not in the preceding assistant turn as user observations
fn sanitize<'a>(turns: impl Iterator<Item = &'a Turn>) -> Vec<Turn> {
    let mut open_calls: HashSet<&str> = HashSet::new();
    let mut out = Vec::new();
    for turn in turns {
        match turn.role {
            Role::Assistant => {
                open_calls = turn.tool_calls.iter().map(|c| c.id.as_str()).collect();
                out.push(turn.clone());
            }
            Role::Tool => {
                let id = turn.tool_call_id.as_deref().unwrap_or("");
                if open_calls.contains(id) {
                    out.push(turn.clone());
                } else {
                    out.push(Turn::user(format!("[Observation from tool call {}]\n{}", id, turn.content)));
                }
            }
            _ => out.push(turn.clone()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::summarizer::mock::StaticSummarizer;
    use crate::llm::ToolCall;
    use durablestore::Store;
    use proptest::prelude::*;
    use serde_json::json;
    use std::time::Duration;

    fn config(block_size: usize) -> ContextConfig {
        ContextConfig {
            block_size,
            identity_prompt: "identity".to_string(),
            compression_enabled: true,
        }
    }

    fn engine(summarizer: StaticSummarizer) -> CompressionEngine {
        CompressionEngine::new(Arc::new(summarizer), "session-1")
    }

    fn exchange(i: usize) -> [Turn; 2] {
        let call = ToolCall::new(format!("c{}", i), "shell", &json!({"cmd": format!("ls {}", i)}));
        [
            Turn::assistant("", vec![call]),
            Turn::tool(format!("c{}", i), format!("out {}", i)),
        ]
    }

    #[test]
    fn test_build_layout() {
        let assembler = ContextAssembler::new(&config(5));
        for turn in exchange(0) {
            assembler.add_turn(turn);
        }
        let messages = assembler.build("list files");
        assert_eq!(messages[0], Turn::system("identity"));
        assert_eq!(messages[1].content, "INSTRUCTION TO EXECUTE:\nlist files");
        assert_eq!(messages[2].role, Role::Assistant);
        assert_eq!(messages[3].role, Role::Tool);
    }

    #[test]
    fn test_orphan_tool_turn_becomes_observation() {
        let assembler = ContextAssembler::new(&config(5));
        assembler.add_turn(Turn::tool("ghost", "stale output"));
        let messages = assembler.build("x");
        assert_eq!(messages[2].role, Role::User);
        assert_eq!(messages[2].content, "[Observation from tool call ghost]\nstale output");
    }

    #[test]
    fn test_without_engine_tail_is_kept() {
        let assembler = ContextAssembler::new(&config(1));
        for i in 0..3 {
            assembler.add_turn(Turn::user(i.to_string()));
        }
        assert_eq!(assembler.tail_len(), 3);
        assert_eq!(assembler.block_count(), 0);
    }

    #[tokio::test]
    async fn test_compression_triggers_at_twice_block_size() {
        let assembler = ContextAssembler::open(&config(2), engine(StaticSummarizer::new(&[]))).unwrap();
        for turn in exchange(0).into_iter().chain(exchange(1)) {
            assembler.add_turn(turn);
        }
        assembler.wait_for_compression().await;

        assert_eq!(assembler.block_count(), 1);
        assert_eq!(assembler.tail_len(), 0);
        let blocks = assembler.blocks();
        assert_eq!((blocks[0].seq, blocks[0].start_index, blocks[0].end_index), (1, 0, 3));

        let messages = assembler.build("x");
        assert!(messages[1].content.starts_with("--- Block 1 (turns 0-3) ---"));
    }

    #[tokio::test]
    async fn test_failed_compression_restores_turns_to_front() {
        let assembler = ContextAssembler::open(&config(1), engine(StaticSummarizer::failing())).unwrap();
        assembler.add_turn(Turn::user("a"));
        assembler.add_turn(Turn::user("b"));
        assembler.wait_for_compression().await;

        assert_eq!(assembler.block_count(), 0);
        assert_eq!(assembler.in_flight_len(), 0);
        let contents: Vec<String> = assembler.build("x")[2..].iter().map(|t| t.content.clone()).collect();
        assert_eq!(contents, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_running_compression_defers_and_stays_visible() {
        let slow = StaticSummarizer::new(&[]).with_delay(Duration::from_millis(50));
        let assembler = ContextAssembler::open(&config(1), engine(slow)).unwrap();
        assembler.add_turn(Turn::user("a"));
        assembler.add_turn(Turn::user("b"));
        assembler.add_turn(Turn::user("c"));
        assembler.add_turn(Turn::user("d"));

        assert_eq!(assembler.in_flight_len(), 2);
        assert_eq!(assembler.tail_len(), 2);
        let contents: Vec<String> = assembler.build("x")[2..].iter().map(|t| t.content.clone()).collect();
        assert_eq!(contents, vec!["a", "b", "c", "d"]);

        assembler.wait_for_compression().await;
        assert_eq!(assembler.block_count(), 1);

        assembler.add_turn(Turn::user("e"));
        assembler.wait_for_compression().await;
        assert_eq!(assembler.block_count(), 2);
        assert_eq!(assembler.blocks()[1].start_index, 2);
        assert_eq!(assembler.tail_len(), 1);
    }

    #[tokio::test]
    async fn test_anchors_survive_compression_verbatim() {
        let summarizer = StaticSummarizer::new(&[("config", "rewritten by model")]);
        let assembler = ContextAssembler::open(&config(1), engine(summarizer)).unwrap();
        assembler.pin_anchor("config", "/etc/app/config.toml");
        assembler.pin_anchor("port", "8443");

        for round in 0..3 {
            assembler.add_turn(Turn::user(format!("{}a", round)));
            assembler.add_turn(Turn::user(format!("{}b", round)));
            assembler.wait_for_compression().await;
        }

        let blocks = assembler.blocks();
        assert_eq!(blocks.len(), 3);
        for block in &blocks {
            assert_eq!(block.anchors.get("config").map(String::as_str), Some("/etc/app/config.toml"));
            assert_eq!(block.anchors.get("port").map(String::as_str), Some("8443"));
        }
        assert!(blocks.windows(2).all(|w| w[0].seq < w[1].seq));
    }

    #[tokio::test]
    async fn test_reopen_restores_blocks_before_first_build() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path().join("ctx.db")).unwrap());
        let make_engine = || engine(StaticSummarizer::new(&[("repo", "/src/app")])).with_store(store.clone());

        let first = ContextAssembler::open(&config(1), make_engine()).unwrap();
        first.add_turn(Turn::user("a"));
        first.add_turn(Turn::user("b"));
        first.wait_for_compression().await;
        let before = first.build("x");

        let resumed = ContextAssembler::open(&config(1), make_engine()).unwrap();
        assert_eq!(resumed.build("x")[..2], before[..2]);
        assert_eq!(resumed.anchors().get("repo").map(String::as_str), Some("/src/app"));

        resumed.add_turn(Turn::user("c"));
        resumed.add_turn(Turn::user("d"));
        resumed.wait_for_compression().await;
        assert_eq!(resumed.blocks().last().map(|b| (b.seq, b.start_index)), Some((2, 2)));
    }

    proptest! {
        #[test]
        fn prop_build_is_pure(contents in proptest::collection::vec("[a-z ]{0,12}", 0..20), instruction in "[a-z]{1,10}") {
            let assembler = ContextAssembler::new(&config(5));
            for content in contents {
                assembler.add_turn(Turn::user(content));
            }
            let first = serde_json::to_string(&assembler.build(&instruction)).unwrap();
            let second = serde_json::to_string(&assembler.build(&instruction)).unwrap();
            prop_assert_eq!(first, second);
        }

        #[test]
        fn prop_blocks_grow_and_keep_anchors(
            turn_count in 0usize..30,
            pinned in proptest::collection::btree_map("[a-z]{1,6}", "[a-z0-9]{1,8}", 0..4),
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            runtime.block_on(async {
                let assembler = ContextAssembler::open(&config(2), engine(StaticSummarizer::new(&[("k", "summarized")])))
                    .unwrap();
                for (key, value) in &pinned {
                    assembler.pin_anchor(key.clone(), value.clone());
                }
                let mut last_count = 0;
                for i in 0..turn_count {
                    assembler.add_turn(Turn::user(format!("turn {}", i)));
                    assembler.wait_for_compression().await;
                    let count = assembler.block_count();
                    assert!(count >= last_count);
                    last_count = count;
                }
                for block in assembler.blocks() {
                    for (key, value) in &pinned {
                        assert_eq!(block.anchors.get(key), Some(value));
                    }
                }
            });
        }
    }
}
