//! Cache-aligned prompt assembly and history compression
//!
//! [`ContextAssembler`] owns the prompt layout; [`CompressionEngine`] turns
//! drained tail turns into [`CompressedBlock`]s through a [`Summarizer`] and
//! persists them per session.

mod assembler;
mod block;
mod compression;
pub mod summarizer;

pub use assembler::ContextAssembler;
pub use block::{CompressedBlock, hash_turns, load_blocks};
pub use compression::{CompressionEngine, CompressionError};
pub use summarizer::{BlockSummary, ModelSummarizer, Summarizer, parse_summary};
