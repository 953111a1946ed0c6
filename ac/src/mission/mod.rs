//! Mission tree and decision log
//!
//! Missions form a forest of objectives. When a sub-mission fails the tree
//! backtracks to its parent, so the planner can pick a different approach
//! knowing which children already failed. Every planning choice is logged as
//! a [`DecisionRecord`] and later resolved with exactly one outcome.

mod decision;
mod tree;
mod types;

pub use decision::DecisionLog;
pub use tree::MissionTree;
pub use types::{DecisionOutcome, DecisionRecord, ExhaustionNotice, Mission, MissionError, MissionStatus};
