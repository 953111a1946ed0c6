//! Mission and decision record types

use std::collections::HashMap;
use std::fmt;

use durablestore::{IndexValue, Record, now_ms};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Mission lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissionStatus {
    #[default]
    Active,
    Paused,
    Failed,
    Completed,
}

impl fmt::Display for MissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Paused => write!(f, "paused"),
            Self::Failed => write!(f, "failed"),
            Self::Completed => write!(f, "completed"),
        }
    }
}

/// A node in the objective forest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mission {
    /// Unique identifier (UUID v7)
    pub id: String,

    pub objective: String,
    pub status: MissionStatus,
    pub parent_id: Option<String>,

    /// Id of the tree's root; a root's own id
    pub root_id: String,

    /// `parent.depth + 1` at creation, never recomputed
    pub depth: u32,

    pub error_count: u32,
    pub last_error: Option<String>,

    /// Free-form state captured by the planner
    #[serde(default)]
    pub context_snapshot: Option<String>,

    /// Creation timestamp (Unix ms)
    pub created_at: i64,

    /// Last update timestamp (Unix ms)
    pub updated_at: i64,
}

impl Mission {
    /// New root mission
    pub fn root(objective: impl Into<String>) -> Self {
        let id = uuid::Uuid::now_v7().to_string();
        let now = now_ms();
        Self {
            root_id: id.clone(),
            id,
            objective: objective.into(),
            status: MissionStatus::Active,
            parent_id: None,
            depth: 0,
            error_count: 0,
            last_error: None,
            context_snapshot: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// New child of `parent`
    pub fn child_of(parent: &Mission, objective: impl Into<String>) -> Self {
        Self {
            parent_id: Some(parent.id.clone()),
            root_id: parent.root_id.clone(),
            depth: parent.depth + 1,
            ..Self::root(objective)
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    pub fn touch(&mut self) {
        self.updated_at = now_ms();
    }
}

impl Record for Mission {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "missions"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("status".to_string(), IndexValue::String(self.status.to_string()));
        fields.insert("root_id".to_string(), IndexValue::String(self.root_id.clone()));
        if let Some(ref parent) = self.parent_id {
            fields.insert("parent_id".to_string(), IndexValue::String(parent.clone()));
        }
        fields
    }
}

/// Outcome of a planning decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionOutcome {
    #[default]
    Pending,
    Success,
    Failed,
    Backtracked,
}

impl fmt::Display for DecisionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
            Self::Backtracked => write!(f, "backtracked"),
        }
    }
}

/// One planning choice, patched with its outcome exactly once
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub id: String,
    pub mission_id: String,
    pub problem_type: String,

    /// Candidate anchors considered
    pub anchor_options: Vec<String>,
    pub chosen_anchor: String,
    pub outcome: DecisionOutcome,
    pub reasoning: String,

    /// Seen by the reflection process
    #[serde(default)]
    pub consumed: bool,

    pub created_at: i64,
    pub updated_at: i64,
}

impl Record for DecisionRecord {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "decisions"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("mission_id".to_string(), IndexValue::String(self.mission_id.clone()));
        fields.insert("outcome".to_string(), IndexValue::String(self.outcome.to_string()));
        fields.insert("consumed".to_string(), IndexValue::Bool(self.consumed));
        fields
    }
}

/// Mission tree and decision log errors
#[derive(Debug, Error)]
pub enum MissionError {
    #[error("Mission not found: {0}")]
    NotFound(String),

    #[error("Decision {id}: cannot transition to {to}")]
    InvalidTransition { id: String, to: DecisionOutcome },

    #[error("Decision {id} already resolved as {outcome}")]
    AlreadyResolved { id: String, outcome: DecisionOutcome },

    #[error("Store error: {0}")]
    Store(#[from] durablestore::StoreError),
}

/// User-facing explanation when backtracking runs out of parents
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExhaustionNotice {
    pub mission_id: String,
    pub objective: String,
    pub error_count: u32,
    pub last_error: Option<String>,

    /// Objectives of child missions that already failed
    pub failed_children: Vec<String>,
}

impl fmt::Display for ExhaustionNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Mission '{}' could not be completed.", self.objective)?;
        writeln!(
            f,
            "What happened: it failed {} time(s); last error: {}",
            self.error_count,
            self.last_error.as_deref().unwrap_or("none recorded")
        )?;
        if !self.failed_children.is_empty() {
            writeln!(f, "Approaches already tried: {}", self.failed_children.join("; "))?;
        }
        writeln!(
            f,
            "Why it stopped: this is a top-level mission, so there is no broader objective to fall back to."
        )?;
        write!(
            f,
            "How to proceed: fix the reported problem or restate the objective, then start a new mission (id {}).",
            self.mission_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_depth_and_root() {
        let root = Mission::root("deploy app");
        let child = Mission::child_of(&root, "build image");
        let grandchild = Mission::child_of(&child, "write dockerfile");

        assert_eq!(root.root_id, root.id);
        assert_eq!(child.depth, 1);
        assert_eq!(grandchild.depth, 2);
        assert_eq!(grandchild.root_id, root.id);
        assert_eq!(grandchild.parent_id.as_deref(), Some(child.id.as_str()));
        assert!(root.is_root() && !child.is_root());
    }

    #[test]
    fn test_mission_indexes() {
        let root = Mission::root("a");
        let child = Mission::child_of(&root, "b");
        let fields = child.indexed_fields();
        assert_eq!(fields.get("status"), Some(&IndexValue::String("active".to_string())));
        assert_eq!(fields.get("parent_id"), Some(&IndexValue::String(root.id.clone())));
        assert!(!root.indexed_fields().contains_key("parent_id"));
    }

    #[test]
    fn test_exhaustion_notice_text() {
        let notice = ExhaustionNotice {
            mission_id: "m1".to_string(),
            objective: "configure vpn".to_string(),
            error_count: 2,
            last_error: Some("tunnel refused".to_string()),
            failed_children: vec!["use wireguard".to_string()],
        };
        let text = notice.to_string();
        assert!(text.contains("What happened: it failed 2 time(s); last error: tunnel refused"));
        assert!(text.contains("Approaches already tried: use wireguard"));
        assert!(text.contains("Why it stopped"));
        assert!(text.contains("How to proceed"));
    }
}
