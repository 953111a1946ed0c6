//! MissionTree - durable objective hierarchy with backtracking

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use durablestore::{Filter, Store};
use eyre::Context;
use tracing::{debug, info, warn};

use super::types::{ExhaustionNotice, Mission, MissionError, MissionStatus};

/// Objective forest over a [`Store`]
///
/// There is no "current mission" pointer: the active mission is whatever
/// active mission was updated most recently.
#[derive(Clone)]
pub struct MissionTree {
    store: Arc<Store>,
}

impl MissionTree {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Open a tree backed by the database at `path`
    pub fn open(path: impl AsRef<Path>) -> eyre::Result<Self> {
        let path = path.as_ref();
        let store = Store::open(path).context(format!("Failed to open mission store at {}", path.display()))?;
        Ok(Self::new(Arc::new(store)))
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Create a mission; depth and root come from the parent, once
    pub fn create(&self, objective: &str, parent_id: Option<&str>) -> Result<Mission, MissionError> {
        debug!(%objective, ?parent_id, "MissionTree::create: called");
        let mission = match parent_id {
            Some(parent_id) => {
                let parent = self.require(parent_id)?;
                Mission::child_of(&parent, objective)
            }
            None => Mission::root(objective),
        };
        self.store.create(mission.clone())?;
        info!(id = %mission.id, depth = mission.depth, "Mission created");
        Ok(mission)
    }

    pub fn get(&self, id: &str) -> Result<Option<Mission>, MissionError> {
        Ok(self.store.get(id)?)
    }

    fn require(&self, id: &str) -> Result<Mission, MissionError> {
        self.get(id)?.ok_or_else(|| MissionError::NotFound(id.to_string()))
    }

    /// Most recently updated active mission
    pub fn get_active(&self) -> Result<Option<Mission>, MissionError> {
        let active: Vec<Mission> = self
            .store
            .list(&[Filter::eq("status", MissionStatus::Active.to_string())])?;
        Ok(active.into_iter().next())
    }

    /// Ancestors of `id` followed by the mission itself, root first
    pub fn get_lineage(&self, id: &str) -> Result<Vec<Mission>, MissionError> {
        debug!(%id, "MissionTree::get_lineage: called");
        let mut lineage = vec![self.require(id)?];
        let mut seen: HashSet<String> = HashSet::from([id.to_string()]);

        while let Some(parent_id) = lineage.last().and_then(|m| m.parent_id.clone()) {
            if !seen.insert(parent_id.clone()) {
                warn!(%parent_id, "Cycle in mission lineage");
                break;
            }
            match self.get(&parent_id)? {
                Some(parent) => lineage.push(parent),
                None => {
                    warn!(%parent_id, "Missing parent in mission lineage");
                    break;
                }
            }
        }
        lineage.reverse();
        Ok(lineage)
    }

    /// Fail `failed_id` and hand control back to its parent
    ///
    /// Returns the re-activated parent, or `None` when the failed mission is a
    /// root and there is nothing left to fall back to.
    pub fn backtrack(&self, failed_id: &str, error_summary: &str) -> Result<Option<Mission>, MissionError> {
        debug!(%failed_id, "MissionTree::backtrack: called");
        let mut failed = self.require(failed_id)?;
        failed.status = MissionStatus::Failed;
        failed.error_count += 1;
        failed.last_error = Some(error_summary.to_string());
        failed.touch();
        self.store.update(failed.clone())?;

        let Some(parent_id) = failed.parent_id.as_deref() else {
            warn!(id = %failed.id, "Backtrack exhausted at root mission");
            return Ok(None);
        };

        let mut parent = self.require(parent_id)?;
        parent.status = MissionStatus::Active;
        parent.last_error = Some(format!(
            "Child mission {} ('{}') failed: {}",
            failed.id, failed.objective, error_summary
        ));
        parent.touch();
        self.store.update(parent.clone())?;
        info!(failed = %failed.id, parent = %parent.id, "Backtracked to parent mission");
        Ok(Some(parent))
    }

    /// Objectives of failed children, oldest first
    pub fn get_failed_children(&self, parent_id: &str) -> Result<Vec<String>, MissionError> {
        let mut failed: Vec<Mission> = self.store.list(&[
            Filter::eq("parent_id", parent_id),
            Filter::eq("status", MissionStatus::Failed.to_string()),
        ])?;
        failed.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        Ok(failed.into_iter().map(|m| m.objective).collect())
    }

    /// Direct children, oldest first
    pub fn children(&self, parent_id: &str) -> Result<Vec<Mission>, MissionError> {
        let mut children: Vec<Mission> = self.store.list(&[Filter::eq("parent_id", parent_id)])?;
        children.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        Ok(children)
    }

    /// Most recently updated missions
    pub fn list(&self, limit: usize) -> Result<Vec<Mission>, MissionError> {
        let all: Vec<Mission> = self.store.list(&[])?;
        Ok(all.into_iter().take(limit).collect())
    }

    /// Count a failure without changing status
    pub fn record_failure(&self, id: &str, error: &str) -> Result<Mission, MissionError> {
        self.modify(id, |m| {
            m.error_count += 1;
            m.last_error = Some(error.to_string());
        })
    }

    pub fn complete(&self, id: &str) -> Result<Mission, MissionError> {
        self.modify(id, |m| m.status = MissionStatus::Completed)
    }

    pub fn pause(&self, id: &str) -> Result<Mission, MissionError> {
        self.modify(id, |m| m.status = MissionStatus::Paused)
    }

    pub fn resume(&self, id: &str) -> Result<Mission, MissionError> {
        self.modify(id, |m| m.status = MissionStatus::Active)
    }

    pub fn set_context_snapshot(&self, id: &str, snapshot: &str) -> Result<Mission, MissionError> {
        self.modify(id, |m| m.context_snapshot = Some(snapshot.to_string()))
    }

    /// Explanation for a mission whose backtracking reached the root
    pub fn explain_exhausted(&self, id: &str) -> Result<ExhaustionNotice, MissionError> {
        let mission = self.require(id)?;
        let failed_children = self.get_failed_children(id)?;
        Ok(ExhaustionNotice {
            mission_id: mission.id,
            objective: mission.objective,
            error_count: mission.error_count,
            last_error: mission.last_error,
            failed_children,
        })
    }

    fn modify(&self, id: &str, change: impl FnOnce(&mut Mission)) -> Result<Mission, MissionError> {
        let mission = self
            .store
            .update_with(id, |mut mission: Mission| {
                change(&mut mission);
                mission.touch();
                Ok::<_, MissionError>(mission)
            })?
            .ok_or_else(|| MissionError::NotFound(id.to_string()))?;
        debug!(%id, status = %mission.status, "MissionTree::modify: updated");
        Ok(mission)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn tree() -> MissionTree {
        MissionTree::new(Arc::new(Store::open_in_memory().unwrap()))
    }

    #[test]
    fn test_create_child_computes_depth_once() {
        let tree = tree();
        let root = tree.create("ship release", None).unwrap();
        let child = tree.create("run tests", Some(&root.id)).unwrap();
        let grandchild = tree.create("fix flaky test", Some(&child.id)).unwrap();
        assert_eq!((root.depth, child.depth, grandchild.depth), (0, 1, 2));
        assert_eq!(grandchild.root_id, root.id);

        let stored = tree.get(&grandchild.id).unwrap().unwrap();
        assert_eq!(stored.depth, 2);
    }

    #[test]
    fn test_create_with_missing_parent_fails() {
        let err = tree().create("orphan", Some("nope")).unwrap_err();
        assert!(matches!(err, MissionError::NotFound(id) if id == "nope"));
    }

    #[test]
    fn test_get_active_is_most_recently_updated() {
        let tree = tree();
        let a = tree.create("a", None).unwrap();
        let b = tree.create("b", None).unwrap();
        assert_eq!(tree.get_active().unwrap().unwrap().id, b.id);

        tree.record_failure(&a.id, "timeout").unwrap();
        assert_eq!(tree.get_active().unwrap().unwrap().id, a.id);

        tree.complete(&a.id).unwrap();
        tree.pause(&b.id).unwrap();
        assert!(tree.get_active().unwrap().is_none());
    }

    #[test]
    fn test_lineage_root_to_leaf() {
        let tree = tree();
        let root = tree.create("root", None).unwrap();
        let child = tree.create("child", Some(&root.id)).unwrap();
        let leaf = tree.create("leaf", Some(&child.id)).unwrap();

        let objectives: Vec<String> = tree
            .get_lineage(&leaf.id)
            .unwrap()
            .into_iter()
            .map(|m| m.objective)
            .collect();
        assert_eq!(objectives, vec!["root", "child", "leaf"]);
    }

    #[test]
    fn test_backtrack_root_returns_none() {
        let tree = tree();
        let root = tree.create("root", None).unwrap();
        assert!(tree.backtrack(&root.id, "gave up").unwrap().is_none());

        let stored = tree.get(&root.id).unwrap().unwrap();
        assert_eq!(stored.status, MissionStatus::Failed);
        assert_eq!(stored.error_count, 1);
        assert_eq!(stored.last_error.as_deref(), Some("gave up"));
    }

    #[test]
    fn test_backtrack_reactivates_parent() {
        let tree = tree();
        let parent = tree.create("install database", None).unwrap();
        tree.pause(&parent.id).unwrap();
        let child = tree.create("use apt", Some(&parent.id)).unwrap();

        let reactivated = tree.backtrack(&child.id, "package not found").unwrap().unwrap();
        assert_eq!(reactivated.id, parent.id);
        assert_eq!(reactivated.status, MissionStatus::Active);
        let last_error = reactivated.last_error.unwrap();
        assert!(last_error.contains(&child.id));
        assert!(last_error.contains("package not found"));

        assert_eq!(tree.get_failed_children(&parent.id).unwrap(), vec!["use apt"]);
        assert_eq!(tree.get_active().unwrap().unwrap().id, parent.id);
    }

    #[test]
    fn test_failed_children_excludes_other_statuses() {
        let tree = tree();
        let parent = tree.create("p", None).unwrap();
        let a = tree.create("first try", Some(&parent.id)).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = tree.create("second try", Some(&parent.id)).unwrap();
        tree.create("third try", Some(&parent.id)).unwrap();
        tree.backtrack(&a.id, "x").unwrap();
        tree.backtrack(&b.id, "y").unwrap();

        assert_eq!(tree.get_failed_children(&parent.id).unwrap(), vec!["first try", "second try"]);
        assert_eq!(tree.children(&parent.id).unwrap().len(), 3);
    }

    #[test]
    fn test_explain_exhausted_lists_failed_children() {
        let tree = tree();
        let root = tree.create("set up mail", None).unwrap();
        let child = tree.create("use postfix", Some(&root.id)).unwrap();
        tree.backtrack(&child.id, "port 25 blocked").unwrap();
        tree.backtrack(&root.id, "no alternatives").unwrap();

        let notice = tree.explain_exhausted(&root.id).unwrap();
        assert_eq!(notice.failed_children, vec!["use postfix"]);
        assert!(notice.to_string().contains("no alternatives"));
    }

    #[test]
    fn test_list_and_snapshot() {
        let tree = tree();
        for i in 0..5 {
            tree.create(&format!("m{}", i), None).unwrap();
        }
        let recent = tree.list(2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].objective, "m4");

        let updated = tree.set_context_snapshot(&recent[1].id, "cwd=/srv").unwrap();
        assert_eq!(updated.context_snapshot.as_deref(), Some("cwd=/srv"));
    }

    #[test]
    fn test_open_persists_across_instances() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missions.db");
        let id = MissionTree::open(&path).unwrap().create("durable", None).unwrap().id;

        let reopened = MissionTree::open(&path).unwrap();
        assert_eq!(reopened.get(&id).unwrap().unwrap().objective, "durable");
    }
}
