//! DecisionLog - append-only planning decisions, patched once with an outcome

use std::sync::Arc;

use durablestore::{Filter, Store, now_ms};
use tracing::{debug, info};

use super::types::{DecisionOutcome, DecisionRecord, MissionError};

#[derive(Clone)]
pub struct DecisionLog {
    store: Arc<Store>,
}

impl DecisionLog {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Append a pending decision and return its id
    pub fn log_decision(
        &self,
        mission_id: &str,
        problem_type: &str,
        anchor_options: &[String],
        chosen_anchor: &str,
        reasoning: &str,
    ) -> Result<String, MissionError> {
        debug!(%mission_id, %problem_type, %chosen_anchor, "DecisionLog::log_decision: called");
        let now = now_ms();
        let record = DecisionRecord {
            id: uuid::Uuid::now_v7().to_string(),
            mission_id: mission_id.to_string(),
            problem_type: problem_type.to_string(),
            anchor_options: anchor_options.to_vec(),
            chosen_anchor: chosen_anchor.to_string(),
            outcome: DecisionOutcome::Pending,
            reasoning: reasoning.to_string(),
            consumed: false,
            created_at: now,
            updated_at: now,
        };
        let id = self.store.create(record)?;
        Ok(id)
    }

    /// Resolve a pending decision; a resolved decision is never rewritten
    pub fn update_decision_outcome(&self, id: &str, outcome: DecisionOutcome) -> Result<DecisionRecord, MissionError> {
        debug!(%id, %outcome, "DecisionLog::update_decision_outcome: called");
        if outcome == DecisionOutcome::Pending {
            return Err(MissionError::InvalidTransition {
                id: id.to_string(),
                to: outcome,
            });
        }

        let record = self
            .store
            .update_with(id, |mut record: DecisionRecord| {
                if record.outcome != DecisionOutcome::Pending {
                    return Err(MissionError::AlreadyResolved {
                        id: id.to_string(),
                        outcome: record.outcome,
                    });
                }
                record.outcome = outcome;
                record.updated_at = now_ms();
                Ok(record)
            })?
            .ok_or_else(|| MissionError::NotFound(id.to_string()))?;
        info!(%id, %outcome, "Decision resolved");
        Ok(record)
    }

    pub fn get(&self, id: &str) -> Result<Option<DecisionRecord>, MissionError> {
        Ok(self.store.get(id)?)
    }

    /// Decisions for one mission, oldest first
    pub fn for_mission(&self, mission_id: &str) -> Result<Vec<DecisionRecord>, MissionError> {
        let mut records: Vec<DecisionRecord> = self.store.list(&[Filter::eq("mission_id", mission_id)])?;
        records.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        Ok(records)
    }

    /// Resolved decisions not yet seen by reflection, oldest first
    pub fn unconsumed(&self) -> Result<Vec<DecisionRecord>, MissionError> {
        let mut records: Vec<DecisionRecord> = self.store.list(&[Filter::eq("consumed", false)])?;
        records.retain(|r| r.outcome != DecisionOutcome::Pending);
        records.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        Ok(records)
    }

    /// Flag decisions as seen; returns how many changed
    pub fn mark_consumed(&self, ids: &[String]) -> Result<usize, MissionError> {
        let mut changed = 0;
        for id in ids {
            let mut flipped = false;
            self.store.update_with(id, |mut record: DecisionRecord| {
                if !record.consumed {
                    flipped = true;
                    record.consumed = true;
                    record.updated_at = now_ms();
                }
                Ok::<_, MissionError>(record)
            })?;
            if flipped {
                changed += 1;
            }
        }
        debug!(changed, "DecisionLog::mark_consumed: done");
        Ok(changed)
    }
}
