//! SQLite-backed store

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, ToSql, Transaction, TransactionBehavior, params};
use tracing::{debug, info};

use crate::{Filter, Record, StoreError};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS records (
    collection TEXT NOT NULL,
    id TEXT NOT NULL,
    data TEXT NOT NULL,
    updated_at INTEGER NOT NULL,
    seq INTEGER NOT NULL,
    PRIMARY KEY (collection, id)
);
CREATE TABLE IF NOT EXISTS record_indexes (
    collection TEXT NOT NULL,
    id TEXT NOT NULL,
    field TEXT NOT NULL,
    value,
    PRIMARY KEY (collection, id, field)
);
CREATE INDEX IF NOT EXISTS idx_record_indexes_lookup ON record_indexes (collection, field, value);
";

/// Keyed record store
///
/// The connection is guarded by a mutex held only for the duration of one
/// statement batch; callers share the store through an `Arc`.
pub struct Store {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl Store {
    /// Open (or create) a store at the given database path
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        debug!(path = %path.display(), "Store::open: called");
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        info!(path = %path.display(), "Opened store");
        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        })
    }

    /// Open a private in-memory store
    pub fn open_in_memory() -> Result<Self, StoreError> {
        debug!("Store::open_in_memory: called");
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    /// Database path, `None` for in-memory stores
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Lock)
    }

    /// Insert a new record, failing if the id is already taken
    pub fn create<T: Record>(&self, record: T) -> Result<String, StoreError> {
        let collection = T::collection_name();
        debug!(%collection, id = %record.id(), "Store::create: called");
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        if exists(&tx, collection, record.id())? {
            debug!("Store::create: duplicate id");
            return Err(StoreError::Duplicate {
                collection: collection.to_string(),
                id: record.id().to_string(),
            });
        }
        write_record(&tx, &record)?;
        tx.commit()?;
        Ok(record.id().to_string())
    }

    /// Fetch a record by id
    pub fn get<T: Record>(&self, id: &str) -> Result<Option<T>, StoreError> {
        let collection = T::collection_name();
        debug!(%collection, %id, "Store::get: called");
        let conn = self.lock()?;
        let data: Option<String> = conn
            .query_row(
                "SELECT data FROM records WHERE collection = ?1 AND id = ?2",
                params![collection, id],
                |row| row.get(0),
            )
            .optional()?;
        match data {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Replace an existing record, failing if it does not exist
    pub fn update<T: Record>(&self, record: T) -> Result<(), StoreError> {
        let collection = T::collection_name();
        debug!(%collection, id = %record.id(), "Store::update: called");
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        if !exists(&tx, collection, record.id())? {
            debug!("Store::update: record missing");
            return Err(StoreError::NotFound {
                collection: collection.to_string(),
                id: record.id().to_string(),
            });
        }
        write_record(&tx, &record)?;
        tx.commit()?;
        Ok(())
    }

    /// Read, change and write a record in one immediate transaction
    ///
    /// `change` sees the current record and returns the replacement or an
    /// error that aborts the write. Returns `Ok(None)` when the record does not
    /// exist. No other writer can interleave between the read and the write.
    pub fn update_with<T, E, F>(&self, id: &str, change: F) -> Result<Option<T>, E>
    where
        T: Record,
        E: From<StoreError>,
        F: FnOnce(T) -> Result<T, E>,
    {
        let collection = T::collection_name();
        debug!(%collection, %id, "Store::update_with: called");
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StoreError::from)?;
        let data: Option<String> = tx
            .query_row(
                "SELECT data FROM records WHERE collection = ?1 AND id = ?2",
                params![collection, id],
                |row| row.get(0),
            )
            .optional()
            .map_err(StoreError::from)?;
        let Some(json) = data else {
            debug!("Store::update_with: record missing");
            return Ok(None);
        };
        let current: T = serde_json::from_str(&json).map_err(StoreError::from)?;
        let updated = change(current)?;
        if updated.id() != id {
            return Err(StoreError::IdMismatch {
                expected: id.to_string(),
                found: updated.id().to_string(),
            }
            .into());
        }
        write_record(&tx, &updated)?;
        tx.commit().map_err(StoreError::from)?;
        Ok(Some(updated))
    }

    /// Insert or replace a record
    pub fn upsert<T: Record>(&self, record: T) -> Result<(), StoreError> {
        debug!(collection = %T::collection_name(), id = %record.id(), "Store::upsert: called");
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        write_record(&tx, &record)?;
        tx.commit()?;
        Ok(())
    }

    /// Delete a record, returning whether it existed
    pub fn delete<T: Record>(&self, id: &str) -> Result<bool, StoreError> {
        let collection = T::collection_name();
        debug!(%collection, %id, "Store::delete: called");
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM record_indexes WHERE collection = ?1 AND id = ?2",
            params![collection, id],
        )?;
        let removed = tx.execute(
            "DELETE FROM records WHERE collection = ?1 AND id = ?2",
            params![collection, id],
        )?;
        tx.commit()?;
        Ok(removed > 0)
    }

    /// List records matching every filter, most recently updated first
    pub fn list<T: Record>(&self, filters: &[Filter]) -> Result<Vec<T>, StoreError> {
        let collection = T::collection_name();
        debug!(%collection, filter_count = filters.len(), "Store::list: called");

        let mut sql = String::from("SELECT r.data FROM records r WHERE r.collection = ?");
        let mut values: Vec<&dyn ToSql> = vec![&collection];
        for filter in filters {
            sql.push_str(
                " AND EXISTS (SELECT 1 FROM record_indexes i \
                 WHERE i.collection = r.collection AND i.id = r.id AND i.field = ? AND ",
            );
            sql.push_str(filter.op.predicate());
            sql.push(')');
            values.push(&filter.field);
            values.push(&filter.value);
        }
        sql.push_str(" ORDER BY r.updated_at DESC, r.seq DESC");

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(values.as_slice(), |row| row.get::<_, String>(0))?;
        let mut records = Vec::new();
        for row in rows {
            records.push(serde_json::from_str(&row?)?);
        }
        debug!(count = records.len(), "Store::list: matched");
        Ok(records)
    }

    /// Recompute index rows for every record of a collection
    pub fn rebuild_indexes<T: Record>(&self) -> Result<usize, StoreError> {
        let collection = T::collection_name();
        debug!(%collection, "Store::rebuild_indexes: called");
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let documents: Vec<String> = {
            let mut stmt = tx.prepare("SELECT data FROM records WHERE collection = ?1")?;
            let rows = stmt.query_map(params![collection], |row| row.get::<_, String>(0))?;
            rows.collect::<Result<_, _>>()?
        };
        tx.execute("DELETE FROM record_indexes WHERE collection = ?1", params![collection])?;
        for json in &documents {
            let record: T = serde_json::from_str(json)?;
            write_indexes(&tx, &record)?;
        }
        tx.commit()?;
        info!(%collection, count = documents.len(), "Rebuilt indexes");
        Ok(documents.len())
    }
}

fn exists(tx: &Transaction<'_>, collection: &str, id: &str) -> Result<bool, StoreError> {
    let found: Option<i64> = tx
        .query_row(
            "SELECT 1 FROM records WHERE collection = ?1 AND id = ?2",
            params![collection, id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn write_record<T: Record>(tx: &Transaction<'_>, record: &T) -> Result<(), StoreError> {
    let data = serde_json::to_string(record)?;
    let seq: i64 = tx.query_row("SELECT COALESCE(MAX(seq), 0) + 1 FROM records", [], |row| row.get(0))?;
    tx.execute(
        "INSERT INTO records (collection, id, data, updated_at, seq) VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT (collection, id) DO UPDATE SET
             data = excluded.data, updated_at = excluded.updated_at, seq = excluded.seq",
        params![T::collection_name(), record.id(), data, record.updated_at(), seq],
    )?;
    write_indexes(tx, record)
}

fn write_indexes<T: Record>(tx: &Transaction<'_>, record: &T) -> Result<(), StoreError> {
    let collection = T::collection_name();
    tx.execute(
        "DELETE FROM record_indexes WHERE collection = ?1 AND id = ?2",
        params![collection, record.id()],
    )?;
    let mut stmt = tx.prepare_cached(
        "INSERT INTO record_indexes (collection, id, field, value) VALUES (?1, ?2, ?3, ?4)",
    )?;
    for (field, value) in record.indexed_fields() {
        stmt.execute(params![collection, record.id(), field, value])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use serde::{Deserialize, Serialize};
    use tempfile::tempdir;

    use super::*;
    use crate::{FilterOp, IndexValue, now_ms};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        id: String,
        status: String,
        weight: i64,
        updated_at: i64,
    }

    impl Note {
        fn new(id: &str, status: &str, weight: i64) -> Self {
            Self {
                id: id.to_string(),
                status: status.to_string(),
                weight,
                updated_at: now_ms(),
            }
        }
    }

    impl Record for Note {
        fn id(&self) -> &str {
            &self.id
        }

        fn updated_at(&self) -> i64 {
            self.updated_at
        }

        fn collection_name() -> &'static str {
            "notes"
        }

        fn indexed_fields(&self) -> HashMap<String, IndexValue> {
            let mut fields = HashMap::new();
            fields.insert("status".to_string(), IndexValue::String(self.status.clone()));
            fields.insert("weight".to_string(), IndexValue::Int(self.weight));
            fields
        }
    }

    #[test]
    fn test_create_and_get() {
        let store = Store::open_in_memory().unwrap();
        let id = store.create(Note::new("n1", "open", 1)).unwrap();
        assert_eq!(id, "n1");

        let note: Note = store.get("n1").unwrap().unwrap();
        assert_eq!(note.status, "open");
        assert!(store.get::<Note>("missing").unwrap().is_none());
    }

    #[test]
    fn test_create_duplicate_fails() {
        let store = Store::open_in_memory().unwrap();
        store.create(Note::new("n1", "open", 1)).unwrap();
        let err = store.create(Note::new("n1", "open", 2)).unwrap_err();
        assert!(matches!(err, StoreError::Duplicate { .. }));
    }

    #[test]
    fn test_update_missing_fails() {
        let store = Store::open_in_memory().unwrap();
        let err = store.update(Note::new("n1", "open", 1)).unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[test]
    fn test_update_reindexes() {
        let store = Store::open_in_memory().unwrap();
        store.create(Note::new("n1", "open", 1)).unwrap();

        let mut note: Note = store.get("n1").unwrap().unwrap();
        note.status = "closed".to_string();
        store.update(note).unwrap();

        let open: Vec<Note> = store.list(&[Filter::eq("status", "open")]).unwrap();
        let closed: Vec<Note> = store.list(&[Filter::eq("status", "closed")]).unwrap();
        assert!(open.is_empty());
        assert_eq!(closed.len(), 1);
    }

    #[test]
    fn test_list_orders_by_recency_with_write_sequence() {
        let store = Store::open_in_memory().unwrap();
        let stamp = now_ms();
        for id in ["a", "b", "c"] {
            let mut note = Note::new(id, "open", 1);
            note.updated_at = stamp;
            store.create(note).unwrap();
        }

        let notes: Vec<Note> = store.list(&[]).unwrap();
        let ids: Vec<&str> = notes.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b", "a"]);
    }

    #[test]
    fn test_list_with_numeric_filters() {
        let store = Store::open_in_memory().unwrap();
        store.create(Note::new("light", "open", 1)).unwrap();
        store.create(Note::new("heavy", "open", 10)).unwrap();

        let heavy: Vec<Note> = store
            .list(&[Filter {
                field: "weight".to_string(),
                op: FilterOp::Gt,
                value: IndexValue::Int(5),
            }])
            .unwrap();
        assert_eq!(heavy.len(), 1);
        assert_eq!(heavy[0].id, "heavy");
    }

    #[test]
    fn test_list_contains_filter() {
        let store = Store::open_in_memory().unwrap();
        store.create(Note::new("n1", "waiting-on-review", 1)).unwrap();
        store.create(Note::new("n2", "open", 1)).unwrap();

        let found: Vec<Note> = store
            .list(&[Filter {
                field: "status".to_string(),
                op: FilterOp::Contains,
                value: IndexValue::from("review"),
            }])
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "n1");
    }

    #[test]
    fn test_delete() {
        let store = Store::open_in_memory().unwrap();
        store.create(Note::new("n1", "open", 1)).unwrap();
        assert!(store.delete::<Note>("n1").unwrap());
        assert!(!store.delete::<Note>("n1").unwrap());
        assert!(store.list::<Note>(&[Filter::eq("status", "open")]).unwrap().is_empty());
    }

    #[test]
    fn test_upsert_inserts_then_replaces() {
        let store = Store::open_in_memory().unwrap();
        store.upsert(Note::new("n1", "open", 1)).unwrap();
        store.upsert(Note::new("n1", "closed", 2)).unwrap();

        let note: Note = store.get("n1").unwrap().unwrap();
        assert_eq!(note.status, "closed");
        assert_eq!(store.list::<Note>(&[]).unwrap().len(), 1);
    }

    #[test]
    fn test_update_with_changes_in_place() {
        let store = Store::open_in_memory().unwrap();
        store.create(Note::new("n1", "open", 1)).unwrap();

        let updated: Option<Note> = store
            .update_with("n1", |mut note: Note| {
                note.status = "closed".to_string();
                Ok::<_, StoreError>(note)
            })
            .unwrap();
        assert_eq!(updated.unwrap().status, "closed");
        assert_eq!(store.list::<Note>(&[Filter::eq("status", "closed")]).unwrap().len(), 1);

        let missing: Option<Note> = store.update_with("n2", Ok::<_, StoreError>).unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn test_update_with_rejection_leaves_record() {
        let store = Store::open_in_memory().unwrap();
        store.create(Note::new("n1", "open", 1)).unwrap();

        let err = store
            .update_with("n1", |note: Note| {
                Err::<Note, _>(StoreError::Duplicate {
                    collection: "notes".to_string(),
                    id: note.id,
                })
            })
            .unwrap_err();
        assert!(matches!(err, StoreError::Duplicate { .. }));
        assert_eq!(store.get::<Note>("n1").unwrap().unwrap().status, "open");

        let err = store
            .update_with("n1", |mut note: Note| {
                note.id = "other".to_string();
                Ok::<_, StoreError>(note)
            })
            .unwrap_err();
        assert!(matches!(err, StoreError::IdMismatch { .. }));
    }

    #[test]
    fn test_rebuild_indexes() {
        let store = Store::open_in_memory().unwrap();
        store.create(Note::new("n1", "open", 1)).unwrap();
        store.create(Note::new("n2", "open", 2)).unwrap();
        assert_eq!(store.rebuild_indexes::<Note>().unwrap(), 2);
        assert_eq!(store.list::<Note>(&[Filter::eq("status", "open")]).unwrap().len(), 2);
    }

    #[test]
    fn test_reopen_from_disk() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("nested").join("store.db");
        {
            let store = Store::open(&path).unwrap();
            store.create(Note::new("n1", "open", 1)).unwrap();
        }
        let store = Store::open(&path).unwrap();
        assert_eq!(store.path(), Some(path.as_path()));
        assert!(store.get::<Note>("n1").unwrap().is_some());
    }
}
