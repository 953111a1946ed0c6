//! DurableStore - keyed record persistence over SQLite
//!
//! Every record is stored as a JSON document keyed by `(collection, id)`, with a
//! side table of indexed fields used for filtering. Writes are single-row upserts
//! inside one transaction, so independent writers touching different keys never
//! conflict.

mod error;
mod filter;
mod record;
mod store;

pub use error::StoreError;
pub use filter::{Filter, FilterOp, IndexValue};
pub use record::Record;
pub use store::Store;

/// Current Unix time in milliseconds
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
