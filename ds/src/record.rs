//! Record trait implemented by every persisted type

use std::collections::HashMap;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::IndexValue;

/// A document that can be stored in a [`crate::Store`]
pub trait Record: Serialize + DeserializeOwned {
    /// Primary key, unique within the collection
    fn id(&self) -> &str;

    /// Last update timestamp (Unix milliseconds)
    fn updated_at(&self) -> i64;

    /// Collection (table namespace) the record belongs to
    fn collection_name() -> &'static str;

    /// Fields that can be used in [`crate::Filter`]s
    fn indexed_fields(&self) -> HashMap<String, IndexValue>;
}
