//! The store seam: a keyed-document store with find/aggregate, insert,
//! update, delete and their atomic read-modify variants.

pub mod collection;
pub mod eval;
mod memory;
mod sqlite;

pub use collection::CollectionData;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::error::Result;
use crate::pipeline::Stage;
use crate::schema::IndexDescriptor;
use crate::Map;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsertOneResult {
    pub acknowledged: bool,
    pub inserted_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsertManyResult {
    pub acknowledged: bool,
    pub inserted_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateResult {
    pub acknowledged: bool,
    pub matched: u64,
    pub modified: u64,
    /// Set when an upsert inserted a document
    pub upserted_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteResult {
    pub acknowledged: bool,
    pub deleted: u64,
}

/// Which side of a find-one-and-update is returned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReturnDocument {
    Before,
    #[default]
    After,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FindOneAndUpdateOptions {
    pub upsert: bool,
    pub return_document: ReturnDocument,
}

/// A document store organised in named collections.
///
/// Filters and update descriptors arrive already sanitized, updates always
/// in operator form. Implementations must enforce the unique indexes
/// registered through [`DocumentStore::ensure_indexes`].
pub trait DocumentStore: Send + Sync {
    fn is_ready(&self) -> bool;

    /// Release the store. Later calls fail.
    fn close(&self) -> Result<()>;

    fn ensure_indexes(&self, collection: &str, indexes: &[IndexDescriptor]) -> Result<()>;

    fn aggregate(&self, collection: &str, stages: &[Stage]) -> Result<Vec<Map>>;

    fn insert_one(&self, collection: &str, doc: Map) -> Result<InsertOneResult>;

    fn insert_many(&self, collection: &str, docs: Vec<Map>) -> Result<InsertManyResult>;

    fn update_one(&self, collection: &str, filter: &Map, update: &Map, upsert: bool) -> Result<UpdateResult>;

    fn update_many(&self, collection: &str, filter: &Map, update: &Map, upsert: bool) -> Result<UpdateResult>;

    fn delete_one(&self, collection: &str, filter: &Map) -> Result<DeleteResult>;

    fn delete_many(&self, collection: &str, filter: &Map) -> Result<DeleteResult>;

    fn find_one_and_update(
        &self,
        collection: &str,
        filter: &Map,
        update: &Map,
        options: FindOneAndUpdateOptions,
    ) -> Result<Option<Map>>;

    fn find_one_and_delete(&self, collection: &str, filter: &Map) -> Result<Option<Map>>;

    /// Every document matching `filter`, in store order.
    fn find(&self, collection: &str, filter: &Map) -> Result<Vec<Map>> {
        self.aggregate(collection, &[Stage::Match(filter.clone())])
    }
}
