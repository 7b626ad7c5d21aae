use super::collection::{Changes, CollectionData};
use super::eval::run_pipeline;
use super::{
    DeleteResult, DocumentStore, FindOneAndUpdateOptions, InsertManyResult, InsertOneResult,
    UpdateResult,
};
use crate::error::{DocmapError, Result};
use crate::pipeline::Stage;
use crate::schema::IndexDescriptor;
use crate::Map;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

/// Process-local store. Collections spring into existence on first write.
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: Mutex<HashMap<String, CollectionData>>,
    closed: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, CollectionData>>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DocmapError::StoreFailure("store is closed".into()));
        }
        self.collections
            .lock()
            .map_err(|_| DocmapError::StoreFailure("store lock poisoned".into()))
    }

    fn with_collection<T>(
        &self,
        collection: &str,
        op: impl FnOnce(&mut CollectionData, &mut Changes) -> Result<T>,
    ) -> Result<T> {
        let mut collections = self.lock()?;
        let data = collections.entry(collection.to_string()).or_default();
        let mut changes = Changes::default();
        op(data, &mut changes)
    }

    /// Number of documents currently held in `collection`.
    pub fn len(&self, collection: &str) -> Result<usize> {
        Ok(self
            .lock()?
            .get(collection)
            .map_or(0, |data| data.documents.len()))
    }
}

impl DocumentStore for MemoryStore {
    fn is_ready(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        log::debug!("memory store closed");
        Ok(())
    }

    fn ensure_indexes(&self, collection: &str, indexes: &[IndexDescriptor]) -> Result<()> {
        self.with_collection(collection, |data, _| data.ensure_indexes(indexes))
    }

    fn aggregate(&self, collection: &str, stages: &[Stage]) -> Result<Vec<Map>> {
        let collections = self.lock()?;
        let docs = collections
            .get(collection)
            .map(|data| data.documents.clone())
            .unwrap_or_default();
        let mut foreign = |name: &str| -> Result<Vec<Map>> {
            Ok(collections
                .get(name)
                .map(|data| data.documents.clone())
                .unwrap_or_default())
        };
        run_pipeline(docs, stages, &mut foreign)
    }

    fn insert_one(&self, collection: &str, doc: Map) -> Result<InsertOneResult> {
        self.with_collection(collection, |data, changes| data.insert_one(doc, changes))
    }

    fn insert_many(&self, collection: &str, docs: Vec<Map>) -> Result<InsertManyResult> {
        self.with_collection(collection, |data, changes| data.insert_many(docs, changes))
    }

    fn update_one(&self, collection: &str, filter: &Map, update: &Map, upsert: bool) -> Result<UpdateResult> {
        self.with_collection(collection, |data, changes| {
            data.update(filter, update, upsert, false, changes)
        })
    }

    fn update_many(&self, collection: &str, filter: &Map, update: &Map, upsert: bool) -> Result<UpdateResult> {
        self.with_collection(collection, |data, changes| {
            data.update(filter, update, upsert, true, changes)
        })
    }

    fn delete_one(&self, collection: &str, filter: &Map) -> Result<DeleteResult> {
        self.with_collection(collection, |data, changes| data.delete(filter, false, changes))
    }

    fn delete_many(&self, collection: &str, filter: &Map) -> Result<DeleteResult> {
        self.with_collection(collection, |data, changes| data.delete(filter, true, changes))
    }

    fn find_one_and_update(
        &self,
        collection: &str,
        filter: &Map,
        update: &Map,
        options: FindOneAndUpdateOptions,
    ) -> Result<Option<Map>> {
        self.with_collection(collection, |data, changes| {
            data.find_one_and_update(filter, update, options, changes)
        })
    }

    fn find_one_and_delete(&self, collection: &str, filter: &Map) -> Result<Option<Map>> {
        self.with_collection(collection, |data, changes| data.find_one_and_delete(filter, changes))
    }
}
