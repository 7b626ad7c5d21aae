use super::{acknowledged, InsertOptions, Model};
use crate::error::Result;
use crate::sanitize::{sanitize_document, SanitizeOptions};
use crate::store::DocumentStore;
use crate::Map;
use serde_json::Value;

impl<'a, S: DocumentStore> Model<'a, S> {
    /// Insert one document and return it as persisted.
    pub fn insert_one(&self, doc: Value, options: InsertOptions) -> Result<Map> {
        self.require(self.schema.permissions.insert, "insert")?;
        let doc = self.prepare_insert(doc, options, &[])?;

        let result = self.store().insert_one(self.collection(), doc.clone())?;
        acknowledged(result.acknowledged, "insert_one")?;
        log::debug!("inserted '{}' {}", self.schema.name, result.inserted_id);

        self.hooks.post_insert(&doc)?;
        Ok(doc)
    }

    /// Insert a batch. Members are prepared in order and written with a
    /// single store call; nothing is written if any member fails.
    pub fn insert_many(&self, docs: Vec<Value>, options: InsertOptions) -> Result<Vec<Map>> {
        self.require(self.schema.permissions.insert_many, "insert_many")?;
        let mut prepared: Vec<Map> = Vec::with_capacity(docs.len());
        for doc in docs {
            let doc = self.prepare_insert(doc, options, &prepared)?;
            prepared.push(doc);
        }
        if prepared.is_empty() {
            return Ok(prepared);
        }

        let result = self.store().insert_many(self.collection(), prepared.clone())?;
        acknowledged(result.acknowledged, "insert_many")?;
        log::debug!("inserted {} '{}' documents", result.inserted_ids.len(), self.schema.name);

        for doc in &prepared {
            self.hooks.post_insert(doc)?;
        }
        Ok(prepared)
    }

    /// Everything an insert does before touching the store.
    fn prepare_insert(&self, doc: Value, options: InsertOptions, pending: &[Map]) -> Result<Map> {
        let doc = self.hooks.pre_insert(doc)?;
        let doc = sanitize_document(self.schema, &doc, SanitizeOptions::STRICT)?;
        let mut doc = self.assign_id(doc)?;
        if self.timestamps_enabled(options.timestamps) {
            self.stamp_created(&mut doc);
        }
        self.fill_defaults(&mut doc);
        self.apply_formats(&mut doc);
        self.encrypt(&mut doc)?;
        self.check_document(&doc)?;
        self.check_unique(&doc, pending)?;
        Ok(doc)
    }
}
