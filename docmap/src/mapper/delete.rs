use super::{acknowledged, Model};
use crate::document::{DocumentId, ID_KEY};
use crate::error::Result;
use crate::store::DocumentStore;
use crate::Map;
use serde_json::Value;

impl<'a, S: DocumentStore> Model<'a, S> {
    /// Delete the first matching document. Returns whether one was deleted.
    pub fn delete_one(&self, query: Value) -> Result<bool> {
        Ok(self.delete(query, false, false, true)?.0 > 0)
    }

    /// Delete the first matching document and return it.
    pub fn find_one_and_delete(&self, query: Value) -> Result<Option<Map>> {
        Ok(self.delete(query, false, true, true)?.1.into_iter().next())
    }

    /// Delete every matching document. Returns how many were deleted.
    pub fn delete_many(&self, query: Value) -> Result<u64> {
        Ok(self.delete(query, true, false, true)?.0)
    }

    /// Delete every matching document one at a time and return them.
    pub fn delete_many_returning(&self, query: Value) -> Result<Vec<Map>> {
        Ok(self.delete(query, true, true, true)?.1)
    }

    /// The delete path shared by every variant and by cascades, which skip
    /// the permission check.
    fn delete(
        &self,
        query: Value,
        many: bool,
        returning: bool,
        check_permission: bool,
    ) -> Result<(u64, Vec<Map>)> {
        if check_permission {
            let permissions = &self.schema.permissions;
            if many {
                self.require(permissions.delete_many, "delete_many")?;
            } else {
                self.require(permissions.delete, "delete")?;
            }
        }

        let query = self.hooks.pre_delete(query)?;
        let filter = self.filter(&query)?;

        // Cascades need the deleted documents to know their ids
        let (count, deleted) = if returning || !self.schema.cascade.is_empty() {
            let deleted = self.take_documents(&filter, many)?;
            (deleted.len() as u64, deleted)
        } else {
            let result = if many {
                self.store().delete_many(self.collection(), &filter)?
            } else {
                self.store().delete_one(self.collection(), &filter)?
            };
            acknowledged(result.acknowledged, if many { "delete_many" } else { "delete_one" })?;
            (result.deleted, Vec::new())
        };

        for doc in &deleted {
            self.cascade(doc)?;
        }
        self.hooks.post_delete(&deleted)?;
        Ok((count, deleted))
    }

    /// Read-and-delete matching documents one at a time.
    fn take_documents(&self, filter: &Map, many: bool) -> Result<Vec<Map>> {
        if !many {
            return Ok(self
                .store()
                .find_one_and_delete(self.collection(), filter)?
                .into_iter()
                .collect());
        }
        let matched = self.store().find(self.collection(), filter)?;
        let mut deleted = Vec::with_capacity(matched.len());
        for doc in matched {
            let Some(id) = doc.get(ID_KEY).cloned() else {
                continue;
            };
            let mut by_id = Map::new();
            by_id.insert(ID_KEY.to_string(), id);
            let conditional: Map = [(
                "$and".to_string(),
                Value::Array(vec![Value::Object(by_id), Value::Object(filter.clone())]),
            )]
            .into_iter()
            .collect();
            if let Some(doc) = self.store().find_one_and_delete(self.collection(), &conditional)? {
                deleted.push(doc);
            }
        }
        Ok(deleted)
    }

    /// Delete the documents of every cascade target that reference `doc`.
    fn cascade(&self, doc: &Map) -> Result<()> {
        if self.schema.cascade.is_empty() {
            return Ok(());
        }
        let Some(id) = DocumentId::of(doc) else {
            log::warn!(
                "skipping cascade from '{}': deleted document has no valid id",
                self.schema.name
            );
            return Ok(());
        };

        for dependent in &self.schema.cascade {
            let target = self.mapper.model(dependent)?;
            let fields: Vec<&str> = target.schema.references_to(&self.schema.name).collect();
            for field in fields {
                let mut query = Map::new();
                query.insert(field.to_string(), Value::from(id));
                let (deleted, _) = target.delete(Value::Object(query), true, false, false)?;
                if deleted > 0 {
                    log::info!(
                        "cascade from '{}' {id} deleted {deleted} '{}' documents via '{field}'",
                        self.schema.name,
                        target.schema.name
                    );
                }
            }
        }
        Ok(())
    }
}
