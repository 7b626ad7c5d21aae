use super::eval::{apply_update, matches, upsert_document, values_equal};
use super::{
    DeleteResult, FindOneAndUpdateOptions, InsertManyResult, InsertOneResult, ReturnDocument,
    UpdateResult,
};
use crate::document::{get_path, DocumentId, ID_KEY};
use crate::error::{DocmapError, Result};
use crate::schema::IndexDescriptor;
use crate::Map;
use serde_json::Value;

/// Rows written or removed by one operation, for stores that persist.
#[derive(Debug, Default)]
pub struct Changes {
    pub written: Vec<String>,
    pub removed: Vec<String>,
}

impl Changes {
    fn write(&mut self, id: &str) {
        self.removed.retain(|r| r != id);
        if !self.written.iter().any(|w| w == id) {
            self.written.push(id.to_string());
        }
    }

    fn remove(&mut self, id: &str) {
        self.written.retain(|w| w != id);
        self.removed.push(id.to_string());
    }

    pub fn is_empty(&self) -> bool {
        self.written.is_empty() && self.removed.is_empty()
    }
}

/// The documents and indexes of one collection, in insertion order.
#[derive(Debug, Clone, Default)]
pub struct CollectionData {
    pub documents: Vec<Map>,
    pub indexes: Vec<IndexDescriptor>,
}

fn id_of(doc: &Map) -> Result<String> {
    doc.get(ID_KEY)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| DocmapError::StoreFailure("document has no string '_id'".into()))
}

impl CollectionData {
    pub fn new(documents: Vec<Map>, indexes: Vec<IndexDescriptor>) -> Self {
        CollectionData { documents, indexes }
    }

    pub fn get(&self, id: &str) -> Option<&Map> {
        self.documents
            .iter()
            .find(|doc| doc.get(ID_KEY).and_then(Value::as_str) == Some(id))
    }

    /// Register indexes, replacing same-named ones. Existing documents must
    /// already satisfy new unique indexes.
    pub fn ensure_indexes(&mut self, indexes: &[IndexDescriptor]) -> Result<()> {
        for index in indexes {
            if index.unique {
                for (position, doc) in self.documents.iter().enumerate() {
                    self.check_index(index, doc, Some(position))?;
                }
            }
            match self.indexes.iter_mut().find(|existing| existing.name == index.name) {
                Some(existing) => *existing = index.clone(),
                None => self.indexes.push(index.clone()),
            }
        }
        Ok(())
    }

    fn positions(&self, filter: &Map, many: bool) -> Result<Vec<usize>> {
        let mut found = Vec::new();
        for (position, doc) in self.documents.iter().enumerate() {
            if matches(doc, filter)? {
                found.push(position);
                if !many {
                    break;
                }
            }
        }
        Ok(found)
    }

    /// Reject `doc` if it collides on `_id` or on a unique index with any
    /// document other than the one at `skip`.
    fn check_unique(&self, doc: &Map, skip: Option<usize>) -> Result<()> {
        let id = doc.get(ID_KEY);
        for (position, other) in self.documents.iter().enumerate() {
            if Some(position) != skip && other.get(ID_KEY) == id {
                return Err(DocmapError::StoreFailure(format!(
                    "duplicate key: _id {}",
                    id.cloned().unwrap_or(Value::Null)
                )));
            }
        }
        for index in self.indexes.iter().filter(|index| index.unique) {
            self.check_index(index, doc, skip)?;
        }
        Ok(())
    }

    fn check_index(&self, index: &IndexDescriptor, doc: &Map, skip: Option<usize>) -> Result<()> {
        let key: Vec<Option<&Value>> = index.fields().map(|field| get_path(doc, field)).collect();
        // Documents missing every indexed field are not indexed
        if key.iter().all(|value| value.map_or(true, Value::is_null)) {
            return Ok(());
        }
        for (position, other) in self.documents.iter().enumerate() {
            if Some(position) == skip {
                continue;
            }
            let same = index.fields().zip(&key).all(|(field, value)| {
                match (get_path(other, field), value) {
                    (Some(a), Some(b)) => values_equal(a, b),
                    (None, None) => true,
                    _ => false,
                }
            });
            if same {
                return Err(DocmapError::StoreFailure(format!(
                    "duplicate key: unique index '{}' already holds this value",
                    index.name
                )));
            }
        }
        Ok(())
    }

    fn ensure_id(doc: &mut Map) -> Result<String> {
        if !doc.contains_key(ID_KEY) {
            doc.insert(ID_KEY.to_string(), Value::from(DocumentId::new()));
        }
        id_of(doc)
    }

    /// Run `op` all-or-nothing.
    fn atomically<T>(
        &mut self,
        changes: &mut Changes,
        op: impl FnOnce(&mut Self, &mut Changes) -> Result<T>,
    ) -> Result<T> {
        let snapshot = self.documents.clone();
        let mut staged = Changes::default();
        match op(self, &mut staged) {
            Ok(value) => {
                for id in staged.removed {
                    changes.remove(&id);
                }
                for id in staged.written {
                    changes.write(&id);
                }
                Ok(value)
            }
            Err(e) => {
                self.documents = snapshot;
                Err(e)
            }
        }
    }

    pub fn insert_one(&mut self, mut doc: Map, changes: &mut Changes) -> Result<InsertOneResult> {
        let id = Self::ensure_id(&mut doc)?;
        self.check_unique(&doc, None)?;
        self.documents.push(doc);
        changes.write(&id);
        Ok(InsertOneResult {
            acknowledged: true,
            inserted_id: id,
        })
    }

    pub fn insert_many(&mut self, docs: Vec<Map>, changes: &mut Changes) -> Result<InsertManyResult> {
        self.atomically(changes, |data, changes| {
            let mut inserted_ids = Vec::with_capacity(docs.len());
            for doc in docs {
                inserted_ids.push(data.insert_one(doc, changes)?.inserted_id);
            }
            Ok(InsertManyResult {
                acknowledged: true,
                inserted_ids,
            })
        })
    }

    /// Apply `update` to the document at `position`. Returns whether it changed.
    fn update_at(&mut self, position: usize, update: &Map, changes: &mut Changes) -> Result<bool> {
        let before = &self.documents[position];
        let mut after = before.clone();
        apply_update(&mut after, update, false)?;
        if after.get(ID_KEY) != before.get(ID_KEY) {
            return Err(DocmapError::InvalidUpdate("'_id' cannot be modified".into()));
        }
        if &after == before {
            return Ok(false);
        }
        self.check_unique(&after, Some(position))?;
        let id = id_of(&after)?;
        self.documents[position] = after;
        changes.write(&id);
        Ok(true)
    }

    fn upsert(&mut self, filter: &Map, update: &Map, changes: &mut Changes) -> Result<String> {
        let doc = upsert_document(filter, update)?;
        Ok(self.insert_one(doc, changes)?.inserted_id)
    }

    pub fn update(
        &mut self,
        filter: &Map,
        update: &Map,
        upsert: bool,
        many: bool,
        changes: &mut Changes,
    ) -> Result<UpdateResult> {
        self.atomically(changes, |data, changes| {
            let positions = data.positions(filter, many)?;
            if positions.is_empty() && upsert {
                let id = data.upsert(filter, update, changes)?;
                return Ok(UpdateResult {
                    acknowledged: true,
                    matched: 0,
                    modified: 0,
                    upserted_id: Some(id),
                });
            }
            let mut modified = 0;
            for &position in &positions {
                if data.update_at(position, update, changes)? {
                    modified += 1;
                }
            }
            Ok(UpdateResult {
                acknowledged: true,
                matched: positions.len() as u64,
                modified,
                upserted_id: None,
            })
        })
    }

    pub fn delete(&mut self, filter: &Map, many: bool, changes: &mut Changes) -> Result<DeleteResult> {
        let positions = self.positions(filter, many)?;
        for &position in positions.iter().rev() {
            let doc = self.documents.remove(position);
            if let Ok(id) = id_of(&doc) {
                changes.remove(&id);
            }
        }
        Ok(DeleteResult {
            acknowledged: true,
            deleted: positions.len() as u64,
        })
    }

    pub fn find_one_and_update(
        &mut self,
        filter: &Map,
        update: &Map,
        options: FindOneAndUpdateOptions,
        changes: &mut Changes,
    ) -> Result<Option<Map>> {
        self.atomically(changes, |data, changes| {
            match data.positions(filter, false)?.first().copied() {
                Some(position) => {
                    let before = data.documents[position].clone();
                    data.update_at(position, update, changes)?;
                    Ok(Some(match options.return_document {
                        ReturnDocument::Before => before,
                        ReturnDocument::After => data.documents[position].clone(),
                    }))
                }
                None if options.upsert => {
                    let id = data.upsert(filter, update, changes)?;
                    Ok(match options.return_document {
                        ReturnDocument::Before => None,
                        ReturnDocument::After => data.get(&id).cloned(),
                    })
                }
                None => Ok(None),
            }
        })
    }

    pub fn find_one_and_delete(&mut self, filter: &Map, changes: &mut Changes) -> Result<Option<Map>> {
        match self.positions(filter, false)?.first().copied() {
            Some(position) => {
                let doc = self.documents.remove(position);
                if let Ok(id) = id_of(&doc) {
                    changes.remove(&id);
                }
                Ok(Some(doc))
            }
            None => Ok(None),
        }
    }
}
