// Document preparation steps shared by inserts and upserts

use super::Model;
use crate::document::{get_path, timestamp_now, DocumentId, CREATED_AT_KEY, ID_KEY, UPDATED_AT_KEY};
use crate::encryption::{is_hashed, protect};
use crate::error::{DocmapError, Result};
use crate::schema::{FieldMap, FieldType, IndexDescriptor};
use crate::store::DocumentStore;
use crate::validation::{validate_document, validate_paths, ValidateOptions, ValidationReport};
use crate::Map;
use serde_json::Value;

impl<'a, S: DocumentStore> Model<'a, S> {
    /// Give the document a canonical `_id`, generating one when absent.
    /// The id is kept as the first key.
    pub(super) fn assign_id(&self, doc: Map) -> Result<Map> {
        let id = match doc.get(ID_KEY) {
            None | Some(Value::Null) => DocumentId::new(),
            Some(value) => DocumentId::from_value(value).ok_or_else(|| {
                DocmapError::Validation(format!(
                    "'{}' document has an invalid _id {value}",
                    self.schema.name
                ))
            })?,
        };
        let mut out = Map::with_capacity(doc.len() + 1);
        out.insert(ID_KEY.to_string(), Value::from(id));
        out.extend(doc.into_iter().filter(|(key, _)| key != ID_KEY));
        Ok(out)
    }

    /// Stamp `created_at` (unless provided) and `updated_at`.
    pub(super) fn stamp_created(&self, doc: &mut Map) {
        let now = timestamp_now();
        if doc.get(CREATED_AT_KEY).map_or(true, Value::is_null) {
            doc.insert(CREATED_AT_KEY.to_string(), now.clone());
        }
        doc.insert(UPDATED_AT_KEY.to_string(), now);
    }

    pub(super) fn fill_defaults(&self, doc: &mut Map) {
        fill_defaults(&self.schema.fields, doc);
    }

    pub(super) fn apply_formats(&self, doc: &mut Map) {
        apply_formats(&self.schema.fields, doc);
    }

    /// Hash every `encrypted` top-level field. The plaintext is validated
    /// first since the hash no longer carries its shape.
    pub(super) fn encrypt(&self, doc: &mut Map) -> Result<()> {
        let secret = &self.mapper.settings.hash_secret;
        let mut plaintext = Map::new();
        for (name, spec) in self.schema.fields.iter() {
            if !spec.encrypted {
                continue;
            }
            if let Some(value) = doc.get(name).filter(|v| !v.is_null() && !is_hashed(v)) {
                plaintext.insert(name.to_string(), value.clone());
            }
        }
        validate_paths(self.schema, &plaintext).into_result(&self.schema.name)?;
        for (name, value) in plaintext {
            doc.insert(name, protect(value, secret));
        }
        Ok(())
    }

    /// Format, hash and validate the values of a `$set` or `$setOnInsert`.
    pub(super) fn prepare_set(&self, set: &mut Map) -> Result<()> {
        let secret = &self.mapper.settings.hash_secret;
        let mut plaintext = Map::new();
        for (path, value) in set.iter_mut() {
            let Some(spec) = self.schema.fields.resolve_path(path) else {
                continue;
            };
            if let Some(format) = &spec.format {
                if !value.is_null() {
                    *value = format.call(value.take());
                }
            }
            if let (FieldType::Nested(fields), Value::Object(sub)) = (&spec.field_type, &mut *value) {
                apply_formats(fields, sub);
            }
            if spec.encrypted && !value.is_null() && !is_hashed(value) {
                plaintext.insert(path.clone(), value.clone());
            }
        }
        validate_paths(self.schema, &plaintext).into_result(&self.schema.name)?;
        for (path, value) in plaintext {
            set.insert(path, protect(value, secret));
        }
        validate_paths(self.schema, set).into_result(&self.schema.name)
    }

    /// Full validation of a document about to be inserted.
    pub(super) fn check_document(&self, doc: &Map) -> Result<()> {
        validate_document(self.schema, doc, ValidateOptions::default()).into_result(&self.schema.name)
    }

    /// Required fields absent from both `doc` and the `$set` paths.
    pub(super) fn check_required(&self, doc: &Map, set: Option<&Map>) -> Result<()> {
        let mut report = ValidationReport::default();
        for (name, spec) in self.schema.fields.iter() {
            if !spec.required {
                continue;
            }
            let in_doc = doc.get(name).map_or(false, |v| !v.is_null());
            let in_set = set.map_or(false, |set| {
                set.iter().any(|(path, value)| {
                    !value.is_null() && (path == name || path.starts_with(&format!("{name}.")))
                })
            });
            if !in_doc && !in_set {
                report.errors.push(format!("Required field '{name}' is missing"));
            }
        }
        report.into_result(&self.schema.name)
    }

    /// Best-effort uniqueness pre-check against the store and `pending`
    /// documents of the same batch. The store's unique indexes remain the
    /// real guard.
    pub(super) fn check_unique(&self, doc: &Map, pending: &[Map]) -> Result<()> {
        for index in self.schema.unique_indexes() {
            let Some(filter) = unique_filter(index, doc) else {
                continue;
            };
            let clash_pending = pending
                .iter()
                .any(|other| unique_filter(index, other).as_ref() == Some(&filter));
            if clash_pending || !self.store().find(self.collection(), &filter)?.is_empty() {
                return Err(DocmapError::Validation(format!(
                    "'{}' value for unique index '{}' already exists: {}",
                    self.schema.name,
                    index.name,
                    Value::Object(filter)
                )));
            }
        }
        Ok(())
    }
}

/// Equality filter on the indexed fields, `None` when the document has
/// none of them.
fn unique_filter(index: &IndexDescriptor, doc: &Map) -> Option<Map> {
    let mut filter = Map::new();
    let mut any = false;
    for field in index.fields() {
        let value = get_path(doc, field).cloned().unwrap_or(Value::Null);
        any |= !value.is_null();
        filter.insert(field.to_string(), value);
    }
    any.then_some(filter)
}

fn fill_defaults(fields: &FieldMap, doc: &mut Map) {
    for (name, spec) in fields.iter() {
        let missing = doc.get(name).map_or(true, Value::is_null);
        if missing {
            if let Some(default) = &spec.default {
                doc.insert(name.to_string(), default.produce());
            }
        }
        if let (FieldType::Nested(sub_fields), Some(Value::Object(sub))) = (&spec.field_type, doc.get_mut(name)) {
            fill_defaults(sub_fields, sub);
        }
    }
}

fn apply_formats(fields: &FieldMap, doc: &mut Map) {
    for (name, spec) in fields.iter() {
        let Some(value) = doc.get_mut(name) else {
            continue;
        };
        if value.is_null() {
            continue;
        }
        if let Some(format) = &spec.format {
            *value = format.call(value.take());
        }
        if let (FieldType::Nested(sub_fields), Value::Object(sub)) = (&spec.field_type, value) {
            apply_formats(sub_fields, sub);
        }
    }
}
