use super::{acknowledged, Model, UpdateOptions};
use crate::document::{get_path, seed_document, timestamp_now, DocumentId, ID_KEY, UPDATED_AT_KEY};
use crate::error::{DocmapError, Result};
use crate::sanitize::sanitize_update;
use crate::schema::FieldType;
use crate::store::eval::{apply_update, upsert_document};
use crate::store::{DocumentStore, FindOneAndUpdateOptions, ReturnDocument};
use crate::validation::{
    conforms, validate, validate_document, validate_paths, ValidateOptions, ValidationReport,
};
use crate::Map;
use serde_json::Value;

const SET: &str = "$set";
const SET_ON_INSERT: &str = "$setOnInsert";
const UNSET: &str = "$unset";

/// Operators whose result depends on the stored value.
const RELATIVE_OPERATORS: [&str; 6] = ["$inc", "$push", "$addToSet", "$pull", "$min", "$max"];

/// Items of a `$push`/`$addToSet` argument, expanding `$each`.
fn pushed_items(value: &Value) -> Vec<&Value> {
    match value.get("$each") {
        Some(Value::Array(items)) => items.iter().collect(),
        _ => vec![value],
    }
}

fn overlaps(a: &str, b: &str) -> bool {
    a == b
        || a.strip_prefix(b).map_or(false, |rest| rest.starts_with('.'))
        || b.strip_prefix(a).map_or(false, |rest| rest.starts_with('.'))
}

impl<'a, S: DocumentStore> Model<'a, S> {
    /// Update the first matching document. Returns whether one matched or
    /// was upserted.
    pub fn update_one(&self, query: Value, update: Value, options: UpdateOptions) -> Result<bool> {
        let (filter, descriptor) = self.prepare_update(query, update, options, false)?;
        let result = self
            .store()
            .update_one(self.collection(), &filter, &descriptor, options.upsert)?;
        acknowledged(result.acknowledged, "update_one")?;
        self.hooks.post_update(None, &[])?;
        Ok(result.matched > 0 || result.upserted_id.is_some())
    }

    /// Update the first matching document and return it after the update.
    /// The post-update hook also receives the document from before.
    pub fn find_one_and_update(
        &self,
        query: Value,
        update: Value,
        options: UpdateOptions,
    ) -> Result<Option<Map>> {
        let (filter, descriptor) = self.prepare_update(query, update, options, false)?;
        let store_options = FindOneAndUpdateOptions {
            upsert: options.upsert,
            return_document: ReturnDocument::Before,
        };
        let previous = self
            .store()
            .find_one_and_update(self.collection(), &filter, &descriptor, store_options)?;

        let target = match &previous {
            Some(doc) => doc.get(ID_KEY).cloned(),
            None if options.upsert => descriptor
                .get(SET_ON_INSERT)
                .and_then(|on_insert| on_insert.get(ID_KEY))
                .cloned(),
            None => None,
        };
        let current = match target {
            Some(id) => self.store().find(self.collection(), &by_id(id))?.into_iter().next(),
            None => None,
        };

        let documents: Vec<Map> = current.iter().cloned().collect();
        self.hooks.post_update(previous.as_ref(), &documents)?;
        Ok(current)
    }

    /// Update every matching document. Returns how many were modified
    /// (or 1 when an upsert inserted).
    pub fn update_many(&self, query: Value, update: Value, options: UpdateOptions) -> Result<u64> {
        let (filter, descriptor) = self.prepare_update(query, update, options, true)?;
        let result = self
            .store()
            .update_many(self.collection(), &filter, &descriptor, options.upsert)?;
        acknowledged(result.acknowledged, "update_many")?;
        self.hooks.post_update(None, &[])?;
        Ok(result.modified + u64::from(result.upserted_id.is_some()))
    }

    /// Update every matching document one at a time and return the updated
    /// documents.
    pub fn update_many_returning(
        &self,
        query: Value,
        update: Value,
        options: UpdateOptions,
    ) -> Result<Vec<Map>> {
        let (filter, descriptor) = self.prepare_update(query, update, options, true)?;
        let matched = self.store().find(self.collection(), &filter)?;
        let after = FindOneAndUpdateOptions {
            upsert: false,
            return_document: ReturnDocument::After,
        };

        let mut documents = Vec::with_capacity(matched.len());
        for doc in &matched {
            let Some(id) = doc.get(ID_KEY).cloned() else {
                continue;
            };
            // Still matching the original filter, so concurrent changes are respected
            let mut conditional = Map::new();
            conditional.insert(
                "$and".into(),
                Value::Array(vec![Value::Object(by_id(id)), Value::Object(filter.clone())]),
            );
            if let Some(updated) =
                self.store()
                    .find_one_and_update(self.collection(), &conditional, &descriptor, after)?
            {
                documents.push(updated);
            }
        }

        if matched.is_empty() && options.upsert {
            let upsert = FindOneAndUpdateOptions {
                upsert: true,
                ..after
            };
            if let Some(created) =
                self.store()
                    .find_one_and_update(self.collection(), &filter, &descriptor, upsert)?
            {
                documents.push(created);
            }
        }

        self.hooks.post_update(None, &documents)?;
        Ok(documents)
    }

    /// Permission, hook, sanitize, upsert seeding, timestamp, format,
    /// encrypt and validate every operator. Returns the filter and the final
    /// descriptor.
    fn prepare_update(
        &self,
        query: Value,
        update: Value,
        options: UpdateOptions,
        many: bool,
    ) -> Result<(Map, Map)> {
        let permissions = &self.schema.permissions;
        if many {
            self.require(permissions.update_many, "update_many")?;
        } else {
            self.require(permissions.update, "update")?;
        }

        let (query, update) = self.hooks.pre_update(query, update)?;
        let filter = self.filter(&query)?;
        let mut descriptor = sanitize_update(self.schema, &update)?;

        let seed = if options.upsert {
            self.require(permissions.upsert, "upsert")?;
            let provided: Map = [SET, SET_ON_INSERT]
                .iter()
                .filter_map(|op| descriptor.get(*op).and_then(Value::as_object))
                .flat_map(|fields| fields.iter().map(|(k, v)| (k.clone(), v.clone())))
                .collect();
            Some(self.upsert_seed(&filter, Some(&provided))?)
        } else {
            None
        };

        let mut set = match descriptor.remove(SET) {
            Some(Value::Object(set)) => set,
            _ => Map::new(),
        };
        if self.timestamps_enabled(options.timestamps) {
            set.insert(UPDATED_AT_KEY.to_string(), timestamp_now());
        }
        self.prepare_set(&mut set)?;

        let mut on_insert = match descriptor.remove(SET_ON_INSERT) {
            Some(Value::Object(explicit)) => explicit,
            _ => Map::new(),
        };
        self.prepare_set(&mut on_insert)?;
        self.check_operators(&mut descriptor)?;

        let mut ordered = Map::new();
        if let Some(seed) = seed {
            for (key, value) in seed {
                let taken = on_insert.contains_key(&key) || set.keys().any(|path| overlaps(path, &key));
                if !taken {
                    on_insert.insert(key, value);
                }
            }
        }
        if !on_insert.is_empty() {
            ordered.insert(SET_ON_INSERT.to_string(), Value::Object(on_insert));
        }
        if !set.is_empty() {
            ordered.insert(SET.to_string(), Value::Object(set));
        }
        ordered.extend(descriptor);
        if ordered.is_empty() {
            return Err(DocmapError::InvalidUpdate(format!(
                "update of '{}' changes nothing",
                self.schema.name
            )));
        }
        if ordered.keys().any(|op| RELATIVE_OPERATORS.contains(&op.as_str())) {
            self.check_outcome(&filter, &ordered, many, options.upsert)?;
        }
        Ok((filter, ordered))
    }

    /// Check the arguments of every operator other than `$set` and
    /// `$setOnInsert`, formatting `$min`/`$max` values in place.
    fn check_operators(&self, descriptor: &mut Map) -> Result<()> {
        let name = &self.schema.name;
        let mut report = ValidationReport::default();
        for (op, argument) in descriptor.iter_mut() {
            let Value::Object(fields) = argument else {
                continue;
            };
            for (path, value) in fields.iter_mut() {
                let Some(spec) = self.schema.fields.resolve_path(path) else {
                    continue;
                };
                if op == UNSET {
                    if spec.required {
                        report.errors.push(format!("Required field '{path}' cannot be unset"));
                    }
                    continue;
                }
                if spec.encrypted {
                    return Err(DocmapError::InvalidUpdate(format!(
                        "'{op}' cannot target encrypted field '{name}.{path}'"
                    )));
                }
                match op.as_str() {
                    "$min" | "$max" => {
                        if let Some(format) = &spec.format {
                            if !value.is_null() {
                                *value = format.call(value.take());
                            }
                        }
                        if !validate(value, spec) {
                            report.errors.push(format!("Field '{path}' rejects {op} value {value}"));
                        }
                    }
                    "$push" | "$addToSet" => match &spec.field_type {
                        FieldType::Array(item) => {
                            for pushed in pushed_items(value) {
                                if !conforms(pushed, item) {
                                    report.errors.push(format!(
                                        "Field '{path}' expected {} items, got {pushed}",
                                        item.name()
                                    ));
                                }
                            }
                        }
                        other => report
                            .errors
                            .push(format!("Field '{path}' is {}, not an array", other.name())),
                    },
                    "$inc" => {
                        if !matches!(spec.field_type, FieldType::Number | FieldType::Integer | FieldType::Any) {
                            report.errors.push(format!(
                                "Field '{path}' is {}, it cannot be incremented",
                                spec.field_type.name()
                            ));
                        }
                    }
                    _ => {}
                }
            }
        }
        report.into_result(name)
    }

    /// Operators such as `$inc` produce values that depend on the stored
    /// document, so the update is applied to a copy of every document it
    /// would touch and the touched fields are validated. Best effort, like
    /// the uniqueness pre-check.
    fn check_outcome(&self, filter: &Map, descriptor: &Map, many: bool, upsert: bool) -> Result<()> {
        let mut touched: Vec<&str> = Vec::new();
        for (op, argument) in descriptor {
            if !RELATIVE_OPERATORS.contains(&op.as_str()) {
                continue;
            }
            if let Some(fields) = argument.as_object() {
                touched.extend(fields.keys().map(String::as_str));
            }
        }

        let mut matched = self.store().find(self.collection(), filter)?;
        if !many {
            matched.truncate(1);
        }
        let outcomes = if matched.is_empty() && upsert {
            vec![upsert_document(filter, descriptor)?]
        } else {
            let mut outcomes = Vec::with_capacity(matched.len());
            for mut doc in matched {
                apply_update(&mut doc, descriptor, false)?;
                outcomes.push(doc);
            }
            outcomes
        };

        for doc in &outcomes {
            let values: Map = touched
                .iter()
                .filter_map(|path| get_path(doc, path).map(|value| (path.to_string(), value.clone())))
                .collect();
            validate_paths(self.schema, &values).into_result(&self.schema.name)?;
        }
        Ok(())
    }

    /// Run the insert-side preparation over the filter's equality fields.
    fn upsert_seed(&self, filter: &Map, provided: Option<&Map>) -> Result<Map> {
        let seed = seed_document(filter);
        let mut seed = self.assign_id(seed)?;
        if self.timestamps_enabled(true) {
            self.stamp_created(&mut seed);
        }
        self.fill_defaults(&mut seed);
        self.apply_formats(&mut seed);
        self.encrypt(&mut seed)?;
        self.check_required(&seed, provided)?;
        let options = ValidateOptions {
            require_all: false,
            allow_unknown: false,
        };
        validate_document(self.schema, &seed, options).into_result(&self.schema.name)?;
        Ok(seed)
    }
}

fn by_id(id: Value) -> Map {
    let id = match DocumentId::from_value(&id) {
        Some(parsed) => Value::from(parsed),
        None => id,
    };
    let mut filter = Map::new();
    filter.insert(ID_KEY.to_string(), id);
    filter
}
