//! The document lifecycle engine.
//!
//! A [`Mapper`] owns the store handle, the schema registry and the hooks of
//! every entity. A [`Model`] is the per-entity view handed out by
//! [`Mapper::model`]; every insert, update and delete passes through it.

mod delete;
mod insert;
mod prepare;
mod random;
mod update;

pub use random::RandomOptions;

use crate::config::Settings;
use crate::document::DocumentId;
use crate::error::{DocmapError, Result};
use crate::hooks::{Hooks, NoHooks};
use crate::pipeline::{build_pipeline, project_stage, PipelineOptions, PipelineSpecs, ProjectOptions, Stage};
use crate::sanitize::{sanitize_query, SanitizeOptions};
use crate::schema::{Schema, SchemaDefinition, SchemaRegistry};
use crate::store::DocumentStore;
use crate::Map;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

static NO_HOOKS: NoHooks = NoHooks;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertOptions {
    /// Stamp `created_at`/`updated_at`
    pub timestamps: bool,
}

impl Default for InsertOptions {
    fn default() -> Self {
        InsertOptions { timestamps: true }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateOptions {
    /// Insert from the filter when nothing matches
    pub upsert: bool,
    /// Stamp `updated_at`
    pub timestamps: bool,
}

impl Default for UpdateOptions {
    fn default() -> Self {
        UpdateOptions {
            upsert: false,
            timestamps: true,
        }
    }
}

impl UpdateOptions {
    pub fn upsert() -> Self {
        UpdateOptions {
            upsert: true,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    pub sort: Option<Map>,
    pub skip: Option<u64>,
    pub limit: Option<u64>,
}

/// Store handle, schemas and hooks.
pub struct Mapper<S: DocumentStore> {
    store: S,
    registry: SchemaRegistry,
    settings: Settings,
    hooks: HashMap<String, Arc<dyn Hooks>>,
}

impl<S: DocumentStore> Mapper<S> {
    /// Check the store is ready, resolve every reference and ensure each
    /// schema's indexes.
    pub fn new(store: S, registry: SchemaRegistry, settings: Settings) -> Result<Self> {
        if !store.is_ready() {
            return Err(DocmapError::StoreFailure("store is not ready".into()));
        }
        registry.check_references()?;
        for schema in registry.iter() {
            if !schema.indexes.is_empty() {
                store.ensure_indexes(&schema.collection, &schema.indexes)?;
            }
        }
        log::debug!("mapper ready with {} entities", registry.len());
        Ok(Mapper {
            store,
            registry,
            settings,
            hooks: HashMap::new(),
        })
    }

    /// Build from a parsed schema file, using its settings.
    pub fn from_definition(store: S, definition: SchemaDefinition) -> Result<Self> {
        let settings = definition.settings.clone();
        Self::new(store, definition.into_registry()?, settings)
    }

    /// Attach hooks to an entity, replacing any earlier ones.
    pub fn with_hooks(mut self, entity: &str, hooks: impl Hooks + 'static) -> Result<Self> {
        self.registry.get(entity)?;
        self.hooks.insert(entity.to_string(), Arc::new(hooks));
        Ok(self)
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// The model of an entity, by entity name.
    pub fn model(&self, entity: &str) -> Result<Model<'_, S>> {
        let schema = self.registry.get(entity)?;
        Ok(self.model_of(schema))
    }

    /// The model of an entity, by backing collection name.
    pub fn model_for_collection(&self, collection: &str) -> Result<Model<'_, S>> {
        let schema = self.registry.by_collection(collection)?;
        Ok(self.model_of(schema))
    }

    fn model_of<'a>(&'a self, schema: &'a Schema) -> Model<'a, S> {
        let hooks: &dyn Hooks = match self.hooks.get(&schema.name) {
            Some(hooks) => hooks.as_ref(),
            None => &NO_HOOKS,
        };
        Model {
            mapper: self,
            schema,
            hooks,
        }
    }

    /// Dispose the store.
    pub fn close(&self) -> Result<()> {
        self.store.close()
    }
}

/// Lifecycle operations of one entity.
pub struct Model<'a, S: DocumentStore> {
    mapper: &'a Mapper<S>,
    schema: &'a Schema,
    hooks: &'a dyn Hooks,
}

impl<'a, S: DocumentStore> Model<'a, S> {
    pub fn schema(&self) -> &'a Schema {
        self.schema
    }

    fn store(&self) -> &'a S {
        &self.mapper.store
    }

    fn collection(&self) -> &'a str {
        &self.schema.collection
    }

    fn require(&self, allowed: bool, operation: &str) -> Result<()> {
        if allowed {
            Ok(())
        } else {
            Err(DocmapError::permission(&self.schema.name, operation))
        }
    }

    fn timestamps_enabled(&self, requested: bool) -> bool {
        requested && self.schema.timestamps && self.mapper.settings.timestamps_by_default
    }

    fn filter(&self, query: &Value) -> Result<Map> {
        sanitize_query(self.schema, query, SanitizeOptions::STRICT)
    }

    // ── Reads ────────────────────────────────────────────────────────

    pub fn find_many(&self, query: &Value, options: FindOptions) -> Result<Vec<Map>> {
        let mut stages = vec![Stage::Match(self.filter(query)?)];
        if let Some(sort) = options.sort {
            stages.push(Stage::Sort(sort));
        }
        if let Some(skip) = options.skip {
            stages.push(Stage::Skip(skip));
        }
        if let Some(limit) = options.limit {
            stages.push(Stage::Limit(limit));
        }
        self.store().aggregate(self.collection(), &stages)
    }

    pub fn find_one(&self, query: &Value) -> Result<Option<Map>> {
        let options = FindOptions {
            limit: Some(1),
            ..Default::default()
        };
        Ok(self.find_many(query, options)?.into_iter().next())
    }

    pub fn find_by_id(&self, id: &DocumentId) -> Result<Option<Map>> {
        self.find_one(&Value::from(id))
    }

    pub fn count(&self, query: &Value) -> Result<u64> {
        Ok(self.find_many(query, FindOptions::default())?.len() as u64)
    }

    // ── Pipelines ────────────────────────────────────────────────────

    /// Build the stages for a spec object, or for a plain query used as
    /// the filter.
    pub fn pipeline(&self, query_or_specs: &Value, options: &PipelineOptions) -> Result<Vec<Stage>> {
        let specs = if PipelineSpecs::looks_like_specs(query_or_specs) {
            PipelineSpecs::from_value(query_or_specs)?
        } else {
            PipelineSpecs::default().with_filter(query_or_specs.clone())
        };
        build_pipeline(&self.mapper.registry, self.schema, &specs, options)
    }

    pub fn aggregate(&self, query_or_specs: &Value, options: &PipelineOptions) -> Result<Vec<Map>> {
        let stages = self.pipeline(query_or_specs, options)?;
        self.store().aggregate(self.collection(), &stages)
    }

    pub fn project(&self, options: &ProjectOptions) -> Result<Stage> {
        project_stage(&self.mapper.registry, self.schema, options)
    }
}

fn acknowledged(acknowledged: bool, operation: &str) -> Result<()> {
    if acknowledged {
        Ok(())
    } else {
        Err(DocmapError::StoreFailure(format!(
            "{operation} was not acknowledged by the store"
        )))
    }
}

#[cfg(test)]
mod tests;
