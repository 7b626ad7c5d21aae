use super::types::Schema;
use crate::error::{DocmapError, Result};
use std::collections::HashMap;

/// Holds every registered schema. References between schemas are names,
/// resolved on first use, so registration order does not matter.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: HashMap<String, Schema>,
    collections: HashMap<String, String>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a schema. Entity and collection names must be unique.
    pub fn register(&mut self, schema: Schema) -> Result<()> {
        schema.check()?;

        if self.schemas.contains_key(&schema.name) {
            return Err(DocmapError::Configuration(format!(
                "entity '{}' is already registered",
                schema.name
            )));
        }
        if let Some(owner) = self.collections.get(&schema.collection) {
            return Err(DocmapError::Configuration(format!(
                "collection '{}' is already backing entity '{owner}'",
                schema.collection
            )));
        }

        self.collections
            .insert(schema.collection.clone(), schema.name.clone());
        self.schemas.insert(schema.name.clone(), schema);
        Ok(())
    }

    /// Chainable form of [`register`](Self::register).
    pub fn with(mut self, schema: Schema) -> Result<Self> {
        self.register(schema)?;
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Result<&Schema> {
        self.schemas
            .get(name)
            .ok_or_else(|| DocmapError::Configuration(format!("no schema registered for entity '{name}'")))
    }

    pub fn by_collection(&self, collection: &str) -> Result<&Schema> {
        self.collections
            .get(collection)
            .and_then(|name| self.schemas.get(name))
            .ok_or_else(|| {
                DocmapError::Configuration(format!("no schema registered for collection '{collection}'"))
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.schemas.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }

    /// All schemas, sorted by entity name.
    pub fn iter(&self) -> impl Iterator<Item = &Schema> {
        let mut schemas: Vec<&Schema> = self.schemas.values().collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas.into_iter()
    }

    /// Resolve the schema referenced by `field` of `schema`.
    pub fn resolve_reference(&self, schema: &Schema, field: &str) -> Result<&Schema> {
        let spec = schema.field(field).ok_or_else(|| {
            DocmapError::Configuration(format!(
                "field '{field}' is not declared on '{}'",
                schema.name
            ))
        })?;
        let target = spec.reference.as_deref().ok_or_else(|| {
            DocmapError::Configuration(format!(
                "field '{}.{field}' has no reference configured",
                schema.name
            ))
        })?;
        self.get(target).map_err(|_| {
            DocmapError::Configuration(format!(
                "field '{}.{field}' references unknown entity '{target}'",
                schema.name
            ))
        })
    }

    /// Eagerly check every reference and cascade target.
    pub fn check_references(&self) -> Result<()> {
        for schema in self.iter() {
            for (field, spec) in schema.fields.iter() {
                if spec.reference.is_some() {
                    self.resolve_reference(schema, field)?;
                }
            }
            for dependent in &schema.cascade {
                let target = self.get(dependent).map_err(|_| {
                    DocmapError::Configuration(format!(
                        "entity '{}' cascades to unknown entity '{dependent}'",
                        schema.name
                    ))
                })?;
                if target.references_to(&schema.name).next().is_none() {
                    log::warn!(
                        "entity '{}' cascades to '{dependent}', which has no field referencing it",
                        schema.name
                    );
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldSpec, FieldType};

    fn users() -> Schema {
        Schema::builder("users")
            .field("name", FieldSpec::new(FieldType::String))
            .cascade("posts")
            .build()
            .unwrap()
    }

    fn posts() -> Schema {
        Schema::builder("posts")
            .collection("blog_posts")
            .field("author", FieldSpec::reference_to("users"))
            .field("title", FieldSpec::new(FieldType::String))
            .build()
            .unwrap()
    }

    #[test]
    fn test_lookup_by_name_and_collection() {
        let registry = SchemaRegistry::new().with(users()).unwrap().with(posts()).unwrap();
        assert_eq!(registry.by_collection("blog_posts").unwrap().name, "posts");
        assert_eq!(registry.get("users").unwrap().collection, "users");
        assert!(registry.get("comments").is_err());
    }

    #[test]
    fn test_forward_references_resolve_lazily() {
        // posts is registered before the entity it references
        let registry = SchemaRegistry::new().with(posts()).unwrap().with(users()).unwrap();
        let posts = registry.get("posts").unwrap();
        assert_eq!(registry.resolve_reference(posts, "author").unwrap().name, "users");
        registry.check_references().unwrap();
    }

    #[test]
    fn test_resolve_reference_errors() {
        let registry = SchemaRegistry::new().with(posts()).unwrap();
        let posts = registry.get("posts").unwrap();
        assert!(matches!(
            registry.resolve_reference(posts, "author"),
            Err(DocmapError::Configuration(msg)) if msg.contains("unknown entity")
        ));
        assert!(matches!(
            registry.resolve_reference(posts, "title"),
            Err(DocmapError::Configuration(msg)) if msg.contains("no reference")
        ));
        assert!(registry.check_references().is_err());
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = SchemaRegistry::new();
        registry.register(users()).unwrap();
        assert!(registry.register(users()).is_err());

        let clash = Schema::builder("authors").collection("users").build().unwrap();
        assert!(registry.register(clash).is_err());
    }
}
