use super::registry::SchemaRegistry;
use super::types::{
    FieldMap, FieldSpec, FieldType, IndexDescriptor, Permissions, Schema, Validation,
};
use crate::config::Settings;
use crate::error::{DocmapError, Result};
use regex::Regex;
use serde::de::{Deserializer, MapAccess, Visitor};
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use std::marker::PhantomData;
use std::path::Path;

/// A YAML mapping read in document order.
#[derive(Debug, Clone)]
pub struct Ordered<T>(pub Vec<(String, T)>);

impl<T> Default for Ordered<T> {
    fn default() -> Self {
        Ordered(Vec::new())
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Ordered<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct OrderedVisitor<T>(PhantomData<T>);

        impl<'de, T: Deserialize<'de>> Visitor<'de> for OrderedVisitor<T> {
            type Value = Ordered<T>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a mapping")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> std::result::Result<Self::Value, A::Error> {
                let mut entries = Vec::new();
                while let Some((key, value)) = access.next_entry::<String, T>()? {
                    entries.push((key, value));
                }
                Ok(Ordered(entries))
            }
        }

        deserializer.deserialize_map(OrderedVisitor(PhantomData))
    }
}

/// Top-level layout of schema.yaml
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchemaFile {
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub entities: Ordered<EntityDefinition>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EntityDefinition {
    #[serde(default)]
    pub collection: Option<String>,
    #[serde(default = "default_true")]
    pub timestamps: bool,
    #[serde(default)]
    pub permissions: Permissions,
    #[serde(default)]
    pub cascade: Vec<String>,
    #[serde(default)]
    pub indexes: Vec<IndexDefinition>,
    #[serde(default)]
    pub fields: Ordered<FieldDefinition>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IndexDefinition {
    #[serde(default)]
    pub name: Option<String>,
    pub keys: Ordered<i32>,
    #[serde(default)]
    pub unique: bool,
}

/// Item type for arrays: a bare type name or a full field definition
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ItemType {
    Simple(String),
    Complex(Box<FieldDefinition>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FieldDefinition {
    #[serde(rename = "type")]
    pub field_type: String,
    #[serde(default)]
    pub items: Option<ItemType>,
    #[serde(default)]
    pub fields: Option<Ordered<FieldDefinition>>,
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub encrypted: bool,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(rename = "enum", default)]
    pub enum_values: Option<Vec<Value>>,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub max: Option<f64>,
    #[serde(default)]
    pub range: Option<[f64; 2]>,
}

fn default_true() -> bool {
    true
}

/// Parsed schema file. Schemas may still be amended in code (format,
/// default, predicate and random functions) before registration.
#[derive(Debug, Clone)]
pub struct SchemaDefinition {
    pub settings: Settings,
    pub schemas: Vec<Schema>,
}

impl SchemaDefinition {
    pub fn entity_mut(&mut self, name: &str) -> Result<&mut Schema> {
        self.schemas
            .iter_mut()
            .find(|schema| schema.name == name)
            .ok_or_else(|| DocmapError::Configuration(format!("entity '{name}' is not defined")))
    }

    pub fn into_registry(self) -> Result<SchemaRegistry> {
        let mut registry = SchemaRegistry::new();
        for schema in self.schemas {
            registry.register(schema)?;
        }
        Ok(registry)
    }
}

/// Parse a schema.yaml file into a SchemaDefinition
pub fn parse_schema(path: &Path) -> Result<SchemaDefinition> {
    let content = std::fs::read_to_string(path)?;
    parse_schema_str(&content)
}

/// Parse a schema YAML string into a SchemaDefinition
pub fn parse_schema_str(content: &str) -> Result<SchemaDefinition> {
    let file: SchemaFile = serde_yaml::from_str(content)?;
    let mut schemas = Vec::with_capacity(file.entities.0.len());

    for (name, entity) in file.entities.0 {
        schemas.push(build_schema(name, entity)?);
    }

    Ok(SchemaDefinition {
        settings: file.settings,
        schemas,
    })
}

fn build_schema(name: String, entity: EntityDefinition) -> Result<Schema> {
    let mut builder = Schema::builder(name.clone())
        .timestamps(entity.timestamps)
        .permissions(entity.permissions);

    if let Some(collection) = entity.collection {
        builder = builder.collection(collection);
    }
    for (field_name, definition) in entity.fields.0 {
        let spec = build_field(&name, &field_name, definition)?;
        builder = builder.field(field_name, spec);
    }
    for index in entity.indexes {
        let mut descriptor = IndexDescriptor::new(&index.keys.0);
        if let Some(index_name) = index.name {
            descriptor = descriptor.named(index_name);
        }
        if index.unique {
            descriptor = descriptor.unique();
        }
        builder = builder.index(descriptor);
    }
    for dependent in entity.cascade {
        builder = builder.cascade(dependent);
    }

    builder.build()
}

fn build_field(entity: &str, name: &str, definition: FieldDefinition) -> Result<FieldSpec> {
    let field_type = build_type(entity, name, &definition)?;
    let mut spec = FieldSpec::new(field_type);
    spec.reference = definition.reference;
    spec.required = definition.required;
    spec.encrypted = definition.encrypted;
    if let Some(default) = definition.default {
        spec = spec.default_value(default);
    }

    let mut strategies = Vec::new();
    if let Some(values) = definition.enum_values {
        strategies.push(Validation::OneOf(values));
    }
    if let Some(pattern) = definition.pattern {
        let regex = Regex::new(&pattern).map_err(|e| {
            DocmapError::Configuration(format!("field '{entity}.{name}' has invalid pattern: {e}"))
        })?;
        strategies.push(Validation::Pattern(regex));
    }
    if let Some(max) = definition.max {
        strategies.push(Validation::Max(max));
    }
    if let Some([min, max]) = definition.range {
        strategies.push(Validation::Range(min, max));
    }
    if strategies.len() > 1 {
        return Err(DocmapError::Configuration(format!(
            "field '{entity}.{name}' declares more than one of enum, pattern, max, range"
        )));
    }
    spec.validation = strategies.pop();

    Ok(spec)
}

fn build_type(entity: &str, name: &str, definition: &FieldDefinition) -> Result<FieldType> {
    let field_type = match definition.field_type.as_str() {
        "string" => FieldType::String,
        "number" => FieldType::Number,
        "integer" => FieldType::Integer,
        "boolean" => FieldType::Boolean,
        "date" | "datetime" => FieldType::Date,
        "id" | "ref" => FieldType::Id,
        "any" => FieldType::Any,
        "object" => match &definition.fields {
            Some(fields) => {
                let mut nested = FieldMap::new();
                for (sub_name, sub_definition) in &fields.0 {
                    let path = format!("{name}.{sub_name}");
                    nested.insert(
                        sub_name.clone(),
                        build_field(entity, &path, sub_definition.clone())?,
                    );
                }
                FieldType::Nested(nested)
            }
            None => FieldType::Object,
        },
        "array" | "list" => match &definition.items {
            None => FieldType::array_of(FieldType::Any),
            Some(ItemType::Simple(item)) => {
                let item_definition = FieldDefinition {
                    field_type: item.clone(),
                    ..FieldDefinition::bare()
                };
                FieldType::array_of(build_type(entity, name, &item_definition)?)
            }
            Some(ItemType::Complex(item)) => FieldType::array_of(build_type(entity, name, item)?),
        },
        other => {
            return Err(DocmapError::Configuration(format!(
                "field '{entity}.{name}' has unknown type '{other}'"
            )))
        }
    };
    Ok(field_type)
}

impl FieldDefinition {
    fn bare() -> Self {
        FieldDefinition {
            field_type: String::new(),
            items: None,
            fields: None,
            reference: None,
            required: false,
            encrypted: false,
            default: None,
            enum_values: None,
            pattern: None,
            max: None,
            range: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SCHEMA: &str = r#"
settings:
  hash_secret: pepper
entities:
  users:
    permissions: { upsert: true, delete_many: true }
    cascade: [posts]
    indexes:
      - { name: email_unique, keys: { email: 1 }, unique: true }
    fields:
      name: { type: string, required: true }
      email: { type: string, required: true, pattern: "^[^@]+@[^@]+$" }
      secret: { type: string, encrypted: true }
      role: { type: string, enum: [admin, member], default: member }
      age: { type: integer, range: [0, 150] }
      tags: { type: array, items: string }
      address:
        type: object
        fields:
          city: { type: string, required: true }
  posts:
    collection: blog_posts
    timestamps: false
    fields:
      title: { type: string, required: true }
      author: { type: id, ref: users, required: true }
"#;

    #[test]
    fn test_parse_entities_in_order() {
        let definition = parse_schema_str(SCHEMA).unwrap();
        assert_eq!(definition.settings.hash_secret, "pepper");
        assert_eq!(definition.schemas.len(), 2);

        let users = &definition.schemas[0];
        assert_eq!(users.name, "users");
        assert_eq!(users.collection, "users");
        assert_eq!(
            users.fields.names().collect::<Vec<_>>(),
            vec!["name", "email", "secret", "role", "age", "tags", "address"]
        );
        assert!(users.permissions.upsert);
        assert!(users.permissions.delete_many);
        assert!(!users.permissions.update_many);
        assert_eq!(users.cascade, vec!["posts".to_string()]);
        assert_eq!(users.indexes[0].name, "email_unique");
        assert!(users.indexes[0].unique);

        let posts = &definition.schemas[1];
        assert_eq!(posts.collection, "blog_posts");
        assert!(!posts.timestamps);
        assert_eq!(posts.field("author").unwrap().reference.as_deref(), Some("users"));
    }

    #[test]
    fn test_parse_field_details() {
        let definition = parse_schema_str(SCHEMA).unwrap();
        let users = &definition.schemas[0];

        let role = users.field("role").unwrap();
        assert!(matches!(role.validation, Some(Validation::OneOf(_))));
        assert_eq!(role.default.as_ref().unwrap().produce(), json!("member"));

        assert!(users.field("secret").unwrap().encrypted);
        assert!(matches!(
            users.field("age").unwrap().validation,
            Some(Validation::Range(min, max)) if min == 0.0 && max == 150.0
        ));
        assert!(matches!(
            &users.field("tags").unwrap().field_type,
            FieldType::Array(item) if matches!(item.as_ref(), FieldType::String)
        ));
        assert!(users.fields.resolve_path("address.city").unwrap().required);
    }

    #[test]
    fn test_unknown_type_rejected() {
        let result = parse_schema_str(
            "entities:\n  users:\n    fields:\n      name: { type: text }\n",
        );
        assert!(matches!(result, Err(DocmapError::Configuration(_))));
    }

    #[test]
    fn test_conflicting_strategies_rejected() {
        let result = parse_schema_str(
            "entities:\n  users:\n    fields:\n      age: { type: integer, max: 3, range: [0, 2] }\n",
        );
        assert!(matches!(result, Err(DocmapError::Configuration(_))));
    }

    #[test]
    fn test_amend_before_registration() {
        let mut definition = parse_schema_str(SCHEMA).unwrap();
        definition
            .entity_mut("users")
            .unwrap()
            .field_mut("email")
            .unwrap()
            .format = Some(super::super::types::FormatFn::new(|v| {
            json!(v.as_str().unwrap_or_default().to_lowercase())
        }));

        let registry = definition.into_registry().unwrap();
        let email = registry.get("users").unwrap().field("email").unwrap();
        assert_eq!(email.format.as_ref().unwrap().call(json!("A@B.C")), json!("a@b.c"));
    }
}
