use crate::document::is_reserved_key;
use crate::error::{DocmapError, Result};
use crate::pipeline::SPEC_KEYS;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Declared type of a field. Closed set, checked once when the schema is built.
#[derive(Debug, Clone)]
pub enum FieldType {
    String,
    Number,
    Integer,
    Boolean,
    /// RFC 3339 datetime or `YYYY-MM-DD` string
    Date,
    /// String form of a [`crate::DocumentId`]
    Id,
    /// Free-form mapping
    Object,
    Any,
    Array(Box<FieldType>),
    /// Embedded sub-document with its own fields
    Nested(FieldMap),
}

impl FieldType {
    pub fn array_of(item: FieldType) -> Self {
        FieldType::Array(Box::new(item))
    }

    pub fn name(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Number => "number",
            FieldType::Integer => "integer",
            FieldType::Boolean => "boolean",
            FieldType::Date => "date",
            FieldType::Id => "id",
            FieldType::Object => "object",
            FieldType::Any => "any",
            FieldType::Array(_) => "array",
            FieldType::Nested(_) => "nested",
        }
    }

    pub fn is_array(&self) -> bool {
        matches!(self, FieldType::Array(_))
    }
}

/// Ordered mapping of field name to spec.
#[derive(Debug, Clone, Default)]
pub struct FieldMap {
    entries: Vec<(String, FieldSpec)>,
}

impl FieldMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a field, keeping the original position on replace.
    pub fn insert(&mut self, name: impl Into<String>, spec: FieldSpec) {
        let name = name.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = spec,
            None => self.entries.push((name, spec)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&FieldSpec> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, s)| s)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut FieldSpec> {
        self.entries
            .iter_mut()
            .find(|(n, _)| n == name)
            .map(|(_, s)| s)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldSpec)> {
        self.entries.iter().map(|(n, s)| (n.as_str(), s))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolve a dotted path through nested sub-documents.
    pub fn resolve_path(&self, path: &str) -> Option<&FieldSpec> {
        match path.split_once('.') {
            None => self.get(path),
            Some((head, rest)) => match &self.get(head)?.field_type {
                FieldType::Nested(inner) => inner.resolve_path(rest),
                _ => None,
            },
        }
    }
}

impl<S: Into<String>> FromIterator<(S, FieldSpec)> for FieldMap {
    fn from_iter<I: IntoIterator<Item = (S, FieldSpec)>>(iter: I) -> Self {
        let mut map = FieldMap::new();
        for (name, spec) in iter {
            map.insert(name, spec);
        }
        map
    }
}

macro_rules! fn_value {
    ($(#[$meta:meta])* $name:ident, $($sig:tt)+) => {
        $(#[$meta])*
        #[derive(Clone)]
        pub struct $name(Arc<dyn $($sig)+ + Send + Sync>);

        impl $name {
            pub fn new(f: impl $($sig)+ + Send + Sync + 'static) -> Self {
                $name(Arc::new(f))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(concat!(stringify!($name), "(..)"))
            }
        }
    };
}

fn_value!(
    /// Produces a default value for a missing field.
    DefaultFn, Fn() -> Value
);
fn_value!(
    /// Transforms a value before it is persisted.
    FormatFn, Fn(Value) -> Value
);
fn_value!(
    /// Caller-supplied acceptance check.
    PredicateFn, Fn(&Value) -> bool
);
fn_value!(
    /// Produces a synthetic value for test-data generation.
    RandomFn, Fn() -> Value
);

impl DefaultFn {
    pub fn call(&self) -> Value {
        (self.0)()
    }
}

impl FormatFn {
    pub fn call(&self, value: Value) -> Value {
        (self.0)(value)
    }
}

impl PredicateFn {
    pub fn call(&self, value: &Value) -> bool {
        (self.0)(value)
    }
}

impl RandomFn {
    pub fn call(&self) -> Value {
        (self.0)()
    }
}

#[derive(Debug, Clone)]
pub enum DefaultValue {
    Static(Value),
    Generate(DefaultFn),
}

impl DefaultValue {
    pub fn produce(&self) -> Value {
        match self {
            DefaultValue::Static(value) => value.clone(),
            DefaultValue::Generate(f) => f.call(),
        }
    }
}

/// How a present value is checked beyond its declared type.
#[derive(Debug, Clone)]
pub enum Validation {
    Pattern(Regex),
    /// Inclusive upper bound
    Max(f64),
    /// Inclusive lower and upper bound
    Range(f64, f64),
    OneOf(Vec<Value>),
    Predicate(PredicateFn),
}

/// Declarative description of one field.
#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub field_type: FieldType,
    /// Name of the referenced entity (foreign key)
    pub reference: Option<String>,
    pub required: bool,
    /// Stored only in one-way hashed form
    pub encrypted: bool,
    pub default: Option<DefaultValue>,
    pub format: Option<FormatFn>,
    pub validation: Option<Validation>,
    pub random: Option<RandomFn>,
}

impl FieldSpec {
    pub fn new(field_type: FieldType) -> Self {
        FieldSpec {
            field_type,
            reference: None,
            required: false,
            encrypted: false,
            default: None,
            format: None,
            validation: None,
            random: None,
        }
    }

    /// An `Id` field referencing another entity.
    pub fn reference_to(entity: impl Into<String>) -> Self {
        Self::new(FieldType::Id).reference(entity)
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn encrypted(mut self) -> Self {
        self.encrypted = true;
        self
    }

    pub fn reference(mut self, entity: impl Into<String>) -> Self {
        self.reference = Some(entity.into());
        self
    }

    pub fn default_value(mut self, value: Value) -> Self {
        self.default = Some(DefaultValue::Static(value));
        self
    }

    pub fn default_with(mut self, f: impl Fn() -> Value + Send + Sync + 'static) -> Self {
        self.default = Some(DefaultValue::Generate(DefaultFn::new(f)));
        self
    }

    pub fn format_with(mut self, f: impl Fn(Value) -> Value + Send + Sync + 'static) -> Self {
        self.format = Some(FormatFn::new(f));
        self
    }

    pub fn pattern(mut self, pattern: &str) -> Result<Self> {
        let regex = Regex::new(pattern).map_err(|e| {
            DocmapError::Configuration(format!("invalid pattern '{pattern}': {e}"))
        })?;
        self.validation = Some(Validation::Pattern(regex));
        Ok(self)
    }

    pub fn max(mut self, bound: f64) -> Self {
        self.validation = Some(Validation::Max(bound));
        self
    }

    pub fn range(mut self, min: f64, max: f64) -> Self {
        self.validation = Some(Validation::Range(min, max));
        self
    }

    pub fn one_of(mut self, values: Vec<Value>) -> Self {
        self.validation = Some(Validation::OneOf(values));
        self
    }

    pub fn predicate(mut self, f: impl Fn(&Value) -> bool + Send + Sync + 'static) -> Self {
        self.validation = Some(Validation::Predicate(PredicateFn::new(f)));
        self
    }

    pub fn random_with(mut self, f: impl Fn() -> Value + Send + Sync + 'static) -> Self {
        self.random = Some(RandomFn::new(f));
        self
    }
}

/// Which write operations a schema permits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Permissions {
    pub insert: bool,
    pub insert_many: bool,
    pub update: bool,
    pub update_many: bool,
    pub delete: bool,
    pub delete_many: bool,
    pub upsert: bool,
}

impl Default for Permissions {
    fn default() -> Self {
        Permissions {
            insert: true,
            insert_many: true,
            update: true,
            update_many: false,
            delete: true,
            delete_many: false,
            upsert: false,
        }
    }
}

impl Permissions {
    /// Every operation allowed, upserts included.
    pub fn all() -> Self {
        Permissions {
            insert: true,
            insert_many: true,
            update: true,
            update_many: true,
            delete: true,
            delete_many: true,
            upsert: true,
        }
    }

    pub fn read_only() -> Self {
        Permissions {
            insert: false,
            insert_many: false,
            update: false,
            update_many: false,
            delete: false,
            delete_many: false,
            upsert: false,
        }
    }
}

/// An index over one or more fields. Orders are `1` or `-1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDescriptor {
    pub name: String,
    pub keys: Vec<(String, i32)>,
    #[serde(default)]
    pub unique: bool,
}

impl IndexDescriptor {
    /// Build an index named after its keys, e.g. `email_1`.
    pub fn new<S: AsRef<str>>(keys: &[(S, i32)]) -> Self {
        let keys: Vec<(String, i32)> = keys
            .iter()
            .map(|(field, order)| (field.as_ref().to_string(), *order))
            .collect();
        let name = keys
            .iter()
            .map(|(field, order)| format!("{field}_{order}"))
            .collect::<Vec<_>>()
            .join("_");
        IndexDescriptor {
            name,
            keys,
            unique: false,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.keys.iter().map(|(field, _)| field.as_str())
    }
}

/// Schema of one entity type. Immutable once registered.
#[derive(Debug, Clone)]
pub struct Schema {
    pub name: String,
    pub collection: String,
    pub fields: FieldMap,
    pub indexes: Vec<IndexDescriptor>,
    pub timestamps: bool,
    pub permissions: Permissions,
    /// Entities whose documents are deleted along with a referenced document
    pub cascade: Vec<String>,
}

impl Schema {
    pub fn builder(name: impl Into<String>) -> SchemaBuilder {
        let name = name.into();
        SchemaBuilder {
            schema: Schema {
                collection: name.clone(),
                name,
                fields: FieldMap::new(),
                indexes: Vec::new(),
                timestamps: true,
                permissions: Permissions::default(),
                cascade: Vec::new(),
            },
        }
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.get(name)
    }

    pub fn field_mut(&mut self, name: &str) -> Result<&mut FieldSpec> {
        let entity = self.name.clone();
        self.fields.get_mut(name).ok_or_else(|| {
            DocmapError::Configuration(format!("field '{name}' is not declared on '{entity}'"))
        })
    }

    /// Whether a top-level key is accepted by this schema.
    pub fn knows_key(&self, key: &str) -> bool {
        is_reserved_key(key) || self.fields.contains(key)
    }

    pub fn unique_indexes(&self) -> impl Iterator<Item = &IndexDescriptor> {
        self.indexes.iter().filter(|index| index.unique)
    }

    /// Fields of this schema that reference `entity`.
    pub fn references_to<'a>(&'a self, entity: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.fields
            .iter()
            .filter(move |(_, spec)| spec.reference.as_deref() == Some(entity))
            .map(|(name, _)| name)
    }

    /// Check the structural invariants of the schema.
    pub fn check(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(DocmapError::Configuration("entity name must not be empty".into()));
        }
        if self.collection.is_empty() {
            return Err(DocmapError::Configuration(format!(
                "entity '{}' has an empty collection name",
                self.name
            )));
        }

        for (name, spec) in self.fields.iter() {
            if is_reserved_key(name) {
                return Err(DocmapError::Configuration(format!(
                    "field '{}.{name}' uses a reserved key",
                    self.name
                )));
            }
            // A query on such a field would read as pipeline specs
            if SPEC_KEYS.contains(&name) {
                return Err(DocmapError::Configuration(format!(
                    "field '{}.{name}' clashes with a pipeline spec key",
                    self.name
                )));
            }
            check_field(&self.name, name, spec)?;
        }

        for index in &self.indexes {
            if index.keys.is_empty() {
                return Err(DocmapError::Configuration(format!(
                    "index '{}' on '{}' has no keys",
                    index.name, self.name
                )));
            }
            for (field, order) in &index.keys {
                let root = crate::document::root_segment(field);
                if !self.knows_key(root) {
                    return Err(DocmapError::Configuration(format!(
                        "index '{}' on '{}' names undeclared field '{field}'",
                        index.name, self.name
                    )));
                }
                if *order != 1 && *order != -1 {
                    return Err(DocmapError::Configuration(format!(
                        "index '{}' on '{}' has order {order} for '{field}' (expected 1 or -1)",
                        index.name, self.name
                    )));
                }
            }
        }

        Ok(())
    }
}

fn check_field(entity: &str, path: &str, spec: &FieldSpec) -> Result<()> {
    if path.is_empty() || path.contains('.') || path.starts_with('$') {
        return Err(DocmapError::Configuration(format!(
            "invalid field name '{path}' on '{entity}'"
        )));
    }
    if let Some(reference) = &spec.reference {
        if reference.is_empty() {
            return Err(DocmapError::Configuration(format!(
                "field '{entity}.{path}' has an empty reference"
            )));
        }
    }
    if let Some(Validation::Range(min, max)) = &spec.validation {
        if min > max {
            return Err(DocmapError::Configuration(format!(
                "field '{entity}.{path}' has range [{min}, {max}] with min above max"
            )));
        }
    }
    check_type(entity, path, &spec.field_type)
}

fn check_type(entity: &str, path: &str, field_type: &FieldType) -> Result<()> {
    match field_type {
        FieldType::Array(item) => match item.as_ref() {
            FieldType::Array(_) => Err(DocmapError::Configuration(format!(
                "field '{entity}.{path}' is an array of arrays"
            ))),
            other => check_type(entity, path, other),
        },
        FieldType::Nested(fields) => {
            for (name, spec) in fields.iter() {
                check_field(entity, name, spec)
                    .map_err(|e| prefix_error(e, path))?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn prefix_error(error: DocmapError, path: &str) -> DocmapError {
    match error {
        DocmapError::Configuration(msg) => {
            DocmapError::Configuration(format!("{msg} (inside '{path}')"))
        }
        other => other,
    }
}

/// Builder for [`Schema`]; `build` checks the invariants.
#[derive(Debug, Clone)]
pub struct SchemaBuilder {
    schema: Schema,
}

impl SchemaBuilder {
    pub fn collection(mut self, collection: impl Into<String>) -> Self {
        self.schema.collection = collection.into();
        self
    }

    pub fn field(mut self, name: impl Into<String>, spec: FieldSpec) -> Self {
        self.schema.fields.insert(name, spec);
        self
    }

    pub fn index(mut self, index: IndexDescriptor) -> Self {
        self.schema.indexes.push(index);
        self
    }

    /// Shorthand for a single-field unique index.
    pub fn unique(self, field: &str) -> Self {
        self.index(IndexDescriptor::new(&[(field, 1)]).unique())
    }

    pub fn timestamps(mut self, enabled: bool) -> Self {
        self.schema.timestamps = enabled;
        self
    }

    pub fn permissions(mut self, permissions: Permissions) -> Self {
        self.schema.permissions = permissions;
        self
    }

    pub fn cascade(mut self, entity: impl Into<String>) -> Self {
        self.schema.cascade.push(entity.into());
        self
    }

    pub fn build(self) -> Result<Schema> {
        self.schema.check()?;
        Ok(self.schema)
    }
}
