mod parser;
mod registry;
mod types;

pub use parser::{parse_schema, parse_schema_str, SchemaDefinition};
pub use registry::SchemaRegistry;
pub use types::{
    DefaultFn, DefaultValue, FieldMap, FieldSpec, FieldType, FormatFn, IndexDescriptor,
    Permissions, PredicateFn, RandomFn, Schema, SchemaBuilder, Validation,
};
