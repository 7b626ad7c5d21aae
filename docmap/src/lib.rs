pub mod config;
pub mod document;
pub mod encryption;
pub mod error;
pub mod hooks;
pub mod mapper;
pub mod pipeline;
pub mod sanitize;
pub mod schema;
pub mod store;
pub mod validation;

pub use config::Settings;
pub use document::DocumentId;
pub use error::{DocmapError, Result};
pub use hooks::{Hooks, NoHooks};
pub use mapper::{FindOptions, InsertOptions, Mapper, Model, RandomOptions, UpdateOptions};
pub use pipeline::{PipelineOptions, PipelineSpecs, Stage};
pub use schema::{FieldSpec, FieldType, Schema, SchemaRegistry};
pub use store::{DocumentStore, MemoryStore, SqliteStore};

/// A document, filter or update descriptor as exchanged with the store.
pub type Map = serde_json::Map<String, serde_json::Value>;
