//! Per-entity override points around the document lifecycle.
//!
//! Every method defaults to identity / no-op. An implementation is attached
//! to an entity with [`crate::Mapper::with_hooks`].

use crate::error::Result;
use crate::Map;
use serde_json::Value;

pub trait Hooks: Send + Sync {
    /// Receives the raw caller document before sanitization.
    fn pre_insert(&self, doc: Value) -> Result<Value> {
        Ok(doc)
    }

    /// Receives the document as persisted.
    fn post_insert(&self, _doc: &Map) -> Result<()> {
        Ok(())
    }

    /// May rewrite both the filter and the update descriptor.
    fn pre_update(&self, filter: Value, update: Value) -> Result<(Value, Value)> {
        Ok((filter, update))
    }

    /// `previous` is only provided for single updates that return the document.
    fn post_update(&self, _previous: Option<&Map>, _documents: &[Map]) -> Result<()> {
        Ok(())
    }

    /// May rewrite the filter.
    fn pre_delete(&self, filter: Value) -> Result<Value> {
        Ok(filter)
    }

    /// Receives every deleted document that was read back.
    fn post_delete(&self, _deleted: &[Map]) -> Result<()> {
        Ok(())
    }
}

/// Hooks that change nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHooks;

impl Hooks for NoHooks {}
