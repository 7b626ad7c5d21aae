//! Canonicalisation of caller input against a schema.
//!
//! Queries, documents and update descriptors arrive in several shapes. They
//! leave this module as a canonical JSON object. Strict mode drops every
//! key the schema does not know; that is a filter, never an error.

use crate::document::{is_reserved_key, root_segment, DocumentId, ID_KEY};
use crate::error::{DocmapError, Result};
use crate::schema::{FieldMap, FieldType, Schema};
use crate::validation::type_name;
use crate::Map;
use serde_json::Value;

/// Logical operators whose operands are themselves filters.
pub const LOGICAL_OPERATORS: [&str; 3] = ["$and", "$or", "$nor"];

/// Update operators whose argument is a field/value object.
pub const UPDATE_OPERATORS: [&str; 9] = [
    "$set",
    "$setOnInsert",
    "$unset",
    "$inc",
    "$push",
    "$addToSet",
    "$pull",
    "$min",
    "$max",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SanitizeOptions {
    pub strict: bool,
}

impl SanitizeOptions {
    pub const STRICT: SanitizeOptions = SanitizeOptions { strict: true };
    pub const LENIENT: SanitizeOptions = SanitizeOptions { strict: false };
}

impl Default for SanitizeOptions {
    fn default() -> Self {
        Self::STRICT
    }
}

/// Canonicalise a query into a filter.
///
/// `null` matches everything, an identifier (or its string form) becomes
/// `{"_id": id}`, an object is kept (minus unknown keys in strict mode).
pub fn sanitize_query(schema: &Schema, input: &Value, options: SanitizeOptions) -> Result<Map> {
    match input {
        Value::Null => Ok(Map::new()),
        Value::String(s) => {
            let id = DocumentId::parse(s).ok_or_else(|| {
                DocmapError::InvalidQuery(format!("'{s}' is neither a filter nor a document id"))
            })?;
            let mut filter = Map::new();
            filter.insert(ID_KEY.to_string(), Value::from(id));
            Ok(filter)
        }
        Value::Object(obj) if options.strict => strict_filter(schema, obj),
        Value::Object(obj) => Ok(obj.clone()),
        other => Err(DocmapError::InvalidQuery(format!(
            "expected a filter object or document id, got {}",
            type_name(other)
        ))),
    }
}

fn strict_filter(schema: &Schema, obj: &Map) -> Result<Map> {
    let mut filter = Map::new();
    for (key, value) in obj {
        if LOGICAL_OPERATORS.contains(&key.as_str()) {
            let operands = value.as_array().ok_or_else(|| {
                DocmapError::InvalidQuery(format!("'{key}' expects an array of filters"))
            })?;
            let mut sanitized = Vec::with_capacity(operands.len());
            for operand in operands {
                let operand = operand.as_object().ok_or_else(|| {
                    DocmapError::InvalidQuery(format!("'{key}' operands must be filter objects"))
                })?;
                sanitized.push(Value::Object(strict_filter(schema, operand)?));
            }
            filter.insert(key.clone(), Value::Array(sanitized));
        } else if schema.knows_key(root_segment(key)) {
            filter.insert(key.clone(), value.clone());
        } else {
            log::debug!("dropping unknown filter key '{key}' for '{}'", schema.name);
        }
    }
    Ok(filter)
}

/// Canonicalise a (partial) document. Strict mode strips unknown keys,
/// including inside nested sub-documents.
pub fn sanitize_document(schema: &Schema, input: &Value, options: SanitizeOptions) -> Result<Map> {
    let obj = input.as_object().ok_or_else(|| {
        DocmapError::Validation(format!(
            "expected a document object for '{}', got {}",
            schema.name,
            type_name(input)
        ))
    })?;
    if !options.strict {
        return Ok(obj.clone());
    }
    Ok(strip_unknown(&schema.fields, obj, true, false))
}

fn strip_unknown(fields: &FieldMap, obj: &Map, top_level: bool, allow_paths: bool) -> Map {
    let mut out = Map::new();
    for (key, value) in obj {
        if top_level && is_reserved_key(key) {
            out.insert(key.clone(), value.clone());
            continue;
        }
        if let Some(spec) = fields.get(key) {
            out.insert(key.clone(), strip_value(&spec.field_type, value));
        } else if allow_paths && key.contains('.') && fields.contains(root_segment(key)) {
            out.insert(key.clone(), value.clone());
        } else {
            log::debug!("dropping unknown document key '{key}'");
        }
    }
    out
}

fn strip_value(field_type: &FieldType, value: &Value) -> Value {
    match (field_type, value) {
        (FieldType::Nested(fields), Value::Object(obj)) => {
            Value::Object(strip_unknown(fields, obj, false, false))
        }
        (FieldType::Array(item), Value::Array(items)) => {
            Value::Array(items.iter().map(|v| strip_value(item, v)).collect())
        }
        _ => value.clone(),
    }
}

/// Canonicalise an update descriptor into operator form.
///
/// A plain partial document becomes `{"$set": ..}`. Each recognised
/// operator's argument is sanitized like a document, with dotted paths
/// allowed when their root is a declared field.
pub fn sanitize_update(schema: &Schema, update: &Value) -> Result<Map> {
    let obj = update.as_object().ok_or_else(|| {
        DocmapError::InvalidUpdate(format!("expected an update object, got {}", type_name(update)))
    })?;

    let operator_keys = obj.keys().filter(|k| k.starts_with('$')).count();
    if operator_keys == 0 {
        let mut descriptor = Map::new();
        descriptor.insert(
            "$set".to_string(),
            Value::Object(strip_unknown(&schema.fields, obj, true, true)),
        );
        return Ok(descriptor);
    }
    if operator_keys != obj.len() {
        return Err(DocmapError::InvalidUpdate(
            "update mixes operators with plain fields".into(),
        ));
    }

    let mut descriptor = Map::new();
    for (operator, argument) in obj {
        if !UPDATE_OPERATORS.contains(&operator.as_str()) {
            return Err(DocmapError::InvalidUpdate(format!(
                "unsupported update operator '{operator}'"
            )));
        }
        let argument = argument.as_object().ok_or_else(|| {
            DocmapError::InvalidUpdate(format!("'{operator}' expects an object"))
        })?;
        descriptor.insert(
            operator.clone(),
            Value::Object(strip_unknown(&schema.fields, argument, true, true)),
        );
    }
    Ok(descriptor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldSpec, FieldType};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn schema() -> Schema {
        let address: FieldMap = vec![("city", FieldSpec::new(FieldType::String))]
            .into_iter()
            .collect();
        Schema::builder("users")
            .field("name", FieldSpec::new(FieldType::String))
            .field("address", FieldSpec::new(FieldType::Nested(address)))
            .field("tags", FieldSpec::new(FieldType::array_of(FieldType::String)))
            .build()
            .unwrap()
    }

    #[test]
    fn test_id_and_string_form_agree() {
        let schema = schema();
        let id = DocumentId::new();
        let from_id = sanitize_query(&schema, &Value::from(id), SanitizeOptions::STRICT).unwrap();
        let from_str =
            sanitize_query(&schema, &json!(id.to_string().to_uppercase()), SanitizeOptions::STRICT)
                .unwrap();
        assert_eq!(from_id, from_str);
        assert_eq!(Value::Object(from_id), json!({ "_id": id.to_string() }));
    }

    #[test]
    fn test_non_id_string_rejected() {
        let result = sanitize_query(&schema(), &json!("alice"), SanitizeOptions::STRICT);
        assert!(matches!(result, Err(DocmapError::InvalidQuery(_))));
        let result = sanitize_query(&schema(), &json!(42), SanitizeOptions::STRICT);
        assert!(matches!(result, Err(DocmapError::InvalidQuery(_))));
    }

    #[test]
    fn test_null_query_matches_all() {
        assert!(sanitize_query(&schema(), &Value::Null, SanitizeOptions::STRICT)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_strict_query_drops_unknown_keys() {
        let query = json!({ "name": "x", "unknownField": "y", "created_at": { "$gt": "2020" } });
        let filter = sanitize_query(&schema(), &query, SanitizeOptions::STRICT).unwrap();
        assert_eq!(
            Value::Object(filter),
            json!({ "name": "x", "created_at": { "$gt": "2020" } })
        );
    }

    #[test]
    fn test_strict_query_recurses_into_logical_operators() {
        let query = json!({ "$or": [ { "name": "a", "bogus": 1 }, { "address.city": "Oslo" } ] });
        let filter = sanitize_query(&schema(), &query, SanitizeOptions::STRICT).unwrap();
        assert_eq!(
            Value::Object(filter),
            json!({ "$or": [ { "name": "a" }, { "address.city": "Oslo" } ] })
        );
    }

    #[test]
    fn test_lenient_query_preserves_all_keys() {
        let query = json!({ "name": "x", "author.name": "y", "anything": true });
        let filter = sanitize_query(&schema(), &query, SanitizeOptions::LENIENT).unwrap();
        assert_eq!(Value::Object(filter), query);
    }

    #[test]
    fn test_document_strips_nested_unknowns_and_is_idempotent() {
        let schema = schema();
        let input = json!({
            "_id": DocumentId::new().to_string(),
            "name": "Alice",
            "address": { "city": "Oslo", "zip": "0150" },
            "extra": 1
        });
        let once = sanitize_document(&schema, &input, SanitizeOptions::STRICT).unwrap();
        assert!(once.get("extra").is_none());
        assert_eq!(once["address"], json!({ "city": "Oslo" }));

        let twice = sanitize_document(&schema, &Value::Object(once.clone()), SanitizeOptions::STRICT).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_document_must_be_object() {
        let result = sanitize_document(&schema(), &json!([1, 2]), SanitizeOptions::STRICT);
        assert!(matches!(result, Err(DocmapError::Validation(_))));
    }

    #[test]
    fn test_plain_update_becomes_set() {
        let update = sanitize_update(&schema(), &json!({ "name": "Bob", "junk": 1 })).unwrap();
        assert_eq!(Value::Object(update), json!({ "$set": { "name": "Bob" } }));
    }

    #[test]
    fn test_operator_update_sanitized_per_operator() {
        let update = sanitize_update(
            &schema(),
            &json!({
                "$set": { "address.city": "Bergen", "nope.path": 1 },
                "$addToSet": { "tags": "new", "other": "x" }
            }),
        )
        .unwrap();
        assert_eq!(
            Value::Object(update),
            json!({ "$set": { "address.city": "Bergen" }, "$addToSet": { "tags": "new" } })
        );
    }

    #[test]
    fn test_malformed_updates_rejected() {
        let schema = schema();
        assert!(sanitize_update(&schema, &json!({ "$set": { "name": "x" }, "name": "y" })).is_err());
        assert!(sanitize_update(&schema, &json!({ "$rename": { "name": "n" } })).is_err());
        assert!(sanitize_update(&schema, &json!({ "$set": 5 })).is_err());
        assert!(sanitize_update(&schema, &json!("x")).is_err());
    }
}
