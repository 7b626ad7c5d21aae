use crate::document::{is_reserved_key, DocumentId};
use crate::error::{DocmapError, Result};
use crate::schema::{FieldMap, FieldSpec, FieldType, Schema, Validation};
use crate::Map;
use chrono::{DateTime, NaiveDate};
use serde_json::Value;

/// Decide whether `value` is acceptable for `spec`.
///
/// The declared type is always checked first (recursively for nested
/// sub-documents, element-wise for arrays). If the field carries a validation
/// strategy it is applied afterwards. Null is accepted for optional fields.
pub fn validate(value: &Value, spec: &FieldSpec) -> bool {
    if value.is_null() {
        return !spec.required;
    }
    conforms(value, &spec.field_type) && satisfies(value, spec.validation.as_ref())
}

/// Type-conformance check alone.
pub fn conforms(value: &Value, field_type: &FieldType) -> bool {
    match field_type {
        FieldType::String => value.is_string(),
        FieldType::Number => value.is_number(),
        FieldType::Integer => value.is_i64() || value.is_u64(),
        FieldType::Boolean => value.is_boolean(),
        FieldType::Date => value.as_str().map(is_date).unwrap_or(false),
        FieldType::Id => DocumentId::from_value(value).is_some(),
        FieldType::Object => value.is_object(),
        FieldType::Any => true,
        FieldType::Array(item) => value
            .as_array()
            .map(|items| items.iter().all(|v| conforms(v, item)))
            .unwrap_or(false),
        FieldType::Nested(fields) => value
            .as_object()
            .map(|obj| nested_conforms(obj, fields))
            .unwrap_or(false),
    }
}

fn nested_conforms(obj: &Map, fields: &FieldMap) -> bool {
    fields
        .iter()
        .all(|(name, spec)| validate(obj.get(name).unwrap_or(&Value::Null), spec))
}

fn is_date(s: &str) -> bool {
    DateTime::parse_from_rfc3339(s).is_ok() || NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok()
}

fn satisfies(value: &Value, strategy: Option<&Validation>) -> bool {
    match strategy {
        None => true,
        Some(Validation::Pattern(regex)) => value.as_str().map(|s| regex.is_match(s)).unwrap_or(false),
        Some(Validation::Max(max)) => measure(value).map(|m| m <= *max).unwrap_or(false),
        Some(Validation::Range(min, max)) => measure(value)
            .map(|m| m >= *min && m <= *max)
            .unwrap_or(false),
        Some(Validation::OneOf(allowed)) => allowed.iter().any(|v| same_value(v, value)),
        Some(Validation::Predicate(f)) => f.call(value),
    }
}

/// The magnitude numeric bounds are compared against.
fn measure(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => Some(s.chars().count() as f64),
        Value::Array(items) => Some(items.len() as f64),
        _ => None,
    }
}

/// Equality that treats `1` and `1.0` alike.
fn same_value(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// Options for document-level validation
#[derive(Debug, Clone, Copy)]
pub struct ValidateOptions {
    /// Report required fields that are absent
    pub require_all: bool,
    /// Accept keys the schema does not declare
    pub allow_unknown: bool,
}

impl Default for ValidateOptions {
    fn default() -> Self {
        ValidateOptions {
            require_all: true,
            allow_unknown: false,
        }
    }
}

/// Outcome of validating a document
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub errors: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    /// Escalate a failed report into an error.
    pub fn into_result(self, entity: &str) -> Result<()> {
        if self.is_ok() {
            return Ok(());
        }
        Err(DocmapError::Validation(format!(
            "'{entity}' document failed validation:\n  - {}",
            self.errors.join("\n  - ")
        )))
    }
}

/// Validate every field of a document against its schema.
pub fn validate_document(schema: &Schema, doc: &Map, options: ValidateOptions) -> ValidationReport {
    let mut report = ValidationReport::default();

    for (name, spec) in schema.fields.iter() {
        match doc.get(name) {
            None | Some(Value::Null) => {
                if spec.required && options.require_all {
                    report.errors.push(format!("Required field '{name}' is missing"));
                }
            }
            Some(value) => check_value(name, value, spec, &mut report),
        }
    }

    if !options.allow_unknown {
        for key in doc.keys() {
            if !is_reserved_key(key) && !schema.fields.contains(key) {
                report.errors.push(format!("Unexpected field '{key}'"));
            }
        }
    }

    report
}

/// Validate only the listed paths, as written by an update's `$set`.
/// Paths that do not resolve to a declared field are skipped.
pub fn validate_paths(schema: &Schema, values: &Map) -> ValidationReport {
    let mut report = ValidationReport::default();
    for (path, value) in values {
        if let Some(spec) = schema.fields.resolve_path(path) {
            if value.is_null() && spec.required {
                report.errors.push(format!("Required field '{path}' cannot be unset"));
            } else {
                check_value(path, value, spec, &mut report);
            }
        }
    }
    report
}

fn check_value(path: &str, value: &Value, spec: &FieldSpec, report: &mut ValidationReport) {
    // encrypted values are checked in plaintext before hashing; only the stored form's type here
    if spec.encrypted && crate::encryption::is_hashed(value) {
        return;
    }
    if !conforms(value, &spec.field_type) {
        report.errors.push(format!(
            "Field '{path}' expected {}, got {}",
            spec.field_type.name(),
            type_name(value)
        ));
        if let (FieldType::Nested(fields), Some(obj)) = (&spec.field_type, value.as_object()) {
            for (name, sub_spec) in fields.iter() {
                let sub_value = obj.get(name).unwrap_or(&Value::Null);
                if !validate(sub_value, sub_spec) {
                    report.errors.push(format!("Field '{path}.{name}' is invalid"));
                }
            }
        }
        return;
    }
    if !satisfies(value, spec.validation.as_ref()) {
        report.errors.push(format!(
            "Field '{path}' value {value} does not satisfy {}",
            describe(spec.validation.as_ref())
        ));
    }
}

fn describe(strategy: Option<&Validation>) -> String {
    match strategy {
        None => "its type".to_string(),
        Some(Validation::Pattern(regex)) => format!("pattern /{}/", regex.as_str()),
        Some(Validation::Max(max)) => format!("maximum {max}"),
        Some(Validation::Range(min, max)) => format!("range [{min}, {max}]"),
        Some(Validation::OneOf(values)) => format!(
            "one of [{}]",
            values.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", ")
        ),
        Some(Validation::Predicate(_)) => "its predicate".to_string(),
    }
}

pub(crate) fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
