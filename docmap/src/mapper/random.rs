use super::Model;
use crate::document::DocumentId;
use crate::error::Result;
use crate::sanitize::{sanitize_document, SanitizeOptions};
use crate::schema::{FieldMap, FieldSpec, FieldType, Validation};
use crate::store::DocumentStore;
use crate::Map;
use chrono::{Duration, SecondsFormat, Utc};
use rand::seq::SliceRandom;
use rand::Rng;
use serde_json::{Number, Value};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RandomOptions {
    /// Generate optional fields too, not only required ones
    pub include_optionals: bool,
}

impl<'a, S: DocumentStore> Model<'a, S> {
    /// Synthesize a document for this entity. Fixed fields win over
    /// generated ones. Nothing is persisted.
    pub fn random_fields(&self, fixed: &Value, options: RandomOptions) -> Result<Map> {
        let fixed = match fixed {
            Value::Null => Map::new(),
            other => sanitize_document(self.schema, other, SanitizeOptions::STRICT)?,
        };
        let mut rng = rand::thread_rng();
        let mut doc = random_document(&self.schema.fields, options, &mut rng);
        for (key, value) in fixed {
            doc.insert(key, value);
        }
        Ok(doc)
    }
}

fn random_document(fields: &FieldMap, options: RandomOptions, rng: &mut impl Rng) -> Map {
    let mut doc = Map::new();
    for (name, spec) in fields.iter() {
        if !spec.required && !options.include_optionals {
            continue;
        }
        let value = if let Some(random) = &spec.random {
            random.call()
        } else if let Some(default) = &spec.default {
            default.produce()
        } else {
            random_value(spec, options, rng)
        };
        doc.insert(name.to_string(), value);
    }
    doc
}

fn random_value(spec: &FieldSpec, options: RandomOptions, rng: &mut impl Rng) -> Value {
    match &spec.validation {
        Some(Validation::OneOf(values)) => {
            if let Some(value) = values.choose(rng) {
                return value.clone();
            }
        }
        Some(Validation::Range(min, max)) => return bounded(&spec.field_type, *min, *max, rng),
        Some(Validation::Max(max)) => return bounded(&spec.field_type, 0.0_f64.min(*max), *max, rng),
        _ => {}
    }
    random_of_type(&spec.field_type, options, rng)
}

/// A value whose measure (number, string length, array length) lies in
/// `[min, max]`.
fn bounded(field_type: &FieldType, min: f64, max: f64, rng: &mut impl Rng) -> Value {
    match field_type {
        FieldType::Integer => {
            let (low, high) = (min.ceil() as i64, max.floor() as i64);
            Value::from(if low <= high { rng.gen_range(low..=high) } else { low })
        }
        FieldType::String => {
            let (low, high) = (min.max(0.0).ceil() as usize, max.max(0.0).floor() as usize);
            let len = if low <= high { rng.gen_range(low..=high) } else { low };
            Value::String(nanoid::nanoid!(len))
        }
        FieldType::Array(item) => {
            let (low, high) = (min.max(0.0).ceil() as usize, max.max(0.0).floor() as usize);
            let len = if low <= high { rng.gen_range(low..=high.min(low + 3)) } else { low };
            Value::Array(
                (0..len)
                    .map(|_| random_of_type(item, RandomOptions::default(), rng))
                    .collect(),
            )
        }
        _ => {
            let value = if min < max { rng.gen_range(min..=max) } else { min };
            number((value * 100.0).round() / 100.0)
                .filter(|n| n.as_f64().map_or(false, |n| n >= min && n <= max))
                .unwrap_or_else(|| number(min).unwrap_or(Value::Null))
        }
    }
}

fn number(value: f64) -> Option<Value> {
    Number::from_f64(value).map(Value::Number)
}

fn random_of_type(field_type: &FieldType, options: RandomOptions, rng: &mut impl Rng) -> Value {
    match field_type {
        FieldType::String | FieldType::Any => Value::String(nanoid::nanoid!(12)),
        FieldType::Number => number(rng.gen_range(0..100_000_i64) as f64 / 100.0).unwrap_or(Value::Null),
        FieldType::Integer => Value::from(rng.gen_range(0..1000_i64)),
        FieldType::Boolean => Value::Bool(rng.gen()),
        FieldType::Date => {
            let offset = Duration::seconds(rng.gen_range(0..365 * 24 * 3600_i64));
            Value::String((Utc::now() - offset).to_rfc3339_opts(SecondsFormat::Millis, true))
        }
        FieldType::Id => Value::from(DocumentId::new()),
        FieldType::Object => Value::Object(Map::new()),
        FieldType::Array(item) => {
            let len: usize = rng.gen_range(1..=3);
            Value::Array((0..len).map(|_| random_of_type(item, options, rng)).collect())
        }
        FieldType::Nested(fields) => Value::Object(random_document(fields, options, rng)),
    }
}
