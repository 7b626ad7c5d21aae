// Document identity, reserved keys and dotted-path access

use crate::Map;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

/// Key holding the document identifier.
pub const ID_KEY: &str = "_id";
/// Creation timestamp key, set once on insert.
pub const CREATED_AT_KEY: &str = "created_at";
/// Modification timestamp key, refreshed on every write.
pub const UPDATED_AT_KEY: &str = "updated_at";

/// Keys every schema accepts without declaring them.
pub const RESERVED_KEYS: [&str; 3] = [ID_KEY, CREATED_AT_KEY, UPDATED_AT_KEY];

/// Length of the string form of a [`DocumentId`].
pub const ID_LEN: usize = 26;

pub fn is_reserved_key(key: &str) -> bool {
    RESERVED_KEYS.contains(&key)
}

/// Unique document identifier. A ULID rendered in lowercase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentId(Ulid);

impl DocumentId {
    pub fn new() -> Self {
        DocumentId(Ulid::new())
    }

    /// Parse the string form of an identifier. Case-insensitive.
    pub fn parse(input: &str) -> Option<Self> {
        if input.len() != ID_LEN {
            return None;
        }
        Ulid::from_string(&input.to_ascii_uppercase())
            .ok()
            .map(DocumentId)
    }

    /// Read an identifier out of a JSON value (only strings qualify).
    pub fn from_value(value: &Value) -> Option<Self> {
        value.as_str().and_then(Self::parse)
    }

    /// Read the `_id` of a document, if it holds a valid identifier.
    pub fn of(doc: &Map) -> Option<Self> {
        doc.get(ID_KEY).and_then(Self::from_value)
    }
}

impl Default for DocumentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_string().to_lowercase())
    }
}

impl FromStr for DocumentId {
    type Err = crate::DocmapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DocumentId::parse(s)
            .ok_or_else(|| crate::DocmapError::InvalidQuery(format!("'{s}' is not a document id")))
    }
}

impl From<DocumentId> for Value {
    fn from(id: DocumentId) -> Self {
        Value::String(id.to_string())
    }
}

impl From<&DocumentId> for Value {
    fn from(id: &DocumentId) -> Self {
        Value::String(id.to_string())
    }
}

impl Serialize for DocumentId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for DocumentId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DocumentId::parse(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid document id '{raw}'")))
    }
}

/// Current time in the stored timestamp format.
pub fn timestamp_now() -> Value {
    Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// First segment of a dotted path.
pub fn root_segment(path: &str) -> &str {
    path.split('.').next().unwrap_or(path)
}

/// Resolve a dotted path. Numeric segments index into arrays.
pub fn get_path<'a>(doc: &'a Map, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = doc.get(segments.next()?)?;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Write a value at a dotted path, creating intermediate objects.
/// Non-object intermediates are replaced.
pub fn set_path(doc: &mut Map, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            doc.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let entry = doc
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            if let Value::Object(inner) = entry {
                set_path(inner, rest, value);
            }
        }
    }
}

/// Remove the value at a dotted path, returning it.
pub fn remove_path(doc: &mut Map, path: &str) -> Option<Value> {
    match path.split_once('.') {
        None => doc.remove(path),
        Some((head, rest)) => match doc.get_mut(head)? {
            Value::Object(inner) => remove_path(inner, rest),
            _ => None,
        },
    }
}

/// Whether a value is an operator expression such as `{"$gt": 1}`.
pub fn is_operator_object(value: &Value) -> bool {
    value
        .as_object()
        .map(|obj| !obj.is_empty() && obj.keys().all(|k| k.starts_with('$')))
        .unwrap_or(false)
}

/// Build the document an upsert starts from: every equality condition of
/// the filter (including those inside `$and` and `{"$eq": v}`), with dotted
/// paths expanded into nested objects.
pub fn seed_document(filter: &Map) -> Map {
    let mut seed = Map::new();
    collect_equalities(filter, &mut seed);
    seed
}

fn collect_equalities(filter: &Map, seed: &mut Map) {
    for (key, value) in filter {
        if key == "$and" {
            for sub in value.as_array().into_iter().flatten() {
                if let Value::Object(sub) = sub {
                    collect_equalities(sub, seed);
                }
            }
        } else if key.starts_with('$') {
            continue;
        } else if is_operator_object(value) {
            if let Some(eq) = value.get("$eq") {
                set_path(seed, key, eq.clone());
            }
        } else {
            set_path(seed, key, value.clone());
        }
    }
}
