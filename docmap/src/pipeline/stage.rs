use crate::Map;
use serde::{Deserialize, Serialize};

/// One aggregation stage, in the store's tagged form (`{"$match": ..}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Stage {
    #[serde(rename = "$match")]
    Match(Map),
    #[serde(rename = "$lookup")]
    Lookup(Lookup),
    #[serde(rename = "$unwind")]
    Unwind(Unwind),
    #[serde(rename = "$group")]
    Group(Map),
    #[serde(rename = "$sort")]
    Sort(Map),
    #[serde(rename = "$project")]
    Project(Map),
    #[serde(rename = "$skip")]
    Skip(u64),
    #[serde(rename = "$limit")]
    Limit(u64),
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Match(_) => "$match",
            Stage::Lookup(_) => "$lookup",
            Stage::Unwind(_) => "$unwind",
            Stage::Group(_) => "$group",
            Stage::Sort(_) => "$sort",
            Stage::Project(_) => "$project",
            Stage::Skip(_) => "$skip",
            Stage::Limit(_) => "$limit",
        }
    }
}

/// Left-outer join of `from` documents whose `foreign_field` equals the
/// value at `local_field`. Matches are stored as an array under `as`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lookup {
    pub from: String,
    pub local_field: String,
    pub foreign_field: String,
    #[serde(rename = "as")]
    pub as_field: String,
}

/// Flatten the array at `path` (a `$`-prefixed field path).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Unwind {
    pub path: String,
    #[serde(default)]
    pub preserve_null_and_empty_arrays: bool,
}

impl Unwind {
    /// Unwind that keeps documents without a match, leaving the field null.
    pub fn preserving(field: &str) -> Self {
        Unwind {
            path: format!("${field}"),
            preserve_null_and_empty_arrays: true,
        }
    }

    /// The field path without its `$` marker.
    pub fn field(&self) -> &str {
        self.path.strip_prefix('$').unwrap_or(&self.path)
    }
}
