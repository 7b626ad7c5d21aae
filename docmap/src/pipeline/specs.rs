use crate::document::DocumentId;
use crate::error::{DocmapError, Result};
use crate::validation::type_name;
use crate::Map;
use serde_json::Value;

/// Keys accepted in a pipeline spec object.
pub const SPEC_KEYS: [&str; 5] = ["filter", "join", "postFilter", "group", "sort"];

/// How deep a reference field is populated.
#[derive(Debug, Clone, PartialEq)]
pub enum Join {
    /// Replace the reference with the referenced document.
    Populate,
    /// Populate, then populate fields of the referenced document.
    Nested(JoinSpec),
}

/// Reference fields to populate, in request order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JoinSpec(pub Vec<(String, Join)>);

impl JoinSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn populate(mut self, field: impl Into<String>) -> Self {
        self.0.push((field.into(), Join::Populate));
        self
    }

    pub fn nested(mut self, field: impl Into<String>, spec: JoinSpec) -> Self {
        self.0.push((field.into(), Join::Nested(spec)));
        self
    }

    pub fn get(&self, field: &str) -> Option<&Join> {
        self.0.iter().find(|(name, _)| name == field).map(|(_, join)| join)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Join)> {
        self.0.iter().map(|(name, join)| (name.as_str(), join))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Parse `{field: true | {nested..}}`.
    pub fn from_value(value: &Value) -> Result<Self> {
        let obj = value.as_object().ok_or_else(|| {
            malformed(format!("join must be an object, got {}", type_name(value)))
        })?;
        let mut spec = JoinSpec::new();
        for (field, join) in obj {
            match join {
                Value::Bool(true) => spec = spec.populate(field.clone()),
                Value::Object(_) => spec = spec.nested(field.clone(), JoinSpec::from_value(join)?),
                other => {
                    return Err(malformed(format!(
                        "join of '{field}' must be true or an object, got {}",
                        describe(other)
                    )))
                }
            }
        }
        Ok(spec)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GroupSpec {
    /// Group by the value of one field.
    ByField(String),
    /// A full `$group` descriptor.
    Descriptor(Map),
}

/// Declarative input to the pipeline factory. Every part is optional.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineSpecs {
    pub filter: Option<Value>,
    pub join: Option<JoinSpec>,
    pub post_filter: Option<Value>,
    pub group: Option<GroupSpec>,
    pub sort: Option<Map>,
}

impl PipelineSpecs {
    /// Whether `value` is an object made only of spec keys. Schemas reject
    /// top-level fields named like spec keys, so a query never matches.
    pub fn looks_like_specs(value: &Value) -> bool {
        match value.as_object() {
            Some(obj) => !obj.is_empty() && obj.keys().all(|k| SPEC_KEYS.contains(&k.as_str())),
            None => false,
        }
    }

    /// Parse the JSON shape, rejecting malformed parts before anything is built.
    pub fn from_value(value: &Value) -> Result<Self> {
        let obj = value.as_object().ok_or_else(|| {
            malformed(format!("pipeline specs must be an object, got {}", type_name(value)))
        })?;

        let mut specs = PipelineSpecs::default();
        for (key, part) in obj {
            match key.as_str() {
                "filter" => specs.filter = Some(check_filter(key, part)?),
                "postFilter" => specs.post_filter = Some(check_filter(key, part)?),
                "join" => specs.join = Some(JoinSpec::from_value(part)?),
                "group" => {
                    specs.group = Some(match part {
                        Value::String(field) if !field.is_empty() => GroupSpec::ByField(field.clone()),
                        Value::Object(descriptor) => GroupSpec::Descriptor(descriptor.clone()),
                        other => {
                            return Err(malformed(format!(
                                "group must be a field name or an object, got {}",
                                describe(other)
                            )))
                        }
                    })
                }
                "sort" => specs.sort = Some(parse_sort(part)?),
                other => return Err(malformed(format!("unknown pipeline spec key '{other}'"))),
            }
        }
        Ok(specs)
    }

    pub fn with_filter(mut self, filter: Value) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_join(mut self, join: JoinSpec) -> Self {
        self.join = Some(join);
        self
    }

    pub fn with_post_filter(mut self, filter: Value) -> Self {
        self.post_filter = Some(filter);
        self
    }

    pub fn with_group(mut self, group: GroupSpec) -> Self {
        self.group = Some(group);
        self
    }

    pub fn with_sort(mut self, sort: Map) -> Self {
        self.sort = Some(sort);
        self
    }
}

fn check_filter(key: &str, part: &Value) -> Result<Value> {
    match part {
        Value::Null | Value::Object(_) => Ok(part.clone()),
        Value::String(s) if DocumentId::parse(s).is_some() => Ok(part.clone()),
        other => Err(malformed(format!(
            "{key} must be a filter object or document id, got {}",
            describe(other)
        ))),
    }
}

/// Sort descriptors take `1`/`-1` or `"asc"`/`"desc"`; the latter are
/// normalised to numbers.
pub fn parse_sort(value: &Value) -> Result<Map> {
    let obj = value.as_object().ok_or_else(|| {
        malformed(format!("sort must be an object, got {}", type_name(value)))
    })?;
    let mut sort = Map::new();
    for (field, order) in obj {
        let order = match order {
            Value::Number(n) if n.as_i64() == Some(1) => 1,
            Value::Number(n) if n.as_i64() == Some(-1) => -1,
            Value::String(s) if s.eq_ignore_ascii_case("asc") => 1,
            Value::String(s) if s.eq_ignore_ascii_case("desc") => -1,
            other => {
                return Err(malformed(format!(
                    "sort order of '{field}' must be 1, -1, \"asc\" or \"desc\", got {}",
                    describe(other)
                )))
            }
        };
        sort.insert(field.clone(), Value::from(order));
    }
    Ok(sort)
}

fn describe(value: &Value) -> String {
    match value {
        Value::Object(_) | Value::Array(_) => type_name(value).to_string(),
        other => other.to_string(),
    }
}

fn malformed(message: String) -> DocmapError {
    DocmapError::Configuration(format!("malformed pipeline spec: {message}"))
}
