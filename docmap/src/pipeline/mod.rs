//! Aggregation pipeline factory.
//!
//! Turns [`PipelineSpecs`] into an ordered list of [`Stage`]s:
//! filter, joins, caller stages, post-filter, group, sort.

mod specs;
mod stage;

pub use specs::{parse_sort, GroupSpec, Join, JoinSpec, PipelineSpecs, SPEC_KEYS};
pub use stage::{Lookup, Stage, Unwind};

use crate::document::{CREATED_AT_KEY, ID_KEY, UPDATED_AT_KEY};
use crate::error::{DocmapError, Result};
use crate::sanitize::{sanitize_query, SanitizeOptions, LOGICAL_OPERATORS};
use crate::schema::{Schema, SchemaRegistry};
use crate::Map;
use serde_json::Value;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineOptions {
    /// Path prefix applied to filter and post-filter keys
    pub prefix: String,
    /// Stages inserted between the joins and the post-filter
    pub stages: Vec<Stage>,
}

impl PipelineOptions {
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_stage(mut self, stage: Stage) -> Self {
        self.stages.push(stage);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProjectOptions {
    /// Field paths left out of the projection
    pub exclude: Vec<String>,
    /// Reference fields projected as nested documents
    pub populate: Option<JoinSpec>,
}

pub fn build_pipeline(
    registry: &SchemaRegistry,
    schema: &Schema,
    specs: &PipelineSpecs,
    options: &PipelineOptions,
) -> Result<Vec<Stage>> {
    let mut stages = Vec::new();

    if let Some(filter) = &specs.filter {
        stages.push(filter_stage(schema, filter, &options.prefix)?);
    }
    if let Some(join) = &specs.join {
        join_stages(registry, schema, join, "", &mut stages)?;
    }
    stages.extend(options.stages.iter().cloned());
    if let Some(post_filter) = &specs.post_filter {
        stages.push(filter_stage(schema, post_filter, &options.prefix)?);
    }
    if let Some(group) = &specs.group {
        stages.push(group_stage(group));
    }
    if let Some(sort) = &specs.sort {
        stages.push(Stage::Sort(sort.clone()));
    }

    log::debug!(
        "built pipeline for '{}': [{}]",
        schema.name,
        stages.iter().map(Stage::name).collect::<Vec<_>>().join(", ")
    );
    Ok(stages)
}

/// A `$match` stage. The query is sanitized leniently so that joined or
/// prefixed paths survive.
pub fn filter_stage(schema: &Schema, query: &Value, prefix: &str) -> Result<Stage> {
    let filter = sanitize_query(schema, query, SanitizeOptions::LENIENT)?;
    Ok(Stage::Match(prefix_keys(filter, prefix)))
}

fn prefix_keys(filter: Map, prefix: &str) -> Map {
    if prefix.is_empty() {
        return filter;
    }
    filter
        .into_iter()
        .map(|(key, value)| {
            if LOGICAL_OPERATORS.contains(&key.as_str()) {
                let value = match value {
                    Value::Array(operands) => Value::Array(
                        operands
                            .into_iter()
                            .map(|operand| match operand {
                                Value::Object(obj) => Value::Object(prefix_keys(obj, prefix)),
                                other => other,
                            })
                            .collect(),
                    ),
                    other => other,
                };
                (key, value)
            } else {
                (format!("{prefix}.{key}"), value)
            }
        })
        .collect()
}

fn join_stages(
    registry: &SchemaRegistry,
    schema: &Schema,
    join: &JoinSpec,
    prefix: &str,
    stages: &mut Vec<Stage>,
) -> Result<()> {
    for (field, nested) in join.iter() {
        let target = registry.resolve_reference(schema, field)?;
        let is_array = schema
            .field(field)
            .map(|spec| spec.field_type.is_array())
            .unwrap_or(false);
        let path = join_path(prefix, field);

        stages.push(Stage::Lookup(Lookup {
            from: target.collection.clone(),
            local_field: path.clone(),
            foreign_field: ID_KEY.to_string(),
            as_field: path.clone(),
        }));
        // Arrays of references keep the joined array
        if !is_array {
            stages.push(Stage::Unwind(Unwind::preserving(&path)));
        }

        if let Join::Nested(spec) = nested {
            if is_array {
                return Err(DocmapError::Configuration(format!(
                    "cannot join into '{path}' of '{}': it holds an array of references",
                    schema.name
                )));
            }
            join_stages(registry, target, spec, &path, stages)?;
        }
    }
    Ok(())
}

fn group_stage(group: &GroupSpec) -> Stage {
    match group {
        GroupSpec::ByField(field) => {
            let mut descriptor = Map::new();
            descriptor.insert(ID_KEY.to_string(), Value::String(format!("${field}")));
            Stage::Group(descriptor)
        }
        GroupSpec::Descriptor(descriptor) => Stage::Group(descriptor.clone()),
    }
}

/// A `$project` stage listing every field of `schema`.
pub fn project_stage(
    registry: &SchemaRegistry,
    schema: &Schema,
    options: &ProjectOptions,
) -> Result<Stage> {
    let descriptor = projection(registry, schema, &options.exclude, options.populate.as_ref(), "")?;
    Ok(Stage::Project(descriptor))
}

fn projection(
    registry: &SchemaRegistry,
    schema: &Schema,
    exclude: &[String],
    populate: Option<&JoinSpec>,
    prefix: &str,
) -> Result<Map> {
    let excluded = |path: &str| exclude.iter().any(|e| e == path);
    let mut descriptor = Map::new();
    descriptor.insert(ID_KEY.to_string(), source_path(&join_path(prefix, ID_KEY)));

    for (field, spec) in schema.fields.iter() {
        let path = join_path(prefix, field);
        if excluded(&path) {
            continue;
        }
        let populated = populate.and_then(|join| join.get(field));
        let value = match populated {
            Some(join) if spec.reference.is_some() && !spec.field_type.is_array() => {
                let target = registry.resolve_reference(schema, field)?;
                let nested = match join {
                    Join::Nested(spec) => Some(spec),
                    Join::Populate => None,
                };
                Value::Object(projection(registry, target, exclude, nested, &path)?)
            }
            _ => source_path(&path),
        };
        descriptor.insert(field.to_string(), value);
    }

    if schema.timestamps {
        for key in [CREATED_AT_KEY, UPDATED_AT_KEY] {
            let path = join_path(prefix, key);
            if !excluded(&path) {
                descriptor.insert(key.to_string(), source_path(&path));
            }
        }
    }
    Ok(descriptor)
}

fn join_path(prefix: &str, field: &str) -> String {
    if prefix.is_empty() {
        field.to_string()
    } else {
        format!("{prefix}.{field}")
    }
}

fn source_path(path: &str) -> Value {
    Value::String(format!("${path}"))
}
