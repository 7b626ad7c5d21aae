//! Naive evaluation of filters, update operators and pipeline stages over
//! in-memory JSON documents. Shared by the reference stores.

use crate::document::{get_path, is_operator_object, remove_path, seed_document, set_path, DocumentId, ID_KEY};
use crate::error::{DocmapError, Result};
use crate::pipeline::{Lookup, Stage, Unwind};
use crate::Map;
use regex::RegexBuilder;
use serde_json::{Number, Value};
use std::cmp::Ordering;

// ── Values ───────────────────────────────────────────────────────────

/// Order two scalars of the same kind. Mixed kinds do not compare.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => match (a.as_i64(), b.as_i64()) {
            (Some(a), Some(b)) => Some(a.cmp(&b)),
            _ => a.as_f64()?.partial_cmp(&b.as_f64()?),
        },
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

/// Structural equality where `1` and `1.0` are the same number.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => compare_values(a, b) == Some(Ordering::Equal),
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| values_equal(x, y))
        }
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len()
                && a.iter().all(|(k, v)| b.get(k).map_or(false, |w| values_equal(v, w)))
        }
        _ => a == b,
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Number(_) => 1,
        Value::String(_) => 2,
        Value::Object(_) => 3,
        Value::Array(_) => 4,
        Value::Bool(_) => 5,
    }
}

/// Total order used by `$sort`, `$min` and `$max`. Missing sorts as null.
pub fn sort_cmp(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let a = a.unwrap_or(&Value::Null);
    let b = b.unwrap_or(&Value::Null);
    type_rank(a)
        .cmp(&type_rank(b))
        .then_with(|| compare_values(a, b).unwrap_or(Ordering::Equal))
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(false, |n| n != 0.0),
        _ => true,
    }
}

fn invalid_query(message: impl Into<String>) -> DocmapError {
    DocmapError::InvalidQuery(message.into())
}

fn invalid_update(message: impl Into<String>) -> DocmapError {
    DocmapError::InvalidUpdate(message.into())
}

// ── Filters ──────────────────────────────────────────────────────────

/// Whether `doc` satisfies `filter`. An empty filter matches everything.
pub fn matches(doc: &Map, filter: &Map) -> Result<bool> {
    for (key, condition) in filter {
        let ok = match key.as_str() {
            "$and" => {
                let mut all = true;
                for sub in operands(key, condition)? {
                    if !matches(doc, sub)? {
                        all = false;
                        break;
                    }
                }
                all
            }
            "$or" => {
                let mut any = false;
                for sub in operands(key, condition)? {
                    if matches(doc, sub)? {
                        any = true;
                        break;
                    }
                }
                any
            }
            "$nor" => {
                let mut none = true;
                for sub in operands(key, condition)? {
                    if matches(doc, sub)? {
                        none = false;
                        break;
                    }
                }
                none
            }
            op if op.starts_with('$') => {
                return Err(invalid_query(format!("unsupported top-level operator '{op}'")))
            }
            path => field_matches(&resolve(doc, path), condition)?,
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn operands<'a>(op: &str, value: &'a Value) -> Result<Vec<&'a Map>> {
    let items = value
        .as_array()
        .ok_or_else(|| invalid_query(format!("'{op}' expects an array of filters")))?;
    items
        .iter()
        .map(|item| {
            item.as_object()
                .ok_or_else(|| invalid_query(format!("'{op}' operands must be objects")))
        })
        .collect()
}

/// Every value reachable at `path`, descending into arrays of sub-documents.
fn resolve<'a>(doc: &'a Map, path: &str) -> Vec<&'a Value> {
    let segments: Vec<&str> = path.split('.').collect();
    let mut found = Vec::new();
    if let Some((first, rest)) = segments.split_first() {
        if let Some(value) = doc.get(*first) {
            descend(value, rest, &mut found);
        }
    }
    found
}

fn descend<'a>(value: &'a Value, rest: &[&str], found: &mut Vec<&'a Value>) {
    let Some((segment, tail)) = rest.split_first() else {
        found.push(value);
        return;
    };
    match value {
        Value::Object(map) => {
            if let Some(next) = map.get(*segment) {
                descend(next, tail, found);
            }
        }
        Value::Array(items) => match segment.parse::<usize>() {
            Ok(index) => {
                if let Some(next) = items.get(index) {
                    descend(next, tail, found);
                }
            }
            Err(_) => {
                for item in items.iter().filter(|item| item.is_object()) {
                    descend(item, rest, found);
                }
            }
        },
        _ => {}
    }
}

/// Candidates with arrays opened up one level.
fn flattened<'a>(candidates: &[&'a Value]) -> Vec<&'a Value> {
    let mut out = Vec::new();
    for candidate in candidates {
        match candidate {
            Value::Array(items) => out.extend(items.iter()),
            other => out.push(*other),
        }
    }
    out
}

fn equals_any(candidates: &[&Value], expected: &Value) -> bool {
    if candidates.is_empty() {
        return expected.is_null();
    }
    candidates.iter().any(|candidate| {
        values_equal(candidate, expected)
            || candidate
                .as_array()
                .map_or(false, |items| items.iter().any(|item| values_equal(item, expected)))
    })
}

fn field_matches(candidates: &[&Value], condition: &Value) -> Result<bool> {
    let Some(operators) = condition.as_object().filter(|_| is_operator_object(condition)) else {
        return Ok(equals_any(candidates, condition));
    };
    for (op, argument) in operators {
        if !operator_matches(candidates, op, argument, operators)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn operator_matches(candidates: &[&Value], op: &str, argument: &Value, siblings: &Map) -> Result<bool> {
    let matched = match op {
        "$eq" => equals_any(candidates, argument),
        "$ne" => !equals_any(candidates, argument),
        "$gt" | "$gte" | "$lt" | "$lte" => flattened(candidates).iter().any(|value| {
            match compare_values(value, argument) {
                Some(Ordering::Greater) => op == "$gt" || op == "$gte",
                Some(Ordering::Less) => op == "$lt" || op == "$lte",
                Some(Ordering::Equal) => op == "$gte" || op == "$lte",
                None => false,
            }
        }),
        "$in" | "$nin" => {
            let options = argument
                .as_array()
                .ok_or_else(|| invalid_query(format!("'{op}' expects an array")))?;
            let found = options.iter().any(|option| equals_any(candidates, option));
            if op == "$in" {
                found
            } else {
                !found
            }
        }
        "$exists" => candidates.is_empty() != truthy(argument),
        "$regex" => {
            let pattern = argument
                .as_str()
                .ok_or_else(|| invalid_query("'$regex' expects a string pattern"))?;
            let flags = siblings.get("$options").and_then(Value::as_str).unwrap_or("");
            let regex = RegexBuilder::new(pattern)
                .case_insensitive(flags.contains('i'))
                .multi_line(flags.contains('m'))
                .build()
                .map_err(|e| invalid_query(format!("invalid regex '{pattern}': {e}")))?;
            flattened(candidates)
                .iter()
                .any(|value| value.as_str().map_or(false, |s| regex.is_match(s)))
        }
        "$options" => true,
        "$not" => {
            if !is_operator_object(argument) {
                return Err(invalid_query("'$not' expects an operator object"));
            }
            !field_matches(candidates, argument)?
        }
        "$size" => {
            let size = argument
                .as_u64()
                .ok_or_else(|| invalid_query("'$size' expects a non-negative integer"))?;
            candidates
                .iter()
                .any(|value| value.as_array().map_or(false, |items| items.len() as u64 == size))
        }
        other => return Err(invalid_query(format!("unsupported query operator '{other}'"))),
    };
    Ok(matched)
}

// ── Updates ──────────────────────────────────────────────────────────

/// Apply an operator-form update. `$setOnInsert` only applies when
/// `inserting`.
pub fn apply_update(doc: &mut Map, update: &Map, inserting: bool) -> Result<()> {
    if update.is_empty() || update.keys().any(|key| !key.starts_with('$')) {
        return Err(invalid_update("update must consist of update operators"));
    }
    for (op, argument) in update {
        let fields = argument
            .as_object()
            .ok_or_else(|| invalid_update(format!("'{op}' expects an object")))?;
        for (path, value) in fields {
            match op.as_str() {
                "$set" => set_path(doc, path, value.clone()),
                "$setOnInsert" => {
                    if inserting {
                        set_path(doc, path, value.clone());
                    }
                }
                "$unset" => {
                    remove_path(doc, path);
                }
                "$inc" => {
                    let sum = add_numbers(get_path(doc, path), value, path)?;
                    set_path(doc, path, sum);
                }
                "$push" | "$addToSet" => {
                    let mut items = array_at(doc, path, op)?;
                    for item in each_items(value) {
                        if op == "$push" || !items.iter().any(|existing| values_equal(existing, &item)) {
                            items.push(item);
                        }
                    }
                    set_path(doc, path, Value::Array(items));
                }
                "$pull" => {
                    if get_path(doc, path).is_some() {
                        let items = array_at(doc, path, op)?;
                        let mut kept = Vec::with_capacity(items.len());
                        for item in items {
                            if !pull_matches(&item, value)? {
                                kept.push(item);
                            }
                        }
                        set_path(doc, path, Value::Array(kept));
                    }
                }
                "$min" | "$max" => {
                    let wanted = if op == "$min" { Ordering::Less } else { Ordering::Greater };
                    let replace = match get_path(doc, path) {
                        None | Some(Value::Null) => true,
                        Some(current) => sort_cmp(Some(value), Some(current)) == wanted,
                    };
                    if replace {
                        set_path(doc, path, value.clone());
                    }
                }
                other => return Err(invalid_update(format!("unsupported update operator '{other}'"))),
            }
        }
    }
    Ok(())
}

fn add_numbers(current: Option<&Value>, increment: &Value, path: &str) -> Result<Value> {
    let increment_number = increment
        .as_number()
        .ok_or_else(|| invalid_update(format!("'$inc' of '{path}' expects a number")))?;
    let current_number = match current {
        None | Some(Value::Null) => return Ok(increment.clone()),
        Some(Value::Number(n)) => n,
        Some(_) => return Err(invalid_update(format!("cannot increment non-numeric field '{path}'"))),
    };
    if let (Some(a), Some(b)) = (current_number.as_i64(), increment_number.as_i64()) {
        if let Some(sum) = a.checked_add(b) {
            return Ok(Value::from(sum));
        }
    }
    let sum = current_number.as_f64().unwrap_or(0.0) + increment_number.as_f64().unwrap_or(0.0);
    Number::from_f64(sum)
        .map(Value::Number)
        .ok_or_else(|| invalid_update(format!("'$inc' of '{path}' overflowed")))
}

fn array_at(doc: &Map, path: &str, op: &str) -> Result<Vec<Value>> {
    match get_path(doc, path) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => Ok(items.clone()),
        Some(_) => Err(invalid_update(format!("'{op}' target '{path}' is not an array"))),
    }
}

/// `{"$each": [..]}` expands to its items, anything else is one item.
fn each_items(value: &Value) -> Vec<Value> {
    match value.get("$each") {
        Some(Value::Array(items)) => items.clone(),
        _ => vec![value.clone()],
    }
}

fn pull_matches(item: &Value, condition: &Value) -> Result<bool> {
    if is_operator_object(condition) {
        return field_matches(&[item], condition);
    }
    match (item, condition) {
        (Value::Object(item), Value::Object(condition)) => matches(item, condition),
        _ => Ok(values_equal(item, condition)),
    }
}

/// The document an upsert inserts when nothing matched: the filter's
/// equality fields with the update applied on top, plus an id.
pub fn upsert_document(filter: &Map, update: &Map) -> Result<Map> {
    let mut doc = seed_document(filter);
    apply_update(&mut doc, update, true)?;
    if doc.contains_key(ID_KEY) {
        return Ok(doc);
    }
    let mut with_id = Map::new();
    with_id.insert(ID_KEY.to_string(), Value::from(DocumentId::new()));
    with_id.extend(doc);
    Ok(with_id)
}

// ── Pipelines ────────────────────────────────────────────────────────

/// Run `stages` over `docs`. `foreign` loads the documents of another
/// collection for `$lookup`.
pub fn run_pipeline<F>(mut docs: Vec<Map>, stages: &[Stage], foreign: &mut F) -> Result<Vec<Map>>
where
    F: FnMut(&str) -> Result<Vec<Map>>,
{
    for stage in stages {
        docs = match stage {
            Stage::Match(filter) => {
                let mut kept = Vec::with_capacity(docs.len());
                for doc in docs {
                    if matches(&doc, filter)? {
                        kept.push(doc);
                    }
                }
                kept
            }
            Stage::Lookup(lookup) => {
                let candidates = foreign(&lookup.from)?;
                for doc in docs.iter_mut() {
                    lookup_into(doc, lookup, &candidates);
                }
                docs
            }
            Stage::Unwind(unwind) => unwind_docs(docs, unwind),
            Stage::Group(descriptor) => group(&docs, descriptor)?,
            Stage::Sort(sort) => {
                sort_docs(&mut docs, sort);
                docs
            }
            Stage::Project(descriptor) => docs.iter().map(|doc| project(doc, descriptor)).collect(),
            Stage::Skip(n) => docs.into_iter().skip(*n as usize).collect(),
            Stage::Limit(n) => {
                docs.truncate(*n as usize);
                docs
            }
        };
    }
    Ok(docs)
}

fn parent_is_object(doc: &Map, path: &str) -> bool {
    match path.rsplit_once('.') {
        None => true,
        Some((parent, _)) => matches!(get_path(doc, parent), Some(Value::Object(_))),
    }
}

fn lookup_into(doc: &mut Map, lookup: &Lookup, candidates: &[Map]) {
    // A null parent (an earlier join without a match) stays null
    if !parent_is_object(doc, &lookup.as_field) {
        return;
    }
    let locals: Vec<Value> = match get_path(doc, &lookup.local_field) {
        Some(Value::Array(items)) => items.clone(),
        Some(value) => vec![value.clone()],
        None => vec![Value::Null],
    };
    let joined: Vec<Value> = candidates
        .iter()
        .filter(|candidate| {
            let foreign = get_path(candidate, &lookup.foreign_field).unwrap_or(&Value::Null);
            locals.iter().any(|local| values_equal(local, foreign))
        })
        .cloned()
        .map(Value::Object)
        .collect();
    set_path(doc, &lookup.as_field, Value::Array(joined));
}

fn unwind_docs(docs: Vec<Map>, unwind: &Unwind) -> Vec<Map> {
    let field = unwind.field();
    let mut out = Vec::with_capacity(docs.len());
    for mut doc in docs {
        let items = match get_path(&doc, field) {
            Some(Value::Array(items)) => Some(items.clone()),
            Some(Value::Null) | None => Some(Vec::new()),
            Some(_) => None,
        };
        match items {
            None => out.push(doc),
            Some(items) if items.is_empty() => {
                if unwind.preserve_null_and_empty_arrays {
                    if parent_is_object(&doc, field) {
                        set_path(&mut doc, field, Value::Null);
                    }
                    out.push(doc);
                }
            }
            Some(items) => {
                for item in items {
                    let mut copy = doc.clone();
                    set_path(&mut copy, field, item);
                    out.push(copy);
                }
            }
        }
    }
    out
}

/// Evaluate an expression: `"$path"` reads a field, objects and arrays
/// evaluate element-wise, anything else is a literal.
fn evaluate(doc: &Map, expression: &Value) -> Value {
    match expression {
        Value::String(s) => match s.strip_prefix('$') {
            Some(path) => get_path(doc, path).cloned().unwrap_or(Value::Null),
            None => expression.clone(),
        },
        Value::Object(obj) => Value::Object(
            obj.iter()
                .map(|(key, value)| (key.clone(), evaluate(doc, value)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(|item| evaluate(doc, item)).collect()),
        other => other.clone(),
    }
}

fn group(docs: &[Map], descriptor: &Map) -> Result<Vec<Map>> {
    let key_expression = descriptor.get(ID_KEY).cloned().unwrap_or(Value::Null);
    let mut groups: Vec<(Value, Vec<&Map>)> = Vec::new();
    for doc in docs {
        let key = evaluate(doc, &key_expression);
        match groups.iter_mut().find(|(existing, _)| values_equal(existing, &key)) {
            Some((_, members)) => members.push(doc),
            None => groups.push((key, vec![doc])),
        }
    }

    let mut rows = Vec::with_capacity(groups.len());
    for (key, members) in groups {
        let mut row = Map::new();
        row.insert(ID_KEY.to_string(), key);
        for (name, spec) in descriptor {
            if name == ID_KEY {
                continue;
            }
            let accumulator = spec
                .as_object()
                .filter(|obj| obj.len() == 1)
                .and_then(|obj| obj.iter().next())
                .ok_or_else(|| invalid_query(format!("group field '{name}' must be a single accumulator")))?;
            row.insert(name.clone(), accumulate(accumulator.0, accumulator.1, &members)?);
        }
        rows.push(row);
    }
    Ok(rows)
}

fn accumulate(op: &str, expression: &Value, members: &[&Map]) -> Result<Value> {
    let values: Vec<Value> = members.iter().map(|doc| evaluate(doc, expression)).collect();
    let present = || values.iter().filter(|value| !value.is_null());
    let result = match op {
        "$sum" => sum(&values),
        "$avg" => {
            let numbers: Vec<f64> = values.iter().filter_map(Value::as_f64).collect();
            if numbers.is_empty() {
                Value::Null
            } else {
                let mean = numbers.iter().sum::<f64>() / numbers.len() as f64;
                Number::from_f64(mean).map(Value::Number).unwrap_or(Value::Null)
            }
        }
        "$min" => present()
            .min_by(|a, b| sort_cmp(Some(*a), Some(*b)))
            .cloned()
            .unwrap_or(Value::Null),
        "$max" => present()
            .max_by(|a, b| sort_cmp(Some(*a), Some(*b)))
            .cloned()
            .unwrap_or(Value::Null),
        "$push" => Value::Array(values.clone()),
        "$addToSet" => {
            let mut set: Vec<Value> = Vec::new();
            for value in &values {
                if !set.iter().any(|existing| values_equal(existing, value)) {
                    set.push(value.clone());
                }
            }
            Value::Array(set)
        }
        "$first" => values.first().cloned().unwrap_or(Value::Null),
        "$last" => values.last().cloned().unwrap_or(Value::Null),
        "$count" => Value::from(members.len() as u64),
        other => return Err(invalid_query(format!("unsupported accumulator '{other}'"))),
    };
    Ok(result)
}

fn sum(values: &[Value]) -> Value {
    let mut integer: Option<i64> = Some(0);
    let mut float = 0.0;
    for number in values.iter().filter_map(Value::as_number) {
        integer = match (integer, number.as_i64()) {
            (Some(total), Some(n)) => total.checked_add(n),
            _ => None,
        };
        float += number.as_f64().unwrap_or(0.0);
    }
    match integer {
        Some(total) => Value::from(total),
        None => Number::from_f64(float).map(Value::Number).unwrap_or(Value::Null),
    }
}

fn sort_docs(docs: &mut [Map], sort: &Map) {
    docs.sort_by(|a, b| {
        for (field, order) in sort {
            let ordering = sort_cmp(get_path(a, field), get_path(b, field));
            let ordering = if order.as_i64() == Some(-1) {
                ordering.reverse()
            } else {
                ordering
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
}

fn flag(spec: &Value) -> Option<bool> {
    match spec {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => Some(n.as_f64() != Some(0.0)),
        _ => None,
    }
}

fn project(doc: &Map, descriptor: &Map) -> Map {
    if descriptor.is_empty() {
        return doc.clone();
    }
    let mut fields = descriptor.iter().filter(|(key, _)| key.as_str() != ID_KEY).peekable();
    let exclusion = if fields.peek().is_some() {
        fields.all(|(_, spec)| flag(spec) == Some(false))
    } else {
        descriptor.get(ID_KEY).and_then(flag) == Some(false)
    };
    if exclusion {
        let mut out = doc.clone();
        for (key, spec) in descriptor {
            if flag(spec) == Some(false) {
                remove_path(&mut out, key);
            }
        }
        return out;
    }

    let mut out = Map::new();
    if !descriptor.contains_key(ID_KEY) {
        if let Some(id) = doc.get(ID_KEY) {
            out.insert(ID_KEY.to_string(), id.clone());
        }
    }
    for (key, spec) in descriptor {
        if let Some(value) = project_entry(doc, key, spec) {
            set_path(&mut out, key, value);
        }
    }
    out
}

fn project_entry(doc: &Map, path: &str, spec: &Value) -> Option<Value> {
    if let Some(include) = flag(spec) {
        return if include { get_path(doc, path).cloned() } else { None };
    }
    match spec {
        Value::String(s) if s.starts_with('$') => get_path(doc, &s[1..]).cloned(),
        Value::Object(obj) if obj.len() == 1 && obj.contains_key("$literal") => obj.get("$literal").cloned(),
        Value::Object(obj) => {
            if let Some(Value::Null) = get_path(doc, path) {
                return Some(Value::Null);
            }
            let mut nested = Map::new();
            for (key, value) in obj {
                if let Some(projected) = project_entry(doc, &format!("{path}.{key}"), value) {
                    nested.insert(key.clone(), projected);
                }
            }
            if nested.is_empty() {
                None
            } else {
                Some(Value::Object(nested))
            }
        }
        other => Some(other.clone()),
    }
}
