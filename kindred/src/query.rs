//! Query descriptor: the canonical form of a raw read request.

use crate::driver::Filter;
use crate::error::{KindredError, Result};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Key inside a nested selection carrying an extra filter for that relation.
pub const SELECTION_WHERE: &str = "$where";

/// Requested fields, possibly nested.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Selection {
    pub fields: BTreeMap<String, Selection>,
    /// Extra filter applied to an array relation or a count.
    pub filter: Option<Filter>,
}

impl Selection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `true`, a list of names, or an object of nested selections.
    pub fn from_json(value: &Value) -> Result<Self> {
        let mut selection = Selection::new();
        match value {
            Value::Null | Value::Bool(true) => {}
            Value::Array(names) => {
                for name in names {
                    let name = name.as_str().ok_or_else(|| {
                        KindredError::Query(format!("selection list expects names, got {name}"))
                    })?;
                    selection.fields.insert(name.to_string(), Selection::new());
                }
            }
            Value::Object(map) => {
                for (name, sub) in map {
                    if name == SELECTION_WHERE {
                        let filter = sub.as_object().ok_or_else(|| {
                            KindredError::Query(format!("{SELECTION_WHERE} must be an object"))
                        })?;
                        selection.filter = Some(filter.clone());
                    } else if sub != &Value::Bool(false) {
                        selection.fields.insert(name.clone(), Selection::from_json(sub)?);
                    }
                }
            }
            other => {
                return Err(KindredError::Query(format!("invalid selection {other}")));
            }
        }
        Ok(selection)
    }

    pub fn field(mut self, name: &str) -> Self {
        self.fields.entry(name.to_string()).or_default();
        self
    }

    pub fn nested(mut self, name: &str, selection: Selection) -> Self {
        self.fields.insert(name.to_string(), selection);
        self
    }

    pub fn filtered(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Selection> {
        self.fields.get(name)
    }

    /// Make sure every segment of `path` is selected.
    pub fn select_path(&mut self, path: &[String]) {
        if let Some((first, rest)) = path.split_first() {
            self.fields
                .entry(first.clone())
                .or_default()
                .select_path(rest);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortField {
    pub path: Vec<String>,
    pub direction: SortDirection,
}

/// Cursor window; cursors are document guids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pagination {
    pub first: Option<usize>,
    pub after: Option<String>,
    pub last: Option<usize>,
    pub before: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub select: Selection,
    pub where_: Filter,
    /// Predicates on aggregate counts, keyed by dotted path. Never sent to a store.
    pub count_where: Filter,
    pub sort: Vec<SortField>,
    pub limit: Option<usize>,
    pub pagination: Pagination,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a raw `{ select, where, sort, limit, first, after, last, before }` object.
    pub fn from_json(raw: &Value) -> Result<Self> {
        let raw = match raw {
            Value::Null => return Ok(Query::new()),
            Value::Object(map) => map,
            other => return Err(KindredError::Query(format!("query must be an object, got {other}"))),
        };
        for key in raw.keys() {
            if !matches!(
                key.as_str(),
                "select" | "where" | "sort" | "limit" | "first" | "after" | "last" | "before"
            ) {
                return Err(KindredError::Query(format!("unknown query key '{key}'")));
            }
        }

        let mut query = Query::new();
        if let Some(select) = raw.get("select") {
            query.select = Selection::from_json(select)?;
        }
        if let Some(where_) = raw.get("where") {
            query.where_ = where_
                .as_object()
                .cloned()
                .ok_or_else(|| KindredError::Query("where must be an object".into()))?;
        }
        if let Some(sort) = raw.get("sort") {
            query.sort = parse_sort(sort)?;
        }
        query.limit = usize_arg(raw, "limit")?;
        query.pagination = Pagination {
            first: usize_arg(raw, "first")?,
            after: string_arg(raw, "after")?,
            last: usize_arg(raw, "last")?,
            before: string_arg(raw, "before")?,
        };
        Ok(query.prepared())
    }

    pub fn with_where(mut self, where_: Filter) -> Self {
        self.where_ = where_;
        self.prepared()
    }

    pub fn with_select(mut self, select: Selection) -> Self {
        self.select = select;
        self.prepared()
    }

    pub fn sort_by(mut self, path: &str, direction: SortDirection) -> Self {
        self.sort.push(SortField {
            path: split_path(path),
            direction,
        });
        self.prepared()
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn paginate(mut self, pagination: Pagination) -> Self {
        self.pagination = pagination;
        self
    }

    /// Move count predicates out of `where` and select everything that
    /// sorting and count filtering will read after hydration.
    fn prepared(mut self) -> Self {
        let mut extracted = Filter::new();
        extract_counts(&mut self.where_, "", &mut extracted);
        self.count_where.extend(extracted);

        let mut paths: Vec<Vec<String>> = self.count_where.keys().map(|k| split_path(k)).collect();
        paths.extend(self.sort.iter().map(|s| s.path.clone()));
        for path in paths {
            self.select.select_path(&path);
        }
        self
    }
}

/// True for selection/filter names of the form `count<Field>`.
pub fn is_count_name(name: &str) -> bool {
    name.strip_prefix("count")
        .and_then(|rest| rest.chars().next())
        .map(char::is_uppercase)
        .unwrap_or(false)
}

fn extract_counts(where_: &mut Filter, prefix: &str, out: &mut Filter) {
    let keys: Vec<String> = where_.keys().cloned().collect();
    for key in keys {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        if is_count_name(&key) {
            if let Some(value) = where_.remove(&key) {
                out.insert(path, value);
            }
            continue;
        }
        if let Some(Value::Object(nested)) = where_.get_mut(&key) {
            if !crate::driver::filter::is_operator_map(nested) {
                extract_counts(nested, &path, out);
            }
        }
    }
}

fn split_path(path: &str) -> Vec<String> {
    path.split('.')
        .map(|segment| segment.trim_start_matches('$').to_string())
        .filter(|segment| !segment.is_empty())
        .collect()
}

fn parse_sort(value: &Value) -> Result<Vec<SortField>> {
    let mut fields = Vec::new();
    match value {
        Value::Object(map) => flatten_sort(map, &mut Vec::new(), &mut fields)?,
        Value::Array(entries) => {
            for entry in entries {
                let map = entry.as_object().ok_or_else(|| {
                    KindredError::Query(format!("sort entries must be objects, got {entry}"))
                })?;
                flatten_sort(map, &mut Vec::new(), &mut fields)?;
            }
        }
        other => return Err(KindredError::Query(format!("invalid sort {other}"))),
    }
    Ok(fields)
}

fn flatten_sort(map: &Map<String, Value>, prefix: &mut Vec<String>, out: &mut Vec<SortField>) -> Result<()> {
    for (key, value) in map {
        prefix.extend(split_path(key));
        match value {
            Value::Object(nested) => flatten_sort(nested, prefix, out)?,
            direction => out.push(SortField {
                path: prefix.clone(),
                direction: parse_direction(direction)?,
            }),
        }
        prefix.truncate(prefix.len() - split_path(key).len());
    }
    Ok(())
}

fn parse_direction(value: &Value) -> Result<SortDirection> {
    match value {
        Value::String(s) if s.eq_ignore_ascii_case("asc") => Ok(SortDirection::Asc),
        Value::String(s) if s.eq_ignore_ascii_case("desc") => Ok(SortDirection::Desc),
        Value::Number(n) if n.as_i64() == Some(1) => Ok(SortDirection::Asc),
        Value::Number(n) if n.as_i64() == Some(-1) => Ok(SortDirection::Desc),
        other => Err(KindredError::Query(format!("invalid sort direction {other}"))),
    }
}

fn usize_arg(raw: &Map<String, Value>, key: &str) -> Result<Option<usize>> {
    match raw.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_u64()
            .map(|n| Some(n as usize))
            .ok_or_else(|| KindredError::Query(format!("{key} must be a non-negative integer"))),
    }
}

fn string_arg(raw: &Map<String, Value>, key: &str) -> Result<Option<String>> {
    match raw.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(KindredError::Query(format!("{key} must be a cursor string, got {other}"))),
    }
}
