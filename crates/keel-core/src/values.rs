//! Values handling with deep merge support

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::path::Path;

use crate::error::{CoreError, Result};

/// Values container with deep merge capability
///
/// Keys keep their insertion order, so a tree read from YAML serializes back
/// in the order it was written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Values(pub JsonValue);

impl Default for Values {
    fn default() -> Self {
        Self::new()
    }
}

impl Values {
    /// Create empty values
    pub fn new() -> Self {
        Self(JsonValue::Object(serde_json::Map::new()))
    }

    /// Load values from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&content)
    }

    /// Parse values from YAML string
    ///
    /// An empty document yields an empty tree rather than `null`.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let value: JsonValue = serde_yaml::from_str(yaml)?;
        Ok(Self::normalize(value))
    }

    /// Parse values from JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        let value: JsonValue = serde_json::from_str(json)?;
        Ok(Self::normalize(value))
    }

    fn normalize(value: JsonValue) -> Self {
        match value {
            JsonValue::Null => Self::new(),
            other => Self(other),
        }
    }

    /// Deep merge another Values into this one
    ///
    /// Rules:
    /// - Scalars: overlay replaces base
    /// - Objects: recursive merge
    /// - Arrays: overlay replaces base (not appended)
    pub fn merge(&mut self, overlay: &Values) {
        deep_merge(&mut self.0, &overlay.0);
    }

    /// Return a new tree with `overlay` merged over `self`
    pub fn merged(&self, overlay: &Values) -> Values {
        let mut result = self.clone();
        result.merge(overlay);
        result
    }

    /// Merge multiple values in order, later entries taking precedence
    pub fn merge_all(values: Vec<Values>) -> Self {
        let mut result = Values::new();
        for v in values {
            result.merge(&v);
        }
        result
    }

    /// Set a value by dotted path (e.g., "image.tag")
    pub fn set(&mut self, path: &str, value: JsonValue) -> Result<()> {
        let segments = parse_key_path(path, path)?;
        set_path(&mut self.0, &segments, value);
        Ok(())
    }

    /// Get a value by dotted path
    pub fn get(&self, path: &str) -> Option<&JsonValue> {
        let parts: Vec<&str> = path.split('.').collect();
        get_nested(&self.0, &parts)
    }

    /// Get the inner JSON value
    pub fn inner(&self) -> &JsonValue {
        &self.0
    }

    /// Convert to JSON value
    pub fn into_inner(self) -> JsonValue {
        self.0
    }

    /// Check if values are empty
    pub fn is_empty(&self) -> bool {
        match &self.0 {
            JsonValue::Object(map) => map.is_empty(),
            JsonValue::Null => true,
            _ => false,
        }
    }

    /// Serialize to YAML
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(&self.0)?)
    }

    // =========================================================================
    // Subchart Value Scoping
    // =========================================================================

    /// Scope values for a subchart
    ///
    /// When rendering a subchart, it should only see:
    /// 1. Values under `<subchart_name>.*` in the parent, as its root values
    /// 2. Global values under `global.*` preserved as-is
    ///
    /// # Example
    ///
    /// Parent values:
    /// ```yaml
    /// global:
    ///   imageRegistry: docker.io
    /// redis:
    ///   replicas: 3
    /// postgresql:
    ///   enabled: false
    /// ```
    ///
    /// Calling `scope_for_subchart("redis")` produces:
    /// ```yaml
    /// replicas: 3
    /// global:
    ///   imageRegistry: docker.io
    /// ```
    pub fn scope_for_subchart(&self, subchart_name: &str) -> Values {
        let mut scoped = serde_json::Map::new();

        if let JsonValue::Object(parent_obj) = &self.0 {
            if let Some(JsonValue::Object(subchart_obj)) = parent_obj.get(subchart_name) {
                for (k, v) in subchart_obj {
                    scoped.insert(k.clone(), v.clone());
                }
            }

            // Applied last: the parent's globals win over whatever the slice says
            if let Some(global) = parent_obj.get("global") {
                let mut merged = scoped
                    .remove("global")
                    .unwrap_or_else(|| JsonValue::Object(serde_json::Map::new()));
                deep_merge(&mut merged, global);
                scoped.insert("global".to_string(), merged);
            }
        }

        Values(JsonValue::Object(scoped))
    }

    /// Merge subchart defaults with scoped parent values
    ///
    /// The complete subchart value resolution:
    /// 1. Start with the subchart's own `values.yaml` defaults
    /// 2. Merge in the parent's slice under the subchart name
    /// 3. Merge in the parent's `global` section
    pub fn for_subchart(
        subchart_defaults: &Values,
        parent_values: &Values,
        subchart_name: &str,
    ) -> Values {
        let scoped = parent_values.scope_for_subchart(subchart_name);
        subchart_defaults.merged(&scoped)
    }

    /// Walk every leaf of the tree, yielding dotted paths
    ///
    /// Empty objects count as leaves so that `{}` overrides remain visible.
    pub fn leaves(&self) -> Vec<(String, &JsonValue)> {
        let mut out = Vec::new();
        collect_leaves(&self.0, String::new(), &mut out);
        out
    }
}

impl From<JsonValue> for Values {
    fn from(value: JsonValue) -> Self {
        Self::normalize(value)
    }
}

/// Deep merge two JSON values
fn deep_merge(base: &mut JsonValue, overlay: &JsonValue) {
    match (base, overlay) {
        (JsonValue::Object(base_map), JsonValue::Object(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(base_value) => deep_merge(base_value, overlay_value),
                    None => {
                        base_map.insert(key.clone(), overlay_value.clone());
                    }
                }
            }
        }
        (base, overlay) => {
            *base = overlay.clone();
        }
    }
}

fn collect_leaves<'a>(value: &'a JsonValue, prefix: String, out: &mut Vec<(String, &'a JsonValue)>) {
    match value {
        JsonValue::Object(map) if !map.is_empty() => {
            for (k, v) in map {
                let path = if prefix.is_empty() {
                    k.clone()
                } else {
                    format!("{}.{}", prefix, k)
                };
                collect_leaves(v, path, out);
            }
        }
        other => {
            if !prefix.is_empty() {
                out.push((prefix, other));
            }
        }
    }
}

/// Get a nested value by path
fn get_nested<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let Some((key, remaining)) = path.split_first() else {
        return Some(value);
    };

    match value {
        JsonValue::Object(map) => map.get(*key).and_then(|v| get_nested(v, remaining)),
        JsonValue::Array(items) => key
            .parse::<usize>()
            .ok()
            .and_then(|i| items.get(i))
            .and_then(|v| get_nested(v, remaining)),
        _ => None,
    }
}

// =============================================================================
// Inline overrides (`a.b.c=value`)
// =============================================================================

/// Largest list index an override may name
pub const MAX_LIST_INDEX: usize = 65536;

/// One step of an override key path
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Key(String),
    Index(usize),
}

/// Parse `--set` style arguments (`key=value` format)
///
/// Keys are dotted paths; a literal dot is written `\.` and list elements are
/// addressed with `name[0]`. Values are typed: `true`/`false`, `null`,
/// integers, floats, and JSON lists or objects; everything else is a string.
///
/// A batch that assigns both `a` and a path below it (`a.b`) is rejected as
/// ambiguous, as are missing `=`, empty keys or segments, and malformed indices.
pub fn parse_set_values(set_args: &[String]) -> Result<Values> {
    let mut values = Values::new();
    let mut assigned: Vec<Vec<Segment>> = Vec::new();

    for arg in set_args {
        let (key, raw) = split_assignment(arg)?;
        let segments = parse_key_path(key, arg)?;

        if let Some(conflict) = assigned
            .iter()
            .find(|prev| is_strict_prefix(prev, &segments) || is_strict_prefix(&segments, prev))
        {
            return Err(CoreError::invalid_syntax(
                arg,
                format!(
                    "ambiguous key path: '{}' conflicts with '{}'",
                    render_path(&segments),
                    render_path(conflict)
                ),
            ));
        }

        let value = parse_scalar(raw, arg)?;
        set_path(&mut values.0, &segments, value);
        assigned.push(segments);
    }

    Ok(values)
}

/// Split at the first `=` that is not escaped
fn split_assignment(arg: &str) -> Result<(&str, &str)> {
    let mut escaped = false;
    for (i, c) in arg.char_indices() {
        match c {
            '\\' if !escaped => escaped = true,
            '=' if !escaped => return Ok((&arg[..i], &arg[i + 1..])),
            _ => escaped = false,
        }
    }
    Err(CoreError::invalid_syntax(arg, "expected key=value"))
}

fn parse_key_path(key: &str, expression: &str) -> Result<Vec<Segment>> {
    if key.is_empty() {
        return Err(CoreError::invalid_syntax(expression, "empty key"));
    }

    let mut segments = Vec::new();
    let mut current = String::new();
    let mut chars = key.chars().peekable();
    // True once a `[n]` closed the current segment; a following `.` then
    // starts a new one without pushing an empty key.
    let mut after_index = false;

    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some(next) => current.push(next),
                None => {
                    return Err(CoreError::invalid_syntax(expression, "dangling escape"));
                }
            },
            '.' => {
                if current.is_empty() && !after_index {
                    return Err(CoreError::invalid_syntax(expression, "empty path segment"));
                }
                if !current.is_empty() {
                    segments.push(Segment::Key(std::mem::take(&mut current)));
                }
                after_index = false;
                if chars.peek().is_none() {
                    return Err(CoreError::invalid_syntax(expression, "empty path segment"));
                }
            }
            '[' => {
                if !current.is_empty() {
                    segments.push(Segment::Key(std::mem::take(&mut current)));
                } else if !after_index {
                    return Err(CoreError::invalid_syntax(
                        expression,
                        "list index without a key",
                    ));
                }
                let mut digits = String::new();
                let mut closed = false;
                for d in chars.by_ref() {
                    if d == ']' {
                        closed = true;
                        break;
                    }
                    digits.push(d);
                }
                if !closed {
                    return Err(CoreError::invalid_syntax(expression, "unclosed '['"));
                }
                let index = digits.parse::<usize>().map_err(|_| {
                    CoreError::invalid_syntax(expression, format!("invalid list index '{}'", digits))
                })?;
                if index > MAX_LIST_INDEX {
                    return Err(CoreError::invalid_syntax(
                        expression,
                        format!("list index {} exceeds maximum {}", index, MAX_LIST_INDEX),
                    ));
                }
                segments.push(Segment::Index(index));
                after_index = true;
            }
            ']' => {
                return Err(CoreError::invalid_syntax(expression, "unexpected ']'"));
            }
            other => {
                if after_index {
                    return Err(CoreError::invalid_syntax(
                        expression,
                        "expected '.' or '[' after list index",
                    ));
                }
                current.push(other);
            }
        }
    }

    if !current.is_empty() {
        segments.push(Segment::Key(current));
    }

    if segments.is_empty() {
        return Err(CoreError::invalid_syntax(expression, "empty key"));
    }

    Ok(segments)
}

fn parse_scalar(raw: &str, expression: &str) -> Result<JsonValue> {
    let value = match raw {
        "true" => JsonValue::Bool(true),
        "false" => JsonValue::Bool(false),
        "null" => JsonValue::Null,
        _ if raw.starts_with('[') || raw.starts_with('{') => {
            serde_json::from_str(raw).map_err(|e| {
                CoreError::invalid_syntax(expression, format!("invalid JSON literal: {}", e))
            })?
        }
        _ => {
            if let Ok(num) = raw.parse::<i64>() {
                JsonValue::Number(num.into())
            } else if let Some(num) = raw
                .parse::<f64>()
                .ok()
                .filter(|_| raw.chars().any(|c| c.is_ascii_digit()))
                .and_then(serde_json::Number::from_f64)
            {
                JsonValue::Number(num)
            } else {
                JsonValue::String(raw.to_string())
            }
        }
    };
    Ok(value)
}

fn set_path(value: &mut JsonValue, path: &[Segment], new_value: JsonValue) {
    let Some((head, rest)) = path.split_first() else {
        *value = new_value;
        return;
    };

    match head {
        Segment::Key(key) => {
            if !value.is_object() {
                *value = JsonValue::Object(serde_json::Map::new());
            }
            if let JsonValue::Object(map) = value {
                let entry = map.entry(key.clone()).or_insert(JsonValue::Null);
                set_path(entry, rest, new_value);
            }
        }
        Segment::Index(index) => {
            if !value.is_array() {
                *value = JsonValue::Array(Vec::new());
            }
            if let JsonValue::Array(items) = value {
                if items.len() <= *index {
                    items.resize(index + 1, JsonValue::Null);
                }
                set_path(&mut items[*index], rest, new_value);
            }
        }
    }
}

fn is_strict_prefix(prefix: &[Segment], path: &[Segment]) -> bool {
    prefix.len() < path.len() && path.starts_with(prefix)
}

fn render_path(path: &[Segment]) -> String {
    let mut out = String::new();
    for segment in path {
        match segment {
            Segment::Key(k) => {
                if !out.is_empty() {
                    out.push('.');
                }
                out.push_str(k);
            }
            Segment::Index(i) => out.push_str(&format!("[{}]", i)),
        }
    }
    out
}
