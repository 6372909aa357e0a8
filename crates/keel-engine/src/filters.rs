//! Kubernetes-oriented template filters
//!
//! Every filter is a pure function of its inputs, so rendering the same
//! chart with the same values always produces the same bytes.

use base64::Engine as _;
use minijinja::{Error, ErrorKind, Value};
use semver::{Version, VersionReq};
use sha2::{Digest, Sha256};

use keel_core::{KubeVersion, Values};

use crate::error::explicit_error;

fn to_json(value: &Value) -> Result<serde_json::Value, Error> {
    serde_json::to_value(value).map_err(|e| Error::new(ErrorKind::InvalidOperation, e.to_string()))
}

/// Convert a value to YAML
///
/// Usage: {{ values.resources | toyaml | nindent(4) }}
pub fn toyaml(value: Value) -> Result<String, Error> {
    let yaml = serde_yaml::to_string(&to_json(&value)?)
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, e.to_string()))?;

    Ok(yaml.trim_start_matches("---\n").trim_end().to_string())
}

/// Convert a value to compact JSON
pub fn tojson(value: Value) -> Result<String, Error> {
    serde_json::to_string(&to_json(&value)?)
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, e.to_string()))
}

/// Convert a value to pretty-printed JSON
pub fn tojson_pretty(value: Value) -> Result<String, Error> {
    serde_json::to_string_pretty(&to_json(&value)?)
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, e.to_string()))
}

#[must_use]
pub fn b64encode(value: String) -> String {
    base64::engine::general_purpose::STANDARD.encode(value.as_bytes())
}

pub fn b64decode(value: String) -> Result<String, Error> {
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(value.as_bytes())
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, format!("base64 decode error: {}", e)))?;

    String::from_utf8(decoded)
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, format!("UTF-8 decode error: {}", e)))
}

fn display(value: &Value) -> String {
    value
        .as_str()
        .map(String::from)
        .unwrap_or_else(|| value.to_string())
}

/// Quote with double quotes, escaping backslashes and quotes
#[must_use]
pub fn quote(value: Value) -> String {
    format!(
        "\"{}\"",
        display(&value).replace('\\', "\\\\").replace('"', "\\\"")
    )
}

/// Quote with single quotes (YAML escaping)
#[must_use]
pub fn squote(value: Value) -> String {
    format!("'{}'", display(&value).replace('\'', "''"))
}

/// Indent every non-empty line, prefixed with a newline
///
/// Usage: {{ values.labels | toyaml | nindent(4) }}
#[must_use]
pub fn nindent(value: String, spaces: usize) -> String {
    format!("\n{}", indent(value, spaces))
}

/// Indent every non-empty line
#[must_use]
pub fn indent(value: String, spaces: usize) -> String {
    let pad = " ".repeat(spaces);
    value
        .lines()
        .map(|line| {
            if line.is_empty() {
                String::new()
            } else {
                format!("{}{}", pad, line)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Fail the render when a value is missing or empty
///
/// Usage: {{ values.database.host | required("database.host is required") }}
pub fn required(value: Value, message: Option<String>) -> Result<Value, Error> {
    let missing = value.is_undefined()
        || value.is_none()
        || value.as_str().is_some_and(str::is_empty);

    if missing {
        Err(explicit_error(
            message.unwrap_or_else(|| "required value is missing".to_string()),
        ))
    } else {
        Ok(value)
    }
}

/// Undefined, none, empty string and empty collections are empty
pub fn empty(value: Value) -> bool {
    if value.is_undefined() || value.is_none() {
        return true;
    }
    if let Some(s) = value.as_str() {
        return s.is_empty();
    }
    value.len().is_some_and(|len| len == 0)
}

pub fn haskey(value: Value, key: String) -> bool {
    value.get_attr(&key).is_ok_and(|v| !v.is_undefined())
}

/// Keys of a mapping, in insertion order
pub fn keys(value: Value) -> Result<Vec<String>, Error> {
    if value.kind() != minijinja::value::ValueKind::Map {
        return Err(Error::new(
            ErrorKind::InvalidOperation,
            "cannot get keys from non-mapping value",
        ));
    }
    Ok(value
        .try_iter()?
        .filter_map(|k| k.as_str().map(String::from))
        .collect())
}

/// Deep merge with the same rules as value layering (right side wins)
///
/// Usage: {{ values.defaultLabels | merge(values.extraLabels) | toyaml }}
pub fn merge(base: Value, overlay: Value) -> Result<Value, Error> {
    let mut merged = Values(to_json(&base)?);
    merged.merge(&Values(to_json(&overlay)?));
    Ok(Value::from_serialize(merged.inner()))
}

/// Hex SHA-256 of a string, for checksum annotations
///
/// Usage: checksum/config: {{ files.get("app.conf") | sha256 }}
pub fn sha256sum(value: String) -> String {
    hex::encode(Sha256::digest(value.as_bytes()))
}

/// Truncate to at most `length` characters
pub fn trunc(value: String, length: usize) -> String {
    value.chars().take(length).collect()
}

pub fn trimprefix(value: String, prefix: String) -> String {
    value.strip_prefix(prefix.as_str()).unwrap_or(&value).to_string()
}

pub fn trimsuffix(value: String, suffix: String) -> String {
    value.strip_suffix(suffix.as_str()).unwrap_or(&value).to_string()
}

pub fn snakecase(value: String) -> String {
    let mut result = String::with_capacity(value.len() + value.len() / 4);
    let mut prev_upper = false;

    for (i, c) in value.chars().enumerate() {
        if c.is_uppercase() {
            if i > 0 && !prev_upper {
                result.push('_');
            }
            result.extend(c.to_lowercase());
            prev_upper = true;
        } else if c == '-' || c == ' ' {
            result.push('_');
            prev_upper = false;
        } else {
            result.push(c);
            prev_upper = false;
        }
    }

    result
}

pub fn kebabcase(value: String) -> String {
    snakecase(value).replace('_', "-")
}

/// Parse a version the way clusters report them (`v1.28.3-gke.100`)
pub(crate) fn lenient_version(raw: &str) -> Result<Version, Error> {
    if let Ok(v) = Version::parse(raw.trim_start_matches('v')) {
        return Ok(v);
    }
    KubeVersion::new(raw)
        .semver()
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, e.to_string()))
}

/// Parse a constraint, dropping Kubernetes-style `-0` pre-release floors
pub(crate) fn lenient_constraint(raw: &str) -> Result<VersionReq, Error> {
    let raw = raw.trim();
    VersionReq::parse(raw)
        .or_else(|_| VersionReq::parse(raw.split('-').next().unwrap_or(raw)))
        .map_err(|e| {
            Error::new(
                ErrorKind::InvalidOperation,
                format!("invalid constraint '{}': {}", raw, e),
            )
        })
}

/// Check a version against a semver constraint
///
/// Usage: {% if capabilities.kubeVersion.version | semver_match(">=1.25.0") %}
pub fn semver_match(version: Value, constraint: String) -> Result<bool, Error> {
    let raw = version
        .as_str()
        .ok_or_else(|| Error::new(ErrorKind::InvalidOperation, "version must be a string"))?;
    let version = lenient_version(raw)?;
    let version = Version::new(version.major, version.minor, version.patch);
    Ok(lenient_constraint(&constraint)?.matches(&version))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toyaml() {
        let value = Value::from_serialize(serde_json::json!({"name": "test", "port": 8080}));
        let yaml = toyaml(value).unwrap();
        assert_eq!(yaml, "name: test\nport: 8080");
    }

    #[test]
    fn test_b64_roundtrip() {
        let encoded = b64encode("hello world".to_string());
        assert_eq!(encoded, "aGVsbG8gd29ybGQ=");
        assert_eq!(b64decode(encoded).unwrap(), "hello world");
        assert!(b64decode("***".to_string()).is_err());
    }

    #[test]
    fn test_quote() {
        assert_eq!(quote(Value::from("te\"st")), "\"te\\\"st\"");
        assert_eq!(quote(Value::from(8080)), "\"8080\"");
        assert_eq!(squote(Value::from("it's")), "'it''s'");
    }

    #[test]
    fn test_indent_and_nindent() {
        assert_eq!(nindent("line1\nline2".to_string(), 4), "\n    line1\n    line2");
        assert_eq!(indent("a\n\nb".to_string(), 2), "  a\n\n  b");
    }

    #[test]
    fn test_required() {
        assert!(required(Value::from("test"), None).is_ok());
        assert!(required(Value::from(0), None).is_ok());
        assert!(required(Value::UNDEFINED, None).is_err());

        let err = required(Value::from(""), Some("host is required".to_string())).unwrap_err();
        assert!(err.to_string().contains("host is required"));
    }

    #[test]
    fn test_empty() {
        assert!(empty(Value::UNDEFINED));
        assert!(empty(Value::from("")));
        assert!(empty(Value::from_serialize(Vec::<i32>::new())));
        assert!(!empty(Value::from("test")));
        assert!(!empty(Value::from(0)));
    }

    #[test]
    fn test_keys_and_haskey() {
        let value = Value::from_serialize(serde_json::json!({"b": 1, "a": 2}));
        assert!(haskey(value.clone(), "a".to_string()));
        assert!(!haskey(value.clone(), "c".to_string()));
        assert_eq!(keys(value).unwrap().len(), 2);
        assert!(keys(Value::from(1)).is_err());
    }

    #[test]
    fn test_merge_deep() {
        let base = Value::from_serialize(serde_json::json!({"labels": {"app": "web", "tier": "fe"}}));
        let overlay = Value::from_serialize(serde_json::json!({"labels": {"tier": "be"}}));
        let merged = tojson(merge(base, overlay).unwrap()).unwrap();
        assert_eq!(merged, r#"{"labels":{"app":"web","tier":"be"}}"#);
    }

    #[test]
    fn test_sha256() {
        assert_eq!(
            sha256sum("hello".to_string()),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_string_helpers() {
        assert_eq!(trunc("hello".to_string(), 3), "hel");
        assert_eq!(trunc("hi".to_string(), 10), "hi");
        assert_eq!(trimprefix("v1.2".to_string(), "v".to_string()), "1.2");
        assert_eq!(trimsuffix("app.yaml".to_string(), ".yaml".to_string()), "app");
        assert_eq!(snakecase("camelCase".to_string()), "camel_case");
        assert_eq!(kebabcase("PascalCase".to_string()), "pascal-case");
    }

    #[test]
    fn test_semver_match() {
        assert!(semver_match(Value::from("v1.28.3"), ">=1.25.0".to_string()).unwrap());
        assert!(semver_match(Value::from("v1.28.3-gke.100"), ">=1.21.0-0".to_string()).unwrap());
        assert!(!semver_match(Value::from("1.20.0"), ">=1.21.0".to_string()).unwrap());
        assert!(semver_match(Value::from(1), ">=1.0.0".to_string()).is_err());
    }
}
