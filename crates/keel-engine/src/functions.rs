//! Global functions available in templates
//!
//! There is no clock and no unseeded randomness here: identifiers are
//! derived from caller-supplied seeds so renders stay reproducible.

use std::cell::Cell;

use minijinja::{Error, ErrorKind, State, Value};
use rand::{Rng, SeedableRng, rngs::StdRng};
use sha2::{Digest, Sha256};

use keel_core::Capabilities;

use crate::error::explicit_error;
use crate::filters::{lenient_constraint, lenient_version};

/// Maximum nesting of `tpl` calls
const MAX_TPL_DEPTH: usize = 10;

thread_local! {
    static TPL_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Tracks one level of `tpl` nesting for the current thread
struct TplDepthGuard(usize);

impl TplDepthGuard {
    fn enter() -> Result<Self, Error> {
        let depth = TPL_DEPTH.with(|d| {
            let next = d.get() + 1;
            d.set(next);
            next
        });
        let guard = Self(depth);
        if depth > MAX_TPL_DEPTH {
            return Err(Error::new(
                ErrorKind::InvalidOperation,
                format!(
                    "tpl nesting depth {} exceeds maximum {}; check for self-referencing template strings in values",
                    depth, MAX_TPL_DEPTH
                ),
            ));
        }
        Ok(guard)
    }
}

impl Drop for TplDepthGuard {
    fn drop(&mut self) {
        TPL_DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
    }
}

/// Abort the render with a message
///
/// Usage: {{ fail("ingress.host must be set when ingress is enabled") }}
pub fn fail(message: String) -> Result<Value, Error> {
    Err(explicit_error(message))
}

/// Build a mapping from alternating keys and values
///
/// Usage: {{ dict("app", release.name, "tier", "web") | toyaml }}
pub fn dict(args: Vec<Value>) -> Result<Value, Error> {
    if args.len() % 2 != 0 {
        return Err(Error::new(
            ErrorKind::InvalidOperation,
            "dict requires an even number of arguments (key-value pairs)",
        ));
    }

    let mut map = serde_json::Map::new();
    for pair in args.chunks(2) {
        let key = pair[0]
            .as_str()
            .ok_or_else(|| Error::new(ErrorKind::InvalidOperation, "dict keys must be strings"))?;
        let value = serde_json::to_value(&pair[1])
            .map_err(|e| Error::new(ErrorKind::InvalidOperation, e.to_string()))?;
        map.insert(key.to_string(), value);
    }

    Ok(Value::from_serialize(serde_json::Value::Object(map)))
}

pub fn list(args: Vec<Value>) -> Value {
    Value::from(args)
}

/// Attribute lookup with a fallback
///
/// Usage: {{ get(values.resources, "limits", {}) }}
pub fn get(obj: Value, key: String, default: Option<Value>) -> Value {
    match obj.get_attr(&key) {
        Ok(v) if !v.is_undefined() && !v.is_none() => v,
        _ => default.unwrap_or(Value::UNDEFINED),
    }
}

/// First argument that is defined, not none and not an empty string
pub fn coalesce(args: Vec<Value>) -> Value {
    args.into_iter()
        .find(|arg| !arg.is_undefined() && !arg.is_none() && arg.as_str() != Some(""))
        .unwrap_or(Value::UNDEFINED)
}

/// Usage: {{ ternary("yes", "no", values.enabled) }}
pub fn ternary(true_val: Value, false_val: Value, condition: Value) -> Value {
    if condition.is_true() { true_val } else { false_val }
}

pub fn tostring(value: Value) -> String {
    value
        .as_str()
        .map(String::from)
        .unwrap_or_else(|| value.to_string())
}

pub fn toint(value: Value) -> Result<i64, Error> {
    if let Some(n) = value.as_i64() {
        return Ok(n);
    }
    if let Some(s) = value.as_str() {
        return s.trim().parse::<i64>().map_err(|_| {
            Error::new(
                ErrorKind::InvalidOperation,
                format!("cannot convert '{}' to int", s),
            )
        });
    }
    Err(Error::new(
        ErrorKind::InvalidOperation,
        format!("cannot convert {} to int", value.kind()),
    ))
}

/// Printf-style formatting with `%s`, `%d`, `%v`, `%q` and `%%`
///
/// Usage: {{ printf("%s-%s", release.name, chart.name) | trunc(63) }}
pub fn printf(format: String, args: Vec<Value>) -> Result<String, Error> {
    let mut result = String::with_capacity(format.len() + args.len() * 8);
    let mut chars = format.chars();
    let mut remaining = args.iter();

    while let Some(c) = chars.next() {
        if c != '%' {
            result.push(c);
            continue;
        }
        let Some(spec) = chars.next() else {
            result.push('%');
            break;
        };
        if spec == '%' {
            result.push('%');
            continue;
        }

        let arg = remaining.next().ok_or_else(|| {
            Error::new(
                ErrorKind::InvalidOperation,
                "not enough arguments for format string",
            )
        })?;
        match spec {
            'q' => result.push_str(&crate::filters::quote(arg.clone())),
            'd' => match arg.as_i64() {
                Some(n) => result.push_str(&n.to_string()),
                None => result.push_str(&tostring(arg.clone())),
            },
            _ => result.push_str(&tostring(arg.clone())),
        }
    }

    Ok(result)
}

/// Render a string as a template
///
/// Without an explicit context the string sees the caller's full context
/// (`values`, `release`, `chart`, `capabilities`, `template`, `files`).
///
/// Usage: {{ tpl(values.hostTemplate) }}
pub fn tpl(state: &State, template: String, context: Option<Value>) -> Result<String, Error> {
    if !template.contains("{{") && !template.contains("{%") {
        return Ok(template);
    }

    let guard = TplDepthGuard::enter()?;
    let context = context.unwrap_or_else(|| caller_context(state));

    state.env().render_str(&template, context).map_err(|e| {
        let mut shown: String = template.chars().take(60).collect();
        if shown.len() < template.len() {
            shown.push_str("...");
        }
        Error::new(
            ErrorKind::InvalidOperation,
            format!("tpl error (depth {}): {}\n  Template: \"{}\"", guard.0, e, shown),
        )
    })
}

fn caller_context(state: &State) -> Value {
    let entries = crate::suggestions::CONTEXT_VARIABLES
        .iter()
        .filter_map(|name| {
            state
                .lookup(name)
                .filter(|v| !v.is_undefined())
                .map(|v| (*name, v))
        });
    Value::from_iter(entries)
}

fn capabilities(state: &State) -> Result<Capabilities, Error> {
    let raw = state
        .lookup("capabilities")
        .filter(|v| !v.is_undefined())
        .ok_or_else(|| Error::new(ErrorKind::InvalidOperation, "capabilities are not available"))?;
    serde_json::to_value(&raw)
        .and_then(serde_json::from_value)
        .map_err(|e| {
            Error::new(
                ErrorKind::InvalidOperation,
                format!("malformed capabilities: {}", e),
            )
        })
}

/// Whether the target cluster serves an API (`group/version` or `group/version/Kind`)
///
/// Usage: {% if has_api("monitoring.coreos.com/v1/ServiceMonitor") %}
pub fn has_api(state: &State, api: String) -> Result<bool, Error> {
    Ok(capabilities(state)?.has(&api))
}

/// Fail the render unless the cluster serves an API
pub fn require_api(state: &State, api: String, message: Option<String>) -> Result<Value, Error> {
    if capabilities(state)?.has(&api) {
        return Ok(Value::from(true));
    }
    Err(explicit_error(message.unwrap_or_else(|| {
        format!("cluster does not serve required API {}", api)
    })))
}

/// Usage: {% if semver_compare(">=1.25.0", capabilities.kubeVersion.version) %}
pub fn semver_compare(constraint: String, version: String) -> Result<bool, Error> {
    let version = lenient_version(&version)?;
    let version = semver::Version::new(version.major, version.minor, version.patch);
    Ok(lenient_constraint(&constraint)?.matches(&version))
}

fn seeded_rng(seed: &str) -> StdRng {
    let digest: [u8; 32] = Sha256::digest(seed.as_bytes()).into();
    StdRng::from_seed(digest)
}

/// Version-4 shaped UUID derived from a seed
///
/// Usage: {{ seeded_uuid(release.name ~ "-token") }}
pub fn seeded_uuid(seed: String) -> String {
    let mut bytes = [0u8; 16];
    seeded_rng(&seed).fill(&mut bytes);
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;

    let hex = hex::encode(bytes);
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

/// Alphanumeric string of `length` characters derived from a seed
///
/// Usage: password: {{ seeded_alnum(24, release.name ~ "-db") | b64encode }}
pub fn seeded_alnum(length: usize, seed: String) -> String {
    seeded_rng(&seed)
        .sample_iter(rand::distr::Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use minijinja::Environment;

    fn env() -> Environment<'static> {
        let mut env = Environment::new();
        env.add_function("tpl", tpl);
        env.add_function("has_api", has_api);
        env.add_function("require_api", require_api);
        env
    }

    #[test]
    fn test_dict() {
        let result = dict(vec![
            Value::from("key1"),
            Value::from("value1"),
            Value::from("key2"),
            Value::from(42),
        ])
        .unwrap();
        assert_eq!(result.get_attr("key1").unwrap().as_str(), Some("value1"));

        assert!(dict(vec![Value::from("odd")]).is_err());
        assert!(dict(vec![Value::from(1), Value::from(2)]).is_err());
    }

    #[test]
    fn test_get_and_coalesce() {
        let obj = Value::from_serialize(serde_json::json!({"a": 1, "b": null}));
        assert_eq!(get(obj.clone(), "a".to_string(), None).as_i64(), Some(1));
        assert_eq!(
            get(obj, "b".to_string(), Some(Value::from("fallback"))).as_str(),
            Some("fallback")
        );

        let first = coalesce(vec![Value::UNDEFINED, Value::from(""), Value::from("x")]);
        assert_eq!(first.as_str(), Some("x"));
        assert!(coalesce(vec![Value::from(())]).is_undefined());
    }

    #[test]
    fn test_ternary() {
        assert_eq!(
            ternary(Value::from("yes"), Value::from("no"), Value::from(true)).as_str(),
            Some("yes")
        );
        assert_eq!(
            ternary(Value::from("yes"), Value::from("no"), Value::from(false)).as_str(),
            Some("no")
        );
    }

    #[test]
    fn test_conversions() {
        assert_eq!(tostring(Value::from(42)), "42");
        assert_eq!(tostring(Value::from("s")), "s");
        assert_eq!(toint(Value::from(" 7 ")).unwrap(), 7);
        assert!(toint(Value::from("seven")).is_err());
    }

    #[test]
    fn test_printf() {
        let out = printf(
            "%s-%d %q 100%%".to_string(),
            vec![Value::from("web"), Value::from(3), Value::from("x")],
        )
        .unwrap();
        assert_eq!(out, "web-3 \"x\" 100%");

        assert!(printf("%s %s".to_string(), vec![Value::from("a")]).is_err());
    }

    #[test]
    fn test_fail_is_explicit() {
        let err = fail("boom".to_string()).unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_tpl_uses_caller_context() {
        let env = env();
        let out = env
            .render_str(
                "{{ tpl(values.host) }}",
                minijinja::context! {
                    values => serde_json::json!({"host": "{{ release.name }}.example.com"}),
                    release => serde_json::json!({"name": "web"}),
                },
            )
            .unwrap();
        assert_eq!(out, "web.example.com");
    }

    #[test]
    fn test_tpl_explicit_context_and_plain_string() {
        let env = env();
        let out = env
            .render_str(
                r#"{{ tpl(t, {"a": 1}) }}|{{ tpl("plain") }}"#,
                minijinja::context! { t => "{{ a }}" },
            )
            .unwrap();
        assert_eq!(out, "1|plain");
    }

    #[test]
    fn test_tpl_recursion_is_bounded() {
        let env = env();
        let err = env
            .render_str(
                "{{ tpl(values.loop) }}",
                minijinja::context! {
                    values => serde_json::json!({"loop": "{{ tpl(values.loop) }}"}),
                },
            )
            .unwrap_err();
        assert!(format!("{:#}", err).contains("exceeds maximum"));
        TPL_DEPTH.with(|d| assert_eq!(d.get(), 0));
    }

    #[test]
    fn test_has_api() {
        let env = env();
        let caps = Capabilities::default().with_api_version("monitoring.coreos.com/v1");
        let ctx = minijinja::context! { capabilities => caps };

        let out = env
            .render_str(
                r#"{{ has_api("monitoring.coreos.com/v1/ServiceMonitor") }} {{ has_api("example.com/v9") }}"#,
                ctx.clone(),
            )
            .unwrap();
        assert_eq!(out, "true false");

        let err = env
            .render_str(r#"{{ require_api("example.com/v9", "need example") }}"#, ctx)
            .unwrap_err();
        assert!(err.to_string().contains("need example"));
    }

    #[test]
    fn test_semver_compare() {
        assert!(semver_compare(">=1.25.0".to_string(), "v1.28.0".to_string()).unwrap());
        assert!(!semver_compare("<1.25.0".to_string(), "v1.28.0".to_string()).unwrap());
    }

    #[test]
    fn test_seeded_values_are_stable() {
        let a = seeded_uuid("web-token".to_string());
        assert_eq!(a, seeded_uuid("web-token".to_string()));
        assert_ne!(a, seeded_uuid("other".to_string()));
        assert_eq!(a.len(), 36);
        assert_eq!(&a[14..15], "4");

        let s = seeded_alnum(24, "db".to_string());
        assert_eq!(s.len(), 24);
        assert!(s.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_eq!(s, seeded_alnum(24, "db".to_string()));
    }
}
