//! Condition and tag gating for dependencies
//!
//! A dependency can be switched off statically (`enabled: false`), by a
//! `condition` (comma-separated value paths, first resolvable path decides),
//! or by `tags` (looked up under `tags.<name>` in the parent's values).
//! How the two combine is a [`GatingPolicy`]; the default mirrors the
//! established chart ecosystem: a resolvable condition overrides tags, any
//! enabled tag includes the dependency, and an ungated dependency is included.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::chart::{Dependency, ResolvePolicy};
use crate::values::Values;

/// How condition and tag outcomes combine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GatePrecedence {
    /// A resolvable condition decides; tags are consulted only otherwise
    #[default]
    ConditionFirst,
    /// Set tags decide; the condition is consulted only otherwise
    TagsFirst,
    /// Every resolvable gate must pass
    AllMustPass,
}

/// How several tags on one dependency combine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TagMode {
    /// Included when any set tag is true
    #[default]
    Any,
    /// Included only when every set tag is true
    All,
}

/// Outcome when neither condition nor tags resolve against the values
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnsetGate {
    #[default]
    Include,
    Exclude,
}

/// Configurable gating policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatingPolicy {
    #[serde(default)]
    pub precedence: GatePrecedence,
    #[serde(default)]
    pub tag_mode: TagMode,
    #[serde(default)]
    pub when_unset: UnsetGate,
}

/// Why a dependency was excluded
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// `enabled: false` in the declaration
    StaticDisabled,
    /// `resolve: never`, the chart must be vendored
    PolicyNever,
    /// Condition evaluated to false
    ConditionFalse { condition: String },
    /// Tags evaluated to false
    TagsFalse { tags: Vec<String> },
    /// Nothing resolved and the policy excludes unset gates
    Unset,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StaticDisabled => write!(f, "disabled (enabled: false)"),
            Self::PolicyNever => write!(f, "resolve policy is 'never'"),
            Self::ConditionFalse { condition } => {
                write!(f, "condition '{}' is false", condition)
            }
            Self::TagsFalse { tags } => write!(f, "tags [{}] are false", tags.join(", ")),
            Self::Unset => write!(f, "no condition or tag set"),
        }
    }
}

/// Result of gating a single dependency
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Include,
    Exclude(SkipReason),
}

impl GateDecision {
    pub fn is_included(&self) -> bool {
        matches!(self, Self::Include)
    }
}

impl GatingPolicy {
    pub fn with_precedence(mut self, precedence: GatePrecedence) -> Self {
        self.precedence = precedence;
        self
    }

    pub fn with_tag_mode(mut self, tag_mode: TagMode) -> Self {
        self.tag_mode = tag_mode;
        self
    }

    pub fn with_when_unset(mut self, when_unset: UnsetGate) -> Self {
        self.when_unset = when_unset;
        self
    }

    /// Decide whether a dependency takes part in rendering
    ///
    /// `parent_values` is the merged value tree of the declaring chart.
    pub fn evaluate(&self, dependency: &Dependency, parent_values: &Values) -> GateDecision {
        if !dependency.enabled {
            return GateDecision::Exclude(SkipReason::StaticDisabled);
        }

        let condition = dependency
            .condition
            .as_deref()
            .and_then(|c| evaluate_condition(c, parent_values).map(|v| (c, v)));
        let tags = self.evaluate_tags(&dependency.tags, parent_values);

        let condition_outcome = condition.map(|(c, passed)| {
            if passed {
                GateDecision::Include
            } else {
                GateDecision::Exclude(SkipReason::ConditionFalse {
                    condition: c.to_string(),
                })
            }
        });
        let tag_outcome = tags.map(|passed| {
            if passed {
                GateDecision::Include
            } else {
                GateDecision::Exclude(SkipReason::TagsFalse {
                    tags: dependency.tags.clone(),
                })
            }
        });

        let decided = match self.precedence {
            GatePrecedence::ConditionFirst => condition_outcome.or(tag_outcome),
            GatePrecedence::TagsFirst => tag_outcome.or(condition_outcome),
            GatePrecedence::AllMustPass => match (condition_outcome, tag_outcome) {
                (None, None) => None,
                (Some(GateDecision::Exclude(r)), _) | (_, Some(GateDecision::Exclude(r))) => {
                    Some(GateDecision::Exclude(r))
                }
                _ => Some(GateDecision::Include),
            },
        };

        decided.unwrap_or(match self.when_unset {
            UnsetGate::Include => GateDecision::Include,
            UnsetGate::Exclude => GateDecision::Exclude(SkipReason::Unset),
        })
    }

    /// Decide whether a dependency should be fetched during resolution
    ///
    /// `resolve: always` bypasses value gating here (but not `enabled: false`).
    pub fn should_resolve(&self, dependency: &Dependency, parent_values: &Values) -> GateDecision {
        if !dependency.enabled {
            return GateDecision::Exclude(SkipReason::StaticDisabled);
        }
        match dependency.resolve {
            ResolvePolicy::Always => GateDecision::Include,
            ResolvePolicy::Never => GateDecision::Exclude(SkipReason::PolicyNever),
            ResolvePolicy::WhenEnabled => self.evaluate(dependency, parent_values),
        }
    }

    /// `None` when no tag has a value set
    fn evaluate_tags(&self, tags: &[String], values: &Values) -> Option<bool> {
        let set: Vec<bool> = tags
            .iter()
            .filter_map(|tag| {
                let JsonValue::Object(map) = values.inner().get("tags")? else {
                    return None;
                };
                map.get(tag).map(is_truthy)
            })
            .collect();

        if set.is_empty() {
            return None;
        }
        Some(match self.tag_mode {
            TagMode::Any => set.iter().any(|v| *v),
            TagMode::All => set.iter().all(|v| *v),
        })
    }
}

/// Evaluate a comma-separated condition; `None` when no path resolves
pub fn evaluate_condition(condition: &str, values: &Values) -> Option<bool> {
    condition
        .split(',')
        .map(str::trim)
        .filter(|path| !path.is_empty())
        .find_map(|path| values.get(path))
        .map(is_truthy)
}

/// Truthiness used by conditions and tags
pub fn is_truthy(value: &JsonValue) -> bool {
    match value {
        JsonValue::Bool(b) => *b,
        JsonValue::Null => false,
        JsonValue::String(s) => !s.is_empty() && s != "false" && s != "0",
        JsonValue::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        JsonValue::Array(a) => !a.is_empty(),
        JsonValue::Object(o) => !o.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dep() -> Dependency {
        Dependency::new("redis", "^7", "repo")
    }

    fn values(yaml: &str) -> Values {
        Values::from_yaml(yaml).unwrap()
    }

    #[test]
    fn test_truthiness() {
        assert!(is_truthy(&json!(true)));
        assert!(!is_truthy(&json!(null)));
        assert!(!is_truthy(&json!("")));
        assert!(!is_truthy(&json!("false")));
        assert!(!is_truthy(&json!("0")));
        assert!(is_truthy(&json!("yes")));
        assert!(!is_truthy(&json!(0)));
        assert!(is_truthy(&json!(1.5)));
        assert!(!is_truthy(&json!([])));
        assert!(is_truthy(&json!({"a": 1})));
    }

    #[test]
    fn test_condition_first_resolvable_path_decides() {
        let v = values("global:\n  redis:\n    enabled: false\n");
        assert_eq!(evaluate_condition("redis.enabled, global.redis.enabled", &v), Some(false));
        assert_eq!(evaluate_condition("redis.enabled", &v), None);
    }

    #[test]
    fn test_ungated_included_by_default() {
        let policy = GatingPolicy::default();
        assert!(policy.evaluate(&dep(), &Values::new()).is_included());

        let strict = policy.with_when_unset(UnsetGate::Exclude);
        assert_eq!(
            strict.evaluate(&dep(), &Values::new()),
            GateDecision::Exclude(SkipReason::Unset)
        );
    }

    #[test]
    fn test_static_disabled_always_wins() {
        let mut d = dep();
        d.enabled = false;
        d.resolve = ResolvePolicy::Always;
        let v = values("redis:\n  enabled: true\n");

        let policy = GatingPolicy::default();
        assert_eq!(policy.evaluate(&d, &v), GateDecision::Exclude(SkipReason::StaticDisabled));
        assert_eq!(policy.should_resolve(&d, &v), GateDecision::Exclude(SkipReason::StaticDisabled));
    }

    #[test]
    fn test_condition_overrides_tags_by_default() {
        let d = dep().with_condition("redis.enabled").with_tags(&["cache"]);
        let v = values("redis:\n  enabled: false\ntags:\n  cache: true\n");

        let decision = GatingPolicy::default().evaluate(&d, &v);
        assert!(matches!(decision, GateDecision::Exclude(SkipReason::ConditionFalse { .. })));

        let tags_first = GatingPolicy::default().with_precedence(GatePrecedence::TagsFirst);
        assert!(tags_first.evaluate(&d, &v).is_included());

        let all = GatingPolicy::default().with_precedence(GatePrecedence::AllMustPass);
        assert!(!all.evaluate(&d, &v).is_included());
    }

    #[test]
    fn test_tags_used_when_condition_unresolved() {
        let d = dep().with_condition("redis.enabled").with_tags(&["cache"]);
        let v = values("tags:\n  cache: false\n");

        assert!(matches!(
            GatingPolicy::default().evaluate(&d, &v),
            GateDecision::Exclude(SkipReason::TagsFalse { .. })
        ));
    }

    #[test]
    fn test_tag_modes() {
        let d = dep().with_tags(&["cache", "backend"]);
        let v = values("tags:\n  cache: true\n  backend: false\n");

        assert!(GatingPolicy::default().evaluate(&d, &v).is_included());
        assert!(
            !GatingPolicy::default()
                .with_tag_mode(TagMode::All)
                .evaluate(&d, &v)
                .is_included()
        );
    }

    #[test]
    fn test_should_resolve_policies() {
        let policy = GatingPolicy::default();
        let off = values("redis:\n  enabled: false\n");

        let mut always = dep().with_condition("redis.enabled");
        always.resolve = ResolvePolicy::Always;
        assert!(policy.should_resolve(&always, &off).is_included());
        assert!(!policy.evaluate(&always, &off).is_included());

        let mut never = dep();
        never.resolve = ResolvePolicy::Never;
        assert_eq!(
            policy.should_resolve(&never, &Values::new()),
            GateDecision::Exclude(SkipReason::PolicyNever)
        );

        let when_enabled = dep().with_condition("redis.enabled");
        assert!(!policy.should_resolve(&when_enabled, &off).is_included());
    }

    #[test]
    fn test_policy_deserializes_from_yaml() {
        let policy: GatingPolicy =
            serde_yaml::from_str("precedence: tags-first\ntagMode: all\nwhenUnset: exclude\n").unwrap();
        assert_eq!(policy.precedence, GatePrecedence::TagsFirst);
        assert_eq!(policy.tag_mode, TagMode::All);
        assert_eq!(policy.when_unset, UnsetGate::Exclude);
    }
}
