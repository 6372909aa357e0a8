//! Hook annotations
//!
//! Keel reads `keel.sh/*` annotations and falls back to `helm.sh/*` so that
//! existing charts keep their hooks.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Keel-native annotations
pub mod keel {
    pub const HOOK: &str = "keel.sh/hook";
    pub const HOOK_WEIGHT: &str = "keel.sh/hook-weight";
    pub const HOOK_DELETE_POLICY: &str = "keel.sh/hook-delete-policy";
    /// Per-hook timeout (`30s`, `5m`, `1h`)
    pub const HOOK_TIMEOUT: &str = "keel.sh/hook-timeout";
}

/// Helm-compatible annotations
pub mod helm {
    pub const HOOK: &str = "helm.sh/hook";
    pub const HOOK_WEIGHT: &str = "helm.sh/hook-weight";
    pub const HOOK_DELETE_POLICY: &str = "helm.sh/hook-delete-policy";
}

/// Lifecycle event a hook is attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[non_exhaustive]
pub enum HookEvent {
    PreInstall,
    PostInstall,
    PreUpgrade,
    PostUpgrade,
    PreRollback,
    PostRollback,
    PreDelete,
    PostDelete,
    Test,
}

impl HookEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PreInstall => "pre-install",
            Self::PostInstall => "post-install",
            Self::PreUpgrade => "pre-upgrade",
            Self::PostUpgrade => "post-upgrade",
            Self::PreRollback => "pre-rollback",
            Self::PostRollback => "post-rollback",
            Self::PreDelete => "pre-delete",
            Self::PostDelete => "post-delete",
            Self::Test => "test",
        }
    }
}

impl std::fmt::Display for HookEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for HookEvent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim() {
            "pre-install" => Self::PreInstall,
            "post-install" => Self::PostInstall,
            "pre-upgrade" => Self::PreUpgrade,
            "post-upgrade" => Self::PostUpgrade,
            "pre-rollback" => Self::PreRollback,
            "post-rollback" => Self::PostRollback,
            "pre-delete" => Self::PreDelete,
            "post-delete" => Self::PostDelete,
            "test" | "test-success" => Self::Test,
            other => return Err(format!("unknown hook event '{}'", other)),
        })
    }
}

/// When a hook object is deleted
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeletePolicy {
    /// Delete any previous object of the same name before creating the hook
    BeforeHookCreation,
    /// Delete after the hook succeeded
    HookSucceeded,
    /// Delete after the hook failed
    HookFailed,
}

impl std::str::FromStr for DeletePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "before-hook-creation" => Ok(Self::BeforeHookCreation),
            "hook-succeeded" => Ok(Self::HookSucceeded),
            "hook-failed" => Ok(Self::HookFailed),
            other => Err(format!("unknown hook delete policy '{}'", other)),
        }
    }
}

/// Hook metadata read from a rendered document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookMeta {
    /// `metadata.name` of the hook object
    pub name: String,
    /// `kind` of the hook object
    pub kind: String,
    pub events: Vec<HookEvent>,
    #[serde(default)]
    pub weight: i32,
    /// Empty means `before-hook-creation`
    #[serde(default)]
    pub delete_policies: Vec<DeletePolicy>,
    /// Overrides the scheduler's default timeout
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
}

impl HookMeta {
    pub fn runs_on(&self, event: HookEvent) -> bool {
        self.events.contains(&event)
    }

    /// Whether `policy` applies, with `before-hook-creation` as the default
    pub fn has_delete_policy(&self, policy: DeletePolicy) -> bool {
        if self.delete_policies.is_empty() {
            return policy == DeletePolicy::BeforeHookCreation;
        }
        self.delete_policies.contains(&policy)
    }
}

/// Get annotation value, preferring Keel over Helm
pub fn get_annotation<'a>(
    annotations: &'a BTreeMap<String, String>,
    keel_key: &str,
    helm_key: &str,
) -> Option<&'a str> {
    annotations
        .get(keel_key)
        .or_else(|| annotations.get(helm_key))
        .map(String::as_str)
}

/// Parse a duration such as `500ms`, `30s`, `5m` or `1h` (bare numbers are seconds)
pub fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    let (number, unit) = if let Some(n) = value.strip_suffix("ms") {
        (n, 1)
    } else if let Some(n) = value.strip_suffix('s') {
        (n, 1_000)
    } else if let Some(n) = value.strip_suffix('m') {
        (n, 60_000)
    } else if let Some(n) = value.strip_suffix('h') {
        (n, 3_600_000)
    } else {
        (value, 1_000)
    };
    let number: u64 = number.trim().parse().ok()?;
    Some(Duration::from_millis(number.checked_mul(unit)?))
}

/// Read hook metadata from a document's annotations
///
/// Returns `Ok(None)` for ordinary manifests.
pub fn parse_hook(
    name: &str,
    kind: &str,
    annotations: &BTreeMap<String, String>,
) -> Result<Option<HookMeta>, String> {
    let Some(events) = get_annotation(annotations, keel::HOOK, helm::HOOK) else {
        return Ok(None);
    };

    let events = split_list(events)
        .map(str::parse)
        .collect::<Result<Vec<HookEvent>, _>>()?;
    if events.is_empty() {
        return Err(format!("hook '{}' declares no events", name));
    }

    let weight = match get_annotation(annotations, keel::HOOK_WEIGHT, helm::HOOK_WEIGHT) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| format!("invalid hook weight '{}' on '{}'", raw, name))?,
        None => 0,
    };

    let mut delete_policies = match get_annotation(
        annotations,
        keel::HOOK_DELETE_POLICY,
        helm::HOOK_DELETE_POLICY,
    ) {
        Some(raw) => split_list(raw)
            .map(str::parse)
            .collect::<Result<Vec<DeletePolicy>, _>>()?,
        None => Vec::new(),
    };
    delete_policies.sort();
    delete_policies.dedup();

    let timeout = match annotations.get(keel::HOOK_TIMEOUT) {
        Some(raw) => Some(
            parse_duration(raw)
                .ok_or_else(|| format!("invalid hook timeout '{}' on '{}'", raw, name))?,
        ),
        None => None,
    };

    Ok(Some(HookMeta {
        name: name.to_string(),
        kind: kind.to_string(),
        events,
        weight,
        delete_policies,
        timeout,
    }))
}

fn split_list(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(',').map(str::trim).filter(|s| !s.is_empty())
}
