//! Hierarchical value composition
//!
//! Layers are merged bottom to top: chart defaults, then user value files,
//! then inline `--set` overrides. Each subchart then gets its own tree built
//! from its defaults, the parent's slice under its effective name, and the
//! parent's `global` section. Gated-out subcharts get no scope at all.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::chart::Chart;
use crate::error::Result;
use crate::gating::{GateDecision, GatingPolicy};
use crate::values::{Values, parse_set_values};

/// Where a value layer came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ValueSource {
    /// The chart's own `values.yaml`
    Defaults,
    /// Injected by the parent chart
    Parent,
    /// A user-supplied values file
    File { path: PathBuf },
    /// Inline `--set` overrides
    Inline,
}

impl fmt::Display for ValueSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Defaults => write!(f, "defaults"),
            Self::Parent => write!(f, "parent"),
            Self::File { path } => write!(f, "file:{}", path.display()),
            Self::Inline => write!(f, "set"),
        }
    }
}

/// One precedence layer of user values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueLayer {
    pub source: ValueSource,
    pub values: Values,
}

impl ValueLayer {
    /// Layer read from a YAML values file
    pub fn file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self {
            source: ValueSource::File {
                path: path.as_ref().to_path_buf(),
            },
            values: Values::from_file(path)?,
        })
    }

    /// Layer from `key=value` overrides
    pub fn inline(overrides: &[String]) -> Result<Self> {
        Ok(Self {
            source: ValueSource::Inline,
            values: parse_set_values(overrides)?,
        })
    }

    /// Layer from an already-parsed tree
    pub fn values(source: ValueSource, values: Values) -> Self {
        Self { source, values }
    }
}

/// Effective values of one chart scope and its enabled children
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopedValues {
    /// Effective name of the scope (root chart name for the root)
    pub name: String,
    /// Merged values seen by this scope's templates
    pub values: Values,
    /// Enabled subchart scopes keyed by effective name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub children: BTreeMap<String, ScopedValues>,
    /// Dependencies admitted by gating that have no chart attached
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing: Vec<String>,
}

impl ScopedValues {
    /// Look up a descendant scope by `/`-separated path (`db/metrics`)
    pub fn scope(&self, path: &str) -> Option<&ScopedValues> {
        path.split('/')
            .filter(|p| !p.is_empty())
            .try_fold(self, |scope, name| scope.children.get(name))
    }
}

/// Which layer supplied each leaf of the root tree
pub type Provenance = BTreeMap<String, ValueSource>;

/// Composes per-scope value trees for a chart
#[derive(Debug, Clone, Default)]
pub struct ValueCompositor {
    gating: GatingPolicy,
}

impl ValueCompositor {
    pub fn new(gating: GatingPolicy) -> Self {
        Self { gating }
    }

    pub fn gating(&self) -> &GatingPolicy {
        &self.gating
    }

    /// Merge the user layers into one tree (no chart defaults)
    pub fn user_values(layers: &[ValueLayer]) -> Values {
        Values::merge_all(layers.iter().map(|l| l.values.clone()).collect())
    }

    /// Compose the scope tree for `chart` with user layers on top of defaults
    pub fn compose(&self, chart: &Chart, layers: &[ValueLayer]) -> ScopedValues {
        let root = layers
            .iter()
            .fold(chart.values.clone(), |acc, layer| acc.merged(&layer.values));
        self.scope(chart, chart.name(), root, 0)
    }

    /// Compose and report, for every leaf of the root tree, its source layer
    pub fn compose_with_provenance(
        &self,
        chart: &Chart,
        layers: &[ValueLayer],
    ) -> (ScopedValues, Provenance) {
        let mut provenance = Provenance::new();
        record(&mut provenance, &chart.values, &ValueSource::Defaults);
        for layer in layers {
            record(&mut provenance, &layer.values, &layer.source);
        }
        (self.compose(chart, layers), provenance)
    }

    fn scope(&self, chart: &Chart, name: &str, values: Values, depth: usize) -> ScopedValues {
        let mut children = BTreeMap::new();

        // Same nesting bound as chart loading; deeper trees are never built
        if depth < 10 {
            for (child_name, child) in &chart.subcharts {
                if let Some(dependency) = chart.dependency(child_name)
                    && let GateDecision::Exclude(reason) = self.gating.evaluate(dependency, &values)
                {
                    tracing::debug!(subchart = %child_name, %reason, "subchart gated out");
                    continue;
                }

                let child_values = Values::for_subchart(&child.values, &values, child_name);
                children.insert(
                    child_name.clone(),
                    self.scope(child, child_name, child_values, depth + 1),
                );
            }
        }

        let missing = chart
            .missing_dependencies()
            .into_iter()
            .filter(|dependency| {
                matches!(self.gating.evaluate(dependency, &values), GateDecision::Include)
            })
            .map(|dependency| dependency.effective_name().to_string())
            .collect();

        ScopedValues {
            name: name.to_string(),
            values,
            children,
            missing,
        }
    }
}

/// Record a layer's leaves, dropping entries it replaces
fn record(provenance: &mut Provenance, values: &Values, source: &ValueSource) {
    for (path, _) in values.leaves() {
        let below = format!("{}.", path);
        provenance.retain(|existing, _| {
            !(existing.starts_with(&below) || path.starts_with(&format!("{}.", existing)))
        });
        provenance.insert(path, source.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chart::{ChartMetadata, Dependency};
    use semver::Version;

    fn chart(name: &str, defaults: &str) -> Chart {
        Chart::new(ChartMetadata::new(name, Version::new(1, 0, 0)))
            .with_values(Values::from_yaml(defaults).unwrap())
    }

    fn inline(items: &[&str]) -> ValueLayer {
        ValueLayer::inline(&items.iter().map(|s| s.to_string()).collect::<Vec<_>>()).unwrap()
    }

    #[test]
    fn test_user_overrides_defaults() {
        let web = chart("web", "replicas: 1\nimage: x\n");
        let layers = vec![ValueLayer::values(
            ValueSource::Inline,
            Values::from_yaml("replicas: 2").unwrap(),
        )];

        let scoped = ValueCompositor::default().compose(&web, &layers);
        assert_eq!(
            scoped.values,
            Values::from_yaml("replicas: 2\nimage: x\n").unwrap()
        );
    }

    #[test]
    fn test_later_layers_win() {
        let web = chart("web", "a: 1\nb: 1\nc: 1\n");
        let layers = vec![
            ValueLayer::values(
                ValueSource::File { path: "one.yaml".into() },
                Values::from_yaml("b: 2\nc: 2\n").unwrap(),
            ),
            inline(&["c=3"]),
        ];

        let scoped = ValueCompositor::default().compose(&web, &layers);
        assert_eq!(scoped.values.get("a").unwrap(), 1);
        assert_eq!(scoped.values.get("b").unwrap(), 2);
        assert_eq!(scoped.values.get("c").unwrap(), 3);
    }

    #[test]
    fn test_subchart_scope_and_globals() {
        let redis = chart("redis", "replicas: 1\nport: 6379\nglobal:\n  registry: local\n");
        let web = chart(
            "web",
            "global:\n  registry: docker.io\nredis:\n  replicas: 3\nother: 1\n",
        )
        .with_dependency(Dependency::new("redis", "^7", "repo"))
        .with_subchart("redis", redis);

        let scoped = ValueCompositor::default().compose(&web, &[inline(&["redis.port=7000"])]);
        let child = scoped.scope("redis").unwrap();

        assert_eq!(child.values.get("replicas").unwrap(), 3);
        assert_eq!(child.values.get("port").unwrap(), 7000);
        assert_eq!(child.values.get("global.registry").unwrap(), "docker.io");
        assert!(child.values.get("other").is_none());
    }

    #[test]
    fn test_aliased_subchart_scoped_by_alias() {
        let pg = chart("postgresql", "size: 1\n");
        let web = chart("web", "db:\n  size: 10\n")
            .with_dependency(Dependency::new("postgresql", "^15", "repo").with_alias("db"))
            .with_subchart("db", pg);

        let scoped = ValueCompositor::default().compose(&web, &[]);
        assert_eq!(scoped.scope("db").unwrap().values.get("size").unwrap(), 10);
        assert_eq!(scoped.scope("db").unwrap().name, "db");
    }

    #[test]
    fn test_gated_subchart_has_no_scope() {
        let redis = chart("redis", "replicas: 1\n");
        let web = chart("web", "redis:\n  enabled: true\n")
            .with_dependency(Dependency::new("redis", "^7", "repo").with_condition("redis.enabled"))
            .with_subchart("redis", redis);

        let compositor = ValueCompositor::default();
        assert!(compositor.compose(&web, &[]).scope("redis").is_some());

        let off = compositor.compose(&web, &[inline(&["redis.enabled=false"])]);
        assert!(off.scope("redis").is_none());
    }

    #[test]
    fn test_enabled_dependency_without_chart_is_missing() {
        let web = chart("web", "redis:\n  enabled: true\n")
            .with_dependency(Dependency::new("redis", "^7", "repo").with_condition("redis.enabled"));

        let compositor = ValueCompositor::default();
        assert_eq!(compositor.compose(&web, &[]).missing, vec!["redis"]);

        let off = compositor.compose(&web, &[inline(&["redis.enabled=false"])]);
        assert!(off.missing.is_empty());
    }

    #[test]
    fn test_nested_scopes() {
        let metrics = chart("metrics", "port: 9090\n");
        let db = chart("db", "metrics:\n  port: 9100\n").with_subchart("metrics", metrics);
        let web = chart("web", "global:\n  env: prod\n").with_subchart("db", db);

        let scoped = ValueCompositor::default().compose(&web, &[]);
        let leaf = scoped.scope("db/metrics").unwrap();
        assert_eq!(leaf.values.get("port").unwrap(), 9100);
        assert_eq!(leaf.values.get("global.env").unwrap(), "prod");
    }

    #[test]
    fn test_provenance() {
        let web = chart("web", "image:\n  repository: nginx\n  tag: '1'\nreplicas: 1\nextra: {a: 1}\n");
        let layers = vec![
            ValueLayer::values(
                ValueSource::File { path: "prod.yaml".into() },
                Values::from_yaml("image:\n  tag: '2'\n").unwrap(),
            ),
            inline(&["replicas=3", "extra=none"]),
        ];

        let (_, provenance) = ValueCompositor::default().compose_with_provenance(&web, &layers);

        assert_eq!(provenance["image.repository"], ValueSource::Defaults);
        assert_eq!(provenance["image.tag"].to_string(), "file:prod.yaml");
        assert_eq!(provenance["replicas"], ValueSource::Inline);
        assert_eq!(provenance["extra"], ValueSource::Inline);
        assert!(!provenance.contains_key("extra.a"));
    }
}
