//! Chart tree renderer
//!
//! Walks the root chart and every enabled subchart scope, renders each scope
//! against its own values, then classifies the rendered documents into
//! manifests and hooks.

use keel_core::{Capabilities, Chart, ChartKind, ReleaseInfo, ScopedValues, TemplateContext};

use crate::engine::Engine;
use crate::error::{EngineError, RenderReport, Result, TemplateError};
use crate::output::RenderedOutput;

/// Renderer configuration
#[derive(Debug, Clone)]
pub struct RendererConfig {
    /// Maximum subchart nesting depth
    pub max_depth: usize,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self { max_depth: 10 }
    }
}

impl RendererConfig {
    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }
}

/// Renders a chart and its subcharts
#[derive(Debug, Clone, Default)]
pub struct ChartRenderer {
    engine: Engine,
    config: RendererConfig,
}

struct Collected {
    rendered: Vec<(String, String)>,
    notes: Option<String>,
    report: RenderReport,
}

impl ChartRenderer {
    pub fn new(engine: Engine) -> Self {
        Self {
            engine,
            config: RendererConfig::default(),
        }
    }

    pub fn with_config(engine: Engine, config: RendererConfig) -> Self {
        Self { engine, config }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Render the chart tree
    ///
    /// `values` is the composed scope tree for `chart`; only subcharts present
    /// in it are rendered. Every per-template failure is collected and
    /// returned together as [`EngineError::RenderAggregate`].
    pub fn render(
        &self,
        chart: &Chart,
        values: &ScopedValues,
        release: &ReleaseInfo,
        capabilities: &Capabilities,
    ) -> Result<RenderedOutput> {
        self.check_kube_version(chart, values, capabilities)?;

        let mut collected = Collected {
            rendered: Vec::new(),
            notes: None,
            report: RenderReport::new(),
        };
        self.walk(chart, values, release, capabilities, "", 0, &mut collected);

        let mut output = RenderedOutput {
            notes: collected.notes,
            ..RenderedOutput::default()
        };
        let mut report = collected.report;
        for (path, text) in &collected.rendered {
            if let Err(message) = output.add_template(path, text) {
                report.add_error(path.clone(), TemplateError::simple(message));
            }
        }

        if report.has_errors() {
            tracing::warn!(
                chart = %chart.reference(),
                summary = %report.summary(),
                "chart rendering failed"
            );
            return Err(EngineError::RenderAggregate(report));
        }

        for warning in &report.warnings {
            tracing::warn!(chart = %chart.reference(), "{}", warning);
        }
        tracing::debug!(
            chart = %chart.reference(),
            documents = output.files.len(),
            hooks = output.hooks().len(),
            "chart rendered"
        );
        Ok(output)
    }

    /// Every scope's `kubeVersion` range must admit the cluster version
    fn check_kube_version(
        &self,
        chart: &Chart,
        values: &ScopedValues,
        capabilities: &Capabilities,
    ) -> Result<()> {
        if !chart.metadata.supports_kube_version(&capabilities.kube_version)? {
            return Err(EngineError::IncompatibleKubeVersion {
                chart: chart.reference(),
                range: chart.metadata.kube_version.clone().unwrap_or_default(),
                version: capabilities.kube_version.version.clone(),
            });
        }
        for (name, scope) in &values.children {
            if let Some(child) = chart.subchart(name) {
                self.check_kube_version(child, scope, capabilities)?;
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn walk(
        &self,
        chart: &Chart,
        values: &ScopedValues,
        release: &ReleaseInfo,
        capabilities: &Capabilities,
        prefix: &str,
        depth: usize,
        collected: &mut Collected,
    ) {
        if depth > self.config.max_depth {
            collected.report.add_error(
                prefix.to_string(),
                TemplateError::simple(format!(
                    "subchart nesting exceeds maximum depth {}",
                    self.config.max_depth
                )),
            );
            return;
        }

        let libraries: Vec<(&str, &Chart)> = values
            .children
            .keys()
            .filter_map(|name| chart.subchart(name).map(|c| (name.as_str(), c)))
            .filter(|(_, c)| c.metadata.kind == ChartKind::Library)
            .collect();

        if chart.metadata.kind == ChartKind::Application {
            let context = TemplateContext::new(values.values.clone(), release.clone(), &chart.metadata)
                .with_capabilities(capabilities.clone())
                .with_template("", prefix.trim_end_matches('/'));

            let scope = self.engine.render_scope(chart, &context, prefix, &libraries);
            collected.rendered.extend(scope.rendered);
            collected.report.absorb(scope.report);
            // Only the root chart's notes are shown
            if depth == 0 {
                collected.notes = scope.notes;
            }
        }

        for (name, child_values) in &values.children {
            let Some(child) = chart.subchart(name) else {
                collected
                    .report
                    .add_warning(format!("subchart '{}{}' has values but no chart", prefix, name));
                continue;
            };
            if child.metadata.kind == ChartKind::Library {
                continue;
            }
            let child_prefix = format!("{}{}/", prefix, name);
            self.walk(
                child,
                child_values,
                release,
                capabilities,
                &child_prefix,
                depth + 1,
                collected,
            );
        }

        for name in &values.missing {
            collected.report.add_error(
                format!("{}{}", prefix, name),
                TemplateError::simple(format!(
                    "dependency '{}' of chart '{}' is enabled but its chart is not present; build dependencies first",
                    name,
                    chart.name()
                )),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::{
        ChartMetadata, Dependency, GatingPolicy, KubeVersion, ValueCompositor, ValueLayer, Values,
    };
    use semver::Version;

    use crate::annotations::HookEvent;
    use crate::output::RenderedFile;

    fn chart() -> Chart {
        let db = Chart::new(ChartMetadata::new("postgres", Version::new(12, 0, 0)))
            .with_values(Values::from_yaml("port: 5432").unwrap())
            .with_file("init.sql", "create table t();")
            .with_template(
                "statefulset.yaml",
                "kind: StatefulSet\nmetadata:\n  name: {{ release.name }}-db\nport: {{ values.port }}\nsql: {{ files.exists(\"init.sql\") }}\n",
            );

        Chart::new(ChartMetadata::new("web", Version::new(1, 0, 0)))
            .with_values(Values::from_yaml("replicas: 1\nimage: x\ndb:\n  enabled: true").unwrap())
            .with_dependency(
                Dependency::new("postgres", "^12", "repo")
                    .with_alias("db")
                    .with_condition("db.enabled"),
            )
            .with_subchart("db", db)
            .with_template(
                "deployment.yaml",
                "kind: Deployment\nmetadata:\n  name: {{ release.name }}\nreplicas: {{ values.replicas }}\nimage: {{ values.image }}\n",
            )
            .with_template(
                "migrate.yaml",
                "kind: Job\nmetadata:\n  name: migrate\n  annotations:\n    keel.sh/hook: pre-upgrade,pre-install\n",
            )
            .with_template("NOTES.txt", "Visit {{ release.name }}")
    }

    fn render(chart: &Chart, overrides: &[&str]) -> Result<RenderedOutput> {
        let overrides: Vec<String> = overrides.iter().map(|s| s.to_string()).collect();
        let layers = vec![ValueLayer::inline(&overrides).unwrap()];
        let scoped = ValueCompositor::new(GatingPolicy::default()).compose(chart, &layers);
        ChartRenderer::default().render(
            chart,
            &scoped,
            &ReleaseInfo::for_install("shop", "prod"),
            &Capabilities::default(),
        )
    }

    #[test]
    fn test_render_tree() {
        let output = render(&chart(), &["replicas=2"]).unwrap();

        let keys: Vec<_> = output.files.keys().cloned().collect();
        assert_eq!(keys, vec!["deployment.yaml", "migrate.yaml", "db/statefulset.yaml"]);
        assert!(output.files["deployment.yaml"].content().contains("replicas: 2\nimage: x"));
        assert!(output.files["db/statefulset.yaml"].content().contains("port: 5432\nsql: true"));
        assert_eq!(output.notes.as_deref(), Some("Visit shop"));

        let hooks = output.hooks_for(HookEvent::PreInstall);
        assert_eq!(hooks.len(), 1);
        assert_eq!(hooks[0].meta.name, "migrate");
        assert!(matches!(output.files["migrate.yaml"], RenderedFile::Hook { .. }));
    }

    #[test]
    fn test_manifest_stream_snapshot() {
        let output = render(&chart(), &["replicas=2"]).unwrap();
        insta::assert_snapshot!(output.manifest(), @r"
---
# Source: deployment.yaml
kind: Deployment
metadata:
  name: shop
replicas: 2
image: x
---
# Source: db/statefulset.yaml
kind: StatefulSet
metadata:
  name: shop-db
port: 5432
sql: true
");
    }

    #[test]
    fn test_render_is_deterministic() {
        let first = render(&chart(), &["replicas=3"]).unwrap();
        let second = render(&chart(), &["replicas=3"]).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.manifest(), second.manifest());
    }

    #[test]
    fn test_disabled_subchart_not_rendered() {
        let output = render(&chart(), &["db.enabled=false"]).unwrap();
        assert!(!output.files.contains_key("db/statefulset.yaml"));
    }

    #[test]
    fn test_enabled_dependency_without_chart_fails() {
        let mut chart = chart();
        chart.subcharts.remove("db");

        let err = render(&chart, &[]).unwrap_err();
        let EngineError::RenderAggregate(report) = err else {
            panic!("expected aggregate error, got {err:?}");
        };
        assert!(report.failures().iter().any(|f| f.contains("dependency 'db'")));

        // Gated out, the absent chart is not needed
        assert!(render(&chart, &["db.enabled=false"]).is_ok());
    }

    #[test]
    fn test_render_aggregates_failures() {
        let chart = chart()
            .with_template("broken.yaml", "{{ values.nope.deeper }}")
            .with_template("syntax.yaml", "{% if %}")
            .with_template("fails.yaml", "{{ fail(\"stop here\") }}");

        let err = render(&chart, &[]).unwrap_err();
        let EngineError::RenderAggregate(report) = err else {
            panic!("expected aggregate error, got {err:?}");
        };
        assert_eq!(report.total_errors, 3);
        assert!(report.failures().iter().any(|f| f.contains("stop here")));
    }

    #[test]
    fn test_require_api_fails_only_when_reached() {
        let chart = chart()
            .with_template(
                "monitor.yaml",
                "{% if values.monitoring %}{{ require_api(\"monitoring.coreos.com/v1\") }}{% endif %}",
            );
        assert!(render(&chart, &["monitoring=false"]).is_ok());
        assert!(render(&chart, &["monitoring=true"]).is_err());
    }

    #[test]
    fn test_invalid_yaml_output_is_a_render_failure() {
        let chart = chart().with_template("bad.yaml", "key: [unclosed");
        let Err(EngineError::RenderAggregate(report)) = render(&chart, &[]) else {
            panic!("expected aggregate error");
        };
        assert!(report.errors_by_template.contains_key("bad.yaml"));
    }

    #[test]
    fn test_kube_version_gate() {
        let mut chart = chart();
        chart.metadata.kube_version = Some(">=1.30.0".to_string());
        let scoped = ValueCompositor::default().compose(&chart, &[]);

        let err = ChartRenderer::default()
            .render(
                &chart,
                &scoped,
                &ReleaseInfo::for_install("shop", "prod"),
                &Capabilities::new(KubeVersion::new("1.28.0")),
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::IncompatibleKubeVersion { .. }));
    }

    #[test]
    fn test_library_subchart_is_importable_not_emitted() {
        let common = Chart::new({
            let mut meta = ChartMetadata::new("common", Version::new(1, 0, 0));
            meta.kind = ChartKind::Library;
            meta
        })
        .with_template("_names.tpl", "{% macro name(r) %}{{ r.name }}-x{% endmacro %}")
        .with_template("ignored.yaml", "kind: Nope");

        let chart = chart().with_subchart("common", common).with_template(
            "svc.yaml",
            "{% from \"common/_names.tpl\" import name %}kind: Service\nmetadata:\n  name: {{ name(release) }}",
        );

        let output = render(&chart, &[]).unwrap();
        assert!(output.files["svc.yaml"].content().contains("name: shop-x"));
        assert!(!output.files.keys().any(|k| k.starts_with("common/")));
    }
}
