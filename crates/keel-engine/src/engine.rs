//! Template engine based on MiniJinja

use minijinja::Environment;

use keel_core::{Chart, Files, TemplateContext, TemplateInfo};

use crate::error::{RenderReport, Result, TemplateError};
use crate::files_object::FilesObject;
use crate::filters;
use crate::functions;

/// Templates rendered for one chart scope
#[derive(Debug, Default)]
pub struct ScopeRender {
    /// `(output path, text)` in template order; empty output already dropped
    pub rendered: Vec<(String, String)>,

    /// Rendered `NOTES.txt`, if the scope has one
    pub notes: Option<String>,

    /// Failures of this scope
    pub report: RenderReport,
}

/// Template engine builder
pub struct EngineBuilder {
    strict_mode: bool,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self { strict_mode: true }
    }

    /// Set strict mode (fail on undefined variables)
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict_mode = strict;
        self
    }

    pub fn build(self) -> Engine {
        Engine::new(self.strict_mode)
    }
}

/// The template engine
#[derive(Debug, Clone)]
pub struct Engine {
    strict_mode: bool,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Engine {
    pub fn new(strict_mode: bool) -> Self {
        Self { strict_mode }
    }

    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Create a configured MiniJinja environment
    fn create_environment(&self) -> Environment<'static> {
        let mut env = Environment::new();

        env.set_undefined_behavior(if self.strict_mode {
            minijinja::UndefinedBehavior::Strict
        } else {
            minijinja::UndefinedBehavior::Lenient
        });
        env.set_keep_trailing_newline(true);
        // Manifests are YAML, never HTML
        env.set_auto_escape_callback(|_| minijinja::AutoEscape::None);

        env.add_filter("toyaml", filters::toyaml);
        env.add_filter("tojson", filters::tojson);
        env.add_filter("tojson_pretty", filters::tojson_pretty);
        env.add_filter("b64encode", filters::b64encode);
        env.add_filter("b64decode", filters::b64decode);
        env.add_filter("quote", filters::quote);
        env.add_filter("squote", filters::squote);
        env.add_filter("nindent", filters::nindent);
        env.add_filter("indent", filters::indent);
        env.add_filter("required", filters::required);
        env.add_filter("empty", filters::empty);
        env.add_filter("haskey", filters::haskey);
        env.add_filter("keys", filters::keys);
        env.add_filter("merge", filters::merge);
        env.add_filter("sha256", filters::sha256sum);
        env.add_filter("trunc", filters::trunc);
        env.add_filter("trimprefix", filters::trimprefix);
        env.add_filter("trimsuffix", filters::trimsuffix);
        env.add_filter("snakecase", filters::snakecase);
        env.add_filter("kebabcase", filters::kebabcase);
        env.add_filter("semver_match", filters::semver_match);

        env.add_function("fail", functions::fail);
        env.add_function("dict", functions::dict);
        env.add_function("list", functions::list);
        env.add_function("get", functions::get);
        env.add_function("coalesce", functions::coalesce);
        env.add_function("ternary", functions::ternary);
        env.add_function("tostring", functions::tostring);
        env.add_function("toint", functions::toint);
        env.add_function("printf", functions::printf);
        env.add_function("tpl", functions::tpl);
        env.add_function("has_api", functions::has_api);
        env.add_function("require_api", functions::require_api);
        env.add_function("semver_compare", functions::semver_compare);
        env.add_function("seeded_uuid", functions::seeded_uuid);
        env.add_function("seeded_alnum", functions::seeded_alnum);

        env
    }

    fn context_value(context: &TemplateContext, template: &TemplateInfo) -> minijinja::Value {
        minijinja::context! {
            values => &context.values,
            release => &context.release,
            chart => &context.chart,
            capabilities => &context.capabilities,
            template => template,
        }
    }

    /// Render a single template string
    pub fn render_string(
        &self,
        template: &str,
        context: &TemplateContext,
        template_name: &str,
    ) -> Result<String> {
        let env = self.create_environment();
        let info = TemplateInfo {
            name: template_name.to_string(),
            base_path: context.template.base_path.clone(),
        };

        env.render_named_str(template_name, template, Self::context_value(context, &info))
            .map_err(|e| {
                TemplateError::from_minijinja(&e, template_name, template, Some(&context.values))
                    .into()
            })
    }

    /// Render every template of one chart scope, collecting all failures
    ///
    /// `prefix` is prepended to output paths (`""` for the root chart,
    /// `"db/"` for a subchart). `libraries` are library subcharts whose
    /// templates become importable as `<name>/<path>`.
    pub fn render_scope(
        &self,
        chart: &Chart,
        context: &TemplateContext,
        prefix: &str,
        libraries: &[(&str, &Chart)],
    ) -> ScopeRender {
        let mut out = ScopeRender::default();
        let mut env = self.create_environment();
        env.add_global(
            "files",
            FilesObject::new(Files::for_chart(chart)).into_value(),
        );

        for (library, library_chart) in libraries {
            for (path, source) in &library_chart.templates {
                let name = format!("{}/{}", library, path);
                if let Err(e) = env.add_template_owned(name.clone(), source.clone()) {
                    out.report.add_error(
                        format!("{}{}", prefix, name),
                        TemplateError::from_minijinja(&e, &name, source, Some(&context.values)),
                    );
                }
            }
        }

        // Parse everything first so helpers are importable from any template
        let mut loaded = Vec::with_capacity(chart.templates.len());
        for (path, source) in &chart.templates {
            match env.add_template_owned(path.clone(), source.clone()) {
                Ok(()) => loaded.push((path, source)),
                Err(e) => out.report.add_error(
                    format!("{}{}", prefix, path),
                    TemplateError::from_minijinja(&e, path, source, Some(&context.values)),
                ),
            }
        }

        for (path, source) in loaded {
            let file_name = path.rsplit('/').next().unwrap_or(path);
            if file_name.starts_with('_') {
                continue;
            }
            let display = format!("{}{}", prefix, path);

            let info = TemplateInfo {
                name: display.clone(),
                base_path: prefix.trim_end_matches('/').to_string(),
            };
            let rendered = env
                .get_template(path)
                .and_then(|tmpl| tmpl.render(Self::context_value(context, &info)));

            match rendered {
                Ok(text) => {
                    out.report.add_success(display.clone());
                    if is_notes(file_name) {
                        out.notes = Some(text.trim().to_string());
                        continue;
                    }
                    let trimmed = text.trim();
                    if trimmed.is_empty() || trimmed == "---" {
                        continue;
                    }
                    out.rendered.push((output_name(&display), text));
                }
                Err(e) => out.report.add_error(
                    display.clone(),
                    TemplateError::from_minijinja(&e, &display, source, Some(&context.values)),
                ),
            }
        }

        tracing::debug!(
            chart = %chart.name(),
            scope = %prefix,
            rendered = out.rendered.len(),
            errors = out.report.total_errors,
            "rendered chart scope"
        );
        out
    }
}

fn is_notes(file_name: &str) -> bool {
    let name = file_name.strip_suffix(".j2").unwrap_or(file_name);
    name.eq_ignore_ascii_case("NOTES.txt")
}

/// Output path for a template (drops a `.j2` suffix)
fn output_name(path: &str) -> String {
    path.strip_suffix(".j2").unwrap_or(path).to_string()
}
