//! Engine error types with source-mapped diagnostics

use indexmap::IndexMap;
use miette::{Diagnostic, NamedSource, SourceSpan};
use thiserror::Error;

use crate::suggestions::{
    extract_quoted_name, suggest_undefined_variable, suggest_unknown_filter,
    suggest_unknown_function, suggest_values_path,
};

/// Main engine error type
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum EngineError {
    #[error("Template error: {0}")]
    Template(#[from] Box<TemplateError>),

    /// One or more templates failed; every failure is in the report
    #[error("Template rendering failed: {}", .0.summary())]
    RenderAggregate(RenderReport),

    #[error("Chart {chart} requires Kubernetes {range}, cluster is {version}")]
    IncompatibleKubeVersion {
        chart: String,
        range: String,
        version: String,
    },

    #[error("Filter error: {message}")]
    Filter { message: String },

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Core(#[from] keel_core::CoreError),
}

impl From<TemplateError> for EngineError {
    fn from(err: TemplateError) -> Self {
        Self::Template(Box::new(err))
    }
}

/// Error kind for categorizing template errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum TemplateErrorKind {
    UndefinedVariable,
    UnknownFilter,
    UnknownFunction,
    SyntaxError,
    TypeError,
    InvalidOperation,
    /// Raised by `fail`, `required` or `require_api`
    Explicit,
    Other,
}

impl TemplateErrorKind {
    /// Convert to a code string for diagnostics
    pub fn to_code_string(&self) -> &'static str {
        match self {
            Self::UndefinedVariable => "undefined_variable",
            Self::UnknownFilter => "unknown_filter",
            Self::UnknownFunction => "unknown_function",
            Self::SyntaxError => "syntax",
            Self::TypeError => "type",
            Self::InvalidOperation => "invalid_operation",
            Self::Explicit => "explicit",
            Self::Other => "render",
        }
    }
}

/// Template-specific error with source information
#[derive(Error, Debug, Diagnostic, Clone)]
#[error("{message}")]
#[diagnostic(code(keel::template::render))]
pub struct TemplateError {
    /// Error message
    pub message: String,

    /// Error kind for categorization
    pub kind: TemplateErrorKind,

    /// Template source code
    #[source_code]
    pub src: NamedSource<String>,

    /// Error location in source
    #[label("error occurred here")]
    pub span: Option<SourceSpan>,

    /// Suggestion for fixing the error
    #[help]
    pub suggestion: Option<String>,
}

impl TemplateError {
    /// Build from a MiniJinja error, using `values` for key suggestions
    pub fn from_minijinja(
        err: &minijinja::Error,
        template_name: &str,
        template_source: &str,
        values: Option<&serde_json::Value>,
    ) -> Self {
        let kind = categorize(err);
        let detailed = format!("{:#}", err);
        let expression = extract_expression_from_display(&detailed);

        let message = match (kind, &expression) {
            (TemplateErrorKind::UndefinedVariable, Some(expr)) => {
                format!("undefined variable `{}`", expr)
            }
            (TemplateErrorKind::Explicit, _) => err
                .detail()
                .map(String::from)
                .unwrap_or_else(|| err.to_string()),
            _ => err
                .to_string()
                .replace("invalid operation: ", "")
                .replace("syntax error: ", "")
                .replace("undefined value", "undefined variable"),
        };

        let span = err
            .line()
            .and_then(|line| calculate_span(template_source, line));

        Self {
            message,
            kind,
            src: NamedSource::new(template_name, template_source.to_string()),
            span,
            suggestion: suggestion_for(err, kind, expression.as_deref(), values),
        }
    }

    /// Create a simple error without source mapping
    pub fn simple(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: TemplateErrorKind::Other,
            src: NamedSource::new("<unknown>", String::new()),
            span: None,
            suggestion: None,
        }
    }

    /// Add a suggestion
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    /// Get the error kind
    pub fn kind(&self) -> TemplateErrorKind {
        self.kind
    }
}

fn categorize(err: &minijinja::Error) -> TemplateErrorKind {
    match err.kind() {
        minijinja::ErrorKind::UndefinedError => TemplateErrorKind::UndefinedVariable,
        minijinja::ErrorKind::UnknownFilter => TemplateErrorKind::UnknownFilter,
        minijinja::ErrorKind::UnknownFunction => TemplateErrorKind::UnknownFunction,
        minijinja::ErrorKind::SyntaxError => TemplateErrorKind::SyntaxError,
        minijinja::ErrorKind::NonPrimitive | minijinja::ErrorKind::NonKey => {
            TemplateErrorKind::TypeError
        }
        minijinja::ErrorKind::InvalidOperation
            if err.detail().is_some_and(|d| d.starts_with(EXPLICIT_PREFIX)) =>
        {
            TemplateErrorKind::Explicit
        }
        minijinja::ErrorKind::InvalidOperation => TemplateErrorKind::InvalidOperation,
        _ => TemplateErrorKind::Other,
    }
}

/// Prefix on errors raised deliberately by chart authors
pub(crate) const EXPLICIT_PREFIX: &str = "[chart] ";

/// Raise an author-requested failure from a filter or function
pub(crate) fn explicit_error(message: impl std::fmt::Display) -> minijinja::Error {
    minijinja::Error::new(
        minijinja::ErrorKind::InvalidOperation,
        format!("{}{}", EXPLICIT_PREFIX, message),
    )
}

/// Extract the expression on the marked line of MiniJinja's detailed display
///
/// ```text
///    8 >   typo: {{ value.app.name }}
///      i            ^^^^^^^^^ undefined value
/// ```
fn extract_expression_from_display(display: &str) -> Option<String> {
    let marked = display.lines().find(|line| {
        let trimmed = line.trim_start();
        trimmed.contains(" > ") || trimmed.starts_with("> ")
    })?;

    let start = marked.find("{{")?;
    let end = marked[start..].find("}}")?;
    let expr = marked[start + 2..start + end].trim();
    let head = expr.split('|').next().unwrap_or(expr).trim();
    (!head.is_empty()).then(|| head.to_string())
}

/// Extract the filter name on the marked line
fn extract_filter_from_display(display: &str) -> Option<String> {
    let marked = display.lines().find(|line| line.trim_start().contains(" > "))?;
    let start = marked.find("{{")?;
    let end = marked[start..].find("}}")?;
    let expr = &marked[start + 2..start + end];
    let filter = expr[expr.rfind('|')? + 1..].split_whitespace().next()?;
    let name = filter.split('(').next().unwrap_or(filter);
    (!name.is_empty()).then(|| name.to_string())
}

/// Calculate the source span for a given line number
fn calculate_span(source: &str, line_num: usize) -> Option<SourceSpan> {
    let mut offset = 0;
    for (index, line) in source.lines().enumerate() {
        if index + 1 == line_num {
            return Some(SourceSpan::new(offset.into(), line.len()));
        }
        offset += line.len() + 1;
    }
    None
}

fn suggestion_for(
    err: &minijinja::Error,
    kind: TemplateErrorKind,
    expression: Option<&str>,
    values: Option<&serde_json::Value>,
) -> Option<String> {
    let msg = err.to_string();
    match kind {
        TemplateErrorKind::UndefinedVariable => {
            let name = expression
                .map(String::from)
                .or_else(|| extract_quoted_name(&msg))?;
            if let Some(path) = name.strip_prefix("values.")
                && let Some(values) = values
                && let Some(hint) = suggest_values_path(path, values)
            {
                return Some(hint);
            }
            let available = values
                .and_then(|v| v.as_object())
                .map(|obj| obj.keys().cloned().collect::<Vec<_>>())
                .unwrap_or_default();
            suggest_undefined_variable(&name, &available).or_else(|| {
                Some(format!(
                    "Variable `{}` is not defined. Check spelling or use `| default(\"fallback\")`.",
                    name
                ))
            })
        }
        TemplateErrorKind::UnknownFilter => {
            let detailed = format!("{:#}", err);
            extract_filter_from_display(&detailed)
                .or_else(|| extract_quoted_name(&msg))
                .map(|name| suggest_unknown_filter(&name))
        }
        TemplateErrorKind::UnknownFunction => {
            extract_quoted_name(&msg).map(|name| suggest_unknown_function(&name))
        }
        TemplateErrorKind::SyntaxError => Some(
            "Check bracket matching: `{{ }}` for expressions, `{% %}` for statements, `{# #}` for comments"
                .to_string(),
        ),
        TemplateErrorKind::TypeError if msg.to_lowercase().contains("not iterable") => Some(
            "Objects require `| dictsort` to iterate: `{% for key, value in obj | dictsort %}`"
                .to_string(),
        ),
        _ => None,
    }
}

/// All errors from rendering a chart tree
#[derive(Debug, Default, Clone)]
pub struct RenderReport {
    /// Errors grouped by template file (IndexMap preserves insertion order)
    pub errors_by_template: IndexMap<String, Vec<TemplateError>>,

    /// Successfully rendered templates
    pub successful_templates: Vec<String>,

    /// Non-fatal issues (skipped subcharts, empty documents)
    pub warnings: Vec<String>,

    /// Total error count
    pub total_errors: usize,
}

impl RenderReport {
    /// Create a new empty report
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an error for a specific template
    pub fn add_error(&mut self, template_name: String, error: TemplateError) {
        self.errors_by_template
            .entry(template_name)
            .or_default()
            .push(error);
        self.total_errors += 1;
    }

    /// Mark a template as successfully rendered
    pub fn add_success(&mut self, template_name: String) {
        self.successful_templates.push(template_name);
    }

    /// Record a non-fatal issue
    pub fn add_warning(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }

    /// Check if there are any errors
    pub fn has_errors(&self) -> bool {
        self.total_errors > 0
    }

    /// Get count of templates with errors
    pub fn templates_with_errors(&self) -> usize {
        self.errors_by_template.len()
    }

    /// Merge another report into this one
    pub fn absorb(&mut self, other: RenderReport) {
        for (template, errors) in other.errors_by_template {
            for error in errors {
                self.add_error(template.clone(), error);
            }
        }
        self.successful_templates.extend(other.successful_templates);
        self.warnings.extend(other.warnings);
    }

    /// One line per failure: `template: message`
    pub fn failures(&self) -> Vec<String> {
        self.errors_by_template
            .iter()
            .flat_map(|(template, errors)| {
                errors.iter().map(move |e| format!("{}: {}", template, e.message))
            })
            .collect()
    }

    /// Generate summary message: "5 errors in 3 templates"
    pub fn summary(&self) -> String {
        let template_word = if self.templates_with_errors() == 1 {
            "template"
        } else {
            "templates"
        };
        let error_word = if self.total_errors == 1 { "error" } else { "errors" };
        format!(
            "{} {} in {} {}",
            self.total_errors,
            error_word,
            self.templates_with_errors(),
            template_word
        )
    }
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;
