//! Chart inspection (`show chart|values|readme|crds|all`)

use serde::{Deserialize, Serialize};

use crate::chart::Chart;
use crate::documents::split_documents;
use crate::error::{CoreError, Result};

/// What to show about a chart
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShowKind {
    All,
    Chart,
    Values,
    Readme,
    Crds,
}

/// Render the requested view of a chart as text
///
/// `All` joins every available section with `---` separators, skipping
/// sections the chart does not have.
pub fn show(chart: &Chart, kind: ShowKind) -> Result<String> {
    match kind {
        ShowKind::Chart => Ok(serde_yaml::to_string(&chart.metadata)?),
        ShowKind::Values => chart.values.to_yaml(),
        ShowKind::Readme => Ok(readme(chart).unwrap_or_default()),
        ShowKind::Crds => Ok(crds(chart).join("\n---\n")),
        ShowKind::All => {
            let mut sections = vec![show(chart, ShowKind::Chart)?];
            if !chart.values.is_empty() {
                sections.push(show(chart, ShowKind::Values)?);
            }
            if let Some(readme) = readme(chart) {
                sections.push(readme);
            }
            sections.extend(crds(chart));
            Ok(sections
                .iter()
                .map(|s| s.trim_end())
                .collect::<Vec<_>>()
                .join("\n---\n"))
        }
    }
}

/// Default values filtered to one path
///
/// Accepts a dotted path (`image.tag`), optionally in JSONPath braces
/// (`{.image.tag}`). Strings print bare; anything else prints as YAML.
pub fn show_values_path(chart: &Chart, path: &str) -> Result<String> {
    let dotted = path
        .trim()
        .trim_start_matches('{')
        .trim_end_matches('}')
        .trim_start_matches('$')
        .trim_start_matches('.');
    if dotted.is_empty() {
        return show(chart, ShowKind::Values);
    }

    let value = chart
        .values
        .get(dotted)
        .ok_or_else(|| CoreError::ValuePathNotFound {
            path: path.to_string(),
        })?;
    match value {
        serde_json::Value::String(s) => Ok(s.clone()),
        other => Ok(serde_yaml::to_string(other)?),
    }
}

/// README content, matched case-insensitively at the chart root
pub fn readme(chart: &Chart) -> Option<String> {
    chart
        .files
        .iter()
        .find(|(path, _)| !path.contains('/') && path.to_ascii_lowercase().starts_with("readme"))
        .map(|(_, content)| String::from_utf8_lossy(content).to_string())
}

/// CRD documents shipped under `crds/`, one entry per YAML document
pub fn crds(chart: &Chart) -> Vec<String> {
    chart
        .files
        .iter()
        .filter(|(path, _)| {
            path.starts_with("crds/") && (path.ends_with(".yaml") || path.ends_with(".yml"))
        })
        .flat_map(|(_, content)| split_documents(&String::from_utf8_lossy(content)))
        .collect()
}
