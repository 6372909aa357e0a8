//! Fuzzy matching suggestions for template errors

/// Maximum Levenshtein distance to consider for suggestions
const MAX_SUGGESTION_DISTANCE: usize = 3;

/// All registered filters in the engine
pub const AVAILABLE_FILTERS: &[&str] = &[
    // Custom filters
    "toyaml",
    "tojson",
    "tojson_pretty",
    "b64encode",
    "b64decode",
    "quote",
    "squote",
    "nindent",
    "indent",
    "required",
    "empty",
    "haskey",
    "keys",
    "merge",
    "sha256",
    "trunc",
    "trimprefix",
    "trimsuffix",
    "snakecase",
    "kebabcase",
    "semver_match",
    // Built-in MiniJinja filters
    "default",
    "upper",
    "lower",
    "title",
    "replace",
    "trim",
    "join",
    "first",
    "last",
    "length",
    "reverse",
    "sort",
    "unique",
    "map",
    "select",
    "reject",
    "dictsort",
    "items",
    "int",
    "float",
    "string",
    "list",
    "bool",
    "urlencode",
];

/// All registered functions in the engine
pub const AVAILABLE_FUNCTIONS: &[&str] = &[
    "fail",
    "dict",
    "list",
    "get",
    "coalesce",
    "ternary",
    "tostring",
    "toint",
    "printf",
    "tpl",
    "has_api",
    "require_api",
    "semver_compare",
    "seeded_uuid",
    "seeded_alnum",
    // Built-in MiniJinja globals
    "range",
    "namespace",
];

/// Top-level context variables always available in templates
pub const CONTEXT_VARIABLES: &[&str] =
    &["values", "release", "chart", "capabilities", "template", "files"];

/// A candidate correction
#[derive(Debug, Clone)]
pub struct Suggestion {
    pub text: String,
    /// Levenshtein distance (lower = better match)
    pub distance: usize,
}

/// Find closest matches from a list of candidates
pub fn find_closest_matches(input: &str, candidates: &[&str], max_results: usize) -> Vec<Suggestion> {
    let mut suggestions: Vec<Suggestion> = candidates
        .iter()
        .filter_map(|&candidate| {
            let distance = strsim::levenshtein(input, candidate);
            (distance <= MAX_SUGGESTION_DISTANCE && distance > 0).then(|| Suggestion {
                text: candidate.to_string(),
                distance,
            })
        })
        .collect();

    suggestions.sort_by(|a, b| a.distance.cmp(&b.distance).then_with(|| a.text.cmp(&b.text)));
    suggestions.truncate(max_results);
    suggestions
}

fn did_you_mean(matches: &[Suggestion]) -> Option<String> {
    if matches.is_empty() {
        return None;
    }
    let quoted: Vec<String> = matches.iter().map(|s| format!("`{}`", s.text)).collect();
    Some(format!("Did you mean {}?", quoted.join(" or ")))
}

/// Suggest corrections for an undefined variable
pub fn suggest_undefined_variable(variable_name: &str, available: &[String]) -> Option<String> {
    if variable_name == "value" || variable_name.starts_with("value.") {
        return Some(format!(
            "Did you mean `{}`? Use `values` (plural) to access the values object.",
            variable_name.replacen("value", "values", 1)
        ));
    }

    let root = variable_name.split('.').next().unwrap_or(variable_name);
    if let Some(found) = did_you_mean(&find_closest_matches(root, CONTEXT_VARIABLES, 1)) {
        return Some(found);
    }

    let candidates: Vec<&str> = available.iter().map(String::as_str).collect();
    did_you_mean(&find_closest_matches(root, &candidates, 3))
}

/// Suggest available keys when a `values.*` path breaks
pub fn suggest_values_path(path: &str, values: &serde_json::Value) -> Option<String> {
    let mut current = values;
    let mut valid: Vec<&str> = Vec::new();

    for part in path.split('.') {
        if let Some(next) = current.get(part) {
            valid.push(part);
            current = next;
            continue;
        }

        let available: Vec<&str> = current.as_object()?.keys().map(String::as_str).collect();
        let prefix = if valid.is_empty() {
            "values".to_string()
        } else {
            format!("values.{}", valid.join("."))
        };
        let matches = find_closest_matches(part, &available, 3);
        return Some(match did_you_mean(
            &matches
                .into_iter()
                .map(|m| Suggestion {
                    text: format!("{}.{}", prefix, m.text),
                    distance: m.distance,
                })
                .collect::<Vec<_>>(),
        ) {
            Some(found) => format!("Key `{}` not found. {} Available: {}", part, found, available.join(", ")),
            None => format!(
                "Key `{}` not found in `{}`. Available keys: {}",
                part,
                prefix,
                available.join(", ")
            ),
        });
    }
    None
}

/// Suggest corrections for an unknown filter
pub fn suggest_unknown_filter(filter_name: &str) -> String {
    did_you_mean(&find_closest_matches(filter_name, AVAILABLE_FILTERS, 3)).unwrap_or_else(|| {
        format!(
            "Unknown filter `{}`. Common filters: toyaml, tojson, b64encode, quote, default, nindent",
            filter_name
        )
    })
}

/// Suggest corrections for an unknown function
pub fn suggest_unknown_function(func_name: &str) -> String {
    did_you_mean(&find_closest_matches(func_name, AVAILABLE_FUNCTIONS, 3)).unwrap_or_else(|| {
        format!(
            "Unknown function `{}`. Available functions: {}",
            func_name,
            AVAILABLE_FUNCTIONS.join(", ")
        )
    })
}

/// Extract a quoted name from an error message
pub fn extract_quoted_name(msg: &str) -> Option<String> {
    for quote in ['`', '\'', '"'] {
        if let Some(start) = msg.find(quote) {
            let rest = &msg[start + 1..];
            if let Some(end) = rest.find(quote) {
                return Some(rest[..end].to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_closest_matches() {
        let matches = find_closest_matches("toyml", AVAILABLE_FILTERS, 3);
        assert_eq!(matches[0].text, "toyaml");
        assert_eq!(matches[0].distance, 1);
    }

    #[test]
    fn test_suggest_undefined_variable_typo() {
        let suggestion = suggest_undefined_variable("value.image", &[]).unwrap();
        assert!(suggestion.contains("values.image"));

        let suggestion = suggest_undefined_variable("chrt", &[]).unwrap();
        assert!(suggestion.contains("`chart`"));
    }

    #[test]
    fn test_suggest_values_path() {
        let values = serde_json::json!({"image": {"repository": "nginx", "tag": "1"}});
        let hint = suggest_values_path("image.tga", &values).unwrap();
        assert!(hint.contains("`values.image.tag`"));
        assert!(hint.contains("repository"));

        assert!(suggest_values_path("image.tag", &values).is_none());
    }

    #[test]
    fn test_suggest_unknown_filter() {
        assert!(suggest_unknown_filter("toyml").contains("toyaml"));
        assert!(suggest_unknown_filter("zzzzzzzz").contains("Common filters"));
    }

    #[test]
    fn test_extract_quoted_name() {
        assert_eq!(extract_quoted_name("unknown filter `foo`"), Some("foo".to_string()));
        assert_eq!(extract_quoted_name("variable 'bar' is undefined"), Some("bar".to_string()));
        assert_eq!(extract_quoted_name("no quotes"), None);
    }
}
