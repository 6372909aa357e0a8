//! YAML document streams

/// Split a `---` separated stream into documents
///
/// Only a line that is exactly `---` (or starts with `--- `) separates
/// documents, so block scalars containing dashes stay intact. Documents with
/// nothing but blank lines and comments are dropped.
pub fn split_documents(text: &str) -> Vec<String> {
    let mut documents = Vec::new();
    let mut current = Vec::new();

    for line in text.lines() {
        if line.trim_end() == "---" || line.starts_with("--- ") {
            push_document(&mut documents, &current);
            current.clear();
        } else {
            current.push(line);
        }
    }
    push_document(&mut documents, &current);
    documents
}

fn push_document(documents: &mut Vec<String>, lines: &[&str]) {
    let has_content = lines.iter().any(|line| {
        let trimmed = line.trim();
        !trimmed.is_empty() && !trimmed.starts_with('#')
    });
    if has_content {
        documents.push(lines.join("\n").trim_matches('\n').to_string());
    }
}
