//! Regex-based fallback extraction for files the parser bank rejects.
//!
//! When an adapter errors (syntax errors, panics, no parser), this module
//! still produces a low-fidelity `ParserResult` so no indexable file is
//! ever silently dropped. Every emitted entity carries a loud warning
//! observation. The extractor never emits implementation chunks and never
//! emits `calls` relations.

use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;

use crate::entities::{Entity, EntityType, Relation};
use crate::hashing::bytes_sha256;
use crate::parsers::ParserResult;

/// Upper bound on extracted variables (regexes on broken files are noisy).
const MAX_VARIABLES: usize = 20;
/// Upper bound on TODO/FIXME-style comment entities.
const MAX_COMMENT_ENTITIES: usize = 10;
/// Length of the searchable content-preview entity.
const PREVIEW_CHARS: usize = 1_000;

struct PatternBank {
    functions: Vec<Regex>,
    classes: Vec<Regex>,
    variables: Vec<Regex>,
    imports: Vec<Regex>,
    comments: Vec<Regex>,
}

fn patterns() -> &'static PatternBank {
    static BANK: OnceLock<PatternBank> = OnceLock::new();
    BANK.get_or_init(|| PatternBank {
        functions: compile(&[
            r"(?:async\s+)?function\s+(\w+)\s*\(",
            r"(?:export\s+)?(?:async\s+)?(\w+)\s*=\s*(?:async\s*)?\(",
            r"def\s+(\w+)\s*\(",
            r"fn\s+(\w+)\s*[(<]",
        ]),
        classes: compile(&[
            r"class\s+(\w+)",
            r"interface\s+(\w+)",
            r"type\s+(\w+)\s*=",
            r"struct\s+(\w+)",
            r"trait\s+(\w+)",
        ]),
        variables: compile(&[
            r"(?:const|let|var)\s+(\w+)\s*=",
            r"^(\w+)\s*=\s*[^=]",
        ]),
        imports: compile(&[
            r#"import\s+(?:\{[^}]*\}|\*|\w+)\s+from\s+['"]([^'"\n]+)"#,
            r"^import\s+([\w.]+)",
            r#"require\s*\(['"]([^'")]+)"#,
            r"^from\s+([\w.]+)\s+import",
            r"^use\s+([\w:]+)",
        ]),
        comments: compile(&[
            r"//\s*(TODO|FIXME|HACK|NOTE|BUG|XXX):?\s*(.+)$",
            r"#\s*(TODO|FIXME|HACK|NOTE|BUG|XXX):?\s*(.+)$",
        ]),
    })
}

fn compile(sources: &[&str]) -> Vec<Regex> {
    sources.iter().filter_map(|s| Regex::new(s).ok()).collect()
}

/// Identifier filter: reject the too-short, the absurdly long, and language
/// keywords regexes love to capture.
fn is_valid_identifier(name: &str) -> bool {
    if name.len() < 2 || name.len() > 100 {
        return false;
    }
    let first = name.chars().next().unwrap_or(' ');
    if !(first.is_alphabetic() || first == '_') {
        return false;
    }
    !matches!(
        name,
        "if" | "for" | "while" | "return" | "true" | "false" | "null" | "undefined"
    )
}

/// Scan `content` line by line with `bank`, yielding (capture, 1-indexed line).
fn extract_matches(content: &str, bank: &[Regex]) -> Vec<(String, u32)> {
    let mut out: Vec<(String, u32)> = Vec::new();
    for regex in bank {
        for (line_idx, line) in content.lines().enumerate() {
            for caps in regex.captures_iter(line) {
                if let Some(m) = caps.get(1) {
                    out.push((m.as_str().to_string(), line_idx as u32 + 1));
                }
            }
        }
    }
    out
}

fn extract_comment_matches(content: &str) -> Vec<(String, String, u32)> {
    let mut out = Vec::new();
    for regex in &patterns().comments {
        for (line_idx, line) in content.lines().enumerate() {
            for caps in regex.captures_iter(line) {
                if let (Some(tag), Some(text)) = (caps.get(1), caps.get(2)) {
                    out.push((
                        tag.as_str().to_string(),
                        text.as_str().trim().to_string(),
                        line_idx as u32 + 1,
                    ));
                }
            }
        }
    }
    out
}

/// Extract whatever the regexes can find from a file whose parser failed.
///
/// `error_message` is the original parse error; it ends up as a visible
/// warning observation on the file entity.
pub fn parse_with_fallback(file_path: &Path, error_message: &str) -> ParserResult {
    let bytes = match std::fs::read(file_path) {
        Ok(b) => b,
        Err(e) => return ParserResult::failure(file_path, format!("fallback read failed: {e}")),
    };
    let content = String::from_utf8_lossy(&bytes).into_owned();
    extract_from_content(file_path, &bytes, &content, error_message)
}

fn extract_from_content(
    file_path: &Path,
    bytes: &[u8],
    content: &str,
    error_message: &str,
) -> ParserResult {
    let file_name = file_path.display().to_string();
    let mut entities: Vec<Entity> = Vec::new();
    let mut relations: Vec<Relation> = Vec::new();

    let line_count = content.lines().count();
    if let Ok(file_entity) = Entity::new(
        file_name.clone(),
        EntityType::File,
        vec![
            format!("File has syntax errors: {error_message}"),
            "Fallback parsing applied - partial content extracted".to_string(),
            format!("Size: {} bytes", bytes.len()),
            format!("Lines: {line_count}"),
        ],
    ) {
        entities.push(file_entity.with_file_path(file_path).with_lines(1, None));
    }

    let mut seen: std::collections::HashSet<(String, &'static str)> =
        std::collections::HashSet::new();

    for (name, line) in extract_matches(content, &patterns().functions) {
        if !is_valid_identifier(&name) || !seen.insert((name.clone(), "fn")) {
            continue;
        }
        if let Ok(entity) = Entity::new(
            name.clone(),
            EntityType::Function,
            vec![
                "Function extracted via fallback parser".to_string(),
                format!("Found at line {line}"),
                "Full signature unavailable due to syntax errors".to_string(),
            ],
        ) {
            entities.push(entity.with_file_path(file_path).with_lines(line, None));
            if let Ok(contains) = Relation::contains(file_name.clone(), name) {
                relations.push(contains.with_file_path(file_path));
            }
        }
    }

    for (name, line) in extract_matches(content, &patterns().classes) {
        if !is_valid_identifier(&name) || !seen.insert((name.clone(), "class")) {
            continue;
        }
        if let Ok(entity) = Entity::new(
            name.clone(),
            EntityType::Class,
            vec![
                "Class/Interface extracted via fallback parser".to_string(),
                format!("Found at line {line}"),
                "Members unavailable due to syntax errors".to_string(),
            ],
        ) {
            entities.push(entity.with_file_path(file_path).with_lines(line, None));
            if let Ok(contains) = Relation::contains(file_name.clone(), name) {
                relations.push(contains.with_file_path(file_path));
            }
        }
    }

    let mut variable_count = 0usize;
    for (name, line) in extract_matches(content, &patterns().variables) {
        if variable_count >= MAX_VARIABLES {
            break;
        }
        if !is_valid_identifier(&name) || !seen.insert((name.clone(), "var")) {
            continue;
        }
        if let Ok(entity) = Entity::new(
            name,
            EntityType::Variable,
            vec![
                "Variable/Constant extracted via fallback parser".to_string(),
                format!("Found at line {line}"),
            ],
        ) {
            entities.push(entity.with_file_path(file_path).with_lines(line, None));
            variable_count += 1;
        }
    }

    for (target, _line) in extract_matches(content, &patterns().imports) {
        if target.is_empty() {
            continue;
        }
        if let Ok(relation) = Relation::imports(file_name.clone(), target, "module") {
            relations.push(
                relation
                    .with_metadata("fallback_parsed", serde_json::Value::Bool(true))
                    .with_file_path(file_path),
            );
        }
    }

    for (tag, text, line) in extract_comment_matches(content).into_iter().take(MAX_COMMENT_ENTITIES)
    {
        let short: String = text.chars().take(50).collect();
        if let Ok(entity) = Entity::new(
            format!("{tag}: {short}"),
            EntityType::Documentation,
            vec![format!("{tag} comment: {text}"), format!("Found at line {line}")],
        ) {
            entities.push(entity.with_file_path(file_path).with_lines(line, None));
        }
    }

    // Searchable preview so even a hopeless file has findable content.
    let preview: String = content.chars().take(PREVIEW_CHARS).collect::<String>().replace('\n', " ");
    if !preview.trim().is_empty() {
        let stem = file_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| file_name.clone());
        if let Ok(entity) = Entity::new(
            format!("{stem}_content"),
            EntityType::Documentation,
            vec![
                "File content preview (first 1000 chars)".to_string(),
                preview,
                "Complete parsing unavailable due to syntax errors".to_string(),
            ],
        ) {
            entities.push(entity.with_file_path(file_path).with_lines(1, None));
        }
    }

    ParserResult {
        file_path: file_path.to_path_buf(),
        entities,
        relations,
        implementation_chunks: vec![], // never — fallback output is metadata-only
        warnings: vec![format!(
            "Syntax errors in file - used fallback parser: {error_message}"
        )],
        errors: vec![],
        parsing_time_ms: 0,
        file_sha256: bytes_sha256(bytes),
        success: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::RelationType;

    fn fallback(name: &str, content: &str) -> ParserResult {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        let mut result = parse_with_fallback(&path, "simulated parse failure");
        // Make assertions path-independent.
        result.file_path = std::path::PathBuf::from(name);
        result
    }

    #[test]
    fn broken_python_still_yields_file_entity_with_warning() {
        let result = fallback("d.py", "def (:\n");
        assert!(result.success);
        assert!(result.warnings.iter().any(|w| w.contains("fallback")));

        let file_entity = &result.entities[0];
        assert_eq!(file_entity.entity_type, EntityType::File);
        assert!(file_entity.observations.iter().any(|o| o.contains("syntax errors")));
    }

    #[test]
    fn recognisable_constructs_are_extracted() {
        let src = "def working():\n    pass\nclass Shape:\n    pass\nbroken syntax here ((\n";
        let result = fallback("e.py", src);

        let names: Vec<&str> = result.entities.iter().map(|e| e.name.as_str()).collect();
        assert!(names.contains(&"working"));
        assert!(names.contains(&"Shape"));
    }

    #[test]
    fn keywords_and_short_names_are_rejected() {
        let src = "if = 1\nx = 2\nreturn = 3\nvalid_name = 4\n";
        let result = fallback("f.py", src);
        let names: Vec<&str> = result.entities.iter().map(|e| e.name.as_str()).collect();
        assert!(!names.contains(&"if"));
        assert!(!names.contains(&"x"), "single-char identifiers rejected");
        assert!(!names.contains(&"return"));
        assert!(names.contains(&"valid_name"));
    }

    #[test]
    fn imports_become_relations_flagged_as_fallback() {
        let result = fallback("g.py", "import os\nbroken ((\n");
        let import = result
            .relations
            .iter()
            .find(|r| r.relation_type == RelationType::Imports)
            .unwrap();
        assert_eq!(import.to_entity, "os");
        assert_eq!(
            import.metadata.get("fallback_parsed"),
            Some(&serde_json::Value::Bool(true))
        );
    }

    #[test]
    fn never_emits_implementation_chunks_or_calls() {
        let src = "def foo():\n    bar()\n";
        let result = fallback("h.py", src);
        assert!(result.implementation_chunks.is_empty());
        assert!(result.relations.iter().all(|r| r.relation_type != RelationType::Calls));
    }

    #[test]
    fn todo_comments_become_documentation_entities() {
        let result = fallback("i.py", "# TODO: fix the frobnicator\nx_var = 1\n");
        assert!(result
            .entities
            .iter()
            .any(|e| e.entity_type == EntityType::Documentation && e.name.starts_with("TODO")));
    }
}
