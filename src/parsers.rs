//! Parser dispatch: routes a file to its language adapter and normalises
//! the output into entities, relations, and implementation chunks.
//!
//! Adapters are tree-sitter drivers in a fixed registry keyed by extension.
//! The dispatch layer is pure routing — it never silently drops a file:
//! unsupported extensions yield an explicit "no parser" error the pipeline
//! can route to the fallback extractor, and a source tree containing syntax
//! errors is reported as a parse failure for the same reason.
//!
//! Language-independent guarantees, regardless of adapter:
//!  - one file-level entity (type `file`, name = the path as given)
//!  - a `contains` relation from the file entity to every extracted entity
//!  - `imports` relations carrying `metadata.import_type`
//!  - implementation chunks only for function/class/method bodies

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tree_sitter::{Language, Node, Parser, Query, QueryCursor, StreamingIterator};

use crate::entities::{Entity, EntityChunk, EntityType, Relation};
use crate::hashing::bytes_sha256;

// ---------------------------------------------------------------------------
// Normalised parse output
// ---------------------------------------------------------------------------

/// Everything a single file contributes to the index. Serde-derived so the
/// worker pool can hand results across threads and the two directions of the
/// conversion are exact inverses by construction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParserResult {
    pub file_path: PathBuf,
    pub entities: Vec<Entity>,
    pub relations: Vec<Relation>,
    pub implementation_chunks: Vec<EntityChunk>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    pub parsing_time_ms: u64,
    pub file_sha256: String,
    pub success: bool,
}

impl ParserResult {
    pub fn failure(file_path: &Path, error: impl Into<String>) -> Self {
        Self {
            file_path: file_path.to_path_buf(),
            success: false,
            errors: vec![error.into()],
            ..Default::default()
        }
    }
}

/// One extracted definition, before it becomes an entity.
#[derive(Debug, Clone)]
pub struct SymbolInfo {
    pub name: String,
    pub kind: EntityType,
    /// 1-indexed line range.
    pub start_line: u32,
    pub end_line: u32,
    pub signature: Option<String>,
    pub docstring: Option<String>,
    /// Raw source body — present for function/class/method definitions.
    pub body: Option<String>,
    /// Base classes / extended types, for `inherits` relations.
    pub parents: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ImportInfo {
    pub target: String,
    pub import_type: String,
}

#[derive(Debug, Clone, Default)]
pub struct Extraction {
    pub symbols: Vec<SymbolInfo>,
    pub imports: Vec<ImportInfo>,
}

// ---------------------------------------------------------------------------
// Adapter contract
// ---------------------------------------------------------------------------

pub trait LanguageAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Lowercase extensions (without dot) this adapter handles.
    fn extensions(&self) -> &'static [&'static str];

    fn language(&self, path: &Path) -> Language;

    fn extract(&self, path: &Path, source: &[u8], root: Node, language: Language)
        -> Result<Extraction>;
}

// ---------------------------------------------------------------------------
// Query plumbing (shared by all adapters)
// ---------------------------------------------------------------------------

fn node_text<'a>(source: &'a [u8], node: Node) -> &'a str {
    std::str::from_utf8(&source[node.start_byte()..node.end_byte()]).unwrap_or("")
}

fn strip_string_quotes(s: &str) -> String {
    let t = s.trim();
    if t.len() >= 2 {
        let bytes = t.as_bytes();
        let first = bytes[0];
        let last = bytes[t.len() - 1];
        if (first == b'\'' && last == b'\'')
            || (first == b'"' && last == b'"')
            || (first == b'`' && last == b'`')
        {
            return t[1..t.len() - 1].to_string();
        }
    }
    t.to_string()
}

/// Collapse a definition to its pre-body first line for the signature field.
fn first_line_signature(def_text: &str) -> String {
    let mut s = def_text;
    if let Some(i) = s.find('{') {
        s = &s[..i];
    }
    if let Some(i) = s.find('\n') {
        s = &s[..i];
    }

    let mut out = String::with_capacity(s.len().min(200));
    let mut prev_ws = false;
    for ch in s.chars() {
        let is_ws = ch.is_whitespace();
        if is_ws {
            if !prev_ws {
                out.push(' ');
            }
        } else {
            out.push(ch);
        }
        prev_ws = is_ws;
        if out.len() >= 240 {
            break;
        }
    }

    out.trim().trim_end_matches('{').trim().trim_end_matches(':').trim().to_string()
}

/// Run a `@name`/`@def` query and return the captured definition nodes.
fn query_definitions<'tree>(
    source: &[u8],
    root: Node<'tree>,
    language: &Language,
    query_src: &str,
) -> Result<Vec<(String, Node<'tree>)>> {
    let query = Query::new(language, query_src).context("Failed to compile tree-sitter query")?;
    let mut cursor = QueryCursor::new();
    let mut out: Vec<(String, Node)> = Vec::new();

    let mut matches = cursor.matches(&query, root, source);
    while let Some(m) = matches.next() {
        let mut name: Option<String> = None;
        let mut def: Option<Node> = None;
        for cap in m.captures {
            match query.capture_names()[cap.index as usize] {
                "name" => name = Some(node_text(source, cap.node).to_string()),
                "def" => def = Some(cap.node),
                _ => {}
            }
        }
        if let (Some(name), Some(def)) = (name, def) {
            if !name.is_empty() {
                out.push((name, def));
            }
        }
    }
    Ok(out)
}

fn query_strings(
    source: &[u8],
    root: Node,
    language: &Language,
    query_src: &str,
    cap: &str,
) -> Result<Vec<String>> {
    let query = Query::new(language, query_src).context("Failed to compile tree-sitter query")?;
    let mut cursor = QueryCursor::new();
    let mut out: Vec<String> = Vec::new();

    let mut matches = cursor.matches(&query, root, source);
    while let Some(m) = matches.next() {
        for cap0 in m.captures {
            if query.capture_names()[cap0.index as usize] != cap {
                continue;
            }
            let text = node_text(source, cap0.node).trim().to_string();
            if !text.is_empty() {
                out.push(text);
            }
        }
    }
    Ok(out)
}

fn symbol_from_node(
    source: &[u8],
    name: String,
    kind: EntityType,
    def: Node,
    with_body: bool,
) -> SymbolInfo {
    let text = node_text(source, def);
    SymbolInfo {
        name,
        kind,
        start_line: def.start_position().row as u32 + 1,
        end_line: def.end_position().row as u32 + 1,
        signature: Some(first_line_signature(text)).filter(|s| !s.is_empty()),
        docstring: None,
        body: if with_body && kind.carries_implementation() {
            Some(text.to_string())
        } else {
            None
        },
        parents: vec![],
    }
}

fn has_ancestor_of_kind(node: Node, kind: &str) -> bool {
    let mut cur = node.parent();
    while let Some(n) = cur {
        if n.kind() == kind {
            return true;
        }
        cur = n.parent();
    }
    false
}

// ---------------------------------------------------------------------------
// Rust adapter
// ---------------------------------------------------------------------------

struct RustAdapter;

impl LanguageAdapter for RustAdapter {
    fn name(&self) -> &'static str {
        "rust"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["rs"]
    }

    fn language(&self, _path: &Path) -> Language {
        tree_sitter_rust::language()
    }

    fn extract(
        &self,
        _path: &Path,
        source: &[u8],
        root: Node,
        language: Language,
    ) -> Result<Extraction> {
        let mut symbols: Vec<SymbolInfo> = Vec::new();

        for (name, def) in query_definitions(
            source,
            root,
            &language,
            r#"(function_item name: (identifier) @name) @def"#,
        )? {
            // Functions inside an impl block are methods of that type.
            let kind = if has_ancestor_of_kind(def, "impl_item") {
                EntityType::Method
            } else {
                EntityType::Function
            };
            symbols.push(symbol_from_node(source, name, kind, def, true));
        }
        for (name, def) in query_definitions(
            source,
            root,
            &language,
            r#"(struct_item name: (type_identifier) @name) @def"#,
        )? {
            symbols.push(symbol_from_node(source, name, EntityType::Class, def, true));
        }
        for (name, def) in query_definitions(
            source,
            root,
            &language,
            r#"(enum_item name: (type_identifier) @name) @def"#,
        )? {
            symbols.push(symbol_from_node(source, name, EntityType::Class, def, true));
        }
        for (name, def) in query_definitions(
            source,
            root,
            &language,
            r#"(trait_item name: (type_identifier) @name) @def"#,
        )? {
            symbols.push(symbol_from_node(source, name, EntityType::Interface, def, false));
        }

        let imports = query_strings(
            source,
            root,
            &language,
            r#"(use_declaration argument: (_) @path)"#,
            "path",
        )?
        .into_iter()
        .map(|target| ImportInfo { target, import_type: "use".to_string() })
        .collect();

        Ok(Extraction { symbols, imports })
    }
}

// ---------------------------------------------------------------------------
// Python adapter
// ---------------------------------------------------------------------------

struct PythonAdapter;

/// Docstring = a string expression as the first statement of the body block.
fn python_docstring(source: &[u8], def: Node) -> Option<String> {
    let body = def.child_by_field_name("body")?;
    let first = body.named_child(0)?;
    if first.kind() != "expression_statement" {
        return None;
    }
    let string = first.named_child(0)?;
    if string.kind() != "string" {
        return None;
    }
    let raw = node_text(source, string)
        .trim()
        .trim_start_matches("\"\"\"")
        .trim_start_matches("'''")
        .trim_end_matches("\"\"\"")
        .trim_end_matches("'''")
        .trim()
        .to_string();
    if raw.is_empty() {
        None
    } else {
        Some(raw)
    }
}

fn python_base_classes(source: &[u8], def: Node) -> Vec<String> {
    let Some(supers) = def.child_by_field_name("superclasses") else {
        return vec![];
    };
    let mut out = Vec::new();
    let mut cursor = supers.walk();
    for child in supers.named_children(&mut cursor) {
        if matches!(child.kind(), "identifier" | "attribute") {
            out.push(node_text(source, child).to_string());
        }
    }
    out
}

impl LanguageAdapter for PythonAdapter {
    fn name(&self) -> &'static str {
        "python"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["py"]
    }

    fn language(&self, _path: &Path) -> Language {
        tree_sitter_python::language()
    }

    fn extract(
        &self,
        _path: &Path,
        source: &[u8],
        root: Node,
        language: Language,
    ) -> Result<Extraction> {
        let mut symbols: Vec<SymbolInfo> = Vec::new();

        for (name, def) in query_definitions(
            source,
            root,
            &language,
            r#"(function_definition name: (identifier) @name) @def"#,
        )? {
            let kind = if has_ancestor_of_kind(def, "class_definition") {
                EntityType::Method
            } else {
                EntityType::Function
            };
            let mut sym = symbol_from_node(source, name, kind, def, true);
            sym.docstring = python_docstring(source, def);
            symbols.push(sym);
        }

        for (name, def) in query_definitions(
            source,
            root,
            &language,
            r#"(class_definition name: (identifier) @name) @def"#,
        )? {
            let mut sym = symbol_from_node(source, name, EntityType::Class, def, true);
            sym.docstring = python_docstring(source, def);
            sym.parents = python_base_classes(source, def);
            symbols.push(sym);
        }

        let mut imports: Vec<ImportInfo> = Vec::new();
        for target in query_strings(
            source,
            root,
            &language,
            r#"(import_statement name: (dotted_name) @module)"#,
            "module",
        )? {
            imports.push(ImportInfo { target, import_type: "module".to_string() });
        }
        for target in query_strings(
            source,
            root,
            &language,
            r#"(import_from_statement module_name: (dotted_name) @module)"#,
            "module",
        )? {
            imports.push(ImportInfo { target, import_type: "symbol".to_string() });
        }
        for target in query_strings(
            source,
            root,
            &language,
            r#"(import_from_statement module_name: (relative_import) @module)"#,
            "module",
        )? {
            imports.push(ImportInfo { target, import_type: "relative".to_string() });
        }

        Ok(Extraction { symbols, imports })
    }
}

// ---------------------------------------------------------------------------
// TypeScript / JavaScript adapter
// ---------------------------------------------------------------------------

struct TypeScriptAdapter;

impl LanguageAdapter for TypeScriptAdapter {
    fn name(&self) -> &'static str {
        "typescript"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["ts", "tsx", "mts", "cts", "js", "jsx", "mjs", "cjs"]
    }

    fn language(&self, path: &Path) -> Language {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("").to_lowercase();
        if ext == "tsx" || ext == "jsx" {
            tree_sitter_typescript::language_tsx()
        } else {
            // JS/TS share the TypeScript grammar for our purposes.
            tree_sitter_typescript::language_typescript()
        }
    }

    fn extract(
        &self,
        _path: &Path,
        source: &[u8],
        root: Node,
        language: Language,
    ) -> Result<Extraction> {
        let mut symbols: Vec<SymbolInfo> = Vec::new();

        for (name, def) in query_definitions(
            source,
            root,
            &language,
            r#"(function_declaration name: (identifier) @name) @def"#,
        )? {
            symbols.push(symbol_from_node(source, name, EntityType::Function, def, true));
        }
        for (name, def) in query_definitions(
            source,
            root,
            &language,
            r#"(lexical_declaration (variable_declarator name: (identifier) @name value: (arrow_function))) @def"#,
        )? {
            symbols.push(symbol_from_node(source, name, EntityType::Function, def, true));
        }
        for (name, def) in query_definitions(
            source,
            root,
            &language,
            r#"(class_declaration name: (type_identifier) @name) @def"#,
        )? {
            symbols.push(symbol_from_node(source, name, EntityType::Class, def, true));
        }
        for (name, def) in query_definitions(
            source,
            root,
            &language,
            r#"(interface_declaration name: (type_identifier) @name) @def"#,
        )? {
            symbols.push(symbol_from_node(source, name, EntityType::Interface, def, false));
        }
        for (name, def) in query_definitions(
            source,
            root,
            &language,
            r#"(method_definition name: (property_identifier) @name) @def"#,
        )? {
            symbols.push(symbol_from_node(source, name, EntityType::Method, def, true));
        }

        let imports = query_strings(
            source,
            root,
            &language,
            r#"(import_statement source: (string) @src)"#,
            "src",
        )?
        .into_iter()
        .map(|s| ImportInfo { target: strip_string_quotes(&s), import_type: "module".to_string() })
        .collect();

        Ok(Extraction { symbols, imports })
    }
}

// ---------------------------------------------------------------------------
// Go adapter
// ---------------------------------------------------------------------------

#[cfg(feature = "lang-go")]
struct GoAdapter;

#[cfg(feature = "lang-go")]
impl LanguageAdapter for GoAdapter {
    fn name(&self) -> &'static str {
        "go"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["go"]
    }

    fn language(&self, _path: &Path) -> Language {
        tree_sitter_go::language()
    }

    fn extract(
        &self,
        _path: &Path,
        source: &[u8],
        root: Node,
        language: Language,
    ) -> Result<Extraction> {
        let mut symbols: Vec<SymbolInfo> = Vec::new();

        for (name, def) in query_definitions(
            source,
            root,
            &language,
            r#"(function_declaration name: (identifier) @name) @def"#,
        )? {
            symbols.push(symbol_from_node(source, name, EntityType::Function, def, true));
        }
        for (name, def) in query_definitions(
            source,
            root,
            &language,
            r#"(method_declaration name: (field_identifier) @name) @def"#,
        )? {
            symbols.push(symbol_from_node(source, name, EntityType::Method, def, true));
        }
        for (name, def) in query_definitions(
            source,
            root,
            &language,
            r#"(type_spec name: (type_identifier) @name type: (struct_type)) @def"#,
        )? {
            symbols.push(symbol_from_node(source, name, EntityType::Class, def, true));
        }
        for (name, def) in query_definitions(
            source,
            root,
            &language,
            r#"(type_spec name: (type_identifier) @name type: (interface_type)) @def"#,
        )? {
            symbols.push(symbol_from_node(source, name, EntityType::Interface, def, false));
        }

        let mut imports: Vec<ImportInfo> = Vec::new();
        for q in [
            r#"(import_spec (interpreted_string_literal) @src)"#,
            r#"(import_spec (raw_string_literal) @src)"#,
        ] {
            for s in query_strings(source, root, &language, q, "src")? {
                imports.push(ImportInfo {
                    target: strip_string_quotes(&s),
                    import_type: "package".to_string(),
                });
            }
        }

        Ok(Extraction { symbols, imports })
    }
}

// ---------------------------------------------------------------------------
// Java adapter
// ---------------------------------------------------------------------------

#[cfg(feature = "lang-java")]
struct JavaAdapter;

#[cfg(feature = "lang-java")]
impl LanguageAdapter for JavaAdapter {
    fn name(&self) -> &'static str {
        "java"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["java"]
    }

    fn language(&self, _path: &Path) -> Language {
        tree_sitter_java::language()
    }

    fn extract(
        &self,
        _path: &Path,
        source: &[u8],
        root: Node,
        language: Language,
    ) -> Result<Extraction> {
        let mut symbols: Vec<SymbolInfo> = Vec::new();

        for (name, def) in query_definitions(
            source,
            root,
            &language,
            r#"(class_declaration name: (identifier) @name) @def"#,
        )? {
            symbols.push(symbol_from_node(source, name, EntityType::Class, def, true));
        }
        for (name, def) in query_definitions(
            source,
            root,
            &language,
            r#"(interface_declaration name: (identifier) @name) @def"#,
        )? {
            symbols.push(symbol_from_node(source, name, EntityType::Interface, def, false));
        }
        for (name, def) in query_definitions(
            source,
            root,
            &language,
            r#"(method_declaration name: (identifier) @name) @def"#,
        )? {
            symbols.push(symbol_from_node(source, name, EntityType::Method, def, true));
        }

        let imports = query_strings(
            source,
            root,
            &language,
            r#"(import_declaration (scoped_identifier) @src)"#,
            "src",
        )?
        .into_iter()
        .map(|target| ImportInfo { target, import_type: "package".to_string() })
        .collect();

        Ok(Extraction { symbols, imports })
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

pub struct ParserRegistry {
    adapters: Vec<Box<dyn LanguageAdapter>>,
    by_ext: HashMap<String, usize>,
}

impl Default for ParserRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ParserRegistry {
    pub fn new() -> Self {
        let adapters: Vec<Box<dyn LanguageAdapter>> = vec![
            Box::new(RustAdapter),
            Box::new(PythonAdapter),
            Box::new(TypeScriptAdapter),
            #[cfg(feature = "lang-go")]
            Box::new(GoAdapter),
            #[cfg(feature = "lang-java")]
            Box::new(JavaAdapter),
        ];

        let mut by_ext = HashMap::new();
        for (idx, adapter) in adapters.iter().enumerate() {
            for ext in adapter.extensions() {
                by_ext.insert(ext.to_string(), idx);
            }
        }

        Self { adapters, by_ext }
    }

    fn adapter_for(&self, path: &Path) -> Option<&dyn LanguageAdapter> {
        let ext = path.extension().and_then(|e| e.to_str())?.to_lowercase();
        self.by_ext.get(&ext).map(|&idx| self.adapters[idx].as_ref())
    }

    pub fn supports(&self, path: &Path) -> bool {
        self.adapter_for(path).is_some()
    }

    /// Extensions with a registered adapter, for discovery glob building.
    pub fn supported_extensions(&self) -> Vec<&'static str> {
        self.adapters.iter().flat_map(|a| a.extensions()).copied().collect()
    }

    /// Parse a file from disk. Infallible by design: every failure mode is
    /// reported inside the `ParserResult` so the pipeline can decide what
    /// to do (usually: hand the file to the fallback extractor).
    pub fn parse_file(&self, path: &Path) -> ParserResult {
        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(e) => return ParserResult::failure(path, format!("failed to read file: {e}")),
        };
        self.parse_bytes(path, &bytes)
    }

    pub fn parse_bytes(&self, path: &Path, bytes: &[u8]) -> ParserResult {
        let started = Instant::now();

        let Some(adapter) = self.adapter_for(path) else {
            return ParserResult::failure(
                path,
                format!("no parser registered for {}", path.display()),
            );
        };

        let extraction = catch_unwind(AssertUnwindSafe(|| -> Result<Extraction> {
            let language = adapter.language(path);
            let mut parser = Parser::new();
            parser
                .set_language(&language)
                .map_err(|e| anyhow!("grammar version mismatch for {}: {e}", adapter.name()))?;
            let tree = parser
                .parse(bytes, None)
                .ok_or_else(|| anyhow!("tree-sitter returned no tree"))?;
            let root = tree.root_node();
            if root.has_error() {
                return Err(anyhow!("syntax errors in {}", path.display()));
            }
            adapter.extract(path, bytes, root, language)
        }));

        let extraction = match extraction {
            Ok(Ok(extraction)) => extraction,
            Ok(Err(e)) => return ParserResult::failure(path, e.to_string()),
            Err(_) => {
                return ParserResult::failure(
                    path,
                    format!("{} adapter panicked on {}", adapter.name(), path.display()),
                )
            }
        };

        let mut result = self.assemble(path, bytes, extraction);
        result.parsing_time_ms = started.elapsed().as_millis() as u64;
        result
    }

    /// Shape adapter output into the normalised record set.
    fn assemble(&self, path: &Path, bytes: &[u8], extraction: Extraction) -> ParserResult {
        let file_name = path.display().to_string();
        let mut entities: Vec<Entity> = Vec::new();
        let mut relations: Vec<Relation> = Vec::new();
        let mut implementation_chunks: Vec<EntityChunk> = Vec::new();
        let mut warnings: Vec<String> = Vec::new();

        let file_entity = Entity::new(
            file_name.clone(),
            EntityType::File,
            vec![
                format!(
                    "File: {}",
                    path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default()
                ),
                format!("Path: {file_name}"),
                format!(
                    "Extension: {}",
                    path.extension().map(|e| e.to_string_lossy().to_string()).unwrap_or_default()
                ),
                format!("Size: {} bytes", bytes.len()),
            ],
        );
        match file_entity {
            Ok(e) => entities.push(e.with_file_path(path).with_lines(1, None)),
            Err(e) => return ParserResult::failure(path, e.to_string()),
        }

        for symbol in extraction.symbols {
            let mut observations = vec![
                format!("{}: {}", capitalised_kind(symbol.kind), symbol.name),
                format!("Defined in: {file_name}"),
                format!("Line: {}", symbol.start_line),
            ];
            if let Some(sig) = &symbol.signature {
                observations.push(format!("Signature: {sig}"));
            }
            if let Some(doc) = &symbol.docstring {
                observations.push(format!("Description: {doc}"));
            }
            if !symbol.parents.is_empty() {
                observations.push(format!("Inherits from: {}", symbol.parents.join(", ")));
            }

            let entity = match Entity::new(symbol.name.clone(), symbol.kind, observations) {
                Ok(e) => e,
                Err(e) => {
                    warnings.push(format!("skipped malformed symbol in {file_name}: {e}"));
                    continue;
                }
            };
            let mut entity = entity
                .with_file_path(path)
                .with_lines(symbol.start_line, Some(symbol.end_line));
            if let Some(sig) = &symbol.signature {
                entity = entity.with_signature(sig.clone());
            }
            if let Some(doc) = &symbol.docstring {
                entity = entity.with_docstring(doc.clone());
            }
            entities.push(entity);

            if let Ok(contains) = Relation::contains(file_name.clone(), symbol.name.clone()) {
                relations.push(contains.with_file_path(path));
            }

            for parent in &symbol.parents {
                if let Ok(inherits) = Relation::inherits(symbol.name.clone(), parent.clone()) {
                    relations.push(inherits.with_file_path(path));
                }
            }

            if let Some(body) = &symbol.body {
                match EntityChunk::implementation_for(
                    path,
                    symbol.kind,
                    &symbol.name,
                    body,
                    symbol.start_line,
                    symbol.end_line,
                ) {
                    Ok(chunk) => implementation_chunks.push(chunk),
                    Err(e) => warnings.push(format!(
                        "no implementation chunk for {}::{}: {e}",
                        file_name, symbol.name
                    )),
                }
            }
        }

        // Import targets become lightweight entities of their own so that
        // every stored `imports` relation resolves to a metadata chunk and
        // orphan sweeps leave it alone.
        let mut seen_imports: std::collections::HashSet<String> = std::collections::HashSet::new();
        for import in extraction.imports {
            if import.target.is_empty() {
                continue;
            }
            if seen_imports.insert(import.target.clone()) {
                match Entity::new(
                    import.target.clone(),
                    EntityType::Import,
                    vec![
                        format!("Import: {}", import.target),
                        format!("Imported in: {file_name}"),
                        format!("Import type: {}", import.import_type),
                    ],
                ) {
                    Ok(e) => entities.push(e.with_file_path(path)),
                    Err(e) => {
                        warnings.push(format!("skipped malformed import in {file_name}: {e}"))
                    }
                }
            }
            match Relation::imports(file_name.clone(), import.target, &import.import_type) {
                Ok(r) => relations.push(r.with_file_path(path)),
                Err(e) => warnings.push(format!("skipped malformed import in {file_name}: {e}")),
            }
        }

        ParserResult {
            file_path: path.to_path_buf(),
            entities,
            relations,
            implementation_chunks,
            warnings,
            errors: vec![],
            parsing_time_ms: 0,
            file_sha256: bytes_sha256(bytes),
            success: true,
        }
    }
}

fn capitalised_kind(kind: EntityType) -> &'static str {
    match kind {
        EntityType::Function => "Function",
        EntityType::Method => "Method",
        EntityType::Class => "Class",
        EntityType::Interface => "Interface",
        EntityType::Variable => "Variable",
        EntityType::Constant => "Constant",
        EntityType::Import => "Import",
        _ => "Symbol",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::RelationType;

    fn parse(name: &str, content: &str) -> ParserResult {
        let registry = ParserRegistry::new();
        registry.parse_bytes(Path::new(name), content.as_bytes())
    }

    #[test]
    fn python_functions_get_entities_chunks_and_contains() {
        let result = parse("a.py", "def foo():\n    return 1\n");
        assert!(result.success);

        let names: Vec<&str> = result.entities.iter().map(|e| e.name.as_str()).collect();
        assert!(names.contains(&"a.py"), "file entity always present");
        assert!(names.contains(&"foo"));

        assert_eq!(result.implementation_chunks.len(), 1);
        assert_eq!(result.implementation_chunks[0].entity_name, "foo");
        assert!(result.implementation_chunks[0].content.contains("return 1"));

        let contains: Vec<_> = result
            .relations
            .iter()
            .filter(|r| r.relation_type == RelationType::Contains)
            .collect();
        assert_eq!(contains.len(), 1);
        assert_eq!(contains[0].from_entity, "a.py");
        assert_eq!(contains[0].to_entity, "foo");
    }

    #[test]
    fn python_plain_import_carries_module_import_type() {
        let result = parse("b.py", "import a\ndef bar():\n    return 2\n");
        let imports: Vec<_> = result
            .relations
            .iter()
            .filter(|r| r.relation_type == RelationType::Imports)
            .collect();
        assert_eq!(imports.len(), 1);
        assert_eq!(imports[0].to_entity, "a");
        assert_eq!(
            imports[0].metadata.get("import_type").and_then(|v| v.as_str()),
            Some("module")
        );

        // The target gets its own lightweight entity so the relation's
        // endpoint resolves to a metadata chunk.
        let import_entity = result.entities.iter().find(|e| e.name == "a").unwrap();
        assert_eq!(import_entity.entity_type, EntityType::Import);
    }

    #[test]
    fn python_class_docstring_and_bases_extracted() {
        let src = "class Child(Base):\n    \"\"\"A child class.\"\"\"\n    def run(self):\n        pass\n";
        let result = parse("c.py", src);

        let class = result.entities.iter().find(|e| e.name == "Child").unwrap();
        assert_eq!(class.entity_type, EntityType::Class);
        assert_eq!(class.docstring.as_deref(), Some("A child class."));

        let method = result.entities.iter().find(|e| e.name == "run").unwrap();
        assert_eq!(method.entity_type, EntityType::Method);

        assert!(result
            .relations
            .iter()
            .any(|r| r.relation_type == RelationType::Inherits
                && r.from_entity == "Child"
                && r.to_entity == "Base"));
    }

    #[test]
    fn empty_file_yields_one_file_entity_and_nothing_else() {
        let result = parse("empty.py", "");
        assert!(result.success);
        assert_eq!(result.entities.len(), 1);
        assert_eq!(result.entities[0].entity_type, EntityType::File);
        assert!(result.relations.is_empty());
        assert!(result.implementation_chunks.is_empty());
    }

    #[test]
    fn syntax_error_reports_failure_not_entities() {
        let result = parse("broken.py", "def (:\n");
        assert!(!result.success);
        assert!(!result.errors.is_empty());
        assert!(result.entities.is_empty());
    }

    #[test]
    fn unsupported_extension_is_an_explicit_no_parser_error() {
        let result = parse("data.xyz", "whatever");
        assert!(!result.success);
        assert!(result.errors[0].contains("no parser"));
    }

    #[test]
    fn rust_impl_functions_are_methods() {
        let src = "pub struct Calc;\nimpl Calc {\n    pub fn add(&self, a: u32) -> u32 { a }\n}\nfn free() {}\n";
        let result = parse("calc.rs", src);
        assert!(result.success);

        let add = result.entities.iter().find(|e| e.name == "add").unwrap();
        assert_eq!(add.entity_type, EntityType::Method);
        let free = result.entities.iter().find(|e| e.name == "free").unwrap();
        assert_eq!(free.entity_type, EntityType::Function);
        let calc = result.entities.iter().find(|e| e.name == "Calc").unwrap();
        assert_eq!(calc.entity_type, EntityType::Class);
    }

    #[test]
    fn typescript_imports_and_interfaces() {
        let src = "import { x } from \"./dep\";\nexport interface Shape { area(): number }\nexport function draw(s: Shape): void {}\n";
        let result = parse("ui.ts", src);
        assert!(result.success);

        let shape = result.entities.iter().find(|e| e.name == "Shape").unwrap();
        assert_eq!(shape.entity_type, EntityType::Interface);
        assert!(result
            .implementation_chunks
            .iter()
            .all(|c| c.entity_name != "Shape"), "interfaces carry no implementation chunk");

        let import = result
            .relations
            .iter()
            .find(|r| r.relation_type == RelationType::Imports)
            .unwrap();
        assert_eq!(import.to_entity, "./dep");
    }

    #[test]
    fn parser_result_round_trips_through_serde() {
        let result = parse("a.py", "def foo():\n    return 1\n");
        let json = serde_json::to_string(&result).unwrap();
        let back: ParserResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back.entities, result.entities);
        assert_eq!(back.relations, result.relations);
        assert_eq!(back.implementation_chunks, result.implementation_chunks);
        assert_eq!(back.file_sha256, result.file_sha256);
        assert_eq!(back.success, result.success);
    }
}
