//! Canonical records extracted from source code: entities, relations, and
//! the chunks that actually get embedded and stored.
//!
//! Everything here is an immutable value type with a validating constructor.
//! Deterministic string IDs are minted at construction time; the vector
//! store's u64 IDs are derived from them in `hashing::point_id`.

use anyhow::{bail, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::hashing::{content_hash, short_hash};

// ---------------------------------------------------------------------------
// Type enums
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Project,
    Directory,
    File,
    Class,
    Interface,
    Function,
    Method,
    Variable,
    Import,
    Module,
    Constant,
    Documentation,
    Test,
    ChatHistory,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Project => "project",
            EntityType::Directory => "directory",
            EntityType::File => "file",
            EntityType::Class => "class",
            EntityType::Interface => "interface",
            EntityType::Function => "function",
            EntityType::Method => "method",
            EntityType::Variable => "variable",
            EntityType::Import => "import",
            EntityType::Module => "module",
            EntityType::Constant => "constant",
            EntityType::Documentation => "documentation",
            EntityType::Test => "test",
            EntityType::ChatHistory => "chat_history",
        }
    }

    /// Entity types whose source body is worth storing as an implementation
    /// chunk. Variables/imports/constants never get one, even on name
    /// collision with a function.
    pub fn carries_implementation(&self) -> bool {
        matches!(self, EntityType::Function | EntityType::Class | EntityType::Method)
    }

    /// Title-cased label used for the default observation.
    fn title(&self) -> &'static str {
        match self {
            EntityType::Project => "Project",
            EntityType::Directory => "Directory",
            EntityType::File => "File",
            EntityType::Class => "Class",
            EntityType::Interface => "Interface",
            EntityType::Function => "Function",
            EntityType::Method => "Method",
            EntityType::Variable => "Variable",
            EntityType::Import => "Import",
            EntityType::Module => "Module",
            EntityType::Constant => "Constant",
            EntityType::Documentation => "Documentation",
            EntityType::Test => "Test",
            EntityType::ChatHistory => "Chat History",
        }
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationType {
    Contains,
    Imports,
    Inherits,
    Calls,
    Uses,
    Implements,
    Extends,
    Documents,
    Tests,
    References,
}

impl RelationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationType::Contains => "contains",
            RelationType::Imports => "imports",
            RelationType::Inherits => "inherits",
            RelationType::Calls => "calls",
            RelationType::Uses => "uses",
            RelationType::Implements => "implements",
            RelationType::Extends => "extends",
            RelationType::Documents => "documents",
            RelationType::Tests => "tests",
            RelationType::References => "references",
        }
    }

    pub fn is_bidirectional(&self) -> bool {
        matches!(self, RelationType::Uses | RelationType::References)
    }
}

impl std::fmt::Display for RelationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Entity
// ---------------------------------------------------------------------------

/// A code-level concept extracted by a parser.
///
/// Observations are composed once at construction; there is no in-place
/// update API. `with_observation` returns a new value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub name: String,
    pub entity_type: EntityType,
    /// Never empty: the constructor injects `"<Type>: <name>"` when no
    /// observations are supplied.
    pub observations: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line_number: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_line_number: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docstring: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub complexity_score: Option<u32>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

impl Entity {
    pub fn new(
        name: impl Into<String>,
        entity_type: EntityType,
        observations: Vec<String>,
    ) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            bail!("Entity name cannot be empty");
        }
        let observations = if observations.is_empty() {
            vec![format!("{}: {}", entity_type.title(), name)]
        } else {
            observations
        };
        Ok(Self {
            name,
            entity_type,
            observations,
            file_path: None,
            line_number: None,
            end_line_number: None,
            docstring: None,
            signature: None,
            complexity_score: None,
            metadata: BTreeMap::new(),
        })
    }

    pub fn with_file_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.file_path = Some(path.into());
        self
    }

    pub fn with_lines(mut self, start: u32, end: Option<u32>) -> Self {
        self.line_number = Some(start);
        self.end_line_number = end;
        self
    }

    pub fn with_docstring(mut self, docstring: impl Into<String>) -> Self {
        self.docstring = Some(docstring.into());
        self
    }

    pub fn with_signature(mut self, signature: impl Into<String>) -> Self {
        self.signature = Some(signature.into());
        self
    }

    pub fn with_metadata(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    /// New entity with one more observation (immutable append).
    pub fn with_observation(&self, observation: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.observations.push(observation.into());
        next
    }

    /// `"<file_path>::<name>"` — the composite key used for change tracking
    /// and entity-level replacement. Falls back to the bare name for
    /// entities without a file.
    pub fn composite_id(&self) -> String {
        match &self.file_path {
            Some(p) => format!("{}::{}", p.display(), self.name),
            None => self.name.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Relation
// ---------------------------------------------------------------------------

/// Directed edge between two entities, owned by the file declaring it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    pub from_entity: String,
    pub to_entity: String,
    pub relation_type: RelationType,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(default = "default_confidence")]
    pub confidence: f32,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
    /// The file that declared this edge — drives replacement and ownership.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<PathBuf>,
}

fn default_confidence() -> f32 {
    1.0
}

impl Relation {
    pub fn new(
        from_entity: impl Into<String>,
        to_entity: impl Into<String>,
        relation_type: RelationType,
    ) -> Result<Self> {
        let from_entity = from_entity.into();
        let to_entity = to_entity.into();
        if from_entity.is_empty() || to_entity.is_empty() {
            bail!("Both from_entity and to_entity must be non-empty");
        }
        Ok(Self {
            from_entity,
            to_entity,
            relation_type,
            context: None,
            confidence: 1.0,
            metadata: BTreeMap::new(),
            file_path: None,
        })
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn with_confidence(mut self, confidence: f32) -> Result<Self> {
        if !(0.0..=1.0).contains(&confidence) {
            bail!("Confidence must be between 0.0 and 1.0, got {confidence}");
        }
        self.confidence = confidence;
        Ok(self)
    }

    pub fn with_metadata(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    pub fn with_file_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.file_path = Some(path.into());
        self
    }

    /// A `contains` edge from a parent scope to a child entity.
    pub fn contains(parent: impl Into<String>, child: impl Into<String>) -> Result<Self> {
        let parent = parent.into();
        let child = child.into();
        let context = format!("{parent} contains {child}");
        Ok(Self::new(parent, child, RelationType::Contains)?.with_context(context))
    }

    /// An `imports` edge; `import_type` keeps the chunk ID unique across
    /// different forms of the same target (module vs symbol vs relative).
    pub fn imports(
        importer: impl Into<String>,
        imported: impl Into<String>,
        import_type: &str,
    ) -> Result<Self> {
        Ok(Self::new(importer, imported, RelationType::Imports)?
            .with_context(format!("Imports {import_type}"))
            .with_metadata("import_type", Value::String(import_type.to_string())))
    }

    pub fn inherits(subclass: impl Into<String>, superclass: impl Into<String>) -> Result<Self> {
        let sub = subclass.into();
        let sup = superclass.into();
        let context = format!("{sub} inherits from {sup}");
        Ok(Self::new(sub, sup, RelationType::Inherits)?.with_context(context))
    }

    pub fn calls(caller: impl Into<String>, callee: impl Into<String>) -> Result<Self> {
        let caller = caller.into();
        let callee = callee.into();
        let context = format!("{caller} calls {callee}");
        Ok(Self::new(caller, callee, RelationType::Calls)?.with_context(context))
    }

    /// Reverse edge — only `uses` and `references` are bidirectional.
    pub fn reverse(&self) -> Result<Relation> {
        if !self.relation_type.is_bidirectional() {
            bail!("Relation type {} is not bidirectional", self.relation_type);
        }
        let mut rev = self.clone();
        std::mem::swap(&mut rev.from_entity, &mut rev.to_entity);
        Ok(rev)
    }
}

// ---------------------------------------------------------------------------
// Chunks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkKind {
    Metadata,
    Implementation,
}

impl ChunkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkKind::Metadata => "metadata",
            ChunkKind::Implementation => "implementation",
        }
    }
}

/// The unit actually embedded and written to the vector store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityChunk {
    /// Deterministic string ID (hashed to a u64 at write time).
    pub id: String,
    pub entity_name: String,
    pub chunk_type: ChunkKind,
    pub content: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

impl EntityChunk {
    fn validated(
        id: String,
        entity_name: String,
        chunk_type: ChunkKind,
        content: String,
        metadata: BTreeMap<String, Value>,
    ) -> Result<Self> {
        if id.is_empty() || entity_name.is_empty() || content.is_empty() {
            bail!("id, entity_name, and content cannot be empty");
        }
        Ok(Self { id, entity_name, chunk_type, content, metadata })
    }

    /// Build the metadata chunk for `entity` (one exists for every stored
    /// entity). `has_implementation` marks whether a same-named
    /// implementation chunk accompanies it.
    pub fn metadata_for(entity: &Entity, has_implementation: bool) -> Result<Self> {
        let content = weighted_observation_content(entity);
        let content_bm25 = format_bm25_content(entity);

        let file = entity
            .file_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default();

        // Collision-resistant ID: same-named entities on the same line are
        // disambiguated by the end line AND an observations hash (repeated
        // inline definitions would otherwise collide).
        let obs8 = short_hash(&format!("{:?}", entity.observations), 8);
        let uniq = short_hash(
            &format!(
                "{}::{}::{}::metadata::{}::{}::{}",
                file,
                entity.entity_type,
                entity.name,
                entity.line_number.unwrap_or(0),
                entity.end_line_number.unwrap_or(0),
                obs8,
            ),
            16,
        );
        let id = format!("{}::{}::{}::metadata::{}", file, entity.entity_type, entity.name, uniq);

        let mut metadata: BTreeMap<String, Value> = BTreeMap::new();
        metadata.insert("entity_type".into(), Value::String(entity.entity_type.to_string()));
        metadata.insert("file_path".into(), Value::String(file));
        if let Some(line) = entity.line_number {
            metadata.insert("line_number".into(), Value::from(line));
        }
        if let Some(end) = entity.end_line_number {
            metadata.insert("end_line_number".into(), Value::from(end));
        }
        metadata.insert("has_implementation".into(), Value::Bool(has_implementation));
        metadata.insert(
            "observations".into(),
            Value::Array(entity.observations.iter().cloned().map(Value::String).collect()),
        );
        metadata.insert("content_bm25".into(), Value::String(content_bm25));
        for (k, v) in &entity.metadata {
            metadata.entry(k.clone()).or_insert_with(|| v.clone());
        }

        Self::validated(id, entity.name.clone(), ChunkKind::Metadata, content, metadata)
    }

    /// Build an implementation chunk carrying the raw source body of a
    /// function/class/method. The ID deliberately excludes the body hash:
    /// content distinguishes versions, the ID names the entity.
    pub fn implementation_for(
        file_path: &Path,
        entity_type: EntityType,
        entity_name: &str,
        body: &str,
        start_line: u32,
        end_line: u32,
    ) -> Result<Self> {
        let file = file_path.display().to_string();
        let id = format!("{}::{}::{}::implementation", file, entity_type, entity_name);

        let mut metadata: BTreeMap<String, Value> = BTreeMap::new();
        metadata.insert("entity_type".into(), Value::String(entity_type.to_string()));
        metadata.insert("file_path".into(), Value::String(file));
        metadata.insert("start_line".into(), Value::from(start_line));
        metadata.insert("end_line".into(), Value::from(end_line));

        Self::validated(
            id,
            entity_name.to_string(),
            ChunkKind::Implementation,
            body.to_string(),
            metadata,
        )
    }

    pub fn file_path(&self) -> Option<String> {
        self.metadata.get("file_path").and_then(|v| v.as_str()).map(str::to_string)
    }

    /// `"<file_path>::<entity_name>"` composite key.
    pub fn composite_id(&self) -> String {
        format!("{}::{}", self.file_path().unwrap_or_default(), self.entity_name)
    }

    /// BM25-optimised text when present, else the dense content. Sparse
    /// embedding never skips a chunk over a missing `content_bm25`.
    pub fn bm25_text(&self) -> &str {
        self.metadata
            .get("content_bm25")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.content)
    }

    pub fn to_payload(&self) -> ChunkPayload {
        let hash = content_hash(&self.content);
        match self.chunk_type {
            ChunkKind::Metadata => ChunkPayload::Metadata {
                entity_name: self.entity_name.clone(),
                content: self.content.clone(),
                content_hash: hash,
                metadata: self.metadata.clone(),
            },
            ChunkKind::Implementation => ChunkPayload::Implementation {
                entity_name: self.entity_name.clone(),
                content: self.content.clone(),
                content_hash: hash,
                metadata: self.metadata.clone(),
            },
        }
    }

    /// Inverse of `to_payload` for metadata/implementation payloads.
    pub fn from_payload(id: &str, payload: &ChunkPayload) -> Result<Self> {
        match payload {
            ChunkPayload::Metadata { entity_name, content, metadata, .. } => Self::validated(
                id.to_string(),
                entity_name.clone(),
                ChunkKind::Metadata,
                content.clone(),
                metadata.clone(),
            ),
            ChunkPayload::Implementation { entity_name, content, metadata, .. } => Self::validated(
                id.to_string(),
                entity_name.clone(),
                ChunkKind::Implementation,
                content.clone(),
                metadata.clone(),
            ),
            ChunkPayload::Relation { .. } => bail!("relation payload is not an entity chunk"),
        }
    }
}

/// A relation rendered as a single storable chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationChunk {
    pub id: String,
    pub from_entity: String,
    pub to_entity: String,
    pub relation_type: RelationType,
    /// Natural-language form: `"<from> <relation_type> <to>" [" (<context>)"]`.
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    pub confidence: f32,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

impl RelationChunk {
    pub fn from_relation(relation: &Relation) -> Result<Self> {
        if relation.from_entity.is_empty() || relation.to_entity.is_empty() {
            bail!("id, from_entity, and to_entity cannot be empty");
        }

        let base = format!(
            "{}::{}::{}",
            relation.from_entity, relation.relation_type, relation.to_entity
        );
        let import_type = relation
            .metadata
            .get("import_type")
            .and_then(|v| v.as_str())
            .unwrap_or("");

        // Import type and context distinguish different edges between the
        // same endpoints. When neither is present a deterministic short hash
        // keeps the ID unique — two parses of the same edge produce the same ID.
        let id = if import_type.is_empty() && relation.context.is_none() {
            format!("{}::{}", base, short_hash(&base, 8))
        } else {
            let mut id = base;
            if !import_type.is_empty() {
                id.push_str("::");
                id.push_str(import_type);
            }
            if let Some(ctx) = &relation.context {
                id.push_str("::");
                id.push_str(ctx);
            }
            id
        };

        let mut content = format!(
            "{} {} {}",
            relation.from_entity, relation.relation_type, relation.to_entity
        );
        if let Some(ctx) = &relation.context {
            content.push_str(&format!(" ({ctx})"));
        }

        let mut metadata = relation.metadata.clone();
        metadata.insert("entity_type".into(), Value::String("relation".into()));
        if let Some(file) = &relation.file_path {
            metadata
                .entry("file_path".into())
                .or_insert_with(|| Value::String(file.display().to_string()));
        }

        Ok(Self {
            id,
            from_entity: relation.from_entity.clone(),
            to_entity: relation.to_entity.clone(),
            relation_type: relation.relation_type,
            content,
            context: relation.context.clone(),
            confidence: relation.confidence,
            metadata,
        })
    }

    /// Text handed to the dense embedder.
    pub fn embedding_text(&self) -> String {
        let mut text = format!(
            "Relation: {} {} {}",
            self.from_entity, self.relation_type, self.to_entity
        );
        if let Some(ctx) = &self.context {
            text.push_str(&format!(" | Context: {ctx}"));
        }
        text
    }

    pub fn to_payload(&self) -> ChunkPayload {
        ChunkPayload::Relation {
            entity_name: self.from_entity.clone(),
            relation_target: self.to_entity.clone(),
            relation_type: self.relation_type,
            content: self.content.clone(),
            content_hash: content_hash(&self.content),
            context: self.context.clone(),
            confidence: self.confidence,
            metadata: self.metadata.clone(),
        }
    }

    /// Reconstruct the relation this chunk carries (round-trip inverse).
    pub fn to_relation(&self) -> Result<Relation> {
        let mut relation = Relation::new(
            self.from_entity.clone(),
            self.to_entity.clone(),
            self.relation_type,
        )?
        .with_confidence(self.confidence)?;
        relation.context = self.context.clone();
        relation.metadata = self
            .metadata
            .iter()
            .filter(|(k, _)| k.as_str() != "entity_type" && k.as_str() != "file_path")
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        relation.file_path = self
            .metadata
            .get("file_path")
            .and_then(|v| v.as_str())
            .map(PathBuf::from);
        Ok(relation)
    }
}

// ---------------------------------------------------------------------------
// Store payloads — one tagged enum, one serialiser
// ---------------------------------------------------------------------------

/// Wire shape written to the vector store. The `chunk_type` tag replaces the
/// original duck-typed "has field" checks with an exhaustive variant match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "chunk_type", rename_all = "lowercase")]
pub enum ChunkPayload {
    Metadata {
        entity_name: String,
        content: String,
        content_hash: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        metadata: BTreeMap<String, Value>,
    },
    Implementation {
        entity_name: String,
        content: String,
        content_hash: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        metadata: BTreeMap<String, Value>,
    },
    Relation {
        /// Primary entity for search (the edge's source).
        entity_name: String,
        relation_target: String,
        relation_type: RelationType,
        content: String,
        content_hash: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        context: Option<String>,
        #[serde(default = "default_confidence")]
        confidence: f32,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        metadata: BTreeMap<String, Value>,
    },
}

impl ChunkPayload {
    pub fn chunk_type(&self) -> &'static str {
        match self {
            ChunkPayload::Metadata { .. } => "metadata",
            ChunkPayload::Implementation { .. } => "implementation",
            ChunkPayload::Relation { .. } => "relation",
        }
    }

    pub fn entity_name(&self) -> &str {
        match self {
            ChunkPayload::Metadata { entity_name, .. }
            | ChunkPayload::Implementation { entity_name, .. }
            | ChunkPayload::Relation { entity_name, .. } => entity_name,
        }
    }

    pub fn content(&self) -> &str {
        match self {
            ChunkPayload::Metadata { content, .. }
            | ChunkPayload::Implementation { content, .. }
            | ChunkPayload::Relation { content, .. } => content,
        }
    }

    pub fn content_hash(&self) -> &str {
        match self {
            ChunkPayload::Metadata { content_hash, .. }
            | ChunkPayload::Implementation { content_hash, .. }
            | ChunkPayload::Relation { content_hash, .. } => content_hash,
        }
    }

    pub fn metadata(&self) -> &BTreeMap<String, Value> {
        match self {
            ChunkPayload::Metadata { metadata, .. }
            | ChunkPayload::Implementation { metadata, .. }
            | ChunkPayload::Relation { metadata, .. } => metadata,
        }
    }

    pub fn file_path(&self) -> Option<&str> {
        self.metadata().get("file_path").and_then(|v| v.as_str())
    }

    pub fn relation_target(&self) -> Option<&str> {
        match self {
            ChunkPayload::Relation { relation_target, .. } => Some(relation_target),
            _ => None,
        }
    }

    pub fn relation_type(&self) -> Option<RelationType> {
        match self {
            ChunkPayload::Relation { relation_type, .. } => Some(*relation_type),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Metadata content shaping
// ---------------------------------------------------------------------------

/// Join observations with ` | `, repeating the high-signal ones so the dense
/// embedding weights declarations over location noise.
fn weighted_observation_content(entity: &Entity) -> String {
    let mut parts: Vec<String> = Vec::new();

    if let Some(sig) = &entity.signature {
        let text = format!("Signature: {sig}");
        for _ in 0..3 {
            parts.push(text.clone());
        }
    }
    if let Some(doc) = &entity.docstring {
        let text = format!("Description: {doc}");
        for _ in 0..2 {
            parts.push(text.clone());
        }
    }

    for obs in &entity.observations {
        let lower = obs.to_lowercase();
        let weight = if ["class:", "function:", "method:", "interface:", "signature:"]
            .iter()
            .any(|k| lower.contains(k))
        {
            3
        } else if ["purpose:", "responsibility:", "description:"]
            .iter()
            .any(|k| lower.contains(k))
        {
            2
        } else {
            1
        };
        for _ in 0..weight {
            parts.push(obs.clone());
        }
    }

    parts.join(" | ")
}

fn camel_split_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"([a-z0-9])([A-Z])").unwrap())
}

/// Six-component searchable text for the sparse (BM25) side: doubled name,
/// spaced name, primary description, entity type, file name, key methods.
fn format_bm25_content(entity: &Entity) -> String {
    let entity_name = if entity.entity_type == EntityType::File {
        entity
            .file_path
            .as_ref()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| entity.name.clone())
    } else {
        entity.name.clone()
    };

    let spaced = camel_split_re()
        .replace_all(&entity_name, "$1 $2")
        .replace(['_', '-'], " ");

    let technical_prefixes = [
        "class:", "function:", "method:", "signature:", "calls:", "parameters:", "returns:",
        "behaviors:", "attributes:", "complexity:", "async:", "line:", "key methods:",
    ];
    let mut primary = String::new();
    for obs in &entity.observations {
        let lower = obs.to_lowercase();
        if ["purpose:", "responsibility:", "description:"].iter().any(|p| lower.contains(p)) {
            if let Some((_, rest)) = obs.split_once(':') {
                primary = rest.trim().to_string();
                break;
            }
        } else if !technical_prefixes.iter().any(|p| lower.contains(p)) {
            primary = obs.trim().to_string();
            break;
        }
    }
    if primary.is_empty() {
        if let Some(doc) = &entity.docstring {
            primary = doc.clone();
        }
    }

    let file_name = entity
        .file_path
        .as_ref()
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    let mut key_methods: Vec<String> = Vec::new();
    for obs in &entity.observations {
        let lower = obs.to_lowercase();
        if let Some(idx) = lower.find("methods:") {
            let tail = &obs[idx + "methods:".len()..];
            key_methods = tail
                .split(',')
                .take(4)
                .map(|m| m.trim().to_string())
                .filter(|m| !m.is_empty() && !m.starts_with('('))
                .collect();
            break;
        }
    }

    let components = [
        format!("{entity_name} {entity_name}"),
        if spaced != entity_name { spaced } else { String::new() },
        primary,
        entity.entity_type.to_string(),
        file_name,
        key_methods.join(" "),
    ];

    components
        .iter()
        .filter(|c| !c.is_empty())
        .cloned()
        .collect::<Vec<_>>()
        .join(" ")
}
