use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use serde_json::Value;

use crate::error::{EngineError, Result};
use crate::merge::fields::StructuredContent;
use crate::schema::Schema;

/// Per-document-type schema persistence.
pub trait SchemaStore {
    fn get(&self, type_key: &str) -> Result<Option<Schema>>;
    fn put(&self, type_key: &str, schema: &Schema) -> Result<()>;
}

#[derive(Default)]
pub struct MemorySchemaStore {
    schemas: RwLock<HashMap<String, Schema>>,
}

impl MemorySchemaStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SchemaStore for MemorySchemaStore {
    fn get(&self, type_key: &str) -> Result<Option<Schema>> {
        Ok(self.schemas.read().get(type_key).cloned())
    }

    fn put(&self, type_key: &str, schema: &Schema) -> Result<()> {
        self.schemas
            .write()
            .insert(type_key.to_string(), schema.clone());
        Ok(())
    }
}

/// One `<type_key>.json` file per document type.
pub struct FileSchemaStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileSchemaStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, type_key: &str) -> PathBuf {
        let file: String = type_key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        let file = file.trim_matches('.');
        let file = if file.is_empty() { "_" } else { file };
        self.dir.join(format!("{file}.json"))
    }

    fn write_atomic(&self, path: &Path, json: &str) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("create schema dir: {}", self.dir.display()))?;
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir).context("create temp schema file")?;
        tmp.write_all(json.as_bytes()).context("write temp schema file")?;
        tmp.persist(path)
            .map_err(|e| anyhow!("persist schema {}: {}", path.display(), e.error))?;
        Ok(())
    }
}

impl SchemaStore for FileSchemaStore {
    fn get(&self, type_key: &str) -> Result<Option<Schema>> {
        let path = self.path_for(type_key);
        if !path.is_file() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("read schema: {}", path.display()))
            .map_err(EngineError::Store)?;
        let schema = Schema::from_json(&text)
            .with_context(|| format!("load schema: {}", path.display()))
            .map_err(EngineError::Store)?;
        Ok(Some(schema))
    }

    fn put(&self, type_key: &str, schema: &Schema) -> Result<()> {
        let path = self.path_for(type_key);
        let json = schema.to_json_pretty().map_err(EngineError::Store)?;
        let _guard = self.write_lock.lock();
        self.write_atomic(&path, &json).map_err(EngineError::Store)
    }
}

/// Raw, unnormalized field values of stored documents.
pub trait FieldValueSource {
    fn get_scalar(&self, doc_id: &str, slug: &str) -> Option<String>;
    /// JSON-encoded list of row objects.
    fn get_repeater(&self, doc_id: &str, slug: &str) -> Option<String>;
}

/// Values of one document: field blocks embedded in its body (preferred) and a flat meta map.
///
/// ```json
/// { "content": "<!-- docfill:field slug=\"intro\" --><p>Hi</p><!-- /docfill:field -->",
///   "meta": { "client_name": "ACME", "items": [{ "title": "A" }] } }
/// ```
#[derive(Clone, Debug, Default, Deserialize)]
pub struct RawValues {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub meta: IndexMap<String, Value>,
    #[serde(skip)]
    structured: IndexMap<String, String>,
}

impl RawValues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(text: &str) -> anyhow::Result<Self> {
        let mut values: RawValues = serde_json::from_str(text).context("parse values json")?;
        values.index_content();
        Ok(values)
    }

    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read values: {}", path.display()))?;
        Self::from_json(&text).with_context(|| format!("values file: {}", path.display()))
    }

    pub fn with_content(mut self, body: &str) -> Self {
        self.content = Some(body.to_string());
        self.index_content();
        self
    }

    pub fn with_meta(mut self, slug: &str, value: impl Into<Value>) -> Self {
        self.meta.insert(slug.to_string(), value.into());
        self
    }

    fn index_content(&mut self) {
        self.structured = self
            .content
            .as_deref()
            .map(|body| StructuredContent::parse(body).fields)
            .unwrap_or_default();
    }

    fn lookup(&self, slug: &str) -> Option<String> {
        if let Some(v) = self.structured.get(slug) {
            return Some(v.clone());
        }
        match self.meta.get(slug)? {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            Value::Bool(b) => Some(b.to_string()),
            Value::Number(n) => Some(n.to_string()),
            other => Some(other.to_string()),
        }
    }
}

impl FieldValueSource for RawValues {
    fn get_scalar(&self, _doc_id: &str, slug: &str) -> Option<String> {
        self.lookup(slug)
    }

    fn get_repeater(&self, _doc_id: &str, slug: &str) -> Option<String> {
        self.lookup(slug)
    }
}

/// Documents keyed by id.
impl FieldValueSource for HashMap<String, RawValues> {
    fn get_scalar(&self, doc_id: &str, slug: &str) -> Option<String> {
        self.get(doc_id)?.lookup(slug)
    }

    fn get_repeater(&self, doc_id: &str, slug: &str) -> Option<String> {
        self.get(doc_id)?.lookup(slug)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{DataType, FieldDef, FieldType};

    fn sample_schema() -> Schema {
        let mut s = Schema::empty();
        s.fields
            .push(FieldDef::new("client_name", FieldType::Single, DataType::Text));
        s
    }

    #[test]
    fn memory_store_round_trip_and_overwrite() {
        let store = MemorySchemaStore::new();
        assert!(store.get("invoice").expect("get").is_none());
        store.put("invoice", &sample_schema()).expect("put");
        assert_eq!(store.get("invoice").expect("get"), Some(sample_schema()));
        store.put("invoice", &Schema::empty()).expect("overwrite");
        assert!(store.get("invoice").expect("get").expect("some").is_empty());
    }

    #[test]
    fn file_store_writes_one_json_per_key() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileSchemaStore::new(dir.path().join("schemas"));
        store.put("sales/invoice", &sample_schema()).expect("put");
        let path = store.path_for("sales/invoice");
        assert_eq!(path.file_name().and_then(|n| n.to_str()), Some("sales_invoice.json"));
        assert!(path.is_file());
        assert_eq!(store.get("sales/invoice").expect("get"), Some(sample_schema()));
        assert!(store.get("other").expect("get").is_none());
    }

    #[test]
    fn file_store_legacy_schema_is_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileSchemaStore::new(dir.path());
        std::fs::write(store.path_for("old"), r#"{"fields":[{"slug":"x"}]}"#).expect("write");
        let loaded = store.get("old").expect("get").expect("some");
        assert!(loaded.is_empty());
    }

    #[test]
    fn structured_content_wins_over_meta() {
        let values = RawValues::new()
            .with_meta("intro", "meta intro")
            .with_meta("total", 12.5)
            .with_meta("items", serde_json::json!([{"title": "A"}]))
            .with_content(r#"<!-- docfill:field slug="intro" --><p>Body intro</p><!-- /docfill:field -->"#);
        assert_eq!(values.get_scalar("1", "intro").as_deref(), Some("<p>Body intro</p>"));
        assert_eq!(values.get_scalar("1", "total").as_deref(), Some("12.5"));
        assert_eq!(values.get_repeater("1", "items").as_deref(), Some(r#"[{"title":"A"}]"#));
        assert!(values.get_scalar("1", "missing").is_none());
    }

    #[test]
    fn values_by_document_id() {
        let mut docs: HashMap<String, RawValues> = HashMap::new();
        docs.insert("42".to_string(), RawValues::new().with_meta("a", "x"));
        assert_eq!(docs.get_scalar("42", "a").as_deref(), Some("x"));
        assert!(docs.get_scalar("7", "a").is_none());
    }
}
