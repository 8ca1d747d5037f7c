use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{EngineError, Result};
use crate::merge::engine::{MergeEngine, MergeOptions};
use crate::merge::fields::{MergeContext, MergeFieldBuilder};
use crate::package::{open_template, LoadedTemplate};
use crate::progress::ConsoleProgress;
use crate::schema::Schema;
use crate::store::{FieldValueSource, SchemaStore};
use crate::template::extract::extract_loaded;

/// Maps a document type to its template file.
pub trait TemplateRegistry {
    fn template_for(&self, type_key: &str) -> Option<PathBuf>;
}

#[derive(Clone, Debug, Default)]
pub struct TemplateMap {
    templates: HashMap<String, PathBuf>,
}

impl TemplateMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, type_key: &str, path: impl Into<PathBuf>) {
        self.templates.insert(type_key.to_string(), path.into());
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

impl From<HashMap<String, PathBuf>> for TemplateMap {
    fn from(templates: HashMap<String, PathBuf>) -> Self {
        Self { templates }
    }
}

impl TemplateRegistry for TemplateMap {
    fn template_for(&self, type_key: &str) -> Option<PathBuf> {
        self.templates.get(type_key).cloned()
    }
}

#[derive(Clone, Debug)]
pub struct GenerateRequest {
    pub type_key: String,
    pub doc_id: String,
    pub output: PathBuf,
}

impl GenerateRequest {
    pub fn new(type_key: &str, doc_id: &str, output: impl Into<PathBuf>) -> Self {
        Self {
            type_key: type_key.to_string(),
            doc_id: doc_id.to_string(),
            output: output.into(),
        }
    }
}

/// Document generation for stored documents: template lookup, schema, values, merge.
pub struct Generator<'a> {
    registry: &'a dyn TemplateRegistry,
    store: &'a dyn SchemaStore,
    values: &'a dyn FieldValueSource,
    progress: &'a ConsoleProgress,
    builder: MergeFieldBuilder,
    options: MergeOptions,
}

impl<'a> Generator<'a> {
    pub fn new(
        registry: &'a dyn TemplateRegistry,
        store: &'a dyn SchemaStore,
        values: &'a dyn FieldValueSource,
        progress: &'a ConsoleProgress,
    ) -> Self {
        Self {
            registry,
            store,
            values,
            progress,
            builder: MergeFieldBuilder::default(),
            options: MergeOptions::default(),
        }
    }

    pub fn with_builder(mut self, builder: MergeFieldBuilder) -> Self {
        self.builder = builder;
        self
    }

    pub fn with_merge_options(mut self, options: MergeOptions) -> Self {
        self.options = options;
        self
    }

    pub fn generate(&self, request: &GenerateRequest) -> Result<PathBuf> {
        let template = self.open(&request.type_key)?;
        let schema = self.schema_for(&request.type_key, &template)?;
        let ctx = self.builder.build(&schema, self.values, &request.doc_id);
        self.progress.info(format!(
            "generate: type={} doc={} fields={} repeaters={}",
            request.type_key,
            request.doc_id,
            schema.fields.len(),
            schema.repeaters.len()
        ));
        self.merge(&template, &schema, &ctx, &request.output)
    }

    /// Extracts the template schema and overwrites whatever the store holds for `type_key`.
    pub fn extract_and_store(&self, type_key: &str) -> Result<Schema> {
        let template = self.open(type_key)?;
        let schema = extract_loaded(&template)?;
        self.store.put(type_key, &schema)?;
        self.progress.info(format!(
            "stored schema: type={type_key} fields={} repeaters={}",
            schema.fields.len(),
            schema.repeaters.len()
        ));
        Ok(schema)
    }

    /// Stored schema, or a fresh in-memory extraction when nothing usable is stored.
    pub fn schema_for(&self, type_key: &str, template: &LoadedTemplate) -> Result<Schema> {
        match self.store.get(type_key)? {
            Some(schema) if !schema.is_empty() => Ok(schema),
            _ => {
                self.progress
                    .info(format!("no stored schema for `{type_key}`, extracting"));
                extract_loaded(template)
            }
        }
    }

    fn open(&self, type_key: &str) -> Result<LoadedTemplate> {
        let path = self
            .registry
            .template_for(type_key)
            .ok_or_else(|| EngineError::SourceMissing(type_key.to_string()))?;
        open_template(&path)
    }

    fn merge(
        &self,
        template: &LoadedTemplate,
        schema: &Schema,
        ctx: &MergeContext,
        output: &Path,
    ) -> Result<PathBuf> {
        MergeEngine::with_options(self.progress, self.options.clone()).merge(template, schema, ctx, output)
    }
}
