use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("template file not found: {}", .0.display())]
    TemplateMissing(PathBuf),

    #[error("template is not a DOCX/ODT package: {}: {reason}", .path.display())]
    TemplateInvalid { path: PathBuf, reason: String },

    #[error("template package is missing {entry}: {}", .path.display())]
    TemplateCorrupted { path: PathBuf, entry: String },

    #[error("no template configured for document type `{0}`")]
    SourceMissing(String),

    #[error("schema extraction failed: {0:#}")]
    SchemaExtractionFailed(anyhow::Error),

    #[error("merge failed: {0:#}")]
    MergeFailed(anyhow::Error),

    #[error("schema store: {0:#}")]
    Store(anyhow::Error),
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
