pub mod archive;
pub mod heal;
pub mod xml;

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::{EngineError, Result};
use archive::{DocFormat, TemplatePackage};

pub struct LoadedTemplate {
    pub path: PathBuf,
    pub format: DocFormat,
    pub package: TemplatePackage,
    /// Hex SHA-256 of the template bytes.
    pub hash: String,
}

impl LoadedTemplate {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Reads and validates a DOCX/ODT template.
pub fn open_template(path: &Path) -> Result<LoadedTemplate> {
    if !path.is_file() {
        return Err(EngineError::TemplateMissing(path.to_path_buf()));
    }
    let format = DocFormat::from_path(path).ok_or_else(|| EngineError::TemplateInvalid {
        path: path.to_path_buf(),
        reason: "unsupported extension (expected .docx or .odt)".to_string(),
    })?;
    let bytes = std::fs::read(path).map_err(|e| EngineError::TemplateInvalid {
        path: path.to_path_buf(),
        reason: format!("read: {e}"),
    })?;
    let package = TemplatePackage::from_bytes(&bytes).map_err(|e| EngineError::TemplateInvalid {
        path: path.to_path_buf(),
        reason: format!("{e:#}"),
    })?;
    if !package.has_entry(format.primary_part()) {
        return Err(EngineError::TemplateCorrupted {
            path: path.to_path_buf(),
            entry: format.primary_part().to_string(),
        });
    }
    let hash = hex::encode(Sha256::digest(&bytes));
    Ok(LoadedTemplate {
        path: path.to_path_buf(),
        format,
        package,
        hash,
    })
}
