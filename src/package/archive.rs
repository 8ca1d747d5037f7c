use std::collections::HashMap;
use std::io::{Cursor, Read, Seek, Write};
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocFormat {
    Docx,
    Odt,
}

impl DocFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "docx" => Some(DocFormat::Docx),
            "odt" => Some(DocFormat::Odt),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DocFormat::Docx => "docx",
            DocFormat::Odt => "odt",
        }
    }

    pub fn primary_part(self) -> &'static str {
        match self {
            DocFormat::Docx => "word/document.xml",
            DocFormat::Odt => "content.xml",
        }
    }

    /// Entries whose text may carry placeholders, primary part first.
    pub fn is_text_part(self, entry_name: &str) -> bool {
        match self {
            DocFormat::Docx => {
                if entry_name == "word/document.xml" {
                    return true;
                }
                let Some(file) = entry_name.strip_prefix("word/") else {
                    return false;
                };
                !file.contains('/')
                    && file.ends_with(".xml")
                    && (file.starts_with("header") || file.starts_with("footer"))
            }
            DocFormat::Odt => entry_name == "content.xml" || entry_name == "styles.xml",
        }
    }
}

pub struct TemplatePackage {
    pub entries: Vec<PackageEntry>,
}

pub struct PackageEntry {
    pub name: String,
    pub data: Vec<u8>,
    pub compression: CompressionMethod,
    pub last_modified: zip::DateTime,
    pub unix_mode: Option<u32>,
    pub is_dir: bool,
}

impl TemplatePackage {
    pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        let mut zip = ZipArchive::new(Cursor::new(bytes)).context("read zip")?;
        let mut entries = Vec::with_capacity(zip.len());
        for i in 0..zip.len() {
            let mut file = zip.by_index(i).context("zip entry")?;
            let mut data = Vec::with_capacity(file.size() as usize);
            file.read_to_end(&mut data)
                .with_context(|| format!("read zip entry: {}", file.name()))?;
            entries.push(PackageEntry {
                name: file.name().to_string(),
                data,
                compression: file.compression(),
                last_modified: file.last_modified().unwrap_or_default(),
                unix_mode: file.unix_mode(),
                is_dir: file.is_dir(),
            });
        }
        Ok(Self { entries })
    }

    pub fn entry(&self, name: &str) -> Option<&PackageEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn has_entry(&self, name: &str) -> bool {
        self.entry(name).is_some()
    }

    pub fn text_part_names(&self, format: DocFormat) -> Vec<String> {
        let mut names: Vec<String> = self
            .entries
            .iter()
            .filter(|e| !e.is_dir && format.is_text_part(&e.name))
            .map(|e| e.name.clone())
            .collect();
        let primary = format.primary_part();
        names.sort_by_key(|n| n != primary);
        names
    }

    /// Writes every entry in its original order and compression. `replacements` override entry
    /// data; `additions` are appended after the existing entries (deflated).
    pub fn write_with_replacements<W: Write + Seek>(
        &self,
        out: W,
        replacements: &HashMap<String, Vec<u8>>,
        additions: &[(String, Vec<u8>)],
    ) -> anyhow::Result<()> {
        let mut zout = ZipWriter::new(out);
        for ent in &self.entries {
            let data = replacements.get(&ent.name).unwrap_or(&ent.data);
            let mut opts = SimpleFileOptions::default()
                .compression_method(ent.compression)
                .last_modified_time(ent.last_modified);
            if let Some(mode) = ent.unix_mode {
                opts = opts.unix_permissions(mode);
            }
            if ent.is_dir || ent.name.ends_with('/') {
                zout.add_directory(&ent.name, opts)
                    .with_context(|| format!("add zip dir: {}", ent.name))?;
            } else {
                zout.start_file(&ent.name, opts)
                    .with_context(|| format!("start zip file: {}", ent.name))?;
                zout.write_all(data)
                    .with_context(|| format!("write zip file: {}", ent.name))?;
            }
        }
        for (name, data) in additions {
            let opts = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
            zout.start_file(name.as_str(), opts)
                .with_context(|| format!("start zip file: {name}"))?;
            zout.write_all(data)
                .with_context(|| format!("write zip file: {name}"))?;
        }
        zout.finish().context("finish zip")?;
        Ok(())
    }
}
