use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

use crate::merge::engine::MergeOptions;
use crate::merge::fields::{MergeFieldBuilder, MAX_REPEATER_ITEMS};
use crate::pipeline::TemplateMap;
use crate::values::normalize::DEFAULT_DATE_FORMAT;

pub const CONFIG_FILE_NAME: &str = "docfill.toml";
pub const CONFIG_ENV_VAR: &str = "DOCFILL_CONFIG";

#[derive(Clone, Debug, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub store: StoreSection,
    /// Document type key -> template path (relative paths resolve against the config file).
    #[serde(default)]
    pub templates: HashMap<String, PathBuf>,
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct EngineSection {
    #[serde(default)]
    pub max_repeater_items: Option<usize>,
    /// PHP-style date pattern used when a date field has no `frm`, e.g. `d/m/Y`.
    #[serde(default)]
    pub default_date_format: Option<String>,
    #[serde(default)]
    pub scrub_array_literal: Option<bool>,
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct StoreSection {
    #[serde(default)]
    pub schema_dir: Option<PathBuf>,
}

/// Effective settings with defaults applied and paths made absolute.
#[derive(Clone, Debug)]
pub struct ResolvedConfig {
    pub config_path: Option<PathBuf>,
    pub builder: MergeFieldBuilder,
    pub merge: MergeOptions,
    pub schema_dir: PathBuf,
    pub templates: TemplateMap,
}

impl ResolvedConfig {
    /// `--config`, then `$DOCFILL_CONFIG`, then `docfill.toml` searched upwards. A missing file
    /// means defaults.
    pub fn locate(explicit: Option<PathBuf>, workdir: &Path) -> anyhow::Result<Self> {
        let cfg_file = explicit
            .or_else(|| std::env::var(CONFIG_ENV_VAR).ok().map(PathBuf::from))
            .or_else(|| find_default_config(workdir, CONFIG_FILE_NAME));
        match cfg_file {
            Some(p) if p.exists() => {
                let cfg = load_config(&p)?;
                Ok(Self::from_app_config(&cfg, Some(&p), workdir))
            }
            _ => Ok(Self::from_app_config(&AppConfig::default(), None, workdir)),
        }
    }

    pub fn from_app_config(cfg: &AppConfig, config_path: Option<&Path>, workdir: &Path) -> Self {
        let base = config_path
            .and_then(|p| p.parent())
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(workdir);
        let resolve = |p: &Path| {
            if p.is_relative() {
                base.join(p)
            } else {
                p.to_path_buf()
            }
        };

        let builder = MergeFieldBuilder {
            max_items: cfg.engine.max_repeater_items.unwrap_or(MAX_REPEATER_ITEMS),
            default_date_format: cfg
                .engine
                .default_date_format
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .unwrap_or(DEFAULT_DATE_FORMAT)
                .to_string(),
        };
        let merge = MergeOptions {
            scrub_array_literal: cfg.engine.scrub_array_literal.unwrap_or(true),
        };
        let schema_dir = resolve(
            cfg.store
                .schema_dir
                .as_deref()
                .unwrap_or_else(|| Path::new("schemas")),
        );
        let mut templates = TemplateMap::new();
        for (key, path) in &cfg.templates {
            templates.insert(key, resolve(path));
        }

        Self {
            config_path: config_path.map(Path::to_path_buf),
            builder,
            merge,
            schema_dir,
            templates,
        }
    }
}

pub fn find_file_upwards(start_dir: &Path, filename: &str, max_levels: usize) -> Option<PathBuf> {
    let mut dir = start_dir;
    for _ in 0..=max_levels {
        let candidate = dir.join(filename);
        if candidate.is_file() {
            return Some(candidate);
        }
        dir = dir.parent()?;
    }
    None
}

pub fn find_default_config(workdir: &Path, filename: &str) -> Option<PathBuf> {
    if let Ok(cwd) = std::env::current_dir() {
        if let Some(p) = find_file_upwards(&cwd, filename, 8) {
            return Some(p);
        }
    }
    if let Some(p) = find_file_upwards(workdir, filename, 8) {
        return Some(p);
    }
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            if let Some(p) = find_file_upwards(dir, filename, 10) {
                return Some(p);
            }
        }
    }
    None
}

pub fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read config: {}", path.display()))?;
    let cfg: AppConfig = toml::from_str(&text).context("parse config toml")?;
    Ok(cfg)
}

const DEFAULT_CONFIG_TOML: &str = r#"[engine]
# Rows beyond this count are dropped from every repeater.
max_repeater_items = 50
# Used for date fields without an explicit `frm` parameter.
default_date_format = "d/m/Y"
# Remove the stray word `Array` from generated documents.
scrub_array_literal = true

[store]
# One <type_key>.json schema per document type.
schema_dir = "schemas"

[templates]
# invoice = "templates/invoice.docx"
# contract = "templates/contract.odt"
"#;

/// Writes `docfill.toml` into `dir` unless it exists (or `force`).
pub fn init_default_config(dir: &Path, force: bool) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("create config dir: {}", dir.display()))?;
    let cfg_path = dir.join(CONFIG_FILE_NAME);
    if cfg_path.exists() && !force {
        return Ok(cfg_path);
    }
    std::fs::write(&cfg_path, DEFAULT_CONFIG_TOML)
        .with_context(|| format!("write config: {}", cfg_path.display()))?;
    Ok(cfg_path)
}
