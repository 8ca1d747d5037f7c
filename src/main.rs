use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use clap::{CommandFactory, Parser};

use docfill::config::{init_default_config, ResolvedConfig, CONFIG_ENV_VAR, CONFIG_FILE_NAME};
use docfill::merge::engine::MergeEngine;
use docfill::package::open_template;
use docfill::pipeline::{GenerateRequest, Generator};
use docfill::progress::ConsoleProgress;
use docfill::schema::Schema;
use docfill::store::{FileSchemaStore, RawValues};
use docfill::template::extract::extract_loaded;

#[derive(Parser, Debug)]
#[command(name = "docfill")]
#[command(about = "DOCX/ODT template engine: schema extraction and document generation", long_about = None)]
struct Args {
    /// Generate a default docfill.toml, then exit
    #[arg(long)]
    init_config: bool,

    /// Directory to write the config file (default: current directory)
    #[arg(long, value_name = "DIR")]
    init_config_dir: Option<PathBuf>,

    /// Overwrite an existing config file when used with --init-config
    #[arg(long)]
    force: bool,

    /// Config file path (default: search for docfill.toml upwards)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Template .docx/.odt (not needed with --type-key)
    #[arg(value_name = "TEMPLATE")]
    template: Option<PathBuf>,

    /// Write the extracted schema JSON and exit
    #[arg(long, value_name = "JSON")]
    extract_schema: Option<PathBuf>,

    /// Schema JSON to merge with (default: extracted from the template)
    #[arg(long, value_name = "JSON")]
    schema: Option<PathBuf>,

    /// Field values JSON: `{ "content": "...", "meta": { ... } }`
    #[arg(long, value_name = "JSON")]
    values: Option<PathBuf>,

    /// Output document (default: <template_stem>_filled.<ext>)
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Document type whose template and stored schema come from the config
    #[arg(long, value_name = "KEY")]
    type_key: Option<String>,

    /// Document id passed to the value source
    #[arg(long, default_value = "1")]
    doc_id: String,

    /// Extract the schema of --type-key's template into the schema store, then exit
    #[arg(long)]
    store_schema: bool,

    /// Print the normalized merge fields as JSON instead of writing a document
    #[arg(long)]
    print_fields: bool,

    /// Suppress progress lines on stderr
    #[arg(short, long)]
    quiet: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let progress = ConsoleProgress::new(!args.quiet);

    if args.init_config {
        let dir = args
            .init_config_dir
            .clone()
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
        let cfg_path = init_default_config(&dir, args.force).context("init default config")?;
        eprintln!("Wrote config: {}", cfg_path.display());
        return Ok(());
    }

    let workdir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let cfg = ResolvedConfig::locate(args.config.clone(), &workdir).context("load config")?;
    if let Some(p) = cfg.config_path.as_ref() {
        progress.info(format!("config: {}", p.display()));
    }

    if let Some(type_key) = args.type_key.as_deref() {
        return run_registered(&args, &cfg, type_key, &progress);
    }

    let template_path = match args.template.clone() {
        Some(p) => p,
        None => {
            let mut cmd = Args::command();
            cmd.print_help().context("print help")?;
            eprintln!(
                "\n\nUSAGE:\n  docfill <template.docx> --extract-schema schema.json\n  docfill <template.docx> --values values.json -o out.docx\n  docfill --type-key invoice --values values.json -o out.docx\n\nTIPS:\n  - Default config search: {CONFIG_FILE_NAME} (upwards), or set {CONFIG_ENV_VAR}.\n"
            );
            return Ok(());
        }
    };
    let template = open_template(&template_path)?;

    if let Some(json_path) = args.extract_schema.as_ref() {
        let schema = extract_loaded(&template)?;
        write_schema(&schema, json_path)?;
        progress.info(format!(
            "schema: {} fields, {} repeaters -> {}",
            schema.fields.len(),
            schema.repeaters.len(),
            json_path.display()
        ));
        return Ok(());
    }

    let schema = match args.schema.as_ref() {
        Some(p) => {
            let text = std::fs::read_to_string(p)
                .with_context(|| format!("read schema: {}", p.display()))?;
            Schema::from_json(&text).with_context(|| format!("schema file: {}", p.display()))?
        }
        None => extract_loaded(&template)?,
    };
    let values = load_values(args.values.as_deref())?;
    let ctx = cfg.builder.build(&schema, &values, &args.doc_id);

    if args.print_fields {
        let json = serde_json::to_string_pretty(&ctx.to_json()).context("serialize fields")?;
        println!("{json}");
        return Ok(());
    }

    let output = args
        .output
        .clone()
        .unwrap_or_else(|| default_output_for(&template_path));
    let written = MergeEngine::with_options(&progress, cfg.merge.clone())
        .merge(&template, &schema, &ctx, &output)?;
    eprintln!("Wrote: {}", written.display());
    Ok(())
}

fn run_registered(
    args: &Args,
    cfg: &ResolvedConfig,
    type_key: &str,
    progress: &ConsoleProgress,
) -> anyhow::Result<()> {
    let store = FileSchemaStore::new(cfg.schema_dir.clone());
    let values = load_values(args.values.as_deref())?;
    let generator = Generator::new(&cfg.templates, &store, &values, progress)
        .with_builder(cfg.builder.clone())
        .with_merge_options(cfg.merge.clone());

    if args.store_schema {
        let schema = generator.extract_and_store(type_key)?;
        eprintln!(
            "Stored schema for `{type_key}` ({} fields, {} repeaters): {}",
            schema.fields.len(),
            schema.repeaters.len(),
            store.path_for(type_key).display()
        );
        return Ok(());
    }

    let output = args
        .output
        .clone()
        .ok_or_else(|| anyhow!("missing -o/--output for --type-key generation"))?;
    let written = generator.generate(&GenerateRequest::new(type_key, &args.doc_id, output))?;
    eprintln!("Wrote: {}", written.display());
    Ok(())
}

fn load_values(path: Option<&Path>) -> anyhow::Result<RawValues> {
    match path {
        Some(p) => RawValues::from_path(p),
        None => Ok(RawValues::new()),
    }
}

fn write_schema(schema: &Schema, path: &Path) -> anyhow::Result<()> {
    let json = schema.to_json_pretty()?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create dir: {}", parent.display()))?;
    }
    std::fs::write(path, json).with_context(|| format!("write schema: {}", path.display()))
}

fn default_output_for(template: &Path) -> PathBuf {
    let stem = template
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("output")
        .to_string();
    let ext = template
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or("docx")
        .to_string();
    template.with_file_name(format!("{stem}_filled.{ext}"))
}
