use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use regex::Captures;

use crate::error::{EngineError, Result};
use crate::merge::embed::{embed_fragments, EmbedReport};
use crate::merge::fields::MergeContext;
use crate::merge::ids::RelsAllocator;
use crate::merge::repeat::{expand_repeaters, RepeatReport};
use crate::merge::residual::{clean_residuals, shield_brackets, ResidualReport};
use crate::package::archive::DocFormat;
use crate::package::heal::{collect_paragraphs, heal_placeholders, rewrite_texts};
use crate::package::xml::{parse_xml_part, write_xml_part, XmlPart};
use crate::package::{open_template, LoadedTemplate};
use crate::progress::ConsoleProgress;
use crate::schema::Schema;
use crate::template::infer::{classify, collect_repeat_markers, PlaceholderRole};
use crate::template::placeholder::{
    find_placeholders, parse_placeholder, ParsedPlaceholder, PLACEHOLDER_RE,
};

#[derive(Clone, Debug)]
pub struct MergeOptions {
    /// Remove the whole word `Array` left behind by stringified lists.
    pub scrub_array_literal: bool,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            scrub_array_literal: true,
        }
    }
}

/// Serialized output of a merge, ready to be written over the template package.
struct Rendered {
    replacements: HashMap<String, Vec<u8>>,
    additions: Vec<(String, Vec<u8>)>,
}

/// Runs `load -> substitute-scalars -> expand-repeaters -> embed-rich-fragments ->
/// clean-residuals -> save` over every text part of a template.
pub struct MergeEngine<'a> {
    progress: &'a ConsoleProgress,
    options: MergeOptions,
}

impl<'a> MergeEngine<'a> {
    pub fn new(progress: &'a ConsoleProgress) -> Self {
        Self::with_options(progress, MergeOptions::default())
    }

    pub fn with_options(progress: &'a ConsoleProgress, options: MergeOptions) -> Self {
        Self { progress, options }
    }

    pub fn options(&self) -> &MergeOptions {
        &self.options
    }

    pub fn merge_file(
        &self,
        template_path: &Path,
        schema: &Schema,
        ctx: &MergeContext,
        output: &Path,
    ) -> Result<PathBuf> {
        let template = open_template(template_path)?;
        self.merge(&template, schema, ctx, output)
    }

    /// Merges `ctx` into `template` and writes the result to `output`. Nothing is written at
    /// `output` unless every stage succeeds.
    pub fn merge(
        &self,
        template: &LoadedTemplate,
        schema: &Schema,
        ctx: &MergeContext,
        output: &Path,
    ) -> Result<PathBuf> {
        self.progress.info(format!(
            "merge: {} -> {}",
            template.path.display(),
            output.display()
        ));
        let rendered = self
            .render(template, schema, ctx)
            .with_context(|| format!("merge template: {}", template.path.display()))
            .map_err(EngineError::MergeFailed)?;
        self.save(template, &rendered, output)
            .map_err(EngineError::MergeFailed)?;
        self.progress.stage("save", output.display().to_string());
        Ok(output.to_path_buf())
    }

    fn render(
        &self,
        template: &LoadedTemplate,
        schema: &Schema,
        ctx: &MergeContext,
    ) -> anyhow::Result<Rendered> {
        let format = template.format;
        let pkg = &template.package;

        let mut parts: Vec<XmlPart> = Vec::new();
        let mut healed = 0usize;
        for name in pkg.text_part_names(format) {
            let entry = pkg
                .entry(&name)
                .ok_or_else(|| anyhow!("missing part: {name}"))?;
            let mut part =
                parse_xml_part(&name, &entry.data).with_context(|| format!("parse xml: {name}"))?;
            healed += heal_placeholders(&mut part, format, &PLACEHOLDER_RE);
            parts.push(part);
        }
        self.progress.stage(
            "load",
            format!("{} parts, {healed} split placeholders healed", parts.len()),
        );

        let all: Vec<ParsedPlaceholder> = parts
            .iter()
            .flat_map(|p| part_placeholders(p, format))
            .collect();
        let confirmed = collect_repeat_markers(&all);

        let mut substituted = 0usize;
        for part in &mut parts {
            substituted += substitute_scalars(part, format, schema, ctx, &confirmed);
        }
        self.progress
            .stage("substitute-scalars", format!("{substituted} placeholders"));

        let mut repeated = RepeatReport::default();
        for part in &mut parts {
            let r = expand_repeaters(&mut part.events, format, schema, ctx, &confirmed)
                .with_context(|| format!("expand repeaters: {}", part.name))?;
            repeated.blocks += r.blocks;
            repeated.rows += r.rows;
        }
        self.progress.stage(
            "expand-repeaters",
            format!("{} blocks, {} rows", repeated.blocks, repeated.rows),
        );

        let mut replacements: HashMap<String, Vec<u8>> = HashMap::new();
        let mut additions: Vec<(String, Vec<u8>)> = Vec::new();
        let mut embedded = EmbedReport::default();
        let total = parts.len();
        for (i, part) in parts.iter_mut().enumerate() {
            let mut rels = match format {
                DocFormat::Docx => Some(RelsAllocator::load(pkg, &part.name)?),
                DocFormat::Odt => None,
            };
            let r = embed_fragments(part, format, ctx, rels.as_mut())?;
            embedded.paragraphs += r.paragraphs;
            embedded.inline += r.inline;
            if let Some(rels) = rels {
                if let Some((name, bytes, existed)) = rels.finish()? {
                    if existed {
                        replacements.insert(name, bytes);
                    } else {
                        additions.push((name, bytes));
                    }
                }
            }
            self.progress.progress("embed parts", i + 1, total);
        }
        self.progress.stage(
            "embed-rich-fragments",
            format!(
                "{} paragraphs, {} inline",
                embedded.paragraphs, embedded.inline
            ),
        );

        let mut residue = ResidualReport::default();
        for part in &mut parts {
            residue.add(clean_residuals(
                part,
                format,
                self.options.scrub_array_literal,
            ));
        }
        self.progress.stage(
            "clean-residuals",
            format!(
                "{} placeholders, {} markers, {} `Array` removed",
                residue.placeholders, residue.markers, residue.array_literals
            ),
        );

        for part in &parts {
            let bytes =
                write_xml_part(part).with_context(|| format!("serialize xml: {}", part.name))?;
            replacements.insert(part.name.clone(), bytes);
        }
        Ok(Rendered {
            replacements,
            additions,
        })
    }

    fn save(&self, template: &LoadedTemplate, rendered: &Rendered, output: &Path) -> anyhow::Result<()> {
        let dir = match output.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("create output dir: {}", dir.display()))?;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir).context("create temp output")?;
        template
            .package
            .write_with_replacements(tmp.as_file_mut(), &rendered.replacements, &rendered.additions)
            .context("write output package")?;
        tmp.persist(output)
            .map_err(|e| anyhow!("persist output {}: {}", output.display(), e.error))?;
        Ok(())
    }
}

fn part_placeholders(part: &XmlPart, format: DocFormat) -> Vec<ParsedPlaceholder> {
    collect_paragraphs(&part.events, format)
        .iter()
        .flat_map(|para| find_placeholders(&para.text()))
        .map(|m| m.parsed)
        .collect()
}

/// Resolves every placeholder that is neither a repeater column nor a block marker. Unknown
/// slugs are left for residual cleanup.
fn substitute_scalars(
    part: &mut XmlPart,
    format: DocFormat,
    schema: &Schema,
    ctx: &MergeContext,
    confirmed: &HashSet<String>,
) -> usize {
    let mut count = 0usize;
    rewrite_texts(&mut part.events, format, |text| {
        if !text.contains('[') {
            return None;
        }
        let out = PLACEHOLDER_RE.replace_all(text, |caps: &Captures| {
            let parsed = parse_placeholder(&caps[1]);
            let PlaceholderRole::Scalar { slug } = classify(&parsed, confirmed) else {
                return caps[0].to_string();
            };
            match ctx.scalar(&slug) {
                Some(value) => {
                    count += 1;
                    shield_brackets(&value.substitution(schema.field(&slug)))
                }
                None => caps[0].to_string(),
            }
        });
        match out {
            Cow::Owned(s) => Some(s),
            Cow::Borrowed(_) => None,
        }
    });
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::fields::FieldValue;
    use crate::merge::residual::rich_marker;
    use crate::schema::{DataType, FieldDef, FieldType};

    #[test]
    fn scalars_are_substituted_and_columns_left_alone() {
        let mut schema = Schema::empty();
        let mut total = FieldDef::new("total", FieldType::Single, DataType::Number);
        total.parameters.insert("frm".to_string(), "0,00".to_string());
        schema.fields.push(total);
        schema
            .fields
            .push(FieldDef::new("intro", FieldType::Rich, DataType::Html));

        let mut ctx = MergeContext::new();
        ctx.set_scalar("total", FieldValue::Number(12.5));
        let idx = ctx.remember_rich("<p>x</p>".to_string());
        ctx.set_scalar("intro", FieldValue::Html(idx));

        let xml = r#"<w:p><w:r><w:t>[total;frm=0,00] [items[*].qty] [missing] [intro]</w:t></w:r></w:p>"#;
        let mut part = parse_xml_part("word/document.xml", xml.as_bytes()).expect("parse");
        let n = substitute_scalars(&mut part, DocFormat::Docx, &schema, &ctx, &HashSet::new());
        assert_eq!(n, 2);
        let out = String::from_utf8(write_xml_part(&part).expect("write")).expect("utf8");
        assert!(out.contains(&format!("12,50 [items[*].qty] [missing] {}", rich_marker(idx))));
    }

    #[test]
    fn bracketed_values_outlive_residual_cleanup() {
        let mut schema = Schema::empty();
        schema
            .fields
            .push(FieldDef::new("note", FieldType::Single, DataType::Text));
        let mut ctx = MergeContext::new();
        ctx.set_scalar(
            "note",
            FieldValue::Text("He wrote teh [sic] report, see [Annex1]".to_string()),
        );

        let xml = r#"<w:p><w:r><w:t>[note] [unknown]</w:t></w:r></w:p>"#;
        let mut part = parse_xml_part("word/document.xml", xml.as_bytes()).expect("parse");
        assert_eq!(
            substitute_scalars(&mut part, DocFormat::Docx, &schema, &ctx, &HashSet::new()),
            1
        );
        let report = clean_residuals(&mut part, DocFormat::Docx, true);
        assert_eq!(report.placeholders, 1);
        let out = String::from_utf8(write_xml_part(&part).expect("write")).expect("utf8");
        assert!(out.contains("He wrote teh [sic] report, see [Annex1] </w:t>"));
    }
}
