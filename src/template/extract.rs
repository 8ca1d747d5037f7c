use std::collections::HashSet;
use std::path::Path;

use anyhow::Context;
use chrono::{SecondsFormat, Utc};
use indexmap::IndexMap;

use crate::error::{EngineError, Result};
use crate::package::archive::{DocFormat, TemplatePackage};
use crate::package::heal::{collect_paragraphs, heal_placeholders};
use crate::package::xml::parse_xml_part;
use crate::package::{open_template, LoadedTemplate};
use crate::schema::{humanize, DataType, FieldDef, RepeaterDef, Schema, SchemaMeta};
use crate::template::infer::{
    classify, collect_repeat_markers, detect_array_placeholder, detect_data_type, field_type_for,
    group_siblings, item_data_type, ArrayRef, PlaceholderRole,
};
use crate::template::placeholder::{find_placeholders, ParsedPlaceholder, PLACEHOLDER_RE};

/// Parameters that drive inference or block placement and are not stored on the field.
const CONSUMED_PARAMS: &[&str] = &[
    "datatype",
    "type",
    "ope",
    "operation",
    "strconv",
    "tbs:html",
    "html",
    "textarea",
    "block",
    "label",
    "title",
    "placeholder",
    "pattern",
    "patternmsg",
    "minvalue",
    "min",
    "maxvalue",
    "max",
    "length",
    "maxlength",
    "frm",
    "format",
];

pub fn extract(template_path: &Path) -> Result<Schema> {
    let template = open_template(template_path)?;
    extract_loaded(&template)
}

pub fn extract_loaded(template: &LoadedTemplate) -> Result<Schema> {
    let parsed = scan_placeholders(&template.package, template.format)
        .map_err(EngineError::SchemaExtractionFailed)?;
    let mut schema = build_schema(&parsed);
    schema.meta = SchemaMeta {
        template: template.file_name(),
        format: Some(template.format),
        hash: template.hash.clone(),
        extracted_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
    };
    Ok(schema)
}

/// Every placeholder in the text parts, in document order (primary part first).
pub fn scan_placeholders(pkg: &TemplatePackage, format: DocFormat) -> anyhow::Result<Vec<ParsedPlaceholder>> {
    let mut out = Vec::new();
    for name in pkg.text_part_names(format) {
        let Some(entry) = pkg.entry(&name) else {
            continue;
        };
        let mut part = parse_xml_part(&name, &entry.data).with_context(|| format!("parse xml: {name}"))?;
        heal_placeholders(&mut part, format, &PLACEHOLDER_RE);
        for para in collect_paragraphs(&part.events, format) {
            out.extend(find_placeholders(&para.text()).into_iter().map(|m| m.parsed));
        }
    }
    Ok(out)
}

pub fn build_schema(parsed: &[ParsedPlaceholder]) -> Schema {
    let confirmed = collect_repeat_markers(parsed);
    let mut fields: IndexMap<String, FieldDef> = IndexMap::new();
    let mut columns: Vec<(ArrayRef, &ParsedPlaceholder)> = Vec::new();

    for p in parsed {
        match classify(p, &confirmed) {
            PlaceholderRole::Marker => {}
            PlaceholderRole::Scalar { slug } => {
                if slug.is_empty() {
                    continue;
                }
                if let Some(existing) = fields.get_mut(&slug) {
                    absorb_parameters(existing, p);
                    continue;
                }
                let dt = detect_data_type(&p.placeholder, &p.parameters);
                fields.insert(slug.clone(), field_from(&slug, &p.placeholder, p, dt));
            }
            PlaceholderRole::Column { .. } => {
                if let Some(r) = detect_array_placeholder(&p.placeholder, &confirmed) {
                    columns.push((r, p));
                }
            }
        }
    }

    let refs: Vec<ArrayRef> = columns.iter().map(|(r, _)| r.clone()).collect();
    let mut repeaters: Vec<RepeaterDef> = Vec::new();
    for (slug, members) in group_siblings(&refs) {
        let mut cols: IndexMap<String, FieldDef> = IndexMap::new();
        for idx in members {
            let (r, p) = &columns[idx];
            let col_slug = r.column_slug();
            if col_slug.is_empty() {
                continue;
            }
            if let Some(existing) = cols.get_mut(&col_slug) {
                absorb_parameters(existing, p);
                continue;
            }
            let dt = item_data_type(&r.key, &p.parameters);
            cols.insert(col_slug.clone(), field_from(&col_slug, &r.key, p, dt));
        }
        repeaters.push(RepeaterDef {
            name: humanize(&slug),
            slug,
            fields: cols.into_values().collect(),
        });
    }

    Schema {
        fields: fields.into_values().collect(),
        repeaters,
        ..Schema::empty()
    }
}

fn field_from(slug: &str, raw_name: &str, p: &ParsedPlaceholder, data_type: DataType) -> FieldDef {
    let field_type = field_type_for(raw_name, &p.parameters, data_type);
    let mut def = FieldDef::new(slug, field_type, data_type);
    absorb_parameters(&mut def, p);
    def
}

/// Fills attributes still unset on `def` from a placeholder occurrence.
fn absorb_parameters(def: &mut FieldDef, p: &ParsedPlaceholder) {
    let first = |keys: &[&str]| keys.iter().find_map(|k| p.param(k)).map(str::to_string);

    if let Some(label) = first(&["label", "title"]) {
        if def.name == humanize(&def.slug) {
            def.name = label;
        }
    }
    fill(&mut def.placeholder, first(&["placeholder"]));
    fill(&mut def.pattern, first(&["pattern"]));
    fill(&mut def.patternmsg, first(&["patternmsg"]));
    fill(&mut def.minvalue, first(&["minvalue", "min"]));
    fill(&mut def.maxvalue, first(&["maxvalue", "max"]));
    fill(&mut def.length, first(&["length", "maxlength"]));

    if let Some(frm) = first(&["frm", "format"]).filter(|v| v != "true") {
        let key = match def.data_type {
            DataType::Date => "format",
            _ => "frm",
        };
        def.parameters.entry(key.to_string()).or_insert(frm);
    }

    let consumed: HashSet<&str> = CONSUMED_PARAMS.iter().copied().collect();
    for (k, v) in &p.parameters {
        if consumed.contains(k.as_str()) {
            continue;
        }
        def.parameters.entry(k.clone()).or_insert_with(|| v.clone());
    }
}

fn fill(slot: &mut Option<String>, value: Option<String>) {
    if slot.is_none() {
        *slot = value;
    }
}
