use std::collections::{HashMap, HashSet};

use regex::Captures;

use crate::merge::fields::{MergeContext, RowMap};
use crate::merge::ids::IdRenumberer;
use crate::merge::residual::shield_brackets;
use crate::package::archive::DocFormat;
use crate::package::heal::{is_paragraph, rewrite_texts};
use crate::package::xml::{child_starts, enclosing_start, matching_end, XmlEvent};
use crate::schema::{slugify, Schema};
use crate::template::infer::{classify, PlaceholderRole};
use crate::template::placeholder::{parse_placeholder, ParsedPlaceholder, PLACEHOLDER_RE};

/// Element repeated once per row, chosen with `block=`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BlockKind {
    Row,
    Paragraph,
    ListItem,
    Table,
    Section,
    Cell,
    /// A literal element name such as `w:tr` or `text:list-item`.
    Element(String),
}

impl BlockKind {
    pub fn parse(raw: &str) -> Option<Self> {
        let v = raw.trim();
        let bare = v.strip_prefix("tbs:").unwrap_or(v).to_ascii_lowercase();
        let kind = match bare.as_str() {
            "row" | "tr" => BlockKind::Row,
            "p" | "paragraph" => BlockKind::Paragraph,
            "listitem" | "list-item" | "li" => BlockKind::ListItem,
            "table" => BlockKind::Table,
            "section" | "sdt" => BlockKind::Section,
            "cell" | "tc" => BlockKind::Cell,
            _ if !v.starts_with("tbs:") && v.contains(':') => BlockKind::Element(v.to_string()),
            _ => return None,
        };
        Some(kind)
    }

    pub fn matches(&self, format: DocFormat, name: &str) -> bool {
        match (self, format) {
            (BlockKind::Row, DocFormat::Docx) => name == "w:tr",
            (BlockKind::Row, DocFormat::Odt) => name == "table:table-row",
            (BlockKind::Paragraph, _) => is_paragraph(format, name),
            (BlockKind::ListItem, DocFormat::Docx) => name == "w:p",
            (BlockKind::ListItem, DocFormat::Odt) => name == "text:list-item",
            (BlockKind::Table, DocFormat::Docx) => name == "w:tbl",
            (BlockKind::Table, DocFormat::Odt) => name == "table:table",
            (BlockKind::Section, DocFormat::Docx) => name == "w:sdt",
            (BlockKind::Section, DocFormat::Odt) => name == "text:section",
            (BlockKind::Cell, DocFormat::Docx) => name == "w:tc",
            (BlockKind::Cell, DocFormat::Odt) => name == "table:table-cell",
            (BlockKind::Element(el), _) => name == el,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RepeatReport {
    pub blocks: usize,
    pub rows: usize,
}

/// Start/end event indices of the block repeated for the column token at `token_idx`. Without
/// an explicit kind (or when it matches nothing) the innermost table row wins, then an ODF list
/// item, then the paragraph.
pub fn locate_block(
    events: &[XmlEvent],
    token_idx: usize,
    format: DocFormat,
    kind: Option<&BlockKind>,
) -> Option<(usize, usize)> {
    let start = kind
        .and_then(|k| enclosing_start(events, token_idx, |n| k.matches(format, n)))
        .or_else(|| enclosing_start(events, token_idx, |n| BlockKind::Row.matches(format, n)))
        .or_else(|| match format {
            DocFormat::Odt => enclosing_start(events, token_idx, |n| n == "text:list-item"),
            DocFormat::Docx => None,
        })
        .or_else(|| enclosing_start(events, token_idx, |n| is_paragraph(format, n)))?;
    let end = matching_end(events, start).ok()?;
    Some((start, end))
}

fn placeholders_in(text: &str) -> impl Iterator<Item = ParsedPlaceholder> + '_ {
    PLACEHOLDER_RE
        .captures_iter(text)
        .map(|caps| parse_placeholder(&caps[1]))
}

/// `block=` per repeater slug, from its column tokens or its `onshow;repeat=` marker.
fn block_specs(events: &[XmlEvent], confirmed: &HashSet<String>) -> HashMap<String, BlockKind> {
    let mut specs: HashMap<String, BlockKind> = HashMap::new();
    for ev in events {
        let XmlEvent::Text { text } = ev else {
            continue;
        };
        for parsed in placeholders_in(text) {
            let Some(kind) = parsed.param("block").and_then(BlockKind::parse) else {
                continue;
            };
            let repeater = match classify(&parsed, confirmed) {
                PlaceholderRole::Column { repeater, .. } => repeater,
                PlaceholderRole::Marker => match parsed.param("repeat") {
                    Some(r) => slugify(r),
                    None => continue,
                },
                PlaceholderRole::Scalar { .. } => continue,
            };
            specs.entry(repeater).or_insert(kind);
        }
    }
    specs
}

fn next_column_token(
    events: &[XmlEvent],
    from: usize,
    confirmed: &HashSet<String>,
) -> Option<(usize, String)> {
    events.iter().enumerate().skip(from).find_map(|(idx, ev)| {
        let XmlEvent::Text { text } = ev else {
            return None;
        };
        placeholders_in(text).find_map(|p| match classify(&p, confirmed) {
            PlaceholderRole::Column { repeater, .. } => Some((idx, repeater)),
            _ => None,
        })
    })
}

/// Substitutes one row's values into a copy of the prototype block. Column tokens of other
/// repeaters are left alone.
fn fill_row(
    copy: &mut [XmlEvent],
    format: DocFormat,
    repeater: &str,
    row: &RowMap,
    schema: &Schema,
    confirmed: &HashSet<String>,
) {
    let def = schema.repeater(repeater);
    rewrite_texts(copy, format, |text| {
        if !text.contains('[') {
            return None;
        }
        let out = PLACEHOLDER_RE.replace_all(text, |caps: &Captures| {
            let parsed = parse_placeholder(&caps[1]);
            match classify(&parsed, confirmed) {
                PlaceholderRole::Column { repeater: r, column } if r == repeater => {
                    let col_def = def.and_then(|d| d.field(&column));
                    row.get(&column)
                        .map(|v| shield_brackets(&v.substitution(col_def)))
                        .unwrap_or_default()
                }
                PlaceholderRole::Marker
                    if parsed.param("repeat").map(slugify).as_deref() == Some(repeater) =>
                {
                    String::new()
                }
                _ => caps[0].to_string(),
            }
        });
        Some(out.into_owned())
    });
}

/// Duplicates every repeater block once per row of its repeater. A repeater without rows loses
/// its block entirely; tables left without rows are dropped and DOCX cells keep a final
/// paragraph.
pub fn expand_repeaters(
    events: &mut Vec<XmlEvent>,
    format: DocFormat,
    schema: &Schema,
    ctx: &MergeContext,
    confirmed: &HashSet<String>,
) -> anyhow::Result<RepeatReport> {
    let specs = block_specs(events, confirmed);
    let mut ids = IdRenumberer::for_part(events, format);
    let mut report = RepeatReport::default();
    let mut removed_any = false;
    let mut cursor = 0usize;

    while let Some((token_idx, repeater)) = next_column_token(events, cursor, confirmed) {
        let Some((start, end)) = locate_block(events, token_idx, format, specs.get(&repeater)) else {
            cursor = token_idx + 1;
            continue;
        };
        let prototype: Vec<XmlEvent> = events[start..=end].to_vec();
        let rows = ctx.rows(&repeater);
        let mut expanded: Vec<XmlEvent> = Vec::with_capacity(prototype.len() * rows.len());
        for (copy_idx, row) in rows.iter().enumerate() {
            let mut copy = prototype.clone();
            fill_row(&mut copy, format, &repeater, row, schema, confirmed);
            ids.renumber(&mut copy, copy_idx);
            expanded.extend(copy);
        }
        let inserted = expanded.len();
        events.splice(start..=end, expanded);
        removed_any |= rows.is_empty();
        report.blocks += 1;
        report.rows += rows.len();
        cursor = start + inserted;
    }

    if removed_any {
        repair_containers(events, format)?;
    }
    Ok(report)
}

fn repair_containers(events: &mut Vec<XmlEvent>, format: DocFormat) -> anyhow::Result<()> {
    let (table, row) = match format {
        DocFormat::Docx => ("w:tbl", "w:tr"),
        DocFormat::Odt => ("table:table", "table:table-row"),
    };
    let mut idx = 0usize;
    while idx < events.len() {
        if events[idx].is_start_of(table) {
            let end = matching_end(events, idx)?;
            if !events[idx..end].iter().any(|e| e.is_start_of(row)) {
                events.drain(idx..=end);
                continue;
            }
        }
        idx += 1;
    }

    if format == DocFormat::Docx {
        let mut idx = 0usize;
        while idx < events.len() {
            if events[idx].is_start_of("w:tc") {
                let end = matching_end(events, idx)?;
                let ends_with_p = child_starts(events, idx, end)
                    .last()
                    .is_some_and(|&c| events[c].name() == Some("w:p"));
                if !ends_with_p {
                    events.insert(end, XmlEvent::empty("w:p", &[]));
                }
            }
            idx += 1;
        }
    }
    Ok(())
}
