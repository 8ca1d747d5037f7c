use anyhow::Context;
use indexmap::IndexMap;

use crate::merge::fields::MergeContext;
use crate::merge::ids::RelsAllocator;
use crate::merge::residual::{shield_brackets, whole_marker, MARKER_RE};
use crate::package::archive::DocFormat;
use crate::package::heal::{collect_paragraphs, preserve_space_if_needed};
use crate::package::xml::{child_starts, enclosing_start, find_attr, matching_end, XmlEvent, XmlPart};
use crate::values::html::{inline_segments, parse_blocks, Block, Paragraph, ParagraphKind, RunStyle, Segment, Table};

const RPR_ORDER: &[&str] = &[
    "w:rStyle", "w:rFonts", "w:b", "w:bCs", "w:i", "w:iCs", "w:caps", "w:smallCaps", "w:strike",
    "w:dstrike", "w:outline", "w:shadow", "w:emboss", "w:imprint", "w:noProof", "w:snapToGrid",
    "w:vanish", "w:webHidden", "w:color", "w:spacing", "w:w", "w:kern", "w:position", "w:sz",
    "w:szCs", "w:highlight", "w:u", "w:effect", "w:bdr", "w:shd", "w:fitText", "w:vertAlign",
    "w:rtl", "w:cs", "w:em", "w:lang", "w:eastAsianLayout", "w:specVanish", "w:oMath",
];

const PPR_ORDER: &[&str] = &[
    "w:pStyle", "w:keepNext", "w:keepLines", "w:pageBreakBefore", "w:framePr", "w:widowControl",
    "w:numPr", "w:suppressLineNumbers", "w:pBdr", "w:shd", "w:tabs", "w:suppressAutoHyphens",
    "w:kinsoku", "w:wordWrap", "w:overflowPunct", "w:topLinePunct", "w:autoSpaceDE",
    "w:autoSpaceDN", "w:bidi", "w:adjustRightInd", "w:snapToGrid", "w:spacing", "w:ind",
    "w:contextualSpacing", "w:mirrorIndents", "w:suppressOverlap", "w:jc", "w:textDirection",
    "w:textAlignment", "w:textboxTightWrap", "w:outlineLvl", "w:divId", "w:cnfStyle", "w:rPr",
    "w:sectPr", "w:pPrChange",
];

/// Paragraph content that must survive, so such paragraphs are only ever embedded inline.
const OBJECT_ELEMENTS: &[&str] = &[
    "w:drawing", "w:pict", "w:object", "w:fldChar", "w:fldSimple", "draw:frame", "draw:custom-shape",
    "text:note",
];

const TABLE_WIDTH_DXA: usize = 9000;
const HYPERLINK_COLOR: &str = "0563C1";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EmbedReport {
    pub paragraphs: usize,
    pub inline: usize,
}

/// Child elements of a `w:pPr`/`w:rPr`, kept as subtrees so they can be merged and re-emitted in
/// schema order.
#[derive(Clone, Debug, Default)]
struct Props {
    children: Vec<(String, Vec<XmlEvent>)>,
}

impl Props {
    fn read(events: &[XmlEvent], start: usize) -> anyhow::Result<Self> {
        let end = matching_end(events, start)?;
        let mut children = Vec::new();
        for c in child_starts(events, start, end) {
            let c_end = matching_end(events, c)?;
            let name = events[c].name().unwrap_or_default().to_string();
            children.push((name, events[c..=c_end].to_vec()));
        }
        Ok(Self { children })
    }

    /// Props of the direct child `name` of the element spanning `start..=end`, if present.
    fn child_of(events: &[XmlEvent], start: usize, end: usize, name: &str) -> anyhow::Result<Option<Self>> {
        match child_starts(events, start, end)
            .into_iter()
            .find(|&c| events[c].name() == Some(name))
        {
            Some(c) => Ok(Some(Self::read(events, c)?)),
            None => Ok(None),
        }
    }

    fn set(&mut self, name: &str, attrs: &[(&str, &str)]) {
        let el = vec![XmlEvent::empty(name, attrs)];
        match self.children.iter_mut().find(|(n, _)| n == name) {
            Some((_, events)) => *events = el,
            None => self.children.push((name.to_string(), el)),
        }
    }

    fn remove(&mut self, name: &str) {
        self.children.retain(|(n, _)| n != name);
    }

    fn has(&self, name: &str) -> bool {
        self.children.iter().any(|(n, _)| n == name)
    }

    fn write(&self, wrapper: &str, order: &[&str], out: &mut Vec<XmlEvent>) {
        if self.children.is_empty() {
            return;
        }
        let mut sorted: Vec<&(String, Vec<XmlEvent>)> = self.children.iter().collect();
        sorted.sort_by_key(|(n, _)| order.iter().position(|o| o == n).unwrap_or(order.len()));
        out.push(XmlEvent::start(wrapper, &[]));
        for (_, events) in sorted {
            out.extend(events.iter().cloned());
        }
        out.push(XmlEvent::end(wrapper));
    }
}

fn emphasized(style: &RunStyle, bold: bool) -> RunStyle {
    RunStyle {
        bold: style.bold || bold,
        ..*style
    }
}

struct OoxmlRenderer<'r> {
    base_rpr: Props,
    rels: Option<&'r mut RelsAllocator>,
}

impl OoxmlRenderer<'_> {
    fn run(&self, text: &str, style: &RunStyle, link: bool, out: &mut Vec<XmlEvent>) {
        let mut rpr = self.base_rpr.clone();
        if style.bold {
            rpr.set("w:b", &[]);
        }
        if style.italic {
            rpr.set("w:i", &[]);
        }
        if style.strike {
            rpr.set("w:strike", &[]);
        }
        if style.underline || link {
            rpr.set("w:u", &[("w:val", "single")]);
        }
        if style.superscript {
            rpr.set("w:vertAlign", &[("w:val", "superscript")]);
        } else if style.subscript {
            rpr.set("w:vertAlign", &[("w:val", "subscript")]);
        }
        match style.color_hex() {
            Some(hex) => rpr.set("w:color", &[("w:val", hex.as_str())]),
            None if link => rpr.set("w:color", &[("w:val", HYPERLINK_COLOR)]),
            None => {}
        }
        if link && !rpr.has("w:rStyle") {
            rpr.set("w:rStyle", &[("w:val", "Hyperlink")]);
        }

        out.push(XmlEvent::start("w:r", &[]));
        rpr.write("w:rPr", RPR_ORDER, out);
        for (i, piece) in text.split('\t').enumerate() {
            if i > 0 {
                out.push(XmlEvent::empty("w:tab", &[]));
            }
            if piece.is_empty() {
                continue;
            }
            out.push(XmlEvent::start("w:t", &[("xml:space", "preserve")]));
            out.push(XmlEvent::text(shield_brackets(piece)));
            out.push(XmlEvent::end("w:t"));
        }
        out.push(XmlEvent::end("w:r"));
    }

    fn segments(&mut self, segments: &[Segment], bold: bool, out: &mut Vec<XmlEvent>) {
        for seg in segments {
            match seg {
                Segment::Text { text, style } => self.run(text, &emphasized(style, bold), false, out),
                Segment::Link { href, text, style } => {
                    let style = emphasized(style, bold);
                    if let Some(anchor) = href.strip_prefix('#') {
                        out.push(XmlEvent::start("w:hyperlink", &[("w:anchor", anchor)]));
                        self.run(text, &style, true, out);
                        out.push(XmlEvent::end("w:hyperlink"));
                        continue;
                    }
                    match self.rels.as_deref_mut() {
                        Some(rels) => {
                            let id = rels.hyperlink(href);
                            out.push(XmlEvent::start(
                                "w:hyperlink",
                                &[("r:id", id.as_str()), ("w:history", "1")],
                            ));
                            self.run(text, &style, true, out);
                            out.push(XmlEvent::end("w:hyperlink"));
                        }
                        None => self.run(text, &style, false, out),
                    }
                }
                Segment::Break => {
                    out.push(XmlEvent::start("w:r", &[]));
                    out.push(XmlEvent::empty("w:br", &[]));
                    out.push(XmlEvent::end("w:r"));
                }
            }
        }
    }

    fn paragraph(
        &mut self,
        p: &Paragraph,
        proto: Option<&Props>,
        keep_section: bool,
        bold: bool,
        out: &mut Vec<XmlEvent>,
    ) {
        let mut ppr = proto.cloned().unwrap_or_default();
        if !keep_section {
            ppr.remove("w:sectPr");
        }
        match p.kind {
            ParagraphKind::Heading(level) => {
                let style = format!("Heading{level}");
                ppr.set("w:pStyle", &[("w:val", style.as_str())]);
            }
            ParagraphKind::Quote => ppr.set("w:pStyle", &[("w:val", "Quote")]),
            ParagraphKind::Normal => {}
        }
        if let Some(list) = &p.list {
            ppr.remove("w:numPr");
            let left = (720 * (list.level + 1)).to_string();
            ppr.set("w:ind", &[("w:left", left.as_str()), ("w:hanging", "360")]);
        }

        out.push(XmlEvent::start("w:p", &[]));
        ppr.write("w:pPr", PPR_ORDER, out);
        if let Some(list) = &p.list {
            self.run(&format!("{}\t", list.label()), &RunStyle::default(), false, out);
        }
        let bold = bold || matches!(p.kind, ParagraphKind::Heading(_));
        self.segments(&p.segments, bold, out);
        out.push(XmlEvent::end("w:p"));
    }

    fn table(&mut self, table: &Table, out: &mut Vec<XmlEvent>) {
        let cols = table.column_count().max(1);
        let col_width = TABLE_WIDTH_DXA / cols;
        let border = [("w:val", "single"), ("w:sz", "4"), ("w:space", "0"), ("w:color", "auto")];

        out.push(XmlEvent::start("w:tbl", &[]));
        out.push(XmlEvent::start("w:tblPr", &[]));
        out.push(XmlEvent::empty("w:tblW", &[("w:w", "0"), ("w:type", "auto")]));
        out.push(XmlEvent::start("w:tblBorders", &[]));
        for side in ["w:top", "w:left", "w:bottom", "w:right", "w:insideH", "w:insideV"] {
            out.push(XmlEvent::empty(side, &border));
        }
        out.push(XmlEvent::end("w:tblBorders"));
        out.push(XmlEvent::empty("w:tblLook", &[("w:val", "04A0")]));
        out.push(XmlEvent::end("w:tblPr"));

        let width = col_width.to_string();
        out.push(XmlEvent::start("w:tblGrid", &[]));
        for _ in 0..cols {
            out.push(XmlEvent::empty("w:gridCol", &[("w:w", width.as_str())]));
        }
        out.push(XmlEvent::end("w:tblGrid"));

        for row in &table.rows {
            out.push(XmlEvent::start("w:tr", &[]));
            let mut used = 0usize;
            for cell in row {
                let span = cell.colspan.max(1).min(cols - used);
                if span == 0 {
                    break;
                }
                self.cell_start(span, col_width, out);
                if cell.paragraphs.is_empty() {
                    out.push(XmlEvent::empty("w:p", &[]));
                }
                for p in &cell.paragraphs {
                    self.paragraph(p, None, false, cell.header, out);
                }
                out.push(XmlEvent::end("w:tc"));
                used += span;
            }
            for _ in used..cols {
                self.cell_start(1, col_width, out);
                out.push(XmlEvent::empty("w:p", &[]));
                out.push(XmlEvent::end("w:tc"));
            }
            out.push(XmlEvent::end("w:tr"));
        }
        out.push(XmlEvent::end("w:tbl"));
    }

    fn cell_start(&self, span: usize, col_width: usize, out: &mut Vec<XmlEvent>) {
        let width = (col_width * span).to_string();
        out.push(XmlEvent::start("w:tc", &[]));
        out.push(XmlEvent::start("w:tcPr", &[]));
        out.push(XmlEvent::empty("w:tcW", &[("w:w", width.as_str()), ("w:type", "dxa")]));
        if span > 1 {
            let span = span.to_string();
            out.push(XmlEvent::empty("w:gridSpan", &[("w:val", span.as_str())]));
        }
        out.push(XmlEvent::end("w:tcPr"));
    }

    /// Section properties of the prototype stay on the last emitted paragraph only; a trailing
    /// table is followed by an empty paragraph so cells and sections still end with one.
    fn blocks(&mut self, blocks: &[Block], proto: Option<&Props>, out: &mut Vec<XmlEvent>) {
        let last = blocks.len().saturating_sub(1);
        for (i, block) in blocks.iter().enumerate() {
            match block {
                Block::Paragraph(p) => self.paragraph(p, proto, i == last, false, out),
                Block::Table(t) => {
                    self.table(t, out);
                    if i == last {
                        let empty = Paragraph {
                            kind: ParagraphKind::Normal,
                            list: None,
                            segments: Vec::new(),
                        };
                        self.paragraph(&empty, proto, true, false, out);
                    }
                }
            }
        }
    }
}

/// Automatic text styles required by generated ODF spans, plus a table counter for unique
/// `table:name`s.
#[derive(Debug, Default)]
pub struct OdfStyleSet {
    styles: IndexMap<String, RunStyle>,
    tables: usize,
}

impl OdfStyleSet {
    pub fn is_empty(&self) -> bool {
        self.styles.is_empty()
    }

    fn text_style(&mut self, style: &RunStyle) -> Option<String> {
        if style.is_plain() {
            return None;
        }
        let mut name = String::from("docfill");
        for (on, tag) in [
            (style.bold, "_b"),
            (style.italic, "_i"),
            (style.underline, "_u"),
            (style.strike, "_s"),
            (style.superscript, "_sup"),
            (style.subscript, "_sub"),
        ] {
            if on {
                name.push_str(tag);
            }
        }
        if let Some(hex) = style.color_hex() {
            name.push_str("_c_");
            name.push_str(&hex.to_ascii_lowercase());
        }
        self.styles.entry(name.clone()).or_insert(*style);
        Some(name)
    }

    fn next_table_name(&mut self) -> String {
        self.tables += 1;
        format!("docfill_table_{}", self.tables)
    }
}

fn odf_text_properties(style: &RunStyle) -> Vec<(String, String)> {
    let mut props: Vec<(&str, String)> = Vec::new();
    if style.bold {
        props.push(("fo:font-weight", "bold".into()));
        props.push(("style:font-weight-asian", "bold".into()));
        props.push(("style:font-weight-complex", "bold".into()));
    }
    if style.italic {
        props.push(("fo:font-style", "italic".into()));
        props.push(("style:font-style-asian", "italic".into()));
        props.push(("style:font-style-complex", "italic".into()));
    }
    if style.underline {
        props.push(("style:text-underline-style", "solid".into()));
        props.push(("style:text-underline-width", "auto".into()));
        props.push(("style:text-underline-color", "font-color".into()));
    }
    if style.strike {
        props.push(("style:text-line-through-style", "solid".into()));
    }
    if style.superscript {
        props.push(("style:text-position", "super 58%".into()));
    } else if style.subscript {
        props.push(("style:text-position", "sub 58%".into()));
    }
    if let Some(hex) = style.color_hex() {
        props.push(("fo:color", format!("#{}", hex.to_ascii_lowercase())));
    }
    props.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

/// Adds the collected automatic styles to `office:automatic-styles`, creating that element
/// before `office:body`/`office:master-styles` when the part has none.
pub fn install_odf_styles(part: &mut XmlPart, styles: &OdfStyleSet) -> anyhow::Result<()> {
    if styles.is_empty() {
        return Ok(());
    }
    let existing: Vec<String> = part
        .events
        .iter()
        .filter(|e| e.name() == Some("style:style"))
        .filter_map(|e| e.attrs().and_then(|a| find_attr(a, "style:name")).map(str::to_string))
        .collect();
    let mut defs: Vec<XmlEvent> = Vec::new();
    for (name, style) in &styles.styles {
        if existing.iter().any(|n| n == name) {
            continue;
        }
        defs.push(XmlEvent::start(
            "style:style",
            &[("style:name", name.as_str()), ("style:family", "text")],
        ));
        defs.push(XmlEvent::Empty {
            name: "style:text-properties".to_string(),
            attrs: odf_text_properties(style),
        });
        defs.push(XmlEvent::end("style:style"));
    }
    if defs.is_empty() {
        return Ok(());
    }

    let events = &mut part.events;
    if let Some(idx) = events
        .iter()
        .position(|e| e.name() == Some("office:automatic-styles"))
    {
        if matches!(events[idx], XmlEvent::Empty { .. }) {
            events[idx] = XmlEvent::start("office:automatic-styles", &[]);
            defs.push(XmlEvent::end("office:automatic-styles"));
            events.splice(idx + 1..idx + 1, defs);
        } else {
            let end = matching_end(events, idx).context("automatic styles")?;
            events.splice(end..end, defs);
        }
        return Ok(());
    }

    let at = events
        .iter()
        .position(|e| e.is_start_of("office:body") || e.is_start_of("office:master-styles"))
        .or_else(|| events.iter().rposition(|e| matches!(e, XmlEvent::End { .. })))
        .unwrap_or(events.len());
    let mut block = vec![XmlEvent::start("office:automatic-styles", &[])];
    block.extend(defs);
    block.push(XmlEvent::end("office:automatic-styles"));
    events.splice(at..at, block);
    Ok(())
}

fn push_odf_text(text: &str, out: &mut Vec<XmlEvent>) {
    for (i, piece) in text.split('\t').enumerate() {
        if i > 0 {
            out.push(XmlEvent::empty("text:tab", &[]));
        }
        if !piece.is_empty() {
            out.push(XmlEvent::text(shield_brackets(piece)));
        }
    }
}

fn raw_style_attr(style: Option<&str>) -> Vec<(String, String)> {
    style
        .map(|s| vec![("text:style-name".to_string(), s.to_string())])
        .unwrap_or_default()
}

struct OdfRenderer<'s> {
    styles: &'s mut OdfStyleSet,
    /// Raw `text:style-name` of the span that held the marker.
    base_span: Option<String>,
    links: bool,
}

impl OdfRenderer<'_> {
    fn text_run(&mut self, text: &str, style: &RunStyle, out: &mut Vec<XmlEvent>) {
        match self.styles.text_style(style) {
            Some(name) => {
                out.push(XmlEvent::start("text:span", &[("text:style-name", name.as_str())]));
                push_odf_text(text, out);
                out.push(XmlEvent::end("text:span"));
            }
            None => push_odf_text(text, out),
        }
    }

    fn inline(&mut self, segments: &[Segment], bold: bool, out: &mut Vec<XmlEvent>) {
        for seg in segments {
            match seg {
                Segment::Text { text, style } => self.text_run(text, &emphasized(style, bold), out),
                Segment::Link { href, text, style } => {
                    let style = emphasized(style, bold);
                    if self.links {
                        out.push(XmlEvent::start(
                            "text:a",
                            &[("xlink:type", "simple"), ("xlink:href", href.as_str())],
                        ));
                        self.text_run(text, &style, out);
                        out.push(XmlEvent::end("text:a"));
                    } else {
                        self.text_run(text, &style, out);
                    }
                }
                Segment::Break => out.push(XmlEvent::empty("text:line-break", &[])),
            }
        }
    }

    fn paragraph(&mut self, p: &Paragraph, proto_style: Option<&str>, bold: bool, out: &mut Vec<XmlEvent>) {
        let name = match p.kind {
            ParagraphKind::Heading(level) => {
                let style = format!("Heading_20_{level}");
                let level = level.to_string();
                out.push(XmlEvent::start(
                    "text:h",
                    &[("text:style-name", style.as_str()), ("text:outline-level", level.as_str())],
                ));
                "text:h"
            }
            ParagraphKind::Quote => {
                out.push(XmlEvent::start("text:p", &[("text:style-name", "Quotations")]));
                "text:p"
            }
            ParagraphKind::Normal => {
                out.push(XmlEvent::Start {
                    name: "text:p".to_string(),
                    attrs: raw_style_attr(proto_style),
                });
                "text:p"
            }
        };
        if let Some(base) = &self.base_span {
            out.push(XmlEvent::Start {
                name: "text:span".to_string(),
                attrs: raw_style_attr(Some(base)),
            });
        }
        if let Some(list) = &p.list {
            if list.level > 0 {
                let count = (2 * list.level).to_string();
                out.push(XmlEvent::empty("text:s", &[("text:c", count.as_str())]));
            }
            out.push(XmlEvent::text(list.label()));
            out.push(XmlEvent::empty("text:tab", &[]));
        }
        let bold = bold || matches!(p.kind, ParagraphKind::Heading(_));
        self.inline(&p.segments, bold, out);
        if self.base_span.is_some() {
            out.push(XmlEvent::end("text:span"));
        }
        out.push(XmlEvent::end(name));
    }

    fn table(&mut self, table: &Table, out: &mut Vec<XmlEvent>) {
        let cols = table.column_count().max(1);
        let name = self.styles.next_table_name();
        let cols_str = cols.to_string();
        out.push(XmlEvent::start("table:table", &[("table:name", name.as_str())]));
        out.push(XmlEvent::empty(
            "table:table-column",
            &[("table:number-columns-repeated", cols_str.as_str())],
        ));
        for row in &table.rows {
            out.push(XmlEvent::start("table:table-row", &[]));
            let mut used = 0usize;
            for cell in row {
                let span = cell.colspan.max(1).min(cols - used);
                if span == 0 {
                    break;
                }
                let span_str = span.to_string();
                let mut attrs = vec![("office:value-type", "string")];
                if span > 1 {
                    attrs.push(("table:number-columns-spanned", span_str.as_str()));
                }
                out.push(XmlEvent::start("table:table-cell", &attrs));
                if cell.paragraphs.is_empty() {
                    out.push(XmlEvent::empty("text:p", &[]));
                }
                for p in &cell.paragraphs {
                    self.paragraph(p, None, cell.header, out);
                }
                out.push(XmlEvent::end("table:table-cell"));
                for _ in 1..span {
                    out.push(XmlEvent::empty("table:covered-table-cell", &[]));
                }
                used += span;
            }
            for _ in used..cols {
                out.push(XmlEvent::start("table:table-cell", &[("office:value-type", "string")]));
                out.push(XmlEvent::empty("text:p", &[]));
                out.push(XmlEvent::end("table:table-cell"));
            }
            out.push(XmlEvent::end("table:table-row"));
        }
        out.push(XmlEvent::end("table:table"));
    }

    fn blocks(&mut self, blocks: &[Block], proto_style: Option<&str>, out: &mut Vec<XmlEvent>) {
        for block in blocks {
            match block {
                Block::Paragraph(p) => self.paragraph(p, proto_style, false, out),
                Block::Table(t) => self.table(t, out),
            }
        }
    }
}

struct MarkerSite {
    para_start: usize,
    para_end: usize,
    event: usize,
    container: usize,
    fragment: usize,
    whole: bool,
}

fn has_objects(events: &[XmlEvent], start: usize, end: usize) -> bool {
    events[start..=end]
        .iter()
        .any(|e| e.name().is_some_and(|n| OBJECT_ELEMENTS.contains(&n)))
}

/// First marker at or after event `from`.
fn next_marker(events: &[XmlEvent], format: DocFormat, from: usize) -> Option<MarkerSite> {
    let mut best: Option<MarkerSite> = None;
    for para in collect_paragraphs(events, format) {
        for seg in &para.segments {
            let (Some(event), Some(container)) = (seg.event, seg.container) else {
                continue;
            };
            if event < from || best.as_ref().is_some_and(|b| b.event <= event) {
                continue;
            }
            let Some(caps) = MARKER_RE.captures(&seg.text) else {
                continue;
            };
            let Ok(fragment) = caps[1].parse::<usize>() else {
                continue;
            };
            let whole = whole_marker(&para.text()) == Some(fragment)
                && !has_objects(events, para.start, para.end);
            best = Some(MarkerSite {
                para_start: para.start,
                para_end: para.end,
                event,
                container,
                fragment,
                whole,
            });
            break;
        }
    }
    best
}

fn split_at_marker(events: &[XmlEvent], idx: usize) -> Option<(String, String)> {
    let XmlEvent::Text { text } = &events[idx] else {
        return None;
    };
    let m = MARKER_RE.find(text)?;
    Some((text[..m.start()].to_string(), text[m.end()..].to_string()))
}

fn replace_paragraph_docx(
    events: &mut Vec<XmlEvent>,
    site: &MarkerSite,
    blocks: &[Block],
    rels: Option<&mut RelsAllocator>,
) -> anyhow::Result<usize> {
    let proto_ppr = Props::child_of(events, site.para_start, site.para_end, "w:pPr")?;
    let base_rpr = match enclosing_start(events, site.event, |n| n == "w:r") {
        Some(run) => {
            let run_end = matching_end(events, run)?;
            Props::child_of(events, run, run_end, "w:rPr")?.unwrap_or_default()
        }
        None => Props::default(),
    };
    let mut renderer = OoxmlRenderer { base_rpr, rels };
    let mut out = Vec::new();
    renderer.blocks(blocks, proto_ppr.as_ref(), &mut out);
    let resume = site.para_start + out.len();
    events.splice(site.para_start..=site.para_end, out);
    Ok(resume)
}

/// Splits the run holding the marker: text before it stays in a copy of the run, the fragment
/// follows as formatted runs, and the remaining text and run content move to a second copy.
fn inline_docx(
    events: &mut Vec<XmlEvent>,
    site: &MarkerSite,
    segments: &[Segment],
    rels: Option<&mut RelsAllocator>,
) -> anyhow::Result<usize> {
    let Some((before, after)) = split_at_marker(events, site.event) else {
        return Ok(site.event + 1);
    };
    let Some(run) = enclosing_start(events, site.event, |n| n == "w:r") else {
        events[site.event] = XmlEvent::text(format!("{before}{after}"));
        return Ok(site.event);
    };
    let run_end = matching_end(events, run)?;
    let t_start = site.container;
    let t_end = matching_end(events, t_start)?;
    let rpr_idx = child_starts(events, run, run_end)
        .into_iter()
        .find(|&c| events[c].name() == Some("w:rPr"));
    let (rpr_events, base_rpr) = match rpr_idx {
        Some(c) => (
            events[c..=matching_end(events, c)?].to_vec(),
            Props::read(events, c)?,
        ),
        None => (Vec::new(), Props::default()),
    };
    let in_link = enclosing_start(events, run, |n| n == "w:hyperlink").is_some();

    let mut out: Vec<XmlEvent> = Vec::new();
    let has_lead = !before.is_empty() || t_start - (run + 1) > rpr_events.len();
    if has_lead {
        out.extend_from_slice(&events[run..t_start]);
        let mut t = events[t_start].clone();
        preserve_space_if_needed(&mut t, &before);
        out.push(t);
        if !before.is_empty() {
            out.push(XmlEvent::text(before));
        }
        out.push(XmlEvent::end("w:t"));
        out.push(XmlEvent::end("w:r"));
    }

    let mut renderer = OoxmlRenderer {
        base_rpr,
        rels: if in_link { None } else { rels },
    };
    renderer.segments(segments, false, &mut out);
    let resume = run + out.len();

    let tail = &events[t_end + 1..run_end];
    if !after.is_empty() || !tail.is_empty() {
        out.push(events[run].clone());
        out.extend(rpr_events);
        let mut t = events[t_start].clone();
        preserve_space_if_needed(&mut t, &after);
        out.push(t);
        if !after.is_empty() {
            out.push(XmlEvent::text(after));
        }
        out.push(XmlEvent::end("w:t"));
        out.extend_from_slice(tail);
        out.push(XmlEvent::end("w:r"));
    }
    events.splice(run..=run_end, out);
    Ok(resume)
}

fn replace_paragraph_odf(
    events: &mut Vec<XmlEvent>,
    site: &MarkerSite,
    blocks: &[Block],
    styles: &mut OdfStyleSet,
) -> usize {
    let style_of = |idx: usize| {
        events[idx]
            .attrs()
            .and_then(|a| find_attr(a, "text:style-name"))
            .map(str::to_string)
    };
    let proto_style = style_of(site.para_start);
    let base_span = if events[site.container].is_start_of("text:span") {
        style_of(site.container)
    } else {
        None
    };
    let mut renderer = OdfRenderer {
        styles,
        base_span,
        links: true,
    };
    let mut out = Vec::new();
    renderer.blocks(blocks, proto_style.as_deref(), &mut out);
    let resume = site.para_start + out.len();
    events.splice(site.para_start..=site.para_end, out);
    resume
}

fn inline_odf(
    events: &mut Vec<XmlEvent>,
    site: &MarkerSite,
    segments: &[Segment],
    styles: &mut OdfStyleSet,
) -> usize {
    let Some((before, after)) = split_at_marker(events, site.event) else {
        return site.event + 1;
    };
    let links = enclosing_start(events, site.event, |n| n == "text:a").is_none();
    let mut renderer = OdfRenderer {
        styles,
        base_span: None,
        links,
    };
    let mut out = Vec::new();
    if !before.is_empty() {
        out.push(XmlEvent::text(before));
    }
    renderer.inline(segments, false, &mut out);
    let resume = site.event + out.len();
    if !after.is_empty() {
        out.push(XmlEvent::text(after));
    }
    events.splice(site.event..=site.event, out);
    resume
}

/// Replaces every rich-fragment marker of the part with rendered markup. A marker that is the
/// whole text of its paragraph replaces the paragraph with block content; any other marker is
/// rendered inline at its position.
pub fn embed_fragments(
    part: &mut XmlPart,
    format: DocFormat,
    ctx: &MergeContext,
    mut rels: Option<&mut RelsAllocator>,
) -> anyhow::Result<EmbedReport> {
    let mut report = EmbedReport::default();
    let mut styles = OdfStyleSet::default();
    let mut cursor = 0usize;

    while let Some(site) = next_marker(&part.events, format, cursor) {
        let html = ctx.rich_fragment(site.fragment).unwrap_or_default();
        let blocks = if site.whole { parse_blocks(html) } else { Vec::new() };
        if !blocks.is_empty() {
            report.paragraphs += 1;
            cursor = match format {
                DocFormat::Docx => {
                    replace_paragraph_docx(&mut part.events, &site, &blocks, rels.as_deref_mut())
                        .with_context(|| format!("embed paragraph in {}", part.name))?
                }
                DocFormat::Odt => replace_paragraph_odf(&mut part.events, &site, &blocks, &mut styles),
            };
            continue;
        }
        report.inline += 1;
        let segments = inline_segments(html);
        cursor = match format {
            DocFormat::Docx => inline_docx(&mut part.events, &site, &segments, rels.as_deref_mut())
                .with_context(|| format!("embed inline fragment in {}", part.name))?,
            DocFormat::Odt => inline_odf(&mut part.events, &site, &segments, &mut styles),
        };
    }

    if format == DocFormat::Odt {
        install_odf_styles(part, &styles)?;
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::residual::rich_marker;
    use crate::package::archive::TemplatePackage;
    use crate::package::xml::{parse_xml_part, write_xml_part};
    use crate::values::rich::sanitize;

    fn ctx_with(html: &str) -> (MergeContext, String) {
        let mut ctx = MergeContext::new();
        let idx = ctx.remember_rich(sanitize(html));
        (ctx, rich_marker(idx))
    }

    fn render(part: &XmlPart) -> String {
        String::from_utf8(write_xml_part(part).expect("write")).expect("utf8")
    }

    #[test]
    fn docx_whole_paragraph_keeps_paragraph_and_run_properties() {
        let (ctx, marker) = ctx_with("<p><b>Hi</b> there</p><ul><li>one</li></ul>");
        let xml = format!(
            r#"<w:body><w:p><w:pPr><w:jc w:val="center"/></w:pPr><w:r><w:rPr><w:sz w:val="28"/></w:rPr><w:t>{marker}</w:t></w:r></w:p></w:body>"#
        );
        let mut part = parse_xml_part("word/document.xml", xml.as_bytes()).expect("parse");
        let report = embed_fragments(&mut part, DocFormat::Docx, &ctx, None).expect("embed");
        assert_eq!(report, EmbedReport { paragraphs: 1, inline: 0 });
        let out = render(&part);
        assert!(out.contains(
            r#"<w:p><w:pPr><w:jc w:val="center"/></w:pPr><w:r><w:rPr><w:b/><w:sz w:val="28"/></w:rPr><w:t xml:space="preserve">Hi</w:t></w:r>"#
        ));
        assert!(out.contains(r#"<w:pPr><w:ind w:left="720" w:hanging="360"/><w:jc w:val="center"/></w:pPr>"#));
        assert!(out.contains("•</w:t><w:tab/>"));
        assert!(!out.contains('\u{F8F0}'));
    }

    #[test]
    fn docx_inline_link_splits_the_run() {
        let (ctx, marker) = ctx_with(r#"<a href="https://x.test/?a=1&amp;b=2">site</a>"#);
        let xml = format!(
            r#"<w:p><w:r><w:rPr><w:i/></w:rPr><w:t>Dear {marker}, bye</w:t></w:r></w:p>"#
        );
        let mut part = parse_xml_part("word/document.xml", xml.as_bytes()).expect("parse");
        let pkg = TemplatePackage { entries: Vec::new() };
        let mut rels = RelsAllocator::load(&pkg, "word/document.xml").expect("rels");
        let report = embed_fragments(&mut part, DocFormat::Docx, &ctx, Some(&mut rels)).expect("embed");
        assert_eq!(report.inline, 1);
        let out = render(&part);
        assert!(out.contains(r#"<w:r><w:rPr><w:i/></w:rPr><w:t xml:space="preserve">Dear </w:t></w:r><w:hyperlink r:id="rId1" w:history="1">"#));
        assert!(out.contains(r#"<w:rStyle w:val="Hyperlink"/><w:i/><w:color w:val="0563C1"/><w:u w:val="single"/>"#));
        assert!(out.contains(r#"<w:r><w:rPr><w:i/></w:rPr><w:t>, bye</w:t></w:r></w:p>"#));

        let (name, bytes, existed) = rels.finish().expect("finish").expect("modified");
        assert_eq!(name, "word/_rels/document.xml.rels");
        assert!(!existed);
        let rels_xml = String::from_utf8(bytes).expect("utf8");
        assert!(rels_xml.contains(r#"Id="rId1""#));
        assert!(rels_xml.contains(r#"Target="https://x.test/?a=1&amp;b=2" TargetMode="External""#));
    }

    #[test]
    fn odt_inline_bold_adds_automatic_style() {
        let (ctx, marker) = ctx_with("<p>a <strong>b</strong></p>");
        let xml = format!(
            r#"<office:document-content><office:automatic-styles/><office:body><office:text><text:p text:style-name="P1">x {marker} y</text:p></office:text></office:body></office:document-content>"#
        );
        let mut part = parse_xml_part("content.xml", xml.as_bytes()).expect("parse");
        embed_fragments(&mut part, DocFormat::Odt, &ctx, None).expect("embed");
        let out = render(&part);
        assert!(out.contains(r#"<text:p text:style-name="P1">x a <text:span text:style-name="docfill_b">b</text:span> y</text:p>"#));
        assert!(out.contains(r#"<office:automatic-styles><style:style style:name="docfill_b" style:family="text"><style:text-properties fo:font-weight="bold""#));
    }

    #[test]
    fn odt_whole_paragraph_table_with_colspan() {
        let (ctx, marker) = ctx_with(
            r#"<table><tr><th colspan="2">Head</th></tr><tr><td>a</td><td>b</td></tr></table>"#,
        );
        let xml = format!(
            r#"<office:document-content><office:body><office:text><text:p text:style-name="P2">{marker}</text:p></office:text></office:body></office:document-content>"#
        );
        let mut part = parse_xml_part("content.xml", xml.as_bytes()).expect("parse");
        let report = embed_fragments(&mut part, DocFormat::Odt, &ctx, None).expect("embed");
        assert_eq!(report.paragraphs, 1);
        let out = render(&part);
        assert!(out.contains(r#"<table:table table:name="docfill_table_1"><table:table-column table:number-columns-repeated="2"/>"#));
        assert!(out.contains(r#"table:number-columns-spanned="2"><text:p><text:span text:style-name="docfill_b">Head</text:span></text:p></table:table-cell><table:covered-table-cell/>"#));
        assert!(out.contains("<office:automatic-styles>"));
        assert!(!out.contains("P2"));
    }

    #[test]
    fn paragraph_with_drawing_is_embedded_inline() {
        let (ctx, marker) = ctx_with("<p>x</p>");
        let xml = format!(
            r#"<w:p><w:r><w:drawing/></w:r><w:r><w:t>{marker}</w:t></w:r></w:p>"#
        );
        let mut part = parse_xml_part("word/document.xml", xml.as_bytes()).expect("parse");
        let report = embed_fragments(&mut part, DocFormat::Docx, &ctx, None).expect("embed");
        assert_eq!(report, EmbedReport { paragraphs: 0, inline: 1 });
        let out = render(&part);
        assert!(out.contains("<w:drawing/>"));
        assert!(out.ends_with(r#"<w:r><w:t xml:space="preserve">x</w:t></w:r></w:p>"#));
    }
}
