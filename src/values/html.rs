use scraper::{ElementRef, Html};

/// Character formatting carried by an inline segment.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct RunStyle {
    pub bold: bool,
    pub italic: bool,
    pub underline: bool,
    pub strike: bool,
    pub superscript: bool,
    pub subscript: bool,
    pub color: Option<[u8; 3]>,
}

impl RunStyle {
    pub fn is_plain(&self) -> bool {
        *self == RunStyle::default()
    }

    pub fn color_hex(&self) -> Option<String> {
        self.color
            .map(|[r, g, b]| format!("{r:02X}{g:02X}{b:02X}"))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Segment {
    Text { text: String, style: RunStyle },
    Link { href: String, text: String, style: RunStyle },
    Break,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParagraphKind {
    Normal,
    Heading(u8),
    Quote,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ListInfo {
    pub ordered: bool,
    /// 0 for top-level items.
    pub level: usize,
    /// 1-based position among its siblings.
    pub number: usize,
}

impl ListInfo {
    pub fn label(&self) -> String {
        if self.ordered {
            format!("{}.", self.number)
        } else {
            "•".to_string()
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Paragraph {
    pub kind: ParagraphKind,
    pub list: Option<ListInfo>,
    pub segments: Vec<Segment>,
}

impl Paragraph {
    fn new(kind: ParagraphKind, list: Option<ListInfo>) -> Self {
        Self {
            kind,
            list,
            segments: Vec::new(),
        }
    }

    pub fn plain_text(&self) -> String {
        self.segments
            .iter()
            .map(|s| match s {
                Segment::Text { text, .. } | Segment::Link { text, .. } => text.as_str(),
                Segment::Break => "\n",
            })
            .collect()
    }

    fn has_content(&self) -> bool {
        self.segments.iter().any(|s| match s {
            Segment::Text { text, .. } | Segment::Link { text, .. } => !text.trim().is_empty(),
            Segment::Break => false,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TableCell {
    pub paragraphs: Vec<Paragraph>,
    pub colspan: usize,
    pub header: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Table {
    pub rows: Vec<Vec<TableCell>>,
}

impl Table {
    pub fn column_count(&self) -> usize {
        self.rows
            .iter()
            .map(|r| {
                r.iter()
                    .fold(0usize, |n, c| n.saturating_add(c.colspan.max(1)))
            })
            .max()
            .unwrap_or(0)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Block {
    Paragraph(Paragraph),
    Table(Table),
}

/// Parses sanitized HTML into renderable blocks. Empty paragraphs are dropped.
pub fn parse_blocks(html: &str) -> Vec<Block> {
    let fragment = Html::parse_fragment(html);
    let mut builder = BlockBuilder::default();
    let ctx = Ctx::default();
    builder.walk_children(fragment.root_element(), &ctx);
    builder.flush();
    builder.blocks
}

/// Flattens a fragment to one line of segments for inline embedding; block boundaries become
/// breaks and table cells are separated by tabs.
pub fn inline_segments(html: &str) -> Vec<Segment> {
    let mut out: Vec<Segment> = Vec::new();
    for block in parse_blocks(html) {
        let paragraphs: Vec<Paragraph> = match block {
            Block::Paragraph(p) => vec![p],
            Block::Table(t) => t
                .rows
                .into_iter()
                .map(|row| {
                    let mut p = Paragraph::new(ParagraphKind::Normal, None);
                    for (i, cell) in row.into_iter().enumerate() {
                        if i > 0 {
                            push_text(&mut p, "\t", RunStyle::default(), None);
                        }
                        for (j, cp) in cell.paragraphs.into_iter().enumerate() {
                            if j > 0 {
                                p.segments.push(Segment::Break);
                            }
                            p.segments.extend(cp.segments);
                        }
                    }
                    p
                })
                .collect(),
        };
        for p in paragraphs {
            if !out.is_empty() {
                out.push(Segment::Break);
            }
            if let Some(list) = p.list {
                push_segment(&mut out, format!("{} ", list.label()), RunStyle::default());
            }
            out.extend(p.segments);
        }
    }
    out
}

fn push_segment(out: &mut Vec<Segment>, text: String, style: RunStyle) {
    out.push(Segment::Text { text, style });
}

#[derive(Clone, Default)]
struct Ctx {
    style: RunStyle,
    href: Option<String>,
    kind: Option<ParagraphKind>,
    /// (ordered, items seen so far) per open list.
    lists: Vec<(bool, usize)>,
    in_item: bool,
}

#[derive(Default)]
struct BlockBuilder {
    blocks: Vec<Block>,
    current: Option<Paragraph>,
}

impl BlockBuilder {
    fn flush(&mut self) {
        if let Some(mut p) = self.current.take() {
            trim_trailing(&mut p);
            if p.has_content() {
                self.blocks.push(Block::Paragraph(p));
            }
        }
    }

    fn paragraph(&mut self, ctx: &Ctx) -> &mut Paragraph {
        self.current
            .get_or_insert_with(|| Paragraph::new(ctx.kind.unwrap_or(ParagraphKind::Normal), None))
    }

    fn walk_children(&mut self, el: ElementRef<'_>, ctx: &Ctx) {
        for child in el.children() {
            if let Some(text) = child.value().as_text() {
                let collapsed = collapse_ws(text);
                if collapsed.is_empty() {
                    continue;
                }
                let p = self.paragraph(ctx);
                let at_start = p.segments.is_empty() || matches!(p.segments.last(), Some(Segment::Break));
                let collapsed = if at_start {
                    collapsed.trim_start().to_string()
                } else {
                    collapsed
                };
                if !collapsed.is_empty() {
                    push_text(p, &collapsed, ctx.style, ctx.href.as_deref());
                }
            } else if let Some(child_el) = ElementRef::wrap(child) {
                self.walk_element(child_el, ctx);
            }
        }
    }

    fn walk_element(&mut self, el: ElementRef<'_>, ctx: &Ctx) {
        let name = el.value().name().to_ascii_lowercase();
        match name.as_str() {
            "p" | "div" | "blockquote" | "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => {
                let kind = match name.as_str() {
                    "blockquote" => ParagraphKind::Quote,
                    "p" | "div" => ctx.kind.unwrap_or(ParagraphKind::Normal),
                    h => ParagraphKind::Heading(h[1..].parse().unwrap_or(1)),
                };
                if ctx.in_item {
                    if let Some(p) = self.current.as_mut() {
                        if p.has_content() {
                            p.segments.push(Segment::Break);
                        }
                    }
                    self.walk_children(el, ctx);
                    return;
                }
                self.flush();
                let inner = Ctx {
                    kind: Some(kind),
                    ..ctx.clone()
                };
                self.walk_children(el, &inner);
                self.flush();
            }
            "ul" | "ol" => {
                self.flush();
                let mut inner = ctx.clone();
                inner.lists.push((name == "ol", 0));
                inner.in_item = false;
                for child in el.children().filter_map(ElementRef::wrap) {
                    if child.value().name().eq_ignore_ascii_case("li") {
                        if let Some(top) = inner.lists.last_mut() {
                            top.1 += 1;
                        }
                    }
                    self.walk_element(child, &inner);
                }
                self.flush();
            }
            "li" => {
                self.flush();
                let list = ctx.lists.last().map(|(ordered, n)| ListInfo {
                    ordered: *ordered,
                    level: ctx.lists.len().saturating_sub(1),
                    number: (*n).max(1),
                });
                self.current = Some(Paragraph::new(ParagraphKind::Normal, list));
                let inner = Ctx {
                    in_item: true,
                    kind: None,
                    ..ctx.clone()
                };
                self.walk_children(el, &inner);
                self.flush();
            }
            "table" => {
                self.flush();
                let table = parse_table(el);
                if !table.rows.is_empty() {
                    self.blocks.push(Block::Table(table));
                }
            }
            "br" => {
                self.paragraph(ctx).segments.push(Segment::Break);
            }
            _ => {
                let mut inner = ctx.clone();
                apply_inline(&name, el, &mut inner);
                self.walk_children(el, &inner);
            }
        }
    }
}

fn apply_inline(name: &str, el: ElementRef<'_>, ctx: &mut Ctx) {
    match name {
        "strong" | "b" => ctx.style.bold = true,
        "em" | "i" => ctx.style.italic = true,
        "u" | "ins" => ctx.style.underline = true,
        "s" | "strike" | "del" => ctx.style.strike = true,
        "sup" => ctx.style.superscript = true,
        "sub" => ctx.style.subscript = true,
        "a" => {
            if let Some(href) = el.value().attr("href").map(str::trim).filter(|h| !h.is_empty()) {
                ctx.href = Some(href.to_string());
            }
        }
        "span" => {
            if let Some(style) = el.value().attr("style") {
                apply_css(style, &mut ctx.style);
            }
        }
        _ => {}
    }
}

fn apply_css(style: &str, run: &mut RunStyle) {
    for decl in style.split(';') {
        let Some((prop, value)) = decl.split_once(':') else {
            continue;
        };
        let value = value.trim().to_ascii_lowercase();
        match prop.trim().to_ascii_lowercase().as_str() {
            "font-weight" => {
                run.bold = value == "bold"
                    || value == "bolder"
                    || value.parse::<u32>().is_ok_and(|w| w >= 600);
            }
            "font-style" => run.italic = value == "italic" || value == "oblique",
            "text-decoration" => {
                if value.contains("underline") {
                    run.underline = true;
                }
                if value.contains("line-through") {
                    run.strike = true;
                }
            }
            "color" => run.color = parse_color(&value).or(run.color),
            _ => {}
        }
    }
}

pub fn parse_color(value: &str) -> Option<[u8; 3]> {
    let v = value.trim().to_ascii_lowercase();
    if let Some(hex) = v.strip_prefix('#') {
        if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        let expanded: String = match hex.len() {
            3 => hex.chars().flat_map(|c| [c, c]).collect(),
            6 => hex.to_string(),
            _ => return None,
        };
        let byte = |i: usize| u8::from_str_radix(&expanded[i..i + 2], 16).ok();
        return Some([byte(0)?, byte(2)?, byte(4)?]);
    }
    if let Some(inner) = v.strip_prefix("rgb(").and_then(|s| s.strip_suffix(')')) {
        let parts: Vec<u8> = inner
            .split(',')
            .filter_map(|p| p.trim().parse::<u8>().ok())
            .collect();
        if let [r, g, b] = parts[..] {
            return Some([r, g, b]);
        }
        return None;
    }
    let named = match v.as_str() {
        "black" => [0, 0, 0],
        "white" => [255, 255, 255],
        "red" => [255, 0, 0],
        "green" => [0, 128, 0],
        "blue" => [0, 0, 255],
        "yellow" => [255, 255, 0],
        "orange" => [255, 165, 0],
        "purple" => [128, 0, 128],
        "gray" | "grey" => [128, 128, 128],
        _ => return None,
    };
    Some(named)
}

fn parse_table(table: ElementRef<'_>) -> Table {
    let mut rows: Vec<Vec<TableCell>> = Vec::new();
    for child in table.children().filter_map(ElementRef::wrap) {
        match child.value().name() {
            "tr" => rows.push(parse_row(child)),
            "thead" | "tbody" | "tfoot" => {
                for tr in child.children().filter_map(ElementRef::wrap) {
                    if tr.value().name() == "tr" {
                        rows.push(parse_row(tr));
                    }
                }
            }
            _ => {}
        }
    }
    rows.retain(|r| !r.is_empty());
    Table { rows }
}

/// Widest span honoured for a single cell; larger values are clamped.
pub const MAX_COLSPAN: usize = 64;

fn parse_row(tr: ElementRef<'_>) -> Vec<TableCell> {
    tr.children()
        .filter_map(ElementRef::wrap)
        .filter(|c| matches!(c.value().name(), "td" | "th"))
        .map(|cell| {
            let header = cell.value().name() == "th";
            let colspan = cell
                .value()
                .attr("colspan")
                .and_then(|v| v.trim().parse::<usize>().ok())
                .filter(|n| *n > 0)
                .unwrap_or(1)
                .min(MAX_COLSPAN);
            let mut builder = BlockBuilder::default();
            let ctx = Ctx {
                style: RunStyle {
                    bold: header,
                    ..RunStyle::default()
                },
                ..Ctx::default()
            };
            builder.walk_children(cell, &ctx);
            builder.flush();
            let paragraphs = builder
                .blocks
                .into_iter()
                .flat_map(|b| match b {
                    Block::Paragraph(p) => vec![p],
                    Block::Table(t) => t
                        .rows
                        .into_iter()
                        .flatten()
                        .flat_map(|c| c.paragraphs)
                        .collect(),
                })
                .collect();
            TableCell {
                paragraphs,
                colspan,
                header,
            }
        })
        .collect()
}

fn collapse_ws(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_ws = false;
    for ch in text.chars() {
        if ch.is_whitespace() && ch != '\u{a0}' {
            if !in_ws {
                out.push(' ');
            }
            in_ws = true;
        } else {
            out.push(ch);
            in_ws = false;
        }
    }
    out
}

fn push_text(p: &mut Paragraph, text: &str, style: RunStyle, href: Option<&str>) {
    match (p.segments.last_mut(), href) {
        (Some(Segment::Text { text: prev, style: s }), None) if *s == style => {
            prev.push_str(text);
            return;
        }
        (Some(Segment::Link { text: prev, style: s, href: h }), Some(href)) if *s == style && h.as_str() == href => {
            prev.push_str(text);
            return;
        }
        _ => {}
    }
    let seg = match href {
        Some(href) => Segment::Link {
            href: href.to_string(),
            text: text.to_string(),
            style,
        },
        None => Segment::Text {
            text: text.to_string(),
            style,
        },
    };
    p.segments.push(seg);
}

fn trim_trailing(p: &mut Paragraph) {
    while matches!(p.segments.last(), Some(Segment::Break)) {
        p.segments.pop();
    }
    if let Some(Segment::Text { text, .. } | Segment::Link { text, .. }) = p.segments.last_mut() {
        let trimmed = text.trim_end().len();
        text.truncate(trimmed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paragraphs(html: &str) -> Vec<Paragraph> {
        parse_blocks(html)
            .into_iter()
            .filter_map(|b| match b {
                Block::Paragraph(p) => Some(p),
                Block::Table(_) => None,
            })
            .collect()
    }

    #[test]
    fn inline_styles_become_segments() {
        let ps = paragraphs("<p>Hello <strong>bold <em>both</em></strong> end</p>");
        assert_eq!(ps.len(), 1);
        let segs = &ps[0].segments;
        assert_eq!(segs.len(), 4);
        assert_eq!(
            segs[1],
            Segment::Text {
                text: "bold ".to_string(),
                style: RunStyle {
                    bold: true,
                    ..RunStyle::default()
                }
            }
        );
        assert!(matches!(&segs[2], Segment::Text { style, .. } if style.bold && style.italic));
        assert_eq!(ps[0].plain_text(), "Hello bold both end");
    }

    #[test]
    fn headings_quotes_and_lists() {
        let ps = paragraphs("<h2>Title</h2><blockquote>q</blockquote><ol><li>one</li><li>two<ul><li>sub</li></ul></li></ol>");
        assert_eq!(ps[0].kind, ParagraphKind::Heading(2));
        assert_eq!(ps[1].kind, ParagraphKind::Quote);
        assert_eq!(ps[2].list, Some(ListInfo { ordered: true, level: 0, number: 1 }));
        assert_eq!(ps[3].list.map(|l| l.number), Some(2));
        assert_eq!(ps[3].plain_text(), "two");
        assert_eq!(ps[4].list, Some(ListInfo { ordered: false, level: 1, number: 1 }));
    }

    #[test]
    fn links_and_breaks() {
        let ps = paragraphs(r#"<p>see <a href="https://x.test">site</a><br>next</p>"#);
        let segs = &ps[0].segments;
        assert!(matches!(&segs[1], Segment::Link { href, text, .. } if href == "https://x.test" && text == "site"));
        assert_eq!(segs[2], Segment::Break);
        assert_eq!(ps[0].plain_text(), "see site\nnext");
    }

    #[test]
    fn tables_with_colspan() {
        let blocks = parse_blocks("<table><thead><tr><th>A</th><th>B</th></tr></thead><tbody><tr><td colspan=\"2\">wide</td></tr></tbody></table>");
        let Block::Table(t) = &blocks[0] else {
            panic!("expected table");
        };
        assert_eq!(t.rows.len(), 2);
        assert_eq!(t.column_count(), 2);
        assert!(t.rows[0][0].header);
        assert_eq!(t.rows[1][0].colspan, 2);
        assert_eq!(t.rows[1][0].paragraphs[0].plain_text(), "wide");
    }

    #[test]
    fn oversized_colspan_is_clamped() {
        let blocks = parse_blocks(
            "<table><tr><td colspan=\"18446744073709551615\">a</td><td colspan=\"2\">b</td></tr></table>",
        );
        let Block::Table(t) = &blocks[0] else {
            panic!("expected table");
        };
        assert_eq!(t.rows[0][0].colspan, MAX_COLSPAN);
        assert_eq!(t.column_count(), MAX_COLSPAN + 2);

        let wide = Table {
            rows: vec![vec![
                TableCell {
                    paragraphs: Vec::new(),
                    colspan: usize::MAX,
                    header: false,
                },
                TableCell {
                    paragraphs: Vec::new(),
                    colspan: 2,
                    header: false,
                },
            ]],
        };
        assert_eq!(wide.column_count(), usize::MAX);
    }

    #[test]
    fn non_ascii_hex_color_is_ignored() {
        assert_eq!(parse_color("#aéaaa"), None);
        assert_eq!(parse_color("#ééé"), None);
        assert_eq!(parse_color("#+1a"), None);
        let ps = paragraphs(r#"<p><span style="color: #aéaaa">x</span></p>"#);
        let Segment::Text { style, .. } = &ps[0].segments[0] else {
            panic!("expected text");
        };
        assert_eq!(style.color_hex(), None);
    }

    #[test]
    fn span_colors() {
        let ps = paragraphs(r#"<p><span style="color: #f00; font-weight: 700">x</span></p>"#);
        let Segment::Text { style, .. } = &ps[0].segments[0] else {
            panic!("expected text");
        };
        assert!(style.bold);
        assert_eq!(style.color_hex().as_deref(), Some("FF0000"));
        assert_eq!(parse_color("rgb(1, 2, 3)"), Some([1, 2, 3]));
    }

    #[test]
    fn inline_flattening() {
        let segs = inline_segments("<p>a</p><ul><li>b</li></ul>");
        let text: String = segs
            .iter()
            .map(|s| match s {
                Segment::Text { text, .. } | Segment::Link { text, .. } => text.clone(),
                Segment::Break => "|".to_string(),
            })
            .collect();
        assert_eq!(text, "a|• b");
    }

    #[test]
    fn empty_paragraphs_dropped() {
        assert!(parse_blocks("<p> </p><p><br></p>").is_empty());
    }
}
