use regex::Regex;

use crate::package::archive::DocFormat;
use crate::package::xml::{set_attr, XmlEvent, XmlPart};

pub fn is_paragraph(format: DocFormat, name: &str) -> bool {
    match format {
        DocFormat::Docx => name == "w:p",
        DocFormat::Odt => name == "text:p" || name == "text:h",
    }
}

fn is_text_container(format: DocFormat, name: &str) -> bool {
    match format {
        DocFormat::Docx => name == "w:t",
        DocFormat::Odt => matches!(name, "text:p" | "text:h" | "text:span" | "text:a"),
    }
}

fn is_barrier(format: DocFormat, name: &str) -> bool {
    match format {
        DocFormat::Docx => matches!(name, "w:tab" | "w:br" | "w:cr"),
        DocFormat::Odt => matches!(name, "text:s" | "text:tab" | "text:line-break"),
    }
}

#[derive(Clone, Debug)]
pub struct TextSegment {
    /// Index of the owning `Text` event; `None` for line/tab barriers.
    pub event: Option<usize>,
    /// Index of the element start holding the text (`w:t`, `text:span`, ...).
    pub container: Option<usize>,
    pub text: String,
}

#[derive(Clone, Debug)]
pub struct ParagraphText {
    pub start: usize,
    pub end: usize,
    pub segments: Vec<TextSegment>,
}

impl ParagraphText {
    pub fn text(&self) -> String {
        self.segments.iter().map(|s| s.text.as_str()).collect()
    }
}

/// Visible text of every paragraph in document order. Text belongs to its innermost paragraph;
/// tabs and breaks appear as `\n` so no token can span them.
pub fn collect_paragraphs(events: &[XmlEvent], format: DocFormat) -> Vec<ParagraphText> {
    let mut done: Vec<ParagraphText> = Vec::new();
    let mut open: Vec<ParagraphText> = Vec::new();
    let mut stack: Vec<(usize, &str)> = Vec::new();

    for (idx, ev) in events.iter().enumerate() {
        match ev {
            XmlEvent::Start { name, .. } => {
                if is_paragraph(format, name) {
                    open.push(ParagraphText {
                        start: idx,
                        end: idx,
                        segments: Vec::new(),
                    });
                }
                stack.push((idx, name.as_str()));
            }
            XmlEvent::End { name } => {
                stack.pop();
                if is_paragraph(format, name) {
                    if let Some(mut p) = open.pop() {
                        p.end = idx;
                        done.push(p);
                    }
                }
            }
            XmlEvent::Empty { name, .. } => {
                if is_barrier(format, name) {
                    if let Some(p) = open.last_mut() {
                        p.segments.push(TextSegment {
                            event: None,
                            container: None,
                            text: "\n".to_string(),
                        });
                    }
                }
            }
            XmlEvent::Text { text } => {
                let Some(&(parent_idx, parent)) = stack.last() else {
                    continue;
                };
                if !is_text_container(format, parent) {
                    continue;
                }
                if let Some(p) = open.last_mut() {
                    p.segments.push(TextSegment {
                        event: Some(idx),
                        container: Some(parent_idx),
                        text: text.clone(),
                    });
                }
            }
            _ => {}
        }
    }

    done.sort_by_key(|p| p.start);
    done
}

/// Moves the characters of every `pattern` match that spans several text nodes into the node
/// where the match starts. Returns the number of healed matches.
pub fn heal_placeholders(part: &mut XmlPart, format: DocFormat, pattern: &Regex) -> usize {
    let mut healed = 0usize;
    for para in collect_paragraphs(&part.events, format) {
        if para.segments.len() < 2 {
            continue;
        }
        let joined = para.text();

        // Owner segment per byte of `joined`.
        let mut owner: Vec<usize> = Vec::with_capacity(joined.len());
        for (seg_idx, seg) in para.segments.iter().enumerate() {
            owner.extend(std::iter::repeat(seg_idx).take(seg.text.len()));
        }

        let mut changed = false;
        for m in pattern.find_iter(&joined) {
            let first = owner[m.start()];
            let last = owner[m.end() - 1];
            if first == last || para.segments[first].event.is_none() {
                continue;
            }
            for o in &mut owner[m.start()..m.end()] {
                *o = first;
            }
            healed += 1;
            changed = true;
        }
        if !changed {
            continue;
        }

        let mut texts: Vec<String> = vec![String::new(); para.segments.len()];
        for (pos, ch) in joined.char_indices() {
            texts[owner[pos]].push(ch);
        }
        for (seg, new_text) in para.segments.iter().zip(texts) {
            let Some(ev_idx) = seg.event else {
                continue;
            };
            if seg.text == new_text {
                continue;
            }
            if format == DocFormat::Docx {
                if let Some(c) = seg.container {
                    preserve_space_if_needed(&mut part.events[c], &new_text);
                }
            }
            part.events[ev_idx] = XmlEvent::Text { text: new_text };
        }
    }
    healed
}

/// Replaces every text node for which `f` returns new content. DOCX `w:t` parents are marked
/// `xml:space="preserve"` when the new text starts or ends with whitespace.
pub fn rewrite_texts(
    events: &mut [XmlEvent],
    format: DocFormat,
    mut f: impl FnMut(&str) -> Option<String>,
) -> usize {
    let mut stack: Vec<usize> = Vec::new();
    let mut rewritten = 0usize;
    for idx in 0..events.len() {
        let new_text = match &events[idx] {
            XmlEvent::Start { .. } => {
                stack.push(idx);
                continue;
            }
            XmlEvent::End { .. } => {
                stack.pop();
                continue;
            }
            XmlEvent::Text { text } => match f(text) {
                Some(t) if t != *text => t,
                _ => continue,
            },
            _ => continue,
        };
        if format == DocFormat::Docx {
            if let Some(&p) = stack.last() {
                if events[p].is_start_of("w:t") {
                    preserve_space_if_needed(&mut events[p], &new_text);
                }
            }
        }
        events[idx] = XmlEvent::Text { text: new_text };
        rewritten += 1;
    }
    rewritten
}

pub fn preserve_space_if_needed(w_t: &mut XmlEvent, text: &str) {
    if text.starts_with(char::is_whitespace) || text.ends_with(char::is_whitespace) {
        set_attr(w_t, "xml:space", "preserve");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::xml::{parse_xml_part, write_xml_part};
    use crate::template::placeholder::PLACEHOLDER_RE;

    fn heal(xml: &str, format: DocFormat) -> (String, usize) {
        let mut part = parse_xml_part("p.xml", xml.as_bytes()).expect("parse");
        let n = heal_placeholders(&mut part, format, &PLACEHOLDER_RE);
        let out = String::from_utf8(write_xml_part(&part).expect("write")).expect("utf8");
        (out, n)
    }

    #[test]
    fn split_docx_placeholder_moves_to_first_run() {
        let xml = r#"<w:p><w:r><w:t>Dear [cli</w:t></w:r><w:r><w:rPr><w:b/></w:rPr><w:t>ent_na</w:t></w:r><w:r><w:t>me], hi</w:t></w:r></w:p>"#;
        let (out, n) = heal(xml, DocFormat::Docx);
        assert_eq!(n, 1);
        assert!(out.contains("<w:t>Dear [client_name]</w:t>"));
        assert!(out.contains(r#"<w:t xml:space="preserve">, hi</w:t>"#));
        assert!(out.contains("<w:b/></w:rPr><w:t></w:t>"));
    }

    #[test]
    fn tab_blocks_healing() {
        let xml = r#"<w:p><w:r><w:t>[a</w:t><w:tab/><w:t>b]</w:t></w:r></w:p>"#;
        let (_, n) = heal(xml, DocFormat::Docx);
        assert_eq!(n, 0);
    }

    #[test]
    fn odt_spans_are_healed() {
        let xml = r#"<text:p text:style-name="P1">[it<text:span text:style-name="T1">ems[*].ti</text:span>tle]</text:p>"#;
        let (out, n) = heal(xml, DocFormat::Odt);
        assert_eq!(n, 1);
        assert!(out.starts_with(r#"<text:p text:style-name="P1">[items[*].title]<text:span"#));
    }

    #[test]
    fn nested_paragraph_text_belongs_to_inner_paragraph() {
        let xml = r#"<text:p>outer<draw:frame><draw:text-box><text:p>inner</text:p></draw:text-box></draw:frame></text:p>"#;
        let part = parse_xml_part("c.xml", xml.as_bytes()).expect("parse");
        let paras = collect_paragraphs(&part.events, DocFormat::Odt);
        let texts: Vec<String> = paras.iter().map(|p| p.text()).collect();
        assert_eq!(texts, vec!["outer".to_string(), "inner".to_string()]);
    }
}
