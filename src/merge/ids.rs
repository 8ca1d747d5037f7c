use std::collections::HashMap;

use anyhow::Context;

use crate::package::archive::{DocFormat, TemplatePackage};
use crate::package::xml::{escape_attr, find_attr, parse_xml_part, write_xml_part, XmlEvent, XmlPart};

const HYPERLINK_REL_TYPE: &str =
    "http://schemas.openxmlformats.org/officeDocument/2006/relationships/hyperlink";
const RELATIONSHIPS_NS: &str = "http://schemas.openxmlformats.org/package/2006/relationships";

const ODF_NAMED_ATTRS: &[&str] = &["draw:name", "xml:id", "table:name"];
const ODF_TEXT_NAME_OWNERS: &[&str] = &[
    "text:bookmark",
    "text:bookmark-start",
    "text:bookmark-end",
    "text:section",
    "text:reference-mark",
    "text:reference-mark-start",
    "text:reference-mark-end",
];

/// Gives each repeated copy of a block its own drawing/bookmark/control ids. Every copy,
/// including the first, is renumbered the same way.
pub struct IdRenumberer {
    format: DocFormat,
    next_docpr: u64,
    next_bookmark: u64,
    next_sdt: u64,
}

impl IdRenumberer {
    pub fn for_part(events: &[XmlEvent], format: DocFormat) -> Self {
        let mut max_docpr = 0u64;
        let mut max_bookmark = 0u64;
        let mut max_sdt = 0u64;
        for ev in events {
            let (Some(name), Some(attrs)) = (ev.name(), ev.attrs()) else {
                continue;
            };
            let num = |key: &str| find_attr(attrs, key).and_then(|v| v.parse::<u64>().ok());
            match name {
                "wp:docPr" => max_docpr = max_docpr.max(num("id").unwrap_or(0)),
                "w:bookmarkStart" | "w:bookmarkEnd" => {
                    max_bookmark = max_bookmark.max(num("w:id").unwrap_or(0))
                }
                "w:id" => max_sdt = max_sdt.max(num("w:val").unwrap_or(0)),
                _ => {}
            }
        }
        Self {
            format,
            next_docpr: max_docpr + 1,
            next_bookmark: max_bookmark + 1,
            next_sdt: max_sdt + 1,
        }
    }

    /// Renumbers ids inside `block`; `copy` is the 0-based index of this copy.
    pub fn renumber(&mut self, block: &mut [XmlEvent], copy: usize) {
        match self.format {
            DocFormat::Docx => self.renumber_docx(block, copy),
            DocFormat::Odt => renumber_odf(block, copy),
        }
    }

    fn renumber_docx(&mut self, block: &mut [XmlEvent], copy: usize) {
        let mut bookmark_ids: HashMap<String, String> = HashMap::new();
        let mut in_sdt_pr = 0usize;
        for ev in block.iter_mut() {
            if ev.is_start_of("w:sdtPr") {
                in_sdt_pr += 1;
            } else if ev.is_end_of("w:sdtPr") {
                in_sdt_pr = in_sdt_pr.saturating_sub(1);
            }
            let Some(name) = ev.name().map(str::to_string) else {
                continue;
            };
            let Some(attrs) = ev.attrs_mut() else {
                continue;
            };
            attrs.retain(|(k, _)| k != "w14:paraId" && k != "w14:textId");
            match name.as_str() {
                "wp:docPr" => {
                    set_value(attrs, "id", &self.next_docpr.to_string());
                    self.next_docpr += 1;
                }
                "w:bookmarkStart" | "w:bookmarkEnd" => {
                    if let Some(old) = find_attr(attrs, "w:id").map(str::to_string) {
                        let new_id = bookmark_ids.entry(old).or_insert_with(|| {
                            let id = self.next_bookmark.to_string();
                            self.next_bookmark += 1;
                            id
                        });
                        let new_id = new_id.clone();
                        set_value(attrs, "w:id", &new_id);
                    }
                    if let Some(bm_name) = find_attr(attrs, "w:name").map(str::to_string) {
                        set_value(attrs, "w:name", &format!("{bm_name}_{}", copy + 1));
                    }
                }
                "w:id" if in_sdt_pr > 0 => {
                    set_value(attrs, "w:val", &self.next_sdt.to_string());
                    self.next_sdt += 1;
                }
                _ => {}
            }
        }
    }
}

fn renumber_odf(block: &mut [XmlEvent], copy: usize) {
    for ev in block.iter_mut() {
        let Some(name) = ev.name().map(str::to_string) else {
            continue;
        };
        let Some(attrs) = ev.attrs_mut() else {
            continue;
        };
        let text_name_owner = ODF_TEXT_NAME_OWNERS.contains(&name.as_str());
        for (k, v) in attrs.iter_mut() {
            if ODF_NAMED_ATTRS.contains(&k.as_str()) || (text_name_owner && k == "text:name") {
                *v = format!("{v}_{}", copy + 1);
            }
        }
    }
}

fn set_value(attrs: &mut Vec<(String, String)>, key: &str, value: &str) {
    match attrs.iter_mut().find(|(k, _)| k == key) {
        Some((_, v)) => *v = value.to_string(),
        None => attrs.push((key.to_string(), value.to_string())),
    }
}

/// Relationship part of an OOXML part: `word/document.xml` -> `word/_rels/document.xml.rels`.
pub fn rels_part_name(part_name: &str) -> String {
    match part_name.rsplit_once('/') {
        Some((dir, file)) => format!("{dir}/_rels/{file}.rels"),
        None => format!("_rels/{part_name}.rels"),
    }
}

/// Allocates external hyperlink relationships for one OOXML part.
pub struct RelsAllocator {
    name: String,
    part: XmlPart,
    existed: bool,
    next_id: u64,
    by_target: HashMap<String, String>,
    modified: bool,
}

impl RelsAllocator {
    pub fn load(pkg: &TemplatePackage, part_name: &str) -> anyhow::Result<Self> {
        let name = rels_part_name(part_name);
        let (part, existed) = match pkg.entry(&name) {
            Some(entry) => (
                parse_xml_part(&name, &entry.data).with_context(|| format!("parse rels: {name}"))?,
                true,
            ),
            None => (
                XmlPart {
                    name: name.clone(),
                    events: vec![
                        XmlEvent::Decl {
                            version: "1.0".to_string(),
                            encoding: Some("UTF-8".to_string()),
                            standalone: Some("yes".to_string()),
                        },
                        XmlEvent::start("Relationships", &[("xmlns", RELATIONSHIPS_NS)]),
                        XmlEvent::end("Relationships"),
                    ],
                },
                false,
            ),
        };
        let max_id = part
            .events
            .iter()
            .filter_map(|ev| ev.attrs().and_then(|a| find_attr(a, "Id")))
            .filter_map(|id| id.strip_prefix("rId").and_then(|n| n.parse::<u64>().ok()))
            .max()
            .unwrap_or(0);
        Ok(Self {
            name,
            part,
            existed,
            next_id: max_id + 1,
            by_target: HashMap::new(),
            modified: false,
        })
    }

    pub fn hyperlink(&mut self, target: &str) -> String {
        if let Some(id) = self.by_target.get(target) {
            return id.clone();
        }
        let id = format!("rId{}", self.next_id);
        self.next_id += 1;
        let rel = XmlEvent::Empty {
            name: "Relationship".to_string(),
            attrs: vec![
                ("Id".to_string(), id.clone()),
                ("Type".to_string(), HYPERLINK_REL_TYPE.to_string()),
                ("Target".to_string(), escape_attr(target)),
                ("TargetMode".to_string(), "External".to_string()),
            ],
        };
        let close = self
            .part
            .events
            .iter()
            .rposition(|e| e.is_end_of("Relationships"))
            .unwrap_or(self.part.events.len());
        self.part.events.insert(close, rel);
        self.by_target.insert(target.to_string(), id.clone());
        self.modified = true;
        id
    }

    /// Serialized rels part when relationships were added: `(name, bytes, existed_before)`.
    pub fn finish(self) -> anyhow::Result<Option<(String, Vec<u8>, bool)>> {
        if !self.modified {
            return Ok(None);
        }
        let bytes = write_xml_part(&self.part).with_context(|| format!("serialize rels: {}", self.name))?;
        Ok(Some((self.name, bytes, self.existed)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn events(xml: &str) -> Vec<XmlEvent> {
        parse_xml_part("p.xml", xml.as_bytes()).expect("parse").events
    }

    fn render(events: Vec<XmlEvent>) -> String {
        let part = XmlPart {
            name: "p.xml".to_string(),
            events,
        };
        String::from_utf8(write_xml_part(&part).expect("write")).expect("utf8")
    }

    #[test]
    fn docx_copies_get_fresh_ids() {
        let doc = events(r#"<w:body><wp:docPr id="4" name="Picture 1"/><w:bookmarkStart w:id="7" w:name="row"/><w:bookmarkEnd w:id="7"/></w:body>"#);
        let mut ren = IdRenumberer::for_part(&doc, DocFormat::Docx);

        let proto = events(r#"<w:tr w14:paraId="1A"><wp:docPr id="4" name="Picture 1"/><w:bookmarkStart w:id="7" w:name="row"/><w:bookmarkEnd w:id="7"/></w:tr>"#);
        let mut first = proto.clone();
        let mut second = proto;
        ren.renumber(&mut first, 0);
        ren.renumber(&mut second, 1);

        assert_eq!(
            render(first),
            r#"<w:tr><wp:docPr id="5" name="Picture 1"/><w:bookmarkStart w:id="8" w:name="row_1"/><w:bookmarkEnd w:id="8"/></w:tr>"#
        );
        assert_eq!(
            render(second),
            r#"<w:tr><wp:docPr id="6" name="Picture 1"/><w:bookmarkStart w:id="9" w:name="row_2"/><w:bookmarkEnd w:id="9"/></w:tr>"#
        );
    }

    #[test]
    fn odf_names_are_suffixed() {
        let mut block = events(r#"<table:table-row><draw:frame draw:name="Image1" xml:id="f1"/><text:bookmark text:name="bm"/><text:variable-get text:name="v"/></table:table-row>"#);
        let mut ren = IdRenumberer::for_part(&[], DocFormat::Odt);
        ren.renumber(&mut block, 2);
        let out = render(block);
        assert!(out.contains(r#"draw:name="Image1_3" xml:id="f1_3""#));
        assert!(out.contains(r#"<text:bookmark text:name="bm_3"/>"#));
        assert!(out.contains(r#"<text:variable-get text:name="v"/>"#));
    }

    #[test]
    fn rels_names() {
        assert_eq!(rels_part_name("word/document.xml"), "word/_rels/document.xml.rels");
        assert_eq!(rels_part_name("word/header1.xml"), "word/_rels/header1.xml.rels");
    }
}
