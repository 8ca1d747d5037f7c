use anyhow::{anyhow, Context};
use quick_xml::events::{BytesDecl, BytesStart, Event};
use quick_xml::Reader;

#[derive(Clone, Debug, PartialEq)]
pub enum XmlEvent {
    Decl {
        version: String,
        encoding: Option<String>,
        standalone: Option<String>,
    },
    Start {
        name: String,
        attrs: Vec<(String, String)>,
    },
    End {
        name: String,
    },
    Empty {
        name: String,
        attrs: Vec<(String, String)>,
    },
    Text {
        text: String,
    },
    CData {
        text: String,
    },
    Comment {
        text: String,
    },
    PI {
        content: String,
    },
    DocType {
        text: String,
    },
}

impl XmlEvent {
    pub fn start(name: &str, attrs: &[(&str, &str)]) -> Self {
        XmlEvent::Start {
            name: name.to_string(),
            attrs: owned_attrs(attrs),
        }
    }

    pub fn empty(name: &str, attrs: &[(&str, &str)]) -> Self {
        XmlEvent::Empty {
            name: name.to_string(),
            attrs: owned_attrs(attrs),
        }
    }

    pub fn end(name: &str) -> Self {
        XmlEvent::End {
            name: name.to_string(),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        XmlEvent::Text { text: text.into() }
    }

    /// Element name for `Start`, `Empty` and `End` events.
    pub fn name(&self) -> Option<&str> {
        match self {
            XmlEvent::Start { name, .. } | XmlEvent::Empty { name, .. } | XmlEvent::End { name } => {
                Some(name.as_str())
            }
            _ => None,
        }
    }

    pub fn is_start_of(&self, tag: &str) -> bool {
        matches!(self, XmlEvent::Start { name, .. } if name == tag)
    }

    pub fn is_end_of(&self, tag: &str) -> bool {
        matches!(self, XmlEvent::End { name } if name == tag)
    }

    pub fn attrs(&self) -> Option<&[(String, String)]> {
        match self {
            XmlEvent::Start { attrs, .. } | XmlEvent::Empty { attrs, .. } => Some(attrs.as_slice()),
            _ => None,
        }
    }

    pub fn attrs_mut(&mut self) -> Option<&mut Vec<(String, String)>> {
        match self {
            XmlEvent::Start { attrs, .. } | XmlEvent::Empty { attrs, .. } => Some(attrs),
            _ => None,
        }
    }
}

fn owned_attrs(attrs: &[(&str, &str)]) -> Vec<(String, String)> {
    attrs
        .iter()
        .map(|(k, v)| (k.to_string(), escape_attr(v)))
        .collect()
}

#[derive(Clone, Debug)]
pub struct XmlPart {
    pub name: String,
    pub events: Vec<XmlEvent>,
}

pub fn parse_xml_part(name: &str, xml_bytes: &[u8]) -> anyhow::Result<XmlPart> {
    let mut reader = Reader::from_reader(xml_bytes);
    reader.config_mut().trim_text(false);

    let mut events: Vec<XmlEvent> = Vec::new();
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let ev = reader.read_event_into(&mut buf).context("read xml event")?;
        match ev {
            Event::Eof => break,
            Event::Decl(d) => {
                let version = bytes_to_string(d.version().context("decl version")?);
                let encoding = d
                    .encoding()
                    .map(|r| r.map(bytes_to_string))
                    .transpose()
                    .unwrap_or(None);
                let standalone = d
                    .standalone()
                    .map(|r| r.map(bytes_to_string))
                    .transpose()
                    .unwrap_or(None);
                events.push(XmlEvent::Decl {
                    version,
                    encoding,
                    standalone,
                });
            }
            Event::Start(s) => {
                events.push(XmlEvent::Start {
                    name: bytes_to_string(s.name().as_ref()),
                    attrs: collect_attrs(&s)?,
                });
            }
            Event::End(e) => {
                events.push(XmlEvent::End {
                    name: bytes_to_string(e.name().as_ref()),
                });
            }
            Event::Empty(s) => {
                events.push(XmlEvent::Empty {
                    name: bytes_to_string(s.name().as_ref()),
                    attrs: collect_attrs(&s)?,
                });
            }
            Event::Text(t) => {
                let txt = t.unescape().context("unescape text")?.into_owned();
                events.push(XmlEvent::Text { text: txt });
            }
            Event::CData(t) => {
                let txt = bytes_to_string(t.into_inner());
                events.push(XmlEvent::CData { text: txt });
            }
            Event::Comment(t) => {
                let txt = bytes_to_string(t.into_inner());
                events.push(XmlEvent::Comment { text: txt });
            }
            Event::PI(t) => {
                let target = bytes_to_string(t.target());
                let content = bytes_to_string(t.content());
                events.push(XmlEvent::PI {
                    content: format!("{target}{content}"),
                });
            }
            Event::DocType(t) => {
                let txt = bytes_to_string(t.into_inner());
                events.push(XmlEvent::DocType { text: txt });
            }
        }
    }

    Ok(XmlPart {
        name: name.to_string(),
        events,
    })
}

fn collect_attrs(s: &BytesStart<'_>) -> anyhow::Result<Vec<(String, String)>> {
    let mut attrs: Vec<(String, String)> = Vec::new();
    for a in s.attributes() {
        let a = a.context("attr")?;
        let key = bytes_to_string(a.key.as_ref());
        // Stored escaped; written back verbatim.
        let val = bytes_to_string(a.value.as_ref());
        attrs.push((key, val));
    }
    Ok(attrs)
}

fn bytes_to_string(bytes: impl AsRef<[u8]>) -> String {
    String::from_utf8_lossy(bytes.as_ref()).into_owned()
}

/// Escapes a value for storage in an attribute slot (attribute values are kept raw).
pub fn escape_attr(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(ch),
        }
    }
    out
}

pub fn write_xml_part(part: &XmlPart) -> anyhow::Result<Vec<u8>> {
    let mut out: Vec<u8> = Vec::new();

    fn escape_text_into(out: &mut Vec<u8>, text: &str) {
        for ch in text.chars() {
            match ch {
                '&' => out.extend_from_slice(b"&amp;"),
                '<' => out.extend_from_slice(b"&lt;"),
                '>' => out.extend_from_slice(b"&gt;"),
                _ => {
                    let mut buf = [0u8; 4];
                    out.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
                }
            }
        }
    }

    fn write_start_like(out: &mut Vec<u8>, name: &str, attrs: &[(String, String)], empty: bool) {
        out.extend_from_slice(b"<");
        out.extend_from_slice(name.as_bytes());
        for (k, v) in attrs {
            out.extend_from_slice(b" ");
            out.extend_from_slice(k.as_bytes());
            out.extend_from_slice(b"=\"");
            out.extend_from_slice(v.as_bytes());
            out.extend_from_slice(b"\"");
        }
        if empty {
            out.extend_from_slice(b"/>");
        } else {
            out.extend_from_slice(b">");
        }
    }

    for ev in &part.events {
        match ev {
            XmlEvent::Decl {
                version,
                encoding,
                standalone,
            } => {
                let d =
                    BytesDecl::new(version.as_str(), encoding.as_deref(), standalone.as_deref());
                let mut writer = quick_xml::Writer::new(Vec::new());
                writer.write_event(Event::Decl(d)).context("write decl")?;
                out.extend_from_slice(&writer.into_inner());
            }
            XmlEvent::Start { name, attrs } => {
                write_start_like(&mut out, name, attrs, false);
            }
            XmlEvent::End { name } => {
                out.extend_from_slice(b"</");
                out.extend_from_slice(name.as_bytes());
                out.extend_from_slice(b">");
            }
            XmlEvent::Empty { name, attrs } => {
                write_start_like(&mut out, name, attrs, true);
            }
            XmlEvent::Text { text } => {
                escape_text_into(&mut out, text);
            }
            XmlEvent::CData { text } => {
                out.extend_from_slice(b"<![CDATA[");
                out.extend_from_slice(text.as_bytes());
                out.extend_from_slice(b"]]>");
            }
            XmlEvent::Comment { text } => {
                out.extend_from_slice(b"<!--");
                out.extend_from_slice(text.as_bytes());
                out.extend_from_slice(b"-->");
            }
            XmlEvent::PI { content } => {
                out.extend_from_slice(b"<?");
                out.extend_from_slice(content.as_bytes());
                out.extend_from_slice(b"?>");
            }
            XmlEvent::DocType { text } => {
                out.extend_from_slice(b"<!DOCTYPE");
                out.extend_from_slice(text.as_bytes());
                out.extend_from_slice(b">");
            }
        }
    }

    Ok(out)
}

pub fn find_attr<'a>(attrs: &'a [(String, String)], key: &str) -> Option<&'a str> {
    attrs
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

/// Sets a raw attribute value on a `Start`/`Empty` event, appending it when absent.
pub fn set_attr(ev: &mut XmlEvent, key: &str, raw_value: &str) {
    if let Some(attrs) = ev.attrs_mut() {
        for (k, v) in attrs.iter_mut() {
            if k == key {
                *v = raw_value.to_string();
                return;
            }
        }
        attrs.push((key.to_string(), raw_value.to_string()));
    }
}

/// Index of the `End` event closing the element started at `start` (or `start` itself for
/// `Empty` events).
pub fn matching_end(events: &[XmlEvent], start: usize) -> anyhow::Result<usize> {
    match events.get(start) {
        Some(XmlEvent::Empty { .. }) => return Ok(start),
        Some(XmlEvent::Start { .. }) => {}
        _ => return Err(anyhow!("no element starts at event {start}")),
    }
    let mut depth = 0usize;
    for (idx, ev) in events.iter().enumerate().skip(start) {
        match ev {
            XmlEvent::Start { .. } => depth += 1,
            XmlEvent::End { .. } => {
                depth -= 1;
                if depth == 0 {
                    return Ok(idx);
                }
            }
            _ => {}
        }
    }
    Err(anyhow!("unterminated element at event {start}"))
}

/// Start index of the innermost element enclosing `idx` whose name satisfies `pred`.
pub fn enclosing_start(
    events: &[XmlEvent],
    idx: usize,
    pred: impl Fn(&str) -> bool,
) -> Option<usize> {
    let mut depth = 0usize;
    for i in (0..idx.min(events.len())).rev() {
        match &events[i] {
            XmlEvent::End { .. } => depth += 1,
            XmlEvent::Start { name, .. } => {
                if depth == 0 {
                    if pred(name) {
                        return Some(i);
                    }
                } else {
                    depth -= 1;
                }
            }
            _ => {}
        }
    }
    None
}

/// Start indices of the direct child elements of the element spanning `start..=end`.
pub fn child_starts(events: &[XmlEvent], start: usize, end: usize) -> Vec<usize> {
    let mut depth = 0usize;
    let mut children = Vec::new();
    for idx in start + 1..end.min(events.len()) {
        match &events[idx] {
            XmlEvent::Start { .. } => {
                if depth == 0 {
                    children.push(idx);
                }
                depth += 1;
            }
            XmlEvent::End { .. } => depth = depth.saturating_sub(1),
            XmlEvent::Empty { .. } if depth == 0 => children.push(idx),
            _ => {}
        }
    }
    children
}

/// Name of the element directly containing the event at `idx`.
pub fn parent_name(events: &[XmlEvent], idx: usize) -> Option<&str> {
    let start = enclosing_start(events, idx, |_| true)?;
    events[start].name()
}
