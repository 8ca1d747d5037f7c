use std::borrow::Cow;
use std::collections::HashSet;

use lol_html::{element, rewrite_str, RewriteStrSettings};
use once_cell::sync::Lazy;
use regex::Regex;

static COMMENT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<!--.*?-->").expect("comment regex"));
static INTER_TAG_WS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r">[ \t]*\n\s*<").expect("inter-tag regex"));
static EMPTY_PARAGRAPH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)<p>(?:\s|&nbsp;|\x{a0}|<br\s*/?>)*</p>").expect("empty paragraph regex")
});
static TAG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<(?:[A-Za-z][A-Za-z0-9]*|/[A-Za-z][A-Za-z0-9]*)(?:\s[^<>]*)?/?>").expect("tag regex"));

const DROPPED_WITH_CONTENT: &[&str] = &[
    "script", "iframe", "object", "embed", "style", "noscript", "template", "svg", "math", "form",
    "input", "button", "select", "textarea", "link", "meta", "base", "frame", "frameset", "applet",
    "canvas", "audio", "video", "source",
];
const ALLOWED_TAGS: &[&str] = &[
    "p", "div", "h1", "h2", "h3", "h4", "h5", "h6", "ul", "ol", "li", "table", "thead", "tbody",
    "tfoot", "tr", "th", "td", "strong", "em", "u", "s", "sub", "sup", "a", "span", "br",
    "blockquote",
];
const STYLE_PROPERTIES: &[&str] = &[
    "font-weight",
    "font-style",
    "text-decoration",
    "color",
    "background-color",
];
const SAFE_SCHEMES: &[&str] = &["http", "https", "mailto", "tel"];

static DROPPED: Lazy<HashSet<&'static str>> = Lazy::new(|| DROPPED_WITH_CONTENT.iter().copied().collect());
static ALLOWED: Lazy<HashSet<&'static str>> = Lazy::new(|| ALLOWED_TAGS.iter().copied().collect());

/// `true` when the value carries HTML tags rather than plain text.
pub fn is_rich_fragment(value: &str) -> bool {
    TAG_RE.is_match(value)
}

/// Line endings and escaped `\n` sequences become LF.
pub fn normalize_newlines(value: &str) -> String {
    value
        .replace("\\r\\n", "\n")
        .replace("\\n", "\n")
        .replace("\\r", "\n")
        .replace("\r\n", "\n")
        .replace('\r', "\n")
}

/// Reduces user HTML to the small tag/attribute set the document renderers understand.
/// `sanitize(sanitize(x)) == sanitize(x)`.
pub fn sanitize(html: &str) -> String {
    let text = normalize_newlines(html);
    if text.trim().is_empty() {
        return String::new();
    }
    if !is_rich_fragment(&text) {
        return plain_to_html(text.trim());
    }

    let text = COMMENT_RE.replace_all(&text, "");
    let text = INTER_TAG_WS_RE.replace_all(&text, "><");
    let text = escape_stray_lt(&text);

    let handlers = vec![element!("*", |el| {
        let tag = el.tag_name().to_ascii_lowercase();
        if DROPPED.contains(tag.as_str()) {
            el.remove();
            return Ok(());
        }
        let renamed = match tag.as_str() {
            "b" => Some("strong"),
            "i" => Some("em"),
            "strike" | "del" => Some("s"),
            "ins" => Some("u"),
            _ => None,
        };
        if let Some(name) = renamed {
            el.set_tag_name(name)?;
        } else if !ALLOWED.contains(tag.as_str()) {
            el.remove_and_keep_content();
            return Ok(());
        }
        let tag = renamed.unwrap_or(tag.as_str()).to_string();

        let attrs: Vec<(String, String)> = el
            .attributes()
            .iter()
            .map(|a| (a.name().to_ascii_lowercase(), a.value()))
            .collect();
        for (name, value) in attrs {
            match (tag.as_str(), name.as_str()) {
                ("a", "href") if is_safe_href(&value) => {}
                ("span", "style") => {
                    let filtered = filter_style(&value);
                    if filtered.is_empty() {
                        el.remove_attribute(&name);
                    } else if filtered != value {
                        el.set_attribute(&name, &filtered)?;
                    }
                }
                ("td" | "th", "colspan" | "rowspan")
                    if !value.is_empty() && value.chars().all(|c| c.is_ascii_digit()) => {}
                _ => el.remove_attribute(&name),
            }
        }
        Ok(())
    })];

    let rewritten = rewrite_str(
        text.as_ref(),
        RewriteStrSettings {
            element_content_handlers: handlers,
            ..RewriteStrSettings::new()
        },
    )
    .unwrap_or_else(|_| plain_to_html(&TAG_RE.replace_all(&text, "")));

    let cleaned = INTER_TAG_WS_RE.replace_all(&rewritten, "><");
    let cleaned = EMPTY_PARAGRAPH_RE.replace_all(&cleaned, "");
    cleaned.trim().to_string()
}

fn plain_to_html(text: &str) -> String {
    text.replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('\n', "<br>")
}

fn is_safe_href(href: &str) -> bool {
    let compact: String = href
        .chars()
        .filter(|c| !c.is_whitespace() && !c.is_control())
        .collect::<String>()
        .to_ascii_lowercase();
    if compact.is_empty() {
        return false;
    }
    let scheme_end = compact.find(':');
    let path_start = compact.find(['/', '?', '#']);
    match (scheme_end, path_start) {
        (Some(colon), Some(slash)) if slash < colon => true,
        (Some(colon), _) => SAFE_SCHEMES.contains(&&compact[..colon]),
        (None, _) => true,
    }
}

fn filter_style(style: &str) -> String {
    style
        .split(';')
        .filter_map(|decl| {
            let (prop, value) = decl.split_once(':')?;
            let prop = prop.trim().to_ascii_lowercase();
            let value = value.trim();
            let lower = value.to_ascii_lowercase();
            if !STYLE_PROPERTIES.contains(&prop.as_str())
                || value.is_empty()
                || lower.contains("url(")
                || lower.contains("expression")
                || value.contains(['<', '>', '"'])
            {
                return None;
            }
            Some(format!("{prop}: {value}"))
        })
        .collect::<Vec<_>>()
        .join("; ")
}

/// `<` that cannot start a tag is escaped, so the rewriter treats it as text.
fn escape_stray_lt(input: &str) -> Cow<'_, str> {
    let bytes = input.as_bytes();
    let stray = |i: usize| {
        let next = bytes.get(i + 1).copied().unwrap_or(b' ');
        !(next.is_ascii_alphabetic() || matches!(next, b'/' | b'!' | b'?'))
    };
    if !(0..bytes.len()).any(|i| bytes[i] == b'<' && stray(i)) {
        return Cow::Borrowed(input);
    }
    let mut out = String::with_capacity(input.len() + 8);
    let mut last = 0usize;
    for i in 0..bytes.len() {
        if bytes[i] == b'<' && stray(i) {
            out.push_str(&input[last..i]);
            out.push_str("&lt;");
            last = i + 1;
        }
    }
    out.push_str(&input[last..]);
    Cow::Owned(out)
}
