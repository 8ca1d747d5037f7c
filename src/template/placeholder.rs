use std::ops::Range;

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;

/// `[name]`, `[name;k=v;flag]`, `[base[*].key]`. Names start with a letter or `_`.
pub static PLACEHOLDER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\[((?:[\p{L}_][\p{L}\p{N}_.\-]*)(?:\[\*\](?:\.[\p{L}\p{N}_\-]+)+)?(?:;[^\[\]\r\n]*)?)\]",
    )
    .expect("placeholder regex")
});

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedPlaceholder {
    pub placeholder: String,
    pub parameters: IndexMap<String, String>,
}

impl ParsedPlaceholder {
    pub fn param(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).map(|s| s.as_str())
    }

    pub fn has_flag(&self, key: &str) -> bool {
        self.parameters.contains_key(key)
    }
}

#[derive(Clone, Debug)]
pub struct PlaceholderMatch {
    /// Byte range of the whole bracketed token in the scanned text.
    pub range: Range<usize>,
    pub parsed: ParsedPlaceholder,
}

/// Parses the text between the brackets. Never fails; malformed parameters become flags.
pub fn parse_placeholder(raw: &str) -> ParsedPlaceholder {
    let mut pieces = raw.split(';');
    let placeholder = pieces.next().unwrap_or("").trim().to_string();

    let mut parameters: IndexMap<String, String> = IndexMap::new();
    for token in pieces {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        match token.split_once('=') {
            Some((k, v)) if !k.trim().is_empty() => {
                parameters.insert(k.trim().to_lowercase(), unquote(v.trim()).to_string());
            }
            _ => {
                parameters.insert(token.to_lowercase(), "true".to_string());
            }
        }
    }

    ParsedPlaceholder {
        placeholder,
        parameters,
    }
}

fn unquote(v: &str) -> &str {
    for q in ['"', '\''] {
        if v.len() >= 2 && v.starts_with(q) && v.ends_with(q) {
            return &v[1..v.len() - 1];
        }
    }
    v
}

pub fn find_placeholders(text: &str) -> Vec<PlaceholderMatch> {
    PLACEHOLDER_RE
        .captures_iter(text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let inner = caps.get(1)?;
            Some(PlaceholderMatch {
                range: whole.range(),
                parsed: parse_placeholder(inner.as_str()),
            })
        })
        .collect()
}
