use once_cell::sync::Lazy;
use regex::Regex;

use crate::package::archive::DocFormat;
use crate::package::heal::rewrite_texts;
use crate::package::xml::XmlPart;
use crate::template::placeholder::PLACEHOLDER_RE;

pub const RICH_ID_WIDTH: usize = 4;
const MARKER_OPEN: char = '\u{F8F0}';
const MARKER_CLOSE: char = '\u{F8F1}';
const SHIELDED_BRACKET: char = '\u{F8F2}';

/// Stands in for a remembered rich fragment between substitution and embedding. Private-use
/// code points never occur in user text.
pub fn rich_marker(idx: usize) -> String {
    format!("{MARKER_OPEN}{idx:0RICH_ID_WIDTH$}{MARKER_CLOSE}")
}

pub static MARKER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new("\u{F8F0}([0-9]+)\u{F8F1}").expect("marker regex"));

static ANY_MARKER_CHAR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new("[\u{F8F0}\u{F8F1}]").expect("marker char regex"));

static ARRAY_LITERAL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bArray\b").expect("array regex"));

/// Fragment index when `text` (ignoring surrounding whitespace) is exactly one marker.
pub fn whole_marker(text: &str) -> Option<usize> {
    let caps = MARKER_RE.captures(text.trim())?;
    let whole = caps.get(0)?;
    if whole.as_str().len() != text.trim().len() {
        return None;
    }
    caps[1].parse().ok()
}

pub fn contains_marker(text: &str) -> bool {
    text.contains(MARKER_OPEN)
}

/// Hides `[` in inserted values so later placeholder passes leave them alone.
/// `clean_residuals` puts the brackets back.
pub fn shield_brackets(text: &str) -> String {
    if text.contains('[') {
        text.replace('[', &SHIELDED_BRACKET.to_string())
    } else {
        text.to_string()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResidualReport {
    pub placeholders: usize,
    pub markers: usize,
    pub array_literals: usize,
}

impl ResidualReport {
    pub fn total(&self) -> usize {
        self.placeholders + self.markers + self.array_literals
    }

    pub fn add(&mut self, other: ResidualReport) {
        self.placeholders += other.placeholders;
        self.markers += other.markers;
        self.array_literals += other.array_literals;
    }
}

/// Strips unresolved placeholder tokens, leftover markers and (optionally) the word `Array` from
/// every text node, then restores brackets hidden by [`shield_brackets`]. Never fails.
pub fn clean_residuals(part: &mut XmlPart, format: DocFormat, scrub_array: bool) -> ResidualReport {
    let mut report = ResidualReport::default();
    rewrite_texts(&mut part.events, format, |text| {
        let mut t = text.to_string();
        let placeholders = PLACEHOLDER_RE.find_iter(&t).count();
        if placeholders > 0 {
            t = PLACEHOLDER_RE.replace_all(&t, "").into_owned();
            report.placeholders += placeholders;
        }
        if ANY_MARKER_CHAR_RE.is_match(&t) {
            report.markers += MARKER_RE.find_iter(&t).count().max(1);
            t = MARKER_RE.replace_all(&t, "").into_owned();
            t = ANY_MARKER_CHAR_RE.replace_all(&t, "").into_owned();
        }
        if scrub_array {
            let arrays = ARRAY_LITERAL_RE.find_iter(&t).count();
            if arrays > 0 {
                t = ARRAY_LITERAL_RE.replace_all(&t, "").into_owned();
                report.array_literals += arrays;
            }
        }
        if t.contains(SHIELDED_BRACKET) {
            t = t.replace(SHIELDED_BRACKET, "[");
        }
        Some(t)
    });
    report
}
