use std::collections::HashSet;

use indexmap::IndexMap;

use crate::schema::{slugify, DataType, FieldType};
use crate::template::placeholder::ParsedPlaceholder;

const NUMBER_SUFFIXES: &[&str] = &[
    "amount",
    "importe",
    "total",
    "price",
    "precio",
    "cost",
    "coste",
    "quantity",
    "cantidad",
    "qty",
    "count",
    "percent",
    "porcentaje",
];
const BOOLEAN_PREFIXES: &[&str] = &["is_", "has_", "es_", "tiene_"];
const LONG_TEXT_SUFFIXES: &[&str] = &[
    "description",
    "descripcion",
    "observaciones",
    "notes",
    "summary",
    "resumen",
];
const RICH_KEYS: &[&str] = &["content", "body", "cuerpo", "html"];
const DATE_LETTERS: &[char] = &['d', 'D', 'j', 'l', 'N', 'm', 'M', 'n', 'F', 'y', 'Y'];

pub fn detect_data_type(name: &str, params: &IndexMap<String, String>) -> DataType {
    if let Some(dt) = params.get("datatype").and_then(|v| DataType::parse(v)) {
        return dt;
    }

    let ope = params
        .get("ope")
        .or_else(|| params.get("operation"))
        .map(|s| s.to_ascii_lowercase())
        .unwrap_or_default();
    let strconv_off = params
        .get("strconv")
        .is_some_and(|v| v.eq_ignore_ascii_case("no"));
    if ope.contains("html") || params.contains_key("tbs:html") || params.contains_key("html") || strconv_off {
        return DataType::Html;
    }
    if ope.contains("date") {
        return DataType::Date;
    }
    if ope.contains("num") {
        return DataType::Number;
    }
    if ope.contains("bool") {
        return DataType::Boolean;
    }

    if let Some(frm) = params.get("frm").or_else(|| params.get("format")) {
        let frm = frm.trim();
        if !frm.is_empty() && frm != "true" {
            if frm.chars().all(|c| matches!(c, '0' | '#' | '.' | ',' | ' ')) {
                return DataType::Number;
            }
            if frm.contains(DATE_LETTERS) {
                return DataType::Date;
            }
        }
    }

    let last = last_segment(name);
    if last.ends_with("date")
        || last.ends_with("fecha")
        || last.starts_with("date_")
        || last.starts_with("fecha_")
    {
        return DataType::Date;
    }
    if NUMBER_SUFFIXES.iter().any(|s| last.ends_with(s)) {
        return DataType::Number;
    }
    if BOOLEAN_PREFIXES.iter().any(|p| last.starts_with(p)) {
        return DataType::Boolean;
    }
    DataType::Text
}

fn last_segment(name: &str) -> String {
    let tail = name.rsplit(['.', ']']).next().unwrap_or(name);
    tail.to_lowercase()
}

/// Column data type: like scalars, but text columns named like page content hold HTML.
pub fn item_data_type(key: &str, params: &IndexMap<String, String>) -> DataType {
    let dt = detect_data_type(key, params);
    if dt != DataType::Text || params.contains_key("datatype") {
        return dt;
    }
    let slug = slugify(key);
    if slug.split('_').any(|part| RICH_KEYS.contains(&part)) {
        DataType::Html
    } else {
        dt
    }
}

pub fn field_type_for(name: &str, params: &IndexMap<String, String>, data_type: DataType) -> FieldType {
    if let Some(t) = params.get("type") {
        match t.trim().to_ascii_lowercase().as_str() {
            "single" => return FieldType::Single,
            "textarea" => return FieldType::Textarea,
            "rich" | "html" => return FieldType::Rich,
            _ => {}
        }
    }
    if data_type == DataType::Html {
        return FieldType::Rich;
    }
    let last = last_segment(name);
    if params.contains_key("textarea") || LONG_TEXT_SUFFIXES.iter().any(|s| last.ends_with(s)) {
        return FieldType::Textarea;
    }
    FieldType::Single
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArrayNotation {
    /// `items[*].title`
    Indexed,
    /// `items.title`, only with a matching `[onshow;repeat=items]`
    Dotted,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArrayRef {
    pub base: String,
    pub key: String,
    pub notation: ArrayNotation,
}

impl ArrayRef {
    pub fn repeater_slug(&self) -> String {
        slugify(&self.base)
    }

    pub fn column_slug(&self) -> String {
        slugify(&self.key)
    }
}

/// `confirmed` holds repeater slugs announced by `onshow;repeat=` markers.
pub fn detect_array_placeholder(name: &str, confirmed: &HashSet<String>) -> Option<ArrayRef> {
    if let Some((base, key)) = name.split_once("[*].") {
        if !base.is_empty() && !key.is_empty() {
            return Some(ArrayRef {
                base: base.to_string(),
                key: key.to_string(),
                notation: ArrayNotation::Indexed,
            });
        }
    }
    let (base, key) = name.split_once('.')?;
    if base.is_empty() || key.is_empty() || !confirmed.contains(&slugify(base)) {
        return None;
    }
    Some(ArrayRef {
        base: base.to_string(),
        key: key.to_string(),
        notation: ArrayNotation::Dotted,
    })
}

/// `[onshow;...]` / `[onload;...]` are block controls, never data fields.
pub fn is_repeat_marker(p: &ParsedPlaceholder) -> bool {
    p.placeholder.eq_ignore_ascii_case("onshow") || p.placeholder.eq_ignore_ascii_case("onload")
}

pub fn collect_repeat_markers<'a>(parsed: impl IntoIterator<Item = &'a ParsedPlaceholder>) -> HashSet<String> {
    parsed
        .into_iter()
        .filter(|p| is_repeat_marker(p))
        .filter_map(|p| p.param("repeat"))
        .map(slugify)
        .filter(|s| !s.is_empty())
        .collect()
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PlaceholderRole {
    Marker,
    Scalar { slug: String },
    Column { repeater: String, column: String },
}

pub fn classify(p: &ParsedPlaceholder, confirmed: &HashSet<String>) -> PlaceholderRole {
    if is_repeat_marker(p) {
        return PlaceholderRole::Marker;
    }
    match detect_array_placeholder(&p.placeholder, confirmed) {
        Some(r) => PlaceholderRole::Column {
            repeater: r.repeater_slug(),
            column: r.column_slug(),
        },
        None => PlaceholderRole::Scalar {
            slug: slugify(&p.placeholder),
        },
    }
}

/// Groups array refs sharing a base, keyed by repeater slug in order of first appearance.
pub fn group_siblings(refs: &[ArrayRef]) -> IndexMap<String, Vec<usize>> {
    let mut groups: IndexMap<String, Vec<usize>> = IndexMap::new();
    for (idx, r) in refs.iter().enumerate() {
        let slug = r.repeater_slug();
        if slug.is_empty() {
            continue;
        }
        groups.entry(slug).or_default().push(idx);
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::placeholder::parse_placeholder;

    fn dt(raw: &str) -> DataType {
        let p = parse_placeholder(raw);
        detect_data_type(&p.placeholder, &p.parameters)
    }

    #[test]
    fn explicit_datatype_wins() {
        assert_eq!(dt("due_date;datatype=text"), DataType::Text);
        assert_eq!(dt("x;datatype=boolean;ope=tbs:html"), DataType::Boolean);
    }

    #[test]
    fn operation_hints() {
        assert_eq!(dt("body;ope=tbs:html"), DataType::Html);
        assert_eq!(dt("body;tbs:html"), DataType::Html);
        assert_eq!(dt("body;strconv=no"), DataType::Html);
        assert_eq!(dt("when;ope=tbs:date"), DataType::Date);
        assert_eq!(dt("n;ope=tbs:num"), DataType::Number);
        assert_eq!(dt("ok;ope=tbs:bool"), DataType::Boolean);
    }

    #[test]
    fn format_patterns() {
        assert_eq!(dt("x;frm=0.000,00"), DataType::Number);
        assert_eq!(dt("x;frm=#,##0.00"), DataType::Number);
        assert_eq!(dt("x;frm=d/m/Y"), DataType::Date);
    }

    #[test]
    fn name_heuristics() {
        assert_eq!(dt("invoice_date"), DataType::Date);
        assert_eq!(dt("fecha_alta"), DataType::Date);
        assert_eq!(dt("line_total"), DataType::Number);
        assert_eq!(dt("items[*].qty"), DataType::Number);
        assert_eq!(dt("is_paid"), DataType::Boolean);
        assert_eq!(dt("invoice_number"), DataType::Text);
        assert_eq!(dt("client_name"), DataType::Text);
    }

    #[test]
    fn indexed_always_array_dotted_needs_marker() {
        let none = HashSet::new();
        let r = detect_array_placeholder("items[*].title", &none).expect("indexed");
        assert_eq!((r.base.as_str(), r.key.as_str()), ("items", "title"));
        assert_eq!(r.notation, ArrayNotation::Indexed);
        assert!(detect_array_placeholder("items.title", &none).is_none());
        assert!(detect_array_placeholder("client_name", &none).is_none());

        let confirmed: HashSet<String> = ["items".to_string()].into_iter().collect();
        let r = detect_array_placeholder("items.title", &confirmed).expect("dotted");
        assert_eq!(r.notation, ArrayNotation::Dotted);
    }

    #[test]
    fn classify_roles() {
        let marker = parse_placeholder("onshow;repeat=Items");
        let confirmed = collect_repeat_markers([&marker]);
        assert!(confirmed.contains("items"));
        assert_eq!(classify(&marker, &confirmed), PlaceholderRole::Marker);
        assert_eq!(
            classify(&parse_placeholder("items.title"), &confirmed),
            PlaceholderRole::Column {
                repeater: "items".to_string(),
                column: "title".to_string()
            }
        );
        assert_eq!(
            classify(&parse_placeholder("items.title"), &HashSet::new()),
            PlaceholderRole::Scalar {
                slug: "items_title".to_string()
            }
        );
    }

    #[test]
    fn item_columns_named_like_content_are_html() {
        let empty = IndexMap::new();
        assert_eq!(item_data_type("content", &empty), DataType::Html);
        assert_eq!(item_data_type("section_body", &empty), DataType::Html);
        assert_eq!(item_data_type("title", &empty), DataType::Text);
    }

    #[test]
    fn field_types() {
        let p = parse_placeholder("notes;type=html");
        assert_eq!(field_type_for(&p.placeholder, &p.parameters, DataType::Text), FieldType::Rich);
        let p = parse_placeholder("project_description");
        assert_eq!(field_type_for(&p.placeholder, &p.parameters, DataType::Text), FieldType::Textarea);
        let p = parse_placeholder("body");
        assert_eq!(field_type_for(&p.placeholder, &p.parameters, DataType::Html), FieldType::Rich);
        let p = parse_placeholder("title;textarea");
        assert_eq!(field_type_for(&p.placeholder, &p.parameters, DataType::Text), FieldType::Textarea);
    }

    #[test]
    fn siblings_group_by_base() {
        let none = HashSet::new();
        let refs: Vec<ArrayRef> = ["items[*].title", "lines[*].qty", "items[*].qty"]
            .iter()
            .filter_map(|n| detect_array_placeholder(n, &none))
            .collect();
        let groups = group_siblings(&refs);
        assert_eq!(groups.get("items"), Some(&vec![0, 2]));
        assert_eq!(groups.get("lines"), Some(&vec![1]));
        assert_eq!(groups.keys().next().map(|s| s.as_str()), Some("items"));
    }
}
