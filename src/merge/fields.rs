use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};

use crate::merge::residual::rich_marker;
use crate::schema::{slugify, DataType, FieldDef, FieldType, RepeaterDef, Schema};
use crate::store::FieldValueSource;
use crate::values::normalize::{
    apply_case, canonical_number, format_number, normalize_boolean, normalize_date, parse_number,
    DEFAULT_DATE_FORMAT,
};
use crate::values::rich::sanitize;

pub const MAX_REPEATER_ITEMS: usize = 50;

static FIELD_BLOCK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?s)<!--\s*docfill:field\s+slug\s*=\s*"([^"]*)"\s*-->(.*?)<!--\s*/docfill:field\s*-->"#)
        .expect("field block regex")
});

/// Field values embedded in a document body as
/// `<!-- docfill:field slug="x" -->value<!-- /docfill:field -->`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StructuredContent {
    pub fields: IndexMap<String, String>,
}

impl StructuredContent {
    pub fn parse(body: &str) -> Self {
        let mut fields = IndexMap::new();
        for caps in FIELD_BLOCK_RE.captures_iter(body) {
            let slug = slugify(&caps[1]);
            if slug.is_empty() {
                continue;
            }
            fields
                .entry(slug)
                .or_insert_with(|| caps[2].trim().to_string());
        }
        Self { fields }
    }
}

pub type RowMap = IndexMap<String, FieldValue>;

#[derive(Clone, Debug, PartialEq)]
pub enum FieldValue {
    Empty,
    Text(String),
    Number(f64),
    Bool(bool),
    /// Already formatted for output.
    Date(String),
    /// Index into the context's remembered rich fragments.
    Html(usize),
    Rows(Vec<RowMap>),
}

impl FieldValue {
    /// Plain text for substitution; `None` for rich fragments and row lists.
    pub fn render_text(&self, def: Option<&FieldDef>) -> Option<String> {
        match self {
            FieldValue::Empty => Some(String::new()),
            FieldValue::Text(s) | FieldValue::Date(s) => Some(s.clone()),
            FieldValue::Number(v) => Some(match def.and_then(|d| d.number_format()) {
                Some(frm) => format_number(*v, frm),
                None => canonical_number(*v),
            }),
            FieldValue::Bool(b) => Some(if *b { "1" } else { "0" }.to_string()),
            FieldValue::Html(_) | FieldValue::Rows(_) => None,
        }
    }

    /// Text written in place of a placeholder: rich fragments become markers, rows vanish.
    pub fn substitution(&self, def: Option<&FieldDef>) -> String {
        match self {
            FieldValue::Html(idx) => rich_marker(*idx),
            other => other.render_text(def).unwrap_or_default(),
        }
    }

    fn to_json(&self, ctx: &MergeContext) -> Value {
        match self {
            FieldValue::Empty => Value::Null,
            FieldValue::Text(s) | FieldValue::Date(s) => json!(s),
            FieldValue::Number(v) => json!(v),
            FieldValue::Bool(b) => json!(b),
            FieldValue::Html(idx) => json!({ "html": ctx.rich_fragment(*idx).unwrap_or_default() }),
            FieldValue::Rows(rows) => rows_to_json(rows, ctx),
        }
    }
}

fn rows_to_json(rows: &[RowMap], ctx: &MergeContext) -> Value {
    Value::Array(
        rows.iter()
            .map(|row| {
                Value::Object(
                    row.iter()
                        .map(|(k, v)| (k.clone(), v.to_json(ctx)))
                        .collect(),
                )
            })
            .collect(),
    )
}

/// Values of one generation request, normalized per the schema.
#[derive(Clone, Debug, Default)]
pub struct MergeContext {
    scalars: IndexMap<String, FieldValue>,
    repeaters: IndexMap<String, Vec<RowMap>>,
    rich: Vec<String>,
}

impl MergeContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scalar(&self, slug: &str) -> Option<&FieldValue> {
        if slug.is_empty() {
            return None;
        }
        self.scalars.get(slug)
    }

    pub fn set_scalar(&mut self, slug: &str, value: FieldValue) {
        self.scalars.insert(slug.to_string(), value);
    }

    pub fn rows(&self, slug: &str) -> &[RowMap] {
        self.repeaters.get(slug).map(|r| r.as_slice()).unwrap_or(&[])
    }

    pub fn set_rows(&mut self, slug: &str, rows: Vec<RowMap>) {
        self.repeaters.insert(slug.to_string(), rows);
    }

    pub fn remember_rich(&mut self, html: String) -> usize {
        self.rich.push(html);
        self.rich.len() - 1
    }

    pub fn rich_fragment(&self, idx: usize) -> Option<&str> {
        self.rich.get(idx).map(|s| s.as_str())
    }

    pub fn to_json(&self) -> Value {
        let scalars: serde_json::Map<String, Value> = self
            .scalars
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json(self)))
            .collect();
        let repeaters: serde_json::Map<String, Value> = self
            .repeaters
            .iter()
            .map(|(k, rows)| (k.clone(), rows_to_json(rows, self)))
            .collect();
        json!({ "fields": scalars, "repeaters": repeaters })
    }
}

#[derive(Clone, Debug)]
pub struct MergeFieldBuilder {
    pub max_items: usize,
    pub default_date_format: String,
}

impl Default for MergeFieldBuilder {
    fn default() -> Self {
        Self {
            max_items: MAX_REPEATER_ITEMS,
            default_date_format: DEFAULT_DATE_FORMAT.to_string(),
        }
    }
}

impl MergeFieldBuilder {
    pub fn build(&self, schema: &Schema, source: &dyn FieldValueSource, doc_id: &str) -> MergeContext {
        let mut ctx = MergeContext::new();
        for def in &schema.fields {
            if def.slug.is_empty() {
                continue;
            }
            let raw = source.get_scalar(doc_id, &def.slug);
            let value = if def.field_type == FieldType::Array {
                FieldValue::Rows(self.rows_from_json(raw.as_deref(), None, &mut ctx))
            } else {
                self.scalar_value(def, raw.as_deref(), &mut ctx)
            };
            ctx.scalars.insert(def.slug.clone(), value);
        }
        for rep in &schema.repeaters {
            if rep.slug.is_empty() {
                continue;
            }
            let raw = source.get_repeater(doc_id, &rep.slug);
            let rows = self.rows_from_json(raw.as_deref(), Some(rep), &mut ctx);
            ctx.repeaters.insert(rep.slug.clone(), rows);
        }
        ctx
    }

    pub fn scalar_value(&self, def: &FieldDef, raw: Option<&str>, ctx: &mut MergeContext) -> FieldValue {
        let Some(raw) = raw else {
            return FieldValue::Empty;
        };
        if def.is_rich() {
            let clean = sanitize(raw);
            if clean.is_empty() {
                return FieldValue::Empty;
            }
            return FieldValue::Html(ctx.remember_rich(clean));
        }
        let cased = |s: String| match def.case() {
            Some(mode) => apply_case(&s, mode),
            None => s,
        };
        match def.data_type {
            DataType::Number => parse_number(raw).map_or(FieldValue::Empty, FieldValue::Number),
            DataType::Boolean => FieldValue::Bool(normalize_boolean(raw) == "1"),
            DataType::Date => {
                if raw.trim().is_empty() {
                    return FieldValue::Empty;
                }
                let fmt = def.date_format().unwrap_or(&self.default_date_format);
                FieldValue::Date(cased(normalize_date(raw, fmt)))
            }
            DataType::Text | DataType::Html => {
                let text = cased(raw.replace("\r\n", "\n").replace('\r', "\n"));
                if text.contains('\n') {
                    // Multi-line text is embedded like a rich fragment so breaks survive.
                    return FieldValue::Html(ctx.remember_rich(sanitize(&text)));
                }
                FieldValue::Text(text)
            }
        }
    }

    /// Invalid JSON or a non-array yields no rows; non-object elements are dropped and the list
    /// is capped at `max_items`.
    fn rows_from_json(&self, raw: Option<&str>, def: Option<&RepeaterDef>, ctx: &mut MergeContext) -> Vec<RowMap> {
        let Some(Value::Array(items)) = raw.and_then(|r| serde_json::from_str::<Value>(r).ok()) else {
            return Vec::new();
        };
        let mut rows = Vec::new();
        for item in items.into_iter().filter(|v| v.is_object()).take(self.max_items) {
            let Value::Object(obj) = item else {
                continue;
            };
            let mut row = RowMap::new();
            for (key, value) in obj {
                let slug = slugify(&key);
                if slug.is_empty() {
                    continue;
                }
                let raw = match value {
                    Value::Null | Value::Array(_) | Value::Object(_) => None,
                    Value::String(s) => Some(s),
                    Value::Bool(b) => Some(b.to_string()),
                    Value::Number(n) => Some(n.to_string()),
                };
                let cell = match (def.and_then(|d| d.field(&slug)), raw) {
                    (_, None) => FieldValue::Empty,
                    (Some(col), Some(raw)) => self.scalar_value(col, Some(&raw), ctx),
                    (None, Some(raw)) => FieldValue::Text(raw),
                };
                row.insert(slug, cell);
            }
            rows.push(row);
        }
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::RawValues;

    fn schema() -> Schema {
        let mut s = Schema::empty();
        s.fields.push(FieldDef::new("client_name", FieldType::Single, DataType::Text));
        let mut total = FieldDef::new("total", FieldType::Single, DataType::Number);
        total.parameters.insert("frm".to_string(), "0.000,00".to_string());
        s.fields.push(total);
        s.fields.push(FieldDef::new("is_paid", FieldType::Single, DataType::Boolean));
        let mut due = FieldDef::new("due_date", FieldType::Single, DataType::Date);
        due.parameters.insert("case".to_string(), "upper".to_string());
        due.parameters.insert("format".to_string(), "j M Y".to_string());
        s.fields.push(due);
        s.fields.push(FieldDef::new("intro", FieldType::Rich, DataType::Html));
        s.fields.push(FieldDef::new("notes", FieldType::Textarea, DataType::Text));
        s.repeaters.push(RepeaterDef {
            name: "Items".to_string(),
            slug: "items".to_string(),
            fields: vec![
                FieldDef::new("title", FieldType::Single, DataType::Text),
                FieldDef::new("qty", FieldType::Single, DataType::Number),
                FieldDef::new("content", FieldType::Rich, DataType::Html),
            ],
        });
        s
    }

    #[test]
    fn scalars_are_normalized_per_type() {
        let values = RawValues::new()
            .with_meta("client_name", "ACME")
            .with_meta("total", "1234,5 €")
            .with_meta("is_paid", "Sí")
            .with_meta("due_date", "2024-03-05")
            .with_meta("intro", "<p><b>Hi</b><script>x</script></p>")
            .with_meta("notes", "a\nb");
        let s = schema();
        let ctx = MergeFieldBuilder::default().build(&s, &values, "1");

        assert_eq!(ctx.scalar("client_name"), Some(&FieldValue::Text("ACME".to_string())));
        assert_eq!(
            ctx.scalar("total").and_then(|v| v.render_text(s.field("total"))),
            Some("1.234,50".to_string())
        );
        assert_eq!(ctx.scalar("is_paid"), Some(&FieldValue::Bool(true)));
        assert_eq!(ctx.scalar("due_date"), Some(&FieldValue::Date("5 MAR 2024".to_string())));
        let Some(FieldValue::Html(idx)) = ctx.scalar("intro") else {
            panic!("intro should be rich");
        };
        assert_eq!(ctx.rich_fragment(*idx), Some("<p><strong>Hi</strong></p>"));
        let Some(FieldValue::Html(idx)) = ctx.scalar("notes") else {
            panic!("multi-line notes are embedded");
        };
        assert_eq!(ctx.rich_fragment(*idx), Some("a<br>b"));
    }

    #[test]
    fn missing_and_invalid_values_degrade_to_empty() {
        let values = RawValues::new().with_meta("total", "n/a");
        let ctx = MergeFieldBuilder::default().build(&schema(), &values, "1");
        assert_eq!(ctx.scalar("total"), Some(&FieldValue::Empty));
        assert_eq!(ctx.scalar("client_name"), Some(&FieldValue::Empty));
        assert_eq!(ctx.scalar(""), None);
        assert!(ctx.rows("items").is_empty());
        assert!(ctx.rows("unknown").is_empty());
    }

    #[test]
    fn repeater_rows_are_filtered_and_capped() {
        let mut items: Vec<Value> = vec![json!("not an object"), json!(42)];
        for i in 0..60 {
            items.push(json!({ "title": format!("T{i}"), "qty": "2", "extra": true, "nested": [1] }));
        }
        let values = RawValues::new().with_meta("items", Value::Array(items).to_string());
        let ctx = MergeFieldBuilder::default().build(&schema(), &values, "1");
        let rows = ctx.rows("items");
        assert_eq!(rows.len(), MAX_REPEATER_ITEMS);
        assert_eq!(rows[0].get("title"), Some(&FieldValue::Text("T0".to_string())));
        assert_eq!(rows[0].get("qty"), Some(&FieldValue::Number(2.0)));
        assert_eq!(rows[0].get("extra"), Some(&FieldValue::Text("true".to_string())));
        assert_eq!(rows[0].get("nested"), Some(&FieldValue::Empty));
        assert_eq!(rows[49].get("title"), Some(&FieldValue::Text("T49".to_string())));
    }

    #[test]
    fn configurable_cap_and_bad_json() {
        let builder = MergeFieldBuilder {
            max_items: 2,
            ..MergeFieldBuilder::default()
        };
        let values = RawValues::new().with_meta("items", r#"[{"title":"a"},{"title":"b"},{"title":"c"}]"#);
        assert_eq!(builder.build(&schema(), &values, "1").rows("items").len(), 2);

        let bad = RawValues::new().with_meta("items", "{not json");
        assert!(builder.build(&schema(), &bad, "1").rows("items").is_empty());
        let obj = RawValues::new().with_meta("items", r#"{"title":"a"}"#);
        assert!(builder.build(&schema(), &obj, "1").rows("items").is_empty());
    }

    #[test]
    fn rich_columns_are_remembered() {
        let values = RawValues::new().with_meta("items", r#"[{"content":"<p>x</p>"}]"#);
        let ctx = MergeFieldBuilder::default().build(&schema(), &values, "1");
        let Some(FieldValue::Html(idx)) = ctx.rows("items")[0].get("content") else {
            panic!("content should be rich");
        };
        assert_eq!(ctx.rich_fragment(*idx), Some("<p>x</p>"));
        let dump = ctx.to_json();
        assert_eq!(dump["repeaters"]["items"][0]["content"]["html"], "<p>x</p>");
    }

    #[test]
    fn array_typed_scalar_never_stringifies() {
        let mut s = Schema::empty();
        s.fields.push(FieldDef::new("lines", FieldType::Array, DataType::Text));
        let values = RawValues::new().with_meta("lines", r#"[{"a":"1"}]"#);
        let ctx = MergeFieldBuilder::default().build(&s, &values, "1");
        let v = ctx.scalar("lines").expect("value");
        assert!(matches!(v, FieldValue::Rows(rows) if rows.len() == 1));
        assert_eq!(v.render_text(None), None);
    }

    #[test]
    fn structured_blocks_parse() {
        let body = r#"x <!-- docfill:field slug="Intro Text" -->
<p>Hello</p>
<!-- /docfill:field --> y <!-- docfill:field slug="n" -->3<!-- /docfill:field -->"#;
        let sc = StructuredContent::parse(body);
        assert_eq!(sc.fields.get("intro_text").map(String::as_str), Some("<p>Hello</p>"));
        assert_eq!(sc.fields.get("n").map(String::as_str), Some("3"));
    }
}
