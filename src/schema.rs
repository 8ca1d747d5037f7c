use anyhow::Context;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::package::archive::DocFormat;

pub const SCHEMA_VERSION: u32 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Single,
    Textarea,
    Rich,
    Array,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Text,
    Number,
    Date,
    Boolean,
    Html,
}

impl DataType {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "string" => Some(DataType::Text),
            "number" | "num" | "numeric" => Some(DataType::Number),
            "date" => Some(DataType::Date),
            "boolean" | "bool" => Some(DataType::Boolean),
            "html" | "rich" => Some(DataType::Html),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub slug: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    pub data_type: DataType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patternmsg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minvalue: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maxvalue: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<String>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub parameters: IndexMap<String, String>,
}

impl FieldDef {
    pub fn new(slug: &str, field_type: FieldType, data_type: DataType) -> Self {
        Self {
            name: humanize(slug),
            slug: slug.to_string(),
            field_type,
            data_type,
            placeholder: None,
            pattern: None,
            patternmsg: None,
            minvalue: None,
            maxvalue: None,
            length: None,
            parameters: IndexMap::new(),
        }
    }

    pub fn date_format(&self) -> Option<&str> {
        self.param("format").filter(|s| !s.is_empty())
    }

    pub fn number_format(&self) -> Option<&str> {
        self.param("frm").filter(|s| !s.is_empty())
    }

    pub fn case(&self) -> Option<&str> {
        self.param("case").filter(|s| !s.is_empty())
    }

    pub fn is_rich(&self) -> bool {
        self.field_type == FieldType::Rich || self.data_type == DataType::Html
    }

    fn param(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).map(|s| s.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RepeaterDef {
    pub name: String,
    pub slug: String,
    pub fields: Vec<FieldDef>,
}

impl RepeaterDef {
    pub fn field(&self, slug: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.slug == slug)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaMeta {
    pub template: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<DocFormat>,
    pub hash: String,
    pub extracted_at: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    pub version: u32,
    #[serde(default)]
    pub fields: Vec<FieldDef>,
    #[serde(default)]
    pub repeaters: Vec<RepeaterDef>,
    #[serde(default)]
    pub meta: SchemaMeta,
}

impl Default for Schema {
    fn default() -> Self {
        Self::empty()
    }
}

impl Schema {
    pub fn empty() -> Self {
        Self {
            version: SCHEMA_VERSION,
            fields: Vec::new(),
            repeaters: Vec::new(),
            meta: SchemaMeta::default(),
        }
    }

    /// Legacy documents (no `version`, or older than the current one) load as an empty schema.
    pub fn from_json(s: &str) -> anyhow::Result<Self> {
        let value: serde_json::Value = serde_json::from_str(s).context("parse schema json")?;
        let version = value.get("version").and_then(|v| v.as_u64()).unwrap_or(0);
        if version < u64::from(SCHEMA_VERSION) {
            return Ok(Self::empty());
        }
        serde_json::from_value(value).context("decode schema")
    }

    pub fn to_json_pretty(&self) -> anyhow::Result<String> {
        serde_json::to_string_pretty(self).context("serialize schema")
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.repeaters.is_empty()
    }

    pub fn field(&self, slug: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.slug == slug)
    }

    pub fn repeater(&self, slug: &str) -> Option<&RepeaterDef> {
        self.repeaters.iter().find(|r| r.slug == slug)
    }
}

/// ASCII-folded, lowercased, `[a-z0-9_]` only, no leading/trailing/double `_`.
pub fn slugify(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_sep = false;
    for ch in raw.chars().flat_map(fold_char) {
        let ch = ch.to_ascii_lowercase();
        if ch.is_ascii_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.push(ch);
        } else {
            pending_sep = true;
        }
    }
    out
}

fn fold_char(ch: char) -> Vec<char> {
    let folded: &str = match ch {
        'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' | 'ā' | 'ă' | 'ą' => "a",
        'À' | 'Á' | 'Â' | 'Ã' | 'Ä' | 'Å' | 'Ā' | 'Ă' | 'Ą' => "A",
        'æ' => "ae",
        'Æ' => "AE",
        'ç' | 'ć' | 'č' | 'ĉ' | 'ċ' => "c",
        'Ç' | 'Ć' | 'Č' | 'Ĉ' | 'Ċ' => "C",
        'ď' | 'đ' | 'ð' => "d",
        'Ď' | 'Đ' | 'Ð' => "D",
        'è' | 'é' | 'ê' | 'ë' | 'ē' | 'ė' | 'ę' | 'ě' => "e",
        'È' | 'É' | 'Ê' | 'Ë' | 'Ē' | 'Ė' | 'Ę' | 'Ě' => "E",
        'ğ' | 'ģ' => "g",
        'Ğ' | 'Ģ' => "G",
        'ì' | 'í' | 'î' | 'ï' | 'ī' | 'į' | 'ı' => "i",
        'Ì' | 'Í' | 'Î' | 'Ï' | 'Ī' | 'Į' | 'İ' => "I",
        'ł' | 'ľ' | 'ĺ' => "l",
        'Ł' | 'Ľ' | 'Ĺ' => "L",
        'ñ' | 'ń' | 'ň' => "n",
        'Ñ' | 'Ń' | 'Ň' => "N",
        'ò' | 'ó' | 'ô' | 'õ' | 'ö' | 'ø' | 'ō' | 'ő' => "o",
        'Ò' | 'Ó' | 'Ô' | 'Õ' | 'Ö' | 'Ø' | 'Ō' | 'Ő' => "O",
        'œ' => "oe",
        'Œ' => "OE",
        'ŕ' | 'ř' => "r",
        'Ŕ' | 'Ř' => "R",
        'ś' | 'š' | 'ş' | 'ș' => "s",
        'Ś' | 'Š' | 'Ş' | 'Ș' => "S",
        'ß' => "ss",
        'ť' | 'ţ' | 'ț' => "t",
        'Ť' | 'Ţ' | 'Ț' => "T",
        'ù' | 'ú' | 'û' | 'ü' | 'ū' | 'ů' | 'ű' | 'ų' => "u",
        'Ù' | 'Ú' | 'Û' | 'Ü' | 'Ū' | 'Ů' | 'Ű' | 'Ų' => "U",
        'ý' | 'ÿ' => "y",
        'Ý' | 'Ÿ' => "Y",
        'ź' | 'ż' | 'ž' => "z",
        'Ź' | 'Ż' | 'Ž' => "Z",
        _ => return vec![ch],
    };
    folded.chars().collect()
}

/// `client_name` -> `Client name`.
pub fn humanize(slug: &str) -> String {
    let spaced = slug.replace(['_', '-', '.'], " ");
    let spaced = spaced.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut chars = spaced.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_folds_and_collapses() {
        assert_eq!(slugify("Fecha de Emisión"), "fecha_de_emision");
        assert_eq!(slugify("__Client--Name__"), "client_name");
        assert_eq!(slugify("items.title"), "items_title");
        assert_eq!(slugify("Straße №5"), "strasse_5");
        assert_eq!(slugify("***"), "");
    }

    #[test]
    fn humanize_slug() {
        assert_eq!(humanize("client_name"), "Client name");
        assert_eq!(humanize(""), "");
    }

    #[test]
    fn legacy_schema_loads_empty() {
        let legacy = r#"{"fields":[{"name":"A","slug":"a","type":"single","data_type":"text"}]}"#;
        assert!(Schema::from_json(legacy).expect("legacy").is_empty());
        let v1 = r#"{"version":1,"fields":[],"repeaters":[]}"#;
        assert_eq!(Schema::from_json(v1).expect("v1"), Schema::empty());
    }

    #[test]
    fn current_schema_json_shape() {
        let mut schema = Schema::empty();
        let mut f = FieldDef::new("invoice_date", FieldType::Single, DataType::Date);
        f.parameters.insert("format".to_string(), "d/m/Y".to_string());
        schema.fields.push(f);
        schema.meta.format = Some(DocFormat::Odt);

        let json = schema.to_json_pretty().expect("json");
        let v: serde_json::Value = serde_json::from_str(&json).expect("value");
        assert_eq!(v["version"], 2);
        assert_eq!(v["fields"][0]["type"], "single");
        assert_eq!(v["fields"][0]["data_type"], "date");
        assert_eq!(v["fields"][0]["parameters"]["format"], "d/m/Y");
        assert!(v["fields"][0].get("pattern").is_none());
        assert_eq!(v["meta"]["format"], "odt");

        let back = Schema::from_json(&json).expect("reload");
        assert_eq!(back, schema);
        assert_eq!(back.fields[0].date_format(), Some("d/m/Y"));
    }
}
