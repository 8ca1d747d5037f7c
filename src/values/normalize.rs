use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Timelike};
use once_cell::sync::Lazy;
use regex::Regex;

pub const DEFAULT_DATE_FORMAT: &str = "d/m/Y";

const CURRENCY_SYMBOLS: &[char] = &[
    '€', '$', '£', '¥', '₹', '₽', '₩', '¢', '₺', '₴', '₱', '฿', '₪', '₫', '₦', '₡', '₲',
];

static CURRENCY_CODE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z]{3}|[A-Za-z]{3}$").expect("currency code regex"));
static NUMERIC_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[+-]?[0-9.,]*[0-9][0-9.,]*$").expect("numeric regex"));

/// Numeric value of a user-entered amount (`"1.234,5 €"`, `"USD 12"`, `"3,5"`).
pub fn parse_number(raw: &str) -> Option<f64> {
    let stripped: String = raw
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '\u{a0}' && *c != '\u{202f}')
        .filter(|c| !CURRENCY_SYMBOLS.contains(c))
        .collect();
    let stripped = CURRENCY_CODE_RE.replace_all(&stripped, "");
    if !NUMERIC_RE.is_match(&stripped) {
        return None;
    }

    let commas = stripped.matches(',').count();
    let periods = stripped.matches('.').count();
    let canonical: String = if commas > 0 && periods > 0 {
        stripped.replace(',', "")
    } else if commas == 1 {
        stripped.replace(',', ".")
    } else if commas > 1 {
        stripped.replace(',', "")
    } else if periods > 1 {
        stripped.replace('.', "")
    } else {
        stripped.into_owned()
    };
    canonical.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Canonical numeric string, or `""` for empty/non-numeric input.
pub fn normalize_number(raw: &str) -> String {
    parse_number(raw).map(canonical_number).unwrap_or_default()
}

pub fn canonical_number(v: f64) -> String {
    if v == 0.0 {
        return "0".to_string();
    }
    if v.fract() == 0.0 && v.abs() < 1e15 {
        return format!("{}", v as i64);
    }
    format!("{v}")
}

/// Applies a number pattern such as `0.000,00`, `#,##0.00` or `0`. Text before the first and
/// after the last pattern character is kept as prefix/suffix.
pub fn format_number(value: f64, frm: &str) -> String {
    let is_pat = |c: char| matches!(c, '0' | '#' | '.' | ',' | ' ');
    let Some(first) = frm.find(|c: char| matches!(c, '0' | '#')) else {
        return canonical_number(value);
    };
    let last = frm
        .char_indices()
        .filter(|(_, c)| matches!(c, '0' | '#'))
        .map(|(i, c)| i + c.len_utf8())
        .last()
        .unwrap_or(frm.len());
    let mut start = first;
    while let Some(c) = frm[..start].chars().last() {
        if c == ' ' || !is_pat(c) {
            break;
        }
        start -= c.len_utf8();
    }
    let prefix = &frm[..start];
    let suffix = &frm[last..];
    let pattern = &frm[start..last];

    let (int_pat, dec_pat, dec_sep) = split_decimal(pattern);
    let thousands = int_pat.chars().find(|c| matches!(c, '.' | ',' | ' '));
    let max_dec = dec_pat.chars().count();
    let min_dec = dec_pat.chars().filter(|c| *c == '0').count();

    let rendered = format!("{:.*}", max_dec, value.abs());
    let (int_digits, mut dec_digits) = match rendered.split_once('.') {
        Some((i, d)) => (i.to_string(), d.to_string()),
        None => (rendered.clone(), String::new()),
    };
    while dec_digits.len() > min_dec && dec_digits.ends_with('0') {
        dec_digits.pop();
    }

    let mut out = String::new();
    out.push_str(prefix);
    let negative = value < 0.0 && (int_digits.chars().chain(dec_digits.chars()).any(|c| c != '0'));
    if negative {
        out.push('-');
    }
    match thousands {
        Some(sep) => out.push_str(&group_thousands(&int_digits, sep)),
        None => out.push_str(&int_digits),
    }
    if !dec_digits.is_empty() {
        out.push(dec_sep.unwrap_or('.'));
        out.push_str(&dec_digits);
    }
    out.push_str(suffix);
    out
}

/// Splits a bare pattern into (integer part, decimal part, decimal separator).
fn split_decimal(pattern: &str) -> (&str, &str, Option<char>) {
    let has_comma = pattern.contains(',');
    let has_period = pattern.contains('.');
    let sep = match (has_comma, has_period) {
        (true, true) => pattern.rfind(['.', ',']),
        (true, false) | (false, true) => {
            let ch = if has_comma { ',' } else { '.' };
            let pos = pattern.rfind(ch);
            let single = pattern.matches(ch).count() == 1;
            match pos {
                Some(p) if single && !(pattern.starts_with('#') && pattern[p + 1..].len() == 3) => Some(p),
                _ => None,
            }
        }
        (false, false) => None,
    };
    match sep {
        Some(p) => {
            let ch = pattern[p..].chars().next();
            (&pattern[..p], &pattern[p + 1..], ch)
        }
        None => (pattern, "", None),
    }
}

fn group_thousands(digits: &str, sep: char) -> String {
    let len = digits.len();
    let mut out = String::with_capacity(len + len / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (len - i) % 3 == 0 {
            out.push(sep);
        }
        out.push(ch);
    }
    out
}

pub fn normalize_boolean(raw: &str) -> &'static str {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "si" | "sí" | "on" => "1",
        _ => "0",
    }
}

pub fn parse_date(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(d) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return d.and_hms_opt(0, 0, 0);
    }
    for fmt in [
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%d %H:%M",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%dT%H:%M",
    ] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(dt);
        }
    }
    DateTime::parse_from_rfc3339(raw).ok().map(|dt| dt.naive_local())
}

/// Formats an ISO/RFC 3339 date with a PHP-style format string; unparseable input is returned
/// unchanged.
pub fn normalize_date(raw: &str, format: &str) -> String {
    match parse_date(raw) {
        Some(dt) => format_date(&dt, format),
        None => raw.to_string(),
    }
}

const WEEKDAYS: [&str; 7] = [
    "Monday",
    "Tuesday",
    "Wednesday",
    "Thursday",
    "Friday",
    "Saturday",
    "Sunday",
];
const MONTHS: [&str; 12] = [
    "January",
    "February",
    "March",
    "April",
    "May",
    "June",
    "July",
    "August",
    "September",
    "October",
    "November",
    "December",
];

pub fn format_date(dt: &NaiveDateTime, format: &str) -> String {
    let weekday = dt.weekday().num_days_from_monday() as usize;
    let month = dt.month0() as usize;
    let hour12 = match dt.hour() % 12 {
        0 => 12,
        h => h,
    };

    let mut out = String::new();
    let mut chars = format.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(lit) = chars.next() {
                    out.push(lit);
                }
            }
            'd' => out.push_str(&format!("{:02}", dt.day())),
            'D' => out.push_str(&WEEKDAYS[weekday][..3]),
            'j' => out.push_str(&dt.day().to_string()),
            'l' => out.push_str(WEEKDAYS[weekday]),
            'N' => out.push_str(&(weekday + 1).to_string()),
            'w' => out.push_str(&dt.weekday().num_days_from_sunday().to_string()),
            'm' => out.push_str(&format!("{:02}", dt.month())),
            'M' => out.push_str(&MONTHS[month][..3]),
            'n' => out.push_str(&dt.month().to_string()),
            'F' => out.push_str(MONTHS[month]),
            'y' => out.push_str(&format!("{:02}", dt.year().rem_euclid(100))),
            'Y' => out.push_str(&dt.year().to_string()),
            'H' => out.push_str(&format!("{:02}", dt.hour())),
            'G' => out.push_str(&dt.hour().to_string()),
            'h' => out.push_str(&format!("{hour12:02}")),
            'g' => out.push_str(&hour12.to_string()),
            'i' => out.push_str(&format!("{:02}", dt.minute())),
            's' => out.push_str(&format!("{:02}", dt.second())),
            'a' => out.push_str(if dt.hour() < 12 { "am" } else { "pm" }),
            'A' => out.push_str(if dt.hour() < 12 { "AM" } else { "PM" }),
            other => out.push(other),
        }
    }
    out
}

pub fn apply_case(raw: &str, mode: &str) -> String {
    match mode.trim().to_ascii_lowercase().as_str() {
        "upper" => raw.to_uppercase(),
        "lower" => raw.to_lowercase(),
        "title" => {
            let mut out = String::with_capacity(raw.len());
            let mut at_word_start = true;
            for ch in raw.chars() {
                if ch.is_whitespace() {
                    at_word_start = true;
                    out.push(ch);
                } else if at_word_start {
                    out.extend(ch.to_uppercase());
                    at_word_start = false;
                } else {
                    out.extend(ch.to_lowercase());
                }
            }
            out
        }
        _ => raw.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_with_currency_and_separators() {
        assert_eq!(normalize_number("1.234,56 €"), "1.23456");
        assert_eq!(normalize_number("1,234.56"), "1234.56");
        assert_eq!(normalize_number("3,5"), "3.5");
        assert_eq!(normalize_number("1,234,567"), "1234567");
        assert_eq!(normalize_number("1.234.567"), "1234567");
        assert_eq!(normalize_number("USD 1\u{a0}200"), "1200");
        assert_eq!(normalize_number("12.0"), "12");
        assert_eq!(normalize_number("-0"), "0");
        assert_eq!(normalize_number(""), "");
        assert_eq!(normalize_number("abc"), "");
        assert_eq!(normalize_number("1x2"), "");
    }

    #[test]
    fn number_patterns() {
        assert_eq!(format_number(1234.5, "0.000,00"), "1.234,50");
        assert_eq!(format_number(1234567.891, "#,##0.00"), "1,234,567.89");
        assert_eq!(format_number(12.6, "0"), "13");
        assert_eq!(format_number(1234.0, "#,##0"), "1,234");
        assert_eq!(format_number(2.5, "0,0#"), "2,5");
        assert_eq!(format_number(-3.0, "0.00 €"), "-3.00 €");
    }

    #[test]
    fn booleans() {
        for yes in ["1", "true", "YES", "Sí", "si", " on "] {
            assert_eq!(normalize_boolean(yes), "1", "{yes}");
        }
        for no in ["0", "false", "", "nope", "2"] {
            assert_eq!(normalize_boolean(no), "0", "{no}");
        }
    }

    #[test]
    fn dates() {
        assert_eq!(normalize_date("2024-03-05", DEFAULT_DATE_FORMAT), "05/03/2024");
        assert_eq!(normalize_date("2024-03-05 14:07", "j F Y, H:i"), "5 March 2024, 14:07");
        assert_eq!(normalize_date("2024-03-05T09:30:00+02:00", "D d/m/y g:i A"), "Tue 05/03/24 9:30 AM");
        assert_eq!(normalize_date("2024-03-05", r"l \d\e j"), "Tuesday de 5");
        assert_eq!(normalize_date("5 de marzo", "d/m/Y"), "5 de marzo");
        assert_eq!(normalize_date("2024-03-10", "N w"), "7 0");
    }

    #[test]
    fn case_modes() {
        assert_eq!(apply_case("élan vital", "upper"), "ÉLAN VITAL");
        assert_eq!(apply_case("ÁRBOL", "lower"), "árbol");
        assert_eq!(apply_case("maría JOSÉ", "title"), "María José");
        assert_eq!(apply_case("as is", "unknown"), "as is");
    }
}
