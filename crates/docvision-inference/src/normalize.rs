//! Normalization of raw vision-model output into a [`MetadataRecord`].
//!
//! Models wrap their JSON in Markdown fences or chatter around it; the
//! outermost `{...}` is taken. Missing, null, or placeholder values stay
//! empty.

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

use docvision_core::{Error, MetadataRecord, Result};

const PLACEHOLDERS: &[&str] = &["", "null", "none", "unknown", "n/a", "-"];

static ISO_DATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d{4})-(\d{1,2})-(\d{1,2})").expect("valid regex"));

/// `DD.MM.YYYY`, common on German invoices.
static DOTTED_DATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d{1,2})\.(\d{1,2})\.(\d{4})").expect("valid regex"));

/// Parse raw model output.
///
/// Empty output or output without a parseable JSON object is an
/// [`Error::InferenceError`].
pub fn normalize(raw: &str) -> Result<MetadataRecord> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(Error::InferenceError("empty model output".to_string()));
    }

    let body = strip_code_fences(trimmed);
    let json = extract_json_object(body)
        .ok_or_else(|| Error::InferenceError("no JSON object in model output".to_string()))?;
    let value: Value = serde_json::from_str(json)
        .map_err(|e| Error::InferenceError(format!("malformed JSON in model output: {e}")))?;
    let Value::Object(obj) = value else {
        return Err(Error::InferenceError(
            "model output is not a JSON object".to_string(),
        ));
    };

    Ok(MetadataRecord {
        title: string_field(&obj, &["title"]),
        document_date: string_field(&obj, &["created", "date", "document_date"])
            .and_then(|s| parse_date(&s)),
        correspondent: string_field(&obj, &["correspondent", "sender"]),
        document_type: string_field(&obj, &["document_type", "type"]),
        tags: tags_field(&obj),
        content: string_field(&obj, &["content", "text", "ai_content"]),
    })
}

/// Remove a surrounding ```json ... ``` block if present.
pub fn strip_code_fences(s: &str) -> &str {
    let Some(start) = s.find("```") else {
        return s;
    };
    let after = &s[start + 3..];
    // Skip the language tag on the opening fence line.
    let after = match after.find('\n') {
        Some(nl) if !after[..nl].contains('{') => &after[nl + 1..],
        _ => after,
    };
    match after.rfind("```") {
        Some(end) => &after[..end],
        None => after,
    }
}

/// Slice from the first `{` to the last `}`.
pub fn extract_json_object(s: &str) -> Option<&str> {
    let start = s.find('{')?;
    let end = s.rfind('}')?;
    (end > start).then(|| &s[start..=end])
}

/// ISO (`YYYY-MM-DD`, optionally with a time suffix) or `DD.MM.YYYY`.
pub fn parse_date(s: &str) -> Option<NaiveDate> {
    if let Some(c) = ISO_DATE.captures(s) {
        return NaiveDate::from_ymd_opt(
            c[1].parse().ok()?,
            c[2].parse().ok()?,
            c[3].parse().ok()?,
        );
    }
    let c = DOTTED_DATE.captures(s)?;
    NaiveDate::from_ymd_opt(c[3].parse().ok()?, c[2].parse().ok()?, c[1].parse().ok()?)
}

fn clean(s: &str) -> Option<String> {
    let t = s.trim();
    if PLACEHOLDERS.contains(&t.to_ascii_lowercase().as_str()) {
        None
    } else {
        Some(t.to_string())
    }
}

fn string_field(obj: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| match obj.get(*k)? {
        Value::String(s) => clean(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn tags_field(obj: &Map<String, Value>) -> Vec<String> {
    let raw: Vec<String> = match obj.get("tags") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect(),
        Some(Value::String(s)) => s.split(',').map(String::from).collect(),
        _ => Vec::new(),
    };

    let mut tags: Vec<String> = Vec::new();
    for tag in raw.iter().filter_map(|t| clean(t)) {
        if !tags.iter().any(|t| t.eq_ignore_ascii_case(&tag)) {
            tags.push(tag);
        }
    }
    tags
}
