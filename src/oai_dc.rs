//! Dublin Core → raw preprint document.
//!
//! Output shape:
//!
//! ```json
//! {
//!   "title":       [{"text": "Titulo de teste", "lang": "pt"}],
//!   "subject":     [...], "identifier": [...], "rights": [...],
//!   "publisher":   [...], "description": [...], "relation": [...], "type": [...],
//!   "language":    "pt",
//!   "date":        {"day": 20, "month": 5, "year": 2024},
//!   "authors":     [{"surname": "Silva", "given_names": "Maria"}],
//!   "source":      ["https://ex/preprint/123"]
//! }
//! ```
//!
//! Each derived field is extracted on its own; a failure is reported to
//! the [`FieldErrorSink`] under the field's name and the other fields are
//! still produced.

use anyhow::Result;
use chrono::{Datelike, NaiveDate};
use serde_json::{json, Map, Value};

use crate::error::HarvestError;
use crate::error_context::FieldErrorSink;
use crate::oai::DcElement;

/// Elements copied verbatim as `[{text, lang?}]` lists.
pub const DC_NODES: [&str; 8] = [
    "title",
    "subject",
    "identifier",
    "rights",
    "publisher",
    "description",
    "relation",
    "type",
];

fn elements<'a>(all: &'a [DcElement], name: &'a str) -> impl Iterator<Item = &'a DcElement> {
    all.iter().filter(move |e| e.name == name)
}

fn text_with_lang(element: &DcElement) -> Value {
    let mut obj = Map::new();
    obj.insert("text".to_string(), json!(element.text));
    if let Some(lang) = &element.lang {
        obj.insert("lang".to_string(), json!(lang));
    }
    Value::Object(obj)
}

/// Builds the raw document for one preprint.
pub fn parse_preprint(all: &[DcElement], errors: &mut dyn FieldErrorSink) -> Value {
    let mut doc = Map::new();

    for node in DC_NODES {
        let values: Vec<Value> = elements(all, node).map(text_with_lang).collect();
        doc.insert(node.to_string(), Value::Array(values));
    }

    match elements(all, "language").next().map(|e| e.text.trim()) {
        Some(lang) if !lang.is_empty() => {
            doc.insert("language".to_string(), json!(lang));
        }
        _ => errors.add_field_error(
            HarvestError::parse("language", "record has no dc:language").into(),
            "language",
            json!({}),
        ),
    }

    match elements(all, "date").next() {
        Some(date) => match parse_dc_date(&date.text) {
            Ok(value) => {
                doc.insert("date".to_string(), value);
            }
            Err(e) => errors.add_field_error(e, "date", json!({ "value": date.text })),
        },
        None => errors.add_field_error(
            HarvestError::parse("date", "record has no dc:date").into(),
            "date",
            json!({}),
        ),
    }

    let mut authors = Vec::new();
    for creator in elements(all, "creator") {
        match parse_author_name(&creator.text) {
            Ok(author) => authors.push(author),
            Err(e) => errors.add_field_error(e, "creator", json!({ "value": creator.text })),
        }
    }
    doc.insert("authors".to_string(), Value::Array(authors));

    let source: Vec<Value> = elements(all, "identifier")
        .map(|e| e.text.trim())
        .filter(|t| t.starts_with("http://") || t.starts_with("https://"))
        .map(|t| json!(t))
        .collect();
    doc.insert("source".to_string(), Value::Array(source));

    Value::Object(doc)
}

/// `YYYY-MM-DD` (optionally followed by a `T…` time part) → `{day, month, year}`.
pub fn parse_dc_date(text: &str) -> Result<Value> {
    let text = text.trim();
    let day_part = match text.split_once('T') {
        Some((day, _)) => day,
        None => text,
    };
    let date = NaiveDate::parse_from_str(day_part, "%Y-%m-%d")
        .map_err(|_| HarvestError::parse("date", "Invalid date"))?;
    Ok(json!({
        "day": date.day(),
        "month": date.month(),
        "year": date.year(),
    }))
}

/// "Family, Given" → `{surname, given_names}`; anything else → `{declared_name}`.
pub fn parse_author_name(name: &str) -> Result<Value> {
    let name = name.trim();
    if name.is_empty() {
        return Err(HarvestError::parse("creator", "empty creator").into());
    }
    let mut parts = name.split(',');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(surname), Some(given), None)
            if !surname.trim().is_empty() && !given.trim().is_empty() =>
        {
            Ok(json!({
                "surname": surname.trim(),
                "given_names": given.trim(),
            }))
        }
        _ => Ok(json!({ "declared_name": name })),
    }
}
