//! Turns one CSV row into an item-creation payload.
//!
//! Everything here is pure: no I/O, and bad or missing cells simply leave
//! the corresponding field out.

use crate::config::{Language, UploadConfig, DC_FIELDS, FILES_COLUMNS, TAGS_FIELD};
use crate::models::{ElementRef, ElementText, FieldMapping, ItemPayload, Row, Tag};
use once_cell::sync::Lazy;
use regex::Regex;

static TAG_SEPARATOR: Lazy<Regex> = Lazy::new(|| Regex::new(r"[,;]").unwrap());

static FILE_SEPARATOR: Lazy<Regex> = Lazy::new(|| Regex::new(r"[;|]").unwrap());

pub fn transform(row: &Row, mapping: &FieldMapping, config: &UploadConfig) -> ItemPayload {
    let mut element_texts = Vec::new();

    for field in DC_FIELDS {
        let Some(value) = resolve_field(row, field, config.language) else {
            continue;
        };
        let Some(id) = mapping.get(field) else {
            continue;
        };
        let (text, html) = render_value(value, config.render_html);
        element_texts.push(ElementText {
            element: ElementRef { id },
            text,
            html,
        });
    }

    let tags = resolve_field(row, TAGS_FIELD, config.language)
        .map(split_tags)
        .unwrap_or_default();

    let file_urls = FILES_COLUMNS
        .iter()
        .filter_map(|column| row.get(column))
        .find(|value| !value.is_empty())
        .map(split_file_urls)
        .filter(|urls| !urls.is_empty());

    ItemPayload {
        public: config.public,
        element_texts,
        tags,
        file_urls,
    }
}

/// Bilingual lookup: preferred-language column, then the other language,
/// then the bare name. Returns the first non-blank value, trimmed.
pub fn resolve_field<'a>(row: &'a Row, field: &str, language: Language) -> Option<&'a str> {
    let candidates = [
        format!("{field} ({})", language.suffix()),
        format!("{field} ({})", language.other().suffix()),
        field.to_string(),
    ];

    candidates
        .iter()
        .filter_map(|column| row.get(column))
        .map(str::trim)
        .find(|value| !value.is_empty())
}

/// Returns the text to send and its html flag.
pub fn render_value(value: &str, render_html: bool) -> (String, bool) {
    if looks_like_html(value) {
        if render_html {
            (value.to_string(), true)
        } else {
            (escape_html(value), false)
        }
    } else {
        (value.to_string(), false)
    }
}

pub fn looks_like_html(value: &str) -> bool {
    value.contains('<') && value.contains('>')
}

pub fn escape_html(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 16);
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(c),
        }
    }
    out
}

pub fn split_tags(raw: &str) -> Vec<Tag> {
    TAG_SEPARATOR
        .split(raw)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|name| Tag {
            name: name.to_string(),
        })
        .collect()
}

/// Keeps only pieces that look like absolute http(s) URLs, in order.
pub fn split_file_urls(raw: &str) -> Vec<String> {
    FILE_SEPARATOR
        .split(raw)
        .map(str::trim)
        .filter(|s| s.starts_with("http"))
        .map(str::to_string)
        .collect()
}
