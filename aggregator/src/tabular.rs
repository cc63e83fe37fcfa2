//! Decoder for spreadsheet CSV exports.
//!
//! Exports are split on newlines before they reach us, so decoding happens in two
//! passes: physical lines are first rejoined into logical records while a quoted
//! span is open, then each record is split into fields.

use crate::sanitize::sanitize;
use crate::types::Row;

pub fn decode(text: &str, sanitize_headers: bool) -> Vec<Row> {
    let mut records = logical_records(text).into_iter();

    let Some(header_record) = records.next() else {
        return Vec::new();
    };

    let headers: Vec<String> = split_fields(&header_record)
        .into_iter()
        .map(|h| if sanitize_headers { sanitize(&h) } else { h })
        .collect();

    records
        .filter_map(|record| {
            let mut values = split_fields(&record).into_iter();
            let row: Row = headers
                .iter()
                .map(|header| (header.clone(), values.next().unwrap_or_default()))
                .collect();

            row.values().any(|v| !v.is_empty()).then_some(row)
        })
        .collect()
}

/// Parses a single-cell export as a number. Thousands separators and
/// surrounding quotes are tolerated; anything else yields `None`.
pub fn decode_scalar(text: &str) -> Option<f64> {
    let cleaned: String = text
        .trim()
        .trim_matches('"')
        .chars()
        .filter(|c| *c != ',')
        .collect();

    cleaned.trim().parse::<f64>().ok().filter(|n| n.is_finite())
}

/// Rejoins physical lines into records. A record stays open while it has seen an
/// odd number of quote characters.
fn logical_records(text: &str) -> Vec<String> {
    let mut records = Vec::new();
    let mut current: Option<String> = None;
    let mut quotes = 0usize;

    for line in text.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);

        match current.as_mut() {
            Some(record) => {
                record.push('\n');
                record.push_str(line);
            }
            None if line.trim().is_empty() => continue,
            None => current = Some(line.to_string()),
        }

        quotes += line.matches('"').count();
        if quotes % 2 == 0 {
            records.extend(current.take());
            quotes = 0;
        }
    }

    // Unterminated quote at end of input: keep what we have.
    if let Some(record) = current {
        records.push(record);
    }

    records
}

fn split_fields(record: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = record.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                field.push('"');
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                fields.push(field.trim().to_string());
                field.clear();
            }
            _ => field.push(c),
        }
    }
    fields.push(field.trim().to_string());

    fields
}
