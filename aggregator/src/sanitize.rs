//! Maps raw spreadsheet column titles to stable lower-case keys.

/// Headers whose wording varies between exports. Matched against the header
/// with punctuation, whitespace and case removed.
const AMBIGUOUS_HEADERS: &[(&str, &str)] = &[
    ("amountsanctioned", "amount_sanctioned"),
    ("dateofsanction", "sanction_date"),
    ("durationinyears", "duration_years"),
];

pub fn sanitize(raw: &str) -> String {
    let squashed: String = raw
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .collect();

    if let Some((_, canonical)) = AMBIGUOUS_HEADERS
        .iter()
        .find(|(needle, _)| squashed.contains(needle))
    {
        return (*canonical).to_string();
    }

    let mut key = String::with_capacity(raw.len());
    for c in raw.chars() {
        if !(c.is_ascii_alphanumeric() || c == '_') {
            continue;
        }
        if c == '_' && key.ends_with('_') {
            continue;
        }
        key.push(c.to_ascii_lowercase());
    }
    key
}
