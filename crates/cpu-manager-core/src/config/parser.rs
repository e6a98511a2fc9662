//! Parser for the line-oriented `KEY=VALUE` configuration format.
//!
//! Comments begin with `#`, blank lines are ignored, values may be
//! single- or double-quoted. Unknown keys are kept; the caller decides
//! what to ignore.

use std::collections::HashMap;

/// Parses `KEY=VALUE` content into a key -> value map.
///
/// Later occurrences of a key win. Lines without `=` are skipped.
pub fn parse_config_content(content: &str) -> HashMap<String, String> {
    let mut pairs = HashMap::new();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        pairs.insert(key.to_string(), unquote(value.trim()).to_string());
    }

    pairs
}

/// Strips one matching pair of single or double quotes.
fn unquote(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if first == last && (first == b'"' || first == b'\'') {
            return &value[1..value.len() - 1];
        }
    }
    value
}

/// Parses a boolean config value: true/false, yes/no, on/off, 1/0.
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}
