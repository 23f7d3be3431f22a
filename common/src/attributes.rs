use std::fmt;

use indexmap::IndexMap;
use serde::{Serialize, Serializer};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("text is too short to hold an object")]
    InvalidLength,
    #[error("missing object delimiters")]
    MissingDelimiters,
    #[error("unterminated string starting at byte {0}")]
    UnterminatedString(usize),
    #[error("missing colon after key at byte {0}")]
    MissingColon(usize),
    #[error("expected a quoted key at byte {0}")]
    ExpectedKey(usize),
    #[error("expected `,` or end of object at byte {0}")]
    ExpectedSeparator(usize),
    #[error("nested value at byte {0}")]
    NestedValue(usize),
    #[error("invalid escape or control character in string at byte {0}")]
    InvalidString(usize),
}

/// Ordered string map where an empty value is the same as no value.
///
/// Text form is a flat JSON object whose values are strings. On input, `null` and bare
/// tokens (`true`, `12`) are also accepted; `null` reads as absent, bare tokens as text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttributeStore {
    entries: IndexMap<String, String>,
}

impl AttributeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(text: &str) -> Result<Self, ParseError> {
        let mut store = Self::new();
        for (key, value) in parse_flat_object(text)? {
            store.set(&key, value.as_deref());
        }
        Ok(store)
    }

    /// Replaces the contents with `text`. The store is untouched when parsing fails.
    pub fn load_json(&mut self, text: &str) -> Result<(), ParseError> {
        *self = Self::parse(text)?;
        Ok(())
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.entries).unwrap_or_else(|_| String::from("{}"))
    }

    /// Returns true when the stored value actually changed.
    pub fn set(&mut self, key: &str, value: Option<&str>) -> bool {
        match value.filter(|value| !value.is_empty()) {
            None => self.entries.shift_remove(key).is_some(),
            Some(value) => match self.entries.get_mut(key) {
                Some(current) if current == value => false,
                Some(current) => {
                    *current = value.to_string();
                    true
                }
                None => {
                    self.entries.insert(key.to_string(), value.to_string());
                    true
                }
            },
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn has(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> bool {
        self.entries.shift_remove(key).is_some()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// `true`/`false` literally, otherwise any non-zero integer.
    pub fn is(&self, key: &str) -> bool {
        self.get(key).is_some_and(is_truthy)
    }

    pub fn get_int(&self, key: &str) -> i64 {
        self.get(key)
            .and_then(|value| value.trim().parse().ok())
            .unwrap_or(0)
    }

    pub fn get_unsigned(&self, key: &str) -> u64 {
        self.get(key)
            .and_then(|value| value.trim().parse().ok())
            .unwrap_or(0)
    }

    pub fn get_float(&self, key: &str) -> f32 {
        self.get(key)
            .and_then(|value| value.trim().parse().ok())
            .unwrap_or(0.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Serialize for AttributeStore {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.entries.serialize(serializer)
    }
}

impl fmt::Display for AttributeStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_json())
    }
}

type Entry = (String, Option<String>);

fn parse_flat_object(text: &str) -> Result<Vec<Entry>, ParseError> {
    let text = text.trim();
    if text.len() < 2 {
        return Err(ParseError::InvalidLength);
    }
    if !text.starts_with('{') || !text.ends_with('}') {
        return Err(ParseError::MissingDelimiters);
    }

    let bytes = text.as_bytes();
    let end = bytes.len() - 1;
    let mut entries = Vec::new();
    let mut pos = 1;

    loop {
        pos = skip_whitespace(bytes, pos, end);
        if pos >= end {
            break;
        }
        if bytes[pos] != b'"' {
            return Err(ParseError::ExpectedKey(pos));
        }
        let (key, next) = read_string(text, pos, end)?;

        pos = skip_whitespace(bytes, next, end);
        if pos >= end || bytes[pos] != b':' {
            return Err(ParseError::MissingColon(pos));
        }
        pos = skip_whitespace(bytes, pos + 1, end);

        let value = match bytes.get(pos) {
            Some(b'"') if pos < end => {
                let (value, next) = read_string(text, pos, end)?;
                pos = next;
                Some(value)
            }
            Some(b'{') | Some(b'[') if pos < end => return Err(ParseError::NestedValue(pos)),
            _ => {
                let token_end = bytes[pos..end]
                    .iter()
                    .position(|b| *b == b',')
                    .map_or(end, |offset| pos + offset);
                let token = text[pos..token_end].trim();
                pos = token_end;
                (!token.is_empty() && token != "null").then(|| token.to_string())
            }
        };
        entries.push((key, value));

        pos = skip_whitespace(bytes, pos, end);
        if pos >= end {
            break;
        }
        if bytes[pos] != b',' {
            return Err(ParseError::ExpectedSeparator(pos));
        }
        pos += 1;
    }

    Ok(entries)
}

fn skip_whitespace(bytes: &[u8], mut pos: usize, end: usize) -> usize {
    while pos < end && bytes[pos].is_ascii_whitespace() {
        pos += 1;
    }
    pos
}

/// `true` in any case, or an integer other than zero.
pub(crate) fn is_truthy(value: &str) -> bool {
    value.eq_ignore_ascii_case("true") || value.trim().parse::<i64>().is_ok_and(|value| value != 0)
}

/// Reads the quoted string at `start`, returning the decoded text and the index after it.
fn read_string(text: &str, start: usize, end: usize) -> Result<(String, usize), ParseError> {
    let bytes = text.as_bytes();
    let mut pos = start + 1;
    while pos < end {
        match bytes[pos] {
            b'\\' => pos += 2,
            b'"' => {
                let decoded = serde_json::from_str::<String>(&text[start..=pos])
                    .map_err(|_| ParseError::InvalidString(start))?;
                return Ok((decoded, pos + 1));
            }
            _ => pos += 1,
        }
    }
    Err(ParseError::UnterminatedString(start))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn store(pairs: &[(&str, &str)]) -> AttributeStore {
        let mut store = AttributeStore::new();
        for (key, value) in pairs {
            store.set(key, Some(value));
        }
        store
    }

    #[test]
    fn empty_value_reads_as_absent() {
        let mut attrs = store(&[("state", "on")]);
        assert!(attrs.set("state", Some("")));
        assert_eq!(attrs.get("state"), None);
        assert!(!attrs.has("state"));

        assert!(!attrs.set("other", Some("")));
        assert_eq!(attrs.get("other"), None);
    }

    #[test]
    fn set_reports_change_only_for_different_bytes() {
        let mut attrs = AttributeStore::new();
        assert!(!attrs.set("state", None));
        assert!(attrs.set("state", Some("on")));
        assert!(!attrs.set("state", Some("on")));
        assert!(attrs.set("state", Some("On")));
        assert!(attrs.set("state", None));
        assert!(!attrs.set("state", None));
    }

    #[test]
    fn serialization_keeps_insertion_order() {
        let mut attrs = store(&[("udn", "MppSwitch_ab12"), ("name", "Porch"), ("state", "off")]);
        attrs.set("name", Some("Porch light"));
        assert_eq!(
            attrs.to_json(),
            r#"{"udn":"MppSwitch_ab12","name":"Porch light","state":"off"}"#
        );
    }

    #[test]
    fn round_trip_is_a_fixed_point() {
        let mut attrs = store(&[
            ("udn", "MppSensor_ab12"),
            ("message", "said \"hi\"\nthen left"),
            ("path", "C:\\temp"),
            ("temperature", "21.5"),
        ]);
        attrs.remove("temperature");
        attrs.set("value", Some("12"));

        let first = attrs.to_json();
        let reparsed = AttributeStore::parse(&first).unwrap();
        assert_eq!(reparsed, attrs);
        assert_eq!(reparsed.to_json(), first);
    }

    #[test]
    fn parse_accepts_null_and_bare_tokens() {
        let attrs =
            AttributeStore::parse(r#" { "a" : "x", "b": null, "c": true, "d": 42 , "e":"" } "#)
                .unwrap();
        assert_eq!(attrs.get("a"), Some("x"));
        assert!(!attrs.has("b"));
        assert_eq!(attrs.get("c"), Some("true"));
        assert_eq!(attrs.get_int("d"), 42);
        assert!(!attrs.has("e"));
        assert_eq!(attrs.len(), 3);
    }

    #[test]
    fn parse_accepts_empty_object() {
        assert!(AttributeStore::parse("{}").unwrap().is_empty());
        assert!(AttributeStore::parse("{ }").unwrap().is_empty());
    }

    #[test]
    fn parse_errors_are_distinct() {
        assert_eq!(AttributeStore::parse("{"), Err(ParseError::InvalidLength));
        assert_eq!(
            AttributeStore::parse(r#""a":"b""#),
            Err(ParseError::MissingDelimiters)
        );
        assert_eq!(
            AttributeStore::parse(r#"{"a":"b}"#),
            Err(ParseError::UnterminatedString(5))
        );
        assert_eq!(
            AttributeStore::parse(r#"{"a" "b"}"#),
            Err(ParseError::MissingColon(5))
        );
        assert_eq!(
            AttributeStore::parse(r#"{a:"b"}"#),
            Err(ParseError::ExpectedKey(1))
        );
        assert_eq!(
            AttributeStore::parse(r#"{"a":{"b":"c"}}"#),
            Err(ParseError::NestedValue(5))
        );
        assert_eq!(
            AttributeStore::parse(r#"{"a":"b" "c":"d"}"#),
            Err(ParseError::ExpectedSeparator(9))
        );
    }

    #[test]
    fn failed_load_leaves_store_untouched() {
        let mut attrs = store(&[("state", "on")]);
        let before = attrs.clone();
        assert!(attrs.load_json(r#"{"state":"off"#).is_err());
        assert_eq!(attrs, before);

        attrs.load_json(r#"{"state":"off"}"#).unwrap();
        assert_eq!(attrs.get("state"), Some("off"));
    }

    #[test]
    fn truthy_text() {
        for value in ["true", "True", "1", " 12 ", "-1"] {
            assert!(is_truthy(value), "{value}");
        }
        for value in ["false", "0", "", "yes", "1.5"] {
            assert!(!is_truthy(value), "{value}");
        }
    }

    #[test]
    fn typed_reads_default_to_zero() {
        let attrs = store(&[
            ("flag", "TRUE"),
            ("off", "false"),
            ("count", "7"),
            ("level", "-3"),
            ("ratio", "0.25"),
            ("junk", "abc"),
        ]);
        assert!(attrs.is("flag"));
        assert!(!attrs.is("off"));
        assert!(attrs.is("count"));
        assert!(!attrs.is("junk"));
        assert!(!attrs.is("missing"));
        assert_eq!(attrs.get_unsigned("count"), 7);
        assert_eq!(attrs.get_unsigned("level"), 0);
        assert_eq!(attrs.get_int("level"), -3);
        assert_eq!(attrs.get_float("ratio"), 0.25);
        assert_eq!(attrs.get_float("missing"), 0.0);
    }
}
