use url::form_urlencoded;

/// Decoded query parameters of an inbound request, in arrival order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Parameters {
    pairs: Vec<(String, String)>,
}

impl Parameters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses `a=b&c=d`, with or without the leading `?`.
    pub fn parse(query: &str) -> Self {
        let query = query.strip_prefix('?').unwrap_or(query);
        Self {
            pairs: form_urlencoded::parse(query.as_bytes())
                .map(|(key, value)| (key.into_owned(), value.into_owned()))
                .collect(),
        }
    }

    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.pairs.push((key.to_string(), value.to_string()));
        self
    }

    /// First value for `key`, if present and non-empty.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
            .filter(|value| !value.is_empty())
    }

    pub fn has(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn get_bool(&self, key: &str) -> bool {
        self.get(key)
            .is_some_and(|value| value.eq_ignore_ascii_case("true"))
    }

    pub fn get_unsigned(&self, key: &str) -> u64 {
        self.get(key)
            .and_then(|value| value.trim().parse().ok())
            .unwrap_or(0)
    }

    pub fn get_int(&self, key: &str) -> i64 {
        self.get(key)
            .and_then(|value| value.trim().parse().ok())
            .unwrap_or(0)
    }

    pub fn get_float(&self, key: &str) -> f32 {
        self.get(key)
            .and_then(|value| value.trim().parse().ok())
            .unwrap_or(0.0)
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.iter().all(|(_, value)| value.is_empty())
    }

    /// Re-encodes the non-empty parameters as `?a=b&c=d`, or an empty string.
    pub fn as_query(&self) -> String {
        let mut serializer = form_urlencoded::Serializer::new(String::new());
        for (key, value) in self.pairs.iter().filter(|(_, value)| !value.is_empty()) {
            serializer.append_pair(key, value);
        }
        let encoded = serializer.finish();
        if encoded.is_empty() {
            encoded
        } else {
            format!("?{encoded}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_and_keeps_order() {
        let params = Parameters::parse("?state=true&name=Back%20porch&flash=");
        assert_eq!(params.get("name"), Some("Back porch"));
        assert!(params.get_bool("state"));
        assert!(!params.has("flash"));
        assert_eq!(params.as_query(), "?state=true&name=Back+porch");
    }

    #[test]
    fn numeric_reads_default_to_zero() {
        let params = Parameters::parse("momentary=500&level=abc&value=21.25&offset=-4");
        assert_eq!(params.get_unsigned("momentary"), 500);
        assert_eq!(params.get_unsigned("level"), 0);
        assert_eq!(params.get_unsigned("missing"), 0);
        assert_eq!(params.get_int("offset"), -4);
        assert_eq!(params.get_float("value"), 21.25);
    }

    #[test]
    fn bool_is_case_insensitive_true_only() {
        let params = Parameters::parse("a=TRUE&b=1&c=false");
        assert!(params.get_bool("a"));
        assert!(!params.get_bool("b"));
        assert!(!params.get_bool("c"));
    }

    #[test]
    fn empty_query_encodes_to_nothing() {
        assert!(Parameters::parse("").is_empty());
        assert_eq!(Parameters::parse("?a=").as_query(), "");
        assert_eq!(Parameters::new().with("toggle", "true").as_query(), "?toggle=true");
    }
}
