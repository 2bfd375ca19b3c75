//! Per-API request rewriting rules applied before a request leaves for the upstream.

use bytes::Bytes;
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Headers never copied from the inbound request onto the outbound one.
pub const ALWAYS_SKIPPED_HEADERS: [&str; 5] = [
    "host",
    "connection",
    "content-length",
    "authorization",
    "transfer-encoding",
];

/// One filtering rule. A rule matches when every non-empty predicate holds.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterRule {
    pub name: String,
    #[serde(default)]
    pub path_prefix: Option<String>,
    /// Upper-case HTTP methods; empty matches any method.
    #[serde(default)]
    pub methods: Vec<String>,
    /// The rule applies only if at least one of these headers is present; empty skips the check.
    #[serde(default)]
    pub any_header: Vec<String>,
    #[serde(default)]
    pub query_params: Vec<String>,
    #[serde(default)]
    pub body_fields: Vec<String>,
    #[serde(default)]
    pub headers: Vec<String>,
}

impl FilterRule {
    /// Strips `context_management` and `anthropic-beta` from Anthropic Messages API calls.
    pub fn anthropic_messages() -> Self {
        Self {
            name: "Anthropic Messages API".to_string(),
            path_prefix: Some("/v1/messages".to_string()),
            methods: Vec::new(),
            any_header: vec![
                "anthropic-version".to_string(),
                "anthropic-beta".to_string(),
                "x-api-key".to_string(),
            ],
            query_params: Vec::new(),
            body_fields: vec!["context_management".to_string()],
            headers: vec!["anthropic-beta".to_string()],
        }
    }

    pub fn matches(&self, method: &str, path: &str, headers: &HeaderMap) -> bool {
        let base_path = path.split_once('?').map_or(path, |(base, _)| base);
        if let Some(prefix) = self.path_prefix.as_deref() {
            if !base_path.starts_with(prefix) {
                return false;
            }
        }
        if !self.methods.is_empty()
            && !self
                .methods
                .iter()
                .any(|candidate| candidate.eq_ignore_ascii_case(method))
        {
            return false;
        }
        if !self.any_header.is_empty()
            && !self
                .any_header
                .iter()
                .any(|name| headers.contains_key(name.to_ascii_lowercase().as_str()))
        {
            return false;
        }
        true
    }
}

/// Ordered rule list; the first matching rule wins and later rules are ignored.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestFilter {
    rules: Vec<FilterRule>,
}

impl Default for RequestFilter {
    fn default() -> Self {
        Self::new(vec![FilterRule::anthropic_messages()])
    }
}

impl RequestFilter {
    pub fn new(rules: Vec<FilterRule>) -> Self {
        Self { rules }
    }

    /// Built-in rules followed by `extra`.
    pub fn with_extra_rules(extra: impl IntoIterator<Item = FilterRule>) -> Self {
        let mut filter = Self::default();
        filter.rules.extend(extra);
        filter
    }

    pub fn rules(&self) -> &[FilterRule] {
        &self.rules
    }

    pub fn find_matching_rule(
        &self,
        method: &str,
        path: &str,
        headers: &HeaderMap,
    ) -> Option<&FilterRule> {
        let rule = self
            .rules
            .iter()
            .find(|rule| rule.matches(method, path, headers))?;
        debug!(rule = %rule.name, "matched filter rule");
        Some(rule)
    }
}

/// Removes the named query parameters (case-insensitive) and rebuilds the path.
pub fn filter_query_params(path: &str, names: &[String]) -> String {
    let Some((base, query)) = path.split_once('?') else {
        return path.to_string();
    };
    if names.is_empty() {
        return path.to_string();
    }

    let kept: Vec<&str> = query
        .split('&')
        .filter(|pair| {
            let key = pair.split_once('=').map_or(*pair, |(key, _)| key);
            !names.iter().any(|name| name.eq_ignore_ascii_case(key))
        })
        .collect();

    let filtered = if kept.is_empty() {
        base.to_string()
    } else {
        format!("{base}?{}", kept.join("&"))
    };
    if filtered != path {
        debug!(from = %path, to = %filtered, "filtered query params");
    }
    filtered
}

/// Removes top-level fields from a JSON object body. Anything else is returned unchanged.
pub fn filter_body_params(body: Bytes, fields: &[String]) -> Bytes {
    if body.is_empty() || fields.is_empty() {
        return body;
    }
    let mut value = match serde_json::from_slice::<Value>(&body) {
        Ok(value) => value,
        Err(err) => {
            debug!(error = %err, "body is not JSON; forwarding unchanged");
            return body;
        }
    };
    let Some(object) = value.as_object_mut() else {
        return body;
    };

    let mut removed = false;
    for field in fields {
        if object.remove(field).is_some() {
            debug!(field = %field, "filtered body field");
            removed = true;
        }
    }
    if !removed {
        return body;
    }

    match serde_json::to_vec(&value) {
        Ok(filtered) => {
            debug!(before = body.len(), after = filtered.len(), "filtered request body");
            Bytes::from(filtered)
        }
        Err(_) => body,
    }
}

/// Lower-case header names dropped from the outbound request.
pub fn headers_to_skip(rule: Option<&FilterRule>) -> Vec<String> {
    let mut skip: Vec<String> = ALWAYS_SKIPPED_HEADERS
        .iter()
        .map(|name| (*name).to_string())
        .collect();
    if let Some(rule) = rule {
        skip.extend(rule.headers.iter().map(|name| name.to_ascii_lowercase()));
    }
    skip
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;
    use serde_json::json;

    fn names(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    fn anthropic_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("anthropic-version", HeaderValue::from_static("2023-06-01"));
        headers
    }

    #[test]
    fn query_filter_is_case_insensitive_and_rejoins() {
        assert_eq!(
            filter_query_params("/v1/x?Beta=true&keep=1&flag", &names(&["beta"])),
            "/v1/x?keep=1&flag"
        );
        assert_eq!(
            filter_query_params("/v1/x?beta=1&FLAG", &names(&["beta", "flag"])),
            "/v1/x"
        );
        assert_eq!(filter_query_params("/v1/x", &names(&["beta"])), "/v1/x");
        assert_eq!(filter_query_params("/v1/x?a=1", &[]), "/v1/x?a=1");
    }

    #[test]
    fn body_filter_removes_fields_from_objects_only() {
        let body = Bytes::from(
            json!({"model": "m", "context_management": {"edits": []}}).to_string(),
        );
        let filtered = filter_body_params(body, &names(&["context_management"]));
        let value: Value = serde_json::from_slice(&filtered).expect("json");
        assert_eq!(value, json!({"model": "m"}));

        let array = Bytes::from_static(b"[1,2]");
        assert_eq!(
            filter_body_params(array.clone(), &names(&["x"])),
            array
        );
    }

    #[test]
    fn body_filter_returns_original_on_parse_failure() {
        let body = Bytes::from_static(b"{not json");
        assert_eq!(
            filter_body_params(body.clone(), &names(&["context_management"])),
            body
        );
    }

    #[test]
    fn body_without_listed_fields_is_untouched() {
        let body = Bytes::from_static(b"{ \"model\" : \"m\" }");
        assert_eq!(filter_body_params(body.clone(), &names(&["other"])), body);
    }

    #[test]
    fn anthropic_rule_requires_path_and_header() {
        let filter = RequestFilter::default();
        assert!(
            filter
                .find_matching_rule("POST", "/v1/messages?beta=true", &anthropic_headers())
                .is_some()
        );
        assert!(
            filter
                .find_matching_rule("POST", "/v1/messages", &HeaderMap::new())
                .is_none()
        );
        assert!(
            filter
                .find_matching_rule("POST", "/v1/chat/completions", &anthropic_headers())
                .is_none()
        );
    }

    #[test]
    fn first_matching_rule_wins() {
        let broad = FilterRule {
            name: "broad".to_string(),
            path_prefix: Some("/v1".to_string()),
            headers: names(&["x-first"]),
            ..FilterRule::default()
        };
        let narrow = FilterRule {
            name: "narrow".to_string(),
            path_prefix: Some("/v1/messages".to_string()),
            headers: names(&["x-second"]),
            ..FilterRule::default()
        };
        let filter = RequestFilter::new(vec![broad, narrow]);
        let rule = filter
            .find_matching_rule("POST", "/v1/messages", &HeaderMap::new())
            .expect("rule");
        assert_eq!(rule.name, "broad");

        let skip = headers_to_skip(Some(rule));
        assert!(skip.contains(&"x-first".to_string()));
        assert!(!skip.contains(&"x-second".to_string()));
    }

    #[test]
    fn method_predicate_is_case_insensitive() {
        let rule = FilterRule {
            name: "posts".to_string(),
            methods: names(&["POST"]),
            ..FilterRule::default()
        };
        assert!(rule.matches("post", "/anything", &HeaderMap::new()));
        assert!(!rule.matches("GET", "/anything", &HeaderMap::new()));
    }

    #[test]
    fn rules_deserialize_from_toml() {
        let rule: FilterRule = toml::from_str(
            r#"
            name = "strip-debug"
            path_prefix = "/v1/chat"
            query_params = ["debug"]
            "#,
        )
        .expect("rule");
        assert_eq!(rule.query_params, names(&["debug"]));
        assert!(rule.body_fields.is_empty());
    }
}
