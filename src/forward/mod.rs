//! Turns an inbound request plus a minted token into the request sent upstream.

pub mod filter;
pub mod reply;
pub mod stream;

use bytes::Bytes;
use reqwest::{Method, Url};
use reqwest::header::{AUTHORIZATION, HOST, HeaderMap, HeaderName, HeaderValue};
use tracing::debug;

use crate::error::{ProxyError, Result};
use crate::upstream::OutboundRequest;

pub use filter::{FilterRule, RequestFilter};
pub use reply::{ErrorBody, ErrorReply};
pub use stream::{ChunkSink, RelayOutcome, RelaySummary, SinkClosed, forward_stream_chunk};

pub const DEFAULT_BASE_URL: &str = "https://flow.ciandt.com/flow-llm-proxy";
pub const DEFAULT_HOST: &str = "flow.ciandt.com";

/// Response headers that must not be relayed back to the client.
pub const SKIPPED_RESPONSE_HEADERS: [&str; 2] = ["connection", "transfer-encoding"];

/// A parsed inbound request. Every part is optional because the transport may not supply it.
#[derive(Clone, Debug, Default)]
pub struct ProxyRequest {
    pub method: Option<String>,
    pub path: Option<String>,
    pub headers: Option<HeaderMap>,
    pub body: Option<Bytes>,
}

impl ProxyRequest {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: Some(method.into()),
            path: Some(path.into()),
            headers: Some(HeaderMap::new()),
            body: None,
        }
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers
            .get_or_insert_with(HeaderMap::new)
            .append(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Single normalized value for `name`; see [`header_value`].
    pub fn header(&self, name: &str) -> Option<String> {
        self.headers
            .as_ref()
            .and_then(|headers| header_value(headers, name))
    }
}

/// Returns one string for a header however many times it was sent: values are trimmed,
/// non-text values are skipped and repeats are joined with `", "`.
pub fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let values: Vec<&str> = headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .collect();
    (!values.is_empty()).then(|| values.join(", "))
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpstreamTarget {
    pub base_url: String,
    pub host: String,
}

impl Default for UpstreamTarget {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            host: DEFAULT_HOST.to_string(),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct Forwarder {
    target: UpstreamTarget,
    filter: RequestFilter,
}

impl Forwarder {
    pub fn new(target: UpstreamTarget, filter: RequestFilter) -> Self {
        Self { target, filter }
    }

    pub fn target(&self) -> &UpstreamTarget {
        &self.target
    }

    pub fn filter(&self) -> &RequestFilter {
        &self.filter
    }

    /// Method and path must both be present and non-blank.
    pub fn validate_request(&self, request: &ProxyRequest) -> Result<()> {
        if request
            .method
            .as_deref()
            .is_none_or(|method| method.trim().is_empty())
        {
            return Err(ProxyError::MissingMethod);
        }
        if request
            .path
            .as_deref()
            .is_none_or(|path| path.trim().is_empty())
        {
            return Err(ProxyError::MissingPath);
        }
        if let Some(path) = request.path.as_deref() {
            self.check_absolute_target(path.trim())?;
        }
        Ok(())
    }

    /// Absolute-form targets must point at the upstream origin; anything else would carry the
    /// minted bearer to a host the client picked.
    fn check_absolute_target(&self, target: &str) -> Result<()> {
        if !(target.starts_with("http://") || target.starts_with("https://")) {
            return Ok(());
        }
        let requested = Url::parse(target)
            .map_err(|err| ProxyError::invalid_input(format!("invalid target URL: {err}")))?;
        let upstream = Url::parse(&self.target.base_url).map_err(|err| {
            ProxyError::invalid_input(format!("invalid upstream base URL: {err}"))
        })?;
        if requested.origin() != upstream.origin() {
            return Err(ProxyError::invalid_input(format!(
                "target {} is not the upstream origin",
                requested.origin().ascii_serialization()
            )));
        }
        Ok(())
    }

    /// Replaces every `Authorization` header with one bearer value and points `Host` upstream.
    /// Applying it twice gives the same headers as applying it once.
    pub fn rewrite_headers(
        &self,
        mut request: ProxyRequest,
        token: &str,
        credential_label: &str,
    ) -> Result<ProxyRequest> {
        let token = token.trim();
        if token.is_empty() {
            return Err(ProxyError::invalid_input("token cannot be empty"));
        }
        let headers = request
            .headers
            .as_mut()
            .ok_or_else(|| ProxyError::invalid_input("request has no headers"))?;

        let mut bearer = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|_| ProxyError::invalid_input("token is not a valid header value"))?;
        bearer.set_sensitive(true);
        let host = HeaderValue::from_str(&self.target.host)
            .map_err(|_| ProxyError::invalid_input("upstream host is not a valid header value"))?;

        // HeaderMap keys are case-insensitive, so this drops every spelling and repeat.
        headers.remove(AUTHORIZATION);
        headers.insert(AUTHORIZATION, bearer);
        headers.insert(HOST, host);

        debug!(credential = %credential_label, "rewrote authentication headers");
        Ok(request)
    }

    /// Prefixes the upstream base URL onto `path`. Absolute `http(s)://` targets pass through
    /// only when they already point at the upstream origin.
    pub fn target_url(&self, path: &str) -> Result<String> {
        let path = path.trim();
        if path.is_empty() {
            return Err(ProxyError::invalid_input("path cannot be empty"));
        }
        if path.starts_with("http://") || path.starts_with("https://") {
            self.check_absolute_target(path)?;
            return Ok(path.to_string());
        }

        let base = self.target.base_url.trim_end_matches('/');
        let mut out = String::with_capacity(base.len() + path.len() + 1);
        out.push_str(base);
        if !path.starts_with('/') {
            out.push('/');
        }
        out.push_str(path);
        Ok(out)
    }

    /// Builds the outbound request: applies the first matching filter rule, drops hop-by-hop
    /// and client auth headers, rewrites auth, and resolves the upstream URL.
    pub fn prepare_outbound(
        &self,
        request: ProxyRequest,
        token: &str,
        credential_label: &str,
    ) -> Result<OutboundRequest> {
        self.validate_request(&request)?;
        let method_text = request.method.as_deref().unwrap_or_default().trim();
        let method = Method::from_bytes(method_text.to_ascii_uppercase().as_bytes())
            .map_err(|_| ProxyError::invalid_input(format!("invalid HTTP method: {method_text}")))?;
        let inbound_headers = request
            .headers
            .clone()
            .ok_or_else(|| ProxyError::invalid_input("request has no headers"))?;
        let path = request.path.clone().unwrap_or_default();

        let rule = self
            .filter
            .find_matching_rule(method.as_str(), &path, &inbound_headers);
        let (path, body) = match rule {
            Some(rule) => (
                filter::filter_query_params(&path, &rule.query_params),
                request
                    .body
                    .clone()
                    .map(|body| filter::filter_body_params(body, &rule.body_fields)),
            ),
            None => (path, request.body.clone()),
        };

        let skip = filter::headers_to_skip(rule);
        let mut headers = HeaderMap::with_capacity(inbound_headers.len());
        for (name, value) in &inbound_headers {
            if skip.iter().any(|skipped| skipped == name.as_str()) {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }

        let rewritten = self.rewrite_headers(
            ProxyRequest {
                method: request.method,
                path: Some(path.clone()),
                headers: Some(headers),
                body,
            },
            token,
            credential_label,
        )?;

        Ok(OutboundRequest {
            method,
            url: self.target_url(&path)?,
            headers: rewritten.headers.unwrap_or_default(),
            body: rewritten.body,
        })
    }
}

/// Copies upstream response headers minus the hop-by-hop ones.
pub fn response_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(upstream.len());
    for (name, value) in upstream {
        if SKIPPED_RESPONSE_HEADERS.contains(&name.as_str()) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    fn forwarder() -> Forwarder {
        Forwarder::new(
            UpstreamTarget {
                base_url: "https://upstream.test/base/".to_string(),
                host: "upstream.test".to_string(),
            },
            RequestFilter::default(),
        )
    }

    fn authorization_values(request: &ProxyRequest) -> Vec<String> {
        request
            .headers
            .as_ref()
            .expect("headers")
            .get_all(AUTHORIZATION)
            .iter()
            .map(|value| value.to_str().expect("ascii").to_string())
            .collect()
    }

    #[test]
    fn rewrite_replaces_authorization_regardless_of_case() -> Result<()> {
        let mut headers = HeaderMap::new();
        headers.append(
            HeaderName::from_static("authorization"),
            HeaderValue::from_static("Bearer client-key"),
        );
        headers.append(
            HeaderName::from_bytes(b"AUTHORIZATION").expect("name"),
            HeaderValue::from_static("Basic abc"),
        );
        let request = ProxyRequest {
            headers: Some(headers),
            ..ProxyRequest::new("POST", "/v1/chat")
        };

        let once = forwarder().rewrite_headers(request, "tok-1", "primary")?;
        let twice = forwarder().rewrite_headers(once.clone(), "tok-1", "primary")?;

        assert_eq!(authorization_values(&once), vec!["Bearer tok-1"]);
        assert_eq!(authorization_values(&twice), vec!["Bearer tok-1"]);
        assert_eq!(twice.header("host").as_deref(), Some("upstream.test"));
        Ok(())
    }

    #[test]
    fn rewrite_rejects_blank_token_and_missing_headers() {
        let err = forwarder()
            .rewrite_headers(ProxyRequest::new("GET", "/"), "   ", "primary")
            .unwrap_err();
        assert!(matches!(err, ProxyError::InvalidInput { .. }));

        let headerless = ProxyRequest {
            headers: None,
            ..ProxyRequest::new("GET", "/")
        };
        let err = forwarder()
            .rewrite_headers(headerless, "tok", "primary")
            .unwrap_err();
        assert!(matches!(err, ProxyError::InvalidInput { .. }));
    }

    #[test]
    fn target_url_inserts_missing_slash() -> Result<()> {
        let forwarder = forwarder();
        assert_eq!(
            forwarder.target_url("/v1/messages")?,
            "https://upstream.test/base/v1/messages"
        );
        assert_eq!(
            forwarder.target_url("v1/messages?x=1")?,
            "https://upstream.test/base/v1/messages?x=1"
        );
        assert_eq!(
            forwarder.target_url("https://upstream.test/base/v1")?,
            "https://upstream.test/base/v1"
        );
        assert!(forwarder.target_url("").is_err());
        Ok(())
    }

    #[test]
    fn absolute_target_on_foreign_origin_is_rejected() {
        let forwarder = forwarder();
        for target in [
            "http://attacker.example/collect",
            "http://upstream.test/base/v1",
            "https://upstream.test:8443/base/v1",
        ] {
            assert!(
                matches!(
                    forwarder.target_url(target),
                    Err(ProxyError::InvalidInput { .. })
                ),
                "{target}"
            );
            assert!(matches!(
                forwarder.validate_request(&ProxyRequest::new("GET", target)),
                Err(ProxyError::InvalidInput { .. })
            ));
        }
    }

    #[test]
    fn validate_request_requires_method_and_path() {
        let forwarder = forwarder();
        let no_method = ProxyRequest {
            method: None,
            ..ProxyRequest::new("GET", "/")
        };
        let blank_path = ProxyRequest::new("GET", " ");
        assert!(matches!(
            forwarder.validate_request(&no_method),
            Err(ProxyError::MissingMethod)
        ));
        assert!(matches!(
            forwarder.validate_request(&blank_path),
            Err(ProxyError::MissingPath)
        ));
        assert!(forwarder.validate_request(&ProxyRequest::new("GET", "/")).is_ok());
    }

    #[test]
    fn header_value_normalizes_repeats() {
        let mut headers = HeaderMap::new();
        headers.append("accept", HeaderValue::from_static(" text/plain "));
        headers.append("accept", HeaderValue::from_static("application/json"));
        assert_eq!(
            header_value(&headers, "Accept").as_deref(),
            Some("text/plain, application/json")
        );
        assert_eq!(header_value(&headers, "x-missing"), None);
    }

    #[test]
    fn prepare_outbound_applies_anthropic_rule() -> Result<()> {
        let request = ProxyRequest::new("post", "/v1/messages")
            .with_header(
                HeaderName::from_static("anthropic-version"),
                HeaderValue::from_static("2023-06-01"),
            )
            .with_header(
                HeaderName::from_static("anthropic-beta"),
                HeaderValue::from_static("context-management-2025-06-27"),
            )
            .with_header(
                HeaderName::from_static("authorization"),
                HeaderValue::from_static("Bearer client-key"),
            )
            .with_header(
                HeaderName::from_static("content-length"),
                HeaderValue::from_static("64"),
            )
            .with_body(
                json!({"model": "claude", "context_management": {"edits": []}}).to_string(),
            );

        let outbound = forwarder().prepare_outbound(request, "tok-9", "primary")?;

        assert_eq!(outbound.method, Method::POST);
        assert_eq!(outbound.url, "https://upstream.test/base/v1/messages");
        assert!(outbound.headers.get("anthropic-beta").is_none());
        assert!(outbound.headers.get("content-length").is_none());
        assert_eq!(
            header_value(&outbound.headers, "anthropic-version").as_deref(),
            Some("2023-06-01")
        );
        assert_eq!(
            header_value(&outbound.headers, "authorization").as_deref(),
            Some("Bearer tok-9")
        );
        let body: Value = serde_json::from_slice(outbound.body.as_deref().expect("body"))
            .expect("json body");
        assert_eq!(body, json!({"model": "claude"}));
        Ok(())
    }

    #[test]
    fn response_headers_drop_hop_by_hop() {
        let mut upstream = HeaderMap::new();
        upstream.insert("connection", HeaderValue::from_static("keep-alive"));
        upstream.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        upstream.insert("content-type", HeaderValue::from_static("text/event-stream"));

        let headers = response_headers(&upstream);
        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key("content-type"));
    }
}
