//! HTTP client side: sends prepared requests and exposes the response body as a chunk stream.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use tracing::debug;

use crate::error::{ForwardFailure, ProxyError, Result};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(600);

/// A fully prepared request: absolute URL, rewritten headers, filtered body.
#[derive(Clone, Debug)]
pub struct OutboundRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: BoxStream<'static, std::result::Result<Bytes, ForwardFailure>>,
}

impl std::fmt::Debug for UpstreamResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait Upstream: Send + Sync {
    async fn send(
        &self,
        request: OutboundRequest,
    ) -> std::result::Result<UpstreamResponse, ForwardFailure>;
}

#[derive(Clone, Debug)]
pub struct ReqwestUpstream {
    client: reqwest::Client,
}

impl ReqwestUpstream {
    pub fn new(connect_timeout: Duration, read_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .read_timeout(read_timeout)
            .build()
            .map_err(|err| ProxyError::Settings {
                reason: format!("upstream http client error: {err}"),
            })?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Upstream for ReqwestUpstream {
    async fn send(
        &self,
        request: OutboundRequest,
    ) -> std::result::Result<UpstreamResponse, ForwardFailure> {
        let OutboundRequest {
            method,
            url,
            headers,
            body,
        } = request;
        debug!(method = %method, url = %url, "sending upstream request");

        let mut req = self.client.request(method, url).headers(headers);
        if let Some(body) = body {
            req = req.body(body);
        }
        let response = req.send().await?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes_stream()
            .map(|item| item.map_err(ForwardFailure::from))
            .boxed();
        Ok(UpstreamResponse {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ForwardFailureKind;
    use crate::utils::test_support::should_skip_httpmock;
    use httpmock::prelude::*;

    #[tokio::test]
    async fn streams_response_body() -> Result<()> {
        if should_skip_httpmock() {
            return Ok(());
        }
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/chat")
                    .header("authorization", "Bearer tok");
                then.status(201)
                    .header("content-type", "text/plain")
                    .body("hello");
            })
            .await;

        let upstream = ReqwestUpstream::new(DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT)?;
        let mut headers = HeaderMap::new();
        headers.insert(
            "authorization",
            reqwest::header::HeaderValue::from_static("Bearer tok"),
        );
        let mut response = upstream
            .send(OutboundRequest {
                method: Method::POST,
                url: format!("{}/v1/chat", server.base_url()),
                headers,
                body: Some(Bytes::from_static(b"{}")),
            })
            .await?;

        let mut collected = Vec::new();
        while let Some(chunk) = response.body.next().await {
            collected.extend_from_slice(&chunk?);
        }
        mock.assert_async().await;
        assert_eq!(response.status, StatusCode::CREATED);
        assert_eq!(collected, b"hello");
        Ok(())
    }

    #[tokio::test]
    async fn connection_refused_is_network_failure() -> Result<()> {
        if should_skip_httpmock() {
            return Ok(());
        }
        let port = std::net::TcpListener::bind(("127.0.0.1", 0))
            .and_then(|listener| listener.local_addr())
            .map(|addr| addr.port())
            .expect("free port");
        let upstream = ReqwestUpstream::new(Duration::from_secs(2), DEFAULT_READ_TIMEOUT)?;

        let err = upstream
            .send(OutboundRequest {
                method: Method::GET,
                url: format!("http://127.0.0.1:{port}/"),
                headers: HeaderMap::new(),
                body: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind, ForwardFailureKind::Network);
        Ok(())
    }
}
