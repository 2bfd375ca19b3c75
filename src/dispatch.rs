//! Per-request orchestration: validate, pick a credential, mint, rewrite, forward, stream back.

use std::fmt;
use std::sync::Arc;

use reqwest::StatusCode;
use serde::Serialize;
use tracing::{info, warn};

use crate::auth::token::{CacheStats, Token, TokenSource};
use crate::balancer::{BalancerStats, LoadBalancer};
use crate::credentials::CredentialRecord;
use crate::error::ProxyError;
use crate::forward::reply::ErrorReply;
use crate::forward::stream::{ChunkSink, RelayOutcome, RelaySummary, relay_stream};
use crate::forward::{Forwarder, ProxyRequest, response_headers};
use crate::upstream::{OutboundRequest, Upstream};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DispatchState {
    Start,
    Validated,
    CredentialSelected,
    TokenMinted,
    HeadersRewritten,
    Forwarded,
    StreamedBack,
    Rejected,
}

impl DispatchState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Validated => "validated",
            Self::CredentialSelected => "credential_selected",
            Self::TokenMinted => "token_minted",
            Self::HeadersRewritten => "headers_rewritten",
            Self::Forwarded => "forwarded",
            Self::StreamedBack => "streamed_back",
            Self::Rejected => "rejected",
        }
    }
}

impl fmt::Display for DispatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request that ended in `Rejected`. `at` is the last state reached before the rejection.
#[derive(Debug, thiserror::Error)]
#[error("request rejected at {at}: {error}")]
pub struct Rejection {
    pub at: DispatchState,
    #[source]
    pub error: ProxyError,
}

impl Rejection {
    fn new(at: DispatchState, error: ProxyError) -> Self {
        warn!(
            state = %at,
            code = %error.code(),
            error = %error,
            "request rejected"
        );
        Self { at, error }
    }

    pub fn state(&self) -> DispatchState {
        DispatchState::Rejected
    }

    pub fn reply(&self) -> ErrorReply {
        ErrorReply::from_error(&self.error).with_context("state", self.at.as_str())
    }
}

/// The outbound request after a successful run up to `HeadersRewritten`.
#[derive(Debug)]
pub struct Prepared {
    pub credential: Arc<CredentialRecord>,
    pub token: Token,
    pub outbound: OutboundRequest,
}

impl Prepared {
    pub fn state(&self) -> DispatchState {
        DispatchState::HeadersRewritten
    }
}

#[derive(Debug, Clone)]
pub struct Dispatched {
    pub credential: String,
    pub status: StatusCode,
    pub relay: RelaySummary,
}

impl Dispatched {
    /// `StreamedBack` once the upstream closed the body, otherwise `Forwarded`.
    pub fn state(&self) -> DispatchState {
        match self.relay.outcome {
            RelayOutcome::Completed => DispatchState::StreamedBack,
            RelayOutcome::ClientDisconnected | RelayOutcome::UpstreamFailed => {
                DispatchState::Forwarded
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    pub balancer: BalancerStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens: Option<CacheStats>,
}

/// Application-scoped service shared by every request handler.
#[derive(Clone)]
pub struct Dispatcher {
    balancer: Arc<LoadBalancer>,
    tokens: Arc<dyn TokenSource>,
    forwarder: Arc<Forwarder>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("balancer", &self.balancer.stats())
            .field("forwarder", &self.forwarder)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(
        balancer: Arc<LoadBalancer>,
        tokens: Arc<dyn TokenSource>,
        forwarder: Arc<Forwarder>,
    ) -> Self {
        Self {
            balancer,
            tokens,
            forwarder,
        }
    }

    pub fn balancer(&self) -> &Arc<LoadBalancer> {
        &self.balancer
    }

    pub fn forwarder(&self) -> &Arc<Forwarder> {
        &self.forwarder
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            balancer: self.balancer.stats(),
            tokens: self.tokens.cache_stats(),
        }
    }

    /// Runs the request up to `HeadersRewritten`. Nothing is sent anywhere.
    pub fn prepare(&self, request: ProxyRequest) -> Result<Prepared, Rejection> {
        self.forwarder
            .validate_request(&request)
            .map_err(|err| Rejection::new(DispatchState::Start, err))?;

        let credential = self
            .balancer
            .next()
            .map_err(|err| Rejection::new(DispatchState::Validated, err))?;

        let (credential, token) = self
            .mint_with_failover(credential)
            .map_err(|err| Rejection::new(DispatchState::CredentialSelected, err))?;

        let label = credential.label();
        let outbound = self
            .forwarder
            .prepare_outbound(request, &token.value, &label)
            .map_err(|err| Rejection::new(DispatchState::TokenMinted, err))?;

        Ok(Prepared {
            credential,
            token,
            outbound,
        })
    }

    /// Full run: prepare, send, then relay the response through `sink`.
    ///
    /// A rejection happens before anything is written to `sink`. Once the head is sent, the
    /// outcome is reported in [`Dispatched::relay`] instead.
    pub async fn run(
        &self,
        request: ProxyRequest,
        upstream: &dyn Upstream,
        sink: &mut dyn ChunkSink,
    ) -> Result<Dispatched, Rejection> {
        let prepared = self.prepare(request)?;
        let credential = prepared.credential.label();

        let response = upstream
            .send(prepared.outbound)
            .await
            .map_err(|err| Rejection::new(DispatchState::HeadersRewritten, err.into()))?;
        let status = response.status;
        info!(credential = %credential, status = status.as_u16(), "upstream responded");

        if sink
            .send_head(status, &response_headers(&response.headers))
            .await
            .is_err()
        {
            return Ok(Dispatched {
                credential,
                status,
                relay: RelaySummary {
                    bytes: 0,
                    chunks: 0,
                    outcome: RelayOutcome::ClientDisconnected,
                },
            });
        }

        let relay = relay_stream(response.body, sink).await;
        Ok(Dispatched {
            credential,
            status,
            relay,
        })
    }

    /// One mint, and on failure exactly one more on the next credential. Only the first
    /// credential is quarantined; a failing fallback stays in rotation.
    fn mint_with_failover(
        &self,
        credential: Arc<CredentialRecord>,
    ) -> crate::error::Result<(Arc<CredentialRecord>, Token)> {
        let first_err = match self.tokens.mint(&credential) {
            Ok(token) => return Ok((credential, token)),
            Err(err) => err,
        };
        warn!(
            credential = %credential.label(),
            error = %first_err,
            "token generation failed; quarantining and failing over"
        );
        self.balancer.quarantine(&credential);

        let exhausted = |last: ProxyError| ProxyError::FailoverExhausted {
            last: Box::new(last),
        };
        let fallback = self.balancer.next().map_err(exhausted)?;
        match self.tokens.mint(&fallback) {
            Ok(token) => {
                info!(credential = %fallback.label(), "failover succeeded");
                Ok((fallback, token))
            }
            Err(err) => {
                warn!(
                    credential = %fallback.label(),
                    error = %err,
                    "failover credential also failed"
                );
                Err(exhausted(err))
            }
        }
    }
}
