use std::io;

use async_trait::async_trait;
use axum::Json;
use axum::body::{Body, to_bytes};
use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{Instrument as _, error, info};

use super::GatewayState;
use crate::error::{ErrorCode, ForwardFailure};
use crate::forward::reply::ErrorReply;
use crate::forward::stream::{ChunkSink, SinkClosed};
use crate::forward::ProxyRequest;

const MAX_REQUEST_BODY_BYTES: usize = 32 * 1024 * 1024;
const BODY_CHANNEL_CAPACITY: usize = 16;

type BodyChunk = Result<Bytes, io::Error>;

/// Hands the response head to the waiting handler and body chunks to the client body stream.
struct ChannelSink {
    head: Option<oneshot::Sender<(StatusCode, HeaderMap)>>,
    body: mpsc::Sender<BodyChunk>,
}

#[async_trait]
impl ChunkSink for ChannelSink {
    async fn send_head(&mut self, status: StatusCode, headers: &HeaderMap) -> Result<(), SinkClosed> {
        let head = self.head.take().ok_or(SinkClosed)?;
        head.send((status, headers.clone())).map_err(|_| SinkClosed)
    }

    async fn send_chunk(&mut self, chunk: Bytes) -> Result<(), SinkClosed> {
        self.body.send(Ok(chunk)).await.map_err(|_| SinkClosed)
    }

    async fn abort(&mut self, failure: &ForwardFailure) {
        // An error item makes hyper reset the response instead of ending it cleanly.
        let _ = self
            .body
            .send(Err(io::Error::other(failure.to_string())))
            .await;
    }
}

pub(super) async fn handle_proxy(State(state): State<GatewayState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let body = match to_bytes(body, MAX_REQUEST_BODY_BYTES).await {
        Ok(body) => body,
        Err(err) => {
            return reply_response(
                ErrorReply::new(ErrorCode::RequestInvalidFormat)
                    .with_details(format!("failed to read request body: {err}")),
            );
        }
    };

    // Absolute-form targets (forward proxy use) keep their URL; everything else is a path.
    let target = if parts.uri.scheme().is_some() {
        parts.uri.to_string()
    } else {
        parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| parts.uri.path().to_string())
    };
    let span = tracing::info_span!(
        "flow_proxy.request",
        method = %parts.method,
        path = %parts.uri.path(),
    );
    let proxy_request = ProxyRequest {
        method: Some(parts.method.as_str().to_string()),
        path: Some(target),
        headers: Some(parts.headers),
        body: (!body.is_empty()).then_some(body),
    };

    let (head_tx, head_rx) = oneshot::channel();
    let (body_tx, mut body_rx) = mpsc::channel::<BodyChunk>(BODY_CHANNEL_CAPACITY);
    let dispatcher = state.dispatcher.clone();
    let upstream = state.upstream.clone();
    let task = tokio::spawn(
        async move {
            let mut sink = ChannelSink {
                head: Some(head_tx),
                body: body_tx,
            };
            let outcome = dispatcher
                .run(proxy_request, upstream.as_ref(), &mut sink)
                .await;
            if let Ok(dispatched) = &outcome {
                info!(
                    credential = %dispatched.credential,
                    status = dispatched.status.as_u16(),
                    bytes = dispatched.relay.bytes,
                    state = %dispatched.state(),
                    "request finished"
                );
            }
            outcome
        }
        .instrument(span),
    );

    match head_rx.await {
        Ok((status, headers)) => {
            let stream = futures_util::stream::poll_fn(move |cx| body_rx.poll_recv(cx));
            let mut response = Response::new(Body::from_stream(stream));
            *response.status_mut() = status;
            *response.headers_mut() = headers;
            response
        }
        // The sink was dropped without a head: the run was rejected or the task died.
        Err(_) => match task.await {
            Ok(Err(rejection)) => reply_response(rejection.reply()),
            Ok(Ok(_)) => reply_response(ErrorReply::new(ErrorCode::InternalUnexpectedError)),
            Err(err) => {
                error!(error = %err, "dispatch task failed");
                reply_response(ErrorReply::new(ErrorCode::InternalUnexpectedError))
            }
        },
    }
}

fn reply_response(reply: ErrorReply) -> Response {
    let status = StatusCode::from_u16(reply.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(reply.body)).into_response()
}
