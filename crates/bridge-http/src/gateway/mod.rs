//! HTTP/JSON gateway
//!
//! Every request is matched against the [`RouteTable`]; the bound call
//! descriptor decides how the body is read and the response written:
//!
//! | Shape         | Request body              | Response body                  |
//! |---------------|---------------------------|--------------------------------|
//! | Unary         | one JSON object (or empty) | one JSON object               |
//! | ServerStream  | one JSON object (or empty) | `{"result": …}` frames        |
//! | ClientStream  | concatenated JSON objects | one JSON object                |
//! | BidiStream    | concatenated JSON objects | `{"result": …}` frames        |
//!
//! Errors raised before the first response byte become an HTTP status plus
//! `{"code", "message", "details"}`. Bidi over HTTP/1.1 is plain chunked
//! framing: the request body is read while responses are written, which
//! clients that wait for their upload to finish will not observe.

pub mod backend;
pub mod frames;
pub mod headers;
pub mod routes;

pub use backend::{LocalBackend, RemoteBackend, RpcBackend};
pub use frames::{ErrorBody, JsonFrameDecoder};
pub use headers::{default_header_matcher, token_header_matcher, HeaderMatcher};
pub use routes::{RouteError, RouteTable};

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use bridge_core::{
    CallContext, CallDescriptor, CancelGuard, CancelHandle, DynMessage, Error, Metadata, Result,
};
use bridge_rpc::StreamingCall;
use frames::{decode_request_stream, response_frames};
use futures::StreamExt;
use headers::append_response_metadata;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::debug;

/// Largest accepted body for single-request calls, and the largest single
/// message inside a streamed request body
pub const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

/// The gateway: routes, header matcher and backend, shared by all requests
#[derive(Clone)]
pub struct Gateway {
    routes: Arc<RouteTable>,
    backend: Arc<dyn RpcBackend>,
    matcher: HeaderMatcher,
}

impl Gateway {
    pub fn new(routes: RouteTable, backend: Arc<dyn RpcBackend>) -> Self {
        Self {
            routes: Arc::new(routes),
            backend,
            matcher: headers::default_matcher(),
        }
    }

    pub fn with_header_matcher(mut self, matcher: HeaderMatcher) -> Self {
        self.matcher = matcher;
        self
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    /// Axum router serving every bound route; anything else is a 404
    pub fn router(self) -> Router {
        Router::new().fallback(gateway_handler).with_state(self)
    }

    pub async fn handle(&self, request: Request) -> Response {
        let (parts, body) = request.into_parts();
        let descriptor = match self.routes.lookup(&parts.method, parts.uri.path()) {
            Ok(descriptor) => descriptor,
            Err(err) => {
                debug!(error = %err, "No gateway route");
                return error_response(&err);
            }
        };

        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0);
        let metadata = headers::incoming_metadata(&parts.headers, &self.matcher, peer);

        let cancel = CancelHandle::new();
        let mut ctx = CallContext::new(descriptor.clone(), cancel.token()).with_metadata(metadata);
        if let Some(peer) = peer {
            ctx = ctx.with_peer(peer);
        }
        let guard = cancel.guard();

        let shape = descriptor.shape;
        match (shape.client_streaming(), shape.server_streaming()) {
            (false, false) => self.unary(&descriptor, ctx, body).await,
            (false, true) => {
                let request = match read_single(&descriptor, body).await {
                    Ok(request) => request,
                    Err(err) => return error_response(&err),
                };
                let incoming = futures::stream::iter([Ok(request)]).boxed();
                self.streaming(ctx, incoming, guard).await
            }
            (true, false) => {
                let incoming = decode_request_stream(body, descriptor.request);
                self.client_stream(ctx, incoming).await
            }
            (true, true) => {
                let incoming = decode_request_stream(body, descriptor.request);
                self.streaming(ctx, incoming, guard).await
            }
        }
    }

    async fn unary(&self, descriptor: &CallDescriptor, ctx: CallContext, body: Body) -> Response {
        let request = match read_single(descriptor, body).await {
            Ok(request) => request,
            Err(err) => return error_response(&err),
        };

        let outcome = self.backend.unary(ctx, request).await;
        match outcome.result {
            Ok(message) => {
                let mut response = message_response(&message);
                append_response_metadata(response.headers_mut(), &outcome.header, &outcome.trailer);
                response
            }
            Err(err) => {
                let mut response = error_response(&err);
                append_response_metadata(response.headers_mut(), &outcome.header, &outcome.trailer);
                response
            }
        }
    }

    /// Single response after the request stream ends
    async fn client_stream(
        &self,
        ctx: CallContext,
        incoming: futures::stream::BoxStream<'static, Result<DynMessage>>,
    ) -> Response {
        let StreamingCall {
            header,
            mut responses,
            trailer,
        } = match self.backend.streaming(ctx, incoming) {
            Ok(call) => call,
            Err(err) => return error_response(&err),
        };

        let first = responses.recv().await;
        let header = header.await.unwrap_or_default();
        let mut response = match first {
            Some(Ok(message)) => message_response(&message),
            Some(Err(err)) => error_response(&err),
            None => error_response(&Error::internal("call finished without a response")),
        };
        // Settled as soon as the handler returns
        let trailer = trailer.await.unwrap_or_default();
        append_response_metadata(response.headers_mut(), &header, &trailer);
        response
    }

    /// Streamed response; header metadata goes out before the first frame
    async fn streaming(
        &self,
        ctx: CallContext,
        incoming: futures::stream::BoxStream<'static, Result<DynMessage>>,
        guard: CancelGuard,
    ) -> Response {
        let StreamingCall {
            header,
            mut responses,
            trailer: _,
        } = match self.backend.streaming(ctx, incoming) {
            Ok(call) => call,
            Err(err) => return error_response(&err),
        };

        let header = header.await.unwrap_or_default();
        let first = match responses.recv().await {
            Some(Ok(message)) => message,
            Some(Err(err)) => {
                let mut response = error_response(&err);
                append_response_metadata(response.headers_mut(), &header, &Metadata::new());
                return response;
            }
            None => {
                let mut response = StatusCode::OK.into_response();
                append_response_metadata(response.headers_mut(), &header, &Metadata::new());
                return response;
            }
        };

        let body = Body::from_stream(response_frames(first, responses, guard));
        let mut response = Response::new(body);
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        append_response_metadata(response.headers_mut(), &header, &Metadata::new());
        response
    }
}

async fn gateway_handler(State(gateway): State<Gateway>, request: Request) -> Response {
    gateway.handle(request).await
}

/// Decode a single-request body; an empty body is the default message
async fn read_single(descriptor: &CallDescriptor, body: Body) -> Result<DynMessage> {
    let bytes = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| Error::decode(format!("reading request body: {}", e)))?;

    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(descriptor.request.default_message());
    }
    let value: serde_json::Value = serde_json::from_slice(&bytes)?;
    descriptor.request.decode_json(value)
}

fn message_response(message: &DynMessage) -> Response {
    match message.to_json() {
        Ok(value) => axum::Json(value).into_response(),
        Err(err) => error_response(&err),
    }
}

/// HTTP status from the error's code and a JSON error body
pub fn error_response(err: &Error) -> Response {
    let status = err.to_status();
    let code = StatusCode::from_u16(status.code.http_status())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (code, axum::Json(ErrorBody::from(&status))).into_response()
}
