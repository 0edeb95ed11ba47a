//! tonic service over the dispatcher
//!
//! [`GrpcService`] plays the part of a generated `*Server` type: it matches the
//! request path against the registry and hands the call to tonic's
//! `Grpc` helper for the method's shape.

use super::codec::DynCodec;
use super::{append_metadata, from_metadata_map, status_error, to_tonic_status, TransportError};
use crate::dispatch::{Dispatcher, StreamingCall};
use bridge_core::{
    CallContext, CallDescriptor, CallShape, CancelGuard, CancelHandle, DynMessage, Metadata,
    Result,
};
use futures::{Stream, StreamExt};
use std::convert::Infallible;
use std::future::Future;
use std::marker::PhantomData;
use std::net::SocketAddr;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::TcpListenerStream;
use tonic::body::BoxBody;
use tonic::codegen::{empty_body, http, Body, BoxFuture, Service, StdError};
use tonic::server::NamedService;
use tonic::transport::server::Router;
use tonic::transport::{Identity, Server, ServerTlsConfig};
use tracing::{debug, info};

/// Binds a [`GrpcService`] to one fully qualified protobuf service name
pub trait ServiceName: Send + Sync + 'static {
    const NAME: &'static str;
}

/// Serves every registered method of service `N`
pub struct GrpcService<N> {
    dispatcher: Dispatcher,
    _name: PhantomData<fn() -> N>,
}

impl<N: ServiceName> GrpcService<N> {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self {
            dispatcher,
            _name: PhantomData,
        }
    }

    fn descriptor(&self, path: &str) -> Option<Arc<CallDescriptor>> {
        self.dispatcher
            .descriptor(path)
            .filter(|descriptor| descriptor.service() == N::NAME)
    }
}

impl<N> Clone for GrpcService<N> {
    fn clone(&self) -> Self {
        Self {
            dispatcher: self.dispatcher.clone(),
            _name: PhantomData,
        }
    }
}

impl<N: ServiceName> NamedService for GrpcService<N> {
    const NAME: &'static str = N::NAME;
}

impl<N, B> Service<http::Request<B>> for GrpcService<N>
where
    N: ServiceName,
    B: Body + Send + 'static,
    B::Error: Into<StdError> + Send + 'static,
{
    type Response = http::Response<BoxBody>;
    type Error = Infallible;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<B>) -> Self::Future {
        let Some(descriptor) = self.descriptor(req.uri().path()) else {
            debug!(path = %req.uri().path(), "No gRPC method registered for path");
            return Box::pin(async { Ok(unimplemented_response()) });
        };

        let dispatcher = self.dispatcher.clone();
        Box::pin(async move {
            let mut grpc = tonic::server::Grpc::new(DynCodec::new(descriptor.request));
            let method = MethodSvc {
                dispatcher,
                descriptor: descriptor.clone(),
            };
            let response = match descriptor.shape {
                CallShape::Unary => grpc.unary(method, req).await,
                CallShape::ServerStream => grpc.server_streaming(method, req).await,
                CallShape::ClientStream => grpc.client_streaming(method, req).await,
                CallShape::BidiStream => grpc.streaming(method, req).await,
            };
            Ok(response)
        })
    }
}

/// `grpc-status: 12` with an empty body, as generated servers answer
/// unknown paths
fn unimplemented_response() -> http::Response<BoxBody> {
    let mut response = http::Response::new(empty_body());
    let headers = response.headers_mut();
    headers.insert("grpc-status", http::HeaderValue::from_static("12"));
    headers.insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("application/grpc"),
    );
    response
}

/// One method call; implements every tonic service shape so the path match
/// above can pick the right one.
struct MethodSvc {
    dispatcher: Dispatcher,
    descriptor: Arc<CallDescriptor>,
}

/// Build the call context from the tonic request. The guard cancels the call
/// when the response future or stream is dropped.
fn accept<T>(
    descriptor: Arc<CallDescriptor>,
    request: tonic::Request<T>,
) -> (CallContext, CancelGuard, T) {
    let peer = request.remote_addr();
    let metadata = from_metadata_map(request.metadata());
    let message = request.into_inner();

    let cancel = CancelHandle::new();
    let mut ctx = CallContext::new(descriptor, cancel.token()).with_metadata(metadata);
    if let Some(peer) = peer {
        ctx = ctx.with_peer(peer);
    }
    (ctx, cancel.guard(), message)
}

fn incoming(streaming: tonic::Streaming<DynMessage>) -> futures::stream::BoxStream<'static, Result<DynMessage>> {
    streaming.map(|item| item.map_err(status_error)).boxed()
}

fn respond<T>(message: T, header: &Metadata) -> tonic::Response<T> {
    let mut response = tonic::Response::new(message);
    append_metadata(response.metadata_mut(), header);
    response
}

impl MethodSvc {
    async fn unary(
        self,
        request: tonic::Request<DynMessage>,
    ) -> std::result::Result<tonic::Response<DynMessage>, tonic::Status> {
        let (ctx, _guard, message) = accept(self.descriptor, request);
        let outcome = self.dispatcher.unary(ctx, message).await;

        // gRPC has no separate unary trailer channel here; both ride on the header
        let mut metadata = outcome.header;
        metadata.join(outcome.trailer);
        match outcome.result {
            Ok(message) => Ok(respond(message, &metadata)),
            Err(err) => Err(to_tonic_status(&err.to_status(), &metadata)),
        }
    }

    async fn streaming(
        self,
        ctx: CallContext,
        guard: CancelGuard,
        requests: futures::stream::BoxStream<'static, Result<DynMessage>>,
    ) -> std::result::Result<tonic::Response<ResponseStream>, tonic::Status> {
        let StreamingCall {
            header,
            responses,
            trailer,
        } = self
            .dispatcher
            .streaming(ctx, requests)
            .map_err(|err| to_tonic_status(&err.to_status(), &Metadata::new()))?;

        // Resolves on the first response or when the handler finishes
        let header = header.await.unwrap_or_default();
        Ok(respond(
            ResponseStream {
                responses,
                trailer: Some(trailer),
                _guard: guard,
            },
            &header,
        ))
    }

    /// Client streaming: the single response (or the error) is the first
    /// item of the response channel.
    async fn collect_one(
        self,
        request: tonic::Request<tonic::Streaming<DynMessage>>,
    ) -> std::result::Result<tonic::Response<DynMessage>, tonic::Status> {
        let (ctx, guard, streaming) = accept(self.descriptor.clone(), request);
        let response = self.streaming(ctx, guard, incoming(streaming)).await?;
        let (header, mut stream, _) = response.into_parts();
        let header = from_metadata_map(&header);

        match stream.next().await {
            Some(Ok(message)) => Ok(respond(message, &header)),
            Some(Err(status)) => Err(status),
            None => Err(tonic::Status::internal("call finished without a response")),
        }
    }
}

impl tonic::server::UnaryService<DynMessage> for MethodSvc {
    type Response = DynMessage;
    type Future = BoxFuture<tonic::Response<Self::Response>, tonic::Status>;

    fn call(&mut self, request: tonic::Request<DynMessage>) -> Self::Future {
        let svc = self.fork();
        Box::pin(svc.unary(request))
    }
}

impl tonic::server::ServerStreamingService<DynMessage> for MethodSvc {
    type Response = DynMessage;
    type ResponseStream = ResponseStream;
    type Future = BoxFuture<tonic::Response<Self::ResponseStream>, tonic::Status>;

    fn call(&mut self, request: tonic::Request<DynMessage>) -> Self::Future {
        let svc = self.fork();
        Box::pin(async move {
            let (ctx, guard, message) = accept(svc.descriptor.clone(), request);
            let requests = futures::stream::once(async move { Ok(message) }).boxed();
            svc.streaming(ctx, guard, requests).await
        })
    }
}

impl tonic::server::ClientStreamingService<DynMessage> for MethodSvc {
    type Response = DynMessage;
    type Future = BoxFuture<tonic::Response<Self::Response>, tonic::Status>;

    fn call(&mut self, request: tonic::Request<tonic::Streaming<DynMessage>>) -> Self::Future {
        let svc = self.fork();
        Box::pin(svc.collect_one(request))
    }
}

impl tonic::server::StreamingService<DynMessage> for MethodSvc {
    type Response = DynMessage;
    type ResponseStream = ResponseStream;
    type Future = BoxFuture<tonic::Response<Self::ResponseStream>, tonic::Status>;

    fn call(&mut self, request: tonic::Request<tonic::Streaming<DynMessage>>) -> Self::Future {
        let svc = self.fork();
        Box::pin(async move {
            let (ctx, guard, streaming) = accept(svc.descriptor.clone(), request);
            svc.streaming(ctx, guard, incoming(streaming)).await
        })
    }
}

impl MethodSvc {
    fn fork(&self) -> Self {
        Self {
            dispatcher: self.dispatcher.clone(),
            descriptor: self.descriptor.clone(),
        }
    }
}

/// Response side of a streaming call. A handler error becomes the final
/// status, carrying the trailer metadata set by the handler.
pub struct ResponseStream {
    responses: mpsc::Receiver<Result<DynMessage>>,
    trailer: Option<oneshot::Receiver<Metadata>>,
    _guard: CancelGuard,
}

impl Stream for ResponseStream {
    type Item = std::result::Result<DynMessage, tonic::Status>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.responses.poll_recv(cx) {
            Poll::Ready(Some(Ok(message))) => Poll::Ready(Some(Ok(message))),
            Poll::Ready(Some(Err(err))) => {
                let trailer = self
                    .trailer
                    .take()
                    .and_then(|mut rx| rx.try_recv().ok())
                    .unwrap_or_default();
                Poll::Ready(Some(Err(to_tonic_status(&err.to_status(), &trailer))))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// PEM-encoded server certificate chain and key
#[derive(Clone)]
pub struct TlsPem {
    pub cert: Vec<u8>,
    pub key: Vec<u8>,
}

impl TlsPem {
    pub fn from_files(cert: &Path, key: &Path) -> std::result::Result<Self, TransportError> {
        let cert = std::fs::read(cert)
            .map_err(|e| TransportError::Tls(format!("reading {}: {}", cert.display(), e)))?;
        let key = std::fs::read(key)
            .map_err(|e| TransportError::Tls(format!("reading {}: {}", key.display(), e)))?;
        Ok(Self { cert, key })
    }
}

impl std::fmt::Debug for TlsPem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsPem")
            .field("cert_len", &self.cert.len())
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// gRPC listener configuration
#[derive(Debug, Clone)]
pub struct GrpcServerConfig {
    pub address: SocketAddr,
    pub tls: Option<TlsPem>,
    pub timeout: Option<Duration>,
    pub max_concurrent_streams: Option<u32>,
}

impl Default for GrpcServerConfig {
    fn default() -> Self {
        Self {
            address: SocketAddr::from(([0, 0, 0, 0], 50051)),
            tls: None,
            timeout: None,
            max_concurrent_streams: None,
        }
    }
}

impl GrpcServerConfig {
    pub fn with_address(mut self, address: SocketAddr) -> Self {
        self.address = address;
        self
    }

    pub fn with_tls(mut self, tls: TlsPem) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn builder(&self) -> std::result::Result<Server, TransportError> {
        let mut server = Server::builder().max_concurrent_streams(self.max_concurrent_streams);
        if let Some(timeout) = self.timeout {
            server = server.timeout(timeout);
        }
        if let Some(tls) = &self.tls {
            let identity = Identity::from_pem(&tls.cert, &tls.key);
            server = server.tls_config(ServerTlsConfig::new().identity(identity))?;
        }
        Ok(server)
    }
}

/// Runs a tonic server; `mount` adds the services to serve
pub struct GrpcServer {
    config: GrpcServerConfig,
}

impl GrpcServer {
    pub fn new(config: GrpcServerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GrpcServerConfig {
        &self.config
    }

    pub async fn serve<M, F>(self, mount: M, shutdown: F) -> std::result::Result<(), TransportError>
    where
        M: FnOnce(&mut Server) -> Router,
        F: Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind(self.config.address).await?;
        self.serve_with_listener(listener, mount, shutdown).await
    }

    pub async fn serve_with_listener<M, F>(
        self,
        listener: TcpListener,
        mount: M,
        shutdown: F,
    ) -> std::result::Result<(), TransportError>
    where
        M: FnOnce(&mut Server) -> Router,
        F: Future<Output = ()> + Send,
    {
        let mut server = self.config.builder()?;
        let router = mount(&mut server);
        let local = listener.local_addr()?;

        if self.config.tls.is_some() {
            info!("Starting gRPC server on {} (TLS)", local);
        } else {
            info!("Starting gRPC server on {}", local);
        }

        router
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown)
            .await?;

        info!("gRPC server stopped");
        Ok(())
    }
}

