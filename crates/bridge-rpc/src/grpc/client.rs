//! gRPC client over a tonic channel
//!
//! Every call carries the client's default metadata (`client-os`, optional
//! token credentials) underneath whatever the caller sets per call.

use super::codec::DynCodec;
use super::{append_metadata, from_metadata_map, from_tonic_status, TransportError};
use crate::interceptor::CLIENT_OS;
use crate::observe::{CallEvent, EventSink};
use bridge_core::{CallDescriptor, Code, DynMessage, Error, Metadata, Result};
use chrono::Utc;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error as ThisError;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint};
use tracing::{debug, info};

/// Per-RPC token credentials, sent as `uid` and `token` metadata
#[derive(Clone)]
pub struct TokenCredentials {
    pub uid: String,
    pub token: String,
}

impl TokenCredentials {
    pub fn new(uid: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            token: token.into(),
        }
    }

    fn apply(&self, metadata: &mut Metadata) {
        metadata.insert("uid", self.uid.clone());
        metadata.insert("token", self.token.clone());
    }
}

impl std::fmt::Debug for TokenCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCredentials")
            .field("uid", &self.uid)
            .field("token", &"[REDACTED]")
            .finish()
    }
}

/// Trust anchor for a TLS connection
#[derive(Debug, Clone)]
pub struct ClientTls {
    pub ca_pem: Vec<u8>,
    /// Name to verify the server certificate against, when it differs from
    /// the endpoint host
    pub domain: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RpcClientConfig {
    pub endpoint: String,
    pub connect_timeout: Duration,
    pub request_timeout: Option<Duration>,
    pub tls: Option<ClientTls>,
}

impl RpcClientConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            connect_timeout: Duration::from_secs(5),
            request_timeout: None,
            tls: None,
        }
    }

    pub fn with_tls(mut self, tls: ClientTls) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    fn endpoint(&self) -> std::result::Result<Endpoint, TransportError> {
        let mut endpoint = Endpoint::from_shared(self.endpoint.clone())
            .map_err(|e| TransportError::Endpoint(format!("{}: {}", self.endpoint, e)))?
            .connect_timeout(self.connect_timeout);

        if let Some(tls) = &self.tls {
            let mut tls_config =
                ClientTlsConfig::new().ca_certificate(Certificate::from_pem(&tls.ca_pem));
            if let Some(domain) = &tls.domain {
                tls_config = tls_config.domain_name(domain.clone());
            }
            endpoint = endpoint.tls_config(tls_config)?;
        }
        Ok(endpoint)
    }
}

/// Options for a single call
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub metadata: Metadata,
    pub timeout: Option<Duration>,
}

impl CallOptions {
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A failed call together with the metadata the server attached to the
/// status
#[derive(ThisError, Debug, Clone, PartialEq)]
#[error("{error}")]
pub struct ClientError {
    pub error: Error,
    pub metadata: Metadata,
}

impl ClientError {
    pub fn code(&self) -> Code {
        self.error.code()
    }
}

impl From<Error> for ClientError {
    fn from(error: Error) -> Self {
        Self {
            error,
            metadata: Metadata::new(),
        }
    }
}

impl From<tonic::Status> for ClientError {
    fn from(status: tonic::Status) -> Self {
        Self {
            error: Error::from(from_tonic_status(&status)),
            metadata: from_metadata_map(status.metadata()),
        }
    }
}

impl From<ClientError> for Error {
    fn from(err: ClientError) -> Self {
        err.error
    }
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;

/// Response of a single-response call
#[derive(Debug)]
pub struct ClientReply {
    pub message: DynMessage,
    pub header: Metadata,
}

/// Response side of a server- or bidi-streaming call
pub struct ClientStream {
    header: Metadata,
    inner: tonic::Streaming<DynMessage>,
    method: String,
    sink: Option<Arc<dyn EventSink>>,
}

impl ClientStream {
    pub fn header(&self) -> &Metadata {
        &self.header
    }

    /// Next response; `Ok(None)` once the server finished cleanly
    pub async fn message(&mut self) -> ClientResult<Option<DynMessage>> {
        let message = self.inner.message().await?;
        if let (Some(message), Some(sink)) = (&message, &self.sink) {
            sink.record(&CallEvent::MessageReceived {
                method: self.method.clone(),
                message_type: message.type_name(),
                at: Utc::now(),
            });
        }
        Ok(message)
    }

    /// Trailer metadata, available after the stream is drained
    pub async fn trailers(&mut self) -> ClientResult<Metadata> {
        let trailers = self.inner.trailers().await?;
        Ok(trailers.map(|map| from_metadata_map(&map)).unwrap_or_default())
    }

    /// Responses as a stream that ends after the first error
    pub fn into_stream(self) -> BoxStream<'static, Result<DynMessage>> {
        futures::stream::unfold(Some(self), |state| async move {
            let mut stream = state?;
            match stream.message().await {
                Ok(Some(message)) => Some((Ok(message), Some(stream))),
                Ok(None) => None,
                Err(err) => Some((Err(err.error), None)),
            }
        })
        .boxed()
    }
}

impl std::fmt::Debug for ClientStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientStream")
            .field("method", &self.method)
            .field("header", &self.header)
            .finish()
    }
}

/// Client for any registered method, addressed by descriptor
#[derive(Clone)]
pub struct RpcClient {
    channel: Channel,
    defaults: Metadata,
    timeout: Option<Duration>,
    sink: Option<Arc<dyn EventSink>>,
}

impl RpcClient {
    /// Wrap an existing channel. `client-os` is set from the running OS.
    pub fn new(channel: Channel) -> Self {
        let mut defaults = Metadata::new();
        defaults.insert(CLIENT_OS, std::env::consts::OS);
        Self {
            channel,
            defaults,
            timeout: None,
            sink: None,
        }
    }

    pub async fn connect(config: RpcClientConfig) -> std::result::Result<Self, TransportError> {
        info!(endpoint = %config.endpoint, "Connecting to gRPC server");
        let channel = config.endpoint()?.connect().await?;
        Ok(Self::new(channel).with_request_timeout(config.request_timeout))
    }

    /// Like [`connect`](Self::connect) but the connection is established on
    /// the first call
    pub fn connect_lazy(config: RpcClientConfig) -> std::result::Result<Self, TransportError> {
        debug!(endpoint = %config.endpoint, "Creating lazy gRPC channel");
        let channel = config.endpoint()?.connect_lazy();
        Ok(Self::new(channel).with_request_timeout(config.request_timeout))
    }

    pub fn with_credentials(mut self, credentials: TokenCredentials) -> Self {
        credentials.apply(&mut self.defaults);
        self
    }

    /// Default metadata sent on every call
    pub fn with_metadata(mut self, key: &str, value: impl Into<String>) -> Self {
        self.defaults.insert(key, value);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn defaults(&self) -> &Metadata {
        &self.defaults
    }

    /// Per-call metadata wins; defaults fill in keys the call did not set
    fn request<T>(&self, options: &CallOptions, message: T) -> tonic::Request<T> {
        let mut metadata = options.metadata.clone();
        for (key, values) in self.defaults.iter() {
            if !metadata.contains_key(key) {
                for value in values {
                    metadata.append(key, value.clone());
                }
            }
        }

        let mut request = tonic::Request::new(message);
        append_metadata(request.metadata_mut(), &metadata);
        if let Some(timeout) = options.timeout.or(self.timeout) {
            request.set_timeout(timeout);
        }
        request
    }

    async fn ready(&self, descriptor: &CallDescriptor) -> Result<(tonic::client::Grpc<Channel>, PathAndQuery)> {
        let path = descriptor
            .full_method()
            .parse::<PathAndQuery>()
            .map_err(|e| Error::internal(format!("invalid method path: {}", e)))?;

        let mut grpc = tonic::client::Grpc::new(self.channel.clone());
        grpc.ready().await.map_err(|e| {
            Error::handler(Code::Unavailable, format!("service was not ready: {}", e))
        })?;
        Ok((grpc, path))
    }

    fn record_sent(&self, descriptor: &CallDescriptor, message: &DynMessage) {
        if let Some(sink) = &self.sink {
            sink.record(&CallEvent::MessageSent {
                method: descriptor.full_method().to_string(),
                message_type: message.type_name(),
                at: Utc::now(),
            });
        }
    }

    fn record_received(&self, descriptor: &CallDescriptor, message: &DynMessage) {
        if let Some(sink) = &self.sink {
            sink.record(&CallEvent::MessageReceived {
                method: descriptor.full_method().to_string(),
                message_type: message.type_name(),
                at: Utc::now(),
            });
        }
    }

    /// Wrap the outgoing stream so the sink sees each message as it leaves
    fn observe_outgoing(
        &self,
        descriptor: &CallDescriptor,
        requests: BoxStream<'static, DynMessage>,
    ) -> BoxStream<'static, DynMessage> {
        match self.sink.clone() {
            Some(sink) => {
                let method = descriptor.full_method().to_string();
                requests
                    .inspect(move |message| {
                        sink.record(&CallEvent::MessageSent {
                            method: method.clone(),
                            message_type: message.type_name(),
                            at: Utc::now(),
                        })
                    })
                    .boxed()
            }
            None => requests,
        }
    }

    fn reply(&self, descriptor: &CallDescriptor, response: tonic::Response<DynMessage>) -> ClientReply {
        let header = from_metadata_map(response.metadata());
        let message = response.into_inner();
        self.record_received(descriptor, &message);
        ClientReply { message, header }
    }

    fn stream(
        &self,
        descriptor: &CallDescriptor,
        response: tonic::Response<tonic::Streaming<DynMessage>>,
    ) -> ClientStream {
        ClientStream {
            header: from_metadata_map(response.metadata()),
            inner: response.into_inner(),
            method: descriptor.full_method().to_string(),
            sink: self.sink.clone(),
        }
    }

    pub async fn unary(
        &self,
        descriptor: &CallDescriptor,
        options: CallOptions,
        message: DynMessage,
    ) -> ClientResult<ClientReply> {
        let (mut grpc, path) = self.ready(descriptor).await?;
        self.record_sent(descriptor, &message);
        let request = self.request(&options, message);
        let response = grpc
            .unary(request, path, DynCodec::new(descriptor.response))
            .await?;
        Ok(self.reply(descriptor, response))
    }

    pub async fn server_streaming(
        &self,
        descriptor: &CallDescriptor,
        options: CallOptions,
        message: DynMessage,
    ) -> ClientResult<ClientStream> {
        let (mut grpc, path) = self.ready(descriptor).await?;
        self.record_sent(descriptor, &message);
        let request = self.request(&options, message);
        let response = grpc
            .server_streaming(request, path, DynCodec::new(descriptor.response))
            .await?;
        Ok(self.stream(descriptor, response))
    }

    pub async fn client_streaming(
        &self,
        descriptor: &CallDescriptor,
        options: CallOptions,
        requests: BoxStream<'static, DynMessage>,
    ) -> ClientResult<ClientReply> {
        let (mut grpc, path) = self.ready(descriptor).await?;
        let request = self.request(&options, self.observe_outgoing(descriptor, requests));
        let response = grpc
            .client_streaming(request, path, DynCodec::new(descriptor.response))
            .await?;
        Ok(self.reply(descriptor, response))
    }

    pub async fn streaming(
        &self,
        descriptor: &CallDescriptor,
        options: CallOptions,
        requests: BoxStream<'static, DynMessage>,
    ) -> ClientResult<ClientStream> {
        let (mut grpc, path) = self.ready(descriptor).await?;
        let request = self.request(&options, self.observe_outgoing(descriptor, requests));
        let response = grpc
            .streaming(request, path, DynCodec::new(descriptor.response))
            .await?;
        Ok(self.stream(descriptor, response))
    }
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("defaults", &self.defaults.len())
            .field("timeout", &self.timeout)
            .finish()
    }
}
