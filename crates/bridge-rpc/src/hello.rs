//! `hello.v1` services
//!
//! Message types, service traits, registration and a typed client for
//! `hello.v1.HelloService` and `hello.v1.GatewayService`. Implementations
//! live in the service binary.

use crate::grpc::{CallOptions, ClientStream, GrpcService, RpcClient, ServiceName};
use crate::handler::{ServerStream, StreamHandler, TypedStream, UnaryHandler};
use crate::registry::{RegistryError, ServiceRegistry};
use async_trait::async_trait;
use bridge_core::{
    CallContext, CallDescriptor, CallShape, Code, DynMessage, Error, MessageType, Metadata, Result,
};
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const HELLO_SERVICE: &str = "hello.v1.HelloService";
pub const GATEWAY_SERVICE: &str = "hello.v1.GatewayService";

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct HelloRequest {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub message: String,
}

impl HelloRequest {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct HelloResponse {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub message: String,
}

impl HelloResponse {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

/// Method descriptors
pub mod methods {
    use super::*;

    fn hello(service: &str, method: &str, shape: CallShape) -> CallDescriptor {
        CallDescriptor::new(
            service,
            method,
            shape,
            MessageType::of::<HelloRequest>(),
            MessageType::of::<HelloResponse>(),
        )
    }

    pub fn say_hello() -> CallDescriptor {
        hello(HELLO_SERVICE, "SayHello", CallShape::Unary)
    }

    pub fn lots_of_replies() -> CallDescriptor {
        hello(HELLO_SERVICE, "LotsOfReplies", CallShape::ServerStream)
    }

    pub fn lots_of_greetings() -> CallDescriptor {
        hello(HELLO_SERVICE, "LotsOfGreetings", CallShape::ClientStream)
    }

    pub fn bidi_hello() -> CallDescriptor {
        hello(HELLO_SERVICE, "BidiHello", CallShape::BidiStream)
    }

    pub fn say_message() -> CallDescriptor {
        hello(GATEWAY_SERVICE, "SayMessage", CallShape::Unary)
    }
}

pub type HelloStream<'a> = TypedStream<'a, HelloRequest, HelloResponse>;

#[async_trait]
pub trait HelloService: Send + Sync + 'static {
    async fn say_hello(&self, ctx: &mut CallContext, request: HelloRequest) -> Result<HelloResponse>;

    /// Send any number of responses for one request
    async fn lots_of_replies(&self, request: HelloRequest, stream: &mut HelloStream<'_>) -> Result<()>;

    /// Read requests until end of input and return the single response
    async fn lots_of_greetings(&self, stream: &mut HelloStream<'_>) -> Result<HelloResponse>;

    async fn bidi_hello(&self, stream: &mut HelloStream<'_>) -> Result<()>;
}

#[async_trait]
pub trait GatewayService: Send + Sync + 'static {
    async fn say_message(&self, ctx: &mut CallContext, request: HelloRequest) -> Result<HelloResponse>;
}

struct SayHello<S>(Arc<S>);
struct LotsOfReplies<S>(Arc<S>);
struct LotsOfGreetings<S>(Arc<S>);
struct BidiHello<S>(Arc<S>);
struct SayMessage<S>(Arc<S>);

#[async_trait]
impl<S: HelloService> UnaryHandler for SayHello<S> {
    async fn call(&self, ctx: &mut CallContext, request: DynMessage) -> Result<DynMessage> {
        let request = request.downcast::<HelloRequest>()?;
        Ok(Box::new(self.0.say_hello(ctx, request).await?))
    }
}

#[async_trait]
impl<S: HelloService> StreamHandler for LotsOfReplies<S> {
    async fn call(&self, stream: &mut dyn ServerStream) -> Result<()> {
        let mut stream = HelloStream::new(stream);
        let request = stream
            .recv()
            .await?
            .ok_or_else(|| Error::handler(Code::InvalidArgument, "missing request message"))?;
        self.0.lots_of_replies(request, &mut stream).await
    }
}

#[async_trait]
impl<S: HelloService> StreamHandler for LotsOfGreetings<S> {
    async fn call(&self, stream: &mut dyn ServerStream) -> Result<()> {
        let mut stream = HelloStream::new(stream);
        let response = self.0.lots_of_greetings(&mut stream).await?;
        stream.send_and_close(response).await
    }
}

#[async_trait]
impl<S: HelloService> StreamHandler for BidiHello<S> {
    async fn call(&self, stream: &mut dyn ServerStream) -> Result<()> {
        let mut stream = HelloStream::new(stream);
        self.0.bidi_hello(&mut stream).await
    }
}

#[async_trait]
impl<S: GatewayService> UnaryHandler for SayMessage<S> {
    async fn call(&self, ctx: &mut CallContext, request: DynMessage) -> Result<DynMessage> {
        let request = request.downcast::<HelloRequest>()?;
        Ok(Box::new(self.0.say_message(ctx, request).await?))
    }
}

pub fn register_hello_service<S: HelloService>(
    registry: &mut ServiceRegistry,
    service: Arc<S>,
) -> std::result::Result<(), RegistryError> {
    registry.register_unary(methods::say_hello(), SayHello(service.clone()))?;
    registry.register_stream(methods::lots_of_replies(), LotsOfReplies(service.clone()))?;
    registry.register_stream(methods::lots_of_greetings(), LotsOfGreetings(service.clone()))?;
    registry.register_stream(methods::bidi_hello(), BidiHello(service))?;
    Ok(())
}

pub fn register_gateway_service<S: GatewayService>(
    registry: &mut ServiceRegistry,
    service: Arc<S>,
) -> std::result::Result<(), RegistryError> {
    registry.register_unary(methods::say_message(), SayMessage(service))?;
    Ok(())
}

pub struct HelloServiceName;

impl ServiceName for HelloServiceName {
    const NAME: &'static str = HELLO_SERVICE;
}

pub struct GatewayServiceName;

impl ServiceName for GatewayServiceName {
    const NAME: &'static str = GATEWAY_SERVICE;
}

pub type HelloServiceServer = GrpcService<HelloServiceName>;
pub type GatewayServiceServer = GrpcService<GatewayServiceName>;

/// Typed responses of a streaming call
pub type HelloResponses = BoxStream<'static, Result<HelloResponse>>;

fn typed(stream: ClientStream) -> HelloResponses {
    stream
        .into_stream()
        .map(|item| item.and_then(|message| message.downcast::<HelloResponse>()))
        .boxed()
}

fn erase(requests: impl IntoIterator<Item = HelloRequest>) -> BoxStream<'static, DynMessage> {
    let requests: Vec<DynMessage> = requests
        .into_iter()
        .map(|request| Box::new(request) as DynMessage)
        .collect();
    futures::stream::iter(requests).boxed()
}

/// Client for both `hello.v1` services
#[derive(Debug, Clone)]
pub struct HelloClient {
    inner: RpcClient,
}

impl HelloClient {
    pub fn new(inner: RpcClient) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &RpcClient {
        &self.inner
    }

    /// Response plus the header metadata the server set
    pub async fn say_hello(
        &self,
        options: CallOptions,
        request: HelloRequest,
    ) -> Result<(HelloResponse, Metadata)> {
        let reply = self
            .inner
            .unary(&methods::say_hello(), options, Box::new(request))
            .await?;
        Ok((reply.message.downcast::<HelloResponse>()?, reply.header))
    }

    pub async fn lots_of_replies(
        &self,
        options: CallOptions,
        request: HelloRequest,
    ) -> Result<HelloResponses> {
        let stream = self
            .inner
            .server_streaming(&methods::lots_of_replies(), options, Box::new(request))
            .await?;
        Ok(typed(stream))
    }

    pub async fn lots_of_greetings(
        &self,
        options: CallOptions,
        requests: impl IntoIterator<Item = HelloRequest>,
    ) -> Result<HelloResponse> {
        let reply = self
            .inner
            .client_streaming(&methods::lots_of_greetings(), options, erase(requests))
            .await?;
        reply.message.downcast::<HelloResponse>()
    }

    pub async fn bidi_hello(
        &self,
        options: CallOptions,
        requests: BoxStream<'static, HelloRequest>,
    ) -> Result<HelloResponses> {
        let requests = requests
            .map(|request| Box::new(request) as DynMessage)
            .boxed();
        let stream = self
            .inner
            .streaming(&methods::bidi_hello(), options, requests)
            .await?;
        Ok(typed(stream))
    }

    pub async fn say_message(
        &self,
        options: CallOptions,
        request: HelloRequest,
    ) -> Result<HelloResponse> {
        let reply = self
            .inner
            .unary(&methods::say_message(), options, Box::new(request))
            .await?;
        reply.message.downcast::<HelloResponse>()
    }
}
