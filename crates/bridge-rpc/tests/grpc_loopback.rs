//! End-to-end calls over a loopback tonic server

use async_trait::async_trait;
use bridge_core::{CallContext, CallDescriptor, CallShape, Code, MessageType, Metadata, Result};
use bridge_rpc::grpc::{CallOptions, GrpcServer, GrpcServerConfig, RpcClient, RpcClientConfig, TokenCredentials};
use bridge_rpc::hello::{
    register_gateway_service, register_hello_service, GatewayService, GatewayServiceServer,
    HelloClient, HelloRequest, HelloResponse, HelloService, HelloServiceServer, HelloStream,
};
use bridge_rpc::{
    AuthInterceptor, Dispatcher, InterceptorChain, JwtIssuer, JwtVerifier, LoggingInterceptor,
    MemorySink, ServiceRegistry, TokenAuthenticator, CLIENT_OS,
};
use chrono::{Duration as ChronoDuration, Utc};
use futures::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

const SECRET: &[u8] = b"loopback-secret";

struct Greeter;

#[async_trait]
impl HelloService for Greeter {
    async fn say_hello(&self, ctx: &mut CallContext, request: HelloRequest) -> Result<HelloResponse> {
        ctx.header_mut().insert("x-greeter", "loopback");
        let os = ctx
            .inbound()
            .and_then(|md| md.get_first(CLIENT_OS))
            .unwrap_or("unknown")
            .to_string();
        Ok(HelloResponse::new(request.name, os))
    }

    async fn lots_of_replies(&self, request: HelloRequest, stream: &mut HelloStream<'_>) -> Result<()> {
        for word in ["a", "b", "c"] {
            stream
                .send(HelloResponse::new(format!("{}-{}", request.name, word), ""))
                .await?;
        }
        Ok(())
    }

    async fn lots_of_greetings(&self, stream: &mut HelloStream<'_>) -> Result<HelloResponse> {
        let mut names = String::new();
        while let Some(request) = stream.recv().await? {
            names.push_str(&request.name);
        }
        Ok(HelloResponse::new(names, ""))
    }

    async fn bidi_hello(&self, stream: &mut HelloStream<'_>) -> Result<()> {
        while let Some(request) = stream.recv().await? {
            stream
                .send(HelloResponse::new(request.name, request.message))
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl GatewayService for Greeter {
    async fn say_message(&self, _ctx: &mut CallContext, request: HelloRequest) -> Result<HelloResponse> {
        Ok(HelloResponse::new(request.name, request.message))
    }
}

struct Running {
    addr: SocketAddr,
    _shutdown: oneshot::Sender<()>,
}

async fn start(chain: InterceptorChain) -> Running {
    let greeter = Arc::new(Greeter);
    let mut registry = ServiceRegistry::new();
    register_hello_service(&mut registry, greeter.clone()).expect("register hello");
    register_gateway_service(&mut registry, greeter).expect("register gateway");
    let dispatcher = Dispatcher::new(registry, chain);

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    let server = GrpcServer::new(GrpcServerConfig::default());
    tokio::spawn(async move {
        server
            .serve_with_listener(
                listener,
                move |builder| {
                    builder
                        .add_service(HelloServiceServer::new(dispatcher.clone()))
                        .add_service(GatewayServiceServer::new(dispatcher))
                },
                async {
                    let _ = shutdown_rx.await;
                },
            )
            .await
            .expect("serve");
    });

    Running {
        addr,
        _shutdown: shutdown_tx,
    }
}

async fn client(addr: SocketAddr) -> RpcClient {
    RpcClient::connect(RpcClientConfig::new(format!("http://{}", addr)))
        .await
        .expect("connect")
}

#[tokio::test]
async fn test_every_call_shape_over_grpc() {
    let running = start(InterceptorChain::default()).await;
    let hello = HelloClient::new(client(running.addr).await);

    let (reply, header) = hello
        .say_hello(CallOptions::default(), HelloRequest::new("bob", "hi"))
        .await
        .expect("say hello");
    assert_eq!(reply.name, "bob");
    assert_eq!(reply.message, std::env::consts::OS);
    assert_eq!(header.get_first("x-greeter"), Some("loopback"));

    let replies: Vec<String> = hello
        .lots_of_replies(CallOptions::default(), HelloRequest::new("x", ""))
        .await
        .expect("lots of replies")
        .map(|item| item.expect("reply").name)
        .collect()
        .await;
    assert_eq!(replies, ["x-a", "x-b", "x-c"]);

    let greeting = hello
        .lots_of_greetings(
            CallOptions::default(),
            ["a", "b", "c"].map(|name| HelloRequest::new(name, "")),
        )
        .await
        .expect("lots of greetings");
    assert_eq!(greeting.name, "abc");

    let requests = futures::stream::iter((0..5).map(|i| HelloRequest::new(i.to_string(), "m"))).boxed();
    let echoed: Vec<String> = hello
        .bidi_hello(CallOptions::default(), requests)
        .await
        .expect("bidi")
        .map(|item| item.expect("echo").name)
        .collect()
        .await;
    assert_eq!(echoed, ["0", "1", "2", "3", "4"]);

    let message = hello
        .say_message(CallOptions::default(), HelloRequest::new("gw", "ping"))
        .await
        .expect("say message");
    assert_eq!(message.message, "ping");
}

#[tokio::test]
async fn test_unknown_method_is_unimplemented() {
    let running = start(InterceptorChain::default()).await;
    let rpc = client(running.addr).await;

    let missing = CallDescriptor::new(
        "hello.v1.HelloService",
        "Missing",
        CallShape::Unary,
        MessageType::of::<HelloRequest>(),
        MessageType::of::<HelloResponse>(),
    );
    let err = rpc
        .unary(&missing, CallOptions::default(), Box::new(HelloRequest::default()))
        .await
        .expect_err("unknown method");
    assert_eq!(err.code(), Code::Unimplemented);
}

#[tokio::test]
async fn test_token_checked_before_handler() {
    let sink = Arc::new(MemorySink::new());
    let authenticator = TokenAuthenticator::new(Arc::new(JwtVerifier::new(SECRET)));
    let chain = InterceptorChain::builder()
        .both(LoggingInterceptor::new(sink.clone()))
        .both(AuthInterceptor::new(authenticator).with_sink(sink.clone()))
        .build();
    let running = start(chain).await;
    let rpc = client(running.addr).await;

    // No token at all
    let anonymous = HelloClient::new(rpc.clone());
    let err = anonymous
        .say_hello(CallOptions::default(), HelloRequest::new("anon", ""))
        .await
        .expect_err("missing token");
    assert_eq!(err.code(), Code::Unauthenticated);

    // Expired token carries the violation back to the client
    let expired = JwtIssuer::new(SECRET)
        .with_ttl(ChronoDuration::minutes(5))
        .issue_at("1001", None, Utc::now() - ChronoDuration::hours(1))
        .expect("issue");
    let stale = HelloClient::new(rpc.clone().with_credentials(TokenCredentials::new("1001", expired)));
    let err = stale
        .lots_of_greetings(CallOptions::default(), [HelloRequest::new("a", "")])
        .await
        .expect_err("expired token");
    assert_eq!(err.code(), Code::Unauthenticated);
    let status = err.to_status();
    assert_eq!(status.details.len(), 1);
    assert_eq!(status.details[0].subject, "token expired");
    assert_eq!(status.details[0].description, "please use a new token");

    // A fresh token from the same secret is accepted
    let token = JwtIssuer::new(SECRET).issue("1001", Some("wukong")).expect("issue");
    let authed = HelloClient::new(rpc.with_credentials(TokenCredentials::new("1001", token)));
    let mut metadata = Metadata::new();
    metadata.insert("x-request", "1");
    let (reply, _) = authed
        .say_hello(CallOptions::default().with_metadata(metadata), HelloRequest::new("ok", ""))
        .await
        .expect("authenticated call");
    assert_eq!(reply.name, "ok");

    let rejected = sink
        .events()
        .iter()
        .filter(|event| matches!(event, bridge_rpc::CallEvent::AuthRejected { .. }))
        .count();
    assert_eq!(rejected, 2);
}
