//! Demo implementations of the hello.v1 services

use async_trait::async_trait;
use bridge_core::{CallContext, Result};
use bridge_rpc::hello::{GatewayService, HelloRequest, HelloResponse, HelloService, HelloStream};
use tracing::info;

/// Greetings appended to the caller's name by `LotsOfReplies`
pub const REPLY_WORDS: [&str; 4] = ["你好", "hello", "こんにちは", "안녕하세요"];

/// Prefix of the `LotsOfGreetings` reply
pub const GREETING_PREFIX: &str = "你好：";

#[derive(Debug, Default, Clone, Copy)]
pub struct Greeter;

#[async_trait]
impl HelloService for Greeter {
    async fn say_hello(&self, _ctx: &mut CallContext, request: HelloRequest) -> Result<HelloResponse> {
        info!(name = %request.name, message = %request.message, "SayHello");
        Ok(HelloResponse::new(request.name, request.message))
    }

    async fn lots_of_replies(&self, request: HelloRequest, stream: &mut HelloStream<'_>) -> Result<()> {
        for word in REPLY_WORDS {
            stream
                .send(HelloResponse::new(format!("{}{}", request.name, word), ""))
                .await?;
        }
        Ok(())
    }

    async fn lots_of_greetings(&self, stream: &mut HelloStream<'_>) -> Result<HelloResponse> {
        let mut reply = GREETING_PREFIX.to_string();
        while let Some(request) = stream.recv().await? {
            reply.push_str(&request.name);
        }
        Ok(HelloResponse::new(reply, ""))
    }

    async fn bidi_hello(&self, stream: &mut HelloStream<'_>) -> Result<()> {
        while let Some(request) = stream.recv().await? {
            stream.send(HelloResponse::new(request.name, "")).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl GatewayService for Greeter {
    async fn say_message(&self, _ctx: &mut CallContext, request: HelloRequest) -> Result<HelloResponse> {
        info!(name = %request.name, message = %request.message, "SayMessage");
        Ok(HelloResponse::new(request.name, request.message))
    }
}
