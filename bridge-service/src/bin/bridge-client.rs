//! Demo client: one call of every shape against a running bridge-service

use anyhow::{Context, Result};
use bridge_core::config::{get_config, get_config_opt, load_environment};
use bridge_rpc::grpc::{CallOptions, ClientTls, RpcClient, RpcClientConfig, TokenCredentials};
use bridge_rpc::hello::{HelloClient, HelloRequest, HelloResponse};
use bridge_rpc::JwtIssuer;
use clap::Parser;
use futures::StreamExt;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

const NAMES: [&str; 3] = ["孙悟空", "齐天大圣", "弼马温"];

#[derive(Parser, Debug)]
#[command(name = "bridge-client")]
#[command(about = "Exercise the hello.v1 services over gRPC and HTTP")]
struct Args {
    /// gRPC endpoint
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    grpc_endpoint: String,

    /// HTTP gateway base URL
    #[arg(long, default_value = "http://127.0.0.1:8081")]
    http_endpoint: String,

    /// CA certificate to trust for the gRPC endpoint
    #[arg(long)]
    ca: Option<PathBuf>,

    /// Subject id sent as `uid` and signed into the token
    #[arg(long, default_value = "1234")]
    uid: String,

    /// Username claim
    #[arg(long, default_value = "hello")]
    username: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    load_environment();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("bridge_client=info".parse()?),
        )
        .init();

    let args = Args::parse();

    let secret = get_config("BRIDGE_JWT_SECRET", "change-me");
    let mut issuer = JwtIssuer::new(secret.as_bytes());
    if let Some(name) = get_config_opt("BRIDGE_JWT_ISSUER") {
        issuer = issuer.with_issuer(name);
    }
    let token = issuer.issue(&args.uid, Some(&args.username))?;
    info!(uid = %args.uid, "Issued token");

    say_message_http(&args, &token).await?;

    let mut config = RpcClientConfig::new(args.grpc_endpoint.clone());
    if let Some(ca) = &args.ca {
        let ca_pem = std::fs::read(ca).with_context(|| format!("reading {}", ca.display()))?;
        config = config.with_tls(ClientTls {
            ca_pem,
            domain: None,
        });
    }
    let rpc = RpcClient::connect(config)
        .await
        .with_context(|| format!("connecting to {}", args.grpc_endpoint))?
        .with_credentials(TokenCredentials::new(args.uid.clone(), token));
    let client = HelloClient::new(rpc);

    let reply = client
        .say_message(CallOptions::default(), HelloRequest::new("test", "收到请求"))
        .await?;
    info!(name = %reply.name, message = %reply.message, "SayMessage over gRPC");

    let (reply, _) = client
        .say_hello(CallOptions::default(), HelloRequest::new("鲁迪", "ok"))
        .await?;
    info!(name = %reply.name, message = %reply.message, "SayHello");

    let one_second = CallOptions::default().with_timeout(Duration::from_secs(1));
    let mut replies = client
        .lots_of_replies(one_second.clone(), HelloRequest::new("鲁迪", "ok"))
        .await?;
    while let Some(reply) = replies.next().await {
        let reply = reply?;
        info!(name = %reply.name, "LotsOfReplies");
    }

    let reply = client
        .lots_of_greetings(one_second, NAMES.map(|name| HelloRequest::new(name, "")))
        .await?;
    info!(name = %reply.name, "LotsOfGreetings");

    let requests = futures::stream::iter(NAMES.map(|name| HelloRequest::new(name, ""))).boxed();
    let mut echoes = client
        .bidi_hello(
            CallOptions::default().with_timeout(Duration::from_secs(120)),
            requests,
        )
        .await?;
    while let Some(echo) = echoes.next().await {
        let echo = echo?;
        info!(name = %echo.name, "BidiHello");
    }

    Ok(())
}

async fn say_message_http(args: &Args, token: &str) -> Result<()> {
    let url = format!("{}/v1/greeter/sayMessage", args.http_endpoint.trim_end_matches('/'));
    let response = reqwest::Client::new()
        .post(&url)
        .bearer_auth(token)
        .header("Grpc-Metadata-Uid", &args.uid)
        .json(&HelloRequest::new("test", "收到请求"))
        .send()
        .await
        .with_context(|| format!("POST {}", url))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        anyhow::bail!("sayMessage over HTTP failed with {}: {}", status, body);
    }
    let reply: HelloResponse = response.json().await?;
    info!(name = %reply.name, message = %reply.message, "SayMessage over HTTP");
    Ok(())
}
