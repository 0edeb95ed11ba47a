//! rpc-bridge service
//!
//! Runs the hello.v1 gRPC services and the HTTP/JSON gateway in front of
//! them. With `--backend remote` only the gateway runs, forwarding to an
//! existing gRPC endpoint.

use anyhow::{bail, Context, Result};
use bridge_core::config::{get_config_opt, load_environment};
use bridge_http::{
    token_header_matcher, Gateway, HttpServer, LocalBackend, MiddlewareConfig, RemoteBackend,
    RouteTable, RpcBackend, TlsConfig,
};
use bridge_rpc::auth::SUBJECT_KEY;
use bridge_rpc::grpc::{ClientTls, GrpcServer, GrpcServerConfig, RpcClient, RpcClientConfig, TlsPem};
use bridge_rpc::hello::{
    register_gateway_service, register_hello_service, GatewayServiceServer, HelloServiceServer,
};
use bridge_rpc::{
    AuthInterceptor, Dispatcher, EventSink, InterceptorChain, JwtVerifier, LoggingInterceptor,
    RecoverInterceptor, ServiceRegistry, StreamObserver, SubjectPolicy, TokenAuthenticator,
    TracingSink, TOKEN_KEY,
};
use clap::Parser;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

mod hello;

use hello::Greeter;

#[derive(Parser, Debug)]
#[command(name = "bridge-service")]
#[command(about = "hello.v1 gRPC services with an HTTP/JSON gateway")]
struct Args {
    /// gRPC listen address
    #[arg(long, default_value = "0.0.0.0:8080")]
    grpc_addr: SocketAddr,

    /// HTTP gateway listen address (host:port)
    #[arg(long, default_value = "0.0.0.0:8081")]
    http_addr: String,

    /// Where gateway calls go
    #[arg(long, value_enum, default_value_t = Backend::Local)]
    backend: Backend,

    /// gRPC endpoint for `--backend remote`
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    remote_endpoint: String,

    /// CA certificate for the remote endpoint
    #[arg(long)]
    remote_ca: Option<PathBuf>,

    /// TLS certificate path
    #[arg(long)]
    tls_cert: Option<PathBuf>,

    /// TLS key path
    #[arg(long)]
    tls_key: Option<PathBuf>,

    /// Metadata key carrying the token
    #[arg(long, default_value = TOKEN_KEY)]
    token_key: String,

    /// Require `uid` metadata matching the token subject
    #[arg(long)]
    require_subject: bool,

    /// Turn token checks off
    #[arg(long)]
    no_auth: bool,

    /// Per-request timeout in seconds
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Log as JSON lines
    #[arg(long)]
    log_json: bool,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Backend {
    /// Serve gRPC here and dispatch gateway calls in-process
    Local,
    /// Gateway only, forwarding over gRPC
    Remote,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment from /etc/rpc-bridge/environment (if exists)
    load_environment();

    let args = Args::parse();
    init_tracing(args.log_json)?;

    let tls = match (&args.tls_cert, &args.tls_key) {
        (Some(cert), Some(key)) => Some((cert.clone(), key.clone())),
        (None, None) => None,
        _ => bail!("--tls-cert and --tls-key must be given together"),
    };
    let timeout = args.timeout_secs.map(Duration::from_secs);

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let mut middleware = MiddlewareConfig::default();
    if let Some(timeout) = timeout {
        middleware = middleware.timeout(Some(timeout));
    }

    let routes = RouteTable::hello_routes()?;
    let mut http = HttpServer::builder()
        .bind(&args.http_addr)
        .middleware(middleware);
    if let Some((cert, key)) = &tls {
        http = http.tls(TlsConfig::with_certs(cert, key));
    }

    match args.backend {
        Backend::Local => {
            let sink: Arc<dyn EventSink> = Arc::new(TracingSink);
            let chain = build_chain(&args, sink)?;

            let greeter = Arc::new(Greeter);
            let mut registry = ServiceRegistry::new();
            register_hello_service(&mut registry, greeter.clone())?;
            register_gateway_service(&mut registry, greeter)?;
            let dispatcher = Dispatcher::new(registry, chain);
            info!(methods = dispatcher.registry().len(), "Registered hello.v1 services");

            let mut grpc_config = GrpcServerConfig::default().with_address(args.grpc_addr);
            if let Some((cert, key)) = &tls {
                grpc_config = grpc_config.with_tls(TlsPem::from_files(cert, key)?);
            }
            if let Some(timeout) = timeout {
                grpc_config = grpc_config.with_timeout(timeout);
            }

            let backend: Arc<dyn RpcBackend> = Arc::new(LocalBackend::new(dispatcher.clone()));
            let http = http.router(gateway(&args, routes, backend).router()).build()?;

            let grpc = async {
                GrpcServer::new(grpc_config)
                    .serve(
                        move |builder| {
                            builder
                                .add_service(HelloServiceServer::new(dispatcher.clone()))
                                .add_service(GatewayServiceServer::new(dispatcher))
                        },
                        shutdown_signal(&shutdown_tx),
                    )
                    .await
                    .context("gRPC server failed")
            };
            let gateway = async {
                http.serve(shutdown_signal(&shutdown_tx))
                    .await
                    .context("HTTP gateway failed")
            };

            tokio::try_join!(grpc, gateway, wait_for_ctrl_c(&shutdown_tx))?;
        }
        Backend::Remote => {
            if !args.no_auth {
                info!("Token checks are left to the remote service");
            }
            let mut config = RpcClientConfig::new(args.remote_endpoint.clone());
            if let Some(ca) = &args.remote_ca {
                let ca_pem = std::fs::read(ca)
                    .with_context(|| format!("reading {}", ca.display()))?;
                config = config.with_tls(ClientTls {
                    ca_pem,
                    domain: None,
                });
            }
            if let Some(timeout) = timeout {
                config = config.with_request_timeout(timeout);
            }
            let client = RpcClient::connect_lazy(config)?.with_sink(Arc::new(TracingSink));
            info!(endpoint = %args.remote_endpoint, "Forwarding gateway calls");

            let backend: Arc<dyn RpcBackend> = Arc::new(RemoteBackend::new(client));
            let http = http.router(gateway(&args, routes, backend).router()).build()?;

            let gateway = async {
                http.serve(shutdown_signal(&shutdown_tx))
                    .await
                    .context("HTTP gateway failed")
            };
            tokio::try_join!(gateway, wait_for_ctrl_c(&shutdown_tx))?;
        }
    }

    info!("Stopped");
    Ok(())
}

fn init_tracing(json: bool) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("bridge_service=info".parse()?)
        .add_directive("bridge_rpc=info".parse()?)
        .add_directive("bridge_http=info".parse()?)
        .add_directive("tower_http=debug".parse()?);

    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}

/// Recover, logging, per-message observation and token checks, outermost first
fn build_chain(args: &Args, sink: Arc<dyn EventSink>) -> Result<InterceptorChain> {
    let mut builder = InterceptorChain::builder()
        .both(RecoverInterceptor)
        .both(LoggingInterceptor::new(sink.clone()))
        .stream(StreamObserver::new(sink.clone()));

    if args.no_auth {
        warn!("Token checks disabled");
        return Ok(builder.build());
    }

    let Some(secret) = get_config_opt("BRIDGE_JWT_SECRET") else {
        bail!("BRIDGE_JWT_SECRET is not set (use --no-auth to run without token checks)");
    };
    let mut verifier = JwtVerifier::new(secret.as_bytes());
    if let Some(issuer) = get_config_opt("BRIDGE_JWT_ISSUER") {
        verifier = verifier.with_issuer(&issuer);
    }

    let mut authenticator = TokenAuthenticator::new(Arc::new(verifier)).with_key(&args.token_key);
    if args.require_subject {
        authenticator = authenticator.with_subject_policy(SubjectPolicy::RequireMatch {
            key: SUBJECT_KEY.to_string(),
        });
    }
    builder = builder.both(AuthInterceptor::new(authenticator).with_sink(sink));
    Ok(builder.build())
}

fn gateway(args: &Args, routes: RouteTable, backend: Arc<dyn RpcBackend>) -> Gateway {
    Gateway::new(routes, backend).with_header_matcher(token_header_matcher(&args.token_key))
}

fn shutdown_signal(tx: &broadcast::Sender<()>) -> impl Future<Output = ()> + Send + 'static {
    let mut rx = tx.subscribe();
    async move {
        let _ = rx.recv().await;
    }
}

async fn wait_for_ctrl_c(tx: &broadcast::Sender<()>) -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("listening for ctrl-c")?;
    info!("Shutting down");
    let _ = tx.send(());
    Ok(())
}
