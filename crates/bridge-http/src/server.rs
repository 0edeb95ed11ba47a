//! HTTP/HTTPS listener for the gateway

use crate::middleware::{apply_middleware, MiddlewareConfig};
use crate::tls::TlsConfig;
use crate::{Result, ServerError};
use axum::extract::ConnectInfo;
use axum::{Extension, Router};
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::info;

/// Server configuration
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Listen address
    pub bind: SocketAddr,
    /// Public hostname for logging/display
    pub public_host: String,
    /// TLS configuration
    pub tls: TlsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8080)),
            public_host: gethostname::gethostname().to_string_lossy().to_string(),
            tls: TlsConfig::default(),
        }
    }
}

/// Gateway HTTP server
pub struct HttpServer {
    config: ServerConfig,
    router: Router,
}

impl HttpServer {
    pub fn builder() -> HttpServerBuilder {
        HttpServerBuilder::new()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bind the configured address and serve until `shutdown` resolves
    pub async fn serve<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.config.bind)
            .await
            .map_err(ServerError::BindError)?;
        self.serve_with_listener(listener, shutdown).await
    }

    /// Serve on an already bound listener
    pub async fn serve_with_listener<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr().map_err(ServerError::BindError)?;
        let port = addr.port();

        match self.config.tls.build_acceptor()? {
            Some(acceptor) => {
                info!("Gateway listening on https://{}", addr);
                info!("Public URL: https://{}:{}", self.config.public_host, port);
                serve_tls(listener, acceptor, self.router, shutdown).await
            }
            None => {
                info!("Gateway listening on http://{}", addr);
                info!("Public URL: http://{}:{}", self.config.public_host, port);
                info!("TLS disabled - using HTTP only");

                axum::serve(
                    listener,
                    self.router
                        .into_make_service_with_connect_info::<SocketAddr>(),
                )
                .with_graceful_shutdown(shutdown)
                .await
                .map_err(ServerError::BindError)
            }
        }
    }
}

async fn serve_tls<F>(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    router: Router,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::pin!(shutdown);

    loop {
        let (stream, peer_addr) = tokio::select! {
            accepted = listener.accept() => accepted.map_err(ServerError::BindError)?,
            _ = &mut shutdown => {
                info!("Gateway shutting down");
                return Ok(());
            }
        };
        let acceptor = acceptor.clone();
        let router = router.clone().layer(Extension(ConnectInfo(peer_addr)));

        tokio::spawn(async move {
            match acceptor.accept(stream).await {
                Ok(tls_stream) => {
                    let io = TokioIo::new(tls_stream);
                    let service = TowerToHyperService::new(router);

                    if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                        tracing::debug!("Connection error from {}: {}", peer_addr, e);
                    }
                }
                Err(e) => {
                    tracing::debug!("TLS handshake error from {}: {}", peer_addr, e);
                }
            }
        });
    }
}

/// Builder for HttpServer
pub struct HttpServerBuilder {
    bind: String,
    public_host: Option<String>,
    tls_config: TlsConfig,
    router: Option<Router>,
    middleware_config: MiddlewareConfig,
}

impl HttpServerBuilder {
    pub fn new() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
            public_host: None,
            tls_config: TlsConfig::default(),
            router: None,
            middleware_config: MiddlewareConfig::default(),
        }
    }

    /// Listen address, `host:port`
    pub fn bind(mut self, addr: impl Into<String>) -> Self {
        self.bind = addr.into();
        self
    }

    pub fn public_host(mut self, host: impl Into<String>) -> Self {
        self.public_host = Some(host.into());
        self
    }

    /// Enable HTTPS with explicit certificate paths
    pub fn https(mut self, cert_path: impl Into<String>, key_path: impl Into<String>) -> Self {
        self.tls_config = TlsConfig::with_certs(cert_path.into(), key_path.into());
        self
    }

    pub fn tls(mut self, tls: TlsConfig) -> Self {
        self.tls_config = tls;
        self
    }

    pub fn router(mut self, router: Router) -> Self {
        self.router = Some(router);
        self
    }

    pub fn middleware(mut self, config: MiddlewareConfig) -> Self {
        self.middleware_config = config;
        self
    }

    pub fn build(self) -> Result<HttpServer> {
        let bind: SocketAddr = self.bind.parse().map_err(|_| {
            ServerError::BindError(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("Invalid bind address: {}", self.bind),
            ))
        })?;

        let router = apply_middleware(self.router.unwrap_or_default(), &self.middleware_config);

        let public_host = self
            .public_host
            .unwrap_or_else(|| gethostname::gethostname().to_string_lossy().to_string());

        let config = ServerConfig {
            bind,
            public_host,
            tls: self.tls_config,
        };

        Ok(HttpServer { config, router })
    }
}

impl Default for HttpServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;

    #[test]
    fn test_builder_parses_bind_address() {
        let server = HttpServer::builder()
            .bind("127.0.0.1:9090")
            .public_host("gateway.local")
            .build()
            .unwrap();
        assert_eq!(server.config().bind, SocketAddr::from(([127, 0, 0, 1], 9090)));
        assert_eq!(server.config().public_host, "gateway.local");
        assert!(!server.config().tls.is_enabled());
    }

    #[test]
    fn test_builder_rejects_bad_address() {
        let result = HttpServer::builder().bind("not-an-address").build();
        assert!(matches!(result, Err(ServerError::BindError(_))));
    }

    #[tokio::test]
    async fn test_serves_until_shutdown() {
        let server = HttpServer::builder()
            .router(Router::new().route("/ping", get(|| async { "pong" })))
            .build()
            .unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        let handle = tokio::spawn(server.serve_with_listener(listener, async {
            let _ = rx.await;
        }));
        tx.send(()).unwrap();

        let result = tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
