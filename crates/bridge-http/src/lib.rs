//! bridge-http: HTTP/JSON front door for rpc-bridge
//!
//! Architecture:
//! ```text
//! HTTP client ──JSON──▶ HttpServer (TLS, middleware)
//!                          └── Gateway
//!                               ├── RouteTable      path → call descriptor
//!                               ├── header matcher  HTTP headers → metadata
//!                               └── RpcBackend
//!                                    ├── LocalBackend   in-process Dispatcher
//!                                    └── RemoteBackend  tonic channel
//! ```

pub mod gateway;
pub mod middleware;
pub mod server;
pub mod tls;

pub use gateway::{
    default_header_matcher, token_header_matcher, ErrorBody, Gateway, HeaderMatcher,
    LocalBackend, RemoteBackend, RouteError, RouteTable, RpcBackend,
};
pub use middleware::{apply_middleware, MiddlewareConfig};
pub use server::{HttpServer, HttpServerBuilder, ServerConfig};
pub use tls::TlsConfig;

pub use axum;

/// Error types for the HTTP server
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("TLS configuration error: {0}")]
    TlsError(String),

    #[error("Server binding error: {0}")]
    BindError(#[from] std::io::Error),

    #[error("Route configuration error: {0}")]
    RouteError(#[from] RouteError),

    #[error("Certificate error: {0}")]
    CertificateError(String),
}

pub type Result<T> = std::result::Result<T, ServerError>;
