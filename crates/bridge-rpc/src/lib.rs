//! RPC pipeline for rpc-bridge
//!
//! # Modules
//!
//! - `handler`: Handler traits for the four call shapes
//! - `registry`: Method table built at startup
//! - `interceptor`: Ordered interceptor chains (logging, observation, recovery)
//! - `stream`: Stream wrapper with per-message hooks
//! - `auth`: Token authentication and JWT issuing
//! - `observe`: Call events and sinks
//! - `dispatch`: Runs calls through the chain with shape, cancellation and deadline enforcement
//! - `grpc`: tonic server and client transport
//! - `hello`: `hello.v1` service definitions

pub mod auth;
pub mod dispatch;
pub mod grpc;
pub mod handler;
pub mod hello;
pub mod interceptor;
pub mod observe;
pub mod registry;
pub mod stream;

#[cfg(test)]
mod testing;

// Re-exports
pub use auth::{
    AuthInterceptor, CredentialVerifier, JwtIssuer, JwtVerifier, SubjectPolicy,
    TokenAuthenticator, VerifyError, TOKEN_KEY,
};
pub use dispatch::{Dispatcher, StreamingCall, UnaryOutcome};
pub use handler::{ServerStream, StreamHandler, TypedStream, UnaryHandler};
pub use interceptor::{
    InterceptorChain, LoggingInterceptor, RecoverInterceptor, StreamInterceptor, StreamObserver,
    UnaryInterceptor, CLIENT_OS,
};
pub use observe::{CallEvent, EventSink, MemorySink, TracingSink};
pub use registry::{MethodHandle, MethodHandler, RegistryError, ServiceRegistry};
pub use stream::StreamWrapper;

/// Prelude for handler implementations
pub mod prelude {
    pub use crate::handler::{ServerStream, StreamHandler, TypedStream, UnaryHandler};
    pub use crate::hello::{GatewayService, HelloRequest, HelloResponse, HelloService, HelloStream};
    pub use bridge_core::{CallContext, Code, Error, Result};
}
