//! HTTP route table
//!
//! Bindings of `{HTTP method, path}` to call descriptors. Paths are fixed
//! segments only; lookups scan in registration order and the first exact
//! match wins.

use axum::http::Method;
use bridge_core::{CallDescriptor, Error, Result};
use bridge_rpc::hello::methods;
use bridge_rpc::ServiceRegistry;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
    #[error("duplicate route {method} {path}")]
    Duplicate { method: Method, path: String },

    #[error("invalid route pattern {0}: only fixed segments are supported")]
    InvalidPattern(String),
}

#[derive(Debug, Clone)]
struct RouteBinding {
    method: Method,
    segments: Vec<String>,
    descriptor: Arc<CallDescriptor>,
}

impl RouteBinding {
    fn matches(&self, method: &Method, segments: &[&str]) -> bool {
        self.method == *method
            && self.segments.len() == segments.len()
            && self.segments.iter().zip(segments).all(|(a, b)| a == b)
    }
}

fn split_path(path: &str) -> Vec<&str> {
    path.strip_prefix('/').unwrap_or(path).split('/').collect()
}

/// Routing table, built once at startup
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    bindings: Vec<RouteBinding>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// `POST /<package.Service>/<Method>` for every registered method
    pub fn from_registry(registry: &ServiceRegistry) -> std::result::Result<Self, RouteError> {
        let mut table = Self::new();
        for descriptor in registry.descriptors() {
            table.bind(Method::POST, descriptor.full_method(), descriptor.clone())?;
        }
        Ok(table)
    }

    /// Routes of the `hello.v1` services: `POST /hello.v1.HelloService/<Method>`
    /// for each greeting and `POST /v1/greeter/sayMessage`. Needs no registry,
    /// so a forwarding gateway can use it too.
    pub fn hello_routes() -> std::result::Result<Self, RouteError> {
        let mut table = Self::new();
        for descriptor in [
            methods::say_hello(),
            methods::lots_of_replies(),
            methods::lots_of_greetings(),
            methods::bidi_hello(),
        ] {
            let path = descriptor.full_method().to_string();
            table.bind(Method::POST, &path, Arc::new(descriptor))?;
        }
        table.bind(
            Method::POST,
            "/v1/greeter/sayMessage",
            Arc::new(methods::say_message()),
        )?;
        Ok(table)
    }

    pub fn bind(
        &mut self,
        method: Method,
        path: &str,
        descriptor: Arc<CallDescriptor>,
    ) -> std::result::Result<(), RouteError> {
        if !path.starts_with('/') || path.contains(|c: char| matches!(c, '{' | '}' | '*' | '?')) {
            return Err(RouteError::InvalidPattern(path.to_string()));
        }

        let segments = split_path(path);
        if segments.iter().any(|s| s.is_empty()) {
            return Err(RouteError::InvalidPattern(path.to_string()));
        }
        if self.bindings.iter().any(|b| b.matches(&method, &segments)) {
            return Err(RouteError::Duplicate {
                method,
                path: path.to_string(),
            });
        }

        debug!(method = %method, path = %path, target = %descriptor.full_method(), "Bound HTTP route");
        self.bindings.push(RouteBinding {
            method,
            segments: segments.into_iter().map(str::to_string).collect(),
            descriptor,
        });
        Ok(())
    }

    /// Descriptor bound to `method path`, or a routing error
    pub fn lookup(&self, method: &Method, path: &str) -> Result<Arc<CallDescriptor>> {
        let segments = split_path(path);
        self.bindings
            .iter()
            .find(|b| b.matches(method, &segments))
            .map(|b| b.descriptor.clone())
            .ok_or_else(|| Error::routing(method.as_str(), path))
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_core::{CallShape, Code, MessageType};
    use bridge_rpc::hello::{HelloRequest, HelloResponse};

    fn descriptor(method: &str) -> Arc<CallDescriptor> {
        Arc::new(CallDescriptor::new(
            "hello.v1.HelloService",
            method,
            CallShape::Unary,
            MessageType::of::<HelloRequest>(),
            MessageType::of::<HelloResponse>(),
        ))
    }

    #[test]
    fn test_lookup_exact_match() {
        let mut table = RouteTable::new();
        table
            .bind(Method::POST, "/v1/greeter/sayMessage", descriptor("SayMessage"))
            .unwrap();
        table
            .bind(Method::POST, "/hello.v1.HelloService/SayHello", descriptor("SayHello"))
            .unwrap();

        let found = table
            .lookup(&Method::POST, "/v1/greeter/sayMessage")
            .unwrap();
        assert_eq!(found.method(), "SayMessage");

        let err = table.lookup(&Method::GET, "/v1/greeter/sayMessage").unwrap_err();
        assert_eq!(err.code(), Code::NotFound);
        assert!(table.lookup(&Method::POST, "/v1/greeter").is_err());
        assert!(table.lookup(&Method::POST, "/v1/greeter/sayMessage/x").is_err());
    }

    #[test]
    fn test_duplicate_binding_rejected() {
        let mut table = RouteTable::new();
        table
            .bind(Method::POST, "/v1/a", descriptor("SayHello"))
            .unwrap();
        let err = table
            .bind(Method::POST, "/v1/a", descriptor("SayMessage"))
            .unwrap_err();
        assert!(matches!(err, RouteError::Duplicate { .. }));

        // Same path under another method is a different binding
        table.bind(Method::PUT, "/v1/a", descriptor("SayMessage")).unwrap();
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_hello_routes() {
        let table = RouteTable::hello_routes().unwrap();
        assert_eq!(table.len(), 5);

        let found = table
            .lookup(&Method::POST, "/hello.v1.HelloService/LotsOfGreetings")
            .unwrap();
        assert_eq!(found.shape, CallShape::ClientStream);
        let found = table.lookup(&Method::POST, "/v1/greeter/sayMessage").unwrap();
        assert_eq!(found.full_method(), "/hello.v1.GatewayService/SayMessage");
    }

    #[test]
    fn test_patterns_are_fixed_segments() {
        let mut table = RouteTable::new();
        for bad in ["v1/a", "/v1/{name}", "/v1/*", "/v1//a"] {
            assert!(matches!(
                table.bind(Method::POST, bad, descriptor("SayHello")),
                Err(RouteError::InvalidPattern(_))
            ));
        }
        assert!(table.is_empty());
    }
}
