//! Service registry
//!
//! Descriptors and handlers live in a `Vec` arena addressed by
//! [`MethodHandle`]; a name index maps `/package.Service/Method` to its handle.
//! The registry is built once at startup and shared read-only behind `Arc`.

use crate::handler::{StreamHandler, UnaryHandler};
use bridge_core::{CallDescriptor, CallShape};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Index of a registered method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MethodHandle(u32);

impl MethodHandle {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Handler bound to a method
#[derive(Clone)]
pub enum MethodHandler {
    Unary(Arc<dyn UnaryHandler>),
    Stream(Arc<dyn StreamHandler>),
}

impl fmt::Debug for MethodHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MethodHandler::Unary(_) => f.write_str("MethodHandler::Unary"),
            MethodHandler::Stream(_) => f.write_str("MethodHandler::Stream"),
        }
    }
}

/// Registration failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("method already registered: {0}")]
    Duplicate(String),

    #[error("{method} is {shape} but was given a {handler} handler")]
    ShapeMismatch {
        method: String,
        shape: CallShape,
        handler: &'static str,
    },
}

#[derive(Debug)]
struct MethodEntry {
    descriptor: Arc<CallDescriptor>,
    handler: MethodHandler,
}

/// All methods served by this process
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    methods: Vec<MethodEntry>,
    by_name: HashMap<String, MethodHandle>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a method. Unary descriptors need a unary handler, every
    /// streaming shape needs a stream handler.
    pub fn register(
        &mut self,
        descriptor: CallDescriptor,
        handler: MethodHandler,
    ) -> Result<MethodHandle, RegistryError> {
        let name = descriptor.full_method().to_string();
        if self.by_name.contains_key(&name) {
            return Err(RegistryError::Duplicate(name));
        }

        match (&handler, descriptor.shape) {
            (MethodHandler::Unary(_), CallShape::Unary) => {}
            (MethodHandler::Stream(_), shape) if shape != CallShape::Unary => {}
            (MethodHandler::Unary(_), shape) => {
                return Err(RegistryError::ShapeMismatch {
                    method: name,
                    shape,
                    handler: "unary",
                })
            }
            (MethodHandler::Stream(_), shape) => {
                return Err(RegistryError::ShapeMismatch {
                    method: name,
                    shape,
                    handler: "stream",
                })
            }
        }

        let handle = MethodHandle(self.methods.len() as u32);
        debug!(method = %name, shape = %descriptor.shape, "Registered method");
        self.methods.push(MethodEntry {
            descriptor: Arc::new(descriptor),
            handler,
        });
        self.by_name.insert(name, handle);
        Ok(handle)
    }

    pub fn register_unary(
        &mut self,
        descriptor: CallDescriptor,
        handler: impl UnaryHandler,
    ) -> Result<MethodHandle, RegistryError> {
        self.register(descriptor, MethodHandler::Unary(Arc::new(handler)))
    }

    pub fn register_stream(
        &mut self,
        descriptor: CallDescriptor,
        handler: impl StreamHandler,
    ) -> Result<MethodHandle, RegistryError> {
        self.register(descriptor, MethodHandler::Stream(Arc::new(handler)))
    }

    /// Find a method by `/package.Service/Method`
    pub fn lookup(&self, full_method: &str) -> Option<MethodHandle> {
        self.by_name.get(full_method).copied()
    }

    pub fn descriptor(&self, handle: MethodHandle) -> Option<&Arc<CallDescriptor>> {
        self.methods.get(handle.index()).map(|e| &e.descriptor)
    }

    pub fn handler(&self, handle: MethodHandle) -> Option<&MethodHandler> {
        self.methods.get(handle.index()).map(|e| &e.handler)
    }

    /// Registered descriptors in registration order
    pub fn descriptors(&self) -> impl Iterator<Item = &Arc<CallDescriptor>> {
        self.methods.iter().map(|e| &e.descriptor)
    }

    /// Distinct service names
    pub fn services(&self) -> BTreeSet<&str> {
        self.methods.iter().map(|e| e.descriptor.service()).collect()
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::ServerStream;
    use async_trait::async_trait;
    use bridge_core::{CallContext, DynMessage, MessageType, Result};
    use crate::testing::Echo;

    struct Unary;

    #[async_trait]
    impl UnaryHandler for Unary {
        async fn call(&self, _ctx: &mut CallContext, request: DynMessage) -> Result<DynMessage> {
            Ok(request)
        }
    }

    struct Streaming;

    #[async_trait]
    impl StreamHandler for Streaming {
        async fn call(&self, _stream: &mut dyn ServerStream) -> Result<()> {
            Ok(())
        }
    }

    fn desc(method: &str, shape: CallShape) -> CallDescriptor {
        CallDescriptor::new(
            "test.v1.Test",
            method,
            shape,
            MessageType::of::<Echo>(),
            MessageType::of::<Echo>(),
        )
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = ServiceRegistry::new();
        let a = registry.register_unary(desc("A", CallShape::Unary), Unary).unwrap();
        let b = registry
            .register_stream(desc("B", CallShape::BidiStream), Streaming)
            .unwrap();

        assert_ne!(a, b);
        assert_eq!(registry.lookup("/test.v1.Test/A"), Some(a));
        assert_eq!(registry.lookup("/test.v1.Test/B"), Some(b));
        assert_eq!(registry.lookup("/test.v1.Test/C"), None);
        assert_eq!(registry.descriptor(b).unwrap().shape, CallShape::BidiStream);
        assert_eq!(registry.services().into_iter().collect::<Vec<_>>(), ["test.v1.Test"]);
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut registry = ServiceRegistry::new();
        registry.register_unary(desc("A", CallShape::Unary), Unary).unwrap();
        let err = registry
            .register_unary(desc("A", CallShape::Unary), Unary)
            .unwrap_err();
        assert_eq!(err, RegistryError::Duplicate("/test.v1.Test/A".into()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let mut registry = ServiceRegistry::new();
        assert!(matches!(
            registry.register_unary(desc("A", CallShape::ServerStream), Unary),
            Err(RegistryError::ShapeMismatch { .. })
        ));
        assert!(matches!(
            registry.register_stream(desc("B", CallShape::Unary), Streaming),
            Err(RegistryError::ShapeMismatch { .. })
        ));
        assert!(registry.is_empty());
    }
}
