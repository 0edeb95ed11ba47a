//! Type-erased application messages
//!
//! Handlers, interceptors and transports move messages around as
//! [`DynMessage`] so one dispatcher serves every method. Concrete message
//! types only need to be prost messages that also round-trip through serde.

use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;
use std::fmt;

/// A concrete message usable on both transports
pub trait RpcMessage:
    prost::Message + Default + Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<T> RpcMessage for T where
    T: prost::Message + Default + Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

/// Object-safe view of an [`RpcMessage`]
pub trait AnyMessage: Send + Sync + fmt::Debug {
    fn type_name(&self) -> &'static str;

    /// Protobuf wire encoding
    fn encode_binary(&self) -> Vec<u8>;

    /// JSON encoding (field names as the gateway exposes them)
    fn to_json(&self) -> Result<serde_json::Value>;

    fn as_any(&self) -> &dyn Any;

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;

    fn clone_box(&self) -> DynMessage;
}

/// A boxed, type-erased message
pub type DynMessage = Box<dyn AnyMessage>;

impl<T: RpcMessage> AnyMessage for T {
    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn encode_binary(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    fn to_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }

    fn clone_box(&self) -> DynMessage {
        Box::new(self.clone())
    }
}

impl Clone for DynMessage {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

impl<'a> dyn AnyMessage + 'a {
    /// Recover the concrete message, failing with `Internal` on a type mismatch.
    pub fn downcast<M: RpcMessage>(self: Box<Self>) -> Result<M> {
        let found = self.type_name();
        self.into_any()
            .downcast::<M>()
            .map(|m| *m)
            .map_err(|_| {
                Error::internal(format!(
                    "expected message {}, found {}",
                    std::any::type_name::<M>(),
                    found
                ))
            })
    }

    pub fn downcast_ref<M: RpcMessage>(&self) -> Option<&M> {
        self.as_any().downcast_ref::<M>()
    }
}

/// Box a concrete message
pub fn boxed<M: RpcMessage>(msg: M) -> DynMessage {
    Box::new(msg)
}
