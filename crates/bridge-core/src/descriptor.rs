//! Call shapes and method descriptors

use crate::error::{Error, Result};
use crate::message::{DynMessage, RpcMessage};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The four canonical call shapes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallShape {
    /// One request, one response
    Unary,
    /// One request, a stream of responses
    ServerStream,
    /// A stream of requests, one response
    ClientStream,
    /// Independent request and response streams
    BidiStream,
}

impl CallShape {
    pub fn client_streaming(self) -> bool {
        matches!(self, CallShape::ClientStream | CallShape::BidiStream)
    }

    pub fn server_streaming(self) -> bool {
        matches!(self, CallShape::ServerStream | CallShape::BidiStream)
    }

    /// Whether the handler may send more than one response
    pub fn single_response(self) -> bool {
        !self.server_streaming()
    }
}

impl fmt::Display for CallShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CallShape::Unary => "unary",
            CallShape::ServerStream => "server-stream",
            CallShape::ClientStream => "client-stream",
            CallShape::BidiStream => "bidi-stream",
        };
        f.write_str(s)
    }
}

/// Decoders for one concrete message type
#[derive(Clone, Copy)]
pub struct MessageType {
    pub name: &'static str,
    decode_binary: fn(&[u8]) -> Result<DynMessage>,
    decode_json: fn(serde_json::Value) -> Result<DynMessage>,
    default: fn() -> DynMessage,
}

impl MessageType {
    pub fn of<M: RpcMessage>() -> Self {
        fn decode_binary<M: RpcMessage>(buf: &[u8]) -> Result<DynMessage> {
            Ok(Box::new(M::decode(buf)?))
        }
        fn decode_json<M: RpcMessage>(value: serde_json::Value) -> Result<DynMessage> {
            Ok(Box::new(serde_json::from_value::<M>(value)?))
        }
        fn default<M: RpcMessage>() -> DynMessage {
            Box::new(M::default())
        }

        Self {
            name: std::any::type_name::<M>(),
            decode_binary: decode_binary::<M>,
            decode_json: decode_json::<M>,
            default: default::<M>,
        }
    }

    pub fn decode_binary(&self, buf: &[u8]) -> Result<DynMessage> {
        (self.decode_binary)(buf)
    }

    /// Decode a JSON value; non-object values are rejected as decode errors.
    pub fn decode_json(&self, value: serde_json::Value) -> Result<DynMessage> {
        if !value.is_object() {
            return Err(Error::decode(format!(
                "expected a JSON object for {}, found {}",
                self.name, value
            )));
        }
        (self.decode_json)(value)
    }

    pub fn default_message(&self) -> DynMessage {
        (self.default)()
    }
}

impl fmt::Debug for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageType").field("name", &self.name).finish()
    }
}

/// Immutable description of one RPC method
#[derive(Debug, Clone)]
pub struct CallDescriptor {
    full_method: String,
    service: String,
    method: String,
    pub shape: CallShape,
    pub request: MessageType,
    pub response: MessageType,
}

impl CallDescriptor {
    /// `service` is the fully qualified service name, e.g. `hello.v1.HelloService`.
    pub fn new(
        service: impl Into<String>,
        method: impl Into<String>,
        shape: CallShape,
        request: MessageType,
        response: MessageType,
    ) -> Self {
        let service = service.into();
        let method = method.into();
        Self {
            full_method: format!("/{}/{}", service, method),
            service,
            method,
            shape,
            request,
            response,
        }
    }

    /// `/package.Service/Method`
    pub fn full_method(&self) -> &str {
        &self.full_method
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn method(&self) -> &str {
        &self.method
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::testing::Ping;
    use crate::status::Code;

    #[test]
    fn test_shape_policies() {
        assert!(!CallShape::Unary.client_streaming());
        assert!(CallShape::ServerStream.server_streaming());
        assert!(CallShape::ClientStream.client_streaming());
        assert!(CallShape::ClientStream.single_response());
        assert!(CallShape::BidiStream.client_streaming());
        assert!(!CallShape::BidiStream.single_response());
    }

    #[test]
    fn test_full_method_name() {
        let desc = CallDescriptor::new(
            "hello.v1.HelloService",
            "SayHello",
            CallShape::Unary,
            MessageType::of::<Ping>(),
            MessageType::of::<Ping>(),
        );
        assert_eq!(desc.full_method(), "/hello.v1.HelloService/SayHello");
        assert_eq!(desc.service(), "hello.v1.HelloService");
    }

    #[test]
    fn test_message_type_decoders() {
        let ty = MessageType::of::<Ping>();
        let msg = ty.decode_json(serde_json::json!({"name": "x"})).unwrap();
        assert_eq!(msg.downcast_ref::<Ping>().unwrap().name, "x");

        let err = ty.decode_json(serde_json::json!([1, 2])).unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);

        let err = ty.decode_binary(&[0xff, 0xff, 0xff]).unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);

        assert_eq!(ty.default_message().downcast_ref::<Ping>(), Some(&Ping::default()));
    }
}
