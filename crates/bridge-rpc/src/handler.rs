//! Handler traits for the four call shapes
//!
//! Unary methods implement [`UnaryHandler`]. Every streaming shape implements
//! [`StreamHandler`] against a [`ServerStream`]; the shape policy (how many
//! requests may be read, how many responses may be sent) is enforced by the
//! stream the dispatcher hands in.

use async_trait::async_trait;
use bridge_core::{CallContext, DynMessage, Result, RpcMessage};
use std::marker::PhantomData;

/// Terminal handler for a unary method
#[async_trait]
pub trait UnaryHandler: Send + Sync + 'static {
    async fn call(&self, ctx: &mut CallContext, request: DynMessage) -> Result<DynMessage>;
}

/// Terminal handler for a streaming method
#[async_trait]
pub trait StreamHandler: Send + Sync + 'static {
    async fn call(&self, stream: &mut dyn ServerStream) -> Result<()>;
}

/// Server side of a streaming call.
///
/// `recv` yields `Ok(None)` at end of input. `send` fails with
/// `StreamClosed` once the shape allows no more responses or after `close`.
#[async_trait]
pub trait ServerStream: Send {
    fn context(&self) -> &CallContext;

    fn context_mut(&mut self) -> &mut CallContext;

    async fn recv(&mut self) -> Result<Option<DynMessage>>;

    async fn send(&mut self, message: DynMessage) -> Result<()>;

    /// Close the send side; later sends fail
    async fn close(&mut self) -> Result<()>;
}

/// Typed view over a [`ServerStream`] for handler implementations
pub struct TypedStream<'a, Req, Resp> {
    inner: &'a mut dyn ServerStream,
    _types: PhantomData<fn(Req) -> Resp>,
}

impl<'a, Req: RpcMessage, Resp: RpcMessage> TypedStream<'a, Req, Resp> {
    pub fn new(inner: &'a mut dyn ServerStream) -> Self {
        Self {
            inner,
            _types: PhantomData,
        }
    }

    pub fn context(&self) -> &CallContext {
        self.inner.context()
    }

    pub fn context_mut(&mut self) -> &mut CallContext {
        self.inner.context_mut()
    }

    pub async fn recv(&mut self) -> Result<Option<Req>> {
        match self.inner.recv().await? {
            Some(message) => Ok(Some(message.downcast::<Req>()?)),
            None => Ok(None),
        }
    }

    pub async fn send(&mut self, message: Resp) -> Result<()> {
        self.inner.send(Box::new(message)).await
    }

    /// Send the single response of a client-streaming call and close
    pub async fn send_and_close(&mut self, message: Resp) -> Result<()> {
        self.send(message).await?;
        self.inner.close().await
    }
}
