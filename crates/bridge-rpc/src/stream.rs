//! Stream decoration
//!
//! [`StreamWrapper`] exposes the same contract as the stream it wraps and
//! runs observation hooks around each message. Receive hooks run after the
//! inner stream produced a message; send hooks run before the message is
//! handed to the inner stream. Errors and end of stream pass through as-is.

use crate::handler::ServerStream;
use async_trait::async_trait;
use bridge_core::{AnyMessage, CallContext, DynMessage, Result};

/// Hook invoked with the call context and the message in flight
pub type MessageHook<'a> = Box<dyn FnMut(&CallContext, &dyn AnyMessage) + Send + 'a>;

/// A [`ServerStream`] decorated with per-message hooks
pub struct StreamWrapper<'a> {
    inner: &'a mut dyn ServerStream,
    on_recv: Vec<MessageHook<'a>>,
    on_send: Vec<MessageHook<'a>>,
}

impl<'a> StreamWrapper<'a> {
    pub fn new(inner: &'a mut dyn ServerStream) -> Self {
        Self {
            inner,
            on_recv: Vec::new(),
            on_send: Vec::new(),
        }
    }

    pub fn on_recv(mut self, hook: impl FnMut(&CallContext, &dyn AnyMessage) + Send + 'a) -> Self {
        self.on_recv.push(Box::new(hook));
        self
    }

    pub fn on_send(mut self, hook: impl FnMut(&CallContext, &dyn AnyMessage) + Send + 'a) -> Self {
        self.on_send.push(Box::new(hook));
        self
    }
}

#[async_trait]
impl<'a> ServerStream for StreamWrapper<'a> {
    fn context(&self) -> &CallContext {
        self.inner.context()
    }

    fn context_mut(&mut self) -> &mut CallContext {
        self.inner.context_mut()
    }

    async fn recv(&mut self) -> Result<Option<DynMessage>> {
        let message = self.inner.recv().await?;
        if let Some(message) = &message {
            let ctx = self.inner.context();
            for hook in self.on_recv.iter_mut() {
                hook(ctx, &**message);
            }
        }
        Ok(message)
    }

    async fn send(&mut self, message: DynMessage) -> Result<()> {
        let ctx = self.inner.context();
        for hook in self.on_send.iter_mut() {
            hook(ctx, &*message);
        }
        self.inner.send(message).await
    }

    async fn close(&mut self) -> Result<()> {
        self.inner.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{echo, names, Echo, VecStream};
    use bridge_core::{CallShape, Error};
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn test_wrapper_preserves_messages_in_order() {
        let inputs: Vec<String> = (0..50).map(|i| format!("m{i}")).collect();
        let mut inner = VecStream::new(CallShape::BidiStream, inputs.iter().map(|n| echo(n)));
        let seen = Arc::new(Mutex::new(Vec::new()));

        {
            let recorder = seen.clone();
            let mut wrapper = StreamWrapper::new(&mut inner).on_recv(move |_, msg| {
                let name = msg.downcast_ref::<Echo>().map(|e| e.name.clone()).unwrap_or_default();
                recorder.lock().unwrap().push(name);
            });

            while let Some(msg) = wrapper.recv().await.unwrap() {
                wrapper.send(msg).await.unwrap();
            }
        }

        assert_eq!(*seen.lock().unwrap(), inputs);
        assert_eq!(names(&inner.sent), inputs);
        for (sent, original) in inner.sent.iter().zip(&inputs) {
            assert_eq!(sent.encode_binary(), echo(original).encode_binary());
        }
    }

    #[tokio::test]
    async fn test_send_hook_sees_each_message() {
        let mut inner = VecStream::new(CallShape::ServerStream, [echo("req")]);
        let methods = Arc::new(Mutex::new(Vec::new()));
        let hook_methods = methods.clone();

        let mut wrapper = StreamWrapper::new(&mut inner).on_send(move |ctx, _| {
            hook_methods.lock().unwrap().push(ctx.method().to_string());
        });
        wrapper.send(echo("a")).await.unwrap();
        drop(wrapper);

        assert_eq!(*methods.lock().unwrap(), ["/test.v1.Test/Echo"]);
        assert_eq!(inner.sent.len(), 1);
    }

    #[tokio::test]
    async fn test_errors_and_eof_pass_through_without_hooks() {
        let mut inner = VecStream::new(CallShape::ClientStream, [echo("only")]);
        inner.fail_recv_after(1, Error::Cancelled);
        let calls = Arc::new(Mutex::new(0));
        let counter = calls.clone();

        let mut wrapper = StreamWrapper::new(&mut inner).on_recv(move |_, _| {
            *counter.lock().unwrap() += 1;
        });

        assert!(wrapper.recv().await.unwrap().is_some());
        assert_eq!(wrapper.recv().await.unwrap_err(), Error::Cancelled);
        drop(wrapper);
        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_failed_send_propagates() {
        let mut inner = VecStream::new(CallShape::ClientStream, Vec::new());
        let mut wrapper = StreamWrapper::new(&mut inner);
        wrapper.send(echo("one")).await.unwrap();
        assert_eq!(wrapper.send(echo("two")).await.unwrap_err(), Error::StreamClosed);
    }
}
