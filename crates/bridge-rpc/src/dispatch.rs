//! In-process dispatcher
//!
//! The dispatcher owns the service registry and the interceptor chain and is
//! the single entry point for calls coming from either transport. Unary calls
//! run on the caller's task. Streaming calls run the handler on a spawned task
//! behind a [`CallStream`] that enforces the call shape and the
//! `Open → Draining → Closed` lifecycle.

use crate::handler::{ServerStream, StreamHandler};
use crate::interceptor::InterceptorChain;
use crate::registry::{MethodHandler, ServiceRegistry};
use async_trait::async_trait;
use bridge_core::{
    CallContext, CallDescriptor, CallShape, CallWatch, Code, DynMessage, Error, Metadata, Result,
};
use futures::stream::BoxStream;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, Instrument};

/// Default capacity of a streaming call's response channel
pub const DEFAULT_STREAM_BUFFER: usize = 16;

/// Result of a unary call plus the metadata the call produced
#[derive(Debug)]
pub struct UnaryOutcome {
    pub result: Result<DynMessage>,
    pub header: Metadata,
    pub trailer: Metadata,
}

/// Live streaming call.
///
/// `header` resolves before the first response is delivered (or when the
/// call ends without any). `responses` yields every response in order; a
/// failing call ends with exactly one `Err` item. `trailer` resolves once the
/// handler returned.
#[derive(Debug)]
pub struct StreamingCall {
    pub header: oneshot::Receiver<Metadata>,
    pub responses: mpsc::Receiver<Result<DynMessage>>,
    pub trailer: oneshot::Receiver<Metadata>,
}

/// Routes calls to registered handlers through the interceptor chain
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<ServiceRegistry>,
    chain: Arc<InterceptorChain>,
    buffer: usize,
}

impl Dispatcher {
    pub fn new(registry: ServiceRegistry, chain: InterceptorChain) -> Self {
        Self {
            registry: Arc::new(registry),
            chain: Arc::new(chain),
            buffer: DEFAULT_STREAM_BUFFER,
        }
    }

    pub fn with_buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer.max(1);
        self
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// Descriptor for `/package.Service/Method`
    pub fn descriptor(&self, full_method: &str) -> Option<Arc<CallDescriptor>> {
        let handle = self.registry.lookup(full_method)?;
        self.registry.descriptor(handle).cloned()
    }

    fn handler(&self, full_method: &str) -> Result<&MethodHandler> {
        self.registry
            .lookup(full_method)
            .and_then(|handle| self.registry.handler(handle))
            .ok_or_else(|| {
                Error::handler(Code::Unimplemented, format!("unknown method {}", full_method))
            })
    }

    /// Run a unary call. Header and trailer metadata are returned whether or
    /// not the call succeeded.
    pub async fn unary(&self, mut ctx: CallContext, request: DynMessage) -> UnaryOutcome {
        let result = self.run_unary(&mut ctx, request).await;
        UnaryOutcome {
            result,
            header: ctx.take_header(),
            trailer: ctx.take_trailer(),
        }
    }

    async fn run_unary(&self, ctx: &mut CallContext, request: DynMessage) -> Result<DynMessage> {
        let handler = match self.handler(ctx.method())? {
            MethodHandler::Unary(handler) => handler.clone(),
            MethodHandler::Stream(_) => {
                return Err(Error::handler(
                    Code::Unimplemented,
                    format!("{} is a streaming method", ctx.method()),
                ))
            }
        };

        let watch = ctx.watch();
        if let Some(err) = watch.check() {
            return Err(err);
        }

        tokio::select! {
            result = self.chain.run_unary(handler.as_ref(), ctx, request) => result,
            err = watch.done() => Err(err),
        }
    }

    /// Start a streaming call. `incoming` carries the request messages; for a
    /// server-streaming method only its first item is read.
    pub fn streaming(
        &self,
        ctx: CallContext,
        incoming: BoxStream<'static, Result<DynMessage>>,
    ) -> Result<StreamingCall> {
        let handler = match self.handler(ctx.method())? {
            MethodHandler::Stream(handler) => handler.clone(),
            MethodHandler::Unary(_) => {
                return Err(Error::handler(
                    Code::Unimplemented,
                    format!("{} is a unary method", ctx.method()),
                ))
            }
        };

        let (header_tx, header_rx) = oneshot::channel();
        let (trailer_tx, trailer_rx) = oneshot::channel();
        let (response_tx, response_rx) = mpsc::channel(self.buffer);

        let span = tracing::debug_span!(
            "stream",
            method = %ctx.method(),
            request_id = %ctx.request_id()
        );
        let stream = CallStream::new(ctx, incoming, header_tx, response_tx);
        let chain = self.chain.clone();

        tokio::spawn(
            run_stream(chain, handler, stream, trailer_tx).instrument(span),
        );

        Ok(StreamingCall {
            header: header_rx,
            responses: response_rx,
            trailer: trailer_rx,
        })
    }
}

async fn run_stream(
    chain: Arc<InterceptorChain>,
    handler: Arc<dyn StreamHandler>,
    mut stream: CallStream,
    trailer_tx: oneshot::Sender<Metadata>,
) {
    let watch = stream.watch.clone();
    let result = match watch.check() {
        Some(err) => Err(err),
        None => {
            tokio::select! {
                result = chain.run_stream(handler.as_ref(), &mut stream) => result,
                err = watch.done() => Err(err),
            }
        }
    };

    let result = match result {
        Ok(()) if stream.shape.single_response() && stream.sent == 0 => Err(Error::internal(
            format!("{} finished without a response", stream.ctx.method()),
        )),
        other => other,
    };

    stream.send_closed = true;
    stream.flush_header();
    let _ = trailer_tx.send(stream.ctx.take_trailer());

    if let Err(err) = result {
        debug!(error = %err, "Streaming call failed");
        // The receiver may already be gone when the caller cancelled
        let _ = stream.responses.send(Err(err)).await;
    }
}

/// Dispatcher side of a streaming call
struct CallStream {
    ctx: CallContext,
    shape: CallShape,
    watch: CallWatch,
    incoming: BoxStream<'static, Result<DynMessage>>,
    header_tx: Option<oneshot::Sender<Metadata>>,
    responses: mpsc::Sender<Result<DynMessage>>,
    /// Input reached end-of-stream or failed
    input_closed: bool,
    /// Handler closed its send side or returned
    send_closed: bool,
    received: usize,
    sent: usize,
}

impl CallStream {
    fn new(
        ctx: CallContext,
        incoming: BoxStream<'static, Result<DynMessage>>,
        header_tx: oneshot::Sender<Metadata>,
        responses: mpsc::Sender<Result<DynMessage>>,
    ) -> Self {
        Self {
            shape: ctx.descriptor().shape,
            watch: ctx.watch(),
            ctx,
            incoming,
            header_tx: Some(header_tx),
            responses,
            input_closed: false,
            send_closed: false,
            received: 0,
            sent: 0,
        }
    }

    fn flush_header(&mut self) {
        if let Some(tx) = self.header_tx.take() {
            let _ = tx.send(self.ctx.take_header());
        }
    }

    fn input_done(&self) -> bool {
        self.input_closed
            || (!self.shape.client_streaming() && self.received >= 1)
    }
}

#[async_trait]
impl ServerStream for CallStream {
    fn context(&self) -> &CallContext {
        &self.ctx
    }

    fn context_mut(&mut self) -> &mut CallContext {
        &mut self.ctx
    }

    async fn recv(&mut self) -> Result<Option<DynMessage>> {
        if self.input_done() {
            return Ok(None);
        }

        let item = tokio::select! {
            item = self.incoming.next() => item,
            err = self.watch.done() => return Err(err),
        };

        match item {
            Some(Ok(message)) => {
                self.received += 1;
                Ok(Some(message))
            }
            Some(Err(err)) => {
                self.input_closed = true;
                Err(err)
            }
            None => {
                self.input_closed = true;
                Ok(None)
            }
        }
    }

    async fn send(&mut self, message: DynMessage) -> Result<()> {
        if self.send_closed || (self.shape.single_response() && self.sent >= 1) {
            return Err(Error::StreamClosed);
        }
        if let Some(err) = self.watch.check() {
            return Err(err);
        }

        self.flush_header();
        let sent = tokio::select! {
            sent = self.responses.send(Ok(message)) => sent,
            err = self.watch.done() => return Err(err),
        };
        // Receiver dropped: the caller went away
        sent.map_err(|_| Error::Cancelled)?;
        self.sent += 1;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.send_closed = true;
        Ok(())
    }
}
