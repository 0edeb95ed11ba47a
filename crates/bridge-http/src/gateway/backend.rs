//! Where gateway calls go
//!
//! [`LocalBackend`] runs calls through the in-process dispatcher;
//! [`RemoteBackend`] forwards them to a gRPC server over a tonic channel.
//! Both hand the gateway the same [`UnaryOutcome`] / [`StreamingCall`] shapes.

use async_trait::async_trait;
use bridge_core::{CallContext, CallShape, Code, DynMessage, Error, Metadata, Result};
use bridge_rpc::dispatch::DEFAULT_STREAM_BUFFER;
use bridge_rpc::grpc::{CallOptions, ClientError, ClientStream, RpcClient};
use bridge_rpc::{Dispatcher, StreamingCall, UnaryOutcome};
use futures::stream::BoxStream;
use futures::StreamExt;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, Instrument};

#[async_trait]
pub trait RpcBackend: Send + Sync + 'static {
    async fn unary(&self, ctx: CallContext, request: DynMessage) -> UnaryOutcome;

    fn streaming(
        &self,
        ctx: CallContext,
        incoming: BoxStream<'static, Result<DynMessage>>,
    ) -> Result<StreamingCall>;
}

/// In-process dispatch
#[derive(Clone)]
pub struct LocalBackend {
    dispatcher: Dispatcher,
}

impl LocalBackend {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl RpcBackend for LocalBackend {
    async fn unary(&self, ctx: CallContext, request: DynMessage) -> UnaryOutcome {
        self.dispatcher.unary(ctx, request).await
    }

    fn streaming(
        &self,
        ctx: CallContext,
        incoming: BoxStream<'static, Result<DynMessage>>,
    ) -> Result<StreamingCall> {
        self.dispatcher.streaming(ctx, incoming)
    }
}

/// Forwarding over gRPC. Inbound metadata and the remaining deadline travel
/// with the call.
#[derive(Debug, Clone)]
pub struct RemoteBackend {
    client: RpcClient,
}

impl RemoteBackend {
    pub fn new(client: RpcClient) -> Self {
        Self { client }
    }
}

fn call_options(ctx: &CallContext) -> CallOptions {
    CallOptions {
        metadata: ctx.inbound().cloned().unwrap_or_default(),
        timeout: ctx.remaining(),
    }
}

/// First request decode error, reported once the call has ended
type ErrorSlot = Arc<Mutex<Option<Error>>>;

/// Request messages up to the first error, which is parked in the slot
fn until_error(
    incoming: BoxStream<'static, Result<DynMessage>>,
    slot: ErrorSlot,
) -> BoxStream<'static, DynMessage> {
    incoming
        .scan(slot, |slot, item| {
            let next = match item {
                Ok(message) => Some(message),
                Err(err) => {
                    let mut parked = slot.lock().unwrap_or_else(|e| e.into_inner());
                    parked.get_or_insert(err);
                    None
                }
            };
            futures::future::ready(next)
        })
        .boxed()
}

fn take_parked(slot: &ErrorSlot) -> Option<Error> {
    slot.lock().unwrap_or_else(|e| e.into_inner()).take()
}

#[async_trait]
impl RpcBackend for RemoteBackend {
    async fn unary(&self, ctx: CallContext, request: DynMessage) -> UnaryOutcome {
        let descriptor = ctx.descriptor().clone();
        let watch = ctx.watch();
        let call = self.client.unary(&descriptor, call_options(&ctx), request);

        let result = tokio::select! {
            result = call => result,
            err = watch.done() => Err(ClientError::from(err)),
        };
        match result {
            Ok(reply) => UnaryOutcome {
                result: Ok(reply.message),
                header: reply.header,
                trailer: Metadata::new(),
            },
            // The server folds unary header and trailer into the status metadata
            Err(ClientError { error, metadata }) => UnaryOutcome {
                result: Err(error),
                header: metadata,
                trailer: Metadata::new(),
            },
        }
    }

    fn streaming(
        &self,
        ctx: CallContext,
        incoming: BoxStream<'static, Result<DynMessage>>,
    ) -> Result<StreamingCall> {
        let descriptor = ctx.descriptor().clone();
        if descriptor.shape == CallShape::Unary {
            return Err(Error::handler(
                Code::Unimplemented,
                format!("{} is a unary method", descriptor.full_method()),
            ));
        }

        let (header_tx, header_rx) = oneshot::channel();
        let (trailer_tx, trailer_rx) = oneshot::channel();
        let (response_tx, response_rx) = mpsc::channel(DEFAULT_STREAM_BUFFER);

        let span = tracing::debug_span!(
            "remote",
            method = %descriptor.full_method(),
            request_id = %ctx.request_id()
        );
        let forward = Forward {
            client: self.client.clone(),
            ctx,
            header_tx: Some(header_tx),
            response_tx,
        };
        tokio::spawn(forward.run(incoming, trailer_tx).instrument(span));

        Ok(StreamingCall {
            header: header_rx,
            responses: response_rx,
            trailer: trailer_rx,
        })
    }
}

/// Background task of one forwarded streaming call
struct Forward {
    client: RpcClient,
    ctx: CallContext,
    header_tx: Option<oneshot::Sender<Metadata>>,
    response_tx: mpsc::Sender<Result<DynMessage>>,
}

impl Forward {
    async fn run(
        mut self,
        incoming: BoxStream<'static, Result<DynMessage>>,
        trailer_tx: oneshot::Sender<Metadata>,
    ) {
        let watch = self.ctx.watch();
        let slot = ErrorSlot::default();

        let (result, trailer) = tokio::select! {
            outcome = self.forward(incoming, slot.clone()) => outcome,
            err = watch.done() => (Err(err), Metadata::new()),
        };

        // A request that failed to decode outranks whatever the server said
        let result = match take_parked(&slot) {
            Some(err) => Err(err),
            None => result,
        };

        self.send_header(Metadata::new());
        let _ = trailer_tx.send(trailer);
        if let Err(err) = result {
            debug!(error = %err, "Forwarded stream failed");
            let _ = self.response_tx.send(Err(err)).await;
        }
    }

    fn send_header(&mut self, header: Metadata) {
        if let Some(tx) = self.header_tx.take() {
            let _ = tx.send(header);
        }
    }

    async fn forward(
        &mut self,
        incoming: BoxStream<'static, Result<DynMessage>>,
        slot: ErrorSlot,
    ) -> (Result<()>, Metadata) {
        let descriptor = self.ctx.descriptor().clone();
        let options = call_options(&self.ctx);
        let mut requests = until_error(incoming, slot);

        let stream = match descriptor.shape {
            CallShape::ServerStream => {
                let Some(request) = requests.next().await else {
                    return (
                        Err(Error::handler(Code::InvalidArgument, "missing request message")),
                        Metadata::new(),
                    );
                };
                self.client
                    .server_streaming(&descriptor, options, request)
                    .await
            }
            CallShape::ClientStream => {
                let reply = self
                    .client
                    .client_streaming(&descriptor, options, requests)
                    .await;
                return match reply {
                    Ok(reply) => {
                        self.send_header(reply.header);
                        let sent = self.response_tx.send(Ok(reply.message)).await;
                        (sent.map_err(|_| Error::Cancelled), Metadata::new())
                    }
                    // Status metadata of a client stream is the handler's trailer
                    Err(ClientError { error, metadata }) => (Err(error), metadata),
                };
            }
            CallShape::BidiStream => self.client.streaming(&descriptor, options, requests).await,
            CallShape::Unary => Err(Error::internal("unary call on the streaming path").into()),
        };

        match stream {
            Ok(stream) => self.pump(stream).await,
            Err(ClientError { error, metadata }) => (Err(error), metadata),
        }
    }

    /// Forward responses until the server ends the stream
    async fn pump(&mut self, mut stream: ClientStream) -> (Result<()>, Metadata) {
        self.send_header(stream.header().clone());
        loop {
            match stream.message().await {
                Ok(Some(message)) => {
                    if self.response_tx.send(Ok(message)).await.is_err() {
                        return (Err(Error::Cancelled), Metadata::new());
                    }
                }
                Ok(None) => {
                    let trailer = stream.trailers().await.unwrap_or_default();
                    return (Ok(()), trailer);
                }
                Err(ClientError { error, metadata }) => return (Err(error), metadata),
            }
        }
    }
}
