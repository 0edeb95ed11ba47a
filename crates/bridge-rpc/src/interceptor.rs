//! Interceptor chain
//!
//! Unary and stream interceptors are kept in two ordered lists. Calling a
//! method nests them so the first registered interceptor wraps the second,
//! which wraps the third, down to the terminal handler.
//!
//! Each interceptor receives a `next` value that it consumes to call through.
//! Because `next` is moved on use, an interceptor can call the rest of the
//! chain at most once; returning without calling it short-circuits the call.

use crate::handler::{ServerStream, StreamHandler, UnaryHandler};
use crate::observe::{CallEvent, EventSink, TracingSink};
use crate::stream::StreamWrapper;
use async_trait::async_trait;
use bridge_core::{CallContext, Code, DynMessage, Error, Result};
use chrono::Utc;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::error;

/// Metadata key carrying the caller's operating system
pub const CLIENT_OS: &str = "client-os";

/// Hook around unary calls
#[async_trait]
pub trait UnaryInterceptor: Send + Sync + 'static {
    async fn intercept(
        &self,
        ctx: &mut CallContext,
        request: DynMessage,
        next: UnaryNext<'_>,
    ) -> Result<DynMessage>;
}

/// Hook around streaming calls. An interceptor may hand `next` a decorated
/// stream (see [`StreamWrapper`]) instead of the one it received.
#[async_trait]
pub trait StreamInterceptor: Send + Sync + 'static {
    async fn intercept(&self, stream: &mut dyn ServerStream, next: StreamNext<'_>) -> Result<()>;
}

/// The remainder of a unary chain
pub struct UnaryNext<'a> {
    chain: &'a [Arc<dyn UnaryInterceptor>],
    handler: &'a dyn UnaryHandler,
}

impl<'a> UnaryNext<'a> {
    pub async fn run(self, ctx: &mut CallContext, request: DynMessage) -> Result<DynMessage> {
        match self.chain.split_first() {
            Some((first, rest)) => {
                let next = UnaryNext {
                    chain: rest,
                    handler: self.handler,
                };
                first.intercept(ctx, request, next).await
            }
            None => self.handler.call(ctx, request).await,
        }
    }
}

/// The remainder of a stream chain
pub struct StreamNext<'a> {
    chain: &'a [Arc<dyn StreamInterceptor>],
    handler: &'a dyn StreamHandler,
}

impl<'a> StreamNext<'a> {
    pub async fn run(self, stream: &mut dyn ServerStream) -> Result<()> {
        match self.chain.split_first() {
            Some((first, rest)) => {
                let next = StreamNext {
                    chain: rest,
                    handler: self.handler,
                };
                first.intercept(stream, next).await
            }
            None => self.handler.call(stream).await,
        }
    }
}

/// Ordered unary and stream interceptors, built once and shared
#[derive(Clone, Default)]
pub struct InterceptorChain {
    unary: Vec<Arc<dyn UnaryInterceptor>>,
    stream: Vec<Arc<dyn StreamInterceptor>>,
}

impl InterceptorChain {
    pub fn builder() -> InterceptorChainBuilder {
        InterceptorChainBuilder::default()
    }

    pub fn unary_len(&self) -> usize {
        self.unary.len()
    }

    pub fn stream_len(&self) -> usize {
        self.stream.len()
    }

    /// Run a unary call through every unary interceptor, then `handler`
    pub async fn run_unary(
        &self,
        handler: &dyn UnaryHandler,
        ctx: &mut CallContext,
        request: DynMessage,
    ) -> Result<DynMessage> {
        UnaryNext {
            chain: &self.unary,
            handler,
        }
        .run(ctx, request)
        .await
    }

    /// Run a streaming call through every stream interceptor, then `handler`
    pub async fn run_stream(
        &self,
        handler: &dyn StreamHandler,
        stream: &mut dyn ServerStream,
    ) -> Result<()> {
        StreamNext {
            chain: &self.stream,
            handler,
        }
        .run(stream)
        .await
    }
}

/// Builder for [`InterceptorChain`]; registration order is execution order
#[derive(Default)]
pub struct InterceptorChainBuilder {
    unary: Vec<Arc<dyn UnaryInterceptor>>,
    stream: Vec<Arc<dyn StreamInterceptor>>,
}

impl InterceptorChainBuilder {
    pub fn unary(mut self, interceptor: impl UnaryInterceptor) -> Self {
        self.unary.push(Arc::new(interceptor));
        self
    }

    pub fn unary_arc(mut self, interceptor: Arc<dyn UnaryInterceptor>) -> Self {
        self.unary.push(interceptor);
        self
    }

    pub fn stream(mut self, interceptor: impl StreamInterceptor) -> Self {
        self.stream.push(Arc::new(interceptor));
        self
    }

    pub fn stream_arc(mut self, interceptor: Arc<dyn StreamInterceptor>) -> Self {
        self.stream.push(interceptor);
        self
    }

    /// Append one interceptor to both lists
    pub fn both<I>(mut self, interceptor: I) -> Self
    where
        I: UnaryInterceptor + StreamInterceptor,
    {
        let shared = Arc::new(interceptor);
        self.unary.push(shared.clone());
        self.stream.push(shared);
        self
    }

    pub fn build(self) -> InterceptorChain {
        InterceptorChain {
            unary: self.unary,
            stream: self.stream,
        }
    }
}

/// Reports start and finish of every call: method, client OS, peer, latency, outcome
#[derive(Clone)]
pub struct LoggingInterceptor {
    sink: Arc<dyn EventSink>,
}

impl LoggingInterceptor {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self { sink }
    }

    fn started(&self, ctx: &CallContext) -> CallEvent {
        CallEvent::Started {
            method: ctx.method().to_string(),
            request_id: ctx.request_id().to_string(),
            client_os: client_os(ctx),
            peer: ctx.peer(),
        }
    }

    fn finished<T>(&self, ctx: &CallContext, started: Instant, result: &Result<T>) -> CallEvent {
        CallEvent::Finished {
            method: ctx.method().to_string(),
            request_id: ctx.request_id().to_string(),
            client_os: client_os(ctx),
            peer: ctx.peer(),
            duration: started.elapsed(),
            code: result.as_ref().err().map_or(Code::Ok, Error::code),
            error: result.as_ref().err().map(ToString::to_string),
        }
    }
}

impl Default for LoggingInterceptor {
    fn default() -> Self {
        Self::new(Arc::new(TracingSink))
    }
}

fn client_os(ctx: &CallContext) -> Option<String> {
    ctx.inbound()
        .and_then(|md| md.get_first(CLIENT_OS))
        .map(str::to_string)
}

#[async_trait]
impl UnaryInterceptor for LoggingInterceptor {
    async fn intercept(
        &self,
        ctx: &mut CallContext,
        request: DynMessage,
        next: UnaryNext<'_>,
    ) -> Result<DynMessage> {
        self.sink.record(&self.started(ctx));
        let started = Instant::now();
        let result = next.run(ctx, request).await;
        self.sink.record(&self.finished(ctx, started, &result));
        result
    }
}

#[async_trait]
impl StreamInterceptor for LoggingInterceptor {
    async fn intercept(&self, stream: &mut dyn ServerStream, next: StreamNext<'_>) -> Result<()> {
        self.sink.record(&self.started(stream.context()));
        let started = Instant::now();
        let result = next.run(stream).await;
        self.sink
            .record(&self.finished(stream.context(), started, &result));
        result
    }
}

/// Wraps the handler's stream so every message sent or received is reported
#[derive(Clone)]
pub struct StreamObserver {
    sink: Arc<dyn EventSink>,
}

impl StreamObserver {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self { sink }
    }
}

impl Default for StreamObserver {
    fn default() -> Self {
        Self::new(Arc::new(TracingSink))
    }
}

#[async_trait]
impl StreamInterceptor for StreamObserver {
    async fn intercept(&self, stream: &mut dyn ServerStream, next: StreamNext<'_>) -> Result<()> {
        let recv_sink = self.sink.clone();
        let send_sink = self.sink.clone();

        let mut observed = StreamWrapper::new(stream)
            .on_recv(move |ctx, message| {
                recv_sink.record(&CallEvent::MessageReceived {
                    method: ctx.method().to_string(),
                    message_type: message.type_name(),
                    at: Utc::now(),
                });
            })
            .on_send(move |ctx, message| {
                send_sink.record(&CallEvent::MessageSent {
                    method: ctx.method().to_string(),
                    message_type: message.type_name(),
                    at: Utc::now(),
                });
            });

        next.run(&mut observed).await
    }
}

/// Turns a panicking handler into an `Internal` status
#[derive(Debug, Default, Clone, Copy)]
pub struct RecoverInterceptor;

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[async_trait]
impl UnaryInterceptor for RecoverInterceptor {
    async fn intercept(
        &self,
        ctx: &mut CallContext,
        request: DynMessage,
        next: UnaryNext<'_>,
    ) -> Result<DynMessage> {
        let method = ctx.method().to_string();
        match AssertUnwindSafe(next.run(ctx, request)).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(method = %method, panic = %message, "Handler panicked");
                Err(Error::internal(format!("handler panicked: {}", message)))
            }
        }
    }
}

#[async_trait]
impl StreamInterceptor for RecoverInterceptor {
    async fn intercept(&self, stream: &mut dyn ServerStream, next: StreamNext<'_>) -> Result<()> {
        let method = stream.context().method().to_string();
        match AssertUnwindSafe(next.run(stream)).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(method = %method, panic = %message, "Handler panicked");
                Err(Error::internal(format!("handler panicked: {}", message)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observe::MemorySink;
    use crate::testing::{context, echo, names, Echo, VecStream};
    use bridge_core::{CallShape, Metadata};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Records its id on entry; fails instead of calling through when `fail` is set
    struct Probe {
        id: usize,
        log: Arc<Mutex<Vec<usize>>>,
        fail: bool,
    }

    #[async_trait]
    impl UnaryInterceptor for Probe {
        async fn intercept(
            &self,
            ctx: &mut CallContext,
            request: DynMessage,
            next: UnaryNext<'_>,
        ) -> Result<DynMessage> {
            self.log.lock().unwrap().push(self.id);
            if self.fail {
                return Err(Error::handler(Code::PermissionDenied, format!("probe {}", self.id)));
            }
            ctx.header_mut().append("probe", self.id.to_string());
            next.run(ctx, request).await
        }
    }

    #[async_trait]
    impl StreamInterceptor for Probe {
        async fn intercept(&self, stream: &mut dyn ServerStream, next: StreamNext<'_>) -> Result<()> {
            self.log.lock().unwrap().push(self.id);
            if self.fail {
                return Err(Error::handler(Code::PermissionDenied, format!("probe {}", self.id)));
            }
            next.run(stream).await
        }
    }

    #[derive(Default)]
    struct CountingHandler {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl UnaryHandler for CountingHandler {
        async fn call(&self, _ctx: &mut CallContext, request: DynMessage) -> Result<DynMessage> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(request)
        }
    }

    #[async_trait]
    impl StreamHandler for CountingHandler {
        async fn call(&self, stream: &mut dyn ServerStream) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            while let Some(message) = stream.recv().await? {
                stream.send(message).await?;
            }
            Ok(())
        }
    }

    struct Panicking;

    #[async_trait]
    impl UnaryHandler for Panicking {
        async fn call(&self, _ctx: &mut CallContext, _request: DynMessage) -> Result<DynMessage> {
            panic!("boom");
        }
    }

    fn probes(count: usize, fail_at: Option<usize>, log: &Arc<Mutex<Vec<usize>>>) -> InterceptorChain {
        (0..count)
            .fold(InterceptorChain::builder(), |builder, id| {
                builder.both(Probe {
                    id,
                    log: log.clone(),
                    fail: fail_at == Some(id),
                })
            })
            .build()
    }

    #[tokio::test]
    async fn test_unary_runs_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = probes(5, None, &log);
        let handler = CountingHandler::default();
        let mut ctx = context(CallShape::Unary);

        let response = chain.run_unary(&handler, &mut ctx, echo("x")).await.unwrap();

        assert_eq!(*log.lock().unwrap(), [0, 1, 2, 3, 4]);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(response.downcast_ref::<Echo>().unwrap().name, "x");
        assert_eq!(ctx.take_header().get("probe"), ["0", "1", "2", "3", "4"]);
    }

    #[tokio::test]
    async fn test_failure_at_k_stops_the_chain() {
        for k in 0..4 {
            let log = Arc::new(Mutex::new(Vec::new()));
            let chain = probes(4, Some(k), &log);
            let handler = CountingHandler::default();
            let mut ctx = context(CallShape::Unary);

            let err = chain
                .run_unary(&handler, &mut ctx, echo("x"))
                .await
                .unwrap_err();

            assert_eq!(err.code(), Code::PermissionDenied);
            assert_eq!(*log.lock().unwrap(), (0..=k).collect::<Vec<_>>());
            assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
        }
    }

    #[tokio::test]
    async fn test_stream_chain_order_and_short_circuit() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = probes(3, None, &log);
        let handler = CountingHandler::default();
        let mut stream = VecStream::new(CallShape::BidiStream, [echo("a"), echo("b")]);

        chain.run_stream(&handler, &mut stream).await.unwrap();
        assert_eq!(*log.lock().unwrap(), [0, 1, 2]);
        assert_eq!(names(&stream.sent), ["a", "b"]);

        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = probes(3, Some(1), &log);
        let handler = CountingHandler::default();
        let mut stream = VecStream::new(CallShape::BidiStream, [echo("a")]);
        assert!(chain.run_stream(&handler, &mut stream).await.is_err());
        assert_eq!(*log.lock().unwrap(), [0, 1]);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
        assert!(stream.sent.is_empty());
    }

    #[tokio::test]
    async fn test_handler_error_passes_through_unchanged() {
        struct Failing;

        #[async_trait]
        impl UnaryHandler for Failing {
            async fn call(&self, _ctx: &mut CallContext, _req: DynMessage) -> Result<DynMessage> {
                Err(Error::handler(Code::FailedPrecondition, "nope"))
            }
        }

        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = probes(3, None, &log);
        let mut ctx = context(CallShape::Unary);
        let err = chain.run_unary(&Failing, &mut ctx, echo("x")).await.unwrap_err();
        assert_eq!(err, Error::handler(Code::FailedPrecondition, "nope"));
    }

    #[tokio::test]
    async fn test_logging_interceptor_reports_outcome() {
        let sink = Arc::new(MemorySink::new());
        let chain = InterceptorChain::builder()
            .unary(LoggingInterceptor::new(sink.clone()))
            .build();
        let handler = CountingHandler::default();
        let mut ctx = context(CallShape::Unary)
            .with_metadata(Metadata::from_pairs([(CLIENT_OS, "linux")]));

        chain.run_unary(&handler, &mut ctx, echo("x")).await.unwrap();

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], CallEvent::Started { client_os: Some(os), .. } if os == "linux"));
        assert!(matches!(&events[1], CallEvent::Finished { code: Code::Ok, error: None, .. }));
    }

    #[tokio::test]
    async fn test_stream_observer_reports_each_message() {
        let sink = Arc::new(MemorySink::new());
        let chain = InterceptorChain::builder()
            .stream(StreamObserver::new(sink.clone()))
            .build();
        let handler = CountingHandler::default();
        let mut stream = VecStream::new(CallShape::BidiStream, [echo("a"), echo("b"), echo("c")]);

        chain.run_stream(&handler, &mut stream).await.unwrap();

        let events = sink.events();
        let received = events
            .iter()
            .filter(|e| matches!(e, CallEvent::MessageReceived { .. }))
            .count();
        let sent = events
            .iter()
            .filter(|e| matches!(e, CallEvent::MessageSent { .. }))
            .count();
        assert_eq!((received, sent), (3, 3));
        assert!(events.iter().all(|e| e.method() == "/test.v1.Test/Echo"));
    }

    #[tokio::test]
    async fn test_recover_turns_panic_into_internal() {
        let chain = InterceptorChain::builder()
            .unary(RecoverInterceptor)
            .build();
        let mut ctx = context(CallShape::Unary);

        let err = chain.run_unary(&Panicking, &mut ctx, echo("x")).await.unwrap_err();

        assert_eq!(err.code(), Code::Internal);
        assert!(err.to_string().contains("boom"));
    }
}
