//! Per-call context and cancellation
//!
//! A [`CallContext`] is created when a call is accepted (by the gRPC server,
//! the gateway or a test) and dropped when the call terminates. It carries
//! the inbound metadata, the outbound header/trailer metadata, the peer, the
//! deadline and the cancellation signal.
//!
//! Cancellation is a `tokio::sync::watch` flag: [`CancelHandle`] flips it,
//! any number of [`CancelToken`]s observe it and [`CancelGuard`] flips it on
//! drop, so dropping a response body or stream cancels the call.

use crate::credential::Credential;
use crate::descriptor::CallDescriptor;
use crate::error::Error;
use crate::metadata::Metadata;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use uuid::Uuid;

/// Metadata key carrying the call timeout
pub const GRPC_TIMEOUT: &str = "grpc-timeout";

/// Owner side of a call's cancellation flag
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.tx.subscribe(),
        }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wrap in a guard that cancels when dropped
    pub fn guard(self) -> CancelGuard {
        CancelGuard(self)
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Observer side of a call's cancellation flag
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// A token that is never cancelled
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the call is cancelled. Never resolves if every handle
    /// was dropped without cancelling.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Cancels the call when dropped
#[derive(Debug)]
pub struct CancelGuard(CancelHandle);

impl CancelGuard {
    pub fn handle(&self) -> &CancelHandle {
        &self.0
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// Owned view of a call's termination signals, usable from spawned tasks
#[derive(Debug, Clone)]
pub struct CallWatch {
    cancel: CancelToken,
    deadline: Option<Instant>,
}

impl CallWatch {
    pub fn new(cancel: CancelToken, deadline: Option<Instant>) -> Self {
        Self { cancel, deadline }
    }

    /// Resolves with `Cancelled` or `DeadlineExceeded`, whichever fires first.
    pub async fn done(&self) -> Error {
        let deadline = async {
            match self.deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = self.cancel.cancelled() => Error::Cancelled,
            _ = deadline => Error::DeadlineExceeded,
        }
    }

    /// Non-blocking check, `Some` once the call is over
    pub fn check(&self) -> Option<Error> {
        if self.cancel.is_cancelled() {
            return Some(Error::Cancelled);
        }
        match self.deadline {
            Some(at) if Instant::now() >= at => Some(Error::DeadlineExceeded),
            _ => None,
        }
    }
}

/// Per-invocation state shared by interceptors and the handler
#[derive(Debug)]
pub struct CallContext {
    descriptor: Arc<CallDescriptor>,
    inbound: Option<Metadata>,
    header: Metadata,
    trailer: Metadata,
    peer: Option<SocketAddr>,
    deadline: Option<Instant>,
    cancel: CancelToken,
    credential: Option<Credential>,
    request_id: Uuid,
    started_at: Instant,
}

impl CallContext {
    pub fn new(descriptor: Arc<CallDescriptor>, cancel: CancelToken) -> Self {
        Self {
            descriptor,
            inbound: None,
            header: Metadata::new(),
            trailer: Metadata::new(),
            peer: None,
            deadline: None,
            cancel,
            credential: None,
            request_id: Uuid::new_v4(),
            started_at: Instant::now(),
        }
    }

    /// Attach inbound metadata. A valid `grpc-timeout` entry sets the deadline.
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        let timeout = metadata.get_first(GRPC_TIMEOUT).and_then(parse_grpc_timeout);
        self.inbound = Some(metadata);
        match timeout {
            Some(timeout) => self.with_timeout(timeout),
            None => self,
        }
    }

    pub fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = Some(peer);
        self
    }

    /// Tighten the deadline; an earlier existing deadline is kept.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        let at = Instant::now() + timeout;
        self.with_deadline(at)
    }

    pub fn with_deadline(mut self, at: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) if existing < at => existing,
            _ => at,
        });
        self
    }

    pub fn descriptor(&self) -> &Arc<CallDescriptor> {
        &self.descriptor
    }

    /// `/package.Service/Method`
    pub fn method(&self) -> &str {
        self.descriptor.full_method()
    }

    /// Inbound metadata, `None` when the call arrived without any
    pub fn inbound(&self) -> Option<&Metadata> {
        self.inbound.as_ref()
    }

    pub fn header_mut(&mut self) -> &mut Metadata {
        &mut self.header
    }

    pub fn trailer_mut(&mut self) -> &mut Metadata {
        &mut self.trailer
    }

    pub fn take_header(&mut self) -> Metadata {
        std::mem::take(&mut self.header)
    }

    pub fn take_trailer(&mut self) -> Metadata {
        std::mem::take(&mut self.trailer)
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, if one is set
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn watch(&self) -> CallWatch {
        CallWatch::new(self.cancel.clone(), self.deadline)
    }

    pub fn credential(&self) -> Option<&Credential> {
        self.credential.as_ref()
    }

    pub fn set_credential(&mut self, credential: Credential) {
        self.credential = Some(credential);
    }

    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// Parse a `grpc-timeout` value: up to 8 digits followed by a unit
/// (`H`, `M`, `S`, `m`, `u`, `n`).
pub fn parse_grpc_timeout(value: &str) -> Option<Duration> {
    let value = value.trim();
    if value.len() < 2 {
        return None;
    }
    let (digits, unit) = value.split_at(value.len() - 1);
    if digits.len() > 8 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let amount: u64 = digits.parse().ok()?;

    let duration = match unit {
        "H" => Duration::from_secs(amount * 3600),
        "M" => Duration::from_secs(amount * 60),
        "S" => Duration::from_secs(amount),
        "m" => Duration::from_millis(amount),
        "u" => Duration::from_micros(amount),
        "n" => Duration::from_nanos(amount),
        _ => return None,
    };
    Some(duration)
}

/// Format a duration as a `grpc-timeout` value, choosing the finest unit that fits.
pub fn format_grpc_timeout(timeout: Duration) -> String {
    const MAX: u128 = 99_999_999;
    let nanos = timeout.as_nanos();
    if nanos <= MAX {
        return format!("{}n", nanos);
    }
    let micros = timeout.as_micros();
    if micros <= MAX {
        return format!("{}u", micros);
    }
    let millis = timeout.as_millis();
    if millis <= MAX {
        return format!("{}m", millis);
    }
    let secs = timeout.as_secs() as u128;
    if secs <= MAX {
        return format!("{}S", secs);
    }
    format!("{}M", (secs / 60).min(MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{CallShape, MessageType};
    use crate::message::testing::Ping;

    fn descriptor() -> Arc<CallDescriptor> {
        Arc::new(CallDescriptor::new(
            "test.v1.Test",
            "Ping",
            CallShape::Unary,
            MessageType::of::<Ping>(),
            MessageType::of::<Ping>(),
        ))
    }

    #[test]
    fn test_parse_grpc_timeout_units() {
        assert_eq!(parse_grpc_timeout("1H"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_grpc_timeout("2M"), Some(Duration::from_secs(120)));
        assert_eq!(parse_grpc_timeout("3S"), Some(Duration::from_secs(3)));
        assert_eq!(parse_grpc_timeout("250m"), Some(Duration::from_millis(250)));
        assert_eq!(parse_grpc_timeout("10u"), Some(Duration::from_micros(10)));
        assert_eq!(parse_grpc_timeout("5n"), Some(Duration::from_nanos(5)));
    }

    #[test]
    fn test_parse_grpc_timeout_rejects_garbage() {
        assert_eq!(parse_grpc_timeout(""), None);
        assert_eq!(parse_grpc_timeout("S"), None);
        assert_eq!(parse_grpc_timeout("10x"), None);
        assert_eq!(parse_grpc_timeout("-1S"), None);
        assert_eq!(parse_grpc_timeout("123456789S"), None);
    }

    #[test]
    fn test_format_grpc_timeout_parses_back() {
        for d in [
            Duration::from_millis(1),
            Duration::from_secs(5),
            Duration::from_secs(3600 * 24),
        ] {
            let parsed = parse_grpc_timeout(&format_grpc_timeout(d)).unwrap();
            assert!(parsed <= d);
            assert!(d - parsed < Duration::from_secs(60));
        }
    }

    #[tokio::test]
    async fn test_metadata_timeout_sets_deadline() {
        let md = Metadata::from_pairs([(GRPC_TIMEOUT, "5S")]);
        let ctx = CallContext::new(descriptor(), CancelToken::never()).with_metadata(md);
        let remaining = ctx.remaining().unwrap();
        assert!(remaining <= Duration::from_secs(5));
        assert!(remaining > Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_deadline_only_tightens() {
        let ctx = CallContext::new(descriptor(), CancelToken::never())
            .with_timeout(Duration::from_secs(1))
            .with_timeout(Duration::from_secs(60));
        assert!(ctx.remaining().unwrap() <= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_guard_drop_cancels() {
        let handle = CancelHandle::new();
        let token = handle.token();
        let guard = handle.guard();
        assert!(!token.is_cancelled());
        drop(guard);
        assert!(token.is_cancelled());
        token.cancelled().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_reports_deadline() {
        let ctx = CallContext::new(descriptor(), CancelToken::never())
            .with_timeout(Duration::from_millis(50));
        let err = ctx.watch().done().await;
        assert_eq!(err, Error::DeadlineExceeded);
        assert_eq!(ctx.watch().check(), Some(Error::DeadlineExceeded));
    }

    #[tokio::test]
    async fn test_watch_reports_cancel() {
        let handle = CancelHandle::new();
        let ctx = CallContext::new(descriptor(), handle.token());
        let watch = ctx.watch();
        let waiter = tokio::spawn(async move { watch.done().await });
        handle.cancel();
        assert_eq!(waiter.await.unwrap(), Error::Cancelled);
    }

    #[test]
    fn test_context_without_metadata() {
        let mut ctx = CallContext::new(descriptor(), CancelToken::never());
        assert!(ctx.inbound().is_none());
        assert_eq!(ctx.method(), "/test.v1.Test/Ping");
        ctx.header_mut().append("x", "1");
        assert_eq!(ctx.take_header().get("x"), ["1"]);
        assert!(ctx.take_header().is_empty());
    }
}
