//! Call observability
//!
//! Interceptors report what happens to a call as [`CallEvent`]s to an
//! injected [`EventSink`]. [`TracingSink`] turns them into `tracing` events;
//! [`MemorySink`] keeps them for assertions.

use bridge_core::Code;
use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Something observable that happened to a call
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    Started {
        method: String,
        request_id: String,
        client_os: Option<String>,
        peer: Option<SocketAddr>,
    },
    Finished {
        method: String,
        request_id: String,
        client_os: Option<String>,
        peer: Option<SocketAddr>,
        duration: Duration,
        code: Code,
        error: Option<String>,
    },
    MessageReceived {
        method: String,
        message_type: &'static str,
        at: DateTime<Utc>,
    },
    MessageSent {
        method: String,
        message_type: &'static str,
        at: DateTime<Utc>,
    },
    AuthRejected {
        method: String,
        reason: String,
    },
}

impl CallEvent {
    pub fn method(&self) -> &str {
        match self {
            CallEvent::Started { method, .. }
            | CallEvent::Finished { method, .. }
            | CallEvent::MessageReceived { method, .. }
            | CallEvent::MessageSent { method, .. }
            | CallEvent::AuthRejected { method, .. } => method,
        }
    }
}

/// Receiver of call events
pub trait EventSink: Send + Sync + 'static {
    fn record(&self, event: &CallEvent);
}

/// Default sink: one `tracing` event per call event
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn record(&self, event: &CallEvent) {
        match event {
            CallEvent::Started {
                method,
                request_id,
                client_os,
                peer,
            } => {
                debug!(
                    method = %method,
                    request_id = %request_id,
                    client_os = client_os.as_deref().unwrap_or(""),
                    peer = ?peer,
                    "RPC started"
                );
            }
            CallEvent::Finished {
                method,
                request_id,
                client_os,
                peer,
                duration,
                code,
                error,
            } => {
                let duration_ms = duration.as_millis() as u64;
                match error {
                    None => info!(
                        method = %method,
                        request_id = %request_id,
                        client_os = client_os.as_deref().unwrap_or(""),
                        peer = ?peer,
                        duration_ms,
                        "RPC finished"
                    ),
                    Some(error) => warn!(
                        method = %method,
                        request_id = %request_id,
                        client_os = client_os.as_deref().unwrap_or(""),
                        peer = ?peer,
                        duration_ms,
                        code = %code,
                        error = %error,
                        "RPC failed"
                    ),
                }
            }
            CallEvent::MessageReceived {
                method,
                message_type,
                at,
            } => {
                debug!(method = %method, message_type, at = %at.to_rfc3339(), "Received message");
            }
            CallEvent::MessageSent {
                method,
                message_type,
                at,
            } => {
                debug!(method = %method, message_type, at = %at.to_rfc3339(), "Sent message");
            }
            CallEvent::AuthRejected { method, reason } => {
                warn!(method = %method, reason = %reason, "Authentication rejected");
            }
        }
    }
}

/// Sink that stores events in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<CallEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<CallEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }
}

impl EventSink for MemorySink {
    fn record(&self, event: &CallEvent) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event.clone());
    }
}
