//! Shared fixtures for unit tests

use crate::handler::ServerStream;
use async_trait::async_trait;
use bridge_core::{
    CallContext, CallDescriptor, CallShape, CancelToken, DynMessage, Error, MessageType, Result,
};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct Echo {
    #[prost(string, tag = "1")]
    pub name: String,
}

pub fn echo(name: &str) -> DynMessage {
    Box::new(Echo {
        name: name.to_string(),
    })
}

pub fn names(messages: &[DynMessage]) -> Vec<String> {
    messages
        .iter()
        .map(|m| {
            m.downcast_ref::<Echo>()
                .map(|e| e.name.clone())
                .unwrap_or_default()
        })
        .collect()
}

pub fn descriptor(shape: CallShape) -> Arc<CallDescriptor> {
    Arc::new(CallDescriptor::new(
        "test.v1.Test",
        "Echo",
        shape,
        MessageType::of::<Echo>(),
        MessageType::of::<Echo>(),
    ))
}

pub fn context(shape: CallShape) -> CallContext {
    CallContext::new(descriptor(shape), CancelToken::never())
}

/// In-memory stream with preset inputs that records what the handler sends
pub struct VecStream {
    ctx: CallContext,
    inputs: VecDeque<DynMessage>,
    pub sent: Vec<DynMessage>,
    received: usize,
    fail_after: Option<(usize, Error)>,
    closed: bool,
}

impl VecStream {
    pub fn new(shape: CallShape, inputs: impl IntoIterator<Item = DynMessage>) -> Self {
        Self::with_context(context(shape), inputs)
    }

    pub fn with_context(ctx: CallContext, inputs: impl IntoIterator<Item = DynMessage>) -> Self {
        Self {
            ctx,
            inputs: inputs.into_iter().collect(),
            sent: Vec::new(),
            received: 0,
            fail_after: None,
            closed: false,
        }
    }

    /// Fail `recv` with `err` once `count` messages were delivered
    pub fn fail_recv_after(&mut self, count: usize, err: Error) {
        self.fail_after = Some((count, err));
    }
}

#[async_trait]
impl ServerStream for VecStream {
    fn context(&self) -> &CallContext {
        &self.ctx
    }

    fn context_mut(&mut self) -> &mut CallContext {
        &mut self.ctx
    }

    async fn recv(&mut self) -> Result<Option<DynMessage>> {
        if let Some((count, err)) = &self.fail_after {
            if self.received >= *count {
                return Err(err.clone());
            }
        }
        let next = self.inputs.pop_front();
        if next.is_some() {
            self.received += 1;
        }
        Ok(next)
    }

    async fn send(&mut self, message: DynMessage) -> Result<()> {
        let single = self.ctx.descriptor().shape.single_response();
        if self.closed || (single && !self.sent.is_empty()) {
            return Err(Error::StreamClosed);
        }
        self.sent.push(message);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}
