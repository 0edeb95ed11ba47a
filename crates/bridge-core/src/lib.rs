//! Core types for rpc-bridge
//!
//! # Modules
//!
//! - `config`: Environment file loading and typed getters
//! - `context`: Per-call context, deadlines and cancellation
//! - `credential`: Verified caller identity
//! - `descriptor`: Call shapes and method descriptors
//! - `error`: Error types and Result alias
//! - `message`: Type-erased messages shared by both transports
//! - `metadata`: Call metadata multimap
//! - `status`: RPC status codes and the HTTP status table

pub mod config;
pub mod context;
pub mod credential;
pub mod descriptor;
pub mod error;
pub mod message;
pub mod metadata;
pub mod status;

// Re-exports
pub use context::{CallContext, CallWatch, CancelGuard, CancelHandle, CancelToken};
pub use credential::Credential;
pub use descriptor::{CallDescriptor, CallShape, MessageType};
pub use error::{Error, Result};
pub use message::{boxed, AnyMessage, DynMessage, RpcMessage};
pub use metadata::Metadata;
pub use status::{Code, Status, Violation};
