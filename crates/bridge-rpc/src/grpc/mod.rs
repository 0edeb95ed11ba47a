//! gRPC transport
//!
//! Serves the dispatcher over tonic without generated service code: one
//! [`GrpcService`] per protobuf service name routes every path to the
//! registry, and [`DynCodec`] moves type-erased messages on the wire.
//! [`RpcClient`] is the matching client over a tonic channel.

pub mod client;
pub mod codec;
pub mod server;

pub use client::{
    CallOptions, ClientError, ClientReply, ClientResult, ClientStream, ClientTls, RpcClient,
    RpcClientConfig, TokenCredentials,
};
pub use codec::DynCodec;
pub use server::{GrpcServer, GrpcServerConfig, GrpcService, ServiceName, TlsPem};

use bridge_core::{Code, Error, Metadata, Status, Violation};
use bytes::Bytes;
use thiserror::Error;
use tonic::metadata::{AsciiMetadataKey, AsciiMetadataValue, KeyAndValueRef, MetadataMap};
use tracing::debug;

/// Transport setup failures (bind, TLS material, endpoint)
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("gRPC transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid endpoint: {0}")]
    Endpoint(String),
}

/// Copy metadata into a tonic map. Keys or values that are not valid ASCII
/// metadata are skipped.
pub fn append_metadata(map: &mut MetadataMap, metadata: &Metadata) {
    for (key, value) in metadata.pairs() {
        let parsed = (
            AsciiMetadataKey::from_bytes(key.as_bytes()),
            value.parse::<AsciiMetadataValue>(),
        );
        match parsed {
            (Ok(key), Ok(value)) => {
                map.append(key, value);
            }
            _ => debug!(key = %key, "Skipping metadata entry not representable in gRPC"),
        }
    }
}

pub fn to_metadata_map(metadata: &Metadata) -> MetadataMap {
    let mut map = MetadataMap::new();
    append_metadata(&mut map, metadata);
    map
}

/// ASCII entries of a tonic map; binary entries are dropped
pub fn from_metadata_map(map: &MetadataMap) -> Metadata {
    let mut metadata = Metadata::new();
    for entry in map.iter() {
        if let KeyAndValueRef::Ascii(key, value) = entry {
            if let Ok(value) = value.to_str() {
                metadata.append(key.as_str(), value);
            }
        }
    }
    metadata
}

/// Status → tonic status. Violations travel as JSON in the status details.
pub fn to_tonic_status(status: &Status, metadata: &Metadata) -> tonic::Status {
    let details = if status.details.is_empty() {
        Bytes::new()
    } else {
        serde_json::to_vec(&status.details)
            .map(Bytes::from)
            .unwrap_or_default()
    };
    tonic::Status::with_details_and_metadata(
        tonic::Code::from_i32(status.code.as_i32()),
        status.message.clone(),
        details,
        to_metadata_map(metadata),
    )
}

/// tonic status → Status, reading JSON violations back when present
pub fn from_tonic_status(status: &tonic::Status) -> Status {
    let details: Vec<Violation> = if status.details().is_empty() {
        Vec::new()
    } else {
        serde_json::from_slice(status.details()).unwrap_or_default()
    };
    Status::new(Code::from_i32(status.code() as i32), status.message()).with_details(details)
}

/// tonic status → bridge error
pub fn status_error(status: tonic::Status) -> Error {
    Error::from(from_tonic_status(&status))
}
