//! HTTP header ↔ call metadata mapping

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use bridge_core::context::GRPC_TIMEOUT;
use bridge_core::Metadata;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::debug;

/// Prefix selecting request headers forwarded as metadata, and marking
/// header metadata on responses
pub const METADATA_HEADER_PREFIX: &str = "Grpc-Metadata-";
/// Prefix marking trailer metadata on responses
pub const METADATA_TRAILER_PREFIX: &str = "Grpc-Trailer-";
/// Prefix for well-known HTTP headers forwarded as metadata
pub const METADATA_PREFIX: &str = "grpcgateway-";
pub const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Maps an inbound header name to a metadata key; `None` drops the header
pub type HeaderMatcher = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Standard HTTP request headers that are forwarded under [`METADATA_PREFIX`]
const PERMANENT_HEADERS: &[&str] = &[
    "accept",
    "accept-charset",
    "accept-language",
    "accept-ranges",
    "authorization",
    "cache-control",
    "content-type",
    "cookie",
    "date",
    "expect",
    "from",
    "host",
    "if-match",
    "if-modified-since",
    "if-none-match",
    "if-schedule-tag-match",
    "if-unmodified-since",
    "max-forwards",
    "origin",
    "pragma",
    "referer",
    "user-agent",
    "via",
    "warning",
];

/// `Grpc-Metadata-*` headers lose the prefix, well-known headers gain
/// `grpcgateway-`, everything else is dropped.
pub fn default_header_matcher(key: &str) -> Option<String> {
    let lower = key.to_ascii_lowercase();
    if PERMANENT_HEADERS.contains(&lower.as_str()) {
        return Some(format!("{}{}", METADATA_PREFIX, lower));
    }
    let prefix = METADATA_HEADER_PREFIX.to_ascii_lowercase();
    lower
        .strip_prefix(&prefix)
        .filter(|rest| !rest.is_empty())
        .map(str::to_string)
}

/// The default mapping, plus `Authorization` forwarded as `token_key`
pub fn token_header_matcher(token_key: impl Into<String>) -> HeaderMatcher {
    let token_key = token_key.into();
    Arc::new(move |key: &str| {
        if key.eq_ignore_ascii_case("authorization") {
            Some(token_key.clone())
        } else {
            default_header_matcher(key)
        }
    })
}

pub fn default_matcher() -> HeaderMatcher {
    Arc::new(default_header_matcher)
}

/// Build inbound call metadata from request headers.
///
/// `Grpc-Timeout` passes through unchanged so the call gets its deadline, and
/// the client address is appended to `x-forwarded-for`.
pub fn incoming_metadata(
    headers: &HeaderMap,
    matcher: &HeaderMatcher,
    peer: Option<SocketAddr>,
) -> Metadata {
    let mut metadata = Metadata::new();
    for (name, value) in headers {
        let Ok(value) = value.to_str() else {
            debug!(header = %name, "Dropping non-UTF-8 header");
            continue;
        };
        if name.as_str() == GRPC_TIMEOUT {
            metadata.append(GRPC_TIMEOUT, value);
            continue;
        }
        if let Some(key) = matcher(name.as_str()) {
            metadata.append(&key, value);
        }
    }

    if let Some(peer) = peer {
        let client = peer.ip().to_string();
        let forwarded = match headers
            .get(X_FORWARDED_FOR)
            .and_then(|v| v.to_str().ok())
        {
            Some(existing) if !existing.is_empty() => format!("{}, {}", existing, client),
            _ => client,
        };
        metadata.insert(X_FORWARDED_FOR, forwarded);
    }
    metadata
}

/// Write header and trailer metadata as `Grpc-Metadata-*` / `Grpc-Trailer-*`
/// response headers. Values are appended, never replacing earlier ones.
pub fn append_response_metadata(headers: &mut HeaderMap, header: &Metadata, trailer: &Metadata) {
    append_prefixed(headers, METADATA_HEADER_PREFIX, header);
    append_prefixed(headers, METADATA_TRAILER_PREFIX, trailer);
}

fn append_prefixed(headers: &mut HeaderMap, prefix: &str, metadata: &Metadata) {
    for (key, value) in metadata.pairs() {
        let name = HeaderName::try_from(format!("{}{}", prefix, key));
        let value = HeaderValue::from_str(value);
        match (name, value) {
            (Ok(name), Ok(value)) => {
                headers.append(name, value);
            }
            _ => debug!(key = %key, "Skipping metadata not representable as an HTTP header"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_matcher() {
        assert_eq!(
            default_header_matcher("Grpc-Metadata-Client-Os").as_deref(),
            Some("client-os")
        );
        assert_eq!(
            default_header_matcher("User-Agent").as_deref(),
            Some("grpcgateway-user-agent")
        );
        assert_eq!(
            default_header_matcher("Authorization").as_deref(),
            Some("grpcgateway-authorization")
        );
        assert_eq!(default_header_matcher("Grpc-Metadata-"), None);
        assert_eq!(default_header_matcher("X-Custom"), None);
    }

    #[test]
    fn test_token_matcher_maps_authorization() {
        let matcher = token_header_matcher("token");
        assert_eq!(matcher("authorization").as_deref(), Some("token"));
        assert_eq!(matcher("AUTHORIZATION").as_deref(), Some("token"));
        assert_eq!(matcher("grpc-metadata-uid").as_deref(), Some("uid"));
        assert_eq!(matcher("x-other"), None);
    }

    #[test]
    fn test_incoming_metadata() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer abc"));
        headers.insert("grpc-metadata-uid", HeaderValue::from_static("1001"));
        headers.insert("grpc-timeout", HeaderValue::from_static("5S"));
        headers.insert("x-forwarded-for", HeaderValue::from_static("10.0.0.1"));

        let peer: SocketAddr = "192.168.1.7:4000".parse().unwrap();
        let metadata = incoming_metadata(&headers, &token_header_matcher("token"), Some(peer));

        assert_eq!(metadata.get_first("token"), Some("Bearer abc"));
        assert_eq!(metadata.get_first("uid"), Some("1001"));
        assert_eq!(metadata.get_first("grpc-timeout"), Some("5S"));
        assert_eq!(
            metadata.get_first("x-forwarded-for"),
            Some("10.0.0.1, 192.168.1.7")
        );
    }

    #[test]
    fn test_response_metadata_is_appended() {
        let mut headers = HeaderMap::new();
        let header = Metadata::from_pairs([("k", "1"), ("k", "2")]);
        let trailer = Metadata::from_pairs([("k", "3")]);
        append_response_metadata(&mut headers, &header, &trailer);
        append_response_metadata(&mut headers, &Metadata::from_pairs([("k", "4")]), &Metadata::new());

        let values: Vec<_> = headers
            .get_all("grpc-metadata-k")
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect();
        assert_eq!(values, ["1", "2", "4"]);
        assert_eq!(headers.get("grpc-trailer-k").unwrap(), "3");
    }
}
