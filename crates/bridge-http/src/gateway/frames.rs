//! JSON framing for streamed bodies
//!
//! Request bodies of client- and bidi-streaming calls are concatenated JSON
//! values, decoded incrementally as chunks arrive. Streamed responses are
//! newline-delimited `{"result": …}` frames, with an `{"error": …}` frame
//! ending the body when the call fails midway.

use super::MAX_BODY_BYTES;
use axum::body::Body;
use bridge_core::{CancelGuard, DynMessage, Error, MessageType, Result, Status, Violation};
use bytes::{Buf, Bytes, BytesMut};
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::convert::Infallible;
use tokio::sync::mpsc;

/// Incremental decoder for a sequence of JSON values. A single value may not
/// grow past `limit` bytes while it is incomplete.
#[derive(Debug)]
pub struct JsonFrameDecoder {
    buf: BytesMut,
    limit: usize,
}

impl Default for JsonFrameDecoder {
    fn default() -> Self {
        Self {
            buf: BytesMut::new(),
            limit: MAX_BODY_BYTES,
        }
    }
}

impl JsonFrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Next complete value, or `Ok(None)` when more input is needed
    pub fn next_value(&mut self) -> Result<Option<Value>> {
        let (item, consumed) = {
            let mut values = serde_json::Deserializer::from_slice(&self.buf).into_iter::<Value>();
            let item = values.next();
            (item, values.byte_offset())
        };

        match item {
            Some(Ok(value)) => {
                self.buf.advance(consumed);
                Ok(Some(value))
            }
            Some(Err(e)) if e.is_eof() => {
                if self.buf.len() > self.limit {
                    return Err(Error::decode(format!(
                        "request message exceeds {} bytes",
                        self.limit
                    )));
                }
                Ok(None)
            }
            Some(Err(e)) => Err(Error::decode(e.to_string())),
            None => {
                // Only whitespace left
                self.buf.clear();
                Ok(None)
            }
        }
    }

    /// Call at end of input; fails if a value was cut off
    pub fn finish(&self) -> Result<()> {
        if self.buf.iter().all(u8::is_ascii_whitespace) {
            Ok(())
        } else {
            Err(Error::decode("request body ended inside a JSON value"))
        }
    }
}

/// Decode request messages from a body as its chunks arrive. The stream
/// ends after the first error.
pub fn decode_request_stream(
    body: Body,
    message_type: MessageType,
) -> BoxStream<'static, Result<DynMessage>> {
    let state = (body.into_data_stream(), JsonFrameDecoder::new());

    futures::stream::unfold(Some(state), move |state| async move {
        let (mut body, mut decoder) = state?;
        loop {
            match decoder.next_value() {
                Ok(Some(value)) => {
                    let item = message_type.decode_json(value);
                    let next = item.is_ok().then_some((body, decoder));
                    return Some((item, next));
                }
                Ok(None) => {}
                Err(err) => return Some((Err(err), None)),
            }

            match body.next().await {
                Some(Ok(chunk)) => decoder.push(&chunk),
                Some(Err(e)) => {
                    return Some((Err(Error::decode(format!("reading request body: {}", e))), None))
                }
                None => {
                    return match decoder.finish() {
                        Ok(()) => None,
                        Err(err) => Some((Err(err), None)),
                    }
                }
            }
        }
    })
    .boxed()
}

/// JSON error body: `{"code", "message", "details"}`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorBody {
    pub code: i32,
    pub message: String,
    pub details: Vec<Violation>,
}

impl From<&Status> for ErrorBody {
    fn from(status: &Status) -> Self {
        Self {
            code: status.code.as_i32(),
            message: status.message.clone(),
            details: status.details.clone(),
        }
    }
}

#[derive(Serialize)]
struct ResultFrame {
    result: Value,
}

#[derive(Serialize)]
struct ErrorFrame {
    error: ErrorBody,
}

pub fn result_frame(message: &DynMessage) -> Result<Bytes> {
    let frame = ResultFrame {
        result: message.to_json()?,
    };
    let mut bytes = serde_json::to_vec(&frame).map_err(|e| Error::internal(e.to_string()))?;
    bytes.push(b'\n');
    Ok(Bytes::from(bytes))
}

pub fn error_frame(status: &Status) -> Bytes {
    let frame = ErrorFrame {
        error: ErrorBody::from(status),
    };
    let mut bytes = serde_json::to_vec(&frame).unwrap_or_default();
    bytes.push(b'\n');
    Bytes::from(bytes)
}

/// Response body frames: `first`, then everything from `responses`. An error
/// item becomes the last frame. The guard cancels the call when the body is
/// dropped.
pub fn response_frames(
    first: DynMessage,
    responses: mpsc::Receiver<Result<DynMessage>>,
    guard: CancelGuard,
) -> impl Stream<Item = std::result::Result<Bytes, Infallible>> + Send + 'static {
    let state = (Some(first), responses, guard);

    futures::stream::unfold(Some(state), |state| async move {
        let (mut pending, mut responses, guard) = state?;
        let next = match pending.take() {
            Some(message) => Some(Ok(message)),
            None => responses.recv().await,
        };

        match next {
            Some(Ok(message)) => match result_frame(&message) {
                Ok(frame) => Some((Ok(frame), Some((None, responses, guard)))),
                Err(err) => Some((Ok(error_frame(&err.to_status())), None)),
            },
            Some(Err(err)) => Some((Ok(error_frame(&err.to_status())), None)),
            None => None,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_core::{CancelHandle, Code};
    use bridge_rpc::hello::HelloRequest;

    fn chunked(chunks: &[&'static str]) -> Body {
        let chunks: Vec<std::result::Result<Bytes, Infallible>> = chunks
            .iter()
            .map(|c| Ok(Bytes::from_static(c.as_bytes())))
            .collect();
        Body::from_stream(futures::stream::iter(chunks))
    }

    #[test]
    fn test_decoder_handles_split_values() {
        let mut decoder = JsonFrameDecoder::new();
        decoder.push(br#"{"name":"a"} {"na"#);
        assert_eq!(decoder.next_value().unwrap().unwrap()["name"], "a");
        assert!(decoder.next_value().unwrap().is_none());
        assert!(decoder.finish().is_err());

        decoder.push(br#"me":"b"}"#);
        decoder.push(b"\n");
        assert_eq!(decoder.next_value().unwrap().unwrap()["name"], "b");
        assert!(decoder.next_value().unwrap().is_none());
        assert!(decoder.finish().is_ok());
    }

    #[test]
    fn test_decoder_limits_pending_value() {
        let mut decoder = JsonFrameDecoder::new().with_limit(16);
        decoder.push(br#"{"name":"a"}{"name":"#);
        assert_eq!(decoder.next_value().unwrap().unwrap()["name"], "a");
        assert!(decoder.next_value().unwrap().is_none());

        decoder.push(b"\"aaaaaaaaaaaaaaaa");
        let err = decoder.next_value().unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[test]
    fn test_complete_values_ignore_limit() {
        let mut decoder = JsonFrameDecoder::new().with_limit(4);
        decoder.push(br#"{"name":"abcdef"}"#);
        assert_eq!(decoder.next_value().unwrap().unwrap()["name"], "abcdef");
    }

    #[test]
    fn test_decoder_rejects_garbage() {
        let mut decoder = JsonFrameDecoder::new();
        decoder.push(b"{\"name\":\"a\"} ]");
        assert!(decoder.next_value().unwrap().is_some());
        assert_eq!(decoder.next_value().unwrap_err().code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_request_stream_across_chunks() {
        let body = chunked(&[r#"{"name":"#, r#""a"}{"name":"b"}"#, "\n", r#"{"name":"c"}"#]);
        let names: Vec<String> = decode_request_stream(body, MessageType::of::<HelloRequest>())
            .map(|item| item.unwrap().downcast::<HelloRequest>().unwrap().name)
            .collect()
            .await;
        assert_eq!(names, ["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_request_stream_stops_at_bad_value() {
        let body = chunked(&[r#"{"name":"a"} [1] {"name":"c"}"#]);
        let items: Vec<_> = decode_request_stream(body, MessageType::of::<HelloRequest>())
            .collect()
            .await;
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(matches!(items[1], Err(Error::Decode(_))));
    }

    #[tokio::test]
    async fn test_truncated_body_is_decode_error() {
        let body = chunked(&[r#"{"name":"a"}{"name""#]);
        let items: Vec<_> = decode_request_stream(body, MessageType::of::<HelloRequest>())
            .collect()
            .await;
        assert_eq!(items.len(), 2);
        assert!(matches!(items[1], Err(Error::Decode(_))));
    }

    #[tokio::test]
    async fn test_error_item_is_last_frame() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(Ok(Box::new(HelloRequest::new("b", "")) as DynMessage))
            .await
            .unwrap();
        tx.send(Err(Error::handler(Code::Internal, "boom"))).await.unwrap();
        tx.send(Ok(Box::new(HelloRequest::new("never", "")) as DynMessage))
            .await
            .unwrap();
        drop(tx);

        let first: DynMessage = Box::new(HelloRequest::new("a", ""));
        let frames: Vec<Bytes> = response_frames(first, rx, CancelHandle::new().guard())
            .map(|f| f.unwrap())
            .collect()
            .await;

        assert_eq!(frames.len(), 3);
        let last: Value = serde_json::from_slice(&frames[2]).unwrap();
        assert_eq!(last["error"]["code"], 13);
        assert_eq!(last["error"]["message"], "boom");
        let second: Value = serde_json::from_slice(&frames[1]).unwrap();
        assert_eq!(second["result"]["name"], "b");
        assert!(frames.iter().all(|f| f.ends_with(b"\n")));
    }
}
