//! tonic codec for type-erased messages

use bridge_core::{DynMessage, MessageType};
use bytes::{Buf, BufMut};
use tonic::codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder};
use tonic::Status;

/// Encodes any [`DynMessage`] and decodes the configured message type
#[derive(Debug, Clone, Copy)]
pub struct DynCodec {
    decode_as: MessageType,
}

impl DynCodec {
    pub fn new(decode_as: MessageType) -> Self {
        Self { decode_as }
    }
}

impl Codec for DynCodec {
    type Encode = DynMessage;
    type Decode = DynMessage;
    type Encoder = DynEncoder;
    type Decoder = DynDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        DynEncoder
    }

    fn decoder(&mut self) -> Self::Decoder {
        DynDecoder {
            decode_as: self.decode_as,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DynEncoder;

impl Encoder for DynEncoder {
    type Item = DynMessage;
    type Error = Status;

    fn encode(&mut self, item: Self::Item, dst: &mut EncodeBuf<'_>) -> Result<(), Self::Error> {
        dst.put_slice(&item.encode_binary());
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DynDecoder {
    decode_as: MessageType,
}

impl Decoder for DynDecoder {
    type Item = DynMessage;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Self::Item>, Self::Error> {
        let bytes = src.copy_to_bytes(src.remaining());
        self.decode_as
            .decode_binary(&bytes)
            .map(Some)
            .map_err(|e| Status::invalid_argument(e.to_string()))
    }
}
