//! gRPC codec for schema-described messages.

use std::sync::Arc;

use bytes::{Buf, BufMut};
use tonic::Status;
use tonic::codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder};

use crate::registry::MethodDescriptor;
use crate::schema::{Message, MessageSchema, wire};

/// Encodes with one schema and decodes with another.
#[derive(Clone, Debug)]
pub struct MessageCodec {
    encode: Arc<MessageSchema>,
    decode: Arc<MessageSchema>,
}

impl MessageCodec {
    pub fn new(encode: Arc<MessageSchema>, decode: Arc<MessageSchema>) -> Self {
        Self { encode, decode }
    }

    /// Server side: decodes requests, encodes responses.
    pub fn server(method: &MethodDescriptor) -> Self {
        Self::new(Arc::clone(&method.output), Arc::clone(&method.input))
    }

    /// Client side: encodes requests, decodes responses.
    pub fn client(method: &MethodDescriptor) -> Self {
        Self::new(Arc::clone(&method.input), Arc::clone(&method.output))
    }
}

impl Codec for MessageCodec {
    type Encode = Message;
    type Decode = Message;
    type Encoder = MessageEncoder;
    type Decoder = MessageDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        MessageEncoder(Arc::clone(&self.encode))
    }

    fn decoder(&mut self) -> Self::Decoder {
        MessageDecoder(Arc::clone(&self.decode))
    }
}

#[derive(Debug)]
pub struct MessageEncoder(Arc<MessageSchema>);

impl Encoder for MessageEncoder {
    type Item = Message;
    type Error = Status;

    fn encode(&mut self, item: Message, dst: &mut EncodeBuf<'_>) -> Result<(), Status> {
        let bytes = wire::encode(&self.0, &item).map_err(|e| {
            Status::internal(format!("failed to encode {}: {e}", self.0.full_name()))
        })?;
        dst.put(bytes);
        Ok(())
    }
}

#[derive(Debug)]
pub struct MessageDecoder(Arc<MessageSchema>);

impl Decoder for MessageDecoder {
    type Item = Message;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Message>, Status> {
        let bytes = src.copy_to_bytes(src.remaining());
        let message = wire::decode(&self.0, bytes).map_err(|e| {
            Status::internal(format!("failed to decode {}: {e}", self.0.full_name()))
        })?;
        Ok(Some(message))
    }
}
