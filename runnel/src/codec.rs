//! Generic encoding and decoding.
//!
//! This module contains the generic `Codec`, `Encoder` and `Decoder` traits
//! and a protobuf codec based on prost.

use std::marker::PhantomData;

use bytes::{Bytes, BytesMut};
use prost::Message;

use crate::Status;

/// Trait that knows how to encode and decode call messages.
pub trait Codec {
    /// The encodable message.
    type Encode: Send + 'static;
    /// The decodable message.
    type Decode: Send + 'static;

    /// The encoder that can encode a message.
    type Encoder: Encoder<Item = Self::Encode, Error = Status> + Send + 'static;
    /// The encoder that can decode a message.
    type Decoder: Decoder<Item = Self::Decode, Error = Status> + Send + 'static;

    /// Fetch the encoder.
    fn encoder(&mut self) -> Self::Encoder;
    /// Fetch the decoder.
    fn decoder(&mut self) -> Self::Decoder;
}

/// Encodes call messages.
pub trait Encoder {
    /// The type that is encoded.
    type Item;

    /// The type of encoding errors.
    type Error;

    /// Encodes a message into the provided buffer.
    fn encode(&mut self, item: Self::Item, dst: &mut BytesMut) -> Result<(), Self::Error>;
}

/// Decodes call messages.
pub trait Decoder {
    /// The type that is decoded.
    type Item;

    /// The type of decoding errors.
    type Error;

    /// Decode a message from the buffer.
    ///
    /// The buffer contains exactly the bytes of one message, framing is
    /// handled by the transport.
    fn decode(&mut self, src: Bytes) -> Result<Self::Item, Self::Error>;
}

/// A [`Codec`] for protobuf messages via the prost library.
#[derive(Debug, Clone)]
pub struct ProstCodec<T, U> {
    _pd: PhantomData<(T, U)>,
}

impl<T, U> Default for ProstCodec<T, U> {
    fn default() -> Self {
        Self { _pd: PhantomData }
    }
}

impl<T, U> Codec for ProstCodec<T, U>
where
    T: Message + Send + 'static,
    U: Message + Default + Send + 'static,
{
    type Encode = T;
    type Decode = U;

    type Encoder = ProstEncoder<T>;
    type Decoder = ProstDecoder<U>;

    fn encoder(&mut self) -> Self::Encoder {
        ProstEncoder(PhantomData)
    }

    fn decoder(&mut self) -> Self::Decoder {
        ProstDecoder(PhantomData)
    }
}

/// A [`Encoder`] that knows how to encode `T`.
#[derive(Debug, Clone, Default)]
pub struct ProstEncoder<T>(PhantomData<T>);

impl<T: Message> Encoder for ProstEncoder<T> {
    type Item = T;
    type Error = Status;

    fn encode(&mut self, item: Self::Item, buf: &mut BytesMut) -> Result<(), Self::Error> {
        // BytesMut grows on demand, so this only fails on a broken Message impl.
        item.encode(buf)
            .map_err(|err| Status::codec(err.to_string()))
    }
}

/// A [`Decoder`] that knows how to decode `U`.
#[derive(Debug, Clone, Default)]
pub struct ProstDecoder<U>(PhantomData<U>);

impl<U: Message + Default> Decoder for ProstDecoder<U> {
    type Item = U;
    type Error = Status;

    fn decode(&mut self, buf: Bytes) -> Result<Self::Item, Self::Error> {
        Message::decode(buf).map_err(from_decode_error)
    }
}

fn from_decode_error(error: prost::DecodeError) -> Status {
    Status::codec(error.to_string())
}
