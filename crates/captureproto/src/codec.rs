//! Length-delimited framing for producer connections.
//!
//! Every message is a 4-byte big-endian length prefix followed by a payload
//! encoded with a [`WireFormat`]. The codec is typed on both directions so
//! each side of the connection gets its own alias: [`HubCodec`] writes
//! commands and reads producer messages, [`ProducerCodec`] the reverse.

use std::marker::PhantomData;

use bytes::{Bytes, BytesMut};
use serde::{de::DeserializeOwned, Serialize};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::messages::{ProducerCommand, ProducerMessage};
use crate::wire::{MsgPackFormat, WireError, WireFormat};

/// Default frame size limit. Large event batches are expected.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Codec used by the hub: sends commands, receives events.
pub type HubCodec = MessageCodec<ProducerCommand, ProducerMessage>;

/// Codec used by producers: sends events, receives commands.
pub type ProducerCodec = MessageCodec<ProducerMessage, ProducerCommand>;

pub struct MessageCodec<Out, In, F = MsgPackFormat> {
    frames: LengthDelimitedCodec,
    _types: PhantomData<fn(Out) -> (In, F)>,
}

impl<Out, In, F> MessageCodec<Out, In, F> {
    pub fn new() -> Self {
        Self::with_max_frame_bytes(DEFAULT_MAX_FRAME_BYTES)
    }

    pub fn with_max_frame_bytes(max_frame_bytes: usize) -> Self {
        let frames = LengthDelimitedCodec::builder()
            .max_frame_length(max_frame_bytes)
            .new_codec();
        Self {
            frames,
            _types: PhantomData,
        }
    }
}

impl<Out, In, F> Default for MessageCodec<Out, In, F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Out, In, F> Encoder<Out> for MessageCodec<Out, In, F>
where
    Out: Serialize,
    F: WireFormat,
{
    type Error = WireError;

    fn encode(&mut self, item: Out, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = F::encode(&item)?;
        self.frames.encode(Bytes::from(payload), dst)?;
        Ok(())
    }
}

impl<Out, In, F> Decoder for MessageCodec<Out, In, F>
where
    In: DeserializeOwned,
    F: WireFormat,
{
    type Item = In;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.frames.decode(src)? {
            Some(frame) => Ok(Some(F::decode(&frame)?)),
            None => Ok(None),
        }
    }
}
