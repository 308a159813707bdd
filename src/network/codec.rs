//! Wire framing codec
//!
//! Converts the raw TCP byte stream to and from typed messages using the
//! 24-byte frame header (magic, command, length, double-SHA256 checksum).
//! A malformed header or checksum is an `io::Error`, which tears down the
//! connection; a well-framed unknown command decodes to `Message::Unknown`
//! and is tolerated.

use crate::core::serialize::{Decoder as WireDecoder, Encoder as WireEncoder};
use crate::crypto::checksum;
use crate::network::message::{Message, MessageHeader, MAX_MESSAGE_SIZE};
use bytes::{Buf, BufMut, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

/// Frame codec bound to one network's magic
pub struct MessageCodec {
    magic: u32,
}

impl MessageCodec {
    pub fn new(magic: u32) -> Self {
        Self { magic }
    }
}

fn invalid(reason: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, reason)
}

impl Encoder<Message> for MessageCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = item.encode_payload();
        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(invalid(format!(
                "refusing to send oversized {} payload ({} bytes)",
                item.command(),
                payload.len()
            )));
        }
        let header = MessageHeader::for_payload(
            self.magic,
            item.command(),
            payload.len() as u32,
            checksum(&payload),
        );
        let mut enc = WireEncoder::with_capacity(MessageHeader::SIZE);
        header.encode(&mut enc);

        dst.reserve(MessageHeader::SIZE + payload.len());
        dst.put_slice(&enc.into_inner());
        dst.put_slice(&payload);
        Ok(())
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < MessageHeader::SIZE {
            return Ok(None);
        }

        let mut dec = WireDecoder::new(&src[..MessageHeader::SIZE]);
        let header = MessageHeader::decode(&mut dec)
            .map_err(|err| invalid(format!("bad message header: {err}")))?;

        if header.magic != self.magic {
            return Err(invalid(format!("invalid magic {:#010x}", header.magic)));
        }
        let payload_len = header.payload_len as usize;
        if payload_len > MAX_MESSAGE_SIZE {
            return Err(invalid(format!("oversized payload ({payload_len} bytes)")));
        }
        let Some(command) = header.command_str().map(str::to_owned) else {
            return Err(invalid("non-ascii command field".to_string()));
        };

        if src.len() < MessageHeader::SIZE + payload_len {
            // Wait for the rest of the frame
            src.reserve(MessageHeader::SIZE + payload_len - src.len());
            return Ok(None);
        }

        src.advance(MessageHeader::SIZE);
        let payload = src.split_to(payload_len);

        if checksum(&payload) != header.checksum {
            return Err(invalid(format!("checksum mismatch on '{command}'")));
        }

        let message = Message::decode(&command, &payload)
            .map_err(|err| invalid(format!("bad '{command}' payload: {err}")))?;
        Ok(Some(message))
    }
}
