use crate::{Command, DecodeError, ProtocolError, Result};
use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, warn};

/// Bytes in the length prefix
pub const LENGTH_SIZE: usize = 4;

/// Length prefix plus compression flag
pub const HEADER_SIZE: usize = LENGTH_SIZE + 1;

/// Codec for use with tokio_util::codec::Framed.
///
/// Decoding reassembles complete relay frames from the byte stream. Each
/// emitted frame is the whole length-delimited blob, prefix included, ready
/// for [`crate::decode_message`]. Encoding writes newline-terminated text
/// commands.
#[derive(Debug, Default)]
pub struct RelayCodec {
    max_frame_size: Option<u32>,
}

impl RelayCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects frames declaring more than `max_frame_size` bytes
    pub fn with_max_frame_size(max_frame_size: u32) -> Self {
        Self {
            max_frame_size: Some(max_frame_size),
        }
    }
}

impl tokio_util::codec::Decoder for RelayCodec {
    type Item = Bytes;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        // Need at least 4 bytes for length prefix
        if src.len() < LENGTH_SIZE {
            return Ok(None);
        }

        // Peek at length without consuming. The length counts itself and the
        // compression flag.
        let mut length_bytes = [0u8; LENGTH_SIZE];
        length_bytes.copy_from_slice(&src[..LENGTH_SIZE]);
        let length = u32::from_be_bytes(length_bytes);

        if (length as usize) < HEADER_SIZE {
            warn!("Received frame with impossible length {}", length);
            return Err(DecodeError::InvalidLength(length as i64).into());
        }

        if let Some(max) = self.max_frame_size {
            if length > max {
                warn!("Received oversized frame: {} bytes (max: {})", length, max);
                return Err(ProtocolError::FrameTooLarge(length, max));
            }
        }

        // Check if we have the full frame
        let frame_size = length as usize;
        if src.len() < frame_size {
            // Not enough data yet, reserve space
            src.reserve(frame_size - src.len());
            return Ok(None);
        }

        let frame = src.split_to(frame_size).freeze();
        debug!("Assembled frame of {} bytes ({} still buffered)", frame_size, src.len());

        Ok(Some(frame))
    }
}

impl tokio_util::codec::Encoder<Command> for RelayCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Command, dst: &mut BytesMut) -> Result<()> {
        let line = item.to_string();
        debug!("Sending command: {}", item.redacted());

        dst.reserve(line.len() + 1);
        dst.put_slice(line.as_bytes());
        dst.put_u8(b'\n');

        Ok(())
    }
}
