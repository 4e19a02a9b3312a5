//! Length-prefixed frame codec for the plugin protocol.
//!
//! Each frame consists of:
//!
//! ```text
//! +---------------------+----------------------+------------------+
//! | length (4 bytes BE) | broker id (4 B, BE)  | payload          |
//! +---------------------+----------------------+------------------+
//! ```
//!
//! The broker id multiplexes sub-channels over one duplex connection:
//! id 0 is the control channel, the ids advertised in a `Handle` request
//! address its Adapter and Propagate sub-channels.
//!
//! Frame length is validated against [`MAX_FRAME_SIZE`] before any
//! allocation, so a hostile or broken peer cannot force memory exhaustion.

use std::io::{Read, Write};

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{Error, Result};

/// Maximum payload size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Length prefix plus broker id.
const HEADER_LEN: usize = 8;

/// The control channel's broker id.
pub const CONTROL_BROKER: u32 = 0;

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub broker_id: u32,
    pub payload: Vec<u8>,
}

/// Writes one frame and flushes.
pub fn write_frame<W: Write>(writer: &mut W, broker_id: u32, payload: &[u8]) -> Result<()> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(Error::Protocol(format!(
            "frame of {} bytes exceeds limit {MAX_FRAME_SIZE}",
            payload.len()
        )));
    }

    let mut header = BytesMut::with_capacity(HEADER_LEN);
    #[allow(clippy::cast_possible_truncation)] // validated above
    header.put_u32(payload.len() as u32);
    header.put_u32(broker_id);

    writer.write_all(&header)?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}

/// Reads one complete frame.
///
/// # Errors
///
/// I/O errors (including read timeouts configured on the stream) surface as
/// [`Error::Io`]; an oversized length prefix is [`Error::Protocol`].
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Frame> {
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header)?;
    let mut buf = &header[..];
    let length = buf.get_u32() as usize;
    let broker_id = buf.get_u32();

    if length > MAX_FRAME_SIZE {
        return Err(Error::Protocol(format!(
            "peer announced frame of {length} bytes, limit is {MAX_FRAME_SIZE}"
        )));
    }

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload)?;
    Ok(Frame { broker_id, payload })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_roundtrip() {
        let mut buf = Vec::new();
        write_frame(&mut buf, 3, b"hello").unwrap();
        // 4-byte length, 4-byte broker, payload.
        assert_eq!(&buf[..4], &[0, 0, 0, 5]);
        assert_eq!(&buf[4..8], &[0, 0, 0, 3]);

        let frame = read_frame(&mut Cursor::new(buf)).unwrap();
        assert_eq!(frame.broker_id, 3);
        assert_eq!(frame.payload, b"hello");
    }

    #[test]
    fn test_empty_payload() {
        let mut buf = Vec::new();
        write_frame(&mut buf, CONTROL_BROKER, b"").unwrap();
        let frame = read_frame(&mut Cursor::new(buf)).unwrap();
        assert!(frame.payload.is_empty());
        assert_eq!(frame.broker_id, CONTROL_BROKER);
    }

    #[test]
    fn test_multiple_frames() {
        let mut buf = Vec::new();
        write_frame(&mut buf, 1, b"first").unwrap();
        write_frame(&mut buf, 2, b"second").unwrap();

        let mut cursor = Cursor::new(buf);
        assert_eq!(read_frame(&mut cursor).unwrap().payload, b"first");
        let second = read_frame(&mut cursor).unwrap();
        assert_eq!(second.broker_id, 2);
        assert_eq!(second.payload, b"second");
    }

    #[test]
    fn test_oversized_length_rejected_before_allocation() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&u32::try_from(MAX_FRAME_SIZE + 1).unwrap().to_be_bytes());
        buf.extend_from_slice(&[0, 0, 0, 0]);
        let err = read_frame(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_truncated_frame() {
        let mut buf = Vec::new();
        write_frame(&mut buf, 1, b"whole").unwrap();
        buf.truncate(buf.len() - 2);
        let err = read_frame(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
