//! Frame codec.
//!
//! ```text
//!   [ opcode: u8 | length: u32 BE | payload: length bytes ]
//! ```
//!
//! The codec never looks inside the payload. Reads are strictly sequential:
//! `read_frame` consumes one whole frame before returning.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::FrameError;

pub const HEADER_LEN: usize = 5;
pub const MAX_PAYLOAD_LEN: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Raw opcode byte; unknown values are preserved so the router can
    /// report them.
    pub opcode: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(opcode: u8, payload: Vec<u8>) -> Self {
        Self { opcode, payload }
    }

    pub fn encode(&self) -> Result<Bytes, FrameError> {
        if self.payload.len() > MAX_PAYLOAD_LEN {
            return Err(FrameError::TooLarge(self.payload.len()));
        }
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_u8(self.opcode);
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }
}

/// Fill `buf` completely, returning how many bytes arrived before EOF.
async fn read_full<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> Result<usize, FrameError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Read one frame.
///
/// EOF on a frame boundary is [`FrameError::Closed`]; EOF anywhere else is
/// [`FrameError::Truncated`]. An announced length above
/// [`MAX_PAYLOAD_LEN`] fails before any payload is read.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame, FrameError> {
    let mut header = [0u8; HEADER_LEN];
    let got = read_full(reader, &mut header).await?;
    if got == 0 {
        return Err(FrameError::Closed);
    }
    if got < HEADER_LEN {
        return Err(FrameError::Truncated { expected: HEADER_LEN, got });
    }

    let opcode = header[0];
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    if len > MAX_PAYLOAD_LEN {
        return Err(FrameError::TooLarge(len));
    }

    let mut payload = vec![0u8; len];
    let got = read_full(reader, &mut payload).await?;
    if got < len {
        return Err(FrameError::Truncated { expected: len, got });
    }
    Ok(Frame { opcode, payload })
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> Result<(), FrameError> {
    let bytes = frame.encode()?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_layout() {
        let bytes = Frame::new(0x02, b"abc".to_vec()).encode().unwrap();
        assert_eq!(&bytes[..], &[0x02, 0, 0, 0, 3, b'a', b'b', b'c']);
    }

    #[tokio::test]
    async fn frames_are_read_back_in_order() {
        let (mut a, mut b) = tokio::io::duplex(64);
        write_frame(&mut a, &Frame::new(1, b"first".to_vec())).await.unwrap();
        write_frame(&mut a, &Frame::new(2, Vec::new())).await.unwrap();
        drop(a);

        assert_eq!(read_frame(&mut b).await.unwrap(), Frame::new(1, b"first".to_vec()));
        assert_eq!(read_frame(&mut b).await.unwrap(), Frame::new(2, Vec::new()));
        assert!(matches!(read_frame(&mut b).await, Err(FrameError::Closed)));
    }

    #[tokio::test]
    async fn truncated_header_and_payload() {
        let mut short_header: &[u8] = &[0x01, 0x00];
        assert!(matches!(
            read_frame(&mut short_header).await,
            Err(FrameError::Truncated { expected: 5, got: 2 })
        ));

        let mut short_payload: &[u8] = &[0x01, 0, 0, 0, 10, b'x'];
        assert!(matches!(
            read_frame(&mut short_payload).await,
            Err(FrameError::Truncated { expected: 10, got: 1 })
        ));
    }

    #[tokio::test]
    async fn oversized_length_is_rejected() {
        let mut header: &[u8] = &[0x01, 0xff, 0xff, 0xff, 0xff];
        assert!(matches!(read_frame(&mut header).await, Err(FrameError::TooLarge(_))));

        let big = Frame::new(1, vec![0u8; MAX_PAYLOAD_LEN + 1]);
        assert!(matches!(big.encode(), Err(FrameError::TooLarge(_))));
    }
}
