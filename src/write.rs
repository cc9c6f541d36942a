use crate::error::Error;
use crate::frame::{apply_mask, Frame};
use crate::utils::generate_mask;
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WriterKind {
    Client,
    Server,
}

pub struct Writer<W: AsyncWrite + Unpin> {
    write_half: W,
    kind: WriterKind,
}

impl<W: AsyncWrite + Unpin> Writer<W> {
    pub fn new(write_half: W, kind: WriterKind) -> Self {
        Self { write_half, kind }
    }

    pub async fn write_frame(&mut self, frame: Frame) -> Result<(), Error> {
        let encoded = encode_frame(frame, self.kind);
        self.write_half.write_all(&encoded).await?;
        self.write_half.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), Error> {
        self.write_half.shutdown().await?;
        Ok(())
    }
}

// Clients must mask every frame they send, servers must never mask. The whole frame
// is assembled in a single buffer, so it reaches the socket in one write.
pub(crate) fn encode_frame(frame: Frame, kind: WriterKind) -> BytesMut {
    let payload_len = frame.payload.len();
    let mut buf = BytesMut::with_capacity(payload_len + 14);

    // The first byte of a websockets frame contains the final fragment bit, and the OpCode
    let first_byte = (frame.final_fragment as u8) << 7 | frame.opcode.as_u8();
    buf.put_u8(first_byte);

    let mask_bit = match kind {
        WriterKind::Client => 0b1000_0000,
        WriterKind::Server => 0,
    };

    // Payloads up to 125 bytes fit in the 7-bit length, up to 65535 use the 16-bit
    // extended length, anything bigger uses the 64-bit one
    if payload_len <= 125 {
        buf.put_u8(mask_bit | payload_len as u8);
    } else if payload_len <= 65535 {
        buf.put_u8(mask_bit | 126);
        buf.put_u16(payload_len as u16);
    } else {
        buf.put_u8(mask_bit | 127);
        buf.put_u64(payload_len as u64);
    }

    let mut payload = frame.payload;
    if kind == WriterKind::Client {
        let mask = generate_mask();
        buf.put_slice(&mask);
        apply_mask(&mut payload, mask);
    }
    buf.put_slice(&payload);

    buf
}
