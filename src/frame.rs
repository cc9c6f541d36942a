use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpCode {
    Continue,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    pub fn from(byte: u8) -> Result<Self, Error> {
        match byte {
            0x0 => Ok(OpCode::Continue),
            0x1 => Ok(OpCode::Text),
            0x2 => Ok(OpCode::Binary),
            0x8 => Ok(OpCode::Close),
            0x9 => Ok(OpCode::Ping),
            0xA => Ok(OpCode::Pong),
            _ => Err(Error::InvalidOpcode),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            OpCode::Continue => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }

    pub fn is_control(&self) -> bool {
        matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub final_fragment: bool,
    pub opcode: OpCode,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(final_fragment: bool, opcode: OpCode, payload: Vec<u8>) -> Self {
        Self {
            final_fragment,
            opcode,
            payload,
        }
    }

    pub fn close() -> Self {
        Self::new(true, OpCode::Close, Vec::new())
    }
}

// Reads the frame header fields from the first two bytes of a frame. The
// length returned here is the 7-bit length, which may still be an extended
// length marker (126 or 127).
pub(crate) fn parse_header(header: [u8; 2]) -> Result<(bool, OpCode, bool, usize), Error> {
    // The first bit in the first byte in the frame tells us whether the current frame is the final fragment of a message
    let final_fragment = (header[0] & 0b10000000) != 0;

    // RSV bits are only set when an extension was negotiated, and we never negotiate any
    if header[0] & 0b01110000 != 0 {
        return Err(Error::RSVNotZero);
    }

    let opcode = OpCode::from(header[0] & 0b00001111)?;

    // Control opcodes (ping, pong, close) can't be fragmented
    if !final_fragment && opcode.is_control() {
        return Err(Error::ControlFramesFragmented);
    }

    let masked = (header[1] & 0b10000000) != 0;
    let length = (header[1] & 0b01111111) as usize;

    if opcode.is_control() && length > 125 {
        return Err(Error::ControlFramePayloadSize);
    }

    Ok((final_fragment, opcode, masked, length))
}

// The mask is applied using a bitwise XOR, each byte of the payload is XOR'd with
// the corresponding byte (modulo 4) of the 4-byte masking key. Applying it twice
// gives back the original payload.
pub(crate) fn apply_mask(payload: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask[i % 4];
    }
}
