use crate::error::Error;
use crate::frame::{Frame, OpCode};

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Text(String),
    Binary(Vec<u8>),
}

impl Message {
    // Converts a complete (possibly reassembled) data payload into a Message variant
    pub fn from_payload(opcode: OpCode, payload: Vec<u8>) -> Result<Self, Error> {
        match opcode {
            OpCode::Text => Ok(Message::Text(String::from_utf8(payload)?)),
            OpCode::Binary => Ok(Message::Binary(payload)),
            _ => Err(Error::InvalidOpcode),
        }
    }

    pub fn as_binary(&self) -> Vec<u8> {
        match self {
            Message::Text(text) => text.as_bytes().to_vec(),
            Message::Binary(data) => data.clone(),
        }
    }

    pub fn as_text(&self) -> Result<String, Error> {
        match self {
            Message::Text(text) => Ok(text.clone()),
            Message::Binary(data) => Ok(String::from_utf8(data.clone())?),
        }
    }

    // Splits the message in frames no bigger than max_frame_size, using Continue
    // opcodes for every frame after the first one
    pub fn to_frames(self, max_frame_size: usize) -> Vec<Frame> {
        let (opcode, payload) = match self {
            Message::Text(text) => (OpCode::Text, text.into_bytes()),
            Message::Binary(data) => (OpCode::Binary, data),
        };

        if payload.len() <= max_frame_size || max_frame_size == 0 {
            return vec![Frame::new(true, opcode, payload)];
        }

        let chunks = payload.chunks(max_frame_size);
        let total_chunks = chunks.len();

        chunks
            .enumerate()
            .map(|(i, chunk)| {
                let opcode = if i == 0 { opcode } else { OpCode::Continue };
                Frame::new(i == total_chunks - 1, opcode, chunk.to_vec())
            })
            .collect()
    }
}
