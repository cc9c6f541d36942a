use crate::config::WebSocketConfig;
use crate::error::Error;
use crate::frame::{apply_mask, parse_header, Frame, OpCode};
use crate::message::Message;
use log::debug;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc::UnboundedSender;

pub struct ReadStream<R: AsyncRead + Unpin> {
    read: R,
    config: WebSocketConfig,
    // opcode of the first frame and the accumulated payload of a fragmented message
    fragmented_message: Option<(OpCode, Vec<u8>)>,
    read_tx: UnboundedSender<Result<Message, Error>>,
    internal_tx: UnboundedSender<Frame>,
}

impl<R: AsyncRead + Unpin> ReadStream<R> {
    pub fn new(
        read: R,
        config: WebSocketConfig,
        read_tx: UnboundedSender<Result<Message, Error>>,
        internal_tx: UnboundedSender<Frame>,
    ) -> Self {
        Self {
            read,
            config,
            fragmented_message: None,
            read_tx,
            internal_tx,
        }
    }

    // Reads frames until the peer closes the connection, the socket fails, or the
    // consumer of read_tx goes away. Control frames are answered here, data frames
    // are reassembled and forwarded as messages.
    pub async fn poll_messages(&mut self) -> Result<(), Error> {
        loop {
            let frame = self.read_frame().await?;

            match frame.opcode {
                OpCode::Continue => {
                    let (opcode, mut payload) = self
                        .fragmented_message
                        .take()
                        .ok_or(Error::InvalidContinuationFrame)?;
                    payload.extend_from_slice(&frame.payload);
                    self.check_message_size(payload.len())?;

                    if frame.final_fragment {
                        self.forward(Message::from_payload(opcode, payload)?)?;
                    } else {
                        self.fragmented_message = Some((opcode, payload));
                    }
                }
                OpCode::Text | OpCode::Binary => {
                    if self.fragmented_message.is_some() {
                        return Err(Error::FragmentedInProgress);
                    }

                    if frame.final_fragment {
                        self.forward(Message::from_payload(frame.opcode, frame.payload)?)?;
                    } else {
                        self.fragmented_message = Some((frame.opcode, frame.payload));
                    }
                }
                OpCode::Close => {
                    debug!("received close frame from peer");
                    // The write side may already be gone if we started the close
                    let _ = self.internal_tx.send(Frame::close());
                    return Ok(());
                }
                OpCode::Ping => {
                    self.internal_tx
                        .send(Frame::new(true, OpCode::Pong, frame.payload))
                        .map_err(|_| Error::CommunicationError)?;
                }
                OpCode::Pong => {}
            }
        }
    }

    fn forward(&self, message: Message) -> Result<(), Error> {
        self.read_tx
            .send(Ok(message))
            .map_err(|_| Error::CommunicationError)
    }

    fn check_message_size(&self, size: usize) -> Result<(), Error> {
        match self.config.max_message_size {
            Some(max) if size > max => Err(Error::MaxMessageSize),
            _ => Ok(()),
        }
    }

    pub async fn read_frame(&mut self) -> Result<Frame, Error> {
        let mut header = [0u8; 2];
        self.read.read_exact(&mut header).await?;

        let (final_fragment, opcode, masked, mut length) = parse_header(header)?;

        if length == 126 {
            let mut be_bytes = [0u8; 2];
            self.read.read_exact(&mut be_bytes).await?;
            length = u16::from_be_bytes(be_bytes) as usize;
        } else if length == 127 {
            let mut be_bytes = [0u8; 8];
            self.read.read_exact(&mut be_bytes).await?;
            length = u64::from_be_bytes(be_bytes) as usize;
        }

        if let Some(max) = self.config.max_frame_size {
            if length > max {
                return Err(Error::MaxFrameSize);
            }
        }

        let mask = if masked {
            let mut mask = [0u8; 4];
            self.read.read_exact(&mut mask).await?;
            Some(mask)
        } else {
            None
        };

        let mut payload = vec![0u8; length];
        self.read.read_exact(&mut payload).await?;

        // Servers shouldn't mask, but we are lenient and unmask whatever we receive
        if let Some(mask) = mask {
            apply_mask(&mut payload, mask);
        }

        Ok(Frame::new(final_fragment, opcode, payload))
    }
}
