use crate::config::WebSocketConfig;
use crate::error::Error;
use crate::frame::Frame;
use crate::message::Message;
use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_stream::wrappers::UnboundedReceiverStream;

const CLOSE_TIMEOUT: u64 = 5;

// Client side of an established websocket connection. Reading is done by polling
// it as a Stream of messages, writes go through the channel consumed by the
// writer task spawned in the handshake.
pub struct WSConnection {
    read: UnboundedReceiverStream<Result<Message, Error>>,
    write: UnboundedSender<Frame>,
    writer_task: Option<JoinHandle<()>>,
    web_socket_config: WebSocketConfig,
}

impl WSConnection {
    pub fn new(
        read: UnboundedReceiverStream<Result<Message, Error>>,
        write: UnboundedSender<Frame>,
        writer_task: JoinHandle<()>,
        web_socket_config: WebSocketConfig,
    ) -> Self {
        Self {
            read,
            write,
            writer_task: Some(writer_task),
            web_socket_config,
        }
    }

    pub fn send_text(&self, text: String) -> Result<(), Error> {
        self.send_message(Message::Text(text))
    }

    pub fn send_message(&self, message: Message) -> Result<(), Error> {
        let max_message_size = self.web_socket_config.max_message_size.unwrap_or_default();
        if max_message_size > 0 && message.as_binary().len() > max_message_size {
            return Err(Error::MaxMessageSize);
        }

        let max_frame_size = self.web_socket_config.max_frame_size.unwrap_or_default();
        for frame in message.to_frames(max_frame_size) {
            self.write.send(frame).map_err(|_| Error::ConnectionClosed)?;
        }
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        !self.write.is_closed()
    }

    // Sends the close frame and waits for the writer to flush it. Calling it on an
    // already closed connection is fine.
    pub async fn close_connection(&mut self) -> Result<(), Error> {
        let Some(writer_task) = self.writer_task.take() else {
            return Ok(());
        };

        // If the writer is already gone, the socket is closed too
        let _ = self.write.send(Frame::close());

        match timeout(Duration::from_secs(CLOSE_TIMEOUT), writer_task).await {
            Ok(_) => Ok(()),
            Err(err) => Err(err)?,
        }
    }
}

impl Stream for WSConnection {
    type Item = Result<Message, Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        Pin::new(&mut this.read).poll_next(cx)
    }
}
