use crate::config::ClientConfig;
use crate::connection::WSConnection;
use crate::error::Error;
use crate::frame::{Frame, OpCode};
use crate::read::ReadStream;
use crate::request::{construct_upgrade_request, parse_target, ResponseExt};
use crate::stream::SwarmStream;
use crate::utils::{generate_websocket_accept_value, generate_websocket_key};
use crate::write::{Writer, WriterKind};
use log::debug;
use tokio::io::{split, AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::time::{timeout, Duration};
use tokio_stream::wrappers::UnboundedReceiverStream;

pub(crate) const SEC_WEBSOCKET_ACCEPT: &str = "Sec-WebSocket-Accept";
pub(crate) const MAX_HEADER_SIZE: usize = 1024 * 16;
const HANDSHAKE_TIMEOUT: u64 = 10;

pub async fn connect_async(addr: &str) -> Result<WSConnection, Error> {
    connect_async_with_config(addr, None).await
}

// Opens the socket (plain or TLS, depending on the URL scheme), performs the
// upgrade, and spawns the reader and writer tasks that back the returned connection
pub async fn connect_async_with_config(
    addr: &str,
    client_config: Option<ClientConfig>,
) -> Result<WSConnection, Error> {
    let client_config = client_config.unwrap_or_default();
    let target = parse_target(addr)?;
    let key = generate_websocket_key();
    let request = construct_upgrade_request(&target, &key, &client_config.headers);

    let stream = SwarmStream::connect(&target, client_config.ca_file.as_deref()).await?;
    let (reader, mut write_half) = split(stream);
    let mut buf_reader = BufReader::new(reader);

    write_half.write_all(request.as_bytes()).await?;
    write_half.flush().await?;

    let header = timeout(
        Duration::from_secs(HANDSHAKE_TIMEOUT),
        read_http_header(&mut buf_reader),
    )
    .await??;
    verify_upgrade_response(&header, &key)?;
    debug!("websocket upgrade accepted by {}", target.host_with_port);

    // The reader sends pongs and close replies through this internal channel, so
    // only the writer task ever touches the write half
    let (write_tx, write_rx) = unbounded_channel::<Frame>();
    let (internal_tx, internal_rx) = unbounded_channel::<Frame>();
    let (read_tx, read_rx) = unbounded_channel();

    let web_socket_config = client_config.web_socket_config;
    let mut read_stream = ReadStream::new(
        buf_reader,
        web_socket_config.clone(),
        read_tx.clone(),
        internal_tx,
    );
    let writer = Writer::new(write_half, WriterKind::Client);

    // BufReader keeps whatever bytes came after the header, so a frame the server sent
    // right after the 101 response is not lost
    tokio::spawn(async move {
        if let Err(err) = read_stream.poll_messages().await {
            // A failing read ends the stream; the consumer gets the cause first
            let _ = read_tx.send(Err(err));
        }
    });

    let writer_task = tokio::spawn(run_writer(writer, write_rx, internal_rx));

    Ok(WSConnection::new(
        UnboundedReceiverStream::new(read_rx),
        write_tx,
        writer_task,
        web_socket_config,
    ))
}

// Writes every frame coming from the connection handle or from the reader task, and
// stops once a close frame was written or both senders are gone
async fn run_writer<W: tokio::io::AsyncWrite + Unpin>(
    mut writer: Writer<W>,
    mut write_rx: UnboundedReceiver<Frame>,
    mut internal_rx: UnboundedReceiver<Frame>,
) {
    let mut internal_open = true;

    loop {
        let frame = tokio::select! {
            frame = internal_rx.recv(), if internal_open => match frame {
                Some(frame) => frame,
                None => {
                    internal_open = false;
                    continue;
                }
            },
            frame = write_rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let is_close = frame.opcode == OpCode::Close;
        if let Err(err) = writer.write_frame(frame).await {
            debug!("failed to write frame: {}", err);
            break;
        }
        if is_close {
            break;
        }
    }

    let _ = writer.shutdown().await;
}

// Reads the response header line by line, leaving the rest of the data buffered
pub(crate) async fn read_http_header<R: AsyncRead + Unpin>(
    buf_reader: &mut BufReader<R>,
) -> Result<Vec<u8>, Error> {
    let mut header = Vec::with_capacity(1024);

    loop {
        let n = buf_reader.read_until(b'\n', &mut header).await?;
        if n == 0 {
            return Err(Error::IncompleteHTTPResponse);
        }
        if header.ends_with(b"\r\n\r\n") {
            return Ok(header);
        }
        // Limit the amount of header data, a peer that never ends its header
        // shouldn't make us buffer forever
        if header.len() > MAX_HEADER_SIZE {
            return Err(Error::IncompleteHTTPResponse);
        }
    }
}

fn verify_upgrade_response(header: &[u8], key: &str) -> Result<(), Error> {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut response = httparse::Response::new(&mut headers);

    if response.parse(header)?.is_partial() {
        return Err(Error::IncompleteHTTPResponse);
    }

    let status = response.code.unwrap_or_default();
    if status != 101 {
        return Err(Error::NoUpgrade(status));
    }

    let accept = response
        .get_header_value(SEC_WEBSOCKET_ACCEPT)
        .ok_or(Error::InvalidAcceptKey)?;
    if accept.trim() != generate_websocket_accept_value(key) {
        return Err(Error::InvalidAcceptKey);
    }

    Ok(())
}
