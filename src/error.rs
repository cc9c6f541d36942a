use crate::frame::Frame;
use httparse::Error as HttpParseError;
use pki_types::InvalidDnsNameError;
use std::fmt;
use std::io;
use time::error::Format as TimeFormatError;
use std::string::FromUtf8Error;
use thiserror::Error;
use tokio::sync::mpsc::error::SendError;
use tokio::time::error::Elapsed;
use url::ParseError;

#[derive(Error, Debug)]
pub enum Error {
    // Sender / Receiver Errors
    #[error("{source}")]
    SendError {
        #[from]
        source: SendError<Frame>,
    },

    #[error("channel communication error")]
    CommunicationError,

    #[error("connection is closed")]
    ConnectionClosed,

    // General Errors
    #[error("{source}")]
    Timeout {
        #[from]
        source: Elapsed,
    },

    #[error("IO Error happened: {source}")]
    IOError {
        #[from]
        source: io::Error,
    },

    #[error("{source}")]
    FromUtf8Error {
        #[from]
        source: FromUtf8Error,
    },

    #[error("{source}")]
    JsonError {
        #[from]
        source: serde_json::Error,
    },

    // Handshake Errors
    #[error("Server didn't upgrade the connection, status: {0}")]
    NoUpgrade(u16),

    #[error("Sever didn't send a valid Sec-WebSocket-Accept key")]
    InvalidAcceptKey,

    #[error("Incomplete HTTP response")]
    IncompleteHTTPResponse,

    #[error("{source}")]
    HttpError {
        #[from]
        source: reqwest::Error,
    },

    // Framing Errors
    #[error("RSV not zero")]
    RSVNotZero,

    #[error("Control frames must not be fragmented")]
    ControlFramesFragmented,

    #[error("Control frame with invalid payload size, can be greater than 125")]
    ControlFramePayloadSize,

    #[error("Max frame size reached")]
    MaxFrameSize,

    #[error("Max message size reached")]
    MaxMessageSize,

    #[error("Incoming fragmented message but there is one already in progress")]
    FragmentedInProgress,

    #[error("Invalid continuation frame: no fragmented message to continue")]
    InvalidContinuationFrame,

    #[error("Invalid Opcode")]
    InvalidOpcode,

    // URL Errors
    #[error("{source}")]
    URLParseError {
        #[from]
        source: ParseError,
    },

    #[error("Invalid scheme in URL: {0}")]
    InvalidSchemeURL(String),

    #[error("URL has no host")]
    URLNoHost,

    #[error("{source}")]
    HttpParseError {
        #[from]
        source: HttpParseError,
    },

    // TLS Errors
    #[error("{source}")]
    DomainError {
        #[from]
        source: InvalidDnsNameError,
    },

    #[error("{source}")]
    TlsError {
        #[from]
        source: rustls::Error,
    },

    // Engine.IO / Socket.IO Errors
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    #[error("Unexpected packet while {0}")]
    UnexpectedPacket(&'static str),

    #[error("Server refused the namespace connection: {0}")]
    ConnectRefused(String),

    // Harness Errors
    #[error("Couldn't load credentials: {0}")]
    CredentialError(String),

    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    #[error("Couldn't write report: {0}")]
    ReportError(String),
}

impl From<TimeFormatError> for Error {
    fn from(err: TimeFormatError) -> Self {
        Error::ReportError(err.to_string())
    }
}

impl Error {
    /// Classifies a library error into the per-client error taxonomy.
    pub fn kind(&self) -> ClientErrorKind {
        match self {
            Error::IOError { .. }
            | Error::NoUpgrade(_)
            | Error::InvalidAcceptKey
            | Error::IncompleteHTTPResponse
            | Error::URLParseError { .. }
            | Error::InvalidSchemeURL(_)
            | Error::URLNoHost
            | Error::HttpParseError { .. }
            | Error::DomainError { .. }
            | Error::TlsError { .. }
            | Error::ConnectRefused(_) => ClientErrorKind::Connection,
            Error::Timeout { .. } => ClientErrorKind::Timeout,
            Error::HttpError { source } if source.is_timeout() => ClientErrorKind::Timeout,
            Error::HttpError { source } if source.is_decode() => ClientErrorKind::Protocol,
            Error::HttpError { .. } => ClientErrorKind::Connection,
            Error::FromUtf8Error { .. }
            | Error::JsonError { .. }
            | Error::RSVNotZero
            | Error::ControlFramesFragmented
            | Error::ControlFramePayloadSize
            | Error::MaxFrameSize
            | Error::MaxMessageSize
            | Error::FragmentedInProgress
            | Error::InvalidContinuationFrame
            | Error::InvalidOpcode
            | Error::MalformedPacket(_)
            | Error::UnexpectedPacket(_) => ClientErrorKind::Protocol,
            _ => ClientErrorKind::Generic,
        }
    }
}

/// Error taxonomy recorded by virtual clients. The signature is the stable
/// key used in the aggregator's error histogram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ClientErrorKind {
    Connection,
    Protocol,
    Timeout,
    Generic,
}

impl ClientErrorKind {
    pub fn signature(&self) -> &'static str {
        match self {
            ClientErrorKind::Connection => "ConnectionError",
            ClientErrorKind::Protocol => "ProtocolError",
            ClientErrorKind::Timeout => "TimeoutError",
            ClientErrorKind::Generic => "GenericClientError",
        }
    }
}

impl fmt::Display for ClientErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.signature())
    }
}
