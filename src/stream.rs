use crate::error::Error;
use crate::request::Target;
use pki_types::ServerName;
use rustls::{ClientConfig as RustlsConfig, RootCertStore};
use std::fs::File;
use std::io::{self, BufReader};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

// A single type for plain and TLS sockets, so the rest of the transport doesn't need
// to be generic over the stream type
pub enum SwarmStream {
    Plain(TcpStream),
    Secure(Box<TlsStream<TcpStream>>),
}

impl SwarmStream {
    pub async fn connect(target: &Target, ca_file: Option<&str>) -> Result<Self, Error> {
        let socket = TcpStream::connect(&target.host_with_port).await?;
        // Small payloads dominate a chat load test, waiting for Nagle only inflates latency
        socket.set_nodelay(true)?;

        if !target.use_tls {
            return Ok(SwarmStream::Plain(socket));
        }

        let connector = TlsConnector::from(Arc::new(tls_config(ca_file)?));
        let domain = ServerName::try_from(target.host.clone())?;
        let tls_stream = connector.connect(domain, socket).await?;

        Ok(SwarmStream::Secure(Box::new(tls_stream)))
    }
}

fn tls_config(ca_file: Option<&str>) -> Result<RustlsConfig, Error> {
    let mut root_store = RootCertStore::empty();

    match ca_file {
        Some(path) => {
            let mut reader = BufReader::new(File::open(path)?);
            for cert in rustls_pemfile::certs(&mut reader) {
                root_store.add(cert?)?;
            }
        }
        None => root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }

    // Both rustls backends end up enabled, so the provider is named explicitly
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    Ok(RustlsConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_root_certificates(root_store)
        .with_no_client_auth())
}

impl AsyncRead for SwarmStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            SwarmStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            SwarmStream::Secure(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for SwarmStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            SwarmStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            SwarmStream::Secure(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            SwarmStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            SwarmStream::Secure(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            SwarmStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            SwarmStream::Secure(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}
