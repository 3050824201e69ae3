//! Byte transports a connection runs over
//!
//! The engine never touches sockets directly. It drives a [`Transport`],
//! which yields:
//! - [`TcpTransport`] for `ws://`
//! - [`TlsTransport`] for `wss://` (requires the `tls` feature)
//! - [`DefaultTransport`], picking one of the above from the scheme
//!
//! Any type implementing the trait can be handed to
//! [`Connection::connect_with`](crate::Connection::connect_with), which is
//! how the tests drive the state machine over in-memory or scripted peers.
//!
//! # Contract
//!
//! - `recv` waits at most the configured read timeout; a timeout surfaces as
//!   [`Error::WouldBlock`] and an orderly EOF as [`Error::ConnectionClosed`]
//! - `send` writes the whole buffer or fails
//! - `close` is idempotent

use std::future::Future;
use std::io;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::handshake::Scheme;

/// Async byte stream used by a connection
pub trait Transport: Send + 'static {
    /// Open the stream to `host:port`
    fn connect(&mut self, host: &str, port: u16) -> impl Future<Output = Result<()>> + Send;

    /// Write all of `data`, returning the number of bytes written
    fn send(&mut self, data: &[u8]) -> impl Future<Output = Result<usize>> + Send;

    /// Append whatever arrives within the read timeout to `buf`
    fn recv(&mut self, buf: &mut BytesMut) -> impl Future<Output = Result<usize>> + Send;

    /// Shut the stream down
    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

/// Connect with a bounded number of attempts
///
/// Waits `delay` between failed attempts. Returns the error of the last
/// attempt once `attempts` are used up.
pub async fn connect_with_retry<T: Transport>(
    transport: &mut T,
    host: &str,
    port: u16,
    attempts: u32,
    delay: Duration,
) -> Result<()> {
    let attempts = attempts.max(1);
    let mut attempt = 1;

    loop {
        match transport.connect(host, port).await {
            Ok(()) => {
                debug!(host, port, attempt, "transport connected");
                return Ok(());
            }
            Err(e) if attempt < attempts => {
                warn!(host, port, attempt, error = %e, "connect attempt failed, retrying");
                attempt += 1;
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                warn!(host, port, attempt, error = %e, "connect attempts exhausted");
                return Err(e);
            }
        }
    }
}

/// Send `data`, failing with a timed-out I/O error once `timeout` elapses
///
/// A write cut off by the timeout leaves the stream mid-frame, so callers
/// treat the error as fatal.
pub async fn send_with_timeout<T: Transport>(
    transport: &mut T,
    data: &[u8],
    timeout: Duration,
) -> Result<usize> {
    match tokio::time::timeout(timeout, transport.send(data)).await {
        Ok(result) => result,
        Err(_) => Err(Error::Io(io::Error::new(
            io::ErrorKind::TimedOut,
            "write timed out",
        ))),
    }
}

async fn write_all<S>(stream: Option<&mut S>, data: &[u8]) -> Result<usize>
where
    S: AsyncWrite + Unpin,
{
    let stream = stream.ok_or(Error::InvalidState("transport not connected"))?;
    stream.write_all(data).await?;
    stream.flush().await?;
    Ok(data.len())
}

async fn read_some<S>(stream: Option<&mut S>, buf: &mut BytesMut, timeout: Duration) -> Result<usize>
where
    S: AsyncRead + Unpin,
{
    let stream = stream.ok_or(Error::InvalidState("transport not connected"))?;
    match tokio::time::timeout(timeout, stream.read_buf(buf)).await {
        Ok(Ok(0)) => Err(Error::ConnectionClosed),
        Ok(Ok(n)) => Ok(n),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(Error::WouldBlock),
    }
}

/// Plain TCP transport
#[derive(Debug)]
pub struct TcpTransport {
    stream: Option<TcpStream>,
    read_timeout: Duration,
}

impl TcpTransport {
    pub fn new(read_timeout: Duration) -> Self {
        Self {
            stream: None,
            read_timeout,
        }
    }
}

impl Transport for TcpTransport {
    async fn connect(&mut self, host: &str, port: u16) -> Result<()> {
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        self.stream = Some(stream);
        Ok(())
    }

    async fn send(&mut self, data: &[u8]) -> Result<usize> {
        write_all(self.stream.as_mut(), data).await
    }

    async fn recv(&mut self, buf: &mut BytesMut) -> Result<usize> {
        read_some(self.stream.as_mut(), buf, self.read_timeout).await
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
    }
}

#[cfg(feature = "tls")]
pub use tls::TlsTransport;

#[cfg(feature = "tls")]
mod tls {
    use std::sync::Arc;
    use std::time::Duration;

    use bytes::BytesMut;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;
    use tokio_rustls::client::TlsStream;
    use tokio_rustls::rustls::{self, RootCertStore, pki_types::ServerName};
    use tokio_rustls::TlsConnector;

    use super::{Transport, read_some, write_all};
    use crate::error::{Error, Result};

    /// TLS transport over TCP (rustls)
    ///
    /// Trusts only `server_cert` when one is given, otherwise the
    /// webpki root set.
    pub struct TlsTransport {
        connector: TlsConnector,
        stream: Option<TlsStream<TcpStream>>,
        read_timeout: Duration,
    }

    impl TlsTransport {
        /// Create a transport; `server_cert` is a PEM bundle to pin
        pub fn new(read_timeout: Duration, server_cert: Option<&str>) -> Result<Self> {
            Ok(Self {
                connector: tls_connector(server_cert)?,
                stream: None,
                read_timeout,
            })
        }
    }

    impl std::fmt::Debug for TlsTransport {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("TlsTransport")
                .field("connected", &self.stream.is_some())
                .field("read_timeout", &self.read_timeout)
                .finish()
        }
    }

    fn tls_connector(server_cert: Option<&str>) -> Result<TlsConnector> {
        let mut roots = RootCertStore::empty();

        match server_cert {
            Some(pem) => {
                for cert in rustls_pemfile::certs(&mut pem.as_bytes()) {
                    let cert = cert.map_err(|e| Error::Tls(format!("bad certificate PEM: {e}")))?;
                    roots
                        .add(cert)
                        .map_err(|e| Error::Tls(format!("unusable certificate: {e}")))?;
                }
                if roots.is_empty() {
                    return Err(Error::Tls("no certificate found in PEM".into()));
                }
            }
            None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
        }

        // Prefer an installed process-wide provider, fall back to ring
        let provider = rustls::crypto::CryptoProvider::get_default()
            .cloned()
            .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()));

        let mut config = rustls::ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::Tls(e.to_string()))?
            .with_root_certificates(roots)
            .with_no_client_auth();
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(TlsConnector::from(Arc::new(config)))
    }

    impl Transport for TlsTransport {
        async fn connect(&mut self, host: &str, port: u16) -> Result<()> {
            let domain = ServerName::try_from(host.to_owned())
                .map_err(|_| Error::Tls(format!("invalid server name: {host}")))?;

            let tcp = TcpStream::connect((host, port)).await?;
            tcp.set_nodelay(true)?;

            let stream = self.connector.connect(domain, tcp).await?;
            self.stream = Some(stream);
            Ok(())
        }

        async fn send(&mut self, data: &[u8]) -> Result<usize> {
            write_all(self.stream.as_mut(), data).await
        }

        async fn recv(&mut self, buf: &mut BytesMut) -> Result<usize> {
            read_some(self.stream.as_mut(), buf, self.read_timeout).await
        }

        async fn close(&mut self) {
            if let Some(mut stream) = self.stream.take() {
                let _ = stream.shutdown().await;
            }
        }
    }
}

/// Transport chosen from the URL scheme
#[derive(Debug)]
pub enum DefaultTransport {
    Tcp(TcpTransport),
    #[cfg(feature = "tls")]
    Tls(TlsTransport),
}

impl DefaultTransport {
    /// `ws` gets TCP, `wss` gets TLS (pinned to `server_cert` if given)
    pub fn for_scheme(
        scheme: Scheme,
        read_timeout: Duration,
        server_cert: Option<&str>,
    ) -> Result<Self> {
        match scheme {
            s if !s.is_secure() => Ok(DefaultTransport::Tcp(TcpTransport::new(read_timeout))),
            #[cfg(feature = "tls")]
            _ => Ok(DefaultTransport::Tls(TlsTransport::new(
                read_timeout,
                server_cert,
            )?)),
            #[cfg(not(feature = "tls"))]
            _ => {
                let _ = server_cert;
                Err(Error::Tls("wss requires the `tls` feature".into()))
            }
        }
    }
}

impl Transport for DefaultTransport {
    async fn connect(&mut self, host: &str, port: u16) -> Result<()> {
        match self {
            DefaultTransport::Tcp(t) => t.connect(host, port).await,
            #[cfg(feature = "tls")]
            DefaultTransport::Tls(t) => t.connect(host, port).await,
        }
    }

    async fn send(&mut self, data: &[u8]) -> Result<usize> {
        match self {
            DefaultTransport::Tcp(t) => t.send(data).await,
            #[cfg(feature = "tls")]
            DefaultTransport::Tls(t) => t.send(data).await,
        }
    }

    async fn recv(&mut self, buf: &mut BytesMut) -> Result<usize> {
        match self {
            DefaultTransport::Tcp(t) => t.recv(buf).await,
            #[cfg(feature = "tls")]
            DefaultTransport::Tls(t) => t.recv(buf).await,
        }
    }

    async fn close(&mut self) {
        match self {
            DefaultTransport::Tcp(t) => t.close().await,
            #[cfg(feature = "tls")]
            DefaultTransport::Tls(t) => t.close().await,
        }
    }
}
