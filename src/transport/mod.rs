//! Transport layer for SMTP connections.
//!
//! Provides the [`SmtpTransport`] abstraction and a TCP implementation with
//! implicit TLS and STARTTLS upgrade support.

use async_trait::async_trait;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::config::{TlsMode, DEFAULT_COMMAND_TIMEOUT, DEFAULT_CONNECT_TIMEOUT};
use crate::errors::{SmtpError, SmtpErrorKind, SmtpResult};
use crate::protocol::{codes, SmtpCommand, SmtpResponse};

/// Longest reply line accepted, CRLF included (RFC 5321 allows 512).
const MAX_REPLY_LINE: u64 = 2048;

/// Most lines accepted in one multi-line reply.
const MAX_REPLY_LINES: usize = 256;

/// Trait for SMTP transport abstraction.
#[async_trait]
pub trait SmtpTransport: Send + Sync + fmt::Debug {
    /// Sends a command and receives a response.
    async fn send_command(&mut self, command: &SmtpCommand) -> SmtpResult<SmtpResponse>;

    /// Sends raw data (AUTH continuations and the DATA body).
    async fn send_data(&mut self, data: &[u8]) -> SmtpResult<()>;

    /// Reads a response from the server.
    async fn read_response(&mut self) -> SmtpResult<SmtpResponse>;

    /// Upgrades the connection to TLS.
    async fn upgrade_tls(&mut self, host: &str) -> SmtpResult<()>;

    /// Returns true if TLS is enabled.
    fn is_tls(&self) -> bool;

    /// Sends QUIT and closes the connection.
    async fn close(&mut self) -> SmtpResult<()>;
}

/// Timeouts and trust settings for a connection.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Bound on TCP connect, implicit TLS handshake and greeting together.
    pub connect_timeout: Duration,
    /// Bound on each command round trip.
    pub command_timeout: Duration,
    /// PEM file with additional trusted CA certificates.
    pub ca_cert_path: Option<PathBuf>,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            ca_cert_path: None,
        }
    }
}

/// TCP connection with optional TLS.
pub struct TcpTransport {
    /// Read/write stream; `None` once closed.
    stream: Option<TransportStream>,
    command_timeout: Duration,
    ca_cert_path: Option<PathBuf>,
    host: String,
}

/// Stream type that can be plain TCP or TLS.
enum TransportStream {
    Plain(BufReader<TcpStream>),
    #[cfg(feature = "rustls-tls")]
    Tls(Box<BufReader<tokio_rustls::client::TlsStream<TcpStream>>>),
}

impl TransportStream {
    fn is_tls(&self) -> bool {
        !matches!(self, TransportStream::Plain(_))
    }

    async fn write(&mut self, data: &[u8], timeout_duration: Duration) -> SmtpResult<()> {
        match self {
            TransportStream::Plain(stream) => write_all(stream.get_mut(), data, timeout_duration).await,
            #[cfg(feature = "rustls-tls")]
            TransportStream::Tls(stream) => write_all(stream.get_mut(), data, timeout_duration).await,
        }
    }

    async fn read(&mut self, timeout_duration: Duration) -> SmtpResult<SmtpResponse> {
        match self {
            TransportStream::Plain(stream) => read_response_lines(stream, timeout_duration).await,
            #[cfg(feature = "rustls-tls")]
            TransportStream::Tls(stream) => read_response_lines(stream.as_mut(), timeout_duration).await,
        }
    }

    async fn shutdown(&mut self) {
        let _ = match self {
            TransportStream::Plain(stream) => stream.get_mut().shutdown().await,
            #[cfg(feature = "rustls-tls")]
            TransportStream::Tls(stream) => stream.get_mut().shutdown().await,
        };
    }
}

impl fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpTransport")
            .field("host", &self.host)
            .field("tls_enabled", &self.is_tls())
            .field("open", &self.stream.is_some())
            .finish()
    }
}

impl TcpTransport {
    /// Connects to an SMTP server and reads its greeting.
    ///
    /// With [`TlsMode::Implicit`] the TLS handshake happens before the
    /// greeting. The whole sequence is bounded by `connect_timeout`.
    pub async fn connect(
        host: &str,
        port: u16,
        mode: TlsMode,
        options: &TransportOptions,
    ) -> SmtpResult<Self> {
        let address = format!("{}:{}", host, port);

        let establish = async {
            let stream = TcpStream::connect(&address)
                .await
                .map_err(|e| Self::map_io_error(e, &address))?;
            stream.set_nodelay(true).ok();

            let mut transport = Self {
                stream: Some(TransportStream::Plain(BufReader::new(stream))),
                command_timeout: options.command_timeout,
                ca_cert_path: options.ca_cert_path.clone(),
                host: host.to_string(),
            };

            if mode == TlsMode::Implicit {
                transport.upgrade_tls(host).await?;
            }

            let greeting = transport.read_response().await?;
            if greeting.code != codes::SERVICE_READY {
                return Err(greeting.to_error());
            }

            Ok::<_, SmtpError>(transport)
        };

        timeout(options.connect_timeout, establish)
            .await
            .map_err(|_| {
                SmtpError::timeout(
                    SmtpErrorKind::ConnectTimeout,
                    format!("Connect to {} timed out", address),
                )
            })?
    }

    /// Maps IO errors to SMTP errors.
    fn map_io_error(error: io::Error, address: &str) -> SmtpError {
        match error.kind() {
            io::ErrorKind::ConnectionRefused => {
                SmtpError::new(SmtpErrorKind::ConnectionRefused, format!("Connection refused to {}", address))
            }
            io::ErrorKind::TimedOut => {
                SmtpError::timeout(SmtpErrorKind::ConnectTimeout, "Connect timed out")
            }
            io::ErrorKind::ConnectionReset => {
                SmtpError::new(SmtpErrorKind::ConnectionReset, "Connection reset by server")
            }
            _ if error.to_string().contains("lookup") => SmtpError::new(
                SmtpErrorKind::DnsResolution,
                format!("Cannot resolve {}: {}", address, error),
            ),
            _ => SmtpError::connection(format!("Connection error: {}", error)).with_cause(error),
        }
    }

    fn stream_mut(&mut self) -> SmtpResult<&mut TransportStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| SmtpError::new(SmtpErrorKind::ConnectionReset, "Connection already closed"))
    }
}

/// Reads lines until we have a complete response.
async fn read_response_lines<R: AsyncBufReadExt + Unpin>(
    reader: &mut R,
    timeout_duration: Duration,
) -> SmtpResult<SmtpResponse> {
    let mut lines = Vec::new();

    loop {
        let mut line = String::new();

        let read = timeout(
            timeout_duration,
            (&mut *reader).take(MAX_REPLY_LINE).read_line(&mut line),
        )
        .await
        .map_err(|_| SmtpError::timeout(SmtpErrorKind::ReadTimeout, "Read timed out"))?
        .map_err(|e| SmtpError::protocol(format!("Read error: {}", e)))?;

        if read == 0 {
            return Err(SmtpError::new(
                SmtpErrorKind::ConnectionReset,
                "Server closed connection",
            ));
        }
        if read as u64 == MAX_REPLY_LINE && !line.ends_with('\n') {
            return Err(SmtpError::new(
                SmtpErrorKind::InvalidResponse,
                format!("Reply line exceeds {} bytes", MAX_REPLY_LINE),
            ));
        }
        if lines.len() == MAX_REPLY_LINES {
            return Err(SmtpError::new(
                SmtpErrorKind::InvalidResponse,
                format!("Reply has more than {} lines", MAX_REPLY_LINES),
            ));
        }

        let line = line.trim_end().to_string();

        // code-hyphen marks a continuation line
        let is_continuation = line.len() >= 4 && line.as_bytes()[3] == b'-';
        lines.push(line);

        if !is_continuation {
            break;
        }
    }

    SmtpResponse::parse(&lines)
}

/// Writes and flushes data.
async fn write_all<W: AsyncWrite + Unpin>(
    writer: &mut W,
    data: &[u8],
    timeout_duration: Duration,
) -> SmtpResult<()> {
    timeout(timeout_duration, writer.write_all(data))
        .await
        .map_err(|_| SmtpError::timeout(SmtpErrorKind::WriteTimeout, "Write timed out"))?
        .map_err(|e| SmtpError::protocol(format!("Write error: {}", e)))?;

    timeout(timeout_duration, writer.flush())
        .await
        .map_err(|_| SmtpError::timeout(SmtpErrorKind::WriteTimeout, "Flush timed out"))?
        .map_err(|e| SmtpError::protocol(format!("Flush error: {}", e)))?;

    Ok(())
}

#[cfg(feature = "rustls-tls")]
fn tls_connector(ca_cert_path: Option<&std::path::Path>) -> SmtpResult<tokio_rustls::TlsConnector> {
    use std::sync::Arc;

    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    if let Some(path) = ca_cert_path {
        let file = std::fs::File::open(path).map_err(|e| {
            SmtpError::configuration(format!("Cannot open CA file {}: {}", path.display(), e))
        })?;
        let mut reader = io::BufReader::new(file);
        for cert in rustls_pemfile::certs(&mut reader) {
            let cert = cert.map_err(|e| {
                SmtpError::new(
                    SmtpErrorKind::CertificateInvalid,
                    format!("Invalid PEM in {}: {}", path.display(), e),
                )
            })?;
            root_store.add(cert).map_err(|e| {
                SmtpError::new(SmtpErrorKind::CertificateInvalid, format!("Rejected CA certificate: {}", e))
            })?;
        }
    }

    let tls_config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    Ok(tokio_rustls::TlsConnector::from(Arc::new(tls_config)))
}

#[async_trait]
impl SmtpTransport for TcpTransport {
    async fn send_command(&mut self, command: &SmtpCommand) -> SmtpResult<SmtpResponse> {
        let cmd_str = format!("{}\r\n", command.to_smtp_string());

        tracing::debug!(host = %self.host, command = %command, redacted = command.is_sensitive(), "Sending SMTP command");

        let command_timeout = self.command_timeout;
        self.stream_mut()?.write(cmd_str.as_bytes(), command_timeout).await?;

        self.read_response().await
    }

    async fn send_data(&mut self, data: &[u8]) -> SmtpResult<()> {
        let command_timeout = self.command_timeout;
        self.stream_mut()?.write(data, command_timeout).await
    }

    async fn read_response(&mut self) -> SmtpResult<SmtpResponse> {
        let command_timeout = self.command_timeout;
        let response = self.stream_mut()?.read(command_timeout).await?;

        tracing::debug!(
            host = %self.host,
            code = response.code,
            message = %response.first_message(),
            "Received SMTP response"
        );

        Ok(response)
    }

    async fn upgrade_tls(&mut self, host: &str) -> SmtpResult<()> {
        if self.is_tls() {
            return Ok(());
        }

        #[cfg(feature = "rustls-tls")]
        {
            use rustls::pki_types::ServerName;

            let connector = tls_connector(self.ca_cert_path.as_deref())?;
            let server_name = ServerName::try_from(host.to_string())
                .map_err(|_| SmtpError::tls(format!("Invalid server name: {}", host)))?;

            let tcp_stream = match self.stream.take() {
                Some(TransportStream::Plain(reader)) => reader.into_inner(),
                Some(other) => {
                    self.stream = Some(other);
                    return Ok(());
                }
                None => {
                    return Err(SmtpError::new(
                        SmtpErrorKind::ConnectionReset,
                        "Connection already closed",
                    ))
                }
            };

            let tls_stream = timeout(self.command_timeout, connector.connect(server_name, tcp_stream))
                .await
                .map_err(|_| SmtpError::timeout(SmtpErrorKind::ConnectTimeout, "TLS handshake timed out"))?
                .map_err(|e| {
                    let kind = if e.to_string().to_ascii_lowercase().contains("certificate") {
                        SmtpErrorKind::CertificateInvalid
                    } else {
                        SmtpErrorKind::TlsHandshakeFailed
                    };
                    SmtpError::new(kind, format!("TLS handshake with {} failed: {}", host, e))
                })?;

            self.stream = Some(TransportStream::Tls(Box::new(BufReader::new(tls_stream))));
            tracing::debug!(host = %host, "TLS established");

            Ok(())
        }

        #[cfg(not(feature = "rustls-tls"))]
        {
            let _ = (host, &self.ca_cert_path);
            Err(SmtpError::configuration("No TLS implementation available"))
        }
    }

    fn is_tls(&self) -> bool {
        self.stream.as_ref().map(TransportStream::is_tls).unwrap_or(false)
    }

    async fn close(&mut self) -> SmtpResult<()> {
        if self.stream.is_some() {
            let _ = self.send_command(&SmtpCommand::Quit).await;
        }
        if let Some(mut stream) = self.stream.take() {
            stream.shutdown().await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn options(connect: Duration) -> TransportOptions {
        TransportOptions {
            connect_timeout: connect,
            command_timeout: Duration::from_secs(2),
            ca_cert_path: None,
        }
    }

    #[tokio::test]
    async fn test_connect_reads_greeting_and_quits() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"220 test.local ESMTP ready\r\n").await.unwrap();

            let mut buf = vec![0u8; 256];
            let n = socket.read(&mut buf).await.unwrap();
            let ehlo = String::from_utf8_lossy(&buf[..n]).to_string();
            socket
                .write_all(b"250-test.local\r\n250-SIZE 1000\r\n250 AUTH PLAIN\r\n")
                .await
                .unwrap();

            let n = socket.read(&mut buf).await.unwrap();
            let quit = String::from_utf8_lossy(&buf[..n]).to_string();
            socket.write_all(b"221 bye\r\n").await.unwrap();
            (ehlo, quit)
        });

        let mut transport = TcpTransport::connect("127.0.0.1", port, TlsMode::None, &options(Duration::from_secs(2)))
            .await
            .unwrap();
        assert!(!transport.is_tls());

        let response = transport
            .send_command(&SmtpCommand::Ehlo("client".to_string()))
            .await
            .unwrap();
        assert_eq!(response.code, 250);
        assert_eq!(response.message.len(), 3);

        transport.close().await.unwrap();
        assert!(transport.send_command(&SmtpCommand::Noop).await.is_err());

        let (ehlo, quit) = server.await.unwrap();
        assert_eq!(ehlo, "EHLO client\r\n");
        assert_eq!(quit, "QUIT\r\n");
    }

    #[tokio::test]
    async fn test_reply_line_length_is_capped() {
        let endless = vec![b'2'; 10_000];
        let err = read_response_lines(&mut endless.as_slice(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), SmtpErrorKind::InvalidResponse);

        let many = "250-x\r\n".repeat(MAX_REPLY_LINES + 1);
        let err = read_response_lines(&mut many.as_bytes(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), SmtpErrorKind::InvalidResponse);

        let long_ok = format!("250 {}\r\n", "x".repeat(1000));
        let response = read_response_lines(&mut long_ok.as_bytes(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(response.code, 250);
    }

    #[tokio::test]
    async fn test_connect_rejected_greeting() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"554 no service\r\n").await.unwrap();
        });

        let err = TcpTransport::connect("127.0.0.1", port, TlsMode::None, &options(Duration::from_secs(2)))
            .await
            .unwrap_err();
        assert_eq!(err.smtp_code(), Some(554));
    }

    #[tokio::test]
    async fn test_connect_times_out_without_greeting() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
            drop(socket);
        });

        let err = TcpTransport::connect("127.0.0.1", port, TlsMode::None, &options(Duration::from_millis(200)))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), SmtpErrorKind::ConnectTimeout);
        server.abort();
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = TcpTransport::connect("127.0.0.1", port, TlsMode::None, &options(Duration::from_secs(2)))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), SmtpErrorKind::ConnectionRefused);
    }
}
