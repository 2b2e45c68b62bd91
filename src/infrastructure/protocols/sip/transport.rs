//! SIP transport layer - UDP and TCP listeners, outbound TLS
//!
//! Inbound traffic is untrusted: anything that fails to parse is logged and
//! dropped here, before it can reach the signaling engine.

use super::message::{SipError, SipMessage};
use crate::config::TlsClientCertificate;
use bytes::Bytes;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Transport protocol type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportProtocol {
    Udp,
    Tcp,
    Tls,
}

impl TransportProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportProtocol::Udp => "UDP",
            TransportProtocol::Tcp => "TCP",
            TransportProtocol::Tls => "TLS",
        }
    }

    pub fn from_account_transport(value: Option<&str>) -> Self {
        match value {
            Some(v) if v.eq_ignore_ascii_case("tcp") => TransportProtocol::Tcp,
            Some(v) if v.eq_ignore_ascii_case("tls") => TransportProtocol::Tls,
            _ => TransportProtocol::Udp,
        }
    }
}

/// Incoming SIP message with source information
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub message: SipMessage,
    pub source: SocketAddr,
    pub protocol: TransportProtocol,
}

/// Outgoing bytes with destination information
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub data: Bytes,
    pub destination: SocketAddr,
    pub protocol: TransportProtocol,
    /// Hostname for TLS server-name verification and certificate selection
    pub host: Option<String>,
}

const SEND_TIMEOUT: Duration = Duration::from_secs(5);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Combined UDP + TCP listener with an outbound TLS connector. All inbound
/// messages are funneled into one channel consumed by the signaling engine.
pub struct TransportLayer {
    udp_socket: Option<Arc<UdpSocket>>,
    tx: mpsc::Sender<IncomingMessage>,
    tls: TlsClient,
}

impl TransportLayer {
    pub fn new(tx: mpsc::Sender<IncomingMessage>, certificates: Vec<TlsClientCertificate>) -> Self {
        Self {
            udp_socket: None,
            tx,
            tls: TlsClient::new(certificates),
        }
    }

    /// Bind the UDP socket and TCP listener on the configured address.
    pub async fn bind(&mut self, bind_addr: &str) -> Result<SocketAddr, SipError> {
        let addr: SocketAddr = bind_addr
            .parse()
            .map_err(|e| SipError::TransportError(format!("bad bind address {:?}: {}", bind_addr, e)))?;

        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| SipError::TransportError(format!("failed to bind UDP socket: {}", e)))?;
        let local = socket
            .local_addr()
            .map_err(|e| SipError::TransportError(e.to_string()))?;
        info!("UDP transport listening on {}", local);

        let socket = Arc::new(socket);
        self.udp_socket = Some(socket.clone());
        let tx = self.tx.clone();
        tokio::spawn(async move {
            Self::udp_receive_loop(socket, tx).await;
        });

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| SipError::TransportError(format!("failed to bind TCP socket: {}", e)))?;
        info!("TCP transport listening on {}", local);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            Self::tcp_accept_loop(listener, tx).await;
        });

        Ok(local)
    }

    pub fn local_udp(&self) -> Option<Arc<UdpSocket>> {
        self.udp_socket.clone()
    }

    async fn udp_receive_loop(socket: Arc<UdpSocket>, tx: mpsc::Sender<IncomingMessage>) {
        let mut buf = vec![0u8; 65535];

        loop {
            match socket.recv_from(&mut buf).await {
                Ok((size, source)) => {
                    debug!("received {} bytes from {} via UDP", size, source);

                    // Bare keepalives from peers are not messages
                    if buf[..size].iter().all(|b| *b == b'\r' || *b == b'\n') {
                        continue;
                    }

                    match SipMessage::parse(&buf[..size]) {
                        Ok(message) => {
                            let incoming = IncomingMessage {
                                message,
                                source,
                                protocol: TransportProtocol::Udp,
                            };
                            if tx.send(incoming).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!("dropping unparseable SIP datagram from {}: {}", source, e);
                        }
                    }
                }
                Err(e) => {
                    error!("UDP receive failed: {}", e);
                    break;
                }
            }
        }
    }

    async fn tcp_accept_loop(listener: TcpListener, tx: mpsc::Sender<IncomingMessage>) {
        loop {
            match listener.accept().await {
                Ok((stream, source)) => {
                    debug!("accepted TCP connection from {}", source);
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        Self::stream_receive_loop(stream, source, TransportProtocol::Tcp, tx).await;
                    });
                }
                Err(e) => {
                    error!("TCP accept failed: {}", e);
                    break;
                }
            }
        }
    }

    async fn stream_receive_loop<S>(
        mut stream: S,
        source: SocketAddr,
        protocol: TransportProtocol,
        tx: mpsc::Sender<IncomingMessage>,
    ) where
        S: tokio::io::AsyncRead + Unpin,
    {
        let mut buf = vec![0u8; 65535];

        loop {
            match stream.read(&mut buf).await {
                Ok(0) => {
                    debug!("{} connection closed by {}", protocol.as_str(), source);
                    break;
                }
                Ok(size) => {
                    if buf[..size].iter().all(|b| *b == b'\r' || *b == b'\n') {
                        continue;
                    }
                    match SipMessage::parse(&buf[..size]) {
                        Ok(message) => {
                            let incoming = IncomingMessage {
                                message,
                                source,
                                protocol,
                            };
                            if tx.send(incoming).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(
                                "dropping unparseable SIP data from {} via {}: {}",
                                source,
                                protocol.as_str(),
                                e
                            );
                        }
                    }
                }
                Err(e) => {
                    debug!("read from {} failed: {}", source, e);
                    break;
                }
            }
        }
    }

    /// Send a message; every path carries a bounded timeout so the engine can
    /// never hang past the host's execution window.
    pub async fn send(&self, message: OutgoingMessage) -> Result<(), SipError> {
        match message.protocol {
            TransportProtocol::Udp => {
                let socket = self.udp_socket.as_ref().ok_or_else(|| {
                    SipError::TransportError("UDP socket not bound".to_string())
                })?;
                debug!(
                    "sending {} bytes to {} via UDP",
                    message.data.len(),
                    message.destination
                );
                tokio::time::timeout(
                    SEND_TIMEOUT,
                    socket.send_to(&message.data, message.destination),
                )
                .await
                .map_err(|_| SipError::TransportError("UDP send timed out".to_string()))?
                .map_err(|e| SipError::TransportError(format!("UDP send failed: {}", e)))?;
                Ok(())
            }
            TransportProtocol::Tcp => {
                let stream = tokio::time::timeout(
                    CONNECT_TIMEOUT,
                    TcpStream::connect(message.destination),
                )
                .await
                .map_err(|_| SipError::TransportError("TCP connect timed out".to_string()))?
                .map_err(|e| {
                    SipError::TransportError(format!(
                        "failed to connect to {}: {}",
                        message.destination, e
                    ))
                })?;
                self.send_on_stream(stream, message).await
            }
            TransportProtocol::Tls => {
                let host = message
                    .host
                    .clone()
                    .ok_or_else(|| SipError::TransportError("TLS send needs a hostname".to_string()))?;
                let stream = self.tls.connect(&host, message.destination).await?;
                self.send_on_stream(stream, message).await
            }
        }
    }

    /// Write the payload, then keep reading responses on the same connection
    /// into the inbound channel.
    async fn send_on_stream<S>(&self, mut stream: S, message: OutgoingMessage) -> Result<(), SipError>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        debug!(
            "sending {} bytes to {} via {}",
            message.data.len(),
            message.destination,
            message.protocol.as_str()
        );

        tokio::time::timeout(SEND_TIMEOUT, stream.write_all(&message.data))
            .await
            .map_err(|_| SipError::TransportError("stream send timed out".to_string()))?
            .map_err(|e| SipError::TransportError(format!("stream send failed: {}", e)))?;
        stream
            .flush()
            .await
            .map_err(|e| SipError::TransportError(format!("stream flush failed: {}", e)))?;

        let tx = self.tx.clone();
        let source = message.destination;
        let protocol = message.protocol;
        tokio::spawn(async move {
            Self::stream_receive_loop(stream, source, protocol, tx).await;
        });
        Ok(())
    }
}

/// Outbound TLS connections with optional per-host client certificates.
struct TlsClient {
    certificates: Vec<TlsClientCertificate>,
}

impl TlsClient {
    fn new(certificates: Vec<TlsClientCertificate>) -> Self {
        Self { certificates }
    }

    async fn connect(
        &self,
        host: &str,
        destination: SocketAddr,
    ) -> Result<tokio_rustls::client::TlsStream<TcpStream>, SipError> {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let builder = ClientConfig::builder().with_root_certificates(roots);

        let config = match self
            .certificates
            .iter()
            .find(|c| c.host.eq_ignore_ascii_case(host))
        {
            Some(cert) => {
                let (certs, key) = load_client_identity(&cert.cert_file, &cert.key_file)?;
                builder.with_client_auth_cert(certs, key).map_err(|e| {
                    SipError::TransportError(format!("bad client certificate for {}: {}", host, e))
                })?
            }
            None => builder.with_no_client_auth(),
        };

        let connector = tokio_rustls::TlsConnector::from(Arc::new(config));
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(destination))
            .await
            .map_err(|_| SipError::TransportError("TLS connect timed out".to_string()))?
            .map_err(|e| {
                SipError::TransportError(format!("failed to connect to {}: {}", destination, e))
            })?;

        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| SipError::TransportError(format!("bad TLS server name {:?}: {}", host, e)))?;

        tokio::time::timeout(CONNECT_TIMEOUT, connector.connect(server_name, stream))
            .await
            .map_err(|_| SipError::TransportError("TLS handshake timed out".to_string()))?
            .map_err(|e| SipError::TransportError(format!("TLS handshake with {} failed: {}", host, e)))
    }
}

fn load_client_identity(
    cert_file: &str,
    key_file: &str,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), SipError> {
    let mut cert_reader = BufReader::new(File::open(cert_file).map_err(|e| {
        SipError::TransportError(format!("cannot open certificate {}: {}", cert_file, e))
    })?);
    let certs = rustls_pemfile::certs(&mut cert_reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| SipError::TransportError(format!("bad certificate {}: {}", cert_file, e)))?;

    let mut key_reader = BufReader::new(File::open(key_file).map_err(|e| {
        SipError::TransportError(format!("cannot open private key {}: {}", key_file, e))
    })?);
    let key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(|e| SipError::TransportError(format!("bad private key {}: {}", key_file, e)))?
        .ok_or_else(|| {
            SipError::TransportError(format!("no private key found in {}", key_file))
        })?;

    Ok((certs, key))
}
