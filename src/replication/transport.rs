//! QUIC Transport
//!
//! Peer links over QUIC (via Quinn). Each link is a single bidirectional
//! stream carrying length-prefixed frames, which gives the reliable, ordered,
//! message-oriented duplex channel the sync protocol expects.
//!
//! Every link gets a reader task and a writer task. Outbound frames go
//! through a bounded queue; a full queue rejects the new frame instead of
//! blocking the caller.
//!
//! Framing is Sans-IO: encoding and length decoding are plain functions.

use crate::infrastructure::shutdown::ShutdownController;
use crate::replication::types::ConnectionId;
use bytes::{BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use quinn::{ClientConfig, Connection, Endpoint, RecvStream, SendStream, ServerConfig};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Largest accepted frame payload.
pub const MAX_FRAME_LEN: usize = 10 * 1024 * 1024;

/// TLS server name presented by every node's self-signed certificate.
pub const SERVER_NAME: &str = "kgsync";

// ==================== Sans-IO Functions ====================

/// Length-prefix a payload (4-byte big-endian length).
pub fn encode_frame(payload: &[u8]) -> Result<Bytes, TransportError> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(TransportError::FrameTooLarge(payload.len()));
    }
    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Decode a length from the first 4 bytes.
pub fn decode_length(buf: &[u8; 4]) -> usize {
    u32::from_be_bytes(*buf) as usize
}

/// Hand a frame to a link's writer queue, rejecting it when the queue is full.
fn enqueue_frame(
    queue: &mpsc::Sender<Bytes>,
    connection: ConnectionId,
    frame: Bytes,
) -> Result<(), TransportError> {
    queue.try_send(frame).map_err(|e| match e {
        mpsc::error::TrySendError::Full(_) => TransportError::QueueFull(connection),
        mpsc::error::TrySendError::Closed(_) => TransportError::Closed(connection),
    })
}

/// Transport failures.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport not started")]
    NotStarted,
    #[error("frame of {0} bytes exceeds the maximum")]
    FrameTooLarge(usize),
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),
    #[error("send queue full for connection {0}")]
    QueueFull(ConnectionId),
    #[error("connection {0} is closed")]
    Closed(ConnectionId),
    #[error("tls setup failed: {0}")]
    Tls(String),
    #[error("certificate generation failed: {0}")]
    Certificate(#[from] rcgen::Error),
    #[error(transparent)]
    Rustls(#[from] quinn::rustls::Error),
    #[error(transparent)]
    CipherSuite(#[from] quinn::crypto::rustls::NoInitialCipherSuite),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Connect(#[from] quinn::ConnectError),
    #[error(transparent)]
    Connection(#[from] quinn::ConnectionError),
}

/// Events from the transport layer.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A link is ready; `outbound` is true when we dialed it
    Connected {
        connection: ConnectionId,
        addr: SocketAddr,
        outbound: bool,
    },
    /// One complete frame payload arrived
    Frame {
        connection: ConnectionId,
        payload: Bytes,
    },
    Disconnected(ConnectionId),
}

struct Link {
    queue: mpsc::Sender<Bytes>,
    connection: Connection,
}

/// Transport service for peer links.
pub struct TransportService {
    listen_addr: SocketAddr,
    queue_capacity: usize,
    endpoint: Option<Endpoint>,
    links: Arc<DashMap<ConnectionId, Link>>,
    next_id: Arc<AtomicU64>,
    event_tx: mpsc::Sender<TransportEvent>,
    event_rx: Option<mpsc::Receiver<TransportEvent>>,
    shutdown: ShutdownController,
}

impl TransportService {
    /// Create a new transport service.
    pub fn new(listen_addr: SocketAddr, queue_capacity: usize, shutdown: ShutdownController) -> Self {
        let (event_tx, event_rx) = mpsc::channel(1024);

        Self {
            listen_addr,
            queue_capacity: queue_capacity.max(1),
            endpoint: None,
            links: Arc::new(DashMap::new()),
            next_id: Arc::new(AtomicU64::new(1)),
            event_tx,
            event_rx: Some(event_rx),
            shutdown,
        }
    }

    /// Get the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.event_rx.take()
    }

    /// Bound address once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.endpoint.as_ref().and_then(|e| e.local_addr().ok())
    }

    pub fn connection_count(&self) -> usize {
        self.links.len()
    }

    /// Bind the endpoint and start accepting links.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub async fn start(&mut self) -> Result<SocketAddr, TransportError> {
        // Fails harmlessly if a provider is already installed.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let (server_config, client_config) = build_tls_configs()?;
        let mut endpoint = Endpoint::server(server_config, self.listen_addr)?;
        endpoint.set_default_client_config(client_config);
        let local_addr = endpoint.local_addr()?;
        tracing::info!("transport listening on {}", local_addr);

        self.endpoint = Some(endpoint.clone());

        let links = self.links.clone();
        let next_id = self.next_id.clone();
        let event_tx = self.event_tx.clone();
        let shutdown = self.shutdown.clone();
        let capacity = self.queue_capacity;
        let mut stop_rx = self.shutdown.subscribe();

        tokio::spawn(async move {
            loop {
                let incoming = tokio::select! {
                    _ = stop_rx.recv() => break,
                    incoming = endpoint.accept() => match incoming {
                        Some(incoming) => incoming,
                        None => break,
                    },
                };

                let registry = LinkRegistry {
                    links: links.clone(),
                    next_id: next_id.clone(),
                    event_tx: event_tx.clone(),
                    shutdown: shutdown.clone(),
                    capacity,
                };
                tokio::spawn(async move {
                    let conn = match incoming.await {
                        Ok(conn) => conn,
                        Err(e) => {
                            tracing::warn!("failed to accept connection: {}", e);
                            return;
                        }
                    };
                    // The dialer opens the stream and speaks first.
                    match conn.accept_bi().await {
                        Ok((send, recv)) => {
                            registry.register(conn, send, recv, false).await;
                        }
                        Err(e) => tracing::debug!("inbound link never opened a stream: {}", e),
                    }
                });
            }
            tracing::debug!("accept loop stopped");
        });

        Ok(local_addr)
    }

    /// Dial a peer and open the link stream.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub async fn connect(&self, addr: SocketAddr) -> Result<ConnectionId, TransportError> {
        let endpoint = self.endpoint.as_ref().ok_or(TransportError::NotStarted)?;
        let conn = endpoint.connect(addr, SERVER_NAME)?.await?;
        let (send, recv) = conn.open_bi().await?;
        Ok(self.registry().register(conn, send, recv, true).await)
    }

    /// Queue a payload for a link without waiting.
    pub fn send(&self, connection: ConnectionId, payload: &[u8]) -> Result<(), TransportError> {
        let frame = encode_frame(payload)?;
        let link = self
            .links
            .get(&connection)
            .ok_or(TransportError::UnknownConnection(connection))?;
        enqueue_frame(&link.queue, connection, frame)
    }

    /// Close one link.
    pub fn disconnect(&self, connection: ConnectionId) {
        if let Some((_, link)) = self.links.remove(&connection) {
            link.connection.close(0u32.into(), b"disconnect");
        }
    }

    /// Close every link and the endpoint.
    pub fn close(&self) {
        self.links.clear();
        if let Some(endpoint) = &self.endpoint {
            endpoint.close(0u32.into(), b"shutdown");
        }
    }

    fn registry(&self) -> LinkRegistry {
        LinkRegistry {
            links: self.links.clone(),
            next_id: self.next_id.clone(),
            event_tx: self.event_tx.clone(),
            shutdown: self.shutdown.clone(),
            capacity: self.queue_capacity,
        }
    }
}

/// Shared handles needed to bring a link up from any task.
struct LinkRegistry {
    links: Arc<DashMap<ConnectionId, Link>>,
    next_id: Arc<AtomicU64>,
    event_tx: mpsc::Sender<TransportEvent>,
    shutdown: ShutdownController,
    capacity: usize,
}

impl LinkRegistry {
    #[cfg_attr(coverage_nightly, coverage(off))]
    async fn register(self, conn: Connection, send: SendStream, recv: RecvStream, outbound: bool) -> ConnectionId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let addr = conn.remote_address();
        let (queue, queue_rx) = mpsc::channel(self.capacity);
        self.links.insert(
            id,
            Link {
                queue,
                connection: conn.clone(),
            },
        );

        // Announce before the reader can emit frames for this link.
        let _ = self
            .event_tx
            .send(TransportEvent::Connected {
                connection: id,
                addr,
                outbound,
            })
            .await;

        tokio::spawn(write_loop(id, send, queue_rx));
        tokio::spawn(read_loop(id, conn, recv, self.links, self.event_tx, self.shutdown));
        id
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
async fn write_loop(id: ConnectionId, mut send: SendStream, mut queue: mpsc::Receiver<Bytes>) {
    while let Some(frame) = queue.recv().await {
        if let Err(e) = send.write_all(&frame).await {
            tracing::debug!("write failed on connection {}: {}", id, e);
            return;
        }
    }
    let _ = send.finish();
}

#[cfg_attr(coverage_nightly, coverage(off))]
async fn read_loop(
    id: ConnectionId,
    conn: Connection,
    mut recv: RecvStream,
    links: Arc<DashMap<ConnectionId, Link>>,
    event_tx: mpsc::Sender<TransportEvent>,
    shutdown: ShutdownController,
) {
    let _guard = shutdown.task_guard();
    let mut stop_rx = shutdown.subscribe();

    loop {
        let frame = tokio::select! {
            _ = stop_rx.recv() => break,
            frame = read_frame(&mut recv) => frame,
        };
        match frame {
            Ok(Some(payload)) => {
                let event = TransportEvent::Frame {
                    connection: id,
                    payload,
                };
                if event_tx.send(event).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(reason) => {
                tracing::debug!("connection {} closed: {}", id, reason);
                break;
            }
        }
    }

    links.remove(&id);
    conn.close(0u32.into(), b"closed");
    let _ = event_tx.send(TransportEvent::Disconnected(id)).await;
}

/// Read one frame. `Ok(None)` means the peer finished the stream cleanly.
#[cfg_attr(coverage_nightly, coverage(off))]
async fn read_frame(recv: &mut RecvStream) -> Result<Option<Bytes>, String> {
    let mut len_buf = [0u8; 4];
    match recv.read_exact(&mut len_buf).await {
        Ok(()) => {}
        Err(quinn::ReadExactError::FinishedEarly(0)) => return Ok(None),
        Err(e) => return Err(e.to_string()),
    }

    let len = decode_length(&len_buf);
    if len > MAX_FRAME_LEN {
        tracing::warn!("message too large: {} bytes", len);
        return Err(format!("frame of {} bytes exceeds the maximum", len));
    }

    let mut data = vec![0u8; len];
    recv.read_exact(&mut data).await.map_err(|e| e.to_string())?;
    Ok(Some(Bytes::from(data)))
}

/// Server and client configs for a self-signed cluster certificate.
fn build_tls_configs() -> Result<(ServerConfig, ClientConfig), TransportError> {
    let cert = rcgen::generate_simple_self_signed(vec![
        SERVER_NAME.to_string(),
        "localhost".to_string(),
    ])?;

    let cert_chain = vec![rustls::pki_types::CertificateDer::from(cert.cert.der().to_vec())];
    let private_key = rustls::pki_types::PrivateKeyDer::try_from(cert.key_pair.serialize_der())
        .map_err(|e| TransportError::Tls(e.to_string()))?;

    let server_crypto = quinn::rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, private_key)?;
    let server_config = ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)?,
    ));

    // Peers present throwaway certificates; identity comes from the handshake message.
    let client_crypto = quinn::rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
        .with_no_client_auth();
    let client_config = ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto)?,
    ));

    Ok((server_config, client_config))
}

/// Accepts any server certificate from a cluster peer.
#[derive(Debug)]
struct SkipServerVerification;

#[cfg_attr(coverage_nightly, coverage(off))]
impl quinn::rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<quinn::rustls::client::danger::ServerCertVerified, quinn::rustls::Error> {
        Ok(quinn::rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &quinn::rustls::DigitallySignedStruct,
    ) -> Result<quinn::rustls::client::danger::HandshakeSignatureValid, quinn::rustls::Error> {
        Ok(quinn::rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &quinn::rustls::DigitallySignedStruct,
    ) -> Result<quinn::rustls::client::danger::HandshakeSignatureValid, quinn::rustls::Error> {
        Ok(quinn::rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<quinn::rustls::SignatureScheme> {
        use quinn::rustls::SignatureScheme::*;
        vec![
            ECDSA_NISTP256_SHA256,
            ECDSA_NISTP384_SHA384,
            ED25519,
            RSA_PSS_SHA256,
            RSA_PSS_SHA384,
            RSA_PSS_SHA512,
            RSA_PKCS1_SHA256,
            RSA_PKCS1_SHA384,
            RSA_PKCS1_SHA512,
        ]
    }
}
