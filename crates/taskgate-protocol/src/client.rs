// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! QUIC client for the delegate service and agent protocols.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use quinn::{ClientConfig, Connection, Endpoint, TransportConfig};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use crate::frame::{Frame, FrameError, read_frame, write_frame};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connection error: {0}")]
    Connection(#[from] quinn::ConnectionError),

    #[error("connect error: {0}")]
    Connect(#[from] quinn::ConnectError),

    #[error("stream closed: {0}")]
    ClosedStream(#[from] quinn::ClosedStream),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("connection timed out after {0}ms")]
    Timeout(u64),
}

/// Name the server certificate is issued for.
const SERVER_NAME: &str = "localhost";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct TaskgateClientConfig {
    pub server_addr: SocketAddr,
    pub idle_timeout_ms: u64,
    /// 0 disables client keep-alives.
    pub keep_alive_interval_ms: u64,
}

impl Default for TaskgateClientConfig {
    fn default() -> Self {
        Self {
            server_addr: SocketAddr::from(([127, 0, 0, 1], 9001)),
            idle_timeout_ms: 120_000,
            keep_alive_interval_ms: 10_000,
        }
    }
}

/// Lazily connecting client; one bidirectional stream per call.
///
/// Taskgate servers present a certificate generated at bind time, so the
/// client does not verify it.
pub struct TaskgateClient {
    endpoint: Endpoint,
    connection: Mutex<Option<Connection>>,
    server_addr: SocketAddr,
}

impl TaskgateClient {
    pub fn new(config: TaskgateClientConfig) -> Result<Self, ClientError> {
        let mut endpoint = Endpoint::client(SocketAddr::from(([0, 0, 0, 0], 0)))?;
        endpoint.set_default_client_config(build_client_config(&config)?);

        Ok(Self {
            endpoint,
            connection: Mutex::new(None),
            server_addr: config.server_addr,
        })
    }

    pub fn localhost(server_addr: SocketAddr) -> Result<Self, ClientError> {
        Self::new(TaskgateClientConfig {
            server_addr,
            ..Default::default()
        })
    }

    async fn connection(&self) -> Result<Connection, ClientError> {
        let mut guard = self.connection.lock().await;
        if let Some(conn) = guard.as_ref() {
            if conn.close_reason().is_none() {
                return Ok(conn.clone());
            }
            debug!("previous connection closed, reconnecting");
        }

        info!(addr = %self.server_addr, "connecting to taskgate");
        let connecting = self.endpoint.connect(self.server_addr, SERVER_NAME)?;
        let connection = tokio::time::timeout(CONNECT_TIMEOUT, connecting)
            .await
            .map_err(|_| ClientError::Timeout(CONNECT_TIMEOUT.as_millis() as u64))??;

        *guard = Some(connection.clone());
        Ok(connection)
    }

    /// Send one request and wait for its response.
    ///
    /// Error frames from the server surface as [`FrameError::Remote`].
    #[instrument(skip(self, request))]
    pub async fn request<Req, Resp>(&self, request: &Req) -> Result<Resp, ClientError>
    where
        Req: prost::Message,
        Resp: prost::Message + Default,
    {
        let conn = self.connection().await?;
        let (mut send, mut recv) = conn.open_bi().await?;

        write_frame(&mut send, &Frame::request(request)?).await?;
        send.finish()?;

        let frame = read_frame(&mut recv).await?;
        Ok(frame.into_response()?)
    }

    pub async fn is_connected(&self) -> bool {
        self.connection
            .lock()
            .await
            .as_ref()
            .is_some_and(|c| c.close_reason().is_none())
    }

    pub async fn close(&self) {
        if let Some(conn) = self.connection.lock().await.take() {
            conn.close(0u32.into(), b"client closing");
        }
    }
}

fn build_client_config(config: &TaskgateClientConfig) -> Result<ClientConfig, ClientError> {
    let crypto = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
        .with_no_client_auth();

    let idle_timeout = Duration::from_millis(config.idle_timeout_ms)
        .try_into()
        .map_err(|_| ClientError::Tls("idle timeout out of range".to_string()))?;

    let mut transport = TransportConfig::default();
    transport.max_idle_timeout(Some(idle_timeout));
    if config.keep_alive_interval_ms > 0 {
        transport.keep_alive_interval(Some(Duration::from_millis(config.keep_alive_interval_ms)));
    }

    let quic_crypto = quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
        .map_err(|e| ClientError::Tls(e.to_string()))?;
    let mut client_config = ClientConfig::new(Arc::new(quic_crypto));
    client_config.transport_config(Arc::new(transport));
    Ok(client_config)
}

/// Accepts the self-signed certificate of a taskgate server.
#[derive(Debug)]
struct AcceptAnyServerCert;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
