// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! QUIC server helpers for taskgate-core.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use quinn::{Endpoint, Incoming, RecvStream, SendStream, ServerConfig, TransportConfig};
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::frame::{Frame, FrameError, read_frame, write_frame};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("bind error: {0}")]
    Bind(#[from] std::io::Error),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("invalid transport setting: {0}")]
    Config(String),

    #[error("stream already finished")]
    Finished,
}

/// Settings for a taskgate QUIC listener.
#[derive(Debug, Clone)]
pub struct TaskgateServerConfig {
    pub bind_addr: SocketAddr,
    pub max_bi_streams: u32,
    pub idle_timeout_ms: u64,
    /// 0 disables server keep-alives.
    pub keep_alive_interval_ms: u64,
}

impl Default for TaskgateServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9001)),
            max_bi_streams: 1_000,
            idle_timeout_ms: 120_000,
            keep_alive_interval_ms: 15_000,
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl TaskgateServerConfig {
    /// Read transport tuning from the environment, falling back to defaults
    /// for anything missing or unparsable.
    ///
    /// - `TASKGATE_QUIC_MAX_BI_STREAMS` (default: 1000)
    /// - `TASKGATE_QUIC_IDLE_TIMEOUT_MS` (default: 120000)
    /// - `TASKGATE_QUIC_KEEP_ALIVE_MS` (default: 15000)
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            max_bi_streams: env_or("TASKGATE_QUIC_MAX_BI_STREAMS", default.max_bi_streams),
            idle_timeout_ms: env_or("TASKGATE_QUIC_IDLE_TIMEOUT_MS", default.idle_timeout_ms),
            keep_alive_interval_ms: env_or(
                "TASKGATE_QUIC_KEEP_ALIVE_MS",
                default.keep_alive_interval_ms,
            ),
            ..default
        }
    }
}

/// QUIC listener with a self-signed `localhost` certificate generated at bind time.
pub struct TaskgateServer {
    endpoint: Endpoint,
}

impl TaskgateServer {
    pub fn new(config: TaskgateServerConfig) -> Result<Self, ServerError> {
        let server_config = build_server_config(&config)?;
        let endpoint = Endpoint::server(server_config, config.bind_addr)?;

        info!(
            addr = %config.bind_addr,
            max_bi_streams = config.max_bi_streams,
            idle_timeout_ms = config.idle_timeout_ms,
            "QUIC server bound"
        );

        Ok(Self { endpoint })
    }

    /// Bind `bind_addr` with transport tuning from the environment.
    pub fn localhost(bind_addr: SocketAddr) -> Result<Self, ServerError> {
        Self::new(TaskgateServerConfig {
            bind_addr,
            ..TaskgateServerConfig::from_env()
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.endpoint.local_addr()?)
    }

    /// Next incoming connection; `None` once the endpoint is closed.
    pub async fn accept(&self) -> Option<Incoming> {
        self.endpoint.accept().await
    }

    pub fn close(&self) {
        self.endpoint.close(0u32.into(), b"server closing");
    }
}

fn build_server_config(config: &TaskgateServerConfig) -> Result<ServerConfig, ServerError> {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
        .map_err(|e| ServerError::Tls(e.to_string()))?;
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der()));

    let crypto = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert.cert.der().clone()], key)
        .map_err(|e| ServerError::Tls(e.to_string()))?;

    let idle_timeout = Duration::from_millis(config.idle_timeout_ms)
        .try_into()
        .map_err(|_| ServerError::Config("idle timeout out of range".to_string()))?;

    let mut transport = TransportConfig::default();
    transport.max_idle_timeout(Some(idle_timeout));
    transport.max_concurrent_bidi_streams(config.max_bi_streams.into());
    transport.max_concurrent_uni_streams(0u32.into());
    if config.keep_alive_interval_ms > 0 {
        transport.keep_alive_interval(Some(Duration::from_millis(config.keep_alive_interval_ms)));
    }

    let quic_crypto = quinn::crypto::rustls::QuicServerConfig::try_from(crypto)
        .map_err(|e| ServerError::Tls(e.to_string()))?;
    let mut server_config = ServerConfig::with_crypto(Arc::new(quic_crypto));
    server_config.transport_config(Arc::new(transport));
    Ok(server_config)
}

/// One accepted QUIC connection.
pub struct ConnectionHandler {
    connection: quinn::Connection,
}

impl ConnectionHandler {
    pub fn new(connection: quinn::Connection) -> Self {
        Self { connection }
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.connection.remote_address()
    }

    /// Serve bidirectional streams until the peer goes away.
    pub async fn run<H, Fut>(&self, handler: H)
    where
        H: Fn(StreamHandler) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        loop {
            match self.connection.accept_bi().await {
                Ok((send, recv)) => {
                    let handler = handler.clone();
                    tokio::spawn(async move {
                        handler(StreamHandler::new(send, recv)).await;
                    });
                }
                Err(quinn::ConnectionError::ApplicationClosed(_))
                | Err(quinn::ConnectionError::LocallyClosed)
                | Err(quinn::ConnectionError::TimedOut) => {
                    debug!("connection closed");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "error accepting stream");
                    break;
                }
            }
        }
    }
}

/// One request/response exchange on a bidirectional stream.
pub struct StreamHandler {
    send: SendStream,
    recv: RecvStream,
}

impl StreamHandler {
    pub fn new(send: SendStream, recv: RecvStream) -> Self {
        Self { send, recv }
    }

    pub async fn read_frame(&mut self) -> Result<Frame, ServerError> {
        Ok(read_frame(&mut self.recv).await?)
    }

    /// Write a response message and close the send side.
    pub async fn respond<M: prost::Message>(&mut self, message: &M) -> Result<(), ServerError> {
        self.send_last(&Frame::response(message)?).await
    }

    /// Write a transport-level error frame and close the send side.
    pub async fn reject(&mut self, code: &str, message: &str) -> Result<(), ServerError> {
        self.send_last(&Frame::error(code, message)?).await
    }

    async fn send_last(&mut self, frame: &Frame) -> Result<(), ServerError> {
        write_frame(&mut self.send, frame).await?;
        self.send.finish().map_err(|_| ServerError::Finished)
    }
}
