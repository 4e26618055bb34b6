// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wire format for QUIC stream framing.
//!
//! One RPC call per bidirectional stream. Each frame is:
//! - 4 bytes: payload length (big-endian)
//! - 2 bytes: frame kind
//! - N bytes: protobuf payload

use bytes::{Buf, BufMut, Bytes, BytesMut};
use prost::Message;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::delegate_proto::RpcError;

/// Largest accepted payload. Task parameters travel inline, so this bounds them too.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Header size (4 bytes length + 2 bytes kind).
pub const HEADER_SIZE: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum FrameKind {
    Request = 1,
    Response = 2,
    /// Transport-level failure; payload is an encoded [`RpcError`].
    Error = 3,
}

impl TryFrom<u16> for FrameKind {
    type Error = FrameError;

    fn try_from(value: u16) -> Result<Self, FrameError> {
        match value {
            1 => Ok(FrameKind::Request),
            2 => Ok(FrameKind::Response),
            3 => Ok(FrameKind::Error),
            other => Err(FrameError::UnknownKind(other)),
        }
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame too large: {0} bytes (max: {MAX_FRAME_SIZE})")]
    TooLarge(usize),

    #[error("unknown frame kind: {0}")]
    UnknownKind(u16),

    #[error("truncated frame: {0}")]
    Truncated(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protobuf decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("peer returned error {code}: {message}")]
    Remote { code: String, message: String },

    #[error("unexpected frame kind: {0:?}")]
    Unexpected(FrameKind),

    #[error("stream closed before a frame arrived")]
    Closed,
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub kind: FrameKind,
    pub payload: Bytes,
}

impl Frame {
    pub fn request<M: Message>(msg: &M) -> Result<Self, FrameError> {
        Self::encode_message(FrameKind::Request, msg)
    }

    pub fn response<M: Message>(msg: &M) -> Result<Self, FrameError> {
        Self::encode_message(FrameKind::Response, msg)
    }

    /// Transport-level error frame (e.g. the request could not be decoded).
    pub fn error(code: &str, message: impl Into<String>) -> Result<Self, FrameError> {
        Self::encode_message(
            FrameKind::Error,
            &RpcError {
                code: code.to_string(),
                message: message.into(),
            },
        )
    }

    fn encode_message<M: Message>(kind: FrameKind, msg: &M) -> Result<Self, FrameError> {
        let len = msg.encoded_len();
        if len > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge(len));
        }
        Ok(Self {
            kind,
            payload: Bytes::from(msg.encode_to_vec()),
        })
    }

    pub fn decode<M: Message + Default>(&self) -> Result<M, FrameError> {
        Ok(M::decode(self.payload.clone())?)
    }

    /// Decode a response, turning an error frame into [`FrameError::Remote`].
    pub fn into_response<M: Message + Default>(self) -> Result<M, FrameError> {
        match self.kind {
            FrameKind::Response => self.decode(),
            FrameKind::Error => {
                let err: RpcError = self.decode()?;
                Err(FrameError::Remote {
                    code: err.code,
                    message: err.message,
                })
            }
            FrameKind::Request => Err(FrameError::Unexpected(FrameKind::Request)),
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        buf.put_u32(self.payload.len() as u32);
        buf.put_u16(self.kind as u16);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    pub fn from_bytes(mut bytes: Bytes) -> Result<Self, FrameError> {
        if bytes.len() < HEADER_SIZE {
            return Err(FrameError::Truncated("header"));
        }
        let length = bytes.get_u32() as usize;
        let kind = FrameKind::try_from(bytes.get_u16())?;
        if length > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge(length));
        }
        if bytes.len() < length {
            return Err(FrameError::Truncated("payload"));
        }
        Ok(Self {
            kind,
            payload: bytes.split_to(length),
        })
    }
}

pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<(), FrameError> {
    writer.write_all(&frame.to_bytes()).await?;
    Ok(())
}

pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame, FrameError> {
    let mut header = [0u8; HEADER_SIZE];
    if let Err(e) = reader.read_exact(&mut header).await {
        return Err(if e.kind() == std::io::ErrorKind::UnexpectedEof {
            FrameError::Closed
        } else {
            e.into()
        });
    }

    let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let kind = FrameKind::try_from(u16::from_be_bytes([header[4], header[5]]))?;
    if length > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge(length));
    }

    let mut payload = vec![0u8; length];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|_| FrameError::Truncated("payload"))?;

    Ok(Frame {
        kind,
        payload: Bytes::from(payload),
    })
}
