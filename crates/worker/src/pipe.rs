// Copyright (c) 2024 Spider Project Authors
// SPDX-License-Identifier: MIT

//! Framed binary protocol between the worker and its executor child:
//! a little-endian u32 length prefix followed by a self-describing JSON
//! payload of a tagged `{type, body}` record. Buffers travel base64-encoded
//! inside the payload.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProtocolError;

/// Upper bound on a single frame. Anything larger is a protocol violation,
/// not a legitimate argument tuple.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", content = "body")]
pub enum ExecutorMessage {
    /// Serialized argument tuple, one buffer per input slot.
    Args(#[serde(with = "buffers_b64")] Vec<Vec<u8>>),

    /// Serialized results, one buffer per output slot.
    Result(#[serde(with = "buffers_b64")] Vec<Vec<u8>>),

    Error { function: String, message: String },

    Cancel,

    Ack,
}

/// Builds the result frame for a finished execution.
pub fn create_result_response(buffers: Vec<Vec<u8>>) -> ExecutorMessage {
    ExecutorMessage::Result(buffers)
}

pub fn create_error_response(function: &str, message: impl Into<String>) -> ExecutorMessage {
    ExecutorMessage::Error {
        function: function.to_owned(),
        message: message.into(),
    }
}

pub async fn send_message<W>(pipe: &mut W, message: &ExecutorMessage) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let payload =
        serde_json::to_vec(message).map_err(|e| ProtocolError::BadFrame(e.to_string()))?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }

    pipe.write_all(&(payload.len() as u32).to_le_bytes()).await?;
    pipe.write_all(&payload).await?;
    pipe.flush().await?;
    Ok(())
}

pub async fn receive_message<R>(pipe: &mut R) -> Result<ExecutorMessage, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    pipe.read_exact(&mut header).await.map_err(eof_to_protocol)?;

    let len = u32::from_le_bytes(header) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(len));
    }

    let mut payload = vec![0u8; len];
    pipe.read_exact(&mut payload).await.map_err(eof_to_protocol)?;

    serde_json::from_slice(&payload).map_err(|e| ProtocolError::BadFrame(e.to_string()))
}

fn eof_to_protocol(e: std::io::Error) -> ProtocolError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        ProtocolError::PipeEof
    } else {
        ProtocolError::Io(e)
    }
}

mod buffers_b64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        buffers: &Vec<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let encoded: Vec<String> = buffers.iter().map(|b| STANDARD.encode(b)).collect();
        serde::Serialize::serialize(&encoded, serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<Vec<u8>>, D::Error> {
        let encoded: Vec<String> = Deserialize::deserialize(deserializer)?;
        encoded
            .iter()
            .map(|s| STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom))
            .collect()
    }
}
