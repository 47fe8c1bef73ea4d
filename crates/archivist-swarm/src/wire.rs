use archivist_types::DiscoveryKey;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{SwarmError, SwarmResult};

pub const WIRE_VERSION: u32 = 1;
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Messages exchanged while opening a TCP replication connection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireMessage {
    /// Sent by the dialer: which archive it wants to replicate.
    Hello {
        version: u32,
        discovery_key: DiscoveryKey,
    },
    /// The acceptor hosts the archive; the handshake is complete.
    HelloAck { version: u32 },
    /// The acceptor refuses the connection.
    Reject { reason: String },
}

impl WireMessage {
    pub fn type_tag(&self) -> u8 {
        match self {
            Self::Hello { .. } => 1,
            Self::HelloAck { .. } => 2,
            Self::Reject { .. } => 255,
        }
    }
}

/// Framing for [`WireMessage`]s: `[4 bytes len][1 byte tag][bincode payload]`.
pub struct WireCodec;

impl WireCodec {
    pub fn encode(msg: &WireMessage) -> SwarmResult<Vec<u8>> {
        let mut frame = vec![0u8; 4];
        frame.push(msg.type_tag());
        bincode::serialize_into(&mut frame, msg)
            .map_err(|e| SwarmError::Serialization(e.to_string()))?;
        let len = frame.len() - 4;
        check_body_len(len)?;
        frame[..4].copy_from_slice(&(len as u32).to_be_bytes());
        Ok(frame)
    }

    /// Decode one frame from the front of `data`. Returns (message, bytes_consumed).
    pub fn decode(data: &[u8]) -> SwarmResult<(WireMessage, usize)> {
        if data.len() < 5 {
            return Err(SwarmError::Framing("too short".into()));
        }
        let len = frame_len(data[0..4].try_into().expect("slice of four bytes"))?;
        let total = 4 + len;
        if data.len() < total {
            return Err(SwarmError::Framing(format!(
                "incomplete: have {}, need {}",
                data.len(),
                total
            )));
        }
        let msg = decode_body(&data[4..total])?;
        Ok((msg, total))
    }

    /// Read one frame. Returns `Ok(None)` on a clean end of stream.
    pub async fn read<R>(reader: &mut R) -> SwarmResult<Option<WireMessage>>
    where
        R: AsyncRead + Unpin,
    {
        let mut header = [0u8; 4];
        match reader.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let len = frame_len(header)?;
        let mut body = vec![0u8; len];
        reader.read_exact(&mut body).await?;
        decode_body(&body).map(Some)
    }

    pub async fn write<W>(writer: &mut W, msg: &WireMessage) -> SwarmResult<()>
    where
        W: AsyncWrite + Unpin,
    {
        let frame = Self::encode(msg)?;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }
}

fn frame_len(header: [u8; 4]) -> SwarmResult<usize> {
    let len = u32::from_be_bytes(header) as usize;
    check_body_len(len)?;
    Ok(len)
}

/// A body is one tag byte plus at most [`MAX_FRAME_SIZE`] bytes of payload.
fn check_body_len(len: usize) -> SwarmResult<()> {
    if len < 1 {
        return Err(SwarmError::Framing("zero-length frame".into()));
    }
    if len - 1 > MAX_FRAME_SIZE {
        return Err(SwarmError::FrameTooLarge {
            size: len - 1,
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(())
}

/// Decode `[tag][payload]`, checking the tag against the payload.
fn decode_body(body: &[u8]) -> SwarmResult<WireMessage> {
    let msg: WireMessage =
        bincode::deserialize(&body[1..]).map_err(|e| SwarmError::Serialization(e.to_string()))?;
    if msg.type_tag() != body[0] {
        return Err(SwarmError::Framing(format!(
            "tag {} does not match {}",
            body[0],
            msg.type_tag()
        )));
    }
    Ok(msg)
}
