//! ADB transport message framing.
//!
//! Wire format: every message is a 24-byte header followed by an optional
//! payload. All header fields are little-endian u32.
//!
//! ```text
//! command | arg0 | arg1 | data_length | data_checksum | magic
//! ```
//!
//! `magic` is `command ^ 0xffffffff`. The checksum is the byte sum of the
//! payload; devices speaking version 0x01000001 and later ignore it.

use crate::error::{BridgeError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Protocol version sent in CNXN (skip-checksum capable)
pub const A_VERSION: u32 = 0x0100_0001;

/// Largest payload we ask the device to send
pub const MAX_PAYLOAD: u32 = 256 * 1024;

/// Hard limit on incoming payloads - prevents OOM from corrupted headers
pub const MAX_PAYLOAD_LIMIT: u32 = 1024 * 1024;

pub const HEADER_SIZE: usize = 24;

/// AUTH arg0 values
pub const AUTH_TOKEN: u32 = 1;
pub const AUTH_SIGNATURE: u32 = 2;
pub const AUTH_RSAPUBLICKEY: u32 = 3;

// =============================================================================
// Commands
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Command {
    Cnxn = 0x4e58_4e43,
    Auth = 0x4854_5541,
    Open = 0x4e45_504f,
    Okay = 0x5941_4b4f,
    Clse = 0x4553_4c43,
    Wrte = 0x4554_5257,
    Stls = 0x534c_5453,
}

impl Command {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0x4e58_4e43 => Some(Self::Cnxn),
            0x4854_5541 => Some(Self::Auth),
            0x4e45_504f => Some(Self::Open),
            0x5941_4b4f => Some(Self::Okay),
            0x4553_4c43 => Some(Self::Clse),
            0x4554_5257 => Some(Self::Wrte),
            0x534c_5453 => Some(Self::Stls),
            _ => None,
        }
    }

    pub fn magic(self) -> u32 {
        self as u32 ^ 0xffff_ffff
    }
}

// =============================================================================
// Header
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub command: Command,
    pub arg0: u32,
    pub arg1: u32,
    pub data_length: u32,
    pub data_checksum: u32,
}

impl Header {
    pub fn decode(raw: &[u8; HEADER_SIZE]) -> Result<Self> {
        let mut buf = &raw[..];
        let command = buf.get_u32_le();
        let arg0 = buf.get_u32_le();
        let arg1 = buf.get_u32_le();
        let data_length = buf.get_u32_le();
        let data_checksum = buf.get_u32_le();
        let magic = buf.get_u32_le();

        let command = Command::from_u32(command)
            .ok_or_else(|| BridgeError::protocol(format!("Unknown command {:#010x}", command)))?;

        if magic != command.magic() {
            return Err(BridgeError::protocol(format!(
                "Bad magic for {:?}: {:#010x}",
                command, magic
            )));
        }

        if data_length > MAX_PAYLOAD_LIMIT {
            return Err(BridgeError::protocol(format!(
                "Payload size {} exceeds maximum allowed size {}",
                data_length, MAX_PAYLOAD_LIMIT
            )));
        }

        Ok(Self {
            command,
            arg0,
            arg1,
            data_length,
            data_checksum,
        })
    }
}

// =============================================================================
// Message
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub command: Command,
    pub arg0: u32,
    pub arg1: u32,
    pub payload: Bytes,
}

impl Message {
    pub fn new(command: Command, arg0: u32, arg1: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            command,
            arg0,
            arg1,
            payload: payload.into(),
        }
    }

    /// CNXN with our version, max payload and `host::` banner
    pub fn connect(banner: &str) -> Self {
        Self::new(Command::Cnxn, A_VERSION, MAX_PAYLOAD, null_terminated(banner))
    }

    pub fn auth(kind: u32, data: impl Into<Bytes>) -> Self {
        Self::new(Command::Auth, kind, 0, data)
    }

    pub fn open(local_id: u32, service: &str) -> Self {
        Self::new(Command::Open, local_id, 0, null_terminated(service))
    }

    pub fn okay(local_id: u32, remote_id: u32) -> Self {
        Self::new(Command::Okay, local_id, remote_id, Bytes::new())
    }

    pub fn write(local_id: u32, remote_id: u32, data: impl Into<Bytes>) -> Self {
        Self::new(Command::Wrte, local_id, remote_id, data)
    }

    pub fn close(local_id: u32, remote_id: u32) -> Self {
        Self::new(Command::Clse, local_id, remote_id, Bytes::new())
    }

    pub fn header(&self) -> [u8; HEADER_SIZE] {
        let mut raw = [0u8; HEADER_SIZE];
        let mut buf = &mut raw[..];
        buf.put_u32_le(self.command as u32);
        buf.put_u32_le(self.arg0);
        buf.put_u32_le(self.arg1);
        buf.put_u32_le(self.payload.len() as u32);
        buf.put_u32_le(checksum(&self.payload));
        buf.put_u32_le(self.command.magic());
        raw
    }

    /// Header and payload as one contiguous frame
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        buf.put_slice(&self.header());
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Payload as text with any trailing NUL removed
    pub fn payload_str(&self) -> String {
        let raw = self.payload.as_ref();
        let raw = raw.strip_suffix(&[0u8]).unwrap_or(raw);
        String::from_utf8_lossy(raw).into_owned()
    }
}

pub fn checksum(data: &[u8]) -> u32 {
    data.iter().fold(0u32, |acc, b| acc.wrapping_add(*b as u32))
}

fn null_terminated(s: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(s.len() + 1);
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
    buf.freeze()
}

// =============================================================================
// Stream reading/writing
// =============================================================================

/// Read a single message from a byte stream.
pub async fn read_message<R: AsyncRead + Unpin>(r: &mut R) -> Result<Message> {
    let mut raw = [0u8; HEADER_SIZE];
    r.read_exact(&mut raw).await?;
    let header = Header::decode(&raw)?;

    let mut payload = vec![0u8; header.data_length as usize];
    r.read_exact(&mut payload).await?;

    Ok(Message {
        command: header.command,
        arg0: header.arg0,
        arg1: header.arg1,
        payload: Bytes::from(payload),
    })
}

/// Write a single message to a byte stream.
pub async fn write_message<W: AsyncWrite + Unpin>(w: &mut W, message: &Message) -> Result<()> {
    w.write_all(&message.encode()).await?;
    w.flush().await?;
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
