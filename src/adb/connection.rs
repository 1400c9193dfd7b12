//! Message-level connection to a device.
//!
//! A connection is split into a reader and a writer half so the transport
//! can keep a reader task running while streams send concurrently.

use crate::adb::protocol::{read_message, write_message, Message};
use crate::error::{BridgeError, Result};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tracing::debug;

#[async_trait]
pub trait MessageReader: Send {
    async fn read_message(&mut self) -> Result<Message>;
}

#[async_trait]
pub trait MessageWriter: Send {
    async fn write_message(&mut self, message: &Message) -> Result<()>;
}

/// An open, not yet authenticated channel to one device
pub struct Connection {
    serial: String,
    reader: Box<dyn MessageReader>,
    writer: Box<dyn MessageWriter>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("serial", &self.serial)
            .finish_non_exhaustive()
    }
}

impl Connection {
    pub fn new(
        serial: impl Into<String>,
        reader: Box<dyn MessageReader>,
        writer: Box<dyn MessageWriter>,
    ) -> Self {
        Self {
            serial: serial.into(),
            reader,
            writer,
        }
    }

    /// Wrap any byte stream (TCP socket, in-memory pipe)
    pub fn from_stream<S>(serial: impl Into<String>, stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::new(
            serial,
            Box::new(StreamReader { inner: reader }),
            Box::new(StreamWriter { inner: writer }),
        )
    }

    /// Connect to adbd listening on `host:port` (`adb tcpip` mode)
    pub async fn connect_tcp(address: &str) -> Result<Self> {
        debug!("Connecting to {}", address);
        let stream = TcpStream::connect(address)
            .await
            .map_err(|e| BridgeError::Connection {
                serial: address.to_string(),
                message: e.to_string(),
            })?;
        stream.set_nodelay(true)?;
        Ok(Self::from_stream(address, stream))
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub async fn read_message(&mut self) -> Result<Message> {
        self.reader.read_message().await
    }

    pub async fn write_message(&mut self, message: &Message) -> Result<()> {
        self.writer.write_message(message).await
    }

    pub fn into_parts(self) -> (String, Box<dyn MessageReader>, Box<dyn MessageWriter>) {
        (self.serial, self.reader, self.writer)
    }
}

struct StreamReader<S> {
    inner: ReadHalf<S>,
}

#[async_trait]
impl<S: AsyncRead + Send> MessageReader for StreamReader<S> {
    async fn read_message(&mut self) -> Result<Message> {
        read_message(&mut self.inner).await
    }
}

struct StreamWriter<S> {
    inner: WriteHalf<S>,
}

#[async_trait]
impl<S: AsyncWrite + Send> MessageWriter for StreamWriter<S> {
    async fn write_message(&mut self, message: &Message) -> Result<()> {
        write_message(&mut self.inner, message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adb::protocol::Command;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_stream_connection_halves() {
        let (host, device) = tokio::io::duplex(4096);
        let mut host = Connection::from_stream("emulator-5554", host);
        let mut device = Connection::from_stream("host", device);

        host.write_message(&Message::open(1, "shell:id"))
            .await
            .unwrap();
        let open = device.read_message().await.unwrap();
        assert_eq!(open.command, Command::Open);
        assert_eq!(open.arg0, 1);
        assert_eq!(open.payload_str(), "shell:id");

        device
            .write_message(&Message::write(7, 1, Bytes::from_static(b"uid=0")))
            .await
            .unwrap();
        let data = host.read_message().await.unwrap();
        assert_eq!(data.payload.as_ref(), b"uid=0");
        assert_eq!(host.serial(), "emulator-5554");
    }

    #[tokio::test]
    async fn test_read_after_peer_drop_fails() {
        let (host, device) = tokio::io::duplex(64);
        let mut host = Connection::from_stream("x", host);
        drop(device);
        assert!(host.read_message().await.is_err());
    }
}
