//! Authenticated ADB transport.
//!
//! `AdbTransport::authenticate` runs the CNXN/AUTH handshake on a fresh
//! [`Connection`]. Afterwards a reader task owns the read half and routes
//! OKAY/WRTE/CLSE messages to streams by local id, while streams share the
//! write half behind a mutex so whole messages never interleave.

use crate::adb::auth::CredentialStore;
use crate::adb::connection::{Connection, MessageWriter};
use crate::adb::protocol::{
    Command, Message, AUTH_RSAPUBLICKEY, AUTH_SIGNATURE, AUTH_TOKEN, MAX_PAYLOAD,
};
use crate::error::{BridgeError, Result};
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Features we advertise in the host banner
const HOST_FEATURES: &[&str] = &["shell_v2", "cmd", "stat_v2", "ls_v2"];

type StreamRegistry = Arc<StdMutex<HashMap<u32, mpsc::UnboundedSender<Message>>>>;
type SharedWriter = Arc<Mutex<Box<dyn MessageWriter>>>;

/// Parsed device CNXN banner, e.g.
/// `device::ro.product.name=hollywood;ro.product.model=Quest 2;features=shell_v2,cmd`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceBanner {
    pub system_type: String,
    pub properties: HashMap<String, String>,
    pub features: Vec<String>,
}

impl DeviceBanner {
    pub fn parse(banner: &str) -> Self {
        let mut parts = banner.splitn(3, ':');
        let system_type = parts.next().unwrap_or_default().to_string();
        let _serial = parts.next();
        let props = parts.next().unwrap_or_default();

        let mut properties = HashMap::new();
        let mut features = Vec::new();
        for entry in props.split(';').filter(|e| !e.is_empty()) {
            if let Some((key, value)) = entry.split_once('=') {
                if key == "features" {
                    features = value
                        .split(',')
                        .filter(|f| !f.is_empty())
                        .map(str::to_string)
                        .collect();
                } else {
                    properties.insert(key.to_string(), value.to_string());
                }
            }
        }

        Self {
            system_type,
            properties,
            features,
        }
    }

    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.iter().any(|f| f == feature)
    }

    pub fn model(&self) -> Option<&str> {
        self.properties.get("ro.product.model").map(String::as_str)
    }
}

pub struct AdbTransport {
    serial: String,
    banner: DeviceBanner,
    max_payload: usize,
    writer: SharedWriter,
    streams: StreamRegistry,
    next_local_id: AtomicU32,
    reader_task: JoinHandle<()>,
}

impl std::fmt::Debug for AdbTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdbTransport")
            .field("serial", &self.serial)
            .field("banner", &self.banner)
            .field("max_payload", &self.max_payload)
            .finish_non_exhaustive()
    }
}

impl Drop for AdbTransport {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

impl AdbTransport {
    /// Run the connect/authenticate handshake.
    ///
    /// The first AUTH TOKEN is answered with a signature. If the device
    /// challenges again the key is unknown to it, so the public key is sent
    /// and we wait up to `auth_timeout` for the operator to accept it.
    pub async fn authenticate(
        mut connection: Connection,
        credentials: &CredentialStore,
        auth_timeout: Duration,
    ) -> Result<Self> {
        let serial = connection.serial().to_string();
        connection
            .write_message(&Message::connect(&host_banner()))
            .await?;

        let mut sent_signature = false;
        let mut sent_public_key = false;

        let device_cnxn = loop {
            let message = if sent_public_key {
                tokio::time::timeout(auth_timeout, connection.read_message())
                    .await
                    .map_err(|_| {
                        BridgeError::Authentication(format!(
                            "{} did not accept the key within {}s",
                            serial,
                            auth_timeout.as_secs()
                        ))
                    })??
            } else {
                connection.read_message().await?
            };

            match message.command {
                Command::Cnxn => break message,
                Command::Auth if message.arg0 == AUTH_TOKEN => {
                    if !sent_signature {
                        debug!("AUTH token {}", hex::encode(&message.payload));
                        let signature = credentials.sign_token(&message.payload).await?;
                        connection
                            .write_message(&Message::auth(AUTH_SIGNATURE, signature))
                            .await?;
                        sent_signature = true;
                    } else if !sent_public_key {
                        let public_key = credentials.public_key_payload().await?;
                        connection
                            .write_message(&Message::auth(AUTH_RSAPUBLICKEY, public_key))
                            .await?;
                        sent_public_key = true;
                        info!("Allow USB debugging for this computer on {}", serial);
                    } else {
                        return Err(BridgeError::Authentication(format!(
                            "{} rejected the key",
                            serial
                        )));
                    }
                }
                Command::Stls => {
                    return Err(BridgeError::protocol(
                        "device requires TLS, which is not supported",
                    ))
                }
                other => {
                    return Err(BridgeError::protocol(format!(
                        "unexpected {:?} during handshake",
                        other
                    )))
                }
            }
        };

        let banner = DeviceBanner::parse(&device_cnxn.payload_str());
        let max_payload = device_cnxn.arg1.clamp(1, MAX_PAYLOAD) as usize;
        info!(
            "Connected to {} ({}), max payload {}",
            serial,
            banner.model().unwrap_or("unknown model"),
            max_payload
        );

        let (_, mut reader, writer) = connection.into_parts();
        let writer: SharedWriter = Arc::new(Mutex::new(writer));
        let streams: StreamRegistry = Arc::new(StdMutex::new(HashMap::new()));

        let task_streams = streams.clone();
        let task_writer = writer.clone();
        let task_serial = serial.clone();
        let reader_task = tokio::spawn(async move {
            loop {
                let message = match reader.read_message().await {
                    Ok(m) => m,
                    Err(e) => {
                        debug!("Transport to {} closed: {}", task_serial, e);
                        break;
                    }
                };
                route(message, &task_streams, &task_writer).await;
            }
            // Dropping the senders wakes every stream with a closed channel
            if let Ok(mut streams) = task_streams.lock() {
                streams.clear();
            }
        });

        Ok(Self {
            serial,
            banner,
            max_payload,
            writer,
            streams,
            next_local_id: AtomicU32::new(1),
            reader_task,
        })
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn banner(&self) -> &DeviceBanner {
        &self.banner
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    pub fn is_closed(&self) -> bool {
        self.reader_task.is_finished()
    }

    /// Open a service stream (`shell:...`, `sync:`, ...)
    pub async fn open(&self, service: &str) -> Result<AdbStream> {
        let local_id = self.next_local_id.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.streams
            .lock()
            .map_err(|_| BridgeError::protocol("stream registry poisoned"))?
            .insert(local_id, tx);

        trace!("OPEN {} -> {}", local_id, service);
        self.writer
            .lock()
            .await
            .write_message(&Message::open(local_id, service))
            .await?;

        let remote_id = loop {
            match rx.recv().await {
                Some(m) if m.command == Command::Okay => break m.arg0,
                Some(m) if m.command == Command::Clse => {
                    self.unregister(local_id);
                    return Err(BridgeError::protocol(format!(
                        "device refused service {}",
                        service
                    )));
                }
                Some(m) => warn!("Ignoring {:?} before OKAY on {}", m.command, service),
                None => {
                    return Err(BridgeError::Connection {
                        serial: self.serial.clone(),
                        message: "transport closed".to_string(),
                    })
                }
            }
        };

        Ok(AdbStream {
            local_id,
            remote_id,
            max_payload: self.max_payload,
            writer: self.writer.clone(),
            streams: self.streams.clone(),
            inbox: rx,
            buffer: BytesMut::new(),
            closed: false,
        })
    }

    fn unregister(&self, local_id: u32) {
        if let Ok(mut streams) = self.streams.lock() {
            streams.remove(&local_id);
        }
    }
}

fn host_banner() -> String {
    format!("host::features={}", HOST_FEATURES.join(","))
}

async fn route(message: Message, streams: &StreamRegistry, writer: &SharedWriter) {
    match message.command {
        Command::Okay | Command::Wrte | Command::Clse => {
            let local_id = message.arg1;
            let sender = streams.lock().ok().and_then(|s| s.get(&local_id).cloned());
            match sender {
                Some(tx) => {
                    let _ = tx.send(message);
                }
                None if message.command == Command::Wrte => {
                    // Data for a stream we no longer track; tell the device to stop
                    let _ = writer
                        .lock()
                        .await
                        .write_message(&Message::close(local_id, message.arg0))
                        .await;
                }
                None => trace!("Dropping {:?} for unknown stream {}", message.command, local_id),
            }
        }
        Command::Open => {
            // Reverse-opened streams are not supported
            let _ = writer
                .lock()
                .await
                .write_message(&Message::close(0, message.arg0))
                .await;
        }
        other => debug!("Ignoring {:?} after handshake", other),
    }
}

// =============================================================================
// Streams
// =============================================================================

/// One multiplexed service stream
pub struct AdbStream {
    local_id: u32,
    remote_id: u32,
    max_payload: usize,
    writer: SharedWriter,
    streams: StreamRegistry,
    inbox: mpsc::UnboundedReceiver<Message>,
    buffer: BytesMut,
    closed: bool,
}

impl AdbStream {
    pub fn local_id(&self) -> u32 {
        self.local_id
    }

    /// The device closed the stream, or the transport went away
    pub fn is_closed(&self) -> bool {
        self.closed || self.inbox.is_closed()
    }

    async fn send(&self, message: Message) -> Result<()> {
        self.writer.lock().await.write_message(&message).await
    }

    /// Write data, splitting at max payload; each WRTE waits for its OKAY.
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        for chunk in data.chunks(self.max_payload.max(1)) {
            if self.closed {
                return Err(BridgeError::protocol("write on closed stream"));
            }
            self.send(Message::write(
                self.local_id,
                self.remote_id,
                Bytes::copy_from_slice(chunk),
            ))
            .await?;

            loop {
                match self.inbox.recv().await {
                    Some(m) if m.command == Command::Okay => break,
                    Some(m) if m.command == Command::Wrte => self.accept(m).await?,
                    Some(_) | None => {
                        self.closed = true;
                        return Err(BridgeError::protocol("stream closed during write"));
                    }
                }
            }
        }
        Ok(())
    }

    /// Buffer incoming data and acknowledge it
    async fn accept(&mut self, message: Message) -> Result<()> {
        self.buffer.extend_from_slice(&message.payload);
        self.send(Message::okay(self.local_id, self.remote_id)).await
    }

    /// Next chunk of data, or `None` once the device closed the stream
    pub async fn read(&mut self) -> Result<Option<Bytes>> {
        if !self.buffer.is_empty() {
            return Ok(Some(self.buffer.split().freeze()));
        }
        while !self.closed {
            match self.inbox.recv().await {
                Some(m) if m.command == Command::Wrte => {
                    self.send(Message::okay(self.local_id, self.remote_id))
                        .await?;
                    return Ok(Some(m.payload));
                }
                Some(m) if m.command == Command::Okay => continue,
                Some(_) | None => self.closed = true,
            }
        }
        Ok(None)
    }

    /// Exactly `len` bytes, spanning WRTE boundaries
    pub async fn read_exact(&mut self, len: usize) -> Result<Bytes> {
        while self.buffer.len() < len {
            match self.read().await? {
                Some(data) => self.buffer.extend_from_slice(&data),
                None => {
                    return Err(BridgeError::protocol(format!(
                        "stream closed with {} of {} bytes read",
                        self.buffer.len(),
                        len
                    )))
                }
            }
        }
        Ok(self.buffer.split_to(len).freeze())
    }

    /// Everything until the device closes the stream
    pub async fn read_to_end(&mut self) -> Result<Vec<Bytes>> {
        let mut chunks = Vec::new();
        while let Some(chunk) = self.read().await? {
            chunks.push(chunk);
        }
        Ok(chunks)
    }

    pub async fn close(mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.send(Message::close(self.local_id, self.remote_id))
                .await?;
        }
        Ok(())
    }
}

impl Drop for AdbStream {
    fn drop(&mut self) {
        if let Ok(mut streams) = self.streams.lock() {
            streams.remove(&self.local_id);
        }
    }
}

// =============================================================================
// Session
// =============================================================================

/// Authenticated bridge handle; root object for remote operations
#[derive(Debug, Clone)]
pub struct AdbSession {
    transport: Arc<AdbTransport>,
}

impl AdbSession {
    pub fn new(transport: Arc<AdbTransport>) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &Arc<AdbTransport> {
        &self.transport
    }

    pub fn serial(&self) -> &str {
        self.transport.serial()
    }

    pub fn banner(&self) -> &DeviceBanner {
        self.transport.banner()
    }

    pub fn has_feature(&self, feature: &str) -> bool {
        self.transport.banner().has_feature(feature)
    }

    pub fn max_payload(&self) -> usize {
        self.transport.max_payload()
    }

    pub async fn open(&self, service: &str) -> Result<AdbStream> {
        self.transport.open(service).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_banner_parse() {
        let banner = DeviceBanner::parse(
            "device::ro.product.name=hollywood;ro.product.model=Quest 2;ro.product.device=hollywood;features=shell_v2,cmd,stat_v2",
        );
        assert_eq!(banner.system_type, "device");
        assert_eq!(banner.model(), Some("Quest 2"));
        assert!(banner.has_feature("shell_v2"));
        assert!(banner.has_feature("cmd"));
        assert!(!banner.has_feature("abb"));
    }

    #[test]
    fn test_banner_without_features() {
        let banner = DeviceBanner::parse("device::");
        assert_eq!(banner.system_type, "device");
        assert!(banner.features.is_empty());
        assert!(banner.properties.is_empty());
    }

    #[test]
    fn test_host_banner_lists_shell_v2() {
        assert!(host_banner().starts_with("host::features="));
        assert!(host_banner().contains("shell_v2"));
    }
}
