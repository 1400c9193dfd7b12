//! In-process fake adbd for integration tests.
//!
//! The daemon speaks the device side of the protocol over a
//! `tokio::io::duplex` pipe: AUTH handshake, `shell:` / `shell,v2,raw:`
//! and the `sync:` RECV/SEND/LIST/QUIT exchanges.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use quest_downgrade::adb::auth::CredentialStore;
use quest_downgrade::adb::connection::{Connection, MessageWriter};
use quest_downgrade::adb::device::{AdbDevice, DeviceManager, DeviceSelector};
use quest_downgrade::adb::protocol::{
    Command, Message, AUTH_RSAPUBLICKEY, AUTH_SIGNATURE, AUTH_TOKEN, A_VERSION,
};
use quest_downgrade::bridge::{ManagerFactory, SessionManager};
use quest_downgrade::Result;
use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

pub const SERIAL: &str = "1WMHHFAKE00001";
pub const TOKEN: [u8; 20] = [0x5a; 20];

/// One 1024-bit key shared by every test in a binary
pub fn test_key() -> RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    KEY.get_or_init(|| RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap())
        .clone()
}

pub fn credentials() -> Arc<CredentialStore> {
    Arc::new(CredentialStore::from_key(test_key(), "test@host"))
}

#[derive(Debug, Clone)]
pub struct ShellReply {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: u8,
}

impl ShellReply {
    pub fn ok(stdout: &str) -> Self {
        Self {
            stdout: stdout.to_string(),
            stderr: String::new(),
            exit_code: 0,
        }
    }
}

/// What the fake device knows and records
#[derive(Debug)]
pub struct DeviceState {
    /// Key the device already trusts; `None` trusts nothing
    pub trusted: Option<RsaPublicKey>,
    /// Accept an unknown key when it is offered
    pub accept_new_keys: bool,
    pub shell_v2: bool,
    pub max_payload: u32,
    /// Size of the DATA chunks RECV answers with
    pub recv_chunk: usize,
    pub files: StdMutex<HashMap<String, Vec<u8>>>,
    pub shell: StdMutex<HashMap<String, ShellReply>>,
    /// `write-start <path>` / `write-end <path>` in the order they happen
    pub events: StdMutex<Vec<String>>,
    pub commands: StdMutex<Vec<String>>,
    pub connects: AtomicUsize,
    /// `sync:` services opened so far
    pub sync_opens: AtomicUsize,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            trusted: Some(RsaPublicKey::from(&test_key())),
            accept_new_keys: false,
            shell_v2: true,
            max_payload: 4096,
            recv_chunk: 3,
            files: StdMutex::new(HashMap::new()),
            shell: StdMutex::new(HashMap::new()),
            events: StdMutex::new(Vec::new()),
            commands: StdMutex::new(Vec::new()),
            connects: AtomicUsize::new(0),
            sync_opens: AtomicUsize::new(0),
        }
    }
}

impl DeviceState {
    pub fn with_file(self, path: &str, data: &[u8]) -> Self {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), data.to_vec());
        self
    }

    pub fn with_command(self, command: &str, reply: ShellReply) -> Self {
        self.shell
            .lock()
            .unwrap()
            .insert(command.to_string(), reply);
        self
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.files.lock().unwrap().get(path).cloned()
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

/// Beat Saber style replies for the resolver commands
pub fn beat_saber_state(version: &str, apk: &[u8]) -> DeviceState {
    let path = "/data/app/com.beatgames.beatsaber-1/base.apk";
    DeviceState::default()
        .with_file(path, apk)
        .with_command(
            "dumpsys package com.beatgames.beatsaber",
            ShellReply::ok(&format!(
                "Packages:\n  Package [com.beatgames.beatsaber] (c0ffee):\n    versionCode=1 minSdk=29\n    versionName={}\n",
                version
            )),
        )
        .with_command(
            "pm path com.beatgames.beatsaber",
            ShellReply::ok(&format!("package:{}\n", path)),
        )
        .with_command(
            &format!("du -b {} | awk '{{print $1}}'", path),
            ShellReply::ok(&format!("{}\n", apk.len())),
        )
}

// =============================================================================
// Device / manager
// =============================================================================

#[derive(Debug)]
pub struct FakeDevice {
    pub state: Arc<DeviceState>,
}

#[async_trait]
impl AdbDevice for FakeDevice {
    fn serial(&self) -> &str {
        SERIAL
    }

    async fn connect(&self) -> Result<Connection> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        let (host, device) = tokio::io::duplex(64 * 1024);
        let state = self.state.clone();
        tokio::spawn(async move {
            run_daemon(Connection::from_stream("host", device), state).await;
        });
        Ok(Connection::from_stream(SERIAL, host))
    }
}

pub struct FakeManager {
    device: Arc<FakeDevice>,
    pub lookups: Arc<AtomicUsize>,
}

#[async_trait]
impl DeviceManager for FakeManager {
    async fn devices(&self) -> Result<Vec<Arc<dyn AdbDevice>>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let device: Arc<dyn AdbDevice> = self.device.clone();
        Ok(vec![device])
    }
}

/// Counters observed by session tests
#[derive(Debug, Clone, Default)]
pub struct Counters {
    pub factory: Arc<AtomicUsize>,
    pub lookups: Arc<AtomicUsize>,
}

pub fn session_manager(state: Arc<DeviceState>) -> (SessionManager, Counters) {
    session_manager_with(state, credentials(), Duration::from_secs(5))
}

pub fn session_manager_with(
    state: Arc<DeviceState>,
    credentials: Arc<CredentialStore>,
    auth_timeout: Duration,
) -> (SessionManager, Counters) {
    let counters = Counters::default();
    let device = Arc::new(FakeDevice { state });
    let factory_calls = counters.factory.clone();
    let lookups = counters.lookups.clone();

    let factory: ManagerFactory = Box::new(move || {
        factory_calls.fetch_add(1, Ordering::SeqCst);
        let manager: Arc<dyn DeviceManager> = Arc::new(FakeManager {
            device: device.clone(),
            lookups: lookups.clone(),
        });
        Ok(manager)
    });

    let manager = SessionManager::new(factory, DeviceSelector::any(), credentials, auth_timeout);
    (manager, counters)
}

// =============================================================================
// Daemon
// =============================================================================

type Writer = Arc<Mutex<Box<dyn MessageWriter>>>;

async fn send(writer: &Writer, message: Message) -> bool {
    writer.lock().await.write_message(&message).await.is_ok()
}

async fn run_daemon(connection: Connection, state: Arc<DeviceState>) {
    let (_, mut reader, writer) = connection.into_parts();
    let writer: Writer = Arc::new(Mutex::new(writer));

    // Handshake
    let Ok(hello) = reader.read_message().await else { return };
    if hello.command != Command::Cnxn {
        return;
    }
    send(&writer, Message::auth(AUTH_TOKEN, Bytes::from_static(&TOKEN))).await;

    loop {
        let Ok(auth) = reader.read_message().await else { return };
        match auth.arg0 {
            AUTH_SIGNATURE => {
                let verified = state.trusted.as_ref().is_some_and(|key| {
                    key.verify(Pkcs1v15Sign::new::<Sha1>(), &TOKEN, &auth.payload)
                        .is_ok()
                });
                if verified {
                    break;
                }
                send(&writer, Message::auth(AUTH_TOKEN, Bytes::from_static(&TOKEN))).await;
            }
            AUTH_RSAPUBLICKEY if state.accept_new_keys => break,
            AUTH_RSAPUBLICKEY => {
                // Operator never answers the prompt; keep the pipe open
                std::future::pending::<()>().await;
            }
            _ => return,
        }
    }

    let features = if state.shell_v2 { "shell_v2,cmd" } else { "cmd" };
    let banner = format!(
        "device::ro.product.name=hollywood;ro.product.model=Quest 2;features={}\0",
        features
    );
    send(
        &writer,
        Message::new(Command::Cnxn, A_VERSION, state.max_payload, banner),
    )
    .await;

    // Streams, keyed by our (device) id
    let mut streams: HashMap<u32, mpsc::UnboundedSender<Bytes>> = HashMap::new();
    let mut next_id = 100u32;

    while let Ok(message) = reader.read_message().await {
        match message.command {
            Command::Open => {
                let host_id = message.arg0;
                let service = message.payload_str();
                let Some(kind) = ServiceKind::parse(&service) else {
                    send(&writer, Message::close(0, host_id)).await;
                    continue;
                };

                let device_id = next_id;
                next_id += 1;
                let (tx, rx) = mpsc::unbounded_channel();
                streams.insert(device_id, tx);
                send(&writer, Message::okay(device_id, host_id)).await;

                let stream = DeviceStream {
                    device_id,
                    host_id,
                    max_payload: state.max_payload as usize,
                    writer: writer.clone(),
                    inbox: rx,
                    buffer: BytesMut::new(),
                };
                let state = state.clone();
                tokio::spawn(async move {
                    match kind {
                        ServiceKind::Shell { command, v2 } => {
                            serve_shell(stream, &state, &command, v2).await
                        }
                        ServiceKind::Sync => {
                            state.sync_opens.fetch_add(1, Ordering::SeqCst);
                            serve_sync(stream, &state).await
                        }
                    }
                });
            }
            Command::Wrte => {
                let device_id = message.arg1;
                send(&writer, Message::okay(device_id, message.arg0)).await;
                if let Some(tx) = streams.get(&device_id) {
                    let _ = tx.send(message.payload);
                }
            }
            Command::Clse => {
                streams.remove(&message.arg1);
            }
            _ => {}
        }
    }
}

enum ServiceKind {
    Shell { command: String, v2: bool },
    Sync,
}

impl ServiceKind {
    fn parse(service: &str) -> Option<Self> {
        if service == "sync:" {
            Some(Self::Sync)
        } else if let Some(command) = service.strip_prefix("shell,v2,raw:") {
            Some(Self::Shell {
                command: command.to_string(),
                v2: true,
            })
        } else {
            service.strip_prefix("shell:").map(|command| Self::Shell {
                command: command.to_string(),
                v2: false,
            })
        }
    }
}

struct DeviceStream {
    device_id: u32,
    host_id: u32,
    max_payload: usize,
    writer: Writer,
    inbox: mpsc::UnboundedReceiver<Bytes>,
    buffer: BytesMut,
}

impl DeviceStream {
    async fn read_exact(&mut self, len: usize) -> Option<Bytes> {
        while self.buffer.len() < len {
            let data = self.inbox.recv().await?;
            self.buffer.extend_from_slice(&data);
        }
        Some(self.buffer.split_to(len).freeze())
    }

    async fn write(&self, data: &[u8]) {
        for chunk in data.chunks(self.max_payload) {
            send(
                &self.writer,
                Message::write(self.device_id, self.host_id, Bytes::copy_from_slice(chunk)),
            )
            .await;
        }
    }

    async fn close(&self) {
        send(&self.writer, Message::close(self.device_id, self.host_id)).await;
    }
}

fn shell_packet(id: u8, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(5 + data.len());
    out.push(id);
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(data);
    out
}

async fn serve_shell(stream: DeviceStream, state: &DeviceState, command: &str, v2: bool) {
    state.commands.lock().unwrap().push(command.to_string());
    let reply = state
        .shell
        .lock()
        .unwrap()
        .get(command)
        .cloned()
        .unwrap_or(ShellReply {
            stdout: String::new(),
            stderr: format!("/system/bin/sh: {}: not found\n", command),
            exit_code: 127,
        });

    if v2 {
        // Split stdout mid-packet to exercise reassembly
        let mut wire = shell_packet(1, reply.stdout.as_bytes());
        wire.extend(shell_packet(2, reply.stderr.as_bytes()));
        wire.extend(shell_packet(3, &[reply.exit_code]));
        let mid = wire.len() / 2;
        stream.write(&wire[..mid]).await;
        stream.write(&wire[mid..]).await;
    } else {
        let mut text = reply.stdout.clone();
        text.push_str(&reply.stderr);
        stream.write(text.as_bytes()).await;
    }
    stream.close().await;
}

fn sync_frame(id: &[u8; 4], body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + body.len());
    out.extend_from_slice(id);
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(body);
    out
}

async fn serve_sync(mut stream: DeviceStream, state: &DeviceState) {
    loop {
        let Some(header) = stream.read_exact(8).await else { return };
        let mut header = header;
        let mut id = [0u8; 4];
        header.copy_to_slice(&mut id);
        let len = header.get_u32_le() as usize;

        match &id {
            b"RECV" => {
                let Some(path) = stream.read_exact(len).await else { return };
                let path = String::from_utf8_lossy(&path).into_owned();
                let Some(data) = state.file(&path) else {
                    // adbd ends the sync service after any FAIL
                    stream
                        .write(&sync_frame(b"FAIL", b"No such file or directory"))
                        .await;
                    stream.close().await;
                    return;
                };
                let mut out = Vec::new();
                for chunk in data.chunks(state.recv_chunk) {
                    out.extend(sync_frame(b"DATA", chunk));
                }
                out.extend(sync_frame(b"DONE", &[]));
                stream.write(&out).await;
            }
            b"SEND" => {
                let Some(target) = stream.read_exact(len).await else { return };
                let target = String::from_utf8_lossy(&target).into_owned();
                let path = target.rsplit_once(',').map_or(target.as_str(), |(p, _)| p).to_string();
                state.events.lock().unwrap().push(format!("write-start {}", path));

                let mut content = Vec::new();
                loop {
                    let Some(mut header) = stream.read_exact(8).await else { return };
                    let mut id = [0u8; 4];
                    header.copy_to_slice(&mut id);
                    let len = header.get_u32_le() as usize;
                    match &id {
                        b"DATA" => {
                            let Some(data) = stream.read_exact(len).await else { return };
                            content.extend_from_slice(&data);
                        }
                        b"DONE" => break,
                        _ => return,
                    }
                }

                // Give an overlapping writer a chance to show up
                tokio::time::sleep(Duration::from_millis(10)).await;
                state.events.lock().unwrap().push(format!("write-end {}", path));

                if path.starts_with("/readonly/") {
                    stream
                        .write(&sync_frame(b"FAIL", b"Read-only file system"))
                        .await;
                    stream.close().await;
                    return;
                }
                state.files.lock().unwrap().insert(path, content);
                stream.write(&sync_frame(b"OKAY", &[])).await;
            }
            b"LIST" => {
                let Some(dir) = stream.read_exact(len).await else { return };
                let dir = String::from_utf8_lossy(&dir).trim_end_matches('/').to_string();
                let prefix = format!("{}/", dir);

                let mut out = Vec::new();
                let mut dent = |name: &str, mode: u32, size: u32| {
                    let mut record = BytesMut::new();
                    record.put_slice(b"DENT");
                    record.put_u32_le(mode);
                    record.put_u32_le(size);
                    record.put_u32_le(1_700_000_000);
                    record.put_u32_le(name.len() as u32);
                    record.put_slice(name.as_bytes());
                    out.extend_from_slice(&record);
                };
                dent(".", 0o040755, 4096);
                dent("..", 0o040755, 4096);
                let files = state.files.lock().unwrap().clone();
                let mut names: Vec<_> = files
                    .iter()
                    .filter_map(|(path, data)| {
                        path.strip_prefix(&prefix)
                            .filter(|rest| !rest.contains('/'))
                            .map(|name| (name.to_string(), data.len() as u32))
                    })
                    .collect();
                names.sort();
                for (name, size) in names {
                    dent(&name, 0o100644, size);
                }
                out.extend_from_slice(b"DONE");
                out.extend_from_slice(&[0u8; 16]);
                stream.write(&out).await;
            }
            b"QUIT" => {
                stream.close().await;
                return;
            }
            _ => return,
        }
    }
}
