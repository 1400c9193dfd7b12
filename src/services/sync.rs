//! File transfer over the ADB `sync:` service.
//!
//! Requests are `id: [u8; 4] | length: u32 LE | path`. Responses:
//!
//! - `RECV` answers with `DATA` chunks then `DONE`, or `FAIL <msg>`
//! - `SEND <path>,<mode>` is followed by our `DATA` chunks and
//!   `DONE <mtime>`; the device answers `OKAY` or `FAIL <msg>`
//! - `LIST` answers with `DENT mode size mtime namelen name` records
//!   terminated by a zeroed `DONE` record
//! - `QUIT` ends the service

use crate::adb::transport::{AdbSession, AdbStream};
use crate::error::{BridgeError, Result};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, trace};

/// Largest DATA chunk the sync service accepts
pub const SYNC_DATA_MAX: usize = 64 * 1024;

/// Longest remote path the device accepts
pub const MAX_PATH_LEN: usize = 1024;

/// Mode used for pushed files (regular file, rw-r--r--)
pub const DEFAULT_FILE_MODE: u32 = 0o100644;

const S_IFMT: u32 = 0o170000;
const S_IFDIR: u32 = 0o040000;
const S_IFREG: u32 = 0o100000;
const S_IFLNK: u32 = 0o120000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
    Other,
}

impl EntryKind {
    pub fn from_mode(mode: u32) -> Self {
        match mode & S_IFMT {
            S_IFREG => Self::File,
            S_IFDIR => Self::Directory,
            S_IFLNK => Self::Symlink,
            _ => Self::Other,
        }
    }
}

/// One record from a remote directory listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
    pub mode: u32,
    pub mtime: u32,
}

/// Remote file operations the pipeline depends on
#[async_trait]
pub trait RemoteFiles: Send + Sync {
    async fn read_file(&self, path: &str) -> Result<Bytes>;
    async fn write_file(&self, path: &str, content: Bytes) -> Result<()>;
    async fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>>;
}

fn request(id: &[u8; 4], body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(8 + body.len());
    buf.put_slice(id);
    buf.put_u32_le(body.len() as u32);
    buf.put_slice(body);
    buf.freeze()
}

fn check_path(path: &str) -> Result<()> {
    if path.is_empty() || path.len() > MAX_PATH_LEN {
        return Err(BridgeError::remote_io(path, "invalid remote path length"));
    }
    Ok(())
}

/// Failures under a file operation are reported against its path
fn remote_error(path: &str, e: BridgeError) -> BridgeError {
    match e {
        BridgeError::RemoteIo { .. } => e,
        other => BridgeError::remote_io(path, other.to_string()),
    }
}

fn le_u32(raw: &[u8]) -> u32 {
    u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]])
}

/// The session's `sync:` stream.
///
/// Each request/response exchange holds the stream for its whole duration
/// so exchanges never interleave on the wire. adbd ends the service after
/// a `FAIL`, so a stream that saw any error is discarded and the next
/// request opens a fresh one.
pub struct SyncHandle {
    session: AdbSession,
    stream: Mutex<Option<AdbStream>>,
    quit: AtomicBool,
}

impl std::fmt::Debug for SyncHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncHandle")
            .field("serial", &self.session.serial())
            .field("quit", &self.quit.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl SyncHandle {
    pub async fn open(session: &AdbSession) -> Result<Self> {
        let stream = session.open("sync:").await?;
        debug!("Opened sync service on {}", session.serial());
        Ok(Self {
            session: session.clone(),
            stream: Mutex::new(Some(stream)),
            quit: AtomicBool::new(false),
        })
    }

    /// True while a live stream is held
    pub async fn is_open(&self) -> bool {
        self.stream
            .lock()
            .await
            .as_ref()
            .is_some_and(|stream| !stream.is_closed())
    }

    /// The live stream, reopening the service if the last one was dropped
    async fn ready<'a>(
        &self,
        slot: &'a mut Option<AdbStream>,
        path: &str,
    ) -> Result<&'a mut AdbStream> {
        if self.quit.load(Ordering::Acquire) {
            return Err(Self::closed(path));
        }
        if slot.as_ref().is_some_and(AdbStream::is_closed) {
            *slot = None;
        }
        if slot.is_none() {
            debug!("Reopening sync service on {}", self.session.serial());
            *slot = Some(self.session.open("sync:").await?);
        }
        slot.as_mut().ok_or_else(|| Self::closed(path))
    }

    /// Drop the stream after a failed exchange; the service is over
    async fn discard(slot: &mut Option<AdbStream>) {
        if let Some(stream) = slot.take() {
            if let Err(e) = stream.close().await {
                trace!("Closing failed sync stream: {}", e);
            }
        }
    }

    /// Read the 4-byte id and u32 length that start every response
    async fn read_response(stream: &mut AdbStream) -> Result<([u8; 4], u32)> {
        let raw = stream.read_exact(8).await?;
        let mut id = [0u8; 4];
        id.copy_from_slice(&raw[..4]);
        Ok((id, le_u32(&raw[4..8])))
    }

    async fn read_failure(stream: &mut AdbStream, path: &str, len: u32) -> BridgeError {
        match stream.read_exact(len as usize).await {
            Ok(msg) => BridgeError::remote_io(path, String::from_utf8_lossy(&msg).into_owned()),
            Err(e) => e,
        }
    }

    fn closed(path: &str) -> BridgeError {
        BridgeError::remote_io(path, "sync service closed")
    }

    /// Fetch a remote file as the chunks the device sent, in order
    pub async fn receive(&self, path: &str) -> Result<Vec<Bytes>> {
        check_path(path)?;
        let mut guard = self.stream.lock().await;
        let stream = self.ready(&mut guard, path).await?;
        let result = Self::receive_on(stream, path).await;
        if result.is_err() {
            Self::discard(&mut guard).await;
        }
        result
    }

    async fn receive_on(stream: &mut AdbStream, path: &str) -> Result<Vec<Bytes>> {
        stream.write(&request(b"RECV", path.as_bytes())).await?;

        let mut chunks = Vec::new();
        loop {
            let (id, len) = Self::read_response(stream).await?;
            match &id {
                b"DATA" => {
                    if len as usize > SYNC_DATA_MAX {
                        return Err(BridgeError::protocol(format!(
                            "sync DATA chunk of {} bytes",
                            len
                        )));
                    }
                    chunks.push(stream.read_exact(len as usize).await?);
                }
                b"DONE" => break,
                b"FAIL" => return Err(Self::read_failure(stream, path, len).await),
                other => {
                    return Err(BridgeError::protocol(format!(
                        "unexpected sync response {:?} to RECV",
                        String::from_utf8_lossy(other)
                    )))
                }
            }
        }
        trace!("RECV {}: {} chunks", path, chunks.len());
        Ok(chunks)
    }

    /// Push `content` to `path` with the given mode and mtime
    pub async fn send(&self, path: &str, mode: u32, mtime: u32, content: &[u8]) -> Result<()> {
        check_path(path)?;
        let mut guard = self.stream.lock().await;
        let stream = self.ready(&mut guard, path).await?;
        let result = Self::send_on(stream, path, mode, mtime, content).await;
        if result.is_err() {
            Self::discard(&mut guard).await;
        }
        result
    }

    async fn send_on(
        stream: &mut AdbStream,
        path: &str,
        mode: u32,
        mtime: u32,
        content: &[u8],
    ) -> Result<()> {
        let target = format!("{},{}", path, mode);
        stream.write(&request(b"SEND", target.as_bytes())).await?;
        for chunk in content.chunks(SYNC_DATA_MAX) {
            stream.write(&request(b"DATA", chunk)).await?;
        }
        let mut done = BytesMut::with_capacity(8);
        done.put_slice(b"DONE");
        done.put_u32_le(mtime);
        stream.write(&done).await?;

        let (id, len) = Self::read_response(stream).await?;
        match &id {
            b"OKAY" => {
                trace!("SEND {}: {} bytes", path, content.len());
                Ok(())
            }
            b"FAIL" => Err(Self::read_failure(stream, path, len).await),
            other => Err(BridgeError::protocol(format!(
                "unexpected sync response {:?} to SEND",
                String::from_utf8_lossy(other)
            ))),
        }
    }

    pub async fn list(&self, path: &str) -> Result<Vec<DirEntry>> {
        check_path(path)?;
        let mut guard = self.stream.lock().await;
        let stream = self.ready(&mut guard, path).await?;
        let result = Self::list_on(stream, path).await;
        if result.is_err() {
            Self::discard(&mut guard).await;
        }
        result
    }

    async fn list_on(stream: &mut AdbStream, path: &str) -> Result<Vec<DirEntry>> {
        stream.write(&request(b"LIST", path.as_bytes())).await?;

        let mut entries = Vec::new();
        loop {
            // DENT/DONE records are id, mode, size, mtime, namelen
            let (id, first) = Self::read_response(stream).await?;
            match &id {
                b"DENT" => {
                    let rest = stream.read_exact(12).await?;
                    let size = le_u32(&rest[0..4]);
                    let mtime = le_u32(&rest[4..8]);
                    let name_len = le_u32(&rest[8..12]) as usize;
                    let name = stream.read_exact(name_len).await?;
                    let name = String::from_utf8_lossy(&name).into_owned();
                    if name == "." || name == ".." {
                        continue;
                    }
                    entries.push(DirEntry {
                        name,
                        kind: EntryKind::from_mode(first),
                        size: size as u64,
                        mode: first,
                        mtime,
                    });
                }
                b"DONE" => {
                    stream.read_exact(12).await?;
                    break;
                }
                b"FAIL" => return Err(Self::read_failure(stream, path, first).await),
                other => {
                    return Err(BridgeError::protocol(format!(
                        "unexpected sync response {:?} to LIST",
                        String::from_utf8_lossy(other)
                    )))
                }
            }
        }
        Ok(entries)
    }

    /// Send QUIT and release the stream. Later calls fail.
    pub async fn quit(&self) -> Result<()> {
        self.quit.store(true, Ordering::Release);
        if let Some(mut stream) = self.stream.lock().await.take() {
            stream.write(&request(b"QUIT", &[])).await?;
            stream.close().await?;
        }
        Ok(())
    }
}

/// Remote file access for one session
#[derive(Debug, Clone)]
pub struct SyncService {
    handle: Arc<SyncHandle>,
    write_lock: Arc<Mutex<()>>,
}

impl SyncService {
    pub fn new(handle: Arc<SyncHandle>) -> Self {
        Self {
            handle,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn handle(&self) -> &Arc<SyncHandle> {
        &self.handle
    }

    /// True while a write holds the lock
    pub fn is_writing(&self) -> bool {
        self.write_lock.try_lock().is_err()
    }
}

#[async_trait]
impl RemoteFiles for SyncService {
    async fn read_file(&self, path: &str) -> Result<Bytes> {
        let chunks = self
            .handle
            .receive(path)
            .await
            .map_err(|e| remote_error(path, e))?;
        let total: usize = chunks.iter().map(Bytes::len).sum();
        let mut buf = BytesMut::with_capacity(total);
        for chunk in &chunks {
            buf.extend_from_slice(chunk);
        }
        debug!("Read {} ({} bytes)", path, total);
        Ok(buf.freeze())
    }

    async fn write_file(&self, path: &str, content: Bytes) -> Result<()> {
        // Released on every exit path when the guard drops
        let _guard = self.write_lock.lock().await;
        let mtime = chrono::Utc::now().timestamp().max(0) as u32;
        self.handle
            .send(path, DEFAULT_FILE_MODE, mtime, &content)
            .await
            .map_err(|e| remote_error(path, e))?;
        debug!("Wrote {} ({} bytes)", path, content.len());
        Ok(())
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>> {
        self.handle
            .list(path)
            .await
            .map_err(|e| remote_error(path, e))
    }
}
