//! Remote command execution.
//!
//! Devices advertising `shell_v2` get the framed protocol, which keeps
//! stdout and stderr apart and reports the exit code:
//!
//! ```text
//! id: u8 | length: u32 LE | data
//! ```
//!
//! with ids 1 (stdout), 2 (stderr) and 3 (exit, one byte). Older devices
//! fall back to `shell:` where stderr is merged into stdout and the exit
//! code is unknown.

use crate::adb::transport::AdbSession;
use crate::error::{BridgeError, Result};
use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use tracing::debug;

const PACKET_HEADER: usize = 5;

const ID_STDIN: u8 = 0;
const ID_STDOUT: u8 = 1;
const ID_STDERR: u8 = 2;
const ID_EXIT: u8 = 3;

/// Captured result of one remote command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the device only speaks the legacy shell protocol
    pub exit_code: Option<u8>,
}

impl CommandOutput {
    /// True unless a known exit code is non-zero
    pub fn success(&self) -> bool {
        self.exit_code.map_or(true, |code| code == 0)
    }
}

#[async_trait]
pub trait RemoteShell: Send + Sync {
    async fn run_command(&self, command: &str) -> Result<CommandOutput>;
}

#[derive(Debug, Clone)]
pub struct ShellService {
    session: AdbSession,
}

impl ShellService {
    pub fn new(session: AdbSession) -> Self {
        Self { session }
    }

    fn spawn_error(command: &str, e: BridgeError) -> BridgeError {
        BridgeError::CommandExecution {
            command: command.to_string(),
            message: e.to_string(),
        }
    }

    async fn run_v2(&self, command: &str) -> Result<CommandOutput> {
        let mut stream = self
            .session
            .open(&format!("shell,v2,raw:{}", command))
            .await
            .map_err(|e| Self::spawn_error(command, e))?;

        let mut decoder = ShellV2Decoder::default();
        while let Some(chunk) = stream.read().await? {
            decoder.feed(&chunk)?;
            if decoder.exit_code.is_some() {
                break;
            }
        }
        stream.close().await?;
        Ok(decoder.finish())
    }

    async fn run_legacy(&self, command: &str) -> Result<CommandOutput> {
        let mut stream = self
            .session
            .open(&format!("shell:{}", command))
            .await
            .map_err(|e| Self::spawn_error(command, e))?;

        let mut stdout = Vec::new();
        for chunk in stream.read_to_end().await? {
            stdout.extend_from_slice(&chunk);
        }
        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::new(),
            exit_code: None,
        })
    }
}

#[async_trait]
impl RemoteShell for ShellService {
    async fn run_command(&self, command: &str) -> Result<CommandOutput> {
        debug!("shell: {}", command);
        if self.session.has_feature("shell_v2") {
            self.run_v2(command).await
        } else {
            self.run_legacy(command).await
        }
    }
}

/// Incremental decoder for shell v2 packets split across WRTE boundaries
#[derive(Debug, Default)]
pub struct ShellV2Decoder {
    pending: BytesMut,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    exit_code: Option<u8>,
}

impl ShellV2Decoder {
    pub fn feed(&mut self, data: &[u8]) -> Result<()> {
        self.pending.extend_from_slice(data);

        while self.pending.len() >= PACKET_HEADER {
            let id = self.pending[0];
            let len = u32::from_le_bytes([
                self.pending[1],
                self.pending[2],
                self.pending[3],
                self.pending[4],
            ]) as usize;
            if self.pending.len() < PACKET_HEADER + len {
                break;
            }
            self.pending.advance(PACKET_HEADER);
            let body = self.pending.split_to(len);

            match id {
                ID_STDOUT => self.stdout.extend_from_slice(&body),
                ID_STDERR => self.stderr.extend_from_slice(&body),
                ID_EXIT => self.exit_code = Some(body.first().copied().unwrap_or(0)),
                ID_STDIN => {}
                // Window-size and close-stdin packets only travel host -> device
                other if other <= 5 => {}
                other => {
                    return Err(BridgeError::protocol(format!(
                        "unknown shell packet id {}",
                        other
                    )))
                }
            }
        }
        Ok(())
    }

    pub fn finish(self) -> CommandOutput {
        CommandOutput {
            stdout: String::from_utf8_lossy(&self.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&self.stderr).into_owned(),
            exit_code: self.exit_code,
        }
    }
}

/// Encode one shell v2 packet
pub fn encode_packet(id: u8, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(PACKET_HEADER + data.len());
    out.push(id);
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(data);
    out
}
