//! Device session manager.
//!
//! Resources are acquired lazily and strictly in order:
//!
//! ```text
//! Unstarted -> ManagerReady -> DeviceSelected -> ConnectionOpen
//!           -> CredentialsReady -> TransportAuthenticated -> SessionReady
//! ```
//!
//! Every accessor is idempotent: once a stage is reached its resource is
//! cached and handed out again instead of being re-acquired. The current
//! stage is derived from which resources are held, so it can never
//! disagree with them.
//!
//! Device round trips (the AUTH handshake, opening `sync:`) run with the
//! resource lock released, so `stage()` answers while a handshake waits on
//! the user to accept the key.

use crate::adb::auth::CredentialStore;
use crate::adb::connection::Connection;
use crate::adb::device::{AdbDevice, DeviceManager, DeviceSelector, TcpDeviceManager};
use crate::adb::transport::{AdbSession, AdbTransport};
use crate::adb::usb::UsbDeviceManager;
use crate::config::Config;
use crate::error::{BridgeError, Result};
use crate::services::shell::ShellService;
use crate::services::sync::{SyncHandle, SyncService};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// How far initialization has progressed
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionStage {
    Unstarted,
    ManagerReady,
    DeviceSelected,
    ConnectionOpen,
    CredentialsReady,
    TransportAuthenticated,
    SessionReady,
}

impl fmt::Display for SessionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unstarted => "unstarted",
            Self::ManagerReady => "manager ready",
            Self::DeviceSelected => "device selected",
            Self::ConnectionOpen => "connection open",
            Self::CredentialsReady => "credentials ready",
            Self::TransportAuthenticated => "transport authenticated",
            Self::SessionReady => "session ready",
        };
        f.write_str(name)
    }
}

/// Builds the platform device manager on first use
pub type ManagerFactory = Box<dyn Fn() -> Result<Arc<dyn DeviceManager>> + Send + Sync>;

#[derive(Default)]
struct Slots {
    manager: Option<Arc<dyn DeviceManager>>,
    device: Option<Arc<dyn AdbDevice>>,
    /// Consumed by the handshake
    connection: Option<Connection>,
    /// Connection handed to a handshake that has not finished yet
    authenticating: bool,
    credentials_ready: bool,
    transport: Option<Arc<AdbTransport>>,
    session: Option<AdbSession>,
    sync: Option<SyncService>,
    shell: Option<ShellService>,
}

impl Slots {
    fn stage(&self) -> SessionStage {
        let reached = [
            self.manager.is_some(),
            self.device.is_some(),
            self.connection.is_some() || self.authenticating || self.transport.is_some(),
            self.credentials_ready,
            self.transport.is_some(),
            self.session.is_some(),
        ];
        let stages = [
            SessionStage::ManagerReady,
            SessionStage::DeviceSelected,
            SessionStage::ConnectionOpen,
            SessionStage::CredentialsReady,
            SessionStage::TransportAuthenticated,
            SessionStage::SessionReady,
        ];

        let mut stage = SessionStage::Unstarted;
        for (done, next) in reached.iter().zip(stages) {
            if !done {
                break;
            }
            stage = next;
        }
        stage
    }
}

/// Owns every session resource for the lifetime of the process
pub struct SessionManager {
    factory: ManagerFactory,
    selector: DeviceSelector,
    credentials: Arc<CredentialStore>,
    auth_timeout: Duration,
    slots: Mutex<Slots>,
    /// Serializes handshakes; never held together with `slots` across a wait
    handshake: Mutex<()>,
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("selector", &self.selector)
            .field("credentials", &self.credentials)
            .field("auth_timeout", &self.auth_timeout)
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    pub fn new(
        factory: ManagerFactory,
        selector: DeviceSelector,
        credentials: Arc<CredentialStore>,
        auth_timeout: Duration,
    ) -> Self {
        Self {
            factory,
            selector,
            credentials,
            auth_timeout,
            slots: Mutex::new(Slots::default()),
            handshake: Mutex::new(()),
        }
    }

    /// USB discovery, or a fixed TCP device when `tcp_address` is set
    pub fn from_config(config: &Config) -> Self {
        let factory: ManagerFactory = match config.tcp_address.clone() {
            Some(address) => Box::new(move || {
                let manager: Arc<dyn DeviceManager> =
                    Arc::new(TcpDeviceManager::new(address.clone()));
                Ok(manager)
            }),
            None => Box::new(|| {
                let manager: Arc<dyn DeviceManager> = Arc::new(UsbDeviceManager::new());
                Ok(manager)
            }),
        };

        let credentials = match config.key_path() {
            Some(path) => CredentialStore::new(path, config.key_identity()),
            None => CredentialStore::ephemeral(config.key_identity()),
        };

        let selector = DeviceSelector {
            serial: config.serial.clone(),
        };

        Self::new(
            factory,
            selector,
            Arc::new(credentials),
            config.auth_timeout(),
        )
    }

    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    pub async fn stage(&self) -> SessionStage {
        self.slots.lock().await.stage()
    }

    pub async fn is_ready(&self) -> bool {
        self.stage().await == SessionStage::SessionReady
    }

    pub async fn acquire_manager(&self) -> Result<Arc<dyn DeviceManager>> {
        let mut slots = self.slots.lock().await;
        self.manager_in(&mut slots)
    }

    pub async fn acquire_device(&self) -> Result<Arc<dyn AdbDevice>> {
        let mut slots = self.slots.lock().await;
        self.device_in(&mut slots).await
    }

    pub async fn open_connection(&self) -> Result<()> {
        let mut slots = self.slots.lock().await;
        self.connection_in(&mut slots).await
    }

    pub async fn acquire_credentials(&self) -> Result<Arc<CredentialStore>> {
        let mut slots = self.slots.lock().await;
        self.credentials_in(&mut slots).await
    }

    pub async fn authenticate(&self) -> Result<Arc<AdbTransport>> {
        if let Some(transport) = &self.slots.lock().await.transport {
            return Ok(transport.clone());
        }

        let _handshake = self.handshake.lock().await;
        let (connection, credentials) = {
            let mut slots = self.slots.lock().await;
            if let Some(transport) = &slots.transport {
                return Ok(transport.clone());
            }
            // Reopens the connection if an earlier handshake consumed it
            self.connection_in(&mut slots).await?;
            let credentials = self.credentials_in(&mut slots).await?;
            let connection = slots.connection.take().ok_or_else(|| {
                BridgeError::NotReady("no open connection to authenticate".to_string())
            })?;
            slots.authenticating = true;
            (connection, credentials)
        };

        let result = AdbTransport::authenticate(connection, &credentials, self.auth_timeout).await;

        let mut slots = self.slots.lock().await;
        if !slots.authenticating {
            return Err(BridgeError::NotReady(
                "session reset during authentication".to_string(),
            ));
        }
        slots.authenticating = false;
        let transport = Arc::new(result?);
        slots.transport = Some(transport.clone());
        Ok(transport)
    }

    pub async fn session(&self) -> Result<AdbSession> {
        let transport = self.authenticate().await?;
        let mut slots = self.slots.lock().await;
        if let Some(session) = &slots.session {
            return Ok(session.clone());
        }
        Self::check_current(&slots, &transport)?;
        let session = AdbSession::new(transport);
        slots.session = Some(session.clone());
        Ok(session)
    }

    /// Session-scoped sync service (one sync handle per session)
    pub async fn sync(&self) -> Result<SyncService> {
        if let Some(sync) = &self.slots.lock().await.sync {
            return Ok(sync.clone());
        }
        let session = self.session().await?;
        let handle = SyncHandle::open(&session).await?;

        let mut slots = self.slots.lock().await;
        if let Some(sync) = &slots.sync {
            // Lost a race with another caller; ours is dropped unused
            return Ok(sync.clone());
        }
        Self::check_current(&slots, session.transport())?;
        let sync = SyncService::new(Arc::new(handle));
        slots.sync = Some(sync.clone());
        Ok(sync)
    }

    pub async fn shell(&self) -> Result<ShellService> {
        let session = self.session().await?;
        let mut slots = self.slots.lock().await;
        if let Some(shell) = &slots.shell {
            return Ok(shell.clone());
        }
        Self::check_current(&slots, session.transport())?;
        let shell = ShellService::new(session);
        slots.shell = Some(shell.clone());
        Ok(shell)
    }

    /// Run the whole chain. Failures are logged, not returned: the manager
    /// stays at whatever stage it reached. The key pair is generated either
    /// way so a later attempt can offer it to the device.
    pub async fn initialize(&self) -> SessionStage {
        if let Err(e) = self.sync().await {
            warn!("Session initialization stopped: {}", e);
        }
        if let Err(e) = self.credentials.generate_key().await {
            warn!("Key generation failed: {}", e);
        }

        let stage = self.stage().await;
        info!("Session manager at stage: {}", stage);
        stage
    }

    /// Drop everything from the device onwards, e.g. after a disconnect
    pub async fn reset(&self) {
        let mut slots = self.slots.lock().await;
        let manager = slots.manager.take();
        *slots = Slots {
            manager,
            ..Slots::default()
        };
        debug!("Session resources released");
    }

    fn manager_in(&self, slots: &mut Slots) -> Result<Arc<dyn DeviceManager>> {
        if let Some(manager) = &slots.manager {
            return Ok(manager.clone());
        }
        let manager = (self.factory)()?;
        slots.manager = Some(manager.clone());
        Ok(manager)
    }

    async fn device_in(&self, slots: &mut Slots) -> Result<Arc<dyn AdbDevice>> {
        if let Some(device) = &slots.device {
            return Ok(device.clone());
        }
        let manager = self.manager_in(slots)?;
        let device = manager.request_device(&self.selector).await?;
        info!("Selected device {}", device.description());
        slots.device = Some(device.clone());
        Ok(device)
    }

    async fn connection_in(&self, slots: &mut Slots) -> Result<()> {
        if slots.connection.is_some() || slots.transport.is_some() {
            return Ok(());
        }
        let device = self.device_in(slots).await?;
        let connection = device.connect().await?;
        debug!("Opened connection to {}", connection.serial());
        slots.connection = Some(connection);
        Ok(())
    }

    async fn credentials_in(&self, slots: &mut Slots) -> Result<Arc<CredentialStore>> {
        if !slots.credentials_ready {
            self.connection_in(slots).await?;
            self.credentials.generate_key().await?;
            slots.credentials_ready = true;
        }
        Ok(self.credentials.clone())
    }

    /// A `reset()` while the lock was released leaves `transport` stale
    fn check_current(slots: &Slots, transport: &Arc<AdbTransport>) -> Result<()> {
        match &slots.transport {
            Some(current) if Arc::ptr_eq(current, transport) => Ok(()),
            _ => Err(BridgeError::NotReady(
                "session reset while opening services".to_string(),
            )),
        }
    }
}
