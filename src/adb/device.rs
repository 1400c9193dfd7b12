//! Device discovery.
//!
//! A [`DeviceManager`] enumerates attached devices; a [`DeviceSelector`]
//! picks one of them the way an operator would.

use crate::adb::connection::Connection;
use crate::error::{BridgeError, Result};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// A physical (or networked) unit that can open a [`Connection`]
#[async_trait]
pub trait AdbDevice: Send + Sync + fmt::Debug {
    fn serial(&self) -> &str;

    /// Human readable name for listings
    fn description(&self) -> String {
        self.serial().to_string()
    }

    async fn connect(&self) -> Result<Connection>;
}

#[async_trait]
pub trait DeviceManager: Send + Sync {
    async fn devices(&self) -> Result<Vec<Arc<dyn AdbDevice>>>;

    async fn request_device(&self, selector: &DeviceSelector) -> Result<Arc<dyn AdbDevice>> {
        let devices = self.devices().await?;
        selector.select(devices)
    }
}

/// Chooses among attached devices
#[derive(Debug, Clone, Default)]
pub struct DeviceSelector {
    pub serial: Option<String>,
}

impl DeviceSelector {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn serial(serial: impl Into<String>) -> Self {
        Self {
            serial: Some(serial.into()),
        }
    }

    pub fn select(&self, mut devices: Vec<Arc<dyn AdbDevice>>) -> Result<Arc<dyn AdbDevice>> {
        if let Some(serial) = &self.serial {
            return devices
                .into_iter()
                .find(|d| d.serial() == serial)
                .ok_or_else(|| {
                    BridgeError::DeviceNotFound(format!("no device with serial {}", serial))
                });
        }

        match devices.len() {
            0 => Err(BridgeError::DeviceNotFound(
                "no ADB device attached".to_string(),
            )),
            1 => Ok(devices.remove(0)),
            _ => {
                let serials: Vec<&str> = devices.iter().map(|d| d.serial()).collect();
                Err(BridgeError::DeviceNotFound(format!(
                    "multiple devices attached ({}); pass --serial",
                    serials.join(", ")
                )))
            }
        }
    }
}

// =============================================================================
// TCP
// =============================================================================

/// adbd reachable over the network at a fixed address
#[derive(Debug, Clone)]
pub struct TcpDevice {
    address: String,
}

impl TcpDevice {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

#[async_trait]
impl AdbDevice for TcpDevice {
    fn serial(&self) -> &str {
        &self.address
    }

    fn description(&self) -> String {
        format!("{} (tcp)", self.address)
    }

    async fn connect(&self) -> Result<Connection> {
        Connection::connect_tcp(&self.address).await
    }
}

/// Manager exposing exactly one TCP device
pub struct TcpDeviceManager {
    device: Arc<TcpDevice>,
}

impl TcpDeviceManager {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            device: Arc::new(TcpDevice::new(address)),
        }
    }
}

#[async_trait]
impl DeviceManager for TcpDeviceManager {
    async fn devices(&self) -> Result<Vec<Arc<dyn AdbDevice>>> {
        let device: Arc<dyn AdbDevice> = self.device.clone();
        Ok(vec![device])
    }
}
