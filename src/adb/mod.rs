//! ADB client side: framing, connections, discovery, authentication and
//! the multiplexed transport.

pub mod auth;
pub mod connection;
pub mod device;
pub mod protocol;
pub mod transport;
pub mod usb;

pub use auth::CredentialStore;
pub use connection::Connection;
pub use device::{AdbDevice, DeviceManager, DeviceSelector, TcpDevice, TcpDeviceManager};
pub use protocol::{Command, Message};
pub use transport::{AdbSession, AdbStream, AdbTransport, DeviceBanner};
pub use usb::UsbDeviceManager;
