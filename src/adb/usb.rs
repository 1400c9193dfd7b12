//! USB transport via nusb.
//!
//! ADB devices expose a vendor-specific interface (class 0xff, subclass
//! 0x42, protocol 0x01) with one bulk IN and one bulk OUT endpoint. Each
//! message is sent as a header transfer followed by a payload transfer.

use crate::adb::connection::{Connection, MessageReader, MessageWriter};
use crate::adb::device::{AdbDevice, DeviceManager};
use crate::adb::protocol::{Header, Message, HEADER_SIZE};
use crate::error::{BridgeError, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use nusb::transfer::{Direction, EndpointType, RequestBuffer};
use nusb::{DeviceInfo, Interface};
use std::sync::Arc;
use tracing::{debug, trace};

pub const ADB_CLASS: u8 = 0xff;
pub const ADB_SUBCLASS: u8 = 0x42;
pub const ADB_PROTOCOL: u8 = 0x01;

fn is_adb_interface(class: u8, subclass: u8, protocol: u8) -> bool {
    class == ADB_CLASS && subclass == ADB_SUBCLASS && protocol == ADB_PROTOCOL
}

/// Enumerates USB devices with an ADB interface
#[derive(Debug, Default)]
pub struct UsbDeviceManager;

impl UsbDeviceManager {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl DeviceManager for UsbDeviceManager {
    async fn devices(&self) -> Result<Vec<Arc<dyn AdbDevice>>> {
        let list = nusb::list_devices().map_err(|e| {
            BridgeError::DeviceNotFound(format!("USB enumeration failed: {}", e))
        })?;

        let mut devices: Vec<Arc<dyn AdbDevice>> = Vec::new();
        for info in list {
            let interface = info
                .interfaces()
                .find(|i| is_adb_interface(i.class(), i.subclass(), i.protocol()))
                .map(|i| i.interface_number());

            if let Some(interface_number) = interface {
                let serial = info
                    .serial_number()
                    .map(str::to_string)
                    .unwrap_or_else(|| {
                        format!("usb:{:04x}:{:04x}", info.vendor_id(), info.product_id())
                    });
                debug!("Found ADB interface {} on {}", interface_number, serial);
                devices.push(Arc::new(UsbDevice {
                    info,
                    serial,
                    interface_number,
                }));
            }
        }
        Ok(devices)
    }
}

#[derive(Debug)]
pub struct UsbDevice {
    info: DeviceInfo,
    serial: String,
    interface_number: u8,
}

struct Endpoints {
    bulk_in: u8,
    bulk_out: u8,
    max_packet_size: usize,
}

impl UsbDevice {
    fn connection_error(&self, message: impl std::fmt::Display) -> BridgeError {
        BridgeError::Connection {
            serial: self.serial.clone(),
            message: message.to_string(),
        }
    }

    fn find_endpoints(&self, device: &nusb::Device) -> Result<Endpoints> {
        let config = device
            .active_configuration()
            .map_err(|e| self.connection_error(e))?;

        for alt in config.interface_alt_settings() {
            if alt.interface_number() != self.interface_number
                || !is_adb_interface(alt.class(), alt.subclass(), alt.protocol())
            {
                continue;
            }

            let mut bulk_in = None;
            let mut bulk_out = None;
            let mut max_packet_size = 512;
            for ep in alt.endpoints() {
                if ep.transfer_type() != EndpointType::Bulk {
                    continue;
                }
                match ep.direction() {
                    Direction::In => bulk_in = Some(ep.address()),
                    Direction::Out => {
                        bulk_out = Some(ep.address());
                        max_packet_size = ep.max_packet_size();
                    }
                }
            }

            if let (Some(bulk_in), Some(bulk_out)) = (bulk_in, bulk_out) {
                return Ok(Endpoints {
                    bulk_in,
                    bulk_out,
                    max_packet_size,
                });
            }
        }

        Err(self.connection_error("ADB interface has no bulk endpoint pair"))
    }
}

#[async_trait]
impl AdbDevice for UsbDevice {
    fn serial(&self) -> &str {
        &self.serial
    }

    fn description(&self) -> String {
        match self.info.product_string() {
            Some(product) => format!("{} ({})", self.serial, product),
            None => self.serial.clone(),
        }
    }

    async fn connect(&self) -> Result<Connection> {
        let device = self.info.open().map_err(|e| self.connection_error(e))?;
        let endpoints = self.find_endpoints(&device)?;
        let interface = device
            .claim_interface(self.interface_number)
            .map_err(|e| self.connection_error(format!("cannot claim interface: {}", e)))?;

        debug!(
            "Claimed interface {} on {} (in {:#04x}, out {:#04x})",
            self.interface_number, self.serial, endpoints.bulk_in, endpoints.bulk_out
        );

        let reader = UsbReader {
            interface: interface.clone(),
            endpoint: endpoints.bulk_in,
            serial: self.serial.clone(),
        };
        let writer = UsbWriter {
            interface,
            endpoint: endpoints.bulk_out,
            max_packet_size: endpoints.max_packet_size,
            serial: self.serial.clone(),
        };

        Ok(Connection::new(
            self.serial.clone(),
            Box::new(reader),
            Box::new(writer),
        ))
    }
}

struct UsbReader {
    interface: Interface,
    endpoint: u8,
    serial: String,
}

impl UsbReader {
    /// Read exactly `len` bytes, spanning transfers if the device splits them
    async fn read_exact(&self, len: usize) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(len);
        while buf.len() < len {
            let completion = self
                .interface
                .bulk_in(self.endpoint, RequestBuffer::new(len - buf.len()))
                .await;
            let data = completion.into_result().map_err(|e| BridgeError::Connection {
                serial: self.serial.clone(),
                message: format!("bulk in failed: {}", e),
            })?;
            buf.extend_from_slice(&data);
        }
        Ok(buf.freeze())
    }
}

#[async_trait]
impl MessageReader for UsbReader {
    async fn read_message(&mut self) -> Result<Message> {
        let raw = self.read_exact(HEADER_SIZE).await?;
        let mut header_bytes = [0u8; HEADER_SIZE];
        header_bytes.copy_from_slice(&raw[..HEADER_SIZE]);
        let header = Header::decode(&header_bytes)?;

        let payload = if header.data_length > 0 {
            self.read_exact(header.data_length as usize).await?
        } else {
            Bytes::new()
        };

        trace!("usb <- {:?} {} bytes", header.command, payload.len());
        Ok(Message {
            command: header.command,
            arg0: header.arg0,
            arg1: header.arg1,
            payload,
        })
    }
}

struct UsbWriter {
    interface: Interface,
    endpoint: u8,
    max_packet_size: usize,
    serial: String,
}

impl UsbWriter {
    async fn bulk_out(&self, data: Vec<u8>) -> Result<()> {
        self.interface
            .bulk_out(self.endpoint, data)
            .await
            .into_result()
            .map_err(|e| BridgeError::Connection {
                serial: self.serial.clone(),
                message: format!("bulk out failed: {}", e),
            })?;
        Ok(())
    }
}

#[async_trait]
impl MessageWriter for UsbWriter {
    async fn write_message(&mut self, message: &Message) -> Result<()> {
        trace!("usb -> {:?} {} bytes", message.command, message.payload.len());
        self.bulk_out(message.header().to_vec()).await?;

        if !message.payload.is_empty() {
            self.bulk_out(message.payload.to_vec()).await?;
            // A payload filling whole packets needs a zero-length packet to end the transfer
            if self.max_packet_size > 0 && message.payload.len() % self.max_packet_size == 0 {
                self.bulk_out(Vec::new()).await?;
            }
        }
        Ok(())
    }
}
