//! Trait abstraction over serial device discovery and I/O to enable testing

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio_serial::{SerialPortBuilderExt, SerialPortType};
use tracing::{debug, warn};

use crate::error::{AirLinkError, Result};

/// A candidate flight controller device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// OS path of the device (e.g. `/dev/ttyACM0`)
    pub path: String,
    /// USB manufacturer string, when the device is a USB port
    pub manufacturer: Option<String>,
}

/// Current access state of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Granted,
    /// Access not (yet) granted; a request may still be answered
    Pending,
}

/// Read half of an opened port
pub type PortReader = Box<dyn AsyncRead + Send + Unpin>;

/// Write half of an opened port
pub type PortWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Split an opened byte stream into boxed halves
pub fn split_port<S>(stream: S) -> (PortReader, PortWriter)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer): (ReadHalf<S>, WriteHalf<S>) = tokio::io::split(stream);
    (Box::new(reader), Box::new(writer))
}

/// Device discovery, permission and open operations
#[async_trait]
pub trait SerialBackend: Send + Sync {
    /// List the serial devices currently present
    async fn scan(&self) -> Result<Vec<DeviceInfo>>;

    fn permission(&self, device: &DeviceInfo) -> Permission;

    /// Ask for access; the outcome shows up in a later [`Self::permission`]
    fn request_permission(&self, device: &DeviceInfo);

    /// Open the device at `baud_rate`, 8N1, no flow control
    async fn open(&self, device: &DeviceInfo, baud_rate: u32) -> Result<(PortReader, PortWriter)>;
}

/// `tokio-serial` backend for Linux tty devices
#[derive(Debug, Default, Clone)]
pub struct TokioSerialBackend;

#[async_trait]
impl SerialBackend for TokioSerialBackend {
    async fn scan(&self) -> Result<Vec<DeviceInfo>> {
        let ports = tokio_serial::available_ports()
            .map_err(|e| AirLinkError::Serial(format!("Failed to list ports: {}", e)))?;

        Ok(ports
            .into_iter()
            .filter_map(|port| match port.port_type {
                SerialPortType::UsbPort(usb) => Some(DeviceInfo {
                    path: port.port_name,
                    manufacturer: usb.manufacturer,
                }),
                _ => None,
            })
            .collect())
    }

    fn permission(&self, device: &DeviceInfo) -> Permission {
        match std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&device.path)
        {
            Ok(_) => Permission::Granted,
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => Permission::Pending,
            Err(e) => {
                debug!("Access check for {} failed: {}", device.path, e);
                Permission::Granted
            }
        }
    }

    fn request_permission(&self, device: &DeviceInfo) {
        warn!(
            "No access to {}; add the user to the group owning the device",
            device.path
        );
    }

    async fn open(&self, device: &DeviceInfo, baud_rate: u32) -> Result<(PortReader, PortWriter)> {
        let port = tokio_serial::new(&device.path, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| match e.kind {
                tokio_serial::ErrorKind::Io(std::io::ErrorKind::PermissionDenied) => {
                    AirLinkError::PermissionDenied(device.path.clone())
                }
                _ => AirLinkError::Serial(format!("Failed to open {}: {}", device.path, e)),
            })?;

        Ok(split_port(port))
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_split_port_halves_share_stream() {
        let (ours, mut theirs) = tokio::io::duplex(64);
        let (mut reader, mut writer) = split_port(ours);

        writer.write_all(b"$X<").await.unwrap();
        let mut buf = [0u8; 3];
        theirs.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"$X<");

        theirs.write_all(b"$X>").await.unwrap();
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"$X>");
    }

    #[tokio::test]
    async fn test_open_missing_device_fails() {
        let backend = TokioSerialBackend;
        let device = DeviceInfo {
            path: "/dev/nonexistent_serial_device_12345".to_string(),
            manufacturer: None,
        };
        assert!(backend.open(&device, 115_200).await.is_err());
    }
}
