//! Datagram socket seam

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tracing::info;

use crate::error::{AirLinkError, Result};

/// Unreliable datagram transport
#[async_trait]
pub trait DatagramTransport: Send + Sync {
    async fn send_to(&self, data: &[u8], target: SocketAddr) -> Result<()>;

    /// Wait for the next datagram; oversized datagrams are truncated to `buf`
    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)>;
}

/// `tokio` UDP socket bound to the link port
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    /// Bind on all interfaces
    pub async fn bind(port: u16) -> Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", port))
            .await
            .map_err(|e| AirLinkError::Transport(format!("Failed to bind UDP port {}: {}", port, e)))?;
        info!("Link socket bound to {}", socket.local_addr()?);
        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

#[async_trait]
impl DatagramTransport for UdpTransport {
    async fn send_to(&self, data: &[u8], target: SocketAddr) -> Result<()> {
        self.socket
            .send_to(data, target)
            .await
            .map_err(|e| AirLinkError::Transport(format!("send to {} failed: {}", target, e)))?;
        Ok(())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        self.socket
            .recv_from(buf)
            .await
            .map_err(|e| AirLinkError::Transport(format!("receive failed: {}", e)))
    }
}

#[cfg(test)]
pub mod mocks {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc;

    /// In-memory transport: tests inject inbound datagrams and inspect sends
    pub struct MockTransport {
        pub sent: Arc<Mutex<Vec<(Vec<u8>, SocketAddr)>>>,
        inbound_tx: mpsc::UnboundedSender<(Vec<u8>, SocketAddr)>,
        inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<(Vec<u8>, SocketAddr)>>,
    }

    impl Default for MockTransport {
        fn default() -> Self {
            let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
            Self {
                sent: Arc::default(),
                inbound_tx,
                inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            }
        }
    }

    impl MockTransport {
        pub fn inject(&self, data: Vec<u8>, from: SocketAddr) {
            self.inbound_tx.send((data, from)).unwrap();
        }

        /// Take everything sent so far
        pub fn take_sent(&self) -> Vec<(Vec<u8>, SocketAddr)> {
            std::mem::take(&mut *self.sent.lock().unwrap())
        }
    }

    #[async_trait]
    impl DatagramTransport for MockTransport {
        async fn send_to(&self, data: &[u8], target: SocketAddr) -> Result<()> {
            self.sent.lock().unwrap().push((data.to_vec(), target));
            Ok(())
        }

        async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
            let mut rx = self.inbound_rx.lock().await;
            match rx.recv().await {
                Some((data, from)) => {
                    let len = data.len().min(buf.len());
                    buf[..len].copy_from_slice(&data[..len]);
                    Ok((len, from))
                }
                None => Err(AirLinkError::Transport("mock closed".to_string())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_udp_round_trip_on_loopback() {
        let a = UdpTransport::bind(0).await.unwrap();
        let b = UdpTransport::bind(0).await.unwrap();
        let b_addr: SocketAddr = format!("127.0.0.1:{}", b.local_addr().unwrap().port()).parse().unwrap();

        a.send_to(&[19, 0x40, 0x02], b_addr).await.unwrap();
        let mut buf = [0u8; 16];
        let (len, _) = b.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], &[19, 0x40, 0x02]);
    }

    #[tokio::test]
    async fn test_mock_truncates_to_buffer() {
        let transport = mocks::MockTransport::default();
        let from: SocketAddr = "10.0.0.2:6286".parse().unwrap();
        transport.inject(vec![1, 2, 3, 4], from);

        let mut buf = [0u8; 2];
        let (len, source) = transport.recv_from(&mut buf).await.unwrap();
        assert_eq!(len, 2);
        assert_eq!(source, from);
    }
}
