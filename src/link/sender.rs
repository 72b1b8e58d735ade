//! Outbound side of the datagram link
//!
//! Numbered packets get the next sequence number and are kept until the
//! peer acknowledges them or their lifetime runs out; acknowledged kinds are
//! resent whenever an acknowledgement is overdue.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, trace};

use super::packet::{PacketBuilder, PacketKind, PingBody, CONNECT_PACKET_NUMBER};

/// Period of [`DatagramSender::process_timer`]
pub const SENDER_TIMER_PERIOD: Duration = Duration::from_millis(10);

/// Outbound datagrams waiting for the socket writer
pub const OUTBOUND_QUEUE_CAPACITY: usize = 1024;

const DEFAULT_PING_MS: u32 = 100;
const MAX_PING_MS: i64 = 1000;

/// One datagram for the socket writer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub data: Bytes,
    pub target: SocketAddr,
}

#[derive(Debug)]
struct SavedPacket {
    kind: PacketKind,
    data: Bytes,
    created: Instant,
    last_sent: Instant,
}

#[derive(Debug)]
struct SenderState {
    peer: Option<SocketAddr>,
    active: bool,
    next_number: i16,
    saved: HashMap<i16, SavedPacket>,
    ping_ms: u32,
}

/// Numbering, retention and resend of outbound packets
#[derive(Debug)]
pub struct DatagramSender {
    state: Mutex<SenderState>,
    outbound: mpsc::Sender<Datagram>,
    epoch: Instant,
}

impl DatagramSender {
    /// Create a sender and the queue its datagrams are written from
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Datagram>) {
        let (outbound, rx) = mpsc::channel(capacity);
        let sender = Self {
            state: Mutex::new(SenderState {
                peer: None,
                active: false,
                next_number: -1,
                saved: HashMap::new(),
                ping_ms: DEFAULT_PING_MS,
            }),
            outbound,
            epoch: Instant::now(),
        };
        (sender, rx)
    }

    fn lock(&self) -> MutexGuard<'_, SenderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Milliseconds on the clock used for ping timestamps
    pub fn clock_ms(&self) -> i64 {
        i64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(i64::MAX)
    }

    /// Target `peer` and restart numbering
    pub fn connect(&self, peer: SocketAddr) {
        let mut state = self.lock();
        state.peer = Some(peer);
        state.next_number = -1;
        state.saved.clear();
        state.active = true;
        info!("Link sender targeting {}", peer);
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.lock().peer
    }

    pub fn is_active(&self) -> bool {
        self.lock().active
    }

    /// Update the round-trip estimate; values outside 0..=1000 ms are ignored
    pub fn set_ping(&self, ping_ms: i64) {
        if (0..=MAX_PING_MS).contains(&ping_ms) {
            self.lock().ping_ms = ping_ms as u32;
        }
    }

    pub fn ping(&self) -> Duration {
        Duration::from_millis(u64::from(self.lock().ping_ms))
    }

    /// Number (if needed), retain and queue one packet
    ///
    /// Returns `false` when the sender is inactive or the packet was dropped.
    pub fn send_packet(&self, mut data: Vec<u8>) -> bool {
        let Some(kind) = data.first().copied().and_then(PacketKind::from_u8) else {
            return false;
        };

        let mut state = self.lock();
        let Some(peer) = state.peer.filter(|_| state.active) else {
            return false;
        };

        if kind.is_numbered() {
            if data.len() < 3 {
                return false;
            }
            let number = if kind == PacketKind::Connect {
                CONNECT_PACKET_NUMBER
            } else {
                state.next_number = next_number(state.next_number);
                state.next_number
            };
            data[1..3].copy_from_slice(&number.to_be_bytes());
            let data = Bytes::from(data);
            let now = Instant::now();
            state.saved.insert(
                number,
                SavedPacket {
                    kind,
                    data: data.clone(),
                    created: now,
                    last_sent: now,
                },
            );
            drop(state);
            return self.enqueue(data, peer);
        }

        drop(state);
        self.enqueue(Bytes::from(data), peer)
    }

    fn enqueue(&self, data: Bytes, target: SocketAddr) -> bool {
        match self.outbound.try_send(Datagram { data, target }) {
            Ok(()) => true,
            Err(e) => {
                trace!("Outbound datagram dropped: {}", e);
                false
            }
        }
    }

    /// Send a retained packet again
    pub fn resend(&self, number: i16) {
        let state = self.lock();
        if !state.active {
            return;
        }
        let (Some(peer), Some(packet)) = (state.peer, state.saved.get(&number)) else {
            return;
        };
        let data = packet.data.clone();
        drop(state);
        self.enqueue(data, peer);
    }

    /// Forget an acknowledged packet
    pub fn remove(&self, number: i16) {
        self.lock().saved.remove(&number);
    }

    pub fn request_packets(&self, numbers: &[i16]) {
        if numbers.is_empty() {
            return;
        }
        let mut packet = PacketBuilder::new(PacketKind::RequestPackets);
        for number in numbers {
            packet.write_i16(*number);
        }
        debug!("Requesting missing packets {:?}", numbers);
        self.send_packet(packet.finish());
    }

    /// Announce ourselves with the shared key
    pub fn send_connect(&self, client_type: u8, key: &str, version_code: i16) {
        let mut packet = PacketBuilder::with_number(PacketKind::Connect, CONNECT_PACKET_NUMBER);
        packet.write_u8(client_type);
        if let Err(e) = packet.write_utf(key) {
            debug!("Connect not sent: {}", e);
            return;
        }
        packet.write_i16(version_code);
        self.send_packet(packet.finish());
    }

    pub fn send_ping(&self, to_end_point: bool) {
        let mut packet = PacketBuilder::new(PacketKind::Ping);
        PingBody {
            to_end_point,
            time: self.clock_ms(),
            target: None,
        }
        .write(&mut packet);
        self.send_packet(packet.finish());
    }

    /// Echo a ping back with its timestamp and target
    pub fn send_pong(&self, ping: &PingBody) {
        let mut packet = PacketBuilder::new(PacketKind::Pong);
        ping.write(&mut packet);
        self.send_packet(packet.finish());
    }

    pub fn send_packet_received(&self, number: i16) {
        let mut packet = PacketBuilder::new(PacketKind::PacketReceived);
        packet.write_i16(number);
        self.send_packet(packet.finish());
    }

    /// Expire old packets and resend overdue ones
    pub fn process_timer(&self) {
        let now = Instant::now();
        let mut state = self.lock();
        let Some(peer) = state.peer.filter(|_| state.active) else {
            return;
        };
        let resend_after = Duration::from_millis(u64::from(state.ping_ms) * 6 / 5 + 5);

        let mut resend = Vec::new();
        state.saved.retain(|_, packet| {
            if packet.kind.is_acknowledged() && now >= packet.last_sent + resend_after {
                packet.last_sent = now;
                resend.push(packet.data.clone());
            }
            now < packet.created + packet.kind.lifetime()
        });
        drop(state);

        for data in resend {
            self.enqueue(data, peer);
        }
    }

    /// Stop sending and drop retained packets
    pub fn close(&self) {
        let mut state = self.lock();
        state.active = false;
        state.saved.clear();
    }
}

/// 0..=32767, wrapping back to 0
fn next_number(current: i16) -> i16 {
    if current == i16::MAX {
        0
    } else {
        current + 1
    }
}
