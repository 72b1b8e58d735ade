//! Receive-side reorder buffer
//!
//! Authenticates the peer through its `Connect` key, releases numbered
//! packets in sequence order, asks for gaps to be resent and answers the
//! link-level control packets (ping, acknowledgements, resend requests)
//! before anything reaches the command dispatcher.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use super::packet::{
    ConnectBody, Packet, PacketKind, PingBody, CLIENT_TYPE_CONTROL, CLIENT_TYPE_FLIGHT,
    CLIENT_TYPE_VIEWER, CONNECT_PACKET_NUMBER,
};
use super::sender::DatagramSender;

/// Period of [`ReceiverBuffer::process_timer`]
pub const RECEIVER_TIMER_PERIOD: Duration = Duration::from_millis(1);

/// Silence after which the peer counts as gone
pub const DISCONNECT_AFTER: Duration = Duration::from_secs(4);

const PING_INTERVAL: Duration = Duration::from_millis(500);
const WINDOW: i32 = 1000;
const INITIAL_BUFFER_SIZE: usize = 30;
const INITIAL_PING_MS: i64 = 100;
const MAX_REQUEST_BATCH: i32 = 10;
const AVERAGE_SAMPLES: usize = 10;

#[derive(Debug)]
struct ReceiverState {
    closed: bool,
    connected: bool,
    last_packet: Option<Instant>,
    next_number: i16,
    numbered: BTreeMap<i16, Packet>,
    unnumbered: VecDeque<Packet>,
    rejected: Vec<(PacketKind, i16)>,
    last_requested: HashMap<i16, Instant>,
    /// Buffered packets tolerated before skipping a gap
    buffer_size: usize,
    packet_count: usize,
    recover_counter: usize,
    size_samples: VecDeque<usize>,
    last_size_sample: Instant,
    ping_ms: i64,
    ping_samples: VecDeque<i64>,
    last_ping: Instant,
}

impl ReceiverState {
    fn new(now: Instant) -> Self {
        Self {
            closed: false,
            connected: false,
            last_packet: None,
            next_number: 0,
            numbered: BTreeMap::new(),
            unnumbered: VecDeque::new(),
            rejected: Vec::new(),
            last_requested: HashMap::new(),
            buffer_size: INITIAL_BUFFER_SIZE,
            packet_count: 0,
            recover_counter: 0,
            size_samples: VecDeque::new(),
            last_size_sample: now,
            ping_ms: INITIAL_PING_MS,
            ping_samples: VecDeque::new(),
            last_ping: now,
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        !self.closed
            && self.connected
            && self.last_packet.is_some_and(|at| now < at + DISCONNECT_AFTER)
    }

    /// Forget all buffered packets; the next number is taken from the peer
    fn restart(&mut self) {
        self.next_number = CONNECT_PACKET_NUMBER;
        self.recover_counter = 0;
        self.numbered.clear();
        self.unnumbered.clear();
        self.rejected.clear();
        self.last_requested.clear();
    }

    /// Average the new round trip in; `None` when it is an outlier
    fn record_rtt(&mut self, rtt: i64) -> Option<i64> {
        if (rtt - self.ping_ms).abs() > 1000 {
            return None;
        }
        self.ping_samples.push_back(rtt);
        let average = self.ping_samples.iter().sum::<i64>() / self.ping_samples.len() as i64;
        self.ping_ms = average;
        if self.ping_samples.len() >= AVERAGE_SAMPLES {
            self.ping_samples.pop_front();
        }
        Some(average)
    }

    fn sample_buffer_size(&mut self) {
        // round(count * 1.5) + 1
        let size = (self.packet_count * 3 + 1) / 2 + 1;
        self.packet_count = 0;
        self.size_samples.push_back(size);
        if self.size_samples.len() >= AVERAGE_SAMPLES {
            self.buffer_size = self.size_samples.iter().sum::<usize>() / self.size_samples.len();
            self.size_samples.pop_front();
        }
    }
}

/// Accept window in sequence space, tolerating the wrap at 32767
fn in_window(number: i16, next: i16) -> bool {
    let (number, next) = (i32::from(number), i32::from(next));
    (number >= next && number < next + WINDOW) || number < next - i32::from(i16::MAX) + WINDOW
}

fn following(number: i16) -> i16 {
    if number == i16::MAX {
        0
    } else {
        number + 1
    }
}

/// Reorder, dedup and authentication buffer for one peer
#[derive(Debug)]
pub struct ReceiverBuffer {
    sender: Arc<DatagramSender>,
    /// Direct topology: the ground reaches us without a relay
    is_server: bool,
    control_key: String,
    viewer_key: Option<String>,
    state: Mutex<ReceiverState>,
}

impl ReceiverBuffer {
    pub fn new(
        sender: Arc<DatagramSender>,
        is_server: bool,
        control_key: impl Into<String>,
        viewer_key: Option<String>,
    ) -> Self {
        Self {
            sender,
            is_server,
            control_key: control_key.into(),
            viewer_key,
            state: Mutex::new(ReceiverState::new(Instant::now())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ReceiverState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn key_accepted(&self, connect: &ConnectBody) -> bool {
        match connect.client_type {
            CLIENT_TYPE_FLIGHT | CLIENT_TYPE_CONTROL => connect.key == self.control_key,
            CLIENT_TYPE_VIEWER => self.viewer_key.as_deref() == Some(connect.key.as_str()),
            _ => false,
        }
    }

    /// Take one raw datagram from the socket
    pub fn add_packet(&self, data: &[u8], source: SocketAddr) {
        let packet = match Packet::parse(data, source) {
            Ok(packet) => packet,
            Err(e) => {
                trace!("Datagram from {} dropped: {}", source, e);
                return;
            }
        };
        let now = packet.received_at;
        let mut state = self.lock();
        if state.closed {
            return;
        }

        let Some(number) = packet.number else {
            if state.connected {
                state.last_packet = Some(now);
                state.unnumbered.push_back(packet);
            }
            return;
        };
        if number < CONNECT_PACKET_NUMBER {
            return;
        }

        if packet.kind == PacketKind::Connect {
            if state.is_live(now) {
                return;
            }
            match ConnectBody::read(&mut packet.body()) {
                Ok(connect) if self.key_accepted(&connect) => {
                    state.restart();
                    state.last_ping = now;
                    self.sender.connect(source);
                    state.connected = true;
                    info!(
                        "Peer {} authenticated (client type {}, version {:?})",
                        source, connect.client_type, connect.version_code
                    );
                }
                Ok(_) => {
                    debug!("Connect from {} rejected: key mismatch", source);
                    return;
                }
                Err(e) => {
                    debug!("Malformed connect from {}: {}", source, e);
                    return;
                }
            }
        }

        if !state.connected {
            return;
        }
        state.last_packet = Some(now);

        if in_window(number, state.next_number) {
            state.numbered.insert(number, packet);
            state.packet_count += 1;
            state.recover_counter = 0;
        } else {
            state.rejected.push((packet.kind, number));
            state.recover_counter += 1;
            if state.recover_counter > state.buffer_size * 2 {
                warn!("Receive window lost sync, restarting at packet {}", number);
                state.restart();
                state.numbered.insert(number, packet);
                state.next_number = number;
            }
        }
    }

    /// Next packet for the dispatcher, in sequence order
    ///
    /// Link control packets are consumed here. When the next number is
    /// missing, the gap is requested from the peer and `None` is returned.
    pub fn next_packet(&self) -> Option<Packet> {
        let mut state = self.lock();
        if state.closed {
            return None;
        }
        loop {
            if let Some(packet) = state.unnumbered.pop_front() {
                if self.check_packet(&mut state, &packet) {
                    return Some(packet);
                }
                continue;
            }

            let next = state.next_number;
            if let Some(packet) = state.numbered.remove(&next) {
                state.next_number = following(next);
                if self.check_packet(&mut state, &packet) {
                    return Some(packet);
                }
                continue;
            }

            if state.numbered.is_empty() {
                return None;
            }
            if state.numbered.len() >= state.buffer_size {
                if let Some(&lowest) = state.numbered.keys().next() {
                    debug!("Skipping lost packets {}..{}", next, lowest);
                    state.next_number = lowest;
                    continue;
                }
            }

            let expiry = Instant::now() + Duration::from_millis(state.ping_ms.unsigned_abs() + 20);
            let mut missing = Vec::new();
            for offset in 0..MAX_REQUEST_BATCH {
                let mut number = i32::from(next) + offset;
                if number > i32::from(i16::MAX) {
                    number -= 32768;
                }
                let number = number as i16;
                if state.numbered.contains_key(&number) {
                    break;
                }
                if state.last_requested.contains_key(&number) {
                    continue;
                }
                missing.push(number);
                state.last_requested.insert(number, expiry);
            }
            self.sender.request_packets(&missing);
            return None;
        }
    }

    /// Handle link control; `true` when the packet goes on to the dispatcher
    fn check_packet(&self, state: &mut ReceiverState, packet: &Packet) -> bool {
        if let Some(number) = packet.number {
            if packet.kind.is_acknowledged() {
                self.sender.send_packet_received(number);
            }
        }

        let mut body = packet.body();
        match packet.kind {
            PacketKind::Ping | PacketKind::Pong => {
                let ping = match PingBody::read(&mut body) {
                    Ok(ping) => ping,
                    Err(e) => {
                        debug!("Malformed {:?}: {}", packet.kind, e);
                        return false;
                    }
                };
                if ping.to_end_point && self.is_server {
                    return true;
                }
                if packet.kind == PacketKind::Ping {
                    self.sender.send_pong(&ping);
                    false
                } else if ping.to_end_point {
                    true
                } else {
                    if let Some(average) = state.record_rtt(self.sender.clock_ms() - ping.time) {
                        self.sender.set_ping(average);
                    }
                    false
                }
            }
            PacketKind::PacketReceived => {
                if let Ok(number) = body.read_i16() {
                    self.sender.remove(number);
                }
                false
            }
            PacketKind::RequestPackets => {
                while let Ok(number) = body.read_i16() {
                    self.sender.resend(number);
                }
                false
            }
            PacketKind::Connect => {
                if self.is_server {
                    self.sender.send_packet(packet.data.to_vec());
                }
                false
            }
            _ => true,
        }
    }

    /// Periodic maintenance, every [`RECEIVER_TIMER_PERIOD`]
    pub fn process_timer(&self) {
        let now = Instant::now();
        let mut state = self.lock();
        if state.closed {
            return;
        }

        state.last_requested.retain(|_, expiry| now < *expiry);
        let max_latency = Duration::from_millis(state.ping_ms.unsigned_abs() * 4);
        state
            .numbered
            .retain(|_, packet| now < packet.received_at + packet.kind.lifetime() + max_latency);

        if state.is_live(now) && now >= state.last_ping + PING_INTERVAL {
            state.last_ping = now;
            self.sender.send_ping(false);
        }

        if now >= state.last_size_sample + Duration::from_millis(state.ping_ms.unsigned_abs()) {
            state.last_size_sample = now;
            state.sample_buffer_size();
        }

        for (kind, number) in std::mem::take(&mut state.rejected) {
            if kind.is_acknowledged() {
                self.sender.send_packet_received(number);
            }
        }
    }

    /// Authenticated and heard from within [`DISCONNECT_AFTER`]
    pub fn is_connected(&self) -> bool {
        self.lock().is_live(Instant::now())
    }

    /// Averaged round trip in milliseconds
    pub fn ping_ms(&self) -> i64 {
        self.lock().ping_ms
    }

    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.connected = false;
        state.last_packet = None;
        state.restart();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::packet::PacketBuilder;
    use crate::link::sender::Datagram;
    use tokio::sync::mpsc;

    fn ground() -> SocketAddr {
        "192.168.4.2:40000".parse().unwrap()
    }

    fn setup(is_server: bool) -> (ReceiverBuffer, Arc<DatagramSender>, mpsc::Receiver<Datagram>) {
        let (sender, rx) = DatagramSender::channel(256);
        let sender = Arc::new(sender);
        let buffer = ReceiverBuffer::new(sender.clone(), is_server, "DD", Some("VIEW".to_string()));
        (buffer, sender, rx)
    }

    fn connect_packet(client_type: u8, key: &str) -> Vec<u8> {
        let mut packet = PacketBuilder::with_number(PacketKind::Connect, CONNECT_PACKET_NUMBER);
        packet.write_u8(client_type);
        packet.write_utf(key).unwrap();
        packet.write_i16(1);
        packet.finish()
    }

    fn numbered(kind: PacketKind, number: i16) -> Vec<u8> {
        PacketBuilder::with_number(kind, number).finish()
    }

    fn sent(rx: &mut mpsc::Receiver<Datagram>) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        while let Ok(datagram) = rx.try_recv() {
            out.push(datagram.data.to_vec());
        }
        out
    }

    fn connected(is_server: bool) -> (ReceiverBuffer, Arc<DatagramSender>, mpsc::Receiver<Datagram>) {
        let (buffer, sender, mut rx) = setup(is_server);
        buffer.add_packet(&connect_packet(CLIENT_TYPE_CONTROL, "DD"), ground());
        assert!(buffer.next_packet().is_none());
        sent(&mut rx);
        (buffer, sender, rx)
    }

    #[test]
    fn test_window_wraps() {
        assert!(in_window(0, 0));
        assert!(in_window(999, 0));
        assert!(!in_window(1000, 0));
        assert!(!in_window(-1, 0));
        assert!(in_window(-1, -1));
        assert!(in_window(5, 32_000));
        assert!(!in_window(31_000, 32_000));
    }

    #[tokio::test]
    async fn test_connect_with_key_learns_peer() {
        let (buffer, sender, mut rx) = setup(false);
        assert!(!buffer.is_connected());

        buffer.add_packet(&connect_packet(CLIENT_TYPE_CONTROL, "DD"), ground());
        assert!(buffer.is_connected());
        assert_eq!(sender.peer(), Some(ground()));

        // the connect itself is acknowledged, not delivered
        assert!(buffer.next_packet().is_none());
        assert_eq!(sent(&mut rx), vec![vec![7, 0xFF, 0xFF]]);
    }

    #[tokio::test]
    async fn test_wrong_key_never_connects() {
        let (buffer, sender, _rx) = setup(false);
        buffer.add_packet(&connect_packet(CLIENT_TYPE_CONTROL, "XX"), ground());
        buffer.add_packet(&connect_packet(CLIENT_TYPE_VIEWER, "DD"), ground());
        buffer.add_packet(&connect_packet(7, "DD"), ground());
        buffer.add_packet(&numbered(PacketKind::StartVideo, 0), ground());

        assert!(!buffer.is_connected());
        assert!(sender.peer().is_none());
        assert!(buffer.next_packet().is_none());
    }

    #[tokio::test]
    async fn test_viewer_key() {
        let (buffer, _sender, _rx) = setup(false);
        buffer.add_packet(&connect_packet(CLIENT_TYPE_VIEWER, "VIEW"), ground());
        assert!(buffer.is_connected());
    }

    #[tokio::test]
    async fn test_in_order_delivery_and_gap_request() {
        let (buffer, _sender, mut rx) = connected(false);

        buffer.add_packet(&numbered(PacketKind::FcInfo, 1), ground());
        assert!(buffer.next_packet().is_none());
        assert_eq!(sent(&mut rx), vec![vec![6, 0, 0]]);

        // already requested within the ping interval
        assert!(buffer.next_packet().is_none());
        assert!(sent(&mut rx).is_empty());

        buffer.add_packet(&numbered(PacketKind::StartVideo, 0), ground());
        assert_eq!(buffer.next_packet().unwrap().kind, PacketKind::StartVideo);
        assert_eq!(buffer.next_packet().unwrap().kind, PacketKind::FcInfo);
        assert!(buffer.next_packet().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_dropped_and_acknowledged() {
        let (buffer, _sender, mut rx) = connected(false);

        buffer.add_packet(&numbered(PacketKind::BoxIds, 0), ground());
        assert_eq!(buffer.next_packet().unwrap().number, Some(0));
        assert_eq!(sent(&mut rx), vec![vec![7, 0, 0]]);

        buffer.add_packet(&numbered(PacketKind::BoxIds, 0), ground());
        assert!(buffer.next_packet().is_none());
        buffer.process_timer();
        assert_eq!(sent(&mut rx), vec![vec![7, 0, 0]]);
    }

    #[tokio::test]
    async fn test_unnumbered_delivered_first() {
        let (buffer, _sender, _rx) = connected(false);
        buffer.add_packet(&numbered(PacketKind::OsdConfig, 0), ground());
        buffer.add_packet(&[PacketKind::RcFrame.as_u8(), 0], ground());

        assert_eq!(buffer.next_packet().unwrap().kind, PacketKind::RcFrame);
        assert_eq!(buffer.next_packet().unwrap().kind, PacketKind::OsdConfig);
    }

    #[tokio::test]
    async fn test_unnumbered_ignored_before_connect() {
        let (buffer, _sender, _rx) = setup(false);
        buffer.add_packet(&[PacketKind::RcFrame.as_u8(), 0], ground());
        assert!(buffer.next_packet().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pong_updates_ping() {
        let (buffer, sender, _rx) = connected(false);
        let sent_at = sender.clock_ms();
        tokio::time::advance(Duration::from_millis(40)).await;

        let mut pong = PacketBuilder::new(PacketKind::Pong);
        PingBody { to_end_point: false, time: sent_at, target: None }.write(&mut pong);
        buffer.add_packet(&pong.finish(), ground());

        assert!(buffer.next_packet().is_none());
        assert_eq!(buffer.ping_ms(), 40);
        assert_eq!(sender.ping(), Duration::from_millis(40));
    }

    #[tokio::test]
    async fn test_ping_answered_with_pong() {
        let (buffer, _sender, mut rx) = connected(false);
        let mut ping = PacketBuilder::new(PacketKind::Ping);
        PingBody { to_end_point: false, time: 99, target: Some(1) }.write(&mut ping);
        buffer.add_packet(&ping.finish(), ground());

        assert!(buffer.next_packet().is_none());
        assert_eq!(sent(&mut rx), vec![vec![11, 0, 0, 0, 0, 0, 0, 0, 0, 99, 1]]);
    }

    #[tokio::test]
    async fn test_end_point_ping_delivered_in_direct_mode() {
        let (buffer, _sender, _rx) = connected(true);
        let mut ping = PacketBuilder::new(PacketKind::Ping);
        PingBody { to_end_point: true, time: 5, target: None }.write(&mut ping);
        buffer.add_packet(&ping.finish(), ground());

        assert_eq!(buffer.next_packet().unwrap().kind, PacketKind::Ping);
    }

    #[tokio::test]
    async fn test_direct_mode_echoes_connect() {
        let (buffer, _sender, mut rx) = setup(true);
        let connect = connect_packet(CLIENT_TYPE_CONTROL, "DD");
        buffer.add_packet(&connect, ground());
        assert!(buffer.next_packet().is_none());

        let out = sent(&mut rx);
        assert!(out.contains(&connect));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnects_after_silence() {
        let (buffer, _sender, _rx) = connected(false);
        tokio::time::advance(Duration::from_millis(3900)).await;
        assert!(buffer.is_connected());
        tokio::time::advance(Duration::from_millis(200)).await;
        assert!(!buffer.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_sent_every_500ms() {
        let (buffer, _sender, mut rx) = connected(false);
        buffer.add_packet(&[PacketKind::RcFrame.as_u8(), 0], ground());
        buffer.next_packet();

        tokio::time::advance(Duration::from_millis(400)).await;
        buffer.process_timer();
        assert!(sent(&mut rx).iter().all(|p| p[0] != PacketKind::Ping.as_u8()));

        tokio::time::advance(Duration::from_millis(100)).await;
        buffer.process_timer();
        assert!(sent(&mut rx).iter().any(|p| p[0] == PacketKind::Ping.as_u8()));
    }

    #[tokio::test]
    async fn test_resync_after_sustained_rejects() {
        let (buffer, _sender, _rx) = connected(false);
        for _ in 0..=(INITIAL_BUFFER_SIZE * 2) {
            buffer.add_packet(&numbered(PacketKind::StartVideo, 5000), ground());
        }
        assert_eq!(buffer.next_packet().unwrap().number, Some(5000));
    }

    #[tokio::test]
    async fn test_full_buffer_skips_gap() {
        let (buffer, _sender, _rx) = connected(false);
        for number in 1..=(INITIAL_BUFFER_SIZE as i16) {
            buffer.add_packet(&numbered(PacketKind::ChangeBitRate, number), ground());
        }
        assert_eq!(buffer.next_packet().unwrap().number, Some(1));
    }

    #[tokio::test]
    async fn test_close_discards_everything() {
        let (buffer, _sender, _rx) = connected(false);
        buffer.add_packet(&numbered(PacketKind::StartVideo, 0), ground());
        buffer.close();
        assert!(!buffer.is_connected());
        assert!(buffer.next_packet().is_none());
    }
}
