//! # Datagram Link
//!
//! Everything between the UDP socket and the rest of the air unit.
//!
//! This module handles:
//! - Packet kinds and big-endian packet framing ([`packet`])
//! - Numbered sends with acknowledgement-driven resend ([`sender`])
//! - Peer authentication, reordering and gap requests ([`receiver`])
//! - Video frame fragmentation ([`fragment`]) and the media senders ([`stream`])
//! - Ground command handling ([`dispatch`])
//! - Task wiring and lifecycle ([`session`])

pub mod dispatch;
pub mod fragment;
pub mod packet;
pub mod receiver;
pub mod sender;
pub mod session;
pub mod stream;
pub mod transport;

pub use packet::{Packet, PacketKind, MAX_PACKET_SIZE};
pub use session::{LinkSession, SessionOptions, TelemetrySources};
pub use transport::{DatagramTransport, UdpTransport};
