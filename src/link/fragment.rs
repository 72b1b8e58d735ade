//! Splitting encoded video frames into datagrams
//!
//! ```text
//! kind u8 | frame i16 | offset i32 | [size i32, first fragment only] | data
//! ```
//!
//! Fragments are neither numbered nor acknowledged; losing one loses the
//! frame on the ground side.

use tracing::warn;

use super::packet::{PacketBuilder, PacketKind, MAX_PACKET_SIZE};

/// Header budget of a continuation fragment
pub const FRAGMENT_HEADER_LEN: usize = 9;

/// Header budget of the first fragment, which also carries the frame size
pub const FIRST_FRAGMENT_HEADER_LEN: usize = 13;

/// Per-stream fragmenter holding the shared frame counter
#[derive(Debug, Default, Clone)]
pub struct FrameFragmenter {
    frame_number: i16,
}

impl FrameFragmenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number given to the most recent frame, 0 before the first
    pub fn frame_number(&self) -> i16 {
        self.frame_number
    }

    /// Restart numbering for a new stream
    pub fn reset(&mut self) {
        self.frame_number = 0;
    }

    /// Split one logical frame into `KeyFrame` or `VideoFrame` fragments
    ///
    /// The counter advances once per call (1..=32767, wrapping to 1), even
    /// for an empty frame, which yields no fragments.
    pub fn fragment(&mut self, kind: PacketKind, frame: &[u8]) -> Vec<Vec<u8>> {
        self.frame_number = if self.frame_number == i16::MAX {
            1
        } else {
            self.frame_number + 1
        };

        let Ok(size) = i32::try_from(frame.len()) else {
            warn!("Frame of {} bytes is too large to fragment", frame.len());
            return Vec::new();
        };

        let mut fragments = Vec::new();
        let mut offset = 0usize;
        while offset < frame.len() {
            let mut packet = PacketBuilder::new(kind);
            packet.write_i16(self.frame_number).write_i32(offset as i32);
            let capacity = if offset == 0 {
                packet.write_i32(size);
                MAX_PACKET_SIZE - FIRST_FRAGMENT_HEADER_LEN
            } else {
                MAX_PACKET_SIZE - FRAGMENT_HEADER_LEN
            };
            let end = frame.len().min(offset + capacity);
            packet.write_bytes(&frame[offset..end]);
            fragments.push(packet.finish());
            offset = end;
        }
        fragments
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ByteReader;

    const FIRST_CAPACITY: usize = MAX_PACKET_SIZE - FIRST_FRAGMENT_HEADER_LEN;

    /// Rebuild a frame the way the ground station does
    fn reassemble(fragments: &[Vec<u8>]) -> (i16, Vec<u8>) {
        let mut frame = Vec::new();
        let mut number = 0;
        for (i, fragment) in fragments.iter().enumerate() {
            let mut reader = ByteReader::big_endian(fragment);
            reader.read_u8().unwrap();
            number = reader.read_i16().unwrap();
            let offset = reader.read_i32().unwrap() as usize;
            if i == 0 {
                assert_eq!(offset, 0);
                frame.resize(reader.read_i32().unwrap() as usize, 0);
            }
            let data = reader.read_remaining();
            frame[offset..offset + data.len()].copy_from_slice(data);
        }
        (number, frame)
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_empty_frame_advances_counter() {
        let mut fragmenter = FrameFragmenter::new();
        assert!(fragmenter.fragment(PacketKind::VideoFrame, &[]).is_empty());
        assert_eq!(fragmenter.frame_number(), 1);
    }

    #[test]
    fn test_single_byte_frame() {
        let mut fragmenter = FrameFragmenter::new();
        let fragments = fragmenter.fragment(PacketKind::KeyFrame, &[0xAB]);
        assert_eq!(fragments, vec![vec![2, 0, 1, 0, 0, 0, 0, 0, 0, 0, 1, 0xAB]]);
    }

    #[test]
    fn test_frame_boundaries() {
        for len in [FIRST_CAPACITY, FIRST_CAPACITY + 1, 10 * MAX_PACKET_SIZE] {
            let mut fragmenter = FrameFragmenter::new();
            let frame = payload(len);
            let fragments = fragmenter.fragment(PacketKind::VideoFrame, &frame);

            let expected = if len <= FIRST_CAPACITY {
                1
            } else {
                1 + (len - FIRST_CAPACITY).div_ceil(MAX_PACKET_SIZE - FRAGMENT_HEADER_LEN)
            };
            assert_eq!(fragments.len(), expected, "len {}", len);
            assert!(fragments.iter().all(|f| f.len() <= MAX_PACKET_SIZE));
            assert!(fragments.iter().all(|f| f[0] == PacketKind::VideoFrame.as_u8()));

            let (number, rebuilt) = reassemble(&fragments);
            assert_eq!(number, 1);
            assert_eq!(rebuilt, frame);
        }
    }

    #[test]
    fn test_counter_shared_and_wraps_to_one() {
        let mut fragmenter = FrameFragmenter::new();
        fragmenter.fragment(PacketKind::KeyFrame, &[1]);
        let delta = fragmenter.fragment(PacketKind::VideoFrame, &[2]);
        assert_eq!(&delta[0][1..3], &[0, 2]);

        fragmenter.frame_number = i16::MAX;
        let wrapped = fragmenter.fragment(PacketKind::VideoFrame, &[3]);
        assert_eq!(&wrapped[0][1..3], &[0, 1]);

        fragmenter.reset();
        assert_eq!(fragmenter.frame_number(), 0);
    }
}
