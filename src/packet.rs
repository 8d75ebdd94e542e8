//! Public header and packet-number plumbing.

use bytes::{Buf, BufMut};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::frame::FrameError;
use crate::protocol::{
    version_to_tag, ByteCount, ConnectionId, PacketNumber, PathId, Perspective, Version,
};

/// Flag-byte bits of the public header.
const FLAG_VERSION: u8 = 0x01;
const FLAG_PUBLIC_RESET: u8 = 0x02;
const FLAG_DIVERSIFICATION_NONCE: u8 = 0x04;
const FLAG_CONNECTION_ID: u8 = 0x08;
const FLAG_MULTIPATH: u8 = 0x40;

/// On-wire width of a packet number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketNumberLen {
    One,
    Two,
    Four,
    Six,
}

impl PacketNumberLen {
    /// Number of bytes written.
    pub fn len(self) -> usize {
        match self {
            Self::One => 1,
            Self::Two => 2,
            Self::Four => 4,
            Self::Six => 6,
        }
    }

    pub(crate) fn mask(self) -> u64 {
        (1u64 << (8 * self.len())) - 1
    }

    fn flag_bits(self) -> u8 {
        match self {
            Self::One => 0x00,
            Self::Two => 0x10,
            Self::Four => 0x20,
            Self::Six => 0x30,
        }
    }

    /// Width needed for the public header, given the peer is known to have
    /// everything below `least_unacked`.
    pub fn for_header(packet_number: PacketNumber, least_unacked: PacketNumber) -> Self {
        let diff = packet_number.wrapping_sub(least_unacked);
        if diff < 1 << 7 {
            Self::One
        } else if diff < 1 << 15 {
            Self::Two
        } else if diff < 1 << 31 {
            Self::Four
        } else {
            Self::Six
        }
    }
}

/// The unencrypted header preceding every packet.
#[derive(Debug, Clone)]
pub struct PublicHeader {
    pub connection_id: ConnectionId,
    pub version_flag: bool,
    pub version: Version,
    pub multipath_flag: bool,
    pub path_id: PathId,
    pub truncate_connection_id: bool,
    pub diversification_nonce: Option<[u8; 32]>,
    pub packet_number: PacketNumber,
    pub packet_number_len: PacketNumberLen,
}

impl PublicHeader {
    /// Appends the header encoding to `buf`.
    ///
    /// Servers never write the version flag; clients never write a
    /// diversification nonce.
    pub fn write(&self, buf: &mut Vec<u8>, perspective: Perspective) {
        let mut flags = self.packet_number_len.flag_bits();
        if self.version_flag && perspective.is_client() {
            flags |= FLAG_VERSION;
        }
        if !self.truncate_connection_id {
            flags |= FLAG_CONNECTION_ID;
        }
        if self.diversification_nonce.is_some() && perspective.is_server() {
            flags |= FLAG_DIVERSIFICATION_NONCE;
        }
        if self.multipath_flag {
            flags |= FLAG_MULTIPATH;
        }
        buf.put_u8(flags);
        if !self.truncate_connection_id {
            buf.put_u64(self.connection_id.0);
        }
        if self.version_flag && perspective.is_client() {
            buf.put_u32(version_to_tag(self.version));
        }
        if perspective.is_server() {
            if let Some(nonce) = &self.diversification_nonce {
                buf.put_slice(nonce);
            }
        }
        if self.multipath_flag {
            buf.put_u8(self.path_id.0);
        }
        buf.put_uint(
            self.packet_number & self.packet_number_len.mask(),
            self.packet_number_len.len(),
        );
    }

    /// Number of bytes [`Self::write`] will produce.
    pub fn len(&self, perspective: Perspective) -> ByteCount {
        let mut len: ByteCount = 1;
        if !self.truncate_connection_id {
            len += 8;
        }
        if self.version_flag && perspective.is_client() {
            len += 4;
        }
        if self.diversification_nonce.is_some() && perspective.is_server() {
            len += 32;
        }
        if self.multipath_flag {
            len += 1;
        }
        len + self.packet_number_len.len() as ByteCount
    }
}

/// Per-path source of outgoing packet numbers.
///
/// Occasionally a number is skipped on purpose: a peer acknowledging a
/// number that was never sent reveals an optimistic-ACK attack.
pub(crate) struct PacketNumberGenerator {
    average_period: PacketNumber,
    pub(crate) next: PacketNumber,
    next_to_skip: PacketNumber,
    rng: StdRng,
}

impl PacketNumberGenerator {
    pub(crate) fn new(average_period: PacketNumber) -> Self {
        let mut generator = Self {
            average_period,
            next: 1,
            next_to_skip: 0,
            rng: StdRng::from_os_rng(),
        };
        generator.generate_new_skip();
        generator
    }

    #[cfg(test)]
    pub(crate) fn with_seed(average_period: PacketNumber, seed: u64) -> Self {
        let mut generator = Self {
            average_period,
            next: 1,
            next_to_skip: 0,
            rng: StdRng::seed_from_u64(seed),
        };
        generator.generate_new_skip();
        generator
    }

    /// The number the next packet will carry.
    pub(crate) fn peek(&self) -> PacketNumber {
        self.next
    }

    /// Consumes the next packet number. Called exactly once per packet
    /// actually written.
    pub(crate) fn pop(&mut self) -> PacketNumber {
        let next = self.next;
        self.next += 1;
        if self.next == self.next_to_skip {
            self.next += 1;
            self.generate_new_skip();
        }
        next
    }

    fn generate_new_skip(&mut self) {
        let num: u16 = self.rng.random();
        let skip =
            PacketNumber::from(num) * (self.average_period - 1) / (u64::from(u16::MAX) / 2);
        // Never skip two successive packet numbers.
        self.next_to_skip = self.next + 2 + skip;
    }
}

/// A stateless PUBLIC_RESET message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublicReset {
    pub rejected_packet_number: PacketNumber,
    pub nonce: u64,
}

const TAG_PRST: u32 = u32::from_le_bytes(*b"PRST");
const TAG_RNON: u32 = u32::from_le_bytes(*b"RNON");
const TAG_RSEQ: u32 = u32::from_le_bytes(*b"RSEQ");

/// Writes a PUBLIC_RESET packet. All fields are little-endian, tag-message
/// style.
pub fn write_public_reset(
    connection_id: ConnectionId,
    rejected_packet_number: PacketNumber,
    nonce_proof: u64,
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64);
    buf.put_u8(FLAG_PUBLIC_RESET | FLAG_CONNECTION_ID);
    buf.put_u64_le(connection_id.0);
    buf.put_u32_le(TAG_PRST);
    buf.put_u32_le(2); // number of tag/value pairs
    buf.put_u32_le(TAG_RNON);
    buf.put_u32_le(8); // end offset of RNON value
    buf.put_u32_le(TAG_RSEQ);
    buf.put_u32_le(16); // end offset of RSEQ value
    buf.put_u64_le(nonce_proof);
    buf.put_u64_le(rejected_packet_number);
    buf
}

/// Parses the body of a PUBLIC_RESET packet, starting at the message tag
/// (after the public flag byte and connection ID).
pub fn parse_public_reset(mut buf: &[u8]) -> Result<PublicReset, FrameError> {
    if buf.remaining() < 8 {
        return Err(FrameError::Truncated);
    }
    if buf.get_u32_le() != TAG_PRST {
        return Err(FrameError::InvalidPublicReset("wrong message tag"));
    }
    let num_pairs = buf.get_u32_le();
    if buf.remaining() < num_pairs as usize * 8 {
        return Err(FrameError::Truncated);
    }
    let mut index = Vec::with_capacity(num_pairs as usize);
    for _ in 0..num_pairs {
        let tag = buf.get_u32_le();
        let end_offset = buf.get_u32_le() as usize;
        index.push((tag, end_offset));
    }
    let data = buf;
    let mut start = 0;
    let mut nonce = None;
    let mut rejected = None;
    for (tag, end) in index {
        if end < start || end > data.len() {
            return Err(FrameError::InvalidPublicReset("bad value offsets"));
        }
        let value = &data[start..end];
        match tag {
            TAG_RNON => {
                if value.len() != 8 {
                    return Err(FrameError::InvalidPublicReset("invalid RNON value"));
                }
                nonce = Some(u64::from_le_bytes(value.try_into().unwrap()));
            }
            TAG_RSEQ => {
                if value.len() != 8 {
                    return Err(FrameError::InvalidPublicReset("invalid RSEQ value"));
                }
                rejected = Some(u64::from_le_bytes(value.try_into().unwrap()));
            }
            _ => {}
        }
        start = end;
    }
    match (nonce, rejected) {
        (Some(nonce), Some(rejected_packet_number)) => Ok(PublicReset {
            rejected_packet_number,
            nonce,
        }),
        (None, _) => Err(FrameError::InvalidPublicReset("RNON missing")),
        (_, None) => Err(FrameError::InvalidPublicReset("RSEQ missing")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_number_len_grows_with_delta() {
        assert_eq!(PacketNumberLen::for_header(5, 1), PacketNumberLen::One);
        assert_eq!(PacketNumberLen::for_header(300, 1), PacketNumberLen::Two);
        assert_eq!(
            PacketNumberLen::for_header(0xDECAFB, 0),
            PacketNumberLen::Four
        );
        assert_eq!(
            PacketNumberLen::for_header(1 << 40, 0),
            PacketNumberLen::Six
        );
    }

    #[test]
    fn header_len_matches_write() {
        let header = PublicHeader {
            connection_id: ConnectionId(0x1337),
            version_flag: true,
            version: Version::MULTIPATH,
            multipath_flag: true,
            path_id: PathId(2),
            truncate_connection_id: false,
            diversification_nonce: Some([0xAB; 32]),
            packet_number: 2,
            packet_number_len: PacketNumberLen::Two,
        };
        for perspective in [Perspective::Client, Perspective::Server] {
            let mut buf = Vec::new();
            header.write(&mut buf, perspective);
            assert_eq!(buf.len() as ByteCount, header.len(perspective));
        }
    }

    #[test]
    fn server_header_has_no_version_flag() {
        let header = PublicHeader {
            connection_id: ConnectionId(1),
            version_flag: true,
            version: Version::MULTIPATH,
            multipath_flag: false,
            path_id: PathId::INITIAL,
            truncate_connection_id: false,
            diversification_nonce: None,
            packet_number: 1,
            packet_number_len: PacketNumberLen::One,
        };
        let mut buf = Vec::new();
        header.write(&mut buf, Perspective::Server);
        assert_eq!(buf[0] & FLAG_VERSION, 0);
    }

    #[test]
    fn generator_is_monotone_and_skips() {
        let mut generator = PacketNumberGenerator::with_seed(100, 7);
        let mut last = 0;
        let mut skipped = 0;
        for _ in 0..1000 {
            assert_eq!(generator.peek(), generator.peek());
            let n = generator.pop();
            assert!(n > last);
            skipped += n - last - 1;
            last = n;
        }
        assert!(skipped > 0, "no packet number was ever skipped");
    }

    #[test]
    fn public_reset_roundtrip() {
        let raw = write_public_reset(ConnectionId(0xDEAD), 42, 0x1122334455667788);
        // skip public flags and connection id
        let reset = parse_public_reset(&raw[9..]).unwrap();
        assert_eq!(reset.rejected_packet_number, 42);
        assert_eq!(reset.nonce, 0x1122334455667788);
    }

    #[test]
    fn public_reset_requires_prst_tag() {
        let mut raw = write_public_reset(ConnectionId(1), 1, 1);
        raw[9] = b'X';
        assert!(matches!(
            parse_public_reset(&raw[9..]),
            Err(FrameError::InvalidPublicReset(_))
        ));
    }
}
