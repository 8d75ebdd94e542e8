//! Protocol-wide identifiers and constants.

use std::fmt;

/// Number of bytes, on the wire or in flight.
pub type ByteCount = u64;

/// A QUIC packet number, scoped to a path.
pub type PacketNumber = u64;

/// A stream identifier.
///
/// Stream 1 carries the crypto handshake and stream 3 the compressed
/// headers; both bypass priority scheduling.
pub type StreamId = u32;

/// The stream carrying the crypto handshake.
pub const CRYPTO_STREAM_ID: StreamId = 1;
/// The stream carrying compressed headers.
pub const HEADERS_STREAM_ID: StreamId = 3;

/// Returns whether a stream is one of the two reserved streams that bypass
/// priority scheduling.
pub fn is_reserved_stream(id: StreamId) -> bool {
    id == CRYPTO_STREAM_ID || id == HEADERS_STREAM_ID
}

/// Identifies one path of a multipath connection.
///
/// Path 0 is the initial path. Client-initiated paths are even,
/// server-initiated paths odd.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PathId(pub u8);

impl PathId {
    /// The initial path, created together with the connection.
    pub const INITIAL: PathId = PathId(0);

    /// Whether this path id is on the client side of the parity rule.
    pub fn client_initiated(self) -> bool {
        self.0 % 2 == 0
    }
}

impl fmt::Display for PathId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u8> for PathId {
    fn from(id: u8) -> Self {
        Self(id)
    }
}

/// A 64-bit connection identifier.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Which side of the connection we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Perspective {
    Client,
    Server,
}

impl Perspective {
    pub fn is_client(self) -> bool {
        self == Self::Client
    }

    pub fn is_server(self) -> bool {
        self == Self::Server
    }
}

/// Encryption levels, in increasing order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EncryptionLevel {
    Unencrypted,
    Secure,
    ForwardSecure,
}

/// A protocol version number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version(pub u32);

impl Version {
    /// First version with multipath support.
    pub const MULTIPATH: Version = Version(512);
    /// Placeholder for when the version does not matter.
    pub const WHATEVER: Version = Version(0);

    /// Whether connections negotiated at this version may open extra paths.
    pub fn supports_multipath(self) -> bool {
        self >= Self::MULTIPATH
    }
}

/// The versions this endpoint supports, in descending preference order.
pub const SUPPORTED_VERSIONS: &[Version] = &[Version::MULTIPATH, Version(39), Version(38), Version(37)];

/// Finds the best version in the overlap of ours and theirs, or `None`.
///
/// `ours` is sorted by our preference, descending; the order of `theirs`
/// does not matter.
pub fn choose_supported_version(ours: &[Version], theirs: &[Version]) -> Option<Version> {
    ours.iter()
        .copied()
        .find(|version| theirs.contains(version))
}

/// Maps a version number to its wire tag, e.g. 39 to `Q039`.
pub fn version_to_tag(version: Version) -> u32 {
    let v = version.0;
    u32::from(b'Q')
        + ((v / 100 % 10 + 0x30) << 8)
        + ((v / 10 % 10 + 0x30) << 16)
        + ((v % 10 + 0x30) << 24)
}

/// Maximum size of a packet, including the public header and the AEAD tag.
pub const MAX_PACKET_SIZE: ByteCount = 1350;

/// Packets sealed below forward-secure encryption are kept smaller to leave
/// room for the larger handshake overhead.
pub const NON_FORWARD_SECURE_PACKET_SIZE_REDUCTION: ByteCount = 50;

/// Ceiling on outstanding-plus-queued packets tracked per path.
pub const MAX_TRACKED_SENT_PACKETS: usize = 1 << 15;

/// Ceiling on intentionally skipped packet numbers remembered per path.
pub const MAX_TRACKED_SKIPPED_PACKETS: usize = 10;

/// Average number of packets between two intentionally skipped packet
/// numbers (optimistic-ACK defence).
pub const SKIP_PACKET_AVERAGE_PERIOD_LENGTH: PacketNumber = 500;

/// After this many consecutive non-retransmittable packets a PING is queued
/// so the peer keeps acknowledging.
pub const MAX_NON_RETRANSMITTABLE_PACKETS: usize = 19;

/// Assumed maximum segment size for congestion-window arithmetic.
pub const DEFAULT_TCP_MSS: ByteCount = 1460;

/// Initial congestion window, in packets.
pub const INITIAL_CONGESTION_WINDOW: ByteCount = 32;

/// Default cap on the congestion window, in packets.
pub const DEFAULT_MAX_CONGESTION_WINDOW: ByteCount = 1000;
