//! Protocol state machine for multipath QUIC connections.
//!
//! This crate contains the transport core of a PStream endpoint: per-path
//! reliability (packet-number bookkeeping, ACK processing, loss detection,
//! tail-loss probes and retransmission timeouts), the packet packer, and the
//! multipath scheduler that splits one application byte stream across
//! several network paths by RTT, estimated bandwidth and stream priority.
//!
//! No I/O happens here. The embedder decrypts and demultiplexes incoming
//! datagrams, feeds frames and timeouts into [`Connection`], and ships the
//! [`Transmit`] values it gets back over UDP. Cryptographic sealing and
//! flow-control accounting are consumed through the [`crypto`] and [`flow`]
//! traits.

mod config;
pub use config::{Config, PathStatsSeed};

pub mod congestion;

mod connection;
pub use connection::{
    AckError, Connection, ConnectionError, Event, PackError, PathError, SentPacket,
    StreamPriority, Transmit,
};

pub mod crypto;

pub mod flow;

pub mod frame;
pub use frame::Frame;

mod packet;
pub use packet::{
    parse_public_reset, write_public_reset, PacketNumberLen, PublicHeader, PublicReset,
};

mod protocol;
pub use protocol::{
    ByteCount, ConnectionId, EncryptionLevel, PacketNumber, PathId, Perspective, StreamId,
    Version, MAX_PACKET_SIZE,
};
