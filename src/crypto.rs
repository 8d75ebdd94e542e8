//! Contracts consumed from the handshake layer.
//!
//! The actual TLS/crypto machinery lives outside this crate; the packer only
//! needs to know how much overhead sealing adds and how to seal a finished
//! payload in place.

use crate::protocol::{EncryptionLevel, PacketNumber};

/// Seals packet payloads under one set of keys.
pub trait Sealer {
    /// Number of bytes [`Self::seal`] appends to a payload.
    fn overhead(&self) -> usize;

    /// Encrypts `buf[payload_start..]` in place, authenticating
    /// `buf[..payload_start]` as associated data, and appends the tag.
    fn seal(&self, buf: &mut Vec<u8>, payload_start: usize, packet_number: PacketNumber);
}

/// Access to the sealers negotiated by the handshake.
pub trait CryptoSetup {
    /// The best sealer currently available for application data.
    fn sealer(&self) -> (EncryptionLevel, &dyn Sealer);

    /// The sealer for data on the crypto stream itself.
    fn sealer_for_crypto_stream(&self) -> (EncryptionLevel, &dyn Sealer);

    /// The sealer that was in use at `level`, for re-sealing
    /// retransmissions of handshake-era packets.
    fn sealer_with_encryption_level(&self, level: EncryptionLevel) -> Option<&dyn Sealer>;

    /// The server's diversification nonce, once chosen.
    fn diversification_nonce(&self) -> Option<&[u8; 32]>;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Sealer that appends `overhead` marker bytes and leaves the payload
    /// in the clear.
    pub(crate) struct TagSealer {
        pub(crate) overhead: usize,
    }

    impl Default for TagSealer {
        fn default() -> Self {
            Self { overhead: 12 }
        }
    }

    impl Sealer for TagSealer {
        fn overhead(&self) -> usize {
            self.overhead
        }

        fn seal(&self, buf: &mut Vec<u8>, _payload_start: usize, _packet_number: PacketNumber) {
            buf.extend(std::iter::repeat(0xEE).take(self.overhead));
        }
    }

    /// Crypto setup stub reporting a fixed encryption level.
    pub(crate) struct StubCryptoSetup {
        pub(crate) seal_level: EncryptionLevel,
        pub(crate) sealer: TagSealer,
        pub(crate) nonce: Option<[u8; 32]>,
    }

    impl StubCryptoSetup {
        pub(crate) fn new(seal_level: EncryptionLevel) -> Self {
            Self {
                seal_level,
                sealer: TagSealer::default(),
                nonce: None,
            }
        }
    }

    impl CryptoSetup for StubCryptoSetup {
        fn sealer(&self) -> (EncryptionLevel, &dyn Sealer) {
            (self.seal_level, &self.sealer)
        }

        fn sealer_for_crypto_stream(&self) -> (EncryptionLevel, &dyn Sealer) {
            (EncryptionLevel::Unencrypted, &self.sealer)
        }

        fn sealer_with_encryption_level(&self, _level: EncryptionLevel) -> Option<&dyn Sealer> {
            Some(&self.sealer)
        }

        fn diversification_nonce(&self) -> Option<&[u8; 32]> {
            self.nonce.as_ref()
        }
    }
}
