//! Server signing identity (C1).
//!
//! Holds the server's long-term secp256k1 keypair and exposes the two
//! operations the rest of the gateway needs from it: the public key, and
//! event signing. Conversation-key derivation for envelope encryption lives
//! in `crypto.rs`, which takes a `&Keys` reference from here — the keyring
//! itself stays a thin capability, the way `daemon/src/identity/mod.rs` keeps
//! its identity derivation separate from anything that consumes it.

use anyhow::{Context, Result};
use nostr_sdk::prelude::*;

pub struct Keyring {
    keys: Keys,
}

impl Keyring {
    /// Parse a server secret (bech32 `nsec1...` or 64-char hex). A malformed
    /// secret is fatal at startup (§4.1).
    pub fn from_secret(secret: &str) -> Result<Self> {
        let keys = Keys::parse(secret).context("malformed server_secret")?;
        Ok(Self { keys })
    }

    /// Generate a fresh keypair — used by `kvgate keygen`.
    pub fn generate() -> Self {
        Self { keys: Keys::generate() }
    }

    pub fn public_key(&self) -> PublicKey {
        self.keys.public_key()
    }

    pub fn nsec(&self) -> Result<String> {
        Ok(self.keys.secret_key().to_bech32()?)
    }

    pub fn npub(&self) -> Result<String> {
        Ok(self.public_key().to_bech32()?)
    }

    pub(crate) fn secret_key(&self) -> &SecretKey {
        self.keys.secret_key()
    }

    /// Clone of the underlying keypair, handed to `nostr_sdk::Client` as its
    /// signer so relay publishing uses the same identity as envelope crypto.
    pub fn keys(&self) -> Keys {
        self.keys.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_then_roundtrip_nsec() {
        let kr = Keyring::generate();
        let nsec = kr.nsec().unwrap();
        let reparsed = Keyring::from_secret(&nsec).unwrap();
        assert_eq!(kr.public_key(), reparsed.public_key());
    }

    #[test]
    fn malformed_secret_is_rejected() {
        assert!(Keyring::from_secret("not-a-key").is_err());
    }

    #[test]
    fn hex_secret_is_accepted() {
        let kr = Keyring::generate();
        let hex = kr.secret_key().to_secret_hex();
        assert!(Keyring::from_secret(&hex).is_ok());
    }
}
