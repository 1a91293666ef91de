//! Envelope Crypto (C3) — two schemes behind one contract.
//!
//! `SCHEME_V2` is NIP-44 (preferred: HKDF-derived key, ChaCha20, HMAC-SHA256
//! authentication). `SCHEME_V1` is NIP-04 (legacy: ECDH-derived key,
//! AES-256-CBC, no authentication). Both derive their symmetric key from
//! `(our_sk, peer_pk)` by ECDH, so the pair always derives the same
//! conversation key in both directions (§4.3) — nostr's own key-derivation
//! functions already guarantee this, so there's nothing to hand-roll here.
//!
//! Wire framing is self-identifying already: NIP-44 payloads are base64 of a
//! byte string starting with a version byte; NIP-04 payloads are
//! `<base64>?iv=<base64>`, which never starts with a valid NIP-44 version
//! byte once base64-decoded. Decrypt tries V2 then V1, matching the one-
//! struct-two-ciphers shape of `daemon/src/relay/crypto.rs`'s `RelayE2e`, but
//! as a stateless capability rather than a per-connection cipher pair since
//! nostr's NIPs already bind the scheme into the ciphertext itself.

use crate::keyring::Keyring;
use anyhow::{bail, Result};
use nostr_sdk::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    V2,
    V1,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::V2 => "v2",
            Scheme::V1 => "v1",
        }
    }
}

pub struct Encryptor {
    prefer_v2: bool,
}

impl Encryptor {
    pub fn new(prefer: crate::config::EncryptionPref) -> Self {
        Self {
            prefer_v2: matches!(prefer, crate::config::EncryptionPref::V2),
        }
    }

    /// Encrypt `plaintext` for `peer` under the server's keyring, using
    /// `SCHEME_V2` when preferred (the only process-wide knob — §4.3 allows
    /// V1-only deployments), else `SCHEME_V1`.
    pub fn encrypt(&self, keyring: &Keyring, peer: &PublicKey, plaintext: &str) -> Result<(String, Scheme)> {
        if self.prefer_v2 {
            let ct = nip44::encrypt(keyring.secret_key(), peer, plaintext, nip44::Version::V2)?;
            Ok((ct, Scheme::V2))
        } else {
            let ct = nip04::encrypt(keyring.secret_key(), peer, plaintext)?;
            Ok((ct, Scheme::V1))
        }
    }

    /// Decrypt a ciphertext of unknown scheme: try `SCHEME_V2` then
    /// `SCHEME_V1`. Fails if both reject (`DECRYPT_FAILED` at the caller,
    /// which — per §4.11 — drops the event silently rather than responding).
    pub fn decrypt(&self, keyring: &Keyring, peer: &PublicKey, ciphertext: &str) -> Result<String> {
        if let Ok(pt) = nip44::decrypt(keyring.secret_key(), peer, ciphertext) {
            return Ok(pt);
        }
        if let Ok(pt) = nip04::decrypt(keyring.secret_key(), peer, ciphertext) {
            return Ok(pt);
        }
        bail!("DECRYPT_FAILED")
    }
}
