//! Key derivation and sealing for record payloads.
//!
//! Each direction has its own ChaCha20-Poly1305 key, derived with
//! HKDF-SHA256 from the pre-shared key and both salts in sender, receiver
//! order. Swapping the salts yields the other direction's key, so records
//! reflected back at their sender never authenticate. Nonces are a
//! per-direction record counter.

use std::{fmt, io, sync::Arc};

use ring::{
    aead::{self, Aad, CHACHA20_POLY1305, LessSafeKey, NONCE_LEN, Nonce, UnboundKey},
    error::Unspecified,
    hkdf,
    rand::{SecureRandom, SystemRandom},
};

/// Length of the salt each side sends when a record layer starts.
pub const SALT_LEN: usize = 16;

/// Length of the authentication tag appended to every record.
pub const TAG_LEN: usize = aead::MAX_TAG_LEN;

const KEY_INFO: &[u8] = b"usocks record v1";

/// Secret shared by the server and its peers.
#[derive(Clone, PartialEq, Eq)]
pub struct PresharedKey(Arc<[u8]>);

impl PresharedKey {
    /// Wrap raw key material.
    #[must_use]
    pub fn new(bytes: impl AsRef<[u8]>) -> Self { Self(Arc::from(bytes.as_ref())) }

    pub(super) fn as_bytes(&self) -> &[u8] { &self.0 }
}

impl From<&str> for PresharedKey {
    fn from(value: &str) -> Self { Self::new(value) }
}

impl fmt::Debug for PresharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str("PresharedKey(..)") }
}

/// Key and nonce counter for one direction of a record layer.
pub(super) struct DirectionKey {
    key: LessSafeKey,
    counter: u64,
}

impl DirectionKey {
    /// Key for records travelling from the owner of `sender` to the owner
    /// of `receiver`.
    pub(super) fn derive(
        psk: &PresharedKey,
        sender: &[u8],
        receiver: &[u8],
    ) -> Result<Self, Unspecified> {
        let prk = hkdf::Salt::new(hkdf::HKDF_SHA256, sender).extract(psk.as_bytes());
        let info = [KEY_INFO, sender, receiver];
        let okm = prk.expand(&info, &CHACHA20_POLY1305)?;
        Ok(Self {
            key: LessSafeKey::new(UnboundKey::from(okm)),
            counter: 0,
        })
    }

    fn next_nonce(&mut self) -> Nonce {
        let mut nonce = [0u8; NONCE_LEN];
        nonce[4..].copy_from_slice(&self.counter.to_be_bytes());
        self.counter += 1;
        Nonce::assume_unique_for_key(nonce)
    }

    /// Encrypt `buf` in place and append the tag.
    pub(super) fn seal(&mut self, aad: &[u8], buf: &mut Vec<u8>) -> Result<(), Unspecified> {
        let nonce = self.next_nonce();
        self.key.seal_in_place_append_tag(nonce, Aad::from(aad), buf)
    }

    /// Authenticate and decrypt `buf` in place, returning the plaintext.
    pub(super) fn open<'a>(
        &mut self,
        aad: &[u8],
        buf: &'a mut [u8],
    ) -> Result<&'a mut [u8], Unspecified> {
        let nonce = self.next_nonce();
        self.key.open_in_place(nonce, Aad::from(aad), buf)
    }
}

pub(super) fn random_bytes<const N: usize>(rng: &SystemRandom) -> Result<[u8; N], Unspecified> {
    let mut bytes = [0u8; N];
    rng.fill(&mut bytes)?;
    Ok(bytes)
}

pub(super) fn crypto_failure(_: Unspecified) -> io::Error {
    io::Error::other("record cryptography failed")
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOCAL: &[u8] = b"0123456789abcdef";
    const REMOTE: &[u8] = b"fedcba9876543210";

    fn pair() -> (DirectionKey, DirectionKey) {
        let psk = PresharedKey::from("secret");
        (
            DirectionKey::derive(&psk, LOCAL, REMOTE).expect("derive sealer"),
            DirectionKey::derive(&psk, LOCAL, REMOTE).expect("derive opener"),
        )
    }

    #[test]
    fn sealed_records_open_in_order() {
        let (mut sealer, mut opener) = pair();
        for message in [&b"first"[..], b"second"] {
            let mut buf = message.to_vec();
            sealer.seal(b"aad", &mut buf).expect("seal");
            assert_eq!(buf.len(), message.len() + TAG_LEN);
            let plain = opener.open(b"aad", &mut buf).expect("open");
            assert_eq!(plain, message);
        }
    }

    #[test]
    fn different_salts_do_not_interoperate() {
        let psk = PresharedKey::from("secret");
        let mut sealer = DirectionKey::derive(&psk, LOCAL, REMOTE).expect("derive");
        let mut opener = DirectionKey::derive(&psk, LOCAL, b"aaaaaaaaaaaaaaaa").expect("derive");
        let mut buf = b"hello".to_vec();
        sealer.seal(&[], &mut buf).expect("seal");
        assert!(opener.open(&[], &mut buf).is_err());
    }

    #[test]
    fn opposite_directions_use_different_keys() {
        let psk = PresharedKey::from("secret");
        let mut outbound = DirectionKey::derive(&psk, LOCAL, REMOTE).expect("derive");
        let mut inbound = DirectionKey::derive(&psk, REMOTE, LOCAL).expect("derive");
        let mut buf = b"hello".to_vec();
        outbound.seal(&[], &mut buf).expect("seal");
        assert!(inbound.open(&[], &mut buf).is_err());
    }

    #[test]
    fn tampered_aad_fails() {
        let (mut sealer, mut opener) = pair();
        let mut buf = b"hello".to_vec();
        sealer.seal(&[0, 21], &mut buf).expect("seal");
        assert!(opener.open(&[0, 22], &mut buf).is_err());
    }

    #[test]
    fn key_debug_is_redacted() {
        assert_eq!(format!("{:?}", PresharedKey::from("hunter2")), "PresharedKey(..)");
    }
}
