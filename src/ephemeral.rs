//! Ephemeral ECDH keys and the symmetric keys derived from them.
//!
//! At the start of a session every member generates one ephemeral keypair
//! per other member and broadcasts the public halves. ECDH between the
//! locally held private half and the peer's matching public half yields a
//! per-peer symmetric key; the threshold rounds use those keys to protect
//! member-to-member payloads inside broadcast messages.
//!
//! Private key material never leaves the process and is wiped on drop.

use std::collections::BTreeMap;

use chacha20::cipher::{NewCipher, StreamCipher};
use chacha20::{ChaCha20, Key, Nonce};
use curve25519_dalek::constants::RISTRETTO_BASEPOINT_TABLE;
use curve25519_dalek::ristretto::CompressedRistretto;
use curve25519_dalek::scalar::Scalar;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::Zeroize;

use crate::group::MemberIndex;

pub const PUBLIC_KEY_BYTES: usize = 32;
const SYMMETRIC_KEY_BYTES: usize = 32;
const NONCE_BYTES: usize = 12;

/// The system randomness source refused to produce key material.
#[derive(Debug, Error)]
#[error("system randomness source failed")]
pub struct KeyGenerationError(#[from] rand::Error);

/// The peer broadcast bytes that do not decode to a curve point.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("ephemeral public key is not a valid curve point")]
pub struct InvalidPublicKey;

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum DecryptError {
    #[error("ciphertext shorter than the nonce prefix")]
    TooShort,
}

/// Compressed public half of an ephemeral keypair, as it travels on the
/// wire. Nothing outside this module interprets the bytes.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EphemeralPublicKey([u8; PUBLIC_KEY_BYTES]);

impl EphemeralPublicKey {
    pub fn from_bytes(bytes: [u8; PUBLIC_KEY_BYTES]) -> Self {
        EphemeralPublicKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_BYTES] {
        &self.0
    }
}

impl std::fmt::Debug for EphemeralPublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EphemeralPublicKey({})", hex::encode(self.0))
    }
}

/// A freshly generated ECDH keypair bound to exactly one remote peer.
pub struct EphemeralKeypair {
    secret: Scalar,
    public: EphemeralPublicKey,
}

impl EphemeralKeypair {
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Result<Self, KeyGenerationError> {
        let mut wide = [0u8; 64];
        rng.try_fill_bytes(&mut wide)?;
        let secret = Scalar::from_bytes_mod_order_wide(&wide);
        wide.zeroize();
        let public =
            EphemeralPublicKey((&secret * &RISTRETTO_BASEPOINT_TABLE).compress().to_bytes());
        Ok(EphemeralKeypair { secret, public })
    }

    pub fn public_key(&self) -> EphemeralPublicKey {
        self.public
    }

    /// Derives the shared symmetric key with the peer this keypair was
    /// generated for. Both sides hash the same shared point, so the peer's
    /// matching call yields an identical key.
    pub fn ecdh(&self, peer: &EphemeralPublicKey) -> Result<SymmetricKey, InvalidPublicKey> {
        let point = CompressedRistretto(peer.0)
            .decompress()
            .ok_or(InvalidPublicKey)?;
        let shared = (self.secret * point).compress();
        let digest = Sha256::digest(shared.as_bytes());
        let mut key = [0u8; SYMMETRIC_KEY_BYTES];
        key.copy_from_slice(&digest);
        Ok(SymmetricKey(key))
    }
}

impl Drop for EphemeralKeypair {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

/// Symmetric key shared with exactly one peer, used by the threshold rounds
/// to protect member-to-member payloads.
pub struct SymmetricKey([u8; SYMMETRIC_KEY_BYTES]);

impl SymmetricKey {
    /// Encrypts `plaintext` under a fresh random nonce; the nonce is
    /// prepended to the returned ciphertext.
    pub fn encrypt<R: RngCore + CryptoRng>(&self, rng: &mut R, plaintext: &[u8]) -> Vec<u8> {
        let mut nonce = [0u8; NONCE_BYTES];
        rng.fill_bytes(&mut nonce);
        let mut out = Vec::with_capacity(NONCE_BYTES + plaintext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(plaintext);
        let mut cipher = ChaCha20::new(Key::from_slice(&self.0), Nonce::from_slice(&nonce));
        cipher.apply_keystream(&mut out[NONCE_BYTES..]);
        out
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, DecryptError> {
        if ciphertext.len() < NONCE_BYTES {
            return Err(DecryptError::TooShort);
        }
        let (nonce, body) = ciphertext.split_at(NONCE_BYTES);
        let mut out = body.to_vec();
        let mut cipher = ChaCha20::new(Key::from_slice(&self.0), Nonce::from_slice(nonce));
        cipher.apply_keystream(&mut out);
        Ok(out)
    }
}

impl Drop for SymmetricKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SymmetricKey(..)")
    }
}

/// The per-peer symmetric keys a member derived for one session.
#[derive(Debug, Default)]
pub struct SymmetricKeyring(BTreeMap<MemberIndex, SymmetricKey>);

impl SymmetricKeyring {
    pub fn new() -> Self {
        SymmetricKeyring(BTreeMap::new())
    }

    pub fn insert(&mut self, peer: MemberIndex, key: SymmetricKey) {
        self.0.insert(peer, key);
    }

    pub fn get(&self, peer: MemberIndex) -> Option<&SymmetricKey> {
        self.0.get(&peer)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Peers a key was derived for, ascending.
    pub fn peers(&self) -> Vec<MemberIndex> {
        self.0.keys().copied().collect()
    }
}

#[cfg(test)]
mod test {
    use rand::rngs::OsRng;

    use super::*;

    #[test]
    fn both_sides_derive_the_same_key() {
        let ours = EphemeralKeypair::generate(&mut OsRng).unwrap();
        let theirs = EphemeralKeypair::generate(&mut OsRng).unwrap();

        let our_key = ours.ecdh(&theirs.public_key()).unwrap();
        let their_key = theirs.ecdh(&ours.public_key()).unwrap();

        let message = b"shares for member three";
        let ciphertext = our_key.encrypt(&mut OsRng, message);
        assert_eq!(their_key.decrypt(&ciphertext).unwrap(), message);
    }

    #[test]
    fn fresh_keypairs_differ() {
        let a = EphemeralKeypair::generate(&mut OsRng).unwrap();
        let b = EphemeralKeypair::generate(&mut OsRng).unwrap();
        assert_ne!(a.public_key(), b.public_key());
    }

    #[test]
    fn undecodable_point_is_rejected() {
        let ours = EphemeralKeypair::generate(&mut OsRng).unwrap();
        let junk = EphemeralPublicKey::from_bytes([0xff; PUBLIC_KEY_BYTES]);
        assert!(matches!(ours.ecdh(&junk), Err(InvalidPublicKey)));
    }

    #[test]
    fn ciphertext_is_not_the_plaintext() {
        let ours = EphemeralKeypair::generate(&mut OsRng).unwrap();
        let theirs = EphemeralKeypair::generate(&mut OsRng).unwrap();
        let key = ours.ecdh(&theirs.public_key()).unwrap();

        let message = b"round two payload";
        let ciphertext = key.encrypt(&mut OsRng, message);
        assert_eq!(ciphertext.len(), NONCE_BYTES + message.len());
        assert_ne!(&ciphertext[NONCE_BYTES..], &message[..]);
    }

    #[test]
    fn truncated_ciphertext_is_rejected() {
        let ours = EphemeralKeypair::generate(&mut OsRng).unwrap();
        let theirs = EphemeralKeypair::generate(&mut OsRng).unwrap();
        let key = ours.ecdh(&theirs.public_key()).unwrap();
        assert_eq!(key.decrypt(&[0u8; 5]), Err(DecryptError::TooShort));
    }

    #[test]
    fn keyring_tracks_peers_in_order() {
        let mut keyring = SymmetricKeyring::new();
        let ours = EphemeralKeypair::generate(&mut OsRng).unwrap();
        for peer in [3u16, 1, 2].iter() {
            let theirs = EphemeralKeypair::generate(&mut OsRng).unwrap();
            keyring.insert(*peer, ours.ecdh(&theirs.public_key()).unwrap());
        }
        assert_eq!(keyring.peers(), vec![1, 2, 3]);
        assert_eq!(keyring.len(), 3);
        assert!(keyring.get(2).is_some());
        assert!(keyring.get(4).is_none());
    }
}
