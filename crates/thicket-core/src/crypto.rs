//! Hashing and the symmetric envelope for application payloads.
//!
//! Datagram payloads that want privacy are wrapped end to end with
//! encrypt-then-MAC over a shared secret from
//! [`LocalIdentity::shared_secret`](crate::identity::LocalIdentity::shared_secret):
//!
//! ```text
//! +----------------+---------------------------------------+
//! | MAC (4 bytes)  | AES-128 ciphertext (multiple of 16)   |
//! +----------------+---------------------------------------+
//!   truncated         key = secret[0..16], zero-padded
//!   HMAC-SHA256        final block
//!   keyed by the
//!   full secret
//! ```
//!
//! The MAC is checked before any decryption happens; a mismatch fails the
//! whole envelope.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// AES-128 key length in bytes.
pub const CIPHER_KEY_LEN: usize = 16;
/// AES block length in bytes.
pub const CIPHER_BLOCK_LEN: usize = 16;
/// Truncated MAC length prepended to ciphertext.
pub const CIPHER_MAC_LEN: usize = 4;

/// Errors from the symmetric envelope.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    /// The transmitted MAC does not match the ciphertext.
    #[error("MAC mismatch")]
    MacMismatch,
    /// Ciphertext length is not a whole number of cipher blocks.
    #[error("ciphertext length {0} is not a whole number of blocks")]
    InvalidLength(usize),
    /// Input too short to carry a MAC.
    #[error("input too short to carry a MAC")]
    TooShort,
}

/// Result type for envelope operations.
pub type CryptoResult<T> = Result<T, CryptoError>;

/// SHA-256 over the concatenation of `parts`.
pub fn sha256(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// First 8 bytes of [`sha256`]. Destination and packet hashes use this.
pub fn sha256_trunc8(parts: &[&[u8]]) -> [u8; 8] {
    let full = sha256(parts);
    let mut out = [0u8; 8];
    out.copy_from_slice(&full[..8]);
    out
}

/// AES-128 encrypt `src` block by block, zero-padding the final partial
/// block. Output length is `src.len()` rounded up to a block multiple.
pub fn encrypt(key: &[u8; CIPHER_KEY_LEN], src: &[u8]) -> Vec<u8> {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut out = Vec::with_capacity(src.len().div_ceil(CIPHER_BLOCK_LEN) * CIPHER_BLOCK_LEN);
    for chunk in src.chunks(CIPHER_BLOCK_LEN) {
        let mut block = [0u8; CIPHER_BLOCK_LEN];
        block[..chunk.len()].copy_from_slice(chunk);
        let mut block = GenericArray::from(block);
        cipher.encrypt_block(&mut block);
        out.extend_from_slice(&block);
    }
    out
}

/// AES-128 decrypt `src` block by block. `src` must be a whole number of
/// blocks; padding removal is the caller's concern.
pub fn decrypt(key: &[u8; CIPHER_KEY_LEN], src: &[u8]) -> CryptoResult<Vec<u8>> {
    if src.len() % CIPHER_BLOCK_LEN != 0 {
        return Err(CryptoError::InvalidLength(src.len()));
    }
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut out = Vec::with_capacity(src.len());
    for chunk in src.chunks(CIPHER_BLOCK_LEN) {
        let mut block = GenericArray::clone_from_slice(chunk);
        cipher.decrypt_block(&mut block);
        out.extend_from_slice(&block);
    }
    Ok(out)
}

/// Encrypt `src` and prepend the truncated HMAC over the ciphertext.
pub fn encrypt_then_mac(shared_secret: &[u8; 32], src: &[u8]) -> Vec<u8> {
    let mut key = [0u8; CIPHER_KEY_LEN];
    key.copy_from_slice(&shared_secret[..CIPHER_KEY_LEN]);
    let ciphertext = encrypt(&key, src);

    let mut mac = <HmacSha256 as Mac>::new_from_slice(shared_secret)
        .expect("HMAC accepts any key length");
    mac.update(&ciphertext);
    let tag = mac.finalize().into_bytes();

    let mut out = Vec::with_capacity(CIPHER_MAC_LEN + ciphertext.len());
    out.extend_from_slice(&tag[..CIPHER_MAC_LEN]);
    out.extend_from_slice(&ciphertext);
    out
}

/// Verify the truncated HMAC, then decrypt.
///
/// The ciphertext is never touched when the MAC does not match.
pub fn mac_then_decrypt(shared_secret: &[u8; 32], src: &[u8]) -> CryptoResult<Vec<u8>> {
    if src.len() <= CIPHER_MAC_LEN {
        return Err(CryptoError::TooShort);
    }

    let mut mac = <HmacSha256 as Mac>::new_from_slice(shared_secret)
        .expect("HMAC accepts any key length");
    mac.update(&src[CIPHER_MAC_LEN..]);
    let tag = mac.finalize().into_bytes();
    if tag[..CIPHER_MAC_LEN] != src[..CIPHER_MAC_LEN] {
        return Err(CryptoError::MacMismatch);
    }

    let mut key = [0u8; CIPHER_KEY_LEN];
    key.copy_from_slice(&shared_secret[..CIPHER_KEY_LEN]);
    decrypt(&key, &src[CIPHER_MAC_LEN..])
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: [u8; 32] = [0x42; 32];

    #[test]
    fn sha256_parts_match_concatenation() {
        let joined = sha256(&[b"hello world"]);
        let split = sha256(&[b"hello ", b"world"]);
        assert_eq!(joined, split);
        assert_eq!(sha256_trunc8(&[b"hello world"]), joined[..8]);
    }

    #[test]
    fn encrypt_pads_to_block_multiple() {
        let key = [7u8; CIPHER_KEY_LEN];
        for len in [0usize, 1, 15, 16, 17, 32, 33] {
            let src = vec![0xA5u8; len];
            let ct = encrypt(&key, &src);
            assert_eq!(ct.len(), len.div_ceil(16) * 16, "len {len}");
        }
    }

    #[test]
    fn encrypt_decrypt_round_trip() {
        let key = [9u8; CIPHER_KEY_LEN];
        for len in [1usize, 15, 16, 17, 31, 32, 100] {
            let src: Vec<u8> = (0..len as u8).collect();
            let ct = encrypt(&key, &src);
            let pt = decrypt(&key, &ct).unwrap();
            assert_eq!(&pt[..len], &src[..], "len {len}");
            // zero padding beyond the plaintext
            assert!(pt[len..].iter().all(|&b| b == 0));
        }
    }

    #[test]
    fn decrypt_rejects_ragged_length() {
        let key = [1u8; CIPHER_KEY_LEN];
        assert_eq!(
            decrypt(&key, &[0u8; 17]),
            Err(CryptoError::InvalidLength(17))
        );
    }

    #[test]
    fn envelope_round_trip() {
        let msg = b"meet at the north gate";
        let wrapped = encrypt_then_mac(&SECRET, msg);
        assert_eq!(wrapped.len(), CIPHER_MAC_LEN + 32);
        let opened = mac_then_decrypt(&SECRET, &wrapped).unwrap();
        assert_eq!(&opened[..msg.len()], msg);
    }

    #[test]
    fn tamper_at_every_position_fails() {
        let msg = b"tamper grid";
        let wrapped = encrypt_then_mac(&SECRET, msg);
        for i in 0..wrapped.len() {
            let mut bad = wrapped.clone();
            bad[i] ^= 0x01;
            assert_eq!(
                mac_then_decrypt(&SECRET, &bad),
                Err(CryptoError::MacMismatch),
                "position {i}"
            );
        }
    }

    #[test]
    fn wrong_secret_fails() {
        let wrapped = encrypt_then_mac(&SECRET, b"payload");
        let other = [0x43u8; 32];
        assert_eq!(
            mac_then_decrypt(&other, &wrapped),
            Err(CryptoError::MacMismatch)
        );
    }

    #[test]
    fn short_input_is_invalid() {
        assert_eq!(mac_then_decrypt(&SECRET, &[]), Err(CryptoError::TooShort));
        assert_eq!(
            mac_then_decrypt(&SECRET, &[1, 2, 3, 4]),
            Err(CryptoError::TooShort)
        );
    }
}
