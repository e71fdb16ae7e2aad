//! Cryptographic primitives used by the KMS activation protocol.
//!
//! Everything here operates on full caller-owned buffers; there are no
//! streaming interfaces and no global mutable state. Malformed input
//! lengths are programmer bugs and assert; authentication mismatches
//! are reported to the caller as values.

mod aes128;
mod rc4;

pub use crate::aes128::{aes128_cbc_decrypt, aes128_cbc_encrypt, aes_cmac, InvalidPadding};
pub use crate::rc4::Rc4;

use hmac::{Hmac, Mac as _};
use rand::rngs::OsRng;
use rand::RngCore as _;
use sha2::{Digest as _, Sha256};

/// AES block size in bytes; V5/V6 envelopes are sized in multiples of it.
pub const AES_BLOCK_SIZE: usize = 16;

/// Keyed-checksum constant of the V4 envelope.
///
/// First half of the canonical V4 key schedule material; protocol
/// defining, do not regenerate.
pub const KEY_V4: [u8; 16] = [
    0x05, 0x3D, 0x83, 0x07, 0xF9, 0xE5, 0xF0, 0x88, 0xEB, 0x5E, 0xA6, 0x68, 0x6C, 0xF0, 0x37, 0xC7,
];

/// Key-derivation constant of the V5 envelope.
pub const KEY_V5: [u8; 16] = [
    0xCD, 0x7E, 0x79, 0x6F, 0x2A, 0xB2, 0x5D, 0xCB, 0x55, 0xFF, 0xC8, 0xEF, 0x83, 0x64, 0xC4, 0x70,
];

/// AES-128 key of the V6 envelope.
pub const KEY_V6: [u8; 16] = [
    0xA9, 0x4A, 0x41, 0x95, 0xE2, 0x01, 0x43, 0x2D, 0x9B, 0xCB, 0x46, 0x04, 0x05, 0xD8, 0x4A, 0x21,
];

/// Computes the SHA-256 digest of `data`.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Computes HMAC-SHA-256 of `data` under `key`.
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Fills and returns `N` cryptographically random bytes.
pub fn rand_array<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

/// Returns `n` cryptographically random bytes.
pub fn rand_bytes(n: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; n];
    OsRng.fill_bytes(&mut bytes);
    bytes
}
