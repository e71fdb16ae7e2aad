//! V5 envelope: RC4 under a per-message key mixed from a random salt
//! and the fixed V5 constant; integrity via a truncated SHA-256 of the
//! inner message trailing it inside the stream.

use ironkms_core::not_enough_bytes_err;
use ironkms_crypto::{rand_array, sha256, Rc4, KEY_V5};

use super::{AuthFailure, KmsOpenError, ProtocolVersion};

const SALT_SIZE: usize = 16;
const DIGEST_SIZE: usize = 16;

fn derive_key(salt: &[u8; SALT_SIZE]) -> [u8; 16] {
    let mut material = [0u8; SALT_SIZE + KEY_V5.len()];
    material[..SALT_SIZE].copy_from_slice(salt);
    material[SALT_SIZE..].copy_from_slice(&KEY_V5);

    let digest = sha256(&material);
    digest[..16].try_into().expect("truncated digest")
}

pub(super) fn seal(version: ProtocolVersion, inner: &[u8]) -> Vec<u8> {
    seal_with_salt(version, &rand_array::<SALT_SIZE>(), inner)
}

fn seal_with_salt(version: ProtocolVersion, salt: &[u8; SALT_SIZE], inner: &[u8]) -> Vec<u8> {
    let mut plaintext = Vec::with_capacity(inner.len() + DIGEST_SIZE);
    plaintext.extend_from_slice(inner);
    plaintext.extend_from_slice(&sha256(inner)[..DIGEST_SIZE]);

    let encrypted = Rc4::new(&derive_key(salt)).process(&plaintext);

    let mut out = Vec::with_capacity(ProtocolVersion::SIZE + SALT_SIZE + encrypted.len());
    out.extend_from_slice(&version.minor.to_le_bytes());
    out.extend_from_slice(&version.major.to_le_bytes());
    out.extend_from_slice(salt);
    out.extend_from_slice(&encrypted);
    out
}

pub(super) fn open(body: &[u8]) -> Result<Vec<u8>, KmsOpenError> {
    let min = ProtocolVersion::SIZE + SALT_SIZE + DIGEST_SIZE;
    if body.len() < min {
        return Err(KmsOpenError::Malformed(not_enough_bytes_err!(
            "V5 envelope",
            body.len(),
            min,
        )));
    }

    let salt: [u8; SALT_SIZE] = body[ProtocolVersion::SIZE..ProtocolVersion::SIZE + SALT_SIZE]
        .try_into()
        .expect("fixed-size salt");
    let encrypted = &body[ProtocolVersion::SIZE + SALT_SIZE..];

    let plaintext = Rc4::new(&derive_key(&salt)).process(encrypted);
    let (inner, digest) = plaintext.split_at(plaintext.len() - DIGEST_SIZE);

    if digest != &sha256(inner)[..DIGEST_SIZE] {
        return Err(KmsOpenError::Auth(AuthFailure::V5DigestMismatch));
    }

    Ok(inner.to_vec())
}
