//! V4 envelope: no encryption, a truncated keyed checksum over the
//! inner message appended to it.

use ironkms_core::not_enough_bytes_err;
use ironkms_crypto::{hmac_sha256, KEY_V4};

use super::{AuthFailure, KmsOpenError, ProtocolVersion};

const MAC_SIZE: usize = 16;

fn mac(inner: &[u8]) -> [u8; MAC_SIZE] {
    let digest = hmac_sha256(&KEY_V4, inner);
    digest[..MAC_SIZE].try_into().expect("truncated digest")
}

pub(super) fn seal(inner: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(inner.len() + MAC_SIZE);
    out.extend_from_slice(inner);
    out.extend_from_slice(&mac(inner));
    out
}

pub(super) fn open(body: &[u8]) -> Result<Vec<u8>, KmsOpenError> {
    let min = ProtocolVersion::SIZE + MAC_SIZE;
    if body.len() < min {
        return Err(KmsOpenError::Malformed(not_enough_bytes_err!(
            "V4 envelope",
            body.len(),
            min,
        )));
    }

    let (inner, tag) = body.split_at(body.len() - MAC_SIZE);
    if tag != mac(inner) {
        return Err(KmsOpenError::Auth(AuthFailure::V4HashMismatch));
    }

    Ok(inner.to_vec())
}
