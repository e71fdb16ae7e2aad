//! V6 envelope: AES-128-CBC with the fixed V6 key and PKCS#7 padding,
//! authenticated by an AES-CMAC over the IV and ciphertext.

use ironkms_core::{invalid_field_err, not_enough_bytes_err};
use ironkms_crypto::{aes128_cbc_decrypt, aes128_cbc_encrypt, aes_cmac, rand_array, AES_BLOCK_SIZE, KEY_V6};

use super::{AuthFailure, KmsOpenError, ProtocolVersion};

const IV_SIZE: usize = 16;
const CMAC_SIZE: usize = 16;

pub(super) fn seal(version: ProtocolVersion, inner: &[u8]) -> Vec<u8> {
    seal_with_iv(version, &rand_array::<IV_SIZE>(), inner)
}

fn seal_with_iv(version: ProtocolVersion, iv: &[u8; IV_SIZE], inner: &[u8]) -> Vec<u8> {
    let encrypted = aes128_cbc_encrypt(&KEY_V6, iv, inner);

    let mut out = Vec::with_capacity(ProtocolVersion::SIZE + IV_SIZE + encrypted.len() + CMAC_SIZE);
    out.extend_from_slice(&version.minor.to_le_bytes());
    out.extend_from_slice(&version.major.to_le_bytes());
    out.extend_from_slice(iv);
    out.extend_from_slice(&encrypted);

    let tag = aes_cmac(&KEY_V6, &out[ProtocolVersion::SIZE..]);
    out.extend_from_slice(&tag);
    out
}

pub(super) fn open(body: &[u8]) -> Result<Vec<u8>, KmsOpenError> {
    let min = ProtocolVersion::SIZE + IV_SIZE + AES_BLOCK_SIZE + CMAC_SIZE;
    if body.len() < min {
        return Err(KmsOpenError::Malformed(not_enough_bytes_err!(
            "V6 envelope",
            body.len(),
            min,
        )));
    }

    let (authenticated, tag) = body.split_at(body.len() - CMAC_SIZE);
    let authenticated = &authenticated[ProtocolVersion::SIZE..];

    let encrypted = &authenticated[IV_SIZE..];
    if encrypted.len() % AES_BLOCK_SIZE != 0 {
        return Err(KmsOpenError::Malformed(invalid_field_err!(
            "V6 envelope",
            "encrypted_payload",
            "not a multiple of the AES block size",
        )));
    }

    if tag != aes_cmac(&KEY_V6, authenticated) {
        return Err(KmsOpenError::Auth(AuthFailure::V6CmacMismatch));
    }

    let iv: [u8; IV_SIZE] = authenticated[..IV_SIZE].try_into().expect("fixed-size IV");
    aes128_cbc_decrypt(&KEY_V6, &iv, encrypted).map_err(|e| {
        // CMAC passed but padding did not: corrupt peer, not tampering.
        let err: ironkms_core::DecodeError =
            invalid_field_err!("V6 envelope", "padding", "invalid PKCS#7 padding");
        KmsOpenError::Malformed(err.with_source(e))
    })
}
