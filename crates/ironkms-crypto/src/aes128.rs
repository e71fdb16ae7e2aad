use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut as _, BlockEncryptMut as _, KeyIvInit as _};
use aes::Aes128;
use cmac::{Cmac, Mac as _};
use core::fmt;

use crate::AES_BLOCK_SIZE;

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// PKCS#7 padding of a decrypted buffer did not verify.
///
/// Indistinguishable from a wrong key on purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidPadding;

impl fmt::Display for InvalidPadding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid PKCS#7 padding")
    }
}

impl std::error::Error for InvalidPadding {}

/// Encrypts `plaintext` with AES-128-CBC, applying PKCS#7 padding.
///
/// The returned ciphertext length is always a non-zero multiple of the
/// AES block size.
pub fn aes128_cbc_encrypt(key: &[u8; 16], iv: &[u8; 16], plaintext: &[u8]) -> Vec<u8> {
    Aes128CbcEnc::new(key.into(), iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext)
}

/// Decrypts an AES-128-CBC ciphertext and strips PKCS#7 padding.
///
/// `ciphertext` must be a non-empty multiple of the AES block size;
/// callers validate envelope lengths before reaching for the cipher.
pub fn aes128_cbc_decrypt(key: &[u8; 16], iv: &[u8; 16], ciphertext: &[u8]) -> Result<Vec<u8>, InvalidPadding> {
    assert!(
        !ciphertext.is_empty() && ciphertext.len() % AES_BLOCK_SIZE == 0,
        "ciphertext length must be a non-zero multiple of the AES block size"
    );

    Aes128CbcDec::new(key.into(), iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| InvalidPadding)
}

/// Computes AES-CMAC (RFC 4493) of `msg` under `key`.
pub fn aes_cmac(key: &[u8; 16], msg: &[u8]) -> [u8; 16] {
    let mut mac = Cmac::<Aes128>::new(key.into());
    mac.update(msg);
    mac.finalize().into_bytes().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    // NIST SP 800-38A F.2.1 / RFC 4493 shared key
    const KEY: [u8; 16] = [
        0x2B, 0x7E, 0x15, 0x16, 0x28, 0xAE, 0xD2, 0xA6, 0xAB, 0xF7, 0x15, 0x88, 0x09, 0xCF, 0x4F, 0x3C,
    ];

    #[test]
    fn cbc_known_first_block() {
        let iv = [
            0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B, 0x0C, 0x0D, 0x0E, 0x0F,
        ];
        let plaintext = [
            0x6B, 0xC1, 0xBE, 0xE2, 0x2E, 0x40, 0x9F, 0x96, 0xE9, 0x3D, 0x7E, 0x11, 0x73, 0x93, 0x17, 0x2A,
        ];

        let ciphertext = aes128_cbc_encrypt(&KEY, &iv, &plaintext);

        // One full block plus one block of padding.
        assert_eq!(ciphertext.len(), 32);
        assert_eq!(
            ciphertext[..16],
            [0x76, 0x49, 0xAB, 0xAC, 0x81, 0x19, 0xB2, 0x46, 0xCE, 0xE9, 0x8E, 0x9B, 0x12, 0xE9, 0x19, 0x7D]
        );
    }

    #[test]
    fn cbc_round_trip() {
        let iv = [0x42; 16];
        let plaintext = b"stream of activation bytes, arbitrary length";

        let ciphertext = aes128_cbc_encrypt(&KEY, &iv, plaintext);
        assert_eq!(ciphertext.len() % AES_BLOCK_SIZE, 0);

        let decrypted = aes128_cbc_decrypt(&KEY, &iv, &ciphertext).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn cbc_bad_key_is_reported() {
        let iv = [0u8; 16];
        let ciphertext = aes128_cbc_encrypt(&KEY, &iv, b"some plaintext");

        let mut wrong_key = KEY;
        wrong_key[0] ^= 0xFF;

        // Overwhelmingly likely to trip the padding check.
        assert_eq!(aes128_cbc_decrypt(&wrong_key, &iv, &ciphertext), Err(InvalidPadding));
    }

    // RFC 4493 examples 1 and 2
    #[test]
    fn cmac_empty_message() {
        assert_eq!(
            aes_cmac(&KEY, b""),
            [0xBB, 0x1D, 0x69, 0x29, 0xE9, 0x59, 0x37, 0x28, 0x7F, 0xA3, 0x7D, 0x12, 0x9B, 0x75, 0x67, 0x46]
        );
    }

    #[test]
    fn cmac_one_block() {
        let msg = [
            0x6B, 0xC1, 0xBE, 0xE2, 0x2E, 0x40, 0x9F, 0x96, 0xE9, 0x3D, 0x7E, 0x11, 0x73, 0x93, 0x17, 0x2A,
        ];
        assert_eq!(
            aes_cmac(&KEY, &msg),
            [0x07, 0x0A, 0x16, 0xB4, 0x6B, 0x4D, 0x41, 0x44, 0xF7, 0x9B, 0xDD, 0x9D, 0xD0, 0x4A, 0x28, 0x7C]
        );
    }
}
