//! AES-CCM encryption of the provisioning data.
//!
//! The Provisioning Data PDU carries the 25-byte plaintext record encrypted under the session key
//! with a 13-byte nonce and an 8-byte MIC, and no associated data. These are the only CCM
//! parameters provisioning uses, so this module hardcodes them.

use aes::Aes128;
use ccm::aead::{AeadInPlace, KeyInit};
use ccm::consts::{U13, U8};
use ccm::Ccm;
use core::fmt;

use crate::Error;

/// Length of the message integrity check appended to the encrypted provisioning data.
pub const MIC_LEN: usize = 8;

/// Length of the session nonce (the 13 least significant bytes of the `k1` output).
pub const NONCE_LEN: usize = 13;

type SessionCcm = Ccm<Aes128, U8, U13>;

/// Error returned by [`decrypt`] when the MIC does not verify.
///
/// [`decrypt`]: fn.decrypt.html
#[derive(Debug)]
pub struct MicMismatch {}

impl fmt::Display for MicMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("message integrity check failed")
    }
}

/// Encrypts `buf` in place and returns the MIC.
///
/// Fails only if `buf` exceeds the (very large) CCM payload limit, which the fixed-size
/// provisioning data record never does.
pub fn encrypt(
    key: &[u8; 16],
    nonce: &[u8; NONCE_LEN],
    buf: &mut [u8],
) -> Result<[u8; MIC_LEN], Error> {
    let cipher = SessionCcm::new(key.into());
    let tag = cipher
        .encrypt_in_place_detached(nonce.into(), &[], buf)
        .map_err(|_| Error::InvalidLength)?;
    Ok(tag.into())
}

/// Decrypts `buf` in place, verifying the MIC.
///
/// On MIC mismatch the buffer contents are unspecified and must not be used.
pub fn decrypt(
    key: &[u8; 16],
    nonce: &[u8; NONCE_LEN],
    buf: &mut [u8],
    mic: &[u8; MIC_LEN],
) -> Result<(), MicMismatch> {
    let cipher = SessionCcm::new(key.into());
    cipher
        .decrypt_in_place_detached(nonce.into(), &[], buf, mic.into())
        .map_err(|_| MicMismatch {})
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 16] = [
        0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e,
        0x0f,
    ];
    const NONCE: [u8; 13] = [
        0xd0, 0xd1, 0xd2, 0xd3, 0xd4, 0xd5, 0xd6, 0xd7, 0xd8, 0xd9, 0xda, 0xdb, 0xdc,
    ];

    #[test]
    fn round_trip() {
        let plain: [u8; 25] = *b"provisioning data record.";
        let mut buf = plain;
        let mic = encrypt(&KEY, &NONCE, &mut buf).unwrap();
        assert_ne!(buf, plain);

        decrypt(&KEY, &NONCE, &mut buf, &mic).unwrap();
        assert_eq!(buf, plain);
    }

    #[test]
    fn tampered_payload_fails() {
        let mut buf = [0x42; 25];
        let mic = encrypt(&KEY, &NONCE, &mut buf).unwrap();

        buf[7] ^= 0x01;
        assert!(decrypt(&KEY, &NONCE, &mut buf, &mic).is_err());
    }

    #[test]
    fn tampered_mic_fails() {
        let mut buf = [0x42; 25];
        let mut mic = encrypt(&KEY, &NONCE, &mut buf).unwrap();

        mic[0] ^= 0x80;
        assert!(decrypt(&KEY, &NONCE, &mut buf, &mic).is_err());
    }

    #[test]
    fn wrong_key_fails() {
        let mut buf = [0x42; 25];
        let mic = encrypt(&KEY, &NONCE, &mut buf).unwrap();

        let mut wrong = KEY;
        wrong[15] ^= 0x01;
        assert!(decrypt(&wrong, &NONCE, &mut buf, &mic).is_err());
    }
}
