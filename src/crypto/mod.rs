//! The mesh security toolbox.
//!
//! Everything cryptographic in mesh provisioning is built from AES-128: `AES-CMAC` ([RFC 4493])
//! keys the confirmation exchange, the `s1`/`k1` functions derive salts and session material from
//! it, and `AES-CCM` encrypts the provisioning data. The toolbox functions here are the building
//! blocks; the key schedule specific to a provisioning session lives in [`prov::session`].
//!
//! The P-256 operations (key generation and ECDH) are pluggable via the [`ecdh`] module since
//! they are by far the most expensive part and platforms may want to use a hardware accelerator.
//!
//! [RFC 4493]: https://tools.ietf.org/html/rfc4493
//! [`prov::session`]: ../prov/session/index.html
//! [`ecdh`]: ecdh/index.html

pub mod ccm;
pub mod ecdh;

use aes::Aes128;
use cmac::{Cmac, Mac};

/// Computes `AES-CMAC(key, data)`.
pub fn cmac(key: &[u8; 16], data: &[u8]) -> [u8; 16] {
    let mut mac = Cmac::<Aes128>::new(key.into());
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// The salt generation function `s1`: a CMAC over `data` under an all-zero key.
pub fn s1(data: &[u8]) -> [u8; 16] {
    cmac(&[0; 16], data)
}

/// The key derivation function `k1`.
///
/// Computes `CMAC(CMAC(salt, ikm), info)`: the input key material is first condensed into an
/// intermediate key using the salt, which then MACs the info string.
pub fn k1(salt: &[u8; 16], ikm: &[u8], info: &[u8]) -> [u8; 16] {
    let t = cmac(salt, ikm);
    cmac(&t, info)
}

/// Computes the URI hash advertised in the unprovisioned device beacon.
///
/// This is the first 4 bytes of `s1(uri)`.
pub fn uri_hash(uri: &[u8]) -> [u8; 4] {
    let full = s1(uri);
    [full[0], full[1], full[2], full[3]]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_hex(hex: &str) -> std::vec::Vec<u8> {
        assert!(hex.len() % 2 == 0);
        (0..hex.len() / 2)
            .map(|i| u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).unwrap())
            .collect()
    }

    fn hex16(hex: &str) -> [u8; 16] {
        let mut out = [0; 16];
        out.copy_from_slice(&parse_hex(hex));
        out
    }

    /// AES-CMAC test vectors from RFC 4493, section 4.
    #[test]
    fn cmac_rfc4493() {
        let key = hex16("2b7e151628aed2a6abf7158809cf4f3c");
        assert_eq!(cmac(&key, &[]), hex16("bb1d6929e95937287fa37d129b756746"));
        assert_eq!(
            cmac(&key, &parse_hex("6bc1bee22e409f96e93d7e117393172a")),
            hex16("070a16b46b4d4144f79bdd9dd04a287c"),
        );
    }

    /// `s1` sample data from the Mesh Profile specification, section 8.1.1.
    #[test]
    fn s1_sample() {
        assert_eq!(s1(b"test"), hex16("b73cefbd641ef2ea598c2b6efb62f79c"));
    }

    /// `k1` sample data from the Mesh Profile specification, section 8.1.2.
    #[test]
    fn k1_sample() {
        let ikm = parse_hex("3216d1509884b533248541792b877f98");
        let salt = hex16("2ba14ffa0df84a2831938d57d276cab4");
        let info = parse_hex("5a09d60797eeb4478aada59db3352a0d");
        assert_eq!(
            k1(&salt, &ikm, &info),
            hex16("f6ed15a8934afbe7d83e8dcb57fcf5d7"),
        );
    }

    #[test]
    fn uri_hash_is_s1_prefix() {
        let uri = b"https://www.example.com/mesh";
        assert_eq!(uri_hash(uri), s1(uri)[..4]);
    }
}
