//! Elliptic Curve Diffie-Hellman (ECDH) on P-256.
//!
//! Mesh provisioning uses ECDH on P-256 to agree on the secret that all session keys are derived
//! from. This module provides an interface for plugging in different implementations of the P-256
//! operations, so that platforms with a hardware accelerator or a secure element can use it.
//!
//! The primary trait in this module is [`EcdhProvider`]. The built-in [`P256Provider`] and
//! [`P256SecretKey`] use the pure-Rust [`p256`] crate and are always available.
//!
//! [`EcdhProvider`]: trait.EcdhProvider.html
//! [`P256Provider`]: struct.P256Provider.html
//! [`P256SecretKey`]: struct.P256SecretKey.html
//! [`p256`]: https://docs.rs/p256

use core::fmt;
use p256::elliptic_curve::generic_array::GenericArray;
use p256::elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint};
use rand_core::{CryptoRng, RngCore};

/// A P-256 public key (point on the curve) in uncompressed format.
///
/// The encoding is as specified in *[SEC 1: Elliptic Curve Cryptography]*, but without the leading
/// `0x04` byte: The first 32 Bytes are the big-endian encoding of the point's X coordinate, and
/// the remaining 32 Bytes are the Y coordinate, encoded the same way. This also happens to be
/// exactly the parameter layout of the Provisioning Public Key PDU.
///
/// Note that this type does not provide any validity guarantees (unlike [`SecretKey`]
/// implementors): It is possible to represent invalid public P-256 keys, such as the point at
/// infinity, with this type. The other APIs in this module are designed to take that into account.
///
/// [SEC 1: Elliptic Curve Cryptography]: http://www.secg.org/sec1-v2.pdf
/// [`SecretKey`]: trait.SecretKey.html
#[derive(Copy, Clone)]
pub struct PublicKey(pub [u8; 64]);

impl PublicKey {
    /// Returns the big-endian X coordinate of the point.
    pub fn x(&self) -> &[u8] {
        &self.0[..32]
    }

    /// Returns the big-endian Y coordinate of the point.
    pub fn y(&self) -> &[u8] {
        &self.0[32..]
    }
}

/// A shared secret resulting from an ECDH key agreement.
///
/// This is returned by implementations of [`SecretKey::agree`]. The provisioning key schedule
/// uses it as the input key material of every `k1` derivation.
///
/// [`SecretKey::agree`]: trait.SecretKey.html#tymethod.agree
pub struct SharedSecret(pub [u8; 32]);

/// Error returned by [`SecretKey::agree`] when the public key of the other party is invalid.
///
/// [`SecretKey::agree`]: trait.SecretKey.html#tymethod.agree
#[derive(Debug)]
pub struct InvalidPublicKey {}

impl InvalidPublicKey {
    /// Creates a new `InvalidPublicKey` error.
    pub fn new() -> Self {
        Self {}
    }
}

impl fmt::Display for InvalidPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("invalid public key")
    }
}

/// Error returned by [`SecretKey::from_bytes`] when the scalar is zero or not below the curve
/// order.
///
/// [`SecretKey::from_bytes`]: trait.SecretKey.html#tymethod.from_bytes
#[derive(Debug)]
pub struct InvalidPrivateKey {}

impl fmt::Display for InvalidPrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("invalid private key")
    }
}

/// Trait for ECDH providers.
pub trait EcdhProvider {
    /// Provider-defined secret key type.
    type SecretKey: SecretKey;

    /// Generates a P-256 key pair using cryptographically strong randomness.
    ///
    /// Implementors must ensure that they only return valid private/public key pairs from this
    /// method.
    ///
    /// The stack will pass a cryptographically secure random number generator `rng` to this
    /// function that may be used to obtain entropy for key generation. Implementations may also
    /// use their own RNG if they so choose.
    fn generate_keypair<R>(&mut self, rng: &mut R) -> (Self::SecretKey, PublicKey)
    where
        R: RngCore + CryptoRng;
}

/// Secret key operations required by the provisioning protocol.
///
/// This API imposes no requirements on the representation or location of secret keys. This means
/// that it should be possible to implement this trait even for keys stored in some secure key
/// storage like a smartcard.
pub trait SecretKey: Sized {
    /// Converts a raw big-endian scalar into a secret key.
    ///
    /// This is used when the application supplies its own (possibly out-of-band distributed)
    /// key pair instead of having one generated per session.
    ///
    /// # Errors
    ///
    /// If `bytes` is not a valid P-256 scalar (zero, or not below the curve order), an error is
    /// returned.
    fn from_bytes(bytes: &[u8; 32]) -> Result<Self, InvalidPrivateKey>;

    /// Performs ECDH key agreement using an ephemeral secret key `self` and the public key of the
    /// other party.
    ///
    /// Here, "ephemeral" just means that this method takes `self` by value. This allows
    /// implementing `SecretKey` for providers that enforce single-use keys using Rust ownership.
    ///
    /// # Errors
    ///
    /// If `foreign_key` is an invalid public key (off-curve, or the point at infinity),
    /// implementors must return an error.
    fn agree(self, foreign_key: &PublicKey) -> Result<SharedSecret, InvalidPublicKey>;
}

/// An [`EcdhProvider`] using the pure-Rust [`p256`] crate.
///
/// [`EcdhProvider`]: trait.EcdhProvider.html
/// [`p256`]: https://docs.rs/p256
pub struct P256Provider {}

impl P256Provider {
    /// Creates a new provider instance.
    pub fn new() -> Self {
        Self {}
    }
}

impl EcdhProvider for P256Provider {
    type SecretKey = P256SecretKey;

    fn generate_keypair<R>(&mut self, rng: &mut R) -> (Self::SecretKey, PublicKey)
    where
        R: RngCore + CryptoRng,
    {
        let secret = p256::SecretKey::random(rng);
        let encoded = secret.public_key().to_encoded_point(false);

        // Uncompressed SEC 1 encoding is `04 || x || y`.
        let mut public = [0; 64];
        public.copy_from_slice(&encoded.as_bytes()[1..65]);

        (P256SecretKey(secret), PublicKey(public))
    }
}

/// Secret key returned by [`P256Provider`].
///
/// [`P256Provider`]: struct.P256Provider.html
pub struct P256SecretKey(p256::SecretKey);

impl SecretKey for P256SecretKey {
    fn from_bytes(bytes: &[u8; 32]) -> Result<Self, InvalidPrivateKey> {
        p256::SecretKey::from_slice(bytes)
            .map(P256SecretKey)
            .map_err(|_| InvalidPrivateKey {})
    }

    fn agree(self, foreign_key: &PublicKey) -> Result<SharedSecret, InvalidPublicKey> {
        let point = p256::EncodedPoint::from_untagged_bytes(GenericArray::from_slice(
            &foreign_key.0,
        ));

        // `from_encoded_point` checks the curve equation and rejects the point at infinity, which
        // is exactly the validation the protocol requires before running the key agreement.
        let public: Option<p256::PublicKey> =
            p256::PublicKey::from_encoded_point(&point).into();
        let public = public.ok_or_else(InvalidPublicKey::new)?;

        let shared = p256::ecdh::diffie_hellman(self.0.to_nonzero_scalar(), public.as_affine());

        let mut out = [0; 32];
        out.copy_from_slice(shared.raw_secret_bytes().as_slice());
        Ok(SharedSecret(out))
    }
}
