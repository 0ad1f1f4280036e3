//! Stack configuration trait.

use rand_core::{CryptoRng, RngCore};

use crate::{crypto::ecdh::EcdhProvider, time::Timer};

/// Trait for provisioning stack configurations.
///
/// This trait defines a number of types to be used throughout the provisioning roles, which
/// define the platform services the stack builds on.
///
/// Every application must define a type implementing this trait and supply it to the stack.
pub trait Config {
    /// A time source with microsecond resolution.
    type Timer: Timer;

    /// A cryptographically secure random number generator.
    ///
    /// This is used for the per-session Random values, the link IDs and transmission jitter of
    /// the PB-ADV bearer, and ECC key generation, so it must be seeded from real entropy.
    type Rng: RngCore + CryptoRng;

    /// The provider of the P-256 operations (key generation and ECDH).
    type Ecdh: EcdhProvider;
}

// Helper alias: the provider-defined secret key type of a configuration.
pub(crate) type ConfSecretKey<C> = <<C as Config>::Ecdh as EcdhProvider>::SecretKey;
