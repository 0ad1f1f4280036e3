//! An implementation of the Bluetooth Mesh provisioning protocol.
//!
//! Provisioning is the procedure that turns an *unprovisioned device* into a mesh node: the
//! *Provisioner* and the device negotiate capabilities, exchange ephemeral P-256 public keys,
//! authenticate each other via confirmation values bound to an out-of-band secret, and finally
//! transfer the network key, primary element address, IV index and flags under a derived session
//! key. Both sides also derive the per-device key used to secure later configuration traffic.
//!
//! # Using the stack
//!
//! Like Rubble itself, this crate is runtime and hardware-agnostic: It does not need an RTOS or
//! allocator and talks to the outside world exclusively through traits the platform implements
//! once:
//! * A microsecond-precision [`Timer`].
//! * A [`FrameTransmitter`] that can put PB-ADV packets and unprovisioned device beacons on the
//!   air (or a [`GattWriter`] when provisioning runs over a connection).
//! * A cryptographically secure random number generator (`rand_core`).
//! * An [`EcdhProvider`] for the P-256 operations (a pure-Rust one is built in).
//!
//! The two protocol roles are [`Provisioner`] (the side adding a device to the network) and
//! [`Device`] (the side being added). Both are driven entirely by messages: bearer callbacks,
//! timer expiry, application actions and crypto completions all enter through the same small set
//! of entry points, so the state machines stay a pure function of `(state, event, session)`.
//!
//! [`Timer`]: time/trait.Timer.html
//! [`FrameTransmitter`]: bearer/trait.FrameTransmitter.html
//! [`GattWriter`]: bearer/trait.GattWriter.html
//! [`EcdhProvider`]: crypto/ecdh/trait.EcdhProvider.html
//! [`Provisioner`]: prov/provisioner/struct.Provisioner.html
//! [`Device`]: prov/device/struct.Device.html

#![no_std]

#[cfg(test)]
#[macro_use]
extern crate std;

#[macro_use]
mod log;
#[macro_use]
mod utils;
pub mod beacon;
pub mod bearer;
pub mod bytes;
mod config;
pub mod crypto;
mod error;
pub mod prov;
pub mod time;

pub use self::config::Config;
pub use self::error::Error;
