//! Per-session cryptographic state shared by both roles.
//!
//! The [`Transcript`] accumulates the ConfirmationInputs: the exact wire bytes of the negotiated
//! parameters and both public keys, in the fixed order the confirmation computation hashes them
//! in. [`Secrets`] holds everything derived from the transcript and the ECDH secret over the
//! course of a session.
//!
//! [`Transcript`]: struct.Transcript.html
//! [`Secrets`]: struct.Secrets.html

use crate::config::Config;
use crate::crypto::ecdh::{EcdhProvider, PublicKey};
use crate::crypto::{self, ccm, ecdh::SharedSecret};
use crate::prov::pdu::{
    CAPABILITIES_PARAM_SIZE, DATA_PARAM_SIZE, INVITE_PARAM_SIZE, PUBLIC_KEY_PARAM_SIZE,
    START_PARAM_SIZE,
};

/// An ephemeral key pair generated for one session.
pub struct OwnKeypair<C: Config> {
    pub secret: <C::Ecdh as EcdhProvider>::SecretKey,
    pub public: PublicKey,
}

/// Size of the ConfirmationInputs: Invite, Capabilities and Start parameters followed by both
/// public keys.
pub const CONFIRMATION_INPUTS_SIZE: usize = INVITE_PARAM_SIZE
    + CAPABILITIES_PARAM_SIZE
    + START_PARAM_SIZE
    + 2 * PUBLIC_KEY_PARAM_SIZE;

const CAPABILITIES_OFFSET: usize = INVITE_PARAM_SIZE;
const START_OFFSET: usize = CAPABILITIES_OFFSET + CAPABILITIES_PARAM_SIZE;
const PROVISIONER_KEY_OFFSET: usize = START_OFFSET + START_PARAM_SIZE;
const DEVICE_KEY_OFFSET: usize = PROVISIONER_KEY_OFFSET + PUBLIC_KEY_PARAM_SIZE;

/// The ConfirmationInputs both peers hash into the ConfirmationSalt.
///
/// Each region is written exactly once, with the raw parameter bytes as they appeared on the
/// wire (re-encoding parsed values could differ in RFU bits and break the confirmation).
pub struct Transcript {
    buf: [u8; CONFIRMATION_INPUTS_SIZE],
}

impl Transcript {
    pub fn new() -> Self {
        Self {
            buf: [0; CONFIRMATION_INPUTS_SIZE],
        }
    }

    pub fn set_invite(&mut self, param: &[u8]) {
        self.buf[..INVITE_PARAM_SIZE].copy_from_slice(param);
    }

    pub fn set_capabilities(&mut self, param: &[u8]) {
        self.buf[CAPABILITIES_OFFSET..START_OFFSET].copy_from_slice(param);
    }

    pub fn set_start(&mut self, param: &[u8]) {
        self.buf[START_OFFSET..PROVISIONER_KEY_OFFSET].copy_from_slice(param);
    }

    pub fn set_provisioner_key(&mut self, key: &[u8]) {
        self.buf[PROVISIONER_KEY_OFFSET..DEVICE_KEY_OFFSET].copy_from_slice(key);
    }

    pub fn set_device_key(&mut self, key: &[u8]) {
        self.buf[DEVICE_KEY_OFFSET..].copy_from_slice(key);
    }

    /// Computes `ConfirmationSalt = s1(ConfirmationInputs)`.
    pub fn confirmation_salt(&self) -> [u8; 16] {
        crypto::s1(&self.buf)
    }
}

/// Key material derived over the course of a session.
pub struct Secrets {
    /// The 16-byte AuthValue, filled in according to the selected OOB method before the local
    /// confirmation is computed.
    pub auth_value: [u8; 16],
    /// `s1(ConfirmationInputs)`, fixed once both public keys are known.
    pub confirmation_salt: [u8; 16],
    /// The Provisioner's Random value (the local one on the client, the peer's on the device).
    pub random_provisioner: [u8; 16],
    /// The device's Random value.
    pub random_device: [u8; 16],
    /// `k1(ECDHSecret, ConfirmationSalt, "prck")`.
    pub confirmation_key: [u8; 16],
    /// `k1(ECDHSecret, ProvisioningSalt, "prsk")`.
    pub session_key: [u8; 16],
    /// Low 13 bytes of `k1(ECDHSecret, ProvisioningSalt, "prsn")`.
    pub session_nonce: [u8; ccm::NONCE_LEN],
    /// `k1(ECDHSecret, ProvisioningSalt, "prdk")`; survives the session as the node's device
    /// key.
    pub device_key: [u8; 16],
    /// The confirmation value received from the peer, pending verification.
    pub peer_confirmation: [u8; 16],
    /// Scratch space for the provisioning data: plaintext before encryption resp. after
    /// decryption, ciphertext in between, with the MIC in the last 8 bytes.
    pub data_mic: [u8; DATA_PARAM_SIZE],
}

impl Secrets {
    pub fn new() -> Self {
        Self {
            auth_value: [0; 16],
            confirmation_salt: [0; 16],
            random_provisioner: [0; 16],
            random_device: [0; 16],
            confirmation_key: [0; 16],
            session_key: [0; 16],
            session_nonce: [0; ccm::NONCE_LEN],
            device_key: [0; 16],
            peer_confirmation: [0; 16],
            data_mic: [0; DATA_PARAM_SIZE],
        }
    }

    /// Derives the ConfirmationSalt and ConfirmationKey once the transcript is complete.
    pub fn derive_confirmation_key(&mut self, transcript: &Transcript, ecdh: &SharedSecret) {
        self.confirmation_salt = transcript.confirmation_salt();
        self.confirmation_key = crypto::k1(&self.confirmation_salt, &ecdh.0, b"prck");
    }

    /// Computes `CMAC(ConfirmationKey, random ‖ AuthValue)`.
    ///
    /// Ran once over the local Random to produce the value sent to the peer, and once over the
    /// peer's Random to verify the value received from it.
    pub fn confirmation(&self, random: &[u8; 16]) -> [u8; 16] {
        let mut msg = [0; 32];
        msg[..16].copy_from_slice(random);
        msg[16..].copy_from_slice(&self.auth_value);
        crypto::cmac(&self.confirmation_key, &msg)
    }

    /// Derives the session key, session nonce and device key once both Random values are known.
    pub fn derive_session_keys(&mut self, ecdh: &SharedSecret) {
        let mut input = [0; 48];
        input[..16].copy_from_slice(&self.confirmation_salt);
        input[16..32].copy_from_slice(&self.random_provisioner);
        input[32..].copy_from_slice(&self.random_device);
        let provisioning_salt = crypto::s1(&input);

        self.session_key = crypto::k1(&provisioning_salt, &ecdh.0, b"prsk");
        let nonce = crypto::k1(&provisioning_salt, &ecdh.0, b"prsn");
        self.session_nonce
            .copy_from_slice(&nonce[16 - ccm::NONCE_LEN..]);
        self.device_key = crypto::k1(&provisioning_salt, &ecdh.0, b"prdk");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transcript() -> Transcript {
        let mut t = Transcript::new();
        t.set_invite(&[0x00]);
        t.set_capabilities(&[0x01, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
        t.set_start(&[0x00, 0x00, 0x00, 0x00, 0x00]);
        t.set_provisioner_key(&[0x11; 64]);
        t.set_device_key(&[0x22; 64]);
        t
    }

    #[test]
    fn transcript_layout() {
        let t = transcript();
        assert_eq!(t.buf.len(), 145);
        assert_eq!(t.buf[0], 0x00);
        assert_eq!(t.buf[1], 0x01); // num_elements
        assert_eq!(t.buf[3], 0x01); // algorithms, low byte
        assert_eq!(&t.buf[17..81], &[0x11; 64][..]);
        assert_eq!(&t.buf[81..145], &[0x22; 64][..]);
    }

    #[test]
    fn both_sides_derive_identical_keys() {
        let ecdh = SharedSecret([0xab; 32]);
        let t = transcript();

        let mut provisioner = Secrets::new();
        let mut device = Secrets::new();
        for secrets in [&mut provisioner, &mut device].iter_mut() {
            secrets.derive_confirmation_key(&t, &ecdh);
            secrets.random_provisioner = [0x01; 16];
            secrets.random_device = [0x02; 16];
            secrets.derive_session_keys(&ecdh);
        }

        assert_eq!(provisioner.device_key, device.device_key);
        assert_eq!(provisioner.session_key, device.session_key);
        assert_eq!(provisioner.session_nonce, device.session_nonce);
    }

    #[test]
    fn confirmation_depends_on_every_auth_value_bit() {
        let ecdh = SharedSecret([0x55; 32]);
        let t = transcript();

        let mut secrets = Secrets::new();
        secrets.derive_confirmation_key(&t, &ecdh);
        let random = [0x33; 16];
        let baseline = secrets.confirmation(&random);

        for byte in 0..16 {
            for bit in 0..8 {
                secrets.auth_value = [0; 16];
                secrets.auth_value[byte] ^= 1 << bit;
                assert_ne!(secrets.confirmation(&random), baseline);
            }
        }
    }

    #[test]
    fn randoms_feed_session_derivation() {
        let ecdh = SharedSecret([0x77; 32]);
        let t = transcript();

        let mut a = Secrets::new();
        a.derive_confirmation_key(&t, &ecdh);
        a.random_provisioner = [0x01; 16];
        a.random_device = [0x02; 16];
        a.derive_session_keys(&ecdh);

        let mut b = Secrets::new();
        b.derive_confirmation_key(&t, &ecdh);
        b.random_provisioner = [0x01; 16];
        b.random_device = [0x03; 16];
        b.derive_session_keys(&ecdh);

        assert_ne!(a.session_key, b.session_key);
        assert_ne!(a.session_nonce, b.session_nonce);
        assert_ne!(a.device_key, b.device_key);
    }
}
