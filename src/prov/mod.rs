//! The provisioning protocol roles.
//!
//! [`Provisioner`] drives the protocol as the trusted side adding a device to the network;
//! [`Device`] is the unprovisioned side being added. Both are message-driven state machines: the
//! platform glue feeds them bearer callbacks ([`pdu_received`]/[`bearer_event`]), timer expiry
//! and application actions, and drains the [`BearerRequest`]s they emit into the active bearer.
//! Crypto completions re-enter the same message queue, so every state transition is a pure
//! function of the current state and one message.
//!
//! At most one session per role exists at a time, created by the `start_*`/`enter_*` calls and
//! torn down when a terminal event (`Complete` or `Failed`) is delivered.
//!
//! [`Provisioner`]: provisioner/struct.Provisioner.html
//! [`Device`]: device/struct.Device.html
//! [`pdu_received`]: provisioner/struct.Provisioner.html#method.pdu_received
//! [`bearer_event`]: provisioner/struct.Provisioner.html#method.bearer_event
//! [`BearerRequest`]: enum.BearerRequest.html

pub mod device;
pub mod oob;
pub mod pdu;
pub mod provisioner;
mod session;

pub use self::device::{Device, DeviceEvent, DeviceHandler, DeviceInfo};
pub use self::provisioner::{
    AuthSelection, Provisioner, ProvisionerEvent, ProvisionerHandler, SelectedAuth, SessionInfo,
};

use uuid::Uuid;

use crate::beacon::UnprovisionedBeacon;
use crate::bearer::CloseReason;
use crate::bytes::{ByteReader, ByteWriter};
use crate::crypto::ecdh::PublicKey;
use crate::prov::pdu::{PduBuf, DATA_SIZE};
use crate::time::Duration;

/// How long a role waits for an expected PDU (or for the link to close after a protocol error)
/// before giving up.
pub const TRANSACTION_TIMEOUT: Duration = Duration::from_secs(60);

/// An ECC key pair supplied by the application instead of being generated per session.
///
/// The secret is the raw big-endian P-256 scalar; it is turned into the provider's key type via
/// [`SecretKey::from_bytes`] when the ECDH runs.
///
/// [`SecretKey::from_bytes`]: ../crypto/ecdh/trait.SecretKey.html#tymethod.from_bytes
pub struct AppKeypair {
    /// The matching public key, sent to (or known out-of-band by) the peer.
    pub public: PublicKey,
    /// The raw secret scalar.
    pub secret: [u8; 32],
}

/// The payload delivered to the new node in the Provisioning Data PDU.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ProvisioningData {
    /// The network key.
    pub net_key: [u8; 16],
    /// Index of the network key.
    pub net_key_index: u16,
    /// Key refresh and IV update flags.
    pub flags: u8,
    /// Current IV index of the network.
    pub iv_index: u32,
    /// Unicast address of the node's primary element.
    pub address: u16,
}

impl ProvisioningData {
    /// Encodes the record into its 25-byte plaintext wire layout.
    pub(crate) fn pack(&self) -> [u8; DATA_SIZE] {
        let mut buf = [0; DATA_SIZE];
        let mut writer = ByteWriter::new(&mut buf);
        // The buffer is sized for exactly these fields.
        let _ = writer.write_slice(&self.net_key);
        let _ = writer.write_u16_be(self.net_key_index);
        let _ = writer.write_u8(self.flags);
        let _ = writer.write_u32_be(self.iv_index);
        let _ = writer.write_u16_be(self.address);
        debug_assert_eq!(writer.space_left(), 0);
        buf
    }

    /// Decodes the record from its decrypted wire layout.
    pub(crate) fn unpack(buf: &[u8; DATA_SIZE]) -> Self {
        let mut bytes = ByteReader::new(buf);
        // Infallible: the input has exactly the required size.
        Self {
            net_key: bytes.read_array().unwrap_or([0; 16]),
            net_key_index: bytes.read_u16_be().unwrap_or(0),
            flags: bytes.read_u8().unwrap_or(0),
            iv_index: bytes.read_u32_be().unwrap_or(0),
            address: bytes.read_u16_be().unwrap_or(0),
        }
    }
}

/// Why a provisioning session ended without success.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// The PB-ADV link could never be established.
    LinkNotEstablished,
    /// The peer closed the link (or the GATT connection dropped) mid-protocol.
    LinkClosedByPeer,
    /// The peer violated the protocol (bad PDU, unexpected PDU, or a Failed PDU was received).
    ProtocolError,
    /// An expected PDU did not arrive within the transaction timeout.
    ReceiveTimeout,
    /// The bearer gave up retransmitting an outgoing PDU.
    SendTimeout,
    /// The peer's public key was off-curve or otherwise unusable.
    InvalidPublicKey,
    /// The peer's confirmation value did not verify; the OOB values (or keys) of the two sides
    /// disagree.
    ConfirmationFailed,
}

/// Operations a role asks the bearer layer to perform.
///
/// The application glue pops these with `poll_request` and routes them to whichever bearer the
/// session runs on.
pub enum BearerRequest {
    /// Enable a PB-ADV client on the given advertising interface.
    EnableAdvClient {
        /// Advertising interface to use.
        if_id: u8,
    },

    /// Enable a PB-ADV server: broadcast `beacon` every `period` and listen for a Link Open.
    EnableAdvServer {
        /// Advertising interface to use.
        if_id: u8,
        /// The unprovisioned device beacon to broadcast.
        beacon: UnprovisionedBeacon,
        /// Beacon period.
        period: Duration,
    },

    /// Enable a PB-GATT client on an existing connection.
    EnableGattClient {
        /// The GATT connection to use.
        conn_id: u16,
    },

    /// Enable a PB-GATT server on an existing connection.
    EnableGattServer {
        /// The GATT connection to use.
        conn_id: u16,
    },

    /// Open a PB-ADV link to the device with this UUID (client only).
    OpenLink {
        /// Device UUID to scan for.
        uuid: Uuid,
    },

    /// Send a provisioning PDU.
    Send(PduBuf),

    /// Close the link, telling the peer why.
    Close(CloseReason),

    /// Drop the link without notifying the peer.
    CloseSilent,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provisioning_data_layout() {
        let data = ProvisioningData {
            net_key: [
                0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c,
                0x0d, 0x0e, 0x0f,
            ],
            net_key_index: 0x0102,
            flags: 0x01,
            iv_index: 0x1234_5678,
            address: 0x0005,
        };

        let packed = data.pack();
        assert_eq!(&packed[..16], &data.net_key);
        assert_eq!(&packed[16..18], &[0x01, 0x02]);
        assert_eq!(packed[18], 0x01);
        assert_eq!(&packed[19..23], &[0x12, 0x34, 0x56, 0x78]);
        assert_eq!(&packed[23..25], &[0x00, 0x05]);

        assert_eq!(ProvisioningData::unpack(&packed), data);
    }
}
