//! Provisioning bearers.
//!
//! Provisioning PDUs travel over one of two bearers: PB-ADV, which segments them into
//! advertising-channel packets with its own little reliability layer, and PB-GATT, where a
//! connection carries one whole PDU per write. Both present the same contract to the role state
//! machines sitting on top:
//!
//! * Downward, PDUs are handed to [`PbAdv::send_pdu`] / [`PbGatt::send_pdu`] and links are
//!   closed with a reason code.
//! * Upward, reassembled PDUs and link lifecycle events are delivered through the [`PbHandler`]
//!   trait.
//!
//! The bearers do not touch the radio directly; PB-ADV emits its packets through a
//! [`FrameTransmitter`] and PB-GATT through a [`GattWriter`], both implemented by the platform.
//!
//! [`PbAdv::send_pdu`]: struct.PbAdv.html#method.send_pdu
//! [`PbGatt::send_pdu`]: struct.PbGatt.html#method.send_pdu
//! [`PbHandler`]: trait.PbHandler.html
//! [`FrameTransmitter`]: trait.FrameTransmitter.html
//! [`GattWriter`]: trait.GattWriter.html

mod pb_adv;
mod pb_gatt;

pub use self::pb_adv::PbAdv;
pub use self::pb_gatt::PbGatt;

use crate::prov::pdu::Opcode;

/// The role a bearer instance plays on an unprovisioned link.
///
/// The role decides which transaction number range the bearer allocates from: the Provisioner
/// (client) side uses `0x00..=0x7F`, the device (server) side `0x80..=0xFF`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Role {
    /// The Provisioner side, which opens the link.
    Client,
    /// The unprovisioned device side, which beacons and accepts the link.
    Server,
}

enum_with_unknown! {
    /// Reason code carried in the PB-ADV Link Close control PDU.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum CloseReason(u8) {
        /// Provisioning completed successfully.
        Success = 0x00,
        /// A transaction timed out.
        Timeout = 0x01,
        /// Provisioning failed.
        Fail = 0x02,
    }
}

/// Events a bearer delivers to the role on top of it.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BearerEvent {
    /// The link to the peer is established; provisioning PDUs can now be exchanged.
    LinkOpened,

    /// The link could not be established within the link establishment timeout.
    LinkFailed,

    /// The peer closed the link with the given reason.
    LinkClosed(CloseReason),

    /// The PDU handed to `send_pdu` has been delivered (PB-ADV: the transaction was
    /// acknowledged; PB-GATT: the write was issued).
    PduSent(Opcode),

    /// The peer never acknowledged an outgoing transaction; the bearer gave up retransmitting.
    SendTimeout,

    /// The underlying GATT connection was closed.
    ConnClosed,
}

/// Callbacks through which a bearer hands received PDUs and events to the layer above.
pub trait PbHandler {
    /// A complete provisioning PDU has been received (and acknowledged, on PB-ADV).
    fn pdu_received(&mut self, pdu: &[u8]);

    /// A link lifecycle or transmission event occurred.
    fn bearer_event(&mut self, event: BearerEvent);
}

/// Trait for platforms that can put PB-ADV packets on the air.
///
/// Implementations wrap each payload in the `PB-ADV` resp. `Mesh Beacon` advertising structure
/// and broadcast it on the advertising channels; how that happens (and on which interface) is
/// entirely up to the platform.
pub trait FrameTransmitter {
    /// Broadcasts a PB-ADV packet (starting with the Link ID).
    fn transmit_frame(&mut self, frame: &[u8]);

    /// Broadcasts an unprovisioned device beacon payload (starting with the beacon type).
    fn transmit_beacon(&mut self, beacon: &[u8]);
}

/// Trait for platforms carrying PB-GATT: one write per provisioning PDU.
pub trait GattWriter {
    /// Sends a whole provisioning PDU in a single Proxy write.
    fn write_pdu(&mut self, pdu: &[u8]);
}
