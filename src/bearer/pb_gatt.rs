//! The PB-GATT bearer: one provisioning PDU per connection write.
//!
//! When provisioning runs over a GATT connection (through the Mesh Provisioning Service), the
//! Proxy protocol below already provides ordering, reliability and segmentation, so this bearer
//! is little more than a length check on either side of the [`GattWriter`]. Delivery
//! confirmation degenerates to "the write was issued", and closing the link simply surfaces as a
//! closed connection.
//!
//! [`GattWriter`]: ../trait.GattWriter.html

use crate::bearer::{BearerEvent, GattWriter, PbHandler};
use crate::prov::pdu::{Opcode, MAX_PDU_SIZE};
use crate::Error;

/// The PB-GATT provisioning bearer.
pub struct PbGatt {
    conn_id: u16,
}

impl PbGatt {
    /// Creates a bearer on top of the GATT connection identified by `conn_id`.
    pub fn new(conn_id: u16) -> Self {
        Self { conn_id }
    }

    /// Returns the ID of the underlying GATT connection.
    pub fn conn_id(&self) -> u16 {
        self.conn_id
    }

    /// Sends a provisioning PDU in a single write and reports it as sent.
    pub fn send_pdu<W, H>(&mut self, writer: &mut W, handler: &mut H, pdu: &[u8]) -> Result<(), Error>
    where
        W: GattWriter,
        H: PbHandler,
    {
        if pdu.is_empty() || pdu.len() > MAX_PDU_SIZE {
            return Err(Error::InvalidLength);
        }

        writer.write_pdu(pdu);
        handler.bearer_event(BearerEvent::PduSent(Opcode::from(pdu[0])));
        Ok(())
    }

    /// Handles a provisioning PDU received in a connection write.
    pub fn pdu_received<H: PbHandler>(&mut self, handler: &mut H, pdu: &[u8]) {
        if pdu.is_empty() || pdu.len() > MAX_PDU_SIZE {
            warn!("pb-gatt: dropping write of {} bytes", pdu.len());
            return;
        }

        handler.pdu_received(pdu);
    }

    /// Reports the underlying connection as closed.
    ///
    /// PB-GATT has no Link Close PDU; both a deliberate close and a dropped connection surface
    /// as `ConnClosed`.
    pub fn close<H: PbHandler>(&mut self, handler: &mut H) {
        handler.bearer_event(BearerEvent::ConnClosed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::vec::Vec;

    #[derive(Default)]
    struct Writes(Vec<Vec<u8>>);

    impl GattWriter for Writes {
        fn write_pdu(&mut self, pdu: &[u8]) {
            self.0.push(pdu.to_vec());
        }
    }

    #[derive(Default)]
    struct Sink {
        pdus: Vec<Vec<u8>>,
        events: Vec<BearerEvent>,
    }

    impl PbHandler for Sink {
        fn pdu_received(&mut self, pdu: &[u8]) {
            self.pdus.push(pdu.to_vec());
        }
        fn bearer_event(&mut self, event: BearerEvent) {
            self.events.push(event);
        }
    }

    #[test]
    fn send_reports_sent_immediately() {
        let mut bearer = PbGatt::new(7);
        let mut writes = Writes::default();
        let mut sink = Sink::default();

        bearer.send_pdu(&mut writes, &mut sink, &[0x00, 0x05]).unwrap();
        assert_eq!(writes.0, vec![vec![0x00, 0x05]]);
        assert_eq!(sink.events, vec![BearerEvent::PduSent(Opcode::Invite)]);
    }

    #[test]
    fn oversized_pdu_is_rejected() {
        let mut bearer = PbGatt::new(7);
        let mut writes = Writes::default();
        let mut sink = Sink::default();

        assert_eq!(
            bearer.send_pdu(&mut writes, &mut sink, &[0; MAX_PDU_SIZE + 1]),
            Err(Error::InvalidLength),
        );
        assert!(writes.0.is_empty());
    }

    #[test]
    fn receive_and_close() {
        let mut bearer = PbGatt::new(7);
        let mut sink = Sink::default();

        bearer.pdu_received(&mut sink, &[0x08]);
        bearer.pdu_received(&mut sink, &[]);
        bearer.close(&mut sink);

        assert_eq!(sink.pdus, vec![vec![0x08]]);
        assert_eq!(sink.events, vec![BearerEvent::ConnClosed]);
    }
}
