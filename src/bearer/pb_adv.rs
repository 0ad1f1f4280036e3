//! The PB-ADV bearer: segmented, acknowledged provisioning PDU transfer over advertising
//! packets.
//!
//! Every PB-ADV packet carries a 4-byte Link ID, a 1-byte transaction number and a *Generic
//! Provisioning PDU* whose two low bits (the GPCF) select one of four formats:
//!
//! ```notrust
//! LSB                                          MSB
//! +----------+-----------------+
//! |  GPCF    |  format-specific |
//! | (2 bits) |  (6 bits)        |  + payload
//! +----------+-----------------+
//!
//! GPCF 0b00: Transaction Start        (SegN, TotalLength, FCS, first data chunk)
//! GPCF 0b01: Transaction Acknowledgment
//! GPCF 0b10: Transaction Continuation (SegmentIndex, data chunk)
//! GPCF 0b11: Provisioning Bearer Control (Link Open / Link Ack / Link Close)
//! ```
//!
//! A provisioning PDU is split into a Start segment of up to 20 bytes and Continuation segments
//! of up to 23 bytes, all of which are retransmitted until the whole transaction is acknowledged
//! or the 60 second transaction timeout expires. Each outgoing packet is delayed by a random
//! 20–50 ms to avoid synchronizing with other advertisers.
//!
//! The link itself is established by the client sending Link Open (after having seen an
//! unprovisioned device beacon with the wanted Device UUID) and the server answering with
//! Link Ack, and torn down with Link Close carrying a [`CloseReason`].
//!
//! [`CloseReason`]: ../enum.CloseReason.html

use byteorder::{BigEndian, ByteOrder};
use heapless::Deque;
use rand_core::RngCore;
use uuid::Uuid;

use crate::beacon::UnprovisionedBeacon;
use crate::bearer::{BearerEvent, CloseReason, FrameTransmitter, PbHandler, Role};
use crate::bytes::{ByteReader, ByteWriter, FromBytes, ToBytes};
use crate::prov::pdu::{Opcode, MAX_PDU_SIZE};
use crate::time::{Duration, Instant};
use crate::utils::HexSlice;
use crate::Error;

/// Maximum on-air size of a PB-ADV packet: Link ID, transaction number and a full generic PDU.
pub const MAX_FRAME_SIZE: usize = 4 + 1 + MAX_GENERIC_PDU_SIZE;

/// Maximum size of a Generic Provisioning PDU.
const MAX_GENERIC_PDU_SIZE: usize = 24;

/// Maximum payload of a Transaction Start segment (4 bytes of header).
const SEG0_MAX_DATA: usize = MAX_GENERIC_PDU_SIZE - 4;

/// Maximum payload of a Transaction Continuation segment (1 byte of header).
const SEGX_MAX_DATA: usize = MAX_GENERIC_PDU_SIZE - 1;

/// GPCF values in the low 2 bits of the first generic PDU byte.
const GPCF_START: u8 = 0x00;
const GPCF_ACK: u8 = 0x01;
const GPCF_CONTINUATION: u8 = 0x02;
const GPCF_CONTROL: u8 = 0x03;

/// Bearer control opcodes (upper 6 bits of the first byte when GPCF is Control).
const CTRL_LINK_OPEN: u8 = 0x00;
const CTRL_LINK_ACK: u8 = 0x01;
const CTRL_LINK_CLOSE: u8 = 0x02;

/// Link control PDUs always use transaction number 0.
const CTRL_TRAN_NUM: u8 = 0x00;

/// How long an unacknowledged transaction is retransmitted before giving up.
const TRANSACTION_TIMEOUT: Duration = Duration::from_micros(60_000_000);

/// How long the client tries to establish a link before reporting failure.
const LINK_TIMEOUT: Duration = Duration::from_micros(60_000_000);

/// Gap between two retransmission rounds of the same transaction.
const RETRANSMIT_GAP: Duration = Duration::from_micros(200_000);

/// Number of Link Close packets emitted on close (Link Close is not acknowledged).
const LINK_CLOSE_REPEATS: usize = 3;

/// A single PB-ADV packet ready for the air.
#[derive(Copy, Clone)]
struct Frame {
    buf: [u8; MAX_FRAME_SIZE],
    len: u8,
}

impl Frame {
    fn new(link_id: u32, tran_num: u8, generic: &[u8]) -> Self {
        debug_assert!(generic.len() <= MAX_GENERIC_PDU_SIZE);

        let mut buf = [0; MAX_FRAME_SIZE];
        BigEndian::write_u32(&mut buf[..4], link_id);
        buf[4] = tran_num;
        buf[5..5 + generic.len()].copy_from_slice(generic);
        Self {
            buf,
            len: (5 + generic.len()) as u8,
        }
    }

    fn bytes(&self) -> &[u8] {
        &self.buf[..usize::from(self.len)]
    }
}

/// A control or acknowledgment packet scheduled for a jittered transmit time.
struct PendingFrame {
    frame: Frame,
    due: Instant,
}

/// State of the outgoing transaction.
struct TxTransaction {
    pdu: [u8; MAX_PDU_SIZE],
    len: u8,
    opcode: Opcode,
    tran_num: u8,
    last_seg: u8,
    /// Segment to put on the air next.
    next_seg: u8,
    started: Instant,
    next_tx: Instant,
}

/// Reassembly state of the incoming transaction.
struct RxTransaction {
    tran_num: u8,
    total_len: usize,
    last_seg: u8,
    fcs: u8,
    /// One bit per received segment; the generic PDU format allows up to 64.
    received: u64,
    buf: [u8; MAX_PDU_SIZE],
}

impl RxTransaction {
    fn is_complete(&self) -> bool {
        let count = u32::from(self.last_seg) + 1;
        let needed = if count >= 64 {
            u64::max_value()
        } else {
            (1u64 << count) - 1
        };
        self.received == needed
    }
}

/// Periodic unprovisioned device beacon broadcast.
struct BeaconTx {
    payload: [u8; crate::beacon::MAX_BEACON_SIZE],
    len: u8,
    period: Duration,
    next: Instant,
}

enum LinkState {
    /// Nothing in progress (client before `open`, either side after the link went down).
    Idle,

    /// Server: beaconing and listening for a Link Open.
    Listening,

    /// Client: waiting for an unprovisioned device beacon carrying the wanted UUID.
    Scanning { uuid: Uuid, started: Instant },

    /// Client: retransmitting Link Open until the Link Ack arrives.
    Opening {
        uuid: Uuid,
        started: Instant,
        next_tx: Instant,
    },

    /// Link established; transactions may flow.
    Open,
}

/// The PB-ADV provisioning bearer.
///
/// One instance handles one unprovisioned link end-to-end: beaconing/scanning, link
/// establishment, segmentation and reassembly with acknowledgments and retransmission, and link
/// teardown. It is driven by the platform feeding received packets into [`process_frame`] /
/// [`process_beacon`] and calling [`tick`] whenever the deadline returned by [`next_wakeup`]
/// passes.
///
/// [`process_frame`]: #method.process_frame
/// [`process_beacon`]: #method.process_beacon
/// [`tick`]: #method.tick
/// [`next_wakeup`]: #method.next_wakeup
pub struct PbAdv<R: RngCore> {
    rng: R,
    role: Role,
    state: LinkState,
    link_id: u32,
    /// Device UUID this link is for (the server's own UUID; on the client, the peer's).
    uuid: Uuid,
    next_tran_num: u8,
    tx: Option<TxTransaction>,
    /// One provisioning PDU accepted while the previous transaction was still unacknowledged.
    ///
    /// The state machines may answer a retransmitted PDU before their own last send completed;
    /// the answer starts its transaction as soon as the acknowledgment arrives.
    tx_next: Option<([u8; MAX_PDU_SIZE], u8)>,
    rx: Option<RxTransaction>,
    /// Transaction number of the last fully delivered transaction, for duplicate re-acking.
    last_delivered: Option<u8>,
    pending: Deque<PendingFrame, 8>,
    beacon: Option<BeaconTx>,
}

impl<R: RngCore> PbAdv<R> {
    /// Creates a client-side (Provisioner) bearer.
    ///
    /// The bearer is idle until [`open`] is called.
    ///
    /// [`open`]: #method.open
    pub fn client(rng: R) -> Self {
        Self {
            rng,
            role: Role::Client,
            state: LinkState::Idle,
            link_id: 0,
            uuid: Uuid::nil(),
            next_tran_num: first_tran_num(Role::Client),
            tx: None,
            tx_next: None,
            rx: None,
            last_delivered: None,
            pending: Deque::new(),
            beacon: None,
        }
    }

    /// Creates a server-side (device) bearer that beacons at `period` until a link opens.
    pub fn server(rng: R, now: Instant, beacon: &UnprovisionedBeacon, period: Duration) -> Self {
        let mut payload = [0; crate::beacon::MAX_BEACON_SIZE];
        let mut writer = ByteWriter::new(&mut payload);
        // The beacon always fits its maximum-size buffer.
        let len = match beacon.to_bytes(&mut writer) {
            Ok(()) => crate::beacon::MAX_BEACON_SIZE - writer.space_left(),
            Err(_) => 0,
        };

        Self {
            rng,
            role: Role::Server,
            state: LinkState::Listening,
            link_id: 0,
            uuid: beacon.uuid,
            next_tran_num: first_tran_num(Role::Server),
            tx: None,
            tx_next: None,
            rx: None,
            last_delivered: None,
            pending: Deque::new(),
            beacon: Some(BeaconTx {
                payload,
                len: len as u8,
                period,
                next: now,
            }),
        }
    }

    /// Returns whether the link is established.
    pub fn is_open(&self) -> bool {
        matches!(self.state, LinkState::Open)
    }

    /// Starts establishing a link with the device identified by `uuid` (client only).
    ///
    /// The bearer scans for a matching unprovisioned device beacon, then retransmits Link Open
    /// until the Link Ack arrives. If no link exists after 60 seconds, a `LinkFailed` event is
    /// delivered from [`tick`].
    ///
    /// [`tick`]: #method.tick
    pub fn open(&mut self, now: Instant, uuid: Uuid) -> Result<(), Error> {
        if self.role != Role::Client || !matches!(self.state, LinkState::Idle) {
            return Err(Error::InvalidState);
        }

        info!("pb-adv: scanning for {:?}", uuid);
        self.state = LinkState::Scanning { uuid, started: now };
        Ok(())
    }

    /// Closes the link, notifying the peer with the given reason.
    ///
    /// This does *not* produce a `LinkClosed` event; the caller initiated the close and is
    /// already aware of it.
    pub fn close(&mut self, now: Instant, reason: CloseReason) {
        if matches!(self.state, LinkState::Open | LinkState::Opening { .. }) {
            let generic = [(CTRL_LINK_CLOSE << 2) | GPCF_CONTROL, reason.into()];
            let frame = Frame::new(self.link_id, CTRL_TRAN_NUM, &generic);

            // Link Close is not acknowledged, so it is repeated a fixed number of times.
            let mut due = now;
            for _ in 0..LINK_CLOSE_REPEATS {
                due = due + self.tx_jitter();
                self.schedule(PendingFrame { frame, due });
            }
        }

        self.reset();
    }

    /// Drops all link state without notifying the peer.
    pub fn close_silent(&mut self) {
        self.pending.clear();
        self.reset();
    }

    /// Queues a provisioning PDU for transmission as a single transaction.
    ///
    /// Only one transaction is on the air at a time; the PDU is retransmitted until the peer's
    /// acknowledgment produces a `PduSent` event, or until the transaction timeout produces
    /// `SendTimeout`. One more PDU is accepted while a transaction is still unacknowledged and
    /// starts once the acknowledgment arrives.
    pub fn send_pdu(&mut self, now: Instant, pdu: &[u8]) -> Result<(), Error> {
        if !self.is_open() {
            return Err(Error::InvalidState);
        }
        if pdu.is_empty() || pdu.len() > MAX_PDU_SIZE {
            return Err(Error::InvalidLength);
        }

        if self.tx.is_some() {
            if self.tx_next.is_some() {
                return Err(Error::InvalidState);
            }
            let mut buf = [0; MAX_PDU_SIZE];
            buf[..pdu.len()].copy_from_slice(pdu);
            self.tx_next = Some((buf, pdu.len() as u8));
            return Ok(());
        }

        self.start_transaction(now, pdu);
        Ok(())
    }

    fn start_transaction(&mut self, now: Instant, pdu: &[u8]) {
        let tran_num = self.next_tran_num;
        self.next_tran_num = next_tran_num(self.role, tran_num);

        let mut buf = [0; MAX_PDU_SIZE];
        buf[..pdu.len()].copy_from_slice(pdu);
        let next_tx = now + self.tx_jitter();
        self.tx = Some(TxTransaction {
            pdu: buf,
            len: pdu.len() as u8,
            opcode: Opcode::from(pdu[0]),
            tran_num,
            last_seg: last_seg_for_len(pdu.len()),
            next_seg: 0,
            started: now,
            next_tx,
        });

        trace!("pb-adv: tx transaction {} ({} bytes)", tran_num, pdu.len());
    }

    /// Processes a received mesh beacon payload (client only).
    ///
    /// While scanning, a beacon whose Device UUID matches the one passed to [`open`] triggers
    /// the Link Open exchange. All other beacons are ignored.
    ///
    /// [`open`]: #method.open
    pub fn process_beacon(&mut self, now: Instant, payload: &[u8]) {
        let wanted = match &self.state {
            LinkState::Scanning { uuid, .. } => *uuid,
            _ => return,
        };

        let beacon = match UnprovisionedBeacon::from_bytes(&mut ByteReader::new(payload)) {
            Ok(beacon) => beacon,
            Err(_) => return,
        };
        if beacon.uuid != wanted {
            return;
        }

        let started = match self.state {
            LinkState::Scanning { started, .. } => started,
            _ => unreachable!(),
        };

        self.link_id = self.rng.next_u32();
        info!(
            "pb-adv: found {:?}, opening link {:08x}",
            wanted, self.link_id
        );
        let next_tx = now + self.tx_jitter();
        self.state = LinkState::Opening {
            uuid: wanted,
            started,
            next_tx,
        };
    }

    /// Processes a received PB-ADV packet.
    pub fn process_frame<H: PbHandler>(&mut self, now: Instant, frame: &[u8], handler: &mut H) {
        if frame.len() < 6 || frame.len() > MAX_FRAME_SIZE {
            return;
        }

        let link_id = BigEndian::read_u32(&frame[..4]);
        let tran_num = frame[4];
        let generic = &frame[5..];

        match generic[0] & 0x03 {
            GPCF_CONTROL => self.process_control(now, link_id, generic, handler),
            GPCF_ACK => self.process_ack(now, link_id, tran_num, generic, handler),
            GPCF_START => self.process_start(now, link_id, tran_num, generic, handler),
            GPCF_CONTINUATION => self.process_continuation(now, link_id, tran_num, generic, handler),
            _ => unreachable!(),
        }
    }

    /// Returns when [`tick`] wants to run next, or `None` when the bearer is completely idle.
    ///
    /// [`tick`]: #method.tick
    pub fn next_wakeup(&self) -> Option<Instant> {
        let mut wakeup: Option<Instant> = None;
        let mut consider = |at: Instant| {
            wakeup = Some(match wakeup {
                Some(cur) if at.is_after(cur) => cur,
                _ => at,
            });
        };

        if let Some(beacon) = &self.beacon {
            consider(beacon.next);
        }
        if let Some(front) = self.pending.front() {
            consider(front.due);
        }
        match &self.state {
            LinkState::Scanning { started, .. } => consider(*started + LINK_TIMEOUT),
            LinkState::Opening {
                started, next_tx, ..
            } => {
                consider(*started + LINK_TIMEOUT);
                consider(*next_tx);
            }
            _ => {}
        }
        if let Some(tx) = &self.tx {
            consider(tx.started + TRANSACTION_TIMEOUT);
            consider(tx.next_tx);
        }

        wakeup
    }

    /// Runs all timer-driven work that is due at `now`: beacon broadcasts, (re)transmissions,
    /// and the link establishment and transaction timeouts.
    pub fn tick<T, H>(&mut self, now: Instant, tx: &mut T, handler: &mut H)
    where
        T: FrameTransmitter,
        H: PbHandler,
    {
        // Beacon broadcast.
        if let Some(beacon) = &mut self.beacon {
            if now.is_after(beacon.next) {
                tx.transmit_beacon(&beacon.payload[..usize::from(beacon.len)]);
                beacon.next = now + beacon.period;
            }
        }

        // One-shot control and acknowledgment frames.
        while let Some(front) = self.pending.front() {
            if !now.is_after(front.due) {
                break;
            }
            let frame = self.pending.pop_front().unwrap_or_else(|| unreachable!());
            tx.transmit_frame(frame.frame.bytes());
        }

        // Link establishment.
        match &self.state {
            LinkState::Scanning { started, .. } => {
                if now.duration_since(*started) >= LINK_TIMEOUT {
                    info!("pb-adv: no beacon within link timeout");
                    self.reset();
                    handler.bearer_event(BearerEvent::LinkFailed);
                }
            }
            LinkState::Opening {
                uuid,
                started,
                next_tx,
            } => {
                if now.duration_since(*started) >= LINK_TIMEOUT {
                    info!("pb-adv: link establishment timed out");
                    self.reset();
                    handler.bearer_event(BearerEvent::LinkFailed);
                } else if now.is_after(*next_tx) {
                    let mut generic = [0; 17];
                    generic[0] = (CTRL_LINK_OPEN << 2) | GPCF_CONTROL;
                    generic[1..].copy_from_slice(uuid.as_bytes());
                    let frame = Frame::new(self.link_id, CTRL_TRAN_NUM, &generic);
                    tx.transmit_frame(frame.bytes());

                    let (uuid, started) = (*uuid, *started);
                    let next_tx = now + self.tx_jitter();
                    self.state = LinkState::Opening {
                        uuid,
                        started,
                        next_tx,
                    };
                }
            }
            _ => {}
        }

        // Outgoing transaction: timeout, then retransmission.
        let timed_out = match &self.tx {
            Some(t) => now.duration_since(t.started) >= TRANSACTION_TIMEOUT,
            None => false,
        };
        if timed_out {
            warn!("pb-adv: transaction never acknowledged");
            self.tx = None;
            self.tx_next = None;
            handler.bearer_event(BearerEvent::SendTimeout);
        }

        let due_seg = match &self.tx {
            Some(t) if now.is_after(t.next_tx) => Some(t.next_seg),
            _ => None,
        };
        if let Some(seg) = due_seg {
            let frame = {
                let t = self.tx.as_ref().unwrap_or_else(|| unreachable!());
                segment_frame(self.link_id, t, seg)
            };
            tx.transmit_frame(frame.bytes());

            let mut delay = self.tx_jitter();
            let t = self.tx.as_mut().unwrap_or_else(|| unreachable!());
            if t.next_seg == t.last_seg {
                // Finished a full round; pause before repeating the transaction.
                t.next_seg = 0;
                delay = delay + RETRANSMIT_GAP;
            } else {
                t.next_seg += 1;
            }
            t.next_tx = now + delay;
        }
    }

    fn process_control<H: PbHandler>(
        &mut self,
        now: Instant,
        link_id: u32,
        generic: &[u8],
        handler: &mut H,
    ) {
        match generic[0] >> 2 {
            CTRL_LINK_OPEN => {
                if self.role != Role::Server || generic.len() != 17 {
                    return;
                }
                if generic[1..] != self.uuid.as_bytes()[..] {
                    return;
                }

                match self.state {
                    LinkState::Listening => {
                        info!("pb-adv: link {:08x} opened by peer", link_id);
                        self.link_id = link_id;
                        self.state = LinkState::Open;
                        self.beacon = None;
                        self.queue_link_ack(now);
                        handler.bearer_event(BearerEvent::LinkOpened);
                    }
                    // The peer missed our ack and retries; answer again without re-opening.
                    LinkState::Open if self.link_id == link_id => self.queue_link_ack(now),
                    _ => {}
                }
            }

            CTRL_LINK_ACK => {
                if generic.len() != 1 || link_id != self.link_id {
                    return;
                }
                if let LinkState::Opening { .. } = self.state {
                    info!("pb-adv: link {:08x} acknowledged", link_id);
                    self.state = LinkState::Open;
                    handler.bearer_event(BearerEvent::LinkOpened);
                }
            }

            CTRL_LINK_CLOSE => {
                if generic.len() != 2 || link_id != self.link_id {
                    return;
                }
                if matches!(self.state, LinkState::Open | LinkState::Opening { .. }) {
                    let reason = CloseReason::from(generic[1]);
                    info!("pb-adv: link closed by peer ({:?})", reason);
                    self.reset();
                    handler.bearer_event(BearerEvent::LinkClosed(reason));
                }
            }

            _ => {}
        }
    }

    fn process_ack<H: PbHandler>(
        &mut self,
        now: Instant,
        link_id: u32,
        tran_num: u8,
        generic: &[u8],
        handler: &mut H,
    ) {
        if generic.len() != 1 || link_id != self.link_id || !self.is_open() {
            return;
        }

        let acked = match &self.tx {
            Some(t) if t.tran_num == tran_num => t.opcode,
            _ => return,
        };

        trace!("pb-adv: transaction {} acknowledged", tran_num);
        self.tx = None;
        if let Some((buf, len)) = self.tx_next.take() {
            self.start_transaction(now, &buf[..usize::from(len)]);
        }
        handler.bearer_event(BearerEvent::PduSent(acked));
    }

    fn process_start<H: PbHandler>(
        &mut self,
        now: Instant,
        link_id: u32,
        tran_num: u8,
        generic: &[u8],
        handler: &mut H,
    ) {
        if link_id != self.link_id || !self.is_open() || generic.len() < 5 {
            return;
        }

        // A retransmission of a transaction we already delivered means the peer missed our
        // acknowledgment: re-ack, but do not deliver the PDU again.
        if self.last_delivered == Some(tran_num) {
            self.queue_ack(now, tran_num);
            return;
        }

        let last_seg = generic[0] >> 2;
        let total_len = usize::from(BigEndian::read_u16(&generic[1..3]));
        let fcs = generic[3];
        let data = &generic[4..];

        if total_len == 0 || total_len > MAX_PDU_SIZE {
            warn!("pb-adv: transaction start with bad length {}", total_len);
            return;
        }
        if last_seg != last_seg_for_len(total_len) {
            return;
        }
        if data.len() != total_len.min(SEG0_MAX_DATA) {
            return;
        }

        match &self.rx {
            // Duplicate start segment of the transaction currently being reassembled.
            Some(rx) if rx.tran_num == tran_num => {
                if rx.received & 1 != 0 {
                    return;
                }
            }
            _ => {
                self.rx = Some(RxTransaction {
                    tran_num,
                    total_len,
                    last_seg,
                    fcs,
                    received: 0,
                    buf: [0; MAX_PDU_SIZE],
                });
            }
        }

        let rx = self.rx.as_mut().unwrap_or_else(|| unreachable!());
        rx.buf[..data.len()].copy_from_slice(data);
        rx.received |= 1;

        self.try_deliver(now, handler);
    }

    fn process_continuation<H: PbHandler>(
        &mut self,
        now: Instant,
        link_id: u32,
        tran_num: u8,
        generic: &[u8],
        handler: &mut H,
    ) {
        if link_id != self.link_id || !self.is_open() || generic.len() < 2 {
            return;
        }

        let seg = generic[0] >> 2;
        let data = &generic[1..];

        let rx = match &mut self.rx {
            Some(rx) if rx.tran_num == tran_num => rx,
            _ => return,
        };
        if seg == 0 || seg > rx.last_seg {
            return;
        }

        let offset = SEG0_MAX_DATA + usize::from(seg - 1) * SEGX_MAX_DATA;
        let expected = (rx.total_len - offset).min(SEGX_MAX_DATA);
        if data.len() != expected {
            return;
        }
        if rx.received & (1 << seg) != 0 {
            // Duplicate segment.
            return;
        }

        rx.buf[offset..offset + data.len()].copy_from_slice(data);
        rx.received |= 1 << seg;

        self.try_deliver(now, handler);
    }

    fn try_deliver<H: PbHandler>(&mut self, now: Instant, handler: &mut H) {
        let complete = matches!(&self.rx, Some(rx) if rx.is_complete());
        if !complete {
            return;
        }

        let rx = self.rx.take().unwrap_or_else(|| unreachable!());
        let pdu = &rx.buf[..rx.total_len];
        if fcs(pdu) != rx.fcs {
            warn!("pb-adv: FCS mismatch, dropping transaction {}", rx.tran_num);
            return;
        }

        trace!(
            "pb-adv: rx transaction {} complete: {:?}",
            rx.tran_num,
            HexSlice(pdu)
        );
        self.last_delivered = Some(rx.tran_num);
        self.queue_ack(now, rx.tran_num);
        handler.pdu_received(pdu);
    }

    fn queue_link_ack(&mut self, now: Instant) {
        let generic = [(CTRL_LINK_ACK << 2) | GPCF_CONTROL];
        let frame = Frame::new(self.link_id, CTRL_TRAN_NUM, &generic);
        let due = now + self.tx_jitter();
        self.schedule(PendingFrame { frame, due });
    }

    fn queue_ack(&mut self, now: Instant, tran_num: u8) {
        let frame = Frame::new(self.link_id, tran_num, &[GPCF_ACK]);
        let due = now + self.tx_jitter();
        self.schedule(PendingFrame { frame, due });
    }

    fn schedule(&mut self, frame: PendingFrame) {
        if self.pending.push_back(frame).is_err() {
            // The peer will retransmit whatever this was answering; dropping is safe.
            warn!("pb-adv: control queue full, dropping frame");
        }
    }

    /// Uniformly random per-packet transmit delay of 20 to 50 ms.
    fn tx_jitter(&mut self) -> Duration {
        Duration::from_millis(20 + (self.rng.next_u32() % 31) as u16)
    }

    fn reset(&mut self) {
        self.state = LinkState::Idle;
        self.tx = None;
        self.tx_next = None;
        self.rx = None;
        self.last_delivered = None;
        self.beacon = None;
        self.next_tran_num = first_tran_num(self.role);
    }
}

/// First transaction number a role assigns on a fresh link.
fn first_tran_num(role: Role) -> u8 {
    match role {
        Role::Client => 0x00,
        Role::Server => 0x80,
    }
}

/// Advances a transaction number, wrapping within the role's range.
fn next_tran_num(role: Role, tran_num: u8) -> u8 {
    match role {
        Role::Client => {
            if tran_num == 0x7f {
                0x00
            } else {
                tran_num + 1
            }
        }
        Role::Server => {
            if tran_num == 0xff {
                0x80
            } else {
                tran_num + 1
            }
        }
    }
}

/// Returns the index of the last segment of a PDU of `len` bytes.
fn last_seg_for_len(len: usize) -> u8 {
    if len <= SEG0_MAX_DATA {
        0
    } else {
        (1 + (len - SEG0_MAX_DATA - 1) / SEGX_MAX_DATA) as u8
    }
}

/// Builds the air frame for segment `seg` of transaction `t`.
fn segment_frame(link_id: u32, t: &TxTransaction, seg: u8) -> Frame {
    let pdu = &t.pdu[..usize::from(t.len)];
    let mut generic = [0; MAX_GENERIC_PDU_SIZE];

    let generic_len = if seg == 0 {
        let chunk = pdu.len().min(SEG0_MAX_DATA);
        generic[0] = (t.last_seg << 2) | GPCF_START;
        BigEndian::write_u16(&mut generic[1..3], pdu.len() as u16);
        generic[3] = fcs(pdu);
        generic[4..4 + chunk].copy_from_slice(&pdu[..chunk]);
        4 + chunk
    } else {
        let offset = SEG0_MAX_DATA + usize::from(seg - 1) * SEGX_MAX_DATA;
        let chunk = (pdu.len() - offset).min(SEGX_MAX_DATA);
        generic[0] = (seg << 2) | GPCF_CONTINUATION;
        generic[1..1 + chunk].copy_from_slice(&pdu[offset..offset + chunk]);
        1 + chunk
    };

    Frame::new(link_id, t.tran_num, &generic[..generic_len])
}

/// The 8-bit frame check sequence covering a whole provisioning PDU.
///
/// This is the FCS from 3GPP TS 27.010 (initial value `0xff`, reflected polynomial
/// `x^8 + x^2 + x + 1`, complemented result).
fn fcs(data: &[u8]) -> u8 {
    0xff - crc8(0xff, data)
}

fn crc8(mut crc: u8, data: &[u8]) -> u8 {
    for &byte in data {
        let mut byte = byte;
        for _ in 0..8 {
            if (crc ^ byte) & 0x01 != 0 {
                crc = (crc >> 1) ^ 0xe0;
            } else {
                crc >>= 1;
            }
            byte >>= 1;
        }
    }
    crc
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beacon::OobInfo;
    use std::vec::Vec;

    struct TestRng(u32);

    impl RngCore for TestRng {
        fn next_u32(&mut self) -> u32 {
            self.0 = self.0.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            self.0
        }
        fn next_u64(&mut self) -> u64 {
            u64::from(self.next_u32())
        }
        fn fill_bytes(&mut self, dest: &mut [u8]) {
            for b in dest {
                *b = self.next_u32() as u8;
            }
        }
        fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
            self.fill_bytes(dest);
            Ok(())
        }
    }

    #[derive(Default)]
    struct Air {
        frames: Vec<Vec<u8>>,
        beacons: Vec<Vec<u8>>,
    }

    impl FrameTransmitter for Air {
        fn transmit_frame(&mut self, frame: &[u8]) {
            self.frames.push(frame.to_vec());
        }
        fn transmit_beacon(&mut self, beacon: &[u8]) {
            self.beacons.push(beacon.to_vec());
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

    fn uuid() -> Uuid {
        Uuid::from_bytes([0x11; 16])
    }

    fn beacon() -> UnprovisionedBeacon {
        UnprovisionedBeacon {
            uuid: uuid(),
            oob_info: OobInfo::empty(),
            uri_hash: None,
        }
    }

    struct Pair {
        client: PbAdv<TestRng>,
        server: PbAdv<TestRng>,
        now: Instant,
    }

    impl Pair {
        fn new() -> Self {
            let now = Instant::from_raw_micros(0);
            Pair {
                client: PbAdv::client(TestRng(1)),
                server: PbAdv::server(TestRng(2), now, &beacon(), Duration::from_millis(100)),
                now,
            }
        }

        /// Advances time in 10 ms steps for `millis`, shuttling every emitted packet to the
        /// other side. `drop_fn` can swallow packets to simulate loss.
        fn run(
            &mut self,
            millis: u32,
            client_sink: &mut Sink,
            server_sink: &mut Sink,
            mut drop_fn: impl FnMut(&[u8]) -> bool,
        ) {
            let steps = millis / 10;
            for _ in 0..steps {
                self.now = self.now + Duration::from_millis(10);

                let mut air = Air::default();
                self.client.tick(self.now, &mut air, client_sink);
                for frame in air.frames.drain(..) {
                    if !drop_fn(&frame) {
                        self.server.process_frame(self.now, &frame, server_sink);
                    }
                }

                let mut air = Air::default();
                self.server.tick(self.now, &mut air, server_sink);
                for frame in air.frames.drain(..) {
                    if !drop_fn(&frame) {
                        self.client.process_frame(self.now, &frame, client_sink);
                    }
                }
                for beacon in air.beacons.drain(..) {
                    self.client.process_beacon(self.now, &beacon);
                }
            }
        }
    }

    fn open_link(pair: &mut Pair, client_sink: &mut Sink, server_sink: &mut Sink) {
        pair.client.open(pair.now, uuid()).unwrap();
        pair.run(1000, client_sink, server_sink, |_| false);
        assert_eq!(client_sink.events, vec![BearerEvent::LinkOpened]);
        assert_eq!(server_sink.events, vec![BearerEvent::LinkOpened]);
        assert!(pair.client.is_open() && pair.server.is_open());
        client_sink.events.clear();
        server_sink.events.clear();
    }

    #[test]
    fn fcs_known_residual() {
        // Appending the FCS to the covered data must leave the TS 27.010 check residual.
        let data = [0x00, 0x05];
        let check = fcs(&data);
        let mut crc = crc8(0xff, &data);
        crc = crc8(crc, &[check]);
        assert_eq!(crc, 0xcf);
    }

    #[test]
    fn segment_counts() {
        assert_eq!(last_seg_for_len(1), 0);
        assert_eq!(last_seg_for_len(20), 0);
        assert_eq!(last_seg_for_len(21), 1);
        assert_eq!(last_seg_for_len(43), 1);
        assert_eq!(last_seg_for_len(44), 2);
        assert_eq!(last_seg_for_len(65), 2);
    }

    #[test]
    fn transaction_numbers() {
        assert_eq!(first_tran_num(Role::Client), 0x00);
        assert_eq!(first_tran_num(Role::Server), 0x80);
        assert_eq!(next_tran_num(Role::Client, 0x7e), 0x7f);
        assert_eq!(next_tran_num(Role::Client, 0x7f), 0x00);
        assert_eq!(next_tran_num(Role::Server, 0xfe), 0xff);
        assert_eq!(next_tran_num(Role::Server, 0xff), 0x80);
    }

    #[test]
    fn link_establishment() {
        let (mut cs, mut ss) = (Sink::default(), Sink::default());
        let mut pair = Pair::new();
        open_link(&mut pair, &mut cs, &mut ss);
    }

    #[test]
    fn link_open_timeout() {
        let mut client = PbAdv::client(TestRng(1));
        let mut sink = Sink::default();
        let mut air = Air::default();

        let t0 = Instant::from_raw_micros(0);
        client.open(t0, uuid()).unwrap();
        // No beacon ever arrives.
        client.tick(t0 + Duration::from_secs(59), &mut air, &mut sink);
        assert!(sink.events.is_empty());
        client.tick(t0 + Duration::from_secs(60), &mut air, &mut sink);
        assert_eq!(sink.events, vec![BearerEvent::LinkFailed]);
    }

    #[test]
    fn short_pdu_round_trip() {
        let (mut cs, mut ss) = (Sink::default(), Sink::default());
        let mut pair = Pair::new();
        open_link(&mut pair, &mut cs, &mut ss);

        pair.client.send_pdu(pair.now, &[0x00, 0x05]).unwrap();
        pair.run(1000, &mut cs, &mut ss, |_| false);

        assert_eq!(ss.pdus, vec![vec![0x00, 0x05]]);
        assert_eq!(cs.events, vec![BearerEvent::PduSent(Opcode::Invite)]);
    }

    #[test]
    fn segmented_pdu_round_trip() {
        let (mut cs, mut ss) = (Sink::default(), Sink::default());
        let mut pair = Pair::new();
        open_link(&mut pair, &mut cs, &mut ss);

        // A Public Key PDU needs 3 segments.
        let mut pdu = vec![0x03];
        pdu.extend((0..64).map(|i| i as u8));
        pair.client.send_pdu(pair.now, &pdu).unwrap();
        pair.run(2000, &mut cs, &mut ss, |_| false);

        assert_eq!(ss.pdus, vec![pdu]);
        assert_eq!(cs.events, vec![BearerEvent::PduSent(Opcode::PublicKey)]);
    }

    #[test]
    fn lost_ack_is_reacked_without_redelivery() {
        let (mut cs, mut ss) = (Sink::default(), Sink::default());
        let mut pair = Pair::new();
        open_link(&mut pair, &mut cs, &mut ss);

        // Drop the first few server->client acks; the client keeps retransmitting and the
        // server must re-ack without delivering the PDU a second time.
        let mut dropped = 0;
        pair.client.send_pdu(pair.now, &[0x00, 0x00]).unwrap();
        pair.run(5000, &mut cs, &mut ss, |frame| {
            if frame.len() == 6 && frame[5] == GPCF_ACK && dropped < 3 {
                dropped += 1;
                true
            } else {
                false
            }
        });

        assert_eq!(dropped, 3);
        assert_eq!(ss.pdus.len(), 1);
        assert_eq!(cs.events, vec![BearerEvent::PduSent(Opcode::Invite)]);
    }

    #[test]
    fn corrupted_segment_is_dropped() {
        let (mut cs, mut ss) = (Sink::default(), Sink::default());
        let mut pair = Pair::new();
        open_link(&mut pair, &mut cs, &mut ss);

        pair.client.send_pdu(pair.now, &[0x00, 0x07]).unwrap();

        // Flip a payload bit in every data frame; the FCS check must reject them all.
        for _ in 0..100 {
            pair.now = pair.now + Duration::from_millis(10);
            let mut air = Air::default();
            pair.client.tick(pair.now, &mut air, &mut cs);
            for mut frame in air.frames.drain(..) {
                if frame[5] & 0x03 == GPCF_START {
                    let last = frame.len() - 1;
                    frame[last] ^= 0x01;
                }
                pair.server.process_frame(pair.now, &frame, &mut ss);
            }
        }

        assert!(ss.pdus.is_empty());
    }

    #[test]
    fn send_timeout_after_60s() {
        let (mut cs, mut ss) = (Sink::default(), Sink::default());
        let mut pair = Pair::new();
        open_link(&mut pair, &mut cs, &mut ss);

        pair.client.send_pdu(pair.now, &[0x00, 0x00]).unwrap();
        // Swallow everything the client sends so no ack can come back.
        let mut air = Air::default();
        for _ in 0..61 {
            pair.now = pair.now + Duration::from_secs(1);
            pair.client.tick(pair.now, &mut air, &mut cs);
        }

        assert_eq!(cs.events, vec![BearerEvent::SendTimeout]);
    }

    #[test]
    fn close_notifies_peer() {
        let (mut cs, mut ss) = (Sink::default(), Sink::default());
        let mut pair = Pair::new();
        open_link(&mut pair, &mut cs, &mut ss);

        pair.client.close(pair.now, CloseReason::Fail);
        pair.run(1000, &mut cs, &mut ss, |_| false);

        assert_eq!(ss.events, vec![BearerEvent::LinkClosed(CloseReason::Fail)]);
        // The closing side gets no event of its own.
        assert!(cs.events.is_empty());
    }

    #[test]
    fn send_requires_open_link() {
        let mut client = PbAdv::client(TestRng(1));
        assert_eq!(
            client.send_pdu(Instant::from_raw_micros(0), &[0x00, 0x00]),
            Err(Error::InvalidState),
        );
    }

    #[test]
    fn queues_one_follow_up_transaction() {
        let (mut cs, mut ss) = (Sink::default(), Sink::default());
        let mut pair = Pair::new();
        open_link(&mut pair, &mut cs, &mut ss);

        // A second PDU is accepted while the first is unacknowledged, a third is not.
        pair.client.send_pdu(pair.now, &[0x00, 0x05]).unwrap();
        pair.client
            .send_pdu(pair.now, &[0x02, 0x00, 0x00, 0x00, 0x00, 0x00])
            .unwrap();
        assert_eq!(
            pair.client.send_pdu(pair.now, &[0x00, 0x00]),
            Err(Error::InvalidState),
        );

        pair.run(3000, &mut cs, &mut ss, |_| false);
        assert_eq!(
            ss.pdus,
            vec![vec![0x00, 0x05], vec![0x02, 0x00, 0x00, 0x00, 0x00, 0x00]],
        );
        assert_eq!(
            cs.events,
            vec![
                BearerEvent::PduSent(Opcode::Invite),
                BearerEvent::PduSent(Opcode::Start),
            ],
        );
    }
}
