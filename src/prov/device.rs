//! The device role (provisioning server).
//!
//! The unprovisioned device answers the Provisioner: it beacons, reports its capabilities,
//! takes part in the key and confirmation exchanges, decrypts the provisioning data and
//! acknowledges with Complete. Unlike the Provisioner, the device also speaks the error half of
//! the protocol: every detectable violation is answered with a Provisioning Failed PDU carrying
//! a specific error code, after which the device parks in an error state that answers everything
//! else with `UnexpectedPdu` until the Provisioner closes the link or the transaction timer
//! expires.
//!
//! Another asymmetry is caused by retransmissions racing the (potentially slow) ECDH: the
//! peer's Confirmation may arrive while the device is still generating or validating keys. It
//! is captured where it arrives and replayed once the device reaches its own confirmation
//! computation.

use heapless::Deque;
use rand_core::RngCore;
use uuid::Uuid;

use crate::beacon::{OobInfo, UnprovisionedBeacon};
use crate::bearer::{BearerEvent, CloseReason};
use crate::bytes::{ByteReader, FromBytes};
use crate::config::{Config, ConfSecretKey};
use crate::crypto::ccm;
use crate::crypto::ecdh::{EcdhProvider, PublicKey, SecretKey, SharedSecret};
use crate::prov::oob::{self, OobData, MAX_OOB_SIZE};
use crate::prov::pdu::{
    Algorithm, AuthMethod, Capabilities, ErrorCode, InputOobActions, Opcode, OutputOobActions,
    PduBuf, PublicKeyType, Start, StaticOobType, DATA_PARAM_SIZE, DATA_SIZE, INPUT_OOB_ACTIONS,
    OUTPUT_OOB_ACTIONS, OUTPUT_OOB_ACTION_ALPHANUMERIC, START_PARAM_SIZE,
};
use crate::prov::session::{OwnKeypair, Secrets, Transcript};
use crate::prov::{
    AppKeypair, BearerRequest, FailureReason, ProvisioningData, TRANSACTION_TIMEOUT,
};
use crate::time::{Duration, Instant, Timer};
use crate::Error;

/// Static description of the unprovisioned device.
///
/// Unlike the Provisioner's per-session info, this outlives sessions: a device that fails to be
/// provisioned can re-enter provisioning mode with the same identity.
pub struct DeviceInfo {
    /// The device UUID broadcast in the unprovisioned device beacon.
    pub uuid: Uuid,

    /// The capabilities reported in response to an Invite.
    pub capabilities: Capabilities,

    /// OOB availability advertised in the beacon.
    pub oob_info: OobInfo,

    /// Hash of the OOB URI advertised in the beacon, if any (see [`crypto::uri_hash`]).
    ///
    /// [`crypto::uri_hash`]: ../../crypto/fn.uri_hash.html
    pub uri_hash: Option<[u8; 4]>,

    /// The static OOB value; required when the capabilities advertise one.
    pub static_oob: Option<[u8; 16]>,

    /// The ECC key pair distributed out of band; required when the capabilities advertise an
    /// OOB public key.
    pub keypair: Option<AppKeypair>,
}

/// Events the device reports to the application.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// A Provisioner opened a link to this device.
    LinkOpened,

    /// Draw the user's attention to the device for the given number of seconds (0 cancels).
    Attention {
        /// Duration in seconds; 0 means stop.
        seconds: u8,
    },

    /// Output `value` to the user through the given action until [`OutputConfirmed`] arrives.
    ///
    /// [`OutputConfirmed`]: #variant.OutputConfirmed
    OutputOob {
        /// The action to perform.
        action: OutputOobActions,
        /// The value to output.
        value: OobData,
    },

    /// The Provisioner confirmed the output value; the device can stop outputting it.
    OutputConfirmed,

    /// Prompt the user to input the OOB value through the given action, then call
    /// [`input_complete`].
    ///
    /// [`input_complete`]: struct.Device.html#method.input_complete
    InputOob {
        /// The action the user performs.
        action: InputOobActions,
    },

    /// Provisioning finished; the device is now part of the network.
    Complete {
        /// The derived device key, to authenticate configuration traffic.
        device_key: [u8; 16],
        /// The provisioning data delivered by the Provisioner.
        data: ProvisioningData,
    },

    /// Provisioning ended without success; the device may re-enter provisioning mode.
    Failed(FailureReason),
}

/// Trait the application implements to receive [`DeviceEvent`]s.
///
/// [`DeviceEvent`]: enum.DeviceEvent.html
pub trait DeviceHandler {
    /// Called whenever the device has something to report.
    fn on_event(&mut self, event: DeviceEvent);
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum State {
    Idle,
    WaitLink,
    WaitInvite,
    SendCapabilities,
    WaitStart,
    WaitPublicKey,
    GeneratePublicKey,
    ValidatePublicKey,
    SendPublicKey,
    PrepareOob,
    WaitInput,
    SendInputComplete,
    WaitConfirmation,
    CalcConfirmation,
    SendConfirmation,
    WaitRandom,
    CheckConfirmation,
    CalcSessionKey,
    SendRandom,
    WaitData,
    DecryptData,
    SendComplete,
    /// Error sink: a Failed PDU went out, and every further PDU is answered with
    /// `UnexpectedPdu` until the link closes or the timer fires.
    LinkFailed,
}

enum Msg {
    BeginNoLink { if_id: u8, period: Duration },
    BeginLinkOpen { conn_id: u16 },
    LinkOpened,
    LinkClosedSuccess,
    LinkClosedFail,
    RecvTimeout,
    SendTimeout,
    Sent(Opcode),
    RecvInvite { attention: u8 },
    RecvStart { start: Start, raw: [u8; START_PARAM_SIZE] },
    RecvPublicKey(PublicKey),
    RecvConfirmation([u8; 16]),
    RecvRandom([u8; 16]),
    RecvData([u8; DATA_PARAM_SIZE]),
    RecvBadPdu(ErrorCode),
    InputReady(OobData),
    GotoInput,
    GotoConfirmation,
    KeyGenerated,
    KeyValid,
    KeyInvalid,
    ConfirmationReady([u8; 16]),
    ConfirmationVerified,
    ConfirmationFailed,
    SessionKeyReady,
    DataDecrypted,
    DataNotDecrypted,
}

/// The parameters the Provisioner chose in the Start PDU, kept for the rest of the session.
struct StartParams {
    oob_public_key: bool,
    method: AuthMethod,
    action: u8,
    size: u8,
}

struct Session<C: Config> {
    start: Option<StartParams>,
    generated: Option<OwnKeypair<C>>,
    own_public: Option<PublicKey>,
    peer_public: Option<PublicKey>,
    peer_confirmation_received: bool,
    attention_set: bool,
    transcript: Transcript,
    ecdh: Option<SharedSecret>,
    secrets: Secrets,
}

impl<C: Config> Session<C> {
    fn new() -> Self {
        Self {
            start: None,
            generated: None,
            own_public: None,
            peer_public: None,
            peer_confirmation_received: false,
            attention_set: false,
            transcript: Transcript::new(),
            ecdh: None,
            secrets: Secrets::new(),
        }
    }
}

/// The device (provisioning server) state machine.
///
/// Constructed once with the device identity, then put into provisioning mode with
/// [`enter_pb_adv`] or [`enter_pb_gatt`]. Driven the same way as the Provisioner: bearer
/// traffic in through [`pdu_received`]/[`bearer_event`], timer expiry through
/// [`timer_expired`], and bearer work out through [`poll_request`].
///
/// [`enter_pb_adv`]: #method.enter_pb_adv
/// [`enter_pb_gatt`]: #method.enter_pb_gatt
/// [`pdu_received`]: #method.pdu_received
/// [`bearer_event`]: #method.bearer_event
/// [`timer_expired`]: #method.timer_expired
/// [`poll_request`]: #method.poll_request
pub struct Device<C: Config, E: DeviceHandler> {
    timer: C::Timer,
    rng: C::Rng,
    ecdh: C::Ecdh,
    events: E,
    info: DeviceInfo,
    state: State,
    session: Option<Session<C>>,
    queue: Deque<Msg, 8>,
    requests: Deque<BearerRequest, 4>,
    deadline: Option<Instant>,
}

impl<C: Config, E: DeviceHandler> Device<C, E> {
    /// Creates a device with the given identity.
    ///
    /// Fails when the capabilities advertise OOB material (static value or public key) that
    /// `info` does not actually contain.
    pub fn new(
        timer: C::Timer,
        rng: C::Rng,
        ecdh: C::Ecdh,
        events: E,
        info: DeviceInfo,
    ) -> Result<Self, Error> {
        if info
            .capabilities
            .public_key_type
            .contains(PublicKeyType::OOB_AVAILABLE)
            && info.keypair.is_none()
        {
            return Err(Error::InvalidValue);
        }
        if info
            .capabilities
            .static_oob_type
            .contains(StaticOobType::AVAILABLE)
            && info.static_oob.is_none()
        {
            return Err(Error::InvalidValue);
        }

        Ok(Self {
            timer,
            rng,
            ecdh,
            events,
            info,
            state: State::Idle,
            session: None,
            queue: Deque::new(),
            requests: Deque::new(),
            deadline: None,
        })
    }

    /// Enters provisioning mode over PB-ADV: beacon every `beacon_period` and wait for a link.
    pub fn enter_pb_adv(&mut self, if_id: u8, beacon_period: Duration) -> Result<(), Error> {
        if self.session.is_some() {
            return Err(Error::InvalidState);
        }

        self.session = Some(Session::new());
        self.post(Msg::BeginNoLink {
            if_id,
            period: beacon_period,
        });
        self.drive();
        Ok(())
    }

    /// Enters provisioning mode over an existing PB-GATT connection.
    pub fn enter_pb_gatt(&mut self, conn_id: u16) -> Result<(), Error> {
        if self.session.is_some() {
            return Err(Error::InvalidState);
        }

        self.session = Some(Session::new());
        self.post(Msg::BeginLinkOpen { conn_id });
        self.drive();
        Ok(())
    }

    /// Supplies the input OOB value entered by the user after an `InputOob` event.
    pub fn input_complete(&mut self, value: OobData) -> Result<(), Error> {
        if self.session.is_none() {
            return Err(Error::InvalidState);
        }
        if let OobData::Alphanumeric { data, len } = &value {
            let len = usize::from(*len);
            if len == 0 || len > MAX_OOB_SIZE || !oob::is_alphanumeric(&data[..len]) {
                return Err(Error::InvalidValue);
            }
        }

        self.post(Msg::InputReady(value));
        self.drive();
        Ok(())
    }

    /// Feeds a provisioning PDU received by the bearer into the state machine.
    pub fn pdu_received(&mut self, pdu: &[u8]) {
        if pdu.is_empty() {
            return;
        }

        let opcode = Opcode::from(pdu[0]);
        let well_formed = opcode.pdu_size() == Some(pdu.len());
        let msg = match opcode {
            Opcode::Invite if well_formed => Msg::RecvInvite { attention: pdu[1] },
            Opcode::Start if well_formed => {
                let mut raw = [0; START_PARAM_SIZE];
                raw.copy_from_slice(&pdu[1..]);
                match Start::from_bytes(&mut ByteReader::new(&pdu[1..])) {
                    Ok(start) if self.validate_start(&start) => Msg::RecvStart { start, raw },
                    _ => Msg::RecvBadPdu(ErrorCode::InvalidFormat),
                }
            }
            Opcode::PublicKey if well_formed => {
                let mut key = [0; 64];
                key.copy_from_slice(&pdu[1..]);
                Msg::RecvPublicKey(PublicKey(key))
            }
            Opcode::Confirmation if well_formed => {
                let mut value = [0; 16];
                value.copy_from_slice(&pdu[1..]);
                Msg::RecvConfirmation(value)
            }
            Opcode::Random if well_formed => {
                let mut value = [0; 16];
                value.copy_from_slice(&pdu[1..]);
                Msg::RecvRandom(value)
            }
            Opcode::Data if well_formed => {
                let mut data = [0; DATA_PARAM_SIZE];
                data.copy_from_slice(&pdu[1..]);
                Msg::RecvData(data)
            }
            // Right opcode, wrong length.
            Opcode::Invite
            | Opcode::Start
            | Opcode::PublicKey
            | Opcode::Confirmation
            | Opcode::Random
            | Opcode::Data => {
                warn!("device: bad {:?} length {}", opcode, pdu.len());
                Msg::RecvBadPdu(ErrorCode::InvalidFormat)
            }
            // PDUs only the device itself may send.
            Opcode::Capabilities
            | Opcode::InputComplete
            | Opcode::Complete
            | Opcode::Failed => {
                warn!("device: unexpected {:?}", opcode);
                Msg::RecvBadPdu(ErrorCode::UnexpectedPdu)
            }
            Opcode::Unknown(op) => {
                warn!("device: unknown opcode {:#04x}", op);
                Msg::RecvBadPdu(ErrorCode::InvalidPdu)
            }
        };

        self.post(msg);
        self.drive();
    }

    /// Feeds a bearer event into the state machine.
    pub fn bearer_event(&mut self, event: BearerEvent) {
        let msg = match event {
            BearerEvent::LinkOpened => Msg::LinkOpened,
            BearerEvent::LinkClosed(CloseReason::Success) => Msg::LinkClosedSuccess,
            BearerEvent::LinkClosed(_) => Msg::LinkClosedFail,
            BearerEvent::PduSent(opcode) => Msg::Sent(opcode),
            BearerEvent::SendTimeout => Msg::SendTimeout,
            // Losing the GATT connection mid-session is a link failure.
            BearerEvent::ConnClosed => Msg::LinkClosedFail,
            // The device never opens links; a failure to open is not its concern.
            BearerEvent::LinkFailed => return,
        };

        self.post(msg);
        self.drive();
    }

    /// Returns the deadline of the running transaction timer, if any.
    pub fn next_timeout(&self) -> Option<Instant> {
        self.deadline
    }

    /// Notifies the state machine that the deadline from [`next_timeout`] has passed.
    ///
    /// [`next_timeout`]: #method.next_timeout
    pub fn timer_expired(&mut self) {
        if self.deadline.take().is_some() {
            self.post(Msg::RecvTimeout);
            self.drive();
        }
    }

    /// Removes and returns the next request for the bearer layer.
    pub fn poll_request(&mut self) -> Option<BearerRequest> {
        self.requests.pop_front()
    }

    /// Validates the Start parameters: field ranges first, then consistency with the
    /// advertised capabilities.
    fn validate_start(&self, start: &Start) -> bool {
        if !matches!(start.algorithm, Algorithm::FipsP256) || start.public_key > 0x01 {
            return false;
        }

        let caps = &self.info.capabilities;
        match start.auth_method {
            AuthMethod::NoOob | AuthMethod::StaticOob => {
                if start.auth_action != 0 || start.auth_size != 0 {
                    return false;
                }
            }
            AuthMethod::OutputOob => {
                if start.auth_action >= OUTPUT_OOB_ACTIONS
                    || start.auth_size == 0
                    || start.auth_size > MAX_OOB_SIZE as u8
                {
                    return false;
                }
                if caps.output_oob_size == 0
                    || caps.output_oob_size < start.auth_size
                    || caps.output_oob_actions.bits() & (1 << start.auth_action) == 0
                {
                    return false;
                }
            }
            AuthMethod::InputOob => {
                if start.auth_action >= INPUT_OOB_ACTIONS
                    || start.auth_size == 0
                    || start.auth_size > MAX_OOB_SIZE as u8
                {
                    return false;
                }
                if caps.input_oob_size == 0
                    || caps.input_oob_size < start.auth_size
                    || caps.input_oob_actions.bits() & (1 << start.auth_action) == 0
                {
                    return false;
                }
            }
            AuthMethod::Unknown(_) => return false,
        }

        if start.public_key == 0x01 && !caps.public_key_type.contains(PublicKeyType::OOB_AVAILABLE)
        {
            return false;
        }

        true
    }

    fn post(&mut self, msg: Msg) {
        if self.queue.push_back(msg).is_err() {
            error!("device: message queue full");
        }
    }

    fn request(&mut self, request: BearerRequest) {
        if self.requests.push_back(request).is_err() {
            error!("device: request queue full");
        }
    }

    fn drive(&mut self) {
        while let Some(msg) = self.queue.pop_front() {
            self.execute(msg);
        }
    }

    fn arm_timer(&mut self) {
        self.deadline = Some(self.timer.now() + TRANSACTION_TIMEOUT);
    }

    fn stop_timer(&mut self) {
        self.deadline = None;
    }

    /// Runs one transition of the state machine.
    fn execute(&mut self, msg: Msg) {
        use State::*;

        // Terminal events are delivered exactly once; whatever trickles in afterwards must not
        // resurrect the finished session.
        if self.session.is_none() {
            match msg {
                Msg::BeginNoLink { .. } | Msg::BeginLinkOpen { .. } => {}
                _ => return,
            }
        }

        match (self.state, msg) {
            (Idle, Msg::BeginNoLink { if_id, period }) => {
                self.state = WaitLink;
                self.act_wait_link(if_id, period);
            }
            (Idle, Msg::BeginLinkOpen { conn_id }) | (WaitLink, Msg::BeginLinkOpen { conn_id }) => {
                self.state = WaitInvite;
                self.act_wait_invite(Some(conn_id));
            }
            (WaitLink, Msg::LinkOpened) => {
                self.state = WaitInvite;
                self.act_wait_invite(None);
            }

            (WaitInvite, Msg::RecvInvite { attention }) => {
                self.state = SendCapabilities;
                self.act_send_capabilities(attention);
            }

            (SendCapabilities, Msg::Sent(Opcode::Capabilities)) => {
                self.state = WaitStart;
                self.act_wait_start();
            }
            // The Provisioner only moves on to Start when it got our Capabilities, so accept it
            // before our own send completes (its ack may have been lost).
            (SendCapabilities, Msg::RecvStart { start, raw })
            | (WaitStart, Msg::RecvStart { start, raw }) => {
                self.state = WaitPublicKey;
                self.act_wait_public_key(start, raw);
            }

            (WaitPublicKey, Msg::RecvPublicKey(key)) => {
                self.state = GeneratePublicKey;
                self.act_generate_public_key(key);
            }

            (GeneratePublicKey, Msg::KeyGenerated) => {
                self.state = ValidatePublicKey;
                self.act_validate_public_key();
            }
            // The peer's Confirmation can overtake our (slow) key work; hold on to it.
            (GeneratePublicKey, Msg::RecvConfirmation(value))
            | (ValidatePublicKey, Msg::RecvConfirmation(value)) => {
                self.act_save_confirmation(value);
            }

            (ValidatePublicKey, Msg::KeyValid) => {
                self.state = SendPublicKey;
                self.act_send_public_key();
            }

            (SendPublicKey, Msg::Sent(Opcode::PublicKey)) => {
                self.state = PrepareOob;
                self.act_prepare_oob();
            }
            (SendPublicKey, Msg::RecvConfirmation(value))
            | (PrepareOob, Msg::RecvConfirmation(value))
            | (SendInputComplete, Msg::RecvConfirmation(value))
            | (WaitConfirmation, Msg::RecvConfirmation(value)) => {
                self.state = CalcConfirmation;
                self.act_calc_confirmation(value);
            }

            (PrepareOob, Msg::GotoInput) => {
                self.state = WaitInput;
                self.act_wait_input();
            }
            (PrepareOob, Msg::GotoConfirmation) => {
                self.state = WaitConfirmation;
                self.act_wait_confirmation();
            }

            (WaitInput, Msg::InputReady(value)) => {
                self.state = SendInputComplete;
                self.act_send_input_complete(value);
            }
            (SendInputComplete, Msg::Sent(Opcode::InputComplete)) => {
                self.state = WaitConfirmation;
                self.act_wait_confirmation();
            }

            (CalcConfirmation, Msg::ConfirmationReady(confirmation)) => {
                self.state = SendConfirmation;
                self.act_send_confirmation(confirmation);
            }

            (SendConfirmation, Msg::Sent(Opcode::Confirmation)) => {
                self.state = WaitRandom;
                self.act_wait_random();
            }
            (SendConfirmation, Msg::RecvRandom(peer)) | (WaitRandom, Msg::RecvRandom(peer)) => {
                self.state = CheckConfirmation;
                self.act_check_confirmation(peer);
            }

            (CheckConfirmation, Msg::ConfirmationVerified) => {
                self.state = CalcSessionKey;
                self.act_calc_session_key();
            }

            (CalcSessionKey, Msg::SessionKeyReady) => {
                self.state = SendRandom;
                self.act_send_random();
            }

            (SendRandom, Msg::Sent(Opcode::Random)) => {
                self.state = WaitData;
                self.act_wait_data();
            }
            (SendRandom, Msg::RecvData(data)) | (WaitData, Msg::RecvData(data)) => {
                self.state = DecryptData;
                self.act_decrypt_data(data);
            }

            (DecryptData, Msg::DataDecrypted) => {
                self.state = SendComplete;
                self.act_send_complete();
            }

            (SendComplete, Msg::Sent(Opcode::Complete)) => {
                self.state = Idle;
                self.act_success();
            }
            // The data arrived and was acted on; a lost Complete does not undo that.
            (SendComplete, Msg::LinkClosedSuccess) | (SendComplete, Msg::SendTimeout) => {
                self.state = Idle;
                self.act_success();
            }

            // The error sink: answer everything the peer still sends with UnexpectedPdu.
            (LinkFailed, Msg::RecvBadPdu(_))
            | (LinkFailed, Msg::RecvInvite { .. })
            | (LinkFailed, Msg::RecvStart { .. })
            | (LinkFailed, Msg::RecvPublicKey(_))
            | (LinkFailed, Msg::RecvConfirmation(_))
            | (LinkFailed, Msg::RecvRandom(_))
            | (LinkFailed, Msg::RecvData(_))
            | (LinkFailed, Msg::KeyInvalid)
            | (LinkFailed, Msg::ConfirmationFailed)
            | (LinkFailed, Msg::DataNotDecrypted) => {
                self.send_failed(ErrorCode::UnexpectedPdu);
            }

            (_, msg) => self.common(msg),
        }
    }

    /// Transitions shared by every state; consulted when the current state has no entry for the
    /// message.
    fn common(&mut self, msg: Msg) {
        match msg {
            // A link closed before Complete is a failure even when the peer claims success.
            Msg::LinkClosedFail | Msg::LinkClosedSuccess => {
                self.state = State::Idle;
                self.act_link_closed();
            }
            Msg::RecvTimeout => {
                self.state = State::Idle;
                self.act_recv_timeout();
            }
            Msg::SendTimeout => {
                self.state = State::Idle;
                self.act_send_timeout();
            }
            Msg::RecvBadPdu(code) => {
                self.state = State::LinkFailed;
                self.act_protocol_error(code);
            }
            Msg::RecvInvite { .. }
            | Msg::RecvStart { .. }
            | Msg::RecvPublicKey(_)
            | Msg::RecvConfirmation(_)
            | Msg::RecvRandom(_)
            | Msg::RecvData(_) => {
                self.state = State::LinkFailed;
                self.act_protocol_error(ErrorCode::UnexpectedPdu);
            }
            Msg::KeyInvalid => {
                self.state = State::LinkFailed;
                self.act_protocol_error(ErrorCode::InvalidFormat);
            }
            Msg::ConfirmationFailed => {
                self.state = State::LinkFailed;
                self.act_protocol_error(ErrorCode::ConfirmationFailed);
            }
            Msg::DataNotDecrypted => {
                self.state = State::LinkFailed;
                self.act_protocol_error(ErrorCode::DecryptionFailed);
            }
            _ => {}
        }
    }

    fn act_wait_link(&mut self, if_id: u8, period: Duration) {
        let beacon = UnprovisionedBeacon {
            uuid: self.info.uuid,
            oob_info: self.info.oob_info,
            uri_hash: self.info.uri_hash,
        };
        self.request(BearerRequest::EnableAdvServer {
            if_id,
            beacon,
            period,
        });
    }

    fn act_wait_invite(&mut self, gatt_conn: Option<u16>) {
        match gatt_conn {
            Some(conn_id) => self.request(BearerRequest::EnableGattServer { conn_id }),
            None => self.events.on_event(DeviceEvent::LinkOpened),
        }
        self.arm_timer();
    }

    fn act_send_capabilities(&mut self, attention: u8) {
        self.stop_timer();
        let session = match &mut self.session {
            Some(session) => session,
            None => return,
        };
        session.transcript.set_invite(&[attention]);

        if attention > 0 {
            session.attention_set = true;
            self.events.on_event(DeviceEvent::Attention { seconds: attention });
        }

        let caps = self.advertised_capabilities();
        let pdu = PduBuf::capabilities(&caps);
        if let Some(session) = &mut self.session {
            session.transcript.set_capabilities(pdu.param());
        }
        self.request(BearerRequest::Send(pdu));
    }

    #[cfg(not(feature = "sample-data"))]
    fn advertised_capabilities(&self) -> Capabilities {
        self.info.capabilities
    }

    /// The fixed capabilities mandated by the specification sample data.
    #[cfg(feature = "sample-data")]
    fn advertised_capabilities(&self) -> Capabilities {
        Capabilities {
            num_elements: 1,
            algorithms: crate::prov::pdu::Algorithms::FIPS_P256,
            public_key_type: PublicKeyType::empty(),
            static_oob_type: StaticOobType::empty(),
            output_oob_size: 0,
            output_oob_actions: OutputOobActions::empty(),
            input_oob_size: 0,
            input_oob_actions: InputOobActions::empty(),
        }
    }

    fn act_wait_start(&mut self) {
        self.arm_timer();
    }

    fn act_wait_public_key(&mut self, start: Start, raw: [u8; START_PARAM_SIZE]) {
        let session = match &mut self.session {
            Some(session) => session,
            None => return,
        };

        session.peer_confirmation_received = false;
        session.transcript.set_start(&raw);
        session.start = Some(StartParams {
            oob_public_key: start.public_key == 0x01,
            method: start.auth_method,
            action: start.auth_action,
            // Validation guarantees this, but the size indexes buffers, so clamp anyway.
            size: start.auth_size.min(MAX_OOB_SIZE as u8),
        });

        if start.public_key == 0x01 && self.info.keypair.is_none() {
            self.post(Msg::RecvBadPdu(ErrorCode::InvalidFormat));
        } else {
            self.arm_timer();
        }
    }

    fn act_generate_public_key(&mut self, peer_key: PublicKey) {
        self.stop_timer();
        let session = match &mut self.session {
            Some(session) => session,
            None => return,
        };

        session.transcript.set_provisioner_key(&peer_key.0);
        session.peer_public = Some(peer_key);

        match &self.info.keypair {
            Some(app) => session.own_public = Some(app.public),
            None => {
                let (secret, public) = self.ecdh.generate_keypair(&mut self.rng);
                session.own_public = Some(public);
                session.generated = Some(OwnKeypair { secret, public });
            }
        }

        self.post(Msg::KeyGenerated);
    }

    fn act_validate_public_key(&mut self) {
        let session = match &mut self.session {
            Some(session) => session,
            None => return,
        };
        let peer = match session.peer_public {
            Some(peer) => peer,
            None => return,
        };

        let secret = match &self.info.keypair {
            Some(app) => <ConfSecretKey<C> as SecretKey>::from_bytes(&app.secret).ok(),
            None => session.generated.take().map(|keypair| keypair.secret),
        };
        let msg = match secret {
            Some(secret) => match secret.agree(&peer) {
                Ok(shared) => {
                    session.ecdh = Some(shared);
                    Msg::KeyValid
                }
                Err(_) => {
                    info!("device: peer public key is invalid");
                    Msg::KeyInvalid
                }
            },
            None => {
                error!("device: no usable private key for ECDH");
                Msg::KeyInvalid
            }
        };
        self.post(msg);
    }

    fn act_send_public_key(&mut self) {
        let session = match &mut self.session {
            Some(session) => session,
            None => return,
        };
        let public = match session.own_public {
            Some(public) => public,
            None => return,
        };
        let oob_public_key = session
            .start
            .as_ref()
            .map(|start| start.oob_public_key)
            .unwrap_or(false);

        if !oob_public_key {
            let pdu = PduBuf::public_key(&public);
            session.transcript.set_device_key(pdu.param());
            self.request(BearerRequest::Send(pdu));
        } else {
            // The Provisioner already has this key out of band; it only enters the
            // ConfirmationInputs, nothing goes on the air.
            session.transcript.set_device_key(&public.0);
            self.post(Msg::Sent(Opcode::PublicKey));
        }
    }

    fn act_prepare_oob(&mut self) {
        let session = match &mut self.session {
            Some(session) => session,
            None => return,
        };
        let (method, action, size) = match &session.start {
            Some(start) => (start.method, start.action, start.size),
            None => return,
        };

        match method {
            AuthMethod::InputOob => self.post(Msg::GotoInput),

            AuthMethod::OutputOob => {
                // Generate the value, show it to the user, and fold it into the AuthValue.
                let value = if action == OUTPUT_OOB_ACTION_ALPHANUMERIC {
                    let mut data = [0; MAX_OOB_SIZE];
                    oob::random_alphanumeric(&mut self.rng, &mut data[..usize::from(size)]);
                    OobData::Alphanumeric { data, len: size }
                } else {
                    OobData::Numeric(oob::random_numeric(&mut self.rng, size))
                };
                value.pack_into_auth_value(&mut session.secrets.auth_value);

                self.events.on_event(DeviceEvent::OutputOob {
                    action: OutputOobActions::from_bits_truncate(1 << action),
                    value,
                });
                self.post(Msg::GotoConfirmation);
            }

            AuthMethod::NoOob => {
                session.secrets.auth_value = [0; 16];
                self.forward_or_wait();
            }

            AuthMethod::StaticOob => {
                match self.info.static_oob {
                    Some(value) => session.secrets.auth_value = value,
                    // Unreachable: construction requires the value when it is advertised.
                    None => {
                        error!("device: static OOB advertised but not supplied");
                        return;
                    }
                }
                self.forward_or_wait();
            }

            AuthMethod::Unknown(_) => {}
        }
    }

    /// Continues to the confirmation wait, fast-forwarding when the peer's Confirmation
    /// already arrived during the key exchange.
    fn forward_or_wait(&mut self) {
        let session = match &self.session {
            Some(session) => session,
            None => return,
        };
        if session.peer_confirmation_received {
            self.post(Msg::RecvConfirmation(session.secrets.peer_confirmation));
        } else {
            self.post(Msg::GotoConfirmation);
        }
    }

    fn act_wait_input(&mut self) {
        let action = match &self.session {
            Some(session) => match &session.start {
                Some(start) => start.action,
                None => return,
            },
            None => return,
        };

        self.events.on_event(DeviceEvent::InputOob {
            action: InputOobActions::from_bits_truncate(1 << action),
        });
    }

    fn act_send_input_complete(&mut self, value: OobData) {
        let session = match &mut self.session {
            Some(session) => session,
            None => return,
        };
        value.pack_into_auth_value(&mut session.secrets.auth_value);
        self.request(BearerRequest::Send(PduBuf::input_complete()));
    }

    fn act_wait_confirmation(&mut self) {
        self.arm_timer();
    }

    fn act_save_confirmation(&mut self, value: [u8; 16]) {
        let session = match &mut self.session {
            Some(session) => session,
            None => return,
        };
        session.secrets.peer_confirmation = value;
        session.peer_confirmation_received = true;

        // The Provisioner saw the output value; the user no longer needs it displayed.
        let output = matches!(
            session.start,
            Some(StartParams {
                method: AuthMethod::OutputOob,
                ..
            })
        );
        if output {
            self.events.on_event(DeviceEvent::OutputConfirmed);
        }
    }

    fn act_calc_confirmation(&mut self, value: [u8; 16]) {
        self.stop_timer();

        let received = match &self.session {
            Some(session) => session.peer_confirmation_received,
            None => return,
        };
        if !received {
            self.act_save_confirmation(value);
        }

        let session = match &mut self.session {
            Some(session) => session,
            None => return,
        };
        let ecdh = match &session.ecdh {
            Some(ecdh) => ecdh,
            None => return,
        };
        session
            .secrets
            .derive_confirmation_key(&session.transcript, ecdh);

        let random = self.device_random();
        let session = match &mut self.session {
            Some(session) => session,
            None => return,
        };
        session.secrets.random_device = random;

        let confirmation = session.secrets.confirmation(&random);
        self.post(Msg::ConfirmationReady(confirmation));
    }

    #[cfg(not(feature = "sample-data"))]
    fn device_random(&mut self) -> [u8; 16] {
        let mut random = [0; 16];
        self.rng.fill_bytes(&mut random);
        random
    }

    /// The fixed device Random from the specification sample data.
    #[cfg(feature = "sample-data")]
    fn device_random(&mut self) -> [u8; 16] {
        [
            0x55, 0xa2, 0xa2, 0xbc, 0xa0, 0x4c, 0xd3, 0x2f, 0xf6, 0xf3, 0x46, 0xbd, 0x0a, 0x0c,
            0x1a, 0x3a,
        ]
    }

    fn act_send_confirmation(&mut self, confirmation: [u8; 16]) {
        self.request(BearerRequest::Send(PduBuf::confirmation(&confirmation)));
    }

    fn act_wait_random(&mut self) {
        self.arm_timer();
    }

    fn act_check_confirmation(&mut self, peer_random: [u8; 16]) {
        self.stop_timer();
        let session = match &mut self.session {
            Some(session) => session,
            None => return,
        };
        session.secrets.random_provisioner = peer_random;

        let expected = session.secrets.confirmation(&peer_random);
        if expected == session.secrets.peer_confirmation {
            self.post(Msg::ConfirmationVerified);
        } else {
            info!("device: peer confirmation does not verify");
            self.post(Msg::ConfirmationFailed);
        }
    }

    fn act_calc_session_key(&mut self) {
        let session = match &mut self.session {
            Some(session) => session,
            None => return,
        };
        let ecdh = match &session.ecdh {
            Some(ecdh) => ecdh,
            None => return,
        };
        session.secrets.derive_session_keys(ecdh);
        self.post(Msg::SessionKeyReady);
    }

    fn act_send_random(&mut self) {
        let random = match &self.session {
            Some(session) => session.secrets.random_device,
            None => return,
        };
        self.request(BearerRequest::Send(PduBuf::random(&random)));
    }

    fn act_wait_data(&mut self) {
        self.arm_timer();
    }

    fn act_decrypt_data(&mut self, data: [u8; DATA_PARAM_SIZE]) {
        self.stop_timer();
        let session = match &mut self.session {
            Some(session) => session,
            None => return,
        };

        session.secrets.data_mic = data;
        let (payload, mic) = session.secrets.data_mic.split_at_mut(DATA_SIZE);
        let mut mic_arr = [0; ccm::MIC_LEN];
        mic_arr.copy_from_slice(mic);

        match ccm::decrypt(
            &session.secrets.session_key,
            &session.secrets.session_nonce,
            payload,
            &mic_arr,
        ) {
            Ok(()) => self.post(Msg::DataDecrypted),
            Err(_) => {
                info!("device: provisioning data failed to authenticate");
                self.post(Msg::DataNotDecrypted);
            }
        }
    }

    fn act_send_complete(&mut self) {
        self.request(BearerRequest::Send(PduBuf::complete()));

        let session = match &self.session {
            Some(session) => session,
            None => return,
        };
        let mut plain = [0; DATA_SIZE];
        plain.copy_from_slice(&session.secrets.data_mic[..DATA_SIZE]);
        self.events.on_event(DeviceEvent::Complete {
            device_key: session.secrets.device_key,
            data: ProvisioningData::unpack(&plain),
        });
    }

    fn act_success(&mut self) {
        self.cleanup();
    }

    fn act_link_closed(&mut self) {
        self.cleanup();
        self.events
            .on_event(DeviceEvent::Failed(FailureReason::LinkClosedByPeer));
    }

    fn act_recv_timeout(&mut self) {
        self.request(BearerRequest::CloseSilent);
        self.cleanup();
        self.events
            .on_event(DeviceEvent::Failed(FailureReason::ReceiveTimeout));
    }

    fn act_send_timeout(&mut self) {
        self.cleanup();
        self.events
            .on_event(DeviceEvent::Failed(FailureReason::SendTimeout));
    }

    /// Sends the Failed PDU and parks in the error state until the link dies.
    fn act_protocol_error(&mut self, code: ErrorCode) {
        info!("device: protocol error {:?}", code);
        self.send_failed(code);
        self.arm_timer();
    }

    fn send_failed(&mut self, code: ErrorCode) {
        self.request(BearerRequest::Send(PduBuf::failed(code)));
    }

    fn cleanup(&mut self) {
        self.stop_timer();
        let attention = self
            .session
            .as_ref()
            .map(|session| session.attention_set)
            .unwrap_or(false);
        if attention {
            self.events.on_event(DeviceEvent::Attention { seconds: 0 });
        }
        self.session = None;
        self.queue.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::ecdh::P256Provider;
    use crate::prov::pdu::Algorithms;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;
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

    impl rand_core::CryptoRng for TestRng {}

    #[derive(Clone)]
    struct MockTimer(Rc<Cell<u32>>);

    impl Timer for MockTimer {
        fn now(&self) -> Instant {
            Instant::from_raw_micros(self.0.get())
        }
    }

    struct TestConfig;

    impl Config for TestConfig {
        type Timer = MockTimer;
        type Rng = TestRng;
        type Ecdh = P256Provider;
    }

    #[derive(Clone, Default)]
    struct Recorder(Rc<RefCell<Vec<DeviceEvent>>>);

    impl DeviceHandler for Recorder {
        fn on_event(&mut self, event: DeviceEvent) {
            self.0.borrow_mut().push(event);
        }
    }

    fn info() -> DeviceInfo {
        DeviceInfo {
            uuid: Uuid::from_bytes([0x42; 16]),
            capabilities: Capabilities {
                num_elements: 1,
                algorithms: Algorithms::FIPS_P256,
                public_key_type: PublicKeyType::empty(),
                static_oob_type: StaticOobType::empty(),
                output_oob_size: 0,
                output_oob_actions: OutputOobActions::empty(),
                input_oob_size: 0,
                input_oob_actions: InputOobActions::empty(),
            },
            oob_info: OobInfo::empty(),
            uri_hash: None,
            static_oob: None,
            keypair: None,
        }
    }

    fn device() -> (Device<TestConfig, Recorder>, Recorder) {
        let recorder = Recorder::default();
        let device = Device::new(
            MockTimer(Rc::new(Cell::new(0))),
            TestRng(7),
            P256Provider::new(),
            recorder.clone(),
            info(),
        )
        .unwrap();
        (device, recorder)
    }

    fn expect_send(device: &mut Device<TestConfig, Recorder>, opcode: Opcode) -> PduBuf {
        loop {
            match device.poll_request() {
                Some(BearerRequest::Send(pdu)) => {
                    assert_eq!(pdu.opcode(), opcode);
                    return pdu;
                }
                Some(_) => continue,
                None => panic!("expected a {:?} send request", opcode),
            }
        }
    }

    /// Drives a device up to the point where it waits for the Start PDU.
    fn enter_and_invite(device: &mut Device<TestConfig, Recorder>) {
        device
            .enter_pb_adv(0, Duration::from_millis(100))
            .unwrap();
        device.bearer_event(BearerEvent::LinkOpened);
        device.pdu_received(&[0x00, 0x00]);
        expect_send(device, Opcode::Capabilities);
        device.bearer_event(BearerEvent::PduSent(Opcode::Capabilities));
    }

    #[test]
    fn advertising_oob_key_without_key_is_rejected() {
        let mut bad = info();
        bad.capabilities.public_key_type = PublicKeyType::OOB_AVAILABLE;
        assert!(Device::<TestConfig, Recorder>::new(
            MockTimer(Rc::new(Cell::new(0))),
            TestRng(7),
            P256Provider::new(),
            Recorder::default(),
            bad,
        )
        .is_err());
    }

    #[test]
    fn duplicate_enter_is_rejected() {
        let (mut d, _r) = device();
        d.enter_pb_adv(0, Duration::from_millis(100)).unwrap();
        assert_eq!(
            d.enter_pb_adv(0, Duration::from_millis(100)).unwrap_err(),
            Error::InvalidState
        );
        assert_eq!(d.enter_pb_gatt(3).unwrap_err(), Error::InvalidState);
    }

    #[test]
    fn attention_timer_is_forwarded_and_cleared() {
        let (mut d, r) = device();
        d.enter_pb_adv(0, Duration::from_millis(100)).unwrap();
        d.bearer_event(BearerEvent::LinkOpened);
        d.pdu_received(&[0x00, 0x05]);

        assert!(r
            .0
            .borrow()
            .contains(&DeviceEvent::Attention { seconds: 5 }));

        // Aborting the session must stop drawing attention.
        d.bearer_event(BearerEvent::LinkClosed(CloseReason::Fail));
        let events = r.0.borrow();
        let pos_clear = events
            .iter()
            .position(|e| *e == DeviceEvent::Attention { seconds: 0 });
        let pos_failed = events
            .iter()
            .position(|e| *e == DeviceEvent::Failed(FailureReason::LinkClosedByPeer));
        assert!(pos_clear.is_some() && pos_clear < pos_failed);
    }

    #[test]
    fn invalid_start_gets_invalid_format() {
        let (mut d, _r) = device();
        enter_and_invite(&mut d);

        // Output OOB with size 0 is prohibited.
        d.pdu_received(&[0x02, 0x00, 0x00, 0x02, 0x00, 0x00]);
        let pdu = expect_send(&mut d, Opcode::Failed);
        assert_eq!(pdu.param(), &[u8::from(ErrorCode::InvalidFormat)]);

        // The error state answers subsequent PDUs with UnexpectedPdu.
        d.pdu_received(&[0x03; 65]);
        let pdu = expect_send(&mut d, Opcode::Failed);
        assert_eq!(pdu.param(), &[u8::from(ErrorCode::UnexpectedPdu)]);
    }

    #[test]
    fn start_requesting_unadvertised_oob_key_is_rejected() {
        let (mut d, _r) = device();
        enter_and_invite(&mut d);

        // No-OOB auth but an OOB public key we never advertised.
        d.pdu_received(&[0x02, 0x00, 0x01, 0x00, 0x00, 0x00]);
        let pdu = expect_send(&mut d, Opcode::Failed);
        assert_eq!(pdu.param(), &[u8::from(ErrorCode::InvalidFormat)]);
    }

    #[test]
    fn unknown_opcode_gets_invalid_pdu() {
        let (mut d, _r) = device();
        enter_and_invite(&mut d);

        d.pdu_received(&[0x0a]);
        let pdu = expect_send(&mut d, Opcode::Failed);
        assert_eq!(pdu.param(), &[u8::from(ErrorCode::InvalidPdu)]);
    }

    #[test]
    fn capabilities_opcode_from_peer_is_unexpected() {
        let (mut d, _r) = device();
        enter_and_invite(&mut d);

        d.pdu_received(PduBuf::capabilities(&info().capabilities).bytes());
        let pdu = expect_send(&mut d, Opcode::Failed);
        assert_eq!(pdu.param(), &[u8::from(ErrorCode::UnexpectedPdu)]);
    }

    #[test]
    fn error_state_expires_into_receive_timeout() {
        let (mut d, r) = device();
        enter_and_invite(&mut d);

        d.pdu_received(&[0x0a]);
        expect_send(&mut d, Opcode::Failed);
        assert!(d.next_timeout().is_some());

        d.timer_expired();
        assert_eq!(
            *r.0.borrow().last().unwrap(),
            DeviceEvent::Failed(FailureReason::ReceiveTimeout)
        );
        assert!(matches!(d.poll_request(), Some(BearerRequest::CloseSilent)));

        // A fresh session may start afterwards.
        d.enter_pb_adv(0, Duration::from_millis(100)).unwrap();
    }
}
