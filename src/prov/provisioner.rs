//! The Provisioner role (provisioning client).
//!
//! The Provisioner drives the protocol: it invites the device, selects the authentication
//! method from the advertised capabilities, exchanges public keys and confirmation values, and
//! finally delivers the encrypted provisioning data.
//!
//! All inputs (bearer callbacks, received PDUs, timer expiry, application actions and crypto
//! completions) are posted to one internal message queue and consumed by a single transition
//! function, so the protocol state can only change in one place. Most states wait for exactly
//! one message; a handful of extra transitions accept a PDU one state early, which happens when
//! the peer retransmits because an acknowledgment got lost on the air.

use heapless::Deque;
use rand_core::RngCore;
use uuid::Uuid;

use crate::bearer::{BearerEvent, CloseReason};
use crate::bytes::{ByteReader, FromBytes};
use crate::config::{Config, ConfSecretKey};
use crate::crypto::ccm;
use crate::crypto::ecdh::{EcdhProvider, PublicKey, SecretKey, SharedSecret};
use crate::prov::oob::{self, OobData, MAX_OOB_SIZE};
use crate::prov::pdu::{
    AuthMethod, Capabilities, InputOobActions, Opcode, OutputOobActions, PduBuf, PublicKeyType,
    StaticOobType, CAPABILITIES_PARAM_SIZE, DATA_SIZE,
};
use crate::prov::session::{OwnKeypair, Secrets, Transcript};
use crate::prov::{
    AppKeypair, BearerRequest, FailureReason, ProvisioningData, TRANSACTION_TIMEOUT,
};
use crate::time::{Instant, Timer};
use crate::Error;

/// Everything the application provides for one provisioning session.
pub struct SessionInfo<C: Config> {
    /// UUID of the device to be provisioned.
    pub device_uuid: Uuid,

    /// An ECC key pair to use instead of generating a fresh one.
    pub keypair: Option<AppKeypair>,

    /// The device's public key, when it was obtained out of band.
    ///
    /// Required to select `use_oob_public_key` in [`AuthSelection`].
    ///
    /// [`AuthSelection`]: struct.AuthSelection.html
    pub device_public_key: Option<PublicKey>,

    /// The shared static OOB value, when the device distributes one.
    pub static_oob: Option<[u8; 16]>,

    /// Attention timer duration in seconds put into the Invite (0 to not draw attention).
    pub attention_duration: u8,

    /// The data to deliver once the session is authenticated.
    pub data: ProvisioningData,

    #[doc(hidden)]
    pub _config: core::marker::PhantomData<C>,
}

/// The authentication method selected by the application after seeing the device capabilities.
pub struct AuthSelection {
    /// Use the out-of-band public key from [`SessionInfo::device_public_key`] instead of
    /// receiving it over the air.
    ///
    /// [`SessionInfo::device_public_key`]: struct.SessionInfo.html#structfield.device_public_key
    pub use_oob_public_key: bool,

    /// The OOB authentication method.
    pub method: SelectedAuth,
}

/// The OOB method and, where applicable, the selected action and size.
pub enum SelectedAuth {
    /// No OOB authentication.
    NoOob,

    /// Authenticate with the shared static OOB value.
    StaticOob,

    /// The device outputs a value which the user enters on the Provisioner.
    OutputOob {
        /// The selected output action; exactly one bit must be set, and it must be one the
        /// device advertised.
        action: OutputOobActions,
        /// Size of the value in digits or characters.
        size: u8,
    },

    /// The Provisioner displays a value which the user inputs on the device.
    InputOob {
        /// The selected input action; exactly one bit must be set, and it must be one the
        /// device advertised.
        action: InputOobActions,
        /// Size of the value in digits or characters.
        size: u8,
    },
}

/// Events the Provisioner reports to the application.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ProvisionerEvent {
    /// The provisioning link is established.
    LinkOpened,

    /// The device reported its capabilities; the application must now call
    /// [`select_authentication`].
    ///
    /// [`select_authentication`]: struct.Provisioner.html#method.select_authentication
    Capabilities(Capabilities),

    /// The device is outputting a value through the given action; the application must collect
    /// it from the user and call [`enter_output_oob`].
    ///
    /// [`enter_output_oob`]: struct.Provisioner.html#method.enter_output_oob
    EnterOutputOob {
        /// The output action the device performs.
        action: OutputOobActions,
    },

    /// Display `value` to the user so they can input it on the device.
    DisplayInputOob {
        /// The input action the user must perform on the device.
        action: InputOobActions,
        /// The generated value being displayed.
        value: OobData,
    },

    /// Provisioning finished; the device is now a node.
    Complete {
        /// UUID of the provisioned device.
        uuid: Uuid,
        /// Unicast address assigned to its primary element.
        address: u16,
        /// Number of elements it reported.
        num_elements: u8,
        /// The device key derived by both sides, for configuration traffic.
        device_key: [u8; 16],
    },

    /// Provisioning ended without success.
    Failed(FailureReason),
}

/// Trait the application implements to receive [`ProvisionerEvent`]s.
///
/// [`ProvisionerEvent`]: enum.ProvisionerEvent.html
pub trait ProvisionerHandler {
    /// Called whenever the Provisioner has something to report.
    ///
    /// `Complete` and `Failed` are terminal: exactly one of them ends every session.
    fn on_event(&mut self, event: ProvisionerEvent);
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum State {
    Idle,
    WaitLink,
    SendInvite,
    WaitCapabilities,
    WaitSelectAuth,
    SendStart,
    GeneratePublicKey,
    SendPublicKey,
    WaitPublicKey,
    ValidatePublicKey,
    PrepareOob,
    WaitInput,
    WaitInputComplete,
    CalcConfirmation,
    SendConfirmation,
    WaitConfirmation,
    SendRandom,
    WaitRandom,
    CheckConfirmation,
    CalcSessionKey,
    EncryptData,
    SendData,
    WaitComplete,
}

/// A message consumed by the state machine.
enum Msg {
    BeginNoLink { if_id: u8 },
    BeginLinkOpen { conn_id: u16 },
    LinkOpened,
    LinkFailed,
    LinkClosedSuccess,
    LinkClosedFail,
    RecvTimeout,
    SendTimeout,
    BadPdu,
    Cancel,
    Sent(Opcode),
    RecvCapabilities {
        caps: Capabilities,
        raw: [u8; CAPABILITIES_PARAM_SIZE],
    },
    RecvPublicKey(PublicKey),
    RecvInputComplete,
    RecvConfirmation([u8; 16]),
    RecvRandom([u8; 16]),
    RecvComplete,
    AuthSelected(AuthSelection),
    InputReady(OobData),
    GotoConfirmation,
    GotoWaitInput,
    GotoWaitInputComplete,
    KeyGenerated,
    KeyValid,
    KeyInvalid,
    ConfirmationReady([u8; 16]),
    ConfirmationVerified,
    ConfirmationFailed,
    SessionKeyReady,
    DataEncrypted,
}

struct Session<C: Config> {
    info: SessionInfo<C>,
    capabilities: Option<Capabilities>,
    auth: Option<AuthSelection>,
    /// Key pair generated for this session when the application supplied none.
    generated: Option<OwnKeypair<C>>,
    transcript: Transcript,
    ecdh: Option<SharedSecret>,
    secrets: Secrets,
}

impl<C: Config> Session<C> {
    fn new(info: SessionInfo<C>) -> Self {
        Self {
            info,
            capabilities: None,
            auth: None,
            generated: None,
            transcript: Transcript::new(),
            ecdh: None,
            secrets: Secrets::new(),
        }
    }
}

/// The Provisioner state machine.
///
/// One instance handles at most one session at a time; a second `start_*` while a session is
/// live is rejected. The owner drives it by forwarding bearer traffic into [`pdu_received`] and
/// [`bearer_event`], calling [`timer_expired`] when the deadline from [`next_timeout`] passes,
/// and draining [`poll_request`] into the bearer after every call.
///
/// [`pdu_received`]: #method.pdu_received
/// [`bearer_event`]: #method.bearer_event
/// [`timer_expired`]: #method.timer_expired
/// [`next_timeout`]: #method.next_timeout
/// [`poll_request`]: #method.poll_request
pub struct Provisioner<C: Config, E: ProvisionerHandler> {
    timer: C::Timer,
    rng: C::Rng,
    ecdh: C::Ecdh,
    events: E,
    state: State,
    session: Option<Session<C>>,
    queue: Deque<Msg, 8>,
    requests: Deque<BearerRequest, 4>,
    deadline: Option<Instant>,
}

impl<C: Config, E: ProvisionerHandler> Provisioner<C, E> {
    /// Creates an idle Provisioner.
    pub fn new(timer: C::Timer, rng: C::Rng, ecdh: C::Ecdh, events: E) -> Self {
        Self {
            timer,
            rng,
            ecdh,
            events,
            state: State::Idle,
            session: None,
            queue: Deque::new(),
            requests: Deque::new(),
            deadline: None,
        }
    }

    /// Starts provisioning the device described by `info` over PB-ADV.
    ///
    /// The bearer is asked to open a link to the device; the Invite goes out once the link is
    /// up.
    pub fn start_pb_adv(&mut self, if_id: u8, info: SessionInfo<C>) -> Result<(), Error> {
        if self.session.is_some() {
            return Err(Error::InvalidState);
        }

        self.session = Some(Session::new(info));
        self.post(Msg::BeginNoLink { if_id });
        self.drive();
        Ok(())
    }

    /// Starts provisioning over an existing PB-GATT connection.
    pub fn start_pb_gatt(&mut self, conn_id: u16, info: SessionInfo<C>) -> Result<(), Error> {
        if self.session.is_some() {
            return Err(Error::InvalidState);
        }

        self.session = Some(Session::new(info));
        self.post(Msg::BeginLinkOpen { conn_id });
        self.drive();
        Ok(())
    }

    /// Chooses the authentication method after a `Capabilities` event.
    ///
    /// The selection is validated against the capabilities the device advertised and the OOB
    /// material the application supplied in [`SessionInfo`]; an invalid selection is rejected
    /// without affecting the session.
    ///
    /// [`SessionInfo`]: struct.SessionInfo.html
    pub fn select_authentication(&mut self, selection: AuthSelection) -> Result<(), Error> {
        let session = self.session.as_ref().ok_or(Error::InvalidState)?;
        let caps = session.capabilities.ok_or(Error::InvalidState)?;

        if selection.use_oob_public_key
            && (session.info.device_public_key.is_none()
                || !caps.public_key_type.contains(PublicKeyType::OOB_AVAILABLE))
        {
            return Err(Error::InvalidValue);
        }

        match &selection.method {
            SelectedAuth::NoOob => {}
            SelectedAuth::StaticOob => {
                if session.info.static_oob.is_none()
                    || !caps.static_oob_type.contains(StaticOobType::AVAILABLE)
                {
                    return Err(Error::InvalidValue);
                }
            }
            SelectedAuth::OutputOob { action, size } => {
                if *size == 0 || *size > caps.output_oob_size {
                    return Err(Error::InvalidValue);
                }
                if action.bits().count_ones() != 1 || !caps.output_oob_actions.contains(*action) {
                    return Err(Error::InvalidValue);
                }
            }
            SelectedAuth::InputOob { action, size } => {
                if *size == 0 || *size > caps.input_oob_size {
                    return Err(Error::InvalidValue);
                }
                if action.bits().count_ones() != 1 || !caps.input_oob_actions.contains(*action) {
                    return Err(Error::InvalidValue);
                }
            }
        }

        self.post(Msg::AuthSelected(selection));
        self.drive();
        Ok(())
    }

    /// Supplies the output OOB value the user read off the device.
    pub fn enter_output_oob(&mut self, value: OobData) -> Result<(), Error> {
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

    /// Aborts the running session.
    ///
    /// Treated like a protocol error: the link is closed with the `Fail` reason and a
    /// `Failed(ProtocolError)` event ends the session.
    pub fn cancel(&mut self) {
        if self.session.is_some() {
            self.post(Msg::Cancel);
            self.drive();
        }
    }

    /// Feeds a provisioning PDU received by the bearer into the state machine.
    pub fn pdu_received(&mut self, pdu: &[u8]) {
        if pdu.is_empty() {
            return;
        }

        let opcode = Opcode::from(pdu[0]);
        let well_formed = opcode.pdu_size() == Some(pdu.len());
        let msg = match opcode {
            Opcode::Capabilities if well_formed => {
                let mut raw = [0; CAPABILITIES_PARAM_SIZE];
                raw.copy_from_slice(&pdu[1..]);
                match Capabilities::from_bytes(&mut ByteReader::new(&pdu[1..])) {
                    Ok(caps) => Msg::RecvCapabilities { caps, raw },
                    Err(_) => Msg::BadPdu,
                }
            }
            Opcode::PublicKey if well_formed => {
                let mut key = [0; 64];
                key.copy_from_slice(&pdu[1..]);
                Msg::RecvPublicKey(PublicKey(key))
            }
            Opcode::InputComplete if well_formed => Msg::RecvInputComplete,
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
            Opcode::Complete if well_formed => Msg::RecvComplete,
            // A Failed PDU, a PDU only the Provisioner may send, a malformed length, or an
            // unknown opcode: all protocol errors from the client's point of view.
            _ => {
                warn!("provisioner: bad PDU {:?} ({} bytes)", opcode, pdu.len());
                Msg::BadPdu
            }
        };

        self.post(msg);
        self.drive();
    }

    /// Feeds a bearer event into the state machine.
    pub fn bearer_event(&mut self, event: BearerEvent) {
        let msg = match event {
            BearerEvent::LinkOpened => Msg::LinkOpened,
            BearerEvent::LinkFailed => Msg::LinkFailed,
            BearerEvent::LinkClosed(CloseReason::Success) => Msg::LinkClosedSuccess,
            BearerEvent::LinkClosed(_) => Msg::LinkClosedFail,
            BearerEvent::PduSent(opcode) => Msg::Sent(opcode),
            BearerEvent::SendTimeout => Msg::SendTimeout,
            // Losing the GATT connection mid-session is a link failure.
            BearerEvent::ConnClosed => Msg::LinkClosedFail,
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

    fn post(&mut self, msg: Msg) {
        if self.queue.push_back(msg).is_err() {
            // The session will fail on the transaction timeout.
            error!("provisioner: message queue full");
        }
    }

    fn request(&mut self, request: BearerRequest) {
        if self.requests.push_back(request).is_err() {
            error!("provisioner: request queue full");
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

        // A terminal event has already been delivered once the session is gone; anything still
        // in flight (stale crypto completions, retransmitted PDUs) must not resurrect it.
        if self.session.is_none() {
            match msg {
                Msg::BeginNoLink { .. } | Msg::BeginLinkOpen { .. } => {}
                _ => return,
            }
        }

        match (self.state, msg) {
            (Idle, Msg::BeginNoLink { if_id }) => {
                self.state = WaitLink;
                self.act_open_link(if_id);
            }
            (Idle, Msg::BeginLinkOpen { conn_id }) => {
                self.state = SendInvite;
                self.act_send_invite(Some(conn_id));
            }

            (WaitLink, Msg::LinkOpened) => {
                self.state = SendInvite;
                self.act_send_invite(None);
            }
            (WaitLink, Msg::LinkFailed) => {
                self.state = Idle;
                self.act_link_failed();
            }

            (SendInvite, Msg::Sent(Opcode::Invite)) => {
                self.state = WaitCapabilities;
                self.act_wait_capabilities();
            }
            // The device only retransmits its Capabilities when it missed our ack, so accept
            // them before our own send completes.
            (SendInvite, Msg::RecvCapabilities { caps, raw })
            | (WaitCapabilities, Msg::RecvCapabilities { caps, raw }) => {
                self.state = WaitSelectAuth;
                self.act_select_auth(caps, raw);
            }

            (WaitSelectAuth, Msg::AuthSelected(selection)) => {
                self.state = SendStart;
                self.act_send_start(selection);
            }

            (SendStart, Msg::Sent(Opcode::Start)) => {
                self.state = GeneratePublicKey;
                self.act_generate_public_key();
            }

            (GeneratePublicKey, Msg::KeyGenerated) => {
                self.state = SendPublicKey;
                self.act_send_public_key();
            }

            (SendPublicKey, Msg::Sent(Opcode::PublicKey)) => {
                self.state = WaitPublicKey;
                self.act_wait_public_key();
            }
            (SendPublicKey, Msg::RecvPublicKey(key))
            | (WaitPublicKey, Msg::RecvPublicKey(key)) => {
                self.state = ValidatePublicKey;
                self.act_validate_public_key(key);
            }

            (ValidatePublicKey, Msg::KeyValid) => {
                self.state = PrepareOob;
                self.act_prepare_oob();
            }
            (ValidatePublicKey, Msg::KeyInvalid) => {
                self.state = Idle;
                self.act_public_key_invalid();
            }

            (PrepareOob, Msg::GotoConfirmation) => {
                self.state = CalcConfirmation;
                self.act_calc_confirmation(None);
            }
            (PrepareOob, Msg::GotoWaitInput) => {
                self.state = WaitInput;
                self.act_wait_input();
            }
            (PrepareOob, Msg::GotoWaitInputComplete) => {
                self.state = WaitInputComplete;
                self.act_wait_input_complete();
            }

            (WaitInput, Msg::InputReady(value)) => {
                self.state = CalcConfirmation;
                self.act_calc_confirmation(Some(value));
            }
            (WaitInputComplete, Msg::RecvInputComplete) => {
                self.state = CalcConfirmation;
                self.act_calc_confirmation(None);
            }

            (CalcConfirmation, Msg::ConfirmationReady(confirmation)) => {
                self.state = SendConfirmation;
                self.act_send_confirmation(confirmation);
            }

            (SendConfirmation, Msg::Sent(Opcode::Confirmation)) => {
                self.state = WaitConfirmation;
                self.act_wait_confirmation();
            }
            (SendConfirmation, Msg::RecvConfirmation(peer))
            | (WaitConfirmation, Msg::RecvConfirmation(peer)) => {
                self.state = SendRandom;
                self.act_send_random(peer);
            }

            (SendRandom, Msg::Sent(Opcode::Random)) => {
                self.state = WaitRandom;
                self.act_wait_random();
            }
            (SendRandom, Msg::RecvRandom(peer)) | (WaitRandom, Msg::RecvRandom(peer)) => {
                self.state = CheckConfirmation;
                self.act_check_confirmation(peer);
            }

            (CheckConfirmation, Msg::ConfirmationVerified) => {
                self.state = CalcSessionKey;
                self.act_calc_session_key();
            }
            (CheckConfirmation, Msg::ConfirmationFailed) => {
                self.state = Idle;
                self.act_confirmation_failed();
            }

            (CalcSessionKey, Msg::SessionKeyReady) => {
                self.state = EncryptData;
                self.act_encrypt_data();
            }

            (EncryptData, Msg::DataEncrypted) => {
                self.state = SendData;
                self.act_send_data();
            }

            (SendData, Msg::Sent(Opcode::Data)) => {
                self.state = WaitComplete;
                self.act_wait_complete();
            }
            (SendData, Msg::RecvComplete) | (WaitComplete, Msg::RecvComplete) => {
                self.state = Idle;
                self.act_success();
            }
            // The data went out and was acknowledged; a lost Complete (or a device that closes
            // the link right away) does not make the session a failure.
            (WaitComplete, Msg::LinkClosedSuccess) | (WaitComplete, Msg::RecvTimeout) => {
                self.state = Idle;
                self.act_success();
            }

            (_, msg) => self.common(msg),
        }
    }

    /// Transitions shared by every state; consulted when the current state has no entry for the
    /// message.
    fn common(&mut self, msg: Msg) {
        match msg {
            Msg::LinkClosedFail => {
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
            // Any PDU out of sequence, anything malformed, and a user abort all take the same
            // exit.
            Msg::BadPdu
            | Msg::Cancel
            | Msg::RecvCapabilities { .. }
            | Msg::RecvPublicKey(_)
            | Msg::RecvInputComplete
            | Msg::RecvConfirmation(_)
            | Msg::RecvRandom(_)
            | Msg::RecvComplete => {
                self.state = State::Idle;
                self.act_protocol_error();
            }
            _ => {}
        }
    }

    fn act_open_link(&mut self, if_id: u8) {
        let uuid = match &self.session {
            Some(session) => session.info.device_uuid,
            None => return,
        };
        self.request(BearerRequest::EnableAdvClient { if_id });
        self.request(BearerRequest::OpenLink { uuid });
    }

    fn act_send_invite(&mut self, gatt_conn: Option<u16>) {
        match gatt_conn {
            // Coming from `start_pb_gatt`: the connection already exists; hook the bearer up.
            Some(conn_id) => self.request(BearerRequest::EnableGattClient { conn_id }),
            // Coming from the PB-ADV link opening: tell the application.
            None => self.events.on_event(ProvisionerEvent::LinkOpened),
        }

        let session = match &mut self.session {
            Some(session) => session,
            None => return,
        };
        let pdu = PduBuf::invite(session.info.attention_duration);
        session.transcript.set_invite(pdu.param());
        self.request(BearerRequest::Send(pdu));
    }

    fn act_wait_capabilities(&mut self) {
        self.arm_timer();
    }

    fn act_select_auth(&mut self, caps: Capabilities, raw: [u8; CAPABILITIES_PARAM_SIZE]) {
        let session = match &mut self.session {
            Some(session) => session,
            None => return,
        };
        session.transcript.set_capabilities(&raw);
        session.capabilities = Some(caps);
        self.events.on_event(ProvisionerEvent::Capabilities(caps));
    }

    fn act_send_start(&mut self, selection: AuthSelection) {
        let session = match &mut self.session {
            Some(session) => session,
            None => return,
        };

        let (auth_method, auth_action, auth_size) = match &selection.method {
            SelectedAuth::NoOob => (AuthMethod::NoOob, 0, 0),
            SelectedAuth::StaticOob => (AuthMethod::StaticOob, 0, 0),
            SelectedAuth::OutputOob { action, size } => {
                (AuthMethod::OutputOob, oob::bit_position(action.bits()), *size)
            }
            SelectedAuth::InputOob { action, size } => {
                (AuthMethod::InputOob, oob::bit_position(action.bits()), *size)
            }
        };

        let pdu = PduBuf::start(&crate::prov::pdu::Start {
            algorithm: crate::prov::pdu::Algorithm::FipsP256,
            public_key: selection.use_oob_public_key as u8,
            auth_method,
            auth_action,
            auth_size,
        });
        session.transcript.set_start(pdu.param());
        session.auth = Some(selection);
        self.request(BearerRequest::Send(pdu));
    }

    fn act_generate_public_key(&mut self) {
        let session = match &mut self.session {
            Some(session) => session,
            None => return,
        };

        if session.info.keypair.is_none() {
            let (secret, public) = self.ecdh.generate_keypair(&mut self.rng);
            session.generated = Some(OwnKeypair { secret, public });
        }

        self.post(Msg::KeyGenerated);
    }

    fn act_send_public_key(&mut self) {
        let session = match &self.session {
            Some(session) => session,
            None => return,
        };
        let public = match (
            session.info.keypair.as_ref(),
            session.generated.as_ref(),
        ) {
            (Some(keypair), _) => keypair.public,
            (None, Some(keypair)) => keypair.public,
            (None, None) => {
                error!("provisioner: no key pair to send");
                return;
            }
        };

        let pdu = PduBuf::public_key(&public);
        let session = match &mut self.session {
            Some(session) => session,
            None => return,
        };
        session.transcript.set_provisioner_key(pdu.param());
        self.request(BearerRequest::Send(pdu));
    }

    fn act_wait_public_key(&mut self) {
        let session = match &self.session {
            Some(session) => session,
            None => return,
        };
        let use_oob = session
            .auth
            .as_ref()
            .map(|auth| auth.use_oob_public_key)
            .unwrap_or(false);

        if !use_oob {
            self.arm_timer();
        } else {
            // The device's public key is already known out of band; feed it in as if it had
            // just been received.
            match session.info.device_public_key {
                Some(key) => self.post(Msg::RecvPublicKey(key)),
                None => error!("provisioner: OOB public key selected but not supplied"),
            }
        }
    }

    fn act_validate_public_key(&mut self, key: PublicKey) {
        self.stop_timer();
        let session = match &mut self.session {
            Some(session) => session,
            None => return,
        };
        session.transcript.set_device_key(&key.0);

        let secret = match &session.info.keypair {
            Some(app) => <ConfSecretKey<C> as SecretKey>::from_bytes(&app.secret).ok(),
            None => session.generated.take().map(|keypair| keypair.secret),
        };
        let msg = match secret {
            Some(secret) => match secret.agree(&key) {
                Ok(shared) => {
                    session.ecdh = Some(shared);
                    Msg::KeyValid
                }
                Err(_) => Msg::KeyInvalid,
            },
            None => {
                error!("provisioner: no usable private key for ECDH");
                Msg::KeyInvalid
            }
        };
        self.post(msg);
    }

    fn act_prepare_oob(&mut self) {
        let session = match &mut self.session {
            Some(session) => session,
            None => return,
        };
        let method = match &session.auth {
            Some(auth) => &auth.method,
            None => return,
        };

        match method {
            SelectedAuth::OutputOob { .. } => self.post(Msg::GotoWaitInput),
            SelectedAuth::InputOob { .. } => self.post(Msg::GotoWaitInputComplete),
            SelectedAuth::NoOob => {
                session.secrets.auth_value = [0; 16];
                self.post(Msg::GotoConfirmation);
            }
            SelectedAuth::StaticOob => match session.info.static_oob {
                Some(value) => {
                    session.secrets.auth_value = value;
                    self.post(Msg::GotoConfirmation);
                }
                // Unreachable: `select_authentication` refuses static OOB without a value.
                None => error!("provisioner: static OOB selected but not supplied"),
            },
        }
    }

    fn act_public_key_invalid(&mut self) {
        self.events
            .on_event(ProvisionerEvent::Failed(FailureReason::InvalidPublicKey));
        self.request(BearerRequest::Close(CloseReason::Fail));
        self.cleanup();
    }

    fn act_wait_input(&mut self) {
        let action = match &self.session {
            Some(session) => match &session.auth {
                Some(AuthSelection {
                    method: SelectedAuth::OutputOob { action, .. },
                    ..
                }) => *action,
                _ => return,
            },
            None => return,
        };

        self.events
            .on_event(ProvisionerEvent::EnterOutputOob { action });
    }

    fn act_wait_input_complete(&mut self) {
        let (action, size) = match &self.session {
            Some(session) => match &session.auth {
                Some(AuthSelection {
                    method: SelectedAuth::InputOob { action, size },
                    ..
                }) => (*action, *size),
                _ => return,
            },
            None => return,
        };

        // Generate the value the user will input on the device, and fold it into the AuthValue
        // right away.
        let value = if action == InputOobActions::ALPHANUMERIC {
            let mut data = [0; MAX_OOB_SIZE];
            oob::random_alphanumeric(&mut self.rng, &mut data[..usize::from(size)]);
            OobData::Alphanumeric { data, len: size }
        } else {
            OobData::Numeric(oob::random_numeric(&mut self.rng, size))
        };

        if let Some(session) = &mut self.session {
            value.pack_into_auth_value(&mut session.secrets.auth_value);
        }

        self.events
            .on_event(ProvisionerEvent::DisplayInputOob { action, value });
        self.arm_timer();
    }

    fn act_calc_confirmation(&mut self, entered: Option<OobData>) {
        self.stop_timer();
        let session = match &mut self.session {
            Some(session) => session,
            None => return,
        };

        if let Some(value) = entered {
            value.pack_into_auth_value(&mut session.secrets.auth_value);
        }

        let ecdh = match &session.ecdh {
            Some(ecdh) => ecdh,
            None => return,
        };
        session
            .secrets
            .derive_confirmation_key(&session.transcript, ecdh);

        let mut random = [0; 16];
        self.rng.fill_bytes(&mut random);
        session.secrets.random_provisioner = random;

        let confirmation = session.secrets.confirmation(&random);
        self.post(Msg::ConfirmationReady(confirmation));
    }

    fn act_send_confirmation(&mut self, confirmation: [u8; 16]) {
        self.request(BearerRequest::Send(PduBuf::confirmation(&confirmation)));
    }

    fn act_wait_confirmation(&mut self) {
        self.arm_timer();
    }

    fn act_send_random(&mut self, peer_confirmation: [u8; 16]) {
        self.stop_timer();
        let session = match &mut self.session {
            Some(session) => session,
            None => return,
        };
        session.secrets.peer_confirmation = peer_confirmation;

        let pdu = PduBuf::random(&session.secrets.random_provisioner);
        self.request(BearerRequest::Send(pdu));
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
        session.secrets.random_device = peer_random;

        let expected = session.secrets.confirmation(&peer_random);
        if expected == session.secrets.peer_confirmation {
            self.post(Msg::ConfirmationVerified);
        } else {
            info!("provisioner: peer confirmation does not verify");
            self.post(Msg::ConfirmationFailed);
        }
    }

    fn act_confirmation_failed(&mut self) {
        self.events
            .on_event(ProvisionerEvent::Failed(FailureReason::ConfirmationFailed));
        self.request(BearerRequest::Close(CloseReason::Fail));
        self.cleanup();
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

    fn act_encrypt_data(&mut self) {
        self.stop_timer();
        let session = match &mut self.session {
            Some(session) => session,
            None => return,
        };

        let plain = session.info.data.pack();
        session.secrets.data_mic[..DATA_SIZE].copy_from_slice(&plain);
        let (payload, mic) = session.secrets.data_mic.split_at_mut(DATA_SIZE);
        match ccm::encrypt(
            &session.secrets.session_key,
            &session.secrets.session_nonce,
            payload,
        ) {
            Ok(tag) => {
                mic.copy_from_slice(&tag);
                self.post(Msg::DataEncrypted);
            }
            Err(_) => error!("provisioner: data encryption failed"),
        }
    }

    fn act_send_data(&mut self) {
        let data = match &self.session {
            Some(session) => session.secrets.data_mic,
            None => return,
        };
        self.request(BearerRequest::Send(PduBuf::data(&data)));
    }

    fn act_wait_complete(&mut self) {
        self.arm_timer();
    }

    fn act_success(&mut self) {
        self.request(BearerRequest::Close(CloseReason::Success));

        if let Some(session) = &self.session {
            let num_elements = session
                .capabilities
                .map(|caps| caps.num_elements)
                .unwrap_or(0);
            self.events.on_event(ProvisionerEvent::Complete {
                uuid: session.info.device_uuid,
                address: session.info.data.address,
                num_elements,
                device_key: session.secrets.device_key,
            });
        }
        self.cleanup();
    }

    fn act_link_failed(&mut self) {
        self.events
            .on_event(ProvisionerEvent::Failed(FailureReason::LinkNotEstablished));
        self.cleanup();
    }

    fn act_link_closed(&mut self) {
        self.events
            .on_event(ProvisionerEvent::Failed(FailureReason::LinkClosedByPeer));
        self.cleanup();
    }

    fn act_protocol_error(&mut self) {
        self.events
            .on_event(ProvisionerEvent::Failed(FailureReason::ProtocolError));
        self.request(BearerRequest::Close(CloseReason::Fail));
        self.cleanup();
    }

    fn act_recv_timeout(&mut self) {
        self.request(BearerRequest::Close(CloseReason::Fail));
        self.events
            .on_event(ProvisionerEvent::Failed(FailureReason::ReceiveTimeout));
        self.cleanup();
    }

    fn act_send_timeout(&mut self) {
        self.events
            .on_event(ProvisionerEvent::Failed(FailureReason::SendTimeout));
        self.cleanup();
    }

    fn cleanup(&mut self) {
        self.stop_timer();
        self.session = None;
        self.queue.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::ecdh::P256Provider;
    use std::cell::Cell;
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
    struct Recorder(Rc<std::cell::RefCell<Vec<ProvisionerEvent>>>);

    impl ProvisionerHandler for Recorder {
        fn on_event(&mut self, event: ProvisionerEvent) {
            self.0.borrow_mut().push(event);
        }
    }

    fn session_info() -> SessionInfo<TestConfig> {
        SessionInfo {
            device_uuid: Uuid::from_bytes([0x42; 16]),
            keypair: None,
            device_public_key: None,
            static_oob: None,
            attention_duration: 0,
            data: ProvisioningData {
                net_key: [0; 16],
                net_key_index: 0,
                flags: 0,
                iv_index: 0,
                address: 0x0005,
            },
            _config: core::marker::PhantomData,
        }
    }

    fn provisioner() -> (Provisioner<TestConfig, Recorder>, Recorder) {
        let recorder = Recorder::default();
        let provisioner = Provisioner::new(
            MockTimer(Rc::new(Cell::new(0))),
            TestRng(99),
            P256Provider::new(),
            recorder.clone(),
        );
        (provisioner, recorder)
    }

    fn caps_pdu(caps: &Capabilities) -> Vec<u8> {
        PduBuf::capabilities(caps).bytes().to_vec()
    }

    fn no_oob_caps() -> Capabilities {
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

    /// Drives a provisioner up to the `Capabilities` event.
    fn start_until_capabilities(
        p: &mut Provisioner<TestConfig, Recorder>,
        caps: &Capabilities,
    ) {
        p.start_pb_adv(0, session_info()).unwrap();
        assert!(matches!(
            p.poll_request(),
            Some(BearerRequest::EnableAdvClient { if_id: 0 })
        ));
        assert!(matches!(p.poll_request(), Some(BearerRequest::OpenLink { .. })));

        p.bearer_event(BearerEvent::LinkOpened);
        match p.poll_request() {
            Some(BearerRequest::Send(pdu)) => assert_eq!(pdu.opcode(), Opcode::Invite),
            other => panic!("expected invite send, got {:?}", other.is_some()),
        }
        p.bearer_event(BearerEvent::PduSent(Opcode::Invite));
        p.pdu_received(&caps_pdu(caps));
    }

    #[test]
    fn duplicate_start_is_rejected() {
        let (mut p, _r) = provisioner();
        p.start_pb_adv(0, session_info()).unwrap();
        assert_eq!(
            p.start_pb_adv(0, session_info()).unwrap_err(),
            Error::InvalidState
        );
        assert_eq!(p.start_pb_gatt(1, session_info()).unwrap_err(), Error::InvalidState);
    }

    #[test]
    fn capabilities_are_reported() {
        let (mut p, r) = provisioner();
        let caps = no_oob_caps();
        start_until_capabilities(&mut p, &caps);
        assert_eq!(
            r.0.borrow()[..],
            [
                ProvisionerEvent::LinkOpened,
                ProvisionerEvent::Capabilities(caps),
            ]
        );
    }

    #[test]
    fn select_auth_validates_against_capabilities() {
        let (mut p, _r) = provisioner();
        start_until_capabilities(&mut p, &no_oob_caps());

        // Static OOB was not advertised (nor supplied).
        assert_eq!(
            p.select_authentication(AuthSelection {
                use_oob_public_key: false,
                method: SelectedAuth::StaticOob,
            })
            .unwrap_err(),
            Error::InvalidValue
        );

        // Output OOB was not advertised.
        assert_eq!(
            p.select_authentication(AuthSelection {
                use_oob_public_key: false,
                method: SelectedAuth::OutputOob {
                    action: OutputOobActions::NUMERIC,
                    size: 4,
                },
            })
            .unwrap_err(),
            Error::InvalidValue
        );

        // An OOB public key was never supplied.
        assert_eq!(
            p.select_authentication(AuthSelection {
                use_oob_public_key: true,
                method: SelectedAuth::NoOob,
            })
            .unwrap_err(),
            Error::InvalidValue
        );

        // Plain No-OOB is always allowed.
        p.select_authentication(AuthSelection {
            use_oob_public_key: false,
            method: SelectedAuth::NoOob,
        })
        .unwrap();
    }

    #[test]
    fn select_auth_requires_single_action_bit() {
        let (mut p, _r) = provisioner();
        let mut caps = no_oob_caps();
        caps.output_oob_size = 4;
        caps.output_oob_actions = OutputOobActions::BLINK | OutputOobActions::NUMERIC;
        start_until_capabilities(&mut p, &caps);

        assert_eq!(
            p.select_authentication(AuthSelection {
                use_oob_public_key: false,
                method: SelectedAuth::OutputOob {
                    action: OutputOobActions::BLINK | OutputOobActions::NUMERIC,
                    size: 4,
                },
            })
            .unwrap_err(),
            Error::InvalidValue
        );

        p.select_authentication(AuthSelection {
            use_oob_public_key: false,
            method: SelectedAuth::OutputOob {
                action: OutputOobActions::NUMERIC,
                size: 4,
            },
        })
        .unwrap();
    }

    #[test]
    fn cancel_fails_the_session() {
        let (mut p, r) = provisioner();
        start_until_capabilities(&mut p, &no_oob_caps());
        p.cancel();

        assert_eq!(
            *r.0.borrow().last().unwrap(),
            ProvisionerEvent::Failed(FailureReason::ProtocolError)
        );
        assert!(matches!(
            p.poll_request(),
            Some(BearerRequest::Close(CloseReason::Fail))
        ));

        // The session is gone; nothing may produce further events.
        let before = r.0.borrow().len();
        p.pdu_received(&caps_pdu(&no_oob_caps()));
        p.bearer_event(BearerEvent::LinkClosed(CloseReason::Fail));
        p.cancel();
        assert_eq!(r.0.borrow().len(), before);

        // But a new session may start.
        p.start_pb_adv(0, session_info()).unwrap();
    }

    #[test]
    fn timeout_while_waiting_for_capabilities() {
        let (mut p, r) = provisioner();
        p.start_pb_adv(0, session_info()).unwrap();
        p.bearer_event(BearerEvent::LinkOpened);
        p.bearer_event(BearerEvent::PduSent(Opcode::Invite));
        assert!(p.next_timeout().is_some());

        p.timer_expired();
        assert_eq!(
            *r.0.borrow().last().unwrap(),
            ProvisionerEvent::Failed(FailureReason::ReceiveTimeout)
        );
        assert!(p.next_timeout().is_none());
    }

    #[test]
    fn failed_pdu_is_a_protocol_error() {
        let (mut p, r) = provisioner();
        start_until_capabilities(&mut p, &no_oob_caps());

        p.pdu_received(&[0x09, 0x03]);
        assert_eq!(
            *r.0.borrow().last().unwrap(),
            ProvisionerEvent::Failed(FailureReason::ProtocolError)
        );
    }
}
