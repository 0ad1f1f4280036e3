//! Provisioning PDU definitions.
//!
//! Every provisioning PDU is a 1-byte opcode followed by a fixed-size parameter block (the
//! protocol has no variable-length PDUs). Multi-byte fields are Big Endian. Outgoing PDUs are
//! built into a [`PduBuf`]; incoming PDUs are dispatched on their [`Opcode`] by the role state
//! machines, which also enforce the exact length of each PDU.
//!
//! [`PduBuf`]: struct.PduBuf.html
//! [`Opcode`]: enum.Opcode.html

use bitflags::bitflags;
use byteorder::{BigEndian, ByteOrder};
use core::fmt;

use crate::bytes::{ByteReader, FromBytes};
use crate::crypto::ecdh::PublicKey;
use crate::utils::HexSlice;
use crate::Error;

/// Maximum size of a provisioning PDU (the Public Key PDU: opcode plus 64 bytes of key).
pub const MAX_PDU_SIZE: usize = 65;

/// Size of the Invite PDU parameter (the attention duration).
pub const INVITE_PARAM_SIZE: usize = 1;

/// Size of the Capabilities PDU parameter.
pub const CAPABILITIES_PARAM_SIZE: usize = 11;

/// Size of the Start PDU parameter.
pub const START_PARAM_SIZE: usize = 5;

/// Size of the Public Key PDU parameter (X and Y coordinates).
pub const PUBLIC_KEY_PARAM_SIZE: usize = 64;

/// Size of a Confirmation or Random value.
pub const CONFIRMATION_SIZE: usize = 16;

/// Size of the encrypted provisioning data (without the MIC).
pub const DATA_SIZE: usize = 25;

/// Size of the Data PDU parameter (encrypted provisioning data plus MIC).
pub const DATA_PARAM_SIZE: usize = DATA_SIZE + crate::crypto::ccm::MIC_LEN;

enum_with_unknown! {
    /// Provisioning PDU opcodes.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum Opcode(u8) {
        /// Invites a device to join a mesh network.
        Invite = 0x00,
        /// Reports the capabilities of the device.
        Capabilities = 0x01,
        /// Communicates the provisioning method selected by the Provisioner.
        Start = 0x02,
        /// Carries the ephemeral public key of either peer.
        PublicKey = 0x03,
        /// Signals that the user has finished inputting the OOB value.
        InputComplete = 0x04,
        /// Carries the confirmation value of either peer.
        Confirmation = 0x05,
        /// Carries the random value of either peer.
        Random = 0x06,
        /// Delivers the encrypted provisioning data.
        Data = 0x07,
        /// Signals successful completion.
        Complete = 0x08,
        /// Reports a provisioning error with an error code.
        Failed = 0x09,
    }
}

impl Opcode {
    /// Returns the exact on-air size (opcode included) of PDUs with this opcode, or `None` for
    /// unknown opcodes.
    pub fn pdu_size(self) -> Option<usize> {
        Some(match self {
            Opcode::Invite => 1 + INVITE_PARAM_SIZE,
            Opcode::Capabilities => 1 + CAPABILITIES_PARAM_SIZE,
            Opcode::Start => 1 + START_PARAM_SIZE,
            Opcode::PublicKey => 1 + PUBLIC_KEY_PARAM_SIZE,
            Opcode::InputComplete => 1,
            Opcode::Confirmation => 1 + CONFIRMATION_SIZE,
            Opcode::Random => 1 + CONFIRMATION_SIZE,
            Opcode::Data => 1 + DATA_PARAM_SIZE,
            Opcode::Complete => 1,
            Opcode::Failed => 2,
            Opcode::Unknown(_) => return None,
        })
    }
}

enum_with_unknown! {
    /// Error codes carried in the Provisioning Failed PDU.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum ErrorCode(u8) {
        /// The PDU opcode is not recognized by the device.
        InvalidPdu = 0x01,
        /// A PDU parameter is outside the expected values, or the PDU length is wrong.
        InvalidFormat = 0x02,
        /// The PDU was not expected at this point of the procedure.
        UnexpectedPdu = 0x03,
        /// The computed confirmation value could not be verified.
        ConfirmationFailed = 0x04,
        /// The device is out of resources.
        OutOfResources = 0x05,
        /// The provisioning data could not be decrypted.
        DecryptionFailed = 0x06,
        /// An unexpected, possibly unrecoverable error occurred.
        UnexpectedError = 0x07,
        /// The device cannot assign consecutive unicast addresses to all elements.
        CannotAssignAddresses = 0x08,
    }
}

enum_with_unknown! {
    /// The provisioning algorithm selected in the Start PDU.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum Algorithm(u8) {
        /// FIPS P-256 elliptic curve; the only algorithm defined.
        FipsP256 = 0x00,
    }
}

enum_with_unknown! {
    /// The authentication method selected in the Start PDU.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum AuthMethod(u8) {
        /// No OOB authentication; the AuthValue is all-zero.
        NoOob = 0x00,
        /// A 16-byte static OOB value distributed out of band.
        StaticOob = 0x01,
        /// The device outputs a value that the provisioning user enters on the Provisioner.
        OutputOob = 0x02,
        /// The Provisioner displays a value that the user inputs on the device.
        InputOob = 0x03,
    }
}

bitflags! {
    /// The key agreement algorithms a device supports.
    pub struct Algorithms: u16 {
        const FIPS_P256 = 1 << 0;
    }
}

bitflags! {
    /// Whether the device's public key is available out of band.
    pub struct PublicKeyType: u8 {
        const OOB_AVAILABLE = 1 << 0;
    }
}

bitflags! {
    /// Whether a static OOB value is available.
    pub struct StaticOobType: u8 {
        const AVAILABLE = 1 << 0;
    }
}

bitflags! {
    /// The output OOB actions a device supports.
    ///
    /// In the Capabilities PDU this is a mask of everything supported; the Start PDU then selects
    /// exactly one action by its bit position.
    pub struct OutputOobActions: u16 {
        const BLINK        = 1 << 0;
        const BEEP         = 1 << 1;
        const VIBRATE      = 1 << 2;
        const NUMERIC      = 1 << 3;
        const ALPHANUMERIC = 1 << 4;
    }
}

bitflags! {
    /// The input OOB actions a device supports.
    pub struct InputOobActions: u16 {
        const PUSH         = 1 << 0;
        const TWIST        = 1 << 1;
        const NUMERIC      = 1 << 2;
        const ALPHANUMERIC = 1 << 3;
    }
}

/// Number of output OOB actions defined; a Start PDU action value must be below this.
pub const OUTPUT_OOB_ACTIONS: u8 = 5;

/// Number of input OOB actions defined.
pub const INPUT_OOB_ACTIONS: u8 = 4;

/// Bit position selecting the alphanumeric output action.
pub const OUTPUT_OOB_ACTION_ALPHANUMERIC: u8 = 4;

/// The capabilities a device reports in response to an Invite.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Capabilities {
    /// Number of elements of the device (0 is prohibited).
    pub num_elements: u8,
    /// Supported key agreement algorithms.
    pub algorithms: Algorithms,
    /// Whether the public key is also available out of band.
    pub public_key_type: PublicKeyType,
    /// Whether a static OOB value is available.
    pub static_oob_type: StaticOobType,
    /// Maximum size of the output OOB value (0 if output OOB is unsupported).
    pub output_oob_size: u8,
    /// Supported output OOB actions.
    pub output_oob_actions: OutputOobActions,
    /// Maximum size of the input OOB value (0 if input OOB is unsupported).
    pub input_oob_size: u8,
    /// Supported input OOB actions.
    pub input_oob_actions: InputOobActions,
}

impl<'a> FromBytes<'a> for Capabilities {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        Ok(Self {
            num_elements: bytes.read_u8()?,
            algorithms: Algorithms::from_bits_truncate(bytes.read_u16_be()?),
            public_key_type: PublicKeyType::from_bits_truncate(bytes.read_u8()?),
            static_oob_type: StaticOobType::from_bits_truncate(bytes.read_u8()?),
            output_oob_size: bytes.read_u8()?,
            output_oob_actions: OutputOobActions::from_bits_truncate(bytes.read_u16_be()?),
            input_oob_size: bytes.read_u8()?,
            input_oob_actions: InputOobActions::from_bits_truncate(bytes.read_u16_be()?),
        })
    }
}

/// The parameters of the Start PDU.
///
/// Fields are kept wire-raw here; range and capability validation is the Provisioning Server's
/// job and produces a `Failed(InvalidFormat)` PDU rather than a parse error.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Start {
    /// Selected algorithm.
    pub algorithm: Algorithm,
    /// `0x01` when the device's OOB public key is used, `0x00` when it is sent over the air.
    /// Values above `0x01` are prohibited.
    pub public_key: u8,
    /// Selected authentication method.
    pub auth_method: AuthMethod,
    /// Selected OOB action, as a bit position into the advertised action mask. Zero for the
    /// `NoOob` and `StaticOob` methods.
    pub auth_action: u8,
    /// Size of the OOB value in digits or characters (1..=8). Zero for the `NoOob` and
    /// `StaticOob` methods.
    pub auth_size: u8,
}

impl<'a> FromBytes<'a> for Start {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        Ok(Self {
            algorithm: Algorithm::from(bytes.read_u8()?),
            public_key: bytes.read_u8()?,
            auth_method: AuthMethod::from(bytes.read_u8()?),
            auth_action: bytes.read_u8()?,
            auth_size: bytes.read_u8()?,
        })
    }
}

/// A buffer holding an outgoing provisioning PDU.
#[derive(Copy, Clone)]
pub struct PduBuf {
    buf: [u8; MAX_PDU_SIZE],
    len: u8,
}

impl PduBuf {
    fn new(opcode: Opcode, param: &[u8]) -> Self {
        debug_assert!(param.len() < MAX_PDU_SIZE);

        let mut buf = [0; MAX_PDU_SIZE];
        buf[0] = opcode.into();
        buf[1..1 + param.len()].copy_from_slice(param);
        Self {
            buf,
            len: (1 + param.len()) as u8,
        }
    }

    /// Creates an Invite PDU with the given attention timer duration in seconds.
    pub fn invite(attention_duration: u8) -> Self {
        Self::new(Opcode::Invite, &[attention_duration])
    }

    /// Creates a Capabilities PDU.
    pub fn capabilities(caps: &Capabilities) -> Self {
        let mut param = [0; CAPABILITIES_PARAM_SIZE];
        param[0] = caps.num_elements;
        BigEndian::write_u16(&mut param[1..3], caps.algorithms.bits());
        param[3] = caps.public_key_type.bits();
        param[4] = caps.static_oob_type.bits();
        param[5] = caps.output_oob_size;
        BigEndian::write_u16(&mut param[6..8], caps.output_oob_actions.bits());
        param[8] = caps.input_oob_size;
        BigEndian::write_u16(&mut param[9..11], caps.input_oob_actions.bits());
        Self::new(Opcode::Capabilities, &param)
    }

    /// Creates a Start PDU.
    pub fn start(start: &Start) -> Self {
        let param = [
            start.algorithm.into(),
            start.public_key,
            start.auth_method.into(),
            start.auth_action,
            start.auth_size,
        ];
        Self::new(Opcode::Start, &param)
    }

    /// Creates a Public Key PDU.
    pub fn public_key(key: &PublicKey) -> Self {
        Self::new(Opcode::PublicKey, &key.0)
    }

    /// Creates an Input Complete PDU.
    pub fn input_complete() -> Self {
        Self::new(Opcode::InputComplete, &[])
    }

    /// Creates a Confirmation PDU.
    pub fn confirmation(confirmation: &[u8; CONFIRMATION_SIZE]) -> Self {
        Self::new(Opcode::Confirmation, confirmation)
    }

    /// Creates a Random PDU.
    pub fn random(random: &[u8; CONFIRMATION_SIZE]) -> Self {
        Self::new(Opcode::Random, random)
    }

    /// Creates a Data PDU from the encrypted provisioning data and its MIC.
    pub fn data(encrypted_and_mic: &[u8; DATA_PARAM_SIZE]) -> Self {
        Self::new(Opcode::Data, encrypted_and_mic)
    }

    /// Creates a Complete PDU.
    pub fn complete() -> Self {
        Self::new(Opcode::Complete, &[])
    }

    /// Creates a Failed PDU carrying the given error code.
    pub fn failed(code: ErrorCode) -> Self {
        Self::new(Opcode::Failed, &[code.into()])
    }

    /// Returns the opcode of the PDU in this buffer.
    pub fn opcode(&self) -> Opcode {
        Opcode::from(self.buf[0])
    }

    /// Returns the encoded PDU (opcode and parameters).
    pub fn bytes(&self) -> &[u8] {
        &self.buf[..usize::from(self.len)]
    }

    /// Returns the PDU parameters without the opcode.
    ///
    /// This is the portion of a PDU that enters the ConfirmationInputs.
    pub fn param(&self) -> &[u8] {
        &self.bytes()[1..]
    }
}

impl fmt::Debug for PduBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {:?}", self.opcode(), HexSlice(self.param()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pdu_sizes() {
        assert_eq!(Opcode::Invite.pdu_size(), Some(2));
        assert_eq!(Opcode::Capabilities.pdu_size(), Some(12));
        assert_eq!(Opcode::Start.pdu_size(), Some(6));
        assert_eq!(Opcode::PublicKey.pdu_size(), Some(65));
        assert_eq!(Opcode::InputComplete.pdu_size(), Some(1));
        assert_eq!(Opcode::Confirmation.pdu_size(), Some(17));
        assert_eq!(Opcode::Random.pdu_size(), Some(17));
        assert_eq!(Opcode::Data.pdu_size(), Some(34));
        assert_eq!(Opcode::Complete.pdu_size(), Some(1));
        assert_eq!(Opcode::Failed.pdu_size(), Some(2));
        assert_eq!(Opcode::Unknown(0x0a).pdu_size(), None);
    }

    #[test]
    fn built_pdus_have_wire_size() {
        assert_eq!(PduBuf::invite(5).bytes(), &[0x00, 0x05]);
        assert_eq!(PduBuf::input_complete().bytes(), &[0x04]);
        assert_eq!(PduBuf::complete().bytes(), &[0x08]);
        assert_eq!(
            PduBuf::failed(ErrorCode::UnexpectedPdu).bytes(),
            &[0x09, 0x03]
        );

        let pdu = PduBuf::confirmation(&[0xab; 16]);
        assert_eq!(pdu.bytes().len(), Opcode::Confirmation.pdu_size().unwrap());
        assert_eq!(pdu.param(), &[0xab; 16]);
    }

    #[test]
    fn capabilities_round_trip() {
        let caps = Capabilities {
            num_elements: 3,
            algorithms: Algorithms::FIPS_P256,
            public_key_type: PublicKeyType::empty(),
            static_oob_type: StaticOobType::AVAILABLE,
            output_oob_size: 6,
            output_oob_actions: OutputOobActions::BLINK | OutputOobActions::NUMERIC,
            input_oob_size: 4,
            input_oob_actions: InputOobActions::TWIST,
        };
        let pdu = PduBuf::capabilities(&caps);
        assert_eq!(pdu.bytes().len(), Opcode::Capabilities.pdu_size().unwrap());

        let decoded = Capabilities::from_bytes(&mut ByteReader::new(pdu.param())).unwrap();
        assert_eq!(decoded, caps);
    }

    #[test]
    fn capabilities_wire_layout() {
        let caps = Capabilities {
            num_elements: 1,
            algorithms: Algorithms::FIPS_P256,
            public_key_type: PublicKeyType::empty(),
            static_oob_type: StaticOobType::empty(),
            output_oob_size: 0,
            output_oob_actions: OutputOobActions::empty(),
            input_oob_size: 0,
            input_oob_actions: InputOobActions::empty(),
        };
        assert_eq!(
            PduBuf::capabilities(&caps).bytes(),
            &[0x01, 0x01, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
        );
    }

    #[test]
    fn start_round_trip() {
        let start = Start {
            algorithm: Algorithm::FipsP256,
            public_key: 0x00,
            auth_method: AuthMethod::OutputOob,
            auth_action: 3,
            auth_size: 4,
        };
        let pdu = PduBuf::start(&start);
        assert_eq!(pdu.bytes(), &[0x02, 0x00, 0x00, 0x02, 0x03, 0x04]);

        let decoded = Start::from_bytes(&mut ByteReader::new(pdu.param())).unwrap();
        assert_eq!(decoded, start);
    }

    #[test]
    fn unknown_values_survive_parsing() {
        // RFU values must be representable so that validation can reject them explicitly.
        let start = Start::from_bytes(&mut ByteReader::new(&[0x01, 0x02, 0x04, 0x00, 0x00]))
            .unwrap();
        assert_eq!(start.algorithm, Algorithm::Unknown(0x01));
        assert_eq!(start.public_key, 0x02);
        assert_eq!(start.auth_method, AuthMethod::Unknown(0x04));
    }
}
