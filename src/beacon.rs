//! The unprovisioned device beacon.
//!
//! A device that wants to be provisioned over PB-ADV broadcasts this beacon at a configurable
//! period until a provisioning link is opened. A Provisioner scans for it and matches on the
//! device UUID before sending the Link Open control PDU.

use bitflags::bitflags;
use uuid::Uuid;

use crate::bytes::{ByteReader, ByteWriter, FromBytes, ToBytes};
use crate::Error;

/// Beacon type value of the unprovisioned device beacon.
const BEACON_TYPE_UNPROVISIONED: u8 = 0x00;

/// Size of the beacon without the optional URI hash.
pub const MIN_BEACON_SIZE: usize = 19;

/// Size of the beacon with the URI hash appended.
pub const MAX_BEACON_SIZE: usize = 23;

bitflags! {
    /// Where the out-of-band data of a device can be found.
    ///
    /// Advertised in the unprovisioned device beacon so the provisioning application can guide
    /// the user towards the right OOB source.
    pub struct OobInfo: u16 {
        const OTHER                 = 1 << 0;
        const ELECTRONIC_URI        = 1 << 1;
        const MACHINE_READABLE_CODE = 1 << 2;
        const BAR_CODE              = 1 << 3;
        const NFC                   = 1 << 4;
        const NUMBER                = 1 << 5;
        const STRING                = 1 << 6;
        const ON_BOX                = 1 << 11;
        const INSIDE_BOX            = 1 << 12;
        const ON_PIECE_OF_PAPER     = 1 << 13;
        const INSIDE_MANUAL         = 1 << 14;
        const ON_DEVICE             = 1 << 15;
    }
}

/// An unprovisioned device beacon.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct UnprovisionedBeacon {
    /// The device UUID identifying the device to be provisioned.
    pub uuid: Uuid,

    /// Availability of out-of-band data.
    pub oob_info: OobInfo,

    /// First 4 bytes of `s1(uri)` if the device also advertises a URI pointing to its OOB data
    /// (see [`crypto::uri_hash`]).
    ///
    /// [`crypto::uri_hash`]: ../crypto/fn.uri_hash.html
    pub uri_hash: Option<[u8; 4]>,
}

impl ToBytes for UnprovisionedBeacon {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_u8(BEACON_TYPE_UNPROVISIONED)?;
        writer.write_slice(self.uuid.as_bytes())?;
        writer.write_u16_be(self.oob_info.bits())?;
        if let Some(hash) = &self.uri_hash {
            writer.write_slice(hash)?;
        }
        Ok(())
    }
}

impl<'a> FromBytes<'a> for UnprovisionedBeacon {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        if bytes.read_u8()? != BEACON_TYPE_UNPROVISIONED {
            return Err(Error::InvalidValue);
        }

        let uuid = Uuid::from_bytes(bytes.read_array()?);
        let oob_info = OobInfo::from_bits_truncate(bytes.read_u16_be()?);
        let uri_hash = match bytes.bytes_left() {
            0 => None,
            4 => Some(bytes.read_array()?),
            _ => return Err(Error::InvalidLength),
        };

        Ok(Self {
            uuid,
            oob_info,
            uri_hash,
        })
    }
}
