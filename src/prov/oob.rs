//! Out-of-band authentication values.
//!
//! The output and input OOB methods exchange a short value through the user: digits, a number
//! shown on a display, or a short alphanumeric code. This module holds the value representation
//! and the rules for folding it into the 16-byte AuthValue used by the confirmation computation.

use rand_core::RngCore;

/// Maximum size of an input or output OOB value, in digits or characters.
pub const MAX_OOB_SIZE: usize = 8;

/// A numeric OOB value occupies the last 4 bytes of the AuthValue.
const NUMERIC_OOB_BYTES: usize = 4;

/// An input or output OOB value as displayed to or entered by the user.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OobData {
    /// An alphanumeric value of 1 to 8 characters from `A..=Z` and `0..=9`.
    Alphanumeric {
        /// The characters, left-aligned; only the first `len` bytes are meaningful.
        data: [u8; MAX_OOB_SIZE],
        /// Number of characters.
        len: u8,
    },

    /// A number of up to 8 decimal digits (blink/beep/vibrate/push/twist counts are numeric
    /// too).
    Numeric(u32),
}

impl OobData {
    /// Packs this value into the AuthValue layout.
    ///
    /// Alphanumeric values are copied as-is and right-padded with zeros; numeric values are
    /// placed as a big-endian 4-byte integer into the last 4 bytes, left-padded with zeros.
    pub fn pack_into_auth_value(&self, auth: &mut [u8; 16]) {
        match self {
            OobData::Alphanumeric { data, len } => {
                let len = usize::from(*len).min(MAX_OOB_SIZE);
                auth[..len].copy_from_slice(&data[..len]);
                for byte in &mut auth[len..] {
                    *byte = 0;
                }
            }
            OobData::Numeric(value) => {
                auth[..16 - NUMERIC_OOB_BYTES].iter_mut().for_each(|b| *b = 0);
                auth[16 - NUMERIC_OOB_BYTES..].copy_from_slice(&value.to_be_bytes());
            }
        }
    }
}

/// Checks that `data` contains only characters valid in an alphanumeric OOB value
/// (`A..=Z` and `0..=9`).
pub fn is_alphanumeric(data: &[u8]) -> bool {
    data.iter()
        .all(|&b| (b'A'..=b'Z').contains(&b) || (b'0'..=b'9').contains(&b))
}

/// Fills `out` with random alphanumeric characters.
pub fn random_alphanumeric<R: RngCore>(rng: &mut R, out: &mut [u8]) {
    const ALPHA_COUNT: u32 = 26;
    const NUM_COUNT: u32 = 10;

    for byte in out {
        // Reduce a large random integer modulo the number of symbols. The loss of entropy is,
        // on average, negligible.
        let index = rng.next_u32() % (ALPHA_COUNT + NUM_COUNT);
        *byte = if index < ALPHA_COUNT {
            b'A' + index as u8
        } else {
            b'0' + (index - ALPHA_COUNT) as u8
        };
    }
}

/// Generates a random number of at most `digits` decimal digits (1 to 8).
///
/// Returns 0 for a `digits` value outside that range.
pub fn random_numeric<R: RngCore>(rng: &mut R, digits: u8) -> u32 {
    let max: u32 = match digits {
        1 => 9,
        2 => 99,
        3 => 999,
        4 => 9_999,
        5 => 99_999,
        6 => 999_999,
        7 => 9_999_999,
        8 => 99_999_999,
        _ => return 0,
    };

    rng.next_u32() % (max + 1)
}

/// Returns the position of the least significant set bit of `mask`, or 16 if no bit is set.
///
/// The Start PDU encodes the selected OOB action as a bit position into the action mask the
/// device advertised; this converts a single-bit mask into that position.
pub fn bit_position(mask: u16) -> u8 {
    mask.trailing_zeros() as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingRng(u32);

    impl RngCore for CountingRng {
        fn next_u32(&mut self) -> u32 {
            self.0 = self.0.wrapping_add(0x9e37_79b9);
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

    fn unpack(auth: &[u8; 16], size: u8) -> OobData {
        if size > 0 {
            let mut data = [0; MAX_OOB_SIZE];
            data[..usize::from(size)].copy_from_slice(&auth[..usize::from(size)]);
            OobData::Alphanumeric { data, len: size }
        } else {
            let mut num = [0; 4];
            num.copy_from_slice(&auth[12..]);
            OobData::Numeric(u32::from_be_bytes(num))
        }
    }

    #[test]
    fn pack_alphanumeric() {
        let mut data = [0; MAX_OOB_SIZE];
        data[..4].copy_from_slice(b"7F3X");
        let oob = OobData::Alphanumeric { data, len: 4 };

        let mut auth = [0xff; 16];
        oob.pack_into_auth_value(&mut auth);
        assert_eq!(&auth[..4], b"7F3X");
        assert_eq!(auth[4..], [0; 12]);
        assert_eq!(unpack(&auth, 4), oob);
    }

    #[test]
    fn pack_numeric() {
        let oob = OobData::Numeric(12_345_678);

        let mut auth = [0xff; 16];
        oob.pack_into_auth_value(&mut auth);
        assert_eq!(auth[..12], [0; 12]);
        assert_eq!(auth[12..], 12_345_678u32.to_be_bytes());
        assert_eq!(unpack(&auth, 0), oob);
    }

    #[test]
    fn pack_unpack_all_sizes() {
        for size in 0..=MAX_OOB_SIZE as u8 {
            let oob = if size > 0 {
                let mut data = [0; MAX_OOB_SIZE];
                for (i, b) in data[..usize::from(size)].iter_mut().enumerate() {
                    *b = b'A' + i as u8;
                }
                OobData::Alphanumeric { data, len: size }
            } else {
                OobData::Numeric(42)
            };

            let mut auth = [0xaa; 16];
            oob.pack_into_auth_value(&mut auth);
            assert_eq!(unpack(&auth, size), oob);
        }
    }

    #[test]
    fn alphanumeric_charset() {
        assert!(is_alphanumeric(b"ABCXYZ019"));
        assert!(is_alphanumeric(b""));
        assert!(!is_alphanumeric(b"abc"));
        assert!(!is_alphanumeric(b"A-1"));
        assert!(!is_alphanumeric(&[0x00]));
    }

    #[test]
    fn random_alphanumeric_is_valid() {
        let mut rng = CountingRng(1);
        let mut buf = [0; 64];
        random_alphanumeric(&mut rng, &mut buf);
        assert!(is_alphanumeric(&buf));
    }

    #[test]
    fn random_numeric_within_range() {
        let mut rng = CountingRng(7);
        for digits in 1..=8 {
            let max = 10u32.pow(u32::from(digits)) - 1;
            for _ in 0..32 {
                assert!(random_numeric(&mut rng, digits) <= max);
            }
        }
        assert_eq!(random_numeric(&mut rng, 0), 0);
        assert_eq!(random_numeric(&mut rng, 9), 0);
    }

    #[test]
    fn bit_positions() {
        for k in 0..16 {
            assert_eq!(bit_position(1 << k), k as u8);
        }
        assert_eq!(bit_position(0), 16);
        // With several bits set, the least significant one wins.
        assert_eq!(bit_position(0b1010), 1);
    }
}
