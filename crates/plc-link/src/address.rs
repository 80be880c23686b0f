use std::{fmt, str::FromStr};

use crate::error::PlcError;

/// S7 addresses are encoded as a 24-bit bit offset.
const MAX_BIT_OFFSET: u32 = (1 << 24) - 1;

/// One boolean flag inside a data block, written `DB300.DBX6.0`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BitAddress {
    pub db: u16,
    pub byte: u32,
    pub bit: u8,
}

impl BitAddress {
    pub fn new(db: u16, byte: u32, bit: u8) -> Result<Self, PlcError> {
        if bit > 7 {
            return Err(PlcError::InvalidAddress(format!(
                "bit offset {bit} out of range 0..=7"
            )));
        }
        if byte
            .checked_mul(8)
            .and_then(|b| b.checked_add(u32::from(bit)))
            .is_none_or(|offset| offset > MAX_BIT_OFFSET)
        {
            return Err(PlcError::InvalidAddress(format!(
                "byte offset {byte} out of range"
            )));
        }
        Ok(Self { db, byte, bit })
    }

    /// Offset in bits from the start of the data block.
    pub fn bit_offset(&self) -> u32 {
        self.byte * 8 + u32::from(self.bit)
    }
}

impl fmt::Display for BitAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DB{}.DBX{}.{}", self.db, self.byte, self.bit)
    }
}

impl FromStr for BitAddress {
    type Err = PlcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || PlcError::InvalidAddress(format!("{s:?} is not of the form DB<n>.DBX<byte>.<bit>"));
        let upper = s.trim().to_ascii_uppercase();
        let rest = upper.strip_prefix("DB").ok_or_else(invalid)?;
        let (db, rest) = rest.split_once(".DBX").ok_or_else(invalid)?;
        let (byte, bit) = rest.split_once('.').ok_or_else(invalid)?;
        BitAddress::new(
            db.parse().map_err(|_| invalid())?,
            byte.parse().map_err(|_| invalid())?,
            bit.parse().map_err(|_| invalid())?,
        )
    }
}
