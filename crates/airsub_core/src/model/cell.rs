//! Spatial cell identifiers, storage codec and legality checks.
//!
//! # Responsibility
//! - Define the opaque `CellId` used by subscription coverage.
//! - Convert cell sets to/from the JSON integer array kept in `subscriptions.cells`.
//! - Provide the cell-validation collaborator used before writes.
//!
//! # Invariants
//! - `u64 <-> i64` conversion is bit-preserving, so every `CellId` survives a
//!   store round trip unchanged.
//! - Cell order is preserved by the codec; duplicates are not collapsed here.

use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::ops::RangeInclusive;

const S2_FACE_BITS: u32 = 3;
const S2_NUM_FACES: u64 = 6;
const S2_MAX_LEVEL: u8 = 30;
const S2_POS_BITS: u32 = 2 * S2_MAX_LEVEL as u32 + 1;
/// Mask of the bit positions a valid S2 sentinel bit may occupy.
const S2_SENTINEL_MASK: u64 = 0x1555_5555_5555_5555;

/// Cell level used by the remote-ID subscription grid.
pub const DEFAULT_CELL_LEVEL: u8 = 13;

/// Identifier of one cell in a hierarchical spatial subdivision (S2 layout).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CellId(u64);

impl CellId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Signed representation used by the backing store.
    pub const fn to_db(self) -> i64 {
        self.0 as i64
    }

    pub const fn from_db(value: i64) -> Self {
        Self(value as u64)
    }

    /// Face index encoded in the top three bits.
    pub fn face(self) -> u64 {
        self.0 >> S2_POS_BITS
    }

    /// Subdivision level, or `None` when the sentinel bit is malformed.
    pub fn level(self) -> Option<u8> {
        if self.0 == 0 {
            return None;
        }
        let lowest = self.0 & self.0.wrapping_neg();
        if lowest & S2_SENTINEL_MASK == 0 {
            return None;
        }
        Some(S2_MAX_LEVEL - (self.0.trailing_zeros() / 2) as u8)
    }

    /// Builds the `index`-th cell of `level` on `face`, in Hilbert position order.
    ///
    /// Returns `None` when any argument is out of range.
    pub fn from_face_index(face: u8, level: u8, index: u64) -> Option<Self> {
        if u64::from(face) >= S2_NUM_FACES || level > S2_MAX_LEVEL {
            return None;
        }
        let shift = 2 * u32::from(S2_MAX_LEVEL - level) + 1;
        let slots = 1u64 << (2 * u32::from(level));
        if index >= slots {
            return None;
        }
        let face_bits = u64::from(face) << S2_POS_BITS;
        let sentinel = 1u64 << (shift - 1);
        Some(Self(face_bits | (index << shift) | sentinel))
    }
}

impl Display for CellId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl From<u64> for CellId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Cell codec and legality errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CellError {
    /// Identifier does not describe a cell at all.
    InvalidCell(CellId),
    /// Identifier is a real cell but outside the permitted level range.
    UnsupportedLevel { cell: CellId, level: u8 },
    /// Stored cell array could not be decoded.
    Decode(String),
    Encode(String),
}

impl Display for CellError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidCell(cell) => write!(f, "invalid cell id {cell}"),
            Self::UnsupportedLevel { cell, level } => {
                write!(f, "cell {cell} has unsupported level {level}")
            }
            Self::Decode(message) => write!(f, "invalid stored cell array: {message}"),
            Self::Encode(message) => write!(f, "cannot encode cell array: {message}"),
        }
    }
}

impl Error for CellError {}

/// Encodes cells as the JSON integer array stored in `subscriptions.cells`.
pub fn encode_cells(cells: &[CellId]) -> Result<String, CellError> {
    let values: Vec<i64> = cells.iter().map(|cell| cell.to_db()).collect();
    serde_json::to_string(&values).map_err(|err| CellError::Encode(err.to_string()))
}

/// Decodes the stored JSON integer array back into cell identifiers.
pub fn decode_cells(text: &str) -> Result<Vec<CellId>, CellError> {
    let values: Vec<i64> =
        serde_json::from_str(text).map_err(|err| CellError::Decode(err.to_string()))?;
    Ok(values.into_iter().map(CellId::from_db).collect())
}

/// Cell-legality collaborator consulted before any subscription write.
pub trait CellValidator: Send + Sync {
    fn validate_cell(&self, cell: CellId) -> Result<(), CellError>;
}

/// Accepts S2 cells whose level lies inside `levels`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S2CellValidator {
    levels: RangeInclusive<u8>,
}

impl S2CellValidator {
    pub fn with_levels(levels: RangeInclusive<u8>) -> Self {
        Self { levels }
    }
}

impl Default for S2CellValidator {
    fn default() -> Self {
        Self::with_levels(DEFAULT_CELL_LEVEL..=DEFAULT_CELL_LEVEL)
    }
}

impl CellValidator for S2CellValidator {
    fn validate_cell(&self, cell: CellId) -> Result<(), CellError> {
        if cell.face() >= S2_NUM_FACES {
            return Err(CellError::InvalidCell(cell));
        }
        let level = cell.level().ok_or(CellError::InvalidCell(cell))?;
        if !self.levels.contains(&level) {
            return Err(CellError::UnsupportedLevel { cell, level });
        }
        Ok(())
    }
}

// Face bits must fit exactly above the position bits.
const _: () = assert!(S2_POS_BITS + S2_FACE_BITS == 64);

#[cfg(test)]
mod tests {
    use super::{decode_cells, encode_cells, CellError, CellId, CellValidator, S2CellValidator};

    #[test]
    fn db_conversion_preserves_high_bit_cells() {
        let cell = CellId::new(0xb000_0000_0000_0001);
        assert!(cell.to_db() < 0);
        assert_eq!(CellId::from_db(cell.to_db()), cell);
    }

    #[test]
    fn codec_keeps_order() {
        let cells = vec![CellId::new(9), CellId::new(u64::MAX), CellId::new(3)];
        let text = encode_cells(&cells).expect("encode");
        assert_eq!(text, "[9,-1,3]");
        assert_eq!(decode_cells(&text).expect("decode"), cells);
    }

    #[test]
    fn decode_rejects_non_integer_arrays() {
        let err = decode_cells("[\"x\"]").expect_err("strings are not cells");
        assert!(matches!(err, CellError::Decode(_)));
    }

    #[test]
    fn from_face_index_builds_cells_at_requested_level() {
        let cell = CellId::from_face_index(2, 13, 42).expect("in range");
        assert_eq!(cell.face(), 2);
        assert_eq!(cell.level(), Some(13));
        assert!(CellId::from_face_index(6, 13, 0).is_none());
        assert!(CellId::from_face_index(0, 1, 4).is_none());
    }

    #[test]
    fn default_validator_accepts_only_level_13() {
        let validator = S2CellValidator::default();
        let good = CellId::from_face_index(0, 13, 7).expect("in range");
        let coarse = CellId::from_face_index(0, 12, 7).expect("in range");

        validator.validate_cell(good).expect("level 13 is allowed");
        assert_eq!(
            validator.validate_cell(coarse),
            Err(CellError::UnsupportedLevel {
                cell: coarse,
                level: 12
            })
        );
    }

    #[test]
    fn validator_rejects_malformed_ids() {
        let validator = S2CellValidator::with_levels(0..=30);
        // Sentinel on an odd bit.
        assert!(matches!(
            validator.validate_cell(CellId::new(2)),
            Err(CellError::InvalidCell(_))
        ));
        assert!(matches!(
            validator.validate_cell(CellId::new(0)),
            Err(CellError::InvalidCell(_))
        ));
        // Face 7.
        assert!(matches!(
            validator.validate_cell(CellId::new(0xe000_0000_0000_0001)),
            Err(CellError::InvalidCell(_))
        ));
    }
}
