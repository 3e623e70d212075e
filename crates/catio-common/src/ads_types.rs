//! ADS data type codes and typed value conversion.

use crate::error::{AdsError, AdsErrorCode, AdsResult};
use serde::{Deserialize, Serialize};

/// ADS data type codes as carried in symbol entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AdsDataType {
    /// BOOL (ADST_BIT, 33), one byte in the process image.
    Bool,
    /// SINT (ADST_INT8, 16).
    Sint,
    /// USINT / BYTE (ADST_UINT8, 17).
    Usint,
    /// INT (ADST_INT16, 2).
    Int,
    /// UINT / WORD (ADST_UINT16, 18).
    Uint,
    /// DINT (ADST_INT32, 3).
    Dint,
    /// UDINT / DWORD (ADST_UINT32, 19).
    Udint,
    /// LINT (ADST_INT64, 20).
    Lint,
    /// ULINT (ADST_UINT64, 21).
    Ulint,
    /// REAL (ADST_REAL32, 4).
    Real,
    /// LREAL (ADST_REAL64, 5).
    Lreal,
    /// Structured or array type (ADST_BIGTYPE, 65).
    Bigtype,
}

impl AdsDataType {
    /// Wire code of this type.
    #[must_use]
    pub fn code(self) -> u32 {
        match self {
            Self::Bool => 33,
            Self::Sint => 16,
            Self::Usint => 17,
            Self::Int => 2,
            Self::Uint => 18,
            Self::Dint => 3,
            Self::Udint => 19,
            Self::Lint => 20,
            Self::Ulint => 21,
            Self::Real => 4,
            Self::Lreal => 5,
            Self::Bigtype => 65,
        }
    }

    /// Parse a wire code.
    #[must_use]
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            33 => Some(Self::Bool),
            16 => Some(Self::Sint),
            17 => Some(Self::Usint),
            2 => Some(Self::Int),
            18 => Some(Self::Uint),
            3 => Some(Self::Dint),
            19 => Some(Self::Udint),
            20 => Some(Self::Lint),
            21 => Some(Self::Ulint),
            4 => Some(Self::Real),
            5 => Some(Self::Lreal),
            65 => Some(Self::Bigtype),
            _ => None,
        }
    }

    /// Byte size of one element; zero for structured types.
    #[must_use]
    pub fn size(self) -> usize {
        match self {
            Self::Bool | Self::Sint | Self::Usint => 1,
            Self::Int | Self::Uint => 2,
            Self::Dint | Self::Udint | Self::Real => 4,
            Self::Lint | Self::Ulint | Self::Lreal => 8,
            Self::Bigtype => 0,
        }
    }

    /// IEC 61131-3 type name as reported in symbol uploads.
    #[must_use]
    pub fn type_name(self) -> &'static str {
        match self {
            Self::Bool => "BOOL",
            Self::Sint => "SINT",
            Self::Usint => "USINT",
            Self::Int => "INT",
            Self::Uint => "UINT",
            Self::Dint => "DINT",
            Self::Udint => "UDINT",
            Self::Lint => "LINT",
            Self::Ulint => "ULINT",
            Self::Real => "REAL",
            Self::Lreal => "LREAL",
            Self::Bigtype => "BIGTYPE",
        }
    }

    /// Decode one little-endian element as `f64`.
    ///
    /// Returns `None` when the slice is too short or the type is structured.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn decode_f64(self, bytes: &[u8]) -> Option<f64> {
        let raw = bytes.get(..self.size())?;
        let value = match self {
            Self::Bool => f64::from(u8::from(raw[0] != 0)),
            Self::Sint => f64::from(i8::from_le_bytes([raw[0]])),
            Self::Usint => f64::from(raw[0]),
            Self::Int => f64::from(i16::from_le_bytes(raw.try_into().ok()?)),
            Self::Uint => f64::from(u16::from_le_bytes(raw.try_into().ok()?)),
            Self::Dint => f64::from(i32::from_le_bytes(raw.try_into().ok()?)),
            Self::Udint => f64::from(u32::from_le_bytes(raw.try_into().ok()?)),
            Self::Lint => i64::from_le_bytes(raw.try_into().ok()?) as f64,
            Self::Ulint => u64::from_le_bytes(raw.try_into().ok()?) as f64,
            Self::Real => f64::from(f32::from_le_bytes(raw.try_into().ok()?)),
            Self::Lreal => f64::from_le_bytes(raw.try_into().ok()?),
            Self::Bigtype => return None,
        };
        Some(value)
    }
}

/// A Rust value with a fixed ADS wire representation.
pub trait AdsValue: Sized {
    /// Matching ADS data type.
    const DATA_TYPE: AdsDataType;

    /// Little-endian encoding.
    fn to_le_vec(&self) -> Vec<u8>;

    /// Decode from exactly `DATA_TYPE.size()` little-endian bytes.
    fn from_le_slice(bytes: &[u8]) -> AdsResult<Self>;
}

macro_rules! impl_ads_value {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl AdsValue for $ty {
                const DATA_TYPE: AdsDataType = AdsDataType::$variant;

                fn to_le_vec(&self) -> Vec<u8> {
                    self.to_le_bytes().to_vec()
                }

                fn from_le_slice(bytes: &[u8]) -> AdsResult<Self> {
                    let raw = bytes
                        .try_into()
                        .map_err(|_| AdsError::Protocol(AdsErrorCode::InvalidSize))?;
                    Ok(<$ty>::from_le_bytes(raw))
                }
            }
        )*
    };
}

impl_ads_value! {
    i8 => Sint,
    u8 => Usint,
    i16 => Int,
    u16 => Uint,
    i32 => Dint,
    u32 => Udint,
    i64 => Lint,
    u64 => Ulint,
    f32 => Real,
    f64 => Lreal,
}

impl AdsValue for bool {
    const DATA_TYPE: AdsDataType = AdsDataType::Bool;

    fn to_le_vec(&self) -> Vec<u8> {
        vec![u8::from(*self)]
    }

    fn from_le_slice(bytes: &[u8]) -> AdsResult<Self> {
        match bytes {
            [b] => Ok(*b != 0),
            _ => Err(AdsError::Protocol(AdsErrorCode::InvalidSize)),
        }
    }
}
