//! Element type of a buffer.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Element type of a buffer. Discriminants match the custom node ABI `precision` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
#[repr(i32)]
pub enum Precision {
  Unspecified = 0,
  Fp32 = 1,
  Fp64 = 2,
  Fp16 = 3,
  I8 = 4,
  I16 = 5,
  I32 = 6,
  I64 = 7,
  U8 = 8,
  U16 = 9,
  U32 = 10,
  U64 = 11,
  Bool = 12,
}

impl Precision {
  /// Size of one element in bytes; `None` for [Precision::Unspecified].
  pub fn size(&self) -> Option<usize> {
    match self {
      Precision::Unspecified => None,
      Precision::I8 | Precision::U8 | Precision::Bool => Some(1),
      Precision::Fp16 | Precision::I16 | Precision::U16 => Some(2),
      Precision::Fp32 | Precision::I32 | Precision::U32 => Some(4),
      Precision::Fp64 | Precision::I64 | Precision::U64 => Some(8),
    }
  }

  pub fn is_specified(&self) -> bool {
    *self != Precision::Unspecified
  }
}

/// Raw ABI value that is not a known precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownPrecision(pub i32);

impl TryFrom<i32> for Precision {
  type Error = UnknownPrecision;

  fn try_from(value: i32) -> Result<Self, Self::Error> {
    Ok(match value {
      0 => Precision::Unspecified,
      1 => Precision::Fp32,
      2 => Precision::Fp64,
      3 => Precision::Fp16,
      4 => Precision::I8,
      5 => Precision::I16,
      6 => Precision::I32,
      7 => Precision::I64,
      8 => Precision::U8,
      9 => Precision::U16,
      10 => Precision::U32,
      11 => Precision::U64,
      12 => Precision::Bool,
      other => return Err(UnknownPrecision(other)),
    })
  }
}

impl fmt::Display for Precision {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      Precision::Unspecified => "UNSPECIFIED",
      Precision::Fp32 => "FP32",
      Precision::Fp64 => "FP64",
      Precision::Fp16 => "FP16",
      Precision::I8 => "I8",
      Precision::I16 => "I16",
      Precision::I32 => "I32",
      Precision::I64 => "I64",
      Precision::U8 => "U8",
      Precision::U16 => "U16",
      Precision::U32 => "U32",
      Precision::U64 => "U64",
      Precision::Bool => "BOOL",
    };
    write!(f, "{}", s)
  }
}
