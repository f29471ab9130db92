//! Scan configuration data model.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueType {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    StringAscii,
    StringUtf8,
    StringUtf16,
    StringUtf32,
}

impl ValueType {
    pub fn is_string(self) -> bool {
        matches!(
            self,
            ValueType::StringAscii
                | ValueType::StringUtf8
                | ValueType::StringUtf16
                | ValueType::StringUtf32
        )
    }

    /// Fixed width for numeric types; `None` for strings (their size is the
    /// input's encoded length, known only once the input is supplied).
    pub fn fixed_width(self) -> Option<usize> {
        match self {
            ValueType::I8 | ValueType::U8 => Some(1),
            ValueType::I16 | ValueType::U16 => Some(2),
            ValueType::I32 | ValueType::U32 | ValueType::F32 => Some(4),
            ValueType::I64 | ValueType::U64 | ValueType::F64 => Some(8),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanMode {
    Exact,
    GreaterThan,
    LessThan,
    Between,
    Unknown,
    Changed,
    Unchanged,
    Increased,
    Decreased,
    IncreasedBy,
    DecreasedBy,
    Contains,
    BeginsWith,
    EndsWith,
}

impl ScanMode {
    /// Modes that read the record's stored previous value; valid only on
    /// next-scans.
    pub fn requires_previous(self) -> bool {
        matches!(
            self,
            ScanMode::Changed
                | ScanMode::Unchanged
                | ScanMode::Increased
                | ScanMode::Decreased
                | ScanMode::IncreasedBy
                | ScanMode::DecreasedBy
        )
    }

    /// Only `Between` actually reads `input2`; `IncreasedBy`/`DecreasedBy`
    /// carry their delta in the primary `input` field (see
    /// `comparators::resolve_comparator`) and compare it against the
    /// record's stored previous value, not a second input.
    pub fn requires_second_input(self) -> bool {
        matches!(self, ScanMode::Between)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Endianness {
    Little,
    Big,
}

impl Endianness {
    pub fn host() -> Self {
        if cfg!(target_endian = "little") {
            Endianness::Little
        } else {
            Endianness::Big
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    pub value_type: ValueType,
    pub mode: ScanMode,
    /// Primary search input, already encoded in `endianness` / the string's
    /// byte encoding.
    pub input: Vec<u8>,
    /// Second input for `Between`/`IncreasedBy`/`DecreasedBy`.
    pub input2: Option<Vec<u8>>,
    pub alignment: usize,
    pub endianness: Endianness,
    pub hex_display: bool,
}

impl ScanConfig {
    /// Width of the value being compared: fixed for numerics, the input's
    /// length for strings.
    pub fn data_size(&self) -> usize {
        self.value_type
            .fixed_width()
            .unwrap_or_else(|| self.input.len())
    }

    pub fn validate(&self) -> Result<(), crate::error::VertexError> {
        use crate::error::VertexError;

        if self.alignment == 0 || !self.alignment.is_power_of_two() {
            return Err(VertexError::InvalidParameter(format!(
                "alignment {} is not a power of two",
                self.alignment
            )));
        }
        if self.mode.requires_second_input() && self.input2.is_none() {
            return Err(VertexError::InvalidParameter(
                "scan mode requires a second input".into(),
            ));
        }
        Ok(())
    }
}
