//! Register codec
//!
//! Pure conversion between raw holding-register words and typed values.
//! 32-bit fields span two words with the low word first; strings pack two
//! bytes per word, high byte first.

use serde::Serialize;
use std::fmt;

/// Label reported for enum codes outside a field's table.
pub const UNKNOWN_LABEL: &str = "Unknown";

/// Closed code→label mapping for an enumerated field.
pub type EnumTable = &'static [(u16, &'static str)];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    W16,
    W32,
}

impl Width {
    pub const fn words(self) -> usize {
        match self {
            Width::W16 => 1,
            Width::W32 => 2,
        }
    }
}

/// How a field's words are interpreted. `scale` is the divisor applied
/// after the integer decode (1000 for mV → V, 100 for centi-units, 1 for watts).
#[derive(Debug, Clone, Copy)]
pub enum FieldDescriptor {
    ScaledUnsigned { width: Width, scale: u32 },
    ScaledSigned { width: Width, scale: u32 },
    FixedString { words: u16 },
    Enum { labels: EnumTable },
}

impl FieldDescriptor {
    /// Number of registers the field occupies
    pub const fn word_count(&self) -> u16 {
        match self {
            FieldDescriptor::ScaledUnsigned { width, .. }
            | FieldDescriptor::ScaledSigned { width, .. } => width.words() as u16,
            FieldDescriptor::FixedString { words } => *words,
            FieldDescriptor::Enum { .. } => 1,
        }
    }
}

/// Decoded enumerated value. Unknown codes keep their raw value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EnumValue {
    pub code: u16,
    #[serde(rename = "label", serialize_with = "serialize_label")]
    pub label: Option<&'static str>,
}

impl EnumValue {
    pub fn label(&self) -> &'static str {
        self.label.unwrap_or(UNKNOWN_LABEL)
    }

    pub fn is_known(&self) -> bool {
        self.label.is_some()
    }
}

fn serialize_label<S: serde::Serializer>(
    label: &Option<&'static str>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(label.unwrap_or(UNKNOWN_LABEL))
}

impl fmt::Display for EnumValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.label {
            Some(label) => f.write_str(label),
            None => write!(f, "{} ({})", UNKNOWN_LABEL, self.code),
        }
    }
}

/// A decoded register value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RegisterValue {
    Number(f64),
    Text(String),
    Enum(EnumValue),
}

impl RegisterValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            RegisterValue::Number(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_enum(&self) -> Option<EnumValue> {
        match self {
            RegisterValue::Enum(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for RegisterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisterValue::Number(v) => write!(f, "{}", v),
            RegisterValue::Text(s) => f.write_str(s),
            RegisterValue::Enum(e) => write!(f, "{}", e),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("expected {expected} register words, got {actual}")]
    WordCount { expected: usize, actual: usize },
    #[error("invalid UTF-8 in string field: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),
    #[error("malformed field {field}: {reason}")]
    Malformed { field: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EncodeError {
    #[error("value {value} does not fit the field")]
    OutOfRange { value: f64 },
    #[error("string of {len} bytes exceeds {capacity} byte field")]
    TooLong { len: usize, capacity: usize },
    #[error("value kind does not match the field descriptor")]
    KindMismatch,
}

/// Decode `words` according to `descriptor`.
///
/// The word count must match the descriptor exactly; a wrong count means the
/// register table and the request disagree, and decoding anyway would
/// silently produce garbage.
pub fn decode(words: &[u16], descriptor: &FieldDescriptor) -> Result<RegisterValue, DecodeError> {
    let expected = descriptor.word_count() as usize;
    if words.len() != expected {
        return Err(DecodeError::WordCount {
            expected,
            actual: words.len(),
        });
    }

    let value = match *descriptor {
        FieldDescriptor::ScaledUnsigned { width, scale } => {
            RegisterValue::Number(join_words(words, width) as f64 / scale.max(1) as f64)
        }
        FieldDescriptor::ScaledSigned { width, scale } => {
            let raw = join_words(words, width);
            let signed = match width {
                Width::W16 => raw as u16 as i16 as f64,
                Width::W32 => raw as i32 as f64,
            };
            RegisterValue::Number(signed / scale.max(1) as f64)
        }
        FieldDescriptor::FixedString { .. } => {
            let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_be_bytes()).collect();
            let end = bytes.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
            RegisterValue::Text(std::str::from_utf8(&bytes[..end])?.to_string())
        }
        FieldDescriptor::Enum { labels } => {
            let code = words[0];
            let label = labels
                .iter()
                .find(|(c, _)| *c == code)
                .map(|(_, label)| *label);
            RegisterValue::Enum(EnumValue { code, label })
        }
    };

    Ok(value)
}

/// Encode a value into register words for `descriptor`. Inverse of [`decode`]
/// within the field's scale resolution.
pub fn encode(value: &RegisterValue, descriptor: &FieldDescriptor) -> Result<Vec<u16>, EncodeError> {
    match (*descriptor, value) {
        (FieldDescriptor::ScaledUnsigned { width, scale }, RegisterValue::Number(v)) => {
            let raw = (v * scale.max(1) as f64).round();
            let max = match width {
                Width::W16 => u16::MAX as f64,
                Width::W32 => u32::MAX as f64,
            };
            if !raw.is_finite() || raw < 0.0 || raw > max {
                return Err(EncodeError::OutOfRange { value: *v });
            }
            Ok(split_words(raw as u32, width))
        }
        (FieldDescriptor::ScaledSigned { width, scale }, RegisterValue::Number(v)) => {
            let raw = (v * scale.max(1) as f64).round();
            let (min, max) = match width {
                Width::W16 => (i16::MIN as f64, i16::MAX as f64),
                Width::W32 => (i32::MIN as f64, i32::MAX as f64),
            };
            if !raw.is_finite() || raw < min || raw > max {
                return Err(EncodeError::OutOfRange { value: *v });
            }
            let bits = match width {
                Width::W16 => raw as i16 as u16 as u32,
                Width::W32 => raw as i32 as u32,
            };
            Ok(split_words(bits, width))
        }
        (FieldDescriptor::FixedString { words }, RegisterValue::Text(s)) => {
            let capacity = words as usize * 2;
            if s.len() > capacity {
                return Err(EncodeError::TooLong {
                    len: s.len(),
                    capacity,
                });
            }
            let mut bytes = s.as_bytes().to_vec();
            bytes.resize(capacity, 0);
            Ok(bytes
                .chunks(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                .collect())
        }
        (FieldDescriptor::Enum { .. }, RegisterValue::Enum(e)) => Ok(vec![e.code]),
        _ => Err(EncodeError::KindMismatch),
    }
}

fn join_words(words: &[u16], width: Width) -> u32 {
    match width {
        Width::W16 => words[0] as u32,
        Width::W32 => (words[1] as u32) << 16 | words[0] as u32,
    }
}

fn split_words(raw: u32, width: Width) -> Vec<u16> {
    match width {
        Width::W16 => vec![raw as u16],
        Width::W32 => vec![raw as u16, (raw >> 16) as u16],
    }
}
