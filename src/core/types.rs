//! Field kinds and the tagged field value.
//!
//! The wire format carries no type tags. A field's kind comes from the specification
//! registry, and [`FieldValue`] holds one variant per kind so that a value can only be
//! stored under a field of the matching kind.

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Scalar kind of a specification field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldKind {
    Bool,
    Enum,
    Int32,
    Uint32,
    Int64,
    Uint64,
    Double,
    String,
    Uuid,
    Date,
    Data,
    Oob,
    List,
}

impl FieldKind {
    /// Resolve a type name as written in a specification document.
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "bool" => FieldKind::Bool,
            "enum" => FieldKind::Enum,
            "int32" => FieldKind::Int32,
            "uint32" => FieldKind::Uint32,
            "int64" => FieldKind::Int64,
            "uint64" => FieldKind::Uint64,
            "double" => FieldKind::Double,
            "string" => FieldKind::String,
            "uuid" => FieldKind::Uuid,
            "date" => FieldKind::Date,
            "data" => FieldKind::Data,
            "oobdata" => FieldKind::Oob,
            "list" => FieldKind::List,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            FieldKind::Bool => "bool",
            FieldKind::Enum => "enum",
            FieldKind::Int32 => "int32",
            FieldKind::Uint32 => "uint32",
            FieldKind::Int64 => "int64",
            FieldKind::Uint64 => "uint64",
            FieldKind::Double => "double",
            FieldKind::String => "string",
            FieldKind::Uuid => "uuid",
            FieldKind::Date => "date",
            FieldKind::Data => "data",
            FieldKind::Oob => "oobdata",
            FieldKind::List => "list",
        }
    }

    /// Numeric type id used by specification documents.
    pub fn type_id(self) -> u32 {
        match self {
            FieldKind::Bool => 1,
            FieldKind::Enum => 2,
            FieldKind::Int32 => 3,
            FieldKind::Uint32 => 4,
            FieldKind::Int64 => 5,
            FieldKind::Uint64 => 6,
            FieldKind::Double => 7,
            FieldKind::String => 8,
            FieldKind::Uuid => 9,
            FieldKind::Date => 10,
            FieldKind::Data => 11,
            FieldKind::Oob => 12,
            FieldKind::List => 13,
        }
    }

    /// Width of a fixed-size value, `None` for length-prefixed kinds.
    pub fn fixed_size(self) -> Option<usize> {
        match self {
            FieldKind::Bool => Some(1),
            FieldKind::Enum | FieldKind::Int32 | FieldKind::Uint32 => Some(4),
            FieldKind::Int64 | FieldKind::Uint64 | FieldKind::Double | FieldKind::Date => Some(8),
            FieldKind::Uuid => Some(16),
            FieldKind::String | FieldKind::Data | FieldKind::Oob | FieldKind::List => None,
        }
    }

    pub fn has_length_prefix(self) -> bool {
        self.fixed_size().is_none()
    }
}

impl std::fmt::Display for FieldKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A field value, one variant per [`FieldKind`].
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Bool(bool),
    Enum(u32),
    Int32(i32),
    Uint32(u32),
    Int64(i64),
    Uint64(u64),
    Double(f64),
    String(String),
    Uuid(Uuid),
    Date(DateTime<Utc>),
    Data(Vec<u8>),
    /// Size of the out-of-band payload announced by the message.
    Oob(u64),
    List(Vec<String>),
}

impl FieldValue {
    pub fn kind(&self) -> FieldKind {
        match self {
            FieldValue::Bool(_) => FieldKind::Bool,
            FieldValue::Enum(_) => FieldKind::Enum,
            FieldValue::Int32(_) => FieldKind::Int32,
            FieldValue::Uint32(_) => FieldKind::Uint32,
            FieldValue::Int64(_) => FieldKind::Int64,
            FieldValue::Uint64(_) => FieldKind::Uint64,
            FieldValue::Double(_) => FieldKind::Double,
            FieldValue::String(_) => FieldKind::String,
            FieldValue::Uuid(_) => FieldKind::Uuid,
            FieldValue::Date(_) => FieldKind::Date,
            FieldValue::Data(_) => FieldKind::Data,
            FieldValue::Oob(_) => FieldKind::Oob,
            FieldValue::List(_) => FieldKind::List,
        }
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

impl From<i32> for FieldValue {
    fn from(value: i32) -> Self {
        FieldValue::Int32(value)
    }
}

impl From<u32> for FieldValue {
    fn from(value: u32) -> Self {
        FieldValue::Uint32(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Int64(value)
    }
}

impl From<u64> for FieldValue {
    fn from(value: u64) -> Self {
        FieldValue::Uint64(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Double(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::String(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::String(value)
    }
}

impl From<Uuid> for FieldValue {
    fn from(value: Uuid) -> Self {
        FieldValue::Uuid(value)
    }
}

impl From<DateTime<Utc>> for FieldValue {
    fn from(value: DateTime<Utc>) -> Self {
        FieldValue::Date(value)
    }
}

impl From<Vec<u8>> for FieldValue {
    fn from(value: Vec<u8>) -> Self {
        FieldValue::Data(value)
    }
}

impl From<Vec<String>> for FieldValue {
    fn from(value: Vec<String>) -> Self {
        FieldValue::List(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names_resolve_back() {
        let kinds = [
            FieldKind::Bool,
            FieldKind::Enum,
            FieldKind::Int32,
            FieldKind::Uint32,
            FieldKind::Int64,
            FieldKind::Uint64,
            FieldKind::Double,
            FieldKind::String,
            FieldKind::Uuid,
            FieldKind::Date,
            FieldKind::Data,
            FieldKind::Oob,
            FieldKind::List,
        ];
        for (index, kind) in kinds.iter().enumerate() {
            assert_eq!(FieldKind::from_name(kind.name()), Some(*kind));
            assert_eq!(kind.type_id(), index as u32 + 1);
        }
        assert_eq!(FieldKind::from_name("float"), None);
    }

    #[test]
    fn test_length_prefixed_kinds() {
        assert!(FieldKind::String.has_length_prefix());
        assert!(FieldKind::Data.has_length_prefix());
        assert!(FieldKind::List.has_length_prefix());
        assert!(FieldKind::Oob.has_length_prefix());
        assert_eq!(FieldKind::Uuid.fixed_size(), Some(16));
        assert_eq!(FieldKind::Date.fixed_size(), Some(8));
    }
}
