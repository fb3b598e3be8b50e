//! Runtime P7 messages.

use crate::core::types::{FieldKind, FieldValue};
use crate::error::{ProtocolError, Result};
use crate::spec::Specification;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Reserved field carrying the transaction id of correlated requests and replies.
pub const TRANSACTION_FIELD: &str = "wired.transaction";

/// A message resolved against a [`Specification`].
///
/// Fields are keyed by field id, so encoding walks them in ascending id order.
#[derive(Clone)]
pub struct Message {
    spec: Arc<Specification>,
    id: u32,
    name: String,
    fields: BTreeMap<u32, FieldValue>,
}

impl Message {
    /// Create an empty message of the named type.
    pub fn new(spec: &Arc<Specification>, name: &str) -> Result<Self> {
        let definition = spec
            .message(name)
            .ok_or_else(|| ProtocolError::UnknownMessage(name.to_string()))?;
        Ok(Self {
            spec: Arc::clone(spec),
            id: definition.id,
            name: definition.name.clone(),
            fields: BTreeMap::new(),
        })
    }

    pub(crate) fn from_id(spec: &Arc<Specification>, id: u32) -> Result<Self> {
        let definition = spec
            .message_by_id(id)
            .ok_or(ProtocolError::UnknownMessageId(id))?;
        Ok(Self {
            spec: Arc::clone(spec),
            id,
            name: definition.name.clone(),
            fields: BTreeMap::new(),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn spec(&self) -> &Arc<Specification> {
        &self.spec
    }

    /// Store a value, checking the field exists and has the value's kind.
    pub fn set(&mut self, field: &str, value: impl Into<FieldValue>) -> Result<()> {
        let value = value.into();
        let definition = self
            .spec
            .field(field)
            .ok_or_else(|| ProtocolError::UnknownField(field.to_string()))?;
        if definition.kind != value.kind() {
            return Err(ProtocolError::FieldTypeMismatch {
                field: field.to_string(),
                expected: definition.kind.name(),
            });
        }
        self.fields.insert(definition.id, value);
        Ok(())
    }

    /// Builder form of [`Message::set`].
    pub fn with(mut self, field: &str, value: impl Into<FieldValue>) -> Result<Self> {
        self.set(field, value)?;
        Ok(self)
    }

    /// Store an enum field by constant name.
    pub fn set_enum(&mut self, field: &str, constant: &str) -> Result<()> {
        let value = self.spec.enum_value(field, constant).ok_or_else(|| {
            ProtocolError::UnknownField(format!("{field} has no constant {constant}"))
        })?;
        self.set(field, FieldValue::Enum(value))
    }

    pub(crate) fn insert_decoded(&mut self, field_id: u32, value: FieldValue) {
        self.fields.insert(field_id, value);
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        let id = self.spec.field(field)?.id;
        self.fields.get(&id)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.get(field).is_some()
    }

    pub fn remove(&mut self, field: &str) -> Option<FieldValue> {
        let id = self.spec.field(field)?.id;
        self.fields.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Present fields as (name, value) in ascending field id order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().filter_map(move |(id, value)| {
            self.spec
                .field_by_id(*id)
                .map(|definition| (definition.name.as_str(), value))
        })
    }

    pub(crate) fn raw_fields(&self) -> impl Iterator<Item = (u32, &FieldValue)> {
        self.fields.iter().map(|(id, value)| (*id, value))
    }

    /// Names of required parameters that are absent.
    pub fn missing_required(&self) -> Vec<&str> {
        self.spec
            .message(&self.name)
            .map(|definition| {
                definition
                    .parameters
                    .iter()
                    .filter(|p| p.required && !self.contains(&p.field))
                    .map(|p| p.field.as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn string(&self, field: &str) -> Option<&str> {
        match self.get(field)? {
            FieldValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn bool(&self, field: &str) -> Option<bool> {
        match self.get(field)? {
            FieldValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn enumeration(&self, field: &str) -> Option<u32> {
        match self.get(field)? {
            FieldValue::Enum(v) => Some(*v),
            _ => None,
        }
    }

    /// Name of the enum constant stored in `field`.
    pub fn enum_name(&self, field: &str) -> Option<&str> {
        let value = self.enumeration(field)?;
        self.spec.enum_name(field, value)
    }

    pub fn int32(&self, field: &str) -> Option<i32> {
        match self.get(field)? {
            FieldValue::Int32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn uint32(&self, field: &str) -> Option<u32> {
        match self.get(field)? {
            FieldValue::Uint32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn int64(&self, field: &str) -> Option<i64> {
        match self.get(field)? {
            FieldValue::Int64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn uint64(&self, field: &str) -> Option<u64> {
        match self.get(field)? {
            FieldValue::Uint64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn double(&self, field: &str) -> Option<f64> {
        match self.get(field)? {
            FieldValue::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn uuid(&self, field: &str) -> Option<Uuid> {
        match self.get(field)? {
            FieldValue::Uuid(v) => Some(*v),
            _ => None,
        }
    }

    pub fn date(&self, field: &str) -> Option<DateTime<Utc>> {
        match self.get(field)? {
            FieldValue::Date(v) => Some(*v),
            _ => None,
        }
    }

    pub fn data(&self, field: &str) -> Option<&[u8]> {
        match self.get(field)? {
            FieldValue::Data(v) => Some(v),
            _ => None,
        }
    }

    pub fn oob(&self, field: &str) -> Option<u64> {
        match self.get(field)? {
            FieldValue::Oob(v) => Some(*v),
            _ => None,
        }
    }

    pub fn list(&self, field: &str) -> Option<&[String]> {
        match self.get(field)? {
            FieldValue::List(v) => Some(v),
            _ => None,
        }
    }

    /// Transaction id, if the message carries one.
    pub fn transaction_id(&self) -> Option<u32> {
        if self.spec.field(TRANSACTION_FIELD)?.kind != FieldKind::Uint32 {
            return None;
        }
        self.uint32(TRANSACTION_FIELD)
    }

    pub fn set_transaction_id(&mut self, id: u32) -> Result<()> {
        self.set(TRANSACTION_FIELD, FieldValue::Uint32(id))
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.fields == other.fields
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (name, value) in self.fields() {
            map.entry(&name, value);
        }
        map.finish()?;
        write!(f, " <{} #{}>", self.name, self.id)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.name, self.id)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn spec() -> Arc<Specification> {
        Arc::new(Specification::bootstrap().unwrap())
    }

    #[test]
    fn test_set_checks_kind() {
        let spec = spec();
        let mut msg = Message::new(&spec, "p7.handshake.client_handshake").unwrap();
        msg.set("p7.handshake.version", "1.0").unwrap();
        assert!(matches!(
            msg.set("p7.handshake.version", 1u32),
            Err(ProtocolError::FieldTypeMismatch { .. })
        ));
        assert!(matches!(
            msg.set("p7.nope", true),
            Err(ProtocolError::UnknownField(_))
        ));
        assert_eq!(msg.string("p7.handshake.version"), Some("1.0"));
        assert_eq!(msg.bool("p7.handshake.version"), None);
    }

    #[test]
    fn test_enum_by_name() {
        let spec = spec();
        let mut msg = Message::new(&spec, "p7.handshake.client_handshake").unwrap();
        msg.set_enum("p7.handshake.checksum", "p7.handshake.checksum.sha256")
            .unwrap();
        assert_eq!(msg.enumeration("p7.handshake.checksum"), Some(2));
        assert_eq!(
            msg.enum_name("p7.handshake.checksum"),
            Some("p7.handshake.checksum.sha256")
        );
        assert!(msg
            .set_enum("p7.handshake.checksum", "p7.handshake.checksum.md5")
            .is_err());
    }

    #[test]
    fn test_missing_required() {
        let spec = spec();
        let msg = Message::new(&spec, "p7.encryption.server_key").unwrap();
        assert_eq!(msg.missing_required(), vec!["p7.encryption.public_key"]);
        assert!(Message::new(&spec, "p7.unknown").is_err());
    }

    #[test]
    fn test_transaction_field_requires_application_spec() {
        let spec = spec();
        let mut msg = Message::new(&spec, "p7.handshake.acknowledge").unwrap();
        assert!(msg.set_transaction_id(1).is_err());
        assert_eq!(msg.transaction_id(), None);
    }
}
