//! The specification registry.
//!
//! A [`Specification`] is built once from the bootstrap document plus an optional
//! application document, then shared read-only (`Arc<Specification>`) by every codec,
//! channel and connection.

use crate::core::message::Message;
use crate::core::types::{FieldKind, FieldValue};
use crate::error::{ProtocolError, Result};
use crate::spec::bootstrap::{BOOTSTRAP_NAME, BOOTSTRAP_SPEC, BOOTSTRAP_VERSION};
use crate::spec::parser::{parse_document, SpecDocument};
use crate::spec::transaction::TransactionDefinition;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

/// A named value of an enum field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumValue {
    pub name: String,
    pub value: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldDefinition {
    pub name: String,
    pub id: u32,
    pub kind: FieldKind,
    pub enums: Vec<EnumValue>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parameter {
    pub field: String,
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageDefinition {
    pub name: String,
    pub id: u32,
    pub parameters: Vec<Parameter>,
}

/// An application error code, taken from the enum of an `*.error` field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorDefinition {
    pub name: String,
    pub id: u32,
}

#[derive(Debug, Default)]
pub struct Specification {
    bootstrap_version: String,
    protocol_name: String,
    protocol_version: String,
    document: Option<String>,
    fields: Vec<FieldDefinition>,
    fields_by_name: HashMap<String, usize>,
    fields_by_id: HashMap<u32, usize>,
    messages: Vec<MessageDefinition>,
    messages_by_name: HashMap<String, usize>,
    messages_by_id: HashMap<u32, usize>,
    transactions: HashMap<String, TransactionDefinition>,
    errors: Vec<ErrorDefinition>,
    errors_by_name: HashMap<String, usize>,
    errors_by_id: HashMap<u32, usize>,
    collections: HashMap<String, Vec<String>>,
}

impl Specification {
    /// The bootstrap specification alone.
    pub fn bootstrap() -> Result<Self> {
        let mut spec = Self::default();
        spec.layer(parse_document(BOOTSTRAP_SPEC)?)?;
        spec.bootstrap_version = BOOTSTRAP_VERSION.to_string();
        spec.protocol_name = BOOTSTRAP_NAME.to_string();
        spec.protocol_version = BOOTSTRAP_VERSION.to_string();
        spec.finish()?;
        Ok(spec)
    }

    /// The bootstrap specification with an application document layered on top.
    pub fn from_xml(xml: &str) -> Result<Self> {
        let mut spec = Self::default();
        spec.layer(parse_document(BOOTSTRAP_SPEC)?)?;
        spec.bootstrap_version = BOOTSTRAP_VERSION.to_string();

        let application = parse_document(xml)?;
        spec.protocol_name = application.name.clone();
        spec.protocol_version = application.version.clone();
        spec.layer(application)?;
        spec.document = Some(xml.to_string());
        spec.finish()?;

        info!(
            protocol = %spec.protocol_name,
            version = %spec.protocol_version,
            fields = spec.fields.len(),
            messages = spec.messages.len(),
            transactions = spec.transactions.len(),
            "Loaded protocol specification"
        );
        Ok(spec)
    }

    /// Load an application document from disk.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let xml = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ProtocolError::InvalidSpecification(format!(
                "Failed to read {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Self::from_xml(&xml)
    }

    fn layer(&mut self, document: SpecDocument) -> Result<()> {
        for (type_name, id) in &document.types {
            match FieldKind::from_name(type_name) {
                Some(kind) if kind.type_id() == *id => {}
                _ => {
                    return Err(ProtocolError::InvalidSpecification(format!(
                        "unsupported type '{type_name}' with id {id}"
                    )))
                }
            }
        }

        for raw in document.fields {
            let kind = FieldKind::from_name(&raw.type_name).ok_or_else(|| {
                ProtocolError::InvalidSpecification(format!(
                    "field {} has unknown type '{}'",
                    raw.name, raw.type_name
                ))
            })?;
            if self.fields_by_id.contains_key(&raw.id) {
                return Err(ProtocolError::DuplicateId {
                    kind: "field",
                    id: raw.id,
                });
            }
            if self.fields_by_name.contains_key(&raw.name) {
                return Err(ProtocolError::InvalidSpecification(format!(
                    "duplicate field name {}",
                    raw.name
                )));
            }
            let index = self.fields.len();
            self.fields_by_id.insert(raw.id, index);
            self.fields_by_name.insert(raw.name.clone(), index);
            self.fields.push(FieldDefinition {
                name: raw.name,
                id: raw.id,
                kind,
                enums: raw
                    .enums
                    .into_iter()
                    .map(|(name, value)| EnumValue { name, value })
                    .collect(),
            });
        }

        for raw in document.messages {
            if self.messages_by_id.contains_key(&raw.id) {
                return Err(ProtocolError::DuplicateId {
                    kind: "message",
                    id: raw.id,
                });
            }
            if self.messages_by_name.contains_key(&raw.name) {
                return Err(ProtocolError::InvalidSpecification(format!(
                    "duplicate message name {}",
                    raw.name
                )));
            }
            let index = self.messages.len();
            self.messages_by_id.insert(raw.id, index);
            self.messages_by_name.insert(raw.name.clone(), index);
            self.messages.push(MessageDefinition {
                name: raw.name,
                id: raw.id,
                parameters: raw
                    .parameters
                    .into_iter()
                    .map(|(field, required)| Parameter { field, required })
                    .collect(),
            });
        }

        for transaction in document.transactions {
            self.transactions
                .insert(transaction.message.clone(), transaction);
        }
        for (name, members) in document.collections {
            self.collections.insert(name, members);
        }
        Ok(())
    }

    /// Check cross references and build the error table.
    fn finish(&mut self) -> Result<()> {
        for message in &self.messages {
            for parameter in &message.parameters {
                if !self.fields_by_name.contains_key(&parameter.field) {
                    return Err(ProtocolError::InvalidSpecification(format!(
                        "message {} references unknown field {}",
                        message.name, parameter.field
                    )));
                }
            }
        }

        for transaction in self.transactions.values() {
            let names = std::iter::once(transaction.message.as_str())
                .chain(transaction.replies.messages());
            for name in names {
                if !self.messages_by_name.contains_key(name) {
                    return Err(ProtocolError::InvalidSpecification(format!(
                        "transaction {} references unknown message {name}",
                        transaction.message
                    )));
                }
            }
        }

        for (name, members) in &self.collections {
            if let Some(missing) = members
                .iter()
                .find(|m| !self.fields_by_name.contains_key(m.as_str()))
            {
                return Err(ProtocolError::InvalidSpecification(format!(
                    "collection {name} references unknown field {missing}"
                )));
            }
        }

        for field in self.fields.iter().filter(|f| f.name.ends_with(".error")) {
            for value in &field.enums {
                // First declaration wins when two error fields reuse a code.
                if self.errors_by_id.contains_key(&value.value) {
                    continue;
                }
                let index = self.errors.len();
                self.errors_by_id.insert(value.value, index);
                self.errors_by_name.insert(value.name.clone(), index);
                self.errors.push(ErrorDefinition {
                    name: value.name.clone(),
                    id: value.value,
                });
            }
        }

        debug!(
            errors = self.errors.len(),
            collections = self.collections.len(),
            "Specification indexes built"
        );
        Ok(())
    }

    pub fn bootstrap_version(&self) -> &str {
        &self.bootstrap_version
    }

    pub fn protocol_name(&self) -> &str {
        &self.protocol_name
    }

    pub fn protocol_version(&self) -> &str {
        &self.protocol_version
    }

    /// The application document text, or the bootstrap document when none was loaded.
    pub fn document(&self) -> &str {
        self.document.as_deref().unwrap_or(BOOTSTRAP_SPEC)
    }

    pub fn field(&self, name: &str) -> Option<&FieldDefinition> {
        self.fields_by_name.get(name).map(|&i| &self.fields[i])
    }

    pub fn field_by_id(&self, id: u32) -> Option<&FieldDefinition> {
        self.fields_by_id.get(&id).map(|&i| &self.fields[i])
    }

    pub fn message(&self, name: &str) -> Option<&MessageDefinition> {
        self.messages_by_name.get(name).map(|&i| &self.messages[i])
    }

    pub fn message_by_id(&self, id: u32) -> Option<&MessageDefinition> {
        self.messages_by_id.get(&id).map(|&i| &self.messages[i])
    }

    pub fn transaction(&self, message: &str) -> Option<&TransactionDefinition> {
        self.transactions.get(message)
    }

    pub fn error(&self, name: &str) -> Option<&ErrorDefinition> {
        self.errors_by_name.get(name).map(|&i| &self.errors[i])
    }

    pub fn error_by_id(&self, id: u32) -> Option<&ErrorDefinition> {
        self.errors_by_id.get(&id).map(|&i| &self.errors[i])
    }

    pub fn collection(&self, name: &str) -> Option<&[String]> {
        self.collections.get(name).map(Vec::as_slice)
    }

    pub fn fields(&self) -> impl Iterator<Item = &FieldDefinition> {
        self.fields.iter()
    }

    pub fn messages(&self) -> impl Iterator<Item = &MessageDefinition> {
        self.messages.iter()
    }

    /// Value of a named enum constant of `field`.
    pub fn enum_value(&self, field: &str, name: &str) -> Option<u32> {
        self.field(field)?
            .enums
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.value)
    }

    /// Name of the enum constant `value` of `field`.
    pub fn enum_name(&self, field: &str, value: u32) -> Option<&str> {
        self.field(field)?
            .enums
            .iter()
            .find(|e| e.value == value)
            .map(|e| e.name.as_str())
    }

    /// Resolve the error code carried by an error message.
    pub fn error_for_message(&self, message: &Message) -> Option<&ErrorDefinition> {
        message.fields().find_map(|(name, value)| match value {
            FieldValue::Enum(code) if name.ends_with(".error") => self.error_by_id(*code),
            _ => None,
        })
    }

    /// Whether a peer announcing `name`/`version` needs its document checked.
    pub fn needs_compatibility_check(&self, name: &str, version: &str) -> bool {
        name != self.protocol_name || version != self.protocol_version
    }

    /// Compare a remote application document against this specification.
    ///
    /// Names must match. Versions may differ as long as every field and message
    /// declared on both sides agrees on id (and, for fields, kind).
    pub fn is_compatible_with(&self, remote_xml: &str) -> Result<bool> {
        let remote = parse_document(remote_xml)?;
        if remote.name != self.protocol_name {
            return Ok(false);
        }
        if remote.version == self.protocol_version {
            return Ok(true);
        }

        let fields_agree = remote.fields.iter().all(|raw| match self.field(&raw.name) {
            Some(local) => {
                local.id == raw.id && FieldKind::from_name(&raw.type_name) == Some(local.kind)
            }
            None => true,
        });
        let messages_agree = remote
            .messages
            .iter()
            .all(|raw| self.message(&raw.name).map_or(true, |local| local.id == raw.id));

        Ok(fields_agree && messages_agree)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const APP: &str = r#"<p7:protocol xmlns:p7="x" name="Test" version="1.0">
      <p7:fields>
        <p7:field name="test.error" type="enum" id="1000">
          <p7:enum name="test.error.denied" value="4" />
        </p7:field>
        <p7:field name="test.text" type="string" id="1001" />
      </p7:fields>
      <p7:messages>
        <p7:message name="test.say" id="1000">
          <p7:parameter field="test.text" use="required" />
        </p7:message>
        <p7:message name="test.error" id="1001">
          <p7:parameter field="test.error" use="required" />
        </p7:message>
      </p7:messages>
      <p7:transactions>
        <p7:transaction message="test.say" originator="client" use="required">
          <p7:reply message="test.error" count="1" use="required" />
        </p7:transaction>
      </p7:transactions>
    </p7:protocol>"#;

    #[test]
    fn test_bootstrap_indexes() {
        let spec = Specification::bootstrap().unwrap();
        assert_eq!(spec.bootstrap_version(), "1.0");
        assert_eq!(spec.message_by_id(1).unwrap().name, "p7.handshake.client_handshake");
        assert_eq!(spec.field("p7.encryption.cipher.iv").unwrap().id, 11);
        assert_eq!(
            spec.enum_value("p7.handshake.checksum", "p7.handshake.checksum.sha512"),
            Some(3)
        );
        assert!(spec.transaction("p7.encryption.client_key").is_some());
    }

    #[test]
    fn test_application_layer() {
        let spec = Specification::from_xml(APP).unwrap();
        assert_eq!(spec.protocol_name(), "Test");
        assert_eq!(spec.field_by_id(1001).unwrap().kind, FieldKind::String);
        assert_eq!(spec.error_by_id(4).unwrap().name, "test.error.denied");
        assert!(spec.message("p7.handshake.acknowledge").is_some());
    }

    #[test]
    fn test_id_collision_with_bootstrap_is_fatal() {
        let xml = r#"<p7:protocol xmlns:p7="x" name="Bad" version="1">
          <p7:fields><p7:field name="bad.field" type="bool" id="1" /></p7:fields>
        </p7:protocol>"#;
        assert!(matches!(
            Specification::from_xml(xml),
            Err(ProtocolError::DuplicateId { kind: "field", id: 1 })
        ));
    }

    #[test]
    fn test_dangling_reference_is_fatal() {
        let xml = r#"<p7:protocol xmlns:p7="x" name="Bad" version="1">
          <p7:messages>
            <p7:message name="bad.message" id="500">
              <p7:parameter field="bad.missing" />
            </p7:message>
          </p7:messages>
        </p7:protocol>"#;
        assert!(Specification::from_xml(xml).is_err());
    }

    #[test]
    fn test_compatibility_predicate() {
        let spec = Specification::from_xml(APP).unwrap();
        assert!(spec.is_compatible_with(APP).unwrap());
        assert!(!spec.needs_compatibility_check("Test", "1.0"));
        assert!(spec.needs_compatibility_check("Test", "1.1"));

        let newer = APP.replace("version=\"1.0\"", "version=\"1.1\"");
        assert!(spec.is_compatible_with(&newer).unwrap());

        let renumbered = newer.replace("id=\"1001\" />", "id=\"1002\" />");
        assert!(!spec.is_compatible_with(&renumbered).unwrap());

        let renamed = APP.replace("name=\"Test\"", "name=\"Other\"");
        assert!(!spec.is_compatible_with(&renamed).unwrap());
    }
}
