//! XML specification document parsing.
//!
//! Produces a [`SpecDocument`]: the raw declarations of one document, before layering
//! and cross-reference checks in the registry.

use crate::error::{ProtocolError, Result};
use crate::spec::transaction::{Originator, ReplyCount, ReplyGrammar, TransactionDefinition};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::HashMap;

/// A field declaration as written in a document.
#[derive(Debug, Clone, PartialEq)]
pub struct RawField {
    pub name: String,
    pub id: u32,
    pub type_name: String,
    pub enums: Vec<(String, u32)>,
}

/// A message declaration as written in a document.
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessage {
    pub name: String,
    pub id: u32,
    pub parameters: Vec<(String, bool)>,
}

/// Everything one specification document declares.
#[derive(Debug, Clone, Default)]
pub struct SpecDocument {
    pub name: String,
    pub version: String,
    pub types: Vec<(String, u32)>,
    pub fields: Vec<RawField>,
    pub messages: Vec<RawMessage>,
    pub transactions: Vec<TransactionDefinition>,
    pub collections: Vec<(String, Vec<String>)>,
}

enum Group {
    And(Vec<ReplyGrammar>),
    Or(Vec<ReplyGrammar>),
}

struct PendingTransaction {
    message: String,
    originator: Originator,
    required: bool,
    groups: Vec<Group>,
}

#[derive(Default)]
struct DocumentParser {
    document: SpecDocument,
    saw_protocol: bool,
    field: Option<RawField>,
    message: Option<RawMessage>,
    transaction: Option<PendingTransaction>,
    collection: Option<(String, Vec<String>)>,
}

fn invalid(message: impl Into<String>) -> ProtocolError {
    ProtocolError::InvalidSpecification(message.into())
}

fn attributes(element: &BytesStart<'_>) -> Result<HashMap<String, String>> {
    let mut map = HashMap::new();
    for attr in element.attributes() {
        let attr = attr.map_err(|e| invalid(format!("bad attribute: {e}")))?;
        let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| invalid(format!("bad attribute value: {e}")))?;
        map.insert(key, value.into_owned());
    }
    Ok(map)
}

fn required<'a>(attrs: &'a HashMap<String, String>, key: &str, element: &str) -> Result<&'a str> {
    attrs
        .get(key)
        .map(String::as_str)
        .ok_or_else(|| invalid(format!("<{element}> is missing the '{key}' attribute")))
}

fn numeric(attrs: &HashMap<String, String>, key: &str, element: &str) -> Result<u32> {
    let raw = required(attrs, key, element)?;
    raw.parse::<u32>()
        .map_err(|_| invalid(format!("<{element}> has a non-numeric {key} '{raw}'")))
}

fn is_required(attrs: &HashMap<String, String>) -> bool {
    attrs.get("use").map(String::as_str) == Some("required")
}

impl DocumentParser {
    fn open(&mut self, element: &BytesStart<'_>) -> Result<()> {
        let local = element.local_name();
        let name = std::str::from_utf8(local.as_ref()).map_err(|_| invalid("element name"))?;
        let attrs = attributes(element)?;

        match name {
            "protocol" => {
                self.saw_protocol = true;
                self.document.name = required(&attrs, "name", name)?.to_string();
                self.document.version = required(&attrs, "version", name)?.to_string();
            }
            "type" => {
                let type_name = required(&attrs, "name", name)?.to_string();
                let id = numeric(&attrs, "id", name)?;
                self.document.types.push((type_name, id));
            }
            "field" => {
                self.field = Some(RawField {
                    name: required(&attrs, "name", name)?.to_string(),
                    id: numeric(&attrs, "id", name)?,
                    type_name: required(&attrs, "type", name)?.to_string(),
                    enums: Vec::new(),
                });
            }
            "enum" => {
                let field = self
                    .field
                    .as_mut()
                    .ok_or_else(|| invalid("<enum> outside of a <field>"))?;
                let enum_name = required(&attrs, "name", name)?.to_string();
                let value = numeric(&attrs, "value", name)?;
                field.enums.push((enum_name, value));
            }
            "message" => {
                self.message = Some(RawMessage {
                    name: required(&attrs, "name", name)?.to_string(),
                    id: numeric(&attrs, "id", name)?,
                    parameters: Vec::new(),
                });
            }
            "parameter" => {
                let message = self
                    .message
                    .as_mut()
                    .ok_or_else(|| invalid("<parameter> outside of a <message>"))?;
                let field = required(&attrs, "field", name)?.to_string();
                message.parameters.push((field, is_required(&attrs)));
            }
            "transaction" => {
                let originator = required(&attrs, "originator", name)?;
                self.transaction = Some(PendingTransaction {
                    message: required(&attrs, "message", name)?.to_string(),
                    originator: Originator::parse(originator)
                        .ok_or_else(|| invalid(format!("unknown originator '{originator}'")))?,
                    required: is_required(&attrs),
                    groups: vec![Group::And(Vec::new())],
                });
            }
            "and" | "or" => {
                let transaction = self
                    .transaction
                    .as_mut()
                    .ok_or_else(|| invalid(format!("<{name}> outside of a <transaction>")))?;
                transaction.groups.push(if name == "and" {
                    Group::And(Vec::new())
                } else {
                    Group::Or(Vec::new())
                });
            }
            "reply" => {
                let transaction = self
                    .transaction
                    .as_mut()
                    .ok_or_else(|| invalid("<reply> outside of a <transaction>"))?;
                let raw_count = attrs.get("count").map(String::as_str).unwrap_or("1");
                let optional = attrs.get("use").map(String::as_str) == Some("optional");
                let count = ReplyCount::parse(raw_count, !optional)
                    .ok_or_else(|| invalid(format!("bad reply count '{raw_count}'")))?;
                let reply = ReplyGrammar::Reply {
                    message: required(&attrs, "message", name)?.to_string(),
                    count,
                };
                match transaction.groups.last_mut() {
                    Some(Group::And(children)) | Some(Group::Or(children)) => children.push(reply),
                    None => return Err(invalid("<reply> without a group")),
                }
            }
            "collection" => {
                self.collection = Some((required(&attrs, "name", name)?.to_string(), Vec::new()));
            }
            "member" => {
                let collection = self
                    .collection
                    .as_mut()
                    .ok_or_else(|| invalid("<member> outside of a <collection>"))?;
                collection
                    .1
                    .push(required(&attrs, "field", name)?.to_string());
            }
            _ => {}
        }
        Ok(())
    }

    fn close(&mut self, local: &[u8]) -> Result<()> {
        match local {
            b"field" => {
                if let Some(field) = self.field.take() {
                    self.document.fields.push(field);
                }
            }
            b"message" => {
                if let Some(message) = self.message.take() {
                    self.document.messages.push(message);
                }
            }
            b"and" | b"or" => {
                let transaction = self
                    .transaction
                    .as_mut()
                    .ok_or_else(|| invalid("group closed outside of a <transaction>"))?;
                let node = match transaction.groups.pop() {
                    Some(Group::And(children)) => ReplyGrammar::And(children),
                    Some(Group::Or(children)) => ReplyGrammar::Or(children),
                    None => return Err(invalid("unbalanced reply group")),
                };
                match transaction.groups.last_mut() {
                    Some(Group::And(children)) | Some(Group::Or(children)) => children.push(node),
                    None => return Err(invalid("unbalanced reply group")),
                }
            }
            b"transaction" => {
                if let Some(mut transaction) = self.transaction.take() {
                    let replies = match transaction.groups.pop() {
                        Some(Group::And(children)) if transaction.groups.is_empty() => {
                            ReplyGrammar::And(children)
                        }
                        _ => return Err(invalid("unbalanced reply group")),
                    };
                    self.document.transactions.push(TransactionDefinition {
                        message: transaction.message,
                        originator: transaction.originator,
                        required: transaction.required,
                        replies,
                    });
                }
            }
            b"collection" => {
                if let Some(collection) = self.collection.take() {
                    self.document.collections.push(collection);
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// Parse one specification document.
pub fn parse_document(xml: &str) -> Result<SpecDocument> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut parser = DocumentParser::default();

    loop {
        match reader.read_event() {
            Ok(Event::Start(element)) => parser.open(&element)?,
            Ok(Event::Empty(element)) => {
                parser.open(&element)?;
                parser.close(element.local_name().as_ref())?;
            }
            Ok(Event::End(element)) => parser.close(element.local_name().as_ref())?,
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(invalid(format!(
                    "XML error at byte {}: {e}",
                    reader.buffer_position()
                )))
            }
        }
    }

    if !parser.saw_protocol {
        return Err(invalid("document has no <p7:protocol> root"));
    }
    Ok(parser.document)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::spec::bootstrap::BOOTSTRAP_SPEC;

    #[test]
    fn test_parse_bootstrap() {
        let doc = parse_document(BOOTSTRAP_SPEC).unwrap();
        assert_eq!(doc.name, "P7");
        assert_eq!(doc.version, "1.0");
        assert_eq!(doc.types.len(), 13);
        assert_eq!(doc.messages.len(), 9);
        let encryption = doc
            .fields
            .iter()
            .find(|f| f.name == "p7.handshake.encryption")
            .unwrap();
        assert_eq!(encryption.enums.len(), 4);

        let client_key = doc
            .transactions
            .iter()
            .find(|t| t.message == "p7.encryption.client_key")
            .unwrap();
        match &client_key.replies {
            ReplyGrammar::And(children) => {
                assert!(matches!(&children[0], ReplyGrammar::Or(branches) if branches.len() == 2))
            }
            other => panic!("unexpected grammar {other:?}"),
        }
    }

    #[test]
    fn test_missing_attribute_is_rejected() {
        let xml = r#"<p7:protocol xmlns:p7="x" name="T" version="1">
            <p7:fields><p7:field name="a" type="string" /></p7:fields>
        </p7:protocol>"#;
        assert!(matches!(
            parse_document(xml),
            Err(ProtocolError::InvalidSpecification(_))
        ));
    }

    #[test]
    fn test_malformed_xml_is_rejected() {
        assert!(parse_document("<p7:protocol name=").is_err());
        assert!(parse_document("<other/>").is_err());
    }
}
