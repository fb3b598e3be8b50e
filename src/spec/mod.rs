//! # Specification Registry
//!
//! P7 is self-describing: field types, message shapes, transaction grammars and error
//! codes come from XML specification documents loaded at startup.
//!
//! ## Components
//! - **Bootstrap**: the embedded transport document every registry starts from
//! - **Parser**: quick-xml driven document reader
//! - **Registry**: the indexed, read-only [`Specification`]
//! - **Transaction**: reply grammars (single, AND, OR)
//!
//! Load failures (malformed XML, unknown types, id collisions) are fatal initialization
//! errors.

pub mod bootstrap;
pub mod parser;
pub mod registry;
pub mod transaction;

pub use registry::{
    EnumValue, ErrorDefinition, FieldDefinition, MessageDefinition, Parameter, Specification,
};
pub use transaction::{Originator, ReplyCount, ReplyGrammar, TransactionDefinition};
