use crate::core::message::Message;
use crate::error::{constants, ProtocolError, Result};
use crate::service::server::ServerSession;
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

type HandlerFn = dyn Fn(&ServerSession, &Message) -> Result<Vec<Message>> + Send + Sync + 'static;

/// Routes logged-in application messages to business handlers by message name.
///
/// Handlers return the replies to send back; the server stamps each one with the
/// request's transaction id.
pub struct Dispatcher {
    handlers: Arc<RwLock<HashMap<Cow<'static, str>, Box<HandlerFn>>>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn register<F>(&self, message: &str, handler: F) -> Result<()>
    where
        F: Fn(&ServerSession, &Message) -> Result<Vec<Message>> + Send + Sync + 'static,
    {
        let mut handlers = self
            .handlers
            .write()
            .map_err(|_| ProtocolError::Custom(constants::ERR_DISPATCHER_WRITE_LOCK.into()))?;

        handlers.insert(Cow::Owned(message.to_string()), Box::new(handler));
        Ok(())
    }

    pub fn has_handler(&self, message: &str) -> bool {
        self.handlers
            .read()
            .map(|handlers| handlers.contains_key(message))
            .unwrap_or(false)
    }

    /// Run the handler registered for `message`'s type.
    ///
    /// Fails with `UnexpectedMessage` when no handler is registered.
    pub fn dispatch(&self, session: &ServerSession, message: &Message) -> Result<Vec<Message>> {
        let handlers = self
            .handlers
            .read()
            .map_err(|_| ProtocolError::Custom(constants::ERR_DISPATCHER_READ_LOCK.into()))?;

        handlers
            .get(message.name())
            .ok_or_else(|| ProtocolError::UnexpectedMessage(message.name().to_string()))
            .and_then(|handler| handler(session, message))
    }
}
