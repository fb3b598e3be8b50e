//! # P7 Server
//!
//! Listener, per-connection sessions and the connection registry.
//!
//! Each accepted socket is served on its own thread: the secure handshake runs first,
//! then the session loops over incoming messages. Session-level messages (client info,
//! presence, login, ping) are answered here; everything else goes to the
//! [`Dispatcher`] once the session is logged in.
//!
//! ## Session States
//! ```text
//! Connected ──client_info──> GaveClientInfo ──send_login──> LoggedIn
//! ```
//! A message the current state does not permit is answered with
//! `wired.error.message_out_of_sequence` and the session is closed.

use crate::config::NetworkConfig;
use crate::core::message::Message;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::dispatcher::Dispatcher;
use crate::protocol::handshake::HandshakePolicy;
use crate::protocol::key_exchange::{password_digest, RsaKeyTransport};
use crate::service::secure::{AcceptOptions, SecureChannel};
use crate::spec::Specification;
use crate::utils::metrics::global_metrics;
use crate::utils::timeout::POLL_INTERVAL;
use chrono::{DateTime, Utc};
use rsa::RsaPrivateKey;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use subtle::ConstantTimeEq;
use tracing::{debug, error, info, instrument, warn};

pub const CLIENT_INFO: &str = "wired.client_info";
pub const SERVER_INFO: &str = "wired.server_info";
pub const SEND_PING: &str = "wired.send_ping";
pub const PING: &str = "wired.ping";
pub const SEND_LOGIN: &str = "wired.send_login";
pub const LOGIN: &str = "wired.login";
pub const PRIVILEGES: &str = "wired.account.privileges";
pub const SET_NICK: &str = "wired.user.set_nick";
pub const SET_STATUS: &str = "wired.user.set_status";
pub const SET_ICON: &str = "wired.user.set_icon";
pub const OKAY: &str = "wired.okay";
pub const ERROR: &str = "wired.error";
pub const USER_STATUS: &str = "wired.chat.user_status";
pub const USER_LEAVE: &str = "wired.chat.user_leave";

/// Chat every logged-in user belongs to.
pub const PUBLIC_CHAT_ID: u32 = 1;

/// Stored credentials and privileges.
pub trait CredentialStore: Send + Sync {
    /// Hex SHA-256 digest of the user's password, `None` for unknown users.
    fn password(&self, user: &str) -> Option<String>;

    /// Privilege field names granted to the user.
    fn privileges(&self, user: &str) -> Vec<String>;
}

struct Account {
    digest: String,
    privileges: Vec<String>,
}

/// In-memory [`CredentialStore`].
#[derive(Default)]
pub struct MemoryCredentials {
    accounts: RwLock<HashMap<String, Account>>,
}

impl MemoryCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a user. The password is stored as its digest.
    pub fn add_user(&self, login: &str, password: &str, privileges: &[&str]) {
        let account = Account {
            digest: password_digest(password),
            privileges: privileges.iter().map(|p| (*p).to_string()).collect(),
        };
        self.accounts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(login.to_string(), account);
    }

    pub fn remove_user(&self, login: &str) -> bool {
        self.accounts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(login)
            .is_some()
    }
}

impl CredentialStore for MemoryCredentials {
    fn password(&self, user: &str) -> Option<String> {
        self.accounts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(user)
            .map(|account| account.digest.clone())
    }

    fn privileges(&self, user: &str) -> Vec<String> {
        self.accounts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(user)
            .map(|account| account.privileges.clone())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    GaveClientInfo,
    LoggedIn,
}

impl SessionState {
    /// Whether a message of type `name` may arrive in this state.
    pub fn permits(self, name: &str) -> bool {
        match self {
            SessionState::Connected => matches!(name, CLIENT_INFO | SEND_PING | PING),
            SessionState::GaveClientInfo => matches!(
                name,
                CLIENT_INFO | SEND_PING | PING | SET_NICK | SET_STATUS | SET_ICON | SEND_LOGIN
            ),
            SessionState::LoggedIn => true,
        }
    }
}

#[derive(Debug)]
struct Presence {
    state: SessionState,
    login: Option<String>,
    nick: String,
    status: String,
    icon: Vec<u8>,
    application: Option<String>,
}

/// One connected client as seen by the server and by business handlers.
pub struct ServerSession {
    user_id: u32,
    channel: Arc<SecureChannel>,
    presence: Mutex<Presence>,
}

impl ServerSession {
    fn new(user_id: u32, channel: Arc<SecureChannel>) -> Self {
        Self {
            user_id,
            channel,
            presence: Mutex::new(Presence {
                state: SessionState::Connected,
                login: None,
                nick: String::new(),
                status: String::new(),
                icon: Vec::new(),
                application: None,
            }),
        }
    }

    fn presence(&self) -> std::sync::MutexGuard<'_, Presence> {
        self.presence.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn user_id(&self) -> u32 {
        self.user_id
    }

    pub fn state(&self) -> SessionState {
        self.presence().state
    }

    pub fn login(&self) -> Option<String> {
        self.presence().login.clone()
    }

    pub fn nick(&self) -> String {
        self.presence().nick.clone()
    }

    pub fn status(&self) -> String {
        self.presence().status.clone()
    }

    /// Application name the client reported in `wired.client_info`.
    pub fn application(&self) -> Option<String> {
        self.presence().application.clone()
    }

    pub fn spec(&self) -> &Arc<Specification> {
        self.channel.spec()
    }

    pub fn channel(&self) -> &Arc<SecureChannel> {
        &self.channel
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.channel.session().peer_addr
    }

    /// Write a message on this session's connection.
    pub fn send(&self, message: &Message) -> Result<()> {
        self.channel.write_message(message)
    }

    /// Deliver a server-initiated message. Non-interactive sessions refuse with
    /// `Suspended`.
    pub fn push(&self, message: &Message) -> Result<()> {
        if !self.channel.is_interactive() {
            return Err(ProtocolError::Suspended);
        }
        self.send(message)
    }

    pub fn set_interactive(&self, interactive: bool) {
        self.channel.set_interactive(interactive);
    }

    pub fn disconnect(&self) {
        self.channel.disconnect();
    }

    fn user_status(&self) -> Result<Message> {
        let presence = self.presence();
        let mut message = Message::new(self.spec(), USER_STATUS)?
            .with("wired.chat.id", PUBLIC_CHAT_ID)?
            .with("wired.user.id", self.user_id)?
            .with("wired.user.nick", presence.nick.as_str())?
            .with("wired.user.status", presence.status.as_str())?
            .with("wired.user.idle", false)?;
        if !presence.icon.is_empty() {
            message.set("wired.user.icon", presence.icon.clone())?;
        }
        Ok(message)
    }
}

impl std::fmt::Debug for ServerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerSession")
            .field("user_id", &self.user_id)
            .field("presence", &*self.presence())
            .finish_non_exhaustive()
    }
}

/// Live sessions keyed by user id.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    sessions: Arc<RwLock<HashMap<u32, Arc<ServerSession>>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, session: Arc<ServerSession>) -> Result<()> {
        self.sessions
            .write()
            .map_err(|_| ProtocolError::Custom(constants::ERR_REGISTRY_LOCK.into()))?
            .insert(session.user_id(), session);
        Ok(())
    }

    fn remove(&self, user_id: u32) -> Option<Arc<ServerSession>> {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&user_id)
    }

    pub fn get(&self, user_id: u32) -> Option<Arc<ServerSession>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&user_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Logged-in sessions, in user id order.
    pub fn logged_in(&self) -> Vec<Arc<ServerSession>> {
        let mut sessions: Vec<_> = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|s| s.state() == SessionState::LoggedIn)
            .cloned()
            .collect();
        sessions.sort_by_key(|s| s.user_id());
        sessions
    }

    /// Push `message` to every logged-in, interactive session except `except`.
    /// Returns how many sessions received it.
    pub fn broadcast(&self, message: &Message, except: Option<u32>) -> usize {
        let mut delivered = 0;
        for session in self.snapshot() {
            if Some(session.user_id()) == except || session.state() != SessionState::LoggedIn {
                continue;
            }
            match session.push(message) {
                Ok(()) => delivered += 1,
                Err(ProtocolError::Suspended) => {}
                Err(e) => debug!(user = session.user_id(), error = %e, "Broadcast failed"),
            }
        }
        delivered
    }

    /// Every registered session. Writes happen on the copy, outside the lock.
    fn snapshot(&self) -> Vec<Arc<ServerSession>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    fn disconnect_all(&self) {
        for session in self.snapshot() {
            session.disconnect();
        }
    }
}

/// Shared by the acceptor and every session thread.
struct ServerContext {
    spec: Arc<Specification>,
    accept: AcceptOptions,
    credentials: Arc<dyn CredentialStore>,
    dispatcher: Arc<Dispatcher>,
    registry: ConnectionRegistry,
    server_name: String,
    server_description: String,
    start_time: DateTime<Utc>,
    max_connections: usize,
    /// Accepted sockets, counted from accept until the session thread ends
    open_sockets: AtomicUsize,
    next_user_id: AtomicU32,
    running: AtomicBool,
}

impl ServerContext {
    fn message(&self, name: &str) -> Result<Message> {
        Message::new(&self.spec, name)
    }

    fn error_message(&self, code: &str) -> Result<Message> {
        let mut message = self.message(ERROR)?;
        message.set_enum("wired.error", code)?;
        Ok(message)
    }

    /// Stamp `reply` with the request's transaction id and send it.
    fn reply(&self, session: &ServerSession, request: &Message, mut reply: Message) -> Result<()> {
        if let Some(id) = request.transaction_id() {
            reply.set_transaction_id(id)?;
        }
        session.send(&reply)
    }

    fn serve(&self, stream: TcpStream) {
        let channel = match SecureChannel::accept(stream, Arc::clone(&self.spec), &self.accept) {
            Ok(channel) => Arc::new(channel),
            Err(e) => {
                warn!(error = %e, "Rejected connection during handshake");
                return;
            }
        };

        let user_id = self.next_user_id.fetch_add(1, Ordering::Relaxed);
        let session = Arc::new(ServerSession::new(user_id, channel));
        if let Err(e) = self.registry.insert(Arc::clone(&session)) {
            error!(error = %e, "Could not register session");
            session.disconnect();
            return;
        }
        info!(user = user_id, peer = %session.peer_addr(), "Session started");

        match self.run_session(&session) {
            Ok(()) | Err(ProtocolError::ConnectionClosed) => {}
            Err(e) => warn!(user = user_id, error = %e, "Session ended with error"),
        }

        self.registry.remove(user_id);
        session.disconnect();
        if session.state() == SessionState::LoggedIn {
            let leave = self.message(USER_LEAVE).and_then(|m| {
                m.with("wired.chat.id", PUBLIC_CHAT_ID)?
                    .with("wired.user.id", user_id)
            });
            match leave {
                Ok(leave) => {
                    self.registry.broadcast(&leave, None);
                }
                Err(e) => warn!(error = %e, "Could not build user_leave"),
            }
        }
        info!(user = user_id, "Session closed");
    }

    fn run_session(&self, session: &ServerSession) -> Result<()> {
        let channel = session.channel();
        while self.running.load(Ordering::Acquire) {
            if !channel.is_interactive() {
                // The socket belongs to an out-of-band transfer until the flag is restored.
                if !channel.is_connected() {
                    return Err(ProtocolError::ConnectionClosed);
                }
                thread::sleep(channel.poll_interval());
                continue;
            }
            if let Some(message) = channel.poll_message()? {
                self.handle(session, message)?;
            }
        }
        Ok(())
    }

    #[instrument(
        skip(self, session, message),
        fields(user = session.user_id(), message = message.name())
    )]
    fn handle(&self, session: &ServerSession, message: Message) -> Result<()> {
        let name = message.name().to_string();
        if !session.state().permits(&name) {
            warn!(state = ?session.state(), "Message out of sequence");
            global_metrics().protocol_error();
            self.reply(
                session,
                &message,
                self.error_message("wired.error.message_out_of_sequence")?,
            )?;
            return Err(ProtocolError::OutOfSequence(name));
        }

        match name.as_str() {
            CLIENT_INFO => self.client_info(session, &message),
            SEND_PING => self.reply(session, &message, self.message(PING)?),
            PING => Ok(()),
            SET_NICK | SET_STATUS | SET_ICON => self.presence(session, &message),
            SEND_LOGIN => self.login(session, &message),
            _ => self.dispatch(session, &message),
        }
    }

    fn client_info(&self, session: &ServerSession, message: &Message) -> Result<()> {
        {
            let mut presence = session.presence();
            presence.application = message
                .string("wired.info.application.name")
                .map(str::to_string);
            if presence.state == SessionState::Connected {
                presence.state = SessionState::GaveClientInfo;
            }
        }
        let info = self
            .message(SERVER_INFO)?
            .with("wired.info.application.name", env!("CARGO_PKG_NAME"))?
            .with("wired.info.application.version", env!("CARGO_PKG_VERSION"))?
            .with("wired.info.os.name", std::env::consts::OS)?
            .with("wired.info.arch", std::env::consts::ARCH)?
            .with("wired.info.name", self.server_name.as_str())?
            .with("wired.info.description", self.server_description.as_str())?
            .with("wired.info.start_time", self.start_time)?;
        self.reply(session, message, info)
    }

    fn presence(&self, session: &ServerSession, message: &Message) -> Result<()> {
        let logged_in = {
            let mut presence = session.presence();
            match message.name() {
                SET_NICK => {
                    presence.nick = message
                        .string("wired.user.nick")
                        .unwrap_or_default()
                        .to_string();
                }
                SET_STATUS => {
                    presence.status = message
                        .string("wired.user.status")
                        .unwrap_or_default()
                        .to_string();
                }
                _ => {
                    presence.icon = message.data("wired.user.icon").unwrap_or_default().to_vec();
                }
            }
            presence.state == SessionState::LoggedIn
        };
        self.reply(session, message, self.message(OKAY)?)?;
        if logged_in {
            self.registry
                .broadcast(&session.user_status()?, Some(session.user_id()));
        }
        Ok(())
    }

    fn login(&self, session: &ServerSession, message: &Message) -> Result<()> {
        let login = message.string("wired.user.login").unwrap_or_default();
        let digest = message.string("wired.user.password").unwrap_or_default();

        // A key exchange already bound the connection to one user.
        let bound = session
            .channel()
            .session()
            .username
            .as_deref()
            .map_or(true, |user| user == login);
        let matches = self
            .credentials
            .password(login)
            .map(|stored| bool::from(stored.as_bytes().ct_eq(digest.as_bytes())))
            .unwrap_or(false);

        if !(bound && matches) {
            warn!(user = %login, "Login failed");
            return self.reply(session, message, self.error_message("wired.error.login_failed")?);
        }

        {
            let mut presence = session.presence();
            presence.login = Some(login.to_string());
            presence.state = SessionState::LoggedIn;
        }
        let reply = self.message(LOGIN)?.with("wired.user.id", session.user_id())?;
        self.reply(session, message, reply)?;

        let granted = self.credentials.privileges(login);
        let mut privileges = self.message(PRIVILEGES)?;
        for field in self.spec.collection(PRIVILEGES).unwrap_or_default() {
            privileges.set(field, granted.iter().any(|g| g == field))?;
        }
        session.send(&privileges)?;
        info!(user = %login, id = session.user_id(), "Logged in");
        Ok(())
    }

    fn dispatch(&self, session: &ServerSession, message: &Message) -> Result<()> {
        if !self.dispatcher.has_handler(message.name()) {
            debug!("No handler registered");
            let unrecognized = self.error_message("wired.error.unrecognized_message")?;
            return self.reply(session, message, unrecognized);
        }
        let replies = match self.dispatcher.dispatch(session, message) {
            Ok(replies) => replies,
            Err(e) if !e.is_fatal() => {
                warn!(error = %e, "Handler failed");
                let mut reply = self.error_message("wired.error.internal_error")?;
                reply.set("wired.error.string", e.to_string())?;
                vec![reply]
            }
            Err(e) => return Err(e),
        };
        for reply in replies {
            self.reply(session, message, reply)?;
        }
        Ok(())
    }
}

/// A configured, not yet listening server.
pub struct Server {
    config: NetworkConfig,
    spec: Arc<Specification>,
    credentials: Arc<dyn CredentialStore>,
    dispatcher: Arc<Dispatcher>,
    rsa_key: Option<Arc<RsaPrivateKey>>,
}

impl Server {
    pub fn new(
        config: &NetworkConfig,
        spec: Arc<Specification>,
        credentials: Arc<dyn CredentialStore>,
    ) -> Self {
        Self {
            config: config.clone(),
            spec,
            credentials,
            dispatcher: Arc::new(Dispatcher::new()),
            rsa_key: None,
        }
    }

    /// Build a server from configuration alone. The application specification named by
    /// `server.spec_path` is layered over the bootstrap; without one only the bootstrap
    /// messages are known.
    pub fn from_config(
        config: &NetworkConfig,
        credentials: Arc<dyn CredentialStore>,
    ) -> Result<Self> {
        let spec = match &config.server.spec_path {
            Some(path) => {
                info!(path = %path.display(), "Loading application specification");
                Specification::from_file(path)?
            }
            None => Specification::bootstrap()?,
        };
        Ok(Self::new(config, Arc::new(spec), credentials))
    }

    pub fn spec(&self) -> &Arc<Specification> {
        &self.spec
    }

    /// Use `key` for RSA key transport instead of generating one at start.
    pub fn with_rsa_key(mut self, key: RsaPrivateKey) -> Self {
        self.rsa_key = Some(Arc::new(key));
        self
    }

    /// Business handlers for logged-in sessions.
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Bind the listener and start accepting.
    #[instrument(skip(self), fields(address = %self.config.server.address))]
    pub fn start(self) -> Result<ServerHandle> {
        let server = &self.config.server;
        let errors: Vec<String> = server
            .validate()
            .into_iter()
            .chain(self.config.transport.validate())
            .collect();
        if !errors.is_empty() {
            return Err(ProtocolError::ConfigError(errors.join("; ")));
        }
        let policy = HandshakePolicy::from_config(server);

        let rsa_key = match self.rsa_key {
            Some(key) => Some(key),
            None if policy.uses_rsa() => {
                info!(bits = server.rsa_key_bits, "Generating RSA key");
                Some(Arc::new(RsaKeyTransport::generate_key(server.rsa_key_bits)?))
            }
            None => None,
        };

        let listener = TcpListener::bind(&server.address)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let mut accept = AcceptOptions::new(policy, Arc::clone(&self.credentials));
        accept.rsa_key = rsa_key;
        accept.timeout = server.connection_timeout;
        accept.poll_interval = self.config.transport.poll_interval;
        accept.compression_level = self.config.transport.compression_level;
        accept.max_payload = self.config.transport.max_payload_size;

        let registry = ConnectionRegistry::new();
        let context = Arc::new(ServerContext {
            spec: self.spec,
            accept,
            credentials: self.credentials,
            dispatcher: self.dispatcher,
            registry: registry.clone(),
            server_name: server.server_name.clone(),
            server_description: server.server_description.clone(),
            start_time: Utc::now(),
            max_connections: server.max_connections,
            open_sockets: AtomicUsize::new(0),
            next_user_id: AtomicU32::new(1),
            running: AtomicBool::new(true),
        });

        let acceptor = {
            let context = Arc::clone(&context);
            thread::Builder::new()
                .name("p7-acceptor".into())
                .spawn(move || accept_loop(listener, context))?
        };

        info!(%local_addr, "Server listening");
        Ok(ServerHandle {
            local_addr,
            context,
            acceptor: Some(acceptor),
            shutdown_timeout: self.config.server.shutdown_timeout,
        })
    }
}

/// One accepted socket held against `max_connections` until dropped.
struct SocketSlot {
    context: Arc<ServerContext>,
}

impl SocketSlot {
    fn claim(context: &Arc<ServerContext>) -> Option<Self> {
        context
            .open_sockets
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |open| {
                (open < context.max_connections).then_some(open + 1)
            })
            .ok()?;
        Some(Self {
            context: Arc::clone(context),
        })
    }

    fn serve(self, stream: TcpStream) {
        self.context.serve(stream);
    }
}

impl Drop for SocketSlot {
    fn drop(&mut self) {
        self.context.open_sockets.fetch_sub(1, Ordering::AcqRel);
    }
}

fn accept_loop(listener: TcpListener, context: Arc<ServerContext>) {
    while context.running.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, peer)) => {
                let Some(slot) = SocketSlot::claim(&context) else {
                    warn!(%peer, limit = context.max_connections, "Connection limit reached");
                    continue;
                };
                if let Err(e) = stream.set_nonblocking(false) {
                    warn!(%peer, error = %e, "Could not configure socket");
                    continue;
                }
                debug!(%peer, "Accepted socket");
                let spawned = thread::Builder::new()
                    .name("p7-session".into())
                    .spawn(move || slot.serve(stream));
                if let Err(e) = spawned {
                    error!(error = %e, "Could not spawn session thread");
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(POLL_INTERVAL / 5),
            Err(e) => {
                warn!(error = %e, "Accept failed");
                thread::sleep(POLL_INTERVAL);
            }
        }
    }
    debug!("Acceptor stopped");
}

/// A running server.
pub struct ServerHandle {
    local_addr: SocketAddr,
    context: Arc<ServerContext>,
    acceptor: Option<JoinHandle<()>>,
    shutdown_timeout: Duration,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.context.registry
    }

    /// Accepted sockets, including those still running the handshake.
    pub fn open_connections(&self) -> usize {
        self.context.open_sockets.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.context.running.load(Ordering::Acquire)
    }

    /// Stop accepting and disconnect every session. Waits up to the shutdown timeout for
    /// sessions to unregister.
    pub fn shutdown(&mut self) {
        if !self.context.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(acceptor) = self.acceptor.take() {
            if acceptor.join().is_err() {
                error!("Acceptor thread panicked");
            }
        }
        self.context.registry.disconnect_all();

        let deadline = std::time::Instant::now() + self.shutdown_timeout;
        while !self.context.registry.is_empty() && std::time::Instant::now() < deadline {
            thread::sleep(POLL_INTERVAL / 5);
        }
        info!(remaining = self.context.registry.len(), "Server stopped");
        global_metrics().log_metrics();
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_credentials_store_digest() {
        let store = MemoryCredentials::new();
        store.add_user("guest", "", &["wired.account.file.list_files"]);
        assert_eq!(
            store.password("guest").unwrap(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(store.privileges("guest"), ["wired.account.file.list_files"]);
        assert!(store.password("admin").is_none());
        assert!(store.privileges("admin").is_empty());
        assert!(store.remove_user("guest"));
        assert!(!store.remove_user("guest"));
    }

    #[test]
    fn test_sequence_rules() {
        use SessionState::*;
        assert!(Connected.permits(CLIENT_INFO));
        assert!(Connected.permits(SEND_PING));
        assert!(!Connected.permits(SEND_LOGIN));
        assert!(!Connected.permits(SET_NICK));
        assert!(GaveClientInfo.permits(SET_NICK));
        assert!(GaveClientInfo.permits(SEND_LOGIN));
        assert!(!GaveClientInfo.permits("wired.chat.send_say"));
        assert!(LoggedIn.permits("wired.chat.send_say"));
    }

    #[test]
    fn test_empty_registry() {
        let registry = ConnectionRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.get(1).is_none());
        assert!(registry.logged_in().is_empty());
    }
}
