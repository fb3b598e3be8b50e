//! # P7 Client
//!
//! A logged-in client connection.
//!
//! [`ClientStateMachine`] holds the login sequence as a pure function of incoming
//! messages; [`Connection`] drives it over a [`SecureChannel`], correlates transaction
//! replies and, while interactive, runs a listener thread that hands everything else to
//! registered [`ConnectionObserver`]s.
//!
//! ```text
//! ClientInfo ──server_info──> ClientUser ──3 × okay──> ClientLogin
//!     ──login──> ClientLoggedIn ──privileges──> ClientPrivileges
//! ```

use crate::config::NetworkConfig;
use crate::core::message::Message;
use crate::error::{ProtocolError, Result};
use crate::protocol::key_exchange::password_digest;
use crate::protocol::transaction::{Correlator, Delivery, Outcome};
use crate::service::secure::{ClientOptions, SecureChannel};
use crate::service::server::{
    CLIENT_INFO, ERROR, LOGIN, OKAY, PING, PRIVILEGES, SEND_LOGIN, SEND_PING, SERVER_INFO,
    SET_ICON, SET_NICK, SET_STATUS,
};
use crate::spec::{ErrorDefinition, Specification};
use crate::utils::timeout::deadline_remaining;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

const PRESENCE_ACKS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    ClientInfo,
    ClientUser,
    ClientLogin,
    ClientLoggedIn,
    ClientPrivileges,
}

/// Who we are to the server.
#[derive(Debug, Clone)]
pub struct Identity {
    pub login: String,
    pub password: String,
    pub nick: String,
    pub status: String,
    pub icon: Vec<u8>,
    pub application_name: String,
    pub application_version: String,
}

impl Identity {
    pub fn new(login: &str, password: &str) -> Self {
        Self {
            login: login.to_string(),
            password: password.to_string(),
            nick: String::from("Unnamed"),
            status: String::new(),
            icon: Vec::new(),
            application_name: String::from(env!("CARGO_PKG_NAME")),
            application_version: String::from(env!("CARGO_PKG_VERSION")),
        }
    }

    pub fn from_config(config: &NetworkConfig, login: &str, password: &str) -> Self {
        Self {
            nick: config.client.nick.clone(),
            status: config.client.status.clone(),
            application_name: config.client.application_name.clone(),
            application_version: config.client.application_version.clone(),
            ..Self::new(login, password)
        }
    }
}

/// What the server told us at login.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoginInfo {
    pub user_id: u32,
    /// Privilege fields granted as `true`
    pub privileges: Vec<String>,
    pub server_name: Option<String>,
    pub server_application: Option<String>,
}

impl LoginInfo {
    pub fn has_privilege(&self, field: &str) -> bool {
        self.privileges.iter().any(|p| p == field)
    }
}

/// Side effects requested by [`ClientStateMachine::handle`].
#[derive(Debug)]
pub enum Action {
    Send(Message),
    Connected(LoginInfo),
    LoginFailed(Message),
    Forward(Message),
    ApplicationError(Message),
}

/// Login sequence and steady-state routing, free of I/O.
#[derive(Debug)]
pub struct ClientStateMachine {
    spec: Arc<Specification>,
    identity: Identity,
    state: ClientState,
    acks: u32,
    login: LoginInfo,
}

impl ClientStateMachine {
    pub fn new(spec: Arc<Specification>, identity: Identity) -> Self {
        Self {
            spec,
            identity,
            state: ClientState::ClientInfo,
            acks: 0,
            login: LoginInfo::default(),
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn login_info(&self) -> Option<&LoginInfo> {
        (self.state == ClientState::ClientPrivileges).then_some(&self.login)
    }

    /// The opening `wired.client_info`.
    pub fn start(&self) -> Result<Message> {
        Message::new(&self.spec, CLIENT_INFO)?
            .with(
                "wired.info.application.name",
                self.identity.application_name.as_str(),
            )?
            .with(
                "wired.info.application.version",
                self.identity.application_version.as_str(),
            )?
            .with("wired.info.os.name", std::env::consts::OS)?
            .with("wired.info.arch", std::env::consts::ARCH)
    }

    fn presence(&self) -> Result<Vec<Action>> {
        Ok(vec![
            Action::Send(
                Message::new(&self.spec, SET_NICK)?
                    .with("wired.user.nick", self.identity.nick.as_str())?,
            ),
            Action::Send(
                Message::new(&self.spec, SET_STATUS)?
                    .with("wired.user.status", self.identity.status.as_str())?,
            ),
            Action::Send(
                Message::new(&self.spec, SET_ICON)?
                    .with("wired.user.icon", self.identity.icon.clone())?,
            ),
        ])
    }

    fn send_login(&self) -> Result<Message> {
        Message::new(&self.spec, SEND_LOGIN)?
            .with("wired.user.login", self.identity.login.as_str())?
            .with("wired.user.password", password_digest(&self.identity.password))
    }

    fn ignore(&self, message: &Message) -> Vec<Action> {
        debug!(state = ?self.state, message = message.name(), "Ignoring message before login");
        Vec::new()
    }

    /// Feed one incoming message that no transaction claimed.
    pub fn handle(&mut self, message: Message) -> Result<Vec<Action>> {
        let name = message.name().to_string();
        match (self.state, name.as_str()) {
            (ClientState::ClientInfo, SERVER_INFO) => {
                self.login.server_name = message.string("wired.info.name").map(str::to_string);
                self.login.server_application = message
                    .string("wired.info.application.name")
                    .map(str::to_string);
                self.state = ClientState::ClientUser;
                self.presence()
            }
            (ClientState::ClientUser, OKAY) => {
                self.acks += 1;
                if self.acks < PRESENCE_ACKS {
                    return Ok(Vec::new());
                }
                self.state = ClientState::ClientLogin;
                Ok(vec![Action::Send(self.send_login()?)])
            }
            (ClientState::ClientLogin, LOGIN) => {
                self.login.user_id = message.uint32("wired.user.id").unwrap_or_default();
                self.state = ClientState::ClientLoggedIn;
                Ok(Vec::new())
            }
            (ClientState::ClientLogin, ERROR) => Ok(vec![Action::LoginFailed(message)]),
            (ClientState::ClientLoggedIn, PRIVILEGES) => {
                self.login.privileges = self
                    .spec
                    .collection(PRIVILEGES)
                    .unwrap_or_default()
                    .iter()
                    .filter(|field| message.bool(field).unwrap_or(false))
                    .cloned()
                    .collect();
                self.state = ClientState::ClientPrivileges;
                Ok(vec![Action::Connected(self.login.clone())])
            }
            (ClientState::ClientPrivileges, SEND_PING) => {
                let mut ping = Message::new(&self.spec, PING)?;
                if let Some(id) = message.transaction_id() {
                    ping.set_transaction_id(id)?;
                }
                Ok(vec![Action::Send(ping)])
            }
            (ClientState::ClientPrivileges, ERROR) => Ok(vec![Action::ApplicationError(message)]),
            (ClientState::ClientPrivileges, _) => Ok(vec![Action::Forward(message)]),
            _ => Ok(self.ignore(&message)),
        }
    }
}

/// Receives connection events. Every method has an empty default.
pub trait ConnectionObserver: Send + Sync {
    fn connected(&self, _login: &LoginInfo) {}

    fn disconnected(&self, _error: Option<&ProtocolError>) {}

    fn message_received(&self, _message: &Message) {}

    fn error_received(&self, _message: &Message, _error: Option<&ErrorDefinition>) {}
}

/// Everything needed to open a [`Connection`].
#[derive(Clone)]
pub struct ConnectOptions {
    pub address: String,
    pub channel: ClientOptions,
    pub identity: Identity,
    pub response_timeout: Duration,
    /// Spawn a listener thread after login
    pub interactive: bool,
    pub observers: Vec<Arc<dyn ConnectionObserver>>,
}

impl ConnectOptions {
    pub fn new(address: &str, login: &str, password: &str) -> Self {
        Self {
            address: address.to_string(),
            channel: ClientOptions::new(login, password),
            identity: Identity::new(login, password),
            response_timeout: crate::utils::timeout::RESPONSE_TIMEOUT,
            interactive: true,
            observers: Vec::new(),
        }
    }

    pub fn from_config(config: &NetworkConfig, login: &str, password: &str) -> Self {
        Self {
            address: config.client.address.clone(),
            channel: ClientOptions::from_config(config, login, password),
            identity: Identity::from_config(config, login, password),
            response_timeout: config.client.response_timeout,
            interactive: true,
            observers: Vec::new(),
        }
    }

    pub fn observer(mut self, observer: Arc<dyn ConnectionObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn interactive(mut self, interactive: bool) -> Self {
        self.interactive = interactive;
        self
    }
}

struct Inner {
    channel: SecureChannel,
    correlator: Correlator,
    machine: Mutex<ClientStateMachine>,
    observers: RwLock<Vec<Arc<dyn ConnectionObserver>>>,
    login: Mutex<Option<LoginInfo>>,
    closed: AtomicBool,
}

impl Inner {
    fn observers(&self) -> Vec<Arc<dyn ConnectionObserver>> {
        self.observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Read at most one message and route it.
    fn pump_once(&self) -> Result<()> {
        if let Some(message) = self.channel.poll_message()? {
            self.route(message)?;
        }
        Ok(())
    }

    fn route(&self, message: Message) -> Result<()> {
        let message = match self.correlator.receive(message) {
            Delivery::Consumed | Delivery::Orphaned(_) => return Ok(()),
            Delivery::Unmatched(message) => message,
        };
        let actions = self
            .machine
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .handle(message)?;
        self.apply(actions)
    }

    fn apply(&self, actions: Vec<Action>) -> Result<()> {
        for action in actions {
            match action {
                Action::Send(message) => self.channel.write_message(&message)?,
                Action::Connected(login) => {
                    info!(
                        user_id = login.user_id,
                        privileges = login.privileges.len(),
                        "Logged in"
                    );
                    *self.login.lock().unwrap_or_else(PoisonError::into_inner) =
                        Some(login.clone());
                    for observer in self.observers() {
                        observer.connected(&login);
                    }
                }
                Action::LoginFailed(message) => {
                    let reason = self
                        .channel
                        .spec()
                        .error_for_message(&message)
                        .map_or_else(|| message.name().to_string(), |e| e.name.clone());
                    return Err(ProtocolError::LoginFailed(reason));
                }
                Action::Forward(message) => {
                    for observer in self.observers() {
                        observer.message_received(&message);
                    }
                }
                Action::ApplicationError(message) => {
                    let definition = self.channel.spec().error_for_message(&message);
                    for observer in self.observers() {
                        observer.error_received(&message, definition);
                    }
                }
            }
        }
        Ok(())
    }

    fn is_logged_in(&self) -> bool {
        self.login
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Tear down once: close the socket, fail open transactions, tell observers.
    fn close(&self, error: Option<&ProtocolError>) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.channel.disconnect();
        self.correlator.abandon_all();
        for observer in self.observers() {
            observer.disconnected(error);
        }
    }

    fn listen(self: Arc<Self>) {
        debug!("Listener started");
        while self.channel.is_connected() && self.channel.is_interactive() {
            if let Err(e) = self.pump_once() {
                if e.is_fatal() {
                    match e {
                        ProtocolError::ConnectionClosed => self.close(None),
                        ref other => {
                            warn!(error = %other, "Listener stopped");
                            self.close(Some(other));
                        }
                    }
                    break;
                }
                debug!(error = %e, "Ignoring message");
            }
        }
        debug!("Listener stopped");
    }
}

/// A logged-in client connection.
pub struct Connection {
    inner: Arc<Inner>,
    listener: Mutex<Option<JoinHandle<()>>>,
    response_timeout: Duration,
}

impl Connection {
    /// Connect, run the secure handshake and log in.
    #[instrument(
        skip(spec, options),
        fields(address = %options.address, user = %options.identity.login)
    )]
    pub fn connect(spec: Arc<Specification>, options: ConnectOptions) -> Result<Self> {
        let deadline = Instant::now() + options.channel.timeout;
        let channel =
            SecureChannel::connect(&options.address, Arc::clone(&spec), &options.channel)?;
        let machine = ClientStateMachine::new(spec, options.identity);
        let opening = machine.start()?;

        let inner = Arc::new(Inner {
            channel,
            correlator: Correlator::new(),
            machine: Mutex::new(machine),
            observers: RwLock::new(Vec::new()),
            login: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        let login = (|| -> Result<()> {
            inner.channel.write_message(&opening)?;
            while !inner.is_logged_in() {
                deadline_remaining(deadline)?;
                inner.pump_once()?;
            }
            Ok(())
        })();
        if let Err(e) = login {
            inner.closed.store(true, Ordering::Release);
            inner.channel.disconnect();
            return Err(e);
        }

        *inner
            .observers
            .write()
            .unwrap_or_else(PoisonError::into_inner) = options.observers;
        if let Some(login) = inner
            .login
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        {
            for observer in inner.observers() {
                observer.connected(&login);
            }
        }

        let connection = Self {
            inner,
            listener: Mutex::new(None),
            response_timeout: options.response_timeout,
        };
        connection.set_interactive(options.interactive)?;
        Ok(connection)
    }

    pub fn add_observer(&self, observer: Arc<dyn ConnectionObserver>) {
        self.inner
            .observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    pub fn spec(&self) -> &Arc<Specification> {
        self.inner.channel.spec()
    }

    pub fn channel(&self) -> &SecureChannel {
        &self.inner.channel
    }

    pub fn login_info(&self) -> Option<LoginInfo> {
        self.inner
            .login
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.channel.is_connected()
    }

    /// Send without waiting for replies.
    pub fn send(&self, message: &Message) -> Result<()> {
        self.inner.channel.write_message(message)
    }

    /// Send a transaction request and collect every reply its grammar expects.
    pub fn send_and_collect(&self, mut message: Message) -> Outcome {
        let waiter = self.inner.correlator.begin(&mut message)?;
        self.inner.channel.write_message(&message)?;
        if self.inner.channel.is_interactive() {
            return waiter.wait_all(self.response_timeout);
        }

        // No listener: read on this thread until the transaction completes.
        let deadline = Instant::now() + self.response_timeout;
        while !waiter.is_complete() {
            if deadline_remaining(deadline).is_err() {
                break;
            }
            self.inner.pump_once()?;
        }
        waiter.wait_all(Duration::ZERO)
    }

    /// Send a transaction request and return the reply that completed it.
    pub fn send_and_wait(&self, message: Message) -> Result<Message> {
        self.send_and_collect(message)?.pop().ok_or_else(|| {
            ProtocolError::UnexpectedMessage("transaction completed without replies".into())
        })
    }

    /// Send a transaction request; `callback` runs on the thread that completes it.
    /// Returns the transaction id.
    pub fn send_with_callback<F>(&self, mut message: Message, callback: F) -> Result<u32>
    where
        F: FnOnce(Outcome) + Send + 'static,
    {
        let id = self
            .inner
            .correlator
            .begin_with_callback(&mut message, callback)?;
        if let Err(e) = self.inner.channel.write_message(&message) {
            self.inner.correlator.cancel(id);
            return Err(e);
        }
        Ok(id)
    }

    /// Round trip of `wired.send_ping`.
    pub fn ping(&self) -> Result<Duration> {
        let started = Instant::now();
        self.send_and_wait(Message::new(self.spec(), SEND_PING)?)?;
        Ok(started.elapsed())
    }

    pub fn is_interactive(&self) -> bool {
        self.inner.channel.is_interactive()
    }

    /// Start or stop the listener thread. A non-interactive connection is read only by
    /// explicit calls: transaction waits and out-of-band transfers.
    pub fn set_interactive(&self, interactive: bool) -> Result<()> {
        self.inner.channel.set_interactive(interactive);
        let mut listener = self.listener.lock().unwrap_or_else(PoisonError::into_inner);
        if interactive {
            if listener.is_none() {
                let inner = Arc::clone(&self.inner);
                *listener = Some(
                    thread::Builder::new()
                        .name("p7-listener".into())
                        .spawn(move || inner.listen())?,
                );
            }
        } else if let Some(handle) = listener.take() {
            // Exits within one poll interval.
            join_listener(handle);
        }
        Ok(())
    }

    /// Write raw bytes on the connection.
    pub fn write_oob(&self, data: &[u8]) -> Result<()> {
        self.inner.channel.write_oob(data)
    }

    /// Read raw bytes. Only meaningful on a non-interactive connection.
    pub fn read_oob(&self, timeout: Duration) -> Result<Vec<u8>> {
        if self.is_interactive() {
            return Err(ProtocolError::Custom(
                "out-of-band reads require a non-interactive connection".into(),
            ));
        }
        self.inner.channel.read_oob(timeout)
    }

    /// Close the connection. May be called from an observer callback.
    pub fn disconnect(&self) {
        self.inner.close(None);
        let handle = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            join_listener(handle);
        }
    }
}

/// Wait for the listener to exit, unless we are the listener: observers run on its thread
/// and may stop or drop the connection from there. It then exits on its own.
fn join_listener(handle: JoinHandle<()>) {
    if handle.thread().id() == thread::current().id() {
        debug!("Listener stopping from its own thread");
        return;
    }
    if handle.join().is_err() {
        warn!("Listener thread panicked");
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    const APP: &str = include_str!("../../specs/wired.xml");

    fn machine() -> ClientStateMachine {
        let spec = Arc::new(Specification::from_xml(APP).unwrap());
        ClientStateMachine::new(spec, Identity::new("guest", ""))
    }

    fn incoming(machine: &ClientStateMachine, name: &str) -> Message {
        Message::new(&machine.spec, name).unwrap()
    }

    fn sent(actions: &[Action]) -> Vec<&str> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Send(m) => Some(m.name()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_client_info_waits_for_server_info() {
        let mut machine = machine();
        assert_eq!(machine.start().unwrap().name(), CLIENT_INFO);

        let okay = incoming(&machine, OKAY);
        assert!(machine.handle(okay).unwrap().is_empty());
        assert_eq!(machine.state(), ClientState::ClientInfo);

        let info = incoming(&machine, SERVER_INFO)
            .with("wired.info.name", "Test Server")
            .unwrap();
        let actions = machine.handle(info).unwrap();
        assert_eq!(sent(&actions), [SET_NICK, SET_STATUS, SET_ICON]);
        assert_eq!(machine.state(), ClientState::ClientUser);
    }

    #[test]
    fn test_login_after_three_acknowledgements() {
        let mut machine = machine();
        machine.handle(incoming(&machine, SERVER_INFO)).unwrap();

        for _ in 0..2 {
            assert!(machine.handle(incoming(&machine, OKAY)).unwrap().is_empty());
        }
        let actions = machine.handle(incoming(&machine, OKAY)).unwrap();
        assert_eq!(sent(&actions), [SEND_LOGIN]);
        match &actions[0] {
            Action::Send(login) => assert_eq!(
                login.string("wired.user.password"),
                Some("e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855")
            ),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(machine.state(), ClientState::ClientLogin);
    }

    #[test]
    fn test_privileges_connect_exactly_once() {
        let mut machine = machine();
        machine.handle(incoming(&machine, SERVER_INFO)).unwrap();
        for _ in 0..PRESENCE_ACKS {
            machine.handle(incoming(&machine, OKAY)).unwrap();
        }
        let login = incoming(&machine, LOGIN).with("wired.user.id", 7u32).unwrap();
        machine.handle(login).unwrap();
        assert_eq!(machine.state(), ClientState::ClientLoggedIn);

        let privileges = incoming(&machine, PRIVILEGES)
            .with("wired.account.file.list_files", true)
            .unwrap()
            .with("wired.account.user.kick_users", false)
            .unwrap();
        let actions = machine.handle(privileges.clone()).unwrap();
        match actions.as_slice() {
            [Action::Connected(info)] => {
                assert_eq!(info.user_id, 7);
                assert!(info.has_privilege("wired.account.file.list_files"));
                assert!(!info.has_privilege("wired.account.user.kick_users"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(machine.state(), ClientState::ClientPrivileges);

        // A second privileges message is ordinary traffic now.
        let again = machine.handle(privileges).unwrap();
        assert!(matches!(again.as_slice(), [Action::Forward(_)]));
    }

    #[test]
    fn test_login_error_fails() {
        let mut machine = machine();
        machine.handle(incoming(&machine, SERVER_INFO)).unwrap();
        for _ in 0..PRESENCE_ACKS {
            machine.handle(incoming(&machine, OKAY)).unwrap();
        }
        let mut error = incoming(&machine, ERROR);
        error.set_enum("wired.error", "wired.error.login_failed").unwrap();
        let actions = machine.handle(error).unwrap();
        assert!(matches!(actions.as_slice(), [Action::LoginFailed(_)]));
    }

    #[test]
    fn test_ping_echoes_transaction() {
        let mut machine = machine();
        machine.state = ClientState::ClientPrivileges;
        let mut ping = incoming(&machine, SEND_PING);
        ping.set_transaction_id(42).unwrap();
        match machine.handle(ping).unwrap().as_slice() {
            [Action::Send(reply)] => {
                assert_eq!(reply.name(), PING);
                assert_eq!(reply.transaction_id(), Some(42));
            }
            other => panic!("unexpected {other:?}"),
        }

        let mut error = incoming(&machine, ERROR);
        error.set_enum("wired.error", "wired.error.permission_denied").unwrap();
        assert!(matches!(
            machine.handle(error).unwrap().as_slice(),
            [Action::ApplicationError(_)]
        ));
    }
}
