//! # Secure Channel
//!
//! A framed P7 connection over a blocking `TcpStream`, established by running the
//! transport handshake, the optional key exchange and the optional compatibility check.
//!
//! The reader and writer halves each own a clone of the socket and their own
//! [`FrameCodec`], each behind its own mutex, so one thread can block in a read while
//! others write. Reads are bounded by a poll interval and re-check the connection state
//! between attempts. Writes are bounded by the connection timeout.
//!
//! ```text
//! connect()/accept()
//!   ├─ transport handshake          (plain frames)
//!   ├─ compression + checksum on
//!   ├─ key exchange + proofs        (if a cipher suite was negotiated)
//!   ├─ encryption on
//!   └─ compatibility check(s)       (if either side asked)
//! ```

use crate::config::{NetworkConfig, MAX_PAYLOAD_SIZE};
use crate::core::codec::MessageCodec;
use crate::core::frame::FrameCodec;
use crate::core::message::Message;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::handshake::{self, HandshakePolicy, NegotiatedParams, PeerInfo};
use crate::protocol::key_exchange::{self, ClientKey};
use crate::service::server::CredentialStore;
use crate::spec::Specification;
use crate::utils::compression;
use crate::utils::crypto::SessionCipher;
use crate::utils::metrics::{global_metrics, Timer};
use crate::utils::timeout::{self, deadline_remaining};
use bytes::BytesMut;
use rsa::RsaPrivateKey;
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, info, instrument, warn};

const READ_CHUNK: usize = 8192;

/// Client side connection parameters.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub username: String,
    pub password: String,
    pub proposal: NegotiatedParams,
    /// Budget for TCP connect plus the whole handshake, and the bound on every write
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub compression_level: u32,
    pub max_payload: usize,
}

impl ClientOptions {
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
            proposal: NegotiatedParams::default(),
            timeout: timeout::DEFAULT_TIMEOUT,
            poll_interval: timeout::POLL_INTERVAL,
            compression_level: compression::DEFAULT_LEVEL,
            max_payload: MAX_PAYLOAD_SIZE,
        }
    }

    pub fn from_config(config: &NetworkConfig, username: &str, password: &str) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
            proposal: NegotiatedParams::from_client_config(&config.client),
            timeout: config.client.connection_timeout,
            poll_interval: config.transport.poll_interval,
            compression_level: config.transport.compression_level,
            max_payload: config.transport.max_payload_size,
        }
    }

    pub fn with_proposal(mut self, proposal: NegotiatedParams) -> Self {
        self.proposal = proposal;
        self
    }
}

/// Server side handshake parameters, shared by every accepted connection.
#[derive(Clone)]
pub struct AcceptOptions {
    pub policy: HandshakePolicy,
    pub rsa_key: Option<Arc<RsaPrivateKey>>,
    pub credentials: Arc<dyn CredentialStore>,
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub compression_level: u32,
    pub max_payload: usize,
}

impl AcceptOptions {
    pub fn new(policy: HandshakePolicy, credentials: Arc<dyn CredentialStore>) -> Self {
        Self {
            policy,
            rsa_key: None,
            credentials,
            timeout: timeout::DEFAULT_TIMEOUT,
            poll_interval: timeout::POLL_INTERVAL,
            compression_level: compression::DEFAULT_LEVEL,
            max_payload: MAX_PAYLOAD_SIZE,
        }
    }
}

/// What the handshake established.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub peer: PeerInfo,
    pub params: NegotiatedParams,
    /// User authenticated by the key exchange, when one ran
    pub username: Option<String>,
    pub peer_addr: SocketAddr,
}

struct ReadHalf {
    stream: TcpStream,
    frames: FrameCodec,
    buffer: BytesMut,
}

impl ReadHalf {
    /// One read attempt bounded by the socket read timeout.
    fn poll_frame(&mut self) -> Result<Option<Vec<u8>>> {
        if let Some(frame) = self.frames.decode(&mut self.buffer)? {
            return Ok(Some(frame));
        }
        let mut chunk = [0u8; READ_CHUNK];
        match self.stream.read(&mut chunk) {
            Ok(0) => Err(ProtocolError::ConnectionClosed),
            Ok(n) => {
                self.buffer.extend_from_slice(&chunk[..n]);
                self.frames.decode(&mut self.buffer)
            }
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                ) =>
            {
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

struct WriteHalf {
    stream: TcpStream,
    frames: FrameCodec,
}

impl WriteHalf {
    fn write_frame(&mut self, plain: &[u8]) -> Result<usize> {
        let mut buf = BytesMut::with_capacity(self.frames.frame_len(plain.len()));
        self.frames.encode(plain, &mut buf)?;
        self.stream.write_all(&buf)?;
        self.stream.flush()?;
        Ok(buf.len())
    }
}

/// Reads wake every `poll_interval`; a write blocked past `write_timeout` fails.
fn split(
    stream: TcpStream,
    poll_interval: Duration,
    write_timeout: Duration,
    max_payload: usize,
) -> Result<(ReadHalf, WriteHalf, TcpStream)> {
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(poll_interval))?;
    stream.set_write_timeout(Some(write_timeout))?;
    let reader = ReadHalf {
        stream: stream.try_clone()?,
        frames: FrameCodec::new(max_payload),
        buffer: BytesMut::with_capacity(READ_CHUNK),
    };
    let writer = WriteHalf {
        stream: stream.try_clone()?,
        frames: FrameCodec::new(max_payload),
    };
    Ok((reader, writer, stream))
}

/// Both halves, owned exclusively while the handshake runs.
struct Handshake<'a> {
    spec: &'a Arc<Specification>,
    codec: &'a MessageCodec,
    reader: &'a mut ReadHalf,
    writer: &'a mut WriteHalf,
    deadline: Instant,
}

impl Handshake<'_> {
    fn send(&mut self, message: &Message) -> Result<()> {
        let bytes = self.codec.encode(message)?;
        self.writer.write_frame(&bytes)?;
        debug!(message = message.name(), "Sent handshake message");
        Ok(())
    }

    fn receive(&mut self) -> Result<Message> {
        loop {
            deadline_remaining(self.deadline)?;
            if let Some(frame) = self.reader.poll_frame()? {
                let message = self.codec.decode(&frame)?;
                debug!(message = message.name(), "Received handshake message");
                return Ok(message);
            }
        }
    }

    fn activate_frame_options(&mut self, params: &NegotiatedParams, level: u32) {
        for frames in [&mut self.reader.frames, &mut self.writer.frames] {
            frames.set_compression(params.compression, level);
            frames.set_checksum(params.checksum);
        }
    }

    fn activate_cipher(&mut self, cipher: SessionCipher) {
        let cipher = Arc::new(cipher);
        self.reader.frames.set_cipher(Arc::clone(&cipher));
        self.writer.frames.set_cipher(cipher);
    }

    /// Send our document, fail unless the peer accepts it.
    fn offer_specification(&mut self) -> Result<()> {
        self.send(&handshake::compatibility_specification(self.spec)?)?;
        let status = self.receive()?;
        handshake::check_compatibility_status(&status)
    }

    /// Judge the peer's document and report the verdict.
    fn judge_specification(&mut self) -> Result<()> {
        let document = self.receive()?;
        let (compatible, status) = handshake::evaluate_compatibility(self.spec, &document)?;
        self.send(&status)?;
        if compatible {
            Ok(())
        } else {
            Err(ProtocolError::IncompatibleProtocol(format!(
                "peer document is not compatible with {} {}",
                self.spec.protocol_name(),
                self.spec.protocol_version()
            )))
        }
    }

    #[instrument(skip_all, fields(user = %options.username))]
    fn run_client(&mut self, options: &ClientOptions) -> Result<(PeerInfo, NegotiatedParams)> {
        self.send(&handshake::client_handshake(self.spec, &options.proposal)?)?;
        let reply = self.receive()?;
        let (peer, params, server_wants_check) = handshake::client_accept(self.spec, &reply)?;

        let client_wants_check = self
            .spec
            .needs_compatibility_check(&peer.protocol_name, &peer.protocol_version);
        self.send(&handshake::acknowledge(self.spec, client_wants_check)?)?;
        self.activate_frame_options(&params, options.compression_level);

        if let Some(symmetric) = params.cipher.symmetric() {
            let server_key = self.receive()?;
            let server_public = key_exchange::read_server_key(&server_key)?;

            let digest = key_exchange::password_digest(&options.password);
            let proof1 = key_exchange::client_proof(params.checksum, &digest, &server_public);
            let mut exchange = key_exchange::client_key_exchange(params.cipher)?;
            let (client_key, cipher) = exchange.seal_client_key(
                self.spec,
                &server_public,
                symmetric,
                &options.username,
                &proof1,
            )?;
            self.send(&client_key)?;

            let answer = self.receive()?;
            match answer.name() {
                key_exchange::ACKNOWLEDGE => {
                    let proof2 = key_exchange::read_acknowledge(&answer, &cipher)?;
                    let expected =
                        key_exchange::server_proof(params.checksum, &digest, &server_public);
                    if !key_exchange::verify_proof(&expected, &proof2) {
                        return Err(ProtocolError::AuthenticationFailed(
                            constants::ERR_PROOF_MISMATCH.into(),
                        ));
                    }
                }
                key_exchange::AUTHENTICATION_ERROR => {
                    return Err(ProtocolError::AuthenticationFailed(
                        constants::ERR_SERVER_REJECTED.into(),
                    ));
                }
                other => {
                    return Err(ProtocolError::UnexpectedMessage(format!(
                        "expected {}, got {other}",
                        key_exchange::ACKNOWLEDGE
                    )));
                }
            }
            self.activate_cipher(cipher);
            debug!(kind = ?exchange.kind(), "Key exchange complete");
        }

        if server_wants_check {
            self.offer_specification()?;
        }
        if client_wants_check {
            self.judge_specification()?;
        }
        Ok((peer, params))
    }

    #[instrument(skip_all)]
    fn run_server(
        &mut self,
        options: &AcceptOptions,
    ) -> Result<(PeerInfo, NegotiatedParams, Option<String>)> {
        let request = self.receive()?;
        let (peer, params, reply) =
            handshake::server_negotiate(self.spec, &options.policy, &request)?;
        self.send(&reply)?;
        handshake::check_version(self.spec, &peer)?;
        let server_wants_check = self
            .spec
            .needs_compatibility_check(&peer.protocol_name, &peer.protocol_version);

        let client_wants_check = handshake::acknowledge_wants_check(&self.receive()?)?;
        self.activate_frame_options(&params, options.compression_level);

        let mut username = None;
        if let Some(symmetric) = params.cipher.symmetric() {
            let mut exchange =
                key_exchange::server_key_exchange(params.cipher, options.rsa_key.as_ref())?;
            let server_public = exchange.server_public_key()?;
            self.send(&key_exchange::server_key_message(self.spec, &server_public)?)?;

            let opened = exchange.open_client_key(&self.receive()?, symmetric)?;
            let digest = match self.authenticate(options, &opened, params, &server_public) {
                Ok(digest) => digest,
                Err(e) => {
                    self.send(&key_exchange::authentication_error_message(self.spec)?)?;
                    return Err(e);
                }
            };

            let proof2 = key_exchange::server_proof(params.checksum, &digest, &server_public);
            self.send(&key_exchange::acknowledge_message(
                self.spec,
                &opened.cipher,
                &proof2,
            )?)?;
            username = Some(opened.username);
            self.activate_cipher(opened.cipher);
            debug!(kind = ?exchange.kind(), "Key exchange complete");
        }

        if server_wants_check {
            self.judge_specification()?;
        }
        if client_wants_check {
            self.offer_specification()?;
        }
        Ok((peer, params, username))
    }

    /// Check proof1 against the stored digest and return that digest.
    fn authenticate(
        &self,
        options: &AcceptOptions,
        opened: &ClientKey,
        params: NegotiatedParams,
        server_public: &[u8],
    ) -> Result<String> {
        let digest = options.credentials.password(&opened.username).ok_or_else(|| {
            warn!(user = %opened.username, "Key exchange for unknown user");
            ProtocolError::AuthenticationFailed(constants::ERR_UNKNOWN_USER.into())
        })?;
        let expected = key_exchange::client_proof(params.checksum, &digest, server_public);
        if key_exchange::verify_proof(&expected, &opened.proof) {
            Ok(digest)
        } else {
            warn!(user = %opened.username, "Password proof mismatch");
            Err(ProtocolError::AuthenticationFailed(
                constants::ERR_PROOF_MISMATCH.into(),
            ))
        }
    }
}

/// An established connection.
pub struct SecureChannel {
    codec: MessageCodec,
    reader: Mutex<ReadHalf>,
    writer: Mutex<WriteHalf>,
    control: TcpStream,
    session: SessionInfo,
    poll_interval: Duration,
    connected: AtomicBool,
    interactive: AtomicBool,
}

fn handshake_outcome<T>(result: Result<T>) -> Result<T> {
    let metrics = global_metrics();
    match &result {
        Ok(_) => {
            metrics.handshake_success();
            metrics.connection_established();
        }
        Err(e) => {
            metrics.handshake_failed();
            warn!(error = %e, "Handshake failed");
        }
    }
    result
}

impl SecureChannel {
    /// Connect to `addr` and run the client side of the handshake.
    #[instrument(skip(spec, options))]
    pub fn connect(addr: &str, spec: Arc<Specification>, options: &ClientOptions) -> Result<Self> {
        let socket_addr = addr.to_socket_addrs()?.next().ok_or_else(|| {
            ProtocolError::ConfigError(format!("address {addr} did not resolve"))
        })?;
        let stream = TcpStream::connect_timeout(&socket_addr, options.timeout)?;
        Self::client(stream, spec, options)
    }

    /// Run the client side of the handshake on an already connected stream.
    pub fn client(
        stream: TcpStream,
        spec: Arc<Specification>,
        options: &ClientOptions,
    ) -> Result<Self> {
        let _timer = Timer::start("client_handshake");
        global_metrics().handshake_attempt();
        let deadline = Instant::now() + options.timeout;
        let peer_addr = stream.peer_addr()?;
        let codec = MessageCodec::new(Arc::clone(&spec));
        let (mut reader, mut writer, control) =
            split(stream, options.poll_interval, options.timeout, options.max_payload)?;

        let (peer, params) = handshake_outcome(
            Handshake {
                spec: &spec,
                codec: &codec,
                reader: &mut reader,
                writer: &mut writer,
                deadline,
            }
            .run_client(options),
        )?;

        info!(%peer_addr, protocol = %peer.protocol_name, ?params, "Connected");
        Ok(Self::established(
            codec,
            reader,
            writer,
            control,
            SessionInfo {
                peer,
                params,
                username: Some(options.username.clone()),
                peer_addr,
            },
            options.poll_interval,
        ))
    }

    /// Run the server side of the handshake on an accepted stream.
    pub fn accept(
        stream: TcpStream,
        spec: Arc<Specification>,
        options: &AcceptOptions,
    ) -> Result<Self> {
        let _timer = Timer::start("server_handshake");
        global_metrics().handshake_attempt();
        let deadline = Instant::now() + options.timeout;
        let peer_addr = stream.peer_addr()?;
        let codec = MessageCodec::new(Arc::clone(&spec));
        let (mut reader, mut writer, control) =
            split(stream, options.poll_interval, options.timeout, options.max_payload)?;

        let outcome = handshake_outcome(
            Handshake {
                spec: &spec,
                codec: &codec,
                reader: &mut reader,
                writer: &mut writer,
                deadline,
            }
            .run_server(options),
        );
        let (peer, params, username) = match outcome {
            Ok(established) => established,
            Err(e) => {
                let _ = control.shutdown(Shutdown::Both);
                return Err(e);
            }
        };

        info!(%peer_addr, client = %peer.protocol_name, ?params, "Accepted");
        Ok(Self::established(
            codec,
            reader,
            writer,
            control,
            SessionInfo {
                peer,
                params,
                username,
                peer_addr,
            },
            options.poll_interval,
        ))
    }

    fn established(
        codec: MessageCodec,
        reader: ReadHalf,
        writer: WriteHalf,
        control: TcpStream,
        session: SessionInfo,
        poll_interval: Duration,
    ) -> Self {
        Self {
            codec,
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            control,
            session,
            poll_interval,
            connected: AtomicBool::new(true),
            interactive: AtomicBool::new(true),
        }
    }

    pub fn spec(&self) -> &Arc<Specification> {
        self.codec.spec()
    }

    pub fn session(&self) -> &SessionInfo {
        &self.session
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Whether messages on this channel are dispatched. A non-interactive channel is
    /// left to its owner for out-of-band transfers and is skipped by broadcasts.
    pub fn is_interactive(&self) -> bool {
        self.interactive.load(Ordering::Acquire)
    }

    pub fn set_interactive(&self, interactive: bool) {
        self.interactive.store(interactive, Ordering::Release);
        debug!(interactive, peer = %self.session.peer_addr, "Interactive flag changed");
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(ProtocolError::ConnectionClosed)
        }
    }

    fn write_frame(&self, plain: &[u8]) -> Result<()> {
        self.ensure_connected()?;
        let written = {
            let mut writer = self
                .writer
                .lock()
                .map_err(|_| ProtocolError::Custom(constants::ERR_LOCK_POISONED.into()))?;
            writer.write_frame(plain)
        };
        match written {
            Ok(bytes) => {
                global_metrics().message_sent(bytes as u64);
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    fn poll_frame(&self) -> Result<Option<Vec<u8>>> {
        self.ensure_connected()?;
        let polled = {
            let mut reader = self
                .reader
                .lock()
                .map_err(|_| ProtocolError::Custom(constants::ERR_LOCK_POISONED.into()))?;
            reader.poll_frame()
        };
        match polled {
            Ok(Some(frame)) => {
                global_metrics().message_received(frame.len() as u64);
                Ok(Some(frame))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Tear the channel down on fatal errors and hand the error back.
    fn fail(&self, error: ProtocolError) -> ProtocolError {
        if error.is_fatal() {
            if !matches!(error, ProtocolError::ConnectionClosed) {
                global_metrics().connection_error();
            }
            self.disconnect();
        }
        error
    }

    /// Encode and send one message. Safe to call from any thread.
    pub fn write_message(&self, message: &Message) -> Result<()> {
        let bytes = self.codec.encode(message)?;
        self.write_frame(&bytes)?;
        debug!(message = message.name(), "Sent message");
        Ok(())
    }

    /// One bounded read attempt. `Ok(None)` when no complete message arrived within the
    /// poll interval.
    pub fn poll_message(&self) -> Result<Option<Message>> {
        match self.poll_frame()? {
            Some(frame) => {
                let message = self.codec.decode(&frame).map_err(|e| self.fail(e))?;
                debug!(message = message.name(), "Received message");
                Ok(Some(message))
            }
            None => Ok(None),
        }
    }

    /// Block until a message arrives, the channel closes or `timeout` passes.
    pub fn read_message(&self, timeout: Duration) -> Result<Message> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(message) = self.poll_message()? {
                return Ok(message);
            }
            deadline_remaining(deadline)?;
        }
    }

    /// Send raw bytes through the frame pipeline without the message codec.
    pub fn write_oob(&self, data: &[u8]) -> Result<()> {
        self.write_frame(data)?;
        debug!(bytes = data.len(), "Sent out-of-band data");
        Ok(())
    }

    /// Read one raw frame written by [`SecureChannel::write_oob`].
    pub fn read_oob(&self, timeout: Duration) -> Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(frame) = self.poll_frame()? {
                debug!(bytes = frame.len(), "Received out-of-band data");
                return Ok(frame);
            }
            deadline_remaining(deadline)?;
        }
    }

    /// Close the socket. Idempotent; blocked readers return `ConnectionClosed`.
    pub fn disconnect(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            let _ = self.control.shutdown(Shutdown::Both);
            global_metrics().connection_closed();
            info!(peer = %self.session.peer_addr, "Disconnected");
        }
    }
}

impl Drop for SecureChannel {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl std::fmt::Debug for SecureChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureChannel")
            .field("session", &self.session)
            .field("connected", &self.is_connected())
            .field("interactive", &self.is_interactive())
            .finish_non_exhaustive()
    }
}
