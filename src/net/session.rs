//! Session module
//!
//! A [`Session`] owns one logical endpoint: either a single outbound
//! connection (client) or a bound socket with any number of accepted peers
//! (server). It drives a [`Transport`] from `poll`, reassembles frames per
//! connection and hands each complete frame to the registered callbacks,
//! synchronously and in arrival order.
//!
//! Callbacks receive `&mut Session` and may send, broadcast, disconnect,
//! replace handlers or close the session. A close requested from inside a
//! callback is deferred until the enclosing `poll` returns. Closing drops
//! the handlers along with everything else.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use crate::config::SessionConfig;
use crate::error::{PollnetError, Result, SessionError, TransportError};
use crate::net::address::{AddressSpec, Protocol, Protocols, Role};
use crate::net::buffer::ReceiveBuffer;
use crate::net::callbacks::CallbackRegistry;
use crate::net::codec::{DataType, Decoded, Frame, FrameCodec};
use crate::net::interfaces;
use crate::net::transport::{ConnectionId, SocketTransport, Transport, TransportEvent};

/// Text used for an address that cannot be resolved
pub const EMPTY_ADDRESS: &str = "(EMPTY)";

/// Option selecting the frame representation
pub const OPTION_DATA_TYPE: &str = "data_type";

/// Read-only option filled by `open` with the local interface list
pub const OPTION_INTERFACES: &str = "interfaces";

/// Poll timeout used while waiting in `establish`
const ESTABLISH_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Connection progress of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Not open, closed, or the connection went away
    Idle,
    /// Outbound stream connection in progress
    Connecting,
    /// Bound, or connected to the remote end
    Ready,
    /// Outbound connection failed
    Failed,
}

impl SessionState {
    /// State name for logs
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Idle => "Idle",
            SessionState::Connecting => "Connecting",
            SessionState::Ready => "Ready",
            SessionState::Failed => "Failed",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A connection with its reassembly buffer
struct Connection {
    conn: ConnectionId,
    address: String,
    buffer: ReceiveBuffer,
    /// Last time bytes arrived, used to forget idle UDP peers
    last_seen: Instant,
}

impl Connection {
    fn new(conn: ConnectionId, address: String) -> Self {
        Self {
            conn,
            address,
            buffer: ReceiveBuffer::new(),
            last_seen: Instant::now(),
        }
    }
}

/// Callback-driven network session
pub struct Session<T: Transport = SocketTransport> {
    transport: T,
    config: SessionConfig,
    callbacks: CallbackRegistry<T>,
    options: BTreeMap<String, String>,

    state: SessionState,
    opened: bool,
    teardown_requested: bool,
    polling: bool,
    was_bound: bool,
    is_bound: bool,

    address: Option<AddressSpec>,
    protocols: Protocols,
    protocol: Option<Protocol>,
    codec: FrameCodec,

    listener: Option<ConnectionId>,
    outbound: Option<Connection>,
    /// Accepted peers in accept order
    connections: Vec<Connection>,
    /// Connection whose event is being dispatched
    polling_conn: Option<ConnectionId>,
}

impl Session<SocketTransport> {
    /// Create a session over operating system sockets with default settings
    pub fn new() -> Result<Self> {
        Self::with_config(SessionConfig::default())
    }

    /// Create a session over operating system sockets.
    ///
    /// Fails if `config` does not validate or the runtime cannot start.
    pub fn with_config(config: SessionConfig) -> Result<Self> {
        let transport = SocketTransport::new()?.with_read_chunk_size(config.read_chunk_size);
        Self::with_transport(transport, config)
    }
}

impl<T: Transport> Session<T> {
    /// Create a session over any transport. Fails if `config` does not
    /// validate.
    pub fn with_transport(transport: T, config: SessionConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| PollnetError::Config(e.to_string()))?;
        let codec = FrameCodec::new(config.data_type, config.max_frame_size);
        Ok(Self {
            transport,
            config,
            callbacks: CallbackRegistry::new(),
            options: BTreeMap::new(),
            state: SessionState::Idle,
            opened: false,
            teardown_requested: false,
            polling: false,
            was_bound: false,
            is_bound: false,
            address: None,
            protocols: Protocols::empty(),
            protocol: None,
            codec,
            listener: None,
            outbound: None,
            connections: Vec::new(),
            polling_conn: None,
        })
    }

    // ---- Lifecycle ----

    /// Open the session on `address`, restricted to `protocols`.
    ///
    /// Binding succeeds or fails here. A stream connection is only started;
    /// its outcome arrives through `poll` (see [`Session::establish`]).
    pub fn open(&mut self, address: &str, protocols: Protocols) -> Result<Role> {
        if self.opened {
            return Err(SessionError::AlreadyOpen.into());
        }

        self.options.insert(
            OPTION_INTERFACES.to_string(),
            interfaces::interfaces_json(),
        );

        let spec = AddressSpec::parse(address, protocols)?;

        let data_type = match self.options.get(OPTION_DATA_TYPE) {
            Some(name) => DataType::from_name(name).unwrap_or_else(|| {
                warn!(value = %name, "Unknown data type option, using default");
                self.config.data_type
            }),
            None => self.config.data_type,
        };
        self.codec = FrameCodec::new(data_type, self.config.max_frame_size);

        let authority = spec.authority();
        match spec.role {
            Role::Bind => {
                let listener = self.transport.bind(spec.protocol, &authority)?;
                self.listener = Some(listener);
                self.is_bound = true;
                self.was_bound = true;
                self.state = SessionState::Ready;
            }
            Role::Connect => {
                let conn = self.transport.connect(spec.protocol, &spec.target())?;
                self.outbound = Some(Connection::new(conn, authority));
                self.is_bound = false;
                self.was_bound = false;
                self.state = if spec.protocol.is_connection_oriented() {
                    SessionState::Connecting
                } else {
                    SessionState::Ready
                };
            }
        }

        self.opened = true;
        self.teardown_requested = false;
        self.protocols = spec.protocols;
        self.protocol = Some(spec.protocol);

        info!(address = %spec, data_type = %data_type, state = %self.state, "Session opened");
        let role = spec.role;
        self.address = Some(spec);
        Ok(role)
    }

    /// Close the session, releasing every socket and dropping the options
    /// and callbacks.
    ///
    /// Returns `false` if it was not open. From inside a callback the
    /// teardown happens when the enclosing `poll` returns.
    pub fn close(&mut self) -> bool {
        if !self.opened || self.teardown_requested {
            return false;
        }
        if self.polling {
            debug!("Close requested during poll, deferring");
            self.teardown_requested = true;
            return true;
        }
        self.teardown();
        true
    }

    fn teardown(&mut self) {
        for connection in self.connections.drain(..) {
            self.transport.close(connection.conn);
        }
        if let Some(connection) = self.outbound.take() {
            self.transport.close(connection.conn);
        }
        if let Some(listener) = self.listener.take() {
            self.transport.close(listener);
        }
        self.transport.reset();

        self.callbacks.clear();
        self.options.clear();
        self.codec = FrameCodec::new(self.config.data_type, self.config.max_frame_size);
        self.state = SessionState::Idle;
        self.opened = false;
        self.teardown_requested = false;
        self.is_bound = false;
        self.polling_conn = None;
        self.protocols = Protocols::empty();
        self.protocol = None;

        if let Some(address) = self.address.take() {
            info!(address = %address, "Session closed");
        }
    }

    /// Process backend events for at most `timeout` before the first one.
    ///
    /// Callbacks fire from inside this call. Calling it from a callback
    /// does nothing.
    pub fn poll(&mut self, timeout: Duration) {
        if self.polling || !self.opened {
            return;
        }
        self.polling = true;

        let mut wait = timeout;
        for _ in 0..self.config.max_poll_iterations.max(1) {
            let events = self.transport.step(wait);
            if events.is_empty() {
                break;
            }
            wait = Duration::ZERO;

            for event in events {
                if self.teardown_requested {
                    break;
                }
                self.dispatch(event);
            }
            if self.teardown_requested {
                break;
            }
        }

        self.polling = false;
        self.polling_conn = None;
        if self.teardown_requested {
            self.teardown();
        } else {
            self.expire_idle_peers();
        }
    }

    /// One host tick with the configured poll timeout
    pub fn update(&mut self) {
        self.poll(self.config.poll_timeout());
    }

    /// Wait for a pending outbound connection.
    ///
    /// Polls until the connection resolves or the configured timeout
    /// elapses; returns whether the session is ready.
    pub fn establish(&mut self) -> bool {
        if !self.opened || self.polling {
            return self.ready();
        }

        let deadline = Instant::now() + self.config.establish_timeout();
        while self.opened && self.state == SessionState::Connecting && Instant::now() < deadline {
            self.poll(ESTABLISH_POLL_INTERVAL);
        }

        if self.state == SessionState::Connecting {
            warn!(timeout_ms = self.config.establish_timeout_ms, "Connection not established in time");
        }
        self.ready()
    }

    /// Soft close of one or more connections.
    ///
    /// Inside a callback this targets the connection being serviced,
    /// otherwise the outbound connection, otherwise every accepted peer.
    /// Queued data is flushed first; the close is reported through `poll`.
    pub fn disconnect(&mut self) {
        if !self.opened {
            return;
        }

        let targets: Vec<ConnectionId> = if let Some(conn) = self.polling_conn {
            vec![conn]
        } else if let Some(outbound) = &self.outbound {
            vec![outbound.conn]
        } else if self.is_bound && !self.polling {
            self.connections.iter().map(|c| c.conn).collect()
        } else {
            Vec::new()
        };

        // A client stops being ready at once; the close event still fires
        // `on_disconnected` from a later poll
        if let Some(outbound) = &self.outbound {
            if targets.contains(&outbound.conn) {
                self.state = SessionState::Idle;
            }
        }

        for conn in targets {
            debug!(conn = %conn, "Disconnecting");
            if let Err(e) = self.transport.shutdown(conn) {
                debug!(conn = %conn, error = %e, "Shutdown failed");
            }
        }
    }

    // ---- Transmission ----

    /// Send a frame to the connection being serviced, or to the outbound
    /// connection.
    ///
    /// Returns `false` when not ready, when there is no target, or when the
    /// frame cannot be encoded.
    pub fn send(&mut self, frame: &Frame) -> bool {
        if !self.ready() {
            trace!("Send while not ready");
            return false;
        }
        let target = self
            .polling_conn
            .or_else(|| self.outbound.as_ref().map(|c| c.conn));
        let Some(target) = target else {
            trace!("Send without a target connection");
            return false;
        };

        let data = match self.codec.encode(frame) {
            Ok(data) => data,
            Err(e) => {
                debug!(error = %e, "Frame rejected");
                return false;
            }
        };

        trace!(conn = %target, len = data.len(), "Sending frame");
        match self.transport.write(target, data) {
            Ok(()) => true,
            Err(e) => {
                warn!(conn = %target, error = %e, "Send failed");
                false
            }
        }
    }

    /// Send a frame to every accepted peer of a bound TCP or WebSocket
    /// session, optionally skipping the one being serviced.
    ///
    /// A failure on one peer does not stop the others.
    pub fn broadcast(&mut self, frame: &Frame, exclude_current: bool) -> bool {
        if !self.ready()
            || !self.is_bound
            || !self.is_connection_oriented()
            || self.connections.is_empty()
        {
            return false;
        }

        let data = match self.codec.encode(frame) {
            Ok(data) => data,
            Err(e) => {
                debug!(error = %e, "Frame rejected");
                return false;
            }
        };

        let skip = if exclude_current {
            self.polling_conn
        } else {
            None
        };
        let targets: Vec<ConnectionId> = self
            .connections
            .iter()
            .map(|c| c.conn)
            .filter(|conn| Some(*conn) != skip)
            .collect();

        trace!(peers = targets.len(), len = data.len(), "Broadcasting frame");
        for conn in targets {
            if let Err(e) = self.transport.write(conn, data.clone()) {
                warn!(conn = %conn, error = %e, "Broadcast to peer failed");
            }
        }
        true
    }

    // ---- Options ----

    /// Set an option before `open`. Keys are case-insensitive and the first
    /// value written for a key is kept.
    pub fn set_option(&mut self, key: &str, value: &str) -> bool {
        if self.opened {
            debug!(key, "Options are frozen while open");
            return false;
        }
        let key = key.to_ascii_lowercase();
        if key == OPTION_INTERFACES || self.options.contains_key(&key) {
            return false;
        }
        self.options.insert(key, value.to_string());
        true
    }

    /// Value of an option, looked up case-insensitively
    pub fn option(&self, key: &str) -> Option<&str> {
        self.options
            .get(&key.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Every option, keyed in lowercase
    pub fn options(&self) -> &BTreeMap<String, String> {
        &self.options
    }

    // ---- Callbacks ----

    /// Called once per extracted frame with the frame, its payload size and
    /// the sender's address
    pub fn set_on_received<F>(&mut self, handler: F)
    where
        F: FnMut(&mut Session<T>, &Frame, usize, &str) + 'static,
    {
        self.callbacks.received.set(Some(Box::new(handler)));
    }

    /// Called when a stream connection is up: an accepted peer on a server,
    /// the outbound connection on a client. `None` reports a failed connect.
    pub fn set_on_established<F>(&mut self, handler: F)
    where
        F: FnMut(&mut Session<T>, Option<&str>) + 'static,
    {
        self.callbacks.established.set(Some(Box::new(handler)));
    }

    /// Called when a stream connection goes away, with its address
    pub fn set_on_disconnected<F>(&mut self, handler: F)
    where
        F: FnMut(&mut Session<T>, &str) + 'static,
    {
        self.callbacks.disconnected.set(Some(Box::new(handler)));
    }

    /// Registered handlers
    pub fn callbacks(&self) -> &CallbackRegistry<T> {
        &self.callbacks
    }

    /// Drop every handler
    pub fn clear_callbacks(&mut self) {
        self.callbacks.clear();
    }

    // ---- Status ----

    /// Current connection state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether `open` succeeded and `close` has not run yet
    pub fn is_open(&self) -> bool {
        self.opened
    }

    /// Open, ready, and not being torn down
    pub fn ready(&self) -> bool {
        self.opened && !self.teardown_requested && self.state == SessionState::Ready
    }

    /// Whether a callback is executing
    pub fn polling(&self) -> bool {
        self.polling
    }

    /// Whether the session currently holds a bound socket
    pub fn is_bound(&self) -> bool {
        self.is_bound
    }

    /// Whether the last successful `open` bound a socket
    pub fn was_bound(&self) -> bool {
        self.was_bound
    }

    /// Protocol in use while open
    pub fn protocol(&self) -> Option<Protocol> {
        self.protocol
    }

    /// Protocols left active by the address and the caller's mask
    pub fn protocols(&self) -> Protocols {
        self.protocols
    }

    /// Whether the protocol in use is TCP or WebSocket
    pub fn is_connection_oriented(&self) -> bool {
        self.protocol
            .map_or(false, |protocol| protocol.is_connection_oriented())
    }

    /// Frame representation in use, or the configured default when closed
    pub fn data_type(&self) -> DataType {
        self.codec.data_type()
    }

    /// Parsed address while open
    pub fn address(&self) -> Option<&AddressSpec> {
        self.address.as_ref()
    }

    /// Configuration the session was created with
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Underlying transport
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Underlying transport, mutably. Handles the session owns must not be
    /// closed through it.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Local address of the listener or the outbound connection
    pub fn local_addr(&self) -> Option<SocketAddr> {
        let handle = self
            .listener
            .or_else(|| self.outbound.as_ref().map(|c| c.conn))?;
        self.transport.local_addr(handle)
    }

    /// Accepted peers in accept order
    pub fn connections(&self) -> Vec<ConnectionId> {
        self.connections.iter().map(|c| c.conn).collect()
    }

    /// Number of accepted peers
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Connection being serviced by the executing callback
    pub fn current_connection(&self) -> Option<ConnectionId> {
        self.polling_conn
    }

    /// Remote address of a connection as text
    pub fn address_text(&self, conn: ConnectionId) -> String {
        self.transport
            .peer_addr(conn)
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| EMPTY_ADDRESS.to_string())
    }

    // ---- Event dispatch ----

    fn dispatch(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Accepted {
                listener,
                conn,
                peer,
            } => self.handle_accepted(listener, conn, peer),
            TransportEvent::Connected { conn, result } => self.handle_connected(conn, result),
            TransportEvent::Received { conn, data } => self.handle_received(conn, &data),
            TransportEvent::Closed { conn } => self.handle_closed(conn),
        }
    }

    fn handle_accepted(&mut self, listener: ConnectionId, conn: ConnectionId, peer: SocketAddr) {
        if self.listener != Some(listener) {
            self.transport.close(conn);
            return;
        }

        let address = peer.to_string();
        debug!(conn = %conn, peer = %address, "Connection accepted");
        self.connections.push(Connection::new(conn, address.clone()));

        if self.is_connection_oriented() {
            self.polling_conn = Some(conn);
            self.fire_established(Some(&address));
            self.polling_conn = None;
        }
    }

    fn handle_connected(&mut self, conn: ConnectionId, result: std::result::Result<(), TransportError>) {
        let matches = self
            .outbound
            .as_ref()
            .map_or(false, |outbound| outbound.conn == conn);
        if !matches {
            return;
        }
        if self.state != SessionState::Connecting {
            // Disconnected while connecting; a failed connect reports no close
            if result.is_err() {
                self.outbound = None;
            }
            return;
        }

        match result {
            Ok(()) => {
                let address = self.transport.peer_addr(conn).map(|addr| addr.to_string());
                let address = match (address, self.outbound.as_mut()) {
                    (Some(address), Some(outbound)) => {
                        outbound.address = address.clone();
                        address
                    }
                    (None, Some(outbound)) => outbound.address.clone(),
                    (_, None) => return,
                };
                self.state = SessionState::Ready;
                info!(conn = %conn, peer = %address, "Connection established");
                self.fire_established(Some(&address));
            }
            Err(e) => {
                warn!(conn = %conn, error = %e, "Connection failed");
                self.outbound = None;
                self.state = SessionState::Failed;
                self.fire_established(None);
            }
        }
    }

    fn handle_received(&mut self, conn: ConnectionId, data: &[u8]) {
        match self.connection_mut(conn) {
            Some(connection) => {
                connection.buffer.extend(data);
                connection.last_seen = Instant::now();
            }
            None => return,
        }

        let codec = self.codec;
        while !self.teardown_requested {
            let Some(connection) = self.connection_mut(conn) else {
                break;
            };
            let decoded = codec.decode(&mut connection.buffer);
            let address = connection.address.clone();

            match decoded {
                Ok(Some(Decoded { frame, size })) => {
                    self.polling_conn = Some(conn);
                    self.fire_received(&frame, size, &address);
                    self.polling_conn = None;
                }
                Ok(None) => break,
                Err(e) if !e.is_fatal() => {
                    warn!(conn = %conn, peer = %address, error = %e, "Discarding malformed frame");
                }
                Err(e) => {
                    warn!(conn = %conn, peer = %address, error = %e, "Framing violated, dropping connection");
                    self.transport.close(conn);
                    self.handle_closed(conn);
                    break;
                }
            }
        }
    }

    fn handle_closed(&mut self, conn: ConnectionId) {
        if self.listener == Some(conn) {
            info!(conn = %conn, "Listener closed");
            self.listener = None;
            self.state = SessionState::Idle;
            return;
        }

        let connection = if self.outbound.as_ref().map(|c| c.conn) == Some(conn) {
            self.state = SessionState::Idle;
            self.outbound.take()
        } else {
            self.connections
                .iter()
                .position(|c| c.conn == conn)
                .map(|index| self.connections.remove(index))
        };
        let Some(connection) = connection else {
            return;
        };

        debug!(conn = %conn, peer = %connection.address, "Connection closed");
        if self.is_connection_oriented() {
            self.fire_disconnected(&connection.address);
        }
    }

    /// Forget UDP peers of a bound session that have gone quiet
    fn expire_idle_peers(&mut self) {
        if !self.is_bound || self.is_connection_oriented() {
            return;
        }
        let Some(timeout) = self.config.udp_peer_timeout() else {
            return;
        };

        let now = Instant::now();
        let transport = &mut self.transport;
        self.connections.retain(|connection| {
            let idle = now.duration_since(connection.last_seen) >= timeout;
            if idle {
                trace!(conn = %connection.conn, peer = %connection.address, "Forgetting idle UDP peer");
                transport.close(connection.conn);
            }
            !idle
        });
    }

    fn connection_mut(&mut self, conn: ConnectionId) -> Option<&mut Connection> {
        match self.outbound.as_mut() {
            Some(outbound) if outbound.conn == conn => Some(outbound),
            _ => self.connections.iter_mut().find(|c| c.conn == conn),
        }
    }

    fn fire_received(&mut self, frame: &Frame, size: usize, peer: &str) {
        if let Some((mut handler, generation)) = self.callbacks.received.take() {
            handler(self, frame, size, peer);
            self.callbacks.received.restore(handler, generation);
        }
    }

    fn fire_established(&mut self, peer: Option<&str>) {
        if let Some((mut handler, generation)) = self.callbacks.established.take() {
            handler(self, peer);
            self.callbacks.established.restore(handler, generation);
        }
    }

    fn fire_disconnected(&mut self, peer: &str) {
        if let Some((mut handler, generation)) = self.callbacks.disconnected.take() {
            handler(self, peer);
            self.callbacks.disconnected.restore(handler, generation);
        }
    }
}

impl<T: Transport> Drop for Session<T> {
    fn drop(&mut self) {
        if self.opened {
            self.teardown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::transport::{MemoryNetwork, MemoryTransport};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn memory_session(network: &MemoryNetwork) -> Session<MemoryTransport> {
        Session::with_transport(network.transport(), SessionConfig::default()).unwrap()
    }

    /// Accepts every request and never reports an event
    #[derive(Default)]
    struct SilentTransport {
        handles: u64,
    }

    impl SilentTransport {
        fn next(&mut self) -> ConnectionId {
            self.handles += 1;
            ConnectionId(self.handles)
        }
    }

    impl Transport for SilentTransport {
        fn step(&mut self, timeout: Duration) -> Vec<TransportEvent> {
            std::thread::sleep(timeout);
            Vec::new()
        }

        fn connect(
            &mut self,
            _protocol: Protocol,
            _target: &str,
        ) -> std::result::Result<ConnectionId, TransportError> {
            Ok(self.next())
        }

        fn bind(
            &mut self,
            _protocol: Protocol,
            _authority: &str,
        ) -> std::result::Result<ConnectionId, TransportError> {
            Ok(self.next())
        }

        fn write(
            &mut self,
            _conn: ConnectionId,
            _data: bytes::Bytes,
        ) -> std::result::Result<(), TransportError> {
            Ok(())
        }

        fn shutdown(&mut self, _conn: ConnectionId) -> std::result::Result<(), TransportError> {
            Ok(())
        }

        fn close(&mut self, _conn: ConnectionId) {}

        fn peer_addr(&self, _conn: ConnectionId) -> Option<SocketAddr> {
            None
        }

        fn local_addr(&self, _conn: ConnectionId) -> Option<SocketAddr> {
            None
        }

        fn reset(&mut self) {}
    }

    #[test]
    fn test_new_session_is_idle() {
        let session = memory_session(&MemoryNetwork::new());
        assert_eq!(session.state(), SessionState::Idle);
        assert!(!session.is_open());
        assert!(!session.ready());
        assert_eq!(session.data_type(), DataType::Json);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = SessionConfig {
            max_frame_size: 0,
            ..SessionConfig::default()
        };
        let err = Session::with_transport(MemoryTransport::new(), config).err().unwrap();
        assert!(matches!(err, crate::error::PollnetError::Config(_)));

        let config = SessionConfig {
            max_poll_iterations: 0,
            ..SessionConfig::default()
        };
        assert!(Session::with_config(config).is_err());
    }

    #[test]
    fn test_open_bind_is_ready() {
        let mut session = memory_session(&MemoryNetwork::new());
        let role = session.open("7000", Protocols::TCP).unwrap();

        assert_eq!(role, Role::Bind);
        assert!(session.ready());
        assert!(session.is_bound());
        assert!(session.was_bound());
        assert_eq!(session.protocol(), Some(Protocol::Tcp));
        assert!(session.option(OPTION_INTERFACES).is_some());
    }

    #[test]
    fn test_open_twice_fails() {
        let mut session = memory_session(&MemoryNetwork::new());
        session.open("7000", Protocols::TCP).unwrap();

        let err = session.open("7001", Protocols::TCP).unwrap_err();
        assert!(matches!(
            err,
            crate::error::PollnetError::Session(SessionError::AlreadyOpen)
        ));
    }

    #[test]
    fn test_open_with_bad_address_stays_closed() {
        let mut session = memory_session(&MemoryNetwork::new());
        assert!(session.open("localhost:http", Protocols::TCP).is_err());
        assert!(!session.is_open());
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn test_close_twice() {
        let mut session = memory_session(&MemoryNetwork::new());
        session.open("7000", Protocols::TCP).unwrap();

        assert!(session.close());
        assert_eq!(session.state(), SessionState::Idle);
        assert!(!session.close());
        assert_eq!(session.state(), SessionState::Idle);
        assert!(session.options().is_empty());
    }

    #[test]
    fn test_reopen_after_close() {
        let network = MemoryNetwork::new();
        let mut session = memory_session(&network);
        session.open("7000", Protocols::TCP).unwrap();
        session.close();

        assert!(!network.is_bound(Protocol::Tcp, 7000));
        assert!(session.open("7000", Protocols::TCP).is_ok());
    }

    #[test]
    fn test_options_frozen_and_first_write_wins() {
        let mut session = memory_session(&MemoryNetwork::new());
        assert!(session.set_option("DATA_TYPE", "string"));
        assert!(!session.set_option("data_type", "bytes"));
        assert!(!session.set_option("interfaces", "[]"));
        assert_eq!(session.option("Data_Type"), Some("string"));

        session.open("7000", Protocols::TCP).unwrap();
        assert_eq!(session.data_type(), DataType::String);
        assert!(!session.set_option("other", "x"));

        session.close();
        assert_eq!(session.option("data_type"), None);
        assert_eq!(session.data_type(), DataType::Json);
    }

    #[test]
    fn test_establish_resolves() {
        let network = MemoryNetwork::new();
        let mut server = memory_session(&network);
        server.open("7000", Protocols::TCP).unwrap();

        let mut client = memory_session(&network);
        client.open(">7000", Protocols::TCP).unwrap();
        assert_eq!(client.state(), SessionState::Connecting);
        assert!(client.establish());
        assert_eq!(client.state(), SessionState::Ready);
    }

    #[test]
    fn test_establish_times_out() {
        let config = SessionConfig {
            establish_timeout_ms: 30,
            ..SessionConfig::default()
        };
        let mut session = Session::with_transport(SilentTransport::default(), config).unwrap();
        session.open(">127.0.0.1:7000", Protocols::TCP).unwrap();

        let started = Instant::now();
        assert!(!session.establish());
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert_eq!(session.state(), SessionState::Connecting);
        assert!(session.is_open());
        assert!(!session.send(&Frame::from("x")));
    }

    #[test]
    fn test_disconnect_makes_client_idle_at_once() {
        let network = MemoryNetwork::new();
        let mut server = memory_session(&network);
        server.open("7000", Protocols::TCP).unwrap();

        let mut client = memory_session(&network);
        let closed = Rc::new(RefCell::new(0));
        let seen = closed.clone();
        client.set_on_disconnected(move |_, _| *seen.borrow_mut() += 1);
        client.open(">7000", Protocols::TCP).unwrap();
        assert!(client.establish());

        client.disconnect();
        assert_eq!(client.state(), SessionState::Idle);
        assert!(!client.ready());
        assert!(!client.send(&Frame::from("late")));
        assert_eq!(*closed.borrow(), 0);

        // The close itself is reported by the next poll
        client.poll(Duration::ZERO);
        assert_eq!(*closed.borrow(), 1);
        assert_eq!(client.state(), SessionState::Idle);
    }

    #[test]
    fn test_close_drops_callbacks() {
        let mut session = memory_session(&MemoryNetwork::new());
        session.set_on_received(|_, _, _, _| {});
        session.set_on_established(|_, _| {});
        session.set_on_disconnected(|_, _| {});
        session.open("7000", Protocols::TCP).unwrap();

        assert!(session.close());
        assert!(!session.callbacks().has_received());
        assert!(!session.callbacks().has_established());
        assert!(!session.callbacks().has_disconnected());
    }

    #[test]
    fn test_establish_failure() {
        let mut client = memory_session(&MemoryNetwork::new());
        let failures = Rc::new(RefCell::new(0));
        let seen = failures.clone();
        client.set_on_established(move |_, peer| {
            if peer.is_none() {
                *seen.borrow_mut() += 1;
            }
        });

        client.open(">7000", Protocols::TCP).unwrap();
        assert!(!client.establish());
        assert_eq!(client.state(), SessionState::Failed);
        assert_eq!(*failures.borrow(), 1);
    }

    #[test]
    fn test_udp_connect_is_ready_at_once() {
        let mut client = memory_session(&MemoryNetwork::new());
        client.open("udp://127.0.0.1:7000", Protocols::ALL).unwrap();
        assert!(client.ready());
        assert!(!client.is_connection_oriented());
    }

    #[test]
    fn test_poll_on_closed_session_is_noop() {
        let mut session = memory_session(&MemoryNetwork::new());
        session.poll(Duration::ZERO);
        assert!(!session.polling());
        session.disconnect();
        assert!(!session.send(&Frame::from("x")));
    }

    #[test]
    fn test_server_send_without_current_connection_fails() {
        let mut session = memory_session(&MemoryNetwork::new());
        session.open("7000", Protocols::TCP).unwrap();
        assert!(!session.send(&Frame::from("x")));
        // No accepted peers yet
        assert!(!session.broadcast(&Frame::from("x"), false));
    }

    #[test]
    fn test_address_text_unknown() {
        let session = memory_session(&MemoryNetwork::new());
        assert_eq!(session.address_text(ConnectionId(99)), EMPTY_ADDRESS);
    }
}
