//! Socket transport
//!
//! Real UDP, TCP and WebSocket sockets. Every socket lives in a task on a
//! private current-thread tokio runtime, which only makes progress inside
//! [`Transport::step`]. Tasks never call back into the session: they report
//! through an unbounded channel that `step` drains and translates into
//! [`TransportEvent`]s.

use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::runtime::{Builder, Runtime};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::{JoinHandle, JoinSet};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, trace, warn};

use super::{split_target, ConnectionId, Transport, TransportEvent};
use crate::error::TransportError;
use crate::net::address::Protocol;

/// Default size of a single stream read (16KB)
const DEFAULT_READ_CHUNK_SIZE: usize = 16 * 1024;

/// Largest UDP payload
const MAX_DATAGRAM_SIZE: usize = 65535;

/// Pause after a failed accept before trying again
const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);

/// Scheduler turns given to cancelled tasks so they drop their sockets.
/// A listener's connections are cancelled one turn after the listener.
const SETTLE_TURNS: usize = 3;

/// Instruction for a stream connection task
#[derive(Debug)]
enum Command {
    Data(Bytes),
    /// Flush what is queued, then close
    Shutdown,
}

/// Report from a socket task
#[derive(Debug)]
enum Signal {
    Accepted {
        listener: ConnectionId,
        conn: ConnectionId,
        peer: SocketAddr,
        local: Option<SocketAddr>,
        commands: UnboundedSender<Command>,
    },
    Connected {
        conn: ConnectionId,
        result: Result<(SocketAddr, SocketAddr), TransportError>,
    },
    Received {
        conn: ConnectionId,
        data: Bytes,
    },
    Datagram {
        listener: ConnectionId,
        peer: SocketAddr,
        data: Bytes,
    },
    Closed {
        conn: ConnectionId,
    },
}

/// What a handle refers to
enum Entry {
    /// TCP or WebSocket listener
    Listener {
        local: SocketAddr,
        task: JoinHandle<()>,
    },
    /// TCP or WebSocket connection, outbound or accepted. Accepted
    /// connections run inside their listener's task.
    Stream {
        peer: Option<SocketAddr>,
        local: Option<SocketAddr>,
        commands: UnboundedSender<Command>,
        task: Option<JoinHandle<()>>,
    },
    /// UDP socket; `peer` is set for a connected (client) socket
    Datagram {
        socket: Arc<UdpSocket>,
        peer: Option<SocketAddr>,
        local: Option<SocketAddr>,
        task: JoinHandle<()>,
    },
    /// Remote address seen by a bound UDP socket
    Virtual {
        listener: ConnectionId,
        peer: SocketAddr,
    },
}

/// Transport over operating system sockets
pub struct SocketTransport {
    runtime: Runtime,
    signals_tx: UnboundedSender<Signal>,
    signals_rx: UnboundedReceiver<Signal>,
    ids: Arc<AtomicU64>,
    entries: HashMap<ConnectionId, Entry>,
    virtual_peers: HashMap<(ConnectionId, SocketAddr), ConnectionId>,
    read_chunk_size: usize,
}

impl SocketTransport {
    /// Create a transport with its own runtime.
    ///
    /// Must not be driven from inside another tokio runtime.
    pub fn new() -> Result<Self, TransportError> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| TransportError::Runtime(e.to_string()))?;
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();

        Ok(Self {
            runtime,
            signals_tx,
            signals_rx,
            ids: Arc::new(AtomicU64::new(1)),
            entries: HashMap::new(),
            virtual_peers: HashMap::new(),
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
        })
    }

    /// Set the size of a single stream read
    pub fn with_read_chunk_size(mut self, size: usize) -> Self {
        self.read_chunk_size = size.max(1);
        self
    }

    /// Number of live handles
    pub fn handle_count(&self) -> usize {
        self.entries.len()
    }

    fn next_id(&self) -> ConnectionId {
        ConnectionId(self.ids.fetch_add(1, Ordering::Relaxed))
    }

    fn connect_datagram(
        &mut self,
        conn: ConnectionId,
        authority: &str,
    ) -> Result<Entry, TransportError> {
        let target = resolve(authority)?;
        let any: SocketAddr = if target.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };

        let std_socket = std::net::UdpSocket::bind(any)?;
        std_socket.connect(target)?;
        std_socket.set_nonblocking(true)?;

        let _guard = self.runtime.enter();
        let socket = Arc::new(UdpSocket::from_std(std_socket)?);
        let local = socket.local_addr().ok();
        let task = self.runtime.spawn(read_connected_datagrams(
            conn,
            socket.clone(),
            self.signals_tx.clone(),
        ));

        Ok(Entry::Datagram {
            socket,
            peer: Some(target),
            local,
            task,
        })
    }

    /// Forget a handle, and for a UDP listener every peer mapped to it
    fn forget(&mut self, conn: ConnectionId) -> Option<Entry> {
        let entry = self.entries.remove(&conn)?;
        match &entry {
            Entry::Virtual { listener, peer } => {
                self.virtual_peers.remove(&(*listener, *peer));
            }
            Entry::Datagram { task, .. } | Entry::Listener { task, .. } => {
                task.abort();
                let children: Vec<_> = self
                    .virtual_peers
                    .iter()
                    .filter(|((listener, _), _)| *listener == conn)
                    .map(|(key, child)| (*key, *child))
                    .collect();
                for (key, child) in children {
                    self.virtual_peers.remove(&key);
                    self.entries.remove(&child);
                }
            }
            Entry::Stream { task, .. } => {
                if let Some(task) = task {
                    task.abort();
                }
            }
        }
        Some(entry)
    }

    /// Run the scheduler briefly so aborted tasks are dropped
    fn settle(&mut self) {
        self.runtime.block_on(async {
            for _ in 0..SETTLE_TURNS {
                tokio::task::yield_now().await;
            }
        });
    }

    fn translate(&mut self, signal: Signal, events: &mut Vec<TransportEvent>) {
        match signal {
            Signal::Accepted {
                listener,
                conn,
                peer,
                local,
                commands,
            } => {
                // A listener closed meanwhile; dropping `commands` ends the task
                if !self.entries.contains_key(&listener) {
                    return;
                }
                self.entries.insert(
                    conn,
                    Entry::Stream {
                        peer: Some(peer),
                        local,
                        commands,
                        task: None,
                    },
                );
                events.push(TransportEvent::Accepted {
                    listener,
                    conn,
                    peer,
                });
            }
            Signal::Connected { conn, result } => match result {
                Ok((remote, own)) => {
                    if let Some(Entry::Stream { peer, local, .. }) = self.entries.get_mut(&conn) {
                        *peer = Some(remote);
                        *local = Some(own);
                        events.push(TransportEvent::Connected {
                            conn,
                            result: Ok(()),
                        });
                    }
                }
                Err(e) => {
                    if self.entries.remove(&conn).is_some() {
                        events.push(TransportEvent::Connected {
                            conn,
                            result: Err(e),
                        });
                    }
                }
            },
            Signal::Received { conn, data } => {
                if self.entries.contains_key(&conn) {
                    events.push(TransportEvent::Received { conn, data });
                }
            }
            Signal::Datagram {
                listener,
                peer,
                data,
            } => {
                if !self.entries.contains_key(&listener) {
                    return;
                }
                let conn = match self.virtual_peers.get(&(listener, peer)) {
                    Some(conn) => *conn,
                    None => {
                        let conn = self.next_id();
                        self.entries
                            .insert(conn, Entry::Virtual { listener, peer });
                        self.virtual_peers.insert((listener, peer), conn);
                        trace!(listener = %listener, conn = %conn, peer = %peer, "New UDP peer");
                        events.push(TransportEvent::Accepted {
                            listener,
                            conn,
                            peer,
                        });
                        conn
                    }
                };
                events.push(TransportEvent::Received { conn, data });
            }
            Signal::Closed { conn } => {
                let children: Vec<_> = self
                    .virtual_peers
                    .iter()
                    .filter(|((listener, _), _)| *listener == conn)
                    .map(|(_, child)| *child)
                    .collect();
                if self.forget(conn).is_some() {
                    for child in children {
                        events.push(TransportEvent::Closed { conn: child });
                    }
                    events.push(TransportEvent::Closed { conn });
                }
            }
        }
    }
}

impl Transport for SocketTransport {
    fn step(&mut self, timeout: Duration) -> Vec<TransportEvent> {
        let mut signals = Vec::new();
        {
            let Self {
                runtime,
                signals_rx,
                ..
            } = self;
            let collected = &mut signals;
            runtime.block_on(async move {
                // Let socket tasks run before looking at the channel
                tokio::task::yield_now().await;
                if let Ok(Some(signal)) = tokio::time::timeout(timeout, signals_rx.recv()).await {
                    collected.push(signal);
                }
                while let Ok(signal) = signals_rx.try_recv() {
                    collected.push(signal);
                }
            });
        }

        let mut events = Vec::with_capacity(signals.len());
        for signal in signals {
            self.translate(signal, &mut events);
        }
        events
    }

    fn connect(&mut self, protocol: Protocol, target: &str) -> Result<ConnectionId, TransportError> {
        let (authority, path) = split_target(target);
        let conn = self.next_id();
        let entry = match protocol {
            Protocol::Udp => self.connect_datagram(conn, authority)?,
            Protocol::Tcp | Protocol::WebSocket => {
                let (commands, command_rx) = mpsc::unbounded_channel();
                let task = self.runtime.spawn(connect_stream(
                    conn,
                    protocol,
                    authority.to_string(),
                    path.to_string(),
                    command_rx,
                    self.signals_tx.clone(),
                    self.read_chunk_size,
                ));
                Entry::Stream {
                    peer: None,
                    local: None,
                    commands,
                    task: Some(task),
                }
            }
        };

        debug!(conn = %conn, protocol = %protocol, address = target, "Connecting");
        self.entries.insert(conn, entry);
        Ok(conn)
    }

    fn bind(&mut self, protocol: Protocol, authority: &str) -> Result<ConnectionId, TransportError> {
        let addr = resolve(authority)?;
        let conn = self.next_id();

        let entry = {
            let _guard = self.runtime.enter();
            match protocol {
                Protocol::Udp => {
                    let std_socket =
                        std::net::UdpSocket::bind(addr).map_err(|e| bind_error(authority, e))?;
                    std_socket.set_nonblocking(true)?;
                    let socket = Arc::new(UdpSocket::from_std(std_socket)?);
                    let local = socket.local_addr()?;
                    let task = self.runtime.spawn(read_datagrams(
                        conn,
                        socket.clone(),
                        self.signals_tx.clone(),
                    ));
                    Entry::Datagram {
                        socket,
                        peer: None,
                        local: Some(local),
                        task,
                    }
                }
                Protocol::Tcp | Protocol::WebSocket => {
                    let std_listener =
                        std::net::TcpListener::bind(addr).map_err(|e| bind_error(authority, e))?;
                    std_listener.set_nonblocking(true)?;
                    let listener = TcpListener::from_std(std_listener)?;
                    let local = listener.local_addr()?;
                    let task = self.runtime.spawn(accept_loop(
                        conn,
                        protocol,
                        listener,
                        self.ids.clone(),
                        self.signals_tx.clone(),
                        self.read_chunk_size,
                    ));
                    Entry::Listener { local, task }
                }
            }
        };

        debug!(conn = %conn, protocol = %protocol, authority, "Bound");
        self.entries.insert(conn, entry);
        Ok(conn)
    }

    fn write(&mut self, conn: ConnectionId, data: Bytes) -> Result<(), TransportError> {
        let (socket, target) = match self.entries.get(&conn) {
            Some(Entry::Stream { commands, .. }) => {
                return commands
                    .send(Command::Data(data))
                    .map_err(|_| TransportError::ConnectionClosed);
            }
            Some(Entry::Datagram {
                socket,
                peer: Some(_),
                ..
            }) => (socket.clone(), None),
            Some(Entry::Virtual { listener, peer }) => match self.entries.get(listener) {
                Some(Entry::Datagram { socket, .. }) => (socket.clone(), Some(*peer)),
                _ => return Err(TransportError::ConnectionClosed),
            },
            Some(Entry::Listener { .. }) | Some(Entry::Datagram { peer: None, .. }) => {
                return Err(TransportError::Unsupported("write on a listener"));
            }
            None => return Err(TransportError::UnknownConnection(conn.0)),
        };

        // Sends run on the runtime; readiness is only known inside it
        self.runtime.spawn(async move {
            let result = match target {
                Some(peer) => socket.send_to(&data, peer).await,
                None => socket.send(&data).await,
            };
            if let Err(e) = result {
                debug!(conn = %conn, error = %e, "UDP send failed");
            }
        });
        Ok(())
    }

    fn shutdown(&mut self, conn: ConnectionId) -> Result<(), TransportError> {
        match self.entries.get(&conn) {
            Some(Entry::Stream { commands, .. }) => commands
                .send(Command::Shutdown)
                .map_err(|_| TransportError::ConnectionClosed),
            Some(Entry::Datagram { task, .. }) | Some(Entry::Listener { task, .. }) => {
                task.abort();
                self.signals_tx
                    .send(Signal::Closed { conn })
                    .map_err(|_| TransportError::ConnectionClosed)
            }
            Some(Entry::Virtual { .. }) => self
                .signals_tx
                .send(Signal::Closed { conn })
                .map_err(|_| TransportError::ConnectionClosed),
            None => Err(TransportError::UnknownConnection(conn.0)),
        }
    }

    fn close(&mut self, conn: ConnectionId) {
        if self.forget(conn).is_some() {
            trace!(conn = %conn, "Closed");
        }
    }

    fn peer_addr(&self, conn: ConnectionId) -> Option<SocketAddr> {
        match self.entries.get(&conn)? {
            Entry::Stream { peer, .. } | Entry::Datagram { peer, .. } => *peer,
            Entry::Virtual { peer, .. } => Some(*peer),
            Entry::Listener { .. } => None,
        }
    }

    fn local_addr(&self, conn: ConnectionId) -> Option<SocketAddr> {
        match self.entries.get(&conn)? {
            Entry::Stream { local, .. } | Entry::Datagram { local, .. } => *local,
            Entry::Listener { local, .. } => Some(*local),
            Entry::Virtual { listener, .. } => self.local_addr(*listener),
        }
    }

    fn reset(&mut self) {
        let handles: Vec<_> = self.entries.keys().copied().collect();
        for conn in handles {
            self.forget(conn);
        }
        self.settle();
        while self.signals_rx.try_recv().is_ok() {}
    }
}

fn resolve(authority: &str) -> Result<SocketAddr, TransportError> {
    authority
        .to_socket_addrs()
        .map_err(|_| TransportError::InvalidAddress(authority.to_string()))?
        .next()
        .ok_or_else(|| TransportError::InvalidAddress(authority.to_string()))
}

fn bind_error(authority: &str, error: io::Error) -> TransportError {
    if error.kind() == io::ErrorKind::AddrInUse {
        TransportError::AddressInUse(authority.to_string())
    } else {
        TransportError::Io(error)
    }
}

async fn connect_stream(
    conn: ConnectionId,
    protocol: Protocol,
    authority: String,
    path: String,
    commands: UnboundedReceiver<Command>,
    signals: UnboundedSender<Signal>,
    chunk_size: usize,
) {
    let stream = match TcpStream::connect(&authority).await {
        Ok(stream) => stream,
        Err(e) => {
            debug!(conn = %conn, authority = %authority, error = %e, "Connect failed");
            let _ = signals.send(Signal::Connected {
                conn,
                result: Err(e.into()),
            });
            return;
        }
    };
    let addrs = match (stream.peer_addr(), stream.local_addr()) {
        (Ok(peer), Ok(local)) => (peer, local),
        (Err(e), _) | (_, Err(e)) => {
            let _ = signals.send(Signal::Connected {
                conn,
                result: Err(e.into()),
            });
            return;
        }
    };
    let _ = stream.set_nodelay(true);

    match protocol {
        Protocol::WebSocket => {
            let url = format!("ws://{}{}", authority, path);
            match tokio_tungstenite::client_async(url, stream).await {
                Ok((ws, _response)) => {
                    if signals
                        .send(Signal::Connected {
                            conn,
                            result: Ok(addrs),
                        })
                        .is_ok()
                    {
                        run_websocket(conn, ws, commands, signals).await;
                    }
                }
                Err(e) => {
                    debug!(conn = %conn, error = %e, "WebSocket handshake failed");
                    let _ = signals.send(Signal::Connected {
                        conn,
                        result: Err(TransportError::WebSocket(e.to_string())),
                    });
                }
            }
        }
        _ => {
            if signals
                .send(Signal::Connected {
                    conn,
                    result: Ok(addrs),
                })
                .is_ok()
            {
                run_tcp(conn, stream, commands, signals, chunk_size).await;
            }
        }
    }
}

async fn accept_loop(
    listener_id: ConnectionId,
    protocol: Protocol,
    listener: TcpListener,
    ids: Arc<AtomicU64>,
    signals: UnboundedSender<Signal>,
    chunk_size: usize,
) {
    // Aborting this task drops the set, which aborts every connection in it
    let mut served = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let conn = ConnectionId(ids.fetch_add(1, Ordering::Relaxed));
                    trace!(listener = %listener_id, conn = %conn, peer = %peer, "Accepted");
                    served.spawn(serve_accepted(
                        listener_id,
                        conn,
                        protocol,
                        stream,
                        peer,
                        signals.clone(),
                        chunk_size,
                    ));
                }
                Err(e) => {
                    warn!(listener = %listener_id, error = %e, "Accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
            Some(_) = served.join_next(), if !served.is_empty() => {}
        }
    }
}

async fn serve_accepted(
    listener: ConnectionId,
    conn: ConnectionId,
    protocol: Protocol,
    stream: TcpStream,
    peer: SocketAddr,
    signals: UnboundedSender<Signal>,
    chunk_size: usize,
) {
    let local = stream.local_addr().ok();
    let _ = stream.set_nodelay(true);
    let (commands, command_rx) = mpsc::unbounded_channel();
    let accepted = Signal::Accepted {
        listener,
        conn,
        peer,
        local,
        commands,
    };

    match protocol {
        Protocol::WebSocket => match tokio_tungstenite::accept_async(stream).await {
            Ok(ws) => {
                if signals.send(accepted).is_ok() {
                    run_websocket(conn, ws, command_rx, signals).await;
                }
            }
            Err(e) => {
                debug!(peer = %peer, error = %e, "WebSocket upgrade failed");
            }
        },
        _ => {
            if signals.send(accepted).is_ok() {
                run_tcp(conn, stream, command_rx, signals, chunk_size).await;
            }
        }
    }
}

async fn run_tcp(
    conn: ConnectionId,
    stream: TcpStream,
    mut commands: UnboundedReceiver<Command>,
    signals: UnboundedSender<Signal>,
    chunk_size: usize,
) {
    let (mut reader, mut writer) = stream.into_split();
    let mut buf = vec![0u8; chunk_size];

    loop {
        tokio::select! {
            read = reader.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => {
                    trace!(conn = %conn, len = n, "Read");
                    let data = Bytes::copy_from_slice(&buf[..n]);
                    if signals.send(Signal::Received { conn, data }).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    debug!(conn = %conn, error = %e, "Read failed");
                    break;
                }
            },
            command = commands.recv() => match command {
                Some(Command::Data(data)) => {
                    if let Err(e) = writer.write_all(&data).await {
                        debug!(conn = %conn, error = %e, "Write failed");
                        break;
                    }
                }
                Some(Command::Shutdown) => {
                    let _ = writer.flush().await;
                    let _ = writer.shutdown().await;
                    break;
                }
                // Hard close, nothing to report
                None => return,
            },
        }
    }

    let _ = signals.send(Signal::Closed { conn });
}

async fn run_websocket(
    conn: ConnectionId,
    ws: WebSocketStream<TcpStream>,
    mut commands: UnboundedReceiver<Command>,
    signals: UnboundedSender<Signal>,
) {
    let (mut sink, mut stream) = ws.split();

    loop {
        tokio::select! {
            message = stream.next() => match message {
                Some(Ok(Message::Binary(data))) => {
                    trace!(conn = %conn, len = data.len(), "Received binary WebSocket message");
                    let data = Bytes::from(data);
                    if signals.send(Signal::Received { conn, data }).is_err() {
                        return;
                    }
                }
                Some(Ok(Message::Text(text))) => {
                    let data = Bytes::from(text.into_bytes());
                    if signals.send(Signal::Received { conn, data }).is_err() {
                        return;
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    if let Err(e) = sink.send(Message::Pong(payload)).await {
                        warn!(conn = %conn, error = %e, "Failed to send pong");
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(conn = %conn, error = %e, "WebSocket read failed");
                    break;
                }
            },
            command = commands.recv() => match command {
                Some(Command::Data(data)) => {
                    if let Err(e) = sink.send(Message::Binary(data.to_vec())).await {
                        debug!(conn = %conn, error = %e, "WebSocket write failed");
                        break;
                    }
                }
                Some(Command::Shutdown) => {
                    let _ = sink.close().await;
                    break;
                }
                None => return,
            },
        }
    }

    let _ = signals.send(Signal::Closed { conn });
}

/// Reader of a bound UDP socket
async fn read_datagrams(
    listener: ConnectionId,
    socket: Arc<UdpSocket>,
    signals: UnboundedSender<Signal>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((n, peer)) => {
                let data = Bytes::copy_from_slice(&buf[..n]);
                if signals
                    .send(Signal::Datagram {
                        listener,
                        peer,
                        data,
                    })
                    .is_err()
                {
                    return;
                }
            }
            Err(e) if is_transient(&e) => {
                trace!(listener = %listener, error = %e, "Transient UDP error");
            }
            Err(e) => {
                warn!(listener = %listener, error = %e, "UDP receive failed");
                let _ = signals.send(Signal::Closed { conn: listener });
                return;
            }
        }
    }
}

/// Reader of a connected UDP socket
async fn read_connected_datagrams(
    conn: ConnectionId,
    socket: Arc<UdpSocket>,
    signals: UnboundedSender<Signal>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        match socket.recv(&mut buf).await {
            Ok(n) => {
                let data = Bytes::copy_from_slice(&buf[..n]);
                if signals.send(Signal::Received { conn, data }).is_err() {
                    return;
                }
            }
            // ICMP port unreachable from a peer that is not up yet
            Err(e) if is_transient(&e) => {
                trace!(conn = %conn, error = %e, "Transient UDP error");
            }
            Err(e) => {
                warn!(conn = %conn, error = %e, "UDP receive failed");
                let _ = signals.send(Signal::Closed { conn });
                return;
            }
        }
    }
}

fn is_transient(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn step_until<F>(transport: &mut SocketTransport, mut done: F) -> Vec<TransportEvent>
    where
        F: FnMut(&[TransportEvent]) -> bool,
    {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut events = Vec::new();
        while Instant::now() < deadline {
            events.extend(transport.step(Duration::from_millis(5)));
            if done(&events) {
                break;
            }
        }
        events
    }

    #[test]
    fn test_bind_reports_local_address() {
        let mut transport = SocketTransport::new().unwrap();
        let listener = transport.bind(Protocol::Tcp, "127.0.0.1:0").unwrap();

        let local = transport.local_addr(listener).unwrap();
        assert_ne!(local.port(), 0);
        assert_eq!(transport.peer_addr(listener), None);
    }

    #[test]
    fn test_bind_twice_is_address_in_use() {
        let mut transport = SocketTransport::new().unwrap();
        let listener = transport.bind(Protocol::Tcp, "127.0.0.1:0").unwrap();
        let port = transport.local_addr(listener).unwrap().port();

        let err = transport
            .bind(Protocol::Tcp, &format!("127.0.0.1:{}", port))
            .unwrap_err();
        assert!(matches!(err, TransportError::AddressInUse(_)));
    }

    #[test]
    fn test_tcp_connect_accept_and_echo() {
        let mut transport = SocketTransport::new().unwrap();
        let listener = transport.bind(Protocol::Tcp, "127.0.0.1:0").unwrap();
        let port = transport.local_addr(listener).unwrap().port();
        let client = transport
            .connect(Protocol::Tcp, &format!("127.0.0.1:{}", port))
            .unwrap();

        let events = step_until(&mut transport, |events| {
            let accepted = events
                .iter()
                .any(|e| matches!(e, TransportEvent::Accepted { .. }));
            let connected = events
                .iter()
                .any(|e| matches!(e, TransportEvent::Connected { .. }));
            accepted && connected
        });
        let server_side = events
            .iter()
            .find_map(|e| match e {
                TransportEvent::Accepted { conn, .. } => Some(*conn),
                _ => None,
            })
            .unwrap();

        transport
            .write(client, Bytes::from_static(b"ping"))
            .unwrap();
        let events = step_until(&mut transport, |events| {
            events
                .iter()
                .any(|e| matches!(e, TransportEvent::Received { .. }))
        });
        match &events[..] {
            [TransportEvent::Received { conn, data }] => {
                assert_eq!(*conn, server_side);
                assert_eq!(&data[..], b"ping");
            }
            other => panic!("unexpected events: {:?}", other),
        }
    }

    #[test]
    fn test_connect_refused_reports_failure() {
        let mut transport = SocketTransport::new().unwrap();
        // Grab a free port, then release it
        let port = {
            let spare = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            spare.local_addr().unwrap().port()
        };
        let conn = transport
            .connect(Protocol::Tcp, &format!("127.0.0.1:{}", port))
            .unwrap();

        let events = step_until(&mut transport, |events| !events.is_empty());
        assert!(matches!(
            &events[..],
            [TransportEvent::Connected { conn: c, result: Err(_) }] if *c == conn
        ));
        assert_eq!(transport.handle_count(), 0);
    }

    #[test]
    fn test_close_is_silent() {
        let mut transport = SocketTransport::new().unwrap();
        let listener = transport.bind(Protocol::Udp, "127.0.0.1:0").unwrap();
        transport.close(listener);

        let events = transport.step(Duration::from_millis(5));
        assert!(events.is_empty());
        assert!(transport.write(listener, Bytes::from_static(b"x")).is_err());
    }

    #[test]
    fn test_reset_releases_listener_and_streams() {
        use std::io::Read;

        let mut transport = SocketTransport::new().unwrap();
        let listener = transport.bind(Protocol::Tcp, "127.0.0.1:0").unwrap();
        let addr = transport.local_addr(listener).unwrap();

        let mut peer = std::net::TcpStream::connect(addr).unwrap();
        peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        step_until(&mut transport, |events| {
            events
                .iter()
                .any(|e| matches!(e, TransportEvent::Accepted { .. }))
        });

        transport.reset();
        assert_eq!(transport.handle_count(), 0);

        // The accepted stream is gone: the peer reads end of stream
        let mut buf = [0u8; 8];
        assert!(matches!(peer.read(&mut buf), Ok(0) | Err(_)));
        // And the port can be bound again
        assert!(transport
            .bind(Protocol::Tcp, &addr.to_string())
            .is_ok());
    }

    #[test]
    fn test_reset_cancels_pending_connect() {
        let mut transport = SocketTransport::new().unwrap();
        // Non-routable address: the connect stays pending
        transport.connect(Protocol::Tcp, "10.255.255.1:9").unwrap();
        transport.reset();

        assert_eq!(transport.handle_count(), 0);
        assert!(transport.step(Duration::from_millis(5)).is_empty());
    }

    #[test]
    fn test_udp_peers_become_virtual_connections() {
        let mut transport = SocketTransport::new().unwrap();
        let listener = transport.bind(Protocol::Udp, "127.0.0.1:0").unwrap();
        let port = transport.local_addr(listener).unwrap().port();

        let client = transport
            .connect(Protocol::Udp, &format!("127.0.0.1:{}", port))
            .unwrap();
        transport.write(client, Bytes::from_static(b"one")).unwrap();

        let events = step_until(&mut transport, |events| {
            events
                .iter()
                .any(|e| matches!(e, TransportEvent::Received { .. }))
        });
        let peer = match &events[..] {
            [TransportEvent::Accepted { listener: l, conn, peer }, TransportEvent::Received { conn: r, data }] =>
            {
                assert_eq!(*l, listener);
                assert_eq!(conn, r);
                assert_eq!(&data[..], b"one");
                *peer
            }
            other => panic!("unexpected events: {:?}", other),
        };
        // The client socket is bound to the wildcard address
        assert_eq!(
            Some(peer.port()),
            transport.local_addr(client).map(|addr| addr.port())
        );
    }
}
