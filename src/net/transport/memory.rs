//! In-process transport
//!
//! A [`MemoryNetwork`] is a loopback hub shared by any number of
//! [`MemoryTransport`] endpoints. Ports are a shared namespace, bytes move
//! between endpoint queues without touching the operating system, and every
//! event is delivered on the next `step` in the order it was produced.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::rc::Rc;
use std::time::Duration;

use bytes::Bytes;
use tracing::trace;

use super::{split_target, ConnectionId, Transport, TransportEvent};
use crate::error::TransportError;
use crate::net::address::Protocol;

/// First port handed out for ephemeral binds and client sockets
const EPHEMERAL_PORT_START: u16 = 40000;

type EndpointId = u64;

struct Handle {
    owner: EndpointId,
    protocol: Protocol,
    local: SocketAddr,
    peer: Option<SocketAddr>,
    kind: HandleKind,
}

enum HandleKind {
    Listener,
    Link {
        /// Other end, absent for UDP sent into the void
        remote: Option<ConnectionId>,
        /// Listener that produced this end
        listener: Option<ConnectionId>,
        /// Whether the owner has been told about this end. UDP peers are
        /// announced on their first datagram.
        announced: bool,
    },
}

#[derive(Default)]
struct Hub {
    next_id: u64,
    next_endpoint: EndpointId,
    next_port: u16,
    fragment_size: Option<usize>,
    listeners: HashMap<(bool, u16), ConnectionId>,
    handles: HashMap<ConnectionId, Handle>,
    queues: HashMap<EndpointId, VecDeque<TransportEvent>>,
}

impl Hub {
    fn allocate_id(&mut self) -> ConnectionId {
        self.next_id += 1;
        ConnectionId(self.next_id)
    }

    fn allocate_port(&mut self) -> u16 {
        if self.next_port < EPHEMERAL_PORT_START {
            self.next_port = EPHEMERAL_PORT_START;
        }
        let port = self.next_port;
        self.next_port = self.next_port.wrapping_add(1);
        port
    }

    fn push(&mut self, owner: EndpointId, event: TransportEvent) {
        self.queues.entry(owner).or_default().push_back(event);
    }

    fn deliver(&mut self, owner: EndpointId, conn: ConnectionId, data: Bytes) {
        match self.fragment_size {
            Some(size) if size > 0 && data.len() > size => {
                let mut offset = 0;
                while offset < data.len() {
                    let end = (offset + size).min(data.len());
                    let piece = data.slice(offset..end);
                    self.push(owner, TransportEvent::Received { conn, data: piece });
                    offset = end;
                }
            }
            _ => self.push(owner, TransportEvent::Received { conn, data }),
        }
    }

    /// Remove a handle and tell the far end of a stream link
    fn drop_handle(&mut self, conn: ConnectionId) -> Option<Handle> {
        let handle = self.handles.remove(&conn)?;
        match &handle.kind {
            HandleKind::Listener => {
                let key = (handle.protocol == Protocol::Udp, handle.local.port());
                if self.listeners.get(&key) == Some(&conn) {
                    self.listeners.remove(&key);
                }
            }
            HandleKind::Link {
                remote: Some(remote),
                ..
            } if handle.protocol.is_connection_oriented() => {
                let remote = *remote;
                if let Some(far) = self.handles.remove(&remote) {
                    if let HandleKind::Link {
                        announced: true, ..
                    } = far.kind
                    {
                        self.push(far.owner, TransportEvent::Closed { conn: remote });
                    }
                }
            }
            HandleKind::Link { .. } => {}
        }
        Some(handle)
    }

    /// Give a UDP client handle a fresh far end on the socket bound to its
    /// target port, as a new peer would appear to that socket
    fn attach_udp_peer(&mut self, conn: ConnectionId) -> Option<ConnectionId> {
        let (target, local) = {
            let handle = self.handles.get(&conn)?;
            (handle.peer?, handle.local)
        };
        let listener = *self.listeners.get(&(true, target.port()))?;
        let owner = self.handles.get(&listener)?.owner;

        let server_side = self.allocate_id();
        self.handles.insert(
            server_side,
            Handle {
                owner,
                protocol: Protocol::Udp,
                local: target,
                peer: Some(local),
                kind: HandleKind::Link {
                    remote: Some(conn),
                    listener: Some(listener),
                    announced: false,
                },
            },
        );
        if let Some(Handle {
            kind: HandleKind::Link { remote, .. },
            ..
        }) = self.handles.get_mut(&conn)
        {
            *remote = Some(server_side);
        }
        Some(server_side)
    }

    fn purge(&mut self, owner: EndpointId, conn: ConnectionId) {
        if let Some(queue) = self.queues.get_mut(&owner) {
            queue.retain(|event| match event {
                TransportEvent::Accepted { conn: c, .. }
                | TransportEvent::Connected { conn: c, .. }
                | TransportEvent::Received { conn: c, .. }
                | TransportEvent::Closed { conn: c } => *c != conn,
            });
        }
    }
}

/// Shared loopback hub
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    hub: Rc<RefCell<Hub>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an endpoint attached to this network
    pub fn transport(&self) -> MemoryTransport {
        let endpoint = {
            let mut hub = self.hub.borrow_mut();
            hub.next_endpoint += 1;
            hub.next_endpoint
        };
        MemoryTransport {
            network: self.clone(),
            endpoint,
        }
    }

    /// Split every delivery into pieces of at most `size` bytes
    pub fn set_fragment_size(&self, size: Option<usize>) {
        self.hub.borrow_mut().fragment_size = size;
    }

    /// Whether something is bound on `port`
    pub fn is_bound(&self, protocol: Protocol, port: u16) -> bool {
        self.hub
            .borrow()
            .listeners
            .contains_key(&(protocol == Protocol::Udp, port))
    }
}

/// One endpoint of a [`MemoryNetwork`]
pub struct MemoryTransport {
    network: MemoryNetwork,
    endpoint: EndpointId,
}

impl MemoryTransport {
    /// Endpoint on a fresh private network
    pub fn new() -> Self {
        MemoryNetwork::new().transport()
    }

    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }

    /// Events waiting for the next step
    pub fn pending(&self) -> usize {
        self.network
            .hub
            .borrow()
            .queues
            .get(&self.endpoint)
            .map_or(0, VecDeque::len)
    }

    fn owned<'a>(&self, hub: &'a Hub, conn: ConnectionId) -> Option<&'a Handle> {
        hub.handles
            .get(&conn)
            .filter(|handle| handle.owner == self.endpoint)
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MemoryTransport {
    fn step(&mut self, _timeout: Duration) -> Vec<TransportEvent> {
        let mut hub = self.network.hub.borrow_mut();
        hub.queues
            .get_mut(&self.endpoint)
            .map(|queue| queue.drain(..).collect())
            .unwrap_or_default()
    }

    fn connect(&mut self, protocol: Protocol, target: &str) -> Result<ConnectionId, TransportError> {
        let (authority, _path) = split_target(target);
        let target: SocketAddr = authority
            .parse()
            .map_err(|_| TransportError::InvalidAddress(authority.to_string()))?;

        let mut hub = self.network.hub.borrow_mut();
        let conn = hub.allocate_id();
        let local = SocketAddr::from((Ipv4Addr::LOCALHOST, hub.allocate_port()));
        let is_udp = protocol == Protocol::Udp;

        let listener = hub
            .listeners
            .get(&(is_udp, target.port()))
            .copied()
            .and_then(|id| hub.handles.get(&id).map(|handle| (id, handle)))
            .filter(|(_, handle)| handle.protocol == protocol)
            .map(|(id, handle)| (id, handle.owner));

        let Some((listener, listener_owner)) = listener else {
            if is_udp {
                hub.handles.insert(
                    conn,
                    Handle {
                        owner: self.endpoint,
                        protocol,
                        local,
                        peer: Some(target),
                        kind: HandleKind::Link {
                            remote: None,
                            listener: None,
                            announced: true,
                        },
                    },
                );
            } else {
                let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
                hub.push(
                    self.endpoint,
                    TransportEvent::Connected {
                        conn,
                        result: Err(refused.into()),
                    },
                );
            }
            return Ok(conn);
        };

        let server_side = hub.allocate_id();
        hub.handles.insert(
            server_side,
            Handle {
                owner: listener_owner,
                protocol,
                local: target,
                peer: Some(local),
                kind: HandleKind::Link {
                    remote: Some(conn),
                    listener: Some(listener),
                    announced: !is_udp,
                },
            },
        );
        hub.handles.insert(
            conn,
            Handle {
                owner: self.endpoint,
                protocol,
                local,
                peer: Some(target),
                kind: HandleKind::Link {
                    remote: Some(server_side),
                    listener: None,
                    announced: true,
                },
            },
        );

        if !is_udp {
            hub.push(
                listener_owner,
                TransportEvent::Accepted {
                    listener,
                    conn: server_side,
                    peer: local,
                },
            );
            hub.push(
                self.endpoint,
                TransportEvent::Connected {
                    conn,
                    result: Ok(()),
                },
            );
        }
        trace!(conn = %conn, protocol = %protocol, authority, "Memory connect");
        Ok(conn)
    }

    fn bind(&mut self, protocol: Protocol, authority: &str) -> Result<ConnectionId, TransportError> {
        let mut addr: SocketAddr = authority
            .parse()
            .map_err(|_| TransportError::InvalidAddress(authority.to_string()))?;

        let mut hub = self.network.hub.borrow_mut();
        if addr.port() == 0 {
            addr.set_port(hub.allocate_port());
        }
        let key = (protocol == Protocol::Udp, addr.port());
        if hub.listeners.contains_key(&key) {
            return Err(TransportError::AddressInUse(authority.to_string()));
        }

        let conn = hub.allocate_id();
        hub.listeners.insert(key, conn);
        hub.handles.insert(
            conn,
            Handle {
                owner: self.endpoint,
                protocol,
                local: addr,
                peer: None,
                kind: HandleKind::Listener,
            },
        );
        Ok(conn)
    }

    fn write(&mut self, conn: ConnectionId, data: Bytes) -> Result<(), TransportError> {
        let mut hub = self.network.hub.borrow_mut();
        let handle = self
            .owned(&hub, conn)
            .ok_or(TransportError::UnknownConnection(conn.0))?;
        let HandleKind::Link { remote, .. } = handle.kind else {
            return Err(TransportError::Unsupported("write on a listener"));
        };
        let is_udp = handle.protocol == Protocol::Udp;

        let remote = match remote {
            Some(remote) if hub.handles.contains_key(&remote) => remote,
            // The bound side forgot this sender, or bound after it connected
            _ if is_udp => match hub.attach_udp_peer(conn) {
                Some(remote) => remote,
                None => return Ok(()),
            },
            _ => return Err(TransportError::ConnectionClosed),
        };

        let far = hub
            .handles
            .get_mut(&remote)
            .ok_or(TransportError::ConnectionClosed)?;
        let owner = far.owner;
        let peer = far.peer;
        let mut announce = None;
        if let HandleKind::Link {
            announced,
            listener: Some(listener),
            ..
        } = &mut far.kind
        {
            if !*announced {
                *announced = true;
                announce = Some(*listener);
            }
        }

        if let (Some(listener), Some(peer)) = (announce, peer) {
            hub.push(
                owner,
                TransportEvent::Accepted {
                    listener,
                    conn: remote,
                    peer,
                },
            );
        }
        hub.deliver(owner, remote, data);
        Ok(())
    }

    fn shutdown(&mut self, conn: ConnectionId) -> Result<(), TransportError> {
        let mut hub = self.network.hub.borrow_mut();
        if self.owned(&hub, conn).is_none() {
            return Err(TransportError::UnknownConnection(conn.0));
        }
        hub.drop_handle(conn);
        hub.push(self.endpoint, TransportEvent::Closed { conn });
        Ok(())
    }

    fn close(&mut self, conn: ConnectionId) {
        let mut hub = self.network.hub.borrow_mut();
        if self.owned(&hub, conn).is_none() {
            return;
        }
        hub.drop_handle(conn);
        hub.purge(self.endpoint, conn);
    }

    fn peer_addr(&self, conn: ConnectionId) -> Option<SocketAddr> {
        let hub = self.network.hub.borrow();
        self.owned(&hub, conn).and_then(|handle| handle.peer)
    }

    fn local_addr(&self, conn: ConnectionId) -> Option<SocketAddr> {
        let hub = self.network.hub.borrow();
        self.owned(&hub, conn).map(|handle| handle.local)
    }

    fn reset(&mut self) {
        let mut hub = self.network.hub.borrow_mut();
        let owned: Vec<_> = hub
            .handles
            .iter()
            .filter(|(_, handle)| handle.owner == self.endpoint)
            .map(|(conn, _)| *conn)
            .collect();
        for conn in owned {
            hub.drop_handle(conn);
        }
        hub.queues.remove(&self.endpoint);
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.reset();
    }
}
