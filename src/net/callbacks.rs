//! Callback registry
//!
//! Three independent single-slot handlers. A handler is taken out of its
//! slot for the duration of a dispatch so it can receive `&mut Session`;
//! when it returns it is put back unless the slot was reassigned meanwhile.

use crate::net::codec::Frame;
use crate::net::session::Session;
use crate::net::transport::Transport;

/// `on_received(session, frame, size, peer)`
pub type ReceivedHandler<T> = Box<dyn FnMut(&mut Session<T>, &Frame, usize, &str)>;

/// `on_established(session, peer)`; `None` means the outbound connect failed
pub type EstablishedHandler<T> = Box<dyn FnMut(&mut Session<T>, Option<&str>)>;

/// `on_disconnected(session, peer)`
pub type DisconnectedHandler<T> = Box<dyn FnMut(&mut Session<T>, &str)>;

/// One replaceable handler
pub(crate) struct Slot<H> {
    handler: Option<H>,
    /// Bumped on every assignment
    generation: u64,
}

impl<H> Slot<H> {
    fn new() -> Self {
        Self {
            handler: None,
            generation: 0,
        }
    }

    pub(crate) fn set(&mut self, handler: Option<H>) {
        self.handler = handler;
        self.generation = self.generation.wrapping_add(1);
    }

    pub(crate) fn is_set(&self) -> bool {
        self.handler.is_some()
    }

    /// Take the handler out for a dispatch
    pub(crate) fn take(&mut self) -> Option<(H, u64)> {
        self.handler.take().map(|handler| (handler, self.generation))
    }

    /// Return a handler after its dispatch
    pub(crate) fn restore(&mut self, handler: H, generation: u64) {
        if self.generation == generation && self.handler.is_none() {
            self.handler = Some(handler);
        }
    }
}

/// Handlers owned by a session
pub struct CallbackRegistry<T: Transport> {
    pub(crate) received: Slot<ReceivedHandler<T>>,
    pub(crate) established: Slot<EstablishedHandler<T>>,
    pub(crate) disconnected: Slot<DisconnectedHandler<T>>,
}

impl<T: Transport> CallbackRegistry<T> {
    pub fn new() -> Self {
        Self {
            received: Slot::new(),
            established: Slot::new(),
            disconnected: Slot::new(),
        }
    }

    pub fn has_received(&self) -> bool {
        self.received.is_set()
    }

    pub fn has_established(&self) -> bool {
        self.established.is_set()
    }

    pub fn has_disconnected(&self) -> bool {
        self.disconnected.is_set()
    }

    /// Drop every handler
    pub fn clear(&mut self) {
        self.received.set(None);
        self.established.set(None);
        self.disconnected.set(None);
    }
}

impl<T: Transport> Default for CallbackRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}
