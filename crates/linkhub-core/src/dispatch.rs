//! Where a link delivers inbound payloads.
//!
//! A link routes to at most one consumer: a peer link (raw pass-through) or
//! an in-process listener. While a peer is attached, a listener installed
//! earlier is parked inside the peer variant and comes back when the peer is
//! detached or the link closes.

use crate::link::Link;
use bytes::Bytes;
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::warn;

/// An in-process consumer of a link's inbound data.
pub type Listener = Arc<dyn Fn(Bytes) + Send + Sync>;

/// The dispatch target of a link.
#[derive(Clone, Default)]
pub enum DispatchTarget {
    /// Inbound data only goes to the bus.
    #[default]
    None,
    /// Inbound data goes to a listener.
    Listener(Listener),
    /// Inbound data is passed through to another link.
    Peer {
        peer: Weak<Link>,
        parked: Option<Listener>,
    },
}

/// The resolved destination for one inbound payload.
pub(crate) enum Route {
    Peer(Arc<Link>),
    Listener(Listener),
    BusOnly,
}

impl DispatchTarget {
    /// Install a peer, keeping any listener parked.
    pub fn attach(&mut self, peer: Weak<Link>) {
        let parked = match std::mem::take(self) {
            Self::None => None,
            Self::Listener(listener) => Some(listener),
            Self::Peer { parked, .. } => parked,
        };
        *self = Self::Peer { peer, parked };
    }

    /// Clear the peer. Returns `true` if one was set.
    pub fn detach(&mut self) -> bool {
        match std::mem::take(self) {
            Self::Peer { parked, .. } => {
                *self = parked.map_or(Self::None, Self::Listener);
                true
            }
            other => {
                *self = other;
                false
            }
        }
    }

    /// Install or replace the listener without touching an attached peer.
    pub fn listen(&mut self, listener: Listener) {
        match self {
            Self::Peer { parked, .. } => *parked = Some(listener),
            _ => *self = Self::Listener(listener),
        }
    }

    /// Whether a peer is attached.
    #[must_use]
    pub fn has_peer(&self) -> bool {
        matches!(self, Self::Peer { .. })
    }

    /// Whether a listener is installed, active or parked.
    #[must_use]
    pub fn has_listener(&self) -> bool {
        match self {
            Self::None => false,
            Self::Listener(_) => true,
            Self::Peer { parked, .. } => parked.is_some(),
        }
    }

    /// Resolve the destination in priority order: peer, listener, bus.
    ///
    /// A peer that has been dropped is cleared here.
    pub(crate) fn route(&mut self) -> Route {
        if let Self::Peer { peer, .. } = self {
            if let Some(peer) = peer.upgrade() {
                return Route::Peer(peer);
            }
            warn!("Peer link dropped, detaching");
            self.detach();
        }

        match self {
            Self::Listener(listener) => Route::Listener(listener.clone()),
            _ => Route::BusOnly,
        }
    }
}

impl fmt::Debug for DispatchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Listener(_) => f.write_str("Listener"),
            Self::Peer { peer, parked } => f
                .debug_struct("Peer")
                .field("link", &peer.upgrade().map(|l| l.id()))
                .field("parked_listener", &parked.is_some())
                .finish(),
        }
    }
}
