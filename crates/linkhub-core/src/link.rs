//! Device links.
//!
//! A link is the forwarding state of one device connection inside a tunnel.
//! It filters heartbeats, routes inbound payloads to a peer or listener,
//! buffers writes while the device is away and replays them on resume.
//!
//! All mutable state sits behind one async mutex per link. Inbound dispatch
//! releases it before calling the peer or listener, so two links bridged to
//! each other never wait on one another's lock.

use crate::bus::Bus;
use crate::dispatch::{DispatchTarget, Listener, Route};
use crate::heartbeat::HeartbeatFilter;
use crate::topic::LinkTopics;
use crate::tunnel::{TunnelConfig, TunnelId};
use bytes::Bytes;
use linkhub_transport::{Transport, TransportError};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// A link identifier, unique within its tunnel.
pub type LinkId = u64;

/// Payload published on the event topic when a link closes.
pub const CLOSE_EVENT: &[u8] = b"close";

/// Link errors.
#[derive(Debug, Error)]
pub enum LinkError {
    /// Close called on a link without a transport.
    #[error("Link already closed")]
    AlreadyClosed,

    /// Write called on a link without a transport; the payload was queued.
    #[error("Link closed, payload queued for resume")]
    LinkClosed,

    /// Write called on a link without a transport while queueing is
    /// disabled; the payload is gone.
    #[error("Link closed and queueing disabled, payload dropped")]
    Dropped,

    /// The transport accepted only part of the payload.
    #[error("Partial write: {written} of {expected} bytes")]
    PartialWrite { written: usize, expected: usize },

    /// Transport failure.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

struct LinkState {
    transport: Option<Box<dyn Transport>>,
    pending: VecDeque<Bytes>,
    dispatch: DispatchTarget,
    last_active: Option<Instant>,
    closed_since: Option<Instant>,
    reaped: bool,
}

/// One device connection bound to a tunnel.
pub struct Link {
    id: LinkId,
    tunnel_id: TunnelId,
    remote_key: Option<String>,
    config: Arc<TunnelConfig>,
    heartbeat: Arc<HeartbeatFilter>,
    bus: Arc<dyn Bus>,
    topics: LinkTopics,
    active: AtomicBool,
    state: Mutex<LinkState>,
}

impl Link {
    /// Create a link. Without a transport the link starts closed.
    #[must_use]
    pub fn new(
        id: LinkId,
        tunnel_id: TunnelId,
        config: Arc<TunnelConfig>,
        bus: Arc<dyn Bus>,
        transport: Option<Box<dyn Transport>>,
    ) -> Self {
        let heartbeat = Arc::new(HeartbeatFilter::new(&config.heartbeat));
        Self::with_filter(id, tunnel_id, config, heartbeat, bus, transport)
    }

    /// Create a link sharing an already decoded heartbeat filter.
    pub(crate) fn with_filter(
        id: LinkId,
        tunnel_id: TunnelId,
        config: Arc<TunnelConfig>,
        heartbeat: Arc<HeartbeatFilter>,
        bus: Arc<dyn Bus>,
        transport: Option<Box<dyn Transport>>,
    ) -> Self {
        let closed_since = transport.is_none().then(Instant::now);
        Self {
            id,
            tunnel_id,
            remote_key: None,
            config,
            heartbeat,
            bus,
            topics: LinkTopics::new(tunnel_id, id),
            active: AtomicBool::new(true),
            state: Mutex::new(LinkState {
                transport,
                pending: VecDeque::new(),
                dispatch: DispatchTarget::None,
                last_active: None,
                closed_since,
                reaped: false,
            }),
        }
    }

    /// Set the remote identity used to find this link again on reconnect.
    #[must_use]
    pub fn with_remote_key(mut self, key: impl Into<String>) -> Self {
        self.remote_key = Some(key.into());
        self
    }

    #[must_use]
    pub fn id(&self) -> LinkId {
        self.id
    }

    #[must_use]
    pub fn tunnel_id(&self) -> TunnelId {
        self.tunnel_id
    }

    #[must_use]
    pub fn remote_key(&self) -> Option<&str> {
        self.remote_key.as_deref()
    }

    #[must_use]
    pub fn topics(&self) -> &LinkTopics {
        &self.topics
    }

    /// Whether the link record is operationally live.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }

    /// Whether a transport is installed.
    pub async fn is_open(&self) -> bool {
        self.state.lock().await.transport.is_some()
    }

    /// Number of writes waiting for a transport.
    pub async fn pending_len(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    /// When the link last carried non-heartbeat traffic.
    pub async fn last_active(&self) -> Option<Instant> {
        self.state.lock().await.last_active
    }

    /// How long the link has been without a transport, if it is closed.
    pub async fn closed_for(&self) -> Option<Duration> {
        self.state.lock().await.closed_since.map(|t| t.elapsed())
    }

    pub async fn has_peer(&self) -> bool {
        self.state.lock().await.dispatch.has_peer()
    }

    pub async fn has_listener(&self) -> bool {
        self.state.lock().await.dispatch.has_listener()
    }

    /// Process a payload read from the device.
    ///
    /// Heartbeats are dropped silently. Anything else goes to the peer if one
    /// is attached, otherwise to the listener, and is always mirrored on the
    /// `recv` topic.
    pub async fn on_data(&self, payload: Bytes) {
        let route = {
            let mut state = self.state.lock().await;
            let since_active = state.last_active.map(|t| t.elapsed());
            if self.heartbeat.is_heartbeat(since_active, &payload) {
                trace!(tunnel = self.tunnel_id, link = self.id, "Heartbeat suppressed");
                return;
            }
            state.last_active = Some(Instant::now());
            state.dispatch.route()
        };

        match route {
            Route::Peer(peer) => match peer.write(payload.clone()).await {
                Ok(()) => {}
                Err(LinkError::LinkClosed) => {
                    debug!(tunnel = self.tunnel_id, link = self.id, peer = peer.id(), "Peer closed, payload queued");
                }
                Err(e) => {
                    warn!(tunnel = self.tunnel_id, link = self.id, peer = peer.id(), error = %e, "Pass-through write failed");
                }
            },
            Route::Listener(listener) => listener(payload.clone()),
            Route::BusOnly => {}
        }

        self.bus.publish(&self.topics.recv, payload);
    }

    /// Write a payload to the device.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::LinkClosed`] when there is no transport; the
    /// payload is then queued and delivered by the next [`resume`]. With a
    /// `pending_limit` of zero nothing is queued and [`LinkError::Dropped`]
    /// is returned instead. Transport failures and short writes are returned
    /// as they happen and not retried.
    ///
    /// [`resume`]: Link::resume
    pub async fn write(&self, payload: impl Into<Bytes>) -> Result<(), LinkError> {
        let mut state = self.state.lock().await;
        self.write_locked(&mut state, payload.into()).await
    }

    async fn write_locked(&self, state: &mut LinkState, payload: Bytes) -> Result<(), LinkError> {
        let Some(transport) = state.transport.as_mut() else {
            return if self.enqueue(state, payload) {
                Err(LinkError::LinkClosed)
            } else {
                Err(LinkError::Dropped)
            };
        };

        state.last_active = Some(Instant::now());
        let result = transport.write(&payload).await;
        self.bus.publish(&self.topics.send, payload.clone());

        match result {
            Ok(written) if written < payload.len() => Err(LinkError::PartialWrite {
                written,
                expected: payload.len(),
            }),
            Ok(_) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Queue a write for the next resume. Returns `false` if it was dropped.
    fn enqueue(&self, state: &mut LinkState, payload: Bytes) -> bool {
        if let Some(limit) = self.config.pending_limit {
            if limit == 0 {
                debug!(tunnel = self.tunnel_id, link = self.id, "Pending queue disabled, dropping write");
                return false;
            }
            while state.pending.len() >= limit {
                state.pending.pop_front();
                warn!(tunnel = self.tunnel_id, link = self.id, limit, "Pending queue full, dropped oldest write");
            }
        }
        state.pending.push_back(payload);
        trace!(tunnel = self.tunnel_id, link = self.id, pending = state.pending.len(), "Write queued");
        true
    }

    /// Install a new transport and replay queued writes in order.
    ///
    /// Replay is best effort: failed writes are logged and not queued again.
    /// The link lock is held throughout, so no other write can slip in
    /// between replayed payloads. Returns how many replayed writes succeeded.
    pub async fn resume(&self, transport: Box<dyn Transport>) -> usize {
        let mut state = self.state.lock().await;
        if let Some(mut old) = state.transport.take() {
            debug!(tunnel = self.tunnel_id, link = self.id, "Replacing open transport");
            if let Err(e) = old.close().await {
                debug!(tunnel = self.tunnel_id, link = self.id, error = %e, "Closing replaced transport failed");
            }
        }
        self.install_and_replay(&mut state, transport).await
    }

    /// Like [`resume`], but only if the link is closed and still registered.
    ///
    /// # Errors
    ///
    /// Hands the transport back if the link already has one or has been
    /// reaped from its tunnel.
    ///
    /// [`resume`]: Link::resume
    pub async fn try_resume(&self, transport: Box<dyn Transport>) -> Result<usize, Box<dyn Transport>> {
        let mut state = self.state.lock().await;
        if state.transport.is_some() || state.reaped {
            return Err(transport);
        }
        Ok(self.install_and_replay(&mut state, transport).await)
    }

    async fn install_and_replay(&self, state: &mut LinkState, transport: Box<dyn Transport>) -> usize {
        state.transport = Some(transport);
        state.closed_since = None;

        let pending = std::mem::take(&mut state.pending);
        let total = pending.len();
        let mut delivered = 0;
        for payload in pending {
            match self.write_locked(state, payload).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(tunnel = self.tunnel_id, link = self.id, error = %e, "Replay write failed");
                }
            }
        }

        debug!(tunnel = self.tunnel_id, link = self.id, replayed = total, delivered, "Link resumed");
        delivered
    }

    /// Close the transport.
    ///
    /// Clears the transport and the peer; the listener and the pending queue
    /// survive for a later resume. State is cleared even if closing the
    /// transport fails.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::AlreadyClosed`] without a transport, or the
    /// transport's close error.
    pub async fn close(&self) -> Result<(), LinkError> {
        let mut state = self.state.lock().await;
        let Some(mut transport) = state.transport.take() else {
            return Err(LinkError::AlreadyClosed);
        };
        state.closed_since = Some(Instant::now());
        state.dispatch.detach();

        let result = transport.close().await;
        self.bus.publish(&self.topics.event, Bytes::from_static(CLOSE_EVENT));
        debug!(tunnel = self.tunnel_id, link = self.id, "Link closed");

        result.map_err(LinkError::from)
    }

    /// Mark the link reaped if it has been closed for at least `retention`.
    ///
    /// A reaped link is never resumed by [`try_resume`] again. Any queued
    /// writes are discarded.
    ///
    /// [`try_resume`]: Link::try_resume
    pub(crate) async fn reap(&self, retention: Duration) -> bool {
        let mut state = self.state.lock().await;
        let expired = matches!(state.closed_since, Some(since) if since.elapsed() >= retention);
        if !expired || state.reaped {
            return false;
        }

        state.reaped = true;
        let dropped = std::mem::take(&mut state.pending).len();
        if dropped > 0 {
            warn!(tunnel = self.tunnel_id, link = self.id, dropped, "Reaped link with queued writes");
        }
        true
    }

    /// Pass inbound data through to `peer` instead of the listener.
    pub async fn attach(&self, peer: &Arc<Link>) {
        self.state.lock().await.dispatch.attach(Arc::downgrade(peer));
        debug!(tunnel = self.tunnel_id, link = self.id, peer = peer.id(), "Peer attached");
    }

    /// Stop passing data through. Returns `true` if a peer was attached.
    pub async fn detach(&self) -> bool {
        let detached = self.state.lock().await.dispatch.detach();
        if detached {
            debug!(tunnel = self.tunnel_id, link = self.id, "Peer detached");
        }
        detached
    }

    /// Install or replace the listener for inbound data.
    pub async fn listen<F>(&self, listener: F)
    where
        F: Fn(Bytes) + Send + Sync + 'static,
    {
        let listener: Listener = Arc::new(listener);
        self.state.lock().await.dispatch.listen(listener);
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("id", &self.id)
            .field("tunnel_id", &self.tunnel_id)
            .field("remote_key", &self.remote_key)
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}
