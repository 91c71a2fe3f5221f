//! Tunnels.
//!
//! A tunnel owns the configuration shared by its links and the registry they
//! live in. Links are created when the tunnel accepts a transport and are
//! looked up again by remote identity when a device reconnects.

use crate::bus::Bus;
use crate::heartbeat::{HeartbeatConfig, HeartbeatFilter};
use crate::link::{Link, LinkError, LinkId};
use dashmap::DashMap;
use linkhub_transport::Transport;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// A tunnel identifier.
pub type TunnelId = u64;

/// Tunnel errors.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// No link with this id.
    #[error("Link not found: {0}")]
    LinkNotFound(LinkId),

    /// Link operation failed.
    #[error(transparent)]
    Link(#[from] LinkError),
}

/// Configuration shared by every link of a tunnel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Heartbeat suppression policy.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Maximum queued writes per closed link; `None` is unbounded.
    /// When full, the oldest queued write is dropped.
    #[serde(default)]
    pub pending_limit: Option<usize>,
}

/// A group of device links sharing one configuration and one bus.
pub struct Tunnel {
    id: TunnelId,
    name: String,
    config: Arc<TunnelConfig>,
    heartbeat: Arc<HeartbeatFilter>,
    bus: Arc<dyn Bus>,
    links: DashMap<LinkId, Arc<Link>>,
    next_link_id: AtomicU64,
}

impl Tunnel {
    /// Create a tunnel.
    #[must_use]
    pub fn new(id: TunnelId, name: impl Into<String>, config: TunnelConfig, bus: Arc<dyn Bus>) -> Self {
        let name = name.into();
        info!(tunnel = id, name = %name, "Creating tunnel");
        let heartbeat = Arc::new(HeartbeatFilter::new(&config.heartbeat));
        Self {
            id,
            name,
            config: Arc::new(config),
            heartbeat,
            bus,
            links: DashMap::new(),
            next_link_id: AtomicU64::new(1),
        }
    }

    #[must_use]
    pub fn id(&self) -> TunnelId {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    /// Create a link for a newly accepted transport.
    pub fn open_link(&self, transport: Box<dyn Transport>, remote_key: Option<String>) -> Arc<Link> {
        let id = self.next_link_id.fetch_add(1, Ordering::Relaxed);
        let mut link = Link::with_filter(
            id,
            self.id,
            self.config.clone(),
            self.heartbeat.clone(),
            self.bus.clone(),
            Some(transport),
        );
        if let Some(key) = remote_key {
            link = link.with_remote_key(key);
        }

        let link = Arc::new(link);
        self.links.insert(id, link.clone());
        debug!(
            tunnel = self.id,
            link = id,
            remote = ?link.remote_key(),
            links = self.links.len(),
            "Link opened"
        );
        link
    }

    /// Resume the closed link of the same remote, or open a new one.
    ///
    /// A remote key shared by more than one registered link does not
    /// identify a device, so it never resumes anything. Returns the link and
    /// whether it was resumed.
    pub async fn resume_or_open(
        &self,
        transport: Box<dyn Transport>,
        remote_key: &str,
    ) -> (Arc<Link>, bool) {
        // Collect first: no DashMap guard may be held across an await
        let candidates: Vec<Arc<Link>> = self
            .links
            .iter()
            .filter(|entry| entry.remote_key() == Some(remote_key))
            .map(|entry| entry.value().clone())
            .collect();

        let transport = match candidates.as_slice() {
            [link] => match link.try_resume(transport).await {
                Ok(replayed) => {
                    debug!(tunnel = self.id, link = link.id(), replayed, "Link resumed by remote");
                    return (link.clone(), true);
                }
                Err(returned) => returned,
            },
            [] => transport,
            _ => {
                warn!(
                    tunnel = self.id,
                    remote = %remote_key,
                    links = candidates.len(),
                    "Remote key matches several links, not resuming"
                );
                transport
            }
        };

        (self.open_link(transport, Some(remote_key.to_string())), false)
    }

    /// Get a link by id.
    #[must_use]
    pub fn link(&self, id: LinkId) -> Option<Arc<Link>> {
        self.links.get(&id).map(|l| l.value().clone())
    }

    /// Attach `peer_id` as the pass-through target of `link_id`.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::LinkNotFound`] if either link is unknown.
    pub async fn bridge(&self, link_id: LinkId, peer_id: LinkId) -> Result<(), TunnelError> {
        let link = self.link(link_id).ok_or(TunnelError::LinkNotFound(link_id))?;
        let peer = self.link(peer_id).ok_or(TunnelError::LinkNotFound(peer_id))?;
        link.attach(&peer).await;
        Ok(())
    }

    /// Remove a link from the registry.
    pub fn remove_link(&self, id: LinkId) -> Option<Arc<Link>> {
        let removed = self.links.remove(&id).map(|(_, link)| link);
        if removed.is_some() {
            debug!(tunnel = self.id, link = id, "Link removed");
        }
        removed
    }

    /// Remove links that have been closed for at least `retention`.
    ///
    /// Reaped links are never resumed, and their queued writes are
    /// discarded. Returns how many links were removed.
    pub async fn reap_closed(&self, retention: Duration) -> usize {
        let mut reaped = 0;
        for link in self.links() {
            if link.reap(retention).await {
                self.links.remove(&link.id());
                reaped += 1;
            }
        }
        if reaped > 0 {
            debug!(tunnel = self.id, reaped, links = self.links.len(), "Reaped closed links");
        }
        reaped
    }

    /// All links, in no particular order.
    #[must_use]
    pub fn links(&self) -> Vec<Arc<Link>> {
        self.links.iter().map(|l| l.value().clone()).collect()
    }

    #[must_use]
    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// Close every open link. Returns how many were closed.
    pub async fn close_all(&self) -> usize {
        let mut closed = 0;
        for link in self.links() {
            match link.close().await {
                Ok(()) => closed += 1,
                Err(LinkError::AlreadyClosed) => {}
                Err(e) => {
                    closed += 1;
                    debug!(tunnel = self.id, link = link.id(), error = %e, "Close failed");
                }
            }
        }
        info!(tunnel = self.id, closed, "Closed all links");
        closed
    }
}
