//! # linkhub-core
//!
//! The per-link forwarding engine of Linkhub.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Link** - One device connection: heartbeat filtering, write buffering,
//!   replay on reconnect and exclusive peer/listener dispatch
//! - **Tunnel** - Configuration owner and registry for a group of links
//! - **Broker** - In-process topic pub/sub implementing the [`Bus`]
//! - **Heartbeat** - Tunnel-level heartbeat suppression rules
//!
//! ## Architecture
//!
//! ```text
//!                 ┌─────────────┐
//!  device bytes ─▶│    Link     │──▶ peer Link (pass-through)
//!                 │  heartbeat  │──▶ listener callback
//!                 │  dispatch   │
//!                 └─────────────┘
//!                        │ recv / send / event
//!                        ▼
//!                 ┌─────────────┐
//!                 │     Bus     │
//!                 └─────────────┘
//! ```

pub mod broker;
pub mod bus;
pub mod dispatch;
pub mod heartbeat;
pub mod link;
pub mod message;
pub mod topic;
pub mod tunnel;

pub use broker::{Broker, BrokerConfig, BrokerError, BrokerStats};
pub use bus::Bus;
pub use dispatch::{DispatchTarget, Listener};
pub use heartbeat::{HeartbeatConfig, HeartbeatError, HeartbeatFilter};
pub use link::{Link, LinkError, LinkId};
pub use message::Publication;
pub use topic::{LinkTopic, LinkTopics};
pub use tunnel::{Tunnel, TunnelConfig, TunnelError, TunnelId};
