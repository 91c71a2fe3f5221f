//! # linkhub-transport
//!
//! Transport abstraction layer for Linkhub device links.
//!
//! A link only ever needs the outbound half of a device connection: it writes
//! bytes and eventually closes. Reading is driven by whoever accepted the
//! connection, which feeds inbound payloads into the link.
//!
//! - **TCP** - duplex byte stream, split into a reader and a [`Transport`]
//! - **UDP** - datagram socket bound to a fixed peer address
//! - **Memory** - recording transport for tests and benchmarks
//!
//! ```rust,ignore
//! use linkhub_transport::{tcp, Transport};
//!
//! let (reader, mut transport) = tcp::split(stream);
//! transport.write(b"hello").await?;
//! ```

pub mod memory;
pub mod tcp;
pub mod traits;
pub mod udp;

pub use memory::{MemoryHandle, MemoryTransport};
pub use tcp::TcpTransport;
pub use traits::{Transport, TransportError};
pub use udp::UdpTransport;
