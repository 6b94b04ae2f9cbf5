//! # Netplay Transport
//!
//! This library carries encoded protocol frames between netplay peers. It owns
//! every socket of a session, waits for readiness on all of them at once and
//! reports what happened to the application through a small callback trait.
//!
//! ## Core Responsibilities
//!
//! ### Connections
//! A [`Connection`] is one endpoint of a session:
//! - As a host it listens for TCP peers and owns a UDP socket on the same port
//! - As a client it owns a single outgoing TCP stream
//! - Outgoing connects run on background worker threads and never block
//! - Accepted children can be dropped one by one, or everything at once
//!
//! ### Readiness Loop
//! The [`ConnectionManager`] polls every watched socket and routes readiness to
//! the owning connection: completed connects, incoming connections, data,
//! datagrams and peer closes. Sockets join and leave the watched set at any
//! time; changes take effect on the next pass.
//!
//! ### Notifications
//! Socket handlers never call the application directly. They queue
//! [`Notification`]s which `check()` hands to a [`ConnectionOwner`] after the
//! pass, when no connection lock is held. Callbacks may therefore send,
//! disconnect or drop connections freely.
//!
//! ## Architecture Design
//!
//! ### Single Driving Thread
//! Exactly one thread calls [`ConnectionManager::check`]. All accept, read and
//! disconnect dispatch happens there, in the order the poller reported it.
//!
//! ### Thread-per-Connect
//! Each connect attempt resolves and connects on its own named thread. The
//! thread's handle is queued to a reaper that joins it, so no attempt is ever
//! left unjoined, even when the connection was dropped meanwhile.
//!
//! ### Opaque Socket Ids
//! Sockets are identified by [`SocketId`]s allocated by the manager. Ids are
//! never reused, so a stale id can only miss, never hit a different socket.
//!
//! ## Module Organization
//!
//! ### Connection Module (`connection`)
//! Endpoint state, socket ownership and the per-socket event handlers.
//!
//! ### Connection Manager Module (`connection_manager`)
//! Watched socket sets, the poller and notification delivery.
//!
//! ### Owner Module (`owner`)
//! Notification types and the [`ConnectionOwner`] callback trait.
//!
//! ### Config and Error Modules (`config`, `error`)
//! [`NetConfig`] tunables and the [`NetError`] type.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use netplay::{Connection, ConnectionManager, ConnectionOwner, SocketId};
//! use protocol::{Codec, Message, Text};
//! use std::time::Duration;
//!
//! struct Greeter {
//!     codec: Codec,
//! }
//!
//! impl ConnectionOwner for Greeter {
//!     fn accepted(&mut self, connection: &Connection, id: SocketId) {
//!         let mut hello = Message::new(Text { text: "hello".into() });
//!         if let Ok(frame) = self.codec.encode(&mut hello) {
//!             let _ = connection.send(id, &frame);
//!         }
//!     }
//! }
//!
//! fn main() -> Result<(), netplay::NetError> {
//!     let manager = ConnectionManager::new()?;
//!     let host = Connection::new(&manager);
//!     host.listen(7000)?;
//!
//!     let mut owner = Greeter { codec: Codec::new() };
//!     loop {
//!         manager.check(Some(Duration::from_millis(16)), &mut owner)?;
//!     }
//! }
//! ```

pub mod config;
pub mod connection;
pub mod connection_manager;
pub mod error;
pub mod owner;
mod reaper;

pub use config::NetConfig;
pub use connection::{Connection, ConnectionState};
pub use connection_manager::{ConnectionManager, SocketId};
pub use error::NetError;
pub use owner::{ConnectionEvent, ConnectionOwner, Notification};
