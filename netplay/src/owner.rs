//! Callbacks fired by [`ConnectionManager::check`](crate::ConnectionManager::check).
//!
//! Socket handlers never call back into the application directly. They queue a
//! [`Notification`] and the manager hands the queue to a [`ConnectionOwner`]
//! once the readiness pass is over, with no connection lock held. Owners are
//! therefore free to send, disconnect or drop connections from a callback.

use crate::connection::Connection;
use crate::connection_manager::SocketId;
use std::net::SocketAddr;

/// What happened on a socket during a readiness pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// An outgoing connect completed
    Connected { id: SocketId },
    /// The listener accepted a new child connection
    Accepted { id: SocketId },
    /// The peer went away; the socket has already been released
    Disconnected { id: SocketId },
    /// Bytes arrived on a stream or a datagram socket
    Read {
        id: SocketId,
        data: Vec<u8>,
        from: SocketAddr,
    },
}

impl ConnectionEvent {
    pub fn id(&self) -> SocketId {
        match self {
            ConnectionEvent::Connected { id }
            | ConnectionEvent::Accepted { id }
            | ConnectionEvent::Disconnected { id }
            | ConnectionEvent::Read { id, .. } => *id,
        }
    }
}

/// An event together with the connection it belongs to
#[derive(Debug, Clone)]
pub struct Notification {
    pub connection: Connection,
    pub event: ConnectionEvent,
}

/// Receives connection events.
///
/// Every method has an empty default so owners only implement what they use.
/// [`notify`](ConnectionOwner::notify) routes a [`Notification`] to the
/// matching method; override it to see events in raw form instead.
pub trait ConnectionOwner {
    fn connected(&mut self, _connection: &Connection, _id: SocketId) {}

    fn accepted(&mut self, _connection: &Connection, _id: SocketId) {}

    fn disconnected(&mut self, _connection: &Connection, _id: SocketId) {}

    fn read(&mut self, _connection: &Connection, _id: SocketId, _data: &[u8], _from: SocketAddr) {}

    fn notify(&mut self, notification: Notification) {
        let Notification { connection, event } = notification;
        match event {
            ConnectionEvent::Connected { id } => self.connected(&connection, id),
            ConnectionEvent::Accepted { id } => self.accepted(&connection, id),
            ConnectionEvent::Disconnected { id } => self.disconnected(&connection, id),
            ConnectionEvent::Read { id, data, from } => self.read(&connection, id, &data, from),
        }
    }
}

/// Collects notifications as they are delivered
impl ConnectionOwner for Vec<Notification> {
    fn notify(&mut self, notification: Notification) {
        self.push(notification);
    }
}
