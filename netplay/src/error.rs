use crate::connection_manager::SocketId;
use protocol::ProtocolError;
use std::io;
use thiserror::Error;

/// Errors surfaced by connections and the connection manager.
#[derive(Debug, Error)]
pub enum NetError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The readiness wait itself failed; the socket layer may be unusable.
    #[error("readiness wait failed: {0}")]
    Poll(#[source] io::Error),

    /// Asking a socket how many bytes are pending failed.
    #[error("byte availability query failed on socket {id}: {source}")]
    Query {
        id: SocketId,
        #[source]
        source: io::Error,
    },

    #[error("no socket {0} on this connection")]
    UnknownSocket(SocketId),

    #[error("connection is not connected")]
    NotConnected,

    /// `listen` or `connect` was called on a connection that is already listening.
    #[error("connection is already listening")]
    AlreadyListening,

    /// `listen` was called on a connection that has, or is opening, a peer.
    #[error("connection already has an outgoing peer")]
    AlreadyConnected,

    #[error("could not resolve address {0}")]
    Resolve(String),

    /// The manager's reaper has stopped; no new connect attempts are accepted.
    #[error("connection manager is shut down")]
    ShutDown,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
