//! Readiness loop shared by every connection of one netplay session
//!
//! The manager owns the OS poller, the set of sockets to watch, the queue of
//! pending notifications and the reaper that joins connect workers. It is a
//! cheap handle: clones share the same state, and each [`Connection`] keeps one.
//!
//! Sockets are added to and removed from a *desired* set at any time, from any
//! thread. Each [`check`](ConnectionManager::check) first copies the desired
//! set into the *active* set it actually polls, so a socket added during a
//! pass is watched from the next pass on, and a removed one is ignored even if
//! the current pass already reported it ready.

use crate::config::NetConfig;
use crate::connection::{Connection, ConnectionShared, SocketRole};
use crate::error::NetError;
use crate::owner::{ConnectionEvent, ConnectionOwner, Notification};
use crate::reaper::Reaper;
use log::{debug, warn};
use mio::{Events, Poll, Registry, Token};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;

/// Opaque handle for one OS socket owned by a connection
///
/// Ids are allocated by the manager, start at 1 and are never reused within a
/// manager's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(u32);

impl SocketId {
    pub fn get(self) -> u32 {
        self.0
    }

    fn token(self) -> Token {
        Token(self.0 as usize)
    }

    fn from_token(token: Token) -> Option<Self> {
        u32::try_from(token.0).ok().filter(|&raw| raw != 0).map(SocketId)
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

type Watched = BTreeMap<SocketId, Weak<ConnectionShared>>;
type Pending = (Weak<ConnectionShared>, ConnectionEvent);

struct Poller {
    poll: Poll,
    events: Events,
    registered: HashSet<SocketId>,
}

#[derive(Default)]
struct SocketSets {
    desired: Watched,
    active: Watched,
}

/// Readiness reported for one socket
#[derive(Debug, Clone, Copy)]
struct Readiness {
    id: SocketId,
    readable: bool,
    writable: bool,
}

struct ManagerShared {
    config: NetConfig,
    registry: Registry,
    poller: Mutex<Poller>,
    sets: Mutex<SocketSets>,
    next_id: AtomicU32,
    pending_tx: mpsc::UnboundedSender<Pending>,
    pending_rx: Mutex<mpsc::UnboundedReceiver<Pending>>,
    reaper: Reaper,
}

impl Drop for ManagerShared {
    fn drop(&mut self) {
        self.reaper.stop();
    }
}

/// Shared readiness loop and socket registry for a set of connections
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<ManagerShared>,
}

impl ConnectionManager {
    pub fn new() -> Result<Self, NetError> {
        Self::with_config(NetConfig::default())
    }

    /// Creates a manager with its own poller and reaper thread
    pub fn with_config(config: NetConfig) -> Result<Self, NetError> {
        let poll = Poll::new().map_err(NetError::Poll)?;
        let registry = poll.registry().try_clone().map_err(NetError::Poll)?;
        let events = Events::with_capacity(config.events_capacity.max(1));
        let (pending_tx, pending_rx) = mpsc::unbounded_channel();

        Ok(Self {
            shared: Arc::new(ManagerShared {
                config,
                registry,
                poller: Mutex::new(Poller {
                    poll,
                    events,
                    registered: HashSet::new(),
                }),
                sets: Mutex::new(SocketSets::default()),
                next_id: AtomicU32::new(1),
                pending_tx,
                pending_rx: Mutex::new(pending_rx),
                reaper: Reaper::start()?,
            }),
        })
    }

    pub fn config(&self) -> &NetConfig {
        &self.shared.config
    }

    /// Runs one readiness pass and delivers what it produced to `owner`.
    ///
    /// Waits at most `timeout` (forever for `None`) for any watched socket to
    /// become ready, dispatches every ready socket to its connection, then
    /// hands the queued notifications to `owner`. Returns how many were
    /// delivered. Poll failures and failed byte-availability queries are
    /// returned as errors; everything else is handled per socket.
    pub fn check(
        &self,
        timeout: Option<Duration>,
        owner: &mut dyn ConnectionOwner,
    ) -> Result<usize, NetError> {
        let watched = self.reconcile();
        if watched.is_empty() {
            return Ok(0);
        }

        let ready = self.poll(&watched, timeout)?;
        if ready.is_empty() {
            return Ok(self.deliver(owner));
        }

        for readiness in ready {
            // skip anything removed since the pass began
            let Some(connection) = self.lookup(readiness.id) else {
                continue;
            };
            self.dispatch(&connection, readiness)?;
        }

        Ok(self.deliver(owner))
    }

    /// [`check`](Self::check) with the configured poll timeout
    pub fn tick(&self, owner: &mut dyn ConnectionOwner) -> Result<usize, NetError> {
        self.check(Some(self.shared.config.poll_timeout), owner)
    }

    /// Drops every socket from both the desired and the active set
    pub fn clear(&self) {
        let mut sets = self.shared.sets.lock();
        sets.desired.clear();
        sets.active.clear();
        debug!("Cleared all watched sockets");
    }

    /// Number of sockets that will be watched on the next pass
    pub fn len(&self) -> usize {
        self.shared.sets.lock().desired.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_watched(&self, id: SocketId) -> bool {
        self.shared.sets.lock().desired.contains_key(&id)
    }

    /// Stops the reaper after joining every connect worker started so far.
    ///
    /// Further `connect` calls on this manager's connections fail with
    /// [`NetError::ShutDown`]. Also runs when the last handle is dropped.
    pub fn shutdown(&self) {
        self.shared.reaper.shutdown();
    }

    pub fn spawned_connects(&self) -> usize {
        self.shared.reaper.spawned()
    }

    pub fn reaped_connects(&self) -> usize {
        self.shared.reaper.reaped()
    }

    pub(crate) fn add(&self, id: SocketId, connection: Weak<ConnectionShared>) {
        self.shared.sets.lock().desired.insert(id, connection);
    }

    pub(crate) fn remove(&self, id: SocketId) {
        self.shared.sets.lock().desired.remove(&id);
    }

    pub(crate) fn allocate_id(&self) -> SocketId {
        SocketId(self.shared.next_id.fetch_add(1, Ordering::SeqCst))
    }

    pub(crate) fn registry(&self) -> &Registry {
        &self.shared.registry
    }

    pub(crate) fn reaper(&self) -> &Reaper {
        &self.shared.reaper
    }

    pub(crate) fn notify(&self, connection: Weak<ConnectionShared>, event: ConnectionEvent) {
        // the receiver lives as long as the sender, so this cannot fail
        let _ = self.shared.pending_tx.send((connection, event));
    }

    /// Brings the active set in line with the desired set and returns the
    /// live connections behind it.
    fn reconcile(&self) -> Vec<(SocketId, Connection)> {
        let mut sets = self.shared.sets.lock();
        let SocketSets { desired, active } = &mut *sets;

        desired.retain(|id, connection| {
            let alive = connection.strong_count() > 0;
            if !alive {
                debug!("Socket {} belongs to a dropped connection", id);
            }
            alive
        });

        active.retain(|id, _| {
            let keep = desired.contains_key(id);
            if !keep {
                debug!("Socket {} removed from poll set", id);
            }
            keep
        });

        for (id, connection) in desired.iter() {
            if !active.contains_key(id) {
                debug!("Socket {} added to poll set", id);
                active.insert(*id, connection.clone());
            }
        }

        active
            .iter()
            .filter_map(|(id, connection)| {
                connection
                    .upgrade()
                    .map(|shared| (*id, Connection::from_shared(shared)))
            })
            .collect()
    }

    fn poll(
        &self,
        watched: &[(SocketId, Connection)],
        timeout: Option<Duration>,
    ) -> Result<Vec<Readiness>, NetError> {
        let mut poller = self.shared.poller.lock();
        let Poller {
            poll,
            events,
            registered,
        } = &mut *poller;

        registered.retain(|id| watched.iter().any(|(watched_id, _)| watched_id == id));

        for (id, connection) in watched {
            let known = registered.contains(id);
            match connection.register(*id, poll.registry(), id.token(), known) {
                Ok(true) => {
                    registered.insert(*id);
                }
                Ok(false) => {
                    registered.remove(id);
                }
                Err(err) => {
                    warn!("Failed to register socket {}: {}", id, err);
                    registered.remove(id);
                }
            }
        }

        match poll.poll(events, timeout) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => return Ok(Vec::new()),
            Err(err) => return Err(NetError::Poll(err)),
        }

        Ok(events
            .iter()
            .filter_map(|event| {
                SocketId::from_token(event.token()).map(|id| Readiness {
                    id,
                    readable: event.is_readable() || event.is_read_closed() || event.is_error(),
                    writable: event.is_writable() || event.is_write_closed() || event.is_error(),
                })
            })
            .collect())
    }

    fn lookup(&self, id: SocketId) -> Option<Connection> {
        let shared = self.shared.sets.lock().desired.get(&id)?.upgrade()?;
        Some(Connection::from_shared(shared))
    }

    fn dispatch(&self, connection: &Connection, readiness: Readiness) -> Result<(), NetError> {
        let Readiness {
            id,
            readable,
            writable,
        } = readiness;

        match connection.role(id) {
            None => {}
            Some(SocketRole::Connecting) => {
                if writable {
                    debug!("Socket {} connect ready", id);
                    connection.connect_event(id);
                }
            }
            Some(SocketRole::Listener) => {
                if readable {
                    debug!("Socket {} accept ready", id);
                    connection.accept_event(id);
                }
            }
            Some(SocketRole::Stream) => {
                if writable {
                    connection.flush_event(id);
                }
                if readable {
                    match connection.peek(id) {
                        None => {}
                        Some(Ok(0)) => {
                            debug!("Socket {} closed by peer", id);
                            connection.disconnect_event(id);
                        }
                        Some(Ok(_)) => {
                            debug!("Socket {} read ready", id);
                            connection.read_event(id);
                        }
                        Some(Err(err)) if err.kind() == io::ErrorKind::WouldBlock => {}
                        Some(Err(err)) if is_reset(&err) => {
                            debug!("Socket {} reset: {}", id, err);
                            connection.disconnect_event(id);
                        }
                        Some(Err(source)) => return Err(NetError::Query { id, source }),
                    }
                }
            }
            Some(SocketRole::Datagram) => {
                if readable {
                    debug!("Socket {} datagram ready", id);
                    connection.read_event(id);
                }
            }
        }

        Ok(())
    }

    fn deliver(&self, owner: &mut dyn ConnectionOwner) -> usize {
        let queued: Vec<Pending> = {
            let mut pending = self.shared.pending_rx.lock();
            std::iter::from_fn(|| pending.try_recv().ok()).collect()
        };

        let mut delivered = 0;
        for (connection, event) in queued {
            let Some(shared) = connection.upgrade() else {
                debug!("Dropping {:?} for a released connection", event);
                continue;
            };
            owner.notify(Notification {
                connection: Connection::from_shared(shared),
                event,
            });
            delivered += 1;
        }
        delivered
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("watched", &self.len())
            .field("spawned_connects", &self.spawned_connects())
            .field("reaped_connects", &self.reaped_connects())
            .finish()
    }
}

pub(crate) fn is_reset(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted | io::ErrorKind::BrokenPipe
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_socket_id_display() {
        assert_eq!(SocketId(0x2a).to_string(), "0000002a");
        assert_eq!(SocketId(0xdeadbeef).to_string(), "deadbeef");
    }

    #[test]
    fn test_socket_id_token_round_trip() {
        let id = SocketId(77);
        assert_eq!(SocketId::from_token(id.token()), Some(id));
        assert_eq!(SocketId::from_token(Token(0)), None);
    }

    #[test]
    fn test_ids_are_unique_and_increasing() {
        let manager = ConnectionManager::new().unwrap();
        let first = manager.allocate_id();
        let second = manager.allocate_id();
        let third = manager.clone().allocate_id();

        assert_eq!(first.get(), 1);
        assert!(first < second && second < third);
    }

    #[test]
    fn test_empty_check_returns_immediately() {
        let manager = ConnectionManager::new().unwrap();
        let mut seen: Vec<Notification> = Vec::new();

        let start = Instant::now();
        let delivered = manager.check(Some(Duration::from_secs(5)), &mut seen).unwrap();

        assert_eq!(delivered, 0);
        assert!(seen.is_empty());
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_add_and_remove_touch_desired_set() {
        let manager = ConnectionManager::new().unwrap();
        let id = manager.allocate_id();

        manager.add(id, Weak::new());
        assert!(manager.is_watched(id));
        assert_eq!(manager.len(), 1);

        manager.remove(id);
        assert!(!manager.is_watched(id));
        assert!(manager.is_empty());
    }

    #[test]
    fn test_dropped_connections_are_pruned() {
        let manager = ConnectionManager::new().unwrap();
        let id = manager.allocate_id();
        manager.add(id, Weak::new());

        let mut seen: Vec<Notification> = Vec::new();
        assert_eq!(manager.check(Some(Duration::ZERO), &mut seen).unwrap(), 0);
        assert!(!manager.is_watched(id));
    }

    #[test]
    fn test_clear_empties_sets() {
        let manager = ConnectionManager::new().unwrap();
        for _ in 0..3 {
            let id = manager.allocate_id();
            manager.add(id, Weak::new());
        }
        assert_eq!(manager.len(), 3);

        manager.clear();
        assert!(manager.is_empty());
    }

    #[test]
    fn test_reset_kinds() {
        assert!(is_reset(&io::Error::from(io::ErrorKind::ConnectionReset)));
        assert!(is_reset(&io::Error::from(io::ErrorKind::BrokenPipe)));
        assert!(!is_reset(&io::Error::from(io::ErrorKind::WouldBlock)));
    }
}
