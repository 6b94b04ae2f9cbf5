//! A netplay endpoint: listener, datagram socket, outgoing peer and accepted
//! children behind a single lock
//!
//! A connection plays one of two roles. As a server it owns a TCP listener, a
//! UDP socket bound to the same port and any number of accepted child streams.
//! As a client it owns exactly one outgoing TCP stream, opened by a background
//! worker so that [`Connection::connect`] never blocks the caller.
//!
//! Readiness handling (`*_event` methods) is driven exclusively by
//! [`ConnectionManager::check`]; the handlers only queue notifications, which
//! the manager delivers after the pass.

use crate::connection_manager::{is_reset, ConnectionManager, SocketId};
use crate::error::NetError;
use crate::owner::ConnectionEvent;
use log::{debug, info, warn};
use mio::event::Source;
use mio::net::{TcpListener, TcpStream, UdpSocket};
use mio::{Interest, Registry, Token};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Largest payload a single UDP datagram can carry
const MAX_DATAGRAM_SIZE: usize = 65_507;

/// What the manager should do with a ready socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SocketRole {
    /// Outgoing stream whose completion has not been reported yet
    Connecting,
    Listener,
    Stream,
    Datagram,
}

/// Lifecycle state derived from the sockets a connection currently holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Nothing opened yet
    Idle,
    /// Server role: listener and datagram socket are open
    Listening,
    /// A connect worker is running or the stream awaits its first write readiness
    Connecting,
    Connected,
    /// Everything was torn down by a disconnect
    Closed,
}

/// A TCP stream plus the bytes still waiting to go out on it
struct Stream {
    id: SocketId,
    socket: TcpStream,
    remote: SocketAddr,
    connecting: bool,
    outgoing: Vec<u8>,
}

impl Stream {
    fn new(id: SocketId, socket: TcpStream, remote: SocketAddr, connecting: bool) -> Self {
        Self {
            id,
            socket,
            remote,
            connecting,
            outgoing: Vec::new(),
        }
    }

    /// Writes queued bytes until the socket would block.
    fn flush(&mut self) -> io::Result<()> {
        while !self.outgoing.is_empty() {
            match self.socket.write(&self.outgoing) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(written) => {
                    self.outgoing.drain(..written);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    fn interest(&self) -> Interest {
        if self.connecting {
            Interest::WRITABLE
        } else if self.outgoing.is_empty() {
            Interest::READABLE
        } else {
            Interest::READABLE | Interest::WRITABLE
        }
    }
}

#[derive(Default)]
struct ConnectionInner {
    listener: Option<(SocketId, TcpListener)>,
    udp: Option<(SocketId, UdpSocket)>,
    tcp: Option<Stream>,
    accepted: BTreeMap<SocketId, Stream>,
    pending_connects: usize,
    closed: bool,
    /// Bumped on every full teardown; connect workers started before it lose
    epoch: u64,
}

impl ConnectionInner {
    fn stream_mut(&mut self, id: SocketId) -> Option<&mut Stream> {
        match self.tcp.as_mut() {
            Some(stream) if stream.id == id => Some(stream),
            _ => self.accepted.get_mut(&id),
        }
    }

    fn take_stream(&mut self, id: SocketId) -> Option<Stream> {
        if self.tcp.as_ref().map(|stream| stream.id) == Some(id) {
            return self.tcp.take();
        }
        self.accepted.remove(&id)
    }

    fn is_open(&self) -> bool {
        self.listener.is_some() || self.udp.is_some() || self.tcp.is_some()
    }
}

pub(crate) struct ConnectionShared {
    manager: ConnectionManager,
    inner: Mutex<ConnectionInner>,
}

impl Drop for ConnectionShared {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if inner.is_open() || !inner.accepted.is_empty() {
            close_all(inner, &self.manager);
        }
    }
}

/// One netplay endpoint.
///
/// Cloning is cheap and yields another handle to the same endpoint; sockets are
/// closed once the last handle is dropped.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<ConnectionShared>,
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for Connection {}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.inner.lock();
        f.debug_struct("Connection")
            .field("listener", &inner.listener.as_ref().map(|(id, _)| *id))
            .field("udp", &inner.udp.as_ref().map(|(id, _)| *id))
            .field("tcp", &inner.tcp.as_ref().map(|stream| stream.id))
            .field("accepted", &inner.accepted.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Connection {
    pub fn new(manager: &ConnectionManager) -> Self {
        Self {
            shared: Arc::new(ConnectionShared {
                manager: manager.clone(),
                inner: Mutex::new(ConnectionInner::default()),
            }),
        }
    }

    pub(crate) fn from_shared(shared: Arc<ConnectionShared>) -> Self {
        Self { shared }
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.shared.manager
    }

    /// Starts hosting on `port`.
    ///
    /// A connection is either a host or a client: this fails while an
    /// outgoing peer exists or a connect attempt is in flight.
    ///
    /// Binds a TCP listener on all interfaces and a UDP socket on the same
    /// port number, then hands both to the manager. Port `0` picks an ephemeral
    /// port; the returned address tells which.
    pub fn listen(&self, port: u16) -> Result<SocketAddr, NetError> {
        let mut inner = self.shared.inner.lock();
        if inner.listener.is_some() {
            return Err(NetError::AlreadyListening);
        }
        if inner.tcp.is_some() || inner.pending_connects > 0 {
            return Err(NetError::AlreadyConnected);
        }

        let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port)))?;
        let local = listener.local_addr()?;
        let udp = UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], local.port())))?;

        let manager = &self.shared.manager;
        let listener_id = manager.allocate_id();
        let udp_id = manager.allocate_id();
        inner.listener = Some((listener_id, listener));
        inner.udp = Some((udp_id, udp));
        inner.closed = false;

        manager.add(listener_id, self.weak());
        manager.add(udp_id, self.weak());

        info!(
            "Listening on port {} (tcp {}, udp {})",
            local.port(),
            listener_id,
            udp_id
        );
        Ok(local)
    }

    /// Starts connecting to `address:port` in the background.
    ///
    /// A named worker thread resolves the address and connects with a bounded
    /// blocking connect. On success the stream becomes this connection's peer,
    /// unless it already has one; on failure the worker logs and exits. The
    /// `connected` notification arrives from a later [`ConnectionManager::check`].
    /// Fails on a listening connection; host and join with separate ones.
    pub fn connect(&self, address: &str, port: u16) -> Result<(), NetError> {
        let target = format!("{}:{}", address, port);
        let epoch = {
            let mut inner = self.shared.inner.lock();
            if inner.listener.is_some() {
                return Err(NetError::AlreadyListening);
            }
            inner.pending_connects += 1;
            inner.closed = false;
            inner.epoch
        };

        let manager = &self.shared.manager;
        let timeout = manager.config().connect_timeout;
        let weak = self.weak();
        let worker_target = target.clone();

        let spawned = manager.reaper().spawn(format!("connect-{}", target), move || {
            let outcome = open_stream(&worker_target, timeout);
            match weak.upgrade() {
                Some(shared) => Connection::from_shared(shared).install(outcome, epoch, &worker_target),
                None => debug!("Connection released before connect to {} finished", worker_target),
            }
        });

        if let Err(err) = spawned {
            let mut inner = self.shared.inner.lock();
            inner.pending_connects = inner.pending_connects.saturating_sub(1);
            return Err(err);
        }

        debug!("Connecting to {}", target);
        Ok(())
    }

    /// Closes sockets without notifying anyone.
    ///
    /// `None`, or any call while an outgoing peer exists, tears down every
    /// socket of the connection. `Some(id)` on a server closes only that
    /// accepted child; unknown ids are ignored.
    pub fn disconnect(&self, id: Option<SocketId>) {
        let mut inner = self.shared.inner.lock();
        match id {
            Some(child) if inner.tcp.is_none() => match inner.accepted.remove(&child) {
                Some(stream) => {
                    info!("Disconnected child {} ({})", child, stream.remote);
                    release(&self.shared.manager, stream);
                }
                None => debug!("Disconnect of unknown child {}", child),
            },
            _ => {
                close_all(&mut inner, &self.shared.manager);
                info!("Connection closed");
            }
        }
    }

    /// Queues an encoded frame for the stream `id` and writes as much as the
    /// socket takes right now. The rest goes out on later write readiness.
    pub fn send(&self, id: SocketId, bytes: &[u8]) -> Result<(), NetError> {
        let mut inner = self.shared.inner.lock();
        let stream = inner.stream_mut(id).ok_or(NetError::UnknownSocket(id))?;
        stream.outgoing.extend_from_slice(bytes);
        if stream.connecting {
            return Ok(());
        }
        stream.flush()?;
        Ok(())
    }

    /// Sends one datagram from the UDP socket.
    pub fn send_to(&self, bytes: &[u8], to: SocketAddr) -> Result<usize, NetError> {
        let inner = self.shared.inner.lock();
        let (_, udp) = inner.udp.as_ref().ok_or(NetError::NotConnected)?;
        Ok(udp.send_to(bytes, to)?)
    }

    /// True for a listening connection with no outgoing peer
    pub fn is_server(&self) -> bool {
        let inner = self.shared.inner.lock();
        inner.listener.is_some() && inner.tcp.is_none()
    }

    pub fn is_connected(&self) -> bool {
        let inner = self.shared.inner.lock();
        inner.tcp.as_ref().map_or(false, |stream| !stream.connecting)
    }

    pub fn state(&self) -> ConnectionState {
        let inner = self.shared.inner.lock();
        match inner.tcp.as_ref() {
            Some(stream) if stream.connecting => ConnectionState::Connecting,
            Some(_) => ConnectionState::Connected,
            None if inner.pending_connects > 0 => ConnectionState::Connecting,
            None if inner.listener.is_some() => ConnectionState::Listening,
            None if inner.closed => ConnectionState::Closed,
            None => ConnectionState::Idle,
        }
    }

    /// Local address of the listener, or of the outgoing stream
    pub fn local_addr(&self) -> Option<SocketAddr> {
        let inner = self.shared.inner.lock();
        if let Some((_, listener)) = inner.listener.as_ref() {
            return listener.local_addr().ok();
        }
        inner
            .tcp
            .as_ref()
            .and_then(|stream| stream.socket.local_addr().ok())
    }

    /// Remote address of the outgoing peer if there is one, otherwise of the
    /// accepted child `id`
    pub fn remote_addr(&self, id: SocketId) -> Option<SocketAddr> {
        let inner = self.shared.inner.lock();
        match inner.tcp.as_ref() {
            Some(stream) => Some(stream.remote),
            None => inner.accepted.get(&id).map(|stream| stream.remote),
        }
    }

    pub fn peer_id(&self) -> Option<SocketId> {
        self.shared.inner.lock().tcp.as_ref().map(|stream| stream.id)
    }

    pub fn accepted_ids(&self) -> Vec<SocketId> {
        self.shared.inner.lock().accepted.keys().copied().collect()
    }

    /// Id of the datagram socket opened by [`listen`](Self::listen)
    pub fn udp_id(&self) -> Option<SocketId> {
        self.shared.inner.lock().udp.as_ref().map(|(id, _)| *id)
    }

    pub fn pending_connects(&self) -> usize {
        self.shared.inner.lock().pending_connects
    }

    pub(crate) fn role(&self, id: SocketId) -> Option<SocketRole> {
        let inner = self.shared.inner.lock();
        if inner.listener.as_ref().map(|(lid, _)| *lid) == Some(id) {
            return Some(SocketRole::Listener);
        }
        if inner.udp.as_ref().map(|(uid, _)| *uid) == Some(id) {
            return Some(SocketRole::Datagram);
        }
        match inner.tcp.as_ref() {
            Some(stream) if stream.id == id && stream.connecting => Some(SocketRole::Connecting),
            Some(stream) if stream.id == id => Some(SocketRole::Stream),
            _ => inner.accepted.get(&id).map(|_| SocketRole::Stream),
        }
    }

    /// Registers socket `id` with the poller, or updates its interest.
    /// Returns `false` when the connection no longer owns that socket.
    pub(crate) fn register(
        &self,
        id: SocketId,
        registry: &Registry,
        token: Token,
        known: bool,
    ) -> io::Result<bool> {
        let mut inner = self.shared.inner.lock();
        let inner = &mut *inner;

        if let Some((lid, listener)) = inner.listener.as_mut() {
            if *lid == id {
                return register_source(listener, registry, token, Interest::READABLE, known);
            }
        }
        if let Some((uid, udp)) = inner.udp.as_mut() {
            if *uid == id {
                return register_source(udp, registry, token, Interest::READABLE, known);
            }
        }
        match inner.stream_mut(id) {
            Some(stream) => {
                let interest = stream.interest();
                register_source(&mut stream.socket, registry, token, interest, known)
            }
            None => Ok(false),
        }
    }

    /// Peeks at the stream `id` to tell pending data from an orderly close
    pub(crate) fn peek(&self, id: SocketId) -> Option<io::Result<usize>> {
        let mut inner = self.shared.inner.lock();
        let stream = inner.stream_mut(id)?;
        let mut probe = [0u8; 1];
        Some(stream.socket.peek(&mut probe))
    }

    /// The outgoing stream became writable: the connect has settled
    pub(crate) fn connect_event(&self, id: SocketId) {
        let mut inner = self.shared.inner.lock();
        let Some(stream) = inner.tcp.as_mut().filter(|stream| stream.id == id && stream.connecting) else {
            return;
        };

        let failure = match stream.socket.take_error() {
            Ok(None) => stream.socket.peer_addr().err(),
            Ok(Some(err)) | Err(err) => Some(err),
        };

        match failure {
            None => {
                stream.connecting = false;
                let remote = stream.remote;
                if let Err(err) = stream.flush() {
                    warn!("Failed to flush to {}: {}", remote, err);
                }
                info!("Connected to {} (socket {})", remote, id);
                self.queue(ConnectionEvent::Connected { id });
            }
            Some(err) => {
                warn!("Connect to {} failed: {}", stream.remote, err);
                if let Some(stream) = inner.tcp.take() {
                    release(&self.shared.manager, stream);
                }
                self.queue(ConnectionEvent::Disconnected { id });
            }
        }
    }

    /// The listener is readable: accept one pending connection
    pub(crate) fn accept_event(&self, id: SocketId) {
        let mut inner = self.shared.inner.lock();
        let accepted = match inner.listener.as_ref() {
            Some((lid, listener)) if *lid == id => listener.accept(),
            _ => return,
        };

        match accepted {
            Ok((socket, remote)) => {
                if let Err(err) = socket.set_nodelay(true) {
                    debug!("Failed to set nodelay for {}: {}", remote, err);
                }
                let manager = &self.shared.manager;
                let child = manager.allocate_id();
                inner
                    .accepted
                    .insert(child, Stream::new(child, socket, remote, false));
                manager.add(child, self.weak());

                info!("Accepted {} as socket {}", remote, child);
                self.queue(ConnectionEvent::Accepted { id: child });
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => warn!("Accept failed on socket {}: {}", id, err),
        }
    }

    /// Drains available bytes from a stream or datagrams from the UDP socket
    pub(crate) fn read_event(&self, id: SocketId) {
        let mut inner = self.shared.inner.lock();
        let config = self.shared.manager.config();

        if let Some((uid, udp)) = inner.udp.as_ref() {
            if *uid == id {
                let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];
                for _ in 0..config.max_datagrams_per_event {
                    match udp.recv_from(&mut buffer) {
                        Ok((size, from)) => self.queue(ConnectionEvent::Read {
                            id,
                            data: buffer[..size].to_vec(),
                            from,
                        }),
                        Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                        Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                        Err(err) => {
                            warn!("Datagram receive failed on socket {}: {}", id, err);
                            break;
                        }
                    }
                }
                return;
            }
        }

        let Some(stream) = inner.stream_mut(id) else {
            return;
        };

        let mut data = Vec::new();
        let mut chunk = vec![0u8; config.read_chunk_size.max(1)];
        let mut closed = false;
        while data.len() < config.max_read_per_event {
            match stream.socket.read(&mut chunk) {
                Ok(0) => {
                    closed = true;
                    break;
                }
                Ok(size) => data.extend_from_slice(&chunk[..size]),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    if !is_reset(&err) {
                        warn!("Read failed on socket {}: {}", id, err);
                    }
                    closed = true;
                    break;
                }
            }
        }

        if !data.is_empty() {
            let from = stream.remote;
            self.queue(ConnectionEvent::Read { id, data, from });
        }

        if closed {
            if let Some(stream) = inner.take_stream(id) {
                info!("Socket {} ({}) closed", id, stream.remote);
                release(&self.shared.manager, stream);
            }
            self.queue(ConnectionEvent::Disconnected { id });
        }
    }

    /// The peer closed the stream `id`
    pub(crate) fn disconnect_event(&self, id: SocketId) {
        let mut inner = self.shared.inner.lock();
        if let Some(stream) = inner.take_stream(id) {
            info!("Socket {} ({}) disconnected", id, stream.remote);
            release(&self.shared.manager, stream);
            self.queue(ConnectionEvent::Disconnected { id });
        }
    }

    /// The stream `id` can take more of its queued output
    pub(crate) fn flush_event(&self, id: SocketId) {
        let mut inner = self.shared.inner.lock();
        let Some(stream) = inner.stream_mut(id) else {
            return;
        };
        if stream.connecting || stream.outgoing.is_empty() {
            return;
        }

        if let Err(err) = stream.flush() {
            warn!("Write failed on socket {}: {}", id, err);
            if let Some(stream) = inner.take_stream(id) {
                release(&self.shared.manager, stream);
            }
            self.queue(ConnectionEvent::Disconnected { id });
        }
    }

    /// Stores the result of a connect worker
    fn install(&self, outcome: Result<std::net::TcpStream, NetError>, epoch: u64, target: &str) {
        let mut inner = self.shared.inner.lock();
        inner.pending_connects = inner.pending_connects.saturating_sub(1);

        let stream = match outcome {
            Ok(stream) => stream,
            Err(err) => {
                warn!("Connect to {} failed: {}", target, err);
                return;
            }
        };

        if inner.epoch != epoch {
            debug!("Discarding connection to {}: disconnected meanwhile", target);
            return;
        }
        if inner.tcp.is_some() || inner.listener.is_some() {
            debug!("Discarding connection to {}: already have a peer", target);
            return;
        }

        let remote = match stream.peer_addr() {
            Ok(remote) => remote,
            Err(err) => {
                warn!("Connect to {} lost before use: {}", target, err);
                return;
            }
        };

        let manager = &self.shared.manager;
        let id = manager.allocate_id();
        inner.tcp = Some(Stream::new(id, TcpStream::from_std(stream), remote, true));
        manager.add(id, self.weak());
        debug!("Socket {} connecting to {}", id, remote);
    }

    fn queue(&self, event: ConnectionEvent) {
        self.shared.manager.notify(self.weak(), event);
    }

    fn weak(&self) -> Weak<ConnectionShared> {
        Arc::downgrade(&self.shared)
    }
}

/// Resolves `target` and connects to the first address that answers
fn open_stream(target: &str, timeout: Duration) -> Result<std::net::TcpStream, NetError> {
    let addresses = target
        .to_socket_addrs()
        .map_err(|err| NetError::Resolve(format!("{}: {}", target, err)))?;

    let mut last_error = None;
    for address in addresses {
        match std::net::TcpStream::connect_timeout(&address, timeout) {
            Ok(stream) => {
                stream.set_nonblocking(true)?;
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(err) => {
                debug!("Connect to {} failed: {}", address, err);
                last_error = Some(err);
            }
        }
    }

    Err(match last_error {
        Some(err) => NetError::Io(err),
        None => NetError::Resolve(format!("{}: no addresses", target)),
    })
}

fn register_source<S: Source>(
    source: &mut S,
    registry: &Registry,
    token: Token,
    interest: Interest,
    known: bool,
) -> io::Result<bool> {
    if known {
        registry.reregister(source, token, interest)?;
    } else {
        match registry.register(source, token, interest) {
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                registry.reregister(source, token, interest)?
            }
            other => other?,
        }
    }
    Ok(true)
}

fn deregister<S: Source>(manager: &ConnectionManager, id: SocketId, source: &mut S) {
    manager.remove(id);
    // fails harmlessly for sockets never polled
    let _ = manager.registry().deregister(source);
}

fn release(manager: &ConnectionManager, mut stream: Stream) {
    deregister(manager, stream.id, &mut stream.socket);
}

/// Tears down every socket; connect workers still in flight are discarded
fn close_all(inner: &mut ConnectionInner, manager: &ConnectionManager) {
    if let Some((id, mut listener)) = inner.listener.take() {
        deregister(manager, id, &mut listener);
    }
    if let Some((id, mut udp)) = inner.udp.take() {
        deregister(manager, id, &mut udp);
    }
    if let Some(stream) = inner.tcp.take() {
        release(manager, stream);
    }
    for (_, stream) in std::mem::take(&mut inner.accepted) {
        release(manager, stream);
    }
    inner.epoch += 1;
    inner.closed = true;
}
