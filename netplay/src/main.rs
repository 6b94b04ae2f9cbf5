use clap::Parser;
use log::{debug, info, warn};
use netplay::{Connection, ConnectionManager, ConnectionOwner, NetConfig, NetError, SocketId};
use protocol::{Codec, Message, MessageBuffer, Version, DEFAULT_COMPRESSION_LEVEL};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Host a session on this port
    #[arg(short = 'l', long)]
    listen: Option<u16>,

    /// Join a session at host:port
    #[arg(short = 'c', long, conflicts_with = "listen")]
    connect: Option<String>,

    /// Readiness wait per tick in milliseconds
    #[arg(short = 't', long, default_value = "16")]
    tick_ms: u64,

    /// Compression level for outgoing messages (0 disables compression)
    #[arg(long, default_value_t = DEFAULT_COMPRESSION_LEVEL)]
    compression: u8,

    /// Stop after this many ticks (0 runs until Ctrl+C)
    #[arg(long, default_value = "0")]
    ticks: u64,
}

/// Greets new peers and logs every message they send
struct Peer {
    codec: Codec,
    compression: u8,
    streams: HashMap<SocketId, MessageBuffer>,
}

impl Peer {
    fn new(compression: u8) -> Self {
        Self {
            codec: Codec::new(),
            compression,
            streams: HashMap::new(),
        }
    }

    fn greet(&mut self, connection: &Connection, id: SocketId) {
        let mut version = Message::new(Version {
            code: env!("CARGO_PKG_NAME").to_string(),
            revision: env!("CARGO_PKG_VERSION").to_string(),
            build_time: String::new(),
        })
        .with_compression(self.compression);

        let sent = self
            .codec
            .encode(&mut version)
            .map_err(NetError::from)
            .and_then(|frame| connection.send(id, &frame));
        if let Err(err) = sent {
            warn!("Failed to greet socket {}: {}", id, err);
        }
    }

    fn log_message(message: &Message, from: SocketAddr) {
        info!("{} from {}", message, from);
    }
}

impl ConnectionOwner for Peer {
    fn connected(&mut self, connection: &Connection, id: SocketId) {
        info!("Connected to {:?} as socket {}", connection.remote_addr(id), id);
        self.streams.insert(id, MessageBuffer::new());
        self.greet(connection, id);
    }

    fn accepted(&mut self, connection: &Connection, id: SocketId) {
        info!("Accepted {:?} as socket {}", connection.remote_addr(id), id);
        self.streams.insert(id, MessageBuffer::new());
        self.greet(connection, id);
    }

    fn disconnected(&mut self, _connection: &Connection, id: SocketId) {
        info!("Socket {} disconnected", id);
        self.streams.remove(&id);
    }

    fn read(&mut self, connection: &Connection, id: SocketId, data: &[u8], from: SocketAddr) {
        if connection.udp_id() == Some(id) {
            match self.codec.decode(data) {
                Ok((message, _)) => Self::log_message(&message, from),
                Err(err) => debug!("Dropping datagram from {}: {}", from, err),
            }
            return;
        }

        let buffer = self.streams.entry(id).or_default();
        buffer.push(data);
        match buffer.drain_messages(&self.codec) {
            Ok(messages) => {
                for message in &messages {
                    Self::log_message(message, from);
                }
            }
            Err(err) => {
                warn!("Corrupt stream from {}: {}, disconnecting", from, err);
                self.streams.remove(&id);
                connection.disconnect(Some(id));
            }
        }
    }
}

fn run(args: Args, running: Arc<AtomicBool>) -> Result<(), NetError> {
    let config = NetConfig {
        poll_timeout: Duration::from_millis(args.tick_ms),
        ..NetConfig::default()
    };
    let manager = ConnectionManager::with_config(config)?;
    let connection = Connection::new(&manager);

    if let Some(port) = args.listen {
        let local = connection.listen(port)?;
        info!("Hosting on {}", local);
    }
    if let Some(target) = args.connect.as_deref() {
        let (host, port) = target
            .rsplit_once(':')
            .and_then(|(host, port)| port.parse::<u16>().ok().map(|port| (host, port)))
            .ok_or_else(|| NetError::Resolve(target.to_string()))?;
        connection.connect(host, port)?;
        info!("Joining {}", target);
    }

    let mut peer = Peer::new(args.compression);
    let mut tick = 0u64;
    while running.load(Ordering::SeqCst) && (args.ticks == 0 || tick < args.ticks) {
        manager.tick(&mut peer)?;
        tick += 1;
    }

    info!("Shutting down after {} ticks", tick);
    connection.disconnect(None);
    manager.shutdown();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    if args.listen.is_none() && args.connect.is_none() {
        return Err("nothing to do: pass --listen or --connect".into());
    }

    let running = Arc::new(AtomicBool::new(true));
    let mut peer = {
        let running = Arc::clone(&running);
        tokio::task::spawn_blocking(move || run(args, running))
    };

    let interrupted = tokio::select! {
        result = &mut peer => {
            result??;
            false
        }
        _ = tokio::signal::ctrl_c() => true,
    };

    if interrupted {
        info!("Received Ctrl+C, shutting down gracefully...");
        running.store(false, Ordering::SeqCst);
        peer.await??;
    }

    Ok(())
}
