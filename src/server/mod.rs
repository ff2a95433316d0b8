//! Non-blocking TCP listener for peers reaching the node, plus the outbound
//! connector that delivers QUEUE callbacks.

mod callback;

use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{IpAddr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::config;

pub use callback::{CallbackCompletion, TcpCallbackTransport};

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 6346;
/// Longest line accepted from a peer before the connection is dropped.
pub const MAX_LINE_BYTES: usize = 4_096;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub advertised_host: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_owned(),
            port: DEFAULT_PORT,
            advertised_host: None,
        }
    }
}

impl From<config::ServerConfig> for ServerConfig {
    fn from(value: config::ServerConfig) -> Self {
        Self {
            host: value.host,
            port: value.port,
            advertised_host: Some(value.advertised_host).filter(|host| !host.trim().is_empty()),
        }
    }
}

#[derive(Debug)]
pub enum ServerError {
    Bind {
        address: String,
        source: io::Error,
    },
    SetNonBlocking {
        source: io::Error,
    },
    ConfigureAcceptedStream {
        source: io::Error,
    },
    StreamClone {
        source: io::Error,
    },
    InvalidAdvertisedHost {
        host: String,
    },
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bind { address, source } => {
                write!(f, "failed to bind TCP server on {address}: {source}")
            }
            Self::SetNonBlocking { source } => {
                write!(f, "failed to set TCP server to non-blocking mode: {source}")
            }
            Self::ConfigureAcceptedStream { source } => {
                write!(f, "failed to configure accepted TCP stream: {source}")
            }
            Self::StreamClone { source } => {
                write!(f, "failed to clone TCP stream for full duplex IO: {source}")
            }
            Self::InvalidAdvertisedHost { host } => {
                write!(f, "server.advertised_host '{host}' is not an IP address")
            }
        }
    }
}

impl std::error::Error for ServerError {}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// How a connection came to us.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionOrigin {
    Accepted,
    /// Opened by us to deliver a QUEUE callback; the peer may now request.
    Callback,
}

pub struct PeerConnection {
    id: u64,
    peer_addr: SocketAddr,
    origin: ConnectionOrigin,
    reader: Mutex<TcpStream>,
    writer: Mutex<TcpStream>,
    pending: Mutex<Vec<u8>>,
}

impl PeerConnection {
    fn new(
        id: u64,
        stream: TcpStream,
        peer_addr: SocketAddr,
        origin: ConnectionOrigin,
    ) -> Result<Self, ServerError> {
        stream
            .set_nodelay(true)
            .map_err(|source| ServerError::ConfigureAcceptedStream { source })?;
        stream
            .set_nonblocking(true)
            .map_err(|source| ServerError::ConfigureAcceptedStream { source })?;

        let writer = stream
            .try_clone()
            .map_err(|source| ServerError::StreamClone { source })?;

        Ok(Self {
            id,
            peer_addr,
            origin,
            reader: Mutex::new(stream),
            writer: Mutex::new(writer),
            pending: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn origin(&self) -> ConnectionOrigin {
        self.origin
    }

    pub fn try_read(&self, buffer: &mut [u8]) -> io::Result<usize> {
        lock(&self.reader).read(buffer)
    }

    /// Next complete line without its terminator, if one has arrived.
    /// `UnexpectedEof` means the peer closed the connection.
    pub fn try_read_line(&self) -> io::Result<Option<String>> {
        let mut pending = lock(&self.pending);
        if let Some(line) = take_line(&mut pending) {
            return Ok(Some(line));
        }

        let mut chunk = [0_u8; 1_024];
        loop {
            match self.try_read(&mut chunk) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "peer closed the connection",
                    ))
                }
                Ok(read) => {
                    pending.extend_from_slice(&chunk[..read]);
                    if let Some(line) = take_line(&mut pending) {
                        return Ok(Some(line));
                    }
                    if pending.len() > MAX_LINE_BYTES {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "line exceeds the accepted length",
                        ));
                    }
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(error) => return Err(error),
            }
        }
    }

    pub fn try_write(&self, payload: &[u8]) -> io::Result<usize> {
        lock(&self.writer).write(payload)
    }

    pub fn shutdown(&self) -> io::Result<()> {
        let _ = lock(&self.reader).shutdown(Shutdown::Both);
        lock(&self.writer).shutdown(Shutdown::Both)
    }
}

fn take_line(pending: &mut Vec<u8>) -> Option<String> {
    let end = pending.iter().position(|byte| *byte == b'\n')?;
    let raw: Vec<u8> = pending.drain(..=end).collect();
    let line = String::from_utf8_lossy(&raw);
    Some(line.trim_end_matches(['\r', '\n']).to_owned())
}

pub struct TcpServer {
    listener: TcpListener,
    advertised_ip: Option<IpAddr>,
    next_connection_id: AtomicU64,
    active_connections: Mutex<HashMap<u64, Arc<PeerConnection>>>,
}

impl TcpServer {
    pub fn bind(config: &ServerConfig) -> Result<Self, ServerError> {
        let advertised_ip = match &config.advertised_host {
            Some(host) => Some(host.parse::<IpAddr>().map_err(|_| {
                ServerError::InvalidAdvertisedHost { host: host.clone() }
            })?),
            None => None,
        };

        let address = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind(&address).map_err(|source| ServerError::Bind {
            address,
            source,
        })?;
        listener
            .set_nonblocking(true)
            .map_err(|source| ServerError::SetNonBlocking { source })?;

        Ok(Self {
            listener,
            advertised_ip,
            next_connection_id: AtomicU64::new(1),
            active_connections: Mutex::new(HashMap::new()),
        })
    }

    pub fn from_app_config(app_config: &config::AppConfig) -> Result<Self, ServerError> {
        let cfg = ServerConfig::from(app_config.server.clone());
        Self::bind(&cfg)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Address written into outbound QUEUE lines: the configured host, or
    /// the bound address when none is configured.
    pub fn advertised_addr(&self) -> io::Result<SocketAddr> {
        let bound = self.local_addr()?;
        Ok(SocketAddr::new(self.advertised_ip.unwrap_or(bound.ip()), bound.port()))
    }

    pub fn try_accept(&self) -> Result<Option<Arc<PeerConnection>>, ServerError> {
        match self.listener.accept() {
            Ok((stream, peer_addr)) => self
                .register(stream, peer_addr, ConnectionOrigin::Accepted)
                .map(Some),
            Err(source) if source.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(source) => Err(ServerError::ConfigureAcceptedStream { source }),
        }
    }

    /// Takes over a stream we opened ourselves, such as a delivered QUEUE
    /// callback, so it is served like an accepted one.
    pub fn adopt(&self, stream: TcpStream) -> Result<Arc<PeerConnection>, ServerError> {
        let peer_addr = stream
            .peer_addr()
            .map_err(|source| ServerError::ConfigureAcceptedStream { source })?;
        self.register(stream, peer_addr, ConnectionOrigin::Callback)
    }

    fn register(
        &self,
        stream: TcpStream,
        peer_addr: SocketAddr,
        origin: ConnectionOrigin,
    ) -> Result<Arc<PeerConnection>, ServerError> {
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let connection = Arc::new(PeerConnection::new(id, stream, peer_addr, origin)?);
        lock(&self.active_connections).insert(id, Arc::clone(&connection));
        Ok(connection)
    }

    pub fn connections(&self) -> Vec<Arc<PeerConnection>> {
        let mut connections: Vec<_> = lock(&self.active_connections).values().cloned().collect();
        connections.sort_by_key(|connection| connection.id());
        connections
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.active_connections).len()
    }

    pub fn drop_connection(&self, id: u64) {
        if let Some(connection) = lock(&self.active_connections).remove(&id) {
            let _ = connection.shutdown();
        }
    }

    pub fn shutdown_all_connections(&self) {
        let mut connections = lock(&self.active_connections);

        for connection in connections.values() {
            let _ = connection.shutdown();
        }
        connections.clear();
    }
}
