use crate::error::YakNsError;
use crate::reply::Reply;
use crate::{Message, UDP_BUFFER_SIZE};

use async_trait::async_trait;
use futures_util::future::select_all;
use log::{debug, info, trace, warn};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Display;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream, UdpSocket};
use tokio::time::{sleep, timeout};

/// How long to wait between bind attempts when the address is already in use.
const BIND_RETRY_INTERVAL: Duration = Duration::from_secs(5);
/// Total time to keep retrying the bind before giving up.
const BIND_TIMEOUT: Duration = Duration::from_secs(60);

/// Upper bound on a single readiness wait, so the loop can come up for air.
pub(crate) const SELECT_TIMEOUT: Duration = Duration::from_millis(100);
/// Idle time after which a cached connection is expired.
pub(crate) const CONNECTION_KEEPALIVE: Duration = Duration::from_secs(30);
/// Hard cap on cached connections.
pub(crate) const CACHE_LIMIT: usize = 200;
/// Where a size-pressure vacuum stops: 90% of the cap.
pub(crate) const CACHE_VACUUM_TARGET: usize = 180;
/// Minimum interval between cache-clean passes.
pub(crate) const CACHE_CLEAN_INTERVAL: Duration = Duration::from_secs(10);
/// Per-read timeout for the length prefix and the frame body.
pub(crate) const READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Where a message came from, so the reply can be routed back.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransportHandle {
    Udp,
    /// Cache key of the TCP connection the message arrived on.
    Tcp(u64),
}

/// A received DNS message, the transport bookkeeping needed to answer it,
/// and eventually the reply. Lives for the duration of one request.
pub struct MessageContainer {
    pub message: Message,
    pub raw: Vec<u8>,
    pub handle: TransportHandle,
    pub remote_address: SocketAddr,
    pub response: Option<Reply>,
}

/// A server-side message transport: bind, pull messages, push replies.
#[async_trait]
pub trait Transport: Send + Display {
    /// Bind the socket, retrying "address already in use" for up to a
    /// minute. Any other failure is fatal.
    async fn start_server(&mut self) -> Result<(), YakNsError>;

    /// Block until a complete DNS message arrives.
    async fn receive_message(&mut self) -> Result<MessageContainer, YakNsError>;

    /// Send the reply in `message.response` back where the request came from.
    async fn send_message_response(&mut self, message: MessageContainer)
        -> Result<(), YakNsError>;

    async fn stop_server(&mut self);

    /// The bound address, once started. Handy when binding port 0.
    fn local_addr(&self) -> Option<SocketAddr>;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    fn matches(&self, addr: &SocketAddr) -> bool {
        match self {
            AddressFamily::V4 => addr.is_ipv4(),
            AddressFamily::V6 => addr.is_ipv6(),
        }
    }
}

async fn resolve_bind_address(
    address: &str,
    port: u16,
    family: AddressFamily,
) -> Result<SocketAddr, YakNsError> {
    let addresses = tokio::net::lookup_host((address, port)).await.map_err(|error| {
        YakNsError::StartupError(format!("failed to resolve {address}: {error:?}"))
    })?;
    for candidate in addresses {
        if family.matches(&candidate) {
            return Ok(candidate);
        }
    }
    Err(YakNsError::StartupError(format!(
        "no {family:?} address found for {address}"
    )))
}

/// Transport for UDP datagrams, request-at-a-time.
///
/// Reads are capped at [UDP_BUFFER_SIZE] - EDNS0 is not negotiated. The
/// IPv4 and IPv6 variants differ only in address family.
pub struct UdpTransport {
    address: String,
    port: u16,
    family: AddressFamily,
    socket: Option<UdpSocket>,
}

impl UdpTransport {
    pub fn v4(address: &str, port: u16) -> Self {
        UdpTransport {
            address: address.to_string(),
            port,
            family: AddressFamily::V4,
            socket: None,
        }
    }

    pub fn v6(address: &str, port: u16) -> Self {
        UdpTransport {
            address: address.to_string(),
            port,
            family: AddressFamily::V6,
            socket: None,
        }
    }
}

impl Display for UdpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let family = match self.family {
            AddressFamily::V4 => "UDPv4",
            AddressFamily::V6 => "UDPv6",
        };
        f.write_fmt(format_args!(
            "{family}Transport(address={:?}, port={})",
            self.address, self.port
        ))
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn start_server(&mut self) -> Result<(), YakNsError> {
        let bind_addr = resolve_bind_address(&self.address, self.port, self.family).await?;
        let deadline = Instant::now() + BIND_TIMEOUT;
        let socket = loop {
            match UdpSocket::bind(bind_addr).await {
                Ok(socket) => break socket,
                Err(error) if error.kind() == io::ErrorKind::AddrInUse => {
                    if Instant::now() + BIND_RETRY_INTERVAL >= deadline {
                        return Err(YakNsError::StartupError(format!(
                            "failed to bind {bind_addr} within {BIND_TIMEOUT:?}"
                        )));
                    }
                    warn!("{bind_addr} already in use, retrying in {BIND_RETRY_INTERVAL:?}");
                    sleep(BIND_RETRY_INTERVAL).await;
                }
                Err(error) => return Err(error.into()),
            }
        };
        info!("Started UDP listener on {}", socket.local_addr()?);
        self.socket = Some(socket);
        Ok(())
    }

    async fn receive_message(&mut self) -> Result<MessageContainer, YakNsError> {
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| YakNsError::Transport("transport not started".to_string()))?;

        let mut buf = [0; UDP_BUFFER_SIZE];
        let (len, remote_address) = socket.recv_from(&mut buf).await?;
        trace!("{len} bytes received from {remote_address:?}");

        let raw = buf[0..len].to_vec();
        let message = Message::parse(&raw)
            .map_err(|error| YakNsError::invalid_message(remote_address, error, &raw))?;

        Ok(MessageContainer {
            message,
            raw,
            handle: TransportHandle::Udp,
            remote_address,
            response: None,
        })
    }

    async fn send_message_response(
        &mut self,
        message: MessageContainer,
    ) -> Result<(), YakNsError> {
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| YakNsError::Transport("transport not started".to_string()))?;
        let reply = message
            .response
            .ok_or_else(|| YakNsError::Transport("response not set".to_string()))?;

        let reply_bytes = reply.as_bytes_udp()?;
        let len = socket.send_to(&reply_bytes, message.remote_address).await?;
        trace!("{len} bytes sent to {:?}", message.remote_address);
        Ok(())
    }

    async fn stop_server(&mut self) {
        self.socket = None;
        info!("Stopped UDP listener");
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|socket| socket.local_addr().ok())
    }
}

/// One live client connection held by the [TcpTransport] cache.
pub(crate) struct CachedConnection {
    pub(crate) stream: TcpStream,
    pub(crate) remote_address: SocketAddr,
    pub(crate) last_data: Instant,
}

enum TcpEvent {
    Accepted(TcpStream, SocketAddr),
    Readable(u64),
    Tick,
}

/// Transport for TCP, ref [RFC7766](https://www.rfc-editor.org/rfc/rfc7766).
///
/// Many clients are multiplexed through one task: accepted connections go
/// into a keyed cache, readiness events queue them for reading, and replies
/// leave the connection open so clients can pipeline further queries.
/// Idle connections are expired after [CONNECTION_KEEPALIVE], and the cache
/// is vacuumed back to [CACHE_VACUUM_TARGET] when it outgrows [CACHE_LIMIT].
pub struct TcpTransport {
    address: String,
    port: u16,
    listener: Option<TcpListener>,
    pub(crate) cache: HashMap<u64, CachedConnection>,
    ready: VecDeque<u64>,
    next_connection_id: u64,
    last_cleanup: Instant,
}

impl TcpTransport {
    pub fn new(address: &str, port: u16) -> Self {
        TcpTransport {
            address: address.to_string(),
            port,
            listener: None,
            cache: HashMap::new(),
            ready: VecDeque::new(),
            next_connection_id: 0,
            last_cleanup: Instant::now(),
        }
    }

    fn cache_connection(&mut self, stream: TcpStream, remote_address: SocketAddr) {
        let connection_id = self.next_connection_id;
        self.next_connection_id = self.next_connection_id.wrapping_add(1);
        self.cache.insert(
            connection_id,
            CachedConnection {
                stream,
                remote_address,
                last_data: Instant::now(),
            },
        );
    }

    async fn remove_connection(&mut self, connection_id: u64) {
        if let Some(mut connection) = self.cache.remove(&connection_id) {
            debug!(
                "evicting connection {connection_id} from {:?}",
                connection.remote_address
            );
            // best-effort, the peer may already be gone
            let _ = connection.stream.shutdown().await;
        }
        self.ready.retain(|id| *id != connection_id);
    }

    /// Readiness fired for a cached connection. A readable socket whose peer
    /// has already closed would only give a zero-length read, so probe with
    /// a peek before queueing it.
    async fn mark_ready(&mut self, connection_id: u64) {
        let closed = match self.cache.get_mut(&connection_id) {
            Some(connection) => {
                let mut probe = [0u8; 1];
                match connection.stream.peek(&mut probe).await {
                    Ok(0) => true,
                    Ok(_) => {
                        connection.last_data = Instant::now();
                        false
                    }
                    Err(_) => true,
                }
            }
            None => return,
        };
        if closed {
            self.remove_connection(connection_id).await;
        } else if !self.ready.contains(&connection_id) {
            self.ready.push_back(connection_id);
        }
    }

    /// Wait for the next thing to happen: a new client, data on a cached
    /// connection, or the select timeout.
    async fn next_event(
        listener: &TcpListener,
        cache: &HashMap<u64, CachedConnection>,
    ) -> Result<TcpEvent, YakNsError> {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, remote_address) = accepted
                    .map_err(|error| YakNsError::Transport(format!("accept failed: {error:?}")))?;
                Ok(TcpEvent::Accepted(stream, remote_address))
            }
            connection_id = Self::poll_cached(cache) => Ok(TcpEvent::Readable(connection_id)),
            _ = sleep(SELECT_TIMEOUT) => Ok(TcpEvent::Tick),
        }
    }

    /// Resolve to the id of the first cached connection with data waiting.
    /// Pends forever on an empty cache, leaving the select to the listener
    /// and the timeout.
    async fn poll_cached(cache: &HashMap<u64, CachedConnection>) -> u64 {
        if cache.is_empty() {
            return std::future::pending().await;
        }
        let readable: Vec<_> = cache
            .iter()
            .map(|(connection_id, connection)| {
                let connection_id = *connection_id;
                Box::pin(async move {
                    let _ = connection.stream.readable().await;
                    connection_id
                })
            })
            .collect();
        let (connection_id, _, _) = select_all(readable).await;
        connection_id
    }

    /// Read one length-prefixed frame. `Ok(None)` means the peer closed
    /// cleanly mid-silence; timeouts and transport errors bubble up.
    async fn read_one_frame(stream: &mut TcpStream) -> Result<Option<Vec<u8>>, YakNsError> {
        // the first two bytes of a TCP query are the message length
        // ref <https://www.rfc-editor.org/rfc/rfc7766#section-8>
        let msg_length: usize = match timeout(READ_TIMEOUT, stream.read_u16()).await {
            Err(_) => return Err(YakNsError::ReadTimeout(READ_TIMEOUT)),
            Ok(Err(error)) if error.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Ok(Err(error)) => return Err(error.into()),
            Ok(Ok(len)) => len.into(),
        };
        trace!("msg_length={msg_length}");

        let mut buf = vec![0u8; msg_length];
        match timeout(READ_TIMEOUT, stream.read_exact(&mut buf)).await {
            Err(_) => Err(YakNsError::ReadTimeout(READ_TIMEOUT)),
            Ok(Err(error)) if error.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
            Ok(Err(error)) => Err(error.into()),
            Ok(Ok(_)) => Ok(Some(buf)),
        }
    }

    /// Pull one frame off a ready connection and parse it. Connections that
    /// close, time out, or send junk are evicted on the way through.
    async fn read_frame(
        &mut self,
        connection_id: u64,
    ) -> Result<Option<MessageContainer>, YakNsError> {
        let frame = match self.cache.get_mut(&connection_id) {
            None => return Ok(None),
            Some(connection) => {
                let remote_address = connection.remote_address;
                match Self::read_one_frame(&mut connection.stream).await {
                    Ok(Some(bytes)) => {
                        connection.last_data = Instant::now();
                        Ok(Some((bytes, remote_address)))
                    }
                    Ok(None) => Ok(None),
                    Err(error) => Err(error),
                }
            }
        };

        match frame {
            Ok(Some((raw, remote_address))) => match Message::parse(&raw) {
                Ok(message) => Ok(Some(MessageContainer {
                    message,
                    raw,
                    handle: TransportHandle::Tcp(connection_id),
                    remote_address,
                    response: None,
                })),
                Err(error) => {
                    // not DNS - drop the connection
                    self.remove_connection(connection_id).await;
                    Err(YakNsError::invalid_message(remote_address, error, &raw))
                }
            },
            Ok(None) => {
                self.remove_connection(connection_id).await;
                Ok(None)
            }
            Err(error) => {
                self.remove_connection(connection_id).await;
                Err(error)
            }
        }
    }

    /// Two eviction passes over the cache: expire idle or dead connections,
    /// then vacuum the quietest ones if the cache is still over the cap.
    /// Connections queued for reading are left alone in both passes.
    pub(crate) async fn cleanup(&mut self) {
        let now = Instant::now();
        let in_ready: HashSet<u64> = self.ready.iter().copied().collect();

        let expired: Vec<u64> = self
            .cache
            .iter()
            .filter(|(connection_id, connection)| {
                !in_ready.contains(connection_id)
                    && (now.duration_since(connection.last_data) > CONNECTION_KEEPALIVE
                        || connection.stream.peer_addr().is_err())
            })
            .map(|(connection_id, _)| *connection_id)
            .collect();
        for connection_id in expired {
            self.remove_connection(connection_id).await;
        }

        if self.cache.len() > CACHE_LIMIT {
            let mut quiet: Vec<(u64, Instant)> = self
                .cache
                .iter()
                .filter(|(connection_id, _)| !in_ready.contains(connection_id))
                .map(|(connection_id, connection)| (*connection_id, connection.last_data))
                .collect();
            quiet.sort_by_key(|(_, last_data)| *last_data);

            // if there are not enough quiet connections to reach the
            // target, all of them go
            let excess = self.cache.len().saturating_sub(CACHE_VACUUM_TARGET);
            for (connection_id, _) in quiet.into_iter().take(excess) {
                self.remove_connection(connection_id).await;
            }
        }

        self.last_cleanup = Instant::now();
    }

    #[cfg(test)]
    pub(crate) fn cache_len(&self) -> usize {
        self.cache.len()
    }
}

impl Display for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!(
            "TCPv4Transport(address={:?}, port={})",
            self.address, self.port
        ))
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn start_server(&mut self) -> Result<(), YakNsError> {
        let bind_addr = resolve_bind_address(&self.address, self.port, AddressFamily::V4).await?;
        let deadline = Instant::now() + BIND_TIMEOUT;
        let listener = loop {
            let socket = match bind_addr {
                SocketAddr::V4(_) => TcpSocket::new_v4(),
                SocketAddr::V6(_) => TcpSocket::new_v6(),
            }?;
            socket.set_reuseaddr(true)?;
            match socket.bind(bind_addr) {
                Ok(()) => break socket.listen(1024)?,
                Err(error) if error.kind() == io::ErrorKind::AddrInUse => {
                    if Instant::now() + BIND_RETRY_INTERVAL >= deadline {
                        return Err(YakNsError::StartupError(format!(
                            "failed to bind {bind_addr} within {BIND_TIMEOUT:?}"
                        )));
                    }
                    warn!("{bind_addr} already in use, retrying in {BIND_RETRY_INTERVAL:?}");
                    sleep(BIND_RETRY_INTERVAL).await;
                }
                Err(error) => return Err(error.into()),
            }
        };
        info!("Started TCP listener on {}", listener.local_addr()?);
        self.listener = Some(listener);
        self.last_cleanup = Instant::now();
        Ok(())
    }

    async fn receive_message(&mut self) -> Result<MessageContainer, YakNsError> {
        loop {
            // drain the ready queue first
            while let Some(connection_id) = self.ready.pop_front() {
                let viable = match self.cache.get(&connection_id) {
                    Some(connection) => connection.stream.peer_addr().is_ok(),
                    None => false,
                };
                if !viable {
                    self.remove_connection(connection_id).await;
                    continue;
                }
                match self.read_frame(connection_id).await? {
                    Some(container) => return Ok(container),
                    None => continue,
                }
            }

            let event = {
                let listener = self.listener.as_ref().ok_or_else(|| {
                    YakNsError::Transport("transport not started".to_string())
                })?;
                Self::next_event(listener, &self.cache).await?
            };

            match event {
                TcpEvent::Accepted(stream, remote_address) => {
                    debug!("TCP connection from {remote_address:?}");
                    self.cache_connection(stream, remote_address);
                }
                TcpEvent::Readable(connection_id) => self.mark_ready(connection_id).await,
                TcpEvent::Tick => {
                    if self.last_cleanup.elapsed() >= CACHE_CLEAN_INTERVAL {
                        self.cleanup().await;
                    }
                }
            }
        }
    }

    async fn send_message_response(
        &mut self,
        message: MessageContainer,
    ) -> Result<(), YakNsError> {
        let TransportHandle::Tcp(connection_id) = message.handle else {
            return Err(YakNsError::Transport(
                "message did not originate from this transport".to_string(),
            ));
        };
        let reply = message
            .response
            .ok_or_else(|| YakNsError::Transport("response not set".to_string()))?;

        let reply_bytes = reply.as_bytes()?;
        let response_length = u16::try_from(reply_bytes.len()).map_err(|_| {
            YakNsError::InvalidValue(format!(
                "reply of {} bytes is too long for a TCP frame",
                reply_bytes.len()
            ))
        })?;

        let Some(connection) = self.cache.get_mut(&connection_id) else {
            debug!("connection {connection_id} went away before the reply was sent");
            return Ok(());
        };

        let mut frame = Vec::with_capacity(reply_bytes.len() + 2);
        frame.extend(response_length.to_be_bytes());
        frame.extend(&reply_bytes);

        match connection.stream.write_all(&frame).await {
            Ok(()) => {
                trace!("{} bytes sent to {:?}", frame.len(), message.remote_address);
                // the connection stays open for pipelined queries
                Ok(())
            }
            Err(error)
                if error.kind() == io::ErrorKind::BrokenPipe
                    || error.kind() == io::ErrorKind::ConnectionReset =>
            {
                // peer closed - drop the response, ref RFC7766 6.2.4
                debug!(
                    "peer {:?} closed before the reply was sent: {error:?}",
                    message.remote_address
                );
                self.remove_connection(connection_id).await;
                Ok(())
            }
            Err(error) => Err(error.into()),
        }
    }

    async fn stop_server(&mut self) {
        // close the listening socket first so nothing new arrives while the
        // cache drains
        self.listener = None;
        let connection_ids: Vec<u64> = self.cache.keys().copied().collect();
        for connection_id in connection_ids {
            self.remove_connection(connection_id).await;
        }
        self.ready.clear();
        info!("Stopped TCP listener");
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.listener
            .as_ref()
            .and_then(|listener| listener.local_addr().ok())
    }
}
