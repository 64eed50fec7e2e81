//! Non-blocking multi-client MJPEG server.
//!
//! Every socket is non-blocking and driven from the capture loop's thread:
//! `accept_pending` admits connections, `pump_requests` waits for the first
//! request line, and `pump_responses` pushes the stream header and frame
//! envelopes straight from the capture buffers. A client that cannot take
//! more bytes keeps its position (chunk index plus byte offset) and resumes
//! on the next writable poll.

use anyhow::{bail, Context, Result};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::ops::AddAssign;
use std::os::unix::io::AsRawFd;
use std::time::Duration;

use crate::capture::{FrameHandle, FrameStore, FrameTimestamp};
use crate::fanout::{FrameFanoutQueue, FrameLease};
use crate::mjpeg::STREAM_HEADER;
use crate::poll::{Interest, Poller};

pub const DEFAULT_PORT: u16 = 8081;
pub const DEFAULT_MAX_CLIENTS: usize = 20;
pub const DEFAULT_MAX_REQUEST_BYTES: usize = 8192;
pub const DEFAULT_READ_CHUNK: usize = 2048;
pub const DEFAULT_MAX_WRITES_PER_PUMP: usize = 32;

#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Hosts to listen on; every address each one resolves to gets a listener.
    pub bind: Vec<String>,
    pub port: u16,
    pub max_clients: usize,
    /// Bytes a client may send without completing its request line.
    pub max_request_bytes: usize,
    pub read_chunk: usize,
    /// Write calls per client per pump.
    pub max_writes_per_pump: usize,
    /// How long a lone client's pump may wait for its socket to drain.
    pub send_wait: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: vec!["0.0.0.0".to_string()],
            port: DEFAULT_PORT,
            max_clients: DEFAULT_MAX_CLIENTS,
            max_request_bytes: DEFAULT_MAX_REQUEST_BYTES,
            read_chunk: DEFAULT_READ_CHUNK,
            max_writes_per_pump: DEFAULT_MAX_WRITES_PER_PUMP,
            send_wait: Duration::from_micros(1_000_000 / 30 / 2),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientPhase {
    AwaitingRequest,
    Serving,
}

struct InFlight {
    lease: FrameLease,
    chunk: usize,
    offset: usize,
}

#[derive(Default)]
struct SendCursor {
    header_sent: usize,
    in_flight: Option<InFlight>,
    last_timestamp: Option<FrameTimestamp>,
}

enum ClientState {
    AwaitingRequest { received: Vec<u8> },
    Serving(SendCursor),
}

struct ClientConnection {
    id: u64,
    stream: TcpStream,
    peer: SocketAddr,
    state: ClientState,
}

impl ClientConnection {
    fn phase(&self) -> ClientPhase {
        match self.state {
            ClientState::AwaitingRequest { .. } => ClientPhase::AwaitingRequest,
            ClientState::Serving(_) => ClientPhase::Serving,
        }
    }

    fn has_frame_in_flight(&self) -> bool {
        matches!(
            &self.state,
            ClientState::Serving(SendCursor {
                in_flight: Some(_),
                ..
            })
        )
    }

    /// Ends the connection, handing any frame lease back to the queue.
    fn close(self, queue: &mut FrameFanoutQueue) {
        if let ClientState::Serving(SendCursor {
            in_flight: Some(flight),
            ..
        }) = self.state
        {
            queue.release(flight.lease);
        }
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

enum RequestProgress {
    Pending,
    Complete,
    Closed(String),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PumpOutcome {
    pub bytes_written: usize,
    pub frames_completed: usize,
}

impl AddAssign for PumpOutcome {
    fn add_assign(&mut self, other: Self) {
        self.bytes_written += other.bytes_written;
        self.frames_completed += other.frames_completed;
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub accepted: u64,
    /// Connections refused at the client cap.
    pub rejected: u64,
    pub dropped: u64,
    pub frames_sent: u64,
    pub bytes_sent: u64,
}

pub struct StreamServer {
    config: ServerConfig,
    listeners: Vec<TcpListener>,
    clients: Vec<ClientConnection>,
    poller: Poller,
    scratch: Vec<u8>,
    next_client_id: u64,
    stats: ServerStats,
}

impl StreamServer {
    /// Listens on every address the configured hosts resolve to.
    ///
    /// Individual bind failures are logged; it is an error only if nothing
    /// could be bound.
    pub fn bind(config: ServerConfig) -> Result<Self> {
        if config.bind.is_empty() {
            bail!("no listen address configured");
        }
        let mut addrs: Vec<SocketAddr> = Vec::new();
        for host in &config.bind {
            let resolved = (host.as_str(), config.port)
                .to_socket_addrs()
                .with_context(|| format!("resolve listen address {}:{}", host, config.port))?;
            for addr in resolved {
                if !addrs.contains(&addr) {
                    addrs.push(addr);
                }
            }
        }

        let mut listeners = Vec::with_capacity(addrs.len());
        for addr in addrs {
            let listener = match TcpListener::bind(addr) {
                Ok(listener) => listener,
                Err(err) => {
                    log::warn!("StreamServer: bind {} failed: {}", addr, err);
                    continue;
                }
            };
            listener
                .set_nonblocking(true)
                .with_context(|| format!("set {} non-blocking", addr))?;
            log::info!(
                "StreamServer: listening on {}",
                listener.local_addr().unwrap_or(addr)
            );
            listeners.push(listener);
        }
        if listeners.is_empty() {
            bail!(
                "could not bind any address for port {} ({})",
                config.port,
                config.bind.join(", ")
            );
        }

        Ok(Self {
            scratch: vec![0u8; config.read_chunk.max(1)],
            config,
            listeners,
            clients: Vec::new(),
            poller: Poller::new(),
            next_client_id: 1,
            stats: ServerStats::default(),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .iter()
            .filter_map(|listener| listener.local_addr().ok())
            .collect()
    }

    /// Admits waiting connections. Connections beyond the client cap are
    /// closed immediately without creating any client state.
    pub fn accept_pending(&mut self) -> usize {
        if self.listeners.is_empty() {
            return 0;
        }
        let fds = self.listeners.iter().map(|listener| listener.as_raw_fd());
        match self.poller.wait(fds, Interest::Read, Duration::ZERO) {
            Ok(0) => return 0,
            Ok(_) => {}
            Err(err) => {
                log::warn!("StreamServer: poll on listeners failed: {}", err);
                return 0;
            }
        }

        let mut admitted = 0;
        for (slot, listener) in self.listeners.iter().enumerate() {
            if !self.poller.is_ready(slot) {
                continue;
            }
            loop {
                let (stream, peer) = match listener.accept() {
                    Ok(accepted) => accepted,
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        log::warn!("StreamServer: accept failed: {}", err);
                        break;
                    }
                };
                if self.clients.len() >= self.config.max_clients {
                    self.stats.rejected += 1;
                    log::warn!(
                        "StreamServer: rejecting {}: {} clients connected",
                        peer,
                        self.clients.len()
                    );
                    continue;
                }
                if let Err(err) = stream.set_nonblocking(true) {
                    log::warn!("StreamServer: dropping {}: {}", peer, err);
                    continue;
                }
                if let Err(err) = stream.set_nodelay(true) {
                    log::debug!("StreamServer: TCP_NODELAY not set for {}: {}", peer, err);
                }

                let id = self.next_client_id;
                self.next_client_id += 1;
                log::info!("StreamServer: client {} connected from {}", id, peer);
                self.clients.push(ClientConnection {
                    id,
                    stream,
                    peer,
                    state: ClientState::AwaitingRequest {
                        received: Vec::new(),
                    },
                });
                self.stats.accepted += 1;
                admitted += 1;
            }
        }
        admitted
    }

    /// Reads from clients that have not sent a full request line yet and
    /// promotes those that have. Returns how many were promoted.
    pub fn pump_requests(&mut self) -> usize {
        let awaiting: Vec<usize> = self.indices_in(ClientPhase::AwaitingRequest);
        if awaiting.is_empty() {
            return 0;
        }
        let fds = awaiting.iter().map(|&i| self.clients[i].stream.as_raw_fd());
        match self.poller.wait(fds, Interest::Read, Duration::ZERO) {
            Ok(0) => return 0,
            Ok(_) => {}
            Err(err) => {
                log::warn!("StreamServer: poll on clients failed: {}", err);
                return 0;
            }
        }

        let mut promoted = 0;
        let mut closed = Vec::new();
        for (slot, &index) in awaiting.iter().enumerate() {
            if !self.poller.is_ready(slot) {
                continue;
            }
            let client = &mut self.clients[index];
            match read_request(client, &mut self.scratch, self.config.max_request_bytes) {
                RequestProgress::Pending => {}
                RequestProgress::Complete => {
                    client.state = ClientState::Serving(SendCursor::default());
                    log::info!("StreamServer: client {} ({}) streaming", client.id, client.peer);
                    promoted += 1;
                }
                RequestProgress::Closed(reason) => {
                    log::info!("StreamServer: client {} closed: {}", client.id, reason);
                    closed.push(index);
                }
            }
        }
        for index in closed.into_iter().rev() {
            let client = self.clients.remove(index);
            let _ = client.stream.shutdown(Shutdown::Both);
            self.stats.dropped += 1;
        }
        promoted
    }

    /// Pushes pending bytes to serving clients whose sockets are writable,
    /// waiting up to `timeout` for any of them to become so.
    pub fn pump_responses(
        &mut self,
        queue: &mut FrameFanoutQueue,
        store: &dyn FrameStore,
        timeout: Duration,
    ) -> PumpOutcome {
        let mut outcome = PumpOutcome::default();
        let serving: Vec<usize> = self.indices_in(ClientPhase::Serving);
        if serving.is_empty() {
            return outcome;
        }
        let fds = serving.iter().map(|&i| self.clients[i].stream.as_raw_fd());
        match self.poller.wait(fds, Interest::Write, timeout) {
            Ok(0) => return outcome,
            Ok(_) => {}
            Err(err) => {
                log::warn!("StreamServer: poll on clients failed: {}", err);
                return outcome;
            }
        }

        let mut failed = Vec::new();
        for (slot, &index) in serving.iter().enumerate() {
            if !self.poller.is_ready(slot) {
                continue;
            }
            let client = &mut self.clients[index];
            let result = send_pending(
                client,
                queue,
                store,
                self.config.max_writes_per_pump,
                &mut outcome,
            );
            if let Err(err) = result {
                log::info!("StreamServer: client {} dropped: {}", client.id, err);
                failed.push(index);
            }
        }
        self.remove_clients(failed, queue);

        self.stats.bytes_sent += outcome.bytes_written as u64;
        self.stats.frames_sent += outcome.frames_completed as u64;
        outcome
    }

    /// One serve phase of the driving loop.
    ///
    /// A lone serving client is pumped for as long as it keeps taking bytes,
    /// so it is never capped by a per-iteration write budget.
    pub fn serve(&mut self, queue: &mut FrameFanoutQueue, store: &dyn FrameStore) -> PumpOutcome {
        let mut total = self.pump_responses(queue, store, Duration::ZERO);
        let mut last = total;
        while last.bytes_written > 0 && self.clients.len() == 1 && self.serving_count() == 1 {
            last = self.pump_responses(queue, store, self.config.send_wait);
            total += last;
        }
        self.accept_pending();
        self.pump_requests();
        total
    }

    /// Drops the newest connections until the client cap holds. Returns how many went.
    pub fn enforce_capacity(&mut self, queue: &mut FrameFanoutQueue) -> usize {
        let excess = self.clients.len().saturating_sub(self.config.max_clients);
        if excess == 0 {
            return 0;
        }
        let start = self.clients.len() - excess;
        for client in self.clients.split_off(start) {
            log::warn!(
                "StreamServer: client {} dropped, over the {} client limit",
                client.id,
                self.config.max_clients
            );
            client.close(queue);
            self.stats.dropped += 1;
        }
        excess
    }

    pub fn set_max_clients(&mut self, max_clients: usize) {
        self.config.max_clients = max_clients;
    }

    /// Gives in-flight sends `attempts` pumps of up to `wait` each to finish,
    /// then drops clients still holding a frame and returns every queued buffer.
    pub fn drain(
        &mut self,
        queue: &mut FrameFanoutQueue,
        store: &dyn FrameStore,
        attempts: u32,
        wait: Duration,
    ) -> Vec<FrameHandle> {
        let mut handles = queue.drain_all(attempts, |queue| {
            self.pump_responses(queue, store, wait);
        });
        if queue.in_flight() > 0 {
            let dropped = self.drop_in_flight_clients(queue);
            log::warn!("StreamServer: dropped {} client(s) stuck mid-frame", dropped);
            handles.extend(queue.evict_ready(true));
        }
        handles
    }

    /// Drops every client that is part-way through a frame.
    pub fn drop_in_flight_clients(&mut self, queue: &mut FrameFanoutQueue) -> usize {
        let stuck: Vec<usize> = self
            .clients
            .iter()
            .enumerate()
            .filter(|(_, client)| client.has_frame_in_flight())
            .map(|(index, _)| index)
            .collect();
        let count = stuck.len();
        self.remove_clients(stuck, queue);
        count
    }

    /// Drains the queue, then closes every client and listener.
    pub fn shutdown(
        &mut self,
        queue: &mut FrameFanoutQueue,
        store: &dyn FrameStore,
        attempts: u32,
        wait: Duration,
    ) -> Vec<FrameHandle> {
        if self.listeners.is_empty() && self.clients.is_empty() {
            return queue.evict_ready(true);
        }
        let mut handles = self.drain(queue, store, attempts, wait);
        for client in self.clients.drain(..) {
            client.close(queue);
        }
        handles.extend(queue.evict_ready(true));
        self.listeners.clear();
        log::info!("StreamServer: stopped");
        handles
    }

    pub fn connection_count(&self) -> usize {
        self.clients.len()
    }

    pub fn serving_count(&self) -> usize {
        self.count_in(ClientPhase::Serving)
    }

    pub fn awaiting_count(&self) -> usize {
        self.count_in(ClientPhase::AwaitingRequest)
    }

    /// Phase of each connection, oldest first.
    pub fn client_phases(&self) -> Vec<ClientPhase> {
        self.clients.iter().map(ClientConnection::phase).collect()
    }

    pub fn stats(&self) -> ServerStats {
        self.stats
    }

    fn count_in(&self, phase: ClientPhase) -> usize {
        self.clients.iter().filter(|c| c.phase() == phase).count()
    }

    fn indices_in(&self, phase: ClientPhase) -> Vec<usize> {
        self.clients
            .iter()
            .enumerate()
            .filter(|(_, client)| client.phase() == phase)
            .map(|(index, _)| index)
            .collect()
    }

    /// Removes clients by index (ascending), releasing their leases.
    fn remove_clients(&mut self, indices: Vec<usize>, queue: &mut FrameFanoutQueue) {
        for index in indices.into_iter().rev() {
            let client = self.clients.remove(index);
            client.close(queue);
            self.stats.dropped += 1;
        }
    }
}

fn read_request(
    client: &mut ClientConnection,
    scratch: &mut [u8],
    max_request_bytes: usize,
) -> RequestProgress {
    let ClientState::AwaitingRequest { received } = &mut client.state else {
        return RequestProgress::Complete;
    };
    loop {
        match client.stream.read(scratch) {
            Ok(0) => return RequestProgress::Closed("peer closed before request".to_string()),
            Ok(n) => {
                let fresh = &scratch[..n];
                received.extend_from_slice(fresh);
                if fresh.contains(&b'\n') {
                    return RequestProgress::Complete;
                }
                if received.len() > max_request_bytes {
                    return RequestProgress::Closed(format!(
                        "no request line within {} bytes",
                        max_request_bytes
                    ));
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return RequestProgress::Pending,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return RequestProgress::Closed(err.to_string()),
        }
    }
}

/// Runs one client's bounded send loop. Returns an error only for socket
/// failures, which end the connection.
fn send_pending(
    client: &mut ClientConnection,
    queue: &mut FrameFanoutQueue,
    store: &dyn FrameStore,
    max_writes: usize,
    outcome: &mut PumpOutcome,
) -> io::Result<()> {
    let ClientConnection { stream, state, .. } = client;
    let ClientState::Serving(cursor) = state else {
        return Ok(());
    };

    let mut writes = 0;
    while writes < max_writes {
        if cursor.header_sent < STREAM_HEADER.len() {
            writes += 1;
            match write_some(stream, &STREAM_HEADER[cursor.header_sent..])? {
                Some(n) => {
                    cursor.header_sent += n;
                    outcome.bytes_written += n;
                    continue;
                }
                None => return Ok(()),
            }
        }

        if cursor.in_flight.is_none() {
            let Some(lease) = queue.select_next_for_client(cursor.last_timestamp) else {
                return Ok(());
            };
            cursor.in_flight = Some(InFlight {
                lease,
                chunk: 0,
                offset: 0,
            });
        }
        let Some(flight) = cursor.in_flight.as_mut() else {
            return Ok(());
        };

        let frame = queue
            .frame(flight.lease.frame_id())
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "leased frame left the queue"))?;
        let chunk_count = frame.chunk_count();
        if flight.chunk < chunk_count {
            let bytes = frame.chunk(flight.chunk, store).ok_or_else(|| {
                io::Error::new(io::ErrorKind::Other, "frame buffer no longer readable")
            })?;
            let rest = bytes.get(flight.offset..).unwrap_or_default();
            if rest.is_empty() {
                flight.chunk += 1;
                flight.offset = 0;
            } else {
                writes += 1;
                match write_some(stream, rest)? {
                    Some(n) => {
                        outcome.bytes_written += n;
                        flight.offset += n;
                        if n == rest.len() {
                            flight.chunk += 1;
                            flight.offset = 0;
                        }
                    }
                    None => return Ok(()),
                }
            }
        }

        if flight.chunk >= chunk_count {
            if let Some(done) = cursor.in_flight.take() {
                cursor.last_timestamp = Some(done.lease.timestamp());
                queue.release(done.lease);
                outcome.frames_completed += 1;
            }
        }
    }
    Ok(())
}

/// Writes what the socket takes. `None` means it would block.
fn write_some(stream: &mut TcpStream, bytes: &[u8]) -> io::Result<Option<usize>> {
    loop {
        match stream.write(bytes) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => return Ok(Some(n)),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
}
