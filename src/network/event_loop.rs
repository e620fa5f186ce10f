//! Event Loop
//!
//! One OS thread runs a current-thread tokio runtime that owns the
//! [`GhostServer`]. Each iteration runs the due timers (heartbeat, UDP
//! keep-alive, bulk ghost update), drains pending datagrams, waits a bounded
//! time for socket activity and finally runs queued operator commands.
//!
//! Per-connection work that may block (waiting for a handshake, reading and
//! writing TCP frames, sending datagrams) happens in spawned tasks that talk
//! to the loop over channels, so the loop itself never waits on one client.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::network::command::CommandQueue;
use crate::network::events::{EventSink, ServerEvent};
use crate::network::framing::{frame, read_frame, write_framed};
use crate::network::protocol::{Handshake, SessionId};
use crate::network::server::{Datagram, GhostServer, ServerConfig, ServerError};
use crate::network::session::SessionLink;

/// Time writers get to flush after the last session is closed.
const FLUSH_TIMEOUT: Duration = Duration::from_millis(500);

/// Longest a single frame write may stall before the connection is dropped.
const WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// Largest UDP datagram.
const MAX_DATAGRAM: usize = 64 * 1024;

/// Inbound events queued by connection tasks.
const INBOUND_CAPACITY: usize = 1024;

/// Why a connection produced no handshake.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    /// Nothing arrived before the deadline.
    #[error("no handshake before the deadline")]
    Timeout,
    /// Peer closed the connection first.
    #[error("connection closed before handshake")]
    Closed,
    /// Read failed or the frame was oversized.
    #[error("handshake read failed: {0}")]
    Io(#[from] io::Error),
}

/// Read the first frame of a new connection within `deadline`.
pub async fn read_handshake<R>(
    reader: &mut R,
    deadline: Duration,
    max_len: usize,
) -> Result<Vec<u8>, HandshakeError>
where
    R: AsyncRead + Unpin,
{
    match timeout(deadline, read_frame(reader, max_len)).await {
        Ok(Ok(Some(bytes))) => Ok(bytes),
        Ok(Ok(None)) => Err(HandshakeError::Closed),
        Ok(Err(e)) => Err(HandshakeError::Io(e)),
        Err(_) => Err(HandshakeError::Timeout),
    }
}

// =============================================================================
// HANDLE
// =============================================================================

/// Control handle for a running server. Dropping it stops the server.
#[derive(Debug)]
pub struct ServerHandle {
    queue: CommandQueue,
    events: EventSink,
    stop: Arc<AtomicBool>,
    local_addr: SocketAddr,
    thread: Option<JoinHandle<()>>,
}

impl ServerHandle {
    /// Address the TCP listener is bound to. UDP uses the same port.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Queue a mutation to run on the loop thread between ticks.
    pub fn schedule<F>(&self, f: F) -> Result<(), ServerError>
    where
        F: FnOnce(&mut GhostServer) + Send + 'static,
    {
        if self.queue.submit(Box::new(f)) {
            Ok(())
        } else {
            Err(ServerError::Stopped)
        }
    }

    /// Run `f` on the loop thread and wait for its result.
    pub async fn request<F, R>(&self, f: F) -> Result<R, ServerError>
    where
        F: FnOnce(&mut GhostServer) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.schedule(move |server| {
            let _ = tx.send(f(server));
        })?;
        rx.await.map_err(|_| ServerError::Stopped)
    }

    /// Subscribe to operator events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    /// Stop the loop, disconnecting every session, and wait for it to exit.
    /// Blocks the calling thread.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("event loop thread panicked");
            }
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Bind TCP and UDP on the configured port and start the loop thread.
pub fn start_server(config: ServerConfig) -> Result<ServerHandle, ServerError> {
    config.validate()?;

    let addr = config.bind_addr();
    let tcp =
        std::net::TcpListener::bind(addr).map_err(|source| ServerError::Bind { addr, source })?;
    let local_addr = tcp.local_addr()?;
    let udp_addr = SocketAddr::new(config.bind_ip, local_addr.port());
    let udp = std::net::UdpSocket::bind(udp_addr).map_err(|source| ServerError::Bind {
        addr: udp_addr,
        source,
    })?;
    tcp.set_nonblocking(true)?;
    udp.set_nonblocking(true)?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let (listener, udp) = {
        let _guard = runtime.enter();
        (TcpListener::from_std(tcp)?, UdpSocket::from_std(udp)?)
    };

    let events = EventSink::new(config.event_capacity);
    let queue = CommandQueue::new();
    let stop = Arc::new(AtomicBool::new(false));

    let (datagram_tx, datagram_rx) = mpsc::channel(config.outbound_capacity);
    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
    let event_loop = EventLoop {
        server: GhostServer::new(config, events.clone(), datagram_tx),
        listener,
        udp: Arc::new(udp),
        udp_buf: vec![0u8; MAX_DATAGRAM],
        queue: queue.clone(),
        stop: stop.clone(),
        inbound_tx,
        inbound_rx,
        writers: JoinSet::new(),
        local_addr,
    };

    let thread = std::thread::Builder::new()
        .name("ghost-server".into())
        .spawn(move || {
            runtime.block_on(async move {
                tokio::spawn(send_datagrams(event_loop.udp.clone(), datagram_rx));
                event_loop.run().await;
            });
        })?;

    events.emit(format!("Server started on port {}", local_addr.port()));
    Ok(ServerHandle {
        queue,
        events,
        stop,
        local_addr,
        thread: Some(thread),
    })
}

// =============================================================================
// LOOP
// =============================================================================

/// Events produced by connection tasks.
#[derive(Debug)]
enum Inbound {
    /// First frame of a new connection.
    Handshake {
        stream: TcpStream,
        remote: SocketAddr,
        bytes: Vec<u8>,
    },
    /// Frame read from an admitted session's stream.
    Packet { ip: IpAddr, bytes: Vec<u8> },
    /// An admitted session's stream ended or failed.
    Closed { id: SessionId },
}

/// What ended a readiness wait.
enum Wake {
    Accepted(io::Result<(TcpStream, SocketAddr)>),
    Inbound(Inbound),
    Idle,
}

struct EventLoop {
    server: GhostServer,
    listener: TcpListener,
    udp: Arc<UdpSocket>,
    udp_buf: Vec<u8>,
    queue: CommandQueue,
    stop: Arc<AtomicBool>,
    inbound_tx: mpsc::Sender<Inbound>,
    inbound_rx: mpsc::Receiver<Inbound>,
    writers: JoinSet<()>,
    local_addr: SocketAddr,
}

impl EventLoop {
    #[instrument(name = "event_loop", skip_all, fields(addr = %self.local_addr))]
    async fn run(mut self) {
        info!("event loop running");
        let config = self.server.config().clone();
        let start = Instant::now();
        let mut last_heartbeat = start;
        let mut last_keepalive = start;
        let mut last_update = start;

        while !self.stop.load(Ordering::Acquire) {
            let now = Instant::now();
            if now.duration_since(last_heartbeat) >= config.heartbeat_interval() {
                self.server.heartbeat_pass();
                last_heartbeat = now;
            }
            if now.duration_since(last_keepalive) >= config.keepalive_interval() {
                self.server.send_keepalives();
                last_keepalive = now;
            }
            if now.duration_since(last_update) >= config.update_interval() {
                self.server.broadcast_ghost_states();
                last_update = now;
            }

            self.drain_datagrams();
            self.wait_for_activity(config.update_interval()).await;

            let ran = self.queue.run_pending(&mut self.server);
            if ran > 0 {
                trace!(commands = ran, "ran queued commands");
            }
        }

        self.finish().await;
    }

    async fn wait_for_activity(&mut self, wait: Duration) {
        let wake = tokio::select! {
            accepted = self.listener.accept() => Wake::Accepted(accepted),
            Some(event) = self.inbound_rx.recv() => Wake::Inbound(event),
            _ = self.udp.readable() => Wake::Idle,
            Some(_) = self.writers.join_next(), if !self.writers.is_empty() => Wake::Idle,
            _ = sleep(wait) => Wake::Idle,
        };

        match wake {
            Wake::Accepted(Ok((stream, remote))) => self.on_accept(stream, remote),
            Wake::Accepted(Err(e)) => warn!(error = %e, "accept failed"),
            Wake::Inbound(event) => self.on_inbound(event),
            Wake::Idle => {}
        }
        while let Ok(event) = self.inbound_rx.try_recv() {
            self.on_inbound(event);
        }
        self.drain_datagrams();
    }

    fn on_accept(&self, stream: TcpStream, remote: SocketAddr) {
        if self.server.screen_address(remote.ip()).is_err() {
            return;
        }
        debug!(%remote, "awaiting handshake");
        let config = self.server.config();
        tokio::spawn(await_handshake(
            stream,
            remote,
            config.handshake_timeout(),
            config.max_frame_len,
            self.inbound_tx.clone(),
        ));
    }

    fn on_inbound(&mut self, event: Inbound) {
        match event {
            Inbound::Handshake {
                stream,
                remote,
                bytes,
            } => self.admit(stream, remote, &bytes),
            Inbound::Packet { ip, bytes } => {
                if let Err(e) = self.server.dispatch(&bytes, ip, None) {
                    debug!(%ip, error = %e, "dropped tcp packet");
                }
            }
            Inbound::Closed { id } => {
                self.server.disconnect(id, "socket died");
            }
        }
    }

    fn admit(&mut self, stream: TcpStream, remote: SocketAddr, bytes: &[u8]) {
        let handshake = match Handshake::decode(bytes) {
            Ok(handshake) => handshake,
            Err(e) => {
                debug!(%remote, error = %e, "malformed handshake");
                return;
            }
        };

        let config = self.server.config();
        let (read_half, write_half) = stream.into_split();
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_capacity);
        let (admitted_tx, admitted_rx) = oneshot::channel();
        let reader = tokio::spawn(read_session(
            read_half,
            remote.ip(),
            admitted_rx,
            self.inbound_tx.clone(),
            config.max_frame_len,
        ));
        let writer = self.writers.spawn(write_session(write_half, outbound_rx, WRITE_TIMEOUT));

        let link = SessionLink::new(outbound_tx, Some(reader.abort_handle()), Some(writer));
        if let Ok(id) = self.server.try_admit(remote, handshake, link) {
            let _ = admitted_tx.send(id);
        }
    }

    fn drain_datagrams(&mut self) {
        loop {
            match self.udp.try_recv_from(&mut self.udp_buf) {
                Ok((len, from)) => {
                    let bytes = &self.udp_buf[..len];
                    if let Err(e) = self.server.dispatch(bytes, from.ip(), Some(from.port())) {
                        trace!(%from, error = %e, "dropped datagram");
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    // ICMP port-unreachable surfaces here on some platforms.
                    trace!(error = %e, "udp receive failed");
                    break;
                }
            }
        }
    }

    async fn finish(mut self) {
        self.queue.close();
        self.server.shutdown();

        let writers = &mut self.writers;
        let flushed = timeout(FLUSH_TIMEOUT, async {
            while writers.join_next().await.is_some() {}
        })
        .await;
        if flushed.is_err() {
            debug!("writers still busy at shutdown");
            self.writers.abort_all();
        }

        self.server.events().emit("Server stopped!");
    }
}

// =============================================================================
// CONNECTION TASKS
// =============================================================================

async fn await_handshake(
    mut stream: TcpStream,
    remote: SocketAddr,
    deadline: Duration,
    max_len: usize,
    inbound: mpsc::Sender<Inbound>,
) {
    match read_handshake(&mut stream, deadline, max_len).await {
        Ok(bytes) => {
            let _ = inbound
                .send(Inbound::Handshake {
                    stream,
                    remote,
                    bytes,
                })
                .await;
        }
        Err(e) => trace!(%remote, error = %e, "connection dropped before handshake"),
    }
}

async fn read_session(
    mut reader: OwnedReadHalf,
    ip: IpAddr,
    admitted: oneshot::Receiver<SessionId>,
    inbound: mpsc::Sender<Inbound>,
    max_len: usize,
) {
    let Ok(id) = admitted.await else {
        return;
    };
    loop {
        match read_frame(&mut reader, max_len).await {
            Ok(Some(bytes)) => {
                if inbound.send(Inbound::Packet { ip, bytes }).await.is_err() {
                    return;
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(session = id, error = %e, "read failed");
                break;
            }
        }
    }
    let _ = inbound.send(Inbound::Closed { id }).await;
}

async fn write_session<W>(
    mut writer: W,
    mut outbound: mpsc::Receiver<Vec<u8>>,
    deadline: Duration,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(payload) = outbound.recv().await {
        match timeout(deadline, write_framed(&mut writer, &frame(&payload))).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(error = %e, "write failed");
                return;
            }
            Err(_) => {
                debug!("write stalled, dropping connection");
                return;
            }
        }
    }
    let _ = writer.shutdown().await;
}

async fn send_datagrams(socket: Arc<UdpSocket>, mut outbound: mpsc::Receiver<Datagram>) {
    while let Some(datagram) = outbound.recv().await {
        if let Err(e) = socket.send_to(&datagram.payload, datagram.target).await {
            trace!(target = %datagram.target, error = %e, "udp send failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::io::{duplex, AsyncReadExt};

    fn local_config() -> ServerConfig {
        ServerConfig {
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_read_handshake_times_out() {
        let (_client, mut server) = duplex(64);
        let result = read_handshake(&mut server, Duration::from_millis(20), 1024).await;
        assert!(matches!(result, Err(HandshakeError::Timeout)));
    }

    #[tokio::test]
    async fn test_read_handshake_reports_close() {
        let (client, mut server) = duplex(64);
        drop(client);
        let result = read_handshake(&mut server, Duration::from_millis(200), 1024).await;
        assert!(matches!(result, Err(HandshakeError::Closed)));
    }

    #[tokio::test]
    async fn test_read_handshake_returns_first_frame() {
        let (mut client, mut server) = duplex(64);
        write_framed(&mut client, &frame(b"hello")).await.unwrap();
        let bytes = read_handshake(&mut server, Duration::from_millis(200), 1024)
            .await
            .unwrap();
        assert_eq!(bytes, b"hello");
    }

    #[tokio::test]
    async fn test_stalled_writer_releases_socket_after_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, write_half) = stream.into_split();
        drop(read_half);

        let (tx, rx) = mpsc::channel(4);
        let writer = tokio::spawn(write_session(write_half, rx, Duration::from_millis(200)));
        let link = SessionLink::new(tx, None, Some(writer.abort_handle()));

        // The client never reads, so the socket buffers fill up.
        let mut refused = None;
        for _ in 0..100_000 {
            if let Err(e) = link.send(vec![0u8; 64 * 1024]) {
                refused = Some(e);
                break;
            }
            sleep(Duration::from_millis(1)).await;
        }
        assert!(refused.is_some(), "link never filled up");

        link.close();
        let finished = timeout(Duration::from_secs(3), writer).await;
        assert!(matches!(finished, Ok(Ok(()))));

        let mut rest = Vec::new();
        let drained = timeout(Duration::from_secs(10), client.read_to_end(&mut rest)).await;
        assert!(matches!(drained, Ok(Ok(_))));
    }

    #[tokio::test]
    async fn test_start_request_stop() {
        let handle = start_server(local_config()).unwrap();
        assert_ne!(handle.local_addr().port(), 0);

        let count = handle.request(|server| server.session_count()).await.unwrap();
        assert_eq!(count, 0);

        let ip: IpAddr = "10.9.9.9".parse().unwrap();
        handle.schedule(move |server| {
            server.ban(ip);
        })
        .unwrap();
        let bans = handle.request(|server| server.bans()).await.unwrap();
        assert_eq!(bans, vec![ip]);

        handle.stop();
    }

    #[tokio::test]
    async fn test_events_report_stop() {
        let handle = start_server(local_config()).unwrap();
        let mut events = handle.subscribe_events();
        handle.stop();

        let mut lines = Vec::new();
        while let Ok(event) = events.try_recv() {
            lines.push(event.message);
        }
        assert_eq!(lines.last().map(String::as_str), Some("Server stopped!"));
    }

    #[test]
    fn test_bind_conflict_is_reported() {
        let first = start_server(local_config()).unwrap();
        let taken = ServerConfig {
            port: first.local_addr().port(),
            ..local_config()
        };
        assert!(matches!(start_server(taken), Err(ServerError::Bind { .. })));
        first.stop();
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = ServerConfig {
            outbound_capacity: 0,
            ..local_config()
        };
        assert!(matches!(start_server(config), Err(ServerError::Config(_))));
    }
}
