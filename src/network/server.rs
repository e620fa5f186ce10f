//! Ghost Session Engine
//!
//! [`GhostServer`] owns every piece of mutable server state: the session
//! registry, the admission policy, the heartbeat token generator and the
//! outbound UDP queue. It is driven exclusively by the event loop thread;
//! external code reaches it only through commands (see [`super::command`]).
//!
//! Message handling, heartbeats and countdowns live in their own modules as
//! further `impl GhostServer` blocks. This module holds configuration,
//! admission, eviction, fan-out and the operator surface.

use std::mem;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::core::rng::TokenRng;
use crate::network::admission::{AdmissionError, AdmissionState, Category, WhitelistEntry};
use crate::network::events::EventSink;
use crate::network::framing::DEFAULT_MAX_FRAME_LEN;
use crate::network::protocol::{GhostUpdate, Handshake, Roster, ServerMessage, SessionId, SERVER_ID};
use crate::network::session::{Session, SessionLink, SessionRegistry, SessionSummary};

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address both sockets bind to.
    pub bind_ip: IpAddr,
    /// TCP and UDP port. 0 picks a free port.
    pub port: u16,
    /// Time between heartbeat challenges.
    pub heartbeat_interval_ms: u64,
    /// Time between UDP keep-alives.
    pub keepalive_interval_ms: u64,
    /// Time between bulk ghost updates; also bounds each readiness wait.
    pub update_interval_ms: u64,
    /// Deadline for the handshake after a TCP connection is accepted.
    pub handshake_timeout_ms: u64,
    /// Frames queued per session before it counts as dead.
    pub outbound_capacity: usize,
    /// Largest TCP frame accepted.
    pub max_frame_len: usize,
    /// Events buffered per slow subscriber.
    pub event_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: crate::DEFAULT_PORT,
            heartbeat_interval_ms: 5000,
            keepalive_interval_ms: 1000,
            update_interval_ms: 50,
            handshake_timeout_ms: 1500,
            outbound_capacity: 256,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            event_capacity: 256,
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `GHOST_BIND` and `GHOST_PORT`.
    pub fn from_env() -> Result<Self, ServerError> {
        Self::default().with_env()
    }

    /// Apply `GHOST_BIND` and `GHOST_PORT` on top of this configuration.
    pub fn with_env(mut self) -> Result<Self, ServerError> {
        if let Ok(bind) = std::env::var("GHOST_BIND") {
            self.bind_ip = bind.parse().map_err(|_| {
                ServerError::Config(format!("GHOST_BIND is not an IP address: {bind}"))
            })?;
        }
        if let Ok(port) = std::env::var("GHOST_PORT") {
            self.port = port
                .parse()
                .map_err(|_| ServerError::Config(format!("GHOST_PORT is not a port: {port}")))?;
        }
        Ok(self)
    }

    /// Load from a JSON file. Missing fields keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ServerError> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the event loop cannot run with.
    pub fn validate(&self) -> Result<(), ServerError> {
        let intervals = [
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("keepalive_interval_ms", self.keepalive_interval_ms),
            ("update_interval_ms", self.update_interval_ms),
            ("handshake_timeout_ms", self.handshake_timeout_ms),
        ];
        for (field, value) in intervals {
            if value == 0 {
                return Err(ServerError::Config(format!("{field} must be positive")));
            }
        }
        if self.outbound_capacity == 0 {
            return Err(ServerError::Config("outbound_capacity must be positive".into()));
        }
        if self.max_frame_len == 0 {
            return Err(ServerError::Config("max_frame_len must be positive".into()));
        }
        Ok(())
    }

    /// Socket address both transports bind to.
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_ip, self.port)
    }

    /// Heartbeat period.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Keep-alive period.
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    /// Bulk update period.
    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_interval_ms)
    }

    /// Handshake deadline.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

/// Server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Failed to bind a socket.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address that could not be bound.
        addr: SocketAddr,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// I/O error outside binding (config file, runtime setup).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Config file is not valid JSON for [`ServerConfig`].
    #[error("invalid config file: {0}")]
    Json(#[from] serde_json::Error),

    /// The event loop has stopped; commands can no longer run.
    #[error("server loop is not running")]
    Stopped,
}

// =============================================================================
// ENGINE
// =============================================================================

/// Datagram queued for the UDP sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    /// Destination.
    pub target: SocketAddr,
    /// Unframed message.
    pub payload: Vec<u8>,
}

/// Engine state. Owned and mutated only by the event loop thread.
#[derive(Debug)]
pub struct GhostServer {
    pub(crate) config: ServerConfig,
    pub(crate) sessions: SessionRegistry,
    pub(crate) admission: AdmissionState,
    pub(crate) rng: TokenRng,
    pub(crate) datagrams: mpsc::Sender<Datagram>,
    pub(crate) events: EventSink,
    next_id: SessionId,
    /// Sessions whose link failed during the current operation.
    dead: Vec<SessionId>,
}

impl GhostServer {
    /// Create an engine that queues datagrams on `datagrams`.
    pub fn new(config: ServerConfig, events: EventSink, datagrams: mpsc::Sender<Datagram>) -> Self {
        Self {
            config,
            sessions: SessionRegistry::new(),
            admission: AdmissionState::default(),
            rng: TokenRng::from_clock(),
            datagrams,
            events,
            next_id: SERVER_ID + 1,
            dead: Vec::new(),
        }
    }

    /// Create an engine without sockets. The receiver yields every datagram
    /// the engine would send.
    pub fn detached(config: ServerConfig) -> (Self, mpsc::Receiver<Datagram>) {
        let (tx, rx) = mpsc::channel(config.outbound_capacity.max(1));
        let events = EventSink::new(config.event_capacity);
        (Self::new(config, events, tx), rx)
    }

    /// Replace the heartbeat token generator.
    pub fn with_rng(mut self, rng: TokenRng) -> Self {
        self.rng = rng;
        self
    }

    /// Active configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Operator event stream.
    pub fn events(&self) -> &EventSink {
        &self.events
    }

    /// Number of connected sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Borrow a live session.
    pub fn session(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(id)
    }

    // -------------------------------------------------------------------------
    // Admission
    // -------------------------------------------------------------------------

    /// Ban and duplicate-address check run when a TCP connection is accepted,
    /// before any handshake bytes are read.
    pub fn screen_address(&self, ip: IpAddr) -> Result<(), AdmissionError> {
        let result = self
            .admission
            .check_address(ip, self.sessions.contains_ip(ip));
        if let Err(reason) = result {
            self.log_refusal(ip, reason);
        }
        result
    }

    /// Admit a handshake as a new session.
    ///
    /// On success the new session receives the roster of every session that
    /// was already connected, and only then is it announced to them. On
    /// refusal the link is closed without a reply.
    pub fn try_admit(
        &mut self,
        remote: SocketAddr,
        handshake: Handshake,
        link: SessionLink,
    ) -> Result<SessionId, AdmissionError> {
        let ip = remote.ip();
        if let Err(reason) = self.admission.check(
            ip,
            self.sessions.contains_ip(ip),
            &handshake.name,
            handshake.spectator,
        ) {
            self.log_refusal(ip, reason);
            link.close();
            return Err(reason);
        }

        let id = self.next_id;
        self.next_id += 1;

        let session = Session::new(id, ip, handshake, link);
        let roster = Roster {
            id,
            peers: self.sessions.peers(),
        };
        let roster_failed = session.send(roster.encode()).is_err();
        let announce = ServerMessage::Connect(session.peer_info()).encode();

        self.events.emit(format!(
            "Connection: {} ({}) @ {}:{}",
            session.name,
            session.kind(),
            session.remote_ip,
            session.udp_port
        ));
        self.sessions.insert(session);
        if roster_failed {
            self.dead.push(id);
        }

        self.fan_out(Some(id), &announce);
        self.reap_dead();
        Ok(id)
    }

    fn log_refusal(&self, ip: IpAddr, reason: AdmissionError) {
        self.events.emit(format!("Refused connection from {ip} - {reason}"));
    }

    // -------------------------------------------------------------------------
    // Eviction & fan-out
    // -------------------------------------------------------------------------

    /// Disconnect a session: every other session is told, the stream is
    /// closed and the departure is logged. Returns false if `id` is unknown.
    pub fn disconnect(&mut self, id: SessionId, reason: &str) -> bool {
        let removed = self.evict(id, reason);
        self.reap_dead();
        removed
    }

    fn evict(&mut self, id: SessionId, reason: &str) -> bool {
        match self.remove_session(id, reason) {
            Some(session) => {
                session.close();
                true
            }
            None => false,
        }
    }

    /// Unregister a session, tell everyone else and log the departure. The
    /// caller decides how the stream is closed.
    fn remove_session(&mut self, id: SessionId, reason: &str) -> Option<Session> {
        let session = self.sessions.remove(id)?;
        let notice = ServerMessage::Disconnect { id }.encode();
        self.fan_out(None, &notice);
        self.events.emit(format!(
            "Disconnect: {} ({}) @ {}:{} Reason: {}",
            session.name,
            session.kind(),
            session.remote_ip,
            session.udp_port,
            reason
        ));
        Some(session)
    }

    /// Evict every session whose link failed, including sessions that fail
    /// while the first batch is being announced. Their streams are torn down
    /// without flushing.
    pub(crate) fn reap_dead(&mut self) {
        while !self.dead.is_empty() {
            for id in mem::take(&mut self.dead) {
                if let Some(session) = self.remove_session(id, "socket died") {
                    session.abort();
                }
            }
        }
    }

    /// Queue a payload for one session over TCP.
    pub(crate) fn send_to(&mut self, id: SessionId, payload: Vec<u8>) {
        if let Some(session) = self.sessions.get(id) {
            if let Err(e) = session.send(payload) {
                debug!(session = id, error = %e, "send failed");
                self.dead.push(id);
            }
        }
    }

    /// Queue a payload for every session except `except` over TCP.
    pub(crate) fn fan_out(&mut self, except: Option<SessionId>, payload: &[u8]) {
        for session in self.sessions.iter() {
            if Some(session.id) == except {
                continue;
            }
            if let Err(e) = session.send(payload.to_vec()) {
                debug!(session = session.id, error = %e, "send failed");
                self.dead.push(session.id);
            }
        }
    }

    /// Send every session the full list of ghost states: by UDP when the
    /// session accepts datagrams, over TCP otherwise.
    pub fn broadcast_ghost_states(&mut self) {
        if self.sessions.is_empty() {
            return;
        }
        let entries = self
            .sessions
            .iter()
            .map(|s| GhostUpdate {
                id: s.id,
                ghost: s.ghost,
            })
            .collect();
        let payload = ServerMessage::Update {
            id: SERVER_ID,
            entries,
        }
        .encode();

        for session in self.sessions.iter() {
            if session.uses_datagrams() {
                queue_datagram(&self.datagrams, session, payload.clone());
            } else if let Err(e) = session.send(payload.clone()) {
                debug!(session = session.id, error = %e, "update failed");
                self.dead.push(session.id);
            }
        }
        self.reap_dead();
    }

    /// Disconnect everyone. Called once when the loop stops.
    pub fn shutdown(&mut self) {
        for id in self.sessions.ids() {
            self.evict(id, "server stopped");
        }
        self.dead.clear();
    }

    // -------------------------------------------------------------------------
    // Operator surface
    // -------------------------------------------------------------------------

    /// Send a chat line from the server to every session.
    pub fn broadcast_message(&mut self, text: &str) {
        let payload = ServerMessage::Message {
            id: SERVER_ID,
            text: text.to_string(),
        }
        .encode();
        self.fan_out(None, &payload);
        self.events.emit(format!("[server message] {text}"));
        self.reap_dead();
    }

    /// Disconnect every session with exactly this name. Returns how many.
    pub fn kick_by_name(&mut self, name: &str) -> usize {
        let ids = self.sessions.find_by_name(name);
        for &id in &ids {
            self.evict(id, "kicked");
        }
        self.reap_dead();
        ids.len()
    }

    /// Disconnect every session at `ip` and refuse the address from now on.
    /// Returns how many sessions were disconnected.
    pub fn ban(&mut self, ip: IpAddr) -> usize {
        let ids = self.sessions.find_by_ip(ip);
        for &id in &ids {
            self.evict(id, "banned");
        }
        self.reap_dead();
        if self.admission.banned.insert(ip) {
            self.events.emit(format!("Banned IP {ip}"));
        }
        ids.len()
    }

    /// Lift a ban. Returns false if the address was not banned.
    pub fn unban(&mut self, ip: IpAddr) -> bool {
        let removed = self.admission.banned.remove(&ip);
        if removed {
            self.events.emit(format!("Unbanned IP {ip}"));
        }
        removed
    }

    /// Open or close admission for a category of clients.
    pub fn set_accepting(&mut self, category: Category, accepting: bool) {
        self.admission.set_accepting(category, accepting);
        let who = match category {
            Category::Players => "players",
            Category::Spectators => "spectators",
            Category::All => "players and spectators",
        };
        let verb = if accepting { "accepting" } else { "refusing" };
        self.events.emit(format!("Now {verb} connections from {who}"));
    }

    /// Turn the whitelist on or off.
    pub fn set_whitelist_enabled(&mut self, enabled: bool) {
        self.admission.whitelist_enabled = enabled;
        let state = if enabled { "enabled" } else { "disabled" };
        self.events.emit(format!("Whitelist now {state}"));
    }

    /// Add a whitelist entry. Returns false if it was already present.
    pub fn add_whitelist_entry(&mut self, entry: WhitelistEntry) -> bool {
        let message = format!("Added {entry} to whitelist");
        let added = self.admission.whitelist.insert(entry);
        if added {
            self.events.emit(message);
        }
        added
    }

    /// Remove a whitelist entry. Returns false if it was not present.
    pub fn remove_whitelist_entry(&mut self, entry: &WhitelistEntry) -> bool {
        let removed = self.admission.whitelist.remove(entry);
        if removed {
            self.events.emit(format!("Removed {entry} from whitelist"));
        }
        removed
    }

    /// Disconnect every session the whitelist would not admit.
    pub fn kick_unlisted(&mut self) -> usize {
        let unlisted: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|s| !self.admission.is_whitelisted(&s.name, s.remote_ip))
            .map(|s| s.id)
            .collect();
        for &id in &unlisted {
            self.evict(id, "not on whitelist");
        }
        self.reap_dead();
        unlisted.len()
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Sessions with exactly this name.
    pub fn find_by_name(&self, name: &str) -> Vec<SessionSummary> {
        self.summaries(self.sessions.find_by_name(name))
    }

    /// Session with this id.
    pub fn find_by_id(&self, id: SessionId) -> Option<SessionSummary> {
        self.sessions.get(id).map(Session::summary)
    }

    /// Sessions connected from this address.
    pub fn find_by_ip(&self, ip: IpAddr) -> Vec<SessionSummary> {
        self.summaries(self.sessions.find_by_ip(ip))
    }

    /// Every session, in join order.
    pub fn sessions(&self) -> Vec<SessionSummary> {
        self.sessions.iter().map(Session::summary).collect()
    }

    /// Banned addresses.
    pub fn bans(&self) -> Vec<IpAddr> {
        self.admission.banned.iter().copied().collect()
    }

    /// Whitelist entries.
    pub fn whitelist(&self) -> Vec<WhitelistEntry> {
        self.admission.whitelist.iter().cloned().collect()
    }

    /// Current admission policy.
    pub fn admission(&self) -> &AdmissionState {
        &self.admission
    }

    fn summaries(&self, ids: Vec<SessionId>) -> Vec<SessionSummary> {
        ids.into_iter()
            .filter_map(|id| self.sessions.get(id))
            .map(Session::summary)
            .collect()
    }
}

/// Queue a datagram for a session's last known UDP endpoint. Datagrams are
/// best effort: a full queue drops them.
pub(crate) fn queue_datagram(
    datagrams: &mpsc::Sender<Datagram>,
    session: &Session,
    payload: Vec<u8>,
) {
    let target = SocketAddr::new(session.remote_ip, session.udp_port);
    if let Err(e) = datagrams.try_send(Datagram { target, payload }) {
        trace!(%target, error = %e, "datagram dropped");
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::network::protocol::{Color, GhostState, PeerInfo, Vec3};
    use proptest::prelude::*;
    use crate::network::events::ServerEvent;
    use tokio::sync::broadcast;
    use tokio::sync::mpsc::Receiver;

    pub(crate) fn handshake(name: &str, spectator: bool) -> Handshake {
        Handshake {
            udp_port: 6000,
            name: name.into(),
            ghost: GhostState::new(Vec3::new(1.0, 2.0, 3.0), Vec3::default(), 20.0, true),
            model: "model".into(),
            level: "sp_a1_intro1".into(),
            reliable_only: false,
            color: Color::new(10, 20, 30),
            spectator,
        }
    }

    pub(crate) fn addr(last: u8) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, last], 40000))
    }

    /// Admit a client from 10.0.0.`last`; returns its id, its roster and
    /// its inbox with the roster already taken off.
    pub(crate) fn join_with_roster(
        server: &mut GhostServer,
        last: u8,
        handshake: Handshake,
    ) -> Result<(SessionId, Roster, Receiver<Vec<u8>>), AdmissionError> {
        let (link, mut rx) = SessionLink::detached(64);
        let id = server.try_admit(addr(last), handshake, link)?;
        let roster = Roster::decode(&rx.try_recv().unwrap()).unwrap();
        Ok((id, roster, rx))
    }

    /// [`join_with_roster`] without the roster.
    pub(crate) fn join(
        server: &mut GhostServer,
        last: u8,
        handshake: Handshake,
    ) -> Result<(SessionId, Receiver<Vec<u8>>), AdmissionError> {
        join_with_roster(server, last, handshake).map(|(id, _, rx)| (id, rx))
    }

    pub(crate) fn drain(rx: &mut Receiver<Vec<u8>>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(bytes) = rx.try_recv() {
            out.push(ServerMessage::decode(&bytes).unwrap());
        }
        out
    }

    fn event_lines(rx: &mut broadcast::Receiver<ServerEvent>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event.message);
        }
        out
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 53000);
        assert_eq!(config.heartbeat_interval(), Duration::from_millis(5000));
        assert_eq!(config.update_interval(), Duration::from_millis(50));
        assert_eq!(config.handshake_timeout(), Duration::from_millis(1500));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_json_keeps_defaults() {
        let config: ServerConfig = serde_json::from_str(r#"{"port": 27015}"#).unwrap();
        assert_eq!(config.port, 27015);
        assert_eq!(config.keepalive_interval_ms, 1000);
    }

    #[test]
    fn test_config_rejects_zero_interval() {
        let config = ServerConfig {
            update_interval_ms: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ServerError::Config(_))));
    }

    #[test]
    fn test_roster_precedes_connect_broadcast() {
        let (mut server, _udp) = GhostServer::detached(ServerConfig::default());

        let (alice, roster, mut alice_rx) =
            join_with_roster(&mut server, 1, handshake("Alice", false)).unwrap();
        assert_eq!(alice, 1);
        assert_eq!(roster.id, 1);
        assert!(roster.peers.is_empty());

        let (bob, roster, mut bob_rx) =
            join_with_roster(&mut server, 2, handshake("Bob", false)).unwrap();
        assert_eq!(bob, 2);
        assert_eq!(roster.id, 2);
        assert_eq!(roster.peers.len(), 1);
        assert_eq!(roster.peers[0].name, "Alice");
        assert!(bob_rx.try_recv().is_err());

        match drain(&mut alice_rx).as_slice() {
            [ServerMessage::Connect(PeerInfo { id: 2, name, .. })] => assert_eq!(name, "Bob"),
            other => panic!("unexpected messages: {other:?}"),
        }
    }

    #[test]
    fn test_duplicate_address_is_blocked() {
        let (mut server, _udp) = GhostServer::detached(ServerConfig::default());
        let mut events = server.events().subscribe();
        join(&mut server, 1, handshake("Alice", false)).unwrap();

        let result = join(&mut server, 1, handshake("Alice again", false));
        assert_eq!(result.err(), Some(AdmissionError::Blocked));
        assert_eq!(server.session_count(), 1);
        assert!(server.screen_address(addr(1).ip()).is_err());
        let refused = "Refused connection from 10.0.0.1 - banned or IP already connected";
        assert!(event_lines(&mut events).contains(&refused.to_string()));
    }

    #[test]
    fn test_ban_scope_and_idempotence() {
        let (mut server, _udp) = GhostServer::detached(ServerConfig::default());
        let mut events = server.events().subscribe();
        let (_, _alice_rx) = join(&mut server, 1, handshake("Alice", false)).unwrap();
        let (_, mut bob_rx) = join(&mut server, 2, handshake("Bob", false)).unwrap();
        drain(&mut bob_rx);

        assert_eq!(server.ban(addr(1).ip()), 1);
        assert_eq!(server.ban(addr(1).ip()), 0);
        assert_eq!(server.session_count(), 1);
        assert_eq!(drain(&mut bob_rx), vec![ServerMessage::Disconnect { id: 1 }]);

        let lines = event_lines(&mut events);
        assert_eq!(lines.iter().filter(|l| l.starts_with("Banned IP")).count(), 1);
        let banned = "Disconnect: Alice (player) @ 10.0.0.1:6000 Reason: banned";
        assert!(lines.contains(&banned.to_string()));

        // Ban overrides the whitelist.
        server.set_whitelist_enabled(true);
        server.add_whitelist_entry(WhitelistEntry::name("Alice"));
        assert_eq!(
            join(&mut server, 1, handshake("Alice", false)).err(),
            Some(AdmissionError::Blocked)
        );

        assert!(server.unban(addr(1).ip()));
        assert!(!server.unban(addr(1).ip()));
        assert!(join(&mut server, 1, handshake("Alice", false)).is_ok());
    }

    #[test]
    fn test_whitelist_gate_and_kick_unlisted() {
        let (mut server, _udp) = GhostServer::detached(ServerConfig::default());
        let (_, _a) = join(&mut server, 1, handshake("Alice", false)).unwrap();
        let (_, _b) = join(&mut server, 2, handshake("Bob", false)).unwrap();

        server.add_whitelist_entry(WhitelistEntry::name("alice"));
        server.set_whitelist_enabled(true);
        assert_eq!(
            join(&mut server, 3, handshake("Carol", false)).err(),
            Some(AdmissionError::NotWhitelisted)
        );
        let (_, _alice_again) = join(&mut server, 4, handshake("ALICE", true)).unwrap();

        assert_eq!(server.kick_unlisted(), 1);
        let names: Vec<String> = server.sessions().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["Alice", "ALICE"]);
    }

    #[test]
    fn test_dead_link_is_reaped() {
        let (mut server, _udp) = GhostServer::detached(ServerConfig::default());
        let (_, mut alice_rx) = join(&mut server, 1, handshake("Alice", false)).unwrap();
        let (bob, bob_rx) = join(&mut server, 2, handshake("Bob", false)).unwrap();
        drop(bob_rx);
        drain(&mut alice_rx);

        server.broadcast_message("hello");
        assert!(server.session(bob).is_none());
        assert_eq!(
            drain(&mut alice_rx),
            vec![
                ServerMessage::Message {
                    id: SERVER_ID,
                    text: "hello".into()
                },
                ServerMessage::Disconnect { id: bob },
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_link_is_torn_down() {
        let (mut server, _udp) = GhostServer::detached(ServerConfig::default());
        let (_, mut alice_rx) = join(&mut server, 1, handshake("Alice", false)).unwrap();

        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let reader = tokio::spawn(std::future::pending::<()>());
        let writer = tokio::spawn(std::future::pending::<()>());
        let link = SessionLink::new(tx, Some(reader.abort_handle()), Some(writer.abort_handle()));

        let bob = server.try_admit(addr(2), handshake("Bob", false), link).unwrap();
        assert!(server.session(bob).is_none());
        assert!(writer.await.unwrap_err().is_cancelled());
        assert!(reader.await.unwrap_err().is_cancelled());
        assert_eq!(
            drain(&mut alice_rx),
            vec![
                ServerMessage::Connect(PeerInfo {
                    id: bob,
                    name: "Bob".into(),
                    ghost: handshake("Bob", false).ghost,
                    model: "model".into(),
                    level: "sp_a1_intro1".into(),
                    color: Color::new(10, 20, 30),
                    spectator: false,
                }),
                ServerMessage::Disconnect { id: bob },
            ]
        );
    }

    #[test]
    fn test_ghost_updates_pick_transport() {
        let (mut server, mut udp) = GhostServer::detached(ServerConfig::default());
        let (alice, mut alice_rx) = join(&mut server, 1, handshake("Alice", false)).unwrap();
        let mut reliable = handshake("Bob", false);
        reliable.reliable_only = true;
        let (_, mut bob_rx) = join(&mut server, 2, reliable).unwrap();
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        server.broadcast_ghost_states();

        let datagram = udp.try_recv().unwrap();
        assert_eq!(datagram.target, SocketAddr::from(([10, 0, 0, 1], 6000)));
        assert!(udp.try_recv().is_err());
        assert!(drain(&mut alice_rx).is_empty());

        match drain(&mut bob_rx).as_slice() {
            [ServerMessage::Update { id: SERVER_ID, entries }] => {
                assert_eq!(entries.len(), 2);
                assert_eq!(entries[0].id, alice);
            }
            other => panic!("unexpected messages: {other:?}"),
        }
        assert_eq!(
            ServerMessage::decode(&datagram.payload).unwrap(),
            ServerMessage::decode(&server_update(&server)).unwrap()
        );
    }

    fn server_update(server: &GhostServer) -> Vec<u8> {
        ServerMessage::Update {
            id: SERVER_ID,
            entries: server
                .sessions
                .iter()
                .map(|s| GhostUpdate {
                    id: s.id,
                    ghost: s.ghost,
                })
                .collect(),
        }
        .encode()
    }

    #[test]
    fn test_kick_by_name_and_shutdown() {
        let (mut server, _udp) = GhostServer::detached(ServerConfig::default());
        let mut events = server.events().subscribe();
        let (_, _a) = join(&mut server, 1, handshake("Twin", false)).unwrap();
        let (_, _b) = join(&mut server, 2, handshake("Twin", true)).unwrap();
        let (_, _c) = join(&mut server, 3, handshake("Other", false)).unwrap();

        assert_eq!(server.kick_by_name("Twin"), 2);
        assert_eq!(server.find_by_name("Twin"), Vec::new());
        assert_eq!(server.find_by_ip(addr(3).ip()).len(), 1);

        server.shutdown();
        assert_eq!(server.session_count(), 0);
        let lines = event_lines(&mut events);
        let kicked = "Disconnect: Twin (spectator) @ 10.0.0.2:6000 Reason: kicked";
        let stopped = "Disconnect: Other (player) @ 10.0.0.3:6000 Reason: server stopped";
        assert!(lines.contains(&kicked.to_string()));
        assert!(lines.contains(&stopped.to_string()));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Join(u8),
        Leave(SessionId),
        Ban(u8),
        Unban(u8),
    }

    fn arb_op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..6).prop_map(Op::Join),
            (1u32..12).prop_map(Op::Leave),
            (0u8..6).prop_map(Op::Ban),
            (0u8..6).prop_map(Op::Unban),
        ]
    }

    proptest! {
        #[test]
        fn prop_no_duplicate_addresses(ops in prop::collection::vec(arb_op(), 1..40)) {
            let (mut server, _udp) = GhostServer::detached(ServerConfig::default());
            let mut inboxes = Vec::new();
            for op in ops {
                match op {
                    Op::Join(last) => {
                        if let Ok((_, rx)) = join(&mut server, last, handshake("p", false)) {
                            inboxes.push(rx);
                        }
                    }
                    Op::Leave(id) => {
                        server.disconnect(id, "requested");
                    }
                    Op::Ban(last) => {
                        server.ban(addr(last).ip());
                    }
                    Op::Unban(last) => {
                        server.unban(addr(last).ip());
                    }
                }
                let ips: Vec<IpAddr> = server.sessions().into_iter().map(|s| s.ip).collect();
                let unique: std::collections::BTreeSet<IpAddr> = ips.iter().copied().collect();
                prop_assert_eq!(unique.len(), ips.len());
                for ip in &ips {
                    prop_assert!(!server.admission().banned.contains(ip));
                }
            }
        }
    }
}
