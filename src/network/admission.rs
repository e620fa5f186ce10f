//! Admission Control
//!
//! Decides whether a handshake may become a session. Checks run in a fixed
//! order: ban list and duplicate address first, then the per-category
//! accepting flags, then the whitelist. The ban list always wins, even over
//! a whitelist entry.

use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;

use serde::Serialize;

/// Reasons a handshake is refused. The connection is closed without a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    /// Address is banned or already has a session.
    #[error("banned or IP already connected")]
    Blocked,
    /// The server is not taking this kind of client right now.
    #[error("not accepting this type")]
    NotAccepting,
    /// Whitelist is on and the client is not on it.
    #[error("not on whitelist")]
    NotWhitelisted,
}

/// Operator input that is not an IP address literal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid IP address: {0:?}")]
pub struct AddressParseError(pub String);

/// Parse an operator-supplied address (IPv4 or IPv6 literal).
pub fn parse_ip(input: &str) -> Result<IpAddr, AddressParseError> {
    input
        .trim()
        .parse()
        .map_err(|_| AddressParseError(input.to_string()))
}

/// Which client kinds an accepting-flag change applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    /// Participating players.
    Players,
    /// Observers.
    Spectators,
    /// Both.
    All,
}

/// Whitelist entry kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum WhitelistKind {
    /// Matches a display name, case-insensitively.
    Name,
    /// Matches the string form of the peer address exactly.
    Address,
}

/// One whitelist entry. Unique by kind and value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct WhitelistEntry {
    /// What the value is matched against.
    pub kind: WhitelistKind,
    /// Name or canonical address string.
    pub value: String,
}

impl WhitelistEntry {
    /// Entry matching a display name.
    pub fn name(name: impl Into<String>) -> Self {
        Self {
            kind: WhitelistKind::Name,
            value: name.into(),
        }
    }

    /// Entry matching an address.
    pub fn address(ip: IpAddr) -> Self {
        Self {
            kind: WhitelistKind::Address,
            value: ip.to_string(),
        }
    }

    /// Whether a client with this name and address matches the entry.
    pub fn matches(&self, name: &str, ip: IpAddr) -> bool {
        match self.kind {
            WhitelistKind::Name => self.value.eq_ignore_ascii_case(name),
            WhitelistKind::Address => self.value == ip.to_string(),
        }
    }
}

impl fmt::Display for WhitelistEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            WhitelistKind::Name => write!(f, "name {}", self.value),
            WhitelistKind::Address => write!(f, "ip {}", self.value),
        }
    }
}

/// Admission policy for one server run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdmissionState {
    /// Players may join.
    pub accepting_players: bool,
    /// Spectators may join.
    pub accepting_spectators: bool,
    /// Only whitelisted clients may join.
    pub whitelist_enabled: bool,
    /// Whitelist entries.
    pub whitelist: BTreeSet<WhitelistEntry>,
    /// Banned addresses.
    pub banned: BTreeSet<IpAddr>,
}

impl Default for AdmissionState {
    fn default() -> Self {
        Self {
            accepting_players: true,
            accepting_spectators: true,
            whitelist_enabled: false,
            whitelist: BTreeSet::new(),
            banned: BTreeSet::new(),
        }
    }
}

impl AdmissionState {
    /// Check applied both at accept time and at handshake time.
    pub fn check_address(&self, ip: IpAddr, already_connected: bool) -> Result<(), AdmissionError> {
        if already_connected || self.banned.contains(&ip) {
            return Err(AdmissionError::Blocked);
        }
        Ok(())
    }

    /// Full admission check for a decoded handshake.
    pub fn check(
        &self,
        ip: IpAddr,
        already_connected: bool,
        name: &str,
        spectator: bool,
    ) -> Result<(), AdmissionError> {
        self.check_address(ip, already_connected)?;

        let accepting = if spectator {
            self.accepting_spectators
        } else {
            self.accepting_players
        };
        if !accepting {
            return Err(AdmissionError::NotAccepting);
        }

        if self.whitelist_enabled && !self.is_whitelisted(name, ip) {
            return Err(AdmissionError::NotWhitelisted);
        }
        Ok(())
    }

    /// Whether any whitelist entry matches.
    pub fn is_whitelisted(&self, name: &str, ip: IpAddr) -> bool {
        self.whitelist.iter().any(|entry| entry.matches(name, ip))
    }

    /// Update the accepting flags for a category.
    pub fn set_accepting(&mut self, category: Category, accepting: bool) {
        match category {
            Category::Players => self.accepting_players = accepting,
            Category::Spectators => self.accepting_spectators = accepting,
            Category::All => {
                self.accepting_players = accepting;
                self.accepting_spectators = accepting;
            }
        }
    }
}
