//! Protocol Messages
//!
//! Binary wire format shared with the game clients. The layout is fixed by
//! the clients' packet library and must stay bit-exact:
//!
//! - integers (`u16`, `u32`) are big-endian;
//! - `f32` values are little-endian (the library appends floats raw);
//! - strings are a big-endian `u32` byte length followed by UTF-8 bytes;
//! - booleans are one byte;
//! - every message starts with a one-byte [`Tag`], and every message except
//!   the handshake and the roster reply carries a `u32` sender id after it.
//!
//! Messages travel framed over TCP (see [`super::framing`]) or as single UDP
//! datagrams.

use serde::Serialize;

/// Session identifier assigned by the server.
pub type SessionId = u32;

/// Sender id used for messages originating from the server itself.
pub const SERVER_ID: SessionId = 0;

// =============================================================================
// ERRORS
// =============================================================================

/// Decoding failures. The offending packet is dropped; the connection survives.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// Buffer ended before a field was complete.
    #[error("truncated packet: needed {needed} bytes, {remaining} remaining")]
    Truncated {
        /// Bytes required by the field being read.
        needed: usize,
        /// Bytes left in the buffer.
        remaining: usize,
    },

    /// Tag byte outside the known range.
    #[error("unknown message tag {0}")]
    UnknownTag(u8),

    /// Known tag that is not valid in this direction or position.
    #[error("unexpected {0:?} message")]
    UnexpectedTag(Tag),

    /// String field was not valid UTF-8.
    #[error("string field is not valid UTF-8")]
    InvalidUtf8,

    /// Countdown phase byte outside the known range.
    #[error("unknown countdown phase {0}")]
    InvalidCountdownPhase(u8),
}

// =============================================================================
// TAGS & FIELD TYPES
// =============================================================================

/// One-byte message tag. Values are part of the wire contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Tag {
    /// Empty message.
    None = 0,
    /// Latency probe.
    Ping = 1,
    /// Handshake / new peer notification.
    Connect = 2,
    /// Peer left or wants to leave.
    Disconnect = 3,
    /// Request to stop the server (ignored).
    StopServer = 4,
    /// Peer changed level.
    MapChange = 5,
    /// Liveness challenge / echo.
    HeartBeat = 6,
    /// Chat text.
    Message = 7,
    /// Countdown start / acknowledgement.
    Countdown = 8,
    /// Ghost state update.
    Update = 9,
    /// Peer finished a speedrun.
    SpeedrunFinish = 10,
    /// Peer changed model.
    ModelChange = 11,
    /// Peer changed color.
    ColorChange = 12,
}

impl TryFrom<u8> for Tag {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Tag::None,
            1 => Tag::Ping,
            2 => Tag::Connect,
            3 => Tag::Disconnect,
            4 => Tag::StopServer,
            5 => Tag::MapChange,
            6 => Tag::HeartBeat,
            7 => Tag::Message,
            8 => Tag::Countdown,
            9 => Tag::Update,
            10 => Tag::SpeedrunFinish,
            11 => Tag::ModelChange,
            12 => Tag::ColorChange,
            other => return Err(ProtocolError::UnknownTag(other)),
        })
    }
}

/// Three consecutive floats.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Vec3 {
    /// X component.
    pub x: f32,
    /// Y component.
    pub y: f32,
    /// Z component.
    pub z: f32,
}

impl Vec3 {
    /// Create a vector.
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }
}

/// Per-tick ghost payload.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct GhostState {
    /// World position.
    pub position: Vec3,
    /// View angles.
    pub view_angle: Vec3,
    /// Eye height offset, 0..=127.
    pub view_offset: u8,
    /// Whether the player stands on the ground.
    pub grounded: bool,
}

impl GhostState {
    /// Largest encodable view offset.
    pub const MAX_VIEW_OFFSET: u8 = 0x7F;

    const GROUNDED_BIT: u8 = 0x80;

    /// Build a ghost state, clamping a fractional view offset into 0..=127.
    pub fn new(position: Vec3, view_angle: Vec3, view_offset: f32, grounded: bool) -> Self {
        let clamped = view_offset.clamp(0.0, Self::MAX_VIEW_OFFSET as f32) as u8;
        Self {
            position,
            view_angle,
            view_offset: clamped,
            grounded,
        }
    }

    fn packed(&self) -> u8 {
        (self.view_offset & Self::MAX_VIEW_OFFSET)
            | if self.grounded { Self::GROUNDED_BIT } else { 0 }
    }

    fn unpack(byte: u8) -> (u8, bool) {
        (byte & Self::MAX_VIEW_OFFSET, byte & Self::GROUNDED_BIT != 0)
    }
}

/// RGB ghost color.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Color {
    /// Red channel.
    pub r: u8,
    /// Green channel.
    pub g: u8,
    /// Blue channel.
    pub b: u8,
}

impl Color {
    /// Create a color.
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }
}

// =============================================================================
// PACKET WRITER / READER
// =============================================================================

/// Appends wire fields to a byte buffer.
#[derive(Debug, Default)]
pub struct PacketWriter {
    buf: Vec<u8>,
}

impl PacketWriter {
    /// Start an empty packet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a packet with a tag and sender id.
    pub fn tagged(tag: Tag, id: SessionId) -> Self {
        let mut writer = Self::new();
        writer.put_tag(tag).put_u32(id);
        writer
    }

    /// Append a tag byte.
    pub fn put_tag(&mut self, tag: Tag) -> &mut Self {
        self.put_u8(tag as u8)
    }

    /// Append a byte.
    pub fn put_u8(&mut self, value: u8) -> &mut Self {
        self.buf.push(value);
        self
    }

    /// Append a boolean as one byte.
    pub fn put_bool(&mut self, value: bool) -> &mut Self {
        self.put_u8(u8::from(value))
    }

    /// Append a big-endian `u16`.
    pub fn put_u16(&mut self, value: u16) -> &mut Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    /// Append a big-endian `u32`.
    pub fn put_u32(&mut self, value: u32) -> &mut Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    /// Append a little-endian `f32`.
    pub fn put_f32(&mut self, value: f32) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    /// Append a length-prefixed string.
    pub fn put_str(&mut self, value: &str) -> &mut Self {
        self.put_u32(value.len() as u32);
        self.buf.extend_from_slice(value.as_bytes());
        self
    }

    /// Append raw bytes.
    pub fn put_raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    /// Append a vector.
    pub fn put_vec3(&mut self, v: Vec3) -> &mut Self {
        self.put_f32(v.x).put_f32(v.y).put_f32(v.z)
    }

    /// Append a ghost state.
    pub fn put_ghost(&mut self, ghost: &GhostState) -> &mut Self {
        self.put_vec3(ghost.position)
            .put_vec3(ghost.view_angle)
            .put_u8(ghost.packed())
    }

    /// Append a color.
    pub fn put_color(&mut self, color: Color) -> &mut Self {
        self.put_u8(color.r).put_u8(color.g).put_u8(color.b)
    }

    /// Finish the packet.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Reads wire fields from a byte slice.
#[derive(Debug)]
pub struct PacketReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PacketReader<'a> {
    /// Wrap a buffer.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes not consumed yet.
    pub fn remaining(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        let remaining = self.buf.len() - self.pos;
        if remaining < n {
            return Err(ProtocolError::Truncated {
                needed: n,
                remaining,
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], ProtocolError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    /// Read a tag byte.
    pub fn get_tag(&mut self) -> Result<Tag, ProtocolError> {
        Tag::try_from(self.get_u8()?)
    }

    /// Read a byte.
    pub fn get_u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    /// Read a boolean.
    pub fn get_bool(&mut self) -> Result<bool, ProtocolError> {
        Ok(self.get_u8()? != 0)
    }

    /// Read a big-endian `u16`.
    pub fn get_u16(&mut self) -> Result<u16, ProtocolError> {
        Ok(u16::from_be_bytes(self.take_array()?))
    }

    /// Read a big-endian `u32`.
    pub fn get_u32(&mut self) -> Result<u32, ProtocolError> {
        Ok(u32::from_be_bytes(self.take_array()?))
    }

    /// Read a little-endian `f32`.
    pub fn get_f32(&mut self) -> Result<f32, ProtocolError> {
        Ok(f32::from_le_bytes(self.take_array()?))
    }

    /// Read a length-prefixed string.
    pub fn get_str(&mut self) -> Result<String, ProtocolError> {
        let len = self.get_u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)
    }

    /// Read a vector.
    pub fn get_vec3(&mut self) -> Result<Vec3, ProtocolError> {
        Ok(Vec3::new(self.get_f32()?, self.get_f32()?, self.get_f32()?))
    }

    /// Read a ghost state.
    pub fn get_ghost(&mut self) -> Result<GhostState, ProtocolError> {
        let position = self.get_vec3()?;
        let view_angle = self.get_vec3()?;
        let (view_offset, grounded) = GhostState::unpack(self.get_u8()?);
        Ok(GhostState {
            position,
            view_angle,
            view_offset,
            grounded,
        })
    }

    /// Read a color.
    pub fn get_color(&mut self) -> Result<Color, ProtocolError> {
        Ok(Color::new(self.get_u8()?, self.get_u8()?, self.get_u8()?))
    }
}

// =============================================================================
// HANDSHAKE & ROSTER
// =============================================================================

/// First message a client sends on its TCP stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Handshake {
    /// UDP port the client listens on.
    pub udp_port: u16,
    /// Display name.
    pub name: String,
    /// Initial ghost state.
    pub ghost: GhostState,
    /// Model name.
    pub model: String,
    /// Current level.
    pub level: String,
    /// Client opted out of UDP.
    pub reliable_only: bool,
    /// Ghost color.
    pub color: Color,
    /// Client joins as an observer.
    pub spectator: bool,
}

impl Handshake {
    /// Encode with a `Connect` tag.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = PacketWriter::new();
        w.put_tag(Tag::Connect)
            .put_u16(self.udp_port)
            .put_str(&self.name)
            .put_ghost(&self.ghost)
            .put_str(&self.model)
            .put_str(&self.level)
            .put_bool(self.reliable_only)
            .put_color(self.color)
            .put_bool(self.spectator);
        w.into_bytes()
    }

    /// Decode. The tag byte is read but not checked, as clients have never
    /// been required to send a particular value there.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = PacketReader::new(bytes);
        r.get_u8()?;
        Ok(Self {
            udp_port: r.get_u16()?,
            name: r.get_str()?,
            ghost: r.get_ghost()?,
            model: r.get_str()?,
            level: r.get_str()?,
            reliable_only: r.get_bool()?,
            color: r.get_color()?,
            spectator: r.get_bool()?,
        })
    }
}

/// Public description of a session, as carried by the roster and by
/// `Connect` broadcasts.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerInfo {
    /// Session id.
    pub id: SessionId,
    /// Display name.
    pub name: String,
    /// Last ghost state.
    pub ghost: GhostState,
    /// Model name.
    pub model: String,
    /// Current level.
    pub level: String,
    /// Ghost color.
    pub color: Color,
    /// Observer flag.
    pub spectator: bool,
}

impl PeerInfo {
    fn write(&self, w: &mut PacketWriter) {
        w.put_u32(self.id)
            .put_str(&self.name)
            .put_ghost(&self.ghost)
            .put_str(&self.model)
            .put_str(&self.level)
            .put_color(self.color)
            .put_bool(self.spectator);
    }

    fn read(r: &mut PacketReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            id: r.get_u32()?,
            name: r.get_str()?,
            ghost: r.get_ghost()?,
            model: r.get_str()?,
            level: r.get_str()?,
            color: r.get_color()?,
            spectator: r.get_bool()?,
        })
    }
}

/// Reply to a successful handshake: the new session's id and every session
/// that existed before it joined. Untagged.
#[derive(Debug, Clone, PartialEq)]
pub struct Roster {
    /// Id assigned to the new session.
    pub id: SessionId,
    /// Sessions already connected.
    pub peers: Vec<PeerInfo>,
}

impl Roster {
    /// Encode.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = PacketWriter::new();
        w.put_u32(self.id).put_u32(self.peers.len() as u32);
        for peer in &self.peers {
            peer.write(&mut w);
        }
        w.into_bytes()
    }

    /// Decode.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = PacketReader::new(bytes);
        let id = r.get_u32()?;
        let count = r.get_u32()?;
        let mut peers = Vec::new();
        for _ in 0..count {
            peers.push(PeerInfo::read(&mut r)?);
        }
        Ok(Self { id, peers })
    }
}

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from an admitted client to the server.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// Empty message.
    None {
        /// Sender.
        id: SessionId,
    },
    /// Latency probe; answered with [`ServerMessage::Pong`].
    Ping {
        /// Sender.
        id: SessionId,
    },
    /// Leave the server.
    Disconnect {
        /// Sender.
        id: SessionId,
    },
    /// Ask the server to stop. Ignored by the engine.
    StopServer {
        /// Sender.
        id: SessionId,
    },
    /// Sender moved to another level.
    MapChange {
        /// Sender.
        id: SessionId,
        /// New level name.
        level: String,
    },
    /// Echo of a heartbeat challenge.
    HeartBeat {
        /// Sender.
        id: SessionId,
        /// Token from the challenge.
        token: u32,
    },
    /// Chat line.
    Message {
        /// Sender.
        id: SessionId,
        /// Text.
        text: String,
    },
    /// Client-side countdown notification; any body is ignored.
    Countdown {
        /// Sender.
        id: SessionId,
    },
    /// New ghost state.
    Update {
        /// Sender.
        id: SessionId,
        /// State.
        ghost: GhostState,
    },
    /// Sender finished a run. The body is opaque to the server.
    SpeedrunFinish {
        /// Sender.
        id: SessionId,
        /// Everything after the sender id.
        payload: Vec<u8>,
    },
    /// Sender changed model.
    ModelChange {
        /// Sender.
        id: SessionId,
        /// New model name.
        model: String,
    },
    /// Sender changed color.
    ColorChange {
        /// Sender.
        id: SessionId,
        /// New color.
        color: Color,
    },
}

impl ClientMessage {
    /// Claimed sender id.
    pub fn sender(&self) -> SessionId {
        match self {
            ClientMessage::None { id }
            | ClientMessage::Ping { id }
            | ClientMessage::Disconnect { id }
            | ClientMessage::StopServer { id }
            | ClientMessage::MapChange { id, .. }
            | ClientMessage::HeartBeat { id, .. }
            | ClientMessage::Message { id, .. }
            | ClientMessage::Countdown { id }
            | ClientMessage::Update { id, .. }
            | ClientMessage::SpeedrunFinish { id, .. }
            | ClientMessage::ModelChange { id, .. }
            | ClientMessage::ColorChange { id, .. } => *id,
        }
    }

    /// Wire tag.
    pub fn tag(&self) -> Tag {
        match self {
            ClientMessage::None { .. } => Tag::None,
            ClientMessage::Ping { .. } => Tag::Ping,
            ClientMessage::Disconnect { .. } => Tag::Disconnect,
            ClientMessage::StopServer { .. } => Tag::StopServer,
            ClientMessage::MapChange { .. } => Tag::MapChange,
            ClientMessage::HeartBeat { .. } => Tag::HeartBeat,
            ClientMessage::Message { .. } => Tag::Message,
            ClientMessage::Countdown { .. } => Tag::Countdown,
            ClientMessage::Update { .. } => Tag::Update,
            ClientMessage::SpeedrunFinish { .. } => Tag::SpeedrunFinish,
            ClientMessage::ModelChange { .. } => Tag::ModelChange,
            ClientMessage::ColorChange { .. } => Tag::ColorChange,
        }
    }

    /// Encode.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = PacketWriter::tagged(self.tag(), self.sender());
        match self {
            ClientMessage::None { .. }
            | ClientMessage::Ping { .. }
            | ClientMessage::Disconnect { .. }
            | ClientMessage::StopServer { .. }
            | ClientMessage::Countdown { .. } => {}
            ClientMessage::MapChange { level, .. } => {
                w.put_str(level);
            }
            ClientMessage::HeartBeat { token, .. } => {
                w.put_u32(*token);
            }
            ClientMessage::Message { text, .. } => {
                w.put_str(text);
            }
            ClientMessage::Update { ghost, .. } => {
                w.put_ghost(ghost);
            }
            ClientMessage::SpeedrunFinish { payload, .. } => {
                w.put_raw(payload);
            }
            ClientMessage::ModelChange { model, .. } => {
                w.put_str(model);
            }
            ClientMessage::ColorChange { color, .. } => {
                w.put_color(*color);
            }
        }
        w.into_bytes()
    }

    /// Decode.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = PacketReader::new(bytes);
        let tag = r.get_tag()?;
        if tag == Tag::Connect {
            return Err(ProtocolError::UnexpectedTag(tag));
        }
        let id = r.get_u32()?;
        Ok(match tag {
            Tag::None => ClientMessage::None { id },
            Tag::Ping => ClientMessage::Ping { id },
            Tag::Disconnect => ClientMessage::Disconnect { id },
            Tag::StopServer => ClientMessage::StopServer { id },
            Tag::MapChange => ClientMessage::MapChange {
                id,
                level: r.get_str()?,
            },
            Tag::HeartBeat => ClientMessage::HeartBeat {
                id,
                token: r.get_u32()?,
            },
            Tag::Message => ClientMessage::Message {
                id,
                text: r.get_str()?,
            },
            Tag::Countdown => ClientMessage::Countdown { id },
            Tag::Update => ClientMessage::Update {
                id,
                ghost: r.get_ghost()?,
            },
            Tag::SpeedrunFinish => ClientMessage::SpeedrunFinish {
                id,
                payload: r.remaining().to_vec(),
            },
            Tag::ModelChange => ClientMessage::ModelChange {
                id,
                model: r.get_str()?,
            },
            Tag::ColorChange => ClientMessage::ColorChange {
                id,
                color: r.get_color()?,
            },
            Tag::Connect => return Err(ProtocolError::UnexpectedTag(tag)),
        })
    }
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Countdown message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CountdownPhase {
    /// Start a countdown (phase byte 0).
    Start {
        /// Seconds until the activity begins.
        duration: u32,
        /// Commands clients run when the countdown starts.
        pre_commands: String,
        /// Commands clients run when it ends.
        post_commands: String,
    },
    /// Fixed reply to a client's countdown message (phase byte 1).
    Acknowledge,
}

/// `(session, ghost)` pair inside a bulk update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GhostUpdate {
    /// Session id.
    pub id: SessionId,
    /// Its latest ghost state.
    pub ghost: GhostState,
}

/// Messages sent from the server to clients (roster reply excluded).
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// Answer to a ping: a bare `Ping` tag.
    Pong,
    /// A new peer joined.
    Connect(PeerInfo),
    /// A peer left.
    Disconnect {
        /// Peer that left.
        id: SessionId,
    },
    /// Relayed level change.
    MapChange {
        /// Peer.
        id: SessionId,
        /// New level.
        level: String,
    },
    /// Liveness challenge (TCP) or keep-alive (UDP, token 0).
    HeartBeat {
        /// Recipient's own id.
        id: SessionId,
        /// Token to echo.
        token: u32,
    },
    /// Chat line from a peer, or from the server when `id` is 0.
    Message {
        /// Author.
        id: SessionId,
        /// Text.
        text: String,
    },
    /// Countdown start or acknowledgement.
    Countdown {
        /// Always [`SERVER_ID`].
        id: SessionId,
        /// Body.
        phase: CountdownPhase,
    },
    /// Bulk ghost state of every session.
    Update {
        /// Always [`SERVER_ID`].
        id: SessionId,
        /// One entry per session.
        entries: Vec<GhostUpdate>,
    },
    /// Relayed speedrun completion.
    SpeedrunFinish {
        /// Peer.
        id: SessionId,
        /// Opaque body.
        payload: Vec<u8>,
    },
    /// Relayed model change.
    ModelChange {
        /// Peer.
        id: SessionId,
        /// New model.
        model: String,
    },
    /// Relayed color change.
    ColorChange {
        /// Peer.
        id: SessionId,
        /// New color.
        color: Color,
    },
}

impl ServerMessage {
    /// Encode.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = PacketWriter::new();
        match self {
            ServerMessage::Pong => {
                w.put_tag(Tag::Ping);
            }
            ServerMessage::Connect(peer) => {
                w.put_tag(Tag::Connect);
                peer.write(&mut w);
            }
            ServerMessage::Disconnect { id } => {
                w.put_tag(Tag::Disconnect).put_u32(*id);
            }
            ServerMessage::MapChange { id, level } => {
                w.put_tag(Tag::MapChange).put_u32(*id).put_str(level);
            }
            ServerMessage::HeartBeat { id, token } => {
                w.put_tag(Tag::HeartBeat).put_u32(*id).put_u32(*token);
            }
            ServerMessage::Message { id, text } => {
                w.put_tag(Tag::Message).put_u32(*id).put_str(text);
            }
            ServerMessage::Countdown { id, phase } => {
                w.put_tag(Tag::Countdown).put_u32(*id);
                match phase {
                    CountdownPhase::Start {
                        duration,
                        pre_commands,
                        post_commands,
                    } => {
                        w.put_u8(0)
                            .put_u32(*duration)
                            .put_str(pre_commands)
                            .put_str(post_commands);
                    }
                    CountdownPhase::Acknowledge => {
                        w.put_u8(1);
                    }
                }
            }
            ServerMessage::Update { id, entries } => {
                w.put_tag(Tag::Update)
                    .put_u32(*id)
                    .put_u32(entries.len() as u32);
                for entry in entries {
                    w.put_u32(entry.id).put_ghost(&entry.ghost);
                }
            }
            ServerMessage::SpeedrunFinish { id, payload } => {
                w.put_tag(Tag::SpeedrunFinish).put_u32(*id).put_raw(payload);
            }
            ServerMessage::ModelChange { id, model } => {
                w.put_tag(Tag::ModelChange).put_u32(*id).put_str(model);
            }
            ServerMessage::ColorChange { id, color } => {
                w.put_tag(Tag::ColorChange).put_u32(*id).put_color(*color);
            }
        }
        w.into_bytes()
    }

    /// Decode (client side of the protocol).
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = PacketReader::new(bytes);
        let tag = r.get_tag()?;
        Ok(match tag {
            Tag::Ping => ServerMessage::Pong,
            Tag::Connect => ServerMessage::Connect(PeerInfo::read(&mut r)?),
            Tag::Disconnect => ServerMessage::Disconnect { id: r.get_u32()? },
            Tag::MapChange => ServerMessage::MapChange {
                id: r.get_u32()?,
                level: r.get_str()?,
            },
            Tag::HeartBeat => ServerMessage::HeartBeat {
                id: r.get_u32()?,
                token: r.get_u32()?,
            },
            Tag::Message => ServerMessage::Message {
                id: r.get_u32()?,
                text: r.get_str()?,
            },
            Tag::Countdown => {
                let id = r.get_u32()?;
                let phase = match r.get_u8()? {
                    0 => CountdownPhase::Start {
                        duration: r.get_u32()?,
                        pre_commands: r.get_str()?,
                        post_commands: r.get_str()?,
                    },
                    1 => CountdownPhase::Acknowledge,
                    other => return Err(ProtocolError::InvalidCountdownPhase(other)),
                };
                ServerMessage::Countdown { id, phase }
            }
            Tag::Update => {
                let id = r.get_u32()?;
                let count = r.get_u32()?;
                let mut entries = Vec::new();
                for _ in 0..count {
                    entries.push(GhostUpdate {
                        id: r.get_u32()?,
                        ghost: r.get_ghost()?,
                    });
                }
                ServerMessage::Update { id, entries }
            }
            Tag::SpeedrunFinish => ServerMessage::SpeedrunFinish {
                id: r.get_u32()?,
                payload: r.remaining().to_vec(),
            },
            Tag::ModelChange => ServerMessage::ModelChange {
                id: r.get_u32()?,
                model: r.get_str()?,
            },
            Tag::ColorChange => ServerMessage::ColorChange {
                id: r.get_u32()?,
                color: r.get_color()?,
            },
            Tag::None | Tag::StopServer => return Err(ProtocolError::UnexpectedTag(tag)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_ghost() -> GhostState {
        GhostState::new(
            Vec3::new(1.5, -2.0, 64.25),
            Vec3::new(0.0, 90.0, 0.0),
            64.0,
            true,
        )
    }

    fn sample_handshake() -> Handshake {
        Handshake {
            udp_port: 53001,
            name: "Alice".into(),
            ghost: sample_ghost(),
            model: "models/props/food_can/food_can_open.mdl".into(),
            level: "sp_a1_intro1".into(),
            reliable_only: false,
            color: Color::new(255, 128, 0),
            spectator: false,
        }
    }

    #[test]
    fn test_tag_values_are_stable() {
        assert_eq!(Tag::None as u8, 0);
        assert_eq!(Tag::Connect as u8, 2);
        assert_eq!(Tag::HeartBeat as u8, 6);
        assert_eq!(Tag::Update as u8, 9);
        assert_eq!(Tag::ColorChange as u8, 12);
        assert_eq!(Tag::try_from(13), Err(ProtocolError::UnknownTag(13)));
    }

    #[test]
    fn test_heartbeat_byte_layout() {
        let bytes = ServerMessage::HeartBeat {
            id: 3,
            token: 0x0102_0304,
        }
        .encode();
        assert_eq!(bytes, vec![6, 0, 0, 0, 3, 1, 2, 3, 4]);
    }

    #[test]
    fn test_string_and_float_layout() {
        let mut w = PacketWriter::new();
        w.put_str("ab").put_f32(1.0);
        assert_eq!(w.into_bytes(), vec![0, 0, 0, 2, b'a', b'b', 0x00, 0x00, 0x80, 0x3F]);
    }

    #[test]
    fn test_ghost_flags_packing() {
        let mut w = PacketWriter::new();
        w.put_ghost(&sample_ghost());
        let bytes = w.into_bytes();
        assert_eq!(bytes.len(), 25);
        assert_eq!(bytes[24], 0x80 | 64);
    }

    #[test]
    fn test_view_offset_is_clamped() {
        let high = GhostState::new(Vec3::default(), Vec3::default(), 300.0, false);
        assert_eq!(high.view_offset, 127);
        let low = GhostState::new(Vec3::default(), Vec3::default(), -4.0, false);
        assert_eq!(low.view_offset, 0);
    }

    #[test]
    fn test_handshake_roundtrip() {
        let handshake = sample_handshake();
        let bytes = handshake.encode();
        assert_eq!(bytes[0], Tag::Connect as u8);
        assert_eq!(Handshake::decode(&bytes).unwrap(), handshake);
    }

    #[test]
    fn test_truncated_handshake_is_rejected() {
        let bytes = sample_handshake().encode();
        let result = Handshake::decode(&bytes[..bytes.len() - 1]);
        assert!(matches!(result, Err(ProtocolError::Truncated { .. })));
    }

    #[test]
    fn test_roster_roundtrip() {
        let roster = Roster {
            id: 2,
            peers: vec![PeerInfo {
                id: 1,
                name: "Alice".into(),
                ghost: sample_ghost(),
                model: "model".into(),
                level: "sp_a1_intro1".into(),
                color: Color::new(1, 2, 3),
                spectator: true,
            }],
        };
        assert_eq!(Roster::decode(&roster.encode()).unwrap(), roster);
    }

    #[test]
    fn test_roster_with_oversized_count_fails_cleanly() {
        let mut w = PacketWriter::new();
        w.put_u32(1).put_u32(u32::MAX);
        let result = Roster::decode(&w.into_bytes());
        assert!(matches!(result, Err(ProtocolError::Truncated { .. })));
    }

    #[test]
    fn test_pong_is_bare_tag() {
        assert_eq!(ServerMessage::Pong.encode(), vec![Tag::Ping as u8]);
        assert_eq!(ServerMessage::decode(&[1]).unwrap(), ServerMessage::Pong);
    }

    #[test]
    fn test_countdown_layouts() {
        let ack = ServerMessage::Countdown {
            id: SERVER_ID,
            phase: CountdownPhase::Acknowledge,
        };
        assert_eq!(ack.encode(), vec![8, 0, 0, 0, 0, 1]);

        let start = ServerMessage::Countdown {
            id: SERVER_ID,
            phase: CountdownPhase::Start {
                duration: 10,
                pre_commands: "cmdA".into(),
                post_commands: "cmdB".into(),
            },
        };
        assert_eq!(ServerMessage::decode(&start.encode()).unwrap(), start);
    }

    #[test]
    fn test_client_countdown_ignores_body() {
        let bytes = [8, 0, 0, 0, 7, 1, 0xFF];
        assert_eq!(
            ClientMessage::decode(&bytes).unwrap(),
            ClientMessage::Countdown { id: 7 }
        );
    }

    #[test]
    fn test_client_connect_after_handshake_is_unexpected() {
        let bytes = sample_handshake().encode();
        assert_eq!(
            ClientMessage::decode(&bytes),
            Err(ProtocolError::UnexpectedTag(Tag::Connect))
        );
    }

    #[test]
    fn test_invalid_utf8_is_rejected() {
        let mut w = PacketWriter::tagged(Tag::Message, 1);
        w.put_u32(2).put_raw(&[0xC3, 0x28]);
        assert_eq!(
            ClientMessage::decode(&w.into_bytes()),
            Err(ProtocolError::InvalidUtf8)
        );
    }

    #[test]
    fn test_update_roundtrip() {
        let update = ServerMessage::Update {
            id: SERVER_ID,
            entries: vec![
                GhostUpdate {
                    id: 1,
                    ghost: sample_ghost(),
                },
                GhostUpdate {
                    id: 2,
                    ghost: GhostState::default(),
                },
            ],
        };
        assert_eq!(ServerMessage::decode(&update.encode()).unwrap(), update);
    }

    fn arb_ghost() -> impl Strategy<Value = GhostState> {
        (
            prop::array::uniform6(-1.0e6f32..1.0e6f32),
            0u8..=127,
            any::<bool>(),
        )
            .prop_map(|(f, view_offset, grounded)| GhostState {
                position: Vec3::new(f[0], f[1], f[2]),
                view_angle: Vec3::new(f[3], f[4], f[5]),
                view_offset,
                grounded,
            })
    }

    fn arb_client_message() -> impl Strategy<Value = ClientMessage> {
        prop_oneof![
            any::<u32>().prop_map(|id| ClientMessage::Ping { id }),
            any::<u32>().prop_map(|id| ClientMessage::Disconnect { id }),
            (any::<u32>(), ".{0,24}")
                .prop_map(|(id, level)| ClientMessage::MapChange { id, level }),
            (any::<u32>(), any::<u32>())
                .prop_map(|(id, token)| ClientMessage::HeartBeat { id, token }),
            (any::<u32>(), ".{0,64}").prop_map(|(id, text)| ClientMessage::Message { id, text }),
            (any::<u32>(), arb_ghost()).prop_map(|(id, ghost)| ClientMessage::Update { id, ghost }),
            (any::<u32>(), prop::collection::vec(any::<u8>(), 0..32))
                .prop_map(|(id, payload)| ClientMessage::SpeedrunFinish { id, payload }),
            (any::<u32>(), any::<(u8, u8, u8)>()).prop_map(|(id, (r, g, b))| {
                ClientMessage::ColorChange {
                    id,
                    color: Color::new(r, g, b),
                }
            }),
        ]
    }

    proptest! {
        #[test]
        fn prop_client_messages_are_symmetric(msg in arb_client_message()) {
            prop_assert_eq!(ClientMessage::decode(&msg.encode()).unwrap(), msg);
        }

        #[test]
        fn prop_decoding_garbage_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..64)) {
            let _ = ClientMessage::decode(&bytes);
            let _ = ServerMessage::decode(&bytes);
            let _ = Handshake::decode(&bytes);
            let _ = Roster::decode(&bytes);
        }
    }
}
