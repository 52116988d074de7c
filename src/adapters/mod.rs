//! Protocol Gateway.
//!
//! Two transports feed one message shape into the engine:
//!
//! ```text
//! ┌──────────────────────────┐   ┌──────────────────────────┐
//! │ framed TCP (native, and  │   │ WebSocket message bus    │
//! │ auto-registered tracker) │   │ (web/tablet clients)     │
//! └────────────┬─────────────┘   └─────────────┬────────────┘
//!              │      AdapterEvent (mpsc)      │
//!              └───────────────┬───────────────┘
//!                              ▼
//!                      engine + [`Gateway`]
//! ```
//!
//! Every connection runs as its own task. A connection becomes addressable
//! once it registers a name; it then hands the engine the sending side of its
//! outbound queue. The engine-side [`Gateway`] owns that registry, so the
//! connection tasks and the engine share no mutable state.
//!
//! - [`tcp`] - Framed TCP transport
//! - [`bus`] - WebSocket transport
//! - [`gateway`] - Client registry and outbound routing

pub mod bus;
pub mod gateway;
pub mod tcp;

pub use gateway::Gateway;

use crate::net::tcp::ConnectionId;
use crate::store::ClientKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Logical topic of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Registration = 1,
    Plot = 2,
    Link = 3,
    Filter = 4,
    Color = 5,
    WebClient = 6,
    ArClient = 7,
    Control = 8,
    Voice = 9,
    Log = 10,
    InteractionLog = 11,
}

impl Channel {
    /// Resolve a wire channel id.
    pub fn from_id(id: i64) -> Option<Self> {
        Some(match id {
            1 => Self::Registration,
            2 => Self::Plot,
            3 => Self::Link,
            4 => Self::Filter,
            5 => Self::Color,
            6 => Self::WebClient,
            7 => Self::ArClient,
            8 => Self::Control,
            9 => Self::Voice,
            10 => Self::Log,
            11 => Self::InteractionLog,
            _ => return None,
        })
    }

    /// Wire channel id.
    pub fn id(self) -> i64 {
        self as i64
    }
}

/// Message verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Full-state resync.
    Request,
    /// Partial field diff.
    Update,
    Add,
    Remove,
    /// Menu trigger.
    Action,
    /// Generic action payload.
    Cmd,
    /// Connection handshake carrying the client name.
    Register,
}

impl Command {
    /// Parse a wire command.
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "request" => Self::Request,
            "update" => Self::Update,
            "add" => Self::Add,
            "remove" => Self::Remove,
            "action" => Self::Action,
            "cmd" => Self::Cmd,
            "register" => Self::Register,
            _ => return None,
        })
    }

    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Update => "update",
            Self::Add => "add",
            Self::Remove => "remove",
            Self::Action => "action",
            Self::Cmd => "cmd",
            Self::Register => "register",
        }
    }
}

/// Wire envelope shared by both transports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub channel: i64,
    pub command: String,
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    /// Build an envelope.
    pub fn new(channel: Channel, command: Command, payload: Value) -> Self {
        Self {
            channel: channel.id(),
            command: command.as_str().to_string(),
            payload,
        }
    }

    /// Client name carried by a registration message: either the payload
    /// string itself or its `name` field.
    pub fn registration_name(&self) -> Option<String> {
        if Command::parse(&self.command) != Some(Command::Register) {
            return None;
        }
        let name = match &self.payload {
            Value::String(name) => name.as_str(),
            Value::Object(fields) => fields.get("name")?.as_str()?,
            _ => return None,
        };
        let name = name.trim();
        (!name.is_empty()).then(|| name.to_string())
    }
}

/// Identity of a registered client: its name and transport family.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientKey {
    pub name: String,
    pub kind: ClientKind,
}

impl ClientKey {
    pub fn new(name: impl Into<String>, kind: ClientKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }

    /// Fixed identity of the tracking service.
    pub fn tracker() -> Self {
        Self::new("tracker", ClientKind::Tracker)
    }
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.name)
    }
}

/// Events from the transports to the engine.
#[derive(Debug)]
pub enum AdapterEvent {
    /// A connection registered. `outbound` feeds its write loop; dropping it
    /// closes the connection.
    Connected {
        key: ClientKey,
        conn: ConnectionId,
        outbound: mpsc::UnboundedSender<Envelope>,
    },
    /// A registered connection delivered a message.
    Message {
        key: ClientKey,
        conn: ConnectionId,
        envelope: Envelope,
    },
    /// A registered connection went away.
    Disconnected { key: ClientKey, conn: ConnectionId },
}

/// Sending side of the adapter event channel.
pub type EventSender = mpsc::UnboundedSender<AdapterEvent>;

/// A started listener.
#[derive(Debug)]
pub struct ListenerHandle {
    /// Address the listener is bound to.
    pub local_addr: SocketAddr,
    /// Accept loop task; finishes after shutdown.
    pub task: JoinHandle<()>,
}
