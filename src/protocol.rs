use serde::{Deserialize, Serialize};

/// Status snapshot as it travels on the wire. Every field is a display
/// string; `"---"` marks a value the sender has not loaded.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct PeerReport {
    pub name: String,
    pub class: String,
    pub level: String,
    pub ac: String,
    pub max_hp: String,
    pub max_mana: String,
    pub max_endurance: String,
    pub zone: String,
}

/// Application messages exchanged between the master and its peers.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum Message {
    RequestData {
        from: String,
    },
    PeerData(PeerReport),
    QueryGroup {
        target: String,
        query_id: u64,
    },
    GroupData {
        character: String,
        members: Vec<String>,
        query_id: u64,
    },
    Shutdown,
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RequestData { .. } => "RequestData",
            Self::PeerData(_) => "PeerData",
            Self::QueryGroup { .. } => "QueryGroup",
            Self::GroupData { .. } => "GroupData",
            Self::Shutdown => "Shutdown",
        }
    }
}

/// Transport-level frames. `Mail` carries application messages; the rest
/// is connection plumbing.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub enum Frame {
    Handshake {
        name: String,
        protocol_version: u16,
    },
    HandshakeAck {
        name: String,
        success: bool,
        error_reason: Option<String>,
    },
    Leave {
        name: String,
    },
    Mail(Message),
    RelayCommand {
        command: String,
    },
}

pub mod msg_types {
    pub const HANDSHAKE: u16 = 0x0001;
    pub const HANDSHAKE_ACK: u16 = 0x0002;
    pub const LEAVE: u16 = 0x0003;
    pub const RELAY_COMMAND: u16 = 0x0010;
    pub const MAIL: u16 = 0x0100;
}
