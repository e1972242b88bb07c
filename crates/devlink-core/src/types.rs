//! Core wire types for devlink
//!
//! Identity newtypes, the signaling payload exchanged through the DHT, and
//! the control/protocol messages carried inside the multiplexed transport.

use serde::{Deserialize, Serialize};
use std::fmt;

/// 32-byte fixed-size array used for hashes and identifiers.
pub type Bytes32 = [u8; 32];

/// Identifier of one connection attempt (random, never 0).
pub type AttemptId = u64;

// =============================================================================
// IDENTITY TYPES
// =============================================================================

/// Device identifier: BLAKE3("device-id" || device public key)
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub Bytes32);

impl DeviceId {
    pub fn as_bytes(&self) -> &Bytes32 {
        &self.0
    }

    /// Full lowercase hex representation
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

/// Account-level identity owning one or more devices: BLAKE3("peer-id" || account public key)
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerIdentity(pub Bytes32);

impl PeerIdentity {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

/// DHT location where a device listens for connection requests
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct SignalingKey(pub Bytes32);

// =============================================================================
// CHANNEL IDS
// =============================================================================

/// Reserved channel carrying channel-open/accept/decline traffic
pub const CONTROL_CHANNEL: u16 = 0;

/// Reserved channel carrying beacon and version meta-messages
pub const PROTOCOL_CHANNEL: u16 = 0xFFFF;

/// Whether `channel` is usable for data
pub fn is_data_channel(channel: u16) -> bool {
    channel != CONTROL_CHANNEL && channel != PROTOCOL_CHANNEL
}

// =============================================================================
// SIGNALING
// =============================================================================

/// Connection offer or answer published through the DHT.
///
/// Exactly one request and one answer are exchanged per attempt.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerConnectionRequest {
    pub id: AttemptId,
    pub ice_msg: String,
    #[serde(rename = "isAnswer")]
    pub is_answer: bool,
    #[serde(rename = "connType")]
    pub conn_type: String,
}

impl PeerConnectionRequest {
    /// Base used to compute the DHT listen key of a device
    pub const KEY_PREFIX: &'static str = "peer:";

    pub fn request(id: AttemptId, ice_msg: String, conn_type: impl Into<String>) -> Self {
        Self {
            id,
            ice_msg,
            is_answer: false,
            conn_type: conn_type.into(),
        }
    }

    pub fn answer(id: AttemptId, ice_msg: String) -> Self {
        Self {
            id,
            ice_msg,
            is_answer: true,
            conn_type: String::new(),
        }
    }

    /// Identifier used to deduplicate deliveries
    pub fn message_id(&self) -> String {
        format!("{:016x}", self.id)
    }
}

// =============================================================================
// CONTROL CHANNEL
// =============================================================================

/// State of a channel request on the control channel
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChannelRequestState {
    Request,
    Accept,
    Decline,
}

/// Channel open request, mirrored back by the acceptor with its decision
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelRequest {
    pub name: String,
    pub channel: u16,
    pub state: ChannelRequestState,
}

impl ChannelRequest {
    pub fn request(name: impl Into<String>, channel: u16) -> Self {
        Self {
            name: name.into(),
            channel,
            state: ChannelRequestState::Request,
        }
    }

    /// Answer to this request with the given decision
    pub fn reply(&self, accept: bool) -> Self {
        Self {
            name: self.name.clone(),
            channel: self.channel,
            state: if accept {
                ChannelRequestState::Accept
            } else {
                ChannelRequestState::Decline
            },
        }
    }
}

// =============================================================================
// PROTOCOL CHANNEL
// =============================================================================

/// Liveness check: `p == true` is a request, `false` a response
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BeaconMsg {
    pub p: bool,
}

/// Multiplexing protocol version announcement
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct VersionMsg {
    pub v: i32,
}

/// Any message carried on [`PROTOCOL_CHANNEL`], told apart by its field name
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum ProtocolMsg {
    Beacon(BeaconMsg),
    Version(VersionMsg),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_channels() {
        assert!(!is_data_channel(CONTROL_CHANNEL));
        assert!(!is_data_channel(PROTOCOL_CHANNEL));
        assert!(is_data_channel(42));
    }

    #[test]
    fn test_channel_request_reply() {
        let req = ChannelRequest::request("git:conv1", 42);
        let declined = req.reply(false);
        assert_eq!(declined.channel, 42);
        assert_eq!(declined.state, ChannelRequestState::Decline);
        assert_eq!(req.reply(true).state, ChannelRequestState::Accept);
    }

    #[test]
    fn test_message_id_is_hex() {
        let req = PeerConnectionRequest::request(0xabc, String::new(), "");
        assert_eq!(req.message_id(), "0000000000000abc");
    }
}
