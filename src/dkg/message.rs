//! Wire messages exchanged between group members during key generation.
//!
//! Every message is a self-describing envelope carrying the sender index and
//! the session it belongs to; the scheduler routes by variant and drops
//! anything addressed to a phase other than the current one.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ephemeral::EphemeralPublicKey;
use crate::group::MemberIndex;

/// Opaque session identifier, typically derived from an on-chain request id.
/// All protocol messages carry it; mismatches are dropped before any
/// cryptographic work.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionId(Vec<u8>);

impl SessionId {
    pub fn new(bytes: Vec<u8>) -> Self {
        SessionId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&[u8]> for SessionId {
    fn from(bytes: &[u8]) -> Self {
        SessionId(bytes.to_vec())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self)
    }
}

/// Protocol message envelope, one variant per message phase.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolMessage {
    EphemeralPublicKey(EphemeralPublicKeyMessage),
    TssRoundOne(TssRoundOneMessage),
    TssRoundTwo(TssRoundTwoMessage),
    TssRoundThree(TssRoundThreeMessage),
}

impl ProtocolMessage {
    pub fn sender_id(&self) -> MemberIndex {
        match self {
            ProtocolMessage::EphemeralPublicKey(m) => m.sender_id,
            ProtocolMessage::TssRoundOne(m) => m.sender_id,
            ProtocolMessage::TssRoundTwo(m) => m.sender_id,
            ProtocolMessage::TssRoundThree(m) => m.sender_id,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        match self {
            ProtocolMessage::EphemeralPublicKey(m) => &m.session_id,
            ProtocolMessage::TssRoundOne(m) => &m.session_id,
            ProtocolMessage::TssRoundTwo(m) => &m.session_id,
            ProtocolMessage::TssRoundThree(m) => &m.session_id,
        }
    }
}

/// Public ephemeral keys a member generated for every other group member,
/// keyed by the recipient the key is addressed to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EphemeralPublicKeyMessage {
    pub sender_id: MemberIndex,
    pub session_id: SessionId,
    pub ephemeral_public_keys: BTreeMap<MemberIndex, EphemeralPublicKey>,
}

/// First threshold round broadcast. The payload is opaque to the scheduler.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TssRoundOneMessage {
    pub sender_id: MemberIndex,
    pub session_id: SessionId,
    pub payload: Vec<u8>,
}

/// Second threshold round broadcast.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TssRoundTwoMessage {
    pub sender_id: MemberIndex,
    pub session_id: SessionId,
    pub payload: Vec<u8>,
}

/// Third threshold round broadcast.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TssRoundThreeMessage {
    pub sender_id: MemberIndex,
    pub session_id: SessionId,
    pub payload: Vec<u8>,
}

/// Common accessors the acceptance pipeline needs from any phase message.
pub(crate) trait PhasePayload {
    fn sender_id(&self) -> MemberIndex;
    fn session_id(&self) -> &SessionId;
}

impl PhasePayload for EphemeralPublicKeyMessage {
    fn sender_id(&self) -> MemberIndex {
        self.sender_id
    }

    fn session_id(&self) -> &SessionId {
        &self.session_id
    }
}

impl PhasePayload for TssRoundOneMessage {
    fn sender_id(&self) -> MemberIndex {
        self.sender_id
    }

    fn session_id(&self) -> &SessionId {
        &self.session_id
    }
}

impl PhasePayload for TssRoundTwoMessage {
    fn sender_id(&self) -> MemberIndex {
        self.sender_id
    }

    fn session_id(&self) -> &SessionId {
        &self.session_id
    }
}

impl PhasePayload for TssRoundThreeMessage {
    fn sender_id(&self) -> MemberIndex {
        self.sender_id
    }

    fn session_id(&self) -> &SessionId {
        &self.session_id
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ephemeral::PUBLIC_KEY_BYTES;

    fn ephemeral_message() -> ProtocolMessage {
        let mut keys = BTreeMap::new();
        keys.insert(2, EphemeralPublicKey::from_bytes([7; PUBLIC_KEY_BYTES]));
        keys.insert(3, EphemeralPublicKey::from_bytes([9; PUBLIC_KEY_BYTES]));
        ProtocolMessage::EphemeralPublicKey(EphemeralPublicKeyMessage {
            sender_id: 1,
            session_id: SessionId::new(vec![0xab, 0xcd]),
            ephemeral_public_keys: keys,
        })
    }

    #[test]
    fn envelope_accessors() {
        let message = ephemeral_message();
        assert_eq!(message.sender_id(), 1);
        assert_eq!(message.session_id(), &SessionId::new(vec![0xab, 0xcd]));
    }

    #[test]
    fn session_id_displays_as_hex() {
        let id = SessionId::new(vec![0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(id.to_string(), "deadbeef");
        assert_eq!(format!("{:?}", id), "SessionId(deadbeef)");
    }

    #[test]
    fn wire_round_trip() {
        let original = ephemeral_message();
        let encoded = serde_json::to_string(&original).unwrap();
        let decoded: ProtocolMessage = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, original);

        let round_two = ProtocolMessage::TssRoundTwo(TssRoundTwoMessage {
            sender_id: 4,
            session_id: SessionId::new(vec![1, 2, 3]),
            payload: vec![0, 1, 2, 250],
        });
        let encoded = serde_json::to_string(&round_two).unwrap();
        let decoded: ProtocolMessage = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, round_two);
    }
}
