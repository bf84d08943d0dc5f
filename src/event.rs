use serde::{Deserialize, Serialize};

use crate::{
    error::{HubError, Result},
    event_id::EventId,
    keys,
};

/// The message sets an account can hold, one cache dimension each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StoreKind {
    Casts,
    Links,
    Reactions,
    UserData,
    Verifications,
    UsernameProofs,
}

impl StoreKind {
    pub const ALL: [StoreKind; 6] = [
        StoreKind::Casts,
        StoreKind::Links,
        StoreKind::Reactions,
        StoreKind::UserData,
        StoreKind::Verifications,
        StoreKind::UsernameProofs,
    ];

    /// Stable byte used in message-index keys.
    pub fn postfix(self) -> u8 {
        match self {
            StoreKind::Casts => 1,
            StoreKind::Links => 2,
            StoreKind::Reactions => 3,
            StoreKind::UserData => 4,
            StoreKind::Verifications => 5,
            StoreKind::UsernameProofs => 6,
        }
    }

    pub fn from_postfix(byte: u8) -> Result<Self> {
        match byte {
            1 => Ok(StoreKind::Casts),
            2 => Ok(StoreKind::Links),
            3 => Ok(StoreKind::Reactions),
            4 => Ok(StoreKind::UserData),
            5 => Ok(StoreKind::Verifications),
            6 => Ok(StoreKind::UsernameProofs),
            other => Err(HubError::InvalidParam(format!(
                "unknown store kind byte {other}"
            ))),
        }
    }
}

/// The envelope of a store message. `payload` is the store-specific encoded
/// body and stays opaque here; the surrounding fields are what the event
/// handler needs to key, order, and account for the message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub fid: u64,
    pub kind: StoreKind,
    /// Seconds since the Farcaster epoch.
    pub timestamp: u32,
    pub hash: Vec<u8>,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn ts_hash(&self) -> Result<Vec<u8>> {
        keys::make_ts_hash(self.timestamp, &self.hash)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OnChainKind {
    IdRegister,
    SignerAdd,
    SignerRemove,
    StorageRent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnChainBody {
    pub fid: u64,
    pub kind: OnChainKind,
    /// Purchased storage units in effect after this event; meaningful only
    /// for `StorageRent`.
    pub units: u32,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsernameProofBody {
    pub fid: u64,
    pub proof: Vec<u8>,
    /// The UserData message merged alongside the proof, when one exists; the
    /// cache accounts for it the same way it accounts for a merge.
    pub message: Option<Message>,
    pub deleted_message: Option<Message>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HubEventBody {
    MergeMessage {
        message: Message,
        /// Conflicting messages displaced by this merge.
        deleted_messages: Vec<Message>,
    },
    PruneMessage {
        message: Message,
    },
    RevokeMessage {
        message: Message,
    },
    MergeUsernameProof(UsernameProofBody),
    MergeOnChainEvent(OnChainBody),
}

/// Dispatch channel of an event. The enum is closed, so an event without a
/// channel is unrepresentable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    MergeMessage,
    PruneMessage,
    RevokeMessage,
    MergeUsernameProof,
    MergeOnChainEvent,
}

impl EventKind {
    pub const COUNT: usize = 5;

    pub(crate) fn index(self) -> usize {
        match self {
            EventKind::MergeMessage => 0,
            EventKind::PruneMessage => 1,
            EventKind::RevokeMessage => 2,
            EventKind::MergeUsernameProof => 3,
            EventKind::MergeOnChainEvent => 4,
        }
    }
}

impl HubEventBody {
    pub fn kind(&self) -> EventKind {
        match self {
            HubEventBody::MergeMessage { .. } => EventKind::MergeMessage,
            HubEventBody::PruneMessage { .. } => EventKind::PruneMessage,
            HubEventBody::RevokeMessage { .. } => EventKind::RevokeMessage,
            HubEventBody::MergeUsernameProof(_) => EventKind::MergeUsernameProof,
            HubEventBody::MergeOnChainEvent(_) => EventKind::MergeOnChainEvent,
        }
    }
}

/// One entry of the totally-ordered event log. Created at commit, never
/// mutated, deleted only by time-bounded pruning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubEvent {
    pub id: EventId,
    pub body: HubEventBody,
}

impl HubEvent {
    pub fn kind(&self) -> EventKind {
        self.body.kind()
    }
}

pub fn encode_event(event: &HubEvent) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(event)?)
}

/// Decoding is strict: a failure means corruption or schema drift and is
/// fatal for the read that hit it.
pub fn decode_event(bytes: &[u8]) -> Result<HubEvent> {
    Ok(serde_json::from_slice(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(fid: u64, kind: StoreKind) -> Message {
        Message {
            fid,
            kind,
            timestamp: 1_000,
            hash: vec![0xAA; 20],
            payload: b"body".to_vec(),
        }
    }

    #[test]
    fn store_kind_postfixes_round_trip() {
        for kind in StoreKind::ALL {
            assert_eq!(StoreKind::from_postfix(kind.postfix()).unwrap(), kind);
        }
        assert!(StoreKind::from_postfix(0).is_err());
        assert!(StoreKind::from_postfix(7).is_err());
    }

    #[test]
    fn every_body_maps_to_a_channel() {
        let m = message(1, StoreKind::Casts);
        let bodies = [
            HubEventBody::MergeMessage {
                message: m.clone(),
                deleted_messages: Vec::new(),
            },
            HubEventBody::PruneMessage { message: m.clone() },
            HubEventBody::RevokeMessage { message: m.clone() },
            HubEventBody::MergeUsernameProof(UsernameProofBody {
                fid: 1,
                proof: b"proof".to_vec(),
                message: None,
                deleted_message: None,
            }),
            HubEventBody::MergeOnChainEvent(OnChainBody {
                fid: 1,
                kind: OnChainKind::StorageRent,
                units: 2,
                payload: Vec::new(),
            }),
        ];
        let kinds: Vec<EventKind> = bodies.iter().map(HubEventBody::kind).collect();
        assert_eq!(kinds.len(), EventKind::COUNT);
        for (i, kind) in kinds.iter().enumerate() {
            assert_eq!(kind.index(), i);
        }
    }

    #[test]
    fn codec_round_trips_and_rejects_garbage() {
        let event = HubEvent {
            id: EventId::from_parts(42, 1).unwrap(),
            body: HubEventBody::MergeMessage {
                message: message(7, StoreKind::Reactions),
                deleted_messages: vec![message(7, StoreKind::Reactions)],
            },
        };
        let bytes = encode_event(&event).unwrap();
        assert_eq!(decode_event(&bytes).unwrap(), event);

        assert!(matches!(
            decode_event(b"not an event"),
            Err(HubError::Serialization(_))
        ));
    }
}
