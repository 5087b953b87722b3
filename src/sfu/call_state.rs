//! Decoded call state as distributed by the SFU.

use super::SfuError;
use crate::proto;
use prost::Message;
use std::fmt;

/// Participant id assigned by the SFU, unique within one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParticipantId(pub u32);

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A participant as announced in the call state. Guests have no identity,
/// only a display name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParticipantDescription {
    Normal {
        id: ParticipantId,
        identity: String,
        nickname: String,
    },
    Guest {
        id: ParticipantId,
        name: String,
    },
}

impl ParticipantDescription {
    pub fn id(&self) -> ParticipantId {
        match self {
            Self::Normal { id, .. } | Self::Guest { id, .. } => *id,
        }
    }
}

/// The call state blob after decryption with the gck-derived state key.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupCallState {
    pub created_by: ParticipantId,
    /// Milliseconds since the unix epoch.
    pub created_at: u64,
    pub participants: Vec<ParticipantDescription>,
}

impl GroupCallState {
    /// Decode a decrypted call state blob.
    pub fn decode(bytes: &[u8]) -> Result<Self, SfuError> {
        let state = proto::CallState::decode(bytes)?;
        let mut participants = state
            .participants
            .into_values()
            .map(map_participant)
            .collect::<Result<Vec<_>, _>>()?;
        // Map iteration order is unspecified; keep the set stable for callers.
        participants.sort_by_key(|p| p.id());
        Ok(Self {
            created_by: ParticipantId(state.state_created_by),
            created_at: state.state_created_at,
            participants,
        })
    }
}

fn map_participant(
    participant: proto::call_state::Participant,
) -> Result<ParticipantDescription, SfuError> {
    use proto::call_state::participant::Participant as Kind;

    let id = ParticipantId(participant.participant_id);
    match participant.participant {
        Some(Kind::Normal(normal)) => Ok(ParticipantDescription::Normal {
            id,
            identity: normal.identity,
            nickname: normal.nickname,
        }),
        Some(Kind::Guest(guest)) => Ok(ParticipantDescription::Guest {
            id,
            name: guest.name,
        }),
        None => Err(SfuError::InvalidCallState(format!(
            "participant {id} has no variant"
        ))),
    }
}
