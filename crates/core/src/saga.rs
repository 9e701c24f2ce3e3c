//! The onboarding saga and its state machine.
//!
//! Legal sequences are prefixes of
//! `Started -> Provisioning -> {Completed | Failed}`. Terminal sagas are
//! immutable, which is what lets the cache hold them without invalidation.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::{SagaId, Timestamp};

/// State ID type matching SMALLINT in the `saga_states` lookup table.
pub type StateId = i16;

/// Saga lifecycle state.
///
/// Discriminants match the seed order of the `saga_states` table.
#[repr(i16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SagaState {
    Started = 1,
    Provisioning = 2,
    Completed = 3,
    Failed = 4,
}

impl SagaState {
    pub const ALL: [SagaState; 4] = [
        SagaState::Started,
        SagaState::Provisioning,
        SagaState::Completed,
        SagaState::Failed,
    ];

    /// States the sweeper considers resumable.
    pub const NON_TERMINAL: [SagaState; 2] = [SagaState::Started, SagaState::Provisioning];

    /// Return the database state ID.
    pub fn id(self) -> StateId {
        self as StateId
    }

    /// Map a database state ID back to the enum.
    pub fn from_id(id: StateId) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.id() == id)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SagaState::Started => "Started",
            SagaState::Provisioning => "Provisioning",
            SagaState::Completed => "Completed",
            SagaState::Failed => "Failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SagaState::Completed | SagaState::Failed)
    }

    /// Whether `self -> next` is a single legal forward step.
    pub fn can_transition_to(self, next: SagaState) -> bool {
        matches!(
            (self, next),
            (SagaState::Started, SagaState::Provisioning)
                | (SagaState::Provisioning, SagaState::Completed)
                | (SagaState::Provisioning, SagaState::Failed)
        )
    }

    /// Like [`can_transition_to`](Self::can_transition_to) but as a `Result`.
    pub fn ensure_transition(self, next: SagaState) -> Result<(), CoreError> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(CoreError::IllegalTransition {
                from: self,
                to: next,
            })
        }
    }
}

impl fmt::Display for SagaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SagaState {
    type Err = CoreError;

    /// Case-insensitive, so `?state=provisioning` works in query strings.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| CoreError::Validation(format!("Unknown saga state '{s}'")))
    }
}

/// A persisted onboarding saga.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Saga {
    pub id: SagaId,
    pub subject_id: String,
    pub state: SagaState,
    /// Trigger payload kept so provisioning can be re-issued on resume.
    pub payload: serde_json::Value,
    /// Optimistic-concurrency counter; bumped by every write.
    pub version: i64,
    pub last_error: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// Insert DTO for a saga entering `Started`.
#[derive(Debug, Clone)]
pub struct NewSaga {
    pub id: SagaId,
    pub subject_id: String,
    pub payload: serde_json::Value,
}

/// One row of a saga's audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaTransition {
    pub saga_id: SagaId,
    /// `None` for the creation record.
    pub from_state: Option<SagaState>,
    pub to_state: SagaState,
    pub detail: Option<String>,
    pub created_at: Timestamp,
}
