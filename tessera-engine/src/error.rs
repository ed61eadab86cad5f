// SPDX-License-Identifier: MIT OR Apache-2.0

use tessera_store::StoreError;
use thiserror::Error;

use crate::groups::GroupId;
use crate::items::ItemId;

/// Errors surfaced by engine operations.
///
/// Every failing operation rolls back its transaction, callers never observe partially applied
/// propagation.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Creating the edge would make the group graph cyclic.
    #[error("relation {parent} -> {child} would create a cycle")]
    RelationCycle { parent: GroupId, child: GroupId },

    /// Creating the edge would make the item graph cyclic.
    #[error("item relation {parent} -> {child} would create a cycle")]
    ItemRelationCycle { parent: ItemId, child: ItemId },

    #[error("group {0} would become an orphan")]
    GroupBecomesOrphan(GroupId),

    #[error("timed out waiting for lock: {0}")]
    LockTimeoutExceeded(String),

    #[error("deadlock detected")]
    DeadlockDetected,

    #[error("could not generate a unique identifier after {attempts} attempts")]
    GeneratorExhausted { attempts: u32 },

    #[error("insufficient access rights")]
    InsufficientAccessRights,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("unprocessable entity: {0}")]
    UnprocessableEntity(String),

    #[error("{0} not found")]
    NotFound(String),

    /// Result propagation ended with rows which can never settle.
    #[error("result propagation stalled with {pending} pending rows")]
    PropagationStalled { pending: usize },

    #[error("unknown {kind} level '{name}'")]
    UnknownLevel { kind: &'static str, name: String },

    #[error(transparent)]
    Unexpected(StoreError),
}

impl EngineError {
    /// Returns `true` if repeating the whole call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::LockTimeoutExceeded(_) | EngineError::DeadlockDetected
        )
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::LockTimeout(name) => EngineError::LockTimeoutExceeded(name),
            StoreError::Deadlock => EngineError::DeadlockDetected,
            StoreError::GeneratorExhausted { attempts } => {
                EngineError::GeneratorExhausted { attempts }
            }
            err => EngineError::Unexpected(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use tessera_store::StoreError;

    use super::EngineError;

    #[test]
    fn store_errors_are_classified() {
        let err: EngineError = StoreError::LockTimeout("groups_groups".into()).into();
        assert!(matches!(err, EngineError::LockTimeoutExceeded(ref name) if name == "groups_groups"));
        assert!(err.is_retryable());

        let err: EngineError = StoreError::Deadlock.into();
        assert!(err.is_retryable());

        let err: EngineError = StoreError::GeneratorExhausted { attempts: 3 }.into();
        assert!(matches!(err, EngineError::GeneratorExhausted { attempts: 3 }));
        assert!(!err.is_retryable());

        let err: EngineError = StoreError::TransactionMissing.into();
        assert!(matches!(err, EngineError::Unexpected(_)));
        assert!(!err.is_retryable());
    }
}
