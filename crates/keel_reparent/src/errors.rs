//! Typed failures of the emergency reparent procedure.

use thiserror::Error;

use crate::topology::TabletAlias;

/// Coarse failure taxonomy, independent of transport error types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCode {
    /// The cluster state makes the operation impossible as requested.
    FailedPrecondition,
    /// The operation was abandoned part-way through.
    Aborted,
    /// A consistency violation inside the orchestrator itself.
    Internal,
    /// A fan-out step exceeded its replica wait timeout.
    DeadlineExceeded,
    /// The shard lock was lost at a checkpoint.
    LockLost,
    /// A collaborator call failed beyond the step's tolerance.
    Unavailable,
}

#[derive(Debug, Error)]
pub enum ReparentError {
    #[error("no valid candidates for emergency reparent")]
    NoValidCandidates,

    #[error("split brain detected between servers {first} and {second}")]
    SplitBrain {
        first: TabletAlias,
        second: TabletAlias,
    },

    #[error("requested primary {alias} has errant change records or no known position")]
    ErrantRequested { alias: TabletAlias },

    #[error("requested candidate {alias} is not in the valid candidates list")]
    RequestedNotValid { alias: TabletAlias },

    #[error("elected primary {alias} does not satisfy the geographic constraint")]
    CrossCellConstraint { alias: TabletAlias },

    #[error("elected primary {alias} does not satisfy the promotion rule constraint")]
    PromotionRuleConstraint { alias: TabletAlias },

    #[error("could not undo promotion: shard record has no primary information")]
    NoPreviousPrimary,

    #[error("error undoing promotion: {undo}; original constraint failure: {constraint}")]
    CompensationFailed {
        undo: Box<ReparentError>,
        constraint: Box<ReparentError>,
    },

    #[error("candidate {alias} not found in the tablet map")]
    Inconsistent { alias: String },

    #[error("{step} did not finish within the replica wait timeout")]
    DeadlineExceeded { step: &'static str },

    #[error("lost topology lock on {keyspace}/{shard}, aborting")]
    LockLost {
        keyspace: String,
        shard: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("{step} failed")]
    Step {
        step: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

impl ReparentError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NoValidCandidates | Self::SplitBrain { .. } | Self::ErrantRequested { .. } => {
                ErrorCode::FailedPrecondition
            }
            Self::RequestedNotValid { .. }
            | Self::CrossCellConstraint { .. }
            | Self::PromotionRuleConstraint { .. }
            | Self::NoPreviousPrimary
            | Self::CompensationFailed { .. } => ErrorCode::Aborted,
            Self::Inconsistent { .. } => ErrorCode::Internal,
            Self::DeadlineExceeded { .. } => ErrorCode::DeadlineExceeded,
            Self::LockLost { .. } => ErrorCode::LockLost,
            Self::Step { .. } => ErrorCode::Unavailable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_follow_the_taxonomy() {
        let split = ReparentError::SplitBrain {
            first: TabletAlias::new("z1", 1),
            second: TabletAlias::new("z1", 2),
        };
        assert_eq!(split.code(), ErrorCode::FailedPrecondition);

        let joined = ReparentError::CompensationFailed {
            undo: Box::new(ReparentError::NoPreviousPrimary),
            constraint: Box::new(ReparentError::CrossCellConstraint {
                alias: TabletAlias::new("z2", 7),
            }),
        };
        assert_eq!(joined.code(), ErrorCode::Aborted);
        let text = joined.to_string();
        assert!(text.contains("undoing promotion"));
        assert!(text.contains("geographic constraint"));

        assert_eq!(
            ReparentError::DeadlineExceeded { step: "x" }.code(),
            ErrorCode::DeadlineExceeded
        );
    }
}
