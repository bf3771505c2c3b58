use std::sync::PoisonError;

use crate::{metadata::TopicPartition, BrokerId, MemberId};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// A committed-offset query found nothing committed for the partition.
    #[error("no committed offset for {0}")]
    NoOffsetForPartition(TopicPartition),
    /// `position`/`seek` on a partition the session does not currently own.
    #[error("{0} is not assigned to this session")]
    UnassignedPartition(TopicPartition),
    /// A commit or sync carried a generation older than the group's current one.
    #[error("generation {found} is behind the group's current generation {current}")]
    StaleGeneration { found: i32, current: i32 },
    #[error("member id is not known to the group")]
    UnknownMember,
    /// A first join was accepted mid-rebalance; the member must retry with
    /// the id the coordinator assigned, not a fresh empty one.
    #[error("rejoin with assigned member id {member_id}")]
    MemberIdRequired { member_id: MemberId },
    #[error("group coordinator is unavailable")]
    CoordinatorUnavailable,
    /// The contacted broker no longer coordinates this group.
    #[error("coordinator moved to {coordinator:?}")]
    NotCoordinator { coordinator: Option<BrokerId> },
    #[error("broker {0} is unreachable")]
    BrokerUnreachable(BrokerId),
    #[error("group rebalance in progress")]
    RebalanceInProgress,
    #[error("broker is not the leader for {0}")]
    NotLeader(TopicPartition),
    #[error("fetch offset {offset} is out of range for {partition}")]
    OffsetOutOfRange {
        partition: TopicPartition,
        offset: i64,
    },
    /// No committed offset and no reset policy to seed a position from.
    #[error("no offset reset policy configured for {0}")]
    UnresolvedOffset(TopicPartition),
    #[error("topic {0} does not exist")]
    UnknownTopic(String),
    #[error("invalid session state: {0}")]
    InvalidSessionState(&'static str),
    #[error("{0}")]
    Custom(String),
}

impl Error {
    /// Transient errors that must be retried with backoff rather than
    /// surfaced; everything else is structural and propagates immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::BrokerUnreachable(_)
                | Error::CoordinatorUnavailable
                | Error::NotCoordinator { .. }
                | Error::RebalanceInProgress
                | Error::NotLeader(_)
        )
    }
}

impl<T> From<PoisonError<T>> for Error {
    fn from(value: PoisonError<T>) -> Self {
        Self::Custom(value.to_string())
    }
}
