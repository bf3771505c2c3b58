use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::{
    error::{Error, Result},
    metadata::TopicPartition,
};

/// How a position is chosen for a partition with no committed offset, or
/// after the fetch position falls outside the log's retained range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OffsetResetStrategy {
    #[default]
    Earliest,
    Latest,
    /// No automatic reset; the affected partition surfaces an error instead.
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubscriptionType {
    None,
    /// Topics subscribed, partitions assigned by the coordinator.
    AutoTopics,
    /// Partitions pinned by the caller, no group membership involved.
    UserAssigned,
}

/// Fetch lifecycle of one assigned partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchState {
    /// Assigned but the starting position is not resolved yet.
    Initializing,
    /// Position valid, records may be fetched.
    Fetching,
    /// Position must be re-derived from the reset strategy.
    AwaitReset,
}

impl FetchState {
    fn valid_transitions(&self) -> Vec<FetchState> {
        match self {
            FetchState::Initializing => vec![FetchState::Fetching, FetchState::AwaitReset],
            FetchState::Fetching => vec![FetchState::Fetching, FetchState::AwaitReset],
            FetchState::AwaitReset => vec![FetchState::Fetching],
        }
    }

    pub fn has_valid_position(&self) -> bool {
        matches!(self, FetchState::Fetching)
    }
}

#[derive(Debug)]
pub struct TopicPartitionState {
    pub fetch_state: FetchState,
    /// Offset of the next record to hand to the application.
    pub position: Option<i64>,
    pub high_watermark: i64,
    pub log_start_offset: i64,
    pub paused: bool,
    pub reset_strategy: Option<OffsetResetStrategy>,
}

impl TopicPartitionState {
    fn new() -> Self {
        Self {
            fetch_state: FetchState::Initializing,
            position: None,
            high_watermark: -1,
            log_start_offset: -1,
            paused: false,
            reset_strategy: None,
        }
    }

    fn transition_to(&mut self, state: FetchState) {
        if self.fetch_state.valid_transitions().contains(&state) {
            self.fetch_state = state;
        } else {
            debug!(
                "invalid fetch state transition {:?} -> {state:?} ignored",
                self.fetch_state
            );
        }
    }

    pub fn is_fetchable(&self) -> bool {
        !self.paused && self.fetch_state.has_valid_position()
    }

    fn seek(&mut self, offset: i64) {
        self.position = Some(offset);
        self.reset_strategy = None;
        // Seeking out of Initializing or AwaitReset lands in Fetching.
        self.fetch_state = FetchState::Fetching;
    }

    fn await_reset(&mut self, strategy: OffsetResetStrategy) {
        self.reset_strategy = Some(strategy);
        self.position = None;
        self.transition_to(FetchState::AwaitReset);
    }
}

/// Tracks what the session asked for (topics or pinned partitions) and the
/// per-partition fetch state of everything currently assigned. Positions
/// live here and only here; the fetcher and coordinator both read and
/// advance them through this type.
#[derive(Debug)]
pub struct SubscriptionState {
    subscription_type: SubscriptionType,
    pub topics: HashSet<String>,
    pub default_reset_strategy: OffsetResetStrategy,
    assignment: HashMap<TopicPartition, TopicPartitionState>,
}

impl SubscriptionState {
    pub fn new(default_reset_strategy: OffsetResetStrategy) -> Self {
        Self {
            subscription_type: SubscriptionType::None,
            topics: HashSet::new(),
            default_reset_strategy,
            assignment: HashMap::new(),
        }
    }

    pub fn subscribe(&mut self, topics: Vec<String>) -> Result<()> {
        if self.subscription_type == SubscriptionType::UserAssigned {
            return Err(Error::InvalidSessionState(
                "subscribe is not allowed after assign",
            ));
        }
        self.subscription_type = SubscriptionType::AutoTopics;
        self.topics = topics.into_iter().collect();
        Ok(())
    }

    pub fn assign(&mut self, partitions: Vec<TopicPartition>) -> Result<()> {
        if self.subscription_type == SubscriptionType::AutoTopics {
            return Err(Error::InvalidSessionState(
                "assign is not allowed after subscribe",
            ));
        }
        self.subscription_type = SubscriptionType::UserAssigned;
        self.replace_assignment(partitions);
        Ok(())
    }

    pub fn unsubscribe(&mut self) {
        self.subscription_type = SubscriptionType::None;
        self.topics.clear();
        self.assignment.clear();
    }

    pub fn uses_group_management(&self) -> bool {
        self.subscription_type == SubscriptionType::AutoTopics
    }

    pub fn has_subscription(&self) -> bool {
        self.subscription_type != SubscriptionType::None
    }

    /// Installs a new generation's assignment. Revocation destroys all
    /// per-partition state, so every partition (retained or not) starts
    /// over at `Initializing` and is re-seeded from its committed offset
    /// or the reset policy.
    pub fn replace_assignment(&mut self, partitions: Vec<TopicPartition>) {
        self.assignment = partitions
            .into_iter()
            .map(|tp| (tp, TopicPartitionState::new()))
            .collect();
    }

    pub fn assigned_partitions(&self) -> Vec<TopicPartition> {
        let mut partitions: Vec<TopicPartition> = self.assignment.keys().cloned().collect();
        partitions.sort();
        partitions
    }

    pub fn is_assigned(&self, tp: &TopicPartition) -> bool {
        self.assignment.contains_key(tp)
    }

    fn assigned_state_mut(&mut self, tp: &TopicPartition) -> Result<&mut TopicPartitionState> {
        self.assignment
            .get_mut(tp)
            .ok_or_else(|| Error::UnassignedPartition(tp.clone()))
    }

    /// Next offset the application will see for an owned partition.
    pub fn position(&self, tp: &TopicPartition) -> Result<i64> {
        let state = self
            .assignment
            .get(tp)
            .ok_or_else(|| Error::UnassignedPartition(tp.clone()))?;
        match state.position {
            Some(position) => Ok(position),
            None => Err(Error::UnresolvedOffset(tp.clone())),
        }
    }

    pub fn seek(&mut self, tp: &TopicPartition, offset: i64) -> Result<()> {
        self.assigned_state_mut(tp)?.seek(offset);
        Ok(())
    }

    /// Seeds a position from a committed offset during assignment setup.
    pub fn seed(&mut self, tp: &TopicPartition, offset: i64) -> Result<()> {
        self.assigned_state_mut(tp)?.seek(offset);
        Ok(())
    }

    pub fn request_reset(&mut self, tp: &TopicPartition, strategy: OffsetResetStrategy) -> Result<()> {
        self.assigned_state_mut(tp)?.await_reset(strategy);
        Ok(())
    }

    pub fn advance_position(&mut self, tp: &TopicPartition, offset: i64) -> Result<()> {
        let state = self.assigned_state_mut(tp)?;
        if state.fetch_state.has_valid_position() {
            state.position = Some(offset);
        }
        Ok(())
    }

    pub fn update_watermarks(&mut self, tp: &TopicPartition, high: i64, start: i64) {
        if let Some(state) = self.assignment.get_mut(tp) {
            state.high_watermark = high;
            state.log_start_offset = start;
        }
    }

    pub fn pause(&mut self, tp: &TopicPartition) -> Result<()> {
        self.assigned_state_mut(tp)?.paused = true;
        Ok(())
    }

    pub fn resume(&mut self, tp: &TopicPartition) -> Result<()> {
        self.assigned_state_mut(tp)?.paused = false;
        Ok(())
    }

    /// Partitions with a valid position that are not paused, with the
    /// offset to fetch from.
    pub fn fetchable_partitions(&self) -> Vec<(TopicPartition, i64)> {
        let mut out: Vec<(TopicPartition, i64)> = self
            .assignment
            .iter()
            .filter(|(_, state)| state.is_fetchable())
            .filter_map(|(tp, state)| state.position.map(|p| (tp.clone(), p)))
            .collect();
        out.sort();
        out
    }

    /// Partitions waiting for a reset, with the strategy to apply.
    pub fn partitions_needing_reset(&self) -> Vec<(TopicPartition, OffsetResetStrategy)> {
        let mut out: Vec<(TopicPartition, OffsetResetStrategy)> = self
            .assignment
            .iter()
            .filter(|(_, state)| state.fetch_state == FetchState::AwaitReset)
            .map(|(tp, state)| {
                (
                    tp.clone(),
                    state.reset_strategy.unwrap_or(self.default_reset_strategy),
                )
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Partitions still waiting for a committed offset lookup.
    pub fn partitions_needing_position(&self) -> Vec<TopicPartition> {
        let mut out: Vec<TopicPartition> = self
            .assignment
            .iter()
            .filter(|(_, state)| state.fetch_state == FetchState::Initializing)
            .map(|(tp, _)| tp.clone())
            .collect();
        out.sort();
        out
    }

    pub fn has_all_positions(&self) -> bool {
        self.assignment
            .values()
            .all(|state| state.fetch_state.has_valid_position())
    }

    /// Current position of every partition with one, for a commit.
    pub fn all_consumed(&self) -> HashMap<TopicPartition, i64> {
        self.assignment
            .iter()
            .filter_map(|(tp, state)| state.position.map(|p| (tp.clone(), p)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tp(p: i32) -> TopicPartition {
        TopicPartition::new("t", p)
    }

    #[test]
    fn subscribe_then_assign_is_rejected() {
        let mut subs = SubscriptionState::new(OffsetResetStrategy::Earliest);
        subs.subscribe(vec!["t".to_string()]).unwrap();
        assert!(matches!(
            subs.assign(vec![tp(0)]),
            Err(Error::InvalidSessionState(_))
        ));
    }

    #[test]
    fn position_requires_ownership_and_resolution() {
        let mut subs = SubscriptionState::new(OffsetResetStrategy::Earliest);
        subs.assign(vec![tp(0)]).unwrap();

        assert!(matches!(
            subs.position(&tp(1)),
            Err(Error::UnassignedPartition(_))
        ));
        assert!(matches!(
            subs.position(&tp(0)),
            Err(Error::UnresolvedOffset(_))
        ));

        subs.seek(&tp(0), 5).unwrap();
        assert_eq!(subs.position(&tp(0)).unwrap(), 5);
    }

    #[test]
    fn rebalance_destroys_positions_of_every_partition() {
        let mut subs = SubscriptionState::new(OffsetResetStrategy::Earliest);
        subs.subscribe(vec!["t".to_string()]).unwrap();
        subs.replace_assignment(vec![tp(0), tp(1)]);
        subs.seek(&tp(0), 10).unwrap();
        subs.seek(&tp(1), 20).unwrap();

        // Positions do not survive revocation, even for partitions the
        // member gets back; they are re-seeded from committed offsets.
        subs.replace_assignment(vec![tp(1), tp(2)]);
        assert!(!subs.is_assigned(&tp(0)));
        assert!(matches!(
            subs.position(&tp(1)),
            Err(Error::UnresolvedOffset(_))
        ));
        assert_eq!(subs.partitions_needing_position(), vec![tp(1), tp(2)]);
    }

    #[test]
    fn paused_partition_is_not_fetchable() {
        let mut subs = SubscriptionState::new(OffsetResetStrategy::Earliest);
        subs.assign(vec![tp(0)]).unwrap();
        subs.seek(&tp(0), 0).unwrap();
        assert_eq!(subs.fetchable_partitions(), vec![(tp(0), 0)]);

        subs.pause(&tp(0)).unwrap();
        assert!(subs.fetchable_partitions().is_empty());
        subs.resume(&tp(0)).unwrap();
        assert_eq!(subs.fetchable_partitions(), vec![(tp(0), 0)]);
    }

    #[test]
    fn reset_request_invalidates_position() {
        let mut subs = SubscriptionState::new(OffsetResetStrategy::Latest);
        subs.assign(vec![tp(0)]).unwrap();
        subs.seek(&tp(0), 3).unwrap();
        subs.request_reset(&tp(0), OffsetResetStrategy::Earliest)
            .unwrap();

        assert!(matches!(
            subs.position(&tp(0)),
            Err(Error::UnresolvedOffset(_))
        ));
        assert_eq!(
            subs.partitions_needing_reset(),
            vec![(tp(0), OffsetResetStrategy::Earliest)]
        );
    }
}
