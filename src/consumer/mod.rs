//! The consumer session: a single-threaded, poll-driven group member.
//! Every protocol interaction (rebalancing, heartbeats, commits, fetches)
//! happens inside [`ConsumerSession::poll`] or an explicit call; there are
//! no background tasks, so rebalance callbacks always run on the caller's
//! stack.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use bytes::Bytes;
use tokio::time::sleep;
use tracing::warn;

mod coordinator;
mod fetcher;
mod subscription_state;

use coordinator::ConsumerCoordinator;
use fetcher::Fetcher;
pub use subscription_state::{FetchState, OffsetResetStrategy, SubscriptionState};

use crate::{
    client::{Client, RetryOptions},
    error::{Error, Result},
    metadata::TopicPartition,
    transport::{ListOffset, Transport},
    PartitionId,
};

/// A record as handed to the application, with its provenance attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerRecord {
    pub topic: String,
    pub partition: PartitionId,
    pub offset: i64,
    pub key: Option<Bytes>,
    pub value: Bytes,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitMode {
    /// Block until the coordinator durably accepted the offsets.
    Sync,
    /// Queue the offsets; they go out on the next poll.
    Async,
}

/// Where the session is in its lifecycle. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unsubscribed,
    /// Subscribed, waiting for the first assignment.
    Subscribed,
    Assigned,
    /// A rebalance is in flight; the old assignment has been revoked.
    Rebalancing,
    Closed,
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub group_id: String,
    /// A member silent for longer than this is evicted by the coordinator.
    pub session_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub max_partition_fetch_bytes: i32,
    pub auto_offset_reset: OffsetResetStrategy,
    /// Mode used by [`ConsumerSession::commit_offsets`].
    pub commit_mode: CommitMode,
    pub retry: RetryOptions,
}

impl ConsumerConfig {
    pub fn new<S: Into<String>>(group_id: S) -> Self {
        Self {
            group_id: group_id.into(),
            session_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(3),
            max_partition_fetch_bytes: 1024 * 1024,
            auto_offset_reset: OffsetResetStrategy::default(),
            commit_mode: CommitMode::Sync,
            retry: RetryOptions::default(),
        }
    }
}

/// Hooks invoked during a rebalance, on the thread calling `poll`.
/// Revocation runs before the member rejoins, so implementations can commit
/// final offsets for partitions they are about to lose; assignment runs
/// after the new generation is installed and positions are resolved.
pub trait RebalanceListener: Send {
    fn on_partitions_revoked(&mut self, _partitions: &[TopicPartition]) {}
    fn on_partitions_assigned(&mut self, _partitions: &[TopicPartition]) {}
}

/// Default listener that does nothing.
pub struct NoopRebalanceListener;

impl RebalanceListener for NoopRebalanceListener {}

/// A group consumer over one transport. Subscribe (group-managed) or assign
/// (standalone), then drive it with `poll`.
pub struct ConsumerSession<T: Transport> {
    config: ConsumerConfig,
    client: Client<T>,
    subscriptions: SubscriptionState,
    coordinator: ConsumerCoordinator<T>,
    fetcher: Fetcher<T>,
    listener: Box<dyn RebalanceListener>,
    state: SessionState,
}

impl<T: Transport> ConsumerSession<T> {
    pub fn new(client: Client<T>, config: ConsumerConfig) -> Self {
        let client = client.with_retry(config.retry.clone());
        let coordinator = ConsumerCoordinator::new(
            client.clone(),
            config.group_id.clone(),
            config.session_timeout,
            config.heartbeat_interval,
        );
        let fetcher = Fetcher::new(
            client.clone(),
            config.max_partition_fetch_bytes,
            config.retry.max_attempts,
        );
        let subscriptions = SubscriptionState::new(config.auto_offset_reset);
        Self {
            config,
            client,
            subscriptions,
            coordinator,
            fetcher,
            listener: Box::new(NoopRebalanceListener),
            state: SessionState::Unsubscribed,
        }
    }

    pub fn with_listener(mut self, listener: Box<dyn RebalanceListener>) -> Self {
        self.listener = listener;
        self
    }

    /// Joins the group for the given topics. Partitions arrive via the
    /// rebalance protocol on the next poll.
    pub fn subscribe(&mut self, topics: Vec<String>) -> Result<()> {
        self.ensure_open()?;
        self.subscriptions.subscribe(topics)?;
        self.coordinator.request_rejoin();
        self.state = SessionState::Subscribed;
        Ok(())
    }

    /// Pins an explicit partition set, bypassing group membership. Commits
    /// are unavailable in this mode since they are fenced by membership.
    pub fn assign(&mut self, partitions: Vec<TopicPartition>) -> Result<()> {
        self.ensure_open()?;
        self.subscriptions.assign(partitions)?;
        self.state = SessionState::Assigned;
        Ok(())
    }

    pub fn assignment(&self) -> Vec<TopicPartition> {
        self.subscriptions.assigned_partitions()
    }

    /// Drives the session and returns the next batch of records, or an
    /// empty batch when `timeout` passes without data. All group protocol
    /// work happens in here.
    pub async fn poll(&mut self, timeout: Duration) -> Result<Vec<ConsumerRecord>> {
        self.ensure_open()?;
        if !self.subscriptions.has_subscription() {
            return Err(Error::InvalidSessionState(
                "poll before subscribe or assign",
            ));
        }
        let deadline = Instant::now() + timeout;
        loop {
            if self.subscriptions.uses_group_management() {
                if self.coordinator.rejoin_needed() && self.state == SessionState::Assigned {
                    self.state = SessionState::Rebalancing;
                }
                let rebalanced = self
                    .coordinator
                    .ensure_active_group(&mut self.subscriptions, self.listener.as_mut(), deadline)
                    .await?;
                if rebalanced {
                    // Buffered data may belong to a previous assignment.
                    self.fetcher.clear_buffers();
                    self.state = SessionState::Assigned;
                }
                if self.coordinator.rejoin_needed() {
                    // The deadline hit with the rebalance still in flight.
                    // The old assignment is revoked, so nothing may be
                    // delivered until the new one is installed.
                    return Ok(Vec::new());
                }
                self.coordinator.heartbeat_if_due().await?;
                if self.coordinator.rejoin_needed() {
                    // Heartbeat learned of a rebalance; restart the loop so
                    // revocation runs before any further fetching.
                    continue;
                }
            } else {
                self.coordinator.seed_positions(&mut self.subscriptions).await?;
            }
            self.coordinator.flush_pending_commits().await?;
            self.fetcher.reset_offsets(&mut self.subscriptions).await?;

            let records = self.fetcher.drain(&mut self.subscriptions)?;
            if !records.is_empty() {
                return Ok(records);
            }
            self.fetcher.fetch(&mut self.subscriptions).await?;
            let records = self.fetcher.drain(&mut self.subscriptions)?;
            if !records.is_empty() {
                return Ok(records);
            }

            if Instant::now() + self.config.retry.backoff >= deadline {
                return Ok(Vec::new());
            }
            sleep(self.config.retry.backoff).await;
        }
    }

    /// Offset of the next record `poll` will return for an owned partition.
    pub fn position(&self, tp: &TopicPartition) -> Result<i64> {
        self.subscriptions.position(tp)
    }

    pub fn seek(&mut self, tp: &TopicPartition, offset: i64) -> Result<()> {
        self.ensure_open()?;
        self.subscriptions.seek(tp, offset)
    }

    pub async fn seek_to_beginning(&mut self, partitions: Vec<TopicPartition>) -> Result<()> {
        self.seek_to(partitions, ListOffset::Earliest).await
    }

    pub async fn seek_to_end(&mut self, partitions: Vec<TopicPartition>) -> Result<()> {
        self.seek_to(partitions, ListOffset::Latest).await
    }

    /// Resolves the log edge eagerly so `position` reflects it immediately
    /// after this call returns.
    async fn seek_to(&mut self, partitions: Vec<TopicPartition>, at: ListOffset) -> Result<()> {
        self.ensure_open()?;
        for tp in partitions {
            if !self.subscriptions.is_assigned(&tp) {
                return Err(Error::UnassignedPartition(tp));
            }
            let leader = self
                .client
                .leader(&tp)
                .await?
                .ok_or_else(|| Error::UnknownTopic(tp.topic.clone()))?;
            let offsets = self.client.list_offsets(leader, vec![(tp.clone(), at)]).await?;
            if let Some(offset) = offsets.get(&tp) {
                self.subscriptions.seek(&tp, *offset)?;
            }
        }
        Ok(())
    }

    /// Commits the current positions using the configured commit mode.
    pub async fn commit_offsets(&mut self) -> Result<()> {
        self.commit(self.config.commit_mode).await
    }

    /// Commits the current position of every owned partition.
    pub async fn commit(&mut self, mode: CommitMode) -> Result<()> {
        self.ensure_open()?;
        if !self.subscriptions.uses_group_management() {
            return Err(Error::InvalidSessionState(
                "commits require a subscribed group session",
            ));
        }
        let offsets = self.subscriptions.all_consumed();
        match mode {
            CommitMode::Sync => self.coordinator.commit_sync(offsets).await,
            CommitMode::Async => {
                self.coordinator.commit_async(offsets);
                Ok(())
            }
        }
    }

    pub async fn commit_sync(&mut self) -> Result<()> {
        self.commit(CommitMode::Sync).await
    }

    pub async fn commit_async(&mut self) -> Result<()> {
        self.commit(CommitMode::Async).await
    }

    /// The committed offset for one partition, or `NoOffsetForPartition`
    /// when the group never committed one.
    pub async fn committed(&mut self, tp: &TopicPartition) -> Result<i64> {
        self.ensure_open()?;
        let offsets = self.coordinator.fetch_committed(vec![tp.clone()]).await?;
        offsets
            .get(tp)
            .copied()
            .flatten()
            .ok_or_else(|| Error::NoOffsetForPartition(tp.clone()))
    }

    pub fn pause(&mut self, tp: &TopicPartition) -> Result<()> {
        self.subscriptions.pause(tp)
    }

    pub fn resume(&mut self, tp: &TopicPartition) -> Result<()> {
        self.subscriptions.resume(tp)
    }

    /// Flushes queued commits, revokes the assignment and leaves the group.
    /// The session cannot be used afterwards.
    pub async fn close(&mut self) -> Result<()> {
        if self.state == SessionState::Closed {
            return Ok(());
        }
        if let Err(e) = self.coordinator.flush_pending_commits().await {
            warn!("failed to flush queued commits on close: {e}");
        }
        let revoked = self.subscriptions.assigned_partitions();
        if !revoked.is_empty() {
            self.listener.on_partitions_revoked(&revoked);
        }
        if self.subscriptions.uses_group_management() {
            self.coordinator.maybe_leave_group().await;
        }
        self.subscriptions.unsubscribe();
        self.fetcher.clear_buffers();
        self.state = SessionState::Closed;
        Ok(())
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Generation the member currently holds, for observability.
    pub fn generation(&self) -> i32 {
        self.coordinator.generation()
    }

    /// Topic layout lookup, `None` when the topic does not exist.
    pub async fn partitions_for(&self, topic: &str) -> Result<Option<Vec<PartitionId>>> {
        let partitions = self.client.partitions_for(topic).await?;
        Ok(partitions.map(|infos| infos.into_iter().map(|p| p.partition).collect()))
    }

    /// Current positions of every partition with one, keyed by partition.
    pub fn positions(&self) -> HashMap<TopicPartition, i64> {
        self.subscriptions.all_consumed()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state == SessionState::Closed {
            return Err(Error::InvalidSessionState("session is closed"));
        }
        Ok(())
    }
}
