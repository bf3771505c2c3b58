use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::{
    client::Client,
    consumer::{subscription_state::SubscriptionState, RebalanceListener},
    error::{Error, Result},
    metadata::TopicPartition,
    transport::Transport,
    BrokerId, MemberId, NO_GENERATION,
};

/// Client-side half of the group protocol: coordinator discovery, the
/// join/sync rebalance dance, heartbeats, and offset commit/fetch. One per
/// session; driven entirely from `poll`.
pub struct ConsumerCoordinator<T: Transport> {
    client: Client<T>,
    group_id: String,
    session_timeout: Duration,
    heartbeat_interval: Duration,
    member_id: MemberId,
    generation: i32,
    coordinator: Option<BrokerId>,
    last_heartbeat: Instant,
    rejoin_needed: bool,
    /// The revocation callback fires once per rebalance, before the first
    /// join attempt, even when joining takes several rounds.
    revoked_fired: bool,
    /// Offsets queued by async commits, flushed on the next poll.
    pending_offsets: HashMap<TopicPartition, i64>,
}

impl<T: Transport> ConsumerCoordinator<T> {
    pub fn new(
        client: Client<T>,
        group_id: String,
        session_timeout: Duration,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            client,
            group_id,
            session_timeout,
            heartbeat_interval,
            member_id: MemberId::new(),
            generation: NO_GENERATION,
            coordinator: None,
            last_heartbeat: Instant::now(),
            rejoin_needed: true,
            revoked_fired: false,
            pending_offsets: HashMap::new(),
        }
    }

    pub fn generation(&self) -> i32 {
        self.generation
    }

    pub fn rejoin_needed(&self) -> bool {
        self.rejoin_needed
    }

    pub fn request_rejoin(&mut self) {
        self.rejoin_needed = true;
    }

    async fn ensure_coordinator(&mut self) -> Result<BrokerId> {
        if let Some(coordinator) = self.coordinator {
            return Ok(coordinator);
        }
        let coordinator = self.client.find_coordinator(&self.group_id).await?;
        debug!("group {} is coordinated by broker {coordinator}", self.group_id);
        self.coordinator = Some(coordinator);
        Ok(coordinator)
    }

    fn mark_coordinator_unknown(&mut self) {
        self.coordinator = None;
    }

    /// Runs the rebalance protocol until the group is stable or `deadline`
    /// passes. Returns `Ok(true)` when a new assignment was installed,
    /// `Ok(false)` when nothing needed doing or the deadline hit first (the
    /// rejoin then resumes on the next poll).
    pub async fn ensure_active_group(
        &mut self,
        subscriptions: &mut SubscriptionState,
        listener: &mut dyn RebalanceListener,
        deadline: Instant,
    ) -> Result<bool> {
        if !self.rejoin_needed {
            return Ok(false);
        }

        if !self.revoked_fired {
            let revoked = subscriptions.assigned_partitions();
            debug!("revoking {} partition(s) before rejoin", revoked.len());
            listener.on_partitions_revoked(&revoked);
            self.revoked_fired = true;
        }

        let topics: Vec<String> = {
            let mut topics: Vec<String> = subscriptions.topics.iter().cloned().collect();
            topics.sort();
            topics
        };

        loop {
            match self.try_rejoin(&topics).await {
                Ok(Some(assignment)) => {
                    subscriptions.replace_assignment(assignment.clone());
                    self.seed_positions(subscriptions).await?;
                    self.rejoin_needed = false;
                    self.revoked_fired = false;
                    self.last_heartbeat = Instant::now();
                    info!(
                        "joined group {} generation {} with {} partition(s)",
                        self.group_id,
                        self.generation,
                        assignment.len()
                    );
                    listener.on_partitions_assigned(&assignment);
                    return Ok(true);
                }
                Ok(None) => {}
                Err(e) => return Err(e),
            }
            if Instant::now() + self.client.retry.backoff >= deadline {
                return Ok(false);
            }
            sleep(self.client.retry.backoff).await;
        }
    }

    /// One join/sync round. `Ok(None)` means "not yet, retry".
    async fn try_rejoin(&mut self, topics: &[String]) -> Result<Option<Vec<TopicPartition>>> {
        let coordinator = match self.ensure_coordinator().await {
            Ok(coordinator) => coordinator,
            Err(e) if e.is_retryable() => return Ok(None),
            Err(e) => return Err(e),
        };

        let joined = self
            .client
            .join_group(
                coordinator,
                &self.group_id,
                &self.member_id,
                topics.to_vec(),
                self.session_timeout,
            )
            .await;
        match joined {
            Ok((member_id, generation)) => {
                self.member_id = member_id;
                self.generation = generation;
            }
            Err(e) => return self.rejoin_setback(e).map(|_| None),
        }

        match self
            .client
            .sync_group(coordinator, &self.group_id, &self.member_id, self.generation)
            .await
        {
            Ok(assignment) => Ok(Some(assignment)),
            Err(e) => self.rejoin_setback(e).map(|_| None),
        }
    }

    /// Classifies a join/sync failure into retry, state reset or fatal.
    fn rejoin_setback(&mut self, e: Error) -> Result<()> {
        match e {
            Error::RebalanceInProgress => Ok(()),
            Error::MemberIdRequired { member_id } => {
                debug!("coordinator assigned member id {member_id}, rejoining with it");
                self.member_id = member_id;
                Ok(())
            }
            Error::UnknownMember => {
                debug!("member id rejected, rejoining as a new member");
                self.member_id.clear();
                self.generation = NO_GENERATION;
                Ok(())
            }
            Error::StaleGeneration { .. } => {
                self.generation = NO_GENERATION;
                Ok(())
            }
            e if e.is_retryable() => {
                debug!("coordinator lost during rejoin: {e}");
                self.mark_coordinator_unknown();
                Ok(())
            }
            e => Err(e),
        }
    }

    /// Looks up committed offsets for freshly assigned partitions. Those
    /// with a committed offset start there; the rest fall back to the
    /// session's reset strategy.
    pub(crate) async fn seed_positions(&mut self, subscriptions: &mut SubscriptionState) -> Result<()> {
        let needed = subscriptions.partitions_needing_position();
        if needed.is_empty() {
            return Ok(());
        }
        let committed = self.fetch_committed(needed.clone()).await?;
        let strategy = subscriptions.default_reset_strategy;
        for tp in needed {
            match committed.get(&tp).copied().flatten() {
                Some(offset) => {
                    debug!("resuming {tp} from committed offset {offset}");
                    subscriptions.seed(&tp, offset)?;
                }
                None => subscriptions.request_reset(&tp, strategy)?,
            }
        }
        Ok(())
    }

    /// Sends a heartbeat when the interval elapsed. Any fencing response
    /// flags the session for rejoin; a dead coordinator additionally forces
    /// rediscovery.
    pub async fn heartbeat_if_due(&mut self) -> Result<()> {
        if self.rejoin_needed || self.generation == NO_GENERATION {
            return Ok(());
        }
        if self.last_heartbeat.elapsed() < self.heartbeat_interval {
            return Ok(());
        }
        let coordinator = match self.ensure_coordinator().await {
            Ok(coordinator) => coordinator,
            Err(e) if e.is_retryable() => {
                debug!("coordinator lookup failed before heartbeat: {e}");
                self.rejoin_needed = true;
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        match self
            .client
            .heartbeat(coordinator, &self.group_id, &self.member_id, self.generation)
            .await
        {
            Ok(()) => {
                self.last_heartbeat = Instant::now();
                Ok(())
            }
            Err(Error::RebalanceInProgress) => {
                debug!("heartbeat answered with rebalance-in-progress, rejoining");
                self.rejoin_needed = true;
                Ok(())
            }
            Err(Error::StaleGeneration { .. }) | Err(Error::UnknownMember) => {
                debug!("heartbeat fenced, rejoining as a new member");
                self.member_id.clear();
                self.generation = NO_GENERATION;
                self.rejoin_needed = true;
                Ok(())
            }
            Err(e) if e.is_retryable() => {
                warn!("heartbeat failed: {e}");
                self.mark_coordinator_unknown();
                self.rejoin_needed = true;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Commits offsets and does not return until the coordinator durably
    /// accepted them or a non-transient error says it never will. Fencing
    /// errors (stale generation, unknown member) propagate to the caller;
    /// they mean the offsets belong to an assignment this member no longer
    /// holds.
    pub async fn commit_sync(&mut self, offsets: HashMap<TopicPartition, i64>) -> Result<()> {
        if offsets.is_empty() {
            return Ok(());
        }
        let mut last = Error::CoordinatorUnavailable;
        for _ in 0..self.client.retry.max_attempts {
            let coordinator = match self.ensure_coordinator().await {
                Ok(coordinator) => coordinator,
                Err(e) if e.is_retryable() => {
                    last = e;
                    sleep(self.client.retry.backoff).await;
                    continue;
                }
                Err(e) => return Err(e),
            };
            match self
                .client
                .offset_commit(
                    coordinator,
                    &self.group_id,
                    &self.member_id,
                    self.generation,
                    offsets.clone(),
                )
                .await
            {
                Ok(()) => return Ok(()),
                Err(e @ Error::StaleGeneration { .. })
                | Err(e @ Error::UnknownMember)
                | Err(e @ Error::RebalanceInProgress) => {
                    self.rejoin_needed = true;
                    return Err(e);
                }
                Err(e) if e.is_retryable() => {
                    debug!("offset commit failed transiently: {e}");
                    self.mark_coordinator_unknown();
                    last = e;
                    sleep(self.client.retry.backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last)
    }

    /// Queues offsets for the next poll's flush.
    pub fn commit_async(&mut self, offsets: HashMap<TopicPartition, i64>) {
        self.pending_offsets.extend(offsets);
    }

    /// Flushes queued async commits. Fencing failures are logged and the
    /// offsets dropped, since the assignment they describe is gone anyway;
    /// transport failures propagate.
    pub async fn flush_pending_commits(&mut self) -> Result<()> {
        if self.pending_offsets.is_empty() {
            return Ok(());
        }
        let offsets = std::mem::take(&mut self.pending_offsets);
        match self.commit_sync(offsets).await {
            Ok(()) => Ok(()),
            Err(
                e @ (Error::StaleGeneration { .. }
                | Error::UnknownMember
                | Error::RebalanceInProgress),
            ) => {
                warn!("dropping queued offset commit superseded by a rebalance: {e}");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Committed offsets as the coordinator knows them, `None` per partition
    /// nothing was ever committed for.
    pub async fn fetch_committed(
        &mut self,
        partitions: Vec<TopicPartition>,
    ) -> Result<HashMap<TopicPartition, Option<i64>>> {
        let mut last = Error::CoordinatorUnavailable;
        for _ in 0..self.client.retry.max_attempts {
            let coordinator = match self.ensure_coordinator().await {
                Ok(coordinator) => coordinator,
                Err(e) if e.is_retryable() => {
                    last = e;
                    sleep(self.client.retry.backoff).await;
                    continue;
                }
                Err(e) => return Err(e),
            };
            match self
                .client
                .offset_fetch(coordinator, &self.group_id, partitions.clone())
                .await
            {
                Ok(offsets) => return Ok(offsets),
                Err(e) if e.is_retryable() => {
                    self.mark_coordinator_unknown();
                    last = e;
                    sleep(self.client.retry.backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last)
    }

    /// Best-effort leave on close; the coordinator will expire us anyway if
    /// this never arrives.
    pub async fn maybe_leave_group(&mut self) {
        if self.member_id.is_empty() {
            return;
        }
        if let Ok(coordinator) = self.ensure_coordinator().await {
            if let Err(e) = self
                .client
                .leave_group(coordinator, &self.group_id, &self.member_id)
                .await
            {
                debug!("leave group failed: {e}");
            }
        }
        self.member_id.clear();
        self.generation = NO_GENERATION;
        self.rejoin_needed = true;
    }
}
