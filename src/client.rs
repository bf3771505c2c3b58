use std::{collections::HashMap, sync::Arc, time::Duration};

use tracing::debug;

use crate::{
    error::{Error, Result},
    metadata::{Cluster, PartitionInfo, TopicPartition},
    transport::{FetchPartition, ListOffset, PartitionData, Request, Response, Transport},
    BrokerId, MemberId,
};

/// Bounds for internal retries of transient failures.
#[derive(Debug, Clone)]
pub struct RetryOptions {
    pub backoff: Duration,
    pub max_attempts: u32,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            backoff: Duration::from_millis(50),
            max_attempts: 10,
        }
    }
}

/// Shared handle over the transport plus the client-side metadata cache.
/// Cheap to clone; all clones observe the same cache.
pub struct Client<T: Transport> {
    transport: Arc<T>,
    brokers: Vec<BrokerId>,
    pub cluster: Arc<Cluster>,
    pub retry: RetryOptions,
}

impl<T: Transport> Clone for Client<T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            brokers: self.brokers.clone(),
            cluster: self.cluster.clone(),
            retry: self.retry.clone(),
        }
    }
}

impl<T: Transport> Client<T> {
    pub fn new(transport: Arc<T>, brokers: Vec<BrokerId>) -> Self {
        Self {
            transport,
            brokers,
            cluster: Arc::new(Cluster::empty()),
            retry: RetryOptions::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryOptions) -> Self {
        self.retry = retry;
        self
    }

    pub async fn send(&self, broker: BrokerId, request: Request) -> Result<Response> {
        self.transport.send(broker, request).await
    }

    /// Sends a request to any reachable broker, walking the bootstrap list.
    async fn send_any(&self, request: Request) -> Result<Response> {
        let mut last = Error::CoordinatorUnavailable;
        for broker in &self.brokers {
            match self.transport.send(*broker, request.clone()).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() => {
                    debug!("broker {broker} did not answer: {e}");
                    last = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last)
    }

    pub async fn refresh_metadata(&self, topics: Option<Vec<String>>) -> Result<()> {
        match self.send_any(Request::Metadata { topics }).await? {
            Response::Metadata { topics } => {
                self.cluster.merge(topics);
                Ok(())
            }
            other => Err(unexpected("Metadata", &other)),
        }
    }

    /// Ordered partitions (with their leaders) for a topic, or `None` when
    /// the topic does not exist. Refreshes the cache on a miss; never turns
    /// an unknown topic into an error.
    pub async fn partitions_for(&self, topic: &str) -> Result<Option<Vec<PartitionInfo>>> {
        if !self.cluster.contains(topic) {
            self.refresh_metadata(Some(vec![topic.to_string()])).await?;
        }
        Ok(self.cluster.partitions_for(topic))
    }

    /// Current leader of a partition, refreshing metadata on a cache miss.
    pub async fn leader(&self, tp: &TopicPartition) -> Result<Option<BrokerId>> {
        if self.cluster.leader(tp).is_none() {
            self.refresh_metadata(Some(vec![tp.topic.clone()])).await?;
        }
        Ok(self.cluster.leader(tp))
    }

    pub async fn find_coordinator(&self, group_id: &str) -> Result<BrokerId> {
        let request = Request::FindCoordinator {
            group_id: group_id.to_string(),
        };
        match self.send_any(request).await? {
            Response::FindCoordinator { coordinator } => Ok(coordinator),
            other => Err(unexpected("FindCoordinator", &other)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn join_group(
        &self,
        broker: BrokerId,
        group_id: &str,
        member_id: &str,
        topics: Vec<String>,
        session_timeout: Duration,
    ) -> Result<(MemberId, i32)> {
        let request = Request::JoinGroup {
            group_id: group_id.to_string(),
            member_id: member_id.to_string(),
            topics,
            session_timeout,
        };
        match self.send(broker, request).await? {
            Response::JoinGroup {
                member_id,
                generation,
            } => Ok((member_id, generation)),
            other => Err(unexpected("JoinGroup", &other)),
        }
    }

    pub async fn sync_group(
        &self,
        broker: BrokerId,
        group_id: &str,
        member_id: &str,
        generation: i32,
    ) -> Result<Vec<TopicPartition>> {
        let request = Request::SyncGroup {
            group_id: group_id.to_string(),
            member_id: member_id.to_string(),
            generation,
        };
        match self.send(broker, request).await? {
            Response::SyncGroup { assignment } => Ok(assignment),
            other => Err(unexpected("SyncGroup", &other)),
        }
    }

    pub async fn heartbeat(
        &self,
        broker: BrokerId,
        group_id: &str,
        member_id: &str,
        generation: i32,
    ) -> Result<()> {
        let request = Request::Heartbeat {
            group_id: group_id.to_string(),
            member_id: member_id.to_string(),
            generation,
        };
        match self.send(broker, request).await? {
            Response::Heartbeat => Ok(()),
            other => Err(unexpected("Heartbeat", &other)),
        }
    }

    pub async fn leave_group(&self, broker: BrokerId, group_id: &str, member_id: &str) -> Result<()> {
        let request = Request::LeaveGroup {
            group_id: group_id.to_string(),
            member_id: member_id.to_string(),
        };
        match self.send(broker, request).await? {
            Response::LeaveGroup => Ok(()),
            other => Err(unexpected("LeaveGroup", &other)),
        }
    }

    pub async fn offset_commit(
        &self,
        broker: BrokerId,
        group_id: &str,
        member_id: &str,
        generation: i32,
        offsets: HashMap<TopicPartition, i64>,
    ) -> Result<()> {
        let request = Request::OffsetCommit {
            group_id: group_id.to_string(),
            member_id: member_id.to_string(),
            generation,
            offsets,
        };
        match self.send(broker, request).await? {
            Response::OffsetCommit => Ok(()),
            other => Err(unexpected("OffsetCommit", &other)),
        }
    }

    pub async fn offset_fetch(
        &self,
        broker: BrokerId,
        group_id: &str,
        partitions: Vec<TopicPartition>,
    ) -> Result<HashMap<TopicPartition, Option<i64>>> {
        let request = Request::OffsetFetch {
            group_id: group_id.to_string(),
            partitions,
        };
        match self.send(broker, request).await? {
            Response::OffsetFetch { offsets } => Ok(offsets),
            other => Err(unexpected("OffsetFetch", &other)),
        }
    }

    pub async fn list_offsets(
        &self,
        broker: BrokerId,
        partitions: Vec<(TopicPartition, ListOffset)>,
    ) -> Result<HashMap<TopicPartition, i64>> {
        let request = Request::ListOffsets { partitions };
        match self.send(broker, request).await? {
            Response::ListOffsets { offsets } => Ok(offsets),
            other => Err(unexpected("ListOffsets", &other)),
        }
    }

    pub async fn fetch(
        &self,
        broker: BrokerId,
        partitions: Vec<FetchPartition>,
    ) -> Result<Vec<PartitionData>> {
        let request = Request::Fetch { partitions };
        match self.send(broker, request).await? {
            Response::Fetch { partitions } => Ok(partitions),
            other => Err(unexpected("Fetch", &other)),
        }
    }
}

fn unexpected(expected: &str, got: &Response) -> Error {
    Error::Custom(format!("expected {expected} response, got {got:?}"))
}
