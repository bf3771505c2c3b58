//! In-process broker cluster: hosts the per-group coordinator state
//! machines and the replicated offset store, and answers the same
//! request/response surface a remote cluster would. Consumer code never
//! touches it directly; everything goes through [`Transport::send`].

use std::{
    collections::{
        hash_map::{DefaultHasher, Entry},
        HashMap,
    },
    hash::{Hash, Hasher},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, RwLock,
    },
    time::{Instant, SystemTime, UNIX_EPOCH},
};

use bytes::Bytes;
use dashmap::DashMap;
use futures::future::BoxFuture;
use tracing::{debug, info};

mod group;
mod offsets;

use group::GroupState;
pub use offsets::{CommitRecord, OffsetStore};

use crate::{
    error::{Error, Result},
    metadata::{PartitionInfo, TopicPartition, GROUP_METADATA_TOPIC_NAME},
    transport::{
        FetchErrorCode, ListOffset, PartitionData, Record, Request, Response, Transport,
    },
    BrokerId, PartitionId,
};

/// Cluster handle. Clones share the same brokers and logs; tests keep one
/// clone for fault injection while consumers hold another as their
/// transport.
pub struct InProcessCluster {
    inner: Arc<ClusterInner>,
}

impl Clone for InProcessCluster {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct ClusterInner {
    brokers: Vec<BrokerState>,
    /// Topic name -> partition count.
    topics: DashMap<String, i32>,
    /// The shared storage engine: one append-only log per partition,
    /// replicated by the engine itself and therefore surviving broker
    /// kills. Brokers only gate access to it via leadership.
    logs: DashMap<TopicPartition, RwLock<Vec<Record>>>,
}

struct BrokerState {
    id: BrokerId,
    alive: AtomicBool,
    /// Coordinator state for groups this broker coordinates. Wiped when
    /// the broker dies; the group re-forms at the newly elected broker.
    groups: Mutex<HashMap<String, GroupState>>,
    /// Replica of the offsets-topic materialized view.
    offsets: OffsetStore,
}

impl InProcessCluster {
    pub fn start(num_brokers: usize) -> Self {
        let brokers = (0..num_brokers as BrokerId)
            .map(|id| BrokerState {
                id,
                alive: AtomicBool::new(true),
                groups: Mutex::new(HashMap::new()),
                offsets: OffsetStore::default(),
            })
            .collect();
        let cluster = Self {
            inner: Arc::new(ClusterInner {
                brokers,
                topics: DashMap::new(),
                logs: DashMap::new(),
            }),
        };
        cluster.create_topic(GROUP_METADATA_TOPIC_NAME, num_brokers.max(1) as i32);
        cluster
    }

    pub fn create_topic(&self, topic: &str, partitions: i32) {
        self.inner.topics.insert(topic.to_string(), partitions);
        for partition in 0..partitions {
            self.inner
                .logs
                .insert(TopicPartition::new(topic, partition), RwLock::new(Vec::new()));
        }
    }

    pub fn broker_ids(&self) -> Vec<BrokerId> {
        self.inner.brokers.iter().map(|b| b.id).collect()
    }

    pub fn alive_brokers(&self) -> Vec<BrokerId> {
        self.inner
            .brokers
            .iter()
            .filter(|b| b.alive.load(Ordering::SeqCst))
            .map(|b| b.id)
            .collect()
    }

    /// Broker currently coordinating a group, as elections stand.
    pub fn coordinator_for(&self, group_id: &str) -> Option<BrokerId> {
        self.inner.coordinator_of(group_id)
    }

    /// Appends records to a partition log, returning the base offset.
    pub fn produce(&self, topic: &str, partition: PartitionId, values: Vec<Bytes>) -> Result<i64> {
        let tp = TopicPartition::new(topic, partition);
        let entry = self
            .inner
            .logs
            .get(&tp)
            .ok_or_else(|| Error::UnknownTopic(topic.to_string()))?;
        let mut log = entry.write()?;
        let base = log.len() as i64;
        for (i, value) in values.into_iter().enumerate() {
            log.push(Record {
                offset: base + i as i64,
                key: None,
                value,
                timestamp: now_ms(),
            });
        }
        Ok(base)
    }

    /// Kills a broker: its coordinator state and offset replica are gone
    /// and every request to it fails until restart.
    pub fn kill(&self, broker: BrokerId) -> Result<()> {
        let state = self.inner.broker(broker)?;
        state.alive.store(false, Ordering::SeqCst);
        state.groups.lock()?.clear();
        state.offsets.clear()?;
        info!("broker {broker} killed");
        Ok(())
    }

    /// Restarts a broker, rebuilding its offset replica by replaying the
    /// internal offsets topic before it serves requests again.
    pub fn restart(&self, broker: BrokerId) -> Result<()> {
        let state = self.inner.broker(broker)?;
        state.offsets.clear()?;
        let partitions = self
            .inner
            .topics
            .get(GROUP_METADATA_TOPIC_NAME)
            .map(|e| *e.value())
            .unwrap_or(0);
        for partition in 0..partitions {
            let tp = TopicPartition::new(GROUP_METADATA_TOPIC_NAME, partition);
            if let Some(entry) = self.inner.logs.get(&tp) {
                for record in entry.read()?.iter() {
                    if let Some(commit) = CommitRecord::decode(&record.value) {
                        state.offsets.apply(&commit)?;
                    }
                }
            }
        }
        state.alive.store(true, Ordering::SeqCst);
        info!("broker {broker} restarted");
        Ok(())
    }
}

impl Transport for InProcessCluster {
    fn send(&self, broker: BrokerId, request: Request) -> BoxFuture<'_, Result<Response>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            if !inner.is_alive(broker) {
                return Err(Error::BrokerUnreachable(broker));
            }
            inner.handle(broker, request)
        })
    }
}

impl ClusterInner {
    fn broker(&self, id: BrokerId) -> Result<&BrokerState> {
        self.brokers
            .get(id as usize)
            .ok_or(Error::BrokerUnreachable(id))
    }

    fn is_alive(&self, id: BrokerId) -> bool {
        self.brokers
            .get(id as usize)
            .map(|b| b.alive.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Leader of a partition: the first alive broker scanning from the
    /// partition's preferred broker. Moves deterministically on failure.
    fn leader_of(&self, tp: &TopicPartition) -> Option<BrokerId> {
        if !self.topics.contains_key(&tp.topic) {
            return None;
        }
        let n = self.brokers.len() as i32;
        let preferred = tp.partition.rem_euclid(n);
        (0..n)
            .map(|i| (preferred + i) % n)
            .find(|id| self.is_alive(*id))
    }

    fn offsets_partition_for(&self, group_id: &str) -> TopicPartition {
        let mut hasher = DefaultHasher::new();
        group_id.hash(&mut hasher);
        let count = self
            .topics
            .get(GROUP_METADATA_TOPIC_NAME)
            .map(|e| *e.value())
            .unwrap_or(1)
            .max(1);
        TopicPartition::new(GROUP_METADATA_TOPIC_NAME, (hasher.finish() % count as u64) as i32)
    }

    /// A group is coordinated by the leader of its offsets partition, so
    /// coordination fails over exactly when that leadership moves.
    fn coordinator_of(&self, group_id: &str) -> Option<BrokerId> {
        self.leader_of(&self.offsets_partition_for(group_id))
    }

    fn partition_counts(&self, topics: &[String]) -> HashMap<String, i32> {
        topics
            .iter()
            .filter_map(|t| self.topics.get(t).map(|e| (t.clone(), *e.value())))
            .collect()
    }

    fn handle(&self, broker: BrokerId, request: Request) -> Result<Response> {
        match request {
            Request::Metadata { topics } => self.handle_metadata(topics),
            Request::FindCoordinator { group_id } => self
                .coordinator_of(&group_id)
                .map(|coordinator| Response::FindCoordinator { coordinator })
                .ok_or(Error::CoordinatorUnavailable),
            Request::JoinGroup {
                group_id,
                member_id,
                topics,
                session_timeout,
            } => {
                let (member_id, generation) =
                    self.with_group(broker, &group_id, true, |group| {
                        let mut interested = group.subscribed_topics();
                        interested.extend(topics.iter().cloned());
                        interested.sort();
                        interested.dedup();
                        let partitions_per_topic = self.partition_counts(&interested);
                        group.join(
                            &member_id,
                            topics,
                            session_timeout,
                            Instant::now(),
                            &partitions_per_topic,
                        )
                    })?;
                Ok(Response::JoinGroup {
                    member_id,
                    generation,
                })
            }
            Request::SyncGroup {
                group_id,
                member_id,
                generation,
            } => {
                let assignment = self.with_group(broker, &group_id, false, |group| {
                    group.sync(&member_id, generation, Instant::now())
                })?;
                Ok(Response::SyncGroup { assignment })
            }
            Request::Heartbeat {
                group_id,
                member_id,
                generation,
            } => {
                self.with_group(broker, &group_id, false, |group| {
                    group.heartbeat(&member_id, generation, Instant::now())
                })?;
                Ok(Response::Heartbeat)
            }
            Request::LeaveGroup {
                group_id,
                member_id,
            } => {
                self.with_group(broker, &group_id, false, |group| {
                    group.leave(&member_id);
                    Ok(())
                })?;
                Ok(Response::LeaveGroup)
            }
            Request::OffsetCommit {
                group_id,
                member_id,
                generation,
                offsets,
            } => {
                self.with_group(broker, &group_id, false, |group| {
                    group.validate_commit(&member_id, generation, Instant::now())
                })?;
                for (partition, offset) in offsets {
                    let record = CommitRecord {
                        group_id: group_id.clone(),
                        partition,
                        offset,
                        generation,
                    };
                    self.append_commit(&record)?;
                }
                Ok(Response::OffsetCommit)
            }
            Request::OffsetFetch {
                group_id,
                partitions,
            } => {
                let coordinator = self.coordinator_of(&group_id);
                if coordinator != Some(broker) {
                    return Err(Error::NotCoordinator { coordinator });
                }
                let state = self.broker(broker)?;
                let mut offsets = HashMap::with_capacity(partitions.len());
                for tp in partitions {
                    let committed = state.offsets.committed(&group_id, &tp)?;
                    offsets.insert(tp, committed);
                }
                Ok(Response::OffsetFetch { offsets })
            }
            Request::ListOffsets { partitions } => {
                let mut offsets = HashMap::with_capacity(partitions.len());
                for (tp, at) in partitions {
                    if self.leader_of(&tp) != Some(broker) {
                        return Err(Error::NotLeader(tp));
                    }
                    let entry = self
                        .logs
                        .get(&tp)
                        .ok_or_else(|| Error::UnknownTopic(tp.topic.clone()))?;
                    let log = entry.read()?;
                    let offset = match at {
                        ListOffset::Earliest => 0,
                        ListOffset::Latest => log.len() as i64,
                    };
                    drop(log);
                    offsets.insert(tp, offset);
                }
                Ok(Response::ListOffsets { offsets })
            }
            Request::Fetch { partitions } => {
                let mut out = Vec::with_capacity(partitions.len());
                for fp in partitions {
                    out.push(self.fetch_partition(broker, fp)?);
                }
                Ok(Response::Fetch { partitions: out })
            }
        }
    }

    fn handle_metadata(&self, topics: Option<Vec<String>>) -> Result<Response> {
        let names: Vec<String> = topics
            .unwrap_or_else(|| self.topics.iter().map(|e| e.key().clone()).collect());
        let mut out = HashMap::new();
        for name in names {
            // Unknown topics are simply omitted, never an error.
            let Some(count) = self.topics.get(&name).map(|e| *e.value()) else {
                continue;
            };
            let mut infos = Vec::with_capacity(count as usize);
            for partition in 0..count {
                if let Some(leader) = self.leader_of(&TopicPartition::new(name.clone(), partition))
                {
                    infos.push(PartitionInfo { partition, leader });
                }
            }
            out.insert(name, infos);
        }
        Ok(Response::Metadata { topics: out })
    }

    fn fetch_partition(
        &self,
        broker: BrokerId,
        fp: crate::transport::FetchPartition,
    ) -> Result<PartitionData> {
        let tp = fp.partition;
        let Some(entry) = self.logs.get(&tp) else {
            return Ok(partition_error(tp, FetchErrorCode::UnknownTopicOrPartition));
        };
        if self.leader_of(&tp) != Some(broker) {
            return Ok(partition_error(tp, FetchErrorCode::NotLeader));
        }
        let log = entry.read()?;
        let end = log.len() as i64;
        if fp.fetch_offset < 0 || fp.fetch_offset > end {
            debug!(
                "fetch offset {} out of range for {tp} (end {end})",
                fp.fetch_offset
            );
            return Ok(partition_error(tp, FetchErrorCode::OffsetOutOfRange));
        }
        let mut records = Vec::new();
        let mut bytes = 0usize;
        for record in log[fp.fetch_offset as usize..].iter() {
            let size = record.value.len() + record.key.as_ref().map(|k| k.len()).unwrap_or(0);
            // Always make progress: the first record goes out even if it
            // alone exceeds max_bytes.
            if !records.is_empty() && bytes + size > fp.max_bytes as usize {
                break;
            }
            bytes += size;
            records.push(record.clone());
        }
        Ok(PartitionData {
            partition: tp,
            records,
            high_watermark: end,
            log_start_offset: 0,
            error: None,
        })
    }

    fn with_group<R>(
        &self,
        broker: BrokerId,
        group_id: &str,
        create_if_missing: bool,
        f: impl FnOnce(&mut GroupState) -> Result<R>,
    ) -> Result<R> {
        let coordinator = self.coordinator_of(group_id);
        if coordinator != Some(broker) {
            return Err(Error::NotCoordinator { coordinator });
        }
        let state = self.broker(broker)?;
        let mut groups = state.groups.lock()?;
        let group = match groups.entry(group_id.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                if !create_if_missing {
                    return Err(Error::UnknownMember);
                }
                let floor = state.offsets.generation(group_id)?;
                entry.insert(GroupState::new(floor))
            }
        };
        let expired = group.expire_members(Instant::now());
        if !expired.is_empty() {
            debug!("evicted {} member(s) from group {group_id}", expired.len());
        }
        f(group)
    }

    /// Appends a commit to the internal offsets topic and applies it to
    /// every alive replica, so any broker elected coordinator later serves
    /// identical committed offsets.
    fn append_commit(&self, record: &CommitRecord) -> Result<()> {
        let tp = self.offsets_partition_for(&record.group_id);
        if let Some(entry) = self.logs.get(&tp) {
            let mut log = entry.write()?;
            let offset = log.len() as i64;
            log.push(Record {
                offset,
                key: None,
                value: record.encode(),
                timestamp: now_ms(),
            });
        }
        for broker in &self.brokers {
            if broker.alive.load(Ordering::SeqCst) {
                broker.offsets.apply(record)?;
            }
        }
        Ok(())
    }
}

fn partition_error(partition: TopicPartition, error: FetchErrorCode) -> PartitionData {
    PartitionData {
        partition,
        records: Vec::new(),
        high_watermark: -1,
        log_start_offset: -1,
        error: Some(error),
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dead_broker_is_unreachable() {
        let cluster = InProcessCluster::start(2);
        cluster.kill(0).unwrap();
        let err = cluster
            .send(0, Request::Metadata { topics: None })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BrokerUnreachable(0)));
    }

    #[tokio::test]
    async fn coordinator_moves_when_its_broker_dies() {
        let cluster = InProcessCluster::start(3);
        let before = cluster.coordinator_for("g").unwrap();
        cluster.kill(before).unwrap();
        let after = cluster.coordinator_for("g").unwrap();
        assert_ne!(before, after);
        cluster.restart(before).unwrap();
        assert_eq!(cluster.coordinator_for("g"), Some(before));
    }

    #[tokio::test]
    async fn metadata_omits_unknown_topics() {
        let cluster = InProcessCluster::start(1);
        cluster.create_topic("known", 2);
        let response = cluster
            .send(
                0,
                Request::Metadata {
                    topics: Some(vec!["known".into(), "missing".into()]),
                },
            )
            .await
            .unwrap();
        match response {
            Response::Metadata { topics } => {
                assert_eq!(topics["known"].len(), 2);
                assert!(!topics.contains_key("missing"));
            }
            other => panic!("unexpected response {other:?}"),
        }
    }

    #[tokio::test]
    async fn fetch_respects_max_bytes_per_partition() {
        let cluster = InProcessCluster::start(1);
        cluster.create_topic("t", 1);
        cluster
            .produce("t", 0, vec![Bytes::from(vec![0u8; 64]); 4])
            .unwrap();

        let response = cluster
            .send(
                0,
                Request::Fetch {
                    partitions: vec![crate::transport::FetchPartition {
                        partition: TopicPartition::new("t", 0),
                        fetch_offset: 0,
                        max_bytes: 128,
                    }],
                },
            )
            .await
            .unwrap();
        match response {
            Response::Fetch { partitions } => {
                assert_eq!(partitions[0].records.len(), 2);
                assert_eq!(partitions[0].high_watermark, 4);
            }
            other => panic!("unexpected response {other:?}"),
        }
    }
}
