use std::{collections::HashMap, fmt};

use dashmap::DashMap;

use crate::{BrokerId, PartitionId};

/// Internal topic backing the offset store. Committed offsets are appended
/// here and the leader of a group's offsets partition coordinates the group.
pub const GROUP_METADATA_TOPIC_NAME: &str = "__group_offsets";

/// (topic, partition) key used throughout the crate.
#[derive(Debug, Clone, Default, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: PartitionId,
}

impl TopicPartition {
    pub fn new<S: Into<String>>(topic: S, partition: PartitionId) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct PartitionInfo {
    pub partition: PartitionId,
    pub leader: BrokerId,
}

/// Client-side cache of topic layout and partition leadership, refreshed
/// from metadata responses and invalidated when a leader turns out to be
/// wrong or unreachable.
#[derive(Debug, Default)]
pub struct Cluster {
    topics: DashMap<String, Vec<PartitionInfo>>,
}

impl Cluster {
    pub fn empty() -> Cluster {
        Default::default()
    }

    pub fn merge(&self, topics: HashMap<String, Vec<PartitionInfo>>) {
        for (topic, partitions) in topics {
            self.topics.insert(topic, partitions);
        }
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.topics.contains_key(topic)
    }

    /// Ordered partition list for a topic, or `None` when the topic is not
    /// known. Unknown topics are never an error at this layer.
    pub fn partitions_for(&self, topic: &str) -> Option<Vec<PartitionInfo>> {
        self.topics.get(topic).map(|entry| {
            let mut partitions = entry.value().clone();
            partitions.sort_by_key(|p| p.partition);
            partitions
        })
    }

    pub fn leader(&self, tp: &TopicPartition) -> Option<BrokerId> {
        self.topics.get(&tp.topic).and_then(|entry| {
            entry
                .value()
                .iter()
                .find(|p| p.partition == tp.partition)
                .map(|p| p.leader)
        })
    }

    pub fn invalidate(&self, topic: &str) {
        self.topics.remove(topic);
    }

    pub fn clear(&self) {
        self.topics.clear();
    }
}
