use std::{cmp::min, collections::HashMap};

use indexmap::IndexMap;
use tracing::debug;

use crate::{metadata::TopicPartition, MemberId};

/// Computes one generation's partition assignment from the member set and
/// the partition counts of the subscribed topics. Implementations must be
/// deterministic: the same inputs always produce the same assignment, and
/// every partition of a subscribed topic lands on exactly one member.
pub trait PartitionAssigner {
    fn name(&self) -> &'static str;

    fn member_assignments(
        &self,
        partitions_per_topic: &HashMap<String, i32>,
        subscriptions: &IndexMap<MemberId, Vec<String>>,
    ) -> HashMap<MemberId, Vec<TopicPartition>>;
}

/// The range assignor works on a per-topic basis. For each topic the
/// partitions are laid out in numeric order and the subscribed members in
/// lexicographic order, then partitions are divided evenly; when the count
/// does not divide evenly the first few members get one extra partition.
///
/// For two members C0 and C1 and a topic with 3 partitions the assignment
/// is C0: [p0, p1], C1: [p2].
#[derive(Debug, Clone, Default)]
pub struct RangeAssignor;

impl RangeAssignor {
    fn members_per_topic<'a>(
        &self,
        subscriptions: &'a IndexMap<MemberId, Vec<String>>,
    ) -> HashMap<&'a str, Vec<&'a MemberId>> {
        let mut topic_to_members: HashMap<&str, Vec<&MemberId>> = HashMap::new();
        for (member_id, topics) in subscriptions {
            for topic in topics {
                topic_to_members.entry(topic).or_default().push(member_id);
            }
        }
        topic_to_members
    }
}

impl PartitionAssigner for RangeAssignor {
    fn name(&self) -> &'static str {
        "range"
    }

    fn member_assignments(
        &self,
        partitions_per_topic: &HashMap<String, i32>,
        subscriptions: &IndexMap<MemberId, Vec<String>>,
    ) -> HashMap<MemberId, Vec<TopicPartition>> {
        let mut assignment: HashMap<MemberId, Vec<TopicPartition>> = HashMap::new();
        for member_id in subscriptions.keys() {
            assignment.insert(member_id.clone(), Vec::new());
        }

        for (topic, mut members) in self.members_per_topic(subscriptions) {
            let num_partitions = *partitions_per_topic.get(topic).unwrap_or(&0);
            if num_partitions == 0 {
                debug!("skipping assignment for topic {topic}, no metadata available");
                continue;
            }
            members.sort();
            let num_members = members.len() as i32;
            let per_member = num_partitions / num_members;
            let with_extra = num_partitions % num_members;

            for (i, member) in members.iter().enumerate() {
                let i = i as i32;
                let start = per_member * i + min(i, with_extra);
                let length = per_member + if i + 1 > with_extra { 0 } else { 1 };
                if let Some(assigned) = assignment.get_mut(*member) {
                    for partition in start..start + length {
                        assigned.push(TopicPartition::new(topic, partition));
                    }
                }
            }
        }
        assignment
    }
}
