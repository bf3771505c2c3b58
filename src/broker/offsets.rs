use std::{collections::HashMap, sync::RwLock};

use bytes::Bytes;

use crate::{metadata::TopicPartition, Result};

/// One entry in the append-only internal offsets topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRecord {
    pub group_id: String,
    pub partition: TopicPartition,
    pub offset: i64,
    pub generation: i32,
}

impl CommitRecord {
    pub fn encode(&self) -> Bytes {
        Bytes::from(format!(
            "{}\t{}\t{}\t{}\t{}",
            self.group_id,
            self.partition.topic,
            self.partition.partition,
            self.offset,
            self.generation
        ))
    }

    pub fn decode(value: &Bytes) -> Option<Self> {
        let text = std::str::from_utf8(value).ok()?;
        let mut fields = text.split('\t');
        let group_id = fields.next()?.to_string();
        let topic = fields.next()?.to_string();
        let partition = fields.next()?.parse().ok()?;
        let offset = fields.next()?.parse().ok()?;
        let generation = fields.next()?.parse().ok()?;
        Some(Self {
            group_id,
            partition: TopicPartition { topic, partition },
            offset,
            generation,
        })
    }
}

#[derive(Debug, Default, Clone)]
struct GroupOffsets {
    /// Highest generation ever seen in a commit for the group. A
    /// failed-over coordinator starts above this so stale members stay
    /// fenced.
    generation: i32,
    offsets: HashMap<TopicPartition, i64>,
}

/// Per-broker materialized view over the internal offsets topic. Every
/// broker holds a replica so a newly elected coordinator serves the same
/// committed offsets as the one that crashed.
#[derive(Debug, Default)]
pub struct OffsetStore {
    groups: RwLock<HashMap<String, GroupOffsets>>,
}

impl OffsetStore {
    /// Applies one offsets-topic record. Applying the same record twice has
    /// no additional effect.
    pub fn apply(&self, record: &CommitRecord) -> Result<()> {
        let mut groups = self.groups.write()?;
        let group = groups.entry(record.group_id.clone()).or_default();
        group.generation = group.generation.max(record.generation);
        group.offsets.insert(record.partition.clone(), record.offset);
        Ok(())
    }

    pub fn committed(&self, group_id: &str, tp: &TopicPartition) -> Result<Option<i64>> {
        let groups = self.groups.read()?;
        Ok(groups
            .get(group_id)
            .and_then(|group| group.offsets.get(tp).copied()))
    }

    /// Generation watermark for a group; 0 when nothing was ever committed.
    pub fn generation(&self, group_id: &str) -> Result<i32> {
        let groups = self.groups.read()?;
        Ok(groups.get(group_id).map(|g| g.generation).unwrap_or(0))
    }

    pub fn clear(&self) -> Result<()> {
        self.groups.write()?.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(offset: i64, generation: i32) -> CommitRecord {
        CommitRecord {
            group_id: "g".to_string(),
            partition: TopicPartition::new("t", 0),
            offset,
            generation,
        }
    }

    #[test]
    fn commit_record_round_trip() {
        let rec = record(42, 3);
        assert_eq!(CommitRecord::decode(&rec.encode()), Some(rec));
    }

    #[test]
    fn apply_is_idempotent() {
        let store = OffsetStore::default();
        let rec = record(7, 1);
        store.apply(&rec).unwrap();
        store.apply(&rec).unwrap();
        assert_eq!(
            store.committed("g", &TopicPartition::new("t", 0)).unwrap(),
            Some(7)
        );
        assert_eq!(store.generation("g").unwrap(), 1);
    }

    #[test]
    fn missing_entries_read_as_none() {
        let store = OffsetStore::default();
        assert_eq!(
            store.committed("g", &TopicPartition::new("t", 0)).unwrap(),
            None
        );
        assert_eq!(store.generation("g").unwrap(), 0);
    }

    #[test]
    fn generation_watermark_never_regresses() {
        let store = OffsetStore::default();
        store.apply(&record(5, 4)).unwrap();
        store.apply(&record(9, 2)).unwrap();
        assert_eq!(store.generation("g").unwrap(), 4);
        assert_eq!(
            store.committed("g", &TopicPartition::new("t", 0)).unwrap(),
            Some(9)
        );
    }
}
