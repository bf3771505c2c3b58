use std::collections::{HashMap, VecDeque};

use futures::future::join_all;
use tracing::{debug, warn};

use crate::{
    client::Client,
    consumer::{
        subscription_state::{OffsetResetStrategy, SubscriptionState},
        ConsumerRecord,
    },
    error::{Error, Result},
    transport::{FetchPartition, ListOffset, PartitionData, Transport},
    BrokerId,
};

/// Buffered response data together with the position it was fetched at.
/// The position is re-checked on drain; a seek in between invalidates it.
struct CompletedFetch {
    fetch_offset: i64,
    data: PartitionData,
}

/// Pulls records for every fetchable partition, buffers the responses and
/// drains them into application records in offset order. Also owns offset
/// reset resolution for partitions without a usable position.
pub struct Fetcher<T: Transport> {
    client: Client<T>,
    max_partition_bytes: i32,
    /// Consecutive failed round trips tolerated per broker before the
    /// failure stops being treated as transient.
    max_failures: u32,
    failures: HashMap<BrokerId, u32>,
    completed_fetches: VecDeque<CompletedFetch>,
}

impl<T: Transport> Fetcher<T> {
    pub fn new(client: Client<T>, max_partition_bytes: i32, max_failures: u32) -> Self {
        Self {
            client,
            max_partition_bytes,
            max_failures,
            failures: HashMap::new(),
            completed_fetches: VecDeque::new(),
        }
    }

    /// Resolves positions for partitions awaiting a reset by querying the
    /// log's earliest or latest offset from the partition leader. A
    /// partition whose strategy is `None` is an error by definition.
    pub async fn reset_offsets(&mut self, subscriptions: &mut SubscriptionState) -> Result<()> {
        for (tp, strategy) in subscriptions.partitions_needing_reset() {
            let at = match strategy {
                OffsetResetStrategy::Earliest => ListOffset::Earliest,
                OffsetResetStrategy::Latest => ListOffset::Latest,
                OffsetResetStrategy::None => return Err(Error::UnresolvedOffset(tp)),
            };
            let Some(leader) = self.client.leader(&tp).await? else {
                debug!("no leader known for {tp}, deferring offset reset");
                continue;
            };
            match self.client.list_offsets(leader, vec![(tp.clone(), at)]).await {
                Ok(offsets) => {
                    if let Some(offset) = offsets.get(&tp) {
                        debug!("resetting {tp} to offset {offset} ({strategy:?})");
                        subscriptions.seek(&tp, *offset)?;
                    }
                }
                Err(e) if e.is_retryable() => {
                    debug!("offset reset for {tp} failed transiently: {e}");
                    self.client.cluster.invalidate(&tp.topic);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Sends one round of fetches, one request per partition leader, all in
    /// flight concurrently. Successful partition data is buffered for
    /// [`Fetcher::drain`]; partition-level errors adjust state instead of
    /// failing the poll.
    pub async fn fetch(&mut self, subscriptions: &mut SubscriptionState) -> Result<()> {
        let mut by_leader: HashMap<BrokerId, Vec<FetchPartition>> = HashMap::new();
        for (tp, fetch_offset) in subscriptions.fetchable_partitions() {
            let Some(leader) = self.client.leader(&tp).await? else {
                debug!("no leader known for {tp}, skipping this fetch round");
                continue;
            };
            by_leader.entry(leader).or_default().push(FetchPartition {
                partition: tp,
                fetch_offset,
                max_bytes: self.max_partition_bytes,
            });
        }
        if by_leader.is_empty() {
            return Ok(());
        }

        let requests: Vec<(BrokerId, Vec<FetchPartition>)> = by_leader.into_iter().collect();
        let results = {
            let client = &self.client;
            join_all(requests.iter().map(|(leader, partitions)| async move {
                (*leader, partitions.clone(), client.fetch(*leader, partitions.clone()).await)
            }))
            .await
        };

        for (leader, partitions, result) in results {
            match result {
                Ok(data) => {
                    self.failures.remove(&leader);
                    for pd in data {
                        let Some(fetch_offset) = partitions
                            .iter()
                            .find(|fp| fp.partition == pd.partition)
                            .map(|fp| fp.fetch_offset)
                        else {
                            continue;
                        };
                        self.complete_fetch(subscriptions, pd, fetch_offset)?;
                    }
                }
                Err(e) if e.is_retryable() => {
                    let count = self.failures.entry(leader).or_insert(0);
                    *count += 1;
                    warn!("fetch from broker {leader} failed ({count}): {e}");
                    for fp in &partitions {
                        self.client.cluster.invalidate(&fp.partition.topic);
                    }
                    if *count > self.max_failures {
                        self.failures.remove(&leader);
                        return Err(e);
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn complete_fetch(
        &mut self,
        subscriptions: &mut SubscriptionState,
        pd: PartitionData,
        fetch_offset: i64,
    ) -> Result<()> {
        use crate::transport::FetchErrorCode::*;
        let tp = &pd.partition;
        match pd.error {
            None => {
                subscriptions.update_watermarks(tp, pd.high_watermark, pd.log_start_offset);
                if !pd.records.is_empty() {
                    self.completed_fetches.push_back(CompletedFetch {
                        fetch_offset,
                        data: pd,
                    });
                }
            }
            Some(OffsetOutOfRange) => {
                let strategy = subscriptions.default_reset_strategy;
                debug!("fetch position for {tp} is out of range, requesting {strategy:?} reset");
                subscriptions.request_reset(tp, strategy)?;
            }
            Some(NotLeader) | Some(UnknownTopicOrPartition) => {
                debug!("stale leadership for {tp}, invalidating metadata");
                self.client.cluster.invalidate(&tp.topic);
            }
        }
        Ok(())
    }

    /// Hands buffered records to the application in offset order per
    /// partition, advancing positions as it goes. Data for partitions that
    /// were revoked or sought away from since the fetch is dropped.
    pub fn drain(&mut self, subscriptions: &mut SubscriptionState) -> Result<Vec<ConsumerRecord>> {
        let mut out = Vec::new();
        while let Some(CompletedFetch { fetch_offset, data }) = self.completed_fetches.pop_front()
        {
            let tp = data.partition;
            if !subscriptions.is_assigned(&tp) {
                debug!("dropping fetched data for revoked partition {tp}");
                continue;
            }
            let Ok(position) = subscriptions.position(&tp) else {
                continue;
            };
            // A seek between fetch and drain invalidates the whole batch;
            // delivering any of it against the moved position would skip or
            // replay offsets.
            if fetch_offset != position {
                debug!(
                    "dropping records for {tp} fetched at {fetch_offset}, position moved to {position}"
                );
                continue;
            }
            let mut next = position;
            for record in data.records {
                if record.offset < next {
                    continue;
                }
                next = record.offset + 1;
                out.push(ConsumerRecord {
                    topic: tp.topic.clone(),
                    partition: tp.partition,
                    offset: record.offset,
                    key: record.key,
                    value: record.value,
                    timestamp: record.timestamp,
                });
            }
            subscriptions.advance_position(&tp, next)?;
        }
        Ok(out)
    }

    pub fn has_buffered(&self) -> bool {
        !self.completed_fetches.is_empty()
    }

    /// Drops all buffered data, used when the assignment changes under us.
    pub fn clear_buffers(&mut self) {
        self.completed_fetches.clear();
        self.failures.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;

    use super::*;
    use crate::{broker::InProcessCluster, metadata::TopicPartition};

    fn fixture(
        records: usize,
    ) -> (
        Fetcher<InProcessCluster>,
        SubscriptionState,
        TopicPartition,
    ) {
        let cluster = InProcessCluster::start(1);
        cluster.create_topic("t", 1);
        let payloads = (0..records)
            .map(|i| Bytes::from(format!("r-{i}")))
            .collect();
        cluster.produce("t", 0, payloads).unwrap();
        let client = Client::new(Arc::new(cluster), vec![0]);
        let fetcher = Fetcher::new(client, 1024 * 1024, 2);
        let subscriptions = SubscriptionState::new(OffsetResetStrategy::Earliest);
        (fetcher, subscriptions, TopicPartition::new("t", 0))
    }

    #[tokio::test]
    async fn buffered_records_are_drained_from_the_position() {
        let (mut fetcher, mut subs, tp) = fixture(4);
        subs.assign(vec![tp.clone()]).unwrap();
        subs.seek(&tp, 0).unwrap();

        fetcher.fetch(&mut subs).await.unwrap();
        let records = fetcher.drain(&mut subs).unwrap();
        assert_eq!(records.len(), 4);
        assert_eq!(subs.position(&tp).unwrap(), 4);
        assert!(!fetcher.has_buffered());
    }

    #[tokio::test]
    async fn backward_seek_discards_buffered_records() {
        let (mut fetcher, mut subs, tp) = fixture(8);
        subs.assign(vec![tp.clone()]).unwrap();
        subs.seek(&tp, 5).unwrap();
        fetcher.fetch(&mut subs).await.unwrap();
        assert!(fetcher.has_buffered());

        // The position moves back while records fetched at offset 5 are
        // still buffered; draining those would skip offsets 2 through 4.
        subs.seek(&tp, 2).unwrap();
        assert!(fetcher.drain(&mut subs).unwrap().is_empty());
        assert_eq!(subs.position(&tp).unwrap(), 2);

        fetcher.fetch(&mut subs).await.unwrap();
        let offsets: Vec<i64> = fetcher
            .drain(&mut subs)
            .unwrap()
            .iter()
            .map(|r| r.offset)
            .collect();
        assert_eq!(offsets, vec![2, 3, 4, 5, 6, 7]);
    }
}
