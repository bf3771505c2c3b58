use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use bytes::Bytes;
use rand::{rngs::StdRng, Rng, SeedableRng};

use flockq::{
    broker::InProcessCluster,
    client::Client,
    metadata::TopicPartition,
    BrokerId, CommitMode, ConsumerConfig, ConsumerRecord, ConsumerSession, Error,
    RebalanceListener, SessionState,
};

type Session = ConsumerSession<InProcessCluster>;

fn client(cluster: &InProcessCluster) -> Client<InProcessCluster> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    Client::new(Arc::new(cluster.clone()), cluster.broker_ids())
}

fn config(group: &str) -> ConsumerConfig {
    let mut config = ConsumerConfig::new(group);
    config.heartbeat_interval = Duration::from_millis(50);
    config.retry.backoff = Duration::from_millis(10);
    config
}

fn session(cluster: &InProcessCluster, group: &str) -> Session {
    ConsumerSession::new(client(cluster), config(group))
}

fn produce(cluster: &InProcessCluster, topic: &str, partition: i32, count: usize) {
    let payloads: Vec<Bytes> = (0..count)
        .map(|i| Bytes::from(format!("{topic}-{partition}-{i}")))
        .collect();
    cluster.produce(topic, partition, payloads).unwrap();
}

async fn consume(session: &mut Session, want: usize) -> Vec<ConsumerRecord> {
    let mut out = Vec::new();
    for _ in 0..200 {
        out.extend(session.poll(Duration::from_millis(100)).await.unwrap());
        if out.len() >= want {
            break;
        }
    }
    out
}

async fn wait_for_assignment(session: &mut Session) -> Vec<ConsumerRecord> {
    let mut seen = Vec::new();
    for _ in 0..100 {
        seen.extend(session.poll(Duration::from_millis(100)).await.unwrap());
        if !session.assignment().is_empty() {
            break;
        }
    }
    assert!(!session.assignment().is_empty(), "never got an assignment");
    seen
}

#[derive(Default)]
struct RebalanceCounts {
    revoked: usize,
    assigned: usize,
}

struct CountingListener {
    counts: Arc<Mutex<RebalanceCounts>>,
}

impl RebalanceListener for CountingListener {
    fn on_partitions_revoked(&mut self, _partitions: &[TopicPartition]) {
        self.counts.lock().unwrap().revoked += 1;
    }

    fn on_partitions_assigned(&mut self, _partitions: &[TopicPartition]) {
        self.counts.lock().unwrap().assigned += 1;
    }
}

#[tokio::test]
async fn records_arrive_in_order_without_gaps() {
    let cluster = InProcessCluster::start(1);
    cluster.create_topic("orders", 1);
    produce(&cluster, "orders", 0, 25);

    let mut consumer = session(&cluster, "g-order");
    consumer.subscribe(vec!["orders".to_string()]).unwrap();

    let records = consume(&mut consumer, 25).await;
    assert_eq!(records.len(), 25);
    for (i, record) in records.iter().enumerate() {
        assert_eq!(record.offset, i as i64);
        assert_eq!(record.value, Bytes::from(format!("orders-0-{i}")));
    }
}

#[tokio::test]
async fn seek_to_end_yields_empty_poll_and_end_position() {
    let cluster = InProcessCluster::start(1);
    cluster.create_topic("events", 1);
    produce(&cluster, "events", 0, 10);

    let mut consumer = session(&cluster, "g-seek");
    consumer.subscribe(vec!["events".to_string()]).unwrap();
    wait_for_assignment(&mut consumer).await;

    let tp = TopicPartition::new("events", 0);
    consumer.seek_to_end(vec![tp.clone()]).await.unwrap();
    assert_eq!(consumer.position(&tp).unwrap(), 10);

    let records = consumer.poll(Duration::from_millis(200)).await.unwrap();
    assert!(records.is_empty());
}

#[tokio::test]
async fn committed_distinguishes_never_committed_from_committed() {
    let cluster = InProcessCluster::start(1);
    cluster.create_topic("audit", 1);
    produce(&cluster, "audit", 0, 5);
    let tp = TopicPartition::new("audit", 0);

    let mut consumer = session(&cluster, "g-commit");
    assert!(matches!(
        consumer.committed(&tp).await,
        Err(Error::NoOffsetForPartition(_))
    ));

    consumer.subscribe(vec!["audit".to_string()]).unwrap();
    let records = consume(&mut consumer, 5).await;
    assert_eq!(records.len(), 5);
    assert_eq!(consumer.position(&tp).unwrap(), 5);

    consumer.commit(CommitMode::Sync).await.unwrap();
    assert_eq!(consumer.committed(&tp).await.unwrap(), 5);
}

#[tokio::test]
async fn second_session_resumes_from_committed_offset() {
    let cluster = InProcessCluster::start(1);
    cluster.create_topic("ledger", 1);
    produce(&cluster, "ledger", 0, 10);
    let tp = TopicPartition::new("ledger", 0);

    let mut first = session(&cluster, "g-resume");
    first.subscribe(vec!["ledger".to_string()]).unwrap();
    let records = consume(&mut first, 10).await;
    assert_eq!(records.len(), 10);
    first.seek(&tp, 6).unwrap();
    first.commit(CommitMode::Sync).await.unwrap();
    first.close().await.unwrap();

    let mut second = session(&cluster, "g-resume");
    second.subscribe(vec!["ledger".to_string()]).unwrap();
    let records = consume(&mut second, 4).await;
    let offsets: Vec<i64> = records.iter().map(|r| r.offset).collect();
    assert_eq!(offsets, vec![6, 7, 8, 9]);
}

#[tokio::test]
async fn coordinator_kill_triggers_exactly_two_rebalances() {
    let cluster = InProcessCluster::start(3);
    cluster.create_topic("work", 2);

    let counts = Arc::new(Mutex::new(RebalanceCounts::default()));
    let mut a = session(&cluster, "g-kill").with_listener(Box::new(CountingListener {
        counts: counts.clone(),
    }));
    let mut b = session(&cluster, "g-kill");
    a.subscribe(vec!["work".to_string()]).unwrap();
    b.subscribe(vec!["work".to_string()]).unwrap();

    settle_pair(&mut a, &mut b).await;
    let baseline = {
        let counts = counts.lock().unwrap();
        (counts.revoked, counts.assigned)
    };

    let coordinator = cluster.coordinator_for("g-kill").unwrap();
    cluster.kill(coordinator).unwrap();

    settle_pair(&mut a, &mut b).await;
    let counts = counts.lock().unwrap();
    assert_eq!(counts.revoked - baseline.0, 2);
    assert_eq!(counts.assigned - baseline.1, 2);
}

/// Drives both sessions until the two partitions are split one each.
async fn settle_pair(a: &mut Session, b: &mut Session) {
    for _ in 0..100 {
        let _ = a.poll(Duration::from_millis(150)).await.unwrap();
        let _ = b.poll(Duration::from_millis(150)).await.unwrap();
        if a.assignment().len() == 1 && b.assignment().len() == 1 {
            return;
        }
    }
    panic!(
        "group never settled: a={:?} b={:?}",
        a.assignment(),
        b.assignment()
    );
}

#[tokio::test]
async fn poll_withholds_records_while_rebalance_is_pending() {
    let cluster = InProcessCluster::start(1);
    cluster.create_topic("jobs", 2);

    let mut a = session(&cluster, "g-pending");
    let mut b = session(&cluster, "g-pending");
    a.subscribe(vec!["jobs".to_string()]).unwrap();
    b.subscribe(vec!["jobs".to_string()]).unwrap();
    settle_pair(&mut a, &mut b).await;

    produce(&cluster, "jobs", 0, 4);
    produce(&cluster, "jobs", 1, 4);

    // A third member starts a rebalance that cannot complete while b stays
    // silent, leaving a stuck mid-rebalance with data available.
    let mut c = session(&cluster, "g-pending");
    c.subscribe(vec!["jobs".to_string()]).unwrap();
    let _ = c.poll(Duration::from_millis(50)).await.unwrap();

    tokio::time::sleep(Duration::from_millis(60)).await;
    for _ in 0..2 {
        let records = a.poll(Duration::from_millis(150)).await.unwrap();
        assert!(
            records.is_empty(),
            "records delivered after revocation, before reassignment: {records:?}"
        );
    }
    assert_eq!(a.state(), SessionState::Rebalancing);

    // Once every member rejoins the generation completes and delivery
    // resumes.
    for _ in 0..100 {
        let _ = a.poll(Duration::from_millis(100)).await.unwrap();
        let _ = b.poll(Duration::from_millis(100)).await.unwrap();
        let _ = c.poll(Duration::from_millis(100)).await.unwrap();
        if a.state() == SessionState::Assigned {
            break;
        }
    }
    assert_eq!(a.state(), SessionState::Assigned);
}

#[tokio::test]
async fn consumption_survives_random_broker_kills() {
    let cluster = InProcessCluster::start(3);
    cluster.create_topic("stream", 2);
    let per_partition = 60i64;

    let mut consumer = session(&cluster, "g-chaos");
    consumer.subscribe(vec!["stream".to_string()]).unwrap();

    let mut rng = StdRng::seed_from_u64(7);
    let mut next: HashMap<i32, i64> = HashMap::new();
    let mut downed: Option<BrokerId> = None;
    let mut produced = 0i64;

    for round in 0..400 {
        if produced < per_partition {
            for partition in 0..2 {
                let payloads = (0..2)
                    .map(|i| Bytes::from(format!("stream-{partition}-{}", produced + i)))
                    .collect();
                cluster.produce("stream", partition, payloads).unwrap();
            }
            produced += 2;
        }

        let records = consumer.poll(Duration::from_millis(100)).await.unwrap();
        for record in records {
            let expected = next.entry(record.partition).or_insert(0);
            // Redelivery after a failover is fine, skipping ahead is not.
            assert!(
                record.offset <= *expected,
                "partition {} skipped from {} to {}",
                record.partition,
                *expected,
                record.offset
            );
            if record.offset == *expected {
                *expected += 1;
            }
        }
        consumer.commit(CommitMode::Async).await.unwrap();

        if (0..2).all(|p| next.get(&p) == Some(&per_partition)) {
            break;
        }

        if round % 7 == 3 {
            match downed.take() {
                Some(broker) => cluster.restart(broker).unwrap(),
                None => {
                    let alive = cluster.alive_brokers();
                    let victim = alive[rng.gen_range(0..alive.len())];
                    cluster.kill(victim).unwrap();
                    downed = Some(victim);
                }
            }
        }
    }

    if let Some(broker) = downed {
        cluster.restart(broker).unwrap();
    }
    for partition in 0..2 {
        assert_eq!(
            next.get(&partition),
            Some(&per_partition),
            "partition {partition} never fully consumed"
        );
    }
}

#[tokio::test]
async fn partitions_for_unknown_topic_is_none() {
    let cluster = InProcessCluster::start(1);
    cluster.create_topic("known", 3);

    let consumer = session(&cluster, "g-meta");
    assert_eq!(
        consumer.partitions_for("known").await.unwrap(),
        Some(vec![0, 1, 2])
    );
    assert_eq!(consumer.partitions_for("missing").await.unwrap(), None);
}

#[tokio::test]
async fn session_lifecycle_is_enforced() {
    let cluster = InProcessCluster::start(1);
    cluster.create_topic("t", 1);

    let mut consumer = session(&cluster, "g-state");
    assert_eq!(consumer.state(), SessionState::Unsubscribed);
    assert!(matches!(
        consumer.poll(Duration::from_millis(10)).await,
        Err(Error::InvalidSessionState(_))
    ));

    consumer.subscribe(vec!["t".to_string()]).unwrap();
    assert_eq!(consumer.state(), SessionState::Subscribed);
    wait_for_assignment(&mut consumer).await;
    assert_eq!(consumer.state(), SessionState::Assigned);
    consumer.close().await.unwrap();
    assert_eq!(consumer.state(), SessionState::Closed);

    assert!(matches!(
        consumer.poll(Duration::from_millis(10)).await,
        Err(Error::InvalidSessionState(_))
    ));
    assert!(matches!(
        consumer.subscribe(vec!["t".to_string()]),
        Err(Error::InvalidSessionState(_))
    ));
    assert!(matches!(
        consumer.commit(CommitMode::Sync).await,
        Err(Error::InvalidSessionState(_))
    ));
}

#[tokio::test]
async fn standalone_assignment_reads_without_group_membership() {
    let cluster = InProcessCluster::start(1);
    cluster.create_topic("pinned", 2);
    produce(&cluster, "pinned", 1, 3);

    let mut consumer = session(&cluster, "g-standalone");
    consumer
        .assign(vec![TopicPartition::new("pinned", 1)])
        .unwrap();

    let records = consume(&mut consumer, 3).await;
    let offsets: Vec<i64> = records.iter().map(|r| r.offset).collect();
    assert_eq!(offsets, vec![0, 1, 2]);
    assert!(records.iter().all(|r| r.partition == 1));

    assert!(matches!(
        consumer.commit(CommitMode::Sync).await,
        Err(Error::InvalidSessionState(_))
    ));
}
