use std::{collections::HashMap, time::Duration};

use bytes::Bytes;
use futures::future::BoxFuture;

use crate::{
    metadata::{PartitionInfo, TopicPartition},
    BrokerId, MemberId, Result,
};

/// A record at a position in a partition's append-only log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub offset: i64,
    pub key: Option<Bytes>,
    pub value: Bytes,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListOffset {
    Earliest,
    Latest,
}

#[derive(Debug, Clone)]
pub struct FetchPartition {
    pub partition: TopicPartition,
    pub fetch_offset: i64,
    pub max_bytes: i32,
}

/// Per-partition fetch outcome. A partition-level problem is reported here
/// so one bad partition does not fail the whole response.
#[derive(Debug, Clone)]
pub struct PartitionData {
    pub partition: TopicPartition,
    pub records: Vec<Record>,
    pub high_watermark: i64,
    pub log_start_offset: i64,
    pub error: Option<FetchErrorCode>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorCode {
    NotLeader,
    OffsetOutOfRange,
    UnknownTopicOrPartition,
}

#[derive(Debug, Clone)]
pub enum Request {
    Metadata {
        topics: Option<Vec<String>>,
    },
    FindCoordinator {
        group_id: String,
    },
    JoinGroup {
        group_id: String,
        member_id: MemberId,
        topics: Vec<String>,
        session_timeout: Duration,
    },
    SyncGroup {
        group_id: String,
        member_id: MemberId,
        generation: i32,
    },
    Heartbeat {
        group_id: String,
        member_id: MemberId,
        generation: i32,
    },
    LeaveGroup {
        group_id: String,
        member_id: MemberId,
    },
    OffsetCommit {
        group_id: String,
        member_id: MemberId,
        generation: i32,
        offsets: HashMap<TopicPartition, i64>,
    },
    OffsetFetch {
        group_id: String,
        partitions: Vec<TopicPartition>,
    },
    ListOffsets {
        partitions: Vec<(TopicPartition, ListOffset)>,
    },
    Fetch {
        partitions: Vec<FetchPartition>,
    },
}

#[derive(Debug, Clone)]
pub enum Response {
    Metadata {
        topics: HashMap<String, Vec<PartitionInfo>>,
    },
    FindCoordinator {
        coordinator: BrokerId,
    },
    JoinGroup {
        member_id: MemberId,
        generation: i32,
    },
    SyncGroup {
        assignment: Vec<TopicPartition>,
    },
    Heartbeat,
    LeaveGroup,
    OffsetCommit,
    OffsetFetch {
        /// `None` for a partition nothing was ever committed for.
        offsets: HashMap<TopicPartition, Option<i64>>,
    },
    ListOffsets {
        offsets: HashMap<TopicPartition, i64>,
    },
    Fetch {
        partitions: Vec<PartitionData>,
    },
}

/// Request/response access to a broker. The core treats any transport
/// failure as "broker unreachable"; it never crashes on one.
pub trait Transport: Send + Sync + 'static {
    fn send(&self, broker: BrokerId, request: Request) -> BoxFuture<'_, Result<Response>>;
}
