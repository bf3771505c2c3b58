pub mod assignor;
pub mod broker;
pub mod client;
pub mod consumer;

mod error;
pub use error::{Error, Result};
pub mod metadata;
pub mod transport;

pub use consumer::{
    CommitMode, ConsumerConfig, ConsumerRecord, ConsumerSession, OffsetResetStrategy,
    RebalanceListener, SessionState,
};
pub use transport::{Record, Request, Response, Transport};

pub type BrokerId = i32;
pub type PartitionId = i32;
pub type MemberId = String;

/// Generation id a member carries before it completes its first rebalance.
pub const NO_GENERATION: i32 = -1;
