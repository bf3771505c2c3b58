use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use indexmap::IndexMap;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    assignor::{PartitionAssigner, RangeAssignor},
    error::{Error, Result},
    metadata::TopicPartition,
    MemberId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GroupPhase {
    Empty,
    PreparingRebalance,
    Stable,
}

#[derive(Debug)]
struct MemberState {
    topics: Vec<String>,
    session_timeout: Duration,
    last_contact: Instant,
    rejoined: bool,
}

/// Per-group coordinator state machine. Owns membership, the generation
/// counter and the per-generation assignment; lives on the broker elected
/// coordinator for the group and is lost when that broker dies.
#[derive(Debug)]
pub(crate) struct GroupState {
    pub generation: i32,
    phase: GroupPhase,
    members: IndexMap<MemberId, MemberState>,
    assignment: HashMap<MemberId, Vec<TopicPartition>>,
}

impl GroupState {
    /// `generation_floor` is the replicated commit watermark, so that a
    /// group re-formed on a new coordinator fences members of the old one.
    pub fn new(generation_floor: i32) -> Self {
        Self {
            generation: generation_floor,
            phase: GroupPhase::Empty,
            members: IndexMap::new(),
            assignment: HashMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Registers (or re-registers) a member. Returns the member id and the
    /// completed generation, or `RebalanceInProgress` while other members
    /// still have to rejoin; joins arriving during that window are batched
    /// into the same resulting assignment. A first join with an empty id
    /// that lands mid-rebalance gets `MemberIdRequired` carrying the
    /// assigned id, so the retry re-identifies the same member instead of
    /// registering another one.
    pub fn join(
        &mut self,
        member_id: &str,
        topics: Vec<String>,
        session_timeout: Duration,
        now: Instant,
        partitions_per_topic: &HashMap<String, i32>,
    ) -> Result<(MemberId, i32)> {
        let generated = member_id.is_empty();
        let member_id = if generated {
            format!("member-{}", Uuid::new_v4())
        } else {
            member_id.to_string()
        };

        match self.members.get_mut(&member_id) {
            Some(member) => {
                member.last_contact = now;
                member.rejoined = true;
                if member.topics != topics {
                    member.topics = topics;
                    self.prepare_rebalance();
                    self.mark_rejoined(&member_id);
                }
            }
            None => {
                debug!("member {member_id} joining group");
                self.members.insert(
                    member_id.clone(),
                    MemberState {
                        topics,
                        session_timeout,
                        last_contact: now,
                        rejoined: true,
                    },
                );
                self.prepare_rebalance();
                self.mark_rejoined(&member_id);
            }
        }

        match self.phase {
            GroupPhase::Stable => Ok((member_id, self.generation)),
            _ if self.all_rejoined() => {
                self.complete_rebalance(partitions_per_topic);
                Ok((member_id, self.generation))
            }
            _ if generated => Err(Error::MemberIdRequired { member_id }),
            _ => Err(Error::RebalanceInProgress),
        }
    }

    /// Assignment subset for a member once the generation has completed.
    pub fn sync(
        &mut self,
        member_id: &str,
        generation: i32,
        now: Instant,
    ) -> Result<Vec<TopicPartition>> {
        let member = self.members.get_mut(member_id).ok_or(Error::UnknownMember)?;
        member.last_contact = now;
        match self.phase {
            GroupPhase::PreparingRebalance => Err(Error::RebalanceInProgress),
            _ if generation != self.generation => Err(Error::StaleGeneration {
                found: generation,
                current: self.generation,
            }),
            _ => Ok(self
                .assignment
                .get(member_id)
                .cloned()
                .unwrap_or_default()),
        }
    }

    pub fn heartbeat(&mut self, member_id: &str, generation: i32, now: Instant) -> Result<()> {
        let member = self.members.get_mut(member_id).ok_or(Error::UnknownMember)?;
        member.last_contact = now;
        match self.phase {
            GroupPhase::PreparingRebalance => Err(Error::RebalanceInProgress),
            _ if generation != self.generation => Err(Error::StaleGeneration {
                found: generation,
                current: self.generation,
            }),
            _ => Ok(()),
        }
    }

    pub fn leave(&mut self, member_id: &str) -> bool {
        if self.members.shift_remove(member_id).is_none() {
            return false;
        }
        info!("member {member_id} left the group");
        if self.members.is_empty() {
            self.phase = GroupPhase::Empty;
            self.assignment.clear();
        } else {
            self.prepare_rebalance();
        }
        true
    }

    /// Commits are fenced by membership and generation; a commit racing an
    /// in-flight rebalance is rejected outright rather than recorded
    /// against an assignment that is about to change.
    pub fn validate_commit(&mut self, member_id: &str, generation: i32, now: Instant) -> Result<()> {
        let member = self.members.get_mut(member_id).ok_or(Error::UnknownMember)?;
        member.last_contact = now;
        if self.phase == GroupPhase::PreparingRebalance {
            return Err(Error::StaleGeneration {
                found: generation,
                current: self.generation + 1,
            });
        }
        if generation != self.generation {
            return Err(Error::StaleGeneration {
                found: generation,
                current: self.generation,
            });
        }
        Ok(())
    }

    /// Evicts members that have not contacted the coordinator within their
    /// session timeout and starts a rebalance for the survivors. Completion
    /// happens when the survivors rejoin.
    pub fn expire_members(&mut self, now: Instant) -> Vec<MemberId> {
        let expired: Vec<MemberId> = self
            .members
            .iter()
            .filter(|(_, m)| now.saturating_duration_since(m.last_contact) > m.session_timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for member_id in &expired {
            info!("member {member_id} timed out, releasing its partitions");
            self.members.shift_remove(member_id);
        }
        if !expired.is_empty() {
            if self.members.is_empty() {
                self.phase = GroupPhase::Empty;
                self.assignment.clear();
            } else {
                self.prepare_rebalance();
            }
        }
        expired
    }

    /// Topics any current member subscribes to.
    pub fn subscribed_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self
            .members
            .values()
            .flat_map(|m| m.topics.iter().cloned())
            .collect();
        topics.sort();
        topics.dedup();
        topics
    }

    fn prepare_rebalance(&mut self) {
        if self.phase != GroupPhase::PreparingRebalance {
            debug!("preparing rebalance at generation {}", self.generation);
            self.phase = GroupPhase::PreparingRebalance;
            for member in self.members.values_mut() {
                member.rejoined = false;
            }
        }
    }

    fn mark_rejoined(&mut self, member_id: &str) {
        if let Some(member) = self.members.get_mut(member_id) {
            member.rejoined = true;
        }
    }

    fn all_rejoined(&self) -> bool {
        self.members.values().all(|m| m.rejoined)
    }

    fn complete_rebalance(&mut self, partitions_per_topic: &HashMap<String, i32>) {
        self.generation += 1;
        self.members.sort_keys();
        let subscriptions: IndexMap<MemberId, Vec<String>> = self
            .members
            .iter()
            .map(|(id, m)| (id.clone(), m.topics.clone()))
            .collect();
        self.assignment = RangeAssignor.member_assignments(partitions_per_topic, &subscriptions);
        self.phase = GroupPhase::Stable;
        info!(
            "rebalance complete, generation {} with {} member(s)",
            self.generation,
            self.members.len()
        );
    }
}
