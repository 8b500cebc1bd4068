//! Update deltas exchanged between replicas.
//!
//! An [`Update`] is an immutable batch of operations. Inserts travel as runs:
//! a run starting at `Id { replica, clock }` with `n` characters assigns the
//! ids `clock..clock + n` to its characters, and every character after the
//! first uses its predecessor in the run as origin. Deletes travel as
//! contiguous id ranges of a single replica.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

use super::ReplicaId;

/// Upper bound for the number of ids covered by a single insert run or delete
/// range.
pub const MAX_RUN_LEN: u64 = 1 << 24;

/// Highest clock value a remote operation may use. Everything above is left
/// to local edits, so merging a remote update can never exhaust the clock.
pub const MAX_CLOCK: u64 = u64::MAX / 2;

/// Globally unique character identifier.
///
/// Ids are totally ordered by `(clock, replica)`. Concurrent characters that
/// share an origin are placed in descending id order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Id {
    pub replica: ReplicaId,
    pub clock: u64,
}

impl Id {
    pub fn new(replica: ReplicaId, clock: u64) -> Self {
        Self { replica, clock }
    }

    /// Id of the `offset`-th character of a run starting at `self`.
    pub fn offset(self, offset: u64) -> Self {
        Self {
            replica: self.replica,
            clock: self.clock + offset,
        }
    }
}

impl Ord for Id {
    fn cmp(&self, other: &Self) -> Ordering {
        self.clock
            .cmp(&other.clock)
            .then(self.replica.cmp(&other.replica))
    }
}

impl PartialOrd for Id {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.clock, self.replica)
    }
}

/// Contiguous range of ids created by one replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdRange {
    pub replica: ReplicaId,
    pub start: u64,
    pub len: u64,
}

impl IdRange {
    pub fn new(replica: ReplicaId, start: u64, len: u64) -> Self {
        Self {
            replica,
            start,
            len,
        }
    }

    pub fn single(id: Id) -> Self {
        Self::new(id.replica, id.clock, 1)
    }

    pub fn contains(&self, id: Id) -> bool {
        id.replica == self.replica && id.clock >= self.start && id.clock - self.start < self.len
    }

    /// Iterate over every id in the range.
    pub fn ids(&self) -> impl Iterator<Item = Id> + '_ {
        (0..self.len).map(move |i| Id::new(self.replica, self.start + i))
    }

    /// One past the last clock in the range.
    pub fn end(&self) -> u64 {
        self.start + self.len
    }

    /// The parts of `self` not covered by `other`.
    pub fn subtract(&self, other: &IdRange) -> Vec<IdRange> {
        if other.replica != self.replica || other.end() <= self.start || other.start >= self.end() {
            return vec![*self];
        }
        let mut rest = Vec::with_capacity(2);
        if other.start > self.start {
            rest.push(IdRange::new(self.replica, self.start, other.start - self.start));
        }
        if other.end() < self.end() {
            rest.push(IdRange::new(self.replica, other.end(), self.end() - other.end()));
        }
        rest
    }

    /// Extend the range by one id if `id` directly follows it.
    pub fn try_extend(&mut self, id: Id) -> bool {
        if id.replica == self.replica && Some(id.clock) == self.start.checked_add(self.len) {
            self.len += 1;
            true
        } else {
            false
        }
    }
}

/// A single CRDT operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    /// Insert a run of characters after `origin` (`None` means the document
    /// head).
    Insert {
        id: Id,
        origin: Option<Id>,
        text: String,
    },
    /// Tombstone every character in the range.
    Delete(IdRange),
}

impl Op {
    /// Highest clock value this operation refers to.
    pub fn max_clock(&self) -> u64 {
        match self {
            Op::Insert { id, text, .. } => id
                .clock
                .saturating_add((text.chars().count() as u64).saturating_sub(1)),
            Op::Delete(range) => range.start.saturating_add(range.len.saturating_sub(1)),
        }
    }

    /// Structural checks that do not depend on document state.
    pub fn validate(&self) -> Result<(), MalformedOp> {
        match self {
            Op::Insert { id, origin, text } => {
                let len = text.chars().count() as u64;
                if len == 0 {
                    return Err(MalformedOp::EmptyInsert(*id));
                }
                if len > MAX_RUN_LEN {
                    return Err(MalformedOp::RunTooLong(len));
                }
                if id.clock == 0 || id.clock > MAX_CLOCK - (len - 1) {
                    return Err(MalformedOp::ClockOutOfRange(*id));
                }
                if origin.map_or(false, |o| o.clock >= id.clock) {
                    return Err(MalformedOp::OriginNotBefore(*id));
                }
                Ok(())
            }
            Op::Delete(range) => {
                if range.len == 0 {
                    return Err(MalformedOp::EmptyDelete(Id::new(range.replica, range.start)));
                }
                if range.len > MAX_RUN_LEN {
                    return Err(MalformedOp::RunTooLong(range.len));
                }
                if range.start == 0 || range.start > MAX_CLOCK - (range.len - 1) {
                    return Err(MalformedOp::ClockOutOfRange(Id::new(range.replica, range.start)));
                }
                Ok(())
            }
        }
    }
}

/// Structural defects in an operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MalformedOp {
    #[error("insert run {0} has no text")]
    EmptyInsert(Id),

    #[error("delete range starting at {0} is empty")]
    EmptyDelete(Id),

    #[error("run of {0} ids exceeds the maximum run length")]
    RunTooLong(u64),

    #[error("clock range starting at {0} is out of bounds")]
    ClockOutOfRange(Id),

    #[error("insert run {0} has an origin that does not precede it")]
    OriginNotBefore(Id),
}

/// Immutable unit of change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Update {
    pub ops: Vec<Op>,
}

impl Update {
    pub fn new(ops: Vec<Op>) -> Self {
        Self { ops }
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Combine several updates into one.
    pub fn merge_all(updates: impl IntoIterator<Item = Update>) -> Self {
        Self {
            ops: updates.into_iter().flat_map(|u| u.ops).collect(),
        }
    }

    /// Highest clock value referenced by any operation.
    pub fn max_clock(&self) -> u64 {
        self.ops.iter().map(Op::max_clock).max().unwrap_or(0)
    }

    pub fn validate(&self) -> Result<(), MalformedOp> {
        self.ops.iter().try_for_each(Op::validate)
    }
}
