//! Replicated text document.
//!
//! The document is a Replicated Growable Array: every character carries a
//! unique [`Id`] and the id of the character it was inserted after (its
//! origin). Characters live in an arena, a hash index maps ids to arena slots
//! and `order` lists the slots in document order. Deleted characters stay in
//! place as tombstones so that later operations can still refer to them.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ops::Range;
use thiserror::Error;

use super::update::{Id, IdRange, MalformedOp, Op, Update};
use super::ReplicaId;

/// Upper bound on parked characters plus parked delete ranges per document.
pub const MAX_PENDING: usize = 1 << 16;

/// Errors that can occur during document operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DocumentError {
    #[error("Malformed update: {0}")]
    Malformed(#[from] MalformedOp),

    #[error("Conflicting content for character {0}")]
    Conflict(Id),

    #[error("Invalid snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("Update would park {parked} more operations ({pending} already waiting, limit {limit})")]
    TooManyPending {
        pending: usize,
        parked: usize,
        limit: usize,
    },

    #[error("Lamport clock exhausted")]
    ClockExhausted,
}

pub type DocumentResult<T> = Result<T, DocumentError>;

/// Stable position in the document that survives concurrent edits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Anchor {
    /// Before the first character
    Start,
    /// Directly after the given character, deleted or not
    After(Id),
}

/// Summary of what a merge changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Characters integrated into the sequence
    pub inserted: usize,
    /// Characters newly tombstoned
    pub deleted: usize,
    /// Characters and delete targets parked until their dependencies arrive
    pub parked: usize,
}

impl MergeOutcome {
    /// True when the merge left the document untouched.
    pub fn is_noop(&self) -> bool {
        self.inserted == 0 && self.deleted == 0 && self.parked == 0
    }
}

/// One run of consecutive characters in a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRun {
    pub id: Id,
    pub origin: Option<Id>,
    pub text: String,
    pub deleted: bool,
}

/// Full document state in document order, plus operations still waiting for
/// missing dependencies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub runs: Vec<SnapshotRun>,
    pub pending: Update,
}

impl Snapshot {
    pub fn validate(&self) -> Result<(), MalformedOp> {
        for run in &self.runs {
            Op::Insert {
                id: run.id,
                origin: run.origin,
                text: run.text.clone(),
            }
            .validate()?;
        }
        self.pending.validate()
    }

    /// Express the snapshot as a single update.
    pub fn to_update(&self) -> Update {
        let mut ops = Vec::with_capacity(self.runs.len() + self.pending.ops.len());
        let mut deletes = Vec::new();

        for run in &self.runs {
            ops.push(Op::Insert {
                id: run.id,
                origin: run.origin,
                text: run.text.clone(),
            });
            if run.deleted {
                let len = run.text.chars().count() as u64;
                deletes.push(Op::Delete(IdRange::new(run.id.replica, run.id.clock, len)));
            }
        }

        ops.extend(deletes);
        ops.extend(self.pending.ops.iter().cloned());
        Update::new(ops)
    }

    /// Visible text without materializing a document.
    pub fn visible_text(&self) -> String {
        self.runs
            .iter()
            .filter(|run| !run.deleted)
            .map(|run| run.text.as_str())
            .collect()
    }
}

#[derive(Debug, Clone, Copy)]
struct Item {
    id: Id,
    origin: Option<Id>,
    ch: char,
    deleted: bool,
}

/// Convergent text document owned by a single replica.
#[derive(Debug, Clone)]
pub struct Document {
    replica: ReplicaId,
    /// Lamport clock; local ids are always `clock + 1` and upwards
    clock: u64,
    items: Vec<Item>,
    index: HashMap<Id, usize>,
    order: Vec<usize>,
    visible: usize,
    /// Inserts whose origin is unknown, keyed by that origin
    pending_inserts: HashMap<Id, Vec<Item>>,
    /// Delete targets that have not arrived yet, as disjoint ranges per replica
    pending_deletes: HashMap<ReplicaId, Vec<IdRange>>,
}

impl Document {
    pub fn new(replica: ReplicaId) -> Self {
        Self {
            replica,
            clock: 0,
            items: Vec::new(),
            index: HashMap::new(),
            order: Vec::new(),
            visible: 0,
            pending_inserts: HashMap::new(),
            pending_deletes: HashMap::new(),
        }
    }

    /// Create a document with a random replica id; 0 is reserved for servers.
    pub fn with_random_replica() -> Self {
        Self::new(rand::random::<u64>().max(1))
    }

    pub fn replica(&self) -> ReplicaId {
        self.replica
    }

    pub fn clock(&self) -> u64 {
        self.clock
    }

    /// Number of visible characters
    pub fn len(&self) -> usize {
        self.visible
    }

    pub fn is_empty(&self) -> bool {
        self.visible == 0
    }

    /// Parked work: characters waiting for their origin plus delete ranges
    /// waiting for their targets
    pub fn pending_len(&self) -> usize {
        self.pending_inserts.values().map(Vec::len).sum::<usize>()
            + self.pending_deletes.values().map(Vec::len).sum::<usize>()
    }

    /// Concatenation of all non-deleted characters in document order.
    pub fn visible_text(&self) -> String {
        self.order
            .iter()
            .map(|&slot| &self.items[slot])
            .filter(|item| !item.deleted)
            .map(|item| item.ch)
            .collect()
    }

    // ---------------------------------------------------------------------
    // Local edits
    // ---------------------------------------------------------------------

    /// Insert `text` before the visible character at `position`.
    pub fn apply_local_insert(&mut self, position: usize, text: &str) -> DocumentResult<Update> {
        let count = text.chars().count() as u64;
        if count == 0 {
            return Ok(Update::default());
        }
        let last = self.reserve_clock(count)?;

        let position = position.min(self.visible);
        let (mut start, origin) = if position == 0 {
            (0, None)
        } else {
            let pos = self.visible_order_pos(position - 1);
            (pos + 1, Some(self.items[self.order[pos]].id))
        };

        let first = Id::new(self.replica, self.clock + 1);
        self.clock = last;

        let mut prev = origin;
        for (k, ch) in text.chars().enumerate() {
            let item = Item {
                id: first.offset(k as u64),
                origin: prev,
                ch,
                deleted: false,
            };
            start = self.integrate_at(item, start) + 1;
            prev = Some(item.id);
        }

        Ok(Update::new(vec![Op::Insert {
            id: first,
            origin,
            text: text.to_string(),
        }]))
    }

    /// Last clock value of a run of `count` fresh ids.
    fn reserve_clock(&self, count: u64) -> DocumentResult<u64> {
        self.clock
            .checked_add(count)
            .ok_or(DocumentError::ClockExhausted)
    }

    /// Tombstone the visible characters in `range`.
    pub fn apply_local_delete(&mut self, range: Range<usize>) -> Update {
        let start = range.start.min(self.visible);
        let end = range.end.min(self.visible);
        if start >= end {
            return Update::default();
        }

        let mut ranges: Vec<IdRange> = Vec::new();
        let mut seen = 0;
        for &slot in &self.order {
            let item = &mut self.items[slot];
            if item.deleted {
                continue;
            }
            if seen >= start {
                item.deleted = true;
                let id = item.id;
                if !ranges.last_mut().map_or(false, |r| r.try_extend(id)) {
                    ranges.push(IdRange::single(id));
                }
            }
            seen += 1;
            if seen >= end {
                break;
            }
        }

        self.visible -= end - start;
        Update::new(ranges.into_iter().map(Op::Delete).collect())
    }

    /// Replace the visible characters in `range` with `text`.
    pub fn apply_local_replace(
        &mut self,
        range: Range<usize>,
        text: &str,
    ) -> DocumentResult<Update> {
        self.reserve_clock(text.chars().count() as u64)?;
        let at = range.start.min(self.visible);
        let deleted = self.apply_local_delete(range);
        let inserted = self.apply_local_insert(at, text)?;
        Ok(Update::merge_all([deleted, inserted]))
    }

    // ---------------------------------------------------------------------
    // Remote merge
    // ---------------------------------------------------------------------

    /// Integrate a remote update.
    ///
    /// The update is checked in full before any state changes, so a rejected
    /// update leaves the document untouched. Operations whose dependencies are
    /// unknown are parked and integrated once the dependency arrives.
    pub fn merge_remote(&mut self, update: &Update) -> DocumentResult<MergeOutcome> {
        self.check(update)?;

        let mut outcome = MergeOutcome::default();
        for op in &update.ops {
            match op {
                Op::Insert { id, origin, text } => {
                    let mut prev = *origin;
                    let mut hint = None;
                    for (k, ch) in text.chars().enumerate() {
                        let item = Item {
                            id: id.offset(k as u64),
                            origin: prev,
                            ch,
                            deleted: false,
                        };
                        hint = self.insert_remote(item, hint, &mut outcome);
                        prev = Some(item.id);
                    }
                }
                Op::Delete(range) => self.delete_remote(*range, &mut outcome),
            }
        }

        self.clock = self.clock.max(update.max_clock());
        Ok(outcome)
    }

    fn check(&self, update: &Update) -> DocumentResult<()> {
        update.validate()?;

        let mut incoming: HashMap<Id, (char, Option<Id>)> = HashMap::new();
        for op in &update.ops {
            let Op::Insert { id, origin, text } = op else {
                continue;
            };
            let mut prev = *origin;
            for (k, ch) in text.chars().enumerate() {
                let cid = id.offset(k as u64);
                if let Some(existing) = self.find(cid, prev) {
                    if existing.ch != ch || existing.origin != prev {
                        return Err(DocumentError::Conflict(cid));
                    }
                }
                if let Some(&(other_ch, other_origin)) = incoming.get(&cid) {
                    if other_ch != ch || other_origin != prev {
                        return Err(DocumentError::Conflict(cid));
                    }
                }
                incoming.insert(cid, (ch, prev));
                prev = Some(cid);
            }
        }

        let known = |id: &Id| self.index.contains_key(id) || incoming.contains_key(id);
        let parked: usize = update
            .ops
            .iter()
            .map(|op| match op {
                Op::Insert {
                    origin: Some(origin),
                    text,
                    ..
                } if !known(origin) => text.chars().count(),
                Op::Insert { .. } => 0,
                Op::Delete(range) => {
                    let coverable = (self.items.len() + incoming.len()) as u64;
                    let missing = range.len > coverable || range.ids().any(|id| !known(&id));
                    usize::from(missing)
                }
            })
            .sum();

        let pending = self.pending_len();
        if pending + parked > MAX_PENDING {
            return Err(DocumentError::TooManyPending {
                pending,
                parked,
                limit: MAX_PENDING,
            });
        }
        Ok(())
    }

    /// Look up a character among integrated and parked items.
    fn find(&self, id: Id, origin_hint: Option<Id>) -> Option<&Item> {
        if let Some(&slot) = self.index.get(&id) {
            return Some(&self.items[slot]);
        }
        let parked = origin_hint.and_then(|origin| self.pending_inserts.get(&origin))?;
        parked.iter().find(|item| item.id == id)
    }

    /// Returns the order position of `item` when it was integrated by this
    /// call.
    fn insert_remote(
        &mut self,
        item: Item,
        origin_pos: Option<usize>,
        outcome: &mut MergeOutcome,
    ) -> Option<usize> {
        if self.index.contains_key(&item.id) {
            return None;
        }

        let start = match (item.origin, origin_pos) {
            (None, _) => 0,
            (Some(_), Some(pos)) => pos + 1,
            (Some(origin), None) => match self.position_of(origin) {
                Some(pos) => pos + 1,
                None => {
                    let parked = self.pending_inserts.entry(origin).or_default();
                    if !parked.iter().any(|p| p.id == item.id) {
                        parked.push(item);
                        outcome.parked += 1;
                    }
                    return None;
                }
            },
        };

        let pos = self.integrate_at(item, start);
        outcome.inserted += 1;
        self.settle(item.id, outcome);
        self.integrate_dependents(item.id, outcome);
        Some(pos)
    }

    /// Tombstone the known characters in `range` and park the gaps.
    fn delete_remote(&mut self, range: IdRange, outcome: &mut MergeOutcome) {
        // Walk whichever is smaller: the range or the arena
        let mut present: Vec<(u64, usize)> = if range.len > self.items.len() as u64 {
            self.items
                .iter()
                .enumerate()
                .filter(|(_, item)| range.contains(item.id))
                .map(|(slot, item)| (item.id.clock, slot))
                .collect()
        } else {
            range
                .ids()
                .filter_map(|id| self.index.get(&id).map(|&slot| (id.clock, slot)))
                .collect()
        };
        present.sort_unstable();

        let mut next = range.start;
        for &(clock, slot) in &present {
            let item = &mut self.items[slot];
            if !item.deleted {
                item.deleted = true;
                self.visible -= 1;
                outcome.deleted += 1;
            }
            if clock > next {
                self.park_delete(IdRange::new(range.replica, next, clock - next), outcome);
            }
            next = clock + 1;
        }
        if next < range.end() {
            self.park_delete(IdRange::new(range.replica, next, range.end() - next), outcome);
        }
    }

    fn park_delete(&mut self, range: IdRange, outcome: &mut MergeOutcome) {
        let parked = self.pending_deletes.entry(range.replica).or_default();
        let mut fresh = vec![range];
        for existing in parked.iter() {
            fresh = fresh.iter().flat_map(|r| r.subtract(existing)).collect();
        }
        for r in fresh {
            outcome.parked += r.len as usize;
            parked.push(r);
        }
    }

    /// Apply a parked delete that targets a freshly integrated character.
    fn settle(&mut self, id: Id, outcome: &mut MergeOutcome) {
        let Some(ranges) = self.pending_deletes.get_mut(&id.replica) else {
            return;
        };
        let Some(i) = ranges.iter().position(|r| r.contains(id)) else {
            return;
        };

        let hit = ranges.swap_remove(i);
        if id.clock > hit.start {
            ranges.push(IdRange::new(id.replica, hit.start, id.clock - hit.start));
        }
        if id.clock + 1 < hit.end() {
            ranges.push(IdRange::new(id.replica, id.clock + 1, hit.end() - id.clock - 1));
        }
        if ranges.is_empty() {
            self.pending_deletes.remove(&id.replica);
        }

        if let Some(&slot) = self.index.get(&id) {
            let item = &mut self.items[slot];
            if !item.deleted {
                item.deleted = true;
                self.visible -= 1;
                outcome.deleted += 1;
            }
        }
    }

    fn integrate_dependents(&mut self, id: Id, outcome: &mut MergeOutcome) {
        let mut ready = vec![id];
        while let Some(parent) = ready.pop() {
            let Some(children) = self.pending_inserts.remove(&parent) else {
                continue;
            };
            for child in children {
                if self.index.contains_key(&child.id) {
                    continue;
                }
                let Some(parent_pos) = self.position_of(parent) else {
                    continue;
                };
                self.integrate_at(child, parent_pos + 1);
                outcome.inserted += 1;
                self.settle(child.id, outcome);
                ready.push(child.id);
            }
        }
    }

    /// Place `item` at or after `start`, skipping concurrent siblings with a
    /// greater id together with their descendants.
    fn integrate_at(&mut self, item: Item, start: usize) -> usize {
        let mut pos = start;
        while pos < self.order.len() && self.items[self.order[pos]].id > item.id {
            pos += 1;
        }

        let slot = self.items.len();
        self.items.push(item);
        self.index.insert(item.id, slot);
        self.order.insert(pos, slot);
        if !item.deleted {
            self.visible += 1;
        }
        pos
    }

    fn position_of(&self, id: Id) -> Option<usize> {
        let slot = *self.index.get(&id)?;
        self.order.iter().position(|&s| s == slot)
    }

    /// Order position of the `n`-th visible character. `n` must be in bounds.
    fn visible_order_pos(&self, n: usize) -> usize {
        let mut seen = 0;
        for (pos, &slot) in self.order.iter().enumerate() {
            if self.items[slot].deleted {
                continue;
            }
            if seen == n {
                return pos;
            }
            seen += 1;
        }
        self.order.len().saturating_sub(1)
    }

    // ---------------------------------------------------------------------
    // Snapshots
    // ---------------------------------------------------------------------

    /// Export the full state.
    pub fn snapshot(&self) -> Snapshot {
        let mut runs: Vec<SnapshotRun> = Vec::new();
        let mut prev: Option<Id> = None;

        for &slot in &self.order {
            let item = self.items[slot];
            let extends = match (runs.last(), prev) {
                (Some(run), Some(prev_id)) => {
                    run.deleted == item.deleted
                        && item.origin == Some(prev_id)
                        && item.id == prev_id.offset(1)
                }
                _ => false,
            };

            if extends {
                if let Some(run) = runs.last_mut() {
                    run.text.push(item.ch);
                }
            } else {
                runs.push(SnapshotRun {
                    id: item.id,
                    origin: item.origin,
                    text: item.ch.to_string(),
                    deleted: item.deleted,
                });
            }
            prev = Some(item.id);
        }

        Snapshot {
            runs,
            pending: self.pending_update(),
        }
    }

    fn pending_update(&self) -> Update {
        let mut inserts: Vec<&Item> = self.pending_inserts.values().flatten().collect();
        inserts.sort_by_key(|item| item.id);

        let mut deletes: Vec<IdRange> = self.pending_deletes.values().flatten().copied().collect();
        deletes.sort_by_key(|r| (r.replica, r.start));

        let mut ops: Vec<Op> = inserts
            .into_iter()
            .map(|item| Op::Insert {
                id: item.id,
                origin: item.origin,
                text: item.ch.to_string(),
            })
            .collect();

        ops.extend(deletes.into_iter().map(Op::Delete));

        Update::new(ops)
    }

    /// Replace local state with `snapshot`.
    ///
    /// The replica id is kept and the clock is fast-forwarded past every id in
    /// the snapshot, so fresh local ids never collide with restored ones.
    pub fn load_snapshot(&mut self, snapshot: &Snapshot) -> DocumentResult<()> {
        snapshot.validate()?;

        let mut fresh = Document::new(self.replica);
        for run in &snapshot.runs {
            let mut prev = run.origin;
            for (k, ch) in run.text.chars().enumerate() {
                let id = run.id.offset(k as u64);
                if fresh.index.contains_key(&id) {
                    return Err(DocumentError::InvalidSnapshot(format!(
                        "duplicate character {}",
                        id
                    )));
                }
                if let Some(origin) = prev {
                    if !fresh.index.contains_key(&origin) {
                        return Err(DocumentError::InvalidSnapshot(format!(
                            "character {} precedes its origin {}",
                            id, origin
                        )));
                    }
                }

                let slot = fresh.items.len();
                fresh.items.push(Item {
                    id,
                    origin: prev,
                    ch,
                    deleted: run.deleted,
                });
                fresh.index.insert(id, slot);
                fresh.order.push(slot);
                if !run.deleted {
                    fresh.visible += 1;
                }
                fresh.clock = fresh.clock.max(id.clock);
                prev = Some(id);
            }
        }

        fresh.merge_remote(&snapshot.pending)?;
        fresh.clock = fresh.clock.max(self.clock);
        *self = fresh;
        Ok(())
    }

    /// Merge a snapshot into the existing state, keeping local edits.
    pub fn merge_snapshot(&mut self, snapshot: &Snapshot) -> DocumentResult<MergeOutcome> {
        snapshot.validate()?;
        self.merge_remote(&snapshot.to_update())
    }

    /// The whole state as one update.
    pub fn state_as_update(&self) -> Update {
        self.snapshot().to_update()
    }

    /// Build a document from a snapshot.
    pub fn from_snapshot(replica: ReplicaId, snapshot: &Snapshot) -> DocumentResult<Self> {
        let mut doc = Self::new(replica);
        doc.load_snapshot(snapshot)?;
        Ok(doc)
    }

    // ---------------------------------------------------------------------
    // Anchors
    // ---------------------------------------------------------------------

    /// Stable anchor for the visible offset `position`.
    pub fn anchor_at(&self, position: usize) -> Anchor {
        let position = position.min(self.visible);
        if position == 0 {
            return Anchor::Start;
        }
        let pos = self.visible_order_pos(position - 1);
        Anchor::After(self.items[self.order[pos]].id)
    }

    /// Current visible offset of `anchor`, or `None` when it refers to a
    /// character this replica has not seen.
    pub fn resolve_anchor(&self, anchor: &Anchor) -> Option<usize> {
        let target = match anchor {
            Anchor::Start => return Some(0),
            Anchor::After(id) => *self.index.get(id)?,
        };

        let mut offset = 0;
        for &slot in &self.order {
            if !self.items[slot].deleted {
                offset += 1;
            }
            if slot == target {
                return Some(offset);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use crate::sync::update::{MAX_CLOCK, MAX_RUN_LEN};

    /// Every permutation of `items`.
    fn permutations<T: Clone>(items: &[T]) -> Vec<Vec<T>> {
        if items.len() <= 1 {
            return vec![items.to_vec()];
        }
        let mut out = Vec::new();
        for i in 0..items.len() {
            let mut rest = items.to_vec();
            let head = rest.remove(i);
            for mut tail in permutations(&rest) {
                tail.insert(0, head.clone());
                out.push(tail);
            }
        }
        out
    }

    #[test]
    fn test_local_insert_and_delete() {
        let mut doc = Document::new(1);
        doc.apply_local_insert(0, "hello").unwrap();
        doc.apply_local_insert(5, " world").unwrap();
        assert_eq!(doc.visible_text(), "hello world");
        assert_eq!(doc.len(), 11);

        doc.apply_local_delete(0..6);
        assert_eq!(doc.visible_text(), "world");

        doc.apply_local_insert(0, "big ").unwrap();
        assert_eq!(doc.visible_text(), "big world");
        assert_eq!(doc.clock(), 15);
    }

    #[test]
    fn test_positions_are_clamped() {
        let mut doc = Document::new(1);
        doc.apply_local_insert(42, "abc").unwrap();
        assert_eq!(doc.visible_text(), "abc");

        assert!(doc.apply_local_delete(2..99).ops.len() == 1);
        assert_eq!(doc.visible_text(), "ab");

        assert!(doc.apply_local_delete(5..9).is_empty());
        assert!(doc.apply_local_insert(1, "").unwrap().is_empty());
    }

    #[test]
    fn test_replace_is_one_update() {
        let mut doc = Document::new(1);
        doc.apply_local_insert(0, "fn main() {}").unwrap();
        let update = doc.apply_local_replace(3..7, "run").unwrap();
        assert_eq!(doc.visible_text(), "fn run() {}");

        let mut other = Document::new(2);
        other.merge_snapshot(&doc.snapshot()).unwrap();
        other.merge_remote(&update).unwrap();
        assert_eq!(other.visible_text(), "fn run() {}");
    }

    #[test]
    fn test_remote_merge_replays_edits() {
        let mut a = Document::new(1);
        let mut b = Document::new(2);

        let u1 = a.apply_local_insert(0, "hello").unwrap();
        b.merge_remote(&u1).unwrap();
        let u2 = a.apply_local_delete(1..3);
        b.merge_remote(&u2).unwrap();

        assert_eq!(a.visible_text(), "hlo");
        assert_eq!(b.visible_text(), "hlo");
    }

    #[test]
    fn test_concurrent_inserts_at_same_position_commute() {
        let mut base = Document::new(1);
        let init = base.apply_local_insert(0, "ac").unwrap();

        let mut a = Document::new(2);
        let mut b = Document::new(3);
        a.merge_remote(&init).unwrap();
        b.merge_remote(&init).unwrap();

        let ua = a.apply_local_insert(1, "X").unwrap();
        let ub = b.apply_local_insert(1, "Y").unwrap();

        a.merge_remote(&ub).unwrap();
        b.merge_remote(&ua).unwrap();

        assert_eq!(a.visible_text(), b.visible_text());
        // Same clock, so the higher replica wins the left spot.
        assert_eq!(a.visible_text(), "aYXc");
    }

    #[test]
    fn test_convergence_over_all_permutations() {
        let mut a = Document::new(1);
        let mut b = Document::new(2);
        let mut c = Document::new(3);

        let u1 = a.apply_local_insert(0, "shared").unwrap();
        b.merge_remote(&u1).unwrap();
        c.merge_remote(&u1).unwrap();

        let u2 = a.apply_local_insert(6, " text").unwrap();
        let u3 = b.apply_local_delete(0..3);
        let u4 = c.apply_local_insert(3, "--").unwrap();
        let u5 = c.apply_local_insert(0, ">").unwrap();

        let updates = vec![u1, u2, u3, u4, u5];
        let mut results = HashSet::new();
        for order in permutations(&updates) {
            let mut doc = Document::new(9);
            for update in &order {
                doc.merge_remote(update).unwrap();
            }
            assert_eq!(doc.pending_len(), 0);
            results.insert(doc.visible_text());
        }

        assert_eq!(results.len(), 1);
        assert_eq!(results.into_iter().next().unwrap(), ">--red text");
    }

    #[test]
    fn test_merge_is_idempotent() {
        let mut a = Document::new(1);
        let update = a.apply_local_insert(0, "twice").unwrap();

        let mut b = Document::new(2);
        let first = b.merge_remote(&update).unwrap();
        let second = b.merge_remote(&update).unwrap();

        assert_eq!(first.inserted, 5);
        assert!(second.is_noop());
        assert_eq!(b.visible_text(), "twice");

        let delete = a.apply_local_delete(0..1);
        b.merge_remote(&delete).unwrap();
        assert!(b.merge_remote(&delete).unwrap().is_noop());
        assert_eq!(b.visible_text(), "wice");
    }

    #[test]
    fn test_out_of_order_delivery_is_buffered() {
        let mut a = Document::new(1);
        let u1 = a.apply_local_insert(0, "abc").unwrap();
        let u2 = a.apply_local_insert(3, "def").unwrap();
        let u3 = a.apply_local_delete(0..1);

        let mut b = Document::new(2);
        let outcome = b.merge_remote(&u2).unwrap();
        assert_eq!(outcome.parked, 3);
        assert_eq!(b.visible_text(), "");

        b.merge_remote(&u3).unwrap();
        assert_eq!(b.pending_len(), 4);

        b.merge_remote(&u1).unwrap();
        assert_eq!(b.pending_len(), 0);
        assert_eq!(b.visible_text(), "bcdef");
    }

    #[test]
    fn test_insert_survives_concurrent_delete() {
        let mut a = Document::new(1);
        let mut b = Document::new(2);

        let init = a.apply_local_insert(0, "abcd").unwrap();
        b.merge_remote(&init).unwrap();

        let del = a.apply_local_delete(1..3);
        let ins = b.apply_local_insert(2, "X").unwrap();

        a.merge_remote(&ins).unwrap();
        b.merge_remote(&del).unwrap();

        assert_eq!(a.visible_text(), "aXd");
        assert_eq!(b.visible_text(), "aXd");
    }

    #[test]
    fn test_conflicting_duplicate_is_rejected_atomically() {
        let mut a = Document::new(1);
        let update = a.apply_local_insert(0, "ok").unwrap();

        let mut b = Document::new(2);
        b.merge_remote(&update).unwrap();

        let forged = Update::new(vec![
            Op::Insert {
                id: Id::new(7, 1),
                origin: None,
                text: "new".to_string(),
            },
            Op::Insert {
                id: Id::new(1, 1),
                origin: None,
                text: "X".to_string(),
            },
        ]);

        let result = b.merge_remote(&forged);
        assert_eq!(result, Err(DocumentError::Conflict(Id::new(1, 1))));
        assert_eq!(b.visible_text(), "ok");
        assert_eq!(b.pending_len(), 0);
    }

    #[test]
    fn test_malformed_update_is_rejected() {
        let mut doc = Document::new(1);
        let update = Update::new(vec![Op::Delete(IdRange::new(3, 1, 0))]);
        assert!(matches!(
            doc.merge_remote(&update),
            Err(DocumentError::Malformed(_))
        ));
    }

    #[test]
    fn test_long_delete_of_unknown_ids_parks_one_range() {
        let mut doc = Document::new(1);
        let wide = Update::new(vec![Op::Delete(IdRange::new(42, 1, MAX_RUN_LEN))]);

        let outcome = doc.merge_remote(&wide).unwrap();
        assert_eq!(outcome.parked, MAX_RUN_LEN as usize);
        assert_eq!(doc.pending_len(), 1);

        // Replaying the same range parks nothing new
        assert_eq!(doc.merge_remote(&wide).unwrap().parked, 0);
        assert_eq!(doc.pending_len(), 1);

        let arrivals = Update::new(vec![Op::Insert {
            id: Id::new(42, 5),
            origin: None,
            text: "gone".to_string(),
        }]);
        let outcome = doc.merge_remote(&arrivals).unwrap();
        assert_eq!(outcome.inserted, 4);
        assert_eq!(outcome.deleted, 4);
        assert_eq!(doc.visible_text(), "");
        // The parked range was split around the settled ids
        assert_eq!(doc.pending_len(), 2);
    }

    #[test]
    fn test_parked_work_is_capped() {
        let mut doc = Document::new(1);
        let scattered = Update::new(
            (0..=MAX_PENDING as u64)
                .map(|k| Op::Delete(IdRange::new(42, 2 * k + 1, 1)))
                .collect(),
        );

        let result = doc.merge_remote(&scattered);
        assert!(matches!(
            result,
            Err(DocumentError::TooManyPending { pending: 0, .. })
        ));
        assert_eq!(doc.pending_len(), 0);

        // Orphaned inserts count against the same budget
        let orphans = Update::new(vec![Op::Insert {
            id: Id::new(42, 10),
            origin: Some(Id::new(42, 9)),
            text: "x".repeat(MAX_PENDING + 1),
        }]);
        assert!(matches!(
            doc.merge_remote(&orphans),
            Err(DocumentError::TooManyPending { .. })
        ));
        assert_eq!(doc.pending_len(), 0);
        assert_eq!(doc.clock(), 0);
    }

    #[test]
    fn test_remote_clock_near_max_is_rejected() {
        let mut doc = Document::new(1);
        let hostile = Update::new(vec![Op::Insert {
            id: Id::new(7, u64::MAX - 1),
            origin: None,
            text: "x".to_string(),
        }]);
        assert!(matches!(
            doc.merge_remote(&hostile),
            Err(DocumentError::Malformed(MalformedOp::ClockOutOfRange(_)))
        ));
        assert_eq!(doc.clock(), 0);

        // The highest accepted remote clock still leaves room for local edits
        let edge = Update::new(vec![Op::Insert {
            id: Id::new(7, MAX_CLOCK),
            origin: None,
            text: "y".to_string(),
        }]);
        doc.merge_remote(&edge).unwrap();
        assert_eq!(doc.clock(), MAX_CLOCK);
        let local = doc.apply_local_insert(1, "z").unwrap();
        assert_eq!(local.max_clock(), MAX_CLOCK + 1);
        assert_eq!(doc.visible_text(), "yz");
    }

    #[test]
    fn test_clock_advances_past_remote_ids() {
        let mut a = Document::new(1);
        a.apply_local_insert(0, "0123456789").unwrap();
        let update = a.apply_local_insert(10, "!").unwrap();

        let mut b = Document::new(2);
        b.merge_remote(&update).unwrap();
        assert_eq!(b.clock(), 11);

        let local = b.apply_local_insert(0, "x").unwrap();
        let Op::Insert { id, .. } = &local.ops[0] else {
            panic!("expected insert");
        };
        assert_eq!(id.clock, 12);
    }

    #[test]
    fn test_snapshot_load_restores_state() {
        let mut a = Document::new(1);
        a.apply_local_insert(0, "hello world").unwrap();
        a.apply_local_delete(5..11);
        let orphan = {
            let mut src = Document::new(3);
            src.apply_local_insert(0, "zz").unwrap();
            src.apply_local_insert(2, "q").unwrap()
        };
        a.merge_remote(&orphan).unwrap();
        assert_eq!(a.pending_len(), 1);

        let snapshot = a.snapshot();
        assert_eq!(snapshot.visible_text(), "hello");

        let mut b = Document::new(2);
        b.apply_local_insert(0, "discarded").unwrap();
        b.load_snapshot(&snapshot).unwrap();

        assert_eq!(b.visible_text(), "hello");
        assert_eq!(b.pending_len(), 1);
        assert_eq!(b.replica(), 2);
        assert!(b.clock() >= a.clock());

        let edit = b.apply_local_insert(5, "!").unwrap();
        a.merge_remote(&edit).unwrap();
        assert_eq!(a.visible_text(), "hello!");
    }

    #[test]
    fn test_snapshot_with_bad_order_is_rejected() {
        let snapshot = Snapshot {
            runs: vec![SnapshotRun {
                id: Id::new(1, 5),
                origin: Some(Id::new(1, 2)),
                text: "x".to_string(),
                deleted: false,
            }],
            pending: Update::default(),
        };
        let mut doc = Document::new(1);
        assert!(matches!(
            doc.load_snapshot(&snapshot),
            Err(DocumentError::InvalidSnapshot(_))
        ));
    }

    #[test]
    fn test_merge_snapshot_keeps_local_edits() {
        let mut server = Document::new(1);
        server.apply_local_insert(0, "server").unwrap();

        let mut client = Document::new(2);
        client.apply_local_insert(0, "offline ").unwrap();

        client.merge_snapshot(&server.snapshot()).unwrap();
        server.merge_remote(&client.state_as_update()).unwrap();

        assert_eq!(client.visible_text(), server.visible_text());
        assert!(client.visible_text().contains("offline "));
        assert!(client.visible_text().contains("server"));
    }

    #[test]
    fn test_snapshot_runs_are_compacted() {
        let mut doc = Document::new(1);
        doc.apply_local_insert(0, "abcdef").unwrap();
        doc.apply_local_delete(2..4);

        let snapshot = doc.snapshot();
        assert_eq!(snapshot.runs.len(), 3);
        assert!(snapshot.runs[1].deleted);
        assert_eq!(snapshot.runs[1].text, "cd");
    }

    #[test]
    fn test_anchor_follows_remote_edits() {
        let mut a = Document::new(1);
        let mut b = Document::new(2);

        let init = a.apply_local_insert(0, "world").unwrap();
        b.merge_remote(&init).unwrap();

        let caret = a.anchor_at(3);
        let prefix = b.apply_local_insert(0, "hello ").unwrap();
        a.merge_remote(&prefix).unwrap();

        assert_eq!(a.resolve_anchor(&caret), Some(9));
        assert_eq!(a.resolve_anchor(&Anchor::Start), Some(0));
        assert_eq!(a.anchor_at(0), Anchor::Start);
    }

    #[test]
    fn test_anchor_on_deleted_character() {
        let mut doc = Document::new(1);
        doc.apply_local_insert(0, "abcdef").unwrap();
        let anchor = doc.anchor_at(4);

        doc.apply_local_delete(2..5);
        assert_eq!(doc.visible_text(), "abf");
        assert_eq!(doc.resolve_anchor(&anchor), Some(2));

        let unknown = Anchor::After(Id::new(99, 1));
        assert_eq!(doc.resolve_anchor(&unknown), None);
    }
}
