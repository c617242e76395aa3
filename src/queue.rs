//! In-memory delivery ordering.
//!
//! The queue holds references into the spool, never envelope content. Each
//! destination has its own FIFO lane; workers take entries round-robin across
//! lanes, and a lane is handed to at most one worker at a time so attempts for
//! one destination never overlap.
//!
//! Entries that must wait (backoff retries, delayed publications) sit in a
//! timer heap until due and are then promoted into their lane.

use std::{
    cmp::{Ordering, Reverse},
    collections::{BinaryHeap, HashMap, HashSet, VecDeque},
};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::envelope::EnvelopeId;

/// Reference to a spooled envelope awaiting delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub id: EnvelopeId,
    pub destination: String,
    /// Admission order, assigned when the entry joins its lane.
    pub order: u64,
}

/// Where a retried envelope rejoins its destination lane.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryOrdering {
    /// Rejoin at the tail once the backoff expires. Envelopes published
    /// later may be attempted first.
    #[default]
    Requeue,
    /// Block the destination for the backoff and rejoin at the head, keeping
    /// strict FIFO per destination.
    HoldDestination,
}

#[derive(Debug, Default)]
struct Lane {
    ready: VecDeque<QueueEntry>,
    checked_out: bool,
    held: usize,
}

impl Lane {
    fn available(&self) -> bool {
        !self.checked_out && self.held == 0 && !self.ready.is_empty()
    }

    fn idle(&self) -> bool {
        !self.checked_out && self.held == 0 && self.ready.is_empty()
    }
}

#[derive(Debug)]
struct Scheduled {
    due: Instant,
    seq: u64,
    entry: QueueEntry,
    to_front: bool,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        self.due.cmp(&other.due).then(self.seq.cmp(&other.seq))
    }
}

/// Per-destination FIFO queue with round-robin service.
#[derive(Debug)]
pub struct DeliveryQueue {
    lanes: HashMap<String, Lane>,
    rotation: VecDeque<String>,
    scheduled: BinaryHeap<Reverse<Scheduled>>,
    known: HashSet<EnvelopeId>,
    next_order: u64,
    next_seq: u64,
    ordering: RetryOrdering,
}

impl Default for DeliveryQueue {
    fn default() -> Self {
        Self::new(RetryOrdering::default())
    }
}

impl DeliveryQueue {
    pub fn new(ordering: RetryOrdering) -> Self {
        Self {
            lanes: HashMap::new(),
            rotation: VecDeque::new(),
            scheduled: BinaryHeap::new(),
            known: HashSet::new(),
            next_order: 0,
            next_seq: 0,
            ordering,
        }
    }

    pub fn ordering(&self) -> RetryOrdering {
        self.ordering
    }

    /// Append an envelope to the tail of its destination lane.
    pub fn enqueue(&mut self, id: EnvelopeId, destination: impl Into<String>) -> QueueEntry {
        let entry = QueueEntry {
            id,
            destination: destination.into(),
            order: self.take_order(),
        };
        self.known.insert(id);
        self.push_back(entry.clone());
        entry
    }

    /// Admit an envelope that may not be attempted before `due`.
    pub fn enqueue_at(&mut self, id: EnvelopeId, destination: impl Into<String>, due: Instant) {
        let entry = QueueEntry {
            id,
            destination: destination.into(),
            order: 0,
        };
        self.known.insert(id);
        self.schedule(entry, due, false);
    }

    /// Take the next available entry, rotating across destinations.
    ///
    /// The entry's destination stays checked out until [`finish`] or
    /// [`retry`] is called for it.
    ///
    /// [`finish`]: DeliveryQueue::finish
    /// [`retry`]: DeliveryQueue::retry
    pub fn checkout(&mut self) -> Option<QueueEntry> {
        let index = self
            .rotation
            .iter()
            .position(|destination| self.lanes.get(destination).is_some_and(Lane::available))?;
        let destination = self.rotation.remove(index)?;
        let lane = self.lanes.get_mut(&destination)?;
        let entry = lane.ready.pop_front()?;
        lane.checked_out = true;
        self.rotation.push_back(destination);
        Some(entry)
    }

    /// Pop the oldest ready entry of one destination, if it is available.
    pub fn dequeue(&mut self, destination: &str) -> Option<QueueEntry> {
        let lane = self.lanes.get_mut(destination)?;
        if !lane.available() {
            return None;
        }
        lane.checked_out = true;
        lane.ready.pop_front()
    }

    /// Release the destination of an entry whose attempt has resolved.
    pub fn finish(&mut self, entry: &QueueEntry) {
        self.known.remove(&entry.id);
        if let Some(lane) = self.lanes.get_mut(&entry.destination) {
            lane.checked_out = false;
        }
        self.tidy(&entry.destination);
    }

    /// Release the destination and hold the entry back until `due`, placing
    /// it according to the configured [`RetryOrdering`].
    pub fn retry(&mut self, entry: QueueEntry, due: Instant) {
        if let Some(lane) = self.lanes.get_mut(&entry.destination) {
            lane.checked_out = false;
        }
        let to_front = self.ordering == RetryOrdering::HoldDestination;
        self.schedule(entry, due, to_front);
    }

    /// Move every scheduled entry due at or before `now` into its lane.
    /// Returns how many were promoted.
    pub fn promote_due(&mut self, now: Instant) -> usize {
        let mut promoted = 0;
        while self
            .scheduled
            .peek()
            .is_some_and(|Reverse(next)| next.due <= now)
        {
            let Some(Reverse(scheduled)) = self.scheduled.pop() else {
                break;
            };
            let mut entry = scheduled.entry;
            if scheduled.to_front {
                let lane = self.lane_mut(&entry.destination);
                lane.held = lane.held.saturating_sub(1);
                lane.ready.push_front(entry);
            } else {
                entry.order = self.take_order();
                self.push_back(entry);
            }
            promoted += 1;
        }
        promoted
    }

    /// When the earliest scheduled entry becomes due.
    pub fn next_due(&self) -> Option<Instant> {
        self.scheduled.peek().map(|Reverse(next)| next.due)
    }

    /// Entries waiting in lanes or on the timer.
    pub fn len(&self) -> usize {
        self.lanes.values().map(|lane| lane.ready.len()).sum::<usize>() + self.scheduled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `id` is waiting, scheduled or mid-attempt.
    pub fn contains(&self, id: EnvelopeId) -> bool {
        self.known.contains(&id)
    }

    /// Destinations currently checked out by a worker.
    pub fn checked_out(&self) -> usize {
        self.lanes.values().filter(|lane| lane.checked_out).count()
    }

    fn schedule(&mut self, entry: QueueEntry, due: Instant, to_front: bool) {
        if to_front {
            self.lane_mut(&entry.destination).held += 1;
        } else {
            self.tidy(&entry.destination);
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.scheduled.push(Reverse(Scheduled {
            due,
            seq,
            entry,
            to_front,
        }));
    }

    fn push_back(&mut self, entry: QueueEntry) {
        self.lane_mut(&entry.destination).ready.push_back(entry);
    }

    fn lane_mut(&mut self, destination: &str) -> &mut Lane {
        if !self.lanes.contains_key(destination) {
            self.rotation.push_back(destination.to_owned());
        }
        self.lanes.entry(destination.to_owned()).or_default()
    }

    fn take_order(&mut self) -> u64 {
        let order = self.next_order;
        self.next_order += 1;
        order
    }

    fn tidy(&mut self, destination: &str) {
        if self.lanes.get(destination).is_some_and(Lane::idle) {
            self.lanes.remove(destination);
            self.rotation.retain(|d| d != destination);
        }
    }
}
