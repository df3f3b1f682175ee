//! Reassembly of segmented messages.
//!
//! Segments are keyed by message id and may arrive in any order. An entry is
//! complete once its terminal segment (the one without `SEGMENTED`) has been
//! seen and every index below it is present. The cache is bounded twice: by
//! entry count, evicting the least recently updated entry, and by age, so a
//! message whose remaining segments never arrive cannot pin memory.
//!
//! All time-dependent operations take `now` explicitly.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, Instant};

use bytes::Bytes;

/// One decrypted segment handed to the cache.
#[derive(Debug, Clone)]
pub struct Segment {
    pub msg_id: u32,
    pub index: u32,
    /// `true` when the frame did not carry `SEGMENTED`.
    pub terminal: bool,
    pub compressed: bool,
    pub payload: Bytes,
}

/// A fully reassembled message, segments joined in index order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completed {
    pub msg_id: u32,
    pub compressed: bool,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inserted {
    /// Stored; more segments are needed.
    Pending,
    /// The message is complete and queued for `take_complete`.
    Complete,
    /// The entry was discarded.
    Dropped(DropReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Accumulated payload exceeded the limit passed to `insert`.
    TooLarge { size: usize, limit: usize },
    /// Segment indices contradict the terminal segment.
    Inconsistent,
}

#[derive(Debug)]
struct Entry {
    segments: BTreeMap<u32, Bytes>,
    total_segments: Option<u32>,
    total_size: usize,
    compressed: bool,
    last_update: Instant,
    /// Tie-breaker for entries touched at the same instant.
    touch: u64,
}

impl Entry {
    fn new(now: Instant, touch: u64) -> Self {
        Self {
            segments: BTreeMap::new(),
            total_segments: None,
            total_size: 0,
            compressed: false,
            last_update: now,
            touch,
        }
    }

    fn is_complete(&self) -> bool {
        matches!(self.total_segments, Some(n) if self.segments.len() == n as usize)
    }

    /// Returns `false` if the segment contradicts what has been seen so far.
    fn absorb(&mut self, segment: Segment) -> bool {
        if let Some(total) = self.total_segments {
            if segment.index >= total {
                return false;
            }
        }
        if segment.terminal {
            let highest_seen = self.segments.keys().next_back().copied();
            if highest_seen.is_some_and(|h| h > segment.index) {
                return false;
            }
            let Some(total) = segment.index.checked_add(1) else {
                return false;
            };
            self.total_segments = Some(total);
        }

        self.compressed |= segment.compressed;
        self.total_size += segment.payload.len();
        if let Some(replaced) = self.segments.insert(segment.index, segment.payload) {
            self.total_size -= replaced.len();
        }
        true
    }

    fn assemble(self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total_size);
        for chunk in self.segments.values() {
            out.extend_from_slice(chunk);
        }
        out
    }
}

#[derive(Debug)]
pub struct ReassemblyCache {
    entries: HashMap<u32, Entry>,
    /// Recency index: oldest update first.
    by_age: BTreeMap<(Instant, u64), u32>,
    ready: VecDeque<u32>,
    max_entries: usize,
    next_touch: u64,
}

impl ReassemblyCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: HashMap::new(),
            by_age: BTreeMap::new(),
            ready: VecDeque::new(),
            max_entries: max_entries.max(1),
            next_touch: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, msg_id: u32) -> bool {
        self.entries.contains_key(&msg_id)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.by_age.clear();
        self.ready.clear();
    }

    /// Store a segment. `size_limit` caps the accumulated payload of the
    /// message; crossing it drops the whole entry.
    pub fn insert(&mut self, segment: Segment, size_limit: usize, now: Instant) -> Inserted {
        let msg_id = segment.msg_id;
        let touch = self.next_touch;
        self.next_touch += 1;

        let entry = self
            .entries
            .entry(msg_id)
            .or_insert_with(|| Entry::new(now, touch));
        self.by_age.remove(&(entry.last_update, entry.touch));
        entry.last_update = now;
        entry.touch = touch;
        self.by_age.insert((now, touch), msg_id);

        let outcome = if !entry.absorb(segment) {
            Inserted::Dropped(DropReason::Inconsistent)
        } else if entry.total_size > size_limit {
            Inserted::Dropped(DropReason::TooLarge {
                size: entry.total_size,
                limit: size_limit,
            })
        } else if entry.is_complete() {
            Inserted::Complete
        } else {
            Inserted::Pending
        };

        match outcome {
            Inserted::Dropped(_) => {
                self.remove(msg_id);
            }
            Inserted::Complete => {
                if !self.ready.contains(&msg_id) {
                    self.ready.push_back(msg_id);
                }
            }
            Inserted::Pending => {}
        }
        outcome
    }

    /// Remove and return the oldest complete message, if any.
    pub fn take_complete(&mut self) -> Option<Completed> {
        while let Some(msg_id) = self.ready.pop_front() {
            let complete = self.entries.get(&msg_id).is_some_and(Entry::is_complete);
            if !complete {
                continue;
            }
            let entry = self.remove(msg_id)?;
            return Some(Completed {
                msg_id,
                compressed: entry.compressed,
                payload: entry.assemble(),
            });
        }
        None
    }

    /// Evict least recently updated entries until the count bound holds.
    /// Returns the evicted message ids.
    pub fn evict_over_capacity(&mut self) -> Vec<u32> {
        let mut evicted = Vec::new();
        while self.entries.len() > self.max_entries {
            let Some((_, msg_id)) = self.by_age.pop_first() else {
                break;
            };
            self.drop_entry(msg_id);
            evicted.push(msg_id);
        }
        evicted
    }

    /// Evict incomplete entries not updated for longer than `max_age`.
    /// Complete messages wait for `take_complete` however old they are.
    pub fn sweep_stale(&mut self, now: Instant, max_age: Duration) -> Vec<u32> {
        let stale: Vec<((Instant, u64), u32)> = self
            .by_age
            .iter()
            .map(|(&slot, &msg_id)| (slot, msg_id))
            .take_while(|&((updated, _), _)| now.saturating_duration_since(updated) > max_age)
            .filter(|&(_, msg_id)| !self.entries.get(&msg_id).is_some_and(Entry::is_complete))
            .collect();

        let mut swept = Vec::with_capacity(stale.len());
        for (slot, msg_id) in stale {
            self.by_age.remove(&slot);
            self.drop_entry(msg_id);
            swept.push(msg_id);
        }
        swept
    }

    fn remove(&mut self, msg_id: u32) -> Option<Entry> {
        let entry = self.entries.remove(&msg_id)?;
        self.by_age.remove(&(entry.last_update, entry.touch));
        Some(entry)
    }

    /// Drop an entry whose recency slot was already popped.
    fn drop_entry(&mut self, msg_id: u32) {
        self.entries.remove(&msg_id);
        self.ready.retain(|id| *id != msg_id);
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
