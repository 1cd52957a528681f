use std::collections::{HashMap, VecDeque};
use parking_lot::Mutex;

use crate::common::types::FrameId;

/// Per-frame bookkeeping: the last K access timestamps and the evictable flag
struct FrameRecord {
    history: VecDeque<u64>,
    evictable: bool,
}

impl FrameRecord {
    fn new() -> Self {
        Self {
            history: VecDeque::new(),
            evictable: false,
        }
    }
}

struct LruKState {
    records: HashMap<FrameId, FrameRecord>,
    current_timestamp: u64,
    // Count of evictable frames
    curr_size: usize,
}

/// LRU-K page replacement policy.
///
/// The victim is the evictable frame whose K-th most recent access is oldest.
/// Frames with fewer than K recorded accesses are preferred over frames with
/// full history, ordered among themselves by their earliest access (classical
/// LRU). This separates cold from hot pages more sharply than plain LRU and
/// resists sequential flooding.
pub struct LruKReplacer {
    state: Mutex<LruKState>,
    replacer_size: usize,
    k: usize,
}

impl LruKReplacer {
    pub fn new(num_frames: usize, k: usize) -> Self {
        assert!(k > 0, "LRU-K requires k >= 1");
        Self {
            state: Mutex::new(LruKState {
                records: HashMap::with_capacity(num_frames),
                current_timestamp: 0,
                curr_size: 0,
            }),
            replacer_size: num_frames,
            k,
        }
    }

    /// Record an access to the given frame at the current logical timestamp.
    ///
    /// Unknown frames are registered unless the replacer is already tracking
    /// `replacer_size` frames, in which case the call is a no-op.
    pub fn record_access(&self, frame_id: FrameId) {
        let mut state = self.state.lock();

        if !state.records.contains_key(&frame_id) && state.records.len() == self.replacer_size {
            return;
        }

        let timestamp = state.current_timestamp;
        state.current_timestamp += 1;

        let record = state.records.entry(frame_id).or_insert_with(FrameRecord::new);
        if record.history.len() == self.k {
            record.history.pop_front();
        }
        record.history.push_back(timestamp);
    }

    /// Toggle whether a frame may be chosen as an eviction victim
    pub fn set_evictable(&self, frame_id: FrameId, evictable: bool) {
        let mut state = self.state.lock();
        let state = &mut *state;

        if let Some(record) = state.records.get_mut(&frame_id) {
            let was_evictable = record.evictable;
            record.evictable = evictable;
            if !was_evictable && evictable {
                state.curr_size += 1;
            } else if was_evictable && !evictable {
                state.curr_size -= 1;
            }
        }
    }

    /// Evict the frame with the oldest K-th-back access among evictable
    /// frames, removing it from the replacer. Returns `None` when no frame is
    /// evictable.
    pub fn evict(&self) -> Option<FrameId> {
        let mut state = self.state.lock();

        let mut victim: Option<FrameId> = None;
        for (&frame_id, record) in state.records.iter() {
            if !record.evictable {
                continue;
            }
            match victim {
                None => victim = Some(frame_id),
                Some(best) => {
                    if Self::evict_before(record, &state.records[&best], self.k) {
                        victim = Some(frame_id);
                    }
                }
            }
        }

        if let Some(frame_id) = victim {
            state.records.remove(&frame_id);
            state.curr_size -= 1;
        }
        victim
    }

    /// Remove a frame from the replacer entirely.
    ///
    /// Panics if the frame is tracked but not evictable: removing a pinned
    /// frame is a caller bug.
    pub fn remove(&self, frame_id: FrameId) {
        let mut state = self.state.lock();

        let Some(record) = state.records.get(&frame_id) else {
            return;
        };
        assert!(record.evictable, "removed a non-evictable frame: {frame_id}");
        state.records.remove(&frame_id);
        state.curr_size -= 1;
    }

    /// Number of evictable frames
    pub fn size(&self) -> usize {
        self.state.lock().curr_size
    }

    /// Whether `a` should be evicted before `b`.
    ///
    /// A frame with fewer than K samples always precedes a frame with full
    /// history; otherwise the frame with the older front timestamp (the
    /// K-th most recent access, or the earliest access when history is
    /// short) wins.
    fn evict_before(a: &FrameRecord, b: &FrameRecord, k: usize) -> bool {
        if a.history.len() < k && b.history.len() == k {
            return true;
        }
        if a.history.len() == k && b.history.len() < k {
            return false;
        }
        a.history.front() < b.history.front()
    }
}
