//! Per-source acknowledgment watermark.
//!
//! Every operation handed to a worker is registered here first, under its
//! (worker, source) lane. A lane is a FIFO of in-flight positions; an entry
//! leaves the front only once all its operations were applied and the
//! worker's transaction committed. The position safe to acknowledge for a
//! source is the smallest of:
//!
//! - the position the source itself reported as committed, and
//! - for each lane of that source, one before its oldest in-flight position.
//!
//! The result never goes backwards.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use tracing::trace;

use crate::lsn::Lsn;

/// A replicated source: database name and source identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceKey {
    pub database: String,
    pub sid: String,
}

impl SourceKey {
    pub fn new(database: impl Into<String>, sid: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            sid: sid.into(),
        }
    }
}

#[derive(Debug)]
struct Pending {
    lsn: Lsn,
    /// Dispatched, not yet taken by the worker.
    queued: u32,
    /// Taken by the worker inside its open transaction.
    applied: u32,
}

#[derive(Debug, Default)]
struct Lane {
    pending: VecDeque<Pending>,
    written: Lsn,
    committed: Lsn,
}

impl Lane {
    fn bound(&self) -> Option<Lsn> {
        self.pending.front().map(|p| p.lsn.prev())
    }
}

#[derive(Debug, Default)]
struct State {
    lanes: HashMap<(usize, SourceKey), Lane>,
    source_committed: HashMap<SourceKey, Lsn>,
    safe: HashMap<SourceKey, Lsn>,
}

/// Watermark positions for one (worker, source) lane, for inspection.
#[cfg(test)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaneStatus {
    pub written: Lsn,
    pub committed: Lsn,
    pub in_flight: usize,
}

#[derive(Debug, Default)]
pub struct WatermarkTracker {
    state: Mutex<State>,
}

impl WatermarkTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an operation at `lsn` before it is sent to `worker`.
    pub fn dispatch(&self, worker: usize, key: &SourceKey, lsn: Lsn) {
        let mut st = self.state.lock();
        let lane = st.lanes.entry((worker, key.clone())).or_default();
        match lane.pending.back_mut() {
            Some(last) if last.lsn == lsn => last.queued += 1,
            _ => lane.pending.push_back(Pending {
                lsn,
                queued: 1,
                applied: 0,
            }),
        }
    }

    /// `worker` finished with an operation at `lsn`, inside its current
    /// transaction. Dropped operations count as finished.
    pub fn applied(&self, worker: usize, key: &SourceKey, lsn: Lsn) {
        let mut st = self.state.lock();
        let Some(lane) = st.lanes.get_mut(&(worker, key.clone())) else {
            return;
        };
        let Some(p) = lane.pending.iter_mut().find(|p| p.queued > 0 && p.lsn == lsn) else {
            // registered before a reset of this source
            return;
        };
        p.queued -= 1;
        p.applied += 1;
        lane.written = lane.written.max(lsn);
    }

    /// `worker` committed its transaction.
    pub fn commit(&self, worker: usize) {
        let mut st = self.state.lock();
        for ((w, key), lane) in st.lanes.iter_mut() {
            if *w != worker {
                continue;
            }
            lane.committed = lane.written;
            while lane.pending.front().is_some_and(|p| p.queued == 0) {
                lane.pending.pop_front();
            }
            for p in lane.pending.iter_mut() {
                p.applied = 0;
            }
            trace!(worker, database = %key.database, sid = %key.sid, committed = %lane.committed, "lane committed");
        }
    }

    /// `worker` lost its transaction. What it had applied stays in flight,
    /// holding the watermark back until the source is reset.
    pub fn abandon(&self, worker: usize) {
        let mut st = self.state.lock();
        for ((w, _), lane) in st.lanes.iter_mut() {
            if *w != worker {
                continue;
            }
            lane.written = lane.committed;
            for p in lane.pending.iter_mut() {
                p.queued += p.applied;
                p.applied = 0;
            }
        }
    }

    /// The source reported `lsn` as a committed transaction boundary.
    pub fn source_committed(&self, key: &SourceKey, lsn: Lsn) {
        let mut st = self.state.lock();
        let c = st.source_committed.entry(key.clone()).or_default();
        *c = (*c).max(lsn);
    }

    /// Forget in-flight positions of `key`; a new session restarts from the
    /// slot's confirmed position. The acknowledged watermark is kept.
    pub fn reset_source(&self, key: &SourceKey) {
        let mut st = self.state.lock();
        st.lanes.retain(|(_, k), _| k != key);
        st.source_committed.remove(key);
    }

    /// Position safe to acknowledge for `key`; zero while unknown.
    ///
    /// With nothing in flight this is the source's committed position, which
    /// may lie past anything a lane applied (wholly filtered transactions).
    pub fn safe_lsn(&self, key: &SourceKey) -> Lsn {
        let mut st = self.state.lock();
        let source = st.source_committed.get(key).copied().unwrap_or(Lsn::ZERO);
        let candidate = st
            .lanes
            .iter()
            .filter(|((_, k), _)| k == key)
            .filter_map(|(_, lane)| lane.bound())
            .fold(source, Lsn::min);

        let safe = st.safe.entry(key.clone()).or_default();
        *safe = (*safe).max(candidate);
        *safe
    }

    #[cfg(test)]
    pub fn lane(&self, worker: usize, key: &SourceKey) -> Option<LaneStatus> {
        let st = self.state.lock();
        st.lanes.get(&(worker, key.clone())).map(|l| LaneStatus {
            written: l.written,
            committed: l.committed,
            in_flight: l.pending.iter().map(|p| (p.queued + p.applied) as usize).sum(),
        })
    }
}
