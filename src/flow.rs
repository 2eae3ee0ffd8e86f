//! Flow control against the device's point buffer.
//!
//! The DAC reports its buffer fullness in every response. Between responses
//! the buffer drains at the playback rate, so the controller extrapolates from
//! the last accepted report to decide whether another frame fits.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::protocols::ether_dream::dac::{Playback, Status};

/// A status snapshot taken from one DAC response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusReport {
    /// Monotonically increasing per connection.
    pub sequence: u64,
    pub status: Status,
    pub received_at: Instant,
}

/// Buffer-fullness estimate and readiness predicate for one connection.
#[derive(Debug, Clone)]
pub struct FlowController {
    capacity: usize,
    frame_points: usize,
    point_rate: u32,
    fullness: usize,
    playing: bool,
    reported_at: Option<Instant>,
    last_sequence: Option<u64>,
    committed_unsent: usize,
    staged: bool,
}

impl FlowController {
    /// `capacity` is the device buffer size in points.
    pub fn new(capacity: u16, frame_points: usize, point_rate: u32) -> Self {
        Self {
            capacity: capacity as usize,
            frame_points,
            point_rate,
            fullness: 0,
            playing: false,
            reported_at: None,
            last_sequence: None,
            committed_unsent: 0,
            staged: false,
        }
    }

    /// Fold in a status report. Stale and duplicate reports are ignored.
    ///
    /// Returns whether the report was accepted.
    pub fn observe(&mut self, report: StatusReport) -> bool {
        if let Some(last) = self.last_sequence {
            if report.sequence <= last {
                return false;
            }
        }
        self.last_sequence = Some(report.sequence);
        self.fullness = report.status.buffer_fullness as usize;
        self.playing = report.status.playback == Playback::Playing;
        if self.playing && report.status.point_rate > 0 {
            self.point_rate = report.status.point_rate;
        }
        self.reported_at = Some(report.received_at);
        true
    }

    /// Device fullness extrapolated to `now`.
    pub fn estimated_fullness(&self, now: Instant) -> usize {
        let Some(reported_at) = self.reported_at else {
            return self.fullness;
        };
        if !self.playing {
            return self.fullness;
        }
        let elapsed = now.saturating_duration_since(reported_at).as_secs_f64();
        let drained = (elapsed * self.point_rate as f64) as usize;
        self.fullness.saturating_sub(drained)
    }

    /// Points that could be queued at `now` without overflowing the device.
    pub fn headroom(&self, now: Instant) -> usize {
        self.capacity
            .saturating_sub(1)
            .saturating_sub(self.estimated_fullness(now))
            .saturating_sub(self.committed_unsent)
    }

    /// True when no frame is staged and a whole frame fits.
    pub fn is_ready(&self, now: Instant) -> bool {
        !self.staged && self.headroom(now) >= self.frame_points
    }

    /// How long until `is_ready` turns true if nothing else changes.
    ///
    /// `None` when waiting on the worker rather than on the device draining.
    pub fn time_until_ready(&self, now: Instant) -> Option<Duration> {
        if self.is_ready(now) {
            return Some(Duration::ZERO);
        }
        if self.staged || !self.playing || self.point_rate == 0 {
            return None;
        }
        let limit = self.capacity.saturating_sub(1);
        let needed = self.frame_points + self.committed_unsent;
        let fullness = self.estimated_fullness(now);
        if needed > limit {
            return None;
        }
        let excess = (fullness + needed).saturating_sub(limit);
        Some(Duration::from_secs_f64(
            excess as f64 / self.point_rate as f64,
        ))
    }

    /// Points of the active pass not yet transmitted.
    pub fn set_committed_unsent(&mut self, points: usize) {
        self.committed_unsent = points;
    }

    pub fn committed_unsent(&self) -> usize {
        self.committed_unsent
    }

    pub fn set_staged(&mut self, staged: bool) {
        self.staged = staged;
    }

    pub fn is_staged(&self) -> bool {
        self.staged
    }

    pub fn set_point_rate(&mut self, point_rate: u32) {
        self.point_rate = point_rate;
    }

    pub fn point_rate(&self) -> u32 {
        self.point_rate
    }

    pub fn frame_points(&self) -> usize {
        self.frame_points
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn last_sequence(&self) -> Option<u64> {
        self.last_sequence
    }
}

/// Identifies one registration in a [`ReadyQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReadyToken(u64);

/// FIFO of one-shot readiness callbacks.
///
/// Entries are moved out before they run, so each fires at most once.
pub struct ReadyQueue<T> {
    entries: VecDeque<(ReadyToken, T)>,
    next_id: u64,
}

impl<T> ReadyQueue<T> {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            next_id: 0,
        }
    }

    pub fn register(&mut self, callback: T) -> ReadyToken {
        let token = ReadyToken(self.next_id);
        self.next_id += 1;
        self.entries.push_back((token, callback));
        token
    }

    /// Remove the oldest registration.
    pub fn pop(&mut self) -> Option<(ReadyToken, T)> {
        self.entries.pop_front()
    }

    /// Remove a registration before it fires.
    pub fn cancel(&mut self, token: ReadyToken) -> Option<T> {
        let pos = self.entries.iter().position(|(t, _)| *t == token)?;
        self.entries.remove(pos).map(|(_, cb)| cb)
    }

    /// Drop every registration. Returns how many were dropped.
    pub fn clear(&mut self) -> usize {
        let n = self.entries.len();
        self.entries.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T> Default for ReadyQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for ReadyQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadyQueue")
            .field("len", &self.entries.len())
            .finish()
    }
}
