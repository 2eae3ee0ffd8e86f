//! Link worker: the per-connection thread that owns the TCP stream.
//!
//! The handle stages at most one frame in the shared [`LinkState`]; the worker
//! picks it up once the active frame has played all its passes, feeds the
//! device in chunks that fit its buffer, and publishes every status it gets
//! back so the handle can decide readiness without touching the network.

use std::io;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};

use crate::discovery::lock;
use crate::error::{Error, Result};
use crate::flow::{FlowController, StatusReport};
use crate::protocols::ether_dream::dac::stream::{CommunicationError, Nak, Stream};
use crate::protocols::ether_dream::dac::{LightEngine, Playback, Status};
use crate::protocols::ether_dream::protocol::DacPoint;
use crate::types::{FrameBuffer, Repeat};

/// Longest wait for any single acknowledgment.
pub(crate) const ACK_TIMEOUT: Duration = Duration::from_secs(1);

/// Ping the device after this long without traffic.
const PING_INTERVAL: Duration = Duration::from_millis(250);

/// The device starts playback once it holds this many points (or the whole frame).
const MIN_POINTS_BEFORE_BEGIN: usize = 500;

/// Consecutive NAKs other than `Full` before the link faults.
const MAX_CONSECUTIVE_NAKS: u32 = 3;

/// Smallest chunk worth a round trip unless it finishes the pass.
const MIN_CHUNK_POINTS: usize = 64;

/// State shared between a [`crate::Dac`] handle and its link worker.
pub(crate) struct Shared {
    pub state: Mutex<LinkState>,
    /// Signalled when the worker has something new to do.
    pub work: Condvar,
    /// Signalled when readiness may have changed or the link faulted.
    pub ready: Condvar,
}

pub(crate) struct LinkState {
    pub flow: FlowController,
    pub staged: Option<StagedFrame>,
    pub retired: Vec<FrameBuffer>,
    pub status: Status,
    pub fault: Option<String>,
    pub stop_requested: bool,
    pub shutdown: bool,
}

pub(crate) struct StagedFrame {
    pub buffer: FrameBuffer,
    pub point_rate: u32,
    pub repeat: Repeat,
}

impl Shared {
    pub fn new(flow: FlowController, status: Status) -> Self {
        Self {
            state: Mutex::new(LinkState {
                flow,
                staged: None,
                retired: Vec::new(),
                status,
                fault: None,
                stop_requested: false,
                shutdown: false,
            }),
            work: Condvar::new(),
            ready: Condvar::new(),
        }
    }
}

/// The frame currently being transmitted.
struct ActiveFrame {
    buffer: FrameBuffer,
    point_rate: u32,
    repeat: Repeat,
    /// Completed passes.
    passes: u32,
    /// Next point of the current pass.
    cursor: usize,
}

impl ActiveFrame {
    fn new(staged: StagedFrame) -> Self {
        Self {
            buffer: staged.buffer,
            point_rate: staged.point_rate,
            repeat: staged.repeat,
            passes: 0,
            cursor: 0,
        }
    }

    /// All requested passes have been sent.
    fn exhausted(&self) -> bool {
        match self.repeat {
            Repeat::Count(n) => self.passes >= n,
            Repeat::Forever => false,
        }
    }

    /// A staged frame may replace this one now.
    fn can_yield(&self) -> bool {
        self.cursor == 0
            && match self.repeat {
                Repeat::Count(n) => self.passes >= n,
                Repeat::Forever => self.passes > 0,
            }
    }

    /// Points left in the current pass.
    fn remaining(&self) -> usize {
        if self.exhausted() {
            0
        } else {
            self.buffer.len() - self.cursor
        }
    }

    /// Points the device must still take before a staged frame can follow.
    fn committed(&self) -> usize {
        if self.can_yield() {
            0
        } else {
            self.remaining()
        }
    }

    /// Replaying a looped frame.
    fn looping(&self) -> bool {
        self.repeat == Repeat::Forever && self.passes > 0
    }

    fn advance(&mut self, sent: usize) {
        self.cursor += sent;
        if self.cursor >= self.buffer.len() {
            self.cursor = 0;
            self.passes = self.passes.saturating_add(1);
        }
    }
}

enum Control {
    Shutdown,
    Stop,
    /// `whole_passes`: send the active frame one complete pass at a time.
    Proceed { free: usize, whole_passes: bool },
}

pub(crate) struct LinkWorker {
    stream: Stream,
    shared: Arc<Shared>,
    active: Option<ActiveFrame>,
    /// Rate the device was last told to play at.
    device_rate: Option<u32>,
    estop_cleared: bool,
    /// Points have been accepted since the last prepare.
    primed: bool,
    naks: u32,
    last_io: Instant,
}

impl LinkWorker {
    pub fn new(stream: Stream, shared: Arc<Shared>) -> Self {
        Self {
            stream,
            shared,
            active: None,
            device_rate: None,
            estop_cleared: false,
            primed: false,
            naks: 0,
            last_io: Instant::now(),
        }
    }

    /// Thread entry point. Returns once shut down or faulted.
    pub fn run(mut self) {
        let mac = self.stream.dac().mac_address;
        debug!("Link worker for {} started", mac);
        loop {
            match self.step() {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    warn!("Ether Dream {} faulted: {}", mac, e);
                    let _ = self.stream.shutdown();
                    let mut st = lock(&self.shared.state);
                    st.fault = Some(fault_cause(&e));
                    drop(st);
                    self.shared.ready.notify_all();
                    return;
                }
            }
        }
        debug!("Link worker for {} stopped", mac);
    }

    /// One scheduling decision. `Ok(false)` means shut down.
    fn step(&mut self) -> Result<bool> {
        match self.sync_shared() {
            Control::Shutdown => {
                let _ = self.stream.queue_commands().stop().submit();
                let _ = self.stream.shutdown();
                return Ok(false);
            }
            Control::Stop => {
                self.stop_playback()?;
                return Ok(true);
            }
            Control::Proceed { free, whole_passes } => self.proceed(free, whole_passes)?,
        }
        Ok(true)
    }

    /// Exchange state with the handle: pick up staged frames and control
    /// requests, retire finished buffers, and refresh the committed count.
    fn sync_shared(&mut self) -> Control {
        let mut st = lock(&self.shared.state);
        if st.shutdown {
            return Control::Shutdown;
        }
        if st.stop_requested {
            st.stop_requested = false;
            if let Some(active) = self.active.take() {
                st.retired.push(active.buffer);
            }
            if let Some(staged) = st.staged.take() {
                st.retired.push(staged.buffer);
            }
            st.flow.set_staged(false);
            st.flow.set_committed_unsent(0);
            drop(st);
            self.shared.ready.notify_all();
            return Control::Stop;
        }

        let can_take = self.active.as_ref().map_or(true, ActiveFrame::can_yield);
        if can_take {
            if let Some(staged) = st.staged.take() {
                if let Some(old) = self.active.take() {
                    st.retired.push(old.buffer);
                }
                trace!(
                    "Taking staged frame: {} points at {} pps",
                    staged.buffer.len(),
                    staged.point_rate
                );
                self.active = Some(ActiveFrame::new(staged));
                st.flow.set_staged(false);
            } else if self.active.as_ref().map_or(false, ActiveFrame::exhausted) {
                if let Some(old) = self.active.take() {
                    st.retired.push(old.buffer);
                }
            }
        }
        let committed = self.active.as_ref().map_or(0, ActiveFrame::committed);
        st.flow.set_committed_unsent(committed);

        let now = Instant::now();
        let limit = st.flow.capacity().saturating_sub(1);
        // Looped passes go out whole and leave a frame of device buffer
        // free, so a replacement can be staged at any time.
        let whole_passes = self.active.as_ref().map_or(false, |active| {
            active.looping() && active.buffer.len() + st.flow.frame_points() <= limit
        });
        let reserve = if whole_passes {
            st.flow.frame_points()
        } else {
            0
        };
        let free = limit
            .saturating_sub(st.flow.estimated_fullness(now))
            .saturating_sub(reserve);
        drop(st);
        self.shared.ready.notify_all();
        Control::Proceed { free, whole_passes }
    }

    fn proceed(&mut self, free: usize, whole_passes: bool) -> Result<()> {
        let status = self.stream.dac().status;

        match status.light_engine {
            LightEngine::EmergencyStop => return self.clear_emergency_stop(),
            LightEngine::Warmup | LightEngine::Cooldown => return self.idle(PING_INTERVAL),
            LightEngine::Ready => {}
        }

        if self.should_begin(&status) {
            return self.begin();
        }

        let remaining = self.active.as_ref().map_or(0, ActiveFrame::remaining);
        if remaining == 0 {
            return self.idle(PING_INTERVAL);
        }

        if status.needs_prepare() {
            debug!("Device idle, preparing stream");
            self.device_rate = None;
            self.primed = false;
            let result = self.stream.queue_commands().prepare_stream().submit();
            self.after_submit(result)?;
            return Ok(());
        }

        let wanted = if whole_passes {
            remaining
        } else {
            remaining.min(MIN_CHUNK_POINTS)
        };
        if free < wanted {
            let rate = self.device_rate.unwrap_or(1).max(1) as f64;
            let drain = Duration::from_secs_f64((wanted - free) as f64 / rate);
            return self.idle(drain.clamp(Duration::from_millis(1), PING_INTERVAL));
        }

        self.send_chunk(free.min(remaining).min(u16::MAX as usize - 1))
    }

    fn send_chunk(&mut self, count: usize) -> Result<()> {
        let Some(active) = self.active.as_ref() else {
            return Ok(());
        };
        let start = active.cursor;
        let rate = active.point_rate;
        let mut points: Vec<DacPoint> = active.buffer[start..start + count]
            .iter()
            .map(DacPoint::from)
            .collect();

        let playing = self.stream.dac().status.playback == Playback::Playing;
        let change_rate = playing && start == 0 && self.device_rate != Some(rate);

        let mut queue = self.stream.queue_commands();
        if change_rate {
            trace!("Queueing rate change to {} pps", rate);
            points[0].control |= DacPoint::CONTROL_CHANGE_RATE;
            queue = queue.point_rate(rate);
        }
        trace!("Sending {} points", count);
        let result = queue.data(points).submit();

        if self.after_submit(result)? {
            self.primed = true;
            if change_rate {
                self.device_rate = Some(rate);
            }
            if let Some(active) = self.active.as_mut() {
                active.advance(count);
            }
        }
        Ok(())
    }

    /// Begin once the device is prepared and holds enough to avoid an
    /// immediate underflow, or holds everything there is to send.
    fn should_begin(&self, status: &Status) -> bool {
        if !self.primed || status.playback != Playback::Prepared || status.buffer_fullness == 0 {
            return false;
        }
        let fullness = status.buffer_fullness as usize;
        let capacity = self.stream.dac().buffer_capacity as usize;
        match self.active.as_ref() {
            Some(active) if active.remaining() > 0 => {
                let threshold = MIN_POINTS_BEFORE_BEGIN
                    .min(active.buffer.len())
                    .min(capacity.saturating_sub(1));
                fullness >= threshold
            }
            _ => true,
        }
    }

    fn begin(&mut self) -> Result<()> {
        let rate = match self.active.as_ref() {
            Some(active) => active.point_rate,
            None => match self.device_rate {
                Some(rate) => rate,
                None => lock(&self.shared.state).flow.point_rate(),
            },
        };
        debug!("Beginning playback at {} pps", rate);
        let result = self.stream.queue_commands().begin(0, rate).submit();
        if self.after_submit(result)? {
            self.device_rate = Some(rate);
        }
        Ok(())
    }

    fn clear_emergency_stop(&mut self) -> Result<()> {
        if self.estop_cleared {
            return Err(Error::Faulted(
                "DAC stuck in emergency stop - check hardware interlock".into(),
            ));
        }
        info!("Clearing emergency stop");
        self.estop_cleared = true;
        let result = self
            .stream
            .queue_commands()
            .clear_emergency_stop()
            .ping()
            .submit();
        self.after_submit(result)?;
        Ok(())
    }

    fn stop_playback(&mut self) -> Result<()> {
        debug!("Stopping playback");
        self.device_rate = None;
        self.primed = false;
        let result = self.stream.queue_commands().stop().submit();
        // A stop sent to an idle device is NAKed; that is still stopped.
        match result {
            Err(e) if e.nak().is_some() => {
                self.last_io = Instant::now();
                self.publish_status();
                Ok(())
            }
            other => self.after_submit(other).map(|_| ()),
        }
    }

    /// Wait for new work; ping if the link has been quiet too long.
    fn idle(&mut self, timeout: Duration) -> Result<()> {
        {
            let st = lock(&self.shared.state);
            let can_take = self.active.as_ref().map_or(true, ActiveFrame::can_yield);
            let pending = st.shutdown || st.stop_requested || (can_take && st.staged.is_some());
            if !pending {
                let _ = self
                    .shared
                    .work
                    .wait_timeout(st, timeout)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        }
        if self.last_io.elapsed() >= PING_INTERVAL {
            trace!("Pinging idle device");
            let result = self.stream.queue_commands().ping().submit();
            self.after_submit(result)?;
        }
        Ok(())
    }

    /// Classify a submit outcome. `Ok(true)` when acknowledged, `Ok(false)`
    /// for a tolerated NAK.
    fn after_submit(&mut self, result: std::result::Result<(), CommunicationError>) -> Result<bool> {
        self.last_io = Instant::now();
        let acked = match result {
            Ok(()) => {
                self.naks = 0;
                true
            }
            Err(e) => match e.nak() {
                Some(Nak::Full) => {
                    debug!("DAC buffer full, backing off");
                    false
                }
                Some(nak) => {
                    self.naks += 1;
                    warn!("DAC NAK {:?} ({} in a row)", nak, self.naks);
                    if self.naks >= MAX_CONSECUTIVE_NAKS {
                        return Err(Error::Faulted(format!(
                            "{} consecutive NAKs, last: {}",
                            self.naks, e
                        )));
                    }
                    false
                }
                None => return Err(e.into()),
            },
        };
        self.publish_status();
        Ok(acked)
    }

    fn publish_status(&mut self) {
        let status = self.stream.dac().status;
        let report = StatusReport {
            sequence: self.stream.responses_received(),
            status,
            received_at: Instant::now(),
        };
        let committed = self.active.as_ref().map_or(0, ActiveFrame::committed);
        let mut st = lock(&self.shared.state);
        st.flow.observe(report);
        st.flow.set_committed_unsent(committed);
        st.status = status;
        drop(st);
        self.shared.ready.notify_all();
    }
}

fn fault_cause(err: &Error) -> String {
    match err {
        Error::Io(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => {
            format!("no acknowledgment within {:?}", ACK_TIMEOUT)
        }
        Error::Faulted(cause) => cause.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChannelPoint;

    fn frame(len: usize, repeat: Repeat) -> ActiveFrame {
        ActiveFrame::new(StagedFrame {
            buffer: FrameBuffer::from(vec![ChannelPoint::default(); len]),
            point_rate: 30_000,
            repeat,
        })
    }

    #[test]
    fn test_counted_frame_yields_after_all_passes() {
        let mut f = frame(400, Repeat::Count(2));
        assert!(!f.can_yield());
        assert_eq!(f.committed(), 400);

        f.advance(300);
        assert_eq!(f.remaining(), 100);
        f.advance(100);
        assert_eq!(f.passes, 1);
        assert!(!f.can_yield());
        assert_eq!(f.committed(), 400);

        f.advance(400);
        assert!(f.exhausted());
        assert!(f.can_yield());
        assert_eq!(f.remaining(), 0);
        assert_eq!(f.committed(), 0);
    }

    #[test]
    fn test_looping_frame_yields_at_pass_boundary() {
        let mut f = frame(100, Repeat::Forever);
        assert!(!f.can_yield());
        assert!(!f.looping());
        f.advance(50);
        assert!(!f.can_yield());
        assert_eq!(f.committed(), 50);
        f.advance(50);
        assert!(f.can_yield());
        assert!(!f.exhausted());
        assert!(f.looping());
        // keeps looping when nothing replaces it
        assert_eq!(f.remaining(), 100);
        assert_eq!(f.committed(), 0);
    }

    #[test]
    fn test_ack_timeout_is_reported_plainly() {
        let err = Error::Io(io::Error::new(io::ErrorKind::WouldBlock, "read"));
        assert_eq!(fault_cause(&err), "no acknowledgment within 1s");
        assert_eq!(fault_cause(&Error::Faulted("x".into())), "x");
    }
}
