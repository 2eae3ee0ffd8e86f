//! Device handle: connection lifecycle and non-blocking frame submission.
//!
//! A [`Dac`] owns one connection to one Ether Dream. Writes never block on the
//! network: the frame is staged for the handle's link worker thread, which
//! feeds it to the device while the caller computes the next one. Readiness
//! callbacks registered with [`Dac::when_ready`] run on the caller's thread
//! inside [`Dac::dispatch`] or [`Dac::run`].

use std::sync::{Arc, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::discovery::{lock, DeviceDescriptor};
use crate::error::{ConnectError, Error, Result};
use crate::flow::{FlowController, ReadyQueue, ReadyToken, StatusReport};
use crate::protocols::ether_dream::dac::stream::{self, CommunicationError};
use crate::protocols::ether_dream::dac::Status;
use crate::types::{FrameBuffer, HandleState, Repeat, StreamConfig};
use crate::worker::{LinkWorker, Shared, StagedFrame, ACK_TIMEOUT};

/// Highest protocol revision this crate speaks.
pub const MAX_PROTOCOL_VERSION: u8 = 1;

/// How long `run()` blocks in each dispatch round.
const RUN_SLICE: Duration = Duration::from_millis(100);

/// A one-shot readiness callback.
pub type ReadyCallback = Box<dyn FnOnce(&mut Dac) -> Result<()> + Send + 'static>;

/// Why `run()` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunExit {
    /// The handle was closed, usually from inside a callback.
    Closed,
    /// No callbacks remain registered.
    Idle,
}

struct Link {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl Link {
    fn shutdown(&mut self) {
        {
            let mut st = lock(&self.shared.state);
            st.shutdown = true;
        }
        self.shared.work.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Handle to one Ether Dream.
///
/// Created by [`crate::find_first_dac`] or [`Dac::new`] in the
/// `Disconnected` state. Closed on drop.
pub struct Dac {
    descriptor: DeviceDescriptor,
    config: StreamConfig,
    state: HandleState,
    link: Option<Link>,
    callbacks: ReadyQueue<ReadyCallback>,
    fault: Option<String>,
}

impl Dac {
    pub fn new(descriptor: DeviceDescriptor, config: StreamConfig) -> Self {
        Self {
            descriptor,
            config,
            state: HandleState::Disconnected,
            link: None,
            callbacks: ReadyQueue::new(),
            fault: None,
        }
    }

    /// Open the command connection and start the link worker.
    ///
    /// Does nothing if already connected. A failed attempt leaves the handle
    /// `Faulted`; calling `connect()` again retries.
    pub fn connect(&mut self) -> Result<()> {
        match self.state() {
            HandleState::Closed => return Err(Error::Closed),
            HandleState::Connected | HandleState::Streaming => return Ok(()),
            HandleState::Disconnected | HandleState::Connecting | HandleState::Faulted => {}
        }
        self.reap_link();
        self.config.validate()?;
        self.check_capabilities()?;

        let version = self.descriptor.protocol_version;
        if version > MAX_PROTOCOL_VERSION {
            return Err(self.connect_failed(ConnectError::VersionMismatch {
                reported: version,
                supported: MAX_PROTOCOL_VERSION,
            }));
        }

        self.state = HandleState::Connecting;
        let mac = self.descriptor.mac_address;
        let addr = self.descriptor.control_addr;
        info!("Connecting to Ether Dream {} at {}", mac, addr);
        let result = stream::connect_timeout(
            self.descriptor.broadcast(),
            addr,
            self.config.connect_timeout(),
        );
        let stream = match result {
            Ok(stream) => stream,
            Err(CommunicationError::Io(e)) => {
                return Err(self.connect_failed(ConnectError::from_io(e)))
            }
            Err(e) => {
                let err = Error::from(e);
                self.mark_faulted(err.to_string());
                return Err(err);
            }
        };

        let status = stream.dac().status;
        if status.protocol > MAX_PROTOCOL_VERSION {
            let _ = stream.shutdown();
            return Err(self.connect_failed(ConnectError::VersionMismatch {
                reported: status.protocol,
                supported: MAX_PROTOCOL_VERSION,
            }));
        }
        if let Err(e) = stream.set_timeout(Some(ACK_TIMEOUT)) {
            return Err(self.connect_failed(ConnectError::Io(e)));
        }

        let mut flow = FlowController::new(
            stream.dac().buffer_capacity,
            self.config.points_per_frame,
            self.config.points_per_second,
        );
        flow.observe(StatusReport {
            sequence: stream.responses_received(),
            status,
            received_at: Instant::now(),
        });

        let shared = Arc::new(Shared::new(flow, status));
        let worker = LinkWorker::new(stream, Arc::clone(&shared));
        let handle = match thread::Builder::new()
            .name(format!("etherdream-{}", mac))
            .spawn(move || worker.run())
        {
            Ok(handle) => handle,
            Err(e) => return Err(self.connect_failed(ConnectError::Io(e))),
        };

        self.link = Some(Link {
            shared,
            worker: Some(handle),
        });
        self.fault = None;
        self.state = HandleState::Connected;
        info!("Connected to Ether Dream {}", mac);
        Ok(())
    }

    fn check_capabilities(&self) -> Result<()> {
        let d = &self.descriptor;
        if self.config.points_per_frame >= d.buffer_capacity as usize {
            return Err(Error::invalid_config(format!(
                "points_per_frame {} does not fit the device buffer of {}",
                self.config.points_per_frame, d.buffer_capacity
            )));
        }
        if self.config.points_per_second > d.max_point_rate {
            return Err(Error::invalid_config(format!(
                "points_per_second {} exceeds the device maximum of {}",
                self.config.points_per_second, d.max_point_rate
            )));
        }
        Ok(())
    }

    fn connect_failed(&mut self, err: ConnectError) -> Error {
        warn!(
            "Connecting to Ether Dream {} failed: {}",
            self.descriptor.mac_address, err
        );
        self.mark_faulted(err.to_string());
        Error::Connect(err)
    }

    /// Stage a frame for playback and return immediately.
    ///
    /// Fails with [`Error::Busy`] unless [`Dac::is_ready`] holds. The buffer
    /// comes back through [`Dac::reclaim_buffer`] once it has been played, or
    /// straight away when the write was refused as busy.
    pub fn write(&mut self, buffer: FrameBuffer, point_rate: u32, repeat: Repeat) -> Result<()> {
        let shared = self.live_link()?;
        if buffer.is_empty() {
            return Err(Error::invalid_config("cannot write an empty frame"));
        }
        if repeat == Repeat::Count(0) {
            return Err(Error::invalid_config("repeat count must be at least 1"));
        }
        if point_rate == 0 || point_rate > self.descriptor.max_point_rate {
            return Err(Error::invalid_config(format!(
                "point rate {} outside 1..={}",
                point_rate, self.descriptor.max_point_rate
            )));
        }
        if buffer.len() >= u16::MAX as usize {
            return Err(Error::invalid_config(format!(
                "frame of {} points is too large",
                buffer.len()
            )));
        }

        {
            let mut st = lock(&shared.state);
            if !st.flow.is_ready(Instant::now()) {
                st.retired.push(buffer);
                return Err(Error::Busy);
            }
            st.staged = Some(StagedFrame {
                buffer,
                point_rate,
                repeat,
            });
            st.flow.set_staged(true);
        }
        shared.work.notify_all();
        self.state = HandleState::Streaming;
        Ok(())
    }

    /// Whether a `write` would be accepted right now.
    pub fn is_ready(&self) -> bool {
        if !self.state.is_writable() {
            return false;
        }
        let Some(link) = self.link.as_ref() else {
            return false;
        };
        let st = lock(&link.shared.state);
        st.fault.is_none() && st.flow.is_ready(Instant::now())
    }

    /// Register a one-shot callback to run once the handle is ready.
    ///
    /// Callbacks only run inside [`Dac::dispatch`] or [`Dac::run`], on the
    /// calling thread.
    pub fn when_ready<F>(&mut self, callback: F) -> Result<ReadyToken>
    where
        F: FnOnce(&mut Dac) -> Result<()> + Send + 'static,
    {
        self.ensure_open()?;
        Ok(self.callbacks.register(Box::new(callback)))
    }

    /// Drop a registration before it fires. Returns whether it was pending.
    pub fn cancel_ready(&mut self, token: ReadyToken) -> bool {
        self.callbacks.cancel(token).is_some()
    }

    /// Number of callbacks waiting for readiness.
    pub fn pending_callbacks(&self) -> usize {
        self.callbacks.len()
    }

    /// Wait up to `timeout` for readiness and fire pending callbacks.
    ///
    /// Callbacks fire one at a time in registration order, each only once
    /// the handle is ready again. Callbacks registered while dispatching wait
    /// for the next call. Returns how many fired. A closed or faulted handle
    /// is an error even with nothing registered.
    pub fn dispatch(&mut self, timeout: Duration) -> Result<usize> {
        self.ensure_open()?;
        let deadline = Instant::now() + timeout;
        let batch = self.callbacks.len();
        let mut fired = 0;

        while fired < batch {
            // A callback may have closed the handle.
            if self.state == HandleState::Closed {
                break;
            }
            if !self.wait_ready(deadline)? {
                break;
            }
            let Some((_, callback)) = self.callbacks.pop() else {
                break;
            };
            fired += 1;
            callback(self)?;
        }
        Ok(fired)
    }

    /// Dispatch callbacks until the handle closes or none remain.
    ///
    /// A fault ends the loop with `Err`.
    pub fn run(&mut self) -> Result<RunExit> {
        loop {
            match self.ensure_open() {
                Ok(()) => {}
                Err(Error::Closed) => return Ok(RunExit::Closed),
                Err(e) => return Err(e),
            }
            if self.callbacks.is_empty() {
                return Ok(RunExit::Idle);
            }
            match self.dispatch(RUN_SLICE) {
                Ok(_) => {}
                Err(Error::Closed) => return Ok(RunExit::Closed),
                Err(e) => return Err(e),
            }
        }
    }

    /// Block until ready or `deadline`. `Ok(false)` on timeout.
    fn wait_ready(&mut self, deadline: Instant) -> Result<bool> {
        let shared = self.live_link()?;
        let mut st = lock(&shared.state);
        loop {
            if let Some(cause) = st.fault.clone() {
                drop(st);
                self.mark_faulted(cause);
                return Err(self.faulted_error());
            }
            let now = Instant::now();
            if st.flow.is_ready(now) {
                return Ok(true);
            }
            if now >= deadline {
                return Ok(false);
            }
            let remaining = deadline - now;
            let wait = st
                .flow
                .time_until_ready(now)
                .map_or(remaining, |d| d.min(remaining))
                .max(Duration::from_millis(1));
            st = shared
                .ready
                .wait_timeout(st, wait)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Halt playback but keep the connection.
    pub fn stop(&mut self) -> Result<()> {
        let shared = self.live_link()?;
        {
            let mut st = lock(&shared.state);
            st.stop_requested = true;
        }
        shared.work.notify_all();
        self.state = HandleState::Connected;
        Ok(())
    }

    /// Stop the device, join the link worker and drop pending callbacks.
    ///
    /// Safe to call more than once.
    pub fn close(&mut self) -> Result<()> {
        if self.state == HandleState::Closed {
            return Ok(());
        }
        let dropped = self.callbacks.clear();
        if dropped > 0 {
            debug!("Dropped {} pending ready callbacks", dropped);
        }
        if let Some(mut link) = self.link.take() {
            link.shutdown();
        }
        self.state = HandleState::Closed;
        info!("Closed Ether Dream {}", self.descriptor.mac_address);
        Ok(())
    }

    /// Current lifecycle state, including faults the worker has raised.
    pub fn state(&self) -> HandleState {
        if self.state.is_writable() && self.link_fault().is_some() {
            return HandleState::Faulted;
        }
        self.state
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// The cause of the last fault, if the handle is faulted.
    pub fn fault(&self) -> Option<String> {
        self.fault.clone().or_else(|| self.link_fault())
    }

    /// Latest status reported by the device, while connected.
    pub fn status(&self) -> Option<Status> {
        self.link.as_ref().map(|link| lock(&link.shared.state).status)
    }

    /// Take back a buffer the device no longer needs, emptied for reuse.
    pub fn reclaim_buffer(&mut self) -> Option<FrameBuffer> {
        let link = self.link.as_ref()?;
        let mut buffer = lock(&link.shared.state).retired.pop()?;
        buffer.clear();
        Some(buffer)
    }

    fn link_fault(&self) -> Option<String> {
        let link = self.link.as_ref()?;
        let st = lock(&link.shared.state);
        st.fault.clone()
    }

    fn refresh_fault(&mut self) {
        if let Some(cause) = self.link_fault() {
            self.mark_faulted(cause);
        }
    }

    /// `Closed` or `Faulted` for a dead handle, after picking up worker faults.
    fn ensure_open(&mut self) -> Result<()> {
        self.refresh_fault();
        match self.state {
            HandleState::Closed => Err(Error::Closed),
            HandleState::Faulted => Err(self.faulted_error()),
            _ => Ok(()),
        }
    }

    /// The link of a usable handle, or the reason it is unusable.
    fn live_link(&mut self) -> Result<Arc<Shared>> {
        self.refresh_fault();
        match self.state {
            HandleState::Connected | HandleState::Streaming => {}
            HandleState::Closed => return Err(Error::Closed),
            HandleState::Faulted => return Err(self.faulted_error()),
            state @ (HandleState::Disconnected | HandleState::Connecting) => {
                return Err(Error::invalid_config(format!("handle is {}", state)))
            }
        }
        match self.link.as_ref() {
            Some(link) => Ok(Arc::clone(&link.shared)),
            None => Err(Error::invalid_config("handle has no connection")),
        }
    }

    fn faulted_error(&self) -> Error {
        Error::Faulted(
            self.fault
                .clone()
                .unwrap_or_else(|| "unknown cause".to_string()),
        )
    }

    fn mark_faulted(&mut self, cause: String) {
        if self.state != HandleState::Faulted {
            warn!(
                "Ether Dream {} handle faulted: {}",
                self.descriptor.mac_address, cause
            );
        }
        let dropped = self.callbacks.clear();
        if dropped > 0 {
            debug!("Dropped {} pending ready callbacks", dropped);
        }
        self.reap_link();
        self.fault = Some(cause);
        self.state = HandleState::Faulted;
    }

    /// Join a worker that has already exited.
    fn reap_link(&mut self) {
        if let Some(mut link) = self.link.take() {
            link.shutdown();
        }
    }
}

impl Drop for Dac {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl std::fmt::Debug for Dac {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dac")
            .field("mac_address", &self.descriptor.mac_address)
            .field("control_addr", &self.descriptor.control_addr)
            .field("state", &self.state)
            .field("pending_callbacks", &self.callbacks.len())
            .finish()
    }
}
