//! Ether Dream device discovery.
//!
//! Every Ether Dream announces itself once a second with a UDP broadcast on
//! port 7654. [`DacDiscovery`] listens for those announcements on a background
//! thread and keeps a [`DeviceRegistry`] of devices heard recently; devices
//! that stay silent for longer than the configured discovery timeout are
//! pruned.
//!
//! # Example
//!
//! ```no_run
//! use etherdream::{find_first_dac, DacDiscovery, StreamConfig, DEFAULT_FIND_TIMEOUT};
//!
//! let config = StreamConfig::default();
//! let mut discovery = DacDiscovery::new(&config);
//! let mut dac = find_first_dac(&mut discovery, DEFAULT_FIND_TIMEOUT, &config)?;
//! dac.connect()?;
//! # Ok::<(), etherdream::Error>(())
//! ```

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::device::Dac;
use crate::error::{Error, Result};
use crate::protocols::ether_dream::dac::MacAddress;
use crate::protocols::ether_dream::protocol::{self, DacBroadcast};
use crate::protocols::ether_dream::{recv_dac_broadcasts_on, RecvDacBroadcasts};
use crate::types::StreamConfig;

/// How long `find_first_dac` waits by default.
pub const DEFAULT_FIND_TIMEOUT: Duration = Duration::from_millis(1200);

/// Read timeout on the broadcast socket, bounding how long `stop()` waits.
const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// How often `find_first_dac` checks the registry while waiting.
const FIND_POLL_INTERVAL: Duration = Duration::from_millis(10);

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A DAC heard on the network.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceDescriptor {
    /// Unique device identity.
    pub mac_address: MacAddress,
    /// Where to open the command connection.
    pub control_addr: SocketAddr,
    /// Position in the registry when this descriptor was read.
    pub index: usize,
    /// Protocol version from the broadcast status.
    pub protocol_version: u8,
    pub hw_revision: u16,
    pub sw_revision: u16,
    /// Device point buffer size.
    pub buffer_capacity: u16,
    pub max_point_rate: u32,
    pub discovered_at: Instant,
    pub last_seen: Instant,
    broadcast: DacBroadcast,
}

impl DeviceDescriptor {
    /// Build a descriptor from a broadcast received from `source`.
    ///
    /// The control address uses the source IP and the standard command port.
    pub fn from_broadcast(broadcast: &DacBroadcast, source: SocketAddr, now: Instant) -> Self {
        Self::with_control_port(broadcast, source, protocol::COMMUNICATION_PORT, now)
    }

    fn with_control_port(
        broadcast: &DacBroadcast,
        source: SocketAddr,
        control_port: u16,
        now: Instant,
    ) -> Self {
        Self {
            mac_address: MacAddress(broadcast.mac_address),
            control_addr: SocketAddr::new(source.ip(), control_port),
            index: 0,
            protocol_version: broadcast.dac_status.protocol,
            hw_revision: broadcast.hw_revision,
            sw_revision: broadcast.sw_revision,
            buffer_capacity: broadcast.buffer_capacity,
            max_point_rate: broadcast.max_point_rate,
            discovered_at: now,
            last_seen: now,
            broadcast: *broadcast,
        }
    }

    /// The most recent broadcast from this device.
    pub fn broadcast(&self) -> &DacBroadcast {
        &self.broadcast
    }

    /// Override the control address, e.g. for a device behind NAT.
    pub fn set_control_addr(&mut self, addr: SocketAddr) {
        self.control_addr = addr;
    }

    fn refresh(&mut self, broadcast: &DacBroadcast, source: SocketAddr, now: Instant) {
        self.control_addr.set_ip(source.ip());
        self.protocol_version = broadcast.dac_status.protocol;
        self.hw_revision = broadcast.hw_revision;
        self.sw_revision = broadcast.sw_revision;
        self.buffer_capacity = broadcast.buffer_capacity;
        self.max_point_rate = broadcast.max_point_rate;
        self.last_seen = now;
        self.broadcast = *broadcast;
    }
}

/// Devices heard recently, in the order they were first heard.
///
/// Pruned entries are removed outright, so later devices shift down into
/// their indices.
#[derive(Debug, Clone)]
pub struct DeviceRegistry {
    devices: Vec<DeviceDescriptor>,
    timeout: Duration,
    control_port: u16,
}

impl DeviceRegistry {
    pub fn new(timeout: Duration) -> Self {
        Self {
            devices: Vec::new(),
            timeout,
            control_port: protocol::COMMUNICATION_PORT,
        }
    }

    /// Use a non-standard command port for every device.
    pub fn with_control_port(mut self, port: u16) -> Self {
        self.set_control_port(port);
        self
    }

    /// Applies to devices heard from now on.
    pub fn set_control_port(&mut self, port: u16) {
        self.control_port = port;
    }

    /// Record a broadcast. Returns `true` if the device is new.
    pub fn observe(&mut self, broadcast: &DacBroadcast, source: SocketAddr, now: Instant) -> bool {
        let mac = MacAddress(broadcast.mac_address);
        if let Some(existing) = self.devices.iter_mut().find(|d| d.mac_address == mac) {
            existing.refresh(broadcast, source, now);
            return false;
        }
        let mut descriptor =
            DeviceDescriptor::with_control_port(broadcast, source, self.control_port, now);
        descriptor.index = self.devices.len();
        self.devices.push(descriptor);
        true
    }

    /// Drop devices not heard from within the timeout. Returns how many went.
    pub fn prune(&mut self, now: Instant) -> usize {
        let timeout = self.timeout;
        let before = self.devices.len();
        self.devices.retain(|d| {
            let alive = now.saturating_duration_since(d.last_seen) <= timeout;
            if !alive {
                info!("Ether Dream {} went silent, pruning", d.mac_address);
            }
            alive
        });
        for (index, d) in self.devices.iter_mut().enumerate() {
            d.index = index;
        }
        before - self.devices.len()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&DeviceDescriptor> {
        self.devices.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeviceDescriptor> {
        self.devices.iter()
    }
}

/// Background listener for Ether Dream broadcasts.
///
/// The listener thread is stopped and joined when this is dropped.
pub struct DacDiscovery {
    bind_addr: SocketAddr,
    registry: Arc<Mutex<DeviceRegistry>>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl DacDiscovery {
    /// Listen on the standard broadcast port on all interfaces.
    pub fn new(config: &StreamConfig) -> Self {
        let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, protocol::BROADCAST_PORT);
        Self::with_bind_addr(config, addr.into())
    }

    /// Listen on a specific address.
    pub fn with_bind_addr(config: &StreamConfig, bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            registry: Arc::new(Mutex::new(DeviceRegistry::new(
                config.discovery_timeout(),
            ))),
            running: Arc::new(AtomicBool::new(false)),
            handle: None,
            local_addr: None,
        }
    }

    /// Connect to discovered devices on `port` instead of the standard one.
    pub fn with_control_port(self, port: u16) -> Self {
        lock(&self.registry).set_control_port(port);
        self
    }

    /// Bind the broadcast socket and start listening. Does nothing if already started.
    pub fn start(&mut self) -> Result<()> {
        if self.handle.is_some() {
            return Ok(());
        }
        let rx = recv_dac_broadcasts_on(self.bind_addr)
            .map_err(|e| Error::discovery(format!("bind {}: {}", self.bind_addr, e)))?;
        rx.set_timeout(Some(RECV_TIMEOUT))?;
        let local_addr = rx.local_addr()?;
        debug!("Listening for Ether Dream broadcasts on {}", local_addr);

        self.running.store(true, Ordering::Relaxed);
        let running = Arc::clone(&self.running);
        let registry = Arc::clone(&self.registry);
        let handle = thread::Builder::new()
            .name("etherdream-discovery".into())
            .spawn(move || listen_loop(rx, registry, running))?;

        self.handle = Some(handle);
        self.local_addr = Some(local_addr);
        Ok(())
    }

    /// Whether the listener thread is running.
    pub fn is_started(&self) -> bool {
        self.handle.is_some()
    }

    /// The bound socket address, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Number of live devices. Expired devices are pruned first.
    pub fn count(&self) -> usize {
        let mut registry = lock(&self.registry);
        registry.prune(Instant::now());
        registry.len()
    }

    /// The device at `index`.
    pub fn device_at(&self, index: usize) -> Result<DeviceDescriptor> {
        let mut registry = lock(&self.registry);
        registry.prune(Instant::now());
        registry.get(index).cloned().ok_or(Error::NotFound {
            index,
            count: registry.len(),
        })
    }

    /// Snapshot of every live device.
    pub fn devices(&self) -> Vec<DeviceDescriptor> {
        let mut registry = lock(&self.registry);
        registry.prune(Instant::now());
        registry.iter().cloned().collect()
    }

    /// Stop the listener thread. The registry is kept.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        self.local_addr = None;
    }
}

impl Drop for DacDiscovery {
    fn drop(&mut self) {
        self.stop();
    }
}

fn listen_loop(
    mut rx: RecvDacBroadcasts,
    registry: Arc<Mutex<DeviceRegistry>>,
    running: Arc<AtomicBool>,
) {
    while running.load(Ordering::Relaxed) {
        match rx.next_broadcast() {
            Ok((broadcast, source)) => {
                let now = Instant::now();
                let mut registry = lock(&registry);
                if registry.observe(&broadcast, source, now) {
                    info!(
                        "Discovered Ether Dream {} at {}",
                        MacAddress(broadcast.mac_address),
                        source.ip()
                    );
                }
                registry.prune(now);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                debug!("Ignoring malformed broadcast: {}", e);
            }
            Err(e) => {
                warn!("Broadcast receive failed: {}", e);
                thread::sleep(RECV_TIMEOUT);
            }
        }
    }
}

/// Start `discovery` and return a handle to the first device heard within `wait`.
///
/// Returns as soon as a device is known. The handle is not connected yet.
pub fn find_first_dac(
    discovery: &mut DacDiscovery,
    wait: Duration,
    config: &StreamConfig,
) -> Result<Dac> {
    discovery.start()?;
    let deadline = Instant::now() + wait;
    loop {
        if let Ok(descriptor) = discovery.device_at(0) {
            return Ok(Dac::new(descriptor, config.clone()));
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(Error::discovery(format!(
                "no Ether Dream found within {:?}",
                wait
            )));
        }
        thread::sleep(FIND_POLL_INTERVAL.min(deadline - now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::ether_dream::protocol::DacStatus;

    fn broadcast(mac_tail: u8) -> DacBroadcast {
        DacBroadcast {
            mac_address: [0, 0x04, 0xA3, 0, 0, mac_tail],
            hw_revision: 2,
            sw_revision: 3,
            buffer_capacity: 1799,
            max_point_rate: 100_000,
            dac_status: DacStatus {
                protocol: 1,
                ..Default::default()
            },
        }
    }

    fn source(last: u8) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, last], protocol::BROADCAST_PORT))
    }

    #[test]
    fn test_descriptor_uses_command_port() {
        let now = Instant::now();
        let d = DeviceDescriptor::from_broadcast(&broadcast(1), source(7), now);
        assert_eq!(d.control_addr, SocketAddr::from(([10, 0, 0, 7], 7765)));
        assert_eq!(d.protocol_version, 1);
        assert_eq!(d.buffer_capacity, 1799);
        assert_eq!(d.mac_address.to_string(), "00:04:A3:00:00:01");
    }

    #[test]
    fn test_registry_refreshes_known_device() {
        let t0 = Instant::now();
        let mut registry = DeviceRegistry::new(Duration::from_secs(3));
        assert!(registry.observe(&broadcast(1), source(1), t0));
        assert!(!registry.observe(&broadcast(1), source(9), t0 + Duration::from_secs(1)));

        assert_eq!(registry.len(), 1);
        let d = registry.get(0).unwrap();
        assert_eq!(d.discovered_at, t0);
        assert_eq!(d.last_seen, t0 + Duration::from_secs(1));
        assert_eq!(d.control_addr.ip(), source(9).ip());
    }

    #[test]
    fn test_prune_removes_silent_devices_and_shifts_indices() {
        let t0 = Instant::now();
        let mut registry = DeviceRegistry::new(Duration::from_secs(3));
        registry.observe(&broadcast(1), source(1), t0);
        registry.observe(&broadcast(2), source(2), t0 + Duration::from_secs(2));

        assert_eq!(registry.prune(t0 + Duration::from_secs(3)), 0);
        assert_eq!(registry.prune(t0 + Duration::from_secs(4)), 1);

        assert_eq!(registry.len(), 1);
        let d = registry.get(0).unwrap();
        assert_eq!(d.mac_address, MacAddress([0, 0x04, 0xA3, 0, 0, 2]));
        assert_eq!(d.index, 0);
    }

    #[test]
    fn test_custom_control_port() {
        let mut registry = DeviceRegistry::new(Duration::from_secs(3)).with_control_port(4000);
        registry.observe(&broadcast(1), source(1), Instant::now());
        assert_eq!(registry.get(0).unwrap().control_addr.port(), 4000);
    }

    #[test]
    fn test_device_at_out_of_range() {
        let discovery = DacDiscovery::with_bind_addr(
            &StreamConfig::default(),
            "127.0.0.1:0".parse().unwrap(),
        );
        match discovery.device_at(2) {
            Err(Error::NotFound { index, count }) => {
                assert_eq!(index, 2);
                assert_eq!(count, 0);
            }
            other => panic!("expected NotFound, got {:?}", other.map(|d| d.index)),
        }
    }

    #[test]
    fn test_find_first_dac_times_out_without_devices() {
        let config = StreamConfig::default();
        let mut discovery =
            DacDiscovery::with_bind_addr(&config, "127.0.0.1:0".parse().unwrap());
        let start = Instant::now();
        let err = find_first_dac(&mut discovery, Duration::from_millis(150), &config)
            .err()
            .unwrap();
        assert!(matches!(err, Error::Discovery(_)));
        assert!(start.elapsed() >= Duration::from_millis(150));
        assert!(discovery.is_started());
    }
}
