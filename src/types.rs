//! Core data types shared by discovery, device handles and the frame pipeline.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::{Error, Result};

/// A normalized 2-D point produced by a point source.
///
/// Both coordinates are expected in -1.0..=1.0; anything outside is clamped
/// when the point is mapped to device channels.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Point2 {
    pub x: f64,
    pub y: f64,
}

impl Point2 {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// One point in the device's fixed-point channel format.
///
/// Eight 16-bit channels in the order `x, y, r, g, b, i, u1, u2`. The x and y
/// channels hold the device's signed 16-bit coordinate stored as its
/// two's-complement bit pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ChannelPoint {
    pub x: u16,
    pub y: u16,
    pub r: u16,
    pub g: u16,
    pub b: u16,
    pub i: u16,
    pub u1: u16,
    pub u2: u16,
}

impl ChannelPoint {
    /// Number of channels per point.
    pub const CHANNELS: usize = 8;

    /// Returns the channels in wire order.
    pub fn channels(&self) -> [u16; Self::CHANNELS] {
        [
            self.x, self.y, self.r, self.g, self.b, self.i, self.u1, self.u2,
        ]
    }

    /// The x coordinate as the device interprets it.
    pub fn signed_x(&self) -> i16 {
        self.x as i16
    }

    /// The y coordinate as the device interprets it.
    pub fn signed_y(&self) -> i16 {
        self.y as i16
    }
}

/// An ordered batch of channel tuples making up one frame.
///
/// Ownership moves into [`crate::Dac::write`]; the buffer comes back through
/// [`crate::Dac::reclaim_buffer`] once the device no longer needs it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameBuffer {
    points: Vec<ChannelPoint>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            points: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn clear(&mut self) {
        self.points.clear();
    }

    pub fn push(&mut self, point: ChannelPoint) {
        self.points.push(point);
    }

    pub fn points(&self) -> &[ChannelPoint] {
        &self.points
    }
}

impl From<Vec<ChannelPoint>> for FrameBuffer {
    fn from(points: Vec<ChannelPoint>) -> Self {
        Self { points }
    }
}

impl std::ops::Deref for FrameBuffer {
    type Target = [ChannelPoint];
    fn deref(&self) -> &Self::Target {
        &self.points
    }
}

impl Extend<ChannelPoint> for FrameBuffer {
    fn extend<I: IntoIterator<Item = ChannelPoint>>(&mut self, iter: I) {
        self.points.extend(iter);
    }
}

/// How many times a written frame plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Repeat {
    /// Play the frame this many times, then move on (or underrun).
    Count(u32),
    /// Loop the frame until a newer one is written.
    Forever,
}

impl Default for Repeat {
    fn default() -> Self {
        Repeat::Count(1)
    }
}

/// Lifecycle of a [`crate::Dac`] handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum HandleState {
    /// Not connected yet.
    Disconnected,
    /// A connection attempt is underway.
    Connecting,
    /// Connected; nothing written yet (or playback stopped).
    Connected,
    /// At least one frame has been written.
    Streaming,
    /// A protocol or I/O error ended the connection; `connect()` again to recover.
    Faulted,
    /// Closed for good.
    Closed,
}

impl HandleState {
    /// Whether `write` may be called in this state.
    pub fn is_writable(&self) -> bool {
        matches!(self, HandleState::Connected | HandleState::Streaming)
    }
}

impl fmt::Display for HandleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandleState::Disconnected => "disconnected",
            HandleState::Connecting => "connecting",
            HandleState::Connected => "connected",
            HandleState::Streaming => "streaming",
            HandleState::Faulted => "faulted",
            HandleState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Engine configuration.
///
/// With the `serde` feature this (de)serializes with camelCase keys, e.g.
/// `{"pointsPerFrame": 400, "pointsPerSecond": 30000, "discoveryTimeoutMs": 3000}`.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase", default))]
pub struct StreamConfig {
    /// Points produced per frame; readiness requires this much device headroom.
    pub points_per_frame: usize,
    /// Device playback rate.
    pub points_per_second: u32,
    /// Devices silent for longer than this are pruned from discovery.
    pub discovery_timeout_ms: u64,
    /// Upper bound on `connect()`.
    pub connect_timeout_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            points_per_frame: 400,
            points_per_second: 30_000,
            discovery_timeout_ms: 3_000,
            connect_timeout_ms: 5_000,
        }
    }
}

impl StreamConfig {
    /// Create a config with the given frame size and point rate.
    pub fn new(points_per_frame: usize, points_per_second: u32) -> Self {
        Self {
            points_per_frame,
            points_per_second,
            ..Default::default()
        }
    }

    /// Set the discovery prune threshold.
    pub fn with_discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Reject values no device could honor.
    pub fn validate(&self) -> Result<()> {
        if self.points_per_frame == 0 {
            return Err(Error::invalid_config("points_per_frame must be > 0"));
        }
        if self.points_per_frame >= u16::MAX as usize {
            return Err(Error::invalid_config(format!(
                "points_per_frame {} exceeds the protocol limit",
                self.points_per_frame
            )));
        }
        if self.points_per_second == 0 {
            return Err(Error::invalid_config("points_per_second must be > 0"));
        }
        if self.discovery_timeout_ms == 0 {
            return Err(Error::invalid_config("discovery_timeout_ms must be > 0"));
        }
        if self.connect_timeout_ms == 0 {
            return Err(Error::invalid_config("connect_timeout_ms must be > 0"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_matches_demo() {
        let cfg = StreamConfig::default();
        assert_eq!(cfg.points_per_frame, 400);
        assert_eq!(cfg.points_per_second, 30_000);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        assert!(StreamConfig::new(0, 30_000).validate().is_err());
        assert!(StreamConfig::new(400, 0).validate().is_err());
        let cfg = StreamConfig::default().with_connect_timeout(Duration::ZERO);
        assert!(matches!(cfg.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_duration_builders_round_trip() {
        let cfg = StreamConfig::default()
            .with_discovery_timeout(Duration::from_millis(1500))
            .with_connect_timeout(Duration::from_secs(2));
        assert_eq!(cfg.discovery_timeout(), Duration::from_millis(1500));
        assert_eq!(cfg.connect_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn test_channel_point_exposes_signed_coordinates() {
        let p = ChannelPoint {
            x: 0x8001,
            y: 0x7FFF,
            ..Default::default()
        };
        assert_eq!(p.signed_x(), -32767);
        assert_eq!(p.signed_y(), 32767);
        assert_eq!(p.channels()[0], 0x8001);
    }

    #[test]
    fn test_only_connected_states_are_writable() {
        assert!(HandleState::Connected.is_writable());
        assert!(HandleState::Streaming.is_writable());
        assert!(!HandleState::Faulted.is_writable());
        assert!(!HandleState::Closed.is_writable());
        assert!(!HandleState::Disconnected.is_writable());
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_config_uses_camel_case_keys() {
        let cfg: StreamConfig =
            serde_json::from_str(r#"{"pointsPerFrame": 500, "discoveryTimeoutMs": 2000}"#)
                .unwrap();
        assert_eq!(cfg.points_per_frame, 500);
        assert_eq!(cfg.points_per_second, 30_000);
        assert_eq!(cfg.discovery_timeout_ms, 2000);

        let json = serde_json::to_string(&StreamConfig::default()).unwrap();
        assert!(json.contains("\"pointsPerSecond\":30000"));
    }
}
