//! Frame-streaming engine for Ether Dream laser DACs.
//!
//! The crate finds Ether Dream DACs on the local network, connects to one,
//! and streams frames of points to it at a fixed point rate while keeping the
//! device's buffer fed without overrunning it.
//!
//! # Layers
//!
//! - [`protocols::ether_dream`]: wire types, the broadcast listener and the
//!   TCP command stream.
//! - [`discovery`]: background listener keeping a registry of live devices.
//! - [`Dac`]: one connection, non-blocking `write`, readiness callbacks.
//! - [`flow`]: buffer-fullness estimation behind readiness.
//! - [`pipeline`]: maps normalized points to device channels and re-arms
//!   itself on every readiness.
//!
//! # Coordinate System
//!
//! Point sources produce normalized coordinates:
//! - X: -1.0 (left) to 1.0 (right)
//! - Y: -1.0 (bottom) to 1.0 (top)
//!
//! Colors and intensity are raw 16-bit channel values.
//!
//! # Example
//!
//! ```no_run
//! use etherdream::{find_first_dac, DacDiscovery, FramePipeline, Point2, StreamConfig};
//! use etherdream::DEFAULT_FIND_TIMEOUT;
//!
//! let config = StreamConfig::default();
//! let mut discovery = DacDiscovery::new(&config);
//! let mut dac = find_first_dac(&mut discovery, DEFAULT_FIND_TIMEOUT, &config)?;
//! dac.connect()?;
//!
//! let square = |_t: f64, count: usize| -> Vec<Point2> {
//!     (0..count)
//!         .map(|k| {
//!             let s = k as f64 / count as f64 * 2.0 - 1.0;
//!             Point2::new(s, -s)
//!         })
//!         .collect()
//! };
//! FramePipeline::new(square, &config).start(&mut dac)?;
//! dac.run()?;
//! # Ok::<(), etherdream::Error>(())
//! ```

pub mod device;
pub mod discovery;
mod error;
pub mod flow;
pub mod pipeline;
pub mod protocols;
pub mod types;
mod worker;

// Error types
pub use error::{ConnectError, Error, Result};

// Discovery
pub use discovery::{
    find_first_dac, DacDiscovery, DeviceDescriptor, DeviceRegistry, DEFAULT_FIND_TIMEOUT,
};

// Device handle and flow control
pub use device::{Dac, ReadyCallback, RunExit, MAX_PROTOCOL_VERSION};
pub use flow::{FlowController, ReadyQueue, ReadyToken, StatusReport};

// Pipeline
pub use pipeline::{coord_to_channel, ChannelLevels, FramePipeline, PointSource};

// Types
pub use types::{ChannelPoint, FrameBuffer, HandleState, Point2, Repeat, StreamConfig};

pub use protocols::ether_dream;
