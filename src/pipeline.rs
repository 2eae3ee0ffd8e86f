//! Frame pipeline: turns a point source into a self-rearming write loop.
//!
//! Each time the handle becomes ready the pipeline asks its source for
//! `points_per_frame` normalized points at the current time, maps them to
//! channel tuples, writes the frame, and registers itself for the next
//! readiness.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use log::{debug, trace};

use crate::device::Dac;
use crate::error::{Error, Result};
use crate::types::{ChannelPoint, FrameBuffer, Point2, Repeat, StreamConfig};

/// Produces the points of one frame.
///
/// `t` is seconds since the pipeline started; exactly `count` points are
/// expected back.
pub trait PointSource: Send + 'static {
    fn points(&mut self, t: f64, count: usize) -> Vec<Point2>;
}

impl<F> PointSource for F
where
    F: FnMut(f64, usize) -> Vec<Point2> + Send + 'static,
{
    fn points(&mut self, t: f64, count: usize) -> Vec<Point2> {
        self(t, count)
    }
}

/// Map a normalized coordinate to the device's signed 16-bit range.
///
/// Values are clamped to [-1, 1] first, so out-of-range input saturates
/// instead of wrapping. NaN maps to the center.
pub fn coord_to_channel(v: f64) -> u16 {
    let v = if v.is_nan() { 0.0 } else { v.clamp(-1.0, 1.0) };
    (v * i16::MAX as f64).floor() as i16 as u16
}

/// Fixed color and intensity channel values applied to every point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ChannelLevels {
    pub r: u16,
    pub g: u16,
    pub b: u16,
    pub i: u16,
}

impl ChannelLevels {
    pub const fn new(r: u16, g: u16, b: u16, i: u16) -> Self {
        Self { r, g, b, i }
    }

    /// Levels from fractions of full scale, each clamped to 0..=1.
    pub fn from_fractions(r: f64, g: f64, b: f64, i: f64) -> Self {
        fn scale(v: f64) -> u16 {
            let v = if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) };
            (v * u16::MAX as f64).floor() as u16
        }
        Self::new(scale(r), scale(g), scale(b), scale(i))
    }
}

impl Default for ChannelLevels {
    /// Warm white: full red, a third green, a ninth blue.
    fn default() -> Self {
        Self::from_fractions(1.0, 0.33, 0.11, 0.0)
    }
}

/// Drives a [`PointSource`] into a [`Dac`].
pub struct FramePipeline<S> {
    source: S,
    points_per_frame: usize,
    points_per_second: u32,
    levels: ChannelLevels,
    started_at: Option<Instant>,
    frames: Arc<AtomicU64>,
}

impl<S: PointSource> FramePipeline<S> {
    pub fn new(source: S, config: &StreamConfig) -> Self {
        Self {
            source,
            points_per_frame: config.points_per_frame,
            points_per_second: config.points_per_second,
            levels: ChannelLevels::default(),
            started_at: None,
            frames: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_levels(mut self, levels: ChannelLevels) -> Self {
        self.levels = levels;
        self
    }

    /// Count of frames written so far, shared with the running pipeline.
    pub fn frame_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.frames)
    }

    /// Fill `buffer` with the frame for time `t`.
    pub fn render(&mut self, t: f64, buffer: &mut FrameBuffer) -> Result<()> {
        let points = self.source.points(t, self.points_per_frame);
        if points.len() != self.points_per_frame {
            return Err(Error::invalid_config(format!(
                "point source returned {} points, expected {}",
                points.len(),
                self.points_per_frame
            )));
        }
        buffer.clear();
        let levels = self.levels;
        buffer.extend(points.iter().map(|p| ChannelPoint {
            x: coord_to_channel(p.x),
            y: coord_to_channel(p.y),
            r: levels.r,
            g: levels.g,
            b: levels.b,
            i: levels.i,
            u1: 0,
            u2: 0,
        }));
        Ok(())
    }

    /// Start streaming: the first frame goes out at the next readiness.
    ///
    /// Frames are produced from inside [`Dac::dispatch`] / [`Dac::run`].
    pub fn start(mut self, dac: &mut Dac) -> Result<()> {
        debug!(
            "Starting pipeline: {} points/frame at {} pps",
            self.points_per_frame, self.points_per_second
        );
        self.started_at = Some(Instant::now());
        let pipeline = Box::new(self);
        dac.when_ready(move |dac| pipeline.step(dac))?;
        Ok(())
    }

    fn step(mut self: Box<Self>, dac: &mut Dac) -> Result<()> {
        let t = self
            .started_at
            .map_or(0.0, |start| start.elapsed().as_secs_f64());
        let mut buffer = dac
            .reclaim_buffer()
            .unwrap_or_else(|| FrameBuffer::with_capacity(self.points_per_frame));
        self.render(t, &mut buffer)?;
        match dac.write(buffer, self.points_per_second, Repeat::Count(1)) {
            Ok(()) => {
                let n = self.frames.fetch_add(1, Ordering::Relaxed) + 1;
                trace!("Wrote frame {} at t={:.3}", n, t);
            }
            // Readiness slipped between the check and the write. The buffer
            // is handed back and the next readiness renders a fresh frame.
            Err(Error::Busy) => debug!("Device busy, frame at t={:.3} deferred", t),
            Err(e) => return Err(e),
        }
        dac.when_ready(move |dac| self.step(dac))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::TAU;

    fn circle(_t: f64, count: usize) -> Vec<Point2> {
        (0..count)
            .map(|k| {
                let theta = TAU * k as f64 / count as f64;
                Point2::new(theta.cos(), theta.sin())
            })
            .collect()
    }

    #[test]
    fn test_coordinate_mapping() {
        assert_eq!(coord_to_channel(0.0), 0);
        assert_eq!(coord_to_channel(1.0), 32767);
        assert_eq!(coord_to_channel(-1.0) as i16, -32767);
        assert_eq!(coord_to_channel(0.5) as i16, 16383);
        // floor, not truncation
        assert_eq!(coord_to_channel(-0.5) as i16, -16384);
    }

    #[test]
    fn test_out_of_range_coordinates_saturate() {
        assert_eq!(coord_to_channel(1.5) as i16, 32767);
        assert_eq!(coord_to_channel(-7.0) as i16, -32767);
        assert_eq!(coord_to_channel(f64::INFINITY) as i16, 32767);
        assert_eq!(coord_to_channel(f64::NAN), 0);
    }

    #[test]
    fn test_default_levels() {
        let levels = ChannelLevels::default();
        assert_eq!(levels.r, 65535);
        assert_eq!(levels.g, 21626);
        assert_eq!(levels.b, 7208);
        assert_eq!(levels.i, 0);
    }

    #[test]
    fn test_render_circle_frame() {
        let config = StreamConfig::default();
        let mut pipeline = FramePipeline::new(circle, &config);
        let mut buffer = FrameBuffer::new();
        pipeline.render(0.0, &mut buffer).unwrap();

        assert_eq!(buffer.len(), 400);
        assert_eq!(buffer[0].signed_x(), 32767);
        assert_eq!(buffer[0].signed_y(), 0);
        assert_eq!(buffer[200].signed_x(), -32767);
        for p in buffer.iter() {
            assert_eq!((p.r, p.g, p.b, p.i), (65535, 21626, 7208, 0));
            assert_eq!((p.u1, p.u2), (0, 0));
        }
    }

    #[test]
    fn test_render_reuses_buffer() {
        let config = StreamConfig::new(10, 30_000);
        let mut pipeline =
            FramePipeline::new(circle, &config).with_levels(ChannelLevels::new(1, 2, 3, 4));
        let mut buffer = FrameBuffer::with_capacity(10);
        pipeline.render(0.0, &mut buffer).unwrap();
        pipeline.render(1.0, &mut buffer).unwrap();
        assert_eq!(buffer.len(), 10);
        assert_eq!(buffer[3].b, 3);
    }

    #[test]
    fn test_wrong_point_count_is_rejected() {
        let config = StreamConfig::new(400, 30_000);
        let short = |_t: f64, count: usize| vec![Point2::default(); count - 1];
        let mut pipeline = FramePipeline::new(short, &config);
        let mut buffer = FrameBuffer::new();
        let err = pipeline.render(0.0, &mut buffer).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }
}
