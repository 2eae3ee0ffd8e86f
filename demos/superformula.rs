//! Streams an animated superformula to the first Ether Dream on the network.
//!
//! Run with: `cargo run --example superformula -- --points-per-frame 400`

use std::f64::consts::{PI, SQRT_2, TAU};
use std::sync::atomic::Ordering;
use std::time::Duration;

use clap::Parser;
use etherdream::{
    find_first_dac, ChannelLevels, DacDiscovery, FramePipeline, Point2, PointSource, Result,
    RunExit, StreamConfig,
};

#[derive(Parser)]
#[command(about = "Stream an animated superformula to an Ether Dream")]
struct Args {
    /// Points per frame
    #[arg(short = 'n', long, default_value_t = 400)]
    points_per_frame: usize,

    /// Playback rate in points per second
    #[arg(short = 'r', long, default_value_t = 30_000)]
    points_per_second: u32,

    /// How long to listen for DAC broadcasts, in milliseconds
    #[arg(long, default_value_t = 1200)]
    find_timeout_ms: u64,
}

/// Superformula parameters, after the D3 superformula plugin.
struct Params {
    m: f64,
    n1: f64,
    n2: f64,
    n3: f64,
    a: f64,
    b: f64,
}

impl Params {
    fn at(t: f64) -> Self {
        Self {
            m: 6.0,
            n1: 3.0 + t.sin() * 2.0,
            n2: (t * 0.33).cos() * 6.0,
            n3: 2.0 + (t * 0.55).sin(),
            a: 1.0,
            b: 1.0,
        }
    }
}

struct Superformula;

impl PointSource for Superformula {
    fn points(&mut self, t: f64, count: usize) -> Vec<Point2> {
        let p = Params::at(t);
        let dt = TAU / count as f64;

        let lens: Vec<f64> = (0..count)
            .map(|i| {
                let phi = p.m * (i as f64 * dt - PI) / 4.0;
                ((phi.cos() / p.a).abs().powf(p.n2) + (phi.sin() / p.b).abs().powf(p.n3))
                    .abs()
                    .powf(-1.0 / p.n1)
            })
            .collect();

        // Fit the largest radius inside the unit circle's inscribed square.
        let max = lens.iter().cloned().fold(0.0, f64::max);
        let scale = if max > 0.0 && max.is_finite() {
            (SQRT_2 / 2.0) / max
        } else {
            0.0
        };

        lens.iter()
            .enumerate()
            .map(|(i, len)| {
                let r = len * scale;
                let angle = i as f64 * dt;
                Point2::new(r * angle.cos(), r * angle.sin())
            })
            .collect()
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let config = StreamConfig::new(args.points_per_frame, args.points_per_second);
    config.validate()?;

    println!("Listening for Ether Dreams...");
    let mut discovery = DacDiscovery::new(&config);
    let mut dac = find_first_dac(
        &mut discovery,
        Duration::from_millis(args.find_timeout_ms),
        &config,
    )?;
    let d = dac.descriptor();
    println!(
        "  Found: {} at {} (buffer {}, max {} pps)",
        d.mac_address, d.control_addr, d.buffer_capacity, d.max_point_rate
    );

    dac.connect()?;

    let pipeline = FramePipeline::new(Superformula, &config).with_levels(ChannelLevels::default());
    let frames = pipeline.frame_counter();
    pipeline.start(&mut dac)?;

    println!(
        "Streaming {} points/frame at {} pps... Press Ctrl+C to stop",
        config.points_per_frame, config.points_per_second
    );

    let exit = dac.run();
    println!("Frames written: {}", frames.load(Ordering::Relaxed));
    match exit? {
        RunExit::Closed => println!("DAC closed"),
        RunExit::Idle => println!("Nothing left to stream"),
    }
    Ok(())
}
