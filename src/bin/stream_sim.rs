//! Headless streaming simulation: orbits a camera around a procedural
//! volume and reports what the streamer uploads each frame.
//!
//! Usage: cargo run --release --bin stream_sim -- [OPTIONS]
//!
//! Options:
//!   --size <VOXELS>     Finest level edge length (default: 512)
//!   --brick <VOXELS>    Inner brick edge length (default: 32)
//!   --frames <N>        Frames to simulate (default: 600)
//!   --seed <SEED>       Noise seed (default: 12345)
//!   --iso <VALUE>       Isovalue in 0..255 (default: 140)
//!   --config <PATH>     StreamerConfig JSON (default: built-in defaults)
//!   --gpu               Upload into a real wgpu device instead of host memory

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use glam::{UVec2, UVec3, Vec3};

use volstream::core::camera::Camera;
use volstream::core::config::StreamerConfig;
use volstream::pool::gpu::request_headless_device;
use volstream::pool::{BrickStorage, GpuBrickStorage, HostBrickStorage, ShaderBindings};
use volstream::streaming::VolumeStreamer;
use volstream::visibility::Classification;
use volstream::volume::{SyntheticVolume, VolumeDataset, VolumeField};

const VIEWPORT: UVec2 = UVec2::new(1280, 720);

fn main() {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
    .format_timestamp_millis()
    .init();

    let args: Vec<String> = std::env::args().collect();
    let size = parse_u32_arg(&args, "--size").unwrap_or(512);
    let brick = parse_u32_arg(&args, "--brick").unwrap_or(32);
    let frames = parse_usize_arg(&args, "--frames").unwrap_or(600);
    let seed = parse_u32_arg(&args, "--seed").unwrap_or(12345);
    let iso = parse_f64_arg(&args, "--iso").unwrap_or(140.0);
    let config_path = parse_str_arg(&args, "--config").map(PathBuf::from);
    let use_gpu = args.iter().any(|a| a == "--gpu");

    let config = match &config_path {
        Some(path) => match StreamerConfig::load_json(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Failed to load {}: {}", path.display(), e);
                std::process::exit(1);
            }
        },
        None => StreamerConfig::default(),
    };

    println!("=== Volstream Streaming Simulation ===");
    println!("Volume: {}^3 voxels, {}^3 bricks", size, brick);
    println!("Frames: {}", frames);
    println!("Pool:   {:?} voxels, {:?}", config.pool.pool_size, config.pool.voxel_format);
    println!("Iso:    {}", iso);
    println!("Device: {}", if use_gpu { "wgpu" } else { "host" });
    println!();

    let volume: Arc<dyn VolumeDataset> = Arc::new(SyntheticVolume::new(
        UVec3::splat(size),
        UVec3::splat(brick),
        2,
        VolumeField::Noise { seed, frequency: 6.0 },
    ));
    let classification = Classification::IsoThreshold(iso);

    let result = if use_gpu {
        pollster::block_on(request_headless_device()).and_then(|(device, queue)| {
            let storage = GpuBrickStorage::new(&device, &queue, ShaderBindings::default());
            VolumeStreamer::new(volume, storage, &config, classification, VIEWPORT)
                .and_then(|streamer| run(streamer, frames))
        })
    } else {
        VolumeStreamer::new(volume, HostBrickStorage::new(), &config, classification, VIEWPORT)
            .and_then(|streamer| run(streamer, frames))
    };

    if let Err(e) = result {
        eprintln!("Simulation failed: {}", e);
        std::process::exit(1);
    }
}

/// Orbit for a while, hold still to let refinement settle, then orbit again.
fn run<S: BrickStorage>(mut streamer: VolumeStreamer<S>, frames: usize) -> volstream::core::Result<()> {
    streamer.wait_for_visibility(Duration::from_secs(30));

    let start = Instant::now();
    let mut settled_frames = 0usize;
    for frame in 0..frames {
        let angle = ((frame % 240) as f32).min(120.0) * 0.01;
        let eye = Vec3::new(angle.sin() * 1.6, 0.5, angle.cos() * 1.6);
        let mut camera = Camera::look_at(eye, Vec3::ZERO, Vec3::Y);
        camera.set_aspect(VIEWPORT.x as f32, VIEWPORT.y as f32);

        let report = streamer.frame(&camera)?;
        if report.level.is_none() {
            settled_frames += 1;
        }
        if report.level_complete {
            log::info!(
                "Frame {}: level {:?} complete, {} uploads, {} resident",
                report.frame,
                report.level,
                report.uploaded,
                streamer.pool().resident_count()
            );
        }

        let _binding = streamer.enable()?;
    }

    let elapsed = start.elapsed();
    let stats = streamer.stats();
    let pool = streamer.pool().stats();
    println!();
    println!("Frames:    {} in {:.2}s ({:.0} fps), {} idle", stats.frames, elapsed.as_secs_f64(),
        stats.frames as f64 / elapsed.as_secs_f64(), settled_frames);
    println!("Bricks:    {} planned, {} uploads, {} hits, {} deferred",
        stats.bricks_planned, stats.uploads, stats.hits, stats.deferred);
    println!("Pool:      {}/{} resident, {} evictions, {:.1} MB GPU",
        streamer.pool().resident_count(), streamer.pool().capacity(), pool.evictions,
        streamer.pool().gpu_size() as f64 / (1024.0 * 1024.0));
    println!("Refinement: {} levels completed, {} redraws, {} snapshots",
        stats.levels_completed, stats.redraws, stats.snapshots_applied);
    Ok(())
}

fn parse_f64_arg(args: &[String], flag: &str) -> Option<f64> {
    args.iter().position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok())
}

fn parse_u32_arg(args: &[String], flag: &str) -> Option<u32> {
    args.iter().position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok())
}

fn parse_usize_arg(args: &[String], flag: &str) -> Option<usize> {
    args.iter().position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok())
}

fn parse_str_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter().position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}
