use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mono_vslam::io::MonoSequence;
use mono_vslam::storage::next_map_file_name;
use mono_vslam::system::{SlamConfig, SlamSystem};
use mono_vslam::tracking::frame::CameraModel;
use mono_vslam::tracking::TrackingState;

/// Run monocular SLAM over an EuRoC-style image sequence.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Sequence root (the directory containing `cam0/`).
    sequence: PathBuf,

    /// Session config (YAML). The calibration defaults to `cam0/sensor.yaml`.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// DBoW2 text vocabulary. Overrides `vocabulary_path` from the config.
    #[arg(short, long)]
    vocabulary: Option<PathBuf>,

    /// Map to relocalize against before tracking.
    #[arg(long)]
    load_map: Option<PathBuf>,

    /// Directory to save the final map into as `slam-map-<n>.json`.
    #[arg(long)]
    save_map_dir: Option<PathBuf>,

    /// Stop after this many frames.
    #[arg(long)]
    max_frames: Option<usize>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let sequence = MonoSequence::open(&args.sequence)
        .with_context(|| format!("Failed to open sequence {}", args.sequence.display()))?;
    info!("Loaded {} frames from {}", sequence.len(), args.sequence.display());

    let mut config = match &args.config {
        Some(path) => SlamConfig::from_yaml_file(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?,
        None => SlamConfig::with_camera(sequence.camera),
    };
    if args.config.is_some() {
        use_sequence_camera_if_invalid(&mut config, sequence.camera);
    }
    if let Some(path) = args.vocabulary {
        config.vocabulary_path = Some(path);
    }

    let mut system = SlamSystem::new(config).context("Failed to start SLAM session")?;
    if let Some(path) = &args.load_map {
        system
            .load_map(path)
            .with_context(|| format!("Failed to load map {}", path.display()))?;
    }

    let num_frames = args.max_frames.map_or(sequence.len(), |n| n.min(sequence.len()));
    let mut last_state = system.state();
    let mut num_lost = 0usize;
    for i in 0..num_frames {
        let (timestamp, image) = match sequence.frame(i) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Skipping frame {}: {:#}", i, e);
                continue;
            }
        };
        let result = system.process_image(&image, timestamp);

        if result.state != last_state {
            info!("Frame {}: {} -> {}", i, last_state, result.state);
            last_state = result.state;
        }
        if result.state == TrackingState::Lost {
            num_lost += 1;
        }
        if i % 100 == 0 {
            info!(
                "Frame {}: {} features, {} tracked, {:.1} ms",
                i, result.metrics.n_features, result.metrics.n_inliers, result.timing.total_ms
            );
        }
    }

    {
        let atlas = system.shared_state().atlas.read();
        let map = atlas.active_map();
        info!(
            "Finished {} frames ({} lost): {} keyframes, {} map points",
            num_frames,
            num_lost,
            map.num_keyframes(),
            map.num_map_points()
        );
    }

    if let Some(dir) = &args.save_map_dir {
        std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
        let path = next_map_file_name(dir)?;
        system
            .save_map(&path)
            .with_context(|| format!("Failed to save map to {}", path.display()))?;
        info!("Map saved to {}", path.display());
    }

    system.shutdown();
    Ok(())
}

/// Replace an invalid config calibration with the sequence's own. Returns
/// whether the camera was replaced.
fn use_sequence_camera_if_invalid(config: &mut SlamConfig, sequence_camera: CameraModel) -> bool {
    match config.camera.validate() {
        Ok(()) => false,
        Err(e) => {
            warn!("Config camera rejected ({}), using the sequence calibration", e);
            config.camera = sequence_camera;
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_config_camera_is_replaced() {
        let sequence_camera = CameraModel {
            fx: 300.0,
            fy: 300.0,
            cx: 160.0,
            cy: 120.0,
            width: 320,
            height: 240,
            ..CameraModel::default()
        };
        let mut config = SlamConfig::default();
        config.camera.fx = 0.0;
        assert!(use_sequence_camera_if_invalid(&mut config, sequence_camera));
        assert_eq!(config.camera, sequence_camera);

        let mut config = SlamConfig::default();
        assert!(!use_sequence_camera_if_invalid(&mut config, sequence_camera));
        assert_eq!(config.camera, CameraModel::default());
    }
}
