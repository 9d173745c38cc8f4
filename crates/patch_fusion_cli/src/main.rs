//! Runs a reconstruction session over a recorded RGB-D dataset.
//!
//! Uses the reference grid mesher and boundary stitcher with an in-memory
//! geometry device, and logs one line per frame.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use patch_fusion::dataset::{FrameSource, TumDataset};
use patch_fusion::error::FrameSourceError;
use patch_fusion::{
  BoundaryStitcher, DeferredCollector, GeometryUpdater, GpuGeomStorage, GridMesher, HostDevice,
  ReconstructionConfig, Session, SessionEvent,
};

/// Patch-based reconstruction over a TUM-style dataset.
#[derive(Parser, Debug)]
#[command(name = "patch_fusion")]
#[command(about = "Reconstructs a patch mesh from an RGB-D dataset folder")]
struct Args {
  /// Dataset folder containing associations.txt.
  dataset: PathBuf,

  /// Path to configuration TOML file.
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Override the number of GPU geometry slots.
  #[arg(long)]
  slots: Option<usize>,

  /// Playback speed relative to 30 Hz (0 = unpaced).
  #[arg(long)]
  replay_speed: Option<f32>,

  /// Stop after this many frames.
  #[arg(long)]
  max_frames: Option<usize>,
}

/// Passes through at most `left` frames.
struct FrameLimit {
  inner: Box<dyn FrameSource>,
  left: usize,
}

impl FrameSource for FrameLimit {
  fn calibration(&self) -> &patch_fusion::Calibration {
    self.inner.calibration()
  }

  fn next_frame(&mut self) -> Option<Result<patch_fusion::dataset::Frame, FrameSourceError>> {
    if self.left == 0 {
      return None;
    }
    self.left -= 1;
    self.inner.next_frame()
  }

  fn remaining(&self) -> Option<usize> {
    Some(self.inner.remaining().map_or(self.left, |remaining| remaining.min(self.left)))
  }
}

fn load_config(args: &Args) -> Result<ReconstructionConfig> {
  let mut config = match &args.config {
    Some(path) => ReconstructionConfig::load(path)
      .with_context(|| format!("Failed to load config: {}", path.display()))?,
    None => ReconstructionConfig::default(),
  };
  if let Some(slots) = args.slots {
    config = config.with_slot_count(slots);
  }
  if let Some(speed) = args.replay_speed {
    config.pacing.replay_speed = speed;
  }
  config.validate().context("Invalid configuration")?;
  Ok(config)
}

fn main() -> Result<()> {
  env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
  let args = Args::parse();
  let config = load_config(&args)?;

  let dataset = TumDataset::open(&args.dataset, &config.dataset)
    .with_context(|| format!("Failed to open dataset: {}", args.dataset.display()))?;
  if config.dataset.use_ground_truth && !dataset.has_ground_truth() {
    log::warn!("dataset has no groundtruth.txt, every frame uses the identity pose");
  }
  log::info!(
    "dataset {} with {} frames",
    dataset.folder().display(),
    dataset.frame_count()
  );

  let calibration = *dataset.calibration();
  let source: Box<dyn FrameSource> = match args.max_frames {
    Some(left) => Box::new(FrameLimit {
      inner: Box::new(dataset),
      left,
    }),
    None => Box::new(dataset),
  };

  let storage = Arc::new(GpuGeomStorage::new(
    &config.storage,
    Arc::new(HostDevice::new()),
    Arc::new(DeferredCollector::new()),
  ));
  let mesher = GridMesher::new(config.mesher);
  let stitcher = BoundaryStitcher::new(config.stitching.max_gap);
  let pacing = config.pacing;
  let updater = GeometryUpdater::new(config, calibration, storage.clone(), Box::new(mesher), Box::new(stitcher));

  let session = Session::spawn(updater, source, &pacing).context("Failed to start producer thread")?;
  let mut skipped = 0usize;
  loop {
    match session.wait_event(Duration::from_millis(100)) {
      Some(SessionEvent::Processed(report)) => {
        if report.oversized_patches > 0 {
          log::warn!(
            "frame {:>5}: {} patches too large for a slot, left out of the active set",
            report.frame.unwrap_or_default(),
            report.oversized_patches
          );
        }
        log::info!(
          "frame {:>5}: +{} patches, {} grown, {} merged | set {} patches, {} doubles, {} triples, {} incomplete | {} slots resident, {} reclaimed | {:.1} ms",
          report.frame.unwrap_or_default(),
          report.new_patches,
          report.updated_patches,
          report.merged_patches,
          report.active_patches,
          report.double_stitches,
          report.triple_stitches,
          report.incomplete_patches,
          report.resident_slots,
          report.reclaimed_slots,
          report.elapsed_us as f64 / 1000.0
        );
      }
      Some(SessionEvent::Skipped { frame, reason }) => {
        skipped += 1;
        log::warn!("frame {frame:?} skipped: {reason}");
      }
      None if session.is_finished() => break,
      None => {}
    }
  }
  // Events still queued after the producer finished
  while let Some(event) = session.poll_event() {
    if let SessionEvent::Skipped { .. } = event {
      skipped += 1;
    }
  }

  let publication = session.publication().clone();
  let summary = session.join().context("Reconstruction halted")?;
  let stats = storage.stats();
  println!(
    "Done: {} frames, {} published, {} skipped in {:.2}s",
    summary.frames,
    summary.published,
    summary.skipped,
    summary.elapsed.as_secs_f64()
  );
  println!(
    "Storage: {}/{} slots resident, {} allocations, {} reclaims",
    stats.resident, stats.capacity, stats.allocations, stats.reclaims
  );
  if let Some(set) = publication.latest() {
    let completeness = set.check_for_complete_geometry();
    println!(
      "Last active set #{}: {} patches, {} incomplete",
      set.sequence(),
      set.len(),
      completeness.incomplete_count()
    );
  }

  if summary.frames == 0 && skipped > 0 {
    bail!("no frame could be processed");
  }
  Ok(())
}
