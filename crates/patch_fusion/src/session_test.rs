use std::collections::VecDeque;

use super::*;
use crate::config::ReconstructionConfig;
use crate::dataset::Frame;
use crate::error::FrameSourceError;
use crate::test_utils::{quad, test_calibration, test_frame, test_storage, ScriptedMesher, ScriptedStitcher};
use crate::types::Calibration;
use crate::updater::{MesherOutput, NeighborRef, NewPatch};

/// Frames from memory. With `endless`, repeats the last frame forever.
struct MemorySource {
  calibration: Calibration,
  frames: VecDeque<Result<Frame, FrameSourceError>>,
  endless: bool,
  next_index: u64,
}

impl MemorySource {
  fn new(frames: Vec<Result<Frame, FrameSourceError>>) -> Self {
    Self {
      calibration: test_calibration(),
      frames: frames.into(),
      endless: false,
      next_index: 0,
    }
  }

  fn endless() -> Self {
    Self {
      endless: true,
      ..Self::new(Vec::new())
    }
  }
}

impl FrameSource for MemorySource {
  fn calibration(&self) -> &Calibration {
    &self.calibration
  }

  fn next_frame(&mut self) -> Option<Result<Frame, FrameSourceError>> {
    if self.endless {
      self.next_index += 1;
      return Some(Ok(test_frame(self.next_index, 1.0)));
    }
    self.frames.pop_front()
  }
}

fn pair() -> MesherOutput {
  MesherOutput {
    new_patches: vec![
      NewPatch {
        geometry: quad([0.0; 3], 1.0),
        neighbors: vec![NeighborRef::New(1)],
      },
      NewPatch {
        geometry: quad([1.0, 0.0, 0.0], 1.0),
        neighbors: vec![],
      },
    ],
    ..Default::default()
  }
}

/// Raises `dropped` once the producer lets go of its source.
struct TrackedSource {
  inner: MemorySource,
  dropped: Arc<AtomicBool>,
}

impl FrameSource for TrackedSource {
  fn calibration(&self) -> &Calibration {
    self.inner.calibration()
  }

  fn next_frame(&mut self) -> Option<Result<Frame, FrameSourceError>> {
    self.inner.next_frame()
  }
}

impl Drop for TrackedSource {
  fn drop(&mut self) {
    self.dropped.store(true, Ordering::SeqCst);
  }
}

fn updater(slot_count: usize, mesher: &ScriptedMesher) -> GeometryUpdater {
  let config = ReconstructionConfig::default().with_slot_count(slot_count);
  let (storage, _) = test_storage(slot_count);
  GeometryUpdater::new(
    config,
    test_calibration(),
    storage,
    Box::new(mesher.clone()),
    Box::new(ScriptedStitcher::new()),
  )
}

fn drain(session: &Session) -> Vec<SessionEvent> {
  std::iter::from_fn(|| session.poll_event()).collect()
}

#[test]
fn test_session_processes_every_frame() {
  let mesher = ScriptedMesher::new();
  mesher.push(pair());
  let frames = (0..3).map(|i| Ok(test_frame(i, 1.0))).collect();
  let session = Session::spawn(
    updater(16, &mesher),
    Box::new(MemorySource::new(frames)),
    &PacingConfig::default(),
  )
  .unwrap();
  let publication = session.publication().clone();

  let summary = session.join().unwrap();
  assert_eq!(summary.frames, 3);
  assert_eq!(summary.published, 3);
  assert_eq!(summary.skipped, 0);
  assert_eq!(summary.last_sequence, Some(publication.sequence()));
  assert_eq!(publication.latest().unwrap().len(), 2);
}

#[test]
fn test_events_report_each_frame() {
  let mesher = ScriptedMesher::new();
  mesher.push(pair());
  let frames = vec![
    Ok(test_frame(0, 1.0)),
    Err(FrameSourceError::MissingAssociations("nowhere".into())),
    Ok(test_frame(1, 1.0)),
  ];
  let session = Session::spawn(
    updater(16, &mesher),
    Box::new(MemorySource::new(frames)),
    &PacingConfig::default(),
  )
  .unwrap();

  while !session.is_finished() {
    std::thread::sleep(Duration::from_millis(1));
  }
  let events = drain(&session);
  assert_eq!(events.len(), 3);
  assert!(matches!(&events[0], SessionEvent::Processed(report) if report.new_patches == 2));
  assert!(matches!(&events[1], SessionEvent::Skipped { frame: None, .. }));
  assert!(matches!(&events[2], SessionEvent::Processed(report) if report.frame == Some(1)));

  let summary = session.join().unwrap();
  assert_eq!((summary.frames, summary.skipped), (2, 1));
}

#[test]
fn test_fatal_error_halts_session() {
  let mesher = ScriptedMesher::new();
  mesher.push(pair());
  mesher.push(MesherOutput {
    new_patches: vec![NewPatch {
      geometry: quad([2.0, 0.0, 0.0], 1.0),
      neighbors: vec![NeighborRef::Existing(crate::graph::PatchId::new(2))],
    }],
    ..Default::default()
  });
  let frames = (0..4).map(|i| Ok(test_frame(i, 1.0))).collect();
  // Room for the first pair and its stitch only
  let session = Session::spawn(
    updater(3, &mesher),
    Box::new(MemorySource::new(frames)),
    &PacingConfig::default(),
  )
  .unwrap();
  let publication = session.publication().clone();

  let err = session.join().unwrap_err();
  assert!(err.is_fatal());
  assert_eq!(publication.published_count(), 1);
  assert_eq!(publication.latest().unwrap().len(), 2);
}

#[test]
fn test_stop_ends_endless_source() {
  let mesher = ScriptedMesher::new();
  mesher.push(pair());
  let pacing = PacingConfig {
    target_frame_interval_ms: Some(2.0),
    ..PacingConfig::default()
  };
  let session = Session::spawn(updater(16, &mesher), Box::new(MemorySource::endless()), &pacing).unwrap();

  assert!(session.wait_event(Duration::from_secs(10)).is_some());
  session.stop();
  let summary = session.join().unwrap();
  assert!(summary.frames >= 1);
  assert_eq!(summary.skipped, 0);
}

#[test]
fn test_dropping_session_stops_producer() {
  let mesher = ScriptedMesher::new();
  mesher.push(pair());
  let dropped = Arc::new(AtomicBool::new(false));
  let source = TrackedSource {
    inner: MemorySource::endless(),
    dropped: dropped.clone(),
  };
  let pacing = PacingConfig {
    target_frame_interval_ms: Some(2.0),
    ..PacingConfig::default()
  };
  let session = Session::spawn(updater(16, &mesher), Box::new(source), &pacing).unwrap();
  assert!(session.wait_event(Duration::from_secs(10)).is_some());
  assert!(!session.is_finished());
  drop(session);

  let deadline = Instant::now() + Duration::from_secs(10);
  while !dropped.load(Ordering::SeqCst) && Instant::now() < deadline {
    std::thread::sleep(Duration::from_millis(1));
  }
  assert!(dropped.load(Ordering::SeqCst));
}

#[test]
fn test_join_reports_producer_summary_without_frames() {
  let mesher = ScriptedMesher::new();
  let session = Session::spawn(
    updater(16, &mesher),
    Box::new(MemorySource::new(Vec::new())),
    &PacingConfig::default(),
  )
  .unwrap();
  let summary = session.join().unwrap();
  assert_eq!((summary.frames, summary.published, summary.skipped), (0, 0, 0));
  assert_eq!(summary.last_sequence, None);
}
