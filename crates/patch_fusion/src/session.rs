//! Producer session: pulls frames, runs the updater, publishes active sets.
//!
//! The producer owns the updater (and with it the patch graph) on its own
//! thread. Consumers only ever touch the shared [`Publication`] and the event
//! channel, so no consumer can block reconstruction for longer than a pointer
//! swap.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{self as channel, Receiver, Sender, TryRecvError};
use web_time::Instant;

use crate::active_set::Publication;
use crate::config::PacingConfig;
use crate::dataset::{FramePacer, FrameSource};
use crate::error::UpdateError;
use crate::types::Pose;
use crate::updater::{FrameReport, GeometryUpdater};

/// Events buffered for consumers; once full, new events are dropped.
const EVENT_CAPACITY: usize = 256;

/// What happened to one frame.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
  Processed(FrameReport),
  /// Recoverable failure; the previous active set stays published.
  Skipped { frame: Option<u64>, reason: String },
}

/// Totals of a finished session.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SessionSummary {
  pub frames: u64,
  pub published: u64,
  pub skipped: u64,
  /// Sequence of the last active set this session published.
  pub last_sequence: Option<u64>,
  pub elapsed: Duration,
}

/// Handle to a running producer thread.
pub struct Session {
  publication: Arc<Publication>,
  events: Receiver<SessionEvent>,
  stop: StopOnDrop,
  thread: JoinHandle<Result<SessionSummary, UpdateError>>,
}

/// Raises the stop flag when the owning session goes away without a join.
struct StopOnDrop(Arc<AtomicBool>);

impl StopOnDrop {
  fn raise(&self) {
    self.0.store(true, Ordering::Relaxed);
  }
}

impl Drop for StopOnDrop {
  fn drop(&mut self) {
    self.raise();
  }
}

impl Session {
  /// Start reconstructing from `source` on a new thread.
  ///
  /// Frames carrying a ground-truth pose use it; otherwise the last known
  /// pose is kept (identity before the first one). Fails only if the OS
  /// refuses to start the thread.
  pub fn spawn(
    updater: GeometryUpdater,
    source: Box<dyn FrameSource>,
    pacing: &PacingConfig,
  ) -> std::io::Result<Self> {
    let publication = updater.publication().clone();
    let (sender, events) = channel::bounded(EVENT_CAPACITY);
    let stop = Arc::new(AtomicBool::new(false));

    let producer = Producer {
      updater,
      source,
      pacer: FramePacer::new(pacing),
      sender,
      stop: stop.clone(),
    };
    let thread = thread::Builder::new()
      .name("patch-fusion-producer".into())
      .spawn(move || producer.run())
      .map_err(|err| {
        tracing::error!(error = %err, "failed to spawn producer thread");
        err
      })?;

    Ok(Self {
      publication,
      events,
      stop: StopOnDrop(stop),
      thread,
    })
  }

  pub fn publication(&self) -> &Arc<Publication> {
    &self.publication
  }

  /// Next event, without blocking.
  pub fn poll_event(&self) -> Option<SessionEvent> {
    match self.events.try_recv() {
      Ok(event) => Some(event),
      Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
    }
  }

  /// Next event, waiting up to `timeout`.
  pub fn wait_event(&self, timeout: Duration) -> Option<SessionEvent> {
    self.events.recv_timeout(timeout).ok()
  }

  /// True once the producer has finished (end of data, stop or fatal error).
  pub fn is_finished(&self) -> bool {
    self.thread.is_finished()
  }

  /// Ask the producer to stop after the frame in progress.
  pub fn stop(&self) {
    self.stop.raise();
  }

  /// Wait for the producer. A fatal update error is returned as-is.
  pub fn join(self) -> Result<SessionSummary, UpdateError> {
    let Session { thread, stop, .. } = self;
    let joined = thread.join();
    drop(stop);
    match joined {
      Ok(result) => result,
      Err(panic) => std::panic::resume_unwind(panic),
    }
  }
}

struct Producer {
  updater: GeometryUpdater,
  source: Box<dyn FrameSource>,
  pacer: FramePacer,
  sender: Sender<SessionEvent>,
  stop: Arc<AtomicBool>,
}

impl Producer {
  fn run(mut self) -> Result<SessionSummary, UpdateError> {
    let _span = tracing::info_span!("session").entered();
    let start = Instant::now();
    let mut summary = SessionSummary::default();
    let mut pose = Pose::IDENTITY;

    while !self.stop.load(Ordering::Relaxed) {
      let Some(next) = self.source.next_frame() else {
        tracing::info!(frames = summary.frames, "frame source exhausted");
        break;
      };
      let frame = match next {
        Ok(frame) => frame,
        Err(err) => {
          tracing::warn!(error = %err, "unreadable frame skipped");
          summary.skipped += 1;
          self.emit(SessionEvent::Skipped {
            frame: None,
            reason: err.to_string(),
          });
          continue;
        }
      };

      self.pacer.wait();
      if let Some(ground_truth) = frame.ground_truth {
        pose = ground_truth;
      }

      match self.updater.extend(&frame, &pose) {
        Ok(report) => {
          summary.frames += 1;
          if report.published.is_some() {
            summary.published += 1;
            summary.last_sequence = report.published;
          }
          self.emit(SessionEvent::Processed(report));
        }
        Err(err) if err.is_fatal() => {
          tracing::error!(frame = frame.index, error = %err, "reconstruction halted");
          return Err(err);
        }
        Err(err) => {
          summary.skipped += 1;
          self.emit(SessionEvent::Skipped {
            frame: Some(frame.index),
            reason: err.to_string(),
          });
        }
      }
    }

    summary.elapsed = start.elapsed();
    tracing::info!(
      frames = summary.frames,
      published = summary.published,
      skipped = summary.skipped,
      "session finished"
    );
    Ok(summary)
  }

  fn emit(&self, event: SessionEvent) {
    // Consumers that fall behind lose events, never frames
    if self.sender.try_send(event).is_err() {
      tracing::trace!("event channel full or closed, event dropped");
    }
  }
}

#[cfg(test)]
#[path = "session_test.rs"]
mod session_test;
