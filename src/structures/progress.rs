use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Serialize, Serializer};

use crate::structures::{DownloadStats, Error};

/// The three phases of the patching process, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
  Verify,
  Download,
  Apply,
}

/// Progress in a particular phase.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressPhase {
  /// How many items are being processed right now.
  pub processing: usize,
  /// How many items have been successfully processed.
  pub completed: usize,
  /// How many items have errored.
  pub errors: usize,
  /// How many items should be processed.
  pub needed: usize,
  /// Whether `needed` has been determined yet. For the download and apply
  /// phases that only happens once the verify phase has produced a plan.
  pub needed_known: bool,
  /// Whether the phase is finished. `completed == 0 && done` means the
  /// phase had nothing to do.
  pub done: bool,
  /// When the phase was started, if started.
  #[serde(skip)]
  pub started_at: Option<Instant>,
  /// How much time has been spent in the phase.
  #[serde(serialize_with = "duration_as_secs")]
  pub duration: Duration,
}

impl ProgressPhase {
  fn update_duration_to_now(&mut self, now: Instant) {
    if let Some(started_at) = self.started_at {
      if !self.done {
        self.duration = now.duration_since(started_at);
      }
    }
  }
}

/// Current progress information. Serializes to the shape JSON progress
/// consumers expect.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
  /// Running average of download speed in bytes per second.
  pub download_speed: u64,
  /// Total bytes downloaded.
  pub download_total_bytes: u64,
  /// Progress in the verify phase.
  pub verify: ProgressPhase,
  /// Progress in the download phase.
  pub download: ProgressPhase,
  /// Progress in the apply phase.
  pub apply: ProgressPhase,
}

impl Progress {
  fn phase_mut(&mut self, phase: Phase) -> &mut ProgressPhase {
    match phase {
      Phase::Verify => &mut self.verify,
      Phase::Download => &mut self.download,
      Phase::Apply => &mut self.apply,
    }
  }

  /// The phase data for a phase.
  pub fn phase(&self, phase: Phase) -> &ProgressPhase {
    match phase {
      Phase::Verify => &self.verify,
      Phase::Download => &self.download,
      Phase::Apply => &self.apply,
    }
  }
}

/// Tracks the progress of the patching process. All operations lock one
/// internal mutex, making this safe to share between workers.
#[derive(Debug, Default)]
pub struct ProgressTracker {
  current: Mutex<Progress>,
}

impl ProgressTracker {
  pub fn new() -> ProgressTracker {
    ProgressTracker::default()
  }

  /// A copy of the current progress with durations of running phases
  /// recomputed against the current time.
  pub fn current(&self) -> Progress {
    let mut rv = self.current.lock().unwrap().clone();
    let now = Instant::now();
    rv.verify.update_duration_to_now(now);
    rv.download.update_duration_to_now(now);
    rv.apply.update_duration_to_now(now);
    rv
  }

  /// Updates the download related statistics.
  pub fn update_download_stats(&self, stats: DownloadStats) {
    let mut current = self.current.lock().unwrap();
    current.download_speed = stats.speed;
    current.download_total_bytes = stats.total_bytes;
  }

  /// Marks a phase as started.
  pub fn phase_started(&self, phase: Phase) {
    let mut current = self.current.lock().unwrap();
    current.phase_mut(phase).started_at = Some(Instant::now());
  }

  /// Sets the needed value for a phase. `known` records whether the value
  /// is final rather than a placeholder.
  pub fn phase_set_needed(&self, phase: Phase, needed: usize, known: bool) {
    let mut current = self.current.lock().unwrap();
    let ph = current.phase_mut(phase);
    ph.needed = needed;
    ph.needed_known = known;
  }

  /// Marks a phase as finished.
  pub fn phase_done(&self, phase: Phase) {
    let mut current = self.current.lock().unwrap();
    let ph = current.phase_mut(phase);
    ph.done = true;
    if let Some(started_at) = ph.started_at {
      ph.duration = started_at.elapsed();
    }
  }

  /// Increments the processing count of a phase.
  pub fn phase_item_started(&self, phase: Phase) {
    let mut current = self.current.lock().unwrap();
    current.phase_mut(phase).processing += 1;
  }

  /// Moves an item out of processing, into completed or errors depending on
  /// the outcome. A cancellation is neither completed nor an error.
  pub fn phase_item_done(&self, phase: Phase, err: Option<&Error>) {
    let mut current = self.current.lock().unwrap();
    let ph = current.phase_mut(phase);
    // No protection against going below 0 beyond saturation; a mismatch
    // here is a visual bug, not a correctness problem.
    ph.processing = ph.processing.saturating_sub(1);
    match err {
      None => ph.completed += 1,
      Some(e) if e.is_cancellation() => {}
      Some(_) => ph.errors += 1,
    }
  }

  /// Increases the completed count without putting items in processing.
  /// Used for items that could be skipped entirely.
  pub fn phase_items_skipped(&self, phase: Phase, count: usize) {
    let mut current = self.current.lock().unwrap();
    current.phase_mut(phase).completed += count;
  }
}

fn duration_as_secs<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
  S: Serializer,
{
  serializer.serialize_u64(duration.as_secs())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn item_lifecycle() {
    let tracker = ProgressTracker::new();
    tracker.phase_started(Phase::Verify);
    tracker.phase_set_needed(Phase::Verify, 3, true);
    tracker.phase_item_started(Phase::Verify);
    assert_eq!(tracker.current().verify.processing, 1);
    tracker.phase_item_done(Phase::Verify, None);
    let p = tracker.current();
    assert_eq!(p.verify.processing, 0);
    assert_eq!(p.verify.completed, 1);
    assert_eq!(p.verify.errors, 0);
  }

  #[test]
  fn item_error_counts_as_error() {
    let tracker = ProgressTracker::new();
    tracker.phase_item_started(Phase::Download);
    let err = Error::RangeNotSupported("x".to_string());
    tracker.phase_item_done(Phase::Download, Some(&err));
    let p = tracker.current();
    assert_eq!(p.download.completed, 0);
    assert_eq!(p.download.errors, 1);
  }

  #[test]
  fn cancellation_is_neither_completed_nor_error() {
    let tracker = ProgressTracker::new();
    tracker.phase_item_started(Phase::Apply);
    tracker.phase_item_done(Phase::Apply, Some(&Error::Cancelled));
    let p = tracker.current();
    assert_eq!(p.apply.processing, 0);
    assert_eq!(p.apply.completed, 0);
    assert_eq!(p.apply.errors, 0);
  }

  #[test]
  fn skipped_items_count_as_completed() {
    let tracker = ProgressTracker::new();
    tracker.phase_items_skipped(Phase::Verify, 5);
    assert_eq!(tracker.current().verify.completed, 5);
  }

  #[test]
  fn done_freezes_duration() {
    let tracker = ProgressTracker::new();
    tracker.phase_started(Phase::Verify);
    tracker.phase_done(Phase::Verify);
    let first = tracker.current().verify.duration;
    std::thread::sleep(std::time::Duration::from_millis(5));
    assert_eq!(tracker.current().verify.duration, first);
  }

  #[test]
  fn download_stats_propagate() {
    let tracker = ProgressTracker::new();
    tracker.update_download_stats(DownloadStats {
      speed: 42,
      total_bytes: 1000,
    });
    let p = tracker.current();
    assert_eq!(p.download_speed, 42);
    assert_eq!(p.download_total_bytes, 1000);
  }
}
