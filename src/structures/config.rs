use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use crate::structures::Progress;

/// Callback receiving progress snapshots at a fixed interval.
pub type ProgressFn = Box<dyn Fn(Progress) + Send + Sync>;

/// Configuration of the download system.
#[derive(Debug, Clone)]
pub struct DownloadConfig {
  /// Maximum number of attempts per file.
  pub max_attempts: u32,
  /// Minimum time between retries.
  pub retry_base_delay: Duration,
  /// How much to multiply the delay between retries after each retry.
  pub retry_wait_increment_factor: f64,
  /// How many seconds to average the download speed over.
  pub download_speed_window: usize,
  /// How much time to allow to send a request and receive the start of a
  /// response.
  pub request_timeout: Duration,
  /// How much time to allow between receiving any data in a download.
  pub stall_timeout: Duration,
}

impl Default for DownloadConfig {
  fn default() -> Self {
    DownloadConfig {
      max_attempts: 5,
      retry_base_delay: Duration::from_secs(1),
      retry_wait_increment_factor: 1.5,
      download_speed_window: 5,
      request_timeout: Duration::from_secs(30),
      stall_timeout: Duration::from_secs(30),
    }
  }
}

/// Configuration for a patcher run.
pub struct PatcherConfig {
  /// URL of the "directory" containing the patch files.
  pub base_url: Url,
  /// Directory where the game should be installed.
  pub install_dir: PathBuf,
  /// Product tag that should be stored in the manifest.
  pub product: String,
  /// How many concurrent workers in the verify phase.
  pub verify_workers: usize,
  /// How many concurrent workers in the download phase.
  pub download_workers: usize,
  /// How many concurrent workers in the apply phase.
  pub apply_workers: usize,
  /// Configuration of the download system.
  pub download: DownloadConfig,
  /// Where to find the xdelta binary. A bare name without directory is
  /// looked up in PATH.
  pub xdelta_bin_path: String,
  /// Gets called every `progress_interval` with the current progress, and
  /// exactly once more when the run ends.
  pub progress_fn: ProgressFn,
  /// How often to call `progress_fn`.
  pub progress_interval: Duration,
}

impl PatcherConfig {
  /// Creates a configuration with defaults for everything but the
  /// destination and the progress sink.
  pub fn new(base_url: Url, install_dir: PathBuf, product: String, progress_fn: ProgressFn) -> Self {
    let workers = default_workers();
    PatcherConfig {
      base_url,
      install_dir,
      product,
      verify_workers: workers,
      download_workers: workers,
      apply_workers: workers,
      download: DownloadConfig::default(),
      xdelta_bin_path: "xdelta3".to_string(),
      progress_fn,
      progress_interval: Duration::from_secs(1),
    }
  }
}

fn default_workers() -> usize {
  num_cpus::get().clamp(1, 4)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn default_workers_at_least_one() {
    assert!(default_workers() >= 1);
  }

  #[test]
  fn download_config_defaults() {
    let config = DownloadConfig::default();
    assert_eq!(config.max_attempts, 5);
    assert_eq!(config.retry_base_delay, Duration::from_secs(1));
  }
}
