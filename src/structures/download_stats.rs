/// Current information about the download activity, emitted once a second.
#[derive(Debug, Clone, Copy, Default)]
pub struct DownloadStats {
  /// Running average of download speed in bytes per second.
  pub speed: u64,
  /// Total number of bytes downloaded.
  pub total_bytes: u64,
}
