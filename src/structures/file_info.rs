use chrono::{DateTime, Utc};

/// Limited information about an existing file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BasicFileInfo {
  /// When the file was last modified.
  pub mod_time: DateTime<Utc>,
}
