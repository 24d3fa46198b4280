use std::path::PathBuf;
use std::time::Duration;

/// Everything that can go wrong while patching.
#[derive(Debug, thiserror::Error)]
pub enum Error {
  // Input validation.
  #[error("instructions couldn't be decoded: {0}")]
  InstructionsJson(#[from] serde_json::Error),
  #[error("instructions contain a path that is absolute or escapes the install directory: {0}")]
  NonLocalPath(String),
  #[error("instructions have HasDelta and DeltaHash disagreeing for {0}")]
  InconsistentDelta(String),
  #[error("instructions contain duplicate path {0}")]
  DuplicatePath(String),
  #[error("manifest contains wrong product (are you updating the wrong game?), expected {expected:?} got {found:?}")]
  WrongProduct { expected: String, found: String },
  #[error("manifest couldn't be decoded: {0}")]
  ManifestJson(#[source] serde_json::Error),

  // I/O, with a note about what was being done.
  #[error("{what}: {source}")]
  Io {
    what: String,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to create HTTP client: {0}")]
  HttpClient(#[source] reqwest::Error),

  // Network, consumed by the per-file retry loop.
  #[error("failed to request download of '{url}': {source}")]
  Request {
    url: String,
    #[source]
    source: reqwest::Error,
  },
  #[error("request timeout ({0:?}) exceeded")]
  RequestTimeout(Duration),
  #[error("download stalled for at least {0:?}")]
  Stalled(Duration),
  #[error("failed to download '{url}' (status {status})")]
  UnexpectedStatus {
    url: String,
    status: reqwest::StatusCode,
  },
  #[error("server doesn't understand Range requests for '{0}'")]
  RangeNotSupported(String),
  #[error("expected application/octet-stream from '{url}' but got {content_type:?}")]
  WrongContentType { url: String, content_type: String },
  #[error("downloaded file '{path}' has wrong size, expected {expected} bytes, got {actual}")]
  SizeMismatch {
    path: PathBuf,
    expected: u64,
    actual: u64,
  },
  #[error("downloaded file '{path}' has invalid checksum, expected {expected}, got {actual}")]
  ChecksumMismatch {
    path: PathBuf,
    expected: String,
    actual: String,
  },

  // Patch application. The output mismatch is fatal, unlike its download
  // counterpart, because the patch file itself already passed verification.
  #[error("{what} produced a file with checksum {actual}, expected {expected}")]
  PatchOutputMismatch {
    what: String,
    expected: String,
    actual: String,
  },
  #[error("{what} failed: {message}")]
  XDelta { what: String, message: String },

  #[error("operation was cancelled")]
  Cancelled,

  // Programming error, the caller must not reuse a patch file path.
  #[error("download_file called twice for '{0}'")]
  DownloadConflict(PathBuf),
}

impl Error {
  /// Wrap an I/O error with a note about the operation that failed.
  pub(crate) fn io(what: impl Into<String>, source: std::io::Error) -> Self {
    Error::Io {
      what: what.into(),
      source,
    }
  }

  /// True for errors that are just the run being cancelled from outside.
  /// These are neither failures nor successes.
  pub fn is_cancellation(&self) -> bool {
    matches!(self, Error::Cancelled)
  }

  /// True for errors the downloader may consume with a retry. Internal
  /// timeouts count, an external cancellation does not.
  pub fn is_retryable(&self) -> bool {
    matches!(
      self,
      Error::Request { .. }
        | Error::RequestTimeout(_)
        | Error::Stalled(_)
        | Error::UnexpectedStatus { .. }
        | Error::RangeNotSupported(_)
        | Error::WrongContentType { .. }
        | Error::SizeMismatch { .. }
        | Error::ChecksumMismatch { .. }
    )
  }
}
