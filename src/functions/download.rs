use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use reqwest::header;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::functions::{hash_eq, prealloc};
use crate::structures::{Averager, DownloadConfig, DownloadStats, Error};

const OCTET_STREAM: &str = "application/octet-stream";

/// Manages downloads. Mainly it keeps track of progress and download speed;
/// the per-file work happens in `download_file`, many of which are expected
/// to run concurrently on one `Downloader`.
pub struct Downloader {
  config: DownloadConfig,
  client: reqwest::Client,
  state: Arc<Mutex<DownloaderState>>,
}

/// Bookkeeping under the downloader mutex. Hash state deliberately lives
/// outside of it, owned by each `download_file` call, so SHA-256 work never
/// happens while this is locked.
struct DownloaderState {
  /// Current and past downloads: local filename to the index of the
  /// `download_file` call that owns it. The index distinguishes a retry of
  /// the same logical download (allowed) from a second download aimed at
  /// the same path (a caller bug).
  downloads: HashMap<PathBuf, u64>,
  /// Running average of download speed.
  download_speed: Averager,
  bytes_downloaded_this_second: u64,
  bytes_downloaded_total: u64,
  /// How many downloads have been started.
  download_count: u64,
}

impl DownloaderState {
  /// Per-second bookkeeping; returns stats to be propagated.
  fn tick(&mut self) -> DownloadStats {
    self.download_speed.add(self.bytes_downloaded_this_second as f64);
    self.bytes_downloaded_this_second = 0;
    DownloadStats {
      speed: self.download_speed.average() as u64,
      total_bytes: self.bytes_downloaded_total,
    }
  }
}

impl Downloader {
  /// Creates a new downloader. `tick_fn` receives the download stats every
  /// second until `ticker_cancel` is cancelled, after which it is invoked
  /// one final time with the speed forced to zero (otherwise the last
  /// reported speed would stick around and that looks silly).
  pub fn new(
    config: DownloadConfig,
    tick_fn: impl Fn(DownloadStats) + Send + 'static,
    ticker_cancel: CancellationToken,
  ) -> Result<Downloader, Error> {
    let client = reqwest::Client::builder()
      .build()
      .map_err(Error::HttpClient)?;
    let state = Arc::new(Mutex::new(DownloaderState {
      downloads: HashMap::new(),
      download_speed: Averager::new(config.download_speed_window.max(1)),
      bytes_downloaded_this_second: 0,
      bytes_downloaded_total: 0,
      download_count: 0,
    }));

    let ticker_state = state.clone();
    tokio::spawn(async move {
      let mut interval = tokio::time::interval(Duration::from_secs(1));
      interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
      // The first tick of an interval completes immediately.
      interval.tick().await;
      loop {
        tokio::select! {
          _ = interval.tick() => {
            let stats = ticker_state.lock().unwrap().tick();
            tick_fn(stats);
          }
          _ = ticker_cancel.cancelled() => {
            let total_bytes = ticker_state.lock().unwrap().bytes_downloaded_total;
            tick_fn(DownloadStats {
              speed: 0,
              total_bytes,
            });
            return;
          }
        }
      }
    });

    Ok(Downloader {
      config,
      client,
      state,
    })
  }

  /// Downloads a file to disk, verifying its SHA256 hash and size.
  ///
  /// Callers must not issue two `download_file` calls for the same
  /// `filename`; doing so fails with a `DownloadConflict`. Within one call
  /// the download is attempted up to `max_attempts` times with a growing
  /// wait in between. An external cancellation stops the retry loop
  /// immediately and is not logged as an error.
  pub async fn download_file(
    &self,
    cancel: &CancellationToken,
    download_url: Url,
    filename: &Path,
    expected_checksum: &str,
    expected_size: u64,
  ) -> Result<(), Error> {
    let download_idx = {
      let mut state = self.state.lock().unwrap();
      let idx = state.download_count;
      state.download_count += 1;
      idx
    };

    let mut wait_time = self.config.retry_base_delay;
    let mut attempt = 1u32;
    loop {
      let result = self
        .do_download_file(
          cancel,
          &download_url,
          filename,
          expected_checksum,
          expected_size,
          download_idx,
        )
        .await;
      let err = match result {
        Ok(()) => return Ok(()),
        // Don't log cancellations, those likely aren't errors.
        Err(e) if e.is_cancellation() => return Err(e),
        Err(e) if !e.is_retryable() => return Err(e),
        Err(e) => e,
      };
      if attempt >= self.config.max_attempts {
        return Err(err);
      }
      tracing::warn!(
        attempt,
        max_attempts = self.config.max_attempts,
        wait = ?wait_time,
        error = %err,
        "download failed, waiting until next attempt"
      );
      attempt += 1;
      tokio::select! {
        _ = tokio::time::sleep(wait_time) => {}
        _ = cancel.cancelled() => return Err(Error::Cancelled),
      }
      wait_time = wait_time.mul_f64(self.config.retry_wait_increment_factor);
    }
  }

  /// One download attempt.
  async fn do_download_file(
    &self,
    cancel: &CancellationToken,
    download_url: &Url,
    filename: &Path,
    expected_checksum: &str,
    expected_size: u64,
    download_idx: u64,
  ) -> Result<(), Error> {
    self.register(filename, download_idx)?;

    let mut file = OpenOptions::new()
      .read(true)
      .write(true)
      .create(true)
      .open(filename)
      .await
      .map_err(|e| {
        Error::io(
          format!(
            "failed to open '{}' for downloading '{}' to",
            filename.display(),
            download_url
          ),
          e,
        )
      })?;

    // Recover whatever a previous run or a previous attempt left behind.
    // A correct complete file skips the network entirely, a correct prefix
    // becomes the resume offset, anything else starts over.
    let mut hasher = Sha256::new();
    let len = file
      .metadata()
      .await
      .map_err(|e| Error::io(format!("failed to stat '{}'", filename.display()), e))?
      .len();
    let mut offset = 0u64;
    if len > expected_size {
      restart(&mut file, filename).await?;
    } else if len > 0 {
      stream_through_hasher(cancel, &mut file, filename, &mut hasher).await?;
      if len == expected_size {
        let checksum = hex::encode(hasher.clone().finalize());
        if hash_eq(&checksum, expected_checksum) {
          tracing::info!(
            file = %filename.display(),
            "patch file is already present, skipping download"
          );
          return Ok(());
        }
        restart(&mut file, filename).await?;
        hasher = Sha256::new();
      } else {
        offset = len;
      }
    }
    if offset == 0 {
      // Best effort; a filesystem that can't reserve space just finds out
      // about a full disk later.
      if let Err(e) = prealloc::reserve(&file, expected_size) {
        tracing::debug!(
          file = %filename.display(),
          error = %e,
          "preallocation failed, continuing without"
        );
      }
    }

    let mut request = self.client.get(download_url.clone());
    if offset > 0 {
      request = request.header(
        header::RANGE,
        format!("bytes={}-{}", offset, expected_size - 1),
      );
    }
    let response = tokio::select! {
      result = request.send() => result.map_err(|e| Error::Request {
        url: download_url.to_string(),
        source: e,
      })?,
      _ = tokio::time::sleep(self.config.request_timeout) => {
        return Err(Error::RequestTimeout(self.config.request_timeout));
      }
      _ = cancel.cancelled() => return Err(Error::Cancelled),
    };

    let status = response.status();
    if offset > 0 && status == StatusCode::OK {
      // The server ignored the Range header. Truncate so the next attempt
      // requests the whole file instead of burning every retry on the same
      // rejected request.
      restart(&mut file, filename).await?;
      return Err(Error::RangeNotSupported(download_url.to_string()));
    }
    let expected_status = if offset > 0 {
      StatusCode::PARTIAL_CONTENT
    } else {
      StatusCode::OK
    };
    if status != expected_status {
      return Err(Error::UnexpectedStatus {
        url: download_url.to_string(),
        status,
      });
    }

    // Captive portals and interfering middleboxes tend to substitute HTML;
    // the patch server always serves octet-stream.
    let content_type = response
      .headers()
      .get(header::CONTENT_TYPE)
      .and_then(|v| v.to_str().ok())
      .unwrap_or_default()
      .to_string();
    if content_type != OCTET_STREAM {
      return Err(Error::WrongContentType {
        url: download_url.to_string(),
        content_type,
      });
    }

    let mut stream = response.bytes_stream();
    let mut written = offset;
    loop {
      let next = tokio::select! {
        result = tokio::time::timeout(self.config.stall_timeout, stream.next()) => result,
        _ = cancel.cancelled() => return Err(Error::Cancelled),
      };
      let chunk = match next {
        Err(_) => return Err(Error::Stalled(self.config.stall_timeout)),
        Ok(None) => break,
        Ok(Some(Err(e))) => {
          return Err(Error::Request {
            url: download_url.to_string(),
            source: e,
          });
        }
        Ok(Some(Ok(chunk))) => chunk,
      };
      file.write_all(&chunk).await.map_err(|e| {
        Error::io(format!("failed to write to '{}'", filename.display()), e)
      })?;
      hasher.update(&chunk);
      written += chunk.len() as u64;
      self.note_bytes(chunk.len() as u64);
    }
    file
      .flush()
      .await
      .map_err(|e| Error::io(format!("failed to flush '{}'", filename.display()), e))?;

    if written != expected_size {
      return Err(Error::SizeMismatch {
        path: filename.to_path_buf(),
        expected: expected_size,
        actual: written,
      });
    }
    let actual_checksum = hex::encode(hasher.finalize());
    if !hash_eq(expected_checksum, &actual_checksum) {
      return Err(Error::ChecksumMismatch {
        path: filename.to_path_buf(),
        expected: expected_checksum.to_string(),
        actual: actual_checksum,
      });
    }
    Ok(())
  }

  fn register(&self, filename: &Path, download_idx: u64) -> Result<(), Error> {
    let mut state = self.state.lock().unwrap();
    if let Some(existing_idx) = state.downloads.get(filename) {
      // The same index means it's a retry of the same download.
      if *existing_idx != download_idx {
        return Err(Error::DownloadConflict(filename.to_path_buf()));
      }
    }
    state.downloads.insert(filename.to_path_buf(), download_idx);
    Ok(())
  }

  fn note_bytes(&self, count: u64) {
    let mut state = self.state.lock().unwrap();
    state.bytes_downloaded_this_second += count;
    state.bytes_downloaded_total += count;
  }
}

async fn restart(file: &mut tokio::fs::File, filename: &Path) -> Result<(), Error> {
  file
    .set_len(0)
    .await
    .map_err(|e| Error::io(format!("failed to truncate '{}'", filename.display()), e))?;
  file
    .seek(SeekFrom::Start(0))
    .await
    .map_err(|e| Error::io(format!("failed to seek in '{}'", filename.display()), e))?;
  Ok(())
}

/// Feeds the remaining bytes of `file` through `hasher`, observing the
/// cancellation token between reads. Leaves the file positioned at EOF so a
/// resumed download continues where the bytes ran out.
async fn stream_through_hasher(
  cancel: &CancellationToken,
  file: &mut tokio::fs::File,
  filename: &Path,
  hasher: &mut Sha256,
) -> Result<(), Error> {
  let mut buf = vec![0u8; 1 << 20];
  loop {
    if cancel.is_cancelled() {
      return Err(Error::Cancelled);
    }
    let read = file
      .read(&mut buf)
      .await
      .map_err(|e| Error::io(format!("failed to read back '{}'", filename.display()), e))?;
    if read == 0 {
      return Ok(());
    }
    hasher.update(&buf[..read]);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::functions::hash_bytes;

  fn downloader() -> Downloader {
    Downloader::new(DownloadConfig::default(), |_| {}, CancellationToken::new()).unwrap()
  }

  #[tokio::test]
  async fn register_allows_retries_but_not_two_downloads() {
    let d = downloader();
    let path = Path::new("patch/abc");
    d.register(path, 0).unwrap();
    // Retry of the same logical download.
    d.register(path, 0).unwrap();
    // A different download for the same path is a caller bug.
    let err = d.register(path, 1).unwrap_err();
    assert!(matches!(err, Error::DownloadConflict(p) if p == path));
  }

  #[tokio::test]
  async fn complete_file_skips_the_network() {
    // The URL points nowhere; if the downloader tried to fetch it the test
    // would fail.
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("present");
    tokio::fs::write(&path, b"already here").await.unwrap();

    let d = downloader();
    let cancel = CancellationToken::new();
    let url = Url::parse("http://127.0.0.1:9/full/abc").unwrap();
    d.download_file(&cancel, url, &path, &hash_bytes(b"already here"), 12)
      .await
      .unwrap();
  }

  #[tokio::test]
  async fn external_cancellation_short_circuits() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cancelled");
    let d = downloader();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let url = Url::parse("http://127.0.0.1:9/full/abc").unwrap();
    let err = d
      .download_file(&cancel, url, &path, "abc", 5)
      .await
      .unwrap_err();
    assert!(err.is_cancellation());
  }

  #[tokio::test]
  async fn final_ticker_frame_has_zero_speed() {
    let (tx, rx) = std::sync::mpsc::channel();
    let ticker_cancel = CancellationToken::new();
    let _d = Downloader::new(
      DownloadConfig::default(),
      move |stats| {
        let _ = tx.send(stats);
      },
      ticker_cancel.clone(),
    )
    .unwrap();
    ticker_cancel.cancel();
    let stats = tokio::task::spawn_blocking(move || rx.recv().unwrap())
      .await
      .unwrap();
    assert_eq!(stats.speed, 0);
  }
}
