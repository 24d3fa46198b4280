use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;

use crate::structures::Error;

/// Generates a SHA256 hash of a byte slice as lowercase hex.
pub fn hash_bytes(data: &[u8]) -> String {
  let mut hasher = Sha256::new();
  hasher.update(data);
  hex::encode(hasher.finalize())
}

/// Reads data via a reader and computes a SHA256 hash of it, checking for
/// cancellation between reads.
pub async fn hash_reader<R>(cancel: &CancellationToken, reader: &mut R) -> Result<String, Error>
where
  R: AsyncRead + Unpin + ?Sized,
{
  let mut hasher = Sha256::new();
  // Reading up to a meg at a time to keep syscall overhead down. There's no
  // guarantee that much data is returned per read, it just allows for it.
  let mut buf = vec![0u8; 1 << 20];
  loop {
    if cancel.is_cancelled() {
      return Err(Error::Cancelled);
    }
    let read = reader
      .read(&mut buf)
      .await
      .map_err(|e| Error::io("failed to read data while hashing", e))?;
    if read == 0 {
      return Ok(hex::encode(hasher.finalize()));
    }
    hasher.update(&buf[..read]);
  }
}

/// Compares two hex-encoded hashes for equality, ignoring case.
pub fn hash_eq(hash1: &str, hash2: &str) -> bool {
  hash1.eq_ignore_ascii_case(hash2)
}

#[cfg(test)]
mod tests {
  use super::*;

  // SHA-256 of "hello world".
  const HELLO_HASH: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

  #[test]
  fn hash_bytes_known_vector() {
    assert_eq!(hash_bytes(b"hello world"), HELLO_HASH);
    // Idempotent.
    assert_eq!(hash_bytes(b"hello world"), HELLO_HASH);
  }

  #[tokio::test]
  async fn hash_reader_matches_hash_bytes() {
    let cancel = CancellationToken::new();
    let mut reader = std::io::Cursor::new(b"hello world".to_vec());
    let checksum = hash_reader(&cancel, &mut reader).await.unwrap();
    assert_eq!(checksum, HELLO_HASH);
  }

  #[tokio::test]
  async fn hash_reader_observes_cancellation() {
    let cancel = CancellationToken::new();
    cancel.cancel();
    let mut reader = std::io::Cursor::new(b"hello world".to_vec());
    let err = hash_reader(&cancel, &mut reader).await.unwrap_err();
    assert!(err.is_cancellation());
  }

  #[test]
  fn hash_eq_ignores_case() {
    assert!(hash_eq("ABCDEF", "abcdef"));
    assert!(!hash_eq("abcdef", "abcdee"));
  }
}
