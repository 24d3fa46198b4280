use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::functions::clean_path;
use crate::structures::Error;

/// Filename for the manifest under the install dir.
pub const MANIFEST_FILENAME: &str = "ta-manifest.json";

/// The last recorded checksum and change time for a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
  pub last_change: DateTime<Utc>,
  pub last_checksum: String,
}

/// Records the last recorded checksum and change time for files, keyed by
/// relative path with the OS specific separator. Used to bypass expensive
/// computation of the checksum for files that haven't changed.
///
/// A manifest is bound to one product; reading it back for another product
/// is refused so two games can't be installed over each other.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
  #[serde(rename = "Product")]
  product: String,
  #[serde(rename = "Entries")]
  entries: BTreeMap<String, ManifestEntry>,
}

impl Manifest {
  /// Creates a new empty manifest for the product.
  pub fn new(product: impl Into<String>) -> Manifest {
    Manifest {
      product: product.into(),
      entries: BTreeMap::new(),
    }
  }

  /// The product this manifest is bound to.
  pub fn product(&self) -> &str {
    &self.product
  }

  /// How many files the manifest knows about.
  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  /// Reads the manifest from its standard location in the install dir.
  /// Returns an empty manifest if there's no manifest file and an error if
  /// the manifest belongs to a different product.
  pub async fn read(install_dir: &Path, product: &str) -> Result<Manifest, Error> {
    let filename = install_dir.join(MANIFEST_FILENAME);
    let data = match tokio::fs::read(&filename).await {
      Ok(data) => data,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
        return Ok(Manifest::new(product));
      }
      Err(e) => {
        return Err(Error::io(
          format!("couldn't read manifest at '{}'", filename.display()),
          e,
        ));
      }
    };
    let manifest: Manifest = serde_json::from_slice(&data).map_err(Error::ManifestJson)?;
    if manifest.product != product {
      return Err(Error::WrongProduct {
        expected: product.to_string(),
        found: manifest.product,
      });
    }
    Ok(manifest)
  }

  /// Writes the manifest to its standard location in the install dir.
  /// The encoding is indented so the file stays hand-editable.
  pub async fn write(&self, install_dir: &Path) -> Result<(), Error> {
    let filename = install_dir.join(MANIFEST_FILENAME);
    let encoded = serde_json::to_vec_pretty(self).map_err(Error::ManifestJson)?;
    tokio::fs::write(&filename, encoded).await.map_err(|e| {
      Error::io(
        format!("couldn't write manifest to '{}'", filename.display()),
        e,
      )
    })
  }

  /// Adds a file along with last change time and known checksum.
  /// Overwrites an existing entry for the file.
  pub fn add(&mut self, path: &Path, last_change: DateTime<Utc>, checksum: impl Into<String>) {
    self.entries.insert(
      key_for(path),
      ManifestEntry {
        last_change,
        last_checksum: checksum.into(),
      },
    );
  }

  /// True iff a file with the given path, last change time and checksum
  /// exists in the manifest, i.e. if the file can be assumed to have the
  /// correct checksum without rehashing it.
  pub fn check(&self, path: &Path, last_change: DateTime<Utc>, checksum: &str) -> bool {
    match self.entries.get(&key_for(path)) {
      Some(entry) => entry.last_change == last_change && entry.last_checksum == checksum,
      None => false,
    }
  }

  /// The stored checksum for a file, provided the stored change time matches.
  pub fn get(&self, path: &Path, last_change: DateTime<Utc>) -> Option<&str> {
    self
      .entries
      .get(&key_for(path))
      .filter(|entry| entry.last_change == last_change)
      .map(|entry| entry.last_checksum.as_str())
  }
}

// Redundant separators and `.` components would make the same file miss on
// lookup, so keys are cleaned lexically.
fn key_for(path: &Path) -> String {
  clean_path(path).to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::TimeZone;

  fn date1() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2023, 12, 15, 14, 46, 23).unwrap() + chrono::Duration::nanoseconds(325)
  }

  fn date2() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2023, 12, 15, 14, 46, 23).unwrap() + chrono::Duration::nanoseconds(324)
  }

  #[test]
  fn check_requires_all_three_to_match() {
    let mut man = Manifest::new("foo");
    man.add(Path::new("a/b"), date1(), "abcde");
    assert!(man.check(Path::new("a/b"), date1(), "abcde"));
    assert!(!man.check(Path::new("a/c"), date1(), "abcde"));
    // Differs by a single nanosecond.
    assert!(!man.check(Path::new("a/b"), date2(), "abcde"));
    assert!(!man.check(Path::new("a/b"), date1(), "abcdef"));
  }

  #[test]
  fn get_requires_matching_time() {
    let mut man = Manifest::new("foo");
    man.add(Path::new("a/b"), date1(), "abcde");
    assert_eq!(man.get(Path::new("a/b"), date1()), Some("abcde"));
    assert_eq!(man.get(Path::new("a/b"), date2()), None);
    assert_eq!(man.get(Path::new("a/x"), date1()), None);
  }

  #[test]
  fn keys_are_cleaned() {
    let mut man = Manifest::new("foo");
    man.add(Path::new("a//b/./c"), date1(), "abcde");
    assert!(man.check(Path::new("a/b/c"), date1(), "abcde"));
  }

  #[tokio::test]
  async fn round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let mut man1 = Manifest::new("foo");
    man1.add(Path::new("a/b"), date1(), "abcde");
    man1.write(dir.path()).await.unwrap();
    let man2 = Manifest::read(dir.path(), "foo").await.unwrap();
    assert_eq!(man1, man2);
    assert!(man2.check(Path::new("a/b"), date1(), "abcde"));
  }

  #[tokio::test]
  async fn missing_file_gives_empty_manifest() {
    let dir = tempfile::tempdir().unwrap();
    let man = Manifest::read(dir.path(), "foo").await.unwrap();
    assert!(man.is_empty());
    assert_eq!(man.product(), "foo");
  }

  #[tokio::test]
  async fn wrong_product_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    Manifest::new("foo").write(dir.path()).await.unwrap();
    let err = Manifest::read(dir.path(), "bar").await.unwrap_err();
    assert!(matches!(err, Error::WrongProduct { .. }));
  }
}
