use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use walkdir::WalkDir;

use crate::functions::clean_path;
use crate::structures::{BasicFileInfo, Error};

/// Recursively determines all files in the directory and gets limited
/// information such as the modification time. Keys are paths relative to
/// `root_dir`; directories themselves are not listed.
pub async fn scan_files(root_dir: &Path) -> Result<HashMap<PathBuf, BasicFileInfo>, Error> {
  let root = root_dir.to_path_buf();
  tokio::task::spawn_blocking(move || scan_files_blocking(&root))
    .await
    .map_err(|e| Error::io("directory scan task failed", std::io::Error::other(e)))?
}

fn scan_files_blocking(root: &Path) -> Result<HashMap<PathBuf, BasicFileInfo>, Error> {
  let mut infos = HashMap::new();
  for entry in WalkDir::new(root) {
    let entry = entry.map_err(|e| {
      Error::io(
        format!("error while scanning '{}'", root.display()),
        e.into(),
      )
    })?;
    if entry.file_type().is_dir() {
      continue;
    }
    let metadata = entry.metadata().map_err(|e| {
      Error::io(
        format!("error while statting file '{}'", entry.path().display()),
        e.into(),
      )
    })?;
    let mod_time = metadata.modified().map_err(|e| {
      Error::io(
        format!(
          "error getting modification time of '{}'",
          entry.path().display()
        ),
        e,
      )
    })?;
    let rel = entry
      .path()
      .strip_prefix(root)
      .expect("walker yields paths under its root");
    infos.insert(
      clean_path(rel),
      BasicFileInfo {
        mod_time: DateTime::<Utc>::from(mod_time),
      },
    );
  }
  Ok(infos)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn lists_files_recursively_but_not_directories() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("a/b")).unwrap();
    std::fs::write(dir.path().join("top.txt"), b"x").unwrap();
    std::fs::write(dir.path().join("a/b/nested.txt"), b"y").unwrap();

    let infos = scan_files(dir.path()).await.unwrap();
    assert_eq!(infos.len(), 2);
    assert!(infos.contains_key(Path::new("top.txt")));
    assert!(infos.contains_key(Path::new("a/b/nested.txt")));
    assert!(!infos.contains_key(Path::new("a")));
  }

  #[tokio::test]
  async fn empty_directory_scans_to_empty_map() {
    let dir = tempfile::tempdir().unwrap();
    let infos = scan_files(dir.path()).await.unwrap();
    assert!(infos.is_empty());
  }

  #[tokio::test]
  async fn mod_times_match_the_filesystem() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("f"), b"x").unwrap();
    let expected = std::fs::metadata(dir.path().join("f"))
      .unwrap()
      .modified()
      .unwrap();
    let infos = scan_files(dir.path()).await.unwrap();
    let info = infos.get(Path::new("f")).unwrap();
    assert_eq!(info.mod_time, DateTime::<Utc>::from(expected));
  }
}
