use std::path::{Path, PathBuf};
use std::process::Stdio;

use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::functions::hash_eq;
use crate::structures::Error;

// Source window size, copied from the Vue/Electron launcher.
const SOURCE_WINDOW_SIZE: &str = "536870912";

/// Helpers for invoking the external xdelta program.
#[derive(Debug, Clone)]
pub struct XDelta {
  bin_path: PathBuf,
}

impl XDelta {
  /// Creates an XDelta instance.
  ///
  /// If `bin_path` is just a basename without directory it will be looked
  /// up in PATH. To use a binary in the current directory use something
  /// like './xdelta3'.
  pub fn locate(bin_path: &str) -> Result<XDelta, Error> {
    let as_path = Path::new(bin_path);
    let bare_name = as_path.parent().map_or(true, |p| p.as_os_str().is_empty());
    if bare_name {
      let path_var = std::env::var_os("PATH").unwrap_or_default();
      for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(bin_path);
        if candidate.is_file() {
          return Ok(XDelta {
            bin_path: candidate,
          });
        }
      }
      Err(Error::io(
        format!("failed to find '{bin_path}' in PATH"),
        std::io::Error::from(std::io::ErrorKind::NotFound),
      ))
    } else {
      std::fs::metadata(as_path)
        .map_err(|e| Error::io(format!("failed to find '{bin_path}'"), e))?;
      Ok(XDelta {
        bin_path: as_path.to_path_buf(),
      })
    }
  }

  /// Runs the xdelta binary, writing its output to `new_path` and
  /// validating the checksum at the same time. If `old_path` is given it's
  /// a delta patch, otherwise it's a full patch.
  ///
  /// Validating here makes this code messier but saves a lot of time
  /// because the output doesn't have to be read back later.
  pub async fn apply_patch(
    &self,
    cancel: &CancellationToken,
    old_path: Option<&Path>,
    patch_path: &Path,
    new_path: &Path,
    expected_checksum: &str,
  ) -> Result<(), Error> {
    let what = match old_path {
      None => format!(
        "applying full patch '{}' to get '{}'",
        patch_path.display(),
        new_path.display()
      ),
      Some(old) => format!(
        "applying delta patch '{}' to '{}' to get '{}'",
        patch_path.display(),
        old.display(),
        new_path.display()
      ),
    };

    // Decompress, source window, force overwrite, write to stdout and for
    // a delta patch the source file to copy from.
    let mut cmd = Command::new(&self.bin_path);
    cmd.arg("-d").arg("-B").arg(SOURCE_WINDOW_SIZE).arg("-f").arg("-c");
    if let Some(old) = old_path {
      cmd.arg("-s").arg(old);
    }
    cmd.arg(patch_path);
    cmd
      .stdin(Stdio::null())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .kill_on_drop(true);

    let mut child = cmd
      .spawn()
      .map_err(|e| Error::io(format!("{what} failed (start xdelta)"), e))?;
    let mut stdout = child.stdout.take().expect("stdout was piped");
    let mut stderr = child.stderr.take().expect("stderr was piped");

    let mut file = tokio::fs::File::create(new_path)
      .await
      .map_err(|e| Error::io(format!("{what} failed (create file)"), e))?;
    let mut hasher = Sha256::new();

    let copy = async {
      let mut buf = vec![0u8; 64 * 1024];
      loop {
        let read = stdout
          .read(&mut buf)
          .await
          .map_err(|e| Error::io(format!("{what} failed (read xdelta output)"), e))?;
        if read == 0 {
          break;
        }
        hasher.update(&buf[..read]);
        file
          .write_all(&buf[..read])
          .await
          .map_err(|e| Error::io(format!("{what} failed (write file)"), e))?;
      }
      file
        .flush()
        .await
        .map_err(|e| Error::io(format!("{what} failed (flush file)"), e))?;
      Ok::<(), Error>(())
    };
    tokio::select! {
      result = copy => result?,
      _ = cancel.cancelled() => {
        let _ = child.kill().await;
        return Err(Error::Cancelled);
      }
    }

    // Stderr is tiny; drain it before waiting so the pipe can't fill up.
    let mut stderr_buf = Vec::new();
    let _ = stderr.read_to_end(&mut stderr_buf).await;

    let status = tokio::select! {
      status = child.wait() => {
        status.map_err(|e| Error::io(format!("{what} failed (wait for xdelta)"), e))?
      }
      // kill_on_drop takes the child down on this early return.
      _ = cancel.cancelled() => return Err(Error::Cancelled),
    };
    if !status.success() {
      return Err(Error::XDelta {
        what,
        message: format!(
          "exit status {status}; xdelta said: {}",
          String::from_utf8_lossy(&stderr_buf).trim()
        ),
      });
    }

    let checksum = hex::encode(hasher.finalize());
    if !hash_eq(&checksum, expected_checksum) {
      return Err(Error::PatchOutputMismatch {
        what,
        expected: expected_checksum.to_uppercase(),
        actual: checksum.to_uppercase(),
      });
    }
    Ok(())
  }
}

#[cfg(test)]
#[cfg(unix)]
mod tests {
  use super::*;
  use crate::functions::hash_bytes;
  use std::os::unix::fs::PermissionsExt;

  // Stand-in for xdelta3 with the same command line contract: concatenates
  // the source file (if any) and the patch file to stdout.
  const FAKE_XDELTA: &str = r#"#!/bin/sh
src=""
while [ $# -gt 1 ]; do
  case "$1" in
    -s) src="$2"; shift 2;;
    *) shift;;
  esac
done
if [ -n "$src" ]; then cat "$src"; fi
cat "$1"
"#;

  const FAILING_XDELTA: &str = "#!/bin/sh\necho 'corrupt input' >&2\nexit 3\n";

  fn write_script(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, content).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
  }

  #[test]
  fn locate_rejects_missing_explicit_path() {
    let err = XDelta::locate("./does-not-exist-xdelta3").unwrap_err();
    assert!(matches!(err, Error::Io { .. }));
  }

  #[test]
  fn locate_accepts_explicit_path() {
    let dir = tempfile::tempdir().unwrap();
    let bin = write_script(dir.path(), "xdelta3", FAKE_XDELTA);
    XDelta::locate(bin.to_str().unwrap()).unwrap();
  }

  #[tokio::test]
  async fn full_patch_writes_and_verifies_output() {
    let dir = tempfile::tempdir().unwrap();
    let bin = write_script(dir.path(), "xdelta3", FAKE_XDELTA);
    let xdelta = XDelta::locate(bin.to_str().unwrap()).unwrap();

    let patch_path = dir.path().join("patchfile");
    std::fs::write(&patch_path, b"new contents").unwrap();
    let new_path = dir.path().join("out");
    let cancel = CancellationToken::new();
    xdelta
      .apply_patch(
        &cancel,
        None,
        &patch_path,
        &new_path,
        &hash_bytes(b"new contents"),
      )
      .await
      .unwrap();
    assert_eq!(std::fs::read(&new_path).unwrap(), b"new contents");
  }

  #[tokio::test]
  async fn delta_patch_uses_the_source_file() {
    let dir = tempfile::tempdir().unwrap();
    let bin = write_script(dir.path(), "xdelta3", FAKE_XDELTA);
    let xdelta = XDelta::locate(bin.to_str().unwrap()).unwrap();

    let old_path = dir.path().join("old");
    std::fs::write(&old_path, b"base-").unwrap();
    let patch_path = dir.path().join("patchfile");
    std::fs::write(&patch_path, b"delta").unwrap();
    let new_path = dir.path().join("out");
    let cancel = CancellationToken::new();
    xdelta
      .apply_patch(
        &cancel,
        Some(&old_path),
        &patch_path,
        &new_path,
        &hash_bytes(b"base-delta"),
      )
      .await
      .unwrap();
    assert_eq!(std::fs::read(&new_path).unwrap(), b"base-delta");
  }

  #[tokio::test]
  async fn checksum_mismatch_is_fatal_and_mentions_both_hashes() {
    let dir = tempfile::tempdir().unwrap();
    let bin = write_script(dir.path(), "xdelta3", FAKE_XDELTA);
    let xdelta = XDelta::locate(bin.to_str().unwrap()).unwrap();

    let patch_path = dir.path().join("patchfile");
    std::fs::write(&patch_path, b"whatever").unwrap();
    let new_path = dir.path().join("out");
    let cancel = CancellationToken::new();
    let err = xdelta
      .apply_patch(&cancel, None, &patch_path, &new_path, &hash_bytes(b"other"))
      .await
      .unwrap_err();
    match &err {
      Error::PatchOutputMismatch {
        expected, actual, ..
      } => {
        assert!(!expected.is_empty());
        assert!(!actual.is_empty());
        assert_ne!(expected, actual);
      }
      other => panic!("expected PatchOutputMismatch, got {other:?}"),
    }
    assert!(!err.is_retryable());
  }

  #[tokio::test]
  async fn nonzero_exit_embeds_stderr() {
    let dir = tempfile::tempdir().unwrap();
    let bin = write_script(dir.path(), "xdelta3", FAILING_XDELTA);
    let xdelta = XDelta::locate(bin.to_str().unwrap()).unwrap();

    let patch_path = dir.path().join("patchfile");
    std::fs::write(&patch_path, b"whatever").unwrap();
    let new_path = dir.path().join("out");
    let cancel = CancellationToken::new();
    let err = xdelta
      .apply_patch(&cancel, None, &patch_path, &new_path, "ignored")
      .await
      .unwrap_err();
    assert!(err.to_string().contains("corrupt input"));
  }
}
