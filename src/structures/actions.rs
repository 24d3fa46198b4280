use std::path::PathBuf;

/// How to download one patch file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadInstr {
  /// Location of the patch file relative to the patch base URL, with
  /// forward slashes.
  pub remote_path: String,
  /// Where to store the patch file, relative to the install dir.
  pub local_path: PathBuf,
  /// Checksum the patch file should have.
  pub checksum: String,
  /// Size of the patch file in bytes.
  pub size: u64,
}

/// How to apply one patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateInstr {
  /// The file to create or update, relative to the install dir.
  pub file_path: PathBuf,
  /// The patch file to apply, relative to the install dir.
  pub patch_path: PathBuf,
  /// Where to write the new file before it is moved into place. Embeds the
  /// instruction index so two final files with the same content don't collide.
  pub temp_path: PathBuf,
  /// Whether the patch is a delta patch (needs the existing file as source).
  pub is_delta: bool,
  /// Checksum the file should have after patching.
  pub checksum: String,
  /// Size of the file after patching in bytes, 0 if unknown.
  pub size: u64,
}

/// The planner's output: three disjoint, deterministically ordered lists.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlannedActions {
  /// Which patch files to download, deduplicated by checksum.
  pub downloads: Vec<DownloadInstr>,
  /// Which files to create or update, one per file path.
  pub updates: Vec<UpdateInstr>,
  /// Which files to delete.
  pub deletions: Vec<PathBuf>,
}
