use std::path::PathBuf;

/// A single server-declared directive describing the desired post-update
/// state of one file and the patches available to reach it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
  /// Path relative to the install dir, using the OS separator.
  pub path: PathBuf,
  /// SHA256 hash the existing file must have for the delta patch to apply.
  pub old_hash: String,
  /// SHA256 hash of the file after patching, None if the file is to be deleted.
  pub new_hash: Option<String>,
  /// SHA256 hash of the full replacement patch file, None iff `new_hash` is None.
  pub compressed_hash: Option<String>,
  /// SHA256 hash of the delta patch file, if a delta patch is available.
  pub delta_hash: Option<String>,
  /// Whether a delta patch is available. Always agrees with `delta_hash`.
  pub has_delta: bool,
  /// Size of the file after patching in bytes, 0 if unknown.
  pub file_size: u64,
  /// Size of the full replacement patch file in bytes.
  pub full_replace_size: u64,
  /// Size of the delta patch file in bytes.
  pub delta_size: u64,
}

impl Instruction {
  /// True if this instruction asks for the file to be deleted.
  pub fn is_delete(&self) -> bool {
    self.new_hash.is_none() || self.compressed_hash.is_none()
  }
}
