use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use crate::functions::hash_eq;
use crate::structures::{
  BasicFileInfo, DownloadInstr, Instruction, Manifest, PlannedActions, UpdateInstr,
};

// The patching process consists of three phases of I/O mixed with two
// phases of thinking:
// 1. Scan all the existing files in the installation dir.
// a. Determine files to be measured (this file).
// 2. Measure (hash) those files.
// b. Determine what to do with each file (this file).
// 3. Download patch files.
// 4. Apply patch files and delete files.

/// Given the instructions, the manifest (empty if it doesn't exist yet) and
/// metadata of existing files, splits the existing files into those whose
/// checksum must be measured and those whose checksum the manifest already
/// knows (modification time unchanged since it was recorded).
///
/// Files absent on disk are in neither output; they don't need verification,
/// only a download, and that's not something this function determines.
pub fn determine_files_to_measure(
  instructions: &[Instruction],
  manifest: &Manifest,
  existing_files: &HashMap<PathBuf, BasicFileInfo>,
) -> (Vec<PathBuf>, HashMap<PathBuf, String>) {
  let mut to_measure = Vec::new();
  let mut known_hashes = HashMap::new();
  for instr in instructions {
    if instr.is_delete() {
      continue;
    }
    let Some(info) = existing_files.get(&instr.path) else {
      continue;
    };
    match manifest.get(&instr.path, info.mod_time) {
      Some(checksum) => {
        known_hashes.insert(instr.path.clone(), checksum.to_string());
      }
      None => to_measure.push(instr.path.clone()),
    }
  }
  (to_measure, known_hashes)
}

/// Determines what should be downloaded and what should be patched or
/// deleted. `checksums` must hold a hash for every existing file named by a
/// non-delete instruction, combining fresh measurements with what the
/// manifest already knew.
pub fn determine_actions(
  instructions: &[Instruction],
  existing_files: &HashMap<PathBuf, BasicFileInfo>,
  checksums: &HashMap<PathBuf, String>,
) -> PlannedActions {
  // Keyed by patch checksum: referencing the same patch content twice must
  // only fetch it once. BTreeMaps double as the deterministic ordering.
  let mut to_download: BTreeMap<String, DownloadInstr> = BTreeMap::new();
  let mut to_update: BTreeMap<PathBuf, UpdateInstr> = BTreeMap::new();
  let mut to_delete: Vec<PathBuf> = Vec::new();

  for (instr_idx, instr) in instructions.iter().enumerate() {
    let (Some(new_hash), Some(compressed_hash)) = (&instr.new_hash, &instr.compressed_hash) else {
      if existing_files.contains_key(&instr.path) {
        to_delete.push(instr.path.clone());
      }
      continue;
    };

    let exists = existing_files.contains_key(&instr.path);
    let known_hash = checksums.get(&instr.path);
    if exists && known_hash.is_some_and(|h| hash_eq(h, new_hash)) {
      // Already up to date.
      continue;
    }

    // The temp files get moved into place, which causes problems if a
    // single patched file is used for multiple final files. The index is
    // the instruction's position in the payload.
    let temp_path: PathBuf = ["patch", "apply", &format!("{instr_idx:05}_{new_hash}")]
      .iter()
      .collect();

    let usable_delta = match (&instr.delta_hash, known_hash) {
      (Some(delta_hash), Some(known)) if exists && hash_eq(known, &instr.old_hash) => {
        Some(delta_hash)
      }
      _ => None,
    };

    if let Some(delta_hash) = usable_delta {
      // Can use the (hopefully much smaller) delta file to upgrade.
      let delta_name = format!("{}_from_{}", new_hash, instr.old_hash);
      let delta_local: PathBuf = ["patch", delta_name.as_str()].iter().collect();
      to_download
        .entry(delta_hash.clone())
        .or_insert_with(|| DownloadInstr {
          remote_path: format!("delta/{delta_name}"),
          local_path: delta_local.clone(),
          checksum: delta_hash.clone(),
          size: instr.delta_size,
        });
      to_update.insert(
        instr.path.clone(),
        UpdateInstr {
          file_path: instr.path.clone(),
          patch_path: delta_local,
          temp_path,
          is_delta: true,
          checksum: new_hash.clone(),
          size: instr.file_size,
        },
      );
    } else {
      // New file, or the existing one matches neither hash.
      let full_local: PathBuf = ["patch", new_hash.as_str()].iter().collect();
      to_download
        .entry(compressed_hash.clone())
        .or_insert_with(|| DownloadInstr {
          remote_path: format!("full/{new_hash}"),
          local_path: full_local.clone(),
          checksum: compressed_hash.clone(),
          size: instr.full_replace_size,
        });
      to_update.insert(
        instr.path.clone(),
        UpdateInstr {
          file_path: instr.path.clone(),
          patch_path: full_local,
          temp_path,
          is_delta: false,
          checksum: new_hash.clone(),
          size: instr.file_size,
        },
      );
    }
  }

  to_delete.sort();
  PlannedActions {
    downloads: to_download.into_values().collect(),
    updates: to_update.into_values().collect(),
    deletions: to_delete,
  }
}
