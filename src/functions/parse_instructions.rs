use std::collections::HashSet;
use std::path::Path;

use serde::Deserialize;

use crate::functions::paths::{clean_path, has_drive_prefix, is_local};
use crate::structures::{Error, Instruction};

/// The recognized part of one record in the instructions payload. Anything
/// else in the record is ignored.
#[derive(Debug, Deserialize)]
struct RawInstruction {
  #[serde(rename = "Path")]
  path: String,
  #[serde(rename = "OldHash", default)]
  old_hash: Option<String>,
  #[serde(rename = "NewHash", default)]
  new_hash: Option<String>,
  #[serde(rename = "CompressedHash", default)]
  compressed_hash: Option<String>,
  #[serde(rename = "DeltaHash", default)]
  delta_hash: Option<String>,
  #[serde(rename = "HasDelta", default)]
  has_delta: bool,
  #[serde(rename = "FileSize", default)]
  file_size: u64,
  #[serde(rename = "FullReplaceSize", default)]
  full_replace_size: u64,
  #[serde(rename = "DeltaSize", default)]
  delta_size: u64,
}

/// Decodes the instructions payload and runs some basic sanity checks.
///
/// Paths in the payload use backslashes; they come out with the OS
/// separator, cleaned. A path that is absolute, starts with a drive letter
/// or escapes the install dir is rejected, as are duplicate paths and
/// records where `HasDelta` disagrees with the presence of `DeltaHash`.
pub fn decode_instructions(json_data: &[u8]) -> Result<Vec<Instruction>, Error> {
  let raw: Vec<RawInstruction> = serde_json::from_slice(json_data)?;
  let mut seen = HashSet::with_capacity(raw.len());
  let mut instructions = Vec::with_capacity(raw.len());
  for ri in raw {
    let os_path = ri.path.replace('\\', std::path::MAIN_SEPARATOR_STR);
    let os_path = Path::new(&os_path);
    // Prevent escapes via stuff like '..', assuming the directory doesn't
    // already have weird stuff like symlinked directories.
    if os_path.is_absolute() || has_drive_prefix(os_path) || !is_local(os_path) {
      return Err(Error::NonLocalPath(ri.path));
    }
    let path = clean_path(os_path);

    if ri.has_delta != ri.delta_hash.is_some() {
      return Err(Error::InconsistentDelta(ri.path));
    }
    if !seen.insert(path.clone()) {
      return Err(Error::DuplicatePath(ri.path));
    }

    instructions.push(Instruction {
      path,
      old_hash: ri.old_hash.unwrap_or_default(),
      new_hash: ri.new_hash,
      compressed_hash: ri.compressed_hash,
      delta_hash: ri.delta_hash,
      has_delta: ri.has_delta,
      file_size: ri.file_size,
      full_replace_size: ri.full_replace_size,
      delta_size: ri.delta_size,
    });
  }
  Ok(instructions)
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::path::PathBuf;

  #[test]
  fn decodes_a_regular_record() {
    let data = br#"[{
      "Path": "Binaries\\game.exe",
      "OldHash": "abc",
      "NewHash": "def",
      "CompressedHash": "ghi",
      "DeltaHash": "jkl",
      "HasDelta": true,
      "FileSize": 100,
      "FullReplaceSize": 60,
      "DeltaSize": 10,
      "SomeFutureField": "ignored"
    }]"#;
    let instructions = decode_instructions(data).unwrap();
    assert_eq!(instructions.len(), 1);
    let instr = &instructions[0];
    assert_eq!(
      instr.path,
      PathBuf::from("Binaries").join("game.exe")
    );
    assert_eq!(instr.old_hash, "abc");
    assert_eq!(instr.new_hash.as_deref(), Some("def"));
    assert_eq!(instr.compressed_hash.as_deref(), Some("ghi"));
    assert_eq!(instr.delta_hash.as_deref(), Some("jkl"));
    assert!(instr.has_delta);
    assert_eq!(instr.file_size, 100);
    assert_eq!(instr.full_replace_size, 60);
    assert_eq!(instr.delta_size, 10);
    assert!(!instr.is_delete());
  }

  #[test]
  fn decodes_a_delete_record() {
    let data = br#"[{
      "Path": "old.dat",
      "OldHash": "abc",
      "NewHash": null,
      "CompressedHash": null,
      "DeltaHash": null,
      "HasDelta": false,
      "FileSize": 0,
      "FullReplaceSize": 0,
      "DeltaSize": 0
    }]"#;
    let instructions = decode_instructions(data).unwrap();
    assert!(instructions[0].is_delete());
  }

  #[test]
  fn rejects_absolute_path() {
    let data = br#"[{"Path": "/etc/passwd", "OldHash": "a", "NewHash": "b",
      "CompressedHash": "c", "DeltaHash": null, "HasDelta": false,
      "FileSize": 0, "FullReplaceSize": 0, "DeltaSize": 0}]"#;
    let err = decode_instructions(data).unwrap_err();
    assert!(matches!(err, Error::NonLocalPath(p) if p == "/etc/passwd"));
  }

  #[test]
  fn rejects_drive_letter_path() {
    let data = br#"[{"Path": "C:\\game\\file", "OldHash": "a", "NewHash": "b",
      "CompressedHash": "c", "DeltaHash": null, "HasDelta": false,
      "FileSize": 0, "FullReplaceSize": 0, "DeltaSize": 0}]"#;
    let err = decode_instructions(data).unwrap_err();
    assert!(matches!(err, Error::NonLocalPath(_)));
  }

  #[test]
  fn rejects_escaping_path() {
    let data = br#"[{"Path": "a\\..\\..\\b", "OldHash": "a", "NewHash": "b",
      "CompressedHash": "c", "DeltaHash": null, "HasDelta": false,
      "FileSize": 0, "FullReplaceSize": 0, "DeltaSize": 0}]"#;
    let err = decode_instructions(data).unwrap_err();
    assert!(matches!(err, Error::NonLocalPath(_)));
  }

  #[test]
  fn rejects_has_delta_without_hash() {
    let data = br#"[{"Path": "f", "OldHash": "a", "NewHash": "b",
      "CompressedHash": "c", "DeltaHash": null, "HasDelta": true,
      "FileSize": 0, "FullReplaceSize": 0, "DeltaSize": 0}]"#;
    let err = decode_instructions(data).unwrap_err();
    assert!(matches!(err, Error::InconsistentDelta(p) if p == "f"));
  }

  #[test]
  fn rejects_delta_hash_without_flag() {
    let data = br#"[{"Path": "f", "OldHash": "a", "NewHash": "b",
      "CompressedHash": "c", "DeltaHash": "d", "HasDelta": false,
      "FileSize": 0, "FullReplaceSize": 0, "DeltaSize": 0}]"#;
    let err = decode_instructions(data).unwrap_err();
    assert!(matches!(err, Error::InconsistentDelta(_)));
  }

  #[test]
  fn rejects_duplicate_paths() {
    let data = br#"[
      {"Path": "f", "OldHash": "a", "NewHash": "b", "CompressedHash": "c",
       "DeltaHash": null, "HasDelta": false, "FileSize": 0,
       "FullReplaceSize": 0, "DeltaSize": 0},
      {"Path": ".\\f", "OldHash": "a", "NewHash": "b", "CompressedHash": "c",
       "DeltaHash": null, "HasDelta": false, "FileSize": 0,
       "FullReplaceSize": 0, "DeltaSize": 0}
    ]"#;
    let err = decode_instructions(data).unwrap_err();
    assert!(matches!(err, Error::DuplicatePath(_)));
  }

  #[test]
  fn tolerates_missing_optional_fields() {
    let data = br#"[{"Path": "f", "NewHash": "b", "CompressedHash": "c"}]"#;
    let instructions = decode_instructions(data).unwrap();
    assert_eq!(instructions[0].old_hash, "");
    assert!(!instructions[0].has_delta);
    assert_eq!(instructions[0].full_replace_size, 0);
  }

  #[test]
  fn rejects_garbage() {
    assert!(matches!(
      decode_instructions(b"not json").unwrap_err(),
      Error::InstructionsJson(_)
    ));
  }
}
