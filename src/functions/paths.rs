use std::path::{Component, Path, PathBuf};

/// Cleans a path lexically: drops `.` components and redundant separators,
/// resolves `..` against preceding normal components. A leading `..` that
/// can't be resolved is kept so locality checks can see it.
pub fn clean_path(path: &Path) -> PathBuf {
  let mut cleaned = PathBuf::new();
  for component in path.components() {
    match component {
      Component::CurDir => {}
      Component::ParentDir => {
        let last_is_normal = matches!(
          cleaned.components().next_back(),
          Some(Component::Normal(_))
        );
        if last_is_normal {
          cleaned.pop();
        } else {
          cleaned.push("..");
        }
      }
      other => cleaned.push(other.as_os_str()),
    }
  }
  cleaned
}

/// True if the path stays inside the directory it is interpreted against:
/// not absolute, no drive prefix, and no escape through leading `..`.
pub fn is_local(path: &Path) -> bool {
  if path
    .components()
    .any(|c| matches!(c, Component::Prefix(_) | Component::RootDir))
  {
    return false;
  }
  if has_drive_prefix(path) {
    return false;
  }
  !matches!(
    clean_path(path).components().next(),
    Some(Component::ParentDir)
  )
}

/// Detects a Windows drive-letter prefix such as `C:` even on systems where
/// the standard library doesn't parse one.
pub fn has_drive_prefix(path: &Path) -> bool {
  if path.components().any(|c| matches!(c, Component::Prefix(_))) {
    return true;
  }
  match path.components().next() {
    Some(Component::Normal(first)) => {
      let first = first.to_string_lossy();
      let mut chars = first.chars();
      matches!(
        (chars.next(), chars.next()),
        (Some(letter), Some(':')) if letter.is_ascii_alphabetic()
      )
    }
    _ => false,
  }
}
