use std::io;

/// Reserves space so the file can grow to `size` without fragmenting or
/// running out of disk halfway through a download.
///
/// Uses fallocate with KEEP_SIZE so the file length still reflects the
/// bytes actually written; resume logic depends on that.
#[cfg(target_os = "linux")]
pub fn reserve<F: std::os::fd::AsRawFd>(file: &F, size: u64) -> io::Result<()> {
  if size == 0 {
    return Ok(());
  }
  let ret = unsafe {
    libc::fallocate(
      file.as_raw_fd(),
      libc::FALLOC_FL_KEEP_SIZE,
      0,
      size as libc::off_t,
    )
  };
  if ret == 0 {
    Ok(())
  } else {
    Err(io::Error::last_os_error())
  }
}

/// Fallback that does not preallocate anything.
#[cfg(not(target_os = "linux"))]
pub fn reserve<F>(_file: &F, _size: u64) -> io::Result<()> {
  Ok(())
}
