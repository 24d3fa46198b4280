//! Installs and updates a game into a local directory by reconciling the
//! files on disk with a server-supplied set of per-file instructions.
//!
//! The work happens in three phases. Verify scans the installation
//! directory and hashes whatever the persisted manifest can't vouch for.
//! Planning turns instructions plus observed state into disjoint download,
//! update and delete lists. Download fetches the needed patch files
//! (resumable, with retries and integrity checks) and apply runs them
//! through the external xdelta program into a staging directory before
//! renaming the results into place.
//!
//! The entry point is [`run_patcher`] with a [`PatcherConfig`]; progress
//! arrives through a callback, cancellation through a
//! [`tokio_util::sync::CancellationToken`]. The individual pieces
//! (decoder, planner, downloader, patch applier) are exported for callers
//! that need to drive only part of the pipeline.

mod functions;
mod structures;

pub use functions::{
  decode_instructions, determine_actions, determine_files_to_measure, do_in_parallel,
  do_in_parallel_with_result, hash_bytes, hash_eq, hash_reader, run_patcher, scan_files,
  Downloader, XDelta,
};
pub use structures::{
  Averager, BasicFileInfo, DownloadConfig, DownloadInstr, DownloadStats, Error, Instruction,
  Manifest, ManifestEntry, PatcherConfig, Phase, PlannedActions, Progress, ProgressFn,
  ProgressPhase, ProgressTracker, UpdateInstr, MANIFEST_FILENAME,
};
