use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::functions::{
  determine_actions, determine_files_to_measure, do_in_parallel, do_in_parallel_with_result,
  hash_reader, scan_files, Downloader, XDelta,
};
use crate::structures::{
  DownloadConfig, DownloadInstr, Error, Instruction, Manifest, PatcherConfig, Phase,
  PlannedActions, ProgressFn, ProgressTracker, UpdateInstr,
};

/*
 * ----------  a  -----------  b  ------------  c  ---------
 * | verify | --> | plan    | --> | download | --> | apply |
 * ----------     -----------     ------------     ---------
 * a: scan + measure what the manifest can't vouch for
 * b: disjoint download/update/delete lists
 * c: xdelta into staging, rename into place, delete obsolete
 */

/// Helper tuple for measuring a file.
struct MeasuredFile {
  filename: PathBuf,
  checksum: String,
  mod_time: DateTime<Utc>,
}

/// Runs the entire patching process: verifies the installation directory
/// against the instructions, downloads the needed patch files and applies
/// them. On success the staging directory is removed and the manifest
/// written; on failure (or cancellation) both are left for a future run to
/// pick up from.
pub async fn run_patcher(
  cancel: &CancellationToken,
  instructions: Vec<Instruction>,
  config: PatcherConfig,
) -> Result<(), Error> {
  let PatcherConfig {
    base_url,
    install_dir,
    product,
    verify_workers,
    download_workers,
    apply_workers,
    download: download_config,
    xdelta_bin_path,
    progress_fn,
    progress_interval,
  } = config;

  let xdelta = XDelta::locate(&xdelta_bin_path)?;
  let mut manifest = Manifest::read(&install_dir, &product).await?;

  // These paths are also hardcoded in the planning logic.
  let patch_dir = install_dir.join("patch");
  let patch_apply_dir = patch_dir.join("apply");
  tokio::fs::create_dir_all(&patch_apply_dir)
    .await
    .map_err(|e| {
      Error::io(
        format!(
          "couldn't create patch and patch apply directories '{}'",
          patch_apply_dir.display()
        ),
        e,
      )
    })?;

  let tracker = Arc::new(ProgressTracker::new());
  let emitter_cancel = CancellationToken::new();
  let emitter = spawn_progress_emitter(
    tracker.clone(),
    progress_fn,
    progress_interval,
    emitter_cancel.clone(),
  );

  let result = run_phases(
    cancel,
    &instructions,
    &mut manifest,
    &base_url,
    &install_dir,
    verify_workers,
    download_workers,
    apply_workers,
    &download_config,
    &xdelta,
    &tracker,
  )
  .await;

  let result = match result {
    Ok(()) => finish(cancel, &patch_dir, &install_dir, &manifest).await,
    Err(e) => Err(e),
  };

  // Report progress one last time, usually that's the "all completed"
  // progress.
  emitter_cancel.cancel();
  let _ = emitter.await;

  result
}

/// Successful-run epilogue: drop the staging tree and persist the manifest.
async fn finish(
  cancel: &CancellationToken,
  patch_dir: &Path,
  install_dir: &Path,
  manifest: &Manifest,
) -> Result<(), Error> {
  // A cancelled run never writes the manifest, even if the cancellation
  // happened to land after the last phase finished its work.
  if cancel.is_cancelled() {
    return Err(Error::Cancelled);
  }
  tracing::info!(
    patch_dir = %patch_dir.display(),
    "operation successful, removing downloaded patches"
  );
  tokio::fs::remove_dir_all(patch_dir).await.map_err(|e| {
    Error::io(
      format!("failed to remove patch dir '{}'", patch_dir.display()),
      e,
    )
  })?;
  manifest.write(install_dir).await
}

#[allow(clippy::too_many_arguments)]
async fn run_phases(
  cancel: &CancellationToken,
  instructions: &[Instruction],
  manifest: &mut Manifest,
  base_url: &Url,
  install_dir: &Path,
  verify_workers: usize,
  download_workers: usize,
  apply_workers: usize,
  download_config: &DownloadConfig,
  xdelta: &XDelta,
  tracker: &Arc<ProgressTracker>,
) -> Result<(), Error> {
  let actions = run_verify_phase(
    cancel,
    instructions,
    manifest,
    install_dir,
    verify_workers,
    tracker,
  )
  .await?;

  run_download_phase(
    cancel,
    &actions.downloads,
    install_dir,
    base_url,
    download_config,
    tracker,
    download_workers,
  )
  .await?;

  run_apply_phase(
    cancel,
    &actions.updates,
    &actions.deletions,
    manifest,
    install_dir,
    xdelta,
    tracker,
    apply_workers,
  )
  .await
}

/// Runs the entire verification phase and returns the actions to be taken
/// in later phases.
async fn run_verify_phase(
  cancel: &CancellationToken,
  instructions: &[Instruction],
  manifest: &mut Manifest,
  install_dir: &Path,
  num_workers: usize,
  tracker: &Arc<ProgressTracker>,
) -> Result<PlannedActions, Error> {
  // Two instructions for one path would make later phases clobber each
  // other's work.
  let mut seen = HashSet::with_capacity(instructions.len());
  for instr in instructions {
    if !seen.insert(&instr.path) {
      return Err(Error::DuplicatePath(instr.path.display().to_string()));
    }
  }

  tracker.phase_started(Phase::Verify);
  tracing::info!(
    install_dir = %install_dir.display(),
    "scanning files in installation directory"
  );
  let existing_files = scan_files(install_dir).await?;

  let (to_measure, known_hashes) =
    determine_files_to_measure(instructions, manifest, &existing_files);
  tracing::info!(
    files_to_measure = to_measure.len(),
    files_already_known = known_hashes.len(),
    "computing checksums of files"
  );
  tracker.phase_set_needed(Phase::Verify, to_measure.len() + known_hashes.len(), true);
  tracker.phase_items_skipped(Phase::Verify, known_hashes.len());

  let measure_tracker = tracker.clone();
  let measure_dir = install_dir.to_path_buf();
  let measured = do_in_parallel_with_result(
    cancel,
    num_workers,
    to_measure,
    move |token, filename: PathBuf| {
      let tracker = measure_tracker.clone();
      let install_dir = measure_dir.clone();
      async move {
        tracker.phase_item_started(Phase::Verify);
        let result = measure_file(&token, &install_dir, filename).await;
        tracker.phase_item_done(Phase::Verify, result.as_ref().err());
        result
      }
    },
  )
  .await?;

  let mut checksums: HashMap<PathBuf, String> = known_hashes;
  for mf in measured {
    manifest.add(&mf.filename, mf.mod_time, mf.checksum.clone());
    checksums.insert(mf.filename, mf.checksum);
  }

  let actions = determine_actions(instructions, &existing_files, &checksums);
  tracker.phase_set_needed(Phase::Download, actions.downloads.len(), true);
  tracker.phase_set_needed(Phase::Apply, actions.updates.len(), true);
  tracker.phase_done(Phase::Verify);
  Ok(actions)
}

async fn measure_file(
  cancel: &CancellationToken,
  install_dir: &Path,
  filename: PathBuf,
) -> Result<MeasuredFile, Error> {
  let real_filename = install_dir.join(&filename);
  let mut file = tokio::fs::File::open(&real_filename).await.map_err(|e| {
    Error::io(
      format!(
        "failed to open '{}' to compute checksum",
        real_filename.display()
      ),
      e,
    )
  })?;
  let metadata = file.metadata().await.map_err(|e| {
    Error::io(
      format!(
        "failed to get basic metadata of '{}'",
        real_filename.display()
      ),
      e,
    )
  })?;
  let mod_time = metadata.modified().map_err(|e| {
    Error::io(
      format!(
        "failed to get modification time of '{}'",
        real_filename.display()
      ),
      e,
    )
  })?;
  let checksum = hash_reader(cancel, &mut file).await?;
  Ok(MeasuredFile {
    filename,
    checksum,
    mod_time: mod_time.into(),
  })
}

async fn run_download_phase(
  cancel: &CancellationToken,
  to_download: &[DownloadInstr],
  install_dir: &Path,
  base_url: &Url,
  download_config: &DownloadConfig,
  tracker: &Arc<ProgressTracker>,
  num_workers: usize,
) -> Result<(), Error> {
  tracker.phase_started(Phase::Download);
  tracing::info!(
    install_dir = %install_dir.display(),
    base_url = %base_url,
    files_to_download = to_download.len(),
    "downloading patch files"
  );

  // The ticker stops with the phase.
  let ticker_cancel = cancel.child_token();
  let stats_tracker = tracker.clone();
  let downloader = Arc::new(Downloader::new(
    download_config.clone(),
    move |stats| stats_tracker.update_download_stats(stats),
    ticker_cancel.clone(),
  )?);

  let dl_tracker = tracker.clone();
  let dl_downloader = downloader.clone();
  let dl_dir = install_dir.to_path_buf();
  let dl_base = base_url.clone();
  let result = do_in_parallel(
    cancel,
    num_workers,
    to_download.to_vec(),
    move |token, di: DownloadInstr| {
      let tracker = dl_tracker.clone();
      let downloader = dl_downloader.clone();
      let install_dir = dl_dir.clone();
      let base_url = dl_base.clone();
      async move {
        tracker.phase_item_started(Phase::Download);
        let result = download_one(&downloader, &token, &base_url, &install_dir, &di).await;
        tracker.phase_item_done(Phase::Download, result.as_ref().err());
        result
      }
    },
  )
  .await;
  ticker_cancel.cancel();
  result?;

  tracker.phase_done(Phase::Download);
  Ok(())
}

async fn download_one(
  downloader: &Downloader,
  cancel: &CancellationToken,
  base_url: &Url,
  install_dir: &Path,
  di: &DownloadInstr,
) -> Result<(), Error> {
  let url = join_url(base_url, &di.remote_path)?;
  downloader
    .download_file(
      cancel,
      url,
      &install_dir.join(&di.local_path),
      &di.checksum,
      di.size,
    )
    .await
}

#[allow(clippy::too_many_arguments)]
async fn run_apply_phase(
  cancel: &CancellationToken,
  to_update: &[UpdateInstr],
  to_delete: &[PathBuf],
  manifest: &mut Manifest,
  install_dir: &Path,
  xdelta: &XDelta,
  tracker: &Arc<ProgressTracker>,
  num_workers: usize,
) -> Result<(), Error> {
  tracker.phase_started(Phase::Apply);
  tracing::info!(
    install_dir = %install_dir.display(),
    files_to_patch = to_update.len(),
    "patching files"
  );
  let apply_tracker = tracker.clone();
  let apply_dir = install_dir.to_path_buf();
  let apply_xdelta = xdelta.clone();
  do_in_parallel(
    cancel,
    num_workers,
    to_update.to_vec(),
    move |token, ui: UpdateInstr| {
      let tracker = apply_tracker.clone();
      let install_dir = apply_dir.clone();
      let xdelta = apply_xdelta.clone();
      async move {
        tracker.phase_item_started(Phase::Apply);
        let result = apply_one(&xdelta, &token, &install_dir, &ui).await;
        tracker.phase_item_done(Phase::Apply, result.as_ref().err());
        result
      }
    },
  )
  .await?;

  tracing::info!(
    install_dir = %install_dir.display(),
    files_to_move = to_update.len(),
    "moving patched files into place"
  );
  for ui in to_update {
    let temp_path = install_dir.join(&ui.temp_path);
    let real_path = install_dir.join(&ui.file_path);
    if let Some(real_dir) = real_path.parent() {
      tokio::fs::create_dir_all(real_dir).await.map_err(|e| {
        Error::io(
          format!(
            "failed to ensure directories for patched file '{}' exist",
            real_path.display()
          ),
          e,
        )
      })?;
    }
    tokio::fs::rename(&temp_path, &real_path)
      .await
      .map_err(|e| {
        Error::io(
          format!(
            "failed to move patched file '{}' to '{}'",
            temp_path.display(),
            real_path.display()
          ),
          e,
        )
      })?;
    let metadata = tokio::fs::metadata(&real_path).await.map_err(|e| {
      Error::io(
        format!("failed to get basic metadata of '{}'", real_path.display()),
        e,
      )
    })?;
    let mod_time = metadata.modified().map_err(|e| {
      Error::io(
        format!(
          "failed to get modification time of '{}'",
          real_path.display()
        ),
        e,
      )
    })?;
    // The file hash was checked during the xdelta run, so it's safe to
    // record it as known.
    manifest.add(&ui.file_path, mod_time.into(), ui.checksum.clone());
  }

  if !to_delete.is_empty() {
    tracing::info!(
      install_dir = %install_dir.display(),
      files_to_delete = to_delete.len(),
      "deleting obsolete files"
    );
  }
  for path in to_delete {
    let real_path = install_dir.join(path);
    tokio::fs::remove_file(&real_path).await.map_err(|e| {
      Error::io(
        format!("failed to remove file '{}'", real_path.display()),
        e,
      )
    })?;
  }

  tracker.phase_done(Phase::Apply);
  Ok(())
}

async fn apply_one(
  xdelta: &XDelta,
  cancel: &CancellationToken,
  install_dir: &Path,
  ui: &UpdateInstr,
) -> Result<(), Error> {
  let patch_path = install_dir.join(&ui.patch_path);
  let temp_path = install_dir.join(&ui.temp_path);
  if ui.is_delta {
    let old_path = install_dir.join(&ui.file_path);
    xdelta
      .apply_patch(cancel, Some(&old_path), &patch_path, &temp_path, &ui.checksum)
      .await
  } else {
    xdelta
      .apply_patch(cancel, None, &patch_path, &temp_path, &ui.checksum)
      .await
  }
}

fn spawn_progress_emitter(
  tracker: Arc<ProgressTracker>,
  progress_fn: ProgressFn,
  interval: Duration,
  cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
  tokio::spawn(async move {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The immediate first tick of an interval.
    ticker.tick().await;
    loop {
      tokio::select! {
        _ = ticker.tick() => progress_fn(tracker.current()),
        _ = cancel.cancelled() => {
          progress_fn(tracker.current());
          return;
        }
      }
    }
  })
}

/// Appends a slash-separated relative path to a base URL as extra path
/// segments, regardless of whether the base ends in a slash.
fn join_url(base: &Url, relative: &str) -> Result<Url, Error> {
  let mut url = base.clone();
  {
    let mut segments = url.path_segments_mut().map_err(|()| {
      Error::io(
        format!("base URL '{base}' cannot carry path segments"),
        std::io::Error::from(std::io::ErrorKind::InvalidInput),
      )
    })?;
    segments.pop_if_empty();
    for part in relative.split('/') {
      segments.push(part);
    }
  }
  Ok(url)
}
