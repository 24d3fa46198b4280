mod error;
pub use error::Error as Error;

mod averager;
pub use averager::Averager as Averager;

mod config;
pub use config::DownloadConfig as DownloadConfig;
pub use config::PatcherConfig as PatcherConfig;
pub use config::ProgressFn as ProgressFn;

mod instruction;
pub use instruction::Instruction as Instruction;

mod actions;
pub use actions::DownloadInstr as DownloadInstr;
pub use actions::PlannedActions as PlannedActions;
pub use actions::UpdateInstr as UpdateInstr;

mod download_stats;
pub use download_stats::DownloadStats as DownloadStats;

mod file_info;
pub use file_info::BasicFileInfo as BasicFileInfo;

mod manifest;
pub use manifest::Manifest as Manifest;
pub use manifest::ManifestEntry as ManifestEntry;
pub use manifest::MANIFEST_FILENAME as MANIFEST_FILENAME;

mod progress;
pub use progress::Phase as Phase;
pub use progress::Progress as Progress;
pub use progress::ProgressPhase as ProgressPhase;
pub use progress::ProgressTracker as ProgressTracker;
