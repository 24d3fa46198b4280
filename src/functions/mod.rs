mod hash;
pub use hash::hash_bytes as hash_bytes;
pub use hash::hash_eq as hash_eq;
pub use hash::hash_reader as hash_reader;

pub(crate) mod paths;
pub(crate) use paths::clean_path as clean_path;

mod scan;
pub use scan::scan_files as scan_files;

mod parse_instructions;
pub use parse_instructions::decode_instructions as decode_instructions;

mod determine_actions;
pub use determine_actions::determine_actions as determine_actions;
pub use determine_actions::determine_files_to_measure as determine_files_to_measure;

mod parallel;
pub use parallel::do_in_parallel as do_in_parallel;
pub use parallel::do_in_parallel_with_result as do_in_parallel_with_result;

mod download;
pub use download::Downloader as Downloader;

mod apply_patch;
pub use apply_patch::XDelta as XDelta;

pub(crate) mod prealloc;

mod flow;
pub use flow::run_patcher as run_patcher;
