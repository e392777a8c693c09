pub mod cleanup;
pub mod debug;
pub mod dryrun;
pub mod preflight;
pub mod run;
pub mod status;
pub mod worker;

use std::path::{Path, PathBuf};

/// Default task-graph location for a feature.
pub fn default_graph_path(repo: &Path, feature: &str) -> PathBuf {
    repo.join(".drover").join("tasks").join(format!("{feature}.json"))
}
