//! `drover preflight`: run the environment checks.

use std::path::Path;

use anyhow::Result;

use drover_core::config::DroverConfig;
use drover_core::preflight::PreflightChecker;

pub fn execute(repo: &Path, workers: Option<u32>) -> Result<()> {
    let config = DroverConfig::load(repo)?;
    let workers = workers.unwrap_or(config.workers.max_concurrent);
    let report = PreflightChecker::new(repo, &config, workers).run_all();
    print!("{report}");
    if !report.passed() {
        anyhow::bail!("pre-flight checks failed");
    }
    Ok(())
}
