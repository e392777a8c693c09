//! `drover status`: print a feature's execution state.

use std::path::Path;

use anyhow::Result;

use drover_state::store::{default_state_dir, StateStore};

pub fn execute(repo: &Path, feature: &str) -> Result<()> {
    let store = StateStore::new(feature, default_state_dir(repo));
    let state = store.load()?;

    println!("feature: {}", state.feature);
    println!("current level: {}", state.current_level);
    println!("paused: {}", state.paused);
    if let Some(error) = &state.error {
        println!("error: {error}");
    }

    if !state.tasks.is_empty() {
        println!("tasks:");
        for (id, task) in &state.tasks {
            let worker = task
                .worker_id
                .map(|w| format!(" worker={w}"))
                .unwrap_or_default();
            let duration = task
                .duration_ms
                .map(|ms| format!(" {ms}ms"))
                .unwrap_or_default();
            println!("  {id}: {}{worker}{duration}", task.status);
            if let Some(error) = &task.error {
                println!("    error: {error}");
            }
        }
    }

    if !state.workers.is_empty() {
        println!("workers:");
        for (id, worker) in &state.workers {
            let task = worker
                .current_task
                .as_deref()
                .map(|t| format!(" on {t}"))
                .unwrap_or_default();
            println!(
                "  {id}: {}{task} (completed {}, context {:.0}%)",
                worker.status,
                worker.tasks_completed,
                worker.context_usage * 100.0
            );
        }
    }

    if !state.levels.is_empty() {
        println!("levels:");
        for (level, info) in &state.levels {
            println!("  {level}: {:?} merge={:?}", info.status, info.merge_status);
        }
    }
    Ok(())
}
