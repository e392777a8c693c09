//! Worker heartbeats.
//!
//! Each worker writes a single small record to
//! `<state_dir>/heartbeats/<worker_id>.json` on a fixed interval. The
//! orchestrator reads the record's age during polling; an aged heartbeat
//! on an otherwise-alive handle means the worker is stalled.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::atomic::write_atomic;
use crate::error::{DroverError, Result};

/// One liveness record, overwritten in place on every interval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub worker_id: u32,
    pub timestamp: DateTime<Local>,
    #[serde(default)]
    pub current_task: Option<String>,
    /// Short free-form phase string ("ready", "executing", "verifying").
    #[serde(default)]
    pub phase: String,
}

impl Heartbeat {
    pub fn now(worker_id: u32, current_task: Option<String>, phase: impl Into<String>) -> Self {
        Self {
            worker_id,
            timestamp: Local::now(),
            current_task,
            phase: phase.into(),
        }
    }

    /// Age of this heartbeat relative to now. Zero if the clock went
    /// backwards.
    pub fn age(&self) -> Duration {
        (Local::now() - self.timestamp)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    pub fn is_stale(&self, threshold: Duration) -> bool {
        self.age() > threshold
    }
}

/// Reader/writer for the per-worker heartbeat files.
#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    dir: PathBuf,
}

impl HeartbeatMonitor {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, worker_id: u32) -> PathBuf {
        self.dir.join(format!("{worker_id}.json"))
    }

    pub fn write(&self, heartbeat: &Heartbeat) -> Result<()> {
        let json = serde_json::to_vec(heartbeat)
            .map_err(|e| DroverError::state(format!("failed to serialize heartbeat: {e}")))?;
        write_atomic(&self.path_for(heartbeat.worker_id), &json)
    }

    /// Read a worker's heartbeat. `None` when the worker never wrote one;
    /// an unreadable record is treated the same (the worker will be
    /// handled as stalled, which is the safe direction).
    pub fn read(&self, worker_id: u32) -> Option<Heartbeat> {
        let contents = std::fs::read_to_string(self.path_for(worker_id)).ok()?;
        serde_json::from_str(&contents).ok()
    }

    /// Age of a worker's latest heartbeat, if any.
    pub fn age(&self, worker_id: u32) -> Option<Duration> {
        self.read(worker_id).map(|hb| hb.age())
    }

    /// Whether a worker's heartbeat is older than `threshold`. A missing
    /// heartbeat is not stale — the worker may still be initializing.
    pub fn is_stale(&self, worker_id: u32, threshold: Duration) -> bool {
        match self.read(worker_id) {
            Some(hb) => hb.is_stale(threshold),
            None => false,
        }
    }

    pub fn clear(&self, worker_id: u32) {
        let _ = std::fs::remove_file(self.path_for(worker_id));
    }

    pub fn clear_all(&self) {
        if let Ok(entries) = std::fs::read_dir(&self.dir) {
            for entry in entries.flatten() {
                let _ = std::fs::remove_file(entry.path());
            }
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use tempfile::TempDir;

    #[test]
    fn write_then_read_round_trips() {
        let dir = TempDir::new().unwrap();
        let monitor = HeartbeatMonitor::new(dir.path());
        let hb = Heartbeat::now(3, Some("TASK-007".into()), "executing");
        monitor.write(&hb).unwrap();

        let back = monitor.read(3).unwrap();
        assert_eq!(back.worker_id, 3);
        assert_eq!(back.current_task.as_deref(), Some("TASK-007"));
        assert_eq!(back.phase, "executing");
    }

    #[test]
    fn missing_heartbeat_is_none_and_not_stale() {
        let dir = TempDir::new().unwrap();
        let monitor = HeartbeatMonitor::new(dir.path());
        assert!(monitor.read(9).is_none());
        assert!(!monitor.is_stale(9, Duration::from_secs(1)));
    }

    #[test]
    fn old_heartbeat_is_stale() {
        let dir = TempDir::new().unwrap();
        let monitor = HeartbeatMonitor::new(dir.path());
        let mut hb = Heartbeat::now(0, None, "ready");
        hb.timestamp = Local::now() - TimeDelta::seconds(600);
        monitor.write(&hb).unwrap();

        assert!(monitor.is_stale(0, Duration::from_secs(120)));
        assert!(!monitor.is_stale(0, Duration::from_secs(3600)));
    }

    #[test]
    fn clear_removes_record() {
        let dir = TempDir::new().unwrap();
        let monitor = HeartbeatMonitor::new(dir.path());
        monitor.write(&Heartbeat::now(1, None, "ready")).unwrap();
        monitor.clear(1);
        assert!(monitor.read(1).is_none());
    }
}
