//! Task-to-worker assignment.
//!
//! Greedy longest-processing-time-first bin packing: sort tasks by
//! estimate descending, place each on the worker with the lowest
//! cumulative load. Deterministic: estimate ties break by task id, load
//! ties by lowest worker id. Shared by the orchestrator and the dry-run
//! simulator.

use std::collections::BTreeMap;

use drover_state::graph::Task;

/// A computed assignment of tasks to workers.
#[derive(Debug, Clone, Default)]
pub struct WorkerAssignment {
    /// worker id -> assigned task ids, in assignment order.
    assignments: BTreeMap<u32, Vec<String>>,
    /// worker id -> cumulative estimate minutes.
    loads: BTreeMap<u32, u32>,
    /// task id -> worker id.
    by_task: BTreeMap<String, u32>,
}

impl WorkerAssignment {
    /// Assign `tasks` across `worker_count` workers.
    pub fn assign(tasks: &[&Task], worker_count: u32) -> Self {
        let mut result = Self::default();
        if worker_count == 0 {
            return result;
        }
        for worker_id in 0..worker_count {
            result.assignments.insert(worker_id, Vec::new());
            result.loads.insert(worker_id, 0);
        }

        let mut ordered: Vec<&&Task> = tasks.iter().collect();
        ordered.sort_by(|a, b| {
            b.estimate_minutes
                .cmp(&a.estimate_minutes)
                .then_with(|| a.id.cmp(&b.id))
        });

        for task in ordered {
            let (&worker_id, _) = result
                .loads
                .iter()
                .min_by_key(|&(id, load)| (*load, *id))
                .expect("worker_count > 0");
            result
                .assignments
                .get_mut(&worker_id)
                .expect("initialized above")
                .push(task.id.clone());
            *result.loads.get_mut(&worker_id).expect("initialized above") +=
                task.estimate_minutes;
            result.by_task.insert(task.id.clone(), worker_id);
        }

        result
    }

    pub fn task_worker(&self, task_id: &str) -> Option<u32> {
        self.by_task.get(task_id).copied()
    }

    pub fn tasks_for_worker(&self, worker_id: u32) -> &[String] {
        self.assignments
            .get(&worker_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Cumulative estimate minutes per worker.
    pub fn worker_loads(&self) -> &BTreeMap<u32, u32> {
        &self.loads
    }

    /// Workers that received at least one task.
    pub fn busy_workers(&self) -> Vec<u32> {
        self.assignments
            .iter()
            .filter(|(_, tasks)| !tasks.is_empty())
            .map(|(id, _)| *id)
            .collect()
    }

    /// The level's wall-clock estimate: the heaviest worker's load.
    pub fn max_load(&self) -> u32 {
        self.loads.values().copied().max().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drover_state::graph::FileSet;

    fn task(id: &str, estimate: u32) -> Task {
        Task {
            id: id.into(),
            title: id.into(),
            level: 1,
            dependencies: vec![],
            files: FileSet::default(),
            verification: None,
            estimate_minutes: estimate,
            critical_path: false,
        }
    }

    #[test]
    fn lpt_minimizes_max_load() {
        let tasks = [task("A", 30), task("B", 20), task("C", 20), task("D", 10)];
        let refs: Vec<&Task> = tasks.iter().collect();
        let assignment = WorkerAssignment::assign(&refs, 2);

        // LPT: A->0, B->1, C->1(20) vs 0(30): C->1, D-> lighter.
        assert_eq!(assignment.task_worker("A"), Some(0));
        assert_eq!(assignment.task_worker("B"), Some(1));
        assert_eq!(assignment.task_worker("C"), Some(1));
        assert_eq!(assignment.max_load(), 40);
        let total: u32 = assignment.worker_loads().values().sum();
        assert_eq!(total, 80);
    }

    #[test]
    fn ties_break_by_lowest_worker_id() {
        let tasks = [task("A", 10), task("B", 10)];
        let refs: Vec<&Task> = tasks.iter().collect();
        let assignment = WorkerAssignment::assign(&refs, 3);
        assert_eq!(assignment.task_worker("A"), Some(0));
        assert_eq!(assignment.task_worker("B"), Some(1));
        assert!(assignment.tasks_for_worker(2).is_empty());
        assert_eq!(assignment.busy_workers(), vec![0, 1]);
    }

    #[test]
    fn equal_estimates_assign_in_id_order() {
        let tasks = [task("B", 10), task("A", 10), task("C", 10)];
        let refs: Vec<&Task> = tasks.iter().collect();
        let assignment = WorkerAssignment::assign(&refs, 3);
        assert_eq!(assignment.task_worker("A"), Some(0));
        assert_eq!(assignment.task_worker("B"), Some(1));
        assert_eq!(assignment.task_worker("C"), Some(2));
    }

    #[test]
    fn zero_workers_yields_empty_assignment() {
        let tasks = [task("A", 10)];
        let refs: Vec<&Task> = tasks.iter().collect();
        let assignment = WorkerAssignment::assign(&refs, 0);
        assert!(assignment.task_worker("A").is_none());
        assert_eq!(assignment.max_load(), 0);
    }

    #[test]
    fn more_workers_than_tasks() {
        let tasks = [task("A", 5)];
        let refs: Vec<&Task> = tasks.iter().collect();
        let assignment = WorkerAssignment::assign(&refs, 4);
        assert_eq!(assignment.busy_workers(), vec![0]);
        assert_eq!(assignment.max_load(), 5);
    }
}
