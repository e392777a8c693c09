//! Task graph: model, parsing, validation, and dependency resolution.
//!
//! The graph is consumed as JSON (see the feature's task-graph file), never
//! built here. Validation enforces the structural invariants the rest of
//! the system depends on: unique ids, dependencies that exist and live at
//! strictly lower levels, disjoint `create` sets across the graph, disjoint
//! `modify` sets within a level, and acyclicity.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{DroverError, Result};

/// File ownership declared by a task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileSet {
    #[serde(default)]
    pub create: Vec<String>,
    #[serde(default)]
    pub modify: Vec<String>,
    #[serde(default)]
    pub read: Vec<String>,
}

impl FileSet {
    /// Paths this task will write (created or modified).
    pub fn written(&self) -> impl Iterator<Item = &String> {
        self.create.iter().chain(self.modify.iter())
    }
}

/// Per-task verification command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verification {
    pub command: String,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

/// One task. Immutable once the graph is loaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub level: u32,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub files: FileSet,
    #[serde(default)]
    pub verification: Option<Verification>,
    #[serde(default = "default_estimate")]
    pub estimate_minutes: u32,
    #[serde(default)]
    pub critical_path: bool,
}

fn default_estimate() -> u32 {
    15
}

/// A level's declared name and member tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LevelSpec {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub tasks: Vec<String>,
}

/// Raw task-graph file shape.
#[derive(Debug, Clone, Deserialize)]
struct RawGraph {
    feature: String,
    #[serde(default)]
    critical_path: Option<Vec<String>>,
    tasks: Vec<Task>,
    #[serde(default)]
    levels: BTreeMap<String, LevelSpec>,
}

/// A validated task graph for one feature.
#[derive(Debug, Clone)]
pub struct TaskGraph {
    feature: String,
    tasks: BTreeMap<String, Task>,
    levels: BTreeMap<u32, LevelSpec>,
    critical_path: Option<Vec<String>>,
    /// task id -> ids of tasks that depend on it
    dependents: HashMap<String, Vec<String>>,
}

impl TaskGraph {
    /// Load and validate a task graph from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            DroverError::state(format!("failed to read task graph {}: {e}", path.display()))
        })?;
        let raw: RawGraph = serde_json::from_str(&contents).map_err(|e| {
            DroverError::state(format!(
                "failed to parse task graph {}: {e}",
                path.display()
            ))
        })?;
        Self::from_raw(raw)
    }

    /// Load and validate a task graph from an in-memory JSON value.
    pub fn from_json_value(value: serde_json::Value) -> Result<Self> {
        let raw: RawGraph = serde_json::from_value(value)
            .map_err(|e| DroverError::state(format!("failed to parse task graph: {e}")))?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawGraph) -> Result<Self> {
        let mut tasks = BTreeMap::new();
        for task in raw.tasks {
            if tasks.contains_key(&task.id) {
                return Err(DroverError::Validation {
                    message: format!("duplicate task id: {}", task.id),
                    field: Some("tasks".into()),
                });
            }
            tasks.insert(task.id.clone(), task);
        }

        let mut levels = BTreeMap::new();
        for (key, spec) in raw.levels {
            let level: u32 = key.parse().map_err(|_| DroverError::Validation {
                message: format!("level key is not an integer: {key:?}"),
                field: Some("levels".into()),
            })?;
            levels.insert(level, spec);
        }

        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        for task in tasks.values() {
            for dep in &task.dependencies {
                dependents.entry(dep.clone()).or_default().push(task.id.clone());
            }
        }
        for ids in dependents.values_mut() {
            ids.sort();
        }

        let graph = Self {
            feature: raw.feature,
            tasks,
            levels,
            critical_path: raw.critical_path,
            dependents,
        };
        graph.validate()?;
        Ok(graph)
    }

    /// Enforce the structural invariants, naming every offending task or
    /// edge in the error.
    fn validate(&self) -> Result<()> {
        // Levels must be 1-based.
        for task in self.tasks.values() {
            if task.level == 0 {
                return Err(DroverError::Validation {
                    message: format!("task {} has level 0; levels are 1-based", task.id),
                    field: Some("level".into()),
                });
            }
        }

        // Dependencies exist and cross a level boundary downward.
        for task in self.tasks.values() {
            for dep in &task.dependencies {
                let Some(dep_task) = self.tasks.get(dep) else {
                    return Err(DroverError::Validation {
                        message: format!("task {} depends on unknown task {}", task.id, dep),
                        field: Some("dependencies".into()),
                    });
                };
                if dep_task.level >= task.level {
                    return Err(DroverError::Validation {
                        message: format!(
                            "task {} (level {}) depends on {} (level {}); dependencies must \
                             have a strictly lower level",
                            task.id, task.level, dep, dep_task.level
                        ),
                        field: Some("dependencies".into()),
                    });
                }
            }
        }

        // files.create disjoint across the whole graph.
        let mut creators: HashMap<&str, &str> = HashMap::new();
        for task in self.tasks.values() {
            for file in &task.files.create {
                if let Some(other) = creators.insert(file.as_str(), task.id.as_str()) {
                    return Err(DroverError::Validation {
                        message: format!(
                            "file {file} is created by both {other} and {}",
                            task.id
                        ),
                        field: Some("files.create".into()),
                    });
                }
            }
        }

        // files.modify disjoint within each level (ownership constraint).
        let mut level_modifiers: HashMap<(u32, &str), &str> = HashMap::new();
        for task in self.tasks.values() {
            for file in &task.files.modify {
                if let Some(other) = level_modifiers.insert((task.level, file.as_str()), task.id.as_str()) {
                    return Err(DroverError::Validation {
                        message: format!(
                            "file {file} is modified by both {other} and {} at level {}",
                            task.id, task.level
                        ),
                        field: Some("files.modify".into()),
                    });
                }
            }
        }

        // Acyclicity (level ordering already rules out cycles, but declared
        // levels can lie if edited by hand — topo sort is the guard).
        self.topological_sort()?;

        Ok(())
    }

    // -- queries -----------------------------------------------------------

    pub fn feature_name(&self) -> &str {
        &self.feature
    }

    pub fn total_tasks(&self) -> usize {
        self.tasks.len()
    }

    pub fn get_task(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn all_tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    /// Distinct level numbers in ascending order.
    pub fn levels(&self) -> Vec<u32> {
        let mut levels: BTreeSet<u32> = self.tasks.values().map(|t| t.level).collect();
        levels.extend(self.levels.keys().copied());
        levels.into_iter().collect()
    }

    pub fn level_spec(&self, level: u32) -> Option<&LevelSpec> {
        self.levels.get(&level)
    }

    pub fn tasks_for_level(&self, level: u32) -> Vec<&Task> {
        self.tasks.values().filter(|t| t.level == level).collect()
    }

    pub fn dependencies(&self, id: &str) -> Vec<&Task> {
        self.tasks
            .get(id)
            .map(|t| {
                t.dependencies
                    .iter()
                    .filter_map(|d| self.tasks.get(d))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn dependents(&self, id: &str) -> Vec<&Task> {
        self.dependents
            .get(id)
            .map(|ids| ids.iter().filter_map(|d| self.tasks.get(d)).collect())
            .unwrap_or_default()
    }

    pub fn are_dependencies_complete(&self, id: &str, completed: &HashSet<String>) -> bool {
        self.tasks
            .get(id)
            .map(|t| t.dependencies.iter().all(|d| completed.contains(d)))
            .unwrap_or(false)
    }

    /// Tasks whose dependencies are all complete and which are neither
    /// complete nor already being worked on. Deterministic id order.
    pub fn ready_tasks(
        &self,
        completed: &HashSet<String>,
        in_progress: &HashSet<String>,
    ) -> Vec<&Task> {
        self.tasks
            .values()
            .filter(|t| {
                !completed.contains(&t.id)
                    && !in_progress.contains(&t.id)
                    && t.dependencies.iter().all(|d| completed.contains(d))
            })
            .collect()
    }

    /// Kahn's algorithm with a deterministic (lexicographic) tie-break.
    /// A cycle yields a validation error naming a task on the cycle.
    pub fn topological_sort(&self) -> Result<Vec<String>> {
        let mut in_degree: BTreeMap<&str, usize> = self
            .tasks
            .values()
            .map(|task| {
                let count = task
                    .dependencies
                    .iter()
                    .filter(|d| self.tasks.contains_key(d.as_str()))
                    .count();
                (task.id.as_str(), count)
            })
            .collect();

        // BTreeMap iteration keeps the ready queue sorted by id.
        let mut queue: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(self.tasks.len());

        while let Some(id) = queue.pop_front() {
            order.push(id.to_string());
            if let Some(dependents) = self.dependents.get(id) {
                let mut unblocked: Vec<&str> = Vec::new();
                for dep_id in dependents {
                    if let Some(deg) = in_degree.get_mut(dep_id.as_str()) {
                        *deg -= 1;
                        if *deg == 0 {
                            unblocked.push(dep_id.as_str());
                        }
                    }
                }
                unblocked.sort();
                queue.extend(unblocked);
            }
        }

        if order.len() != self.tasks.len() {
            let stuck = in_degree
                .iter()
                .filter(|(_, deg)| **deg > 0)
                .map(|(id, _)| *id)
                .next()
                .unwrap_or("<unknown>");
            return Err(DroverError::Validation {
                message: format!("dependency cycle detected involving task {stuck}"),
                field: Some("dependencies".into()),
            });
        }
        Ok(order)
    }

    /// The critical path: the declared one if present, otherwise the
    /// longest root-to-leaf path weighted by `estimate_minutes`, ties
    /// broken by lexicographic task id.
    pub fn critical_path(&self) -> Vec<String> {
        if let Some(declared) = &self.critical_path {
            return declared.clone();
        }

        let roots: Vec<&Task> = self
            .tasks
            .values()
            .filter(|t| t.dependencies.is_empty())
            .collect();

        let mut best_path: Vec<String> = Vec::new();
        let mut best_cost: u64 = 0;

        for root in roots {
            self.walk_longest(root, &mut Vec::new(), 0, &mut best_path, &mut best_cost);
        }
        best_path
    }

    fn walk_longest(
        &self,
        node: &Task,
        path: &mut Vec<String>,
        cost: u64,
        best_path: &mut Vec<String>,
        best_cost: &mut u64,
    ) {
        path.push(node.id.clone());
        let cost = cost + u64::from(node.estimate_minutes);

        let children = self.dependents(&node.id);
        if children.is_empty() {
            // Strict > keeps the lexicographically-first path on ties
            // because we visit tasks in id order.
            if cost > *best_cost {
                *best_cost = cost;
                *best_path = path.clone();
            }
        } else {
            for child in children {
                self.walk_longest(child, path, cost, best_path, best_cost);
            }
        }
        path.pop();
    }

    pub fn verification(&self, id: &str) -> Option<&Verification> {
        self.tasks.get(id).and_then(|t| t.verification.as_ref())
    }

    pub fn files_for_task(&self, id: &str) -> Option<&FileSet> {
        self.tasks.get(id).map(|t| &t.files)
    }
}
