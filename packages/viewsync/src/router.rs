//! Assignment of client groups to sync workers.

use xxhash_rust::xxh64::xxh64;

/// Picks the worker for a client group by hashing the task id together
/// with the group id. Mixing in the task id spreads the groups of a drained
/// task over its neighbours instead of moving them as one block.
#[derive(Clone, Debug)]
pub struct Router {
    task_id: String,
    workers: usize,
}

impl Router {
    pub fn new(task_id: impl Into<String>, workers: usize) -> Self {
        Self {
            task_id: task_id.into(),
            workers: workers.max(1),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn worker_for(&self, group_id: &str) -> usize {
        worker_index(&self.task_id, group_id, self.workers)
    }
}

pub fn worker_index(task_id: &str, group_id: &str, workers: usize) -> usize {
    let mut key = Vec::with_capacity(task_id.len() + group_id.len() + 1);
    key.extend_from_slice(task_id.as_bytes());
    key.push(b'/');
    key.extend_from_slice(group_id.as_bytes());
    (xxh64(&key, 0) % workers.max(1) as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assignment_is_stable() {
        let router = Router::new("task-a", 8);
        assert_eq!(router.worker_for("g1"), router.worker_for("g1"));
        assert!(router.worker_for("g1") < 8);
    }

    #[test]
    fn test_single_worker_takes_everything() {
        let router = Router::new("task-a", 0);
        assert_eq!(router.workers(), 1);
        assert_eq!(router.worker_for("anything"), 0);
    }

    #[test]
    fn test_groups_spread_over_workers() {
        let router = Router::new("task-a", 4);
        let mut counts = [0usize; 4];
        for i in 0..4000 {
            counts[router.worker_for(&format!("group-{i}"))] += 1;
        }
        assert!(counts.iter().all(|&c| c > 800), "uneven spread: {counts:?}");
    }

    #[test]
    fn test_task_id_changes_assignment() {
        let moved = (0..1000)
            .filter(|i| {
                let g = format!("group-{i}");
                worker_index("task-a", &g, 16) != worker_index("task-b", &g, 16)
            })
            .count();
        assert!(moved > 800);
    }
}
