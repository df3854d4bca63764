//! Task queues.
//!
//! Each executor gets one priority queue. Pushing a task also hands the
//! executor a job that pops and runs the best task of that queue, so the
//! order in which executor threads pick jobs does not matter.

use super::executor::{Executor, Job};
use crate::framework::handler::InputSet;
use crate::framework::id::NodeId;
use crate::framework::timestamp::Timestamp;
use parking_lot::Mutex;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Arc;

#[derive(Debug)]
pub(crate) enum TaskKind {
    Open,
    Process { sets: Vec<InputSet> },
    SourceProcess,
    Close,
}

impl TaskKind {
    pub(crate) fn label(&self) -> &'static str {
        match self {
            TaskKind::Open => "open",
            TaskKind::Process { .. } => "process",
            TaskKind::SourceProcess => "source",
            TaskKind::Close => "close",
        }
    }
}

/// Scheduling rank of a task.
///
/// Ordinary nodes run before sources and downstream nodes before upstream
/// ones, which drains the graph before more data is produced. Sources run by
/// layer, then by how far their output has advanced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TaskPriority {
    pub source: bool,
    pub topo_position: usize,
    pub source_layer: i32,
    pub last_output: Timestamp,
}

impl TaskPriority {
    fn key(&self) -> (bool, usize, Reverse<i32>, Reverse<Timestamp>) {
        if self.source {
            (false, 0, Reverse(self.source_layer), Reverse(self.last_output))
        } else {
            (true, self.topo_position, Reverse(0), Reverse(Timestamp::UNSET))
        }
    }
}

#[derive(Debug)]
pub(crate) struct Task {
    pub node: NodeId,
    pub seq: u64,
    pub kind: TaskKind,
    pub priority: TaskPriority,
    /// Insertion order, for FIFO among equal priorities
    pub order: u64,
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Task {}

impl PartialOrd for Task {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Task {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .key()
            .cmp(&other.priority.key())
            .then_with(|| other.order.cmp(&self.order))
    }
}

/// Priority queue in front of one executor.
pub(crate) struct SchedulerQueue {
    name: String,
    heap: Mutex<BinaryHeap<Task>>,
    executor: Arc<dyn Executor>,
}

impl SchedulerQueue {
    pub(crate) fn new(name: impl Into<String>, executor: Arc<dyn Executor>) -> Self {
        Self {
            name: name.into(),
            heap: Mutex::new(BinaryHeap::new()),
            executor,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Queue `task` and ask the executor to run `job`, which must call `pop`.
    pub(crate) fn push(&self, task: Task, job: Job) {
        self.heap.lock().push(task);
        self.executor.schedule(job);
    }

    pub(crate) fn pop(&self) -> Option<Task> {
        self.heap.lock().pop()
    }

    pub(crate) fn len(&self) -> usize {
        self.heap.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(order: u64, priority: TaskPriority) -> Task {
        Task {
            node: NodeId(order as u32),
            seq: 0,
            kind: TaskKind::Open,
            priority,
            order,
        }
    }

    fn node(topo_position: usize) -> TaskPriority {
        TaskPriority {
            source: false,
            topo_position,
            source_layer: 0,
            last_output: Timestamp::UNSET,
        }
    }

    fn source(layer: i32, last: i64) -> TaskPriority {
        TaskPriority {
            source: true,
            topo_position: 0,
            source_layer: layer,
            last_output: Timestamp::new(last).unwrap(),
        }
    }

    fn drain(tasks: Vec<Task>) -> Vec<u64> {
        let mut heap: BinaryHeap<Task> = tasks.into_iter().collect();
        std::iter::from_fn(|| heap.pop().map(|t| t.order)).collect()
    }

    #[test]
    fn test_downstream_nodes_first() {
        let order = drain(vec![task(0, node(1)), task(1, node(5)), task(2, node(3))]);
        assert_eq!(order, vec![1, 2, 0]);
    }

    #[test]
    fn test_sources_after_nodes_by_layer_then_progress() {
        let order = drain(vec![
            task(0, source(1, 0)),
            task(1, source(0, 50)),
            task(2, node(0)),
            task(3, source(0, 10)),
        ]);
        assert_eq!(order, vec![2, 3, 1, 0]);
    }

    /// Holds jobs until the test runs them.
    #[derive(Default)]
    struct Deferred {
        jobs: Mutex<Vec<Job>>,
    }

    impl Executor for Deferred {
        fn schedule(&self, job: Job) {
            self.jobs.lock().push(job);
        }

        fn num_threads(&self) -> usize {
            1
        }
    }

    #[test]
    fn test_queue_hands_highest_priority_to_each_job() {
        let executor = Arc::new(Deferred::default());
        let queue = Arc::new(SchedulerQueue::new("deferred", executor.clone()));
        let popped = Arc::new(Mutex::new(Vec::new()));
        for (order, position) in [(0, 1), (1, 7)] {
            let (queue_ref, popped) = (Arc::clone(&queue), Arc::clone(&popped));
            queue.push(
                task(order, node(position)),
                Box::new(move || {
                    if let Some(task) = queue_ref.pop() {
                        popped.lock().push(task.order);
                    }
                }),
            );
        }
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.name(), "deferred");

        let first = executor.jobs.lock().remove(0);
        first();
        assert_eq!(queue.len(), 1);
        assert_eq!(*popped.lock(), vec![1]);
    }

    #[test]
    fn test_fifo_among_equals() {
        let order = drain(vec![task(2, node(4)), task(0, node(4)), task(1, node(4))]);
        assert_eq!(order, vec![0, 1, 2]);
    }
}
