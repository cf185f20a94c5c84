//! Storage of the per-frame dependency graph.
//!
//! The graph only keeps the topology and the task names. The task objects
//! themselves live in an arena owned by the queue, indexed by the same
//! [`NodeIndex`] the graph hands out, so the topology can be frozen and
//! shared with the workers while every task body moves to exactly one of
//! them.
//!
//! An edge `a -> b` means "b must not start until a is done".

use std::sync::Arc;

use petgraph::Direction;
use petgraph::Graph;
use petgraph::graph::NodeIndex;

use crate::error::{StuckTask, StuckTasks};
use crate::task::TaskId;

/// Atomic reference-counted string type used for task names.
pub(crate) type ArcStr = Arc<str>;

#[derive(Debug, Clone)]
pub(crate) struct TaskNode {
    pub name: ArcStr,
}

pub(crate) type TaskGraph = Graph<TaskNode, ()>;

/// Verify that the graph can be fully scheduled.
///
/// `toposort` is enough to know whether there is a cycle, but it only points
/// at a single node. When it fails we replay Kahn's algorithm to collect
/// every task the scheduler would be stuck on, with the dependencies each of
/// them is still waiting for.
pub(crate) fn check_acyclic(graph: &TaskGraph, frame: u64) -> Result<(), StuckTasks> {
    match petgraph::algo::toposort(graph, None) {
        Ok(_) => Ok(()),
        Err(_) => Err(stuck_tasks(graph, frame)),
    }
}

fn stuck_tasks(graph: &TaskGraph, frame: u64) -> StuckTasks {
    let mut remaining: Vec<usize> = graph
        .node_indices()
        .map(|i| graph.neighbors_directed(i, Direction::Incoming).count())
        .collect();

    let mut ready: Vec<NodeIndex> = graph
        .node_indices()
        .filter(|i| remaining[i.index()] == 0)
        .collect();

    let mut done = vec![false; graph.node_count()];

    while let Some(index) = ready.pop() {
        done[index.index()] = true;
        for next in graph.neighbors_directed(index, Direction::Outgoing) {
            remaining[next.index()] -= 1;
            if remaining[next.index()] == 0 {
                ready.push(next);
            }
        }
    }

    let stuck = graph
        .node_indices()
        .filter(|i| !done[i.index()])
        .map(|index| {
            let mut waiting_on: Vec<String> = graph
                .neighbors_directed(index, Direction::Incoming)
                .filter(|dep| !done[dep.index()])
                .map(|dep| graph[dep].name.to_string())
                .collect();
            waiting_on.sort();

            StuckTask {
                id: TaskId::new(index, frame),
                name: graph[index].name.to_string(),
                waiting_on,
            }
        })
        .collect();

    StuckTasks(stuck)
}
