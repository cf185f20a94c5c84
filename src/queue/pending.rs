use std::collections::HashMap;

use petgraph::graph::NodeIndex;

use crate::config::PendingPolicy;
use crate::graph::ArcStr;

/// Bookkeeping for dependencies declared by name.
///
/// Collect phase: every registered task is indexed by name, every
/// `add_pending_dependency` call is queued. Resolve phase: the queued entries
/// are joined against the index once and turned into direct edges.
#[derive(Debug, Default)]
pub(crate) struct PendingDependencies {
    by_name: HashMap<ArcStr, Vec<NodeIndex>>,
    waiting: Vec<(ArcStr, NodeIndex)>,
}

/// Outcome of one resolution pass.
#[derive(Debug, Default)]
pub(crate) struct Resolution {
    /// Direct edges `(before, after)`.
    pub edges: Vec<(NodeIndex, NodeIndex)>,
    /// Names nobody registered.
    pub dropped: Vec<ArcStr>,
    /// Names whose only match was the waiting task itself.
    pub self_matches: Vec<ArcStr>,
}

impl PendingDependencies {
    pub fn record_name(&mut self, name: ArcStr, index: NodeIndex) {
        self.by_name.entry(name).or_default().push(index);
    }

    pub fn push(&mut self, name: ArcStr, after: NodeIndex) {
        self.waiting.push((name, after));
    }

    pub fn len(&self) -> usize {
        self.waiting.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(ArcStr, NodeIndex)> {
        self.waiting.iter()
    }

    /// Join queued entries against the tasks indexed so far.
    ///
    /// Entries stay queued: a producer registered later is picked up by the
    /// next pass, and passes never undo each other's edges.
    pub fn resolve(&self, policy: PendingPolicy) -> Resolution {
        let mut resolution = Resolution::default();

        for (name, after) in &self.waiting {
            let Some(matches) = self.by_name.get(name) else {
                resolution.dropped.push(name.clone());
                continue;
            };

            // Registration order keeps these sorted, so the first candidate
            // is the earliest registered task.
            let mut candidates = matches.iter().copied().filter(|before| before != after);

            let linked = match policy {
                PendingPolicy::All => {
                    let len = resolution.edges.len();
                    resolution
                        .edges
                        .extend(candidates.map(|before| (before, *after)));
                    resolution.edges.len() > len
                }
                PendingPolicy::First => match candidates.next() {
                    Some(before) => {
                        resolution.edges.push((before, *after));
                        true
                    }
                    None => false,
                },
            };

            if !linked {
                resolution.self_matches.push(name.clone());
            }
        }

        resolution
    }

    pub fn clear(&mut self) {
        self.by_name.clear();
        self.waiting.clear();
    }
}
