//! Dependency-graph scheduler over a canvas.
//!
//! [`GraphExecutor`] is built once per canvas (or per stream) and tracks
//! which nodes are ready to run. Nodes live in an arena indexed by position;
//! adjacency lists are built once and de-duplicated, so multiple connections
//! between the same parent and child count as a single dependency.
//!
//! When the canvas contains `EXECUTE` marker nodes, only nodes backward
//! reachable from a marker are scheduled and the markers themselves are never
//! dispatched. Without markers every node is scheduled.

use std::collections::{HashMap, VecDeque};

use crate::canvas::{CanvasLayout, NodeKind};
use crate::types::NodeId;

/// Readiness tracker for one canvas.
#[derive(Debug, Clone, Default)]
pub struct GraphExecutor {
    ids: Vec<NodeId>,
    kinds: Vec<NodeKind>,
    index: HashMap<NodeId, usize>,
    parents: Vec<Vec<usize>>,
    children: Vec<Vec<usize>>,
    executable: Vec<bool>,
    /// Outstanding executable parents per node.
    waiting: Vec<usize>,
    completed: Vec<bool>,
    /// Set once a node has been pushed onto `ready`; never cleared.
    enqueued: Vec<bool>,
    ready: VecDeque<usize>,
    has_markers: bool,
}

impl GraphExecutor {
    pub fn new(canvas: &CanvasLayout) -> Self {
        let mut executor = Self::default();
        executor.reset(canvas);
        executor
    }

    /// Rebuild all state for `canvas`, reusing the existing allocations.
    pub fn reset(&mut self, canvas: &CanvasLayout) {
        let n = canvas.nodes.len();

        self.ids.clear();
        self.kinds.clear();
        self.index.clear();
        self.parents.clear();
        self.children.clear();
        self.ready.clear();

        for (i, node) in canvas.nodes.iter().enumerate() {
            self.ids.push(node.id.clone());
            self.kinds.push(node.kind);
            self.index.insert(node.id.clone(), i);
        }
        self.parents.resize_with(n, Vec::new);
        self.children.resize_with(n, Vec::new);

        // Unknown endpoints and self loops are rejected by canvas validation;
        // here they are simply ignored.
        for conn in &canvas.connections {
            let (Some(&s), Some(&t)) = (self.index.get(&conn.source), self.index.get(&conn.target))
            else {
                continue;
            };
            if s == t {
                continue;
            }
            if !self.parents[t].contains(&s) {
                self.parents[t].push(s);
            }
            if !self.children[s].contains(&t) {
                self.children[s].push(t);
            }
        }

        self.has_markers = self.kinds.iter().any(|k| k.is_marker());
        self.executable = self.resolve_executable();

        self.waiting = (0..n)
            .map(|i| {
                self.parents[i]
                    .iter()
                    .filter(|&&p| self.executable[p])
                    .count()
            })
            .collect();
        self.completed = vec![false; n];
        self.enqueued = vec![false; n];

        for i in 0..n {
            if self.executable[i] && self.waiting[i] == 0 {
                self.enqueue(i);
            }
        }
    }

    /// Mark nodes backward-reachable from any marker (breadth-first over
    /// parent edges). Markers themselves are excluded.
    fn resolve_executable(&self) -> Vec<bool> {
        let n = self.ids.len();
        if !self.has_markers {
            return self.kinds.iter().map(|k| !k.is_marker()).collect();
        }

        let mut reachable = vec![false; n];
        let mut queue: VecDeque<usize> = (0..n).filter(|&i| self.kinds[i].is_marker()).collect();
        for &i in &queue {
            reachable[i] = true;
        }
        while let Some(i) = queue.pop_front() {
            for &p in &self.parents[i] {
                if !reachable[p] {
                    reachable[p] = true;
                    queue.push_back(p);
                }
            }
        }

        (0..n)
            .map(|i| reachable[i] && !self.kinds[i].is_marker())
            .collect()
    }

    fn enqueue(&mut self, i: usize) {
        if !self.enqueued[i] && !self.completed[i] {
            self.enqueued[i] = true;
            self.ready.push_back(i);
        }
    }

    /// Pop the next node with no outstanding dependencies.
    pub fn get_ready_node(&mut self) -> Option<NodeId> {
        while let Some(i) = self.ready.pop_front() {
            if !self.completed[i] {
                return Some(self.ids[i].clone());
            }
        }
        None
    }

    /// Drain every currently ready node.
    pub fn drain_ready(&mut self) -> Vec<NodeId> {
        std::iter::from_fn(|| self.get_ready_node()).collect()
    }

    /// Record completion of `id` and release children whose last executable
    /// parent this was.
    ///
    /// Returns `false` (and changes nothing) for unknown or already completed
    /// nodes, so repeated calls never double-decrement.
    pub fn on_node_complete(&mut self, id: &str) -> bool {
        let Some(&i) = self.index.get(id) else {
            return false;
        };
        if self.completed[i] {
            return false;
        }
        self.completed[i] = true;

        if !self.executable[i] {
            return true;
        }

        for ci in 0..self.children[i].len() {
            let c = self.children[i][ci];
            if !self.executable[c] || self.completed[c] {
                continue;
            }
            self.waiting[c] = self.waiting[c].saturating_sub(1);
            if self.waiting[c] == 0 {
                self.enqueue(c);
            }
        }
        true
    }

    pub fn is_executable(&self, id: &str) -> bool {
        self.index.get(id).is_some_and(|&i| self.executable[i])
    }

    /// Executable node ids in canvas order.
    pub fn executable_nodes(&self) -> Vec<NodeId> {
        (0..self.ids.len())
            .filter(|&i| self.executable[i])
            .map(|i| self.ids[i].clone())
            .collect()
    }

    pub fn has_execute_nodes(&self) -> bool {
        self.has_markers
    }

    /// Number of executable nodes not yet completed.
    pub fn pending_count(&self) -> usize {
        (0..self.ids.len())
            .filter(|&i| self.executable[i] && !self.completed[i])
            .count()
    }

    /// True once every executable node has completed.
    pub fn is_complete(&self) -> bool {
        self.pending_count() == 0
    }

    /// Number of nodes currently waiting in the ready queue.
    pub fn ready_len(&self) -> usize {
        self.ready.iter().filter(|&&i| !self.completed[i]).count()
    }

    /// Connected components of the canvas, treating connections as
    /// undirected. Each stream's ids are sorted and streams are ordered by
    /// their minimum node id.
    pub fn isolate_streams(&self) -> Vec<Vec<NodeId>> {
        let n = self.ids.len();
        let mut seen = vec![false; n];
        let mut streams = Vec::new();

        for start in 0..n {
            if seen[start] {
                continue;
            }
            seen[start] = true;
            let mut queue = VecDeque::from([start]);
            let mut members = Vec::new();
            while let Some(i) = queue.pop_front() {
                members.push(self.ids[i].clone());
                for &j in self.parents[i].iter().chain(self.children[i].iter()) {
                    if !seen[j] {
                        seen[j] = true;
                        queue.push_back(j);
                    }
                }
            }
            members.sort();
            streams.push(members);
        }

        streams.sort_by(|a, b| a.first().cmp(&b.first()));
        streams
    }

    /// Streams that contain at least one `EXECUTE` node, or every stream
    /// when the canvas has none.
    pub fn get_executable_streams(&self) -> Vec<Vec<NodeId>> {
        let streams = self.isolate_streams();
        if !self.has_markers {
            return streams;
        }
        streams
            .into_iter()
            .filter(|stream| {
                stream.iter().any(|id| {
                    self.index
                        .get(id)
                        .is_some_and(|&i| self.kinds[i].is_marker())
                })
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
