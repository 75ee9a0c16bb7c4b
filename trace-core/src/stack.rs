// Copyright (C) 2025 Category Labs, Inc.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

/// One frame of a sampled call stack.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct StackFrame {
    symbol: String,
    file: Option<String>,
    line: Option<u32>,
}

impl StackFrame {
    pub fn new(symbol: impl Into<String>) -> Self {
        StackFrame {
            symbol: symbol.into(),
            file: None,
            line: None,
        }
    }

    pub fn with_location(
        symbol: impl Into<String>,
        file: Option<String>,
        line: Option<u32>,
    ) -> Self {
        StackFrame {
            symbol: symbol.into(),
            file,
            line,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }
}

impl fmt::Display for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.file, self.line) {
            (Some(file), Some(line)) => write!(f, "{}({}:{})", self.symbol, file, line),
            (Some(file), None) => write!(f, "{}({})", self.symbol, file),
            _ => write!(f, "{}", self.symbol),
        }
    }
}

/// Scheduling state of the sampled thread at capture time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadState {
    Runnable,
    Blocked,
    Waiting,
    TimedWaiting,
}

impl ThreadState {
    pub fn name(&self) -> &'static str {
        match self {
            ThreadState::Runnable => "RUNNABLE",
            ThreadState::Blocked => "BLOCKED",
            ThreadState::Waiting => "WAITING",
            ThreadState::TimedWaiting => "TIMED_WAITING",
        }
    }
}

/// One observation of a thread: its state and full-depth stack, innermost
/// frame first.
pub struct ThreadSnapshot {
    state: ThreadState,
    frames: Vec<StackFrame>,
}

impl ThreadSnapshot {
    pub fn new(state: ThreadState, frames: Vec<StackFrame>) -> Self {
        ThreadSnapshot { state, frames }
    }

    pub fn state(&self) -> ThreadState {
        self.state
    }

    pub fn frames(&self) -> &[StackFrame] {
        &self.frames
    }
}

/// Provider of stack observations for one thread. The trace holds it weakly,
/// so sampling never keeps the sampled thread's state alive; once the owner
/// drops it, capture degrades to a no-op.
pub trait ThreadSource: Send + Sync {
    fn sample(&self) -> ThreadSnapshot;
}

/// One node of the merged tree: a frame, the number of samples that passed
/// through it, its children in first-seen order, and the thread state of
/// samples that bottomed out here.
pub struct StackNode {
    frame: StackFrame,
    sample_count: AtomicU64,
    children: RwLock<Vec<Arc<StackNode>>>,
    leaf_thread_state: RwLock<Option<ThreadState>>,
}

impl StackNode {
    fn new(frame: StackFrame) -> Self {
        StackNode {
            frame,
            sample_count: AtomicU64::new(0),
            children: RwLock::new(Vec::new()),
            leaf_thread_state: RwLock::new(None),
        }
    }

    pub fn frame(&self) -> &StackFrame {
        &self.frame
    }

    pub fn sample_count(&self) -> u64 {
        self.sample_count.load(Ordering::Acquire)
    }

    /// Children in the order they were first added.
    pub fn children(&self) -> Vec<Arc<StackNode>> {
        self.children.read().clone()
    }

    pub fn is_leaf(&self) -> bool {
        self.children.read().is_empty()
    }

    pub fn leaf_thread_state(&self) -> Option<ThreadState> {
        *self.leaf_thread_state.read()
    }
}

/// Weighted prefix tree of sampled call stacks.
///
/// Writes arrive from one sampling thread at a time; snapshotters read
/// concurrently and tolerate observing newly added children. Each child is
/// linked before its count moves, so a reader never finds a count without
/// the subtree that produced it.
pub struct MergedStackTree {
    roots: RwLock<Vec<Arc<StackNode>>>,
}

impl MergedStackTree {
    pub fn new() -> Self {
        MergedStackTree {
            roots: RwLock::new(Vec::new()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.roots.read().is_empty()
    }

    /// Top-level fan-out in first-seen order. More than one entry means the
    /// sampled thread was observed under distinct outermost frames.
    pub fn root_nodes(&self) -> Vec<Arc<StackNode>> {
        self.roots.read().clone()
    }

    pub fn add_stack_trace(&self, snapshot: &ThreadSnapshot) {
        if snapshot.frames().is_empty() {
            return;
        }
        let mut node: Option<Arc<StackNode>> = None;
        for frame in snapshot.frames().iter().rev() {
            let child = match &node {
                None => Self::child_for(&self.roots, frame),
                Some(parent) => Self::child_for(&parent.children, frame),
            };
            child.sample_count.fetch_add(1, Ordering::Release);
            node = Some(child);
        }
        if let Some(leaf) = node {
            *leaf.leaf_thread_state.write() = Some(snapshot.state());
        }
    }

    fn child_for(children: &RwLock<Vec<Arc<StackNode>>>, frame: &StackFrame) -> Arc<StackNode> {
        if let Some(existing) = children.read().iter().find(|c| c.frame == *frame) {
            return existing.clone();
        }
        let mut children = children.write();
        if let Some(existing) = children.iter().find(|c| c.frame == *frame) {
            return existing.clone();
        }
        let node = Arc::new(StackNode::new(frame.clone()));
        children.push(node.clone());
        node
    }
}

impl Default for MergedStackTree {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(frames: &[&str]) -> ThreadSnapshot {
        // innermost first, matching capture order
        ThreadSnapshot::new(
            ThreadState::Runnable,
            frames.iter().map(|f| StackFrame::new(*f)).collect(),
        )
    }

    #[test]
    fn test_merges_common_prefix() {
        let tree = MergedStackTree::new();
        tree.add_stack_trace(&snapshot(&["h", "g", "f"]));
        tree.add_stack_trace(&snapshot(&["h", "g", "f"]));
        tree.add_stack_trace(&snapshot(&["k", "g", "f"]));

        let roots = tree.root_nodes();
        assert_eq!(roots.len(), 1);
        let f = &roots[0];
        assert_eq!(f.frame().symbol(), "f");
        assert_eq!(f.sample_count(), 3);

        let f_children = f.children();
        assert_eq!(f_children.len(), 1);
        let g = &f_children[0];
        assert_eq!(g.sample_count(), 3);

        let g_children = g.children();
        assert_eq!(g_children.len(), 2);
        assert_eq!(g_children[0].frame().symbol(), "h");
        assert_eq!(g_children[0].sample_count(), 2);
        assert!(g_children[0].is_leaf());
        assert_eq!(g_children[1].frame().symbol(), "k");
        assert_eq!(g_children[1].sample_count(), 1);
        assert!(g_children[1].is_leaf());
    }

    #[test]
    fn test_leaf_records_thread_state() {
        let tree = MergedStackTree::new();
        tree.add_stack_trace(&ThreadSnapshot::new(
            ThreadState::Blocked,
            vec![StackFrame::new("inner"), StackFrame::new("outer")],
        ));
        let leaf = &tree.root_nodes()[0].children()[0];
        assert_eq!(leaf.leaf_thread_state(), Some(ThreadState::Blocked));
        // the interior node carries no state of its own
        assert_eq!(tree.root_nodes()[0].leaf_thread_state(), None);
    }

    #[test]
    fn test_distinct_outermost_frames_fan_out() {
        let tree = MergedStackTree::new();
        tree.add_stack_trace(&snapshot(&["a", "main"]));
        tree.add_stack_trace(&snapshot(&["b", "run"]));
        let roots = tree.root_nodes();
        assert_eq!(roots.len(), 2);
        assert_eq!(roots[0].frame().symbol(), "main");
        assert_eq!(roots[1].frame().symbol(), "run");
    }

    #[test]
    fn test_sample_counts_non_increasing_to_leaves() {
        let tree = MergedStackTree::new();
        tree.add_stack_trace(&snapshot(&["c", "b", "a"]));
        tree.add_stack_trace(&snapshot(&["b", "a"]));
        tree.add_stack_trace(&snapshot(&["d", "c", "b", "a"]));

        fn check(node: &Arc<StackNode>) {
            for child in node.children() {
                assert!(child.sample_count() <= node.sample_count());
                check(&child);
            }
        }
        for root in tree.root_nodes() {
            check(&root);
        }
    }

    #[test]
    fn test_empty_sample_ignored() {
        let tree = MergedStackTree::new();
        tree.add_stack_trace(&ThreadSnapshot::new(ThreadState::Runnable, Vec::new()));
        assert!(tree.is_empty());
    }
}
