// Copyright 2025-Present Stacktrace Core Contributors
// SPDX-License-Identifier: Apache-2.0

//! Stack Aggregator (C4): folds multiple per-thread stacks into a single
//! prefix-shared tree.
//!
//! Grounded on the teacher's general pattern of building an owned tree of
//! frames for a crash report (`crash_info::stacktrace::StackTrace` wraps a
//! flat `Vec<StackFrame>`; this module generalizes that to the branching
//! structure §4.4 calls for, since the teacher has no multi-thread
//! aggregation step of its own to copy directly).

use crate::frame::StackFrame;
use serde::{Deserialize, Serialize};

/// A list of capture-entry-point function names stripped from the root
/// chain by [`MultiStack::cleanup`] (§4.4 `cleanupStackTrace`). These are
/// the names the capture path itself uses; see `platform::unix::capture`.
const CAPTURE_ENTRY_POINTS: &[&str] = &[
    "get_call_stack",
    "backtrace",
    "capture_backtrace",
    "capture_thread_backtrace",
    "raise_signal",
    "signal_trampoline",
];

/// One node of a [`MultiStack`]. Sub-trees are exclusively owned by their
/// parent (§3 ownership model) — no `Rc`/`Arc` sharing between trees.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiStackNode {
    pub frame: StackFrame,
    /// Number of source stacks passing through this node.
    pub n: usize,
    pub children: Vec<MultiStackNode>,
}

impl MultiStackNode {
    // `n` starts at 0, not 1: every call site immediately follows this with
    // `insert_path`, whose first line is `self.n += 1`, so this is what
    // brings a freshly created node to `n == 1` for the stack that created it.
    fn new(frame: StackFrame) -> Self {
        Self {
            frame,
            n: 0,
            children: Vec::new(),
        }
    }

    /// Frame-equality for aggregation purposes: `address` equality is
    /// sufficient and fastest (§4.4); frames synthesised without an
    /// address (all-zero, never produced by the resolver but possible in
    /// hand-built test fixtures) fall back to comparing `function` so two
    /// such frames don't spuriously collide on `address == 0`.
    fn matches(&self, frame: &StackFrame) -> bool {
        if self.frame.address != 0 || frame.address != 0 {
            self.frame.address == frame.address
        } else {
            self.frame.function == frame.function
        }
    }

    fn insert_path(&mut self, path: &[StackFrame]) {
        self.n += 1;
        let Some((head, rest)) = path.split_first() else {
            return;
        };
        if let Some(child) = self.children.iter_mut().find(|c| c.matches(head)) {
            child.insert_path(rest);
        } else {
            let mut child = MultiStackNode::new(head.clone());
            child.insert_path(rest);
            self.children.push(child);
        }
    }

    /// Restores the deterministic child order required by §5 "Ordering
    /// guarantees": descending `n`, ties broken by ascending `address`.
    fn sort_children(&mut self) {
        self.children
            .sort_by(|a, b| b.n.cmp(&a.n).then(a.frame.address.cmp(&b.frame.address)));
        for child in &mut self.children {
            child.sort_children();
        }
    }
}

/// A prefix-shared tree of [`StackFrame`]s summarising multiple call
/// stacks (§3, §4.4). The root represents "program entry" and is not
/// itself a captured frame; its `n` is the number of stacks folded in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiStack {
    pub n: usize,
    pub children: Vec<MultiStackNode>,
}

impl MultiStack {
    pub fn new() -> Self {
        Self {
            n: 0,
            children: Vec::new(),
        }
    }

    /// Folds `stacks` (each innermost-first, per §5 ordering guarantees)
    /// into a fresh tree whose root `n` equals `stacks.len()`.
    pub fn aggregate(stacks: &[Vec<StackFrame>]) -> Self {
        let mut tree = Self::new();
        for stack in stacks {
            tree.insert(stack);
        }
        tree
    }

    /// Inserts one more stack, incrementing `n` and recursing down the
    /// tree per the §4.4 algorithm.
    pub fn insert(&mut self, stack: &[StackFrame]) {
        self.n += 1;
        let Some((head, rest)) = stack.split_first() else {
            return;
        };
        if let Some(child) = self.children.iter_mut().find(|c| c.matches(head)) {
            child.insert_path(rest);
        } else {
            let mut child = MultiStackNode::new(head.clone());
            child.insert_path(rest);
            self.children.push(child);
        }
        self.sort_children();
    }

    fn sort_children(&mut self) {
        self.children
            .sort_by(|a, b| b.n.cmp(&a.n).then(a.frame.address.cmp(&b.frame.address)));
        for child in &mut self.children {
            child.sort_children();
        }
    }

    /// Checks the invariant from §7 Testable Property 2: for every node,
    /// the sum of its children's `n` never exceeds its own. Used in tests
    /// and debug assertions, not on any hot path.
    pub fn check_invariant(&self) -> bool {
        let sum: usize = self.children.iter().map(|c| c.n).sum();
        sum <= self.n && self.children.iter().all(Self::check_node_invariant)
    }

    fn check_node_invariant(node: &MultiStackNode) -> bool {
        let sum: usize = node.children.iter().map(|c| c.n).sum();
        sum <= node.n && node.children.iter().all(Self::check_node_invariant)
    }
}

impl Default for MultiStack {
    fn default() -> Self {
        Self::new()
    }
}

/// Strips frames belonging to the capture machinery itself from the front
/// of `stack`, per §4.4 `cleanupStackTrace`. Stops at the first frame
/// whose `function` is not on [`CAPTURE_ENTRY_POINTS`].
pub fn cleanup_stack_trace(stack: &[StackFrame]) -> &[StackFrame] {
    let mut idx = 0;
    while idx < stack.len() && CAPTURE_ENTRY_POINTS.contains(&stack[idx].function.as_str()) {
        idx += 1;
    }
    &stack[idx..]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(addr: u64) -> StackFrame {
        StackFrame::with_address(addr)
    }

    #[test]
    fn test_aggregation_matches_spec_example() {
        // S4: [a,b,c], [a,b,d], [a,e] -> root(3) -> a(3) -> {b(2) -> {c(1), d(1)}, e(1)}
        let stacks = vec![
            vec![frame(0xa), frame(0xb), frame(0xc)],
            vec![frame(0xa), frame(0xb), frame(0xd)],
            vec![frame(0xa), frame(0xe)],
        ];
        let tree = MultiStack::aggregate(&stacks);
        assert_eq!(tree.n, 3);
        assert_eq!(tree.children.len(), 1);

        let a = &tree.children[0];
        assert_eq!(a.frame.address, 0xa);
        assert_eq!(a.n, 3);
        assert_eq!(a.children.len(), 2);

        // b(2) before e(1): descending n.
        let b = &a.children[0];
        let e = &a.children[1];
        assert_eq!(b.frame.address, 0xb);
        assert_eq!(b.n, 2);
        assert_eq!(e.frame.address, 0xe);
        assert_eq!(e.n, 1);

        // c before d: tie on n=1, ascending address.
        assert_eq!(b.children.len(), 2);
        assert_eq!(b.children[0].frame.address, 0xc);
        assert_eq!(b.children[1].frame.address, 0xd);

        assert!(tree.check_invariant());
    }

    #[test]
    fn test_empty_aggregate() {
        let tree = MultiStack::aggregate(&[]);
        assert_eq!(tree.n, 0);
        assert!(tree.children.is_empty());
    }

    #[test]
    fn test_single_stack() {
        let tree = MultiStack::aggregate(&[vec![frame(1), frame(2)]]);
        assert_eq!(tree.n, 1);
        assert_eq!(tree.children[0].n, 1);
        assert_eq!(tree.children[0].children[0].n, 1);
    }

    #[test]
    fn test_cleanup_strips_known_entry_points() {
        let mut stack = vec![frame(1), frame(2), frame(3)];
        stack[0].function = "capture_backtrace".to_string();
        stack[1].function = "get_call_stack".to_string();
        stack[2].function = "user_code".to_string();

        let cleaned = cleanup_stack_trace(&stack);
        assert_eq!(cleaned.len(), 1);
        assert_eq!(cleaned[0].function, "user_code");
    }

    #[test]
    fn test_cleanup_stops_at_first_unknown_frame() {
        let mut stack = vec![frame(1), frame(2), frame(3)];
        stack[0].function = "capture_backtrace".to_string();
        stack[1].function = "user_code".to_string();
        stack[2].function = "backtrace".to_string();

        let cleaned = cleanup_stack_trace(&stack);
        assert_eq!(cleaned.len(), 2);
        assert_eq!(cleaned[0].function, "user_code");
    }

    #[test]
    fn test_cleanup_all_frames_internal() {
        let mut stack = vec![frame(1)];
        stack[0].function = "backtrace".to_string();
        assert!(cleanup_stack_trace(&stack).is_empty());
    }
}
