use std::collections::BTreeMap;
use std::ops::Bound;

use crate::svn::dump::{NodeAction, NodeKind, SvnModel};

/// Reconstructs the set of files under a directory as it existed at a past
/// revision, for copies whose source has since diverged.
///
/// Paths whose history is needed are registered with [`StateTracker::need`]
/// before a single replay over the whole node arena builds a per-file event
/// log. A path has at most one live entry at a time: re-adding replaces the
/// previous entry, and a delete stays in effect until an explicit re-add.
pub(crate) struct StateTracker {
    needs: Vec<(Vec<u8>, u32)>,
    events: BTreeMap<Vec<u8>, Vec<(u32, Option<usize>)>>,
    resolved: bool,
}

impl StateTracker {
    pub(crate) fn new() -> Self {
        Self {
            needs: Vec::new(),
            events: BTreeMap::new(),
            resolved: false,
        }
    }

    pub(crate) fn need(&mut self, path: &[u8], rev: u32) {
        assert!(!self.resolved, "cannot register needs after resolve");
        self.needs.push((path.to_vec(), rev));
    }

    /// Replays every node once, building the event log. Directory copies are
    /// expanded against the states already accumulated, which works because
    /// a copy source revision always precedes the copying node.
    pub(crate) fn resolve(&mut self, model: &SvnModel) {
        if self.needs.is_empty() {
            self.resolved = true;
            return;
        }

        for (node_i, node) in model.nodes.iter().enumerate() {
            let rev = node.rev_no;
            match node.action {
                NodeAction::Add | NodeAction::Change | NodeAction::Replace => {
                    if node.action == NodeAction::Replace {
                        self.delete_subtree(&node.path, rev);
                    }
                    match node.kind {
                        Some(NodeKind::File) => {
                            self.push_event(&node.path, rev, Some(node_i));
                        }
                        Some(NodeKind::Dir) => {
                            if let Some(copy_from) = &node.copy_from {
                                let src_state =
                                    self.files_under(&copy_from.path, copy_from.rev);
                                for (src_path, src_node) in src_state {
                                    let suffix = &src_path[copy_from.path.len()..];
                                    let mut dst_path = node.path.clone();
                                    dst_path.extend_from_slice(suffix);
                                    self.push_event(&dst_path, rev, Some(src_node));
                                }
                            }
                        }
                        None => {}
                    }
                }
                NodeAction::Delete => {
                    self.push_event(&node.path, rev, None);
                    self.delete_subtree(&node.path, rev);
                }
            }
        }

        self.resolved = true;
    }

    /// Files under `dir` (inclusive of `dir` itself when it is a file) as of
    /// the end of `rev`, mapped to the arena index of the node that last
    /// wrote their content.
    pub(crate) fn files_under(&self, dir: &[u8], rev: u32) -> BTreeMap<Vec<u8>, usize> {
        let mut out = BTreeMap::new();

        if let Some(node_i) = self.live_at(dir, rev) {
            out.insert(dir.to_vec(), node_i);
        }

        let (start, end) = subtree_bounds(dir);
        for (path, events) in self
            .events
            .range::<[u8], _>((Bound::Included(start.as_slice()), Bound::Excluded(end.as_slice())))
        {
            if let Some(node_i) = last_event_at(events, rev) {
                out.insert(path.clone(), node_i);
            }
        }

        out
    }

    fn live_at(&self, path: &[u8], rev: u32) -> Option<usize> {
        self.events
            .get(path)
            .and_then(|events| last_event_at(events, rev))
    }

    fn push_event(&mut self, path: &[u8], rev: u32, node: Option<usize>) {
        self.events
            .entry(path.to_vec())
            .or_default()
            .push((rev, node));
    }

    fn delete_subtree(&mut self, dir: &[u8], rev: u32) {
        let (start, end) = subtree_bounds(dir);
        let doomed: Vec<Vec<u8>> = self
            .events
            .range::<[u8], _>((Bound::Included(start.as_slice()), Bound::Excluded(end.as_slice())))
            .filter(|(_, events)| last_event_at(events, rev).is_some())
            .map(|(path, _)| path.clone())
            .collect();
        for path in doomed {
            self.push_event(&path, rev, None);
        }
    }
}

// Last event with revision <= rev; None if that event is a delete or there
// is no event yet.
fn last_event_at(events: &[(u32, Option<usize>)], rev: u32) -> Option<usize> {
    events
        .iter()
        .rev()
        .find(|(event_rev, _)| *event_rev <= rev)
        .and_then(|(_, node)| *node)
}

// Byte range covering "<dir>/..." ('0' is '/' + 1).
fn subtree_bounds(dir: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let mut start = dir.to_vec();
    start.push(b'/');
    let mut end = dir.to_vec();
    end.push(b'0');
    (start, end)
}
