use crate::convert::path_states::StateTracker;
use crate::params_file::ConvParams;
use crate::svn::classify::Layout;
use crate::svn::dump::{NodeAction, NodeKind, SvnModel};
use crate::{FHashMap, FHashSet};

use super::ConversionContext;

pub(crate) struct Analysis {
    pub(crate) tracker: StateTracker,
    /// Tag name -> (first edit revision, last edit revision). Tags edited
    /// after creation live as branches until their last edit.
    pub(crate) edited_tags: FHashMap<Vec<u8>, (u32, u32)>,
    pub(crate) branch_overrides: FHashMap<u32, Vec<u8>>,
    pub(crate) skip_revs: FHashSet<u32>,
}

/// Two passes over the whole model: pass 1 finds copies whose source has
/// since diverged and registers the historical states they need; pass 2
/// classifies every node and derives the per-node and per-revision flags
/// the generator works from.
pub(crate) fn run(
    model: &mut SvnModel,
    layout: &Layout,
    params: &ConvParams,
    ctx: &mut ConversionContext,
) -> Analysis {
    let mut analysis = Analysis {
        tracker: StateTracker::new(),
        edited_tags: FHashMap::default(),
        branch_overrides: params
            .branch_overrides
            .iter()
            .map(|o| (o.rev, o.branch.as_bytes().to_vec()))
            .collect(),
        skip_revs: params.skip_revs.iter().copied().collect(),
    };
    let rejected_tags: FHashSet<Vec<u8>> = params
        .rejected_tags
        .iter()
        .map(|t| t.as_bytes().to_vec())
        .collect();

    find_stale_copies(model, layout, &mut analysis.tracker);
    classify_nodes(model, layout, params, &rejected_tags, ctx, &mut analysis);
    analysis.tracker.resolve(model);

    analysis
}

// A copy is stale when its source branch differs from the destination
// branch, or when the source path (or anything below it) was committed to
// after the copy source revision. Fresh same-branch copies can be expressed
// as in-tree copies; stale ones need the historical file set.
fn find_stale_copies(model: &mut SvnModel, layout: &Layout, tracker: &mut StateTracker) {
    let mut last_touch: FHashMap<Vec<u8>, u32> = FHashMap::default();

    for node in &mut model.nodes {
        if let Some(copy_from) = &node.copy_from {
            let src_class = layout.classify(&copy_from.path);
            let dst_class = layout.classify(&node.path);
            let cross_branch = src_class.branch != dst_class.branch
                || src_class.tag != dst_class.tag
                || src_class.project != dst_class.project;
            let source_moved_on = last_touch
                .get(&copy_from.path)
                .is_some_and(|&last| last > copy_from.rev);
            if cross_branch || source_moved_on {
                node.stale_copy = true;
                tracker.need(&copy_from.path, copy_from.rev);
            }
        }

        // every ancestor records the touch, so subtree staleness is one lookup
        last_touch.insert(node.path.clone(), node.rev_no);
        let mut ancestor = node.path.as_slice();
        while let Some(pos) = ancestor.iter().rposition(|&b| b == b'/') {
            ancestor = &ancestor[..pos];
            last_touch.insert(ancestor.to_vec(), node.rev_no);
        }
    }
}

fn classify_nodes(
    model: &mut SvnModel,
    layout: &Layout,
    params: &ConvParams,
    rejected_tags: &FHashSet<Vec<u8>>,
    ctx: &mut ConversionContext,
    analysis: &mut Analysis,
) {
    let project = params.project.as_bytes();
    let mut exec_paths: FHashSet<Vec<u8>> = FHashSet::default();
    // absolute svn:mergeinfo per path, to derive newly merged revisions
    let mut prev_mergeinfo: FHashMap<Vec<u8>, FHashMap<Vec<u8>, u32>> = FHashMap::default();

    for rev_i in 0..model.revisions.len() {
        let node_range = model.revisions[rev_i].nodes.clone();
        let rev_no = model.revisions[rev_i].rev_no;

        let mut rev_project = None;
        let mut rev_merged: Option<(Vec<u8>, u32)> = None;
        let mut rev_move_edit = false;

        for node_i in node_range.clone() {
            let node = &mut model.nodes[node_i];
            let class = layout.classify(&node.path);

            node.project = class.project;
            node.is_tag_path = class.is_tag;
            node.local_path = class.local_path;
            if let Some(tag) = class.tag {
                if rejected_tags.contains(&tag) {
                    // reject-listed tags drop out of the conversion entirely
                    node.skip = true;
                    continue;
                }
                node.tag = Some(tag);
            } else {
                node.branch = class.branch;
            }

            // overridden revisions were committed to the wrong location;
            // every node in them lands on the configured branch
            if let Some(over) = analysis.branch_overrides.get(&rev_no) {
                node.branch = Some(over.clone());
                node.tag = None;
                node.is_tag_path = false;
            }

            node.skip = node.project.as_deref() != Some(project);
            if node.skip {
                continue;
            }

            if rev_project.is_none() {
                rev_project = node.project.clone();
            }

            // seed the content identity map
            if let Some(text) = &node.text {
                if let Some(sha1) = &text.sha1 {
                    let git_sha1 = text.git_sha1;
                    let sha1 = sha1.clone();
                    ctx.record_blob_id(&sha1, git_sha1);
                }
            }

            let node = &mut model.nodes[node_i];
            derive_node_flags(node, &mut exec_paths);
            if node.move_edit {
                rev_move_edit = true;
            }

            // tag edits after the tag was created
            if node.is_tag_path && !node.local_path.is_empty() && !node.tag_add {
                if let Some(tag) = node.tag.clone() {
                    analysis
                        .edited_tags
                        .entry(tag)
                        .and_modify(|(_, last)| *last = (*last).max(rev_no))
                        .or_insert((rev_no, rev_no));
                }
            }

            let node = &model.nodes[node_i];
            if let Some(merged) = gather_mergeinfo(node, layout, &mut prev_mergeinfo) {
                let newer = rev_merged
                    .as_ref()
                    .is_none_or(|(_, best)| merged.1 > *best);
                if newer && Some(&merged.0) != node.branch.as_ref() {
                    rev_merged = Some(merged);
                }
            }
        }

        let rev = &mut model.revisions[rev_i];
        rev.project = rev_project;
        rev.move_edit = rev_move_edit;
        if let Some((from, merged_rev)) = rev_merged {
            rev.merge = true;
            rev.merged_from = Some(from);
            rev.merged_rev = Some(merged_rev);
        }
    }
}

fn derive_node_flags(
    node: &mut crate::svn::dump::Node,
    exec_paths: &mut FHashSet<Vec<u8>>,
) {
    let at_root = node.local_path.is_empty();

    match node.action {
        NodeAction::Add | NodeAction::Replace => {
            if node.kind == Some(NodeKind::Dir) && at_root {
                if node.is_tag_path && node.tag.is_some() {
                    node.tag_add = true;
                } else if node.branch.as_deref().is_some_and(|b| b != b"master") {
                    node.branch_add = true;
                }
            }
        }
        NodeAction::Delete => {
            if at_root {
                if node.is_tag_path && node.tag.is_some() {
                    node.tag_delete = true;
                } else if node.branch.as_deref().is_some_and(|b| b != b"master") {
                    node.branch_delete = true;
                }
            }
            exec_paths.remove(&node.path);
        }
        NodeAction::Change => {}
    }

    // file copied and edited in the same commit: the copy source revision
    // is the node's own revision and new content arrives with it
    if node.kind == Some(NodeKind::File)
        && node.text.is_some()
        && node
            .copy_from
            .as_ref()
            .is_some_and(|cf| cf.rev == node.rev_no)
    {
        node.move_edit = true;
    }

    if node.kind == Some(NodeKind::File) && node.props.is_some() {
        let was_exec = exec_paths.contains(&node.path);
        if node.exec != was_exec {
            node.exec_change = true;
            if node.exec {
                exec_paths.insert(node.path.clone());
            } else {
                exec_paths.remove(&node.path);
            }
        }
    } else if node.kind == Some(NodeKind::File) && node.exec {
        exec_paths.insert(node.path.clone());
    }
}

// Returns (source branch, highest merged revision) when this node's
// svn:mergeinfo grew relative to its previous value.
fn gather_mergeinfo(
    node: &crate::svn::dump::Node,
    layout: &Layout,
    prev_mergeinfo: &mut FHashMap<Vec<u8>, FHashMap<Vec<u8>, u32>>,
) -> Option<(Vec<u8>, u32)> {
    let raw = node.props.as_ref()?.get(b"svn:mergeinfo".as_slice())?;
    let parsed = parse_mergeinfo(raw, layout);

    let prev = prev_mergeinfo.entry(node.path.clone()).or_default();
    let mut best: Option<(Vec<u8>, u32)> = None;
    for (source_branch, &max_rev) in &parsed {
        let grew = prev.get(source_branch).is_none_or(|&old| max_rev > old);
        if grew && best.as_ref().is_none_or(|(_, b)| max_rev > *b) {
            best = Some((source_branch.clone(), max_rev));
        }
    }
    *prev = parsed;
    best
}

// svn:mergeinfo lines look like "/project/branches/x:1-100,205*".
fn parse_mergeinfo(raw: &[u8], layout: &Layout) -> FHashMap<Vec<u8>, u32> {
    let mut out: FHashMap<Vec<u8>, u32> = FHashMap::default();
    for line in raw.split(|&b| b == b'\n') {
        let Some(colon) = line.iter().rposition(|&b| b == b':') else {
            continue;
        };
        let source_path = &line[..colon];
        let class = layout.classify(source_path);
        let Some(source_branch) = class.branch.or(class.tag) else {
            continue;
        };

        let mut max_rev = 0u32;
        for range in line[(colon + 1)..].split(|&b| b == b',') {
            let range = range.strip_suffix(b"*").unwrap_or(range);
            let high = match range.iter().position(|&b| b == b'-') {
                Some(dash) => &range[(dash + 1)..],
                None => range,
            };
            if let Some(rev) = std::str::from_utf8(high)
                .ok()
                .and_then(|s| s.trim().parse::<u32>().ok())
            {
                max_rev = max_rev.max(rev);
            }
        }
        if max_rev != 0 {
            let entry = out.entry(source_branch).or_insert(0);
            *entry = (*entry).max(max_rev);
        }
    }
    out
}
