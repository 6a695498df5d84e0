use std::io::{Read as _, Seek as _, Write as _};
use std::path::{Path, PathBuf};

use crate::convert::analyze::Analysis;
use crate::convert::{ConversionContext, ConvertError};
use crate::git::legalize_branch_name;
use crate::make_meta::GitMetaMaker;
use crate::svn::classify::Layout;
use crate::svn::dump::{expand_crlf, Node, NodeAction, NodeKind, SvnModel};
use crate::FHashSet;

/// Per-revision fast-import command files, in application order. The
/// `from`/`merge` lines inside still hold revision placeholders; the driver
/// resolves them against the hash cache before applying.
pub(crate) struct RevFiles {
    pub(crate) branch_delete: Option<PathBuf>,
    pub(crate) branch_reset: Option<PathBuf>,
    pub(crate) move_only: Option<PathBuf>,
    pub(crate) main: Option<PathBuf>,
    pub(crate) tag: Option<PathBuf>,
    pub(crate) tag_after_commit: Option<PathBuf>,
    /// Legalized names of branches created this revision.
    pub(crate) new_branches: Vec<Vec<u8>>,
    /// A branch or tag disappears; snapshot the permanent repo first.
    pub(crate) needs_backup: bool,
    /// Legalized branch the main commit lands on, for verification.
    pub(crate) commit_branch: Option<String>,
}

impl RevFiles {
    fn empty() -> Self {
        Self {
            branch_delete: None,
            branch_reset: None,
            move_only: None,
            main: None,
            tag: None,
            tag_after_commit: None,
            new_branches: Vec::new(),
            needs_backup: false,
            commit_branch: None,
        }
    }
}

pub(crate) struct Exporter<'a> {
    model: &'a SvnModel,
    analysis: &'a Analysis,
    layout: &'a Layout,
    meta_maker: &'a GitMetaMaker<'a>,
    dump_file: std::fs::File,
    out_dir: PathBuf,
    exec_paths: FHashSet<Vec<u8>>,
}

impl<'a> Exporter<'a> {
    pub(crate) fn new(
        model: &'a SvnModel,
        analysis: &'a Analysis,
        layout: &'a Layout,
        meta_maker: &'a GitMetaMaker<'a>,
        dump_path: &Path,
        out_dir: PathBuf,
    ) -> Result<Self, ConvertError> {
        std::fs::create_dir_all(&out_dir)?;
        let dump_file = std::fs::OpenOptions::new().read(true).open(dump_path)?;
        Ok(Self {
            model,
            analysis,
            layout,
            meta_maker,
            dump_file,
            out_dir,
            exec_paths: FHashSet::default(),
        })
    }

    /// Generates the command files for one revision. `ctx` is read for
    /// content identities but not advanced; call [`Self::update_state`]
    /// afterwards.
    pub(crate) fn export_rev(
        &mut self,
        rev_i: usize,
        ctx: &ConversionContext,
    ) -> Result<RevFiles, ConvertError> {
        let rev = &self.model.revisions[rev_i];
        let rev_no = rev.rev_no;
        let mut files = RevFiles::empty();

        let active: Vec<&Node> = self
            .model
            .rev_nodes(rev)
            .iter()
            .filter(|n| !n.skip)
            .collect();
        if active.is_empty() {
            return Ok(files);
        }

        let commit_branch = self
            .analysis
            .branch_overrides
            .get(&rev_no)
            .cloned()
            .or_else(|| {
                active
                    .iter()
                    .find_map(|n| self.effective_branch(n))
            });

        let commit_meta = self.meta_maker.make_commit_meta(
            self.model.uuid.as_ref(),
            rev_no,
            commit_branch.as_deref(),
            rev.author.as_deref(),
            rev.date.as_deref(),
            rev.log.as_deref(),
        );
        let commit_meta = commit_meta.map_err(ConvertError::Configuration)?;
        let log_oneline = String::from_utf8_lossy(rev.log.as_deref().unwrap_or_default())
            .lines()
            .next()
            .unwrap_or_default()
            .to_string();

        let mut resets =
            self.export_branch_ops(rev_no, &active, &commit_meta.author_line, &log_oneline, &mut files)?;
        resets.extend(self.export_tags(rev, &active, &mut files)?);

        let Some(commit_branch) = commit_branch else {
            return Ok(files);
        };
        let legal_branch = legalize_branch_name(&commit_branch);
        files.commit_branch = Some(legal_branch.clone());

        if rev.move_edit {
            self.export_move_only(rev_no, &active, &legal_branch, &commit_meta, ctx, &mut files)?;
        }

        let tree_ops = self.tree_ops(rev_no, &active, &commit_branch, ctx)?;
        let has_non_commit_output = files.branch_delete.is_some()
            || files.branch_reset.is_some()
            || files.tag.is_some();
        if tree_ops.is_empty() {
            if let Some((_, from_arg)) =
                resets.iter().find(|(legal, _)| *legal == legal_branch)
            {
                // a created branch still gets an empty commit carrying the
                // revision's author, date and message
                let mut out = Vec::new();
                out.extend_from_slice(format!("commit refs/heads/{legal_branch}\n").as_bytes());
                out.extend_from_slice(format!("mark :{rev_no}\n").as_bytes());
                out.extend_from_slice(
                    format!("committer {}\n", commit_meta.author_line).as_bytes(),
                );
                write_data(&mut out, commit_meta.message.as_bytes());
                out.extend_from_slice(format!("from {from_arg}\n\n").as_bytes());
                let main_path = self.out_dir.join(format!("{rev_no}-commit.fi"));
                std::fs::write(&main_path, &out)?;
                files.main = Some(main_path);
                return Ok(files);
            }
            if has_non_commit_output {
                // delete or tag-object bookkeeping only, no content commit
                return Ok(files);
            }
        }

        let mut out = Vec::new();
        self.write_blobs(&active, &mut out)?;

        out.extend_from_slice(format!("commit refs/heads/{legal_branch}\n").as_bytes());
        out.extend_from_slice(format!("mark :{rev_no}\n").as_bytes());
        out.extend_from_slice(format!("committer {}\n", commit_meta.author_line).as_bytes());
        write_data(&mut out, commit_meta.message.as_bytes());
        if rev.move_edit {
            // the preliminary move commit is already the branch tip
            out.extend_from_slice(format!("from {rev_no}\n").as_bytes());
        } else {
            out.extend_from_slice(format!("from {}\n", rev_no - 1).as_bytes());
        }
        if let (true, Some(merged_from), Some(merged_rev)) =
            (rev.merge, rev.merged_from.as_deref(), rev.merged_rev)
        {
            out.extend_from_slice(
                format!(
                    "merge {},{merged_rev}\n",
                    legalize_branch_name(merged_from),
                )
                .as_bytes(),
            );
        }
        for op in &tree_ops {
            out.extend_from_slice(op);
        }
        out.push(b'\n');

        let main_path = self.out_dir.join(format!("{rev_no}-commit.fi"));
        std::fs::write(&main_path, &out)?;
        files.main = Some(main_path);

        Ok(files)
    }

    // Branch of record for a node: its branch, or its tag when that tag is
    // converted as a branch for the duration of its edits.
    fn effective_branch(&self, node: &Node) -> Option<Vec<u8>> {
        if let Some(branch) = &node.branch {
            return Some(branch.clone());
        }
        let tag = node.tag.as_ref()?;
        if self.analysis.edited_tags.contains_key(tag)
            && (node.tag_add || !node.local_path.is_empty())
        {
            return Some(tag.clone());
        }
        None
    }

    // Returns the (branch, reset target) pairs of branches created this
    // revision, for the empty placeholder commit.
    fn export_branch_ops(
        &self,
        rev_no: u32,
        active: &[&Node],
        author_line: &str,
        log_oneline: &str,
        files: &mut RevFiles,
    ) -> Result<Vec<(String, String)>, ConvertError> {
        let mut created = Vec::new();
        let mut resets = Vec::new();
        let mut deletes = Vec::new();

        for node in active {
            if node.branch_add {
                let Some(branch) = &node.branch else { continue };
                let legal = legalize_branch_name(branch);
                files.new_branches.push(legal.clone().into_bytes());
                if let Some(copy_from) = &node.copy_from {
                    // the reset aims at the source's tip as of the copy rev
                    let src = self.source_branch_of(copy_from)?;
                    let from_arg =
                        format!("{},{}", legalize_branch_name(&src), copy_from.rev);
                    resets.extend_from_slice(
                        format!("reset refs/heads/{legal}\nfrom {from_arg}\n\n").as_bytes(),
                    );
                    created.push((legal, from_arg));
                }
            } else if node.branch_delete || node.tag_delete {
                // refs are never deleted; an empty commit records the event
                let Some(name) = node.branch.as_ref().or(node.tag.as_ref()) else {
                    continue;
                };
                let legal = legalize_branch_name(name);
                files.needs_backup = true;
                let msg = format!("{log_oneline} (svn branch delete)");
                deletes.extend_from_slice(
                    format!("commit refs/heads/{legal}\ncommitter {author_line}\n").as_bytes(),
                );
                write_data(&mut deletes, msg.as_bytes());
                deletes.extend_from_slice(format!("from {}\n\n", rev_no - 1).as_bytes());
            }
        }

        if !resets.is_empty() {
            let path = self.out_dir.join(format!("{rev_no}-b.fi"));
            std::fs::write(&path, &resets)?;
            files.branch_reset = Some(path);
        }
        if !deletes.is_empty() {
            let path = self.out_dir.join(format!("{rev_no}-bdelete.fi"));
            std::fs::write(&path, &deletes)?;
            files.branch_delete = Some(path);
        }
        Ok(created)
    }

    fn export_tags(
        &self,
        rev: &crate::svn::dump::Revision,
        active: &[&Node],
        files: &mut RevFiles,
    ) -> Result<Vec<(String, String)>, ConvertError> {
        let rev_no = rev.rev_no;
        let mut created = Vec::new();
        let mut tag_out = Vec::new();
        let mut after_out = Vec::new();

        for node in active {
            if node.tag_add {
                let Some(tag) = &node.tag else { continue };
                let legal = legalize_branch_name(tag);
                let edited = self.analysis.edited_tags.contains_key(tag);
                let Some(copy_from) = &node.copy_from else {
                    tracing::warn!(
                        "r{rev_no}: tag \"{}\" added without copy source",
                        tag.escape_ascii(),
                    );
                    continue;
                };
                let src = self.source_branch_of(copy_from)?;

                if edited {
                    // keep the tag as a branch until its last edit
                    files.new_branches.push(legal.clone().into_bytes());
                    let from_arg =
                        format!("{},{}", legalize_branch_name(&src), copy_from.rev);
                    let mut resets = Vec::new();
                    resets.extend_from_slice(
                        format!("reset refs/heads/{legal}\nfrom {from_arg}\n\n").as_bytes(),
                    );
                    created.push((legal.clone(), from_arg));
                    match &files.branch_reset {
                        Some(path) => {
                            let mut f =
                                std::fs::OpenOptions::new().append(true).open(path)?;
                            f.write_all(&resets)?;
                        }
                        None => {
                            let path = self.out_dir.join(format!("{rev_no}-b.fi"));
                            std::fs::write(&path, &resets)?;
                            files.branch_reset = Some(path);
                        }
                    }
                } else {
                    let tag_meta = self
                        .meta_maker
                        .make_tag_meta(
                            self.model.uuid.as_ref(),
                            rev_no,
                            tag,
                            rev.author.as_deref(),
                            rev.date.as_deref(),
                            rev.log.as_deref(),
                        )
                        .map_err(ConvertError::Configuration)?;
                    tag_out.extend_from_slice(format!("tag {legal}\n").as_bytes());
                    tag_out.extend_from_slice(
                        format!("from {},{}\n", legalize_branch_name(&src), copy_from.rev)
                            .as_bytes(),
                    );
                    tag_out
                        .extend_from_slice(format!("tagger {}\n", tag_meta.tagger_line).as_bytes());
                    write_data(&mut tag_out, tag_meta.message.as_bytes());
                    tag_out.push(b'\n');
                }
            }
        }

        // edited tags whose last edit happens now become annotated tags,
        // in name order so regeneration is byte-identical
        let mut closing: Vec<&Vec<u8>> = self
            .analysis
            .edited_tags
            .iter()
            .filter(|&(_, &(_, last_edit))| last_edit == rev_no)
            .map(|(tag, _)| tag)
            .collect();
        closing.sort();
        for tag in closing {
            let legal = legalize_branch_name(tag);
            let tag_meta = self
                .meta_maker
                .make_tag_meta(
                    self.model.uuid.as_ref(),
                    rev_no,
                    tag,
                    rev.author.as_deref(),
                    rev.date.as_deref(),
                    rev.log.as_deref(),
                )
                .map_err(ConvertError::Configuration)?;
            after_out.extend_from_slice(format!("tag {legal}\n").as_bytes());
            after_out.extend_from_slice(format!("from {legal},{rev_no}\n").as_bytes());
            after_out.extend_from_slice(format!("tagger {}\n", tag_meta.tagger_line).as_bytes());
            write_data(&mut after_out, tag_meta.message.as_bytes());
            after_out.push(b'\n');
        }

        if !tag_out.is_empty() {
            let path = self.out_dir.join(format!("{rev_no}-tag.fi"));
            std::fs::write(&path, &tag_out)?;
            files.tag = Some(path);
        }
        if !after_out.is_empty() {
            let path = self.out_dir.join(format!("{rev_no}-tagaftercommit.fi"));
            std::fs::write(&path, &after_out)?;
            files.tag_after_commit = Some(path);
        }
        Ok(created)
    }

    fn export_move_only(
        &mut self,
        rev_no: u32,
        active: &[&Node],
        legal_branch: &str,
        commit_meta: &crate::make_meta::GitCommitMeta,
        ctx: &ConversionContext,
        files: &mut RevFiles,
    ) -> Result<(), ConvertError> {
        let mut ops = Vec::new();
        for node in active {
            if !node.move_edit {
                continue;
            }
            let Some(copy_from) = &node.copy_from else { continue };
            let src_local = self.local_of(&copy_from.path);
            let src_sha1 = node
                .text_copy_source_sha1
                .as_deref()
                .map(|s| s.to_vec())
                .or_else(|| ctx.current_sha1.get(&copy_from.path).cloned())
                .and_then(|svn_sha1| ctx.svn_sha1_to_git.get(&svn_sha1).copied())
                .ok_or_else(|| ConvertError::UnresolvedReference {
                    rev: rev_no,
                    path: node.path.clone(),
                    detail: format!(
                        "no content id for move source \"{}\"@{}",
                        copy_from.path.escape_ascii(),
                        copy_from.rev,
                    ),
                })?;
            let mode = self.mode_of(node);
            ops.push(format!("D {}\n", quote_path(&src_local)).into_bytes());
            ops.push(
                format!(
                    "M {mode} {src_sha1} {}\n",
                    quote_path(&node.local_path),
                )
                .into_bytes(),
            );
        }
        if ops.is_empty() {
            return Ok(());
        }

        let mut out = Vec::new();
        out.extend_from_slice(format!("commit refs/heads/{legal_branch}\n").as_bytes());
        out.extend_from_slice(format!("committer {}\n", commit_meta.author_line).as_bytes());
        let msg = format!(
            "{} (preliminary file move commit)",
            commit_meta.message.trim_end(),
        );
        write_data(&mut out, msg.as_bytes());
        out.extend_from_slice(format!("from {}\n", rev_no - 1).as_bytes());
        for op in &ops {
            out.extend_from_slice(op);
        }
        out.push(b'\n');

        let path = self.out_dir.join(format!("{rev_no}-mvonly.fi"));
        std::fs::write(&path, &out)?;
        files.move_only = Some(path);
        Ok(())
    }

    fn tree_ops(
        &mut self,
        rev_no: u32,
        active: &[&Node],
        commit_branch: &[u8],
        ctx: &ConversionContext,
    ) -> Result<Vec<Vec<u8>>, ConvertError> {
        let mut ops = Vec::new();
        let mut deferred_deletes = Vec::new();

        // deletes are deferred past the adds when the deleted path also
        // serves as a copy source this revision
        let copy_sources: FHashSet<&[u8]> = active
            .iter()
            .filter_map(|n| n.copy_from.as_ref().map(|cf| cf.path.as_slice()))
            .collect();

        for node in active {
            if self.effective_branch(node).as_deref() != Some(commit_branch) {
                continue;
            }
            if node.branch_add
                || node.branch_delete
                || node.tag_add
                || node.tag_delete
                || node.move_edit && node.text.is_none()
            {
                continue;
            }
            if node.local_path.is_empty() && node.kind == Some(NodeKind::Dir) {
                continue;
            }

            match node.action {
                NodeAction::Delete => {
                    if node.move_edit {
                        continue;
                    }
                    let op = format!("D {}\n", quote_path(&node.local_path)).into_bytes();
                    if copy_sources.contains(node.path.as_slice()) {
                        deferred_deletes.push(op);
                    } else {
                        ops.push(op);
                    }
                }
                NodeAction::Add | NodeAction::Change | NodeAction::Replace => {
                    match node.kind {
                        Some(NodeKind::File) | None => {
                            if node.text.is_none()
                                && node.copy_from.is_none()
                                && !node.exec_change
                            {
                                // property-only change with no git counterpart
                                continue;
                            }
                            let sha1 = self.resolve_file_sha(rev_no, node, ctx)?;
                            let mode = self.mode_of(node);
                            ops.push(
                                format!(
                                    "M {mode} {sha1} {}\n",
                                    quote_path(&node.local_path),
                                )
                                .into_bytes(),
                            );
                        }
                        Some(NodeKind::Dir) => {
                            let Some(copy_from) = &node.copy_from else {
                                continue;
                            };
                            if node.action == NodeAction::Replace {
                                ops.push(
                                    format!("D {}\n", quote_path(&node.local_path)).into_bytes(),
                                );
                            }
                            if node.stale_copy {
                                self.expand_stale_copy(rev_no, node, copy_from, ctx, &mut ops)?;
                            } else {
                                let src_local = self.local_of(&copy_from.path);
                                ops.push(
                                    format!(
                                        "C {} {}\n",
                                        quote_path(&src_local),
                                        quote_path(&node.local_path),
                                    )
                                    .into_bytes(),
                                );
                            }
                        }
                    }
                }
            }
        }

        ops.extend(deferred_deletes);
        Ok(ops)
    }

    // Historical directory copy: emit one M line per file the source held
    // at the copy revision.
    fn expand_stale_copy(
        &self,
        rev_no: u32,
        node: &Node,
        copy_from: &crate::svn::dump::NodeCopyFrom,
        ctx: &ConversionContext,
        ops: &mut Vec<Vec<u8>>,
    ) -> Result<(), ConvertError> {
        let state = self
            .analysis
            .tracker
            .files_under(&copy_from.path, copy_from.rev);
        if state.is_empty() {
            tracing::warn!(
                "r{rev_no}: historical copy source \"{}\"@{} is empty",
                copy_from.path.escape_ascii(),
                copy_from.rev,
            );
        }
        for (src_path, src_node_i) in state {
            let src_node = &self.model.nodes[src_node_i];
            if src_node.kind == Some(NodeKind::Dir) {
                continue;
            }
            let suffix = &src_path[copy_from.path.len()..];
            let mut dst_local = node.local_path.clone();
            dst_local.extend_from_slice(suffix);

            let sha1 = src_node
                .text
                .as_ref()
                .map(|t| t.git_sha1)
                .or_else(|| {
                    src_node
                        .text_sha1()
                        .and_then(|svn_sha1| ctx.svn_sha1_to_git.get(svn_sha1).copied())
                })
                .ok_or_else(|| ConvertError::UnresolvedReference {
                    rev: rev_no,
                    path: src_path.clone(),
                    detail: format!(
                        "no content id for historical copy from \"{}\"@{}",
                        copy_from.path.escape_ascii(),
                        copy_from.rev,
                    ),
                })?;
            let mode = if src_node.exec { "100755" } else { "100644" };
            ops.push(format!("M {mode} {sha1} {}\n", quote_path(&dst_local)).into_bytes());
        }
        Ok(())
    }

    // Content id resolution for a file node: its own text, then its copy
    // source, then its own previous content, then the trunk file of the
    // same local path. Exhausting the chain is fatal.
    fn resolve_file_sha(
        &self,
        rev_no: u32,
        node: &Node,
        ctx: &ConversionContext,
    ) -> Result<gix_hash::ObjectId, ConvertError> {
        if let Some(text) = &node.text {
            return Ok(text.git_sha1);
        }

        if let Some(svn_sha1) = node.text_copy_source_sha1.as_deref() {
            if let Some(id) = ctx.svn_sha1_to_git.get(svn_sha1) {
                return Ok(*id);
            }
        }

        if let Some(copy_from) = &node.copy_from {
            if let Some(svn_sha1) = ctx.current_sha1.get(&copy_from.path) {
                if let Some(id) = ctx.svn_sha1_to_git.get(svn_sha1) {
                    return Ok(*id);
                }
            }
        }

        if let Some(svn_sha1) = ctx.current_sha1.get(&node.path) {
            if let Some(id) = ctx.svn_sha1_to_git.get(svn_sha1) {
                return Ok(*id);
            }
        }

        if let Some(project) = &node.project {
            let mut trunk_path = project.clone();
            trunk_path.extend_from_slice(b"/trunk/");
            trunk_path.extend_from_slice(&node.local_path);
            if let Some(svn_sha1) = ctx.current_sha1.get(&trunk_path) {
                if let Some(id) = ctx.svn_sha1_to_git.get(svn_sha1) {
                    return Ok(*id);
                }
            }
        }

        Err(ConvertError::UnresolvedReference {
            rev: rev_no,
            path: node.path.clone(),
            detail: format!(
                "action {:?}, copyfrom {:?}, no content identity on any fallback",
                node.action, node.copy_from,
            ),
        })
    }

    fn mode_of(&self, node: &Node) -> &'static str {
        let exec = if node.props.is_some() {
            node.exec
        } else {
            self.exec_paths.contains(&node.path)
        };
        if exec { "100755" } else { "100644" }
    }

    fn local_of(&self, path: &[u8]) -> Vec<u8> {
        self.layout.classify(path).local_path
    }

    fn source_branch_of(
        &self,
        copy_from: &crate::svn::dump::NodeCopyFrom,
    ) -> Result<Vec<u8>, ConvertError> {
        let class = self.layout.classify(&copy_from.path);
        class.branch.or(class.tag).ok_or_else(|| {
            ConvertError::UnresolvedReference {
                rev: copy_from.rev,
                path: copy_from.path.clone(),
                detail: "copy source is not on any branch or tag".into(),
            }
        })
    }

    fn write_blobs(&mut self, active: &[&Node], out: &mut Vec<u8>) -> Result<(), ConvertError> {
        for node in active {
            let Some(text) = &node.text else { continue };
            let len_usize = usize::try_from(text.len).map_err(|_| {
                std::io::Error::from(std::io::ErrorKind::InvalidData)
            })?;
            let mut data = vec![0; len_usize];
            self.dump_file.seek(std::io::SeekFrom::Start(text.offset))?;
            self.dump_file.read_exact(&mut data)?;
            let data = if node.crlf_content {
                expand_crlf(&data).into_owned()
            } else {
                data
            };
            out.extend_from_slice(b"blob\n");
            write_data(out, &data);
        }
        Ok(())
    }

    /// Advances the rolling path-content map past one revision. Also called
    /// for skipped and already-converted revisions so resume sees the same
    /// state a fresh run would.
    pub(crate) fn update_state(&mut self, rev_i: usize, ctx: &mut ConversionContext) {
        let rev = &self.model.revisions[rev_i];
        for node in self.model.rev_nodes(rev) {
            match node.action {
                NodeAction::Delete => {
                    ctx.current_sha1.remove(&node.path);
                    remove_subtree(&mut ctx.current_sha1, &node.path);
                    self.exec_paths.remove(&node.path);
                }
                NodeAction::Add | NodeAction::Change | NodeAction::Replace => match node.kind {
                    Some(NodeKind::File) | None => {
                        let sha1 = node
                            .text
                            .as_ref()
                            .and_then(|t| t.sha1.clone())
                            .or_else(|| node.text_copy_source_sha1.clone())
                            .or_else(|| {
                                node.copy_from
                                    .as_ref()
                                    .and_then(|cf| ctx.current_sha1.get(&cf.path).cloned())
                            });
                        if let Some(sha1) = sha1 {
                            ctx.current_sha1.insert(node.path.clone(), sha1);
                        }
                        if node.props.is_some() {
                            if node.exec {
                                self.exec_paths.insert(node.path.clone());
                            } else {
                                self.exec_paths.remove(&node.path);
                            }
                        }
                    }
                    Some(NodeKind::Dir) => {
                        if node.action == NodeAction::Replace {
                            remove_subtree(&mut ctx.current_sha1, &node.path);
                        }
                        if let Some(copy_from) = &node.copy_from {
                            let mut prefix = copy_from.path.clone();
                            prefix.push(b'/');
                            let copied: Vec<(Vec<u8>, Vec<u8>)> = ctx
                                .current_sha1
                                .iter()
                                .filter(|(path, _)| path.starts_with(&prefix))
                                .map(|(path, sha1)| {
                                    let mut dst = node.path.clone();
                                    dst.extend_from_slice(&path[copy_from.path.len()..]);
                                    (dst, sha1.clone())
                                })
                                .collect();
                            for (dst, sha1) in copied {
                                ctx.current_sha1.insert(dst, sha1);
                            }
                        }
                    }
                },
            }
        }
    }

}

/// Full-tree commit regenerated from a live checkout: `deleteall` followed
/// by every file inline. Used when a generated commit fails to apply.
pub(crate) fn write_tree_from_checkout(
    out_dir: &Path,
    rev_no: u32,
    legal_branch: &str,
    author_line: &str,
    message: &str,
    checkout_dir: &Path,
) -> Result<PathBuf, ConvertError> {
    let mut out = Vec::new();
    out.extend_from_slice(format!("commit refs/heads/{legal_branch}\n").as_bytes());
    out.extend_from_slice(format!("committer {author_line}\n").as_bytes());
    write_data(&mut out, message.as_bytes());
    out.extend_from_slice(b"deleteall\n");

    let mut stack = vec![checkout_dir.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let mut entries: Vec<_> = std::fs::read_dir(&dir)?.collect::<Result<_, _>>()?;
        entries.sort_by_key(std::fs::DirEntry::file_name);
        for entry in entries {
            let name = entry.file_name();
            if name == ".svn" || name == ".git" {
                continue;
            }
            let path = entry.path();
            let meta = entry.metadata()?;
            if meta.is_dir() {
                stack.push(path);
            } else if meta.is_file() {
                let rel = path
                    .strip_prefix(checkout_dir)
                    .map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidData))?;
                let rel = rel.to_string_lossy();
                let mode = file_mode(&meta);
                let data = std::fs::read(&path)?;
                out.extend_from_slice(
                    format!("M {mode} inline {}\n", quote_path(rel.as_bytes())).as_bytes(),
                );
                write_data(&mut out, &data);
            }
        }
    }
    out.push(b'\n');

    let path = out_dir.join(format!("{rev_no}-tree.fi"));
    std::fs::write(&path, &out)?;
    Ok(path)
}

#[cfg(unix)]
fn file_mode(meta: &std::fs::Metadata) -> &'static str {
    use std::os::unix::fs::PermissionsExt as _;
    if meta.permissions().mode() & 0o111 != 0 {
        "100755"
    } else {
        "100644"
    }
}

#[cfg(not(unix))]
fn file_mode(_meta: &std::fs::Metadata) -> &'static str {
    "100644"
}

fn write_data(out: &mut Vec<u8>, data: &[u8]) {
    out.extend_from_slice(format!("data {}\n", data.len()).as_bytes());
    out.extend_from_slice(data);
    out.push(b'\n');
}

fn remove_subtree(map: &mut crate::FHashMap<Vec<u8>, Vec<u8>>, dir: &[u8]) {
    let mut prefix = dir.to_vec();
    prefix.push(b'/');
    map.retain(|path, _| !path.starts_with(&prefix));
}

// fast-import quoting: paths with specials go in C-style quotes.
pub(crate) fn quote_path(path: &[u8]) -> String {
    let needs_quotes = path
        .iter()
        .any(|&b| b == b'"' || b == b'\\' || b == b'\n' || b == b' ');
    if !needs_quotes {
        return String::from_utf8_lossy(path).into_owned();
    }
    let mut out = String::from("\"");
    for &b in path {
        match b {
            b'"' => out.push_str("\\\""),
            b'\\' => out.push_str("\\\\"),
            b'\n' => out.push_str("\\n"),
            _ => out.push(b as char),
        }
    }
    out.push('"');
    out
}

#[cfg(test)]
mod tests {
    use super::{quote_path, Exporter};
    use crate::convert::{analyze, ConversionContext};
    use crate::make_meta::GitMetaMaker;
    use crate::params_file::ConvParams;
    use crate::svn::classify::Layout;
    use crate::svn::dump::{load, SvnModel};
    use crate::user_map::UserMap;

    fn layout() -> Layout {
        Layout::new([b"proj".to_vec()], [], [])
    }

    fn params() -> ConvParams {
        toml::from_str(r#"project = "proj""#).unwrap()
    }

    fn user_map() -> UserMap {
        let src: &[u8] = b"";
        UserMap::parse(&mut { src }).ok().unwrap()
    }

    fn meta_maker(user_map: &UserMap) -> GitMetaMaker<'_> {
        GitMetaMaker::new(
            user_map,
            true,
            r#"{{ svn_author or "nobody" }} <{{ svn_author or "nobody" }}@svn>"#,
            "{{ svn_log }}\n",
            "{{ svn_log }}\n",
        )
        .unwrap()
    }

    fn dump_bytes(body: &str) -> Vec<u8> {
        let mut dump = b"SVN-fs-dump-format-version: 2\n\n".to_vec();
        dump.extend_from_slice(body.as_bytes());
        dump
    }

    fn rev_header(rev: u32) -> String {
        format!("Revision-number: {rev}\nContent-length: 0\n\n")
    }

    fn file_add(path: &str, content: &str) -> String {
        format!(
            "Node-path: {path}\nNode-kind: file\nNode-action: add\n\
             Text-content-sha1: {sha:0>40}\n\
             Text-content-length: {len}\nContent-length: {len}\n\n{content}\n",
            sha = content.len(),
            len = content.len(),
        )
    }

    struct Fixture {
        model: SvnModel,
        dump_path: std::path::PathBuf,
        out_dir: std::path::PathBuf,
        ctx: ConversionContext,
        analysis: analyze::Analysis,
        layout: Layout,
    }

    fn fixture(name: &str, body: &str) -> Fixture {
        fixture_with_params(name, body, &params())
    }

    fn fixture_with_params(name: &str, body: &str, params: &ConvParams) -> Fixture {
        let dir = std::env::temp_dir().join(format!(
            "svnfexport-export-test-{name}-{}",
            std::process::id(),
        ));
        std::fs::create_dir_all(&dir).unwrap();
        let dump_path = dir.join("dump");
        std::fs::write(&dump_path, dump_bytes(body)).unwrap();

        let mut model = load(dump_bytes(body).as_slice()).unwrap();
        let layout = layout();
        let mut ctx = ConversionContext::new();
        let analysis = analyze::run(&mut model, &layout, params, &mut ctx);

        Fixture {
            model,
            dump_path,
            out_dir: dir.join("fi"),
            ctx,
            analysis,
            layout,
        }
    }

    fn read_str(path: &std::path::Path) -> String {
        String::from_utf8(std::fs::read(path).unwrap()).unwrap()
    }

    #[test]
    fn plain_file_add_commit() {
        let body = format!("{}{}", rev_header(1), file_add("proj/trunk/a.txt", "a\n"));
        let mut fx = fixture("plain", &body);
        let user_map = user_map();
        let maker = meta_maker(&user_map);
        let mut exporter = Exporter::new(
            &fx.model,
            &fx.analysis,
            &fx.layout,
            &maker,
            &fx.dump_path,
            fx.out_dir.clone(),
        )
        .unwrap();

        let files = exporter.export_rev(0, &fx.ctx).unwrap();
        let main = read_str(files.main.as_deref().unwrap());
        assert!(main.starts_with("blob\ndata 2\na\n"));
        assert!(main.contains("commit refs/heads/master\n"));
        assert!(main.contains("mark :1\n"));
        assert!(main.contains("from 0\n"));
        assert!(main.contains("M 100644 "));
        assert!(main.contains(" a.txt\n"));
        assert_eq!(files.commit_branch.as_deref(), Some("master"));
        assert!(files.branch_reset.is_none());
        assert!(files.tag.is_none());

        exporter.update_state(0, &mut fx.ctx);
        assert!(fx.ctx.current_sha1.contains_key(b"proj/trunk/a.txt".as_slice()));
    }

    #[test]
    fn branch_copy_emits_reset() {
        let body = format!(
            "{}{}{}{}",
            rev_header(1),
            file_add("proj/trunk/a.txt", "a\n"),
            rev_header(2),
            "Node-path: proj/branches/x\nNode-kind: dir\nNode-action: add\n\
             Node-copyfrom-rev: 1\nNode-copyfrom-path: proj/trunk\n\n",
        );
        let mut fx = fixture("reset", &body);
        let user_map = user_map();
        let maker = meta_maker(&user_map);
        let mut exporter = Exporter::new(
            &fx.model,
            &fx.analysis,
            &fx.layout,
            &maker,
            &fx.dump_path,
            fx.out_dir.clone(),
        )
        .unwrap();

        exporter.export_rev(0, &fx.ctx).unwrap();
        exporter.update_state(0, &mut fx.ctx);
        let files = exporter.export_rev(1, &fx.ctx).unwrap();

        let resets = read_str(files.branch_reset.as_deref().unwrap());
        assert_eq!(resets, "reset refs/heads/x\nfrom master,1\n\n");
        assert_eq!(files.new_branches, vec![b"x".to_vec()]);
        // the placeholder commit records the revision's author and message
        let main = read_str(files.main.as_deref().unwrap());
        assert!(main.contains("commit refs/heads/x\n"));
        assert!(main.contains("from master,1\n"));
        assert!(main.contains("committer "));
        assert!(!main.contains("\nM "));
        assert!(!main.contains("\nD "));
    }

    #[test]
    fn branch_override_redirects_nodes_with_the_commit() {
        let body = format!(
            "{}{}{}{}",
            rev_header(1),
            file_add("proj/trunk/a.txt", "a\n"),
            rev_header(2),
            file_add("proj/trunk/b.txt", "b\n"),
        );
        let params: ConvParams = toml::from_str(
            "project = \"proj\"\nbranch-overrides = [{ rev = 2, branch = \"gsoc\" }]\n",
        )
        .unwrap();
        let mut fx = fixture_with_params("override", &body, &params);
        let user_map = user_map();
        let maker = meta_maker(&user_map);
        let mut exporter = Exporter::new(
            &fx.model,
            &fx.analysis,
            &fx.layout,
            &maker,
            &fx.dump_path,
            fx.out_dir.clone(),
        )
        .unwrap();

        exporter.export_rev(0, &fx.ctx).unwrap();
        exporter.update_state(0, &mut fx.ctx);
        let files = exporter.export_rev(1, &fx.ctx).unwrap();

        assert_eq!(files.commit_branch.as_deref(), Some("gsoc"));
        let main = read_str(files.main.as_deref().unwrap());
        assert!(main.contains("commit refs/heads/gsoc\n"));
        // the override carries the revision's content, not an empty tree
        assert!(main.contains("M 100644"));
        assert!(main.contains("b.txt"));
    }

    #[test]
    fn regenerating_a_revision_reproduces_identical_bytes() {
        let body = format!(
            "{}{}{}{}{}{}{}{}{}",
            rev_header(1),
            file_add("proj/trunk/a.txt", "a\n"),
            rev_header(2),
            "Node-path: proj/tags/zz\nNode-kind: dir\nNode-action: add\n\
             Node-copyfrom-rev: 1\nNode-copyfrom-path: proj/trunk\n\n",
            rev_header(3),
            "Node-path: proj/tags/aa\nNode-kind: dir\nNode-action: add\n\
             Node-copyfrom-rev: 1\nNode-copyfrom-path: proj/trunk\n\n",
            rev_header(4),
            file_add("proj/tags/zz/f.txt", "f\n"),
            file_add("proj/tags/aa/g.txt", "g\n"),
        );
        let run = |name: &str| -> (String, String) {
            let mut fx = fixture(name, &body);
            let user_map = user_map();
            let maker = meta_maker(&user_map);
            let mut exporter = Exporter::new(
                &fx.model,
                &fx.analysis,
                &fx.layout,
                &maker,
                &fx.dump_path,
                fx.out_dir.clone(),
            )
            .unwrap();
            let mut last = None;
            for i in 0..4 {
                let files = exporter.export_rev(i, &fx.ctx).unwrap();
                exporter.update_state(i, &mut fx.ctx);
                last = Some(files);
            }
            let files = last.unwrap();
            (
                read_str(files.main.as_deref().unwrap()),
                read_str(files.tag_after_commit.as_deref().unwrap()),
            )
        };

        let (main_a, tags_a) = run("regen-a");
        let (main_b, tags_b) = run("regen-b");
        assert_eq!(main_a, main_b);
        assert_eq!(tags_a, tags_b);
        // closing tags come out in name order
        assert!(tags_a.find("tag aa\n").unwrap() < tags_a.find("tag zz\n").unwrap());
    }

    #[test]
    fn unseen_copy_source_falls_back_to_the_trunk_file() {
        let body = format!(
            "{}{}{}{}",
            rev_header(1),
            file_add("proj/trunk/f.txt", "x\n"),
            rev_header(2),
            "Node-path: proj/branches/b/f.txt\nNode-kind: file\nNode-action: add\n\
             Node-copyfrom-rev: 1\nNode-copyfrom-path: attic/f.txt\n\n",
        );
        let mut fx = fixture("trunk-fallback", &body);
        let user_map = user_map();
        let maker = meta_maker(&user_map);
        let mut exporter = Exporter::new(
            &fx.model,
            &fx.analysis,
            &fx.layout,
            &maker,
            &fx.dump_path,
            fx.out_dir.clone(),
        )
        .unwrap();

        exporter.export_rev(0, &fx.ctx).unwrap();
        exporter.update_state(0, &mut fx.ctx);
        let files = exporter.export_rev(1, &fx.ctx).unwrap();

        let main = read_str(files.main.as_deref().unwrap());
        let expected = format!("M 100644 {} f.txt\n", git_blob_id(b"x\n"));
        assert!(main.contains(&expected));
    }

    #[test]
    fn tag_copy_emits_tag_object() {
        let body = format!(
            "{}{}{}{}",
            rev_header(1),
            file_add("proj/trunk/a.txt", "a\n"),
            rev_header(2),
            "Node-path: proj/tags/t1\nNode-kind: dir\nNode-action: add\n\
             Node-copyfrom-rev: 1\nNode-copyfrom-path: proj/trunk\n\n",
        );
        let mut fx = fixture("tag", &body);
        let user_map = user_map();
        let maker = meta_maker(&user_map);
        let mut exporter = Exporter::new(
            &fx.model,
            &fx.analysis,
            &fx.layout,
            &maker,
            &fx.dump_path,
            fx.out_dir.clone(),
        )
        .unwrap();

        exporter.export_rev(0, &fx.ctx).unwrap();
        exporter.update_state(0, &mut fx.ctx);
        let files = exporter.export_rev(1, &fx.ctx).unwrap();

        let tag = read_str(files.tag.as_deref().unwrap());
        assert!(tag.starts_with("tag t1\nfrom master,1\ntagger "));
        assert!(files.main.is_none());
        assert!(files.tag_after_commit.is_none());
    }

    #[test]
    fn edited_tag_creation_gets_a_placeholder_commit() {
        let body = format!(
            "{}{}{}{}{}{}",
            rev_header(1),
            file_add("proj/trunk/a.txt", "a\n"),
            rev_header(2),
            "Node-path: proj/tags/t1\nNode-kind: dir\nNode-action: add\n\
             Node-copyfrom-rev: 1\nNode-copyfrom-path: proj/trunk\n\n",
            rev_header(3),
            file_add("proj/tags/t1/fix.txt", "f\n"),
        );
        let mut fx = fixture("editedtag", &body);
        let user_map = user_map();
        let maker = meta_maker(&user_map);
        let mut exporter = Exporter::new(
            &fx.model,
            &fx.analysis,
            &fx.layout,
            &maker,
            &fx.dump_path,
            fx.out_dir.clone(),
        )
        .unwrap();

        exporter.export_rev(0, &fx.ctx).unwrap();
        exporter.update_state(0, &mut fx.ctx);
        let files = exporter.export_rev(1, &fx.ctx).unwrap();

        let resets = read_str(files.branch_reset.as_deref().unwrap());
        assert_eq!(resets, "reset refs/heads/t1\nfrom master,1\n\n");
        // the creation revision's author and message survive on an empty commit
        let main = read_str(files.main.as_deref().unwrap());
        assert!(main.contains("commit refs/heads/t1\n"));
        assert!(main.contains("from master,1\n"));
        assert!(!main.contains("\nM "));
    }

    #[test]
    fn tag_delete_becomes_an_empty_commit() {
        let body = format!(
            "{}{}{}{}{}{}",
            rev_header(1),
            file_add("proj/trunk/a.txt", "a\n"),
            rev_header(2),
            "Node-path: proj/tags/t1\nNode-kind: dir\nNode-action: add\n\
             Node-copyfrom-rev: 1\nNode-copyfrom-path: proj/trunk\n\n",
            rev_header(3),
            "Node-path: proj/tags/t1\nNode-action: delete\n\n",
        );
        let mut fx = fixture("tagdelete", &body);
        let user_map = user_map();
        let maker = meta_maker(&user_map);
        let mut exporter = Exporter::new(
            &fx.model,
            &fx.analysis,
            &fx.layout,
            &maker,
            &fx.dump_path,
            fx.out_dir.clone(),
        )
        .unwrap();

        for rev_i in 0..2 {
            exporter.export_rev(rev_i, &fx.ctx).unwrap();
            exporter.update_state(rev_i, &mut fx.ctx);
        }
        let files = exporter.export_rev(2, &fx.ctx).unwrap();

        // the tag ref survives; an empty commit records the delete
        let deletes = read_str(files.branch_delete.as_deref().unwrap());
        assert!(deletes.starts_with("commit refs/heads/t1\n"));
        assert!(deletes.contains("(svn branch delete)"));
        assert!(deletes.contains("from 2\n"));
        assert!(files.needs_backup);
        assert!(files.main.is_none());
    }

    #[test]
    fn move_with_edit_splits_into_two_commits() {
        let body = format!(
            "{}{}{}{}{}",
            rev_header(1),
            file_add("proj/trunk/old.txt", "x\n"),
            rev_header(2),
            "Node-path: proj/trunk/new.txt\nNode-kind: file\nNode-action: add\n\
             Node-copyfrom-rev: 2\nNode-copyfrom-path: proj/trunk/old.txt\n\
             Text-content-length: 3\nContent-length: 3\n\nxy\n\n",
            "Node-path: proj/trunk/old.txt\nNode-action: delete\n\n",
        );
        let mut fx = fixture("move", &body);
        let user_map = user_map();
        let maker = meta_maker(&user_map);
        let mut exporter = Exporter::new(
            &fx.model,
            &fx.analysis,
            &fx.layout,
            &maker,
            &fx.dump_path,
            fx.out_dir.clone(),
        )
        .unwrap();

        exporter.export_rev(0, &fx.ctx).unwrap();
        exporter.update_state(0, &mut fx.ctx);
        let files = exporter.export_rev(1, &fx.ctx).unwrap();

        let mvonly = read_str(files.move_only.as_deref().unwrap());
        assert!(mvonly.contains("D old.txt\n"));
        assert!(mvonly.contains(" new.txt\n"));
        assert!(mvonly.contains("(preliminary file move commit)"));
        assert!(mvonly.contains("from 1\n"));

        // the content commit chains onto the preliminary move commit
        let main = read_str(files.main.as_deref().unwrap());
        assert!(main.contains("from 2\n"));
        assert!(main.contains(" new.txt\n"));
    }

    #[test]
    fn stale_copy_expands_to_historical_files() {
        let body = format!(
            "{}{}{}{}{}{}",
            rev_header(1),
            file_add("proj/trunk/d/a.txt", "one\n"),
            rev_header(2),
            file_add("proj/trunk/d/a.txt", "two\n"),
            rev_header(3),
            "Node-path: proj/trunk/e\nNode-kind: dir\nNode-action: add\n\
             Node-copyfrom-rev: 1\nNode-copyfrom-path: proj/trunk/d\n\n",
        );
        let mut fx = fixture("stale", &body);
        let user_map = user_map();
        let maker = meta_maker(&user_map);
        let mut exporter = Exporter::new(
            &fx.model,
            &fx.analysis,
            &fx.layout,
            &maker,
            &fx.dump_path,
            fx.out_dir.clone(),
        )
        .unwrap();

        for rev_i in 0..2 {
            exporter.export_rev(rev_i, &fx.ctx).unwrap();
            exporter.update_state(rev_i, &mut fx.ctx);
        }
        let files = exporter.export_rev(2, &fx.ctx).unwrap();

        let rev1_sha = fx.model.nodes[0].text.as_ref().unwrap().git_sha1;
        let rev2_sha = fx.model.nodes[1].text.as_ref().unwrap().git_sha1;
        let main = read_str(files.main.as_deref().unwrap());
        assert!(main.contains(&format!("M 100644 {rev1_sha} e/a.txt\n")));
        assert!(!main.contains(&rev2_sha.to_string()));
    }

    #[test]
    fn fresh_copy_stays_a_tree_copy() {
        let body = format!(
            "{}{}{}{}",
            rev_header(1),
            file_add("proj/trunk/d/a.txt", "one\n"),
            rev_header(2),
            "Node-path: proj/trunk/e\nNode-kind: dir\nNode-action: add\n\
             Node-copyfrom-rev: 1\nNode-copyfrom-path: proj/trunk/d\n\n",
        );
        let mut fx = fixture("fresh", &body);
        let user_map = user_map();
        let maker = meta_maker(&user_map);
        let mut exporter = Exporter::new(
            &fx.model,
            &fx.analysis,
            &fx.layout,
            &maker,
            &fx.dump_path,
            fx.out_dir.clone(),
        )
        .unwrap();

        exporter.export_rev(0, &fx.ctx).unwrap();
        exporter.update_state(0, &mut fx.ctx);
        let files = exporter.export_rev(1, &fx.ctx).unwrap();

        let main = read_str(files.main.as_deref().unwrap());
        assert!(main.contains("C d e\n"));
    }

    #[test]
    fn quoting() {
        assert_eq!(quote_path(b"src/main.c"), "src/main.c");
        assert_eq!(quote_path(b"has space.txt"), "\"has space.txt\"");
        assert_eq!(quote_path(b"qu\"ote"), "\"qu\\\"ote\"");
    }

    fn git_blob_id(data: &[u8]) -> String {
        gix_object::compute_hash(gix_hash::Kind::Sha1, gix_object::Kind::Blob, data)
            .unwrap()
            .to_string()
    }
}
