use std::path::{Path, PathBuf};

use crate::convert::analyze::Analysis;
use crate::convert::export::{Exporter, RevFiles};
use crate::convert::{ConversionContext, ConvertError};
use crate::git::{legalize_branch_name, RepoTools, ToolError};
use crate::make_meta::GitMetaMaker;
use crate::params_file::ConvParams;
use crate::svn::classify::Layout;
use crate::svn::dump::SvnModel;

pub(crate) struct DriverArgs<'a> {
    pub(crate) model: &'a SvnModel,
    pub(crate) analysis: &'a Analysis,
    pub(crate) layout: &'a Layout,
    pub(crate) params: &'a ConvParams,
    pub(crate) meta_maker: &'a GitMetaMaker<'a>,
    pub(crate) tools: &'a dyn RepoTools,
    pub(crate) dest: &'a Path,
    pub(crate) dump_path: &'a Path,
    pub(crate) svn_repo: Option<&'a str>,
    pub(crate) verify_every: u32,
    pub(crate) ctx: &'a mut ConversionContext,
}

/// Runs the conversion revision by revision. Each revision is generated,
/// applied to the working repository, optionally verified against a live
/// SVN checkout, applied to the permanent repository, and checkpointed, so
/// an interrupted run resumes at the revision after the last checkpoint.
pub(crate) fn run(args: DriverArgs<'_>) -> Result<(), ConvertError> {
    let working = args.dest.join("git_working");
    let permanent = args.dest.join("git");

    if !permanent.join(".git").exists() {
        args.tools.init_repo(&permanent).map_err(ConvertError::Tool)?;
    }
    if !working.join(".git").exists() {
        args.tools.init_repo(&working).map_err(ConvertError::Tool)?;
    }

    let mut exporter = Exporter::new(
        args.model,
        args.analysis,
        args.layout,
        args.meta_maker,
        args.dump_path,
        args.dest.join("fi"),
    )?;

    let mut driver = Driver {
        model: args.model,
        analysis: args.analysis,
        params: args.params,
        meta_maker: args.meta_maker,
        tools: args.tools,
        dest: args.dest,
        working,
        permanent,
        svn_repo: args.svn_repo,
        verify_every: args.verify_every,
    };

    for rev_i in 0..args.model.revisions.len() {
        let rev_no = args.model.revisions[rev_i].rev_no;

        if rev_no <= args.ctx.checkpoint {
            // already converted in an earlier run
            exporter.update_state(rev_i, args.ctx);
            continue;
        }

        if args.analysis.skip_revs.contains(&rev_no) {
            tracing::info!("r{rev_no}: skipped by configuration");
            exporter.update_state(rev_i, args.ctx);
            driver.record_branch_tips(rev_no, args.ctx)?;
            driver.checkpoint(rev_no, args.ctx)?;
            continue;
        }

        driver.convert_rev(rev_i, &mut exporter, args.ctx)?;
        driver.checkpoint(rev_no, args.ctx)?;

        if driver.params.gc_every != 0 && rev_no % driver.params.gc_every == 0 {
            driver.tools.gc(&driver.working).map_err(ConvertError::Tool)?;
            driver
                .tools
                .gc(&driver.permanent)
                .map_err(ConvertError::Tool)?;
        }
    }

    Ok(())
}

struct Driver<'a> {
    model: &'a SvnModel,
    analysis: &'a Analysis,
    params: &'a ConvParams,
    meta_maker: &'a GitMetaMaker<'a>,
    tools: &'a dyn RepoTools,
    dest: &'a Path,
    working: PathBuf,
    permanent: PathBuf,
    svn_repo: Option<&'a str>,
    verify_every: u32,
}

impl Driver<'_> {
    fn convert_rev(
        &mut self,
        rev_i: usize,
        exporter: &mut Exporter<'_>,
        ctx: &mut ConversionContext,
    ) -> Result<(), ConvertError> {
        let rev = &self.model.revisions[rev_i];
        let rev_no = rev.rev_no;
        tracing::info!("r{rev_no}: converting");

        let files = exporter.export_rev(rev_i, ctx)?;

        if files.needs_backup {
            self.backup_permanent(rev_no)?;
        }

        // resolve placeholders once; working and permanent see identical
        // commands, so they hold identical objects. The tagaftercommit
        // file waits until this revision's tips are recorded, so its tag
        // points at the commit produced here.
        let mut resolved = Vec::new();
        for raw_path in [
            &files.branch_delete,
            &files.branch_reset,
            &files.move_only,
            &files.main,
            &files.tag,
        ]
        .into_iter()
        .flatten()
        {
            let raw = std::fs::read(raw_path)?;
            let content = resolve_placeholders(&raw, ctx, self.tools, &self.working)?;
            let path = raw_path.with_extension("resolved.fi");
            std::fs::write(&path, &content)?;
            let is_main = Some(raw_path) == files.main.as_ref();
            resolved.push((path, is_main));
        }

        for (path, is_main) in &mut resolved {
            let applied = self.tools.apply_fast_import(&self.working, path);
            if let Err(error) = applied {
                if *is_main {
                    // the permanent repo must replay the recovered commit too
                    *path = self.recover_main(rev_i, &files, path)?;
                } else {
                    return Err(ConvertError::Apply { rev: rev_no, error });
                }
            }
        }

        if self.due_for_verification(rev_no) {
            self.verify_rev(rev_i, &files)?;
        }

        for (path, _) in &resolved {
            self.tools
                .apply_fast_import(&self.permanent, path)
                .map_err(|error| ConvertError::Apply { rev: rev_no, error })?;
        }

        self.record_branch_tips(rev_no, ctx)?;

        if let Some(raw_path) = &files.tag_after_commit {
            let raw = std::fs::read(raw_path)?;
            let content = resolve_placeholders(&raw, ctx, self.tools, &self.working)?;
            let path = raw_path.with_extension("resolved.fi");
            std::fs::write(&path, &content)?;
            for repo in [&self.working, &self.permanent] {
                self.tools
                    .apply_fast_import(repo, &path)
                    .map_err(|error| ConvertError::Apply { rev: rev_no, error })?;
            }
        }

        if self.params.keep_notes && files.main.is_some() {
            if let Some(branch) = &files.commit_branch {
                self.attach_note(rev_i, branch)?;
            }
        }

        exporter.update_state(rev_i, ctx);
        Ok(())
    }

    // One retry: rebuild the whole tree from a live SVN checkout of this
    // revision and commit that instead. A second failure is fatal and
    // leaves the rejected commands next to the destination for inspection.
    fn recover_main(
        &self,
        rev_i: usize,
        files: &RevFiles,
        resolved_main: &Path,
    ) -> Result<PathBuf, ConvertError> {
        let rev = &self.model.revisions[rev_i];
        let rev_no = rev.rev_no;

        let fail = |error: ToolError| -> ConvertError {
            let failed = self.dest.join(format!("failed-{rev_no}.fi"));
            if let Err(e) = std::fs::rename(resolved_main, &failed) {
                tracing::warn!("could not preserve rejected commands: {e}");
            } else {
                tracing::error!("r{rev_no}: rejected commands kept at {failed:?}");
            }
            ConvertError::Apply { rev: rev_no, error }
        };

        let (Some(svn_repo), Some(branch)) = (self.svn_repo, &files.commit_branch) else {
            tracing::error!("r{rev_no}: commit failed and no SVN URL to recover from");
            return Err(fail(ToolError::BadOutput { arg0: "git".into() }));
        };
        tracing::warn!("r{rev_no}: commit failed, regenerating the tree from SVN");

        let checkout_dir = self.dest.join(format!("recover-r{rev_no}"));
        if checkout_dir.exists() {
            std::fs::remove_dir_all(&checkout_dir)?;
        }
        let url = self.svn_branch_url(svn_repo, rev_i, branch);
        self.tools
            .svn_checkout(&url, rev_no, &checkout_dir)
            .map_err(ConvertError::Tool)?;

        let meta = self
            .meta_maker
            .make_commit_meta(
                self.model.uuid.as_ref(),
                rev_no,
                Some(branch.as_bytes()),
                rev.author.as_deref(),
                rev.date.as_deref(),
                rev.log.as_deref(),
            )
            .map_err(ConvertError::Configuration)?;

        let tree_fi = crate::convert::export::write_tree_from_checkout(
            &self.dest.join("fi"),
            rev_no,
            branch,
            &meta.author_line,
            &meta.message,
            &checkout_dir,
        )?;

        let result = self.tools.apply_fast_import(&self.working, &tree_fi);
        let _ = std::fs::remove_dir_all(&checkout_dir);
        result.map_err(fail)?;
        Ok(tree_fi)
    }

    fn due_for_verification(&self, rev_no: u32) -> bool {
        self.verify_every != 0 && rev_no % self.verify_every == 0 && self.svn_repo.is_some()
    }

    fn verify_rev(&self, rev_i: usize, files: &RevFiles) -> Result<(), ConvertError> {
        let rev_no = self.model.revisions[rev_i].rev_no;
        let (Some(svn_repo), Some(branch)) = (self.svn_repo, &files.commit_branch) else {
            return Ok(());
        };
        tracing::info!("r{rev_no}: verifying against SVN");

        self.tools
            .checkout(&self.working, branch)
            .map_err(ConvertError::Tool)?;

        let checkout_dir = self.dest.join(format!("verify-r{rev_no}"));
        if checkout_dir.exists() {
            std::fs::remove_dir_all(&checkout_dir)?;
        }
        let url = self.svn_branch_url(svn_repo, rev_i, branch);
        self.tools
            .svn_checkout(&url, rev_no, &checkout_dir)
            .map_err(ConvertError::Tool)?;

        let identical = self
            .tools
            .trees_identical(&self.working, &checkout_dir)
            .map_err(ConvertError::Tool)?;
        let _ = std::fs::remove_dir_all(&checkout_dir);
        if identical {
            Ok(())
        } else {
            Err(ConvertError::Verification { rev: rev_no })
        }
    }

    fn svn_branch_url(&self, svn_repo: &str, rev_i: usize, branch: &str) -> String {
        let project = self.model.revisions[rev_i]
            .project
            .as_deref()
            .unwrap_or(self.params.project.as_bytes());
        let project = String::from_utf8_lossy(project);
        if branch == "master" {
            format!("{svn_repo}/{project}/trunk")
        } else if let Some(tag) = self
            .analysis
            .edited_tags
            .keys()
            .find(|t| legalize_branch_name(t) == branch)
        {
            // edited tags live on a branch ref until they close, but the
            // SVN side keeps them under tags/
            format!("{svn_repo}/{project}/tags/{}", String::from_utf8_lossy(tag))
        } else {
            format!("{svn_repo}/{project}/branches/{branch}")
        }
    }

    fn record_branch_tips(
        &self,
        rev_no: u32,
        ctx: &mut ConversionContext,
    ) -> Result<(), ConvertError> {
        let refs = self
            .tools
            .show_refs(&self.permanent)
            .map_err(ConvertError::Tool)?;
        for (id, refname) in refs {
            if let Some(branch) = refname.strip_prefix("refs/heads/") {
                ctx.record_rev_sha1(branch.as_bytes(), rev_no, &id);
                ctx.add_branch(branch.as_bytes());
            }
        }
        Ok(())
    }

    fn attach_note(&self, rev_i: usize, branch: &str) -> Result<(), ConvertError> {
        let rev = &self.model.revisions[rev_i];
        let rev_no = rev.rev_no;

        let commit = self
            .tools
            .rev_parse(&self.permanent, &format!("refs/heads/{branch}"))
            .map_err(ConvertError::Tool)?;
        let Some(commit) = commit else {
            tracing::warn!("r{rev_no}: no commit on {branch} to annotate");
            return Ok(());
        };
        let notes_tip = self
            .tools
            .rev_parse(&self.permanent, "refs/notes/commits")
            .map_err(ConvertError::Tool)?;

        let meta = self
            .meta_maker
            .make_commit_meta(
                self.model.uuid.as_ref(),
                rev_no,
                Some(branch.as_bytes()),
                rev.author.as_deref(),
                rev.date.as_deref(),
                rev.log.as_deref(),
            )
            .map_err(ConvertError::Configuration)?;

        let mut note = format!("svn:revision:{rev_no}\nsvn:branch:{branch}\n");
        if let Some(author) = rev.author.as_deref() {
            note.push_str(&format!("svn:account:{}\n", author.escape_ascii()));
        }

        let mut out = Vec::new();
        out.extend_from_slice(b"commit refs/notes/commits\n");
        out.extend_from_slice(format!("committer {}\n", meta.author_line).as_bytes());
        let msg = format!("Note added for r{rev_no}\n");
        out.extend_from_slice(format!("data {}\n{msg}", msg.len()).as_bytes());
        if let Some(tip) = notes_tip {
            out.extend_from_slice(format!("from {tip}\n").as_bytes());
        }
        out.extend_from_slice(format!("N inline {commit}\n").as_bytes());
        out.extend_from_slice(format!("data {}\n{note}\n", note.len()).as_bytes());

        let path = self.dest.join("fi").join(format!("{rev_no}-note.fi"));
        std::fs::write(&path, &out)?;
        for repo in [&self.working, &self.permanent] {
            self.tools
                .apply_fast_import(repo, &path)
                .map_err(|error| ConvertError::Apply { rev: rev_no, error })?;
        }
        Ok(())
    }

    // Branch and tag deletes are destructive; the permanent repo gets a
    // one-time directory snapshot before the first delete past a revision.
    fn backup_permanent(&self, rev_no: u32) -> Result<(), ConvertError> {
        let backups = self.dest.join("backups");
        std::fs::create_dir_all(&backups)?;
        let target = backups.join(format!("git-r{}", rev_no.saturating_sub(1)));
        if target.exists() {
            return Ok(());
        }
        tracing::info!("r{rev_no}: snapshotting the permanent repository");
        copy_dir_recursive(&self.permanent, &target)?;
        Ok(())
    }

    fn checkpoint(&self, rev_no: u32, ctx: &mut ConversionContext) -> Result<(), ConvertError> {
        ctx.checkpoint = rev_no;
        ctx.save(self.dest)?;
        Ok(())
    }
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<(), std::io::Error> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        let to = dst.join(entry.file_name());
        if meta.is_dir() {
            copy_dir_recursive(&entry.path(), &to)?;
        } else if meta.is_file() {
            std::fs::copy(entry.path(), &to)?;
        }
    }
    Ok(())
}

/// Replaces revision placeholders in `from`/`merge` lines with commit ids.
///
/// `from <branch>,<rev>` and `merge <branch>,<rev>` look up the recorded
/// tip of that branch as of that revision. A bare `from <rev>` refers to
/// the previous commit of the branch the surrounding `commit` line names.
/// An unresolvable `from` is dropped (the first commit of a new root
/// branch has no parent); an unresolvable `merge` is dropped with a
/// warning. `data` payloads pass through untouched.
fn resolve_placeholders(
    raw: &[u8],
    ctx: &ConversionContext,
    tools: &dyn RepoTools,
    working: &Path,
) -> Result<Vec<u8>, ConvertError> {
    let mut out = Vec::with_capacity(raw.len());
    let mut rest = raw;
    let mut current_branch: Option<Vec<u8>> = None;

    while !rest.is_empty() {
        let line_end = rest
            .iter()
            .position(|&b| b == b'\n')
            .map_or(rest.len(), |p| p + 1);
        let (line, tail) = rest.split_at(line_end);
        rest = tail;
        let trimmed = line.strip_suffix(b"\n").unwrap_or(line);

        if let Some(len) = trimmed.strip_prefix(b"data ") {
            out.extend_from_slice(line);
            let len = std::str::from_utf8(len)
                .ok()
                .and_then(|s| s.parse::<usize>().ok())
                .ok_or_else(|| {
                    std::io::Error::from(std::io::ErrorKind::InvalidData)
                })?;
            // payload plus the newline the generator always appends
            let take = (len + 1).min(rest.len());
            out.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            continue;
        }

        if let Some(branch) = trimmed.strip_prefix(b"commit refs/heads/") {
            current_branch = Some(branch.to_vec());
            out.extend_from_slice(line);
            continue;
        }

        if let Some(arg) = trimmed.strip_prefix(b"from ") {
            match resolve_committish(arg, current_branch.as_deref(), ctx, tools, working)? {
                Some(id) => out.extend_from_slice(format!("from {id}\n").as_bytes()),
                None => {
                    tracing::debug!(
                        "dropping parentless \"from {}\"",
                        arg.escape_ascii(),
                    );
                }
            }
            continue;
        }
        if let Some(arg) = trimmed.strip_prefix(b"merge ") {
            match resolve_committish(arg, current_branch.as_deref(), ctx, tools, working)? {
                Some(id) => out.extend_from_slice(format!("merge {id}\n").as_bytes()),
                None => {
                    tracing::warn!(
                        "dropping unresolvable \"merge {}\"",
                        arg.escape_ascii(),
                    );
                }
            }
            continue;
        }

        out.extend_from_slice(line);
    }

    Ok(out)
}

fn resolve_committish(
    arg: &[u8],
    current_branch: Option<&[u8]>,
    ctx: &ConversionContext,
    tools: &dyn RepoTools,
    working: &Path,
) -> Result<Option<String>, ConvertError> {
    let (branch, rev) = match arg.iter().rposition(|&b| b == b',') {
        Some(pos) => (Some(&arg[..pos]), &arg[(pos + 1)..]),
        None => (None, arg),
    };
    let Some(rev) = std::str::from_utf8(rev)
        .ok()
        .and_then(|s| s.parse::<u32>().ok())
    else {
        // already a commit id or another committish
        return Ok(Some(String::from_utf8_lossy(arg).into_owned()));
    };
    let Some(branch) = branch.or(current_branch) else {
        return Ok(None);
    };

    if let Some(id) = ctx.rev_sha1(branch, rev) {
        return Ok(Some(id.to_string()));
    }

    // the branch may not have been recorded at exactly that revision yet
    let best = ctx
        .rev_to_gsha1
        .iter()
        .filter(|((b, r), _)| b == branch && *r <= rev)
        .max_by_key(|((_, r), _)| *r)
        .map(|(_, id)| id.clone());
    if let Some(id) = best {
        return Ok(Some(id));
    }

    let refname = format!("refs/heads/{}", String::from_utf8_lossy(branch));
    tools
        .rev_parse(working, &refname)
        .map_err(ConvertError::Tool)
}
