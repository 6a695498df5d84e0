use std::ffi::OsString;
use std::path::Path;
use std::process::Command;

#[derive(Debug)]
pub(crate) enum ToolError {
    Spawn {
        arg0: OsString,
        error: std::io::Error,
    },
    Failed {
        arg0: OsString,
        exit_code: std::process::ExitStatus,
        stderr: String,
    },
    BadOutput {
        arg0: OsString,
    },
}

impl std::fmt::Display for ToolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Spawn { arg0, error } => {
                write!(f, "failed to spawn {arg0:?}: {error}")
            }
            Self::Failed {
                arg0,
                exit_code,
                stderr,
            } => {
                write!(f, "{arg0:?} finished with {exit_code}: {}", stderr.trim_end())
            }
            Self::BadOutput { arg0 } => write!(f, "unexpected output from {arg0:?}"),
        }
    }
}

/// External `git`/`svn`/`diff` invocations the conversion depends on.
///
/// Everything that touches a repository on disk goes through this trait so
/// the revision state machine can be driven against a fake in tests.
pub(crate) trait RepoTools {
    fn init_repo(&self, repo: &Path) -> Result<(), ToolError>;
    fn apply_fast_import(&self, repo: &Path, fi_file: &Path) -> Result<(), ToolError>;
    /// Resolves a revision expression to a commit id, `None` when unknown.
    fn rev_parse(&self, repo: &Path, rev: &str) -> Result<Option<String>, ToolError>;
    /// All refs of the repository as (id, refname) pairs.
    fn show_refs(&self, repo: &Path) -> Result<Vec<(String, String)>, ToolError>;
    fn checkout(&self, repo: &Path, branch: &str) -> Result<(), ToolError>;
    fn gc(&self, repo: &Path) -> Result<(), ToolError>;
    fn svn_checkout(&self, url: &str, rev: u32, dest: &Path) -> Result<(), ToolError>;
    /// Whether two checked-out trees have identical contents, ignoring
    /// `.git` and `.svn` administrative directories.
    fn trees_identical(&self, a: &Path, b: &Path) -> Result<bool, ToolError>;
}

pub(crate) struct SystemTools;

impl SystemTools {
    fn run(&self, mut cmd: Command) -> Result<Vec<u8>, ToolError> {
        let arg0 = cmd.get_program().to_os_string();
        let output = cmd
            .stdin(std::process::Stdio::null())
            .output()
            .map_err(|e| ToolError::Spawn {
                arg0: arg0.clone(),
                error: e,
            })?;
        if !output.status.success() {
            let e = ToolError::Failed {
                arg0,
                exit_code: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            };
            tracing::error!("{e}");
            return Err(e);
        }
        Ok(output.stdout)
    }
}

impl RepoTools for SystemTools {
    fn init_repo(&self, repo: &Path) -> Result<(), ToolError> {
        let mut cmd = Command::new("git");
        cmd.arg("init").arg("-q").arg(repo);
        self.run(cmd).map(|_| ())
    }

    fn apply_fast_import(&self, repo: &Path, fi_file: &Path) -> Result<(), ToolError> {
        let fi = std::fs::OpenOptions::new()
            .read(true)
            .open(fi_file)
            .map_err(|e| ToolError::Spawn {
                arg0: "git".into(),
                error: e,
            })?;
        let mut cmd = Command::new("git");
        cmd.arg("-C")
            .arg(repo)
            .arg("fast-import")
            .arg("--quiet")
            .arg("--force")
            .stdin(fi);
        let arg0 = cmd.get_program().to_os_string();
        let output = cmd.output().map_err(|e| ToolError::Spawn {
            arg0: arg0.clone(),
            error: e,
        })?;
        if !output.status.success() {
            let e = ToolError::Failed {
                arg0,
                exit_code: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            };
            tracing::error!("fast-import of {fi_file:?} failed: {e}");
            return Err(e);
        }
        Ok(())
    }

    fn rev_parse(&self, repo: &Path, rev: &str) -> Result<Option<String>, ToolError> {
        let mut cmd = Command::new("git");
        cmd.arg("-C")
            .arg(repo)
            .arg("rev-parse")
            .arg("--verify")
            .arg("-q")
            .arg(rev)
            .stdin(std::process::Stdio::null());
        let output = cmd.output().map_err(|e| ToolError::Spawn {
            arg0: "git".into(),
            error: e,
        })?;
        if !output.status.success() {
            return Ok(None);
        }
        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if id.is_empty() {
            return Err(ToolError::BadOutput { arg0: "git".into() });
        }
        Ok(Some(id))
    }

    fn show_refs(&self, repo: &Path) -> Result<Vec<(String, String)>, ToolError> {
        let mut cmd = Command::new("git");
        cmd.arg("-C").arg(repo).arg("show-ref");
        let arg0: OsString = "git".into();
        let output = cmd
            .stdin(std::process::Stdio::null())
            .output()
            .map_err(|e| ToolError::Spawn {
                arg0: arg0.clone(),
                error: e,
            })?;
        // show-ref exits nonzero on an empty repository
        if !output.status.success() {
            return Ok(Vec::new());
        }
        let mut refs = Vec::new();
        for line in String::from_utf8_lossy(&output.stdout).lines() {
            let Some((id, name)) = line.split_once(' ') else {
                return Err(ToolError::BadOutput { arg0 });
            };
            refs.push((id.to_string(), name.to_string()));
        }
        Ok(refs)
    }

    fn checkout(&self, repo: &Path, branch: &str) -> Result<(), ToolError> {
        let mut cmd = Command::new("git");
        cmd.arg("-C").arg(repo).arg("checkout").arg("-q").arg(branch);
        self.run(cmd).map(|_| ())
    }

    fn gc(&self, repo: &Path) -> Result<(), ToolError> {
        let mut cmd = Command::new("git");
        cmd.arg("-C").arg(repo).arg("gc").arg("--quiet");
        self.run(cmd).map(|_| ())
    }

    fn svn_checkout(&self, url: &str, rev: u32, dest: &Path) -> Result<(), ToolError> {
        let mut cmd = Command::new("svn");
        cmd.arg("checkout")
            .arg("-q")
            .arg("-r")
            .arg(rev.to_string())
            .arg(url)
            .arg(dest);
        self.run(cmd).map(|_| ())
    }

    fn trees_identical(&self, a: &Path, b: &Path) -> Result<bool, ToolError> {
        let mut cmd = Command::new("diff");
        cmd.arg("-qr")
            .arg("-x")
            .arg(".git")
            .arg("-x")
            .arg(".svn")
            .arg(a)
            .arg(b)
            .stdin(std::process::Stdio::null());
        let output = cmd.output().map_err(|e| ToolError::Spawn {
            arg0: "diff".into(),
            error: e,
        })?;
        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => {
                tracing::warn!(
                    "trees differ:\n{}",
                    String::from_utf8_lossy(&output.stdout).trim_end(),
                );
                Ok(false)
            }
            _ => {
                let e = ToolError::Failed {
                    arg0: "diff".into(),
                    exit_code: output.status,
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                };
                tracing::error!("{e}");
                Err(e)
            }
        }
    }
}

/// Maps an SVN directory name onto a name `git check-ref-format` accepts.
/// Every byte git rejects becomes an underscore, separators are collapsed,
/// and the result is never empty.
pub(crate) fn legalize_branch_name(raw_name: &[u8]) -> String {
    let raw = String::from_utf8_lossy(raw_name);
    let mut out = String::with_capacity(raw.len());

    for chr in raw.chars() {
        if chr == '/' {
            // collapse duplicate separators and drop a leading one
            if !out.is_empty() && !out.ends_with('/') {
                fix_component_end(&mut out);
                out.push('/');
            }
            continue;
        }
        let banned = chr <= ' '
            || chr >= '~'
            || matches!(chr, '*' | ':' | '?' | '[' | '\\' | ']' | '^' | '{' | '}');
        let misplaced_dot =
            chr == '.' && (out.is_empty() || out.ends_with('/') || out.ends_with('.'));
        let leading_dash = chr == '-' && out.is_empty();
        if banned || misplaced_dot || leading_dash {
            out.push('_');
        } else {
            out.push(chr);
        }
    }

    if out.ends_with('/') {
        out.pop();
    }
    fix_component_end(&mut out);
    if out.is_empty() {
        out.push('_');
    }
    out
}

// Suffixes git refuses at the end of a ref component.
fn fix_component_end(name: &mut String) {
    if name.ends_with(".lock") {
        name.truncate(name.len() - ".lock".len());
        name.push_str("_lock");
    } else if name.ends_with('.') {
        name.pop();
        name.push('_');
    } else if name == "refs" {
        name.push('_');
    }
}

#[cfg(test)]
mod tests {
    use super::legalize_branch_name;

    #[test]
    fn test_legalize_branch_name() {
        assert_eq!(legalize_branch_name(b"stable"), "stable");
        assert_eq!(legalize_branch_name(b"rel 7.12"), "rel_7.12");
        assert_eq!(legalize_branch_name(b"a..b"), "a._b");
        assert_eq!(legalize_branch_name(b"bad.lock"), "bad_lock");
        assert_eq!(legalize_branch_name(b""), "_");
        assert_eq!(legalize_branch_name(b"-lead"), "_lead");
    }
}
