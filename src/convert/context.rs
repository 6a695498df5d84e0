use std::io::{BufRead as _, Write as _};
use std::path::Path;

use crate::FHashMap;

const CURRENT_REV_FILE: &str = "current_rev.txt";
const BRANCHES_FILE: &str = "branches.txt";
const REV_GSHA1S_FILE: &str = "rev_gsha1s.txt";

/// All cross-revision conversion state.
///
/// `svn_sha1_to_git` and `rev_to_gsha1` are insert-at-most-once; a second
/// insert with a different value is a bug upstream and only logged, the
/// first value wins. `current_sha1` is the rolling path content map and is
/// rebuilt by replay on resume, so it is not persisted.
pub(crate) struct ConversionContext {
    pub(crate) svn_sha1_to_git: FHashMap<Vec<u8>, gix_hash::ObjectId>,
    pub(crate) current_sha1: FHashMap<Vec<u8>, Vec<u8>>,
    pub(crate) rev_to_gsha1: FHashMap<(Vec<u8>, u32), String>,
    pub(crate) branches: Vec<Vec<u8>>,
    /// Last revision fully applied to the permanent repository.
    pub(crate) checkpoint: u32,
}

impl ConversionContext {
    pub(crate) fn new() -> Self {
        Self {
            svn_sha1_to_git: FHashMap::default(),
            current_sha1: FHashMap::default(),
            rev_to_gsha1: FHashMap::default(),
            branches: Vec::new(),
            checkpoint: 0,
        }
    }

    pub(crate) fn record_blob_id(&mut self, svn_sha1: &[u8], git_sha1: gix_hash::ObjectId) {
        match self.svn_sha1_to_git.entry(svn_sha1.to_vec()) {
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(git_sha1);
            }
            std::collections::hash_map::Entry::Occupied(entry) => {
                if *entry.get() != git_sha1 {
                    tracing::warn!(
                        "conflicting git ids for svn sha1 {}: {} vs {}",
                        svn_sha1.escape_ascii(),
                        entry.get(),
                        git_sha1,
                    );
                }
            }
        }
    }

    pub(crate) fn record_rev_sha1(&mut self, branch: &[u8], rev: u32, gsha1: &str) {
        match self.rev_to_gsha1.entry((branch.to_vec(), rev)) {
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(gsha1.to_string());
            }
            std::collections::hash_map::Entry::Occupied(entry) => {
                if entry.get() != gsha1 {
                    tracing::warn!(
                        "conflicting tips for ({}, r{rev}): {} vs {gsha1}",
                        branch.escape_ascii(),
                        entry.get(),
                    );
                }
            }
        }
    }

    pub(crate) fn rev_sha1(&self, branch: &[u8], rev: u32) -> Option<&str> {
        self.rev_to_gsha1
            .get(&(branch.to_vec(), rev))
            .map(String::as_str)
    }

    pub(crate) fn add_branch(&mut self, branch: &[u8]) {
        if !self.branches.iter().any(|b| b == branch) {
            self.branches.push(branch.to_vec());
        }
    }

    /// Loads persisted state from `dest`, or starts fresh when absent.
    /// Cached tips newer than the checkpoint are discarded; they belong to
    /// revisions whose permanent apply never completed.
    pub(crate) fn load(dest: &Path) -> Result<Self, std::io::Error> {
        let mut ctx = Self::new();

        let current_rev_path = dest.join(CURRENT_REV_FILE);
        match std::fs::read_to_string(&current_rev_path) {
            Ok(raw) => {
                ctx.checkpoint = raw.trim().parse().map_err(|_| {
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("bad checkpoint in {current_rev_path:?}: {raw:?}"),
                    )
                })?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ctx),
            Err(e) => return Err(e),
        }

        if let Ok(raw) = std::fs::read(dest.join(BRANCHES_FILE)) {
            for line in raw.split(|&b| b == b'\n') {
                if !line.is_empty() {
                    ctx.branches.push(line.to_vec());
                }
            }
        }

        let rev_gsha1s_path = dest.join(REV_GSHA1S_FILE);
        match std::fs::OpenOptions::new().read(true).open(&rev_gsha1s_path) {
            Ok(file) => {
                let mut reader = std::io::BufReader::new(file);
                let mut line = String::new();
                let mut line_i = 0usize;
                loop {
                    line.clear();
                    if reader.read_line(&mut line)? == 0 {
                        break;
                    }
                    let trimmed = line.trim_end();
                    if trimmed.is_empty() {
                        continue;
                    }
                    let parsed = (|| {
                        let (branch, rest) = trimmed.split_once(',')?;
                        let (rev, gsha1) = rest.split_once(',')?;
                        let rev: u32 = rev.parse().ok()?;
                        Some((branch.as_bytes().to_vec(), rev, gsha1.to_string()))
                    })();
                    let Some((branch, rev, gsha1)) = parsed else {
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::InvalidData,
                            format!("bad line {} in {rev_gsha1s_path:?}", line_i + 1),
                        ));
                    };
                    if rev <= ctx.checkpoint {
                        ctx.rev_to_gsha1.insert((branch, rev), gsha1);
                    }
                    line_i += 1;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        Ok(ctx)
    }

    pub(crate) fn save(&self, dest: &Path) -> Result<(), std::io::Error> {
        let mut branches = Vec::new();
        for branch in &self.branches {
            branches.extend_from_slice(branch);
            branches.push(b'\n');
        }
        write_atomic(&dest.join(BRANCHES_FILE), &branches)?;

        let mut entries: Vec<_> = self.rev_to_gsha1.iter().collect();
        entries.sort_by(|a, b| (a.0 .1, &a.0 .0).cmp(&(b.0 .1, &b.0 .0)));
        let mut rev_gsha1s = Vec::new();
        for ((branch, rev), gsha1) in entries {
            rev_gsha1s.extend_from_slice(branch);
            rev_gsha1s.extend_from_slice(format!(",{rev},{gsha1}\n").as_bytes());
        }
        write_atomic(&dest.join(REV_GSHA1S_FILE), &rev_gsha1s)?;

        // the checkpoint goes last so a crash mid-save leaves a resumable state
        write_atomic(
            &dest.join(CURRENT_REV_FILE),
            format!("{}\n", self.checkpoint).as_bytes(),
        )?;

        Ok(())
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<(), std::io::Error> {
    let mut tmp_path = path.to_path_buf();
    tmp_path.as_mut_os_string().push(".tmp");
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp_path)?;
    file.write_all(data)?;
    file.sync_all()?;
    drop(file);
    std::fs::rename(&tmp_path, path)
}

#[cfg(test)]
mod tests {
    use super::ConversionContext;

    #[test]
    fn blob_id_insert_once() {
        let mut ctx = ConversionContext::new();
        let id_a: gix_hash::ObjectId = "ce013625030ba8dba906f756967f9e9ca394464a"
            .parse()
            .unwrap();
        let id_b: gix_hash::ObjectId = "0000000000000000000000000000000000000000"
            .parse()
            .unwrap();

        ctx.record_blob_id(b"f572d396fae9206628714fb2ce00f72e94f2258f", id_a);
        // second insert with a different id is ignored
        ctx.record_blob_id(b"f572d396fae9206628714fb2ce00f72e94f2258f", id_b);
        assert_eq!(
            ctx.svn_sha1_to_git
                .get(b"f572d396fae9206628714fb2ce00f72e94f2258f".as_slice()),
            Some(&id_a),
        );
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = std::env::temp_dir().join(format!(
            "svnfexport-ctx-test-{}",
            std::process::id(),
        ));
        std::fs::create_dir_all(&dir).unwrap();

        let mut ctx = ConversionContext::new();
        ctx.add_branch(b"master");
        ctx.add_branch(b"stable");
        ctx.add_branch(b"master");
        ctx.record_rev_sha1(b"master", 1, "1111111111111111111111111111111111111111");
        ctx.record_rev_sha1(b"master", 2, "2222222222222222222222222222222222222222");
        ctx.record_rev_sha1(b"stable", 2, "3333333333333333333333333333333333333333");
        ctx.checkpoint = 1;
        ctx.save(&dir).unwrap();

        let loaded = ConversionContext::load(&dir).unwrap();
        assert_eq!(loaded.checkpoint, 1);
        assert_eq!(loaded.branches, vec![b"master".to_vec(), b"stable".to_vec()]);
        // tips beyond the checkpoint are discarded on load
        assert_eq!(
            loaded.rev_sha1(b"master", 1),
            Some("1111111111111111111111111111111111111111"),
        );
        assert_eq!(loaded.rev_sha1(b"master", 2), None);
        assert_eq!(loaded.rev_sha1(b"stable", 2), None);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
