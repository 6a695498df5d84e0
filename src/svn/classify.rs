use crate::{FHashMap, FHashSet};

/// Layout rules mapping repository paths to (project, branch/tag, local path).
pub(crate) struct Layout {
    projects: FHashSet<Vec<u8>>,
    branch_mappings: FHashMap<Vec<u8>, Vec<u8>>,
    tag_mappings: FHashMap<Vec<u8>, Vec<u8>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct PathClass {
    pub(crate) project: Option<Vec<u8>>,
    pub(crate) branch: Option<Vec<u8>>,
    pub(crate) tag: Option<Vec<u8>>,
    pub(crate) local_path: Vec<u8>,
    pub(crate) is_tag: bool,
}

impl Layout {
    pub(crate) fn new(
        projects: impl IntoIterator<Item = Vec<u8>>,
        branch_mappings: impl IntoIterator<Item = (Vec<u8>, Vec<u8>)>,
        tag_mappings: impl IntoIterator<Item = (Vec<u8>, Vec<u8>)>,
    ) -> Self {
        Self {
            projects: projects.into_iter().collect(),
            branch_mappings: branch_mappings.into_iter().collect(),
            tag_mappings: tag_mappings.into_iter().collect(),
        }
    }

    /// Total and deterministic: every input yields a classification, with
    /// `None` fields for paths outside the known layout.
    pub(crate) fn classify(&self, path: &[u8]) -> PathClass {
        let mut rem = path;
        rem = rem.strip_prefix(b"/").unwrap_or(rem);
        rem = rem.strip_suffix(b"/").unwrap_or(rem);

        let (first, rest) = split_first(rem);
        let (project, rem) = if self.projects.contains(first) {
            (Some(first.to_vec()), rest)
        } else {
            (None, rem)
        };

        let (first, rest) = split_first(rem);
        // a conventional layout at the repository root belongs to the
        // implicit "default" project
        let project = match first {
            _ if project.is_some() => project,
            b"trunk" | b"branches" | b"tags" => Some(b"default".to_vec()),
            _ if self.branch_mappings.contains_key(first)
                || self.tag_mappings.contains_key(first) =>
            {
                Some(b"default".to_vec())
            }
            _ => None,
        };
        match first {
            b"trunk" => PathClass {
                project,
                branch: Some(b"master".to_vec()),
                tag: None,
                local_path: rest.to_vec(),
                is_tag: false,
            },
            b"branches" => {
                let (name, local) = split_first(rest);
                if name.is_empty() {
                    // "branches" itself has no branch
                    return PathClass {
                        project,
                        branch: None,
                        tag: None,
                        local_path: Vec::new(),
                        is_tag: false,
                    };
                }
                let name = self
                    .branch_mappings
                    .get(name)
                    .map_or(name, Vec::as_slice)
                    .to_vec();
                PathClass {
                    project,
                    branch: Some(name),
                    tag: None,
                    local_path: local.to_vec(),
                    is_tag: false,
                }
            }
            b"tags" => {
                let (name, local) = split_first(rest);
                if name.is_empty() {
                    return PathClass {
                        project,
                        branch: None,
                        tag: None,
                        local_path: Vec::new(),
                        is_tag: true,
                    };
                }
                let name = self
                    .tag_mappings
                    .get(name)
                    .map_or(name, Vec::as_slice)
                    .to_vec();
                PathClass {
                    project,
                    branch: None,
                    tag: Some(name),
                    local_path: local.to_vec(),
                    is_tag: true,
                }
            }
            _ => {
                // off-convention layouts: the override tables decide
                // whether the segment is a branch or tag container
                if let Some(name) = self.branch_mappings.get(first) {
                    return PathClass {
                        project,
                        branch: Some(name.clone()),
                        tag: None,
                        local_path: rest.to_vec(),
                        is_tag: false,
                    };
                }
                if let Some(name) = self.tag_mappings.get(first) {
                    return PathClass {
                        project,
                        branch: None,
                        tag: Some(name.clone()),
                        local_path: rest.to_vec(),
                        is_tag: true,
                    };
                }
                PathClass {
                    project,
                    branch: None,
                    tag: None,
                    local_path: rem.to_vec(),
                    is_tag: false,
                }
            }
        }
    }
}

fn split_first(path: &[u8]) -> (&[u8], &[u8]) {
    match path.iter().position(|&b| b == b'/') {
        Some(pos) => (&path[..pos], &path[(pos + 1)..]),
        None => (path, b""),
    }
}

#[cfg(test)]
mod tests {
    use super::{Layout, PathClass};

    fn layout() -> Layout {
        Layout::new(
            [b"mainproj".to_vec(), b"other".to_vec()],
            [(b"gsoc-branch".to_vec(), b"gsoc".to_vec())],
            [(b"rel-1-2-0".to_vec(), b"rel-1.2.0".to_vec())],
        )
    }

    #[test]
    fn trunk_paths() {
        let l = layout();
        assert_eq!(
            l.classify(b"mainproj/trunk/src/main.c"),
            PathClass {
                project: Some(b"mainproj".to_vec()),
                branch: Some(b"master".to_vec()),
                tag: None,
                local_path: b"src/main.c".to_vec(),
                is_tag: false,
            },
        );
        // trunk root has an empty local path
        assert_eq!(l.classify(b"mainproj/trunk").local_path, b"");
        assert_eq!(
            l.classify(b"mainproj/trunk").branch.as_deref(),
            Some(b"master".as_slice()),
        );
    }

    #[test]
    fn branch_paths() {
        let l = layout();
        let c = l.classify(b"mainproj/branches/stable/README");
        assert_eq!(c.branch.as_deref(), Some(b"stable".as_slice()));
        assert_eq!(c.local_path, b"README");
        assert!(!c.is_tag);

        // branch root
        let c = l.classify(b"mainproj/branches/stable");
        assert_eq!(c.branch.as_deref(), Some(b"stable".as_slice()));
        assert_eq!(c.local_path, b"");

        // mapped name
        let c = l.classify(b"mainproj/branches/gsoc-branch/x");
        assert_eq!(c.branch.as_deref(), Some(b"gsoc".as_slice()));
    }

    #[test]
    fn tag_paths() {
        let l = layout();
        let c = l.classify(b"mainproj/tags/rel-1-2-0");
        assert_eq!(c.tag.as_deref(), Some(b"rel-1.2.0".as_slice()));
        assert!(c.is_tag);
        assert_eq!(c.local_path, b"");

        let c = l.classify(b"mainproj/tags/rel-1-3-0/doc/a.txt");
        assert_eq!(c.tag.as_deref(), Some(b"rel-1-3-0".as_slice()));
        assert_eq!(c.local_path, b"doc/a.txt");
    }

    #[test]
    fn rootless_layout_gets_the_default_project() {
        let l = layout();
        let c = l.classify(b"trunk/src/main.c");
        assert_eq!(c.project.as_deref(), Some(b"default".as_slice()));
        assert_eq!(c.branch.as_deref(), Some(b"master".as_slice()));
        assert_eq!(c.local_path, b"src/main.c");

        let c = l.classify(b"branches/stable/x");
        assert_eq!(c.project.as_deref(), Some(b"default".as_slice()));
        assert_eq!(c.branch.as_deref(), Some(b"stable".as_slice()));

        let c = l.classify(b"tags/rel-1-2-0");
        assert_eq!(c.project.as_deref(), Some(b"default".as_slice()));
        assert_eq!(c.tag.as_deref(), Some(b"rel-1.2.0".as_slice()));
    }

    #[test]
    fn override_tables_classify_off_convention_segments() {
        let l = layout();
        // the mapped directory sits directly under the project, outside
        // the branches/tags convention
        let c = l.classify(b"mainproj/gsoc-branch/src/x.c");
        assert_eq!(c.branch.as_deref(), Some(b"gsoc".as_slice()));
        assert_eq!(c.local_path, b"src/x.c");
        assert!(!c.is_tag);

        let c = l.classify(b"rel-1-2-0/doc/a.txt");
        assert_eq!(c.project.as_deref(), Some(b"default".as_slice()));
        assert_eq!(c.tag.as_deref(), Some(b"rel-1.2.0".as_slice()));
        assert_eq!(c.local_path, b"doc/a.txt");
        assert!(c.is_tag);
    }

    #[test]
    fn unclassified_paths() {
        let l = layout();
        let c = l.classify(b"web/index.html");
        assert_eq!(c.project, None);
        assert_eq!(c.branch, None);
        assert_eq!(c.local_path, b"web/index.html");

        // project dir itself
        let c = l.classify(b"mainproj");
        assert_eq!(c.project.as_deref(), Some(b"mainproj".as_slice()));
        assert_eq!(c.branch, None);
        assert_eq!(c.local_path, b"");
    }
}
