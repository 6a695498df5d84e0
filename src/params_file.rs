use std::collections::HashMap;
use std::path::PathBuf;

#[derive(serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct ConvParams {
    /// The project whose history is converted.
    pub(crate) project: String,
    /// Top-level directories recognized as projects.
    #[serde(default = "Vec::new")]
    pub(crate) projects: Vec<String>,
    #[serde(rename = "branch-mappings", default = "HashMap::new")]
    pub(crate) branch_mappings: HashMap<String, String>,
    #[serde(rename = "tag-mappings", default = "HashMap::new")]
    pub(crate) tag_mappings: HashMap<String, String>,
    /// Tag directories excluded from the conversion entirely.
    #[serde(rename = "rejected-tags", default = "Vec::new")]
    pub(crate) rejected_tags: Vec<String>,
    /// Revisions whose inferred branch is known to be wrong.
    #[serde(rename = "branch-overrides", default = "Vec::new")]
    pub(crate) branch_overrides: Vec<RevBranch>,
    /// Revisions excluded from commit generation.
    #[serde(rename = "skip-revs", default = "Vec::new")]
    pub(crate) skip_revs: Vec<u32>,
    #[serde(rename = "verify-every", default = "default_verify_every")]
    pub(crate) verify_every: u32,
    #[serde(rename = "gc-every", default = "default_gc_every")]
    pub(crate) gc_every: u32,
    #[serde(rename = "keep-notes", default = "true_")]
    pub(crate) keep_notes: bool,
    #[serde(rename = "allow-unmapped-authors", default = "false_")]
    pub(crate) allow_unmapped_authors: bool,
    #[serde(rename = "user-map-file")]
    pub(crate) user_map_file: Option<PathBuf>,
    #[serde(rename = "user-fallback-template")]
    pub(crate) user_fallback_template: Option<String>,
    #[serde(rename = "commit-msg-template")]
    pub(crate) commit_msg_template: Option<String>,
    #[serde(rename = "tag-msg-template")]
    pub(crate) tag_msg_template: Option<String>,
}

#[derive(serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RevBranch {
    pub(crate) rev: u32,
    pub(crate) branch: String,
}

#[inline(always)]
fn false_() -> bool {
    false
}

#[inline(always)]
fn true_() -> bool {
    true
}

fn default_verify_every() -> u32 {
    1000
}

fn default_gc_every() -> u32 {
    100
}

#[cfg(test)]
mod tests {
    use super::ConvParams;

    #[test]
    fn parse_minimal() {
        let params: ConvParams = toml::from_str(r#"project = "mainproj""#).unwrap();
        assert_eq!(params.project, "mainproj");
        assert_eq!(params.verify_every, 1000);
        assert_eq!(params.gc_every, 100);
        assert!(params.keep_notes);
        assert!(!params.allow_unmapped_authors);
    }

    #[test]
    fn parse_full() {
        let params: ConvParams = toml::from_str(
            r#"
            project = "mainproj"
            projects = ["mainproj", "tools"]
            rejected-tags = ["rel-5-1"]
            skip-revs = [30760]
            verify-every = 500

            [branch-mappings]
            "gsoc-branch" = "gsoc"

            [[branch-overrides]]
            rev = 36472
            branch = "gsoc"
            "#,
        )
        .unwrap();
        assert_eq!(params.projects, ["mainproj", "tools"]);
        assert_eq!(params.rejected_tags, ["rel-5-1"]);
        assert_eq!(params.skip_revs, [30760]);
        assert_eq!(params.verify_every, 500);
        assert_eq!(
            params.branch_mappings.get("gsoc-branch").unwrap(),
            "gsoc",
        );
        assert_eq!(params.branch_overrides[0].rev, 36472);
        assert_eq!(params.branch_overrides[0].branch, "gsoc");
    }
}
