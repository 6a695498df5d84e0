use crate::user_map::UserMap;

pub(crate) struct GitCommitMeta {
    /// `Name <email> <epoch> +0000`, ready for a committer/author line.
    pub(crate) author_line: String,
    pub(crate) message: String,
}

pub(crate) struct GitTagMeta {
    pub(crate) tagger_line: String,
    pub(crate) message: String,
}

pub(crate) struct GitMetaMaker<'a> {
    user_map: &'a UserMap,
    allow_unmapped: bool,
    jinja_env: minijinja::Environment<'a>,
}

impl<'a> GitMetaMaker<'a> {
    pub(crate) fn new(
        user_map: &'a UserMap,
        allow_unmapped: bool,
        user_fallback_template: &'a str,
        commit_msg_template: &'a str,
        tag_msg_template: &'a str,
    ) -> Result<Self, String> {
        let mut jinja_env = minijinja::Environment::empty();
        jinja_env.set_undefined_behavior(minijinja::UndefinedBehavior::Strict);

        jinja_env
            .add_template("user_fallback", user_fallback_template)
            .map_err(|e| format!("failed to parse user fallback template: {e}"))?;
        jinja_env
            .add_template("commit_msg", commit_msg_template)
            .map_err(|e| format!("failed to parse commit message template: {e}"))?;
        jinja_env
            .add_template("tag_msg", tag_msg_template)
            .map_err(|e| format!("failed to parse tag message template: {e}"))?;

        Ok(Self {
            user_map,
            allow_unmapped,
            jinja_env,
        })
    }

    pub(crate) fn make_commit_meta(
        &self,
        svn_uuid: Option<&uuid::Uuid>,
        svn_rev_no: u32,
        svn_branch: Option<&[u8]>,
        svn_author: Option<&[u8]>,
        svn_date: Option<&[u8]>,
        svn_log: Option<&[u8]>,
    ) -> Result<GitCommitMeta, String> {
        let jinja_ctx = JinjaCtx::new(
            svn_uuid,
            svn_rev_no,
            svn_branch,
            None,
            svn_author,
            svn_log,
            self.user_map,
        );

        let (name, email) = self.convert_author(&jinja_ctx, svn_author)?;
        let epoch = convert_date(svn_date)?;

        let msg_template = self.jinja_env.get_template("commit_msg").unwrap();
        let message = msg_template
            .render(&jinja_ctx)
            .map_err(|e| format!("failed to render git commit message: {e}"))?
            .replace("\r\n", "\n");

        Ok(GitCommitMeta {
            author_line: format!("{name} <{email}> {epoch} +0000"),
            message,
        })
    }

    pub(crate) fn make_tag_meta(
        &self,
        svn_uuid: Option<&uuid::Uuid>,
        svn_rev_no: u32,
        svn_tag: &[u8],
        svn_author: Option<&[u8]>,
        svn_date: Option<&[u8]>,
        svn_log: Option<&[u8]>,
    ) -> Result<GitTagMeta, String> {
        let jinja_ctx = JinjaCtx::new(
            svn_uuid,
            svn_rev_no,
            None,
            Some(svn_tag),
            svn_author,
            svn_log,
            self.user_map,
        );

        let (name, email) = self.convert_author(&jinja_ctx, svn_author)?;
        let epoch = convert_date(svn_date)?;

        let msg_template = self.jinja_env.get_template("tag_msg").unwrap();
        let message = msg_template
            .render(&jinja_ctx)
            .map_err(|e| format!("failed to render git tag message: {e}"))?
            .replace("\r\n", "\n");

        Ok(GitTagMeta {
            tagger_line: format!("{name} <{email}> {epoch} +0000"),
            message,
        })
    }

    fn convert_author(
        &self,
        jinja_ctx: &JinjaCtx,
        svn_author: Option<&[u8]>,
    ) -> Result<(String, String), String> {
        if let Some((name, email)) = svn_author.and_then(|author| self.user_map.get(author)) {
            return Ok((name.into(), email.into()));
        }

        if let Some(author) = svn_author {
            if !self.allow_unmapped {
                return Err(format!(
                    "author \"{}\" has no user map entry",
                    author.escape_ascii(),
                ));
            }
        }

        let template = self.jinja_env.get_template("user_fallback").unwrap();
        let author = template
            .render(jinja_ctx)
            .map_err(|e| format!("failed to render fallback author: {e}"))?;
        let Some((name, email)) = split_author_name_email(&author) else {
            return Err(format!(
                "author {author:?} is not in \"name <email>\" format"
            ));
        };

        Ok((name.into(), email.into()))
    }
}

#[derive(serde::Serialize)]
struct JinjaCtx {
    svn_uuid: String,
    svn_rev: u32,
    svn_author: String,
    svn_log: String,
    svn_branch: String,
    svn_tag: String,
    mapped_author_name: String,
    mapped_author_email: String,
}

impl JinjaCtx {
    fn new(
        uuid: Option<&uuid::Uuid>,
        rev_no: u32,
        branch: Option<&[u8]>,
        tag: Option<&[u8]>,
        svn_author: Option<&[u8]>,
        svn_log: Option<&[u8]>,
        user_map: &UserMap,
    ) -> Self {
        let (mapped_author_name, mapped_author_email) = svn_author
            .and_then(|author| {
                user_map
                    .get(author)
                    .map(|(name, email)| (String::from(name), String::from(email)))
            })
            .unwrap_or_default();

        Self {
            svn_uuid: uuid.map(ToString::to_string).unwrap_or_default(),
            svn_rev: rev_no,
            svn_author: String::from_utf8_lossy(svn_author.unwrap_or_default()).into_owned(),
            svn_log: String::from_utf8_lossy(svn_log.unwrap_or_default()).into_owned(),
            svn_branch: String::from_utf8_lossy(branch.unwrap_or_default()).into_owned(),
            svn_tag: String::from_utf8_lossy(tag.unwrap_or_default()).into_owned(),
            mapped_author_name,
            mapped_author_email,
        }
    }
}

fn split_author_name_email(raw: &str) -> Option<(&str, &str)> {
    if raw.contains('\n') {
        return None;
    }

    let i_lt = raw.find('<')?;

    let name = raw[..i_lt].trim_matches(' ');
    let email = raw[(i_lt + 1)..]
        .trim_end_matches(' ')
        .strip_suffix('>')?
        .trim_matches(' ');

    Some((name, email))
}

fn convert_date(raw_date: Option<&[u8]>) -> Result<i64, String> {
    raw_date.map_or(Ok(0), |raw_date| {
        std::str::from_utf8(raw_date)
            .ok()
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|date| date.timestamp())
            .ok_or_else(|| format!("invalid SVN revision date \"{}\"", raw_date.escape_ascii()))
    })
}

#[cfg(test)]
mod tests {
    use super::GitMetaMaker;
    use crate::user_map::UserMap;

    const FALLBACK: &str =
        r#"{{ svn_author or "no-author" }} <{{ svn_author or "no-author" }}@svn>"#;
    const COMMIT_MSG: &str = "{{ svn_log }}\n\nsvn:revision:{{ svn_rev }}\n";
    const TAG_MSG: &str = "{{ svn_log }}\n\nsvn:tag:{{ svn_tag }}\n";

    fn user_map() -> UserMap {
        let src: &[u8] = b"jdoe John Doe <jdoe@example.org>\n";
        UserMap::parse(&mut { src }).ok().unwrap()
    }

    #[test]
    fn mapped_author() {
        let user_map = user_map();
        let maker = GitMetaMaker::new(&user_map, false, FALLBACK, COMMIT_MSG, TAG_MSG).unwrap();

        let meta = maker
            .make_commit_meta(
                None,
                7,
                Some(b"master"),
                Some(b"jdoe"),
                Some(b"2005-01-01T12:00:00.000000Z"),
                Some(b"a change"),
            )
            .unwrap();
        assert_eq!(meta.author_line, "John Doe <jdoe@example.org> 1104580800 +0000");
        assert_eq!(meta.message, "a change\n\nsvn:revision:7\n");
    }

    #[test]
    fn unmapped_author_rejected() {
        let user_map = user_map();
        let maker = GitMetaMaker::new(&user_map, false, FALLBACK, COMMIT_MSG, TAG_MSG).unwrap();
        assert!(maker
            .make_commit_meta(None, 7, None, Some(b"ghost"), None, None)
            .is_err());
    }

    #[test]
    fn unmapped_author_fallback() {
        let user_map = user_map();
        let maker = GitMetaMaker::new(&user_map, true, FALLBACK, COMMIT_MSG, TAG_MSG).unwrap();
        let meta = maker
            .make_commit_meta(None, 7, None, Some(b"ghost"), None, None)
            .unwrap();
        assert_eq!(meta.author_line, "ghost <ghost@svn> 0 +0000");
    }

    #[test]
    fn tag_meta() {
        let user_map = user_map();
        let maker = GitMetaMaker::new(&user_map, false, FALLBACK, COMMIT_MSG, TAG_MSG).unwrap();
        let meta = maker
            .make_tag_meta(
                None,
                9,
                b"rel-7-12-2",
                Some(b"jdoe"),
                Some(b"2005-01-01T12:00:00.000000Z"),
                Some(b"tagging"),
            )
            .unwrap();
        assert_eq!(meta.tagger_line, "John Doe <jdoe@example.org> 1104580800 +0000");
        assert_eq!(meta.message, "tagging\n\nsvn:tag:rel-7-12-2\n");
    }
}
