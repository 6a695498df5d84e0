use std::collections::HashMap;

/// Maps SVN author names to git identities.
///
/// The map file holds one entry per line: the SVN author name, whitespace,
/// then the git identity in `Name <email>` form. Empty lines and lines
/// starting with `#` are ignored.
pub(crate) struct UserMap {
    map: HashMap<Vec<u8>, UserMapEntry>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct UserMapEntry {
    name: String,
    email: String,
}

pub(crate) enum UserMapParseError {
    Io(std::io::Error),
    BadLine(usize, Vec<u8>),
}

impl From<std::io::Error> for UserMapParseError {
    fn from(error: std::io::Error) -> Self {
        Self::Io(error)
    }
}

impl std::fmt::Display for UserMapParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::Io(ref e) => e.fmt(f),
            Self::BadLine(line, ref line_data) => {
                write!(f, "bad line {}: \"{}\"", line + 1, line_data.escape_ascii())
            }
        }
    }
}

impl UserMap {
    pub(crate) fn new() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    pub(crate) fn parse(src: &mut dyn std::io::BufRead) -> Result<Self, UserMapParseError> {
        let mut map = HashMap::new();

        let mut line_i = 0;
        let mut line = Vec::new();
        loop {
            line.clear();
            src.read_until(b'\n', &mut line)?;

            match parse_line(&line) {
                Some(Some((user, entry))) => {
                    map.insert(user, entry);
                }
                Some(None) => {}
                None => return Err(UserMapParseError::BadLine(line_i, line)),
            }

            if !line.ends_with(b"\n") {
                break;
            }

            line_i += 1;
        }

        Ok(Self { map })
    }

    pub(crate) fn get(&self, user: &[u8]) -> Option<(&str, &str)> {
        self.map
            .get(user)
            .map(|entry| (entry.name.as_str(), entry.email.as_str()))
    }
}

fn parse_line(line: &[u8]) -> Option<Option<(Vec<u8>, UserMapEntry)>> {
    let mut rem = line;
    rem = rem.strip_suffix(b"\n").unwrap_or(rem);
    rem = rem.strip_suffix(b"\r").unwrap_or(rem);
    skip_spaces(&mut rem);

    if rem.is_empty() || rem.starts_with(b"#") {
        return Some(None);
    }

    let user_len = rem
        .iter()
        .position(|&b| matches!(b, b' ' | b'\t'))
        .filter(|&l| l != 0)?;

    let user = rem[..user_len].to_vec();
    rem = &rem[user_len..];

    skip_spaces(&mut rem);

    let name_len = rem.iter().position(|&b| b == b'<')?;
    let name = String::from(std::str::from_utf8(&rem[..name_len]).ok()?.trim());
    rem = &rem[(name_len + 1)..];

    let email_len = rem.iter().position(|&b| b == b'>')?;
    let email = String::from(std::str::from_utf8(&rem[..email_len]).ok()?);
    rem = &rem[(email_len + 1)..];

    if !rem.iter().all(|&b| matches!(b, b' ' | b'\t')) {
        return None;
    }

    Some(Some((user, UserMapEntry { name, email })))
}

fn skip_spaces(slice: &mut &[u8]) {
    loop {
        if let Some(rem) = slice.strip_prefix(b" ") {
            *slice = rem;
        } else if let Some(rem) = slice.strip_prefix(b"\t") {
            *slice = rem;
        } else {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{parse_line, UserMap, UserMapEntry};

    #[test]
    fn test_parse_line() {
        assert_eq!(
            parse_line(b"jdoe John Doe <jdoe@example.org>"),
            Some(Some((
                b"jdoe".to_vec(),
                UserMapEntry {
                    name: "John Doe".into(),
                    email: "jdoe@example.org".into(),
                }
            ))),
        );
        assert_eq!(
            parse_line(b"  jdoe \t John Doe <jdoe@example.org> "),
            Some(Some((
                b"jdoe".to_vec(),
                UserMapEntry {
                    name: "John Doe".into(),
                    email: "jdoe@example.org".into(),
                }
            ))),
        );
        assert_eq!(parse_line(b""), Some(None));
        assert_eq!(parse_line(b"# a comment\n"), Some(None));
        assert_eq!(parse_line(b"jdoe no email here"), None);
        assert_eq!(parse_line(b"jdoe John Doe <unterminated"), None);
    }

    #[test]
    fn test_parse_map() {
        let src: &[u8] = b"# authors\njdoe John Doe <jdoe@example.org>\nasmith Alice Smith <asmith@example.org>\n";
        let map = match UserMap::parse(&mut { src }) {
            Ok(map) => map,
            Err(e) => panic!("{e}"),
        };
        assert_eq!(map.get(b"jdoe"), Some(("John Doe", "jdoe@example.org")));
        assert_eq!(
            map.get(b"asmith"),
            Some(("Alice Smith", "asmith@example.org")),
        );
        assert_eq!(map.get(b"nobody"), None);
    }
}
