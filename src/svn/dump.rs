use std::collections::HashMap;
use std::io::{BufRead, Read};

// SVN dump file format described in
// https://svn.apache.org/repos/asf/subversion/trunk/notes/dump-load-format.txt
//
// Only format version 2 is accepted (no deltas). Blob contents are not kept
// in memory: each node records the byte offset and length of its text within
// the dump file, and the git blob id the text will hash to.

pub(crate) struct SvnModel {
    pub(crate) uuid: Option<uuid::Uuid>,
    pub(crate) revisions: Vec<Revision>,
    pub(crate) nodes: Vec<Node>,
}

impl SvnModel {
    pub(crate) fn rev_nodes(&self, rev: &Revision) -> &[Node] {
        &self.nodes[rev.nodes.clone()]
    }

    pub(crate) fn head_rev(&self) -> u32 {
        self.revisions.last().map_or(0, |rev| rev.rev_no)
    }
}

pub(crate) struct Revision {
    pub(crate) rev_no: u32,
    pub(crate) author: Option<Vec<u8>>,
    pub(crate) date: Option<Vec<u8>>,
    pub(crate) log: Option<Vec<u8>>,
    pub(crate) nodes: std::ops::Range<usize>,
    // filled in by analysis
    pub(crate) project: Option<Vec<u8>>,
    pub(crate) merge: bool,
    pub(crate) merged_from: Option<Vec<u8>>,
    pub(crate) merged_rev: Option<u32>,
    pub(crate) move_edit: bool,
}

pub(crate) struct Node {
    pub(crate) rev_no: u32,
    pub(crate) path: Vec<u8>,
    pub(crate) kind: Option<NodeKind>,
    pub(crate) action: NodeAction,
    pub(crate) copy_from: Option<NodeCopyFrom>,
    pub(crate) text: Option<NodeText>,
    pub(crate) text_copy_source_sha1: Option<Vec<u8>>,
    pub(crate) props: Option<HashMap<Vec<u8>, Vec<u8>>>,
    pub(crate) exec: bool,
    pub(crate) crlf_content: bool,
    // filled in by analysis
    pub(crate) project: Option<Vec<u8>>,
    pub(crate) branch: Option<Vec<u8>>,
    pub(crate) tag: Option<Vec<u8>>,
    pub(crate) local_path: Vec<u8>,
    pub(crate) is_tag_path: bool,
    pub(crate) skip: bool,
    pub(crate) move_edit: bool,
    pub(crate) exec_change: bool,
    pub(crate) tag_add: bool,
    pub(crate) tag_delete: bool,
    pub(crate) branch_add: bool,
    pub(crate) branch_delete: bool,
    pub(crate) stale_copy: bool,
}

impl Node {
    pub(crate) fn text_sha1(&self) -> Option<&[u8]> {
        self.text
            .as_ref()
            .and_then(|text| text.sha1.as_deref())
            .or(self.text_copy_source_sha1.as_deref())
    }
}

pub(crate) struct NodeText {
    pub(crate) offset: u64,
    pub(crate) len: u64,
    pub(crate) md5: Option<Vec<u8>>,
    pub(crate) sha1: Option<Vec<u8>>,
    pub(crate) git_sha1: gix_hash::ObjectId,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum NodeAction {
    Change,
    Add,
    Delete,
    Replace,
}

impl NodeAction {
    fn parse(s: &[u8]) -> Option<Self> {
        match s {
            b"change" => Some(Self::Change),
            b"add" => Some(Self::Add),
            b"delete" => Some(Self::Delete),
            b"replace" => Some(Self::Replace),
            _ => None,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum NodeKind {
    File,
    Dir,
}

impl NodeKind {
    fn parse(s: &[u8]) -> Option<Self> {
        match s {
            b"file" => Some(Self::File),
            b"dir" => Some(Self::Dir),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) struct NodeCopyFrom {
    pub(crate) rev: u32,
    pub(crate) path: Vec<u8>,
}

#[derive(Debug)]
pub(crate) enum ReadError {
    Io(std::io::Error),
    BrokenHeader,
    InvalidVersion { version: Vec<u8> },
    MissingHeaderEntry { key: Vec<u8> },
    InvalidHeaderEntry { key: Vec<u8>, value: Vec<u8> },
    UnknownRecordType,
    MismatchedContentLen,
    BrokenProperties,
    NodeBeforeRevision { path: Vec<u8> },
}

impl From<std::io::Error> for ReadError {
    #[inline]
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl std::fmt::Display for ReadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::Io(ref e) => write!(f, "failed to read dump: {e}"),
            Self::BrokenHeader => write!(f, "broken header"),
            Self::InvalidVersion { ref version } => {
                write!(f, "invalid version: \"{}\"", version.escape_ascii())
            }
            Self::MissingHeaderEntry { ref key } => {
                write!(f, "missing header entry: \"{}\"", key.escape_ascii())
            }
            Self::InvalidHeaderEntry { ref key, ref value } => write!(
                f,
                "invalid value for header entry \"{}\": \"{}\"",
                key.escape_ascii(),
                value.escape_ascii(),
            ),
            Self::UnknownRecordType => write!(f, "unknown record type"),
            Self::MismatchedContentLen => write!(f, "mismatched content length"),
            Self::BrokenProperties => write!(f, "broken properties"),
            Self::NodeBeforeRevision { ref path } => write!(
                f,
                "node \"{}\" before first revision record",
                path.escape_ascii(),
            ),
        }
    }
}

/// Parses a whole version-2 dump stream into an [`SvnModel`].
///
/// `source` must read the same bytes as the file the conversion will later
/// seek into, so blob offsets recorded here stay valid.
pub(crate) fn load(source: impl Read) -> Result<SvnModel, ReadError> {
    let mut src = CountingReader::new(std::io::BufReader::new(source));

    let header =
        parse_header(&mut src)?.ok_or_else(|| std::io::Error::from(std::io::ErrorKind::UnexpectedEof))?;
    let version_key = b"SVN-fs-dump-format-version";
    let raw_version = header
        .get(version_key.as_slice())
        .ok_or_else(|| ReadError::MissingHeaderEntry {
            key: version_key.to_vec(),
        })?;
    if raw_version != b"2" {
        return Err(ReadError::InvalidVersion {
            version: raw_version.clone(),
        });
    }

    let mut model = SvnModel {
        uuid: None,
        revisions: Vec::new(),
        nodes: Vec::new(),
    };

    while let Some(header) = parse_header(&mut src)? {
        let raw_uuid = header.get(b"UUID".as_slice());
        let raw_rev_no = header.get(b"Revision-number".as_slice());
        let raw_node_path = header.get(b"Node-path".as_slice());

        let type_cnt = usize::from(raw_uuid.is_some())
            + usize::from(raw_rev_no.is_some())
            + usize::from(raw_node_path.is_some());
        if type_cnt != 1 {
            return Err(ReadError::UnknownRecordType);
        }

        if let Some(raw_uuid) = raw_uuid {
            if get_len_entry(&header, b"Content-length")?.unwrap_or(0) != 0 {
                return Err(ReadError::MismatchedContentLen);
            }
            model.uuid = Some(uuid::Uuid::try_parse_ascii(raw_uuid).map_err(|_| {
                ReadError::InvalidHeaderEntry {
                    key: b"UUID".to_vec(),
                    value: raw_uuid.clone(),
                }
            })?);
        } else if raw_rev_no.is_some() {
            if let Some(prev) = model.revisions.last_mut() {
                prev.nodes.end = model.nodes.len();
            }
            let rev = read_rev_record(&mut src, &header, model.nodes.len())?;
            model.revisions.push(rev);
        } else {
            let node = read_node_record(&mut src, &header, &model)?;
            model.nodes.push(node);
        }
    }

    if let Some(rev) = model.revisions.last_mut() {
        rev.nodes.end = model.nodes.len();
    }

    Ok(model)
}

fn read_rev_record(
    src: &mut CountingReader<impl BufRead>,
    header: &RecordHeader,
    nodes_start: usize,
) -> Result<Revision, ReadError> {
    let rev_no_key = b"Revision-number";
    let raw_rev_no = header.get(rev_no_key.as_slice()).unwrap();
    let rev_no = std::str::from_utf8(raw_rev_no)
        .ok()
        .and_then(|s| s.parse::<u32>().ok())
        .ok_or_else(|| ReadError::InvalidHeaderEntry {
            key: rev_no_key.to_vec(),
            value: raw_rev_no.clone(),
        })?;

    let prop_content_len = get_len_entry(header, b"Prop-content-length")?;
    let content_len = get_len_entry(header, b"Content-length")?;
    if prop_content_len.unwrap_or(0) != content_len.unwrap_or(0) {
        return Err(ReadError::MismatchedContentLen);
    }

    let mut props = HashMap::new();
    if let Some(prop_content_len) = prop_content_len {
        props = read_prop_block(src, prop_content_len)?;
    }

    Ok(Revision {
        rev_no,
        author: props.remove(b"svn:author".as_slice()),
        date: props.remove(b"svn:date".as_slice()),
        log: props.remove(b"svn:log".as_slice()),
        nodes: nodes_start..nodes_start,
        project: None,
        merge: false,
        merged_from: None,
        merged_rev: None,
        move_edit: false,
    })
}

fn read_node_record(
    src: &mut CountingReader<impl BufRead>,
    header: &RecordHeader,
    model: &SvnModel,
) -> Result<Node, ReadError> {
    let path = header.get(b"Node-path".as_slice()).unwrap().clone();

    let rev_no = model
        .revisions
        .last()
        .ok_or_else(|| ReadError::NodeBeforeRevision { path: path.clone() })?
        .rev_no;

    let kind_key = b"Node-kind";
    let kind = header
        .get(kind_key.as_slice())
        .map(|raw| {
            NodeKind::parse(raw).ok_or_else(|| ReadError::InvalidHeaderEntry {
                key: kind_key.to_vec(),
                value: raw.clone(),
            })
        })
        .transpose()?;

    let action_key = b"Node-action";
    let raw_action = header
        .get(action_key.as_slice())
        .ok_or_else(|| ReadError::MissingHeaderEntry {
            key: action_key.to_vec(),
        })?;
    let action = NodeAction::parse(raw_action).ok_or_else(|| ReadError::InvalidHeaderEntry {
        key: action_key.to_vec(),
        value: raw_action.clone(),
    })?;

    let copy_from_rev_key = b"Node-copyfrom-rev";
    let copy_from_path_key = b"Node-copyfrom-path";
    let copy_from = match (
        header.get(copy_from_rev_key.as_slice()),
        header.get(copy_from_path_key.as_slice()),
    ) {
        (None, None) => None,
        (Some(raw_rev), Some(raw_path)) => {
            let rev = std::str::from_utf8(raw_rev)
                .ok()
                .and_then(|s| s.parse::<u32>().ok())
                .ok_or_else(|| ReadError::InvalidHeaderEntry {
                    key: copy_from_rev_key.to_vec(),
                    value: raw_rev.clone(),
                })?;
            Some(NodeCopyFrom {
                rev,
                path: raw_path.clone(),
            })
        }
        (Some(_), None) => {
            return Err(ReadError::MissingHeaderEntry {
                key: copy_from_path_key.to_vec(),
            });
        }
        (None, Some(_)) => {
            return Err(ReadError::MissingHeaderEntry {
                key: copy_from_rev_key.to_vec(),
            });
        }
    };

    let prop_content_len = get_len_entry(header, b"Prop-content-length")?;
    let text_content_len = get_len_entry(header, b"Text-content-length")?;
    let content_len = get_len_entry(header, b"Content-length")?;

    let expected_content_len = prop_content_len
        .unwrap_or(0)
        .checked_add(text_content_len.unwrap_or(0))
        .ok_or(ReadError::MismatchedContentLen)?;
    if content_len.unwrap_or(0) != expected_content_len {
        return Err(ReadError::MismatchedContentLen);
    }

    let props = prop_content_len
        .map(|prop_content_len| read_prop_block(src, prop_content_len))
        .transpose()?;

    let exec = props
        .as_ref()
        .is_some_and(|props| props.contains_key(b"svn:executable".as_slice()));
    let crlf_content = props.as_ref().is_some_and(|props| {
        props
            .get(b"svn:eol-style".as_slice())
            .is_some_and(|style| style != b"native")
    });

    let text = text_content_len
        .map(|len| -> Result<NodeText, ReadError> {
            let offset = src.position();
            let len_usize =
                usize::try_from(len).map_err(|_| ReadError::MismatchedContentLen)?;
            let mut data = vec![0; len_usize];
            src.read_exact(&mut data)?;

            let hashed = if crlf_content {
                expand_crlf(&data)
            } else {
                std::borrow::Cow::Borrowed(data.as_slice())
            };
            let git_sha1 = gix_object::compute_hash(
                gix_hash::Kind::Sha1,
                gix_object::Kind::Blob,
                &hashed,
            )
            .map_err(std::io::Error::other)?;

            Ok(NodeText {
                offset,
                len,
                md5: header.get(b"Text-content-md5".as_slice()).cloned(),
                sha1: header.get(b"Text-content-sha1".as_slice()).cloned(),
                git_sha1,
            })
        })
        .transpose()?;

    Ok(Node {
        rev_no,
        path,
        kind,
        action,
        copy_from,
        text,
        text_copy_source_sha1: header.get(b"Text-copy-source-sha1".as_slice()).cloned(),
        props,
        exec,
        crlf_content,
        project: None,
        branch: None,
        tag: None,
        local_path: Vec::new(),
        is_tag_path: false,
        skip: false,
        move_edit: false,
        exec_change: false,
        tag_add: false,
        tag_delete: false,
        branch_add: false,
        branch_delete: false,
        stale_copy: false,
    })
}

/// Inserts a CR before every bare LF. Clients store files with a
/// non-native `svn:eol-style` using CRLF endings, so the blob must be
/// hashed and exported in that rendering.
pub(crate) fn expand_crlf(data: &[u8]) -> std::borrow::Cow<'_, [u8]> {
    let bare_lf =
        |i: usize, b: u8| b == b'\n' && (i == 0 || data[i - 1] != b'\r');
    if !data.iter().enumerate().any(|(i, &b)| bare_lf(i, b)) {
        return std::borrow::Cow::Borrowed(data);
    }
    let mut out = Vec::with_capacity(data.len() + data.len() / 16);
    for (i, &b) in data.iter().enumerate() {
        if bare_lf(i, b) {
            out.push(b'\r');
        }
        out.push(b);
    }
    std::borrow::Cow::Owned(out)
}

fn get_len_entry(header: &RecordHeader, key: &[u8]) -> Result<Option<u64>, ReadError> {
    header
        .get(key)
        .map(|raw| {
            std::str::from_utf8(raw)
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .ok_or_else(|| ReadError::InvalidHeaderEntry {
                    key: key.to_vec(),
                    value: raw.clone(),
                })
        })
        .transpose()
}

fn read_prop_block(
    src: &mut CountingReader<impl BufRead>,
    prop_content_len: u64,
) -> Result<HashMap<Vec<u8>, Vec<u8>>, ReadError> {
    let mut prop_stream = Read::take(src, prop_content_len);
    match parse_properties(&mut prop_stream) {
        Ok(props) => {
            if prop_stream.limit() != 0 {
                Err(ReadError::BrokenProperties)
            } else {
                Ok(props)
            }
        }
        Err(e) => match e.kind() {
            std::io::ErrorKind::InvalidData | std::io::ErrorKind::UnexpectedEof => {
                Err(ReadError::BrokenProperties)
            }
            _ => Err(ReadError::Io(e)),
        },
    }
}

type RecordHeader = HashMap<Vec<u8>, Vec<u8>>;

fn parse_header(r: &mut impl BufRead) -> Result<Option<RecordHeader>, ReadError> {
    let mut buf = Vec::new();
    r.read_until(b'\n', &mut buf)?;
    while buf == b"\n" {
        buf.clear();
        r.read_until(b'\n', &mut buf)?;
    }
    if buf.is_empty() {
        return Ok(None);
    }
    let mut map = HashMap::new();
    while buf != b"\n" {
        let line = buf.strip_suffix(b"\n").ok_or(ReadError::BrokenHeader)?;

        let sep_pos = line
            .windows(2)
            .position(|n| n == b": ")
            .ok_or(ReadError::BrokenHeader)?;
        map.insert(line[..sep_pos].to_vec(), line[(sep_pos + 2)..].to_vec());

        buf.clear();
        r.read_until(b'\n', &mut buf)?;
    }

    Ok(Some(map))
}

fn parse_properties(r: &mut dyn BufRead) -> Result<HashMap<Vec<u8>, Vec<u8>>, std::io::Error> {
    let mut buf = Vec::new();
    let mut props = HashMap::new();
    loop {
        buf.clear();
        r.read_until(b'\n', &mut buf)?;
        let line = buf
            .strip_suffix(b"\n")
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::UnexpectedEof))?;

        if line == b"PROPS-END" {
            break;
        }

        let key_len = line
            .strip_prefix(b"K ")
            .and_then(|s| std::str::from_utf8(s).ok())
            .and_then(|s| s.parse::<usize>().ok())
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::InvalidData))?;

        let mut key = vec![0; key_len];
        r.read_exact(&mut key)?;

        let mut tmp = [0];
        r.read_exact(&mut tmp)?;
        if tmp != *b"\n" {
            return Err(std::io::Error::from(std::io::ErrorKind::InvalidData));
        }

        buf.clear();
        r.read_until(b'\n', &mut buf)?;
        let line = buf
            .strip_suffix(b"\n")
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::UnexpectedEof))?;

        let value_len = line
            .strip_prefix(b"V ")
            .and_then(|s| std::str::from_utf8(s).ok())
            .and_then(|s| s.parse::<usize>().ok())
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::InvalidData))?;

        let mut value = vec![0; value_len];
        r.read_exact(&mut value)?;

        r.read_exact(&mut tmp)?;
        if tmp != *b"\n" {
            return Err(std::io::Error::from(std::io::ErrorKind::InvalidData));
        }

        props.insert(key, value);
    }

    Ok(props)
}

struct CountingReader<R> {
    inner: R,
    pos: u64,
}

impl<R: BufRead> CountingReader<R> {
    fn new(inner: R) -> Self {
        Self { inner, pos: 0 }
    }

    fn position(&self) -> u64 {
        self.pos
    }
}

impl<R: BufRead> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl<R: BufRead> BufRead for CountingReader<R> {
    fn fill_buf(&mut self) -> std::io::Result<&[u8]> {
        self.inner.fill_buf()
    }

    fn consume(&mut self, amt: usize) {
        self.pos += amt as u64;
        self.inner.consume(amt);
    }
}
