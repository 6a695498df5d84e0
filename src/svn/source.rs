use std::ffi::OsString;
use std::io::{Read as _, Seek as _};
use std::path::{Path, PathBuf};

// The conversion reads blob contents back by offset, so the dump must end up
// in a plain seekable file. Compressed dumps and `svnadmin dump` output are
// spooled into the work directory first.

#[derive(Debug)]
pub(crate) enum OpenError {
    MetadataFetchError {
        path: PathBuf,
        error: std::io::Error,
    },
    FileOpenError {
        path: PathBuf,
        error: std::io::Error,
    },
    FileReadError {
        path: PathBuf,
        error: std::io::Error,
    },
    FileWriteError {
        path: PathBuf,
        error: std::io::Error,
    },
    SpawnProcessError {
        arg0: OsString,
        error: std::io::Error,
    },
    ProcessFailed {
        arg0: OsString,
        exit_code: std::process::ExitStatus,
    },
}

impl std::fmt::Display for OpenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MetadataFetchError { path, error } => {
                write!(f, "failed to fetch metadata for {path:?}: {error}")
            }
            Self::FileOpenError { path, error } => {
                write!(f, "failed to open file {path:?}: {error}")
            }
            Self::FileReadError { path, error } => {
                write!(f, "failed to read file {path:?}: {error}")
            }
            Self::FileWriteError { path, error } => {
                write!(f, "failed to write file {path:?}: {error}")
            }
            Self::SpawnProcessError { arg0, error } => {
                write!(f, "failed to spawn process {arg0:?}: {error}")
            }
            Self::ProcessFailed { arg0, exit_code } => {
                write!(f, "process {arg0:?} finished with {exit_code}")
            }
        }
    }
}

/// Produces a plain seekable dump file from `src`, which may be a repository
/// directory, a compressed dump, or an uncompressed dump. Returns the path
/// to read the dump from; `spool_path` is only created when needed.
pub(crate) fn prepare_dump(src: &Path, spool_path: &Path) -> Result<PathBuf, OpenError> {
    let src_meta = std::fs::metadata(src).map_err(|e| OpenError::MetadataFetchError {
        path: src.to_path_buf(),
        error: e,
    })?;

    if src_meta.file_type().is_dir() {
        let spool_file = create_spool(spool_path)?;
        let mut child = std::process::Command::new("svnadmin")
            .arg("dump")
            .arg(src)
            .arg("-q")
            .stdin(std::process::Stdio::null())
            .stdout(spool_file)
            .stderr(std::process::Stdio::inherit())
            .spawn()
            .map_err(|e| OpenError::SpawnProcessError {
                arg0: "svnadmin".into(),
                error: e,
            })?;
        let exit_code = child.wait().map_err(|e| OpenError::SpawnProcessError {
            arg0: "svnadmin".into(),
            error: e,
        })?;
        if !exit_code.success() {
            return Err(OpenError::ProcessFailed {
                arg0: "svnadmin".into(),
                exit_code,
            });
        }
        return Ok(spool_path.to_path_buf());
    }

    let mut file = std::fs::OpenOptions::new()
        .read(true)
        .open(src)
        .map_err(|e| OpenError::FileOpenError {
            path: src.to_path_buf(),
            error: e,
        })?;

    const ZSTD_MAGIC: &[u8] = &[0x28, 0xB5, 0x2F, 0xFD];
    const GZIP_MAGIC: &[u8] = &[0x1F, 0x8B];
    const BZIP2_MAGIC: &[u8] = b"BZh";
    const XZ_MAGIC: &[u8] = &[0xFD, 0x37, 0x7A, 0x58, 0x5A, 0x00];
    const LZ4_MAGIC: &[u8] = &[0x04, 0x22, 0x4D, 0x18];

    const HEADER_SIZE: usize = 6;

    let mut header = Vec::<u8>::with_capacity(HEADER_SIZE);
    while header.len() < HEADER_SIZE {
        let mut buf = [0; HEADER_SIZE];
        match file.read(&mut buf[..(HEADER_SIZE - header.len())]) {
            Ok(0) => break,
            Ok(n) => header.extend(&buf[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => {
                return Err(OpenError::FileReadError {
                    path: src.to_path_buf(),
                    error: e,
                });
            }
        }
    }

    file.seek(std::io::SeekFrom::Start(0))
        .map_err(|e| OpenError::FileReadError {
            path: src.to_path_buf(),
            error: e,
        })?;

    let is_compressed = header.starts_with(ZSTD_MAGIC)
        || header.starts_with(GZIP_MAGIC)
        || header.starts_with(BZIP2_MAGIC)
        || header.starts_with(XZ_MAGIC)
        || header.starts_with(LZ4_MAGIC);
    if !is_compressed {
        return Ok(src.to_path_buf());
    }

    let mut spool_file = create_spool(spool_path)?;
    let copied: Result<_, std::io::Error> = if header.starts_with(ZSTD_MAGIC) {
        zstd::stream::copy_decode(&file, &mut spool_file).map(|()| ())
    } else if header.starts_with(GZIP_MAGIC) {
        let mut decoder = flate2::read::GzDecoder::new(&file);
        std::io::copy(&mut decoder, &mut spool_file).map(|_| ())
    } else if header.starts_with(BZIP2_MAGIC) {
        let mut decoder = bzip2::read::BzDecoder::new(&file);
        std::io::copy(&mut decoder, &mut spool_file).map(|_| ())
    } else if header.starts_with(XZ_MAGIC) {
        liblzma::copy_decode(&file, &mut spool_file).map(|()| ())
    } else {
        let mut decoder = lz4_flex::frame::FrameDecoder::new(&file);
        std::io::copy(&mut decoder, &mut spool_file).map(|_| ())
    };
    copied.map_err(|e| OpenError::FileWriteError {
        path: spool_path.to_path_buf(),
        error: e,
    })?;

    Ok(spool_path.to_path_buf())
}

fn create_spool(spool_path: &Path) -> Result<std::fs::File, OpenError> {
    std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(spool_path)
        .map_err(|e| OpenError::FileOpenError {
            path: spool_path.to_path_buf(),
            error: e,
        })
}
