use std::path::PathBuf;

#[derive(clap::Parser)]
pub(crate) struct Cli {
    #[arg(
        long = "stderr-log-level",
        value_name = "LEVEL",
        value_enum,
        help = "Maximum stderr log level (warn by default)"
    )]
    pub(crate) stderr_log_level: Option<LogLevel>,
    #[arg(
        long = "log-file",
        value_name = "PATH",
        help = "File to write logs (besides stderr)"
    )]
    pub(crate) log_file: Option<PathBuf>,
    #[arg(
        long = "file-log-level",
        value_name = "LEVEL",
        value_enum,
        help = "Maximum file log level (debug by default)"
    )]
    pub(crate) file_log_level: Option<LogLevel>,
    #[arg(
        long = "src",
        short = 's',
        value_name = "PATH",
        help = "Source Subversion dump file (optionally compressed) or repository directory"
    )]
    pub(crate) src: PathBuf,
    #[arg(
        long = "dest",
        short = 'd',
        value_name = "PATH",
        help = "Destination work directory (git repositories and state files)"
    )]
    pub(crate) dest: PathBuf,
    #[arg(
        long = "conv-params",
        short = 'P',
        value_name = "FILE",
        help = "Conversion parameters"
    )]
    pub(crate) conv_params: PathBuf,
    #[arg(
        long = "svn-repo",
        value_name = "URL",
        help = "Subversion repository URL or path used for recovery checkouts and verification"
    )]
    pub(crate) svn_repo: Option<String>,
    #[arg(
        long = "verify-every",
        value_name = "N",
        help = "Verify converted contents against Subversion every N revisions (overrides parameters file)"
    )]
    pub(crate) verify_every: Option<u32>,
}

#[derive(Copy, Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogLevel {
    #[value(name = "error")]
    Error,
    #[value(name = "warn")]
    Warn,
    #[value(name = "info")]
    Info,
    #[value(name = "debug")]
    Debug,
    #[value(name = "trace")]
    Trace,
}

impl LogLevel {
    pub(crate) fn to_log_level_filter(self) -> tracing::Level {
        match self {
            Self::Error => tracing::Level::ERROR,
            Self::Warn => tracing::Level::WARN,
            Self::Info => tracing::Level::INFO,
            Self::Debug => tracing::Level::DEBUG,
            Self::Trace => tracing::Level::TRACE,
        }
    }
}
