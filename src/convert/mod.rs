use std::path::Path;

use crate::git::{RepoTools, ToolError};
use crate::make_meta::GitMetaMaker;
use crate::params_file::ConvParams;
use crate::svn::{classify, dump, source};

mod analyze;
mod context;
mod driver;
mod export;
mod path_states;

pub(crate) use context::ConversionContext;

#[derive(Debug)]
pub(crate) enum ConvertError {
    Io(std::io::Error),
    Source(source::OpenError),
    Format(dump::ReadError),
    UnresolvedReference {
        rev: u32,
        path: Vec<u8>,
        detail: String,
    },
    Apply {
        rev: u32,
        error: ToolError,
    },
    Verification {
        rev: u32,
    },
    Configuration(String),
    Tool(ToolError),
}

impl From<std::io::Error> for ConvertError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<dump::ReadError> for ConvertError {
    fn from(e: dump::ReadError) -> Self {
        Self::Format(e)
    }
}

impl std::fmt::Display for ConvertError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "i/o error: {e}"),
            Self::Source(e) => write!(f, "failed to open dump source: {e}"),
            Self::Format(e) => write!(f, "malformed dump: {e}"),
            Self::UnresolvedReference { rev, path, detail } => write!(
                f,
                "r{rev}: unresolved content for \"{}\": {detail}",
                path.escape_ascii(),
            ),
            Self::Apply { rev, error } => {
                write!(f, "r{rev}: failed to apply fast-import commands: {error}")
            }
            Self::Verification { rev } => {
                write!(f, "r{rev}: converted contents do not match repository")
            }
            Self::Configuration(msg) => write!(f, "configuration error: {msg}"),
            Self::Tool(e) => write!(f, "external tool failed: {e}"),
        }
    }
}

pub(crate) struct ConvertArgs<'a> {
    pub(crate) params: &'a ConvParams,
    pub(crate) meta_maker: &'a GitMetaMaker<'a>,
    pub(crate) tools: &'a dyn RepoTools,
    pub(crate) src: &'a Path,
    pub(crate) dest: &'a Path,
    pub(crate) svn_repo: Option<&'a str>,
    pub(crate) verify_every: Option<u32>,
}

pub(crate) fn convert(args: ConvertArgs<'_>) -> Result<(), ConvertError> {
    std::fs::create_dir_all(args.dest)?;

    let spool_path = args.dest.join("dump.spool");
    let dump_path =
        source::prepare_dump(args.src, &spool_path).map_err(ConvertError::Source)?;

    tracing::info!("loading dump from {dump_path:?}");
    let dump_file = std::fs::OpenOptions::new().read(true).open(&dump_path)?;
    let mut model = dump::load(dump_file)?;

    let layout = classify::Layout::new(
        args.params
            .projects
            .iter()
            .map(|p| p.as_bytes().to_vec())
            .chain(std::iter::once(args.params.project.as_bytes().to_vec())),
        args.params
            .branch_mappings
            .iter()
            .map(|(k, v)| (k.as_bytes().to_vec(), v.as_bytes().to_vec())),
        args.params
            .tag_mappings
            .iter()
            .map(|(k, v)| (k.as_bytes().to_vec(), v.as_bytes().to_vec())),
    );

    let mut ctx = ConversionContext::load(args.dest)?;
    let analysis = analyze::run(&mut model, &layout, args.params, &mut ctx);

    tracing::info!(
        "loaded dump up to r{} ({} nodes), resuming after r{}",
        model.head_rev(),
        model.nodes.len(),
        ctx.checkpoint,
    );

    driver::run(driver::DriverArgs {
        model: &model,
        analysis: &analysis,
        layout: &layout,
        params: args.params,
        meta_maker: args.meta_maker,
        tools: args.tools,
        dest: args.dest,
        dump_path: &dump_path,
        svn_repo: args.svn_repo,
        verify_every: args.verify_every.unwrap_or(args.params.verify_every),
        ctx: &mut ctx,
    })?;

    ctx.save(args.dest)?;
    Ok(())
}
