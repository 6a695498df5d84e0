#![warn(
    rust_2018_idioms,
    trivial_casts,
    trivial_numeric_casts,
    unreachable_pub,
    unused_qualifications
)]
#![allow(clippy::enum_variant_names, clippy::type_complexity)]

use std::process::ExitCode;

mod cli;
mod convert;
mod git;
mod make_meta;
mod params_file;
mod svn;
mod user_map;

pub(crate) type FHashMap<K, V> = std::collections::HashMap<K, V, foldhash::fast::RandomState>;
pub(crate) type FHashSet<T> = std::collections::HashSet<T, foldhash::fast::RandomState>;

enum RunError {
    Generic,
    Usage,
}

fn main() -> ExitCode {
    match main_inner() {
        Ok(()) => ExitCode::SUCCESS,
        Err(RunError::Generic) => ExitCode::from(1),
        Err(RunError::Usage) => ExitCode::from(2),
    }
}

fn main_inner() -> Result<(), RunError> {
    let args = match <cli::Cli as clap::Parser>::try_parse() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{e}");
            return Err(RunError::Usage);
        }
    };

    let stderr_log_level = args
        .stderr_log_level
        .unwrap_or(cli::LogLevel::Warn)
        .to_log_level_filter();
    let file_log_level = args.file_log_level.map(cli::LogLevel::to_log_level_filter);

    if let Err(e) = init_logger(stderr_log_level, args.log_file.as_deref(), file_log_level) {
        eprintln!("failed to initialize logging: {e}");
        return Err(RunError::Generic);
    }

    let params_raw = match std::fs::read_to_string(&args.conv_params) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("failed to read {:?}: {e}", args.conv_params);
            return Err(RunError::Generic);
        }
    };
    let params: params_file::ConvParams = match toml::from_str(&params_raw) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("failed to parse {:?}: {e}", args.conv_params);
            return Err(RunError::Generic);
        }
    };

    let user_map = match params.user_map_file {
        None => user_map::UserMap::new(),
        Some(ref user_map_path) => {
            let user_map_path = if user_map_path.is_relative() {
                let conv_params_path_parent = args.conv_params.parent().ok_or_else(|| {
                    tracing::error!("invalid parameters file path: {:?}", args.conv_params);
                    RunError::Generic
                })?;
                conv_params_path_parent.join(user_map_path)
            } else {
                user_map_path.to_path_buf()
            };

            let user_map_file = std::fs::OpenOptions::new()
                .read(true)
                .open(&user_map_path)
                .map_err(|e| {
                    tracing::error!("failed to open user map {user_map_path:?}: {e}");
                    RunError::Generic
                })?;

            user_map::UserMap::parse(&mut std::io::BufReader::new(user_map_file)).map_err(|e| {
                tracing::error!("failed to read user map {user_map_path:?}: {e}");
                RunError::Generic
            })?
        }
    };

    let user_fallback_template = params.user_fallback_template.as_deref().unwrap_or(
        r#"{{ svn_author or "no-author" }} <{{ svn_author or "no-author" }}{% if svn_uuid %}@{{ svn_uuid }}{% endif %}>"#,
    );
    let commit_msg_template = params
        .commit_msg_template
        .as_deref()
        .unwrap_or(indoc::indoc! {r#"
            {% if svn_log %}{{ svn_log }}

            {% endif %}svn:revision:{{ svn_rev }}{% if svn_branch %}
            svn:branch:{{ svn_branch }}{% endif %}
        "#});
    let tag_msg_template = params
        .tag_msg_template
        .as_deref()
        .unwrap_or(indoc::indoc! {r#"
           {% if svn_log %}{{ svn_log }}

           {% endif %}svn:revision:{{ svn_rev }}
           svn:tag:{{ svn_tag }}
        "#});

    let meta_maker = make_meta::GitMetaMaker::new(
        &user_map,
        params.allow_unmapped_authors,
        user_fallback_template,
        commit_msg_template,
        tag_msg_template,
    )
    .map_err(|e| {
        tracing::error!("{e}");
        RunError::Generic
    })?;

    let tools = git::SystemTools;
    convert::convert(convert::ConvertArgs {
        params: &params,
        meta_maker: &meta_maker,
        tools: &tools,
        src: &args.src,
        dest: &args.dest,
        svn_repo: args.svn_repo.as_deref(),
        verify_every: args.verify_every,
    })
    .map_err(|e| {
        tracing::error!("conversion failed: {e}");
        RunError::Generic
    })
}

fn init_logger(
    stderr_level: tracing::Level,
    file_path: Option<&std::path::Path>,
    file_level: Option<tracing::Level>,
) -> Result<(), std::io::Error> {
    use tracing_subscriber::layer::{Layer as _, SubscriberExt as _};
    use tracing_subscriber::util::SubscriberInitExt as _;

    let stderr_filter = tracing_subscriber::filter::LevelFilter::from_level(stderr_level);
    let stderr_sub = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .with_filter(stderr_filter);

    let file_sub = if let Some(file_path) = file_path {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(file_path)?;

        let filter = tracing_subscriber::filter::LevelFilter::from_level(
            file_level.unwrap_or(tracing::Level::DEBUG),
        );
        Some(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file)
                .with_filter(filter),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(stderr_sub)
        .with(file_sub)
        .init();

    Ok(())
}
