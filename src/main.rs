use std::{net::SocketAddr, path::PathBuf};

use clap::{Parser, Subcommand};
use stubrecorder::{
    canonical::canonicalize,
    config::Config,
    logging,
    recorder::RecorderOptions,
    store::{load_stubs, write_stubs},
    stub::StubRecord,
};

#[derive(Debug, Parser)]
#[command(name = "stubrecorder")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the recording proxy.
    Serve {
        /// Optional path to config TOML. If omitted, default discovery is used.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Override the stub file requests are recorded into.
        #[arg(long)]
        stubs: Option<PathBuf>,
        /// Record request and response headers.
        #[arg(long)]
        include_headers: bool,
        /// Override log level (trace, debug, info, warn, error, off).
        #[arg(long)]
        log_level: Option<String>,
    },
    /// Inspect or rewrite a stub file.
    Stubs {
        /// Optional path to config TOML. If omitted, default discovery is used unless `--stubs`
        /// is given.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Stub file to operate on.
        #[arg(long)]
        stubs: Option<PathBuf>,
        #[command(subcommand)]
        action: StubsCommand,
    },
}

#[derive(Debug, Subcommand, Clone, Copy, PartialEq, Eq)]
enum StubsCommand {
    /// Print `METHOD url status` for every stored stub.
    List,
    /// Apply the configured transform, sort and rewrite the file.
    Canonicalize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum StubsCommandOutcome {
    Listed { lines: Vec<String> },
    Canonicalized { path: PathBuf, stubs: usize },
}

/// The stub file and options a `stubs` subcommand works with.
fn resolve_stubs_target(
    config_path: Option<PathBuf>,
    stubs: Option<PathBuf>,
) -> anyhow::Result<(PathBuf, RecorderOptions)> {
    match (config_path, stubs) {
        (None, Some(stubs)) => Ok((stubs, RecorderOptions::default())),
        (config_path, stubs) => {
            let mut config = Config::load(config_path.as_deref())?;
            config.apply_stubs_file_override(stubs);
            let options = config.recorder_options();
            Ok((config.recorder.stubs_file, options))
        }
    }
}

fn run_stubs_command(
    stubs_path: PathBuf,
    options: &RecorderOptions,
    command: StubsCommand,
) -> anyhow::Result<StubsCommandOutcome> {
    let stubs = load_stubs(&stubs_path)?;
    match command {
        StubsCommand::List => Ok(StubsCommandOutcome::Listed {
            lines: stubs.iter().map(list_line).collect(),
        }),
        StubsCommand::Canonicalize => {
            let stubs = canonicalize(stubs, options.transform.as_ref());
            write_stubs(&stubs_path, &stubs)?;
            Ok(StubsCommandOutcome::Canonicalized {
                path: stubs_path,
                stubs: stubs.len(),
            })
        }
    }
}

fn list_line(stub: &StubRecord) -> String {
    format!("{} {}", stub.key(), stub.response.status)
}

fn print_stubs_command_outcome(outcome: StubsCommandOutcome) {
    match outcome {
        StubsCommandOutcome::Listed { lines } => {
            for line in lines {
                println!("{line}");
            }
        }
        StubsCommandOutcome::Canonicalized { path, stubs } => {
            println!("canonicalized {stubs} stubs in {}", path.display());
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            config,
            stubs,
            include_headers,
            log_level,
        } => {
            let mut config = Config::load(config.as_deref())?;
            config.apply_stubs_file_override(stubs);
            config.recorder.include_headers |= include_headers;
            logging::init(Some(&config), log_level.as_deref())?;
            let proxy = stubrecorder::proxy::serve(&config).await?;
            eprintln!("{}", startup_summary(&config, proxy.listen_addr));
            tokio::signal::ctrl_c().await?;
            proxy.shutdown().await;
        }
        Command::Stubs {
            config,
            stubs,
            action,
        } => {
            let (stubs_path, options) = resolve_stubs_target(config, stubs)?;
            let outcome = run_stubs_command(stubs_path, &options, action)?;
            print_stubs_command_outcome(outcome);
        }
    }

    Ok(())
}

fn startup_summary(config: &Config, proxy_listen_addr: SocketAddr) -> String {
    let upstream = config.proxy.upstream.as_deref().unwrap_or("request target");
    let redaction = match config.recorder.redact.as_ref() {
        Some(redact) => format!(
            "headers={},body_keys={}",
            redact.headers.len(),
            redact.body_keys.len()
        ),
        None => "disabled".to_owned(),
    };

    format!(
        "startup config: proxy_listen={}, upstream={}, stubs_file={}, include_headers={}, duplicate_keys={:?}, redaction={}",
        proxy_listen_addr,
        upstream,
        config.recorder.stubs_file.display(),
        config.recorder.include_headers,
        config.recorder.duplicate_keys,
        redaction
    )
}
