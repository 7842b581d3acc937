use anyhow::anyhow;
use tracing::Subscriber;
use tracing_subscriber::{filter::LevelFilter, fmt::MakeWriter, util::SubscriberInitExt as _};

use crate::config::{Config, LogFormat};

/// Resolved logging settings: CLI override, then `[logging]`, then defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LogSettings {
    level: LevelFilter,
    format: LogFormat,
}

impl LogSettings {
    fn resolve(config: Option<&Config>, cli_level_override: Option<&str>) -> anyhow::Result<Self> {
        let logging = config.and_then(|config| config.logging.as_ref());
        let raw_level = cli_level_override
            .or_else(|| logging.and_then(|logging| logging.level.as_deref()))
            .unwrap_or("info");
        let level = raw_level
            .trim()
            .to_ascii_lowercase()
            .parse::<LevelFilter>()
            .map_err(|_| {
                anyhow!(
                    "invalid log level `{raw_level}`; expected one of trace, debug, info, warn, error, off"
                )
            })?;

        Ok(Self {
            level,
            format: logging
                .and_then(|logging| logging.format)
                .unwrap_or(LogFormat::Json),
        })
    }
}

/// Installs the global subscriber on stderr, keeping stdout free for `stubs` output.
pub fn init(config: Option<&Config>, cli_level_override: Option<&str>) -> anyhow::Result<()> {
    let settings = LogSettings::resolve(config, cli_level_override)?;
    match settings.format {
        LogFormat::Json => json_subscriber(settings.level, std::io::stderr).try_init(),
        LogFormat::Pretty => pretty_subscriber(settings.level, std::io::stderr).try_init(),
    }
    .map_err(|err| anyhow!("initialize logging subscriber: {err}"))
}

/// One JSON object per event. Event fields sit at the top level and the enclosing
/// `stubrecorder.record` span contributes `span.method` and `span.url`.
fn json_subscriber<W>(level: LevelFilter, writer: W) -> impl Subscriber + Send + Sync + 'static
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(true)
        .with_writer(writer)
        .json()
        .flatten_event(true)
        .with_current_span(true)
        .with_span_list(false)
        .finish()
}

fn pretty_subscriber<W>(level: LevelFilter, writer: W) -> impl Subscriber + Send + Sync + 'static
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(true)
        .with_writer(writer)
        .pretty()
        .finish()
}
