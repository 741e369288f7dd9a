//! Subscriber setup for the driver's `tracing` events.
//!
//! Library code only emits events and spans; installing a subscriber is left to
//! the binary (or an embedding application) through [`init`]. Output goes to
//! stderr so readings printed on stdout stay machine-readable.
//!
//! `RUST_LOG` takes precedence over the configured level, e.g.
//! `RUST_LOG=smu2450::connection=debug` shows every command sent.

use crate::config::LoggingConfig;
use crate::error::{SmuError, SmuResult};
use serde::{Deserialize, Serialize};
use std::io::IsTerminal;
use std::str::FromStr;
use tracing::{debug, Level, Subscriber};
use tracing_subscriber::{
    filter::LevelFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Log line layout
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Multi-line, coloured when stderr is a terminal
    #[default]
    Pretty,
    /// One line per event
    Compact,
    /// One JSON object per event
    Json,
}

/// Parse `trace`, `debug`, `info`, `warn` or `error` (any case).
pub fn parse_log_level(level: &str) -> SmuResult<Level> {
    Level::from_str(level).map_err(|_| {
        SmuError::configuration(format!(
            "log level '{level}' must be one of trace, debug, info, warn, error"
        ))
    })
}

fn env_filter(level: Level) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(level).into())
        .from_env_lossy()
}

fn fmt_layer<S>(config: &LoggingConfig) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    // span close events carry the time spent in each session operation
    let spans = if config.span_timing {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };
    let layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_span_events(spans);

    match config.format {
        OutputFormat::Pretty => layer
            .pretty()
            .with_ansi(std::io::stderr().is_terminal())
            .boxed(),
        OutputFormat::Compact => layer.compact().with_ansi(false).with_target(false).boxed(),
        OutputFormat::Json => layer.json().with_current_span(true).boxed(),
    }
}

/// Install the global subscriber described by the `[logging]` section.
///
/// Calling it again once a subscriber is installed is a no-op.
pub fn init(config: &LoggingConfig) -> SmuResult<()> {
    let level = parse_log_level(&config.level)?;
    let installed = tracing_subscriber::registry()
        .with(env_filter(level))
        .with(fmt_layer(config))
        .try_init();
    if let Err(err) = installed {
        debug!(%err, "Keeping the existing global subscriber");
    }
    Ok(())
}
