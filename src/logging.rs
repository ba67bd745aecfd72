use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;
use tracing::{Level, Metadata, Subscriber};
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::fmt::{self, MakeWriter};
use tracing_subscriber::prelude::*;

/// Logs at error level with a `fatal` marker. Never exits: the caller decides.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)+) => {
        ::tracing::error!(fatal = true, $($arg)+)
    };
}

#[derive(Debug, Error)]
pub enum LogError {
    #[error("Unknown log level '{0}' (expected fatal, error, warning, info or debug)")]
    UnknownLevel(String),
    #[error("Unknown log target '{0}' (expected stdout or file)")]
    UnknownTarget(String),
    #[error("Cannot open log file {}: {}", .0.display(), .1)]
    File(std::path::PathBuf, #[source] std::io::Error),
    #[error("Logging already initialized: {0}")]
    Init(String),
}

pub fn parse_level(name: &str) -> Result<Level, LogError> {
    match name.to_ascii_lowercase().as_str() {
        "fatal" | "error" => Ok(Level::ERROR),
        "warning" | "warn" => Ok(Level::WARN),
        "info" => Ok(Level::INFO),
        "debug" => Ok(Level::DEBUG),
        _ => Err(LogError::UnknownLevel(name.to_string())),
    }
}

/// Which records reach the log. `fatal` is the error level restricted to [`fatal!`] records.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EventFilter {
    level: Level,
    fatal_only: bool,
}

impl EventFilter {
    pub fn parse(loglevel: &str) -> Result<Self, LogError> {
        Ok(Self {
            level: parse_level(loglevel)?,
            fatal_only: loglevel.eq_ignore_ascii_case("fatal"),
        })
    }

    pub fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= &self.level
            && (!self.fatal_only || metadata.fields().field("fatal").is_some())
    }
}

fn subscriber<W>(filter: EventFilter, writer: W, ansi: bool) -> impl Subscriber + Send + Sync + 'static
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    tracing_subscriber::registry().with(
        fmt::layer()
            .with_ansi(ansi)
            .with_thread_ids(true)
            .with_writer(writer)
            .with_filter(filter_fn(move |metadata| filter.enabled(metadata))),
    )
}

/// Install the global subscriber. `log` records (from rumqttc) are bridged in as well.
pub fn init(loglevel: &str, target: &str, logfile: &Path) -> Result<(), LogError> {
    let filter = EventFilter::parse(loglevel)?;

    let result = match target {
        "stdout" => subscriber(filter, std::io::stdout, true).try_init(),
        "file" => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(logfile)
                .map_err(|e| LogError::File(logfile.to_path_buf(), e))?;
            subscriber(filter, Mutex::new(file), false).try_init()
        }
        other => return Err(LogError::UnknownTarget(other.to_string())),
    };

    result.map_err(|e| LogError::Init(e.to_string()))
}
