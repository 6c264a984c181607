use std::env;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use clap::ValueEnum;
use tracing::Level;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::EnvFilter;

pub const LOG_FILTER_ENV: &str = "RELAY_LOG_FILTER";
pub const TRACE_DEPS_ENV: &str = "RELAY_TRACE_DEPS";

/// Verbosity accepted by `--log-level`, quietest first.
#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct LogConfig {
    pub level: LogLevel,
    pub file: Option<PathBuf>,
}

#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("failed to open log file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to configure logger: {0}")]
    Configure(String),
}

static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Installs the global subscriber. Later calls are no-ops.
pub fn init(config: &LogConfig) -> Result<(), InitError> {
    if GUARD.get().is_some() {
        return Ok(());
    }

    let level = Level::from(config.level);
    let plan = match env::var(LOG_FILTER_ENV) {
        Ok(custom) => FilterPlan {
            directives: vec![custom],
            throttled: false,
        },
        Err(_) => FilterPlan::for_level(level, env_flag(TRACE_DEPS_ENV)),
    };
    let (writer, guard) = open_writer(config.file.as_deref())?;

    let verbose = config.level >= LogLevel::Debug;
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(plan.render()))
        .with_target(verbose)
        .with_thread_ids(level == Level::TRACE)
        .with_ansi(config.file.is_none())
        .with_writer(writer)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|err| InitError::Configure(err.to_string()))?;

    let _ = GUARD.set(guard);
    if plan.throttled {
        tracing::debug!(
            "dependency trace noise suppressed; set {TRACE_DEPS_ENV}=1 or {LOG_FILTER_ENV} to override"
        );
    }
    Ok(())
}

fn open_writer(file: Option<&Path>) -> Result<(NonBlocking, WorkerGuard), InitError> {
    let Some(path) = file else {
        return Ok(tracing_appender::non_blocking(std::io::stderr()));
    };
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map(tracing_appender::non_blocking)
        .map_err(|source| InitError::Io {
            path: path.to_path_buf(),
            source,
        })
}

/// Our own crates; only these follow `--log-level` past info.
const OWN_TARGETS: &[&str] = &[
    "relay_dial",
    "relay_session",
    "transport_websocket",
    "transport_webrtc",
];

/// Capped at info under trace unless `RELAY_TRACE_DEPS` is set.
const NOISY_DEPENDENCIES: &[&str] = &[
    "tokio_tungstenite",
    "tungstenite",
    "webrtc_ice",
    "webrtc_sctp",
    "webrtc_dtls",
    "webrtc_mdns",
    "webrtc_srtp",
    "rtcp",
    "mio",
];

#[derive(Debug, PartialEq, Eq)]
struct FilterPlan {
    directives: Vec<String>,
    throttled: bool,
}

impl FilterPlan {
    fn for_level(level: Level, allow_dependency_traces: bool) -> Self {
        let name = level.as_str().to_ascii_lowercase();
        if level < Level::DEBUG {
            // tracing orders levels by verbosity: ERROR < WARN < INFO.
            return Self {
                directives: vec![name],
                throttled: false,
            };
        }

        let mut directives = vec!["info".to_string()];
        directives.extend(OWN_TARGETS.iter().map(|target| format!("{target}={name}")));
        let throttled = level == Level::TRACE && !allow_dependency_traces;
        if throttled {
            directives.extend(
                NOISY_DEPENDENCIES
                    .iter()
                    .map(|target| format!("{target}=info")),
            );
        }
        Self {
            directives,
            throttled,
        }
    }

    fn render(&self) -> String {
        self.directives.join(",")
    }
}

fn env_flag(key: &str) -> bool {
    env::var(key).is_ok_and(|value| !value.is_empty() && value != "0")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::level_filters::LevelFilter;

    #[test]
    fn quiet_levels_use_the_plain_directive() {
        assert_eq!(FilterPlan::for_level(Level::WARN, false).render(), "warn");
        assert_eq!(FilterPlan::for_level(Level::ERROR, false).render(), "error");
        assert_eq!(FilterPlan::for_level(Level::INFO, true).render(), "info");
    }

    #[test]
    fn debug_raises_only_our_targets() {
        let plan = FilterPlan::for_level(Level::DEBUG, false);
        let filter = plan.render();
        assert!(filter.starts_with("info,"));
        assert!(filter.contains("relay_session=debug"));
        assert!(filter.contains("transport_websocket=debug"));
        assert!(!plan.throttled);
    }

    #[test]
    fn trace_throttles_dependency_noise_unless_allowed() {
        let plan = FilterPlan::for_level(Level::TRACE, false);
        assert!(plan.throttled);
        assert!(plan.directives.contains(&"webrtc_ice=info".to_string()));
        assert!(plan.directives.contains(&"relay_dial=trace".to_string()));

        let plan = FilterPlan::for_level(Level::TRACE, true);
        assert!(!plan.throttled);
        assert!(!plan.render().contains("webrtc_ice=info"));
    }

    #[test]
    fn levels_order_by_verbosity() {
        assert!(LogLevel::Trace > LogLevel::Debug);
        assert!(LogLevel::Warn < LogLevel::Info);
        assert_eq!(Level::from(LogLevel::default()), Level::WARN);
        assert_eq!(LevelFilter::from_level(LogLevel::Trace.into()), LevelFilter::TRACE);
    }
}
