// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    env,
    io::IsTerminal,
    sync::atomic::{AtomicBool, Ordering},
};

use bon::Builder;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;
use snafu::{ResultExt, Snafu};
use tracing::Subscriber;
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_log::LogTracer;
use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    filter::{self, LevelFilter},
    fmt::MakeWriter,
    layer::SubscriberExt,
    registry::LookupSpan,
};

/// Fallback filter when neither `LoggingOptions::level` nor `RUST_LOG` is set.
const DEFAULT_LOG_TARGETS: &str = "info";

const DEFAULT_UT_LOG_TARGETS: &str = "debug,hyper=warn,hyper_util=warn,tower=warn,reqwest=warn,\
                                      h2=info,axum=info";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum LoggingError {
    #[snafu(display("invalid log filter '{filter}': {source}"))]
    InvalidFilter {
        filter: String,
        source: filter::ParseError,
    },

    #[snafu(display("failed to create rolling log appender in {dir}: {source}"))]
    Appender {
        dir:    String,
        source: tracing_appender::rolling::InitError,
    },

    #[snafu(display("failed to install log tracer: {source}"))]
    LogBridge { source: tracing_log::log::SetLoggerError },

    #[snafu(display("failed to set global tracing subscriber: {source}"))]
    SetGlobal {
        source: tracing::subscriber::SetGlobalDefaultError,
    },
}

/// Configuration options for the logging system.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, SmartDefault, Builder)]
#[serde(default)]
pub struct LoggingOptions {
    /// Directory for rotated log files. Empty disables file logging.
    #[default = ""]
    #[builder(default)]
    pub dir: String,

    /// Filter string such as `"info,rangefetch_downloader=debug"`. Falls back
    /// to `RUST_LOG`, then to `info`.
    pub level: Option<String>,

    #[builder(default)]
    pub log_format: LogFormat,

    /// Maximum number of hourly files kept per log stream (720 = 30 days).
    #[default = 720]
    #[builder(default = 720)]
    pub max_log_files: usize,

    /// Also write to stdout when file logging is enabled.
    #[default = true]
    #[builder(default = true)]
    pub append_stdout: bool,
}

/// Available log output formats.
#[derive(
    Clone, Debug, Copy, PartialEq, Eq, Serialize, Deserialize, Default, derive_more::Display,
)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// One JSON object per event, with the current span and span list.
    Json,

    /// Human-readable text.
    #[default]
    Text,
}

/// Initialize stdout logging with default options.
///
/// The returned guards flush the background writer when dropped; keep them
/// alive for the lifetime of the process.
pub fn init_tracing_subscriber(app_name: &str) -> Result<Vec<WorkerGuard>, LoggingError> {
    init_global_logging(app_name, &LoggingOptions::default())
}

/// Initialize logging for tests.
///
/// Safe to call from every test: the first call installs the subscriber and
/// later calls do nothing. Honours `UNITTEST_LOG_DIR` (default
/// `/tmp/__unittest_logs`) and `UNITTEST_LOG_LEVEL`.
pub fn init_default_ut_logging() {
    static GUARDS: OnceCell<Vec<WorkerGuard>> = OnceCell::new();

    GUARDS.get_or_init(|| {
        let dir =
            env::var("UNITTEST_LOG_DIR").unwrap_or_else(|_| "/tmp/__unittest_logs".to_string());
        let level =
            env::var("UNITTEST_LOG_LEVEL").unwrap_or_else(|_| DEFAULT_UT_LOG_TARGETS.to_string());

        let opts = LoggingOptions::builder()
            .dir(dir.clone())
            .level(level)
            .append_stdout(false)
            .build();

        match init_global_logging("unittest", &opts) {
            Ok(guards) => {
                tracing::info!(dir = %dir, "unit test logging initialized");
                guards
            }
            Err(err) => {
                eprintln!("unit test logging disabled: {err}");
                Vec::new()
            }
        }
    });
}

/// Install the global subscriber described by `opts`.
///
/// Layers: stdout (when `append_stdout` or no `dir`), hourly rolling
/// `{app_name}` files and a separate error-only `{app_name}-err` stream when
/// `dir` is set. All writers are non-blocking.
///
/// Only the first successful call installs anything; subsequent calls return
/// no guards.
pub fn init_global_logging(
    app_name: &str,
    opts: &LoggingOptions,
) -> Result<Vec<WorkerGuard>, LoggingError> {
    static INITIALIZED: AtomicBool = AtomicBool::new(false);

    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return Ok(Vec::new());
    }

    let result = install(app_name, opts);
    if result.is_err() {
        INITIALIZED.store(false, Ordering::SeqCst);
    }
    result
}

fn install(app_name: &str, opts: &LoggingOptions) -> Result<Vec<WorkerGuard>, LoggingError> {
    let filter = parse_filter(opts.level.as_deref())?;
    let mut guards = Vec::new();

    let stdout_layer = if opts.append_stdout || opts.dir.is_empty() {
        let (writer, guard) = tracing_appender::non_blocking(std::io::stdout());
        guards.push(guard);
        Some(fmt_layer(
            opts.log_format,
            writer,
            std::io::stdout().is_terminal(),
        ))
    } else {
        None
    };

    let (file_layer, err_file_layer) = if opts.dir.is_empty() {
        (None, None)
    } else {
        let (writer, guard) =
            tracing_appender::non_blocking(rolling_appender(opts, app_name.to_string())?);
        guards.push(guard);
        let file = fmt_layer(opts.log_format, writer, false);

        let (writer, guard) =
            tracing_appender::non_blocking(rolling_appender(opts, format!("{app_name}-err"))?);
        guards.push(guard);
        let err_file = fmt_layer(opts.log_format, writer, false)
            .with_filter(LevelFilter::ERROR)
            .boxed();

        (Some(file), Some(err_file))
    };

    let subscriber = Registry::default()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .with(err_file_layer);

    LogTracer::init().context(LogBridgeSnafu)?;
    tracing::subscriber::set_global_default(subscriber).context(SetGlobalSnafu)?;

    Ok(guards)
}

/// Resolve the effective filter: explicit level, then `RUST_LOG`, then
/// [`DEFAULT_LOG_TARGETS`].
fn parse_filter(level: Option<&str>) -> Result<filter::Targets, LoggingError> {
    let from_env = env::var(EnvFilter::DEFAULT_ENV).ok();
    let raw = level
        .or(from_env.as_deref())
        .unwrap_or(DEFAULT_LOG_TARGETS);
    raw.parse::<filter::Targets>()
        .context(InvalidFilterSnafu { filter: raw })
}

fn rolling_appender(
    opts: &LoggingOptions,
    prefix: String,
) -> Result<RollingFileAppender, LoggingError> {
    RollingFileAppender::builder()
        .rotation(Rotation::HOURLY)
        .filename_prefix(prefix)
        .max_log_files(opts.max_log_files)
        .build(&opts.dir)
        .context(AppenderSnafu { dir: &opts.dir })
}

fn fmt_layer<S, W>(format: LogFormat, writer: W, ansi: bool) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    match format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_writer(writer)
            .with_ansi(ansi)
            .with_current_span(true)
            .with_span_list(true)
            .boxed(),
        LogFormat::Text => tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_ansi(ansi)
            .boxed(),
    }
}
