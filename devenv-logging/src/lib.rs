//! Tracing setup for devenv binaries.
//!
//! Configuration comes from the environment:
//! - `LOG_LEVEL`: default filter when `RUST_LOG` is unset (default `info`)
//! - `LOG_FORMAT`: `human` or `json`
//! - `LOG_OUTPUT`: `console`, `file` or `both`
//! - `LOG_FILE_PATH`: file written by the `file`/`both` outputs

use std::{
    env,
    io::{self, Write},
    path::{Path, PathBuf},
};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt::MakeWriter, prelude::*, registry, EnvFilter};

// --- Tee writer: console and file at once ---
struct Tee<A, B> {
    a: A,
    b: B,
}

impl<A: Write, B: Write> Write for Tee<A, B> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let res_a = self.a.write(buf);
        let res_b = self.b.write(buf);
        res_a.or(res_b)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.a.flush()?;
        self.b.flush()
    }
}

#[derive(Clone)]
struct MakeTee<A, B> {
    make_a: A,
    make_b: B,
}

impl<'a, A, B> MakeWriter<'a> for MakeTee<A, B>
where
    A: MakeWriter<'a>,
    B: MakeWriter<'a>,
{
    type Writer = Tee<A::Writer, B::Writer>;

    fn make_writer(&'a self) -> Self::Writer {
        Tee {
            a: self.make_a.make_writer(),
            b: self.make_b.make_writer(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Human,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOutput {
    Console,
    File,
    Both,
}

#[derive(Debug, Clone)]
pub struct LogSettings {
    pub level: String,
    pub format: LogFormat,
    pub output: LogOutput,
    pub file_path: PathBuf,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Human,
            output: LogOutput::Console,
            file_path: PathBuf::from("/tmp/devenv.log"),
        }
    }
}

impl LogSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let format = match lookup("LOG_FORMAT").as_deref() {
            Some("json") => LogFormat::Json,
            _ => LogFormat::Human,
        };
        let output = match lookup("LOG_OUTPUT").as_deref() {
            Some("file") => LogOutput::File,
            Some("both") => LogOutput::Both,
            _ => LogOutput::Console,
        };
        Self {
            level: lookup("LOG_LEVEL").unwrap_or(defaults.level),
            format,
            output,
            file_path: lookup("LOG_FILE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.file_path),
        }
    }

    fn filter(&self) -> EnvFilter {
        let mut filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.level));
        for directive in ["sqlx=warn", "hyper=warn", "tokio=warn"] {
            if let Ok(directive) = directive.parse() {
                filter = filter.add_directive(directive);
            }
        }
        filter
    }
}

/// Initializes the global tracing subscriber from the environment.
///
/// The returned guard must be kept alive for buffered file output to be flushed.
pub fn init_subscriber() -> Option<WorkerGuard> {
    init_with(&LogSettings::from_env())
}

pub fn init_with(settings: &LogSettings) -> Option<WorkerGuard> {
    let subscriber = registry().with(settings.filter());
    let is_json = settings.format == LogFormat::Json;

    let log_dir = settings
        .file_path
        .parent()
        .unwrap_or_else(|| Path::new("/tmp"));
    let log_filename = settings
        .file_path
        .file_name()
        .unwrap_or("devenv.log".as_ref());

    let (result, guard) = match settings.output {
        LogOutput::Console => {
            let layer = tracing_subscriber::fmt::layer().with_writer(io::stdout);
            let result = if is_json {
                subscriber.with(layer.json()).try_init()
            } else {
                subscriber.with(layer).try_init()
            };
            (result, None)
        }
        LogOutput::File => {
            let appender = tracing_appender::rolling::daily(log_dir, log_filename);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            let result = if is_json {
                subscriber.with(layer.json()).try_init()
            } else {
                subscriber.with(layer).try_init()
            };
            (result, Some(guard))
        }
        LogOutput::Both => {
            let appender = tracing_appender::rolling::daily(log_dir, log_filename);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let tee = MakeTee {
                make_a: io::stdout,
                make_b: writer,
            };
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(tee);
            let result = if is_json {
                subscriber.with(layer.json()).try_init()
            } else {
                subscriber.with(layer).try_init()
            };
            (result, Some(guard))
        }
    };

    if let Err(e) = result {
        eprintln!("tracing subscriber already installed: {e}");
    }
    guard
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_settings_defaults() {
        let settings = LogSettings::from_lookup(|_| None);
        assert_eq!(settings.level, "info");
        assert_eq!(settings.format, LogFormat::Human);
        assert_eq!(settings.output, LogOutput::Console);
    }

    #[test]
    fn test_settings_from_env_values() {
        let vars: HashMap<&str, &str> = [
            ("LOG_LEVEL", "debug"),
            ("LOG_FORMAT", "json"),
            ("LOG_OUTPUT", "both"),
            ("LOG_FILE_PATH", "/var/log/devenv/api.log"),
        ]
        .into_iter()
        .collect();
        let settings = LogSettings::from_lookup(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(settings.level, "debug");
        assert_eq!(settings.format, LogFormat::Json);
        assert_eq!(settings.output, LogOutput::Both);
        assert_eq!(settings.file_path, PathBuf::from("/var/log/devenv/api.log"));
    }

    #[test]
    fn test_unknown_output_falls_back_to_console() {
        let settings =
            LogSettings::from_lookup(|k| (k == "LOG_OUTPUT").then(|| "syslog".to_string()));
        assert_eq!(settings.output, LogOutput::Console);
    }
}
