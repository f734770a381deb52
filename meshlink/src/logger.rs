//! Logging module.
//!
//! The station logs with one `target` per subsystem (`mesh`, `registry`,
//! `relay`, `queue`, `scheduler`, `discovery`, `p2p`, `node`), and verbosity
//! is configured per target: a spec like `info,mesh=debug,discovery=warn`
//! sets a default level and overrides it for the named subsystems. Specs
//! come from the daemon's `--log` flag or the `RUST_LOG` environment
//! variable.
//!
//! Records are written to standard error as colored, timestamped lines with
//! the subsystem in the gutter, eg.
//!
//! ```text
//! 2024-04-02T10:11:12.345+00:00 INFO  discovery  Registered with rendezvous service
//! ```
use std::io::{self, Write};
use std::str::FromStr;

use chrono::prelude::*;
use colored::*;
use log::{Level, Log, Metadata, Record, SetLoggerError};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("invalid log directive `{0}`")]
pub struct ParseError(String);

/// Verbosity configuration: a default level plus per-subsystem overrides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    default: Level,
    overrides: Vec<(String, Level)>,
}

impl Config {
    /// A flat configuration: every subsystem at `level`.
    pub fn level(level: Level) -> Self {
        Self {
            default: level,
            overrides: Vec::new(),
        }
    }

    /// Quieten or boost a single subsystem.
    pub fn with_target(mut self, target: impl Into<String>, level: Level) -> Self {
        self.overrides.push((target.into(), level));
        self
    }

    /// The level in effect for a target.
    pub fn target_level(&self, target: &str) -> Level {
        self.overrides
            .iter()
            .find(|(t, _)| t == target)
            .map(|(_, level)| *level)
            .unwrap_or(self.default)
    }

    /// The most verbose level any target can emit at; everything above it
    /// can be filtered out globally.
    fn max_level(&self) -> Level {
        self.overrides
            .iter()
            .map(|(_, level)| *level)
            .max()
            .map_or(self.default, |o| o.max(self.default))
    }
}

impl FromStr for Config {
    type Err = ParseError;

    /// Parse a spec of comma-separated directives: a bare level sets the
    /// default, `target=level` overrides one subsystem. Later directives
    /// win. Eg. `info,mesh=debug,discovery=warn`.
    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let mut config = Config::level(Level::Info);

        for directive in spec.split(',').map(str::trim).filter(|d| !d.is_empty()) {
            match directive.split_once('=') {
                None => {
                    config.default = parse_level(directive)?;
                }
                Some((target, level)) if !target.is_empty() => {
                    let level = parse_level(level)?;
                    config.overrides.retain(|(t, _)| t != target);
                    config.overrides.push((target.to_owned(), level));
                }
                Some(_) => return Err(ParseError(directive.to_owned())),
            }
        }
        Ok(config)
    }
}

fn parse_level(s: &str) -> Result<Level, ParseError> {
    Level::from_str(s).map_err(|_| ParseError(s.to_owned()))
}

struct Logger {
    config: Config,
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.config.target_level(metadata.target())
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let time = Local::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let level = match record.level() {
            Level::Error => "ERROR".red().bold(),
            Level::Warn => "WARN ".yellow(),
            Level::Info => "INFO ".normal(),
            Level::Debug => "DEBUG".dimmed(),
            Level::Trace => "TRACE".white().dimmed(),
        };
        let line = format!(
            "{} {level} {:<10} {}",
            time.dimmed(),
            record.target().cyan(),
            record.args()
        );
        let line = match record.level() {
            Level::Debug | Level::Trace => line.dimmed(),
            _ => line.normal(),
        };
        writeln!(io::stderr(), "{line}").ok();
    }

    fn flush(&self) {}
}

/// Initialize the global logger.
pub fn init(config: Config) -> Result<(), SetLoggerError> {
    log::set_max_level(config.max_level().to_level_filter());
    log::set_boxed_logger(Box::new(Logger { config }))?;

    Ok(())
}

/// Configuration from the `RUST_LOG` environment variable, if present and
/// valid.
pub fn env_config() -> Option<Config> {
    std::env::var("RUST_LOG").ok()?.parse().ok()
}
