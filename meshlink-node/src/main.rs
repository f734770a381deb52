use std::path::PathBuf;
use std::process;

use anyhow::Context;
use crossbeam_channel as chan;

use meshlink::profile::Config;
use meshlink::{logger, profile};
use meshlink_node::Runtime;

pub const NAME: &str = "meshlink-node";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub const HELP_MSG: &str = r#"
Usage

   meshlink-node [<option>...]

   Bridges the locally attached radio with remote stations. Requires a
   station configuration; create one by writing the config file to
   ~/.meshlink/encryptedmeshlink-config.json (or point --config at it).

Options

    --config             <path>      Config file to use (default ~/.meshlink/encryptedmeshlink-config.json)
    --device             <path>      Serial device of the radio (overrides the configuration)
    --log                <spec>      Log verbosity, per subsystem: a default level plus
                                     `target=level` overrides, eg. `info,mesh=debug,discovery=warn`
                                     (default info; also read from RUST_LOG)
    --version                        Print program version
    --help                           Print help
"#;

#[derive(Debug)]
struct Options {
    config: Option<PathBuf>,
    device: Option<String>,
    log: logger::Config,
}

impl Options {
    fn from_env() -> Result<Self, anyhow::Error> {
        use lexopt::prelude::*;

        let mut parser = lexopt::Parser::from_env();
        let mut config = None;
        let mut device = None;
        let mut log = None;

        while let Some(arg) = parser.next()? {
            match arg {
                Long("config") => {
                    let value = parser.value()?;
                    config = Some(PathBuf::from(value));
                }
                Long("device") => {
                    let value = parser.value()?;
                    device = Some(value.string()?);
                }
                Long("log") => {
                    let value = parser.value()?.string()?;
                    log = Some(value.parse::<logger::Config>()?);
                }
                Long("help") | Short('h') => {
                    println!("{HELP_MSG}");
                    process::exit(0);
                }
                Long("version") => {
                    println!("{NAME} {VERSION}");
                    process::exit(0);
                }
                _ => anyhow::bail!(arg.unexpected()),
            }
        }

        Ok(Self {
            config,
            device,
            log: log
                .or_else(logger::env_config)
                .unwrap_or_else(|| logger::Config::level(log::Level::Info)),
        })
    }
}

fn execute() -> anyhow::Result<()> {
    let options = Options::from_env()?;
    logger::init(options.log)?;

    log::info!(target: "node", "Starting {NAME} {VERSION}..");

    let home = profile::home()?;
    let config_path = options.config.unwrap_or_else(|| home.config());
    let mut config = Config::load(&config_path).with_context(|| {
        format!(
            "couldn't load station configuration from {}",
            config_path.display()
        )
    })?;
    log::info!(
        target: "node",
        "Station `{}` ({})",
        config.station_id,
        config.display_name
    );
    if let Some(device) = options.device {
        config.mesh.device_path = Some(device);
        config.mesh.auto_detect = false;
    }

    let (notify, signals) = chan::bounded(1);
    meshlink_signals::install(notify)?;

    Runtime::init(home, config, signals)?.run()?;

    Ok(())
}

fn main() {
    if let Err(err) = execute() {
        // The logger is not installed if option parsing failed.
        if log::max_level() == log::LevelFilter::Off {
            eprintln!("Error: {err:#}");
        } else {
            log::error!(target: "node", "Fatal: {err:#}");
        }
        process::exit(1);
    }
}
