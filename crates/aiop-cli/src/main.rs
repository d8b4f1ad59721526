//! `aiop_tool`: load and control an AIOP tile through VFIO.
//!
//! ```text
//! USAGE:
//!   aiop_tool [-g dprc.N] load -f <image> [-a <args>] [-r]
//!   aiop_tool [-g dprc.N] reset
//!   aiop_tool [-g dprc.N] status
//!   aiop_tool [-g dprc.N] gettod
//!   aiop_tool [-g dprc.N] settod -t <seconds>
//! ```
//!
//! The container defaults to `$DPRC`, then `dprc.5`.

use aiop_driver::sim::SimPlatform;
use aiop_driver::{Accelerator, ContainerName, LoadRequest, Platform, ResourcePool, VfioPlatform};
use aiop_mc::layout::{CONTAINER_ENV, DEFAULT_CONTAINER};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "aiop_tool", about = "AIOP tile loader and control tool", version)]
struct Cli {
    /// DPRC container holding the AIOP tile.
    #[arg(short = 'g', long = "container", global = true, env = CONTAINER_ENV, default_value = DEFAULT_CONTAINER)]
    container: String,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Debug output (implies verbose).
    #[arg(short, long, global = true)]
    debug: bool,

    /// Run against the in-memory simulated platform.
    #[arg(long, global = true, hide = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
enum Cmd {
    /// Load an AIOP image and start it.
    Load {
        /// AIOP image file.
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
        /// Argument blob passed to the image (at most 512 bytes).
        #[arg(short = 'a', long = "args")]
        args: Option<PathBuf>,
        /// Reset the tile before loading.
        #[arg(short = 'r', long = "reset")]
        reset: bool,
    },
    /// Reset the tile.
    Reset,
    /// Print tile version and state.
    Status,
    /// Print the tile time of day.
    Gettod,
    /// Set the tile time of day.
    Settod {
        /// Time of day.
        #[arg(short = 't', long = "tod")]
        tod: u64,
    },
}

/// Validated tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ToolConfig {
    container: ContainerName,
    level: &'static str,
    simulate: bool,
    command: Cmd,
}

impl ToolConfig {
    fn from_cli(cli: Cli) -> Result<Self> {
        let container = ContainerName::new(cli.container)
            .context("invalid container name (use -g dprc.N or set DPRC)")?;
        let level = if cli.debug {
            "debug"
        } else if cli.verbose {
            "info"
        } else {
            "warn"
        };
        Ok(Self {
            container,
            level,
            simulate: cli.simulate,
            command: cli.command,
        })
    }
}

fn main() -> Result<()> {
    let config = ToolConfig::from_cli(Cli::parse())?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| config.level.into()),
        )
        .init();
    tracing::debug!("{config:?}");

    if config.simulate {
        let sim = SimPlatform::builder()
            .container(config.container.as_str(), 0, &["dpmcp.1", "dpaiop.0"])
            .build();
        run(sim, &config)
    } else {
        run(VfioPlatform::default(), &config)
    }
}

fn run<P: Platform>(platform: P, config: &ToolConfig) -> Result<()> {
    let mut tile = Accelerator::init(platform, ResourcePool::default(), &config.container)
        .with_context(|| format!("cannot bind AIOP tile in {}", config.container))?;

    let outcome = execute(&mut tile, &config.command);
    let released = tile.teardown().context("releasing AIOP session");
    outcome.and(released)
}

fn execute<P: Platform>(tile: &mut Accelerator<P>, command: &Cmd) -> Result<()> {
    match command {
        Cmd::Load { file, args, reset } => {
            let mut request = LoadRequest::new(file).with_reset(*reset);
            if let Some(args) = args {
                request = request.with_args(args);
            }
            match tile.load(&request) {
                Ok(()) => println!("AIOP Image ({}) loaded successfully.", file.display()),
                Err(e) => {
                    println!("AIOP Image ({}) loading failed.", file.display());
                    return Err(e.into());
                }
            }
        }
        Cmd::Reset => {
            tile.reset().context("AIOP tile reset")?;
            println!("AIOP Tile Reset Successful.");
        }
        Cmd::Status => {
            let status = tile.status().context("AIOP tile status")?;
            println!("{status}");
        }
        Cmd::Gettod => {
            let tod = tile.time_of_day().context("reading time of day")?;
            println!("Time of day: {tod}");
        }
        Cmd::Settod { tod } => {
            tile.set_time_of_day(*tod).context("setting time of day")?;
            println!("Time of day set to {tod}.");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<ToolConfig> {
        let cli = Cli::try_parse_from(std::iter::once("aiop_tool").chain(args.iter().copied()))?;
        ToolConfig::from_cli(cli)
    }

    #[test]
    fn load_options() {
        let cfg = parse(&["-g", "dprc.3", "load", "-f", "app.elf", "-a", "args.bin", "-r"]).unwrap();
        assert_eq!(cfg.container.as_str(), "dprc.3");
        assert_eq!(
            cfg.command,
            Cmd::Load {
                file: "app.elf".into(),
                args: Some("args.bin".into()),
                reset: true,
            }
        );
        assert_eq!(cfg.level, "warn");
    }

    #[test]
    fn image_is_mandatory() {
        assert!(parse(&["-g", "dprc.3", "load"]).is_err());
    }

    #[test]
    fn settod_takes_an_unsigned_value() {
        let cfg = parse(&["settod", "-g", "dprc.2", "-t", "1234"]).unwrap();
        assert_eq!(cfg.command, Cmd::Settod { tod: 1234 });
        assert!(parse(&["-g", "dprc.2", "settod", "-t", "-1"]).is_err());
    }

    #[test]
    fn debug_implies_verbose() {
        assert_eq!(parse(&["-g", "dprc.1", "-v", "status"]).unwrap().level, "info");
        assert_eq!(parse(&["-g", "dprc.1", "-d", "status"]).unwrap().level, "debug");
    }

    #[test]
    fn container_name_is_validated() {
        assert!(parse(&["-g", "dprc.123456789", "status"]).is_err());
        assert!(parse(&["-g", "", "status"]).is_err());
    }

    #[test]
    fn simulated_session_runs_every_command() {
        let cfg = parse(&["-g", "dprc.5", "--simulate", "gettod"]).unwrap();
        let sim = SimPlatform::builder()
            .container("dprc.5", 0, &["dpmcp.1", "dpaiop.0"])
            .build();
        run(sim.clone(), &cfg).unwrap();
        for command in [Cmd::Reset, Cmd::Status, Cmd::Settod { tod: 9 }] {
            let cfg = ToolConfig { command, ..cfg.clone() };
            run(sim.clone(), &cfg).unwrap();
        }
        assert_eq!(sim.firmware().time_of_day, 9);
        assert!(sim.held().is_empty());
    }

    #[test]
    fn missing_image_fails_the_command() {
        let sim = SimPlatform::builder()
            .container("dprc.5", 0, &["dpmcp.1", "dpaiop.0"])
            .build();
        let cfg = parse(&["-g", "dprc.5", "load", "-f", "/nonexistent/app.elf"]).unwrap();
        assert!(run(sim.clone(), &cfg).is_err());
        assert!(sim.held().is_empty());
    }
}
