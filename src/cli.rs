//! Command-line interface built on clap.
//!
//! [`Cli`] carries the subcommands in [`Command`] and the global flags
//! (`--config`, `--verbose`).

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// GibbsFlow: drives geometries through opt, gas, solv and sp stages and
/// records the resulting free energies.
#[derive(Debug, Parser)]
#[command(name = "gibbsflow", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Configuration file (defaults to ./gibbsflow.toml when present).
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    /// Enables debug logging.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Runs the control loop until Ctrl+C twice or SIGTERM.
    Run,

    /// Runs a single reconcile cycle and exits.
    Once,

    /// Prints the dashboard from the status file.
    Status,

    /// Parses one engine report and prints what the pipeline would see.
    Inspect {
        /// Path to a Gaussian or ORCA output file.
        report: PathBuf,

        /// Apply the optimization checks (convergence, imaginary modes).
        #[arg(long, default_value_t = false)]
        opt: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_parses_run_subcommand() {
        let cli = Cli::parse_from(["gibbsflow", "run"]);
        assert!(matches!(cli.command, Command::Run));
        assert!(cli.config.is_none());
        assert!(!cli.verbose);
    }

    #[test]
    fn cli_parses_global_flags() {
        let cli = Cli::parse_from(["gibbsflow", "--config", "lab.toml", "--verbose", "once"]);
        assert!(cli.verbose);
        assert_eq!(cli.config.unwrap(), PathBuf::from("lab.toml"));
        assert!(matches!(cli.command, Command::Once));
    }

    #[test]
    fn cli_parses_inspect_subcommand() {
        let cli = Cli::parse_from(["gibbsflow", "inspect", "data/opt/water_opt.out", "--opt"]);
        match cli.command {
            Command::Inspect { report, opt } => {
                assert_eq!(report, PathBuf::from("data/opt/water_opt.out"));
                assert!(opt);
            }
            _ => panic!("expected Inspect command"),
        }
    }

    #[test]
    fn cli_verify() {
        Cli::command().debug_assert();
    }
}
