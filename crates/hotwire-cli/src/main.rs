#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::too_many_lines)]

mod commands;
mod logging;

use clap::Parser;
use miette::{IntoDiagnostic, Result};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "hotwire")]
#[command(author, version, about = "Incremental dev server with hot module replacement", long_about = None)]
struct Cli {
    /// Increase logging verbosity (-v for DEBUG, -vv for TRACE)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Emit JSON formatted output (logs and command results)
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the dev server
    Dev {
        /// Project root (defaults to the current directory)
        root: Option<PathBuf>,

        /// Port to listen on (overrides the config file)
        #[arg(long, short = 'p', env = "HOTWIRE_PORT")]
        port: Option<u16>,

        /// Host to bind to (overrides the config file)
        #[arg(long, env = "HOTWIRE_HOST")]
        host: Option<String>,

        /// Path to config file (overrides auto-discovery)
        #[arg(long, short = 'c', value_name = "FILE")]
        config: Option<PathBuf>,

        /// Re-bundle dependencies even if the cache is current
        #[arg(long)]
        force: bool,
    },

    /// Pre-bundle dependencies once and print a summary
    Optimize {
        /// Project root (defaults to the current directory)
        root: Option<PathBuf>,

        /// Path to config file (overrides auto-discovery)
        #[arg(long, short = 'c', value_name = "FILE")]
        config: Option<PathBuf>,

        /// Re-bundle dependencies even if the cache is current
        #[arg(long)]
        force: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose, cli.json);

    let runtime = tokio::runtime::Runtime::new().into_diagnostic()?;
    match cli.command {
        Commands::Dev {
            root,
            port,
            host,
            config,
            force,
        } => runtime.block_on(commands::dev::run(commands::dev::DevAction {
            project: commands::ProjectArgs { root, config, force },
            port,
            host,
        })),
        Commands::Optimize {
            root,
            config,
            force,
        } => runtime.block_on(commands::optimize::run(
            commands::ProjectArgs { root, config, force },
            cli.json,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_dev_flags() {
        let cli = Cli::try_parse_from(["hotwire", "-vv", "dev", "--port", "4000", "--force", "app"]).unwrap();
        assert_eq!(cli.verbose, 2);
        let Commands::Dev {
            root, port, force, ..
        } = cli.command
        else {
            panic!("expected dev");
        };
        assert_eq!(root, Some(PathBuf::from("app")));
        assert_eq!(port, Some(4000));
        assert!(force);
    }

    #[test]
    #[serial]
    fn test_port_from_env() {
        std::env::set_var("HOTWIRE_PORT", "5173");
        let cli = Cli::try_parse_from(["hotwire", "dev"]);
        std::env::remove_var("HOTWIRE_PORT");
        let Commands::Dev { port, .. } = cli.unwrap().command else {
            panic!("expected dev");
        };
        assert_eq!(port, Some(5173));
    }

    #[test]
    #[serial]
    fn test_flag_beats_env() {
        std::env::set_var("HOTWIRE_HOST", "0.0.0.0");
        let cli = Cli::try_parse_from(["hotwire", "dev", "--host", "127.0.0.1"]);
        std::env::remove_var("HOTWIRE_HOST");
        let Commands::Dev { host, .. } = cli.unwrap().command else {
            panic!("expected dev");
        };
        assert_eq!(host.as_deref(), Some("127.0.0.1"));
    }

    #[test]
    fn test_optimize_json_is_global() {
        let cli = Cli::try_parse_from(["hotwire", "optimize", "--json", "."]).unwrap();
        assert!(cli.json);
        assert!(matches!(cli.command, Commands::Optimize { .. }));
    }
}
