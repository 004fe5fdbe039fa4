//! CLI module for execstream
//!
//! - `migrate`: create tables and the change-notification trigger
//! - `watch`: stream one test execution's events as JSON lines

use clap::{Parser, Subcommand};
use execstream_core::TestExecutionId;

use crate::settings::AppConfig;

pub mod migrate;
pub mod watch;

/// Execstream CLI
#[derive(Parser, Debug)]
#[command(name = "execstream")]
#[command(about = "Real-time test execution event stream")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create tables and the notification trigger
    Migrate,
    /// Print the events of one test execution until interrupted
    Watch {
        /// Test execution to follow
        #[arg(value_name = "TEST_EXECUTION_ID")]
        test_execution_id: TestExecutionId,
    },
}

/// Run the CLI command
pub async fn run(cli: Cli, config: AppConfig) -> anyhow::Result<()> {
    match cli.command {
        Some(Commands::Migrate) => migrate::run(&config).await,
        Some(Commands::Watch { test_execution_id }) => watch::run(&config, test_execution_id).await,
        None => {
            let mut cmd = <Cli as clap::CommandFactory>::command();
            cmd.print_help()?;
            println!();
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_watch() {
        let id = TestExecutionId::new();
        let cli = Cli::try_parse_from(["execstream", "watch", &id.to_string()]).unwrap();
        match cli.command {
            Some(Commands::Watch { test_execution_id }) => assert_eq!(test_execution_id, id),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_watch_rejects_bad_id() {
        assert!(Cli::try_parse_from(["execstream", "watch", "not-a-uuid"]).is_err());
    }

    #[test]
    fn test_cli_definition_is_valid() {
        <Cli as clap::CommandFactory>::command().debug_assert();
    }
}
