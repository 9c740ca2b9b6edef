// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! The command-line interface of `sigportal-agent`.

use std::path::PathBuf;

use clap::Parser;

/// The sigportal signing agent.
///
/// The agent runs in the background of a user's session and does the signing work a remote
/// signing portal asks for, using the smart cards and keystores available on this machine.
///
/// The portal starts each exchange by handing the user a magic link; whatever handles those
/// links on the desktop passes them on with the `open` subcommand.
///
/// For an example of the configuration format, consult the `config` subcommand.
#[derive(Debug, Parser)]
#[command(version, name = "sigportal-agent")]
pub struct Cli {
    /// The path to the agent's configuration file.
    ///
    /// If no path is provided, "sigportal/agent.toml" in $CONFIGURATION_DIRECTORY is used if
    /// it exists; otherwise the defaults are used. To view the configuration, run the `config`
    /// subcommand.
    #[arg(long, short, env = "SIGPORTAL_AGENT_CONFIG")]
    pub config: Option<PathBuf>,

    /// A set of one or more comma-separated directives to filter logs.
    ///
    /// The general format is "target_name[span_name{field=value}]=level" where level is
    /// one of TRACE, DEBUG, INFO, WARN, ERROR.
    ///
    /// Details: https://docs.rs/tracing-subscriber/0.3.19/tracing_subscriber/filter/struct.EnvFilter.html#directives
    #[arg(
        long,
        env = "SIGPORTAL_AGENT_LOG",
        default_value = "WARN,sigportal=INFO"
    )]
    pub log_filter: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(clap::Subcommand, Debug)]
pub enum Command {
    /// Run the agent.
    Run {
        /// The directory containing PIN and password files.
        ///
        /// Any PIN or password file referenced in the configuration that is not an absolute
        /// path is expected to be in this directory.
        ///
        /// When run under systemd, providing a `ImportCredential=`,
        /// `LoadCredentialEncrypted=`, or `LoadCredential=` directive will
        /// set the environment variable automatically for you.
        #[arg(long, env = "CREDENTIALS_DIRECTORY")]
        credentials_directory: Option<PathBuf>,
    },

    /// Hand a magic link to the running agent.
    ///
    /// The argument is the URL-encoded message from the portal: either a full URL whose
    /// query string carries the `m` (magic link), `l` (locale), and `t` (expiry) fields, or
    /// just the query string.
    Open {
        /// The message from the portal.
        message: String,
    },

    /// See the current agent configuration.
    Config {
        /// The directory containing PIN and password files.
        #[arg(long, env = "CREDENTIALS_DIRECTORY")]
        credentials_directory: Option<PathBuf>,
    },
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn open_takes_message() -> anyhow::Result<()> {
        let cli = Cli::try_parse_from([
            "sigportal-agent",
            "--log-filter",
            "DEBUG",
            "open",
            "m=https%3A%2F%2Fportal.example.com",
        ])?;
        assert_eq!(cli.log_filter, "DEBUG");
        assert!(matches!(
            cli.command,
            Command::Open { message } if message == "m=https%3A%2F%2Fportal.example.com"
        ));
        Ok(())
    }
}
