//! Command line interface for the `playwire` binary.

use std::path::PathBuf;

use clap::Parser;

/// Command line arguments for the `playwire` binary.
#[derive(Debug, Parser)]
#[command(name = "playwire", version, about = "Run a playwire socket server")]
pub struct Cli {
    /// Path to a TOML configuration file.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Override the configured listen port.
    #[arg(short, long)]
    pub port: Option<u16>,
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::Cli;

    #[test]
    fn parses_config_and_port() {
        let cli = Cli::parse_from(["playwire", "--config", "server.toml", "--port", "9000"]);
        assert_eq!(cli.config.as_deref(), Some(std::path::Path::new("server.toml")));
        assert_eq!(cli.port, Some(9000));
    }

    #[test]
    fn all_arguments_are_optional() {
        let cli = Cli::parse_from(["playwire"]);
        assert!(cli.config.is_none());
        assert!(cli.port.is_none());
    }
}
