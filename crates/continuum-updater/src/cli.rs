//! Command-line interface for the `continuum` binary.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::package::PackageKind;

#[derive(Parser, Debug)]
#[command(name = "continuum")]
#[command(version, about = "Verify and install updates for the core platform, extensions, and themes")]
pub struct Cli {
    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Config file path
    #[arg(long, global = true, env = "CONTINUUM_CONFIG", default_value = "continuum.toml")]
    pub config: PathBuf,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Check every installed unit for updates
    Check(CheckArgs),
    /// Install a single package
    Install(InstallArgs),
}

#[derive(Parser, Debug)]
pub struct CheckArgs {
    /// Run even if the check interval has not elapsed
    #[arg(long)]
    pub force: bool,
}

#[derive(Parser, Debug)]
pub struct InstallArgs {
    /// Package kind: core, extension, or theme
    #[arg(long)]
    pub kind: PackageKind,

    /// Supplier publishing the package
    #[arg(long)]
    pub supplier: String,

    /// Package name
    #[arg(long)]
    pub package: String,

    /// Install from a local file instead of downloading
    #[arg(long, requires = "local_version")]
    pub local: Option<PathBuf>,

    /// Version of the local file
    #[arg(long = "version", id = "local_version", requires = "local")]
    pub version: Option<String>,

    /// Merkle root of the local file's transparency log entry
    #[arg(long, requires = "local")]
    pub merkle_root: Option<String>,

    /// Base64 supplier signature of the local file
    #[arg(long, requires = "local")]
    pub signature: Option<String>,

    /// Skip signature, Merkle, and checksum verification
    #[arg(long)]
    pub bypass_security: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_check() {
        let cli = Cli::try_parse_from(["continuum", "check", "--force"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("continuum.toml"));
        assert!(matches!(cli.command, Commands::Check(CheckArgs { force: true })));
    }

    #[test]
    fn test_parse_local_install() {
        let cli = Cli::try_parse_from([
            "continuum",
            "--config",
            "/etc/continuum.toml",
            "install",
            "--kind",
            "theme",
            "--supplier",
            "acme",
            "--package",
            "dark",
            "--local",
            "dark.zip",
            "--version",
            "1.2.0",
        ])
        .unwrap();

        let Commands::Install(args) = cli.command else {
            panic!("expected install command");
        };
        assert_eq!(args.kind, PackageKind::Theme);
        assert_eq!(args.local, Some(PathBuf::from("dark.zip")));
        assert!(!args.bypass_security);
    }

    #[test]
    fn test_local_requires_version() {
        assert!(Cli::try_parse_from([
            "continuum", "install", "--kind", "extension", "--supplier", "acme", "--package",
            "widget", "--local", "widget.pkg",
        ])
        .is_err());
    }
}
