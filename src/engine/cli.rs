//! Hotpatch CLI Module
//! Command-line interface for patch building and client updates

pub mod formatter;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "hotpatch")]
#[command(version)]
#[command(about = "Incremental content patch builder and updater", long_about = None)]
pub struct Cli {
    /// Project directory (defaults to current directory)
    #[arg(short, long, global = true)]
    pub project: Option<PathBuf>,

    /// Output format (json for scripting)
    #[arg(short, long, global = true, default_value = "text")]
    pub format: OutputFormat,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write a default hotpatch.config.json
    Init {
        /// Package name
        #[arg(long, default_value = "DefaultPackage")]
        package: String,

        /// Overwrite an existing config
        #[arg(long)]
        force: bool,
    },

    /// Record a new build version from a bundle directory
    Snapshot {
        /// Directory holding the built bundles
        #[arg(short, long)]
        bundles: PathBuf,
    },

    /// Diff a version against its predecessor and package the patch
    Diff {
        /// Version to package (defaults to the version marker)
        #[arg(long)]
        version: Option<String>,
    },

    /// List the bundles of a binary manifest
    Inspect {
        /// Path to a .bytes manifest
        manifest: PathBuf,
    },

    /// Run the update pipeline to completion
    Update,

    /// Show local update status
    Status,
}

impl Cli {
    pub fn get_project_dir(&self) -> PathBuf {
        self.project
            .clone()
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_diff_with_globals() {
        let cli = Cli::parse_from(["hotpatch", "diff", "--version", "7", "--format", "json", "-p", "/tmp/game"]);
        assert_eq!(cli.format, OutputFormat::Json);
        assert_eq!(cli.get_project_dir(), PathBuf::from("/tmp/game"));
        assert!(matches!(cli.command, Commands::Diff { version: Some(ref v) } if v == "7"));
    }

    #[test]
    fn test_parse_snapshot_requires_bundles() {
        assert!(Cli::try_parse_from(["hotpatch", "snapshot"]).is_err());
        let cli = Cli::parse_from(["hotpatch", "snapshot", "--bundles", "Build/Android"]);
        assert!(matches!(cli.command, Commands::Snapshot { .. }));
    }
}
