use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "foreman", version)]
#[command(about = "Autonomous coding-agent executor")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the executor loop against the tracker
    Run {
        /// Path to the executor config (TOML); defaults to the user config dir
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Execute at most one ready issue, then exit
        #[arg(long)]
        once: bool,
    },

    /// Validate a config file and exit
    Check {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Delete merged sandbox branches older than the retention window
    Gc {
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Branch age cutoff in days
        #[arg(long, default_value_t = 7)]
        retention_days: u32,

        /// Report what would be deleted without deleting
        #[arg(long)]
        dry_run: bool,
    },
}

/// `$XDG_CONFIG_HOME/foreman/foreman.toml` (platform equivalent), falling
/// back to the working directory.
pub fn resolve_config_path(explicit: Option<PathBuf>) -> PathBuf {
    explicit.unwrap_or_else(|| {
        directories::ProjectDirs::from("", "", "foreman")
            .map(|dirs| dirs.config_dir().join("foreman.toml"))
            .unwrap_or_else(|| PathBuf::from("foreman.toml"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_config_path_wins() {
        let explicit = PathBuf::from("/tmp/custom.toml");
        assert_eq!(resolve_config_path(Some(explicit.clone())), explicit);
    }

    #[test]
    fn test_default_config_path_ends_with_expected_file() {
        let path = resolve_config_path(None);
        assert!(path.ends_with("foreman.toml"));
    }
}
