//! CLI argument parsing with clap

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand, ValueEnum};

/// proxsafe - restore Proxmox VE and Proxmox Backup Server configuration
#[derive(Parser, Debug)]
#[command(name = "proxsafe")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress log output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Path to proxsafe.yaml (defaults to $PROXSAFE_CONFIG, then /etc/proxsafe/proxsafe.yaml)
    #[arg(short, long, global = true)]
    pub config: Option<Utf8PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run an interactive restore from a backup
    Restore(RestoreArgs),

    /// Decrypt an encrypted backup into a plain bundle
    Decrypt,

    /// Remove scratch directories left behind by earlier runs
    CleanupTemp(CleanupTempArgs),

    /// Put back the files saved in a safety snapshot
    RollbackSnapshot(RollbackSnapshotArgs),

    /// List restorable categories
    Categories(CategoriesArgs),

    /// Show version information
    Version(VersionArgs),
}

#[derive(Args, Debug)]
pub struct RestoreArgs {
    /// Plan only: stop before anything on this host changes
    #[arg(long)]
    pub dry_run: bool,

    /// Print the final report as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct CleanupTempArgs {
    /// Age in hours after which an orphaned directory is removed
    #[arg(long)]
    pub ttl_hours: Option<u64>,
}

#[derive(Args, Debug)]
pub struct RollbackSnapshotArgs {
    /// Safety snapshot archive (tar.gz); defaults to the most recent one
    pub archive: Option<Utf8PathBuf>,

    /// Do not ask for confirmation
    #[arg(short, long)]
    pub yes: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SystemArg {
    Pve,
    Pbs,
}

#[derive(Args, Debug)]
pub struct CategoriesArgs {
    /// Only categories that fit this product
    #[arg(long, value_enum)]
    pub system: Option<SystemArg>,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
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
    fn test_parse_restore_dry_run() {
        let cli = Cli::try_parse_from(["proxsafe", "-v", "restore", "--dry-run"]).unwrap();
        assert_eq!(cli.verbose, 1);
        assert!(matches!(cli.command, Commands::Restore(RestoreArgs { dry_run: true, .. })));
    }

    #[test]
    fn test_parse_cleanup_ttl() {
        let cli = Cli::try_parse_from(["proxsafe", "cleanup-temp", "--ttl-hours", "6"]).unwrap();
        match cli.command {
            Commands::CleanupTemp(args) => assert_eq!(args.ttl_hours, Some(6)),
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_rollback_snapshot() {
        let cli = Cli::try_parse_from([
            "proxsafe",
            "--config",
            "/tmp/p.yaml",
            "rollback-snapshot",
            "/tmp/proxsafe/restore_backup_20240501_120000.tar.gz",
            "--yes",
        ])
        .unwrap();
        assert_eq!(cli.config.as_deref().map(|p| p.as_str()), Some("/tmp/p.yaml"));
        match cli.command {
            Commands::RollbackSnapshot(args) => {
                assert!(args.yes);
                assert!(args.archive.unwrap().as_str().ends_with(".tar.gz"));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_categories_system() {
        let cli = Cli::try_parse_from(["proxsafe", "categories", "--system", "pbs"]).unwrap();
        match cli.command {
            Commands::Categories(args) => assert_eq!(args.system, Some(SystemArg::Pbs)),
            other => panic!("unexpected command {:?}", other),
        }
        assert!(Cli::try_parse_from(["proxsafe", "categories", "--system", "xen"]).is_err());
    }
}
