//! CLI argument parsing for lockmount
//!
//! Running the daemon is the default when no subcommand is given.

use crate::trigger::TriggerKind;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Toggle {
    On,
    Off,
}

impl Toggle {
    pub fn is_on(self) -> bool {
        self == Toggle::On
    }
}

#[derive(Parser, Debug)]
#[command(name = "lockmount")]
#[command(about = "🔒 lockmount - unmount removable drives while the session is locked")]
#[command(long_about = "🔒 lockmount - unmount removable drives while the session is locked\n\n\
    Watches screen lock, screensaver, display sleep and system sleep, unmounts\n\
    external volumes when the session goes away and mounts them again when it\n\
    comes back.\n\n\
    Run without arguments to start the daemon.")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Preferences file (defaults to the per-user config directory)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Directory under which external volumes are mounted (repeatable)
    #[arg(long = "volume-root", global = true)]
    pub volume_roots: Vec<PathBuf>,

    /// Write logs to this file instead of stderr
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// 🔒 Run the daemon (default)
    Run,

    /// 💽 List mounted external volumes
    List,

    /// ⏏️ Unmount every enabled external volume now
    UnmountAll {
        /// Seconds to wait for the unmounts to finish
        #[arg(long, default_value_t = 30)]
        wait_secs: u64,
    },

    /// ✅ Manage a volume again (by id or name)
    Enable { volume: String },

    /// 🚫 Leave a volume alone (by id or name)
    Disable { volume: String },

    /// ⚙️ Show or change which events unmount volumes
    Triggers {
        /// Replace the trigger set (comma separated)
        #[arg(long, value_enum, value_delimiter = ',', conflicts_with = "clear")]
        set: Option<Vec<TriggerKind>>,

        /// Remove every trigger (lockmount becomes passive)
        #[arg(long)]
        clear: bool,
    },

    /// ⚙️ Change a global setting
    Set {
        #[command(subcommand)]
        flag: FlagCommand,
    },

    /// 📋 Print the current preferences
    Status,
}

#[derive(Subcommand, Debug)]
pub enum FlagCommand {
    /// Unmount even when files are open
    ForceUnmount {
        #[arg(value_enum)]
        value: Toggle,
    },
    /// Wait a few seconds before mounting again
    RemountDelay {
        #[arg(value_enum)]
        value: Toggle,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_subcommand_means_run() {
        let cli = Cli::parse_from(["lockmount"]);
        assert!(cli.command.is_none());
        assert!(cli.volume_roots.is_empty());
    }

    #[test]
    fn triggers_accept_comma_list() {
        let cli = Cli::parse_from(["lockmount", "triggers", "--set", "screen-lock,system-sleep"]);
        match cli.command {
            Some(Command::Triggers { set: Some(set), clear }) => {
                assert!(!clear);
                assert_eq!(set, vec![TriggerKind::ScreenLock, TriggerKind::SystemSleep]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn set_and_clear_conflict() {
        assert!(Cli::try_parse_from(["lockmount", "triggers", "--set", "screensaver", "--clear"])
            .is_err());
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::parse_from([
            "lockmount",
            "list",
            "--volume-root",
            "/mnt/ext",
            "--volume-root",
            "/media",
            "-vv",
        ]);
        assert_eq!(cli.volume_roots.len(), 2);
        assert_eq!(cli.verbose, 2);
    }

    #[test]
    fn flag_toggles() {
        let cli = Cli::parse_from(["lockmount", "set", "remount-delay", "on"]);
        assert!(matches!(
            cli.command,
            Some(Command::Set {
                flag: FlagCommand::RemountDelay { value: Toggle::On }
            })
        ));
    }
}
