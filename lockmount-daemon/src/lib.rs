use anyhow::Context;
use clap::Parser;
use lockmount_core::cli::{Cli, Command, FlagCommand};
use lockmount_core::commands::{self, UnmountOutcome, VolumeStatus};
use lockmount_core::daemon::Daemon;
use lockmount_core::preferences::PreferenceStore;
use lockmount_core::volume::default_volume_roots;
use lockmount_core::TriggerKind;
use lockmount_hal::{DbusSignals, DiskOps, LinuxHal};
use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

pub fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    lockmount_core::logging::init_with(cli.log_file.clone(), cli.verbose);

    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => PreferenceStore::default_path()?,
    };
    let mut prefs = PreferenceStore::open(&config_path)
        .with_context(|| format!("Failed to load preferences from {}", config_path.display()))?;
    let roots = if cli.volume_roots.is_empty() {
        default_volume_roots()
    } else {
        cli.volume_roots.clone()
    };

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => {
            log::info!("🔒 Starting lockmount daemon...");
            let daemon = Daemon::new(linux_disks()?, Box::new(DbusSignals::new()), prefs, roots);
            daemon.run()?;
        }
        Command::List => {
            let disks = linux_disks()?;
            let listed = commands::list_volumes(disks.as_ref(), &roots, &prefs);
            print!("{}", format_volume_list(&listed));
        }
        Command::UnmountAll { wait_secs } => {
            log::info!("⏏️ Unmounting all external volumes...");
            let disks = linux_disks()?;
            let report = commands::unmount_all_now(
                disks.as_ref(),
                &roots,
                &prefs,
                Duration::from_secs(wait_secs),
            );
            for (volume, outcome) in &report.results {
                match outcome {
                    UnmountOutcome::Unmounted => println!("✅ {}", volume),
                    UnmountOutcome::Refused(dissent) => println!("❌ {}: {}", volume, dissent),
                    UnmountOutcome::Pending => println!("⏳ {}: no answer yet", volume),
                }
            }
            if report.failures() > 0 {
                anyhow::bail!("{} volume(s) could not be unmounted", report.failures());
            }
        }
        Command::Enable { volume } => {
            let disks = linux_disks()?;
            let id =
                commands::set_volume_enabled(disks.as_ref(), &roots, &mut prefs, &volume, true)?;
            println!("✅ {} will be unmounted on lock", id);
        }
        Command::Disable { volume } => {
            let disks = linux_disks()?;
            let id =
                commands::set_volume_enabled(disks.as_ref(), &roots, &mut prefs, &volume, false)?;
            println!("🚫 {} will be left alone", id);
        }
        Command::Triggers { set, clear } => {
            if clear {
                prefs.set_unmount_when(BTreeSet::new())?;
            } else if let Some(set) = set {
                prefs.set_unmount_when(set.into_iter().collect())?;
            }
            print!("{}", format_triggers(prefs.unmount_when()));
        }
        Command::Set { flag } => match flag {
            FlagCommand::ForceUnmount { value } => {
                prefs.set_force_unmount(value.is_on())?;
                println!("force-unmount: {}", on_off(prefs.force_unmount()));
            }
            FlagCommand::RemountDelay { value } => {
                prefs.set_remount_after_delay(value.is_on())?;
                println!("remount-delay: {}", on_off(prefs.remount_after_delay()));
            }
        },
        Command::Status => {
            print!("{}", format_status(&prefs));
        }
    }

    Ok(())
}

fn linux_disks() -> anyhow::Result<Arc<dyn DiskOps>> {
    let hal = LinuxHal::new().context("UDisks2 is not reachable on the system bus")?;
    Ok(Arc::new(hal))
}

fn on_off(value: bool) -> &'static str {
    if value {
        "on"
    } else {
        "off"
    }
}

pub fn format_volume_list(listed: &[VolumeStatus]) -> String {
    if listed.is_empty() {
        return "No external volumes mounted.\n".to_string();
    }
    let mut out = String::new();
    for status in listed {
        let _ = writeln!(
            out,
            "{} {:<24} {:<38} {}",
            if status.enabled { "✅" } else { "🚫" },
            status.volume.name,
            status.volume.id,
            status.volume.location.display()
        );
    }
    out
}

pub fn format_triggers(triggers: &BTreeSet<TriggerKind>) -> String {
    let mut out = String::new();
    for trigger in TriggerKind::ALL {
        let _ = writeln!(
            out,
            "[{}] {:<14} {}",
            if triggers.contains(&trigger) { "x" } else { " " },
            trigger.name(),
            trigger.description()
        );
    }
    if triggers.is_empty() {
        out.push_str("No triggers set; volumes are never unmounted automatically.\n");
    }
    out
}

pub fn format_status(prefs: &PreferenceStore) -> String {
    let mut out = String::new();
    if let Some(path) = prefs.path() {
        let _ = writeln!(out, "Preferences: {}", path.display());
    }
    out.push_str(&format_triggers(prefs.unmount_when()));
    let _ = writeln!(out, "force-unmount: {}", on_off(prefs.force_unmount()));
    let _ = writeln!(out, "remount-delay: {}", on_off(prefs.remount_after_delay()));
    let disabled: Vec<&str> = prefs
        .snapshot()
        .volumes
        .iter()
        .filter(|(_, enabled)| !**enabled)
        .map(|(id, _)| id.as_str())
        .collect();
    if !disabled.is_empty() {
        let _ = writeln!(out, "Disabled volumes: {}", disabled.join(", "));
    }
    out
}
