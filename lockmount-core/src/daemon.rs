//! The daemon event loop.
//!
//! Signal listener threads, the preference change hook and the Ctrl+C
//! handler all talk to the loop through one channel. The loop thread owns
//! the controller and the preference store, so the tracked set is only ever
//! touched from here.

use crate::controller::ActivityController;
use crate::preferences::PreferenceStore;
use lockmount_hal::{DiskOps, SignalOps, SignalSink, SystemSignal};
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

/// How often a running daemon checks the preferences file for edits made by
/// another process.
pub const PREFERENCES_POLL_INTERVAL: Duration = Duration::from_secs(2);

static SHUTDOWN_HANDLER_SET: OnceLock<()> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Signal(SystemSignal),
    /// The trigger set changed; resubscribe.
    Reconfigure,
    Shutdown,
}

pub struct Daemon {
    controller: ActivityController,
    prefs: PreferenceStore,
    signals: Box<dyn SignalOps>,
    tx: Sender<Event>,
    rx: Receiver<Event>,
    last_reload_check: Instant,
}

impl Daemon {
    pub fn new(
        disks: Arc<dyn DiskOps>,
        signals: Box<dyn SignalOps>,
        mut prefs: PreferenceStore,
        roots: Vec<PathBuf>,
    ) -> Self {
        let (tx, rx) = mpsc::channel();

        let hook_tx = tx.clone();
        prefs.on_triggers_changed(Box::new(move |triggers| {
            log::debug!("Trigger set changed to {:?}", triggers);
            let _ = hook_tx.send(Event::Reconfigure);
        }));

        let sink_tx = tx.clone();
        let sink: SignalSink = Arc::new(move |signal| {
            let _ = sink_tx.send(Event::Signal(signal));
        });

        let controller = ActivityController::new(disks, roots, sink, &prefs, signals.as_ref());

        Self {
            controller,
            prefs,
            signals,
            tx,
            rx,
            last_reload_check: Instant::now(),
        }
    }

    pub fn sender(&self) -> Sender<Event> {
        self.tx.clone()
    }

    pub fn controller(&self) -> &ActivityController {
        &self.controller
    }

    pub fn prefs_mut(&mut self) -> &mut PreferenceStore {
        &mut self.prefs
    }

    /// Wait up to `max_wait` (less if a reconciliation is due sooner) for one
    /// event and handle it. Returns `false` once shutdown was requested.
    pub fn step(&mut self, max_wait: Duration) -> bool {
        let now = Instant::now();
        let timeout = match self.controller.next_deadline() {
            Some(deadline) => deadline.saturating_duration_since(now).min(max_wait),
            None => max_wait,
        };

        match self.rx.recv_timeout(timeout) {
            Ok(Event::Signal(signal)) => {
                self.controller
                    .handle_signal(signal, &self.prefs, Instant::now());
                self.signals.signal_handled(signal);
            }
            Ok(Event::Reconfigure) => {
                log::info!("🔁 Trigger configuration changed; resubscribing");
                self.controller
                    .reconfigure(&self.prefs, self.signals.as_ref());
            }
            Ok(Event::Shutdown) => {
                log::info!("👋 Shutting down");
                return false;
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return false,
        }

        self.controller.poll_completions();
        self.controller.run_due(Instant::now());

        if self.last_reload_check.elapsed() >= PREFERENCES_POLL_INTERVAL {
            self.last_reload_check = Instant::now();
            if let Err(err) = self.prefs.reload_if_changed() {
                log::warn!("Keeping previous preferences: {:#}", err);
            }
        }
        true
    }

    /// Run until Ctrl+C or a [`Event::Shutdown`].
    pub fn run(mut self) -> anyhow::Result<()> {
        install_shutdown_handler(self.sender())?;
        log::info!(
            "🔒 lockmount running ({} trigger(s) configured)",
            self.prefs.unmount_when().len()
        );
        while self.step(PREFERENCES_POLL_INTERVAL) {}
        Ok(())
    }
}

/// Route Ctrl+C, SIGTERM and SIGHUP into the event loop. Only the first
/// call installs a handler.
pub fn install_shutdown_handler(tx: Sender<Event>) -> anyhow::Result<()> {
    if SHUTDOWN_HANDLER_SET.get().is_some() {
        return Ok(());
    }

    ctrlc::set_handler(move || {
        log::info!("Shutdown requested (Ctrl+C or SIGTERM).");
        let _ = tx.send(Event::Shutdown);
    })?;

    let _ = SHUTDOWN_HANDLER_SET.set(());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trigger::TriggerKind;
    use crate::volume::default_volume_roots;
    use lockmount_hal::{FakeDisk, FakeHal, FakeSignals};

    const TICK: Duration = Duration::from_millis(20);

    fn daemon(triggers: &[TriggerKind]) -> (FakeHal, FakeSignals, Daemon) {
        let hal = FakeHal::new();
        hal.attach(FakeDisk::external("/dev/sdb1", "1111", "A", "/media/A"));
        let signals = FakeSignals::new();
        let mut prefs = PreferenceStore::in_memory();
        prefs
            .set_unmount_when(triggers.iter().copied().collect())
            .unwrap();
        let daemon = Daemon::new(
            Arc::new(hal.clone()),
            Box::new(signals.clone()),
            prefs,
            default_volume_roots(),
        );
        (hal, signals, daemon)
    }

    #[test]
    fn signals_flow_through_the_loop() {
        let (hal, signals, mut daemon) = daemon(&[TriggerKind::ScreenLock]);

        assert_eq!(signals.emit(SystemSignal::ScreenLocked), 1);
        assert!(daemon.step(TICK));
        assert!(!hal.is_disk_mounted("/dev/sdb1"));
        assert_eq!(daemon.controller().tracked().len(), 1);

        signals.emit(SystemSignal::ScreenUnlocked);
        assert!(daemon.step(TICK));
        assert!(hal.is_disk_mounted("/dev/sdb1"));
        assert!(daemon.controller().tracked().is_empty());
    }

    #[test]
    fn sleep_is_reported_handled_after_unmounting() {
        let (hal, signals, mut daemon) = daemon(&[TriggerKind::SystemSleep]);

        signals.emit(SystemSignal::SystemWillSleep);
        assert!(signals.handled().is_empty());
        daemon.step(TICK);

        assert_eq!(hal.unmount_count("/dev/sdb1"), 1);
        assert_eq!(signals.handled(), vec![SystemSignal::SystemWillSleep]);
    }

    #[test]
    fn trigger_change_resubscribes() {
        let (_hal, signals, mut daemon) = daemon(&[TriggerKind::ScreenLock]);
        assert_eq!(signals.subscription_count(SystemSignal::ScreenLocked), 1);

        daemon
            .prefs_mut()
            .set_unmount_when([TriggerKind::SystemSleep].into_iter().collect())
            .unwrap();
        assert!(daemon.step(TICK));

        assert_eq!(signals.subscription_count(SystemSignal::ScreenLocked), 0);
        assert_eq!(signals.subscription_count(SystemSignal::SystemWillSleep), 1);
        assert_eq!(daemon.controller().subscription_count(), 2);
    }

    #[test]
    fn delayed_reconciliation_waits_for_its_deadline() {
        let (hal, signals, mut daemon) = daemon(&[TriggerKind::SystemSleep]);
        daemon.prefs_mut().set_remount_after_delay(true).unwrap();

        signals.emit(SystemSignal::SystemWillSleep);
        daemon.step(TICK);
        signals.emit(SystemSignal::SystemDidWake);
        daemon.step(TICK);

        assert_eq!(hal.mount_count("/dev/sdb1"), 0);
        assert!(daemon.controller().next_deadline().is_some());
    }

    #[test]
    fn shutdown_stops_the_loop() {
        let (_hal, _signals, mut daemon) = daemon(&[]);
        daemon.sender().send(Event::Shutdown).unwrap();
        assert!(!daemon.step(TICK));
    }

    #[test]
    fn idle_step_times_out() {
        let (hal, _signals, mut daemon) = daemon(&[TriggerKind::ScreenLock]);
        assert!(daemon.step(TICK));
        assert_eq!(hal.operation_count(), 0);
    }
}
