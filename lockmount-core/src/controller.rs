//! Activity controller: the unmount/remount state machine.
//!
//! Every configured trigger contributes an enter and an exit signal. All
//! enter signals do the same thing (unmount the enabled external volumes and
//! remember them) and all exit signals do the same thing (schedule a
//! reconciliation that re-mounts what we unmounted). One tracked set is
//! shared by every trigger, so overlapping triggers such as a screen lock
//! followed by display sleep neither double-track nor miss a remount.
//!
//! The controller is owned by a single thread. Mount completions arrive on
//! backend threads and are queued until that thread collects them.

use crate::preferences::PreferenceStore;
use crate::volume::{list_mounted_external_volumes, Volume};
use lockmount_hal::{DiskOps, SignalOps, SignalSink, SignalSubscription, SystemSignal};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// How long to wait after an exit signal before re-mounting, when
/// `remount_after_delay` is set.
pub const SETTLE_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug)]
struct TrackedVolume {
    volume: Volume,
    /// Attempt number of the mount request in flight, if any.
    pending_mount: Option<u64>,
}

type FinishedMounts = Arc<Mutex<Vec<(String, u64)>>>;

pub struct ActivityController {
    disks: Arc<dyn DiskOps>,
    roots: Vec<PathBuf>,
    sink: SignalSink,
    subscriptions: Vec<SignalSubscription>,
    tracked: Vec<TrackedVolume>,
    reconciliations: BinaryHeap<Reverse<Instant>>,
    mount_attempts: u64,
    finished_mounts: FinishedMounts,
}

impl ActivityController {
    /// Create a controller and subscribe to the configured triggers.
    ///
    /// Subscribed signals are delivered to `sink`; the owner is expected to
    /// feed them back through [`ActivityController::handle_signal`].
    pub fn new(
        disks: Arc<dyn DiskOps>,
        roots: Vec<PathBuf>,
        sink: SignalSink,
        prefs: &PreferenceStore,
        signals: &dyn SignalOps,
    ) -> Self {
        let mut controller = Self {
            disks,
            roots,
            sink,
            subscriptions: Vec::new(),
            tracked: Vec::new(),
            reconciliations: BinaryHeap::new(),
            mount_attempts: 0,
            finished_mounts: Arc::new(Mutex::new(Vec::new())),
        };
        controller.reconfigure(prefs, signals);
        controller
    }

    /// Drop every subscription, then subscribe to exactly the enter and exit
    /// signals of the configured triggers.
    pub fn reconfigure(&mut self, prefs: &PreferenceStore, signals: &dyn SignalOps) {
        self.subscriptions.clear();

        for trigger in prefs.unmount_when() {
            let (enter, exit) = trigger.signals();
            for signal in [enter, exit] {
                match signals.subscribe(signal, self.sink.clone()) {
                    Ok(subscription) => self.subscriptions.push(subscription),
                    Err(err) => log::warn!("Cannot watch {} ({}): {}", signal, trigger, err),
                }
            }
        }

        if self.subscriptions.is_empty() {
            log::info!("No triggers configured; volumes are left alone");
        } else {
            log::info!("Watching {} system signals", self.subscriptions.len());
        }
    }

    pub fn handle_signal(&mut self, signal: SystemSignal, prefs: &PreferenceStore, now: Instant) {
        log::info!("Received {}", signal);
        if signal.is_enter() {
            self.on_enter_signal(prefs);
        } else {
            self.on_exit_signal(prefs, now);
        }
    }

    /// Unmount every enabled external volume and track the ones we have not
    /// seen yet. Already tracked volumes get another unmount request.
    pub fn on_enter_signal(&mut self, prefs: &PreferenceStore) {
        self.poll_completions();

        let volumes: Vec<Volume> = list_mounted_external_volumes(self.disks.as_ref(), &self.roots)
            .into_iter()
            .filter(|volume| volume.enabled(prefs))
            .collect();

        for volume in &volumes {
            match self.tracked.iter_mut().find(|t| t.volume == *volume) {
                Some(entry) => {
                    // Mounted again since we last saw it; a stale mount
                    // completion must not drop it from tracking.
                    entry.volume = volume.clone();
                    entry.pending_mount = None;
                }
                None => self.tracked.push(TrackedVolume {
                    volume: volume.clone(),
                    pending_mount: None,
                }),
            }
        }

        let force = prefs.force_unmount();
        for volume in &volumes {
            volume.unmount(self.disks.as_ref(), force);
        }
    }

    /// Schedule a reconciliation, after [`SETTLE_DELAY`] if requested.
    pub fn on_exit_signal(&mut self, prefs: &PreferenceStore, now: Instant) {
        let delay = if prefs.remount_after_delay() {
            SETTLE_DELAY
        } else {
            Duration::ZERO
        };
        log::debug!("Reconciliation scheduled in {:?}", delay);
        self.reconciliations.push(Reverse(now + delay));
    }

    /// Run every reconciliation whose deadline has passed. Returns how many ran.
    pub fn run_due(&mut self, now: Instant) -> usize {
        let mut ran = 0;
        while let Some(Reverse(deadline)) = self.reconciliations.peek() {
            if *deadline > now {
                break;
            }
            self.reconciliations.pop();
            self.reconcile();
            ran += 1;
        }
        ran
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.reconciliations.peek().map(|Reverse(deadline)| *deadline)
    }

    /// Forget tracked volumes whose remount attempt has completed.
    pub fn poll_completions(&mut self) {
        let finished: Vec<(String, u64)> = {
            let mut finished = self
                .finished_mounts
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            finished.drain(..).collect()
        };
        for (id, attempt) in finished {
            self.tracked
                .retain(|t| !(t.volume.id == id && t.pending_mount == Some(attempt)));
        }
    }

    pub fn tracked(&self) -> Vec<&Volume> {
        self.tracked.iter().map(|t| &t.volume).collect()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn pending_reconciliations(&self) -> usize {
        self.reconciliations.len()
    }

    fn live_ids(&self) -> HashSet<String> {
        list_mounted_external_volumes(self.disks.as_ref(), &self.roots)
            .into_iter()
            .map(|volume| volume.id)
            .collect()
    }

    fn reconcile(&mut self) {
        self.poll_completions();
        if self.tracked.is_empty() {
            log::debug!("Reconciliation: nothing tracked");
            return;
        }

        let live = self.live_ids();
        for entry in &mut self.tracked {
            if live.contains(&entry.volume.id) {
                log::debug!("{} is already mounted; not remounting", entry.volume);
                continue;
            }
            self.mount_attempts += 1;
            let attempt = self.mount_attempts;
            entry.pending_mount = Some(attempt);

            let finished = Arc::clone(&self.finished_mounts);
            let id = entry.volume.id.clone();
            entry.volume.mount_then(
                self.disks.as_ref(),
                Box::new(move |_| {
                    finished
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .push((id, attempt));
                }),
            );
        }

        self.poll_completions();
        let live = self.live_ids();
        self.tracked.retain(|t| !live.contains(&t.volume.id));
        log::debug!(
            "Reconciliation done; {} volume(s) still tracked",
            self.tracked.len()
        );
    }
}
