//! System state-transition signals.

use crate::HalResult;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};

/// A host notification lockmount can react to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SystemSignal {
    ScreensaverStarted,
    ScreensaverStopped,
    ScreenLocked,
    ScreenUnlocked,
    DisplaysSlept,
    DisplaysWoke,
    SystemWillSleep,
    SystemDidWake,
}

impl SystemSignal {
    pub const ALL: [SystemSignal; 8] = [
        SystemSignal::ScreensaverStarted,
        SystemSignal::ScreensaverStopped,
        SystemSignal::ScreenLocked,
        SystemSignal::ScreenUnlocked,
        SystemSignal::DisplaysSlept,
        SystemSignal::DisplaysWoke,
        SystemSignal::SystemWillSleep,
        SystemSignal::SystemDidWake,
    ];

    /// True for signals that mark the start of a "locked" period.
    pub fn is_enter(self) -> bool {
        matches!(
            self,
            SystemSignal::ScreensaverStarted
                | SystemSignal::ScreenLocked
                | SystemSignal::DisplaysSlept
                | SystemSignal::SystemWillSleep
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            SystemSignal::ScreensaverStarted => "screensaver-started",
            SystemSignal::ScreensaverStopped => "screensaver-stopped",
            SystemSignal::ScreenLocked => "screen-locked",
            SystemSignal::ScreenUnlocked => "screen-unlocked",
            SystemSignal::DisplaysSlept => "displays-slept",
            SystemSignal::DisplaysWoke => "displays-woke",
            SystemSignal::SystemWillSleep => "system-will-sleep",
            SystemSignal::SystemDidWake => "system-did-wake",
        }
    }
}

impl fmt::Display for SystemSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Callback receiving delivered signals. May be invoked from any thread.
pub type SignalSink = Arc<dyn Fn(SystemSignal) + Send + Sync>;

/// Trait for subscribing to system signals.
pub trait SignalOps {
    /// Deliver `signal` to `sink` until the returned subscription is dropped.
    fn subscribe(&self, signal: SystemSignal, sink: SignalSink) -> HalResult<SignalSubscription>;

    /// Called by the owner once it has acted on a delivered signal. Backends
    /// that hold the host back (a sleep delay lock) let go here.
    fn signal_handled(&self, _signal: SystemSignal) {}
}

/// RAII handle that unsubscribes when dropped.
pub struct SignalSubscription {
    signal: SystemSignal,
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl SignalSubscription {
    pub fn new(signal: SystemSignal, cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            signal,
            cancel: Some(Box::new(cancel)),
        }
    }
}

impl fmt::Debug for SignalSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalSubscription")
            .field("signal", &self.signal)
            .finish()
    }
}

impl Drop for SignalSubscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

#[derive(Default)]
struct TableState {
    next_id: u64,
    entries: BTreeMap<u64, (SystemSignal, SignalSink)>,
}

/// Shared signal → sink table used by the signal backends.
///
/// Listeners call [`SubscriptionTable::dispatch`] for every signal they see;
/// only signals with a live subscription reach a sink.
#[derive(Clone, Default)]
pub struct SubscriptionTable {
    state: Arc<Mutex<TableState>>,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, signal: SystemSignal, sink: SignalSink) -> SignalSubscription {
        let id = {
            let mut state = self.lock();
            let id = state.next_id;
            state.next_id += 1;
            state.entries.insert(id, (signal, sink));
            id
        };
        let table = self.clone();
        SignalSubscription::new(signal, move || {
            table.lock().entries.remove(&id);
        })
    }

    /// Deliver `signal` to every subscribed sink. Sinks run outside the lock.
    pub fn dispatch(&self, signal: SystemSignal) -> usize {
        let sinks: Vec<SignalSink> = self
            .lock()
            .entries
            .values()
            .filter(|(s, _)| *s == signal)
            .map(|(_, sink)| sink.clone())
            .collect();
        for sink in &sinks {
            sink(signal);
        }
        sinks.len()
    }

    pub fn count(&self, signal: SystemSignal) -> usize {
        self.lock()
            .entries
            .values()
            .filter(|(s, _)| *s == signal)
            .count()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TableState> {
        // Sinks never run under the lock; the map is always consistent.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_sink() -> (SignalSink, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let sink: SignalSink = Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (sink, hits)
    }

    #[test]
    fn enter_signals_are_classified() {
        let enters: Vec<_> = SystemSignal::ALL
            .iter()
            .filter(|s| s.is_enter())
            .collect();
        assert_eq!(enters.len(), 4);
        assert!(SystemSignal::ScreenLocked.is_enter());
        assert!(!SystemSignal::ScreenUnlocked.is_enter());
    }

    #[test]
    fn dispatch_only_reaches_matching_subscriptions() {
        let table = SubscriptionTable::new();
        let (sink, hits) = counting_sink();
        let _sub = table.insert(SystemSignal::ScreenLocked, sink);

        assert_eq!(table.dispatch(SystemSignal::ScreenUnlocked), 0);
        assert_eq!(table.dispatch(SystemSignal::ScreenLocked), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropping_subscription_unsubscribes() {
        let table = SubscriptionTable::new();
        let (sink, hits) = counting_sink();
        let sub = table.insert(SystemSignal::SystemWillSleep, sink);
        assert_eq!(table.count(SystemSignal::SystemWillSleep), 1);

        drop(sub);

        assert!(table.is_empty());
        table.dispatch(SystemSignal::SystemWillSleep);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
