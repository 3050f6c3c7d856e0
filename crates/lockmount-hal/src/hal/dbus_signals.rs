//! System signals delivered over D-Bus.
//!
//! | Signals | Bus | Source |
//! |---------|-----|--------|
//! | screensaver started/stopped | session | `org.freedesktop.ScreenSaver.ActiveChanged(b)` |
//! | screen locked/unlocked | system | `LockedHint` changes on the caller's `org.freedesktop.login1.Session` |
//! | displays slept/woke | session | `org.gnome.Mutter.DisplayConfig` `PowerSaveMode` changes |
//! | system will sleep/did wake | system | `org.freedesktop.login1.Manager.PrepareForSleep(b)` |
//!
//! One listener thread is started per source the first time any of its
//! signals is subscribed; it lives for the rest of the process and forwards
//! into the shared [`SubscriptionTable`], so dropping a subscription stops
//! delivery immediately.
//!
//! While the sleep source runs we hold a logind "delay" inhibitor so that
//! `PrepareForSleep(true)` is answered before the machine suspends. The lock
//! is released once the owner reports the signal handled (or nobody listens)
//! and taken again on wake.

use super::{SignalOps, SignalSink, SignalSubscription, SubscriptionTable, SystemSignal};
use crate::{HalError, HalResult};
use std::collections::{HashMap, HashSet};
use std::os::fd::OwnedFd;
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use zbus::blocking::{Connection, Proxy};
use zbus::zvariant::{self, ObjectPath, OwnedObjectPath, OwnedValue, Value};
use zbus::Message;

const SCREENSAVER_DESTINATION: &str = "org.freedesktop.ScreenSaver";
const SCREENSAVER_PATH: &str = "/org/freedesktop/ScreenSaver";
const SCREENSAVER_INTERFACE: &str = "org.freedesktop.ScreenSaver";

const LOGIN1_DESTINATION: &str = "org.freedesktop.login1";
const LOGIN1_PATH: &str = "/org/freedesktop/login1";
const LOGIN1_MANAGER_INTERFACE: &str = "org.freedesktop.login1.Manager";
const LOGIN1_SESSION_INTERFACE: &str = "org.freedesktop.login1.Session";
const LOGIN1_USER_INTERFACE: &str = "org.freedesktop.login1.User";

const MUTTER_DESTINATION: &str = "org.gnome.Mutter.DisplayConfig";
const MUTTER_PATH: &str = "/org/gnome/Mutter/DisplayConfig";
const MUTTER_INTERFACE: &str = "org.gnome.Mutter.DisplayConfig";
const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";

const INHIBIT_WHO: &str = "lockmount";
const INHIBIT_WHY: &str = "Unmounting removable volumes before sleep";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Source {
    Screensaver,
    SessionLock,
    DisplayPower,
    Sleep,
}

impl Source {
    fn of(signal: SystemSignal) -> Self {
        match signal {
            SystemSignal::ScreensaverStarted | SystemSignal::ScreensaverStopped => {
                Source::Screensaver
            }
            SystemSignal::ScreenLocked | SystemSignal::ScreenUnlocked => Source::SessionLock,
            SystemSignal::DisplaysSlept | SystemSignal::DisplaysWoke => Source::DisplayPower,
            SystemSignal::SystemWillSleep | SystemSignal::SystemDidWake => Source::Sleep,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Source::Screensaver => "screensaver",
            Source::SessionLock => "session-lock",
            Source::DisplayPower => "display-power",
            Source::Sleep => "sleep",
        }
    }
}

/// What a listener thread subscribes to.
struct ListenerSpec {
    destination: &'static str,
    path: ObjectPath<'static>,
    interface: &'static str,
    member: &'static str,
}

#[derive(Default)]
struct Buses {
    session: Option<Connection>,
    system: Option<Connection>,
}

/// Signal backend for Linux desktops.
#[derive(Default)]
pub struct DbusSignals {
    table: SubscriptionTable,
    started: Mutex<HashSet<Source>>,
    buses: Mutex<Buses>,
    sleep_lock: Arc<SleepInhibitor>,
}

impl DbusSignals {
    pub fn new() -> Self {
        Self::default()
    }

    fn session_bus(&self) -> HalResult<Connection> {
        let mut buses = self.buses.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(conn) = &buses.session {
            return Ok(conn.clone());
        }
        let conn = Connection::session()
            .map_err(|e| HalError::Unavailable(format!("session bus: {}", e)))?;
        buses.session = Some(conn.clone());
        Ok(conn)
    }

    fn system_bus(&self) -> HalResult<Connection> {
        let mut buses = self.buses.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(conn) = &buses.system {
            return Ok(conn.clone());
        }
        let conn = Connection::system()
            .map_err(|e| HalError::Unavailable(format!("system bus: {}", e)))?;
        buses.system = Some(conn.clone());
        Ok(conn)
    }

    fn ensure_listener(&self, source: Source) -> HalResult<()> {
        let mut started = self.started.lock().unwrap_or_else(|e| e.into_inner());
        if started.contains(&source) {
            return Ok(());
        }

        let table = self.table.clone();
        match source {
            Source::Screensaver => spawn_listener(
                source,
                self.session_bus()?,
                ListenerSpec {
                    destination: SCREENSAVER_DESTINATION,
                    path: ObjectPath::from_static_str_unchecked(SCREENSAVER_PATH),
                    interface: SCREENSAVER_INTERFACE,
                    member: "ActiveChanged",
                },
                table,
                |msg| {
                    let active: bool = msg.body().deserialize().ok()?;
                    Some(if active {
                        SystemSignal::ScreensaverStarted
                    } else {
                        SystemSignal::ScreensaverStopped
                    })
                },
                |_, _| {},
            )?,
            Source::SessionLock => {
                let conn = self.system_bus()?;
                let session = current_session_path(&conn)?;
                let mut tracker = EdgeTracker::default();
                spawn_listener(
                    source,
                    conn,
                    ListenerSpec {
                        destination: LOGIN1_DESTINATION,
                        path: session.into_inner(),
                        interface: PROPERTIES_INTERFACE,
                        member: "PropertiesChanged",
                    },
                    table,
                    move |msg| {
                        let body = msg.body();
                        let (interface, changed, _invalidated): (
                            String,
                            HashMap<String, Value<'_>>,
                            Vec<String>,
                        ) = body.deserialize().ok()?;
                        let locked = decode_locked_hint(&interface, &changed)?;
                        tracker.observe(locked).map(|locked| {
                            if locked {
                                SystemSignal::ScreenLocked
                            } else {
                                SystemSignal::ScreenUnlocked
                            }
                        })
                    },
                    |_, _| {},
                )?
            }
            Source::DisplayPower => {
                let mut tracker = EdgeTracker::default();
                spawn_listener(
                    source,
                    self.session_bus()?,
                    ListenerSpec {
                        destination: MUTTER_DESTINATION,
                        path: ObjectPath::from_static_str_unchecked(MUTTER_PATH),
                        interface: PROPERTIES_INTERFACE,
                        member: "PropertiesChanged",
                    },
                    table,
                    move |msg| {
                        let body = msg.body();
                        let (interface, changed, _invalidated): (
                            String,
                            HashMap<String, Value<'_>>,
                            Vec<String>,
                        ) = body.deserialize().ok()?;
                        let asleep = decode_power_save(&interface, &changed)?;
                        tracker.observe(asleep).map(|asleep| {
                            if asleep {
                                SystemSignal::DisplaysSlept
                            } else {
                                SystemSignal::DisplaysWoke
                            }
                        })
                    },
                    |_, _| {},
                )?
            }
            Source::Sleep => {
                let conn = self.system_bus()?;
                self.sleep_lock.acquire(&conn);
                let inhibitor = Arc::clone(&self.sleep_lock);
                let wake_conn = conn.clone();
                spawn_listener(
                    source,
                    conn,
                    ListenerSpec {
                        destination: LOGIN1_DESTINATION,
                        path: ObjectPath::from_static_str_unchecked(LOGIN1_PATH),
                        interface: LOGIN1_MANAGER_INTERFACE,
                        member: "PrepareForSleep",
                    },
                    table,
                    |msg| {
                        let sleeping: bool = msg.body().deserialize().ok()?;
                        Some(if sleeping {
                            SystemSignal::SystemWillSleep
                        } else {
                            SystemSignal::SystemDidWake
                        })
                    },
                    move |signal, delivered| match signal {
                        // Nobody will report back; don't hold up the suspend.
                        SystemSignal::SystemWillSleep if delivered == 0 => {
                            inhibitor.release();
                        }
                        SystemSignal::SystemDidWake => inhibitor.acquire(&wake_conn),
                        _ => {}
                    },
                )?
            }
        }

        started.insert(source);
        Ok(())
    }
}

impl SignalOps for DbusSignals {
    fn subscribe(&self, signal: SystemSignal, sink: SignalSink) -> HalResult<SignalSubscription> {
        self.ensure_listener(Source::of(signal))?;
        Ok(self.table.insert(signal, sink))
    }

    fn signal_handled(&self, signal: SystemSignal) {
        if signal == SystemSignal::SystemWillSleep {
            self.sleep_lock.release();
        }
    }
}

/// A logind "delay" inhibitor for sleep. Holding the fd postpones suspend
/// (up to logind's `InhibitDelayMaxSec`); closing it lets suspend proceed.
#[derive(Debug, Default)]
struct SleepInhibitor {
    fd: Mutex<Option<OwnedFd>>,
}

impl SleepInhibitor {
    fn acquire(&self, conn: &Connection) {
        if self.is_held() {
            return;
        }
        match take_sleep_delay_lock(conn) {
            Ok(fd) => {
                self.hold(fd);
                log::debug!("Holding sleep delay lock");
            }
            Err(err) => log::warn!("Cannot delay sleep; unmounts may race suspend: {}", err),
        }
    }

    fn hold(&self, fd: OwnedFd) {
        *self.fd.lock().unwrap_or_else(|e| e.into_inner()) = Some(fd);
    }

    /// Close the lock. Returns whether one was held.
    fn release(&self) -> bool {
        let released = self.fd.lock().unwrap_or_else(|e| e.into_inner()).take();
        if released.is_some() {
            log::debug!("Released sleep delay lock");
        }
        released.is_some()
    }

    fn is_held(&self) -> bool {
        self.fd.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }
}

fn take_sleep_delay_lock(conn: &Connection) -> HalResult<OwnedFd> {
    let manager = Proxy::new(conn, LOGIN1_DESTINATION, LOGIN1_PATH, LOGIN1_MANAGER_INTERFACE)?;
    let fd: zvariant::OwnedFd =
        manager.call("Inhibit", &("sleep", INHIBIT_WHO, INHIBIT_WHY, "delay"))?;
    Ok(fd.into())
}

/// Turns level readings into edges: reports a value only when it differs
/// from the previous one. Starts out `false` (unlocked, displays on).
#[derive(Debug, Default)]
struct EdgeTracker {
    state: bool,
}

impl EdgeTracker {
    fn observe(&mut self, value: bool) -> Option<bool> {
        if value == self.state {
            return None;
        }
        self.state = value;
        Some(value)
    }
}

/// `LockedHint` out of a logind session `PropertiesChanged` payload.
fn decode_locked_hint(interface: &str, changed: &HashMap<String, Value<'_>>) -> Option<bool> {
    if interface != LOGIN1_SESSION_INTERFACE {
        return None;
    }
    match changed.get("LockedHint")? {
        Value::Bool(locked) => Some(*locked),
        _ => None,
    }
}

/// Whether Mutter's `PowerSaveMode` means the displays are off.
/// 0 is on, positive values are power-save states, negative is unknown.
fn decode_power_save(interface: &str, changed: &HashMap<String, Value<'_>>) -> Option<bool> {
    if interface != MUTTER_INTERFACE {
        return None;
    }
    match changed.get("PowerSaveMode")? {
        Value::I32(mode) if *mode >= 0 => Some(*mode > 0),
        _ => None,
    }
}

/// The `(so)` `Display` property of a login1 user; `/` means none.
fn display_session(value: &Value<'_>) -> Option<OwnedObjectPath> {
    let Value::Structure(display) = value else {
        return None;
    };
    match display.fields().get(1)? {
        Value::ObjectPath(path) if path.as_str() != "/" => Some(path.clone().into()),
        _ => None,
    }
}

/// The login1 session this process belongs to.
///
/// A daemon started as a systemd user service is not part of any session,
/// so after `XDG_SESSION_ID` and our own PID we fall back to the user's
/// graphical ("display") session.
fn current_session_path(conn: &Connection) -> HalResult<OwnedObjectPath> {
    let manager = Proxy::new(conn, LOGIN1_DESTINATION, LOGIN1_PATH, LOGIN1_MANAGER_INTERFACE)?;

    if let Ok(id) = std::env::var("XDG_SESSION_ID") {
        if !id.is_empty() {
            match manager.call::<_, _, OwnedObjectPath>("GetSession", &(id.as_str(),)) {
                Ok(path) => return Ok(log_session(path)),
                Err(err) => log::debug!("GetSession({}) failed: {}", id, err),
            }
        }
    }

    let pid = std::process::id();
    match manager.call::<_, _, OwnedObjectPath>("GetSessionByPID", &(pid,)) {
        Ok(path) => return Ok(log_session(path)),
        Err(err) => log::debug!("GetSessionByPID({}) failed: {}", pid, err),
    }

    let user: OwnedObjectPath = manager.call("GetUserByPID", &(pid,))?;
    let user = Proxy::new(conn, LOGIN1_DESTINATION, user.as_str(), LOGIN1_USER_INTERFACE)?;
    let display: OwnedValue = user.get_property("Display")?;
    let path = display_session(&display)
        .ok_or_else(|| HalError::Unavailable("no graphical login session".to_string()))?;
    Ok(log_session(path))
}

fn log_session(path: OwnedObjectPath) -> OwnedObjectPath {
    log::debug!("login1 session: {}", path.as_str());
    path
}

fn spawn_listener<F, A>(
    source: Source,
    conn: Connection,
    spec: ListenerSpec,
    table: SubscriptionTable,
    mut decode: F,
    mut after_dispatch: A,
) -> HalResult<()>
where
    F: FnMut(&Message) -> Option<SystemSignal> + Send + 'static,
    A: FnMut(SystemSignal, usize) + Send + 'static,
{
    let (ready_tx, ready_rx) = mpsc::channel::<zbus::Result<()>>();

    thread::Builder::new()
        .name(format!("lockmount-{}", source.label()))
        .spawn(move || {
            let messages = Proxy::new(&conn, spec.destination, spec.path, spec.interface)
                .and_then(|proxy| proxy.receive_signal(spec.member));
            let messages = match messages {
                Ok(messages) => messages,
                Err(err) => {
                    let _ = ready_tx.send(Err(err));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(()));
            log::info!("Listening for {} signals", source.label());

            for msg in messages {
                if let Some(signal) = decode(&msg) {
                    log::debug!("D-Bus delivered {}", signal);
                    let delivered = table.dispatch(signal);
                    after_dispatch(signal, delivered);
                }
            }
            log::warn!("{} signal stream ended", source.label());
        })?;

    ready_rx
        .recv()
        .map_err(|_| HalError::Other(format!("{} listener died during setup", source.label())))??;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn changed(key: &str, value: Value<'static>) -> HashMap<String, Value<'static>> {
        HashMap::from([(key.to_string(), value)])
    }

    #[test]
    fn every_signal_has_a_source() {
        for signal in SystemSignal::ALL {
            let _ = Source::of(signal);
        }
        assert_eq!(
            Source::of(SystemSignal::ScreenLocked),
            Source::of(SystemSignal::ScreenUnlocked)
        );
    }

    #[test]
    fn edge_tracker_reports_changes_only() {
        let mut tracker = EdgeTracker::default();
        assert_eq!(tracker.observe(false), None);
        assert_eq!(tracker.observe(true), Some(true));
        assert_eq!(tracker.observe(true), None);
        assert_eq!(tracker.observe(false), Some(false));
    }

    #[test]
    fn locked_hint_decodes_both_directions() {
        let iface = LOGIN1_SESSION_INTERFACE;
        assert_eq!(
            decode_locked_hint(iface, &changed("LockedHint", Value::from(true))),
            Some(true)
        );
        assert_eq!(
            decode_locked_hint(iface, &changed("LockedHint", Value::from(false))),
            Some(false)
        );
        assert_eq!(
            decode_locked_hint(iface, &changed("IdleHint", Value::from(true))),
            None
        );
        assert_eq!(
            decode_locked_hint(MUTTER_INTERFACE, &changed("LockedHint", Value::from(true))),
            None
        );
    }

    #[test]
    fn unlock_at_the_greeter_produces_an_exit_edge() {
        let mut tracker = EdgeTracker::default();
        let hints = [true, true, false];
        let edges: Vec<bool> = hints
            .iter()
            .filter_map(|&hint| {
                let locked = decode_locked_hint(
                    LOGIN1_SESSION_INTERFACE,
                    &changed("LockedHint", Value::from(hint)),
                )?;
                tracker.observe(locked)
            })
            .collect();
        assert_eq!(edges, vec![true, false]);
    }

    #[test]
    fn power_save_mode_decodes() {
        let iface = MUTTER_INTERFACE;
        assert_eq!(
            decode_power_save(iface, &changed("PowerSaveMode", Value::from(3i32))),
            Some(true)
        );
        assert_eq!(
            decode_power_save(iface, &changed("PowerSaveMode", Value::from(0i32))),
            Some(false)
        );
        assert_eq!(
            decode_power_save(iface, &changed("PowerSaveMode", Value::from(-1i32))),
            None
        );
    }

    #[test]
    fn display_session_reads_the_object_path() {
        let session = ObjectPath::from_static_str_unchecked("/org/freedesktop/login1/session/c2");
        let display = Value::from(("c2", session));
        assert_eq!(
            display_session(&display).map(|p| p.as_str().to_string()),
            Some("/org/freedesktop/login1/session/c2".to_string())
        );

        let none = Value::from(("", ObjectPath::from_static_str_unchecked("/")));
        assert_eq!(display_session(&none), None);
        assert_eq!(display_session(&Value::from(true)), None);
    }

    #[test]
    fn sleep_inhibitor_releases_once() {
        let file = tempfile::tempfile().unwrap();
        let inhibitor = SleepInhibitor::default();
        assert!(!inhibitor.release());

        inhibitor.hold(OwnedFd::from(file));
        assert!(inhibitor.is_held());
        assert!(inhibitor.release());
        assert!(!inhibitor.is_held());
        assert!(!inhibitor.release());
    }
}
