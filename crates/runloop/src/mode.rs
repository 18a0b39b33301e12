//! Modes: named activation scopes a loop runs in.
//!
//! A mode owns the sources, timers and observers scheduled into it plus a
//! set of sub-mode names it includes by reference (no nested `Mode` value,
//! just a name looked up in the owning loop's registry at traversal time).
//! Traversal is depth-first with a visited set, so a cycle between sub-modes
//! degrades to "visit once" rather than looping forever. A cycle is not
//! treated as an error, only kept from hanging the traversal.

use crate::observer::Observer;
use crate::source::Source;
use crate::timer::Timer;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// The reserved name fanned out to by every mode's "common" sources/timers/
/// observers: anything added under [`COMMON_MODE_NAME`] is visible from
/// every mode a loop runs, not just a mode literally named `"common"`.
pub const COMMON_MODE_NAME: &str = "kCFRunLoopCommonModes";

/// A mode name. Cheap to clone and hash; interned as a plain `Arc<str>` so
/// callers can build one from any string-like value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModeName(Arc<str>);

impl ModeName {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_common(&self) -> bool {
        self.0.as_ref() == COMMON_MODE_NAME
    }
}

impl From<&str> for ModeName {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ModeName {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl std::fmt::Display for ModeName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Default)]
struct ModeItems {
    sources: Vec<Source>,
    timers: Vec<Timer>,
    observers: Vec<Observer>,
    submodes: HashSet<ModeName>,
}

/// A named activation scope. See module docs.
pub struct Mode {
    name: ModeName,
    items: Mutex<ModeItems>,
    stop: AtomicBool,
}

impl Mode {
    pub fn new(name: ModeName) -> Self {
        Self {
            name,
            items: Mutex::new(ModeItems::default()),
            stop: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &ModeName {
        &self.name
    }

    /// Ask this mode's current (or next) `run_in_mode` pass to stop. Takes
    /// effect at the next safe point, same as `Loop::stop` but scoped to
    /// this one mode rather than the whole loop.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Consume a pending stop request, if any. Called once per pass by the
    /// engine so a stale request doesn't leak into the next `run_in_mode`.
    pub(crate) fn take_stop(&self) -> bool {
        self.stop.swap(false, Ordering::AcqRel)
    }

    pub fn add_source(&self, source: Source) {
        let mut items = self.items.lock();
        if !items.sources.contains(&source) {
            items.sources.push(source);
        }
    }

    pub fn remove_source(&self, source: &Source) {
        self.items.lock().sources.retain(|s| s != source);
    }

    pub fn add_timer(&self, timer: Timer) {
        let mut items = self.items.lock();
        if !items.timers.contains(&timer) {
            items.timers.push(timer);
        }
    }

    pub fn remove_timer(&self, timer: &Timer) {
        self.items.lock().timers.retain(|t| t != timer);
    }

    pub fn add_observer(&self, observer: Observer) {
        let mut items = self.items.lock();
        if !items.observers.contains(&observer) {
            items.observers.push(observer);
        }
    }

    pub fn remove_observer(&self, observer: &Observer) {
        self.items.lock().observers.retain(|o| o != observer);
    }

    pub fn add_submode(&self, name: ModeName) {
        self.items.lock().submodes.insert(name);
    }

    /// Drop any source/timer/observer that has since been invalidated. The
    /// engine calls this at the top of every pass so a callback that
    /// invalidated something mid-dispatch doesn't leave it visible to the
    /// next pass.
    pub(crate) fn prune_invalid(&self) {
        let mut items = self.items.lock();
        items.sources.retain(|s| s.is_valid());
        items.timers.retain(|t| t.is_valid());
        items.observers.retain(|o| o.is_valid());
    }

    /// A snapshot of this mode's own sources, ignoring sub-modes.
    pub(crate) fn own_sources(&self) -> Vec<Source> {
        self.items.lock().sources.clone()
    }

    pub(crate) fn own_timers(&self) -> Vec<Timer> {
        self.items.lock().timers.clone()
    }

    pub(crate) fn own_observers(&self) -> Vec<Observer> {
        self.items.lock().observers.clone()
    }

    pub(crate) fn submodes(&self) -> Vec<ModeName> {
        self.items.lock().submodes.iter().cloned().collect()
    }

    pub fn contains_source(&self, source: &Source) -> bool {
        self.items.lock().sources.contains(source)
    }

    pub fn contains_timer(&self, timer: &Timer) -> bool {
        self.items.lock().timers.contains(timer)
    }

    pub fn contains_observer(&self, observer: &Observer) -> bool {
        self.items.lock().observers.contains(observer)
    }
}

/// Depth-first collection of sources/timers/observers across `root` and
/// every sub-mode it transitively includes, `lookup` resolving a
/// [`ModeName`] to the [`Mode`] it names (a no-op for a name with no
/// corresponding mode, e.g. a sub-mode that was named but never
/// constructed). Each mode is visited at most once even if named as a
/// sub-mode of more than one ancestor or involved in a cycle.
pub(crate) fn collect_effective<'a>(
    root: &'a Mode,
    lookup: &dyn Fn(&ModeName) -> Option<Arc<Mode>>,
) -> (Vec<Source>, Vec<Timer>, Vec<Observer>) {
    let mut visited: HashSet<ModeName> = HashSet::new();
    let mut sources = Vec::new();
    let mut timers = Vec::new();
    let mut observers = Vec::new();
    let mut stack: Vec<Arc<Mode>> = Vec::new();

    visited.insert(root.name.clone());
    sources.extend(root.own_sources());
    timers.extend(root.own_timers());
    observers.extend(root.own_observers());
    for sub in root.submodes() {
        if let Some(mode) = lookup(&sub) {
            stack.push(mode);
        }
    }

    while let Some(mode) = stack.pop() {
        if !visited.insert(mode.name().clone()) {
            continue;
        }
        sources.extend(mode.own_sources());
        timers.extend(mode.own_timers());
        observers.extend(mode.own_observers());
        for sub in mode.submodes() {
            if !visited.contains(&sub) {
                if let Some(next) = lookup(&sub) {
                    stack.push(next);
                }
            }
        }
    }

    (sources, timers, observers)
}

/// Whether a mode, including everything reachable through its sub-modes,
/// has no sources and no timers left. Mirrors `__CFRunLoopModeIsEmpty`,
/// which tests only `_sources`/`_timers`/`_submodes`: a mode holding nothing
/// but (even repeating) observers is still empty and ends a run as
/// `RunResult::Finished`.
pub(crate) fn is_effectively_empty(
    root: &Mode,
    lookup: &dyn Fn(&ModeName) -> Option<Arc<Mode>>,
) -> bool {
    let (sources, timers, _observers) = collect_effective(root, lookup);
    sources.is_empty() && timers.is_empty()
}
