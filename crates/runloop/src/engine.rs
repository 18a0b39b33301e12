//! The loop engine: mode activation, wake-up routing, and one iteration's
//! fire ordering and dispatch policy.
//!
//! This is `CFRunLoopRun`/`CFRunLoopRunInMode`/`__CFRunLoopRun` generalized:
//! a per-thread [`Loop`] owns a set of named [`Mode`]s, and running a mode
//! repeatedly fires observer phases, drains signalled manual sources,
//! blocks on the mode's effective wait set, and dispatches whatever woke it,
//! until a termination condition is met. See the module docs on [`mode`]
//! for how sub-modes are traversed and [`timer`] for why this crate
//! computes the nearest deadline instead of registering one wait handle per
//! timer.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace, warn};

use crate::clock::{deadline_from_seconds, Clock, MonotonicClock};
use crate::mode::{self, Mode, ModeName, COMMON_MODE_NAME};
use crate::observer::{self, Activity, Observer};
use crate::options::{LoopOptions, WaitBackendKind};
use crate::source::Source;
use crate::timer::{self, Timer};
use crate::wait::{self, InMemoryWaitBackend, Token, WaitBackend, WaitOutcome, Waker};
use crate::LoopError;

/// The mode a bare [`Loop::run`] drives, and the one every loop tags as
/// common at construction. Mirrors `kCFRunLoopDefaultMode`.
pub const DEFAULT_MODE_NAME: &str = "kCFRunLoopDefaultMode";

static NEXT_LOOP_ID: AtomicU64 = AtomicU64::new(1);

/// The outcome of one call to [`Loop::run_in_mode`]. Values match
/// CFRunLoop's own `kCFRunLoopRunFinished`/`Stopped`/`TimedOut`/
/// `HandledSource` numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum RunResult {
    /// The mode became empty (no valid sources, timers or non-empty
    /// sub-modes left to service).
    Finished = 1,
    /// [`Loop::stop`] or [`Loop::stop_mode`] fired.
    Stopped = 2,
    /// `seconds` elapsed with nothing else to report.
    TimedOut = 3,
    /// `return_after_handled` was set and a manual source ran.
    HandledSource = 4,
}

#[derive(Default)]
struct CommonItems {
    sources: Vec<Source>,
    timers: Vec<Timer>,
    observers: Vec<Observer>,
}

/// A per-thread event loop. See the module docs for the engine algorithm and
/// the crate's top-level docs for the mode/source/timer/observer model this
/// drives.
pub struct Loop {
    id: u64,
    owner: std::thread::ThreadId,
    options: LoopOptions,
    clock: Arc<dyn Clock>,
    backend: Mutex<Box<dyn WaitBackend>>,
    waker: Waker,
    registered_ports: Mutex<HashSet<u64>>,
    modes: RwLock<HashMap<ModeName, Arc<Mode>>>,
    common_modes: Mutex<HashSet<ModeName>>,
    common_items: Mutex<CommonItems>,
    current_mode: Mutex<Option<ModeName>>,
    stop_flag: AtomicBool,
    sleeping: AtomicBool,
    deallocating: AtomicBool,
}

impl Loop {
    /// Build a loop with default options. Used by [`current`]/[`main`] to
    /// lazily create the per-thread and main-thread singletons.
    pub fn new_unregistered() -> Self {
        Self::with_options(LoopOptions::default())
    }

    /// Build a loop with explicit options, panicking if the wait backend's
    /// kernel primitives can't be allocated. This failure is fatal: a loop
    /// that can't build its wake handle cannot satisfy its contract, so
    /// there is no degraded mode to fall back to.
    pub fn with_options(options: LoopOptions) -> Self {
        Self::try_with_options(options).expect("runloop: failed to construct wait backend")
    }

    /// Fallible form of [`Self::with_options`], for callers that want to
    /// handle backend construction failure themselves instead of panicking.
    pub fn try_with_options(options: LoopOptions) -> Result<Self, LoopError> {
        let backend: Box<dyn WaitBackend> = match options.backend {
            WaitBackendKind::Native => Box::new(wait::NativeWaitBackend::new()?),
            WaitBackendKind::InMemory => Box::new(InMemoryWaitBackend::new()),
        };
        let waker = backend.waker();
        let default_mode = ModeName::new(DEFAULT_MODE_NAME);
        let mut modes = HashMap::new();
        modes.insert(default_mode.clone(), Arc::new(Mode::new(default_mode.clone())));
        let mut common_modes = HashSet::new();
        common_modes.insert(default_mode);

        Ok(Self {
            id: NEXT_LOOP_ID.fetch_add(1, Ordering::Relaxed),
            owner: std::thread::current().id(),
            options,
            clock: Arc::new(MonotonicClock),
            backend: Mutex::new(backend),
            waker,
            registered_ports: Mutex::new(HashSet::new()),
            modes: RwLock::new(modes),
            common_modes: Mutex::new(common_modes),
            common_items: Mutex::new(CommonItems::default()),
            current_mode: Mutex::new(None),
            stop_flag: AtomicBool::new(false),
            sleeping: AtomicBool::new(false),
            deallocating: AtomicBool::new(false),
        })
    }

    /// The loop bound to the calling thread, created on first use.
    pub fn current() -> Arc<Loop> {
        crate::registry::current()
    }

    /// The process's designated main-thread loop, created on first use.
    pub fn main() -> Arc<Loop> {
        crate::registry::main()
    }

    /// Identity used by the perform-enqueue adapter's `(loop, mode)` map;
    /// stable for the lifetime of this loop, not reused after it drops.
    pub fn id(&self) -> u64 {
        self.id
    }

    // ---- run / run_in_mode -------------------------------------------

    /// Run the default mode repeatedly (a ten-billion-second budget per
    /// call) until a pass returns [`RunResult::Stopped`] or
    /// [`RunResult::Finished`]. `TimedOut`/`HandledSource` can't terminate a
    /// bare `run()` since `return_after_handled` is always `false` here and
    /// the per-call budget is effectively unbounded.
    pub fn run(&self) -> RunResult {
        loop {
            match self.run_in_mode(DEFAULT_MODE_NAME, 1e10, false) {
                RunResult::Stopped => return RunResult::Stopped,
                RunResult::Finished => return RunResult::Finished,
                RunResult::TimedOut | RunResult::HandledSource => continue,
            }
        }
    }

    /// One call to the engine: run `mode` until it finishes, is stopped,
    /// times out after `seconds`, or (if `return_after_handled`) a single
    /// manual source has run. See the module docs for the full algorithm.
    pub fn run_in_mode(
        &self,
        mode: impl Into<ModeName>,
        seconds: f64,
        return_after_handled: bool,
    ) -> RunResult {
        debug_assert_eq!(
            std::thread::current().id(),
            self.owner,
            "runloop: run_in_mode called from a thread that doesn't own this loop"
        );

        let mode_name = mode.into();
        debug!(mode = %mode_name, seconds, return_after_handled, "run_in_mode: enter");

        let lookup = |n: &ModeName| self.mode_for(n, false);

        let Some(mode_ref) = self.mode_for(&mode_name, false) else {
            debug!(mode = %mode_name, "run_in_mode: no such mode => finished");
            return RunResult::Finished;
        };
        if mode::is_effectively_empty(&mode_ref, &lookup) {
            debug!(mode = %mode_name, "run_in_mode: empty => finished");
            return RunResult::Finished;
        }

        let now = self.clock.now();
        let user_deadline = deadline_from_seconds(now, seconds);

        *self.current_mode.lock() = Some(mode_name.clone());
        self.fire_observers(&mode_ref, Activity::ENTRY);

        let result = loop {
            mode_ref.prune_invalid();

            self.fire_observers(&mode_ref, Activity::BEFORE_TIMERS);
            self.fire_observers(&mode_ref, Activity::BEFORE_SOURCES);

            let (sources, timers, _observers) = mode::collect_effective(&mode_ref, &lookup);

            let mut due_sources: Vec<Source> = sources
                .iter()
                .filter(|s| !s.is_port() && s.is_signalled() && s.is_valid())
                .cloned()
                .collect();
            due_sources.sort_by(|a, b| a.order().cmp(&b.order()).then(a.id().cmp(&b.id())));

            let mut handled_source = false;
            for s in &due_sources {
                if !s.is_valid() {
                    continue;
                }
                trace!(order = s.order(), "source dispatched");
                s.dispatch(None);
                handled_source = true;
                if return_after_handled {
                    break;
                }
            }

            if return_after_handled && handled_source {
                break RunResult::HandledSource;
            }
            if self.stop_flag.swap(false, Ordering::AcqRel) {
                break RunResult::Stopped;
            }
            if mode_ref.take_stop() {
                break RunResult::Stopped;
            }

            // Dispatch whatever's already due without blocking; this plays
            // the role a per-timer kernel port's fire would, minus the extra
            // wait() round trip (see timer.rs module docs).
            let now = self.clock.now();
            let due_timers = timer::due_timers_sorted(&timers, now);
            if !due_timers.is_empty() {
                for t in &due_timers {
                    if t.is_valid() {
                        trace!(order = t.order(), "timer dispatched");
                        t.fire(now);
                    }
                }
                continue;
            }

            self.fire_observers(&mode_ref, Activity::BEFORE_WAITING);
            self.sleeping.store(true, Ordering::Release);

            let timer_deadline = timers.iter().map(|t| t.deadline()).min();
            let effective_deadline = match timer_deadline {
                Some(td) => td.min(user_deadline),
                None => user_deadline,
            };

            self.sync_port_registrations(&sources);

            let outcome = loop {
                let mut backend = self.backend.lock();
                match backend.wait(Some(effective_deadline), self.options.scratch_buffer) {
                    WaitOutcome::Interrupted => continue,
                    other => break other,
                }
            };

            self.sleeping.store(false, Ordering::Release);
            self.fire_observers(&mode_ref, Activity::AFTER_WAITING);

            match outcome {
                WaitOutcome::Woke => {}
                WaitOutcome::Interrupted => unreachable!("retried above"),
                WaitOutcome::TimedOut => {
                    let now = self.clock.now();
                    if now >= user_deadline {
                        break RunResult::TimedOut;
                    }
                    // The nearer of the two deadlines was a timer's, not the
                    // caller's; it'll be picked up as `due_timers` above on
                    // the next pass.
                }
                WaitOutcome::Port(token, message) => {
                    if let Some(source) = sources.iter().find(|s| s.id() == token.0) {
                        trace!(order = source.order(), "port source dispatched");
                        source.dispatch(Some(message));
                    } else {
                        warn!(token = token.0, "woke for a port with no matching source");
                    }
                }
            }

            if self.stop_flag.swap(false, Ordering::AcqRel) {
                break RunResult::Stopped;
            }
            if mode_ref.take_stop() {
                break RunResult::Stopped;
            }
            if mode::is_effectively_empty(&mode_ref, &lookup) {
                break RunResult::Finished;
            }
        };

        self.fire_observers(&mode_ref, Activity::EXIT);
        *self.current_mode.lock() = None;
        debug!(mode = %mode_name, ?result, "run_in_mode: exit");
        result
    }

    /// Ask the loop to stop at the next safe point (after the callback
    /// currently running, before the next blocking wait) and wake it if
    /// it's blocked.
    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::Release);
        self.wake_up();
    }

    /// Scoped version of [`Self::stop`]: only the named mode's current (or
    /// next) pass is asked to stop.
    pub fn stop_mode(&self, mode: impl Into<ModeName>) {
        if let Some(mode) = self.mode_for(&mode.into(), false) {
            mode.request_stop();
        }
        self.wake_up();
    }

    /// Make a blocked (or about-to-block) call to [`Self::run_in_mode`]
    /// return promptly. Safe to call from any thread.
    pub fn wake_up(&self) {
        (self.waker)();
    }

    /// Whether the loop is currently blocked in its wait phase.
    pub fn is_waiting(&self) -> bool {
        self.sleeping.load(Ordering::Acquire)
    }

    // ---- registration --------------------------------------------------

    pub fn add_source(&self, source: Source, mode: impl Into<ModeName>) {
        let mode_name = mode.into();
        if self.deallocating.load(Ordering::Acquire) || !source.is_valid() {
            return;
        }
        if mode_name.is_common() {
            self.common_items.lock().sources.push(source.clone());
            for m in self.common_modes_snapshot() {
                self.add_source_into(&source, &m);
            }
            return;
        }
        self.add_source_into(&source, &mode_name);
    }

    pub fn remove_source(&self, source: &Source, mode: impl Into<ModeName>) {
        let mode_name = mode.into();
        if mode_name.is_common() {
            self.common_items.lock().sources.retain(|s| s != source);
            for m in self.common_modes_snapshot() {
                self.remove_source_from(source, &m);
            }
            return;
        }
        self.remove_source_from(source, &mode_name);
    }

    pub fn add_timer(&self, timer: Timer, mode: impl Into<ModeName>) {
        let mode_name = mode.into();
        if self.deallocating.load(Ordering::Acquire) || !timer.is_valid() {
            return;
        }
        if mode_name.is_common() {
            self.common_items.lock().timers.push(timer.clone());
            for m in self.common_modes_snapshot() {
                self.add_timer_into(&timer, &m);
            }
            return;
        }
        self.add_timer_into(&timer, &mode_name);
    }

    pub fn remove_timer(&self, timer: &Timer, mode: impl Into<ModeName>) {
        let mode_name = mode.into();
        if mode_name.is_common() {
            self.common_items.lock().timers.retain(|t| t != timer);
            for m in self.common_modes_snapshot() {
                self.remove_timer_from(timer, &m);
            }
            return;
        }
        self.remove_timer_from(timer, &mode_name);
    }

    pub fn add_observer(&self, observer: Observer, mode: impl Into<ModeName>) {
        let mode_name = mode.into();
        if self.deallocating.load(Ordering::Acquire) || !observer.is_valid() {
            return;
        }
        if mode_name.is_common() {
            self.common_items.lock().observers.push(observer.clone());
            for m in self.common_modes_snapshot() {
                self.add_observer_into(&observer, &m);
            }
            return;
        }
        self.add_observer_into(&observer, &mode_name);
    }

    pub fn remove_observer(&self, observer: &Observer, mode: impl Into<ModeName>) {
        let mode_name = mode.into();
        if mode_name.is_common() {
            self.common_items.lock().observers.retain(|o| o != observer);
            for m in self.common_modes_snapshot() {
                self.remove_observer_from(observer, &m);
            }
            return;
        }
        self.remove_observer_from(observer, &mode_name);
    }

    /// Declare `submode` as a sub-mode of `mode`: every source, timer and
    /// observer reachable from `submode` becomes reachable from `mode` too
    /// (transitively, per [`crate::mode::collect_effective`]'s DFS). Neither
    /// mode needs to already have items registered; both are created on
    /// first reference, matching `add_source`/`add_timer`/`add_observer`.
    pub fn add_submode(&self, mode: impl Into<ModeName>, submode: impl Into<ModeName>) {
        if self.deallocating.load(Ordering::Acquire) {
            return;
        }
        let mode_ref = self.get_or_create_mode(&mode.into());
        mode_ref.add_submode(submode.into());
    }

    /// Tag `name` as common: fold it into the common-mode set and replicate
    /// every item currently held under the magic common name into it.
    /// Existing modes with this name keep their own items; this only adds.
    pub fn add_common_mode(&self, name: impl Into<ModeName>) {
        if self.deallocating.load(Ordering::Acquire) {
            return;
        }
        let mode_name = name.into();
        let is_new = self.common_modes.lock().insert(mode_name.clone());
        if !is_new {
            return;
        }
        let mode_ref = self.get_or_create_mode(&mode_name);
        let items = self.common_items.lock();
        for s in &items.sources {
            mode_ref.add_source(s.clone());
            s.note_scheduled(self.id, mode_name.clone());
        }
        for t in &items.timers {
            mode_ref.add_timer(t.clone());
        }
        for o in &items.observers {
            mode_ref.add_observer(o.clone());
        }
        debug!(mode = %mode_name, "mode tagged common");
    }

    /// Drop `name` from the common-mode set. Items already replicated into
    /// it stay put; only future common-mode fan-out stops reaching it.
    pub fn remove_common_mode(&self, name: impl Into<ModeName>) {
        self.common_modes.lock().remove(&name.into());
    }

    pub fn contains_source(&self, source: &Source, mode: impl Into<ModeName>) -> bool {
        let mode_name = mode.into();
        if mode_name.is_common() {
            return self.common_items.lock().sources.contains(source);
        }
        self.mode_for(&mode_name, false)
            .map(|m| m.contains_source(source))
            .unwrap_or(false)
    }

    pub fn contains_timer(&self, timer: &Timer, mode: impl Into<ModeName>) -> bool {
        let mode_name = mode.into();
        if mode_name.is_common() {
            return self.common_items.lock().timers.contains(timer);
        }
        self.mode_for(&mode_name, false)
            .map(|m| m.contains_timer(timer))
            .unwrap_or(false)
    }

    pub fn contains_observer(&self, observer: &Observer, mode: impl Into<ModeName>) -> bool {
        let mode_name = mode.into();
        if mode_name.is_common() {
            return self.common_items.lock().observers.contains(observer);
        }
        self.mode_for(&mode_name, false)
            .map(|m| m.contains_observer(observer))
            .unwrap_or(false)
    }

    /// Every mode name this loop has ever created, common or not.
    pub fn copy_all_modes(&self) -> Vec<ModeName> {
        self.modes.read().keys().cloned().collect()
    }

    /// The mode presently being run, if any.
    pub fn copy_current_mode(&self) -> Option<ModeName> {
        self.current_mode.lock().clone()
    }

    // ---- internals -----------------------------------------------------

    fn common_modes_snapshot(&self) -> Vec<ModeName> {
        self.common_modes.lock().iter().cloned().collect()
    }

    fn get_or_create_mode(&self, name: &ModeName) -> Arc<Mode> {
        if let Some(existing) = self.modes.read().get(name) {
            return Arc::clone(existing);
        }
        Arc::clone(
            self.modes
                .write()
                .entry(name.clone())
                .or_insert_with(|| Arc::new(Mode::new(name.clone()))),
        )
    }

    fn mode_for(&self, name: &ModeName, create: bool) -> Option<Arc<Mode>> {
        if create {
            Some(self.get_or_create_mode(name))
        } else {
            self.modes.read().get(name).cloned()
        }
    }

    fn add_source_into(&self, source: &Source, mode_name: &ModeName) {
        let mode = self.get_or_create_mode(mode_name);
        mode.add_source(source.clone());
        source.note_scheduled(self.id, mode_name.clone());
        trace!(order = source.order(), mode = %mode_name, "source added");
    }

    fn remove_source_from(&self, source: &Source, mode_name: &ModeName) {
        if let Some(mode) = self.mode_for(mode_name, false) {
            mode.remove_source(source);
            source.note_unscheduled(self.id, mode_name);
        }
    }

    fn add_timer_into(&self, timer: &Timer, mode_name: &ModeName) {
        let mode = self.get_or_create_mode(mode_name);
        mode.add_timer(timer.clone());
        debug!(order = timer.order(), mode = %mode_name, "timer armed");
    }

    fn remove_timer_from(&self, timer: &Timer, mode_name: &ModeName) {
        if let Some(mode) = self.mode_for(mode_name, false) {
            mode.remove_timer(timer);
        }
    }

    fn add_observer_into(&self, observer: &Observer, mode_name: &ModeName) {
        let mode = self.get_or_create_mode(mode_name);
        mode.add_observer(observer.clone());
    }

    fn remove_observer_from(&self, observer: &Observer, mode_name: &ModeName) {
        if let Some(mode) = self.mode_for(mode_name, false) {
            mode.remove_observer(observer);
        }
    }

    fn fire_observers(&self, mode: &Mode, activity: Activity) {
        let lookup = |n: &ModeName| self.mode_for(n, false);
        let (_, _, observers) = mode::collect_effective(mode, &lookup);
        for o in observer::firing_order(&observers, activity) {
            trace!(?activity, order = o.order(), "observer fired");
            o.fire(activity);
        }
    }

    /// Reconcile the wait backend's registered port set with the port
    /// sources currently reachable from the mode being run. Re-registering
    /// an already-known token is cheap and covers a source whose `get_port`
    /// rotates its underlying handle between runs.
    fn sync_port_registrations(&self, sources: &[Source]) {
        let mut backend = self.backend.lock();
        let mut registered = self.registered_ports.lock();
        let mut live = HashSet::with_capacity(sources.len());
        for s in sources {
            if let Some(handle) = s.raw_waitable() {
                live.insert(s.id());
                registered.insert(s.id());
                if let Err(err) = backend.register(Token(s.id()), handle) {
                    warn!(?err, order = s.order(), "failed to register port source");
                }
            }
        }
        registered.retain(|id| {
            let keep = live.contains(id);
            if !keep {
                backend.unregister(Token(*id));
            }
            keep
        });
    }
}

impl Drop for Loop {
    /// Mirrors `__CFRunLoopDeallocate`'s three-pass cancellation, minus the
    /// per-platform free: every remaining source/timer/observer across
    /// every mode this loop ever created is invalidated. `deallocating` is
    /// set first so any `add_*` reached transitively from a cancel callback
    /// is a silent no-op, rejecting re-registration during teardown.
    fn drop(&mut self) {
        self.deallocating.store(true, Ordering::Release);
        let modes: Vec<Arc<Mode>> = self.modes.read().values().cloned().collect();
        for mode in &modes {
            for source in mode.own_sources() {
                source.invalidate();
            }
        }
        for mode in &modes {
            for timer in mode.own_timers() {
                timer.invalidate();
            }
        }
        for mode in &modes {
            for observer in mode.own_observers() {
                observer.invalidate();
            }
        }
        crate::perform::remove_loop(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    fn in_memory_loop() -> Loop {
        Loop::with_options(LoopOptions {
            backend: WaitBackendKind::InMemory,
            ..LoopOptions::default()
        })
    }

    #[test]
    fn empty_default_mode_finishes_immediately() {
        let lp = in_memory_loop();
        assert_eq!(
            lp.run_in_mode(DEFAULT_MODE_NAME, 1.0, false),
            RunResult::Finished
        );
    }

    #[test]
    fn signalled_manual_source_runs_then_mode_finishes() {
        let lp = in_memory_loop();
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = Arc::clone(&ran);
        // The source invalidates itself from inside its own callback, the
        // supported "call back into this same source" pattern documented on
        // `Source::dispatch` -- this is what lets the mode go empty (and
        // the pass terminate `Finished`) without a second item hanging
        // around to force a real wait.
        let handle_slot: Arc<Mutex<Option<crate::source::SourceHandle>>> =
            Arc::new(Mutex::new(None));
        let slot2 = Arc::clone(&handle_slot);
        let source = Source::manual(0, move |_| {
            ran2.store(true, Ordering::SeqCst);
            if let Some(h) = slot2.lock().as_ref() {
                h.invalidate();
            }
        });
        *handle_slot.lock() = Some(source.handle());
        lp.add_source(source.clone(), DEFAULT_MODE_NAME);
        source.signal();
        let result = lp.run_in_mode(DEFAULT_MODE_NAME, 1.0, false);
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(result, RunResult::Finished);
    }

    #[test]
    fn return_after_handled_stops_after_one_source() {
        let lp = in_memory_loop();
        let order = Arc::new(Mutex::new(Vec::new()));
        let o1 = Arc::clone(&order);
        let s1 = Source::manual(1, move |_| o1.lock().push(1));
        let o2 = Arc::clone(&order);
        let s2 = Source::manual(2, move |_| o2.lock().push(2));
        lp.add_source(s1.clone(), DEFAULT_MODE_NAME);
        lp.add_source(s2.clone(), DEFAULT_MODE_NAME);
        s1.signal();
        s2.signal();

        let result = lp.run_in_mode(DEFAULT_MODE_NAME, 1.0, true);
        assert_eq!(result, RunResult::HandledSource);
        assert_eq!(*order.lock(), vec![1]);
        assert!(s2.is_signalled());
    }

    #[test]
    fn observers_fire_in_order_across_submodes() {
        let lp = in_memory_loop();
        let order = Arc::new(Mutex::new(Vec::new()));

        let oa_log = Arc::clone(&order);
        let oa = Observer::new(10, Activity::BEFORE_TIMERS, false, move |_| {
            oa_log.lock().push("a")
        });
        let ob_log = Arc::clone(&order);
        let ob = Observer::new(5, Activity::BEFORE_TIMERS, false, move |_| {
            ob_log.lock().push("b")
        });

        lp.add_observer(oa, "A");
        lp.add_observer(ob, "B");
        lp.add_submode("A", "B");
        // Keep the mode alive: an observer-only mode with no sources/timers
        // is otherwise `Finished` before the first pass completes.
        let keepalive = Source::manual(0, |_| {});
        lp.add_source(keepalive.clone(), "A");
        keepalive.invalidate();

        lp.run_in_mode("A", 0.05, false);
        assert_eq!(*order.lock(), vec!["b", "a"]);
    }

    #[test]
    fn mode_with_only_a_repeating_observer_finishes_immediately() {
        let lp = in_memory_loop();
        let observer = Observer::new(0, Activity::ALL, true, |_| {});
        lp.add_observer(observer, DEFAULT_MODE_NAME);
        assert_eq!(
            lp.run_in_mode(DEFAULT_MODE_NAME, 1.0, false),
            RunResult::Finished
        );
    }

    #[test]
    fn stop_returns_immediately() {
        let lp = Arc::new(in_memory_loop());
        let keepalive = Source::manual(0, |_| {});
        lp.add_source(keepalive.clone(), DEFAULT_MODE_NAME);
        lp.stop();
        assert_eq!(lp.run_in_mode(DEFAULT_MODE_NAME, 5.0, false), RunResult::Stopped);
        keepalive.invalidate();
    }

    #[test]
    fn common_mode_fan_out_reaches_new_common_mode() {
        let lp = in_memory_loop();
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = Arc::clone(&fired);
        let source = Source::manual(0, move |_| fired2.store(true, Ordering::SeqCst));
        lp.add_source(source.clone(), COMMON_MODE_NAME);
        lp.add_common_mode("alt");
        assert!(lp.contains_source(&source, "alt"));

        source.signal();
        lp.run_in_mode("alt", 0.05, false);
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn periodic_timer_catches_up_without_drift_burst() {
        let lp = in_memory_loop();
        let fires = Arc::new(AtomicUsize::new(0));
        let fires2 = Arc::clone(&fires);
        let now = Instant::now();
        let timer = Timer::new(0, now, 0.01, Some(0.01), move |_| {
            fires2.fetch_add(1, Ordering::SeqCst);
            // Sleeping past several intervals must still only catch up to
            // "now", not replay every missed tick as a burst.
            std::thread::sleep(Duration::from_millis(40));
        });
        lp.add_timer(timer.clone(), DEFAULT_MODE_NAME);

        lp.run_in_mode(DEFAULT_MODE_NAME, 0.2, false);
        timer.invalidate();
        assert!(fires.load(Ordering::SeqCst) >= 1);
    }
}
