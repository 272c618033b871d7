//! Hot-reload coordination.
//!
//! A small state machine arbitrating when reloads may begin, when they are
//! suspended for a scheduled hot swap, and when they resume:
//!
//! ```text
//! DORMANT -- schedule --> REQUESTED
//! REQUESTED -- tick, wait elapsed, !paused --> SCHEDULED
//! REQUESTED/SCHEDULED/DELAYED -- tick, paused --> DORMANT (cancelled)
//! SCHEDULED -- tick, !paused --> EXECUTING
//! SCHEDULED -- delay --> DELAYED (retried next tick)
//! EXECUTING -- finish --> DORMANT
//! ```
//!
//! Two dialects satisfy the same observable interface: the full coordinator
//! above, and a stub that keeps reload permanently disabled. The dialect is
//! picked from configuration when the system is created.

use crate::update::UpdateSystem;
use crate::{Context, System, SystemApi, SystemCreateContext};
use bitflags::bitflags;
use kiln_base::{intern, EventIterator, EventQueue};
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

bitflags! {
    pub struct KeyModifiers: u32 {
        const LEFT_CONTROL = 1 << 0;
        const RIGHT_CONTROL = 1 << 1;
        const LEFT_SHIFT = 1 << 2;
        const RIGHT_SHIFT = 1 << 3;
        const LEFT_ALT = 1 << 4;
        const RIGHT_ALT = 1 << 5;
    }
}

/// Keyboard event fed to the coordinator by the platform layer.
#[derive(Clone, Copy, Debug)]
pub struct KeyEvent {
    pub scan_code: u32,
    pub modifiers: KeyModifiers,
    pub pressed: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HotReloadMode {
    Disabled,
    AutomaticIndependent,
    OnRequest,
}

#[derive(Clone, Debug)]
pub struct HotReloadConfig {
    pub mode: HotReloadMode,
    /// Delay between a reload request and its scheduling, coalescing bursts
    /// of file system notifications.
    pub change_wait_time_ns: u64,
    pub toggle_scan_code: u32,
    pub toggle_modifiers: KeyModifiers,
}

impl Default for HotReloadConfig {
    fn default() -> HotReloadConfig {
        HotReloadConfig {
            mode: HotReloadMode::AutomaticIndependent,
            change_wait_time_ns: 100_000_000,
            // Comma key with left control held.
            toggle_scan_code: 54,
            toggle_modifiers: KeyModifiers::LEFT_CONTROL,
        }
    }
}

//--------------------------------------------------------------------------------------------------

const STATE_DORMANT: u8 = 0;
const STATE_REQUESTED: u8 = 1;
const STATE_SCHEDULED: u8 = 2;
const STATE_DELAYED: u8 = 3;
const STATE_EXECUTING: u8 = 4;

trait Coordination: Send + Sync {
    fn mode(&self) -> HotReloadMode;
    fn is_reload_allowed(&self) -> bool;
    fn is_scheduled(&self) -> bool;
    fn is_executing(&self) -> bool;
    fn schedule(&self);
    fn delay(&self);
    fn finish(&self);
    fn change_wait_time_ns(&self) -> u64;
    fn submit_key_event(&self, event: KeyEvent);
    fn update(&self);
}

struct FullCoordination {
    config: HotReloadConfig,
    state: AtomicU8,
    paused: AtomicBool,
    requested_at: parking_lot::Mutex<Option<Instant>>,
    key_events: EventQueue<KeyEvent>,
    key_iterator: EventIterator,
}

impl FullCoordination {
    fn new(config: HotReloadConfig) -> FullCoordination {
        let key_events = EventQueue::new();
        let key_iterator = key_events.iterator_create();
        FullCoordination {
            config,
            state: AtomicU8::new(STATE_DORMANT),
            paused: AtomicBool::new(false),
            requested_at: parking_lot::Mutex::new(None),
            key_events,
            key_iterator,
        }
    }

    fn process_key_events(&self) {
        while let Some(event) = self.key_events.next(&self.key_iterator) {
            if !event.pressed
                && event.scan_code == self.config.toggle_scan_code
                && event.modifiers == self.config.toggle_modifiers
            {
                let paused = !self.paused.load(Ordering::Acquire);
                self.paused.store(paused, Ordering::Release);
                log::info!(
                    "hot reload mode: {}",
                    if paused { "paused by user" } else { "automatic" }
                );
            }
        }
    }

    fn wait_elapsed(&self) -> bool {
        let requested_at = self.requested_at.lock();
        match *requested_at {
            Some(instant) => instant.elapsed().as_nanos() as u64 >= self.config.change_wait_time_ns,
            None => true,
        }
    }
}

impl Coordination for FullCoordination {
    fn mode(&self) -> HotReloadMode {
        self.config.mode
    }

    fn is_reload_allowed(&self) -> bool {
        !self.paused.load(Ordering::Acquire)
            && self.state.load(Ordering::Acquire) == STATE_DORMANT
    }

    fn is_scheduled(&self) -> bool {
        match self.state.load(Ordering::Acquire) {
            STATE_REQUESTED | STATE_SCHEDULED | STATE_DELAYED => true,
            _ => false,
        }
    }

    fn is_executing(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_EXECUTING
    }

    fn schedule(&self) {
        // If this fails, the caller's scheduling routine is broken.
        debug_assert_eq!(self.state.load(Ordering::Acquire), STATE_DORMANT);
        *self.requested_at.lock() = Some(Instant::now());
        self.state.store(STATE_REQUESTED, Ordering::Release);
    }

    fn delay(&self) {
        debug_assert_eq!(self.state.load(Ordering::Acquire), STATE_SCHEDULED);
        self.state.store(STATE_DELAYED, Ordering::Release);
    }

    fn finish(&self) {
        debug_assert_eq!(self.state.load(Ordering::Acquire), STATE_EXECUTING);
        self.state.store(STATE_DORMANT, Ordering::Release);
    }

    fn change_wait_time_ns(&self) -> u64 {
        self.config.change_wait_time_ns
    }

    fn submit_key_event(&self, event: KeyEvent) {
        self.key_events.submit(event);
    }

    fn update(&self) {
        self.process_key_events();
        let paused = self.paused.load(Ordering::Acquire);

        loop {
            let old = self.state.load(Ordering::Acquire);
            let new = match old {
                STATE_DORMANT | STATE_EXECUTING => return,
                STATE_REQUESTED => {
                    if paused {
                        STATE_DORMANT
                    } else if self.wait_elapsed() {
                        STATE_SCHEDULED
                    } else {
                        return;
                    }
                }
                STATE_DELAYED => {
                    if paused {
                        STATE_DORMANT
                    } else {
                        STATE_SCHEDULED
                    }
                }
                STATE_SCHEDULED => {
                    if paused {
                        STATE_DORMANT
                    } else {
                        STATE_EXECUTING
                    }
                }
                _ => unreachable!(),
            };

            if self
                .state
                .compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }
}

/// Stub dialect: reload permanently disabled, every observer sees
/// constants.
struct NoCoordination;

impl Coordination for NoCoordination {
    fn mode(&self) -> HotReloadMode {
        HotReloadMode::Disabled
    }

    fn is_reload_allowed(&self) -> bool {
        false
    }

    fn is_scheduled(&self) -> bool {
        false
    }

    fn is_executing(&self) -> bool {
        false
    }

    fn schedule(&self) {
        log::warn!("hot reload schedule ignored: coordination is disabled");
    }

    fn delay(&self) {}

    fn finish(&self) {}

    fn change_wait_time_ns(&self) -> u64 {
        0
    }

    fn submit_key_event(&self, _event: KeyEvent) {}

    fn update(&self) {}
}

//--------------------------------------------------------------------------------------------------

/// The hot-reload coordination system registered into the context.
pub struct HotReloadSystem {
    inner: Box<dyn Coordination>,
}

fn create_hot_reload_system(context: &SystemCreateContext) -> Arc<dyn System> {
    let config = context
        .config_as::<HotReloadConfig>()
        .cloned()
        .unwrap_or_default();

    let inner: Box<dyn Coordination> = match config.mode {
        HotReloadMode::Disabled => Box::new(NoCoordination),
        HotReloadMode::AutomaticIndependent | HotReloadMode::OnRequest => {
            Box::new(FullCoordination::new(config))
        }
    };
    Arc::new(HotReloadSystem { inner })
}

static HOT_RELOAD_SYSTEM_API: SystemApi = SystemApi {
    name: HotReloadSystem::NAME,
    create: create_hot_reload_system,
};

impl HotReloadSystem {
    pub const NAME: &'static str = "hot_reload_coordination_system";

    pub fn api() -> &'static SystemApi {
        &HOT_RELOAD_SYSTEM_API
    }

    pub fn mode(&self) -> HotReloadMode {
        self.inner.mode()
    }

    pub fn is_reload_allowed(&self) -> bool {
        self.inner.is_reload_allowed()
    }

    pub fn is_scheduled(&self) -> bool {
        self.inner.is_scheduled()
    }

    pub fn is_executing(&self) -> bool {
        self.inner.is_executing()
    }

    /// Requests a hot swap. Only valid while reload is allowed.
    pub fn schedule(&self) {
        self.inner.schedule();
    }

    /// Postpones an already scheduled swap to the next tick.
    pub fn delay(&self) {
        self.inner.delay();
    }

    /// Reports that the executing swap is done. Only valid while executing.
    pub fn finish(&self) {
        self.inner.finish();
    }

    pub fn change_wait_time_ns(&self) -> u64 {
        self.inner.change_wait_time_ns()
    }

    pub fn submit_key_event(&self, event: KeyEvent) {
        self.inner.submit_key_event(event);
    }

    /// Advances the state machine one tick. Wired to the update system on
    /// connect; callable directly by contexts without one.
    pub fn update(&self) {
        self.inner.update();
    }
}

impl System for HotReloadSystem {
    fn connect(&self, context: &Context) {
        if let Some(update) = context.query_typed::<UpdateSystem>(UpdateSystem::NAME) {
            // Own arc through the context; self-query must not re-enter
            // connect.
            if let Some(me) = context.query_no_connect_typed::<HotReloadSystem>(Self::NAME) {
                update.connect_on_run(intern(Self::NAME), &[], move || me.update());
            }
        }
    }

    fn disconnect(&self, context: &Context) {
        if let Some(update) = context.query_no_connect_typed::<UpdateSystem>(UpdateSystem::NAME) {
            update.disconnect_on_run(intern(Self::NAME));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full(config: HotReloadConfig) -> FullCoordination {
        FullCoordination::new(config)
    }

    fn immediate_config() -> HotReloadConfig {
        HotReloadConfig {
            change_wait_time_ns: 0,
            ..HotReloadConfig::default()
        }
    }

    #[test]
    fn full_cycle() {
        let coordination = full(immediate_config());
        assert!(coordination.is_reload_allowed());
        assert!(!coordination.is_scheduled());

        coordination.schedule();
        assert!(coordination.is_scheduled());
        assert!(!coordination.is_reload_allowed());

        coordination.update();
        assert!(coordination.is_scheduled());

        coordination.update();
        assert!(coordination.is_executing());
        assert!(!coordination.is_scheduled());

        coordination.finish();
        assert!(coordination.is_reload_allowed());
    }

    #[test]
    fn pause_cancels_request() {
        let coordination = full(immediate_config());
        coordination.paused.store(true, Ordering::Release);
        assert!(!coordination.is_reload_allowed());

        coordination.schedule();
        coordination.update();
        assert!(!coordination.is_scheduled());
        assert!(!coordination.is_executing());
    }

    #[test]
    fn delay_retries_next_tick() {
        let coordination = full(immediate_config());
        coordination.schedule();
        coordination.update();
        assert_eq!(coordination.state.load(Ordering::Acquire), STATE_SCHEDULED);

        coordination.delay();
        assert!(coordination.is_scheduled());
        coordination.update();
        assert_eq!(coordination.state.load(Ordering::Acquire), STATE_SCHEDULED);
        coordination.update();
        assert!(coordination.is_executing());
    }

    #[test]
    fn wait_time_holds_request_back() {
        let coordination = full(HotReloadConfig {
            change_wait_time_ns: u64::max_value(),
            ..HotReloadConfig::default()
        });
        coordination.schedule();
        coordination.update();
        coordination.update();
        assert_eq!(coordination.state.load(Ordering::Acquire), STATE_REQUESTED);
    }

    #[test]
    fn hotkey_toggles_pause() {
        let coordination = full(immediate_config());
        coordination.submit_key_event(KeyEvent {
            scan_code: 54,
            modifiers: KeyModifiers::LEFT_CONTROL,
            pressed: false,
        });
        coordination.update();
        assert!(coordination.paused.load(Ordering::Acquire));
        assert!(!coordination.is_reload_allowed());
    }

    #[test]
    fn disabled_dialect_returns_constants() {
        let coordination = NoCoordination;
        assert!(!coordination.is_reload_allowed());
        assert!(!coordination.is_scheduled());
        assert!(!coordination.is_executing());
        coordination.schedule();
        coordination.update();
        assert!(!coordination.is_scheduled());
    }
}
