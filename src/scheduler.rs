//! Run-state selection for the cooperative main loop.
//!
//! The loop either dispatches the periodic tasks, idles until the next
//! dispatch (plain sleep), or stops the clocks entirely (deep sleep) when
//! nothing can need it for a while. Deep sleep stops the tick counter, so a
//! [`MonotonicClock`] adds back the time the RTC saw pass.

use embassy_time::{Duration, Instant};

use crate::charger::ChargerStatus;
use crate::config::{
    HOST_COMMAND_WINDOW, HOST_QUIET_BEFORE_LOW_POWER, LOW_POWER_MAX_SLEEP, LOW_POWER_REENTRY_DELAY,
    SAMPLING_SETTLE_TIME, TASK_PERIOD,
};
use crate::events::EventFlags;
use crate::storage::{Key, NonVolatileStore, StoreError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RunState {
    Normal,
    /// CPU halted, peripherals and tick running.
    Sleep,
    /// Clocks stopped, RTC and wake lines armed.
    LowPower,
}

/// Board services the main loop needs.
#[allow(async_fn_in_trait)]
pub trait Platform {
    /// Raw tick counter time; stops during deep sleep.
    fn now(&self) -> Instant;
    /// RTC time in milliseconds; keeps running during deep sleep.
    fn rtc_millis(&self) -> u64;
    fn button_held(&self) -> bool;
    fn pause_sampling(&mut self);
    fn resume_sampling(&mut self);
    /// Idles at `depth` for at most `max`, returning early when an event is raised.
    async fn idle(&mut self, depth: RunState, max: Duration, events: &EventFlags);
}

/// Tick time corrected for periods the tick counter was stopped.
#[derive(Clone, Copy, Debug)]
pub struct MonotonicClock {
    offset: Duration,
}

impl MonotonicClock {
    pub const fn new() -> Self {
        Self {
            offset: Duration::from_ticks(0),
        }
    }

    pub fn now(&self, raw: Instant) -> Instant {
        raw + self.offset
    }

    /// Adds whatever part of `rtc_elapsed` the tick counter did not see.
    pub fn compensate(&mut self, raw_elapsed: Duration, rtc_elapsed: Duration) {
        if rtc_elapsed > raw_elapsed {
            self.offset += rtc_elapsed - raw_elapsed;
        }
    }

    pub fn offset(&self) -> Duration {
        self.offset
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Period encoded in a watchdog configuration word.
///
/// The low 15 bits count minutes; with bit 15 set they count four-minute
/// units instead. Zero disables the watchdog.
pub const fn watchdog_period(config: u16) -> Option<Duration> {
    let count = (config & 0x7FFF) as u64;
    if count == 0 {
        return None;
    }
    let minutes = if config & 0x8000 != 0 { count * 4 } else { count };
    Some(Duration::from_secs(minutes * 60))
}

/// Configuration word for a period of `minutes`, rounding up when the
/// coarse resolution is needed.
pub const fn watchdog_config(minutes: u32) -> u16 {
    if minutes <= 0x7FFF {
        return minutes as u16;
    }
    let units = minutes.div_ceil(4);
    0x8000 | if units > 0x7FFF { 0x7FFF } else { units as u16 }
}

/// Host liveness watchdog: unless kicked by host traffic within the period,
/// the host gets power-cycled.
pub struct HostWatchdog {
    config: u16,
    deadline: Option<Instant>,
}

impl HostWatchdog {
    pub const fn new() -> Self {
        Self {
            config: 0,
            deadline: None,
        }
    }

    pub fn load(&mut self, store: &mut impl NonVolatileStore, now: Instant) {
        self.config = store.read_u16(Key::WatchdogLo, Key::WatchdogHi).unwrap_or(0);
        self.arm(now);
    }

    pub fn configure(
        &mut self,
        store: &mut impl NonVolatileStore,
        config: u16,
        now: Instant,
    ) -> Result<(), StoreError> {
        self.config = config;
        self.arm(now);
        store.write_u16(Key::WatchdogLo, Key::WatchdogHi, config)
    }

    fn arm(&mut self, now: Instant) {
        self.deadline = watchdog_period(self.config).map(|period| now + period);
    }

    pub fn kick(&mut self, now: Instant) {
        if self.deadline.is_some() {
            self.arm(now);
        }
    }

    /// True once per expiry; the watchdog re-arms itself.
    pub fn expired(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.arm(now);
                true
            }
            _ => false,
        }
    }

    pub fn config(&self) -> u16 {
        self.config
    }
}

impl Default for HostWatchdog {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DeferredAction {
    PowerOff,
    PowerOn,
}

/// Host power switching requested for a later time.
#[derive(Default)]
pub struct DeferredActions {
    power_off_at: Option<Instant>,
    power_on_at: Option<Instant>,
}

impl DeferredActions {
    pub const fn new() -> Self {
        Self {
            power_off_at: None,
            power_on_at: None,
        }
    }

    pub fn schedule(&mut self, action: DeferredAction, at: Instant) {
        match action {
            DeferredAction::PowerOff => self.power_off_at = Some(at),
            DeferredAction::PowerOn => self.power_on_at = Some(at),
        }
    }

    pub fn cancel(&mut self, action: DeferredAction) {
        match action {
            DeferredAction::PowerOff => self.power_off_at = None,
            DeferredAction::PowerOn => self.power_on_at = None,
        }
    }

    /// Pops the next due action, power-off first.
    pub fn take_due(&mut self, now: Instant) -> Option<DeferredAction> {
        if self.power_off_at.is_some_and(|t| now >= t) {
            self.power_off_at = None;
            return Some(DeferredAction::PowerOff);
        }
        if self.power_on_at.is_some_and(|t| now >= t) {
            self.power_on_at = None;
            return Some(DeferredAction::PowerOn);
        }
        None
    }

    pub fn pending(&self, action: DeferredAction) -> Option<Instant> {
        match action {
            DeferredAction::PowerOff => self.power_off_at,
            DeferredAction::PowerOn => self.power_on_at,
        }
    }
}

/// Dispatch timing and idle-depth policy.
pub struct Scheduler {
    clock: MonotonicClock,
    state: RunState,
    next_dispatch: Option<Instant>,
    last_host_command: Option<Instant>,
    low_power_exit: Option<Instant>,
    settle_until: Option<Instant>,
}

impl Scheduler {
    pub const fn new() -> Self {
        Self {
            clock: MonotonicClock::new(),
            state: RunState::Normal,
            next_dispatch: None,
            last_host_command: None,
            low_power_exit: None,
            settle_until: None,
        }
    }

    pub fn now(&self, raw: Instant) -> Instant {
        self.clock.now(raw)
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: RunState) {
        if state != self.state {
            trace!("scheduler: {}", state);
            self.state = state;
        }
    }

    pub fn note_host_command(&mut self, now: Instant) {
        self.last_host_command = Some(now);
    }

    fn host_quiet(&self, now: Instant) -> bool {
        self.last_host_command
            .is_none_or(|t| now.saturating_duration_since(t) >= HOST_QUIET_BEFORE_LOW_POWER)
    }

    /// Something wants the loop awake right now.
    pub fn needs_attention(&self, now: Instant, charger_poll: bool, rails_poll: bool, events_pending: bool) -> bool {
        let recent_command = self
            .last_host_command
            .is_some_and(|t| now.saturating_duration_since(t) < HOST_COMMAND_WINDOW);
        events_pending || charger_poll || rails_poll || recent_command
    }

    pub fn dispatch_due(&self, now: Instant) -> bool {
        self.next_dispatch.is_none_or(|t| now >= t)
    }

    pub fn mark_dispatched(&mut self, now: Instant) {
        self.next_dispatch = Some(now + TASK_PERIOD);
    }

    /// Idle depth once nothing needs attention. Deep sleep requires a quiet
    /// host, no input source at the charger, no held button and a short gap
    /// since the last deep sleep.
    pub fn select_idle(&self, now: Instant, charger: ChargerStatus, button_held: bool) -> RunState {
        let reentry_ok = self
            .low_power_exit
            .is_none_or(|t| now.saturating_duration_since(t) >= LOW_POWER_REENTRY_DELAY);
        if self.host_quiet(now) && reentry_ok && charger == ChargerStatus::NoSource && !button_held {
            RunState::LowPower
        } else {
            RunState::Sleep
        }
    }

    /// Longest idle at `depth` starting at `now`.
    pub fn idle_budget(&self, now: Instant, depth: RunState) -> Duration {
        match depth {
            RunState::Normal => Duration::from_ticks(0),
            RunState::Sleep => self
                .next_dispatch
                .map_or(TASK_PERIOD, |t| t.saturating_duration_since(now)),
            RunState::LowPower => LOW_POWER_MAX_SLEEP,
        }
    }

    /// Books a deep sleep: corrects the clock and starts the settle window.
    /// Returns the corrected time.
    pub fn on_low_power_exit(&mut self, raw_now: Instant, raw_elapsed: Duration, rtc_elapsed: Duration) -> Instant {
        self.clock.compensate(raw_elapsed, rtc_elapsed);
        let now = self.clock.now(raw_now);
        self.low_power_exit = Some(now);
        self.settle_until = Some(now + SAMPLING_SETTLE_TIME);
        now
    }

    /// Remaining settle time after a deep sleep, if any.
    pub fn settling(&self, now: Instant) -> Option<Duration> {
        self.settle_until
            .filter(|&t| now < t)
            .map(|t| t.saturating_duration_since(now))
    }

    pub fn clock(&self) -> &MonotonicClock {
        &self.clock
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
