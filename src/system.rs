//! The power system: profile manager, charger, rails and scheduler bound to
//! the board's collaborators, plus the host-facing operations.

use embassy_time::{Duration, Instant};
use embedded_hal::delay::DelayNs;

use crate::charger::{ChargerBus, ChargerInputs, ChargerSync};
use crate::config::{ChargeConfig, HOST_POWER_CYCLE_OFF_TIME, InputsConfig};
use crate::events::{Event, EventFlags};
use crate::profile::{BatteryProfileManager, CustomFields, RequestError, StrapReading};
use crate::rails::{PowerRailController, RailConfig, RailDriver, RailError, WarmState};
use crate::scheduler::{DeferredAction, DeferredActions, HostWatchdog, Platform, RunState, Scheduler};
use crate::storage::{NonVolatileStore, StoreError};
use crate::telemetry::Telemetry;
use crate::units::Deciamps;

/// Everything board-specific the power system is built from.
pub struct Board<B, N, T, D, W, P> {
    pub charger_bus: B,
    pub store: N,
    pub telemetry: T,
    pub rail_driver: D,
    pub delay: W,
    pub platform: P,
    pub straps: StrapReading,
    pub warm: WarmState,
    pub rail_config: RailConfig,
}

pub struct PowerSystem<'a, B, N, T, D, W, P> {
    bus: B,
    store: N,
    telemetry: T,
    platform: P,
    events: &'a EventFlags,

    profiles: BatteryProfileManager,
    charger: ChargerSync,
    rails: PowerRailController<D, W>,

    scheduler: Scheduler,
    watchdog: HostWatchdog,
    deferred: DeferredActions,
}

impl<'a, B, N, T, D, W, P> PowerSystem<'a, B, N, T, D, W, P>
where
    B: ChargerBus,
    N: NonVolatileStore,
    T: Telemetry,
    D: RailDriver,
    W: DelayNs,
    P: Platform,
{
    /// Loads persisted state and brings every component to its boot state.
    pub fn new(board: Board<B, N, T, D, W, P>, events: &'a EventFlags) -> Self {
        let Board {
            charger_bus,
            mut store,
            telemetry,
            rail_driver,
            delay,
            platform,
            straps,
            warm,
            rail_config,
        } = board;

        let mut profiles = BatteryProfileManager::new(straps);
        profiles.initialize(&mut store);
        let profile = profiles.active_profile();

        let mut charger = ChargerSync::new();
        charger.init(&mut store);
        charger.notify_profile_changed();

        let mut rails = PowerRailController::new(rail_driver, delay, rail_config, warm);
        rails.notify_profile_changed(profile.as_ref());

        let scheduler = Scheduler::new();
        let mut watchdog = HostWatchdog::new();
        watchdog.load(&mut store, scheduler.now(platform.now()));

        info!("system: up, profile status {}", profiles.profile_status());

        Self {
            bus: charger_bus,
            store,
            telemetry,
            platform,
            events,
            profiles,
            charger,
            rails,
            scheduler,
            watchdog,
            deferred: DeferredActions::new(),
        }
    }

    pub fn now(&self) -> Instant {
        self.scheduler.now(self.platform.now())
    }

    pub async fn run(&mut self) -> ! {
        loop {
            self.iterate().await;
        }
    }

    /// One pass of the main loop. Returns the state the pass ran in.
    pub async fn iterate(&mut self) -> RunState {
        self.events.rearm();
        let now = self.now();

        if let Some(remaining) = self.scheduler.settling(now) {
            self.platform.idle(RunState::Sleep, remaining, self.events).await;
            return self.enter(RunState::Sleep);
        }

        let drained = self.drain_events(now);
        let attention = drained
            || self.profiles.has_pending_request()
            || self.scheduler.needs_attention(
                now,
                self.charger.needs_poll(now),
                self.rails.needs_poll(now),
                self.events.any_pending(),
            );

        if attention || self.scheduler.dispatch_due(now) {
            self.dispatch(now).await;
            return self.enter(RunState::Normal);
        }

        let depth = self
            .scheduler
            .select_idle(now, self.charger.status(), self.platform.button_held());
        self.idle(depth, now).await;
        self.enter(depth)
    }

    fn enter(&mut self, state: RunState) -> RunState {
        self.scheduler.set_state(state);
        state
    }

    fn drain_events(&mut self, now: Instant) -> bool {
        let mut any = false;
        if self.events.take(Event::HostCommand) {
            self.scheduler.note_host_command(now);
            self.watchdog.kick(now);
            any = true;
        }
        if self.events.take(Event::ChargerInterrupt) {
            self.charger.notify_interrupt();
            any = true;
        }
        if self.events.take(Event::RtcAlarm) {
            info!("system: rtc alarm");
            if !self.rails.boost_enabled() {
                self.deferred.schedule(DeferredAction::PowerOn, now);
            }
            any = true;
        }
        any |= self.events.take(Event::Button);
        any |= self.events.take(Event::IoWake);
        any
    }

    async fn dispatch(&mut self, now: Instant) {
        if self.profiles.task(&mut self.store) {
            let profile = self.profiles.active_profile();
            self.charger.notify_profile_changed();
            self.rails.notify_profile_changed(profile.as_ref());
        }

        if self.rails.task(now, &self.telemetry, &mut self.charger) {
            self.charger.notify_rail_status_changed();
        }

        let inputs = ChargerInputs {
            profile: self.profiles.active_profile(),
            rails: self.rails.status(),
            battery_voltage: self.telemetry.battery_voltage(),
            battery_temperature: self.telemetry.battery_temperature(),
        };
        self.charger.task(now, &mut self.bus, &inputs).await;

        self.run_host_actions(now);
        self.scheduler.mark_dispatched(now);
    }

    fn run_host_actions(&mut self, now: Instant) {
        if !self.rails.boost_enabled() {
            // nothing to power-cycle
            self.watchdog.kick(now);
        } else if self.watchdog.expired(now) {
            warn!("system: host watchdog expired, power cycling host");
            self.switch_host_power(false, now);
            self.deferred
                .schedule(DeferredAction::PowerOn, now + HOST_POWER_CYCLE_OFF_TIME);
        }

        while let Some(action) = self.deferred.take_due(now) {
            self.switch_host_power(action == DeferredAction::PowerOn, now);
        }
    }

    fn switch_host_power(&mut self, on: bool, now: Instant) {
        if let Err(e) = self.rails.set_boost_enable(on, now, &self.telemetry) {
            warn!("system: host power {} failed: {}", on, e);
        }
    }

    async fn idle(&mut self, depth: RunState, now: Instant) {
        let budget = self.scheduler.idle_budget(now, depth);
        match depth {
            RunState::Normal => {}
            RunState::Sleep => self.platform.idle(RunState::Sleep, budget, self.events).await,
            RunState::LowPower => {
                self.platform.pause_sampling();
                let raw_before = self.platform.now();
                let rtc_before = self.platform.rtc_millis();

                self.platform.idle(RunState::LowPower, budget, self.events).await;

                let raw_now = self.platform.now();
                let raw_elapsed = raw_now.saturating_duration_since(raw_before);
                let rtc_elapsed =
                    Duration::from_millis(self.platform.rtc_millis().saturating_sub(rtc_before));
                self.scheduler.on_low_power_exit(raw_now, raw_elapsed, rtc_elapsed);
                self.platform.resume_sampling();
                debug!("system: deep sleep {} ms", rtc_elapsed.as_millis());
            }
        }
    }

    // ---- host operations ----

    pub fn request_profile_change(&mut self, code: u8) -> Result<(), RequestError> {
        self.profiles.request_profile_change(code)
    }

    pub fn write_custom_profile(&mut self, fields: CustomFields) {
        self.profiles.request_custom_profile_write(fields);
    }

    pub fn set_charge_config(&mut self, config: u8) -> Result<(), StoreError> {
        self.charger.set_charge_config(&mut self.store, ChargeConfig(config))
    }

    pub fn set_inputs_config(&mut self, config: u8) -> Result<(), StoreError> {
        self.charger.set_inputs_config(&mut self.store, InputsConfig(config))
    }

    pub fn set_boost_enable(&mut self, enable: bool) -> Result<(), RailError> {
        let now = self.now();
        self.rails.set_boost_enable(enable, now, &self.telemetry)
    }

    pub fn set_aux_regulator_enable(&mut self, enable: bool) {
        self.rails.set_aux_regulator_enable(enable);
    }

    pub fn set_aux_switch_limit(&mut self, limit: Deciamps) -> Result<(), RailError> {
        self.rails.set_aux_switch_limit(limit, &self.telemetry)
    }

    pub fn set_wake_on_charge(&mut self, percent: Option<u8>) {
        self.rails.set_wake_on_charge(percent);
    }

    /// Boost was cut for undervoltage since the flag was last cleared.
    pub fn forced_power_off(&self) -> bool {
        self.rails.forced_power_off()
    }

    pub fn clear_forced_power_off(&mut self) {
        self.rails.clear_forced_power_off();
    }

    /// The output switch was shed for undervoltage since the flag was last cleared.
    pub fn forced_aux_off(&self) -> bool {
        self.rails.forced_aux_off()
    }

    pub fn clear_forced_aux_off(&mut self) {
        self.rails.clear_forced_aux_off();
    }

    pub fn configure_watchdog(&mut self, config: u16) -> Result<(), StoreError> {
        let now = self.now();
        self.watchdog.configure(&mut self.store, config, now)
    }

    pub fn watchdog_config(&self) -> u16 {
        self.watchdog.config()
    }

    /// Cuts host power after `delay`.
    pub fn schedule_power_off(&mut self, delay: Duration) {
        let at = self.now() + delay;
        self.deferred.schedule(DeferredAction::PowerOff, at);
    }

    /// Restores host power after `delay`.
    pub fn schedule_power_on(&mut self, delay: Duration) {
        let at = self.now() + delay;
        self.deferred.schedule(DeferredAction::PowerOn, at);
    }

    // ---- views ----

    pub fn profiles(&self) -> &BatteryProfileManager {
        &self.profiles
    }

    pub fn charger(&self) -> &ChargerSync {
        &self.charger
    }

    pub fn rails(&self) -> &PowerRailController<D, W> {
        &self.rails
    }

    pub fn run_state(&self) -> RunState {
        self.scheduler.state()
    }

    pub fn warm_state(&self) -> WarmState {
        self.rails.warm_state()
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    pub fn telemetry(&self) -> &T {
        &self.telemetry
    }

    pub fn platform_mut(&mut self) -> &mut P {
        &mut self.platform
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::charger::regs::{REG_BATTERY_VOLTAGE, REG_STATUS, REG_SUPPLY, STAT_SHIFT, VBREG_MASK, VBREG_SHIFT, field};
    use crate::profile::{PRESETS, ProfileStatus};
    use crate::testing::{FakeCharger, FakePlatform, FakeTelemetry, NoDelay, RamStorage, RecordingRails};
    use crate::storage::ComplementStore;
    use embassy_futures::block_on;

    type System<'a> = PowerSystem<
        'a,
        FakeCharger,
        ComplementStore<RamStorage>,
        FakeTelemetry,
        RecordingRails,
        NoDelay,
        FakePlatform,
    >;

    const NO_INPUT: u8 = 0b1111_0000;
    const ADAPTER_ONLY: u8 = 0b0011_0000;

    fn system(events: &EventFlags, supply: u8, stat: u8) -> System<'_> {
        let mut bus = FakeCharger::new();
        bus.regs[REG_SUPPLY as usize] = supply;
        bus.regs[REG_STATUS as usize] = stat << STAT_SHIFT;
        let telemetry = FakeTelemetry::new();
        telemetry.rail_5v.set(0);
        let board = Board {
            charger_bus: bus,
            store: ComplementStore::new(RamStorage::new(), 0),
            telemetry,
            rail_driver: RecordingRails::default(),
            delay: NoDelay,
            platform: FakePlatform::new(),
            straps: StrapReading {
                board_code: 0,
                aux_strap: None,
                config_code: None,
            },
            warm: WarmState::cold(),
            rail_config: RailConfig::default(),
        };
        PowerSystem::new(board, events)
    }

    /// Runs passes, advancing the raw clock `step_ms` after each, until `until_ms`.
    fn run_until(sys: &mut System<'_>, until_ms: u64, step_ms: u64) -> Vec<RunState> {
        let mut seen = Vec::new();
        while sys.now() < Instant::from_millis(until_ms) {
            seen.push(block_on(sys.iterate()));
            sys.platform_mut().advance(step_ms);
        }
        seen
    }

    #[test]
    fn boot_programs_charger_for_default_profile() {
        let events = EventFlags::new();
        let mut sys = system(&events, ADAPTER_ONLY, 0b001);
        assert_eq!(sys.profiles().profile_status(), ProfileStatus::Preset(0));
        assert_eq!(block_on(sys.iterate()), RunState::Normal);
        assert_eq!(
            field(sys.bus().regs[REG_BATTERY_VOLTAGE as usize], VBREG_MASK, VBREG_SHIFT),
            PRESETS[0].profile.regulation_voltage.0
        );
    }

    #[test]
    fn idle_board_reaches_deep_sleep() {
        let events = EventFlags::new();
        let mut sys = system(&events, NO_INPUT, 0b000);
        let seen = run_until(&mut sys, 5_000, 5);
        assert!(seen.contains(&RunState::LowPower));
        let platform = sys.platform_mut();
        assert!(platform.pauses > 0);
        assert_eq!(platform.pauses, platform.resumes);
    }

    #[test]
    fn deep_sleep_time_is_added_back() {
        let events = EventFlags::new();
        let mut sys = system(&events, NO_INPUT, 0b000);
        run_until(&mut sys, 5_000, 5);
        let raw = sys.platform_mut().raw_ms;
        assert!(sys.now() > Instant::from_millis(raw));
    }

    #[test]
    fn charger_source_prevents_deep_sleep() {
        let events = EventFlags::new();
        let mut sys = system(&events, ADAPTER_ONLY, 0b011);
        let seen = run_until(&mut sys, 5_000, 5);
        assert!(!seen.contains(&RunState::LowPower));
        assert!(seen.contains(&RunState::Sleep));
    }

    #[test]
    fn held_button_prevents_deep_sleep() {
        let events = EventFlags::new();
        let mut sys = system(&events, NO_INPUT, 0b000);
        sys.platform_mut().button = true;
        let seen = run_until(&mut sys, 5_000, 5);
        assert!(!seen.contains(&RunState::LowPower));
    }

    #[test]
    fn host_traffic_delays_deep_sleep() {
        let events = EventFlags::new();
        let mut sys = system(&events, NO_INPUT, 0b000);
        // let the rail detection settle first
        run_until(&mut sys, 1_000, 5);
        events.raise(Event::HostCommand);
        let start = sys.now().as_millis();
        let quiet = run_until(&mut sys, start + 1_900, 5);
        assert!(!quiet.contains(&RunState::LowPower));
        let later = run_until(&mut sys, start + 4_000, 5);
        assert!(later.contains(&RunState::LowPower));
    }

    #[test]
    fn charger_interrupt_forces_reread() {
        let events = EventFlags::new();
        let mut sys = system(&events, ADAPTER_ONLY, 0b001);
        block_on(sys.iterate());
        sys.bus_mut().regs[REG_STATUS as usize] = 0b011 << STAT_SHIFT;
        events.raise(Event::ChargerInterrupt);
        assert_eq!(block_on(sys.iterate()), RunState::Normal);
        assert!(sys.charger().status().is_charging());
    }

    #[test]
    fn dead_charger_bus_does_not_keep_loop_awake() {
        let events = EventFlags::new();
        let mut sys = system(&events, ADAPTER_ONLY, 0b001);
        // let the rail detection settle first
        run_until(&mut sys, 1_000, 5);
        let start = sys.now();

        sys.bus_mut().fail = true;
        sys.bus_mut().attempts = 0;
        sys.set_charge_config(0).unwrap();
        let seen: Vec<RunState> = (0..200).map(|_| block_on(sys.iterate())).collect();

        assert!(seen.contains(&RunState::Sleep));
        assert!(sys.now() >= start + Duration::from_millis(1_000));
        // one failed transaction per read period at most
        let elapsed = sys.now().saturating_duration_since(start).as_millis();
        assert!(sys.bus().attempts as u64 <= elapsed / 90 + 1);
    }

    #[test]
    fn forced_power_off_is_reported_until_cleared() {
        let events = EventFlags::new();
        let mut sys = system(&events, NO_INPUT, 0b000);
        run_until(&mut sys, 1_000, 5);
        sys.telemetry().rail_5v.set(4500);
        sys.set_boost_enable(true).unwrap();
        sys.set_aux_switch_limit(Deciamps(5)).unwrap();
        sys.telemetry().battery.set(2400);
        let start = sys.now().as_millis();
        run_until(&mut sys, start + 500, 5);
        assert!(!sys.rails().boost_enabled());
        assert!(sys.forced_power_off());
        assert!(sys.forced_aux_off());

        sys.clear_forced_power_off();
        sys.clear_forced_aux_off();
        assert!(!sys.forced_power_off());
        assert!(!sys.forced_aux_off());
        assert!(!sys.warm_state().forced_power_off);
    }

    #[test]
    fn profile_request_applied_on_next_pass() {
        let events = EventFlags::new();
        let mut sys = system(&events, ADAPTER_ONLY, 0b001);
        block_on(sys.iterate());
        sys.request_profile_change(1).unwrap();
        assert_eq!(sys.profiles().profile_status(), ProfileStatus::WriteBusy);
        block_on(sys.iterate());
        assert_eq!(sys.profiles().profile_status(), ProfileStatus::Preset(1));
        assert_eq!(
            field(sys.bus().regs[REG_BATTERY_VOLTAGE as usize], VBREG_MASK, VBREG_SHIFT),
            PRESETS[1].profile.regulation_voltage.0
        );
    }

    #[test]
    fn watchdog_power_cycles_host() {
        let events = EventFlags::new();
        let mut sys = system(&events, NO_INPUT, 0b000);
        sys.telemetry().rail_5v.set(4500);
        sys.set_boost_enable(true).unwrap();
        sys.configure_watchdog(1).unwrap();
        block_on(sys.iterate());
        assert!(sys.rails().boost_enabled());

        sys.platform_mut().advance(60_000);
        block_on(sys.iterate());
        assert!(!sys.rails().boost_enabled());

        sys.platform_mut().advance(HOST_POWER_CYCLE_OFF_TIME.as_millis());
        block_on(sys.iterate());
        assert!(sys.rails().boost_enabled());
    }

    #[test]
    fn host_traffic_feeds_watchdog() {
        let events = EventFlags::new();
        let mut sys = system(&events, NO_INPUT, 0b000);
        sys.telemetry().rail_5v.set(4500);
        sys.set_boost_enable(true).unwrap();
        sys.configure_watchdog(1).unwrap();
        for _ in 0..4 {
            sys.platform_mut().advance(30_000);
            events.raise(Event::HostCommand);
            block_on(sys.iterate());
            assert!(sys.rails().boost_enabled());
        }
    }

    #[test]
    fn deferred_power_off_and_rtc_wake() {
        let events = EventFlags::new();
        let mut sys = system(&events, NO_INPUT, 0b000);
        sys.telemetry().rail_5v.set(4500);
        sys.set_boost_enable(true).unwrap();
        sys.schedule_power_off(Duration::from_millis(100));
        block_on(sys.iterate());
        assert!(sys.rails().boost_enabled());

        sys.platform_mut().advance(100);
        block_on(sys.iterate());
        assert!(!sys.rails().boost_enabled());

        sys.telemetry().rail_5v.set(0);
        events.raise(Event::RtcAlarm);
        block_on(sys.iterate());
        assert!(sys.rails().boost_enabled());
    }
}
