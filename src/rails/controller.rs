use embassy_time::{Duration, Instant};
use embedded_hal::delay::DelayNs;

use super::driver::RailDriver;
use super::warm::WarmState;
use super::{AuxRegulatorMode, AuxSwitchLimit, HostRailDetect, PowerSourceStatus, RailError, RailStatus};
use crate::charger::ChargerSync;
use crate::config::{
    AUX_REGULATOR_MAX_OUTPUT, AUX_SWITCH_GRACE, BOOST_ENABLE_RETRIES, BOOST_ENABLE_SAMPLE_DELAY_US,
    BOOST_STABILIZE_TIME, DEFAULT_CUTOFF, HOST_RAIL_DEBOUNCE, HOST_SELF_POWERED_THRESHOLD,
    INPUT_LIMIT_STEP_PERIOD, RAIL_3V3_HEALTHY, RAIL_5V_COLLAPSE, UNDERVOLTAGE_WAKE_PERCENT,
};
use crate::profile::BatteryProfile;
use crate::snapshot::Snapshot;
use crate::telemetry::Telemetry;
use crate::units::{Deciamps, Millivolts};

#[derive(Clone, Copy, Debug)]
pub struct RailConfig {
    pub aux_regulator_mode: AuxRegulatorMode,
    pub host_rail_debounce: Duration,
    pub boost_stabilize: Duration,
    pub aux_switch_grace: Duration,
    pub input_limit_step_period: Duration,
}

impl Default for RailConfig {
    fn default() -> Self {
        Self {
            aux_regulator_mode: AuxRegulatorMode::ShadowBoost,
            host_rail_debounce: HOST_RAIL_DEBOUNCE,
            boost_stabilize: BOOST_STABILIZE_TIME,
            aux_switch_grace: AUX_SWITCH_GRACE,
            input_limit_step_period: INPUT_LIMIT_STEP_PERIOD,
        }
    }
}

/// Sequences the rails and watches them.
///
/// Invariants kept by every method:
/// - the auxiliary regulator is only on while boost is on
/// - boost only comes on with the battery above cutoff or another source present
/// - the output switch only comes on under the same condition
pub struct PowerRailController<D, W> {
    driver: D,
    delay: W,
    config: RailConfig,

    boost_enabled: bool,
    boost_since: Option<Instant>,
    aux_regulator_requested: bool,
    aux_regulator_enabled: bool,
    aux_switch: AuxSwitchLimit,

    host_detect: HostRailDetect,
    detect_candidate: Option<(HostRailDetect, Instant)>,
    next_limit_step: Option<Instant>,

    adapter: PowerSourceStatus,
    host_rail: PowerSourceStatus,
    cutoff: Millivolts,

    grace_until: Option<Instant>,
    warm: WarmState,
    status: Snapshot<RailStatus>,
}

impl<D: RailDriver, W: DelayNs> PowerRailController<D, W> {
    /// Takes over the rails with everything off.
    pub fn new(mut driver: D, delay: W, config: RailConfig, warm: WarmState) -> Self {
        driver.set_aux_switch(AuxSwitchLimit::Disabled);
        driver.set_aux_regulator(false);
        driver.set_boost(false);
        if warm.forced_power_off {
            info!("rails: holding off after undervoltage shutdown");
        }
        Self {
            driver,
            delay,
            config,
            boost_enabled: false,
            boost_since: None,
            aux_regulator_requested: false,
            aux_regulator_enabled: false,
            aux_switch: AuxSwitchLimit::Disabled,
            host_detect: HostRailDetect::Unknown,
            detect_candidate: None,
            next_limit_step: None,
            adapter: PowerSourceStatus::NotPresent,
            host_rail: PowerSourceStatus::NotPresent,
            cutoff: DEFAULT_CUTOFF.to_millivolts(),
            grace_until: None,
            warm,
            status: Snapshot::new(RailStatus::new()),
        }
    }

    pub fn notify_profile_changed(&mut self, profile: Option<&BatteryProfile>) {
        self.cutoff = profile.map_or(DEFAULT_CUTOFF.to_millivolts(), BatteryProfile::cutoff);
    }

    fn source_present(&self) -> bool {
        self.adapter.is_usable() || self.host_detect == HostRailDetect::Powered
    }

    /// Switches the boost converter.
    ///
    /// Enabling stops the auxiliary regulator first. With nothing but the
    /// battery to start from, the battery is sampled again after start-up and
    /// boost is rolled back if it sagged to cutoff.
    pub fn set_boost_enable(
        &mut self,
        enable: bool,
        now: Instant,
        telemetry: &impl Telemetry,
    ) -> Result<(), RailError> {
        if enable == self.boost_enabled {
            return Ok(());
        }
        if !enable {
            self.boost_off();
            self.publish();
            return Ok(());
        }

        let source = self.source_present();
        if !source && telemetry.battery_voltage() <= self.cutoff {
            warn!("rails: boost refused, battery at cutoff");
            return Err(RailError::BatteryLow);
        }

        self.set_aux_regulator_output(false);
        self.driver.set_boost(true);

        if !source {
            let mut held = false;
            for _ in 0..=BOOST_ENABLE_RETRIES {
                self.delay.delay_us(BOOST_ENABLE_SAMPLE_DELAY_US);
                if telemetry.battery_voltage() > self.cutoff {
                    held = true;
                    break;
                }
            }
            if !held {
                self.driver.set_boost(false);
                warn!("rails: battery collapsed on boost start");
                return Err(RailError::BatteryCollapsed);
            }
        }

        self.boost_enabled = true;
        self.boost_since = Some(now);
        self.detect_candidate = None;
        self.grace_until = None;
        self.apply_aux_regulator();
        info!("rails: boost on");
        self.publish();
        Ok(())
    }

    fn boost_off(&mut self) {
        self.set_aux_regulator_output(false);
        self.driver.set_boost(false);
        self.boost_enabled = false;
        self.boost_since = None;
        self.detect_candidate = None;
        self.grace_until = None;
        info!("rails: boost off");
    }

    fn set_aux_regulator_output(&mut self, on: bool) {
        if on != self.aux_regulator_enabled {
            self.driver.set_aux_regulator(on);
            self.aux_regulator_enabled = on;
        }
    }

    fn apply_aux_regulator(&mut self) {
        let wanted = match self.config.aux_regulator_mode {
            AuxRegulatorMode::ShadowBoost => true,
            AuxRegulatorMode::Manual => self.aux_regulator_requested,
        };
        self.set_aux_regulator_output(wanted && self.boost_enabled);
    }

    /// Requests the auxiliary regulator. It only runs while boost is on, and
    /// in shadow mode the request is ignored.
    pub fn set_aux_regulator_enable(&mut self, enable: bool) {
        self.aux_regulator_requested = enable;
        self.apply_aux_regulator();
        self.publish();
    }

    /// Sets the output switch limit in tenths of an amp. Only 5 and 21 turn it on.
    pub fn set_aux_switch_limit(&mut self, limit: Deciamps, telemetry: &impl Telemetry) -> Result<(), RailError> {
        let limit = AuxSwitchLimit::from_deciamps(limit);
        if limit != AuxSwitchLimit::Disabled
            && !self.source_present()
            && telemetry.battery_voltage() <= self.cutoff
        {
            return Err(RailError::BatteryLow);
        }
        self.driver.set_aux_switch(limit);
        self.aux_switch = limit;
        self.publish();
        Ok(())
    }

    /// Periodic work. Returns true when the published rail status changed.
    pub fn task(&mut self, now: Instant, telemetry: &impl Telemetry, charger: &mut ChargerSync) -> bool {
        self.adapter = charger.adapter_status();
        self.host_rail = charger.host_rail_status();

        self.update_host_detect(now, telemetry, charger);
        self.step_input_limit(now, charger);
        self.check_wake_on_charge(now, telemetry);
        self.check_power_valid(now, telemetry);

        self.publish()
    }

    fn update_host_detect(&mut self, now: Instant, telemetry: &impl Telemetry, charger: &mut ChargerSync) {
        let rail = telemetry.rail_5v();
        let powered = if self.boost_enabled {
            self.aux_regulator_enabled && rail > AUX_REGULATOR_MAX_OUTPUT
        } else {
            rail > HOST_SELF_POWERED_THRESHOLD
        };
        let observed = if powered { HostRailDetect::Powered } else { HostRailDetect::Unpowered };

        if observed == self.host_detect {
            self.detect_candidate = None;
            return;
        }
        match self.detect_candidate {
            Some((candidate, since)) if candidate == observed => {
                if now.saturating_duration_since(since) >= self.config.host_rail_debounce {
                    self.commit_host_detect(observed, now, telemetry, charger);
                }
            }
            _ => self.detect_candidate = Some((observed, now)),
        }
    }

    fn commit_host_detect(
        &mut self,
        detect: HostRailDetect,
        now: Instant,
        telemetry: &impl Telemetry,
        charger: &mut ChargerSync,
    ) {
        info!("rails: host rail {}", detect);
        self.host_detect = detect;
        self.detect_candidate = None;
        match detect {
            HostRailDetect::Powered => {
                charger.step_input_limit_down();
                self.next_limit_step = Some(now + self.config.input_limit_step_period);
                if !self.boost_enabled {
                    // host runs from its own supply: stand by to take over
                    if let Err(e) = self.set_boost_enable(true, now, telemetry) {
                        warn!("rails: takeover failed: {}", e);
                    }
                }
            }
            HostRailDetect::Unpowered => {
                charger.set_input_limit_min();
                self.next_limit_step = None;
            }
            HostRailDetect::Unknown => {}
        }
    }

    /// Raises the host-rail input limit in steps while the charger's input
    /// voltage holds; backs off one step and stops once it sags.
    fn step_input_limit(&mut self, now: Instant, charger: &mut ChargerSync) {
        let Some(due) = self.next_limit_step else {
            return;
        };
        if self.host_detect != HostRailDetect::Powered || now < due {
            return;
        }
        if charger.input_dpm_active() {
            charger.step_input_limit_down();
            self.next_limit_step = None;
        } else {
            charger.step_input_limit_up();
            self.next_limit_step = Some(now + self.config.input_limit_step_period);
        }
    }

    fn check_wake_on_charge(&mut self, now: Instant, telemetry: &impl Telemetry) {
        let Some(threshold) = self.warm.wake_on_charge else {
            return;
        };
        if self.boost_enabled || !(self.adapter.is_usable() || self.host_rail.is_usable()) {
            return;
        }
        if telemetry.state_of_charge().percent() >= threshold
            && self.set_boost_enable(true, now, telemetry).is_ok()
        {
            info!("rails: wake on charge at {}%", threshold);
            self.warm.wake_on_charge = None;
        }
    }

    fn check_power_valid(&mut self, now: Instant, telemetry: &impl Telemetry) {
        if !self.boost_enabled {
            return;
        }
        if self
            .boost_since
            .is_some_and(|t| now.saturating_duration_since(t) < self.config.boost_stabilize)
        {
            return;
        }

        if telemetry.rail_5v() < RAIL_5V_COLLAPSE && telemetry.rail_3v3() > RAIL_3V3_HEALTHY {
            error!("rails: 5V rail collapsed");
            self.boost_off();
            return;
        }

        let on_battery_low = !self.source_present() && telemetry.battery_voltage() < self.cutoff;
        if !on_battery_low {
            self.grace_until = None;
            return;
        }
        match self.grace_until {
            None => {
                if self.aux_switch != AuxSwitchLimit::Disabled {
                    warn!("rails: battery low, shedding output switch");
                    self.driver.set_aux_switch(AuxSwitchLimit::Disabled);
                    self.aux_switch = AuxSwitchLimit::Disabled;
                    self.warm.forced_aux_off = true;
                }
                self.grace_until = Some(now + self.config.aux_switch_grace);
            }
            Some(deadline) if now >= deadline => {
                warn!("rails: battery below cutoff, powering off");
                self.boost_off();
                self.warm.forced_power_off = true;
                self.warm.wake_on_charge = Some(UNDERVOLTAGE_WAKE_PERCENT);
            }
            Some(_) => {}
        }
    }

    /// A deadline is running that the scheduler should not sleep through.
    pub fn needs_poll(&self, now: Instant) -> bool {
        let stabilizing = self
            .boost_since
            .is_some_and(|t| now.saturating_duration_since(t) < self.config.boost_stabilize);
        stabilizing || self.detect_candidate.is_some() || self.grace_until.is_some()
    }

    fn publish(&self) -> bool {
        self.status.publish(self.snapshot())
    }

    fn snapshot(&self) -> RailStatus {
        RailStatus {
            boost_enabled: self.boost_enabled,
            aux_regulator_enabled: self.aux_regulator_enabled,
            aux_switch: self.aux_switch,
            host_detect: self.host_detect,
            adapter: self.adapter,
            host_rail: self.host_rail,
        }
    }

    /// Last published rail status.
    pub fn status(&self) -> RailStatus {
        self.status.get()
    }

    /// The published status cell, for readers outside the main loop.
    pub fn status_snapshot(&self) -> &Snapshot<RailStatus> {
        &self.status
    }

    /// Adapter input supply status as of the last [`task`](Self::task).
    pub fn vin_status(&self) -> PowerSourceStatus {
        self.adapter
    }

    /// Host rail supply status as reported by the charger.
    pub fn host_rail_status(&self) -> PowerSourceStatus {
        self.host_rail
    }

    /// Debounced host rail detection.
    pub fn host_detect(&self) -> HostRailDetect {
        self.host_detect
    }

    pub fn boost_enabled(&self) -> bool {
        self.boost_enabled
    }

    /// Effective regulator state, which may differ from the last request.
    pub fn aux_regulator_enabled(&self) -> bool {
        self.aux_regulator_enabled
    }

    /// Output switch limit in tenths of an amp, zero when disabled.
    pub fn aux_switch_limit(&self) -> Deciamps {
        self.aux_switch.deciamps()
    }

    /// Boost was cut for undervoltage. Stays set until the host clears it,
    /// even if wake-on-charge has since brought the rail back.
    pub fn forced_power_off(&self) -> bool {
        self.warm.forced_power_off
    }

    pub fn clear_forced_power_off(&mut self) {
        self.warm.forced_power_off = false;
    }

    /// The output switch was shed for undervoltage. Stays set until cleared.
    pub fn forced_aux_off(&self) -> bool {
        self.warm.forced_aux_off
    }

    pub fn clear_forced_aux_off(&mut self) {
        self.warm.forced_aux_off = false;
    }

    /// Armed wake-on-charge level in percent.
    pub fn wake_on_charge(&self) -> Option<u8> {
        self.warm.wake_on_charge
    }

    /// Arms (or with `None` disarms) power-up at a state of charge, in percent.
    pub fn set_wake_on_charge(&mut self, percent: Option<u8>) {
        self.warm.wake_on_charge = percent.map(|p| p.min(100));
    }

    /// Flags to carry over a warm reset.
    pub fn warm_state(&self) -> WarmState {
        self.warm
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }
}
