use embassy_time::Instant;
use heapless::Vec;

use super::ChargerStatus;
use super::bus::{ChargerBus, ChargerError};
use super::regs::*;
use crate::config::{
    CHARGER_KEEPALIVE_PERIOD, CHARGER_READ_PERIOD, ChargeConfig, DEFAULT_INPUT_LIMIT_INDEX,
    InputsConfig, WARM_REGULATION_DERATE,
};
use crate::profile::BatteryProfile;
use crate::rails::{HostRailDetect, PowerSourceStatus, RailStatus};
use crate::snapshot::Snapshot;
use crate::storage::{Key, NonVolatileStore, StoreError};
use crate::units::{Milliamps, Millivolts, RegulationCode};

/// Everything outside the charger that the charge policy depends on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChargerInputs {
    pub profile: Option<BatteryProfile>,
    pub rails: RailStatus,
    pub battery_voltage: Millivolts,
    pub battery_temperature: Option<i8>,
}

/// Inputs whose change forces a policy pass. Battery voltage is left out
/// since it only matters while the regulation voltage is being updated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct PolicyInputs {
    profile: Option<BatteryProfile>,
    rails: RailStatus,
    temperature: Option<i8>,
    charge: ChargeConfig,
    inputs: InputsConfig,
    input_limit: usize,
}

/// Regulation voltage for `profile` at the given battery conditions.
///
/// Derated above the warm threshold, never below the present battery
/// voltage, never above the charger maximum.
pub fn regulation_code(
    profile: &BatteryProfile,
    battery: Millivolts,
    temperature: Option<i8>,
) -> RegulationCode {
    let mut code = profile.regulation_voltage.0.min(RegulationCode::MAX.0);
    if temperature.is_some_and(|t| t > profile.temp_warm) {
        code = code.saturating_sub(WARM_REGULATION_DERATE);
    }
    let floor = RegulationCode::floor_of(battery).0.saturating_add(1);
    RegulationCode(code.max(floor).min(RegulationCode::MAX.0))
}

/// Cached register image of the charge controller plus the policy that
/// drives it.
///
/// [`task`](Self::task) performs, in order: the watchdog keep-alive, a
/// regulation voltage update in high-impedance mode when the battery is over
/// voltage or the profile changed, a policy pass when anything it depends on
/// changed, and the periodic full re-read. A failed transaction ends the call
/// and leaves the pending work flagged; the bus is left alone until the next
/// read period so a dead device does not keep the loop awake.
pub struct ChargerSync {
    last_read: [u8; REGISTER_COUNT],
    desired: [u8; REGISTER_COUNT],
    synced: bool,
    status: Snapshot<ChargerStatus>,

    charge_config: ChargeConfig,
    inputs_config: InputsConfig,
    input_limit: usize,

    policy_dirty: bool,
    profile_changed: bool,
    regulation_pending: bool,
    interrupt_pending: bool,
    last_policy: Option<PolicyInputs>,

    next_keepalive: Option<Instant>,
    next_read: Option<Instant>,
    retry_at: Option<Instant>,
}

impl ChargerSync {
    pub const fn new() -> Self {
        Self {
            last_read: [0; REGISTER_COUNT],
            desired: [0; REGISTER_COUNT],
            synced: false,
            status: Snapshot::new(ChargerStatus::NoSource),
            charge_config: ChargeConfig(ChargeConfig::ENABLE),
            inputs_config: InputsConfig(InputsConfig::HOST_RAIL_CHARGING),
            input_limit: DEFAULT_INPUT_LIMIT_INDEX,
            policy_dirty: true,
            profile_changed: false,
            regulation_pending: false,
            interrupt_pending: false,
            last_policy: None,
            next_keepalive: None,
            next_read: None,
            retry_at: None,
        }
    }

    /// Loads the persisted option bytes, falling back to defaults.
    pub fn init(&mut self, store: &mut impl NonVolatileStore) {
        self.charge_config = store
            .read_byte(Key::ChargeConfig)
            .map(ChargeConfig)
            .unwrap_or_default();
        self.inputs_config = store
            .read_byte(Key::InputsConfig)
            .map(InputsConfig)
            .unwrap_or_default();
        self.policy_dirty = true;
        info!(
            "charger: charge config {=u8:#x}, inputs config {=u8:#x}",
            self.charge_config.0,
            self.inputs_config.0
        );
    }

    /// Periodic entry point. Errors are logged and retried after
    /// [`CHARGER_READ_PERIOD`], never within the same call.
    pub async fn task<B: ChargerBus>(&mut self, now: Instant, bus: &mut B, inputs: &ChargerInputs) {
        if self.backing_off(now) {
            return;
        }
        match self.sync(now, bus, inputs).await {
            Ok(()) => self.retry_at = None,
            Err(e) => {
                warn!("charger: {}, retrying next cycle", e.describe());
                self.retry_at = Some(now + CHARGER_READ_PERIOD);
            }
        }
    }

    fn backing_off(&self, now: Instant) -> bool {
        self.retry_at.is_some_and(|t| now < t)
    }

    async fn sync<B: ChargerBus>(
        &mut self,
        now: Instant,
        bus: &mut B,
        inputs: &ChargerInputs,
    ) -> Result<(), ChargerError<B::Error>> {
        if !self.synced {
            self.read_all(bus).await?;
            self.next_read = Some(now + CHARGER_READ_PERIOD);
        }

        if self.next_keepalive.is_none_or(|t| now >= t) {
            bus.write_register(REG_STATUS, self.last_read[REG_STATUS as usize] | TMR_RST)
                .await?;
            self.next_keepalive = Some(now + CHARGER_KEEPALIVE_PERIOD);
        }

        if self.battery_overvoltage() || self.profile_changed {
            self.regulation_pending = true;
        }
        if self.regulation_pending {
            self.update_regulation(bus, inputs).await?;
        }

        let policy = self.policy_inputs(inputs);
        if self.last_policy != Some(policy) {
            self.policy_dirty = true;
        }
        if self.policy_dirty {
            self.apply_policy(bus, inputs).await?;
            self.policy_dirty = false;
            self.last_policy = Some(policy);
        }

        if self.interrupt_pending || self.next_read.is_none_or(|t| now >= t) {
            self.read_all(bus).await?;
            self.interrupt_pending = false;
            self.next_read = Some(now + CHARGER_READ_PERIOD);
        }
        Ok(())
    }

    async fn read_stable<B: ChargerBus>(&self, bus: &mut B, reg: u8) -> Result<u8, ChargerError<B::Error>> {
        let first = bus.read_register(reg).await?;
        let second = bus.read_register(reg).await?;
        if first == second {
            Ok(first)
        } else {
            Err(ChargerError::Unstable(reg))
        }
    }

    /// Re-reads every register. The image is only replaced once all reads succeeded.
    async fn read_all<B: ChargerBus>(&mut self, bus: &mut B) -> Result<(), ChargerError<B::Error>> {
        let mut fresh = [0u8; REGISTER_COUNT];
        for (reg, value) in fresh.iter_mut().enumerate() {
            *value = self.read_stable(bus, reg as u8).await?;
        }

        let status = ChargerStatus::from_stat(field(fresh[REG_STATUS as usize], STAT_MASK, STAT_SHIFT));
        let status_changed = self.status.publish(status);
        let supply_changed = fresh[REG_SUPPLY as usize] != self.last_read[REG_SUPPLY as usize];
        let drifted = fresh
            .iter()
            .zip(self.desired.iter())
            .zip(WRITE_MASKS.iter())
            .any(|((f, d), m)| f & m != d & m);

        if status_changed {
            debug!("charger: status {}", status);
        }
        if !self.synced || status_changed || supply_changed || drifted {
            self.policy_dirty = true;
        }
        self.last_read = fresh;
        self.synced = true;
        Ok(())
    }

    /// Puts the charger in high-impedance mode, writes the regulation voltage
    /// and confirms it. Charging resumes in the following policy pass.
    async fn update_regulation<B: ChargerBus>(
        &mut self,
        bus: &mut B,
        inputs: &ChargerInputs,
    ) -> Result<(), ChargerError<B::Error>> {
        let control = REG_CONTROL as usize;
        if self.last_read[control] & HZ_MODE == 0 {
            bus.write_register(REG_CONTROL, self.last_read[control] | HZ_MODE).await?;
            self.last_read[control] = self.read_stable(bus, REG_CONTROL).await?;
            if self.last_read[control] & HZ_MODE == 0 {
                return Ok(());
            }
        }

        let Some(code) = self.desired_regulation(inputs) else {
            self.finish_regulation();
            return Ok(());
        };

        let vreg = REG_BATTERY_VOLTAGE as usize;
        let target = with_field(self.last_read[vreg], VBREG_MASK, VBREG_SHIFT, code.0);
        if self.needs_write(REG_BATTERY_VOLTAGE, target) {
            bus.write_register(REG_BATTERY_VOLTAGE, self.merged(REG_BATTERY_VOLTAGE, target))
                .await?;
        }
        self.last_read[vreg] = self.read_stable(bus, REG_BATTERY_VOLTAGE).await?;
        if field(self.last_read[vreg], VBREG_MASK, VBREG_SHIFT) == code.0 {
            info!("charger: regulation voltage {} mV", code.to_millivolts().0);
            // the cached over-voltage bit would restart the update next pass
            let supply = REG_SUPPLY as usize;
            self.last_read[supply] = self.read_stable(bus, REG_SUPPLY).await?;
            self.finish_regulation();
        }
        Ok(())
    }

    fn finish_regulation(&mut self) {
        self.regulation_pending = false;
        self.profile_changed = false;
        self.policy_dirty = true;
    }

    async fn apply_policy<B: ChargerBus>(
        &mut self,
        bus: &mut B,
        inputs: &ChargerInputs,
    ) -> Result<(), ChargerError<B::Error>> {
        self.desired = self.compute_desired(inputs);
        for (reg, value) in self.write_plan() {
            bus.write_register(reg, value).await?;
            trace!("charger: reg {=u8:#x} <- {=u8:#x}", reg, value);
            self.last_read[reg as usize] = value;
        }
        Ok(())
    }

    /// Registers whose writable bits differ from the desired image, with the
    /// value to write, in device write order.
    fn write_plan(&self) -> Vec<(u8, u8), { WRITE_ORDER.len() }> {
        let mut plan = Vec::new();
        for reg in WRITE_ORDER {
            let desired = self.desired[reg as usize];
            if self.needs_write(reg, desired) {
                // capacity matches WRITE_ORDER, so this never fails
                let _ = plan.push((reg, self.merged(reg, desired)));
            }
        }
        plan
    }

    fn needs_write(&self, reg: u8, desired: u8) -> bool {
        let mask = WRITE_MASKS[reg as usize];
        self.last_read[reg as usize] & mask != desired & mask
    }

    fn merged(&self, reg: u8, desired: u8) -> u8 {
        let mask = WRITE_MASKS[reg as usize];
        (self.last_read[reg as usize] & !mask) | (desired & mask)
    }

    /// The regulation code to program, or `None` to leave it alone: it is
    /// only touched with a profile active and the charger in high impedance.
    fn desired_regulation(&self, inputs: &ChargerInputs) -> Option<RegulationCode> {
        let profile = inputs.profile.as_ref()?;
        if self.last_read[REG_CONTROL as usize] & HZ_MODE == 0 {
            return None;
        }
        Some(regulation_code(
            profile,
            inputs.battery_voltage,
            inputs.battery_temperature,
        ))
    }

    fn compute_desired(&self, inputs: &ChargerInputs) -> [u8; REGISTER_COUNT] {
        let mut d = self.last_read;
        let qualifying = self.qualifying_input(&inputs.rails);
        let charge = self.charge_allowed(inputs, qualifying);

        let status = REG_STATUS as usize;
        d[status] = with_flag(d[status], SUPPLY_SEL, self.inputs_config.host_rail_preferred());

        let supply = REG_SUPPLY as usize;
        d[supply] = with_flag(d[supply], EN_NOBATOP, self.inputs_config.no_battery_operation());

        let control = REG_CONTROL as usize;
        let mut c = with_field(d[control], IUSB_LIMIT_MASK, IUSB_LIMIT_SHIFT, self.input_limit as u8);
        c |= EN_STAT | TE;
        c = with_flag(c, CE, !charge);
        c = with_flag(c, HZ_MODE, self.regulation_pending || !qualifying);
        d[control] = c;

        let vreg = REG_BATTERY_VOLTAGE as usize;
        let mut v = with_flag(d[vreg], IN_LIMIT, self.inputs_config.adapter_high_limit());
        if let Some(code) = self.desired_regulation(inputs) {
            v = with_field(v, VBREG_MASK, VBREG_SHIFT, code.0);
        }
        d[vreg] = v;

        if let Some(p) = inputs.profile.as_ref() {
            let current = REG_CURRENT as usize;
            d[current] = with_field(d[current], ICHRG_MASK, ICHRG_SHIFT, p.charge_current.0);
            d[current] = with_field(d[current], ITERM_MASK, 0, p.termination_current.0);
        }

        let dpm = REG_DPM as usize;
        d[dpm] = with_field(d[dpm], VINDPM_USB_MASK, VINDPM_USB_SHIFT, VINDPM_USB_DEFAULT);
        d[dpm] = with_field(d[dpm], VINDPM_IN_MASK, 0, VINDPM_IN_DEFAULT);

        // the charger's own thermistor loop guards the cell whenever there is
        // no temperature reading to apply the profile limits to
        let timer = REG_TIMER as usize;
        let tmr = with_field(d[timer], TMR_MASK, TMR_SHIFT, TMR_DEFAULT) & !(TMR2X_EN | LOW_CHG);
        d[timer] = with_flag(tmr, TS_EN, inputs.battery_temperature.is_none());

        d
    }

    fn qualifying_input(&self, rails: &RailStatus) -> bool {
        let adapter = self.adapter_status().is_usable();
        let host_rail = self.inputs_config.host_rail_charging()
            && self.host_rail_status().is_usable()
            && (rails.host_detect == HostRailDetect::Powered || !rails.boost_enabled);
        adapter || host_rail
    }

    fn charge_allowed(&self, inputs: &ChargerInputs, qualifying: bool) -> bool {
        let Some(profile) = inputs.profile.as_ref() else {
            return false;
        };
        let temperature_ok = inputs
            .battery_temperature
            .is_none_or(|t| t > profile.temp_cold && t < profile.temp_hot);
        self.charge_config.charging_enabled() && qualifying && temperature_ok
    }

    fn policy_inputs(&self, inputs: &ChargerInputs) -> PolicyInputs {
        PolicyInputs {
            profile: inputs.profile,
            rails: inputs.rails,
            temperature: inputs.battery_temperature,
            charge: self.charge_config,
            inputs: self.inputs_config,
            input_limit: self.input_limit,
        }
    }

    // ---- notifications ----

    /// The charger pulsed its interrupt line; registers are re-read next pass.
    pub fn notify_interrupt(&mut self) {
        self.interrupt_pending = true;
    }

    /// The active profile changed: the regulation voltage is rewritten in
    /// high-impedance mode, then the full policy.
    pub fn notify_profile_changed(&mut self) {
        self.profile_changed = true;
        self.policy_dirty = true;
    }

    pub fn notify_rail_status_changed(&mut self) {
        self.policy_dirty = true;
    }

    /// Work is pending that should not wait for the next periodic pass.
    /// Always false while backing off after a failed transaction.
    pub fn needs_poll(&self, now: Instant) -> bool {
        self.synced
            && !self.backing_off(now)
            && (self.interrupt_pending
                || self.policy_dirty
                || self.profile_changed
                || self.regulation_pending)
    }

    // ---- host-rail input current limit ----

    /// Raises the host-rail input limit one step. Returns false at the top.
    pub fn step_input_limit_up(&mut self) -> bool {
        self.set_input_limit_index((self.input_limit + 1).min(HOST_RAIL_LIMITS.len() - 1))
    }

    pub fn step_input_limit_down(&mut self) -> bool {
        self.set_input_limit_index(self.input_limit.saturating_sub(1))
    }

    pub fn set_input_limit_min(&mut self) -> bool {
        self.set_input_limit_index(0)
    }

    fn set_input_limit_index(&mut self, index: usize) -> bool {
        if index == self.input_limit {
            return false;
        }
        self.input_limit = index;
        self.policy_dirty = true;
        debug!("charger: host rail limit {} mA", HOST_RAIL_LIMITS[index].0);
        true
    }

    /// Host-rail input current limit the next policy pass programs.
    pub fn input_limit(&self) -> Milliamps {
        HOST_RAIL_LIMITS[self.input_limit]
    }

    // ---- persisted options ----

    pub fn charge_config(&self) -> ChargeConfig {
        self.charge_config
    }

    /// Sets and persists the charge-enable byte. The charger is updated on
    /// the next pass even if the store write fails.
    pub fn set_charge_config(
        &mut self,
        store: &mut impl NonVolatileStore,
        config: ChargeConfig,
    ) -> Result<(), StoreError> {
        self.charge_config = config;
        self.policy_dirty = true;
        store.write_byte(Key::ChargeConfig, config.0)
    }

    pub fn inputs_config(&self) -> InputsConfig {
        self.inputs_config
    }

    /// Sets and persists the input selection byte.
    pub fn set_inputs_config(
        &mut self,
        store: &mut impl NonVolatileStore,
        config: InputsConfig,
    ) -> Result<(), StoreError> {
        self.inputs_config = config;
        self.policy_dirty = true;
        store.write_byte(Key::InputsConfig, config.0)
    }

    // ---- decoded state ----

    /// Status decoded from the last full register read.
    pub fn status(&self) -> ChargerStatus {
        self.status.get()
    }

    pub fn status_snapshot(&self) -> &Snapshot<ChargerStatus> {
        &self.status
    }

    /// At least one full register read has succeeded.
    pub fn is_synced(&self) -> bool {
        self.synced
    }

    /// Adapter input status; not present until the first read.
    pub fn adapter_status(&self) -> PowerSourceStatus {
        if !self.synced {
            return PowerSourceStatus::NotPresent;
        }
        PowerSourceStatus::from_code(field(self.last_read[REG_SUPPLY as usize], INSTAT_MASK, INSTAT_SHIFT))
    }

    pub fn host_rail_status(&self) -> PowerSourceStatus {
        if !self.synced {
            return PowerSourceStatus::NotPresent;
        }
        PowerSourceStatus::from_code(field(self.last_read[REG_SUPPLY as usize], USBSTAT_MASK, USBSTAT_SHIFT))
    }

    /// Battery terminal over-voltage as last read.
    pub fn battery_overvoltage(&self) -> bool {
        self.synced
            && field(self.last_read[REG_SUPPLY as usize], BATSTAT_MASK, BATSTAT_SHIFT) == BATSTAT_OVP
    }

    /// The charger is reducing its input current to hold the input voltage up.
    pub fn input_dpm_active(&self) -> bool {
        self.last_read[REG_DPM as usize] & DPM_STATUS != 0
    }

    /// Raw FAULT field of the status register, zero for no fault.
    pub fn fault_code(&self) -> u8 {
        field(self.last_read[REG_STATUS as usize], FAULT_MASK, 0)
    }

    /// Last value read from (or written to) `reg`.
    pub fn register(&self, reg: u8) -> Option<u8> {
        self.last_read.get(reg as usize).copied()
    }
}

impl Default for ChargerSync {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::PRESETS;
    use crate::testing::{FakeCharger, mem_store};
    use embassy_futures::block_on;
    use embassy_time::Duration;

    const ADAPTER_ONLY: u8 = 0b0011_0000;
    const HOST_RAIL_ONLY: u8 = 0b1100_0000;
    const NO_INPUT: u8 = 0b1111_0000;

    fn inputs() -> ChargerInputs {
        ChargerInputs {
            profile: Some(PRESETS[0].profile),
            rails: RailStatus::new(),
            battery_voltage: Millivolts(3700),
            battery_temperature: Some(25),
        }
    }

    fn device(supply: u8) -> FakeCharger {
        let mut fake = FakeCharger::new();
        fake.regs[REG_STATUS as usize] = 0b001 << STAT_SHIFT;
        fake.regs[REG_SUPPLY as usize] = supply;
        fake
    }

    fn t(ms: u64) -> Instant {
        Instant::from_millis(ms)
    }

    #[test]
    fn first_pass_programs_profile() {
        let mut fake = device(ADAPTER_ONLY);
        let mut charger = ChargerSync::new();
        block_on(charger.task(t(0), &mut fake, &inputs()));

        assert!(charger.is_synced());
        assert_eq!(charger.status(), ChargerStatus::AdapterReady);
        assert_eq!(charger.adapter_status(), PowerSourceStatus::Normal);
        let control = fake.regs[REG_CONTROL as usize];
        assert_eq!(control & (CE | HZ_MODE), 0);
        assert_eq!(field(control, IUSB_LIMIT_MASK, IUSB_LIMIT_SHIFT), DEFAULT_INPUT_LIMIT_INDEX as u8);
        assert_eq!(fake.regs[REG_CURRENT as usize], (5 << ICHRG_SHIFT) | 1);
        assert_eq!(fake.regs[REG_TIMER as usize] & TS_EN, 0);
    }

    #[test]
    fn steady_state_issues_no_writes() {
        let mut fake = device(ADAPTER_ONLY);
        let mut charger = ChargerSync::new();
        let inputs = inputs();
        block_on(charger.task(t(0), &mut fake, &inputs));
        let settled = fake.policy_writes().len();

        for step in 1..200 {
            block_on(charger.task(t(step * 20), &mut fake, &inputs));
        }
        assert_eq!(fake.policy_writes().len(), settled);
        assert!(!charger.needs_poll(t(4000)));
    }

    #[test]
    fn keepalive_runs_every_second() {
        let mut fake = device(ADAPTER_ONLY);
        let mut charger = ChargerSync::new();
        let inputs = inputs();
        for step in 0..=150 {
            block_on(charger.task(t(step * 20), &mut fake, &inputs));
        }
        // 0 s, 1 s, 2 s, 3 s
        assert_eq!(fake.keepalive_count(), 4);
    }

    #[test]
    fn hot_battery_disables_charging() {
        let mut fake = device(ADAPTER_ONLY);
        let mut charger = ChargerSync::new();
        let mut inputs = inputs();
        block_on(charger.task(t(0), &mut fake, &inputs));

        inputs.battery_temperature = Some(PRESETS[0].profile.temp_hot);
        block_on(charger.task(t(20), &mut fake, &inputs));
        assert_ne!(fake.regs[REG_CONTROL as usize] & CE, 0);

        inputs.battery_temperature = Some(20);
        block_on(charger.task(t(40), &mut fake, &inputs));
        assert_eq!(fake.regs[REG_CONTROL as usize] & CE, 0);
    }

    #[test]
    fn missing_profile_disables_charging() {
        let mut fake = device(ADAPTER_ONLY);
        let mut charger = ChargerSync::new();
        let mut inputs = inputs();
        inputs.profile = None;
        block_on(charger.task(t(0), &mut fake, &inputs));
        assert_ne!(fake.regs[REG_CONTROL as usize] & CE, 0);
    }

    #[test]
    fn administrative_disable_is_persisted() {
        let mut fake = device(ADAPTER_ONLY);
        let mut store = mem_store();
        let mut charger = ChargerSync::new();
        charger.init(&mut store);
        charger.set_charge_config(&mut store, ChargeConfig(0)).unwrap();
        block_on(charger.task(t(0), &mut fake, &inputs()));
        assert_ne!(fake.regs[REG_CONTROL as usize] & CE, 0);

        let mut rebooted = ChargerSync::new();
        rebooted.init(&mut store);
        assert!(!rebooted.charge_config().charging_enabled());
    }

    #[test]
    fn no_input_forces_high_impedance() {
        let mut fake = device(NO_INPUT);
        let mut charger = ChargerSync::new();
        block_on(charger.task(t(0), &mut fake, &inputs()));
        assert_eq!(fake.regs[REG_CONTROL as usize] & (CE | HZ_MODE), CE | HZ_MODE);
    }

    #[test]
    fn host_rail_needs_power_or_boost_off() {
        let mut fake = device(HOST_RAIL_ONLY);
        let mut charger = ChargerSync::new();
        let mut inputs = inputs();

        // boost feeding the host rail itself: not a charging source
        inputs.rails.boost_enabled = true;
        inputs.rails.host_detect = HostRailDetect::Unpowered;
        block_on(charger.task(t(0), &mut fake, &inputs));
        assert_ne!(fake.regs[REG_CONTROL as usize] & HZ_MODE, 0);

        inputs.rails.host_detect = HostRailDetect::Powered;
        block_on(charger.task(t(20), &mut fake, &inputs));
        assert_eq!(fake.regs[REG_CONTROL as usize] & (HZ_MODE | CE), 0);
    }

    #[test]
    fn host_rail_charging_can_be_disabled() {
        let mut fake = device(HOST_RAIL_ONLY);
        let mut store = mem_store();
        let mut charger = ChargerSync::new();
        charger.set_inputs_config(&mut store, InputsConfig(0)).unwrap();
        block_on(charger.task(t(0), &mut fake, &inputs()));
        assert_ne!(fake.regs[REG_CONTROL as usize] & HZ_MODE, 0);
    }

    #[test]
    fn profile_change_writes_regulation_in_high_impedance() {
        let mut fake = device(ADAPTER_ONLY);
        let mut charger = ChargerSync::new();
        charger.notify_profile_changed();
        block_on(charger.task(t(0), &mut fake, &inputs()));

        let writes = fake.policy_writes();
        let enter_hz = writes
            .iter()
            .position(|&(r, v)| r == REG_CONTROL && v & HZ_MODE != 0)
            .unwrap();
        let vreg = writes.iter().position(|&(r, _)| r == REG_BATTERY_VOLTAGE).unwrap();
        let leave_hz = writes
            .iter()
            .rposition(|&(r, v)| r == REG_CONTROL && v & HZ_MODE == 0)
            .unwrap();
        assert!(enter_hz < vreg && vreg < leave_hz);
        assert_eq!(
            field(fake.regs[REG_BATTERY_VOLTAGE as usize], VBREG_MASK, VBREG_SHIFT),
            PRESETS[0].profile.regulation_voltage.0
        );
        assert!(!charger.needs_poll(t(0)));
    }

    #[test]
    fn overvoltage_raises_regulation_above_battery() {
        let mut fake = device(ADAPTER_ONLY | (BATSTAT_OVP << BATSTAT_SHIFT));
        let mut charger = ChargerSync::new();
        let mut inputs = inputs();
        inputs.battery_voltage = Millivolts(4300);
        block_on(charger.task(t(0), &mut fake, &inputs));
        assert_eq!(
            field(fake.regs[REG_BATTERY_VOLTAGE as usize], VBREG_MASK, VBREG_SHIFT),
            41
        );
        assert_eq!(fake.regs[REG_CONTROL as usize] & HZ_MODE, 0);
    }

    #[test]
    fn regulation_without_profile_is_left_alone() {
        let mut fake = device(ADAPTER_ONLY);
        fake.regs[REG_BATTERY_VOLTAGE as usize] = 30 << VBREG_SHIFT;
        let mut charger = ChargerSync::new();
        let mut inputs = inputs();
        inputs.profile = None;
        charger.notify_profile_changed();
        block_on(charger.task(t(0), &mut fake, &inputs));
        assert_eq!(
            field(fake.regs[REG_BATTERY_VOLTAGE as usize], VBREG_MASK, VBREG_SHIFT),
            30
        );
    }

    #[test]
    fn regulation_code_limits() {
        let p = PRESETS[0].profile;
        assert_eq!(regulation_code(&p, Millivolts(3700), Some(25)), p.regulation_voltage);
        assert_eq!(
            regulation_code(&p, Millivolts(3700), Some(p.temp_warm + 1)).0,
            p.regulation_voltage.0 - WARM_REGULATION_DERATE
        );
        // no derate without a thermistor reading
        assert_eq!(regulation_code(&p, Millivolts(3700), None), p.regulation_voltage);
        assert_eq!(regulation_code(&p, Millivolts(4300), Some(25)), RegulationCode(41));
        assert_eq!(regulation_code(&p, Millivolts(4500), Some(25)), RegulationCode::MAX);
    }

    #[test]
    fn interrupt_triggers_reread() {
        let mut fake = device(ADAPTER_ONLY);
        let mut charger = ChargerSync::new();
        let inputs = inputs();
        block_on(charger.task(t(0), &mut fake, &inputs));

        fake.regs[REG_STATUS as usize] = 0b011 << STAT_SHIFT;
        block_on(charger.task(t(20), &mut fake, &inputs));
        assert_eq!(charger.status(), ChargerStatus::AdapterReady);

        charger.notify_interrupt();
        assert!(charger.needs_poll(t(40)));
        block_on(charger.task(t(40), &mut fake, &inputs));
        assert_eq!(charger.status(), ChargerStatus::ChargingFromAdapter);
    }

    #[test]
    fn device_reset_is_rewritten() {
        let mut fake = device(ADAPTER_ONLY);
        let mut charger = ChargerSync::new();
        let inputs = inputs();
        block_on(charger.task(t(0), &mut fake, &inputs));
        let programmed = fake.regs;

        fake.regs[REG_CURRENT as usize] = 0;
        fake.regs[REG_CONTROL as usize] = 0;
        block_on(charger.task(t(100), &mut fake, &inputs));
        block_on(charger.task(t(120), &mut fake, &inputs));
        assert_eq!(fake.regs[REG_CURRENT as usize], programmed[REG_CURRENT as usize]);
        assert_eq!(fake.regs[REG_CONTROL as usize], programmed[REG_CONTROL as usize]);
    }

    #[test]
    fn bus_failure_keeps_work_pending() {
        let mut fake = device(ADAPTER_ONLY);
        let mut charger = ChargerSync::new();
        let mut inputs = inputs();
        block_on(charger.task(t(0), &mut fake, &inputs));
        let before = fake.policy_writes().len();

        inputs.battery_temperature = Some(70);
        fake.fail = true;
        fake.attempts = 0;
        block_on(charger.task(t(20), &mut fake, &inputs));
        assert_eq!(fake.policy_writes().len(), before);
        assert_eq!(fake.attempts, 1);

        // no retry until the next read period
        assert!(!charger.needs_poll(t(40)));
        fake.fail = false;
        block_on(charger.task(t(40), &mut fake, &inputs));
        assert_eq!(fake.regs[REG_CONTROL as usize] & CE, 0);

        let retry = t(20) + CHARGER_READ_PERIOD;
        assert!(charger.needs_poll(retry));
        block_on(charger.task(retry, &mut fake, &inputs));
        assert_ne!(fake.regs[REG_CONTROL as usize] & CE, 0);
    }

    #[test]
    fn cleared_overvoltage_is_not_revisited() {
        let mut fake = device(ADAPTER_ONLY | (BATSTAT_OVP << BATSTAT_SHIFT));
        fake.ovp_clears_on_regulation = true;
        let mut charger = ChargerSync::new();
        let mut inputs = inputs();
        inputs.battery_voltage = Millivolts(4300);

        for step in 0..5 {
            block_on(charger.task(t(step * 20), &mut fake, &inputs));
        }
        let hz_entries = fake
            .policy_writes()
            .iter()
            .filter(|&&(r, v)| r == REG_CONTROL && v & HZ_MODE != 0)
            .count();
        assert_eq!(hz_entries, 1);
        assert!(!charger.battery_overvoltage());
        assert_eq!(fake.regs[REG_CONTROL as usize] & HZ_MODE, 0);
    }

    #[test]
    fn thermistor_loop_covers_missing_temperature() {
        let mut fake = device(ADAPTER_ONLY);
        let mut charger = ChargerSync::new();
        let mut inputs = inputs();
        inputs.battery_temperature = None;
        block_on(charger.task(t(0), &mut fake, &inputs));
        assert_ne!(fake.regs[REG_TIMER as usize] & TS_EN, 0);

        inputs.battery_temperature = Some(25);
        block_on(charger.task(t(20), &mut fake, &inputs));
        assert_eq!(fake.regs[REG_TIMER as usize] & TS_EN, 0);
    }

    #[test]
    fn unstable_reads_leave_image_unsynced() {
        let mut fake = device(ADAPTER_ONLY);
        fake.flaky_reg = Some(REG_SUPPLY);
        let mut charger = ChargerSync::new();
        block_on(charger.task(t(0), &mut fake, &inputs()));
        assert!(!charger.is_synced());
        assert_eq!(charger.adapter_status(), PowerSourceStatus::NotPresent);
        assert!(fake.writes.is_empty());
    }

    #[test]
    fn input_limit_steps() {
        let mut fake = device(HOST_RAIL_ONLY);
        let mut charger = ChargerSync::new();
        let inputs = inputs();
        block_on(charger.task(t(0), &mut fake, &inputs));

        assert!(charger.step_input_limit_down());
        assert_eq!(charger.input_limit(), Milliamps(150));
        assert!(charger.set_input_limit_min());
        assert!(!charger.set_input_limit_min());
        block_on(charger.task(t(20), &mut fake, &inputs));
        assert_eq!(field(fake.regs[REG_CONTROL as usize], IUSB_LIMIT_MASK, IUSB_LIMIT_SHIFT), 0);

        for _ in 0..10 {
            charger.step_input_limit_up();
        }
        assert_eq!(charger.input_limit(), Milliamps(1500));
        assert!(!charger.step_input_limit_up());
    }

    #[test]
    fn dpm_status_is_reported() {
        let mut fake = device(ADAPTER_ONLY);
        let mut charger = ChargerSync::new();
        let inputs = inputs();
        block_on(charger.task(t(0), &mut fake, &inputs));
        assert!(!charger.input_dpm_active());
        fake.regs[REG_DPM as usize] |= DPM_STATUS;
        block_on(charger.task(t(0) + Duration::from_millis(100), &mut fake, &inputs));
        assert!(charger.input_dpm_active());
    }
}
