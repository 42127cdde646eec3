//! In-memory stand-ins for the board used by the unit tests.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::vec::Vec;

use embassy_time::{Duration, Instant};
use embedded_storage::{ReadStorage, Storage};

use crate::charger::regs::{
    BATSTAT_MASK, REG_BATTERY_VOLTAGE, REG_STATUS, REG_SUPPLY, REGISTER_COUNT, TMR_RST, WRITE_MASKS,
};
use crate::charger::{ChargerBus, ChargerError, ChargerInputs, ChargerSync};
use crate::events::EventFlags;
use crate::rails::{AuxSwitchLimit, RailDriver, RailStatus};
use crate::scheduler::{Platform, RunState};
use crate::storage::ComplementStore;
use crate::telemetry::Telemetry;
use crate::units::{Millivolts, Permille};

/// Erased (all ones) byte storage.
pub struct RamStorage {
    pub bytes: [u8; RamStorage::CAPACITY],
}

impl RamStorage {
    pub const CAPACITY: usize = 128;

    pub fn new() -> Self {
        Self {
            bytes: [0xFF; Self::CAPACITY],
        }
    }
}

impl ReadStorage for RamStorage {
    type Error = ();

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        let start = offset as usize;
        let src = self.bytes.get(start..start + bytes.len()).ok_or(())?;
        bytes.copy_from_slice(src);
        Ok(())
    }

    fn capacity(&self) -> usize {
        Self::CAPACITY
    }
}

impl Storage for RamStorage {
    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        let start = offset as usize;
        let dst = self.bytes.get_mut(start..start + bytes.len()).ok_or(())?;
        dst.copy_from_slice(bytes);
        Ok(())
    }
}

pub fn mem_store() -> ComplementStore<RamStorage> {
    ComplementStore::new(RamStorage::new(), 0)
}

/// Charge controller model: keeps eight registers, applies only the
/// writable bits of each write and drops the self-clearing keep-alive bit.
pub struct FakeCharger {
    pub regs: [u8; REGISTER_COUNT],
    pub writes: Vec<(u8, u8)>,
    pub fail: bool,
    /// Register whose reads alternate between two values.
    pub flaky_reg: Option<u8>,
    /// Transactions issued, failed ones included.
    pub attempts: usize,
    /// Battery over-voltage clears once a regulation voltage is written.
    pub ovp_clears_on_regulation: bool,
    flip: bool,
}

impl FakeCharger {
    pub fn new() -> Self {
        Self {
            regs: [0; REGISTER_COUNT],
            writes: Vec::new(),
            fail: false,
            flaky_reg: None,
            attempts: 0,
            ovp_clears_on_regulation: false,
            flip: false,
        }
    }

    fn is_keepalive(&(reg, value): &(u8, u8)) -> bool {
        reg == REG_STATUS && value & TMR_RST != 0
    }

    /// Writes other than the watchdog keep-alive.
    pub fn policy_writes(&self) -> Vec<(u8, u8)> {
        self.writes.iter().copied().filter(|w| !Self::is_keepalive(w)).collect()
    }

    pub fn keepalive_count(&self) -> usize {
        self.writes.iter().filter(|w| Self::is_keepalive(w)).count()
    }
}

impl ChargerBus for FakeCharger {
    type Error = ();

    async fn read_register(&mut self, reg: u8) -> Result<u8, ChargerError<()>> {
        self.attempts += 1;
        if self.fail {
            return Err(ChargerError::Bus(()));
        }
        let value = self.regs[reg as usize];
        if self.flaky_reg == Some(reg) {
            self.flip = !self.flip;
            return Ok(value ^ u8::from(self.flip));
        }
        Ok(value)
    }

    async fn write_register(&mut self, reg: u8, value: u8) -> Result<(), ChargerError<()>> {
        self.attempts += 1;
        if self.fail {
            return Err(ChargerError::Bus(()));
        }
        self.writes.push((reg, value));
        let mask = WRITE_MASKS[reg as usize];
        let r = &mut self.regs[reg as usize];
        *r = (*r & !mask) | (value & mask);
        if reg == REG_BATTERY_VOLTAGE && self.ovp_clears_on_regulation {
            self.regs[REG_SUPPLY as usize] &= !BATSTAT_MASK;
        }
        Ok(())
    }
}

pub fn idle_inputs() -> ChargerInputs {
    ChargerInputs {
        profile: None,
        rails: RailStatus::new(),
        battery_voltage: Millivolts(3700),
        battery_temperature: None,
    }
}

/// A charger that has completed its first register read with `supply` in
/// the supply status register.
pub fn synced_charger(supply: u8) -> (ChargerSync, FakeCharger) {
    let mut fake = FakeCharger::new();
    fake.regs[REG_SUPPLY as usize] = supply;
    let mut charger = ChargerSync::new();
    embassy_futures::block_on(charger.task(Instant::from_millis(0), &mut fake, &idle_inputs()));
    (charger, fake)
}

/// Analog readings set directly by the test. `battery_script` values are
/// consumed one per battery read and the last one sticks.
pub struct FakeTelemetry {
    pub battery: Cell<u16>,
    pub battery_script: RefCell<VecDeque<u16>>,
    pub temperature: Cell<Option<i8>>,
    /// Permille.
    pub soc: Cell<u16>,
    pub rail_5v: Cell<u16>,
    pub rail_3v3: Cell<u16>,
}

impl FakeTelemetry {
    pub fn new() -> Self {
        Self {
            battery: Cell::new(3800),
            battery_script: RefCell::new(VecDeque::new()),
            temperature: Cell::new(Some(25)),
            soc: Cell::new(500),
            rail_5v: Cell::new(5000),
            rail_3v3: Cell::new(3300),
        }
    }

    pub fn script_battery(&self, readings: &[u16]) {
        self.battery_script.borrow_mut().extend(readings.iter().copied());
    }
}

impl Telemetry for FakeTelemetry {
    fn battery_voltage(&self) -> Millivolts {
        if let Some(mv) = self.battery_script.borrow_mut().pop_front() {
            self.battery.set(mv);
        }
        Millivolts(self.battery.get())
    }

    fn battery_temperature(&self) -> Option<i8> {
        self.temperature.get()
    }

    fn state_of_charge(&self) -> Permille {
        Permille(self.soc.get())
    }

    fn rail_5v(&self) -> Millivolts {
        Millivolts(self.rail_5v.get())
    }

    fn rail_3v3(&self) -> Millivolts {
        Millivolts(self.rail_3v3.get())
    }
}

#[derive(Default)]
pub struct RecordingRails {
    pub boost: bool,
    pub aux_regulator: bool,
    pub aux_switch: AuxSwitchLimit,
    /// Off-to-on transitions of the boost line.
    pub boost_switches: usize,
}

impl RailDriver for RecordingRails {
    fn set_boost(&mut self, enable: bool) {
        if enable && !self.boost {
            self.boost_switches += 1;
        }
        self.boost = enable;
    }

    fn set_aux_regulator(&mut self, enable: bool) {
        self.aux_regulator = enable;
    }

    fn set_aux_switch(&mut self, limit: AuxSwitchLimit) {
        self.aux_switch = limit;
    }
}

pub struct NoDelay;

impl embedded_hal::delay::DelayNs for NoDelay {
    fn delay_ns(&mut self, _ns: u32) {}
}

/// Clock and idle model. Deep sleep stops the raw clock while the RTC keeps
/// counting, as on the target.
pub struct FakePlatform {
    pub raw_ms: u64,
    pub rtc_ms: u64,
    pub button: bool,
    pub pauses: usize,
    pub resumes: usize,
}

impl FakePlatform {
    pub fn new() -> Self {
        Self {
            raw_ms: 0,
            rtc_ms: 0,
            button: false,
            pauses: 0,
            resumes: 0,
        }
    }

    pub fn advance(&mut self, ms: u64) {
        self.raw_ms += ms;
        self.rtc_ms += ms;
    }
}

impl Platform for FakePlatform {
    fn now(&self) -> Instant {
        Instant::from_millis(self.raw_ms)
    }

    fn rtc_millis(&self) -> u64 {
        self.rtc_ms
    }

    fn button_held(&self) -> bool {
        self.button
    }

    fn pause_sampling(&mut self) {
        self.pauses += 1;
    }

    fn resume_sampling(&mut self) {
        self.resumes += 1;
    }

    async fn idle(&mut self, depth: RunState, max: Duration, _events: &EventFlags) {
        let ms = max.as_millis();
        match depth {
            RunState::LowPower => self.rtc_ms += ms,
            RunState::Sleep | RunState::Normal => self.advance(ms),
        }
    }
}
