//! Timing constants, thresholds and persisted option bytes.
//!
//! Values that can change at runtime live in the non-volatile store and are
//! loaded through the types at the bottom of this file; everything else is a
//! compile-time constant.

use embassy_time::Duration;

use crate::units::{Decivolts, Millivolts};

// ---- scheduler ----

/// Period of the cooperative task dispatch.
pub const TASK_PERIOD: Duration = Duration::from_millis(20);
/// The loop stays awake this long after a host command.
pub const HOST_COMMAND_WINDOW: Duration = Duration::from_millis(10);
/// Host must have been silent this long before deep sleep is considered.
pub const HOST_QUIET_BEFORE_LOW_POWER: Duration = Duration::from_millis(2000);
/// Minimum time between leaving deep sleep and entering it again.
pub const LOW_POWER_REENTRY_DELAY: Duration = Duration::from_millis(20);
/// Longest uninterrupted deep sleep.
pub const LOW_POWER_MAX_SLEEP: Duration = Duration::from_millis(1000);
/// Analog front end settling time after sampling resumes.
pub const SAMPLING_SETTLE_TIME: Duration = Duration::from_millis(10);
/// How long the host rail is held off when the watchdog power-cycles the host.
pub const HOST_POWER_CYCLE_OFF_TIME: Duration = Duration::from_millis(2000);

// ---- charger ----

pub const CHARGER_I2C_ADDR: u8 = 0x6B;
/// Watchdog keep-alive cadence; the charger reverts to defaults after 30 s of silence.
pub const CHARGER_KEEPALIVE_PERIOD: Duration = Duration::from_millis(1000);
/// Full register re-read cadence.
pub const CHARGER_READ_PERIOD: Duration = Duration::from_millis(90);
/// Upper bound on a single bus transaction.
pub const CHARGER_TRANSACTION_TIMEOUT: Duration = Duration::from_millis(1000);
/// Regulation codes removed above the warm threshold (100 mV).
pub const WARM_REGULATION_DERATE: u8 = 5;
/// Host-rail input limit index used until the rail has been characterised (500 mA).
pub const DEFAULT_INPUT_LIMIT_INDEX: usize = 2;

// ---- power rails ----

/// Cutoff used while no battery profile is active.
pub const DEFAULT_CUTOFF: Decivolts = Decivolts(30);
/// Highest voltage the auxiliary regulator can put on the host rail.
pub const AUX_REGULATOR_MAX_OUTPUT: Millivolts = Millivolts(5090);
/// Host rail reading that means the host is powered from its own supply.
pub const HOST_SELF_POWERED_THRESHOLD: Millivolts = Millivolts(4800);
/// Host rail detection must hold this long before it is believed.
pub const HOST_RAIL_DEBOUNCE: Duration = Duration::from_millis(500);
/// Rail checks are skipped this long after the boost converter starts.
pub const BOOST_STABILIZE_TIME: Duration = Duration::from_millis(100);
/// Time the battery gets to recover after the output switch is shed.
pub const AUX_SWITCH_GRACE: Duration = Duration::from_millis(100);
/// 5V rail below this with a healthy 3V3 rail counts as a collapse.
pub const RAIL_5V_COLLAPSE: Millivolts = Millivolts(4000);
pub const RAIL_3V3_HEALTHY: Millivolts = Millivolts(3000);
/// Re-samples of the battery after enabling boost with no other source.
pub const BOOST_ENABLE_RETRIES: u8 = 2;
pub const BOOST_ENABLE_SAMPLE_DELAY_US: u32 = 2000;
/// Interval between input limit increments on the host rail.
pub const INPUT_LIMIT_STEP_PERIOD: Duration = Duration::from_millis(2000);
/// Wake-on-charge threshold armed by an undervoltage shutdown.
pub const UNDERVOLTAGE_WAKE_PERCENT: u8 = 5;

// ---- persisted option bytes ----

/// Charge-enable configuration byte. Bit 0 enables charging.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChargeConfig(pub u8);

impl ChargeConfig {
    pub const ENABLE: u8 = 1 << 0;

    pub const fn charging_enabled(self) -> bool {
        self.0 & Self::ENABLE != 0
    }
}

impl Default for ChargeConfig {
    fn default() -> Self {
        ChargeConfig(Self::ENABLE)
    }
}

/// Input selection configuration byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct InputsConfig(pub u8);

impl InputsConfig {
    /// Prefer the host rail over the adapter when both are usable.
    pub const HOST_RAIL_PREFERRED: u8 = 1 << 0;
    /// Allow charging from the host rail.
    pub const HOST_RAIL_CHARGING: u8 = 1 << 1;
    /// Allow the adapter input to draw 2.5 A instead of 1.5 A.
    pub const ADAPTER_HIGH_LIMIT: u8 = 1 << 2;
    /// Keep the system running from input power without a battery.
    pub const NO_BATTERY_OPERATION: u8 = 1 << 5;

    pub const fn host_rail_preferred(self) -> bool {
        self.0 & Self::HOST_RAIL_PREFERRED != 0
    }

    pub const fn host_rail_charging(self) -> bool {
        self.0 & Self::HOST_RAIL_CHARGING != 0
    }

    pub const fn adapter_high_limit(self) -> bool {
        self.0 & Self::ADAPTER_HIGH_LIMIT != 0
    }

    pub const fn no_battery_operation(self) -> bool {
        self.0 & Self::NO_BATTERY_OPERATION != 0
    }
}

impl Default for InputsConfig {
    fn default() -> Self {
        InputsConfig(Self::HOST_RAIL_CHARGING)
    }
}
