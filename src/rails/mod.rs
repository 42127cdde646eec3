//! Power rails: boost converter, auxiliary regulator and the output switch.
//!
//! The boost converter lifts the battery to 5V for the host. The auxiliary
//! regulator sits behind it and can only run while boost is on. The output
//! switch feeds an external load with a selectable current limit.

mod controller;
pub mod driver;
pub mod warm;

pub use controller::{PowerRailController, RailConfig};
pub use driver::{GpioRails, RailDriver};
pub use warm::WarmState;

use crate::units::Deciamps;

/// Decoded supply status of one charger input.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PowerSourceStatus {
    #[default]
    NotPresent,
    Bad,
    Weak,
    Normal,
}

impl PowerSourceStatus {
    /// Weak or normal: good enough to run from or charge from.
    pub const fn is_usable(self) -> bool {
        matches!(self, PowerSourceStatus::Weak | PowerSourceStatus::Normal)
    }

    /// Host-interface encoding.
    pub const fn code(self) -> u8 {
        match self {
            PowerSourceStatus::NotPresent => 0,
            PowerSourceStatus::Bad => 1,
            PowerSourceStatus::Weak => 2,
            PowerSourceStatus::Normal => 3,
        }
    }
}

/// Whether the host rail is being powered by something other than this board.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HostRailDetect {
    #[default]
    Unknown,
    Unpowered,
    Powered,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AuxRegulatorMode {
    /// Follows explicit requests, subject to boost being on.
    Manual,
    /// Follows the boost converter.
    #[default]
    ShadowBoost,
}

/// Output switch state. Only two current limits exist.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AuxSwitchLimit {
    #[default]
    Disabled,
    /// 500 mA.
    Low,
    /// 2.1 A.
    High,
}

impl AuxSwitchLimit {
    /// Any value other than the two supported limits means off.
    pub const fn from_deciamps(limit: Deciamps) -> Self {
        match limit.0 {
            5 => AuxSwitchLimit::Low,
            21 => AuxSwitchLimit::High,
            _ => AuxSwitchLimit::Disabled,
        }
    }

    pub const fn deciamps(self) -> Deciamps {
        match self {
            AuxSwitchLimit::Disabled => Deciamps(0),
            AuxSwitchLimit::Low => Deciamps(5),
            AuxSwitchLimit::High => Deciamps(21),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RailError {
    /// The battery is at or below cutoff and no other source is present.
    BatteryLow,
    /// The battery sagged below cutoff right after boost started.
    BatteryCollapsed,
}

/// Published rail state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RailStatus {
    pub boost_enabled: bool,
    pub aux_regulator_enabled: bool,
    pub aux_switch: AuxSwitchLimit,
    pub host_detect: HostRailDetect,
    pub adapter: PowerSourceStatus,
    pub host_rail: PowerSourceStatus,
}

impl RailStatus {
    pub const fn new() -> Self {
        Self {
            boost_enabled: false,
            aux_regulator_enabled: false,
            aux_switch: AuxSwitchLimit::Disabled,
            host_detect: HostRailDetect::Unknown,
            adapter: PowerSourceStatus::NotPresent,
            host_rail: PowerSourceStatus::NotPresent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn switch_limits() {
        assert_eq!(AuxSwitchLimit::from_deciamps(Deciamps(5)), AuxSwitchLimit::Low);
        assert_eq!(AuxSwitchLimit::from_deciamps(Deciamps(21)), AuxSwitchLimit::High);
        assert_eq!(AuxSwitchLimit::from_deciamps(Deciamps(10)), AuxSwitchLimit::Disabled);
        assert_eq!(AuxSwitchLimit::High.deciamps(), Deciamps(21));
    }
}
