//! Charge controller synchronisation.
//!
//! The charger is configured through eight byte registers. [`ChargerSync`]
//! keeps a cached image of them, computes the desired values from the active
//! battery profile, rail state and temperature, and writes only what differs.

pub mod bus;
pub mod regs;
mod sync;

pub use bus::{ChargerBus, ChargerError, I2cChargerBus};
pub use sync::{ChargerInputs, ChargerSync};

use crate::rails::PowerSourceStatus;

/// Decoded STAT field of register 0x00.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ChargerStatus {
    NoSource,
    AdapterReady,
    HostRailReady,
    ChargingFromAdapter,
    ChargingFromHostRail,
    Done,
    Fault,
}

impl ChargerStatus {
    pub const fn from_stat(stat: u8) -> Self {
        match stat & 0b111 {
            0b000 => ChargerStatus::NoSource,
            0b001 => ChargerStatus::AdapterReady,
            0b010 => ChargerStatus::HostRailReady,
            0b011 => ChargerStatus::ChargingFromAdapter,
            0b100 => ChargerStatus::ChargingFromHostRail,
            0b101 => ChargerStatus::Done,
            _ => ChargerStatus::Fault,
        }
    }

    pub const fn is_charging(self) -> bool {
        matches!(
            self,
            ChargerStatus::ChargingFromAdapter | ChargerStatus::ChargingFromHostRail
        )
    }
}

impl PowerSourceStatus {
    /// Decodes the two-bit supply status fields of register 0x01.
    pub const fn from_code(code: u8) -> Self {
        match code & 0b11 {
            0b00 => PowerSourceStatus::Normal,
            0b01 => PowerSourceStatus::Bad,
            0b10 => PowerSourceStatus::Weak,
            _ => PowerSourceStatus::NotPresent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stat_decoding() {
        assert_eq!(ChargerStatus::from_stat(0), ChargerStatus::NoSource);
        assert_eq!(ChargerStatus::from_stat(0b011), ChargerStatus::ChargingFromAdapter);
        assert_eq!(ChargerStatus::from_stat(0b101), ChargerStatus::Done);
        assert_eq!(ChargerStatus::from_stat(0b110), ChargerStatus::Fault);
        assert_eq!(ChargerStatus::from_stat(0b111), ChargerStatus::Fault);
        assert!(ChargerStatus::from_stat(0b100).is_charging());
    }

    #[test]
    fn supply_decoding() {
        assert_eq!(PowerSourceStatus::from_code(0b00), PowerSourceStatus::Normal);
        assert_eq!(PowerSourceStatus::from_code(0b01), PowerSourceStatus::Bad);
        assert_eq!(PowerSourceStatus::from_code(0b10), PowerSourceStatus::Weak);
        assert_eq!(PowerSourceStatus::from_code(0b11), PowerSourceStatus::NotPresent);
    }
}
