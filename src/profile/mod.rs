//! Battery profiles: the parameter set that drives charging and shutdown.
//!
//! Exactly one profile is active at a time (or none, while the selection is
//! invalid). [`BatteryProfileManager`] owns it; everyone else reads copies.

mod manager;
mod presets;

pub use manager::{BatteryProfileManager, StrapReading};
pub use presets::{PRESETS, Preset};

use crate::units::{
    ChargeCurrentCode, Decivolts, Millivolts, RegulationCode, TerminationCode,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Chemistry {
    LithiumPolymer,
    LithiumIronPhosphate,
}

impl Chemistry {
    pub const fn code(self) -> u8 {
        match self {
            Chemistry::LithiumPolymer => 0,
            Chemistry::LithiumIronPhosphate => 1,
        }
    }

    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Chemistry::LithiumPolymer),
            1 => Some(Chemistry::LithiumIronPhosphate),
            _ => None,
        }
    }
}

/// Open-circuit voltage and internal resistance at 10/50/90 % charge.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DischargeModel {
    pub ocv: [Millivolts; 3],
    /// Milliohms.
    pub resistance: [u16; 3],
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BatteryProfile {
    /// mAh, [`BatteryProfile::UNKNOWN_CAPACITY`] when not known.
    pub capacity: u16,
    pub charge_current: ChargeCurrentCode,
    pub termination_current: TerminationCode,
    pub regulation_voltage: RegulationCode,
    pub cutoff_voltage: Decivolts,
    /// Charging thresholds in degrees Celsius.
    pub temp_cold: i8,
    pub temp_cool: i8,
    pub temp_warm: i8,
    pub temp_hot: i8,
    pub ntc_beta: u16,
    /// Thermistor resistance at 25 C, ohms.
    pub ntc_resistance: u16,
    pub chemistry: Chemistry,
    pub discharge_model: Option<DischargeModel>,
}

pub const STANDARD_FIELDS_LEN: usize = 14;
pub const EXTENDED_FIELDS_LEN: usize = 13;

impl BatteryProfile {
    pub const UNKNOWN_CAPACITY: u16 = 0xFFFF;

    pub const fn capacity_mah(&self) -> Option<u16> {
        if self.capacity == Self::UNKNOWN_CAPACITY { None } else { Some(self.capacity) }
    }

    pub const fn cutoff(&self) -> Millivolts {
        self.cutoff_voltage.to_millivolts()
    }

    /// Wire layout: capacity (u16 LE), charge code, termination code,
    /// regulation code, cutoff, cold, cool, warm, hot, NTC beta (u16 LE),
    /// NTC resistance (u16 LE).
    pub fn standard_fields(&self) -> [u8; STANDARD_FIELDS_LEN] {
        let [cap_lo, cap_hi] = self.capacity.to_le_bytes();
        let [beta_lo, beta_hi] = self.ntc_beta.to_le_bytes();
        let [res_lo, res_hi] = self.ntc_resistance.to_le_bytes();
        [
            cap_lo,
            cap_hi,
            self.charge_current.0,
            self.termination_current.0,
            self.regulation_voltage.0,
            self.cutoff_voltage.0,
            self.temp_cold as u8,
            self.temp_cool as u8,
            self.temp_warm as u8,
            self.temp_hot as u8,
            beta_lo,
            beta_hi,
            res_lo,
            res_hi,
        ]
    }

    /// Inverse of [`standard_fields`](Self::standard_fields); chemistry and
    /// discharge model are reset to their defaults.
    pub fn from_standard_fields(b: &[u8; STANDARD_FIELDS_LEN]) -> Self {
        Self {
            capacity: u16::from_le_bytes([b[0], b[1]]),
            charge_current: ChargeCurrentCode(b[2]),
            termination_current: TerminationCode(b[3]),
            regulation_voltage: RegulationCode(b[4]),
            cutoff_voltage: Decivolts(b[5]),
            temp_cold: b[6] as i8,
            temp_cool: b[7] as i8,
            temp_warm: b[8] as i8,
            temp_hot: b[9] as i8,
            ntc_beta: u16::from_le_bytes([b[10], b[11]]),
            ntc_resistance: u16::from_le_bytes([b[12], b[13]]),
            chemistry: Chemistry::LithiumPolymer,
            discharge_model: None,
        }
    }

    /// Checks the limits the charger and the rail logic rely on.
    pub fn is_valid(&self) -> bool {
        self.charge_current <= ChargeCurrentCode::MAX
            && self.termination_current <= TerminationCode::MAX
            && self.regulation_voltage <= RegulationCode::MAX
            && (20..=40).contains(&self.cutoff_voltage.0)
            && self.temp_cold < self.temp_cool
            && self.temp_cool < self.temp_warm
            && self.temp_warm < self.temp_hot
    }
}

/// Chemistry code followed by OCV10/50/90 and R10/50/90, each u16 LE.
pub fn extended_fields(chemistry: Chemistry, model: &DischargeModel) -> [u8; EXTENDED_FIELDS_LEN] {
    let mut out = [0u8; EXTENDED_FIELDS_LEN];
    out[0] = chemistry.code();
    let words = [
        model.ocv[0].0,
        model.ocv[1].0,
        model.ocv[2].0,
        model.resistance[0],
        model.resistance[1],
        model.resistance[2],
    ];
    for (i, w) in words.iter().enumerate() {
        out[1 + 2 * i..3 + 2 * i].copy_from_slice(&w.to_le_bytes());
    }
    out
}

pub fn parse_extended_fields(b: &[u8; EXTENDED_FIELDS_LEN]) -> Option<(Chemistry, DischargeModel)> {
    let chemistry = Chemistry::from_code(b[0])?;
    let word = |i: usize| u16::from_le_bytes([b[1 + 2 * i], b[2 + 2 * i]]);
    let model = DischargeModel {
        ocv: [Millivolts(word(0)), Millivolts(word(1)), Millivolts(word(2))],
        resistance: [word(3), word(4), word(5)],
    };
    Some((chemistry, model))
}

/// Capacity and NTC beta folded into the byte stored after the standard fields.
pub const fn standard_checksum(capacity: u16, ntc_beta: u16) -> u8 {
    let x = capacity ^ ntc_beta;
    (x as u8) ^ ((x >> 8) as u8)
}

/// A profile selection as the host requests it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ProfileId {
    Preset(u8),
    Custom,
    /// Resolve from the board's configuration straps.
    Default,
}

impl ProfileId {
    pub const CUSTOM_CODE: u8 = 0x0F;
    pub const DEFAULT_CODE: u8 = 0xFF;

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            Self::CUSTOM_CODE => Some(ProfileId::Custom),
            Self::DEFAULT_CODE => Some(ProfileId::Default),
            c if (c as usize) < PRESETS.len() => Some(ProfileId::Preset(c)),
            _ => None,
        }
    }

    pub const fn code(self) -> u8 {
        match self {
            ProfileId::Preset(i) => i,
            ProfileId::Custom => Self::CUSTOM_CODE,
            ProfileId::Default => Self::DEFAULT_CODE,
        }
    }
}

/// What the profile manager reports to the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ProfileStatus {
    Preset(u8),
    Custom,
    /// Synthesised from the board's configuration resistor.
    Synthesized,
    CustomInvalid,
    ConfigInvalid,
    StoredIdInvalid,
    /// A request is queued and not yet applied.
    WriteBusy,
}

impl ProfileStatus {
    pub const fn code(self) -> u8 {
        match self {
            ProfileStatus::Preset(i) => i,
            ProfileStatus::Custom => ProfileId::CUSTOM_CODE,
            ProfileStatus::Synthesized => 0xF3,
            ProfileStatus::CustomInvalid => 0xF0,
            ProfileStatus::ConfigInvalid => 0xF1,
            ProfileStatus::StoredIdInvalid => 0xF2,
            ProfileStatus::WriteBusy => 0xFE,
        }
    }

    pub const fn has_profile(self) -> bool {
        matches!(
            self,
            ProfileStatus::Preset(_) | ProfileStatus::Custom | ProfileStatus::Synthesized
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RequestError {
    /// The requested id is what is already reported.
    Unchanged,
    InvalidId,
}

/// A host write of custom profile parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CustomFields {
    Standard([u8; STANDARD_FIELDS_LEN]),
    Extended([u8; EXTENDED_FIELDS_LEN]),
}
