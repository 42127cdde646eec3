//! Scaled-integer quantities and the charger's register code conversions.
//!
//! Every conversion is pure integer arithmetic: the MCU has no FPU and the
//! register encodings are linear anyway.

/// Voltage in millivolts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Millivolts(pub u16);

/// Current in milliamps.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Milliamps(pub u16);

/// Voltage in tenths of a volt, the unit battery cutoff voltages are stored in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Decivolts(pub u8);

/// Current in tenths of an amp, the unit of the output switch limit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Deciamps(pub u8);

/// A fraction in thousandths, used for state of charge.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Permille(pub u16);

impl Millivolts {
    pub const fn get(self) -> u16 {
        self.0
    }
}

impl Milliamps {
    pub const fn get(self) -> u16 {
        self.0
    }
}

impl Decivolts {
    pub const fn to_millivolts(self) -> Millivolts {
        Millivolts(self.0 as u16 * 100)
    }
}

impl Deciamps {
    pub const fn to_milliamps(self) -> Milliamps {
        Milliamps(self.0 as u16 * 100)
    }
}

impl Permille {
    pub const FULL: Permille = Permille(1000);

    pub const fn from_percent(percent: u8) -> Self {
        Permille(percent as u16 * 10)
    }

    /// Whole percent, rounded down.
    pub const fn percent(self) -> u8 {
        let p = self.0 / 10;
        if p > 100 { 100 } else { p as u8 }
    }
}

/// Charge regulation voltage code: `3500 mV + 20 mV * code`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RegulationCode(pub u8);

impl RegulationCode {
    pub const BASE_MV: u16 = 3500;
    pub const STEP_MV: u16 = 20;
    /// 4.44 V, the highest setting the charger accepts.
    pub const MAX: RegulationCode = RegulationCode(47);

    pub const fn to_millivolts(self) -> Millivolts {
        Millivolts(Self::BASE_MV + self.0 as u16 * Self::STEP_MV)
    }

    /// Highest code whose voltage does not exceed `mv`, saturating at both ends.
    pub const fn floor_of(mv: Millivolts) -> Self {
        if mv.0 <= Self::BASE_MV {
            return RegulationCode(0);
        }
        let code = (mv.0 - Self::BASE_MV) / Self::STEP_MV;
        if code > Self::MAX.0 as u16 {
            Self::MAX
        } else {
            RegulationCode(code as u8)
        }
    }
}

/// Fast-charge current code: `550 mA + 75 mA * code`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChargeCurrentCode(pub u8);

impl ChargeCurrentCode {
    pub const BASE_MA: u16 = 550;
    pub const STEP_MA: u16 = 75;
    /// 2500 mA.
    pub const MAX: ChargeCurrentCode = ChargeCurrentCode(26);

    pub const fn to_milliamps(self) -> Milliamps {
        Milliamps(Self::BASE_MA + self.0 as u16 * Self::STEP_MA)
    }
}

/// Termination current code: `50 mA + 50 mA * code`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TerminationCode(pub u8);

impl TerminationCode {
    pub const BASE_MA: u16 = 50;
    pub const STEP_MA: u16 = 50;
    /// 400 mA.
    pub const MAX: TerminationCode = TerminationCode(7);

    pub const fn to_milliamps(self) -> Milliamps {
        Milliamps(Self::BASE_MA + self.0 as u16 * Self::STEP_MA)
    }

    /// Nearest code at or below `ma`, clamped to the encodable range.
    pub const fn floor_of(ma: Milliamps) -> Self {
        if ma.0 <= Self::BASE_MA {
            return TerminationCode(0);
        }
        let code = (ma.0 - Self::BASE_MA) / Self::STEP_MA;
        if code > Self::MAX.0 as u16 {
            Self::MAX
        } else {
            TerminationCode(code as u8)
        }
    }
}
