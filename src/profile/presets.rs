use super::{BatteryProfile, Chemistry};
use crate::units::{ChargeCurrentCode, Decivolts, RegulationCode, TerminationCode};

/// A named factory profile.
#[derive(Clone, Copy, Debug)]
pub struct Preset {
    pub name: &'static str,
    pub profile: BatteryProfile,
}

const fn lipo(capacity: u16, charge: u8, termination: u8, regulation: u8) -> BatteryProfile {
    BatteryProfile {
        capacity,
        charge_current: ChargeCurrentCode(charge),
        termination_current: TerminationCode(termination),
        regulation_voltage: RegulationCode(regulation),
        cutoff_voltage: Decivolts(30),
        temp_cold: 1,
        temp_cool: 10,
        temp_warm: 45,
        temp_hot: 59,
        ntc_beta: 3380,
        ntc_resistance: 10000,
        chemistry: Chemistry::LithiumPolymer,
        discharge_model: None,
    }
}

const fn lifepo4(capacity: u16, charge: u8, termination: u8) -> BatteryProfile {
    BatteryProfile {
        capacity,
        charge_current: ChargeCurrentCode(charge),
        termination_current: TerminationCode(termination),
        // 3.60 V
        regulation_voltage: RegulationCode(5),
        cutoff_voltage: Decivolts(25),
        temp_cold: 0,
        temp_cool: 5,
        temp_warm: 45,
        temp_hot: 55,
        ntc_beta: 3380,
        ntc_resistance: 10000,
        chemistry: Chemistry::LithiumIronPhosphate,
        discharge_model: None,
    }
}

/// Factory profiles, indexed by preset id.
pub static PRESETS: [Preset; 12] = [
    Preset { name: "BP6X_1400", profile: lipo(1400, 5, 1, 34) },
    Preset { name: "BP7X_1820", profile: lipo(1820, 9, 1, 36) },
    Preset { name: "SNN5843_2300", profile: lipo(2300, 13, 2, 36) },
    Preset { name: "PJLIPO_12000", profile: lipo(12000, 26, 7, 35) },
    Preset { name: "PJLIPO_5000", profile: lipo(5000, 26, 3, 35) },
    Preset { name: "PJBP7X_1600", profile: lipo(1600, 7, 1, 36) },
    Preset { name: "PJSNN5843_1300", profile: lipo(1300, 4, 1, 36) },
    Preset { name: "PJZERO_1200", profile: lipo(1200, 3, 0, 35) },
    Preset { name: "PJZERO_1000", profile: lipo(1000, 2, 0, 35) },
    Preset { name: "PJLIPO_600", profile: lipo(600, 0, 0, 35) },
    Preset { name: "PJLIPO_500", profile: lipo(500, 0, 0, 35) },
    Preset { name: "LIFEPO4_3000", profile: lifepo4(3000, 8, 2) },
];
