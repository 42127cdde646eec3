//! Rail flags that survive a warm reset.
//!
//! The firmware keeps two words in RAM that the startup code does not clear.
//! After a power-on reset their content is garbage, so the caller says whether
//! the reset was cold and the check word guards against anything else.

const CHECK: u32 = 0x4254_5231;

const FORCED_POWER_OFF: u32 = 1 << 0;
const FORCED_AUX_OFF: u32 = 1 << 1;
const WAKE_ARMED: u32 = 1 << 2;
const WAKE_SHIFT: u32 = 8;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct WarmState {
    /// Boost was shut down for undervoltage. Sticky until cleared.
    pub forced_power_off: bool,
    /// The output switch was shed for undervoltage.
    pub forced_aux_off: bool,
    /// Power the host up once charge reaches this percentage.
    pub wake_on_charge: Option<u8>,
}

impl WarmState {
    pub const fn cold() -> Self {
        Self {
            forced_power_off: false,
            forced_aux_off: false,
            wake_on_charge: None,
        }
    }

    pub fn encode(&self) -> [u32; 2] {
        let mut word = 0;
        if self.forced_power_off {
            word |= FORCED_POWER_OFF;
        }
        if self.forced_aux_off {
            word |= FORCED_AUX_OFF;
        }
        if let Some(pct) = self.wake_on_charge {
            word |= WAKE_ARMED | (u32::from(pct) << WAKE_SHIFT);
        }
        [word, word ^ CHECK]
    }

    pub fn restore(words: [u32; 2], cold_boot: bool) -> Self {
        let [word, check] = words;
        if cold_boot || word ^ CHECK != check {
            return Self::cold();
        }
        Self {
            forced_power_off: word & FORCED_POWER_OFF != 0,
            forced_aux_off: word & FORCED_AUX_OFF != 0,
            wake_on_charge: (word & WAKE_ARMED != 0).then_some((word >> WAKE_SHIFT) as u8),
        }
    }
}
