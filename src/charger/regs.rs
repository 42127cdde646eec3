//! Register map of the bq2416x-class charge controller.
//!
//! Field masks are in-place; `SHIFT` constants give the bit position of a
//! multi-bit field.

use crate::units::Milliamps;

pub const REGISTER_COUNT: usize = 8;

// 0x00 status / control
pub const REG_STATUS: u8 = 0x00;
pub const TMR_RST: u8 = 1 << 7;
pub const STAT_MASK: u8 = 0b0111_0000;
pub const STAT_SHIFT: u8 = 4;
pub const SUPPLY_SEL: u8 = 1 << 3;
pub const FAULT_MASK: u8 = 0b0000_0111;

// 0x01 supply status / battery status
pub const REG_SUPPLY: u8 = 0x01;
pub const INSTAT_MASK: u8 = 0b1100_0000;
pub const INSTAT_SHIFT: u8 = 6;
pub const USBSTAT_MASK: u8 = 0b0011_0000;
pub const USBSTAT_SHIFT: u8 = 4;
pub const BATSTAT_MASK: u8 = 0b0000_0110;
pub const BATSTAT_SHIFT: u8 = 1;
pub const BATSTAT_OVP: u8 = 0b01;
pub const EN_NOBATOP: u8 = 1 << 0;

// 0x02 control
pub const REG_CONTROL: u8 = 0x02;
pub const IUSB_LIMIT_MASK: u8 = 0b0111_0000;
pub const IUSB_LIMIT_SHIFT: u8 = 4;
pub const EN_STAT: u8 = 1 << 3;
pub const TE: u8 = 1 << 2;
/// Set to disable charging.
pub const CE: u8 = 1 << 1;
pub const HZ_MODE: u8 = 1 << 0;

// 0x03 battery voltage / adapter limit
pub const REG_BATTERY_VOLTAGE: u8 = 0x03;
pub const VBREG_MASK: u8 = 0b1111_1100;
pub const VBREG_SHIFT: u8 = 2;
/// Adapter input limit: clear 1.5 A, set 2.5 A.
pub const IN_LIMIT: u8 = 1 << 1;

pub const REG_PART: u8 = 0x04;

// 0x05 charge / termination current
pub const REG_CURRENT: u8 = 0x05;
pub const ICHRG_MASK: u8 = 0b1111_1000;
pub const ICHRG_SHIFT: u8 = 3;
pub const ITERM_MASK: u8 = 0b0000_0111;

// 0x06 input DPM
pub const REG_DPM: u8 = 0x06;
pub const DPM_STATUS: u8 = 1 << 6;
pub const VINDPM_USB_MASK: u8 = 0b0011_1000;
pub const VINDPM_USB_SHIFT: u8 = 3;
pub const VINDPM_IN_MASK: u8 = 0b0000_0111;

// 0x07 safety timer / NTC
pub const REG_TIMER: u8 = 0x07;
pub const TMR2X_EN: u8 = 1 << 7;
pub const TMR_MASK: u8 = 0b0110_0000;
pub const TMR_SHIFT: u8 = 5;
pub const TS_EN: u8 = 1 << 3;
pub const LOW_CHG: u8 = 1 << 0;

/// Bits the firmware owns in each register; everything else is left as read.
pub const WRITE_MASKS: [u8; REGISTER_COUNT] = [
    SUPPLY_SEL,
    EN_NOBATOP,
    IUSB_LIMIT_MASK | EN_STAT | TE | CE | HZ_MODE,
    VBREG_MASK | IN_LIMIT,
    0x00,
    ICHRG_MASK | ITERM_MASK,
    VINDPM_USB_MASK | VINDPM_IN_MASK,
    TMR2X_EN | TMR_MASK | TS_EN | LOW_CHG,
];

/// Write order: currents and limits first, the control register with CE/HZ last.
pub const WRITE_ORDER: [u8; 7] = [
    REG_CURRENT,
    REG_DPM,
    REG_TIMER,
    REG_BATTERY_VOLTAGE,
    REG_SUPPLY,
    REG_STATUS,
    REG_CONTROL,
];

/// Host-rail input current limits by IUSB_LIMIT code.
pub const HOST_RAIL_LIMITS: [Milliamps; 6] = [
    Milliamps(100),
    Milliamps(150),
    Milliamps(500),
    Milliamps(800),
    Milliamps(900),
    Milliamps(1500),
];

/// VIN_DPM code 4.36 V for the host rail, 4.52 V for the adapter.
pub const VINDPM_USB_DEFAULT: u8 = 0b010;
pub const VINDPM_IN_DEFAULT: u8 = 0b011;
/// 9 h safety timer.
pub const TMR_DEFAULT: u8 = 0b10;

#[inline]
pub const fn field(reg: u8, mask: u8, shift: u8) -> u8 {
    (reg & mask) >> shift
}

#[inline]
pub const fn with_field(reg: u8, mask: u8, shift: u8, value: u8) -> u8 {
    (reg & !mask) | ((value << shift) & mask)
}

#[inline]
pub const fn with_flag(reg: u8, flag: u8, on: bool) -> u8 {
    if on { reg | flag } else { reg & !flag }
}
