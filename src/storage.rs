//! Keyed byte store for persisted settings.
//!
//! Each key owns a two-byte slot holding the value and its bitwise complement.
//! A slot whose halves disagree (erased flash, torn write, never written)
//! reads back as absent, and callers fall back to their defaults.

use embedded_storage::{ReadStorage, Storage};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StoreError {
    /// The underlying storage rejected the operation.
    Backend,
    /// The key's slot lies beyond the storage capacity.
    OutOfRange,
}

/// Persisted setting keys. The discriminant is the slot index.
#[repr(u16)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Key {
    ProfileId = 0,

    CustomCapacityLo,
    CustomCapacityHi,
    CustomChargeCurrent,
    CustomTerminationCurrent,
    CustomRegulationVoltage,
    CustomCutoffVoltage,
    CustomTempCold,
    CustomTempCool,
    CustomTempWarm,
    CustomTempHot,
    CustomNtcBetaLo,
    CustomNtcBetaHi,
    CustomNtcResistanceLo,
    CustomNtcResistanceHi,
    /// Fold of capacity and NTC beta, written after the standard fields.
    CustomChecksum,

    CustomChemistry,
    CustomOcv10Lo,
    CustomOcv10Hi,
    CustomOcv50Lo,
    CustomOcv50Hi,
    CustomOcv90Lo,
    CustomOcv90Hi,
    CustomR10Lo,
    CustomR10Hi,
    CustomR50Lo,
    CustomR50Hi,
    CustomR90Lo,
    CustomR90Hi,

    ChargeConfig,
    InputsConfig,
    WatchdogLo,
    WatchdogHi,
}

impl Key {
    pub const COUNT: usize = Key::WatchdogHi as usize + 1;

    pub const fn index(self) -> u16 {
        self as u16
    }
}

/// Keys of the standard custom-profile fields, in wire order.
pub const CUSTOM_STANDARD_KEYS: [Key; 14] = [
    Key::CustomCapacityLo,
    Key::CustomCapacityHi,
    Key::CustomChargeCurrent,
    Key::CustomTerminationCurrent,
    Key::CustomRegulationVoltage,
    Key::CustomCutoffVoltage,
    Key::CustomTempCold,
    Key::CustomTempCool,
    Key::CustomTempWarm,
    Key::CustomTempHot,
    Key::CustomNtcBetaLo,
    Key::CustomNtcBetaHi,
    Key::CustomNtcResistanceLo,
    Key::CustomNtcResistanceHi,
];

/// Keys of the extended custom-profile fields, in wire order.
pub const CUSTOM_EXTENDED_KEYS: [Key; 13] = [
    Key::CustomChemistry,
    Key::CustomOcv10Lo,
    Key::CustomOcv10Hi,
    Key::CustomOcv50Lo,
    Key::CustomOcv50Hi,
    Key::CustomOcv90Lo,
    Key::CustomOcv90Hi,
    Key::CustomR10Lo,
    Key::CustomR10Hi,
    Key::CustomR50Lo,
    Key::CustomR50Hi,
    Key::CustomR90Lo,
    Key::CustomR90Hi,
];

/// Byte-granular persisted settings.
pub trait NonVolatileStore {
    /// `None` when the key was never written or its slot is corrupt.
    fn read_byte(&mut self, key: Key) -> Option<u8>;
    fn write_byte(&mut self, key: Key, value: u8) -> Result<(), StoreError>;

    fn read_u16(&mut self, lo: Key, hi: Key) -> Option<u16> {
        let lo = self.read_byte(lo)?;
        let hi = self.read_byte(hi)?;
        Some(u16::from_le_bytes([lo, hi]))
    }

    fn write_u16(&mut self, lo: Key, hi: Key, value: u16) -> Result<(), StoreError> {
        let [l, h] = value.to_le_bytes();
        self.write_byte(lo, l)?;
        self.write_byte(hi, h)
    }
}

const SLOT_SIZE: u32 = 2;

pub const fn encode_slot(value: u8) -> [u8; 2] {
    [value, !value]
}

pub const fn decode_slot(slot: [u8; 2]) -> Option<u8> {
    if slot[1] == !slot[0] { Some(slot[0]) } else { None }
}

/// [`NonVolatileStore`] over any `embedded-storage` backend using
/// value/complement slots starting at `base`.
pub struct ComplementStore<S> {
    storage: S,
    base: u32,
}

impl<S: Storage> ComplementStore<S> {
    pub fn new(storage: S, base: u32) -> Self {
        Self { storage, base }
    }

    pub fn release(self) -> S {
        self.storage
    }

    fn slot_offset(&self, key: Key) -> Result<u32, StoreError> {
        let offset = self.base + u32::from(key.index()) * SLOT_SIZE;
        if (offset + SLOT_SIZE) as usize > self.storage.capacity() {
            return Err(StoreError::OutOfRange);
        }
        Ok(offset)
    }
}

impl<S: Storage> NonVolatileStore for ComplementStore<S> {
    fn read_byte(&mut self, key: Key) -> Option<u8> {
        let offset = self.slot_offset(key).ok()?;
        let mut slot = [0u8; 2];
        self.storage.read(offset, &mut slot).ok()?;
        decode_slot(slot)
    }

    fn write_byte(&mut self, key: Key, value: u8) -> Result<(), StoreError> {
        let offset = self.slot_offset(key)?;
        self.storage
            .write(offset, &encode_slot(value))
            .map_err(|_| StoreError::Backend)
    }
}
