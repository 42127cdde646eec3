use super::{
    BatteryProfile, Chemistry, CustomFields, EXTENDED_FIELDS_LEN, PRESETS, ProfileId,
    ProfileStatus, RequestError, STANDARD_FIELDS_LEN, parse_extended_fields, standard_checksum,
};
use crate::snapshot::Snapshot;
use crate::storage::{CUSTOM_EXTENDED_KEYS, CUSTOM_STANDARD_KEYS, Key, NonVolatileStore, StoreError};
use crate::units::{ChargeCurrentCode, Decivolts, Milliamps, RegulationCode, TerminationCode};

/// Board configuration straps, sampled once at boot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StrapReading {
    /// Fixed code of the board variant.
    pub board_code: u8,
    /// Preset index from the auxiliary resistor strap, if one is fitted.
    pub aux_strap: Option<u8>,
    /// Raw code from the configuration resistor network, if one is fitted.
    pub config_code: Option<u8>,
}

enum Resolved {
    Preset(u8),
    Synthesized(BatteryProfile),
    Invalid,
}

fn resolve_straps(straps: &StrapReading) -> Resolved {
    if straps.aux_strap.is_none() && usize::from(straps.board_code) < PRESETS.len() {
        return Resolved::Preset(straps.board_code);
    }
    if let Some(i) = straps.aux_strap.filter(|&i| usize::from(i) < PRESETS.len()) {
        return Resolved::Preset(i);
    }
    match straps.config_code {
        Some(raw) => Resolved::Synthesized(synthesize_from_config(raw)),
        None => Resolved::Invalid,
    }
}

/// Builds a profile from the configuration resistor code.
///
/// Bits 3:0 scale the charge current across the charger's range, bits 5:4
/// pick the regulation voltage (4.20 V, 4.34 V, LiFePO4 3.60 V, 4.10 V).
/// Termination is a tenth of the charge current. Capacity is unknown.
pub fn synthesize_from_config(raw: u8) -> BatteryProfile {
    let charge = u16::from(raw & 0x0F) * u16::from(ChargeCurrentCode::MAX.0) / 15;
    let charge_current = ChargeCurrentCode(charge as u8);
    let termination_current =
        TerminationCode::floor_of(Milliamps(charge_current.to_milliamps().0 / 10));

    let (regulation, cutoff, chemistry) = match (raw >> 4) & 0x03 {
        0 => (RegulationCode(35), Decivolts(30), Chemistry::LithiumPolymer),
        1 => (RegulationCode(42), Decivolts(30), Chemistry::LithiumPolymer),
        2 => (RegulationCode(5), Decivolts(25), Chemistry::LithiumIronPhosphate),
        _ => (RegulationCode(30), Decivolts(30), Chemistry::LithiumPolymer),
    };

    BatteryProfile {
        capacity: BatteryProfile::UNKNOWN_CAPACITY,
        charge_current,
        termination_current,
        regulation_voltage: regulation,
        cutoff_voltage: cutoff,
        temp_cold: 1,
        temp_cool: 10,
        temp_warm: 45,
        temp_hot: 59,
        ntc_beta: 3380,
        ntc_resistance: 10000,
        chemistry,
        discharge_model: None,
    }
}

fn read_fields<const N: usize>(store: &mut impl NonVolatileStore, keys: &[Key; N]) -> Option<[u8; N]> {
    let mut out = [0u8; N];
    for (byte, key) in out.iter_mut().zip(keys.iter()) {
        *byte = store.read_byte(*key)?;
    }
    Some(out)
}

fn write_fields(store: &mut impl NonVolatileStore, keys: &[Key], bytes: &[u8]) -> Result<(), StoreError> {
    for (key, byte) in keys.iter().zip(bytes.iter()) {
        store.write_byte(*key, *byte)?;
    }
    Ok(())
}

/// Reads and validates the custom profile. `None` if any standard field is
/// missing, the checksum disagrees or the values are out of range.
fn load_custom(store: &mut impl NonVolatileStore) -> Option<BatteryProfile> {
    let fields: [u8; STANDARD_FIELDS_LEN] = read_fields(store, &CUSTOM_STANDARD_KEYS)?;
    let mut profile = BatteryProfile::from_standard_fields(&fields);
    if store.read_byte(Key::CustomChecksum)? != standard_checksum(profile.capacity, profile.ntc_beta) {
        return None;
    }
    if !profile.is_valid() {
        return None;
    }
    let extended: Option<[u8; EXTENDED_FIELDS_LEN]> = read_fields(store, &CUSTOM_EXTENDED_KEYS);
    if let Some((chemistry, model)) = extended.as_ref().and_then(parse_extended_fields) {
        profile.chemistry = chemistry;
        profile.discharge_model = Some(model);
    }
    Some(profile)
}

/// Owns the active battery profile.
///
/// Host requests only queue work; [`task`](Self::task) applies them from the
/// scheduler so the store is never written from the host bus handler.
pub struct BatteryProfileManager {
    straps: StrapReading,
    status: ProfileStatus,
    pending_id: Option<ProfileId>,
    pending_standard: Option<[u8; STANDARD_FIELDS_LEN]>,
    pending_extended: Option<[u8; EXTENDED_FIELDS_LEN]>,
    active: Snapshot<Option<BatteryProfile>>,
}

impl BatteryProfileManager {
    pub const fn new(straps: StrapReading) -> Self {
        Self {
            straps,
            status: ProfileStatus::ConfigInvalid,
            pending_id: None,
            pending_standard: None,
            pending_extended: None,
            active: Snapshot::new(None),
        }
    }

    /// Loads the persisted selection and publishes the resulting profile.
    pub fn initialize(&mut self, store: &mut impl NonVolatileStore) {
        match store.read_byte(Key::ProfileId) {
            None => {
                info!("profile: no stored selection, using board default");
                if let Err(e) = store.write_byte(Key::ProfileId, ProfileId::DEFAULT_CODE) {
                    warn!("profile: persisting default selection failed: {}", e);
                }
                self.apply(ProfileId::Default, store);
            }
            Some(code) => match ProfileId::from_code(code) {
                Some(id) => self.apply(id, store),
                None => {
                    warn!("profile: stored id {} is not a profile", code);
                    self.status = ProfileStatus::StoredIdInvalid;
                    self.active.publish(None);
                }
            },
        }
    }

    /// Queues a switch to profile `code`. The newest queued request wins.
    pub fn request_profile_change(&mut self, code: u8) -> Result<(), RequestError> {
        let id = ProfileId::from_code(code).ok_or(RequestError::InvalidId)?;
        if code == self.status.code() {
            return Err(RequestError::Unchanged);
        }
        self.pending_id = Some(id);
        self.status = ProfileStatus::WriteBusy;
        Ok(())
    }

    /// Queues custom parameters for persisting; they also select the custom profile.
    pub fn request_custom_profile_write(&mut self, fields: CustomFields) {
        match fields {
            CustomFields::Standard(b) => self.pending_standard = Some(b),
            CustomFields::Extended(b) => self.pending_extended = Some(b),
        }
        self.pending_id = Some(ProfileId::Custom);
        self.status = ProfileStatus::WriteBusy;
    }

    /// Applies one queued item: a standard field write, then an extended
    /// field write, then a selection change. Returns true when the active
    /// profile was re-evaluated, so dependants should re-read it.
    pub fn task(&mut self, store: &mut impl NonVolatileStore) -> bool {
        let id = if let Some(fields) = self.pending_standard.take() {
            let profile = BatteryProfile::from_standard_fields(&fields);
            let written = write_fields(store, &CUSTOM_STANDARD_KEYS, &fields).and_then(|()| {
                store.write_byte(
                    Key::CustomChecksum,
                    standard_checksum(profile.capacity, profile.ntc_beta),
                )
            });
            if let Err(e) = written {
                warn!("profile: custom fields write failed: {}", e);
            }
            self.take_custom_selection()
        } else if let Some(fields) = self.pending_extended.take() {
            if let Err(e) = write_fields(store, &CUSTOM_EXTENDED_KEYS, &fields) {
                warn!("profile: extended fields write failed: {}", e);
            }
            self.take_custom_selection()
        } else if let Some(id) = self.pending_id.take() {
            id
        } else {
            return false;
        };

        if let Err(e) = store.write_byte(Key::ProfileId, id.code()) {
            warn!("profile: persisting selection failed: {}", e);
        }
        self.apply(id, store);
        if self.has_pending_request() {
            self.status = ProfileStatus::WriteBusy;
        }
        true
    }

    /// A custom write selects the custom profile. A selection queued after
    /// it stays queued for its own pass.
    fn take_custom_selection(&mut self) -> ProfileId {
        if self.pending_id == Some(ProfileId::Custom) && !self.custom_write_pending() {
            self.pending_id = None;
        }
        ProfileId::Custom
    }

    fn custom_write_pending(&self) -> bool {
        self.pending_standard.is_some() || self.pending_extended.is_some()
    }

    fn apply(&mut self, id: ProfileId, store: &mut impl NonVolatileStore) {
        let (status, profile) = match id {
            ProfileId::Preset(i) => match PRESETS.get(usize::from(i)) {
                Some(preset) => (ProfileStatus::Preset(i), Some(preset.profile)),
                None => (ProfileStatus::StoredIdInvalid, None),
            },
            ProfileId::Custom => match load_custom(store) {
                Some(p) => (ProfileStatus::Custom, Some(p)),
                None => (ProfileStatus::CustomInvalid, None),
            },
            ProfileId::Default => match resolve_straps(&self.straps) {
                Resolved::Preset(i) => (ProfileStatus::Preset(i), Some(PRESETS[usize::from(i)].profile)),
                Resolved::Synthesized(p) => (ProfileStatus::Synthesized, Some(p)),
                Resolved::Invalid => (ProfileStatus::ConfigInvalid, None),
            },
        };
        info!("profile: {} -> status {}", id, status);
        self.status = status;
        self.active.publish(profile);
    }

    pub fn profile_status(&self) -> ProfileStatus {
        self.status
    }

    pub fn active_profile(&self) -> Option<BatteryProfile> {
        self.active.get()
    }

    /// Shared view of the active profile for interrupt-context readers.
    pub fn active_snapshot(&self) -> &Snapshot<Option<BatteryProfile>> {
        &self.active
    }

    pub fn has_pending_request(&self) -> bool {
        self.pending_id.is_some() || self.pending_standard.is_some() || self.pending_extended.is_some()
    }
}
