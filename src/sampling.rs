//! Analog sampling task.
//!
//! Reads the battery and 5V rail dividers plus VREFINT on a fixed cadence and
//! publishes an [`AnalogSamples`] snapshot for the power system. The supply
//! rail (VDDA) is the 3V3 rail, so it falls out of the VREFINT reading.

use core::sync::atomic::Ordering;

use embassy_time::{Duration, Ticker};

use battery_hat::snapshot::Snapshot;
use battery_hat::telemetry::AnalogSamples;
use battery_hat::units::{Millivolts, Permille};

use crate::hardware::AnalogInputs;
use crate::power::SAMPLING_ENABLED;

const SAMPLE_PERIOD: Duration = Duration::from_millis(50);

/// Factory VREFINT reading at 3.0 V VDDA.
const VREFINT_CAL: *const u16 = 0x1FF8_0078 as *const u16;
const VREFINT_CAL_MV: u32 = 3000;

/// Both sense inputs sit behind a 1:2 divider.
const DIVIDER: u32 = 2;

/// Open circuit voltages taken as empty and full for the charge estimate.
const EMPTY_MV: u32 = 3300;
const FULL_MV: u32 = 4150;

fn to_millivolts(raw: u16, vdda_mv: u32) -> Millivolts {
    Millivolts((u32::from(raw) * vdda_mv * DIVIDER / 4095) as u16)
}

/// Linear charge estimate from battery voltage.
fn estimate_charge(battery: Millivolts) -> Permille {
    let mv = u32::from(battery.0).clamp(EMPTY_MV, FULL_MV);
    Permille(((mv - EMPTY_MV) * 1000 / (FULL_MV - EMPTY_MV)) as u16)
}

#[embassy_executor::task]
pub async fn sampling_task(mut analog: AnalogInputs, samples: &'static Snapshot<AnalogSamples>) {
    // SAFETY: fixed factory calibration word in system memory.
    let vrefint_cal = u32::from(unsafe { VREFINT_CAL.read_volatile() });
    let mut vrefint = analog.adc.enable_vref();
    let mut ticker = Ticker::every(SAMPLE_PERIOD);

    loop {
        ticker.next().await;
        if !SAMPLING_ENABLED.load(Ordering::Relaxed) {
            continue;
        }

        let vref_raw = analog.adc.read(&mut vrefint).await.max(1);
        let vdda_mv = VREFINT_CAL_MV * vrefint_cal / u32::from(vref_raw);
        let battery = to_millivolts(analog.adc.read(&mut analog.battery).await, vdda_mv);
        let rail_5v = to_millivolts(analog.adc.read(&mut analog.rail_5v).await, vdda_mv);

        let sample = AnalogSamples {
            battery,
            temperature: None,
            soc: estimate_charge(battery),
            rail_5v,
            rail_3v3: Millivolts(vdda_mv as u16),
        };
        if samples.publish(sample) {
            #[cfg(feature = "debug-mode")]
            defmt::trace!("samples: {}", sample);
        }
    }
}
