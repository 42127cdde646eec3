//! Measured quantities consumed by the power logic.
//!
//! Sampling and fuel gauging happen elsewhere; they publish an
//! [`AnalogSamples`] value and the control code reads it through
//! [`Telemetry`].

use crate::snapshot::Snapshot;
use crate::units::{Millivolts, Permille};

pub trait Telemetry {
    fn battery_voltage(&self) -> Millivolts;
    /// `None` when no thermistor is fitted or the reading is out of range.
    fn battery_temperature(&self) -> Option<i8>;
    fn state_of_charge(&self) -> Permille;
    /// Host 5V rail.
    fn rail_5v(&self) -> Millivolts;
    fn rail_3v3(&self) -> Millivolts;
}

/// One set of readings from the analog front end.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AnalogSamples {
    pub battery: Millivolts,
    pub temperature: Option<i8>,
    pub soc: Permille,
    pub rail_5v: Millivolts,
    pub rail_3v3: Millivolts,
}

impl AnalogSamples {
    pub const fn empty() -> Self {
        Self {
            battery: Millivolts(0),
            temperature: None,
            soc: Permille(0),
            rail_5v: Millivolts(0),
            rail_3v3: Millivolts(0),
        }
    }
}

/// [`Telemetry`] backed by the samples the sampling task publishes.
pub struct SampledTelemetry<'a> {
    samples: &'a Snapshot<AnalogSamples>,
}

impl<'a> SampledTelemetry<'a> {
    pub const fn new(samples: &'a Snapshot<AnalogSamples>) -> Self {
        Self { samples }
    }
}

impl Telemetry for SampledTelemetry<'_> {
    fn battery_voltage(&self) -> Millivolts {
        self.samples.get().battery
    }

    fn battery_temperature(&self) -> Option<i8> {
        self.samples.get().temperature
    }

    fn state_of_charge(&self) -> Permille {
        self.samples.get().soc
    }

    fn rail_5v(&self) -> Millivolts {
        self.samples.get().rail_5v
    }

    fn rail_3v3(&self) -> Millivolts {
        self.samples.get().rail_3v3
    }
}
