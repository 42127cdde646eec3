//! Power-delivery and charge-control core for a battery/UPS add-on board.
//!
//! # Overview
//!
//! The board sits between a single-board computer and three power sources:
//! an external adapter input, the host-supplied 5V rail and a Li-ion/LiFePO4
//! battery. This crate holds the hardware-agnostic part of the firmware:
//!
//! - [`profile`] - owns the single active battery profile and its persisted form
//! - [`charger`] - keeps the charge-management IC's register set in sync with policy
//! - [`rails`] - boost converter, auxiliary regulator and output switch control,
//!   host-rail detection and undervoltage shutdown
//! - [`scheduler`] - the cooperative loop deciding when the MCU may sleep
//! - [`system`] - wires the four together around the board's collaborators
//!
//! Everything that touches STM32 peripherals lives in the firmware binary; this
//! library only talks to the hardware through the traits in [`charger::bus`],
//! [`rails::driver`], [`storage`], [`telemetry`] and [`scheduler::Platform`], so
//! it builds and tests on a development host.

#![cfg_attr(not(test), no_std)]

// must stay first so the logging macros are visible to every module below
mod fmt;

pub mod charger;
pub mod config;
pub mod events;
pub mod profile;
pub mod rails;
pub mod scheduler;
pub mod snapshot;
pub mod storage;
pub mod system;
pub mod telemetry;
pub mod units;

#[cfg(test)]
mod testing;
