//! Firmware for the battery/UPS add-on board.
//!
//! # Overview
//!
//! The board sits under a single-board computer and powers its 5V rail from
//! an adapter input, from the host's own supply, or from a Li-ion/LiFePO4
//! battery through a boost converter:
//! - Charges the battery through an I2C charge controller
//! - Switches the boost converter, auxiliary regulator and output switch
//! - Cuts the host off before the battery falls below its cutoff voltage
//! - Power cycles the host when its watchdog expires
//!
//! # Hardware
//!
//! - **MCU**: STM32L031G6U6 (Cortex-M0+, ultra-low-power)
//! - **Charger**: switch-mode Li-ion charger at I2C address 0x6B
//! - **RTC**: 32.768 kHz crystal, keeps time in STOP mode
//!
//! # Low Power Operation
//!
//! - MSI oscillator at 2.1 MHz, enough for 100 kHz I2C
//! - The main loop sleeps between 20 ms dispatch rounds
//! - With no input source and a quiet host it enters STOP mode, woken by the
//!   RTC wakeup timer or any of the EXTI lines
//!
//! # Module Organization
//!
//! - [`hardware`] - Pin mappings and peripheral initialization
//! - [`power`] - STOP mode, RTC wakeup and warm-reset state
//! - [`sampling`] - Analog sampling task
//!
//! The power logic itself lives in the `battery_hat` library so it can be
//! tested on the host; there this binary builds to an empty `main`.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
mod hardware;
#[cfg(target_os = "none")]
mod power;
#[cfg(target_os = "none")]
mod sampling;

#[cfg(not(target_os = "none"))]
fn main() {}

#[cfg(target_os = "none")]
mod firmware {
    use core::sync::atomic::Ordering;

    use embassy_executor::Spawner;
    use embassy_stm32::{
        Config,
        exti::ExtiInput,
        rcc::{LsConfig, LseConfig, mux::ClockMux},
        time::Hertz,
    };
    use embassy_time::Delay;
    use {defmt_rtt as _, panic_probe as _};

    use battery_hat::events::{Event, EventFlags};
    use battery_hat::rails::RailConfig;
    use battery_hat::snapshot::Snapshot;
    use battery_hat::system::{Board, PowerSystem};
    use battery_hat::telemetry::{AnalogSamples, SampledTelemetry};

    use crate::hardware::Peripherals;
    use crate::power::{self, BUTTON_HELD, BoardPlatform};
    use crate::sampling::sampling_task;

    /// Wake-up flags raised by the EXTI tasks and consumed by the main loop.
    static EVENTS: EventFlags = EventFlags::new();

    /// Latest analog readings, written by the sampling task.
    static SAMPLES: Snapshot<AnalogSamples> = Snapshot::new(AnalogSamples::empty());

    /// Creates the clock configuration for STM32L031.
    ///
    /// # Clock Settings
    ///
    /// - **MSI**: 2.1 MHz, 4.2 MHz in debug mode to keep the probe connection up
    /// - **System clock**: MSI (no PLL)
    /// - **LSE**: 32.768 kHz external crystal for RTC
    /// - **Voltage scale**: Range 1
    fn create_low_power_config() -> embassy_stm32::rcc::Config {
        embassy_stm32::rcc::Config {
            #[cfg(feature = "debug-mode")]
            msi: Some(embassy_stm32::rcc::MSIRange::RANGE4M),
            #[cfg(not(feature = "debug-mode"))]
            msi: Some(embassy_stm32::rcc::MSIRange::RANGE2M),
            hsi: false,
            hse: None,
            pll: None,
            sys: embassy_stm32::rcc::Sysclk::MSI,
            ahb_pre: embassy_stm32::rcc::AHBPrescaler::DIV1,
            apb1_pre: embassy_stm32::rcc::APBPrescaler::DIV1,
            apb2_pre: embassy_stm32::rcc::APBPrescaler::DIV1,
            ls: LsConfig {
                rtc: embassy_stm32::rcc::RtcClockSource::LSE,
                lsi: false,
                lse: Some(LseConfig {
                    frequency: Hertz::hz(32768),
                    mode: embassy_stm32::rcc::LseMode::Oscillator(embassy_stm32::rcc::LseDrive::Low),
                }),
            },
            voltage_scale: embassy_stm32::rcc::VoltageScale::RANGE1,
            mux: ClockMux::default(),
        }
    }

    /// Raises `event` on every falling edge of an active-low line.
    #[embassy_executor::task(pool_size = 2)]
    async fn wake_line_task(mut line: ExtiInput<'static>, event: Event) {
        loop {
            line.wait_for_falling_edge().await;
            EVENTS.raise(event);
        }
    }

    /// Tracks the button level and raises a button event on press.
    #[embassy_executor::task]
    async fn button_task(mut button: ExtiInput<'static>) {
        loop {
            button.wait_for_any_edge().await;
            let held = button.is_low();
            BUTTON_HELD.store(held, Ordering::Relaxed);
            if held {
                EVENTS.raise(Event::Button);
            }
        }
    }

    /// Main entry point for the add-on board firmware.
    ///
    /// # Initialization Sequence
    ///
    /// 1. Configure clocks and initialize STM32 peripherals
    /// 2. Read the reset cause and restore warm-reset rail flags
    /// 3. Set up STOP mode and the RTC wakeup interrupt
    /// 4. Initialize pins, sample board straps, open the settings store
    /// 5. Spawn the sampling and wake line tasks
    /// 6. Run the power system loop, saving rail flags after every pass
    #[embassy_executor::main]
    async fn main(spawner: Spawner) {
        let mut config = Config::default();
        config.rcc = create_low_power_config();

        let p = embassy_stm32::init(config);

        #[cfg(feature = "debug-mode")]
        defmt::info!("Battery add-on firmware starting...");

        let cold_boot = power::take_cold_boot();
        let warm = power::load_warm_state(cold_boot);

        #[cfg(feature = "debug-mode")]
        defmt::info!("Reset: cold {}, restored {}", cold_boot, warm);

        power::setup_low_power();

        let peripherals = Peripherals::new(p).await;

        #[cfg(feature = "debug-mode")]
        defmt::info!("Straps: {}", peripherals.straps);

        spawner.must_spawn(sampling_task(peripherals.analog, &SAMPLES));
        spawner.must_spawn(wake_line_task(peripherals.charger_int, Event::ChargerInterrupt));
        spawner.must_spawn(wake_line_task(peripherals.host_wake, Event::IoWake));
        spawner.must_spawn(button_task(peripherals.button));

        let board = Board {
            charger_bus: peripherals.charger_bus,
            store: peripherals.store,
            telemetry: SampledTelemetry::new(&SAMPLES),
            rail_driver: peripherals.rails,
            delay: Delay,
            platform: BoardPlatform::new(),
            straps: peripherals.straps,
            warm,
            rail_config: RailConfig::default(),
        };
        let mut system = PowerSystem::new(board, &EVENTS);

        #[cfg(feature = "debug-mode")]
        defmt::info!("Entering power system loop...");

        loop {
            system.iterate().await;
            power::store_warm_state(system.warm_state());
        }
    }
}
