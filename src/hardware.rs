//! Hardware pin mappings for the battery add-on board.
//!
//! # Pin Assignments
//!
//! ## Charger (I2C1, charge controller at 0x6B)
//! - **PB6**: SCL
//! - **PB7**: SDA
//! - **PA7**: CHG_INT_N - Charger status interrupt, active low
//!
//! ## Rail enables
//! - **PA8**: BOOST_EN - Boost converter feeding the host 5V rail
//! - **PA15**: LDO_EN - Auxiliary linear regulator
//! - **PB3**: AUX_EN - Auxiliary output switch
//! - **PB4**: AUX_ILIM - Output switch high current limit select
//!
//! ## Analog inputs
//! - **PA0**: VBAT_SENSE - Battery voltage through a 1:2 divider
//! - **PA1**: V5_SENSE - Host 5V rail through a 1:2 divider
//! - **PA4**: AUX_STRAP - Resistor strap selecting a preset profile
//! - **PA5**: CFG_STRAP - Resistor network encoding charge parameters
//!
//! ## Settings
//! - Last flash page, byte slots with complement check
//!
//! ## Board straps and wake lines
//! - **PB0**, **PB1**: BOARD_ID0/1 - Board variant code, pulled up
//! - **PA2**: BUTTON_N - User button, active low
//! - **PA3**: HOST_WAKE_N - Wake request from the host, active low

use embassy_stm32::adc::{Adc, AdcChannel, AnyAdcChannel, SampleTime};
use embassy_stm32::exti::ExtiInput;
use embassy_stm32::flash::{Blocking, FLASH_SIZE, Flash};
use embassy_stm32::gpio::{Input, Level, Output, Pull, Speed};
use embassy_stm32::i2c::{self, I2c};
use embassy_stm32::mode::Async;
use embassy_stm32::peripherals::ADC1;
use embassy_stm32::time::Hertz;
use embassy_stm32::{bind_interrupts, peripherals};
use embedded_storage::nor_flash::RmwNorFlashStorage;
use static_cell::StaticCell;

use battery_hat::charger::I2cChargerBus;
use battery_hat::profile::StrapReading;
use battery_hat::rails::GpioRails;
use battery_hat::storage::ComplementStore;

bind_interrupts!(pub struct Irqs {
    I2C1 => i2c::EventInterruptHandler<peripherals::I2C1>, i2c::ErrorInterruptHandler<peripherals::I2C1>;
    ADC1_COMP => embassy_stm32::adc::InterruptHandler<peripherals::ADC1>;
});

/// Board variant code read when neither BOARD_ID strap is fitted.
const BOARD_UNSTRAPPED: u8 = 0xFF;

/// Raw ADC codes at or above this read as an unfitted (pulled up) strap.
const STRAP_OPEN_THRESHOLD: u16 = 4000;

/// Flash page size; read-modify-write works on whole pages.
const FLASH_PAGE: usize = 128;

static FLASH_MERGE_BUFFER: StaticCell<[u8; FLASH_PAGE]> = StaticCell::new();

pub type BoardStore = ComplementStore<RmwNorFlashStorage<'static, Flash<'static, Blocking>>>;
pub type BoardRails = GpioRails<Output<'static>, Output<'static>, Output<'static>, Output<'static>>;
pub type BoardI2c = I2cChargerBus<I2c<'static, Async>>;

/// Analog channels left to the sampling task once straps have been read.
pub struct AnalogInputs {
    pub adc: Adc<'static, ADC1>,
    pub battery: AnyAdcChannel<ADC1>,
    pub rail_5v: AnyAdcChannel<ADC1>,
}

/// Every board resource the firmware uses, initialized.
pub struct Peripherals {
    pub charger_bus: BoardI2c,
    pub store: BoardStore,
    pub rails: BoardRails,
    pub charger_int: ExtiInput<'static>,
    pub button: ExtiInput<'static>,
    pub host_wake: ExtiInput<'static>,
    pub analog: AnalogInputs,
    pub straps: StrapReading,
}

impl Peripherals {
    /// Initializes all peripherals from the embassy-stm32 singleton and
    /// samples the board straps.
    ///
    /// Rail enables start low: boost, regulator and output switch off until
    /// the rail controller decides otherwise.
    pub async fn new(p: embassy_stm32::Peripherals) -> Self {
        let mut i2c_cfg = i2c::Config::default();
        i2c_cfg.frequency = Hertz::khz(100);
        let i2c = I2c::new(p.I2C1, p.PB6, p.PB7, Irqs, p.DMA1_CH2, p.DMA1_CH3, i2c_cfg);

        let flash = RmwNorFlashStorage::new(
            Flash::new_blocking(p.FLASH),
            FLASH_MERGE_BUFFER.init([0; FLASH_PAGE]),
        );
        let store = ComplementStore::new(flash, (FLASH_SIZE - FLASH_PAGE) as u32);

        let rails = GpioRails::new(
            Output::new(p.PA8, Level::Low, Speed::Low),
            Output::new(p.PA15, Level::Low, Speed::Low),
            Output::new(p.PB3, Level::Low, Speed::Low),
            Output::new(p.PB4, Level::Low, Speed::Low),
        );

        let board_code = {
            let id0 = Input::new(p.PB0, Pull::Up);
            let id1 = Input::new(p.PB1, Pull::Up);
            board_code(id0.is_high(), id1.is_high())
        };

        let mut adc = Adc::new(p.ADC1, Irqs);
        adc.set_sample_time(SampleTime::CYCLES160_5);
        let mut aux_strap = p.PA4.degrade_adc();
        let mut cfg_strap = p.PA5.degrade_adc();
        let aux_raw = adc.read(&mut aux_strap).await;
        let cfg_raw = adc.read(&mut cfg_strap).await;

        let straps = StrapReading {
            board_code,
            aux_strap: strap_code(aux_raw, 16),
            config_code: strap_code(cfg_raw, 64),
        };

        Self {
            charger_bus: I2cChargerBus::new(i2c),
            store,
            rails,
            charger_int: ExtiInput::new(p.PA7, p.EXTI7, Pull::Up),
            button: ExtiInput::new(p.PA2, p.EXTI2, Pull::Up),
            host_wake: ExtiInput::new(p.PA3, p.EXTI3, Pull::Up),
            analog: AnalogInputs {
                adc,
                battery: p.PA0.degrade_adc(),
                rail_5v: p.PA1.degrade_adc(),
            },
            straps,
        }
    }
}

/// Both ID straps open means the board carries no fixed preset.
fn board_code(id0_high: bool, id1_high: bool) -> u8 {
    match (id1_high, id0_high) {
        (true, true) => BOARD_UNSTRAPPED,
        (id1, id0) => (u8::from(id1) << 1) | u8::from(id0),
    }
}

/// Quantizes a resistor strap reading into one of `bands` codes.
fn strap_code(raw: u16, bands: u16) -> Option<u8> {
    if raw >= STRAP_OPEN_THRESHOLD {
        return None;
    }
    Some((u32::from(raw) * u32::from(bands) / u32::from(STRAP_OPEN_THRESHOLD)) as u8)
}
