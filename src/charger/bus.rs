//! Register access to the charge controller.

use embassy_time::with_timeout;
use embedded_hal_async::i2c::I2c;

use crate::config::{CHARGER_I2C_ADDR, CHARGER_TRANSACTION_TIMEOUT};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ChargerError<E> {
    /// The bus reported an error.
    Bus(E),
    /// No completion within the transaction timeout.
    Timeout,
    /// Two consecutive reads of the register disagreed.
    Unstable(u8),
}

impl<E> ChargerError<E> {
    pub const fn describe(&self) -> &'static str {
        match self {
            ChargerError::Bus(_) => "bus error",
            ChargerError::Timeout => "timeout",
            ChargerError::Unstable(_) => "unstable read",
        }
    }
}

/// Single-register access, one transaction per call.
#[allow(async_fn_in_trait)]
pub trait ChargerBus {
    type Error;

    async fn read_register(&mut self, reg: u8) -> Result<u8, ChargerError<Self::Error>>;
    async fn write_register(&mut self, reg: u8, value: u8) -> Result<(), ChargerError<Self::Error>>;
}

/// [`ChargerBus`] over an async I2C master.
pub struct I2cChargerBus<I2C> {
    i2c: I2C,
    addr: u8,
}

impl<I2C: I2c> I2cChargerBus<I2C> {
    pub fn new(i2c: I2C) -> Self {
        Self {
            i2c,
            addr: CHARGER_I2C_ADDR,
        }
    }

    pub fn with_address(i2c: I2C, addr: u8) -> Self {
        Self { i2c, addr }
    }
}

impl<I2C: I2c> ChargerBus for I2cChargerBus<I2C> {
    type Error = I2C::Error;

    async fn read_register(&mut self, reg: u8) -> Result<u8, ChargerError<Self::Error>> {
        let mut buf = [0u8; 1];
        match with_timeout(
            CHARGER_TRANSACTION_TIMEOUT,
            self.i2c.write_read(self.addr, &[reg], &mut buf),
        )
        .await
        {
            Ok(Ok(())) => Ok(buf[0]),
            Ok(Err(e)) => Err(ChargerError::Bus(e)),
            Err(_) => Err(ChargerError::Timeout),
        }
    }

    async fn write_register(&mut self, reg: u8, value: u8) -> Result<(), ChargerError<Self::Error>> {
        match with_timeout(
            CHARGER_TRANSACTION_TIMEOUT,
            self.i2c.write(self.addr, &[reg, value]),
        )
        .await
        {
            Ok(result) => result.map_err(ChargerError::Bus),
            Err(_) => Err(ChargerError::Timeout),
        }
    }
}
