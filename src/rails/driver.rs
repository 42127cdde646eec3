//! Rail enable outputs.

use embedded_hal::digital::OutputPin;

use super::AuxSwitchLimit;

/// Drives the rail enable lines. Implementations only switch outputs; the
/// sequencing rules live in [`PowerRailController`](super::PowerRailController).
pub trait RailDriver {
    fn set_boost(&mut self, enable: bool);
    fn set_aux_regulator(&mut self, enable: bool);
    fn set_aux_switch(&mut self, limit: AuxSwitchLimit);
}

/// [`RailDriver`] on four GPIO outputs.
///
/// `switch_enable` turns the output switch on, `switch_select` picks the high
/// current limit when set.
pub struct GpioRails<B, L, E, S> {
    boost_enable: B,
    regulator_enable: L,
    switch_enable: E,
    switch_select: S,
}

impl<B, L, E, S> GpioRails<B, L, E, S>
where
    B: OutputPin,
    L: OutputPin,
    E: OutputPin,
    S: OutputPin,
{
    pub fn new(boost_enable: B, regulator_enable: L, switch_enable: E, switch_select: S) -> Self {
        let mut rails = Self {
            boost_enable,
            regulator_enable,
            switch_enable,
            switch_select,
        };
        rails.set_aux_switch(AuxSwitchLimit::Disabled);
        rails.set_aux_regulator(false);
        rails.set_boost(false);
        rails
    }
}

fn drive(pin: &mut impl OutputPin, high: bool) {
    // GPIO writes on this MCU cannot fail
    let _ = if high { pin.set_high() } else { pin.set_low() };
}

impl<B, L, E, S> RailDriver for GpioRails<B, L, E, S>
where
    B: OutputPin,
    L: OutputPin,
    E: OutputPin,
    S: OutputPin,
{
    fn set_boost(&mut self, enable: bool) {
        drive(&mut self.boost_enable, enable);
    }

    fn set_aux_regulator(&mut self, enable: bool) {
        drive(&mut self.regulator_enable, enable);
    }

    fn set_aux_switch(&mut self, limit: AuxSwitchLimit) {
        match limit {
            AuxSwitchLimit::Disabled => drive(&mut self.switch_enable, false),
            AuxSwitchLimit::Low | AuxSwitchLimit::High => {
                drive(&mut self.switch_select, limit == AuxSwitchLimit::High);
                drive(&mut self.switch_enable, true);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::convert::Infallible;
    use std::cell::Cell;
    use std::rc::Rc;

    #[derive(Clone)]
    struct Pin(Rc<Cell<bool>>);

    impl embedded_hal::digital::ErrorType for Pin {
        type Error = Infallible;
    }

    impl OutputPin for Pin {
        fn set_low(&mut self) -> Result<(), Self::Error> {
            self.0.set(false);
            Ok(())
        }

        fn set_high(&mut self) -> Result<(), Self::Error> {
            self.0.set(true);
            Ok(())
        }
    }

    fn pin(level: bool) -> (Pin, Rc<Cell<bool>>) {
        let cell = Rc::new(Cell::new(level));
        (Pin(cell.clone()), cell)
    }

    #[test]
    fn starts_with_everything_off() {
        let (b, boost) = pin(true);
        let (l, regulator) = pin(true);
        let (e, switch) = pin(true);
        let (s, _) = pin(false);
        let _rails = GpioRails::new(b, l, e, s);
        assert!(!boost.get());
        assert!(!regulator.get());
        assert!(!switch.get());
    }

    #[test]
    fn switch_limit_selects_line() {
        let (b, _) = pin(false);
        let (l, _) = pin(false);
        let (e, enable) = pin(false);
        let (s, select) = pin(false);
        let mut rails = GpioRails::new(b, l, e, s);

        rails.set_aux_switch(AuxSwitchLimit::High);
        assert!(enable.get() && select.get());
        rails.set_aux_switch(AuxSwitchLimit::Low);
        assert!(enable.get() && !select.get());
        rails.set_aux_switch(AuxSwitchLimit::Disabled);
        assert!(!enable.get());
    }
}
