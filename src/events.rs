//! Event flags raised from interrupt context and drained by the scheduler.

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use portable_atomic::{AtomicU8, Ordering};

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Event {
    /// Charger INT line pulsed.
    ChargerInterrupt = 1 << 0,
    /// A host bus transaction addressed to the board completed.
    HostCommand = 1 << 1,
    Button = 1 << 2,
    RtcAlarm = 1 << 3,
    /// Wake from the IO expansion pin.
    IoWake = 1 << 4,
}

/// Pending-event bitmap plus a wake signal for the idle wait.
pub struct EventFlags {
    pending: AtomicU8,
    wake: Signal<CriticalSectionRawMutex, ()>,
}

impl EventFlags {
    pub const fn new() -> Self {
        Self {
            pending: AtomicU8::new(0),
            wake: Signal::new(),
        }
    }

    /// Safe to call from interrupt handlers.
    pub fn raise(&self, event: Event) {
        self.pending.fetch_or(event as u8, Ordering::AcqRel);
        self.wake.signal(());
    }

    /// Clears `event` and returns whether it was pending.
    pub fn take(&self, event: Event) -> bool {
        let bit = event as u8;
        self.pending.fetch_and(!bit, Ordering::AcqRel) & bit != 0
    }

    pub fn is_pending(&self, event: Event) -> bool {
        self.pending.load(Ordering::Acquire) & event as u8 != 0
    }

    pub fn any_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire) != 0
    }

    /// Forgets a stale wake-up. Call before checking `any_pending`, then wait.
    pub fn rearm(&self) {
        self.wake.reset();
    }

    /// Resolves once any event is raised after the last `rearm`.
    pub async fn wait(&self) {
        self.wake.wait().await
    }
}

impl Default for EventFlags {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embassy_futures::block_on;

    #[test]
    fn take_clears_only_its_bit() {
        let flags = EventFlags::new();
        flags.raise(Event::ChargerInterrupt);
        flags.raise(Event::Button);
        assert!(flags.take(Event::ChargerInterrupt));
        assert!(!flags.take(Event::ChargerInterrupt));
        assert!(flags.is_pending(Event::Button));
        assert!(flags.any_pending());
    }

    #[test]
    fn raise_wakes_waiter() {
        let flags = EventFlags::new();
        flags.rearm();
        flags.raise(Event::RtcAlarm);
        block_on(flags.wait());
        assert!(flags.take(Event::RtcAlarm));
        assert!(!flags.any_pending());
    }
}
