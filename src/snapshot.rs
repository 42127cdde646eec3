//! Single-writer value cells that interrupt handlers and the host interface
//! can read without tearing.

use core::cell::Cell;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;

/// A copyable value published by one owner and read by anyone.
///
/// The owner replaces the whole value inside a critical section, so readers
/// always see one consistent version.
pub struct Snapshot<T: Copy> {
    cell: Mutex<CriticalSectionRawMutex, Cell<T>>,
}

impl<T: Copy> Snapshot<T> {
    pub const fn new(value: T) -> Self {
        Self {
            cell: Mutex::new(Cell::new(value)),
        }
    }

    pub fn get(&self) -> T {
        self.cell.lock(|c| c.get())
    }

    /// Replaces the value and reports whether it differed.
    pub fn publish(&self, value: T) -> bool
    where
        T: PartialEq,
    {
        self.cell.lock(|c| {
            let changed = c.get() != value;
            c.set(value);
            changed
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_reports_change() {
        let snap = Snapshot::new(3u8);
        assert!(!snap.publish(3));
        assert!(snap.publish(4));
        assert_eq!(snap.get(), 4);
    }
}
