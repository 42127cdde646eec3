//! Low power support for the add-on board.
//!
//! The embassy time driver runs from a timer that stops in STOP mode, so the
//! main loop measures deep sleep with the RTC instead. This module owns
//! everything that touches the PWR, RTC and RCC blocks directly:
//!
//! - [`BoardPlatform`], the [`Platform`] the power system runs on
//! - the RTC wakeup timer that bounds a deep sleep
//! - reset cause and the warm-reset words kept in `.uninit` RAM

use core::cell::Cell;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicBool, Ordering};

use embassy_futures::select::select;
use embassy_stm32::pac;
use embassy_sync::{blocking_mutex::raw::CriticalSectionRawMutex, signal::Signal};
use embassy_time::{Duration, Instant, Timer};
use pac::interrupt;

use battery_hat::events::EventFlags;
use battery_hat::rails::WarmState;
use battery_hat::scheduler::{Platform, RunState};

/// EXTI line of the RTC wakeup timer on STM32L0.
const RTC_WAKEUP_EXTI_LINE: usize = 20;

/// EXTI lines 0-31 are in the first register set.
const EXTI_REG_IDX: usize = 0;

/// The wakeup timer counts RTCCLK/16, 2048 ticks per second with the LSE.
const WAKEUP_TICKS_PER_SEC: u64 = 32_768 / 16;

/// Signalled from the RTC interrupt when a deep sleep times out.
static RTC_WAKE: Signal<CriticalSectionRawMutex, ()> = Signal::new();

/// Cleared while the main loop is in deep sleep.
pub static SAMPLING_ENABLED: AtomicBool = AtomicBool::new(true);

/// Whether the user button is currently held, kept by the button task.
pub static BUTTON_HELD: AtomicBool = AtomicBool::new(false);

#[unsafe(link_section = ".uninit.WARM_STATE")]
static mut WARM_WORDS: MaybeUninit<[u32; 2]> = MaybeUninit::uninit();

/// True after a power-on or brown-out reset. Clears the reset flags.
pub fn take_cold_boot() -> bool {
    let rcc = pac::RCC;
    let csr = rcc.csr().read();
    let cold = csr.porrstf();
    rcc.csr().modify(|w| w.set_rmvf(true));
    cold
}

/// Rail flags carried over from before the last reset.
pub fn load_warm_state(cold_boot: bool) -> WarmState {
    // SAFETY: single-threaded startup; the words are plain integers, so any
    // bit pattern left in RAM is a valid value and is checked by `restore`.
    let words = unsafe { (&raw const WARM_WORDS).cast::<[u32; 2]>().read_volatile() };
    WarmState::restore(words, cold_boot)
}

pub fn store_warm_state(state: WarmState) {
    // SAFETY: only the main loop writes these words.
    unsafe { (&raw mut WARM_WORDS).cast::<[u32; 2]>().write_volatile(state.encode()) };
}

/// RTC wakeup interrupt. Clears the flags and wakes the main loop.
#[interrupt]
fn RTC() {
    let rtc = pac::RTC;
    rtc.isr().modify(|w| w.set_wutf(false));
    pac::EXTI
        .pr(EXTI_REG_IDX)
        .write(|w| w.set_line(RTC_WAKEUP_EXTI_LINE, true));
    RTC_WAKE.signal(());
}

/// Configures the RTC wakeup timer interrupt and STOP mode regulator.
///
/// The RTC itself is clocked from the LSE by the embassy RCC setup.
pub fn setup_low_power() {
    let exti = pac::EXTI;

    pac::RCC.apb1enr().modify(|w| w.set_pwren(true));
    // Low power regulator in STOP, and STOP rather than STANDBY on deep sleep
    pac::PWR.cr().modify(|w| {
        w.set_lpsdsr(pac::pwr::vals::Mode::LOW_POWER_MODE);
        w.set_pdds(pac::pwr::vals::Pdds::STOP_MODE);
        w.set_ulp(true);
    });

    exti.imr(EXTI_REG_IDX)
        .modify(|w| w.set_line(RTC_WAKEUP_EXTI_LINE, true));
    exti.rtsr(EXTI_REG_IDX)
        .modify(|w| w.set_line(RTC_WAKEUP_EXTI_LINE, true));

    unsafe {
        cortex_m::peripheral::NVIC::unmask(embassy_stm32::interrupt::RTC);
    };
}

fn with_rtc_unlocked(f: impl FnOnce(pac::rtc::Rtc)) {
    let rtc = pac::RTC;
    pac::PWR.cr().modify(|w| w.set_dbp(true));
    rtc.wpr().write(|w| w.set_key(0xCA));
    rtc.wpr().write(|w| w.set_key(0x53));
    f(rtc);
    rtc.wpr().write(|w| w.set_key(0xFF));
}

fn arm_wakeup(after: Duration) {
    let ticks = (after.as_millis() * WAKEUP_TICKS_PER_SEC / 1000).clamp(1, 0xFFFF) as u16;
    with_rtc_unlocked(|rtc| {
        rtc.cr().modify(|w| w.set_wute(false));
        while !rtc.isr().read().wutwf() {}
        rtc.wutr().write(|w| w.set_wut(ticks));
        rtc.isr().modify(|w| w.set_wutf(false));
        rtc.cr().modify(|w| {
            w.set_wucksel(pac::rtc::vals::Wucksel::DIV16);
            w.set_wutie(true);
            w.set_wute(true);
        });
    });
}

fn disarm_wakeup() {
    with_rtc_unlocked(|rtc| {
        rtc.cr().modify(|w| {
            w.set_wute(false);
            w.set_wutie(false);
        });
    });
}

/// Milliseconds since midnight from the RTC calendar.
fn rtc_time_of_day_ms() -> u64 {
    let rtc = pac::RTC;
    // Reading SSR locks TR until DR is read
    let ssr = u64::from(rtc.ssr().read().ss());
    let tr = rtc.tr().read();
    let _ = rtc.dr().read();
    let prediv_s = u64::from(rtc.prer().read().prediv_s());

    let hours = u64::from(tr.ht() * 10 + tr.hu());
    let minutes = u64::from(tr.mnt() * 10 + tr.mnu());
    let seconds = u64::from(tr.st() * 10 + tr.su());
    let sub_ms = (prediv_s - ssr.min(prediv_s)) * 1000 / (prediv_s + 1);

    ((hours * 60 + minutes) * 60 + seconds) * 1000 + sub_ms
}

const DAY_MS: u64 = 24 * 60 * 60 * 1000;

/// [`Platform`] on the STM32L0 with RTC-measured deep sleep.
pub struct BoardPlatform {
    rtc_last: Cell<u64>,
    rtc_total: Cell<u64>,
}

impl BoardPlatform {
    pub fn new() -> Self {
        Self {
            rtc_last: Cell::new(rtc_time_of_day_ms()),
            rtc_total: Cell::new(0),
        }
    }
}

impl Platform for BoardPlatform {
    fn now(&self) -> Instant {
        Instant::now()
    }

    /// Free-running RTC milliseconds, extended across midnight.
    fn rtc_millis(&self) -> u64 {
        let tod = rtc_time_of_day_ms();
        let delta = (tod + DAY_MS - self.rtc_last.get()) % DAY_MS;
        self.rtc_last.set(tod);
        self.rtc_total.set(self.rtc_total.get() + delta);
        self.rtc_total.get()
    }

    fn button_held(&self) -> bool {
        BUTTON_HELD.load(Ordering::Relaxed)
    }

    fn pause_sampling(&mut self) {
        SAMPLING_ENABLED.store(false, Ordering::Relaxed);
    }

    fn resume_sampling(&mut self) {
        SAMPLING_ENABLED.store(true, Ordering::Relaxed);
    }

    async fn idle(&mut self, depth: RunState, max: Duration, events: &EventFlags) {
        match depth {
            RunState::Normal => {}
            RunState::Sleep => {
                select(events.wait(), Timer::after(max)).await;
            }
            RunState::LowPower => {
                RTC_WAKE.reset();
                arm_wakeup(max);
                // SAFETY: SCB is only touched here, from the main loop.
                let mut scb = unsafe { cortex_m::Peripherals::steal() }.SCB;
                scb.set_sleepdeep();
                select(events.wait(), RTC_WAKE.wait()).await;
                scb.clear_sleepdeep();
                disarm_wakeup();
            }
        }
    }
}
