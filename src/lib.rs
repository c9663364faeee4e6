//! A device-mode USB driver for OTG full-speed peripherals
//!
//! `otgfs-usbd` moves USB packets between the OTG controller's shared FIFO
//! RAM and per-endpoint transfer sources: linear buffers, or the circular
//! byte queues of the surrounding kernel. The lengthy FIFO work runs on a
//! dedicated pump task supplied by the integrating kernel, so the interrupt
//! handler stays short and never blocks.
//!
//! To interface the library, you must define safe implementations of
//! [`Peripherals`] (the register block) and [`Kernel`] (critical sections
//! and task suspend / resume). See [`UsbBus`] for the run-time API: spawn a
//! task that calls [`UsbBus::pump`], route the OTG interrupt vector to
//! [`UsbBus::interrupt`], and schedule transfers from your protocol layer.

#![no_std]

#[cfg(test)]
extern crate std;

#[macro_use]
mod log;

mod bus;
mod driver;
mod endpoint;
mod fifo;
pub mod queue;
mod ral;

pub use bus::UsbBus;
pub use driver::Speed;
pub use endpoint::{EndpointCallback, EndpointConfig, EndpointStatus, UsbConfig};

/// Four bidirectional endpoints, endpoint 0 included.
pub const NUM_ENDPOINTS: usize = 4;

/// A type that owns the OTG register block
///
/// # Safety
///
/// `Peripherals` should only be implemented on a type that owns the OTG
/// core's register region. The pointer returned by [`base`](Peripherals::base)
/// is assumed to be valid, and will be cast to a register definition. The
/// FIFO constants must match the silicon; oversized values let endpoint
/// configuration place FIFO regions outside the shared RAM.
///
/// # Example
///
/// ```
/// use otgfs_usbd::Peripherals;
///
/// struct Otg;
///
/// unsafe impl Peripherals for Otg {
///     fn base(&self) -> *const () {
///         0x5000_0000 as *const ()
///     }
/// }
///
/// assert_eq!(Otg.base(), 0x5000_0000 as *const ());
/// ```
pub unsafe trait Peripherals {
    /// Returns the address of the OTG register block for this peripheral
    /// instance.
    fn base(&self) -> *const ();

    /// Depth of the shared FIFO RAM, in 32-bit words.
    const FIFO_DEPTH_WORDS: u32 = 320;

    /// Words at the bottom of the FIFO RAM reserved for the shared receive
    /// FIFO. Transmit FIFO regions are allocated above this boundary.
    const RX_FIFO_WORDS: u32 = 128;
}

/// Kernel services consumed by the driver
///
/// The driver shares state between its interrupt handler and the pump task,
/// and parks the pump task when there is no FIFO work left. Both patterns
/// map onto four primitives every small RTOS has.
///
/// # Safety
///
/// `critical` must provide mutual exclusion against both interrupts and
/// other tasks on the core the peripheral interrupts, and it must support
/// nesting. The wake primitives must implement one-shot token semantics:
/// a `resume_task` posted before `suspend_current_task` makes the suspend
/// return immediately, and one wake resumes at most one suspension.
/// `resume_task` must be callable from interrupt context and from within
/// `critical`. Spurious wake-ups are tolerated; lost wake-ups are not.
pub unsafe trait Kernel {
    /// Handle identifying a task to resume.
    type Task: Copy;

    /// Runs `f` with interrupts and preemption held off. Short and
    /// non-blocking; never called around FIFO data movement.
    fn critical<R>(f: impl FnOnce() -> R) -> R;

    /// Handle of the calling task.
    fn current_task() -> Self::Task;

    /// Suspends the calling task until a wake is posted for it. Returns
    /// immediately if one is already pending.
    fn suspend_current_task();

    /// Posts a one-shot wake for `task`.
    fn resume_task(task: Self::Task);

    /// Busy-waits for roughly `cycles` CPU cycles. Used for the short PHY
    /// clock delays in the reset and FIFO flush sequences.
    fn polled_delay(cycles: u32) {
        cortex_m::asm::delay(cycles);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::Kernel;
    use core::cell::Cell;

    std::thread_local! {
        static WAKES: Cell<usize> = const { Cell::new(0) };
    }

    /// Kernel double: critical sections run inline, wake-ups are counted.
    pub struct TestKernel;

    unsafe impl Kernel for TestKernel {
        type Task = u8;
        fn critical<R>(f: impl FnOnce() -> R) -> R {
            f()
        }
        fn current_task() -> u8 {
            7
        }
        fn suspend_current_task() {}
        fn resume_task(_: u8) {
            WAKES.with(|w| w.set(w.get() + 1));
        }
        fn polled_delay(_: u32) {}
    }

    pub fn wake_count() -> usize {
        WAKES.with(|w| w.get())
    }
}
