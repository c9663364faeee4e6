//! USB bus front end
//!
//! [`UsbBus`] owns the driver state and splits it between the two execution
//! contexts: the interrupt handler enters through [`interrupt`](UsbBus::interrupt),
//! the pump task lives in [`pump`](UsbBus::pump), and the protocol layer
//! schedules transfers from either callbacks or its own tasks. Every touch
//! of the shared state happens inside the kernel's critical section; the
//! lengthy FIFO moves and the upward callbacks run outside it.

use core::cell::RefCell;

use crate::driver::{Driver, Speed};
use crate::endpoint::{EndpointCallback, EndpointConfig, EndpointStatus, RxSink, TxSource, UsbConfig};
use crate::queue::{ReceiveQueue, TransmitQueue};
use crate::{ral, Kernel, Peripherals, NUM_ENDPOINTS};
use usb_device::{endpoint::EndpointAddress, UsbError};

/// A device-mode USB bus over one OTG full-speed peripheral.
///
/// Place the bus in a `static`, route the OTG interrupt vector to
/// [`interrupt`](UsbBus::interrupt), and dedicate a low-urgency kernel task
/// to [`pump`](UsbBus::pump).
pub struct UsbBus<K: Kernel> {
    driver: RefCell<Driver<K>>,
    config: &'static UsbConfig,
}

// Safety: the inner driver is only ever borrowed inside `K::critical`,
// which excludes interrupts and other tasks, and never across a
// suspension point.
unsafe impl<K: Kernel> Sync for UsbBus<K> {}

impl<K: Kernel> UsbBus<K> {
    /// Creates the bus over `peripherals`. Creation only assigns state;
    /// call [`start`](UsbBus::start) to bring the peripheral up.
    pub fn new<P: Peripherals>(peripherals: P, config: &'static UsbConfig) -> Self {
        let otg = ral::instance(peripherals);
        UsbBus {
            driver: RefCell::new(Driver::new(
                otg,
                P::RX_FIFO_WORDS,
                P::FIFO_DEPTH_WORDS,
                config,
            )),
            config,
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut Driver<K>) -> R) -> R {
        K::critical(|| f(&mut self.driver.borrow_mut()))
    }

    /// Configures and activates the peripheral. The pump task must already
    /// be running (or about to run); it parks itself until there is work.
    pub fn start(&self) {
        self.with(|d| d.start());
    }

    /// Deactivates the peripheral. The pump task parks on its next pass.
    pub fn stop(&self) {
        self.with(|d| d.stop());
    }

    /// Programs the device address assigned by the host.
    pub fn set_address(&self, address: u8) {
        self.with(|d| d.set_address(address));
    }

    /// Activates (or deactivates) both directions of endpoint `ep` from a
    /// descriptor. Endpoint 0 is configured automatically at bus reset.
    pub fn init_endpoint(&self, ep: u8, config: &'static EndpointConfig) -> Result<(), UsbError> {
        self.with(|d| d.init_endpoint(usize::from(ep), config))
    }

    /// Disables every endpoint except the control endpoint and reclaims
    /// their FIFO regions. Used on bus reset and configuration changes.
    pub fn disable_endpoints(&self) {
        self.with(|d| d.disable_endpoints());
    }

    /// The last SETUP packet received on `ep`.
    ///
    /// # Panics
    ///
    /// Panics if `ep` is out of range.
    pub fn setup_packet(&self, ep: u8) -> [u8; 8] {
        self.with(|d| d.setup_packet(usize::from(ep)))
    }

    /// Bytes accumulated by the current (or just finished) OUT transfer.
    ///
    /// # Panics
    ///
    /// Panics if `ep` is out of range.
    pub fn received_count(&self, ep: u8) -> usize {
        self.with(|d| d.received_count(usize::from(ep)))
    }

    /// Bus speed negotiated at enumeration.
    pub fn speed(&self) -> Speed {
        self.with(|d| d.speed())
    }

    pub fn endpoint_status(&self, addr: EndpointAddress) -> EndpointStatus {
        self.with(|d| d.endpoint_status(addr))
    }

    pub fn set_stalled(&self, addr: EndpointAddress, stall: bool) {
        self.with(|d| d.set_stalled(addr, stall));
    }

    pub fn is_stalled(&self, addr: EndpointAddress) -> bool {
        self.with(|d| d.is_stalled(addr))
    }

    /// Schedules an IN transfer of `len` bytes from a linear buffer.
    ///
    /// # Safety
    ///
    /// `buffer` must stay valid, and must not be written, until the
    /// endpoint's completion callback runs or the device is reset or
    /// stopped.
    pub unsafe fn start_transmit(
        &self,
        ep: u8,
        buffer: *const u8,
        len: usize,
    ) -> Result<(), UsbError> {
        self.with(|d| {
            d.start_transmit(
                usize::from(ep),
                TxSource::Buffer {
                    ptr: buffer,
                },
                len,
            )
        })
    }

    /// Schedules an IN transfer of `len` bytes sourced from a circular
    /// queue. The queue must already hold `len` bytes.
    pub fn start_transmit_queued(
        &self,
        ep: u8,
        queue: &'static dyn TransmitQueue,
        len: usize,
    ) -> Result<(), UsbError> {
        self.with(|d| d.start_transmit(usize::from(ep), TxSource::Queue(queue), len))
    }

    /// Schedules an OUT transfer of up to `len` bytes into a linear buffer.
    ///
    /// # Safety
    ///
    /// `buffer` must stay valid for `len` bytes, unused by anyone else,
    /// until the endpoint's completion callback runs or the device is
    /// reset or stopped.
    pub unsafe fn start_receive(
        &self,
        ep: u8,
        buffer: *mut u8,
        len: usize,
    ) -> Result<(), UsbError> {
        self.with(|d| {
            d.start_receive(
                usize::from(ep),
                RxSink::Buffer {
                    ptr: buffer,
                },
                len,
            )
        })
    }

    /// Schedules an OUT transfer of up to `len` bytes into a circular
    /// queue. The queue must have `len` bytes of room.
    pub fn start_receive_queued(
        &self,
        ep: u8,
        queue: &'static dyn ReceiveQueue,
        len: usize,
    ) -> Result<(), UsbError> {
        self.with(|d| d.start_receive(usize::from(ep), RxSink::Queue(queue), len))
    }

    fn invoke(&self, ep: u8, pick: fn(&EndpointConfig) -> Option<EndpointCallback>) {
        let cb = self.with(|d| d.epc[usize::from(ep)].and_then(pick));
        if let Some(cb) = cb {
            cb(ep);
        }
    }

    /// Interrupt service entry. Route the OTG peripheral's vector here.
    ///
    /// State mutation happens under the critical section; the upward
    /// callbacks run after it, still in interrupt context, and may schedule
    /// follow-up transfers.
    pub fn interrupt(&self) {
        let pending = self.with(|d| d.isr());

        if pending.reset {
            if let Some(on_reset) = self.config.on_reset {
                on_reset();
            }
        }
        if pending.sof {
            if let Some(on_sof) = self.config.on_sof {
                on_sof();
            }
        }
        for ep in 0..NUM_ENDPOINTS as u8 {
            let bit = 1 << ep;
            if pending.setup & bit != 0 {
                self.invoke(ep, |c| c.setup_cb);
            }
            if pending.in_complete & bit != 0 {
                self.invoke(ep, |c| c.in_cb);
            }
            if pending.out_complete & bit != 0 {
                self.invoke(ep, |c| c.out_cb);
            }
        }
    }

    /// The pump task body. Dedicate a kernel task to it; it parks itself
    /// whenever the device is stopped or there is no FIFO work, and the
    /// interrupt handler wakes it back up.
    pub fn pump(&self) -> ! {
        loop {
            let parked = K::critical(|| {
                let mut driver = self.driver.borrow_mut();
                if driver.is_stopped() || (driver.txpending == 0 && !driver.rx_pending()) {
                    // Nothing to do: let the receive interrupt fire again
                    // and wait for it.
                    driver.unmask_rxflvl();
                    driver.thd_wait = Some(K::current_task());
                    true
                } else {
                    false
                }
            });
            if parked {
                K::suspend_current_task();
                continue;
            }
            self.pump_pass();
        }
    }

    /// One full service pass: drain all queued receive reports, then fill
    /// every endpoint with pending transmit work.
    fn pump_pass(&self) {
        // The receive drain moves one packet per critical section; the
        // receive interrupt stays masked the whole time.
        while self.with(|d| {
            if d.rx_pending() {
                let fifo = d.rx_fifo();
                d.rxfifo_dispatch(&fifo);
                true
            } else {
                false
            }
        }) {}

        for ep in 0..NUM_ENDPOINTS {
            // The claim takes the controller's interrupt gate, so nothing
            // can start a FIFO sequence on another endpoint until the fill
            // is checked back in.
            if let Some((mut fill, guard)) = self.with(|d| d.claim_tx(ep)) {
                let fifo = fill.fifo();
                let status = fill.run(&fifo);
                self.with(|d| d.finish_tx(fill, guard, status));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::InEvents;
    use crate::endpoint::TxTransfer;
    use crate::testing::TestKernel;
    use core::sync::atomic::{AtomicUsize, Ordering};
    use std::vec::Vec;
    use usb_device::endpoint::EndpointType;

    struct TestPeripherals(*const ());

    unsafe impl Peripherals for TestPeripherals {
        fn base(&self) -> *const () {
            self.0
        }
    }

    fn noop(_: u8) {}

    static IN_DONE: AtomicUsize = AtomicUsize::new(0);

    fn record_in(ep: u8) {
        assert_eq!(ep, 1);
        IN_DONE.fetch_add(1, Ordering::SeqCst);
    }

    static CONFIG: UsbConfig = UsbConfig {
        on_reset: None,
        on_sof: None,
        ep0: EndpointConfig {
            kind: EndpointType::Control,
            setup_cb: Some(noop),
            in_cb: Some(noop),
            out_cb: Some(noop),
            in_max_packet: 64,
            out_max_packet: 64,
            in_multiplier: 1,
        },
    };

    static EP1_BULK_IN: EndpointConfig = EndpointConfig {
        kind: EndpointType::Bulk,
        setup_cb: None,
        in_cb: Some(record_in),
        out_cb: None,
        in_max_packet: 64,
        out_max_packet: 64,
        in_multiplier: 1,
    };

    fn bus() -> UsbBus<TestKernel> {
        UsbBus::new(TestPeripherals(ral::testing::base()), &CONFIG)
    }

    fn pattern(n: usize) -> Vec<u8> {
        (0..n).map(|i| (i * 3 + 11) as u8).collect()
    }

    #[test]
    fn bulk_in_transfer_end_to_end() {
        let bus = bus();
        let src = pattern(130);

        // Endpoint 1 active, FIFO space unlimited, interrupts enabled as
        // after start().
        bus.with(|d| {
            d.epc[1] = Some(&EP1_BULK_IN);
            ral::modify_reg!(ral::otg, d.otg_for_test(), GAHBCFG, GINT: 1);
            let ie = ral::diep::register(d.otg_for_test(), 1);
            ral::write_reg!(ral::diep, &ie, DTXFSTS, 0xFFFF);
        });

        unsafe { bus.start_transmit(1, src.as_ptr(), 130) }.unwrap();

        // The FIFO-empty interrupt marks the endpoint pending.
        bus.with(|d| {
            let otg = d.otg_for_test();
            ral::write_reg!(ral::otg, otg, GINTMSK, IEPM: 1);
            ral::write_reg!(ral::otg, otg, GINTSTS, IEPINT: 1);
            ral::write_reg!(ral::otg, otg, DAINT, 1 << 1);
            let ie = ral::diep::register(otg, 1);
            ral::write_reg!(ral::diep, &ie, DIEPINT, InEvents::TXFE.bits());
            ral::write_reg!(ral::otg, otg, DIEPEMPMSK, 1 << 1);
        });
        bus.interrupt();
        assert_eq!(bus.with(|d| d.txpending), 1 << 1);

        // The pump pass pushes the whole transfer.
        bus.pump_pass();
        bus.with(|d| {
            assert_eq!(d.ep_in[1].count, 130);
            assert!(d.ep_in[1].is_complete());
            let otg = d.otg_for_test();
            // Gate restored, no re-arm needed.
            assert_eq!(ral::read_reg!(ral::otg, otg, GAHBCFG, GINT), 1);
            assert_eq!(ral::read_reg!(ral::otg, otg, DIEPEMPMSK), 0);
        });
        assert_eq!(IN_DONE.load(Ordering::SeqCst), 0);

        // Transfer-complete interrupt invokes the upward callback.
        bus.with(|d| {
            let otg = d.otg_for_test();
            ral::write_reg!(ral::otg, otg, GINTSTS, IEPINT: 1);
            ral::write_reg!(ral::otg, otg, DAINT, 1 << 1);
            ral::write_reg!(ral::otg, otg, DIEPMSK, XFRCM: 1);
            let ie = ral::diep::register(otg, 1);
            ral::write_reg!(ral::diep, &ie, DIEPINT, InEvents::XFRC.bits());
        });
        bus.interrupt();
        assert_eq!(IN_DONE.load(Ordering::SeqCst), 1);
        assert!(bus.with(|d| d.ep_in[1].is_idle()));
    }

    #[test]
    fn pump_pass_rearms_on_fifo_full() {
        let bus = bus();
        let src = pattern(130);
        bus.with(|d| {
            d.epc[1] = Some(&EP1_BULK_IN);
            let otg = d.otg_for_test();
            ral::modify_reg!(ral::otg, otg, GAHBCFG, GINT: 1);
            // Eight words: under one max packet.
            let ie = ral::diep::register(otg, 1);
            ral::write_reg!(ral::diep, &ie, DTXFSTS, 8);
            d.ep_in[1] = TxTransfer {
                source: crate::endpoint::TxSource::Buffer {
                    ptr: src.as_ptr(),
                },
                size: 130,
                count: 0,
            };
            d.txpending = 1 << 1;
        });

        bus.pump_pass();

        bus.with(|d| {
            // Pending was consumed, the FIFO-empty interrupt was re-armed
            // instead, and the transfer hasn't moved.
            assert_eq!(d.txpending, 0);
            assert_eq!(d.ep_in[1].count, 0);
            let otg = d.otg_for_test();
            assert_eq!(ral::read_reg!(ral::otg, otg, DIEPEMPMSK), 1 << 1);
            assert_eq!(ral::read_reg!(ral::otg, otg, GAHBCFG, GINT), 1);
        });
    }

    #[test]
    fn pump_pass_without_work_is_a_no_op() {
        let bus = bus();
        bus.pump_pass();
        bus.with(|d| assert_eq!(d.txpending, 0));
    }

    #[test]
    fn disable_endpoints_repins_the_control_fifo_region() {
        let bus = bus();
        bus.disable_endpoints();
        bus.with(|d| {
            let otg = d.otg_for_test();
            // EP0's sixteen words sit right above the 128-word receive
            // FIFO.
            assert_eq!(
                ral::read_reg!(ral::otg, otg, DIEPTXF0),
                (16 << 16) | 128
            );
        });
    }

    #[test]
    fn transfer_scheduling_rejects_unconfigured_endpoints() {
        let bus = bus();
        assert_eq!(
            unsafe { bus.start_transmit(2, core::ptr::null(), 8) },
            Err(UsbError::InvalidEndpoint)
        );
        assert_eq!(
            unsafe { bus.start_receive(2, core::ptr::null_mut(), 8) },
            Err(UsbError::InvalidEndpoint)
        );
    }
}
