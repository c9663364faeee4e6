//! Internal OTG device driver
//!
//! The goal is to keep this somewhat agnostic from the task-side bus
//! behaviors: everything here is plain register and state manipulation,
//! and the caller provides the locking context. The bus front end wraps
//! each entry point in the kernel's critical section and runs the upward
//! callbacks outside it.

use core::mem;

use crate::endpoint::{
    ep_type_bits, EndpointConfig, EndpointStatus, RxSink, RxTransfer, TxSource, TxTransfer,
    UsbConfig,
};
use crate::fifo::{self, Fifo, FifoAllocator, WordIo};
use crate::ral;
use crate::{Kernel, NUM_ENDPOINTS};
use usb_device::{endpoint::EndpointAddress, UsbDirection, UsbError};

/// USB turn-around time for the 48 MHz full-speed PHY.
const TRDT_VALUE: u32 = 5;

/// Maximum packet size of the control endpoint, both directions.
const EP0_MAX_PACKET: u16 = 64;

/// Reset value restored to a DIEPTXF register when its endpoint is
/// deactivated.
const DIEPTXF_RESET: u32 = 0x0200_0400;

/// Three PHY clocks at the slowest supported AHB rate.
const PHY_DELAY_CYCLES: u32 = 12;

/// Bus speed negotiated at enumeration.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum Speed {
    #[default]
    Full,
    Low,
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum DriverState {
    Stopped,
    Ready,
}

/// What the fill engine did with one endpoint's transfer.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum FillStatus {
    /// Every packet of the transfer, trailing zero-length packet included,
    /// has been pushed.
    Complete,
    /// The FIFO cannot hold the next packet; re-arm the FIFO-empty
    /// interrupt and come back.
    FifoFull,
}

bitflags::bitflags! {
    /// DIEPINT event bits.
    pub(crate) struct InEvents: u32 {
        const XFRC = 1 << 0;
        const EPDISD = 1 << 1;
        const TOC = 1 << 3;
        const ITTXFE = 1 << 4;
        const TXFE = 1 << 7;
    }

    /// DOEPINT event bits.
    pub(crate) struct OutEvents: u32 {
        const XFRC = 1 << 0;
        const EPDISD = 1 << 1;
        const STUP = 1 << 3;
        const OTEPDIS = 1 << 4;
    }
}

/// One decoded receive-status entry.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum RxReport {
    GlobalOutNak,
    OutData { ep: usize, count: usize },
    OutComplete,
    SetupComplete,
    SetupData { ep: usize, count: usize },
}

impl RxReport {
    pub fn decode(sts: u32) -> Option<RxReport> {
        use crate::ral::otg::GRXSTSP::{BCNT, EPNUM, PKTSTS};
        let ep = ((sts & EPNUM::mask) >> EPNUM::offset) as usize;
        let count = ((sts & BCNT::mask) >> BCNT::offset) as usize;
        if ep >= NUM_ENDPOINTS {
            return None;
        }
        match (sts & PKTSTS::mask) >> PKTSTS::offset {
            1 => Some(RxReport::GlobalOutNak),
            2 => Some(RxReport::OutData { ep, count }),
            3 => Some(RxReport::OutComplete),
            4 => Some(RxReport::SetupComplete),
            6 => Some(RxReport::SetupData { ep, count }),
            _ => None,
        }
    }
}

/// Callbacks owed to the upper layer after one interrupt, as endpoint
/// masks. Collected under the critical section, dispatched outside it.
#[derive(Default, Clone, Copy)]
pub(crate) struct IrqPending {
    pub reset: bool,
    pub sof: bool,
    pub setup: u32,
    pub in_complete: u32,
    pub out_complete: u32,
}

/// Scoped hold on the controller's global interrupt line.
///
/// The core forbids interleaving writes to different endpoint FIFOs: the
/// application has to finish writing one complete packet before switching
/// to a different endpoint FIFO. Masking `GAHBCFG.GINT` keeps the interrupt
/// handler from dispatching a second endpoint event mid-fill; dropping the
/// guard restores the line on every exit path.
pub(crate) struct FillGuard {
    otg: *const ral::otg::RegisterBlock,
}

impl FillGuard {
    pub fn hold(otg: *const ral::otg::RegisterBlock) -> Self {
        let block = unsafe { &*otg };
        ral::modify_reg!(ral::otg, block, GAHBCFG, GINT: 0);
        FillGuard {
            otg,
        }
    }
}

impl Drop for FillGuard {
    fn drop(&mut self) {
        let block = unsafe { &*self.otg };
        ral::modify_reg!(ral::otg, block, GAHBCFG, GINT: 1);
    }
}

/// One endpoint's fill context, detached from the shared driver state so
/// the pump task can run the fill outside the critical section. While a
/// `TxFill` is out, the endpoint's transfer slot holds an in-flight marker.
pub(crate) struct TxFill {
    pub tx: TxTransfer,
    max_packet: usize,
    otg: *const ral::otg::RegisterBlock,
    ep: usize,
}

impl TxFill {
    /// This endpoint's FIFO window.
    pub fn fifo(&self) -> Fifo {
        // Safety: the window belongs to the endpoint this fill claimed.
        unsafe { Fifo::new(ral::fifo_address(self.otg, self.ep)) }
    }

    /// Free space in this endpoint's TX FIFO, bytes.
    fn free_bytes(&self) -> usize {
        let block = unsafe { &*self.otg };
        let ie = ral::diep::register(block, self.ep);
        ral::read_reg!(ral::diep, &ie, DTXFSTS, INEPTFSAV) as usize * 4
    }

    /// Fills the TX FIFO until the transfer is exhausted or space runs out.
    pub fn run(&mut self, fifo: &impl WordIo) -> FillStatus {
        if self.tx.size == 0 {
            // A zero-length packet still goes through the push routine; the
            // packet itself is materialized by the transfer size register.
            fifo::write_from_buffer(fifo, &[]);
            return FillStatus::Complete;
        }
        loop {
            if self.tx.is_complete() {
                return FillStatus::Complete;
            }
            let n = self.tx.next_packet(self.max_packet);
            if self.free_bytes() < n {
                return FillStatus::FifoFull;
            }
            match self.tx.source {
                TxSource::Buffer { ptr } => {
                    // Safety: validity until completion is the scheduling
                    // API's contract; `advance` keeps ptr and count paired.
                    let packet = unsafe { core::slice::from_raw_parts(ptr, n) };
                    fifo::write_from_buffer(fifo, packet);
                }
                TxSource::Queue(queue) => fifo::write_from_queue(fifo, queue, n),
                TxSource::Idle | TxSource::InFlight => {
                    debug_assert!(false, "fill without a transfer");
                    return FillStatus::Complete;
                }
            }
            self.tx.advance(n);
        }
    }
}

pub(crate) struct Driver<K: Kernel> {
    otg: ral::otg::Instance,
    pub(crate) state: DriverState,
    alloc: FifoAllocator,
    rx_fifo_words: u32,
    /// Endpoints with unflushed TX data whose FIFO signaled space.
    pub(crate) txpending: u32,
    /// The pump task, when it is parked waiting for work.
    pub(crate) thd_wait: Option<K::Task>,
    speed: Speed,
    pub(crate) epc: [Option<&'static EndpointConfig>; NUM_ENDPOINTS],
    pub(crate) ep_in: [TxTransfer; NUM_ENDPOINTS],
    pub(crate) ep_out: [RxTransfer; NUM_ENDPOINTS],
    setup: [[u8; 8]; NUM_ENDPOINTS],
    pub(crate) config: &'static UsbConfig,
}

impl<K: Kernel> Driver<K> {
    pub fn new(
        otg: ral::otg::Instance,
        rx_fifo_words: u32,
        fifo_depth_words: u32,
        config: &'static UsbConfig,
    ) -> Self {
        const TX_INIT: TxTransfer = TxTransfer::idle();
        const RX_INIT: RxTransfer = RxTransfer::idle();
        Driver {
            otg,
            state: DriverState::Stopped,
            alloc: FifoAllocator::new(rx_fifo_words, fifo_depth_words),
            rx_fifo_words,
            txpending: 0,
            thd_wait: None,
            speed: Speed::Full,
            epc: [None; NUM_ENDPOINTS],
            ep_in: [TX_INIT; NUM_ENDPOINTS],
            ep_out: [RX_INIT; NUM_ENDPOINTS],
            setup: [[0; 8]; NUM_ENDPOINTS],
            config,
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.state == DriverState::Stopped
    }

    pub fn speed(&self) -> Speed {
        self.speed
    }

    /// Core soft reset. The AHB must go idle before and after.
    fn core_reset(&self) {
        while ral::read_reg!(ral::otg, self.otg, GRSTCTL, AHBIDL) == 0 {}
        ral::write_reg!(ral::otg, self.otg, GRSTCTL, CSRST: 1);
        while ral::read_reg!(ral::otg, self.otg, GRSTCTL, CSRST) == 1 {}
        K::polled_delay(PHY_DELAY_CYCLES);
    }

    fn rxfifo_flush(&self) {
        ral::write_reg!(ral::otg, self.otg, GRSTCTL, RXFFLSH: 1);
        while ral::read_reg!(ral::otg, self.otg, GRSTCTL, RXFFLSH) == 1 {}
        K::polled_delay(PHY_DELAY_CYCLES);
    }

    fn txfifo_flush(&self, fifo: u32) {
        ral::write_reg!(ral::otg, self.otg, GRSTCTL, TXFNUM: fifo, TXFFLSH: 1);
        while ral::read_reg!(ral::otg, self.otg, GRSTCTL, TXFFLSH) == 1 {}
        K::polled_delay(PHY_DELAY_CYCLES);
    }

    /// Puts every endpoint back into its disabled reset state.
    fn disable_all_ep(&mut self) {
        for ep in 0..NUM_ENDPOINTS {
            let ie = ral::diep::register(&self.otg, ep);
            // Disable only if enabled: the manual allows setting EPDIS only
            // while EPENA is set.
            if ral::read_reg!(ral::diep, &ie, DIEPCTL, EPENA) == 1 {
                ral::write_reg!(ral::diep, &ie, DIEPCTL, EPDIS: 1);
                while !InEvents::from_bits_truncate(ral::read_reg!(ral::diep, &ie, DIEPINT))
                    .contains(InEvents::EPDISD)
                {}
            } else {
                ral::write_reg!(ral::diep, &ie, DIEPCTL, 0);
            }
            ral::write_reg!(ral::diep, &ie, DIEPTSIZ, 0);
            ral::write_reg!(ral::diep, &ie, DIEPINT, 0xFFFF_FFFF);

            let oe = ral::doep::register(&self.otg, ep);
            // The disable attempt on OUT endpoint 0 is ignored by the
            // hardware, but the code is simpler this way.
            if ral::read_reg!(ral::doep, &oe, DOEPCTL, EPENA) == 1 {
                ral::write_reg!(ral::doep, &oe, DOEPCTL, EPDIS: 1);
                while !OutEvents::from_bits_truncate(ral::read_reg!(ral::doep, &oe, DOEPINT))
                    .contains(OutEvents::OTEPDIS)
                {}
            } else {
                ral::write_reg!(ral::doep, &oe, DOEPCTL, 0);
            }
            ral::write_reg!(ral::doep, &oe, DOEPTSIZ, 0);
            ral::write_reg!(ral::doep, &oe, DOEPINT, 0xFFFF_FFFF);

            self.ep_in[ep].reset();
            self.ep_out[ep] = RxTransfer::idle();
        }
        ral::write_reg!(ral::otg, self.otg, DAINTMSK, IEPM: 1, OEPM: 1);
    }

    /// Configures and activates the peripheral. Slow; run it before any
    /// time-critical work, with the pump task already created.
    pub fn start(&mut self) {
        if self.state != DriverState::Stopped {
            return;
        }
        self.txpending = 0;

        self.core_reset();

        // Internal FS PHY activation.
        ral::write_reg!(ral::otg, self.otg, GCCFG, PWRDWN: 1);

        // Forced device mode, full-speed 1.1 PHY.
        ral::write_reg!(ral::otg, self.otg, GUSBCFG, FDMOD: 1, TRDT: TRDT_VALUE, PHYSEL: 1);

        // Interrupts on TXFIFOs half empty.
        ral::write_reg!(ral::otg, self.otg, GAHBCFG, 0);

        // 48 MHz 1.1 PHY, frame interval 80%.
        ral::write_reg!(ral::otg, self.otg, DCFG, 0x0220_0003);

        // PHY clock ungated.
        ral::write_reg!(ral::otg, self.otg, PCGCCTL, 0);

        self.disable_all_ep();

        ral::write_reg!(ral::otg, self.otg, DIEPMSK, 0);
        ral::write_reg!(ral::otg, self.otg, DOEPMSK, 0);
        ral::write_reg!(ral::otg, self.otg, DAINTMSK, 0);
        if self.config.on_sof.is_some() {
            ral::write_reg!(ral::otg, self.otg, GINTMSK, ENUMDNEM: 1, USBRSTM: 1, SOFM: 1);
        } else {
            ral::write_reg!(ral::otg, self.otg, GINTMSK, ENUMDNEM: 1, USBRSTM: 1);
        }
        ral::write_reg!(ral::otg, self.otg, GINTSTS, 0xFFFF_FFFF);

        ral::modify_reg!(ral::otg, self.otg, GAHBCFG, GINT: 1);

        self.state = DriverState::Ready;
        debug!("START");
    }

    /// Deactivates the peripheral.
    pub fn stop(&mut self) {
        if self.state == DriverState::Stopped {
            return;
        }
        self.txpending = 0;
        ral::write_reg!(ral::otg, self.otg, DAINTMSK, 0);
        ral::write_reg!(ral::otg, self.otg, GAHBCFG, 0);
        ral::write_reg!(ral::otg, self.otg, GCCFG, 0);
        self.state = DriverState::Stopped;
        debug!("STOP");
    }

    /// Bus reset sequence, run from the interrupt handler.
    pub fn bus_reset(&mut self) {
        ral::modify_reg!(ral::otg, self.otg, DCTL, RWUSIG: 0);

        self.txfifo_flush(0);

        // All endpoints in NAK mode, interrupts cleared, transfers dropped.
        for ep in 0..NUM_ENDPOINTS {
            let ie = ral::diep::register(&self.otg, ep);
            ral::write_reg!(ral::diep, &ie, DIEPCTL, SNAK: 1);
            ral::write_reg!(ral::diep, &ie, DIEPINT, 0xFF);
            let oe = ral::doep::register(&self.otg, ep);
            ral::write_reg!(ral::doep, &oe, DOEPCTL, SNAK: 1);
            ral::write_reg!(ral::doep, &oe, DOEPINT, 0xFF);
            self.ep_in[ep].reset();
            self.ep_out[ep] = RxTransfer::idle();
            if ep != 0 {
                self.epc[ep] = None;
            }
        }
        self.txpending = 0;
        ral::write_reg!(ral::otg, self.otg, DAINT, 0xFFFF_FFFF);
        ral::write_reg!(ral::otg, self.otg, DAINTMSK, IEPM: 1, OEPM: 1);

        self.alloc.reset();
        ral::write_reg!(ral::otg, self.otg, GRXFSIZ, RXFD: self.rx_fifo_words);
        self.rxfifo_flush();

        // Back to the default address.
        ral::modify_reg!(ral::otg, self.otg, DCFG, DAD: 0);

        ral::modify_reg!(ral::otg, self.otg, GINTMSK, RXFLVLM: 1, IEPM: 1, OEPM: 1);
        ral::write_reg!(ral::otg, self.otg, DIEPMSK, TOM: 1, XFRCM: 1);
        ral::write_reg!(ral::otg, self.otg, DOEPMSK, STUPM: 1, XFRCM: 1);

        // EP0 is a special case: unconditionally active in both directions,
        // and its FIFO region is allocated first so it always has the
        // lowest address.
        self.epc[0] = Some(&self.config.ep0);
        let ep0_words = u32::from(EP0_MAX_PACKET) / 4;
        let oe = ral::doep::register(&self.otg, 0);
        ral::write_reg!(ral::doep, &oe, DOEPTSIZ, 0);
        ral::write_reg!(ral::doep, &oe, DOEPCTL, SD0PID_SEVNFRM: 1, USBAEP: 1, EPTYP: 0, MPSIZ: u32::from(EP0_MAX_PACKET));
        let ie = ral::diep::register(&self.otg, 0);
        ral::write_reg!(ral::diep, &ie, DIEPTSIZ, 0);
        ral::write_reg!(ral::diep, &ie, DIEPCTL, SD0PID_SEVNFRM: 1, USBAEP: 1, EPTYP: 0, TXFNUM: 0, MPSIZ: u32::from(EP0_MAX_PACKET));
        let sa = self.alloc.allocate(ep0_words);
        ral::write_reg!(ral::otg, self.otg, DIEPTXF0, INEPTXSA: sa, INEPTXFD: ep0_words);

        debug!("RESET");
    }

    pub fn set_address(&mut self, address: u8) {
        ral::modify_reg!(ral::otg, self.otg, DCFG, DAD: u32::from(address));
        debug!("ADDRESS {}", address);
    }

    /// Activates or deactivates both directions of an endpoint from its
    /// descriptor. Endpoint 0 is owned by the reset handler.
    pub fn init_endpoint(
        &mut self,
        ep: usize,
        config: &'static EndpointConfig,
    ) -> Result<(), UsbError> {
        if ep == 0 || ep >= NUM_ENDPOINTS {
            return Err(UsbError::InvalidEndpoint);
        }
        if self.state != DriverState::Ready {
            return Err(UsbError::InvalidState);
        }
        let eptyp = ep_type_bits(config.kind);

        // OUT direction activation or deactivation.
        let oe = ral::doep::register(&self.otg, ep);
        ral::write_reg!(ral::doep, &oe, DOEPTSIZ, 0);
        if config.out_cb.is_some() {
            ral::write_reg!(ral::doep, &oe, DOEPCTL, SD0PID_SEVNFRM: 1, USBAEP: 1, EPTYP: eptyp, MPSIZ: u32::from(config.out_max_packet));
            ral::modify_reg!(ral::otg, self.otg, DAINTMSK, |v| v | (1 << (16 + ep)));
        } else {
            ral::modify_reg!(ral::doep, &oe, DOEPCTL, USBAEP: 0);
            ral::modify_reg!(ral::otg, self.otg, DAINTMSK, |v| v & !(1 << (16 + ep)));
        }

        // IN direction activation or deactivation.
        let ie = ral::diep::register(&self.otg, ep);
        ral::write_reg!(ral::diep, &ie, DIEPTSIZ, 0);
        if config.in_cb.is_some() {
            let mut fsize = u32::from(config.in_max_packet) / 4;
            if config.in_multiplier > 1 {
                fsize *= u32::from(config.in_multiplier);
            }
            let sa = self.alloc.allocate(fsize);
            let txf = ral::dieptxf::register(&self.otg, ep);
            ral::write_reg!(ral::dieptxf, &txf, DIEPTXF, INEPTXSA: sa, INEPTXFD: fsize);
            self.txfifo_flush(ep as u32);
            ral::write_reg!(ral::diep, &ie, DIEPCTL, SD0PID_SEVNFRM: 1, USBAEP: 1, EPTYP: eptyp, TXFNUM: ep as u32, MPSIZ: u32::from(config.in_max_packet));
            ral::modify_reg!(ral::otg, self.otg, DAINTMSK, |v| v | (1 << ep));
        } else {
            let txf = ral::dieptxf::register(&self.otg, ep);
            ral::write_reg!(ral::dieptxf, &txf, DIEPTXF, DIEPTXF_RESET);
            self.txfifo_flush(ep as u32);
            ral::modify_reg!(ral::diep, &ie, DIEPCTL, USBAEP: 0);
            ral::modify_reg!(ral::otg, self.otg, DAINTMSK, |v| v & !(1 << ep));
        }

        self.epc[ep] = Some(config);
        self.ep_in[ep].reset();
        self.ep_out[ep] = RxTransfer::idle();
        debug!("EP{} init", ep);
        Ok(())
    }

    /// Disables every endpoint except the control endpoint and reclaims
    /// their FIFO regions. Used on configuration changes.
    pub fn disable_endpoints(&mut self) {
        self.alloc.reset();
        // EP0's region stays pinned at the bottom of the transmit space.
        let ep0_words = u32::from(EP0_MAX_PACKET) / 4;
        let sa = self.alloc.allocate(ep0_words);
        ral::write_reg!(ral::otg, self.otg, DIEPTXF0, INEPTXSA: sa, INEPTXFD: ep0_words);

        for ep in 1..NUM_ENDPOINTS {
            let ie = ral::diep::register(&self.otg, ep);
            ral::modify_reg!(ral::diep, &ie, DIEPCTL, USBAEP: 0);
            ral::write_reg!(ral::diep, &ie, DIEPTSIZ, 0);
            let oe = ral::doep::register(&self.otg, ep);
            ral::modify_reg!(ral::doep, &oe, DOEPCTL, USBAEP: 0);
            ral::write_reg!(ral::doep, &oe, DOEPTSIZ, 0);
            self.epc[ep] = None;
            self.ep_in[ep].reset();
            self.ep_out[ep] = RxTransfer::idle();
        }
        self.txpending = 0;
        ral::write_reg!(ral::otg, self.otg, DAINTMSK, IEPM: 1, OEPM: 1);
    }

    pub fn endpoint_status(&self, addr: EndpointAddress) -> EndpointStatus {
        let (active, stalled) = match addr.direction() {
            UsbDirection::In => {
                let ie = ral::diep::register(&self.otg, addr.index());
                (
                    ral::read_reg!(ral::diep, &ie, DIEPCTL, USBAEP) == 1,
                    ral::read_reg!(ral::diep, &ie, DIEPCTL, STALL) == 1,
                )
            }
            UsbDirection::Out => {
                let oe = ral::doep::register(&self.otg, addr.index());
                (
                    ral::read_reg!(ral::doep, &oe, DOEPCTL, USBAEP) == 1,
                    ral::read_reg!(ral::doep, &oe, DOEPCTL, STALL) == 1,
                )
            }
        };
        if !active {
            EndpointStatus::Disabled
        } else if stalled {
            EndpointStatus::Stalled
        } else {
            EndpointStatus::Active
        }
    }

    pub fn set_stalled(&mut self, addr: EndpointAddress, stall: bool) {
        match addr.direction() {
            UsbDirection::In => {
                let ie = ral::diep::register(&self.otg, addr.index());
                ral::modify_reg!(ral::diep, &ie, DIEPCTL, STALL: stall as u32);
            }
            UsbDirection::Out => {
                let oe = ral::doep::register(&self.otg, addr.index());
                ral::modify_reg!(ral::doep, &oe, DOEPCTL, STALL: stall as u32);
            }
        }
    }

    pub fn is_stalled(&self, addr: EndpointAddress) -> bool {
        self.endpoint_status(addr) == EndpointStatus::Stalled
    }

    /// Arms an IN transfer: transfer size and packet count programmed, the
    /// endpoint enabled, and the FIFO-empty interrupt armed so the pump
    /// task starts filling.
    pub fn start_transmit(
        &mut self,
        ep: usize,
        source: TxSource,
        len: usize,
    ) -> Result<(), UsbError> {
        let config = self
            .epc
            .get(ep)
            .copied()
            .flatten()
            .filter(|c| c.in_cb.is_some())
            .ok_or(UsbError::InvalidEndpoint)?;
        if !self.ep_in[ep].is_idle() {
            return Err(UsbError::WouldBlock);
        }
        self.ep_in[ep] = TxTransfer {
            source,
            size: len,
            count: 0,
        };

        let ie = ral::diep::register(&self.otg, ep);
        if len == 0 {
            // A zero-size packet is still one packet.
            ral::write_reg!(ral::diep, &ie, DIEPTSIZ, PKTCNT: 1, XFRSIZ: 0);
        } else {
            let mps = usize::from(config.in_max_packet);
            let pcnt = (len + mps - 1) / mps;
            ral::write_reg!(ral::diep, &ie, DIEPTSIZ, PKTCNT: pcnt as u32, XFRSIZ: len as u32);
        }
        ral::modify_reg!(ral::diep, &ie, DIEPCTL, EPENA: 1, CNAK: 1);
        ral::modify_reg!(ral::otg, self.otg, DIEPEMPMSK, |v| v | (1 << ep));
        debug!("EP{} In {}", ep, len);
        Ok(())
    }

    /// Arms an OUT transfer.
    pub fn start_receive(&mut self, ep: usize, sink: RxSink, len: usize) -> Result<(), UsbError> {
        let config = self
            .epc
            .get(ep)
            .copied()
            .flatten()
            .filter(|c| c.out_cb.is_some())
            .ok_or(UsbError::InvalidEndpoint)?;
        if !self.ep_out[ep].is_idle() {
            return Err(UsbError::WouldBlock);
        }
        self.ep_out[ep] = RxTransfer {
            sink,
            size: len,
            count: 0,
        };

        let mps = usize::from(config.out_max_packet);
        let pcnt = (len + mps - 1) / mps;
        let oe = ral::doep::register(&self.otg, ep);
        ral::write_reg!(ral::doep, &oe, DOEPTSIZ, STUPCNT: 3, PKTCNT: pcnt as u32, XFRSIZ: mps as u32);
        ral::modify_reg!(ral::doep, &oe, DOEPCTL, EPENA: 1, CNAK: 1);
        debug!("EP{} Out {}", ep, len);
        Ok(())
    }

    /// The last SETUP packet received on `ep`.
    pub fn setup_packet(&self, ep: usize) -> [u8; 8] {
        self.setup[ep]
    }

    /// Bytes accumulated by the current (or just finished) OUT transfer.
    pub fn received_count(&self, ep: usize) -> usize {
        self.ep_out[ep].count
    }

    /// The shared receive FIFO's pop window.
    pub fn rx_fifo(&self) -> Fifo {
        // Safety: window 0 belongs to this core.
        unsafe { Fifo::new(self.otg.fifo_address(0)) }
    }

    /// Whether the hardware reports receive-status entries outstanding.
    pub fn rx_pending(&self) -> bool {
        ral::read_reg!(ral::otg, self.otg, GINTSTS, RXFLVL) == 1
    }

    pub fn unmask_rxflvl(&mut self) {
        ral::modify_reg!(ral::otg, self.otg, GINTMSK, RXFLVLM: 1);
    }

    /// Pops and routes one receive-status entry.
    pub fn rxfifo_dispatch(&mut self, fifo: &impl WordIo) {
        let sts = ral::read_reg!(ral::otg, self.otg, GRXSTSP);
        match RxReport::decode(sts) {
            Some(RxReport::SetupData { ep, count }) => {
                fifo::read_to_buffer(fifo, &mut self.setup[ep], count);
            }
            Some(RxReport::OutData { ep, count }) => {
                let rx = &mut self.ep_out[ep];
                match rx.sink {
                    RxSink::Queue(queue) => fifo::read_to_queue(fifo, queue, count),
                    RxSink::Buffer { ptr } => {
                        // Safety: validity for the transfer size is the
                        // scheduling API's contract; the capacity cap keeps
                        // the copy inside it while the FIFO still drains in
                        // full.
                        let dst = unsafe { core::slice::from_raw_parts_mut(ptr, rx.capacity()) };
                        fifo::read_to_buffer(fifo, dst, count);
                        rx.sink = RxSink::Buffer {
                            ptr: ptr.wrapping_add(count),
                        };
                    }
                    RxSink::Idle => {
                        // No transfer armed: drain and drop.
                        fifo::read_to_buffer(fifo, &mut [], count);
                    }
                }
                rx.count += count;
            }
            Some(RxReport::SetupComplete)
            | Some(RxReport::GlobalOutNak)
            | Some(RxReport::OutComplete)
            | None => {}
        }
    }

    /// Claims one endpoint's pending fill, handing back the detached fill
    /// context and the interrupt gate held for its duration.
    pub fn claim_tx(&mut self, ep: usize) -> Option<(TxFill, FillGuard)> {
        let bit = 1 << ep;
        if self.txpending & bit == 0 {
            return None;
        }
        self.txpending &= !bit;
        let config = self.epc[ep]?;
        let guard = FillGuard::hold(self.otg.raw());
        let tx = mem::replace(&mut self.ep_in[ep], TxTransfer::in_flight());
        Some((
            TxFill {
                tx,
                max_packet: usize::from(config.in_max_packet),
                otg: self.otg.raw(),
                ep,
            },
            guard,
        ))
    }

    /// Checks a fill context back in, releases the interrupt gate, and
    /// re-arms the FIFO-empty interrupt when the transfer still has bytes
    /// waiting for space.
    pub fn finish_tx(&mut self, fill: TxFill, guard: FillGuard, status: FillStatus) {
        let ep = fill.ep;
        self.ep_in[ep] = fill.tx;
        drop(guard);
        if status == FillStatus::FifoFull {
            ral::modify_reg!(ral::otg, self.otg, DIEPEMPMSK, |v| v | (1 << ep));
        }
    }

    fn wake_pump(&mut self) {
        if let Some(task) = self.thd_wait.take() {
            K::resume_task(task);
        }
    }

    #[cfg(test)]
    pub(crate) fn otg_for_test(&self) -> &ral::otg::RegisterBlock {
        &self.otg
    }

    /// IN endpoint interrupt: returns whether a transfer completed.
    fn epin_irq(&mut self, ep: usize) -> bool {
        let ie = ral::diep::register(&self.otg, ep);
        let epint = InEvents::from_bits_truncate(ral::read_reg!(ral::diep, &ie, DIEPINT));
        ral::write_reg!(ral::diep, &ie, DIEPINT, 0xFFFF_FFFF);

        if epint.contains(InEvents::TOC) {
            // Timeouts not handled yet, not sure how to handle.
            warn!("EP{} IN timeout ignored", ep);
        }
        let mut complete = false;
        if epint.contains(InEvents::XFRC)
            && ral::read_reg!(ral::otg, self.otg, DIEPMSK, XFRCM) == 1
        {
            self.ep_in[ep].reset();
            complete = true;
        }
        if epint.contains(InEvents::TXFE)
            && ral::read_reg!(ral::otg, self.otg, DIEPEMPMSK) & (1 << ep) != 0
        {
            // The pump task takes it from here; one FIFO-empty report per
            // arming.
            self.txpending |= 1 << ep;
            ral::modify_reg!(ral::otg, self.otg, DIEPEMPMSK, |v| v & !(1 << ep));
            self.wake_pump();
        }
        complete
    }

    /// OUT endpoint interrupt: returns (setup received, transfer complete).
    fn epout_irq(&mut self, ep: usize) -> (bool, bool) {
        let oe = ral::doep::register(&self.otg, ep);
        let epint = OutEvents::from_bits_truncate(ral::read_reg!(ral::doep, &oe, DOEPINT));
        ral::write_reg!(ral::doep, &oe, DOEPINT, 0xFFFF_FFFF);

        let setup = epint.contains(OutEvents::STUP)
            && ral::read_reg!(ral::otg, self.otg, DOEPMSK, STUPM) == 1;
        let complete = epint.contains(OutEvents::XFRC)
            && ral::read_reg!(ral::otg, self.otg, DOEPMSK, XFRCM) == 1;
        if complete {
            self.ep_out[ep].finish();
        }
        (setup, complete)
    }

    /// One interrupt invocation: snapshot-and-clear, then each condition
    /// handled independently. Returns the callbacks owed upward.
    pub fn isr(&mut self) -> IrqPending {
        let sts = ral::read_reg!(ral::otg, self.otg, GINTSTS)
            & ral::read_reg!(ral::otg, self.otg, GINTMSK);
        ral::write_reg!(ral::otg, self.otg, GINTSTS, sts);

        let mut pending = IrqPending::default();

        if sts & ral::otg::GINTSTS::USBRST::mask != 0 {
            self.bus_reset();
            pending.reset = true;
        }

        if sts & ral::otg::GINTSTS::ENUMDNE::mask != 0 {
            self.speed = match ral::read_reg!(ral::otg, self.otg, DSTS, ENUMSPD) {
                2 => Speed::Low,
                _ => Speed::Full,
            };
        }

        if sts & ral::otg::GINTSTS::SOF::mask != 0 {
            pending.sof = true;
        }

        if sts & ral::otg::GINTSTS::RXFLVL::mask != 0 {
            // Masked while the pump task has control, or the interrupt
            // would retrigger; the task unmasks it before going back to
            // sleep.
            ral::modify_reg!(ral::otg, self.otg, GINTMSK, RXFLVLM: 0);
            self.wake_pump();
        }

        if sts & (ral::otg::GINTSTS::IEPINT::mask | ral::otg::GINTSTS::OEPINT::mask) != 0 {
            let src = ral::read_reg!(ral::otg, self.otg, DAINT);
            for ep in 0..NUM_ENDPOINTS {
                if src & (1 << ep) != 0 && self.epin_irq(ep) {
                    pending.in_complete |= 1 << ep;
                }
                if src & (1 << (16 + ep)) != 0 {
                    let (setup, complete) = self.epout_irq(ep);
                    if setup {
                        pending.setup |= 1 << ep;
                    }
                    if complete {
                        pending.out_complete |= 1 << ep;
                    }
                }
            }
        }

        pending
    }
}
