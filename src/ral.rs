//! OTG core register definitions
//!
//! The register map follows the vendor reference manual for the full-speed
//! OTG core: a global CSR block, the device-mode block, per-endpoint IN and
//! OUT banks, and one data FIFO window per endpoint aliased over its own
//! 4 KiB page. Host-mode registers are carried as reserved space; this is a
//! device-only driver.
//!
//! Endpoint banks and the transmit FIFO size array cannot be addressed
//! through the register macros directly, so small helper modules hand out
//! per-endpoint register views, the same way a single endpoint control
//! register would be selected by index.

#![allow(non_snake_case, non_upper_case_globals, dead_code)]

pub use ral_registers::{modify_reg, read_reg, write_reg, RWRegister};

use crate::NUM_ENDPOINTS;

/// Spacing of the per-endpoint FIFO windows.
const FIFO_SPACING: usize = 0x1000;

pub fn instance<P: crate::Peripherals>(peripherals: P) -> otg::Instance {
    // Safety: the `Peripherals` implementor owns the register region and
    // vouches for the pointer.
    unsafe { otg::Instance::new(peripherals.base()) }
}

pub mod otg {
    use super::{RWRegister, NUM_ENDPOINTS};

    /// One IN endpoint register bank.
    #[repr(C)]
    pub struct InEndpoint {
        pub DIEPCTL: RWRegister<u32>,
        _reserved0: [u32; 1],
        pub DIEPINT: RWRegister<u32>,
        _reserved1: [u32; 1],
        pub DIEPTSIZ: RWRegister<u32>,
        _reserved2: [u32; 1],
        pub DTXFSTS: RWRegister<u32>,
        _reserved3: [u32; 1],
    }

    /// One OUT endpoint register bank.
    #[repr(C)]
    pub struct OutEndpoint {
        pub DOEPCTL: RWRegister<u32>,
        _reserved0: [u32; 1],
        pub DOEPINT: RWRegister<u32>,
        _reserved1: [u32; 1],
        pub DOEPTSIZ: RWRegister<u32>,
        _reserved2: [u32; 3],
    }

    #[repr(C)]
    pub struct RegisterBlock {
        pub GOTGCTL: RWRegister<u32>,
        pub GOTGINT: RWRegister<u32>,
        pub GAHBCFG: RWRegister<u32>,
        pub GUSBCFG: RWRegister<u32>,
        pub GRSTCTL: RWRegister<u32>,
        pub GINTSTS: RWRegister<u32>,
        pub GINTMSK: RWRegister<u32>,
        pub GRXSTSR: RWRegister<u32>,
        pub GRXSTSP: RWRegister<u32>,
        pub GRXFSIZ: RWRegister<u32>,
        pub DIEPTXF0: RWRegister<u32>,
        pub HNPTXSTS: RWRegister<u32>,
        _reserved0: [u32; 2],
        pub GCCFG: RWRegister<u32>,
        pub CID: RWRegister<u32>,
        _reserved1: [u32; 48],
        pub HPTXFSIZ: RWRegister<u32>,
        /// DIEPTXF1..=DIEPTXF3, indexed by endpoint minus one.
        pub DIEPTXF: [RWRegister<u32>; NUM_ENDPOINTS - 1],
        _reserved2: [u32; 188],
        _reserved_host: [u32; 256],
        pub DCFG: RWRegister<u32>,
        pub DCTL: RWRegister<u32>,
        pub DSTS: RWRegister<u32>,
        _reserved3: [u32; 1],
        pub DIEPMSK: RWRegister<u32>,
        pub DOEPMSK: RWRegister<u32>,
        pub DAINT: RWRegister<u32>,
        pub DAINTMSK: RWRegister<u32>,
        _reserved4: [u32; 2],
        pub DVBUSDIS: RWRegister<u32>,
        pub DVBUSPULSE: RWRegister<u32>,
        _reserved5: [u32; 1],
        pub DIEPEMPMSK: RWRegister<u32>,
        _reserved6: [u32; 50],
        pub ie: [InEndpoint; NUM_ENDPOINTS],
        _reserved7: [u32; 96],
        pub oe: [OutEndpoint; NUM_ENDPOINTS],
        _reserved8: [u32; 160],
        pub PCGCCTL: RWRegister<u32>,
    }

    const _: [(); 1] = [(); (core::mem::size_of::<RegisterBlock>() == 0xE04) as usize];

    /// Owned handle to one OTG core's register block.
    pub struct Instance {
        ptr: *const RegisterBlock,
    }

    // Safety: the register block is a hardware resource; the handle is just
    // an address.
    unsafe impl Send for Instance {}

    impl core::ops::Deref for Instance {
        type Target = RegisterBlock;
        fn deref(&self) -> &RegisterBlock {
            // Safety: constructed from a pointer the `Peripherals`
            // implementor vouched for.
            unsafe { &*self.ptr }
        }
    }

    impl Instance {
        /// # Safety
        ///
        /// `ptr` must be the base address of an OTG register block, and the
        /// caller must be its sole owner.
        pub(crate) unsafe fn new(ptr: *const ()) -> Self {
            Instance {
                ptr: ptr.cast(),
            }
        }

        pub(crate) fn raw(&self) -> *const RegisterBlock {
            self.ptr
        }

        /// Address of endpoint `ep`'s FIFO window. Window 0 doubles as the
        /// shared receive FIFO pop window.
        pub(crate) fn fifo_address(&self, ep: usize) -> *mut u32 {
            super::fifo_address(self.ptr, ep)
        }
    }

    pub mod GAHBCFG {
        pub mod GINT { pub const offset: u32 = 0; pub const mask: u32 = 1 << offset; pub mod RW {} pub mod R {} pub mod W {} }
        pub mod TXFELVL { pub const offset: u32 = 7; pub const mask: u32 = 1 << offset; pub mod RW {} pub mod R {} pub mod W {} }
    }

    pub mod GUSBCFG {
        pub mod PHYSEL { pub const offset: u32 = 6; pub const mask: u32 = 1 << offset; pub mod RW {} pub mod R {} pub mod W {} }
        pub mod TRDT { pub const offset: u32 = 10; pub const mask: u32 = 0xF << offset; pub mod RW {} pub mod R {} pub mod W {} }
        pub mod FDMOD { pub const offset: u32 = 30; pub const mask: u32 = 1 << offset; pub mod RW {} pub mod R {} pub mod W {} }
    }

    pub mod GRSTCTL {
        pub mod CSRST { pub const offset: u32 = 0; pub const mask: u32 = 1 << offset; pub mod RW {} pub mod R {} pub mod W {} }
        pub mod RXFFLSH { pub const offset: u32 = 4; pub const mask: u32 = 1 << offset; pub mod RW {} pub mod R {} pub mod W {} }
        pub mod TXFFLSH { pub const offset: u32 = 5; pub const mask: u32 = 1 << offset; pub mod RW {} pub mod R {} pub mod W {} }
        pub mod TXFNUM { pub const offset: u32 = 6; pub const mask: u32 = 0x1F << offset; pub mod RW {} pub mod R {} pub mod W {} }
        pub mod AHBIDL { pub const offset: u32 = 31; pub const mask: u32 = 1 << offset; pub mod RW {} pub mod R {} pub mod W {} }
    }

    pub mod GINTSTS {
        pub mod SOF { pub const offset: u32 = 3; pub const mask: u32 = 1 << offset; pub mod RW {} pub mod R {} pub mod W {} }
        pub mod RXFLVL { pub const offset: u32 = 4; pub const mask: u32 = 1 << offset; pub mod RW {} pub mod R {} pub mod W {} }
        pub mod USBRST { pub const offset: u32 = 12; pub const mask: u32 = 1 << offset; pub mod RW {} pub mod R {} pub mod W {} }
        pub mod ENUMDNE { pub const offset: u32 = 13; pub const mask: u32 = 1 << offset; pub mod RW {} pub mod R {} pub mod W {} }
        pub mod IEPINT { pub const offset: u32 = 18; pub const mask: u32 = 1 << offset; pub mod RW {} pub mod R {} pub mod W {} }
        pub mod OEPINT { pub const offset: u32 = 19; pub const mask: u32 = 1 << offset; pub mod RW {} pub mod R {} pub mod W {} }
    }

    pub mod GINTMSK {
        pub mod SOFM { pub const offset: u32 = 3; pub const mask: u32 = 1 << offset; pub mod RW {} pub mod R {} pub mod W {} }
        pub mod RXFLVLM { pub const offset: u32 = 4; pub const mask: u32 = 1 << offset; pub mod RW {} pub mod R {} pub mod W {} }
        pub mod USBRSTM { pub const offset: u32 = 12; pub const mask: u32 = 1 << offset; pub mod RW {} pub mod R {} pub mod W {} }
        pub mod ENUMDNEM { pub const offset: u32 = 13; pub const mask: u32 = 1 << offset; pub mod RW {} pub mod R {} pub mod W {} }
        pub mod IEPM { pub const offset: u32 = 18; pub const mask: u32 = 1 << offset; pub mod RW {} pub mod R {} pub mod W {} }
        pub mod OEPM { pub const offset: u32 = 19; pub const mask: u32 = 1 << offset; pub mod RW {} pub mod R {} pub mod W {} }
    }

    pub mod GRXSTSP {
        pub mod EPNUM { pub const offset: u32 = 0; pub const mask: u32 = 0xF << offset; pub mod RW {} pub mod R {} pub mod W {} }
        pub mod BCNT { pub const offset: u32 = 4; pub const mask: u32 = 0x7FF << offset; pub mod RW {} pub mod R {} pub mod W {} }
        pub mod DPID { pub const offset: u32 = 15; pub const mask: u32 = 0x3 << offset; pub mod RW {} pub mod R {} pub mod W {} }
        pub mod PKTSTS { pub const offset: u32 = 17; pub const mask: u32 = 0xF << offset; pub mod RW {} pub mod R {} pub mod W {} }
    }

    pub mod GRXFSIZ {
        pub mod RXFD { pub const offset: u32 = 0; pub const mask: u32 = 0xFFFF << offset; pub mod RW {} pub mod R {} pub mod W {} }
    }

    pub mod DIEPTXF0 {
        pub mod INEPTXSA { pub const offset: u32 = 0; pub const mask: u32 = 0xFFFF << offset; pub mod RW {} pub mod R {} pub mod W {} }
        pub mod INEPTXFD { pub const offset: u32 = 16; pub const mask: u32 = 0xFFFF << offset; pub mod RW {} pub mod R {} pub mod W {} }
    }

    pub mod GCCFG {
        pub mod PWRDWN { pub const offset: u32 = 16; pub const mask: u32 = 1 << offset; pub mod RW {} pub mod R {} pub mod W {} }
    }

    pub mod DCFG {
        pub mod DSPD { pub const offset: u32 = 0; pub const mask: u32 = 0x3 << offset; pub mod RW {} pub mod R {} pub mod W {} }
        pub mod DAD { pub const offset: u32 = 4; pub const mask: u32 = 0x7F << offset; pub mod RW {} pub mod R {} pub mod W {} }
        pub mod PFIVL { pub const offset: u32 = 11; pub const mask: u32 = 0x3 << offset; pub mod RW {} pub mod R {} pub mod W {} }
    }

    pub mod DCTL {
        pub mod RWUSIG { pub const offset: u32 = 0; pub const mask: u32 = 1 << offset; pub mod RW {} pub mod R {} pub mod W {} }
        pub mod SDIS { pub const offset: u32 = 1; pub const mask: u32 = 1 << offset; pub mod RW {} pub mod R {} pub mod W {} }
    }

    pub mod DSTS {
        pub mod SUSPSTS { pub const offset: u32 = 0; pub const mask: u32 = 1 << offset; pub mod RW {} pub mod R {} pub mod W {} }
        pub mod ENUMSPD { pub const offset: u32 = 1; pub const mask: u32 = 0x3 << offset; pub mod RW {} pub mod R {} pub mod W {} }
    }

    pub mod DIEPMSK {
        pub mod XFRCM { pub const offset: u32 = 0; pub const mask: u32 = 1 << offset; pub mod RW {} pub mod R {} pub mod W {} }
        pub mod TOM { pub const offset: u32 = 3; pub const mask: u32 = 1 << offset; pub mod RW {} pub mod R {} pub mod W {} }
    }

    pub mod DOEPMSK {
        pub mod XFRCM { pub const offset: u32 = 0; pub const mask: u32 = 1 << offset; pub mod RW {} pub mod R {} pub mod W {} }
        pub mod STUPM { pub const offset: u32 = 3; pub const mask: u32 = 1 << offset; pub mod RW {} pub mod R {} pub mod W {} }
    }

    pub mod DAINTMSK {
        pub mod IEPM { pub const offset: u32 = 0; pub const mask: u32 = 0xFFFF << offset; pub mod RW {} pub mod R {} pub mod W {} }
        pub mod OEPM { pub const offset: u32 = 16; pub const mask: u32 = 0xFFFF << offset; pub mod RW {} pub mod R {} pub mod W {} }
    }

    pub mod DIEPEMPMSK {
        pub mod INEPTXFEM { pub const offset: u32 = 0; pub const mask: u32 = 0xFFFF << offset; pub mod RW {} pub mod R {} pub mod W {} }
    }
}

/// Computes the address of endpoint `ep`'s FIFO window.
pub(crate) fn fifo_address(base: *const otg::RegisterBlock, ep: usize) -> *mut u32 {
    (base as *mut u8).wrapping_add(FIFO_SPACING * (ep + 1)).cast()
}

/// The register macros treat every register as a struct field, so the
/// per-endpoint IN banks are projected through this view, the same way a
/// numbered endpoint control register would be selected.
pub mod diep {
    use super::{otg, RWRegister};

    pub struct Registers<'a> {
        pub DIEPCTL: &'a RWRegister<u32>,
        pub DIEPINT: &'a RWRegister<u32>,
        pub DIEPTSIZ: &'a RWRegister<u32>,
        pub DTXFSTS: &'a RWRegister<u32>,
    }

    pub fn register(otg: &otg::RegisterBlock, ep: usize) -> Registers<'_> {
        let bank = &otg.ie[ep];
        Registers {
            DIEPCTL: &bank.DIEPCTL,
            DIEPINT: &bank.DIEPINT,
            DIEPTSIZ: &bank.DIEPTSIZ,
            DTXFSTS: &bank.DTXFSTS,
        }
    }

    pub mod DIEPCTL {
        pub mod MPSIZ { pub const offset: u32 = 0; pub const mask: u32 = 0x7FF << offset; pub mod RW {} pub mod R {} pub mod W {} }
        pub mod USBAEP { pub const offset: u32 = 15; pub const mask: u32 = 1 << offset; pub mod RW {} pub mod R {} pub mod W {} }
        pub mod EPTYP { pub const offset: u32 = 18; pub const mask: u32 = 0x3 << offset; pub mod RW {} pub mod R {} pub mod W {} }
        pub mod STALL { pub const offset: u32 = 21; pub const mask: u32 = 1 << offset; pub mod RW {} pub mod R {} pub mod W {} }
        pub mod TXFNUM { pub const offset: u32 = 22; pub const mask: u32 = 0xF << offset; pub mod RW {} pub mod R {} pub mod W {} }
        pub mod CNAK { pub const offset: u32 = 26; pub const mask: u32 = 1 << offset; pub mod RW {} pub mod R {} pub mod W {} }
        pub mod SNAK { pub const offset: u32 = 27; pub const mask: u32 = 1 << offset; pub mod RW {} pub mod R {} pub mod W {} }
        pub mod SD0PID_SEVNFRM { pub const offset: u32 = 28; pub const mask: u32 = 1 << offset; pub mod RW {} pub mod R {} pub mod W {} }
        pub mod EPDIS { pub const offset: u32 = 30; pub const mask: u32 = 1 << offset; pub mod RW {} pub mod R {} pub mod W {} }
        pub mod EPENA { pub const offset: u32 = 31; pub const mask: u32 = 1 << offset; pub mod RW {} pub mod R {} pub mod W {} }
    }

    pub mod DIEPINT {}

    pub mod DIEPTSIZ {
        pub mod XFRSIZ { pub const offset: u32 = 0; pub const mask: u32 = 0x7FFFF << offset; pub mod RW {} pub mod R {} pub mod W {} }
        pub mod PKTCNT { pub const offset: u32 = 19; pub const mask: u32 = 0x3FF << offset; pub mod RW {} pub mod R {} pub mod W {} }
    }

    pub mod DTXFSTS {
        pub mod INEPTFSAV { pub const offset: u32 = 0; pub const mask: u32 = 0xFFFF << offset; pub mod RW {} pub mod R {} pub mod W {} }
    }
}

/// OUT endpoint bank view; see [`diep`].
pub mod doep {
    use super::{otg, RWRegister};

    pub struct Registers<'a> {
        pub DOEPCTL: &'a RWRegister<u32>,
        pub DOEPINT: &'a RWRegister<u32>,
        pub DOEPTSIZ: &'a RWRegister<u32>,
    }

    pub fn register(otg: &otg::RegisterBlock, ep: usize) -> Registers<'_> {
        let bank = &otg.oe[ep];
        Registers {
            DOEPCTL: &bank.DOEPCTL,
            DOEPINT: &bank.DOEPINT,
            DOEPTSIZ: &bank.DOEPTSIZ,
        }
    }

    pub mod DOEPCTL {
        pub mod MPSIZ { pub const offset: u32 = 0; pub const mask: u32 = 0x7FF << offset; pub mod RW {} pub mod R {} pub mod W {} }
        pub mod USBAEP { pub const offset: u32 = 15; pub const mask: u32 = 1 << offset; pub mod RW {} pub mod R {} pub mod W {} }
        pub mod EPTYP { pub const offset: u32 = 18; pub const mask: u32 = 0x3 << offset; pub mod RW {} pub mod R {} pub mod W {} }
        pub mod STALL { pub const offset: u32 = 21; pub const mask: u32 = 1 << offset; pub mod RW {} pub mod R {} pub mod W {} }
        pub mod CNAK { pub const offset: u32 = 26; pub const mask: u32 = 1 << offset; pub mod RW {} pub mod R {} pub mod W {} }
        pub mod SNAK { pub const offset: u32 = 27; pub const mask: u32 = 1 << offset; pub mod RW {} pub mod R {} pub mod W {} }
        pub mod SD0PID_SEVNFRM { pub const offset: u32 = 28; pub const mask: u32 = 1 << offset; pub mod RW {} pub mod R {} pub mod W {} }
        pub mod EPDIS { pub const offset: u32 = 30; pub const mask: u32 = 1 << offset; pub mod RW {} pub mod R {} pub mod W {} }
        pub mod EPENA { pub const offset: u32 = 31; pub const mask: u32 = 1 << offset; pub mod RW {} pub mod R {} pub mod W {} }
    }

    pub mod DOEPINT {}

    pub mod DOEPTSIZ {
        pub mod XFRSIZ { pub const offset: u32 = 0; pub const mask: u32 = 0x7FFFF << offset; pub mod RW {} pub mod R {} pub mod W {} }
        pub mod PKTCNT { pub const offset: u32 = 19; pub const mask: u32 = 0x3FF << offset; pub mod RW {} pub mod R {} pub mod W {} }
        pub mod STUPCNT { pub const offset: u32 = 29; pub const mask: u32 = 0x3 << offset; pub mod RW {} pub mod R {} pub mod W {} }
    }
}

/// Transmit FIFO size registers for endpoints 1 and up.
pub mod dieptxf {
    use super::{otg, RWRegister};

    pub struct Registers<'a> {
        pub DIEPTXF: &'a RWRegister<u32>,
    }

    pub fn register(otg: &otg::RegisterBlock, ep: usize) -> Registers<'_> {
        Registers {
            DIEPTXF: &otg.DIEPTXF[ep - 1],
        }
    }

    pub mod DIEPTXF {
        pub mod INEPTXSA { pub const offset: u32 = 0; pub const mask: u32 = 0xFFFF << offset; pub mod RW {} pub mod R {} pub mod W {} }
        pub mod INEPTXFD { pub const offset: u32 = 16; pub const mask: u32 = 0xFFFF << offset; pub mod RW {} pub mod R {} pub mod W {} }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::otg;

    /// Words covered by a RAM-backed register region: the register block
    /// plus the four FIFO window pages, so pushes and pops in tests land in
    /// owned memory.
    const REGION_WORDS: usize = 0x5000 / 4;

    /// Leaks a zeroed RAM region and returns its base address. Tests
    /// preset register cells by writing through the usual macros.
    pub fn base() -> *const () {
        let region: &'static mut [u32; REGION_WORDS] =
            std::boxed::Box::leak(std::boxed::Box::new([0; REGION_WORDS]));
        region.as_ptr().cast()
    }

    pub fn instance() -> otg::Instance {
        unsafe { otg::Instance::new(base()) }
    }
}
