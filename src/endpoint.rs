//! Endpoint descriptors and per-direction transfer state

use crate::queue::{ReceiveQueue, TransmitQueue};
use usb_device::endpoint::EndpointType;

/// Callback invoked from interrupt or pump-task context. Must not block.
pub type EndpointCallback = fn(ep: u8);

/// Immutable per-endpoint configuration, supplied once at activation.
///
/// Callback presence doubles as direction activation: an endpoint direction
/// without a callback is deactivated and removed from the interrupt mask.
pub struct EndpointConfig {
    pub kind: EndpointType,
    /// Invoked when a SETUP packet has arrived (control endpoints only).
    pub setup_cb: Option<EndpointCallback>,
    /// Invoked when an IN transfer has been transmitted in full.
    pub in_cb: Option<EndpointCallback>,
    /// Invoked when an OUT transfer has completed.
    pub out_cb: Option<EndpointCallback>,
    /// Maximum packet size for the IN direction, bytes.
    pub in_max_packet: u16,
    /// Maximum packet size for the OUT direction, bytes.
    pub out_max_packet: u16,
    /// Transmit FIFO region multiplier. Values above one trade FIFO RAM for
    /// fewer fill wake-ups on high-bandwidth IN endpoints.
    pub in_multiplier: u8,
}

/// Device-level configuration.
pub struct UsbConfig {
    /// Invoked after the driver has handled a bus reset.
    pub on_reset: Option<fn()>,
    /// Invoked on every start-of-frame. Leaving this `None` keeps the SOF
    /// interrupt source masked entirely.
    pub on_sof: Option<fn()>,
    /// Control endpoint descriptor, re-applied at every bus reset.
    pub ep0: EndpointConfig,
}

/// EPTYP field encoding for the endpoint control registers.
pub(crate) fn ep_type_bits(kind: EndpointType) -> u32 {
    match kind {
        EndpointType::Control => 0,
        EndpointType::Isochronous { .. } => 1,
        EndpointType::Bulk => 2,
        EndpointType::Interrupt => 3,
    }
}

/// Activation and stall state of one endpoint direction.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EndpointStatus {
    Disabled,
    Stalled,
    Active,
}

/// Where an IN transfer's bytes come from.
#[derive(Clone, Copy)]
pub(crate) enum TxSource {
    Idle,
    /// Claimed by the fill engine; looks busy to everyone else.
    InFlight,
    Buffer { ptr: *const u8 },
    Queue(&'static dyn TransmitQueue),
}

/// One IN endpoint's transfer state.
#[derive(Clone, Copy)]
pub(crate) struct TxTransfer {
    pub source: TxSource,
    /// Total bytes in the transfer.
    pub size: usize,
    /// Bytes pushed to the FIFO so far.
    pub count: usize,
}

impl TxTransfer {
    pub const fn idle() -> Self {
        TxTransfer {
            source: TxSource::Idle,
            size: 0,
            count: 0,
        }
    }

    pub const fn in_flight() -> Self {
        TxTransfer {
            source: TxSource::InFlight,
            size: 0,
            count: 0,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.source, TxSource::Idle)
    }

    pub fn is_complete(&self) -> bool {
        self.count >= self.size
    }

    /// Size of the next packet to push.
    pub fn next_packet(&self, max_packet: usize) -> usize {
        (self.size - self.count).min(max_packet)
    }

    /// Accounts for `n` pushed bytes, advancing a linear source past them.
    pub fn advance(&mut self, n: usize) {
        if let TxSource::Buffer { ptr } = &mut self.source {
            *ptr = ptr.wrapping_add(n);
        }
        self.count += n;
    }

    pub fn reset(&mut self) {
        *self = TxTransfer::idle();
    }
}

/// Where an OUT transfer's bytes go.
#[derive(Clone, Copy)]
pub(crate) enum RxSink {
    Idle,
    Buffer { ptr: *mut u8 },
    Queue(&'static dyn ReceiveQueue),
}

/// One OUT endpoint's transfer state.
#[derive(Clone, Copy)]
pub(crate) struct RxTransfer {
    pub sink: RxSink,
    /// Total bytes expected by the transfer.
    pub size: usize,
    /// Bytes received so far.
    pub count: usize,
}

impl RxTransfer {
    pub const fn idle() -> Self {
        RxTransfer {
            sink: RxSink::Idle,
            size: 0,
            count: 0,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.sink, RxSink::Idle)
    }

    /// Bytes the destination can still hold.
    pub fn capacity(&self) -> usize {
        self.size.saturating_sub(self.count)
    }

    /// Marks the transfer finished but keeps the byte count readable.
    pub fn finish(&mut self) {
        self.sink = RxSink::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_stepping_splits_at_max_packet() {
        let mut tx = TxTransfer {
            source: TxSource::Buffer {
                ptr: core::ptr::null(),
            },
            size: 130,
            count: 0,
        };
        let mut packets = std::vec::Vec::new();
        while !tx.is_complete() {
            let n = tx.next_packet(64);
            packets.push(n);
            tx.advance(n);
        }
        assert_eq!(packets, [64, 64, 2]);
        assert_eq!(tx.count, 130);
    }

    #[test]
    fn only_the_final_packet_may_be_short() {
        for size in 0..200usize {
            for max_packet in [8usize, 16, 64] {
                let mut tx = TxTransfer {
                    source: TxSource::Buffer {
                        ptr: core::ptr::null(),
                    },
                    size,
                    count: 0,
                };
                while !tx.is_complete() {
                    let n = tx.next_packet(max_packet);
                    tx.advance(n);
                    if !tx.is_complete() {
                        assert_eq!(n, max_packet, "short packet mid-transfer");
                    }
                }
            }
        }
    }

    #[test]
    fn zero_length_transfer_is_complete_at_once() {
        let tx = TxTransfer {
            source: TxSource::Buffer {
                ptr: core::ptr::null(),
            },
            size: 0,
            count: 0,
        };
        assert!(tx.is_complete());
    }

    #[test]
    fn linear_source_advances_with_the_count() {
        let buf = [0u8; 16];
        let mut tx = TxTransfer {
            source: TxSource::Buffer {
                ptr: buf.as_ptr(),
            },
            size: 16,
            count: 0,
        };
        tx.advance(6);
        match tx.source {
            TxSource::Buffer { ptr } => assert_eq!(ptr, buf.as_ptr().wrapping_add(6)),
            _ => unreachable!(),
        }
        assert_eq!(tx.count, 6);
    }

    #[test]
    fn endpoint_type_encoding() {
        assert_eq!(ep_type_bits(EndpointType::Control), 0);
        assert_eq!(ep_type_bits(EndpointType::Bulk), 2);
        assert_eq!(ep_type_bits(EndpointType::Interrupt), 3);
    }
}
