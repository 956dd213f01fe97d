use can_bit_timings::CanBitTiming;
use core::cmp::min;
use fdcan::config::FrameTransmissionConfig::ClassicCanOnly;
use fdcan::config::{InterruptLine, NominalBitTiming};
use fdcan::filter::{Action, FilterType, StandardFilter, StandardFilterSlot};
use fdcan::frame::{FrameFormat, TxFrameHeader};
use fdcan::id::{Id, StandardId};
use fdcan::interrupt::{Interrupt, Interrupts};
use fdcan::{self, Fifo0, Mailbox, Mailboxes, NormalOperationMode, ReceiveOverrun};
use heapless::Deque;
use rtic::Mutex;
use rtic_sync::{channel, make_channel};

// Software queued CAN RX and TX over one FDCAN peripheral.
//
// RX: the hardware filter decides which IDs reach software at all; accepted
// frames are forwarded from the IRQ into an rtic-sync channel which the
// 100 ms tick drains. Nothing protocol-related runs in interrupt context.
//
// TX: the tick emits a short fixed burst of frames. They go straight into
// the hardware mailboxes, with a small FIFO spill for moments when the bus
// is busy, refilled from the TX-complete interrupt. Order is preserved;
// there is no cross-frame prioritisation because the vehicle only ever
// sends three IDs back to back.

// CAN RX and TX software queue sizes
const RX_CAPACITY: usize = 16;
const TX_SPILL_CAPACITY: usize = 8;

/// A classic CAN data frame the way the protocol core sees it.
#[derive(Clone, Copy, Debug)]
pub struct RawFrame {
    pub id: u16,
    pub data: [u8; 8],
}

impl defmt::Format for RawFrame {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "CAN frame (id={=u16:x}, data={=[u8]:x})", self.id, self.data);
    }
}

impl RawFrame {
    fn header(&self) -> TxFrameHeader {
        TxFrameHeader {
            len: 8,
            frame_format: FrameFormat::Standard,
            id: Id::Standard(StandardId::new(self.id).unwrap()),
            bit_rate_switching: false,
            marker: None,
        }
    }

    // Function to pass to transmit_preserve(): recover a displaced pending
    // message (fdcan hands the data back as &[u32])
    fn from_pending(_: Mailbox, header: TxFrameHeader, data32: &[u32]) -> Self {
        let mut data = [0_u8; 8];
        let dlen = min(min(header.len as usize, core::mem::size_of_val(data32)), 8);
        unsafe {
            data[..dlen].copy_from_slice(&data32.align_to::<u8>().1[..dlen]);
        }
        let id = match header.id {
            Id::Standard(id) => id.as_raw(),
            Id::Extended(id) => id.standard_id().as_raw(),
        };
        RawFrame { id, data }
    }
}

/// Hardware acceptance filter for exactly two standard IDs into FIFO0.
pub fn dual_filter(id1: u16, id2: u16) -> StandardFilter {
    StandardFilter {
        filter: FilterType::DedicatedDual(
            StandardId::new(id1).unwrap(),
            StandardId::new(id2).unwrap(),
        ),
        action: Action::StoreInFifo0,
    }
}

/// Hardware acceptance filter for an inclusive standard ID range into FIFO0.
pub fn range_filter(from: u16, to: u16) -> StandardFilter {
    StandardFilter {
        filter: FilterType::Range {
            from: StandardId::new(from).unwrap(),
            to: StandardId::new(to).unwrap(),
        },
        action: Action::StoreInFifo0,
    }
}

// Types for each end of the Rx rtic channel

// The receive end is the public interface to receive CAN frames
pub type Rx = channel::Receiver<'static, RawFrame, RX_CAPACITY>;

// The send end is only for internal use
type RxSender = channel::Sender<'static, RawFrame, RX_CAPACITY>;

// Control struct is used when instantiating the queue, and
// by the interrupt handler function
pub struct Control<I: fdcan::Instance> {
    hw: fdcan::FdCanControl<I, NormalOperationMode>,
    hw_rx: fdcan::Rx<I, NormalOperationMode, Fifo0>,
    rx_sender: RxSender,
}

impl<I: fdcan::Instance> Control<I> {
    pub fn init(
        mut can: fdcan::FdCan<I, fdcan::ConfigMode>,
        bit_timings: &CanBitTiming,
        filter: StandardFilter,
    ) -> (Self, Rx, Tx<I>) {
        // Convert the generic bit timings to FDCAN bit timings
        defmt::debug!(
            "CAN prescaler {} bs1 {} bs2 {} sjw {}",
            bit_timings.prescaler,
            bit_timings.bs1,
            bit_timings.bs2,
            bit_timings.sjw
        );
        let btr = NominalBitTiming {
            prescaler: bit_timings.prescaler.try_into().unwrap(),
            seg1: bit_timings.bs1.try_into().unwrap(),
            seg2: bit_timings.bs2.try_into().unwrap(),
            sync_jump_width: bit_timings.sjw.try_into().unwrap(),
        };

        can.set_nominal_bit_timing(btr);
        can.set_standard_filter(StandardFilterSlot::_0, filter);
        can.set_frame_transmit(ClassicCanOnly); // No FD long frame support

        can.enable_interrupt_line(InterruptLine::_1, true); // Swapped in crate, this is line 0
        can.enable_interrupts(
            Interrupts::RX_FIFO0_NEW_MSG
                | Interrupts::ERR_PASSIVE
                | Interrupts::BUS_OFF
                | Interrupts::TX_COMPLETE,
        );
        can.enable_transmission_interrupts(Mailboxes::all());

        // Make the RTIC channel for received messages
        let (rx_sender, rx_receiver) = make_channel!(RawFrame, RX_CAPACITY);

        // Start the CAN peripheral and split it
        let (hw, hw_tx, hw_rx, _hw_rx1) = can.into_normal().split();

        (
            Self {
                hw,
                hw_rx,
                rx_sender,
            },
            rx_receiver,
            Tx::new(hw_tx),
        )
    }

    pub fn on_irq<M>(&mut self, mut m_tx: M)
    where
        M: Mutex<T = Tx<I>>,
    {
        if self.hw.has_interrupt(Interrupt::TxComplete) {
            m_tx.lock(|tx| tx.on_tx_complete());
        } else if self.hw.has_interrupt(Interrupt::RxFifo0NewMsg) {
            self.on_rx_irq();
        } else if self.hw.has_interrupt(Interrupt::ErrPassive) {
            // Normal whenever the other end of the bus is unpowered (charger
            // unplugged, vehicle asleep); the session sees it as CAN silence
            defmt::warn!("CAN error passive");
        } else if self.hw.has_interrupt(Interrupt::BusOff) {
            defmt::warn!("CAN bus off");
        }
        self.hw.clear_interrupts(Interrupts::all());
    }

    fn on_rx_irq(&mut self) {
        let mut buffer = [0_u8; 8];
        let rx_header = match self.hw_rx.receive(buffer.as_mut_slice()) {
            Ok(ReceiveOverrun::NoOverrun(header)) => header,
            Ok(ReceiveOverrun::Overrun(header)) => {
                // Only possible if the buffer were too small, so in Classic
                // CAN it shouldn't ever happen
                defmt::warn!("CAN RX overrun reported");
                header
            }
            // Shouldn't happen unless the RX IRQ fired with nothing received
            Err(err) => {
                defmt::error!("CAN RX internal error {:?}", defmt::Debug2Format(&err));
                return;
            }
        };
        let id = match rx_header.id {
            Id::Standard(id) => id.as_raw(),
            // The filters only pass standard IDs
            Id::Extended(_) => return,
        };
        if self.rx_sender.try_send(RawFrame { id, data: buffer }).is_err() {
            // Both peers repeat their frames every 100 ms; a dropped frame
            // is replaced by the next repetition before anything times out
            defmt::warn!("CAN RX queue full, frame dropped");
        }
    }
}

// Public struct for the Tx side. Unlike Rx this isn't an RTIC queue
// and doesn't block
pub struct Tx<I: fdcan::Instance> {
    can: fdcan::Tx<I, NormalOperationMode>,
    spill: Deque<RawFrame, TX_SPILL_CAPACITY>,
}

impl<I: fdcan::Instance> Tx<I> {
    fn new(can: fdcan::Tx<I, NormalOperationMode>) -> Self {
        Self {
            can,
            spill: Deque::new(),
        }
    }

    pub fn transmit(&mut self, frame: &RawFrame) {
        defmt::trace!("CAN TX {:?}", frame);
        let displaced = match self.can.transmit_preserve(
            frame.header(),
            &frame.data,
            &mut RawFrame::from_pending,
        ) {
            // Preserve the pending TX message that was replaced in hardware
            Ok(Some(pending)) => Some(pending),
            // No free mailbox and nothing worth replacing
            Err(nb::Error::WouldBlock) => Some(*frame),
            _ => None,
        };
        if let Some(frame) = displaced {
            self.enqueue_spill(frame);
        }
    }

    // Called from the TX-complete interrupt to move a backlogged frame into
    // the freed mailbox
    fn on_tx_complete(&mut self) {
        if let Some(frame) = self.spill.pop_front() {
            self.transmit(&frame);
        }
    }

    fn enqueue_spill(&mut self, frame: RawFrame) {
        if self.spill.push_back(frame).is_err() {
            // Everything we send is only useful fresh: if the bus looks
            // gone, drop the backlog and the pending mailboxes with it
            defmt::warn!("CAN TX backlog overflow, clearing");
            self.spill.clear();
            self.can.abort(Mailbox::_0);
            self.can.abort(Mailbox::_1);
            self.can.abort(Mailbox::_2);
        }
    }
}
