//! Wraps a single hardware SPI bus plus DMA pair into an awaitable
//! single-transfer abstraction.
//!
//! The sequencer itself never touches SPI registers; it is generic over
//! [`SpiBusController`], a narrow trait implemented once against the real
//! `embassy-stm32` SPI+DMA peripherals (an external collaborator per
//! `SPEC_FULL.md` §1). Completion and error are reported back in from
//! interrupt context via [`SpiSequencer::on_tx_complete`],
//! [`SpiSequencer::on_rx_complete`] and [`SpiSequencer::on_error`].

use core::sync::atomic::{AtomicU8, Ordering};

use crate::error::{Error, PbResult};
use crate::os::{request_poll, Status};

/// Whether a command reads from or writes to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpiOp {
    Recv,
    Send,
}

/// Borrowed buffer for one SPI transfer. The sequencer only ever holds this
/// borrow for the duration of the awaitable; the caller must keep the
/// backing storage alive until it resolves.
pub enum SpiBuffer<'a> {
    In(&'a [u8]),
    Out(&'a mut [u8]),
}

impl SpiBuffer<'_> {
    pub fn len(&self) -> usize {
        match self {
            SpiBuffer::In(b) => b.len(),
            SpiBuffer::Out(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One SPI command: a direction, a buffer, and whether to keep `/CS`
/// asserted once the transfer completes (used to chain a command phase into
/// a data phase without releasing the device in between).
pub struct SpiCommand<'a> {
    pub op: SpiOp,
    pub buffer: SpiBuffer<'a>,
    pub keep_cs: bool,
}

impl<'a> SpiCommand<'a> {
    pub fn send(buffer: &'a [u8]) -> Self {
        Self { op: SpiOp::Send, buffer: SpiBuffer::In(buffer), keep_cs: false }
    }

    pub fn send_keep_cs(buffer: &'a [u8]) -> Self {
        Self { op: SpiOp::Send, buffer: SpiBuffer::In(buffer), keep_cs: true }
    }

    pub fn recv(buffer: &'a mut [u8]) -> Self {
        Self { op: SpiOp::Recv, buffer: SpiBuffer::Out(buffer), keep_cs: false }
    }
}

/// Bus state, written by ISRs (via [`SpiSequencer::on_tx_complete`] and
/// friends) and read by the sequencer's own task. `Error` is sticky: once
/// entered, every subsequent `begin` fails with [`Error::Io`] without
/// touching hardware, matching the real controller's behavior of refusing
/// to start a new DMA transfer on a bus left in an unknown state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BusState {
    IdleOrComplete = 0,
    Wait = 1,
    Error = 2,
}

impl BusState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => BusState::Wait,
            2 => BusState::Error,
            _ => BusState::IdleOrComplete,
        }
    }
}

/// Narrow interface to the real SPI+DMA hardware. Implemented once per
/// board; the sequencer and everything built on it are generic over it.
pub trait SpiBusController {
    /// Drives the chip-select line. Active-low; `true` asserts it.
    fn chip_select(&mut self, asserted: bool);

    /// Starts a DMA transfer matching `cmd`. Returns once the transfer has
    /// been handed to the DMA controller, not once it completes; completion
    /// is reported later through the sequencer's ISR-facing methods.
    fn start_transfer(&mut self, cmd: &mut SpiCommand<'_>) -> PbResult<()>;
}

/// The single-transfer awaitable built on top of one [`SpiBusController`].
pub struct SpiSequencer<B: SpiBusController> {
    bus: B,
    state: AtomicU8,
    keep_cs: bool,
}

impl<B: SpiBusController> SpiSequencer<B> {
    pub const fn new(bus: B) -> Self {
        Self { bus, state: AtomicU8::new(BusState::IdleOrComplete as u8), keep_cs: false }
    }

    fn bus_state(&self) -> BusState {
        BusState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_bus_state(&self, state: BusState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Begins a transfer. Asserts `/CS`, starts the DMA transfer, and
    /// returns immediately; poll [`SpiSequencer::poll`] until it resolves.
    ///
    /// Returns [`Error::Busy`] if the bus is already transferring, or
    /// [`Error::Io`] if a previous transfer left it in the sticky `Error`
    /// state.
    pub fn begin(&mut self, mut cmd: SpiCommand<'_>) -> PbResult<()> {
        match self.bus_state() {
            BusState::Wait => return Err(Error::Busy),
            BusState::Error => return Err(Error::Io),
            BusState::IdleOrComplete => {}
        }

        self.keep_cs = cmd.keep_cs;
        self.set_bus_state(BusState::Wait);
        self.bus.chip_select(true);

        if let Err(err) = self.bus.start_transfer(&mut cmd) {
            // The DMA controller rejected the transfer synchronously; no
            // completion interrupt will ever arrive for it, so this does
            // not leave the bus stuck in `Wait`.
            self.set_bus_state(BusState::IdleOrComplete);
            self.bus.chip_select(false);
            return Err(err);
        }
        Ok(())
    }

    /// Polls the in-flight transfer started by [`SpiSequencer::begin`].
    pub fn poll(&mut self) -> Status<()> {
        match self.bus_state() {
            BusState::Wait => Status::Again,
            BusState::Error => Status::Done(Err(Error::Io)),
            BusState::IdleOrComplete => {
                if !self.keep_cs {
                    self.bus.chip_select(false);
                }
                Status::Done(Ok(()))
            }
        }
    }

    /// Called from the TX-DMA-complete interrupt.
    pub fn on_tx_complete(&self) {
        self.set_bus_state(BusState::IdleOrComplete);
        request_poll();
    }

    /// Called from the RX-DMA-complete interrupt.
    pub fn on_rx_complete(&self) {
        self.set_bus_state(BusState::IdleOrComplete);
        request_poll();
    }

    /// Called from the SPI/DMA error interrupt.
    pub fn on_error(&self) {
        self.set_bus_state(BusState::Error);
        request_poll();
    }

    /// Exposes the underlying bus controller for tests that need to inspect
    /// what it recorded after driving a sequence of commands to completion.
    #[cfg(test)]
    pub fn bus(&self) -> &B {
        &self.bus
    }
}
