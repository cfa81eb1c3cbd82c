//! USB device-stack controller: VBUS/BCD detection, the Pybricks wire
//! protocol's TX prioritizer and RX dispatcher, and stdout forwarding.
//!
//! Mirrors `usb_stm32.c`'s structure: a top-level process alternating
//! between "detecting" and "active" phases, with the RX dispatcher running
//! on every poll regardless of phase (an application can subscribe/send
//! commands as soon as enumeration completes, independent of charger
//! detection). [`BcdDetector`] is a self-contained sub-state-machine reused
//! each time the cable is replugged.

pub mod protocol;

use core::cell::RefCell;
use core::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use critical_section::Mutex;
use embassy_time::Instant;

use crate::charger::UsbBcd;
use crate::error::{Error, PbResult};
use crate::os::{Status, Timer};

/// Matches the STM32 USB OTG FS FIFO packet size used throughout this
/// driver's buffers.
pub const MAX_PACKET_SIZE: usize = 64;

/// Size of the opaque status-report blob carried by `EVENT`/`STATUS_REPORT`.
pub const STATUS_REPORT_SIZE: usize = 14;

/// Registered application command handler. Returns a Pybricks protocol
/// error code to report back to the host in a `RESPONSE`.
pub type CommandHandler = fn(&[u8]) -> u32;

/// Narrow interface to the BCD-capable USB PHY. Implemented once per board.
pub trait BcdHardware {
    fn vbus_active(&self) -> bool;
    fn enable_dcd(&mut self);
    fn disable_dcd(&mut self);
    fn dcd_detected(&self) -> bool;
    fn enable_primary_detect(&mut self);
    fn disable_primary_detect(&mut self);
    /// True once the primary-detect settle time has elapsed and PDET read
    /// as clear (i.e. no charging capability on this port).
    fn primary_detect_negative(&self) -> bool;
    fn enable_secondary_detect(&mut self);
    fn disable_secondary_detect(&mut self);
    fn secondary_detect_positive(&self) -> bool;
}

/// Narrow interface to the USB device-mode peripheral's data endpoints.
/// `start_transmit` and `take_received` both copy synchronously, so callers
/// never need to keep a buffer alive past the call.
pub trait UsbTransport {
    /// Copies `buf` into the IN endpoint FIFO and starts transmission.
    /// Completion is reported later via [`on_tx_complete`].
    fn start_transmit(&mut self, buf: &[u8]);
    /// If an OUT packet is pending, copies it into `out` and returns its
    /// length (truncated to `out`'s capacity); `None` if nothing is
    /// pending.
    fn take_received(&mut self, out: &mut [u8]) -> Option<usize>;
    /// Re-arms the OUT endpoint for the next packet.
    fn rearm_receive(&mut self);
    /// If a vendor `READ_CHARACTERISTIC` SETUP packet is pending on the
    /// control endpoint, consumes it and returns its `(wValue, wLength)`.
    /// `None` if nothing is pending, or the pending control request is some
    /// other (out-of-scope) standard request.
    fn take_control_read(&mut self) -> Option<(u16, u16)>;
    /// Sends `data` as the control-transfer IN data stage. The caller has
    /// already truncated `data` to at most the request's `wLength`.
    fn send_control_data(&mut self, data: &[u8]);
    /// Stalls the control endpoint, telling the host the pending
    /// `READ_CHARACTERISTIC` request names no characteristic this driver
    /// serves.
    fn stall_control(&mut self);
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum TxKind {
    None,
    Response,
    Status,
    Stdout,
}

struct TxState {
    response_buf: [u8; protocol::RESPONSE_SIZE],
    response_len: usize,
    status_buf: [u8; 2 + STATUS_REPORT_SIZE],
    status_len: usize,
    stdout_buf: [u8; MAX_PACKET_SIZE],
    stdout_len: usize,
    events_subscribed: bool,
    status_pending: bool,
    last_status: [u8; STATUS_REPORT_SIZE],
    transmitting: bool,
    in_flight: TxKind,
}

impl TxState {
    const fn new() -> Self {
        Self {
            response_buf: [0; protocol::RESPONSE_SIZE],
            response_len: 0,
            status_buf: [0; 2 + STATUS_REPORT_SIZE],
            status_len: 0,
            stdout_buf: [0; MAX_PACKET_SIZE],
            stdout_len: 0,
            events_subscribed: false,
            status_pending: false,
            last_status: [0; STATUS_REPORT_SIZE],
            transmitting: false,
            in_flight: TxKind::None,
        }
    }

    /// Full reset on unplug or a stalled-transmission watchdog: drops the
    /// subscription along with every queued buffer, matching the host
    /// needing to resubscribe after either condition.
    fn reset(&mut self) {
        self.response_len = 0;
        self.status_len = 0;
        self.stdout_len = 0;
        self.transmitting = false;
        self.in_flight = TxKind::None;
        self.events_subscribed = false;
    }

    fn dispatch_subscribe(&mut self, subscribe: bool) {
        self.events_subscribed = subscribe;
        self.response_len = protocol::encode_response(&mut self.response_buf, protocol::error_code::OK);
        // The host expects an immediate status snapshot after subscribing.
        self.status_pending = true;
    }

    fn dispatch_command(&mut self, handler: Option<CommandHandler>, payload: &[u8]) {
        if self.response_len != 0 {
            return;
        }
        if let Some(handler) = handler {
            let code = handler(payload);
            self.response_len = protocol::encode_response(&mut self.response_buf, code);
        }
    }

    fn schedule_status(&mut self, msg: &[u8; STATUS_REPORT_SIZE]) -> bool {
        if self.last_status == *msg {
            return false;
        }
        self.last_status = *msg;
        self.status_pending = true;
        true
    }

    fn try_stdout_tx(&mut self, data: &[u8]) -> PbResult<usize> {
        if !self.events_subscribed {
            return Err(Error::InvalidOp);
        }
        if self.stdout_len != 0 {
            return Err(Error::Again);
        }
        let header = protocol::encode_stdout_header(&mut self.stdout_buf);
        let capacity = self.stdout_buf.len() - header;
        let n = data.len().min(capacity);
        self.stdout_buf[header..header + n].copy_from_slice(&data[..n]);
        self.stdout_len = header + n;
        Ok(n)
    }

    fn stdout_available(&self) -> u32 {
        if !self.events_subscribed {
            u32::MAX
        } else if self.stdout_len != 0 {
            0
        } else {
            (self.stdout_buf.len() - 2) as u32
        }
    }

    /// Picks the next buffer to transmit in strict priority order
    /// (response > status > stdout) and marks it in flight. Returns
    /// `None` if nothing is ready or a transmission is already running.
    fn prioritize_tx(&mut self) -> Option<(TxKind, usize)> {
        if self.transmitting {
            return None;
        }
        if self.response_len != 0 {
            self.transmitting = true;
            self.in_flight = TxKind::Response;
            return Some((TxKind::Response, self.response_len));
        }
        if self.events_subscribed {
            if self.status_pending {
                self.status_pending = false;
                let last = self.last_status;
                let n = protocol::encode_status_report(&mut self.status_buf, &last);
                self.status_len = n;
                self.transmitting = true;
                self.in_flight = TxKind::Status;
                return Some((TxKind::Status, n));
            }
            if self.stdout_len != 0 {
                self.transmitting = true;
                self.in_flight = TxKind::Stdout;
                return Some((TxKind::Stdout, self.stdout_len));
            }
        }
        None
    }

    fn on_tx_complete(&mut self) {
        match self.in_flight {
            TxKind::Response => self.response_len = 0,
            TxKind::Status => self.status_len = 0,
            TxKind::Stdout => self.stdout_len = 0,
            TxKind::None => {}
        }
        self.transmitting = false;
        self.in_flight = TxKind::None;
    }
}

static TX: Mutex<RefCell<TxState>> = Mutex::new(RefCell::new(TxState::new()));
static COMMAND_HANDLER: Mutex<RefCell<Option<CommandHandler>>> = Mutex::new(RefCell::new(None));
static CURRENT_BCD: AtomicU8 = AtomicU8::new(UsbBcd::None as u8);

// -- control-transfer READ_CHARACTERISTIC reads --------------------------

/// Reported as the GATT device name characteristic.
const HUB_NAME: &[u8] = b"Pybricks Hub";
/// Reported as the GATT firmware revision characteristic.
const FIRMWARE_REVISION: &[u8] = env!("CARGO_PKG_VERSION").as_bytes();
/// Reported as the GATT software revision characteristic: the Pybricks wire
/// protocol version this driver speaks, not the crate version.
const PROTOCOL_VERSION: &[u8] = b"1.0.0";

#[cfg(not(feature = "charge-only"))]
const FEATURE_FLAGS: u32 = 0x1;
#[cfg(feature = "charge-only")]
const FEATURE_FLAGS: u32 = 0x0;
const SLOT_COUNT: u32 = 1;

/// Largest buffer any `READ_CHARACTERISTIC` reply needs; comfortably covers
/// both the hub-capabilities blob and the short GATT strings above.
const CHARACTERISTIC_BUF_LEN: usize = 32;

/// Maximum program size the block device will accept, set once flash
/// bring-up completes (see `main.rs`). Zero until then.
static MAX_PROGRAM_SIZE: AtomicU32 = AtomicU32::new(0);

/// Records the maximum program size reported in the hub-capabilities blob.
/// Call once the persistent storage layer knows its own capacity.
pub fn set_max_program_size(size: u32) {
    MAX_PROGRAM_SIZE.store(size, Ordering::Release);
}

fn copy_str(out: &mut [u8; CHARACTERISTIC_BUF_LEN], s: &[u8]) -> usize {
    let n = s.len().min(out.len());
    out[..n].copy_from_slice(&s[..n]);
    n
}

/// Fills `out` with the characteristic value for `value` (a `wValue` from a
/// `READ_CHARACTERISTIC` control request). Returns the number of bytes
/// written, or `None` if `value` names no characteristic this driver serves.
fn fill_characteristic(out: &mut [u8; CHARACTERISTIC_BUF_LEN], value: u16) -> Option<usize> {
    match value {
        protocol::characteristic::GATT_DEVICE_NAME => Some(copy_str(out, HUB_NAME)),
        protocol::characteristic::GATT_FIRMWARE_REVISION => Some(copy_str(out, FIRMWARE_REVISION)),
        protocol::characteristic::GATT_SOFTWARE_REVISION => Some(copy_str(out, PROTOCOL_VERSION)),
        protocol::characteristic::PYBRICKS_HUB_CAPABILITIES => {
            let mut cap = [0u8; protocol::HUB_CAPABILITIES_SIZE];
            protocol::encode_hub_capabilities(
                &mut cap,
                MAX_PACKET_SIZE as u8,
                FEATURE_FLAGS,
                MAX_PROGRAM_SIZE.load(Ordering::Acquire),
                SLOT_COUNT,
            );
            out[..cap.len()].copy_from_slice(&cap);
            Some(cap.len())
        }
        _ => None,
    }
}

/// Registers the handler invoked for incoming `COMMAND` messages.
pub fn set_receive_handler(handler: CommandHandler) {
    critical_section::with(|cs| *COMMAND_HANDLER.borrow(cs).borrow_mut() = Some(handler));
}

/// The most recently classified BCD type, or `None` before enumeration
/// completes.
pub fn current_bcd() -> UsbBcd {
    UsbBcd::from_u8(CURRENT_BCD.load(Ordering::Acquire))
}

/// Whether an application is connected and subscribed to events.
pub fn connection_is_active() -> bool {
    critical_section::with(|cs| TX.borrow(cs).borrow().events_subscribed)
}

/// Queues `data` for transmission as a `WRITE_STDOUT` event. See
/// `SPEC_FULL.md` §4.F for the full contract.
#[cfg(not(feature = "charge-only"))]
pub fn stdout_tx(data: &[u8]) -> PbResult<usize> {
    let result = critical_section::with(|cs| TX.borrow(cs).borrow_mut().try_stdout_tx(data));
    if result.is_ok() {
        crate::os::request_poll();
    }
    result
}

#[cfg(feature = "charge-only")]
pub fn stdout_tx(_data: &[u8]) -> PbResult<usize> {
    Err(Error::NotImplemented)
}

/// Bytes available for the next [`stdout_tx`] call; `u32::MAX` when no
/// application is subscribed (meaning stdout may be discarded freely).
pub fn stdout_tx_available() -> u32 {
    critical_section::with(|cs| TX.borrow(cs).borrow().stdout_available())
}

/// Schedules `msg` to be sent as the next `STATUS_REPORT` event, unless it
/// is byte-for-byte identical to the last one sent.
pub fn schedule_status_update(msg: &[u8; STATUS_REPORT_SIZE]) {
    let changed = critical_section::with(|cs| TX.borrow(cs).borrow_mut().schedule_status(msg));
    if changed {
        crate::os::request_poll();
    }
}

/// Called from the IN-endpoint-transfer-complete interrupt.
pub fn on_tx_complete() {
    critical_section::with(|cs| TX.borrow(cs).borrow_mut().on_tx_complete());
    crate::os::request_poll();
}

#[derive(Clone, Copy)]
enum BcdPhase {
    AwaitVbus,
    AwaitDcdOrTimeout,
    PostDcdSettle,
    PrimarySettle,
    SecondarySettle,
}

/// VBUS + USB Battery Charging Detection sub-state-machine.
pub struct BcdDetector {
    phase: BcdPhase,
    timer: Timer,
}

impl Default for BcdDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl BcdDetector {
    pub const fn new() -> Self {
        Self { phase: BcdPhase::AwaitVbus, timer: Timer::new() }
    }

    pub fn step<H: BcdHardware>(&mut self, hw: &mut H, now: Instant) -> Status<UsbBcd> {
        match self.phase {
            BcdPhase::AwaitVbus => {
                if !hw.vbus_active() {
                    return Status::Again;
                }
                hw.enable_dcd();
                self.timer.set_ms(now, 1000);
                self.phase = BcdPhase::AwaitDcdOrTimeout;
                Status::Again
            }
            BcdPhase::AwaitDcdOrTimeout => {
                if hw.dcd_detected() {
                    self.timer.set_ms(now, 100);
                    self.phase = BcdPhase::PostDcdSettle;
                    Status::Again
                } else if self.timer.is_expired(now) {
                    hw.disable_dcd();
                    Status::Done(Ok(UsbBcd::Nonstandard))
                } else {
                    Status::Again
                }
            }
            BcdPhase::PostDcdSettle => {
                if !self.timer.is_expired(now) {
                    return Status::Again;
                }
                hw.disable_dcd();
                hw.enable_primary_detect();
                self.timer.set_ms(now, 100);
                self.phase = BcdPhase::PrimarySettle;
                Status::Again
            }
            BcdPhase::PrimarySettle => {
                if !self.timer.is_expired(now) {
                    return Status::Again;
                }
                if hw.primary_detect_negative() {
                    hw.disable_primary_detect();
                    return self.finish(hw, UsbBcd::StandardDownstream);
                }
                hw.disable_primary_detect();
                hw.enable_secondary_detect();
                self.timer.set_ms(now, 100);
                self.phase = BcdPhase::SecondarySettle;
                Status::Again
            }
            BcdPhase::SecondarySettle => {
                if !self.timer.is_expired(now) {
                    return Status::Again;
                }
                let bcd =
                    if hw.secondary_detect_positive() { UsbBcd::DedicatedCharging } else { UsbBcd::ChargingDownstream };
                hw.disable_secondary_detect();
                self.finish(hw, bcd)
            }
        }
    }

    /// If VBUS dropped at any point during detection, start over instead of
    /// reporting a classification for a cable that is no longer there.
    fn finish<H: BcdHardware>(&mut self, hw: &mut H, bcd: UsbBcd) -> Status<UsbBcd> {
        if !hw.vbus_active() {
            self.phase = BcdPhase::AwaitVbus;
            return Status::Again;
        }
        Status::Done(Ok(bcd))
    }
}

enum TopPhase {
    Detect,
    Active,
    WaitUnplug,
}

/// Top-level USB device process.
pub struct UsbProcess<H: BcdHardware, T: UsbTransport> {
    hw: H,
    transport: T,
    detector: BcdDetector,
    phase: TopPhase,
    tx_watchdog: Timer,
    rx_buf: [u8; MAX_PACKET_SIZE],
}

impl<H: BcdHardware, T: UsbTransport> UsbProcess<H, T> {
    pub const fn new(hw: H, transport: T) -> Self {
        Self {
            hw,
            transport,
            detector: BcdDetector::new(),
            phase: TopPhase::Detect,
            tx_watchdog: Timer::new(),
            rx_buf: [0; MAX_PACKET_SIZE],
        }
    }

    /// Advances the process by one poll. `cancel_requested` should reflect
    /// the owning [`crate::os::Process`]'s cancel request; the RX
    /// dispatcher and BCD detector keep running regardless so that charger
    /// detection works even when the application protocol is cancelled.
    /// Cancellation is honored immediately in every phase (not just
    /// `Active`), since the caller consumes its own request the moment this
    /// call observes `cancel_requested` and has nowhere else to redeliver it.
    pub fn step(&mut self, now: Instant, cancel_requested: bool) -> Status {
        self.handle_data_in();
        self.handle_control_read();

        if cancel_requested {
            self.phase = TopPhase::WaitUnplug;
        } else {
            match self.phase {
                TopPhase::Detect => match self.detector.step(&mut self.hw, now) {
                    Status::Again => {}
                    Status::Done(Ok(bcd)) => {
                        CURRENT_BCD.store(bcd as u8, Ordering::Release);
                        crate::charger::set_usb_type(bcd);
                        self.phase = TopPhase::Active;
                    }
                    Status::Done(Err(_)) => unreachable!("BCD detection never reports an error"),
                },
                TopPhase::Active => {
                    if !self.hw.vbus_active() {
                        self.phase = TopPhase::WaitUnplug;
                    } else {
                        self.handle_data_out(now);
                    }
                }
                TopPhase::WaitUnplug => {
                    if !self.hw.vbus_active() {
                        critical_section::with(|cs| TX.borrow(cs).borrow_mut().reset());
                        self.detector = BcdDetector::new();
                        self.phase = TopPhase::Detect;
                    }
                }
            }
        }

        Status::Again
    }

    fn handle_data_in(&mut self) {
        let Some(len) = self.transport.take_received(&mut self.rx_buf) else {
            return;
        };
        if len == 0 {
            return;
        }

        match self.rx_buf[0] {
            protocol::out_ep::SUBSCRIBE => {
                let subscribe = len > 1 && self.rx_buf[1] != 0;
                critical_section::with(|cs| TX.borrow(cs).borrow_mut().dispatch_subscribe(subscribe));
            }
            protocol::out_ep::COMMAND => {
                let handler = critical_section::with(|cs| *COMMAND_HANDLER.borrow(cs).borrow());
                let payload_len = len - 1;
                let mut payload = [0u8; MAX_PACKET_SIZE];
                payload[..payload_len].copy_from_slice(&self.rx_buf[1..len]);
                critical_section::with(|cs| {
                    TX.borrow(cs).borrow_mut().dispatch_command(handler, &payload[..payload_len])
                });
            }
            _ => {}
        }

        self.transport.rearm_receive();
    }

    /// Serves a pending `READ_CHARACTERISTIC` control-transfer read, if any.
    /// Runs every poll regardless of `self.phase`, since the host can query
    /// GATT/hub-capabilities characteristics during enumeration, before BCD
    /// detection or the bulk application protocol are up.
    fn handle_control_read(&mut self) {
        let Some((value, length)) = self.transport.take_control_read() else {
            return;
        };
        let mut buf = [0u8; CHARACTERISTIC_BUF_LEN];
        match fill_characteristic(&mut buf, value) {
            Some(len) => {
                let n = len.min(length as usize);
                self.transport.send_control_data(&buf[..n]);
            }
            None => self.transport.stall_control(),
        }
    }

    fn handle_data_out(&mut self, now: Instant) {
        let mut scratch = [0u8; MAX_PACKET_SIZE];
        let send_len = critical_section::with(|cs| {
            let mut tx = TX.borrow(cs).borrow_mut();
            if tx.transmitting {
                if self.tx_watchdog.is_expired(now) {
                    tx.reset();
                }
                return None;
            }
            let (kind, len) = tx.prioritize_tx()?;
            let src: &[u8] = match kind {
                TxKind::Response => &tx.response_buf[..len],
                TxKind::Status => &tx.status_buf[..len],
                TxKind::Stdout => &tx.stdout_buf[..len],
                TxKind::None => return None,
            };
            scratch[..len].copy_from_slice(src);
            Some(len)
        });

        if let Some(len) = send_len {
            self.transport.start_transmit(&scratch[..len]);
            self.tx_watchdog.set_ms(now, 50);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeBcd {
        vbus: bool,
        dcd: bool,
        primary_negative: bool,
        secondary_positive: bool,
    }

    impl BcdHardware for FakeBcd {
        fn vbus_active(&self) -> bool {
            self.vbus
        }
        fn enable_dcd(&mut self) {}
        fn disable_dcd(&mut self) {}
        fn dcd_detected(&self) -> bool {
            self.dcd
        }
        fn enable_primary_detect(&mut self) {}
        fn disable_primary_detect(&mut self) {}
        fn primary_detect_negative(&self) -> bool {
            self.primary_negative
        }
        fn enable_secondary_detect(&mut self) {}
        fn disable_secondary_detect(&mut self) {}
        fn secondary_detect_positive(&self) -> bool {
            self.secondary_positive
        }
    }

    fn drive_to_done(detector: &mut BcdDetector, hw: &mut FakeBcd, start: Instant) -> UsbBcd {
        let mut now = start;
        for _ in 0..10 {
            match detector.step(hw, now) {
                Status::Again => now = now + embassy_time::Duration::from_millis(1100),
                Status::Done(Ok(bcd)) => return bcd,
                Status::Done(Err(_)) => panic!("BCD detection must not fail"),
            }
        }
        panic!("BCD detection did not settle in time");
    }

    #[test]
    fn standard_downstream_port_classification() {
        let mut hw = FakeBcd { vbus: true, dcd: true, primary_negative: true, secondary_positive: false };
        let mut detector = BcdDetector::new();
        let bcd = drive_to_done(&mut detector, &mut hw, Instant::from_millis(0));
        assert_eq!(bcd, UsbBcd::StandardDownstream);
    }

    #[test]
    fn charging_downstream_port_classification() {
        let mut hw = FakeBcd { vbus: true, dcd: true, primary_negative: false, secondary_positive: false };
        let mut detector = BcdDetector::new();
        let bcd = drive_to_done(&mut detector, &mut hw, Instant::from_millis(0));
        assert_eq!(bcd, UsbBcd::ChargingDownstream);
    }

    #[test]
    fn dedicated_charging_port_classification() {
        let mut hw = FakeBcd { vbus: true, dcd: true, primary_negative: false, secondary_positive: true };
        let mut detector = BcdDetector::new();
        let bcd = drive_to_done(&mut detector, &mut hw, Instant::from_millis(0));
        assert_eq!(bcd, UsbBcd::DedicatedCharging);
    }

    #[test]
    fn no_dcd_response_times_out_to_nonstandard() {
        let mut hw = FakeBcd { vbus: true, dcd: false, primary_negative: false, secondary_positive: false };
        let mut detector = BcdDetector::new();
        let bcd = drive_to_done(&mut detector, &mut hw, Instant::from_millis(0));
        assert_eq!(bcd, UsbBcd::Nonstandard);
    }

    #[test]
    fn subscribe_then_identical_status_update_sends_only_once() {
        let mut tx = TxState::new();
        tx.dispatch_subscribe(true);
        assert!(tx.status_pending);
        tx.status_pending = false;

        let msg = [7u8; STATUS_REPORT_SIZE];
        assert!(tx.schedule_status(&msg));
        assert!(!tx.schedule_status(&msg), "identical status must not re-schedule");
    }

    #[test]
    fn response_outranks_status_and_stdout() {
        let mut tx = TxState::new();
        tx.dispatch_subscribe(true);
        tx.stdout_len = 10;
        let (kind, _) = tx.prioritize_tx().unwrap();
        assert!(matches!(kind, TxKind::Response));
    }

    #[test]
    fn status_outranks_stdout_once_response_is_clear() {
        let mut tx = TxState::new();
        tx.events_subscribed = true;
        tx.status_pending = true;
        tx.stdout_len = 10;
        let (kind, _) = tx.prioritize_tx().unwrap();
        assert!(matches!(kind, TxKind::Status));
    }

    #[test]
    fn stdout_tx_rejected_when_not_subscribed() {
        let mut tx = TxState::new();
        assert_eq!(tx.try_stdout_tx(b"hi"), Err(Error::InvalidOp));
    }

    #[test]
    fn stdout_tx_frames_payload_and_reports_busy_until_sent() {
        let mut tx = TxState::new();
        tx.events_subscribed = true;
        let n = tx.try_stdout_tx(b"hello").unwrap();
        assert_eq!(n, 5);
        assert_eq!(&tx.stdout_buf[..2], &[protocol::in_ep::EVENT, protocol::event::WRITE_STDOUT]);
        assert_eq!(&tx.stdout_buf[2..7], b"hello");

        assert_eq!(tx.try_stdout_tx(b"more"), Err(Error::Again));
    }

    #[test]
    fn stdout_tx_truncates_to_buffer_capacity() {
        let mut tx = TxState::new();
        tx.events_subscribed = true;
        let oversized = [b'x'; MAX_PACKET_SIZE * 2];
        let n = tx.try_stdout_tx(&oversized).unwrap();
        assert_eq!(n, MAX_PACKET_SIZE - 2);
    }

    #[test]
    fn command_dispatch_invokes_handler_and_packs_response() {
        fn handler(payload: &[u8]) -> u32 {
            payload.len() as u32
        }
        let mut tx = TxState::new();
        tx.dispatch_command(Some(handler), &[1, 2, 3]);
        assert_eq!(tx.response_len, protocol::RESPONSE_SIZE);
        assert_eq!(u32::from_le_bytes(tx.response_buf[1..5].try_into().unwrap()), 3);
    }

    #[test]
    fn command_dispatch_is_skipped_while_a_response_is_pending() {
        let mut tx = TxState::new();
        tx.response_len = protocol::RESPONSE_SIZE;
        tx.response_buf[1] = 0xAA;
        tx.dispatch_command(Some(|_| 99), &[1]);
        assert_eq!(tx.response_buf[1], 0xAA, "must not overwrite a pending response");
    }

    struct FakeTransport {
        control_read: Option<(u16, u16)>,
        sent_control: Option<heapless::Vec<u8, CHARACTERISTIC_BUF_LEN>>,
        stalled: bool,
        received: Option<heapless::Vec<u8, MAX_PACKET_SIZE>>,
    }

    impl FakeTransport {
        fn new() -> Self {
            Self { control_read: None, sent_control: None, stalled: false, received: None }
        }
    }

    impl UsbTransport for FakeTransport {
        fn start_transmit(&mut self, _buf: &[u8]) {}

        fn take_received(&mut self, out: &mut [u8]) -> Option<usize> {
            let data = self.received.take()?;
            let n = data.len().min(out.len());
            out[..n].copy_from_slice(&data[..n]);
            Some(n)
        }

        fn rearm_receive(&mut self) {}

        fn take_control_read(&mut self) -> Option<(u16, u16)> {
            self.control_read.take()
        }

        fn send_control_data(&mut self, data: &[u8]) {
            let mut v = heapless::Vec::new();
            let _ = v.extend_from_slice(data);
            self.sent_control = Some(v);
        }

        fn stall_control(&mut self) {
            self.stalled = true;
        }
    }

    fn idle_bcd_hw() -> FakeBcd {
        FakeBcd { vbus: false, dcd: false, primary_negative: false, secondary_positive: false }
    }

    #[test]
    fn control_read_serves_device_name() {
        let mut transport = FakeTransport::new();
        transport.control_read = Some((protocol::characteristic::GATT_DEVICE_NAME, 64));
        let mut process = UsbProcess::new(idle_bcd_hw(), transport);

        process.step(Instant::from_millis(0), false);

        let sent = process.transport.sent_control.take().expect("control data must be sent");
        assert_eq!(&sent[..], HUB_NAME);
    }

    #[test]
    fn control_read_truncates_response_to_wlength() {
        let mut transport = FakeTransport::new();
        transport.control_read = Some((protocol::characteristic::GATT_FIRMWARE_REVISION, 2));
        let mut process = UsbProcess::new(idle_bcd_hw(), transport);

        process.step(Instant::from_millis(0), false);

        let sent = process.transport.sent_control.take().expect("control data must be sent");
        assert_eq!(sent.len(), 2, "response must be truncated to wLength");
        assert_eq!(&sent[..], &FIRMWARE_REVISION[..2]);
    }

    #[test]
    fn control_read_serves_hub_capabilities_blob_matching_encoder() {
        set_max_program_size(0x2_0000);
        let expected_program_size = MAX_PROGRAM_SIZE.load(Ordering::Acquire);
        let mut expected = [0u8; protocol::HUB_CAPABILITIES_SIZE];
        protocol::encode_hub_capabilities(
            &mut expected,
            MAX_PACKET_SIZE as u8,
            FEATURE_FLAGS,
            expected_program_size,
            SLOT_COUNT,
        );

        let mut transport = FakeTransport::new();
        transport.control_read = Some((protocol::characteristic::PYBRICKS_HUB_CAPABILITIES, 64));
        let mut process = UsbProcess::new(idle_bcd_hw(), transport);

        process.step(Instant::from_millis(0), false);

        let sent = process.transport.sent_control.take().expect("control data must be sent");
        assert_eq!(&sent[..], &expected[..]);
    }

    #[test]
    fn control_read_stalls_unknown_characteristic() {
        let mut transport = FakeTransport::new();
        transport.control_read = Some((0xFFFF, 64));
        let mut process = UsbProcess::new(idle_bcd_hw(), transport);

        process.step(Instant::from_millis(0), false);

        assert!(process.transport.sent_control.is_none());
        assert!(process.transport.stalled, "an unrecognized characteristic must stall, not hang, the host");
    }

    #[test]
    fn cancel_is_honored_immediately_during_detect() {
        let transport = FakeTransport::new();
        let mut process = UsbProcess::new(idle_bcd_hw(), transport);
        assert!(matches!(process.phase, TopPhase::Detect));

        process.step(Instant::from_millis(0), true);

        assert!(matches!(process.phase, TopPhase::WaitUnplug));
    }
}
