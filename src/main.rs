#![no_std]
#![no_main]

mod block_device;
mod board;
mod charger;
mod error;
mod init_busy;
mod os;
mod spi;
mod usb;

use core::cell::RefCell;

use critical_section::Mutex;
use embassy_stm32::adc::Adc;
use embassy_stm32::gpio::{Input, Level, Output, Pull, Speed};
use embassy_stm32::pac;
use embassy_stm32::peripherals;
use embassy_stm32::spi::{Config as SpiConfig, Spi};
use embassy_stm32::time::Hertz;
use embassy_stm32::Peri;
use embassy_time::Instant;
use static_cell::StaticCell;

use {defmt_rtt as _, panic_probe as _};

#[cfg(feature = "flash-w25q32")]
use block_device::chips::W25Q32;
#[cfg(feature = "flash-w25q256")]
use block_device::chips::W25Q256;
#[cfg(feature = "flash-n25q128")]
use block_device::chips::N25Q128;
use block_device::{BlockDeviceEngine, IdProbeOp, ReadOp};
use charger::{ChargerOutputs, ChargerProcess, CurrentLimit};
use error::PbResult;
use os::{Process, Status};
use spi::{SpiBuffer, SpiBusController, SpiCommand};
use usb::{BcdHardware, UsbProcess, UsbTransport};

#[cfg(all(feature = "flash-w25q32", feature = "flash-w25q256"))]
compile_error!("select exactly one flash-* feature");
#[cfg(all(feature = "flash-w25q32", feature = "flash-n25q128"))]
compile_error!("select exactly one flash-* feature");
#[cfg(all(feature = "flash-w25q256", feature = "flash-n25q128"))]
compile_error!("select exactly one flash-* feature");

#[cfg(feature = "flash-w25q32")]
type SelectedFlashChip = W25Q32;
#[cfg(feature = "flash-w25q256")]
type SelectedFlashChip = W25Q256;
#[cfg(feature = "flash-n25q128")]
type SelectedFlashChip = N25Q128;

/// First byte offset on the flash part handed out to the block device's
/// user-visible area; everything before it is reserved for the bootloader.
const FLASH_FIRST_SAFE_WRITE_ADDRESS: u32 = 64 * 1024;

/// Smallest capacity among the supported parts (W25Q32, 4 MiB), minus the
/// reserved bootloader region.
const FLASH_STORAGE_SIZE: u32 = 4 * 1024 * 1024 - FLASH_FIRST_SAFE_WRITE_ADDRESS;

type Engine = BlockDeviceEngine<SelectedFlashChip, FlashSpiBus>;

// ---------------------------------------------------------------------
// SPI NOR flash bus
// ---------------------------------------------------------------------

/// Blocking SPI transport for the external NOR flash.
///
/// The real hardware uses DMA and reports completion through an interrupt;
/// this board wiring drives the bus with `embassy-stm32`'s blocking SPI API
/// instead and has the driving process call [`Engine::on_tx_complete`] /
/// [`Engine::on_rx_complete`] immediately after each step, since by the time
/// `start_transfer` returns the transfer is already done. A DMA-backed board
/// would instead bind those calls to the real completion interrupt.
struct FlashSpiBus {
    spi: Spi<'static, embassy_stm32::mode::Blocking>,
    cs: Output<'static>,
}

impl SpiBusController for FlashSpiBus {
    fn chip_select(&mut self, asserted: bool) {
        self.cs.set_level(if asserted { Level::Low } else { Level::High });
    }

    fn start_transfer(&mut self, cmd: &mut SpiCommand<'_>) -> PbResult<()> {
        let result = match &mut cmd.buffer {
            SpiBuffer::In(buf) => self.spi.blocking_write(buf),
            SpiBuffer::Out(buf) => self.spi.blocking_read(buf),
        };
        result.map_err(|_| error::Error::Io)
    }
}

/// One-shot flash bring-up: probes the device ID, then reads the first
/// block-device page as a smoke test of the read path before handing the
/// engine off for application use.
enum BringupPhase {
    Probing(IdProbeOp),
    ReadingFirstPage(ReadOp),
    Ready,
}

struct Bringup {
    engine: Engine,
    phase: BringupPhase,
}

static FIRST_PAGE_BUF: StaticCell<[u8; 256]> = StaticCell::new();
static BRINGUP: Mutex<RefCell<Option<Bringup>>> = Mutex::new(RefCell::new(None));
static FLASH_PROCESS: Process = Process::new(flash_bringup_step);

fn flash_bringup_step() -> Status {
    critical_section::with(|cs| {
        let mut slot = BRINGUP.borrow(cs).borrow_mut();
        let bringup = slot.as_mut().expect("flash process polled before init");

        loop {
            match &mut bringup.phase {
                BringupPhase::Probing(op) => {
                    let result = bringup.engine.probe_step(op);
                    bringup.engine.on_tx_complete();
                    bringup.engine.on_rx_complete();
                    match result {
                        Status::Again => return Status::Again,
                        Status::Done(Err(e)) => return Status::Done(Err(e)),
                        Status::Done(Ok(false)) => {
                            defmt::error!("flash device id mismatch, boot stalled");
                            return Status::Done(Err(error::Error::NoDev));
                        }
                        Status::Done(Ok(true)) => {
                            init_busy::init_busy_down();
                            let buf = FIRST_PAGE_BUF.init([0; 256]);
                            match bringup.engine.read_begin(0, buf) {
                                Ok(read_op) => {
                                    bringup.phase = BringupPhase::ReadingFirstPage(read_op);
                                }
                                Err(e) => return Status::Done(Err(e)),
                            }
                        }
                    }
                }
                BringupPhase::ReadingFirstPage(op) => {
                    let result = bringup.engine.read_step(op);
                    bringup.engine.on_tx_complete();
                    bringup.engine.on_rx_complete();
                    match result {
                        Status::Again => return Status::Again,
                        Status::Done(Err(e)) => {
                            defmt::warn!("flash first-page read failed: {}", e);
                            return Status::Done(Err(e));
                        }
                        Status::Done(Ok(())) => {
                            defmt::info!("flash bring-up OK, {} bytes user storage", bringup.engine.size());
                            usb::set_max_program_size(bringup.engine.size());
                            bringup.phase = BringupPhase::Ready;
                        }
                    }
                }
                BringupPhase::Ready => return Status::Done(Ok(())),
            }
        }
    })
}

// ---------------------------------------------------------------------
// MP2639A charger GPIO/ADC glue
// ---------------------------------------------------------------------

struct ChargerIo {
    mode: Output<'static>,
    iset: Output<'static>,
    chg: Input<'static>,
    adc: Adc<'static>,
    current_pin: Peri<'static, peripherals::PA0>,
}

impl ChargerOutputs for ChargerIo {
    fn set_enabled(&mut self, enable: bool, limit: CurrentLimit) {
        self.mode.set_level(if enable { Level::Low } else { Level::High });
        // High selects the higher (dedicated/charging-port) current limit;
        // low selects the 500 mA standard-downstream-port default.
        self.iset.set_level(match limit {
            CurrentLimit::NoLimit | CurrentLimit::StdMax => Level::Low,
            CurrentLimit::Charging => Level::High,
        });
    }

    fn read_chg(&mut self) -> bool {
        // Board inverts /CHG with a transistor so that high means charging.
        self.chg.is_high()
    }

    fn read_current_adc(&mut self) -> PbResult<u16> {
        Ok(self.adc.blocking_read(&mut self.current_pin))
    }
}

static CHARGER: Mutex<RefCell<Option<ChargerProcess<ChargerIo>>>> = Mutex::new(RefCell::new(None));
static CHARGER_PROCESS: Process = Process::new(charger_step);

fn charger_step() -> Status {
    critical_section::with(|cs| {
        let mut slot = CHARGER.borrow(cs).borrow_mut();
        let process = slot.as_mut().expect("charger process polled before init");
        process.step(Instant::now())
    })
}

// ---------------------------------------------------------------------
// USB OTG FS: VBUS/BCD detection and data endpoints
// ---------------------------------------------------------------------

/// Raw USB Battery Charging Detection register access.
///
/// Device enumeration and the vendor interface's endpoint descriptors are
/// configured elsewhere (out of scope here, see `SPEC_FULL.md` §1); this
/// type only drives the OTG FS core's BCD detection bits, the one piece of
/// charger-port classification not exposed by any generic USB class API.
struct UsbBcdHw;

impl BcdHardware for UsbBcdHw {
    fn vbus_active(&self) -> bool {
        pac::OTG_FS_GLOBAL.gccfg().read().vbusasen()
    }

    fn enable_dcd(&mut self) {
        pac::OTG_FS_GLOBAL.gccfg().modify(|w| w.set_dcden(true));
    }

    fn disable_dcd(&mut self) {
        pac::OTG_FS_GLOBAL.gccfg().modify(|w| w.set_dcden(false));
    }

    fn dcd_detected(&self) -> bool {
        pac::OTG_FS_GLOBAL.gccfg().read().dcdet()
    }

    fn enable_primary_detect(&mut self) {
        pac::OTG_FS_GLOBAL.gccfg().modify(|w| w.set_pden(true));
    }

    fn disable_primary_detect(&mut self) {
        pac::OTG_FS_GLOBAL.gccfg().modify(|w| w.set_pden(false));
    }

    fn primary_detect_negative(&self) -> bool {
        !pac::OTG_FS_GLOBAL.gccfg().read().pdet()
    }

    fn enable_secondary_detect(&mut self) {
        pac::OTG_FS_GLOBAL.gccfg().modify(|w| w.set_sden(true));
    }

    fn disable_secondary_detect(&mut self) {
        pac::OTG_FS_GLOBAL.gccfg().modify(|w| w.set_sden(false));
    }

    fn secondary_detect_positive(&self) -> bool {
        pac::OTG_FS_GLOBAL.gccfg().read().sdet()
    }
}

/// Raw OTG FS device-mode endpoint access for the Pybricks vendor
/// interface's one bulk IN / bulk OUT pair (endpoint 1) plus the control
/// endpoint's vendor `READ_CHARACTERISTIC` requests (endpoint 0).
///
/// All four methods copy synchronously against the core's packet FIFOs,
/// matching [`UsbTransport`]'s contract directly rather than needing a queue.
struct UsbDataIo {
    _otg: Peri<'static, peripherals::USB_OTG_FS>,
    /// Holds the bulk OUT packet popped by the shared `GRXSTSP` read in
    /// [`UsbDataIo::poll_rx_fifo`] until [`UsbTransport::take_received`]
    /// claims it.
    pending_data: Option<([u8; usb::MAX_PACKET_SIZE], usize)>,
    /// Holds the control-endpoint SETUP packet popped by the same shared
    /// read until [`UsbTransport::take_control_read`] claims it.
    pending_control: Option<[u8; 8]>,
}

const DATA_EP: usize = 1;
const CONTROL_EP: usize = 0;

impl UsbDataIo {
    /// `GRXSTSP` is a destructive pop: one read drains one queued packet's
    /// status, regardless of which endpoint it belongs to. Both
    /// `take_received` and `take_control_read` need to observe it, so this
    /// pops at most once per packet and routes the result to whichever of
    /// `pending_data`/`pending_control` matches, leaving the other `None`.
    fn poll_rx_fifo(&mut self) {
        if self.pending_data.is_some() || self.pending_control.is_some() {
            return;
        }
        let status = pac::OTG_FS_GLOBAL.grxstsp().read();
        let epnum = status.epnum() as usize;
        let bcnt = status.bcnt() as usize;

        let fifo = pac::OTG_FS_FIFO(0);
        let mut buf = [0u8; usb::MAX_PACKET_SIZE];
        let mut read = 0;
        while read < bcnt {
            let word = fifo.read_value();
            let bytes = word.to_le_bytes();
            let n = (bcnt - read).min(4).min(buf.len() - read);
            buf[read..read + n].copy_from_slice(&bytes[..n]);
            read += 4;
        }

        if epnum == CONTROL_EP && bcnt == 8 {
            self.pending_control = Some(buf[..8].try_into().unwrap());
        } else if epnum == DATA_EP {
            self.pending_data = Some((buf, bcnt.min(buf.len())));
        }
        // Any other (epnum, bcnt) pairing — e.g. a control status-stage
        // zero-length packet — names nothing either consumer reads back out.
    }
}

impl UsbTransport for UsbDataIo {
    fn start_transmit(&mut self, buf: &[u8]) {
        let device = pac::OTG_FS_DEVICE;
        device.dieptsiz(DATA_EP).modify(|w| {
            w.set_pktcnt(1);
            w.set_xfrsiz(buf.len() as _);
        });
        device.diepctl(DATA_EP).modify(|w| {
            w.set_cnak(true);
            w.set_epena(true);
        });
        let fifo = pac::OTG_FS_FIFO(DATA_EP);
        for chunk in buf.chunks(4) {
            let mut word = [0u8; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            fifo.write_value(u32::from_le_bytes(word));
        }
        // This board's wiring treats the FIFO push above as transmission
        // completion; a real DMA-backed core would instead call this from
        // the IN-endpoint-transfer-complete interrupt.
        usb::on_tx_complete();
    }

    fn take_received(&mut self, out: &mut [u8]) -> Option<usize> {
        self.poll_rx_fifo();
        let (buf, len) = self.pending_data.take()?;
        let n = len.min(out.len());
        out[..n].copy_from_slice(&buf[..n]);
        Some(n)
    }

    fn rearm_receive(&mut self) {
        pac::OTG_FS_DEVICE.doeptsiz(DATA_EP).modify(|w| {
            w.set_pktcnt(1);
            w.set_xfrsiz(usb::MAX_PACKET_SIZE as _);
        });
        pac::OTG_FS_DEVICE.doepctl(DATA_EP).modify(|w| {
            w.set_cnak(true);
            w.set_epena(true);
        });
    }

    fn take_control_read(&mut self) -> Option<(u16, u16)> {
        self.poll_rx_fifo();
        let setup = self.pending_control.take()?;
        let request_type = setup[0];
        let request = setup[1];
        let value = u16::from_le_bytes([setup[2], setup[3]]);
        let length = u16::from_le_bytes([setup[6], setup[7]]);
        // Only the vendor, device-to-host READ_CHARACTERISTIC request is
        // this driver's concern; standard enumeration requests are handled
        // elsewhere and left untouched here.
        const DIR_AND_TYPE_MASK: u8 = 0xE0;
        const DIR_DEVICE_TO_HOST_TYPE_VENDOR: u8 = 0xC0;
        if request_type & DIR_AND_TYPE_MASK != DIR_DEVICE_TO_HOST_TYPE_VENDOR
            || request != usb::protocol::REQUEST_READ_CHARACTERISTIC
        {
            return None;
        }
        Some((value, length))
    }

    fn send_control_data(&mut self, data: &[u8]) {
        let device = pac::OTG_FS_DEVICE;
        device.dieptsiz(CONTROL_EP).modify(|w| {
            w.set_pktcnt(1);
            w.set_xfrsiz(data.len() as _);
        });
        device.diepctl(CONTROL_EP).modify(|w| {
            w.set_cnak(true);
            w.set_epena(true);
        });
        let fifo = pac::OTG_FS_FIFO(CONTROL_EP);
        for chunk in data.chunks(4) {
            let mut word = [0u8; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            fifo.write_value(u32::from_le_bytes(word));
        }
    }

    fn stall_control(&mut self) {
        pac::OTG_FS_DEVICE.diepctl(CONTROL_EP).modify(|w| w.set_stall(true));
    }
}

static USB_DEVICE: Mutex<RefCell<Option<UsbProcess<UsbBcdHw, UsbDataIo>>>> = Mutex::new(RefCell::new(None));
static USB_PROCESS: Process = Process::new(usb_step);

fn usb_step() -> Status {
    let cancel = USB_PROCESS.request() == os::Request::Cancel;
    if cancel {
        // Consume the request now that this step has observed it, so a past
        // cancellation doesn't keep parking the process once it re-detects
        // VBUS; see `UsbProcess::step`'s `TopPhase::WaitUnplug` handling.
        USB_PROCESS.clear_request();
    }
    critical_section::with(|cs| {
        let mut slot = USB_DEVICE.borrow(cs).borrow_mut();
        let process = slot.as_mut().expect("usb process polled before init");
        process.step(Instant::now(), cancel)
    })
}

// ---------------------------------------------------------------------
// Boot
// ---------------------------------------------------------------------

#[cortex_m_rt::entry]
fn main() -> ! {
    let config = embassy_stm32::Config::default();
    let p = embassy_stm32::init(config);

    let board::Board {
        flash_spi,
        flash_sck,
        flash_miso,
        flash_mosi,
        flash_cs,
        flash_dma_tx,
        flash_dma_rx,
        charger_mode,
        charger_chg,
        charger_current_adc,
        charger_current_pin,
        charger_iset,
        usb_otg_fs,
        usb_dp,
        usb_dm,
    } = board::Board::new(p);

    // This board wiring drives the flash SPI bus with blocking transfers
    // rather than DMA; see `FlashSpiBus`.
    drop((flash_dma_tx, flash_dma_rx));

    let mut spi_config = SpiConfig::default();
    spi_config.frequency = Hertz(20_000_000);
    let spi = Spi::new_blocking(flash_spi, flash_sck, flash_mosi, flash_miso, spi_config);
    let cs = Output::new(flash_cs, Level::High, Speed::VeryHigh);

    init_busy::init_busy_up();
    let mut engine: Engine =
        BlockDeviceEngine::new(FlashSpiBus { spi, cs }, FLASH_FIRST_SAFE_WRITE_ADDRESS, FLASH_STORAGE_SIZE);
    let probe_op = engine.probe_begin().expect("probe_begin never fails");
    critical_section::with(|cs_tok| {
        *BRINGUP.borrow(cs_tok).borrow_mut() = Some(Bringup { engine, phase: BringupPhase::Probing(probe_op) });
    });
    os::start_process(&FLASH_PROCESS);

    let mut adc = Adc::new(charger_current_adc);
    adc.set_sample_time(embassy_stm32::adc::SampleTime::CYCLES56);
    let charger_io = ChargerIo {
        mode: Output::new(charger_mode, Level::High, Speed::Low),
        iset: Output::new(charger_iset, Level::Low, Speed::Low),
        chg: Input::new(charger_chg, Pull::None),
        adc,
        current_pin: charger_current_pin,
    };
    critical_section::with(|cs_tok| {
        *CHARGER.borrow(cs_tok).borrow_mut() = Some(ChargerProcess::new(charger_io));
    });
    os::start_process(&CHARGER_PROCESS);

    // USB D+/D- are driven directly by the OTG FS core once enabled; no
    // further GPIO configuration is needed, so the pins are only held here
    // to keep the peripheral claimed.
    drop((usb_dp, usb_dm));
    pac::OTG_FS_GLOBAL.gccfg().modify(|w| w.set_pwrdwn(true));
    critical_section::with(|cs_tok| {
        *USB_DEVICE.borrow(cs_tok).borrow_mut() = Some(UsbProcess::new(
            UsbBcdHw,
            UsbDataIo { _otg: usb_otg_fs, pending_data: None, pending_control: None },
        ));
    });
    os::start_process(&USB_PROCESS);

    defmt::info!("boot: waiting for init_busy to clear");
    while init_busy::init_busy() != 0 {
        os::run_until_idle();
    }
    defmt::info!("boot complete, entering main loop");

    loop {
        os::run_until_idle();
        cortex_m::asm::wfi();
    }
}
