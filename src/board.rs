use embassy_stm32::{peripherals, Peri};

/// Bundles the peripheral handles each driver needs, exactly as acquired
/// from `embassy_stm32::init`. Building the concrete driver objects (the
/// `Spi`, `Adc`, GPIO `Output`/`Input` wrappers and the USB OTG FS device)
/// happens in `main`, which is also where board-specific pin assignments
/// would be swapped for a different hub model.
pub struct Board {
    // External SPI NOR flash bus.
    pub flash_spi: Peri<'static, peripherals::SPI1>,
    pub flash_sck: Peri<'static, peripherals::PA5>,
    pub flash_miso: Peri<'static, peripherals::PA6>,
    pub flash_mosi: Peri<'static, peripherals::PA7>,
    pub flash_cs: Peri<'static, peripherals::PA4>,
    pub flash_dma_tx: Peri<'static, peripherals::DMA2_CH3>,
    pub flash_dma_rx: Peri<'static, peripherals::DMA2_CH0>,

    // MP2639A charger supervisor lines.
    pub charger_mode: Peri<'static, peripherals::PC13>,
    pub charger_chg: Peri<'static, peripherals::PC14>,
    pub charger_current_adc: Peri<'static, peripherals::ADC1>,
    pub charger_current_pin: Peri<'static, peripherals::PA0>,
    pub charger_iset: Peri<'static, peripherals::PB0>,

    // USB OTG FS device (data pins + BCD detection share the OTG FS core).
    pub usb_otg_fs: Peri<'static, peripherals::USB_OTG_FS>,
    pub usb_dp: Peri<'static, peripherals::PA12>,
    pub usb_dm: Peri<'static, peripherals::PA11>,
}

impl Board {
    pub fn new(p: embassy_stm32::Peripherals) -> Self {
        Self {
            flash_spi: p.SPI1,
            flash_sck: p.PA5,
            flash_miso: p.PA6,
            flash_mosi: p.PA7,
            flash_cs: p.PA4,
            flash_dma_tx: p.DMA2_CH3,
            flash_dma_rx: p.DMA2_CH0,

            charger_mode: p.PC13,
            charger_chg: p.PC14,
            charger_current_adc: p.ADC1,
            charger_current_pin: p.PA0,
            charger_iset: p.PB0,

            usb_otg_fs: p.USB_OTG_FS,
            usb_dp: p.PA12,
            usb_dm: p.PA11,
        }
    }
}
