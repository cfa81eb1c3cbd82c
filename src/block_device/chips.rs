//! Concrete SPI NOR flash parts. Exactly one is wired up per board build,
//! selected by the crate's `flash-*` Cargo features.

use super::FlashChip;

/// Winbond W25Q32JV, 4 MiB, 3-byte addressing.
pub struct W25Q32;

impl FlashChip for W25Q32 {
    const ADDRESS_BYTES: usize = 3;
    const DEVICE_ID: [u8; 3] = [0xEF, 0x40, 0x16];
    const CMD_READ_DATA: u8 = 0x0B;
    const CMD_ERASE_SECTOR: u8 = 0x20;
    const CMD_PROGRAM_PAGE: u8 = 0x02;
}

/// Winbond W25Q256JV, 32 MiB, 4-byte addressing.
pub struct W25Q256;

impl FlashChip for W25Q256 {
    const ADDRESS_BYTES: usize = 4;
    const DEVICE_ID: [u8; 3] = [0xEF, 0x40, 0x19];
    const CMD_READ_DATA: u8 = 0x0C;
    const CMD_ERASE_SECTOR: u8 = 0x21;
    const CMD_PROGRAM_PAGE: u8 = 0x12;
}

/// Micron N25Q128A, 16 MiB, 3-byte addressing.
pub struct N25Q128;

impl FlashChip for N25Q128 {
    const ADDRESS_BYTES: usize = 3;
    const DEVICE_ID: [u8; 3] = [0x20, 0xBA, 0x18];
    const CMD_READ_DATA: u8 = 0x03;
    const CMD_ERASE_SECTOR: u8 = 0x20;
    const CMD_PROGRAM_PAGE: u8 = 0x02;
}
