//! Pybricks USB wire protocol: message tags, event types, and the
//! little-endian framing helpers shared by the RX dispatcher and TX
//! prioritizer.

/// OUT-endpoint (host → hub) message tags.
pub mod out_ep {
    pub const SUBSCRIBE: u8 = 1;
    pub const COMMAND: u8 = 2;
}

/// IN-endpoint (hub → host) message tags.
pub mod in_ep {
    pub const RESPONSE: u8 = 1;
    pub const EVENT: u8 = 2;
}

/// `EVENT` sub-types.
pub mod event {
    pub const STATUS_REPORT: u8 = 1;
    pub const WRITE_STDOUT: u8 = 2;
}

/// 32-bit Pybricks protocol error codes, as carried in a `RESPONSE` message.
pub mod error_code {
    pub const OK: u32 = 0;
    pub const FAILED: u32 = 1;
}

/// `READ_CHARACTERISTIC` vendor control-transfer request.
pub const REQUEST_READ_CHARACTERISTIC: u8 = 0x01;

/// GATT characteristic wValues served directly by this driver.
pub mod characteristic {
    pub const GATT_DEVICE_NAME: u16 = 0x2A00;
    pub const GATT_FIRMWARE_REVISION: u16 = 0x2A26;
    pub const GATT_SOFTWARE_REVISION: u16 = 0x2A28;
    pub const PYBRICKS_HUB_CAPABILITIES: u16 = 0x0003;
}

/// Size in bytes of a `RESPONSE` message: 1 tag byte + 4-byte LE error code.
pub const RESPONSE_SIZE: usize = 5;

/// Size in bytes of the hub-capabilities characteristic value.
pub const HUB_CAPABILITIES_SIZE: usize = 1 + 4 + 4 + 4;

/// Writes a `RESPONSE` message (tag + 4-byte LE error code) into `out`.
/// Returns the number of bytes written. Panics if `out` is shorter than
/// [`RESPONSE_SIZE`], which would indicate a misconfigured buffer.
pub fn encode_response(out: &mut [u8], error_code: u32) -> usize {
    out[0] = in_ep::RESPONSE;
    out[1..5].copy_from_slice(&error_code.to_le_bytes());
    RESPONSE_SIZE
}

/// Writes an `EVENT`/`STATUS_REPORT` message into `out`: `[EVENT,
/// STATUS_REPORT, ...status]`. Returns the number of bytes written.
pub fn encode_status_report(out: &mut [u8], status: &[u8]) -> usize {
    out[0] = in_ep::EVENT;
    out[1] = event::STATUS_REPORT;
    out[2..2 + status.len()].copy_from_slice(status);
    2 + status.len()
}

/// Writes an `EVENT`/`WRITE_STDOUT` header into `out[..2]`; the caller
/// appends the payload bytes itself. Returns 2.
pub fn encode_stdout_header(out: &mut [u8]) -> usize {
    out[0] = in_ep::EVENT;
    out[1] = event::WRITE_STDOUT;
    2
}

/// Encodes the Pybricks hub-capabilities characteristic value.
pub fn encode_hub_capabilities(
    out: &mut [u8; HUB_CAPABILITIES_SIZE],
    max_packet_size: u8,
    feature_flags: u32,
    max_program_size: u32,
    slot_count: u32,
) {
    out[0] = max_packet_size.wrapping_sub(1);
    out[1..5].copy_from_slice(&feature_flags.to_le_bytes());
    out[5..9].copy_from_slice(&max_program_size.to_le_bytes());
    out[9..13].copy_from_slice(&slot_count.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_is_framed_little_endian() {
        let mut buf = [0u8; RESPONSE_SIZE];
        let n = encode_response(&mut buf, 0x1020_3040);
        assert_eq!(n, RESPONSE_SIZE);
        assert_eq!(buf, [in_ep::RESPONSE, 0x40, 0x30, 0x20, 0x10]);
    }

    #[test]
    fn status_report_carries_event_header() {
        let mut buf = [0u8; 6];
        let n = encode_status_report(&mut buf, &[1, 2, 3, 4]);
        assert_eq!(n, 6);
        assert_eq!(buf, [in_ep::EVENT, event::STATUS_REPORT, 1, 2, 3, 4]);
    }

    #[test]
    fn hub_capabilities_blob_matches_field_layout() {
        let mut buf = [0u8; HUB_CAPABILITIES_SIZE];
        encode_hub_capabilities(&mut buf, 64, 0xA, 0x1_0000, 20);
        assert_eq!(buf[0], 63);
        assert_eq!(u32::from_le_bytes(buf[1..5].try_into().unwrap()), 0xA);
        assert_eq!(u32::from_le_bytes(buf[5..9].try_into().unwrap()), 0x1_0000);
        assert_eq!(u32::from_le_bytes(buf[9..13].try_into().unwrap()), 20);
    }
}
