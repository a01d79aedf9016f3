//! On-wire audio packet header.
//!
//! Two bytes prefix every encapsulated audio payload. Byte 0 is the control
//! byte, byte 1 the payload size:
//!
//! ```text
//! byte 0: [tx_queue_level_high:1][fallback:1][reserved:2][crc4:4]
//! byte 1: payload_size (u8)
//! ```
//!
//! Control bits occupy the low bits of byte 0 upward. The CRC-4/ITU covers
//! both bytes with the `crc4` and `reserved` fields zeroed.

use awl_core::crc4_itu;

/// Size of the on-wire header in bytes.
pub const AUDIO_HEADER_SIZE: usize = 2;

/// Decoded audio packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AudioHeader {
    /// The producer-side transmit queue is near-full; receivers pause
    /// drift compensation while this is set.
    pub tx_queue_level_high: bool,
    /// Carrier of the current fallback mode.
    pub fallback: bool,
    /// Reserved bits, zero on the wire.
    pub reserved: u8,
    /// CRC-4/ITU of the header.
    pub crc4: u8,
    /// Payload length in bytes following the header.
    pub payload_size: u8,
}

impl AudioHeader {
    /// Encode into the on-wire byte pair.
    pub fn to_bytes(self) -> [u8; AUDIO_HEADER_SIZE] {
        let control = u8::from(self.tx_queue_level_high)
            | u8::from(self.fallback) << 1
            | (self.reserved & 0x3) << 2
            | (self.crc4 & 0xF) << 4;
        [control, self.payload_size]
    }

    /// Decode from the on-wire byte pair.
    pub fn from_bytes(bytes: [u8; AUDIO_HEADER_SIZE]) -> Self {
        Self {
            tx_queue_level_high: bytes[0] & 0x01 != 0,
            fallback: bytes[0] & 0x02 != 0,
            reserved: (bytes[0] >> 2) & 0x3,
            crc4: (bytes[0] >> 4) & 0xF,
            payload_size: bytes[1],
        }
    }

    /// CRC over the header with `crc4` and `reserved` zeroed.
    pub fn compute_crc(&self) -> u8 {
        let mut cleared = *self;
        cleared.crc4 = 0;
        cleared.reserved = 0;
        crc4_itu(0, &cleared.to_bytes())
    }

    /// True when the carried CRC matches the header contents.
    pub fn crc_is_valid(&self) -> bool {
        self.compute_crc() == self.crc4
    }

    /// Zero `reserved`, then compute and store the CRC.
    pub fn finalize_crc(&mut self) {
        self.reserved = 0;
        self.crc4 = self.compute_crc();
    }
}
