// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Integrity checks shared by both ends of the link.
//!
//! * CRC-32 (reflected, polynomial `0xEDB88320`, table driven, init and final XOR
//!   `0xFFFFFFFF`) protects persisted structures and payload ranges in flash.
//! * A modulo-256 byte sum is the end-to-end transfer check carried by `CHECKSUM`.
//!   It only catches gross corruption on the wire, it is not collision resistant.

use crc::{Crc, Digest, CRC_32_ISO_HDLC};

static CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// CRC-32 of a byte slice.
pub fn crc32(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

/// Incremental CRC-32, for ranges that are read back from flash in pieces.
pub struct Crc32Stream {
    digest: Digest<'static, u32>,
}

impl Crc32Stream {
    pub fn new() -> Self {
        Self { digest: CRC32.digest() }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.digest.update(data);
    }

    pub fn finalize(self) -> u32 {
        self.digest.finalize()
    }
}

impl Default for Crc32Stream {
    fn default() -> Self {
        Self::new()
    }
}

/// Running modulo-256 sum of payload bytes.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Sum8(u8);

impl Sum8 {
    pub const fn new() -> Self {
        Self(0)
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0 = data.iter().fold(self.0, |acc, b| acc.wrapping_add(*b));
    }

    /// The sum as carried on the wire after `CHECKSUM`.
    pub const fn value(self) -> u32 {
        self.0 as u32
    }
}

/// Modulo-256 sum of a byte slice, widened to the wire representation.
pub fn sum8(data: &[u8]) -> u32 {
    let mut sum = Sum8::new();
    sum.update(data);
    sum.value()
}
