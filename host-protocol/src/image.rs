// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Layout of the firmware image as stored in an application slot.

use crate::checksum::crc32;
use consts::{app_capacity, ERASED_BYTE, HEADER_REGION_SIZE};
use serde::{Deserialize, Serialize};

/// `"APPH"` read as a little-endian word.
pub const APP_HEADER_MAGIC: u32 = 0x4850_5041;

/// How an image is laid out in its slot.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[serde(rename_all = "kebab-case")]
pub enum ImageFormat {
    /// The payload starts with the application vector table.
    #[default]
    Raw,
    /// The payload starts with an [`AppHeader`] region, the vector table follows it.
    Headered,
}

impl ImageFormat {
    /// Bytes in front of the application vector table.
    pub const fn header_region(self) -> u32 {
        match self {
            ImageFormat::Raw => 0,
            ImageFormat::Headered => HEADER_REGION_SIZE,
        }
    }

    /// Largest payload the gateway may announce with `LENGTH`, header region included.
    pub const fn max_transfer(self) -> u32 {
        app_capacity(self.header_region()) + self.header_region()
    }
}

/// Header placed at the start of a slot by the headered image format.
///
/// Packed little-endian `magic, size, version, crc32`; `crc32` covers the `size` payload
/// bytes that follow the header region.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AppHeader {
    pub size: u32,
    pub version: u32,
    pub crc32: u32,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HeaderError {
    TooShort,
    BadMagic(u32),
}

impl core::fmt::Display for HeaderError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            HeaderError::TooShort => write!(f, "header too short"),
            HeaderError::BadMagic(magic) => write!(f, "bad header magic {magic:#010x}"),
        }
    }
}

impl AppHeader {
    /// Encoded size in bytes.
    pub const SIZE: usize = 16;

    /// Describe `payload` (vector table first) with the given version.
    pub fn for_payload(payload: &[u8], version: u32) -> Self {
        Self {
            size: payload.len() as u32,
            version,
            crc32: crc32(payload),
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..4].copy_from_slice(&APP_HEADER_MAGIC.to_le_bytes());
        out[4..8].copy_from_slice(&self.size.to_le_bytes());
        out[8..12].copy_from_slice(&self.version.to_le_bytes());
        out[12..16].copy_from_slice(&self.crc32.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, HeaderError> {
        if bytes.len() < Self::SIZE {
            return Err(HeaderError::TooShort);
        }
        let word = |i: usize| u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        let magic = word(0);
        if magic != APP_HEADER_MAGIC {
            return Err(HeaderError::BadMagic(magic));
        }
        Ok(Self {
            size: word(4),
            version: word(8),
            crc32: word(12),
        })
    }

    /// The full header region as written to flash, padded with the erase value.
    pub fn region(&self) -> [u8; HEADER_REGION_SIZE as usize] {
        let mut region = [ERASED_BYTE; HEADER_REGION_SIZE as usize];
        region[..Self::SIZE].copy_from_slice(&self.to_bytes());
        region
    }
}
