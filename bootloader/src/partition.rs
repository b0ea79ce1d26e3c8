// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Application slots and the validity flag kept in the last page of each.

use crate::error::FlashError;
use crate::flash::FlashProgrammer;
use consts::{APP_CURRENT_FLAG_ADDR, APP_OLD_FLAG_ADDR, APP_SIZE, BASE_APP_CURRENT_ADDR, BASE_APP_OLD_ADDR};
use embedded_storage::nor_flash::NorFlash;
use host_protocol::checksum::crc32;
use host_protocol::ImageFormat;

/// Marks a flag page that has been written by the bootloader.
pub const FLAG_MAGIC: u32 = 0xABCD_EF00;
/// `valid` value of a committed image.
pub const VALID_MARKER: u32 = 0xAAAA_AAAA;
pub const INVALID_MARKER: u32 = 0x0000_0000;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SlotId {
    /// The slot applications are linked for and normally boot from.
    Current,
    /// Backup of the last image that was valid in `Current`.
    Old,
}

impl SlotId {
    pub const fn slot(self) -> PartitionSlot {
        match self {
            SlotId::Current => PartitionSlot::CURRENT,
            SlotId::Old => PartitionSlot::OLD,
        }
    }

    pub const fn other(self) -> SlotId {
        match self {
            SlotId::Current => SlotId::Old,
            SlotId::Old => SlotId::Current,
        }
    }
}

impl core::fmt::Display for SlotId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            SlotId::Current => f.write_str("current"),
            SlotId::Old => f.write_str("old"),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PartitionSlot {
    pub id: SlotId,
    pub start: u32,
    /// Slot size, flag page included.
    pub size: u32,
    pub flag_addr: u32,
}

impl PartitionSlot {
    pub const CURRENT: PartitionSlot = PartitionSlot {
        id: SlotId::Current,
        start: BASE_APP_CURRENT_ADDR,
        size: APP_SIZE,
        flag_addr: APP_CURRENT_FLAG_ADDR,
    };

    pub const OLD: PartitionSlot = PartitionSlot {
        id: SlotId::Old,
        start: BASE_APP_OLD_ADDR,
        size: APP_SIZE,
        flag_addr: APP_OLD_FLAG_ADDR,
    };

    pub const fn end(&self) -> u32 {
        self.start + self.size
    }

    /// Address of the application vector table for the given image layout.
    pub const fn vector_table(&self, format: ImageFormat) -> u32 {
        self.start + format.header_region()
    }

    /// Decode the flag page of this slot.
    pub fn read_flag<F: NorFlash>(&self, flash: &mut FlashProgrammer<F>) -> Result<FlagState, FlashError> {
        let mut raw = [0u8; AppFlag::SIZE];
        flash.read_bytes(self.flag_addr, &mut raw)?;
        Ok(AppFlag::from_bytes(&raw).state())
    }

    /// Commit `flag` as the single write that makes the slot bootable.
    pub fn commit_flag<F: NorFlash>(&self, flash: &mut FlashProgrammer<F>, flag: &AppFlag) -> Result<(), FlashError> {
        flash.write_flag(self.flag_addr, flag)?;
        info!("{} slot committed: {} bytes, version {}", self.id, flag.size, flag.version);
        Ok(())
    }
}

/// Validity record of a slot.
///
/// Packed little-endian `magic, valid, size, version, crc32` where `crc32` covers the
/// four words before it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AppFlag {
    pub magic: u32,
    pub valid: u32,
    /// Bytes stored in the slot, header region included.
    pub size: u32,
    pub version: u32,
    pub crc32: u32,
}

/// What was found in a flag page.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FlagState {
    /// No flag was ever written (or the page is erased).
    Absent,
    /// A flag is there but not marked valid, or it is corrupted.
    Invalid(AppFlag),
    Valid(AppFlag),
}

impl AppFlag {
    pub const SIZE: usize = 20;

    /// A committed flag for `size` bytes of image.
    pub fn valid(size: u32, version: u32) -> Self {
        Self {
            magic: FLAG_MAGIC,
            valid: VALID_MARKER,
            size,
            version,
            crc32: 0,
        }
        .sealed()
    }

    /// Copy of the flag with `crc32` recomputed over its fields.
    pub fn sealed(&self) -> Self {
        Self {
            crc32: self.fields_crc(),
            ..*self
        }
    }

    pub fn is_present(&self) -> bool {
        self.magic == FLAG_MAGIC
    }

    pub fn is_valid(&self) -> bool {
        self.is_present() && self.valid == VALID_MARKER && self.crc32 == self.fields_crc()
    }

    pub fn state(self) -> FlagState {
        if !self.is_present() {
            FlagState::Absent
        } else if self.is_valid() {
            FlagState::Valid(self)
        } else {
            FlagState::Invalid(self)
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        for (dst, word) in out
            .chunks_exact_mut(4)
            .zip([self.magic, self.valid, self.size, self.version, self.crc32])
        {
            dst.copy_from_slice(&word.to_le_bytes());
        }
        out
    }

    pub fn from_bytes(raw: &[u8; Self::SIZE]) -> Self {
        let word = |i: usize| u32::from_le_bytes([raw[i], raw[i + 1], raw[i + 2], raw[i + 3]]);
        Self {
            magic: word(0),
            valid: word(4),
            size: word(8),
            version: word(12),
            crc32: word(16),
        }
    }

    fn fields_crc(&self) -> u32 {
        crc32(&self.to_bytes()[..Self::SIZE - 4])
    }
}
