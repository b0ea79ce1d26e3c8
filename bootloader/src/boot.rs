// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Choosing which slot to start, and what is checked before jumping into it.

use crate::error::Error;
use crate::flash::FlashProgrammer;
use crate::partition::{AppFlag, FlagState, PartitionSlot, SlotId};
use consts::{APP_SIZE, BASE_APP_CURRENT_ADDR, BASE_APP_OLD_ADDR, RAM_SIZE, RAM_START};
use embedded_storage::nor_flash::NorFlash;
use host_protocol::checksum::Crc32Stream;
use host_protocol::{AppHeader, ImageFormat};

const READ_CHUNK: usize = 256;

/// First two words of an application vector table.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct VectorTable {
    /// Initial main stack pointer.
    pub sp: u32,
    /// Reset handler, thumb bit set.
    pub entry: u32,
}

impl VectorTable {
    pub const SIZE: usize = 8;

    pub fn from_bytes(raw: &[u8; Self::SIZE]) -> Self {
        Self {
            sp: u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
            entry: u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]),
        }
    }

    pub fn read<F: NorFlash>(flash: &mut FlashProgrammer<F>, addr: u32) -> Result<Self, Error> {
        let mut raw = [0u8; Self::SIZE];
        flash.read_bytes(addr, &mut raw)?;
        Ok(Self::from_bytes(&raw))
    }

    /// The stack must start in RAM and the reset handler must be thumb code in application flash.
    ///
    /// Backups are bytewise copies of `Current`, so their reset handler points into the
    /// `Current` slot; either slot is accepted.
    pub fn is_plausible(&self) -> bool {
        let sp_ok = self.sp > RAM_START && self.sp <= RAM_START + RAM_SIZE;
        let entry = self.entry & !1;
        let entry_ok = self.entry & 1 == 1 && entry >= BASE_APP_CURRENT_ADDR && entry < BASE_APP_OLD_ADDR + APP_SIZE;
        sp_ok && entry_ok
    }
}

/// Hands the core over to an application.
pub trait BootTarget {
    /// Start the application whose vector table is at `vector_table`.
    ///
    /// # Safety
    ///
    /// `vectors` must have been read from `vector_table` and checked with
    /// [`VectorTable::is_plausible`]. Code in the slot runs with full privileges.
    unsafe fn boot(&mut self, vector_table: u32, vectors: VectorTable) -> !;
}

/// A checked jump, ready for a [`BootTarget`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Jump {
    pub slot: SlotId,
    pub vector_table: u32,
    pub vectors: VectorTable,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BootDecision {
    Boot(SlotId),
    /// Neither slot holds a valid image.
    WaitForUpdate,
}

impl core::fmt::Display for BootDecision {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            BootDecision::Boot(id) => write!(f, "boot {id}"),
            BootDecision::WaitForUpdate => f.write_str("wait for update"),
        }
    }
}

pub struct BootSelector {
    format: ImageFormat,
}

impl BootSelector {
    pub fn new(format: ImageFormat) -> Self {
        Self { format }
    }

    /// Current first, then Old.
    pub fn select<F: NorFlash>(&self, flash: &mut FlashProgrammer<F>) -> BootDecision {
        for id in [SlotId::Current, SlotId::Old] {
            match self.validate(flash, id) {
                Ok(_) => return BootDecision::Boot(id),
                Err(err) => warn!("{} slot not bootable: {}", id, err),
            }
        }
        BootDecision::WaitForUpdate
    }

    /// Check the flag, then the image it describes.
    pub fn validate<F: NorFlash>(&self, flash: &mut FlashProgrammer<F>, id: SlotId) -> Result<AppFlag, Error> {
        let slot = id.slot();
        let flag = match slot.read_flag(flash)? {
            FlagState::Valid(flag) => flag,
            FlagState::Absent | FlagState::Invalid(_) => return Err(Error::InvalidApplication),
        };
        let region = self.format.header_region();
        if flag.size <= region || flag.size > self.format.max_transfer() {
            return Err(Error::SizeExceeded {
                declared: flag.size,
                capacity: self.format.max_transfer(),
            });
        }

        if self.format == ImageFormat::Headered {
            check_header(flash, &slot, flag.size)?;
        }

        let vectors = VectorTable::read(flash, slot.vector_table(self.format))?;
        if !vectors.is_plausible() {
            return Err(Error::InvalidApplication);
        }
        Ok(flag)
    }

    /// Read and check the vector table of a slot right before jumping.
    pub fn prepare<F: NorFlash>(&self, flash: &mut FlashProgrammer<F>, id: SlotId) -> Result<Jump, Error> {
        let vector_table = id.slot().vector_table(self.format);
        let vectors = VectorTable::read(flash, vector_table)?;
        if !vectors.is_plausible() {
            error!("refusing to jump: sp {:#x} entry {:#x}", vectors.sp, vectors.entry);
            return Err(Error::InvalidApplication);
        }
        Ok(Jump {
            slot: id,
            vector_table,
            vectors,
        })
    }

    /// Log the layout and the state of both flags.
    pub fn report<F: NorFlash>(&self, flash: &mut FlashProgrammer<F>) {
        for slot in [PartitionSlot::CURRENT, PartitionSlot::OLD] {
            match slot.read_flag(flash) {
                Ok(FlagState::Valid(flag)) => info!(
                    "{} slot {:#x}: valid, {} bytes, version {}",
                    slot.id,
                    slot.start,
                    flag.size,
                    flag.version
                ),
                Ok(FlagState::Invalid(flag)) => info!("{} slot {:#x}: flag invalid (marker {:#x})", slot.id, slot.start, flag.valid),
                Ok(FlagState::Absent) => info!("{} slot {:#x}: empty", slot.id, slot.start),
                Err(err) => warn!("{} slot {:#x}: flag unreadable: {}", slot.id, slot.start, err),
            }
        }
    }
}

/// Headered images: the header must describe the stored image and its CRC must match flash.
pub(crate) fn check_header<F: NorFlash>(flash: &mut FlashProgrammer<F>, slot: &PartitionSlot, stored: u32) -> Result<AppHeader, Error> {
    let mut raw = [0u8; AppHeader::SIZE];
    flash.read_bytes(slot.start, &mut raw)?;
    let header = AppHeader::from_bytes(&raw).map_err(|err| {
        warn!("{} slot header: {}", slot.id, err);
        Error::InvalidApplication
    })?;
    let payload_start = slot.vector_table(ImageFormat::Headered);
    if header.size != stored - ImageFormat::Headered.header_region() {
        return Err(Error::SizeExceeded {
            declared: header.size,
            capacity: stored - ImageFormat::Headered.header_region(),
        });
    }
    let computed = crc32_range(flash, payload_start, header.size)?;
    if computed != header.crc32 {
        return Err(Error::IntegrityError {
            expected: header.crc32,
            computed,
        });
    }
    Ok(header)
}

/// CRC-32 of a flash range, streamed through a small buffer.
pub(crate) fn crc32_range<F: NorFlash>(flash: &mut FlashProgrammer<F>, start: u32, len: u32) -> Result<u32, Error> {
    let mut crc = Crc32Stream::new();
    let mut buf = [0u8; READ_CHUNK];
    let mut offset = 0;
    while offset < len {
        let n = core::cmp::min(READ_CHUNK as u32, len - offset);
        let piece = &mut buf[..n as usize];
        flash.read_bytes(start + offset, piece)?;
        crc.update(piece);
        offset += n;
    }
    Ok(crc.finalize())
}
