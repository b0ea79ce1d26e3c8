// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Flash programming on top of any [`NorFlash`] driver.
//!
//! Callers use absolute CPU addresses; they are translated to driver offsets relative to
//! [`FLASH_BASE`]. Erases and writes are refused outside the two application slots so the
//! bootloader can never damage itself.

use crate::error::FlashError;
use crate::partition::AppFlag;
use consts::{BASE_APP_CURRENT_ADDR, BASE_APP_OLD_ADDR, APP_SIZE, ERASED_BYTE, FLASH_BASE, FLASH_PAGE, FLASH_SIZE, FLASH_WORD};
use embedded_storage::nor_flash::{NorFlash, NorFlashError, NorFlashErrorKind};

const WRITABLE_START: u32 = BASE_APP_CURRENT_ADDR;
const WRITABLE_END: u32 = BASE_APP_OLD_ADDR + APP_SIZE;

pub struct FlashProgrammer<F> {
    flash: F,
}

impl<F: NorFlash> FlashProgrammer<F> {
    pub fn new(flash: F) -> Self {
        Self { flash }
    }

    pub fn inner(&self) -> &F {
        &self.flash
    }

    pub fn inner_mut(&mut self) -> &mut F {
        &mut self.flash
    }

    /// Erase the page starting at `page_addr`.
    pub fn erase_page(&mut self, page_addr: u32) -> Result<(), FlashError> {
        if page_addr % FLASH_PAGE != 0 {
            return Err(FlashError::Unaligned { addr: page_addr });
        }
        let offset = writable_offset(page_addr, FLASH_PAGE)?;
        self.flash
            .erase(offset, offset + FLASH_PAGE)
            .map_err(|e| driver_error(e, FlashError::Erase { addr: page_addr }))
    }

    /// Erase every page touched by `len` bytes starting at `start`.
    pub fn erase_range(&mut self, start: u32, len: u32) -> Result<(), FlashError> {
        let pages = len.div_ceil(FLASH_PAGE);
        for page in 0..pages {
            self.erase_page(start + page * FLASH_PAGE)?;
        }
        debug!("erased {} pages at {:#x}", pages, start);
        Ok(())
    }

    /// Program `bytes` at `addr`. The region must be erased.
    ///
    /// Bytes are programmed as whole words; a trailing partial word is padded with the
    /// erase value.
    pub fn write_bytes(&mut self, addr: u32, bytes: &[u8]) -> Result<(), FlashError> {
        if addr % FLASH_WORD != 0 {
            return Err(FlashError::Unaligned { addr });
        }
        let padded_len = (bytes.len() as u32).next_multiple_of(FLASH_WORD);
        let offset = writable_offset(addr, padded_len)?;
        let whole = bytes.len() - bytes.len() % FLASH_WORD as usize;

        if whole > 0 {
            self.flash
                .write(offset, &bytes[..whole])
                .map_err(|e| driver_error(e, FlashError::Write { addr }))?;
        }
        let tail = &bytes[whole..];
        if !tail.is_empty() {
            let mut word = [ERASED_BYTE; FLASH_WORD as usize];
            word[..tail.len()].copy_from_slice(tail);
            let tail_addr = addr + whole as u32;
            self.flash
                .write(offset + whole as u32, &word)
                .map_err(|e| driver_error(e, FlashError::Write { addr: tail_addr }))?;
        }
        Ok(())
    }

    /// Read `buf.len()` bytes starting at `addr`, anywhere in flash.
    pub fn read_bytes(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        let len = buf.len() as u32;
        let end = addr.checked_add(len).ok_or(FlashError::OutOfBounds { addr, len })?;
        if addr < FLASH_BASE || end > FLASH_BASE + FLASH_SIZE {
            return Err(FlashError::OutOfBounds { addr, len });
        }
        self.flash
            .read(addr - FLASH_BASE, buf)
            .map_err(|e| driver_error(e, FlashError::Read { addr }))
    }

    /// Erase the flag page at `addr` and write `flag` with a freshly computed CRC.
    pub fn write_flag(&mut self, addr: u32, flag: &AppFlag) -> Result<(), FlashError> {
        let flag = flag.sealed();
        self.erase_page(addr)?;
        self.write_bytes(addr, &flag.to_bytes())
    }
}

/// Driver offset of `len` bytes at `addr`, provided they lie in the application slots.
fn writable_offset(addr: u32, len: u32) -> Result<u32, FlashError> {
    match addr.checked_add(len) {
        Some(end) if addr >= WRITABLE_START && end <= WRITABLE_END => Ok(addr - FLASH_BASE),
        _ => Err(FlashError::OutOfBounds { addr, len }),
    }
}

fn driver_error<E: NorFlashError>(err: E, fallback: FlashError) -> FlashError {
    let addr = match fallback {
        FlashError::Erase { addr } | FlashError::Write { addr } | FlashError::Read { addr } => addr,
        FlashError::OutOfBounds { addr, .. } | FlashError::Unaligned { addr } => addr,
    };
    match err.kind() {
        NorFlashErrorKind::NotAligned => FlashError::Unaligned { addr },
        NorFlashErrorKind::OutOfBounds => FlashError::OutOfBounds { addr, len: 0 },
        _ => fallback,
    }
}
