// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundation.xyz>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Flash map of the target MCU (STM32F103C8-class, 128 KiB flash, 1 KiB pages).
//!
//! The map is split in three regions: the bootloader itself, the `Current` application
//! slot and the `Old` (backup) application slot. Both application slots have the same
//! size and keep their validity flag in their last page.

#![no_std]

/// Base address of the internal flash in the CPU address space.
/// Flash drivers address the memory by offset from this base.
pub const FLASH_BASE: u32 = 0x0800_0000;

/// Total size of the internal flash (128 KiB).
pub const FLASH_SIZE: u32 = 128 * 1024;

/// Size of an erasable flash page in bytes.
pub const FLASH_PAGE: u32 = 1024;

/// Width of a single flash program operation in bytes.
/// Writes are assembled into little-endian words of this size.
pub const FLASH_WORD: u32 = 4;

/// Value read back from erased flash.
pub const ERASED_BYTE: u8 = 0xFF;

/// Start address of the bootloader region.
pub const BASE_BOOTLOADER_ADDR: u32 = FLASH_BASE;

/// Size of the bootloader region (16 KiB). Never written by the bootloader itself.
pub const BOOTLOADER_SIZE: u32 = 16 * 1024;

/// Size of each application slot, flag page included (56 KiB).
pub const APP_SIZE: u32 = 56 * 1024;

/// Start address of the `Current` application slot, directly after the bootloader.
pub const BASE_APP_CURRENT_ADDR: u32 = BASE_BOOTLOADER_ADDR + BOOTLOADER_SIZE;

/// Start address of the `Old` application slot, directly after `Current`.
pub const BASE_APP_OLD_ADDR: u32 = BASE_APP_CURRENT_ADDR + APP_SIZE;

/// Flag page of the `Current` slot (its last page).
pub const APP_CURRENT_FLAG_ADDR: u32 = BASE_APP_CURRENT_ADDR + APP_SIZE - FLASH_PAGE;

/// Flag page of the `Old` slot (its last page).
pub const APP_OLD_FLAG_ADDR: u32 = BASE_APP_OLD_ADDR + APP_SIZE - FLASH_PAGE;

/// Bytes reserved at the start of a slot for the `AppHeader` when images carry one.
/// The application vector table follows this region, which keeps it aligned for VTOR.
pub const HEADER_REGION_SIZE: u32 = 512;

/// Start of SRAM, used to sanity check the initial stack pointer of an image.
pub const RAM_START: u32 = 0x2000_0000;

/// Size of SRAM (20 KiB).
pub const RAM_SIZE: u32 = 20 * 1024;

/// Largest payload a slot can hold: the slot minus its flag page and the optional header region.
pub const fn app_capacity(header_region: u32) -> u32 {
    APP_SIZE - FLASH_PAGE - header_region
}

const _: () = assert!(BASE_APP_OLD_ADDR + APP_SIZE <= FLASH_BASE + FLASH_SIZE);
const _: () = assert!(APP_SIZE % FLASH_PAGE == 0);
const _: () = assert!(BOOTLOADER_SIZE % FLASH_PAGE == 0);
