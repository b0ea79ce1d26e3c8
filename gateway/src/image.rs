// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Turning the deposited firmware file into the bytes sent to the target.

use consts::ERASED_BYTE;
use host_protocol::{AppHeader, ImageFormat};
use ihex::Record;
use std::path::Path;

#[derive(Debug)]
pub enum ImageError {
    Read(std::io::Error),
    Hex(ihex::ReaderError),
    /// The HEX file has no data records.
    NoData,
    /// A HEX record runs past the end of the 32-bit address space.
    AddressOverflow { addr: u32 },
    Empty,
    TooLarge { len: usize, capacity: usize },
}

impl From<ihex::ReaderError> for ImageError {
    fn from(e: ihex::ReaderError) -> Self {
        ImageError::Hex(e)
    }
}

impl std::fmt::Display for ImageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImageError::Read(e) => write!(f, "failed to read firmware file: {e}"),
            ImageError::Hex(e) => write!(f, "invalid Intel HEX: {e}"),
            ImageError::NoData => write!(f, "Intel HEX file contains no data"),
            ImageError::AddressOverflow { addr } => {
                write!(f, "Intel HEX record at {addr:#010x} runs past the address space")
            }
            ImageError::Empty => write!(f, "firmware file is empty"),
            ImageError::TooLarge { len, capacity } => {
                write!(f, "image of {len} bytes exceeds the slot capacity of {capacity} bytes")
            }
        }
    }
}

impl std::error::Error for ImageError {}

/// Read a firmware file, converting Intel HEX to a flat binary.
pub fn load(path: &Path) -> Result<Vec<u8>, ImageError> {
    let raw = std::fs::read(path).map_err(ImageError::Read)?;
    let is_hex = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("hex"))
        || raw.first() == Some(&b':');
    if is_hex {
        from_hex(&String::from_utf8_lossy(&raw))
    } else {
        Ok(raw)
    }
}

/// Flatten Intel HEX records into one binary based at the lowest address.
///
/// Gaps between records are filled with the flash erase value.
pub fn from_hex(text: &str) -> Result<Vec<u8>, ImageError> {
    let mut upper: u32 = 0;
    let mut blocks: Vec<(u32, Vec<u8>)> = Vec::new();

    for record in ihex::Reader::new(text) {
        match record? {
            Record::Data { offset, value } => blocks.push((upper + u32::from(offset), value)),
            Record::ExtendedLinearAddress(high) => upper = u32::from(high) << 16,
            Record::ExtendedSegmentAddress(segment) => upper = u32::from(segment) << 4,
            Record::EndOfFile => break,
            Record::StartLinearAddress(_) | Record::StartSegmentAddress { .. } => {}
        }
    }

    let base = blocks.iter().map(|(addr, _)| *addr).min().ok_or(ImageError::NoData)?;
    let mut end = base;
    for (addr, data) in &blocks {
        let block_end = addr
            .checked_add(data.len() as u32)
            .ok_or(ImageError::AddressOverflow { addr: *addr })?;
        end = end.max(block_end);
    }
    log::debug!("hex image spans {base:#010x}..{end:#010x}");

    // Checked before allocating the flattened image.
    let len = (end - base) as usize;
    let capacity = consts::app_capacity(ImageFormat::Raw.header_region()) as usize;
    if len > capacity {
        return Err(ImageError::TooLarge { len, capacity });
    }

    let mut image = vec![ERASED_BYTE; len];
    for (addr, data) in blocks {
        let start = (addr - base) as usize;
        image[start..start + data.len()].copy_from_slice(&data);
    }
    Ok(image)
}

/// Bytes to transfer for `payload` in the given layout.
pub fn prepare(payload: Vec<u8>, format: ImageFormat, version: u32) -> Result<Vec<u8>, ImageError> {
    if payload.is_empty() {
        return Err(ImageError::Empty);
    }
    let capacity = consts::app_capacity(format.header_region()) as usize;
    if payload.len() > capacity {
        return Err(ImageError::TooLarge {
            len: payload.len(),
            capacity,
        });
    }
    Ok(match format {
        ImageFormat::Raw => payload,
        ImageFormat::Headered => {
            let header = AppHeader::for_payload(&payload, version);
            log::info!("header: version {}, {} bytes, crc32 {:#010x}", header.version, header.size, header.crc32);
            let mut image = header.region().to_vec();
            image.extend_from_slice(&payload);
            image
        }
    })
}
