// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Host stand-ins for the board: RAM flash, a scripted link and a manual clock.

use crate::error::Error;
use crate::partition::{AppFlag, PartitionSlot};
use crate::transport::{Clock, System, Transport};
use consts::{ERASED_BYTE, FLASH_BASE, FLASH_PAGE, FLASH_SIZE, FLASH_WORD, RAM_SIZE, RAM_START};
use core::ops::Range;
use embassy_time::{Duration, Instant};
use embedded_storage::nor_flash::{ErrorType, NorFlash, NorFlashError, NorFlashErrorKind, ReadNorFlash};
use host_protocol::{AppHeader, ImageFormat};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::vec;
use std::vec::Vec;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct MockFlashError(pub NorFlashErrorKind);

impl NorFlashError for MockFlashError {
    fn kind(&self) -> NorFlashErrorKind {
        self.0
    }
}

/// Internal flash held in RAM, with NOR rules: erase sets a page to `0xFF` and a program
/// operation may only target erased bytes.
pub struct MockFlash {
    pub mem: Vec<u8>,
    pub erases: usize,
    /// Erases touching this absolute range fail.
    pub fail_erase: Option<Range<u32>>,
    /// Writes touching this absolute range fail.
    pub fail_write: Option<Range<u32>>,
}

impl Default for MockFlash {
    fn default() -> Self {
        Self::new()
    }
}

impl MockFlash {
    pub fn new() -> Self {
        Self {
            mem: vec![ERASED_BYTE; FLASH_SIZE as usize],
            erases: 0,
            fail_erase: None,
            fail_write: None,
        }
    }

    /// Bytes at an absolute address.
    pub fn bytes(&self, addr: u32, len: usize) -> &[u8] {
        let start = (addr - FLASH_BASE) as usize;
        &self.mem[start..start + len]
    }

    /// Place `image` and a valid flag in `slot`, bypassing the NOR rules.
    pub fn install(&mut self, slot: &PartitionSlot, image: &[u8], version: u32) {
        let start = (slot.start - FLASH_BASE) as usize;
        self.mem[start..start + slot.size as usize].fill(ERASED_BYTE);
        self.mem[start..start + image.len()].copy_from_slice(image);
        let flag = AppFlag::valid(image.len() as u32, version);
        let flag_start = (slot.flag_addr - FLASH_BASE) as usize;
        self.mem[flag_start..flag_start + AppFlag::SIZE].copy_from_slice(&flag.to_bytes());
    }

    fn hits(range: &Option<Range<u32>>, from: u32, to: u32) -> bool {
        range.as_ref().is_some_and(|r| from < r.end && r.start < to)
    }
}

impl ErrorType for MockFlash {
    type Error = MockFlashError;
}

impl ReadNorFlash for MockFlash {
    const READ_SIZE: usize = 1;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        let start = offset as usize;
        let end = start + bytes.len();
        if end > self.mem.len() {
            return Err(MockFlashError(NorFlashErrorKind::OutOfBounds));
        }
        bytes.copy_from_slice(&self.mem[start..end]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.mem.len()
    }
}

impl NorFlash for MockFlash {
    const WRITE_SIZE: usize = FLASH_WORD as usize;
    const ERASE_SIZE: usize = FLASH_PAGE as usize;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        if from % FLASH_PAGE != 0 || to % FLASH_PAGE != 0 || from > to {
            return Err(MockFlashError(NorFlashErrorKind::NotAligned));
        }
        if to as usize > self.mem.len() {
            return Err(MockFlashError(NorFlashErrorKind::OutOfBounds));
        }
        if Self::hits(&self.fail_erase, from + FLASH_BASE, to + FLASH_BASE) {
            return Err(MockFlashError(NorFlashErrorKind::Other));
        }
        self.mem[from as usize..to as usize].fill(ERASED_BYTE);
        self.erases += ((to - from) / FLASH_PAGE) as usize;
        Ok(())
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        if offset % FLASH_WORD != 0 || bytes.len() % FLASH_WORD as usize != 0 {
            return Err(MockFlashError(NorFlashErrorKind::NotAligned));
        }
        let start = offset as usize;
        let end = start + bytes.len();
        if end > self.mem.len() {
            return Err(MockFlashError(NorFlashErrorKind::OutOfBounds));
        }
        if Self::hits(&self.fail_write, offset + FLASH_BASE, end as u32 + FLASH_BASE) {
            return Err(MockFlashError(NorFlashErrorKind::Other));
        }
        if self.mem[start..end].iter().any(|b| *b != ERASED_BYTE) {
            return Err(MockFlashError(NorFlashErrorKind::Other));
        }
        self.mem[start..end].copy_from_slice(bytes);
        Ok(())
    }
}

/// Clock that only moves when told to. Clones share the same time.
#[derive(Clone, Default)]
pub struct MockClock {
    now_ms: Arc<AtomicU64>,
}

impl MockClock {
    pub fn advance(&self, by: Duration) {
        self.now_ms.fetch_add(by.as_millis(), Ordering::SeqCst);
    }
}

impl Clock for MockClock {
    fn now(&self) -> Instant {
        Instant::from_millis(self.now_ms.load(Ordering::SeqCst))
    }
}

/// What the gateway side of a [`MockLink`] does next.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Event {
    Bytes(Vec<u8>),
    /// The line stays quiet this long.
    Silence(Duration),
    /// The next read fails.
    Fault,
}

/// Link that replays a script of gateway events and records everything the target sends.
///
/// Reads advance the shared clock: by the silence they consume, or by the full timeout
/// once the script is exhausted.
pub struct MockLink {
    script: VecDeque<Event>,
    clock: MockClock,
    pub sent: Vec<u8>,
}

impl MockLink {
    pub fn new(clock: MockClock) -> Self {
        Self {
            script: VecDeque::new(),
            clock,
            sent: Vec::new(),
        }
    }

    pub fn push(&mut self, event: Event) -> &mut Self {
        self.script.push_back(event);
        self
    }

    pub fn bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.push(Event::Bytes(bytes.to_vec()))
    }

    pub fn silence(&mut self, duration: Duration) -> &mut Self {
        self.push(Event::Silence(duration))
    }

    pub fn is_drained(&self) -> bool {
        self.script.is_empty()
    }
}

impl Transport for MockLink {
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, Error> {
        loop {
            match self.script.front_mut() {
                None => {
                    self.clock.advance(timeout);
                    return Err(Error::TransportTimeout);
                }
                Some(Event::Fault) => {
                    self.script.pop_front();
                    return Err(Error::TransportError);
                }
                Some(Event::Silence(left)) => {
                    if *left > timeout {
                        *left = *left - timeout;
                        self.clock.advance(timeout);
                        return Err(Error::TransportTimeout);
                    }
                    self.clock.advance(*left);
                    self.script.pop_front();
                }
                Some(Event::Bytes(bytes)) => {
                    let n = core::cmp::min(buf.len(), bytes.len());
                    buf[..n].copy_from_slice(&bytes[..n]);
                    bytes.drain(..n);
                    if bytes.is_empty() {
                        self.script.pop_front();
                    }
                    if n > 0 {
                        return Ok(n);
                    }
                }
            }
        }
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.sent.extend_from_slice(bytes);
        Ok(())
    }
}

/// Records delays and refuses to reset.
#[derive(Default)]
pub struct MockSystem {
    pub delays_ms: Vec<u32>,
}

impl System for MockSystem {
    fn delay_ms(&mut self, ms: u32) {
        self.delays_ms.push(ms);
    }

    fn reset(&mut self) -> ! {
        panic!("device reset after {:?} ms of delays", self.delays_ms)
    }
}

/// A startable image of `len` bytes for the `Current` slot.
///
/// The vector table points the stack at the top of RAM and the reset handler into the
/// slot; the rest is a pattern derived from `seed`. Headered images carry a header region
/// describing the payload.
pub fn app_image(len: usize, seed: u8, format: ImageFormat, version: u32) -> Vec<u8> {
    let region = format.header_region() as usize;
    assert!(len > region + 8, "image too short for a vector table");
    let payload_len = len - region;
    let vector_table = PartitionSlot::CURRENT.vector_table(format);

    let mut payload: Vec<u8> = (0..payload_len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect();
    payload[0..4].copy_from_slice(&(RAM_START + RAM_SIZE).to_le_bytes());
    payload[4..8].copy_from_slice(&(vector_table + 0x101).to_le_bytes());

    match format {
        ImageFormat::Raw => payload,
        ImageFormat::Headered => {
            let mut image = AppHeader::for_payload(&payload, version).region().to_vec();
            image.extend_from_slice(&payload);
            image
        }
    }
}
