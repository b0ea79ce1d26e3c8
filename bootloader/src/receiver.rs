// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Page-buffered firmware reception.
//!
//! Incoming bytes are collected into a page sized buffer that is programmed each time it
//! fills. The last partial page is padded to a full flash word before it is programmed.

use crate::error::Error;
use crate::flash::FlashProgrammer;
use crate::transport::{read_exact, Clock, Transport};
use core::ops::Range;
use consts::FLASH_PAGE;
use embassy_time::Duration;
use embedded_storage::nor_flash::NorFlash;
use host_protocol::{Message, CHUNK_SIZE};

const PAGE: usize = FLASH_PAGE as usize;
const PROGRESS_STEP: u32 = 1024;

/// Result of a completed reception.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Received {
    /// Image bytes received, without padding.
    pub bytes_written: u32,
    /// Programmed flash range, padding included.
    pub range: Range<u32>,
}

pub struct FirmwareReceiver {
    base: u32,
    capacity: u32,
    /// Next flash address to program.
    cursor: u32,
    received: u32,
    page: heapless::Vec<u8, PAGE>,
}

impl FirmwareReceiver {
    /// Receive into the erased region starting at `base`, accepting at most `capacity` bytes.
    pub fn new(base: u32, capacity: u32) -> Self {
        Self {
            base,
            capacity,
            cursor: base,
            received: 0,
            page: heapless::Vec::new(),
        }
    }

    pub fn bytes_received(&self) -> u32 {
        self.received
    }

    /// Buffer `bytes`, programming every page that fills up.
    pub fn push<F: NorFlash>(&mut self, flash: &mut FlashProgrammer<F>, mut bytes: &[u8]) -> Result<(), Error> {
        let len = bytes.len() as u32;
        if self.received + len > self.capacity {
            return Err(Error::SizeExceeded {
                declared: self.received + len,
                capacity: self.capacity,
            });
        }
        while !bytes.is_empty() {
            let room = PAGE - self.page.len();
            let (now, rest) = bytes.split_at(core::cmp::min(room, bytes.len()));
            // `now` never exceeds the free room
            let _ = self.page.extend_from_slice(now);
            bytes = rest;
            if self.page.is_full() {
                self.flush(flash)?;
            }
        }
        let before = self.received;
        self.received += len;
        if self.received / PROGRESS_STEP != before / PROGRESS_STEP {
            info!("received {} bytes", self.received);
        }
        Ok(())
    }

    /// Program whatever is still buffered and report what was written.
    pub fn finish<F: NorFlash>(mut self, flash: &mut FlashProgrammer<F>) -> Result<Received, Error> {
        if !self.page.is_empty() {
            self.flush(flash)?;
        }
        Ok(Received {
            bytes_written: self.received,
            range: self.base..self.cursor,
        })
    }

    /// Length-known reception of exactly `len` bytes in acknowledged chunks.
    ///
    /// Each chunk is acknowledged with `CHUNK_ACK` once stored. The final partial page is
    /// programmed before the last acknowledgment.
    pub fn receive_exact<T: Transport, F: NorFlash>(
        mut self,
        link: &mut T,
        flash: &mut FlashProgrammer<F>,
        len: u32,
        timeout: Duration,
    ) -> Result<Received, Error> {
        let mut chunk = [0u8; CHUNK_SIZE];
        while self.received < len {
            let n = core::cmp::min(CHUNK_SIZE as u32, len - self.received) as usize;
            read_exact(link, &mut chunk[..n], timeout)?;
            self.push(flash, &chunk[..n])?;
            if self.received == len && !self.page.is_empty() {
                self.flush(flash)?;
            }
            link.send(Message::ChunkAck)?;
        }
        self.finish(flash)
    }

    /// Receive until the link stays quiet for `idle`, waiting at most `max` overall.
    ///
    /// Silence before the first byte is not the end of the image; receiving nothing at all
    /// within `max` is a timeout.
    pub fn receive_until_idle<T: Transport, C: Clock, F: NorFlash>(
        mut self,
        link: &mut T,
        clock: &C,
        flash: &mut FlashProgrammer<F>,
        idle: Duration,
        max: Duration,
    ) -> Result<Received, Error> {
        let started = clock.now();
        let mut buf = [0u8; 256];
        loop {
            let elapsed = clock.now().duration_since(started);
            if elapsed >= max {
                if self.received == 0 {
                    return Err(Error::TransportTimeout);
                }
                warn!("stream still active after {} ms, closing", max.as_millis());
                break;
            }
            let left = max - elapsed;
            let timeout = if self.received == 0 { left } else { core::cmp::min(idle, left) };
            match link.read(&mut buf, timeout) {
                Ok(n) => self.push(flash, &buf[..n])?,
                Err(Error::TransportTimeout) if self.received > 0 => break,
                Err(Error::TransportTimeout) => {}
                Err(err) => return Err(err),
            }
        }
        debug!("link idle after {} bytes", self.received);
        self.finish(flash)
    }

    fn flush<F: NorFlash>(&mut self, flash: &mut FlashProgrammer<F>) -> Result<(), Error> {
        flash.write_bytes(self.cursor, &self.page)?;
        self.cursor += (self.page.len() as u32).next_multiple_of(consts::FLASH_WORD);
        self.page.clear();
        Ok(())
    }
}
