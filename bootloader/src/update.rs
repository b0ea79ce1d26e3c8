// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! One update attempt: backup, erase, receive, verify, commit.
//!
//! The `Current` flag is the only commit point. It is erased before the first byte of
//! `Current` is touched and written again only after the new image verified, so a failure
//! anywhere in between leaves `Current` unbootable and the backup in `Old` in charge.

use crate::boot::{check_header, BootSelector, VectorTable};
use crate::error::Error;
use crate::flash::FlashProgrammer;
use crate::partition::{AppFlag, FlagState, PartitionSlot, SlotId};
use crate::receiver::{FirmwareReceiver, Received};
use crate::transport::{read_value, Clock, System, Transport};
use crate::{Config, TransferMode};
use embassy_time::Instant;
use embedded_storage::nor_flash::NorFlash;
use host_protocol::checksum::Sum8;
use host_protocol::{ImageFormat, Message};

/// Size of the pieces `Current` is copied to `Old` in.
pub const BACKUP_CHUNK: usize = 256;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SessionState {
    Idle,
    BackupRequested,
    Erasing,
    Receiving,
    Verifying,
    WritingFlag,
    Resetting,
    Failed,
}

/// Bookkeeping of a single attempt. Built per attempt, dropped with it.
#[derive(Clone, Debug)]
pub struct TransferSession {
    pub state: SessionState,
    pub target_slot: SlotId,
    pub bytes_expected: Option<u32>,
    pub bytes_received: u32,
    pub write_cursor: u32,
    pub last_activity: Instant,
}

impl TransferSession {
    pub fn new(target_slot: SlotId, now: Instant) -> Self {
        Self {
            state: SessionState::Idle,
            target_slot,
            bytes_expected: None,
            bytes_received: 0,
            write_cursor: target_slot.slot().start,
            last_activity: now,
        }
    }

    fn enter(&mut self, state: SessionState, now: Instant) {
        debug!("session {} -> {}", self.state, state);
        self.state = state;
        self.last_activity = now;
    }

    fn received(&mut self, received: &Received, now: Instant) {
        self.bytes_received = received.bytes_written;
        self.write_cursor = received.range.end;
        self.last_activity = now;
    }
}

impl core::fmt::Display for SessionState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Debug::fmt(self, f)
    }
}

/// What an attempt committed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Committed {
    pub slot: SlotId,
    pub flag: AppFlag,
}

pub struct UpdateOrchestrator<'a, F> {
    flash: &'a mut FlashProgrammer<F>,
    config: &'a Config,
    last_state: SessionState,
}

impl<'a, F: NorFlash> UpdateOrchestrator<'a, F> {
    pub fn new(flash: &'a mut FlashProgrammer<F>, config: &'a Config) -> Self {
        Self {
            flash,
            config,
            last_state: SessionState::Idle,
        }
    }

    /// State the last attempt ended in.
    pub fn last_state(&self) -> SessionState {
        self.last_state
    }

    /// Serve one update. The gateway's `REQUEST` has already been consumed.
    pub fn serve<T: Transport, C: Clock>(&mut self, link: &mut T, clock: &C) -> Result<Committed, Error> {
        let mut session = TransferSession::new(SlotId::Current, clock.now());
        let result = match self.config.mode {
            TransferMode::Handshake => self.serve_handshake(&mut session, link, clock),
            TransferMode::Stream => self.serve_stream(&mut session, link, clock),
        };
        match result {
            Ok(_) => session.enter(SessionState::Resetting, clock.now()),
            Err(err) => {
                error!("update failed in {}: {}", session.state, err);
                session.enter(SessionState::Failed, clock.now());
            }
        }
        self.last_state = session.state;
        result
    }

    /// Let the last response drain, then restart the device.
    pub fn reset<S: System>(&self, system: &mut S) -> ! {
        info!("resetting in {} ms", self.config.reset_delay_ms);
        system.delay_ms(self.config.reset_delay_ms);
        system.reset()
    }

    fn serve_handshake<T: Transport, C: Clock>(
        &mut self,
        session: &mut TransferSession,
        link: &mut T,
        clock: &C,
    ) -> Result<Committed, Error> {
        let format = self.config.image_format;
        link.send(Message::Ready)?;

        // A REQUEST repeated by the gateway while READY was in flight is harmless.
        let declared = read_value(link, Message::Length, &[Message::Request], self.config.byte_timeout)?;
        session.bytes_expected = Some(declared);
        info!("gateway announced {} bytes", declared);
        if declared <= format.header_region() || declared > format.max_transfer() {
            warn!("rejecting length {} (capacity {})", declared, format.max_transfer());
            link.send(Message::LengthErr)?;
            return Err(Error::SizeExceeded {
                declared,
                capacity: format.max_transfer(),
            });
        }

        if let Err(err) = self.prepare_slot(session, clock, declared) {
            link.send(Message::LengthErr)?;
            return Err(err);
        }
        link.send(Message::LengthOk)?;

        session.enter(SessionState::Receiving, clock.now());
        let slot = session.target_slot.slot();
        let received = FirmwareReceiver::new(slot.start, declared).receive_exact(
            link,
            self.flash,
            declared,
            self.config.byte_timeout,
        )?;
        session.received(&received, clock.now());

        let expected = read_value(link, Message::Checksum, &[], self.config.byte_timeout)?;
        session.enter(SessionState::Verifying, clock.now());
        let version = match self.verify(&slot, declared, expected) {
            Ok(version) => version,
            Err(err) => {
                link.send(Message::ChecksumErr)?;
                return Err(err);
            }
        };

        session.enter(SessionState::WritingFlag, clock.now());
        let flag = AppFlag::valid(declared, version);
        if let Err(err) = slot.commit_flag(self.flash, &flag) {
            link.send(Message::ChecksumErr)?;
            return Err(err.into());
        }
        link.send(Message::ChecksumOk)?;
        Ok(Committed {
            slot: session.target_slot,
            flag,
        })
    }

    fn serve_stream<T: Transport, C: Clock>(
        &mut self,
        session: &mut TransferSession,
        link: &mut T,
        clock: &C,
    ) -> Result<Committed, Error> {
        let format = self.config.image_format;
        self.prepare_slot(session, clock, format.max_transfer())?;
        link.send(Message::Ready)?;

        session.enter(SessionState::Receiving, clock.now());
        let slot = session.target_slot.slot();
        let received = FirmwareReceiver::new(slot.start, format.max_transfer()).receive_until_idle(
            link,
            clock,
            self.flash,
            self.config.idle_threshold,
            self.config.stream_max,
        )?;
        session.received(&received, clock.now());
        info!("streamed {} bytes into {:#x}..{:#x}", received.bytes_written, received.range.start, received.range.end);

        session.enter(SessionState::Verifying, clock.now());
        let size = received.bytes_written;
        if size <= format.header_region() {
            return Err(Error::InvalidApplication);
        }
        let version = match format {
            ImageFormat::Raw => self.next_version(),
            ImageFormat::Headered => check_header(self.flash, &slot, size)?.version,
        };
        let vectors = VectorTable::read(self.flash, slot.vector_table(format))?;
        if !vectors.is_plausible() {
            warn!("streamed image has sp {:#x} entry {:#x}", vectors.sp, vectors.entry);
            return Err(Error::InvalidApplication);
        }

        session.enter(SessionState::WritingFlag, clock.now());
        let flag = AppFlag::valid(size, version);
        slot.commit_flag(self.flash, &flag)?;
        Ok(Committed {
            slot: session.target_slot,
            flag,
        })
    }

    /// Back up `Current` if it is valid, then clear it for `len` new bytes.
    fn prepare_slot<C: Clock>(&mut self, session: &mut TransferSession, clock: &C, len: u32) -> Result<(), Error> {
        let selector = BootSelector::new(self.config.image_format);
        match selector.validate(self.flash, SlotId::Current) {
            Ok(flag) => {
                session.enter(SessionState::BackupRequested, clock.now());
                self.backup(&flag)?;
            }
            Err(err) => info!("no backup, current slot not valid: {}", err),
        }

        session.enter(SessionState::Erasing, clock.now());
        let slot = session.target_slot.slot();
        self.flash.erase_page(slot.flag_addr)?;
        self.flash.erase_range(slot.start, len)?;
        info!("{} slot erased for {} bytes", slot.id, len);
        Ok(())
    }

    /// Copy the valid part of `Current` into `Old`, flag last.
    fn backup(&mut self, flag: &AppFlag) -> Result<(), Error> {
        let from = PartitionSlot::CURRENT;
        let to = PartitionSlot::OLD;
        info!("backing up {} bytes of {} to {}", flag.size, from.id, to.id);
        self.flash.erase_range(to.start, to.size)?;

        let mut buf = [0u8; BACKUP_CHUNK];
        let mut offset = 0;
        while offset < flag.size {
            let n = core::cmp::min(BACKUP_CHUNK as u32, flag.size - offset);
            let piece = &mut buf[..n as usize];
            self.flash.read_bytes(from.start + offset, piece)?;
            self.flash.write_bytes(to.start + offset, piece)?;
            offset += n;
        }
        to.commit_flag(self.flash, &AppFlag::valid(flag.size, flag.version))?;
        Ok(())
    }

    /// Read the received image back and check it against the gateway's sum and, for
    /// headered images, the header CRC. Returns the version to commit.
    fn verify(&mut self, slot: &PartitionSlot, len: u32, expected: u32) -> Result<u32, Error> {
        let mut sum = Sum8::new();
        let mut buf = [0u8; BACKUP_CHUNK];
        let mut offset = 0;
        while offset < len {
            let n = core::cmp::min(BACKUP_CHUNK as u32, len - offset);
            let piece = &mut buf[..n as usize];
            self.flash.read_bytes(slot.start + offset, piece)?;
            sum.update(piece);
            offset += n;
        }
        if sum.value() != expected {
            return Err(Error::IntegrityError {
                expected,
                computed: sum.value(),
            });
        }

        match self.config.image_format {
            ImageFormat::Raw => Ok(self.next_version()),
            ImageFormat::Headered => {
                let header = check_header(self.flash, slot, len)?;
                debug!("header crc {:#x} over {} bytes ok", header.crc32, header.size);
                Ok(header.version)
            }
        }
    }

    /// One past the newest committed version.
    fn next_version(&mut self) -> u32 {
        let version = |slot: PartitionSlot, flash: &mut FlashProgrammer<F>| match slot.read_flag(flash) {
            Ok(FlagState::Valid(flag)) => flag.version,
            _ => 0,
        };
        let current = version(PartitionSlot::CURRENT, self.flash);
        let old = version(PartitionSlot::OLD, self.flash);
        core::cmp::max(current, old).wrapping_add(1)
    }
}
