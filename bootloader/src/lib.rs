// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Dual-slot update bootloader.
//!
//! On every start the bootloader listens for the gateway's `REQUEST` during a grace window.
//! Without one it boots `Current`, falls back to `Old`, and waits for an update when
//! neither holds a valid image. With one it backs `Current` up into `Old`, receives the new
//! image into `Current`, verifies it, commits its flag and resets.
//!
//! Board support provides the [`NorFlash`](embedded_storage::nor_flash::NorFlash) driver, a
//! [`Transport`], a [`Clock`], a [`System`] and a [`BootTarget`].

#![no_std]

#[cfg(any(test, feature = "mock"))]
extern crate std;

#[macro_use]
mod fmt;

pub mod boot;
pub mod error;
pub mod flash;
#[cfg(feature = "cortex-m")]
pub mod jump_app;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod partition;
pub mod receiver;
pub mod transport;
pub mod update;

#[cfg(test)]
mod tests;

pub use boot::{BootDecision, BootSelector, BootTarget, Jump, VectorTable};
pub use error::{Error, FlashError};
pub use flash::FlashProgrammer;
pub use partition::{AppFlag, FlagState, PartitionSlot, SlotId};
pub use transport::{Clock, System, Transport};
pub use update::{Committed, SessionState, UpdateOrchestrator};

use embassy_time::Duration;
use embedded_storage::nor_flash::NorFlash;
use host_protocol::{ImageFormat, Message};

/// How the image travels over the link.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransferMode {
    /// `LENGTH`, acknowledged chunks, `CHECKSUM`.
    #[default]
    Handshake,
    /// Raw bytes after `READY` until the link goes quiet.
    Stream,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub image_format: ImageFormat,
    pub mode: TransferMode,
    /// How long to listen for `REQUEST` before booting.
    pub grace_window: Duration,
    /// Silence that ends a streamed image.
    pub idle_threshold: Duration,
    /// Upper bound for a streamed image.
    pub stream_max: Duration,
    /// Wait for each expected byte during a handshake session.
    pub byte_timeout: Duration,
    /// Read timeout while listening for `REQUEST`.
    pub poll: Duration,
    pub reset_delay_ms: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            image_format: ImageFormat::Raw,
            mode: TransferMode::Handshake,
            grace_window: Duration::from_secs(5),
            idle_threshold: Duration::from_secs(1),
            stream_max: Duration::from_secs(60),
            byte_timeout: Duration::from_millis(host_protocol::TARGET_BYTE_TIMEOUT_MS),
            poll: Duration::from_millis(100),
            reset_delay_ms: 1000,
        }
    }
}

/// Outcome of one pass of the boot loop.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Step {
    /// Start an application.
    Jump(Jump),
    /// A new image is committed; the device must reset.
    Updated(Committed),
    /// An update attempt was aborted.
    UpdateFailed(Error),
    /// Nothing bootable and no update arrived.
    Waiting,
}

pub struct Bootloader<F, T, C> {
    config: Config,
    flash: FlashProgrammer<F>,
    link: T,
    clock: C,
}

impl<F: NorFlash, T: Transport, C: Clock> Bootloader<F, T, C> {
    pub fn new(config: Config, flash: F, link: T, clock: C) -> Self {
        Self {
            config,
            flash: FlashProgrammer::new(flash),
            link,
            clock,
        }
    }

    pub fn flash(&mut self) -> &mut FlashProgrammer<F> {
        &mut self.flash
    }

    pub fn link(&mut self) -> &mut T {
        &mut self.link
    }

    /// Select a slot, listen for an update, then either serve it or hand out the jump.
    pub fn step(&mut self) -> Step {
        let selector = BootSelector::new(self.config.image_format);
        selector.report(&mut self.flash);
        let decision = selector.select(&mut self.flash);
        info!("boot decision: {}", decision);

        if self.listen_for_request() {
            let mut orchestrator = UpdateOrchestrator::new(&mut self.flash, &self.config);
            return match orchestrator.serve(&mut self.link, &self.clock) {
                Ok(committed) => Step::Updated(committed),
                Err(err) => Step::UpdateFailed(err),
            };
        }

        let BootDecision::Boot(first) = decision else {
            return Step::Waiting;
        };
        for id in [first, first.other()] {
            if id != first && selector.validate(&mut self.flash, id).is_err() {
                continue;
            }
            match selector.prepare(&mut self.flash, id) {
                Ok(jump) => return Step::Jump(jump),
                Err(err) => warn!("cannot start {} slot: {}", id, err),
            }
        }
        Step::Waiting
    }

    /// Run the boot loop forever.
    pub fn run<S: System, B: BootTarget>(mut self, system: &mut S, target: &mut B) -> ! {
        loop {
            match self.step() {
                Step::Jump(jump) => {
                    info!("starting {} slot at {:#x}", jump.slot, jump.vector_table);
                    // SAFETY: `prepare` read the vectors from this table and checked them.
                    unsafe { target.boot(jump.vector_table, jump.vectors) }
                }
                Step::Updated(_) => UpdateOrchestrator::new(&mut self.flash, &self.config).reset(system),
                Step::UpdateFailed(_) | Step::Waiting => {}
            }
        }
    }

    /// Wait up to the grace window for `REQUEST`; anything else on the line is skipped.
    fn listen_for_request(&mut self) -> bool {
        let started = self.clock.now();
        let mut byte = [0u8];
        while self.clock.now().duration_since(started) < self.config.grace_window {
            match self.link.read(&mut byte, self.config.poll) {
                Ok(_) if byte[0] == u8::from(Message::Request) => {
                    info!("update requested");
                    return true;
                }
                Ok(_) => trace!("skipping byte {:#x}", byte[0]),
                Err(Error::TransportTimeout) => {}
                Err(err) => {
                    warn!("link error while listening: {}", err);
                    return false;
                }
            }
        }
        false
    }
}
