// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Capabilities the bootloader core needs from the board.

use crate::error::Error;
use embassy_time::{Duration, Instant};
use host_protocol::{decode_value, Message};

/// Byte stream to the gateway.
pub trait Transport {
    /// Read at least one and at most `buf.len()` bytes.
    ///
    /// Returns [`Error::TransportTimeout`] when nothing arrived within `timeout`.
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, Error>;

    /// Write all of `bytes`.
    fn write(&mut self, bytes: &[u8]) -> Result<(), Error>;

    fn send(&mut self, msg: Message) -> Result<(), Error> {
        trace!("tx {}", msg);
        self.write(&[msg.into()])
    }
}

/// Monotonic time source.
pub trait Clock {
    fn now(&self) -> Instant;
}

/// Core services outside of flash and the link.
pub trait System {
    fn delay_ms(&mut self, ms: u32);

    /// Full device reset.
    fn reset(&mut self) -> !;
}

/// Fill `buf` completely, allowing `timeout` for every read.
pub fn read_exact<T: Transport>(link: &mut T, buf: &mut [u8], timeout: Duration) -> Result<(), Error> {
    let mut filled = 0;
    while filled < buf.len() {
        filled += link.read(&mut buf[filled..], timeout)?;
    }
    Ok(())
}

pub fn read_byte<T: Transport>(link: &mut T, timeout: Duration) -> Result<u8, Error> {
    let mut byte = [0u8];
    read_exact(link, &mut byte, timeout)?;
    Ok(byte[0])
}

/// Wait for `expected` followed by its `u32` value.
///
/// Bytes listed in `ignore` are skipped; anything else is a protocol violation.
pub fn read_value<T: Transport>(link: &mut T, expected: Message, ignore: &[Message], timeout: Duration) -> Result<u32, Error> {
    loop {
        let byte = read_byte(link, timeout)?;
        match Message::try_from(byte) {
            Ok(msg) if msg == expected => break,
            Ok(msg) if ignore.contains(&msg) => debug!("ignoring {} while waiting for {}", msg, expected),
            _ => return Err(Error::ProtocolViolation { expected, received: byte }),
        }
    }
    let mut value = [0u8; 4];
    read_exact(link, &mut value, timeout)?;
    Ok(decode_value(value))
}
