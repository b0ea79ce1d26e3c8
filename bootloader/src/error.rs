// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

use core::fmt;
use host_protocol::Message;

/// Failure of a flash operation, with the absolute address it was aimed at.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FlashError {
    /// The range is outside the application slots.
    OutOfBounds { addr: u32, len: u32 },
    /// The address is not aligned to a page (erase) or a word (write).
    Unaligned { addr: u32 },
    Erase { addr: u32 },
    Write { addr: u32 },
    Read { addr: u32 },
}

impl fmt::Display for FlashError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlashError::OutOfBounds { addr, len } => {
                write!(f, "{len} bytes at {addr:#010x} are outside the application slots")
            }
            FlashError::Unaligned { addr } => write!(f, "unaligned flash access at {addr:#010x}"),
            FlashError::Erase { addr } => write!(f, "erase failed at {addr:#010x}"),
            FlashError::Write { addr } => write!(f, "write failed at {addr:#010x}"),
            FlashError::Read { addr } => write!(f, "read failed at {addr:#010x}"),
        }
    }
}

/// Everything that can end an update attempt or a boot attempt.
///
/// All of them are terminal for the current attempt: the session is dropped and the
/// slot that holds the last committed flag is left as it was.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// Nothing arrived from the gateway in time.
    TransportTimeout,
    /// The link itself failed.
    TransportError,
    /// The gateway sent a byte that is not valid at this point of the session.
    ProtocolViolation { expected: Message, received: u8 },
    /// The announced or received image does not fit the slot.
    SizeExceeded { declared: u32, capacity: u32 },
    FlashError(FlashError),
    /// A checksum computed over flash did not match the expected value.
    IntegrityError { expected: u32, computed: u32 },
    /// The image in the slot cannot be started.
    InvalidApplication,
}

impl From<FlashError> for Error {
    fn from(err: FlashError) -> Self {
        Error::FlashError(err)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::TransportTimeout => write!(f, "timed out waiting for the gateway"),
            Error::TransportError => write!(f, "serial link error"),
            Error::ProtocolViolation { expected, received } => {
                write!(f, "expected {expected}, received byte {received:#04x}")
            }
            Error::SizeExceeded { declared, capacity } => {
                write!(f, "image of {declared} bytes does not fit (capacity {capacity})")
            }
            Error::FlashError(err) => write!(f, "flash: {err}"),
            Error::IntegrityError { expected, computed } => {
                write!(f, "checksum mismatch: expected {expected:#x}, computed {computed:#x}")
            }
            Error::InvalidApplication => write!(f, "no bootable application"),
        }
    }
}
