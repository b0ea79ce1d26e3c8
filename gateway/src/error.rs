// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::config::ConfigError;
use crate::image::ImageError;
use host_protocol::Message;

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    Serial(tokio_serial::Error),
    /// The target closed the link.
    LinkClosed,
    /// No `READY` after every `REQUEST` attempt.
    NoReady { attempts: usize },
    Timeout { waiting_for: Message },
    /// No `CHUNK_ACK` for a chunk; nothing after it was sent.
    ChunkNotAcked { index: usize, total: usize },
    LengthRejected { len: u32 },
    ChecksumRejected { checksum: u32 },
    ProtocolViolation { expected: Message, received: u8 },
    Image(ImageError),
    Config(ConfigError),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<tokio_serial::Error> for Error {
    fn from(e: tokio_serial::Error) -> Self {
        Error::Serial(e)
    }
}

impl From<ImageError> for Error {
    fn from(e: ImageError) -> Self {
        Error::Image(e)
    }
}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Error::Config(e)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Io(e) => write!(f, "serial I/O failed: {e}"),
            Error::Serial(e) => write!(f, "cannot open serial port: {e}"),
            Error::LinkClosed => write!(f, "target closed the link"),
            Error::NoReady { attempts } => {
                write!(f, "target did not answer READY after {attempts} requests")
            }
            Error::Timeout { waiting_for } => write!(f, "timed out waiting for {waiting_for}"),
            Error::ChunkNotAcked { index, total } => {
                write!(f, "chunk {index} of {total} was not acknowledged")
            }
            Error::LengthRejected { len } => {
                write!(f, "target rejected an image of {len} bytes (LEN_ERR)")
            }
            Error::ChecksumRejected { checksum } => {
                write!(f, "target rejected the image checksum {checksum:#04x} (CHECKSUM_ERR)")
            }
            Error::ProtocolViolation { expected, received } => {
                write!(f, "expected {expected}, received byte {received:#04x}")
            }
            Error::Image(e) => write!(f, "firmware image: {e}"),
            Error::Config(e) => write!(f, "config error: {e}"),
        }
    }
}

impl std::error::Error for Error {}
