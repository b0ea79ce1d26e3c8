// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Gateway to target MCU update protocol.
//! The gateway is the host and drives the session; the bootloader on the target only answers.
//! Every symbol is a single byte. `LENGTH` and `CHECKSUM` are followed by a big-endian `u32`.
//!
//! A session looks like this:
//!
//! ```text
//! gateway                    target
//!   REQUEST        ──────▶
//!                  ◀──────   READY
//!   LENGTH  u32    ──────▶
//!                  ◀──────   LEN_OK | LEN_ERR
//!   chunk (N bytes)──────▶
//!                  ◀──────   CHUNK_ACK
//!   ...
//!   CHECKSUM u32   ──────▶
//!                  ◀──────   CHECKSUM_OK | CHECKSUM_ERR
//! ```

#![no_std]

pub mod checksum;
pub mod image;


pub use image::{AppHeader, HeaderError, ImageFormat};

/// Payload bytes carried by one chunk. The last chunk of an image may be shorter.
pub const CHUNK_SIZE: usize = 8;

/// How long the gateway waits for `READY` after each `REQUEST`.
pub const READY_TIMEOUT_MS: u64 = 2_000;

/// Number of `REQUEST` attempts before the gateway gives up on the handshake.
pub const READY_ATTEMPTS: usize = 3;

/// How long the gateway waits for `LEN_OK`/`LEN_ERR`; the target backs up and erases before answering.
pub const LENGTH_ACK_TIMEOUT_MS: u64 = 10_000;

/// How long the gateway waits for `CHUNK_ACK`; covers a page flush on the target.
pub const CHUNK_ACK_TIMEOUT_MS: u64 = 15_000;

/// How long the gateway waits for the checksum verdict.
pub const CHECKSUM_TIMEOUT_MS: u64 = 10_000;

/// How long the target waits for the next expected byte from the gateway.
pub const TARGET_BYTE_TIMEOUT_MS: u64 = 10_000;

/// Length of a symbol followed by its `u32` value.
pub const VALUE_FRAME_LEN: usize = 5;

/// Protocol symbols.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Message {
    /// Gateway asks the target to enter update mode
    Request = 28,
    /// Target is prepared for a session
    Ready = 31,
    /// Gateway announces the payload size (followed by `u32`)
    Length = 2,
    /// Target accepted the length, the slot is erased
    LengthOk = 3,
    /// Target rejected the length
    LengthErr = 4,
    /// Target flashed the last chunk
    ChunkAck = 5,
    /// Gateway sends the modulo-256 payload sum (followed by `u32`)
    Checksum = 6,
    /// Target verified and committed the image
    ChecksumOk = 7,
    /// Target rejected the image
    ChecksumErr = 8,
}

impl Message {
    /// Symbols that are followed by a big-endian `u32` value.
    pub const fn has_value(self) -> bool {
        matches!(self, Message::Length | Message::Checksum)
    }

    /// Human readable protocol name, as used in logs.
    pub const fn name(self) -> &'static str {
        match self {
            Message::Request => "REQUEST",
            Message::Ready => "READY",
            Message::Length => "LENGTH",
            Message::LengthOk => "LEN_OK",
            Message::LengthErr => "LEN_ERR",
            Message::ChunkAck => "CHUNK_ACK",
            Message::Checksum => "CHECKSUM",
            Message::ChecksumOk => "CHECKSUM_OK",
            Message::ChecksumErr => "CHECKSUM_ERR",
        }
    }
}

impl From<Message> for u8 {
    fn from(msg: Message) -> u8 {
        msg as u8
    }
}

/// A byte that is not part of the protocol vocabulary.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct UnknownMessage(pub u8);

impl TryFrom<u8> for Message {
    type Error = UnknownMessage;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        Ok(match byte {
            28 => Message::Request,
            31 => Message::Ready,
            2 => Message::Length,
            3 => Message::LengthOk,
            4 => Message::LengthErr,
            5 => Message::ChunkAck,
            6 => Message::Checksum,
            7 => Message::ChecksumOk,
            8 => Message::ChecksumErr,
            other => return Err(UnknownMessage(other)),
        })
    }
}

impl core::fmt::Display for Message {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

/// Encode a symbol with its `u32` value.
pub fn value_frame(msg: Message, value: u32) -> [u8; VALUE_FRAME_LEN] {
    let mut frame = [0u8; VALUE_FRAME_LEN];
    frame[0] = msg.into();
    frame[1..].copy_from_slice(&value.to_be_bytes());
    frame
}

/// Decode the `u32` that follows `LENGTH` or `CHECKSUM`.
pub fn decode_value(bytes: [u8; 4]) -> u32 {
    u32::from_be_bytes(bytes)
}

/// Number of chunks needed to carry `len` payload bytes.
pub const fn chunk_count(len: usize) -> usize {
    len.div_ceil(CHUNK_SIZE)
}
