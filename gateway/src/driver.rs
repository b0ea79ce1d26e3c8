// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Gateway side of the update protocol.
//!
//! The driver owns the serial stream for one session and walks
//! `REQUEST → READY → LENGTH → chunks → CHECKSUM`. Only the `READY` handshake is
//! retried; every other timeout or negative answer ends the session.

use crate::error::Error;
use host_protocol::checksum::sum8;
use host_protocol::{value_frame, Message};
use std::io::ErrorKind;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub ready: Duration,
    pub ready_attempts: usize,
    pub length_ack: Duration,
    pub chunk_ack: Duration,
    pub checksum: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            ready: Duration::from_millis(host_protocol::READY_TIMEOUT_MS),
            ready_attempts: host_protocol::READY_ATTEMPTS,
            length_ack: Duration::from_millis(host_protocol::LENGTH_ACK_TIMEOUT_MS),
            chunk_ack: Duration::from_millis(host_protocol::CHUNK_ACK_TIMEOUT_MS),
            checksum: Duration::from_millis(host_protocol::CHECKSUM_TIMEOUT_MS),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    /// Bytes per acknowledged chunk. Has to match the target build.
    pub chunk_size: usize,
    pub timeouts: Timeouts,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            chunk_size: host_protocol::CHUNK_SIZE,
            timeouts: Timeouts::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    SendRequest,
    AwaitReady,
    SendLength,
    AwaitLengthAck,
    SendChunks,
    SendChecksum,
    AwaitChecksumResult,
    Done,
    Failed,
}

/// Summary of a finished transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Report {
    pub bytes: u32,
    pub chunks: usize,
    pub checksum: u32,
    /// `REQUEST`s sent before the target answered.
    pub attempts: usize,
}

pub struct TransferProtocolDriver<T> {
    io: T,
    settings: Settings,
    state: DriverState,
}

impl<T: AsyncRead + AsyncWrite + Unpin> TransferProtocolDriver<T> {
    pub fn new(io: T, settings: Settings) -> Self {
        Self {
            io,
            settings,
            state: DriverState::SendRequest,
        }
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    /// Transfer `image` to the target. The state ends in `Done` or `Failed`.
    pub async fn run(&mut self, image: &[u8]) -> Result<Report, Error> {
        self.state = DriverState::SendRequest;
        match self.session(image).await {
            Ok(report) => {
                self.state = DriverState::Done;
                Ok(report)
            }
            Err(e) => {
                log::error!("update failed in {:?}: {e}", self.state);
                self.state = DriverState::Failed;
                Err(e)
            }
        }
    }

    async fn session(&mut self, image: &[u8]) -> Result<Report, Error> {
        let len = u32::try_from(image.len()).map_err(|_| Error::LengthRejected { len: u32::MAX })?;
        let attempts = self.handshake().await?;

        self.state = DriverState::SendLength;
        log::info!("sending length {len}");
        self.send(&value_frame(Message::Length, len)).await?;
        self.state = DriverState::AwaitLengthAck;
        let accepted = self
            .verdict(Message::LengthOk, Message::LengthErr, self.settings.timeouts.length_ack)
            .await?;
        if !accepted {
            return Err(Error::LengthRejected { len });
        }

        self.state = DriverState::SendChunks;
        let chunks = self.send_chunks(image).await?;

        self.state = DriverState::SendChecksum;
        let checksum = sum8(image);
        log::info!("sending checksum {checksum:#04x}");
        self.send(&value_frame(Message::Checksum, checksum)).await?;
        self.state = DriverState::AwaitChecksumResult;
        let accepted = self
            .verdict(Message::ChecksumOk, Message::ChecksumErr, self.settings.timeouts.checksum)
            .await?;
        if !accepted {
            return Err(Error::ChecksumRejected { checksum });
        }

        log::info!("target committed {len} bytes");
        Ok(Report {
            bytes: len,
            chunks,
            checksum,
            attempts,
        })
    }

    /// Send `REQUEST` until the target answers `READY`. Returns the attempt that succeeded.
    async fn handshake(&mut self) -> Result<usize, Error> {
        let attempts = self.settings.timeouts.ready_attempts;
        for attempt in 1..=attempts {
            self.drain().await?;
            self.state = DriverState::SendRequest;
            log::info!("sending REQUEST ({attempt}/{attempts})");
            self.send(&[Message::Request.into()]).await?;

            self.state = DriverState::AwaitReady;
            let deadline = Instant::now() + self.settings.timeouts.ready;
            loop {
                let left = deadline.saturating_duration_since(Instant::now());
                match self.read_byte(left).await {
                    Ok(byte) if byte == u8::from(Message::Ready) => return Ok(attempt),
                    // Boot banners may share the line.
                    Ok(byte) => log::debug!("skipping byte {byte:#04x} while waiting for READY"),
                    Err(None) => break,
                    Err(Some(e)) => return Err(e),
                }
            }
            log::warn!("no READY within {:?}", self.settings.timeouts.ready);
        }
        Err(Error::NoReady { attempts })
    }

    async fn send_chunks(&mut self, image: &[u8]) -> Result<usize, Error> {
        let total = image.len().div_ceil(self.settings.chunk_size);
        let mut reported = 0;
        for (index, chunk) in image.chunks(self.settings.chunk_size).enumerate() {
            self.send(chunk).await?;
            match self.read_byte(self.settings.timeouts.chunk_ack).await {
                Ok(byte) if byte == u8::from(Message::ChunkAck) => {}
                Ok(received) => {
                    return Err(Error::ProtocolViolation {
                        expected: Message::ChunkAck,
                        received,
                    })
                }
                Err(None) => return Err(Error::ChunkNotAcked { index, total }),
                Err(Some(e)) => return Err(e),
            }

            let percent = (index + 1) * 100 / total;
            if percent / 10 > reported / 10 {
                reported = percent;
                log::info!("{percent}% ({} of {total} chunks)", index + 1);
            }
        }
        Ok(total)
    }

    /// Wait for `ok`; `Ok(false)` if the target answered `err` instead.
    async fn verdict(&mut self, ok: Message, err: Message, wait: Duration) -> Result<bool, Error> {
        let byte = match self.read_byte(wait).await {
            Ok(byte) => byte,
            Err(None) => return Err(Error::Timeout { waiting_for: ok }),
            Err(Some(e)) => return Err(e),
        };
        if byte == u8::from(ok) {
            Ok(true)
        } else if byte == u8::from(err) {
            Ok(false)
        } else {
            Err(Error::ProtocolViolation {
                expected: ok,
                received: byte,
            })
        }
    }

    /// One byte, or `Err(None)` when `wait` elapsed first.
    async fn read_byte(&mut self, wait: Duration) -> Result<u8, Option<Error>> {
        match timeout(wait, self.io.read_u8()).await {
            Err(_) => Err(None),
            Ok(Ok(byte)) => {
                log::trace!("rx {byte:#04x}");
                Ok(byte)
            }
            Ok(Err(e)) if e.kind() == ErrorKind::UnexpectedEof => Err(Some(Error::LinkClosed)),
            Ok(Err(e)) => Err(Some(Error::Io(e))),
        }
    }

    /// Drop whatever is already buffered so a stale answer is not taken for `READY`.
    async fn drain(&mut self) -> Result<(), Error> {
        let mut buf = [0u8; 64];
        loop {
            match timeout(Duration::ZERO, self.io.read(&mut buf)).await {
                Ok(Ok(0)) => return Err(Error::LinkClosed),
                Ok(Ok(n)) => log::debug!("discarding {n} stale bytes"),
                Ok(Err(e)) => return Err(Error::Io(e)),
                Err(_) => return Ok(()),
            }
        }
    }

    async fn send(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.io.write_all(bytes).await?;
        self.io.flush().await?;
        Ok(())
    }
}
