// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Relays a deposited firmware image to the target bootloader over a serial link.

pub mod config;
pub mod driver;
pub mod error;
pub mod image;


pub use config::{Config, ConfigError};
pub use driver::{DriverState, Report, Settings, Timeouts, TransferProtocolDriver};
pub use error::Error;
pub use image::ImageError;

use std::time::Duration;
use tokio_serial::{SerialPortBuilderExt, SerialStream};

pub const DEFAULT_BAUDRATE: u32 = 115_200;

/// Open `port` for a session. Reads are bounded by the driver, not the port.
pub fn open_port(port: &str, baudrate: u32) -> Result<SerialStream, Error> {
    log::info!("opening {port} at {baudrate} baud");
    let stream = tokio_serial::new(port, baudrate)
        .timeout(Duration::from_secs(1))
        .open_native_async()?;
    Ok(stream)
}

/// Run one update session over `io`.
pub async fn update<T>(io: T, image: &[u8], settings: Settings) -> Result<Report, Error>
where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    TransferProtocolDriver::new(io, settings).run(image).await
}
