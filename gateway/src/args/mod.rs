// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

use clap::Parser;
use gateway::{Config, ConfigError, Settings, Timeouts};
use host_protocol::ImageFormat;
use std::path::PathBuf;
use std::time::Duration;

mod cli;


/// Program arguments loaded from the CLI and config file.
#[derive(Debug, Clone)]
pub enum Args {
    /// Print the available serial ports.
    ListPorts,
    /// Send a firmware file to the target.
    Update(Update),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Update {
    pub port: String,
    pub baudrate: u32,
    pub file: PathBuf,
    pub format: ImageFormat,
    /// Set exactly when `format` is headered.
    pub header_version: Option<u32>,
    pub settings: Settings,
}

pub fn args<I, T>(args: I) -> Result<Args, Error>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    let cli = cli::Args::try_parse_from(args).map_err(Error::Cli)?;
    if cli.list_ports {
        return Ok(Args::ListPorts);
    }

    let config = cli.config.as_deref().map(Config::load).transpose()?.unwrap_or_default();

    // Reconcile the CLI and config arguments. Error if anything is specified both
    // on the CLI and in the config file.
    let port = match (cli.port, config.port) {
        (None, None) => return Err(Error::PortMissing),
        (Some(port), None) | (None, Some(port)) => port,
        (Some(_), Some(_)) => return Err(Error::PortInConfigAndCli),
    };
    let baudrate = match (cli.baudrate, config.baudrate) {
        (None, None) => gateway::DEFAULT_BAUDRATE,
        (Some(baudrate), None) | (None, Some(baudrate)) => baudrate,
        (Some(_), Some(_)) => return Err(Error::BaudrateInConfigAndCli),
    };
    let header_version = match (cli.header_version, config.header_version) {
        (None, None) => None,
        (Some(version), None) | (None, Some(version)) => Some(version),
        (Some(_), Some(_)) => return Err(Error::HeaderVersionInConfigAndCli),
    };
    let cli_format = cli
        .image_format
        .map(|f| match f.as_str() {
            "raw" => Ok(ImageFormat::Raw),
            "headered" => Ok(ImageFormat::Headered),
            _ => Err(Error::InvalidImageFormat(f)),
        })
        .transpose()?;
    let format = match (cli_format, config.image_format) {
        (None, None) => None,
        (Some(format), None) | (None, Some(format)) => Some(format),
        (Some(_), Some(_)) => return Err(Error::ImageFormatInConfigAndCli),
    };
    let format = match (format, header_version) {
        (None, None) => ImageFormat::Raw,
        (None, Some(_)) => ImageFormat::Headered,
        (Some(ImageFormat::Raw), Some(_)) => return Err(Error::HeaderVersionWithRawFormat),
        (Some(ImageFormat::Headered), None) => return Err(Error::HeaderVersionMissing),
        (Some(format), _) => format,
    };

    let file = cli.file.ok_or(Error::FileMissing)?;

    let mut settings = Settings::default();
    if let Some(chunk_size) = config.chunk_size {
        if chunk_size == 0 {
            return Err(Error::InvalidChunkSize);
        }
        settings.chunk_size = chunk_size;
    }
    if let Some(timeouts) = config.timeouts {
        let defaults = Timeouts::default();
        let ms = |value: Option<u64>, default: Duration| value.map(Duration::from_millis).unwrap_or(default);
        settings.timeouts = Timeouts {
            ready: ms(timeouts.ready_ms, defaults.ready),
            ready_attempts: timeouts.ready_attempts.unwrap_or(defaults.ready_attempts),
            length_ack: ms(timeouts.length_ack_ms, defaults.length_ack),
            chunk_ack: ms(timeouts.chunk_ack_ms, defaults.chunk_ack),
            checksum: ms(timeouts.checksum_ms, defaults.checksum),
        };
        if settings.timeouts.ready_attempts == 0 {
            return Err(Error::InvalidReadyAttempts);
        }
    }

    Ok(Args::Update(Update {
        port,
        baudrate,
        file,
        format,
        header_version,
        settings,
    }))
}

#[derive(Debug)]
pub enum Error {
    Cli(clap::Error),
    Config(ConfigError),
    BaudrateInConfigAndCli,
    FileMissing,
    HeaderVersionInConfigAndCli,
    HeaderVersionMissing,
    HeaderVersionWithRawFormat,
    ImageFormatInConfigAndCli,
    InvalidChunkSize,
    InvalidImageFormat(String),
    InvalidReadyAttempts,
    PortInConfigAndCli,
    PortMissing,
}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Error::Config(e)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Cli(e) => write!(f, "{}", e.render().ansi()),
            Error::Config(e) => write!(f, "config error: {e}"),
            Error::BaudrateInConfigAndCli => {
                write!(f, "baudrate specified in both config and cli")
            }
            Error::FileMissing => write!(f, "firmware file must be specified with --file"),
            Error::HeaderVersionInConfigAndCli => {
                write!(f, "header version specified in both config and cli")
            }
            Error::HeaderVersionMissing => write!(
                f,
                "headered images need a version, set --header-version or header-version in the config file"
            ),
            Error::HeaderVersionWithRawFormat => {
                write!(f, "a header version cannot be used with the raw image format")
            }
            Error::ImageFormatInConfigAndCli => {
                write!(f, "image format specified in both config and cli")
            }
            Error::InvalidChunkSize => write!(f, "chunk-size must be at least 1"),
            Error::InvalidImageFormat(format) => write!(
                f,
                "invalid image format \"{format}\", valid values are \"raw\" and \"headered\""
            ),
            Error::InvalidReadyAttempts => write!(f, "ready-attempts must be at least 1"),
            Error::PortInConfigAndCli => write!(f, "port specified in both config and cli"),
            Error::PortMissing => write!(
                f,
                "port must be specified, either with --port or in the config file"
            ),
        }
    }
}

impl std::error::Error for Error {}
