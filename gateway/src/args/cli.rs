// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Command line arguments.

use std::path::PathBuf;

#[derive(clap::Parser)]
#[command(name = "gateway", about = "Send a firmware image to the target bootloader")]
pub struct Args {
    /// Serial port connected to the target, e.g. /dev/ttyUSB0.
    #[clap(short, long)]
    pub port: Option<String>,
    /// Serial baudrate. Defaults to 115200.
    #[clap(short, long)]
    pub baudrate: Option<u32>,
    /// Firmware file, raw binary or Intel HEX.
    #[clap(short, long)]
    pub file: Option<PathBuf>,
    /// Path to config file.
    #[clap(short, long)]
    pub config: Option<PathBuf>,
    /// Layout of the image in its slot. Valid values are "raw" and "headered".
    #[clap(long)]
    pub image_format: Option<String>,
    /// Version written to the image header; implies the headered format.
    #[clap(long)]
    pub header_version: Option<u32>,
    /// List the serial ports and exit.
    #[clap(long)]
    pub list_ports: bool,
}
