// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

use {
    colored::Colorize,
    gateway::ImageError,
    std::{ffi::OsString, io::Write},
};

mod args;

fn main() -> std::process::ExitCode {
    pretty_env_logger::init();

    main_args(
        std::env::args_os(),
        &mut std::io::stdout(),
        &mut std::io::stderr(),
    )
    .into()
}

fn main_args<I, T>(args: I, stdout: impl Write, mut stderr: impl Write) -> ExitCode
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let result = run(args, stdout);
    // Nowhere left to report a failing stderr.
    let _ = match result {
        Ok(()) => return ExitCode(0),
        // Clap already does the "error: {}" formatting.
        Err(Error::Args(e @ args::Error::Cli(_))) => writeln!(stderr, "{e}"),
        Err(e) => writeln!(stderr, "{} {e}", "error:".bold().red()),
    };
    ExitCode(1)
}

fn run<I, T>(args: I, mut stdout: impl Write) -> Result<(), Error>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    match args::args(args)? {
        args::Args::ListPorts => {
            let ports = tokio_serial::available_ports().map_err(Error::ListPorts)?;
            if ports.is_empty() {
                writeln!(&mut stdout, "{}", "no serial ports found".bold()).map_err(Error::Stdout)?;
            }
            for port in ports {
                writeln!(&mut stdout, "{}", port.port_name).map_err(Error::Stdout)?;
            }
        }
        args::Args::Update(update) => {
            let payload = gateway::image::load(&update.file)?;
            let image = gateway::image::prepare(payload, update.format, update.header_version.unwrap_or_default())?;
            log::info!("{} bytes to send from {}", image.len(), update.file.display());

            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(Error::Runtime)?;
            let report = runtime.block_on(async {
                let port = gateway::open_port(&update.port, update.baudrate)?;
                gateway::update(port, &image, update.settings).await
            })?;

            writeln!(
                &mut stdout,
                "{} {} bytes in {} chunks, checksum {:#04x}",
                "updated".bold().green(),
                report.bytes,
                report.chunks,
                report.checksum,
            )
            .map_err(Error::Stdout)?;
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ExitCode(u8);

impl From<ExitCode> for std::process::ExitCode {
    fn from(code: ExitCode) -> Self {
        code.0.into()
    }
}

#[derive(Debug)]
enum Error {
    Args(args::Error),
    Gateway(gateway::Error),
    ListPorts(tokio_serial::Error),
    Runtime(std::io::Error),
    Stdout(std::io::Error),
}

impl From<args::Error> for Error {
    fn from(e: args::Error) -> Self {
        Error::Args(e)
    }
}

impl From<gateway::Error> for Error {
    fn from(e: gateway::Error) -> Self {
        Error::Gateway(e)
    }
}

impl From<ImageError> for Error {
    fn from(e: ImageError) -> Self {
        Error::Gateway(e.into())
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Args(e) => write!(f, "{e}"),
            Error::Gateway(e) => write!(f, "{e}"),
            Error::ListPorts(e) => write!(f, "failed to list serial ports: {e}"),
            Error::Runtime(e) => write!(f, "failed to start the async runtime: {e}"),
            Error::Stdout(e) => write!(f, "failed to write to stdout: {e}"),
        }
    }
}

impl std::error::Error for Error {}
