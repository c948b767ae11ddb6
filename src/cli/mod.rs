//! Types and functions for the command-line interface
//!
//! No stability guaranties apply

use std::{
    fs,
    num::ParseIntError,
    path::{Path, PathBuf},
    time::Duration,
};

use clap::Args;
use comfy_table::{modifiers, presets::UTF8_FULL, Attribute, Cell, Color, Table};
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info};
use miette::{IntoDiagnostic, Result, WrapErr};

use self::{config::Config, serial::get_serial_port};
use crate::{
    connection::{Connection, ConnectionConfig},
    error::Error,
    flasher::Flasher,
    image_format::{FirmwareImage, UserCode},
    interface::{SerialInterface, DEFAULT_BAUD},
    progress::ProgressCallbacks,
    targets::{PartDescriptor, PartSource},
};

pub mod config;
pub mod isp;

mod serial;

/// Establish a connection with a target device
#[derive(Debug, Args, Clone)]
#[non_exhaustive]
pub struct ConnectArgs {
    /// Serial port connected to target device
    #[arg(short = 'p', long, env = "LPCFLASH_PORT")]
    pub port: Option<String>,
    /// Baud rate at which to communicate with target device
    #[arg(short = 'b', long, env = "LPCFLASH_BAUD")]
    pub baud: Option<u32>,
    /// Crystal frequency of the target device, in kHz
    #[arg(short = 'f', long = "freq", value_parser = parse_u32)]
    pub crystal_frequency: Option<u32>,
    /// How long to wait for a reply from the bootloader, in milliseconds
    #[arg(long, default_value_t = 500)]
    pub timeout: u64,
    /// Log every status code and every byte exchanged with the device
    #[arg(short = 't', long)]
    pub trace: bool,
    /// Parts description file
    #[arg(long, env = "LPCFLASH_PARTS")]
    pub parts: Option<PathBuf>,
}

impl ConnectArgs {
    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            trace: self.trace,
            timeout: Duration::from_millis(self.timeout),
        }
    }

    pub fn crystal_frequency(&self, config: &Config) -> u32 {
        self.crystal_frequency
            .unwrap_or(config.target.crystal_frequency)
    }

    pub fn part_source(&self, config: &Config) -> PartSource {
        match self.parts.as_ref().or(config.target.parts_file.as_ref()) {
            Some(path) => PartSource::File(path.clone()),
            None => PartSource::locate(),
        }
    }
}

/// Parse an unsigned integer, in decimal or with a radix prefix
pub fn parse_u32(input: &str) -> Result<u32, ParseIntError> {
    parse_int::parse(input)
}

fn open_transport(args: &ConnectArgs, config: &Config) -> Result<SerialInterface> {
    let port = get_serial_port(args, config)?;
    let baud = args
        .baud
        .or(config.connection.baudrate)
        .unwrap_or(DEFAULT_BAUD);

    info!("Serial port: {port} at {baud} baud");
    SerialInterface::open(&port, baud)
        .wrap_err_with(|| format!("Failed to open serial port {port}"))
}

/// Open the serial port, synchronize with the bootloader and identify the
/// connected part
pub fn connect(args: &ConnectArgs, config: &Config) -> Result<Flasher> {
    let transport = open_transport(args, config)?;
    let parts = args.part_source(config);
    debug!("Looking up parts in {parts}");

    let flasher = Flasher::connect(
        Box::new(transport),
        args.connection_config(),
        args.crystal_frequency(config),
        &parts,
    )?;

    Ok(flasher)
}

/// Open the serial port without running the synchronization handshake
pub fn open_connection(args: &ConnectArgs, config: &Config) -> Result<Connection> {
    let transport = open_transport(args, config)?;

    Ok(Connection::new(Box::new(transport), args.connection_config()))
}

/// Print the identity of the connected device
pub fn device_info(args: &ConnectArgs, config: &Config) -> Result<()> {
    let mut flasher = connect(args, config)?;
    let info = flasher.device_info()?;

    println!("{info}");

    Ok(())
}

/// Check the vector table checksum and code read protection of an image
///
/// With `output` the image, including the computed checksum, is written out.
pub fn check_image(path: &Path, user_code: UserCode, output: Option<&Path>) -> Result<()> {
    let mut image = FirmwareImage::from_file(path)?;
    let stored = image.stored_checksum();
    let expected = image.expected_checksum();

    println!("Image size:       {} bytes", image.len());
    println!("Stored checksum:  {stored:#010x}");
    println!("Vector checksum:  {expected:#010x}");

    image.prepare(user_code)?;
    println!("Code read protection word: {:#010x} (not protected)", image.crp());

    if let Some(output) = output {
        fs::write(output, image.data())
            .into_diagnostic()
            .wrap_err_with(|| format!("Failed to write image to {}", output.display()))?;
        info!("Image written to {}", output.display());
    }

    Ok(())
}

/// Print the parts known to `source`
pub fn list_parts(source: &PartSource) -> Result<()> {
    let parts = source.parts()?;
    println!("{}", parts_table(&parts));

    Ok(())
}

fn parts_table(parts: &[PartDescriptor]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(modifiers::UTF8_ROUND_CORNERS)
        .set_header(vec![
            Cell::new("Part")
                .fg(Color::Green)
                .add_attribute(Attribute::Bold),
            Cell::new("ID")
                .fg(Color::Cyan)
                .add_attribute(Attribute::Bold),
            Cell::new("Flash")
                .fg(Color::Red)
                .add_attribute(Attribute::Bold),
            Cell::new("Sectors")
                .fg(Color::Yellow)
                .add_attribute(Attribute::Bold),
            Cell::new("RAM")
                .fg(Color::Magenta)
                .add_attribute(Attribute::Bold),
            Cell::new("Buffer")
                .fg(Color::DarkCyan)
                .add_attribute(Attribute::Bold),
            Cell::new("UU")
                .fg(Color::Blue)
                .add_attribute(Attribute::Bold),
        ]);

    for part in parts {
        table.add_row(vec![
            Cell::new(&part.name).fg(Color::Green),
            Cell::new(format!("{:#010x}", part.part_id)).fg(Color::Cyan),
            Cell::new(format!(
                "{:#x} ({}KiB)",
                part.flash_base,
                part.flash_size / 1024
            ))
            .fg(Color::Red),
            Cell::new(format!("{} x {}", part.flash_sectors, part.sector_size())).fg(Color::Yellow),
            Cell::new(format!("{:#x} ({}KiB)", part.ram_base, part.ram_size / 1024))
                .fg(Color::Magenta),
            Cell::new(format!(
                "{:#x} ({} bytes)",
                part.ram_buffer_address(),
                part.ram_buffer_size
            ))
            .fg(Color::DarkCyan),
            Cell::new(if part.uuencode { "yes" } else { "no" }).fg(Color::Blue),
        ]);
    }

    table
}

/// Read a whole file into memory
pub fn read_file(path: &Path) -> Result<Vec<u8>> {
    let data = fs::read(path).map_err(|e| Error::FileOpenError(path.display().to_string(), e))?;
    debug!("Read {} bytes from {}", data.len(), path.display());

    Ok(data)
}

/// Progress callbacks drawing a progress bar on the terminal
#[derive(Default)]
pub struct ProgressBarCallbacks {
    pb: Option<ProgressBar>,
}

impl ProgressCallbacks for ProgressBarCallbacks {
    fn init(&mut self, addr: u32, len: usize) {
        let pb = ProgressBar::new(len as u64)
            .with_style(
                ProgressStyle::default_bar()
                    .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos:>7}/{len:7} {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("=> "),
            )
            .with_message(format!("{addr:#010x}"));

        self.pb = Some(pb);
    }

    fn update(&mut self, current: usize) {
        if let Some(ref pb) = self.pb {
            pb.set_position(current as u64);
        }
    }

    fn finish(&mut self) {
        if let Some(pb) = self.pb.take() {
            pb.finish();
        }
    }
}
