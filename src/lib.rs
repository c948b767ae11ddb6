//! Program NXP LPC microcontrollers through their serial ISP bootloader
//!
//! The bootloader speaks a line oriented text protocol. Memory contents are
//! exchanged in checksummed blocks, UU-encoded on most parts, with failed
//! blocks resent a bounded number of times.
//!
//! [Flasher] is the entry point for the usual operations: identifying a
//! device, erasing and programming its flash, dumping it and starting the
//! programmed code. [Connection] gives access to the individual bootloader
//! commands.
//!
//! ## Cargo features
//!
//! - `serialport`: serial port [Transport](interface::Transport)
//!   implementation
//! - `cli`: the command-line application and its support modules

pub use self::{
    connection::{Connection, ConnectionConfig},
    error::Error,
    flasher::Flasher,
    image_format::{FirmwareImage, UserCode},
    targets::{PartDescriptor, PartSource},
};

pub mod checksum;
pub mod connection;
pub mod error;
pub mod flasher;
pub mod hexdump;
pub mod image_format;
pub mod interface;
pub mod progress;
pub mod targets;
pub mod transfer;
pub mod uuencode;

#[cfg(feature = "cli")]
pub mod cli;

/// Logging utilities
#[cfg(feature = "cli")]
pub mod logging {
    use env_logger::Env;
    use log::LevelFilter;

    /// Initialize the logger with the given [LevelFilter]
    ///
    /// `RUST_LOG` takes precedence over the level given here.
    pub fn initialize_logger(filter: LevelFilter) {
        env_logger::Builder::from_env(Env::default().default_filter_or(filter.to_string()))
            .format_target(false)
            .init();
    }
}
