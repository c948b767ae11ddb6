//! Direct access to the individual bootloader commands
//!
//! These commands talk to a device left synchronized by an earlier
//! invocation, unless `--synchronize` is given or the `synchronize` command
//! itself is run.

use std::{fs, path::PathBuf, str::FromStr};

use clap::{Args, Subcommand};
use log::info;
use miette::{Result, WrapErr};

use super::{config::Config, open_connection, parse_u32, read_file, ConnectArgs};
use crate::{
    connection::{check_copy_arguments, command::ExecutionMode, BlankCheck},
    error::Error,
    hexdump::hexdump,
    transfer::{read_memory, write_to_ram, Encoding},
};

#[derive(Debug, Args)]
pub struct IspArgs {
    #[command(flatten)]
    pub connect_args: ConnectArgs,
    /// Synchronize with the bootloader before running the command
    #[arg(short = 's', long)]
    pub synchronize: bool,

    #[command(subcommand)]
    pub command: IspCommand,
}

#[derive(Debug, Subcommand)]
pub enum IspCommand {
    /// Synchronize with the bootloader and disable command echo
    Synchronize,
    /// Unlock the flash write, erase and go commands
    Unlock,
    /// Read target memory
    ReadMemory {
        /// Start address, a multiple of 4
        #[arg(value_parser = parse_u32)]
        address: u32,
        /// Number of bytes to read, a multiple of 4
        #[arg(value_parser = parse_u32)]
        count: u32,
        /// File to write the memory contents to, or `-` for a hexdump on stdout
        #[arg(default_value = "-")]
        output: PathBuf,
        /// Transfer raw bytes instead of UU-encoded blocks
        #[arg(short = 'r', long)]
        raw: bool,
    },
    /// Write the contents of a file to target RAM
    WriteToRam {
        /// Start address, a multiple of 4
        #[arg(value_parser = parse_u32)]
        address: u32,
        /// File to send, zero-padded to a multiple of 4 bytes
        file: PathBuf,
        /// Transfer raw bytes instead of UU-encoded blocks
        #[arg(short = 'r', long)]
        raw: bool,
    },
    /// Prepare flash sectors for a write or erase
    PrepareForWrite {
        #[arg(value_parser = parse_u32)]
        first: u32,
        #[arg(value_parser = parse_u32)]
        last: u32,
    },
    /// Copy data from RAM to prepared flash sectors
    CopyRamToFlash {
        /// Destination address in flash, a multiple of 256
        #[arg(value_parser = parse_u32)]
        flash_address: u32,
        /// Source address in RAM, a multiple of 4
        #[arg(value_parser = parse_u32)]
        ram_address: u32,
        /// Number of bytes: 256, 512, 1024 or 4096
        #[arg(value_parser = parse_u32)]
        size: u32,
    },
    /// Start executing code
    Go {
        /// Address to jump to, at least 0x200
        #[arg(value_parser = parse_u32)]
        address: u32,
        /// Instruction set to execute in: thumb or arm
        #[arg(default_value = "thumb")]
        mode: String,
    },
    /// Erase prepared flash sectors
    Erase {
        #[arg(value_parser = parse_u32)]
        first: u32,
        #[arg(value_parser = parse_u32)]
        last: u32,
    },
    /// Check whether flash sectors are blank
    BlankCheck {
        #[arg(value_parser = parse_u32)]
        first: u32,
        #[arg(value_parser = parse_u32)]
        last: u32,
    },
    /// Compare two memory regions
    Compare {
        #[arg(value_parser = parse_u32)]
        address1: u32,
        #[arg(value_parser = parse_u32)]
        address2: u32,
        /// Number of bytes to compare, a multiple of 4
        #[arg(value_parser = parse_u32)]
        size: u32,
    },
    /// Read the part identification number
    ReadPartId,
    /// Read the boot code version
    ReadBootVersion,
    /// Read the unique device serial number
    ReadUid,
}

/// Run a single bootloader command
pub fn run(args: IspArgs, config: &Config) -> Result<()> {
    let mut connection = open_connection(&args.connect_args, config)?;

    if args.synchronize || matches!(args.command, IspCommand::Synchronize) {
        let crystal_frequency = args.connect_args.crystal_frequency(config);
        connection.synchronize(crystal_frequency, false)?;
        info!("Synchronized at {crystal_frequency} kHz");
    } else {
        connection.assume_synchronized();
    }

    match args.command {
        IspCommand::Synchronize => {}
        IspCommand::Unlock => {
            connection.unlock()?;
            info!("Flash commands unlocked");
        }
        IspCommand::ReadMemory {
            address,
            count,
            output,
            raw,
        } => {
            let data = read_memory(&mut connection, address, count, Encoding::from(!raw), None)?;

            if output.as_os_str() == "-" {
                print!("{}", hexdump(&data, address));
            } else {
                fs::write(&output, &data)
                    .map_err(Error::OutputError)
                    .wrap_err_with(|| format!("Failed to write {}", output.display()))?;
                info!("Wrote {} bytes to {}", data.len(), output.display());
            }
        }
        IspCommand::WriteToRam { address, file, raw } => {
            let mut data = read_file(&file)?;
            data.resize(data.len().div_ceil(4) * 4, 0);

            write_to_ram(&mut connection, address, &data, Encoding::from(!raw))?;
            info!("Wrote {} bytes to RAM at {address:#010x}", data.len());
        }
        IspCommand::PrepareForWrite { first, last } => {
            connection.prepare_for_write(first, last)?;
            info!("Sectors {first} to {last} prepared for write");
        }
        IspCommand::CopyRamToFlash {
            flash_address,
            ram_address,
            size,
        } => {
            check_copy_arguments(flash_address, ram_address, size)?;
            connection.copy_ram_to_flash(flash_address, ram_address, size)?;
            info!("Copied {size} bytes from {ram_address:#010x} to {flash_address:#010x}");
        }
        IspCommand::Go { address, mode } => {
            let mode = ExecutionMode::from_str(&mode)
                .map_err(|_| Error::InvalidExecutionMode(mode.clone()))?;
            connection.go(address, mode)?;
            info!("Started execution at {address:#010x} in {mode} mode");
        }
        IspCommand::Erase { first, last } => {
            connection.erase(first, last)?;
            info!("Sectors {first} to {last} erased");
        }
        IspCommand::BlankCheck { first, last } => match connection.blank_check(first, last)? {
            BlankCheck::Blank => println!("Sectors {first} to {last} are blank"),
            BlankCheck::NotBlank { offset, content } => println!(
                "Not blank: first non-blank word at offset {offset:#x} holds {content:#010x}"
            ),
        },
        IspCommand::Compare {
            address1,
            address2,
            size,
        } => match connection.compare(address1, address2, size)? {
            None => println!("Regions are identical"),
            Some(offset) => println!("Regions differ, first difference at offset {offset:#x}"),
        },
        IspCommand::ReadPartId => {
            let part_id = connection.read_part_id()?;
            println!("Part ID: {part_id:#010x} ({part_id})");
        }
        IspCommand::ReadBootVersion => {
            println!("Boot code version: {}", connection.read_boot_version()?);
        }
        IspCommand::ReadUid => {
            let uid = connection.read_uid()?;
            println!(
                "UID: {:08x} {:08x} {:08x} {:08x}",
                uid[0], uid[1], uid[2], uid[3]
            );
        }
    }

    Ok(())
}
