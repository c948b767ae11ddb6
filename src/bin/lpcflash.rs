use std::{
    fs::File,
    io::{self, BufWriter},
    path::PathBuf,
};

use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use log::{debug, info, LevelFilter};
use lpcflash::{
    cli::{
        check_image,
        config::Config,
        connect,
        device_info,
        isp::{self, IspArgs},
        list_parts,
        ConnectArgs,
        ProgressBarCallbacks,
    },
    logging::initialize_logger,
    Error,
    FirmwareImage,
    PartSource,
    UserCode,
};
use miette::{Result, WrapErr};

#[derive(Debug, Parser)]
#[command(about, max_term_width = 100, propagate_version = true, version)]
struct Cli {
    #[command(subcommand)]
    subcommand: Commands,

    /// Log level: error, warn, info, debug or trace
    #[arg(long, global = true, env = "LOG_LEVEL", default_value = "info")]
    log_level: LevelFilter,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Display the part ID, serial number and boot code version of the
    /// connected device
    Id(ConnectArgs),
    /// Write the contents of the whole flash to a file
    Dump(DumpArgs),
    /// Program an image to the flash of the connected device
    Flash(FlashArgs),
    /// Erase the whole flash of the connected device
    Erase(ConnectArgs),
    /// Start the program in flash through its reset vector
    Execute(ConnectArgs),
    /// Run individual bootloader commands
    Isp(IspArgs),
    /// Check the vector table checksum and code read protection of an image,
    /// without a device
    CheckImage(CheckImageArgs),
    /// List the supported parts
    ListParts(ListPartsArgs),
    /// Generate completions for the given shell
    Completions(CompletionsArgs),
}

#[derive(Debug, Args)]
struct DumpArgs {
    /// File to write the flash contents to
    output: PathBuf,

    #[command(flatten)]
    connect_args: ConnectArgs,
}

#[derive(Debug, Args)]
struct FlashArgs {
    /// Raw binary image to program, starting with the vector table
    image: PathBuf,
    /// Require the image to hold a valid vector table checksum instead of
    /// computing it
    #[arg(long)]
    no_user_code: bool,
    /// Read the flash back after programming and compare it with the image
    #[arg(long)]
    verify: bool,

    #[command(flatten)]
    connect_args: ConnectArgs,
}

#[derive(Debug, Args)]
struct CheckImageArgs {
    /// Raw binary image to check
    image: PathBuf,
    /// Require the image to hold a valid vector table checksum instead of
    /// computing it
    #[arg(long)]
    no_user_code: bool,
    /// Write the image, with its computed checksum, to this file
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct ListPartsArgs {
    /// Parts description file to list instead of the built-in table
    #[arg(long)]
    parts: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct CompletionsArgs {
    /// Shell to generate completions for
    shell: Shell,
}

fn user_code(no_user_code: bool, config: &Config) -> UserCode {
    if no_user_code || !config.target.compute_user_code {
        UserCode::Verify
    } else {
        UserCode::Compute
    }
}

fn main() -> Result<()> {
    miette::set_panic_hook();

    // Attempt to parse any provided command-line arguments, or print the help
    // message and terminate if the invocation is not correct.
    let cli = Cli::parse();
    initialize_logger(cli.log_level);
    debug!("{:#?}", cli.subcommand);

    // Load any user configuration, if present.
    let config = Config::load()?;

    // Execute the correct action based on the provided subcommand and its
    // associated arguments.
    match cli.subcommand {
        Commands::Id(args) => device_info(&args, &config),
        Commands::Dump(args) => dump(args, &config),
        Commands::Flash(args) => flash(args, &config),
        Commands::Erase(args) => erase(args, &config),
        Commands::Execute(args) => execute(args, &config),
        Commands::Isp(args) => isp::run(args, &config),
        Commands::CheckImage(args) => check_image(
            &args.image,
            user_code(args.no_user_code, &config),
            args.output.as_deref(),
        ),
        Commands::ListParts(args) => list_parts(&match args.parts {
            Some(path) => PartSource::File(path),
            None => PartSource::Builtin,
        }),
        Commands::Completions(args) => {
            clap_complete::generate(
                args.shell,
                &mut Cli::command(),
                env!("CARGO_PKG_NAME"),
                &mut io::stdout(),
            );
            Ok(())
        }
    }
}

fn dump(args: DumpArgs, config: &Config) -> Result<()> {
    let mut flasher = connect(&args.connect_args, config)?;

    let file = File::create(&args.output)
        .map_err(Error::OutputError)
        .wrap_err_with(|| format!("Failed to create {}", args.output.display()))?;

    flasher.dump(
        BufWriter::new(file),
        Some(&mut ProgressBarCallbacks::default()),
    )?;
    info!("Flash contents written to {}", args.output.display());

    Ok(())
}

fn flash(args: FlashArgs, config: &Config) -> Result<()> {
    let image = FirmwareImage::from_file(&args.image)
        .wrap_err_with(|| format!("Failed to load image {}", args.image.display()))?;

    let mut flasher = connect(&args.connect_args, config)?;
    flasher.flash(
        image,
        user_code(args.no_user_code, config),
        args.verify,
        Some(&mut ProgressBarCallbacks::default()),
    )?;
    info!("Flashing has completed!");

    Ok(())
}

fn erase(args: ConnectArgs, config: &Config) -> Result<()> {
    let mut flasher = connect(&args, config)?;
    flasher.erase(Some(&mut ProgressBarCallbacks::default()))?;

    Ok(())
}

fn execute(args: ConnectArgs, config: &Config) -> Result<()> {
    let mut flasher = connect(&args, config)?;
    flasher.execute()?;

    Ok(())
}
