use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};

use picprog::constants::Timing;
use picprog::format::{self, FirmwareFormat};
use picprog::transport::{DummyTransport, SerialTransport};
use picprog::{
    Chip, ChipDB, Error, ErrorKind, Flashing, MemoryImage, Options, Progress, ProtocolRevision,
    Region, Step, Transport, VerifyReport,
};

#[derive(clap::Parser)]
#[command(
    name = "picprog",
    version,
    about = "Drive K128/K149/K150 serial PIC programmers: program, verify, erase and dump chips"
)]
struct Cli {
    /// Log every frame exchanged with the programmer
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Erase the chip, write a firmware image and verify it
    Program {
        #[command(flatten)]
        target: Target,
        /// Intel HEX file, or raw ROM image with --format bin
        path: PathBuf,
        /// Override a fuse setting, e.g. --fuse WDT:Disabled (repeatable)
        #[arg(long = "fuse", value_name = "NAME:VALUE", value_parser = parse_fuse)]
        fuses: Vec<(String, String)>,
        /// User ID bytes as hex, e.g. --id 01020304
        #[arg(long, value_parser = parse_id)]
        id: Option<UserId>,
        #[arg(long, value_enum)]
        format: Option<FileFormat>,
    },
    /// Compare the chip against a firmware image
    Verify {
        #[command(flatten)]
        target: Target,
        path: PathBuf,
        #[arg(long, value_enum)]
        format: Option<FileFormat>,
    },
    /// Erase the chip
    Erase {
        #[command(flatten)]
        target: Target,
    },
    /// Read one memory region of the chip
    Dump {
        #[command(flatten)]
        target: Target,
        #[arg(value_enum)]
        region: DumpRegion,
        /// Output file, standard output if absent
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Intel HEX text, or the raw bytes of the region
        #[arg(long, value_enum, default_value_t = FileFormat::Hex)]
        format: FileFormat,
    },
    /// Print chip parameters as JSON, for one chip or all of them
    ChipInfo { chip: Option<String> },
    /// Summarize a HEX file as it would be programmed into a chip
    HexInfo {
        path: PathBuf,
        #[arg(short = 't', long = "chip")]
        chip: String,
        #[arg(long)]
        json: bool,
    },
    /// List serial ports
    Ports,
}

#[derive(Args)]
struct Target {
    /// Serial port of the programmer, "dummy" for the built-in emulator
    #[arg(short, long)]
    port: Option<String>,
    /// Chip type, e.g. 16f628a
    #[arg(short = 't', long = "chip")]
    chip: String,
    /// The chip is wired to the ICSP header
    #[arg(long)]
    icsp: bool,
    /// Firmware protocol of the programmer
    #[arg(long, value_enum, default_value_t = ProtocolRevision::P18A)]
    protocol: ProtocolRevision,
}

#[derive(Copy, Clone, ValueEnum)]
enum FileFormat {
    Hex,
    Bin,
}

impl From<FileFormat> for FirmwareFormat {
    fn from(f: FileFormat) -> Self {
        match f {
            FileFormat::Hex => FirmwareFormat::IntelHex,
            FileFormat::Bin => FirmwareFormat::Binary,
        }
    }
}

#[derive(Copy, Clone, ValueEnum)]
enum DumpRegion {
    Rom,
    Eeprom,
    Config,
}

impl From<DumpRegion> for Region {
    fn from(r: DumpRegion) -> Self {
        match r {
            DumpRegion::Rom => Region::Rom,
            DumpRegion::Eeprom => Region::Eeprom,
            DumpRegion::Config => Region::Config,
        }
    }
}

fn parse_fuse(s: &str) -> std::result::Result<(String, String), String> {
    let (name, value) = s
        .split_once(':')
        .ok_or_else(|| format!("expected NAME:VALUE, got {:?}", s))?;
    Ok((name.trim().to_string(), value.trim().to_string()))
}

#[derive(Clone)]
struct UserId(Vec<u8>);

fn parse_id(s: &str) -> std::result::Result<UserId, String> {
    hex::decode(s.trim_start_matches("0x"))
        .map(UserId)
        .map_err(|e| e.to_string())
}

/// Progress bar per transfer step
#[derive(Default)]
struct ProgressReporter {
    step: Option<Step>,
    bar: Option<ProgressBar>,
}

impl Progress for ProgressReporter {
    fn step(&mut self, step: Step) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
        self.step = Some(step);
    }

    fn position(&mut self, done: usize, total: usize) {
        let step = self.step;
        let bar = self.bar.get_or_insert_with(|| {
            let bar = ProgressBar::new(total as u64);
            bar.set_style(
                ProgressStyle::default_bar()
                    .template("{msg:>14} [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("#>-"),
            );
            if let Some(step) = step {
                bar.set_message(step.to_string());
            }
            bar
        });
        bar.set_position(done as u64);
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
    }
}

fn connect(target: &Target) -> picprog::Result<Flashing<Box<dyn Transport>>> {
    let dummy = target.port.as_deref() == Some("dummy");
    let options = Options {
        protocol: target.protocol,
        icsp: target.icsp,
        timing: if dummy {
            Timing::instant()
        } else {
            Timing::default()
        },
    };
    let mut flashing = Flashing::connect(&target.chip, options, || -> picprog::Result<Box<dyn Transport>> {
        match target.port.as_deref() {
            Some("dummy") => {
                let chip = ChipDB::find_chip(&target.chip)?;
                log::info!("Using the dummy programmer");
                Ok(Box::new(DummyTransport::with_protocol(
                    chip,
                    target.protocol.opcodes(),
                )))
            }
            Some(port) => Ok(Box::new(SerialTransport::open(port)?)),
            None => Ok(Box::new(SerialTransport::open_any()?)),
        }
    })?;
    flashing.cancel_on_interrupt()?;
    flashing.dump_info()?;
    Ok(flashing)
}

fn load_image(chip: &'static Chip, path: &Path, format: Option<FileFormat>) -> Result<MemoryImage> {
    let image = format::read_image_from_file(path, chip, format.map(Into::into))
        .with_context(|| format!("reading {}", path.display()))?;
    log::info!(
        "Image: {} of {} ROM words, {} of {} EEPROM bytes used",
        image.rom_used(),
        image.rom.len(),
        image.eeprom_used(),
        image.eeprom.len()
    );
    Ok(image)
}

/// Turn a failed verification into an error carrying the first bad address.
fn check_report(report: VerifyReport) -> picprog::Result<()> {
    match report.first() {
        None => {
            log::info!("Verified OK");
            Ok(())
        }
        Some(m) => Err(Error::ProgrammingFailure {
            region: m.region,
            address: m.address,
        }),
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Program {
            target,
            path,
            fuses,
            id,
            format,
        } => {
            let chip = ChipDB::find_chip(&target.chip)?;
            let mut image = load_image(chip, &path, format)?;
            let overrides: BTreeMap<String, String> = fuses.into_iter().collect();
            image = image.apply_overrides(&overrides).inspect_err(|e| {
                if matches!(e, Error::UnknownFuse { .. } | Error::InvalidFuseValue { .. }) {
                    eprintln!("Fuse names and settings of {}:\n{}", chip, chip.fuse_doc());
                }
            })?;
            if let Some(UserId(id)) = id {
                image = image.with_id(&id)?;
            }

            let mut flashing = connect(&target)?;
            let report = flashing.program(&image, &mut ProgressReporter::default())?;
            check_report(report)?;
            log::info!("Chip programmed");
        }
        Command::Verify {
            target,
            path,
            format,
        } => {
            let chip = ChipDB::find_chip(&target.chip)?;
            let image = load_image(chip, &path, format)?;
            let mut flashing = connect(&target)?;
            let report = flashing.verify(&image, &mut ProgressReporter::default())?;
            check_report(report)?;
        }
        Command::Erase { target } => {
            let mut flashing = connect(&target)?;
            flashing.erase(&mut ProgressReporter::default())?;
        }
        Command::Dump {
            target,
            region,
            output,
            format,
        } => {
            let region = Region::from(region);
            let mut flashing = connect(&target)?;
            let image = flashing.dump(&[region], &mut ProgressReporter::default())?;
            if region == Region::Config {
                match image.extract_fuses() {
                    Ok(settings) => {
                        for (field, value) in settings {
                            log::info!("{}: {}", field, value);
                        }
                    }
                    Err(e) => log::warn!("{}", e),
                }
            }
            let raw = match format {
                FileFormat::Hex => format::serialize_hex_regions(&image, &[region])?.into_bytes(),
                FileFormat::Bin => format::serialize_binary(&image, region),
            };
            match output {
                Some(path) => {
                    std::fs::write(&path, &raw).with_context(|| format!("writing {}", path.display()))?;
                    log::info!("{} written to {}", region, path.display());
                }
                None => {
                    let mut stdout = std::io::stdout().lock();
                    stdout.write_all(&raw)?;
                    stdout.flush()?;
                }
            }
        }
        Command::ChipInfo { chip } => {
            let json = match chip {
                Some(name) => serde_json::to_string_pretty(&ChipDB::find_chip(&name)?.info())?,
                None => {
                    let all: BTreeMap<_, _> = ChipDB::get()?
                        .chips()
                        .into_iter()
                        .map(|c| (c.name.clone(), c.info()))
                        .collect();
                    serde_json::to_string_pretty(&all)?
                }
            };
            println!("{}", json);
        }
        Command::HexInfo { path, chip, json } => {
            let chip = ChipDB::find_chip(&chip)?;
            let info = load_image(chip, &path, Some(FileFormat::Hex))?.hex_info();
            if json {
                println!("{}", serde_json::to_string_pretty(&info)?);
            } else {
                print!("{}", info);
            }
        }
        Command::Ports => {
            let ports = SerialTransport::scan_ports()?;
            if ports.is_empty() {
                log::warn!("No serial ports found");
            }
            for port in ports {
                println!("{}", port);
            }
        }
    }
    Ok(())
}

fn exit_code(err: &anyhow::Error) -> u8 {
    if matches!(err.downcast_ref::<Error>(), Some(Error::Cancelled)) {
        return 130;
    }
    match err.downcast_ref::<Error>().map(Error::kind) {
        Some(ErrorKind::Validation) => 2,
        Some(ErrorKind::Device) => 3,
        Some(ErrorKind::Programming) => 4,
        Some(ErrorKind::Other) | None => 1,
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let level = if cli.verbose {
        simplelog::LevelFilter::Debug
    } else {
        simplelog::LevelFilter::Info
    };
    let _ = simplelog::TermLogger::init(
        level,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if matches!(e.downcast_ref::<Error>(), Some(Error::Cancelled)) => {
            log::warn!("Interrupted, programming voltages are off");
            ExitCode::from(exit_code(&e))
        }
        Err(e) => {
            log::error!("{:#}", e);
            ExitCode::from(exit_code(&e))
        }
    }
}
