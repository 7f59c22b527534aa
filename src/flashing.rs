//! Chip programming workflows.
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use signal_hook::consts::SIGINT;

use crate::device::{Chip, ChipDB};
use crate::error::{Error, Region, Result, Step};
use crate::image::MemoryImage;
use crate::protocol::ChipConfig;
use crate::session::{Options, Session, SessionState, programmer_model};
use crate::transport::Transport;

/// Sent through the echo command right after connecting
const ECHO_MESSAGE: &[u8] = b"Hello programmer!";

/// Receives workflow notifications.
pub trait Progress {
    fn step(&mut self, _step: Step) {}
    /// `done` of `total` words (ROM) or bytes (EEPROM) transferred
    fn position(&mut self, _done: usize, _total: usize) {}
}

pub struct NoProgress;

impl Progress for NoProgress {}

/// First differing location of a region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mismatch {
    pub region: Region,
    pub address: u32,
    pub expected: u16,
    pub found: u16,
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} differs at 0x{:04x}: expected 0x{:04x}, found 0x{:04x}",
            self.region, self.address, self.expected, self.found
        )
    }
}

/// Outcome of comparing a chip against an image, at most one mismatch per region.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyReport {
    pub mismatches: Vec<Mismatch>,
}

impl VerifyReport {
    pub fn is_ok(&self) -> bool {
        self.mismatches.is_empty()
    }

    pub fn first(&self) -> Option<&Mismatch> {
        self.mismatches.first()
    }
}

pub struct Flashing<T: Transport> {
    session: Session<T>,
    cancel: Arc<AtomicBool>,
}

impl<T: Transport> Flashing<T> {
    /// Look up `chip_name`, then open a transport with `open` and greet the programmer.
    ///
    /// An unknown chip fails before `open` is called.
    pub fn connect(chip_name: &str, options: Options, open: impl FnOnce() -> Result<T>) -> Result<Self> {
        let chip = ChipDB::find_chip(chip_name)?;
        let transport = open().map_err(|e| e.at(Step::Connect))?;
        let mut session = Session::open(transport, chip, options).map_err(|e| e.at(Step::Connect))?;

        let reply = session.echo(ECHO_MESSAGE).map_err(|e| e.at(Step::Connect))?;
        if reply != ECHO_MESSAGE {
            return Err(Error::Connection(format!(
                "echo returned {:?}",
                String::from_utf8_lossy(&reply)
            ))
            .at(Step::Connect));
        }
        Ok(Flashing {
            session,
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn chip(&self) -> &'static Chip {
        self.session.chip()
    }

    /// Setting the flag stops the running workflow at the next block boundary.
    ///
    /// The workflow that observes the flag clears it, so later workflows run normally.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    /// Raise the cancel flag on Ctrl-C.
    ///
    /// A second Ctrl-C before the running workflow has stopped exits the process.
    pub fn cancel_on_interrupt(&self) -> Result<()> {
        signal_hook::flag::register_conditional_shutdown(SIGINT, 130, self.cancel.clone())?;
        signal_hook::flag::register(SIGINT, self.cancel.clone())?;
        Ok(())
    }

    pub fn dump_info(&mut self) -> Result<()> {
        let protocol = self.session.programmer_protocol()?;
        log::info!(
            "Programmer: {} (firmware {}, protocol {})",
            programmer_model(self.session.firmware_version().unwrap_or(0xff)),
            self.session.firmware_version().unwrap_or(0xff),
            protocol
        );
        let chip = self.chip();
        log::info!(
            "Chip: {} (ROM: {} words, EEPROM: {} bytes, core: {} bits)",
            chip,
            chip.rom_size,
            chip.eeprom_size,
            chip.core_bits()
        );
        Ok(())
    }

    /// Erase the chip and write `image`, then read it back.
    ///
    /// 16-bit fuses are committed only when ROM and EEPROM verify.
    pub fn program(&mut self, image: &MemoryImage, progress: &mut dyn Progress) -> Result<VerifyReport> {
        self.check_image(image)?;
        let chip = self.chip();
        self.enter(progress)?;
        let config = self.check_chip_id(progress)?;

        self.run(progress, Step::Erase, |s, _, _| {
            s.erase()?;
            s.cycle_voltages()
        })?;
        log::info!("Chip erased");

        self.run(progress, Step::WriteRom, |s, p, cancel| {
            s.write_rom_with(&image.rom, |done, total| {
                p.position(done, total);
                check_cancel(cancel)
            })
        })?;
        log::info!("ROM programmed, {} words", image.rom.len());

        if chip.has_eeprom() {
            self.run(progress, Step::WriteEeprom, |s, p, cancel| {
                s.write_eeprom_with(&image.eeprom, |done, total| {
                    p.position(done, total);
                    check_cancel(cancel)
                })
            })?;
            log::info!("EEPROM programmed, {} bytes", image.eeprom.len());
        }

        let commit = self.run(progress, Step::WriteConfig, |s, _, _| {
            s.write_config(&image.config.id, &image.config.fuses)
        })?;
        log::info!("ID and fuses programmed");

        if chip.cal_word || chip.band_gap {
            let fuse = image.config.fuses.first().copied().unwrap_or(0xffff);
            self.run(progress, Step::WriteCalibration, |s, _, _| {
                s.write_calibration(config.calibrate, fuse)
            })?;
            log::info!("Calibration 0x{:04x} restored", config.calibrate);
        }

        let mut report = self.verify_memories(image, &config, progress)?;
        if report.is_ok() {
            if let Some(commit) = commit {
                self.run(progress, Step::CommitFuses, |s, _, _| s.commit_18f_fuses(commit))?;
                log::info!("16-bit fuses committed");
            }
            let config = self.run(progress, Step::ReadConfig, |s, _, _| s.read_config())?;
            report.mismatches.extend(compare_fuses(chip, &image.config.fuses, &config.fuses));
        } else {
            log::warn!("Verification failed, fuses are left uncommitted");
        }

        self.leave(progress)?;
        Ok(report)
    }

    /// Compare the chip against `image`. The user ID is not compared.
    pub fn verify(&mut self, image: &MemoryImage, progress: &mut dyn Progress) -> Result<VerifyReport> {
        self.check_image(image)?;
        self.enter(progress)?;
        let config = self.check_chip_id(progress)?;
        let mut report = self.verify_memories(image, &config, progress)?;
        report
            .mismatches
            .extend(compare_fuses(self.chip(), &image.config.fuses, &config.fuses));
        self.leave(progress)?;
        Ok(report)
    }

    pub fn erase(&mut self, progress: &mut dyn Progress) -> Result<()> {
        self.enter(progress)?;
        self.run(progress, Step::Erase, |s, _, _| s.erase())?;
        log::info!("Chip erased");
        self.leave(progress)
    }

    /// Read `regions` back into an otherwise blank image.
    pub fn dump(&mut self, regions: &[Region], progress: &mut dyn Progress) -> Result<MemoryImage> {
        let chip = self.chip();
        let mut image = MemoryImage::blank(chip);
        self.enter(progress)?;
        for region in regions {
            match region {
                Region::Rom => {
                    let blank = chip.rom_blank_word();
                    let words = self.read_rom(progress)?;
                    image.rom = words.into_iter().map(|w| w & blank).collect();
                }
                Region::Eeprom => {
                    image.eeprom = self.run(progress, Step::ReadEeprom, |s, _, _| {
                        s.read_eeprom(0..chip.eeprom_size as usize)
                    })?;
                }
                Region::Config => {
                    let config = self.run(progress, Step::ReadConfig, |s, _, _| s.read_config())?;
                    image.config.id = config.id[..chip.id_size()].to_vec();
                    image.config.fuses = config.fuses[..chip.config_words()].to_vec();
                }
            }
            log::info!("{} read", region);
        }
        self.leave(progress)?;
        Ok(image)
    }

    fn check_image(&self, image: &MemoryImage) -> Result<()> {
        let chip = self.chip();
        if image.chip().name != chip.name {
            return Err(Error::InvalidImage(format!(
                "image is for {}, programmer is set up for {}",
                image.chip(),
                chip
            )));
        }
        Ok(())
    }

    /// Run one session call as workflow `step`, attaching the step to any error.
    fn run<R>(
        &mut self,
        progress: &mut dyn Progress,
        step: Step,
        f: impl FnOnce(&mut Session<T>, &mut dyn Progress, &AtomicBool) -> Result<R>,
    ) -> Result<R> {
        let Flashing { session, cancel } = self;
        let cancel: &AtomicBool = cancel;
        let result = check_cancel(cancel).and_then(|_| {
            log::debug!("Step: {}", step);
            progress.step(step);
            f(session, progress, cancel)
        });
        if matches!(result, Err(Error::Cancelled)) {
            log::warn!("{} cancelled", step);
            cancel.store(false, Ordering::SeqCst);
        }
        result.map_err(|e| e.at(step))
    }

    fn enter(&mut self, progress: &mut dyn Progress) -> Result<()> {
        if self.session.state() == SessionState::InProgrammingMode {
            return Ok(());
        }
        self.run(progress, Step::EnterProgrammingMode, |s, _, _| s.enter_programming_mode())
    }

    fn leave(&mut self, progress: &mut dyn Progress) -> Result<()> {
        self.run(progress, Step::ExitProgrammingMode, |s, _, _| s.exit_programming_mode())
    }

    fn check_chip_id(&mut self, progress: &mut dyn Progress) -> Result<ChipConfig> {
        let chip = self.chip();
        self.run(progress, Step::CheckChipId, |s, _, _| {
            let config = s.read_config()?;
            if !chip.matches_id(config.chip_id) {
                return Err(Error::ChipIdMismatch {
                    chip: chip.name.clone(),
                    expected: chip.chip_id,
                    found: config.chip_id,
                });
            }
            log::debug!("Chip ID 0x{:04x}, calibration 0x{:04x}", config.chip_id, config.calibrate);
            Ok(config)
        })
    }

    fn read_rom(&mut self, progress: &mut dyn Progress) -> Result<Vec<u16>> {
        let size = self.chip().rom_size as usize;
        self.run(progress, Step::ReadRom, |s, p, cancel| {
            s.read_rom_with(0..size, |done, total| {
                p.position(done, total);
                check_cancel(cancel)
            })
        })
    }

    fn verify_memories(
        &mut self,
        image: &MemoryImage,
        config: &ChipConfig,
        progress: &mut dyn Progress,
    ) -> Result<VerifyReport> {
        let chip = self.chip();
        let mut report = VerifyReport::default();

        let mut expected = image.rom.clone();
        if chip.cal_word {
            // the last word holds the factory calibration, never the image
            if let Some(last) = expected.last_mut() {
                *last = config.calibrate;
            }
        }
        let found = self.read_rom(progress)?;
        report
            .mismatches
            .extend(first_mismatch(Region::Rom, &expected, &found));

        if chip.has_eeprom() {
            let found = self.run(progress, Step::ReadEeprom, |s, _, _| {
                s.read_eeprom(0..chip.eeprom_size as usize)
            })?;
            report
                .mismatches
                .extend(first_mismatch(Region::Eeprom, &image.eeprom, &found));
        }
        for m in &report.mismatches {
            log::warn!("{}", m);
        }
        Ok(report)
    }
}

fn check_cancel(cancel: &AtomicBool) -> Result<()> {
    if cancel.load(Ordering::SeqCst) {
        return Err(Error::Cancelled);
    }
    Ok(())
}

fn first_mismatch<W>(region: Region, expected: &[W], found: &[W]) -> Option<Mismatch>
where
    W: Copy + PartialEq + Into<u16>,
{
    if let Some(address) = expected.iter().zip(found).position(|(e, f)| e != f) {
        return Some(Mismatch {
            region,
            address: address as u32,
            expected: expected[address].into(),
            found: found[address].into(),
        });
    }
    // a short read-back counts as a mismatch at its end
    (found.len() < expected.len()).then(|| Mismatch {
        region,
        address: found.len() as u32,
        expected: expected[found.len()].into(),
        found: 0,
    })
}

/// Compare only the bits owned by some fuse field.
fn compare_fuses(chip: &Chip, expected: &[u16], found: &[u16]) -> Option<Mismatch> {
    let mut masks = vec![0u16; expected.len()];
    for field in &chip.fuses {
        for (i, m) in field.mask().into_iter().enumerate() {
            if let Some(mask) = masks.get_mut(field.word + i) {
                *mask |= m;
            }
        }
    }
    let mismatch = expected
        .iter()
        .zip(found)
        .zip(&masks)
        .position(|((e, f), m)| e & m != f & m)
        .map(|word| Mismatch {
            region: Region::Config,
            address: word as u32,
            expected: expected[word],
            found: found[word],
        });
    if let Some(m) = &mismatch {
        log::warn!("{}", m);
    }
    mismatch
}
