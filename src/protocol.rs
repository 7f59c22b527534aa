//! Commands and data blocks of the K150 programmer protocol

use scroll::{BE, LE, Pread, Pwrite};

use crate::constants::{CONFIG_RESPONSE_SIZE, ID_FUSE_BLOCK_SIZE, Opcodes};
use crate::error::{Error, Result};

/// Parameters of the chip in the socket, sent before any memory command.
///
/// Encoded as `>HHBBBBBBB`, 11 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgrammingVars {
    /// In words
    pub rom_size: u16,
    pub eeprom_size: u16,
    pub core_type: u8,
    pub calibration_in_rom: bool,
    pub band_gap_fuse: bool,
    pub single_panel_access: bool,
    pub vcc_vpp_delay: bool,
    pub program_delay: u8,
    pub power_sequence: u8,
    pub erase_mode: u8,
    pub program_tries: u8,
    pub over_program: u8,
}

impl ProgrammingVars {
    pub const SIZE: usize = 11;

    pub fn flags(&self) -> u8 {
        (self.calibration_in_rom as u8)
            | (self.band_gap_fuse as u8) << 1
            | (self.single_panel_access as u8) << 2
            | (self.vcc_vpp_delay as u8) << 3
    }

    pub fn to_bytes(&self) -> Result<[u8; Self::SIZE]> {
        let mut buf = [0u8; Self::SIZE];
        buf.pwrite_with(self.rom_size, 0, BE).map_err(codec)?;
        buf.pwrite_with(self.eeprom_size, 2, BE).map_err(codec)?;
        buf[4] = self.core_type;
        buf[5] = self.flags();
        buf[6] = self.program_delay;
        buf[7] = self.power_sequence;
        buf[8] = self.erase_mode;
        buf[9] = self.program_tries;
        buf[10] = self.over_program;
        Ok(buf)
    }

    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        if raw.len() != Self::SIZE {
            return Err(Error::InvalidImage(format!(
                "programming vars must be {} bytes",
                Self::SIZE
            )));
        }
        let flags = raw[5];
        Ok(ProgrammingVars {
            rom_size: raw.pread_with(0, BE).map_err(codec)?,
            eeprom_size: raw.pread_with(2, BE).map_err(codec)?,
            core_type: raw[4],
            calibration_in_rom: flags & 1 != 0,
            band_gap_fuse: flags & 2 != 0,
            single_panel_access: flags & 4 != 0,
            vcc_vpp_delay: flags & 8 != 0,
            program_delay: raw[6],
            power_sequence: raw[7],
            erase_mode: raw[8],
            program_tries: raw[9],
            over_program: raw[10],
        })
    }
}

/// Answer to `READ_CONFIG`: device ID, user ID, fuses and calibration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChipConfig {
    pub chip_id: u16,
    pub id: [u8; 8],
    pub fuses: [u16; 7],
    pub calibrate: u16,
}

impl ChipConfig {
    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        if raw.len() != CONFIG_RESPONSE_SIZE {
            return Err(Error::protocol(
                "read config",
                format!("{} bytes", CONFIG_RESPONSE_SIZE),
                raw,
            ));
        }
        let mut id = [0u8; 8];
        id.copy_from_slice(&raw[2..10]);
        let mut fuses = [0u16; 7];
        for (i, fuse) in fuses.iter_mut().enumerate() {
            *fuse = raw.pread_with(10 + 2 * i, LE).map_err(codec)?;
        }
        Ok(ChipConfig {
            chip_id: raw.pread_with(0, LE).map_err(codec)?,
            id,
            fuses,
            calibrate: raw.pread_with(24, LE).map_err(codec)?,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; CONFIG_RESPONSE_SIZE];
        buf.pwrite_with(self.chip_id, 0, LE).map_err(codec)?;
        buf[2..10].copy_from_slice(&self.id);
        for (i, fuse) in self.fuses.iter().enumerate() {
            buf.pwrite_with(*fuse, 10 + 2 * i, LE).map_err(codec)?;
        }
        buf.pwrite_with(self.calibrate, 24, LE).map_err(codec)?;
        Ok(buf)
    }
}

/// K150 command, as sent after entering the jump table
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Echo one byte back.
    Echo(u8),
    InitProgrammingVars(ProgrammingVars),
    VoltagesOn,
    VoltagesOff,
    CycleVoltages,
    /// Start a ROM write of `words` words; data follows in 32-byte blocks.
    ProgramRom { words: u16 },
    /// Start an EEPROM write of `bytes` bytes; data follows in 2-byte units.
    ProgramEeprom { bytes: u16 },
    /// User ID and configuration words.
    ///
    /// 14-bit and 12-bit cores take 4 ID bytes, 16-bit cores take 8.
    ProgramIdFuses {
        id: Vec<u8>,
        fuses: Vec<u16>,
        wide_core: bool,
    },
    /// Restore oscillator calibration and the fuse word holding the band-gap bits.
    ProgramCalibration { calibration: u16, fuse: u16 },
    ReadRom,
    ReadEeprom,
    ReadConfig,
    EraseChip,
    /// Scan ROM for words whose high byte differs from `high_byte`.
    RomIsBlank { high_byte: u8 },
    EepromIsBlank,
    /// Commit the configuration words loaded by `ProgramIdFuses` (16-bit cores).
    Commit18FFuses { fuses: Vec<u16> },
    WaitChipInSocket,
    ProgrammerVersion,
    ProgrammerProtocol,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Echo(_) => "echo",
            Command::InitProgrammingVars(_) => "init programming vars",
            Command::VoltagesOn => "voltages on",
            Command::VoltagesOff => "voltages off",
            Command::CycleVoltages => "cycle voltages",
            Command::ProgramRom { .. } => "program ROM",
            Command::ProgramEeprom { .. } => "program EEPROM",
            Command::ProgramIdFuses { .. } => "program ID and fuses",
            Command::ProgramCalibration { .. } => "program calibration",
            Command::ReadRom => "read ROM",
            Command::ReadEeprom => "read EEPROM",
            Command::ReadConfig => "read config",
            Command::EraseChip => "erase chip",
            Command::RomIsBlank { .. } => "ROM blank check",
            Command::EepromIsBlank => "EEPROM blank check",
            Command::Commit18FFuses { .. } => "commit 18F fuses",
            Command::WaitChipInSocket => "wait for chip insertion",
            Command::ProgrammerVersion => "programmer version",
            Command::ProgrammerProtocol => "programmer protocol",
        }
    }

    pub fn into_raw(self, op: &Opcodes) -> Result<Vec<u8>> {
        match self {
            Command::Echo(byte) => Ok(vec![op.echo, byte]),
            Command::InitProgrammingVars(vars) => {
                let mut buf = Vec::with_capacity(1 + ProgrammingVars::SIZE);
                buf.push(op.init_programming_vars);
                buf.extend_from_slice(&vars.to_bytes()?);
                Ok(buf)
            }
            Command::VoltagesOn => Ok(vec![op.voltages_on]),
            Command::VoltagesOff => Ok(vec![op.voltages_off]),
            Command::CycleVoltages => Ok(vec![op.cycle_voltages]),
            Command::ProgramRom { words } => {
                let mut buf = [op.program_rom, 0, 0];
                buf.pwrite_with(words, 1, BE).map_err(codec)?;
                Ok(buf.to_vec())
            }
            Command::ProgramEeprom { bytes } => {
                let mut buf = [op.program_eeprom, 0, 0];
                buf.pwrite_with(bytes, 1, BE).map_err(codec)?;
                Ok(buf.to_vec())
            }
            Command::ProgramIdFuses {
                id,
                fuses,
                wide_core,
            } => {
                let mut buf = Vec::with_capacity(1 + ID_FUSE_BLOCK_SIZE);
                buf.push(op.program_id_fuses);
                buf.extend_from_slice(b"00");
                if wide_core {
                    if id.len() != 8 || fuses.len() != 7 {
                        return Err(Error::InvalidImage(
                            "16-bit cores take 8 ID bytes and 7 fuse words".into(),
                        ));
                    }
                    buf.extend_from_slice(&id);
                } else {
                    if id.len() != 4 || fuses.is_empty() || fuses.len() > 7 {
                        return Err(Error::InvalidImage(
                            "12/14-bit cores take 4 ID bytes and 1 to 7 fuse words".into(),
                        ));
                    }
                    buf.extend_from_slice(&id);
                    buf.extend_from_slice(b"FFFF");
                }
                for fuse in &fuses {
                    buf.extend_from_slice(&fuse.to_le_bytes());
                }
                buf.resize(1 + ID_FUSE_BLOCK_SIZE, 0xff);
                Ok(buf)
            }
            Command::ProgramCalibration { calibration, fuse } => {
                let mut buf = [op.program_calibration, 0, 0, 0, 0];
                buf.pwrite_with(calibration, 1, BE).map_err(codec)?;
                buf.pwrite_with(fuse, 3, BE).map_err(codec)?;
                Ok(buf.to_vec())
            }
            Command::ReadRom => Ok(vec![op.read_rom]),
            Command::ReadEeprom => Ok(vec![op.read_eeprom]),
            Command::ReadConfig => Ok(vec![op.read_config]),
            Command::EraseChip => Ok(vec![op.erase_chip]),
            Command::RomIsBlank { high_byte } => Ok(vec![op.rom_is_blank, high_byte]),
            Command::EepromIsBlank => Ok(vec![op.eeprom_is_blank]),
            Command::Commit18FFuses { fuses } => {
                let mut buf = vec![op.commit_18f_fuses];
                if op.commit_carries_fuses {
                    // ID bytes are sent as zeros, only the fuses are committed
                    buf.extend_from_slice(&[0u8; 10]);
                    for fuse in &fuses {
                        buf.extend_from_slice(&fuse.to_le_bytes());
                    }
                }
                Ok(buf)
            }
            Command::WaitChipInSocket => Ok(vec![op.wait_chip_in_socket]),
            Command::ProgrammerVersion => Ok(vec![op.programmer_version]),
            Command::ProgrammerProtocol => Ok(vec![op.programmer_protocol]),
        }
    }
}

fn codec(e: scroll::Error) -> Error {
    Error::InvalidImage(e.to_string())
}
