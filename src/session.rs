//! Protocol session with one programmer.
use std::fmt;
use std::ops::Range;
use std::thread::sleep;
use std::time::Duration;

use clap::{ValueEnum, builder::PossibleValue};

use crate::Transport;
use crate::constants::{
    CONFIG_RESPONSE_SIZE, EEPROM_UNIT_SIZE, GREETING, Opcodes, ROM_BLOCK_SIZE, Timing, acks, framing,
    opcodes,
};
use crate::device::Chip;
use crate::error::{Error, Region, Result};
use crate::protocol::{ChipConfig, Command};

/// Firmware protocol revision, selects the opcode table.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProtocolRevision {
    #[default]
    P18A,
    P018,
    P016,
}

impl ProtocolRevision {
    pub fn opcodes(self) -> Opcodes {
        match self {
            ProtocolRevision::P18A => opcodes::P18A,
            ProtocolRevision::P018 => opcodes::P018,
            ProtocolRevision::P016 => opcodes::P016,
        }
    }
}

impl fmt::Display for ProtocolRevision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(self.opcodes().protocol))
    }
}

impl ValueEnum for ProtocolRevision {
    fn value_variants<'a>() -> &'a [Self] {
        &[ProtocolRevision::P18A, ProtocolRevision::P018, ProtocolRevision::P016]
    }

    fn to_possible_value(&self) -> Option<PossibleValue> {
        match self {
            ProtocolRevision::P18A => Some(PossibleValue::new("p18a").aliases(["P18A", "k150"])),
            ProtocolRevision::P018 => Some(PossibleValue::new("p018").aliases(["P018", "k149"])),
            ProtocolRevision::P016 => Some(PossibleValue::new("p016").aliases(["P016", "k128"])),
        }
    }
}

/// Session configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Options {
    pub protocol: ProtocolRevision,
    /// Chip is wired to the ICSP header instead of sitting in the socket
    pub icsp: bool,
    pub timing: Timing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Connected,
    InProgrammingMode,
}

impl SessionState {
    fn name(self) -> &'static str {
        match self {
            SessionState::Closed => "closed",
            SessionState::Connected => "connected",
            SessionState::InProgrammingMode => "in programming mode",
        }
    }
}

/// Board name for the version byte of the greeting
pub fn programmer_model(version: u8) -> &'static str {
    match version {
        0 => "K128",
        1 => "K149-A",
        2 => "K149-B",
        3 => "K150",
        _ => "unknown",
    }
}

/// Fuses loaded into a 16-bit core, waiting to be committed.
#[must_use = "16-bit fuses take effect only once committed"]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuseCommit {
    fuses: Vec<u16>,
}

pub struct Session<T: Transport> {
    transport: T,
    chip: &'static Chip,
    options: Options,
    ops: Opcodes,
    state: SessionState,
    firmware_version: Option<u8>,
}

impl<T: Transport> Session<T> {
    /// Reset the programmer and check it speaks the configured protocol.
    pub fn open(transport: T, chip: &'static Chip, options: Options) -> Result<Self> {
        let mut session = Session {
            transport,
            chip,
            options,
            ops: options.protocol.opcodes(),
            state: SessionState::Closed,
            firmware_version: None,
        };
        session.firmware_version = Some(session.reset()?);

        let protocol = session
            .query_protocol()
            .map_err(|e| Error::Connection(format!("protocol query failed: {}", e)))?;
        if protocol != session.ops.protocol[..] {
            return Err(Error::Connection(format!(
                "programmer speaks {:?}, configured for {}",
                String::from_utf8_lossy(&protocol),
                options.protocol
            )));
        }
        session.state = SessionState::Connected;
        log::info!(
            "Connected to {} programmer, protocol {}",
            programmer_model(session.firmware_version.unwrap_or(0xff)),
            options.protocol
        );
        Ok(session)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn chip(&self) -> &'static Chip {
        self.chip
    }

    /// Version byte of the greeting, 3 for a K150
    pub fn firmware_version(&self) -> Option<u8> {
        self.firmware_version
    }

    /// Toggle DTR until the programmer greets, trying both polarities.
    fn reset(&mut self) -> Result<u8> {
        let timing = self.options.timing;
        self.transport.set_dtr(true)?;
        sleep(timing.reset / 3);
        self.transport.clear_input()?;
        self.transport.set_dtr(false)?;
        sleep(timing.reset / 3);
        let mut greeting = self.transport.read(2, timing.reset)?;
        if greeting.is_empty() {
            log::debug!("no greeting with DTR low, retrying with DTR high");
            self.transport.set_dtr(true)?;
            sleep(timing.reset / 3);
            greeting = self.transport.read(2, timing.reset)?;
        }
        match greeting.as_slice() {
            [GREETING, version] => Ok(*version),
            [GREETING] => Ok(0xff),
            _ => Err(Error::Connection(format!(
                "no greeting from programmer (received {})",
                if greeting.is_empty() {
                    "nothing".to_string()
                } else {
                    hex::encode(&greeting)
                }
            ))),
        }
    }

    fn require(&self, operation: &'static str, state: SessionState) -> Result<()> {
        if self.state != state {
            return Err(Error::InvalidState {
                operation,
                state: self.state.name(),
            });
        }
        Ok(())
    }

    fn require_open(&self, operation: &'static str) -> Result<()> {
        if self.state == SessionState::Closed {
            return Err(Error::InvalidState {
                operation,
                state: self.state.name(),
            });
        }
        Ok(())
    }

    fn command_start(&mut self, operation: &'static str) -> Result<()> {
        let ack = self.options.timing.ack;
        // leaves the jump table if we are in it, harmless otherwise
        self.transport.write(&[framing::RESYNC])?;
        self.transport.expect(operation, acks::COMMAND_END, ack)?;
        self.transport.write(&[framing::JUMP_TABLE])?;
        self.transport.expect(operation, acks::COMMAND_START, ack)
    }

    fn command_end(&mut self, operation: &'static str) -> Result<()> {
        self.transport.write(&[framing::RESYNC])?;
        self.transport
            .expect(operation, acks::COMMAND_END, self.options.timing.ack)
    }

    fn send(&mut self, cmd: Command) -> Result<()> {
        let raw = cmd.into_raw(&self.ops)?;
        self.transport.write(&raw)
    }

    fn set_voltages(&mut self, on: bool) -> Result<()> {
        let (cmd, ack, operation) = if on {
            (Command::VoltagesOn, acks::VOLTAGES_ON, "voltages on")
        } else {
            (Command::VoltagesOff, acks::VOLTAGES_OFF, "voltages off")
        };
        self.send(cmd)?;
        self.transport.expect(operation, ack, self.options.timing.ack)
    }

    /// Run a command inside the jump table, without programming voltages.
    fn simple_command<R>(
        &mut self,
        cmd: Command,
        body: impl FnOnce(&mut Self, &'static str) -> Result<R>,
    ) -> Result<R> {
        let operation = cmd.name();
        self.command_start(operation)?;
        self.send(cmd)?;
        let value = body(self, operation)?;
        self.command_end(operation)?;
        Ok(value)
    }

    /// Run a command that touches chip memory, bracketed by programming voltages.
    ///
    /// On failure the programmer may still be expecting data, so it is reset.
    fn memory_command<R>(
        &mut self,
        cmd: Command,
        body: impl FnOnce(&mut Self, &'static str) -> Result<R>,
    ) -> Result<R> {
        let operation = cmd.name();
        let result = self.command_start(operation).and_then(|_| {
            self.set_voltages(true)?;
            self.send(cmd)?;
            let value = body(self, operation)?;
            self.set_voltages(false)?;
            self.command_end(operation)?;
            Ok(value)
        });
        if result.is_err() {
            self.recover();
        }
        result
    }

    fn recover(&mut self) {
        log::warn!("Resetting programmer to leave the interrupted command");
        match self.reset() {
            Ok(_) => {
                // a reset drops the programming variables
                if self.state == SessionState::InProgrammingMode {
                    self.state = SessionState::Connected;
                }
            }
            Err(e) => log::warn!("Programmer reset failed: {}", e),
        }
    }

    /// Send the programming variables, then wait for the chip (socket mode).
    pub fn enter_programming_mode(&mut self) -> Result<()> {
        self.require("enter programming mode", SessionState::Connected)?;
        let icsp = self.options.icsp || self.chip.icsp_only;
        let vars = self.chip.programming_vars(icsp);
        log::debug!("Programming vars: {:?}", vars);
        self.simple_command(Command::InitProgrammingVars(vars), |s, op| {
            s.transport
                .expect(op, acks::PROGRAMMING_VARS, s.options.timing.ack)
        })?;

        if icsp {
            log::info!("Accessing chip connected to the ICSP port");
        } else {
            log::info!(
                "Waiting for {} in the socket, pin 1 at {}",
                self.chip,
                self.chip.pin1_location()
            );
            self.simple_command(Command::WaitChipInSocket, |s, op| {
                s.transport
                    .expect(op, acks::SOCKET_ARMED, s.options.timing.ack)?;
                s.transport.expect(op, acks::YES, s.options.timing.read)
            })?;
            log::info!("Chip detected");
        }
        self.state = SessionState::InProgrammingMode;
        Ok(())
    }

    pub fn exit_programming_mode(&mut self) -> Result<()> {
        self.require("exit programming mode", SessionState::InProgrammingMode)?;
        // voltages are already off between commands; make sure of it
        let operation = "exit programming mode";
        self.command_start(operation)?;
        self.set_voltages(false)?;
        self.command_end(operation)?;
        self.state = SessionState::Connected;
        Ok(())
    }

    pub fn erase(&mut self) -> Result<()> {
        self.require("erase", SessionState::InProgrammingMode)?;
        self.memory_command(Command::EraseChip, |s, op| {
            sleep(s.options.timing.erase_settle);
            s.transport.expect(op, acks::YES, s.options.timing.program)
        })
    }

    /// Switch the programming voltages off and on again, e.g. between erase and write.
    pub fn cycle_voltages(&mut self) -> Result<()> {
        self.require("cycle voltages", SessionState::InProgrammingMode)?;
        self.memory_command(Command::CycleVoltages, |s, op| {
            s.transport
                .expect(op, acks::VOLTAGES_ON, s.options.timing.ack)
        })
    }

    /// Program ROM from word 0.
    pub fn write_rom(&mut self, words: &[u16]) -> Result<()> {
        self.write_rom_with(words, |_, _| Ok(()))
    }

    /// Program ROM from word 0, calling `on_block(done, total)` after every
    /// acknowledged block. An error from `on_block` aborts the write.
    pub fn write_rom_with(
        &mut self,
        words: &[u16],
        mut on_block: impl FnMut(usize, usize) -> Result<()>,
    ) -> Result<()> {
        self.require("write ROM", SessionState::InProgrammingMode)?;
        if words.len() > self.chip.rom_size as usize {
            return Err(Error::InvalidImage(format!(
                "{} ROM words do not fit in {} words",
                words.len(),
                self.chip.rom_size
            )));
        }
        let block_words = ROM_BLOCK_SIZE / 2;
        let mut padded = words.to_vec();
        padded.resize(words.len().div_ceil(block_words) * block_words, self.chip.rom_blank_word());
        if padded.is_empty() {
            return Ok(());
        }
        let raw: Vec<u8> = padded.iter().flat_map(|w| w.to_be_bytes()).collect();
        let total = padded.len();

        self.memory_command(
            Command::ProgramRom {
                words: total as u16,
            },
            |s, op| {
                let timing = s.options.timing;
                s.transport.expect(op, acks::YES, timing.program)?;
                for (i, block) in raw.chunks(ROM_BLOCK_SIZE).enumerate() {
                    s.transport.write(block)?;
                    sleep(timing.write_settle);
                    s.block_ack(op, Region::Rom, timing.program)?;
                    on_block((i + 1) * block_words, total)?;
                }
                s.transport.expect(op, acks::BLOCK_DONE, timing.program)
            },
        )
    }

    /// `Y`, or `N` followed by the address of the word that failed.
    fn block_ack(&mut self, operation: &'static str, region: Region, timeout: Duration) -> Result<()> {
        let resp = self.transport.read(1, timeout)?;
        match resp.as_slice() {
            [acks::YES] => Ok(()),
            [acks::NO] => {
                let raw = self.transport.read_exact(operation, 2, timeout)?;
                Err(Error::ProgrammingFailure {
                    region,
                    address: u16::from_be_bytes([raw[0], raw[1]]) as u32,
                })
            }
            _ => Err(Error::protocol(operation, acks::YES as char, &resp)),
        }
    }

    pub fn read_rom(&mut self, range: Range<usize>) -> Result<Vec<u16>> {
        self.read_rom_with(range, |_, _| Ok(()))
    }

    /// Read the whole ROM and return the words in `range`.
    pub fn read_rom_with(
        &mut self,
        range: Range<usize>,
        mut on_block: impl FnMut(usize, usize) -> Result<()>,
    ) -> Result<Vec<u16>> {
        self.require("read ROM", SessionState::InProgrammingMode)?;
        let size = self.chip.rom_size as usize;
        check_range(&range, size, Region::Rom)?;
        let raw = self.memory_command(Command::ReadRom, |s, op| {
            let mut raw = Vec::with_capacity(size * 2);
            while raw.len() < size * 2 {
                let len = (size * 2 - raw.len()).min(ROM_BLOCK_SIZE);
                raw.extend(s.transport.read_exact(op, len, s.options.timing.read)?);
                on_block(raw.len() / 2, size)?;
            }
            Ok(raw)
        })?;
        Ok(raw[range.start * 2..range.end * 2]
            .chunks_exact(2)
            .map(|w| u16::from_be_bytes([w[0], w[1]]))
            .collect())
    }

    pub fn write_eeprom(&mut self, bytes: &[u8]) -> Result<()> {
        self.write_eeprom_with(bytes, |_, _| Ok(()))
    }

    /// Program EEPROM from byte 0, two bytes at a time.
    pub fn write_eeprom_with(
        &mut self,
        bytes: &[u8],
        mut on_block: impl FnMut(usize, usize) -> Result<()>,
    ) -> Result<()> {
        self.require("write EEPROM", SessionState::InProgrammingMode)?;
        if bytes.len() > self.chip.eeprom_size as usize {
            return Err(Error::InvalidImage(format!(
                "{} EEPROM bytes do not fit in {} bytes",
                bytes.len(),
                self.chip.eeprom_size
            )));
        }
        let mut padded = bytes.to_vec();
        padded.resize(bytes.len().div_ceil(EEPROM_UNIT_SIZE) * EEPROM_UNIT_SIZE, 0xff);
        if padded.is_empty() {
            return Ok(());
        }
        let total = padded.len();

        self.memory_command(
            Command::ProgramEeprom {
                bytes: total as u16,
            },
            |s, op| {
                let timing = s.options.timing;
                s.transport.expect(op, acks::YES, timing.program)?;
                for (i, unit) in padded.chunks(EEPROM_UNIT_SIZE).enumerate() {
                    s.transport.write(unit)?;
                    sleep(timing.write_settle);
                    s.block_ack(op, Region::Eeprom, timing.program)?;
                    on_block((i + 1) * EEPROM_UNIT_SIZE, total)?;
                }
                // two filler bytes, no effect if the programmer is already back in the jump table
                s.transport.write(&[0, 0])?;
                s.transport.expect(op, acks::BLOCK_DONE, timing.program)
            },
        )
    }

    pub fn read_eeprom(&mut self, range: Range<usize>) -> Result<Vec<u8>> {
        self.require("read EEPROM", SessionState::InProgrammingMode)?;
        let size = self.chip.eeprom_size as usize;
        check_range(&range, size, Region::Eeprom)?;
        if size == 0 {
            return Ok(Vec::new());
        }
        let raw = self.memory_command(Command::ReadEeprom, |s, op| {
            s.transport.read_exact(op, size, s.options.timing.read)
        })?;
        Ok(raw[range].to_vec())
    }

    pub fn read_config(&mut self) -> Result<ChipConfig> {
        self.require("read config", SessionState::InProgrammingMode)?;
        self.memory_command(Command::ReadConfig, |s, op| {
            let timing = s.options.timing;
            s.transport.expect(op, acks::READ_CONFIG, timing.ack)?;
            let raw = s
                .transport
                .read_exact(op, CONFIG_RESPONSE_SIZE, timing.ack)?;
            ChipConfig::from_bytes(&raw)
        })
    }

    pub fn read_chip_id(&mut self) -> Result<u16> {
        Ok(self.read_config()?.chip_id)
    }

    /// Program user ID and configuration words.
    ///
    /// On 16-bit cores the fuses only take effect once the returned
    /// [`FuseCommit`] is passed to [`Session::commit_18f_fuses`].
    pub fn write_config(&mut self, id: &[u8], fuses: &[u16]) -> Result<Option<FuseCommit>> {
        self.require("write config", SessionState::InProgrammingMode)?;
        let wide_core = self.chip.core_bits() == 16;
        let mut fuses = fuses.to_vec();
        if wide_core {
            fuses.resize(7, 0xffff);
        }
        let cmd = Command::ProgramIdFuses {
            id: id.to_vec(),
            fuses: fuses.clone(),
            wide_core,
        };
        self.memory_command(cmd, |s, op| {
            let resp = s.transport.read(1, s.options.timing.program)?;
            match resp.as_slice() {
                [acks::YES] => Ok(()),
                [acks::NO] => Err(Error::ProgrammingFailure {
                    region: Region::Config,
                    address: 0,
                }),
                _ => Err(Error::protocol(op, acks::YES as char, &resp)),
            }
        })?;
        Ok(wide_core.then_some(FuseCommit { fuses }))
    }

    pub fn commit_18f_fuses(&mut self, commit: FuseCommit) -> Result<()> {
        self.require("commit fuses", SessionState::InProgrammingMode)?;
        let cmd = Command::Commit18FFuses {
            fuses: commit.fuses,
        };
        let check = |s: &mut Self, op| {
            let resp = s.transport.read(1, s.options.timing.program)?;
            if resp != [acks::YES] {
                return Err(Error::protocol(op, acks::YES as char, &resp));
            }
            Ok(())
        };
        if self.ops.commit_carries_fuses {
            self.memory_command(cmd, check)
        } else {
            self.simple_command(cmd, check)
        }
    }

    /// Restore the oscillator calibration word and the band-gap bits of `fuse`.
    pub fn write_calibration(&mut self, calibration: u16, fuse: u16) -> Result<()> {
        self.require("write calibration", SessionState::InProgrammingMode)?;
        self.memory_command(Command::ProgramCalibration { calibration, fuse }, |s, op| {
            let resp = s.transport.read(1, s.options.timing.program)?;
            match resp.as_slice() {
                [acks::YES] => Ok(()),
                [acks::CALIBRATION_FAILED] => Err(Error::ProgrammingFailure {
                    region: Region::Rom,
                    address: s.chip.rom_size.saturating_sub(1),
                }),
                [acks::FUSE_FAILED] => Err(Error::ProgrammingFailure {
                    region: Region::Config,
                    address: 0,
                }),
                _ => Err(Error::protocol(op, acks::YES as char, &resp)),
            }
        })
    }

    pub fn rom_is_blank(&mut self) -> Result<bool> {
        self.require("ROM blank check", SessionState::InProgrammingMode)?;
        let high_byte = (self.chip.rom_blank_word() >> 8) as u8;
        let max_progress = (self.chip.rom_size as usize / 256).saturating_sub(1);
        self.simple_command(Command::RomIsBlank { high_byte }, |s, op| {
            let mut progress = 0;
            loop {
                let resp = s.transport.read(1, s.options.timing.read)?;
                match resp.as_slice() {
                    [acks::YES] => return Ok(true),
                    [acks::NO] | [acks::CALIBRATION_FAILED] => return Ok(false),
                    [acks::BLANK_PROGRESS] if progress < max_progress => progress += 1,
                    _ => return Err(Error::protocol(op, "'Y' or 'N'", &resp)),
                }
            }
        })
    }

    pub fn eeprom_is_blank(&mut self) -> Result<bool> {
        self.require("EEPROM blank check", SessionState::InProgrammingMode)?;
        self.simple_command(Command::EepromIsBlank, |s, op| {
            let resp = s.transport.read(1, s.options.timing.ack)?;
            match resp.as_slice() {
                [acks::YES] => Ok(true),
                [acks::NO] => Ok(false),
                _ => Err(Error::protocol(op, "'Y' or 'N'", &resp)),
            }
        })
    }

    /// Have the programmer echo `msg` back, one byte at a time.
    pub fn echo(&mut self, msg: &[u8]) -> Result<Vec<u8>> {
        self.require_open("echo")?;
        let operation = "echo";
        self.command_start(operation)?;
        let mut result = Vec::with_capacity(msg.len());
        for &b in msg {
            self.send(Command::Echo(b))?;
            result.extend(self.transport.read(1, self.options.timing.ack)?);
        }
        self.command_end(operation)?;
        Ok(result)
    }

    pub fn programmer_version(&mut self) -> Result<u8> {
        self.require_open("programmer version")?;
        self.simple_command(Command::ProgrammerVersion, |s, op| {
            Ok(s.transport.read_exact(op, 1, s.options.timing.ack)?[0])
        })
    }

    pub fn programmer_protocol(&mut self) -> Result<String> {
        self.require_open("programmer protocol")?;
        let raw = self.query_protocol()?;
        Ok(String::from_utf8_lossy(&raw).into_owned())
    }

    fn query_protocol(&mut self) -> Result<Vec<u8>> {
        self.simple_command(Command::ProgrammerProtocol, |s, op| {
            s.transport.read_exact(op, 4, s.options.timing.ack)
        })
    }

    /// Leave programming mode if needed and release the programmer.
    ///
    /// Failures are logged, never returned: the session is closed either way.
    pub fn close(&mut self) {
        if self.state == SessionState::InProgrammingMode {
            if let Err(e) = self.exit_programming_mode() {
                log::warn!("Failed to leave programming mode: {}", e);
            }
        }
        if self.state != SessionState::Closed {
            log::debug!("Session closed");
        }
        self.state = SessionState::Closed;
    }
}

impl<T: Transport> Drop for Session<T> {
    fn drop(&mut self) {
        self.close();
    }
}

fn check_range(range: &Range<usize>, size: usize, region: Region) -> Result<()> {
    if range.start > range.end || range.end > size {
        return Err(Error::InvalidImage(format!(
            "{} range {:?} exceeds {} entries",
            region, range, size
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::ChipDB;
    use crate::transport::DummyTransport;

    fn options() -> Options {
        Options {
            timing: Timing::instant(),
            ..Default::default()
        }
    }

    fn open(name: &str) -> (Session<DummyTransport>, DummyTransport) {
        let chip = ChipDB::find_chip(name).unwrap();
        let dummy = DummyTransport::new(chip);
        let session = Session::open(dummy.clone(), chip, options()).unwrap();
        (session, dummy)
    }

    #[test]
    fn open_checks_greeting_and_protocol() {
        let (session, _) = open("16f628a");
        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(session.firmware_version(), Some(3));
    }

    #[test]
    fn open_fails_without_greeting() {
        let chip = ChipDB::find_chip("16f628a").unwrap();
        let dummy = DummyTransport::new(chip);
        dummy.silence();
        assert!(matches!(
            Session::open(dummy, chip, options()),
            Err(Error::Connection(_))
        ));
    }

    #[test]
    fn open_rejects_other_protocol() {
        let chip = ChipDB::find_chip("16f628a").unwrap();
        let dummy = DummyTransport::with_protocol(chip, opcodes::P018);
        assert!(matches!(
            Session::open(dummy, chip, options()),
            Err(Error::Connection(_))
        ));
    }

    #[test]
    fn memory_commands_need_programming_mode() {
        let (mut session, _) = open("16f628a");
        assert!(matches!(
            session.erase(),
            Err(Error::InvalidState {
                state: "connected",
                ..
            })
        ));
        assert!(matches!(
            session.read_rom(0..1),
            Err(Error::InvalidState { .. })
        ));
    }

    #[test]
    fn auxiliary_commands() {
        let (mut session, _) = open("16f628a");
        assert_eq!(session.echo(b"Hello programmer!").unwrap(), b"Hello programmer!");
        assert_eq!(session.programmer_version().unwrap(), 3);
        assert_eq!(session.programmer_protocol().unwrap(), "P18A");
        session.enter_programming_mode().unwrap();
        assert!(session.rom_is_blank().unwrap());
        assert!(session.eeprom_is_blank().unwrap());
    }

    #[test]
    fn write_then_read_rom() {
        let (mut session, dummy) = open("16f628a");
        session.enter_programming_mode().unwrap();
        session.erase().unwrap();
        let words: Vec<u16> = (0..20).map(|i| 0x2800 | i).collect();
        let mut blocks = Vec::new();
        session
            .write_rom_with(&words, |done, total| {
                blocks.push((done, total));
                Ok(())
            })
            .unwrap();
        // padded to two 16-word blocks
        assert_eq!(blocks, vec![(16, 32), (32, 32)]);
        assert_eq!(session.read_rom(0..20).unwrap(), words);
        assert_eq!(session.read_rom(20..32).unwrap(), vec![0x3fff; 12]);
        assert_eq!(dummy.chip().rom[19], 0x2813);
        assert!(!session.rom_is_blank().unwrap());
        assert!(!dummy.voltages_on());
    }

    #[test]
    fn rejected_word_reports_its_address() {
        let (mut session, dummy) = open("16f628a");
        dummy.reject_rom_at(0x21);
        session.enter_programming_mode().unwrap();
        let err = session.write_rom(&[0x3fff; 64]).unwrap_err();
        assert!(matches!(
            err,
            Error::ProgrammingFailure {
                region: Region::Rom,
                address: 0x21
            }
        ));
        // the programmer was reset to leave the command
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[test]
    fn eeprom_and_config() {
        let (mut session, dummy) = open("16f628a");
        session.enter_programming_mode().unwrap();
        session.write_eeprom(&[1, 2, 3]).unwrap();
        assert_eq!(session.read_eeprom(0..4).unwrap(), vec![1, 2, 3, 0xff]);

        let commit = session.write_config(&[1, 2, 3, 4], &[0x3f10]).unwrap();
        assert!(commit.is_none());
        let config = session.read_config().unwrap();
        assert_eq!(config.fuses[0], 0x3f10);
        assert_eq!(&config.id[..4], &[1, 2, 3, 4]);
        assert_eq!(session.read_chip_id().unwrap(), dummy.chip().chip_id);
    }

    #[test]
    fn wide_core_fuses_need_commit() {
        for protocol in [ProtocolRevision::P18A, ProtocolRevision::P018] {
            let chip = ChipDB::find_chip("18f452").unwrap();
            let dummy = DummyTransport::with_protocol(chip, protocol.opcodes());
            let mut session = Session::open(
                dummy.clone(),
                chip,
                Options {
                    protocol,
                    ..options()
                },
            )
            .unwrap();
            session.enter_programming_mode().unwrap();
            let fuses = [0x22ff, 0x0f0f, 0x01ff, 0x0081, 0xc00f, 0xe00f, 0x400f];
            let commit = session.write_config(&[0; 8], &fuses).unwrap().unwrap();
            assert_eq!(dummy.chip().fuses[0], 0x27ff);
            session.commit_18f_fuses(commit).unwrap();
            assert_eq!(dummy.chip().fuses, fuses);
        }
    }

    #[test]
    fn socket_parts_wait_for_insertion() {
        let (mut session, dummy) = open("12f675");
        session.enter_programming_mode().unwrap();
        assert_eq!(dummy.socket_waits(), 1);
        assert_eq!(dummy.programming_vars().unwrap().power_sequence, 4);
    }

    #[test]
    fn icsp_only_parts_use_the_icsp_entry() {
        let (mut session, dummy) = open("10f200");
        assert!(session.chip().icsp_only);
        session.enter_programming_mode().unwrap();
        assert_eq!(dummy.socket_waits(), 0);
        // Vpp2Vcc is rewired to the single ICSP Vpp line
        assert_eq!(dummy.programming_vars().unwrap().power_sequence, 3);
        assert_eq!(session.state(), SessionState::InProgrammingMode);
    }

    #[test]
    fn voltage_cycle_leaves_voltages_off() {
        let (mut session, dummy) = open("16f628a");
        assert!(matches!(
            session.cycle_voltages(),
            Err(Error::InvalidState { .. })
        ));
        session.enter_programming_mode().unwrap();
        session.cycle_voltages().unwrap();
        assert_eq!(dummy.voltage_cycles(), 1);
        assert!(!dummy.voltages_on());
    }

    #[test]
    fn close_turns_voltages_off() {
        let (mut session, dummy) = open("12f675");
        session.enter_programming_mode().unwrap();
        drop(session);
        assert!(!dummy.voltages_on());
    }
}
