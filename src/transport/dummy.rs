//! In-memory K150 emulator, for tests and dry runs.
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use scroll::{BE, LE, Pread};

use super::Transport;
use crate::constants::{
    CONFIG_RESPONSE_SIZE, EEPROM_UNIT_SIZE, GREETING, ID_FUSE_BLOCK_SIZE, Opcodes, ROM_BLOCK_SIZE,
    acks, framing, opcodes,
};
use crate::device::Chip;
use crate::error::Result;
use crate::protocol::{ChipConfig, ProgrammingVars};

/// Firmware version reported in the greeting
const FIRMWARE_VERSION: u8 = 3;

/// Non-volatile state of the emulated chip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DummyChip {
    pub rom: Vec<u16>,
    pub eeprom: Vec<u8>,
    pub id: [u8; 8],
    pub fuses: [u16; 7],
    /// 16-bit cores latch fuses until they are committed
    pub pending_fuses: Option<[u16; 7]>,
    pub calibrate: u16,
    pub chip_id: u16,
}

impl DummyChip {
    /// A factory-fresh `chip`; calibrated parts carry a value in their last ROM word.
    pub fn blank(chip: &Chip) -> Self {
        let mut rom = vec![chip.rom_blank_word(); chip.rom_size as usize];
        let calibrate = if chip.cal_word { 0x3480 } else { chip.rom_blank_word() };
        if chip.cal_word {
            if let Some(last) = rom.last_mut() {
                *last = calibrate;
            }
        }
        let mut fuses = [0xffff; 7];
        for (f, b) in fuses.iter_mut().zip(&chip.fuse_blank) {
            *f = *b;
        }
        DummyChip {
            rom,
            eeprom: vec![0xff; chip.eeprom_size as usize],
            id: [0; 8],
            fuses,
            pending_fuses: None,
            calibrate,
            chip_id: chip.chip_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    Echo,
    ProgrammingVars,
    RomCount,
    EepromCount,
    IdFuses,
    Calibration,
    RomBlank,
    Commit18F,
}

#[derive(Debug)]
enum Mode {
    /// Waiting for a command start
    Idle,
    JumpTable,
    Collect {
        need: usize,
        buf: Vec<u8>,
        then: Pending,
    },
    RomData {
        words: usize,
        address: usize,
        block: Vec<u8>,
    },
    EepromData {
        bytes: usize,
        address: usize,
        unit: Vec<u8>,
    },
    EepromFiller {
        left: usize,
    },
}

#[derive(Debug)]
struct Emulator {
    opcodes: Opcodes,
    chip: DummyChip,
    rom_blank: u16,
    fuse_blank: Vec<u16>,
    dtr: bool,
    output: VecDeque<u8>,
    mode: Mode,
    vars: Option<ProgrammingVars>,
    voltages_on: bool,
    silent: bool,
    reject_rom_at: Option<usize>,
    stuck_rom: Option<(usize, u16)>,
    erase_count: usize,
    rom_writes: usize,
    socket_waits: usize,
    voltage_cycles: usize,
}

impl Emulator {
    fn reply(&mut self, raw: &[u8]) {
        if !self.silent {
            self.output.extend(raw);
        }
    }

    fn ready(&self) -> bool {
        self.vars.is_some() && self.voltages_on
    }

    fn wide_core(&self) -> bool {
        matches!(self.vars.map(|v| v.core_type), Some(1 | 2 | 13))
    }

    fn boot(&mut self) {
        self.output.clear();
        self.mode = Mode::Idle;
        self.vars = None;
        self.voltages_on = false;
        self.reply(&[GREETING, FIRMWARE_VERSION]);
    }

    fn feed(&mut self, byte: u8) {
        self.mode = match std::mem::replace(&mut self.mode, Mode::Idle) {
            Mode::Idle => match byte {
                framing::RESYNC => {
                    self.reply(&[acks::COMMAND_END]);
                    Mode::Idle
                }
                framing::JUMP_TABLE => {
                    self.reply(&[acks::COMMAND_START]);
                    Mode::JumpTable
                }
                _ => {
                    self.reply(b"O");
                    Mode::Idle
                }
            },
            Mode::JumpTable => self.command(byte),
            Mode::Collect { need, mut buf, then } => {
                buf.push(byte);
                if buf.len() == need {
                    self.complete(then, &buf)
                } else {
                    Mode::Collect { need, buf, then }
                }
            }
            Mode::RomData {
                words,
                address,
                mut block,
            } => {
                block.push(byte);
                if block.len() < ROM_BLOCK_SIZE {
                    Mode::RomData {
                        words,
                        address,
                        block,
                    }
                } else {
                    self.program_rom_block(words, address, &block)
                }
            }
            Mode::EepromData {
                bytes,
                address,
                mut unit,
            } => {
                unit.push(byte);
                if unit.len() < EEPROM_UNIT_SIZE {
                    Mode::EepromData {
                        bytes,
                        address,
                        unit,
                    }
                } else {
                    self.program_eeprom_unit(bytes, address, &unit)
                }
            }
            Mode::EepromFiller { left } => {
                if left > 1 {
                    Mode::EepromFiller { left: left - 1 }
                } else {
                    self.reply(&[acks::BLOCK_DONE]);
                    Mode::JumpTable
                }
            }
        };
    }

    fn collect(need: usize, then: Pending) -> Mode {
        Mode::Collect {
            need,
            buf: Vec::with_capacity(need),
            then,
        }
    }

    fn command(&mut self, op: u8) -> Mode {
        let ops = self.opcodes;
        if op == framing::RESYNC {
            self.reply(&[acks::COMMAND_END]);
            Mode::Idle
        } else if op == ops.echo {
            Self::collect(1, Pending::Echo)
        } else if op == ops.init_programming_vars {
            Self::collect(ProgrammingVars::SIZE, Pending::ProgrammingVars)
        } else if op == ops.voltages_on {
            self.voltages_on = true;
            self.reply(&[acks::VOLTAGES_ON]);
            Mode::JumpTable
        } else if op == ops.voltages_off {
            self.voltages_on = false;
            self.reply(&[acks::VOLTAGES_OFF]);
            Mode::JumpTable
        } else if op == ops.cycle_voltages {
            self.voltages_on = true;
            self.voltage_cycles += 1;
            self.reply(&[acks::VOLTAGES_ON]);
            Mode::JumpTable
        } else if op == ops.wait_chip_in_socket {
            self.socket_waits += 1;
            self.reply(&[acks::SOCKET_ARMED, acks::YES]);
            Mode::JumpTable
        } else if op == ops.programmer_version {
            self.reply(&[FIRMWARE_VERSION]);
            Mode::JumpTable
        } else if op == ops.programmer_protocol {
            self.reply(ops.protocol);
            Mode::JumpTable
        } else if op == ops.eeprom_is_blank {
            let blank = self.chip.eeprom.iter().all(|&b| b == 0xff);
            self.reply(&[if blank { acks::YES } else { acks::NO }]);
            Mode::JumpTable
        } else if op == ops.rom_is_blank {
            Self::collect(1, Pending::RomBlank)
        } else if op == ops.commit_18f_fuses {
            if ops.commit_carries_fuses {
                Self::collect(ID_FUSE_BLOCK_SIZE, Pending::Commit18F)
            } else {
                self.complete(Pending::Commit18F, &[])
            }
        } else if !self.ready()
            && [
                ops.program_rom,
                ops.program_eeprom,
                ops.program_id_fuses,
                ops.program_calibration,
                ops.read_rom,
                ops.read_eeprom,
                ops.read_config,
                ops.erase_chip,
            ]
            .contains(&op)
        {
            self.reply(&[acks::NO]);
            Mode::JumpTable
        } else if op == ops.program_rom {
            Self::collect(2, Pending::RomCount)
        } else if op == ops.program_eeprom {
            Self::collect(2, Pending::EepromCount)
        } else if op == ops.program_id_fuses {
            Self::collect(ID_FUSE_BLOCK_SIZE, Pending::IdFuses)
        } else if op == ops.program_calibration {
            Self::collect(4, Pending::Calibration)
        } else if op == ops.read_rom {
            let words = self.vars.map_or(0, |v| v.rom_size as usize);
            let raw: Vec<u8> = self.chip.rom[..words.min(self.chip.rom.len())]
                .iter()
                .flat_map(|w| w.to_be_bytes())
                .collect();
            self.reply(&raw);
            Mode::JumpTable
        } else if op == ops.read_eeprom {
            let bytes = self.vars.map_or(0, |v| v.eeprom_size as usize);
            let raw = self.chip.eeprom[..bytes.min(self.chip.eeprom.len())].to_vec();
            self.reply(&raw);
            Mode::JumpTable
        } else if op == ops.read_config {
            let calibrate = match (self.vars, self.chip.rom.last()) {
                (Some(v), Some(&last)) if v.calibration_in_rom => last,
                _ => self.chip.calibrate,
            };
            let config = ChipConfig {
                chip_id: self.chip.chip_id,
                id: self.chip.id,
                fuses: self.chip.fuses,
                calibrate,
            };
            self.reply(&[acks::READ_CONFIG]);
            match config.to_bytes() {
                Ok(raw) => self.reply(&raw),
                Err(_) => self.reply(&[0; CONFIG_RESPONSE_SIZE]),
            }
            Mode::JumpTable
        } else if op == ops.erase_chip {
            self.erase();
            self.reply(&[acks::YES]);
            Mode::JumpTable
        } else {
            self.reply(&[acks::FUSE_FAILED]);
            Mode::JumpTable
        }
    }

    fn complete(&mut self, pending: Pending, buf: &[u8]) -> Mode {
        match pending {
            Pending::Echo => {
                self.reply(buf);
            }
            Pending::ProgrammingVars => match ProgrammingVars::from_bytes(buf) {
                Ok(vars) if valid_vars(&vars) => {
                    self.vars = Some(vars);
                    self.reply(&[acks::PROGRAMMING_VARS]);
                }
                _ => {
                    self.vars = None;
                    self.reply(&[acks::NO]);
                }
            },
            Pending::RomCount => {
                let words = buf.pread_with::<u16>(0, BE).unwrap_or(0) as usize;
                let capacity = self.vars.map_or(0, |v| v.rom_size as usize);
                if words == 0 || words > capacity || (words * 2) % ROM_BLOCK_SIZE != 0 {
                    self.reply(&[acks::NO]);
                    return Mode::JumpTable;
                }
                self.rom_writes += 1;
                self.reply(&[acks::YES]);
                return Mode::RomData {
                    words,
                    address: 0,
                    block: Vec::with_capacity(ROM_BLOCK_SIZE),
                };
            }
            Pending::EepromCount => {
                let bytes = buf.pread_with::<u16>(0, BE).unwrap_or(0) as usize;
                let capacity = self.vars.map_or(0, |v| v.eeprom_size as usize);
                if bytes == 0 || bytes > capacity || bytes % 2 != 0 {
                    self.reply(&[acks::NO]);
                    return Mode::JumpTable;
                }
                self.reply(&[acks::YES]);
                return Mode::EepromData {
                    bytes,
                    address: 0,
                    unit: Vec::with_capacity(EEPROM_UNIT_SIZE),
                };
            }
            Pending::IdFuses => {
                let mut fuses = [0xffff; 7];
                for (i, f) in fuses.iter_mut().enumerate() {
                    *f = buf.pread_with(10 + 2 * i, LE).unwrap_or(0xffff);
                }
                if self.wide_core() {
                    self.chip.id.copy_from_slice(&buf[2..10]);
                    self.chip.pending_fuses = Some(fuses);
                } else {
                    self.chip.id[..4].copy_from_slice(&buf[2..6]);
                    let n = self.fuse_blank.len().min(7);
                    self.chip.fuses[..n].copy_from_slice(&fuses[..n]);
                }
                self.reply(&[acks::YES]);
            }
            Pending::Calibration => {
                let calibrate = buf.pread_with::<u16>(0, BE).unwrap_or(0xffff);
                let fuse = buf.pread_with::<u16>(2, BE).unwrap_or(0xffff);
                if self.vars.is_some_and(|v| v.calibration_in_rom) {
                    if let Some(last) = self.chip.rom.last_mut() {
                        *last = calibrate;
                    }
                }
                self.chip.calibrate = calibrate;
                self.chip.fuses[0] = fuse;
                self.reply(&[acks::YES]);
            }
            Pending::RomBlank => {
                let blank = self.chip.rom.iter().all(|&w| w == self.rom_blank);
                self.reply(&[if blank { acks::YES } else { acks::NO }]);
            }
            Pending::Commit18F => {
                let fuses = if buf.len() == ID_FUSE_BLOCK_SIZE {
                    let mut fuses = [0xffff; 7];
                    for (i, f) in fuses.iter_mut().enumerate() {
                        *f = buf.pread_with(10 + 2 * i, LE).unwrap_or(0xffff);
                    }
                    Some(fuses)
                } else {
                    self.chip.pending_fuses
                };
                self.chip.pending_fuses = None;
                match fuses {
                    Some(fuses) => {
                        self.chip.fuses = fuses;
                        self.reply(&[acks::YES]);
                    }
                    None => self.reply(&[acks::NO]),
                }
            }
        }
        Mode::JumpTable
    }

    fn program_rom_block(&mut self, words: usize, address: usize, block: &[u8]) -> Mode {
        let protect_last = self.vars.is_some_and(|v| v.calibration_in_rom);
        let last = self.chip.rom.len().saturating_sub(1);
        for (i, pair) in block.chunks_exact(2).enumerate() {
            let addr = address + i;
            if self.reject_rom_at == Some(addr) {
                self.reply(&[acks::NO]);
                self.reply(&(addr as u16).to_be_bytes());
                return Mode::JumpTable;
            }
            if protect_last && addr == last {
                continue;
            }
            let mut word = u16::from_be_bytes([pair[0], pair[1]]);
            if let Some((stuck, value)) = self.stuck_rom {
                if stuck == addr {
                    word = value;
                }
            }
            if let Some(cell) = self.chip.rom.get_mut(addr) {
                *cell = word;
            }
        }
        self.reply(&[acks::YES]);
        let address = address + ROM_BLOCK_SIZE / 2;
        if address >= words {
            self.reply(&[acks::BLOCK_DONE]);
            Mode::JumpTable
        } else {
            Mode::RomData {
                words,
                address,
                block: Vec::with_capacity(ROM_BLOCK_SIZE),
            }
        }
    }

    fn program_eeprom_unit(&mut self, bytes: usize, address: usize, unit: &[u8]) -> Mode {
        for (i, b) in unit.iter().enumerate() {
            if let Some(cell) = self.chip.eeprom.get_mut(address + i) {
                *cell = *b;
            }
        }
        self.reply(&[acks::YES]);
        let address = address + EEPROM_UNIT_SIZE;
        if address >= bytes {
            Mode::EepromFiller { left: 2 }
        } else {
            Mode::EepromData {
                bytes,
                address,
                unit: Vec::with_capacity(EEPROM_UNIT_SIZE),
            }
        }
    }

    fn erase(&mut self) {
        self.erase_count += 1;
        let keep = match (self.vars, self.chip.rom.last()) {
            (Some(v), Some(&last)) if v.calibration_in_rom => Some(last),
            _ => None,
        };
        self.chip.rom.fill(self.rom_blank);
        if let (Some(cal), Some(last)) = (keep, self.chip.rom.last_mut()) {
            *last = cal;
        }
        self.chip.eeprom.fill(0xff);
        self.chip.id = [0; 8];
        for (f, b) in self.chip.fuses.iter_mut().zip(&self.fuse_blank) {
            *f = *b;
        }
        self.chip.pending_fuses = None;
    }
}

fn valid_vars(vars: &ProgrammingVars) -> bool {
    vars.rom_size != 0
        && vars.rom_size % 32 == 0
        && vars.eeprom_size % 32 == 0
        && (1..=13).contains(&vars.core_type)
        && vars.power_sequence <= 4
        && vars.program_tries != 0
}

/// Emulated programmer with `chip` in its socket.
///
/// Clones share the same emulator, so a test can keep a handle to inspect
/// the chip after a workflow has consumed the transport.
#[derive(Debug, Clone)]
pub struct DummyTransport {
    inner: Arc<Mutex<Emulator>>,
}

impl DummyTransport {
    pub fn new(chip: &Chip) -> Self {
        Self::with_protocol(chip, opcodes::P18A)
    }

    pub fn with_protocol(chip: &Chip, opcodes: Opcodes) -> Self {
        let emulator = Emulator {
            opcodes,
            chip: DummyChip::blank(chip),
            rom_blank: chip.rom_blank_word(),
            fuse_blank: chip.fuse_blank.clone(),
            dtr: false,
            output: VecDeque::new(),
            mode: Mode::Idle,
            vars: None,
            voltages_on: false,
            silent: false,
            reject_rom_at: None,
            stuck_rom: None,
            erase_count: 0,
            rom_writes: 0,
            socket_waits: 0,
            voltage_cycles: 0,
        };
        DummyTransport {
            inner: Arc::new(Mutex::new(emulator)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Emulator> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Snapshot of the emulated chip
    pub fn chip(&self) -> DummyChip {
        self.lock().chip.clone()
    }

    pub fn set_chip(&self, chip: DummyChip) {
        self.lock().chip = chip;
    }

    pub fn voltages_on(&self) -> bool {
        self.lock().voltages_on
    }

    pub fn erase_count(&self) -> usize {
        self.lock().erase_count
    }

    /// Number of ROM programming commands accepted
    pub fn rom_writes(&self) -> usize {
        self.lock().rom_writes
    }

    /// Number of times the programmer waited for a chip in the socket
    pub fn socket_waits(&self) -> usize {
        self.lock().socket_waits
    }

    pub fn voltage_cycles(&self) -> usize {
        self.lock().voltage_cycles
    }

    /// Programming variables last accepted
    pub fn programming_vars(&self) -> Option<ProgrammingVars> {
        self.lock().vars
    }

    /// Stop answering, as an unpowered or disconnected programmer would.
    pub fn silence(&self) {
        let mut emu = self.lock();
        emu.silent = true;
        emu.output.clear();
    }

    /// Answer `N` when the ROM word at `address` is programmed.
    pub fn reject_rom_at(&self, address: usize) {
        self.lock().reject_rom_at = Some(address);
    }

    /// Store `value` whenever the ROM word at `address` is programmed.
    pub fn stick_rom_word(&self, address: usize, value: u16) {
        self.lock().stuck_rom = Some((address, value));
    }
}

impl Transport for DummyTransport {
    fn send_raw(&mut self, raw: &[u8]) -> Result<()> {
        let mut emu = self.lock();
        if emu.dtr {
            // held in reset
            return Ok(());
        }
        for &b in raw {
            emu.feed(b);
        }
        Ok(())
    }

    fn recv_raw(&mut self, len: usize, _timeout: Duration) -> Result<Vec<u8>> {
        let mut emu = self.lock();
        let n = len.min(emu.output.len());
        Ok(emu.output.drain(..n).collect())
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        let mut emu = self.lock();
        // the emulated unit runs while DTR is low
        if emu.dtr && !level {
            emu.boot();
        } else if level {
            emu.output.clear();
            emu.mode = Mode::Idle;
        }
        emu.dtr = level;
        Ok(())
    }

    fn clear_input(&mut self) -> Result<()> {
        self.lock().output.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::ChipDB;

    fn booted(name: &str) -> DummyTransport {
        let chip = ChipDB::find_chip(name).unwrap();
        let mut dummy = DummyTransport::new(chip);
        dummy.set_dtr(true).unwrap();
        dummy.set_dtr(false).unwrap();
        dummy
    }

    fn exchange(dummy: &mut DummyTransport, raw: &[u8]) -> Vec<u8> {
        dummy.send_raw(raw).unwrap();
        dummy.recv_raw(64, Duration::ZERO).unwrap()
    }

    #[test]
    fn greets_after_reset() {
        let mut dummy = booted("16f628a");
        assert_eq!(dummy.recv_raw(2, Duration::ZERO).unwrap(), b"B\x03");
    }

    #[test]
    fn framing() {
        let mut dummy = booted("16f628a");
        dummy.clear_input().unwrap();
        assert_eq!(exchange(&mut dummy, b"X"), b"O");
        assert_eq!(exchange(&mut dummy, &[0x01, b'P']), b"QP");
        // unknown command
        assert_eq!(exchange(&mut dummy, &[0x63]), b"F");
        assert_eq!(exchange(&mut dummy, &[21]), b"P18A");
        assert_eq!(exchange(&mut dummy, &[2, b'z']), b"z");
        assert_eq!(exchange(&mut dummy, &[0x01]), b"Q");
    }

    #[test]
    fn memory_commands_need_programming_vars() {
        let mut dummy = booted("16f628a");
        dummy.clear_input().unwrap();
        assert_eq!(exchange(&mut dummy, &[0x01, b'P', 4, 7]), b"QPVN");
        assert_eq!(dummy.rom_writes(), 0);
    }

    #[test]
    fn silent_unit_sends_nothing() {
        let chip = ChipDB::find_chip("16f628a").unwrap();
        let mut dummy = DummyTransport::new(chip);
        dummy.silence();
        dummy.set_dtr(true).unwrap();
        dummy.set_dtr(false).unwrap();
        assert!(exchange(&mut dummy, &[0x01]).is_empty());
    }
}
