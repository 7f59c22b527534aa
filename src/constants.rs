//! Wire constants of the K128/K149/K150 programmer firmware.

use std::time::Duration;

pub const BAUD_RATE: u32 = 19200;

/// Poll interval of the underlying serial port. Longer waits are built
/// from repeated polls, since changing the port timeout toggles DTR on
/// some drivers and that resets every programmer except the K149.
pub const SERIAL_POLL_MS: u64 = 100;

/// ROM is streamed to the programmer in blocks of this many bytes.
pub const ROM_BLOCK_SIZE: usize = 32;
/// EEPROM is streamed to the programmer in units of this many bytes.
pub const EEPROM_UNIT_SIZE: usize = 2;
/// Size of the answer to `READ_CONFIG`, after the `C` acknowledgement.
pub const CONFIG_RESPONSE_SIZE: usize = 26;
/// Size of the ID/fuse block sent with `PROGRAM_ID_FUSES`.
pub const ID_FUSE_BLOCK_SIZE: usize = 24;

/// Sent by the programmer after a reset, followed by the firmware version.
pub const GREETING: u8 = b'B';

pub mod acks {
    pub const COMMAND_START: u8 = b'P';
    pub const COMMAND_END: u8 = b'Q';
    pub const VOLTAGES_ON: u8 = b'V';
    pub const VOLTAGES_OFF: u8 = b'v';
    pub const PROGRAMMING_VARS: u8 = b'I';
    pub const READ_CONFIG: u8 = b'C';
    pub const SOCKET_ARMED: u8 = b'A';
    pub const YES: u8 = b'Y';
    pub const NO: u8 = b'N';
    pub const BLOCK_DONE: u8 = b'P';
    pub const CALIBRATION_FAILED: u8 = b'C';
    pub const FUSE_FAILED: u8 = b'F';
    pub const BLANK_PROGRESS: u8 = b'B';
}

/// Framing bytes understood outside of the command jump table.
pub mod framing {
    pub const RESYNC: u8 = 0x01;
    pub const JUMP_TABLE: u8 = b'P';
}

/// Opcode table of one firmware protocol revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Opcodes {
    pub protocol: &'static [u8; 4],
    pub echo: u8,
    pub init_programming_vars: u8,
    pub voltages_on: u8,
    pub voltages_off: u8,
    pub cycle_voltages: u8,
    pub program_rom: u8,
    pub program_eeprom: u8,
    pub program_id_fuses: u8,
    pub program_calibration: u8,
    pub read_rom: u8,
    pub read_eeprom: u8,
    pub read_config: u8,
    pub erase_chip: u8,
    pub rom_is_blank: u8,
    pub eeprom_is_blank: u8,
    pub commit_18f_fuses: u8,
    /// `P018` resends the fuse words with the commit, `P18A` does not.
    pub commit_carries_fuses: bool,
    pub wait_chip_in_socket: u8,
    pub programmer_version: u8,
    pub programmer_protocol: u8,
}

pub mod opcodes {
    use super::Opcodes;

    pub const P18A: Opcodes = Opcodes {
        protocol: b"P18A",
        echo: 2,
        init_programming_vars: 3,
        voltages_on: 4,
        voltages_off: 5,
        cycle_voltages: 6,
        program_rom: 7,
        program_eeprom: 8,
        program_id_fuses: 9,
        program_calibration: 10,
        read_rom: 11,
        read_eeprom: 12,
        read_config: 13,
        erase_chip: 14,
        rom_is_blank: 15,
        eeprom_is_blank: 16,
        commit_18f_fuses: 17,
        commit_carries_fuses: false,
        wait_chip_in_socket: 18,
        programmer_version: 20,
        programmer_protocol: 21,
    };

    pub const P018: Opcodes = Opcodes {
        protocol: b"P018",
        erase_chip: 15,
        rom_is_blank: 16,
        eeprom_is_blank: 17,
        commit_18f_fuses: 18,
        commit_carries_fuses: true,
        wait_chip_in_socket: 19,
        programmer_version: 21,
        programmer_protocol: 22,
        ..P18A
    };

    pub const P016: Opcodes = Opcodes {
        protocol: b"P016",
        ..P018
    };
}

/// Timeouts and settle delays used by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    /// Wait for the greeting after toggling DTR.
    pub reset: Duration,
    /// Wait for a framing or short acknowledgement.
    pub ack: Duration,
    /// Wait for the acknowledgement of a programmed block.
    pub program: Duration,
    /// Wait for a full ROM read-back.
    pub read: Duration,
    /// Settle time after an erase command, before polling for `Y`.
    pub erase_settle: Duration,
    /// Settle time after every programmed block, before polling for `Y`.
    pub write_settle: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Timing {
            reset: Duration::from_millis(300),
            ack: Duration::from_secs(5),
            program: Duration::from_secs(20),
            read: Duration::from_secs(180),
            erase_settle: Duration::from_millis(50),
            write_settle: Duration::from_millis(2),
        }
    }
}

impl Timing {
    /// No settle delays, short timeouts. Used with the dummy programmer.
    pub fn instant() -> Self {
        Timing {
            reset: Duration::from_millis(10),
            ack: Duration::from_millis(50),
            program: Duration::from_millis(50),
            read: Duration::from_millis(50),
            erase_settle: Duration::ZERO,
            write_settle: Duration::ZERO,
        }
    }
}
