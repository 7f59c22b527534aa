//! Firmware file formats
use std::ops::Range;
use std::path::Path;
use std::str;

use ihex::{Reader, ReaderError, Record};

use crate::device::Chip;
use crate::error::{Error, HexFault, Region, Result};
use crate::image::MemoryImage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FirmwareFormat {
    IntelHex,
    /// Raw bytes of one region
    Binary,
}

pub fn guess_format(path: &Path, raw: &[u8]) -> FirmwareFormat {
    let ext = path
        .extension()
        .map(|s| s.to_string_lossy())
        .unwrap_or_default()
        .to_lowercase();
    if ["ihex", "ihe", "hex", "h86"].contains(&&*ext) {
        return FirmwareFormat::IntelHex;
    }
    if raw.first() == Some(&b':')
        && raw
            .iter()
            .all(|&c| (c as char).is_ascii_hexdigit() || c == b':' || c == b'\n' || c == b'\r')
    {
        FirmwareFormat::IntelHex
    } else {
        FirmwareFormat::Binary
    }
}

/// Read a HEX file, or a raw ROM image, for `chip`.
pub fn read_image_from_file<P: AsRef<Path>>(
    path: P,
    chip: &'static Chip,
    format: Option<FirmwareFormat>,
) -> Result<MemoryImage> {
    let p = path.as_ref();
    let raw = std::fs::read(p)?;

    let format = format.unwrap_or_else(|| guess_format(p, &raw));
    log::info!("Read {} as {:?} format", p.display(), format);
    match format {
        FirmwareFormat::IntelHex => {
            let text = str::from_utf8(&raw).map_err(|e| Error::MalformedHex {
                record: 0,
                reason: HexFault::Syntax(e.to_string()),
            })?;
            parse_hex(text, chip)
        }
        FirmwareFormat::Binary => parse_binary(&raw, chip, Region::Rom),
    }
}

/// Where a byte of the HEX address space lands in the chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cell {
    /// Byte `1` is the high byte
    Rom(usize, usize),
    Id(usize),
    Fuse(usize, usize),
    Eeprom(usize),
    /// Inside a window, but not stored (high byte of a byte-wide word)
    Ignored,
}

/// Byte address windows of the HEX file, per core width
struct Windows {
    rom: Range<u32>,
    id: Range<u32>,
    config: Range<u32>,
    eeprom: Range<u32>,
    /// Device ID and reserved words, accepted and dropped
    reserved: Range<u32>,
    /// ID and EEPROM bytes are stored one per 16-bit word
    word_wide: bool,
}

impl Windows {
    fn for_chip(chip: &Chip) -> Self {
        let rom_end = chip.rom_size * 2;
        let config_len = chip.config_words() as u32 * 2;
        match chip.core_bits() {
            16 => Windows {
                rom: 0..rom_end,
                id: 0x20_0000..0x20_0008,
                config: 0x30_0000..0x30_0000 + config_len,
                eeprom: 0xf0_0000..0xf0_0000 + chip.eeprom_size,
                reserved: 0..0,
                word_wide: false,
            },
            14 => Windows {
                rom: 0..rom_end,
                id: 0x4000..0x4008,
                config: 0x400e..0x400e + config_len,
                eeprom: 0x4200..0x4200 + chip.eeprom_size * 2,
                reserved: 0x4008..0x400e,
                word_wide: true,
            },
            _ => Windows {
                rom: 0..rom_end,
                id: rom_end..rom_end + 8,
                config: 0x1ffe..0x1ffe + config_len,
                eeprom: 0x4200..0x4200 + chip.eeprom_size * 2,
                reserved: 0..0,
                word_wide: true,
            },
        }
    }

    /// `swap` marks a big-endian file: the low byte of each word comes second.
    fn locate(&self, addr: u32, swap: bool) -> Option<Cell> {
        let low = |offset: u32| (offset % 2 == 1) == swap;
        let byte = |offset: u32| if swap { 1 - offset as usize % 2 } else { offset as usize % 2 };
        if self.rom.contains(&addr) {
            let offset = addr - self.rom.start;
            Some(Cell::Rom(offset as usize / 2, byte(offset)))
        } else if self.id.contains(&addr) {
            let offset = addr - self.id.start;
            match self.word_wide {
                false => Some(Cell::Id(offset as usize)),
                true if low(offset) => Some(Cell::Id(offset as usize / 2)),
                true => Some(Cell::Ignored),
            }
        } else if self.config.contains(&addr) {
            let offset = addr - self.config.start;
            Some(Cell::Fuse(offset as usize / 2, byte(offset)))
        } else if self.eeprom.contains(&addr) {
            let offset = addr - self.eeprom.start;
            match self.word_wide {
                false => Some(Cell::Eeprom(offset as usize)),
                true if low(offset) => Some(Cell::Eeprom(offset as usize / 2)),
                true => Some(Cell::Ignored),
            }
        } else if self.reserved.contains(&addr) {
            log::debug!("Dropping reserved byte at 0x{:04x}", addr);
            Some(Cell::Ignored)
        } else {
            None
        }
    }
}

fn hex_error(record: usize, e: ReaderError) -> Error {
    let reason = match e {
        ReaderError::ChecksumMismatch(found, expected) => HexFault::BadChecksum { expected, found },
        ReaderError::UnsupportedRecordType(t) => HexFault::UnknownType(t),
        e => HexFault::Syntax(e.to_string()),
    };
    Error::MalformedHex { record, reason }
}

/// Decode Intel HEX `text` into an image of `chip`. Unset locations stay blank.
pub fn parse_hex(text: &str, chip: &'static Chip) -> Result<MemoryImage> {
    let mut base_address = 0u32;
    // (record index, absolute address, data)
    let mut chunks: Vec<(usize, u32, Vec<u8>)> = vec![];

    for (i, record) in Reader::new(text).enumerate() {
        let index = i + 1;
        match record.map_err(|e| hex_error(index, e))? {
            Record::Data { offset, value } => {
                chunks.push((index, base_address + offset as u32, value));
            }
            Record::EndOfFile => break,
            Record::ExtendedSegmentAddress(address) => {
                base_address = (address as u32) * 16;
            }
            Record::ExtendedLinearAddress(address) => {
                base_address = (address as u32) << 16;
            }
            Record::StartSegmentAddress { .. } => {
                return Err(Error::MalformedHex {
                    record: index,
                    reason: HexFault::UnknownType(0x03),
                });
            }
            Record::StartLinearAddress(_) => {
                return Err(Error::MalformedHex {
                    record: index,
                    reason: HexFault::UnknownType(0x05),
                });
            }
        }
    }

    let windows = Windows::for_chip(chip);
    let swap = chip.core_bits() != 16 && detect_big_endian(chip, &windows, &chunks)?;
    if swap {
        log::info!("HEX file holds big-endian words, swapping bytes");
    }

    let mut image = MemoryImage::blank(chip);
    for (index, start, data) in &chunks {
        for (i, &b) in data.iter().enumerate() {
            let addr = start + i as u32;
            let cell = windows.locate(addr, swap).ok_or_else(|| Error::MalformedHex {
                record: *index,
                reason: HexFault::AddressOutOfRange(addr),
            })?;
            match cell {
                Cell::Rom(word, byte) => set_byte(&mut image.rom[word], byte, b),
                Cell::Fuse(word, byte) => set_byte(&mut image.config.fuses[word], byte, b),
                Cell::Id(i) => image.config.id[i] = b,
                Cell::Eeprom(i) => image.eeprom[i] = b,
                Cell::Ignored => {}
            }
        }
    }
    // bits above the core width are not stored
    let mask = chip.rom_blank_word();
    for word in image.rom.iter_mut() {
        *word &= mask;
    }
    MemoryImage::from_parts(chip, image.rom, image.eeprom, image.config)
}

fn set_byte(word: &mut u16, byte: usize, value: u8) {
    let mut bytes = word.to_le_bytes();
    bytes[byte] = value;
    *word = u16::from_le_bytes(bytes);
}

/// Find the first ROM word that only fits the core width in one byte order.
fn detect_big_endian(chip: &Chip, windows: &Windows, chunks: &[(usize, u32, Vec<u8>)]) -> Result<bool> {
    let blank = chip.rom_blank_word();
    for (index, start, data) in chunks {
        if !windows.rom.contains(start) || start % 2 != 0 {
            continue;
        }
        for pair in data.chunks_exact(2) {
            let le = u16::from_le_bytes([pair[0], pair[1]]);
            let be = u16::from_be_bytes([pair[0], pair[1]]);
            let le_ok = le & !blank == 0;
            let be_ok = be & !blank == 0;
            match (le_ok, be_ok) {
                (true, false) => return Ok(false),
                (false, true) => return Ok(true),
                (false, false) => {
                    return Err(Error::MalformedHex {
                        record: *index,
                        reason: HexFault::Syntax(format!(
                            "ROM word 0x{:04x} is wider than {} bits",
                            le,
                            chip.core_bits()
                        )),
                    });
                }
                (true, true) => {}
            }
        }
    }
    Ok(false)
}

/// Encode `image` as Intel HEX: full ROM and fuses, ID and EEPROM when not blank.
pub fn serialize_hex(image: &MemoryImage) -> Result<String> {
    serialize_hex_regions(image, &[Region::Rom, Region::Config, Region::Eeprom])
}

/// Intel HEX holding only `regions` of `image`, e.g. the regions a dump read back.
///
/// The user ID is written with the config region when it is not all zero,
/// EEPROM when it is not blank.
pub fn serialize_hex_regions(image: &MemoryImage, regions: &[Region]) -> Result<String> {
    let chip = image.chip();
    let windows = Windows::for_chip(chip);
    let mut segments: Vec<(u32, Vec<u8>)> = vec![];

    if regions.contains(&Region::Rom) {
        segments.push((
            windows.rom.start,
            image.rom.iter().flat_map(|w| w.to_le_bytes()).collect(),
        ));
    }
    if regions.contains(&Region::Config) {
        if image.config.id.iter().any(|&b| b != 0) {
            segments.push((windows.id.start, widen(&image.config.id, windows.word_wide)));
        }
        segments.push((
            windows.config.start,
            image.config.fuses.iter().flat_map(|w| w.to_le_bytes()).collect(),
        ));
    }
    if regions.contains(&Region::Eeprom) && image.eeprom.iter().any(|&b| b != 0xff) {
        segments.push((windows.eeprom.start, widen(&image.eeprom, windows.word_wide)));
    }

    let mut records = vec![];
    let mut upper = 0u16;
    for (start, data) in segments {
        let mut addr = start;
        let mut rest = data.as_slice();
        while !rest.is_empty() {
            if (addr >> 16) as u16 != upper {
                upper = (addr >> 16) as u16;
                records.push(Record::ExtendedLinearAddress(upper));
            }
            // stay inside one 64K segment
            let room = 0x1_0000 - (addr & 0xffff);
            let len = rest.len().min(16).min(room as usize);
            records.push(Record::Data {
                offset: (addr & 0xffff) as u16,
                value: rest[..len].to_vec(),
            });
            addr += len as u32;
            rest = &rest[len..];
        }
    }
    records.push(Record::EndOfFile);
    ihex::create_object_file_representation(&records).map_err(|e| Error::InvalidImage(e.to_string()))
}

/// One byte per 16-bit word, high byte zero
fn widen(bytes: &[u8], word_wide: bool) -> Vec<u8> {
    if word_wide {
        bytes.iter().flat_map(|&b| [b, 0]).collect()
    } else {
        bytes.to_vec()
    }
}

/// Raw bytes of one region; ROM and fuses as little-endian words, ID before fuses.
pub fn serialize_binary(image: &MemoryImage, region: Region) -> Vec<u8> {
    match region {
        Region::Rom => image.rom.iter().flat_map(|w| w.to_le_bytes()).collect(),
        Region::Eeprom => image.eeprom.clone(),
        Region::Config => {
            let mut raw = image.config.id.clone();
            raw.extend(image.config.fuses.iter().flat_map(|w| w.to_le_bytes()));
            raw
        }
    }
}

/// Blank image of `chip` with `region` loaded from raw bytes, as written by [`serialize_binary`].
pub fn parse_binary(raw: &[u8], chip: &'static Chip, region: Region) -> Result<MemoryImage> {
    let mut image = MemoryImage::blank(chip);
    match region {
        Region::Rom => {
            if raw.len() % 2 != 0 || raw.len() > image.rom.len() * 2 {
                return Err(Error::InvalidImage(format!(
                    "{} bytes is not a ROM image for {}",
                    raw.len(),
                    chip
                )));
            }
            for (word, pair) in image.rom.iter_mut().zip(raw.chunks_exact(2)) {
                *word = u16::from_le_bytes([pair[0], pair[1]]);
            }
        }
        Region::Eeprom => {
            if raw.len() > image.eeprom.len() {
                return Err(Error::InvalidImage(format!(
                    "{} bytes do not fit in the EEPROM of {}",
                    raw.len(),
                    chip
                )));
            }
            image.eeprom[..raw.len()].copy_from_slice(raw);
        }
        Region::Config => {
            let id_size = chip.id_size();
            if raw.len() != id_size + chip.config_words() * 2 {
                return Err(Error::InvalidImage(format!(
                    "{} bytes is not a configuration image for {}",
                    raw.len(),
                    chip
                )));
            }
            image.config.id = raw[..id_size].to_vec();
            for (word, pair) in image.config.fuses.iter_mut().zip(raw[id_size..].chunks_exact(2)) {
                *word = u16::from_le_bytes([pair[0], pair[1]]);
            }
        }
    }
    MemoryImage::from_parts(chip, image.rom, image.eeprom, image.config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::ChipDB;

    #[test]
    fn single_word_for_16bit_core() {
        let chip = ChipDB::find_chip("18f452").unwrap();
        let image = parse_hex(":02000000AAAAAA\n:00000001FF\n", chip).unwrap();
        assert_eq!(image.rom[0], 0xaaaa);
        assert_eq!(image.rom[1], 0xffff);
        assert_eq!(image.config.fuses, chip.fuse_blank);
    }

    #[test]
    fn bad_checksum_names_the_record() {
        let chip = ChipDB::find_chip("18f452").unwrap();
        let err = parse_hex(":02000000AAAAAA\n:0200020012340000\n:00000001FF\n", chip).unwrap_err();
        assert!(matches!(
            err,
            Error::MalformedHex {
                record: 2,
                reason: HexFault::BadChecksum { .. }
            }
        ));
    }

    #[test]
    fn start_address_records_are_rejected() {
        let chip = ChipDB::find_chip("18f452").unwrap();
        let err = parse_hex(":0400000500000000F7\n:00000001FF\n", chip).unwrap_err();
        assert!(matches!(
            err,
            Error::MalformedHex {
                record: 1,
                reason: HexFault::UnknownType(0x05)
            }
        ));
    }

    #[test]
    fn data_outside_every_window() {
        let chip = ChipDB::find_chip("16f628a").unwrap();
        // 0x3000 is past the 2K-word ROM
        let err = parse_hex(":020000040000FA\n:02300000FF3F90\n:00000001FF\n", chip).unwrap_err();
        assert!(matches!(
            err,
            Error::MalformedHex {
                record: 2,
                reason: HexFault::AddressOutOfRange(0x3000)
            }
        ));
    }

    #[test]
    fn midrange_windows() {
        let chip = ChipDB::find_chip("16f628a").unwrap();
        let text = concat!(
            ":0400000005288C0043\n",
            ":084000000100020003000400AE\n",
            ":02400E00103F61\n",
            ":04420000AA005500BB\n",
            ":00000001FF\n",
        );
        let image = parse_hex(text, chip).unwrap();
        assert_eq!(&image.rom[..2], &[0x2805, 0x008c]);
        assert_eq!(image.config.id, vec![1, 2, 3, 4]);
        assert_eq!(image.config.fuses, vec![0x3f10]);
        assert_eq!(&image.eeprom[..3], &[0xaa, 0x55, 0xff]);
    }

    #[test]
    fn big_endian_rom_is_swapped() {
        let chip = ChipDB::find_chip("16f628a").unwrap();
        // 0x2805 0x008c stored high byte first
        let image = parse_hex(":040000002805008C43\n:00000001FF\n", chip).unwrap();
        assert_eq!(&image.rom[..2], &[0x2805, 0x008c]);
    }

    #[test]
    fn baseline_id_follows_rom() {
        let chip = ChipDB::find_chip("12f508").unwrap();
        let text = concat!(
            ":080400000100020003000400EA\n",
            ":021FFE00EA0FE8\n",
            ":00000001FF\n",
        );
        let image = parse_hex(text, chip).unwrap();
        assert_eq!(image.config.id, vec![1, 2, 3, 4]);
        assert_eq!(image.config.fuses, vec![0x0fea]);
    }

    #[test]
    fn hex_round_trip() {
        let chip = ChipDB::find_chip("18f452").unwrap();
        let mut image = MemoryImage::blank(chip);
        image.rom[0] = 0xef04;
        image.rom[0x3fff] = 0x1234;
        image.eeprom[0x10] = 0x99;
        image.config.id = vec![1, 2, 3, 4, 5, 6, 7, 8];
        image.config.fuses[0] = 0x22ff;
        let text = serialize_hex(&image).unwrap();
        assert!(text.contains(":020000040030CA"));
        assert_eq!(parse_hex(&text, chip).unwrap(), image);

        let chip = ChipDB::find_chip("12f675").unwrap();
        let mut image = MemoryImage::blank(chip);
        image.rom[0x3ff] = 0x3480;
        image.eeprom[0x7f] = 0x01;
        let text = serialize_hex(&image).unwrap();
        assert_eq!(parse_hex(&text, chip).unwrap(), image);
    }

    #[test]
    fn hex_holds_only_the_requested_regions() {
        let chip = ChipDB::find_chip("16f628a").unwrap();
        let mut image = MemoryImage::blank(chip);
        image.rom[0] = 0x2805;
        image.config.fuses[0] = 0x3ffb;
        image.eeprom[0] = 0x11;

        let text = serialize_hex_regions(&image, &[Region::Eeprom]).unwrap();
        // 128 word-wide bytes in 16-byte records, then EOF
        assert_eq!(text.lines().count(), 17);
        let reparsed = parse_hex(&text, chip).unwrap();
        assert_eq!(reparsed.rom_used(), 0);
        assert_eq!(reparsed.eeprom[0], 0x11);

        let text = serialize_hex_regions(&image, &[Region::Config]).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert_eq!(parse_hex(&text, chip).unwrap().config.fuses, vec![0x3ffb]);
    }

    #[test]
    fn binary_regions() {
        let chip = ChipDB::find_chip("16f628a").unwrap();
        let mut image = MemoryImage::blank(chip);
        image.config.id = vec![9, 8, 7, 6];
        image.config.fuses[0] = 0x3f10;
        let raw = serialize_binary(&image, Region::Config);
        assert_eq!(raw, vec![9, 8, 7, 6, 0x10, 0x3f]);
        assert_eq!(parse_binary(&raw, chip, Region::Config).unwrap(), image);

        let rom = parse_binary(&[0x05, 0x28], chip, Region::Rom).unwrap();
        assert_eq!(rom.rom[0], 0x2805);
        assert!(parse_binary(&[0x05], chip, Region::Rom).is_err());
    }

    #[test]
    fn format_guessing() {
        assert_eq!(
            guess_format(Path::new("blink.hex"), b"\x00"),
            FirmwareFormat::IntelHex
        );
        assert_eq!(
            guess_format(Path::new("dump"), b":00000001FF\r\n"),
            FirmwareFormat::IntelHex
        );
        assert_eq!(
            guess_format(Path::new("rom.bin"), &[0x05, 0x28]),
            FirmwareFormat::Binary
        );
    }
}
