//! Memory image of one chip: ROM, EEPROM and configuration.
use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::device::{Chip, apply_setting};
use crate::error::{Error, Region, Result};

/// User ID bytes and configuration words
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigMemory {
    pub id: Vec<u8>,
    pub fuses: Vec<u16>,
}

/// Contents of every memory region of `chip`, with chip-relative addresses.
///
/// Region lengths always match the chip.
#[derive(Clone)]
pub struct MemoryImage {
    chip: &'static Chip,
    pub rom: Vec<u16>,
    pub eeprom: Vec<u8>,
    pub config: ConfigMemory,
}

impl fmt::Debug for MemoryImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryImage")
            .field("chip", &self.chip.name)
            .field("rom", &format_args!("[{} words]", self.rom.len()))
            .field("eeprom", &format_args!("[{} bytes]", self.eeprom.len()))
            .field("config", &self.config)
            .finish()
    }
}

impl PartialEq for MemoryImage {
    fn eq(&self, other: &Self) -> bool {
        self.chip.name == other.chip.name
            && self.rom == other.rom
            && self.eeprom == other.eeprom
            && self.config == other.config
    }
}

impl Eq for MemoryImage {}

impl MemoryImage {
    /// Erased state: blank ROM words, 0xFF EEPROM, zero ID, blank fuses.
    pub fn blank(chip: &'static Chip) -> Self {
        MemoryImage {
            chip,
            rom: vec![chip.rom_blank_word(); chip.rom_size as usize],
            eeprom: vec![0xff; chip.eeprom_size as usize],
            config: ConfigMemory {
                id: vec![0; chip.id_size()],
                fuses: chip.fuse_blank.clone(),
            },
        }
    }

    pub fn from_parts(
        chip: &'static Chip,
        rom: Vec<u16>,
        eeprom: Vec<u8>,
        config: ConfigMemory,
    ) -> Result<Self> {
        let image = MemoryImage {
            chip,
            rom,
            eeprom,
            config,
        };
        image.check()?;
        Ok(image)
    }

    fn check(&self) -> Result<()> {
        let chip = self.chip;
        let checks = [
            (Region::Rom, self.rom.len(), chip.rom_size as usize),
            (Region::Eeprom, self.eeprom.len(), chip.eeprom_size as usize),
            (Region::Config, self.config.fuses.len(), chip.config_words()),
            (Region::Config, self.config.id.len(), chip.id_size()),
        ];
        for (region, found, expected) in checks {
            if found != expected {
                return Err(Error::InvalidImage(format!(
                    "{} holds {} entries, {} has {}",
                    region, found, chip, expected
                )));
            }
        }
        let blank = chip.rom_blank_word();
        if let Some(addr) = self.rom.iter().position(|w| w & !blank != 0) {
            return Err(Error::InvalidImage(format!(
                "ROM word 0x{:04x} at 0x{:04x} is wider than {} bits",
                self.rom[addr],
                addr,
                chip.core_bits()
            )));
        }
        Ok(())
    }

    pub fn chip(&self) -> &'static Chip {
        self.chip
    }

    /// Symbolic setting of every fuse field
    pub fn extract_fuses(&self) -> Result<BTreeMap<String, String>> {
        self.chip.decode_fuses(&self.config.fuses)
    }

    /// A copy with the given fuse fields set; bits outside those fields are preserved.
    ///
    /// Every override is validated before anything changes.
    pub fn apply_overrides(&self, overrides: &BTreeMap<String, String>) -> Result<MemoryImage> {
        let settings = overrides
            .iter()
            .map(|(field, value)| self.chip.fuse_setting(field, value))
            .collect::<Result<Vec<_>>>()?;
        let mut image = self.clone();
        for (field, setting) in settings {
            log::debug!("Fuse {} = {}", field.name, setting.name);
            apply_setting(&mut image.config.fuses, field, setting);
        }
        Ok(image)
    }

    /// A copy with the user ID replaced. Shorter IDs are padded with zeros.
    pub fn with_id(&self, id: &[u8]) -> Result<MemoryImage> {
        let size = self.chip.id_size();
        if id.len() > size {
            return Err(Error::InvalidImage(format!(
                "ID of {} bytes, {} takes at most {}",
                id.len(),
                self.chip,
                size
            )));
        }
        let mut image = self.clone();
        image.config.id = id.to_vec();
        image.config.id.resize(size, 0);
        Ok(image)
    }

    /// Number of ROM words that are not blank
    pub fn rom_used(&self) -> usize {
        let blank = self.chip.rom_blank_word();
        self.rom.iter().filter(|&&w| w != blank).count()
    }

    pub fn eeprom_used(&self) -> usize {
        self.eeprom.iter().filter(|&&b| b != 0xff).count()
    }

    pub fn hex_info(&self) -> HexInfo {
        let blank = self.chip.rom_blank_word();
        HexInfo {
            chip: self.chip.name.clone(),
            rom_words: self.rom.len(),
            rom_used: self.rom_used(),
            rom_last_used: self.rom.iter().rposition(|&w| w != blank),
            eeprom_bytes: self.eeprom.len(),
            eeprom_used: self.eeprom_used(),
            id: hex::encode(&self.config.id),
            fuses: self.config.fuses.clone(),
            fuse_settings: self.extract_fuses().ok(),
        }
    }
}

/// Summary of an image, rendered by `hex-info`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HexInfo {
    pub chip: String,
    pub rom_words: usize,
    pub rom_used: usize,
    pub rom_last_used: Option<usize>,
    pub eeprom_bytes: usize,
    pub eeprom_used: usize,
    pub id: String,
    pub fuses: Vec<u16>,
    /// `None` when some field matches none of its settings
    pub fuse_settings: Option<BTreeMap<String, String>>,
}

impl fmt::Display for HexInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Chip: {}", self.chip.to_uppercase())?;
        match self.rom_last_used {
            Some(last) => writeln!(
                f,
                "ROM: {} of {} words used, last at 0x{:04x}",
                self.rom_used, self.rom_words, last
            )?,
            None => writeln!(f, "ROM: blank ({} words)", self.rom_words)?,
        }
        if self.eeprom_bytes > 0 {
            writeln!(f, "EEPROM: {} of {} bytes used", self.eeprom_used, self.eeprom_bytes)?;
        }
        writeln!(f, "ID: {}", self.id)?;
        let words: Vec<_> = self.fuses.iter().map(|w| format!("0x{:04x}", w)).collect();
        writeln!(f, "Fuses: {}", words.join(" "))?;
        match &self.fuse_settings {
            Some(settings) => {
                for (field, value) in settings {
                    writeln!(f, "  {}: {}", field, value)?;
                }
            }
            None => writeln!(f, "  (fuse words match no known settings)")?,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::ChipDB;

    fn overrides(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn blank_image_matches_chip() {
        let chip = ChipDB::find_chip("18f452").unwrap();
        let image = MemoryImage::blank(chip);
        assert_eq!(image.rom.len(), 0x4000);
        assert_eq!(image.eeprom.len(), 256);
        assert_eq!(image.config.id.len(), 8);
        assert_eq!(image.config.fuses.len(), 7);
        assert_eq!(image.rom_used(), 0);
    }

    #[test]
    fn from_parts_checks_lengths() {
        let chip = ChipDB::find_chip("12f675").unwrap();
        let blank = MemoryImage::blank(chip);
        assert!(matches!(
            MemoryImage::from_parts(chip, vec![0; 10], blank.eeprom.clone(), blank.config.clone()),
            Err(Error::InvalidImage(_))
        ));
        let mut rom = blank.rom.clone();
        rom[3] = 0x4000;
        assert!(MemoryImage::from_parts(chip, rom, blank.eeprom, blank.config).is_err());
    }

    #[test]
    fn override_touches_only_its_bits() {
        let chip = ChipDB::find_chip("12f675").unwrap();
        let mut image = MemoryImage::blank(chip);
        // band-gap bits belong to no field
        image.config.fuses[0] = 0x11ff;
        let updated = image
            .apply_overrides(&overrides(&[("WDT", "Disabled")]))
            .unwrap();
        assert_eq!(updated.config.fuses[0], 0x11f7);
        assert_eq!(updated.extract_fuses().unwrap()["WDT"], "Disabled");
        assert_eq!(image.config.fuses[0], 0x11ff);
    }

    #[test]
    fn invalid_override_leaves_image_unchanged() {
        let chip = ChipDB::find_chip("12f675").unwrap();
        let image = MemoryImage::blank(chip);
        let err = image
            .apply_overrides(&overrides(&[("MCLRE", "Disabled"), ("WDT", "Sometimes")]))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidFuseValue { ref field, ref value } if field == "WDT" && value == "Sometimes"
        ));
        assert!(matches!(
            image.apply_overrides(&overrides(&[("Watchdog", "Enabled")])),
            Err(Error::UnknownFuse { .. })
        ));
    }

    #[test]
    fn user_id() {
        let chip = ChipDB::find_chip("16f628a").unwrap();
        let image = MemoryImage::blank(chip).with_id(&[1, 2]).unwrap();
        assert_eq!(image.config.id, vec![1, 2, 0, 0]);
        assert!(image.with_id(&[0; 5]).is_err());
    }

    #[test]
    fn hex_info_summary() {
        let chip = ChipDB::find_chip("16f628a").unwrap();
        let mut image = MemoryImage::blank(chip);
        image.rom[0] = 0x2805;
        image.rom[5] = 0x0008;
        image.eeprom[0] = 0x42;
        let info = image.hex_info();
        assert_eq!(info.rom_used, 2);
        assert_eq!(info.rom_last_used, Some(5));
        assert_eq!(info.eeprom_used, 1);
        assert_eq!(info.fuse_settings.unwrap()["Oscillator"], "ER CLKOUT");
        assert!(image.hex_info().to_string().contains("last at 0x0005"));
    }
}
