//! PIC chip definitions, with the per-chip parameters the programmer firmware needs
use std::collections::BTreeMap;

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::protocol::ProgrammingVars;

/// Chip family, one per embedded definition file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Family {
    pub name: String,
    pub description: String,
    pub variants: Vec<Chip>,
}

/// Core class as understood by the programmer firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoreType {
    Bit16A,
    Bit16B,
    Bit14G,
    Bit12A,
    Bit14A,
    Bit14B,
    Bit14C,
    Bit14D,
    Bit14E,
    Bit14F,
    Bit12B,
    Bit14H,
    Bit16C,
}

impl CoreType {
    /// Value sent in the programming variables
    pub const fn code(self) -> u8 {
        match self {
            CoreType::Bit16A => 1,
            CoreType::Bit16B => 2,
            CoreType::Bit14G => 3,
            CoreType::Bit12A => 4,
            CoreType::Bit14A => 5,
            CoreType::Bit14B => 6,
            CoreType::Bit14C => 7,
            CoreType::Bit14D => 8,
            CoreType::Bit14E => 9,
            CoreType::Bit14F => 10,
            CoreType::Bit12B => 11,
            CoreType::Bit14H => 12,
            CoreType::Bit16C => 13,
        }
    }

    /// Instruction word width
    pub const fn bits(self) -> u8 {
        match self {
            CoreType::Bit16A | CoreType::Bit16B | CoreType::Bit16C => 16,
            CoreType::Bit12A | CoreType::Bit12B => 12,
            _ => 14,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerSequence {
    Vcc,
    VccVpp1,
    VccVpp2,
    Vpp1Vcc,
    Vpp2Vcc,
    VccFastVpp1,
    VccFastVpp2,
}

impl PowerSequence {
    pub const fn code(self) -> u8 {
        match self {
            PowerSequence::Vcc => 0,
            PowerSequence::VccVpp1 | PowerSequence::VccFastVpp1 => 1,
            PowerSequence::VccVpp2 | PowerSequence::VccFastVpp2 => 2,
            PowerSequence::Vpp1Vcc => 3,
            PowerSequence::Vpp2Vcc => 4,
        }
    }

    pub const fn vcc_vpp_delay(self) -> bool {
        matches!(self, PowerSequence::VccFastVpp1 | PowerSequence::VccFastVpp2)
    }

    /// ICSP only wires the first Vpp line.
    pub const fn for_icsp(self) -> Self {
        match self {
            PowerSequence::VccVpp2 => PowerSequence::VccVpp1,
            PowerSequence::Vpp2Vcc => PowerSequence::Vpp1Vcc,
            PowerSequence::VccFastVpp2 => PowerSequence::VccFastVpp1,
            other => other,
        }
    }
}

/// AND-masks over consecutive configuration words, e.g. `3FFF&3FBF`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct FuseWords(pub Vec<u16>);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FuseSetting {
    pub name: String,
    pub value: FuseWords,
}

/// A named fuse, e.g. "WDT", with its legal settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FuseField {
    pub name: String,
    /// Index of the first configuration word the settings apply to
    #[serde(default)]
    pub word: usize,
    #[serde(deserialize_with = "parse_settings")]
    pub settings: Vec<FuseSetting>,
}

impl FuseField {
    pub fn setting(&self, name: &str) -> Option<&FuseSetting> {
        self.settings.iter().find(|s| s.name == name)
    }

    pub fn setting_names(&self) -> impl Iterator<Item = &str> {
        self.settings.iter().map(|s| s.name.as_str())
    }

    /// Number of configuration words the field spans
    pub fn width(&self) -> usize {
        self.settings.iter().map(|s| s.value.0.len()).max().unwrap_or(0)
    }

    /// Bits owned by this field, one mask per spanned word: the bits on which
    /// its settings disagree.
    pub fn mask(&self) -> Vec<u16> {
        (0..self.width())
            .map(|i| {
                let (any, all) = self.settings.iter().fold((0u16, 0xffffu16), |(any, all), s| {
                    let v = s.value.0.get(i).copied().unwrap_or(0xffff);
                    (any | v, all & v)
                });
                any & !all
            })
            .collect()
    }
}

/// Represents a PIC chip
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chip {
    /// Chip name, lowercase, without the "PIC" prefix
    pub name: String,
    pub core_type: CoreType,
    /// In words
    #[serde(deserialize_with = "parse_size")]
    pub rom_size: u32,
    /// In bytes
    #[serde(default, deserialize_with = "parse_size")]
    pub eeprom_size: u32,
    /// Blank value of every configuration word
    #[serde(deserialize_with = "parse_fuse_blank")]
    pub fuse_blank: Vec<u16>,
    /// Device ID with revision bits cleared, 0xffff if the part has none
    #[serde(deserialize_with = "parse_hex_word")]
    pub chip_id: u16,

    pub socket_image: String,
    pub power_sequence: PowerSequence,
    pub erase_mode: u8,
    pub program_delay: u8,
    #[serde(default = "default_program_tries")]
    pub program_tries: u8,
    #[serde(default)]
    pub over_program: u8,

    #[serde(default)]
    pub flash_chip: bool,
    #[serde(default)]
    pub cp_warn: bool,
    /// Oscillator calibration lives in the last ROM word
    #[serde(default)]
    pub cal_word: bool,
    /// Band-gap calibration bits live in the configuration word
    #[serde(default)]
    pub band_gap: bool,
    #[serde(default)]
    pub icsp_only: bool,

    #[serde(default)]
    pub fuses: Vec<FuseField>,
}

impl ::std::fmt::Display for Chip {
    fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
        if self.has_device_id() {
            write!(f, "PIC{}(0x{:04x})", self.name.to_uppercase(), self.chip_id)
        } else {
            write!(f, "PIC{}", self.name.to_uppercase())
        }
    }
}

/// Machine-readable chip summary, rendered by `chip-info`
#[derive(Debug, Clone, Serialize)]
pub struct ChipInfo {
    pub name: String,
    pub core_bits: u8,
    pub rom_size: u32,
    pub eeprom_size: u32,
    pub config_words: usize,
    pub chip_id: Option<u16>,
    pub icsp_only: bool,
    pub calibration_word: bool,
    pub pin1: String,
    pub fuses: BTreeMap<String, Vec<String>>,
}

/// Revision bits of the device ID word
const REVISION_MASK: u16 = 0x001f;
const NO_DEVICE_ID: u16 = 0xffff;

impl Chip {
    pub const fn core_bits(&self) -> u8 {
        self.core_type.bits()
    }

    /// Value of an erased ROM word
    pub const fn rom_blank_word(&self) -> u16 {
        match self.core_bits() {
            16 => 0xffff,
            bits => (1u16 << bits) - 1,
        }
    }

    pub const fn has_eeprom(&self) -> bool {
        self.eeprom_size != 0
    }

    pub const fn has_device_id(&self) -> bool {
        self.chip_id != NO_DEVICE_ID
    }

    /// Number of user ID bytes
    pub const fn id_size(&self) -> usize {
        if self.core_bits() == 16 { 8 } else { 4 }
    }

    pub fn config_words(&self) -> usize {
        self.fuse_blank.len()
    }

    /// Whether a device ID read from the chip belongs to this part
    pub fn matches_id(&self, reported: u16) -> bool {
        !self.has_device_id() || (reported & !REVISION_MASK) == (self.chip_id & !REVISION_MASK)
    }

    pub fn pin1_location(&self) -> &'static str {
        match self.socket_image.as_str() {
            "8pin" | "14pin" => "socket pin 13",
            "18pin" => "socket pin 2",
            "28Npin" | "40pin" => "socket pin 1",
            _ => "the ICSP header",
        }
    }

    pub fn programming_vars(&self, icsp: bool) -> ProgrammingVars {
        let power_sequence = if icsp {
            self.power_sequence.for_icsp()
        } else {
            self.power_sequence
        };
        ProgrammingVars {
            rom_size: self.rom_size as u16,
            eeprom_size: self.eeprom_size as u16,
            core_type: self.core_type.code(),
            calibration_in_rom: self.cal_word,
            band_gap_fuse: self.band_gap,
            single_panel_access: self.core_type == CoreType::Bit16A,
            vcc_vpp_delay: self.power_sequence.vcc_vpp_delay(),
            program_delay: self.program_delay,
            power_sequence: power_sequence.code(),
            erase_mode: self.erase_mode,
            program_tries: self.program_tries,
            over_program: self.over_program,
        }
    }

    pub fn fuse_field(&self, name: &str) -> Result<&FuseField> {
        self.fuses
            .iter()
            .find(|f| f.name == name)
            .ok_or_else(|| Error::UnknownFuse {
                chip: self.name.clone(),
                field: name.to_string(),
            })
    }

    /// Validate one fuse field setting against the chip
    pub fn fuse_setting(&self, field: &str, value: &str) -> Result<(&FuseField, &FuseSetting)> {
        let f = self.fuse_field(field)?;
        let setting = f.setting(value).ok_or_else(|| Error::InvalidFuseValue {
            field: field.to_string(),
            value: value.to_string(),
        })?;
        Ok((f, setting))
    }

    /// Symbolic setting of every fuse field in `words`.
    pub fn decode_fuses(&self, words: &[u16]) -> Result<BTreeMap<String, String>> {
        let mut result = BTreeMap::new();
        for field in &self.fuses {
            let mask = field.mask();
            let current = |i: usize| words.get(field.word + i).copied().unwrap_or(0xffff);
            let found = field.settings.iter().find(|s| {
                mask.iter()
                    .enumerate()
                    .all(|(i, m)| current(i) & m == s.value.0.get(i).copied().unwrap_or(0xffff) & m)
            });
            match found {
                Some(s) => {
                    result.insert(field.name.clone(), s.name.clone());
                }
                None => return Err(Error::UndecodableFuse(field.name.clone())),
            }
        }
        Ok(result)
    }

    /// Configuration words for a set of symbolic settings, starting from blank.
    pub fn encode_fuses(&self, settings: &BTreeMap<String, String>) -> Result<Vec<u16>> {
        let mut words = self.fuse_blank.clone();
        for (field, value) in settings {
            let (f, setting) = self.fuse_setting(field, value)?;
            apply_setting(&mut words, f, setting);
        }
        Ok(words)
    }

    /// One line per fuse field, listing its legal settings
    pub fn fuse_doc(&self) -> String {
        self.fuses
            .iter()
            .map(|f| {
                let settings: Vec<_> = f.setting_names().map(|s| format!("'{}'", s)).collect();
                format!("'{}' : ({})\n", f.name, settings.join(", "))
            })
            .collect()
    }

    pub fn info(&self) -> ChipInfo {
        ChipInfo {
            name: self.name.clone(),
            core_bits: self.core_bits(),
            rom_size: self.rom_size,
            eeprom_size: self.eeprom_size,
            config_words: self.config_words(),
            chip_id: self.has_device_id().then_some(self.chip_id),
            icsp_only: self.icsp_only,
            calibration_word: self.cal_word,
            pin1: self.pin1_location().to_string(),
            fuses: self
                .fuses
                .iter()
                .map(|f| (f.name.clone(), f.setting_names().map(String::from).collect()))
                .collect(),
        }
    }
}

/// Replace the bits `field` owns in `words` with those of `setting`.
pub(crate) fn apply_setting(words: &mut [u16], field: &FuseField, setting: &FuseSetting) {
    for (i, mask) in field.mask().into_iter().enumerate() {
        if let Some(w) = words.get_mut(field.word + i) {
            let v = setting.value.0.get(i).copied().unwrap_or(0xffff);
            *w = (*w & !mask) | (v & mask);
        }
    }
}

pub struct ChipDB {
    families: Vec<Family>,
}

static CHIP_DB: OnceCell<ChipDB> = OnceCell::new();

impl ChipDB {
    pub fn load() -> Result<Self> {
        let sources = [
            include_str!("../devices/pic12.yaml"),
            include_str!("../devices/pic12f6xx.yaml"),
            include_str!("../devices/pic16f.yaml"),
            include_str!("../devices/pic18f.yaml"),
        ];
        let families = sources
            .iter()
            .map(|s| serde_yaml::from_str::<Family>(s))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::ChipDatabase(e.to_string()))?;
        Ok(ChipDB { families })
    }

    /// The process-wide chip table, parsed on first use
    pub fn get() -> Result<&'static ChipDB> {
        CHIP_DB.get_or_try_init(ChipDB::load)
    }

    pub fn families(&self) -> &[Family] {
        &self.families
    }

    /// All chips, sorted by name
    pub fn chips(&self) -> Vec<&Chip> {
        let mut chips: Vec<_> = self.families.iter().flat_map(|f| f.variants.iter()).collect();
        chips.sort_by(|a, b| a.name.cmp(&b.name));
        chips
    }

    pub fn names(&self) -> Vec<&str> {
        self.chips().into_iter().map(|c| c.name.as_str()).collect()
    }

    pub fn find(&self, name: &str) -> Result<&Chip> {
        let name = name.trim().to_lowercase();
        let name = name.strip_prefix("pic").unwrap_or(&name);
        let (family, chip) = self
            .families
            .iter()
            .find_map(|f| f.variants.iter().find(|c| c.name == name).map(|c| (f, c)))
            .ok_or_else(|| Error::UnknownChipType(name.to_string()))?;
        log::debug!("Found chip {} in family {}", chip, family.name);
        Ok(chip)
    }

    pub fn find_chip(name: &str) -> Result<&'static Chip> {
        ChipDB::get()?.find(name)
    }
}

fn default_program_tries() -> u8 {
    1
}

fn parse_settings<'de, D>(deserializer: D) -> std::result::Result<Vec<FuseSetting>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let entries: Vec<String> = Deserialize::deserialize(deserializer)?;
    entries
        .into_iter()
        .map(|e| {
            let (name, value) = e
                .rsplit_once('=')
                .ok_or_else(|| serde::de::Error::custom(format!("missing '=' in {:?}", e)))?;
            Ok(FuseSetting {
                name: name.trim().to_string(),
                value: FuseWords(parse_fuse_words(value).map_err(serde::de::Error::custom)?),
            })
        })
        .collect()
}

fn parse_fuse_words(s: &str) -> std::result::Result<Vec<u16>, String> {
    s.split('&')
        .map(|w| {
            u16::from_str_radix(w.trim(), 16).map_err(|e| format!("error while parsing {:?}: {}", s, e))
        })
        .collect()
}

fn parse_fuse_blank<'de, D>(deserializer: D) -> std::result::Result<Vec<u16>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    s.split_whitespace()
        .map(|w| u16::from_str_radix(w, 16))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| serde::de::Error::custom(format!("error while parsing {:?}: {}", s, e)))
}

fn parse_hex_word<'de, D>(deserializer: D) -> std::result::Result<u16, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    u16::from_str_radix(digits, 16)
        .map_err(|e| serde::de::Error::custom(format!("error while parsing {:?}: {}", s, e)))
}

fn parse_size<'de, D>(deserializer: D) -> std::result::Result<u32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    parse_size_str(&s).ok_or_else(|| serde::de::Error::custom(format!("error while parsing {:?}", s)))
}

fn parse_size_str(s: &str) -> Option<u32> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok()
    } else if let Some(k) = s.strip_suffix("KiB").or_else(|| s.strip_suffix('K')) {
        k.parse::<u32>().ok().map(|k| k * 1024)
    } else {
        s.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_loads() {
        let db = ChipDB::get().unwrap();
        assert!(db.families().len() >= 4);
        let names = db.names();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
        // every setting has one word per spanned config word
        for chip in db.chips() {
            for field in &chip.fuses {
                assert!(
                    field.word + field.width() <= chip.config_words(),
                    "{}: fuse {} exceeds config words",
                    chip.name,
                    field.name
                );
            }
        }
    }

    #[test]
    fn lookup_is_case_insensitive() {
        assert_eq!(ChipDB::find_chip("PIC12F675").unwrap().name, "12f675");
        assert_eq!(ChipDB::find_chip("16F628a").unwrap().name, "16f628a");
        assert!(matches!(
            ChipDB::find_chip("16f999"),
            Err(Error::UnknownChipType(name)) if name == "16f999"
        ));
    }

    #[test]
    fn pic12f675_reference_values() {
        let chip = ChipDB::find_chip("12f675").unwrap();
        assert_eq!(chip.rom_size, 1024);
        assert_eq!(chip.eeprom_size, 128);
        assert_eq!(chip.core_bits(), 14);
        assert_eq!(chip.rom_blank_word(), 0x3fff);
        assert_eq!(chip.fuse_blank, vec![0x31ff]);
        assert!(chip.cal_word && chip.band_gap);
        let info = chip.info();
        let names: Vec<_> = info.fuses.keys().map(String::as_str).collect();
        assert_eq!(
            names,
            [
                "BODEN",
                "Code Protect",
                "Data Protect",
                "MCLRE",
                "Oscillator",
                "PWRTE",
                "WDT"
            ]
        );
    }

    #[test]
    fn fuse_field_mask() {
        let chip = ChipDB::find_chip("16f737").unwrap();
        assert_eq!(chip.fuse_field("Oscillator").unwrap().mask(), vec![0x0013]);
        assert_eq!(chip.fuse_field("BOREN").unwrap().mask(), vec![0x0040, 0x0040]);
        assert_eq!(chip.fuse_field("Clock Monitor").unwrap().word, 1);
    }

    #[test]
    fn decode_and_encode_fuses() {
        let chip = ChipDB::find_chip("16f737").unwrap();
        let blank = chip.decode_fuses(&chip.fuse_blank).unwrap();
        assert_eq!(blank["Oscillator"], "EXTRC_CLKOUT");
        assert_eq!(blank["BOREN"], "Enabled");

        let mut settings = blank.clone();
        settings.insert("BOREN".into(), "SBOREN".into());
        settings.insert("Clock Monitor".into(), "Disabled".into());
        let words = chip.encode_fuses(&settings).unwrap();
        assert_eq!(words, vec![0x3fbf, 0x3ffe]);
        assert_eq!(chip.decode_fuses(&words).unwrap(), settings);
    }

    #[test]
    fn invalid_fuse_values() {
        let chip = ChipDB::find_chip("12f675").unwrap();
        assert!(matches!(
            chip.fuse_setting("WDT", "Maybe"),
            Err(Error::InvalidFuseValue { .. })
        ));
        assert!(matches!(
            chip.fuse_setting("Watchdog", "Enabled"),
            Err(Error::UnknownFuse { .. })
        ));
    }

    #[test]
    fn icsp_power_sequence() {
        let chip = ChipDB::find_chip("12f675").unwrap();
        assert_eq!(chip.power_sequence, PowerSequence::Vpp2Vcc);
        assert_eq!(chip.programming_vars(false).power_sequence, 4);
        assert_eq!(chip.programming_vars(true).power_sequence, 3);
    }

    #[test]
    fn chip_id_ignores_revision() {
        let chip = ChipDB::find_chip("12f675").unwrap();
        assert!(chip.matches_id(0x0fcb));
        assert!(!chip.matches_id(0x0f8b));
        let baseline = ChipDB::find_chip("12f508").unwrap();
        assert!(baseline.matches_id(0x1234));
    }

    #[test]
    fn sizes() {
        assert_eq!(parse_size_str("0x400"), Some(1024));
        assert_eq!(parse_size_str("2K"), Some(2048));
        assert_eq!(parse_size_str("128"), Some(128));
        assert_eq!(parse_size_str("lots"), None);
    }
}
