use std::collections::BTreeMap;
use std::sync::atomic::Ordering;

use picprog::constants::Timing;
use picprog::error::HexFault;
use picprog::format::{parse_hex, serialize_hex};
use picprog::transport::{DummyChip, DummyTransport};
use picprog::{
    ChipDB, Error, ErrorKind, Flashing, MemoryImage, NoProgress, Options, Progress, Region,
    Step,
};

fn options() -> Options {
    Options {
        timing: Timing::instant(),
        ..Default::default()
    }
}

fn connect(chip: &str) -> (Flashing<DummyTransport>, DummyTransport) {
    let dummy = DummyTransport::new(ChipDB::find_chip(chip).unwrap());
    let flashing = Flashing::connect(chip, options(), || Ok(dummy.clone())).unwrap();
    (flashing, dummy)
}

fn sample_image(chip: &str) -> MemoryImage {
    let chip = ChipDB::find_chip(chip).unwrap();
    let mut image = MemoryImage::blank(chip);
    let blank = chip.rom_blank_word();
    for (i, w) in image.rom.iter_mut().take(100).enumerate() {
        *w = (0x2800 + i as u16) & blank;
    }
    for (i, b) in image.eeprom.iter_mut().take(10).enumerate() {
        *b = i as u8;
    }
    image.with_id(&[1, 2, 3, 4]).unwrap()
}

#[test]
fn program_then_verify() {
    let (mut flashing, dummy) = connect("16f628a");
    let mut overrides = BTreeMap::new();
    overrides.insert("WDT".to_string(), "Disabled".to_string());
    let image = sample_image("16f628a").apply_overrides(&overrides).unwrap();

    let report = flashing.program(&image, &mut NoProgress).unwrap();
    assert!(report.is_ok(), "{:?}", report);
    assert_eq!(&dummy.chip().rom[..100], &image.rom[..100]);
    assert_eq!(&dummy.chip().eeprom[..10], &image.eeprom[..10]);
    assert_eq!(dummy.chip().fuses[0], image.config.fuses[0]);
    assert_eq!(dummy.voltage_cycles(), 1);
    assert!(!dummy.voltages_on());

    assert!(flashing.verify(&image, &mut NoProgress).unwrap().is_ok());

    // programming again lands in the same state
    let before = dummy.chip();
    assert!(flashing.program(&image, &mut NoProgress).unwrap().is_ok());
    assert_eq!(dummy.chip(), before);
    assert_eq!(dummy.erase_count(), 2);
}

#[test]
fn verify_reports_first_bad_word() {
    let (mut flashing, dummy) = connect("16f628a");
    dummy.stick_rom_word(0x42, 0x0000);
    let image = sample_image("16f628a");
    let report = flashing.program(&image, &mut NoProgress).unwrap();
    let m = report.first().unwrap();
    assert_eq!(m.region, Region::Rom);
    assert_eq!(m.address, 0x42);
    assert_eq!(m.expected, image.rom[0x42]);
    assert_eq!(m.found, 0x0000);
}

#[test]
fn verify_finds_a_changed_word() {
    let (mut flashing, _dummy) = connect("16f628a");
    let mut image = sample_image("16f628a");
    assert!(flashing.program(&image, &mut NoProgress).unwrap().is_ok());

    image.rom[0x17] ^= 1;
    let report = flashing.verify(&image, &mut NoProgress).unwrap();
    assert_eq!(report.mismatches.len(), 1);
    let m = report.first().unwrap();
    assert_eq!((m.region, m.address), (Region::Rom, 0x17));
    assert_eq!(m.found, image.rom[0x17] ^ 1);
}

#[test]
fn unknown_chip_does_no_io() {
    let mut opened = false;
    let result = Flashing::<DummyTransport>::connect("16f999", options(), || {
        opened = true;
        unreachable!()
    });
    assert!(matches!(result, Err(Error::UnknownChipType(_))));
    assert!(!opened);
}

#[test]
fn rejected_rom_word_is_a_programming_failure() {
    let (mut flashing, dummy) = connect("16f628a");
    dummy.reject_rom_at(0x21);
    let err = flashing
        .program(&sample_image("16f628a"), &mut NoProgress)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Programming);
    match err {
        Error::Step { step, source } => {
            assert_eq!(step, Step::WriteRom);
            assert!(matches!(
                *source,
                Error::ProgrammingFailure {
                    region: Region::Rom,
                    address: 0x21
                }
            ));
        }
        e => panic!("unexpected error {:?}", e),
    }
    assert!(!dummy.voltages_on());
}

#[test]
fn wrong_chip_in_socket() {
    let (mut flashing, dummy) = connect("16f628a");
    let mut chip = dummy.chip();
    chip.chip_id = 0x0fc0;
    dummy.set_chip(chip);
    let err = flashing
        .program(&sample_image("16f628a"), &mut NoProgress)
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Step {
            step: Step::CheckChipId,
            ..
        }
    ));
    assert_eq!(dummy.erase_count(), 0);
}

#[test]
fn revision_bits_are_ignored() {
    let (mut flashing, dummy) = connect("16f628a");
    let mut chip = dummy.chip();
    chip.chip_id |= 0x0007;
    dummy.set_chip(chip);
    assert!(
        flashing
            .program(&sample_image("16f628a"), &mut NoProgress)
            .unwrap()
            .is_ok()
    );
}

/// Raises the cancel flag once the first block is through.
struct CancelAfterFirstBlock(std::sync::Arc<std::sync::atomic::AtomicBool>);

impl Progress for CancelAfterFirstBlock {
    fn position(&mut self, _done: usize, _total: usize) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[test]
fn cancellation_turns_voltages_off() {
    let (mut flashing, dummy) = connect("16f628a");
    let mut progress = CancelAfterFirstBlock(flashing.cancel_handle());
    let err = flashing
        .program(&sample_image("16f628a"), &mut progress)
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled));
    assert!(!dummy.voltages_on());
    assert_eq!(dummy.rom_writes(), 1);
}

#[test]
fn workflows_run_again_after_cancellation() {
    let (mut flashing, dummy) = connect("16f628a");
    flashing.cancel_handle().store(true, Ordering::SeqCst);
    assert!(matches!(
        flashing.erase(&mut NoProgress),
        Err(Error::Cancelled)
    ));
    assert_eq!(dummy.erase_count(), 0);

    flashing.erase(&mut NoProgress).unwrap();
    assert_eq!(dummy.erase_count(), 1);
}

#[test]
fn ctrl_c_cancels_the_workflow() {
    let (mut flashing, dummy) = connect("16f628a");
    flashing.cancel_on_interrupt().unwrap();
    signal_hook::low_level::raise(signal_hook::consts::SIGINT).unwrap();
    assert!(flashing.cancel_handle().load(Ordering::SeqCst));

    let err = flashing
        .program(&sample_image("16f628a"), &mut NoProgress)
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled));
    assert_eq!(dummy.rom_writes(), 0);
    assert!(!dummy.voltages_on());
}

#[test]
fn calibration_word_survives_programming() {
    let (mut flashing, dummy) = connect("12f675");
    let factory = dummy.chip().calibrate;
    let mut image = sample_image("12f675");
    // images built by compilers carry a RETLW in the last word
    *image.rom.last_mut().unwrap() = 0x3400;

    let report = flashing.program(&image, &mut NoProgress).unwrap();
    assert!(report.is_ok(), "{:?}", report);
    assert_eq!(*dummy.chip().rom.last().unwrap(), factory);
    assert_eq!(dummy.chip().calibrate, factory);

    let dumped = flashing.dump(&[Region::Rom], &mut NoProgress).unwrap();
    assert_eq!(*dumped.rom.last().unwrap(), factory);
}

#[test]
fn pic18_fuses_are_committed_after_verification() {
    let (mut flashing, dummy) = connect("18f452");
    let mut image = sample_image("18f452");
    image.config.fuses[0] = 0x22ff;
    let report = flashing.program(&image, &mut NoProgress).unwrap();
    assert!(report.is_ok(), "{:?}", report);
    let chip = dummy.chip();
    assert_eq!(chip.fuses[0], 0x22ff);
    assert_eq!(chip.pending_fuses, None);
    assert_eq!(&chip.id, &[1, 2, 3, 4, 0, 0, 0, 0]);
}

#[test]
fn pic18_fuses_stay_pending_when_verification_fails() {
    let (mut flashing, dummy) = connect("18f452");
    dummy.stick_rom_word(0, 0x0000);
    let mut image = sample_image("18f452");
    image.config.fuses[0] = 0x22ff;
    let report = flashing.program(&image, &mut NoProgress).unwrap();
    assert_eq!(report.first().map(|m| m.address), Some(0));
    assert_ne!(dummy.chip().fuses[0], 0x22ff);
}

#[test]
fn dump_serializes_to_hex() {
    let (mut flashing, _dummy) = connect("16f628a");
    let image = sample_image("16f628a");
    flashing.program(&image, &mut NoProgress).unwrap();

    let dumped = flashing
        .dump(&[Region::Rom, Region::Eeprom, Region::Config], &mut NoProgress)
        .unwrap();
    assert_eq!(dumped, image);

    let text = serialize_hex(&dumped).unwrap();
    let reparsed = parse_hex(&text, ChipDB::find_chip("16f628a").unwrap()).unwrap();
    assert_eq!(reparsed, image);
    let info = reparsed.hex_info();
    assert_eq!(info.rom_used, 100);
    assert_eq!(info.eeprom_used, 10);
    assert_eq!(info.id, "01020304");
}

#[test]
fn pic18_single_word_record() {
    let chip = ChipDB::find_chip("18f452").unwrap();
    let image = parse_hex(":02000000AAAAAA\n:00000001FF\n", chip).unwrap();
    assert_eq!(image.rom[0], 0xaaaa);

    let err = parse_hex(":02000000AAAAAB\n:00000001FF\n", chip).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(matches!(
        err,
        Error::MalformedHex {
            record: 1,
            reason: HexFault::BadChecksum { .. }
        }
    ));
}

#[test]
fn erase_blanks_the_chip() {
    let (mut flashing, dummy) = connect("16f628a");
    flashing
        .program(&sample_image("16f628a"), &mut NoProgress)
        .unwrap();
    flashing.erase(&mut NoProgress).unwrap();
    let chip = ChipDB::find_chip("16f628a").unwrap();
    assert_eq!(dummy.chip(), DummyChip::blank(chip));
}
