// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

use super::*;
use crate::mock::{app_image, Event, MockClock, MockFlash, MockLink, MockSystem};
use crate::receiver::FirmwareReceiver;
use consts::{BASE_APP_CURRENT_ADDR, BASE_APP_OLD_ADDR, BASE_BOOTLOADER_ADDR, FLASH_PAGE, RAM_SIZE, RAM_START};
use embassy_time::Duration;
use host_protocol::checksum::sum8;
use host_protocol::{chunk_count, value_frame, CHUNK_SIZE};
use std::vec;
use std::vec::Vec;

const READY: u8 = 31;
const LEN_OK: u8 = 3;
const LEN_ERR: u8 = 4;
const ACK: u8 = 5;
const CHECKSUM_OK: u8 = 7;
const CHECKSUM_ERR: u8 = 8;

fn programmer() -> FlashProgrammer<MockFlash> {
    FlashProgrammer::new(MockFlash::new())
}

fn config(format: ImageFormat, mode: TransferMode) -> Config {
    Config {
        image_format: format,
        mode,
        ..Config::default()
    }
}

/// Everything a well behaved gateway sends after `REQUEST`.
fn script_session(link: &mut MockLink, image: &[u8], checksum: u32) {
    link.bytes(&value_frame(Message::Length, image.len() as u32));
    for chunk in image.chunks(CHUNK_SIZE) {
        link.bytes(chunk);
    }
    link.bytes(&value_frame(Message::Checksum, checksum));
}

fn expected_replies(len: usize, last: u8) -> Vec<u8> {
    let mut replies = vec![READY, LEN_OK];
    replies.extend(core::iter::repeat(ACK).take(chunk_count(len)));
    replies.push(last);
    replies
}

fn serve(flash: &mut FlashProgrammer<MockFlash>, config: &Config, link: &mut MockLink, clock: &MockClock) -> Result<Committed, Error> {
    UpdateOrchestrator::new(flash, config).serve(link, clock)
}

fn update(flash: &mut FlashProgrammer<MockFlash>, image: &[u8]) -> Result<Committed, Error> {
    let clock = MockClock::default();
    let mut link = MockLink::new(clock.clone());
    script_session(&mut link, image, sum8(image));
    serve(flash, &Config::default(), &mut link, &clock)
}

fn flag_of(flash: &mut FlashProgrammer<MockFlash>, slot: PartitionSlot) -> FlagState {
    slot.read_flag(flash).unwrap()
}

#[test]
fn session_commits_current() {
    let mut flash = programmer();
    let clock = MockClock::default();
    let mut link = MockLink::new(clock.clone());
    let image = app_image(3001, 1, ImageFormat::Raw, 0);
    script_session(&mut link, &image, sum8(&image));

    let config = Config::default();
    let mut orchestrator = UpdateOrchestrator::new(&mut flash, &config);
    let committed = orchestrator.serve(&mut link, &clock).unwrap();
    assert_eq!(orchestrator.last_state(), SessionState::Resetting);

    assert_eq!(committed.slot, SlotId::Current);
    assert_eq!(committed.flag.size, 3001);
    assert_eq!(committed.flag.version, 1);
    assert_eq!(link.sent, expected_replies(image.len(), CHECKSUM_OK));
    assert!(link.is_drained());

    assert_eq!(flash.inner().bytes(BASE_APP_CURRENT_ADDR, image.len()), &image[..]);
    // Padding of the last partial word
    assert_eq!(flash.inner().bytes(BASE_APP_CURRENT_ADDR + 3001, 3), &[0xFF; 3]);
    match flag_of(&mut flash, PartitionSlot::CURRENT) {
        FlagState::Valid(flag) => assert_eq!(flag.size, 3001),
        other => panic!("unexpected flag {other:?}"),
    }
    assert_eq!(BootSelector::new(ImageFormat::Raw).select(&mut flash), BootDecision::Boot(SlotId::Current));
}

#[test]
fn oversized_length_is_rejected_without_erasing() {
    let mut flash = programmer();
    let previous = app_image(2048, 9, ImageFormat::Raw, 0);
    flash.inner_mut().install(&PartitionSlot::CURRENT, &previous, 4);

    let clock = MockClock::default();
    let mut link = MockLink::new(clock.clone());
    let capacity = ImageFormat::Raw.max_transfer();
    link.bytes(&value_frame(Message::Length, capacity + 1));

    let err = serve(&mut flash, &Config::default(), &mut link, &clock).unwrap_err();
    assert_eq!(
        err,
        Error::SizeExceeded {
            declared: capacity + 1,
            capacity
        }
    );
    assert_eq!(link.sent, vec![READY, LEN_ERR]);
    assert_eq!(flash.inner().erases, 0);
    assert_eq!(flash.inner().bytes(BASE_APP_CURRENT_ADDR, previous.len()), &previous[..]);
    assert!(matches!(flag_of(&mut flash, PartitionSlot::CURRENT), FlagState::Valid(_)));
}

#[test]
fn zero_length_is_rejected() {
    let mut flash = programmer();
    let clock = MockClock::default();
    let mut link = MockLink::new(clock.clone());
    link.bytes(&value_frame(Message::Length, 0));

    let err = serve(&mut flash, &Config::default(), &mut link, &clock).unwrap_err();
    assert!(matches!(err, Error::SizeExceeded { declared: 0, .. }));
    assert_eq!(link.sent, vec![READY, LEN_ERR]);
}

#[test]
fn largest_image_fits() {
    let mut flash = programmer();
    let len = ImageFormat::Raw.max_transfer() as usize;
    let image = app_image(len, 3, ImageFormat::Raw, 0);
    let committed = update(&mut flash, &image).unwrap();
    assert_eq!(committed.flag.size as usize, len);
    assert!(matches!(flag_of(&mut flash, PartitionSlot::CURRENT), FlagState::Valid(_)));
}

#[test]
fn repeated_update_backs_up_previous_current() {
    let mut flash = programmer();
    let original = app_image(1500, 2, ImageFormat::Raw, 0);
    flash.inner_mut().install(&PartitionSlot::CURRENT, &original, 1);
    let image = app_image(2600, 5, ImageFormat::Raw, 0);

    let first = update(&mut flash, &image).unwrap();
    assert_eq!(first.flag.version, 2);
    assert_eq!(flash.inner().bytes(BASE_APP_OLD_ADDR, original.len()), &original[..]);
    assert_eq!(flash.inner().bytes(BASE_APP_CURRENT_ADDR, image.len()), &image[..]);

    let second = update(&mut flash, &image).unwrap();
    assert_eq!(second.flag.version, 3);
    assert_eq!(flash.inner().bytes(BASE_APP_OLD_ADDR, image.len()), &image[..]);
    assert_eq!(flash.inner().bytes(BASE_APP_CURRENT_ADDR, image.len()), &image[..]);

    let selector = BootSelector::new(ImageFormat::Raw);
    assert_eq!(selector.validate(&mut flash, SlotId::Old).unwrap().version, 2);
    assert_eq!(selector.validate(&mut flash, SlotId::Current).unwrap().version, 3);
}

#[test]
fn interrupted_transfer_leaves_backup_bootable() {
    let mut flash = programmer();
    let original = app_image(4000, 4, ImageFormat::Raw, 0);
    flash.inner_mut().install(&PartitionSlot::CURRENT, &original, 7);

    let clock = MockClock::default();
    let mut link = MockLink::new(clock.clone());
    let image = app_image(3000, 8, ImageFormat::Raw, 0);
    link.bytes(&value_frame(Message::Length, image.len() as u32));
    link.bytes(&image[..100]);

    let config = Config::default();
    let mut orchestrator = UpdateOrchestrator::new(&mut flash, &config);
    assert_eq!(orchestrator.serve(&mut link, &clock), Err(Error::TransportTimeout));
    assert_eq!(orchestrator.last_state(), SessionState::Failed);

    let mut replies = vec![READY, LEN_OK];
    replies.extend(core::iter::repeat(ACK).take(100 / CHUNK_SIZE));
    assert_eq!(link.sent, replies);

    assert_eq!(flag_of(&mut flash, PartitionSlot::CURRENT), FlagState::Absent);
    assert_eq!(flash.inner().bytes(BASE_APP_OLD_ADDR, original.len()), &original[..]);
    let selector = BootSelector::new(ImageFormat::Raw);
    assert_eq!(selector.validate(&mut flash, SlotId::Old).unwrap().version, 7);
    assert_eq!(selector.select(&mut flash), BootDecision::Boot(SlotId::Old));
}

#[test]
fn checksum_mismatch_is_not_committed() {
    let mut flash = programmer();
    let original = app_image(1200, 6, ImageFormat::Raw, 0);
    flash.inner_mut().install(&PartitionSlot::CURRENT, &original, 1);

    let clock = MockClock::default();
    let mut link = MockLink::new(clock.clone());
    let image = app_image(1800, 1, ImageFormat::Raw, 0);
    let wrong = (sum8(&image) + 1) % 256;
    script_session(&mut link, &image, wrong);

    let err = serve(&mut flash, &Config::default(), &mut link, &clock).unwrap_err();
    assert_eq!(
        err,
        Error::IntegrityError {
            expected: wrong,
            computed: sum8(&image)
        }
    );
    assert_eq!(link.sent, expected_replies(image.len(), CHECKSUM_ERR));
    assert_eq!(flag_of(&mut flash, PartitionSlot::CURRENT), FlagState::Absent);
    assert_eq!(flash.inner().bytes(BASE_APP_OLD_ADDR, original.len()), &original[..]);
    assert_eq!(BootSelector::new(ImageFormat::Raw).select(&mut flash), BootDecision::Boot(SlotId::Old));
}

#[test]
fn failed_backup_keeps_current() {
    let mut flash = programmer();
    let original = app_image(1200, 6, ImageFormat::Raw, 0);
    flash.inner_mut().install(&PartitionSlot::CURRENT, &original, 1);
    flash.inner_mut().fail_write = Some(BASE_APP_OLD_ADDR..PartitionSlot::OLD.end());

    let image = app_image(1800, 1, ImageFormat::Raw, 0);
    let clock = MockClock::default();
    let mut link = MockLink::new(clock.clone());
    script_session(&mut link, &image, sum8(&image));

    let err = serve(&mut flash, &Config::default(), &mut link, &clock).unwrap_err();
    assert_eq!(err, Error::FlashError(FlashError::Write { addr: BASE_APP_OLD_ADDR }));
    assert_eq!(link.sent, vec![READY, LEN_ERR]);
    assert_eq!(flag_of(&mut flash, PartitionSlot::OLD), FlagState::Absent);
    assert_eq!(flash.inner().bytes(BASE_APP_CURRENT_ADDR, original.len()), &original[..]);
    assert_eq!(BootSelector::new(ImageFormat::Raw).select(&mut flash), BootDecision::Boot(SlotId::Current));
}

/// The last chunk is only acknowledged once the final partial page is programmed.
#[test]
fn failed_last_page_is_not_acknowledged() {
    let mut flash = programmer();
    let last_page = BASE_APP_CURRENT_ADDR + FLASH_PAGE;
    flash.inner_mut().fail_write = Some(last_page..last_page + FLASH_PAGE);

    let clock = MockClock::default();
    let mut link = MockLink::new(clock.clone());
    let image = app_image(1500, 7, ImageFormat::Raw, 0);
    script_session(&mut link, &image, sum8(&image));

    let err = serve(&mut flash, &Config::default(), &mut link, &clock).unwrap_err();
    assert_eq!(err, Error::FlashError(FlashError::Write { addr: last_page }));

    let mut replies = vec![READY, LEN_OK];
    replies.extend(core::iter::repeat(ACK).take(chunk_count(image.len()) - 1));
    assert_eq!(link.sent, replies);
    // The checksum frame is never read
    assert!(!link.is_drained());
    assert_eq!(flag_of(&mut flash, PartitionSlot::CURRENT), FlagState::Absent);
}

#[test]
fn unexpected_byte_aborts_session() {
    let mut flash = programmer();
    let clock = MockClock::default();
    let mut link = MockLink::new(clock.clone());
    link.bytes(&[0x55]);

    let err = serve(&mut flash, &Config::default(), &mut link, &clock).unwrap_err();
    assert_eq!(
        err,
        Error::ProtocolViolation {
            expected: Message::Length,
            received: 0x55
        }
    );
    assert_eq!(link.sent, vec![READY]);
}

#[test]
fn repeated_request_before_length_is_ignored() {
    let mut flash = programmer();
    let clock = MockClock::default();
    let mut link = MockLink::new(clock.clone());
    let image = app_image(64, 2, ImageFormat::Raw, 0);
    link.bytes(&[u8::from(Message::Request)]);
    script_session(&mut link, &image, sum8(&image));

    serve(&mut flash, &Config::default(), &mut link, &clock).unwrap();
    assert_eq!(link.sent, expected_replies(image.len(), CHECKSUM_OK));
}

#[test]
fn headered_image_takes_version_from_header() {
    let mut flash = programmer();
    let clock = MockClock::default();
    let mut link = MockLink::new(clock.clone());
    let image = app_image(512 + 2000, 3, ImageFormat::Headered, 42);
    script_session(&mut link, &image, sum8(&image));

    let config = config(ImageFormat::Headered, TransferMode::Handshake);
    let committed = serve(&mut flash, &config, &mut link, &clock).unwrap();
    assert_eq!(committed.flag.version, 42);
    assert_eq!(committed.flag.size, 2512);

    let selector = BootSelector::new(ImageFormat::Headered);
    assert_eq!(selector.select(&mut flash), BootDecision::Boot(SlotId::Current));
    let jump = selector.prepare(&mut flash, SlotId::Current).unwrap();
    assert_eq!(jump.vector_table, BASE_APP_CURRENT_ADDR + 512);
}

#[test]
fn headered_image_with_bad_crc_is_refused() {
    let mut flash = programmer();
    let clock = MockClock::default();
    let mut link = MockLink::new(clock.clone());
    let mut image = app_image(512 + 1000, 3, ImageFormat::Headered, 1);
    image[700] ^= 0x5A;
    script_session(&mut link, &image, sum8(&image));

    let config = config(ImageFormat::Headered, TransferMode::Handshake);
    let err = serve(&mut flash, &config, &mut link, &clock).unwrap_err();
    assert!(matches!(err, Error::IntegrityError { .. }));
    assert_eq!(link.sent.last(), Some(&CHECKSUM_ERR));
    assert_eq!(flag_of(&mut flash, PartitionSlot::CURRENT), FlagState::Absent);
}

#[test]
fn streamed_image_is_committed() {
    let mut flash = programmer();
    let clock = MockClock::default();
    let mut link = MockLink::new(clock.clone());
    let image = app_image(2500, 11, ImageFormat::Raw, 0);
    link.bytes(&image[..1000]).silence(Duration::from_millis(300)).bytes(&image[1000..]);

    let config = config(ImageFormat::Raw, TransferMode::Stream);
    let committed = serve(&mut flash, &config, &mut link, &clock).unwrap();
    assert_eq!(link.sent, vec![READY]);
    assert_eq!(committed.flag.size, 2500);
    assert_eq!(flash.inner().bytes(BASE_APP_CURRENT_ADDR, image.len()), &image[..]);
}

#[test]
fn streamed_garbage_is_refused() {
    let mut flash = programmer();
    let clock = MockClock::default();
    let mut link = MockLink::new(clock.clone());
    link.bytes(&[0xFF; 300]);

    let config = config(ImageFormat::Raw, TransferMode::Stream);
    let err = serve(&mut flash, &config, &mut link, &clock).unwrap_err();
    assert_eq!(err, Error::InvalidApplication);
    assert_eq!(flag_of(&mut flash, PartitionSlot::CURRENT), FlagState::Absent);
}

#[test]
fn silent_stream_times_out() {
    let mut flash = programmer();
    let clock = MockClock::default();
    let mut link = MockLink::new(clock.clone());

    let config = config(ImageFormat::Raw, TransferMode::Stream);
    let err = serve(&mut flash, &config, &mut link, &clock).unwrap_err();
    assert_eq!(err, Error::TransportTimeout);
    assert!(clock.now().as_millis() >= config.stream_max.as_millis());
}

#[test]
fn receiver_flushes_pages_and_stops_when_idle() {
    let mut flash = programmer();
    let clock = MockClock::default();
    let mut link = MockLink::new(clock.clone());
    let data: Vec<u8> = (0..1200u32).map(|i| (i % 251) as u8).collect();
    link.bytes(&data[..600]).silence(Duration::from_millis(500)).bytes(&data[600..]);

    let received = FirmwareReceiver::new(BASE_APP_CURRENT_ADDR, 4096)
        .receive_until_idle(&mut link, &clock, &mut flash, Duration::from_secs(1), Duration::from_secs(60))
        .unwrap();
    assert_eq!(received.bytes_written, 1200);
    assert_eq!(received.range, BASE_APP_CURRENT_ADDR..BASE_APP_CURRENT_ADDR + 1200);
    assert_eq!(flash.inner().bytes(BASE_APP_CURRENT_ADDR, 1200), &data[..]);
}

/// A length-known image that ends mid-word is padded with the erase value.
#[test]
fn receiver_exact_length_pads_last_word() {
    let mut flash = programmer();
    let clock = MockClock::default();
    let mut link = MockLink::new(clock.clone());
    let data: Vec<u8> = (0..1030u32).map(|i| (i * 3) as u8).collect();
    link.bytes(&data[..700]).bytes(&data[700..]);

    let received = FirmwareReceiver::new(BASE_APP_CURRENT_ADDR, 2048)
        .receive_exact(&mut link, &mut flash, 1030, Duration::from_secs(10))
        .unwrap();
    assert_eq!(received.bytes_written, 1030);
    assert_eq!(received.range, BASE_APP_CURRENT_ADDR..BASE_APP_CURRENT_ADDR + 1032);
    assert_eq!(flash.inner().bytes(BASE_APP_CURRENT_ADDR, 1030), &data[..]);
    assert_eq!(flash.inner().bytes(BASE_APP_CURRENT_ADDR + 1030, 2), [0xFF, 0xFF]);
    assert_eq!(link.sent, vec![ACK; chunk_count(1030)]);
    assert!(link.is_drained());
}

#[test]
fn receiver_refuses_more_than_capacity() {
    let mut flash = programmer();
    let mut receiver = FirmwareReceiver::new(BASE_APP_CURRENT_ADDR, 16);
    receiver.push(&mut flash, &[1; 10]).unwrap();
    assert_eq!(
        receiver.push(&mut flash, &[2; 10]),
        Err(Error::SizeExceeded {
            declared: 20,
            capacity: 16
        })
    );
    assert_eq!(receiver.bytes_received(), 10);
    let received = receiver.finish(&mut flash).unwrap();
    assert_eq!(received.bytes_written, 10);
    assert_eq!(received.range.end - received.range.start, 12);
}

#[test]
fn current_invalid_boots_old() {
    let mut flash = MockFlash::new();
    let image = app_image(1024, 1, ImageFormat::Raw, 0);
    flash.install(&PartitionSlot::CURRENT, &image, 3);
    flash.install(&PartitionSlot::OLD, &image, 2);
    // Clear the valid marker of Current
    let marker = (PartitionSlot::CURRENT.flag_addr + 4 - consts::FLASH_BASE) as usize;
    flash.mem[marker..marker + 4].fill(0);

    let clock = MockClock::default();
    let link = MockLink::new(clock.clone());
    let mut bootloader = Bootloader::new(Config::default(), flash, link, clock.clone());
    match bootloader.step() {
        Step::Jump(jump) => {
            assert_eq!(jump.slot, SlotId::Old);
            assert_eq!(jump.vector_table, BASE_APP_OLD_ADDR);
            assert_eq!(jump.vectors.sp, RAM_START + RAM_SIZE);
        }
        other => panic!("unexpected step {other:?}"),
    }
    assert!(clock.now().as_millis() >= Config::default().grace_window.as_millis());
}

#[test]
fn nothing_valid_never_jumps() {
    let clock = MockClock::default();
    let link = MockLink::new(clock.clone());
    let mut bootloader = Bootloader::new(Config::default(), MockFlash::new(), link, clock.clone());
    assert_eq!(bootloader.step(), Step::Waiting);
    assert_eq!(bootloader.step(), Step::Waiting);
    assert!(bootloader.link().sent.is_empty());
}

#[test]
fn implausible_vectors_are_not_started() {
    let mut flash = MockFlash::new();
    let mut image = app_image(1024, 1, ImageFormat::Raw, 0);
    image[0..4].copy_from_slice(&0xFFFF_FFFFu32.to_le_bytes());
    flash.install(&PartitionSlot::CURRENT, &image, 1);

    let mut flash = FlashProgrammer::new(flash);
    let selector = BootSelector::new(ImageFormat::Raw);
    assert_eq!(selector.validate(&mut flash, SlotId::Current), Err(Error::InvalidApplication));
    assert_eq!(selector.prepare(&mut flash, SlotId::Current), Err(Error::InvalidApplication));
    assert_eq!(selector.select(&mut flash), BootDecision::WaitForUpdate);
}

#[test]
fn request_during_grace_window_starts_update() {
    let clock = MockClock::default();
    let mut link = MockLink::new(clock.clone());
    let image = app_image(900, 5, ImageFormat::Raw, 0);
    link.bytes(b"boot banner\r\n").silence(Duration::from_millis(250)).bytes(&[u8::from(Message::Request)]);
    script_session(&mut link, &image, sum8(&image));

    let mut bootloader = Bootloader::new(Config::default(), MockFlash::new(), link, clock);
    match bootloader.step() {
        Step::Updated(committed) => assert_eq!(committed.flag.size, 900),
        other => panic!("unexpected step {other:?}"),
    }
    assert_eq!(bootloader.link().sent, expected_replies(image.len(), CHECKSUM_OK));
    match bootloader.step() {
        Step::Jump(jump) => assert_eq!(jump.slot, SlotId::Current),
        other => panic!("unexpected step {other:?}"),
    }
}

#[test]
fn vector_table_plausibility() {
    let top = RAM_START + RAM_SIZE;
    let ok = VectorTable {
        sp: top,
        entry: BASE_APP_CURRENT_ADDR + 0x101,
    };
    assert!(ok.is_plausible());
    assert!(!VectorTable { sp: RAM_START, ..ok }.is_plausible());
    assert!(!VectorTable { sp: top + 4, ..ok }.is_plausible());
    assert!(!VectorTable {
        entry: BASE_APP_CURRENT_ADDR + 0x100,
        ..ok
    }
    .is_plausible());
    assert!(!VectorTable {
        entry: BASE_BOOTLOADER_ADDR + 0x101,
        ..ok
    }
    .is_plausible());
    assert!(VectorTable {
        entry: BASE_APP_OLD_ADDR + 0x101,
        ..ok
    }
    .is_plausible());
}

#[test]
fn flag_round_trip_and_corruption() {
    let flag = AppFlag::valid(1234, 5);
    assert!(flag.is_valid());
    let raw = flag.to_bytes();
    assert_eq!(&raw[0..4], &0xABCD_EF00u32.to_le_bytes());
    assert_eq!(AppFlag::from_bytes(&raw).state(), FlagState::Valid(flag));

    let mut corrupted = raw;
    corrupted[8] ^= 1;
    assert!(matches!(AppFlag::from_bytes(&corrupted).state(), FlagState::Invalid(_)));
    assert_eq!(AppFlag::from_bytes(&[0xFF; AppFlag::SIZE]).state(), FlagState::Absent);
}

#[test]
fn write_flag_recomputes_crc() {
    let mut flash = programmer();
    let mut flag = AppFlag::valid(100, 1);
    flag.crc32 = 0;
    flash.write_flag(PartitionSlot::OLD.flag_addr, &flag).unwrap();
    assert!(matches!(flag_of(&mut flash, PartitionSlot::OLD), FlagState::Valid(f) if f.size == 100));
    // Rewriting erases the page first
    flash.write_flag(PartitionSlot::OLD.flag_addr, &AppFlag::valid(200, 2)).unwrap();
    assert!(matches!(flag_of(&mut flash, PartitionSlot::OLD), FlagState::Valid(f) if f.size == 200));
}

#[test]
fn flash_writes_are_word_padded_and_bounded() {
    let mut flash = programmer();
    flash.write_bytes(BASE_APP_CURRENT_ADDR, &[1, 2, 3, 4, 5]).unwrap();
    assert_eq!(flash.inner().bytes(BASE_APP_CURRENT_ADDR, 8), &[1, 2, 3, 4, 5, 0xFF, 0xFF, 0xFF]);

    assert_eq!(
        flash.write_bytes(BASE_APP_CURRENT_ADDR, &[0; 4]),
        Err(FlashError::Write {
            addr: BASE_APP_CURRENT_ADDR
        })
    );
    assert_eq!(
        flash.write_bytes(BASE_APP_CURRENT_ADDR + 2, &[0; 4]),
        Err(FlashError::Unaligned {
            addr: BASE_APP_CURRENT_ADDR + 2
        })
    );
    assert!(matches!(
        flash.write_bytes(BASE_BOOTLOADER_ADDR, &[0; 4]),
        Err(FlashError::OutOfBounds { .. })
    ));
    assert!(matches!(flash.erase_page(BASE_BOOTLOADER_ADDR), Err(FlashError::OutOfBounds { .. })));
    assert!(matches!(
        flash.erase_page(PartitionSlot::OLD.end()),
        Err(FlashError::OutOfBounds { .. })
    ));
}

#[test]
fn erase_range_covers_partial_pages() {
    let mut flash = programmer();
    flash.erase_range(BASE_APP_CURRENT_ADDR, FLASH_PAGE + 1).unwrap();
    assert_eq!(flash.inner().erases, 2);
    flash.erase_range(BASE_APP_CURRENT_ADDR, 0).unwrap();
    assert_eq!(flash.inner().erases, 2);
}

#[test]
fn streamed_link_fault_aborts_update() {
    let mut flash = programmer();
    let clock = MockClock::default();
    let mut link = MockLink::new(clock.clone());
    let image = app_image(2500, 11, ImageFormat::Raw, 0);
    link.bytes(&image[..1200]).push(Event::Fault);

    let config = config(ImageFormat::Raw, TransferMode::Stream);
    let err = serve(&mut flash, &config, &mut link, &clock).unwrap_err();
    assert_eq!(err, Error::TransportError);
    assert_eq!(link.sent, vec![READY]);
    assert_eq!(flag_of(&mut flash, PartitionSlot::CURRENT), FlagState::Absent);
}

/// A broken link ends the grace window early and the valid slot still starts.
#[test]
fn link_fault_while_listening_boots() {
    let mut flash = MockFlash::new();
    flash.install(&PartitionSlot::CURRENT, &app_image(1024, 1, ImageFormat::Raw, 0), 1);

    let clock = MockClock::default();
    let mut link = MockLink::new(clock.clone());
    link.push(Event::Fault).bytes(&[u8::from(Message::Request)]);

    let mut bootloader = Bootloader::new(Config::default(), flash, link, clock.clone());
    match bootloader.step() {
        Step::Jump(jump) => assert_eq!(jump.slot, SlotId::Current),
        other => panic!("unexpected step {other:?}"),
    }
    assert!(!bootloader.link().is_drained());
    assert!(bootloader.link().sent.is_empty());
    assert!(clock.now().as_millis() < Config::default().grace_window.as_millis());
}

struct NoBoot;

impl BootTarget for NoBoot {
    unsafe fn boot(&mut self, vector_table: u32, _vectors: VectorTable) -> ! {
        panic!("jumped to {vector_table:#x}")
    }
}

/// After a committed update the loop waits the reset delay, then resets.
#[test]
fn run_resets_after_update() {
    let clock = MockClock::default();
    let mut link = MockLink::new(clock.clone());
    let image = app_image(900, 5, ImageFormat::Raw, 0);
    link.bytes(&[u8::from(Message::Request)]);
    script_session(&mut link, &image, sum8(&image));
    let bootloader = Bootloader::new(Config::default(), MockFlash::new(), link, clock);

    let mut system = MockSystem::default();
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        bootloader.run(&mut system, &mut NoBoot)
    }));
    let panic = outcome.unwrap_err();
    let message = panic.downcast_ref::<std::string::String>().unwrap();
    assert!(message.starts_with("device reset"), "{message}");
    assert_eq!(system.delays_ms, vec![Config::default().reset_delay_ms]);
}
