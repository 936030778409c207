mod common;

use common::*;
use object::BinaryFormat;
use rstest::rstest;
use rtdyld::{Error, ObjectBuffer, ObjectFormat, RuntimeDyld, SectionMemoryManager};

fn no_symbols(_: &str) -> Option<*const ()> {
    None
}

#[rstest]
fn garbage_is_rejected() {
    init_logger();
    let mut dyld = RuntimeDyld::new(SectionMemoryManager::new(), ());
    let err = dyld
        .load_object(ObjectBuffer::new("garbage.o", b"not an object".to_vec()))
        .unwrap_err();
    assert!(matches!(err, Error::ParseObject { .. }));
    assert!(dyld.has_error());
    assert!(dyld.error_string().contains("garbage.o"));
    assert_eq!(dyld.sections().count(), 0);
}

#[rstest]
fn missing_file_is_an_io_error() {
    let err = ObjectBuffer::from_path("target/this_location_is_definitely_non existent:^~")
        .err()
        .unwrap();
    assert!(matches!(err, Error::Io { .. }));
    assert!(err.to_string().contains("definitely_non"));
}

#[cfg(all(unix, target_arch = "x86_64"))]
#[rstest]
fn add2_runs() {
    init_logger();
    let mut dyld = RuntimeDyld::new(SectionMemoryManager::new(), no_symbols);
    let image = dyld.load_object(elf_x86_64_add2()).unwrap();
    assert_eq!(image.format(), ObjectFormat::Elf);
    dyld.resolve_relocations().unwrap();
    dyld.finalize_memory().unwrap();

    let addr = dyld.get_symbol_load_address("add2").unwrap();
    assert_eq!(
        dyld.get_symbol_address("add2").unwrap().as_ptr() as u64,
        addr
    );
    let add2: extern "C" fn(i32, i32) -> i32 = unsafe { core::mem::transmute(addr as usize) };
    assert_eq!(add2(3, 4), 7);
    assert_eq!(add2(-10, 4), -6);
}

#[rstest]
fn sections_go_through_the_memory_manager() {
    init_logger();
    let (mm, log) = RecordingMemoryManager::new();
    let mut dyld = RuntimeDyld::new(mm, ()).with_process_symbols(false);
    let (buffer, _) = elf_x86_64_linked();
    dyld.load_object(buffer).unwrap();

    let allocations = log.allocations();
    let text = allocations.iter().find(|a| a.name == ".text").unwrap();
    let data = allocations.iter().find(|a| a.name == ".data").unwrap();
    assert!(text.code);
    assert!(!data.code);
    // The stub and the GOT slot live behind the code.
    assert!(text.size >= 16 * 3 + 14 + 8);

    let views: Vec<_> = dyld.sections().collect();
    assert_eq!(views.len(), allocations.len());
    for (view, record) in views.iter().zip(&allocations) {
        assert_eq!(view.id, record.id);
        assert_eq!(view.load_address, view.local.as_ptr() as u64);
    }

    dyld.finalize_memory().unwrap();
    assert_eq!(log.finalizations(), 1);
}

#[rstest]
fn failed_load_keeps_nothing() {
    init_logger();
    let (mm, log) = RecordingMemoryManager::new();
    let mut dyld = RuntimeDyld::new(mm, ());
    dyld.load_object(elf_x86_64_add2()).unwrap();

    let err = dyld.load_object(elf_x86_64_tls_reference()).unwrap_err();
    assert!(err.is_fatal(), "{err}");
    assert!(dyld.error_string().contains("thread-local"));
    // The text section was handed out before the failure but never joined
    // the loaded set.
    assert!(log.allocations().len() > 1);
    assert_eq!(dyld.sections().count(), 1);
    assert!(dyld.get_symbol_load_address("reads_tls").is_none());
    assert!(dyld.get_symbol_load_address("add2").is_some());
}

#[rstest]
#[case::offset_wraps(SH_OFFSET, (u64::MAX - 2).to_le_bytes().to_vec())]
#[case::offset_past_the_end(SH_OFFSET, 0x10_0000u64.to_le_bytes().to_vec())]
#[case::size_wraps(SH_SIZE, (u64::MAX - 4).to_le_bytes().to_vec())]
fn malformed_section_headers_are_rejected(#[case] field: usize, #[case] value: Vec<u8>) {
    init_logger();
    let (mm, log) = RecordingMemoryManager::new();
    let mut dyld = RuntimeDyld::new(mm, ());
    let buffer = patch_section_header(elf_x86_64_add2(), ".text", field, &value);
    let err = dyld.load_object(buffer).unwrap_err();
    assert!(matches!(err, Error::ParseObject { .. }), "{err}");
    assert!(dyld.error_string().contains(".text"));
    // Rejected before any memory was requested.
    assert!(log.allocations().is_empty());
    assert_eq!(dyld.sections().count(), 0);
}

#[rstest]
fn oversized_zero_fill_sections_are_rejected() {
    init_logger();
    let (mm, log) = RecordingMemoryManager::new();
    let mut dyld = RuntimeDyld::new(mm, ());
    let nobits = patch_section_header(
        elf_x86_64_add2(),
        ".text",
        SH_TYPE,
        &object::elf::SHT_NOBITS.to_le_bytes(),
    );
    let buffer = patch_section_header(nobits, ".text", SH_SIZE, &(u64::MAX - 4).to_le_bytes());
    let err = dyld.load_object(buffer).unwrap_err();
    assert!(matches!(err, Error::ParseObject { .. }), "{err}");
    assert!(log.allocations().is_empty());
}

#[rstest]
fn formats_cannot_be_mixed() {
    init_logger();
    let mut dyld = RuntimeDyld::new(SectionMemoryManager::new(), ());
    dyld.load_object(elf_x86_64_add2()).unwrap();
    let err = dyld
        .load_object(x86_64_answer(BinaryFormat::Coff))
        .unwrap_err();
    assert!(matches!(err, Error::ParseObject { .. }));
    let err = dyld.load_object(elf_aarch64_call()).unwrap_err();
    assert!(matches!(err, Error::ParseObject { .. }));
    assert_eq!(dyld.format(), Some(ObjectFormat::Elf));
}

#[rstest]
#[case::macho(BinaryFormat::MachO, ObjectFormat::MachO, "_answer", "_answer_ptr")]
#[case::coff(BinaryFormat::Coff, ObjectFormat::Coff, "answer", "answer_ptr")]
fn other_formats_link_data(
    #[case] format: BinaryFormat,
    #[case] expected: ObjectFormat,
    #[case] function: &str,
    #[case] pointer: &str,
) {
    init_logger();
    let mut dyld = RuntimeDyld::new(SectionMemoryManager::new(), ()).with_process_symbols(false);
    let image = dyld.load_object(x86_64_answer(format)).unwrap();
    assert_eq!(image.format(), expected);
    dyld.resolve_relocations().unwrap();

    let answer = dyld.get_symbol_load_address(function).unwrap();
    let slot = dyld.get_symbol_address(pointer).unwrap();
    let stored = unsafe { slot.cast::<u64>().as_ptr().read_unaligned() };
    assert_eq!(stored, answer);

    let code = dyld.get_symbol_address(function).unwrap();
    let code = unsafe { core::slice::from_raw_parts(code.as_ptr(), 6) };
    assert_eq!(code, [0xb8, 0x2a, 0, 0, 0, 0xc3]);
}

#[cfg(all(unix, target_arch = "x86_64"))]
#[rstest]
fn eh_frames_are_registered_once() {
    init_logger();
    let (mm, log) = RecordingMemoryManager::new();
    let mut dyld = RuntimeDyld::new(mm, ());
    dyld.load_object(elf_x86_64_add2()).unwrap();
    dyld.register_eh_frames().unwrap();
    let first = log.eh_frames.load(std::sync::atomic::Ordering::SeqCst);
    dyld.register_eh_frames().unwrap();
    assert_eq!(
        log.eh_frames.load(std::sync::atomic::Ordering::SeqCst),
        first
    );
    assert_eq!(dyld.eh_frame_section().is_some(), first > 0);
}
