#![allow(dead_code)]

use object::write::{Object, Relocation, StandardSection, Symbol, SymbolId, SymbolSection};
use object::{
    Architecture, BinaryFormat, Endianness, RelocationFlags, SymbolFlags, SymbolKind, SymbolScope,
};
use rtdyld::{
    MemoryManager, ObjectBuffer, RuntimeDyld, SectionId, SectionMemoryManager,
    codegen::{CodeGenerator, OptLevel, X86_64CodeGen},
    engine::{JitEventListener, ObjectCache},
    ir::Module,
};
use std::{
    ptr::NonNull,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn defined(obj: &mut Object<'static>, name: &str, kind: SymbolKind) -> SymbolId {
    obj.add_symbol(Symbol {
        name: name.as_bytes().to_vec(),
        value: 0,
        size: 0,
        kind,
        scope: SymbolScope::Linkage,
        weak: false,
        section: SymbolSection::Undefined,
        flags: SymbolFlags::None,
    })
}

fn external(obj: &mut Object<'static>, name: &str) -> SymbolId {
    obj.add_symbol(Symbol {
        name: name.as_bytes().to_vec(),
        value: 0,
        size: 0,
        kind: SymbolKind::Unknown,
        scope: SymbolScope::Unknown,
        weak: false,
        section: SymbolSection::Undefined,
        flags: SymbolFlags::None,
    })
}

fn elf_reloc(offset: u64, symbol: SymbolId, addend: i64, r_type: u32) -> Relocation {
    Relocation {
        offset,
        symbol,
        addend,
        flags: RelocationFlags::Elf { r_type },
    }
}

fn finish(obj: Object<'static>, name: &str) -> ObjectBuffer {
    ObjectBuffer::new(name, obj.write().unwrap())
}

/// `add2(a, b) = a + b` for the x86_64 System V ABI.
pub fn elf_x86_64_add2() -> ObjectBuffer {
    let mut obj = Object::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little);
    let text = obj.section_id(StandardSection::Text);
    let add2 = defined(&mut obj, "add2", SymbolKind::Text);
    // lea eax, [rdi + rsi]; ret
    obj.add_symbol_data(add2, text, &[0x8d, 0x04, 0x37, 0xc3], 16);
    finish(obj, "add2.o")
}

/// Field offsets inside an `Elf64_Shdr`.
pub const SH_TYPE: usize = 0x04;
pub const SH_OFFSET: usize = 0x18;
pub const SH_SIZE: usize = 0x20;

/// Overwrites one field of the named section's header in a little-endian
/// ELF64 object.
pub fn patch_section_header(buffer: ObjectBuffer, section: &str, field: usize, value: &[u8]) -> ObjectBuffer {
    use object::{Object as _, ObjectSection as _};

    let name = buffer.name().to_owned();
    let mut bytes = buffer.into_bytes();
    let index = {
        let file = object::File::parse(&*bytes).unwrap();
        file.section_by_name(section).unwrap().index().0
    };
    let shoff = u64::from_le_bytes(bytes[0x28..0x30].try_into().unwrap()) as usize;
    let shentsize = u16::from_le_bytes(bytes[0x3a..0x3c].try_into().unwrap()) as usize;
    let at = shoff + index * shentsize + field;
    bytes[at..at + value.len()].copy_from_slice(value);
    ObjectBuffer::new(name, bytes)
}

/// Offsets into the text section of [`elf_x86_64_linked`].
pub struct LinkedLayout {
    pub read_counter: u64,
    pub call_host: u64,
    pub host_data_addr: u64,
}

/// An object exercising each kind of x86_64 reference:
///
/// * `read_counter()` loads `counter` through a PC32 relocation,
/// * `call_host(x)` tail-calls the external `host_triple` (PLT32, via a stub),
/// * `host_data_addr()` loads the address of the external `host_data`
///   from a GOT slot (GOTPCREL),
/// * `counter_ptr` is a data word holding `&counter` (R_X86_64_64).
pub fn elf_x86_64_linked() -> (ObjectBuffer, LinkedLayout) {
    use object::elf::{R_X86_64_64, R_X86_64_GOTPCREL, R_X86_64_PC32, R_X86_64_PLT32};

    let mut obj = Object::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little);
    let text = obj.section_id(StandardSection::Text);
    let data = obj.section_id(StandardSection::Data);

    let counter = defined(&mut obj, "counter", SymbolKind::Data);
    obj.add_symbol_data(counter, data, &41u32.to_le_bytes(), 8);
    let counter_ptr = defined(&mut obj, "counter_ptr", SymbolKind::Data);
    let ptr_offset = obj.add_symbol_data(counter_ptr, data, &[0; 8], 8);
    obj.add_relocation(data, elf_reloc(ptr_offset, counter, 0, R_X86_64_64))
        .unwrap();

    let host_triple = external(&mut obj, "host_triple");
    let host_data = external(&mut obj, "host_data");

    let read_counter = defined(&mut obj, "read_counter", SymbolKind::Text);
    // mov eax, [rip + counter]; ret
    let read_offset = obj.add_symbol_data(
        read_counter,
        text,
        &[0x8b, 0x05, 0, 0, 0, 0, 0xc3],
        16,
    );
    obj.add_relocation(text, elf_reloc(read_offset + 2, counter, -4, R_X86_64_PC32))
        .unwrap();

    let call_host = defined(&mut obj, "call_host", SymbolKind::Text);
    // jmp host_triple
    let call_offset = obj.add_symbol_data(call_host, text, &[0xe9, 0, 0, 0, 0], 16);
    obj.add_relocation(
        text,
        elf_reloc(call_offset + 1, host_triple, -4, R_X86_64_PLT32),
    )
    .unwrap();

    let host_data_addr = defined(&mut obj, "host_data_addr", SymbolKind::Text);
    // mov rax, [rip + host_data@GOTPCREL]; ret
    let got_offset = obj.add_symbol_data(
        host_data_addr,
        text,
        &[0x48, 0x8b, 0x05, 0, 0, 0, 0, 0xc3],
        16,
    );
    obj.add_relocation(
        text,
        elf_reloc(got_offset + 3, host_data, -4, R_X86_64_GOTPCREL),
    )
    .unwrap();

    (
        finish(obj, "linked.o"),
        LinkedLayout {
            read_counter: read_offset,
            call_host: call_offset,
            host_data_addr: got_offset,
        },
    )
}

/// A tail call to a symbol nobody defines.
pub fn elf_x86_64_missing_symbol() -> ObjectBuffer {
    let mut obj = Object::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little);
    let text = obj.section_id(StandardSection::Text);
    let missing = external(&mut obj, "definitely_missing_symbol");
    let f = defined(&mut obj, "calls_missing", SymbolKind::Text);
    let offset = obj.add_symbol_data(f, text, &[0xe9, 0, 0, 0, 0], 16);
    obj.add_relocation(
        text,
        elf_reloc(offset + 1, missing, -4, object::elf::R_X86_64_PLT32),
    )
    .unwrap();
    finish(obj, "missing.o")
}

/// A relocation kind the loader does not implement.
pub fn elf_x86_64_unsupported_relocation() -> ObjectBuffer {
    let mut obj = Object::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little);
    let text = obj.section_id(StandardSection::Text);
    let target = external(&mut obj, "tls_var");
    let f = defined(&mut obj, "uses_tls", SymbolKind::Text);
    // mov eax, fs:[tls_var@TPOFF]; ret
    let offset = obj.add_symbol_data(
        f,
        text,
        &[0x64, 0x8b, 0x04, 0x25, 0, 0, 0, 0, 0xc3],
        16,
    );
    obj.add_relocation(
        text,
        elf_reloc(offset + 4, target, 0, object::elf::R_X86_64_TPOFF32),
    )
    .unwrap();
    finish(obj, "unsupported.o")
}

/// Code referring to a thread-local section, which fails only after the
/// object's sections have been allocated.
pub fn elf_x86_64_tls_reference() -> ObjectBuffer {
    let mut obj = Object::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little);
    let text = obj.section_id(StandardSection::Text);
    let tdata = obj.section_id(StandardSection::Tls);
    let var = defined(&mut obj, "tls_counter", SymbolKind::Tls);
    obj.add_symbol_data(var, tdata, &7u32.to_le_bytes(), 4);
    let f = defined(&mut obj, "reads_tls", SymbolKind::Text);
    let offset = obj.add_symbol_data(f, text, &[0x8b, 0x05, 0, 0, 0, 0, 0xc3], 16);
    obj.add_relocation(
        text,
        elf_reloc(offset + 2, var, -4, object::elf::R_X86_64_PC32),
    )
    .unwrap();
    finish(obj, "tls.o")
}

/// A data word holding the address of an undefined weak symbol.
pub fn elf_x86_64_weak_reference() -> ObjectBuffer {
    let mut obj = Object::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little);
    let data = obj.section_id(StandardSection::Data);
    let weak = obj.add_symbol(Symbol {
        name: b"optional_hook".to_vec(),
        value: 0,
        size: 0,
        kind: SymbolKind::Unknown,
        scope: SymbolScope::Unknown,
        weak: true,
        section: SymbolSection::Undefined,
        flags: SymbolFlags::None,
    });
    let slot = defined(&mut obj, "hook_slot", SymbolKind::Data);
    let offset = obj.add_symbol_data(slot, data, &[0xff; 8], 8);
    obj.add_relocation(
        data,
        elf_reloc(offset, weak, 0, object::elf::R_X86_64_64),
    )
    .unwrap();
    finish(obj, "weak.o")
}

/// `call_far: bl far_away; ret` for AArch64.
pub fn elf_aarch64_call() -> ObjectBuffer {
    let mut obj = Object::new(BinaryFormat::Elf, Architecture::Aarch64, Endianness::Little);
    let text = obj.section_id(StandardSection::Text);
    let far = external(&mut obj, "far_away");
    let f = defined(&mut obj, "call_far", SymbolKind::Text);
    let mut code = Vec::new();
    code.extend_from_slice(&0x9400_0000u32.to_le_bytes());
    code.extend_from_slice(&0xd65f_03c0u32.to_le_bytes());
    let offset = obj.add_symbol_data(f, text, &code, 16);
    obj.add_relocation(
        text,
        elf_reloc(offset, far, 0, object::elf::R_AARCH64_CALL26),
    )
    .unwrap();
    finish(obj, "call_far.o")
}

/// An i386 data word holding `&entry + 8`, with the addend stored in place.
pub fn elf_i386_data() -> ObjectBuffer {
    let mut obj = Object::new(BinaryFormat::Elf, Architecture::I386, Endianness::Little);
    let text = obj.section_id(StandardSection::Text);
    let data = obj.section_id(StandardSection::Data);
    let entry = defined(&mut obj, "entry", SymbolKind::Text);
    obj.add_symbol_data(entry, text, &[0x90; 16], 16);
    let word = defined(&mut obj, "entry_plus_8", SymbolKind::Data);
    let offset = obj.add_symbol_data(word, data, &8u32.to_le_bytes(), 4);
    obj.add_relocation(data, elf_reloc(offset, entry, 8, object::elf::R_386_32))
        .unwrap();
    finish(obj, "i386.o")
}

/// `answer() = 42` and a data word `answer_ptr` holding its address, as a
/// Mach-O or COFF x86_64 object.
pub fn x86_64_answer(format: BinaryFormat) -> ObjectBuffer {
    let mut obj = Object::new(format, Architecture::X86_64, Endianness::Little);
    let text = obj.section_id(StandardSection::Text);
    let data = obj.section_id(StandardSection::Data);
    let answer = defined(&mut obj, "answer", SymbolKind::Text);
    // mov eax, 42; ret
    obj.add_symbol_data(answer, text, &[0xb8, 0x2a, 0, 0, 0, 0xc3], 16);
    let answer_ptr = defined(&mut obj, "answer_ptr", SymbolKind::Data);
    let offset = obj.add_symbol_data(answer_ptr, data, &[0; 8], 8);
    let flags = match format {
        BinaryFormat::MachO => RelocationFlags::MachO {
            r_type: object::macho::X86_64_RELOC_UNSIGNED,
            r_pcrel: false,
            r_length: 3,
        },
        _ => RelocationFlags::Coff {
            typ: object::pe::IMAGE_REL_AMD64_ADDR64,
        },
    };
    obj.add_relocation(
        data,
        Relocation {
            offset,
            symbol: answer,
            addend: 0,
            flags,
        },
    )
    .unwrap();
    finish(obj, "answer.o")
}

pub const FAKE_HOST_TRIPLE: u64 = 0x7654_3210_0000;
pub const FAKE_HOST_DATA: u64 = 0x7654_3210_1000;

/// Stands in for the host's `host_triple` and `host_data` when the linked
/// code is inspected but never run.
pub fn fake_host(name: &str) -> Option<*const ()> {
    match name {
        "host_triple" => Some(FAKE_HOST_TRIPLE as *const ()),
        "host_data" => Some(FAKE_HOST_DATA as *const ()),
        _ => None,
    }
}

/// Checks every patch site of [`elf_x86_64_linked`]'s text section against
/// the section's current target address.
pub fn assert_linked_text(dyld: &RuntimeDyld, layout: &LinkedLayout) {
    let text = dyld.sections().find(|s| s.name == ".text").unwrap();
    let bytes = text.bytes();
    let base = text.load_address as i64;
    let target_of = |site: usize| site as i64 + 4 + read_u32(bytes, site) as i32 as i64;

    assert_eq!(
        dyld.get_symbol_load_address("read_counter"),
        Some(text.load_address + layout.read_counter)
    );
    let counter = dyld.get_symbol_load_address("counter").unwrap();
    assert_eq!(base + target_of(layout.read_counter as usize + 2), counter as i64);

    let stub = target_of(layout.call_host as usize + 1) as usize;
    assert!(stub > layout.host_data_addr as usize && stub + 14 <= bytes.len());
    assert_eq!(&bytes[stub..stub + 2], &[0xff, 0x25]);
    assert_eq!(read_u64(bytes, stub + 6), FAKE_HOST_TRIPLE);

    let slot = target_of(layout.host_data_addr as usize + 3) as usize;
    assert!(slot > layout.host_data_addr as usize && slot + 8 <= bytes.len());
    assert_eq!(read_u64(bytes, slot), FAKE_HOST_DATA);
}

/// One allocation request seen by [`RecordingMemoryManager`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AllocationRecord {
    pub id: SectionId,
    pub name: String,
    pub size: usize,
    pub code: bool,
}

/// What a [`RecordingMemoryManager`] saw, shared with the test.
#[derive(Default)]
pub struct MemoryLog {
    pub allocations: Mutex<Vec<AllocationRecord>>,
    pub finalizations: AtomicUsize,
    pub eh_frames: AtomicUsize,
}

impl MemoryLog {
    pub fn allocations(&self) -> Vec<AllocationRecord> {
        self.allocations.lock().unwrap().clone()
    }

    pub fn finalizations(&self) -> usize {
        self.finalizations.load(Ordering::SeqCst)
    }
}

/// Forwards to a [`SectionMemoryManager`] and records every request.
pub struct RecordingMemoryManager {
    inner: SectionMemoryManager,
    log: Arc<MemoryLog>,
}

impl RecordingMemoryManager {
    pub fn new() -> (Self, Arc<MemoryLog>) {
        let log = Arc::new(MemoryLog::default());
        (
            Self {
                inner: SectionMemoryManager::new(),
                log: log.clone(),
            },
            log,
        )
    }

    fn record(&self, id: SectionId, name: &str, size: usize, code: bool) {
        self.log.allocations.lock().unwrap().push(AllocationRecord {
            id,
            name: name.to_owned(),
            size,
            code,
        });
    }
}

impl MemoryManager for RecordingMemoryManager {
    fn allocate_code_section(
        &mut self,
        size: usize,
        alignment: usize,
        section_id: SectionId,
        section_name: &str,
    ) -> rtdyld::Result<NonNull<u8>> {
        self.record(section_id, section_name, size, true);
        self.inner
            .allocate_code_section(size, alignment, section_id, section_name)
    }

    fn allocate_data_section(
        &mut self,
        size: usize,
        alignment: usize,
        section_id: SectionId,
        section_name: &str,
        read_only: bool,
    ) -> rtdyld::Result<NonNull<u8>> {
        self.record(section_id, section_name, size, false);
        self.inner
            .allocate_data_section(size, alignment, section_id, section_name, read_only)
    }

    fn finalize_memory(&mut self) -> rtdyld::Result<()> {
        self.log.finalizations.fetch_add(1, Ordering::SeqCst);
        self.inner.finalize_memory()
    }

    fn register_eh_frames(&mut self, addr: NonNull<u8>, load_addr: u64, size: usize) {
        self.log.eh_frames.fetch_add(1, Ordering::SeqCst);
        self.inner.register_eh_frames(addr, load_addr, size)
    }
}

/// The host code generator, counting how often it runs.
pub struct CountingCodeGen {
    inner: X86_64CodeGen,
    runs: Arc<AtomicUsize>,
}

impl CountingCodeGen {
    pub fn new() -> (Self, Arc<AtomicUsize>) {
        let runs = Arc::new(AtomicUsize::new(0));
        (
            Self {
                inner: X86_64CodeGen::new(),
                runs: runs.clone(),
            },
            runs,
        )
    }
}

impl CodeGenerator for CountingCodeGen {
    fn target_triple(&self) -> &str {
        self.inner.target_triple()
    }

    fn emit_object(&self, module: &Module, opt_level: OptLevel) -> rtdyld::Result<Vec<u8>> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.inner.emit_object(module, opt_level)
    }
}

/// An object cache whose every operation fails.
pub struct BrokenCache;

impl ObjectCache for BrokenCache {
    fn get_object(&self, module_id: &str) -> rtdyld::Result<Option<Vec<u8>>> {
        Err(rtdyld::custom_error(format!("cache for [{module_id}] is offline")))
    }

    fn notify_object_compiled(&self, module_id: &str, _object: &[u8]) -> rtdyld::Result<()> {
        Err(rtdyld::custom_error(format!("cache for [{module_id}] is offline")))
    }
}

/// Counts emitted objects and remembers their names.
#[derive(Default)]
pub struct RecordingListener {
    pub names: Mutex<Vec<String>>,
}

impl RecordingListener {
    pub fn names(&self) -> Vec<String> {
        self.names.lock().unwrap().clone()
    }
}

impl JitEventListener for RecordingListener {
    fn notify_object_emitted(&self, object: &rtdyld::ObjectImage, dyld: &rtdyld::RuntimeDyld) {
        assert!(dyld.sections().count() > 0);
        self.names.lock().unwrap().push(object.name().to_owned());
    }
}

/// Reads a little-endian word out of a loaded section.
pub fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap())
}

pub fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(bytes[offset..offset + 8].try_into().unwrap())
}
