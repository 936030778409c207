#![cfg(all(unix, target_arch = "x86_64"))]

mod common;

use common::*;
use rstest::rstest;
use rtdyld::{
    EngineBuilder, EngineKind, EngineRegistry, Error, ExecutionEngine, GenericValue,
    engine::{EngineOptions, Jit, MemoryObjectCache, ModuleState, ObjectCache},
    ir::{Module, parse_module},
};
use std::sync::{Arc, atomic::Ordering};

const FIB: &str = r#"
define i32 @fib(i32 %n) {
entry:
  %small = icmp slt i32 %n, 2
  br i1 %small, label %done, label %recurse
recurse:
  %n1 = sub i32 %n, 1
  %a = call i32 @fib(i32 %n1)
  %n2 = sub i32 %n, 2
  %b = call i32 @fib(i32 %n2)
  %sum = add i32 %a, %b
  ret i32 %sum
done:
  ret i32 %n
}
"#;

const COUNTER: &str = r#"
@counter = global i32 5

define i32 @bump(i32 %by) {
entry:
  %old = load i32, ptr @counter
  %new = add i32 %old, %by
  store i32 %new, ptr @counter
  ret i32 %new
}

define i64 @sum_to(i64 %n) {
entry:
  br label %loop
loop:
  %i = phi i64 [ 0, %entry ], [ %next, %loop ]
  %acc = phi i64 [ 0, %entry ], [ %acc.next, %loop ]
  %acc.next = add i64 %acc, %i
  %next = add i64 %i, 1
  %done = icmp sgt i64 %next, %n
  br i1 %done, label %exit, label %loop
exit:
  ret i64 %acc.next
}
"#;

const HOST_CALL: &str = r#"
declare i32 @host_twice(i32)

define i32 @twice_plus_one(i32 %x) {
entry:
  %t = call i32 @host_twice(i32 %x)
  %r = add i32 %t, 1
  ret i32 %r
}
"#;

const MAIN: &str = r#"
define i32 @main(i32 %argc, ptr %argv) {
entry:
  %slot = getelementptr ptr, ptr %argv, i64 1
  %arg = load ptr, ptr %slot
  %c = load i8, ptr %arg
  %wide = zext i8 %c to i32
  %r = add i32 %wide, %argc
  ret i32 %r
}
"#;

extern "C" fn host_twice(x: i32) -> i32 {
    x * 2
}

fn module(src: &str, id: &str) -> Module {
    parse_module(src, id).unwrap()
}

fn jit(src: &str, id: &str) -> Box<dyn ExecutionEngine> {
    init_logger();
    EngineBuilder::new(module(src, id))
        .with_kind(EngineKind::Jit)
        .build(&EngineRegistry::with_defaults())
        .unwrap()
}

#[rstest]
#[case(0, 0)]
#[case(1, 1)]
#[case(10, 55)]
#[case(20, 6765)]
fn recursion(#[case] n: i32, #[case] expected: i32) {
    let mut engine = jit(FIB, "fib");
    assert_eq!(engine.kind(), EngineKind::Jit);
    let ret = engine.run_function("fib", &[n.into()]).unwrap();
    assert_eq!(ret.as_i64(), Some(expected as i64));
}

#[rstest]
fn globals_and_loops() {
    let mut engine = jit(COUNTER, "counter");
    assert_eq!(engine.run_function("bump", &[3.into()]).unwrap().as_i64(), Some(8));
    assert_eq!(engine.run_function("bump", &[(-10).into()]).unwrap().as_i64(), Some(-2));
    let addr = engine.get_global_value_address("counter").unwrap();
    assert_eq!(unsafe { *(addr as *const i32) }, -2);

    let ret = engine.run_function("sum_to", &[100i64.into()]).unwrap();
    assert_eq!(ret.as_i64(), Some(5050));
}

#[rstest]
fn function_pointers_are_callable() {
    let mut engine = jit(FIB, "fib");
    engine.finalize_object().unwrap();
    let addr = engine.get_pointer_to_function("fib").unwrap();
    let fib: extern "C" fn(i32) -> i32 = unsafe { core::mem::transmute(addr as usize) };
    assert_eq!(fib(12), 144);
}

#[rstest]
fn externals_come_from_the_symbol_lookup() {
    init_logger();
    let lookup = |name: &str| (name == "host_twice").then_some(host_twice as *const ());
    let mut engine = EngineBuilder::new(module(HOST_CALL, "host_call"))
        .with_kind(EngineKind::Jit)
        .with_symbol_lookup(lookup)
        .build(&EngineRegistry::with_defaults())
        .unwrap();
    let ret = engine.run_function("twice_plus_one", &[20.into()]).unwrap();
    assert_eq!(ret.as_i64(), Some(41));
}

#[rstest]
fn missing_externals_fail_every_time() {
    let mut engine = jit(HOST_CALL, "no_host");
    for _ in 0..2 {
        match engine.run_function("twice_plus_one", &[1.into()]) {
            Err(Error::UnresolvedSymbol { name }) => assert_eq!(name, "host_twice"),
            other => panic!("unexpected {other:?}"),
        }
    }
}

#[rstest]
fn arguments_are_checked() {
    let mut engine = jit(FIB, "fib");
    let err = engine
        .run_function("fib", &[GenericValue::from(1i64)])
        .unwrap_err();
    assert!(matches!(err, Error::EntryPoint { .. }));
    let err = engine.run_function("fib", &[]).unwrap_err();
    assert!(matches!(err, Error::EntryPoint { .. }));
    let err = engine.run_function("fob", &[1.into()]).unwrap_err();
    assert!(matches!(err, Error::EntryPoint { .. }));
}

#[rstest]
fn runs_as_main() {
    let mut engine = jit(MAIN, "main");
    let code = engine
        .run_function_as_main("main", &["prog", "A", "b"], &["HOME=/"])
        .unwrap();
    assert_eq!(code, 'A' as i32 + 3);
}

#[rstest]
fn unsupported_instructions_fail_codegen() {
    let src = "define double @half(double %x) {\nentry:\n  %r = fmul double %x, 0.5\n  ret double %r\n}\n";
    let mut engine = jit(src, "half");
    let err = engine.run_function("half", &[1.0f64.into()]).unwrap_err();
    assert!(matches!(err, Error::Codegen { .. }));
}

#[rstest]
fn module_states_advance() {
    init_logger();
    let mut jit = Jit::new(module(FIB, "fib"), EngineOptions::default()).unwrap();
    assert!(matches!(jit.state(), ModuleState::Uncompiled));
    let addr = jit.get_pointer_to_function("fib").unwrap();
    assert!(matches!(jit.state(), ModuleState::Loaded));
    jit.finalize_object().unwrap();
    assert!(matches!(jit.state(), ModuleState::Finalized));
    assert_eq!(jit.get_pointer_to_function("fib").unwrap(), addr);
    assert_eq!(jit.objects().len(), 1);

    let err = jit.add_object_file(elf_x86_64_add2()).unwrap_err();
    assert!(matches!(err, Error::Relocation { .. }));
}

#[rstest]
fn ir_functions_take_marshalled_arguments() {
    let src = r#"
define i32 @add2(i32 %a, i32 %b) {
entry:
  %s = add i32 %a, %b
  ret i32 %s
}
"#;
    let mut engine = jit(src, "add2_ir");
    let ret = engine.run_function("add2", &[3.into(), 4.into()]).unwrap();
    assert_eq!(ret.as_i64(), Some(7));
}

#[rstest]
fn loaded_sections_are_repatched_when_moved() {
    init_logger();
    let options = EngineOptions {
        symbol_lookup: Some(Arc::new(fake_host)),
        ..EngineOptions::default()
    };
    let mut jit = Jit::new(module(FIB, "fib"), options).unwrap();
    let (linked, layout) = elf_x86_64_linked();
    jit.add_object_file(linked).unwrap();
    jit.get_pointer_to_function("fib").unwrap();
    assert!(matches!(jit.state(), ModuleState::Loaded));
    assert_linked_text(jit.dyld(), &layout);

    let data = jit.dyld().sections().find(|s| s.name == ".data").unwrap();
    let (local, load) = (data.local.as_ptr(), data.load_address);
    let slot = jit.dyld().get_symbol_address("counter_ptr").unwrap();
    let stored = || unsafe { slot.cast::<u64>().as_ptr().read_unaligned() };
    let counter = jit.dyld().get_symbol_load_address("counter").unwrap();
    assert_eq!(stored(), counter);

    // No explicit resolution step: the word follows the move at once.
    jit.map_section_address(local, load + 0x1000).unwrap();
    assert_eq!(stored(), counter + 0x1000);
    jit.map_section_address(local, load).unwrap();
    assert_eq!(stored(), counter);

    // Moving code re-patches the sites inside it, its stubs and GOT slots.
    let text = jit.dyld().sections().find(|s| s.name == ".text").unwrap();
    let (text_local, text_load) = (text.local.as_ptr(), text.load_address);
    jit.map_section_address(text_local, text_load + 0x20_0000).unwrap();
    assert_eq!(
        jit.dyld().get_symbol_load_address("read_counter"),
        Some(text_load + 0x20_0000 + layout.read_counter)
    );
    assert_linked_text(jit.dyld(), &layout);
    jit.map_section_address(text_local, text_load).unwrap();
    assert_linked_text(jit.dyld(), &layout);

    jit.finalize_object().unwrap();
    let err = jit.map_section_address(local, load + 0x1000).unwrap_err();
    assert!(matches!(err, Error::Relocation { .. }));
}

#[rstest]
fn precompiled_objects_link_with_the_module() {
    init_logger();
    let src = r#"
declare i32 @add2(i32, i32)

define i32 @add_three(i32 %a, i32 %b, i32 %c) {
entry:
  %ab = call i32 @add2(i32 %a, i32 %b)
  %abc = call i32 @add2(i32 %ab, i32 %c)
  ret i32 %abc
}
"#;
    let mut engine = jit(src, "add_three");
    engine.add_object_file(elf_x86_64_add2()).unwrap();
    let ret = engine
        .run_function("add_three", &[1.into(), 2.into(), 3.into()])
        .unwrap();
    assert_eq!(ret.as_i64(), Some(6));
}

#[rstest]
fn listeners_see_every_object() {
    init_logger();
    let listener = Arc::new(RecordingListener::default());
    let mut engine = EngineBuilder::new(module(FIB, "fib"))
        .with_kind(EngineKind::Jit)
        .with_listener(listener.clone())
        .build(&EngineRegistry::with_defaults())
        .unwrap();
    engine.add_object_file(elf_x86_64_add2()).unwrap();
    assert_eq!(listener.names(), ["add2.o"]);
    engine.run_function("fib", &[5.into()]).unwrap();
    assert_eq!(listener.names(), ["add2.o", "fib.o"]);
}

#[rstest]
fn cache_hits_skip_code_generation() {
    init_logger();
    let cache = Arc::new(MemoryObjectCache::new());

    let (generator, runs) = CountingCodeGen::new();
    let mut first = EngineBuilder::new(module(FIB, "fib"))
        .with_code_generator(generator)
        .with_object_cache(cache.clone())
        .build(&EngineRegistry::with_defaults())
        .unwrap();
    assert_eq!(first.run_function("fib", &[10.into()]).unwrap().as_i64(), Some(55));
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(cache.inserts(), 1);
    assert!(cache.contains("fib"));

    let (generator, runs) = CountingCodeGen::new();
    let listener = Arc::new(RecordingListener::default());
    let mut second = EngineBuilder::new(module(FIB, "fib"))
        .with_code_generator(generator)
        .with_object_cache(cache.clone())
        .with_listener(listener.clone())
        .build(&EngineRegistry::with_defaults())
        .unwrap();
    assert_eq!(second.run_function("fib", &[11.into()]).unwrap().as_i64(), Some(89));
    assert_eq!(runs.load(Ordering::SeqCst), 0);
    // A hit is not a fresh compilation.
    assert_eq!(cache.inserts(), 1);
    assert_eq!(cache.lookups(), 2);
    assert_eq!(listener.names(), ["fib.o"]);
}

#[rstest]
fn preloaded_cache_entries_are_used() {
    init_logger();
    let cache = Arc::new(MemoryObjectCache::new());
    cache
        .preload("fib", elf_x86_64_add2().into_bytes())
        .unwrap();
    let (generator, runs) = CountingCodeGen::new();
    let mut jit = Jit::new(module(FIB, "fib"), EngineOptions {
        object_cache: Some(cache.clone()),
        code_generator: Some(Box::new(generator)),
        ..Default::default()
    })
    .unwrap();
    // Whatever the cache returns is what gets loaded.
    jit.finalize_object().unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 0);
    assert!(jit.dyld().get_symbol_load_address("add2").is_some());
    assert!(jit.get_pointer_to_function("fib").is_err());
}

#[rstest]
fn broken_caches_are_misses() {
    init_logger();
    let (generator, runs) = CountingCodeGen::new();
    let mut engine = EngineBuilder::new(module(FIB, "fib"))
        .with_code_generator(generator)
        .with_object_cache(Arc::new(BrokenCache))
        .build(&EngineRegistry::with_defaults())
        .unwrap();
    assert_eq!(engine.run_function("fib", &[7.into()]).unwrap().as_i64(), Some(13));
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[rstest]
fn file_cache_round_trips_objects() {
    init_logger();
    let dir = std::env::temp_dir().join(format!("rtdyld-cache-{}", std::process::id()));
    let cache = Arc::new(rtdyld::engine::FileObjectCache::new(&dir).unwrap());
    assert!(cache.get_object("fib").unwrap().is_none());

    let mut engine = EngineBuilder::new(module(FIB, "fib"))
        .with_object_cache(cache.clone())
        .build(&EngineRegistry::with_defaults())
        .unwrap();
    engine.run_function("fib", &[3.into()]).unwrap();
    assert!(cache.path_for("fib").exists());

    let (generator, runs) = CountingCodeGen::new();
    let mut engine = EngineBuilder::new(module(FIB, "fib"))
        .with_code_generator(generator)
        .with_object_cache(cache.clone())
        .build(&EngineRegistry::with_defaults())
        .unwrap();
    assert_eq!(engine.run_function("fib", &[9.into()]).unwrap().as_i64(), Some(34));
    assert_eq!(runs.load(Ordering::SeqCst), 0);
    let _ = std::fs::remove_dir_all(dir);
}

#[rstest]
fn remote_mapping_runs_from_the_copy() {
    init_logger();
    let mut jit = Jit::new(module(COUNTER, "counter"), EngineOptions {
        remote_mapping: true,
        ..Default::default()
    })
    .unwrap();
    let ret = jit.run_function("sum_to", &[10i64.into()]).unwrap();
    assert_eq!(ret.as_i64(), Some(55));
    assert_eq!(jit.run_function("bump", &[1.into()]).unwrap().as_i64(), Some(6));

    let entry = jit.get_pointer_to_function("sum_to").unwrap();
    let counter = jit.get_global_value_address("counter").unwrap();
    let remote = jit.remote().unwrap();
    assert!(remote.contains(entry));
    for section in jit.dyld().sections() {
        assert_ne!(section.load_address, section.local.as_ptr() as u64);
        assert_eq!(remote.target_of(section.id), Some(section.load_address));
    }
    // The counter the code updated lives in the remote copy.
    assert!(remote.contains(counter));
    assert_eq!(unsafe { *(counter as *const i32) }, 6);
}
