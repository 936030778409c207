use criterion::{Criterion, criterion_group, criterion_main};
use rtdyld::{
    ExecutionEngine, GenericValue, ObjectBuffer, RuntimeDyld, SectionMemoryManager,
    codegen::{CodeGenerator, OptLevel, X86_64CodeGen},
    engine::EngineOptions,
    interpreter::Interpreter,
    ir::parse_module,
};

const FIB: &str = r#"
@calls = global i64 0

define i32 @fib(i32 %n) {
entry:
  %old = load i64, ptr @calls
  %new = add i64 %old, 1
  store i64 %new, ptr @calls
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

fn fib_object() -> Vec<u8> {
    let module = parse_module(FIB, "fib").unwrap();
    X86_64CodeGen::new()
        .emit_object(&module, OptLevel::Default)
        .unwrap()
}

fn load_benchmark(c: &mut Criterion) {
    let bytes = fib_object();
    c.bench_function("rtdyld:load", |b| {
        b.iter(|| {
            let mut dyld = RuntimeDyld::new(SectionMemoryManager::new(), ());
            dyld.load_object(ObjectBuffer::new("fib.o", bytes.clone()))
                .unwrap();
            dyld.resolve_relocations().unwrap();
            dyld.finalize_memory().unwrap();
        });
    });
    c.bench_function("rtdyld:resolve", |b| {
        let mut dyld = RuntimeDyld::new(SectionMemoryManager::new(), ());
        dyld.load_object(ObjectBuffer::new("fib.o", bytes.clone()))
            .unwrap();
        b.iter(|| dyld.resolve_relocations().unwrap());
    });
}

fn get_symbol_benchmark(c: &mut Criterion) {
    let mut dyld = RuntimeDyld::new(SectionMemoryManager::new(), ());
    dyld.load_object(ObjectBuffer::new("fib.o", fib_object()))
        .unwrap();
    dyld.resolve_relocations().unwrap();
    c.bench_function("rtdyld:get", |b| {
        b.iter(|| dyld.get_symbol_load_address("fib").unwrap())
    });
}

fn interpreter_benchmark(c: &mut Criterion) {
    let module = parse_module(FIB, "fib").unwrap();
    let mut interpreter = Interpreter::new(module, EngineOptions::default()).unwrap();
    c.bench_function("interpreter:fib(15)", |b| {
        b.iter(|| {
            interpreter
                .run_function("fib", &[GenericValue::from(15)])
                .unwrap()
        })
    });
}

criterion_group!(
    benches,
    load_benchmark,
    get_symbol_benchmark,
    interpreter_benchmark
);
criterion_main!(benches);
