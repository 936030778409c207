mod common;

use common::*;
use rstest::rstest;
use rtdyld::{
    EngineBuilder, EngineKind, EngineRegistry, Error, ExecutionEngine, GenericValue,
    engine::EngineOptions,
    interpreter::Interpreter,
    ir::parse_module,
};

const PROGRAMS: &str = r#"
@msg = constant [3 x i8] c"hi\00"
@total = global i64 0

define i64 @fact(i64 %n) {
entry:
  %base = icmp sle i64 %n, 1
  br i1 %base, label %one, label %recurse
one:
  ret i64 1
recurse:
  %m = sub i64 %n, 1
  %r = call i64 @fact(i64 %m)
  %p = mul i64 %n, %r
  ret i64 %p
}

define i32 @swap(i32 %n) {
entry:
  br label %loop
loop:
  %a = phi i32 [ 1, %entry ], [ %b, %loop ]
  %b = phi i32 [ 2, %entry ], [ %a, %loop ]
  %i = phi i32 [ 0, %entry ], [ %i.next, %loop ]
  %i.next = add i32 %i, 1
  %done = icmp eq i32 %i.next, %n
  br i1 %done, label %exit, label %loop
exit:
  %tens = mul i32 %a, 10
  %r = add i32 %tens, %b
  ret i32 %r
}

define i32 @memory() {
entry:
  %buf = alloca i32, i32 4
  %p1 = getelementptr i32, ptr %buf, i64 1
  %p3 = getelementptr i32, ptr %buf, i64 3
  store i32 5, ptr %buf
  store i32 6, ptr %p1
  store i32 8, ptr %p3
  %x = load i32, ptr %p1
  %y = load i32, ptr %p3
  %s = add i32 %x, %y
  %c = getelementptr i8, ptr @msg, i32 1
  %ch = load i8, ptr %c
  %w = zext i8 %ch to i32
  %r = add i32 %s, %w
  %s64 = sext i32 %r to i64
  store i64 %s64, ptr @total
  ret i32 %r
}

define i32 @sum(i32 %n, ...) {
entry:
  %ap = va_start
  br label %loop
loop:
  %i = phi i32 [ 0, %entry ], [ %i.next, %body ]
  %acc = phi i32 [ 0, %entry ], [ %acc.next, %body ]
  %more = icmp slt i32 %i, %n
  br i1 %more, label %body, label %exit
body:
  %x = va_arg ptr %ap, i32
  %acc.next = add i32 %acc, %x
  %i.next = add i32 %i, 1
  br label %loop
exit:
  ret i32 %acc
}

define i32 @sum_three() {
entry:
  %r = call i32 (i32, ...) @sum(i32 3, i32 10, i32 20, i32 12)
  ret i32 %r
}

define i32 @squares() {
entry:
  %a0 = insertelement <4 x i32> undef, i32 1, i32 0
  %a1 = insertelement <4 x i32> %a0, i32 2, i32 1
  %a2 = insertelement <4 x i32> %a1, i32 3, i32 2
  %a = insertelement <4 x i32> %a2, i32 4, i32 3
  %sq = mul <4 x i32> %a, %a
  %same = icmp eq <4 x i32> %a, %sq
  %e0 = extractelement <4 x i32> %sq, i32 0
  %e1 = extractelement <4 x i32> %sq, i32 1
  %e2 = extractelement <4 x i32> %sq, i32 2
  %e3 = extractelement <4 x i32> %sq, i32 3
  %s01 = add i32 %e0, %e1
  %s23 = add i32 %e2, %e3
  %s = add i32 %s01, %s23
  %first = extractelement <4 x i1> %same, i32 0
  %second = extractelement <4 x i1> %same, i32 1
  %f = zext i1 %first to i32
  %g = zext i1 %second to i32
  %fg = add i32 %f, %g
  %r = add i32 %s, %fg
  ret i32 %r
}

define i32 @twice(i32 %x) {
entry:
  %r = mul i32 %x, 2
  ret i32 %r
}

define i32 @thrice(i32 %x) {
entry:
  %r = mul i32 %x, 3
  ret i32 %r
}

define i32 @apply(i1 %which, i32 %x) {
entry:
  %f = select i1 %which, ptr @twice, ptr @thrice
  %r = call i32 %f(i32 %x)
  ret i32 %r
}

define i32 @classify(i32 %x) {
entry:
  switch i32 %x, label %other [ i32 0, label %zero
                                i32 7, label %seven ]
zero:
  ret i32 100
seven:
  ret i32 107
other:
  ret i32 -1
}

define double @average(double %a, double %b) {
entry:
  %s = fadd double %a, %b
  %h = fdiv double %s, 2.0
  ret double %h
}

define i32 @truncated_average(double %a, double %b) {
entry:
  %h = call double @average(double %a, double %b)
  %i = fptosi double %h to i32
  ret i32 %i
}

define i32 @divide(i32 %a, i32 %b) {
entry:
  %q = sdiv i32 %a, %b
  ret i32 %q
}
"#;

fn interpreter(src: &str) -> Interpreter {
    init_logger();
    Interpreter::new(parse_module(src, "programs").unwrap(), EngineOptions::default()).unwrap()
}

fn run(engine: &mut Interpreter, name: &str, args: &[GenericValue]) -> i64 {
    engine.run_function(name, args).unwrap().as_i64().unwrap()
}

#[rstest]
#[case(0, 1)]
#[case(1, 1)]
#[case(5, 120)]
#[case(20, 2_432_902_008_176_640_000)]
fn recursion(#[case] n: i64, #[case] expected: i64) {
    let mut engine = interpreter(PROGRAMS);
    assert_eq!(run(&mut engine, "fact", &[n.into()]), expected);
    assert!(engine.stack().is_empty());
}

#[rstest]
#[case(1, 12)]
#[case(2, 21)]
#[case(3, 12)]
fn phis_read_the_previous_iteration(#[case] n: i32, #[case] expected: i64) {
    let mut engine = interpreter(PROGRAMS);
    assert_eq!(run(&mut engine, "swap", &[n.into()]), expected);
}

#[rstest]
fn stack_and_global_memory() {
    let mut engine = interpreter(PROGRAMS);
    assert_eq!(run(&mut engine, "memory", &[]), 6 + 8 + 'i' as i64);
    let total = engine.get_global_value_address("total").unwrap();
    assert_eq!(unsafe { *(total as *const i64) }, 6 + 8 + 'i' as i64);
}

#[rstest]
fn variadic_functions() {
    let mut engine = interpreter(PROGRAMS);
    assert_eq!(run(&mut engine, "sum_three", &[]), 42);
    let args = [4.into(), 1.into(), 2.into(), 3.into(), 4.into()];
    assert_eq!(run(&mut engine, "sum", &args), 10);
    let err = engine.run_function("sum", &[]).unwrap_err();
    assert!(matches!(err, Error::EntryPoint { .. }));
}

#[rstest]
fn vector_lanes() {
    let mut engine = interpreter(PROGRAMS);
    assert_eq!(run(&mut engine, "squares", &[]), 30 + 1);
}

#[rstest]
#[case(true, 10)]
#[case(false, 15)]
fn indirect_calls(#[case] which: bool, #[case] expected: i64) {
    let mut engine = interpreter(PROGRAMS);
    assert_eq!(run(&mut engine, "apply", &[which.into(), 5.into()]), expected);
}

#[rstest]
#[case(0, 100)]
#[case(7, 107)]
#[case(3, -1)]
fn switches(#[case] x: i32, #[case] expected: i64) {
    let mut engine = interpreter(PROGRAMS);
    assert_eq!(run(&mut engine, "classify", &[x.into()]), expected);
}

#[rstest]
fn floating_point() {
    let mut engine = interpreter(PROGRAMS);
    let ret = engine
        .run_function("average", &[1.5f64.into(), 2.0f64.into()])
        .unwrap();
    assert_eq!(ret.as_f64(), Some(1.75));
    assert_eq!(
        run(&mut engine, "truncated_average", &[(-7.0f64).into(), 0.0f64.into()]),
        -3
    );
}

#[rstest]
fn division_by_zero_is_fatal() {
    let mut engine = interpreter(PROGRAMS);
    assert_eq!(run(&mut engine, "divide", &[9.into(), 2.into()]), 4);
    let err = engine
        .run_function("divide", &[1.into(), 0.into()])
        .unwrap_err();
    assert!(err.is_fatal());
    assert!(engine.stack().is_empty());
}

#[rstest]
fn host_functions_take_precedence() {
    let src = r#"
declare i64 @host_sum(i64, i64)
declare i32 @puts(ptr)

define i64 @use_host() {
entry:
  %r = call i64 @host_sum(i64 40, i64 2)
  ret i64 %r
}
"#;
    let mut engine = interpreter(src);
    engine.register_host_function("host_sum", |args| {
        let a = args[0].as_i64().unwrap_or(0);
        let b = args[1].as_i64().unwrap_or(0);
        Ok(GenericValue::from(a + b))
    });
    assert_eq!(run(&mut engine, "use_host", &[]), 42);
}

#[rstest]
fn exit_ends_the_program() {
    let src = r#"
declare void @exit(i32)

define i32 @main(i32 %argc, ptr %argv) {
entry:
  %code = add i32 %argc, 4
  call void @exit(i32 %code)
  unreachable
}
"#;
    let mut engine = interpreter(src);
    let code = engine
        .run_function_as_main("main", &["prog", "x", "y"], &[])
        .unwrap();
    assert_eq!(code, 7);
}

#[rstest]
fn main_reads_argv() {
    let src = r#"
define i32 @main(i32 %argc, ptr %argv, ptr %envp) {
entry:
  %slot = getelementptr ptr, ptr %argv, i64 1
  %arg = load ptr, ptr %slot
  %c = load i8, ptr %arg
  %r = zext i8 %c to i32
  ret i32 %r
}
"#;
    let mut engine = interpreter(src);
    let code = engine
        .run_function_as_main("main", &["prog", "A"], &["PATH=/bin"])
        .unwrap();
    assert_eq!(code, 'A' as i32);

    let too_many = "define i32 @main(i32 %a, ptr %b, ptr %c, i32 %d) {\nentry:\n  ret i32 0\n}\n";
    let mut engine = interpreter(too_many);
    let err = engine.run_function_as_main("main", &[], &[]).unwrap_err();
    assert!(matches!(err, Error::EntryPoint { .. }));
}

#[rstest]
fn no_native_code() {
    let mut engine = interpreter(PROGRAMS);
    let err = engine.get_pointer_to_function("fact").unwrap_err();
    assert!(matches!(err, Error::EntryPoint { .. }));
    let err = engine.run_function("missing", &[]).unwrap_err();
    assert!(matches!(err, Error::EntryPoint { .. }));
    engine.finalize_object().unwrap();
}

#[rstest]
fn builder_can_force_the_interpreter() {
    init_logger();
    let mut engine = EngineBuilder::new(parse_module(PROGRAMS, "programs").unwrap())
        .with_kind(EngineKind::Interpreter)
        .build(&EngineRegistry::with_defaults())
        .unwrap();
    assert_eq!(engine.kind(), EngineKind::Interpreter);
    let ret = engine.run_function("fact", &[6i64.into()]).unwrap();
    assert_eq!(ret.as_i64(), Some(720));
}

#[cfg(all(unix, target_arch = "x86_64"))]
mod native {
    use super::*;

    #[rstest]
    fn calls_into_the_host_process() {
        let src = r#"
@fmt = private constant [3 x i8] c"%d\00"
declare i32 @abs(i32)
declare i32 @snprintf(ptr, i64, ptr, ...)

define i32 @absolute(i32 %x) {
entry:
  %r = call i32 @abs(i32 %x)
  ret i32 %r
}

define i32 @first_digit() {
entry:
  %buf = alloca i8, i32 16
  %n = call i32 (ptr, i64, ptr, ...) @snprintf(ptr %buf, i64 16, ptr @fmt, i32 42)
  %c = load i8, ptr %buf
  %r = zext i8 %c to i32
  ret i32 %r
}
"#;
        let mut engine = interpreter(src);
        assert_eq!(run(&mut engine, "absolute", &[(-12).into()]), 12);
        assert_eq!(run(&mut engine, "first_digit", &[]), '4' as i64);
    }

    #[rstest]
    fn calls_into_loaded_objects() {
        let src = r#"
declare i32 @add2(i32, i32)

define i32 @add_three(i32 %a, i32 %b, i32 %c) {
entry:
  %ab = call i32 @add2(i32 %a, i32 %b)
  %abc = call i32 @add2(i32 %ab, i32 %c)
  ret i32 %abc
}
"#;
        let mut engine = interpreter(src);
        engine.add_object_file(elf_x86_64_add2()).unwrap();
        let args = [1.into(), 2.into(), 3.into()];
        assert_eq!(run(&mut engine, "add_three", &args), 6);
    }
}
