//! Calling native code with [`GenericValue`] arguments.
//!
//! Only register-passed arguments are supported: integers and pointers go
//! to the integer argument registers, `float` and `double` to the vector
//! registers. The callee is always invoked through a function type that
//! fills every argument register, so unused registers carry zeros.

use crate::{
    Result,
    error::entry_point_error,
    ir::{Signature, Type},
    value::{GenericValue, IntValue},
};

/// Checks that `args` can be passed to a function of type `sig`.
pub(crate) fn check_args(name: &str, sig: &Signature, args: &[GenericValue]) -> Result<()> {
    let count_ok = if sig.variadic {
        args.len() >= sig.params.len()
    } else {
        args.len() == sig.params.len()
    };
    if !count_ok {
        return Err(entry_point_error(format!(
            "[{name}] expects {}{} arguments, got {}",
            if sig.variadic { "at least " } else { "" },
            sig.params.len(),
            args.len()
        )));
    }
    for (i, (arg, ty)) in args.iter().zip(&sig.params).enumerate() {
        if !arg.matches(ty) {
            return Err(entry_point_error(format!(
                "[{name}]: argument {i} is {arg:?}, expected a value of type {ty}"
            )));
        }
    }
    Ok(())
}

#[cfg(target_arch = "x86_64")]
const INT_REGS: usize = 6;
#[cfg(not(target_arch = "x86_64"))]
const INT_REGS: usize = 8;
const FLOAT_REGS: usize = 8;

#[derive(Default)]
struct Registers {
    ints: [u64; 8],
    floats: [f64; 8],
    int_count: usize,
    float_count: usize,
}

impl Registers {
    fn push_int(&mut self, value: u64) -> Result<()> {
        if self.int_count == INT_REGS {
            return Err(entry_point_error(format!(
                "more than {INT_REGS} integer arguments are not supported"
            )));
        }
        self.ints[self.int_count] = value;
        self.int_count += 1;
        Ok(())
    }

    fn push_float(&mut self, value: f64) -> Result<()> {
        if self.float_count == FLOAT_REGS {
            return Err(entry_point_error(format!(
                "more than {FLOAT_REGS} floating point arguments are not supported"
            )));
        }
        self.floats[self.float_count] = value;
        self.float_count += 1;
        Ok(())
    }

    /// Places one argument. `variadic` arguments follow the C default
    /// promotions.
    fn push(&mut self, arg: &GenericValue, variadic: bool) -> Result<()> {
        match arg {
            GenericValue::Int(int) if int.bits() <= 64 => {
                // Booleans are zero-extended, everything else sign-extended.
                let raw = if int.bits() == 1 {
                    int.as_u64()
                } else {
                    int.as_i64() as u64
                };
                self.push_int(raw)
            }
            GenericValue::Pointer(addr) => self.push_int(*addr as u64),
            GenericValue::Float(v) if variadic => self.push_float(*v as f64),
            GenericValue::Float(v) => self.push_float(f64::from_bits(v.to_bits() as u64)),
            GenericValue::Double(v) => self.push_float(*v),
            other => Err(entry_point_error(format!(
                "{other:?} cannot be passed to native code"
            ))),
        }
    }
}

fn classify_return(ty: &Type) -> Result<()> {
    match ty {
        Type::Void | Type::Float | Type::Double | Type::Ptr => Ok(()),
        Type::Int(bits) if *bits <= 64 => Ok(()),
        other => Err(entry_point_error(format!(
            "native functions returning {other} are not supported"
        ))),
    }
}

fn int_return(ty: &Type, raw: u64) -> GenericValue {
    match ty {
        Type::Void => GenericValue::default(),
        Type::Ptr => GenericValue::Pointer(raw as usize),
        Type::Int(bits) => GenericValue::Int(IntValue::from_u64(*bits, raw)),
        _ => GenericValue::default(),
    }
}

fn float_return(ty: &Type, raw: f64) -> GenericValue {
    match ty {
        Type::Float => GenericValue::Float(f32::from_bits(raw.to_bits() as u32)),
        _ => GenericValue::Double(raw),
    }
}

type IntFn = unsafe extern "C" fn(
    u64, u64, u64, u64, u64, u64, u64, u64,
    f64, f64, f64, f64, f64, f64, f64, f64,
) -> u64;
type FloatFn = unsafe extern "C" fn(
    u64, u64, u64, u64, u64, u64, u64, u64,
    f64, f64, f64, f64, f64, f64, f64, f64,
) -> f64;

/// Calls the native function at `addr` with `args`.
///
/// # Safety
/// `addr` must point to executable code of type `sig`.
#[cfg(all(unix, any(target_arch = "x86_64", target_arch = "aarch64")))]
pub(crate) unsafe fn call_native(
    addr: u64,
    sig: &Signature,
    args: &[GenericValue],
) -> Result<GenericValue> {
    if addr == 0 {
        return Err(entry_point_error("call to a null function pointer"));
    }
    classify_return(&sig.ret)?;
    let mut regs = Registers::default();
    for (i, arg) in args.iter().enumerate() {
        regs.push(arg, i >= sig.params.len())?;
    }
    let variadic = sig.variadic && args.len() > sig.params.len();
    if variadic {
        // SAFETY: forwarded from the caller.
        return unsafe { call_variadic(addr, sig, &regs) };
    }
    let i = regs.ints;
    let f = regs.floats;
    // SAFETY: the caller guarantees `addr` has type `sig`; passing extra
    // register arguments is harmless under the C calling convention.
    unsafe {
        if sig.ret.is_float() {
            let func: FloatFn = core::mem::transmute(addr as usize);
            let ret = func(
                i[0], i[1], i[2], i[3], i[4], i[5], i[6], i[7], f[0], f[1], f[2], f[3], f[4],
                f[5], f[6], f[7],
            );
            Ok(float_return(&sig.ret, ret))
        } else {
            let func: IntFn = core::mem::transmute(addr as usize);
            let ret = func(
                i[0], i[1], i[2], i[3], i[4], i[5], i[6], i[7], f[0], f[1], f[2], f[3], f[4],
                f[5], f[6], f[7],
            );
            Ok(int_return(&sig.ret, ret))
        }
    }
}

/// Variadic callees need `al` set to the number of vector registers on
/// x86-64, which only a C-variadic call through Rust does for us.
#[cfg(all(unix, target_arch = "x86_64"))]
unsafe fn call_variadic(addr: u64, sig: &Signature, regs: &Registers) -> Result<GenericValue> {
    type IntVarFn = unsafe extern "C" fn(u64, u64, u64, u64, u64, u64, ...) -> u64;
    type FloatVarFn = unsafe extern "C" fn(u64, u64, u64, u64, u64, u64, ...) -> f64;
    let i = regs.ints;
    let f = regs.floats;
    // SAFETY: forwarded from `call_native`.
    unsafe {
        if sig.ret.is_float() {
            let func: FloatVarFn = core::mem::transmute(addr as usize);
            let ret = func(
                i[0], i[1], i[2], i[3], i[4], i[5], f[0], f[1], f[2], f[3], f[4], f[5], f[6],
                f[7],
            );
            Ok(float_return(&sig.ret, ret))
        } else {
            let func: IntVarFn = core::mem::transmute(addr as usize);
            let ret = func(
                i[0], i[1], i[2], i[3], i[4], i[5], f[0], f[1], f[2], f[3], f[4], f[5], f[6],
                f[7],
            );
            Ok(int_return(&sig.ret, ret))
        }
    }
}

/// AAPCS64 passes variadic arguments like fixed ones, except on Apple
/// targets where they go on the stack.
#[cfg(all(unix, target_arch = "aarch64"))]
unsafe fn call_variadic(addr: u64, sig: &Signature, regs: &Registers) -> Result<GenericValue> {
    if cfg!(target_vendor = "apple") {
        return Err(entry_point_error(
            "variadic native calls are not supported on this host",
        ));
    }
    let i = regs.ints;
    let f = regs.floats;
    // SAFETY: forwarded from `call_native`.
    unsafe {
        if sig.ret.is_float() {
            let func: FloatFn = core::mem::transmute(addr as usize);
            Ok(float_return(
                &sig.ret,
                func(
                    i[0], i[1], i[2], i[3], i[4], i[5], i[6], i[7], f[0], f[1], f[2], f[3],
                    f[4], f[5], f[6], f[7],
                ),
            ))
        } else {
            let func: IntFn = core::mem::transmute(addr as usize);
            Ok(int_return(
                &sig.ret,
                func(
                    i[0], i[1], i[2], i[3], i[4], i[5], i[6], i[7], f[0], f[1], f[2], f[3],
                    f[4], f[5], f[6], f[7],
                ),
            ))
        }
    }
}

#[cfg(not(all(unix, any(target_arch = "x86_64", target_arch = "aarch64"))))]
pub(crate) unsafe fn call_native(
    _addr: u64,
    _sig: &Signature,
    _args: &[GenericValue],
) -> Result<GenericValue> {
    Err(entry_point_error(
        "calling native code is not supported on this host",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argument_types_are_checked() {
        let sig = Signature::new(Type::I32, vec![Type::I32, Type::Ptr]);
        assert!(check_args("f", &sig, &[GenericValue::from(1), GenericValue::Pointer(0)]).is_ok());
        assert!(check_args("f", &sig, &[GenericValue::from(1)]).is_err());
        assert!(check_args("f", &sig, &[GenericValue::from(1i64), GenericValue::Pointer(0)]).is_err());

        let printf = Signature::variadic(Type::I32, vec![Type::Ptr]);
        assert!(check_args("printf", &printf, &[GenericValue::Pointer(0), 3.5f64.into()]).is_ok());
        assert!(check_args("printf", &printf, &[]).is_err());
    }

    #[cfg(all(unix, target_arch = "x86_64"))]
    #[test]
    fn calls_host_functions() {
        extern "C" fn mix(a: i32, b: f64, c: i64) -> f64 {
            a as f64 * b + c as f64
        }
        let sig = Signature::new(Type::Double, vec![Type::I32, Type::Double, Type::I64]);
        let ret = unsafe {
            call_native(
                mix as usize as u64,
                &sig,
                &[GenericValue::from(-2), GenericValue::from(1.5), GenericValue::from(10i64)],
            )
        }
        .unwrap();
        assert_eq!(ret, GenericValue::Double(7.0));
    }
}
