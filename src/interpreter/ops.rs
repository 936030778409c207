//! Semantics of the value-producing instructions.

use crate::{
    Result,
    error::fatal_error,
    ir::{BinOp, CastOp, FloatPredicate, IntPredicate, Type},
    value::{GenericValue, IntValue, load_from_memory, mask, store_to_memory},
};

/// Applies `f` to each lane of two vectors, or once to two scalars.
fn lanes2(
    ty: &Type,
    lhs: &GenericValue,
    rhs: &GenericValue,
    f: impl Fn(&Type, &GenericValue, &GenericValue) -> Result<GenericValue>,
) -> Result<GenericValue> {
    match (ty, lhs, rhs) {
        (Type::Vector(_, elem), GenericValue::Aggregate(a), GenericValue::Aggregate(b)) => Ok(
            GenericValue::Aggregate(
                a.iter()
                    .zip(b)
                    .map(|(a, b)| f(elem, a, b))
                    .collect::<Result<_>>()?,
            ),
        ),
        _ => f(ty, lhs, rhs),
    }
}

fn int_operands(lhs: &GenericValue, rhs: &GenericValue) -> Result<(IntValue, IntValue)> {
    match (lhs, rhs) {
        (GenericValue::Int(a), GenericValue::Int(b)) => Ok((*a, *b)),
        _ => Err(fatal_error(format!(
            "integer operation on {lhs:?} and {rhs:?}"
        ))),
    }
}

fn float_operands(lhs: &GenericValue, rhs: &GenericValue) -> Result<(f64, f64)> {
    match (lhs, rhs) {
        (GenericValue::Float(a), GenericValue::Float(b)) => Ok((*a as f64, *b as f64)),
        (GenericValue::Double(a), GenericValue::Double(b)) => Ok((*a, *b)),
        _ => Err(fatal_error(format!(
            "floating point operation on {lhs:?} and {rhs:?}"
        ))),
    }
}

fn float_result(ty: &Type, value: f64) -> GenericValue {
    match ty {
        Type::Float => GenericValue::Float(value as f32),
        _ => GenericValue::Double(value),
    }
}

fn int_binary(op: BinOp, bits: u32, a: IntValue, b: IntValue) -> Result<IntValue> {
    let (ua, ub) = (a.zext(), b.zext());
    let (sa, sb) = (a.sext(), b.sext());
    let raw = match op {
        BinOp::Add => ua.wrapping_add(ub),
        BinOp::Sub => ua.wrapping_sub(ub),
        BinOp::Mul => ua.wrapping_mul(ub),
        BinOp::And => ua & ub,
        BinOp::Or => ua | ub,
        BinOp::Xor => ua ^ ub,
        BinOp::UDiv | BinOp::SDiv | BinOp::URem | BinOp::SRem if ub == 0 => {
            return Err(fatal_error("integer division by zero"));
        }
        BinOp::UDiv => ua / ub,
        BinOp::URem => ua % ub,
        BinOp::SDiv => sa.wrapping_div(sb) as u128,
        BinOp::SRem => sa.wrapping_rem(sb) as u128,
        BinOp::Shl if ub >= bits as u128 => 0,
        BinOp::Shl => ua << ub,
        BinOp::LShr if ub >= bits as u128 => 0,
        BinOp::LShr => ua >> ub,
        BinOp::AShr => (sa >> ub.min(127)) as u128,
        other => {
            return Err(fatal_error(format!(
                "{other:?} is not an integer operation"
            )));
        }
    };
    Ok(IntValue::new(bits, raw & mask(bits)))
}

pub(crate) fn binary(
    op: BinOp,
    ty: &Type,
    lhs: &GenericValue,
    rhs: &GenericValue,
) -> Result<GenericValue> {
    lanes2(ty, lhs, rhs, |ty, lhs, rhs| {
        if op.is_float() {
            let (a, b) = float_operands(lhs, rhs)?;
            let value = match op {
                BinOp::FAdd => a + b,
                BinOp::FSub => a - b,
                BinOp::FMul => a * b,
                BinOp::FDiv => a / b,
                _ => a % b,
            };
            // Single precision results are rounded once, like the hardware.
            return Ok(match (ty, lhs) {
                (Type::Float, GenericValue::Float(x)) => {
                    let y = rhs.as_f32().unwrap_or_default();
                    GenericValue::Float(match op {
                        BinOp::FAdd => x + y,
                        BinOp::FSub => x - y,
                        BinOp::FMul => x * y,
                        BinOp::FDiv => x / y,
                        _ => x % y,
                    })
                }
                _ => float_result(ty, value),
            });
        }
        let (a, b) = match (lhs, rhs) {
            (GenericValue::Pointer(a), GenericValue::Pointer(b)) => (
                IntValue::from_u64(64, *a as u64),
                IntValue::from_u64(64, *b as u64),
            ),
            _ => int_operands(lhs, rhs)?,
        };
        let bits = ty.int_bits().unwrap_or(64);
        Ok(GenericValue::Int(int_binary(op, bits, a, b)?))
    })
}

fn as_int(value: &GenericValue) -> Result<IntValue> {
    match value {
        GenericValue::Int(int) => Ok(*int),
        GenericValue::Pointer(addr) => Ok(IntValue::from_u64(64, *addr as u64)),
        other => Err(fatal_error(format!("{other:?} is not an integer"))),
    }
}

pub(crate) fn icmp(
    pred: IntPredicate,
    ty: &Type,
    lhs: &GenericValue,
    rhs: &GenericValue,
) -> Result<GenericValue> {
    lanes2(ty, lhs, rhs, |_, lhs, rhs| {
        let (a, b) = (as_int(lhs)?, as_int(rhs)?);
        let (ua, ub, sa, sb) = (a.zext(), b.zext(), a.sext(), b.sext());
        let result = match pred {
            IntPredicate::Eq => ua == ub,
            IntPredicate::Ne => ua != ub,
            IntPredicate::Ugt => ua > ub,
            IntPredicate::Uge => ua >= ub,
            IntPredicate::Ult => ua < ub,
            IntPredicate::Ule => ua <= ub,
            IntPredicate::Sgt => sa > sb,
            IntPredicate::Sge => sa >= sb,
            IntPredicate::Slt => sa < sb,
            IntPredicate::Sle => sa <= sb,
        };
        Ok(GenericValue::from(result))
    })
}

pub(crate) fn fcmp(
    pred: FloatPredicate,
    ty: &Type,
    lhs: &GenericValue,
    rhs: &GenericValue,
) -> Result<GenericValue> {
    lanes2(ty, lhs, rhs, |_, lhs, rhs| {
        let (a, b) = float_operands(lhs, rhs)?;
        let unordered = a.is_nan() || b.is_nan();
        let result = match pred {
            FloatPredicate::False => false,
            FloatPredicate::True => true,
            FloatPredicate::Ord => !unordered,
            FloatPredicate::Uno => unordered,
            FloatPredicate::Oeq => !unordered && a == b,
            FloatPredicate::Ogt => !unordered && a > b,
            FloatPredicate::Oge => !unordered && a >= b,
            FloatPredicate::Olt => !unordered && a < b,
            FloatPredicate::Ole => !unordered && a <= b,
            FloatPredicate::One => !unordered && a != b,
            FloatPredicate::Ueq => unordered || a == b,
            FloatPredicate::Ugt => unordered || a > b,
            FloatPredicate::Uge => unordered || a >= b,
            FloatPredicate::Ult => unordered || a < b,
            FloatPredicate::Ule => unordered || a <= b,
            FloatPredicate::Une => unordered || a != b,
        };
        Ok(GenericValue::from(result))
    })
}

fn as_float(value: &GenericValue) -> Result<f64> {
    match value {
        GenericValue::Float(v) => Ok(*v as f64),
        GenericValue::Double(v) => Ok(*v),
        other => Err(fatal_error(format!("{other:?} is not a floating point value"))),
    }
}

fn cast_scalar(op: CastOp, from: &Type, to: &Type, value: &GenericValue) -> Result<GenericValue> {
    let to_bits = to.int_bits().unwrap_or(64);
    Ok(match op {
        CastOp::Trunc | CastOp::ZExt => {
            GenericValue::Int(IntValue::new(to_bits, as_int(value)?.zext()))
        }
        CastOp::SExt => GenericValue::Int(IntValue::new(to_bits, as_int(value)?.sext() as u128)),
        CastOp::FpTrunc | CastOp::FpExt => float_result(to, as_float(value)?),
        CastOp::FpToUi => GenericValue::Int(IntValue::new(to_bits, as_float(value)? as u128)),
        CastOp::FpToSi => {
            GenericValue::Int(IntValue::new(to_bits, as_float(value)? as i128 as u128))
        }
        CastOp::UiToFp => float_result(to, as_int(value)?.zext() as f64),
        CastOp::SiToFp => float_result(to, as_int(value)?.sext() as f64),
        CastOp::PtrToInt => {
            GenericValue::Int(IntValue::new(to_bits, as_int(value)?.zext()))
        }
        CastOp::IntToPtr => GenericValue::Pointer(as_int(value)?.zext() as usize),
        CastOp::Bitcast => bitcast(from, to, value)?,
    })
}

/// Reinterprets the bytes of `value` as a value of another type of the
/// same size.
fn bitcast(from: &Type, to: &Type, value: &GenericValue) -> Result<GenericValue> {
    if from.store_size() != to.store_size() {
        return Err(fatal_error(format!("bitcast from {from} to {to} changes the size")));
    }
    let mut buf = vec![0u128; from.store_size().div_ceil(16).max(1)];
    let ptr = buf.as_mut_ptr() as *mut u8;
    // SAFETY: `buf` holds at least `store_size` bytes.
    unsafe {
        store_to_memory(value, ptr, from)?;
        load_from_memory(ptr, to)
    }
}

pub(crate) fn cast(op: CastOp, from: &Type, to: &Type, value: &GenericValue) -> Result<GenericValue> {
    match (op, from, to, value) {
        (CastOp::Bitcast, ..) => bitcast(from, to, value),
        (_, Type::Vector(_, from_elem), Type::Vector(_, to_elem), GenericValue::Aggregate(elems)) => {
            Ok(GenericValue::Aggregate(
                elems
                    .iter()
                    .map(|e| cast_scalar(op, from_elem, to_elem, e))
                    .collect::<Result<_>>()?,
            ))
        }
        _ => cast_scalar(op, from, to, value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_division_and_shifts() {
        let a = GenericValue::from(-7);
        let b = GenericValue::from(2);
        assert_eq!(binary(BinOp::SDiv, &Type::I32, &a, &b).unwrap().as_i64(), Some(-3));
        assert_eq!(binary(BinOp::SRem, &Type::I32, &a, &b).unwrap().as_i64(), Some(-1));
        assert_eq!(
            binary(BinOp::LShr, &Type::I32, &a, &b).unwrap().as_u64(),
            Some(0x3fff_fffe)
        );
        assert_eq!(binary(BinOp::AShr, &Type::I32, &a, &b).unwrap().as_i64(), Some(-2));
        let zero = GenericValue::from(0);
        assert!(binary(BinOp::UDiv, &Type::I32, &a, &zero).unwrap_err().is_fatal());
    }

    #[test]
    fn vector_lanes() {
        let ty = Type::Vector(2, Box::new(Type::I32));
        let a = GenericValue::Aggregate(vec![1.into(), 2.into()]);
        let b = GenericValue::Aggregate(vec![10.into(), 20.into()]);
        let sum = binary(BinOp::Add, &ty, &a, &b).unwrap();
        assert_eq!(sum, GenericValue::Aggregate(vec![11.into(), 22.into()]));
        let lt = icmp(IntPredicate::Slt, &ty, &a, &GenericValue::Aggregate(vec![2.into(), 2.into()]))
            .unwrap();
        assert_eq!(lt, GenericValue::Aggregate(vec![true.into(), false.into()]));
    }

    #[test]
    fn casts() {
        let v = GenericValue::int(8, 0xff);
        assert_eq!(cast(CastOp::SExt, &Type::I8, &Type::I32, &v).unwrap().as_i64(), Some(-1));
        assert_eq!(cast(CastOp::ZExt, &Type::I8, &Type::I32, &v).unwrap().as_i64(), Some(255));
        let f = cast(CastOp::Bitcast, &Type::I32, &Type::Float, &GenericValue::from(0x3f80_0000))
            .unwrap();
        assert_eq!(f, GenericValue::Float(1.0));
        let nan = GenericValue::Double(f64::NAN);
        assert_eq!(
            fcmp(FloatPredicate::Une, &Type::Double, &nan, &nan).unwrap(),
            GenericValue::from(true)
        );
    }
}
