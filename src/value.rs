//! Values crossing the boundary between the host and executed code.

use crate::{
    Result,
    error::{custom_error, entry_point_error},
    ir::Type,
};
use core::fmt::Display;

/// An integer of 1 to 128 bits, kept zero-extended.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct IntValue {
    bits: u32,
    raw: u128,
}

#[inline]
pub(crate) const fn mask(bits: u32) -> u128 {
    if bits >= 128 { u128::MAX } else { (1u128 << bits) - 1 }
}

impl IntValue {
    #[inline]
    pub const fn new(bits: u32, raw: u128) -> Self {
        Self {
            bits,
            raw: raw & mask(bits),
        }
    }

    #[inline]
    pub const fn from_i64(bits: u32, value: i64) -> Self {
        Self::new(bits, value as i128 as u128)
    }

    #[inline]
    pub const fn from_u64(bits: u32, value: u64) -> Self {
        Self::new(bits, value as u128)
    }

    #[inline]
    pub const fn bits(&self) -> u32 {
        self.bits
    }

    /// The value zero-extended to 128 bits.
    #[inline]
    pub const fn zext(&self) -> u128 {
        self.raw
    }

    /// The value sign-extended to 128 bits.
    #[inline]
    pub const fn sext(&self) -> i128 {
        if self.bits == 0 || self.bits >= 128 {
            return self.raw as i128;
        }
        let shift = 128 - self.bits;
        ((self.raw << shift) as i128) >> shift
    }

    #[inline]
    pub const fn as_u64(&self) -> u64 {
        self.raw as u64
    }

    #[inline]
    pub const fn as_i64(&self) -> i64 {
        self.sext() as i64
    }

    #[inline]
    pub const fn is_zero(&self) -> bool {
        self.raw == 0
    }

    /// Re-interprets the value at another width.
    #[inline]
    pub const fn resize(&self, bits: u32, signed: bool) -> Self {
        if signed {
            Self::new(bits, self.sext() as u128)
        } else {
            Self::new(bits, self.raw)
        }
    }
}

impl Display for IntValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "i{} {}", self.bits, self.sext())
    }
}

/// A dynamically typed value.
///
/// The variant only says how the bits are stored. Whoever consumes a value
/// interprets it through the IR type at hand, so an `i32` result and an
/// `i32` argument both travel as [`GenericValue::Int`].
#[derive(Clone, Debug, PartialEq)]
pub enum GenericValue {
    Int(IntValue),
    Float(f32),
    Double(f64),
    Pointer(usize),
    /// Vector elements, in order.
    Aggregate(Vec<GenericValue>),
    /// Variadic arguments of the frame `depth` levels into the interpreter
    /// stack, starting at `index`.
    VaList { depth: usize, index: usize },
}

impl Default for GenericValue {
    /// The zeroed value returned by `void` functions.
    fn default() -> Self {
        GenericValue::Int(IntValue::default())
    }
}

impl From<i32> for GenericValue {
    fn from(value: i32) -> Self {
        GenericValue::Int(IntValue::from_i64(32, value as i64))
    }
}

impl From<i64> for GenericValue {
    fn from(value: i64) -> Self {
        GenericValue::Int(IntValue::from_i64(64, value))
    }
}

impl From<u64> for GenericValue {
    fn from(value: u64) -> Self {
        GenericValue::Int(IntValue::from_u64(64, value))
    }
}

impl From<bool> for GenericValue {
    fn from(value: bool) -> Self {
        GenericValue::Int(IntValue::new(1, value as u128))
    }
}

impl From<f32> for GenericValue {
    fn from(value: f32) -> Self {
        GenericValue::Float(value)
    }
}

impl From<f64> for GenericValue {
    fn from(value: f64) -> Self {
        GenericValue::Double(value)
    }
}

impl<T> From<*const T> for GenericValue {
    fn from(value: *const T) -> Self {
        GenericValue::Pointer(value as usize)
    }
}

impl<T> From<*mut T> for GenericValue {
    fn from(value: *mut T) -> Self {
        GenericValue::Pointer(value as usize)
    }
}

impl GenericValue {
    #[inline]
    pub fn int(bits: u32, value: i128) -> Self {
        GenericValue::Int(IntValue::new(bits, value as u128))
    }

    #[inline]
    pub fn as_int(&self) -> Option<IntValue> {
        match self {
            GenericValue::Int(int) => Some(*int),
            _ => None,
        }
    }

    /// The integer sign-extended from its width.
    #[inline]
    pub fn as_i64(&self) -> Option<i64> {
        self.as_int().map(|int| int.as_i64())
    }

    #[inline]
    pub fn as_u64(&self) -> Option<u64> {
        self.as_int().map(|int| int.as_u64())
    }

    #[inline]
    pub fn as_f32(&self) -> Option<f32> {
        match self {
            GenericValue::Float(value) => Some(*value),
            _ => None,
        }
    }

    #[inline]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            GenericValue::Double(value) => Some(*value),
            _ => None,
        }
    }

    #[inline]
    pub fn as_ptr(&self) -> Option<usize> {
        match self {
            GenericValue::Pointer(addr) => Some(*addr),
            _ => None,
        }
    }

    #[inline]
    pub fn as_aggregate(&self) -> Option<&[GenericValue]> {
        match self {
            GenericValue::Aggregate(elems) => Some(elems),
            _ => None,
        }
    }

    /// Whether this value can stand for a value of type `ty`.
    pub fn matches(&self, ty: &Type) -> bool {
        match (self, ty) {
            (GenericValue::Int(int), Type::Int(bits)) => int.bits() == *bits,
            (GenericValue::Float(_), Type::Float) => true,
            (GenericValue::Double(_), Type::Double) => true,
            (GenericValue::Pointer(_), Type::Ptr) => true,
            (GenericValue::VaList { .. }, Type::Ptr) => true,
            (GenericValue::Aggregate(elems), Type::Vector(len, elem)) => {
                elems.len() == *len as usize && elems.iter().all(|e| e.matches(elem))
            }
            _ => false,
        }
    }

    /// A zero of type `ty`.
    pub fn zero(ty: &Type) -> Self {
        match ty {
            Type::Void => GenericValue::default(),
            Type::Int(bits) => GenericValue::Int(IntValue::new(*bits, 0)),
            Type::Float => GenericValue::Float(0.0),
            Type::Double => GenericValue::Double(0.0),
            Type::Ptr => GenericValue::Pointer(0),
            Type::Vector(len, elem) => {
                GenericValue::Aggregate((0..*len).map(|_| GenericValue::zero(elem)).collect())
            }
        }
    }
}

/// Reads a value of type `ty` from host memory.
///
/// # Safety
/// `ptr` must be valid for reads of `ty.store_size()` bytes.
pub unsafe fn load_from_memory(ptr: *const u8, ty: &Type) -> Result<GenericValue> {
    let size = ty.store_size();
    Ok(match ty {
        Type::Int(bits) => {
            let mut raw = [0u8; 16];
            // SAFETY: guaranteed by the caller.
            unsafe { core::ptr::copy_nonoverlapping(ptr, raw.as_mut_ptr(), size) };
            GenericValue::Int(IntValue::new(*bits, u128::from_le_bytes(raw)))
        }
        Type::Float => {
            GenericValue::Float(unsafe { core::ptr::read_unaligned(ptr as *const f32) })
        }
        Type::Double => {
            GenericValue::Double(unsafe { core::ptr::read_unaligned(ptr as *const f64) })
        }
        Type::Ptr => {
            GenericValue::Pointer(unsafe { core::ptr::read_unaligned(ptr as *const usize) })
        }
        Type::Vector(len, elem) => {
            let stride = elem.store_size();
            let mut elems = Vec::with_capacity(*len as usize);
            for i in 0..*len as usize {
                elems.push(unsafe { load_from_memory(ptr.add(i * stride), elem)? });
            }
            GenericValue::Aggregate(elems)
        }
        Type::Void => return Err(custom_error("cannot load a void value")),
    })
}

/// Writes `value` as a value of type `ty` into host memory.
///
/// # Safety
/// `ptr` must be valid for writes of `ty.store_size()` bytes.
pub unsafe fn store_to_memory(value: &GenericValue, ptr: *mut u8, ty: &Type) -> Result<()> {
    match (value, ty) {
        (GenericValue::Int(int), Type::Int(_)) => {
            let raw = int.zext().to_le_bytes();
            unsafe { core::ptr::copy_nonoverlapping(raw.as_ptr(), ptr, ty.store_size()) };
        }
        (GenericValue::Float(v), Type::Float) => unsafe {
            core::ptr::write_unaligned(ptr as *mut f32, *v)
        },
        (GenericValue::Double(v), Type::Double) => unsafe {
            core::ptr::write_unaligned(ptr as *mut f64, *v)
        },
        (GenericValue::Pointer(addr), Type::Ptr) => unsafe {
            core::ptr::write_unaligned(ptr as *mut usize, *addr)
        },
        (GenericValue::Aggregate(elems), Type::Vector(_, elem)) => {
            let stride = elem.store_size();
            for (i, value) in elems.iter().enumerate() {
                unsafe { store_to_memory(value, ptr.add(i * stride), elem)? };
            }
        }
        (value, ty) => {
            return Err(entry_point_error(format!(
                "cannot store {value:?} as a value of type {ty}"
            )));
        }
    }
    Ok(())
}
