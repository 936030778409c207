use crate::{Error, Result, error::relocate_error};
use core::ops::{Add, Sub};

/// A relocation value computed in the target's 64-bit address space.
///
/// Arithmetic wraps; narrowing into the relocated field's width goes through
/// `TryFrom`, which reports values that do not fit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct RelocValue<T>(pub T);

impl<T> RelocValue<T> {
    #[inline]
    pub const fn new(val: T) -> Self {
        Self(val)
    }
}

impl Add<i64> for RelocValue<u64> {
    type Output = Self;

    #[inline]
    fn add(self, rhs: i64) -> Self::Output {
        RelocValue(self.0.wrapping_add_signed(rhs))
    }
}

impl Add<u64> for RelocValue<u64> {
    type Output = Self;

    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        RelocValue(self.0.wrapping_add(rhs))
    }
}

impl Sub<u64> for RelocValue<u64> {
    type Output = Self;

    #[inline]
    fn sub(self, rhs: u64) -> Self::Output {
        RelocValue(self.0.wrapping_sub(rhs))
    }
}

impl From<u64> for RelocValue<u64> {
    #[inline]
    fn from(val: u64) -> Self {
        Self(val)
    }
}

macro_rules! narrow_signed {
    ($($ty:ty),*) => {$(
        impl TryFrom<RelocValue<u64>> for RelocValue<$ty> {
            type Error = Error;

            #[inline]
            fn try_from(value: RelocValue<u64>) -> Result<Self> {
                <$ty>::try_from(value.0 as i64)
                    .map(RelocValue)
                    .map_err(|_| overflow(value.0, stringify!($ty)))
            }
        }
    )*};
}

macro_rules! narrow_unsigned {
    ($($ty:ty),*) => {$(
        impl TryFrom<RelocValue<u64>> for RelocValue<$ty> {
            type Error = Error;

            #[inline]
            fn try_from(value: RelocValue<u64>) -> Result<Self> {
                <$ty>::try_from(value.0)
                    .map(RelocValue)
                    .map_err(|_| overflow(value.0, stringify!($ty)))
            }
        }
    )*};
}

narrow_signed!(i8, i16, i32);
narrow_unsigned!(u8, u16, u32);

#[cold]
#[inline(never)]
fn overflow(value: u64, ty: &str) -> Error {
    relocate_error(format!("value {value:#x} does not fit in {ty}"))
}

/// Returns `Ok` when the signed `value` fits in `bits` bits.
#[inline]
pub(crate) fn check_signed(value: i64, bits: u32) -> Result<i64> {
    let min = -(1i64 << (bits - 1));
    let max = (1i64 << (bits - 1)) - 1;
    if value < min || value > max {
        return Err(relocate_error(format!(
            "value {value:#x} does not fit in a signed {bits}-bit field"
        )));
    }
    Ok(value)
}

/// Little-endian scalar that can be stored into a patch site.
pub(crate) trait PatchBytes: Copy {
    const WIDTH: usize;
    fn store(self, dst: &mut [u8]);
}

macro_rules! patch_bytes {
    ($($ty:ty),*) => {$(
        impl PatchBytes for $ty {
            const WIDTH: usize = core::mem::size_of::<$ty>();

            #[inline]
            fn store(self, dst: &mut [u8]) {
                dst.copy_from_slice(&self.to_le_bytes());
            }
        }
    )*};
}

patch_bytes!(u8, i8, u16, i16, u32, i32, u64, i64);

/// The bytes being patched: where they live in the host (local) and the
/// address they will have when the code runs (target).
pub(crate) struct PatchSite {
    pub local: *mut u8,
    pub target: u64,
    /// Bytes available from `local` to the end of the section allocation.
    pub room: usize,
}

impl PatchSite {
    #[inline]
    pub fn write<T: PatchBytes>(&self, value: RelocValue<T>) -> Result<()> {
        if T::WIDTH > self.room {
            return Err(relocate_error("patch site runs past the end of its section"));
        }
        // SAFETY: `local` points into a live section allocation with at least
        // `room` writable bytes.
        let dst = unsafe { core::slice::from_raw_parts_mut(self.local, T::WIDTH) };
        value.0.store(dst);
        Ok(())
    }

    #[inline]
    pub fn read_u32(&self) -> Result<u32> {
        if self.room < 4 {
            return Err(relocate_error("patch site runs past the end of its section"));
        }
        let mut raw = [0u8; 4];
        // SAFETY: as above.
        unsafe { core::ptr::copy_nonoverlapping(self.local, raw.as_mut_ptr(), 4) };
        Ok(u32::from_le_bytes(raw))
    }

    /// Rewrites the bits of a 32-bit instruction selected by `mask`.
    #[inline]
    pub fn patch_insn(&self, mask: u32, bits: u32) -> Result<()> {
        let insn = self.read_u32()?;
        self.write(RelocValue((insn & !mask) | (bits & mask)))
    }
}
