//! Conversion between [`Value`]s and raw typed memory.

use std::ffi::{c_int, c_long, c_ulong, c_void};
use std::mem::size_of;
use std::rc::Rc;

use libffi::low::ffi_arg;

use crate::alloc::{NativeBuffer, TextBuffer};
use crate::error::{FfiError, Result};
use crate::handle::NativeHandle;
use crate::types::{CType, CTypeKind};
use crate::value::Value;

/// Copies `src` into `dst`, narrowing or widening by size.
///
/// The low-order bytes of the source value are kept when narrowing;
/// when widening the remaining bytes of `dst` are zero. Both buffers are
/// in native byte order.
pub fn fit_bytes(dst: &mut [u8], src: &[u8]) {
    dst.fill(0);
    let n = dst.len().min(src.len());
    if cfg!(target_endian = "little") {
        dst[..n].copy_from_slice(&src[..n]);
    } else {
        let dst_len = dst.len();
        dst[dst_len - n..].copy_from_slice(&src[src.len() - n..]);
    }
}

/// Writes `value` into `dst`, which must hold `ty.size()` bytes.
///
/// A string is copied into a fresh NUL-terminated native buffer whose
/// address lands in `dst`; the buffer is returned and the address stays
/// valid only as long as the caller keeps it.
///
/// # Safety
///
/// `dst` must be valid for writes of `ty.size()` bytes.
pub unsafe fn write(
    value: &Value,
    ty: &CType,
    dst: *mut u8,
) -> Result<Option<TextBuffer>> {
    // SAFETY: guaranteed by the caller.
    let dst = unsafe { std::slice::from_raw_parts_mut(dst, ty.size()) };
    write_into(value, ty.kind(), dst)
}

fn write_into(
    value: &Value,
    kind: CTypeKind,
    dst: &mut [u8],
) -> Result<Option<TextBuffer>> {
    match value {
        Value::Boolean(b) => {
            fit_bytes(dst, &(*b as c_int).to_ne_bytes());
            Ok(None)
        }
        Value::Address(_) | Value::Handle(_) | Value::Function(_) => {
            if kind != CTypeKind::Pointer {
                return Err(FfiError::TypeMismatch {
                    expected: kind.name(),
                    got: value.kind_name(),
                });
            }
            let addr = value.address().unwrap_or(0);
            fit_bytes(dst, &addr.to_ne_bytes());
            Ok(None)
        }
        Value::Integer(_) | Value::Number(_) => {
            if kind.is_float() {
                let n = value.as_f64().unwrap_or(0.0);
                let (bytes, len) = float_image(kind, n);
                fit_bytes(dst, &bytes[..len]);
            } else {
                let n = value.as_i64().unwrap_or(0);
                fit_bytes(dst, &n.to_ne_bytes());
            }
            Ok(None)
        }
        Value::Text(bytes) => {
            if kind != CTypeKind::Pointer {
                return Err(FfiError::TypeMismatch {
                    expected: kind.name(),
                    got: value.kind_name(),
                });
            }
            let copy = NativeBuffer::c_string(bytes)?;
            fit_bytes(dst, &(copy.as_ptr() as usize).to_ne_bytes());
            Ok(Some(copy))
        }
        Value::Nil | Value::Callable(_) => Err(FfiError::UnsupportedValue {
            kind: value.kind_name(),
        }),
    }
}

fn float_image(kind: CTypeKind, n: f64) -> ([u8; 16], usize) {
    let mut out = [0u8; 16];
    match kind {
        CTypeKind::F32 => {
            out[..4].copy_from_slice(&(n as f32).to_ne_bytes());
            (out, 4)
        }
        CTypeKind::LongDouble => long_double::encode(n),
        _ => {
            out[..8].copy_from_slice(&n.to_ne_bytes());
            (out, 8)
        }
    }
}

/// Reads a value of type `ty` from `src`.
///
/// Embedded structures come back as a non-owning handle to `src`
/// itself; reading does not take ownership of nested memory.
///
/// # Safety
///
/// `src` must be valid for reads of `ty.size()` bytes and, for
/// structures, stay valid as long as the returned handle is used.
pub unsafe fn read(src: *const u8, ty: &CType) -> Value {
    // SAFETY: each arm reads at most ty.size() bytes, unaligned.
    unsafe {
        match ty.kind() {
            CTypeKind::Void => Value::Nil,
            CTypeKind::Bool => Value::Boolean(src.read() != 0),
            CTypeKind::I8 => Value::Integer(load::<i8>(src) as i64),
            CTypeKind::U8 => Value::Integer(src.read() as i64),
            CTypeKind::I16 => Value::Integer(load::<i16>(src) as i64),
            CTypeKind::U16 => Value::Integer(load::<u16>(src) as i64),
            CTypeKind::I32 => Value::Integer(load::<i32>(src) as i64),
            CTypeKind::U32 => Value::Integer(load::<u32>(src) as i64),
            CTypeKind::I64 => Value::Integer(load::<i64>(src)),
            CTypeKind::U64 => Value::Integer(load::<u64>(src) as i64),
            CTypeKind::Long => Value::Integer(load::<c_long>(src) as i64),
            CTypeKind::ULong => Value::Integer(load::<c_ulong>(src) as i64),
            CTypeKind::Size => Value::Integer(load::<usize>(src) as i64),
            CTypeKind::F32 => Value::Number(load::<f32>(src) as f64),
            CTypeKind::F64 => Value::Number(load::<f64>(src)),
            CTypeKind::LongDouble => {
                let bytes = std::slice::from_raw_parts(src, ty.size());
                Value::Number(long_double::decode(bytes))
            }
            CTypeKind::Pointer => Value::Address(load::<usize>(src)),
            CTypeKind::Struct => Value::Handle(Rc::new(NativeHandle::wrap(
                src as *mut c_void,
                false,
            ))),
        }
    }
}

unsafe fn load<T: Copy>(src: *const u8) -> T {
    // SAFETY: caller validates pointer
    unsafe { (src as *const T).read_unaligned() }
}

/// Size of a libffi return slot for `ty`.
pub(crate) fn return_slot_size(ty: &CType) -> usize {
    ty.size().max(size_of::<ffi_arg>())
}

/// libffi widens integer results narrower than `ffi_arg` to a full
/// `ffi_arg`, both for calls and for closure return slots.
fn is_widened_return(ty: &CType) -> bool {
    let kind = ty.kind();
    (kind.is_integer() || kind == CTypeKind::Bool)
        && ty.size() < size_of::<ffi_arg>()
}

/// Bytes of a return slot a result of type `ty` occupies.
pub(crate) fn return_write_len(ty: &CType) -> usize {
    if is_widened_return(ty) {
        size_of::<ffi_arg>()
    } else {
        ty.size()
    }
}

/// Reads a call result out of a return slot.
///
/// # Safety
///
/// `src` must be valid for reads of [`return_slot_size`] bytes.
pub(crate) unsafe fn read_return(src: *const u8, ty: &CType) -> Value {
    if !is_widened_return(ty) {
        // SAFETY: forwarded from the caller.
        return unsafe { read(src, ty) };
    }
    // SAFETY: the slot holds a full ffi_arg.
    let raw = unsafe { load::<ffi_arg>(src) } as u64;
    match ty.kind() {
        CTypeKind::Bool => Value::Boolean(raw as u8 != 0),
        CTypeKind::I8 => Value::Integer(raw as i8 as i64),
        CTypeKind::U8 => Value::Integer(raw as u8 as i64),
        CTypeKind::I16 => Value::Integer(raw as i16 as i64),
        CTypeKind::U16 => Value::Integer(raw as u16 as i64),
        CTypeKind::I32 | CTypeKind::Long => Value::Integer(raw as i32 as i64),
        _ => Value::Integer(raw as u32 as i64),
    }
}

/// Writes a closure result into its return slot.
///
/// # Safety
///
/// `dst` must be valid for writes of [`return_write_len`] bytes.
pub(crate) unsafe fn write_return(
    value: &Value,
    ty: &CType,
    dst: *mut u8,
) -> Result<Option<TextBuffer>> {
    let len = return_write_len(ty);
    // SAFETY: forwarded from the caller.
    let dst = unsafe { std::slice::from_raw_parts_mut(dst, len) };
    match value {
        Value::Integer(_) | Value::Number(_) if len > ty.size() => {
            let n = value.as_i64().unwrap_or(0);
            let n = if ty.kind().is_signed() {
                n
            } else {
                truncate_unsigned(n, ty.size())
            };
            fit_bytes(dst, &n.to_ne_bytes());
            Ok(None)
        }
        _ => write_into(value, ty.kind(), dst),
    }
}

fn truncate_unsigned(n: i64, width: usize) -> i64 {
    if width >= 8 {
        n
    } else {
        n & ((1i64 << (width * 8)) - 1)
    }
}

fn struct_member(ty: &CType, index: usize) -> Result<&CType> {
    if !ty.is_struct() {
        return Err(FfiError::NotAStruct);
    }
    ty.member(index).ok_or(FfiError::InvalidIndex {
        index,
        count: ty.member_count(),
    })
}

fn check_base(ptr: *const u8) -> Result<()> {
    if ptr.is_null() {
        return Err(FfiError::TypeMismatch {
            expected: "pointer",
            got: "null pointer",
        });
    }
    Ok(())
}

/// Reads member `index` (1-based) of the structure at `ptr`.
///
/// # Safety
///
/// A non-null `ptr` must point at `ty.size()` readable bytes.
pub unsafe fn read_element(
    ptr: *const u8,
    ty: &CType,
    index: usize,
) -> Result<Value> {
    let member = struct_member(ty, index)?;
    check_base(ptr)?;
    // SAFETY: the member offset lies inside the structure.
    Ok(unsafe { read(ptr.add(ty.member_offset(index)), member) })
}

/// Writes member `index` (1-based) of the structure at `ptr`.
///
/// A string member yields its native copy; the structure refers to it
/// only while the caller keeps the buffer alive. Dropping it leaves the
/// member dangling. `NativeHandle::set_element` keeps it for the handle.
///
/// # Safety
///
/// A non-null `ptr` must point at `ty.size()` writable bytes, and the
/// returned buffer must outlive every use of the member.
#[must_use = "a string member points into the returned buffer"]
pub unsafe fn write_element(
    ptr: *mut u8,
    ty: &CType,
    index: usize,
    value: &Value,
) -> Result<Option<TextBuffer>> {
    let member = struct_member(ty, index)?;
    check_base(ptr)?;
    // SAFETY: the member offset lies inside the structure.
    unsafe { write(value, member, ptr.add(ty.member_offset(index))) }
}

/// The platform `long double`, converted to and from `f64`.
mod long_double {
    use crate::types::CType;

    enum Format {
        Double,
        X87,
        DoubleDouble,
        Quad,
    }

    fn format() -> Format {
        if CType::long_double().size() == 8 {
            Format::Double
        } else if cfg!(any(target_arch = "x86", target_arch = "x86_64")) {
            Format::X87
        } else if cfg!(any(
            target_arch = "powerpc",
            target_arch = "powerpc64"
        )) {
            Format::DoubleDouble
        } else {
            Format::Quad
        }
    }

    const F64_FRAC_BITS: u32 = 52;
    const F64_BIAS: i32 = 1023;
    const EXT_BIAS: i32 = 16383;

    /// Splits a finite non-zero f64 into (unbiased exponent, 53-bit
    /// significand with the leading bit at position 52).
    fn normalize(bits: u64) -> (i32, u64) {
        let exp = ((bits >> F64_FRAC_BITS) & 0x7ff) as i32;
        let frac = bits & ((1u64 << F64_FRAC_BITS) - 1);
        if exp == 0 {
            let lead = 63 - frac.leading_zeros() as i32;
            let shift = F64_FRAC_BITS as i32 - lead;
            (lead - 1074, frac << shift)
        } else {
            (exp - F64_BIAS, frac | (1u64 << F64_FRAC_BITS))
        }
    }

    fn scale(mut x: f64, mut e: i32) -> f64 {
        let up = f64::from_bits(((F64_BIAS + 1000) as u64) << 52);
        let down = f64::from_bits(((F64_BIAS - 1000) as u64) << 52);
        while e > 1000 {
            x *= up;
            e -= 1000;
        }
        while e < -1000 {
            x *= down;
            e += 1000;
        }
        x * f64::from_bits(((F64_BIAS + e) as u64) << 52)
    }

    pub(super) fn encode(n: f64) -> ([u8; 16], usize) {
        let mut out = [0u8; 16];
        match format() {
            Format::Double => {
                out[..8].copy_from_slice(&n.to_ne_bytes());
                (out, 8)
            }
            Format::DoubleDouble => {
                out[..8].copy_from_slice(&n.to_ne_bytes());
                out[8..].copy_from_slice(&0f64.to_ne_bytes());
                (out, 16)
            }
            Format::X87 => {
                let (mantissa, sign_exp) = to_x87(n);
                out[..8].copy_from_slice(&mantissa.to_le_bytes());
                out[8..10].copy_from_slice(&sign_exp.to_le_bytes());
                (out, 16)
            }
            Format::Quad => {
                out.copy_from_slice(&to_quad(n).to_ne_bytes());
                (out, 16)
            }
        }
    }

    pub(super) fn decode(bytes: &[u8]) -> f64 {
        let mut buf = [0u8; 16];
        let n = bytes.len().min(16);
        buf[..n].copy_from_slice(&bytes[..n]);
        match format() {
            Format::Double => f64::from_ne_bytes(head(&buf)),
            Format::DoubleDouble => {
                let hi = f64::from_ne_bytes(head(&buf));
                let lo = f64::from_ne_bytes(tail(&buf));
                hi + lo
            }
            Format::X87 => {
                let mantissa = u64::from_le_bytes(head(&buf));
                let sign_exp = u16::from_le_bytes([buf[8], buf[9]]);
                from_x87(mantissa, sign_exp)
            }
            Format::Quad => from_quad(u128::from_ne_bytes(buf)),
        }
    }

    fn head(buf: &[u8; 16]) -> [u8; 8] {
        let mut out = [0u8; 8];
        out.copy_from_slice(&buf[..8]);
        out
    }

    fn tail(buf: &[u8; 16]) -> [u8; 8] {
        let mut out = [0u8; 8];
        out.copy_from_slice(&buf[8..]);
        out
    }

    fn to_x87(n: f64) -> (u64, u16) {
        let bits = n.to_bits();
        let sign = ((bits >> 63) as u16) << 15;
        let exp = ((bits >> F64_FRAC_BITS) & 0x7ff) as i32;
        let frac = bits & ((1u64 << F64_FRAC_BITS) - 1);
        if exp == 0 && frac == 0 {
            return (0, sign);
        }
        if exp == 0x7ff {
            return ((1u64 << 63) | (frac << 11), sign | 0x7fff);
        }
        let (e, significand) = normalize(bits);
        (significand << 11, sign | (e + EXT_BIAS) as u16)
    }

    fn from_x87(mantissa: u64, sign_exp: u16) -> f64 {
        let sign = if sign_exp & 0x8000 != 0 { -1.0 } else { 1.0 };
        let exp = (sign_exp & 0x7fff) as i32;
        if exp == 0x7fff {
            return if mantissa << 1 == 0 {
                sign * f64::INFINITY
            } else {
                f64::NAN
            };
        }
        if mantissa == 0 {
            return sign * 0.0;
        }
        let e = if exp == 0 { 1 - EXT_BIAS } else { exp - EXT_BIAS };
        sign * scale(mantissa as f64, e - 63)
    }

    const QUAD_FRAC_BITS: u32 = 112;

    fn to_quad(n: f64) -> u128 {
        let bits = n.to_bits();
        let sign = ((bits >> 63) as u128) << 127;
        let exp = ((bits >> F64_FRAC_BITS) & 0x7ff) as i32;
        let frac = bits & ((1u64 << F64_FRAC_BITS) - 1);
        if exp == 0 && frac == 0 {
            return sign;
        }
        let shift = QUAD_FRAC_BITS - F64_FRAC_BITS;
        if exp == 0x7ff {
            return sign | (0x7fffu128 << QUAD_FRAC_BITS) | ((frac as u128) << shift);
        }
        let (e, significand) = normalize(bits);
        let frac = (significand & ((1u64 << F64_FRAC_BITS) - 1)) as u128;
        sign | (((e + EXT_BIAS) as u128) << QUAD_FRAC_BITS) | (frac << shift)
    }

    fn from_quad(bits: u128) -> f64 {
        let sign = if bits >> 127 != 0 { -1.0 } else { 1.0 };
        let exp = ((bits >> QUAD_FRAC_BITS) & 0x7fff) as i32;
        let frac = bits & ((1u128 << QUAD_FRAC_BITS) - 1);
        if exp == 0x7fff {
            return if frac == 0 {
                sign * f64::INFINITY
            } else {
                f64::NAN
            };
        }
        if exp == 0 {
            // Quad subnormals are far below the f64 range.
            return sign * 0.0;
        }
        let significand = (frac | (1u128 << QUAD_FRAC_BITS)) >> 49;
        sign * scale(significand as u64 as f64, exp - EXT_BIAS - 63)
    }

}
