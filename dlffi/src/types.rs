//! Runtime C type descriptors.
//!
//! Scalars are process-wide singletons handed out from a read-only
//! registry; structures are built at runtime from member descriptors and
//! own nothing but their member list.

use std::collections::HashMap;
use std::ffi::{c_int, c_long, c_void};
use std::mem::{align_of, size_of};
use std::ops::Deref;
use std::sync::{Arc, OnceLock};

use libffi::middle::Type;

use crate::error::{FfiError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CTypeKind {
    Void,
    Bool,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    Long,
    ULong,
    Size,
    F32,
    F64,
    LongDouble,
    Pointer,
    Struct,
}

const SCALAR_KINDS: [CTypeKind; 17] = [
    CTypeKind::Void,
    CTypeKind::Bool,
    CTypeKind::I8,
    CTypeKind::U8,
    CTypeKind::I16,
    CTypeKind::U16,
    CTypeKind::I32,
    CTypeKind::U32,
    CTypeKind::I64,
    CTypeKind::U64,
    CTypeKind::Long,
    CTypeKind::ULong,
    CTypeKind::Size,
    CTypeKind::F32,
    CTypeKind::F64,
    CTypeKind::LongDouble,
    CTypeKind::Pointer,
];

impl CTypeKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Void => "void",
            Self::Bool => "bool",
            Self::I8 => "sint8",
            Self::U8 => "uint8",
            Self::I16 => "sint16",
            Self::U16 => "uint16",
            Self::I32 => "sint32",
            Self::U32 => "uint32",
            Self::I64 => "sint64",
            Self::U64 => "uint64",
            Self::Long => "slong",
            Self::ULong => "ulong",
            Self::Size => "size_t",
            Self::F32 => "float",
            Self::F64 => "double",
            Self::LongDouble => "longdouble",
            Self::Pointer => "pointer",
            Self::Struct => "struct",
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, Self::F32 | Self::F64 | Self::LongDouble)
    }

    pub fn is_integer(self) -> bool {
        matches!(
            self,
            Self::I8
                | Self::U8
                | Self::I16
                | Self::U16
                | Self::I32
                | Self::U32
                | Self::I64
                | Self::U64
                | Self::Long
                | Self::ULong
                | Self::Size
        )
    }

    pub fn is_signed(self) -> bool {
        matches!(
            self,
            Self::I8 | Self::I16 | Self::I32 | Self::I64 | Self::Long
        )
    }

    fn scalar_layout(self) -> (usize, usize) {
        match self {
            // libffi describes void with a one-byte placeholder.
            Self::Void => (1, 1),
            Self::Bool => (size_of::<bool>(), align_of::<bool>()),
            Self::I8 | Self::U8 => (1, 1),
            Self::I16 | Self::U16 => (2, align_of::<u16>()),
            Self::I32 | Self::U32 => (4, align_of::<u32>()),
            Self::I64 | Self::U64 => (8, align_of::<u64>()),
            Self::Long | Self::ULong => {
                (size_of::<c_long>(), align_of::<c_long>())
            }
            Self::Size => (size_of::<usize>(), align_of::<usize>()),
            Self::F32 => (4, align_of::<f32>()),
            Self::F64 => (8, align_of::<f64>()),
            Self::LongDouble => {
                let ty = long_double_type();
                let raw = ty.as_raw_ptr();
                // SAFETY: scalar ffi types point at libffi's static table.
                unsafe { ((*raw).size, (*raw).alignment as usize) }
            }
            Self::Pointer => {
                (size_of::<*const c_void>(), align_of::<*const c_void>())
            }
            Self::Struct => {
                unreachable!("struct layout comes from its members")
            }
        }
    }

    fn ffi_type(self) -> Type {
        match self {
            Self::Void => Type::void(),
            Self::Bool => Type::u8(),
            Self::I8 => Type::i8(),
            Self::U8 => Type::u8(),
            Self::I16 => Type::i16(),
            Self::U16 => Type::u16(),
            Self::I32 => Type::i32(),
            Self::U32 => Type::u32(),
            Self::I64 => Type::i64(),
            Self::U64 => Type::u64(),
            Self::Long if size_of::<c_long>() == 8 => Type::i64(),
            Self::Long => Type::i32(),
            Self::ULong if size_of::<c_long>() == 8 => Type::u64(),
            Self::ULong => Type::u32(),
            Self::Size => Type::usize(),
            Self::F32 => Type::f32(),
            Self::F64 => Type::f64(),
            Self::LongDouble => long_double_type(),
            Self::Pointer => Type::pointer(),
            Self::Struct => {
                unreachable!("struct ffi type comes from member layout")
            }
        }
    }
}

#[cfg(not(target_arch = "arm"))]
fn long_double_type() -> Type {
    Type::longdouble()
}

#[cfg(target_arch = "arm")]
fn long_double_type() -> Type {
    Type::f64()
}

#[derive(Debug)]
pub struct TypeDescriptor {
    kind: CTypeKind,
    size: usize,
    align: usize,
    members: Vec<CType>,
}

impl TypeDescriptor {
    pub fn kind(&self) -> CTypeKind {
        self.kind
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn alignment(&self) -> usize {
        self.align
    }

    pub fn is_struct(&self) -> bool {
        self.kind == CTypeKind::Struct
    }

    pub fn members(&self) -> &[CType] {
        &self.members
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Member at a 1-based position.
    pub fn member(&self, index: usize) -> Option<&CType> {
        index.checked_sub(1).and_then(|i| self.members.get(i))
    }

    /// Byte offset of the member at the 1-based `index`.
    ///
    /// Returns `0` for scalars, for indices outside `[1, count]`, and when
    /// the computed offset would not land inside the structure.
    pub fn member_offset(&self, index: usize) -> usize {
        if !self.is_struct() || index == 0 || index > self.members.len() {
            return 0;
        }
        let mut offset = 0usize;
        for member in &self.members[..index] {
            offset = align_up(offset, member.align) + member.size;
        }
        offset -= self.members[index - 1].size;
        if offset >= self.size {
            return 0;
        }
        offset
    }

    pub(crate) fn ffi_type(&self) -> Type {
        match self.kind {
            CTypeKind::Struct => {
                Type::structure(self.members.iter().map(|m| m.ffi_type()))
            }
            kind => kind.ffi_type(),
        }
    }
}

/// Shared handle to a [`TypeDescriptor`].
#[derive(Debug, Clone)]
pub struct CType(Arc<TypeDescriptor>);

impl Deref for CType {
    type Target = TypeDescriptor;

    fn deref(&self) -> &TypeDescriptor {
        &self.0
    }
}

impl PartialEq for CType {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for CType {}

impl CType {
    /// The singleton for a scalar kind; `None` for [`CTypeKind::Struct`].
    pub fn scalar(kind: CTypeKind) -> Option<CType> {
        registry().by_kind.get(&kind).cloned()
    }

    /// Looks a scalar up by its C-style name, with or without the
    /// `ffi_type_` prefix.
    pub fn named(name: &str) -> Option<CType> {
        let name = name.strip_prefix("ffi_type_").unwrap_or(name);
        let kind = *registry().by_name.get(name)?;
        Self::scalar(kind)
    }

    pub fn void() -> CType {
        singleton(CTypeKind::Void)
    }

    pub fn bool() -> CType {
        singleton(CTypeKind::Bool)
    }

    pub fn i8() -> CType {
        singleton(CTypeKind::I8)
    }

    pub fn u8() -> CType {
        singleton(CTypeKind::U8)
    }

    pub fn i16() -> CType {
        singleton(CTypeKind::I16)
    }

    pub fn u16() -> CType {
        singleton(CTypeKind::U16)
    }

    pub fn i32() -> CType {
        singleton(CTypeKind::I32)
    }

    pub fn u32() -> CType {
        singleton(CTypeKind::U32)
    }

    pub fn i64() -> CType {
        singleton(CTypeKind::I64)
    }

    pub fn u64() -> CType {
        singleton(CTypeKind::U64)
    }

    pub fn long() -> CType {
        singleton(CTypeKind::Long)
    }

    pub fn ulong() -> CType {
        singleton(CTypeKind::ULong)
    }

    pub fn size_t() -> CType {
        singleton(CTypeKind::Size)
    }

    pub fn f32() -> CType {
        singleton(CTypeKind::F32)
    }

    pub fn f64() -> CType {
        singleton(CTypeKind::F64)
    }

    pub fn long_double() -> CType {
        singleton(CTypeKind::LongDouble)
    }

    pub fn pointer() -> CType {
        singleton(CTypeKind::Pointer)
    }

    /// Builds a structure descriptor laid out by the C struct rule.
    pub fn make_struct<I>(members: I) -> Result<CType>
    where
        I: IntoIterator<Item = CType>,
    {
        let members: Vec<CType> = members.into_iter().collect();
        if members.is_empty() {
            return Err(FfiError::InvalidMember {
                index: 0,
                reason: "a structure needs at least one member",
            });
        }
        for (i, member) in members.iter().enumerate() {
            if member.kind == CTypeKind::Void {
                return Err(FfiError::InvalidMember {
                    index: i + 1,
                    reason: "void cannot be a structure member",
                });
            }
        }

        let mut end = 0usize;
        let mut align = 1usize;
        for member in &members {
            end = align_up(end, member.align) + member.size;
            align = align.max(member.align);
        }
        let size = align_up(end, align);

        #[cfg(debug_assertions)]
        {
            let field_types: Vec<Type> =
                members.iter().map(|m| m.ffi_type()).collect();
            if let Some((ffi_size, ffi_align, _)) =
                ffi_struct_layout(&field_types)
            {
                debug_assert_eq!((size, align), (ffi_size, ffi_align));
            }
        }

        Ok(CType(Arc::new(TypeDescriptor {
            kind: CTypeKind::Struct,
            size,
            align,
            members,
        })))
    }

    /// Gives up this handle. For a structure this frees the member list
    /// once no other handle refers to it; member descriptors stay alive
    /// for their other owners. Scalars are unaffected.
    pub fn release(self) {
        drop(self);
    }
}

/// `sizeof` for the two C spellings scripts commonly ask for.
pub fn sizeof_name(name: &str) -> Option<usize> {
    match name {
        "size_t" => Some(size_of::<usize>()),
        "void *" => Some(size_of::<*const c_void>()),
        _ => None,
    }
}

pub(crate) fn align_up(offset: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (offset + align - 1) & !(align - 1)
}

/// Layout as libffi computes it: `(size, alignment, member offsets)`.
#[cfg(any(debug_assertions, test))]
pub(crate) fn ffi_struct_layout(
    field_types: &[Type],
) -> Option<(usize, usize, Vec<usize>)> {
    use libffi::raw;

    let ffi_type = Type::structure(field_types.iter().cloned());
    let raw_type = ffi_type.as_raw_ptr();
    let mut offsets = vec![0usize; field_types.len()];
    let status = unsafe {
        raw::ffi_get_struct_offsets(
            raw::ffi_abi_FFI_DEFAULT_ABI,
            raw_type,
            offsets.as_mut_ptr(),
        )
    };
    if status != raw::ffi_status_FFI_OK {
        return None;
    }
    let size = unsafe { (*raw_type).size };
    let align = unsafe { (*raw_type).alignment } as usize;
    Some((size, align, offsets))
}

struct ScalarRegistry {
    by_kind: HashMap<CTypeKind, CType>,
    by_name: HashMap<&'static str, CTypeKind>,
}

static SCALARS: OnceLock<ScalarRegistry> = OnceLock::new();

fn registry() -> &'static ScalarRegistry {
    SCALARS.get_or_init(|| {
        let by_kind = SCALAR_KINDS
            .iter()
            .map(|&kind| {
                let (size, align) = kind.scalar_layout();
                let desc = TypeDescriptor {
                    kind,
                    size,
                    align,
                    members: Vec::new(),
                };
                (kind, CType(Arc::new(desc)))
            })
            .collect();

        let mut by_name: HashMap<&'static str, CTypeKind> = SCALAR_KINDS
            .iter()
            .map(|&kind| (kind.name(), kind))
            .collect();
        let int_kind = |signed: bool| match (size_of::<c_int>(), signed) {
            (2, true) => CTypeKind::I16,
            (2, false) => CTypeKind::U16,
            (_, true) => CTypeKind::I32,
            (_, false) => CTypeKind::U32,
        };
        by_name.insert("schar", CTypeKind::I8);
        by_name.insert("uchar", CTypeKind::U8);
        by_name.insert("sshort", CTypeKind::I16);
        by_name.insert("ushort", CTypeKind::U16);
        by_name.insert("sint", int_kind(true));
        by_name.insert("uint", int_kind(false));

        ScalarRegistry { by_kind, by_name }
    })
}

fn singleton(kind: CTypeKind) -> CType {
    match registry().by_kind.get(&kind) {
        Some(ty) => ty.clone(),
        None => unreachable!("every scalar kind is registered"),
    }
}
