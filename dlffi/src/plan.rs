//! Prepared libffi call interfaces.

use std::ffi::{c_uint, c_void};

use libffi::middle::{CodePtr, Type};
use libffi::raw;

use crate::error::{FfiError, Result};
use crate::types::{CType, CTypeKind};

/// A signature prepared once and reused for every call through it.
///
/// The `ffi_cif` is boxed and keeps raw pointers into `arg_raw` and the
/// owned [`Type`]s, so none of them may move or drop while the plan lives.
pub(crate) struct CallPlan {
    cif: Box<raw::ffi_cif>,
    arg_raw: Box<[*mut raw::ffi_type]>,
    _ffi_ret: Type,
    _ffi_args: Vec<Type>,
    ret: CType,
    args: Vec<CType>,
}

impl CallPlan {
    pub(crate) fn prepare(ret: &CType, args: &[CType]) -> Result<Self> {
        if let Some(pos) =
            args.iter().position(|ty| ty.kind() == CTypeKind::Void)
        {
            return Err(FfiError::PrepFailed {
                reason: format!("argument #{} has type void", pos + 1),
            });
        }
        let nargs = c_uint::try_from(args.len()).map_err(|_| {
            FfiError::PrepFailed {
                reason: format!("{} arguments is too many", args.len()),
            }
        })?;

        let ffi_ret = ret.ffi_type();
        let ffi_args: Vec<Type> = args.iter().map(|ty| ty.ffi_type()).collect();
        let mut arg_raw: Box<[*mut raw::ffi_type]> =
            ffi_args.iter().map(Type::as_raw_ptr).collect();
        // SAFETY: ffi_cif is plain data; ffi_prep_cif fills it in.
        let mut cif: Box<raw::ffi_cif> = Box::new(unsafe { std::mem::zeroed() });

        let status = unsafe {
            raw::ffi_prep_cif(
                cif.as_mut(),
                raw::ffi_abi_FFI_DEFAULT_ABI,
                nargs,
                ffi_ret.as_raw_ptr(),
                arg_raw.as_mut_ptr(),
            )
        };
        if status != raw::ffi_status_FFI_OK {
            return Err(FfiError::PrepFailed {
                reason: status_name(status).to_string(),
            });
        }

        Ok(Self {
            cif,
            arg_raw,
            _ffi_ret: ffi_ret,
            _ffi_args: ffi_args,
            ret: ret.clone(),
            args: args.to_vec(),
        })
    }

    pub(crate) fn return_type(&self) -> &CType {
        &self.ret
    }

    pub(crate) fn arg_types(&self) -> &[CType] {
        &self.args
    }

    pub(crate) fn arity(&self) -> usize {
        self.arg_raw.len()
    }

    pub(crate) fn as_raw(&self) -> *mut raw::ffi_cif {
        &*self.cif as *const raw::ffi_cif as *mut raw::ffi_cif
    }

    /// Calls `entry` with one pointer per argument slot.
    ///
    /// # Safety
    ///
    /// `entry` must be a function with this plan's signature, every
    /// pointer in `args` must address a value of the matching argument
    /// type, and `ret` must hold a full return slot.
    pub(crate) unsafe fn call(
        &self,
        entry: usize,
        args: &mut [*mut c_void],
        ret: *mut c_void,
    ) {
        debug_assert_eq!(args.len(), self.arity());
        let code = CodePtr::from_ptr(entry as *const c_void);
        unsafe {
            raw::ffi_call(
                self.as_raw(),
                Some(*code.as_safe_fun()),
                ret,
                args.as_mut_ptr(),
            );
        }
    }
}

fn status_name(status: raw::ffi_status) -> &'static str {
    if status == raw::ffi_status_FFI_BAD_TYPEDEF {
        "bad type definition"
    } else if status == raw::ffi_status_FFI_BAD_ABI {
        "bad ABI"
    } else {
        "unsupported signature"
    }
}
