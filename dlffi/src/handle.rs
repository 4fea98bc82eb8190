//! Script-visible wrapper around a raw native address.

use std::cell::RefCell;
use std::ffi::{c_char, c_void};
use std::fmt;
use std::rc::Rc;

use log::{debug, warn};

use crate::alloc::{NativeBuffer, TextBuffer};
use crate::error::Result;
use crate::host::{RefId, ScriptHost};
use crate::marshal;
use crate::types::CType;
use crate::value::Value;

struct ReleaseHook {
    host: Rc<dyn ScriptHost>,
    callable: RefId,
}

/// A native address, optionally owning the block behind it.
///
/// Owned memory is released with the C allocator when the handle is
/// dropped, after the release hook (if any) has seen it. Text copies
/// stored into struct members live as long as the handle.
pub struct NativeHandle {
    ptr: *mut c_void,
    owned: bool,
    hook: RefCell<Option<ReleaseHook>>,
    texts: RefCell<Vec<TextBuffer>>,
}

impl NativeHandle {
    /// Wraps `ptr`; with `owned` the handle frees it with `libc::free`.
    pub fn wrap(ptr: *mut c_void, owned: bool) -> Self {
        Self {
            ptr,
            owned: owned && !ptr.is_null(),
            hook: RefCell::new(None),
            texts: RefCell::new(Vec::new()),
        }
    }

    pub fn null() -> Self {
        Self::wrap(std::ptr::null_mut(), false)
    }

    /// A zeroed block of `size` bytes owned by the new handle.
    pub fn alloc(size: usize) -> Result<Self> {
        Ok(Self::from_buffer(NativeBuffer::zeroed(size)?))
    }

    pub fn from_buffer(buf: NativeBuffer) -> Self {
        Self::wrap(buf.into_raw() as *mut c_void, true)
    }

    /// Same address, no ownership, no hook and no member text.
    pub fn alias(&self) -> Self {
        Self::wrap(self.ptr, false)
    }

    pub fn as_ptr(&self) -> *mut c_void {
        self.ptr
    }

    pub fn address(&self) -> usize {
        self.ptr as usize
    }

    pub fn is_null(&self) -> bool {
        self.ptr.is_null()
    }

    pub fn owns_memory(&self) -> bool {
        self.owned
    }

    /// Byte distance `self - other`.
    pub fn offset_from(&self, other: &NativeHandle) -> isize {
        self.address().wrapping_sub(other.address()) as isize
    }

    /// 1-based element access.
    ///
    /// With a type, reads element `idx` of an array of that type. Without
    /// one, treats the address as an array of pointers and returns a
    /// non-owning handle to entry `idx`. Null handles and indices below 1
    /// yield `Nil`.
    ///
    /// # Safety
    ///
    /// The addressed element must be readable.
    pub unsafe fn index(&self, idx: i64, ty: Option<&CType>) -> Value {
        if self.is_null() || idx < 1 {
            return Value::Nil;
        }
        let stride = ty.map_or(size_of::<*mut c_void>(), |ty| ty.size());
        let Some(offset) = usize::try_from(idx - 1)
            .ok()
            .and_then(|slot| slot.checked_mul(stride))
            .filter(|&offset| self.address().checked_add(offset).is_some())
        else {
            return Value::Nil;
        };
        // SAFETY: forwarded from the caller.
        let at = unsafe { (self.ptr as *const u8).add(offset) };
        match ty {
            // SAFETY: forwarded from the caller.
            Some(ty) => unsafe { marshal::read(at, ty) },
            None => {
                // SAFETY: forwarded from the caller.
                let entry = unsafe { (at as *const *mut c_void).read_unaligned() };
                Value::Handle(Rc::new(Self::wrap(entry, false)))
            }
        }
    }

    /// Copies `len` bytes, or up to the first NUL without a length.
    /// A null handle gives an empty string.
    ///
    /// # Safety
    ///
    /// The address must be readable for `len` bytes or be NUL-terminated.
    pub unsafe fn to_text(&self, len: Option<usize>) -> Vec<u8> {
        if self.is_null() {
            return Vec::new();
        }
        // SAFETY: forwarded from the caller.
        unsafe {
            let len = match len {
                Some(len) => len,
                None => libc::strlen(self.ptr as *const c_char),
            };
            std::slice::from_raw_parts(self.ptr as *const u8, len).to_vec()
        }
    }

    /// Reads member `index` of the structure this handle points at.
    ///
    /// # Safety
    ///
    /// The handle must point at a live value of type `ty`.
    pub unsafe fn element(&self, ty: &CType, index: usize) -> Result<Value> {
        // SAFETY: forwarded from the caller.
        unsafe { marshal::read_element(self.ptr as *const u8, ty, index) }
    }

    /// Writes member `index` of the structure this handle points at.
    /// A string member's native copy is kept until the handle is dropped.
    ///
    /// # Safety
    ///
    /// The handle must point at a live, writable value of type `ty`.
    pub unsafe fn set_element(&self, ty: &CType, index: usize, value: &Value) -> Result<()> {
        // SAFETY: forwarded from the caller.
        let text = unsafe {
            marshal::write_element(self.ptr as *mut u8, ty, index, value)?
        };
        if let Some(text) = text {
            self.texts.borrow_mut().push(text);
        }
        Ok(())
    }

    /// Registers `callable` to run once, with an alias of this handle,
    /// when the handle is dropped. Replaces any previous hook.
    pub fn set_release_hook(&self, host: Rc<dyn ScriptHost>, callable: &Value) {
        let callable = host.retain(callable);
        let old = self
            .hook
            .borrow_mut()
            .replace(ReleaseHook { host, callable });
        if let Some(old) = old {
            old.host.release(old.callable);
        }
    }

    pub fn clear_release_hook(&self) {
        if let Some(old) = self.hook.borrow_mut().take() {
            old.host.release(old.callable);
        }
    }

    pub fn has_release_hook(&self) -> bool {
        self.hook.borrow().is_some()
    }

    fn run_release_hook(&mut self) {
        let Some(hook) = self.hook.get_mut().take() else {
            return;
        };
        if let Some(callable) = hook.host.fetch(hook.callable) {
            let arg = Value::Handle(Rc::new(self.alias()));
            let depth = hook.host.depth();
            if let Err(err) = hook.host.call(&callable, vec![arg], false) {
                warn!("release hook for {:#x} failed: {err}", self.address());
            }
            hook.host.restore_depth(depth);
        }
        hook.host.release(hook.callable);
    }
}

impl Drop for NativeHandle {
    fn drop(&mut self) {
        self.run_release_hook();
        if self.owned {
            debug!("freeing native block at {:#x}", self.address());
            // SAFETY: owned blocks come from the C allocator.
            unsafe { libc::free(self.ptr) };
        }
    }
}

impl PartialEq for NativeHandle {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}

impl PartialEq<usize> for NativeHandle {
    fn eq(&self, addr: &usize) -> bool {
        self.address() == *addr
    }
}

impl fmt::Debug for NativeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeHandle")
            .field("address", &format_args!("{:#x}", self.address()))
            .field("owned", &self.owned)
            .finish()
    }
}
