//! Dynamic library handles.

use std::ffi::{CString, c_void};

use log::{debug, trace};
use parking_lot::Mutex;

use crate::error::{FfiError, Result};

/// The loader's error state is process-global, so every open/resolve
/// sequence runs under this lock.
static DL_LOCK: Mutex<()> = parking_lot::const_mutex(());

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OpenMode {
    /// Resolve function symbols on first use.
    #[default]
    Lazy,
    /// Resolve everything at open time.
    Now,
}

/// An open library, closed on drop.
#[derive(Debug)]
pub struct Library {
    handle: *mut c_void,
    path: String,
}

impl Library {
    /// Opens `path`; an empty path refers to the running program and
    /// everything already loaded into it.
    pub fn open(path: &str, mode: OpenMode) -> Result<Self> {
        let fail = |message: String| FfiError::SymbolResolutionFailure {
            name: display_path(path).to_string(),
            message,
        };
        let c_path = if path.is_empty() {
            None
        } else {
            Some(
                CString::new(path)
                    .map_err(|_| fail("path contains a NUL byte".into()))?,
            )
        };

        let _guard = DL_LOCK.lock();
        let handle = unsafe { sys::open(c_path.as_deref(), mode) }.map_err(fail)?;
        debug!("opened {} ({mode:?})", display_path(path));
        Ok(Self {
            handle,
            path: path.to_string(),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Address of `name`.
    pub fn symbol(&self, name: &str) -> Result<usize> {
        let fail = |message: String| FfiError::SymbolResolutionFailure {
            name: name.to_string(),
            message,
        };
        let c_name = CString::new(name)
            .map_err(|_| fail("symbol name contains a NUL byte".into()))?;

        let _guard = DL_LOCK.lock();
        let addr = unsafe { sys::symbol(self.handle, &c_name) }.map_err(fail)?;
        trace!("{name} in {} at {addr:#x}", display_path(&self.path));
        Ok(addr)
    }
}

impl Drop for Library {
    fn drop(&mut self) {
        let _guard = DL_LOCK.lock();
        unsafe { sys::close(self.handle) };
        debug!("closed {}", display_path(&self.path));
    }
}

fn display_path(path: &str) -> &str {
    if path.is_empty() { "<self>" } else { path }
}

#[cfg(target_family = "unix")]
mod sys {
    use std::ffi::{CStr, c_void};

    use super::OpenMode;

    unsafe fn last_error() -> String {
        let err = unsafe { libc::dlerror() };
        if err.is_null() {
            return "unknown loader error".to_string();
        }
        unsafe { CStr::from_ptr(err) }.to_string_lossy().into_owned()
    }

    pub(super) unsafe fn open(
        path: Option<&CStr>,
        mode: OpenMode,
    ) -> Result<*mut c_void, String> {
        let flags = match mode {
            OpenMode::Lazy => libc::RTLD_LAZY,
            OpenMode::Now => libc::RTLD_NOW,
        };
        let raw = path.map_or(std::ptr::null(), CStr::as_ptr);
        unsafe {
            libc::dlerror();
            let handle = libc::dlopen(raw, flags);
            if handle.is_null() {
                return Err(last_error());
            }
            Ok(handle)
        }
    }

    pub(super) unsafe fn symbol(
        handle: *mut c_void,
        name: &CStr,
    ) -> Result<usize, String> {
        unsafe {
            libc::dlerror();
            let sym = libc::dlsym(handle, name.as_ptr());
            if sym.is_null() {
                return Err(last_error());
            }
            Ok(sym as usize)
        }
    }

    pub(super) unsafe fn close(handle: *mut c_void) {
        unsafe {
            libc::dlclose(handle);
            libc::dlerror();
        }
    }
}

#[cfg(target_os = "windows")]
mod sys {
    use std::ffi::{CStr, c_char, c_void};

    use super::OpenMode;

    unsafe extern "system" {
        fn LoadLibraryA(file_name: *const c_char) -> *mut c_void;
        fn GetModuleHandleA(module_name: *const c_char) -> *mut c_void;
        fn GetProcAddress(module: *mut c_void, name: *const c_char) -> *mut c_void;
        fn FreeLibrary(module: *mut c_void) -> i32;
    }

    pub(super) unsafe fn open(
        path: Option<&CStr>,
        _mode: OpenMode,
    ) -> Result<*mut c_void, String> {
        let handle = unsafe {
            match path {
                Some(path) => LoadLibraryA(path.as_ptr()),
                None => GetModuleHandleA(std::ptr::null()),
            }
        };
        if handle.is_null() {
            return Err("LoadLibraryA failed".to_string());
        }
        Ok(handle)
    }

    pub(super) unsafe fn symbol(
        handle: *mut c_void,
        name: &CStr,
    ) -> Result<usize, String> {
        let sym = unsafe { GetProcAddress(handle, name.as_ptr()) };
        if sym.is_null() {
            return Err("GetProcAddress failed: symbol not found".to_string());
        }
        Ok(sym as usize)
    }

    pub(super) unsafe fn close(handle: *mut c_void) {
        unsafe { FreeLibrary(handle) };
    }
}

#[cfg(not(any(target_family = "unix", target_os = "windows")))]
mod sys {
    use std::ffi::{CStr, c_void};

    use super::OpenMode;

    pub(super) unsafe fn open(
        _path: Option<&CStr>,
        _mode: OpenMode,
    ) -> Result<*mut c_void, String> {
        Err("library loading not supported on this platform".to_string())
    }

    pub(super) unsafe fn symbol(
        _handle: *mut c_void,
        _name: &CStr,
    ) -> Result<usize, String> {
        Err("library loading not supported on this platform".to_string())
    }

    pub(super) unsafe fn close(_handle: *mut c_void) {}
}
