//! Native-callable proxies that forward into script callables.

use std::ffi::c_void;
use std::mem::size_of;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use libffi::raw;
use log::{debug, error, trace, warn};

use crate::error::{FfiError, Result};
use crate::host::{RefId, ScriptHost};
use crate::marshal;
use crate::plan::CallPlan;
use crate::types::{CType, CTypeKind};
use crate::value::Value;

/// Everything the dispatcher needs, at an address libffi can hold on to.
///
/// The closure is freed and the callable released when the last strong
/// reference goes, so a dispatch in flight keeps both alive.
struct ReverseState {
    closure: *mut raw::ffi_closure,
    plan: CallPlan,
    host: Rc<dyn ScriptHost>,
    callable: RefId,
}

impl Drop for ReverseState {
    fn drop(&mut self) {
        unsafe { raw::ffi_closure_free(self.closure as *mut c_void) };
        self.host.release(self.callable);
    }
}

/// Restores the host's stack depth on every way out of a dispatch.
struct FrameGuard<'a> {
    host: &'a dyn ScriptHost,
    depth: usize,
}

impl<'a> FrameGuard<'a> {
    fn enter(host: &'a dyn ScriptHost) -> Self {
        Self {
            depth: host.depth(),
            host,
        }
    }
}

impl Drop for FrameGuard<'_> {
    fn drop(&mut self) {
        self.host.restore_depth(self.depth);
    }
}

/// An executable stub with a fixed C signature.
///
/// Calling [`Trampoline::code_address`] from native code reads each
/// argument into a [`Value`], calls the retained callable through the
/// host and writes its result into the native return slot. Script
/// failures stop at the stub: they are logged and the return slot keeps
/// whatever it held.
pub(crate) struct Trampoline {
    code: usize,
    state: Rc<ReverseState>,
}

impl Trampoline {
    pub(crate) fn new(
        host: Rc<dyn ScriptHost>,
        callable: &Value,
        ret: &CType,
        args: &[CType],
    ) -> Result<Self> {
        let plan = CallPlan::prepare(ret, args)?;

        let mut code: *mut c_void = std::ptr::null_mut();
        let closure = unsafe {
            raw::ffi_closure_alloc(size_of::<raw::ffi_closure>(), &mut code)
        } as *mut raw::ffi_closure;
        if closure.is_null() {
            return Err(FfiError::AllocationFailure {
                size: size_of::<raw::ffi_closure>(),
            });
        }

        let callable = host.retain(callable);
        let trampoline = Self {
            code: code as usize,
            state: Rc::new(ReverseState {
                closure,
                plan,
                host,
                callable,
            }),
        };

        let user_data = Rc::as_ptr(&trampoline.state) as *mut c_void;
        let status = unsafe {
            raw::ffi_prep_closure_loc(
                closure,
                trampoline.state.plan.as_raw(),
                Some(dispatch),
                user_data,
                code,
            )
        };
        if status != raw::ffi_status_FFI_OK {
            return Err(FfiError::PrepFailed {
                reason: "ffi_prep_closure_loc() rejected the signature"
                    .to_string(),
            });
        }

        debug!(
            "reverse function at {:#x} ({} args)",
            trampoline.code,
            args.len()
        );
        Ok(trampoline)
    }

    pub(crate) fn code_address(&self) -> usize {
        self.code
    }

    pub(crate) fn return_type(&self) -> &CType {
        self.state.plan.return_type()
    }

    pub(crate) fn arg_types(&self) -> &[CType] {
        self.state.plan.arg_types()
    }
}

impl Drop for Trampoline {
    fn drop(&mut self) {
        debug!("released reverse function at {:#x}", self.code);
    }
}

unsafe extern "C" fn dispatch(
    _cif: *mut raw::ffi_cif,
    ret: *mut c_void,
    args: *mut *mut c_void,
    user_data: *mut c_void,
) {
    let state = user_data as *const ReverseState;
    // SAFETY: user_data is the shared state, alive while the closure is.
    // The extra count covers a callable that drops its own trampoline.
    let state = unsafe {
        Rc::increment_strong_count(state);
        Rc::from_raw(state)
    };
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| unsafe {
        state.run(ret as *mut u8, args)
    }));
    if outcome.is_err() {
        error!("panic while dispatching a native callback");
    }
}

impl ReverseState {
    unsafe fn run(&self, ret: *mut u8, args: *mut *mut c_void) {
        let _frame = FrameGuard::enter(&*self.host);
        let Some(callable) = self.host.fetch(self.callable) else {
            warn!("callback target {:?} is no longer retained", self.callable);
            return;
        };

        let values: Vec<Value> = self
            .plan
            .arg_types()
            .iter()
            .enumerate()
            // SAFETY: libffi passes one pointer per declared argument.
            .map(|(i, ty)| unsafe { marshal::read(*args.add(i) as *const u8, ty) })
            .collect();
        trace!("callback with {} args", values.len());

        let ret_ty = self.plan.return_type();
        let want_result = ret_ty.kind() != CTypeKind::Void;
        let result = match self.host.call(&callable, values, want_result) {
            Ok(result) => result,
            Err(err) => {
                warn!("callback raised an error: {err}");
                return;
            }
        };
        if !want_result {
            return;
        }

        let len = marshal::return_write_len(ret_ty);
        // SAFETY: libffi's return slot covers the widened result.
        unsafe { std::ptr::write_bytes(ret, 0, len) };
        let value = result.unwrap_or(Value::Nil);
        match unsafe { marshal::write_return(&value, ret_ty, ret) } {
            // The native caller owns a returned string.
            Ok(Some(text)) => {
                text.into_raw();
            }
            Ok(None) => {}
            Err(err) => warn!("callback result not converted: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::ffi::c_char;

    use super::*;
    use crate::handle::NativeHandle;
    use crate::host::testing::TestHost;
    use crate::host::HostError;

    #[test]
    fn increments_through_the_native_calling_convention() {
        let host = TestHost::new();
        let inc = host.define(|args| Ok(Value::Integer(args[0].as_i64().unwrap_or(0) + 1)));
        let tramp = Trampoline::new(host.clone(), &inc, &CType::i32(), &[CType::i32()])
            .expect("trampoline");
        let f: extern "C" fn(i32) -> i32 =
            unsafe { std::mem::transmute(tramp.code_address()) };
        assert_eq!(f(42), 43);
        assert_eq!(f(-1), 0);
        assert_eq!(host.calls(), 2);
        assert_eq!(host.depth(), 0);
    }

    #[test]
    fn mixed_width_arguments_arrive_in_order() {
        let host = TestHost::new();
        let combine = host.define(|args| {
            let a = args[0].as_i64().unwrap_or(0);
            let b = args[1].as_f64().unwrap_or(0.0);
            let c = args[2].as_i64().unwrap_or(0);
            Ok(Value::Number(a as f64 * 100.0 + b + c as f64))
        });
        let tramp = Trampoline::new(
            host.clone(),
            &combine,
            &CType::f64(),
            &[CType::u8(), CType::f32(), CType::i16()],
        )
        .expect("trampoline");
        let f: extern "C" fn(u8, f32, i16) -> f64 =
            unsafe { std::mem::transmute(tramp.code_address()) };
        assert_eq!(f(3, 0.5, -2), 298.5);
    }

    #[test]
    fn string_arguments_are_readable_through_handles() {
        let host = TestHost::new();
        let length = host.define(|args| {
            let addr = args[0].address().unwrap_or(0);
            let handle = NativeHandle::wrap(addr as *mut c_void, false);
            Ok(Value::Integer(unsafe { handle.to_text(None) }.len() as i64))
        });
        let tramp = Trampoline::new(host.clone(), &length, &CType::size_t(), &[CType::pointer()])
            .expect("trampoline");
        let f: extern "C" fn(*const c_char) -> usize =
            unsafe { std::mem::transmute(tramp.code_address()) };
        assert_eq!(f(c"hello".as_ptr()), 5);
    }

    #[test]
    fn script_failures_do_not_cross_the_boundary() {
        let host = TestHost::new();
        let bad = host.define(|_| Err(HostError::new("boom")));
        let tramp = Trampoline::new(host.clone(), &bad, &CType::i32(), &[CType::i32(), CType::i32()])
            .expect("trampoline");
        let f: extern "C" fn(i32, i32) -> i32 =
            unsafe { std::mem::transmute(tramp.code_address()) };
        let _ = f(1, 2);
        assert_eq!(host.calls(), 1);
        assert_eq!(host.depth(), 0);
    }

    #[test]
    fn panics_stop_at_the_stub() {
        let host = TestHost::new();
        let explode = host.define(|_| panic!("callable panicked"));
        let tramp = Trampoline::new(host.clone(), &explode, &CType::i32(), &[])
            .expect("trampoline");
        let f: extern "C" fn() -> i32 = unsafe { std::mem::transmute(tramp.code_address()) };
        let _ = f();
        assert_eq!(host.calls(), 1);
        assert_eq!(host.depth(), 0);
        assert_eq!(host.live_refs(), 1);
        drop(tramp);
        assert_eq!(host.live_refs(), 0);
    }

    #[test]
    fn a_callback_may_drop_its_own_trampoline() {
        let host = TestHost::new();
        let slot: Rc<RefCell<Option<Trampoline>>> = Rc::new(RefCell::new(None));
        let once = {
            let slot = slot.clone();
            host.define(move |args| {
                drop(slot.borrow_mut().take());
                Ok(Value::Integer(args[0].as_i64().unwrap_or(0) * 2))
            })
        };
        let tramp = Trampoline::new(host.clone(), &once, &CType::i64(), &[CType::i64()])
            .expect("trampoline");
        let f: extern "C" fn(i64) -> i64 = unsafe { std::mem::transmute(tramp.code_address()) };
        *slot.borrow_mut() = Some(tramp);
        assert_eq!(f(21), 42);
        assert!(slot.borrow().is_none());
        assert_eq!(host.live_refs(), 0);
    }

    #[test]
    fn void_callbacks_run_for_effect() {
        let host = TestHost::new();
        let hits = Rc::new(Cell::new(0));
        let counter = {
            let hits = hits.clone();
            host.define(move |_| {
                hits.set(hits.get() + 1);
                Ok(Value::Nil)
            })
        };
        let tramp = Trampoline::new(host.clone(), &counter, &CType::void(), &[])
            .expect("trampoline");
        let f: extern "C" fn() = unsafe { std::mem::transmute(tramp.code_address()) };
        f();
        f();
        assert_eq!(hits.get(), 2);
    }

    #[test]
    fn dropping_releases_the_callable() {
        let host = TestHost::new();
        let noop = host.define(|_| Ok(Value::Nil));
        let tramp = Trampoline::new(host.clone(), &noop, &CType::void(), &[CType::pointer()])
            .expect("trampoline");
        assert_eq!(host.live_refs(), 1);
        assert_eq!(tramp.arg_types().len(), 1);
        assert_eq!(tramp.return_type(), &CType::void());
        drop(tramp);
        assert_eq!(host.live_refs(), 0);
    }

    #[test]
    fn void_argument_types_fail_before_retaining() {
        let host = TestHost::new();
        let noop = host.define(|_| Ok(Value::Nil));
        let err = Trampoline::new(host.clone(), &noop, &CType::void(), &[CType::void()]);
        assert!(matches!(err, Err(FfiError::PrepFailed { .. })));
        assert_eq!(host.live_refs(), 0);
    }
}
