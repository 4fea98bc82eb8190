//! Script-visible native functions: forward calls into native code and
//! reverse functions native code can call.

use std::cell::RefCell;
use std::ffi::{c_char, c_void};
use std::rc::Rc;

use log::{debug, trace};

use crate::alloc::{NativeBuffer, TextBuffer};
use crate::closure::Trampoline;
use crate::error::{FfiError, Result};
use crate::handle::NativeHandle;
use crate::host::ScriptHost;
use crate::library::{Library, OpenMode};
use crate::marshal;
use crate::plan::CallPlan;
use crate::types::{CType, CTypeKind};
use crate::value::Value;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BindOptions {
    /// The function returns `char *`; each call copies the text out.
    pub string_return: bool,
    pub open_mode: OpenMode,
}

impl BindOptions {
    pub fn string_return() -> Self {
        Self {
            string_return: true,
            ..Self::default()
        }
    }
}

struct Bound {
    entry: usize,
    plan: CallPlan,
    /// Return slot kept between calls; a call in flight takes it.
    ret_buf: RefCell<Option<NativeBuffer>>,
    string_return: bool,
    /// Copy of the last returned string.
    last_string: RefCell<Option<TextBuffer>>,
    _library: Option<Library>,
}

enum Target {
    Bound(Bound),
    Reverse(Trampoline),
}

/// A native function with a fixed signature: either bound to an entry
/// point or wrapping a script callable behind a trampoline.
pub struct NativeFunction {
    target: Target,
}

impl NativeFunction {
    /// Resolves `symbol` in `library` (the running program when empty)
    /// and binds it. The library stays open while the function lives.
    pub fn load(
        library: &str,
        symbol: &str,
        ret: CType,
        args: Vec<CType>,
        options: BindOptions,
    ) -> Result<Self> {
        let library = Library::open(library, options.open_mode)?;
        let entry = library.symbol(symbol)?;
        debug!("bound {symbol} at {entry:#x}");
        Self::bind_with(entry, &ret, &args, options, Some(library))
    }

    /// Binds a raw entry address.
    pub fn from_address(entry: usize, ret: CType, args: Vec<CType>) -> Result<Self> {
        Self::bind(entry, ret, args, BindOptions::default())
    }

    pub fn bind(
        entry: usize,
        ret: CType,
        args: Vec<CType>,
        options: BindOptions,
    ) -> Result<Self> {
        Self::bind_with(entry, &ret, &args, options, None)
    }

    fn bind_with(
        entry: usize,
        ret: &CType,
        args: &[CType],
        options: BindOptions,
        library: Option<Library>,
    ) -> Result<Self> {
        if entry == 0 {
            return Err(FfiError::NotLoaded {
                reason: "entry address is null",
            });
        }
        if options.string_return && ret.kind() != CTypeKind::Pointer {
            return Err(FfiError::TypeMismatch {
                expected: CTypeKind::Pointer.name(),
                got: ret.kind().name(),
            });
        }
        let plan = CallPlan::prepare(ret, args)?;
        let ret_buf = NativeBuffer::zeroed(marshal::return_slot_size(ret))?;
        Ok(Self {
            target: Target::Bound(Bound {
                entry,
                plan,
                ret_buf: RefCell::new(Some(ret_buf)),
                string_return: options.string_return,
                last_string: RefCell::new(None),
                _library: library,
            }),
        })
    }

    /// Wraps a script callable so native code can call it with the given
    /// signature. The callable stays retained until the function drops.
    pub fn make_reverse(
        host: Rc<dyn ScriptHost>,
        callable: &Value,
        ret: CType,
        args: Vec<CType>,
    ) -> Result<Self> {
        let trampoline = Trampoline::new(host, callable, &ret, &args)?;
        Ok(Self {
            target: Target::Reverse(trampoline),
        })
    }

    pub fn is_reverse(&self) -> bool {
        matches!(self.target, Target::Reverse(_))
    }

    /// Address native code calls: the entry point, or the trampoline.
    pub fn code_address(&self) -> usize {
        match &self.target {
            Target::Bound(bound) => bound.entry,
            Target::Reverse(trampoline) => trampoline.code_address(),
        }
    }

    pub fn return_type(&self) -> &CType {
        match &self.target {
            Target::Bound(bound) => bound.plan.return_type(),
            Target::Reverse(trampoline) => trampoline.return_type(),
        }
    }

    pub fn arg_types(&self) -> &[CType] {
        match &self.target {
            Target::Bound(bound) => bound.plan.arg_types(),
            Target::Reverse(trampoline) => trampoline.arg_types(),
        }
    }

    /// Calls the bound entry point.
    ///
    /// Every argument gets its own buffer; strings get a NUL-terminated
    /// copy. All of them are freed before this returns, whether a later
    /// argument failed to convert or the call went through.
    pub fn invoke(&self, args: &[Value]) -> Result<Value> {
        let bound = match &self.target {
            Target::Bound(bound) => bound,
            Target::Reverse(_) => {
                return Err(FfiError::NotLoaded {
                    reason: "reverse functions are only callable from native code",
                });
            }
        };
        let plan = &bound.plan;
        if args.len() != plan.arity() {
            return Err(FfiError::ArityMismatch {
                expected: plan.arity(),
                got: args.len(),
            });
        }
        trace!("invoke {:#x} with {} args", bound.entry, args.len());

        let mut slots = Vec::with_capacity(args.len());
        let mut texts: Vec<TextBuffer> = Vec::new();
        for (value, ty) in args.iter().zip(plan.arg_types()) {
            let slot = NativeBuffer::zeroed(ty.size())?;
            if let Some(text) = unsafe { marshal::write(value, ty, slot.as_mut_ptr()) }? {
                texts.push(text);
            }
            slots.push(slot);
        }
        let mut arg_ptrs: Vec<*mut c_void> =
            slots.iter().map(NativeBuffer::as_void_ptr).collect();

        let taken = bound.ret_buf.borrow_mut().take();
        let mut ret_buf = match taken {
            Some(buf) => buf,
            None => NativeBuffer::zeroed(marshal::return_slot_size(plan.return_type()))?,
        };
        ret_buf.fill_zero();
        if bound.string_return {
            *bound.last_string.borrow_mut() = None;
        }

        unsafe { plan.call(bound.entry, &mut arg_ptrs, ret_buf.as_void_ptr()) };
        drop(texts);
        drop(slots);

        let result = Self::convert_result(bound, &ret_buf);
        let mut slot = bound.ret_buf.borrow_mut();
        if slot.is_none() {
            *slot = Some(ret_buf);
        }
        result
    }

    fn convert_result(bound: &Bound, ret_buf: &NativeBuffer) -> Result<Value> {
        let ret = bound.plan.return_type();
        if bound.string_return {
            let addr = unsafe { (ret_buf.as_ptr() as *const usize).read_unaligned() };
            if addr == 0 {
                return Ok(Value::Nil);
            }
            let bytes = unsafe {
                let len = libc::strlen(addr as *const c_char);
                std::slice::from_raw_parts(addr as *const u8, len)
            };
            let copy = NativeBuffer::c_string(bytes)?;
            let text = Value::Text(bytes.to_vec());
            *bound.last_string.borrow_mut() = Some(copy);
            return Ok(text);
        }
        match ret.kind() {
            CTypeKind::Void => Ok(Value::Nil),
            CTypeKind::Struct => {
                let copy = NativeBuffer::zeroed(ret.size())?;
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        ret_buf.as_ptr(),
                        copy.as_mut_ptr(),
                        ret.size(),
                    );
                }
                Ok(Value::Handle(Rc::new(NativeHandle::from_buffer(copy))))
            }
            _ => Ok(unsafe { marshal::read_return(ret_buf.as_ptr(), ret) }),
        }
    }

    #[cfg(test)]
    fn cached_string_addr(&self) -> Option<usize> {
        match &self.target {
            Target::Bound(bound) => bound
                .last_string
                .borrow()
                .as_ref()
                .map(|buf| buf.as_ptr() as usize),
            Target::Reverse(_) => None,
        }
    }
}

impl std::fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeFunction")
            .field("code", &format_args!("{:#x}", self.code_address()))
            .field("reverse", &self.is_reverse())
            .field("arity", &self.arg_types().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::alloc::live_allocations;
    use crate::host::testing::TestHost;

    thread_local! {
        static NATIVE_CALLS: Cell<usize> = const { Cell::new(0) };
    }

    fn native_calls() -> usize {
        NATIVE_CALLS.with(|n| n.get())
    }

    extern "C" fn add3(a: i32, b: i32, c: i32) -> i32 {
        NATIVE_CALLS.with(|n| n.set(n.get() + 1));
        a + b + c
    }

    extern "C" fn sum5(a: i64, b: i64, c: i64, d: i64, e: i64) -> i64 {
        NATIVE_CALLS.with(|n| n.set(n.get() + 1));
        a + b + c + d + e
    }

    extern "C" fn take_strings(a: *const c_char, b: *const c_char, n: i32) -> usize {
        unsafe { libc::strlen(a) + libc::strlen(b) + n as usize }
    }

    extern "C" fn greeting(n: i32) -> *const c_char {
        match n {
            0 => c"hello".as_ptr(),
            1 => c"world".as_ptr(),
            _ => std::ptr::null(),
        }
    }

    #[repr(C)]
    #[derive(Clone, Copy)]
    struct Pair {
        tag: u8,
        value: f64,
    }

    extern "C" fn make_pair(tag: u8, value: f64) -> Pair {
        Pair { tag, value }
    }

    extern "C" fn pair_total(pair: Pair) -> f64 {
        pair.tag as f64 + pair.value
    }

    extern "C" fn negate(v: i8) -> i8 {
        -v
    }

    extern "C" fn apply(f: extern "C" fn(i32) -> i32, v: i32) -> i32 {
        f(v) * 2
    }

    fn i32s(n: usize) -> Vec<CType> {
        vec![CType::i32(); n]
    }

    #[test]
    fn calls_a_native_function_by_address() {
        let add = NativeFunction::from_address(add3 as usize, CType::i32(), i32s(3))
            .expect("bind");
        let got = add.invoke(&[1.into(), 2.into(), Value::Number(3.0)]).expect("call");
        assert_eq!(got, Value::Integer(6));
        assert_eq!(add.arg_types().len(), 3);
        assert!(!add.is_reverse());
    }

    #[test]
    fn arity_mismatch_skips_the_native_call() {
        let add = NativeFunction::from_address(add3 as usize, CType::i32(), i32s(3))
            .expect("bind");
        let before = native_calls();
        assert_eq!(
            add.invoke(&[1.into(), 2.into()]),
            Err(FfiError::ArityMismatch { expected: 3, got: 2 })
        );
        assert_eq!(native_calls(), before);
    }

    #[test]
    fn failed_conversion_frees_earlier_arguments() {
        let sum = NativeFunction::from_address(
            sum5 as usize,
            CType::i64(),
            vec![CType::i64(), CType::pointer(), CType::i64(), CType::i64(), CType::i64()],
        )
        .expect("bind");
        let base = live_allocations();
        let before = native_calls();
        let args = [
            Value::Integer(1),
            Value::from("kept until failure"),
            Value::from("not an integer"),
            Value::Integer(4),
            Value::Integer(5),
        ];
        assert!(matches!(
            sum.invoke(&args),
            Err(FfiError::TypeMismatch { .. })
        ));
        assert_eq!(live_allocations(), base);
        assert_eq!(native_calls(), before);
    }

    #[test]
    fn string_arguments_are_freed_after_the_call() {
        let f = NativeFunction::from_address(
            take_strings as usize,
            CType::size_t(),
            vec![CType::pointer(), CType::pointer(), CType::i32()],
        )
        .expect("bind");
        let base = live_allocations();
        let got = f.invoke(&["abc".into(), "de".into(), 1.into()]).expect("call");
        assert_eq!(got, Value::Integer(6));
        assert_eq!(live_allocations(), base);
    }

    #[test]
    fn string_mode_copies_every_result() {
        let f = NativeFunction::bind(
            greeting as usize,
            CType::pointer(),
            i32s(1),
            BindOptions::string_return(),
        )
        .expect("bind");
        let first = f.invoke(&[0.into()]).expect("call");
        let first_cache = f.cached_string_addr().expect("cached");
        let second = f.invoke(&[1.into()]).expect("call");
        let second_cache = f.cached_string_addr().expect("cached");
        assert_eq!(first, Value::from("hello"));
        assert_eq!(second, Value::from("world"));
        assert_ne!(second_cache, greeting(1) as usize);
        assert_ne!(first_cache, greeting(0) as usize);
        assert_eq!(f.invoke(&[2.into()]).expect("call"), Value::Nil);
        assert_eq!(f.cached_string_addr(), None);
    }

    #[test]
    fn string_mode_needs_a_pointer_result() {
        let err = NativeFunction::bind(
            greeting as usize,
            CType::i32(),
            i32s(1),
            BindOptions::string_return(),
        );
        assert!(matches!(err, Err(FfiError::TypeMismatch { .. })));
    }

    #[test]
    fn libc_symbols_resolve_from_the_running_program() {
        let strlen = NativeFunction::load(
            "",
            "strlen",
            CType::size_t(),
            vec![CType::pointer()],
            BindOptions::default(),
        )
        .expect("load strlen");
        assert_eq!(strlen.invoke(&["dlffi".into()]).expect("call"), Value::Integer(5));
        assert!(matches!(
            NativeFunction::load("", "dlffi_missing", CType::void(), vec![], BindOptions::default()),
            Err(FfiError::SymbolResolutionFailure { .. })
        ));
    }

    #[test]
    fn long_double_results_from_strtold() {
        let strtold = NativeFunction::load(
            "",
            "strtold",
            CType::long_double(),
            vec![CType::pointer(), CType::pointer()],
            BindOptions::default(),
        )
        .expect("load strtold");
        let parse = |text: &str| strtold.invoke(&[text.into(), Value::Address(0)]).expect("call");
        assert_eq!(parse("2.5"), Value::Number(2.5));
        assert_eq!(parse("-0.125e3"), Value::Number(-125.0));
        assert_eq!(parse("0"), Value::Number(0.0));
    }

    #[test]
    fn narrow_results_are_sign_correct() {
        let f = NativeFunction::from_address(negate as usize, CType::i8(), vec![CType::i8()])
            .expect("bind");
        assert_eq!(f.invoke(&[5.into()]).expect("call"), Value::Integer(-5));
    }

    #[test]
    fn struct_results_become_owned_handles() {
        let pair = CType::make_struct([CType::u8(), CType::f64()]).expect("struct");
        let make = NativeFunction::from_address(
            make_pair as usize,
            pair.clone(),
            vec![CType::u8(), CType::f64()],
        )
        .expect("bind");
        let total = NativeFunction::from_address(pair_total as usize, CType::f64(), vec![pair.clone()])
            .expect("bind");

        let handle = match make.invoke(&[7.into(), Value::Number(0.25)]).expect("call") {
            Value::Handle(handle) => handle,
            other => panic!("expected handle, got {other:?}"),
        };
        assert!(handle.owns_memory());
        assert_eq!(unsafe { handle.element(&pair, 1) }.expect("read"), Value::Integer(7));
        assert_eq!(unsafe { handle.element(&pair, 2) }.expect("read"), Value::Number(0.25));

        // Handles only fill pointer parameters.
        assert!(matches!(
            total.invoke(&[Value::Handle(handle.clone())]),
            Err(FfiError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn reverse_functions_are_not_directly_invocable() {
        let host = TestHost::new();
        let noop = host.define(|_| Ok(Value::Nil));
        let f = NativeFunction::make_reverse(host.clone(), &noop, CType::void(), vec![])
            .expect("reverse");
        assert!(f.is_reverse());
        assert!(matches!(f.invoke(&[]), Err(FfiError::NotLoaded { .. })));
        drop(f);
        assert_eq!(host.live_refs(), 0);
    }

    #[test]
    fn forward_and_reverse_calls_nest() {
        let host = TestHost::new();
        let apply_fn = Rc::new(
            NativeFunction::from_address(
                apply as usize,
                CType::i32(),
                vec![CType::pointer(), CType::i32()],
            )
            .expect("bind"),
        );
        let add = Rc::new(
            NativeFunction::from_address(add3 as usize, CType::i32(), i32s(3)).expect("bind"),
        );

        // The callback calls back into native code while apply() is running.
        let inner = {
            let add = add.clone();
            host.define(move |args| {
                add.invoke(&[args[0].clone(), 10.into(), 20.into()])
                    .map_err(Into::into)
            })
        };
        let callback = Rc::new(
            NativeFunction::make_reverse(host.clone(), &inner, CType::i32(), i32s(1))
                .expect("reverse"),
        );

        let got = apply_fn
            .invoke(&[Value::Function(callback.clone()), 5.into()])
            .expect("call");
        assert_eq!(got, Value::Integer(70));
        assert_eq!(host.depth(), 0);

        // Native code re-entering the same bound function from a callback.
        let outer = {
            let apply_fn = apply_fn.clone();
            let callback = callback.clone();
            host.define(move |args| {
                apply_fn
                    .invoke(&[Value::Function(callback.clone()), args[0].clone()])
                    .map_err(Into::into)
            })
        };
        let outer_cb = NativeFunction::make_reverse(host.clone(), &outer, CType::i32(), i32s(1))
            .expect("reverse");
        let got = apply_fn
            .invoke(&[Value::Function(Rc::new(outer_cb)), 1.into()])
            .expect("call");
        assert_eq!(got, Value::Integer(124));
    }
}
