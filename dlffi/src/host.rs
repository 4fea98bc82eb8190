//! The contract between the engine and the scripting runtime that
//! embeds it.
//!
//! The engine never inspects script objects. It asks the host to keep
//! them alive ([`ScriptHost::retain`]), to hand them back, and to call
//! them with marshaled arguments.

use std::cell::RefCell;
use std::fmt;

use crate::error::FfiError;
use crate::value::Value;

/// Strong reference to a host object kept alive on the engine's behalf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RefId(pub u32);

/// A failure raised by script code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostError {
    message: String,
}

impl HostError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "script error: {}", self.message)
    }
}

impl std::error::Error for HostError {}

impl From<FfiError> for HostError {
    fn from(err: FfiError) -> Self {
        Self::new(err.to_string())
    }
}

pub trait ScriptHost {
    fn retain(&self, value: &Value) -> RefId;

    fn fetch(&self, id: RefId) -> Option<Value>;

    fn release(&self, id: RefId);

    /// Calls `callable` in protected mode. With `want_result` the host
    /// returns exactly one value.
    fn call(
        &self,
        callable: &Value,
        args: Vec<Value>,
        want_result: bool,
    ) -> Result<Option<Value>, HostError>;

    /// Current depth of the host's value stack.
    fn depth(&self) -> usize {
        0
    }

    /// Drops anything pushed above `depth`.
    fn restore_depth(&self, _depth: usize) {}
}

/// Slot table backing [`ScriptHost::retain`] for hosts without a
/// registry of their own. Released slots are reused.
#[derive(Default)]
pub struct RefTable {
    slots: RefCell<Vec<Option<Value>>>,
    free: RefCell<Vec<u32>>,
}

impl RefTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, value: Value) -> RefId {
        let mut slots = self.slots.borrow_mut();
        if let Some(idx) = self.free.borrow_mut().pop() {
            slots[idx as usize] = Some(value);
            return RefId(idx);
        }
        slots.push(Some(value));
        RefId((slots.len() - 1) as u32)
    }

    pub fn get(&self, id: RefId) -> Option<Value> {
        self.slots.borrow().get(id.0 as usize).cloned().flatten()
    }

    pub fn remove(&self, id: RefId) -> Option<Value> {
        let taken = self
            .slots
            .borrow_mut()
            .get_mut(id.0 as usize)
            .and_then(Option::take);
        if taken.is_some() {
            self.free.borrow_mut().push(id.0);
        }
        taken
    }

    /// Number of live references.
    pub fn len(&self) -> usize {
        self.slots.borrow().iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::cell::Cell;
    use std::collections::HashMap;
    use std::rc::Rc;

    use super::*;
    use crate::value::ObjectRef;

    type ScriptFn = Rc<dyn Fn(&[Value]) -> Result<Value, HostError>>;

    /// A host whose "script functions" are Rust closures.
    ///
    /// Every call pushes its arguments onto a simulated stack; a failing
    /// function leaves them there, like an interpreter unwinding mid-call.
    #[derive(Default)]
    pub(crate) struct TestHost {
        refs: RefTable,
        functions: RefCell<HashMap<u64, ScriptFn>>,
        next_fn: Cell<u64>,
        depth: Cell<usize>,
        calls: Cell<usize>,
    }

    impl TestHost {
        pub(crate) fn new() -> Rc<Self> {
            Rc::new(Self::default())
        }

        pub(crate) fn define<F>(&self, f: F) -> Value
        where
            F: Fn(&[Value]) -> Result<Value, HostError> + 'static,
        {
            let id = self.next_fn.get();
            self.next_fn.set(id + 1);
            self.functions.borrow_mut().insert(id, Rc::new(f));
            Value::Callable(ObjectRef(id))
        }

        pub(crate) fn live_refs(&self) -> usize {
            self.refs.len()
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.get()
        }
    }

    impl ScriptHost for TestHost {
        fn retain(&self, value: &Value) -> RefId {
            self.refs.insert(value.clone())
        }

        fn fetch(&self, id: RefId) -> Option<Value> {
            self.refs.get(id)
        }

        fn release(&self, id: RefId) {
            self.refs.remove(id);
        }

        fn call(
            &self,
            callable: &Value,
            args: Vec<Value>,
            want_result: bool,
        ) -> Result<Option<Value>, HostError> {
            self.calls.set(self.calls.get() + 1);
            let base = self.depth.get();
            self.depth.set(base + 1 + args.len());
            let result = match callable {
                Value::Callable(ObjectRef(id)) => {
                    let f = self.functions.borrow().get(id).cloned();
                    match f {
                        Some(f) => f(&args),
                        None => Err(HostError::new("unknown function")),
                    }
                }
                Value::Function(function) => {
                    function.invoke(&args).map_err(HostError::from)
                }
                other => Err(HostError::new(format!(
                    "attempt to call a {} value",
                    other.kind_name()
                ))),
            }?;
            self.depth.set(base);
            Ok(want_result.then_some(result))
        }

        fn depth(&self) -> usize {
            self.depth.get()
        }

        fn restore_depth(&self, depth: usize) {
            self.depth.set(depth);
        }
    }
}
