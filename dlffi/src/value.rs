use std::fmt;
use std::rc::Rc;

use crate::function::NativeFunction;
use crate::handle::NativeHandle;

/// Opaque identity of a host object the engine cannot look inside,
/// such as a script function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectRef(pub u64);

/// A dynamically typed value crossing between script and native code.
#[derive(Clone)]
pub enum Value {
    Nil,
    Boolean(bool),
    Integer(i64),
    Number(f64),
    Text(Vec<u8>),
    /// A bare address with no ownership attached.
    Address(usize),
    Handle(Rc<NativeHandle>),
    Function(Rc<NativeFunction>),
    Callable(ObjectRef),
}

impl Value {
    pub fn text(s: impl Into<Vec<u8>>) -> Self {
        Self::Text(s.into())
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Nil => "nil",
            Self::Boolean(_) => "boolean",
            Self::Integer(_) | Self::Number(_) => "number",
            Self::Text(_) => "string",
            Self::Address(_) => "address",
            Self::Handle(_) => "pointer",
            Self::Function(_) => "function",
            Self::Callable(_) => "callable",
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Self::Nil)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Self::Integer(n) => Some(n),
            Self::Number(n) => Some(n as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Self::Integer(n) => Some(n as f64),
            Self::Number(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Text(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Address carried by pointer-like values.
    pub fn address(&self) -> Option<usize> {
        match self {
            Self::Address(addr) => Some(*addr),
            Self::Handle(handle) => Some(handle.address()),
            Self::Function(function) => Some(function.code_address()),
            _ => None,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nil => write!(f, "nil"),
            Self::Boolean(b) => write!(f, "{b}"),
            Self::Integer(n) => write!(f, "{n}"),
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(bytes) => {
                write!(f, "{:?}", String::from_utf8_lossy(bytes))
            }
            Self::Address(addr) => write!(f, "address({addr:#x})"),
            Self::Handle(handle) => {
                write!(f, "pointer({:#x})", handle.address())
            }
            Self::Function(function) => {
                write!(f, "function({:#x})", function.code_address())
            }
            Self::Callable(id) => write!(f, "callable({})", id.0),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Nil, Self::Nil) => true,
            (Self::Boolean(a), Self::Boolean(b)) => a == b,
            (Self::Integer(a), Self::Integer(b)) => a == b,
            (Self::Number(a), Self::Number(b)) => a == b,
            (Self::Integer(a), Self::Number(b))
            | (Self::Number(b), Self::Integer(a)) => *a as f64 == *b,
            (Self::Text(a), Self::Text(b)) => a == b,
            (Self::Callable(a), Self::Callable(b)) => a == b,
            (Self::Function(a), Self::Function(b)) => Rc::ptr_eq(a, b),
            (
                Self::Address(_) | Self::Handle(_),
                Self::Address(_) | Self::Handle(_),
            ) => self.address() == other.address(),
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Boolean(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Integer(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Self::Integer(n as i64)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Text(s.as_bytes().to_vec())
    }
}

impl From<Rc<NativeHandle>> for Value {
    fn from(handle: Rc<NativeHandle>) -> Self {
        Self::Handle(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_compare_across_representations() {
        assert_eq!(Value::Integer(3), Value::Number(3.0));
        assert_ne!(Value::Integer(3), Value::Number(3.5));
        assert_eq!(Value::Integer(3).as_f64(), Some(3.0));
        assert_eq!(Value::Number(7.9).as_i64(), Some(7));
    }

    #[test]
    fn pointer_like_values_compare_by_address() {
        let handle = Rc::new(NativeHandle::wrap(0x1000 as *mut _, false));
        assert_eq!(Value::Handle(handle.clone()), Value::Address(0x1000));
        assert_ne!(Value::Handle(handle), Value::Address(0x2000));
        assert_eq!(Value::from("abc").kind_name(), "string");
    }
}
