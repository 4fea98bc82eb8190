//! Calling native functions with signatures chosen at runtime, and
//! letting native code call back into a scripting runtime.

mod alloc;
mod closure;
mod error;
mod function;
mod handle;
mod host;
mod library;
mod marshal;
mod plan;
mod types;
mod value;

pub use alloc::{NativeBuffer, TextBuffer, live_allocations};
pub use error::{FfiError, Result};
pub use function::{BindOptions, NativeFunction};
pub use handle::NativeHandle;
pub use host::{HostError, RefId, RefTable, ScriptHost};
pub use library::{Library, OpenMode};
pub use marshal::{fit_bytes, read, read_element, write, write_element};
pub use types::{CType, CTypeKind, TypeDescriptor, sizeof_name};
pub use value::{ObjectRef, Value};
