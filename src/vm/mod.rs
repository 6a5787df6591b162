mod chunk;
mod heap;
mod table;
mod value;
pub mod debug;
#[allow(clippy::module_inception)]
mod vm;

pub use chunk::{Chunk, OpCode};
pub use heap::{
    hash_string, GcRef, Heap, InternedStr, NativeFn, Obj, ObjBoundMethod, ObjClass, ObjClosure,
    ObjFunction, ObjInstance, ObjKind, ObjNative, ObjStr, ObjUpvalue,
};
pub use table::Table;
pub use value::Value;
pub use vm::{InterpretError, FRAMES_MAX, STACK_MAX, VM};
