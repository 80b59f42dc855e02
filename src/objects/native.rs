use crate::object::{Obj, ObjType};
use crate::objects::string::ObjString;
use crate::value::Value;
use crate::vm::Vm;

/// Natives take their already-evaluated arguments as a borrowed slice rather
/// than a raw stack pointer + count. Copying the handful of call-site values
/// out before invoking avoids aliasing a `&mut Vm` against a slice into the
/// VM's own stack.
pub type NativeFn = fn(&mut Vm, &[Value]) -> Result<Value, String>;

#[repr(C)]
pub struct ObjNative {
    pub obj: Obj,
    pub name: *mut ObjString,
    pub arity: i32,
    pub function: NativeFn,
}

impl ObjNative {
    /// `arity < 0` marks a variadic native (e.g. a `List.map` callback
    /// arity isn't checked here at all — only the call-site arity the
    /// compiler already verified matters).
    pub fn new(name: *mut ObjString, arity: i32, function: NativeFn) -> ObjNative {
        ObjNative { obj: Obj::header(ObjType::Native), name, arity, function }
    }
}
