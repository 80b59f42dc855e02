use crate::object::{Obj, ObjType};
use crate::objects::closure::ObjClosure;
use crate::objects::native::ObjNative;
use crate::value::Value;

/// A method looked up off an instance, paired with the receiver it was
/// pulled from. Calling it pushes `receiver` back into slot 0 the way a
/// direct method call would.
#[repr(C)]
pub struct ObjBoundMethod {
    pub obj: Obj,
    pub receiver: Value,
    pub method: *mut ObjClosure,
}

impl ObjBoundMethod {
    pub fn new(receiver: Value, method: *mut ObjClosure) -> ObjBoundMethod {
        ObjBoundMethod { obj: Obj::header(ObjType::BoundMethod), receiver, method }
    }
}

/// Same idea as `ObjBoundMethod` but for a primitive-class method backed by
/// a native function (string/number/list/map builtins).
#[repr(C)]
pub struct ObjBoundNative {
    pub obj: Obj,
    pub receiver: Value,
    pub method: *mut ObjNative,
}

impl ObjBoundNative {
    pub fn new(receiver: Value, method: *mut ObjNative) -> ObjBoundNative {
        ObjBoundNative { obj: Obj::header(ObjType::BoundNative), receiver, method }
    }
}
