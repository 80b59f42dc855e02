use crate::object::{Obj, ObjType};
use crate::objects::function::ObjFunction;
use crate::objects::module::ObjModule;
use crate::objects::upvalue::ObjUpvalue;

#[repr(C)]
pub struct ObjClosure {
    pub obj: Obj,
    pub function: *mut ObjFunction,
    pub upvalues: Vec<*mut ObjUpvalue>,
    /// `None` only for the script's top-level closure; every closure created
    /// inside a module inherits it from the enclosing closure.
    pub module: Option<*mut ObjModule>,
}

impl ObjClosure {
    pub fn new(function: *mut ObjFunction, module: Option<*mut ObjModule>) -> ObjClosure {
        let upvalue_count = unsafe { (*function).upvalue_count };
        ObjClosure {
            obj: Obj::header(ObjType::Closure),
            function,
            upvalues: Vec::with_capacity(upvalue_count),
            module,
        }
    }
}
