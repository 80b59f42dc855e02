use crate::chunk::Chunk;
use crate::object::{Obj, ObjType};
use crate::objects::string::ObjString;

#[repr(C)]
pub struct ObjFunction {
    pub obj: Obj,
    pub arity: u8,
    pub upvalue_count: usize,
    pub name: Option<*mut ObjString>,
    pub chunk: Chunk,
}

impl ObjFunction {
    pub fn new(name: Option<*mut ObjString>) -> ObjFunction {
        ObjFunction {
            obj: Obj::header(ObjType::Function),
            arity: 0,
            upvalue_count: 0,
            name,
            chunk: Chunk::new(),
        }
    }

    /// `None` marks the implicit top-level closure of a script — a nameless
    /// frame prints as `script` in stack traces.
    pub fn name_str(&self) -> Option<&str> {
        self.name.map(|s| unsafe { (*s).as_str() })
    }
}
