use crate::object::{Obj, ObjType};
use crate::value::Value;

/// The `List` primitive type. Backed by a plain growable `Vec`; GC
/// tracing walks `items` directly rather than through the table machinery
/// classes use for fields.
#[repr(C)]
pub struct ObjList {
    pub obj: Obj,
    pub items: Vec<Value>,
}

impl ObjList {
    pub fn new() -> ObjList {
        ObjList { obj: Obj::header(ObjType::List), items: Vec::new() }
    }

    pub fn from_values(items: Vec<Value>) -> ObjList {
        ObjList { obj: Obj::header(ObjType::List), items }
    }
}

impl Default for ObjList {
    fn default() -> ObjList {
        ObjList::new()
    }
}
