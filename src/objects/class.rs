use crate::object::{Obj, ObjType};
use crate::objects::string::ObjString;
use crate::table::Table;
use crate::value::Value;

/// A user-defined class. Inheritance is flattened at `OP_INHERIT`
/// time: the subclass's `methods` table starts as a copy of the
/// superclass's, so method lookup never walks a superclass chain at call
/// time — only `super.method()` dispatch needs to remember the superclass,
/// which the compiler resolves through an upvalue, not through this struct.
#[repr(C)]
pub struct ObjClass {
    pub obj: Obj,
    pub name: *mut ObjString,
    pub methods: Table,
}

impl ObjClass {
    pub fn new(name: *mut ObjString) -> ObjClass {
        ObjClass { obj: Obj::header(ObjType::Class), name, methods: Table::new() }
    }

    /// Class names are never `None` (unlike `ObjFunction::name`, which is
    /// `None` for the top-level script), so stringification can read the
    /// name directly.
    pub fn name_str_unchecked(&self) -> &str {
        unsafe { (*self.name).as_str() }
    }
}

/// An instance of a user-defined class. Fields are an open-addressing
/// `Table` exactly like globals, keyed by interned field-name strings.
#[repr(C)]
pub struct ObjInstance {
    pub obj: Obj,
    pub class: *mut ObjClass,
    pub fields: Table,
}

impl ObjInstance {
    pub fn new(class: *mut ObjClass) -> ObjInstance {
        ObjInstance { obj: Obj::header(ObjType::Instance), class, fields: Table::new() }
    }

    pub fn get(&self, key: *mut ObjString) -> Option<Value> {
        self.fields.get(key)
    }

    pub fn set(&mut self, key: *mut ObjString, value: Value) {
        self.fields.set(key, value);
    }
}
