use crate::object::{Obj, ObjType};
use crate::objects::string::ObjString;
use crate::value::Value;

/// The `Map` primitive type, keyed by string. Modeled on the same
/// open-addressing `Table` globals and class fields already use, since
/// that's the one hash-table design already in this codebase.
#[repr(C)]
pub struct ObjMap {
    pub obj: Obj,
    pub table: crate::table::Table,
}

impl ObjMap {
    pub fn new() -> ObjMap {
        ObjMap { obj: Obj::header(ObjType::Map), table: crate::table::Table::new() }
    }

    pub fn get(&self, key: *mut ObjString) -> Option<Value> {
        self.table.get(key)
    }

    pub fn set(&mut self, key: *mut ObjString, value: Value) -> bool {
        self.table.set(key, value)
    }

    pub fn delete(&mut self, key: *mut ObjString) -> bool {
        self.table.delete(key)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

impl Default for ObjMap {
    fn default() -> ObjMap {
        ObjMap::new()
    }
}
