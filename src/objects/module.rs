use crate::object::{Obj, ObjType};
use crate::objects::string::ObjString;
use crate::table::Table;

/// A loaded `.cmel` file's isolated global namespace plus the subset of it
/// marked `export`. The module loader caches one of these per
/// resolved path so re-importing the same module is idempotent and sees the
/// same globals, rather than re-running the file.
#[repr(C)]
pub struct ObjModule {
    pub obj: Obj,
    pub name: *mut ObjString,
    pub globals: Table,
    pub exports: Table,
}

impl ObjModule {
    pub fn new(name: *mut ObjString) -> ObjModule {
        ObjModule {
            obj: Obj::header(ObjType::Module),
            name,
            globals: Table::new(),
            exports: Table::new(),
        }
    }
}
