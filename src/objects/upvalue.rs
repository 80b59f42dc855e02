use crate::object::{Obj, ObjType};
use crate::value::Value;

/// Open/closed upvalue cell. `location` points into a
/// live value-stack slot while open; `close()` copies the current value into
/// `closed` and retargets `location` to point at that field instead, so
/// readers never need to branch on open/closed — they just always
/// dereference `location`.
#[repr(C)]
pub struct ObjUpvalue {
    pub obj: Obj,
    pub location: *mut Value,
    pub closed: Value,
    /// Next node in the VM's `open_upvalues` list, ordered by descending
    /// stack address; null once closed and unlinked.
    pub next_open: *mut ObjUpvalue,
}

impl ObjUpvalue {
    pub fn new(location: *mut Value) -> ObjUpvalue {
        ObjUpvalue {
            obj: Obj::header(ObjType::Upvalue),
            location,
            closed: Value::Nil,
            next_open: std::ptr::null_mut(),
        }
    }

    /// Close over the value currently in the stack slot and retarget.
    pub unsafe fn close(&mut self) {
        self.closed = *self.location;
        self.location = &mut self.closed as *mut Value;
        self.next_open = std::ptr::null_mut();
    }
}
