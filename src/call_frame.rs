//! A single activation record: an executing closure, its instruction
//! pointer, and the base of its stack window. `slots_base` is an index into
//! the VM's value stack rather than a raw pointer — the stack is
//! preallocated to its fixed capacity up front and never reallocated, so an
//! index is just as stable as a pointer would be but carries no `unsafe`
//! aliasing risk against the VM's own `&mut` borrow of that stack.

use crate::objects::closure::ObjClosure;

pub struct CallFrame {
    pub closure: *mut ObjClosure,
    pub ip: usize,
    pub slots_base: usize,
}

impl CallFrame {
    pub fn new(closure: *mut ObjClosure, slots_base: usize) -> CallFrame {
        CallFrame { closure, ip: 0, slots_base }
    }

    pub fn function(&self) -> *mut crate::objects::function::ObjFunction {
        unsafe { (*self.closure).function }
    }
}
