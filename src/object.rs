//! The common heap-object header. Every concrete heap type (`ObjString`,
//! `ObjClosure`, ...) embeds an `Obj` as its first field (`#[repr(C)]`), so a
//! `*mut Obj` can be downcast to the concrete type once its `obj_type` tag is
//! known, carried through to every object kind this VM needs.

use std::cell::Cell;
use std::fmt;

use crate::objects::bound::{ObjBoundMethod, ObjBoundNative};
use crate::objects::class::{ObjClass, ObjInstance};
use crate::objects::closure::ObjClosure;
use crate::objects::function::ObjFunction;
use crate::objects::list::ObjList;
use crate::objects::map::ObjMap;
use crate::objects::module::ObjModule;
use crate::objects::native::ObjNative;
use crate::objects::string::ObjString;
use crate::objects::upvalue::ObjUpvalue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display)]
pub enum ObjType {
    String,
    Function,
    Closure,
    Upvalue,
    Native,
    BoundMethod,
    BoundNative,
    Class,
    Instance,
    List,
    Map,
    Module,
}

#[repr(C)]
pub struct Obj {
    pub obj_type: ObjType,
    /// GC mark bit, flipped during the mark phase and cleared on survivors
    /// after sweep.
    pub marked: Cell<bool>,
    /// Intrusive singly-linked allocation list threaded through every
    /// live object, so sweep can walk the heap without a separate index.
    pub next: Cell<*mut Obj>,
}

impl Obj {
    pub fn header(obj_type: ObjType) -> Obj {
        Obj { obj_type, marked: Cell::new(false), next: Cell::new(std::ptr::null_mut()) }
    }

    pub fn type_name(&self) -> &'static str {
        match self.obj_type {
            ObjType::String => "string",
            ObjType::Function => "function",
            ObjType::Closure => "closure",
            ObjType::Upvalue => "upvalue",
            ObjType::Native => "native",
            ObjType::BoundMethod => "bound method",
            ObjType::BoundNative => "bound native",
            ObjType::Class => "class",
            ObjType::Instance => "instance",
            ObjType::List => "list",
            ObjType::Map => "map",
            ObjType::Module => "module",
        }
    }
}

impl fmt::Debug for Obj {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Obj({})", self.obj_type)
    }
}

/// Deep byte size of an object, used to drive `bytesAllocated`/`nextGC`.
/// Approximate but monotonic with what the object actually holds.
pub unsafe fn deep_size(ptr: *mut Obj) -> usize {
    let base = std::mem::size_of::<Obj>();
    match (*ptr).obj_type {
        ObjType::String => base + std::mem::size_of::<ObjString>() + (*(ptr as *mut ObjString)).chars.len(),
        ObjType::Function => base + std::mem::size_of::<ObjFunction>() + (*(ptr as *mut ObjFunction)).chunk.code.len(),
        ObjType::Closure => {
            base + std::mem::size_of::<ObjClosure>()
                + (*(ptr as *mut ObjClosure)).upvalues.len() * std::mem::size_of::<*mut ObjUpvalue>()
        }
        ObjType::Upvalue => base + std::mem::size_of::<ObjUpvalue>(),
        ObjType::Native => base + std::mem::size_of::<ObjNative>(),
        ObjType::BoundMethod => base + std::mem::size_of::<ObjBoundMethod>(),
        ObjType::BoundNative => base + std::mem::size_of::<ObjBoundNative>(),
        ObjType::Class => base + std::mem::size_of::<ObjClass>(),
        ObjType::Instance => base + std::mem::size_of::<ObjInstance>(),
        ObjType::List => base + std::mem::size_of::<ObjList>() + (*(ptr as *mut ObjList)).items.len() * std::mem::size_of::<crate::value::Value>(),
        ObjType::Map => base + std::mem::size_of::<ObjMap>(),
        ObjType::Module => base + std::mem::size_of::<ObjModule>(),
    }
}

/// Downcast helpers, one per concrete kind. Each panics if the tag doesn't
/// match — a programming-error guard, never a user-reachable path.
macro_rules! downcast {
    ($name:ident, $ty:ty, $tag:ident) => {
        #[inline]
        pub unsafe fn $name(ptr: *mut Obj) -> *mut $ty {
            debug_assert_eq!((*ptr).obj_type, ObjType::$tag);
            ptr as *mut $ty
        }
    };
}

downcast!(as_string, ObjString, String);
downcast!(as_function, ObjFunction, Function);
downcast!(as_closure, ObjClosure, Closure);
downcast!(as_upvalue, ObjUpvalue, Upvalue);
downcast!(as_native, ObjNative, Native);
downcast!(as_bound_method, ObjBoundMethod, BoundMethod);
downcast!(as_bound_native, ObjBoundNative, BoundNative);
downcast!(as_class, ObjClass, Class);
downcast!(as_instance, ObjInstance, Instance);
downcast!(as_list, ObjList, List);
downcast!(as_map, ObjMap, Map);
downcast!(as_module, ObjModule, Module);
