//! Tracing mark-and-sweep collector. Invoked from `Vm::track` whenever
//! `bytesAllocated` crosses `nextGC`. Implemented against a single mark bit
//! per object plus the intrusive allocation list on `Obj` — a worklist
//! (`Vec<*mut Obj>`) of objects still needing blackening plays the role of
//! the usual "gray set".

use crate::object::{self, Obj, ObjType};
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
use crate::table::Table;
use crate::value::Value;
use crate::vm::Vm;

pub fn collect_garbage(vm: &mut Vm) {
    #[cfg(feature = "gc_debug")]
    tracing::debug!(bytes_allocated = vm.bytes_allocated, "gc begin");

    let mut gray: Vec<*mut Obj> = Vec::new();
    mark_roots(vm, &mut gray);
    trace_references(&mut gray);
    sweep(vm);
    vm.next_gc = vm.bytes_allocated * 2;

    #[cfg(feature = "gc_debug")]
    tracing::debug!(bytes_allocated = vm.bytes_allocated, next_gc = vm.next_gc, "gc end");
}

fn mark_value(value: Value, gray: &mut Vec<*mut Obj>) {
    if let Value::Obj(ptr) = value {
        mark_object(ptr, gray);
    }
}

fn mark_object(ptr: *mut Obj, gray: &mut Vec<*mut Obj>) {
    if ptr.is_null() {
        return;
    }
    unsafe {
        if (*ptr).marked.get() {
            return;
        }
        (*ptr).marked.set(true);
    }
    gray.push(ptr);
}

/// Marks both keys and values strongly. Not used for `vm.strings`: the
/// intern set is a weak map, so walking it here would keep every string
/// ever interned alive forever.
/// Dead entries are instead dropped via `Table::remove_unmarked` during
/// sweep, after the mark phase has decided what's actually reachable.
fn mark_table(table: &Table, gray: &mut Vec<*mut Obj>) {
    for (key, value) in table.iter() {
        mark_object(key as *mut Obj, gray);
        mark_value(value, gray);
    }
}

fn mark_roots(vm: &mut Vm, gray: &mut Vec<*mut Obj>) {
    for value in vm.stack.iter() {
        mark_value(*value, gray);
    }
    for frame in vm.frames.iter() {
        mark_object(frame.closure as *mut Obj, gray);
    }

    let mut upvalue = vm.open_upvalues;
    while !upvalue.is_null() {
        mark_object(upvalue as *mut Obj, gray);
        upvalue = unsafe { (*upvalue).next_open };
    }

    mark_table(&vm.globals, gray);
    mark_table(&vm.modules, gray);
    mark_object(vm.init_string as *mut Obj, gray);

    mark_object(vm.string_class as *mut Obj, gray);
    mark_object(vm.number_class as *mut Obj, gray);
    mark_object(vm.list_class as *mut Obj, gray);
    mark_object(vm.map_class as *mut Obj, gray);

    for value in vm.temp_roots.iter() {
        mark_value(*value, gray);
    }
    for function in vm.compiling_functions.iter() {
        mark_object(*function as *mut Obj, gray);
    }

    if let Some(list) = vm.test_failures {
        mark_object(list as *mut Obj, gray);
    }
    if let Some(name) = vm.current_test_name {
        mark_object(name as *mut Obj, gray);
    }
}

fn trace_references(gray: &mut Vec<*mut Obj>) {
    while let Some(ptr) = gray.pop() {
        blacken_object(ptr, gray);
    }
}

fn blacken_object(ptr: *mut Obj, gray: &mut Vec<*mut Obj>) {
    unsafe {
        match (*ptr).obj_type {
            ObjType::String => {}
            ObjType::Function => {
                let function = &*(ptr as *mut ObjFunction);
                if let Some(name) = function.name {
                    mark_object(name as *mut Obj, gray);
                }
                for constant in function.chunk.constants.iter() {
                    mark_value(*constant, gray);
                }
            }
            ObjType::Closure => {
                let closure = &*(ptr as *mut ObjClosure);
                mark_object(closure.function as *mut Obj, gray);
                for upvalue in closure.upvalues.iter() {
                    mark_object(*upvalue as *mut Obj, gray);
                }
                if let Some(module) = closure.module {
                    mark_object(module as *mut Obj, gray);
                }
            }
            ObjType::Upvalue => {
                let upvalue = &*(ptr as *mut ObjUpvalue);
                mark_value(upvalue.closed, gray);
            }
            ObjType::Native => {
                let native = &*(ptr as *mut ObjNative);
                mark_object(native.name as *mut Obj, gray);
            }
            ObjType::BoundMethod => {
                let bound = &*(ptr as *mut ObjBoundMethod);
                mark_value(bound.receiver, gray);
                mark_object(bound.method as *mut Obj, gray);
            }
            ObjType::BoundNative => {
                let bound = &*(ptr as *mut ObjBoundNative);
                mark_value(bound.receiver, gray);
                mark_object(bound.method as *mut Obj, gray);
            }
            ObjType::Class => {
                let class = &*(ptr as *mut ObjClass);
                mark_object(class.name as *mut Obj, gray);
                mark_table(&class.methods, gray);
            }
            ObjType::Instance => {
                let instance = &*(ptr as *mut ObjInstance);
                mark_object(instance.class as *mut Obj, gray);
                mark_table(&instance.fields, gray);
            }
            ObjType::List => {
                let list = &*(ptr as *mut ObjList);
                for item in list.items.iter() {
                    mark_value(*item, gray);
                }
            }
            ObjType::Map => {
                let map = &*(ptr as *mut ObjMap);
                mark_table(&map.table, gray);
            }
            ObjType::Module => {
                let module = &*(ptr as *mut ObjModule);
                mark_object(module.name as *mut Obj, gray);
                mark_table(&module.globals, gray);
                mark_table(&module.exports, gray);
            }
        }
    }
}

fn sweep(vm: &mut Vm) {
    vm.strings.remove_unmarked(|ptr| unsafe { (*(ptr as *mut Obj)).marked.get() });

    let mut prev: *mut Obj = std::ptr::null_mut();
    let mut current = vm.objects;
    while !current.is_null() {
        let next = unsafe { (*current).next.get() };
        if unsafe { (*current).marked.get() } {
            unsafe { (*current).marked.set(false) };
            prev = current;
        } else {
            if prev.is_null() {
                vm.objects = next;
            } else {
                unsafe { (*prev).next.set(next) };
            }
            let size = unsafe { object::deep_size(current) };
            unsafe { free_object(current) };
            vm.bytes_allocated = vm.bytes_allocated.saturating_sub(size);
        }
        current = next;
    }
}

unsafe fn free_object(ptr: *mut Obj) {
    match (*ptr).obj_type {
        ObjType::String => drop(Box::from_raw(ptr as *mut ObjString)),
        ObjType::Function => drop(Box::from_raw(ptr as *mut ObjFunction)),
        ObjType::Closure => drop(Box::from_raw(ptr as *mut ObjClosure)),
        ObjType::Upvalue => drop(Box::from_raw(ptr as *mut ObjUpvalue)),
        ObjType::Native => drop(Box::from_raw(ptr as *mut ObjNative)),
        ObjType::BoundMethod => drop(Box::from_raw(ptr as *mut ObjBoundMethod)),
        ObjType::BoundNative => drop(Box::from_raw(ptr as *mut ObjBoundNative)),
        ObjType::Class => drop(Box::from_raw(ptr as *mut ObjClass)),
        ObjType::Instance => drop(Box::from_raw(ptr as *mut ObjInstance)),
        ObjType::List => drop(Box::from_raw(ptr as *mut ObjList)),
        ObjType::Map => drop(Box::from_raw(ptr as *mut ObjMap)),
        ObjType::Module => drop(Box::from_raw(ptr as *mut ObjModule)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::InterpretResult;

    #[test]
    fn unreachable_string_is_collected_on_next_gc() {
        let mut vm = Vm::new();
        vm.next_gc = 0;
        assert_eq!(vm.interpret("var a = \"hello\" + \" world\"; a = nil;"), InterpretResult::Ok);
        let before = vm.bytes_allocated;
        collect_garbage(&mut vm);
        assert!(vm.bytes_allocated <= before);
    }

    #[test]
    fn reachable_globals_survive_collection() {
        let mut vm = Vm::new();
        assert_eq!(vm.interpret("var a = \"kept\";"), InterpretResult::Ok);
        collect_garbage(&mut vm);
        assert_eq!(vm.interpret("print a;"), InterpretResult::Ok);
    }
}
