//! Chunk disassembler. Used by the compiler's `debug_print_code` feature to
//! dump a freshly compiled chunk, and by the VM's `debug_trace_execution`
//! feature to trace each executed instruction. Both sinks go through
//! `tracing` rather than raw `println!`.

use crate::chunk::{Chunk, OpCode};
use crate::value::Value;

pub fn disassemble_chunk(chunk: &Chunk, name: &str) {
    tracing::debug!("== {name} ==");
    let mut offset = 0;
    while offset < chunk.code.len() {
        let (line, next) = disassemble_instruction(chunk, offset);
        tracing::debug!("{line}");
        offset = next;
    }
}

/// Renders the instruction at `offset` as a human-readable line and returns
/// `(rendering, offset-of-next-instruction)`.
pub fn disassemble_instruction(chunk: &Chunk, offset: usize) -> (String, usize) {
    let mut out = format!("{offset:04} ");

    let line = chunk.line_at(offset);
    if offset > 0 && line == chunk.line_at(offset - 1) {
        out.push_str("   | ");
    } else {
        out.push_str(&format!("{line:4} "));
    }

    let op = OpCode::from_byte(chunk.code[offset]);
    let next = match op {
        OpCode::Constant => constant_instruction(&mut out, op, chunk, offset),
        OpCode::ConstantLong => constant_long_instruction(&mut out, op, chunk, offset),
        OpCode::GetLocal
        | OpCode::SetLocal
        | OpCode::GetUpvalue
        | OpCode::SetUpvalue
        | OpCode::Call
        | OpCode::BuildList
        | OpCode::BuildMap
        | OpCode::Method => byte_instruction(&mut out, op, chunk, offset),
        OpCode::GetGlobal
        | OpCode::DefineGlobal
        | OpCode::SetGlobal
        | OpCode::GetProperty
        | OpCode::SetProperty
        | OpCode::GetSuper
        | OpCode::Class
        | OpCode::Import
        | OpCode::Export => constant_instruction(&mut out, op, chunk, offset),
        OpCode::ImportFrom => import_from_instruction(&mut out, chunk, offset),
        OpCode::Invoke | OpCode::SuperInvoke => invoke_instruction(&mut out, op, chunk, offset),
        OpCode::Jump | OpCode::JumpIfFalse => jump_instruction(&mut out, op, chunk, offset, 1),
        OpCode::Loop => jump_instruction(&mut out, op, chunk, offset, -1),
        OpCode::Closure => closure_instruction(&mut out, chunk, offset),
        _ => simple_instruction(&mut out, op, offset),
    };
    (out, next)
}

fn simple_instruction(out: &mut String, op: OpCode, offset: usize) -> usize {
    out.push_str(&op.to_string());
    offset + 1
}

fn byte_instruction(out: &mut String, op: OpCode, chunk: &Chunk, offset: usize) -> usize {
    let slot = chunk.code[offset + 1];
    out.push_str(&format!("{op:<16} {slot:4}"));
    offset + 2
}

fn constant_instruction(out: &mut String, op: OpCode, chunk: &Chunk, offset: usize) -> usize {
    let index = chunk.code[offset + 1] as usize;
    out.push_str(&format!("{op:<16} {index:4} '{}'", format_value(&chunk.constants[index])));
    offset + 2
}

fn import_from_instruction(out: &mut String, chunk: &Chunk, offset: usize) -> usize {
    let path_index = chunk.code[offset + 1] as usize;
    let name_index = chunk.code[offset + 2] as usize;
    out.push_str(&format!(
        "{:<16} {:4} '{}' {:4} '{}'",
        OpCode::ImportFrom,
        path_index,
        format_value(&chunk.constants[path_index]),
        name_index,
        format_value(&chunk.constants[name_index]),
    ));
    offset + 3
}

fn constant_long_instruction(out: &mut String, op: OpCode, chunk: &Chunk, offset: usize) -> usize {
    let index = u32::from_le_bytes([chunk.code[offset + 1], chunk.code[offset + 2], chunk.code[offset + 3], 0]) as usize;
    out.push_str(&format!("{op:<16} {index:4} '{}'", format_value(&chunk.constants[index])));
    offset + 4
}

fn jump_instruction(out: &mut String, op: OpCode, chunk: &Chunk, offset: usize, sign: i32) -> usize {
    let jump = u16::from_be_bytes([chunk.code[offset + 1], chunk.code[offset + 2]]);
    let target = offset as i64 + 3 + sign as i64 * jump as i64;
    out.push_str(&format!("{op:<16} {offset:4} -> {target}"));
    offset + 3
}

fn invoke_instruction(out: &mut String, op: OpCode, chunk: &Chunk, offset: usize) -> usize {
    let index = chunk.code[offset + 1] as usize;
    let arg_count = chunk.code[offset + 2];
    out.push_str(&format!("{op:<16} ({arg_count} args) {index:4} '{}'", format_value(&chunk.constants[index])));
    offset + 3
}

fn closure_instruction(out: &mut String, chunk: &Chunk, offset: usize) -> usize {
    let mut offset = offset + 1;
    let index = chunk.code[offset] as usize;
    offset += 1;
    out.push_str(&format!("{:<16} {index:4} '{}'", OpCode::Closure, format_value(&chunk.constants[index])));

    let upvalue_count = match &chunk.constants[index] {
        Value::Obj(ptr) => unsafe {
            if (**ptr).obj_type == crate::object::ObjType::Function {
                (*crate::object::as_function(*ptr)).upvalue_count
            } else {
                0
            }
        },
        _ => 0,
    };
    for _ in 0..upvalue_count {
        let is_local = chunk.code[offset];
        let slot = chunk.code[offset + 1];
        out.push_str(&format!(
            "\n{:04}      |                     {} {slot}",
            offset,
            if is_local == 1 { "local" } else { "upvalue" }
        ));
        offset += 2;
    }
    offset
}

fn format_value(value: &Value) -> String {
    match value {
        Value::Nil => "nil".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => crate::value::format_number(*n),
        Value::Error => "error".to_string(),
        Value::Obj(ptr) => unsafe {
            match (**ptr).obj_type {
                crate::object::ObjType::String => (*crate::object::as_string(*ptr)).as_str().to_string(),
                crate::object::ObjType::Function => match (*crate::object::as_function(*ptr)).name_str() {
                    Some(name) => format!("<fn {name}>"),
                    None => "<script>".to_string(),
                },
                _ => "<obj>".to_string(),
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disassembles_a_constant_instruction() {
        let mut chunk = Chunk::new();
        chunk.write_constant(Value::Number(1.2), 1);
        chunk.write_op(OpCode::Return, 1);
        let (line, next) = disassemble_instruction(&chunk, 0);
        assert!(line.contains("Constant"));
        assert_eq!(next, 2);
    }

    #[test]
    fn disassembles_a_simple_instruction() {
        let mut chunk = Chunk::new();
        chunk.write_op(OpCode::Return, 1);
        let (line, next) = disassemble_instruction(&chunk, 0);
        assert!(line.contains("Return"));
        assert_eq!(next, 1);
    }
}
