//! Human-readable bytecode disassembly, used by the --print-code and
//! --trace debug flags.

use super::{Chunk, Heap, OpCode};
use std::fmt::Write;

/// Disassemble a whole chunk under a header.
pub fn disassemble_chunk(heap: &Heap, chunk: &Chunk, name: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "== {} ==", name);
    let mut offset = 0;
    while offset < chunk.code.len() {
        offset = disassemble_instruction(heap, chunk, offset, &mut out);
    }
    out
}

/// Disassemble one instruction, appending to `out`; returns the offset
/// of the next instruction.
pub fn disassemble_instruction(
    heap: &Heap,
    chunk: &Chunk,
    offset: usize,
    out: &mut String,
) -> usize {
    let _ = write!(out, "{:04} ", offset);
    if offset > 0 && chunk.lines[offset] == chunk.lines[offset - 1] {
        let _ = write!(out, "   | ");
    } else {
        let _ = write!(out, "{:4} ", chunk.lines[offset]);
    }

    let byte = chunk.code[offset];
    let Some(op) = OpCode::from_byte(byte) else {
        let _ = writeln!(out, "Unknown opcode {}", byte);
        return offset + 1;
    };

    match op {
        OpCode::Constant
        | OpCode::GetGlobal
        | OpCode::DefineGlobal
        | OpCode::SetGlobal
        | OpCode::GetProperty
        | OpCode::SetProperty
        | OpCode::GetSuper
        | OpCode::Class
        | OpCode::Method => constant_instruction(heap, chunk, op, offset, out),
        OpCode::GetLocal
        | OpCode::SetLocal
        | OpCode::GetUpvalue
        | OpCode::SetUpvalue
        | OpCode::Call => byte_instruction(chunk, op, offset, out),
        OpCode::Jump | OpCode::JumpIfFalse => jump_instruction(chunk, op, 1, offset, out),
        OpCode::Loop => jump_instruction(chunk, op, -1, offset, out),
        OpCode::Invoke | OpCode::SuperInvoke => invoke_instruction(heap, chunk, op, offset, out),
        OpCode::Closure => closure_instruction(heap, chunk, offset, out),
        _ => {
            let _ = writeln!(out, "{}", op.name());
            offset + 1
        }
    }
}

fn constant_value(heap: &Heap, chunk: &Chunk, index: u8) -> String {
    heap.format_value(chunk.constants[index as usize])
}

fn constant_instruction(
    heap: &Heap,
    chunk: &Chunk,
    op: OpCode,
    offset: usize,
    out: &mut String,
) -> usize {
    let index = chunk.code[offset + 1];
    let _ = writeln!(
        out,
        "{:<16} {:4} '{}'",
        op.name(),
        index,
        constant_value(heap, chunk, index)
    );
    offset + 2
}

fn byte_instruction(chunk: &Chunk, op: OpCode, offset: usize, out: &mut String) -> usize {
    let slot = chunk.code[offset + 1];
    let _ = writeln!(out, "{:<16} {:4}", op.name(), slot);
    offset + 2
}

fn jump_instruction(chunk: &Chunk, op: OpCode, sign: i64, offset: usize, out: &mut String) -> usize {
    let jump = ((chunk.code[offset + 1] as u16) << 8) | chunk.code[offset + 2] as u16;
    let target = offset as i64 + 3 + sign * jump as i64;
    let _ = writeln!(out, "{:<16} {:4} -> {}", op.name(), offset, target);
    offset + 3
}

fn invoke_instruction(
    heap: &Heap,
    chunk: &Chunk,
    op: OpCode,
    offset: usize,
    out: &mut String,
) -> usize {
    let index = chunk.code[offset + 1];
    let argc = chunk.code[offset + 2];
    let _ = writeln!(
        out,
        "{:<16} ({} args) {:4} '{}'",
        op.name(),
        argc,
        index,
        constant_value(heap, chunk, index)
    );
    offset + 3
}

fn closure_instruction(heap: &Heap, chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    let index = chunk.code[offset + 1];
    let _ = writeln!(
        out,
        "{:<16} {:4} {}",
        "CLOSURE",
        index,
        constant_value(heap, chunk, index)
    );

    // The operand bytes that follow describe each captured upvalue.
    let function = chunk.constants[index as usize]
        .as_obj()
        .expect("closure constant");
    let upvalue_count = heap.function(function).upvalue_count;
    let mut offset = offset + 2;
    for _ in 0..upvalue_count {
        let is_local = chunk.code[offset];
        let slot = chunk.code[offset + 1];
        let _ = writeln!(
            out,
            "{:04}    |                     {} {}",
            offset,
            if is_local == 1 { "local" } else { "upvalue" },
            slot
        );
        offset += 2;
    }
    offset
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler;
    use crate::vm::{ObjKind, Value};

    #[test]
    fn test_disassemble_simple_chunk() {
        let mut heap = Heap::new();
        let function = compiler::compile("print 1 + 2;", &mut heap).unwrap();
        let listing = disassemble_chunk(&heap, &function.chunk, "script");

        assert!(listing.starts_with("== script ==\n"));
        assert!(listing.contains("CONSTANT"));
        assert!(listing.contains("'1'"));
        assert!(listing.contains("ADD"));
        assert!(listing.contains("PRINT"));
        assert!(listing.contains("RETURN"));
    }

    #[test]
    fn test_disassemble_jump_targets() {
        let mut heap = Heap::new();
        let function = compiler::compile("while (true) { print 1; }", &mut heap).unwrap();
        let listing = disassemble_chunk(&heap, &function.chunk, "script");
        assert!(listing.contains("JUMP_IF_FALSE"));
        assert!(listing.contains("LOOP"));
        assert!(listing.contains("->"));
    }

    #[test]
    fn test_disassemble_closure_upvalues() {
        let mut heap = Heap::new();
        let function = compiler::compile(
            "fun outer() { var x = 1; fun inner() { return x; } }",
            &mut heap,
        )
        .unwrap();
        let outer = function
            .chunk
            .constants
            .iter()
            .filter_map(Value::as_obj)
            .find(|r| matches!(&heap.get(*r).kind, ObjKind::Function(_)))
            .unwrap();
        let outer_chunk = heap.function(outer).chunk.clone();
        let listing = disassemble_chunk(&heap, &outer_chunk, "outer");
        assert!(listing.contains("CLOSURE"));
        assert!(listing.contains("local 1"));
    }
}
