//! Bytecode disassembler
//!
//! Converts a [`Bytecode`] back to a human-readable listing. Used by tests
//! and by `bite --disasm` (bite-cli) for debugging compiler output. Takes
//! the [`Heap`] alongside the bytecode because a `CLOSURE` instruction's
//! trailing upvalue descriptor bytes are sized by the pointed-to
//! [`Function`](crate::object::Function), not by anything in the
//! instruction stream itself.

use super::{Bytecode, Opcode};
use crate::object::{Heap, Object};
use crate::value::Value;
use std::fmt::Write;

pub fn disassemble(bytecode: &Bytecode, heap: &Heap) -> String {
    let mut output = String::new();

    if !bytecode.constants.is_empty() {
        writeln!(output, "=== Constants ===").unwrap();
        for (idx, constant) in bytecode.constants.iter().enumerate() {
            writeln!(output, "{}: {}", idx, format_constant(constant, heap)).unwrap();
        }
        writeln!(output).unwrap();
    }

    writeln!(output, "=== Instructions ===").unwrap();
    let mut offset = 0;
    while offset < bytecode.instructions.len() {
        let line = disassemble_instruction(bytecode, heap, &mut offset);
        writeln!(output, "{}", line).unwrap();
    }

    output
}

fn format_constant(value: &Value, heap: &Heap) -> String {
    match value {
        Value::Object(id) => match heap.get(*id) {
            Object::Function(f) => format!("<fn {:?}/{}>", f.name, f.arity),
            _ => value.to_string(),
        },
        other => other.to_string(),
    }
}

fn disassemble_instruction(bytecode: &Bytecode, heap: &Heap, offset: &mut usize) -> String {
    let start_offset = *offset;

    let byte = bytecode.instructions[*offset];
    *offset += 1;

    let opcode = match Opcode::from_u8(byte) {
        Some(op) => op,
        None => return format!("{:04}  <invalid opcode: {:#04x}>", start_offset, byte),
    };

    use Opcode::*;
    match opcode {
        Jump | JumpIfFalse | JumpIfTrue | Loop => {
            let jump_offset = read_i16(bytecode, offset);
            let target = (*offset as i32 + jump_offset as i32) as usize;
            format!(
                "{:04}  {:?} {} (-> {:04})",
                start_offset, opcode, jump_offset, target
            )
        }
        Closure => {
            let const_idx = read_u8(bytecode, offset);
            let upvalue_count = match bytecode.constants.get(const_idx as usize) {
                Some(Value::Object(id)) => match heap.get(*id) {
                    Object::Function(f) => f.upvalue_count,
                    _ => 0,
                },
                _ => 0,
            };
            let mut descriptors = Vec::with_capacity(upvalue_count);
            for _ in 0..upvalue_count {
                let is_local = read_u8(bytecode, offset);
                let index = read_u8(bytecode, offset);
                descriptors.push(format!("{}{}", if is_local != 0 { "local:" } else { "up:" }, index));
            }
            format!(
                "{:04}  Closure {} [{}]",
                start_offset,
                const_idx,
                descriptors.join(", ")
            )
        }
        Field => {
            let name_idx = read_u8(bytecode, offset);
            let attrs = read_u8(bytecode, offset);
            format!(
                "{:04}  Field {} attrs={:#07b}",
                start_offset, name_idx, attrs
            )
        }
        op if op.operand_len() == 1 => {
            let operand = read_u8(bytecode, offset);
            format!("{:04}  {:?} {}", start_offset, op, operand)
        }
        op => format!("{:04}  {:?}", start_offset, op),
    }
}

fn read_u8(bytecode: &Bytecode, offset: &mut usize) -> u8 {
    let value = bytecode.instructions[*offset];
    *offset += 1;
    value
}

fn read_u16(bytecode: &Bytecode, offset: &mut usize) -> u16 {
    let high = bytecode.instructions[*offset] as u16;
    let low = bytecode.instructions[*offset + 1] as u16;
    *offset += 2;
    (high << 8) | low
}

fn read_i16(bytecode: &Bytecode, offset: &mut usize) -> i16 {
    read_u16(bytecode, offset) as i16
}
