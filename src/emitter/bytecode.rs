use std::fmt::Write as _;

use crate::error::CompileError;

/// The VM's opcode set.
///
/// Every instruction is exactly 9 bytes - one opcode byte followed by an 8-byte big-endian IEEE-754 double
/// immediate - except for the argument-less opcodes (see `is_single_byte`), which are 1 byte, and `PUSHS`, which is
/// `[opcode][8-byte length as double][length bytes of UTF-8]`.
///
/// Jump destinations and variable slots are encoded as doubles like every other immediate; the VM reinterprets
/// them as integers where appropriate. That wastes bytes but keeps a single encoder for all immediates, and the
/// 8-byte big-endian double encoding must be preserved for VM compatibility.
#[derive(strum_macros::FromRepr, strum_macros::EnumIter, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Op {
	Nop = 0x00,

	/// Store top-of-stack into a global slot.
	Pushg = 0x10,
	/// Load a global slot onto the stack. The push/pop naming is historic: in r-value position the VM treats the
	/// "pop" family as loads.
	Popg = 0x11,
	/// Store top-of-stack into a local slot.
	Pushl = 0x12,
	/// Load a local slot onto the stack.
	Popl = 0x13,
	/// Push a numeric literal.
	Push = 0x14,
	/// Push a string literal; variable-width instruction carrying the byte length and the UTF-8 bytes.
	Pushs = 0x15,
	/// Gather the top n stack values into an array and push it.
	Data = 0x16,
	/// Push a numeric literal in array-subscript position.
	Pusha = 0x17,
	/// Marker for a subscript loaded from a variable.
	Pushas = 0x18,

	Eq = 0x20,
	Lt = 0x21,
	Gt = 0x22,
	Lteq = 0x23,
	Gteq = 0x24,
	Noteq = 0x25,

	Add = 0x30,
	Neg = 0x31,
	Sub = 0x32,
	Mul = 0x33,
	Div = 0x34,
	And = 0x35,
	Or = 0x36,
	Not = 0x37,
	/// String concatenation. The immediate is a mode byte, reserved and always 0.
	Concat = 0x38,
	Mod = 0x39,

	/// Jump to the immediate address if top-of-stack is zero.
	Jz = 0x40,
	/// Unconditional jump.
	Jmp = 0x41,
	/// Return: pop the stored return address and jump there. With immediate 1, one return value stays on the
	/// stack for the caller.
	Jfs = 0x42,
	/// Call a user-defined procedure at the immediate address.
	Jmpfun = 0x43,
	/// Invoke an externally registered function; its name is pushed as a string just before, and the immediate is
	/// the argument count.
	Call = 0x44,

	Print = 0x50,
	Argtype = 0x51,
	Len = 0x52,
}

impl Op {
	/// Whether this opcode is emitted as a single byte with no immediate.
	#[must_use]
	pub const fn is_single_byte(self) -> bool {
		matches!(
			self,
			Self::Nop
				| Self::Pushas
				| Self::Eq
				| Self::Lt
				| Self::Gt
				| Self::Lteq
				| Self::Gteq
				| Self::Noteq
				| Self::Add
				| Self::Neg
				| Self::Sub
				| Self::Mul
				| Self::Div
				| Self::And
				| Self::Or
				| Self::Not
				| Self::Mod
				| Self::Print
				| Self::Argtype
				| Self::Len
		)
	}
}

impl std::fmt::Display for Op {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", format!("{self:?}").to_uppercase())
	}
}

/// The largest value an immediate may hold before float packing: `0xFFFFFFFF`, i.e. 32 bits of integer range.
/// Anything larger is an encoding overflow.
pub const MAX_IMMEDIATE: f64 = 4_294_967_295.0;

/// The placeholder immediate written for a jump whose target is not yet known. Every sentinel must be backpatched
/// before compilation ends; a surviving sentinel in finalized output is a compiler bug.
pub const JUMP_SENTINEL: f64 = MAX_IMMEDIATE;

/// The payload decoded from one instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
	/// A single-byte opcode; no immediate.
	None,
	/// The 8-byte double immediate.
	Immediate(f64),
	/// The string carried by a `PUSHS`.
	Text(String),
}

/// One decoded instruction, positioned at its byte offset in the stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
	/// Byte offset of the opcode in the stream.
	pub addr: usize,
	pub op: Op,
	pub payload: Payload,
}

impl Instruction {
	/// The immediate of this instruction, or 0 when it carries none. Convenient for jump-target assertions.
	#[must_use]
	pub fn immediate(&self) -> f64 {
		match self.payload {
			Payload::Immediate(value) => value,
			_ => 0.0,
		}
	}
}

impl std::fmt::Display for Instruction {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match &self.payload {
			Payload::None => write!(f, "@ {}\t{}", self.addr, self.op),
			Payload::Immediate(value) => write!(f, "@ {}\t{}\t{}", self.addr, self.op, value),
			Payload::Text(text) => write!(f, "@ {}\t{}\t\"{}\"", self.addr, self.op, text),
		}
	}
}

/// Decodes a byte stream back into instructions. This is the inverse of emission: running it over compiler output
/// must reproduce every opcode and immediate, which the tests lean on heavily.
///
/// # Errors
/// A `CompileError::Codegen` when a byte is no known opcode or the stream ends in the middle of an instruction.
pub fn decode(bytes: &[u8]) -> anyhow::Result<Vec<Instruction>> {
	let mut instructions = Vec::new();
	let mut addr = 0;

	while let Some(&opcode) = bytes.get(addr) {
		let op = Op::from_repr(opcode)
			.ok_or_else(|| CompileError::codegen(format!("Unknown opcode 0x{opcode:02x} at byte {addr}")))?;

		if op.is_single_byte() {
			instructions.push(Instruction { addr, op, payload: Payload::None });
			addr += 1;
			continue;
		}

		let immediate_bytes: [u8; 8] = bytes
			.get(addr + 1..addr + 9)
			.and_then(|slice| slice.try_into().ok())
			.ok_or_else(|| CompileError::codegen(format!("Truncated instruction stream at byte {addr}")))?;
		let immediate = f64::from_be_bytes(immediate_bytes);

		if op == Op::Pushs {
			#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
			let length = immediate as usize;
			let text = bytes
				.get(addr + 9..addr + 9 + length)
				.ok_or_else(|| CompileError::codegen(format!("Truncated string at byte {addr}")))?;
			instructions.push(Instruction {
				addr,
				op,
				payload: Payload::Text(String::from_utf8_lossy(text).into_owned()),
			});
			addr += 9 + length;
		} else {
			instructions.push(Instruction { addr, op, payload: Payload::Immediate(immediate) });
			addr += 9;
		}
	}

	Ok(instructions)
}

/// Renders a byte stream as a human-readable listing, one instruction per line. Used by the CLI in debug mode.
///
/// # Errors
/// The same errors as `decode`.
pub fn disassemble(bytes: &[u8]) -> anyhow::Result<String> {
	let mut listing = String::new();
	for (line, instruction) in decode(bytes)?.iter().enumerate() {
		let _ = writeln!(listing, "{line} {instruction}");
	}
	Ok(listing)
}
