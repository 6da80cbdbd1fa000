use std::fmt::Write as _;

use colored::Colorize as _;

use crate::{
	emitter::{
		bytecode::{Op, JUMP_SENTINEL, MAX_IMMEDIATE},
		symbols::{ScopeChain, StaticValue, Symbol},
	},
	error::CompileError,
	lexer::Token,
	parser::nodes::{
		AssignTarget, AssignmentNode, ArrayNode, CallNode, ConditionPos, ExprOp, ExpressionNode, IfNode, LoopNode,
		Node, ProcNode, ReturnNode, TermNode, TermOp, UnaryNode, UnarySign, ValueNode,
	},
};

/// The opcode set and the instruction encoding/decoding.
pub mod bytecode;
/// Symbol entries and the scope chain.
pub mod symbols;

/// Counters collected during emission, reported by the CLI in debug mode.
#[derive(Debug, Default, Clone, Copy)]
pub struct Stats {
	/// The deepest scope nesting reached.
	pub max_scope: usize,
	/// How many array literals were gathered with `DATA`.
	pub arrays: usize,
	/// How many symbols were declared.
	pub symbols: usize,
	/// The longest string literal pushed.
	pub max_strlen: usize,
}

/// The single-pass bytecode emitter. Walks the parser's statement nodes in order, maintains the scoped symbol
/// table and a flat output byte vector, and patches forward-jump targets in place once they are known.
///
/// The byte vector is append-only with one exception: backpatching overwrites the 8 immediate bytes of a
/// previously emitted jump. Every jump written with the sentinel immediate is patched before the construct that
/// emitted it finishes, so finalized output never contains a sentinel.
pub struct CodeGenerator {
	scopes: ScopeChain,
	bytes_out: Vec<u8>,
	/// Reserved concatenation mode byte; always 0.
	concat_mode: u8,
	/// Patch slots of `exit` jumps waiting for the end of the innermost loop. Saved and restored around nested
	/// loops so an inner exit cannot escape its own loop frame.
	loop_patches: Vec<usize>,
	/// Names registered with `extern func`, callable through the VM's external call interface.
	external_symbols: Vec<String>,
	/// Whether the procedure currently being emitted is a `func`. Decides what a `return` does with its value.
	proc_is_func: bool,
	stats: Stats,
}

/// Widens a byte offset or slot index into the universal immediate representation.
#[allow(clippy::cast_precision_loss)]
fn as_immediate(value: usize) -> f64 {
	value as f64
}

impl Default for CodeGenerator {
	fn default() -> Self {
		Self::new()
	}
}

impl CodeGenerator {
	/// Creates an emitter for one compilation unit.
	#[must_use]
	pub fn new() -> Self {
		Self {
			scopes: ScopeChain::new(),
			bytes_out: Vec::new(),
			concat_mode: 0,
			loop_patches: Vec::new(),
			external_symbols: Vec::new(),
			proc_is_func: false,
			stats: Stats::default(),
		}
	}

	/// Lowers one top-level statement into the output vector.
	///
	/// # Errors
	/// A `CompileError::Codegen` for any semantic error: unknown symbols, modifying a constant, argument count
	/// mismatches, duplicate procedures, or an immediate that exceeds the encodable range.
	pub fn generate(&mut self, node: &Node) -> anyhow::Result<()> {
		self.visit(node)?;
		Ok(())
	}

	/// The bytes emitted so far.
	#[must_use]
	pub fn bytes(&self) -> &[u8] {
		&self.bytes_out
	}

	/// The counters collected during emission.
	#[must_use]
	pub const fn stats(&self) -> &Stats {
		&self.stats
	}

	/// Returns the output as decimal byte strings, which is the VM's wire format over argv.
	#[must_use]
	pub fn finalize(&self) -> Vec<String> {
		self.bytes_out.iter().map(ToString::to_string).collect()
	}

	/// Returns the output run-length encoded as a comma-separated string of `count,byte` pairs.
	#[must_use]
	pub fn finalize_rle(&self) -> String {
		let mut out = String::new();
		let mut iter = self.bytes_out.iter();
		let Some(&first) = iter.next() else {
			return out;
		};
		let mut last = first;
		let mut count = 1usize;
		for &byte in iter {
			if byte == last {
				count += 1;
			} else {
				let _ = write!(out, "{count},{last},");
				last = byte;
				count = 1;
			}
		}
		let _ = write!(out, "{count},{last}");
		out
	}

	/// Dispatches one node to its lowering. The returned `StaticValue` is the comptime view of what the lowered
	/// code leaves on the stack, used for `ADD`/`CONCAT` selection and recorded as a variable's initial value.
	fn visit(&mut self, node: &Node) -> anyhow::Result<StaticValue> {
		match node {
			Node::Assignment(assignment) => self.visit_assignment(assignment),
			Node::Term(term) => self.visit_term(term),
			Node::Expression(expression) => self.visit_expression(expression),
			Node::Value(value) => self.visit_value(value, false),
			Node::Unary(unary) => self.visit_unary(unary),
			Node::If(if_node) => self.visit_if(if_node),
			Node::Loop(loop_node) => self.visit_loop(loop_node),
			Node::Exit => self.visit_exit(),
			Node::Array(array) => self.visit_array(array),
			Node::Sub(proc) => self.visit_proc(proc, false),
			Node::Func(proc) => self.visit_proc(proc, true),
			Node::Return(ret) => self.visit_return(ret),
			Node::Call(call) => self.visit_call(call),
			Node::Extern(ext) => {
				let name = ext.identifier.text();
				if !self.external_symbols.iter().any(|registered| registered == name) {
					self.external_symbols.push(name.to_owned());
				}
				Ok(StaticValue::Unknown)
			},
			// Imports were spliced away by the parser.
			Node::Import(_) => Ok(StaticValue::Unknown),
		}
	}

	/// Lowers a declaration or reassignment: the right-hand side first, then the store.
	fn visit_assignment(&mut self, node: &AssignmentNode) -> anyhow::Result<StaticValue> {
		let value = self.visit(&node.value)?;

		match &node.target {
			AssignTarget::Element { name, index } => {
				// a[i] = expr: the VM pops (value, index, array) and stores. No symbol table work here; the array
				// variable itself must already exist.
				self.visit_element(name, index, true)?;
				Ok(StaticValue::Unknown)
			},
			AssignTarget::Variable(token) => {
				let name = token.text();
				if !node.modify {
					self.scopes.insert(Symbol::Variable {
						name: name.to_owned(),
						value: value.clone(),
						is_const: node.is_const,
					});
					self.stats.symbols += 1;
				}

				let (slot, is_global) = match self.scopes.lookup(name) {
					Some(resolved) => {
						if node.modify && resolved.symbol.is_const() {
							return Err(CompileError::codegen(format!("Cannot modify constant {}", name.bold().cyan())).into());
						}
						(resolved.slot, resolved.is_global())
					},
					None => return Err(CompileError::codegen(format!("Symbol {} not found", name.bold().cyan())).into()),
				};

				self.emit_operation(if is_global { Op::Pushg } else { Op::Pushl }, Some(as_immediate(slot)))?;
				Ok(value)
			},
		}
	}

	/// Lowers arithmetic: left, right, then the opcode. `+` turns into `CONCAT` unless both operands are
	/// statically numeric; everything else keeps its opcode and simply loses the folded value when an operand
	/// isn't known.
	fn visit_term(&mut self, node: &TermNode) -> anyhow::Result<StaticValue> {
		let left = self.visit(&node.left)?;
		let right = self.visit(&node.right)?;
		let folded = match (left.as_number(), right.as_number()) {
			(Some(left), Some(right)) => Some((left, right)),
			_ => None,
		};

		match node.op {
			TermOp::Add => {
				if let Some((left, right)) = folded {
					self.emit_operation(Op::Add, None)?;
					Ok(StaticValue::Number(left + right))
				} else {
					// Mixed addition concatenates.
					self.emit_operation(Op::Concat, Some(f64::from(self.concat_mode)))?;
					Ok(StaticValue::Unknown)
				}
			},
			TermOp::Sub => {
				self.emit_operation(Op::Sub, None)?;
				Ok(folded.map_or(StaticValue::Unknown, |(left, right)| StaticValue::Number(left - right)))
			},
			TermOp::Mul => {
				self.emit_operation(Op::Mul, None)?;
				Ok(folded.map_or(StaticValue::Unknown, |(left, right)| StaticValue::Number(left * right)))
			},
			TermOp::Div => {
				self.emit_operation(Op::Div, None)?;
				Ok(folded.map_or(StaticValue::Unknown, |(left, right)| StaticValue::Number(left / right)))
			},
			TermOp::Mod => {
				self.emit_operation(Op::Mod, None)?;
				Ok(folded.map_or(StaticValue::Unknown, |(left, right)| StaticValue::Number(left % right)))
			},
		}
	}

	/// Lowers a comparison or logical operation: left, right, opcode.
	fn visit_expression(&mut self, node: &ExpressionNode) -> anyhow::Result<StaticValue> {
		self.visit(&node.left)?;
		self.visit(&node.right)?;
		let op = match node.op {
			ExprOp::Equal => Op::Eq,
			ExprOp::NotEqual => Op::Noteq,
			ExprOp::LessThan => Op::Lt,
			ExprOp::LessThanEqual => Op::Lteq,
			ExprOp::GreaterThan => Op::Gt,
			ExprOp::GreaterThanEqual => Op::Gteq,
			ExprOp::And => Op::And,
			ExprOp::Or => Op::Or,
		};
		self.emit_operation(op, None)?;
		Ok(StaticValue::Unknown)
	}

	/// Lowers a value in r-value position. `in_subscript` is set only when this value is, by itself, the index
	/// expression of an array element: a numeric literal there becomes `PUSHA` and a bare identifier is followed
	/// by `PUSHAS`; computed indices lower as ordinary r-values.
	fn visit_value(&mut self, value: &ValueNode, in_subscript: bool) -> anyhow::Result<StaticValue> {
		match value {
			ValueNode::Number(number) => {
				self.emit_operation(if in_subscript { Op::Pusha } else { Op::Push }, Some(*number))?;
				Ok(StaticValue::Number(*number))
			},
			ValueNode::Text(text) => {
				self.emit_string_operation(Op::Pushs, text)?;
				if self.stats.max_strlen < text.len() {
					self.stats.max_strlen = text.len();
				}
				Ok(StaticValue::Text(text.clone()))
			},
			ValueNode::Identifier(token) => {
				let name = token.text();
				let (slot, is_global, value) = match self.scopes.lookup(name) {
					Some(resolved) => {
						let value = match resolved.symbol {
							Symbol::Variable { value, .. } => value.clone(),
							Symbol::Procedure { .. } => StaticValue::Unknown,
						};
						(resolved.slot, resolved.is_global(), value)
					},
					None => return Err(CompileError::codegen(format!("Unknown symbol {}", name.bold().cyan())).into()),
				};
				self.emit_operation(if is_global { Op::Popg } else { Op::Popl }, Some(as_immediate(slot)))?;
				if in_subscript {
					// Subscript held in a variable; the VM resolves it when indexing.
					self.emit_operation(Op::Pushas, None)?;
				}
				Ok(value)
			},
			ValueNode::Element { name, index } => self.visit_element(name, index, false),
		}
	}

	/// Lowers an array element access: the index expression first, then the array variable itself - loaded
	/// (`POPG`/`POPL`) in r-value position, stored (`PUSHG`/`PUSHL`) when this is the target of an indexed
	/// assignment.
	fn visit_element(&mut self, name: &Token, index: &Node, store: bool) -> anyhow::Result<StaticValue> {
		match index {
			Node::Value(value) => self.visit_value(value, true)?,
			other => self.visit(other)?,
		};

		let (slot, is_global) = match self.scopes.lookup(name.text()) {
			Some(resolved) => (resolved.slot, resolved.is_global()),
			None => return Err(CompileError::codegen(format!("Unknown symbol {}", name.text().bold().cyan())).into()),
		};
		let op = match (store, is_global) {
			(false, true) => Op::Popg,
			(false, false) => Op::Popl,
			(true, true) => Op::Pushg,
			(true, false) => Op::Pushl,
		};
		self.emit_operation(op, Some(as_immediate(slot)))?;

		// A literal subscript keeps the element numeric as far as the type tracker is concerned.
		Ok(match index {
			Node::Value(ValueNode::Number(number)) => StaticValue::Number(*number),
			_ => StaticValue::Unknown,
		})
	}

	/// Lowers a unary operation: the wrapped value, then `NEG`/`NOT`. A leading `+` emits nothing. Unary results
	/// count as numeric for operator selection.
	fn visit_unary(&mut self, node: &UnaryNode) -> anyhow::Result<StaticValue> {
		self.visit(&node.value)?;
		match node.sign {
			UnarySign::Minus => self.emit_operation(Op::Neg, None)?,
			UnarySign::Not => self.emit_operation(Op::Not, None)?,
			UnarySign::Plus => {},
		}
		Ok(StaticValue::Number(0.0))
	}

	/// Lowers an if/elseif/else chain.
	///
	/// Each condition is followed by a `JZ` past its branch; each taken branch ends in a `JMP` to the end of the
	/// whole construct. The patch slots are kept on a small stack and resolved as soon as their target address
	/// exists; whatever remains when the chain ends is patched to the first byte after it.
	fn visit_if(&mut self, node: &IfNode) -> anyhow::Result<StaticValue> {
		let mut patches: Vec<usize> = Vec::new();
		let mut jz_last = None;

		self.visit(&node.condition)?;
		patches.push(self.bytes_out.len());
		self.emit_operation(Op::Jz, Some(JUMP_SENTINEL))?;

		self.open_scope();
		for statement in &node.body {
			self.visit(statement)?;
		}

		if !node.elseifs.is_empty() {
			// The root JZ skips to the first elseif condition, which starts right after the then-body's exit JMP.
			let past_jump = self.bytes_out.len() + 9;
			if let Some(head) = patches.pop() {
				self.backpatch(head, past_jump);
			}
			patches.push(self.bytes_out.len());
			self.emit_operation(Op::Jmp, Some(JUMP_SENTINEL))?;

			let last = node.elseifs.len() - 1;
			for (count, elseif) in node.elseifs.iter().enumerate() {
				self.visit(&elseif.condition)?;
				patches.push(self.bytes_out.len());
				if node.else_body.is_some() && count == last {
					// The last elseif's JZ needs re-aiming at the else entry once that exists.
					jz_last = Some(self.bytes_out.len());
				}
				self.emit_operation(Op::Jz, Some(JUMP_SENTINEL))?;

				for statement in &elseif.body {
					self.visit(statement)?;
				}

				let past_branch = self.bytes_out.len() + 9;
				if let Some(head) = patches.pop() {
					self.backpatch(head, past_branch);
				}
				patches.push(self.bytes_out.len());
				self.emit_operation(Op::Jmp, Some(JUMP_SENTINEL))?;
			}

			if let Some(else_body) = &node.else_body {
				if let Some(jz) = jz_last {
					self.backpatch(jz, self.bytes_out.len() + 9);
				}
				patches.push(self.bytes_out.len());
				self.emit_operation(Op::Jmp, Some(JUMP_SENTINEL))?;
				for statement in else_body {
					self.visit(statement)?;
				}
				let endif = self.bytes_out.len();
				if let Some(head) = patches.pop() {
					self.backpatch(head, endif);
				}
			}
		} else if let Some(else_body) = &node.else_body {
			let past_jump = self.bytes_out.len() + 9;
			if let Some(head) = patches.pop() {
				self.backpatch(head, past_jump);
			}
			patches.push(self.bytes_out.len());
			self.emit_operation(Op::Jmp, Some(JUMP_SENTINEL))?;
			for statement in else_body {
				self.visit(statement)?;
			}
			let endif = self.bytes_out.len();
			if let Some(head) = patches.pop() {
				self.backpatch(head, endif);
			}
		}

		let past_chain = self.bytes_out.len();
		while let Some(head) = patches.pop() {
			self.backpatch(head, past_chain);
		}

		self.close_scope();
		Ok(StaticValue::Unknown)
	}

	/// Lowers a loop. Top-tested: condition at the loop head, `JZ` out, body, `JMP` back. Bottom-tested: body,
	/// condition, `JZ` back to the head - the loop continues while the condition is false and falls through when
	/// it turns true.
	fn visit_loop(&mut self, node: &LoopNode) -> anyhow::Result<StaticValue> {
		// Exits collected inside belong to this loop alone.
		let saved_patches = std::mem::take(&mut self.loop_patches);

		let past_loop = match node.condition_pos {
			ConditionPos::Top => {
				let loop_head = self.bytes_out.len();
				self.visit(&node.condition)?;
				let exit_jump = self.bytes_out.len();
				self.emit_operation(Op::Jz, Some(JUMP_SENTINEL))?;

				self.open_scope();
				for statement in &node.body {
					self.visit(statement)?;
				}
				self.emit_operation(Op::Jmp, Some(as_immediate(loop_head)))?;

				let past_loop = self.bytes_out.len();
				self.backpatch(exit_jump, past_loop);
				past_loop
			},
			ConditionPos::Bottom => {
				self.open_scope();
				let loop_head = self.bytes_out.len();
				for statement in &node.body {
					self.visit(statement)?;
				}
				self.visit(&node.condition)?;
				self.emit_operation(Op::Jz, Some(as_immediate(loop_head)))?;
				self.bytes_out.len()
			},
		};

		while let Some(head) = self.loop_patches.pop() {
			self.backpatch(head, past_loop);
		}
		self.loop_patches = saved_patches;

		self.close_scope();
		Ok(StaticValue::Unknown)
	}

	/// Lowers `exit`: an unconditional jump patched to the end of the innermost loop once that is known.
	fn visit_exit(&mut self) -> anyhow::Result<StaticValue> {
		self.loop_patches.push(self.bytes_out.len());
		self.emit_operation(Op::Jmp, Some(JUMP_SENTINEL))?;
		Ok(StaticValue::Unknown)
	}

	/// Lowers an array literal: every element as an ordinary r-value, then `DATA n` to gather them.
	fn visit_array(&mut self, node: &ArrayNode) -> anyhow::Result<StaticValue> {
		for value in &node.values {
			self.visit(value)?;
		}
		self.emit_operation(Op::Data, Some(as_immediate(node.values.len())))?;
		self.stats.arrays += 1;
		Ok(StaticValue::Unknown)
	}

	/// Lowers a `sub`/`func` declaration.
	///
	/// The body would execute wherever the declaration happens to sit, so it is guarded by a `JMP` over it,
	/// patched once the body ends. The procedure symbol (with the address right after the guard) goes into the
	/// global scope before the body is emitted, which is what lets the body call itself. Each formal argument gets
	/// a local slot and a `PUSHL (argc - index - 1)`: the caller pushed the actuals in source order, so popping
	/// them off the stack in reverse lands each one in the right slot.
	fn visit_proc(&mut self, node: &ProcNode, is_func: bool) -> anyhow::Result<StaticValue> {
		let name = node.name.text();
		if self.scopes.lookup_global(name).is_some() || self.external_symbols.iter().any(|registered| registered == name) {
			return Err(CompileError::codegen(format!("Procedure {} is already declared", name.bold().cyan())).into());
		}

		let proc_head = self.bytes_out.len();
		self.emit_operation(Op::Jmp, Some(JUMP_SENTINEL))?;

		self.scopes.insert_global(Symbol::Procedure {
			name: name.to_owned(),
			args: node.args.len(),
			addr: self.bytes_out.len(),
		});
		self.stats.symbols += 1;

		self.scopes.open_proc_scope();
		if self.stats.max_scope < self.scopes.depth() {
			self.stats.max_scope = self.scopes.depth();
		}

		let argc = node.args.len();
		for (index, arg) in node.args.iter().enumerate() {
			// Formal arguments are assumed numeric for operator selection.
			self.scopes.insert(Symbol::Variable {
				name: arg.text().to_owned(),
				value: StaticValue::Number(as_immediate(index)),
				is_const: false,
			});
			self.stats.symbols += 1;
			self.emit_operation(Op::Pushl, Some(as_immediate(argc - index - 1)))?;
		}

		let was_func = std::mem::replace(&mut self.proc_is_func, is_func);
		for statement in &node.body {
			self.visit(statement)?;
		}
		self.proc_is_func = was_func;

		// Implicit trailing return for bodies that fall off the end.
		self.emit_operation(Op::Jfs, None)?;
		self.backpatch(proc_head, self.bytes_out.len());
		self.scopes.close_scope();
		Ok(StaticValue::Unknown)
	}

	/// Lowers `return`. Inside a func with a value: the value, then `JFS 1` to keep it on the stack for the
	/// caller. Everywhere else a bare `JFS`; a sub discards any value the parser may have collected.
	fn visit_return(&mut self, node: &ReturnNode) -> anyhow::Result<StaticValue> {
		if self.proc_is_func {
			if let Some(value) = &node.value {
				self.visit(value)?;
				self.emit_operation(Op::Jfs, Some(1.0))?;
				return Ok(StaticValue::Unknown);
			}
		}
		self.emit_operation(Op::Jfs, None)?;
		Ok(StaticValue::Unknown)
	}

	/// Lowers a call. Builtins take a single argument and emit their dedicated opcode. A known procedure gets its
	/// arguments in source order, the return address (`here + 18`: this `PUSH` plus the following `JMPFUN`), and
	/// the jump to its body. An extern symbol gets its arguments, its name as a string, and `CALL argc`.
	fn visit_call(&mut self, node: &CallNode) -> anyhow::Result<StaticValue> {
		let name = node.callee.text();
		let builtin = match name.to_lowercase().as_str() {
			"print" => Some(Op::Print),
			"argtype" => Some(Op::Argtype),
			"len" => Some(Op::Len),
			_ => None,
		};
		if let Some(op) = builtin {
			if node.args.len() != 1 {
				return Err(CompileError::codegen(format!(
					"The builtin {} expects exactly one argument, given {}",
					name.bold().cyan(),
					node.args.len()
				))
				.into());
			}
			self.visit(&node.args[0])?;
			self.emit_operation(op, None)?;
			return Ok(StaticValue::Unknown);
		}

		let procedure = match self.scopes.lookup_global(name) {
			Some(resolved) => match resolved.symbol {
				Symbol::Procedure { args, addr, .. } => Some((*args, *addr)),
				Symbol::Variable { .. } => {
					return Err(CompileError::codegen(format!("Symbol {} is not callable", name.bold().cyan())).into());
				},
			},
			None => None,
		};

		if let Some((args, addr)) = procedure {
			if args != node.args.len() {
				return Err(CompileError::codegen(format!(
					"Insufficient amount of arguments for procedure {} - required {args}, given {}",
					name.bold().cyan(),
					node.args.len()
				))
				.into());
			}
			for arg in &node.args {
				self.visit(arg)?;
			}
			// Push our own return address: past this PUSH and the JMPFUN after it.
			self.emit_operation(Op::Push, Some(as_immediate(self.bytes_out.len() + 18)))?;
			self.emit_operation(Op::Jmpfun, Some(as_immediate(addr)))?;
		} else if self.external_symbols.iter().any(|registered| registered == name) {
			for arg in &node.args {
				self.visit(arg)?;
			}
			// The external call interface takes the callee name from the stack.
			self.emit_string_operation(Op::Pushs, name)?;
			self.emit_operation(Op::Call, Some(as_immediate(node.args.len())))?;
		} else {
			return Err(CompileError::codegen(format!("Unknown procedure or external function {}", name.bold().cyan())).into());
		}

		// Calls count as numeric for operator selection.
		Ok(StaticValue::Number(1.0))
	}

	fn open_scope(&mut self) {
		self.scopes.open_scope();
		if self.stats.max_scope < self.scopes.depth() {
			self.stats.max_scope = self.scopes.depth();
		}
	}

	fn close_scope(&mut self) {
		self.scopes.close_scope();
	}

	/// Appends one instruction. Nine bytes - opcode, then the immediate as a big-endian double, zero-padded - or a
	/// single byte for the argument-less opcodes.
	fn emit_operation(&mut self, op: Op, arg: Option<f64>) -> anyhow::Result<()> {
		if let Some(value) = arg {
			if value > MAX_IMMEDIATE {
				return Err(CompileError::codegen(format!("Immediate {value} exceeds the encodable range")).into());
			}
		}

		let start = self.bytes_out.len();
		self.bytes_out.push(op as u8);
		if let Some(value) = arg {
			self.bytes_out.extend_from_slice(&value.to_be_bytes());
		}
		if !op.is_single_byte() {
			while self.bytes_out.len() - start < 9 {
				self.bytes_out.push(0x00);
			}
		}
		Ok(())
	}

	/// Appends a variable-width string instruction: opcode, byte length as a double, then the UTF-8 bytes.
	fn emit_string_operation(&mut self, op: Op, text: &str) -> anyhow::Result<()> {
		let length = text.len();
		if as_immediate(length) > MAX_IMMEDIATE {
			return Err(CompileError::codegen("String literal exceeds the encodable range".to_owned()).into());
		}
		self.bytes_out.push(op as u8);
		self.bytes_out.extend_from_slice(&as_immediate(length).to_be_bytes());
		self.bytes_out.extend_from_slice(text.as_bytes());
		Ok(())
	}

	/// Overwrites the 8 immediate bytes of the jump at `head` with the target byte offset. Writes that would land
	/// outside the emitted stream are silently ignored.
	fn backpatch(&mut self, head: usize, target: usize) {
		let packed = as_immediate(target).to_be_bytes();
		if let Some(slice) = self.bytes_out.get_mut(head + 1..head + 9) {
			slice.copy_from_slice(&packed);
		}
	}
}

#[cfg(test)]
mod tests {
	use pretty_assertions::assert_eq;
	use unindent::unindent;

	use super::{
		bytecode::{decode, Instruction, Payload},
		*,
	};
	use crate::parser::Parser;

	fn compile(source: &str) -> CodeGenerator {
		let statements = Parser::new().parse(&unindent(source)).unwrap();
		let mut generator = CodeGenerator::new();
		for statement in &statements {
			generator.generate(statement).unwrap();
		}
		generator
	}

	fn compile_error(source: &str) -> anyhow::Error {
		let statements = Parser::new().parse(&unindent(source)).unwrap();
		let mut generator = CodeGenerator::new();
		for statement in &statements {
			if let Err(error) = generator.generate(statement) {
				return error;
			}
		}
		panic!("expected a compile error");
	}

	fn instructions(source: &str) -> Vec<Instruction> {
		decode(compile(source).bytes()).unwrap()
	}

	fn opcodes(decoded: &[Instruction]) -> Vec<(Op, Payload)> {
		decoded.iter().map(|instruction| (instruction.op, instruction.payload.clone())).collect()
	}

	fn at(decoded: &[Instruction], addr: usize) -> &Instruction {
		decoded.iter().find(|instruction| instruction.addr == addr).unwrap_or_else(|| panic!("no instruction at byte {addr}"))
	}

	fn imm(value: f64) -> Payload {
		Payload::Immediate(value)
	}

	fn is_codegen_error(error: &anyhow::Error) -> bool {
		matches!(error.downcast_ref::<CompileError>(), Some(CompileError::Codegen { .. }))
	}

	#[test]
	fn chained_declarations_fold_and_store() {
		let decoded = instructions(
			"
			let a = 3 * 42
			let b = 9 + a
			let c = a + b
			",
		);
		assert_eq!(
			opcodes(&decoded),
			vec![
				(Op::Push, imm(3.0)),
				(Op::Push, imm(42.0)),
				(Op::Mul, Payload::None),
				(Op::Pushg, imm(0.0)),
				(Op::Push, imm(9.0)),
				(Op::Popg, imm(0.0)),
				(Op::Add, Payload::None),
				(Op::Pushg, imm(1.0)),
				(Op::Popg, imm(0.0)),
				(Op::Popg, imm(1.0)),
				(Op::Add, Payload::None),
				(Op::Pushg, imm(2.0)),
			]
		);
	}

	#[test]
	fn extern_call_shape() {
		let decoded = instructions(
			"
			extern func foo
			foo(1, 2)
			",
		);
		assert_eq!(
			opcodes(&decoded),
			vec![
				(Op::Push, imm(1.0)),
				(Op::Push, imm(2.0)),
				(Op::Pushs, Payload::Text("foo".to_owned())),
				(Op::Call, imm(2.0)),
			]
		);
	}

	#[test]
	fn plus_selects_add_or_concat() {
		// Statically numeric operands add; anything touching a string concatenates.
		let decoded = instructions("let a = \"x\" + 1");
		assert_eq!(
			opcodes(&decoded),
			vec![
				(Op::Pushs, Payload::Text("x".to_owned())),
				(Op::Push, imm(1.0)),
				(Op::Concat, imm(0.0)),
				(Op::Pushg, imm(0.0)),
			]
		);

		let decoded = instructions(
			"
			let s = \"hi\"
			let t = s + s
			",
		);
		assert!(decoded.iter().any(|instruction| instruction.op == Op::Concat));
		assert!(!decoded.iter().any(|instruction| instruction.op == Op::Add));
	}

	#[test]
	fn simple_if_patches_past_the_chain() {
		let decoded = instructions(
			"
			let a = 1
			if a = 1 then
				print(\"yes\")
			endif
			",
		);
		// Layout: PUSH@0 PUSHG@9 POPG@18 PUSH@27 EQ@36 JZ@37 PUSHS@46 PRINT@58; end = 59.
		assert_eq!(at(&decoded, 37).op, Op::Jz);
		assert_eq!(at(&decoded, 37).immediate(), 59.0);
	}

	#[test]
	fn if_elseif_else_patch_targets() {
		let decoded = instructions(
			"
			let a = 42
			if a = 42 then
				print(\"a is 42\")
			elseif a = 43 then
				print(\"a is 43\")
			else
				print(\"else\")
			endif
			",
		);
		// The root JZ skips to the first elseif condition; every branch exit JMP lands past the chain; the last
		// elseif's JZ is re-aimed at the else body; the leading else JMP is dead but patched to the end.
		assert_eq!(at(&decoded, 37).op, Op::Jz);
		assert_eq!(at(&decoded, 37).immediate(), 72.0);
		assert_eq!(at(&decoded, 63).op, Op::Jmp);
		assert_eq!(at(&decoded, 63).immediate(), 149.0);
		assert_eq!(at(&decoded, 91).op, Op::Jz);
		assert_eq!(at(&decoded, 91).immediate(), 135.0);
		assert_eq!(at(&decoded, 117).op, Op::Jmp);
		assert_eq!(at(&decoded, 117).immediate(), 149.0);
		assert_eq!(at(&decoded, 126).op, Op::Jmp);
		assert_eq!(at(&decoded, 126).immediate(), 149.0);
		// The else body really does start where the re-aimed JZ points.
		assert_eq!(at(&decoded, 135).op, Op::Pushs);
	}

	#[test]
	fn forever_loop_with_exit() {
		let decoded = instructions(
			"
			let a = 0
			repeat
				a = a + 1
				print(\"a: \" + a)
				if a = 3 then
					exit
				endif
			forever
			",
		);
		// The synthetic forever condition is 1 <> 1 at the loop head.
		assert_eq!(at(&decoded, 18).op, Op::Push);
		assert_eq!(at(&decoded, 36).op, Op::Noteq);
		// JZ at the head exits past the loop; the closing JMP returns to the head; the exit JMP is patched to the
		// loop end, not to the end of its enclosing if.
		assert_eq!(at(&decoded, 37).op, Op::Jz);
		assert_eq!(at(&decoded, 37).immediate(), 151.0);
		assert_eq!(at(&decoded, 133).op, Op::Jmp);
		assert_eq!(at(&decoded, 133).immediate(), 151.0);
		assert_eq!(at(&decoded, 142).op, Op::Jmp);
		assert_eq!(at(&decoded, 142).immediate(), 18.0);
	}

	#[test]
	fn nested_loop_exits_stay_inside() {
		let decoded = instructions(
			"
			repeat
				repeat
					exit
				forever
				exit
			forever
			",
		);
		// Inner exit patches to the inner loop end (74); outer exit to the outer loop end (92).
		assert_eq!(at(&decoded, 56).op, Op::Jmp);
		assert_eq!(at(&decoded, 56).immediate(), 74.0);
		assert_eq!(at(&decoded, 74).op, Op::Jmp);
		assert_eq!(at(&decoded, 74).immediate(), 92.0);
		// Loop closers return to their own heads.
		assert_eq!(at(&decoded, 65).immediate(), 28.0);
		assert_eq!(at(&decoded, 83).immediate(), 0.0);
	}

	#[test]
	fn until_loop_is_bottom_tested() {
		let decoded = instructions(
			"
			let j = 0
			repeat
				j = j + 1
			until j = 4
			",
		);
		// Body from 18, condition after it, then JZ back to the head: continue while false, exit when true.
		let jz = decoded.iter().rev().find(|instruction| instruction.op == Op::Jz).unwrap();
		assert_eq!(jz.immediate(), 18.0);
		assert_eq!(jz.addr, 65);
	}

	#[test]
	fn func_call_convention() {
		let decoded = instructions(
			"
			func my_func(a)
				return a * 2
			endfunc
			print(\"result: \" + my_func(4))
			",
		);
		// Guard JMP over the body, patched to the byte after the implicit JFS.
		assert_eq!(at(&decoded, 0).op, Op::Jmp);
		assert_eq!(at(&decoded, 0).immediate(), 55.0);
		// The argument spill: one formal, so PUSHL 0.
		assert_eq!(at(&decoded, 9).op, Op::Pushl);
		assert_eq!(at(&decoded, 9).immediate(), 0.0);
		// return a * 2 keeps one value on the stack.
		assert_eq!(at(&decoded, 37).op, Op::Jfs);
		assert_eq!(at(&decoded, 37).immediate(), 1.0);
		// Implicit trailing return.
		assert_eq!(at(&decoded, 46).op, Op::Jfs);
		assert_eq!(at(&decoded, 46).immediate(), 0.0);
		// The call pushes its return address (here + 18) and jumps to the registered body address.
		assert_eq!(at(&decoded, 81).op, Op::Push);
		assert_eq!(at(&decoded, 81).immediate(), 99.0);
		assert_eq!(at(&decoded, 90).op, Op::Jmpfun);
		assert_eq!(at(&decoded, 90).immediate(), 9.0);
		// A call result counts as numeric, but the string on the left forces CONCAT.
		assert_eq!(at(&decoded, 99).op, Op::Concat);
	}

	#[test]
	fn return_in_sub_emits_bare_jfs() {
		let decoded = instructions(
			"
			sub bla
				return 5
			endsub
			",
		);
		// The value is parsed but discarded: no PUSH, just JFS without an argument (plus the implicit one).
		assert!(!decoded.iter().any(|instruction| instruction.op == Op::Push));
		let returns = decoded.iter().filter(|instruction| instruction.op == Op::Jfs).collect::<Vec<_>>();
		assert_eq!(returns.len(), 2);
		assert!(returns.iter().all(|instruction| instruction.immediate() == 0.0));
	}

	#[test]
	fn indexed_assignment_stores_through_the_array_slot() {
		let decoded = instructions(
			"
			let a = [0, 0]
			let i = 0
			a[i] = i
			",
		);
		let tail = opcodes(&decoded)[6..].to_vec();
		assert_eq!(
			tail,
			vec![
				(Op::Popg, imm(1.0)),   // the value: i
				(Op::Popg, imm(1.0)),   // the subscript: i again...
				(Op::Pushas, Payload::None), // ...marked as a variable subscript
				(Op::Pushg, imm(0.0)),  // store into the array variable
			]
		);
	}

	#[test]
	fn literal_subscript_uses_pusha() {
		let decoded = instructions(
			"
			let a = [1]
			let out = a[0]
			",
		);
		assert_eq!(
			opcodes(&decoded),
			vec![
				(Op::Push, imm(1.0)),
				(Op::Data, imm(1.0)),
				(Op::Pushg, imm(0.0)),
				(Op::Pusha, imm(0.0)),
				(Op::Popg, imm(0.0)),
				(Op::Pushg, imm(1.0)),
			]
		);
	}

	#[test]
	fn array_literal_elements_are_ordinary_rvalues() {
		let decoded = instructions("let i = [1, 1+1, 3, 42.69]");
		assert_eq!(
			opcodes(&decoded),
			vec![
				(Op::Push, imm(1.0)),
				(Op::Push, imm(1.0)),
				(Op::Push, imm(1.0)),
				(Op::Add, Payload::None),
				(Op::Push, imm(3.0)),
				(Op::Push, imm(42.69)),
				(Op::Data, imm(4.0)),
				(Op::Pushg, imm(0.0)),
			]
		);
	}

	#[test]
	fn block_scope_locals_start_at_zero() {
		let decoded = instructions(
			"
			let a = 1
			if a = 1 then
				let b = 2
				b = 3
			endif
			",
		);
		let locals = decoded.iter().filter(|instruction| instruction.op == Op::Pushl).collect::<Vec<_>>();
		assert_eq!(locals.len(), 2);
		assert!(locals.iter().all(|instruction| instruction.immediate() == 0.0));
	}

	#[test]
	fn procedures_and_globals_share_slot_space() {
		let decoded = instructions(
			"
			sub f
			endsub
			let x = 1
			",
		);
		// The procedure entry occupies global slot 0, so the first variable lands in slot 1.
		let store = decoded.iter().rev().find(|instruction| instruction.op == Op::Pushg).unwrap();
		assert_eq!(store.immediate(), 1.0);
	}

	#[test]
	fn builtin_lowering() {
		let decoded = instructions(
			"
			let a = 1
			print(len(a))
			print(argtype(a))
			",
		);
		let ops = decoded.iter().map(|instruction| instruction.op).collect::<Vec<_>>();
		assert_eq!(
			ops,
			vec![Op::Push, Op::Pushg, Op::Popg, Op::Len, Op::Print, Op::Popg, Op::Argtype, Op::Print]
		);
	}

	#[test]
	fn unary_lowering() {
		let decoded = instructions(
			"
			let a = 1
			let b = -a
			let c = !a
			",
		);
		let ops = decoded.iter().map(|instruction| instruction.op).collect::<Vec<_>>();
		assert_eq!(
			ops,
			vec![Op::Push, Op::Pushg, Op::Popg, Op::Neg, Op::Pushg, Op::Popg, Op::Not, Op::Pushg]
		);
	}

	#[test]
	fn modifying_a_constant_is_rejected() {
		let error = compile_error(
			"
			let a = 1 const
			a = 2
			",
		);
		assert!(is_codegen_error(&error));
	}

	#[test]
	fn unknown_symbol_is_rejected() {
		assert!(is_codegen_error(&compile_error("let a = b")));
	}

	#[test]
	fn reassigning_an_undeclared_symbol_is_rejected() {
		assert!(is_codegen_error(&compile_error("a = 2")));
	}

	#[test]
	fn wrong_argument_count_is_rejected() {
		let error = compile_error(
			"
			sub f(a)
				print(a)
			endsub
			f()
			",
		);
		assert!(is_codegen_error(&error));
	}

	#[test]
	fn unknown_call_target_is_rejected() {
		assert!(is_codegen_error(&compile_error("foo(1)")));
	}

	#[test]
	fn variables_are_not_callable() {
		let error = compile_error(
			"
			let f = 1
			f(2)
			",
		);
		assert!(is_codegen_error(&error));
	}

	#[test]
	fn duplicate_procedure_is_rejected() {
		let error = compile_error(
			"
			sub f
			endsub
			sub f
			endsub
			",
		);
		assert!(is_codegen_error(&error));
	}

	#[test]
	fn builtin_arity_is_checked() {
		assert!(is_codegen_error(&compile_error("print()")));
	}

	#[test]
	fn oversized_immediate_is_an_encoding_overflow() {
		assert!(is_codegen_error(&compile_error("let a = 5000000000")));
	}

	#[test]
	fn empty_source_produces_empty_output() {
		let generator = compile("");
		assert!(generator.bytes().is_empty());
		assert!(generator.finalize().is_empty());
		assert_eq!(generator.finalize_rle(), "");
	}

	#[test]
	fn output_length_grows_monotonically() {
		let statements = Parser::new()
			.parse("let a = 1\nlet b = 2\nif a = b then\nprint(\"same\")\nendif\nlet c = a + b")
			.unwrap();
		let mut generator = CodeGenerator::new();
		let mut previous = 0;
		for statement in &statements {
			generator.generate(statement).unwrap();
			assert!(generator.bytes().len() >= previous);
			previous = generator.bytes().len();
		}
	}

	#[test]
	fn no_sentinel_survives_compilation() {
		let decoded = instructions(
			"
			func fact(n)
				if n <= 1 then
					return 1
				else
					return n * fact(n-1)
				endif
			endfunc
			let x = 10
			repeat
				x = x - 1
				if x = 5 then
					exit
				endif
			forever
			print(\"10! = \" + fact(10))
			",
		);
		for instruction in &decoded {
			if matches!(instruction.op, Op::Jz | Op::Jmp | Op::Jmpfun) {
				assert_ne!(instruction.immediate(), JUMP_SENTINEL, "unpatched sentinel at byte {}", instruction.addr);
			}
		}
	}

	#[test]
	fn finalize_formats_decimal_byte_strings() {
		let generator = compile("let a = 0");
		let fbytes = generator.finalize();
		assert_eq!(fbytes.len(), 18);
		assert_eq!(fbytes[0], "20"); // PUSH
		assert_eq!(fbytes[9], "16"); // PUSHG
		assert!(fbytes[1..9].iter().all(|byte| byte == "0"));
	}

	#[test]
	fn run_length_encoding_pairs_counts_with_bytes() {
		let generator = compile("let a = 0");
		assert_eq!(generator.finalize_rle(), "1,20,8,0,1,16,8,0");
	}

	#[test]
	fn stats_reflect_the_program() {
		let generator = compile(
			"
			let i = [1, 2]
			let s = \"hello\"
			",
		);
		assert_eq!(generator.stats().arrays, 1);
		assert_eq!(generator.stats().symbols, 2);
		assert_eq!(generator.stats().max_strlen, 5);
	}
}
