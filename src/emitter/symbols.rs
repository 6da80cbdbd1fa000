/// The global scope id. Slot indices found here are emitted through the `PUSHG`/`POPG` family; everything else
/// goes through `PUSHL`/`POPL`.
pub const GLOBAL_SCOPE: usize = 0;

/// The maximum number of local slots a procedure may use. Procedure scope ids are spaced `E_MAX_LOCALS + 1` apart
/// so each procedure gets a disjoint local index space, with room for its nested block scopes in between.
pub const E_MAX_LOCALS: usize = 99;

/// A comptime-known value tracked alongside a variable. The emitter uses this for two things: deciding between
/// `ADD` and `CONCAT` when lowering `+`, and folding literal arithmetic so that a chain of declarations keeps its
/// numeric-ness (`let a = 3 * 42` makes `a` a known number, so `9 + a` is numeric addition).
#[derive(Debug, Clone, PartialEq)]
pub enum StaticValue {
	/// A number known (or at least known numeric) at compile time.
	Number(f64),
	/// A string known at compile time.
	Text(String),
	/// Anything the emitter cannot see through.
	Unknown,
}

impl StaticValue {
	/// The numeric value, if this is a number.
	#[must_use]
	pub fn as_number(&self) -> Option<f64> {
		match self {
			Self::Number(number) => Some(*number),
			_ => None,
		}
	}
}

/// A symbol table entry.
#[derive(Debug, Clone)]
pub enum Symbol {
	/// A variable. Its slot is its position in the scope's entry list (offset by the scope's slot base) and is
	/// assigned exactly once at declaration.
	Variable {
		name: String,
		/// The initial value, when comptime-known. Never updated by reassignment.
		value: StaticValue,
		is_const: bool,
	},
	/// A user-defined procedure. Registered in the global scope; implicitly constant.
	Procedure {
		name: String,
		/// The number of formal arguments.
		args: usize,
		/// The byte offset of the first instruction after the guarding `JMP`; set once when the prologue is
		/// emitted.
		addr: usize,
	},
}

impl Symbol {
	/// The symbol's name.
	#[must_use]
	pub fn name(&self) -> &str {
		match self {
			Self::Variable { name, .. } | Self::Procedure { name, .. } => name,
		}
	}

	/// Whether reassigning this symbol is forbidden. Procedures are implicitly constant.
	#[must_use]
	pub const fn is_const(&self) -> bool {
		match self {
			Self::Variable { is_const, .. } => *is_const,
			Self::Procedure { .. } => true,
		}
	}
}

/// One scope in the chain.
#[derive(Debug)]
struct Scope {
	/// The scope id: 0 for global, parent + 1 for nested blocks, 100/200/... for procedure bodies.
	id: usize,
	/// The slot index of this scope's first entry. Block scopes continue their parent's numbering so that sibling
	/// and nested declarations never collide within one frame; procedure scopes restart at 0.
	base: usize,
	/// Whether this is a procedure body scope, which cuts lookup off from enclosing block scopes.
	proc: bool,
	symbols: Vec<Symbol>,
}

/// A successful symbol lookup: the entry, the slot index to encode, and the id of the scope it lives in.
#[derive(Debug)]
pub struct Resolved<'chain> {
	pub symbol: &'chain Symbol,
	/// The stable numeric slot encoded into `PUSHG`/`POPG`/`PUSHL`/`POPL`.
	pub slot: usize,
	/// The id of the scope the symbol was found in.
	pub scope_id: usize,
}

impl Resolved<'_> {
	/// Whether the symbol lives in the global scope (and thus uses the `PUSHG`/`POPG` instruction family).
	#[must_use]
	pub const fn is_global(&self) -> bool {
		self.scope_id == GLOBAL_SCOPE
	}
}

/// The scoped symbol table, organized as a chain: each scope holds only its own declarations and lookup walks the
/// chain innermost-outward. Slot bases keep the emitted indices identical to a table that copies parent entries on
/// scope open, without the stale duplicates.
///
/// Visibility follows the language's frame rules: a procedure body sees its own locals and the globals, never the
/// block scopes surrounding its declaration, so lookup falls through directly from a procedure scope to the global
/// scope.
pub struct ScopeChain {
	scopes: Vec<Scope>,
	/// The next free procedure scope id; advances by `E_MAX_LOCALS + 1` per procedure.
	next_proc_id: usize,
}

impl Default for ScopeChain {
	fn default() -> Self {
		Self::new()
	}
}

impl ScopeChain {
	/// Creates a chain holding only the global scope.
	#[must_use]
	pub fn new() -> Self {
		Self {
			scopes: vec![Scope { id: GLOBAL_SCOPE, base: 0, proc: false, symbols: Vec::new() }],
			next_proc_id: E_MAX_LOCALS + 1,
		}
	}

	/// How many scopes are open above the global one.
	#[must_use]
	pub fn depth(&self) -> usize {
		self.scopes.len() - 1
	}

	/// Opens a nested block scope.
	pub fn open_scope(&mut self) {
		let (parent_id, base) = self.scopes.last().map_or((GLOBAL_SCOPE, 0), |parent| {
			// The global scope doesn't take part in local slot numbering.
			let base = if parent.id == GLOBAL_SCOPE { 0 } else { parent.base + parent.symbols.len() };
			(parent.id, base)
		});
		self.scopes.push(Scope { id: parent_id + 1, base, proc: false, symbols: Vec::new() });
	}

	/// Opens a fresh procedure scope with its own disjoint local numbering and returns its id.
	pub fn open_proc_scope(&mut self) -> usize {
		let id = self.next_proc_id;
		self.next_proc_id += E_MAX_LOCALS + 1;
		self.scopes.push(Scope { id, base: 0, proc: true, symbols: Vec::new() });
		id
	}

	/// Closes the innermost scope. Clamps at the global scope, which is never closed.
	pub fn close_scope(&mut self) {
		if self.scopes.len() > 1 {
			self.scopes.pop();
		}
	}

	/// Declares a symbol in the innermost scope. Its slot is implied by its position and never renumbered.
	pub fn insert(&mut self, symbol: Symbol) {
		if let Some(scope) = self.scopes.last_mut() {
			scope.symbols.push(symbol);
		}
	}

	/// Declares a symbol in the global scope regardless of the current nesting; used for procedures.
	pub fn insert_global(&mut self, symbol: Symbol) {
		if let Some(scope) = self.scopes.first_mut() {
			scope.symbols.push(symbol);
		}
	}

	/// Resolves a name against the chain: innermost scope outward, most recent declaration first (so a
	/// redeclaration shadows), falling through directly from a procedure scope to the global scope.
	#[must_use]
	pub fn lookup(&self, name: &str) -> Option<Resolved<'_>> {
		for scope in self.scopes.iter().rev() {
			if let Some(resolved) = Self::find_in(scope, name) {
				return Some(resolved);
			}
			if scope.proc {
				// Procedure boundary: enclosing block scopes are invisible from in here.
				break;
			}
		}
		self.scopes.first().and_then(|global| Self::find_in(global, name))
	}

	/// Resolves a name against the global scope only; procedure calls go through here.
	#[must_use]
	pub fn lookup_global(&self, name: &str) -> Option<Resolved<'_>> {
		self.scopes.first().and_then(|global| Self::find_in(global, name))
	}

	fn find_in<'chain>(scope: &'chain Scope, name: &str) -> Option<Resolved<'chain>> {
		let index = scope.symbols.iter().rposition(|symbol| symbol.name() == name)?;
		Some(Resolved {
			symbol: &scope.symbols[index],
			slot: scope.base + index,
			scope_id: scope.id,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn variable(name: &str) -> Symbol {
		Symbol::Variable { name: name.to_owned(), value: StaticValue::Unknown, is_const: false }
	}

	#[test]
	fn global_slots_count_up() {
		let mut chain = ScopeChain::new();
		chain.insert(variable("a"));
		chain.insert(variable("b"));
		let resolved = chain.lookup("b").unwrap();
		assert_eq!(resolved.slot, 1);
		assert!(resolved.is_global());
	}

	#[test]
	fn nested_blocks_continue_parent_numbering() {
		let mut chain = ScopeChain::new();
		chain.open_scope();
		chain.insert(variable("a"));
		chain.insert(variable("b"));
		chain.open_scope();
		chain.insert(variable("c"));
		let resolved = chain.lookup("c").unwrap();
		assert_eq!(resolved.slot, 2);
		assert!(!resolved.is_global());
		// The outer block's entries stay visible from the inner block.
		assert_eq!(chain.lookup("a").unwrap().slot, 0);
	}

	#[test]
	fn block_scope_at_global_level_starts_at_zero() {
		let mut chain = ScopeChain::new();
		chain.insert(variable("g"));
		chain.open_scope();
		chain.insert(variable("local"));
		assert_eq!(chain.lookup("local").unwrap().slot, 0);
	}

	#[test]
	fn procedure_scope_hides_enclosing_blocks() {
		let mut chain = ScopeChain::new();
		chain.insert(variable("global_var"));
		chain.open_scope();
		chain.insert(variable("block_var"));
		chain.open_proc_scope();
		chain.insert(variable("arg"));
		assert!(chain.lookup("block_var").is_none());
		assert!(chain.lookup("global_var").unwrap().is_global());
		assert_eq!(chain.lookup("arg").unwrap().slot, 0);
	}

	#[test]
	fn procedure_scope_ids_step_by_one_hundred() {
		let mut chain = ScopeChain::new();
		assert_eq!(chain.open_proc_scope(), 100);
		chain.close_scope();
		assert_eq!(chain.open_proc_scope(), 200);
	}

	#[test]
	fn shadowing_resolves_to_the_most_recent_declaration() {
		let mut chain = ScopeChain::new();
		chain.insert(variable("x"));
		chain.open_scope();
		chain.insert(Symbol::Variable { name: "x".to_owned(), value: StaticValue::Number(1.0), is_const: false });
		let resolved = chain.lookup("x").unwrap();
		assert!(!resolved.is_global());
		assert_eq!(resolved.symbol.name(), "x");
	}

	#[test]
	fn close_scope_clamps_at_global() {
		let mut chain = ScopeChain::new();
		chain.close_scope();
		chain.close_scope();
		chain.insert(variable("still_global"));
		assert!(chain.lookup("still_global").unwrap().is_global());
	}

	#[test]
	fn procedures_are_const() {
		assert!(Symbol::Procedure { name: "p".to_owned(), args: 0, addr: 9 }.is_const());
	}
}
