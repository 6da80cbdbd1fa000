/// The three fatal error kinds the compiler can produce. Compilation is all-or-nothing: the first error of any kind
/// aborts the pipeline, so a compile either yields a complete byte vector or exactly one of these. There are no
/// warnings and no recovery mode.
///
/// The variants mirror the three pipeline stages:
///
/// - `Lexical` - the scanner hit a character sequence that is not a token (wrong character, unterminated string,
///   malformed number). Carries the character offset of the offending lexeme.
/// - `Syntax` - the parser's current token didn't match the grammar (unexpected token, missing terminator, `exit`
///   outside a loop). Carries the character offset of the offending token.
/// - `Codegen` - the emitter rejected an otherwise well-formed program (unknown symbol, modifying a constant, wrong
///   argument count, duplicate procedure, immediate encoding overflow, missing import file).
///
/// Errors are propagated as `anyhow::Error` throughout the compiler; this type is always the concrete error behind
/// them, so callers (and tests) can `downcast_ref::<CompileError>()` to inspect the kind.
#[derive(Debug)]
pub enum CompileError {
	/// An error produced by the scanner. The offset is the character position where the bad lexeme starts.
	Lexical {
		/// The error message.
		message: String,
		/// The character offset of the offending lexeme in the cleaned source.
		offset: usize,
	},

	/// An error produced by the parser. The offset is the character position of the token that broke the grammar.
	Syntax {
		/// The error message, usually of the form "Expected X but found Y".
		message: String,
		/// The character offset of the offending token in the cleaned source.
		offset: usize,
	},

	/// An error produced by the emitter. Codegen errors have no reliable character position (the AST no longer
	/// carries one for every node), so they only carry a message.
	Codegen {
		/// The error message.
		message: String,
	},
}

impl CompileError {
	/// Creates a lexical error at the given character offset.
	#[must_use]
	pub fn lexical(message: impl Into<String>, offset: usize) -> Self {
		Self::Lexical { message: message.into(), offset }
	}

	/// Creates a syntax error at the given character offset.
	#[must_use]
	pub fn syntax(message: impl Into<String>, offset: usize) -> Self {
		Self::Syntax { message: message.into(), offset }
	}

	/// Creates a code generation error.
	#[must_use]
	pub fn codegen(message: impl Into<String>) -> Self {
		Self::Codegen { message: message.into() }
	}
}

impl std::fmt::Display for CompileError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Lexical { message, offset } => write!(f, "Lexical error at character {offset}: {message}"),
			Self::Syntax { message, offset } => write!(f, "Syntax error at character {offset}: {message}"),
			Self::Codegen { message } => write!(f, "Compile error: {message}"),
		}
	}
}

impl std::error::Error for CompileError {}
