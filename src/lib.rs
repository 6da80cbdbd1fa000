//! # evoscript
//!
//! A compiler for evoscript, a small BASIC-flavored imperative scripting language, targeting the fixed-width
//! bytecode of a separate stack-based virtual machine.
//!
//! The pipeline runs strictly leaves-first: the [`lexer`] turns cleaned source text into tokens on demand, the
//! [`parser`] builds a flat sequence of statement nodes by recursive descent, and the [`emitter`] lowers those
//! nodes into the VM's 9-byte instruction encoding in a single pass, backpatching forward jumps in place.
//!
//! ```no_run
//! # fn main() -> anyhow::Result<()> {
//! let mut parser = evoscript::parser::Parser::new();
//! let statements = parser.parse("let a = 3 * 42\nprint(\"a: \" + a)")?;
//!
//! let mut generator = evoscript::emitter::CodeGenerator::new();
//! for statement in &statements {
//! 	generator.generate(statement)?;
//! }
//! let fbytes = generator.finalize();
//! # Ok(())
//! # }
//! ```

/// The lexer module, which tokenizes source code. Supports one token of lookahead via its peek mode.
pub mod lexer;

/// The parser module, which parses the token stream into an abstract syntax tree and resolves imports.
pub mod parser;

/// The emitter module, which lowers the syntax tree into VM bytecode.
pub mod emitter;

/// The error module: the three fatal compile error kinds.
pub mod error;

/// The configuration module, which loads `config.yml`.
pub mod config;

/// The files module, which resolves input and import paths against the configured directories.
pub mod files;

/// The CLI module: argument parsing and the compile driver.
pub mod cli;
