use std::path::PathBuf;

use colored::Colorize as _;

use crate::{
	error::CompileError,
	files,
	lexer::{Scanner, Token, TokenType},
	parser::nodes::{
		AssignTarget, AssignmentNode, ArrayNode, CallNode, ConditionPos, ElseIf, ExprOp, ExpressionNode, ExternNode,
		IfNode, ImportNode, LoopNode, Node, ProcNode, ReturnNode, TermNode, TermOp, UnaryNode, UnarySign, ValueNode,
	},
};

/// The AST node definitions.
pub mod nodes;

/// How many times import splicing may restart the parse. Imports are resolved by prepending the imported file and
/// parsing again from the top, so a pair of files importing each other would otherwise re-enter forever.
const MAX_IMPORT_DEPTH: usize = 32;

/// Token types that can begin a return-value expression inside a `func`.
const FUNC_RETURN_STARTERS: &[TokenType] = &[
	TokenType::Number,
	TokenType::String,
	TokenType::Identifier,
	TokenType::LeftParenthesis,
	TokenType::Minus,
	TokenType::Plus,
	TokenType::Bang,
	TokenType::KeywordNot,
];

/// Token types that can begin a (discarded) return expression inside a `sub`. Identifiers are deliberately absent:
/// after a bare `return`, a following identifier is the next statement, not a return value.
const SUB_RETURN_STARTERS: &[TokenType] = &[
	TokenType::Number,
	TokenType::String,
	TokenType::LeftParenthesis,
	TokenType::Minus,
	TokenType::Plus,
	TokenType::Bang,
	TokenType::KeywordNot,
];

/// The recursive-descent parser. Pulls tokens from the scanner one at a time (with a single token of lookahead
/// where the grammar needs it) and produces the flat, ordered list of top-level statement nodes that the emitter
/// walks.
///
/// The parser also performs import resolution: leading `import "file"` statements are collected, stripped from the
/// source text, and the referenced files are located in the configured library and script directories, cleaned,
/// and prepended before parsing restarts.
pub struct Parser {
	scanner: Scanner,
	cur_token: Token,
	/// Loop nesting depth; `exit` outside any loop is a syntax error.
	loops: usize,
	/// Whether the procedure currently being parsed is a `func`. Decides how a `return` value is parsed.
	cur_proc_is_func: bool,
	/// The library directory searched first when resolving imports.
	stdlib_dir: PathBuf,
	/// Additional script directories searched when resolving imports.
	script_dirs: Vec<PathBuf>,
}

impl Default for Parser {
	fn default() -> Self {
		Self::new()
	}
}

impl Parser {
	/// Creates a parser with no import search paths. Imports will fail to resolve; fine for sources that don't use
	/// them.
	#[must_use]
	pub fn new() -> Self {
		Self::with_search_paths(PathBuf::new(), Vec::new())
	}

	/// Creates a parser that resolves imports against the given library directory and script directories, in that
	/// order.
	#[must_use]
	pub fn with_search_paths(stdlib_dir: PathBuf, script_dirs: Vec<PathBuf>) -> Self {
		Self {
			scanner: Scanner::new(""),
			cur_token: Token { token_type: TokenType::Eof, value: crate::lexer::TokenValue::None, offset: 0 },
			loops: 0,
			cur_proc_is_func: false,
			stdlib_dir,
			script_dirs,
		}
	}

	/// Parses the given source string into the program's top-level statements.
	///
	/// # Errors
	/// Any lexical or syntax error in the source, or a failure to resolve an imported file.
	pub fn parse(&mut self, input: &str) -> anyhow::Result<Vec<Node>> {
		self.parse_unit(input, 0)
	}

	/// Parses one source unit, splicing imports and restarting until none remain.
	fn parse_unit(&mut self, input: &str, depth: usize) -> anyhow::Result<Vec<Node>> {
		let clean = clean_source(input);
		self.reset(&clean)?;

		let mut imports = Vec::new();
		while self.cur_token.token_type == TokenType::KeywordImport {
			imports.push(self.parse_import()?);
		}

		if !imports.is_empty() {
			if depth >= MAX_IMPORT_DEPTH {
				return Err(CompileError::codegen("Import depth exceeded; are two files importing each other?").into());
			}

			// Strip every import statement, then prepend the imported files and parse again from the top.
			let mut spliced = regex_macro::regex!("import +\"[^\"]+\"").replace_all(&clean, " ").into_owned();
			for import in &imports {
				let Node::Import(ImportNode { file }) = import else { continue };
				let path = files::resolve_import(file, &self.stdlib_dir, &self.script_dirs)?;
				let contents = std::fs::read_to_string(&path)
					.map_err(|error| anyhow::anyhow!("{error}\n\twhile reading the imported file {}", path.display().to_string().bold().cyan()))?;
				spliced = format!("{}\n{}", clean_source(&contents), spliced);
			}
			return self.parse_unit(&spliced, depth + 1);
		}

		// No imports left: parse for real, from a fresh scanner.
		self.reset(&clean)?;
		let statements = self.parse_statements()?;
		if self.cur_token.token_type != TokenType::Eof {
			return Err(self.fail(format!("Unexpected {} after the last statement", format!("{}", self.cur_token.token_type).bold().cyan())));
		}
		Ok(statements)
	}

	/// Points the parser at a new source string and primes the first token.
	fn reset(&mut self, source: &str) -> anyhow::Result<()> {
		self.scanner = Scanner::new(source);
		self.loops = 0;
		self.cur_proc_is_func = false;
		self.cur_token = self.scanner.next_token(false)?;
		Ok(())
	}

	/// Consumes and returns the current token if it has the given type; fails with an expected/found syntax error
	/// otherwise.
	fn accept(&mut self, token_type: TokenType) -> anyhow::Result<Token> {
		if self.cur_token.token_type == token_type {
			let next = self.scanner.next_token(false)?;
			Ok(std::mem::replace(&mut self.cur_token, next))
		} else {
			Err(self.fail(format!(
				"Expected {} but found {}",
				format!("{token_type}").bold().cyan(),
				format!("{}", self.cur_token.token_type).bold().cyan()
			)))
		}
	}

	/// Builds a syntax error at the current token's offset.
	fn fail(&self, message: String) -> anyhow::Error {
		CompileError::syntax(message, self.cur_token.offset).into()
	}

	/// Parses a run of statements. Stops (without error) at the first token that cannot begin a statement, which
	/// is how block terminators like `endif`, `else`, `until` and `endsub` hand control back to their construct.
	fn parse_statements(&mut self) -> anyhow::Result<Vec<Node>> {
		let mut statements = Vec::new();
		loop {
			let statement = match self.cur_token.token_type {
				TokenType::KeywordLet => self.parse_assignment()?,
				TokenType::KeywordIf => self.parse_if()?,
				TokenType::KeywordRepeat => self.parse_loop()?,
				TokenType::KeywordExit => self.parse_exit()?,
				TokenType::KeywordSub => self.parse_proc(false)?,
				TokenType::KeywordFunc => self.parse_proc(true)?,
				TokenType::KeywordReturn => self.parse_subreturn()?,
				TokenType::KeywordExtern => self.parse_extern()?,
				TokenType::Identifier => {
					// One token of lookahead decides between a call statement and a reassignment.
					if self.scanner.next_token(true)?.token_type == TokenType::LeftParenthesis {
						let callee = self.accept(TokenType::Identifier)?;
						self.parse_call(callee)?
					} else {
						self.parse_lmodify()?
					}
				},
				_ => return Ok(statements),
			};
			statements.push(statement);
		}
	}

	/// Parses `let IDENT = (array | expression) [const]`.
	fn parse_assignment(&mut self) -> anyhow::Result<Node> {
		self.accept(TokenType::KeywordLet)?;
		let name = self.accept(TokenType::Identifier)?;
		self.accept(TokenType::Equal)?;

		let value = if self.cur_token.token_type == TokenType::LeftBracket {
			// let my_var = [1, 2, 3]
			self.parse_array()?
		} else {
			// let my_var = (3 + 42)
			self.parse_expression()?
		};

		let is_const = if self.cur_token.token_type == TokenType::KeywordConst {
			self.accept(TokenType::KeywordConst)?;
			true
		} else {
			false
		};

		Ok(Node::Assignment(AssignmentNode {
			target: AssignTarget::Variable(name),
			value: Box::new(value),
			modify: false,
			is_const,
		}))
	}

	/// Parses a reassignment of an existing variable or array element.
	fn parse_lmodify(&mut self) -> anyhow::Result<Node> {
		let lvalue = self.parse_value()?;
		let target = match lvalue {
			Node::Value(ValueNode::Identifier(token)) => AssignTarget::Variable(token),
			Node::Value(ValueNode::Element { name, index }) => AssignTarget::Element { name, index },
			_ => return Err(self.fail("Expected an assignable value on the left of '='".to_owned())),
		};
		self.accept(TokenType::Equal)?;
		let value = self.parse_expression()?;
		Ok(Node::Assignment(AssignmentNode { target, value: Box::new(value), modify: true, is_const: false }))
	}

	/// Parses an `if <expr> then ... [elseif <expr> then ...]* [else ...] endif` chain.
	fn parse_if(&mut self) -> anyhow::Result<Node> {
		self.accept(TokenType::KeywordIf)?;
		let condition = self.parse_expression()?;
		self.accept(TokenType::KeywordThen)?;
		let body = self.parse_statements()?;

		let mut elseifs = Vec::new();
		while self.cur_token.token_type == TokenType::KeywordElseif {
			self.accept(TokenType::KeywordElseif)?;
			let elseif_condition = self.parse_expression()?;
			self.accept(TokenType::KeywordThen)?;
			let elseif_body = self.parse_statements()?;
			elseifs.push(ElseIf { condition: elseif_condition, body: elseif_body });
		}

		let else_body = if self.cur_token.token_type == TokenType::KeywordElse {
			self.accept(TokenType::KeywordElse)?;
			Some(self.parse_statements()?)
		} else {
			None
		};

		self.accept(TokenType::KeywordEndif)?;
		Ok(Node::If(IfNode { condition: Box::new(condition), body, elseifs, else_body }))
	}

	/// Parses a `repeat ... (forever | until <expr>)` loop. `forever` builds the synthetic `1 <> 1` condition
	/// tested at the top; `until` keeps the written condition at the bottom.
	fn parse_loop(&mut self) -> anyhow::Result<Node> {
		self.loops += 1;
		self.accept(TokenType::KeywordRepeat)?;
		let body = self.parse_statements()?;

		let node = match self.cur_token.token_type {
			TokenType::KeywordForever => {
				self.accept(TokenType::KeywordForever)?;
				let forever_condition = Node::Expression(ExpressionNode {
					left: Box::new(Node::Value(ValueNode::Number(1.0))),
					right: Box::new(Node::Value(ValueNode::Number(1.0))),
					op: ExprOp::NotEqual,
				});
				Node::Loop(LoopNode { condition: Box::new(forever_condition), body, condition_pos: ConditionPos::Top })
			},
			TokenType::KeywordUntil => {
				self.accept(TokenType::KeywordUntil)?;
				let condition = self.parse_expression()?;
				Node::Loop(LoopNode { condition: Box::new(condition), body, condition_pos: ConditionPos::Bottom })
			},
			_ => return Err(self.fail("Missing loop body terminator; expected Keyword Forever or Keyword Until".to_owned())),
		};

		self.loops -= 1;
		Ok(node)
	}

	/// Parses an `exit` statement, which is only valid inside a loop.
	fn parse_exit(&mut self) -> anyhow::Result<Node> {
		if self.loops == 0 {
			return Err(self.fail("Exit without loop".to_owned()));
		}
		self.accept(TokenType::KeywordExit)?;
		Ok(Node::Exit)
	}

	/// Parses the argument list and closing parenthesis of a call; the callee identifier has already been
	/// consumed.
	fn parse_call(&mut self, callee: Token) -> anyhow::Result<Node> {
		self.accept(TokenType::LeftParenthesis)?;

		let mut args = Vec::new();
		while !matches!(self.cur_token.token_type, TokenType::RightParenthesis | TokenType::Eof) {
			if self.cur_token.token_type == TokenType::Comma {
				self.accept(TokenType::Comma)?;
			} else if self.cur_token.token_type == TokenType::LeftBracket {
				args.push(self.parse_array()?);
			} else {
				args.push(self.parse_expression()?);
			}
		}

		self.accept(TokenType::RightParenthesis)?;
		Ok(Node::Call(CallNode { callee, args }))
	}

	/// Parses an array literal.
	fn parse_array(&mut self) -> anyhow::Result<Node> {
		self.accept(TokenType::LeftBracket)?;

		let mut values = Vec::new();
		while !matches!(self.cur_token.token_type, TokenType::RightBracket | TokenType::Eof) {
			if self.cur_token.token_type == TokenType::Comma {
				self.accept(TokenType::Comma)?;
			} else {
				values.push(self.parse_expression()?);
			}
		}

		self.accept(TokenType::RightBracket)?;
		Ok(Node::Array(ArrayNode { values }))
	}

	/// Parses a `sub`/`func` declaration. Parentheses around the formal arguments are optional when there are
	/// none, required otherwise.
	fn parse_proc(&mut self, is_func: bool) -> anyhow::Result<Node> {
		self.accept(if is_func { TokenType::KeywordFunc } else { TokenType::KeywordSub })?;
		let name = self.accept(TokenType::Identifier)?;

		let mut args = Vec::new();
		if self.cur_token.token_type == TokenType::LeftParenthesis {
			self.accept(TokenType::LeftParenthesis)?;
			while !matches!(self.cur_token.token_type, TokenType::RightParenthesis | TokenType::Eof) {
				if self.cur_token.token_type == TokenType::Comma {
					self.accept(TokenType::Comma)?;
				} else {
					args.push(self.accept(TokenType::Identifier)?);
				}
			}
			self.accept(TokenType::RightParenthesis)?;
		}

		let was_func = self.cur_proc_is_func;
		self.cur_proc_is_func = is_func;
		let body = self.parse_statements()?;
		self.cur_proc_is_func = was_func;

		self.accept(if is_func { TokenType::KeywordEndfunc } else { TokenType::KeywordEndsub })?;
		let proc = ProcNode { name, args, body };
		Ok(if is_func { Node::Func(proc) } else { Node::Sub(proc) })
	}

	/// Parses a `return` statement. Inside a `func` the return value is any following expression; inside a `sub`
	/// only tokens that cannot begin a statement are taken as a (discarded) value, so `return` followed by a call
	/// statement keeps the call.
	fn parse_subreturn(&mut self) -> anyhow::Result<Node> {
		self.accept(TokenType::KeywordReturn)?;

		let starters = if self.cur_proc_is_func { FUNC_RETURN_STARTERS } else { SUB_RETURN_STARTERS };
		let value = if starters.contains(&self.cur_token.token_type) {
			Some(Box::new(self.parse_expression()?))
		} else {
			None
		};

		Ok(Node::Return(ReturnNode { value }))
	}

	/// Parses `extern func IDENT`.
	fn parse_extern(&mut self) -> anyhow::Result<Node> {
		self.accept(TokenType::KeywordExtern)?;
		if self.cur_token.token_type != TokenType::KeywordFunc {
			return Err(self.fail(format!(
				"Invalid external type {}",
				format!("{}", self.cur_token.token_type).bold().cyan()
			)));
		}
		self.accept(TokenType::KeywordFunc)?;
		let identifier = self.accept(TokenType::Identifier)?;
		Ok(Node::Extern(ExternNode { identifier }))
	}

	/// Parses `import "<path>"`.
	fn parse_import(&mut self) -> anyhow::Result<Node> {
		self.accept(TokenType::KeywordImport)?;
		let file = self.accept(TokenType::String)?;
		Ok(Node::Import(ImportNode { file: file.text().to_owned() }))
	}

	// Expression parsing, lowest precedence first. Each level recurses into itself on the right, which matches the
	// direction the emitter pushes operands in.

	fn parse_expression(&mut self) -> anyhow::Result<Node> {
		let left = self.parse_andexpr()?;
		if self.cur_token.token_type == TokenType::KeywordOr {
			self.accept(TokenType::KeywordOr)?;
			let right = self.parse_expression()?;
			return Ok(Node::Expression(ExpressionNode { left: Box::new(left), right: Box::new(right), op: ExprOp::Or }));
		}
		Ok(left)
	}

	fn parse_andexpr(&mut self) -> anyhow::Result<Node> {
		let left = self.parse_notexpr()?;
		if self.cur_token.token_type == TokenType::KeywordAnd {
			self.accept(TokenType::KeywordAnd)?;
			let right = self.parse_andexpr()?;
			return Ok(Node::Expression(ExpressionNode { left: Box::new(left), right: Box::new(right), op: ExprOp::And }));
		}
		Ok(left)
	}

	/// Reserved precedence level for a dedicated `not` expression rule. `not` and `!` are currently both handled
	/// as unary signs further down, so this just passes through.
	fn parse_notexpr(&mut self) -> anyhow::Result<Node> {
		self.parse_compareexpr()
	}

	fn parse_compareexpr(&mut self) -> anyhow::Result<Node> {
		let left = self.parse_addexpr()?;
		let op = match self.cur_token.token_type {
			TokenType::Equal => Some(ExprOp::Equal),
			TokenType::NotEqual => Some(ExprOp::NotEqual),
			TokenType::LessThan => Some(ExprOp::LessThan),
			TokenType::LessThanEqual => Some(ExprOp::LessThanEqual),
			TokenType::GreaterThan => Some(ExprOp::GreaterThan),
			TokenType::GreaterThanEqual => Some(ExprOp::GreaterThanEqual),
			_ => None,
		};
		if let Some(op) = op {
			self.accept(self.cur_token.token_type)?;
			let right = self.parse_compareexpr()?;
			return Ok(Node::Expression(ExpressionNode { left: Box::new(left), right: Box::new(right), op }));
		}
		Ok(left)
	}

	fn parse_addexpr(&mut self) -> anyhow::Result<Node> {
		let left = self.parse_modexpr()?;
		let op = match self.cur_token.token_type {
			TokenType::Plus => Some(TermOp::Add),
			TokenType::Minus => Some(TermOp::Sub),
			_ => None,
		};
		if let Some(op) = op {
			self.accept(self.cur_token.token_type)?;
			let right = self.parse_addexpr()?;
			return Ok(Node::Term(TermNode { left: Box::new(left), right: Box::new(right), op }));
		}
		Ok(left)
	}

	fn parse_modexpr(&mut self) -> anyhow::Result<Node> {
		let left = self.parse_multexpr()?;
		if self.cur_token.token_type == TokenType::Percent {
			self.accept(TokenType::Percent)?;
			let right = self.parse_modexpr()?;
			return Ok(Node::Term(TermNode { left: Box::new(left), right: Box::new(right), op: TermOp::Mod }));
		}
		Ok(left)
	}

	fn parse_multexpr(&mut self) -> anyhow::Result<Node> {
		let left = self.parse_negateexpr()?;
		let op = match self.cur_token.token_type {
			TokenType::Asterisk => Some(TermOp::Mul),
			TokenType::ForwardSlash => Some(TermOp::Div),
			_ => None,
		};
		if let Some(op) = op {
			self.accept(self.cur_token.token_type)?;
			let right = self.parse_multexpr()?;
			return Ok(Node::Term(TermNode { left: Box::new(left), right: Box::new(right), op }));
		}
		Ok(left)
	}

	/// Parses an optionally signed sub-expression. A sign applied to a numeric literal folds into the literal
	/// (`-3` becomes the single value `-3`); anything else becomes a unary node lowered to `NEG`/`NOT`.
	fn parse_negateexpr(&mut self) -> anyhow::Result<Node> {
		let sign = match self.cur_token.token_type {
			TokenType::Minus => Some(UnarySign::Minus),
			TokenType::Plus => Some(UnarySign::Plus),
			TokenType::Bang | TokenType::KeywordNot => Some(UnarySign::Not),
			_ => None,
		};

		let Some(sign) = sign else {
			return self.parse_subexpr();
		};
		self.accept(self.cur_token.token_type)?;
		let value = self.parse_subexpr()?;

		match (sign, value) {
			(UnarySign::Minus, Node::Value(ValueNode::Number(number))) => Ok(Node::Value(ValueNode::Number(-number))),
			(UnarySign::Plus, Node::Value(ValueNode::Number(number))) => Ok(Node::Value(ValueNode::Number(number))),
			(sign, value) => Ok(Node::Unary(UnaryNode { value: Box::new(value), sign })),
		}
	}

	fn parse_subexpr(&mut self) -> anyhow::Result<Node> {
		if self.cur_token.token_type == TokenType::LeftParenthesis {
			self.accept(TokenType::LeftParenthesis)?;
			let node = self.parse_expression()?;
			self.accept(TokenType::RightParenthesis)?;
			return Ok(node);
		}
		self.parse_value()
	}

	/// Parses a literal, identifier, array element, or call-as-rvalue.
	fn parse_value(&mut self) -> anyhow::Result<Node> {
		match self.cur_token.token_type {
			TokenType::Number => {
				let token = self.accept(TokenType::Number)?;
				Ok(Node::Value(ValueNode::Number(token.number())))
			},
			TokenType::String => {
				let token = self.accept(TokenType::String)?;
				Ok(Node::Value(ValueNode::Text(token.text().to_owned())))
			},
			TokenType::Identifier => {
				let token = self.accept(TokenType::Identifier)?;
				if self.cur_token.token_type == TokenType::LeftBracket {
					// Access an array at the given index, i.e. my_var[0]
					self.accept(TokenType::LeftBracket)?;
					let index = self.parse_expression()?;
					self.accept(TokenType::RightBracket)?;
					Ok(Node::Value(ValueNode::Element { name: token, index: Box::new(index) }))
				} else if self.cur_token.token_type == TokenType::LeftParenthesis {
					// Subroutine / function call as rvalue
					self.parse_call(token)
				} else {
					Ok(Node::Value(ValueNode::Identifier(token)))
				}
			},
			found => Err(self.fail(format!("Expected a value but found {}", format!("{found}").bold().cyan()))),
		}
	}
}

/// Cleans raw source before scanning: every line is left-trimmed, empty lines are dropped, and the rest are
/// rejoined with `\n`. This has no semantic effect beyond making character offsets in diagnostics match what the
/// scanner saw.
#[must_use]
pub fn clean_source(input: &str) -> String {
	input
		.lines()
		.map(str::trim_start)
		.filter(|line| !line.is_empty())
		.collect::<Vec<_>>()
		.join("\n")
}
