// Bring the `Casing` trait into scope, which allows us to use `.to_case()` on strings. This is used to convert
// `TokenType` enum variant names into Title Case, which is useful for outputting human-readable errors. We assign
// this to `as _` to indicate clearly that the trait is not referenced directly and only used to bring its methods
// into scope to be called.
use convert_case::Casing as _;

use crate::error::CompileError;

/// A type of token in evoscript source code. The first step of compilation is scanning, which splits a raw string
/// of source code into tokens which each have a "type" representing the kind of token, an optional "value" (the
/// number, string, or identifier text), and the character offset where the token starts.
///
/// # Conventions
///
/// Operator and punctuation types are named by what the token itself appears as, not by its usage in the language:
/// the `%` token is `Percent`, not "modulo", because the parser decides what it means (and the `mod` keyword maps
/// to the very same type). Keyword types carry a `Keyword` prefix. The names should stay parser-agnostic so token
/// types can be repurposed without renaming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenType {
	/// A number literal. A run of digits optionally containing one `.`; a leading `.` is allowed (`.3` means
	/// `0.3`) and a second `.` is a lexical error. `0x`-prefixed hexadecimal integers are also accepted. The value
	/// is always stored as a 64-bit float, which is the only numeric type the VM knows.
	Number,

	/// A string literal: everything between a pair of double quotes. Quotes cannot be nested or escaped; an
	/// unterminated string is a lexical error. The token value holds the contents without the quotes.
	String,

	/// An identifier: `[A-Za-z_][A-Za-z0-9_]*`. A digit-leading identifier is a lexical error. Reserved words are
	/// never tokenized as identifiers; they resolve through the keyword table first.
	Identifier,

	/// The "equal" token (=). This is both assignment and equality; the parser disambiguates by context.
	Equal,
	/// The "plus" token (+).
	Plus,
	/// The "minus" token (-).
	Minus,
	/// The "asterisk" token (*), used for multiplication.
	Asterisk,
	/// The "forward slash" token (/), used for division.
	ForwardSlash,
	/// The "bang" token (!), used for logical negation.
	Bang,
	/// The "percent" token (%), used for modulo. The `mod` keyword tokenizes to this same type.
	Percent,

	/// The left parenthesis token.
	LeftParenthesis,
	/// The right parenthesis token.
	RightParenthesis,
	/// The left bracket token ([), used for array literals and subscripts.
	LeftBracket,
	/// The right bracket token (]).
	RightBracket,
	/// The comma token (,), used to separate array elements and call arguments.
	Comma,

	/// The "less than" token (<).
	LessThan,
	/// The "less than or equal" token (<=). Requires one character of lookahead in the scanner.
	LessThanEqual,
	/// The "not equal" token (<>). Requires one character of lookahead in the scanner.
	NotEqual,
	/// The "greater than" token (>).
	GreaterThan,
	/// The "greater than or equal" token (>=). Requires one character of lookahead in the scanner.
	GreaterThanEqual,

	/// The `if` keyword, which opens a conditional block.
	KeywordIf,
	/// The `then` keyword, which separates a condition from its block.
	KeywordThen,
	/// The `else` keyword.
	KeywordElse,
	/// The `elseif` keyword.
	KeywordElseif,
	/// The `endif` keyword, which closes a conditional block.
	KeywordEndif,

	/// The `let` keyword, which declares a variable.
	KeywordLet,
	/// The `const` keyword. Trails a declaration to make it constant, i.e. `let x = 3 const`.
	KeywordConst,

	/// The `repeat` keyword, which opens a loop.
	KeywordRepeat,
	/// The `forever` keyword, which closes a loop that only terminates via `exit`.
	KeywordForever,
	/// The `until` keyword, which closes a loop with a bottom-tested condition.
	KeywordUntil,
	/// The `exit` keyword, which breaks out of the innermost loop.
	KeywordExit,

	/// The `and` keyword, logical conjunction.
	KeywordAnd,
	/// The `or` keyword, logical disjunction.
	KeywordOr,
	/// The `not` keyword, logical negation. Routed to the same lowering as the `!` token.
	KeywordNot,

	/// The `sub` keyword, which declares a subroutine (no return value).
	KeywordSub,
	/// The `endsub` keyword.
	KeywordEndsub,
	/// The `return` keyword. Inside a `func` it may carry a return expression.
	KeywordReturn,
	/// The `func` keyword, which declares a function (returns a value).
	KeywordFunc,
	/// The `endfunc` keyword.
	KeywordEndfunc,

	/// The `extern` keyword, which declares an externally registered function.
	KeywordExtern,
	/// The `import` keyword. Only valid at the start of a source unit.
	KeywordImport,

	/// The end of the token stream. Returned forever once the cursor has passed the last character, so the parser
	/// never has to deal with an "absent" token.
	Eof,
}

/// The keyword table. A closed map from reserved word to token type; identifiers are looked up here before being
/// tokenized as `Identifier`. Note that `mod` maps to the `%` operator token rather than a keyword of its own.
static KEYWORDS: phf::Map<&'static str, TokenType> = phf::phf_map! {
	"if" => TokenType::KeywordIf,
	"then" => TokenType::KeywordThen,
	"else" => TokenType::KeywordElse,
	"elseif" => TokenType::KeywordElseif,
	"endif" => TokenType::KeywordEndif,
	"let" => TokenType::KeywordLet,
	"const" => TokenType::KeywordConst,
	"repeat" => TokenType::KeywordRepeat,
	"forever" => TokenType::KeywordForever,
	"until" => TokenType::KeywordUntil,
	"exit" => TokenType::KeywordExit,
	"and" => TokenType::KeywordAnd,
	"or" => TokenType::KeywordOr,
	"not" => TokenType::KeywordNot,
	"sub" => TokenType::KeywordSub,
	"endsub" => TokenType::KeywordEndsub,
	"return" => TokenType::KeywordReturn,
	"func" => TokenType::KeywordFunc,
	"endfunc" => TokenType::KeywordEndfunc,
	"extern" => TokenType::KeywordExtern,
	"import" => TokenType::KeywordImport,
	"mod" => TokenType::Percent,
};

impl std::fmt::Display for TokenType {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", format!("{self:?}").to_case(convert_case::Case::Title))
	}
}

/// The value carried by a token. Number tokens carry their parsed 64-bit float; string and identifier tokens carry
/// text; everything else carries nothing.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenValue {
	/// No value; operators, punctuation and keywords.
	None,
	/// A parsed numeric literal.
	Number(f64),
	/// String literal contents or an identifier name.
	Text(String),
}

/// A token in source code.
#[derive(Debug, Clone)]
pub struct Token {
	/// The type of the token.
	pub token_type: TokenType,
	/// The value of the token, if its type carries one.
	pub value: TokenValue,
	/// The character offset in the (cleaned) source where the token starts. Used for error printing.
	pub offset: usize,
}

impl Token {
	/// Returns the numeric value of this token, or `0.0` if it carries none. Only meaningful on `Number` tokens.
	#[must_use]
	pub fn number(&self) -> f64 {
		match self.value {
			TokenValue::Number(number) => number,
			_ => 0.0,
		}
	}

	/// Returns the text value of this token, or the empty string if it carries none. Only meaningful on `String`
	/// and `Identifier` tokens.
	#[must_use]
	pub fn text(&self) -> &str {
		match &self.value {
			TokenValue::Text(text) => text,
			_ => "",
		}
	}
}

/// The handwritten scanner. Owns a character cursor over the source and produces tokens on demand via
/// `next_token`, which supports a peek mode that returns the upcoming token without advancing the cursor. The
/// parser relies on that single token of lookahead to tell a call statement from a reassignment.
pub struct Scanner {
	/// The source as characters; offsets index into this.
	chars: Vec<char>,
	/// The cursor. Always points at the next character to consume.
	offset: usize,
}

impl Scanner {
	/// Creates a scanner over the given source string.
	#[must_use]
	pub fn new(source: &str) -> Self {
		Self {
			chars: source.chars().collect(),
			offset: 0,
		}
	}

	/// Returns the current character offset of the cursor.
	#[must_use]
	pub const fn char_offset(&self) -> usize {
		self.offset
	}

	/// Returns the next available token. With `peek` set, the token is scanned but the cursor is left untouched,
	/// so the following call returns the same token again; this must hold for every token kind, including
	/// multi-character ones like numbers and identifiers.
	///
	/// Once the source is exhausted this returns an `Eof` token forever.
	///
	/// # Errors
	/// A `CompileError::Lexical` when the characters at the cursor form no valid token: an unknown character, an
	/// unterminated string, a number with two decimal points, or a digit-leading identifier.
	pub fn next_token(&mut self, peek: bool) -> anyhow::Result<Token> {
		if peek {
			let saved = self.offset;
			let token = self.scan_token();
			self.offset = saved;
			token
		} else {
			self.scan_token()
		}
	}

	/// Scans the token at the cursor, advancing past it.
	fn scan_token(&mut self) -> anyhow::Result<Token> {
		self.skip_whitespace_and_comments();

		let start = self.offset;
		let Some(character) = self.current() else {
			return Ok(Token { token_type: TokenType::Eof, value: TokenValue::None, offset: start });
		};

		match character {
			'(' => Ok(self.single(TokenType::LeftParenthesis)),
			')' => Ok(self.single(TokenType::RightParenthesis)),
			'[' => Ok(self.single(TokenType::LeftBracket)),
			']' => Ok(self.single(TokenType::RightBracket)),
			',' => Ok(self.single(TokenType::Comma)),
			'+' => Ok(self.single(TokenType::Plus)),
			'-' => Ok(self.single(TokenType::Minus)),
			'*' => Ok(self.single(TokenType::Asterisk)),
			'/' => Ok(self.single(TokenType::ForwardSlash)),
			'%' => Ok(self.single(TokenType::Percent)),
			'=' => Ok(self.single(TokenType::Equal)),
			'!' => Ok(self.single(TokenType::Bang)),
			'<' => {
				self.advance();
				match self.current() {
					Some('=') => {
						self.advance();
						Ok(Token { token_type: TokenType::LessThanEqual, value: TokenValue::None, offset: start })
					},
					Some('>') => {
						self.advance();
						Ok(Token { token_type: TokenType::NotEqual, value: TokenValue::None, offset: start })
					},
					_ => Ok(Token { token_type: TokenType::LessThan, value: TokenValue::None, offset: start }),
				}
			},
			'>' => {
				self.advance();
				if self.current() == Some('=') {
					self.advance();
					Ok(Token { token_type: TokenType::GreaterThanEqual, value: TokenValue::None, offset: start })
				} else {
					Ok(Token { token_type: TokenType::GreaterThan, value: TokenValue::None, offset: start })
				}
			},
			'"' => self.scan_string(start),
			character if character.is_ascii_digit() || character == '.' => self.scan_number(start),
			character if character.is_alphabetic() || character == '_' => Ok(self.scan_identifier_or_keyword(start)),
			character => Err(CompileError::lexical(format!("Wrong character '{character}'"), start).into()),
		}
	}

	/// Consumes the character at the cursor and returns a valueless token of the given type.
	fn single(&mut self, token_type: TokenType) -> Token {
		let token = Token { token_type, value: TokenValue::None, offset: self.offset };
		self.advance();
		token
	}

	fn current(&self) -> Option<char> {
		self.chars.get(self.offset).copied()
	}

	fn advance(&mut self) {
		self.offset += 1;
	}

	/// Skips whitespace between tokens and `#` line comments, which run to the end of the line.
	fn skip_whitespace_and_comments(&mut self) {
		while let Some(character) = self.current() {
			if character.is_whitespace() {
				self.advance();
			} else if character == '#' {
				while !matches!(self.current(), None | Some('\n')) {
					self.advance();
				}
			} else {
				break;
			}
		}
	}

	/// Scans a number literal. Handles the decimal form (one optional `.`, leading `.` allowed) and the `0x` hex
	/// form. A trailing identifier character means someone tried to start an identifier with a digit.
	fn scan_number(&mut self, start: usize) -> anyhow::Result<Token> {
		// Hex literals: 0x prefix followed by at least one hex digit.
		if self.current() == Some('0') && self.chars.get(self.offset + 1).copied() == Some('x') {
			self.advance();
			self.advance();
			let mut digits = String::new();
			while let Some(character) = self.current() {
				if character.is_ascii_hexdigit() {
					digits.push(character);
					self.advance();
				} else {
					break;
				}
			}
			if digits.is_empty() {
				return Err(CompileError::lexical("Malformed hexadecimal number", start).into());
			}
			self.reject_identifier_tail(start)?;
			let value = u64::from_str_radix(&digits, 16).map_err(|_| CompileError::lexical("Malformed hexadecimal number", start))?;
			#[allow(clippy::cast_precision_loss)]
			return Ok(Token { token_type: TokenType::Number, value: TokenValue::Number(value as f64), offset: start });
		}

		let mut text = String::new();
		let mut scanned_dot = false;
		while let Some(character) = self.current() {
			if character == '.' {
				// A leading dot without a digit (.3) is fine; a second dot is not.
				if scanned_dot {
					return Err(CompileError::lexical("Malformed number", self.offset).into());
				}
				scanned_dot = true;
			} else if !character.is_ascii_digit() {
				break;
			}
			text.push(character);
			self.advance();
		}

		self.reject_identifier_tail(start)?;
		let value = text.parse::<f64>().map_err(|_| CompileError::lexical("Malformed number", start))?;
		Ok(Token { token_type: TokenType::Number, value: TokenValue::Number(value), offset: start })
	}

	/// Rejects an identifier character directly after a digit run, i.e. `9abc`.
	fn reject_identifier_tail(&self, start: usize) -> anyhow::Result<()> {
		if let Some(character) = self.current() {
			if character.is_alphabetic() || character == '_' {
				return Err(CompileError::lexical("Identifiers must not start with a digit", start).into());
			}
		}
		Ok(())
	}

	/// Scans a string literal. The opening quote is at the cursor; everything up to the next quote becomes the
	/// token value. Running off the end of the source first is the unterminated-string error.
	fn scan_string(&mut self, start: usize) -> anyhow::Result<Token> {
		self.advance();
		let mut text = String::new();
		while let Some(character) = self.current() {
			if character == '"' {
				self.advance();
				return Ok(Token { token_type: TokenType::String, value: TokenValue::Text(text), offset: start });
			}
			text.push(character);
			self.advance();
		}
		Err(CompileError::lexical("Missing closing quotes", start).into())
	}

	/// Scans an identifier and resolves it against the keyword table. Keywords produce their dedicated token types
	/// with no value; everything else is an `Identifier` carrying its name.
	fn scan_identifier_or_keyword(&mut self, start: usize) -> Token {
		let mut text = String::new();
		while let Some(character) = self.current() {
			if character.is_alphanumeric() || character == '_' {
				text.push(character);
				self.advance();
			} else {
				break;
			}
		}

		if let Some(keyword) = KEYWORDS.get(text.as_str()) {
			Token { token_type: *keyword, value: TokenValue::None, offset: start }
		} else {
			Token { token_type: TokenType::Identifier, value: TokenValue::Text(text), offset: start }
		}
	}
}
