//! Lexer for AIMacro sources.
//!
//! `tokenize` returns a lazy iterator over the source; `lex` drains it
//! into a token vector plus diagnostics. Layout is never significant:
//! spaces, tabs and newlines only separate tokens, blocks are closed by
//! the `end` keyword.
//!
//! The `ailang { ... }` and `asm { ... }` escape hatches are recognized
//! here. After one of those keywords an opening brace switches the lexer
//! into raw mode, the payload up to the matching brace becomes a single
//! `RawText` token and nothing inside it is interpreted.

use thiserror::Error;

use crate::diagnostic::{Diagnostic, DiagnosticKind};
use crate::span::{FileId, Span};

/// Kind of a token produced by the lexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    // Special
    Eof,
    Unknown,

    // Identifiers and literals
    Ident,
    IntLiteral,
    FloatLiteral,
    StringLiteral,
    FStringLiteral, // f"..."
    BoolLiteral,    // True / False
    NoneLiteral,    // None

    // Escape hatches
    RawOpen,  // {
    RawText,  // payload
    RawClose, // }

    // Punctuation
    LParen,   // (
    RParen,   // )
    LBracket, // [
    RBracket, // ]
    LBrace,   // {
    RBrace,   // }
    Comma,    // ,
    Semi,     // ;
    Colon,    // :
    Dot,      // .
    Arrow,    // ->

    // Operators
    Plus,         // +
    Minus,        // -
    Star,         // *
    StarStar,     // **
    Slash,        // /
    SlashSlash,   // //
    Percent,      // %
    Equal,        // =
    EqualEqual,   // ==
    NotEqual,     // !=
    Less,         // <
    LessEqual,    // <=
    Greater,      // >
    GreaterEqual, // >=
    PlusEqual,    // +=
    MinusEqual,   // -=
    StarEqual,    // *=
    SlashEqual,   // /=

    // Keywords
    Def,
    Func,
    End,
    Return,
    If,
    Elif,
    Else,
    For,
    While,
    In,
    Break,
    Continue,
    Pass,
    And,
    Or,
    Not,
    Ailang,
    Asm,
    /// Python keyword with no meaning in this dialect (`class`, `import`, ...).
    Reserved,
}

impl TokenKind {
    /// Human readable description used in parse errors.
    pub fn describe(self) -> &'static str {
        match self {
            TokenKind::Eof => "end of file",
            TokenKind::Unknown => "unknown character",
            TokenKind::Ident => "identifier",
            TokenKind::IntLiteral => "integer literal",
            TokenKind::FloatLiteral => "float literal",
            TokenKind::StringLiteral => "string literal",
            TokenKind::FStringLiteral => "f-string",
            TokenKind::BoolLiteral => "boolean literal",
            TokenKind::NoneLiteral => "`None`",
            TokenKind::RawOpen => "`{`",
            TokenKind::RawText => "raw block contents",
            TokenKind::RawClose => "`}`",
            TokenKind::LParen => "`(`",
            TokenKind::RParen => "`)`",
            TokenKind::LBracket => "`[`",
            TokenKind::RBracket => "`]`",
            TokenKind::LBrace => "`{`",
            TokenKind::RBrace => "`}`",
            TokenKind::Comma => "`,`",
            TokenKind::Semi => "`;`",
            TokenKind::Colon => "`:`",
            TokenKind::Dot => "`.`",
            TokenKind::Arrow => "`->`",
            TokenKind::Plus => "`+`",
            TokenKind::Minus => "`-`",
            TokenKind::Star => "`*`",
            TokenKind::StarStar => "`**`",
            TokenKind::Slash => "`/`",
            TokenKind::SlashSlash => "`//`",
            TokenKind::Percent => "`%`",
            TokenKind::Equal => "`=`",
            TokenKind::EqualEqual => "`==`",
            TokenKind::NotEqual => "`!=`",
            TokenKind::Less => "`<`",
            TokenKind::LessEqual => "`<=`",
            TokenKind::Greater => "`>`",
            TokenKind::GreaterEqual => "`>=`",
            TokenKind::PlusEqual => "`+=`",
            TokenKind::MinusEqual => "`-=`",
            TokenKind::StarEqual => "`*=`",
            TokenKind::SlashEqual => "`/=`",
            TokenKind::Def => "`def`",
            TokenKind::Func => "`func`",
            TokenKind::End => "`end`",
            TokenKind::Return => "`return`",
            TokenKind::If => "`if`",
            TokenKind::Elif => "`elif`",
            TokenKind::Else => "`else`",
            TokenKind::For => "`for`",
            TokenKind::While => "`while`",
            TokenKind::In => "`in`",
            TokenKind::Break => "`break`",
            TokenKind::Continue => "`continue`",
            TokenKind::Pass => "`pass`",
            TokenKind::And => "`and`",
            TokenKind::Or => "`or`",
            TokenKind::Not => "`not`",
            TokenKind::Ailang => "`ailang`",
            TokenKind::Asm => "`asm`",
            TokenKind::Reserved => "reserved keyword",
        }
    }
}

/// A single token with its kind and span.
///
/// For string-like tokens `text_start..text_end` covers the contents
/// without quotes (and without the `f` prefix); for every other token it
/// equals the span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
    pub text_start: u32,
    pub text_end: u32,
}

impl Token {
    pub fn text<'a>(&self, source: &'a str) -> &'a str {
        source
            .get(self.text_start as usize..self.text_end as usize)
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct LexError {
    pub message: String,
    pub span: Span,
}

/// Result of lexing a source file.
#[derive(Debug)]
pub struct LexResult {
    pub tokens: Vec<Token>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Lazily tokenize a standalone source string.
pub fn tokenize(source: &str) -> Lexer<'_> {
    Lexer::new(FileId::default(), source)
}

/// Lex a whole file, collecting errors as diagnostics.
///
/// The token vector always ends with `Eof`.
pub fn lex(file_id: FileId, source: &str) -> LexResult {
    let mut tokens = Vec::new();
    let mut diagnostics = Vec::new();
    for item in Lexer::new(file_id, source) {
        match item {
            Ok(tok) => tokens.push(tok),
            Err(err) => {
                diagnostics.push(Diagnostic::error(DiagnosticKind::LexError, err.message, err.span))
            }
        }
    }
    LexResult {
        tokens,
        diagnostics,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Normal,
    /// Previous token was `ailang` or `asm`.
    RawPending,
    /// Just emitted `RawOpen` at the given offset.
    RawBody(u32),
    RawClose,
    Finished,
}

pub struct Lexer<'src> {
    file_id: FileId,
    chars: &'src [u8],
    source: &'src str,
    len: usize,
    index: usize,
    mode: Mode,
}

impl<'src> Lexer<'src> {
    pub fn new(file_id: FileId, source: &'src str) -> Self {
        Lexer::with_range(file_id, source, 0, source.len())
    }

    /// Lex only `source[start..end]`; token offsets still refer to the
    /// full `source`. Used for f-string replacement fields.
    pub fn with_range(file_id: FileId, source: &'src str, start: usize, end: usize) -> Self {
        Lexer {
            file_id,
            chars: source.as_bytes(),
            source,
            len: end.min(source.len()),
            index: start,
            mode: Mode::Normal,
        }
    }

    fn next_token(&mut self) -> Option<Result<Token, LexError>> {
        match self.mode {
            Mode::Finished => return None,
            Mode::RawBody(open) => return Some(self.lex_raw_body(open)),
            Mode::RawClose => {
                let start = self.index as u32;
                self.consume_char();
                self.mode = Mode::Normal;
                return Some(Ok(self.simple_token(TokenKind::RawClose, start)));
            }
            Mode::Normal | Mode::RawPending => {}
        }

        self.skip_trivia();

        let Some(ch) = self.peek_char() else {
            self.mode = Mode::Finished;
            let end = self.len as u32;
            return Some(Ok(Token {
                kind: TokenKind::Eof,
                span: Span::new(self.file_id, end, end),
                text_start: end,
                text_end: end,
            }));
        };
        let start = self.index as u32;

        if self.mode == Mode::RawPending {
            self.mode = Mode::Normal;
            if ch == b'{' {
                self.consume_char();
                self.mode = Mode::RawBody(start);
                return Some(Ok(self.simple_token(TokenKind::RawOpen, start)));
            }
        }

        let token = match ch {
            b'(' => self.single(TokenKind::LParen, start),
            b')' => self.single(TokenKind::RParen, start),
            b'[' => self.single(TokenKind::LBracket, start),
            b']' => self.single(TokenKind::RBracket, start),
            b'{' => self.single(TokenKind::LBrace, start),
            b'}' => self.single(TokenKind::RBrace, start),
            b',' => self.single(TokenKind::Comma, start),
            b';' => self.single(TokenKind::Semi, start),
            b':' => self.single(TokenKind::Colon, start),
            b'.' => self.single(TokenKind::Dot, start),
            b'%' => self.single(TokenKind::Percent, start),
            b'+' => self.with_equal(TokenKind::Plus, TokenKind::PlusEqual, start),
            b'=' => self.with_equal(TokenKind::Equal, TokenKind::EqualEqual, start),
            b'<' => self.with_equal(TokenKind::Less, TokenKind::LessEqual, start),
            b'>' => self.with_equal(TokenKind::Greater, TokenKind::GreaterEqual, start),
            b'-' => {
                if self.peek_next() == Some(b'>') {
                    self.consume_char(); // '-'
                    self.consume_char(); // '>'
                    self.simple_token(TokenKind::Arrow, start)
                } else {
                    self.with_equal(TokenKind::Minus, TokenKind::MinusEqual, start)
                }
            }
            b'*' => {
                if self.peek_next() == Some(b'*') {
                    self.consume_char();
                    self.consume_char();
                    self.simple_token(TokenKind::StarStar, start)
                } else {
                    self.with_equal(TokenKind::Star, TokenKind::StarEqual, start)
                }
            }
            b'/' => {
                if self.peek_next() == Some(b'/') {
                    self.consume_char();
                    self.consume_char();
                    self.simple_token(TokenKind::SlashSlash, start)
                } else {
                    self.with_equal(TokenKind::Slash, TokenKind::SlashEqual, start)
                }
            }
            b'!' => {
                if self.peek_next() == Some(b'=') {
                    self.consume_char();
                    self.consume_char();
                    self.simple_token(TokenKind::NotEqual, start)
                } else {
                    self.unknown_char(start)
                }
            }
            b'"' | b'\'' => return Some(self.lex_string(start, TokenKind::StringLiteral)),
            b'0'..=b'9' => self.lex_number(start),
            _ if is_ident_start(ch) => {
                if matches!(ch, b'f' | b'F') && matches!(self.peek_next(), Some(b'"' | b'\'')) {
                    self.consume_char(); // 'f'
                    return Some(self.lex_string(start, TokenKind::FStringLiteral));
                }
                self.lex_ident_or_keyword(start)
            }
            _ => self.unknown_char(start),
        };

        if matches!(token.kind, TokenKind::Ailang | TokenKind::Asm) {
            self.mode = Mode::RawPending;
        }
        Some(Ok(token))
    }

    fn skip_trivia(&mut self) {
        while let Some(ch) = self.peek_char() {
            if is_whitespace(ch) {
                self.consume_char();
            } else if ch == b'#' {
                while let Some(c) = self.peek_char() {
                    if c == b'\n' {
                        break;
                    }
                    self.consume_char();
                }
            } else {
                break;
            }
        }
    }

    fn single(&mut self, kind: TokenKind, start: u32) -> Token {
        self.consume_char();
        self.simple_token(kind, start)
    }

    fn with_equal(&mut self, plain: TokenKind, with_eq: TokenKind, start: u32) -> Token {
        self.consume_char();
        if self.peek_char() == Some(b'=') {
            self.consume_char();
            self.simple_token(with_eq, start)
        } else {
            self.simple_token(plain, start)
        }
    }

    fn simple_token(&self, kind: TokenKind, start: u32) -> Token {
        let end = self.index as u32;
        Token {
            kind,
            span: Span::new(self.file_id, start, end),
            text_start: start,
            text_end: end,
        }
    }

    fn unknown_char(&mut self, start: u32) -> Token {
        // Keep multi-byte characters in one token.
        self.consume_char();
        while let Some(ch) = self.peek_char() {
            if ch & 0xC0 == 0x80 {
                self.consume_char();
            } else {
                break;
            }
        }
        self.simple_token(TokenKind::Unknown, start)
    }

    fn lex_raw_body(&mut self, open: u32) -> Result<Token, LexError> {
        let content_start = self.index;
        let mut depth = 1usize;
        while let Some(ch) = self.peek_char() {
            match ch {
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        self.mode = Mode::RawClose;
                        let span = Span::new(self.file_id, content_start as u32, self.index as u32);
                        return Ok(Token {
                            kind: TokenKind::RawText,
                            span,
                            text_start: span.start,
                            text_end: span.end,
                        });
                    }
                }
                _ => {}
            }
            self.consume_char();
        }
        self.mode = Mode::Normal;
        Err(LexError {
            message: "unterminated raw block: missing closing `}`".to_string(),
            span: Span::new(self.file_id, open, open + 1),
        })
    }

    fn lex_string(&mut self, start: u32, kind: TokenKind) -> Result<Token, LexError> {
        let Some(quote) = self.peek_char() else {
            return Err(self.unterminated_string(start));
        };
        self.consume_char();

        let content_start = self.index;
        while let Some(ch) = self.peek_char() {
            match ch {
                b'\\' => {
                    self.consume_char();
                    if self.peek_char().is_some() {
                        self.consume_char();
                    }
                }
                b'\n' => break,
                _ if ch == quote => {
                    let content_end = self.index;
                    self.consume_char(); // closing quote
                    return Ok(Token {
                        kind,
                        span: Span::new(self.file_id, start, self.index as u32),
                        text_start: content_start as u32,
                        text_end: content_end as u32,
                    });
                }
                _ => self.consume_char(),
            }
        }
        Err(self.unterminated_string(start))
    }

    fn unterminated_string(&self, start: u32) -> LexError {
        LexError {
            message: "unterminated string literal".to_string(),
            span: Span::new(self.file_id, start, start + 1),
        }
    }

    fn lex_number(&mut self, start: u32) -> Token {
        if self.peek_char() == Some(b'0') && matches!(self.peek_next(), Some(b'x' | b'X' | b'b' | b'B' | b'o' | b'O')) {
            self.consume_char();
            self.consume_char();
            while let Some(ch) = self.peek_char() {
                if ch.is_ascii_alphanumeric() || ch == b'_' {
                    self.consume_char();
                } else {
                    break;
                }
            }
            return self.simple_token(TokenKind::IntLiteral, start);
        }

        self.digits();
        let mut is_float = false;

        if self.peek_char() == Some(b'.') && self.peek_next().is_some_and(|c| c.is_ascii_digit()) {
            is_float = true;
            self.consume_char(); // '.'
            self.digits();
        }

        if matches!(self.peek_char(), Some(b'e' | b'E')) {
            let after = self.chars.get(self.index + 1).copied();
            let after_sign = self.chars.get(self.index + 2).copied();
            let has_exponent = match after {
                Some(b'0'..=b'9') => true,
                Some(b'+' | b'-') => after_sign.is_some_and(|c| c.is_ascii_digit()),
                _ => false,
            };
            if has_exponent {
                is_float = true;
                self.consume_char(); // 'e'
                if matches!(self.peek_char(), Some(b'+' | b'-')) {
                    self.consume_char();
                }
                self.digits();
            }
        }

        let kind = if is_float {
            TokenKind::FloatLiteral
        } else {
            TokenKind::IntLiteral
        };
        self.simple_token(kind, start)
    }

    fn digits(&mut self) {
        while let Some(ch) = self.peek_char() {
            if ch.is_ascii_digit() || ch == b'_' {
                self.consume_char();
            } else {
                break;
            }
        }
    }

    fn lex_ident_or_keyword(&mut self, start: u32) -> Token {
        while let Some(ch) = self.peek_char() {
            if is_ident_continue(ch) {
                self.consume_char();
            } else {
                break;
            }
        }

        let text = &self.source[start as usize..self.index];
        let kind = keyword(text).unwrap_or(TokenKind::Ident);
        self.simple_token(kind, start)
    }

    fn peek_char(&self) -> Option<u8> {
        if self.index < self.len {
            self.chars.get(self.index).copied()
        } else {
            None
        }
    }

    fn peek_next(&self) -> Option<u8> {
        if self.index + 1 < self.len {
            self.chars.get(self.index + 1).copied()
        } else {
            None
        }
    }

    fn consume_char(&mut self) {
        if self.index < self.len {
            self.index += 1;
        }
    }
}

impl Iterator for Lexer<'_> {
    type Item = Result<Token, LexError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_token()
    }
}

fn keyword(text: &str) -> Option<TokenKind> {
    let kind = match text {
        "def" => TokenKind::Def,
        "func" => TokenKind::Func,
        "end" => TokenKind::End,
        "return" => TokenKind::Return,
        "if" => TokenKind::If,
        "elif" => TokenKind::Elif,
        "else" => TokenKind::Else,
        "for" => TokenKind::For,
        "while" => TokenKind::While,
        "in" => TokenKind::In,
        "break" => TokenKind::Break,
        "continue" => TokenKind::Continue,
        "pass" => TokenKind::Pass,
        "and" => TokenKind::And,
        "or" => TokenKind::Or,
        "not" => TokenKind::Not,
        "ailang" => TokenKind::Ailang,
        "asm" => TokenKind::Asm,
        "True" | "False" => TokenKind::BoolLiteral,
        "None" => TokenKind::NoneLiteral,
        "class" | "import" | "from" | "as" | "is" | "lambda" | "try" | "except" | "finally"
        | "with" | "global" | "nonlocal" | "yield" | "del" | "raise" | "assert" | "async"
        | "await" => TokenKind::Reserved,
        _ => return None,
    };
    Some(kind)
}

/// Decode backslash escapes of a string literal body.
///
/// Unknown escapes are kept verbatim, backslash included.
pub fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('0') => out.push('\0'),
            Some('\\') => out.push('\\'),
            Some('\'') => out.push('\''),
            Some('"') => out.push('"'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

fn is_whitespace(ch: u8) -> bool {
    matches!(ch, b' ' | b'\t' | b'\n' | b'\r' | 0x0c)
}

fn is_ident_start(ch: u8) -> bool {
    ch.is_ascii_alphabetic() || ch == b'_'
}

fn is_ident_continue(ch: u8) -> bool {
    is_ident_start(ch) || ch.is_ascii_digit()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        lex(FileId(0), source).tokens.iter().map(|t| t.kind).collect()
    }

    #[test]
    fn lexes_function_header() {
        use TokenKind::*;
        assert_eq!(
            kinds("def add(a, b) -> int:"),
            vec![Def, Ident, LParen, Ident, Comma, Ident, RParen, Arrow, Ident, Colon, Eof]
        );
    }

    #[test]
    fn lexes_operators_and_augmented_assignment() {
        use TokenKind::*;
        assert_eq!(
            kinds("x += 2 ** 3 // 4 != 5 <= 6"),
            vec![Ident, PlusEqual, IntLiteral, StarStar, IntLiteral, SlashSlash, IntLiteral, NotEqual, IntLiteral, LessEqual, IntLiteral, Eof]
        );
    }

    #[test]
    fn whitespace_and_comments_are_insignificant() {
        let spaced = kinds("if x:\n\t  y = 1;  # note\n    end;");
        let packed = kinds("if x: y = 1; end;");
        assert_eq!(spaced, packed);
    }

    #[test]
    fn lexes_numbers() {
        let source = "0x1F 0b101 1_000 2.5 1e3 7";
        let result = lex(FileId(0), source);
        let texts: Vec<_> = result
            .tokens
            .iter()
            .filter(|t| t.kind != TokenKind::Eof)
            .map(|t| (t.kind, t.text(source)))
            .collect();
        assert_eq!(
            texts,
            vec![
                (TokenKind::IntLiteral, "0x1F"),
                (TokenKind::IntLiteral, "0b101"),
                (TokenKind::IntLiteral, "1_000"),
                (TokenKind::FloatLiteral, "2.5"),
                (TokenKind::FloatLiteral, "1e3"),
                (TokenKind::IntLiteral, "7"),
            ]
        );
    }

    #[test]
    fn strings_expose_their_contents() {
        let source = r#"print(f"Total: {t}", 'it\'s')"#;
        let result = lex(FileId(0), source);
        assert!(result.diagnostics.is_empty());
        let fstr = result.tokens[2];
        assert_eq!(fstr.kind, TokenKind::FStringLiteral);
        assert_eq!(fstr.text(source), "Total: {t}");
        let plain = result.tokens[4];
        assert_eq!(plain.kind, TokenKind::StringLiteral);
        assert_eq!(unescape(plain.text(source)), "it's");
    }

    #[test]
    fn raw_block_payload_is_one_token() {
        let source = "asm { mov rax, 60 ; { nested } }; x";
        let result = lex(FileId(0), source);
        let kinds: Vec<_> = result.tokens.iter().map(|t| t.kind).collect();
        assert_eq!(
            kinds,
            vec![
                TokenKind::Asm,
                TokenKind::RawOpen,
                TokenKind::RawText,
                TokenKind::RawClose,
                TokenKind::Semi,
                TokenKind::Ident,
                TokenKind::Eof
            ]
        );
        assert_eq!(result.tokens[2].text(source), " mov rax, 60 ; { nested } ");
    }

    #[test]
    fn unterminated_raw_block_is_a_lex_error() {
        let result = lex(FileId(0), "ailang { %x = mov.i64 1\n");
        assert_eq!(result.diagnostics.len(), 1);
        assert_eq!(result.diagnostics[0].kind, DiagnosticKind::LexError);
        assert_eq!(result.diagnostics[0].span.start, 7);
        assert_eq!(result.tokens.last().map(|t| t.kind), Some(TokenKind::Eof));
    }

    #[test]
    fn unterminated_string_reports_opening_quote() {
        let result = lex(FileId(0), "x = \"abc\ny = 1;");
        assert_eq!(result.diagnostics.len(), 1);
        assert_eq!(result.diagnostics[0].span.start, 4);
    }

    #[test]
    fn tokenize_is_lazy_and_finite() {
        let mut iter = tokenize("a b");
        assert_eq!(iter.next().and_then(Result::ok).map(|t| t.kind), Some(TokenKind::Ident));
        assert_eq!(iter.by_ref().count(), 2);
        assert!(iter.next().is_none());
    }

    #[test]
    fn reserved_and_unknown_tokens() {
        assert_eq!(kinds("class $"), vec![TokenKind::Reserved, TokenKind::Unknown, TokenKind::Eof]);
    }
}
