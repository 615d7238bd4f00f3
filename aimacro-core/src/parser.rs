//! Recursive-descent parser for AIMacro.
//!
//! Block structure comes from an explicit stack of open constructs rather
//! than from layout: `def`, `if`, `while` and `for` push an entry and
//! consume statements until the `end` keyword at their own depth.
//!
//! Error policy:
//! - a block left open at end of file yields one diagnostic naming the
//!   innermost unmatched construct, and nothing after it is reported;
//! - a `def` at the start of a line while a block is open ends every open
//!   block and reports only the innermost one;
//! - nesting deeper than [`MAX_NESTING`] yields one diagnostic and parsing
//!   stops there;
//! - an `end` with no open block yields one diagnostic;
//! - any other error is recorded and the parser skips to the next
//!   statement boundary (`;` or a statement keyword) and continues.

use crate::ast::{
    AssignTarget, BinaryOp, DefKeyword, Expr, ExprKind, FStringPart, FunctionDef, Ident, IfStmt,
    Literal, Module, Param, RawBlock, RawLang, Stmt, StmtKind, TypeExpr, TypeExprKind, UnaryOp,
};
use crate::diagnostic::{Diagnostic, DiagnosticKind, has_errors};
use crate::lexer::{Lexer, Token, TokenKind, lex, unescape};
use crate::span::{FileId, Span};

/// Combined depth of open blocks and nested expressions.
pub const MAX_NESTING: usize = 100;

#[derive(Debug)]
pub struct ParseResult {
    pub module: Module,
    pub diagnostics: Vec<Diagnostic>,
}

/// Parse a token stream produced by [`crate::lexer::lex`].
pub fn parse(tokens: Vec<Token>, source: &str) -> ParseResult {
    let mut parser = Parser::new(tokens, source);
    let items = parser.parse_module();
    ParseResult {
        module: Module {
            file: parser.file,
            items,
        },
        diagnostics: parser.diagnostics,
    }
}

/// Lex and parse in one go. Lexing errors stop before parsing.
pub fn parse_str(file: FileId, source: &str) -> ParseResult {
    let lexed = lex(file, source);
    if has_errors(&lexed.diagnostics) {
        return ParseResult {
            module: Module {
                file,
                items: Vec::new(),
            },
            diagnostics: lexed.diagnostics,
        };
    }
    let mut result = parse(lexed.tokens, source);
    let mut diagnostics = lexed.diagnostics;
    diagnostics.append(&mut result.diagnostics);
    result.diagnostics = diagnostics;
    result
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Function,
    If,
    While,
    For,
}

impl BlockKind {
    fn keyword(self) -> &'static str {
        match self {
            BlockKind::Function => "def",
            BlockKind::If => "if",
            BlockKind::While => "while",
            BlockKind::For => "for",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct OpenBlock {
    kind: BlockKind,
    span: Span,
}

struct Parser<'src> {
    tokens: Vec<Token>,
    source: &'src str,
    file: FileId,
    pos: usize,
    diagnostics: Vec<Diagnostic>,
    open_blocks: Vec<OpenBlock>,
    /// Expression nesting depth.
    depth: usize,
    /// Token index of a `def` already blamed for closing open blocks.
    unclosed_before: Option<usize>,
    /// Set once parsing cannot go on: end of file inside an open block, or
    /// nesting past [`MAX_NESTING`].
    halted: bool,
}

impl<'src> Parser<'src> {
    fn new(mut tokens: Vec<Token>, source: &'src str) -> Self {
        if tokens.last().map(|t| t.kind) != Some(TokenKind::Eof) {
            let end = source.len() as u32;
            let file = tokens.first().map(|t| t.span.file).unwrap_or_default();
            tokens.push(Token {
                kind: TokenKind::Eof,
                span: Span::new(file, end, end),
                text_start: end,
                text_end: end,
            });
        }
        let file = tokens[0].span.file;
        Parser {
            tokens,
            source,
            file,
            pos: 0,
            diagnostics: Vec::new(),
            open_blocks: Vec::new(),
            depth: 0,
            unclosed_before: None,
            halted: false,
        }
    }

    // ------------------------------------------------------------------
    // Token cursor
    // ------------------------------------------------------------------

    fn current(&self) -> Token {
        let last = self.tokens.len() - 1;
        self.tokens[self.pos.min(last)]
    }

    fn peek(&self) -> TokenKind {
        self.current().kind
    }

    fn at(&self, kind: TokenKind) -> bool {
        self.peek() == kind
    }

    fn advance(&mut self) -> Token {
        let tok = self.current();
        if tok.kind != TokenKind::Eof {
            self.pos += 1;
        }
        tok
    }

    fn previous_span(&self) -> Span {
        if self.pos == 0 {
            self.current().span
        } else {
            self.tokens[self.pos - 1].span
        }
    }

    fn eat(&mut self, kind: TokenKind) -> bool {
        if self.at(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind, context: &str) -> Option<Token> {
        if self.at(kind) {
            return Some(self.advance());
        }
        let found = self.current();
        self.error(
            found.span,
            format!(
                "expected {} {context}, found {}",
                kind.describe(),
                found.kind.describe()
            ),
        );
        None
    }

    fn text(&self, tok: &Token) -> &'src str {
        tok.text(self.source)
    }

    fn error(&mut self, span: Span, message: impl Into<String>) {
        if self.halted {
            return;
        }
        self.diagnostics
            .push(Diagnostic::error(DiagnosticKind::ParseError, message, span));
    }

    /// Skip to the next statement boundary. A `;` is consumed, statement
    /// keywords and block delimiters are left for the caller.
    fn synchronize(&mut self) {
        loop {
            match self.peek() {
                TokenKind::Semi => {
                    self.advance();
                    return;
                }
                kind if is_statement_boundary(kind) => return,
                _ => {
                    self.advance();
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Statements and blocks
    // ------------------------------------------------------------------

    fn parse_module(&mut self) -> Vec<Stmt> {
        let mut items = Vec::new();
        while !self.at(TokenKind::Eof) {
            let before = self.pos;
            match self.peek() {
                TokenKind::End => {
                    let tok = self.advance();
                    self.error(tok.span, "`end` without an open block");
                    self.eat(TokenKind::Semi);
                }
                TokenKind::Elif | TokenKind::Else => {
                    let tok = self.advance();
                    self.error(
                        tok.span,
                        format!("{} without a matching `if`", tok.kind.describe()),
                    );
                    self.synchronize();
                }
                _ => {
                    if let Some(stmt) = self.parse_statement() {
                        items.push(stmt);
                    }
                }
            }
            if self.pos == before {
                self.advance();
            }
        }
        items
    }

    /// Statements up to (not including) the `end` closing the innermost
    /// open block, or up to `elif`/`else` when `in_if` is set.
    fn parse_block(&mut self, in_if: bool) -> Vec<Stmt> {
        let mut stmts = Vec::new();
        loop {
            match self.peek() {
                TokenKind::End => break,
                TokenKind::Elif | TokenKind::Else if in_if => break,
                TokenKind::Elif | TokenKind::Else => {
                    let tok = self.advance();
                    self.error(
                        tok.span,
                        format!("{} without a matching `if`", tok.kind.describe()),
                    );
                    self.synchronize();
                }
                TokenKind::Eof => {
                    self.report_unclosed();
                    break;
                }
                TokenKind::Def | TokenKind::Func if self.at_line_start() => {
                    self.report_unclosed_before_def();
                    break;
                }
                _ => {
                    let before = self.pos;
                    if let Some(stmt) = self.parse_statement() {
                        stmts.push(stmt);
                    }
                    if self.pos == before {
                        self.advance();
                    }
                }
            }
        }
        stmts
    }

    fn report_unclosed(&mut self) {
        if self.halted {
            return;
        }
        if let Some(block) = self.open_blocks.last().copied() {
            self.error(
                block.span,
                format!(
                    "`{}` block is never closed: expected `end;` before end of file",
                    block.kind.keyword()
                ),
            );
            self.halted = true;
        }
    }

    /// An unindented `def` inside a block almost always means the block
    /// above lost its `end;`.
    fn report_unclosed_before_def(&mut self) {
        if self.unclosed_before == Some(self.pos) {
            return;
        }
        if let Some(block) = self.open_blocks.last().copied() {
            self.error(
                block.span,
                format!(
                    "`{}` block is never closed: expected `end;` before the next function definition",
                    block.kind.keyword()
                ),
            );
            self.unclosed_before = Some(self.pos);
        }
    }

    fn at_line_start(&self) -> bool {
        let start = self.current().text_start as usize;
        let before = &self.source[..start.min(self.source.len())];
        before.is_empty() || before.ends_with('\n')
    }

    /// Reports once and skips to end of file when nesting is too deep.
    fn nesting_exceeded(&mut self) -> bool {
        if self.depth + self.open_blocks.len() < MAX_NESTING {
            return false;
        }
        let tok = self.current();
        self.error(
            tok.span,
            format!("nesting too deep: more than {MAX_NESTING} levels"),
        );
        self.halted = true;
        self.pos = self.tokens.len() - 1;
        true
    }

    fn close_block(&mut self) {
        self.open_blocks.pop();
        if self.halted || !self.at(TokenKind::End) {
            return;
        }
        let end = self.advance();
        if !self.eat(TokenKind::Semi) {
            self.error(end.span, "expected `;` after `end`");
        }
    }

    fn in_loop(&self) -> bool {
        for block in self.open_blocks.iter().rev() {
            match block.kind {
                BlockKind::While | BlockKind::For => return true,
                BlockKind::Function => return false,
                BlockKind::If => {}
            }
        }
        false
    }

    fn in_function(&self) -> bool {
        self.open_blocks.iter().any(|b| b.kind == BlockKind::Function)
    }

    fn parse_statement(&mut self) -> Option<Stmt> {
        let errors_before = self.diagnostics.len();
        let tok = self.current();
        let stmt = match tok.kind {
            TokenKind::Def
            | TokenKind::Func
            | TokenKind::If
            | TokenKind::While
            | TokenKind::For
                if self.nesting_exceeded() =>
            {
                return None;
            }
            TokenKind::Def | TokenKind::Func => return self.parse_function(),
            TokenKind::If => return Some(self.parse_if()),
            TokenKind::While => return Some(self.parse_while()),
            TokenKind::For => return Some(self.parse_for()),
            TokenKind::Return => self.parse_return(),
            TokenKind::Break | TokenKind::Continue => {
                self.advance();
                if !self.in_loop() {
                    self.error(tok.span, format!("{} outside of a loop", tok.kind.describe()));
                }
                let kind = if tok.kind == TokenKind::Break {
                    StmtKind::Break
                } else {
                    StmtKind::Continue
                };
                Some(Stmt {
                    kind,
                    span: tok.span,
                })
            }
            TokenKind::Pass => {
                self.advance();
                Some(Stmt {
                    kind: StmtKind::Pass,
                    span: tok.span,
                })
            }
            TokenKind::Ailang | TokenKind::Asm => self.parse_raw().map(|raw| Stmt {
                kind: StmtKind::Raw(raw),
                span: tok.span.join(self.previous_span()),
            }),
            TokenKind::Reserved => {
                self.advance();
                let word = self.text(&tok);
                self.error(tok.span, format!("`{word}` is not supported"));
                None
            }
            TokenKind::Unknown => {
                self.advance();
                let ch = self.text(&tok);
                self.error(tok.span, format!("unexpected character `{ch}`"));
                None
            }
            _ => self.parse_simple_statement(),
        };

        if self.diagnostics.len() > errors_before {
            self.synchronize();
        } else {
            self.eat(TokenKind::Semi);
        }
        stmt
    }

    fn parse_simple_statement(&mut self) -> Option<Stmt> {
        let expr = self.parse_expr();
        let op = match self.peek() {
            TokenKind::Equal => None,
            TokenKind::PlusEqual => Some(BinaryOp::Add),
            TokenKind::MinusEqual => Some(BinaryOp::Sub),
            TokenKind::StarEqual => Some(BinaryOp::Mul),
            TokenKind::SlashEqual => Some(BinaryOp::Div),
            _ => {
                let span = expr.span;
                return Some(Stmt {
                    kind: StmtKind::Expr(expr),
                    span,
                });
            }
        };
        self.advance(); // assignment operator
        let value = self.parse_expr();
        if self.at(TokenKind::Equal) {
            let tok = self.current();
            self.error(tok.span, "chained assignment is not supported");
        }
        let span = expr.span.join(value.span);
        let target = match expr.kind {
            ExprKind::Name(name) => AssignTarget::Name(Ident {
                name,
                span: expr.span,
            }),
            ExprKind::Index { base, index } => AssignTarget::Index {
                base: *base,
                index: *index,
            },
            ExprKind::Error => return None,
            _ => {
                self.error(expr.span, "invalid assignment target");
                return None;
            }
        };
        Some(Stmt {
            kind: StmtKind::Assign { target, op, value },
            span,
        })
    }

    fn parse_return(&mut self) -> Option<Stmt> {
        let kw = self.advance();
        if !self.in_function() {
            self.error(kw.span, "`return` outside of a function");
        }
        let value = if starts_expression(self.peek()) {
            Some(self.parse_expr())
        } else {
            None
        };
        let span = kw.span.join(self.previous_span());
        Some(Stmt {
            kind: StmtKind::Return(value),
            span,
        })
    }

    fn parse_raw(&mut self) -> Option<RawBlock> {
        let kw = self.advance();
        let lang = if kw.kind == TokenKind::Ailang {
            RawLang::Ailang
        } else {
            RawLang::Asm
        };
        let context = format!("after `{}`", lang.keyword());
        self.expect(TokenKind::RawOpen, &context)?;
        let (payload, payload_span) = if self.at(TokenKind::RawText) {
            let text = self.advance();
            (self.text(&text).to_string(), text.span)
        } else {
            (String::new(), self.previous_span())
        };
        self.expect(TokenKind::RawClose, "to close the raw block")?;
        Some(RawBlock {
            lang,
            payload,
            payload_span,
        })
    }

    /// After a broken block header, skip to its `:` so the body still
    /// lines up with its `end`.
    fn recover_header(&mut self) {
        loop {
            match self.peek() {
                TokenKind::Colon => {
                    self.advance();
                    return;
                }
                TokenKind::Semi | TokenKind::Eof | TokenKind::End => return,
                kind if is_statement_boundary(kind) => return,
                _ => {
                    self.advance();
                }
            }
        }
    }

    fn expect_block_colon(&mut self, construct: &str) {
        if self.expect(TokenKind::Colon, &format!("to open the {construct} body")).is_none() {
            self.recover_header();
        }
    }

    fn parse_function(&mut self) -> Option<Stmt> {
        let kw = self.advance();
        let keyword = if kw.kind == TokenKind::Def {
            DefKeyword::Def
        } else {
            DefKeyword::Func
        };
        let nested = !self.open_blocks.is_empty();
        let errors_before = self.diagnostics.len();

        let name = match self.expect(TokenKind::Ident, "after `def`") {
            Some(tok) => Ident {
                name: self.text(&tok).to_string(),
                span: tok.span,
            },
            None => Ident {
                name: "<error>".to_string(),
                span: kw.span,
            },
        };

        let mut params = Vec::new();
        let mut ret = None;
        if self.diagnostics.len() == errors_before
            && self.expect(TokenKind::LParen, "after the function name").is_some()
        {
            if !self.at(TokenKind::RParen) {
                loop {
                    let Some(tok) = self.expect(TokenKind::Ident, "in the parameter list") else {
                        break;
                    };
                    let annotation = if self.eat(TokenKind::Colon) {
                        self.parse_type()
                    } else {
                        None
                    };
                    params.push(Param {
                        name: Ident {
                            name: self.text(&tok).to_string(),
                            span: tok.span,
                        },
                        annotation,
                    });
                    if !self.eat(TokenKind::Comma) {
                        break;
                    }
                }
            }
            if self.diagnostics.len() == errors_before {
                self.expect(TokenKind::RParen, "to close the parameter list");
            }
            if self.diagnostics.len() == errors_before && self.eat(TokenKind::Arrow) {
                ret = self.parse_type();
            }
        }
        if self.diagnostics.len() == errors_before {
            self.expect_block_colon("function");
        } else {
            self.recover_header();
        }

        self.open_blocks.push(OpenBlock {
            kind: BlockKind::Function,
            span: kw.span,
        });
        let body = self.parse_block(false);
        self.close_block();

        if nested {
            self.error(kw.span, "function definitions are only allowed at the top level");
            return None;
        }
        Some(Stmt {
            kind: StmtKind::FunctionDef(FunctionDef {
                keyword,
                name,
                params,
                ret,
                body,
            }),
            span: kw.span.join(self.previous_span()),
        })
    }

    fn parse_if(&mut self) -> Stmt {
        let kw = self.advance();
        self.open_blocks.push(OpenBlock {
            kind: BlockKind::If,
            span: kw.span,
        });

        let cond = self.parse_expr();
        self.expect_block_colon("`if`");
        let body = self.parse_block(true);
        let mut branches = vec![(cond, body)];
        let mut else_body: Option<Vec<Stmt>> = None;

        loop {
            match self.peek() {
                TokenKind::Elif => {
                    let tok = self.advance();
                    if else_body.is_some() {
                        self.error(tok.span, "`elif` after `else`");
                    }
                    let cond = self.parse_expr();
                    self.expect_block_colon("`elif`");
                    let body = self.parse_block(true);
                    if else_body.is_none() {
                        branches.push((cond, body));
                    }
                }
                TokenKind::Else => {
                    let tok = self.advance();
                    if else_body.is_some() {
                        self.error(tok.span, "`if` statement has more than one `else`");
                    }
                    self.expect_block_colon("`else`");
                    let body = self.parse_block(true);
                    if else_body.is_none() {
                        else_body = Some(body);
                    }
                }
                _ => break,
            }
        }

        self.close_block();
        Stmt {
            kind: StmtKind::If(IfStmt {
                branches,
                else_body,
            }),
            span: kw.span.join(self.previous_span()),
        }
    }

    fn parse_while(&mut self) -> Stmt {
        let kw = self.advance();
        self.open_blocks.push(OpenBlock {
            kind: BlockKind::While,
            span: kw.span,
        });
        let cond = self.parse_expr();
        self.expect_block_colon("`while`");
        let body = self.parse_block(false);
        self.close_block();
        Stmt {
            kind: StmtKind::While { cond, body },
            span: kw.span.join(self.previous_span()),
        }
    }

    fn parse_for(&mut self) -> Stmt {
        let kw = self.advance();
        self.open_blocks.push(OpenBlock {
            kind: BlockKind::For,
            span: kw.span,
        });
        let target = match self.expect(TokenKind::Ident, "after `for`") {
            Some(tok) => Ident {
                name: self.text(&tok).to_string(),
                span: tok.span,
            },
            None => Ident {
                name: "<error>".to_string(),
                span: kw.span,
            },
        };
        let iter = if self.expect(TokenKind::In, "in `for` loop").is_some() {
            self.parse_expr()
        } else {
            Expr::new(ExprKind::Error, kw.span)
        };
        self.expect_block_colon("`for`");
        let body = self.parse_block(false);
        self.close_block();
        Stmt {
            kind: StmtKind::For { target, iter, body },
            span: kw.span.join(self.previous_span()),
        }
    }

    fn parse_type(&mut self) -> Option<TypeExpr> {
        let tok = self.current();
        match tok.kind {
            TokenKind::Ident => {
                self.advance();
                let name = self.text(&tok).to_string();
                if name == "list" && self.eat(TokenKind::LBracket) {
                    let inner = self.parse_type()?;
                    self.expect(TokenKind::RBracket, "to close the list type")?;
                    return Some(TypeExpr {
                        kind: TypeExprKind::List(Box::new(inner)),
                        span: tok.span.join(self.previous_span()),
                    });
                }
                Some(TypeExpr {
                    kind: TypeExprKind::Named(name),
                    span: tok.span,
                })
            }
            TokenKind::NoneLiteral => {
                self.advance();
                Some(TypeExpr {
                    kind: TypeExprKind::Named("None".to_string()),
                    span: tok.span,
                })
            }
            other => {
                self.error(tok.span, format!("expected a type, found {}", other.describe()));
                None
            }
        }
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn parse_expr(&mut self) -> Expr {
        self.nested(Self::parse_or)
    }

    fn nested(&mut self, parse: fn(&mut Self) -> Expr) -> Expr {
        if self.nesting_exceeded() {
            return Expr::new(ExprKind::Error, self.current().span);
        }
        self.depth += 1;
        let expr = parse(self);
        self.depth -= 1;
        expr
    }

    fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
        let span = lhs.span.join(rhs.span);
        Expr::new(
            ExprKind::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            },
            span,
        )
    }

    fn parse_or(&mut self) -> Expr {
        let mut lhs = self.parse_and();
        while self.eat(TokenKind::Or) {
            let rhs = self.parse_and();
            lhs = Self::binary(BinaryOp::Or, lhs, rhs);
        }
        lhs
    }

    fn parse_and(&mut self) -> Expr {
        let mut lhs = self.parse_not();
        while self.eat(TokenKind::And) {
            let rhs = self.parse_not();
            lhs = Self::binary(BinaryOp::And, lhs, rhs);
        }
        lhs
    }

    fn parse_not(&mut self) -> Expr {
        if self.at(TokenKind::Not) {
            let tok = self.advance();
            let operand = self.nested(Self::parse_not);
            let span = tok.span.join(operand.span);
            return Expr::new(
                ExprKind::Unary {
                    op: UnaryOp::Not,
                    operand: Box::new(operand),
                },
                span,
            );
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Expr {
        let lhs = self.parse_arith();
        let Some(op) = comparison_op(self.peek()) else {
            return lhs;
        };
        self.advance();
        let rhs = self.parse_arith();
        let expr = Self::binary(op, lhs, rhs);
        if comparison_op(self.peek()).is_some() {
            let tok = self.current();
            self.error(tok.span, "chained comparisons are not supported");
        }
        expr
    }

    fn parse_arith(&mut self) -> Expr {
        let mut lhs = self.parse_term();
        loop {
            let op = match self.peek() {
                TokenKind::Plus => BinaryOp::Add,
                TokenKind::Minus => BinaryOp::Sub,
                _ => return lhs,
            };
            self.advance();
            let rhs = self.parse_term();
            lhs = Self::binary(op, lhs, rhs);
        }
    }

    fn parse_term(&mut self) -> Expr {
        let mut lhs = self.parse_unary();
        loop {
            let op = match self.peek() {
                TokenKind::Star => BinaryOp::Mul,
                TokenKind::Slash => BinaryOp::Div,
                TokenKind::SlashSlash => BinaryOp::FloorDiv,
                TokenKind::Percent => BinaryOp::Mod,
                _ => return lhs,
            };
            self.advance();
            let rhs = self.parse_unary();
            lhs = Self::binary(op, lhs, rhs);
        }
    }

    fn parse_unary(&mut self) -> Expr {
        let op = match self.peek() {
            TokenKind::Minus => UnaryOp::Neg,
            TokenKind::Plus => UnaryOp::Plus,
            _ => return self.parse_power(),
        };
        let tok = self.advance();
        let operand = self.nested(Self::parse_unary);
        let span = tok.span.join(operand.span);
        Expr::new(
            ExprKind::Unary {
                op,
                operand: Box::new(operand),
            },
            span,
        )
    }

    fn parse_power(&mut self) -> Expr {
        let base = self.parse_postfix();
        if self.eat(TokenKind::StarStar) {
            // Right associative; the exponent may carry its own sign.
            let exponent = self.nested(Self::parse_unary);
            return Self::binary(BinaryOp::Pow, base, exponent);
        }
        base
    }

    fn parse_postfix(&mut self) -> Expr {
        let mut expr = self.parse_primary();
        loop {
            match self.peek() {
                TokenKind::LParen => {
                    self.advance();
                    let args = self.parse_comma_list(TokenKind::RParen);
                    self.expect(TokenKind::RParen, "to close the argument list");
                    let span = expr.span.join(self.previous_span());
                    expr = match expr.kind {
                        ExprKind::Name(name) => Expr::new(
                            ExprKind::Call {
                                callee: Ident {
                                    name,
                                    span: expr.span,
                                },
                                args,
                            },
                            span,
                        ),
                        ExprKind::Error => Expr::new(ExprKind::Error, span),
                        _ => {
                            self.error(expr.span, "only named functions can be called");
                            Expr::new(ExprKind::Error, span)
                        }
                    };
                }
                TokenKind::LBracket => {
                    self.advance();
                    let index = self.parse_expr();
                    self.expect(TokenKind::RBracket, "to close the subscript");
                    let span = expr.span.join(self.previous_span());
                    expr = Expr::new(
                        ExprKind::Index {
                            base: Box::new(expr),
                            index: Box::new(index),
                        },
                        span,
                    );
                }
                TokenKind::Dot => {
                    let tok = self.advance();
                    self.error(tok.span, "attribute access is not supported");
                    self.eat(TokenKind::Ident);
                    expr = Expr::new(ExprKind::Error, expr.span.join(self.previous_span()));
                }
                _ => return expr,
            }
        }
    }

    fn parse_comma_list(&mut self, close: TokenKind) -> Vec<Expr> {
        let mut items = Vec::new();
        if self.at(close) {
            return items;
        }
        loop {
            items.push(self.parse_expr());
            if !self.eat(TokenKind::Comma) || self.at(close) {
                return items;
            }
        }
    }

    fn parse_primary(&mut self) -> Expr {
        let tok = self.current();
        let kind = match tok.kind {
            TokenKind::IntLiteral => {
                self.advance();
                let text = self.text(&tok);
                match parse_int_literal(text) {
                    Some(value) => ExprKind::Literal(Literal::Int(value)),
                    None => {
                        self.error(tok.span, format!("integer literal `{text}` is out of range"));
                        ExprKind::Error
                    }
                }
            }
            TokenKind::FloatLiteral => {
                self.advance();
                let text: String = self.text(&tok).chars().filter(|c| *c != '_').collect();
                match text.parse::<f64>() {
                    Ok(value) => ExprKind::Literal(Literal::Float(value)),
                    Err(_) => {
                        self.error(tok.span, format!("invalid float literal `{text}`"));
                        ExprKind::Error
                    }
                }
            }
            TokenKind::StringLiteral => {
                self.advance();
                ExprKind::Literal(Literal::Str(unescape(self.text(&tok))))
            }
            TokenKind::FStringLiteral => {
                self.advance();
                ExprKind::FString(self.parse_fstring(&tok))
            }
            TokenKind::BoolLiteral => {
                self.advance();
                ExprKind::Literal(Literal::Bool(self.text(&tok) == "True"))
            }
            TokenKind::NoneLiteral => {
                self.advance();
                ExprKind::Literal(Literal::None)
            }
            TokenKind::Ident => {
                self.advance();
                ExprKind::Name(self.text(&tok).to_string())
            }
            TokenKind::LParen => {
                self.advance();
                let inner = self.parse_expr();
                if self.at(TokenKind::Comma) {
                    let comma = self.current();
                    self.error(comma.span, "tuples are not supported");
                }
                self.expect(TokenKind::RParen, "to close the parenthesized expression");
                return Expr::new(inner.kind, tok.span.join(self.previous_span()));
            }
            TokenKind::LBracket => {
                self.advance();
                let items = self.parse_comma_list(TokenKind::RBracket);
                self.expect(TokenKind::RBracket, "to close the list");
                return Expr::new(ExprKind::List(items), tok.span.join(self.previous_span()));
            }
            TokenKind::Ailang | TokenKind::Asm => {
                return match self.parse_raw() {
                    Some(raw) => Expr::new(ExprKind::Raw(raw), tok.span.join(self.previous_span())),
                    None => Expr::new(ExprKind::Error, tok.span),
                };
            }
            other => {
                self.error(tok.span, format!("expected expression, found {}", other.describe()));
                return Expr::new(ExprKind::Error, tok.span);
            }
        };
        Expr::new(kind, tok.span)
    }

    /// Split an f-string body into literal text and `{expr}` fields.
    fn parse_fstring(&mut self, tok: &Token) -> Vec<FStringPart> {
        let content = self.text(tok);
        let base = tok.text_start as usize;
        let bytes = content.as_bytes();
        let mut parts = Vec::new();
        let mut raw = String::new();
        let mut i = 0;

        while i < bytes.len() {
            match bytes[i] {
                b'{' if bytes.get(i + 1) == Some(&b'{') => {
                    raw.push('{');
                    i += 2;
                }
                b'{' => {
                    if !raw.is_empty() {
                        parts.push(FStringPart::Text(unescape(&raw)));
                        raw.clear();
                    }
                    let Some(close) = find_field_end(bytes, i + 1) else {
                        let at = (base + i) as u32;
                        self.error(Span::new(self.file, at, at + 1), "unterminated `{` in f-string");
                        return parts;
                    };
                    if let Some(expr) = self.parse_fstring_field(base + i + 1, base + close) {
                        parts.push(FStringPart::Expr(expr));
                    }
                    i = close + 1;
                }
                b'}' if bytes.get(i + 1) == Some(&b'}') => {
                    raw.push('}');
                    i += 2;
                }
                b'}' => {
                    let at = (base + i) as u32;
                    self.error(Span::new(self.file, at, at + 1), "single `}` is not allowed in f-string");
                    i += 1;
                }
                b'\\' => {
                    raw.push('\\');
                    i += 1;
                    if let Some(c) = content[i..].chars().next() {
                        raw.push(c);
                        i += c.len_utf8();
                    }
                }
                _ => match content[i..].chars().next() {
                    Some(c) => {
                        raw.push(c);
                        i += c.len_utf8();
                    }
                    None => break,
                },
            }
        }
        if !raw.is_empty() {
            parts.push(FStringPart::Text(unescape(&raw)));
        }
        parts
    }

    fn parse_fstring_field(&mut self, start: usize, end: usize) -> Option<Expr> {
        let field_span = Span::new(self.file, start as u32, end as u32);
        let mut tokens = Vec::new();
        for item in Lexer::with_range(self.file, self.source, start, end) {
            match item {
                Ok(tok) => tokens.push(tok),
                Err(err) => {
                    self.error(err.span, err.message);
                    return None;
                }
            }
        }
        if tokens.len() <= 1 {
            self.error(field_span, "empty expression in f-string");
            return None;
        }
        let mut sub = Parser::new(tokens, self.source);
        let expr = sub.parse_expr();
        if !sub.at(TokenKind::Eof) {
            let extra = sub.current();
            sub.error(
                extra.span,
                format!("unexpected {} in f-string field", extra.kind.describe()),
            );
        }
        let had_errors = !sub.diagnostics.is_empty();
        for diag in sub.diagnostics {
            self.error(diag.span, diag.message);
        }
        if had_errors { None } else { Some(expr) }
    }
}

fn find_field_end(bytes: &[u8], from: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (offset, b) in bytes[from..].iter().enumerate() {
        match b {
            b'{' => depth += 1,
            b'}' if depth == 0 => return Some(from + offset),
            b'}' => depth -= 1,
            _ => {}
        }
    }
    None
}

fn comparison_op(kind: TokenKind) -> Option<BinaryOp> {
    let op = match kind {
        TokenKind::EqualEqual => BinaryOp::Eq,
        TokenKind::NotEqual => BinaryOp::NotEq,
        TokenKind::Less => BinaryOp::Lt,
        TokenKind::LessEqual => BinaryOp::LtEq,
        TokenKind::Greater => BinaryOp::Gt,
        TokenKind::GreaterEqual => BinaryOp::GtEq,
        _ => return None,
    };
    Some(op)
}

fn is_statement_boundary(kind: TokenKind) -> bool {
    matches!(
        kind,
        TokenKind::Eof
            | TokenKind::End
            | TokenKind::Elif
            | TokenKind::Else
            | TokenKind::Def
            | TokenKind::Func
            | TokenKind::If
            | TokenKind::While
            | TokenKind::For
            | TokenKind::Return
            | TokenKind::Break
            | TokenKind::Continue
            | TokenKind::Pass
            | TokenKind::Ailang
            | TokenKind::Asm
    )
}

fn starts_expression(kind: TokenKind) -> bool {
    matches!(
        kind,
        TokenKind::Ident
            | TokenKind::IntLiteral
            | TokenKind::FloatLiteral
            | TokenKind::StringLiteral
            | TokenKind::FStringLiteral
            | TokenKind::BoolLiteral
            | TokenKind::NoneLiteral
            | TokenKind::LParen
            | TokenKind::LBracket
            | TokenKind::Minus
            | TokenKind::Plus
            | TokenKind::Not
            | TokenKind::Ailang
            | TokenKind::Asm
    )
}

/// Decimal, `0x`, `0b` and `0o` integers with `_` separators.
pub fn parse_int_literal(text: &str) -> Option<i64> {
    let cleaned: String = text.chars().filter(|c| *c != '_').collect();
    let radix = match cleaned.get(..2) {
        Some("0x" | "0X") => 16,
        Some("0b" | "0B") => 2,
        Some("0o" | "0O") => 8,
        _ => 10,
    };
    let digits = if radix == 10 { &cleaned[..] } else { &cleaned[2..] };
    i64::from_str_radix(digits, radix).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(source: &str) -> Module {
        let result = parse_str(FileId(0), source);
        assert!(
            result.diagnostics.is_empty(),
            "unexpected diagnostics: {:?}",
            result.diagnostics
        );
        result.module
    }

    fn errors(source: &str) -> Vec<Diagnostic> {
        parse_str(FileId(0), source).diagnostics
    }

    #[test]
    fn parses_function_with_explicit_end() {
        let module = parse_ok("def add(a, b):\n    return a + b;\nend;\n");
        assert_eq!(module.items.len(), 1);
        let StmtKind::FunctionDef(def) = &module.items[0].kind else {
            panic!("expected function definition");
        };
        assert_eq!(def.name.name, "add");
        assert_eq!(def.params.len(), 2);
        assert!(matches!(def.body[0].kind, StmtKind::Return(Some(_))));
    }

    #[test]
    fn func_keyword_and_annotations() {
        let module = parse_ok("func scale(xs: list[int], k: int) -> list[int]: return xs; end;");
        let StmtKind::FunctionDef(def) = &module.items[0].kind else {
            panic!("expected function definition");
        };
        assert_eq!(def.keyword, DefKeyword::Func);
        let annotation = def.params[0].annotation.as_ref().expect("annotation");
        assert!(matches!(annotation.kind, TypeExprKind::List(_)));
        assert!(def.ret.is_some());
    }

    #[test]
    fn if_elif_else_share_one_end() {
        let module = parse_ok(
            "if x < 0:\n  y = 1;\nelif x == 0:\n  y = 2;\nelse:\n  y = 3;\nend;\nz = y;",
        );
        assert_eq!(module.items.len(), 2);
        let StmtKind::If(stmt) = &module.items[0].kind else {
            panic!("expected if");
        };
        assert_eq!(stmt.branches.len(), 2);
        assert!(stmt.else_body.is_some());
    }

    #[test]
    fn semicolons_after_simple_statements_are_optional() {
        let module = parse_ok("x = 1\ny = 2\nwhile x < y:\n  x += 1\nend;");
        assert_eq!(module.items.len(), 3);
    }

    #[test]
    fn missing_end_reports_innermost_block_once() {
        let source = "def f(x):\n    if x:\n        y = 1;\n    while y:\n        y = 0;\n";
        let diags = errors(source);
        assert_eq!(diags.len(), 1, "{diags:?}");
        assert_eq!(diags[0].kind, DiagnosticKind::ParseError);
        let while_pos = source.find("while").expect("while") as u32;
        assert_eq!(diags[0].span.start, while_pos);
    }

    #[test]
    fn unindented_def_closes_a_block_missing_its_end() {
        let source = "def f(x):\n  if x < 2:\n    return 1;\n  return 2;\nend;\ndef main(): return f(1); end;";
        let result = parse_str(FileId(0), source);
        assert_eq!(result.diagnostics.len(), 1, "{:?}", result.diagnostics);
        let diag = &result.diagnostics[0];
        assert_eq!(diag.kind, DiagnosticKind::ParseError);
        assert_eq!(diag.span.start, 0);
        assert!(diag.message.contains("`def` block is never closed"));
        // `main` still parses as its own top-level function.
        assert_eq!(result.module.items.len(), 2);
        assert!(matches!(
            &result.module.items[1].kind,
            StmtKind::FunctionDef(def) if def.name.name == "main"
        ));
    }

    #[test]
    fn deep_parentheses_are_rejected_without_overflow() {
        let source = format!(
            "def main():\n  return {}1{};\nend;\n",
            "(".repeat(500),
            ")".repeat(500)
        );
        let diags = errors(&source);
        assert_eq!(diags.len(), 1, "{diags:?}");
        assert!(diags[0].message.contains("nesting too deep"));
    }

    #[test]
    fn deep_blocks_are_rejected_without_overflow() {
        let source = format!("{}y = 1;\n{}", "if x:\n".repeat(500), "end;\n".repeat(500));
        let diags = errors(&source);
        assert_eq!(diags.len(), 1, "{diags:?}");
        assert!(diags[0].message.contains("nesting too deep"));

        let chain = format!("x = {}1;", "-".repeat(500));
        let diags = errors(&chain);
        assert_eq!(diags.len(), 1, "{diags:?}");
    }

    #[test]
    fn moderate_nesting_is_accepted() {
        parse_ok(&format!("x = {}1{};", "(".repeat(40), ")".repeat(40)));
        parse_ok(&format!("{}y = 1;\n{}", "while x:\n".repeat(40), "end;\n".repeat(40)));
    }

    #[test]
    fn stray_end_is_one_error() {
        let diags = errors("x = 1;\nend;\ny = 2;");
        assert_eq!(diags.len(), 1);
        assert!(diags[0].message.contains("without an open block"));
    }

    #[test]
    fn end_requires_semicolon() {
        let diags = errors("while x: x = 0; end");
        assert_eq!(diags.len(), 1);
        assert!(diags[0].message.contains("`;` after `end`"));
    }

    #[test]
    fn recovers_at_statement_boundaries() {
        let result = parse_str(FileId(0), "x = ;\ny = );\nz = 1;");
        assert_eq!(result.diagnostics.len(), 2);
        let last = result.module.items.last().expect("statement");
        assert!(matches!(
            &last.kind,
            StmtKind::Assign { target: AssignTarget::Name(id), .. } if id.name == "z"
        ));
    }

    #[test]
    fn power_binds_tighter_than_unary_minus() {
        let module = parse_ok("x = -2 ** 2;");
        let StmtKind::Assign { value, .. } = &module.items[0].kind else {
            panic!("expected assignment");
        };
        let ExprKind::Unary { op, operand } = &value.kind else {
            panic!("expected unary");
        };
        assert_eq!(*op, UnaryOp::Neg);
        assert!(matches!(operand.kind, ExprKind::Binary { op: BinaryOp::Pow, .. }));
    }

    #[test]
    fn precedence_of_boolean_operators() {
        let module = parse_ok("r = a or b and not c;");
        let StmtKind::Assign { value, .. } = &module.items[0].kind else {
            panic!("expected assignment");
        };
        let ExprKind::Binary { op: BinaryOp::Or, rhs, .. } = &value.kind else {
            panic!("expected or at the root");
        };
        assert!(matches!(rhs.kind, ExprKind::Binary { op: BinaryOp::And, .. }));
    }

    #[test]
    fn raw_blocks_in_statement_and_expression_position() {
        let module = parse_ok(
            "def f():\n  asm {\n    mov rax, 60\n  };\n  v = ailang { %r = mov.i64 7 };\n  return v;\nend;",
        );
        let StmtKind::FunctionDef(def) = &module.items[0].kind else {
            panic!("expected function definition");
        };
        let StmtKind::Raw(raw) = &def.body[0].kind else {
            panic!("expected raw statement");
        };
        assert_eq!(raw.lang, RawLang::Asm);
        assert_eq!(raw.payload.trim(), "mov rax, 60");
        let StmtKind::Assign { value, .. } = &def.body[1].kind else {
            panic!("expected assignment");
        };
        assert!(matches!(&value.kind, ExprKind::Raw(r) if r.lang == RawLang::Ailang));
    }

    #[test]
    fn fstring_fields_are_parsed_as_expressions() {
        let module = parse_ok(r#"print(f"Total: {a + 1} {{ok}}");"#);
        let StmtKind::Expr(call) = &module.items[0].kind else {
            panic!("expected expression statement");
        };
        let ExprKind::Call { args, .. } = &call.kind else {
            panic!("expected call");
        };
        let ExprKind::FString(parts) = &args[0].kind else {
            panic!("expected f-string");
        };
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], FStringPart::Text("Total: ".to_string()));
        assert!(matches!(&parts[1], FStringPart::Expr(e) if matches!(e.kind, ExprKind::Binary { .. })));
        assert_eq!(parts[2], FStringPart::Text(" {ok}".to_string()));
    }

    #[test]
    fn break_outside_loop_is_rejected() {
        let diags = errors("def f(): break; end;");
        assert_eq!(diags.len(), 1);
        assert!(diags[0].message.contains("outside of a loop"));
        assert!(errors("def f(): while True: if x: break; end; end; end;").is_empty());
    }

    #[test]
    fn nested_function_is_rejected() {
        let diags = errors("def f():\n  def g(): return 1; end;\n  return 2;\nend;");
        assert_eq!(diags.len(), 1);
        assert!(diags[0].message.contains("top level"));
    }

    #[test]
    fn reserved_keywords_are_reported() {
        let diags = errors("import os;\nx = 1;");
        assert_eq!(diags.len(), 1);
        assert!(diags[0].message.contains("`import` is not supported"));
    }

    #[test]
    fn integer_literal_forms() {
        assert_eq!(parse_int_literal("0x1F"), Some(31));
        assert_eq!(parse_int_literal("0b101"), Some(5));
        assert_eq!(parse_int_literal("1_000"), Some(1000));
        assert_eq!(parse_int_literal("99999999999999999999"), None);
    }
}
