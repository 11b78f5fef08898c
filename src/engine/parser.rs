//! Recursive descent parser.
//!
//! Builds the syntax tree from the token stream. Operator precedence is
//! encoded in the call chain, one level per function. Semicolons are
//! mandatory terminators; there is no automatic insertion.

use std::rc::Rc;

use crate::engine::ast::*;
use crate::engine::lexer::tokenize;
use crate::engine::span::Span;
use crate::engine::token::{Token, TokenKind};
use crate::error::ParseError;

/// Parse a script compilation unit. Import and export declarations are
/// rejected.
pub fn parse_script(source: &str) -> Result<Program, ParseError> {
    Parser::new(tokenize(source)?, false).parse()
}

/// Parse a module compilation unit.
pub fn parse_module(source: &str) -> Result<Program, ParseError> {
    Parser::new(tokenize(source)?, true).parse()
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    module: bool,
}

impl Parser {
    fn new(tokens: Vec<Token>, module: bool) -> Self {
        Self {
            tokens,
            pos: 0,
            module,
        }
    }

    // ========================================================================
    // Token stream helpers
    // ========================================================================

    fn current(&self) -> &Token {
        // The stream always ends with Eof, and pos never moves past it.
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn kind(&self) -> &TokenKind {
        &self.current().kind
    }

    fn span(&self) -> Span {
        self.current().span
    }

    fn nth_kind(&self, n: usize) -> &TokenKind {
        let idx = (self.pos + n).min(self.tokens.len() - 1);
        &self.tokens[idx].kind
    }

    fn advance(&mut self) -> Token {
        let token = self.current().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.kind() == kind {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: &TokenKind, expected: &str) -> Result<Token, ParseError> {
        if self.kind() == kind {
            Ok(self.advance())
        } else {
            Err(self.unexpected(expected))
        }
    }

    fn expect_ident(&mut self, expected: &str) -> Result<String, ParseError> {
        match self.kind() {
            TokenKind::Ident(_) => {
                let token = self.advance();
                match token.kind {
                    TokenKind::Ident(name) => Ok(name),
                    _ => Err(self.unexpected(expected)),
                }
            }
            _ => Err(self.unexpected(expected)),
        }
    }

    fn unexpected(&self, expected: &str) -> ParseError {
        ParseError::UnexpectedToken {
            found: self.kind().to_string(),
            expected: expected.to_string(),
            span: self.span(),
        }
    }

    // ========================================================================
    // Top level
    // ========================================================================

    fn parse(mut self) -> Result<Program, ParseError> {
        let mut items = Vec::new();
        while !matches!(self.kind(), TokenKind::Eof) {
            items.push(self.parse_item()?);
        }
        Ok(Program { items })
    }

    fn parse_item(&mut self) -> Result<Item, ParseError> {
        match self.kind() {
            TokenKind::Import if !matches!(self.nth_kind(1), TokenKind::Dot) => {
                if !self.module {
                    return Err(ParseError::ModuleOnly {
                        construct: "import declaration",
                        span: self.span(),
                    });
                }
                Ok(Item::Import(self.parse_import()?))
            }
            TokenKind::Export => {
                if !self.module {
                    return Err(ParseError::ModuleOnly {
                        construct: "export declaration",
                        span: self.span(),
                    });
                }
                Ok(Item::Export(self.parse_export()?))
            }
            _ => Ok(Item::Stmt(self.parse_stmt()?)),
        }
    }

    fn parse_import(&mut self) -> Result<ImportDecl, ParseError> {
        let span = self.span();
        self.expect(&TokenKind::Import, "import")?;

        // Side-effect import: `import "specifier";`
        if let TokenKind::Str(_) = self.kind() {
            let specifier = self.parse_string_literal()?;
            self.expect(&TokenKind::Semicolon, ";")?;
            return Ok(ImportDecl {
                bindings: Vec::new(),
                specifier,
                span,
            });
        }

        self.expect(&TokenKind::LBrace, "{")?;
        let mut bindings = Vec::new();
        while !matches!(self.kind(), TokenKind::RBrace) {
            let imported = self.expect_ident("import name")?;
            let local = if self.eat(&TokenKind::As) {
                self.expect_ident("local name")?
            } else {
                imported.clone()
            };
            bindings.push((imported, local));
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(&TokenKind::RBrace, "}")?;
        self.expect(&TokenKind::From, "from")?;
        let specifier = self.parse_string_literal()?;
        self.expect(&TokenKind::Semicolon, ";")?;
        Ok(ImportDecl {
            bindings,
            specifier,
            span,
        })
    }

    fn parse_export(&mut self) -> Result<ExportDecl, ParseError> {
        let span = self.span();
        self.expect(&TokenKind::Export, "export")?;
        match self.kind() {
            TokenKind::LBrace => {
                self.advance();
                let mut names = Vec::new();
                while !matches!(self.kind(), TokenKind::RBrace) {
                    names.push(self.expect_ident("export name")?);
                    if !self.eat(&TokenKind::Comma) {
                        break;
                    }
                }
                self.expect(&TokenKind::RBrace, "}")?;
                self.expect(&TokenKind::Semicolon, ";")?;
                Ok(ExportDecl {
                    stmt: None,
                    names,
                    span,
                })
            }
            TokenKind::Function => {
                let def = self.parse_function_def()?;
                let names = match &def.name {
                    Some(name) => vec![name.clone()],
                    None => return Err(self.unexpected("function name")),
                };
                Ok(ExportDecl {
                    stmt: Some(Stmt::Function(def)),
                    names,
                    span,
                })
            }
            TokenKind::Let | TokenKind::Const => {
                let stmt = self.parse_let()?;
                let names = match &stmt {
                    Stmt::Let { name, .. } => vec![name.clone()],
                    _ => Vec::new(),
                };
                Ok(ExportDecl {
                    stmt: Some(stmt),
                    names,
                    span,
                })
            }
            _ => Err(self.unexpected("declaration or { after export")),
        }
    }

    fn parse_string_literal(&mut self) -> Result<String, ParseError> {
        match self.kind() {
            TokenKind::Str(_) => {
                let token = self.advance();
                match token.kind {
                    TokenKind::Str(s) => Ok(s),
                    _ => Err(self.unexpected("string literal")),
                }
            }
            _ => Err(self.unexpected("string literal")),
        }
    }

    // ========================================================================
    // Statements
    // ========================================================================

    fn parse_stmt(&mut self) -> Result<Stmt, ParseError> {
        match self.kind() {
            TokenKind::Semicolon => {
                self.advance();
                Ok(Stmt::Empty)
            }
            TokenKind::LBrace => {
                self.advance();
                let stmts = self.parse_block_body()?;
                Ok(Stmt::Block(stmts))
            }
            TokenKind::Let | TokenKind::Const => self.parse_let(),
            TokenKind::Function => {
                let def = self.parse_function_def()?;
                if def.name.is_none() {
                    return Err(self.unexpected("function name"));
                }
                Ok(Stmt::Function(def))
            }
            TokenKind::If => self.parse_if(),
            TokenKind::While => self.parse_while(),
            TokenKind::For => self.parse_for(),
            TokenKind::Return => {
                let span = self.span();
                self.advance();
                let value = if matches!(self.kind(), TokenKind::Semicolon) {
                    None
                } else {
                    Some(self.parse_expr()?)
                };
                self.expect(&TokenKind::Semicolon, ";")?;
                Ok(Stmt::Return { value, span })
            }
            TokenKind::Break => {
                let span = self.span();
                self.advance();
                self.expect(&TokenKind::Semicolon, ";")?;
                Ok(Stmt::Break(span))
            }
            TokenKind::Continue => {
                let span = self.span();
                self.advance();
                self.expect(&TokenKind::Semicolon, ";")?;
                Ok(Stmt::Continue(span))
            }
            TokenKind::Throw => {
                self.advance();
                let value = self.parse_expr()?;
                self.expect(&TokenKind::Semicolon, ";")?;
                Ok(Stmt::Throw(value))
            }
            TokenKind::Try => self.parse_try(),
            _ => {
                let expr = self.parse_expr()?;
                self.expect(&TokenKind::Semicolon, ";")?;
                Ok(Stmt::Expr(expr))
            }
        }
    }

    /// Parse statements up to and including the closing brace.
    fn parse_block_body(&mut self) -> Result<Vec<Stmt>, ParseError> {
        let mut stmts = Vec::new();
        while !matches!(self.kind(), TokenKind::RBrace | TokenKind::Eof) {
            stmts.push(self.parse_stmt()?);
        }
        self.expect(&TokenKind::RBrace, "}")?;
        Ok(stmts)
    }

    fn parse_let(&mut self) -> Result<Stmt, ParseError> {
        let stmt = self.parse_let_no_semi()?;
        self.expect(&TokenKind::Semicolon, ";")?;
        Ok(stmt)
    }

    fn parse_let_no_semi(&mut self) -> Result<Stmt, ParseError> {
        let span = self.span();
        let mutable = match self.advance().kind {
            TokenKind::Let => true,
            TokenKind::Const => false,
            _ => return Err(self.unexpected("let or const")),
        };
        let name = self.expect_ident("binding name")?;
        let init = if self.eat(&TokenKind::Assign) {
            Some(self.parse_expr()?)
        } else {
            None
        };
        if !mutable && init.is_none() {
            return Err(ParseError::ConstWithoutInit { span });
        }
        Ok(Stmt::Let {
            name,
            init,
            mutable,
            span,
        })
    }

    fn parse_if(&mut self) -> Result<Stmt, ParseError> {
        self.expect(&TokenKind::If, "if")?;
        self.expect(&TokenKind::LParen, "(")?;
        let cond = self.parse_expr()?;
        self.expect(&TokenKind::RParen, ")")?;
        let then_branch = Box::new(self.parse_stmt()?);
        let else_branch = if self.eat(&TokenKind::Else) {
            Some(Box::new(self.parse_stmt()?))
        } else {
            None
        };
        Ok(Stmt::If {
            cond,
            then_branch,
            else_branch,
        })
    }

    fn parse_while(&mut self) -> Result<Stmt, ParseError> {
        self.expect(&TokenKind::While, "while")?;
        self.expect(&TokenKind::LParen, "(")?;
        let cond = self.parse_expr()?;
        self.expect(&TokenKind::RParen, ")")?;
        let body = Box::new(self.parse_stmt()?);
        Ok(Stmt::While { cond, body })
    }

    fn parse_for(&mut self) -> Result<Stmt, ParseError> {
        self.expect(&TokenKind::For, "for")?;
        self.expect(&TokenKind::LParen, "(")?;

        let init = if matches!(self.kind(), TokenKind::Semicolon) {
            self.advance();
            None
        } else if matches!(self.kind(), TokenKind::Let | TokenKind::Const) {
            let stmt = self.parse_let_no_semi()?;
            self.expect(&TokenKind::Semicolon, ";")?;
            Some(Box::new(stmt))
        } else {
            let expr = self.parse_expr()?;
            self.expect(&TokenKind::Semicolon, ";")?;
            Some(Box::new(Stmt::Expr(expr)))
        };

        let cond = if matches!(self.kind(), TokenKind::Semicolon) {
            None
        } else {
            Some(self.parse_expr()?)
        };
        self.expect(&TokenKind::Semicolon, ";")?;

        let update = if matches!(self.kind(), TokenKind::RParen) {
            None
        } else {
            Some(self.parse_expr()?)
        };
        self.expect(&TokenKind::RParen, ")")?;

        let body = Box::new(self.parse_stmt()?);
        Ok(Stmt::For {
            init,
            cond,
            update,
            body,
        })
    }

    fn parse_try(&mut self) -> Result<Stmt, ParseError> {
        self.expect(&TokenKind::Try, "try")?;
        self.expect(&TokenKind::LBrace, "{")?;
        let block = self.parse_block_body()?;
        self.expect(&TokenKind::Catch, "catch")?;
        let param = if self.eat(&TokenKind::LParen) {
            let name = self.expect_ident("catch binding")?;
            self.expect(&TokenKind::RParen, ")")?;
            Some(name)
        } else {
            None
        };
        self.expect(&TokenKind::LBrace, "{")?;
        let handler = self.parse_block_body()?;
        Ok(Stmt::Try {
            block,
            param,
            handler,
        })
    }

    // ========================================================================
    // Functions
    // ========================================================================

    fn parse_function_def(&mut self) -> Result<Rc<FuncDef>, ParseError> {
        let span = self.span();
        self.expect(&TokenKind::Function, "function")?;
        let name = match self.kind() {
            TokenKind::Ident(_) => Some(self.expect_ident("function name")?),
            _ => None,
        };
        let params = self.parse_params()?;
        self.expect(&TokenKind::LBrace, "{")?;
        let body = self.parse_block_body()?;
        Ok(Rc::new(FuncDef {
            name,
            params,
            body: FuncBody::Block(body),
            is_arrow: false,
            span,
        }))
    }

    fn parse_params(&mut self) -> Result<Vec<String>, ParseError> {
        self.expect(&TokenKind::LParen, "(")?;
        let mut params = Vec::new();
        while !matches!(self.kind(), TokenKind::RParen) {
            params.push(self.expect_ident("parameter name")?);
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(&TokenKind::RParen, ")")?;
        Ok(params)
    }

    /// Whether the parenthesized group starting at the current token is an
    /// arrow function parameter list.
    fn lparen_starts_arrow(&self) -> bool {
        debug_assert!(matches!(self.kind(), TokenKind::LParen));
        let mut depth = 0usize;
        let mut n = 0usize;
        loop {
            match self.nth_kind(n) {
                TokenKind::LParen => depth += 1,
                TokenKind::RParen => {
                    depth -= 1;
                    if depth == 0 {
                        return matches!(self.nth_kind(n + 1), TokenKind::Arrow);
                    }
                }
                TokenKind::Eof => return false,
                _ => {}
            }
            n += 1;
        }
    }

    fn parse_arrow(&mut self) -> Result<Expr, ParseError> {
        let span = self.span();
        let params = match self.kind() {
            TokenKind::Ident(_) => vec![self.expect_ident("parameter name")?],
            TokenKind::LParen => self.parse_params()?,
            _ => return Err(self.unexpected("arrow parameters")),
        };
        self.expect(&TokenKind::Arrow, "=>")?;
        let body = if matches!(self.kind(), TokenKind::LBrace) {
            self.advance();
            FuncBody::Block(self.parse_block_body()?)
        } else {
            FuncBody::Expr(Box::new(self.parse_assignment()?))
        };
        Ok(Expr::Function(Rc::new(FuncDef {
            name: None,
            params,
            body,
            is_arrow: true,
            span,
        })))
    }

    // ========================================================================
    // Expressions, lowest to highest precedence
    // ========================================================================

    fn parse_expr(&mut self) -> Result<Expr, ParseError> {
        self.parse_assignment()
    }

    fn parse_assignment(&mut self) -> Result<Expr, ParseError> {
        // Arrow functions are detected before the grammar commits to a
        // grouping or identifier expression.
        match self.kind() {
            TokenKind::Ident(_) if matches!(self.nth_kind(1), TokenKind::Arrow) => {
                return self.parse_arrow();
            }
            TokenKind::LParen if self.lparen_starts_arrow() => {
                return self.parse_arrow();
            }
            _ => {}
        }

        let expr = self.parse_conditional()?;
        let op = match self.kind() {
            TokenKind::Assign => AssignOp::Assign,
            TokenKind::PlusAssign => AssignOp::Add,
            TokenKind::MinusAssign => AssignOp::Sub,
            TokenKind::StarAssign => AssignOp::Mul,
            TokenKind::SlashAssign => AssignOp::Div,
            _ => return Ok(expr),
        };
        let span = self.span();
        self.advance();
        if !matches!(expr, Expr::Ident(..) | Expr::Member { .. } | Expr::Index { .. }) {
            return Err(ParseError::InvalidAssignmentTarget { span });
        }
        let value = self.parse_assignment()?;
        Ok(Expr::Assign {
            target: Box::new(expr),
            op,
            value: Box::new(value),
            span,
        })
    }

    fn parse_conditional(&mut self) -> Result<Expr, ParseError> {
        let cond = self.parse_or()?;
        if !self.eat(&TokenKind::Question) {
            return Ok(cond);
        }
        let then_branch = self.parse_assignment()?;
        self.expect(&TokenKind::Colon, ":")?;
        let else_branch = self.parse_assignment()?;
        Ok(Expr::Conditional {
            cond: Box::new(cond),
            then_branch: Box::new(then_branch),
            else_branch: Box::new(else_branch),
        })
    }

    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_and()?;
        while self.eat(&TokenKind::OrOr) {
            let rhs = self.parse_and()?;
            lhs = Expr::Logical {
                op: LogicalOp::Or,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_equality()?;
        while self.eat(&TokenKind::AndAnd) {
            let rhs = self.parse_equality()?;
            lhs = Expr::Logical {
                op: LogicalOp::And,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_equality(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_relational()?;
        loop {
            let op = match self.kind() {
                TokenKind::EqEq => BinaryOp::EqEq,
                TokenKind::EqEqEq => BinaryOp::StrictEq,
                TokenKind::NotEq => BinaryOp::NotEq,
                TokenKind::NotEqEq => BinaryOp::StrictNotEq,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.parse_relational()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    fn parse_relational(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_additive()?;
        loop {
            let op = match self.kind() {
                TokenKind::Lt => BinaryOp::Lt,
                TokenKind::Gt => BinaryOp::Gt,
                TokenKind::Le => BinaryOp::Le,
                TokenKind::Ge => BinaryOp::Ge,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.parse_additive()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    fn parse_additive(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let op = match self.kind() {
                TokenKind::Plus => BinaryOp::Add,
                TokenKind::Minus => BinaryOp::Sub,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.parse_multiplicative()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.kind() {
                TokenKind::Star => BinaryOp::Mul,
                TokenKind::Slash => BinaryOp::Div,
                TokenKind::Percent => BinaryOp::Rem,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.parse_unary()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        let op = match self.kind() {
            TokenKind::Minus => UnaryOp::Neg,
            TokenKind::Not => UnaryOp::Not,
            TokenKind::Typeof => UnaryOp::Typeof,
            TokenKind::New => return self.parse_new(),
            _ => return self.parse_postfix(),
        };
        self.advance();
        let operand = self.parse_unary()?;
        Ok(Expr::Unary {
            op,
            operand: Box::new(operand),
        })
    }

    fn parse_new(&mut self) -> Result<Expr, ParseError> {
        let span = self.span();
        self.expect(&TokenKind::New, "new")?;
        // The callee is a member chain; calls bind to the `new` itself.
        let mut callee = self.parse_primary()?;
        loop {
            match self.kind() {
                TokenKind::Dot => {
                    let span = self.span();
                    self.advance();
                    let property = self.expect_ident("property name")?;
                    callee = Expr::Member {
                        object: Box::new(callee),
                        property,
                        span,
                    };
                }
                TokenKind::LBracket => {
                    let span = self.span();
                    self.advance();
                    let index = self.parse_expr()?;
                    self.expect(&TokenKind::RBracket, "]")?;
                    callee = Expr::Index {
                        object: Box::new(callee),
                        index: Box::new(index),
                        span,
                    };
                }
                _ => break,
            }
        }
        let args = if matches!(self.kind(), TokenKind::LParen) {
            self.parse_args()?
        } else {
            Vec::new()
        };
        let new_expr = Expr::New {
            callee: Box::new(callee),
            args,
            span,
        };
        self.parse_postfix_on(new_expr)
    }

    fn parse_postfix(&mut self) -> Result<Expr, ParseError> {
        let expr = self.parse_primary()?;
        self.parse_postfix_on(expr)
    }

    fn parse_postfix_on(&mut self, mut expr: Expr) -> Result<Expr, ParseError> {
        loop {
            match self.kind() {
                TokenKind::Dot => {
                    let span = self.span();
                    self.advance();
                    let property = self.expect_ident("property name")?;
                    expr = Expr::Member {
                        object: Box::new(expr),
                        property,
                        span,
                    };
                }
                TokenKind::LBracket => {
                    let span = self.span();
                    self.advance();
                    let index = self.parse_expr()?;
                    self.expect(&TokenKind::RBracket, "]")?;
                    expr = Expr::Index {
                        object: Box::new(expr),
                        index: Box::new(index),
                        span,
                    };
                }
                TokenKind::LParen => {
                    let span = self.span();
                    let args = self.parse_args()?;
                    expr = Expr::Call {
                        callee: Box::new(expr),
                        args,
                        span,
                    };
                }
                _ => return Ok(expr),
            }
        }
    }

    fn parse_args(&mut self) -> Result<Vec<Expr>, ParseError> {
        self.expect(&TokenKind::LParen, "(")?;
        let mut args = Vec::new();
        while !matches!(self.kind(), TokenKind::RParen) {
            args.push(self.parse_assignment()?);
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(&TokenKind::RParen, ")")?;
        Ok(args)
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        match self.kind().clone() {
            TokenKind::Int(v) => {
                self.advance();
                Ok(Expr::Int(v))
            }
            TokenKind::Float(v) => {
                self.advance();
                Ok(Expr::Float(v))
            }
            TokenKind::Str(_) => {
                let s = self.parse_string_literal()?;
                Ok(Expr::Str(s))
            }
            TokenKind::True => {
                self.advance();
                Ok(Expr::Bool(true))
            }
            TokenKind::False => {
                self.advance();
                Ok(Expr::Bool(false))
            }
            TokenKind::Null => {
                self.advance();
                Ok(Expr::Null)
            }
            TokenKind::Ident(_) => {
                let span = self.span();
                let name = self.expect_ident("identifier")?;
                Ok(Expr::Ident(name, span))
            }
            TokenKind::Import => {
                let span = self.span();
                self.advance();
                self.expect(&TokenKind::Dot, ".")?;
                let prop = self.expect_ident("meta")?;
                if prop != "meta" {
                    return Err(ParseError::UnexpectedToken {
                        found: prop,
                        expected: "meta".to_string(),
                        span,
                    });
                }
                if !self.module {
                    return Err(ParseError::ModuleOnly {
                        construct: "import.meta",
                        span,
                    });
                }
                Ok(Expr::ImportMeta(span))
            }
            TokenKind::Function => {
                let def = self.parse_function_def()?;
                Ok(Expr::Function(def))
            }
            TokenKind::LParen => {
                self.advance();
                let expr = self.parse_expr()?;
                self.expect(&TokenKind::RParen, ")")?;
                Ok(expr)
            }
            TokenKind::LBracket => {
                self.advance();
                let mut elements = Vec::new();
                while !matches!(self.kind(), TokenKind::RBracket) {
                    elements.push(self.parse_assignment()?);
                    if !self.eat(&TokenKind::Comma) {
                        break;
                    }
                }
                self.expect(&TokenKind::RBracket, "]")?;
                Ok(Expr::Array(elements))
            }
            TokenKind::LBrace => {
                self.advance();
                let mut props = Vec::new();
                while !matches!(self.kind(), TokenKind::RBrace) {
                    let key = match self.kind() {
                        TokenKind::Str(_) => self.parse_string_literal()?,
                        _ => self.expect_ident("property name")?,
                    };
                    self.expect(&TokenKind::Colon, ":")?;
                    let value = self.parse_assignment()?;
                    props.push((key, value));
                    if !self.eat(&TokenKind::Comma) {
                        break;
                    }
                }
                self.expect(&TokenKind::RBrace, "}")?;
                Ok(Expr::Object(props))
            }
            _ => Err(self.unexpected("expression")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn first_stmt(source: &str) -> Stmt {
        let mut program = parse_script(source).expect("parse failed");
        match program.items.remove(0) {
            Item::Stmt(stmt) => stmt,
            other => panic!("expected statement, got {other:?}"),
        }
    }

    fn first_expr(source: &str) -> Expr {
        match first_stmt(source) {
            Stmt::Expr(expr) => expr,
            other => panic!("expected expression statement, got {other:?}"),
        }
    }

    #[test]
    fn parse_precedence() {
        // 1 + 2 * 3 groups the multiplication first.
        let expr = first_expr("1 + 2 * 3;");
        match expr {
            Expr::Binary {
                op: BinaryOp::Add,
                rhs,
                ..
            } => {
                assert!(matches!(
                    *rhs,
                    Expr::Binary {
                        op: BinaryOp::Mul,
                        ..
                    }
                ));
            }
            other => panic!("unexpected shape: {other:?}"),
        }
    }

    #[test]
    fn parse_let_and_const() {
        assert!(matches!(
            first_stmt("let x = 1;"),
            Stmt::Let { mutable: true, .. }
        ));
        assert!(matches!(
            first_stmt("const y = 2;"),
            Stmt::Let { mutable: false, .. }
        ));
    }

    #[test]
    fn const_requires_initializer() {
        let err = parse_script("const x;").unwrap_err();
        assert!(matches!(err, ParseError::ConstWithoutInit { .. }));
    }

    #[test]
    fn parse_member_call_chain() {
        let expr = first_expr("a.b(1)[2];");
        assert!(matches!(expr, Expr::Index { .. }));
    }

    #[test]
    fn parse_new_with_member_callee() {
        let expr = first_expr("new ns.Point(1, 2);");
        match expr {
            Expr::New { callee, args, .. } => {
                assert!(matches!(*callee, Expr::Member { .. }));
                assert_eq!(args.len(), 2);
            }
            other => panic!("unexpected shape: {other:?}"),
        }
    }

    #[test]
    fn parse_arrow_functions() {
        let expr = first_expr("x => x + 1;");
        match expr {
            Expr::Function(def) => {
                assert!(def.is_arrow);
                assert_eq!(def.params, vec!["x".to_string()]);
                assert!(matches!(def.body, FuncBody::Expr(_)));
            }
            other => panic!("unexpected shape: {other:?}"),
        }

        let expr = first_expr("(a, b) => { return a + b; };");
        match expr {
            Expr::Function(def) => {
                assert!(def.is_arrow);
                assert_eq!(def.params.len(), 2);
                assert!(matches!(def.body, FuncBody::Block(_)));
            }
            other => panic!("unexpected shape: {other:?}"),
        }
    }

    #[test]
    fn parenthesized_expression_is_not_an_arrow() {
        let expr = first_expr("(a);");
        assert!(matches!(expr, Expr::Ident(..)));
    }

    #[test]
    fn parse_ternary_and_logical() {
        let expr = first_expr("a && b ? 1 : 2;");
        assert!(matches!(expr, Expr::Conditional { .. }));
    }

    #[test]
    fn parse_object_and_array_literals() {
        // A brace at statement position opens a block, so the literal sits
        // in an initializer.
        match first_stmt("let o = { a: 1, \"b\": [2, 3] };") {
            Stmt::Let { init: Some(expr), .. } => match expr {
                Expr::Object(props) => {
                    assert_eq!(props.len(), 2);
                    assert!(matches!(props[1].1, Expr::Array(_)));
                }
                other => panic!("unexpected shape: {other:?}"),
            },
            other => panic!("unexpected shape: {other:?}"),
        }
    }

    #[test]
    fn missing_semicolon_is_an_error() {
        assert!(parse_script("let x = 1").is_err());
    }

    #[test]
    fn assignment_target_validation() {
        let err = parse_script("1 = 2;").unwrap_err();
        assert!(matches!(err, ParseError::InvalidAssignmentTarget { .. }));
    }

    #[test]
    fn import_rejected_in_script_mode() {
        let err = parse_script("import { a } from \"m\";").unwrap_err();
        assert!(matches!(err, ParseError::ModuleOnly { .. }));
    }

    #[test]
    fn import_meta_rejected_in_script_mode() {
        let err = parse_script("import.meta.url;").unwrap_err();
        assert!(matches!(err, ParseError::ModuleOnly { .. }));
    }

    #[test]
    fn parse_module_imports_and_exports() {
        let program = parse_module(
            "import { add, mul as times } from \"./math\";\n\
             export const three = add(1, 2);\n\
             export function double(x) { return times(2, x); }\n\
             let hidden = 1;\n\
             export { hidden };",
        )
        .expect("parse failed");
        assert_eq!(program.items.len(), 5);
        match &program.items[0] {
            Item::Import(decl) => {
                assert_eq!(decl.specifier, "./math");
                assert_eq!(
                    decl.bindings,
                    vec![
                        ("add".to_string(), "add".to_string()),
                        ("mul".to_string(), "times".to_string())
                    ]
                );
            }
            other => panic!("unexpected item: {other:?}"),
        }
        match &program.items[4] {
            Item::Export(decl) => {
                assert!(decl.stmt.is_none());
                assert_eq!(decl.names, vec!["hidden".to_string()]);
            }
            other => panic!("unexpected item: {other:?}"),
        }
    }

    #[test]
    fn parse_try_catch() {
        let stmt = first_stmt("try { work(); } catch (e) { handle(e); }");
        match stmt {
            Stmt::Try { param, handler, .. } => {
                assert_eq!(param, Some("e".to_string()));
                assert_eq!(handler.len(), 1);
            }
            other => panic!("unexpected shape: {other:?}"),
        }
    }

    #[test]
    fn parse_for_loop() {
        let stmt = first_stmt("for (let i = 0; i < 10; i += 1) { body(); }");
        match stmt {
            Stmt::For {
                init,
                cond,
                update,
                ..
            } => {
                assert!(init.is_some());
                assert!(cond.is_some());
                assert!(update.is_some());
            }
            other => panic!("unexpected shape: {other:?}"),
        }
    }

    #[test]
    fn error_spans_point_at_the_offender() {
        let err = parse_script("let x = ;").unwrap_err();
        match err {
            ParseError::UnexpectedToken { span, .. } => {
                assert_eq!(span.line, 1);
                assert_eq!(span.col, 9);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
