//! Syntax tree produced by the parser and walked by the evaluator.

use std::rc::Rc;

use crate::engine::span::Span;

/// A parsed compilation unit, either a script or a module.
#[derive(Debug)]
pub struct Program {
    pub items: Vec<Item>,
}

/// A top-level item. Scripts only contain statements; modules may also
/// contain import and export declarations.
#[derive(Debug)]
pub enum Item {
    Stmt(Stmt),
    Import(ImportDecl),
    Export(ExportDecl),
}

/// `import { a, b as c } from "specifier";`
#[derive(Debug)]
pub struct ImportDecl {
    /// Pairs of (exported name, local binding).
    pub bindings: Vec<(String, String)>,
    pub specifier: String,
    pub span: Span,
}

/// `export <decl>;` or `export { a, b };`
#[derive(Debug)]
pub struct ExportDecl {
    /// The exported declaration, absent for bare `export { ... }` lists.
    pub stmt: Option<Stmt>,
    /// Names this declaration exposes.
    pub names: Vec<String>,
    pub span: Span,
}

#[derive(Debug)]
pub enum Stmt {
    Expr(Expr),
    Let {
        name: String,
        init: Option<Expr>,
        mutable: bool,
        span: Span,
    },
    Function(Rc<FuncDef>),
    If {
        cond: Expr,
        then_branch: Box<Stmt>,
        else_branch: Option<Box<Stmt>>,
    },
    While {
        cond: Expr,
        body: Box<Stmt>,
    },
    For {
        init: Option<Box<Stmt>>,
        cond: Option<Expr>,
        update: Option<Expr>,
        body: Box<Stmt>,
    },
    Return {
        value: Option<Expr>,
        span: Span,
    },
    Break(Span),
    Continue(Span),
    Throw(Expr),
    Try {
        block: Vec<Stmt>,
        param: Option<String>,
        handler: Vec<Stmt>,
    },
    Block(Vec<Stmt>),
    Empty,
}

#[derive(Debug)]
pub enum Expr {
    Int(i32),
    Float(f64),
    Str(String),
    Bool(bool),
    Null,
    Ident(String, Span),
    Array(Vec<Expr>),
    Object(Vec<(String, Expr)>),
    Function(Rc<FuncDef>),
    Member {
        object: Box<Expr>,
        property: String,
        span: Span,
    },
    Index {
        object: Box<Expr>,
        index: Box<Expr>,
        span: Span,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
        span: Span,
    },
    New {
        callee: Box<Expr>,
        args: Vec<Expr>,
        span: Span,
    },
    Assign {
        target: Box<Expr>,
        op: AssignOp,
        value: Box<Expr>,
        span: Span,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Logical {
        op: LogicalOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Conditional {
        cond: Box<Expr>,
        then_branch: Box<Expr>,
        else_branch: Box<Expr>,
    },
    /// `import.meta`, only valid inside modules.
    ImportMeta(Span),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AssignOp {
    Assign,
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    EqEq,
    StrictEq,
    NotEq,
    StrictNotEq,
    Lt,
    Gt,
    Le,
    Ge,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
    Typeof,
}

/// A function definition shared between its declaration site and every
/// closure created from it.
#[derive(Debug)]
pub struct FuncDef {
    pub name: Option<String>,
    pub params: Vec<String>,
    pub body: FuncBody,
    /// Arrows inherit `this` from the enclosing scope.
    pub is_arrow: bool,
    pub span: Span,
}

#[derive(Debug)]
pub enum FuncBody {
    Block(Vec<Stmt>),
    Expr(Box<Expr>),
}
