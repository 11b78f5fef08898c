//! The embedded script engine: lexer, parser, object heap, and tree
//! interpreter.
//!
//! Nothing here is public API. Hosts interact through
//! [`Context`](crate::Context), [`Value`](crate::Value), and the
//! registration builders; scripts reach native code only through the
//! trampolines those install.

pub(crate) mod ast;
pub(crate) mod heap;
pub(crate) mod interp;
pub(crate) mod lexer;
pub(crate) mod modules;
pub(crate) mod object;
pub(crate) mod parser;
pub(crate) mod span;
pub(crate) mod token;
