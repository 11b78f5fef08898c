//! Error types.
//!
//! Script-visible failures travel as [`Exception`] values through
//! [`ScriptResult`]; the thiserror enums below describe host-side failure
//! detail and format the messages those exceptions carry.

use std::fmt;

use thiserror::Error;

use crate::context::Context;
use crate::engine::interp;
use crate::engine::span::Span;
use crate::value::Value;

/// Result type for every operation that can raise a script exception.
pub type ScriptResult<T> = Result<T, Exception>;

// ============================================================================
// Parse errors
// ============================================================================

/// Errors produced while tokenizing or parsing source text.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("{span}: unexpected character '{ch}'")]
    UnexpectedChar { ch: char, span: Span },

    #[error("{span}: unknown escape sequence '\\{ch}'")]
    InvalidEscape { ch: char, span: Span },

    #[error("{span}: unterminated string literal")]
    UnterminatedString { span: Span },

    #[error("{span}: unterminated block comment")]
    UnterminatedComment { span: Span },

    #[error("{span}: invalid number literal")]
    InvalidNumber { span: Span },

    #[error("{span}: unexpected {found}, expected {expected}")]
    UnexpectedToken {
        found: String,
        expected: String,
        span: Span,
    },

    #[error("{span}: invalid assignment target")]
    InvalidAssignmentTarget { span: Span },

    #[error("{span}: missing initializer in const declaration")]
    ConstWithoutInit { span: Span },

    #[error("{span}: {construct} is only allowed in modules")]
    ModuleOnly {
        construct: &'static str,
        span: Span,
    },
}

impl ParseError {
    /// The source location the error points at.
    pub fn span(&self) -> Span {
        match self {
            ParseError::UnexpectedChar { span, .. }
            | ParseError::InvalidEscape { span, .. }
            | ParseError::UnterminatedString { span }
            | ParseError::UnterminatedComment { span }
            | ParseError::InvalidNumber { span }
            | ParseError::UnexpectedToken { span, .. }
            | ParseError::InvalidAssignmentTarget { span }
            | ParseError::ConstWithoutInit { span }
            | ParseError::ModuleOnly { span, .. } => *span,
        }
    }
}

// ============================================================================
// Conversion errors
// ============================================================================

/// Errors produced while converting script values to native types.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConversionError {
    #[error("expected {expected}, got {actual}")]
    TypeMismatch {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("expected an array of length {expected}, got length {actual}")]
    LengthMismatch { expected: usize, actual: usize },
}

// ============================================================================
// Native call errors
// ============================================================================

/// Errors produced inside native method and accessor trampolines.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NativeError {
    #[error("'this' is not an instance of {expected}, got {actual}")]
    ThisTypeMismatch {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("instance of {class} is already borrowed")]
    BorrowConflict { class: &'static str },

    #[error("value refers to a collected object")]
    StaleHandle,
}

// ============================================================================
// Exception
// ============================================================================

/// A script exception in flight.
///
/// Wraps the thrown value, which stays rooted for as long as the exception
/// is alive. Thrown values are usually error objects with `name` and
/// `message` properties, but any value can be thrown.
pub struct Exception {
    value: Value,
}

impl Exception {
    pub(crate) fn from_value(value: Value) -> Self {
        Self { value }
    }

    /// The thrown value.
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Consume the exception, returning the thrown value.
    pub fn into_value(self) -> Value {
        self.value
    }

    /// Human-readable description, `"TypeError: ..."` for error objects.
    pub fn message(&self) -> String {
        interp::exception_text(&self.value)
    }

    /// Raise a `TypeError` with the given message.
    pub fn type_error(ctx: &Context, message: impl Into<String>) -> Self {
        Self::from_value(interp::make_error(ctx, "TypeError", &message.into()))
    }

    /// Raise a `RangeError` with the given message.
    pub fn range_error(ctx: &Context, message: impl Into<String>) -> Self {
        Self::from_value(interp::make_error(ctx, "RangeError", &message.into()))
    }

    /// Raise a `ReferenceError` with the given message.
    pub fn reference_error(ctx: &Context, message: impl Into<String>) -> Self {
        Self::from_value(interp::make_error(ctx, "ReferenceError", &message.into()))
    }

    /// Raise a `SyntaxError` with the given message.
    pub fn syntax_error(ctx: &Context, message: impl Into<String>) -> Self {
        Self::from_value(interp::make_error(ctx, "SyntaxError", &message.into()))
    }

    /// Raise a plain `Error` with the given message.
    pub fn error(ctx: &Context, message: impl Into<String>) -> Self {
        Self::from_value(interp::make_error(ctx, "Error", &message.into()))
    }

    pub(crate) fn conversion(ctx: &Context, err: ConversionError) -> Self {
        Self::type_error(ctx, err.to_string())
    }

    pub(crate) fn native(ctx: &Context, err: NativeError) -> Self {
        Self::type_error(ctx, err.to_string())
    }

    pub(crate) fn parse(ctx: &Context, unit: &str, err: &ParseError) -> Self {
        Self::syntax_error(ctx, format!("{unit}: {err}"))
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message())
    }
}

impl fmt::Debug for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Exception({})", self.message())
    }
}
