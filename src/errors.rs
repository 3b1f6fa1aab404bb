/// Structured error types for Fluence's execution core.
///
/// `thiserror` gives every error enum its `Display`/`Error` impl; `miette`
/// is derived on the host-facing variants so an embedding CLI can render
/// labelled spans for free. The core itself never prints these — it only
/// builds the value and hands it to the host (spec §7).

use miette::Diagnostic;
use thiserror::Error;

use crate::instruction::Addr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub source_id: u32,
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(source_id: u32, start: usize, end: usize) -> Self {
        Span { source_id, start, end }
    }

    pub fn merge(self, other: Span) -> Span {
        Span {
            source_id: self.source_id,
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

/// Lexer/parser errors are external-collaborator contracts (spec §1): the
/// core only needs a place to carry them through `CompileError`.
#[derive(Debug, Clone, Error, Diagnostic)]
pub enum LexerError {
    #[error("unexpected character '{ch}'")]
    UnexpectedCharacter { ch: char, span: Span },
    #[error("unterminated string literal")]
    UnterminatedString { span: Span },
    #[error("invalid number literal '{text}'")]
    InvalidNumber { text: String, span: Span },
}

#[derive(Debug, Clone, Error, Diagnostic)]
pub enum ParserError {
    #[error("expected {expected}, found {found}")]
    UnexpectedToken { expected: String, found: String, span: Span },
    #[error("invalid syntax in {context}")]
    InvalidSyntax { context: String, span: Span },
    #[error("unexpected end of input in {context}")]
    UnexpectedEof { context: String, span: Span },
    #[error("library '{name}' is not in the allowed-intrinsics list")]
    LibraryDenied { name: String, span: Span },
}

/// Runtime error subkinds, matching spec §6's taxonomy exactly.
#[derive(Debug, Clone, Error, Diagnostic)]
pub enum RuntimeError {
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },

    #[error("division by zero")]
    DivisionByZero,

    #[error("index {index} out of range for length {length}")]
    IndexOutOfRange { index: i64, length: usize },

    #[error("undefined name '{name}'")]
    UndefinedName { name: String },

    #[error("expected {expected} arguments, found {found}")]
    ArityMismatch { expected: usize, found: usize },

    #[error("readonly violation: '{name}' was already initialized")]
    ReadonlyViolation { name: String },

    #[error("unhandled exception: {message}")]
    UnhandledThrow { message: String },

    #[error("stack overflow ({depth} frames)")]
    StackOverflow { depth: usize },

    #[error("library '{name}' is not allowed")]
    LibraryDenied { name: String },
}

/// Full error report attached to a `RuntimeError` when it escapes every
/// try-block (spec §7): instruction pointer, demangled function name, a
/// truncated snapshot of locals, the operand stack, the offending
/// instruction's debug info, and a most-recent-last stack trace.
#[derive(Debug, Clone)]
pub struct StackFrameTrace {
    pub function_name: String,
    pub ip: Addr,
    pub line: u32,
    pub column: u32,
    pub file: Option<String>,
}

#[derive(Debug, Clone, Error)]
#[error("{source}")]
pub struct RuntimeErrorReport {
    #[source]
    pub source: RuntimeError,
    pub ip: Addr,
    pub function_name: String,
    pub locals_snapshot: Vec<String>,
    pub operand_stack_snapshot: Vec<String>,
    pub trace: Vec<StackFrameTrace>,
}

impl RuntimeErrorReport {
    /// Values in the snapshot are truncated to 150 chars (spec §7).
    pub fn truncate_value(display: &str) -> String {
        if display.len() <= 150 {
            display.to_string()
        } else {
            let mut s = display.chars().take(150).collect::<String>();
            s.push('…');
            s
        }
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum CompileError {
    #[error(transparent)]
    Lexer(#[from] LexerError),
    #[error(transparent)]
    Parser(#[from] ParserError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn span_merge_widens_to_cover_both() {
        let a = Span::new(0, 5, 10);
        let b = Span::new(0, 2, 7);
        let m = a.merge(b);
        assert_eq!(m.start, 2);
        assert_eq!(m.end, 10);
    }

    #[test]
    fn long_values_are_truncated_for_error_snapshots() {
        let long = "x".repeat(200);
        let t = RuntimeErrorReport::truncate_value(&long);
        assert!(t.chars().count() <= 151);
    }
}
