// diag.rs — Unified diagnostics model
//
// Provides the shared diagnostic types used across all compiler phases.
//
// Preconditions: none (types only).
// Postconditions: none (types only).
// Failure modes: none.
// Side effects: none.

use std::fmt;

use crate::ast::Span;

// ── Diagnostic code ──────────────────────────────────────────────────────

/// A stable diagnostic code (e.g., `E0101`, `W0301`).
///
/// Codes are `&'static str` constants defined in the `codes` module. Once
/// assigned, a code must never be reassigned to a different semantic
/// meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DiagCode(pub &'static str);

impl fmt::Display for DiagCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable diagnostic codes, grouped by error class.
///
/// E01xx lexical · E02xx syntactic · E03xx name resolution · E04xx shape ·
/// E05xx rate · E06xx structural · E07xx folding · E08xx external block.
pub mod codes {
    use super::DiagCode;

    pub const LEX_STRAY_CHAR: DiagCode = DiagCode("E0101");
    pub const LEX_BAD_LITERAL: DiagCode = DiagCode("E0102");
    pub const LEX_UNTERMINATED: DiagCode = DiagCode("E0103");

    pub const PARSE_SYNTAX: DiagCode = DiagCode("E0201");

    pub const NAME_UNDECLARED: DiagCode = DiagCode("E0301");
    pub const NAME_REDECLARED: DiagCode = DiagCode("E0302");
    pub const NAME_BAD_PATH: DiagCode = DiagCode("E0303");

    pub const SHAPE_WIDTH_MISMATCH: DiagCode = DiagCode("E0401");
    pub const SHAPE_SCALAR_MISMATCH: DiagCode = DiagCode("E0402");
    pub const SHAPE_UNRESOLVED: DiagCode = DiagCode("E0403");
    pub const SHAPE_BOOL_OPERAND: DiagCode = DiagCode("E0404");

    pub const RATE_TOO_HIGH: DiagCode = DiagCode("E0501");

    pub const STRUCT_MISSING_PIN: DiagCode = DiagCode("E0601");
    pub const STRUCT_UNKNOWN_PIN: DiagCode = DiagCode("E0602");
    pub const STRUCT_CYCLE: DiagCode = DiagCode("E0603");
    pub const STRUCT_CROSS_STAGE: DiagCode = DiagCode("E0604");
    pub const STRUCT_UNKNOWN_BUFFER: DiagCode = DiagCode("E0605");
    pub const STRUCT_BAD_CAPACITY: DiagCode = DiagCode("E0606");
    pub const STRUCT_BAD_CELL_DELAY: DiagCode = DiagCode("E0607");
    pub const STRUCT_OUTPUT_SHAPE: DiagCode = DiagCode("E0608");
    pub const STRUCT_DELAY_RANGE: DiagCode = DiagCode("E0609");
    pub const STRUCT_BAD_ARG: DiagCode = DiagCode("E0610");
    pub const STRUCT_DOUBLE_ASSIGN: DiagCode = DiagCode("E0611");
    pub const STRUCT_BAD_SLICE: DiagCode = DiagCode("E0612");

    pub const FOLD_NOT_CONSTANT: DiagCode = DiagCode("E0701");
    pub const FOLD_EVAL: DiagCode = DiagCode("E0702");

    pub const EXTERNAL_BAD_BLOCK: DiagCode = DiagCode("E0801");
    pub const EXTERNAL_BAD_FIELD: DiagCode = DiagCode("E0802");

    pub const WARN_UNUSED_LET: DiagCode = DiagCode("W0301");
}

// ── Severity level ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagLevel {
    Error,
    Warning,
}

// ── Related span ─────────────────────────────────────────────────────────

/// A secondary source location providing context for a diagnostic.
#[derive(Debug, Clone)]
pub struct RelatedSpan {
    pub span: Span,
    pub label: String,
}

// ── Diagnostic ───────────────────────────────────────────────────────────

/// A compiler diagnostic emitted by any phase.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub code: Option<DiagCode>,
    pub level: DiagLevel,
    pub span: Span,
    pub message: String,
    pub hint: Option<String>,
    pub related_spans: Vec<RelatedSpan>,
}

impl Diagnostic {
    /// Create a new diagnostic with no code, hint, or related spans.
    pub fn new(level: DiagLevel, span: Span, message: impl Into<String>) -> Self {
        Self {
            code: None,
            level,
            span,
            message: message.into(),
            hint: None,
            related_spans: Vec::new(),
        }
    }

    /// Shorthand for an error-level diagnostic with a code.
    pub fn error(code: DiagCode, span: Span, message: impl Into<String>) -> Self {
        Self::new(DiagLevel::Error, span, message).with_code(code)
    }

    /// Shorthand for a warning-level diagnostic with a code.
    pub fn warning(code: DiagCode, span: Span, message: impl Into<String>) -> Self {
        Self::new(DiagLevel::Warning, span, message).with_code(code)
    }

    /// Attach a stable diagnostic code.
    pub fn with_code(mut self, code: DiagCode) -> Self {
        self.code = Some(code);
        self
    }

    /// Attach a remediation hint.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// Attach a related span.
    pub fn with_related(mut self, span: Span, label: impl Into<String>) -> Self {
        self.related_spans.push(RelatedSpan {
            span,
            label: label.into(),
        });
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.level {
            DiagLevel::Error => "error",
            DiagLevel::Warning => "warning",
        };
        if let Some(code) = &self.code {
            write!(f, "{}[{}]: {}", level, code, self.message)?;
        } else {
            write!(f, "{}: {}", level, self.message)?;
        }
        if let Some(hint) = &self.hint {
            write!(f, "\n  hint: {}", hint)?;
        }
        Ok(())
    }
}

/// True if any diagnostic in the slice is error-level.
pub fn has_errors(diags: &[Diagnostic]) -> bool {
    diags.iter().any(|d| d.level == DiagLevel::Error)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_span() -> Span {
        use chumsky::span::Span as _;
        Span::new((), 0..1)
    }

    #[test]
    fn display_without_code() {
        let d = Diagnostic::new(DiagLevel::Error, dummy_span(), "something failed");
        assert_eq!(format!("{d}"), "error: something failed");
    }

    #[test]
    fn display_with_code() {
        let d = Diagnostic::warning(codes::WARN_UNUSED_LET, dummy_span(), "unused binding");
        assert_eq!(format!("{d}"), "warning[W0301]: unused binding");
    }

    #[test]
    fn builder_chain() {
        let d = Diagnostic::error(codes::SHAPE_WIDTH_MISMATCH, dummy_span(), "width mismatch")
            .with_hint("insert broadcast or truncate")
            .with_related(dummy_span(), "source signal here");

        assert_eq!(d.code, Some(codes::SHAPE_WIDTH_MISMATCH));
        assert_eq!(d.hint.as_deref(), Some("insert broadcast or truncate"));
        assert_eq!(d.related_spans.len(), 1);
    }

    #[test]
    fn has_errors_ignores_warnings() {
        let w = Diagnostic::warning(codes::WARN_UNUSED_LET, dummy_span(), "w");
        assert!(!has_errors(&[w.clone()]));
        let e = Diagnostic::error(codes::PARSE_SYNTAX, dummy_span(), "e");
        assert!(has_errors(&[w, e]));
    }
}
