// Lexer for Waveling .wave source files.
//
// Tokenizes source text into the token stream consumed by the parser.
// Uses the `logos` crate for DFA-based lexing.
//
// Preconditions: input is valid UTF-8.
// Postconditions: returns all tokens with byte-offset spans, plus any lex errors.
// Failure modes: stray characters, bad numeric suffixes, and unterminated
//   string literals produce `LexError`; lexing continues past them.
// Side effects: none.

use logos::Logos;
use std::fmt;

/// Byte-offset span in source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

/// A lexer error with location.
#[derive(Debug, Clone, PartialEq)]
pub struct LexError {
    pub span: Span,
    pub message: String,
}

/// Result of lexing: tokens plus any errors (non-fatal).
#[derive(Debug)]
pub struct LexResult {
    pub tokens: Vec<(Token, Span)>,
    pub errors: Vec<LexError>,
}

/// Explicit scalar-type suffix on a numeric literal (`1f64`, `0xffi64`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumSuffix {
    I32,
    I64,
    F32,
    F64,
}

/// Parsed value of a numeric literal.
///
/// Integer values are kept wide so folding can evaluate at extended
/// precision before rounding to the resolved type.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NumValue {
    Int(i128),
    Float(f64),
}

/// A numeric literal: value plus optional type suffix.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NumLit {
    pub value: NumValue,
    pub suffix: Option<NumSuffix>,
}

/// Waveling token types.
///
/// Keywords and symbols are matched as fixed strings. Numeric literals carry
/// their parsed value and suffix. Identifiers carry no value — use the span
/// to retrieve the text from the source.
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\n]+|//[^\n]*")]
pub enum Token {
    // ── Keywords ──
    #[token("program")]
    Program,
    #[token("external")]
    External,
    #[token("stage")]
    Stage,
    #[token("let")]
    Let,
    #[token("cell")]
    Cell,
    #[token("buffer")]
    Buffer,
    #[token("true")]
    True,
    #[token("false")]
    False,

    // ── Multi-character operators ──
    //
    // Listed before their single-character prefixes; logos prefers the
    // longer fixed match.
    #[token("->")]
    Arrow,
    #[token("<-")]
    BackArrow,
    #[token("&&")]
    AndAnd,
    #[token("||")]
    OrOr,
    #[token("<<")]
    Shl,
    #[token(">>")]
    Shr,
    #[token("<=")]
    Le,
    #[token(">=")]
    Ge,
    #[token("==")]
    EqEq,
    #[token("!=")]
    Ne,

    // ── Single-character operators ──
    #[token("!")]
    Bang,
    #[token("~")]
    Tilde,
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("%")]
    Percent,
    #[token("<")]
    Lt,
    #[token(">")]
    Gt,
    #[token("&")]
    Amp,
    #[token("^")]
    Caret,
    #[token("|")]
    Pipe,

    // ── Punctuation ──
    #[token(",")]
    Comma,
    #[token("=")]
    Equals,
    #[token(":")]
    Colon,
    #[token(";")]
    Semi,
    #[token(".")]
    Dot,
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,

    // ── Literals ──
    //
    // A trailing identifier chunk is captured with the number so that a bad
    // suffix is one malformed literal, not a number followed by a stray
    // identifier. The callbacks reject anything but i32/i64/f32/f64.
    /// Hex integer literal with optional integer suffix (`0xff`, `0xffi64`).
    #[regex(r"0x[0-9a-fA-F]+([A-Za-z_][A-Za-z0-9_]*)?", parse_hex)]
    HexNumber(NumLit),

    /// Decimal literal with optional suffix (`1`, `2.5`, `1f64`, `2.5f32`).
    #[regex(r"[0-9]+(\.[0-9]+)?([A-Za-z_][A-Za-z0-9_]*)?", parse_number)]
    Number(NumLit),

    /// String literal (external block values only).
    #[regex(r#""[^"\n]*""#, parse_string, priority = 3)]
    Str(String),

    /// A string literal missing its closing quote. Converted to a lex error.
    #[regex(r#""[^"\n]*"#, priority = 2)]
    UnterminatedStr,

    // ── Identifier ──
    /// Identifier: `[A-Za-z_][A-Za-z0-9_]*`
    #[regex(r"[A-Za-z_][A-Za-z0-9_]*")]
    Ident,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Program => write!(f, "program"),
            Token::External => write!(f, "external"),
            Token::Stage => write!(f, "stage"),
            Token::Let => write!(f, "let"),
            Token::Cell => write!(f, "cell"),
            Token::Buffer => write!(f, "buffer"),
            Token::True => write!(f, "true"),
            Token::False => write!(f, "false"),
            Token::Arrow => write!(f, "->"),
            Token::BackArrow => write!(f, "<-"),
            Token::AndAnd => write!(f, "&&"),
            Token::OrOr => write!(f, "||"),
            Token::Shl => write!(f, "<<"),
            Token::Shr => write!(f, ">>"),
            Token::Le => write!(f, "<="),
            Token::Ge => write!(f, ">="),
            Token::EqEq => write!(f, "=="),
            Token::Ne => write!(f, "!="),
            Token::Bang => write!(f, "!"),
            Token::Tilde => write!(f, "~"),
            Token::Plus => write!(f, "+"),
            Token::Minus => write!(f, "-"),
            Token::Star => write!(f, "*"),
            Token::Slash => write!(f, "/"),
            Token::Percent => write!(f, "%"),
            Token::Lt => write!(f, "<"),
            Token::Gt => write!(f, ">"),
            Token::Amp => write!(f, "&"),
            Token::Caret => write!(f, "^"),
            Token::Pipe => write!(f, "|"),
            Token::Comma => write!(f, ","),
            Token::Equals => write!(f, "="),
            Token::Colon => write!(f, ":"),
            Token::Semi => write!(f, ";"),
            Token::Dot => write!(f, "."),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::LBrace => write!(f, "{{"),
            Token::RBrace => write!(f, "}}"),
            Token::LBracket => write!(f, "["),
            Token::RBracket => write!(f, "]"),
            Token::HexNumber(n) | Token::Number(n) => match n.value {
                NumValue::Int(v) => write!(f, "{v}"),
                NumValue::Float(v) => write!(f, "{v}"),
            },
            Token::Str(s) => write!(f, "\"{s}\""),
            Token::UnterminatedStr => write!(f, "<unterminated string>"),
            Token::Ident => write!(f, "<ident>"),
        }
    }
}

// ── Callbacks ──

fn parse_suffix(text: &str) -> Result<Option<NumSuffix>, ()> {
    match text {
        "" => Ok(None),
        "i32" => Ok(Some(NumSuffix::I32)),
        "i64" => Ok(Some(NumSuffix::I64)),
        "f32" => Ok(Some(NumSuffix::F32)),
        "f64" => Ok(Some(NumSuffix::F64)),
        _ => Err(()),
    }
}

fn parse_hex(lex: &mut logos::Lexer<'_, Token>) -> Result<NumLit, ()> {
    let slice = &lex.slice()[2..];
    let digits_end = slice
        .find(|c: char| !c.is_ascii_hexdigit())
        .unwrap_or(slice.len());
    let (digits, rest) = slice.split_at(digits_end);
    let suffix = parse_suffix(rest)?;
    // A float suffix on a hex literal is malformed.
    if matches!(suffix, Some(NumSuffix::F32 | NumSuffix::F64)) {
        return Err(());
    }
    let value = i128::from_str_radix(digits, 16).map_err(|_| ())?;
    Ok(NumLit {
        value: NumValue::Int(value),
        suffix,
    })
}

fn parse_number(lex: &mut logos::Lexer<'_, Token>) -> Result<NumLit, ()> {
    let slice = lex.slice();
    let digits_end = slice
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(slice.len());
    let (digits, rest) = slice.split_at(digits_end);
    let suffix = parse_suffix(rest)?;

    if digits.contains('.') {
        // A fractional literal only accepts float suffixes.
        if matches!(suffix, Some(NumSuffix::I32 | NumSuffix::I64)) {
            return Err(());
        }
        let value: f64 = digits.parse().map_err(|_| ())?;
        Ok(NumLit {
            value: NumValue::Float(value),
            suffix,
        })
    } else {
        let value: i128 = digits.parse().map_err(|_| ())?;
        Ok(NumLit {
            value: NumValue::Int(value),
            suffix,
        })
    }
}

fn parse_string(lex: &mut logos::Lexer<'_, Token>) -> String {
    let slice = lex.slice();
    slice[1..slice.len() - 1].to_string()
}

// ── Public API ──

/// Lex a Waveling source string into tokens.
///
/// Returns all successfully parsed tokens together with any errors. Lexing
/// is non-fatal: errors are collected and the lexer continues past bad
/// input.
pub fn lex(source: &str) -> LexResult {
    let lexer = Token::lexer(source);
    let mut tokens = Vec::new();
    let mut errors = Vec::new();

    for (result, range) in lexer.spanned() {
        let span = Span {
            start: range.start,
            end: range.end,
        };
        match result {
            Ok(Token::UnterminatedStr) => errors.push(LexError {
                span,
                message: "unterminated string literal".to_string(),
            }),
            Ok(token) => tokens.push((token, span)),
            Err(()) => {
                let text = &source[span.start..span.end];
                let message = if text.starts_with(|c: char| c.is_ascii_digit()) {
                    format!("malformed numeric literal: {:?}", text)
                } else {
                    format!("unexpected character: {:?}", text)
                };
                errors.push(LexError { span, message });
            }
        }
    }

    LexResult { tokens, errors }
}

// ── Tests ──
