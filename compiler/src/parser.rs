// Parser for Waveling .wave source files.
//
// Parses a token stream (from the lexer) into an AST. Uses chumsky
// combinators. Expression parsing follows the C-like precedence ladder,
// tightest first: postfix `[i]` → unary → `* / %` → `+ -` → `<< >>` →
// comparisons → `&` → `^` → `|` → `&&` → `||` → `,` (output stacking) →
// `->` → `<-`.
//
// Preconditions: input is a valid token stream from `lexer::lex()`.
// Postconditions: returns an AST plus any parse errors (non-fatal).
// Failure modes: syntax errors produce `Rich` diagnostics.
// Side effects: none.

use chumsky::input::{Stream, ValueInput};
use chumsky::prelude::*;
use chumsky::span::SimpleSpan;

use crate::ast::*;
use crate::lexer::{LexError, NumLit, NumValue, Token};

/// Result of parsing: AST plus any errors.
///
/// Lex errors are kept separate from parse errors so the pipeline can code
/// them by class.
#[derive(Debug)]
pub struct ParseResult {
    pub program: Option<Program>,
    pub lex_errors: Vec<LexError>,
    pub errors: Vec<Rich<'static, Token, SimpleSpan>>,
}

/// Parse a Waveling source string. Lexes then parses.
pub fn parse(source: &str) -> ParseResult {
    let lex_result = crate::lexer::lex(source);
    let len = source.len();

    // Convert lexer output to chumsky stream.
    let token_iter = lex_result.tokens.into_iter().map(|(tok, span)| {
        let cspan: SimpleSpan = (span.start..span.end).into();
        (tok, cspan)
    });
    let eoi: SimpleSpan = (len..len).into();
    let stream = Stream::from_iter(token_iter).map(eoi, |(t, s): (_, _)| (t, s));

    let parser = program_parser(source);
    let (program, parse_errors) = parser.parse(stream).into_output_errors();

    ParseResult {
        program,
        lex_errors: lex_result.errors,
        errors: parse_errors.into_iter().map(|e| e.into_owned()).collect(),
    }
}

// ── Main parser builder ──
//
// All grammar rules are built inside `program_parser` so that the `source`
// reference is captured once and shared by all combinators. This avoids
// complex lifetime annotations on per-rule helper functions.

fn program_parser<'tokens, 'src: 'tokens, I>(
    source: &'src str,
) -> impl Parser<'tokens, I, Program, extra::Err<Rich<'tokens, Token, SimpleSpan>>> + 'src
where
    'tokens: 'src,
    I: ValueInput<'tokens, Token = Token, Span = SimpleSpan>,
{
    // ── Identifier ──

    let ident = just(Token::Ident).map_with(move |_, e| {
        let span: SimpleSpan = e.span();
        Ident {
            name: source[span.start()..span.end()].to_string(),
            span,
        }
    });

    // ── Plain (unsuffixed) integer literal — widths, indices, cell delays ──

    let int_lit = select! {
        Token::Number(NumLit { value: NumValue::Int(v), suffix: None }) = e => (v, e.span()),
        Token::HexNumber(NumLit { value: NumValue::Int(v), suffix: None }) = e => (v, e.span()),
    };

    // ── Type and shape literals ──

    let type_lit = ident.clone().try_map(|id, span| {
        let kind = match id.name.as_str() {
            "i32" => TypeLitKind::I32,
            "i64" => TypeLitKind::I64,
            "f32" => TypeLitKind::F32,
            "f64" => TypeLitKind::F64,
            "bool" => TypeLitKind::Bool,
            other => {
                return Err(Rich::custom(
                    span,
                    format!("expected a scalar type (i32, i64, f32, f64, bool), found '{other}'"),
                ))
            }
        };
        Ok(TypeLit {
            kind,
            span: id.span,
        })
    });

    let shape_lit = type_lit
        .then(
            int_lit
                .clone()
                .delimited_by(just(Token::LParen), just(Token::RParen)),
        )
        .try_map(|(ty, (width, width_span)), span| {
            if width < 1 {
                return Err(Rich::custom(span, "channel width must be at least 1"));
            }
            Ok((ty, width as u64, width_span))
        })
        .map_with(|(ty, width, width_span), e| ShapeLit {
            ty,
            width,
            width_span,
            span: e.span(),
        });

    // ── External block meta-values ──

    let meta_value = recursive(|meta_value| {
        let word = select! {
            Token::Str(s) = e => MetaValue::Word(s, e.span()),
        }
        .or(ident
            .clone()
            .map(|id| MetaValue::Word(id.name, id.span)));

        let int = int_lit.clone().map(|(v, s)| MetaValue::Int(v, s));

        let object = ident
            .clone()
            .then_ignore(just(Token::Colon))
            .then(meta_value.clone())
            .separated_by(just(Token::Comma))
            .allow_trailing()
            .collect::<Vec<_>>()
            .delimited_by(just(Token::LBrace), just(Token::RBrace))
            .map_with(|fields, e| MetaValue::Object(fields, e.span()));

        let array = meta_value
            .separated_by(just(Token::Comma))
            .allow_trailing()
            .collect::<Vec<_>>()
            .delimited_by(just(Token::LBracket), just(Token::RBracket))
            .map_with(|items, e| MetaValue::Array(items, e.span()));

        object.or(array).or(int).or(word)
    });

    let external_block = just(Token::External)
        .ignore_then(
            ident
                .clone()
                .then_ignore(just(Token::Colon))
                .then(meta_value)
                .separated_by(just(Token::Comma))
                .allow_trailing()
                .collect::<Vec<_>>()
                .delimited_by(just(Token::LBrace), just(Token::RBrace))
                .map_with(|fields, e| MetaValue::Object(fields, e.span())),
        )
        .map_with(|root, e| ExternalBlock {
            root,
            span: e.span(),
        });

    // ── Expressions ──
    //
    // `or_expr` is the ladder up to `||` — the grammar used anywhere a
    // comma is a separator (call arguments, bundle entries) rather than the
    // stacking operator. The full `expr` adds stacking and routing.

    let mut or_expr_decl = Recursive::declare();
    let mut expr_decl = Recursive::declare();

    let or_expr = or_expr_decl.clone();
    let expr = expr_decl.clone();

    // ── Primary ──

    let number = select! {
        Token::Number(n) => n,
        Token::HexNumber(n) => n,
    }
    .map_with(|n, e| Expr {
        kind: ExprKind::Number(n),
        span: e.span(),
    });

    let boolean = just(Token::True)
        .to(true)
        .or(just(Token::False).to(false))
        .map_with(|b, e| Expr {
            kind: ExprKind::Bool(b),
            span: e.span(),
        });

    let path = ident
        .clone()
        .separated_by(just(Token::Dot))
        .at_least(1)
        .collect::<Vec<_>>()
        .map_with(|segments, e| (Path { segments }, e.span()));

    let call_or_path = path
        .then(
            or_expr
                .clone()
                .separated_by(just(Token::Comma))
                .allow_trailing()
                .collect::<Vec<_>>()
                .delimited_by(just(Token::LParen), just(Token::RParen))
                .or_not(),
        )
        .map_with(|((path, path_span), args), e| match args {
            Some(args) => Expr {
                kind: ExprKind::Call(CallExpr {
                    callee: path,
                    callee_span: path_span,
                    args,
                    span: e.span(),
                }),
                span: e.span(),
            },
            None => Expr {
                kind: ExprKind::Path(path),
                span: path_span,
            },
        });

    let bundle_entry = ident
        .clone()
        .then_ignore(just(Token::Colon))
        .then(or_expr.clone())
        .map(|(name, value)| BundleEntry::Named(name, value))
        .or(or_expr.clone().map(BundleEntry::Positional));

    let bundle = bundle_entry
        .separated_by(just(Token::Comma))
        .allow_trailing()
        .collect::<Vec<_>>()
        .delimited_by(just(Token::LBrace), just(Token::RBrace))
        .map_with(|entries, e| Expr {
            kind: ExprKind::Bundle(entries, e.span()),
            span: e.span(),
        });

    let parens = expr
        .clone()
        .delimited_by(just(Token::LParen), just(Token::RParen));

    let primary = choice((number, boolean, bundle, call_or_path, parens));

    // ── Postfix: output selection `[i]` ──

    let postfix = primary.foldl_with(
        int_lit
            .clone()
            .delimited_by(just(Token::LBracket), just(Token::RBracket))
            .repeated(),
        |base, (index, index_span), e| Expr {
            kind: ExprKind::Index(Box::new(base), index, index_span),
            span: e.span(),
        },
    );

    // ── Unary: `! ~ + -` ──

    let unary_op = choice((
        just(Token::Bang).to(UnaryOp::Not),
        just(Token::Tilde).to(UnaryOp::BitNot),
        just(Token::Plus).to(UnaryOp::Plus),
        just(Token::Minus).to(UnaryOp::Neg),
    ));

    let unary = unary_op.repeated().foldr_with(postfix, |op, operand, e| Expr {
        kind: ExprKind::Unary(op, Box::new(operand)),
        span: e.span(),
    });

    // ── Binary ladder ──

    let product = unary.clone().foldl_with(
        choice((
            just(Token::Star).to(BinaryOp::Mul),
            just(Token::Slash).to(BinaryOp::Div),
            just(Token::Percent).to(BinaryOp::Rem),
        ))
        .then(unary)
        .repeated(),
        |lhs, (op, rhs), e| Expr {
            kind: ExprKind::Binary(op, Box::new(lhs), Box::new(rhs)),
            span: e.span(),
        },
    );

    let sum = product.clone().foldl_with(
        choice((
            just(Token::Plus).to(BinaryOp::Add),
            just(Token::Minus).to(BinaryOp::Sub),
        ))
        .then(product)
        .repeated(),
        |lhs, (op, rhs), e| Expr {
            kind: ExprKind::Binary(op, Box::new(lhs), Box::new(rhs)),
            span: e.span(),
        },
    );

    let shift = sum.clone().foldl_with(
        choice((
            just(Token::Shl).to(BinaryOp::Shl),
            just(Token::Shr).to(BinaryOp::Shr),
        ))
        .then(sum)
        .repeated(),
        |lhs, (op, rhs), e| Expr {
            kind: ExprKind::Binary(op, Box::new(lhs), Box::new(rhs)),
            span: e.span(),
        },
    );

    let comparison = shift.clone().foldl_with(
        choice((
            just(Token::Le).to(BinaryOp::Le),
            just(Token::Ge).to(BinaryOp::Ge),
            just(Token::Lt).to(BinaryOp::Lt),
            just(Token::Gt).to(BinaryOp::Gt),
            just(Token::EqEq).to(BinaryOp::Eq),
            just(Token::Ne).to(BinaryOp::Ne),
        ))
        .then(shift)
        .repeated(),
        |lhs, (op, rhs), e| Expr {
            kind: ExprKind::Binary(op, Box::new(lhs), Box::new(rhs)),
            span: e.span(),
        },
    );

    let bit_and = comparison.clone().foldl_with(
        just(Token::Amp)
            .to(BinaryOp::BitAnd)
            .then(comparison)
            .repeated(),
        |lhs, (op, rhs), e| Expr {
            kind: ExprKind::Binary(op, Box::new(lhs), Box::new(rhs)),
            span: e.span(),
        },
    );

    let bit_xor = bit_and.clone().foldl_with(
        just(Token::Caret)
            .to(BinaryOp::BitXor)
            .then(bit_and)
            .repeated(),
        |lhs, (op, rhs), e| Expr {
            kind: ExprKind::Binary(op, Box::new(lhs), Box::new(rhs)),
            span: e.span(),
        },
    );

    let bit_or = bit_xor.clone().foldl_with(
        just(Token::Pipe)
            .to(BinaryOp::BitOr)
            .then(bit_xor)
            .repeated(),
        |lhs, (op, rhs), e| Expr {
            kind: ExprKind::Binary(op, Box::new(lhs), Box::new(rhs)),
            span: e.span(),
        },
    );

    let logic_and = bit_or.clone().foldl_with(
        just(Token::AndAnd)
            .to(BinaryOp::And)
            .then(bit_or)
            .repeated(),
        |lhs, (op, rhs), e| Expr {
            kind: ExprKind::Binary(op, Box::new(lhs), Box::new(rhs)),
            span: e.span(),
        },
    );

    let logic_or = logic_and.clone().foldl_with(
        just(Token::OrOr)
            .to(BinaryOp::Or)
            .then(logic_and)
            .repeated(),
        |lhs, (op, rhs), e| Expr {
            kind: ExprKind::Binary(op, Box::new(lhs), Box::new(rhs)),
            span: e.span(),
        },
    );

    or_expr_decl.define(logic_or);

    // ── Output stacking: `a, b` ──

    let stack = or_expr_decl.clone().foldl_with(
        just(Token::Comma)
            .ignore_then(or_expr_decl.clone())
            .repeated(),
        |lhs, rhs, e| Expr {
            kind: ExprKind::Stack(Box::new(lhs), Box::new(rhs)),
            span: e.span(),
        },
    );

    // ── Routing: `->` tighter than `<-`, both left-associative ──
    //
    // Both forms normalize to `Route(src, dst)`; the expression's value is
    // the destination operand.

    let route = stack.clone().foldl_with(
        just(Token::Arrow).ignore_then(stack).repeated(),
        |src, dst, e| Expr {
            kind: ExprKind::Route(Box::new(src), Box::new(dst)),
            span: e.span(),
        },
    );

    let backroute = route.clone().foldl_with(
        just(Token::BackArrow).ignore_then(route).repeated(),
        |dst, src, e| Expr {
            kind: ExprKind::Route(Box::new(src), Box::new(dst)),
            span: e.span(),
        },
    );

    expr_decl.define(backroute);

    // ── Statements ──

    let let_stmt = just(Token::Let)
        .ignore_then(ident.clone())
        .then_ignore(just(Token::Equals))
        .then(expr_decl.clone())
        .map(|(name, value)| StmtKind::Let(LetStmt { name, value }));

    let assign_stmt = ident
        .clone()
        .then_ignore(just(Token::Equals))
        .then(expr_decl.clone())
        .map(|(name, value)| StmtKind::Assign(AssignStmt { name, value }));

    let cell_stmt = just(Token::Cell)
        .ignore_then(
            int_lit
                .clone()
                .delimited_by(just(Token::LParen), just(Token::RParen))
                .or_not(),
        )
        .then(
            ident
                .clone()
                .then_ignore(just(Token::Comma))
                .then(ident.clone())
                .delimited_by(just(Token::LParen), just(Token::RParen)),
        )
        .then_ignore(just(Token::Colon))
        .then(shape_lit.clone())
        .map(|((delay, (start, end)), shape)| {
            StmtKind::Cell(CellStmt {
                delay,
                start,
                end,
                shape,
            })
        });

    let buffer_stmt = just(Token::Buffer)
        .ignore_then(ident.clone())
        .then(
            or_expr_decl
                .clone()
                .delimited_by(just(Token::LParen), just(Token::RParen)),
        )
        .then_ignore(just(Token::Colon))
        .then(shape_lit.clone())
        .map(|((name, capacity), shape)| {
            StmtKind::Buffer(BufferStmt {
                name,
                capacity,
                shape,
            })
        });

    let expr_stmt = expr_decl.clone().map(StmtKind::Expr);

    let statement = choice((let_stmt, cell_stmt, buffer_stmt, assign_stmt, expr_stmt))
        .then_ignore(just(Token::Semi))
        .map_with(|kind, e| Stmt {
            kind,
            span: e.span(),
        });

    // ── Stage ──

    let stage_output_decl = ident
        .clone()
        .then_ignore(just(Token::Equals))
        .then(shape_lit)
        .map_with(|(name, shape), e| StageOutputDecl {
            name,
            shape,
            span: e.span(),
        });

    let stage = just(Token::Stage)
        .ignore_then(ident.clone())
        .then(
            stage_output_decl
                .separated_by(just(Token::Comma))
                .allow_trailing()
                .collect::<Vec<_>>()
                .delimited_by(just(Token::LParen), just(Token::RParen)),
        )
        .then(
            statement
                .repeated()
                .collect::<Vec<_>>()
                .delimited_by(just(Token::LBrace), just(Token::RBrace)),
        )
        .map_with(|((name, outputs), body), e| Stage {
            name,
            outputs,
            body,
            span: e.span(),
        });

    // ── Program ──

    let program_decl = just(Token::Program)
        .ignore_then(ident)
        .then_ignore(just(Token::Semi))
        .map_with(|name, e| ProgramDecl {
            name,
            span: e.span(),
        });

    program_decl
        .then(external_block)
        .then(stage.repeated().at_least(1).collect::<Vec<_>>())
        .map_with(|((decl, external), stages), e| Program {
            decl,
            external,
            stages,
            span: e.span(),
        })
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "program t;\nexternal { sr: 48000, block_size: 64, \
                          inputs: [], outputs: [], properties: [] }\n";

    fn parse_ok(source: &str) -> Program {
        let result = parse(source);
        assert!(
            result.lex_errors.is_empty(),
            "unexpected lex errors: {:?}",
            result.lex_errors
        );
        assert!(
            result.errors.is_empty(),
            "unexpected errors: {:#?}",
            result.errors
        );
        result.program.expect("expected program")
    }

    /// Wrap a stage body in the standard test header and parse it.
    fn parse_body(body: &str) -> Stage {
        let source = format!("{HEADER}stage main() {{\n{body}\n}}");
        let prog = parse_ok(&source);
        prog.stages.into_iter().next().unwrap()
    }

    fn parse_one_stmt(body: &str) -> Stmt {
        let stage = parse_body(body);
        assert_eq!(stage.body.len(), 1, "expected 1 statement");
        stage.body.into_iter().next().unwrap()
    }

    fn parse_expr(text: &str) -> Expr {
        match parse_one_stmt(&format!("{text};")).kind {
            StmtKind::Expr(e) => e,
            other => panic!("expected expression statement, got {other:?}"),
        }
    }

    // ── Program structure ──

    #[test]
    fn minimal_program() {
        let prog = parse_ok(&format!("{HEADER}stage main() {{ }}"));
        assert_eq!(prog.decl.name.name, "t");
        assert_eq!(prog.stages.len(), 1);
        assert!(prog.stages[0].body.is_empty());
    }

    #[test]
    fn program_requires_stage() {
        let result = parse(HEADER);
        assert!(!result.errors.is_empty());
    }

    #[test]
    fn multiple_stages() {
        let prog = parse_ok(&format!(
            "{HEADER}stage a(x = f32(1)) {{ }} stage b() {{ }}"
        ));
        assert_eq!(prog.stages.len(), 2);
        assert_eq!(prog.stages[0].outputs.len(), 1);
        assert_eq!(prog.stages[0].outputs[0].name.name, "x");
        assert_eq!(prog.stages[0].outputs[0].shape.width, 1);
    }

    #[test]
    fn stage_output_decls() {
        let prog = parse_ok(&format!(
            "{HEADER}stage s(wet = f32(2), dry = f64(1)) {{ }}"
        ));
        let outs = &prog.stages[0].outputs;
        assert_eq!(outs.len(), 2);
        assert_eq!(outs[0].shape.ty.kind, TypeLitKind::F32);
        assert_eq!(outs[0].shape.width, 2);
        assert_eq!(outs[1].shape.ty.kind, TypeLitKind::F64);
    }

    // ── External block ──

    #[test]
    fn external_block_tree() {
        let prog = parse_ok(&format!("{HEADER}stage main() {{ }}"));
        let MetaValue::Object(fields, _) = &prog.external.root else {
            panic!("expected object root");
        };
        assert_eq!(fields.len(), 5);
        assert_eq!(fields[0].0.name, "sr");
        assert!(matches!(fields[0].1, MetaValue::Int(48000, _)));
    }

    #[test]
    fn external_nested_objects() {
        let source = "program p;\nexternal { sr: 1, block_size: 1, \
                      inputs: [ { name: a, width: 2 } ], outputs: [], properties: [] }\n\
                      stage main() { }";
        let prog = parse_ok(source);
        let MetaValue::Object(fields, _) = &prog.external.root else {
            panic!("expected object root");
        };
        let MetaValue::Array(items, _) = &fields[2].1 else {
            panic!("expected inputs array");
        };
        assert!(matches!(items[0], MetaValue::Object(_, _)));
    }

    #[test]
    fn external_quoted_word() {
        let source = "program p;\nexternal { sr: 1, block_size: 1, inputs: [], \
                      outputs: [], properties: [ { name: \"gain\", type: f32, rate: b } ] }\n\
                      stage main() { }";
        parse_ok(source);
    }

    // ── Statements ──

    #[test]
    fn let_statement() {
        let s = parse_one_stmt("let x = 1 + 2;");
        let StmtKind::Let(l) = &s.kind else {
            panic!("expected let");
        };
        assert_eq!(l.name.name, "x");
        assert!(matches!(
            l.value.kind,
            ExprKind::Binary(BinaryOp::Add, _, _)
        ));
    }

    #[test]
    fn assign_statement() {
        let s = parse_one_stmt("mix = a + b;");
        let StmtKind::Assign(a) = &s.kind else {
            panic!("expected assign");
        };
        assert_eq!(a.name.name, "mix");
    }

    #[test]
    fn cell_statement() {
        let s = parse_one_stmt("cell (prev, nxt): f32(1);");
        let StmtKind::Cell(c) = &s.kind else {
            panic!("expected cell");
        };
        assert!(c.delay.is_none());
        assert_eq!(c.start.name, "prev");
        assert_eq!(c.end.name, "nxt");
        assert_eq!(c.shape.ty.kind, TypeLitKind::F32);
        assert_eq!(c.shape.width, 1);
    }

    #[test]
    fn cell_statement_with_delay() {
        let s = parse_one_stmt("cell(4) (a, b): f64(2);");
        let StmtKind::Cell(c) = &s.kind else {
            panic!("expected cell");
        };
        assert_eq!(c.delay.map(|(v, _)| v), Some(4));
    }

    #[test]
    fn buffer_statement() {
        let s = parse_one_stmt("buffer echo(128): f32(1);");
        let StmtKind::Buffer(b) = &s.kind else {
            panic!("expected buffer");
        };
        assert_eq!(b.name.name, "echo");
        assert!(matches!(b.capacity.kind, ExprKind::Number(_)));
    }

    #[test]
    fn buffer_capacity_expression() {
        let s = parse_one_stmt("buffer echo(2 * 64): f32(1);");
        let StmtKind::Buffer(b) = &s.kind else {
            panic!("expected buffer");
        };
        assert!(matches!(
            b.capacity.kind,
            ExprKind::Binary(BinaryOp::Mul, _, _)
        ));
    }

    // ── Expressions ──

    #[test]
    fn precedence_mul_before_add() {
        let e = parse_expr("a + b * c");
        let ExprKind::Binary(BinaryOp::Add, _, rhs) = e.kind else {
            panic!("expected + at root");
        };
        assert!(matches!(rhs.kind, ExprKind::Binary(BinaryOp::Mul, _, _)));
    }

    #[test]
    fn precedence_shift_after_add() {
        let e = parse_expr("a + b << c");
        assert!(matches!(e.kind, ExprKind::Binary(BinaryOp::Shl, _, _)));
    }

    #[test]
    fn precedence_bitwise_ladder() {
        // `a & b ^ c | d` groups as `((a & b) ^ c) | d`
        let e = parse_expr("a & b ^ c | d");
        let ExprKind::Binary(BinaryOp::BitOr, lhs, _) = e.kind else {
            panic!("expected | at root");
        };
        assert!(matches!(lhs.kind, ExprKind::Binary(BinaryOp::BitXor, _, _)));
    }

    #[test]
    fn comparison_produces_binary() {
        let e = parse_expr("a <= b");
        assert!(matches!(e.kind, ExprKind::Binary(BinaryOp::Le, _, _)));
    }

    #[test]
    fn unary_chain() {
        let e = parse_expr("-~x");
        let ExprKind::Unary(UnaryOp::Neg, inner) = e.kind else {
            panic!("expected negation at root");
        };
        assert!(matches!(inner.kind, ExprKind::Unary(UnaryOp::BitNot, _)));
    }

    #[test]
    fn index_postfix() {
        let e = parse_expr("input[0]");
        let ExprKind::Index(base, 0, _) = e.kind else {
            panic!("expected index");
        };
        assert!(matches!(base.kind, ExprKind::Path(_)));
    }

    #[test]
    fn path_expression() {
        let e = parse_expr("mixer.outputs.wet");
        let ExprKind::Path(p) = e.kind else {
            panic!("expected path");
        };
        assert_eq!(
            p.segments.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
            vec!["mixer", "outputs", "wet"]
        );
    }

    #[test]
    fn call_expression() {
        let e = parse_expr("delread(echo, 64)");
        let ExprKind::Call(c) = e.kind else {
            panic!("expected call");
        };
        assert_eq!(c.callee.segments[0].name, "delread");
        assert_eq!(c.args.len(), 2);
    }

    #[test]
    fn dotted_call() {
        let e = parse_expr("biquad.lowpass(x, 440.0, 0.7)");
        let ExprKind::Call(c) = e.kind else {
            panic!("expected call");
        };
        assert_eq!(c.callee.segments.len(), 2);
        assert_eq!(c.callee.segments[1].name, "lowpass");
        assert_eq!(c.args.len(), 3);
    }

    #[test]
    fn call_args_are_not_stacked() {
        // Inside argument lists a comma separates arguments; it is not the
        // stacking operator.
        let e = parse_expr("merge(a, b)");
        let ExprKind::Call(c) = e.kind else {
            panic!("expected call");
        };
        assert_eq!(c.args.len(), 2);
        assert!(matches!(c.args[0].kind, ExprKind::Path(_)));
    }

    #[test]
    fn bundle_literal() {
        let e = parse_expr("{ x, frequency: f, q: 0.7 } -> lp");
        let ExprKind::Route(src, _) = e.kind else {
            panic!("expected route");
        };
        let ExprKind::Bundle(entries, _) = src.kind else {
            panic!("expected bundle");
        };
        assert_eq!(entries.len(), 3);
        assert!(matches!(entries[0], BundleEntry::Positional(_)));
        assert!(matches!(entries[1], BundleEntry::Named(_, _)));
    }

    #[test]
    fn stacking_in_expression() {
        let e = parse_expr("a, b -> x");
        let ExprKind::Route(src, _) = e.kind else {
            panic!("expected route at root");
        };
        assert!(matches!(src.kind, ExprKind::Stack(_, _)));
    }

    #[test]
    fn route_chain_left_assoc() {
        let e = parse_expr("a -> b -> c");
        let ExprKind::Route(src, dst) = e.kind else {
            panic!("expected route at root");
        };
        assert!(matches!(src.kind, ExprKind::Route(_, _)));
        assert!(matches!(dst.kind, ExprKind::Path(_)));
    }

    #[test]
    fn backroute_normalizes() {
        // `x <- e` is `e -> x`
        let e = parse_expr("x <- a + b");
        let ExprKind::Route(src, dst) = e.kind else {
            panic!("expected route");
        };
        assert!(matches!(src.kind, ExprKind::Binary(BinaryOp::Add, _, _)));
        let ExprKind::Path(p) = dst.kind else {
            panic!("expected path destination");
        };
        assert_eq!(p.segments[0].name, "x");
    }

    #[test]
    fn arrow_tighter_than_backarrow() {
        // `x <- a -> b` is `x <- (a -> b)`
        let e = parse_expr("x <- a -> b");
        let ExprKind::Route(src, dst) = e.kind else {
            panic!("expected route at root");
        };
        assert!(matches!(src.kind, ExprKind::Route(_, _)));
        let ExprKind::Path(p) = dst.kind else {
            panic!("expected path destination");
        };
        assert_eq!(p.segments[0].name, "x");
    }

    #[test]
    fn suffixed_literals() {
        let e = parse_expr("0.9f32");
        let ExprKind::Number(n) = e.kind else {
            panic!("expected number");
        };
        assert_eq!(n.suffix, Some(crate::lexer::NumSuffix::F32));
    }

    #[test]
    fn parenthesized_grouping() {
        let e = parse_expr("(input[0] * 0.1f32) + (prev * 0.9f32)");
        assert!(matches!(e.kind, ExprKind::Binary(BinaryOp::Add, _, _)));
    }

    // ── Errors ──

    #[test]
    fn missing_semicolon_is_error() {
        let source = format!("{HEADER}stage main() {{ let x = 1 }}");
        let result = parse(&source);
        assert!(!result.errors.is_empty());
    }

    #[test]
    fn bad_type_in_shape_is_error() {
        let source = format!("{HEADER}stage main() {{ cell (a, b): f16(1); }}");
        let result = parse(&source);
        assert!(!result.errors.is_empty());
    }

    #[test]
    fn zero_width_shape_is_error() {
        let source = format!("{HEADER}stage main() {{ cell (a, b): f32(0); }}");
        let result = parse(&source);
        assert!(!result.errors.is_empty());
    }
}
