// resolve.rs — Name and scope resolution for Waveling AST
//
// Materializes the three scope tiers (built-ins, program scope, per-stage
// lexical scopes), checks duplicate-declaration and shadowing rules, and
// binds every referenced path head to its declaration. Program-scope names
// (external ports, properties, stage names, buffers) resolve independently
// of declaration order; stage-local names are lexical — a reference sees
// only declarations above it.
//
// Preconditions: `program` is a well-formed AST from the parser.
// Postconditions: returns resolution tables plus all accumulated
//   diagnostics. Resolution continues past errors.
// Failure modes: unknown names, duplicate declarations, bad paths, and
//   double output assignment produce `Diagnostic` entries.
// Side effects: none.

use std::collections::{HashMap, HashSet};

use crate::ast::*;
use crate::diag::{codes, Diagnostic};
use crate::external::{self, ExternalDecl};
use crate::registry::{Builtin, Registry, ScalarType, Shape};

// ── Public types ────────────────────────────────────────────────────────────

/// Result of name resolution.
#[derive(Debug)]
pub struct ResolveResult {
    pub resolved: ResolvedProgram,
    pub diagnostics: Vec<Diagnostic>,
}

/// What a path head resolved to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NameTarget {
    /// A stage-local `let` binding. The builder resolves the value through
    /// its own environment, which mirrors the lexical walk.
    LetVar,
    /// The readable half of a recursion cell (index into the stage's cells).
    CellStart(usize),
    /// The writable half of a recursion cell.
    CellEnd(usize),
    /// A stage output declared in the current stage's header.
    StageOutput(usize),
    /// An external input port.
    Input(usize),
    /// An external output port.
    Output(usize),
    /// A declared property.
    Property(usize),
    /// Another stage, referenced by name (`stage.outputs.x`).
    StageRef(usize),
    /// A declared circular buffer.
    BufferRef(usize),
    /// A tier-1 built-in. `consumed` is how many path segments the lookup
    /// used (2 for module paths like `biquad.lowpass`, 1 otherwise).
    Builtin { builtin: Builtin, consumed: usize },
}

/// One declared stage.
#[derive(Debug, Clone)]
pub struct StageEntry {
    pub name: String,
    pub name_span: Span,
    /// Declared outputs in header order: (name, shape, span).
    pub outputs: Vec<(String, Shape, Span)>,
}

/// One declared circular buffer. The capacity expression stays in the AST;
/// the graph builder lowers it.
#[derive(Debug, Clone)]
pub struct BufferEntry {
    pub name: String,
    pub name_span: Span,
    pub shape: Shape,
    /// Stage index and statement index of the declaration.
    pub decl_stage: usize,
    pub decl_stmt: usize,
}

/// One recursion cell declared in a stage.
#[derive(Debug, Clone)]
pub struct CellEntry {
    pub start: String,
    pub end: String,
    pub delay: Option<(i128, Span)>,
    pub shape: Shape,
    pub decl_span: Span,
}

/// Per-stage scope contents.
#[derive(Debug, Clone, Default)]
pub struct StageScope {
    pub cells: Vec<CellEntry>,
}

/// Resolution tables produced by name resolution.
/// Downstream phases use these alongside the original AST.
#[derive(Debug)]
pub struct ResolvedProgram {
    pub external: ExternalDecl,
    pub stages: Vec<StageEntry>,
    pub stage_ids: HashMap<String, usize>,
    pub buffers: Vec<BufferEntry>,
    pub buffer_ids: HashMap<String, usize>,
    pub scopes: Vec<StageScope>,
    /// Path-head resolution, keyed by the head identifier's span.
    pub targets: HashMap<Span, NameTarget>,
}

impl ResolvedProgram {
    /// Look up the resolution recorded for a path head span.
    pub fn target_for(&self, span: Span) -> Option<NameTarget> {
        self.targets.get(&span).copied()
    }
}

// ── Public entry point ──────────────────────────────────────────────────────

/// Resolve all names in a parsed Waveling program.
///
/// Normalizes the external block first, then collects program-scope
/// declarations, then walks stage bodies lexically.
pub fn resolve(program: &Program, registry: &Registry) -> ResolveResult {
    let external_result = external::normalize(&program.external);

    let mut ctx = ResolveCtx {
        registry,
        program,
        resolved: ResolvedProgram {
            external: external_result.external,
            stages: Vec::new(),
            stage_ids: HashMap::new(),
            buffers: Vec::new(),
            buffer_ids: HashMap::new(),
            scopes: Vec::new(),
            targets: HashMap::new(),
        },
        diagnostics: external_result.diagnostics,
        program_names: HashMap::new(),
    };

    // Pass 1: program scope — externals, stage names, buffers.
    ctx.collect_program_scope();

    // Pass 2: per-stage lexical walk.
    ctx.resolve_stages();

    ResolveResult {
        diagnostics: ctx.diagnostics,
        resolved: ctx.resolved,
    }
}

// ── Internal context ────────────────────────────────────────────────────────

struct ResolveCtx<'a> {
    registry: &'a Registry,
    program: &'a Program,
    resolved: ResolvedProgram,
    diagnostics: Vec<Diagnostic>,
    /// Program-scope name → declaration span, for duplicate detection.
    program_names: HashMap<String, Span>,
}

/// Stage-local symbol, tracked during the lexical walk.
#[derive(Debug, Clone, Copy)]
enum LocalSymbol {
    Let { span: Span },
    CellStart { cell: usize, span: Span },
    CellEnd { cell: usize, span: Span },
    StageOutput { index: usize, span: Span },
}

impl LocalSymbol {
    fn span(&self) -> Span {
        match self {
            LocalSymbol::Let { span }
            | LocalSymbol::CellStart { span, .. }
            | LocalSymbol::CellEnd { span, .. }
            | LocalSymbol::StageOutput { span, .. } => *span,
        }
    }
}

impl<'a> ResolveCtx<'a> {
    fn error(&mut self, code: crate::diag::DiagCode, span: Span, message: impl Into<String>) {
        self.diagnostics.push(Diagnostic::error(code, span, message));
    }

    /// Register a program-scope name, reporting a duplicate if taken.
    fn declare_program_name(&mut self, name: &str, span: Span) {
        if let Some(first) = self.program_names.get(name) {
            let first = *first;
            self.diagnostics.push(
                Diagnostic::error(
                    codes::NAME_REDECLARED,
                    span,
                    format!("'{name}' is already declared in program scope"),
                )
                .with_related(first, "first declared here"),
            );
        } else {
            self.program_names.insert(name.to_string(), span);
        }
    }

    // ── Pass 1: program scope ──

    fn collect_program_scope(&mut self) {
        // External names first — they are declarations too.
        let inputs: Vec<(String, Span)> = self
            .resolved
            .external
            .inputs
            .iter()
            .map(|p| (p.name.clone(), p.span))
            .collect();
        let outputs: Vec<(String, Span)> = self
            .resolved
            .external
            .outputs
            .iter()
            .map(|p| (p.name.clone(), p.span))
            .collect();
        let properties: Vec<(String, Span)> = self
            .resolved
            .external
            .properties
            .iter()
            .map(|p| (p.name.clone(), p.span))
            .collect();
        for (name, span) in inputs.iter().chain(&outputs).chain(&properties) {
            self.declare_program_name(name, *span);
        }

        // Stage names.
        for stage in &self.program.stages {
            self.declare_program_name(&stage.name.name, stage.name.span);
            let mut outputs = Vec::new();
            let mut seen = HashSet::new();
            for decl in &stage.outputs {
                if !seen.insert(decl.name.name.clone()) {
                    self.diagnostics.push(Diagnostic::error(
                        codes::NAME_REDECLARED,
                        decl.name.span,
                        format!(
                            "stage output '{}' is declared more than once",
                            decl.name.name
                        ),
                    ));
                    continue;
                }
                outputs.push((
                    decl.name.name.clone(),
                    Shape::new(ScalarType::from(decl.shape.ty.kind), decl.shape.width as u32),
                    decl.span,
                ));
            }
            let index = self.resolved.stages.len();
            self.resolved
                .stage_ids
                .insert(stage.name.name.clone(), index);
            self.resolved.stages.push(StageEntry {
                name: stage.name.name.clone(),
                name_span: stage.name.span,
                outputs,
            });
        }

        // Buffers: syntactically stage-body statements, visible program-wide.
        for (stage_index, stage) in self.program.stages.iter().enumerate() {
            for (stmt_index, stmt) in stage.body.iter().enumerate() {
                if let StmtKind::Buffer(buffer) = &stmt.kind {
                    self.declare_program_name(&buffer.name.name, buffer.name.span);
                    let index = self.resolved.buffers.len();
                    self.resolved
                        .buffer_ids
                        .entry(buffer.name.name.clone())
                        .or_insert(index);
                    self.resolved.buffers.push(BufferEntry {
                        name: buffer.name.name.clone(),
                        name_span: buffer.name.span,
                        shape: Shape::new(
                            ScalarType::from(buffer.shape.ty.kind),
                            buffer.shape.width as u32,
                        ),
                        decl_stage: stage_index,
                        decl_stmt: stmt_index,
                    });
                }
            }
        }
    }

    /// Resolve a name against program scope only.
    fn lookup_program(&self, name: &str) -> Option<NameTarget> {
        if let Some(i) = self
            .resolved
            .external
            .inputs
            .iter()
            .position(|p| p.name == name)
        {
            return Some(NameTarget::Input(i));
        }
        if let Some(i) = self
            .resolved
            .external
            .outputs
            .iter()
            .position(|p| p.name == name)
        {
            return Some(NameTarget::Output(i));
        }
        if let Some(i) = self
            .resolved
            .external
            .properties
            .iter()
            .position(|p| p.name == name)
        {
            return Some(NameTarget::Property(i));
        }
        if let Some(&i) = self.resolved.stage_ids.get(name) {
            return Some(NameTarget::StageRef(i));
        }
        if let Some(&i) = self.resolved.buffer_ids.get(name) {
            return Some(NameTarget::BufferRef(i));
        }
        None
    }

    // ── Pass 2: stage bodies ──

    fn resolve_stages(&mut self) {
        for stage_index in 0..self.program.stages.len() {
            self.resolve_stage(stage_index);
        }
    }

    fn resolve_stage(&mut self, stage_index: usize) {
        let program = self.program;
        let stage = &program.stages[stage_index];
        let mut walker = StageWalker {
            stage_index,
            locals: HashMap::new(),
            scope: StageScope::default(),
            assigned_outputs: HashMap::new(),
            assigned_cells: HashMap::new(),
            used_lets: HashSet::new(),
            let_decls: Vec::new(),
        };

        // Header-declared outputs are in scope for the whole body.
        for (index, decl) in stage.outputs.iter().enumerate() {
            walker.locals.insert(
                decl.name.name.clone(),
                LocalSymbol::StageOutput {
                    index,
                    span: decl.name.span,
                },
            );
        }

        for stmt in &stage.body {
            self.resolve_stmt(&mut walker, stmt);
        }

        // Unused let warning.
        for (name, span) in &walker.let_decls {
            if !walker.used_lets.contains(name) {
                self.diagnostics.push(Diagnostic::warning(
                    codes::WARN_UNUSED_LET,
                    *span,
                    format!("'{name}' is never used"),
                ));
            }
        }

        self.resolved.scopes.push(walker.scope);
    }

    fn resolve_stmt(&mut self, walker: &mut StageWalker, stmt: &Stmt) {
        match &stmt.kind {
            StmtKind::Let(let_stmt) => {
                self.resolve_expr(walker, &let_stmt.value);
                self.declare_local(
                    walker,
                    &let_stmt.name,
                    LocalSymbol::Let {
                        span: let_stmt.name.span,
                    },
                );
                walker
                    .let_decls
                    .push((let_stmt.name.name.clone(), let_stmt.name.span));
            }
            StmtKind::Assign(assign) => {
                self.resolve_expr(walker, &assign.value);
                // `name = expr;` feeds a sink declared in this stage: a
                // header output or a cell's end.
                match walker.locals.get(&assign.name.name) {
                    Some(LocalSymbol::StageOutput { index, .. }) => {
                        let index = *index;
                        self.resolved
                            .targets
                            .insert(assign.name.span, NameTarget::StageOutput(index));
                        let first = walker.assigned_outputs.insert(index, assign.name.span);
                        self.report_double_assign(&assign.name, first, "stage output");
                    }
                    Some(LocalSymbol::CellEnd { cell, .. }) => {
                        let cell = *cell;
                        self.resolved
                            .targets
                            .insert(assign.name.span, NameTarget::CellEnd(cell));
                        let first = walker.assigned_cells.insert(cell, assign.name.span);
                        self.report_double_assign(&assign.name, first, "cell input");
                    }
                    _ => self.error(
                        codes::NAME_UNDECLARED,
                        assign.name.span,
                        format!(
                            "'{}' is not a stage output or cell input declared by this stage",
                            assign.name.name
                        ),
                    ),
                }
            }
            StmtKind::Cell(cell) => {
                let cell_index = walker.scope.cells.len();
                walker.scope.cells.push(CellEntry {
                    start: cell.start.name.clone(),
                    end: cell.end.name.clone(),
                    delay: cell.delay,
                    shape: Shape::new(
                        ScalarType::from(cell.shape.ty.kind),
                        cell.shape.width as u32,
                    ),
                    decl_span: stmt.span,
                });
                self.declare_local(
                    walker,
                    &cell.start,
                    LocalSymbol::CellStart {
                        cell: cell_index,
                        span: cell.start.span,
                    },
                );
                self.declare_local(
                    walker,
                    &cell.end,
                    LocalSymbol::CellEnd {
                        cell: cell_index,
                        span: cell.end.span,
                    },
                );
            }
            StmtKind::Buffer(buffer) => {
                // The buffer name was collected in pass 1; only the
                // capacity expression needs resolving here.
                self.resolve_expr(walker, &buffer.capacity);
            }
            StmtKind::Expr(expr) => self.resolve_expr(walker, expr),
        }
    }

    fn report_double_assign(&mut self, name: &Ident, first: Option<Span>, what: &str) {
        if let Some(first) = first {
            self.diagnostics.push(
                Diagnostic::error(
                    codes::STRUCT_DOUBLE_ASSIGN,
                    name.span,
                    format!("{what} '{}' is assigned more than once", name.name),
                )
                .with_related(first, "first assigned here"),
            );
        }
    }

    fn declare_local(&mut self, walker: &mut StageWalker, name: &Ident, symbol: LocalSymbol) {
        if let Some(first) = walker.locals.get(&name.name) {
            let first_span = first.span();
            self.diagnostics.push(
                Diagnostic::error(
                    codes::NAME_REDECLARED,
                    name.span,
                    format!("'{}' is already declared in this stage", name.name),
                )
                .with_related(first_span, "first declared here"),
            );
            return;
        }
        walker.locals.insert(name.name.clone(), symbol);
    }

    fn resolve_expr(&mut self, walker: &mut StageWalker, expr: &Expr) {
        match &expr.kind {
            ExprKind::Number(_) | ExprKind::Bool(_) => {}
            ExprKind::Path(path) => self.resolve_path(walker, path),
            ExprKind::Call(call) => {
                self.resolve_path(walker, &call.callee);
                for arg in &call.args {
                    self.resolve_expr(walker, arg);
                }
            }
            ExprKind::Bundle(entries, _) => {
                for entry in entries {
                    match entry {
                        BundleEntry::Positional(e) | BundleEntry::Named(_, e) => {
                            self.resolve_expr(walker, e)
                        }
                    }
                }
            }
            ExprKind::Unary(_, operand) => self.resolve_expr(walker, operand),
            ExprKind::Binary(_, lhs, rhs) => {
                self.resolve_expr(walker, lhs);
                self.resolve_expr(walker, rhs);
            }
            ExprKind::Stack(lhs, rhs) => {
                self.resolve_expr(walker, lhs);
                self.resolve_expr(walker, rhs);
            }
            ExprKind::Route(src, dst) => {
                self.resolve_expr(walker, src);
                self.resolve_expr(walker, dst);
            }
            ExprKind::Index(base, _, _) => self.resolve_expr(walker, base),
        }
    }

    /// Resolve a path head inner-to-outer: stage locals, program scope,
    /// built-ins. Records the target keyed by the head span.
    fn resolve_path(&mut self, walker: &mut StageWalker, path: &Path) {
        let head = path.head();

        // Tier 3: stage locals.
        if let Some(symbol) = walker.locals.get(&head.name) {
            let target = match symbol {
                LocalSymbol::Let { .. } => {
                    walker.used_lets.insert(head.name.clone());
                    NameTarget::LetVar
                }
                LocalSymbol::CellStart { cell, .. } => NameTarget::CellStart(*cell),
                LocalSymbol::CellEnd { cell, .. } => NameTarget::CellEnd(*cell),
                LocalSymbol::StageOutput { index, .. } => NameTarget::StageOutput(*index),
            };
            self.resolved.targets.insert(head.span, target);
            return;
        }

        // Tier 2: program scope.
        if let Some(target) = self.lookup_program(&head.name) {
            self.resolved.targets.insert(head.span, target);
            return;
        }

        // Tier 1: built-ins. Module paths consume two segments.
        if path.segments.len() >= 2 {
            let segments: Vec<&str> = path
                .segments
                .iter()
                .take(2)
                .map(|s| s.name.as_str())
                .collect();
            if let Some(builtin) = self.registry.lookup_path(&segments) {
                self.resolved.targets.insert(
                    head.span,
                    NameTarget::Builtin {
                        builtin,
                        consumed: 2,
                    },
                );
                return;
            }
        }
        if let Some(builtin) = self.registry.lookup_name(&head.name) {
            self.resolved.targets.insert(
                head.span,
                NameTarget::Builtin {
                    builtin,
                    consumed: 1,
                },
            );
            return;
        }

        if self.registry.is_module(&head.name) {
            let shown = path
                .segments
                .iter()
                .map(|s| s.name.as_str())
                .collect::<Vec<_>>()
                .join(".");
            self.error(
                codes::NAME_BAD_PATH,
                head.span,
                format!("'{shown}' does not name a built-in"),
            );
            return;
        }

        self.error(
            codes::NAME_UNDECLARED,
            head.span,
            format!("'{}' is not declared", head.name),
        );
    }
}

struct StageWalker {
    #[allow(dead_code)]
    stage_index: usize,
    locals: HashMap<String, LocalSymbol>,
    scope: StageScope,
    /// Stage-output index → span of its `=` assignment.
    assigned_outputs: HashMap<usize, Span>,
    /// Cell index → span of its end's `=` assignment.
    assigned_cells: HashMap<usize, Span>,
    used_lets: HashSet<String>,
    let_decls: Vec<(String, Span)>,
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diag::DiagLevel;
    use crate::parser::parse;

    fn resolve_src(source: &str) -> ResolveResult {
        let result = parse(source);
        assert!(
            result.errors.is_empty() && result.lex_errors.is_empty(),
            "parse failed: {:?}",
            result.errors
        );
        resolve(&result.program.unwrap(), &Registry::new())
    }

    fn errors(result: &ResolveResult) -> Vec<String> {
        result
            .diagnostics
            .iter()
            .filter(|d| d.level == DiagLevel::Error)
            .map(|d| d.message.clone())
            .collect()
    }

    const HEADER: &str = "program t;\nexternal { sr: 48000, block_size: 64, \
                          inputs: [ { name: a, width: 1 }, { name: b, width: 1 } ], \
                          outputs: [ { name: o, width: 1 } ], \
                          properties: [ { name: gain, type: f32 } ] }\n";

    #[test]
    fn resolves_external_names() {
        let result = resolve_src(&format!("{HEADER}stage main() {{ a + b -> o; }}"));
        assert!(errors(&result).is_empty(), "{:?}", errors(&result));
        let targets: Vec<_> = result.resolved.targets.values().collect();
        assert!(targets.contains(&&NameTarget::Input(0)));
        assert!(targets.contains(&&NameTarget::Input(1)));
        assert!(targets.contains(&&NameTarget::Output(0)));
    }

    #[test]
    fn resolves_property() {
        let result = resolve_src(&format!("{HEADER}stage main() {{ a * gain -> o; }}"));
        assert!(errors(&result).is_empty());
        assert!(result
            .resolved
            .targets
            .values()
            .any(|t| matches!(t, NameTarget::Property(0))));
    }

    #[test]
    fn resolves_builtin() {
        let result = resolve_src(&format!("{HEADER}stage main() {{ sin(a) -> o; }}"));
        assert!(errors(&result).is_empty());
        assert!(result
            .resolved
            .targets
            .values()
            .any(|t| matches!(t, NameTarget::Builtin { consumed: 1, .. })));
    }

    #[test]
    fn resolves_module_builtin() {
        let result = resolve_src(&format!(
            "{HEADER}stage main() {{ biquad.lowpass(a, 440.0f32, 0.7f32) -> o; }}"
        ));
        assert!(errors(&result).is_empty(), "{:?}", errors(&result));
        assert!(result
            .resolved
            .targets
            .values()
            .any(|t| matches!(t, NameTarget::Builtin { consumed: 2, .. })));
    }

    #[test]
    fn bad_module_member() {
        let result = resolve_src(&format!("{HEADER}stage main() {{ biquad.notch(a) -> o; }}"));
        assert!(errors(&result)
            .iter()
            .any(|m| m.contains("does not name a built-in")));
    }

    #[test]
    fn undeclared_name() {
        let result = resolve_src(&format!("{HEADER}stage main() {{ zz -> o; }}"));
        assert!(errors(&result).iter().any(|m| m.contains("not declared")));
    }

    #[test]
    fn let_is_lexical() {
        // `x` used before its declaration does not resolve.
        let result = resolve_src(&format!(
            "{HEADER}stage main() {{ x -> o; let x = a + b; }}"
        ));
        assert!(errors(&result).iter().any(|m| m.contains("not declared")));
    }

    #[test]
    fn let_shadows_external() {
        let result = resolve_src(&format!(
            "{HEADER}stage main() {{ let a = b * b; a -> o; }}"
        ));
        assert!(errors(&result).is_empty());
        // Both later references to `a` must resolve to the local.
        let let_targets = result
            .resolved
            .targets
            .values()
            .filter(|t| matches!(t, NameTarget::LetVar))
            .count();
        assert_eq!(let_targets, 1);
    }

    #[test]
    fn redeclared_let() {
        let result = resolve_src(&format!(
            "{HEADER}stage main() {{ let x = a; let x = b; x -> o; }}"
        ));
        assert!(errors(&result)
            .iter()
            .any(|m| m.contains("already declared in this stage")));
    }

    #[test]
    fn cell_binds_both_names() {
        let result = resolve_src(&format!(
            "{HEADER}stage main() {{ cell (prev, nxt): f32(1); \
             nxt <- a; prev -> o; }}"
        ));
        assert!(errors(&result).is_empty(), "{:?}", errors(&result));
        let targets: Vec<_> = result.resolved.targets.values().collect();
        assert!(targets.contains(&&NameTarget::CellStart(0)));
        assert!(targets.contains(&&NameTarget::CellEnd(0)));
        assert_eq!(result.resolved.scopes[0].cells.len(), 1);
    }

    #[test]
    fn buffer_visible_across_stages() {
        let result = resolve_src(&format!(
            "{HEADER}stage one() {{ buffer echo(64): f32(1); delwrite(echo, a); }} \
             stage two() {{ delread(echo, 16) -> o; }}"
        ));
        assert!(errors(&result).is_empty(), "{:?}", errors(&result));
        assert_eq!(result.resolved.buffers.len(), 1);
        assert!(result
            .resolved
            .targets
            .values()
            .any(|t| matches!(t, NameTarget::BufferRef(0))));
    }

    #[test]
    fn stage_names_resolve_out_of_order() {
        let result = resolve_src(&format!(
            "{HEADER}stage first() {{ later.outputs.wet -> o; }} \
             stage later(wet = f32(1)) {{ wet = a; }}"
        ));
        assert!(errors(&result).is_empty(), "{:?}", errors(&result));
        assert!(result
            .resolved
            .targets
            .values()
            .any(|t| matches!(t, NameTarget::StageRef(1))));
    }

    #[test]
    fn assign_to_stage_output() {
        let result = resolve_src(&format!(
            "{HEADER}stage s(mix = f32(1)) {{ mix = a + b; }}"
        ));
        assert!(errors(&result).is_empty(), "{:?}", errors(&result));
    }

    #[test]
    fn double_assign_rejected() {
        let result = resolve_src(&format!(
            "{HEADER}stage s(mix = f32(1)) {{ mix = a; mix = b; }}"
        ));
        assert!(errors(&result)
            .iter()
            .any(|m| m.contains("assigned more than once")));
    }

    #[test]
    fn assign_to_non_output_rejected() {
        let result = resolve_src(&format!("{HEADER}stage s() {{ q = a; }}"));
        assert!(errors(&result)
            .iter()
            .any(|m| m.contains("not a stage output or cell input")));
    }

    #[test]
    fn assign_to_cell_end() {
        let result = resolve_src(&format!(
            "{HEADER}stage s() {{ cell (prev, nxt): f32(1); nxt = a; prev -> o; }}"
        ));
        assert!(errors(&result).is_empty(), "{:?}", errors(&result));
        assert!(result
            .resolved
            .targets
            .values()
            .any(|t| matches!(t, NameTarget::CellEnd(0))));
    }

    #[test]
    fn double_cell_assign_rejected() {
        let result = resolve_src(&format!(
            "{HEADER}stage s() {{ cell (prev, nxt): f32(1); nxt = a; nxt = b; prev -> o; }}"
        ));
        assert!(errors(&result)
            .iter()
            .any(|m| m.contains("assigned more than once")));
    }

    #[test]
    fn duplicate_stage_name() {
        let result = resolve_src(&format!("{HEADER}stage s() {{ }} stage s() {{ }}"));
        assert!(errors(&result)
            .iter()
            .any(|m| m.contains("already declared in program scope")));
    }

    #[test]
    fn stage_name_colliding_with_external() {
        let result = resolve_src(&format!("{HEADER}stage a() {{ }}"));
        assert!(errors(&result)
            .iter()
            .any(|m| m.contains("already declared in program scope")));
    }

    #[test]
    fn program_name_shadows_builtin() {
        // An external input named `sin` shadows the built-in.
        let source = "program t;\nexternal { sr: 1, block_size: 1, \
                      inputs: [ { name: sin, width: 1 } ], \
                      outputs: [ { name: o, width: 1 } ], properties: [] }\n\
                      stage main() { sin -> o; }";
        let result = resolve_src(source);
        assert!(errors(&result).is_empty());
        assert!(result
            .resolved
            .targets
            .values()
            .any(|t| matches!(t, NameTarget::Input(0))));
        assert!(!result
            .resolved
            .targets
            .values()
            .any(|t| matches!(t, NameTarget::Builtin { .. })));
    }

    #[test]
    fn unused_let_warns() {
        let result = resolve_src(&format!(
            "{HEADER}stage main() {{ let unused = a; b -> o; }}"
        ));
        assert!(errors(&result).is_empty());
        assert!(result
            .diagnostics
            .iter()
            .any(|d| d.level == DiagLevel::Warning && d.message.contains("never used")));
    }
}
