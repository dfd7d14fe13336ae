// pipeline.rs — Compilation state and pass orchestration
//
// Holds all pass artifacts and runs the minimal set of passes for a given
// terminal PassId. Each pass owns the shared state exclusively while it
// runs; the runner stops before the first pass whose input invariant was
// broken by error-level diagnostics.
//
// Preconditions: Program and Registry must be set before calling run_pipeline.
// Postconditions: all artifacts for required passes are populated, or
//   has_error is set.
// Failure modes: any pass emitting error-level diagnostics.
// Side effects: calls on_pass_complete callback after each pass for
//   immediate display.

use std::time::Instant;

use crate::ast::Program;
use crate::diag::{codes, DiagLevel, Diagnostic};
use crate::emit::IrDoc;
use crate::graph::Graph;
use crate::lexer::LexError;
use crate::parser::ParseResult;
use crate::pass::{descriptor, required_passes, PassId};
use crate::registry::Registry;
use crate::resolve::ResolvedProgram;

// ── Provenance ─────────────────────────────────────────────────────────────

/// Provenance metadata for hermetic builds and cache-key use.
///
/// `source_hash`: SHA-256 of the raw `.wave` source text.
/// `registry_fingerprint`: SHA-256 of `Registry::canonical_json()`.
/// `compiler_version`: crate version from `Cargo.toml`.
#[derive(Debug, Clone)]
pub struct Provenance {
    pub source_hash: [u8; 32],
    pub registry_fingerprint: [u8; 32],
    pub compiler_version: &'static str,
}

impl Provenance {
    /// Hex string of the source hash (64 characters).
    pub fn source_hash_hex(&self) -> String {
        bytes_to_hex(&self.source_hash)
    }

    /// Hex string of the registry fingerprint (64 characters).
    pub fn registry_fingerprint_hex(&self) -> String {
        bytes_to_hex(&self.registry_fingerprint)
    }
}

fn bytes_to_hex(bytes: &[u8; 32]) -> String {
    let mut s = String::with_capacity(64);
    for b in bytes {
        use std::fmt::Write;
        let _ = write!(s, "{:02x}", b);
    }
    s
}

/// Compute provenance from source text and registry.
///
/// Uses SHA-256 for both hashes. The registry fingerprint is computed from
/// `Registry::canonical_json()` (compact JSON, no whitespace) so that it is
/// stable independent of display formatting.
pub fn compute_provenance(source: &str, registry: &Registry) -> Provenance {
    use sha2::{Digest, Sha256};

    let source_hash = {
        let mut hasher = Sha256::new();
        hasher.update(source.as_bytes());
        let result = hasher.finalize();
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&result);
        hash
    };

    let registry_fingerprint = {
        let canonical = registry.canonical_json();
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        let result = hasher.finalize();
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&result);
        hash
    };

    Provenance {
        source_hash,
        registry_fingerprint,
        compiler_version: env!("CARGO_PKG_VERSION"),
    }
}

// ── Compilation state ──────────────────────────────────────────────────────

/// Holds all compilation artifacts and accumulated diagnostics.
pub struct CompilationState {
    pub program: Program,
    pub registry: Registry,
    pub resolved: Option<ResolvedProgram>,
    pub graph: Option<Graph>,
    pub ir: Option<IrDoc>,
    pub diagnostics: Vec<Diagnostic>,
    pub has_error: bool,
    pub provenance: Option<Provenance>,
}

impl CompilationState {
    pub fn new(program: Program, registry: Registry) -> Self {
        Self {
            program,
            registry,
            resolved: None,
            graph: None,
            ir: None,
            diagnostics: Vec::new(),
            has_error: false,
            provenance: None,
        }
    }
}

// ── Error type ─────────────────────────────────────────────────────────────

/// Pipeline execution stopped due to error-level diagnostics in a pass.
/// The specific diagnostics are available in `CompilationState.diagnostics`.
#[derive(Debug)]
pub struct PipelineError {
    /// The pass that produced the error.
    pub failing_pass: PassId,
}

// ── Parse-result conversion ────────────────────────────────────────────────

/// Convert lexer and parser errors into coded diagnostics.
pub fn parse_diagnostics(result: &ParseResult) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    for lex_error in &result.lex_errors {
        diagnostics.push(lex_diagnostic(lex_error));
    }
    for error in &result.errors {
        diagnostics.push(Diagnostic::error(
            codes::PARSE_SYNTAX,
            *error.span(),
            format!("{}", error.reason()),
        ));
    }
    diagnostics
}

fn lex_diagnostic(error: &LexError) -> Diagnostic {
    let code = if error.message.starts_with("unterminated") {
        codes::LEX_UNTERMINATED
    } else if error.message.starts_with("malformed numeric") {
        codes::LEX_BAD_LITERAL
    } else {
        codes::LEX_STRAY_CHAR
    };
    let span = (error.span.start..error.span.end).into();
    Diagnostic::error(code, span, error.message.clone())
}

// ── Helper: per-pass post-processing ───────────────────────────────────────

fn has_error_diags(diags: &[Diagnostic]) -> bool {
    diags.iter().any(|d| d.level == DiagLevel::Error)
}

/// Per-pass post-processing: callback, accumulate, verbose, error check.
/// Returns Err if error diagnostics were found.
fn finish_pass(
    state: &mut CompilationState,
    pass_id: PassId,
    diags: Vec<Diagnostic>,
    elapsed: std::time::Duration,
    verbose: bool,
    on_pass_complete: &mut impl FnMut(PassId, &[Diagnostic]),
) -> Result<(), PipelineError> {
    on_pass_complete(pass_id, &diags);
    let is_err = has_error_diags(&diags);
    state.diagnostics.extend(diags);
    if verbose {
        eprintln!(
            "wavec: {} complete, {:.1}ms",
            descriptor(pass_id).name,
            elapsed.as_secs_f64() * 1000.0
        );
    }
    if is_err {
        state.has_error = true;
        return Err(PipelineError {
            failing_pass: pass_id,
        });
    }
    Ok(())
}

// ── Pipeline runner ────────────────────────────────────────────────────────

/// Run the minimal set of passes to produce `terminal`.
///
/// Per-pass sequence: execute → on_pass_complete(callback) → verbose →
/// error check. A pass with error diagnostics stops the run; already
/// collected diagnostics stay in the state.
///
/// Preconditions: `state.program` and `state.registry` are set.
/// Postconditions: artifacts for all passes in `required_passes(terminal)`
///   are populated, or `state.has_error` is true.
pub fn run_pipeline(
    state: &mut CompilationState,
    terminal: PassId,
    verbose: bool,
    mut on_pass_complete: impl FnMut(PassId, &[Diagnostic]),
) -> Result<(), PipelineError> {
    let passes = required_passes(terminal);

    for &pass_id in &passes {
        match pass_id {
            PassId::Resolve => {
                let t = Instant::now();
                let result = crate::resolve::resolve(&state.program, &state.registry);
                let elapsed = t.elapsed();
                state.resolved = Some(result.resolved);
                finish_pass(
                    state,
                    pass_id,
                    result.diagnostics,
                    elapsed,
                    verbose,
                    &mut on_pass_complete,
                )?;
            }
            PassId::BuildGraph => {
                let t = Instant::now();
                let resolved = state.resolved.as_ref().expect("resolve ran");
                let result =
                    crate::graph::build_graph(&state.program, resolved, &state.registry);
                let elapsed = t.elapsed();
                state.graph = Some(result.graph);
                finish_pass(
                    state,
                    pass_id,
                    result.diagnostics,
                    elapsed,
                    verbose,
                    &mut on_pass_complete,
                )?;
            }
            PassId::Infer => {
                let t = Instant::now();
                let resolved = state.resolved.as_ref().expect("resolve ran");
                let graph = state.graph.as_mut().expect("build_graph ran");
                let result = crate::infer::infer(graph, resolved);
                let elapsed = t.elapsed();
                finish_pass(
                    state,
                    pass_id,
                    result.diagnostics,
                    elapsed,
                    verbose,
                    &mut on_pass_complete,
                )?;
            }
            PassId::Validate => {
                let t = Instant::now();
                let resolved = state.resolved.as_ref().expect("resolve ran");
                let graph = state.graph.as_ref().expect("build_graph ran");
                let result = crate::validate::validate(graph, resolved);
                let elapsed = t.elapsed();
                finish_pass(
                    state,
                    pass_id,
                    result.diagnostics,
                    elapsed,
                    verbose,
                    &mut on_pass_complete,
                )?;
            }
            PassId::Fold => {
                let t = Instant::now();
                let resolved = state.resolved.as_ref().expect("resolve ran");
                let graph = state.graph.as_mut().expect("build_graph ran");
                let result = crate::fold::fold(graph, resolved);
                let elapsed = t.elapsed();
                finish_pass(
                    state,
                    pass_id,
                    result.diagnostics,
                    elapsed,
                    verbose,
                    &mut on_pass_complete,
                )?;
            }
            PassId::Emit => {
                let t = Instant::now();
                let resolved = state.resolved.as_ref().expect("resolve ran");
                let graph = state.graph.as_ref().expect("build_graph ran");
                let source_hash = state.provenance.as_ref().map(|p| p.source_hash_hex());
                let ir = crate::emit::emit(
                    graph,
                    resolved,
                    &state.program.decl.name.name,
                    source_hash,
                );
                let elapsed = t.elapsed();
                state.ir = Some(ir);
                finish_pass(
                    state,
                    pass_id,
                    Vec::new(),
                    elapsed,
                    verbose,
                    &mut on_pass_complete,
                )?;
            }
        }
    }

    Ok(())
}

// ── One-call convenience ───────────────────────────────────────────────────

/// Parse and compile a source string through `terminal`.
///
/// Returns Err with coded diagnostics when the source does not parse.
/// Otherwise returns the compilation state — check `has_error` before
/// using artifacts past the failing pass.
pub fn compile_source(
    source: &str,
    terminal: PassId,
) -> Result<CompilationState, Vec<Diagnostic>> {
    let parsed = crate::parser::parse(source);
    let parse_diags = parse_diagnostics(&parsed);
    let Some(program) = parsed.program else {
        return Err(parse_diags);
    };
    if has_error_diags(&parse_diags) {
        return Err(parse_diags);
    }

    let registry = Registry::new();
    let provenance = compute_provenance(source, &registry);
    let mut state = CompilationState::new(program, registry);
    state.provenance = Some(provenance);
    let _ = run_pipeline(&mut state, terminal, false, |_, _| {});
    Ok(state)
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "program demo;\nexternal { sr: 48000, block_size: 64, \
                          inputs: [ { name: a, width: 1 }, { name: b, width: 1 } ], \
                          outputs: [ { name: o, width: 1 } ], properties: [] }\n";

    #[test]
    fn full_pipeline_produces_ir() {
        let state = compile_source(
            &format!("{HEADER}stage main() {{ a + b -> o; }}"),
            PassId::Emit,
        )
        .expect("parses");
        assert!(!state.has_error, "diagnostics: {:?}", state.diagnostics);
        let ir = state.ir.expect("IR emitted");
        assert_eq!(ir.program_name, "demo");
        assert!(ir.source_hash.is_some());
    }

    #[test]
    fn parse_failure_is_reported_with_code() {
        let result = compile_source("program ; nope", PassId::Emit);
        let diagnostics = result.err().expect("should not parse");
        assert!(diagnostics
            .iter()
            .any(|d| d.code == Some(codes::PARSE_SYNTAX)));
    }

    #[test]
    fn lex_failure_is_coded_by_class() {
        let result = compile_source(
            &format!("{HEADER}stage main() {{ a @ b -> o; }}"),
            PassId::Emit,
        );
        let diagnostics = result.err().expect("stray character should fail");
        assert!(diagnostics
            .iter()
            .any(|d| d.code == Some(codes::LEX_STRAY_CHAR)));
    }

    #[test]
    fn resolve_error_stops_before_build() {
        let state = compile_source(
            &format!("{HEADER}stage main() {{ mystery -> o; }}"),
            PassId::Emit,
        )
        .expect("parses");
        assert!(state.has_error);
        assert!(state.graph.is_none());
        assert!(state.ir.is_none());
    }

    #[test]
    fn validation_error_stops_before_fold() {
        let state = compile_source(
            &format!(
                "{HEADER}stage main() {{ buffer buf(a): f32(1); \
                 delwrite(buf, a); delread(buf, 1) -> o; }}"
            ),
            PassId::Emit,
        )
        .expect("parses");
        assert!(state.has_error);
        assert!(state.graph.is_some());
        assert!(state.ir.is_none());
        // The buffer capacity is never finalized.
        assert_eq!(state.graph.unwrap().buffers[0].capacity, None);
    }

    #[test]
    fn terminal_limits_work() {
        let state = compile_source(
            &format!("{HEADER}stage main() {{ a + b -> o; }}"),
            PassId::BuildGraph,
        )
        .expect("parses");
        assert!(!state.has_error);
        assert!(state.graph.is_some());
        assert!(state.ir.is_none());
    }

    #[test]
    fn provenance_is_stable_for_same_source() {
        let source = format!("{HEADER}stage main() {{ a + b -> o; }}");
        let registry = Registry::new();
        let p1 = compute_provenance(&source, &registry);
        let p2 = compute_provenance(&source, &registry);
        assert_eq!(p1.source_hash_hex(), p2.source_hash_hex());
        assert_eq!(p1.registry_fingerprint_hex(), p2.registry_fingerprint_hex());
        let other = compute_provenance("program x;", &registry);
        assert_ne!(p1.source_hash_hex(), other.source_hash_hex());
    }

    #[test]
    fn warnings_do_not_stop_the_pipeline() {
        let state = compile_source(
            &format!("{HEADER}stage main() {{ let unused = a + b; a -> o; }}"),
            PassId::Emit,
        )
        .expect("parses");
        assert!(!state.has_error, "diagnostics: {:?}", state.diagnostics);
        assert!(state.ir.is_some());
        assert!(state
            .diagnostics
            .iter()
            .any(|d| d.level == DiagLevel::Warning));
    }
}
