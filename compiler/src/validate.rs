// validate.rs — Structural validation of the inferred graph
//
// Runs after inference, before folding. Enforces: every required input pin
// is connected; the edge set minus recursion back-edges is acyclic;
// cross-stage edges originate from declared stage outputs; buffer
// capacities are constant-rate; cell delays are at least one sample;
// external and stage output pins carry their declared shapes.
//
// Preconditions: graph built and inferred (pin shapes and rates set).
// Postconditions: returns all violations as diagnostics; the graph is not
//   modified.
// Failure modes: none of its own — every finding is a diagnostic.
// Side effects: none.

use crate::diag::{codes, Diagnostic};
use crate::graph::{Graph, NodeKind, PinRef};
use crate::registry::{Rate, ScalarType, Shape};
use crate::resolve::ResolvedProgram;

/// Result of validation.
#[derive(Debug)]
pub struct ValidateResult {
    pub diagnostics: Vec<Diagnostic>,
}

/// Validate the inferred graph.
pub fn validate(graph: &Graph, resolved: &ResolvedProgram) -> ValidateResult {
    let mut v = Validator {
        graph,
        resolved,
        diagnostics: Vec::new(),
    };
    v.check_required_pins();
    v.check_outputs_written();
    v.check_cycles();
    v.check_cross_stage_edges();
    v.check_capacity_rates();
    v.check_cell_delays();
    v.check_declared_shapes();
    ValidateResult {
        diagnostics: v.diagnostics,
    }
}

struct Validator<'a> {
    graph: &'a Graph,
    resolved: &'a ResolvedProgram,
    diagnostics: Vec<Diagnostic>,
}

impl<'a> Validator<'a> {
    fn error(
        &mut self,
        code: crate::diag::DiagCode,
        span: Option<crate::ast::Span>,
        message: impl Into<String>,
    ) {
        let span = span.unwrap_or_else(|| (0..0).into());
        self.diagnostics.push(Diagnostic::error(code, span, message));
    }

    /// Every input pin of every live node must be fed. The only pins that
    /// may legally be open are none — optional inputs do not exist in this
    /// kind set; discard pins are created connected.
    fn check_required_pins(&mut self) {
        let mut reports = Vec::new();
        for node in self.graph.live_nodes() {
            for pin in 0..node.inputs.len() {
                let pin_ref = PinRef { node: node.id, pin };
                if self.graph.edges_into(pin_ref).next().is_none() {
                    let label = node
                        .inputs
                        .name_of(pin)
                        .map(|name| format!("'{name}'"))
                        .unwrap_or_else(|| format!("{pin}"));
                    reports.push((
                        node.span,
                        format!("required input pin {label} is not connected"),
                    ));
                }
            }
        }
        for (span, message) in reports {
            self.error(codes::STRUCT_MISSING_PIN, span, message);
        }
    }

    /// Every declared external output must be driven by some stage.
    fn check_outputs_written(&mut self) {
        for (index, decl) in self.resolved.external.outputs.iter().enumerate() {
            let written = self.graph.live_nodes().any(|node| {
                matches!(&node.kind, NodeKind::WriteOutput { index: i } if *i == index)
            });
            if !written {
                self.diagnostics.push(Diagnostic::error(
                    codes::STRUCT_MISSING_PIN,
                    decl.span,
                    format!("external output '{}' is never written", decl.name),
                ));
            }
        }
    }

    /// The directed edge set minus cell back-edges must be acyclic. Buffer
    /// write→read pairs carry no structural edge, so they need no
    /// exclusion here.
    fn check_cycles(&mut self) {
        if let Err(stuck) = self.graph.topo_order() {
            let mut diag = Diagnostic::error(
                codes::STRUCT_CYCLE,
                stuck
                    .first()
                    .and_then(|id| self.graph.node(*id).span)
                    .unwrap_or_else(|| (0..0).into()),
                "the graph contains a cycle that does not pass through a \
                 recursion cell or delay buffer",
            );
            for id in stuck.iter().skip(1).take(4) {
                if let Some(span) = self.graph.node(*id).span {
                    diag = diag.with_related(span, "also part of the cycle");
                }
            }
            self.diagnostics.push(diag);
        }
    }

    /// A cross-stage edge must originate from a declared stage output.
    fn check_cross_stage_edges(&mut self) {
        let mut reports = Vec::new();
        for edge in &self.graph.edges {
            let src = self.graph.node(edge.src.node);
            let dst = self.graph.node(edge.dst.node);
            if src.stage != dst.stage && !matches!(src.kind, NodeKind::StageOutput { .. }) {
                reports.push((
                    edge.span,
                    format!(
                        "edge crosses from stage '{}' to stage '{}' without a declared output",
                        self.graph.stages[src.stage.0 as usize].name,
                        self.graph.stages[dst.stage.0 as usize].name
                    ),
                ));
            }
        }
        for (span, message) in reports {
            self.error(codes::STRUCT_CROSS_STAGE, span, message);
        }
    }

    /// Buffer capacities must be constant-rate. The folder later insists
    /// on an actual literal; the rate check is what rejects signals.
    fn check_capacity_rates(&mut self) {
        let mut reports = Vec::new();
        for node in self.graph.live_nodes() {
            if let NodeKind::BufferCap { buffer } = &node.kind {
                let rate = node.inputs.pins[0].rate;
                if matches!(rate, Some(Rate::Block | Rate::Sample)) {
                    let name = &self.graph.buffers[buffer.0 as usize].name;
                    reports.push((
                        node.span,
                        format!(
                            "capacity of buffer '{name}' must be constant, \
                             but its value is {}-rate",
                            rate.expect("matched above")
                        ),
                    ));
                }
            }
        }
        for (span, message) in reports {
            self.error(codes::RATE_TOO_HIGH, span, message);
        }
    }

    fn check_cell_delays(&mut self) {
        let mut reports = Vec::new();
        for node in self.graph.live_nodes() {
            if let NodeKind::Cell { delay, .. } = &node.kind {
                if *delay < 1 {
                    reports.push((node.span, "cell delay must be at least 1".to_string()));
                }
            }
        }
        for (span, message) in reports {
            self.error(codes::STRUCT_BAD_CELL_DELAY, span, message);
        }
    }

    /// External output and stage output pins must carry exactly their
    /// declared shapes after inference.
    fn check_declared_shapes(&mut self) {
        let mut reports = Vec::new();
        for node in self.graph.live_nodes() {
            match &node.kind {
                NodeKind::WriteOutput { index } => {
                    let decl = &self.resolved.external.outputs[*index];
                    let expected = Shape::new(ScalarType::F32, decl.width);
                    let actual = node.inputs.pins[0].shape;
                    if actual != Some(expected) {
                        reports.push((
                            node.span,
                            format!(
                                "output '{}' is declared {expected} but receives {}",
                                decl.name,
                                describe(actual)
                            ),
                        ));
                    }
                }
                NodeKind::StageOutput { stage, index } => {
                    let info = &self.graph.stages[stage.0 as usize].outputs[*index];
                    let actual = node.inputs.pins[0].shape;
                    if actual != Some(info.shape) {
                        reports.push((
                            node.span,
                            format!(
                                "stage output '{}' is declared {} but receives {}",
                                info.name,
                                info.shape,
                                describe(actual)
                            ),
                        ));
                    }
                }
                _ => {}
            }
        }
        for (span, message) in reports {
            self.error(codes::STRUCT_OUTPUT_SHAPE, span, message);
        }
    }
}

fn describe(shape: Option<Shape>) -> String {
    match shape {
        Some(shape) => shape.to_string(),
        None => "an unresolved value".to_string(),
    }
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::build_graph;
    use crate::infer::infer;
    use crate::parser::parse;
    use crate::registry::Registry;
    use crate::resolve::resolve;

    const HEADER: &str = "program t;\nexternal { sr: 48000, block_size: 64, \
                          inputs: [ { name: a, width: 1 }, { name: b, width: 1 } ], \
                          outputs: [ { name: o, width: 1 } ], \
                          properties: [] }\n";

    /// Run the pipeline through validate; returns validator diagnostics
    /// only (earlier phases must be clean).
    fn validate_src(source: &str) -> Vec<Diagnostic> {
        let registry = Registry::new();
        let parsed = parse(source);
        assert!(parsed.errors.is_empty(), "parse failed: {:?}", parsed.errors);
        let program = parsed.program.unwrap();
        let resolved = resolve(&program, &registry);
        assert!(
            !crate::diag::has_errors(&resolved.diagnostics),
            "resolve failed: {:?}",
            resolved.diagnostics
        );
        let built = build_graph(&program, &resolved.resolved, &registry);
        assert!(
            !crate::diag::has_errors(&built.diagnostics),
            "build failed: {:?}",
            built.diagnostics
        );
        let mut graph = built.graph;
        let inferred = infer(&mut graph, &resolved.resolved);
        assert!(
            !crate::diag::has_errors(&inferred.diagnostics),
            "inference failed: {:?}",
            inferred.diagnostics
        );
        validate(&graph, &resolved.resolved).diagnostics
    }

    fn assert_clean(source: &str) {
        let diagnostics = validate_src(source);
        assert!(
            !crate::diag::has_errors(&diagnostics),
            "unexpected validation errors: {:?}",
            diagnostics
        );
    }

    fn assert_rejected(source: &str, code: crate::diag::DiagCode) {
        let diagnostics = validate_src(source);
        assert!(
            diagnostics.iter().any(|d| d.code == Some(code)),
            "expected {code}, got: {diagnostics:?}"
        );
    }

    #[test]
    fn clean_mix_program() {
        assert_clean(&format!("{HEADER}stage main() {{ a + b -> o; }}"));
    }

    #[test]
    fn clean_feedback_through_cell() {
        assert_clean(&format!(
            "{HEADER}stage main() {{ cell (prev, nxt): f32(1); \
             nxt <- (a * 0.1f32) + (prev * 0.9f32); prev -> o; }}"
        ));
    }

    #[test]
    fn clean_delay_line() {
        assert_clean(&format!(
            "{HEADER}stage main() {{ buffer buf(128): f32(1); \
             delwrite(buf, a); delread(buf, 64) -> o; }}"
        ));
    }

    #[test]
    fn missing_required_pin() {
        // biquad.lowpass with no q connected.
        assert_rejected(
            &format!(
                "{HEADER}stage main() {{ {{ a, frequency: 440.0f32 }} \
                 -> biquad.lowpass -> o; }}"
            ),
            codes::STRUCT_MISSING_PIN,
        );
    }

    #[test]
    fn missing_stage_output_assignment() {
        assert_rejected(
            &format!("{HEADER}stage main(extra = f32(1)) {{ a -> o; }}"),
            codes::STRUCT_MISSING_PIN,
        );
    }

    #[test]
    fn plain_cycle_rejected() {
        // x and y feed each other with no cell in between.
        assert_rejected(
            &format!(
                "{HEADER}stage main() {{ let x = f32; let y = f32(x); \
                 y -> x; a -> x; x -> o; }}"
            ),
            codes::STRUCT_CYCLE,
        );
    }

    #[test]
    fn sample_rate_capacity_rejected() {
        // Buffer capacity driven by an input signal is a rate violation.
        assert_rejected(
            &format!(
                "{HEADER}stage main() {{ buffer buf(a): f32(1); \
                 delwrite(buf, a); delread(buf, 1) -> o; }}"
            ),
            codes::RATE_TOO_HIGH,
        );
    }

    #[test]
    fn converted_signal_capacity_still_rejected() {
        assert_rejected(
            &format!(
                "{HEADER}stage main() {{ buffer buf(i64(a)): f32(1); \
                 delwrite(buf, a); delread(buf, 1) -> o; }}"
            ),
            codes::RATE_TOO_HIGH,
        );
    }

    #[test]
    fn constant_capacity_expression_ok() {
        assert_clean(&format!(
            "{HEADER}stage main() {{ buffer buf(2 * 64): f32(1); \
             delwrite(buf, a); delread(buf, 1) -> o; }}"
        ));
    }

    #[test]
    fn unwritten_external_output_rejected() {
        assert_rejected(
            &format!("{HEADER}stage main() {{ sin(a); }}"),
            codes::STRUCT_MISSING_PIN,
        );
    }
}
