// Language conformance tests for wavec.
//
// Each test exercises one documented behavior of the language at the
// library boundary (`pipeline::compile_source`):
// - positive cases must compile through emission and produce the expected
//   IR structure
// - negative cases must be rejected with the expected diagnostic class
//
// These are end-to-end: lexing through folding and emission in one call.

use wavec::diag::{codes, DiagCode, DiagLevel};
use wavec::pass::PassId;
use wavec::pipeline::{compile_source, CompilationState};

// ── Helpers ─────────────────────────────────────────────────────────────────

fn compile_ok(source: &str) -> CompilationState {
    let state = compile_source(source, PassId::Emit).expect("source should parse");
    assert!(
        !state.has_error,
        "expected success, got: {:#?}",
        state.diagnostics
    );
    state
}

fn compile_err(source: &str) -> Vec<Option<DiagCode>> {
    match compile_source(source, PassId::Emit) {
        Err(diags) => diags.into_iter().map(|d| d.code).collect(),
        Ok(state) => {
            assert!(
                state.has_error,
                "expected rejection, but compilation succeeded"
            );
            state
                .diagnostics
                .into_iter()
                .filter(|d| d.level == DiagLevel::Error)
                .map(|d| d.code)
                .collect()
        }
    }
}

fn assert_rejected(source: &str, code: DiagCode) {
    let codes = compile_err(source);
    assert!(
        codes.contains(&Some(code)),
        "expected {code}, got {codes:?}"
    );
}

fn nodes_of_kind<'a>(state: &'a CompilationState, kind: &str) -> Vec<&'a wavec::emit::IrNode> {
    state
        .ir
        .as_ref()
        .expect("IR emitted")
        .nodes
        .iter()
        .filter(|n| n.kind == kind)
        .collect()
}

const MONO: &str = "program conformance;\n\
                    external { sr: 48000, block_size: 128, \
                    inputs: [ { name: a, width: 1 }, { name: b, width: 1 } ], \
                    outputs: [ { name: o, width: 1 } ], properties: [] }\n";

const STEREO: &str = "program conformance;\n\
                      external { sr: 48000, block_size: 128, \
                      inputs: [ { name: m, width: 1 } ], \
                      outputs: [ { name: s, width: 2 } ], properties: [] }\n";

// ── Pointwise mix ───────────────────────────────────────────────────────────

#[test]
fn pointwise_mix() {
    let state = compile_ok(&format!("{MONO}stage main() {{ a + b -> o; }}"));
    let adds = nodes_of_kind(&state, "bin");
    assert_eq!(adds.len(), 1);
    assert_eq!(adds[0].attrs["op"], "add");
    assert_eq!(nodes_of_kind(&state, "read_input").len(), 2);
    assert_eq!(nodes_of_kind(&state, "write_output").len(), 1);
    // All f32, all sample-rate.
    for node in &state.ir.as_ref().unwrap().nodes {
        for pin in node.inputs.iter().chain(&node.outputs) {
            assert_eq!(pin.scalar, wavec::registry::ScalarType::F32);
            assert_eq!(pin.rate, wavec::registry::Rate::Sample);
        }
    }
}

// ── Stereo broadcast ────────────────────────────────────────────────────────

#[test]
fn stereo_broadcast() {
    let state = compile_ok(&format!("{STEREO}stage main() {{ broadcast(m) -> s; }}"));
    let broadcasts = nodes_of_kind(&state, "broadcast");
    assert_eq!(broadcasts.len(), 1);
    assert_eq!(broadcasts[0].inputs[0].width, 1);
    assert_eq!(broadcasts[0].outputs[0].width, 2);
}

// ── One-pole feedback ───────────────────────────────────────────────────────

#[test]
fn one_pole_feedback() {
    let state = compile_ok(&format!(
        "{MONO}stage main() {{ cell (prev, nxt): f32(1); \
         nxt <- (input[0] * 0.1f32) + (prev * 0.9f32); prev -> output[0]; }}"
    ));
    let cells = nodes_of_kind(&state, "cell");
    assert_eq!(cells.len(), 1);
    assert_eq!(cells[0].attrs["delay"], serde_json::json!(1));

    // Exactly one edge lands on the cell — the single back-edge.
    let ir = state.ir.as_ref().unwrap();
    let cell_id = cells[0].id;
    let back_edges = ir.edges.iter().filter(|e| e.dst.node == cell_id).count();
    assert_eq!(back_edges, 1);
}

// ── Delay line ──────────────────────────────────────────────────────────────

#[test]
fn delay_line() {
    let state = compile_ok(&format!(
        "{MONO}stage main() {{ buffer buf(128): f32(1); \
         delwrite(buf, input[0]); delread(buf, 64) -> output[0]; }}"
    ));
    let ir = state.ir.as_ref().unwrap();
    assert_eq!(ir.buffers.len(), 1);
    assert_eq!(ir.buffers[0].capacity, 128);
    assert_eq!(nodes_of_kind(&state, "delay_write").len(), 1);
    assert_eq!(nodes_of_kind(&state, "delay_read").len(), 1);
    // Reads are sample-rate regardless of the delay operand's rate.
    let read = &nodes_of_kind(&state, "delay_read")[0];
    assert_eq!(read.outputs[0].rate, wavec::registry::Rate::Sample);
}

// ── Constant folding ────────────────────────────────────────────────────────

#[test]
fn constant_folding_collapses_subgraph() {
    let state = compile_ok(&format!(
        "{MONO}stage main() {{ let k = (2 + 3) * 4 -> f32; a -> o; }}"
    ));
    let literals = nodes_of_kind(&state, "literal");
    assert_eq!(literals.len(), 1);
    assert_eq!(literals[0].attrs["value"], serde_json::json!([20.0]));
    assert!(nodes_of_kind(&state, "bin").is_empty());
    assert!(nodes_of_kind(&state, "cast").is_empty());
}

#[test]
fn untyped_sum_folds_through_conversion_context() {
    let state = compile_ok(&format!("{MONO}stage main() {{ 1 + 1 -> f32; a -> o; }}"));
    let literals = nodes_of_kind(&state, "literal");
    assert_eq!(literals.len(), 1);
    assert_eq!(literals[0].attrs["value"], serde_json::json!([2.0]));
    assert_eq!(literals[0].outputs[0].scalar, wavec::registry::ScalarType::F32);
}

// ── Rate violation ──────────────────────────────────────────────────────────

#[test]
fn signal_driven_capacity_is_a_rate_error() {
    assert_rejected(
        &format!(
            "{MONO}stage main() {{ buffer buf(input[0]): f32(1); \
             delwrite(buf, a); delread(buf, 1) -> o; }}"
        ),
        codes::RATE_TOO_HIGH,
    );
}

// ── Boundary cases ──────────────────────────────────────────────────────────

#[test]
fn literal_without_context_is_rejected() {
    assert_rejected(
        &format!("{MONO}stage main() {{ let k = 1; a -> o; }}"),
        codes::SHAPE_UNRESOLVED,
    );
}

#[test]
fn zero_delay_cell_is_rejected() {
    assert_rejected(
        &format!("{MONO}stage main() {{ cell(0) (x, y): f32(1); y <- a; x -> o; }}"),
        codes::STRUCT_BAD_CELL_DELAY,
    );
}

#[test]
fn delay_reaching_capacity_is_rejected() {
    assert_rejected(
        &format!(
            "{MONO}stage main() {{ buffer b(1): f32(1); \
             delwrite(b, a); delread(b, 1) -> o; }}"
        ),
        codes::STRUCT_DELAY_RANGE,
    );
}

#[test]
fn undeclared_stage_output_is_rejected() {
    assert_rejected(
        &format!(
            "{MONO}stage front(mix = f32(1)) {{ mix = a; }} \
             stage back() {{ front.outputs.wet -> o; }}"
        ),
        codes::STRUCT_CROSS_STAGE,
    );
}

#[test]
fn width_mismatch_needs_explicit_adapter() {
    assert_rejected(
        &format!("{STEREO}stage main() {{ m -> s; }}"),
        codes::SHAPE_WIDTH_MISMATCH,
    );
}

#[test]
fn int_float_mix_needs_explicit_conversion() {
    assert_rejected(
        &format!("{MONO}stage main() {{ 1i32 + 0.5f32 -> f32; a -> o; }}"),
        codes::SHAPE_SCALAR_MISMATCH,
    );
}

#[test]
fn illegal_cycle_is_rejected() {
    assert_rejected(
        &format!(
            "{MONO}stage main() {{ let x = f32; let y = f32(x); \
             y -> x; a -> x; x -> o; }}"
        ),
        codes::STRUCT_CYCLE,
    );
}

// ── Emitted-IR invariants ───────────────────────────────────────────────────

/// Every edge in a successfully emitted IR connects pins of identical
/// shape, every input pin has exactly one incoming edge, and node ids are
/// dense.
#[test]
fn emitted_ir_edge_invariants() {
    let sources = [
        format!("{MONO}stage main() {{ a + b -> o; }}"),
        format!("{MONO}stage main() {{ a -> o; b -> o; sin(a); }}"),
        format!("{STEREO}stage main() {{ broadcast(m) -> s; }}"),
        format!(
            "{MONO}stage main() {{ cell (p, n): f32(1); \
             n <- (a * 0.5f32) + (p * 0.5f32); p -> o; }}"
        ),
        format!(
            "{MONO}stage front(mix = f32(1)) {{ mix = a + b; }} \
             stage back() {{ front.outputs.mix -> o; }}"
        ),
    ];

    for source in &sources {
        let state = compile_ok(source);
        let ir = state.ir.as_ref().unwrap();

        for (index, node) in ir.nodes.iter().enumerate() {
            assert_eq!(node.id as usize, index, "node ids must be dense");
        }

        let mut in_edge_counts = std::collections::HashMap::new();
        for edge in &ir.edges {
            let src = &ir.nodes[edge.src.node as usize].outputs[edge.src.pin];
            let dst = &ir.nodes[edge.dst.node as usize].inputs[edge.dst.pin];
            assert_eq!(src.scalar, dst.scalar, "edge scalar mismatch in {source}");
            assert_eq!(src.width, dst.width, "edge width mismatch in {source}");
            *in_edge_counts
                .entry((edge.dst.node, edge.dst.pin))
                .or_insert(0usize) += 1;
        }
        for ((node, pin), count) in in_edge_counts {
            assert_eq!(
                count, 1,
                "input pin {pin} of node {node} has {count} edges after fan-in \
                 materialization in {source}"
            );
        }
    }
}

/// Stacking and explicit merge produce the same IR structure.
#[test]
fn stacking_matches_explicit_merge() {
    let stacked = compile_ok(&format!("{STEREO}stage main() {{ m, m -> s; }}"));
    let merged = compile_ok(&format!("{STEREO}stage main() {{ merge(m, m) -> s; }}"));
    let kinds = |state: &CompilationState| {
        let mut kinds: Vec<&str> = state
            .ir
            .as_ref()
            .unwrap()
            .nodes
            .iter()
            .map(|n| n.kind)
            .collect();
        kinds.sort();
        kinds
    };
    assert_eq!(kinds(&stacked), kinds(&merged));
    assert_eq!(
        stacked.ir.as_ref().unwrap().edges.len(),
        merged.ir.as_ref().unwrap().edges.len()
    );
}

// ── Exit-code-relevant classification ───────────────────────────────────────

#[test]
fn warnings_alone_do_not_fail_compilation() {
    let state = compile_ok(&format!(
        "{MONO}stage main() {{ let unused = a + b; a -> o; }}"
    ));
    assert!(state
        .diagnostics
        .iter()
        .any(|d| d.level == DiagLevel::Warning));
}
