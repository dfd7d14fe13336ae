// IR contract tests: lock the emitted document's structure so backend
// consumers can rely on it.
//
// These parse the serialized JSON back with serde_json and check the
// field-level layout for a handful of fixed programs — field names, index
// stability, kind vocabulary, and the version stamp.

use serde_json::Value;

use wavec::emit::IR_VERSION;
use wavec::pass::PassId;
use wavec::pipeline::compile_source;

fn emit_json(source: &str) -> Value {
    let state = compile_source(source, PassId::Emit).expect("source should parse");
    assert!(!state.has_error, "diagnostics: {:#?}", state.diagnostics);
    serde_json::from_str(&state.ir.expect("IR emitted").to_json()).expect("valid JSON")
}

const SOURCE: &str = "program contract;\n\
    external { sr: 44100, block_size: 256, \
    inputs: [ { name: in_l, width: 1 }, { name: in_r, width: 1 } ], \
    outputs: [ { name: out, width: 2 } ], \
    properties: [ { name: gain, type: f32, rate: s } ] }\n\
    stage mixer(sum = f32(1)) { sum = in_l + in_r; }\n\
    stage widen() { broadcast(mixer.outputs.sum) -> out; }\n";

#[test]
fn document_header() {
    let doc = emit_json(SOURCE);
    assert_eq!(doc["ir_version"], IR_VERSION);
    assert_eq!(doc["program_name"], "contract");
    assert_eq!(doc["sr"], 44100);
    assert_eq!(doc["block_size"], 256);
    assert_eq!(doc["source_hash"].as_str().unwrap().len(), 64);
}

#[test]
fn externals_have_stable_indices() {
    let doc = emit_json(SOURCE);
    let inputs = doc["externals"]["inputs"].as_array().unwrap();
    assert_eq!(inputs.len(), 2);
    for (index, input) in inputs.iter().enumerate() {
        assert_eq!(input["index"], index);
    }
    assert_eq!(inputs[0]["name"], "in_l");
    assert_eq!(inputs[1]["name"], "in_r");
    let outputs = doc["externals"]["outputs"].as_array().unwrap();
    assert_eq!(outputs[0]["width"], 2);
    let properties = doc["externals"]["properties"].as_array().unwrap();
    assert_eq!(properties[0]["declared"], "f32");
    assert_eq!(properties[0]["rate"], "sample");
}

#[test]
fn stages_list_declared_outputs_and_membership() {
    let doc = emit_json(SOURCE);
    let stages = doc["stages"].as_array().unwrap();
    assert_eq!(stages.len(), 2);
    assert_eq!(stages[0]["name"], "mixer");
    let outputs = stages[0]["outputs"].as_array().unwrap();
    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0]["name"], "sum");
    assert_eq!(outputs[0]["scalar"], "f32");
    assert_eq!(outputs[0]["width"], 1);

    // Output node ids are members of their own stage.
    let member_ids: Vec<u64> = stages[0]["nodes"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_u64().unwrap())
        .collect();
    assert!(member_ids.contains(&outputs[0]["node"].as_u64().unwrap()));
}

#[test]
fn kind_vocabulary_is_known() {
    let known = [
        "literal",
        "read_input",
        "read_property",
        "write_output",
        "stage_output",
        "discard",
        "bin",
        "un",
        "cast",
        "sum",
        "or",
        "broadcast",
        "truncate",
        "merge",
        "split",
        "slice",
        "if",
        "select",
        "math_fn",
        "clamp",
        "biquad",
        "xoroshiro",
        "cell",
        "delay_write",
        "delay_read",
        "sr",
        "clock",
    ];
    let doc = emit_json(SOURCE);
    for node in doc["nodes"].as_array().unwrap() {
        let kind = node["kind"].as_str().unwrap();
        assert!(known.contains(&kind), "unknown kind '{kind}' in IR");
    }
}

#[test]
fn edges_are_flat_endpoint_tuples() {
    let doc = emit_json(SOURCE);
    let node_count = doc["nodes"].as_array().unwrap().len() as u64;
    for edge in doc["edges"].as_array().unwrap() {
        let src = &edge["src"];
        let dst = &edge["dst"];
        assert!(src["node"].as_u64().unwrap() < node_count);
        assert!(dst["node"].as_u64().unwrap() < node_count);
        assert!(src["pin"].is_number());
        assert!(dst["pin"].is_number());
    }
}

#[test]
fn stateful_program_structure() {
    let source = "program echo;\n\
        external { sr: 48000, block_size: 64, \
        inputs: [ { name: dry, width: 1 } ], \
        outputs: [ { name: wet, width: 1 } ], properties: [] }\n\
        stage main() {\n\
          buffer line(4800): f32(1);\n\
          cell (fb, fb_next): f32(1);\n\
          delwrite(line, dry + (fb * 0.5f32));\n\
          let tap = delread(line, 2400);\n\
          fb_next <- tap;\n\
          tap -> wet;\n\
        }\n";
    let doc = emit_json(source);

    let buffers = doc["buffers"].as_array().unwrap();
    assert_eq!(buffers.len(), 1);
    assert_eq!(buffers[0]["name"], "line");
    assert_eq!(buffers[0]["capacity"], 4800);
    assert_eq!(buffers[0]["delay_policy"], "clamp");

    let nodes = doc["nodes"].as_array().unwrap();
    let kind_count = |kind: &str| nodes.iter().filter(|n| n["kind"] == kind).count();
    assert_eq!(kind_count("cell"), 1);
    assert_eq!(kind_count("delay_write"), 1);
    assert_eq!(kind_count("delay_read"), 1);
    // The capacity carrier is consumed by folding and never emitted.
    assert_eq!(kind_count("buffer_cap"), 0);

    // delread/delwrite attrs reference the buffer by id.
    let read = nodes.iter().find(|n| n["kind"] == "delay_read").unwrap();
    assert_eq!(read["attrs"]["buffer"], buffers[0]["id"]);
}

#[test]
fn same_source_emits_identical_documents() {
    let a = emit_json(SOURCE);
    let b = emit_json(SOURCE);
    assert_eq!(a, b);
}
