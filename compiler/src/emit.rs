// emit.rs — Serialization of the validated graph to the backend contract
//
// Produces the IR document backends consume: program header, normalized
// external arrays with stable 0-based indices, buffers, stages, nodes with
// per-pin shape/rate/direction, and flat edges. Node IDs are renumbered
// densely over live nodes so folded-away nodes leave no holes.
//
// The kind vocabulary is closed and versioned via `IR_VERSION`; adding a
// kind or changing attribute layout bumps the version.
//
// Preconditions: graph inferred, validated, and folded without errors.
// Postconditions: returns a serializable document; the graph is unchanged.
// Failure modes: none (malformed graphs are rejected by earlier passes).
// Side effects: none.

use std::collections::HashMap;

use serde::Serialize;
use serde_json::{json, Value};

use crate::graph::{BiquadDesign, BinOp, Constant, Graph, LitValue, MathFunc, NodeKind, UnOp};
use crate::id::NodeId;
use crate::registry::{Rate, ScalarType};
use crate::resolve::ResolvedProgram;

/// Version of the IR document layout and kind vocabulary.
pub const IR_VERSION: u32 = 1;

// ── Document types ──────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct IrDoc {
    pub ir_version: u32,
    pub program_name: String,
    pub sr: u64,
    pub block_size: u64,
    /// SHA-256 of the source text, hex; present when compiled from a file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_hash: Option<String>,
    pub externals: IrExternals,
    pub buffers: Vec<IrBuffer>,
    pub stages: Vec<IrStage>,
    pub nodes: Vec<IrNode>,
    pub edges: Vec<IrEdge>,
}

#[derive(Debug, Serialize)]
pub struct IrExternals {
    pub inputs: Vec<IrPort>,
    pub outputs: Vec<IrPort>,
    pub properties: Vec<IrProperty>,
}

#[derive(Debug, Serialize)]
pub struct IrPort {
    pub index: usize,
    pub name: String,
    pub width: u32,
}

#[derive(Debug, Serialize)]
pub struct IrProperty {
    pub index: usize,
    pub name: String,
    /// The declared scalar; carried for the backend even though the graph
    /// treats properties as f64.
    pub declared: ScalarType,
    pub rate: Rate,
}

#[derive(Debug, Serialize)]
pub struct IrBuffer {
    pub id: u32,
    pub name: String,
    pub scalar: ScalarType,
    pub width: u32,
    pub capacity: u64,
    /// Out-of-range dynamic delays clamp to `capacity - 1`.
    pub delay_policy: &'static str,
}

#[derive(Debug, Serialize)]
pub struct IrStage {
    pub id: u32,
    pub name: String,
    pub outputs: Vec<IrStageOutput>,
    pub nodes: Vec<u32>,
}

#[derive(Debug, Serialize)]
pub struct IrStageOutput {
    pub name: String,
    pub scalar: ScalarType,
    pub width: u32,
    pub node: u32,
}

#[derive(Debug, Serialize)]
pub struct IrNode {
    pub id: u32,
    pub kind: &'static str,
    pub attrs: Value,
    pub stage: u32,
    pub inputs: Vec<IrPin>,
    pub outputs: Vec<IrPin>,
}

#[derive(Debug, Serialize)]
pub struct IrPin {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub scalar: ScalarType,
    pub width: u32,
    pub rate: Rate,
}

#[derive(Debug, Serialize)]
pub struct IrEdge {
    pub src: IrEndpoint,
    pub dst: IrEndpoint,
}

#[derive(Debug, Serialize)]
pub struct IrEndpoint {
    pub node: u32,
    pub pin: usize,
}

// ── Emission ────────────────────────────────────────────────────────────────

/// Serialize the frozen graph into the IR document.
pub fn emit(
    graph: &Graph,
    resolved: &ResolvedProgram,
    program_name: &str,
    source_hash: Option<String>,
) -> IrDoc {
    // Dense renumbering over live nodes, in id order.
    let mut remap: HashMap<NodeId, u32> = HashMap::new();
    for node in graph.live_nodes() {
        let next = remap.len() as u32;
        remap.insert(node.id, next);
    }

    let externals = IrExternals {
        inputs: resolved
            .external
            .inputs
            .iter()
            .enumerate()
            .map(|(index, p)| IrPort {
                index,
                name: p.name.clone(),
                width: p.width,
            })
            .collect(),
        outputs: resolved
            .external
            .outputs
            .iter()
            .enumerate()
            .map(|(index, p)| IrPort {
                index,
                name: p.name.clone(),
                width: p.width,
            })
            .collect(),
        properties: resolved
            .external
            .properties
            .iter()
            .enumerate()
            .map(|(index, p)| IrProperty {
                index,
                name: p.name.clone(),
                declared: p.declared,
                rate: p.rate,
            })
            .collect(),
    };

    let buffers = graph
        .buffers
        .iter()
        .map(|b| IrBuffer {
            id: b.id.0,
            name: b.name.clone(),
            scalar: b.shape.scalar,
            width: b.shape.width,
            capacity: b.capacity.unwrap_or(0),
            delay_policy: "clamp",
        })
        .collect();

    let stages = graph
        .stages
        .iter()
        .map(|stage| IrStage {
            id: stage.id.0,
            name: stage.name.clone(),
            outputs: stage
                .outputs
                .iter()
                .map(|out| IrStageOutput {
                    name: out.name.clone(),
                    scalar: out.shape.scalar,
                    width: out.shape.width,
                    node: remap[&out.node],
                })
                .collect(),
            nodes: graph
                .live_nodes()
                .filter(|n| n.stage == stage.id)
                .map(|n| remap[&n.id])
                .collect(),
        })
        .collect();

    let nodes = graph
        .live_nodes()
        .map(|node| IrNode {
            id: remap[&node.id],
            kind: kind_name(&node.kind),
            attrs: kind_attrs(&node.kind),
            stage: node.stage.0,
            inputs: node
                .inputs
                .pins
                .iter()
                .map(|pin| pin_ir(pin))
                .collect(),
            outputs: node
                .outputs
                .pins
                .iter()
                .map(|pin| pin_ir(pin))
                .collect(),
        })
        .collect();

    let edges = graph
        .edges
        .iter()
        .map(|edge| IrEdge {
            src: IrEndpoint {
                node: remap[&edge.src.node],
                pin: edge.src.pin,
            },
            dst: IrEndpoint {
                node: remap[&edge.dst.node],
                pin: edge.dst.pin,
            },
        })
        .collect();

    IrDoc {
        ir_version: IR_VERSION,
        program_name: program_name.to_string(),
        sr: resolved.external.sr,
        block_size: resolved.external.block_size,
        source_hash,
        externals,
        buffers,
        stages,
        nodes,
        edges,
    }
}

impl IrDoc {
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).expect("the IR document serializes")
    }
}

fn pin_ir(pin: &crate::graph::Pin) -> IrPin {
    let shape = pin.shape.expect("emitted pins are fully inferred");
    IrPin {
        name: pin.name.clone(),
        scalar: shape.scalar,
        width: shape.width,
        rate: pin.rate.unwrap_or(Rate::Constant),
    }
}

// ── Kind vocabulary ─────────────────────────────────────────────────────────

pub fn kind_name(kind: &NodeKind) -> &'static str {
    match kind {
        NodeKind::Literal { .. } => "literal",
        NodeKind::ReadInput { .. } => "read_input",
        NodeKind::ReadProperty { .. } => "read_property",
        NodeKind::WriteOutput { .. } => "write_output",
        NodeKind::StageOutput { .. } => "stage_output",
        NodeKind::Discard => "discard",
        NodeKind::Bin { .. } => "bin",
        NodeKind::Un { .. } => "un",
        NodeKind::Cast { .. } => "cast",
        NodeKind::Sum => "sum",
        NodeKind::OrJoin => "or",
        NodeKind::Broadcast => "broadcast",
        NodeKind::Truncate => "truncate",
        NodeKind::Merge => "merge",
        NodeKind::Split { .. } => "split",
        NodeKind::Slice { .. } => "slice",
        NodeKind::IfSelect => "if",
        NodeKind::Select => "select",
        NodeKind::MathFn { .. } => "math_fn",
        NodeKind::Clamp => "clamp",
        NodeKind::Biquad { .. } => "biquad",
        NodeKind::Xoroshiro { .. } => "xoroshiro",
        NodeKind::Cell { .. } => "cell",
        NodeKind::DelayWrite { .. } => "delay_write",
        NodeKind::DelayRead { .. } => "delay_read",
        NodeKind::BufferCap { .. } => "buffer_cap",
        NodeKind::Sr => "sr",
        NodeKind::Clock => "clock",
    }
}

fn kind_attrs(kind: &NodeKind) -> Value {
    match kind {
        NodeKind::Literal { value } => json!({ "value": literal_value(value) }),
        NodeKind::ReadInput { index }
        | NodeKind::ReadProperty { index }
        | NodeKind::WriteOutput { index } => json!({ "index": index }),
        NodeKind::StageOutput { stage, index } => {
            json!({ "stage": stage.0, "index": index })
        }
        NodeKind::Bin { op } => json!({ "op": bin_op_name(*op) }),
        NodeKind::Un { op } => json!({ "op": un_op_name(*op) }),
        NodeKind::Cast { to } => json!({ "to": to.to_string() }),
        NodeKind::Split { widths } => json!({ "widths": widths }),
        NodeKind::Slice { start, end } => json!({ "start": start, "end": end }),
        NodeKind::MathFn { func } => json!({ "func": math_fn_name(*func) }),
        NodeKind::Biquad { design } => json!({ "design": biquad_name(*design) }),
        NodeKind::Xoroshiro { seed } => json!({ "seed": seed }),
        NodeKind::Cell { delay, .. } => json!({ "delay": delay }),
        NodeKind::DelayWrite { buffer } | NodeKind::DelayRead { buffer } => {
            json!({ "buffer": buffer.0 })
        }
        NodeKind::BufferCap { buffer } => json!({ "buffer": buffer.0 }),
        NodeKind::Discard
        | NodeKind::Sum
        | NodeKind::OrJoin
        | NodeKind::Broadcast
        | NodeKind::Truncate
        | NodeKind::Merge
        | NodeKind::IfSelect
        | NodeKind::Select
        | NodeKind::Clamp
        | NodeKind::Sr
        | NodeKind::Clock => json!({}),
    }
}

/// Literal payloads are typed by the time emission runs. Non-finite floats
/// have no JSON representation and serialize as null.
fn literal_value(value: &LitValue) -> Value {
    match value {
        LitValue::Typed(Constant::I32(v)) => json!(v),
        LitValue::Typed(Constant::I64(v)) => json!(v),
        LitValue::Typed(Constant::F32(v)) => json!(v),
        LitValue::Typed(Constant::F64(v)) => json!(v),
        LitValue::Typed(Constant::Bool(v)) => json!(v),
        LitValue::UntypedInt(v) => json!(v.to_string()),
        LitValue::UntypedFloat(v) => json!(v),
    }
}

fn bin_op_name(op: BinOp) -> &'static str {
    match op {
        BinOp::Add => "add",
        BinOp::Sub => "sub",
        BinOp::Mul => "mul",
        BinOp::Div => "div",
        BinOp::Rem => "rem",
        BinOp::Shl => "shl",
        BinOp::Shr => "shr",
        BinOp::Lt => "lt",
        BinOp::Le => "le",
        BinOp::Gt => "gt",
        BinOp::Ge => "ge",
        BinOp::Eq => "eq",
        BinOp::Ne => "ne",
        BinOp::BitAnd => "bit_and",
        BinOp::BitXor => "bit_xor",
        BinOp::BitOr => "bit_or",
        BinOp::Min => "min",
        BinOp::Max => "max",
        BinOp::Pow => "pow",
    }
}

fn un_op_name(op: UnOp) -> &'static str {
    match op {
        UnOp::Neg => "neg",
        UnOp::Not => "not",
        UnOp::BitNot => "bit_not",
    }
}

fn math_fn_name(func: MathFunc) -> &'static str {
    match func {
        MathFunc::Sin => "sin",
        MathFunc::Cos => "cos",
        MathFunc::Tan => "tan",
        MathFunc::Sinh => "sinh",
        MathFunc::Cosh => "cosh",
        MathFunc::Tanh => "tanh",
    }
}

fn biquad_name(design: BiquadDesign) -> &'static str {
    match design {
        BiquadDesign::Lowpass => "lowpass",
        BiquadDesign::Highpass => "highpass",
        BiquadDesign::Bandpass => "bandpass",
    }
}

// ── Tests ──
