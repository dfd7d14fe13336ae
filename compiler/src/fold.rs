// fold.rs — Constant folding of constant-rate subgraphs
//
// Iteratively replaces every constant-rate node whose operands are all
// literals with a single literal node carrying the computed value, until
// fixpoint. Evaluation happens at extended precision (i128 for integers,
// f64 for floats) with one rounding step to the node's resolved type.
// Orphaned operand literals are swept away, so a fully constant subgraph
// leaves exactly one literal behind.
//
// Folding also performs the two checks that need literal values: buffer
// capacities are finalized into the buffer table (positive integers only),
// and constant delays are range-checked against their buffer's capacity.
//
// Preconditions: graph inferred and validated; every pin has a shape and
//   rate; fan-in is materialized.
// Postconditions: no constant-rate foldable node remains; every literal
//   payload is typed; buffer capacities are set.
// Failure modes: division by zero in a constant subgraph, non-literal or
//   non-positive capacities, out-of-range constant delays.
// Side effects: mutates the graph (node replacement, edge rewiring).

use std::collections::HashSet;

use crate::diag::{codes, Diagnostic};
use crate::graph::{
    BinOp, Bundle, Constant, Graph, LitValue, NodeKind, Pin, PinRef, UnOp,
};
use crate::id::NodeId;
use crate::registry::{Rate, ScalarType, Shape};
use crate::resolve::ResolvedProgram;

/// Result of folding. The graph is mutated in place.
#[derive(Debug)]
pub struct FoldResult {
    pub diagnostics: Vec<Diagnostic>,
}

/// Run constant folding to fixpoint, then finalize buffer capacities and
/// check constant delays.
pub fn fold(graph: &mut Graph, resolved: &ResolvedProgram) -> FoldResult {
    let mut folder = Folder {
        graph,
        diagnostics: Vec::new(),
        poisoned: HashSet::new(),
    };
    folder.normalize_literals();
    folder.fold_to_fixpoint(resolved);
    folder.finalize_capacities();
    folder.check_constant_delays();
    folder.sweep_orphans();
    FoldResult {
        diagnostics: folder.diagnostics,
    }
}

struct Folder<'g> {
    graph: &'g mut Graph,
    diagnostics: Vec<Diagnostic>,
    /// Nodes whose evaluation failed; left in place, never retried.
    poisoned: HashSet<NodeId>,
}

impl<'g> Folder<'g> {
    fn error(
        &mut self,
        code: crate::diag::DiagCode,
        span: Option<crate::ast::Span>,
        message: impl Into<String>,
    ) {
        let span = span.unwrap_or_else(|| (0..0).into());
        self.diagnostics.push(Diagnostic::error(code, span, message));
    }

    /// Rewrite untyped literal payloads to the scalar inference resolved.
    fn normalize_literals(&mut self) {
        for node in self.graph.nodes.iter_mut() {
            if node.dead {
                continue;
            }
            let NodeKind::Literal { value } = &mut node.kind else {
                continue;
            };
            let Some(shape) = node.outputs.pins[0].shape else {
                continue;
            };
            let typed = match value {
                LitValue::Typed(_) => continue,
                LitValue::UntypedInt(v) => int_constant(shape.scalar, *v),
                LitValue::UntypedFloat(v) => float_constant(shape.scalar, *v),
            };
            if let Some(constant) = typed {
                *value = LitValue::Typed(constant);
            }
        }
    }

    // ── The fixpoint loop ──

    fn fold_to_fixpoint(&mut self, resolved: &ResolvedProgram) {
        loop {
            let mut folded_any = false;
            for index in 0..self.graph.nodes.len() {
                let id = NodeId(index as u32);
                if self.graph.nodes[index].dead || self.poisoned.contains(&id) {
                    continue;
                }
                if self.try_fold(id, resolved) {
                    folded_any = true;
                }
            }
            if !folded_any {
                break;
            }
        }
    }

    /// Fold one node if it is a constant-rate foldable kind with all-literal
    /// operands. Returns true if the node was replaced.
    fn try_fold(&mut self, id: NodeId, resolved: &ResolvedProgram) -> bool {
        let node = self.graph.node(id);
        if !is_foldable_kind(&node.kind) {
            return false;
        }
        // Only constant-rate results fold.
        if node
            .outputs
            .pins
            .iter()
            .any(|pin| pin.rate != Some(Rate::Constant))
        {
            return false;
        }

        // `sr` has no operands; everything else needs literal inputs.
        let mut operands = Vec::with_capacity(node.inputs.len());
        for pin in 0..node.inputs.len() {
            let Some(edge) = self
                .graph
                .edges_into(PinRef { node: id, pin })
                .next()
            else {
                return false;
            };
            let src = self.graph.node(edge.src.node);
            let NodeKind::Literal {
                value: LitValue::Typed(constant),
            } = &src.kind
            else {
                return false;
            };
            operands.push(constant.clone());
        }

        let node = self.graph.node(id);
        let out_shapes: Vec<Shape> = match node
            .outputs
            .pins
            .iter()
            .map(|pin| pin.shape)
            .collect::<Option<Vec<_>>>()
        {
            Some(shapes) => shapes,
            None => return false,
        };

        let span = node.span;
        let results = match evaluate(&node.kind, &operands, &out_shapes, resolved) {
            Ok(results) => results,
            Err(message) => {
                self.poisoned.insert(id);
                self.error(codes::FOLD_EVAL, span, message);
                return false;
            }
        };

        self.replace_with_literals(id, &results);
        true
    }

    /// Replace a folded node with one literal per output and drop its
    /// input edges.
    fn replace_with_literals(&mut self, id: NodeId, results: &[Constant]) {
        let stage = self.graph.node(id).stage;
        let span = self.graph.node(id).span;

        let mut literals = Vec::with_capacity(results.len());
        for constant in results {
            let mut outputs = Bundle::new();
            let mut pin = Pin::unnamed().with_shape(constant.shape());
            pin.rate = Some(Rate::Constant);
            outputs.push(pin);
            let literal = self.graph.add_node(
                NodeKind::Literal {
                    value: LitValue::Typed(constant.clone()),
                },
                stage,
                Bundle::new(),
                outputs,
                span,
            );
            literals.push(literal);
        }

        for edge in self.graph.edges.iter_mut() {
            if edge.src.node == id {
                edge.src = PinRef {
                    node: literals[edge.src.pin],
                    pin: 0,
                };
            }
        }
        self.graph.edges.retain(|e| e.dst.node != id);
        self.graph.node_mut(id).dead = true;
    }

    // ── Capacity finalization ──

    fn finalize_capacities(&mut self) {
        let caps: Vec<NodeId> = self
            .graph
            .live_nodes()
            .filter(|n| matches!(n.kind, NodeKind::BufferCap { .. }))
            .map(|n| n.id)
            .collect();

        for id in caps {
            let node = self.graph.node(id);
            let NodeKind::BufferCap { buffer } = &node.kind else {
                unreachable!()
            };
            let buffer = *buffer;
            let span = node.span;
            let source = self
                .graph
                .edges_into(PinRef { node: id, pin: 0 })
                .next()
                .map(|e| e.src.node);

            let value = source.and_then(|src| match &self.graph.node(src).kind {
                NodeKind::Literal {
                    value: LitValue::Typed(constant),
                } => constant_as_int(constant),
                _ => None,
            });

            match value {
                None => {
                    let name = self.graph.buffers[buffer.0 as usize].name.clone();
                    self.error(
                        codes::FOLD_NOT_CONSTANT,
                        span,
                        format!("capacity of buffer '{name}' must fold to an integer constant"),
                    );
                }
                Some(v) if v < 1 => {
                    let name = self.graph.buffers[buffer.0 as usize].name.clone();
                    self.error(
                        codes::STRUCT_BAD_CAPACITY,
                        span,
                        format!("capacity of buffer '{name}' must be positive, found {v}"),
                    );
                }
                Some(v) => {
                    self.graph.buffers[buffer.0 as usize].capacity = Some(v as u64);
                    self.graph.edges.retain(|e| e.dst.node != id);
                    self.graph.node_mut(id).dead = true;
                }
            }
        }
    }

    // ── Constant delay range check ──

    fn check_constant_delays(&mut self) {
        let mut reports = Vec::new();
        for node in self.graph.live_nodes() {
            let NodeKind::DelayRead { buffer } = &node.kind else {
                continue;
            };
            let buffer = *buffer;
            let Some(capacity) = self.graph.buffers[buffer.0 as usize].capacity else {
                continue;
            };
            let Some(edge) = self
                .graph
                .edges_into(PinRef {
                    node: node.id,
                    pin: 0,
                })
                .next()
            else {
                continue;
            };
            let NodeKind::Literal {
                value: LitValue::Typed(constant),
            } = &self.graph.node(edge.src.node).kind
            else {
                // Non-constant delays are clamped to capacity-1 at run
                // time; nothing to check here.
                continue;
            };
            if let Some(delay) = constant_as_int(constant) {
                if delay < 0 || delay as u64 >= capacity {
                    let name = self.graph.buffers[buffer.0 as usize].name.clone();
                    reports.push((
                        node.span,
                        format!(
                            "delay {delay} is outside buffer '{name}' \
                             (capacity {capacity}; delays must be in [0, {capacity}))"
                        ),
                    ));
                }
            }
        }
        for (span, message) in reports {
            self.error(codes::STRUCT_DELAY_RANGE, span, message);
        }
    }

    // ── Orphan sweep ──

    /// Literals whose consumers were all folded away have no edges left;
    /// remove them. A literal the program discards on purpose keeps its
    /// discard edge and survives.
    fn sweep_orphans(&mut self) {
        loop {
            let orphans: Vec<NodeId> = self
                .graph
                .live_nodes()
                .filter(|n| matches!(n.kind, NodeKind::Literal { .. }))
                .filter(|n| self.graph.edges_from_node(n.id).next().is_none())
                .filter(|n| self.graph.edges_into_node(n.id).next().is_none())
                .map(|n| n.id)
                .collect();
            if orphans.is_empty() {
                break;
            }
            for id in orphans {
                self.graph.node_mut(id).dead = true;
            }
        }
    }
}

// ── Foldability ──

fn is_foldable_kind(kind: &NodeKind) -> bool {
    matches!(
        kind,
        NodeKind::Bin { .. }
            | NodeKind::Un { .. }
            | NodeKind::Cast { .. }
            | NodeKind::MathFn { .. }
            | NodeKind::Clamp
            | NodeKind::IfSelect
            | NodeKind::Select
            | NodeKind::Merge
            | NodeKind::Split { .. }
            | NodeKind::Slice { .. }
            | NodeKind::Broadcast
            | NodeKind::Truncate
            | NodeKind::Sum
            | NodeKind::OrJoin
            | NodeKind::Sr
    )
}

// ── Evaluation ──
//
// Integer work happens in i128, float work in f64; the result is rounded
// once to the output pin's resolved scalar. Widths already agree by
// inference, so elementwise operations never broadcast.

fn evaluate(
    kind: &NodeKind,
    operands: &[Constant],
    out_shapes: &[Shape],
    resolved: &ResolvedProgram,
) -> Result<Vec<Constant>, String> {
    match kind {
        NodeKind::Sr => Ok(vec![Constant::I64(vec![resolved.external.sr as i64])]),
        NodeKind::Bin { op } => Ok(vec![eval_bin(*op, &operands[0], &operands[1], out_shapes[0])?]),
        NodeKind::Un { op } => Ok(vec![eval_un(*op, &operands[0], out_shapes[0])?]),
        NodeKind::Cast { .. } => Ok(vec![cast_constant(&operands[0], out_shapes[0].scalar)?]),
        NodeKind::MathFn { func } => {
            let values = constant_as_f64(&operands[0])?;
            let mapped: Vec<f64> = values
                .iter()
                .map(|v| match func {
                    crate::graph::MathFunc::Sin => v.sin(),
                    crate::graph::MathFunc::Cos => v.cos(),
                    crate::graph::MathFunc::Tan => v.tan(),
                    crate::graph::MathFunc::Sinh => v.sinh(),
                    crate::graph::MathFunc::Cosh => v.cosh(),
                    crate::graph::MathFunc::Tanh => v.tanh(),
                })
                .collect();
            Ok(vec![float_result(out_shapes[0].scalar, mapped)?])
        }
        NodeKind::Clamp => {
            if out_shapes[0].scalar.is_float() {
                let value = constant_as_f64(&operands[0])?;
                let lower = constant_as_f64(&operands[1])?;
                let upper = constant_as_f64(&operands[2])?;
                let clamped = value
                    .iter()
                    .zip(lower.iter().zip(upper.iter()))
                    .map(|(v, (lo, hi))| v.clamp(*lo, *hi))
                    .collect();
                Ok(vec![float_result(out_shapes[0].scalar, clamped)?])
            } else {
                let value = constant_as_i128(&operands[0])?;
                let lower = constant_as_i128(&operands[1])?;
                let upper = constant_as_i128(&operands[2])?;
                let clamped = value
                    .iter()
                    .zip(lower.iter().zip(upper.iter()))
                    .map(|(v, (lo, hi))| (*v).clamp(*lo, *hi))
                    .collect();
                Ok(vec![int_result(out_shapes[0].scalar, clamped)?])
            }
        }
        NodeKind::IfSelect => {
            let Constant::Bool(cond) = &operands[0] else {
                return Err("if condition must be bool".to_string());
            };
            Ok(vec![select_elementwise(cond, &operands[1], &operands[2])])
        }
        NodeKind::Select => {
            let index = constant_as_int(&operands[0])
                .ok_or_else(|| "select index must be an integer".to_string())?;
            let choices = &operands[1..];
            if index < 0 || index as usize >= choices.len() {
                return Err(format!(
                    "select index {index} out of range ({} choices)",
                    choices.len()
                ));
            }
            Ok(vec![choices[index as usize].clone()])
        }
        NodeKind::Merge => Ok(vec![concat_constants(operands)?]),
        NodeKind::Split { widths } => {
            let mut results = Vec::with_capacity(widths.len());
            let mut offset = 0u32;
            for width in widths {
                results.push(slice_constant(&operands[0], offset, offset + width));
                offset += width;
            }
            Ok(results)
        }
        NodeKind::Slice { start, end } => {
            let upper = end.unwrap_or(operands[0].width());
            Ok(vec![slice_constant(&operands[0], *start, upper)])
        }
        NodeKind::Broadcast => {
            let out_width = out_shapes[0].width;
            Ok(vec![zero_extend(&operands[0], out_width)])
        }
        NodeKind::Truncate => {
            let out_width = out_shapes[0].width;
            Ok(vec![slice_constant(&operands[0], 0, out_width)])
        }
        NodeKind::Sum => {
            let mut acc = operands[0].clone();
            for operand in &operands[1..] {
                acc = eval_bin(BinOp::Add, &acc, operand, out_shapes[0])?;
            }
            Ok(vec![acc])
        }
        NodeKind::OrJoin => {
            let mut acc = bool_vec(&operands[0])?;
            for operand in &operands[1..] {
                let next = bool_vec(operand)?;
                acc = acc.iter().zip(next.iter()).map(|(a, b)| *a || *b).collect();
            }
            Ok(vec![Constant::Bool(acc)])
        }
        other => Err(format!("kind {other:?} is not foldable")),
    }
}

fn eval_bin(op: BinOp, lhs: &Constant, rhs: &Constant, out: Shape) -> Result<Constant, String> {
    // Gate form: `value & mask`.
    if op == BinOp::BitAnd {
        match (lhs, rhs) {
            (value, Constant::Bool(mask)) if !value.scalar_type().is_bool() => {
                return Ok(gate(value, mask));
            }
            (Constant::Bool(mask), value) if !value.scalar_type().is_bool() => {
                return Ok(gate(value, mask));
            }
            _ => {}
        }
    }

    if op.is_comparison() {
        return eval_comparison(op, lhs, rhs);
    }

    if lhs.scalar_type().is_bool() {
        let a = bool_vec(lhs)?;
        let b = bool_vec(rhs)?;
        let combined: Vec<bool> = a
            .iter()
            .zip(b.iter())
            .map(|(x, y)| match op {
                BinOp::BitAnd => *x && *y,
                BinOp::BitOr => *x || *y,
                BinOp::BitXor => *x != *y,
                _ => false,
            })
            .collect();
        if !matches!(op, BinOp::BitAnd | BinOp::BitOr | BinOp::BitXor) {
            return Err(format!("operation {op:?} is not defined on bool"));
        }
        return Ok(Constant::Bool(combined));
    }

    if out.scalar.is_float() || matches!(op, BinOp::Pow) {
        let a = constant_as_f64(lhs)?;
        let b = constant_as_f64(rhs)?;
        let combined: Result<Vec<f64>, String> = a
            .iter()
            .zip(b.iter().cycle())
            .map(|(x, y)| {
                Ok(match op {
                    BinOp::Add => x + y,
                    BinOp::Sub => x - y,
                    BinOp::Mul => x * y,
                    BinOp::Div => x / y,
                    BinOp::Rem => x % y,
                    BinOp::Min => x.min(*y),
                    BinOp::Max => x.max(*y),
                    BinOp::Pow => x.powf(*y),
                    other => return Err(format!("operation {other:?} is not defined on floats")),
                })
            })
            .collect();
        return float_result(out.scalar, combined?);
    }

    let a = constant_as_i128(lhs)?;
    let b = constant_as_i128(rhs)?;
    let combined: Result<Vec<i128>, String> = a
        .iter()
        .zip(b.iter().cycle())
        .map(|(x, y)| {
            Ok(match op {
                BinOp::Add => x.wrapping_add(*y),
                BinOp::Sub => x.wrapping_sub(*y),
                BinOp::Mul => x.wrapping_mul(*y),
                BinOp::Div => {
                    if *y == 0 {
                        return Err("division by zero in constant expression".to_string());
                    }
                    x / y
                }
                BinOp::Rem => {
                    if *y == 0 {
                        return Err("remainder by zero in constant expression".to_string());
                    }
                    x % y
                }
                BinOp::Shl => x.wrapping_shl(*y as u32),
                BinOp::Shr => x.wrapping_shr(*y as u32),
                BinOp::BitAnd => x & y,
                BinOp::BitOr => x | y,
                BinOp::BitXor => x ^ y,
                BinOp::Min => *x.min(y),
                BinOp::Max => *x.max(y),
                other => return Err(format!("operation {other:?} is not defined on integers")),
            })
        })
        .collect();
    int_result(out.scalar, combined?)
}

fn eval_comparison(op: BinOp, lhs: &Constant, rhs: &Constant) -> Result<Constant, String> {
    let result = if lhs.scalar_type().is_float() || rhs.scalar_type().is_float() {
        let a = constant_as_f64(lhs)?;
        let b = constant_as_f64(rhs)?;
        a.iter()
            .zip(b.iter())
            .map(|(x, y)| compare(op, x.partial_cmp(y)))
            .collect()
    } else {
        let a = constant_as_i128(lhs)?;
        let b = constant_as_i128(rhs)?;
        a.iter()
            .zip(b.iter())
            .map(|(x, y)| compare(op, x.partial_cmp(y)))
            .collect()
    };
    Ok(Constant::Bool(result))
}

fn compare(op: BinOp, ordering: Option<std::cmp::Ordering>) -> bool {
    use std::cmp::Ordering::*;
    match (op, ordering) {
        (BinOp::Lt, Some(Less)) => true,
        (BinOp::Le, Some(Less | Equal)) => true,
        (BinOp::Gt, Some(Greater)) => true,
        (BinOp::Ge, Some(Greater | Equal)) => true,
        (BinOp::Eq, Some(Equal)) => true,
        (BinOp::Ne, Some(Less | Greater)) => true,
        (BinOp::Ne, None) => true,
        _ => false,
    }
}

fn eval_un(op: UnOp, operand: &Constant, out: Shape) -> Result<Constant, String> {
    match op {
        UnOp::Not => {
            let values = bool_vec(operand)?;
            Ok(Constant::Bool(values.iter().map(|v| !v).collect()))
        }
        UnOp::BitNot => {
            if operand.scalar_type().is_bool() {
                let values = bool_vec(operand)?;
                Ok(Constant::Bool(values.iter().map(|v| !v).collect()))
            } else {
                let values = constant_as_i128(operand)?;
                int_result(out.scalar, values.iter().map(|v| !v).collect())
            }
        }
        UnOp::Neg => {
            if out.scalar.is_float() {
                let values = constant_as_f64(operand)?;
                float_result(out.scalar, values.iter().map(|v| -v).collect())
            } else {
                let values = constant_as_i128(operand)?;
                int_result(out.scalar, values.iter().map(|v| v.wrapping_neg()).collect())
            }
        }
    }
}

// ── Constant helpers ──

fn int_constant(scalar: ScalarType, v: i128) -> Option<Constant> {
    match scalar {
        ScalarType::I32 => Some(Constant::I32(vec![v as i32])),
        ScalarType::I64 => Some(Constant::I64(vec![v as i64])),
        ScalarType::F32 => Some(Constant::F32(vec![v as f32])),
        ScalarType::F64 => Some(Constant::F64(vec![v as f64])),
        ScalarType::Bool => None,
    }
}

fn float_constant(scalar: ScalarType, v: f64) -> Option<Constant> {
    match scalar {
        ScalarType::F32 => Some(Constant::F32(vec![v as f32])),
        ScalarType::F64 => Some(Constant::F64(vec![v])),
        _ => None,
    }
}

fn constant_as_i128(c: &Constant) -> Result<Vec<i128>, String> {
    match c {
        Constant::I32(v) => Ok(v.iter().map(|x| *x as i128).collect()),
        Constant::I64(v) => Ok(v.iter().map(|x| *x as i128).collect()),
        other => Err(format!(
            "expected an integer constant, found {}",
            other.scalar_type()
        )),
    }
}

fn constant_as_f64(c: &Constant) -> Result<Vec<f64>, String> {
    match c {
        Constant::F32(v) => Ok(v.iter().map(|x| *x as f64).collect()),
        Constant::F64(v) => Ok(v.clone()),
        Constant::I32(v) => Ok(v.iter().map(|x| *x as f64).collect()),
        Constant::I64(v) => Ok(v.iter().map(|x| *x as f64).collect()),
        Constant::Bool(_) => Err("expected a numeric constant, found bool".to_string()),
    }
}

fn bool_vec(c: &Constant) -> Result<Vec<bool>, String> {
    match c {
        Constant::Bool(v) => Ok(v.clone()),
        other => Err(format!("expected bool, found {}", other.scalar_type())),
    }
}

/// Scalar channel value of an integer constant (used for capacities,
/// delays, select indices).
fn constant_as_int(c: &Constant) -> Option<i128> {
    match c {
        Constant::I32(v) if v.len() == 1 => Some(v[0] as i128),
        Constant::I64(v) if v.len() == 1 => Some(v[0] as i128),
        _ => None,
    }
}

/// Round extended-precision integers once, to the resolved result type.
fn int_result(scalar: ScalarType, values: Vec<i128>) -> Result<Constant, String> {
    match scalar {
        ScalarType::I32 => Ok(Constant::I32(values.iter().map(|v| *v as i32).collect())),
        ScalarType::I64 => Ok(Constant::I64(values.iter().map(|v| *v as i64).collect())),
        other => Err(format!("expected an integer result type, found {other}")),
    }
}

/// Round extended-precision floats once, to the resolved result type.
fn float_result(scalar: ScalarType, values: Vec<f64>) -> Result<Constant, String> {
    match scalar {
        ScalarType::F32 => Ok(Constant::F32(values.iter().map(|v| *v as f32).collect())),
        ScalarType::F64 => Ok(Constant::F64(values)),
        other => Err(format!("expected a float result type, found {other}")),
    }
}

fn cast_constant(c: &Constant, to: ScalarType) -> Result<Constant, String> {
    if c.scalar_type() == to {
        return Ok(c.clone());
    }
    match to {
        ScalarType::Bool => {
            let values = constant_as_f64(c)?;
            Ok(Constant::Bool(values.iter().map(|v| *v != 0.0).collect()))
        }
        ScalarType::I32 | ScalarType::I64 => {
            let values: Vec<i128> = match c {
                Constant::Bool(v) => v.iter().map(|b| *b as i128).collect(),
                Constant::F32(v) => v.iter().map(|x| *x as i128).collect(),
                Constant::F64(v) => v.iter().map(|x| *x as i128).collect(),
                _ => constant_as_i128(c)?,
            };
            int_result(to, values)
        }
        ScalarType::F32 | ScalarType::F64 => {
            let values: Vec<f64> = match c {
                Constant::Bool(v) => v.iter().map(|b| *b as u8 as f64).collect(),
                _ => constant_as_f64(c)?,
            };
            float_result(to, values)
        }
    }
}

fn gate(value: &Constant, mask: &[bool]) -> Constant {
    match value {
        Constant::I32(v) => Constant::I32(
            v.iter()
                .zip(mask.iter().cycle())
                .map(|(x, m)| if *m { *x } else { 0 })
                .collect(),
        ),
        Constant::I64(v) => Constant::I64(
            v.iter()
                .zip(mask.iter().cycle())
                .map(|(x, m)| if *m { *x } else { 0 })
                .collect(),
        ),
        Constant::F32(v) => Constant::F32(
            v.iter()
                .zip(mask.iter().cycle())
                .map(|(x, m)| if *m { *x } else { 0.0 })
                .collect(),
        ),
        Constant::F64(v) => Constant::F64(
            v.iter()
                .zip(mask.iter().cycle())
                .map(|(x, m)| if *m { *x } else { 0.0 })
                .collect(),
        ),
        Constant::Bool(v) => Constant::Bool(
            v.iter()
                .zip(mask.iter().cycle())
                .map(|(x, m)| *x && *m)
                .collect(),
        ),
    }
}

fn select_elementwise(cond: &[bool], then_v: &Constant, else_v: &Constant) -> Constant {
    macro_rules! pick {
        ($variant:ident, $a:expr, $b:expr) => {
            Constant::$variant(
                cond.iter()
                    .enumerate()
                    .map(|(i, c)| if *c { $a[i] } else { $b[i] })
                    .collect(),
            )
        };
    }
    match (then_v, else_v) {
        (Constant::I32(a), Constant::I32(b)) => pick!(I32, a, b),
        (Constant::I64(a), Constant::I64(b)) => pick!(I64, a, b),
        (Constant::F32(a), Constant::F32(b)) => pick!(F32, a, b),
        (Constant::F64(a), Constant::F64(b)) => pick!(F64, a, b),
        (Constant::Bool(a), Constant::Bool(b)) => pick!(Bool, a, b),
        // Inference guarantees matching operand types.
        (a, _) => a.clone(),
    }
}

fn concat_constants(operands: &[Constant]) -> Result<Constant, String> {
    let first = &operands[0];
    macro_rules! concat {
        ($variant:ident, $extract:path) => {{
            let mut all = Vec::new();
            for operand in operands {
                match operand {
                    Constant::$variant(v) => all.extend(v.iter().cloned()),
                    other => {
                        return Err(format!(
                            "cannot merge {} with {}",
                            first.scalar_type(),
                            other.scalar_type()
                        ))
                    }
                }
            }
            Ok(Constant::$variant(all))
        }};
    }
    match first {
        Constant::I32(_) => concat!(I32, Constant::I32),
        Constant::I64(_) => concat!(I64, Constant::I64),
        Constant::F32(_) => concat!(F32, Constant::F32),
        Constant::F64(_) => concat!(F64, Constant::F64),
        Constant::Bool(_) => concat!(Bool, Constant::Bool),
    }
}

fn slice_constant(c: &Constant, start: u32, end: u32) -> Constant {
    let (start, end) = (start as usize, end as usize);
    match c {
        Constant::I32(v) => Constant::I32(v[start..end].to_vec()),
        Constant::I64(v) => Constant::I64(v[start..end].to_vec()),
        Constant::F32(v) => Constant::F32(v[start..end].to_vec()),
        Constant::F64(v) => Constant::F64(v[start..end].to_vec()),
        Constant::Bool(v) => Constant::Bool(v[start..end].to_vec()),
    }
}

fn zero_extend(c: &Constant, width: u32) -> Constant {
    let width = width as usize;
    macro_rules! extend {
        ($variant:ident, $v:expr, $zero:expr) => {{
            let mut out = $v.clone();
            out.resize(width, $zero);
            Constant::$variant(out)
        }};
    }
    match c {
        Constant::I32(v) => extend!(I32, v, 0),
        Constant::I64(v) => extend!(I64, v, 0),
        Constant::F32(v) => extend!(F32, v, 0.0),
        Constant::F64(v) => extend!(F64, v, 0.0),
        Constant::Bool(v) => extend!(Bool, v, false),
    }
}

// ── Tests ──
