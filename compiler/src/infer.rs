// infer.rs — Shape and rate inference
//
// Two-phase inference over the graph. Phase one resolves every pin's
// (scalar, width) by monotone propagation: forward along edges (joining at
// fan-in pins), backward into unsuffixed literals and other
// context-resolved pins, and through per-kind rules that tie a node's pins
// together. Phase two propagates rates bottom-up. Between the phases the
// inferencer inserts promotion adapters on edges whose source scalar is
// below the pin's joined scalar, and materializes explicit sum/or nodes
// for fan-in pins so the final IR has at most one edge per input pin.
//
// Preconditions: graph built; declared pins (externals, cells, stage
//   outputs, buffers) carry seeded shapes.
// Postconditions: every live pin has a shape and a rate; every edge's
//   endpoint shapes agree; no input pin has more than one incoming edge.
// Failure modes: unresolved shapes, width mismatches, incompatible scalar
//   kinds, bool where numeric required.
// Side effects: mutates the graph (pin shapes/rates, adapter and fan-in
//   nodes, edge rewiring).

use std::collections::HashMap;

use crate::ast::Span;
use crate::diag::{codes, Diagnostic};
use crate::graph::{
    BinOp, Bundle, Graph, LitValue, NodeKind, Pin, PinRef, UnOp,
};
use crate::id::NodeId;
use crate::registry::{Rate, ScalarType, Shape};
use crate::resolve::ResolvedProgram;

// ── Promotion lattice ───────────────────────────────────────────────────────

/// `i32 ≤ i64`, `f32 ≤ f64`. Integers never promote to floats implicitly,
/// and bool never promotes at all.
pub fn can_promote(from: ScalarType, to: ScalarType) -> bool {
    from == to
        || matches!(
            (from, to),
            (ScalarType::I32, ScalarType::I64) | (ScalarType::F32, ScalarType::F64)
        )
}

/// Least upper bound within a family, if one exists.
pub fn join(a: ScalarType, b: ScalarType) -> Option<ScalarType> {
    if can_promote(a, b) {
        Some(b)
    } else if can_promote(b, a) {
        Some(a)
    } else {
        None
    }
}

// ── Scalar family masks ─────────────────────────────────────────────────────

/// A set of admissible scalar types for a pin, kept as a bitmask. Shrinks
/// monotonically; reaching a singleton resolves the pin's scalar, reaching
/// empty is a kind error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Mask(u8);

impl Mask {
    const I32: u8 = 1 << 0;
    const I64: u8 = 1 << 1;
    const F32: u8 = 1 << 2;
    const F64: u8 = 1 << 3;
    const BOOL: u8 = 1 << 4;

    const ANY: Mask = Mask(Self::I32 | Self::I64 | Self::F32 | Self::F64 | Self::BOOL);
    const NUMERIC: Mask = Mask(Self::I32 | Self::I64 | Self::F32 | Self::F64);
    const FLOAT: Mask = Mask(Self::F32 | Self::F64);
    const INTEGRAL: Mask = Mask(Self::I32 | Self::I64);
    const INT_OR_BOOL: Mask = Mask(Self::I32 | Self::I64 | Self::BOOL);
    const ONLY_BOOL: Mask = Mask(Self::BOOL);

    fn bit(scalar: ScalarType) -> u8 {
        match scalar {
            ScalarType::I32 => Self::I32,
            ScalarType::I64 => Self::I64,
            ScalarType::F32 => Self::F32,
            ScalarType::F64 => Self::F64,
            ScalarType::Bool => Self::BOOL,
        }
    }

    fn allows(self, scalar: ScalarType) -> bool {
        self.0 & Self::bit(scalar) != 0
    }

    fn singleton(self) -> Option<ScalarType> {
        match self.0 {
            x if x == Self::I32 => Some(ScalarType::I32),
            x if x == Self::I64 => Some(ScalarType::I64),
            x if x == Self::F32 => Some(ScalarType::F32),
            x if x == Self::F64 => Some(ScalarType::F64),
            x if x == Self::BOOL => Some(ScalarType::Bool),
            _ => None,
        }
    }

    fn describe(self) -> &'static str {
        match self {
            Mask::NUMERIC => "a numeric type",
            Mask::FLOAT => "a float type",
            Mask::INTEGRAL => "an integer type",
            Mask::INT_OR_BOOL => "an integer or bool type",
            Mask::ONLY_BOOL => "bool",
            _ => "a value type",
        }
    }
}

/// Bool in a numeric position gets its own error class; other scalar
/// clashes report as generic kind mismatches.
fn mismatch_code(found: ScalarType) -> crate::diag::DiagCode {
    if found.is_bool() {
        codes::SHAPE_BOOL_OPERAND
    } else {
        codes::SHAPE_SCALAR_MISMATCH
    }
}

// ── Inference engine ────────────────────────────────────────────────────────

/// Result of inference. The graph is mutated in place.
#[derive(Debug)]
pub struct InferResult {
    pub diagnostics: Vec<Diagnostic>,
}

/// Run shape and rate inference over the graph.
pub fn infer(graph: &mut Graph, resolved: &ResolvedProgram) -> InferResult {
    let mut engine = Engine::new(graph);
    engine.seed();
    engine.run_fixpoint();
    engine.apply_context_defaults();
    engine.check_resolved();
    engine.check_width_ops();
    if !engine.failed() {
        engine.insert_promotions();
        engine.write_back_shapes();
        engine.materialize_fan_in();
        engine.assign_rates(resolved);
    }
    InferResult {
        diagnostics: engine.diagnostics,
    }
}

/// Flat slot addressing: each live pin gets one slot for its scalar and
/// width working state.
struct Engine<'g> {
    graph: &'g mut Graph,
    in_offset: Vec<usize>,
    out_offset: Vec<usize>,
    scalar: Vec<Option<ScalarType>>,
    width: Vec<Option<u32>>,
    mask: Vec<Mask>,
    /// Declared pins reject promotion past their seeded scalar.
    hard: Vec<bool>,
    poisoned: Vec<bool>,
    diagnostics: Vec<Diagnostic>,
    changed: bool,
}

impl<'g> Engine<'g> {
    fn new(graph: &'g mut Graph) -> Engine<'g> {
        let mut in_offset = Vec::with_capacity(graph.nodes.len());
        let mut out_offset = Vec::with_capacity(graph.nodes.len());
        let mut total = 0usize;
        for node in &graph.nodes {
            in_offset.push(total);
            total += node.inputs.len();
            out_offset.push(total);
            total += node.outputs.len();
        }
        Engine {
            graph,
            in_offset,
            out_offset,
            scalar: vec![None; total],
            width: vec![None; total],
            mask: vec![Mask::ANY; total],
            hard: vec![false; total],
            poisoned: vec![false; total],
            diagnostics: Vec::new(),
            changed: false,
        }
    }

    fn failed(&self) -> bool {
        crate::diag::has_errors(&self.diagnostics)
    }

    fn in_slot(&self, node: NodeId, pin: usize) -> usize {
        self.in_offset[node.0 as usize] + pin
    }

    fn out_slot(&self, node: NodeId, pin: usize) -> usize {
        self.out_offset[node.0 as usize] + pin
    }

    fn node_span(&self, node: NodeId) -> Span {
        self.graph
            .node(node)
            .span
            .unwrap_or_else(|| (0..0).into())
    }

    // ── Slot operations ──

    fn error(&mut self, code: crate::diag::DiagCode, span: Span, message: impl Into<String>) {
        self.diagnostics.push(Diagnostic::error(code, span, message));
    }

    /// Shrink a slot's admissible-family mask.
    fn constrain(&mut self, slot: usize, mask: Mask, span: Span) {
        if self.poisoned[slot] {
            return;
        }
        if let Some(current) = self.scalar[slot] {
            if !mask.allows(current) {
                self.poisoned[slot] = true;
                self.error(
                    mismatch_code(current),
                    span,
                    format!("expected {}, found {current}", mask.describe()),
                );
            }
            return;
        }
        let next = Mask(self.mask[slot].0 & mask.0);
        if next == self.mask[slot] {
            return;
        }
        if next.0 == 0 {
            self.poisoned[slot] = true;
            self.error(
                codes::SHAPE_SCALAR_MISMATCH,
                span,
                "conflicting type requirements on this value",
            );
            return;
        }
        self.mask[slot] = next;
        self.changed = true;
        if let Some(only) = next.singleton() {
            self.scalar[slot] = Some(only);
        }
    }

    /// Raise a slot's scalar toward the join of itself and `scalar`.
    /// At hard (declared) slots the incoming scalar must promote into the
    /// declaration instead.
    fn grow(&mut self, slot: usize, scalar: ScalarType, span: Span) {
        if self.poisoned[slot] {
            return;
        }
        if !self.mask[slot].allows(scalar) && self.scalar[slot].is_none() {
            self.poisoned[slot] = true;
            self.error(
                mismatch_code(scalar),
                span,
                format!("expected {}, found {scalar}", self.mask[slot].describe()),
            );
            return;
        }
        match self.scalar[slot] {
            None => {
                self.scalar[slot] = Some(scalar);
                self.changed = true;
            }
            Some(current) if current == scalar => {}
            Some(current) => {
                if self.hard[slot] {
                    if !can_promote(scalar, current) {
                        self.poisoned[slot] = true;
                        self.error(
                            codes::SHAPE_SCALAR_MISMATCH,
                            span,
                            format!("cannot carry {scalar} on a pin declared {current}"),
                        );
                    }
                    return;
                }
                match join(current, scalar) {
                    Some(joined) if joined != current => {
                        if !self.mask[slot].allows(joined) {
                            self.poisoned[slot] = true;
                            self.error(
                                codes::SHAPE_SCALAR_MISMATCH,
                                span,
                                format!(
                                    "expected {}, found {joined}",
                                    self.mask[slot].describe()
                                ),
                            );
                            return;
                        }
                        self.scalar[slot] = Some(joined);
                        self.changed = true;
                    }
                    Some(_) => {}
                    None => {
                        self.poisoned[slot] = true;
                        self.error(
                            codes::SHAPE_SCALAR_MISMATCH,
                            span,
                            format!(
                                "incompatible scalar types {current} and {scalar} \
                                 (insert an explicit conversion)"
                            ),
                        );
                    }
                }
            }
        }
    }

    /// Fill a slot's scalar only if unknown (context resolution — never
    /// retypes an already-known source).
    fn fill(&mut self, slot: usize, scalar: ScalarType, span: Span) {
        if self.poisoned[slot] || self.scalar[slot].is_some() {
            return;
        }
        if !self.mask[slot].allows(scalar) {
            // Context demands a type this value can never be; e.g. a float
            // literal flowing into an integer pin.
            self.poisoned[slot] = true;
            self.error(
                mismatch_code(scalar),
                span,
                format!("expected {}, found {scalar}", self.mask[slot].describe()),
            );
            return;
        }
        self.scalar[slot] = Some(scalar);
        self.changed = true;
    }

    /// Widths have no lattice: setting a different known width is an error.
    fn set_width(&mut self, slot: usize, width: u32, span: Span) {
        if self.poisoned[slot] {
            return;
        }
        match self.width[slot] {
            None => {
                self.width[slot] = Some(width);
                self.changed = true;
            }
            Some(current) if current == width => {}
            Some(current) => {
                self.poisoned[slot] = true;
                self.error(
                    codes::SHAPE_WIDTH_MISMATCH,
                    span,
                    format!(
                        "channel width mismatch: {current} vs {width} \
                         (use broadcast, truncate, merge, split, or slice)"
                    ),
                );
            }
        }
    }

    /// Tie two slots' scalars: both end at the join of what is known.
    fn tie_scalar(&mut self, a: usize, b: usize, span: Span) {
        if let Some(s) = self.scalar[a] {
            self.grow(b, s, span);
        }
        if let Some(s) = self.scalar[b] {
            self.grow(a, s, span);
        }
    }

    fn tie_width(&mut self, a: usize, b: usize, span: Span) {
        if let Some(w) = self.width[a] {
            self.set_width(b, w, span);
        }
        if let Some(w) = self.width[b] {
            self.set_width(a, w, span);
        }
    }

    // ── Seeding ──

    /// Seed slots from builder-declared pin shapes; these are hard.
    fn seed(&mut self) {
        let mut seeds: Vec<(usize, Shape)> = Vec::new();
        for node in self.graph.live_nodes() {
            for (pin_index, pin) in node.inputs.pins.iter().enumerate() {
                if let Some(shape) = pin.shape {
                    seeds.push((self.in_slot(node.id, pin_index), shape));
                }
            }
            for (pin_index, pin) in node.outputs.pins.iter().enumerate() {
                if let Some(shape) = pin.shape {
                    seeds.push((self.out_slot(node.id, pin_index), shape));
                }
            }
        }
        for (slot, shape) in seeds {
            self.scalar[slot] = Some(shape.scalar);
            self.width[slot] = Some(shape.width);
            self.hard[slot] = true;
        }
    }

    // ── Fixpoint ──

    fn run_fixpoint(&mut self) {
        loop {
            self.changed = false;
            self.propagate_edges();
            self.apply_node_rules();
            if !self.changed {
                break;
            }
        }
    }

    /// Pins that still carry no scalar after the fixpoint but sit in a
    /// position with a natural default: a conversion node's input adopts
    /// its target (so `1 + 1 -> f32` resolves), and a capacity fed only by
    /// untyped literals becomes i64. Typed values are never overridden —
    /// the validator judges capacities by rate, the folder by value.
    fn apply_context_defaults(&mut self) {
        let defaults: Vec<(NodeId, ScalarType)> = self
            .graph
            .live_nodes()
            .filter_map(|n| match &n.kind {
                NodeKind::Cast { to } => Some((n.id, *to)),
                NodeKind::BufferCap { .. } => Some((n.id, ScalarType::I64)),
                _ => None,
            })
            .collect();
        let mut filled = false;
        for (id, scalar) in defaults {
            let slot = self.in_slot(id, 0);
            if self.scalar[slot].is_none() && !self.poisoned[slot] {
                let span = self.node_span(id);
                self.fill(slot, scalar, span);
                filled = true;
            }
        }
        if filled {
            self.run_fixpoint();
        }
    }

    fn propagate_edges(&mut self) {
        let edges: Vec<(PinRef, PinRef, Option<Span>)> = self
            .graph
            .edges
            .iter()
            .map(|e| (e.src, e.dst, e.span))
            .collect();
        for (src, dst, span) in edges {
            let span = span.unwrap_or_else(|| self.node_span(dst.node));
            let src_slot = self.out_slot(src.node, src.pin);
            let dst_slot = self.in_slot(dst.node, dst.pin);

            if let Some(s) = self.scalar[src_slot] {
                self.grow(dst_slot, s, span);
            } else if let Some(s) = self.scalar[dst_slot] {
                self.fill(src_slot, s, span);
            }

            if let Some(w) = self.width[src_slot] {
                self.set_width(dst_slot, w, span);
            } else if let Some(w) = self.width[dst_slot] {
                self.set_width(src_slot, w, span);
            }
        }
    }

    fn apply_node_rules(&mut self) {
        for index in 0..self.graph.nodes.len() {
            if self.graph.nodes[index].dead {
                continue;
            }
            let id = NodeId(index as u32);
            let kind = self.graph.nodes[index].kind.clone();
            let span = self.node_span(id);
            self.node_rule(id, &kind, span);
        }
    }

    fn node_rule(&mut self, id: NodeId, kind: &NodeKind, span: Span) {
        match kind {
            NodeKind::Literal { value } => {
                let out = self.out_slot(id, 0);
                self.set_width(out, 1, span);
                match value {
                    LitValue::Typed(_) => {}
                    LitValue::UntypedInt(_) => self.constrain(out, Mask::NUMERIC, span),
                    LitValue::UntypedFloat(_) => self.constrain(out, Mask::FLOAT, span),
                }
            }
            NodeKind::Bin { op } => self.binary_rule(id, *op, span),
            NodeKind::Un { op } => {
                let input = self.in_slot(id, 0);
                let out = self.out_slot(id, 0);
                let mask = match op {
                    UnOp::Neg => Mask::NUMERIC,
                    UnOp::Not => Mask::ONLY_BOOL,
                    UnOp::BitNot => Mask::INT_OR_BOOL,
                };
                self.constrain(input, mask, span);
                self.constrain(out, mask, span);
                self.tie_scalar(input, out, span);
                self.tie_width(input, out, span);
            }
            NodeKind::Cast { to } => {
                // The input scalar is free: any source converts. Untyped
                // operands pick up the target after the fixpoint.
                let input = self.in_slot(id, 0);
                let out = self.out_slot(id, 0);
                self.grow(out, *to, span);
                self.tie_width(input, out, span);
            }
            NodeKind::Broadcast | NodeKind::Truncate => {
                let input = self.in_slot(id, 0);
                let out = self.out_slot(id, 0);
                // Widths deliberately untied; the strict inequality is
                // checked after resolution.
                self.tie_scalar(input, out, span);
            }
            NodeKind::Merge => {
                let out = self.out_slot(id, 0);
                let pins = self.graph.node(id).inputs.len();
                for pin in 0..pins {
                    let input = self.in_slot(id, pin);
                    self.tie_scalar(input, out, span);
                }
                let widths: Option<Vec<u32>> = (0..pins)
                    .map(|pin| self.width[self.in_slot(id, pin)])
                    .collect();
                if let Some(widths) = widths {
                    self.set_width(out, widths.iter().sum(), span);
                }
            }
            NodeKind::Split { widths } => {
                let input = self.in_slot(id, 0);
                let total: u32 = widths.iter().sum();
                self.set_width(input, total, span);
                let widths = widths.clone();
                for (pin, width) in widths.iter().enumerate() {
                    let out = self.out_slot(id, pin);
                    self.set_width(out, *width, span);
                    self.tie_scalar(input, out, span);
                }
            }
            NodeKind::Slice { start, end } => {
                let input = self.in_slot(id, 0);
                let out = self.out_slot(id, 0);
                self.tie_scalar(input, out, span);
                if let Some(in_width) = self.width[input] {
                    let upper = end.unwrap_or(in_width);
                    if *start < upper && upper <= in_width {
                        self.set_width(out, upper - start, span);
                    }
                    // Out-of-range bounds are reported by check_width_ops.
                }
            }
            NodeKind::IfSelect => {
                let cond = self.in_slot(id, 0);
                let then_slot = self.in_slot(id, 1);
                let else_slot = self.in_slot(id, 2);
                let out = self.out_slot(id, 0);
                self.constrain(cond, Mask::ONLY_BOOL, span);
                self.tie_scalar(then_slot, out, span);
                self.tie_scalar(else_slot, out, span);
                self.tie_scalar(then_slot, else_slot, span);
                for slot in [then_slot, else_slot, cond] {
                    self.tie_width(slot, out, span);
                }
            }
            NodeKind::Select => {
                // The index normalizes to i64; narrower integer sources
                // get a promotion adapter.
                let index_slot = self.in_slot(id, 0);
                self.grow(index_slot, ScalarType::I64, span);
                self.set_width(index_slot, 1, span);
                let out = self.out_slot(id, 0);
                let pins = self.graph.node(id).inputs.len();
                for pin in 1..pins {
                    let input = self.in_slot(id, pin);
                    self.tie_scalar(input, out, span);
                    self.tie_width(input, out, span);
                }
            }
            NodeKind::MathFn { .. } => {
                let input = self.in_slot(id, 0);
                let out = self.out_slot(id, 0);
                self.constrain(input, Mask::FLOAT, span);
                self.constrain(out, Mask::FLOAT, span);
                self.tie_scalar(input, out, span);
                self.tie_width(input, out, span);
            }
            NodeKind::Clamp => {
                let out = self.out_slot(id, 0);
                self.constrain(out, Mask::NUMERIC, span);
                for pin in 0..3 {
                    let input = self.in_slot(id, pin);
                    self.constrain(input, Mask::NUMERIC, span);
                    self.tie_scalar(input, out, span);
                    self.tie_width(input, out, span);
                }
            }
            NodeKind::Biquad { .. } => {
                let input = self.in_slot(id, 0);
                let freq = self.in_slot(id, 1);
                let q = self.in_slot(id, 2);
                let out = self.out_slot(id, 0);
                for slot in [input, freq, q, out] {
                    self.constrain(slot, Mask::FLOAT, span);
                }
                self.tie_scalar(input, out, span);
                self.tie_scalar(input, freq, span);
                self.tie_scalar(input, q, span);
                self.tie_width(input, out, span);
                self.set_width(freq, 1, span);
                self.set_width(q, 1, span);
            }
            NodeKind::DelayRead { .. } => {
                // Delays are integer scalars, normalized to i64.
                let delay = self.in_slot(id, 0);
                self.grow(delay, ScalarType::I64, span);
                self.set_width(delay, 1, span);
            }
            NodeKind::BufferCap { .. } => {
                // Deliberately no scalar constraint: a signal-driven
                // capacity must surface as a rate violation, not a type
                // clash. Unconstrained capacities default to i64 after the
                // fixpoint.
                let cap = self.in_slot(id, 0);
                self.set_width(cap, 1, span);
            }
            NodeKind::Sr | NodeKind::Clock => {
                let out = self.out_slot(id, 0);
                self.grow(out, ScalarType::I64, span);
                self.set_width(out, 1, span);
            }
            // Seeded or shape-free kinds: externals, stage outputs, cells,
            // delay writes, discards. Edges do the rest.
            NodeKind::ReadInput { .. }
            | NodeKind::ReadProperty { .. }
            | NodeKind::WriteOutput { .. }
            | NodeKind::StageOutput { .. }
            | NodeKind::Cell { .. }
            | NodeKind::DelayWrite { .. }
            | NodeKind::Discard
            | NodeKind::Xoroshiro { .. }
            | NodeKind::Sum
            | NodeKind::OrJoin => {}
        }
    }

    fn binary_rule(&mut self, id: NodeId, op: BinOp, span: Span) {
        let lhs = self.in_slot(id, 0);
        let rhs = self.in_slot(id, 1);
        let out = self.out_slot(id, 0);

        // Widths agree across all binary forms except the shift count.
        if op.is_shift() {
            self.set_width(rhs, 1, span);
            self.tie_width(lhs, out, span);
        } else {
            self.tie_width(lhs, out, span);
            self.tie_width(rhs, out, span);
        }

        match op {
            BinOp::Add
            | BinOp::Sub
            | BinOp::Mul
            | BinOp::Div
            | BinOp::Rem
            | BinOp::Min
            | BinOp::Max => {
                for slot in [lhs, rhs, out] {
                    self.constrain(slot, Mask::NUMERIC, span);
                }
                self.tie_scalar(lhs, rhs, span);
                self.tie_scalar(lhs, out, span);
                self.tie_scalar(rhs, out, span);
            }
            BinOp::Pow => {
                // The exponent may stay integral when the base is a float.
                self.constrain(lhs, Mask::FLOAT, span);
                self.constrain(out, Mask::FLOAT, span);
                self.constrain(rhs, Mask::NUMERIC, span);
                self.tie_scalar(lhs, out, span);
                if let Some(base) = self.scalar[lhs] {
                    self.fill(rhs, base, span);
                }
            }
            BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge | BinOp::Eq | BinOp::Ne => {
                for slot in [lhs, rhs] {
                    self.constrain(slot, Mask::NUMERIC, span);
                }
                self.tie_scalar(lhs, rhs, span);
                self.grow(out, ScalarType::Bool, span);
            }
            BinOp::Shl | BinOp::Shr => {
                self.constrain(lhs, Mask::INTEGRAL, span);
                self.constrain(rhs, Mask::INTEGRAL, span);
                self.constrain(out, Mask::INTEGRAL, span);
                self.tie_scalar(lhs, out, span);
                // An untyped shift count adopts the value's type.
                if let Some(s) = self.scalar[lhs] {
                    self.fill(rhs, s, span);
                }
            }
            BinOp::BitAnd => self.bitand_rule(lhs, rhs, out, span),
            BinOp::BitXor | BinOp::BitOr => {
                for slot in [lhs, rhs, out] {
                    self.constrain(slot, Mask::INT_OR_BOOL, span);
                }
                self.tie_scalar(lhs, rhs, span);
                self.tie_scalar(lhs, out, span);
                self.tie_scalar(rhs, out, span);
            }
        }
    }

    /// `&` is bitwise on matching integer/bool operands, and additionally
    /// accepts `(T, bool)` as a gate: "T or zero-of-T". The form is decided
    /// once both operand scalars are known.
    fn bitand_rule(&mut self, lhs: usize, rhs: usize, out: usize, span: Span) {
        match (self.scalar[lhs], self.scalar[rhs]) {
            (Some(a), Some(b)) => {
                let gate_side = match (a.is_bool(), b.is_bool()) {
                    (false, true) => Some(lhs),
                    (true, false) => Some(rhs),
                    _ => None,
                };
                match gate_side {
                    Some(value_side) => {
                        self.constrain(value_side, Mask::NUMERIC, span);
                        self.tie_scalar(value_side, out, span);
                    }
                    None => {
                        for slot in [lhs, rhs, out] {
                            self.constrain(slot, Mask::INT_OR_BOOL, span);
                        }
                        self.tie_scalar(lhs, rhs, span);
                        self.tie_scalar(lhs, out, span);
                    }
                }
            }
            _ => {
                // Underdetermined; wait for the operands. Widths were
                // already tied by the caller.
            }
        }
    }

    // ── Post-fixpoint checks ──

    fn check_resolved(&mut self) {
        for node in self.graph.live_nodes() {
            let id = node.id;
            let span = node.span.unwrap_or_else(|| (0..0).into());
            let mut unresolved = Vec::new();
            for pin in 0..node.inputs.len() {
                let slot = self.in_slot(id, pin);
                if !self.poisoned[slot]
                    && (self.scalar[slot].is_none() || self.width[slot].is_none())
                {
                    unresolved.push(slot);
                }
            }
            for pin in 0..node.outputs.len() {
                let slot = self.out_slot(id, pin);
                if !self.poisoned[slot]
                    && (self.scalar[slot].is_none() || self.width[slot].is_none())
                {
                    unresolved.push(slot);
                }
            }
            if !unresolved.is_empty() {
                self.diagnostics.push(
                    Diagnostic::error(
                        codes::SHAPE_UNRESOLVED,
                        span,
                        "the type of this value could not be resolved from context",
                    )
                    .with_hint("add a type suffix or an explicit conversion"),
                );
                // One report per node is enough.
            }
        }
    }

    /// Width-adapter legality: broadcast strictly widens, truncate strictly
    /// narrows, slice bounds stay inside the input.
    fn check_width_ops(&mut self) {
        let mut reports: Vec<(crate::diag::DiagCode, Span, String)> = Vec::new();
        for node in self.graph.live_nodes() {
            let id = node.id;
            let span = node.span.unwrap_or_else(|| (0..0).into());
            match &node.kind {
                NodeKind::Broadcast => {
                    let (input, out) = (self.in_slot(id, 0), self.out_slot(id, 0));
                    if let (Some(iw), Some(ow)) = (self.width[input], self.width[out]) {
                        if ow <= iw {
                            reports.push((
                                codes::SHAPE_WIDTH_MISMATCH,
                                span,
                                format!("broadcast must widen: input has {iw} channels, destination {ow}"),
                            ));
                        }
                    }
                }
                NodeKind::Truncate => {
                    let (input, out) = (self.in_slot(id, 0), self.out_slot(id, 0));
                    if let (Some(iw), Some(ow)) = (self.width[input], self.width[out]) {
                        if ow >= iw {
                            reports.push((
                                codes::SHAPE_WIDTH_MISMATCH,
                                span,
                                format!("truncate must narrow: input has {iw} channels, destination {ow}"),
                            ));
                        }
                    }
                }
                NodeKind::Slice { start, end } => {
                    let input = self.in_slot(id, 0);
                    if let Some(iw) = self.width[input] {
                        let upper = end.unwrap_or(iw);
                        if *start >= upper || upper > iw {
                            reports.push((
                                codes::STRUCT_BAD_SLICE,
                                span,
                                format!(
                                    "slice [{start}, {upper}) is outside the input's {iw} channels"
                                ),
                            ));
                        }
                    }
                }
                _ => {}
            }
        }
        for (code, span, message) in reports {
            self.error(code, span, message);
        }
    }

    // ── Promotion adapters ──

    /// Insert a conversion node on every edge whose source scalar sits
    /// below the destination pin's joined scalar.
    fn insert_promotions(&mut self) {
        let mut pending: Vec<usize> = Vec::new();
        for (index, edge) in self.graph.edges.iter().enumerate() {
            let src_slot = self.out_slot(edge.src.node, edge.src.pin);
            let dst_slot = self.in_slot(edge.dst.node, edge.dst.pin);
            if let (Some(from), Some(to)) = (self.scalar[src_slot], self.scalar[dst_slot]) {
                if from != to && can_promote(from, to) {
                    pending.push(index);
                }
            }
        }

        for index in pending {
            let edge = self.graph.edges[index].clone();
            let src_slot = self.out_slot(edge.src.node, edge.src.pin);
            let dst_slot = self.in_slot(edge.dst.node, edge.dst.pin);
            let from = self.scalar[src_slot].expect("checked above");
            let to = self.scalar[dst_slot].expect("checked above");
            let width = self.width[src_slot].expect("resolved before promotion");
            let stage = self.graph.node(edge.dst.node).stage;

            let mut inputs = Bundle::new();
            inputs.push(Pin::unnamed().with_shape(Shape::new(from, width)));
            let mut outputs = Bundle::new();
            outputs.push(Pin::unnamed().with_shape(Shape::new(to, width)));
            let cast =
                self.graph
                    .add_node(NodeKind::Cast { to }, stage, inputs, outputs, edge.span);

            self.graph.edges[index].dst = PinRef { node: cast, pin: 0 };
            self.graph
                .connect(PinRef { node: cast, pin: 0 }, edge.dst, edge.span);
        }
    }

    // ── Write-back ──

    fn write_back_shapes(&mut self) {
        let mut updates: Vec<(NodeId, bool, usize, Shape)> = Vec::new();
        for node in self.graph.live_nodes() {
            // Adapter nodes added after slot allocation carry their shapes
            // already.
            if node.id.0 as usize >= self.in_offset.len() {
                continue;
            }
            for pin in 0..node.inputs.len() {
                let slot = self.in_slot(node.id, pin);
                if let (Some(s), Some(w)) = (self.scalar[slot], self.width[slot]) {
                    updates.push((node.id, true, pin, Shape::new(s, w)));
                }
            }
            for pin in 0..node.outputs.len() {
                let slot = self.out_slot(node.id, pin);
                if let (Some(s), Some(w)) = (self.scalar[slot], self.width[slot]) {
                    updates.push((node.id, false, pin, Shape::new(s, w)));
                }
            }
        }
        for (id, is_input, pin, shape) in updates {
            let node = self.graph.node_mut(id);
            let bundle = if is_input {
                &mut node.inputs
            } else {
                &mut node.outputs
            };
            bundle.pins[pin].shape = Some(shape);
        }
    }

    // ── Fan-in materialization ──

    /// Replace every multi-edge input pin with an explicit n-ary sum node
    /// (or, for bool pins, an or node). Operands are ordered by source id,
    /// so any rewiring order produces the same IR.
    fn materialize_fan_in(&mut self) {
        let mut fan_ins: HashMap<PinRef, Vec<usize>> = HashMap::new();
        for (index, edge) in self.graph.edges.iter().enumerate() {
            fan_ins.entry(edge.dst).or_default().push(index);
        }
        // Deterministic join-node creation order.
        let mut fan_ins: Vec<(PinRef, Vec<usize>)> = fan_ins.into_iter().collect();
        fan_ins.sort_by_key(|(dst, _)| (dst.node, dst.pin));

        for (dst, mut edge_indices) in fan_ins {
            if edge_indices.len() < 2 {
                continue;
            }
            let dst_node = self.graph.node(dst.node);
            let shape = dst_node.inputs.pins[dst.pin]
                .shape
                .expect("fan-in pins are resolved before materialization");
            let stage = dst_node.stage;
            let span = dst_node.span;

            edge_indices.sort_by_key(|&index| {
                let src = self.graph.edges[index].src;
                (src.node, src.pin)
            });

            let kind = if shape.scalar.is_bool() {
                NodeKind::OrJoin
            } else {
                NodeKind::Sum
            };
            let mut inputs = Bundle::new();
            for _ in 0..edge_indices.len() {
                inputs.push(Pin::unnamed().with_shape(shape));
            }
            let mut outputs = Bundle::new();
            outputs.push(Pin::unnamed().with_shape(shape));
            let join_node = self.graph.add_node(kind, stage, inputs, outputs, span);

            for (operand, edge_index) in edge_indices.into_iter().enumerate() {
                self.graph.edges[edge_index].dst = PinRef {
                    node: join_node,
                    pin: operand,
                };
            }
            self.graph.connect(
                PinRef {
                    node: join_node,
                    pin: 0,
                },
                dst,
                span,
            );
        }
    }

    // ── Rates ──

    /// Bottom-up rate propagation: a pin's rate is the max of its sources,
    /// a node's output rate is the max of its input rates unless the kind
    /// overrides. Cell outputs are fixed S-rate, so the excluded back-edges
    /// cannot influence anything; cell input rates are filled in a final
    /// sweep once every source is rated.
    fn assign_rates(&mut self, resolved: &ResolvedProgram) {
        let order = match self.graph.topo_order() {
            Ok(order) => order,
            // Cycles are the validator's to report; rates stay unset.
            Err(_) => return,
        };

        let mut out_rates: HashMap<PinRef, Rate> = HashMap::new();
        for id in &order {
            let node = self.graph.node(*id);
            let mut input_rates = Vec::with_capacity(node.inputs.len());
            for pin in 0..node.inputs.len() {
                let dst = PinRef { node: *id, pin };
                let rate = self
                    .graph
                    .edges_into(dst)
                    .map(|e| out_rates.get(&e.src).copied().unwrap_or(Rate::Constant))
                    .max()
                    .unwrap_or(Rate::Constant);
                input_rates.push(rate);
            }
            let derived = input_rates.iter().copied().max().unwrap_or(Rate::Constant);
            let out_rate = match &node.kind {
                NodeKind::Literal { .. } | NodeKind::Sr => Rate::Constant,
                NodeKind::ReadInput { .. } => Rate::Sample,
                NodeKind::ReadProperty { index } => resolved.external.properties[*index].rate,
                NodeKind::StageOutput { .. }
                | NodeKind::Cell { .. }
                | NodeKind::DelayRead { .. }
                | NodeKind::Xoroshiro { .. }
                | NodeKind::Biquad { .. }
                | NodeKind::Clock => Rate::Sample,
                _ => derived,
            };

            let id = *id;
            let node = self.graph.node_mut(id);
            for (pin, rate) in input_rates.iter().enumerate() {
                node.inputs.pins[pin].rate = Some(*rate);
            }
            for pin in 0..node.outputs.len() {
                node.outputs.pins[pin].rate = Some(out_rate);
                out_rates.insert(PinRef { node: id, pin }, out_rate);
            }
        }

        // Cell `end` pins sit behind back-edges; everything feeding them is
        // rated by now.
        let cell_inputs: Vec<(NodeId, Rate)> = self
            .graph
            .live_nodes()
            .filter(|n| matches!(n.kind, NodeKind::Cell { .. }))
            .map(|n| {
                let rate = self
                    .graph
                    .edges_into(PinRef { node: n.id, pin: 0 })
                    .map(|e| out_rates.get(&e.src).copied().unwrap_or(Rate::Constant))
                    .max()
                    .unwrap_or(Rate::Constant);
                (n.id, rate)
            })
            .collect();
        for (id, rate) in cell_inputs {
            self.graph.node_mut(id).inputs.pins[0].rate = Some(rate);
        }
    }
}

// ── Tests ──
