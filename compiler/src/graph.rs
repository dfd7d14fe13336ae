// graph.rs — Graph IR and construction for Waveling programs
//
// Defines the graph intermediate representation (nodes with pin bundles,
// flat edges, stages, buffers) and the builder that lowers resolved AST
// statements and routing expressions into it. Nodes are built eagerly as
// expressions are reduced; fan-in is kept as parallel edges until the
// inferencer materializes explicit sum/or nodes.
//
// Preconditions: `program` is a parsed AST; `resolved` has passed name
//                resolution without errors.
// Postconditions: returns a `Graph` where every routing statement is an
//                 edge set, every unconsumed value output feeds a discard
//                 sink, and stage/buffer tables are populated.
// Failure modes: bad routing operands, bad built-in arguments, unknown
//                bundle pins → `Diagnostic` errors.
// Side effects: none.

use std::collections::HashMap;
use std::fmt;

use crate::ast::{self, BinaryOp, BundleEntry, Expr, ExprKind, Path, Span, Stmt, StmtKind, UnaryOp};
use crate::diag::{codes, Diagnostic};
use crate::id::{BufferId, EdgeId, IdAllocator, NodeId, StageId};
use crate::lexer::{NumLit, NumSuffix, NumValue};
use crate::registry::{Builtin, BuiltinFn, Rate, Registry, ScalarType, Shape};
use crate::resolve::{NameTarget, ResolvedProgram};

// ── Constants ───────────────────────────────────────────────────────────────

/// A constant vector value carried by literal nodes.
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    I32(Vec<i32>),
    I64(Vec<i64>),
    F32(Vec<f32>),
    F64(Vec<f64>),
    Bool(Vec<bool>),
}

impl Constant {
    pub fn scalar_type(&self) -> ScalarType {
        match self {
            Constant::I32(_) => ScalarType::I32,
            Constant::I64(_) => ScalarType::I64,
            Constant::F32(_) => ScalarType::F32,
            Constant::F64(_) => ScalarType::F64,
            Constant::Bool(_) => ScalarType::Bool,
        }
    }

    pub fn width(&self) -> u32 {
        let w = match self {
            Constant::I32(v) => v.len(),
            Constant::I64(v) => v.len(),
            Constant::F32(v) => v.len(),
            Constant::F64(v) => v.len(),
            Constant::Bool(v) => v.len(),
        };
        w as u32
    }

    pub fn shape(&self) -> Shape {
        Shape::new(self.scalar_type(), self.width())
    }
}

/// Payload of a literal node. Unsuffixed literals stay untyped until the
/// inferencer resolves their scalar from context.
#[derive(Debug, Clone, PartialEq)]
pub enum LitValue {
    Typed(Constant),
    UntypedInt(i128),
    UntypedFloat(f64),
}

impl LitValue {
    pub fn from_num(num: NumLit) -> LitValue {
        match (num.value, num.suffix) {
            (NumValue::Int(v), None) => LitValue::UntypedInt(v),
            (NumValue::Float(v), None) => LitValue::UntypedFloat(v),
            (NumValue::Int(v), Some(NumSuffix::I32)) => {
                LitValue::Typed(Constant::I32(vec![v as i32]))
            }
            (NumValue::Int(v), Some(NumSuffix::I64)) => {
                LitValue::Typed(Constant::I64(vec![v as i64]))
            }
            (NumValue::Int(v), Some(NumSuffix::F32)) => {
                LitValue::Typed(Constant::F32(vec![v as f32]))
            }
            (NumValue::Int(v), Some(NumSuffix::F64)) => {
                LitValue::Typed(Constant::F64(vec![v as f64]))
            }
            (NumValue::Float(v), Some(NumSuffix::F32)) => {
                LitValue::Typed(Constant::F32(vec![v as f32]))
            }
            (NumValue::Float(v), Some(NumSuffix::F64)) => {
                LitValue::Typed(Constant::F64(vec![v]))
            }
            // The lexer rejects integer suffixes on fractional literals.
            (NumValue::Float(v), Some(_)) => LitValue::UntypedFloat(v),
        }
    }
}

// ── Node kinds ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Shl,
    Shr,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    BitAnd,
    BitXor,
    BitOr,
    Min,
    Max,
    Pow,
}

impl BinOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge | BinOp::Eq | BinOp::Ne
        )
    }

    pub fn is_shift(self) -> bool {
        matches!(self, BinOp::Shl | BinOp::Shr)
    }

    pub fn is_bitwise(self) -> bool {
        matches!(self, BinOp::BitAnd | BinOp::BitXor | BinOp::BitOr)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    Not,
    BitNot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MathFunc {
    Sin,
    Cos,
    Tan,
    Sinh,
    Cosh,
    Tanh,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BiquadDesign {
    Lowpass,
    Highpass,
    Bandpass,
}

/// The closed set of node kinds in the IR.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Literal { value: LitValue },
    ReadInput { index: usize },
    ReadProperty { index: usize },
    WriteOutput { index: usize },
    StageOutput { stage: StageId, index: usize },
    /// First-class sink for unconsumed value outputs.
    Discard,
    Bin { op: BinOp },
    Un { op: UnOp },
    Cast { to: ScalarType },
    /// N-ary fan-in sum, materialized by the inferencer.
    Sum,
    /// N-ary fan-in logical or for bool pins.
    OrJoin,
    Broadcast,
    Truncate,
    Merge,
    Split { widths: Vec<u32> },
    Slice { start: u32, end: Option<u32> },
    /// `if(cond, then, else)` — pointwise selection.
    IfSelect,
    /// `select(index, a, b, …)` — indexed selection.
    Select,
    MathFn { func: MathFunc },
    Clamp,
    Biquad { design: BiquadDesign },
    Xoroshiro { seed: u64 },
    /// One-or-more-sample recursion cell. The edge into its `end` input is
    /// the graph's only legal kind of back-edge.
    Cell { delay: u32, shape: Shape },
    DelayWrite { buffer: BufferId },
    DelayRead { buffer: BufferId },
    /// Carrier for a buffer's capacity expression until folding bakes it
    /// into the buffer table.
    BufferCap { buffer: BufferId },
    Sr,
    Clock,
}

impl NodeKind {
    /// Kinds whose unconsumed outputs do not need a discard edge: sinks
    /// without value outputs, and stage outputs whose output pin is the
    /// cross-stage surface.
    pub fn exempt_from_discard(&self) -> bool {
        matches!(
            self,
            NodeKind::Discard
                | NodeKind::WriteOutput { .. }
                | NodeKind::DelayWrite { .. }
                | NodeKind::BufferCap { .. }
                | NodeKind::StageOutput { .. }
        )
    }
}

// ── Pins and bundles ────────────────────────────────────────────────────────

/// One endpoint on a node. Shape and rate start unknown and are filled by
/// inference; declared pins (cells, stage outputs, external ports) are
/// seeded by the builder.
#[derive(Debug, Clone, PartialEq)]
pub struct Pin {
    pub name: Option<String>,
    pub shape: Option<Shape>,
    pub rate: Option<Rate>,
}

impl Pin {
    pub fn unnamed() -> Pin {
        Pin {
            name: None,
            shape: None,
            rate: None,
        }
    }

    pub fn named(name: impl Into<String>) -> Pin {
        Pin {
            name: Some(name.into()),
            shape: None,
            rate: None,
        }
    }

    pub fn with_shape(mut self, shape: Shape) -> Pin {
        self.shape = Some(shape);
        self
    }
}

/// An ordered collection of pins plus a name→index map.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bundle {
    pub pins: Vec<Pin>,
    names: HashMap<String, usize>,
}

impl Bundle {
    pub fn new() -> Bundle {
        Bundle::default()
    }

    pub fn push(&mut self, pin: Pin) -> usize {
        let index = self.pins.len();
        if let Some(name) = &pin.name {
            self.names.insert(name.clone(), index);
        }
        self.pins.push(pin);
        index
    }

    pub fn len(&self) -> usize {
        self.pins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pins.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.get(name).copied()
    }

    pub fn name_of(&self, index: usize) -> Option<&str> {
        self.pins[index].name.as_deref()
    }
}

// ── Nodes, edges, stages, buffers ───────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub kind: NodeKind,
    pub stage: StageId,
    pub inputs: Bundle,
    pub outputs: Bundle,
    pub span: Option<Span>,
    /// Set by the folder when the node has been replaced.
    pub dead: bool,
}

/// A (node, pin-index) endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PinRef {
    pub node: NodeId,
    pub pin: usize,
}

/// A directed connection from an output pin to an input pin.
#[derive(Debug, Clone)]
pub struct Edge {
    pub id: EdgeId,
    pub src: PinRef,
    pub dst: PinRef,
    pub span: Option<Span>,
}

/// A stage: name, declared outputs, and the nodes that carry them.
#[derive(Debug, Clone)]
pub struct StageDecl {
    pub id: StageId,
    pub name: String,
    pub outputs: Vec<StageOutputInfo>,
}

#[derive(Debug, Clone)]
pub struct StageOutputInfo {
    pub name: String,
    pub shape: Shape,
    pub node: NodeId,
}

/// A circular buffer. `capacity` is filled by the folder once the capacity
/// subgraph has collapsed to a literal.
#[derive(Debug, Clone)]
pub struct BufferDecl {
    pub id: BufferId,
    pub name: String,
    pub shape: Shape,
    pub capacity: Option<u64>,
    pub span: Span,
}

// ── The graph ───────────────────────────────────────────────────────────────

/// The complete program graph. Node IDs index `nodes`; dead nodes stay in
/// place so IDs remain stable until emission renumbers.
#[derive(Debug, Default)]
pub struct Graph {
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    pub stages: Vec<StageDecl>,
    pub buffers: Vec<BufferDecl>,
    ids: IdAllocator,
}

impl Graph {
    pub fn new() -> Graph {
        Graph::default()
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0 as usize]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0 as usize]
    }

    pub fn add_node(
        &mut self,
        kind: NodeKind,
        stage: StageId,
        inputs: Bundle,
        outputs: Bundle,
        span: Option<Span>,
    ) -> NodeId {
        let id = self.ids.alloc_node();
        debug_assert_eq!(id.0 as usize, self.nodes.len());
        self.nodes.push(Node {
            id,
            kind,
            stage,
            inputs,
            outputs,
            span,
            dead: false,
        });
        id
    }

    pub fn add_stage(&mut self, name: String) -> StageId {
        let id = self.ids.alloc_stage();
        debug_assert_eq!(id.0 as usize, self.stages.len());
        self.stages.push(StageDecl {
            id,
            name,
            outputs: Vec::new(),
        });
        id
    }

    pub fn add_buffer(&mut self, name: String, shape: Shape, span: Span) -> BufferId {
        let id = self.ids.alloc_buffer();
        debug_assert_eq!(id.0 as usize, self.buffers.len());
        self.buffers.push(BufferDecl {
            id,
            name,
            shape,
            capacity: None,
            span,
        });
        id
    }

    /// Connect an output pin to an input pin.
    pub fn connect(&mut self, src: PinRef, dst: PinRef, span: Option<Span>) -> EdgeId {
        debug_assert!(src.pin < self.node(src.node).outputs.len());
        debug_assert!(dst.pin < self.node(dst.node).inputs.len());
        let id = self.ids.alloc_edge();
        self.edges.push(Edge { id, src, dst, span });
        id
    }

    /// Live nodes, in id order.
    pub fn live_nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|n| !n.dead)
    }

    pub fn edges_into(&self, dst: PinRef) -> impl Iterator<Item = &Edge> {
        self.edges.iter().filter(move |e| e.dst == dst)
    }

    pub fn edges_into_node(&self, node: NodeId) -> impl Iterator<Item = &Edge> {
        self.edges.iter().filter(move |e| e.dst.node == node)
    }

    pub fn edges_from_node(&self, node: NodeId) -> impl Iterator<Item = &Edge> {
        self.edges.iter().filter(move |e| e.src.node == node)
    }

    /// Topological order over live nodes. Edges into recursion cells are
    /// the permitted back-edges and are excluded. On failure returns the
    /// set of nodes left inside cycles.
    pub fn topo_order(&self) -> Result<Vec<NodeId>, Vec<NodeId>> {
        let n = self.nodes.len();
        let mut in_degree = vec![0usize; n];
        let mut excluded = vec![false; n];
        for node in &self.nodes {
            if node.dead {
                excluded[node.id.0 as usize] = true;
            }
        }

        let counts_edge = |e: &Edge| -> bool {
            !excluded[e.src.node.0 as usize]
                && !excluded[e.dst.node.0 as usize]
                && !matches!(self.node(e.dst.node).kind, NodeKind::Cell { .. })
        };

        for edge in &self.edges {
            if counts_edge(edge) {
                in_degree[edge.dst.node.0 as usize] += 1;
            }
        }

        let mut queue: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|node| !excluded[node.id.0 as usize] && in_degree[node.id.0 as usize] == 0)
            .map(|node| node.id)
            .collect();
        let mut order = Vec::with_capacity(n);

        let mut head = 0;
        while head < queue.len() {
            let id = queue[head];
            head += 1;
            order.push(id);
            for edge in &self.edges {
                if edge.src.node == id && counts_edge(edge) {
                    let dst = edge.dst.node.0 as usize;
                    in_degree[dst] -= 1;
                    if in_degree[dst] == 0 {
                        queue.push(edge.dst.node);
                    }
                }
            }
        }

        let live_count = self.nodes.iter().filter(|n| !excluded[n.id.0 as usize]).count();
        if order.len() == live_count {
            Ok(order)
        } else {
            let stuck = self
                .nodes
                .iter()
                .filter(|node| {
                    !excluded[node.id.0 as usize] && in_degree[node.id.0 as usize] > 0
                })
                .map(|node| node.id)
                .collect();
            Err(stuck)
        }
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Graph ({} stages, {} nodes, {} edges, {} buffers)",
            self.stages.len(),
            self.live_nodes().count(),
            self.edges.len(),
            self.buffers.len()
        )?;
        for stage in &self.stages {
            let count = self
                .live_nodes()
                .filter(|node| node.stage == stage.id)
                .count();
            writeln!(f, "  stage '{}': {} nodes", stage.name, count)?;
        }
        Ok(())
    }
}

// ── Public entry point ──────────────────────────────────────────────────────

/// Result of graph construction.
#[derive(Debug)]
pub struct BuildResult {
    pub graph: Graph,
    pub diagnostics: Vec<Diagnostic>,
}

/// Build the program graph from a resolved Waveling program.
pub fn build_graph(
    program: &ast::Program,
    resolved: &ResolvedProgram,
    registry: &Registry,
) -> BuildResult {
    let mut builder = GraphBuilder {
        program,
        resolved,
        registry,
        graph: Graph::new(),
        diagnostics: Vec::new(),
        stage_output_nodes: Vec::new(),
        buffer_of: HashMap::new(),
        read_inputs: HashMap::new(),
        read_properties: HashMap::new(),
        write_outputs: HashMap::new(),
    };

    builder.predeclare();
    builder.build_stages();
    builder.attach_discards();

    BuildResult {
        graph: builder.graph,
        diagnostics: builder.diagnostics,
    }
}

// ── Builder ─────────────────────────────────────────────────────────────────

/// What an expression evaluated to during lowering.
#[derive(Debug, Clone)]
enum Value {
    /// A node; source position means `outputs[0]`, destination `inputs[0]`.
    Node(NodeId),
    /// A specific output pin (`x[1]`, `stage.outputs.name`).
    OutPin(PinRef),
    /// A specific input pin (`osc.inputs.frequency`).
    InPin(PinRef),
    /// Output stacking (`a, b`) — flattened, source-only.
    Stack(Vec<Value>),
    /// Bundle literal — source-only, consumed by routing into a node.
    Bundle(Vec<(Option<String>, Value, Span)>),
}

struct GraphBuilder<'a> {
    program: &'a ast::Program,
    resolved: &'a ResolvedProgram,
    registry: &'a Registry,
    graph: Graph,
    diagnostics: Vec<Diagnostic>,
    /// Per stage: declared-output index → StageOutput node.
    stage_output_nodes: Vec<Vec<NodeId>>,
    /// Buffer index (resolver order) → BufferId.
    buffer_of: HashMap<usize, BufferId>,
    /// Memoized external reads/writes, one node per (stage, port).
    read_inputs: HashMap<(u32, usize), NodeId>,
    read_properties: HashMap<(u32, usize), NodeId>,
    write_outputs: HashMap<(u32, usize), NodeId>,
}

/// Per-stage build state.
struct StageCtx {
    id: StageId,
    index: usize,
    /// `let` bindings, in lexical order.
    env: HashMap<String, NodeId>,
    /// Cell index (resolver order) → node.
    cells: Vec<NodeId>,
}

impl<'a> GraphBuilder<'a> {
    fn error(&mut self, code: crate::diag::DiagCode, span: Span, message: impl Into<String>) {
        self.diagnostics.push(Diagnostic::error(code, span, message));
    }

    // ── Pre-pass: stages, stage outputs, buffers ──

    fn predeclare(&mut self) {
        for entry in &self.resolved.stages {
            let stage_id = self.graph.add_stage(entry.name.clone());
            let mut nodes = Vec::new();
            for (index, (name, shape, span)) in entry.outputs.iter().enumerate() {
                let mut inputs = Bundle::new();
                inputs.push(Pin::unnamed().with_shape(*shape));
                let mut outputs = Bundle::new();
                outputs.push(Pin::named(name.clone()).with_shape(*shape));
                let node = self.graph.add_node(
                    NodeKind::StageOutput {
                        stage: stage_id,
                        index,
                    },
                    stage_id,
                    inputs,
                    outputs,
                    Some(*span),
                );
                self.graph.stages[stage_id.0 as usize]
                    .outputs
                    .push(StageOutputInfo {
                        name: name.clone(),
                        shape: *shape,
                        node,
                    });
                nodes.push(node);
            }
            self.stage_output_nodes.push(nodes);
        }

        for (index, entry) in self.resolved.buffers.iter().enumerate() {
            let id = self
                .graph
                .add_buffer(entry.name.clone(), entry.shape, entry.name_span);
            self.buffer_of.insert(index, id);
        }
    }

    // ── Stage bodies ──

    fn build_stages(&mut self) {
        let program = self.program;
        for (index, stage) in program.stages.iter().enumerate() {
            let mut ctx = StageCtx {
                id: StageId(index as u32),
                index,
                env: HashMap::new(),
                cells: Vec::new(),
            };
            for stmt in &stage.body {
                self.build_stmt(&mut ctx, stmt);
            }
        }
    }

    fn build_stmt(&mut self, ctx: &mut StageCtx, stmt: &Stmt) {
        match &stmt.kind {
            StmtKind::Let(let_stmt) => {
                let Some(value) = self.eval(ctx, &let_stmt.value) else {
                    return;
                };
                match value {
                    Value::Node(node) => {
                        ctx.env.insert(let_stmt.name.name.clone(), node);
                    }
                    _ => self.error(
                        codes::STRUCT_BAD_ARG,
                        let_stmt.value.span,
                        "a binding's right-hand side must evaluate to a node",
                    ),
                }
            }
            StmtKind::Assign(assign) => {
                let dst_node = match self.resolved.target_for(assign.name.span) {
                    Some(NameTarget::StageOutput(index)) => {
                        self.stage_output_nodes[ctx.index][index]
                    }
                    Some(NameTarget::CellEnd(cell)) => match ctx.cells.get(cell) {
                        Some(node) => *node,
                        None => return,
                    },
                    // Resolution already reported the bad target.
                    _ => {
                        let _ = self.eval(ctx, &assign.value);
                        return;
                    }
                };
                let Some(value) = self.eval(ctx, &assign.value) else {
                    return;
                };
                self.route_into_pin(
                    ctx,
                    value,
                    PinRef {
                        node: dst_node,
                        pin: 0,
                    },
                    assign.value.span,
                );
            }
            StmtKind::Cell(cell) => {
                let entry = &self.resolved.scopes[ctx.index].cells[ctx.cells.len()];
                let shape = entry.shape;
                let delay = match cell.delay {
                    None => 1,
                    Some((k, _)) if k >= 1 && k <= u32::MAX as i128 => k as u32,
                    Some((k, span)) => {
                        self.error(
                            codes::STRUCT_BAD_CELL_DELAY,
                            span,
                            format!("cell delay must be at least 1, found {k}"),
                        );
                        1
                    }
                };
                let mut inputs = Bundle::new();
                inputs.push(Pin::named("end").with_shape(shape));
                let mut outputs = Bundle::new();
                outputs.push(Pin::named("start").with_shape(shape));
                let node = self.graph.add_node(
                    NodeKind::Cell { delay, shape },
                    ctx.id,
                    inputs,
                    outputs,
                    Some(stmt.span),
                );
                ctx.cells.push(node);
            }
            StmtKind::Buffer(buffer) => {
                // The buffer itself was predeclared; lower the capacity
                // expression into a C-rate-required carrier pin.
                let resolver_index = self
                    .resolved
                    .buffer_ids
                    .get(&buffer.name.name)
                    .copied()
                    .expect("buffer collected during resolve");
                let id = self.buffer_of[&resolver_index];
                let mut inputs = Bundle::new();
                inputs.push(Pin::named("capacity"));
                let cap_node = self.graph.add_node(
                    NodeKind::BufferCap { buffer: id },
                    ctx.id,
                    inputs,
                    Bundle::new(),
                    Some(stmt.span),
                );
                if let Some(value) = self.eval(ctx, &buffer.capacity) {
                    self.route_into_pin(
                        ctx,
                        value,
                        PinRef {
                            node: cap_node,
                            pin: 0,
                        },
                        buffer.capacity.span,
                    );
                }
            }
            StmtKind::Expr(expr) => {
                let _ = self.eval(ctx, expr);
            }
        }
    }

    // ── Expression lowering ──

    fn eval(&mut self, ctx: &mut StageCtx, expr: &Expr) -> Option<Value> {
        match &expr.kind {
            ExprKind::Number(num) => {
                let node = self.literal_node(ctx, LitValue::from_num(*num), expr.span);
                Some(Value::Node(node))
            }
            ExprKind::Bool(b) => {
                let node = self.literal_node(
                    ctx,
                    LitValue::Typed(Constant::Bool(vec![*b])),
                    expr.span,
                );
                Some(Value::Node(node))
            }
            ExprKind::Path(path) => self.eval_path(ctx, path, expr.span),
            ExprKind::Call(call) => self.eval_call(ctx, call),
            ExprKind::Bundle(entries, span) => {
                let mut values = Vec::new();
                for entry in entries {
                    let (name, value_expr) = match entry {
                        BundleEntry::Positional(e) => (None, e),
                        BundleEntry::Named(name, e) => (Some(name.name.clone()), e),
                    };
                    let value = self.eval(ctx, value_expr)?;
                    values.push((name, value, value_expr.span));
                }
                Some(Value::Bundle(values))
            }
            ExprKind::Unary(UnaryOp::Plus, operand) => self.eval(ctx, operand),
            ExprKind::Unary(op, operand) => {
                let operand_value = self.eval(ctx, operand)?;
                let src = self.as_source(operand_value, operand.span)?;
                let un_op = match op {
                    UnaryOp::Not => UnOp::Not,
                    UnaryOp::BitNot => UnOp::BitNot,
                    UnaryOp::Neg => UnOp::Neg,
                    UnaryOp::Plus => unreachable!("handled above"),
                };
                let node = self.op_node(ctx, NodeKind::Un { op: un_op }, 1, expr.span);
                self.graph
                    .connect(src, PinRef { node, pin: 0 }, Some(operand.span));
                Some(Value::Node(node))
            }
            ExprKind::Binary(op, lhs, rhs) => {
                let lhs_value = self.eval(ctx, lhs)?;
                let rhs_value = self.eval(ctx, rhs)?;
                let lhs_src = self.as_source(lhs_value, lhs.span)?;
                let rhs_src = self.as_source(rhs_value, rhs.span)?;
                let bin_op = lower_binary_op(*op);
                let node = self.op_node(ctx, NodeKind::Bin { op: bin_op }, 2, expr.span);
                self.graph
                    .connect(lhs_src, PinRef { node, pin: 0 }, Some(lhs.span));
                self.graph
                    .connect(rhs_src, PinRef { node, pin: 1 }, Some(rhs.span));
                Some(Value::Node(node))
            }
            ExprKind::Stack(lhs, rhs) => {
                let lhs_value = self.eval(ctx, lhs)?;
                let rhs_value = self.eval(ctx, rhs)?;
                let mut parts = Vec::new();
                for value in [lhs_value, rhs_value] {
                    match value {
                        Value::Stack(inner) => parts.extend(inner),
                        other => parts.push(other),
                    }
                }
                Some(Value::Stack(parts))
            }
            ExprKind::Route(src, dst) => {
                let src_value = self.eval(ctx, src)?;
                let dst_value = self.eval(ctx, dst)?;
                self.route(ctx, src_value, dst_value.clone(), src.span, dst.span);
                Some(dst_value)
            }
            ExprKind::Index(base, index, index_span) => {
                self.eval_index(ctx, base, *index, *index_span)
            }
        }
    }

    fn literal_node(&mut self, ctx: &StageCtx, value: LitValue, span: Span) -> NodeId {
        let shape = match &value {
            LitValue::Typed(constant) => Some(constant.shape()),
            _ => None,
        };
        let mut outputs = Bundle::new();
        let mut pin = Pin::unnamed();
        if let Some(shape) = shape {
            pin = pin.with_shape(shape);
        }
        outputs.push(pin);
        self.graph.add_node(
            NodeKind::Literal { value },
            ctx.id,
            Bundle::new(),
            outputs,
            Some(span),
        )
    }

    /// Create an operator node with `arity` unnamed inputs and one output.
    fn op_node(&mut self, ctx: &StageCtx, kind: NodeKind, arity: usize, span: Span) -> NodeId {
        let mut inputs = Bundle::new();
        for _ in 0..arity {
            inputs.push(Pin::unnamed());
        }
        let mut outputs = Bundle::new();
        outputs.push(Pin::unnamed());
        self.graph.add_node(kind, ctx.id, inputs, outputs, Some(span))
    }

    // ── Paths ──

    fn eval_path(&mut self, ctx: &mut StageCtx, path: &Path, span: Span) -> Option<Value> {
        let head = path.head();
        let target = self.resolved.target_for(head.span)?;
        match target {
            NameTarget::LetVar => {
                // Absent on a lexical-order violation, which resolve reported.
                let node = *ctx.env.get(&head.name)?;
                self.path_tail(node, &path.segments[1..], span)
            }
            NameTarget::CellStart(cell) => {
                let node = ctx.cells.get(cell).copied()?;
                self.no_tail(path, 1)?;
                Some(Value::OutPin(PinRef { node, pin: 0 }))
            }
            NameTarget::CellEnd(cell) => {
                let node = ctx.cells.get(cell).copied()?;
                self.no_tail(path, 1)?;
                Some(Value::InPin(PinRef { node, pin: 0 }))
            }
            NameTarget::StageOutput(index) => {
                self.no_tail(path, 1)?;
                Some(Value::Node(self.stage_output_nodes[ctx.index][index]))
            }
            NameTarget::Input(index) => {
                self.no_tail(path, 1)?;
                Some(Value::Node(self.read_input_node(ctx, index, span)))
            }
            NameTarget::Output(index) => {
                self.no_tail(path, 1)?;
                Some(Value::Node(self.write_output_node(ctx, index, span)))
            }
            NameTarget::Property(index) => {
                self.no_tail(path, 1)?;
                Some(Value::Node(self.read_property_node(ctx, index, span)))
            }
            NameTarget::StageRef(stage) => self.stage_output_pin(stage, path, span),
            NameTarget::BufferRef(_) => {
                self.error(
                    codes::STRUCT_BAD_ARG,
                    span,
                    "a buffer name can only appear as the first argument of delread/delwrite",
                );
                None
            }
            NameTarget::Builtin { builtin, consumed } => {
                self.no_tail(path, consumed)?;
                self.instantiate_bare_builtin(ctx, builtin, span)
            }
        }
    }

    /// Reject trailing path segments after the consumed prefix.
    fn no_tail(&mut self, path: &Path, consumed: usize) -> Option<()> {
        if path.segments.len() > consumed {
            let extra = &path.segments[consumed];
            self.error(
                codes::NAME_BAD_PATH,
                extra.span,
                format!("'{}' has no member '{}'", path.segments[consumed - 1].name, extra.name),
            );
            return None;
        }
        Some(())
    }

    /// `node.outputs.x` / `node.inputs.x` pin selection on a let-bound node.
    fn path_tail(&mut self, node: NodeId, tail: &[ast::Ident], span: Span) -> Option<Value> {
        match tail {
            [] => Some(Value::Node(node)),
            [kind_seg, pin_seg] => {
                let (bundle, make): (&Bundle, fn(PinRef) -> Value) = match kind_seg.name.as_str() {
                    "outputs" => (&self.graph.node(node).outputs, Value::OutPin),
                    "inputs" => (&self.graph.node(node).inputs, Value::InPin),
                    other => {
                        let message = format!("expected 'inputs' or 'outputs', found '{other}'");
                        self.error(codes::NAME_BAD_PATH, kind_seg.span, message);
                        return None;
                    }
                };
                match bundle.index_of(&pin_seg.name) {
                    Some(pin) => Some(make(PinRef { node, pin })),
                    None => {
                        self.error(
                            codes::STRUCT_UNKNOWN_PIN,
                            pin_seg.span,
                            format!("node has no pin named '{}'", pin_seg.name),
                        );
                        None
                    }
                }
            }
            _ => {
                self.error(
                    codes::NAME_BAD_PATH,
                    span,
                    "expected 'name', 'name.outputs.pin', or 'name.inputs.pin'",
                );
                None
            }
        }
    }

    /// `stage.outputs.name` — a cross-stage read of a declared output.
    fn stage_output_pin(&mut self, stage: usize, path: &Path, span: Span) -> Option<Value> {
        match &path.segments[1..] {
            [kind_seg, name_seg] if kind_seg.name == "outputs" => {
                let decl = &self.graph.stages[stage];
                match decl.outputs.iter().find(|o| o.name == name_seg.name) {
                    Some(info) => Some(Value::OutPin(PinRef {
                        node: info.node,
                        pin: 0,
                    })),
                    None => {
                        let message = format!(
                            "stage '{}' does not declare an output '{}'",
                            decl.name, name_seg.name
                        );
                        self.error(codes::STRUCT_CROSS_STAGE, name_seg.span, message);
                        None
                    }
                }
            }
            _ => {
                self.error(
                    codes::NAME_BAD_PATH,
                    span,
                    "stages are referenced as 'stage.outputs.name'",
                );
                None
            }
        }
    }

    // ── External port nodes (memoized per stage) ──

    fn read_input_node(&mut self, ctx: &StageCtx, index: usize, span: Span) -> NodeId {
        if let Some(&node) = self.read_inputs.get(&(ctx.id.0, index)) {
            return node;
        }
        let width = self.resolved.external.inputs[index].width;
        let shape = Shape::new(ScalarType::F32, width);
        let mut outputs = Bundle::new();
        outputs.push(Pin::unnamed().with_shape(shape));
        let node = self.graph.add_node(
            NodeKind::ReadInput { index },
            ctx.id,
            Bundle::new(),
            outputs,
            Some(span),
        );
        self.read_inputs.insert((ctx.id.0, index), node);
        node
    }

    fn read_property_node(&mut self, ctx: &StageCtx, index: usize, span: Span) -> NodeId {
        if let Some(&node) = self.read_properties.get(&(ctx.id.0, index)) {
            return node;
        }
        let prop = &self.resolved.external.properties[index];
        let shape = Shape::scalar_of(prop.semantic_scalar());
        let mut outputs = Bundle::new();
        outputs.push(Pin::unnamed().with_shape(shape));
        let node = self.graph.add_node(
            NodeKind::ReadProperty { index },
            ctx.id,
            Bundle::new(),
            outputs,
            Some(span),
        );
        self.read_properties.insert((ctx.id.0, index), node);
        node
    }

    fn write_output_node(&mut self, ctx: &StageCtx, index: usize, span: Span) -> NodeId {
        if let Some(&node) = self.write_outputs.get(&(ctx.id.0, index)) {
            return node;
        }
        let width = self.resolved.external.outputs[index].width;
        let shape = Shape::new(ScalarType::F32, width);
        let mut inputs = Bundle::new();
        inputs.push(Pin::unnamed().with_shape(shape));
        let node = self.graph.add_node(
            NodeKind::WriteOutput { index },
            ctx.id,
            inputs,
            Bundle::new(),
            Some(span),
        );
        self.write_outputs.insert((ctx.id.0, index), node);
        node
    }

    // ── Indexing ──

    fn eval_index(
        &mut self,
        ctx: &mut StageCtx,
        base: &Expr,
        index: i128,
        index_span: Span,
    ) -> Option<Value> {
        // `input[k]` / `output[k]` address the external port arrays.
        if let ExprKind::Path(path) = &base.kind {
            if let Some(NameTarget::Builtin {
                builtin: Builtin::Inputs,
                ..
            }) = self.resolved.target_for(path.head().span)
            {
                self.no_tail(path, 1)?;
                let count = self.resolved.external.inputs.len();
                if index < 0 || index as usize >= count {
                    self.error(
                        codes::STRUCT_BAD_ARG,
                        index_span,
                        format!("input index {index} out of range ({count} inputs declared)"),
                    );
                    return None;
                }
                let node = self.read_input_node(ctx, index as usize, base.span);
                return Some(Value::Node(node));
            }
            if let Some(NameTarget::Builtin {
                builtin: Builtin::Outputs,
                ..
            }) = self.resolved.target_for(path.head().span)
            {
                self.no_tail(path, 1)?;
                let count = self.resolved.external.outputs.len();
                if index < 0 || index as usize >= count {
                    self.error(
                        codes::STRUCT_BAD_ARG,
                        index_span,
                        format!("output index {index} out of range ({count} outputs declared)"),
                    );
                    return None;
                }
                let node = self.write_output_node(ctx, index as usize, base.span);
                return Some(Value::Node(node));
            }
        }

        // Otherwise: select output `index` of a node expression.
        let base_value = self.eval(ctx, base)?;
        let node = match base_value {
            Value::Node(node) => node,
            _ => {
                self.error(
                    codes::STRUCT_BAD_ARG,
                    index_span,
                    "output selection applies to a node expression",
                );
                return None;
            }
        };
        let count = self.graph.node(node).outputs.len();
        if index < 0 || index as usize >= count {
            self.error(
                codes::STRUCT_BAD_ARG,
                index_span,
                format!("output index {index} out of range ({count} outputs)"),
            );
            return None;
        }
        Some(Value::OutPin(PinRef {
            node,
            pin: index as usize,
        }))
    }

    // ── Built-ins ──

    /// A built-in mentioned without arguments (`-> f32`, `sr * 2`). Legal
    /// for kinds whose pins are wired by routing; kinds that need literal
    /// arguments must use call form.
    fn instantiate_bare_builtin(
        &mut self,
        ctx: &StageCtx,
        builtin: Builtin,
        span: Span,
    ) -> Option<Value> {
        match builtin {
            Builtin::Const(c) => {
                let node = self.literal_node(
                    ctx,
                    LitValue::Typed(Constant::F64(vec![c.value()])),
                    span,
                );
                Some(Value::Node(node))
            }
            Builtin::Inputs | Builtin::Outputs => {
                self.error(
                    codes::NAME_BAD_PATH,
                    span,
                    "the port arrays are addressed as 'input[k]' / 'output[k]' or by declared name",
                );
                None
            }
            Builtin::Fn(func) => match func {
                BuiltinFn::Split
                | BuiltinFn::Slice
                | BuiltinFn::Merge
                | BuiltinFn::Select
                | BuiltinFn::Xoroshiro
                | BuiltinFn::DelRead
                | BuiltinFn::DelWrite => {
                    self.error(
                        codes::STRUCT_BAD_ARG,
                        span,
                        format!("'{}' requires call arguments", self.registry.meta(func).path),
                    );
                    None
                }
                _ => {
                    let node = self.builtin_node(ctx, func, span)?;
                    Some(Value::Node(node))
                }
            },
        }
    }

    /// Create a node for a non-special built-in, pins per registry metadata.
    fn builtin_node(&mut self, ctx: &StageCtx, func: BuiltinFn, span: Span) -> Option<NodeId> {
        let meta = self.registry.meta(func);
        let kind = match func {
            BuiltinFn::If => NodeKind::IfSelect,
            BuiltinFn::Select => NodeKind::Select,
            BuiltinFn::Broadcast => NodeKind::Broadcast,
            BuiltinFn::Truncate => NodeKind::Truncate,
            BuiltinFn::Merge => NodeKind::Merge,
            BuiltinFn::Sin => NodeKind::MathFn { func: MathFunc::Sin },
            BuiltinFn::Cos => NodeKind::MathFn { func: MathFunc::Cos },
            BuiltinFn::Tan => NodeKind::MathFn { func: MathFunc::Tan },
            BuiltinFn::Sinh => NodeKind::MathFn {
                func: MathFunc::Sinh,
            },
            BuiltinFn::Cosh => NodeKind::MathFn {
                func: MathFunc::Cosh,
            },
            BuiltinFn::Tanh => NodeKind::MathFn {
                func: MathFunc::Tanh,
            },
            BuiltinFn::Min => NodeKind::Bin { op: BinOp::Min },
            BuiltinFn::Max => NodeKind::Bin { op: BinOp::Max },
            BuiltinFn::Pow => NodeKind::Bin { op: BinOp::Pow },
            BuiltinFn::Clamp => NodeKind::Clamp,
            BuiltinFn::CastI32 => NodeKind::Cast {
                to: ScalarType::I32,
            },
            BuiltinFn::CastI64 => NodeKind::Cast {
                to: ScalarType::I64,
            },
            BuiltinFn::CastF32 => NodeKind::Cast {
                to: ScalarType::F32,
            },
            BuiltinFn::CastF64 => NodeKind::Cast {
                to: ScalarType::F64,
            },
            BuiltinFn::CastBool => NodeKind::Cast {
                to: ScalarType::Bool,
            },
            BuiltinFn::BiquadLowpass => NodeKind::Biquad {
                design: BiquadDesign::Lowpass,
            },
            BuiltinFn::BiquadHighpass => NodeKind::Biquad {
                design: BiquadDesign::Highpass,
            },
            BuiltinFn::BiquadBandpass => NodeKind::Biquad {
                design: BiquadDesign::Bandpass,
            },
            BuiltinFn::Sr => NodeKind::Sr,
            BuiltinFn::Clock => NodeKind::Clock,
            BuiltinFn::Split
            | BuiltinFn::Slice
            | BuiltinFn::Xoroshiro
            | BuiltinFn::DelRead
            | BuiltinFn::DelWrite => {
                unreachable!("attribute-bearing built-ins are constructed by eval_call")
            }
        };

        let mut inputs = Bundle::new();
        for pin_meta in meta.inputs {
            inputs.push(Pin::named(pin_meta.name));
        }
        let mut outputs = Bundle::new();
        for _ in 0..meta.outputs {
            outputs.push(Pin::unnamed());
        }
        Some(self.graph.add_node(kind, ctx.id, inputs, outputs, Some(span)))
    }

    fn eval_call(&mut self, ctx: &mut StageCtx, call: &ast::CallExpr) -> Option<Value> {
        let head = call.callee.head();
        let target = self.resolved.target_for(head.span)?;
        let NameTarget::Builtin { builtin, consumed } = target else {
            self.error(
                codes::NAME_BAD_PATH,
                call.callee_span,
                format!("'{}' is not callable", head.name),
            );
            return None;
        };
        if call.callee.segments.len() > consumed {
            let extra = &call.callee.segments[consumed];
            self.error(
                codes::NAME_BAD_PATH,
                extra.span,
                format!("unexpected path segment '{}'", extra.name),
            );
            return None;
        }
        let func = match builtin {
            Builtin::Fn(func) => func,
            Builtin::Const(_) | Builtin::Inputs | Builtin::Outputs => {
                self.error(
                    codes::NAME_BAD_PATH,
                    call.callee_span,
                    format!("'{}' is not callable", head.name),
                );
                return None;
            }
        };

        match func {
            BuiltinFn::Split => self.lower_split(ctx, call),
            BuiltinFn::Slice => self.lower_slice(ctx, call),
            BuiltinFn::Xoroshiro => self.lower_xoroshiro(ctx, call),
            BuiltinFn::DelRead => self.lower_delay(ctx, call, true),
            BuiltinFn::DelWrite => self.lower_delay(ctx, call, false),
            _ => self.lower_plain_call(ctx, call, func),
        }
    }

    /// Calls whose arguments all wire positionally into pins.
    fn lower_plain_call(
        &mut self,
        ctx: &mut StageCtx,
        call: &ast::CallExpr,
        func: BuiltinFn,
    ) -> Option<Value> {
        let meta = self.registry.meta(func);
        if !meta.variadic && call.args.len() > meta.inputs.len() {
            self.error(
                codes::STRUCT_BAD_ARG,
                call.span,
                format!(
                    "'{}' takes at most {} arguments, found {}",
                    meta.path,
                    meta.inputs.len(),
                    call.args.len()
                ),
            );
            return None;
        }
        let minimum = match func {
            BuiltinFn::Merge => 2,
            BuiltinFn::Select => 3,
            _ => 0,
        };
        if call.args.len() < minimum {
            self.error(
                codes::STRUCT_BAD_ARG,
                call.span,
                format!("'{}' needs at least {minimum} arguments", meta.path),
            );
            return None;
        }

        let node = self.builtin_node(ctx, func, call.span)?;
        for (index, arg) in call.args.iter().enumerate() {
            let value = self.eval(ctx, arg)?;
            let src = self.as_source(value, arg.span)?;
            if index >= self.graph.node(node).inputs.len() {
                // Variadic built-ins grow unnamed pins per argument.
                self.graph.node_mut(node).inputs.push(Pin::unnamed());
            }
            self.graph
                .connect(src, PinRef { node, pin: index }, Some(arg.span));
        }
        Some(Value::Node(node))
    }

    fn lower_split(&mut self, ctx: &mut StageCtx, call: &ast::CallExpr) -> Option<Value> {
        if call.args.len() < 2 {
            self.error(
                codes::STRUCT_BAD_ARG,
                call.span,
                "'split' needs an input and at least one width",
            );
            return None;
        }
        let mut widths = Vec::new();
        for arg in &call.args[1..] {
            match int_literal(arg) {
                Some(w) if w >= 1 && w <= u32::MAX as i128 => widths.push(w as u32),
                _ => {
                    self.error(
                        codes::STRUCT_BAD_ARG,
                        arg.span,
                        "'split' widths must be positive integer literals",
                    );
                    return None;
                }
            }
        }
        let mut inputs = Bundle::new();
        inputs.push(Pin::named("input"));
        let mut outputs = Bundle::new();
        for _ in 0..widths.len() {
            outputs.push(Pin::unnamed());
        }
        let node = self.graph.add_node(
            NodeKind::Split { widths },
            ctx.id,
            inputs,
            outputs,
            Some(call.span),
        );
        let value = self.eval(ctx, &call.args[0])?;
        let src = self.as_source(value, call.args[0].span)?;
        self.graph
            .connect(src, PinRef { node, pin: 0 }, Some(call.args[0].span));
        Some(Value::Node(node))
    }

    fn lower_slice(&mut self, ctx: &mut StageCtx, call: &ast::CallExpr) -> Option<Value> {
        if call.args.len() != 2 && call.args.len() != 3 {
            self.error(
                codes::STRUCT_BAD_ARG,
                call.span,
                "'slice' takes an input and one or two channel indices",
            );
            return None;
        }
        let start = match int_literal(&call.args[1]) {
            Some(v) if v >= 0 && v <= u32::MAX as i128 => v as u32,
            _ => {
                self.error(
                    codes::STRUCT_BAD_ARG,
                    call.args[1].span,
                    "'slice' indices must be non-negative integer literals",
                );
                return None;
            }
        };
        let end = match call.args.get(2) {
            None => None,
            Some(arg) => match int_literal(arg) {
                Some(v) if v >= 0 && v <= u32::MAX as i128 => Some(v as u32),
                _ => {
                    self.error(
                        codes::STRUCT_BAD_ARG,
                        arg.span,
                        "'slice' indices must be non-negative integer literals",
                    );
                    return None;
                }
            },
        };
        let mut inputs = Bundle::new();
        inputs.push(Pin::named("input"));
        let mut outputs = Bundle::new();
        outputs.push(Pin::unnamed());
        let node = self.graph.add_node(
            NodeKind::Slice { start, end },
            ctx.id,
            inputs,
            outputs,
            Some(call.span),
        );
        let value = self.eval(ctx, &call.args[0])?;
        let src = self.as_source(value, call.args[0].span)?;
        self.graph
            .connect(src, PinRef { node, pin: 0 }, Some(call.args[0].span));
        Some(Value::Node(node))
    }

    fn lower_xoroshiro(&mut self, ctx: &mut StageCtx, call: &ast::CallExpr) -> Option<Value> {
        if call.args.len() != 1 {
            self.error(
                codes::STRUCT_BAD_ARG,
                call.span,
                "'xoroshiro' takes a seed-slot integer literal",
            );
            return None;
        }
        let seed = match int_literal(&call.args[0]) {
            Some(v) if v >= 0 => v as u64,
            _ => {
                self.error(
                    codes::STRUCT_BAD_ARG,
                    call.args[0].span,
                    "'xoroshiro' seed must be a non-negative integer literal",
                );
                return None;
            }
        };
        let mut outputs = Bundle::new();
        outputs.push(Pin::unnamed().with_shape(Shape::scalar_of(ScalarType::F64)));
        let node = self.graph.add_node(
            NodeKind::Xoroshiro { seed },
            ctx.id,
            Bundle::new(),
            outputs,
            Some(call.span),
        );
        Some(Value::Node(node))
    }

    fn lower_delay(
        &mut self,
        ctx: &mut StageCtx,
        call: &ast::CallExpr,
        is_read: bool,
    ) -> Option<Value> {
        let name = if is_read { "delread" } else { "delwrite" };
        if call.args.len() != 2 {
            self.error(
                codes::STRUCT_BAD_ARG,
                call.span,
                format!("'{name}' takes a buffer and one argument"),
            );
            return None;
        }
        let buffer = match &call.args[0].kind {
            ExprKind::Path(path) => match self.resolved.target_for(path.head().span) {
                Some(NameTarget::BufferRef(index)) => self.buffer_of[&index],
                _ => {
                    self.error(
                        codes::STRUCT_UNKNOWN_BUFFER,
                        call.args[0].span,
                        format!("'{name}' expects a declared buffer"),
                    );
                    return None;
                }
            },
            _ => {
                self.error(
                    codes::STRUCT_UNKNOWN_BUFFER,
                    call.args[0].span,
                    format!("'{name}' expects a declared buffer name"),
                );
                return None;
            }
        };
        let buffer_shape = self.graph.buffers[buffer.0 as usize].shape;

        let (kind, pin_name) = if is_read {
            (NodeKind::DelayRead { buffer }, "delay")
        } else {
            (NodeKind::DelayWrite { buffer }, "value")
        };
        let mut inputs = Bundle::new();
        let mut pin = Pin::named(pin_name);
        if !is_read {
            pin = pin.with_shape(buffer_shape);
        }
        inputs.push(pin);
        let mut outputs = Bundle::new();
        if is_read {
            outputs.push(Pin::unnamed().with_shape(buffer_shape));
        }
        let node = self
            .graph
            .add_node(kind, ctx.id, inputs, outputs, Some(call.span));

        let value = self.eval(ctx, &call.args[1])?;
        let src = self.as_source(value, call.args[1].span)?;
        self.graph
            .connect(src, PinRef { node, pin: 0 }, Some(call.args[1].span));
        Some(Value::Node(node))
    }

    // ── Routing ──

    /// Interpret a value in source position, producing a single output pin.
    fn as_source(&mut self, value: Value, span: Span) -> Option<PinRef> {
        match value {
            Value::Node(node) => {
                if self.graph.node(node).outputs.is_empty() {
                    self.error(
                        codes::STRUCT_BAD_ARG,
                        span,
                        "this expression produces no value",
                    );
                    return None;
                }
                Some(PinRef { node, pin: 0 })
            }
            Value::OutPin(pin) => Some(pin),
            Value::InPin(_) => {
                self.error(
                    codes::STRUCT_BAD_ARG,
                    span,
                    "an input pin cannot be used as a signal source",
                );
                None
            }
            Value::Stack(_) | Value::Bundle(_) => {
                self.error(
                    codes::STRUCT_BAD_ARG,
                    span,
                    "stacked and bundled values can only be routed with '->'",
                );
                None
            }
        }
    }

    /// `src -> dst` for all operand-kind combinations.
    fn route(
        &mut self,
        ctx: &mut StageCtx,
        src: Value,
        dst: Value,
        src_span: Span,
        dst_span: Span,
    ) {
        // Bundle literals deconstitute into per-pin edges and need the
        // destination's full bundle.
        if let Value::Bundle(entries) = src {
            let dst_node = match dst {
                Value::Node(node) => node,
                _ => {
                    self.error(
                        codes::STRUCT_BAD_ARG,
                        dst_span,
                        "a bundle literal routes into a node, not a single pin",
                    );
                    return;
                }
            };
            let mut position = 0usize;
            for (name, value, value_span) in entries {
                let pin = match &name {
                    Some(name) => match self.graph.node(dst_node).inputs.index_of(name) {
                        Some(pin) => pin,
                        None => {
                            self.error(
                                codes::STRUCT_UNKNOWN_PIN,
                                value_span,
                                format!("destination has no pin named '{name}'"),
                            );
                            continue;
                        }
                    },
                    None => {
                        let pin = position;
                        position += 1;
                        if pin >= self.graph.node(dst_node).inputs.len() {
                            self.error(
                                codes::STRUCT_UNKNOWN_PIN,
                                value_span,
                                format!("destination has no input pin {pin}"),
                            );
                            continue;
                        }
                        pin
                    }
                };
                if let Some(src_pin) = self.as_source(value, value_span) {
                    self.graph.connect(
                        src_pin,
                        PinRef {
                            node: dst_node,
                            pin,
                        },
                        Some(value_span),
                    );
                }
            }
            return;
        }

        let dst_pin = match dst {
            Value::Node(node) => {
                if self.graph.node(node).inputs.is_empty() {
                    self.error(
                        codes::STRUCT_BAD_ARG,
                        dst_span,
                        "this expression cannot receive a signal",
                    );
                    return;
                }
                PinRef { node, pin: 0 }
            }
            Value::InPin(pin) => pin,
            Value::OutPin(_) => {
                self.error(
                    codes::STRUCT_BAD_ARG,
                    dst_span,
                    "cannot route into an output pin",
                );
                return;
            }
            Value::Stack(_) | Value::Bundle(_) => {
                self.error(
                    codes::STRUCT_BAD_ARG,
                    dst_span,
                    "routing destination must be a node or input pin",
                );
                return;
            }
        };

        self.route_into_pin(ctx, src, dst_pin, src_span);
    }

    /// Route a source value into a specific input pin. Stacked sources pass
    /// through a merge node so components occupy contiguous channel ranges.
    fn route_into_pin(&mut self, ctx: &mut StageCtx, src: Value, dst: PinRef, src_span: Span) {
        match src {
            Value::Stack(parts) => {
                let mut inputs = Bundle::new();
                for _ in 0..parts.len() {
                    inputs.push(Pin::unnamed());
                }
                let mut outputs = Bundle::new();
                outputs.push(Pin::unnamed());
                let merge = self.graph.add_node(
                    NodeKind::Merge,
                    ctx.id,
                    inputs,
                    outputs,
                    Some(src_span),
                );
                for (index, part) in parts.into_iter().enumerate() {
                    if let Some(pin) = self.as_source(part, src_span) {
                        self.graph.connect(
                            pin,
                            PinRef {
                                node: merge,
                                pin: index,
                            },
                            Some(src_span),
                        );
                    }
                }
                self.graph
                    .connect(PinRef { node: merge, pin: 0 }, dst, Some(src_span));
            }
            Value::Bundle(_) => {
                self.error(
                    codes::STRUCT_BAD_ARG,
                    src_span,
                    "a bundle literal routes into a node, not a single pin",
                );
            }
            other => {
                if let Some(pin) = self.as_source(other, src_span) {
                    self.graph.connect(pin, dst, Some(src_span));
                }
            }
        }
    }

    // ── Discard sinks ──

    /// Give every unconsumed value output an edge into its stage's discard
    /// sink. Runs after all stages so cross-stage consumers are counted.
    fn attach_discards(&mut self) {
        let mut consumed: HashMap<PinRef, usize> = HashMap::new();
        for edge in &self.graph.edges {
            *consumed.entry(edge.src).or_insert(0) += 1;
        }

        let mut pending: Vec<(StageId, PinRef)> = Vec::new();
        for node in self.graph.live_nodes() {
            if node.kind.exempt_from_discard() {
                continue;
            }
            for pin in 0..node.outputs.len() {
                let pin_ref = PinRef { node: node.id, pin };
                if !consumed.contains_key(&pin_ref) {
                    pending.push((node.stage, pin_ref));
                }
            }
        }

        let mut discards: HashMap<u32, NodeId> = HashMap::new();
        for (stage, src) in pending {
            let discard = *discards.entry(stage.0).or_insert_with(|| {
                self.graph
                    .add_node(NodeKind::Discard, stage, Bundle::new(), Bundle::new(), None)
            });
            let pin = self.graph.node_mut(discard).inputs.push(Pin::unnamed());
            self.graph.connect(
                src,
                PinRef {
                    node: discard,
                    pin,
                },
                None,
            );
        }
    }
}

fn lower_binary_op(op: BinaryOp) -> BinOp {
    match op {
        BinaryOp::Mul => BinOp::Mul,
        BinaryOp::Div => BinOp::Div,
        BinaryOp::Rem => BinOp::Rem,
        BinaryOp::Add => BinOp::Add,
        BinaryOp::Sub => BinOp::Sub,
        BinaryOp::Shl => BinOp::Shl,
        BinaryOp::Shr => BinOp::Shr,
        BinaryOp::Lt => BinOp::Lt,
        BinaryOp::Le => BinOp::Le,
        BinaryOp::Gt => BinOp::Gt,
        BinaryOp::Ge => BinOp::Ge,
        BinaryOp::Eq => BinOp::Eq,
        BinaryOp::Ne => BinOp::Ne,
        // Logical and/or exist at parse level only; they lower to the
        // bitwise kinds (no short-circuit).
        BinaryOp::BitAnd | BinaryOp::And => BinOp::BitAnd,
        BinaryOp::BitOr | BinaryOp::Or => BinOp::BitOr,
        BinaryOp::BitXor => BinOp::BitXor,
    }
}

/// Extract a plain (unsuffixed or suffix-integer) integer literal.
fn int_literal(expr: &Expr) -> Option<i128> {
    match &expr.kind {
        ExprKind::Number(NumLit {
            value: NumValue::Int(v),
            suffix: None | Some(NumSuffix::I32) | Some(NumSuffix::I64),
        }) => Some(*v),
        _ => None,
    }
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;
    use crate::resolve::resolve;

    const HEADER: &str = "program t;\nexternal { sr: 48000, block_size: 64, \
                          inputs: [ { name: a, width: 1 }, { name: b, width: 1 } ], \
                          outputs: [ { name: o, width: 1 } ], \
                          properties: [ { name: gain, type: f32 } ] }\n";

    fn build_src(source: &str) -> BuildResult {
        let registry = Registry::new();
        let parsed = parse(source);
        assert!(
            parsed.errors.is_empty() && parsed.lex_errors.is_empty(),
            "parse failed: {:?}",
            parsed.errors
        );
        let program = parsed.program.unwrap();
        let resolved = resolve(&program, &registry);
        assert!(
            !crate::diag::has_errors(&resolved.diagnostics),
            "resolve failed: {:?}",
            resolved.diagnostics
        );
        build_graph(&program, &resolved.resolved, &registry)
    }

    fn build_ok(source: &str) -> Graph {
        let result = build_src(source);
        assert!(
            !crate::diag::has_errors(&result.diagnostics),
            "build failed: {:?}",
            result.diagnostics
        );
        result.graph
    }

    fn count_kind(graph: &Graph, pred: impl Fn(&NodeKind) -> bool) -> usize {
        graph.live_nodes().filter(|n| pred(&n.kind)).count()
    }

    #[test]
    fn pointwise_mix() {
        let graph = build_ok(&format!("{HEADER}stage main() {{ a + b -> o; }}"));
        assert_eq!(
            count_kind(&graph, |k| matches!(k, NodeKind::ReadInput { .. })),
            2
        );
        assert_eq!(
            count_kind(&graph, |k| matches!(
                k,
                NodeKind::Bin { op: BinOp::Add }
            )),
            1
        );
        assert_eq!(
            count_kind(&graph, |k| matches!(k, NodeKind::WriteOutput { .. })),
            1
        );
        assert_eq!(graph.edges.len(), 3);
        // Nothing is left unconsumed, so no discard sink exists.
        assert_eq!(count_kind(&graph, |k| matches!(k, NodeKind::Discard)), 0);
    }

    #[test]
    fn repeated_input_reads_are_memoized() {
        let graph = build_ok(&format!("{HEADER}stage main() {{ a * a -> o; }}"));
        assert_eq!(
            count_kind(&graph, |k| matches!(k, NodeKind::ReadInput { .. })),
            1
        );
        // Fan-out: two edges leave the same output pin.
        let read = graph
            .live_nodes()
            .find(|n| matches!(n.kind, NodeKind::ReadInput { .. }))
            .unwrap();
        assert_eq!(graph.edges_from_node(read.id).count(), 2);
    }

    #[test]
    fn indexed_port_access() {
        let graph = build_ok(&format!("{HEADER}stage main() {{ input[1] -> output[0]; }}"));
        let read = graph
            .live_nodes()
            .find(|n| matches!(n.kind, NodeKind::ReadInput { index: 1 }))
            .unwrap();
        assert_eq!(graph.edges_from_node(read.id).count(), 1);
    }

    #[test]
    fn out_of_range_port_index() {
        let result = build_src(&format!("{HEADER}stage main() {{ input[7] -> o; }}"));
        assert!(crate::diag::has_errors(&result.diagnostics));
    }

    #[test]
    fn named_and_indexed_port_share_a_node() {
        let graph = build_ok(&format!("{HEADER}stage main() {{ a + input[0] -> o; }}"));
        assert_eq!(
            count_kind(&graph, |k| matches!(k, NodeKind::ReadInput { .. })),
            1
        );
    }

    #[test]
    fn let_binding_gives_fanout_cse() {
        let graph = build_ok(&format!(
            "{HEADER}stage main() {{ let s = a + b; s * s -> o; }}"
        ));
        // One add node, referenced twice.
        assert_eq!(
            count_kind(&graph, |k| matches!(
                k,
                NodeKind::Bin { op: BinOp::Add }
            )),
            1
        );
    }

    #[test]
    fn cell_back_edge_allows_topo_order() {
        let graph = build_ok(&format!(
            "{HEADER}stage main() {{ cell (prev, nxt): f32(1); \
             nxt <- (a * 0.1f32) + (prev * 0.9f32); prev -> o; }}"
        ));
        assert_eq!(count_kind(&graph, |k| matches!(k, NodeKind::Cell { .. })), 1);
        let order = graph.topo_order().expect("back-edge through cell is excluded");
        assert_eq!(order.len(), graph.live_nodes().count());
    }

    #[test]
    fn plain_cycle_fails_topo_order() {
        let graph = build_ok(&format!(
            "{HEADER}stage main() {{ let x = sin; let y = sin(x); y -> x; a -> o; }}"
        ));
        assert!(graph.topo_order().is_err());
    }

    #[test]
    fn route_chain() {
        let graph = build_ok(&format!("{HEADER}stage main() {{ a -> f32 -> o; }}"));
        let cast = graph
            .live_nodes()
            .find(|n| matches!(n.kind, NodeKind::Cast { .. }))
            .unwrap();
        assert_eq!(graph.edges_into_node(cast.id).count(), 1);
        assert_eq!(graph.edges_from_node(cast.id).count(), 1);
    }

    #[test]
    fn fan_in_keeps_parallel_edges() {
        let graph = build_ok(&format!("{HEADER}stage main() {{ a -> o; b -> o; }}"));
        let sink = graph
            .live_nodes()
            .find(|n| matches!(n.kind, NodeKind::WriteOutput { .. }))
            .unwrap();
        assert_eq!(graph.edges_into_node(sink.id).count(), 2);
    }

    #[test]
    fn stacking_routes_through_merge() {
        let graph = build_ok(&format!(
            "{HEADER}stage main() {{ buffer wide(4): f32(2); a, b -> delwrite(wide, merge(a, b)); }}"
        ));
        // One merge from the explicit call, one from the stacking.
        assert_eq!(count_kind(&graph, |k| matches!(k, NodeKind::Merge)), 2);
    }

    #[test]
    fn bundle_routes_by_name_and_position() {
        let graph = build_ok(&format!(
            "{HEADER}stage main() {{ {{ a, frequency: 440.0f32, q: 0.7f32 }} -> biquad.lowpass -> o; }}"
        ));
        let biquad = graph
            .live_nodes()
            .find(|n| matches!(n.kind, NodeKind::Biquad { .. }))
            .unwrap();
        assert_eq!(graph.edges_into_node(biquad.id).count(), 3);
        let pins: Vec<usize> = graph
            .edges_into_node(biquad.id)
            .map(|e| e.dst.pin)
            .collect();
        assert!(pins.contains(&0) && pins.contains(&1) && pins.contains(&2));
    }

    #[test]
    fn bundle_unknown_pin_rejected() {
        let result = build_src(&format!(
            "{HEADER}stage main() {{ {{ a, cutoff: 440.0f32 }} -> biquad.lowpass -> o; }}"
        ));
        assert!(result
            .diagnostics
            .iter()
            .any(|d| d.message.contains("no pin named 'cutoff'")));
    }

    #[test]
    fn delay_line_wiring() {
        let graph = build_ok(&format!(
            "{HEADER}stage main() {{ buffer buf(128): f32(1); \
             delwrite(buf, a); delread(buf, 64) -> o; }}"
        ));
        assert_eq!(graph.buffers.len(), 1);
        assert_eq!(
            count_kind(&graph, |k| matches!(k, NodeKind::DelayWrite { .. })),
            1
        );
        assert_eq!(
            count_kind(&graph, |k| matches!(k, NodeKind::DelayRead { .. })),
            1
        );
        assert_eq!(
            count_kind(&graph, |k| matches!(k, NodeKind::BufferCap { .. })),
            1
        );
        // No structural edge links write to read; the pairing is by id.
        let write = graph
            .live_nodes()
            .find(|n| matches!(n.kind, NodeKind::DelayWrite { .. }))
            .unwrap();
        assert_eq!(graph.edges_from_node(write.id).count(), 0);
    }

    #[test]
    fn delread_on_non_buffer_rejected() {
        let result = build_src(&format!(
            "{HEADER}stage main() {{ let x = a + b; delread(x, 1) -> o; }}"
        ));
        assert!(result
            .diagnostics
            .iter()
            .any(|d| d.message.contains("declared buffer")));
    }

    #[test]
    fn split_produces_indexed_outputs() {
        let graph = build_ok(&format!(
            "{HEADER}stage main() {{ buffer wide(4): f32(3); \
             let parts = split(delread(wide, 1), 1, 2); parts[0] -> o; \
             parts[1] -> truncate -> o; }}"
        ));
        let split = graph
            .live_nodes()
            .find(|n| matches!(n.kind, NodeKind::Split { .. }))
            .unwrap();
        assert_eq!(split.outputs.len(), 2);
        let NodeKind::Split { widths } = &split.kind else {
            unreachable!()
        };
        assert_eq!(widths, &vec![1, 2]);
    }

    #[test]
    fn split_width_must_be_literal() {
        let result = build_src(&format!(
            "{HEADER}stage main() {{ split(a, gain) -> o; }}"
        ));
        assert!(result
            .diagnostics
            .iter()
            .any(|d| d.message.contains("positive integer literals")));
    }

    #[test]
    fn unconsumed_output_feeds_discard() {
        let graph = build_ok(&format!("{HEADER}stage main() {{ sin(a); b -> o; }}"));
        assert_eq!(count_kind(&graph, |k| matches!(k, NodeKind::Discard)), 1);
        let discard = graph
            .live_nodes()
            .find(|n| matches!(n.kind, NodeKind::Discard))
            .unwrap();
        assert_eq!(graph.edges_into_node(discard.id).count(), 1);
    }

    #[test]
    fn stage_output_assignment_and_cross_stage_read() {
        let graph = build_ok(&format!(
            "{HEADER}stage front(mix = f32(1)) {{ mix = a + b; }} \
             stage back() {{ front.outputs.mix -> o; }}"
        ));
        let stage_out = graph
            .live_nodes()
            .find(|n| matches!(n.kind, NodeKind::StageOutput { .. }))
            .unwrap();
        assert_eq!(graph.edges_into_node(stage_out.id).count(), 1);
        assert_eq!(graph.edges_from_node(stage_out.id).count(), 1);
        // The cross-stage edge lands in stage 'back'.
        let out_edge = graph.edges_from_node(stage_out.id).next().unwrap();
        let consumer = graph.node(out_edge.dst.node);
        assert_eq!(graph.stages[consumer.stage.0 as usize].name, "back");
    }

    #[test]
    fn undeclared_stage_output_read_rejected() {
        let result = build_src(&format!(
            "{HEADER}stage front(mix = f32(1)) {{ mix = a; }} \
             stage back() {{ front.outputs.wet -> o; }}"
        ));
        assert!(result
            .diagnostics
            .iter()
            .any(|d| d.message.contains("does not declare an output 'wet'")));
    }

    #[test]
    fn cell_zero_delay_rejected() {
        let result = build_src(&format!(
            "{HEADER}stage main() {{ cell(0) (x, y): f32(1); y <- a; x -> o; }}"
        ));
        assert!(result
            .diagnostics
            .iter()
            .any(|d| d.message.contains("cell delay must be at least 1")));
    }

    #[test]
    fn math_constant_becomes_literal() {
        let graph = build_ok(&format!("{HEADER}stage main() {{ a * f32(pi) -> o; }}"));
        let lit = graph
            .live_nodes()
            .find(|n| matches!(n.kind, NodeKind::Literal { .. }))
            .unwrap();
        let NodeKind::Literal {
            value: LitValue::Typed(Constant::F64(v)),
        } = &lit.kind
        else {
            panic!("expected typed f64 literal");
        };
        assert_eq!(v[0], std::f64::consts::PI);
    }

    #[test]
    fn buffer_capacity_lowered_to_carrier() {
        let graph = build_ok(&format!(
            "{HEADER}stage main() {{ buffer buf(2 * 64): f32(1); \
             delwrite(buf, a); delread(buf, 3) -> o; }}"
        ));
        let cap = graph
            .live_nodes()
            .find(|n| matches!(n.kind, NodeKind::BufferCap { .. }))
            .unwrap();
        assert_eq!(graph.edges_into_node(cap.id).count(), 1);
        // Capacity is unknown until folding.
        assert_eq!(graph.buffers[0].capacity, None);
    }
}
