// dot.rs — Graphviz DOT output for Waveling graphs
//
// Transforms a built (optionally inferred/folded) graph into DOT format
// suitable for rendering with `dot`, `neato`, or other Graphviz layout
// engines. One cluster per stage; back-edges into recursion cells render
// dashed; delay-buffer pairings render as dashed virtual edges.
//
// Preconditions: `graph` is a constructed Graph.
// Postconditions: returns a valid DOT string representing the graph.
// Failure modes: none (pure string formatting).
// Side effects: none.

use std::fmt::Write;

use crate::graph::{Graph, NodeKind};

/// Emit the graph as a Graphviz DOT string.
pub fn emit_dot(graph: &Graph) -> String {
    let mut buf = String::new();
    writeln!(buf, "digraph waveling {{").unwrap();
    writeln!(buf, "    rankdir=LR;").unwrap();
    writeln!(buf, "    node [fontname=\"Helvetica\", fontsize=10];").unwrap();
    writeln!(buf, "    edge [fontname=\"Helvetica\", fontsize=9];").unwrap();

    for stage in &graph.stages {
        let sanitized = sanitize(&stage.name);
        writeln!(buf).unwrap();
        writeln!(buf, "    subgraph cluster_{sanitized} {{").unwrap();
        writeln!(buf, "        label=\"stage: {}\";", stage.name).unwrap();
        writeln!(buf, "        style=rounded;").unwrap();
        writeln!(buf, "        color=gray50;").unwrap();
        for node in graph.live_nodes().filter(|n| n.stage == stage.id) {
            let label = node_label(graph, &node.kind);
            let shape = match node.kind {
                NodeKind::Cell { .. } => "box3d",
                NodeKind::DelayRead { .. } | NodeKind::DelayWrite { .. } => "cylinder",
                NodeKind::Literal { .. } => "plaintext",
                _ => "box",
            };
            writeln!(
                buf,
                "        n{} [label=\"{}\", shape={}];",
                node.id.0, label, shape
            )
            .unwrap();
        }
        writeln!(buf, "    }}").unwrap();
    }

    writeln!(buf).unwrap();
    for edge in &graph.edges {
        let back_edge = matches!(graph.node(edge.dst.node).kind, NodeKind::Cell { .. });
        let attrs = if back_edge {
            " [style=dashed, color=red]"
        } else {
            ""
        };
        writeln!(
            buf,
            "    n{} -> n{}{};",
            edge.src.node.0, edge.dst.node.0, attrs
        )
        .unwrap();
    }

    // Virtual write→read pairings per buffer.
    let mut pairings = Vec::new();
    for writer in graph.live_nodes() {
        let NodeKind::DelayWrite { buffer } = writer.kind else {
            continue;
        };
        for reader in graph.live_nodes() {
            if matches!(reader.kind, NodeKind::DelayRead { buffer: b } if b == buffer) {
                pairings.push((writer.id, reader.id, buffer));
            }
        }
    }
    if !pairings.is_empty() {
        writeln!(buf).unwrap();
        writeln!(buf, "    // Delay-buffer pairings").unwrap();
        for (writer, reader, buffer) in pairings {
            writeln!(
                buf,
                "    n{} -> n{} [label=\"{}\", style=dashed, color=blue];",
                writer.0, reader.0, graph.buffers[buffer.0 as usize].name
            )
            .unwrap();
        }
    }

    writeln!(buf, "}}").unwrap();
    buf
}

// ── Helpers ─────────────────────────────────────────────────────────────────

/// Sanitize a name to valid DOT identifier characters.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn node_label(graph: &Graph, kind: &NodeKind) -> String {
    match kind {
        NodeKind::Literal { value } => format!("{value:?}")
            .replace('"', "'")
            .chars()
            .take(24)
            .collect(),
        NodeKind::ReadInput { index } => format!("input[{index}]"),
        NodeKind::ReadProperty { index } => format!("property[{index}]"),
        NodeKind::WriteOutput { index } => format!("output[{index}]"),
        NodeKind::StageOutput { index, .. } => format!("stage_out[{index}]"),
        NodeKind::DelayRead { buffer } => {
            format!("delread {}", graph.buffers[buffer.0 as usize].name)
        }
        NodeKind::DelayWrite { buffer } => {
            format!("delwrite {}", graph.buffers[buffer.0 as usize].name)
        }
        NodeKind::Cell { delay, .. } => format!("cell(z-{delay})"),
        other => crate::emit::kind_name(other).to_string(),
    }
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::build_graph;
    use crate::parser::parse;
    use crate::registry::Registry;
    use crate::resolve::resolve;

    fn dot_of(source: &str) -> String {
        let registry = Registry::new();
        let parsed = parse(source);
        let program = parsed.program.expect("parse failed");
        let resolved = resolve(&program, &registry);
        let built = build_graph(&program, &resolved.resolved, &registry);
        emit_dot(&built.graph)
    }

    const HEADER: &str = "program t;\nexternal { sr: 48000, block_size: 64, \
                          inputs: [ { name: a, width: 1 } ], \
                          outputs: [ { name: o, width: 1 } ], properties: [] }\n";

    #[test]
    fn wraps_in_digraph() {
        let dot = dot_of(&format!("{HEADER}stage main() {{ a -> o; }}"));
        assert!(dot.starts_with("digraph waveling {"));
        assert!(dot.trim_end().ends_with('}'));
    }

    #[test]
    fn one_cluster_per_stage() {
        let dot = dot_of(&format!(
            "{HEADER}stage front(mix = f32(1)) {{ mix = a; }} stage back() {{ \
             front.outputs.mix -> o; }}"
        ));
        assert!(dot.contains("subgraph cluster_front"));
        assert!(dot.contains("subgraph cluster_back"));
    }

    #[test]
    fn cell_back_edge_is_dashed() {
        let dot = dot_of(&format!(
            "{HEADER}stage main() {{ cell (prev, nxt): f32(1); nxt <- a; prev -> o; }}"
        ));
        assert!(dot.contains("style=dashed, color=red"));
    }

    #[test]
    fn buffer_pairing_is_virtual() {
        let dot = dot_of(&format!(
            "{HEADER}stage main() {{ buffer buf(8): f32(1); \
             delwrite(buf, a); delread(buf, 2) -> o; }}"
        ));
        assert!(dot.contains("Delay-buffer pairings"));
        assert!(dot.contains("label=\"buf\""));
    }
}
