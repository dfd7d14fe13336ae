// pass.rs — Pass descriptor module: metadata, dependency resolution, artifact IDs
//
// Declares the compiler's 6 semantic passes (parse is outside the runner),
// their dependency edges, and the artifacts they produce. Used by the
// pipeline runner to compute minimal pass subsets for each --emit target.

use std::collections::HashSet;

// ── Pass and Artifact identifiers ──────────────────────────────────────────

/// Identifies each compiler pass (parse excluded — handled before the runner).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassId {
    Resolve,
    BuildGraph,
    Infer,
    Validate,
    Fold,
    Emit,
}

/// Machine-readable artifact identifiers. Each maps to a concrete field of
/// the compilation state. Infer, Validate, and Fold operate on the graph
/// in place, so they share the Graph artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactId {
    Resolved, // ResolvedProgram
    Graph,    // Graph (mutated in place by Infer and Fold)
    Ir,       // IrDoc
}

// ── Pass descriptor ────────────────────────────────────────────────────────

/// Static metadata about a compiler pass.
pub struct PassDescriptor {
    /// Human-readable name for diagnostics/verbose output.
    pub name: &'static str,
    /// Pass dependencies (other passes whose outputs this pass consumes).
    pub inputs: &'static [PassId],
    /// Artifacts this pass produces or mutates.
    pub outputs: &'static [ArtifactId],
    /// Invariant the pass establishes, documentation only.
    pub invariants: &'static str,
}

/// Return the static descriptor for a given pass.
pub fn descriptor(id: PassId) -> PassDescriptor {
    match id {
        PassId::Resolve => PassDescriptor {
            name: "resolve",
            inputs: &[],
            outputs: &[ArtifactId::Resolved],
            invariants: "external normalized, every path head bound to a declaration",
        },
        PassId::BuildGraph => PassDescriptor {
            name: "build_graph",
            inputs: &[PassId::Resolve],
            outputs: &[ArtifactId::Graph],
            invariants: "every routing statement lowered to edges, discards attached",
        },
        PassId::Infer => PassDescriptor {
            name: "infer",
            inputs: &[PassId::BuildGraph],
            outputs: &[ArtifactId::Graph],
            invariants: "every pin shaped and rated, adapters inserted, fan-in explicit",
        },
        PassId::Validate => PassDescriptor {
            name: "validate",
            inputs: &[PassId::Infer],
            outputs: &[],
            invariants: "required pins connected, only cell/buffer back-edges remain",
        },
        PassId::Fold => PassDescriptor {
            name: "fold",
            inputs: &[PassId::Validate],
            outputs: &[ArtifactId::Graph],
            invariants: "no constant-rate foldable node remains, capacities finalized",
        },
        PassId::Emit => PassDescriptor {
            name: "emit",
            inputs: &[PassId::Fold],
            outputs: &[ArtifactId::Ir],
            invariants: "IR document serialized with dense node ids",
        },
    }
}

// ── Dependency resolution ──────────────────────────────────────────────────

/// All 6 pass IDs in declaration order (used for iteration).
pub const ALL_PASSES: [PassId; 6] = [
    PassId::Resolve,
    PassId::BuildGraph,
    PassId::Infer,
    PassId::Validate,
    PassId::Fold,
    PassId::Emit,
];

/// Compute the minimal ordered set of passes needed to produce `terminal`.
/// Returns passes in topological (execution) order.
pub fn required_passes(terminal: PassId) -> Vec<PassId> {
    let mut visited = HashSet::new();
    let mut order = Vec::new();
    visit(terminal, &mut visited, &mut order);
    order
}

fn visit(id: PassId, visited: &mut HashSet<PassId>, order: &mut Vec<PassId>) {
    if !visited.insert(id) {
        return;
    }
    for &dep in descriptor(id).inputs {
        visit(dep, visited, order);
    }
    order.push(id);
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_passes_build_graph_is_prefix() {
        let passes = required_passes(PassId::BuildGraph);
        assert_eq!(passes, vec![PassId::Resolve, PassId::BuildGraph]);
        assert!(!passes.contains(&PassId::Infer));
    }

    #[test]
    fn required_passes_emit_includes_all() {
        let passes = required_passes(PassId::Emit);
        assert_eq!(passes.len(), 6);
        assert_eq!(passes, ALL_PASSES.to_vec());
    }

    #[test]
    fn required_passes_resolve_is_minimal() {
        let passes = required_passes(PassId::Resolve);
        assert_eq!(passes, vec![PassId::Resolve]);
    }

    #[test]
    fn no_parse_in_pass_id() {
        // Parse is handled outside the runner; PassId has no Parse variant.
        for pass in &ALL_PASSES {
            assert_ne!(descriptor(*pass).name, "parse");
        }
    }

    #[test]
    fn dependency_edges_are_consistent() {
        for pass in &ALL_PASSES {
            let desc = descriptor(*pass);
            for dep in desc.inputs {
                let dep_passes = required_passes(*pass);
                let dep_pos = dep_passes.iter().position(|p| p == dep);
                let self_pos = dep_passes.iter().position(|p| p == pass);
                assert!(
                    dep_pos.unwrap() < self_pos.unwrap(),
                    "{:?} depends on {:?} but it comes later in topological order",
                    pass,
                    dep
                );
            }
        }
    }
}
