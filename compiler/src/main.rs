use clap::Parser;
use std::path::PathBuf;

use wavec::diag::{DiagLevel, Diagnostic};
use wavec::pass::PassId;
use wavec::pipeline::{self, CompilationState};

#[derive(Debug, Clone, clap::ValueEnum)]
enum EmitStage {
    /// Serialized IR document (the backend contract).
    Ir,
    /// Parsed AST, debug-printed.
    Ast,
    /// Built graph summary.
    Graph,
    /// Graphviz DOT of the built graph.
    Dot,
}

#[derive(Parser, Debug)]
#[command(
    name = "wavec",
    version,
    about = "Waveling compiler — compiles .wave audio graph definitions to a validated graph IR"
)]
struct Cli {
    /// Input .wave source file
    source: PathBuf,

    /// Output file path (stdout if omitted)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Output stage
    #[arg(long, value_enum, default_value_t = EmitStage::Ir)]
    emit: EmitStage,

    /// Print compiler phases and timing
    #[arg(long)]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();

    let source = match std::fs::read_to_string(&cli.source) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("wavec: cannot read {}: {}", cli.source.display(), e);
            std::process::exit(2);
        }
    };

    if cli.verbose {
        eprintln!("wavec: source = {}", cli.source.display());
        eprintln!("wavec: emit   = {:?}", cli.emit);
    }

    // ── Parse ──
    let parsed = wavec::parser::parse(&source);
    let parse_diags = pipeline::parse_diagnostics(&parsed);
    for diag in &parse_diags {
        eprintln!("{}", render(&source, diag));
    }
    let Some(program) = parsed.program else {
        std::process::exit(1);
    };
    if parse_diags.iter().any(|d| d.level == DiagLevel::Error) {
        std::process::exit(1);
    }

    if matches!(cli.emit, EmitStage::Ast) {
        write_out(&cli.output, format!("{program:#?}\n"));
        return;
    }

    // ── Compile ──
    let registry = wavec::registry::Registry::new();
    let provenance = pipeline::compute_provenance(&source, &registry);
    let mut state = CompilationState::new(program, registry);
    state.provenance = Some(provenance);

    let terminal = match cli.emit {
        EmitStage::Ir => PassId::Emit,
        EmitStage::Graph | EmitStage::Dot => PassId::BuildGraph,
        EmitStage::Ast => unreachable!("handled above"),
    };

    let source_for_render = source.clone();
    let _ = pipeline::run_pipeline(&mut state, terminal, cli.verbose, |_, diags| {
        for diag in diags {
            eprintln!("{}", render(&source_for_render, diag));
        }
    });

    if state.has_error {
        std::process::exit(1);
    }

    let rendered = match cli.emit {
        EmitStage::Ir => {
            let ir = state.ir.as_ref().expect("pipeline completed");
            let mut json = ir.to_json();
            json.push('\n');
            json
        }
        EmitStage::Graph => format!("{}", state.graph.as_ref().expect("pipeline completed")),
        EmitStage::Dot => wavec::dot::emit_dot(state.graph.as_ref().expect("pipeline completed")),
        EmitStage::Ast => unreachable!("handled above"),
    };
    write_out(&cli.output, rendered);
}

fn write_out(output: &Option<PathBuf>, content: String) {
    match output {
        Some(path) => {
            if let Err(e) = std::fs::write(path, content) {
                eprintln!("wavec: cannot write {}: {}", path.display(), e);
                std::process::exit(2);
            }
        }
        None => print!("{content}"),
    }
}

/// Render a diagnostic with 1-based line:column resolved from the span.
fn render(source: &str, diag: &Diagnostic) -> String {
    let (line, col) = line_col(source, diag.span.start);
    let mut out = format!("{line}:{col}: {diag}");
    for related in &diag.related_spans {
        let (line, col) = line_col(source, related.span.start);
        out.push_str(&format!("\n  {line}:{col}: {}", related.label));
    }
    out
}

fn line_col(source: &str, offset: usize) -> (usize, usize) {
    let offset = offset.min(source.len());
    let mut line = 1;
    let mut col = 1;
    for c in source[..offset].chars() {
        if c == '\n' {
            line += 1;
            col = 1;
        } else {
            col += 1;
        }
    }
    (line, col)
}
